//! View merge: unions member views into the superset put on the wire.

use feedwatch_codec::View;

use crate::error::SubmitError;
use crate::state::{AggregateId, WatchlistState};

/// Normalizes a caller view; an empty view means "all fields".
pub fn normalize_view(view: Option<&View>) -> Option<View> {
    view.filter(|v| !v.is_empty()).map(View::normalized)
}

/// Sorted, duplicate-free union of `views`.
///
/// Any viewless contributor (or no contributors at all) makes the result
/// viewless. Mixing field-id and element-name views is rejected.
pub fn merge_views<'a, I>(views: I) -> Result<Option<View>, SubmitError>
where
    I: IntoIterator<Item = Option<&'a View>>,
{
    let mut merged: Option<View> = None;
    let mut viewless = false;
    for view in views {
        match view {
            None => viewless = true,
            Some(view) => {
                merged = Some(match merged.take() {
                    None => view.clone(),
                    Some(acc) => union(acc, view)?,
                });
            }
        }
    }
    if viewless {
        return Ok(None);
    }
    Ok(merged.map(|view| view.normalized()))
}

fn union(acc: View, next: &View) -> Result<View, SubmitError> {
    match (acc, next) {
        (View::FieldIds(mut ids), View::FieldIds(more)) => {
            ids.extend_from_slice(more);
            Ok(View::FieldIds(ids))
        }
        (View::ElementNames(mut names), View::ElementNames(more)) => {
            names.extend(more.iter().cloned());
            Ok(View::ElementNames(names))
        }
        _ => Err(SubmitError::ViewTypeMismatch),
    }
}

/// Whether `view` may join an aggregate whose members carry `existing`.
pub fn check_view_kind<'a, I>(existing: I, view: Option<&View>) -> Result<(), SubmitError>
where
    I: IntoIterator<Item = Option<&'a View>>,
{
    let Some(view) = view else {
        return Ok(());
    };
    if existing
        .into_iter()
        .flatten()
        .any(|other| !other.same_kind(view))
    {
        return Err(SubmitError::ViewTypeMismatch);
    }
    Ok(())
}

/// Merged view for an aggregate: streaming members only, or every member
/// when none is streaming.
pub fn aggregate_view(state: &WatchlistState, aggregate: AggregateId) -> Option<View> {
    let Some(agg) = state.aggregates.get(&aggregate) else {
        return None;
    };
    let members: Vec<_> = agg
        .members
        .iter()
        .filter_map(|stream_id| state.requests.get(stream_id))
        .collect();
    let any_streaming = members.iter().any(|request| request.streaming);
    let contributors = members
        .iter()
        .filter(|request| request.streaming || !any_streaming)
        .map(|request| request.view.as_ref());
    // members are kind-checked on join, so a mismatch cannot occur here
    merge_views(contributors).unwrap_or(None)
}
