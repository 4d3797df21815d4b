//! Batch expansion: one batch request becomes one item request per name on
//! consecutive stream ids after the batch stream id.

use feedwatch_codec::{Msg, RequestMsg, StatusMsg};
use feedwatch_core::{DataState, State, StreamId, StreamState};
use tracing::debug;

use crate::error::SubmitError;
use crate::item;
use crate::state::{RequestOrigin, SubmitOptions, WatchlistState};

pub const BATCH_CLOSED_TEXT: &str = "Stream closed for batch";

/// Validates the whole batch, acknowledges the batch stream as closed, then
/// opens each item in array order. Nothing is opened if validation fails.
pub fn expand_batch(
    state: &mut WatchlistState,
    mut request: RequestMsg,
    options: SubmitOptions,
) -> Result<(), SubmitError> {
    let names = request.batch.take().unwrap_or_default();
    if request.key.name.is_some() {
        return Err(SubmitError::BatchWithKeyName);
    }
    if options.service_name.is_some() && request.key.service_id.is_some() {
        return Err(SubmitError::ServiceNameAndId);
    }
    if options.service_name.is_none() && request.key.service_id.is_none() {
        return Err(SubmitError::NoService);
    }
    if request.no_refresh {
        return Err(SubmitError::OpenWithoutRefresh);
    }
    let batch_stream = request.stream_id;
    let item_streams: Vec<StreamId> = (1..=names.len())
        .map(|offset| batch_stream.saturating_add(offset as StreamId))
        .collect();
    if item_streams.iter().any(|stream_id| {
        state.requests.contains_key(stream_id) || state.directory_consumers.contains_key(stream_id)
    }) {
        return Err(SubmitError::BatchStreamIdInUse);
    }

    let items: Vec<RequestMsg> = names
        .into_iter()
        .zip(item_streams)
        .map(|(name, stream_id)| {
            let mut item = request.clone();
            item.stream_id = stream_id;
            item.key.name = Some(name);
            item
        })
        .collect();
    for item in &items {
        item::check_open(state, item, &options)?;
    }

    debug!(batch_stream, items = items.len(), "expanding batch request");
    let closed = StatusMsg::new(
        batch_stream,
        request.domain,
        State::new(StreamState::Closed, DataState::Ok, BATCH_CLOSED_TEXT),
    );
    state.emit(Msg::Status(closed), options.tag);

    for item in items {
        item::open_request(state, item, options.clone(), RequestOrigin::Caller)?;
    }
    Ok(())
}
