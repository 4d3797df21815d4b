//! Symbol-list cascading: opens an item stream per symbol named by a symbol
//! list that asked for data streams or snapshots.

use std::collections::HashMap;

use feedwatch_codec::{MapAction, MsgKey, RequestMsg, SymbolEntry, SymbolListBehavior};
use feedwatch_core::{DomainType, Qos, StreamId};
use tracing::{debug, warn};

use crate::item;
use crate::state::{RequestOrigin, ServiceRef, SubmitOptions, UserTag, WatchlistState};

#[derive(Debug, Clone)]
pub struct SymbolListSubscription {
    pub parent: StreamId,
    pub behavior: SymbolListBehavior,
    pub parent_streaming: bool,
    /// Child caller stream per symbol.
    pub children: HashMap<String, StreamId>,
}

/// Starts cascading for a symbol-list request. Names-only lists are not
/// tracked.
pub fn register(
    state: &mut WatchlistState,
    parent: StreamId,
    behavior: SymbolListBehavior,
    parent_streaming: bool,
) {
    if behavior == SymbolListBehavior::NamesOnly {
        return;
    }
    state.symbol_lists.insert(
        parent,
        SymbolListSubscription {
            parent,
            behavior,
            parent_streaming,
            children: HashMap::new(),
        },
    );
}

struct ParentBinding {
    service: ServiceRef,
    qos: Option<Qos>,
    tag: Option<UserTag>,
}

/// Opens a child item stream for every added symbol not already open.
/// Deletions leave existing children alone.
pub fn cascade(state: &mut WatchlistState, parent: StreamId, entries: &[SymbolEntry]) {
    let Some(subscription) = state.symbol_lists.get(&parent) else {
        return;
    };
    let Some(binding) = state.requests.get(&parent).map(|request| ParentBinding {
        service: request.service.clone(),
        qos: request.qos,
        tag: request.tag,
    }) else {
        return;
    };
    let behavior = subscription.behavior;
    let parent_streaming = subscription.parent_streaming;
    let wanted: Vec<String> = entries
        .iter()
        .filter(|entry| entry.action != MapAction::Delete)
        .filter(|entry| {
            subscription
                .children
                .get(&entry.symbol)
                .map_or(true, |child| !state.requests.contains_key(child))
        })
        .map(|entry| entry.symbol.clone())
        .collect();

    for symbol in wanted {
        let child = state.allocate_cascade_stream();
        let mut key = MsgKey::named(symbol.clone());
        let mut options = SubmitOptions {
            service_name: None,
            tag: binding.tag,
        };
        match &binding.service {
            ServiceRef::Id(id) => key.service_id = Some(*id),
            ServiceRef::Name(name) => options.service_name = Some(name.clone()),
        }
        let mut request = RequestMsg::new(child, DomainType::MARKET_PRICE, key);
        request.streaming = behavior == SymbolListBehavior::DataStreams;
        request.qos = binding.qos;
        let origin = RequestOrigin::SymbolList {
            parent,
            parent_streaming,
        };
        match item::open_request(state, request, options, origin) {
            Ok(child) => {
                debug!(parent, child, %symbol, "opened symbol list child");
                if let Some(subscription) = state.symbol_lists.get_mut(&parent) {
                    subscription.children.insert(symbol, child);
                }
            }
            Err(err) => warn!(parent, %symbol, error = %err, "could not open symbol list child"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchlistConfig;

    #[test]
    fn names_only_lists_are_not_tracked() {
        let mut state = WatchlistState::new(WatchlistConfig::default());
        register(&mut state, 4, SymbolListBehavior::NamesOnly, true);
        assert!(state.symbol_lists.is_empty());
        register(&mut state, 5, SymbolListBehavior::DataStreams, true);
        assert!(state.symbol_lists.contains_key(&5));
    }

    #[test]
    fn cascade_without_parent_request_is_ignored() {
        let mut state = WatchlistState::new(WatchlistConfig::default());
        register(&mut state, 5, SymbolListBehavior::DataStreams, true);
        cascade(&mut state, 5, &[SymbolEntry::add("FB.O")]);
        assert!(state.requests.is_empty());
    }
}
