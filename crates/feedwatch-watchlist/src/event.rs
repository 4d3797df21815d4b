use feedwatch_codec::{GenericMsg, Msg, PostMsg, RequestMsg};
use feedwatch_core::StreamId;
use feedwatch_transport::ChannelEvent;

use crate::state::{SubmitOptions, UserTag};

/// One caller-visible event produced by the watchlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchlistEvent {
    /// Connection lifecycle change.
    Channel(ChannelEvent),
    /// A message addressed to one caller stream, already rewritten for it.
    Message { msg: Msg, tag: Option<UserTag> },
}

impl WatchlistEvent {
    /// Caller stream id the event is addressed to, if any.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            WatchlistEvent::Channel(_) => None,
            WatchlistEvent::Message { msg, .. } => Some(msg.stream_id()),
        }
    }

    pub fn msg(&self) -> Option<&Msg> {
        match self {
            WatchlistEvent::Channel(_) => None,
            WatchlistEvent::Message { msg, .. } => Some(msg),
        }
    }
}

/// Mutation requested by a callback while an event is being delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredAction {
    Submit {
        request: RequestMsg,
        options: SubmitOptions,
    },
    Close(StreamId),
    Post {
        stream_id: StreamId,
        post: PostMsg,
    },
    Generic {
        stream_id: StreamId,
        msg: GenericMsg,
    },
}

/// Queue handed to callbacks; drained after the current event's fan-out.
#[derive(Debug, Default)]
pub struct DeferredActions {
    actions: Vec<DeferredAction>,
}

impl DeferredActions {
    pub fn submit(&mut self, request: RequestMsg, options: SubmitOptions) {
        self.actions.push(DeferredAction::Submit { request, options });
    }

    pub fn close(&mut self, stream_id: StreamId) {
        self.actions.push(DeferredAction::Close(stream_id));
    }

    pub fn post(&mut self, stream_id: StreamId, post: PostMsg) {
        self.actions.push(DeferredAction::Post { stream_id, post });
    }

    pub fn generic(&mut self, stream_id: StreamId, msg: GenericMsg) {
        self.actions.push(DeferredAction::Generic { stream_id, msg });
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub(crate) fn take(&mut self) -> Vec<DeferredAction> {
        std::mem::take(&mut self.actions)
    }
}
