//! Post/ack correlation and generic messages on open streams.

use std::collections::HashMap;

use feedwatch_codec::{AckMsg, GenericMsg, Msg, NakCode, PostMsg};
use feedwatch_core::{StreamId, LOGIN_STREAM_ID};
use tracing::{debug, warn};

use crate::error::SubmitError;
use crate::item;
use crate::state::{AggregatePhase, WatchlistState};
use crate::timer::{TimerId, TimerKind};

pub const ACK_TIMEOUT_TEXT: &str = "Acknowledgement timed out.";

#[derive(Debug, Clone)]
pub struct PendingPost {
    pub caller_stream: StreamId,
    pub timer: TimerId,
}

/// Posts awaiting an ack, keyed by provider stream and post id.
#[derive(Debug, Default)]
pub struct PostTable {
    pub pending: HashMap<(StreamId, u32), PendingPost>,
}

impl PostTable {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Provider stream carrying caller stream `stream_id`, if it is on the wire.
fn live_provider_stream(state: &WatchlistState, stream_id: StreamId) -> Option<StreamId> {
    let aggregate = state.requests.get(&stream_id)?.aggregate?;
    let agg = state.aggregates.get(&aggregate)?;
    if agg.phase == AggregatePhase::Queued || agg.sent.is_none() {
        return None;
    }
    agg.provider_stream
}

/// Sends a post on an open item stream, or off-stream on the login stream.
pub fn submit_post(
    state: &mut WatchlistState,
    stream_id: StreamId,
    mut post: PostMsg,
) -> Result<(), SubmitError> {
    let provider_stream = if stream_id == LOGIN_STREAM_ID {
        if !state.login.open {
            return Err(SubmitError::OffStreamPostLoginNotOpen);
        }
        LOGIN_STREAM_ID
    } else {
        live_provider_stream(state, stream_id).ok_or(SubmitError::PostStreamNotOpen)?
    };

    if post.ack_requested {
        let post_id = post.post_id.ok_or(SubmitError::PostIdMissing)?;
        if state.posts.pending.contains_key(&(provider_stream, post_id)) {
            return Err(SubmitError::PostIdInUse);
        }
        if state.posts.len() >= state.config.max_outstanding_posts {
            return Err(SubmitError::TooManyOutstandingPosts);
        }
        let deadline = state.now_ms.saturating_add(state.config.post_ack_timeout_ms);
        let timer = state.timers.schedule(
            deadline,
            TimerKind::PostAck {
                provider_stream,
                post_id,
            },
        );
        state.posts.pending.insert(
            (provider_stream, post_id),
            PendingPost {
                caller_stream: stream_id,
                timer,
            },
        );
    }

    post.stream_id = provider_stream;
    state.outbound.push(Msg::Post(post));
    state.stats.posts_sent += 1;
    Ok(())
}

/// Sends a generic message on an open item stream.
pub fn submit_generic(
    state: &mut WatchlistState,
    stream_id: StreamId,
    mut msg: GenericMsg,
) -> Result<(), SubmitError> {
    let provider_stream =
        live_provider_stream(state, stream_id).ok_or(SubmitError::GenericStreamNotOpen)?;
    msg.stream_id = provider_stream;
    state.outbound.push(Msg::Generic(msg));
    Ok(())
}

/// Delivers a provider ack to the caller stream that posted.
pub fn on_ack(state: &mut WatchlistState, provider_stream: StreamId, ack: AckMsg) {
    let Some(pending) = state.posts.pending.remove(&(provider_stream, ack.ack_id)) else {
        debug!(provider_stream, ack_id = ack.ack_id, "ack for unknown post");
        state.stats.unknown_stream_messages += 1;
        return;
    };
    state.timers.cancel(pending.timer);
    let fallback = state
        .provider_streams
        .get(&provider_stream)
        .and_then(|aggregate| state.aggregates.get(aggregate))
        .and_then(|agg| agg.last_key.clone());
    item::deliver_copy(state, pending.caller_stream, &Msg::Ack(ack), fallback.as_ref());
}

/// Synthesizes a negative ack for a post whose ack never arrived.
pub fn on_timeout(state: &mut WatchlistState, provider_stream: StreamId, post_id: u32) {
    let Some(pending) = state.posts.pending.remove(&(provider_stream, post_id)) else {
        return;
    };
    warn!(provider_stream, post_id, "post ack timed out");
    state.stats.post_timeouts += 1;
    nak(state, pending.caller_stream, post_id, NakCode::NoResponse, ACK_TIMEOUT_TEXT);
}

fn nak(state: &mut WatchlistState, caller_stream: StreamId, post_id: u32, code: NakCode, text: &str) {
    let domain = state
        .requests
        .get(&caller_stream)
        .map(|request| request.domain)
        .unwrap_or(feedwatch_core::DomainType::LOGIN);
    let ack = AckMsg::new(caller_stream, domain, post_id).nak(code, text);
    item::deliver_copy(state, caller_stream, &Msg::Ack(ack), None);
}

/// Naks every outstanding post; used when the connection is lost.
pub fn fail_all(state: &mut WatchlistState, text: &str) {
    let mut pending: Vec<((StreamId, u32), PendingPost)> = state.posts.pending.drain().collect();
    pending.sort_by_key(|((provider_stream, post_id), _)| (*provider_stream, *post_id));
    for ((_, post_id), post) in pending {
        state.timers.cancel(post.timer);
        nak(state, post.caller_stream, post_id, NakCode::GatewayDown, text);
    }
}

/// Forgets posts made by a caller stream that is going away.
pub fn drop_stream_posts(state: &mut WatchlistState, caller_stream: StreamId) {
    let timers = &mut state.timers;
    state.posts.pending.retain(|_, post| {
        if post.caller_stream == caller_stream {
            timers.cancel(post.timer);
            false
        } else {
            true
        }
    });
}

/// Forgets posts made on a provider stream that is going away.
pub fn drop_provider_posts(state: &mut WatchlistState, provider_stream: StreamId) {
    let timers = &mut state.timers;
    state.posts.pending.retain(|(stream, _), post| {
        if *stream == provider_stream {
            timers.cancel(post.timer);
            false
        } else {
            true
        }
    });
}
