//! Login stream tracking.
//!
//! The watchlist owns the login stream: it logs in when the channel comes
//! up, mirrors login responses to caller stream 1, and only asks for the
//! source directory once the login is open.

use feedwatch_codec::{LoginAttribs, Msg, MsgKey, Payload, RequestMsg};
use feedwatch_core::{DomainType, State, StreamState, LOGIN_STREAM_ID};
use tracing::{debug, info, warn};

use crate::config::WatchlistConfig;
use crate::directory;
use crate::post;
use crate::recovery;
use crate::state::WatchlistState;

pub const LOGIN_CLOSED_TEXT: &str = "Login stream was closed.";

#[derive(Debug, Clone, Default)]
pub struct LoginState {
    pub open: bool,
    /// Attributes echoed by the provider's last login refresh.
    pub attribs: Option<LoginAttribs>,
    pub state: Option<State>,
    requested: LoginAttribs,
}

impl LoginState {
    pub fn new(config: &WatchlistConfig) -> Self {
        Self {
            open: false,
            attribs: None,
            state: None,
            requested: LoginAttribs {
                user_name: Some(config.user_name.clone()),
                application_id: Some(config.application_id.clone()),
                single_open: Some(config.single_open_default),
                allow_suspect_data: Some(config.allow_suspect_data_default),
            },
        }
    }

    /// Whether the watchlist recovers streams on the caller's behalf.
    pub fn single_open(&self, config: &WatchlistConfig) -> bool {
        self.attribs
            .as_ref()
            .and_then(|attribs| attribs.single_open)
            .unwrap_or(config.single_open_default)
    }

    /// Whether suspect data may be delivered instead of closing streams.
    pub fn allow_suspect_data(&self, config: &WatchlistConfig) -> bool {
        self.attribs
            .as_ref()
            .and_then(|attribs| attribs.allow_suspect_data)
            .unwrap_or(config.allow_suspect_data_default)
    }

    pub fn request(&self) -> RequestMsg {
        let mut request = RequestMsg::new(
            LOGIN_STREAM_ID,
            DomainType::LOGIN,
            MsgKey::named(self.requested.user_name.clone().unwrap_or_default()),
        )
        .streaming();
        request.payload = Payload::Login(self.requested.clone());
        request
    }
}

/// Queues the login request for a freshly connected channel.
pub fn on_channel_up(state: &mut WatchlistState) {
    let request = state.login.request();
    info!(user = ?request.key.name, "sending login request");
    state.outbound.push(Msg::Request(request));
    state.stats.requests_sent += 1;
}

/// Routes one provider message on the login stream.
pub fn handle_login_msg(state: &mut WatchlistState, msg: Msg) {
    match msg {
        Msg::Refresh(refresh) => {
            if let Payload::Login(attribs) = &refresh.payload {
                state.login.attribs = Some(attribs.clone());
            }
            let stream_state = refresh.state.stream_state;
            state.login.state = Some(refresh.state.clone());
            let was_open = state.login.open;
            state.login.open = stream_state == StreamState::Open;
            state.emit(Msg::Refresh(refresh), None);

            if state.login.open && !was_open {
                info!(
                    single_open = state.single_open(),
                    "login accepted, requesting directory"
                );
                directory::request_directory(state);
            } else if stream_state.is_terminal() {
                login_closed(state);
            }
        }
        Msg::Status(status) => {
            let terminal = status
                .state
                .as_ref()
                .is_some_and(|s| s.stream_state.is_terminal());
            if let Some(login_state) = &status.state {
                state.login.state = Some(login_state.clone());
            }
            state.emit(Msg::Status(status), None);
            if terminal {
                login_closed(state);
            }
        }
        Msg::Ack(ack) => post::on_ack(state, LOGIN_STREAM_ID, ack),
        msg @ (Msg::Update(_) | Msg::Generic(_)) => state.emit(msg, None),
        other => debug!(class = ?other.class(), "ignoring message on login stream"),
    }
}

fn login_closed(state: &mut WatchlistState) {
    warn!("login stream closed by provider");
    state.login.open = false;
    recovery::close_all(state, LOGIN_CLOSED_TEXT);
}
