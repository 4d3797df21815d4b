//! Declarative consumer/provider scenarios, loadable from TOML.

use feedwatch_codec::{MsgKey, Payload, RequestMsg, View};
use feedwatch_core::{DataState, DomainType, ServiceId, State, StreamId, StreamState};
use feedwatch_transport::ChannelEvent;
use feedwatch_watchlist::SubmitOptions;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::harness::{HarnessError, SimHarness};
use crate::provider::ScriptedProvider;

fn default_service() -> String {
    "DIRECT_FEED".to_string()
}

fn default_service_id() -> ServiceId {
    1
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptStep {
    Open {
        stream: StreamId,
        name: String,
        #[serde(default = "yes")]
        streaming: bool,
        #[serde(default)]
        view: Vec<i32>,
        #[serde(default)]
        priority_count: Option<u16>,
    },
    Batch {
        stream: StreamId,
        names: Vec<String>,
    },
    Close {
        stream: StreamId,
    },
    Refresh {
        name: String,
        #[serde(default)]
        text: String,
    },
    Update {
        name: String,
    },
    Status {
        name: String,
        #[serde(default)]
        closed: bool,
        #[serde(default)]
        text: String,
    },
    ChannelDown,
    ChannelUp,
    Advance {
        ms: u64,
    },
}

/// A scenario: the provider's service plus the steps to play against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_service_id")]
    pub service_id: ServiceId,
    #[serde(default)]
    pub open_window: Option<u32>,
    #[serde(default)]
    pub single_open: Option<bool>,
    #[serde(default)]
    pub steps: Vec<ScriptStep>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            service: default_service(),
            service_id: default_service_id(),
            open_window: None,
            single_open: None,
            steps: Vec::new(),
        }
    }
}

impl Script {
    /// Provider matching this script's service settings.
    pub fn provider(&self) -> ScriptedProvider {
        let mut provider = ScriptedProvider::with_service(self.service_id, &self.service);
        if let Some(open_window) = self.open_window {
            provider.set_open_window(self.service_id, open_window);
        }
        provider.single_open = self.single_open;
        provider
    }
}

/// Plays every step of `script` against `harness`.
pub fn run_script(harness: &mut SimHarness, script: &Script) -> Result<(), HarnessError> {
    let options = SubmitOptions::service(script.service.clone());
    for (index, step) in script.steps.iter().enumerate() {
        info!(step = index, ?step, "running script step");
        match step {
            ScriptStep::Open {
                stream,
                name,
                streaming,
                view,
                priority_count,
            } => {
                let mut request =
                    RequestMsg::new(*stream, DomainType::MARKET_PRICE, MsgKey::named(name.clone()));
                request.streaming = *streaming;
                if !view.is_empty() {
                    request = request.with_view(View::FieldIds(view.clone()));
                }
                if let Some(count) = priority_count {
                    request = request.with_priority(1, *count);
                }
                harness.submit(request, options.clone())?;
            }
            ScriptStep::Batch { stream, names } => {
                let request =
                    RequestMsg::new(*stream, DomainType::MARKET_PRICE, MsgKey::default())
                        .streaming()
                        .with_batch(names.iter().cloned());
                harness.submit(request, options.clone())?;
            }
            ScriptStep::Close { stream } => harness.close(*stream)?,
            ScriptStep::Refresh { name, text } => {
                harness
                    .provider
                    .refresh_item(name, State::new(StreamState::Open, DataState::Ok, text.clone()));
                harness.pump()?;
            }
            ScriptStep::Update { name } => {
                harness.provider.update_item(name, Payload::None);
                harness.pump()?;
            }
            ScriptStep::Status { name, closed, text } => {
                let state = if *closed {
                    State::closed(text.clone())
                } else {
                    State::open_suspect(text.clone())
                };
                harness.provider.status_item(name, state);
                harness.pump()?;
            }
            ScriptStep::ChannelDown => harness.channel_event(ChannelEvent::Down)?,
            ScriptStep::ChannelUp => harness.channel_event(ChannelEvent::Up)?,
            ScriptStep::Advance { ms } => {
                harness.advance(*ms)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedwatch_watchlist::WatchlistConfig;

    #[test]
    fn two_opens_of_one_item_share_a_provider_stream() {
        let script = Script {
            steps: vec![
                ScriptStep::Open {
                    stream: 5,
                    name: "TRI.N".into(),
                    streaming: true,
                    view: Vec::new(),
                    priority_count: None,
                },
                ScriptStep::Open {
                    stream: 6,
                    name: "TRI.N".into(),
                    streaming: true,
                    view: Vec::new(),
                    priority_count: None,
                },
                ScriptStep::Refresh {
                    name: "TRI.N".into(),
                    text: String::new(),
                },
            ],
            ..Script::default()
        };
        let mut harness = SimHarness::connected(WatchlistConfig::default(), script.provider())
            .expect("connect");
        run_script(&mut harness, &script).expect("script");

        let streams: Vec<StreamId> = harness
            .provider
            .item_requests()
            .iter()
            .map(|request| request.stream_id)
            .collect();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0], streams[1]);
        assert_eq!(
            harness.stream_states(),
            vec![(5, StreamState::Open), (6, StreamState::Open)]
        );
    }
}
