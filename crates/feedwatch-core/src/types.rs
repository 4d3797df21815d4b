use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Stream identifier on either the caller side or the provider side.
///
/// Caller-chosen ids are positive; ids the watchlist allocates for cascaded
/// symbol-list children are negative.
pub type StreamId = i32;
/// Provider-assigned numeric service identifier.
pub type ServiceId = u16;

/// Provider stream reserved for the watchlist's own login stream.
pub const LOGIN_STREAM_ID: StreamId = 1;
/// Provider stream reserved for the watchlist's own source directory stream.
pub const DIRECTORY_STREAM_ID: StreamId = 2;

/// Service directory filter: service name, capabilities and QoS.
pub const FILTER_INFO: u32 = 0x01;
/// Service directory filter: up/down and accepting-requests flags.
pub const FILTER_STATE: u32 = 0x02;
/// Service directory filter: item group status and merges.
pub const FILTER_GROUP: u32 = 0x04;
/// Service directory filter: open limit and open window.
pub const FILTER_LOAD: u32 = 0x08;
/// Service directory filter: broadcast service data.
pub const FILTER_DATA: u32 = 0x10;
/// Service directory filter: upstream link status.
pub const FILTER_LINK: u32 = 0x20;
/// Every directory filter bit currently defined.
pub const FILTER_ALL: u32 =
    FILTER_INFO | FILTER_STATE | FILTER_GROUP | FILTER_LOAD | FILTER_DATA | FILTER_LINK;

/// Message category a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainType(pub u8);

impl DomainType {
    pub const LOGIN: DomainType = DomainType(1);
    pub const SOURCE: DomainType = DomainType(4);
    pub const DICTIONARY: DomainType = DomainType(5);
    pub const MARKET_PRICE: DomainType = DomainType(6);
    pub const MARKET_BY_ORDER: DomainType = DomainType(7);
    pub const MARKET_BY_PRICE: DomainType = DomainType(8);
    pub const SYMBOL_LIST: DomainType = DomainType(10);

    /// Whether item streams of this domain are managed by the multiplexer.
    pub fn is_item_domain(self) -> bool {
        self != Self::LOGIN && self != Self::SOURCE
    }
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::LOGIN => f.write_str("login"),
            Self::SOURCE => f.write_str("source"),
            Self::DICTIONARY => f.write_str("dictionary"),
            Self::MARKET_PRICE => f.write_str("market-price"),
            Self::MARKET_BY_ORDER => f.write_str("market-by-order"),
            Self::MARKET_BY_PRICE => f.write_str("market-by-price"),
            Self::SYMBOL_LIST => f.write_str("symbol-list"),
            DomainType(other) => write!(f, "domain-{other}"),
        }
    }
}

impl FromStr for DomainType {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "login" => Ok(Self::LOGIN),
            "source" => Ok(Self::SOURCE),
            "dictionary" => Ok(Self::DICTIONARY),
            "market-price" => Ok(Self::MARKET_PRICE),
            "market-by-order" => Ok(Self::MARKET_BY_ORDER),
            "market-by-price" => Ok(Self::MARKET_BY_PRICE),
            "symbol-list" => Ok(Self::SYMBOL_LIST),
            other => other
                .strip_prefix("domain-")
                .and_then(|raw| raw.parse::<u8>().ok())
                .map(DomainType)
                .ok_or(FeedError::InvalidInput("unknown domain type")),
        }
    }
}

/// Stream lifecycle state carried by refresh and status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    Open,
    NonStreaming,
    ClosedRecover,
    Closed,
    Redirected,
}

impl StreamState {
    /// Whether the stream is finished once this state is delivered.
    pub fn is_terminal(self) -> bool {
        !matches!(self, StreamState::Open)
    }
}

/// Health of the data currently cached for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataState {
    NoChange,
    Ok,
    Suspect,
}

/// Coarse reason code attached to a [`State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StateCode {
    #[default]
    None,
    NotFound,
    Timeout,
    NotEntitled,
    UsageError,
    NoResources,
    UnsupportedViewType,
    FailoverStarted,
    FailoverCompleted,
}

/// Stream + data state pair with optional explanatory text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub stream_state: StreamState,
    pub data_state: DataState,
    pub code: StateCode,
    pub text: String,
}

impl State {
    pub fn new(stream_state: StreamState, data_state: DataState, text: impl Into<String>) -> Self {
        Self {
            stream_state,
            data_state,
            code: StateCode::None,
            text: text.into(),
        }
    }

    pub fn open_ok() -> Self {
        Self::new(StreamState::Open, DataState::Ok, "")
    }

    pub fn open_suspect(text: impl Into<String>) -> Self {
        Self::new(StreamState::Open, DataState::Suspect, text)
    }

    pub fn closed_recover(text: impl Into<String>) -> Self {
        Self::new(StreamState::ClosedRecover, DataState::Suspect, text)
    }

    pub fn closed(text: impl Into<String>) -> Self {
        Self::new(StreamState::Closed, DataState::Suspect, text)
    }

    pub fn with_code(mut self, code: StateCode) -> Self {
        self.code = code;
        self
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.stream_state, self.data_state)?;
        if !self.text.is_empty() {
            write!(f, " \"{}\"", self.text)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QosTimeliness {
    #[default]
    Realtime,
    DelayedUnknown,
    Delayed(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QosRate {
    #[default]
    TickByTick,
    JitConflated,
    TimeConflated(u16),
}

/// Quality of service requested for, or advertised by, a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Qos {
    pub timeliness: QosTimeliness,
    pub rate: QosRate,
    pub dynamic: bool,
}

/// Streaming priority: class plus accumulated count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Priority {
    pub class: u8,
    pub count: u16,
}

impl Default for Priority {
    fn default() -> Self {
        Self { class: 1, count: 1 }
    }
}

impl Priority {
    pub fn new(class: u8, count: u16) -> Self {
        Self { class, count }
    }

    /// Folds another streaming member's priority into this aggregate value:
    /// highest class wins, counts are summed.
    pub fn accumulate(self, other: Priority) -> Priority {
        Priority {
            class: self.class.max(other.class),
            count: self.count.saturating_add(other.count),
        }
    }
}

/// Provider-assigned opaque item group identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub Vec<u8>);

impl GroupId {
    pub fn from_u16(value: u16) -> Self {
        Self(value.to_be_bytes().to_vec())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_accumulates_max_class_and_summed_count() {
        let merged = Priority::new(1, 1)
            .accumulate(Priority::new(3, 2))
            .accumulate(Priority::new(2, 4));
        assert_eq!(merged, Priority::new(3, 7));
    }

    #[test]
    fn default_priority_and_qos() {
        assert_eq!(Priority::default(), Priority::new(1, 1));
        let qos = Qos::default();
        assert_eq!(qos.timeliness, QosTimeliness::Realtime);
        assert_eq!(qos.rate, QosRate::TickByTick);
    }

    #[test]
    fn group_id_displays_as_hex() {
        assert_eq!(GroupId::from_u16(0x0102).to_string(), "0102");
        assert_eq!(GroupId(vec![0xab]).to_string(), "ab");
    }

    #[test]
    fn only_open_is_non_terminal() {
        assert!(!StreamState::Open.is_terminal());
        assert!(StreamState::NonStreaming.is_terminal());
        assert!(StreamState::ClosedRecover.is_terminal());
        assert!(StreamState::Closed.is_terminal());
    }

    #[test]
    fn domain_display_and_item_domains() {
        assert_eq!(DomainType::MARKET_PRICE.to_string(), "market-price");
        assert_eq!(DomainType(200).to_string(), "domain-200");
        assert!(!DomainType::LOGIN.is_item_domain());
        assert!(!DomainType::SOURCE.is_item_domain());
        assert!(DomainType::SYMBOL_LIST.is_item_domain());
    }

    #[test]
    fn domain_parses_from_display_form() {
        for domain in [
            DomainType::LOGIN,
            DomainType::MARKET_PRICE,
            DomainType::SYMBOL_LIST,
            DomainType(42),
        ] {
            let parsed: DomainType = domain.to_string().parse().expect("parse domain");
            assert_eq!(parsed, domain);
        }
        assert!("quotes".parse::<DomainType>().is_err());
    }

    #[test]
    fn state_display_includes_text() {
        assert_eq!(
            State::open_suspect("Request timeout").to_string(),
            "Open/Suspect \"Request timeout\""
        );
        assert_eq!(State::open_ok().to_string(), "Open/Ok");
    }
}
