use feedwatch_core::{DomainType, GroupId, Priority, Qos, ServiceId, State, StreamId};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::payload::{Payload, SymbolListBehavior};

/// Max accepted group id length on the wire.
pub const MAX_GROUP_ID_LEN: usize = 255;

/// Identity of the item a message refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgKey {
    pub name: Option<String>,
    pub service_id: Option<ServiceId>,
    /// Directory filter mask; only meaningful on source-domain keys.
    pub filter: Option<u32>,
    pub identifier: Option<i32>,
}

impl MsgKey {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_service(mut self, service_id: ServiceId) -> Self {
        self.service_id = Some(service_id);
        self
    }

    pub fn with_filter(mut self, filter: u32) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Caller-requested subset of fields or elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum View {
    FieldIds(Vec<i32>),
    ElementNames(Vec<String>),
}

impl View {
    pub fn len(&self) -> usize {
        match self {
            View::FieldIds(ids) => ids.len(),
            View::ElementNames(names) => names.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted, duplicate-free copy of this view.
    pub fn normalized(&self) -> View {
        match self {
            View::FieldIds(ids) => {
                let mut ids = ids.clone();
                ids.sort_unstable();
                ids.dedup();
                View::FieldIds(ids)
            }
            View::ElementNames(names) => {
                let mut names = names.clone();
                names.sort();
                names.dedup();
                View::ElementNames(names)
            }
        }
    }

    pub fn same_kind(&self, other: &View) -> bool {
        matches!(
            (self, other),
            (View::FieldIds(_), View::FieldIds(_)) | (View::ElementNames(_), View::ElementNames(_))
        )
    }
}

/// Request opening, reissuing, or (with `batch`) fanning out streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: MsgKey,
    pub qos: Option<Qos>,
    pub priority: Option<Priority>,
    pub streaming: bool,
    pub private: bool,
    pub pause: bool,
    pub no_refresh: bool,
    pub key_in_updates: bool,
    pub view: Option<View>,
    /// Item names carried by a batch request.
    pub batch: Option<Vec<String>>,
    pub symbol_list_behavior: Option<SymbolListBehavior>,
    pub payload: Payload,
}

impl RequestMsg {
    pub fn new(stream_id: StreamId, domain: DomainType, key: MsgKey) -> Self {
        Self {
            stream_id,
            domain,
            key,
            qos: None,
            priority: None,
            streaming: false,
            private: false,
            pause: false,
            no_refresh: false,
            key_in_updates: false,
            view: None,
            batch: None,
            symbol_list_behavior: None,
            payload: Payload::None,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn with_view(mut self, view: View) -> Self {
        self.view = Some(view);
        self
    }

    pub fn with_priority(mut self, class: u8, count: u16) -> Self {
        self.priority = Some(Priority::new(class, count));
        self
    }

    pub fn with_batch<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.batch = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: Option<MsgKey>,
    pub state: State,
    pub solicited: bool,
    pub complete: bool,
    pub clear_cache: bool,
    pub private: bool,
    pub qos: Option<Qos>,
    pub group_id: Option<GroupId>,
    pub seq_num: Option<u32>,
    pub part_num: u16,
    pub payload: Payload,
}

impl RefreshMsg {
    /// Complete solicited refresh carrying `state`.
    pub fn new(stream_id: StreamId, domain: DomainType, state: State) -> Self {
        Self {
            stream_id,
            domain,
            key: None,
            state,
            solicited: true,
            complete: true,
            clear_cache: true,
            private: false,
            qos: None,
            group_id: None,
            seq_num: None,
            part_num: 0,
            payload: Payload::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: Option<MsgKey>,
    pub seq_num: Option<u32>,
    pub payload: Payload,
}

impl UpdateMsg {
    pub fn new(stream_id: StreamId, domain: DomainType, payload: Payload) -> Self {
        Self {
            stream_id,
            domain,
            key: None,
            seq_num: None,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: Option<MsgKey>,
    pub state: Option<State>,
    pub group_id: Option<GroupId>,
}

impl StatusMsg {
    pub fn new(stream_id: StreamId, domain: DomainType, state: State) -> Self {
        Self {
            stream_id,
            domain,
            key: None,
            state: Some(state),
            group_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: Option<MsgKey>,
    pub complete: bool,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: Option<MsgKey>,
    pub post_id: Option<u32>,
    pub seq_num: Option<u32>,
    pub ack_requested: bool,
    pub complete: bool,
    pub payload: Payload,
}

impl PostMsg {
    pub fn new(stream_id: StreamId, domain: DomainType, payload: Payload) -> Self {
        Self {
            stream_id,
            domain,
            key: None,
            post_id: None,
            seq_num: None,
            ack_requested: false,
            complete: true,
            payload,
        }
    }

    pub fn with_ack(mut self, post_id: u32) -> Self {
        self.post_id = Some(post_id);
        self.ack_requested = true;
        self
    }
}

/// Negative acknowledgement reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NakCode {
    AccessDenied,
    DeniedBySource,
    SourceDown,
    SourceUnknown,
    NoResources,
    NoResponse,
    GatewayDown,
    SymbolUnknown,
    NotOpen,
    InvalidContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
    pub key: Option<MsgKey>,
    pub ack_id: u32,
    pub seq_num: Option<u32>,
    pub nak_code: Option<NakCode>,
    pub text: Option<String>,
}

impl AckMsg {
    pub fn new(stream_id: StreamId, domain: DomainType, ack_id: u32) -> Self {
        Self {
            stream_id,
            domain,
            key: None,
            ack_id,
            seq_num: None,
            nak_code: None,
            text: None,
        }
    }

    pub fn nak(mut self, code: NakCode, text: impl Into<String>) -> Self {
        self.nak_code = Some(code);
        self.text = Some(text.into());
        self
    }

    pub fn is_nak(&self) -> bool {
        self.nak_code.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseMsg {
    pub stream_id: StreamId,
    pub domain: DomainType,
}

/// Message class discriminant, handy for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgClass {
    Request,
    Refresh,
    Update,
    Status,
    Generic,
    Post,
    Ack,
    Close,
}

/// One typed message exchanged with a provider or delivered to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Msg {
    Request(RequestMsg),
    Refresh(RefreshMsg),
    Update(UpdateMsg),
    Status(StatusMsg),
    Generic(GenericMsg),
    Post(PostMsg),
    Ack(AckMsg),
    Close(CloseMsg),
}

impl Msg {
    pub fn class(&self) -> MsgClass {
        match self {
            Msg::Request(_) => MsgClass::Request,
            Msg::Refresh(_) => MsgClass::Refresh,
            Msg::Update(_) => MsgClass::Update,
            Msg::Status(_) => MsgClass::Status,
            Msg::Generic(_) => MsgClass::Generic,
            Msg::Post(_) => MsgClass::Post,
            Msg::Ack(_) => MsgClass::Ack,
            Msg::Close(_) => MsgClass::Close,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        match self {
            Msg::Request(m) => m.stream_id,
            Msg::Refresh(m) => m.stream_id,
            Msg::Update(m) => m.stream_id,
            Msg::Status(m) => m.stream_id,
            Msg::Generic(m) => m.stream_id,
            Msg::Post(m) => m.stream_id,
            Msg::Ack(m) => m.stream_id,
            Msg::Close(m) => m.stream_id,
        }
    }

    pub fn set_stream_id(&mut self, stream_id: StreamId) {
        match self {
            Msg::Request(m) => m.stream_id = stream_id,
            Msg::Refresh(m) => m.stream_id = stream_id,
            Msg::Update(m) => m.stream_id = stream_id,
            Msg::Status(m) => m.stream_id = stream_id,
            Msg::Generic(m) => m.stream_id = stream_id,
            Msg::Post(m) => m.stream_id = stream_id,
            Msg::Ack(m) => m.stream_id = stream_id,
            Msg::Close(m) => m.stream_id = stream_id,
        }
    }

    pub fn domain(&self) -> DomainType {
        match self {
            Msg::Request(m) => m.domain,
            Msg::Refresh(m) => m.domain,
            Msg::Update(m) => m.domain,
            Msg::Status(m) => m.domain,
            Msg::Generic(m) => m.domain,
            Msg::Post(m) => m.domain,
            Msg::Ack(m) => m.domain,
            Msg::Close(m) => m.domain,
        }
    }

    /// Optional key slot for response-class messages (refresh, update,
    /// status, generic, ack).
    pub fn response_key_mut(&mut self) -> Option<&mut Option<MsgKey>> {
        match self {
            Msg::Refresh(m) => Some(&mut m.key),
            Msg::Update(m) => Some(&mut m.key),
            Msg::Status(m) => Some(&mut m.key),
            Msg::Generic(m) => Some(&mut m.key),
            Msg::Ack(m) => Some(&mut m.key),
            _ => None,
        }
    }

    pub fn response_key(&self) -> Option<&MsgKey> {
        match self {
            Msg::Refresh(m) => m.key.as_ref(),
            Msg::Update(m) => m.key.as_ref(),
            Msg::Status(m) => m.key.as_ref(),
            Msg::Generic(m) => m.key.as_ref(),
            Msg::Ack(m) => m.key.as_ref(),
            _ => None,
        }
    }

    /// Validates wire-level invariants not captured by the type system.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.domain().0 == 0 {
            return Err(CodecError::InvalidMsg("domain type must be non-zero"));
        }
        match self {
            Msg::Refresh(RefreshMsg {
                group_id: Some(group),
                ..
            })
            | Msg::Status(StatusMsg {
                group_id: Some(group),
                ..
            }) if group.0.len() > MAX_GROUP_ID_LEN => {
                Err(CodecError::InvalidMsg("group id too long"))
            }
            Msg::Post(post) if post.ack_requested && post.post_id.is_none() => Err(
                CodecError::InvalidMsg("post requesting ack must carry a post id"),
            ),
            Msg::Request(request)
                if request.key.filter.is_some() && request.domain != DomainType::SOURCE =>
            {
                Err(CodecError::InvalidMsg(
                    "filter is only valid on source requests",
                ))
            }
            _ => Ok(()),
        }
    }
}
