use feedwatch_codec::{
    decode_msg_cbor, encode_msg_cbor, AckMsg, CodecError, LoginAttribs, MapAction, Msg, Payload,
    RefreshMsg, RequestMsg, ServiceEntry, ServiceInfo, ServiceLoad, ServiceStatus, StatusMsg,
    SymbolEntry, UpdateMsg,
};
use feedwatch_core::{
    DomainType, GroupId, Qos, ServiceId, State, StreamId, DIRECTORY_STREAM_ID, FILTER_ALL,
    LOGIN_STREAM_ID,
};
use feedwatch_transport::InMemoryAdapter;
use tracing::debug;

/// Provider side of a simulated connection.
///
/// Answers the login and directory handshake on its own; item traffic is
/// answered explicitly by the test or script driving it.
#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    pub services: Vec<ServiceEntry>,
    /// `single_open` echoed in the login refresh; `None` leaves it unset.
    pub single_open: Option<bool>,
    pub auto_handshake: bool,
    /// Every message received from the consumer, in arrival order.
    pub received: Vec<Msg>,
    pending: Vec<Msg>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            single_open: None,
            auto_handshake: true,
            received: Vec::new(),
            pending: Vec::new(),
        }
    }
}

impl ScriptedProvider {
    /// Provider advertising one service that is up and accepting requests.
    pub fn with_service(service_id: ServiceId, name: &str) -> Self {
        let mut provider = Self::default();
        provider.add_service(service_id, name);
        provider
    }

    pub fn add_service(&mut self, service_id: ServiceId, name: &str) {
        self.services.push(service_entry(service_id, name));
    }

    /// Advertises an open window for a service already added.
    pub fn set_open_window(&mut self, service_id: ServiceId, open_window: u32) {
        if let Some(entry) = self
            .services
            .iter_mut()
            .find(|entry| entry.service_id == service_id)
        {
            entry.load = Some(ServiceLoad {
                open_window: Some(open_window),
                ..ServiceLoad::default()
            });
        }
    }

    /// Decodes consumer traffic and queues handshake answers.
    pub fn ingest(&mut self, frames: Vec<Vec<u8>>) -> Result<usize, CodecError> {
        let count = frames.len();
        for frame in frames {
            let msg = decode_msg_cbor(&frame)?;
            debug!(stream_id = msg.stream_id(), class = ?msg.class(), "provider received");
            if self.auto_handshake {
                if let Msg::Request(request) = &msg {
                    self.answer_handshake(request);
                }
            }
            self.received.push(msg);
        }
        Ok(count)
    }

    fn answer_handshake(&mut self, request: &RequestMsg) {
        match request.stream_id {
            LOGIN_STREAM_ID => {
                let mut refresh =
                    RefreshMsg::new(LOGIN_STREAM_ID, DomainType::LOGIN, State::open_ok());
                refresh.key = Some(request.key.clone());
                refresh.payload = Payload::Login(LoginAttribs {
                    user_name: request.key.name.clone(),
                    single_open: self.single_open,
                    ..LoginAttribs::default()
                });
                self.pending.push(Msg::Refresh(refresh));
            }
            DIRECTORY_STREAM_ID if !request.no_refresh => {
                let filter = request.key.filter.unwrap_or(FILTER_ALL);
                let entries = self
                    .services
                    .iter()
                    .map(|entry| entry.filtered(filter))
                    .collect();
                let mut refresh =
                    RefreshMsg::new(DIRECTORY_STREAM_ID, DomainType::SOURCE, State::open_ok());
                refresh.key = Some(request.key.clone());
                refresh.payload = Payload::Directory(entries);
                self.pending.push(Msg::Refresh(refresh));
            }
            _ => {}
        }
    }

    /// Queues a message for the consumer.
    pub fn send(&mut self, msg: Msg) {
        self.pending.push(msg);
    }

    /// Encodes queued messages into the consumer's inbound queue.
    pub fn deliver(&mut self, consumer: &mut InMemoryAdapter) -> Result<usize, CodecError> {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for msg in pending {
            consumer.enqueue_inbound(encode_msg_cbor(&msg)?);
        }
        Ok(count)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn take_received(&mut self) -> Vec<Msg> {
        std::mem::take(&mut self.received)
    }

    /// Item requests received so far (login and directory excluded).
    pub fn item_requests(&self) -> Vec<&RequestMsg> {
        self.received
            .iter()
            .filter_map(|msg| match msg {
                Msg::Request(request) if request.stream_id > DIRECTORY_STREAM_ID => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Latest item request received for `name`.
    pub fn last_request_for(&self, name: &str) -> Option<&RequestMsg> {
        self.item_requests()
            .into_iter()
            .rev()
            .find(|request| request.key.name.as_deref() == Some(name))
    }

    /// Provider stream the consumer currently uses for `name`.
    pub fn stream_for(&self, name: &str) -> Option<StreamId> {
        self.last_request_for(name).map(|request| request.stream_id)
    }

    /// Queues a solicited, complete refresh for the latest request on `name`.
    pub fn refresh_item(&mut self, name: &str, state: State) -> Option<StreamId> {
        let request = self.last_request_for(name)?.clone();
        let mut refresh = RefreshMsg::new(request.stream_id, request.domain, state);
        refresh.key = Some(request.key.clone());
        refresh.qos = Some(request.qos.unwrap_or_else(Qos::default));
        self.send(Msg::Refresh(refresh));
        Some(request.stream_id)
    }

    /// Queues a refresh placing the item for `name` in `group`.
    pub fn refresh_item_in_group(&mut self, name: &str, group: GroupId) -> Option<StreamId> {
        let request = self.last_request_for(name)?.clone();
        let mut refresh = RefreshMsg::new(request.stream_id, request.domain, State::open_ok());
        refresh.key = Some(request.key.clone());
        refresh.group_id = Some(group);
        self.send(Msg::Refresh(refresh));
        Some(request.stream_id)
    }

    pub fn update_item(&mut self, name: &str, payload: Payload) -> Option<StreamId> {
        let stream_id = self.stream_for(name)?;
        let domain = self.last_request_for(name)?.domain;
        self.send(Msg::Update(UpdateMsg::new(stream_id, domain, payload)));
        Some(stream_id)
    }

    pub fn status_item(&mut self, name: &str, state: State) -> Option<StreamId> {
        let stream_id = self.stream_for(name)?;
        let domain = self.last_request_for(name)?.domain;
        self.send(Msg::Status(StatusMsg::new(stream_id, domain, state)));
        Some(stream_id)
    }

    /// Queues a symbol-list refresh naming `symbols`.
    pub fn refresh_symbol_list(&mut self, name: &str, symbols: &[&str]) -> Option<StreamId> {
        let request = self.last_request_for(name)?.clone();
        let mut refresh = RefreshMsg::new(request.stream_id, DomainType::SYMBOL_LIST, State::open_ok());
        refresh.payload = Payload::SymbolMap(
            symbols.iter().map(|symbol| SymbolEntry::add(*symbol)).collect(),
        );
        self.send(Msg::Refresh(refresh));
        Some(request.stream_id)
    }

    /// Acks every post received with an ack request, in order.
    pub fn ack_posts(&mut self) -> usize {
        let acks: Vec<AckMsg> = self
            .received
            .iter()
            .filter_map(|msg| match msg {
                Msg::Post(post) if post.ack_requested => post
                    .post_id
                    .map(|id| AckMsg::new(post.stream_id, post.domain, id)),
                _ => None,
            })
            .collect();
        let count = acks.len();
        for ack in acks {
            self.send(Msg::Ack(ack));
        }
        count
    }

    /// Queues a directory update for one service.
    pub fn update_service(&mut self, entry: ServiceEntry) {
        if entry.action == MapAction::Delete {
            self.services.retain(|known| known.service_id != entry.service_id);
        }
        let update = UpdateMsg::new(
            DIRECTORY_STREAM_ID,
            DomainType::SOURCE,
            Payload::Directory(vec![entry]),
        );
        self.send(Msg::Update(update));
    }
}

fn service_entry(service_id: ServiceId, name: &str) -> ServiceEntry {
    let mut entry = ServiceEntry::new(service_id, MapAction::Add);
    entry.info = Some(ServiceInfo {
        name: name.to_string(),
        vendor: Some("feedwatch-sim".to_string()),
        capabilities: vec![
            DomainType::MARKET_PRICE,
            DomainType::MARKET_BY_ORDER,
            DomainType::SYMBOL_LIST,
            DomainType::DICTIONARY,
        ],
        qos: vec![Qos::default()],
        supports_qos_range: false,
    });
    entry.state = Some(ServiceStatus::up());
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedwatch_codec::MsgKey;

    #[test]
    fn handshake_is_answered_automatically() {
        let mut provider = ScriptedProvider::with_service(1, "DIRECT_FEED");
        let login = RequestMsg::new(LOGIN_STREAM_ID, DomainType::LOGIN, MsgKey::named("user"))
            .streaming();
        let directory = RequestMsg::new(
            DIRECTORY_STREAM_ID,
            DomainType::SOURCE,
            MsgKey::default().with_filter(FILTER_ALL),
        )
        .streaming();
        let frames = vec![
            encode_msg_cbor(&Msg::Request(login)).expect("encode"),
            encode_msg_cbor(&Msg::Request(directory)).expect("encode"),
        ];
        assert_eq!(provider.ingest(frames).expect("ingest"), 2);

        let mut consumer = InMemoryAdapter::connected();
        assert_eq!(provider.deliver(&mut consumer).expect("deliver"), 2);
        assert!(!provider.has_pending());
    }
}
