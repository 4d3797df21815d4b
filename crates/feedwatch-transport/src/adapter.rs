use std::collections::VecDeque;

/// Connection lifecycle change reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    /// Connection established (initially or after a reconnect).
    Up,
    /// Connection lost; the transport is attempting to reconnect.
    Down,
    /// Connection lost for good; no reconnect will follow.
    Closed,
}

/// One inbound item polled from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Channel(ChannelEvent),
    Data(Vec<u8>),
}

/// Coarse per-adapter transport health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHealthSnapshot {
    pub outbound_queued: u64,
    pub outbound_send_ok: u64,
    pub outbound_send_err: u64,
    pub inbound_received: u64,
    pub channel_events: u64,
    pub last_error: Option<String>,
}

/// Byte-oriented transport contract used by the watchlist runtime.
pub trait TransportAdapter {
    /// Transport-specific send error.
    type Error;

    /// Attempts delivery of one encoded message to the provider.
    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;
    /// Returns the next inbound payload or channel lifecycle event.
    fn recv(&mut self) -> Option<TransportEvent>;

    /// Whether outbound send is currently available.
    fn can_send(&self) -> bool {
        true
    }

    /// Best-effort transport health counters for ops decisions.
    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot::default()
    }
}

/// In-memory adapter for tests and simulations.
#[derive(Debug, Default, Clone)]
pub struct InMemoryAdapter {
    inbound: VecDeque<TransportEvent>,
    outbound: Vec<Vec<u8>>,
    connected: bool,
    drop_outbound: bool,
    send_ok: u64,
    send_err: u64,
    recv_ok: u64,
    channel_events: u64,
}

impl InMemoryAdapter {
    /// Creates an adapter that already reports a connected channel.
    pub fn connected() -> Self {
        let mut adapter = Self::default();
        adapter.enqueue_channel_event(ChannelEvent::Up);
        adapter
    }

    /// Queues bytes as inbound provider traffic.
    pub fn enqueue_inbound(&mut self, bytes: Vec<u8>) {
        self.inbound.push_back(TransportEvent::Data(bytes));
    }

    /// Queues a channel lifecycle change, ordered after any queued data.
    pub fn enqueue_channel_event(&mut self, event: ChannelEvent) {
        self.inbound.push_back(TransportEvent::Channel(event));
    }

    /// Drains and returns all outbound sends captured so far.
    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbound)
    }

    /// If enabled, outbound sends are dropped (loss simulation).
    pub fn set_drop_outbound(&mut self, drop_outbound: bool) {
        self.drop_outbound = drop_outbound;
    }
}

/// Moves all captured outbound messages from one in-memory adapter into
/// another adapter's inbound queue. Returns how many were moved.
pub fn route_in_memory_outbound(
    from_adapter: &mut InMemoryAdapter,
    to_adapter: &mut InMemoryAdapter,
) -> usize {
    let outbound = from_adapter.take_outbound();
    let moved = outbound.len();
    for bytes in outbound {
        to_adapter.enqueue_inbound(bytes);
    }
    moved
}

impl TransportAdapter for InMemoryAdapter {
    type Error = &'static str;

    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        if !self.connected {
            self.send_err += 1;
            return Err("channel not connected");
        }
        if self.drop_outbound {
            self.send_err += 1;
            return Ok(());
        }
        self.outbound.push(bytes.to_vec());
        self.send_ok += 1;
        Ok(())
    }

    fn recv(&mut self) -> Option<TransportEvent> {
        let event = self.inbound.pop_front()?;
        match &event {
            TransportEvent::Channel(channel) => {
                self.channel_events += 1;
                self.connected = matches!(channel, ChannelEvent::Up);
            }
            TransportEvent::Data(_) => self.recv_ok += 1,
        }
        Some(event)
    }

    fn can_send(&self) -> bool {
        self.connected
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot {
            outbound_queued: self.outbound.len() as u64,
            outbound_send_ok: self.send_ok,
            outbound_send_err: self.send_err,
            inbound_received: self.recv_ok,
            channel_events: self.channel_events,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        route_in_memory_outbound, ChannelEvent, InMemoryAdapter, TransportAdapter,
        TransportEvent, TransportHealthSnapshot,
    };

    #[test]
    fn in_memory_adapter_send_and_recv_work() {
        let mut adapter = InMemoryAdapter::connected();
        adapter.enqueue_inbound(vec![1, 2, 3]);

        assert_eq!(
            adapter.recv(),
            Some(TransportEvent::Channel(ChannelEvent::Up))
        );
        assert_eq!(adapter.recv(), Some(TransportEvent::Data(vec![1, 2, 3])));
        assert!(adapter.can_send());

        adapter.send(&[9, 8]).expect("send should succeed");
        assert_eq!(adapter.take_outbound(), vec![vec![9, 8]]);
        assert_eq!(
            adapter.health_snapshot(),
            TransportHealthSnapshot {
                outbound_queued: 0,
                outbound_send_ok: 1,
                outbound_send_err: 0,
                inbound_received: 1,
                channel_events: 1,
                last_error: None,
            }
        );
    }

    #[test]
    fn send_fails_while_channel_is_down() {
        let mut adapter = InMemoryAdapter::connected();
        adapter.enqueue_channel_event(ChannelEvent::Down);
        while adapter.recv().is_some() {}
        assert!(!adapter.can_send());
        assert!(adapter.send(&[1]).is_err());
        assert_eq!(adapter.health_snapshot().outbound_send_err, 1);
    }

    #[test]
    fn in_memory_adapter_can_simulate_lossy_outbound() {
        let mut adapter = InMemoryAdapter::connected();
        let _ = adapter.recv();
        adapter.set_drop_outbound(true);
        adapter
            .send(&[1, 2, 3])
            .expect("dropped send should still return ok");
        assert!(adapter.take_outbound().is_empty());
    }

    #[test]
    fn route_moves_outbound_into_peer_inbound() {
        let mut consumer = InMemoryAdapter::connected();
        let _ = consumer.recv();
        let mut provider = InMemoryAdapter::default();
        consumer.send(&[4]).expect("send");
        consumer.send(&[5]).expect("send");
        assert_eq!(route_in_memory_outbound(&mut consumer, &mut provider), 2);
        assert_eq!(provider.recv(), Some(TransportEvent::Data(vec![4])));
        assert_eq!(provider.recv(), Some(TransportEvent::Data(vec![5])));
        assert_eq!(provider.recv(), None);
    }
}
