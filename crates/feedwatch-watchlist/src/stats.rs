/// Coarse watchlist counters for ops and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchlistStats {
    /// Inbound provider payloads polled from the transport.
    pub inbound_messages: usize,
    /// Inbound payloads that failed to decode.
    pub decode_errors: usize,
    /// Provider messages for streams the watchlist no longer tracks.
    pub unknown_stream_messages: usize,
    /// Request messages written to the provider.
    pub requests_sent: usize,
    /// Close messages written to the provider.
    pub closes_sent: usize,
    /// Post and generic messages written to the provider.
    pub posts_sent: usize,
    /// Outbound sends the transport refused.
    pub send_errors: usize,
    /// Events queued for callers.
    pub events_delivered: usize,
    /// Requests that hit the request timeout.
    pub request_timeouts: usize,
    /// Posts that hit the ack timeout.
    pub post_timeouts: usize,
    /// Connection losses handled by the recovery manager.
    pub recoveries: usize,
    /// Submits rejected with a usage error.
    pub rejected_submits: usize,
}
