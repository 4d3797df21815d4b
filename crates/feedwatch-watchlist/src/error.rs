use feedwatch_codec::CodecError;
use thiserror::Error;

/// Caller usage errors, rejected synchronously and never queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("Cannot submit request with both service name and service id specified.")]
    ServiceNameAndId,
    #[error("Item request contained no service name nor service ID.")]
    NoService,
    #[error("Requested batch has name in message key.")]
    BatchWithKeyName,
    #[error("Item in batch has same ID as existing stream.")]
    BatchStreamIdInUse,
    #[error("Cannot open request with negative stream ID.")]
    InvalidStreamId,
    #[error("Cannot open request without requesting refresh.")]
    OpenWithoutRefresh,
    #[error("Login stream is managed by the watchlist.")]
    ReservedStream,
    #[error("Domain type does not match existing request.")]
    DomainMismatch,
    #[error("Message key does not match existing request.")]
    KeyMismatch,
    #[error("Reissue requests may not alter streaming flag.")]
    StreamingFlagChanged,
    #[error("Request reissue may not alter private stream flag.")]
    PrivateFlagChanged,
    #[error("Request reissue may not contain batch flag.")]
    BatchReissue,
    #[error("ViewType mismatch, cannot be aggregated.")]
    ViewTypeMismatch,
    #[error("Cannot submit PostMsg when stream not in open state.")]
    PostStreamNotOpen,
    #[error("Off-stream post message submitted to login stream that is not established.")]
    OffStreamPostLoginNotOpen,
    #[error("Cannot submit GenericMsg when stream not in open state.")]
    GenericStreamNotOpen,
    #[error("Post message requests an ack but carries no post ID.")]
    PostIdMissing,
    #[error("Post ID already in use.")]
    PostIdInUse,
    #[error("Too many outstanding posts.")]
    TooManyOutstandingPosts,
    #[error("Channel is closed.")]
    ChannelClosed,
}

/// Errors surfaced by the watchlist runtime facade.
#[derive(Debug, Error)]
pub enum WatchlistError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::{SubmitError, WatchlistError};

    #[test]
    fn caller_facing_texts_are_verbatim() {
        assert_eq!(
            SubmitError::BatchStreamIdInUse.to_string(),
            "Item in batch has same ID as existing stream."
        );
        assert_eq!(
            SubmitError::ServiceNameAndId.to_string(),
            "Cannot submit request with both service name and service id specified."
        );
        assert_eq!(
            SubmitError::BatchWithKeyName.to_string(),
            "Requested batch has name in message key."
        );
    }

    #[test]
    fn submit_errors_pass_through_runtime_error() {
        let err = WatchlistError::from(SubmitError::PostStreamNotOpen);
        assert_eq!(
            err.to_string(),
            "Cannot submit PostMsg when stream not in open state."
        );
    }
}
