use duplex_core::{Addr, ChannelId, CoreError, ErrorCode};
use duplex_crypto::CryptoError;
use duplex_storage::{StorageError, TxError};

/// Failures reported by a [`crate::Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(Addr),

    #[error("stream to {peer} failed: {reason}")]
    Io { peer: Addr, reason: String },

    #[error("transport closed")]
    Closed,
}

/// Engine-level errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("peer {0} has no message queue")]
    PeerNotConnected(Addr),

    #[error("peer {0} already has message queues")]
    PeerAlreadyAdded(Addr),

    #[error("no message queue for channel {0}")]
    QueueNotFound(ChannelId),

    #[error("message queue for channel {0} already exists")]
    QueueExists(ChannelId),

    #[error("message {seq} of channel {cid} not found")]
    MessageNotFound { cid: ChannelId, seq: u64 },

    #[error("cannot resend seq {seq} of channel {cid}: already acked up to {acked}")]
    StaleResend { cid: ChannelId, seq: u64, acked: u64 },

    #[error("corrupted sequence numbers for channel {cid}: acked {acked} > used {used}")]
    CorruptedSeqNums { cid: ChannelId, acked: u64, used: u64 },

    #[error("{0}")]
    Protocol(String),
}

impl EngineError {
    /// The wire error code reported to a peer for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Core(CoreError::InvalidSeqNum) => ErrorCode::InvalidSeqNum,
            Self::Core(CoreError::PayRouteLoop) => ErrorCode::PayRouteLoop,
            Self::Core(CoreError::NoEnoughBalance { .. }) => ErrorCode::NotEnoughBalance,
            Self::Core(CoreError::RouteNotFound) => ErrorCode::NoRouteToDst,
            Self::PeerNotConnected(_) | Self::Transport(TransportError::NotConnected(_)) => {
                ErrorCode::PeerNotOnline
            }
            _ => ErrorCode::Misc,
        }
    }

    /// Whether this is the given protocol outcome.
    pub fn is_core(&self, err: &CoreError) -> bool {
        matches!(self, Self::Core(e) if e == err)
    }
}

impl TxError for EngineError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Storage(StorageError::Conflict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            EngineError::from(CoreError::InvalidSeqNum).error_code(),
            ErrorCode::InvalidSeqNum
        );
        assert_eq!(
            EngineError::from(CoreError::PayRouteLoop).error_code(),
            ErrorCode::PayRouteLoop
        );
        assert_eq!(
            EngineError::from(CoreError::NoEnoughBalance { needed: 5, free: 1 }).error_code(),
            ErrorCode::NotEnoughBalance
        );
        assert_eq!(
            EngineError::from(CoreError::RouteNotFound).error_code(),
            ErrorCode::NoRouteToDst
        );
        assert_eq!(
            EngineError::PeerNotConnected(Addr::ZERO).error_code(),
            ErrorCode::PeerNotOnline
        );
        assert_eq!(
            EngineError::from(CoreError::InvalidSig).error_code(),
            ErrorCode::Misc
        );
    }

    #[test]
    fn test_conflict_detection() {
        assert!(EngineError::from(StorageError::Conflict).is_conflict());
        assert!(!EngineError::from(StorageError::RetriesExhausted(3)).is_conflict());
        assert!(!EngineError::from(CoreError::InvalidSig).is_conflict());
    }
}
