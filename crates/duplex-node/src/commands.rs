//! Commands dispatched from the HTTP API to the node event loop.

use duplex_core::{Addr, Amount, ChannelId, CoreError, PayId};
use duplex_engine::EngineError;
use serde::Serialize;
use tokio::sync::oneshot;

pub type Reply<T> = oneshot::Sender<Result<T, CommandError>>;

/// A command sent from the HTTP API to the node's main event loop.
pub enum NodeCommand {
    /// Trust-open a channel with a peer.
    OpenChannel {
        peer: Addr,
        token: Addr,
        cid: ChannelId,
        my_deposit: Amount,
        peer_deposit: Amount,
        reply: Reply<()>,
    },
    SendDirectPay {
        dest: Addr,
        token: Addr,
        amount: Amount,
        reply: Reply<PayResponse>,
    },
    /// Lock a pay behind a fresh secret held by this node.
    SendConditionalPay {
        dest: Addr,
        token: Addr,
        amount: Amount,
        timeout: u64,
        reply: Reply<PayResponse>,
    },
    ConnectPeer {
        peer: Addr,
        endpoint: String,
        reply: Reply<()>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PayResponse {
    pub pay_id: PayId,
}

/// Why a command failed, split by who is at fault.
#[derive(Debug, Clone)]
pub enum CommandError {
    NotFound(String),
    Rejected(String),
    Internal(String),
}

impl From<EngineError> for CommandError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Core(
                CoreError::ChannelNotFound(_) | CoreError::PayNotFound(_) | CoreError::PeerNotFound,
            ) => CommandError::NotFound(e.to_string()),
            EngineError::Core(_) | EngineError::Transport(_) | EngineError::PeerNotConnected(_) => {
                CommandError::Rejected(e.to_string())
            }
            _ => CommandError::Internal(e.to_string()),
        }
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::NotFound(msg) | CommandError::Rejected(msg) | CommandError::Internal(msg) => {
                f.write_str(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_classification() {
        let missing = EngineError::Core(CoreError::ChannelNotFound(ChannelId([1; 32])));
        assert!(matches!(CommandError::from(missing), CommandError::NotFound(_)));

        let no_route = EngineError::Core(CoreError::RouteNotFound);
        assert!(matches!(CommandError::from(no_route), CommandError::Rejected(_)));

        let storage = EngineError::Storage(duplex_storage::StorageError::RetriesExhausted(10));
        assert!(matches!(CommandError::from(storage), CommandError::Internal(_)));
    }
}
