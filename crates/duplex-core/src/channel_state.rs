use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::dag::Dag;

/// Lifecycle state of a payment channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    /// Opened off-chain on trust; not yet backed on chain.
    TrustOpened,
    /// On-chain instantiation in progress.
    Instantiating,
    /// Fully opened and backed on chain.
    Opened,
    /// A settle intent has been submitted on chain.
    Settling,
    /// Settlement finalized. Final state.
    Closed,
}

impl ChannelState {
    /// Whether payment-protocol messages are accepted in this state.
    pub fn accepts_payments(&self) -> bool {
        matches!(self, Self::TrustOpened | Self::Instantiating | Self::Opened)
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrustOpened => "TRUST_OPENED",
            Self::Instantiating => "INSTANTIATING",
            Self::Opened => "OPENED",
            Self::Settling => "SETTLING",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The static channel transition table.
///
/// - TRUST_OPENED → INSTANTIATING | CLOSED
/// - INSTANTIATING → OPENED | CLOSED
/// - OPENED → SETTLING | CLOSED
/// - SETTLING → CLOSED
pub fn channel_dag() -> &'static Dag<ChannelState> {
    static DAG: OnceLock<Dag<ChannelState>> = OnceLock::new();
    DAG.get_or_init(|| {
        use ChannelState::*;
        Dag::new(vec![
            (TrustOpened, vec![Instantiating, Closed]),
            (Instantiating, vec![Opened, Closed]),
            (Opened, vec![Settling, Closed]),
            (Settling, vec![Closed]),
        ])
    })
}

/// Whether an externally observed change from `old` to `new` is consistent
/// with the channel lifecycle, allowing several steps at once.
pub fn is_chan_state_change_valid(old: ChannelState, new: ChannelState) -> bool {
    channel_dag().is_reachable(old, new)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ChannelState; 5] = [
        ChannelState::TrustOpened,
        ChannelState::Instantiating,
        ChannelState::Opened,
        ChannelState::Settling,
        ChannelState::Closed,
    ];

    #[test]
    fn test_opened_to_closed_is_valid() {
        assert!(is_chan_state_change_valid(ChannelState::Opened, ChannelState::Closed));
    }

    #[test]
    fn test_closed_to_opened_is_invalid() {
        assert!(!is_chan_state_change_valid(ChannelState::Closed, ChannelState::Opened));
    }

    #[test]
    fn test_self_change_is_valid() {
        for state in ALL {
            assert!(is_chan_state_change_valid(state, state), "{state}");
        }
    }

    #[test]
    fn test_multi_step_reachability() {
        assert!(is_chan_state_change_valid(
            ChannelState::TrustOpened,
            ChannelState::Settling
        ));
        assert!(!is_chan_state_change_valid(
            ChannelState::Settling,
            ChannelState::Opened
        ));
        assert!(!channel_dag().is_transition_valid(ChannelState::TrustOpened, ChannelState::Settling));
    }

    #[test]
    fn test_accepts_payments() {
        assert!(ChannelState::TrustOpened.accepts_payments());
        assert!(ChannelState::Instantiating.accepts_payments());
        assert!(ChannelState::Opened.accepts_payments());
        assert!(!ChannelState::Settling.accepts_payments());
        assert!(!ChannelState::Closed.accepts_payments());
    }

    #[test]
    fn test_display() {
        assert_eq!(ChannelState::TrustOpened.to_string(), "TRUST_OPENED");
        assert_eq!(format!("{}", ChannelState::Closed), "CLOSED");
    }
}
