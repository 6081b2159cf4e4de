use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle state of one leg (ingress or egress) of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayState {
    /// Signed by the sender only; waiting for the peer's co-signature.
    OneSigPending,
    /// Both parties signed a simplex state holding the pay as pending.
    CoSignedPending,
    /// The hash-lock preimage has been revealed.
    SecretRevealed,
    /// Settled as paid, signed by the sender only.
    OneSigPaid,
    /// Settled as paid and co-signed. Final state.
    CoSignedPaid,
    /// Settled as canceled, signed by the sender only.
    OneSigCanceled,
    /// Settled as canceled and co-signed. Final state.
    CoSignedCanceled,
    /// The peer refused the request carrying this pay.
    Nacked,
    /// Rejected upstream; waiting for the cancel settlement.
    IngressRejected,
}

impl PayState {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::CoSignedPaid | Self::CoSignedCanceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneSigPending => "ONESIG_PENDING",
            Self::CoSignedPending => "COSIGNED_PENDING",
            Self::SecretRevealed => "SECRET_REVEALED",
            Self::OneSigPaid => "ONESIG_PAID",
            Self::CoSignedPaid => "COSIGNED_PAID",
            Self::OneSigCanceled => "ONESIG_CANCELED",
            Self::CoSignedCanceled => "COSIGNED_CANCELED",
            Self::Nacked => "NACKED",
            Self::IngressRejected => "INGRESS_REJECTED",
        }
    }
}

impl fmt::Display for PayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which leg of a payment a state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayDirection {
    /// Received from the upstream peer.
    Ingress,
    /// Sent to the downstream peer.
    Egress,
}

impl PayDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingress => "in",
            Self::Egress => "out",
        }
    }
}

impl fmt::Display for PayDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive a payment leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayEvent {
    OneSigPending,
    CoSignedPending,
    SecretRevealed,
    OneSigPaid,
    /// Unconditional pay signed by the sender.
    DirectOneSigPaid,
    CoSignedPaid,
    /// Unconditional pay co-signed by both parties.
    DirectCoSignedPaid,
    OneSigCanceled,
    CoSignedCanceled,
    /// The peer acked the request carrying the pay.
    EgressDelivered,
    /// The peer nacked the request carrying the pay.
    EgressNacked,
    /// A later ack superseded the nacked request.
    EgressUpdateAfterNack,
    /// The pay was rejected by the destination or the path.
    IngressRejected,
}

impl PayEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneSigPending => "one_sig_pending",
            Self::CoSignedPending => "co_signed_pending",
            Self::SecretRevealed => "secret_revealed",
            Self::OneSigPaid => "one_sig_paid",
            Self::DirectOneSigPaid => "direct_one_sig_paid",
            Self::CoSignedPaid => "co_signed_paid",
            Self::DirectCoSignedPaid => "direct_co_signed_paid",
            Self::OneSigCanceled => "one_sig_canceled",
            Self::CoSignedCanceled => "co_signed_canceled",
            Self::EgressDelivered => "egress_delivered",
            Self::EgressNacked => "egress_nacked",
            Self::EgressUpdateAfterNack => "egress_update_after_nack",
            Self::IngressRejected => "ingress_rejected",
        }
    }

    /// Whether the event may create a state entry for a pay that has none.
    pub fn creates_entry(&self) -> bool {
        matches!(
            self,
            Self::OneSigPending
                | Self::CoSignedPending
                | Self::DirectOneSigPaid
                | Self::DirectCoSignedPaid
        )
    }
}

impl fmt::Display for PayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure transition table for a single payment leg.
///
/// Every event has a target state. Re-applying an event to a leg that is
/// already in its target state returns that state unchanged. The
/// `EgressDelivered`, `EgressNacked`, `EgressUpdateAfterNack` and
/// `IngressRejected` events leave every state outside their source set
/// untouched instead of failing.
pub struct PayStateMachine;

impl PayStateMachine {
    pub fn transition(current: Option<PayState>, event: PayEvent) -> Result<PayState, CoreError> {
        use PayState::*;

        let current = match current {
            Some(state) => state,
            None if event.creates_entry() => {
                return Ok(match event {
                    PayEvent::OneSigPending => OneSigPending,
                    PayEvent::CoSignedPending => CoSignedPending,
                    PayEvent::DirectOneSigPaid => OneSigPaid,
                    _ => CoSignedPaid,
                });
            }
            None => {
                return Err(CoreError::MissingPayState {
                    event: event.as_str(),
                })
            }
        };

        let invalid = || CoreError::InvalidPayStateTransition {
            from: current,
            event: event.as_str(),
        };

        let next = match (event, current) {
            (PayEvent::OneSigPending, OneSigPending) => OneSigPending,
            (PayEvent::OneSigPending, _) => return Err(invalid()),

            (PayEvent::CoSignedPending, OneSigPending | CoSignedPending) => CoSignedPending,
            (PayEvent::CoSignedPending, _) => return Err(invalid()),

            (PayEvent::SecretRevealed, CoSignedPending | SecretRevealed) => SecretRevealed,
            (PayEvent::SecretRevealed, OneSigPaid | OneSigCanceled) => current,
            (PayEvent::SecretRevealed, CoSignedPaid | CoSignedCanceled) => {
                return Err(CoreError::PayOffChainResolved)
            }
            (PayEvent::SecretRevealed, _) => return Err(invalid()),

            (
                PayEvent::OneSigPaid,
                OneSigPending | CoSignedPending | SecretRevealed | OneSigCanceled | OneSigPaid,
            ) => OneSigPaid,
            (PayEvent::OneSigPaid, _) => return Err(invalid()),

            (PayEvent::DirectOneSigPaid, OneSigPaid) => OneSigPaid,
            (PayEvent::DirectOneSigPaid, _) => return Err(invalid()),

            (PayEvent::CoSignedPaid, CoSignedPending | SecretRevealed | OneSigPaid | CoSignedPaid) => {
                CoSignedPaid
            }
            (PayEvent::CoSignedPaid, _) => return Err(invalid()),

            (PayEvent::DirectCoSignedPaid, OneSigPaid | CoSignedPaid) => CoSignedPaid,
            (PayEvent::DirectCoSignedPaid, _) => return Err(invalid()),

            (
                PayEvent::OneSigCanceled,
                OneSigPending | CoSignedPending | SecretRevealed | OneSigCanceled,
            ) => OneSigCanceled,
            (PayEvent::OneSigCanceled, _) => return Err(invalid()),

            (PayEvent::CoSignedCanceled, OneSigPaid | CoSignedPaid) => return Err(invalid()),
            (PayEvent::CoSignedCanceled, _) => CoSignedCanceled,

            (PayEvent::EgressDelivered, OneSigPending) => CoSignedPending,
            (PayEvent::EgressNacked, OneSigPending | OneSigPaid) => Nacked,
            (PayEvent::EgressUpdateAfterNack, Nacked) => CoSignedCanceled,
            (PayEvent::IngressRejected, CoSignedPending | SecretRevealed) => IngressRejected,
            (
                PayEvent::EgressDelivered
                | PayEvent::EgressNacked
                | PayEvent::EgressUpdateAfterNack
                | PayEvent::IngressRejected,
                _,
            ) => current,
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PayState; 9] = [
        PayState::OneSigPending,
        PayState::CoSignedPending,
        PayState::SecretRevealed,
        PayState::OneSigPaid,
        PayState::CoSignedPaid,
        PayState::OneSigCanceled,
        PayState::CoSignedCanceled,
        PayState::Nacked,
        PayState::IngressRejected,
    ];

    const EVENTS: [PayEvent; 13] = [
        PayEvent::OneSigPending,
        PayEvent::CoSignedPending,
        PayEvent::SecretRevealed,
        PayEvent::OneSigPaid,
        PayEvent::DirectOneSigPaid,
        PayEvent::CoSignedPaid,
        PayEvent::DirectCoSignedPaid,
        PayEvent::OneSigCanceled,
        PayEvent::CoSignedCanceled,
        PayEvent::EgressDelivered,
        PayEvent::EgressNacked,
        PayEvent::EgressUpdateAfterNack,
        PayEvent::IngressRejected,
    ];

    #[test]
    fn test_new_entries() {
        assert_eq!(
            PayStateMachine::transition(None, PayEvent::OneSigPending).unwrap(),
            PayState::OneSigPending
        );
        assert_eq!(
            PayStateMachine::transition(None, PayEvent::DirectOneSigPaid).unwrap(),
            PayState::OneSigPaid
        );
        assert_eq!(
            PayStateMachine::transition(None, PayEvent::DirectCoSignedPaid).unwrap(),
            PayState::CoSignedPaid
        );
        assert!(matches!(
            PayStateMachine::transition(None, PayEvent::CoSignedPaid),
            Err(CoreError::MissingPayState { .. })
        ));
    }

    #[test]
    fn test_conditional_egress_happy_path() {
        let s = PayStateMachine::transition(None, PayEvent::OneSigPending).unwrap();
        let s = PayStateMachine::transition(Some(s), PayEvent::EgressDelivered).unwrap();
        assert_eq!(s, PayState::CoSignedPending);
        let s = PayStateMachine::transition(Some(s), PayEvent::SecretRevealed).unwrap();
        let s = PayStateMachine::transition(Some(s), PayEvent::OneSigPaid).unwrap();
        let s = PayStateMachine::transition(Some(s), PayEvent::CoSignedPaid).unwrap();
        assert_eq!(s, PayState::CoSignedPaid);
    }

    #[test]
    fn test_reapplying_event_to_its_target_is_noop() {
        for event in EVENTS {
            let Ok(target) = PayStateMachine::transition(
                Some(match event {
                    PayEvent::EgressDelivered => PayState::OneSigPending,
                    PayEvent::EgressNacked => PayState::OneSigPending,
                    PayEvent::EgressUpdateAfterNack => PayState::Nacked,
                    PayEvent::IngressRejected => PayState::CoSignedPending,
                    PayEvent::DirectOneSigPaid | PayEvent::DirectCoSignedPaid => PayState::OneSigPaid,
                    _ => PayState::CoSignedPending,
                }),
                event,
            ) else {
                continue;
            };
            assert_eq!(
                PayStateMachine::transition(Some(target), event).unwrap(),
                target,
                "{event}"
            );
        }
    }

    #[test]
    fn test_secret_reveal_after_cosigned_settlement_fails() {
        for state in [PayState::CoSignedPaid, PayState::CoSignedCanceled] {
            assert!(matches!(
                PayStateMachine::transition(Some(state), PayEvent::SecretRevealed),
                Err(CoreError::PayOffChainResolved)
            ));
        }
        assert_eq!(
            PayStateMachine::transition(Some(PayState::OneSigPaid), PayEvent::SecretRevealed)
                .unwrap(),
            PayState::OneSigPaid
        );
    }

    #[test]
    fn test_paid_and_canceled_are_exclusive() {
        for state in [PayState::OneSigPaid, PayState::CoSignedPaid] {
            assert!(PayStateMachine::transition(Some(state), PayEvent::CoSignedCanceled).is_err());
        }
        assert!(
            PayStateMachine::transition(Some(PayState::CoSignedCanceled), PayEvent::CoSignedPaid)
                .is_err()
        );
    }

    #[test]
    fn test_nack_only_touches_one_sig_states() {
        for state in ALL {
            let next = PayStateMachine::transition(Some(state), PayEvent::EgressNacked).unwrap();
            match state {
                PayState::OneSigPending | PayState::OneSigPaid => assert_eq!(next, PayState::Nacked),
                _ => assert_eq!(next, state),
            }
        }
        assert_eq!(
            PayStateMachine::transition(Some(PayState::Nacked), PayEvent::EgressUpdateAfterNack)
                .unwrap(),
            PayState::CoSignedCanceled
        );
    }

    #[test]
    fn test_cancel_accepts_nacked_and_rejected() {
        for state in [PayState::Nacked, PayState::IngressRejected, PayState::OneSigCanceled] {
            assert_eq!(
                PayStateMachine::transition(Some(state), PayEvent::CoSignedCanceled).unwrap(),
                PayState::CoSignedCanceled
            );
        }
    }

    #[test]
    fn test_ingress_rejected() {
        assert_eq!(
            PayStateMachine::transition(Some(PayState::SecretRevealed), PayEvent::IngressRejected)
                .unwrap(),
            PayState::IngressRejected
        );
        assert_eq!(
            PayStateMachine::transition(Some(PayState::CoSignedPaid), PayEvent::IngressRejected)
                .unwrap(),
            PayState::CoSignedPaid
        );
    }

    #[test]
    fn test_direct_one_sig_paid_rejects_other_states() {
        assert!(matches!(
            PayStateMachine::transition(Some(PayState::CoSignedPending), PayEvent::DirectOneSigPaid),
            Err(CoreError::InvalidPayStateTransition {
                from: PayState::CoSignedPending,
                ..
            })
        ));
    }
}
