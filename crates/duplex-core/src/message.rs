//! Wire messages exchanged between channel peers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{DelegationProof, PayNote, SignedSimplexState};
use crate::types::{Addr, Amount, PayId};

/// Reason code carried by a [`WireError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Misc,
    InvalidSeqNum,
    PayRouteLoop,
    PeerNotOnline,
    NotEnoughBalance,
    NoRouteToDst,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Misc => "MISC",
            Self::InvalidSeqNum => "INVALID_SEQ_NUM",
            Self::PayRouteLoop => "PAY_ROUTE_LOOP",
            Self::PeerNotOnline => "PEER_NOT_ONLINE",
            Self::NotEnoughBalance => "NOT_ENOUGH_BALANCE",
            Self::NoRouteToDst => "NO_ROUTE_TO_DST",
        };
        f.write_str(s)
    }
}

/// Error returned to the peer instead of a co-signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Sequence number of the offending request.
    pub seq: u64,
    pub code: ErrorCode,
    pub reason: String,
}

/// Why a pending pay is being removed from a simplex state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettleReason {
    /// Paid in full after the condition was met.
    PayPaidMax,
    PayRejected,
    PayDestUnreachable,
    /// Resolve deadline passed.
    PayExpired,
    PayResolvedOnchain,
}

impl SettleReason {
    /// Reasons that may settle several pays in one request.
    pub fn allows_batch(&self) -> bool {
        matches!(self, Self::PayExpired | Self::PayResolvedOnchain)
    }
}

impl fmt::Display for SettleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PayPaidMax => "PAY_PAID_MAX",
            Self::PayRejected => "PAY_REJECTED",
            Self::PayDestUnreachable => "PAY_DEST_UNREACHABLE",
            Self::PayExpired => "PAY_EXPIRED",
            Self::PayResolvedOnchain => "PAY_RESOLVED_ONCHAIN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledPayment {
    pub settled_pay_id: PayId,
    pub reason: SettleReason,
    #[serde(with = "amount_dec")]
    pub amount: Amount,
}

/// A routing table update forwarded to the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingUpdate {
    pub origin: Addr,
    pub token: Addr,
    pub peers: Vec<Addr>,
    pub ts: u64,
}

/// One node a message passed through, with the error it hit there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathHop {
    pub addr: Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    CondPayRequest {
        #[serde(with = "hex_bytes")]
        cond_pay: Vec<u8>,
        #[serde(default, with = "proto_hex_opt")]
        note: Option<PayNote>,
        direct_pay: bool,
        base_seq: u64,
        #[serde(with = "proto_hex")]
        state_only_peer_from_sig: SignedSimplexState,
    },
    CondPayResponse {
        #[serde(default, with = "proto_hex_opt")]
        state_cosigned: Option<SignedSimplexState>,
        #[serde(default)]
        error: Option<WireError>,
    },
    CondPayReceipt {
        pay_id: PayId,
        /// Destination's signature over the pay bytes, or the delegatee's
        /// when `delegation` is set.
        #[serde(with = "hex_bytes")]
        pay_dest_sig: Vec<u8>,
        #[serde(default, with = "proto_hex_opt")]
        delegation: Option<DelegationProof>,
    },
    RevealSecret {
        pay_id: PayId,
        #[serde(with = "hex_bytes")]
        secret: Vec<u8>,
    },
    RevealSecretAck {
        pay_id: PayId,
        #[serde(with = "hex_bytes")]
        pay_dest_secret_sig: Vec<u8>,
    },
    PaymentSettleRequest {
        settled_pays: Vec<SettledPayment>,
        base_seq: u64,
        #[serde(with = "proto_hex")]
        state_only_peer_from_sig: SignedSimplexState,
    },
    PaymentSettleResponse {
        #[serde(default, with = "proto_hex_opt")]
        state_cosigned: Option<SignedSimplexState>,
        #[serde(default)]
        error: Option<WireError>,
    },
    PaymentSettleProof {
        settled_pays: Vec<SettledPayment>,
    },
    RoutingRequest {
        updates: Vec<RoutingUpdate>,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CondPayRequest { .. } => "cond_pay_request",
            Self::CondPayResponse { .. } => "cond_pay_response",
            Self::CondPayReceipt { .. } => "cond_pay_receipt",
            Self::RevealSecret { .. } => "reveal_secret",
            Self::RevealSecretAck { .. } => "reveal_secret_ack",
            Self::PaymentSettleRequest { .. } => "payment_settle_request",
            Self::PaymentSettleResponse { .. } => "payment_settle_response",
            Self::PaymentSettleProof { .. } => "payment_settle_proof",
            Self::RoutingRequest { .. } => "routing_request",
        }
    }

    /// The one-sig simplex state carried by a state-updating request.
    pub fn offered_state(&self) -> Option<&SignedSimplexState> {
        match self {
            Self::CondPayRequest {
                state_only_peer_from_sig,
                ..
            }
            | Self::PaymentSettleRequest {
                state_only_peer_from_sig,
                ..
            } => Some(state_only_peer_from_sig),
            _ => None,
        }
    }
}

/// A message plus its routing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Final recipient for messages relayed across several hops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_addr: Option<Addr>,
    /// Append-only trail used to diagnose route loops.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<PathHop>,
    pub message: Message,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            to_addr: None,
            path: Vec::new(),
            message,
        }
    }

    pub fn to(mut self, addr: Addr) -> Self {
        self.to_addr = Some(addr);
        self
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

mod proto_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<M: prost::Message, S: Serializer>(msg: &M, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(msg.encode_to_vec()))
    }

    pub fn deserialize<'de, M: prost::Message + Default, D: Deserializer<'de>>(
        d: D,
    ) -> Result<M, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        M::decode(bytes.as_slice()).map_err(serde::de::Error::custom)
    }
}

mod proto_hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<M: prost::Message, S: Serializer>(
        msg: &Option<M>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match msg {
            Some(m) => s.serialize_some(&hex::encode(m.encode_to_vec())),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, M: prost::Message + Default, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<M>, D::Error> {
        let Some(s) = Option::<String>::deserialize(d)? else {
            return Ok(None);
        };
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        M::decode(bytes.as_slice())
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

mod amount_dec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SimplexPaymentChannel;
    use crate::types::ChannelId;

    #[test]
    fn test_cond_pay_request_json() {
        let simplex = SimplexPaymentChannel::empty(ChannelId([1; 32]), Addr([2; 32]));
        let env = Envelope::new(Message::CondPayRequest {
            cond_pay: vec![1, 2, 3],
            note: None,
            direct_pay: true,
            base_seq: 4,
            state_only_peer_from_sig: SignedSimplexState::unsigned(&simplex),
        })
        .to(Addr([3; 32]));

        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"cond_pay_request\""));
        assert!(json.contains("\"cond_pay\":\"010203\""));
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
        assert!(back.message.offered_state().is_some());
    }

    #[test]
    fn test_response_with_error() {
        let env = Envelope::new(Message::CondPayResponse {
            state_cosigned: None,
            error: Some(WireError {
                seq: 2,
                code: ErrorCode::InvalidSeqNum,
                reason: "invalid sequence number".into(),
            }),
        });
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("INVALID_SEQ_NUM"));
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.message.kind(), "cond_pay_response");
    }

    #[test]
    fn test_settled_amount_is_decimal_string() {
        let pay = SettledPayment {
            settled_pay_id: PayId([1; 32]),
            reason: SettleReason::PayExpired,
            amount: u128::MAX,
        };
        let json = serde_json::to_string(&pay).unwrap();
        assert!(json.contains(&format!("\"{}\"", u128::MAX)));
        let back: SettledPayment = serde_json::from_str(&json).unwrap();
        assert_eq!(back.amount, u128::MAX);
    }

    #[test]
    fn test_batchable_reasons() {
        assert!(SettleReason::PayExpired.allows_batch());
        assert!(SettleReason::PayResolvedOnchain.allows_batch());
        assert!(!SettleReason::PayPaidMax.allows_batch());
        assert!(!SettleReason::PayRejected.allows_batch());
        assert!(!SettleReason::PayDestUnreachable.allows_batch());
    }
}
