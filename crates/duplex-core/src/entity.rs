//! Signed protocol entities.
//!
//! These are encoded with protobuf so that signatures and pay ids are
//! computed over a stable byte representation. Signed payloads are carried
//! as the exact bytes that were signed, never re-encoded.

use prost::Message;

use crate::error::CoreError;
use crate::types::{amount_from_bytes, amount_to_bytes, Addr, Amount, BlockNumber, ChannelId, PayId};

/// A hash-lock condition: the pay resolves once the preimage of
/// `hash_lock` is revealed.
#[derive(Clone, PartialEq, Message)]
pub struct Condition {
    #[prost(bytes = "vec", tag = "1")]
    pub hash_lock: Vec<u8>,
}

/// A payment that may be locked behind conditions.
///
/// A pay with no conditions is unconditional and transfers `amount` as soon
/// as it is co-signed.
#[derive(Clone, PartialEq, Message)]
pub struct ConditionalPay {
    #[prost(uint64, tag = "1")]
    pub pay_timestamp: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub src: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub dest: Vec<u8>,
    #[prost(message, repeated, tag = "4")]
    pub conditions: Vec<Condition>,
    #[prost(bytes = "vec", tag = "5")]
    pub token: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub amount: Vec<u8>,
    #[prost(uint64, tag = "7")]
    pub resolve_deadline: u64,
    #[prost(uint64, tag = "8")]
    pub resolve_timeout: u64,
    #[prost(bytes = "vec", tag = "9")]
    pub pay_resolver: Vec<u8>,
}

impl ConditionalPay {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        Ok(Self::decode(bytes)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn src_addr(&self) -> Result<Addr, CoreError> {
        Addr::from_slice(&self.src)
    }

    pub fn dest_addr(&self) -> Result<Addr, CoreError> {
        Addr::from_slice(&self.dest)
    }

    pub fn token_addr(&self) -> Result<Addr, CoreError> {
        Addr::from_slice(&self.token)
    }

    pub fn resolver_addr(&self) -> Result<Addr, CoreError> {
        Addr::from_slice(&self.pay_resolver)
    }

    pub fn amount(&self) -> Result<Amount, CoreError> {
        amount_from_bytes(&self.amount)
    }

    pub fn set_amount(&mut self, amount: Amount) {
        self.amount = amount_to_bytes(amount);
    }

    pub fn deadline(&self) -> BlockNumber {
        self.resolve_deadline
    }

    /// Unconditional pays have no conditions.
    pub fn is_unconditional(&self) -> bool {
        self.conditions.is_empty()
    }

    /// The single hash lock, if this pay carries exactly one condition.
    pub fn single_hash_lock(&self) -> Option<&[u8]> {
        match self.conditions.as_slice() {
            [only] => Some(only.hash_lock.as_slice()),
            _ => None,
        }
    }
}

/// One direction of a duplex channel.
#[derive(Clone, PartialEq, Message)]
pub struct SimplexPaymentChannel {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub peer_from: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub seq_num: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub transfer_to_peer: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "5")]
    pub pending_pay_ids: Vec<Vec<u8>>,
    #[prost(uint64, tag = "6")]
    pub last_pay_resolve_deadline: u64,
    #[prost(bytes = "vec", tag = "7")]
    pub total_pending_amount: Vec<u8>,
}

impl SimplexPaymentChannel {
    /// A fresh simplex with sequence number zero.
    pub fn empty(cid: ChannelId, peer_from: Addr) -> Self {
        Self {
            channel_id: cid.to_vec(),
            peer_from: peer_from.to_vec(),
            ..Default::default()
        }
    }

    pub fn cid(&self) -> Result<ChannelId, CoreError> {
        ChannelId::from_slice(&self.channel_id)
    }

    pub fn peer_from_addr(&self) -> Result<Addr, CoreError> {
        Addr::from_slice(&self.peer_from)
    }

    pub fn transfer(&self) -> Result<Amount, CoreError> {
        amount_from_bytes(&self.transfer_to_peer)
    }

    pub fn set_transfer(&mut self, amount: Amount) {
        self.transfer_to_peer = amount_to_bytes(amount);
    }

    pub fn total_pending(&self) -> Result<Amount, CoreError> {
        amount_from_bytes(&self.total_pending_amount)
    }

    pub fn set_total_pending(&mut self, amount: Amount) {
        self.total_pending_amount = amount_to_bytes(amount);
    }

    pub fn pending_ids(&self) -> Result<Vec<PayId>, CoreError> {
        self.pending_pay_ids
            .iter()
            .map(|id| PayId::from_slice(id))
            .collect()
    }

    pub fn set_pending_ids(&mut self, ids: &[PayId]) {
        self.pending_pay_ids = ids.iter().map(PayId::to_vec).collect();
    }
}

/// A simplex state with the signatures of both channel participants.
///
/// `simplex_state` holds the encoded [`SimplexPaymentChannel`] exactly as it
/// was signed.
#[derive(Clone, PartialEq, Message)]
pub struct SignedSimplexState {
    #[prost(bytes = "vec", tag = "1")]
    pub simplex_state: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub sig_of_peer_from: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub sig_of_peer_to: Vec<u8>,
}

impl SignedSimplexState {
    pub fn unsigned(simplex: &SimplexPaymentChannel) -> Self {
        Self {
            simplex_state: simplex.encode_to_vec(),
            ..Default::default()
        }
    }

    pub fn simplex(&self) -> Result<SimplexPaymentChannel, CoreError> {
        SimplexPaymentChannel::decode(self.simplex_state.as_slice())
            .map_err(|_| CoreError::SimplexParse)
    }
}

/// Authorizes `delegatee` to receive `token` payments on behalf of an
/// offline `delegator` until `expires_at_block`.
#[derive(Clone, PartialEq, Message)]
pub struct DelegationProof {
    #[prost(bytes = "vec", tag = "1")]
    pub delegator: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub delegatee: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub token: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub expires_at_block: u64,
    #[prost(bytes = "vec", tag = "5")]
    pub delegator_sig: Vec<u8>,
}

impl DelegationProof {
    /// Bytes the delegator signs: the proof encoded without its signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        Self {
            delegator_sig: Vec::new(),
            ..self.clone()
        }
        .encode_to_vec()
    }

    pub fn delegator_addr(&self) -> Result<Addr, CoreError> {
        Addr::from_slice(&self.delegator)
    }

    pub fn delegatee_addr(&self) -> Result<Addr, CoreError> {
        Addr::from_slice(&self.delegatee)
    }

    pub fn token_addr(&self) -> Result<Addr, CoreError> {
        Addr::from_slice(&self.token)
    }
}

/// Application note attached to a pay, tagged with its type.
#[derive(Clone, PartialEq, Message)]
pub struct PayNote {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Type tag of a [`PayOriginNote`] carried inside a [`PayNote`].
pub const PAY_ORIGIN_NOTE_TYPE: &str = "duplex.entity.PayOriginNote";

#[derive(Clone, PartialEq, Message)]
pub struct OriginalPay {
    #[prost(bytes = "vec", tag = "1")]
    pub pay_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub amount: Vec<u8>,
}

/// Lists the pays a delegatee received on behalf of a delegator and now
/// forwards as one lump sum.
#[derive(Clone, PartialEq, Message)]
pub struct PayOriginNote {
    #[prost(message, repeated, tag = "1")]
    pub original_pays: Vec<OriginalPay>,
}

impl PayOriginNote {
    pub fn to_note(&self) -> PayNote {
        PayNote {
            type_url: PAY_ORIGIN_NOTE_TYPE.to_string(),
            value: self.encode_to_vec(),
        }
    }

    pub fn from_note(note: &PayNote) -> Result<Self, CoreError> {
        if note.type_url != PAY_ORIGIN_NOTE_TYPE {
            return Err(CoreError::Decode(format!(
                "unexpected note type {}",
                note.type_url
            )));
        }
        Ok(Self::decode(note.value.as_slice())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pay() -> ConditionalPay {
        let mut pay = ConditionalPay {
            pay_timestamp: 7,
            src: Addr([1; 32]).to_vec(),
            dest: Addr([2; 32]).to_vec(),
            conditions: vec![Condition {
                hash_lock: vec![9; 32],
            }],
            token: Addr::ZERO.to_vec(),
            resolve_deadline: 100,
            resolve_timeout: 10,
            pay_resolver: Addr([3; 32]).to_vec(),
            ..Default::default()
        };
        pay.set_amount(500);
        pay
    }

    #[test]
    fn test_pay_decode_and_accessors() {
        let pay = sample_pay();
        let decoded = ConditionalPay::from_bytes(&pay.to_bytes()).unwrap();
        assert_eq!(decoded, pay);
        assert_eq!(decoded.amount().unwrap(), 500);
        assert_eq!(decoded.dest_addr().unwrap(), Addr([2; 32]));
        assert_eq!(decoded.single_hash_lock(), Some(&[9u8; 32][..]));
        assert!(!decoded.is_unconditional());
    }

    #[test]
    fn test_pay_id_changes_with_content() {
        let a = sample_pay();
        let mut b = sample_pay();
        b.pay_timestamp = 8;
        assert_ne!(
            PayId::from_pay_bytes(&a.to_bytes()),
            PayId::from_pay_bytes(&b.to_bytes())
        );
    }

    #[test]
    fn test_signed_simplex_roundtrip() {
        let cid = ChannelId([4; 32]);
        let mut simplex = SimplexPaymentChannel::empty(cid, Addr([1; 32]));
        simplex.seq_num = 3;
        simplex.set_transfer(42);
        simplex.set_pending_ids(&[PayId([5; 32])]);
        let signed = SignedSimplexState::unsigned(&simplex);
        let back = signed.simplex().unwrap();
        assert_eq!(back.cid().unwrap(), cid);
        assert_eq!(back.transfer().unwrap(), 42);
        assert_eq!(back.pending_ids().unwrap(), vec![PayId([5; 32])]);
        assert_eq!(back.total_pending().unwrap(), 0);
    }

    #[test]
    fn test_corrupted_simplex_fails_to_parse() {
        let signed = SignedSimplexState {
            simplex_state: vec![0xff, 0xff, 0xff],
            ..Default::default()
        };
        assert!(matches!(signed.simplex(), Err(CoreError::SimplexParse)));
    }

    #[test]
    fn test_delegation_signing_bytes_ignore_sig() {
        let mut proof = DelegationProof {
            delegator: Addr([1; 32]).to_vec(),
            delegatee: Addr([2; 32]).to_vec(),
            token: Addr::ZERO.to_vec(),
            expires_at_block: 1000,
            delegator_sig: Vec::new(),
        };
        let unsigned = proof.signing_bytes();
        proof.delegator_sig = vec![7; 64];
        assert_eq!(proof.signing_bytes(), unsigned);
    }

    #[test]
    fn test_origin_note_wrapping() {
        let note = PayOriginNote {
            original_pays: vec![OriginalPay {
                pay_id: PayId([1; 32]).to_vec(),
                amount: amount_to_bytes(10),
            }],
        };
        let wrapped = note.to_note();
        assert_eq!(PayOriginNote::from_note(&wrapped).unwrap(), note);
        let other = PayNote {
            type_url: "other".into(),
            value: Vec::new(),
        };
        assert!(PayOriginNote::from_note(&other).is_err());
    }
}
