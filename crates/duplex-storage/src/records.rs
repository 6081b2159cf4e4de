//! Values stored in the logical tables.

use chrono::{DateTime, Utc};
use duplex_core::{Addr, Amount, ChannelId, ChannelState, PayId, PayState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub peer: Addr,
    pub token: Addr,
    pub state: ChannelState,
    pub state_ts: DateTime<Utc>,
}

/// A pay as received or created, kept as the exact signed bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPay {
    #[serde(with = "hex_bytes")]
    pub pay: Vec<u8>,
    /// Encoded `PayNote`, empty when the pay has none.
    #[serde(with = "hex_bytes", default)]
    pub note: Vec<u8>,
}

/// State of one leg of a pay and the channel it travels on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayStateRecord {
    pub cid: ChannelId,
    pub state: PayState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    #[serde(with = "hex_bytes")]
    pub preimage: Vec<u8>,
    pub pay_id: PayId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelegatedPayStatus {
    /// Accepted on behalf of the delegator, not yet settled.
    Receiving,
    /// Settled as paid; waiting to be forwarded.
    Received,
    /// Forwarded to the delegator.
    Done,
}

/// A pay received on behalf of an offline delegator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedPayRecord {
    pub dest: Addr,
    pub token: Addr,
    pub amount: Amount,
    pub status: DelegatedPayStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: String,
    pub updated_at: DateTime<Utc>,
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
