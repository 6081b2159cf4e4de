use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::CoreError;

/// Token amount in the smallest unit of the channel token.
///
/// Amounts travel on the wire as minimal big-endian byte strings (an empty
/// string is zero) and never go negative.
pub type Amount = u128;

/// Encode an amount as a minimal big-endian byte string.
pub fn amount_to_bytes(amount: Amount) -> Vec<u8> {
    let bytes = amount.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

/// Decode a big-endian byte string into an amount.
pub fn amount_from_bytes(bytes: &[u8]) -> Result<Amount, CoreError> {
    let significant = match bytes.iter().position(|b| *b != 0) {
        Some(first) => &bytes[first..],
        None => return Ok(0),
    };
    if significant.len() > 16 {
        return Err(CoreError::InvalidAmount(format!(
            "amount of {} bytes does not fit in 128 bits",
            significant.len()
        )));
    }
    let mut buf = [0u8; 16];
    buf[16 - significant.len()..].copy_from_slice(significant);
    Ok(u128::from_be_bytes(buf))
}

macro_rules! fixed_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// The all-zero value.
            pub const ZERO: Self = Self([0u8; 32]);

            /// Build from a byte slice that must be exactly 32 bytes long.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
                let arr: [u8; 32] = bytes.try_into().map_err(|_| {
                    CoreError::InvalidArg(format!(
                        "{} must be 32 bytes, got {}",
                        $label,
                        bytes.len()
                    ))
                })?;
                Ok(Self(arr))
            }

            /// Parse from a hex string, with or without a `0x` prefix.
            pub fn from_hex(s: &str) -> Result<Self, CoreError> {
                let trimmed = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(trimmed)
                    .map_err(|e| CoreError::InvalidArg(format!("invalid {} hex: {}", $label, e)))?;
                Self::from_slice(&bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_vec(&self) -> Vec<u8> {
                self.0.to_vec()
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; 32]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}..)", stringify!($name), &self.to_hex()[..8])
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_id!(
    /// A participant address: the 32-byte ed25519 public key of a node.
    ///
    /// Token identifiers use the same representation; the zero address is the
    /// native token.
    Addr,
    "address"
);

fixed_id!(
    /// Channel identifier agreed by both parties when the channel is opened.
    ChannelId,
    "channel id"
);

fixed_id!(
    /// Content-derived payment identifier (BLAKE3 of the encoded payment).
    PayId,
    "pay id"
);

impl PayId {
    /// Derive the payment id from the canonical payment encoding.
    pub fn from_pay_bytes(pay_bytes: &[u8]) -> Self {
        Self(*blake3::hash(pay_bytes).as_bytes())
    }
}

/// Block height on the settlement chain.
pub type BlockNumber = u64;
