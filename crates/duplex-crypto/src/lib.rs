pub mod error;
pub mod hashing;
pub mod keys;
pub mod signer;
pub mod signing;

pub use error::CryptoError;
pub use hashing::{hash, hash_lock, random_secret, Hash};
pub use keys::{KeyPair, PublicKey};
pub use signer::{KeyPairSigner, Signer};
pub use signing::{sign, verify, verify_by_addr, Signature};
