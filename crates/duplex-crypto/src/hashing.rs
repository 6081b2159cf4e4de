use rand::RngCore;

/// BLAKE3 hash (32 bytes).
pub type Hash = [u8; 32];

/// Hash arbitrary data using BLAKE3.
pub fn hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// The hash lock committing to `secret`.
pub fn hash_lock(secret: &[u8]) -> Hash {
    hash(secret)
}

/// A fresh 32-byte preimage for a hash-locked pay.
pub fn random_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    secret
}
