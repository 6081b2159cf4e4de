use duplex_core::Addr;
use ed25519_dalek::{Signer as _, Verifier as _};

use crate::error::CryptoError;
use crate::keys::{KeyPair, PublicKey};

/// Ed25519 signature (64 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    inner: ed25519_dalek::Signature,
}

impl Signature {
    pub fn to_bytes(&self) -> [u8; 64] {
        self.inner.to_bytes()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 64] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidInput(format!("signature must be 64 bytes, got {}", bytes.len()))
        })?;
        Ok(Self {
            inner: ed25519_dalek::Signature::from_bytes(&arr),
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

pub fn sign(message: &[u8], keypair: &KeyPair) -> Signature {
    Signature {
        inner: keypair.signing_key().sign(message),
    }
}

pub fn verify(message: &[u8], signature: &Signature, pubkey: &PublicKey) -> Result<(), CryptoError> {
    pubkey
        .verifying_key()
        .verify(message, &signature.inner)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}

/// Verify raw signature bytes against the key behind `addr`.
pub fn verify_by_addr(addr: &Addr, message: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    let pubkey = PublicKey::from_addr(addr)?;
    let signature = Signature::from_bytes(sig)?;
    verify(message, &signature, &pubkey).inspect_err(|_| {
        tracing::debug!(signer = %addr, len = message.len(), "signature rejected");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let kp = KeyPair::generate();
        let sig = sign(b"simplex state", &kp);
        assert!(verify(b"simplex state", &sig, &kp.public_key()).is_ok());
        assert!(verify_by_addr(&kp.addr(), b"simplex state", &sig.to_vec()).is_ok());
    }

    #[test]
    fn test_verify_wrong_message_fails() {
        let kp = KeyPair::generate();
        let sig = sign(b"correct", &kp);
        assert_eq!(
            verify(b"wrong", &sig, &kp.public_key()),
            Err(CryptoError::SignatureVerificationFailed)
        );
    }

    #[test]
    fn test_verify_wrong_signer_fails() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::generate();
        let sig = sign(b"msg", &kp1);
        assert!(verify_by_addr(&kp2.addr(), b"msg", &sig.to_vec()).is_err());
    }

    #[test]
    fn test_malformed_signature_rejected() {
        let kp = KeyPair::generate();
        assert!(matches!(
            verify_by_addr(&kp.addr(), b"msg", &[0u8; 10]),
            Err(CryptoError::InvalidInput(_))
        ));
        assert!(verify_by_addr(&kp.addr(), b"msg", &[]).is_err());
    }

    #[test]
    fn test_deterministic_signatures() {
        let kp = KeyPair::from_seed(&[99u8; 32]);
        assert_eq!(sign(b"same", &kp), sign(b"same", &kp));
        assert_eq!(sign(b"same", &kp).to_hex().len(), 128);
    }
}
