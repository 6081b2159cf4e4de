use duplex_core::Addr;

use crate::error::CryptoError;
use crate::keys::KeyPair;
use crate::signing::{sign, verify_by_addr};

/// Signs on behalf of this node and checks signatures of others.
pub trait Signer: Send + Sync {
    /// Address whose signatures this signer produces.
    fn addr(&self) -> Addr;

    fn sign(&self, data: &[u8]) -> Vec<u8>;

    fn verify(&self, addr: &Addr, data: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
        verify_by_addr(addr, data, sig)
    }
}

/// [`Signer`] backed by an in-process key pair.
pub struct KeyPairSigner {
    keypair: KeyPair,
    addr: Addr,
}

impl KeyPairSigner {
    pub fn new(keypair: KeyPair) -> Self {
        let addr = keypair.addr();
        Self { keypair, addr }
    }
}

impl Signer for KeyPairSigner {
    fn addr(&self) -> Addr {
        self.addr
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        sign(data, &self.keypair).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signer_roundtrip() {
        let signer = KeyPairSigner::new(KeyPair::from_seed(&[5u8; 32]));
        let sig = signer.sign(b"pay bytes");
        assert!(signer.verify(&signer.addr(), b"pay bytes", &sig).is_ok());
        assert!(signer.verify(&signer.addr(), b"other", &sig).is_err());
    }

    #[test]
    fn test_signer_is_object_safe() {
        let signer: Box<dyn Signer> = Box::new(KeyPairSigner::new(KeyPair::generate()));
        let other = KeyPairSigner::new(KeyPair::generate());
        let sig = other.sign(b"x");
        assert!(signer.verify(&other.addr(), b"x", &sig).is_ok());
    }
}
