//! Long-term onion identity.
//!
//! An identity owns the hidden service's RSA key pair. The 16-character
//! onion label is derived from the public key, and the private key signs
//! the authentication proof that binds a session to that label.

mod onion;

pub use onion::{OnionAddress, ADDRESS_PREFIX, LABEL_LEN};

use crate::error::{Error, Result};
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::Sha256;
use std::fmt;

/// RSA modulus size used for hidden service keys.
pub const KEY_BITS: usize = 1024;

/// A hidden service identity: RSA key pair plus the derived onion label.
pub struct Identity {
    key: RsaPrivateKey,
    public_der: Vec<u8>,
    address: OnionAddress,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate() -> Result<Self> {
        let key = RsaPrivateKey::new(&mut OsRng, KEY_BITS)
            .map_err(|e| Error::Identity(format!("key generation failed: {}", e)))?;
        Self::from_private_key(key)
    }

    /// Build an identity around an existing private key.
    pub fn from_private_key(key: RsaPrivateKey) -> Result<Self> {
        let public_der = key
            .to_public_key()
            .to_pkcs1_der()
            .map_err(|e| Error::Identity(format!("public key encoding failed: {}", e)))?
            .into_vec();
        let address = OnionAddress::from_public_key_der(&public_der);
        Ok(Self {
            key,
            public_der,
            address,
        })
    }

    /// Restore an identity from a PKCS#1 DER private key, as persisted in
    /// the config document.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs1_der(der)
            .map_err(|e| Error::Identity(format!("invalid private key: {}", e)))?;
        Self::from_private_key(key)
    }

    /// Export the private key as PKCS#1 DER for persistence.
    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self
            .key
            .to_pkcs1_der()
            .map_err(|e| Error::Identity(format!("private key encoding failed: {}", e)))?
            .to_bytes()
            .to_vec())
    }

    /// This identity's onion label.
    pub fn address(&self) -> &OnionAddress {
        &self.address
    }

    /// DER-encoded public key, as transmitted in the authentication proof.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// Sign a SHA-256 digest with the identity key (PKCS#1 v1.5).
    pub fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>> {
        self.key
            .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
            .map_err(|e| Error::Auth(format!("signing failed: {}", e)))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("key", &"[REDACTED]")
            .finish()
    }
}
