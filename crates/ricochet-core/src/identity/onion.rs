//! Onion address handling.
//!
//! A hidden service is identified by the first 16 characters of the base32
//! encoding of the SHA-1 digest of its DER-encoded RSA public key. Two
//! canonical text forms exist: bare (`abcdefghijklmnop`) and prefixed
//! (`ricochet:abcdefghijklmnop`). The core stores and compares the bare
//! form; the overlay dial target is `<label>.onion:9878`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Length of the bare onion label.
pub const LABEL_LEN: usize = 16;

/// Scheme prefix accepted on addresses.
pub const ADDRESS_PREFIX: &str = "ricochet:";

/// A bare 16-character lowercase base32 onion label.
///
/// Ordering is plain lexicographic order on the label, which is what the
/// connection duel tie-break relies on.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OnionAddress(String);

impl OnionAddress {
    /// Parse an address in bare or `ricochet:`-prefixed form.
    pub fn from_string(s: &str) -> Result<Self> {
        let bare = s.strip_prefix(ADDRESS_PREFIX).unwrap_or(s).to_lowercase();
        if bare.len() != LABEL_LEN {
            return Err(Error::Identity(format!(
                "onion label must be {} characters, got {}",
                LABEL_LEN,
                bare.len()
            )));
        }
        if !bare.bytes().all(|b| matches!(b, b'a'..=b'z' | b'2'..=b'7')) {
            return Err(Error::Identity("onion label is not base32".into()));
        }
        Ok(Self(bare))
    }

    /// Parse a full onion hostname (`<label>.onion`), the form persisted in
    /// the config document.
    pub fn from_onion_hostname(s: &str) -> Result<Self> {
        let label = s
            .strip_suffix(".onion")
            .ok_or_else(|| Error::Identity("hostname must end with .onion".into()))?;
        Self::from_string(label)
    }

    /// Derive the label from a DER-encoded RSA public key:
    /// `base32(SHA1(DER(pubkey)))[:16]`, lowercase.
    pub fn from_public_key_der(der: &[u8]) -> Self {
        let digest = Sha1::digest(der);
        let encoded = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &digest);
        Self(encoded[..LABEL_LEN].to_lowercase())
    }

    /// The bare label.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The full hostname, `<label>.onion`.
    pub fn onion_hostname(&self) -> String {
        format!("{}.onion", self.0)
    }

    /// The prefixed form, `ricochet:<label>`.
    pub fn prefixed(&self) -> String {
        format!("{}{}", ADDRESS_PREFIX, self.0)
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OnionAddress({})", self.0)
    }
}
