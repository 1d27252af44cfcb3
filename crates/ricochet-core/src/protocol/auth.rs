//! Authentication proof construction and verification.
//!
//! The dialer proves control of its onion label by signing
//! `client_cookie ‖ server_cookie ‖ label` with the RSA key the label is
//! derived from. The acceptor re-derives the label from the transmitted
//! public key, so a valid proof simultaneously authenticates the key and
//! the claimed label.

use crate::error::{Error, Result};
use crate::identity::{Identity, OnionAddress};
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};

/// Length of the client and server cookies.
pub const COOKIE_LEN: usize = 16;

/// A random handshake cookie.
pub type Cookie = [u8; COOKIE_LEN];

/// Generate a fresh random cookie.
pub fn new_cookie() -> Cookie {
    let mut cookie = [0u8; COOKIE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut cookie);
    cookie
}

/// The SHA-256 digest both sides sign and verify.
pub fn proof_digest(client: &Cookie, server: &Cookie, label: &OnionAddress) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(client);
    hasher.update(server);
    hasher.update(label.as_str().as_bytes());
    hasher.finalize().into()
}

/// Sign the proof for `identity`'s own label.
pub fn sign_proof(identity: &Identity, client: &Cookie, server: &Cookie) -> Result<Vec<u8>> {
    let digest = proof_digest(client, server, identity.address());
    identity.sign_digest(&digest)
}

/// Verify a received proof.
///
/// Parses the DER public key, derives the label it commits to, and checks
/// the signature over that label and both cookies. Returns the proven
/// label.
pub fn verify_proof(
    public_key_der: &[u8],
    signature: &[u8],
    client: &Cookie,
    server: &Cookie,
) -> Result<OnionAddress> {
    let public_key = RsaPublicKey::from_pkcs1_der(public_key_der)
        .map_err(|e| Error::Auth(format!("invalid public key: {}", e)))?;
    let label = OnionAddress::from_public_key_der(public_key_der);
    let digest = proof_digest(client, server, &label);
    public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|_| Error::Auth("signature verification failed".into()))?;
    Ok(label)
}
