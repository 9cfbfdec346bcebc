//! Keyed identity hashing.
//!
//! The wire identity of a conversation and its members is the HMAC-SHA256 of
//! the real identifier keyed by the per-call random secret, hex-encoded.
//! Clients always present the fixed hash `"_"`; the SFT distinguishes
//! devices by user hash + SSRC, and per-device correlation stays impossible
//! for anyone who does not hold the secret.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::types::{ClientId, ConvId, IdHash, UserId};

type HmacSha256 = Hmac<Sha256>;

/// Length of the per-call random secret in bytes.
pub const SECRET_LEN: usize = 16;

/// The fixed client-id hash every device presents on the wire.
pub const CLIENT_HASH: &str = "_";

/// Generate a fresh call secret.
pub fn new_secret() -> Vec<u8> {
    let mut secret = vec![0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

fn keyed_hash(secret: &[u8], input: &[u8]) -> IdHash {
    // HMAC accepts any key length; SECRET_LEN is fixed by the caller.
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(input);
    IdHash(hex::encode(mac.finalize().into_bytes()))
}

/// Derive the conversation hash used as the wire session id.
pub fn conv_hash(secret: &[u8], convid: &ConvId) -> IdHash {
    keyed_hash(secret, convid.as_str().as_bytes())
}

/// Derive a user's wire hash from their real user + client identity.
pub fn user_hash(secret: &[u8], userid: &UserId, clientid: &ClientId) -> IdHash {
    let input = format!("{}.{}", userid.as_str(), clientid.as_str());
    keyed_hash(secret, input.as_bytes())
}

/// Short hex prefix of a secret, safe to log.
pub fn secret_prefix(secret: &[u8]) -> String {
    hex::encode(&secret[..secret.len().min(4)])
}
