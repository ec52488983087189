use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::error::AuthlyError;

/// Unreserved characters allowed in a PKCE code verifier (RFC 7636 §4.1).
const VERIFIER_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

pub const MIN_VERIFIER_LENGTH: usize = 43;
pub const MAX_VERIFIER_LENGTH: usize = 128;
pub const DEFAULT_VERIFIER_LENGTH: usize = 43;

/// A PKCE verifier/challenge pair.
pub struct PkcePair {
    pub code_verifier: String,
    pub code_challenge: String,
}

/// Generate a random code verifier of the given length.
///
/// Draws uniformly from the 66-character unreserved alphabet using the
/// process CSPRNG. There is no fallback source: if OS randomness is
/// unavailable the process aborts rather than degrading.
pub fn generate_verifier(length: usize) -> Result<String, AuthlyError> {
    if !(MIN_VERIFIER_LENGTH..=MAX_VERIFIER_LENGTH).contains(&length) {
        return Err(AuthlyError::Configuration(format!(
            "PKCE verifier length must be between {MIN_VERIFIER_LENGTH} and {MAX_VERIFIER_LENGTH}, got {length}"
        )));
    }
    let mut rng = rand::rng();
    let verifier = (0..length)
        .map(|_| VERIFIER_CHARSET[rng.random_range(0..VERIFIER_CHARSET.len())] as char)
        .collect();
    Ok(verifier)
}

/// Derive the S256 code challenge for a verifier:
/// base64url(SHA-256(verifier)), padding stripped.
pub fn derive_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate a verifier of the default length and its challenge.
pub fn generate_pair() -> Result<PkcePair, AuthlyError> {
    let code_verifier = generate_verifier(DEFAULT_VERIFIER_LENGTH)?;
    let code_challenge = derive_challenge(&code_verifier);
    Ok(PkcePair {
        code_verifier,
        code_challenge,
    })
}

/// Generate a random CSRF state token.
pub fn generate_state() -> String {
    uuid::Uuid::new_v4().to_string()
}
