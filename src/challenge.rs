// src/challenge.rs
// Challenge codec (spec section 4.2): password and public-key challenges
// over the shared `Challenge`/`Solution` wire types.

use crate::crypto;
use crate::error::CryptoError;
use chrono::{DateTime, Utc};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CHALLENGE_TTL_SECS: i64 = 30;

/// Wire type shared by both challenge variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub issued_at_unix: i64,
    pub ciphertext: Vec<u8>,
}

/// Wire type carrying a claimed solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solution {
    pub id: String,
    pub plaintext: Vec<u8>,
}

impl Challenge {
    /// True once `now` is more than [`CHALLENGE_TTL_SECS`] past issuance.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() > self.issued_at_unix + CHALLENGE_TTL_SECS
    }
}

/// Build a password challenge: `nonce` encrypted under `SHA256(password)`
/// with AES-256-GCM, a fresh random GCM nonce prefixed to the ciphertext.
/// Returns the challenge plus the plaintext nonce the issuer must remember
/// to compare the eventual solution against.
pub fn construct_password_challenge(password: &str) -> Result<(Challenge, Vec<u8>), CryptoError> {
    let nonce = Uuid::new_v4().as_bytes().to_vec();
    let key = crypto::sha256_bytes(password.as_bytes());
    let ciphertext = crypto::gcm_seal(&key, &nonce)?;
    let challenge = Challenge {
        id: Uuid::new_v4().to_string(),
        issued_at_unix: Utc::now().timestamp(),
        ciphertext,
    };
    Ok((challenge, nonce))
}

/// Solve a password challenge with the solver's candidate password.
pub fn solve_password_challenge(challenge: &Challenge, password: &str) -> Result<Solution, CryptoError> {
    let key = crypto::sha256_bytes(password.as_bytes());
    let plaintext = crypto::gcm_open(&key, &challenge.ciphertext)?;
    Ok(Solution {
        id: challenge.id.clone(),
        plaintext,
    })
}

/// Build a public-key challenge: `nonce` encrypted with RSA-OAEP(SHA-256)
/// under the allowed peer's public key.
pub fn construct_public_key_challenge(public_key: &RsaPublicKey) -> Result<(Challenge, Vec<u8>), CryptoError> {
    let nonce = Uuid::new_v4().as_bytes().to_vec();
    let ciphertext = crypto::rsa_oaep_encrypt(public_key, &nonce)?;
    let challenge = Challenge {
        id: Uuid::new_v4().to_string(),
        issued_at_unix: Utc::now().timestamp(),
        ciphertext,
    };
    Ok((challenge, nonce))
}

/// Solve a public-key challenge with the solver's private key.
pub fn solve_public_key_challenge(challenge: &Challenge, private_key: &RsaPrivateKey) -> Result<Solution, CryptoError> {
    let plaintext = crypto::rsa_oaep_decrypt(private_key, &challenge.ciphertext)?;
    Ok(Solution {
        id: challenge.id.clone(),
        plaintext,
    })
}
