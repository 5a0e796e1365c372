// src/crypto.rs
// Crypto primitives for the workspace-mesh core (spec section 4.1)
//
// Every function here is pure/deterministic given its inputs except keypair
// generation, IV/salt generation, and GCM seal, which consume a
// cryptographic RNG. All failures collapse to `CryptoError`.

use crate::error::CryptoError;
use aes::Aes256;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce as GcmNonce,
};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

pub const AES_KEY_LEN: usize = 32;
pub const AES_IV_LEN: usize = 16;
pub const HMAC_KEY_LEN: usize = 32;
pub const PBKDF2_OUTPUT_LEN: usize = 64; // aes_key || hmac_key
pub const PBKDF2_ITERATIONS: u32 = 4096;
pub const GCM_NONCE_LEN: usize = 12;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Supported RSA modulus sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaKeySize {
    Bits2048,
    Bits4096,
}

impl RsaKeySize {
    fn bits(self) -> usize {
        match self {
            RsaKeySize::Bits2048 => 2048,
            RsaKeySize::Bits4096 => 4096,
        }
    }
}

/// An RSA keypair plus an identity. See SPEC_FULL.md's "Armor format
/// decision": keys are PKCS#1-PEM, the identity travels alongside the key
/// rather than embedded in the armor body.
pub struct RsaIdentity {
    pub name: String,
    pub email: String,
    pub private_key: RsaPrivateKey,
    pub public_key: RsaPublicKey,
}

/// Generate a fresh RSA keypair with the given size and identity.
pub fn generate_keypair(size: RsaKeySize, name: &str, email: &str) -> Result<RsaIdentity, CryptoError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, size.bits())
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let public_key = RsaPublicKey::from(&private_key);
    Ok(RsaIdentity {
        name: name.to_string(),
        email: email.to_string(),
        private_key,
        public_key,
    })
}

/// Armor a public key as a PEM string.
pub fn armor_public_key(key: &RsaPublicKey) -> Result<String, CryptoError> {
    key.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .map_err(|e| CryptoError::MalformedKey(e.to_string()))
}

/// Parse an armored public key back into an `RsaPublicKey`.
pub fn parse_public_key(armored: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_pkcs1_pem(armored).map_err(|e| CryptoError::MalformedKey(e.to_string()))
}

/// Armor a private key as a PEM string. Callers should treat the result as
/// sensitive and avoid logging it.
pub fn armor_private_key(key: &RsaPrivateKey) -> Result<Zeroizing<String>, CryptoError> {
    let pem = key
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
    Ok(Zeroizing::new(pem.to_string()))
}

/// Parse an armored private key back into an `RsaPrivateKey`.
pub fn parse_private_key(armored: &str) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs1_pem(armored).map_err(|e| CryptoError::MalformedKey(e.to_string()))
}

/// SHA-256 digest, hex-encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 digest, raw bytes.
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// `hex(SHA256(SHA256(password)))`, the invariant bound to
/// `WorkspaceSecurity::Password.hash`.
pub fn double_sha256_hex(password: &str) -> String {
    let first = sha256_bytes(password.as_bytes());
    sha256_hex(&first)
}

/// PBKDF2-HMAC-SHA-512, 4096 iterations, 64-byte output.
pub fn pbkdf2_derive(password: &str, salt: &[u8]) -> Zeroizing<[u8; PBKDF2_OUTPUT_LEN]> {
    let mut out = [0u8; PBKDF2_OUTPUT_LEN];
    pbkdf2::pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut out);
    Zeroizing::new(out)
}

/// Split a 64-byte PBKDF2 output into `(aes_key, hmac_key)`.
pub fn split_derived_key(derived: &[u8; PBKDF2_OUTPUT_LEN]) -> ([u8; AES_KEY_LEN], [u8; HMAC_KEY_LEN]) {
    let mut aes_key = [0u8; AES_KEY_LEN];
    let mut hmac_key = [0u8; HMAC_KEY_LEN];
    aes_key.copy_from_slice(&derived[0..AES_KEY_LEN]);
    hmac_key.copy_from_slice(&derived[AES_KEY_LEN..PBKDF2_OUTPUT_LEN]);
    (aes_key, hmac_key)
}

/// AES-256-CTR keystream XOR, in place.
pub fn aes_ctr_apply(key: &[u8; AES_KEY_LEN], iv: &[u8; AES_IV_LEN], buf: &mut [u8]) {
    let mut cipher = Aes256Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(buf);
}

/// Running HMAC-SHA256, fed with the ciphertext followed by the IV, per the
/// transfer trailer's `iv || hmac_tag` construction (spec 4.10).
pub struct HmacAccumulator(HmacSha256);

impl HmacAccumulator {
    pub fn new(key: &[u8; HMAC_KEY_LEN]) -> Self {
        HmacAccumulator(HmacSha256::new_from_slice(key).expect("HMAC accepts any key length"))
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        self.0.finalize().into_bytes().into()
    }
}

/// Constant-time comparison, used for trailer/tag verification.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// AES-256-GCM seal with a fresh random 12-byte nonce prefixed to the
/// ciphertext: `gcm_nonce || seal(key, gcm_nonce, plaintext)`.
pub fn gcm_seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;
    let mut nonce_bytes = [0u8; GCM_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = GcmNonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a `gcm_seal` envelope: split off the leading nonce, decrypt the rest.
pub fn gcm_open(key: &[u8; 32], envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < GCM_NONCE_LEN {
        return Err(CryptoError::Decrypt);
    }
    let (nonce_bytes, ciphertext) = envelope.split_at(GCM_NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    let nonce = GcmNonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

/// RSA-OAEP(SHA-256) encrypt.
pub fn rsa_oaep_encrypt(public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut rng = rand::thread_rng();
    let padding = Oaep::new::<Sha256>();
    public_key
        .encrypt(&mut rng, padding, plaintext)
        .map_err(|_| CryptoError::Encrypt)
}

/// RSA-OAEP(SHA-256) decrypt.
pub fn rsa_oaep_decrypt(private_key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let padding = Oaep::new::<Sha256>();
    private_key
        .decrypt(padding, ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

/// Generate `n` random bytes.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}
