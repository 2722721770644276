//! Decryption of stored configuration blobs: scrypt key stretching plus
//! AES-256-GCM, with the nonce carried as a 12-byte ciphertext prefix.

use aes_gcm::aead::{Aead as _, KeyInit as _};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use scrypt::Params;

const NONCE_LEN: usize = 12;
const SALT: &[u8] = b"unsalted";

/// Why a blob could not be decrypted.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Passphrases must be at least 8 bytes.
    #[error("passphrase is too short")]
    PassphraseTooShort,
    /// The ciphertext was not valid base64.
    #[error("could not decode ciphertext as base64: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The ciphertext is too short to carry a nonce.
    #[error("malformed ciphertext")]
    Malformed,
    /// Authentication failed: wrong key or tampered data.
    #[error("decryption failed")]
    Decrypt,
}

/// Stretches `passphrase` into a 32-byte key. The parameters (N=65536, r=8,
/// p=4) were picked by benchmark to cost about 64 MiB of memory and upwards
/// of half a second per derivation.
pub fn stretch(passphrase: &str) -> Result<[u8; 32], CryptoError> {
    if passphrase.len() < 8 {
        return Err(CryptoError::PassphraseTooShort);
    }
    let params = Params::new(16, 8, 4, 32).expect("fixed scrypt parameters are valid");
    let mut key = [0u8; 32];
    scrypt::scrypt(passphrase.as_bytes(), SALT, &params, &mut key)
        .expect("32 bytes is a valid scrypt output length");
    Ok(key)
}

/// Decrypts an AES-256-GCM blob whose first 12 bytes are the nonce. The
/// authentication tag also guards against alteration.
pub fn decrypt(ciphertext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < NONCE_LEN {
        return Err(CryptoError::Malformed);
    }
    let cipher = Aes256Gcm::new_from_slice(key).expect("key is 32 bytes");
    let (nonce, body) = ciphertext.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| CryptoError::Decrypt)
}

/// Decrypts a base64 string wrapping [`decrypt`]'s input format.
pub fn decrypt64(ciphertext: &str, key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    decrypt(&BASE64.decode(ciphertext)?, key)
}
