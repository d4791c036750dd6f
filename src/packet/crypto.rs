//! Authenticated packet encryption.
//!
//! Frames are sealed with XChaCha20-Poly1305 under a key derived from the
//! shared encryption token. The sealed layout is a 24-byte random nonce
//! followed by ciphertext and the 16-byte tag; [`ENCRYPTION_HEADER_SIZE`] is
//! the fixed overhead every sealed frame carries.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{Error, Result};

/// Bytes of the random AEAD nonce leading every sealed frame.
pub const NONCE_SIZE: usize = 24;

/// Bytes of the Poly1305 authentication tag.
pub const TAG_SIZE: usize = 16;

/// Fixed per-frame overhead: nonce plus tag.
pub const ENCRYPTION_HEADER_SIZE: usize = NONCE_SIZE + TAG_SIZE;

fn derive_key(token: &str) -> Key {
    let digest = Sha256::digest(token.as_bytes());
    Key::clone_from_slice(&digest)
}

/// Seals `plaintext` under `token` with a fresh random nonce.
pub fn seal(token: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(&derive_key(token));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|_| Error::DecryptFailed)?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Opens a sealed frame; fails with [`Error::DecryptFailed`] on a wrong token
/// or tampered data.
pub fn open(token: &str, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < ENCRYPTION_HEADER_SIZE {
        return Err(Error::Malformed);
    }

    let cipher = XChaCha20Poly1305::new(&derive_key(token));
    let nonce = XNonce::from_slice(&sealed[..NONCE_SIZE]);
    cipher.decrypt(nonce, &sealed[NONCE_SIZE..]).map_err(|_| Error::DecryptFailed)
}
