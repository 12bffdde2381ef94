//! Public-key sealing for private-mode payloads.
//!
//! Ephemeral x25519 ECDH, SHA-256 of the shared secret as the AEAD key,
//! ChaCha20-Poly1305 for the payload. Wire format:
//! `ephemeral_pub(32) || nonce(12) || ciphertext`.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

pub const PUBLIC_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SealError {
    #[error("sealed payload too short")]
    TooShort,

    #[error("authentication failed")]
    Aead,

    #[error("recipient key must be {PUBLIC_KEY_LEN} bytes, got {0}")]
    BadKeyLength(usize),
}

fn derive_key(shared: &[u8; 32]) -> Key {
    let digest = Sha256::digest(shared);
    Key::clone_from_slice(&digest)
}

/// Seal `plaintext` to the holder of the x25519 secret matching `recipient`.
pub fn seal(recipient: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
    let recipient: [u8; PUBLIC_KEY_LEN] = recipient
        .try_into()
        .map_err(|_| SealError::BadKeyLength(recipient.len()))?;

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient));

    let cipher = ChaCha20Poly1305::new(&derive_key(shared.as_bytes()));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| SealError::Aead)?;

    let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_pub.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a payload sealed to `secret`'s public key.
pub fn open(secret: &StaticSecret, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
    if sealed.len() < PUBLIC_KEY_LEN + NONCE_LEN {
        return Err(SealError::TooShort);
    }

    let mut ephemeral_pub = [0u8; PUBLIC_KEY_LEN];
    ephemeral_pub.copy_from_slice(&sealed[..PUBLIC_KEY_LEN]);
    let nonce = &sealed[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + NONCE_LEN];
    let ciphertext = &sealed[PUBLIC_KEY_LEN + NONCE_LEN..];

    let shared = secret.diffie_hellman(&PublicKey::from(ephemeral_pub));
    let cipher = ChaCha20Poly1305::new(&derive_key(shared.as_bytes()));

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SealError::Aead)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_roundtrips() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let sealed = seal(public.as_bytes(), b"the prompt").unwrap();
        let opened = open(&secret, &sealed).unwrap();
        assert_eq!(opened, b"the prompt");
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let alice = StaticSecret::random_from_rng(OsRng);
        let mallory = StaticSecret::random_from_rng(OsRng);
        let sealed = seal(PublicKey::from(&alice).as_bytes(), b"secret").unwrap();

        assert!(matches!(open(&mallory, &sealed), Err(SealError::Aead)));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let mut sealed = seal(PublicKey::from(&secret).as_bytes(), b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(open(&secret, &sealed).is_err());
    }

    #[test]
    fn truncated_payload_is_too_short() {
        let secret = StaticSecret::random_from_rng(OsRng);
        assert!(matches!(
            open(&secret, &[0u8; 20]),
            Err(SealError::TooShort)
        ));
    }
}
