//! Record-level sealing.
//!
//! Every value stored through [`crate::StoreTxn`] passes through a
//! [`RecordCipher`]: ChaCha20-Poly1305 under the database's DEK, with a fresh
//! random 12-byte nonce prepended to each ciphertext. The sidecar IV and the
//! owning table are bound in as associated data, so a record cannot be
//! replayed into a different table or a different database.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::{StoreError, StoreResult};

/// Identifier stored in the sidecar `cipher_class` field.
pub const CIPHER_CHACHA20_POLY1305: &str = "chacha20-poly1305";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Sealing overhead per record in bytes.
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Seals and opens record values under the data encryption key.
pub struct RecordCipher {
    cipher: ChaCha20Poly1305,
    iv: u64,
}

impl RecordCipher {
    /// Build a cipher from a sidecar `cipher_class` identifier.
    pub fn from_id(id: &str, dek: &[u8], iv: u64) -> StoreResult<Self> {
        match id {
            CIPHER_CHACHA20_POLY1305 => Self::new(dek, iv),
            other => Err(StoreError::Cipher(format!(
                "unknown cipher_class '{other}'"
            ))),
        }
    }

    pub fn new(dek: &[u8], iv: u64) -> StoreResult<Self> {
        if dek.len() != 32 {
            return Err(StoreError::Cipher(format!(
                "dek must be 32 bytes, got {}",
                dek.len()
            )));
        }
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(dek)),
            iv,
        })
    }

    fn aad(&self, table_tag: u8) -> [u8; 9] {
        let mut aad = [0u8; 9];
        aad[..8].copy_from_slice(&self.iv.to_be_bytes());
        aad[8] = table_tag;
        aad
    }

    /// Seal a plaintext value: `nonce(12) ‖ aead(plaintext)`.
    pub fn seal(&self, table_tag: u8, plaintext: &[u8]) -> StoreResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let aad = self.aad(table_tag);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| StoreError::Cipher("seal failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed value; the first 12 bytes are the nonce.
    pub fn open(&self, table_tag: u8, sealed: &[u8]) -> StoreResult<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(StoreError::Cipher("sealed record too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let aad = self.aad(table_tag);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| StoreError::Cipher("record authentication failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> RecordCipher {
        RecordCipher::new(&[7u8; 32], 0x1122_3344_5566_7788).unwrap()
    }

    #[test]
    fn seal_open_roundtrip() {
        let c = cipher();
        let sealed = c.seal(3, b"hello world").unwrap();
        assert_eq!(sealed.len(), b"hello world".len() + SEAL_OVERHEAD);
        assert_eq!(c.open(3, &sealed).unwrap(), b"hello world");
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let c = cipher();
        let sealed = c.seal(0, b"").unwrap();
        assert_eq!(c.open(0, &sealed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn wrong_table_tag_rejected() {
        let c = cipher();
        let sealed = c.seal(1, b"payload").unwrap();
        assert!(c.open(2, &sealed).is_err());
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let c = cipher();
        let mut sealed = c.seal(1, b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(c.open(1, &sealed).is_err());
    }

    #[test]
    fn wrong_key_rejected() {
        let sealed = cipher().seal(1, b"payload").unwrap();
        let other = RecordCipher::new(&[8u8; 32], 0x1122_3344_5566_7788).unwrap();
        assert!(other.open(1, &sealed).is_err());
    }

    #[test]
    fn unknown_cipher_class_rejected() {
        assert!(RecordCipher::from_id("rot13", &[0u8; 32], 1).is_err());
    }
}
