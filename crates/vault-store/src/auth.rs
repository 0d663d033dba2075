//! Password key hierarchy.
//!
//! Two keys protect a database. The DEK (data encryption key) is 32 random
//! bytes generated once at init and used by the record cipher for the life of
//! the database. The KEK (key encryption key) is derived from the user
//! password and a random salt with Argon2 and is only ever used to wrap the
//! DEK. Changing the password regenerates the salt and rewraps the DEK; the
//! data itself is never re-encrypted.
//!
//! A wrong password is detected by the PKCS7 padding check failing during DEK
//! unwrap. No separate password verifier is stored.

use aes::Aes128;
use argon2::Argon2;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockModeDecrypt, BlockModeEncrypt, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Identifier stored in the sidecar `auth_class` field.
pub const AUTH_ARGON2_AES_CBC: &str = "argon2-aes-cbc";

const SALT_LEN: usize = 64;
const DEK_LEN: usize = 32;
const KEK_LEN: usize = 16;
const WRAP_IV_LEN: usize = 16;
const STATE_VERSION: &str = "1";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("auth failure: {0}")]
    Failed(String),

    #[error("malformed auth state: {0}")]
    Malformed(String),

    #[error("auth module not initialized")]
    NotInitialized,
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// Contract of an auth module: wraps the DEK under a password and hands the
/// unwrapped DEK back when the right password is supplied.
pub trait AuthMachine {
    /// Generate a fresh salt and DEK and wrap the DEK under `password`.
    fn init_new_env(&mut self, password: &str) -> AuthResult<()>;

    /// Unwrap and return the DEK as hex. Fails on a wrong password.
    fn read_cipher(&self, password: &str) -> AuthResult<String>;

    /// Rewrap the DEK under `new_password` with a fresh salt.
    fn change_password(&mut self, old_password: &str, new_password: &str) -> AuthResult<()>;

    /// Load previously stored state. Parse-only; no password verification.
    fn load_env(&mut self, state: &str) -> AuthResult<()>;

    /// Serialize the current state for the sidecar.
    fn store_env(&self) -> AuthResult<String>;
}

/// Instantiate the auth module named by a sidecar `auth_class` identifier.
pub fn make_instance(auth_class: &str) -> AuthResult<Box<dyn AuthMachine>> {
    match auth_class {
        AUTH_ARGON2_AES_CBC => Ok(Box::new(ArgonAuthMachine::default())),
        other => Err(AuthError::Malformed(format!(
            "unknown auth_class '{other}'"
        ))),
    }
}

#[derive(Serialize, Deserialize, Clone)]
struct AuthState {
    version: String,
    salt: String,
    #[serde(rename = "wrappedDek")]
    wrapped_dek: String,
}

/// Argon2 KEK derivation with AES-128-CBC/PKCS7 DEK wrapping.
#[derive(Default)]
pub struct ArgonAuthMachine {
    state: Option<AuthState>,
}

impl ArgonAuthMachine {
    fn state(&self) -> AuthResult<&AuthState> {
        self.state.as_ref().ok_or(AuthError::NotInitialized)
    }

    fn derive_kek(password: &str, salt: &[u8]) -> AuthResult<[u8; KEK_LEN]> {
        let mut kek = [0u8; KEK_LEN];
        Argon2::default()
            .hash_password_into(password.as_bytes(), salt, &mut kek)
            .map_err(|e| AuthError::Failed(format!("kdf failure: {e}")))?;
        Ok(kek)
    }

    /// Wrap the DEK: output is `iv(16) ‖ AES-CBC(dek)`, hex-encoded.
    fn wrap_dek(dek: &[u8], kek: &[u8; KEK_LEN]) -> String {
        let mut iv = [0u8; WRAP_IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext =
            Aes128CbcEnc::new(kek.into(), &iv.into()).encrypt_padded_vec::<Pkcs7>(dek);

        let mut blob = Vec::with_capacity(WRAP_IV_LEN + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        hex::encode(blob)
    }

    fn unwrap_dek(wrapped_hex: &str, kek: &[u8; KEK_LEN]) -> AuthResult<Vec<u8>> {
        let blob = hex::decode(wrapped_hex)
            .map_err(|e| AuthError::Malformed(format!("wrapped dek not hex: {e}")))?;
        if blob.len() <= WRAP_IV_LEN {
            return Err(AuthError::Malformed("wrapped dek too short".to_string()));
        }
        let mut iv = [0u8; WRAP_IV_LEN];
        iv.copy_from_slice(&blob[..WRAP_IV_LEN]);

        Aes128CbcDec::new(kek.into(), &iv.into())
            .decrypt_padded_vec::<Pkcs7>(&blob[WRAP_IV_LEN..])
            .map_err(|_| AuthError::Failed("dek unwrap failed (password incorrect?)".to_string()))
    }

    fn read_dek_bytes(&self, password: &str) -> AuthResult<Vec<u8>> {
        let state = self.state()?;
        let salt = hex::decode(&state.salt)
            .map_err(|e| AuthError::Malformed(format!("salt not hex: {e}")))?;
        let kek = Self::derive_kek(password, &salt)?;
        let dek = Self::unwrap_dek(&state.wrapped_dek, &kek)?;
        if dek.len() != DEK_LEN {
            return Err(AuthError::Malformed(format!(
                "unwrapped dek has length {}",
                dek.len()
            )));
        }
        Ok(dek)
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut bytes);
        bytes
    }
}

impl AuthMachine for ArgonAuthMachine {
    fn init_new_env(&mut self, password: &str) -> AuthResult<()> {
        if password.is_empty() {
            return Err(AuthError::Failed("non-empty password required".to_string()));
        }

        let salt = Self::random_bytes(SALT_LEN);
        let dek = Self::random_bytes(DEK_LEN);

        let kek = Self::derive_kek(password, &salt)?;
        let wrapped_dek = Self::wrap_dek(&dek, &kek);

        tracing::debug!("initialized new auth state");
        self.state = Some(AuthState {
            version: STATE_VERSION.to_string(),
            salt: hex::encode(salt),
            wrapped_dek,
        });
        Ok(())
    }

    fn read_cipher(&self, password: &str) -> AuthResult<String> {
        Ok(hex::encode(self.read_dek_bytes(password)?))
    }

    fn change_password(&mut self, old_password: &str, new_password: &str) -> AuthResult<()> {
        if new_password.is_empty() {
            return Err(AuthError::Failed("non-empty password required".to_string()));
        }
        let dek = self.read_dek_bytes(old_password)?;

        let salt = Self::random_bytes(SALT_LEN);
        let kek = Self::derive_kek(new_password, &salt)?;
        let wrapped_dek = Self::wrap_dek(&dek, &kek);

        self.state = Some(AuthState {
            version: STATE_VERSION.to_string(),
            salt: hex::encode(salt),
            wrapped_dek,
        });
        Ok(())
    }

    fn load_env(&mut self, state: &str) -> AuthResult<()> {
        let parsed: AuthState = serde_json::from_str(state)
            .map_err(|e| AuthError::Malformed(format!("state parse error: {e}")))?;
        if parsed.version != STATE_VERSION {
            return Err(AuthError::Malformed(format!(
                "unknown auth state version '{}'",
                parsed.version
            )));
        }
        self.state = Some(parsed);
        Ok(())
    }

    fn store_env(&self) -> AuthResult<String> {
        let state = self.state()?;
        serde_json::to_string(state)
            .map_err(|e| AuthError::Malformed(format!("state serialize error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_and_read_back_dek() {
        let mut auth = ArgonAuthMachine::default();
        auth.init_new_env("secret").unwrap();
        let dek = auth.read_cipher("secret").unwrap();
        assert_eq!(dek.len(), DEK_LEN * 2);
        // stable across reads
        assert_eq!(dek, auth.read_cipher("secret").unwrap());
    }

    #[test]
    fn wrong_password_fails() {
        let mut auth = ArgonAuthMachine::default();
        auth.init_new_env("secret").unwrap();
        assert!(auth.read_cipher("wrong").is_err());
    }

    #[test]
    fn empty_password_rejected() {
        let mut auth = ArgonAuthMachine::default();
        assert!(auth.init_new_env("").is_err());
    }

    #[test]
    fn change_password_preserves_dek() {
        let mut auth = ArgonAuthMachine::default();
        auth.init_new_env("old").unwrap();
        let dek = auth.read_cipher("old").unwrap();

        auth.change_password("old", "new").unwrap();
        assert_eq!(dek, auth.read_cipher("new").unwrap());
        assert!(auth.read_cipher("old").is_err());
    }

    #[test]
    fn change_password_requires_old() {
        let mut auth = ArgonAuthMachine::default();
        auth.init_new_env("old").unwrap();
        assert!(auth.change_password("wrong", "new").is_err());
    }

    #[test]
    fn state_roundtrip_through_serialization() {
        let mut auth = ArgonAuthMachine::default();
        auth.init_new_env("secret").unwrap();
        let blob = auth.store_env().unwrap();

        let mut reloaded = ArgonAuthMachine::default();
        reloaded.load_env(&blob).unwrap();
        assert_eq!(
            auth.read_cipher("secret").unwrap(),
            reloaded.read_cipher("secret").unwrap()
        );
    }

    #[test]
    fn unknown_auth_class_rejected() {
        assert!(make_instance("plaintext").is_err());
    }
}
