//! External sidecar parameters.
//!
//! The sidecar is the only plaintext file in a database directory. It holds
//! what is needed to open the store before any password is verified: the
//! stream IV, the cipher and auth module identifiers, and the opaque wrapped
//! key blob of the auth module. Removing or editing the sidecar makes the
//! database permanently unopenable.

use std::fs;
use std::path::Path;

use crate::{StoreError, StoreResult};

/// Sidecar file name inside a database directory.
pub const ENV_FILE_NAME: &str = "jcxfs.env";

const KEY_IV: &str = "iv";
const KEY_CIPHER_CLASS: &str = "cipher_class";
const KEY_AUTH_CLASS: &str = "auth_class";
const KEY_AUTH_DATA: &str = "auth_data";

const HEADER_COMMENT: &str =
    "# Parameters for the vaultfs database. The database can not be opened if this file is modified or removed.";

/// Contents of the `jcxfs.env` sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvParams {
    pub iv: u64,
    pub cipher_class: String,
    pub auth_class: String,
    pub auth_data: String,
}

impl EnvParams {
    pub fn new(
        iv: u64,
        cipher_class: String,
        auth_class: String,
        auth_data: String,
    ) -> StoreResult<Self> {
        if iv == 0 {
            return Err(StoreError::Sidecar("non-zero iv value required".to_string()));
        }
        if cipher_class.is_empty() || auth_class.is_empty() {
            return Err(StoreError::Sidecar(
                "cipher_class and auth_class are required".to_string(),
            ));
        }
        Ok(Self {
            iv,
            cipher_class,
            auth_class,
            auth_data,
        })
    }

    pub fn write_to_dir(&self, dir: &Path) -> StoreResult<()> {
        let body = format!(
            "{HEADER_COMMENT}\n{KEY_IV}={:016x}\n{KEY_CIPHER_CLASS}={}\n{KEY_AUTH_CLASS}={}\n{KEY_AUTH_DATA}={}\n",
            self.iv, self.cipher_class, self.auth_class, self.auth_data,
        );
        fs::write(dir.join(ENV_FILE_NAME), body)?;
        Ok(())
    }

    pub fn read_from_dir(dir: &Path) -> StoreResult<Self> {
        let path = dir.join(ENV_FILE_NAME);
        if !path.exists() {
            return Err(StoreError::Sidecar(format!(
                "{ENV_FILE_NAME} not found, unable to open database"
            )));
        }
        let body = fs::read_to_string(&path)?;

        let mut iv = None;
        let mut cipher_class = None;
        let mut auth_class = None;
        let mut auth_data = None;

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(StoreError::Sidecar(format!(
                    "malformed sidecar line: '{line}'"
                )));
            };
            match key.trim() {
                KEY_IV => {
                    let parsed = u64::from_str_radix(value.trim(), 16).map_err(|e| {
                        StoreError::Sidecar(format!("unparseable iv value: {e}"))
                    })?;
                    iv = Some(parsed);
                }
                KEY_CIPHER_CLASS => cipher_class = Some(value.trim().to_string()),
                KEY_AUTH_CLASS => auth_class = Some(value.trim().to_string()),
                KEY_AUTH_DATA => auth_data = Some(value.trim().to_string()),
                // tolerate unknown keys for forward compatibility
                _ => {}
            }
        }

        match (iv, cipher_class, auth_class, auth_data) {
            (Some(iv), Some(cipher_class), Some(auth_class), Some(auth_data)) => {
                Self::new(iv, cipher_class, auth_class, auth_data)
            }
            _ => Err(StoreError::Sidecar(format!(
                "{ENV_FILE_NAME} is missing required fields"
            ))),
        }
    }
}
