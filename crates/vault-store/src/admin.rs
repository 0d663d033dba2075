//! Database lifecycle: init, open, change-password.
//!
//! These are the only code paths that ever see a user password. Once
//! [`open_store`] has unwrapped the DEK, steady-state filesystem traffic is
//! pure store transactions and can no longer fail authentication.

use std::fs;
use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use crate::auth::{self, AUTH_ARGON2_AES_CBC};
use crate::cipher::CIPHER_CHACHA20_POLY1305;
use crate::env::StoreEnv;
use crate::env_params::EnvParams;
use crate::params::FsParams;
use crate::{StoreError, StoreResult};

/// Parameters for creating a new database.
#[derive(Debug, Clone)]
pub struct InitParams {
    pub password: String,
    pub cipher_class: String,
    pub auth_class: String,
    pub page_size: i32,
}

impl InitParams {
    pub fn new(password: String) -> Self {
        Self {
            password,
            cipher_class: CIPHER_CHACHA20_POLY1305.to_string(),
            auth_class: AUTH_ARGON2_AES_CBC.to_string(),
            page_size: crate::params::DEFAULT_PAGE_SIZE,
        }
    }
}

/// Create a new database in the (existing, empty) directory `dir`.
pub fn init_store(dir: &Path, params: &InitParams) -> StoreResult<()> {
    if params.password.is_empty() {
        return Err(StoreError::Params(
            "non-empty password required".to_string(),
        ));
    }
    if !dir.exists() {
        return Err(StoreError::Params("init: path does not exist".to_string()));
    }
    if !dir.is_dir() {
        return Err(StoreError::Params(
            "init: path is not a directory".to_string(),
        ));
    }
    if fs::read_dir(dir)?.next().is_some() {
        return Err(StoreError::Params("init: path must be empty".to_string()));
    }

    let fs_params = FsParams::new(params.page_size)?;

    let iv = loop {
        let candidate = OsRng.next_u64();
        if candidate != 0 {
            break candidate;
        }
    };

    let mut auth = auth::make_instance(&params.auth_class)?;
    auth.init_new_env(&params.password)?;
    let dek_hex = auth.read_cipher(&params.password)?;

    let env_params = EnvParams::new(
        iv,
        params.cipher_class.clone(),
        params.auth_class.clone(),
        auth.store_env()?,
    )?;
    env_params.write_to_dir(dir)?;

    let dek = hex::decode(dek_hex)
        .map_err(|e| StoreError::Sidecar(format!("auth module returned non-hex dek: {e}")))?;
    let env = StoreEnv::open(dir, &env_params, &dek, false)?;
    env.write_fs_params(&fs_params)?;
    env.close();

    info!(path = %dir.display(), page_size = fs_params.page_size, "created database");
    Ok(())
}

/// Open an existing database, unwrapping the DEK with `password`.
pub fn open_store(dir: &Path, password: &str, readonly: bool) -> StoreResult<StoreEnv> {
    let env_params = EnvParams::read_from_dir(dir)?;

    let mut auth = auth::make_instance(&env_params.auth_class)?;
    auth.load_env(&env_params.auth_data)?;
    let dek_hex = auth.read_cipher(password)?;
    let dek = hex::decode(dek_hex)
        .map_err(|e| StoreError::Sidecar(format!("auth module returned non-hex dek: {e}")))?;

    let env = StoreEnv::open(dir, &env_params, &dek, readonly)?;
    debug!(path = %dir.display(), "unlocked database");
    Ok(env)
}

/// Rewrap the DEK under a new password. Rewrites only the sidecar; the
/// database contents are untouched and stay valid.
pub fn change_password(dir: &Path, old_password: &str, new_password: &str) -> StoreResult<()> {
    let env_params = EnvParams::read_from_dir(dir)?;

    let mut auth = auth::make_instance(&env_params.auth_class)?;
    auth.load_env(&env_params.auth_data)?;
    auth.change_password(old_password, new_password)?;

    let new_params = EnvParams::new(
        env_params.iv,
        env_params.cipher_class,
        env_params.auth_class,
        auth.store_env()?,
    )?;
    new_params.write_to_dir(dir)?;

    info!(path = %dir.display(), "password changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Table;
    use tempfile::TempDir;

    fn init_params() -> InitParams {
        InitParams::new("test-password".to_string())
    }

    #[test]
    fn init_then_open() {
        let dir = TempDir::new().unwrap();
        init_store(dir.path(), &init_params()).unwrap();

        let env = open_store(dir.path(), "test-password", false).unwrap();
        let params = env.read_fs_params().unwrap().unwrap();
        assert_eq!(params.version, crate::params::FORMAT_VERSION);
        assert_eq!(params.page_size, crate::params::DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn init_refuses_non_empty_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("occupied"), b"x").unwrap();
        assert!(init_store(dir.path(), &init_params()).is_err());
    }

    #[test]
    fn open_with_wrong_password_fails() {
        let dir = TempDir::new().unwrap();
        init_store(dir.path(), &init_params()).unwrap();
        assert!(matches!(
            open_store(dir.path(), "nope", false),
            Err(StoreError::Auth(_))
        ));
    }

    #[test]
    fn open_without_sidecar_fails() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            open_store(dir.path(), "pw", false),
            Err(StoreError::Sidecar(_))
        ));
    }

    #[test]
    fn change_password_keeps_data_readable() {
        let dir = TempDir::new().unwrap();
        init_store(dir.path(), &init_params()).unwrap();

        {
            let env = open_store(dir.path(), "test-password", false).unwrap();
            env.execute_write(|txn| txn.put(Table::Meta, b"marker", b"survives"))
                .unwrap();
            env.close();
        }

        change_password(dir.path(), "test-password", "rotated").unwrap();

        assert!(matches!(
            open_store(dir.path(), "test-password", false),
            Err(StoreError::Auth(_))
        ));

        let env = open_store(dir.path(), "rotated", false).unwrap();
        let value = env
            .execute_read(|txn| txn.get(Table::Meta, b"marker"))
            .unwrap();
        assert_eq!(value.as_deref(), Some(&b"survives"[..]));
    }

    #[test]
    fn change_password_requires_old_password() {
        let dir = TempDir::new().unwrap();
        init_store(dir.path(), &init_params()).unwrap();
        assert!(change_password(dir.path(), "wrong", "new").is_err());
    }
}
