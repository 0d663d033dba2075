//! # vault-store
//!
//! Encrypted transactional key-value backend for vaultfs.
//!
//! A vaultfs database is a directory holding an LMDB environment plus a small
//! plaintext sidecar (`jcxfs.env`). The sidecar carries everything needed to
//! *unlock* the store: a cipher identifier, a stream IV, and the
//! password-wrapped data encryption key. Every record value written through
//! [`StoreTxn`] is sealed with an AEAD under the DEK before it reaches LMDB,
//! so names, file contents and metadata are never stored in the clear.
//!
//! Layout of a database directory:
//!
//! ```text
//! <db>/
//! ├── jcxfs.env    # sidecar: iv, cipher_class, auth_class, auth_data
//! ├── data.mdb     # LMDB data file (sealed record values)
//! ├── lock.mdb     # LMDB reader table
//! └── vaultfs.lck  # exclusive process lock
//! ```

pub mod admin;
pub mod auth;
pub mod cipher;
pub mod env;
pub mod env_params;
pub mod params;

pub use admin::{change_password, init_store, open_store, InitParams};
pub use auth::{AuthError, AuthMachine};
pub use cipher::RecordCipher;
pub use env::{StoreEnv, StoreTxn, Table};
pub use env_params::EnvParams;
pub use params::FsParams;

use thiserror::Error;

/// Errors raised by the store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("lmdb error: {0}")]
    Lmdb(#[from] heed::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("record cipher failure: {0}")]
    Cipher(String),

    #[error("sidecar error: {0}")]
    Sidecar(String),

    #[error("store is closed")]
    Closed,

    #[error("store is read-only")]
    ReadOnly,

    #[error("write attempted inside a read transaction")]
    ReadOnlyTxn,

    #[error("database locked by another process: {0}")]
    Locked(String),

    #[error("invalid store parameters: {0}")]
    Params(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
