//! Error taxonomy of the filesystem translation layer.

use thiserror::Error;
use vault_store::StoreError;

/// Operation-level failures. The host binding maps each kind onto one errno.
#[derive(Error, Debug)]
pub enum FileOpError {
    #[error("no such file: {0}")]
    NoSuchFile(String),

    #[error("no such directory: {0}")]
    NoSuchDir(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("directory not empty: {0}")]
    DirNotEmpty(String),

    #[error("file exists: {0}")]
    FileExists(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Catch-all for store failures and invariant violations that should be
    /// impossible on an intact database.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<StoreError> for FileOpError {
    fn from(e: StoreError) -> Self {
        FileOpError::Io(e.to_string())
    }
}

pub type OpResult<T> = std::result::Result<T, FileOpError>;

/// Open-time failures. Distinct from [`FileOpError`]: these can only happen
/// before a mount exists.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("database has no stored parameters; not initialized?")]
    NotInitialized,

    #[error("unknown database version '{0}'")]
    BadVersion(u32),

    #[error("{0}")]
    Setup(String),
}

impl From<FileOpError> for VaultError {
    fn from(e: FileOpError) -> Self {
        VaultError::Setup(e.to_string())
    }
}

pub type VaultResult<T> = std::result::Result<T, VaultError>;
