//! # vault-core
//!
//! The filesystem translation layer of vaultfs: maps path-addressed
//! POSIX-style operations onto four logical tables inside the encrypted
//! store — paths, inodes, data pages and data lengths.
//!
//! The entry point is [`VaultFs`], opened over an unlocked
//! [`vault_store::StoreEnv`]. Each public operation runs as one store
//! transaction; the individual table stores ([`inode_store::InodeStore`],
//! [`path_store::PathStore`], [`data_store::DataStore`]) never open
//! transactions themselves.

pub mod data_store;
pub mod error;
pub mod fs;
pub mod inode;
pub mod inode_store;
pub mod path_key;
pub mod path_store;

pub use error::{FileOpError, OpResult, VaultError, VaultResult};
pub use fs::{StatfsInfo, TableSizes, VaultFs, VERSION};
pub use inode::{InodeEntry, InodeType, ROOT_INODE};
pub use path_key::PathKey;
