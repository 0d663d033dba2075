//! The filesystem facade.
//!
//! Every public operation here is the body of exactly one store transaction:
//! it resolves paths, checks types, and mutates the inode/path/data tables
//! together. A successful return means the transaction committed; any error
//! aborts it and leaves the database unchanged.

use std::io::Write;

use tracing::{debug, info};
use vault_store::{StoreEnv, Table};

use crate::data_store::{DataKey, DataStore};
use crate::error::{FileOpError, OpResult, VaultError, VaultResult};
use crate::inode::{key_to_id, pretty_id, InodeEntry};
use crate::inode_store::InodeStore;
use crate::path_key::PathKey;
use crate::path_store::{PathRecord, PathStore};

/// Current database format version accepted by this build.
pub const VERSION: u32 = 1;

/// What `statfs` needs to report.
#[derive(Debug, Clone, Copy)]
pub struct StatfsInfo {
    pub page_size: i32,
    pub pages_used: u64,
}

/// Record counts per logical table, for logs and the stats command.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableSizes {
    pub files: u64,
    pub inodes: u64,
    pub paths: u64,
}

pub struct VaultFs {
    env: StoreEnv,
    path_store: PathStore,
    inode_store: InodeStore,
    data_store: DataStore,
}

impl VaultFs {
    /// Open the filesystem over an unlocked store environment.
    pub fn open(env: StoreEnv) -> VaultResult<Self> {
        let params = env
            .read_fs_params()?
            .ok_or(VaultError::NotInitialized)?;
        if params.version != VERSION {
            return Err(VaultError::BadVersion(params.version));
        }

        let inode_store = InodeStore::open(&env)?;
        let path_store = PathStore::new();
        let data_store = DataStore::new(params.page_size);

        let fs = Self {
            env,
            path_store,
            inode_store,
            data_store,
        };
        debug!(page_size = params.page_size, "opened filesystem");
        if let Ok(sizes) = fs.sizes() {
            info!(
                files = sizes.files,
                inodes = sizes.inodes,
                paths = sizes.paths,
                "opened with"
            );
        }
        Ok(fs)
    }

    pub fn page_size(&self) -> i32 {
        self.data_store.page_size()
    }

    pub fn is_readonly(&self) -> bool {
        self.env.is_readonly()
    }

    /// Resolve `path` to its inode id; `None` when any segment is missing.
    pub fn resolve_path(&self, path: &str) -> OpResult<Option<u64>> {
        let path = PathKey::new(path)?;
        self.env
            .execute_read(|txn| self.path_store.read_entry(txn, &path))
    }

    /// Logical length of the file at `path`; `None` when the path is missing.
    pub fn file_length(&self, path: &str) -> OpResult<Option<u64>> {
        let path = PathKey::new(path)?;
        self.env.execute_read(|txn| {
            match self.path_store.read_entry(txn, &path)? {
                Some(id) => Ok(Some(self.data_store.length(txn, id)?)),
                None => Ok(None),
            }
        })
    }

    /// Inode record at `path`; `None` when the path is missing.
    pub fn read_attrs(&self, path: &str) -> OpResult<Option<InodeEntry>> {
        let path = PathKey::new(path)?;
        self.env.execute_read(|txn| {
            match self.path_store.read_entry(txn, &path)? {
                Some(id) => self.inode_store.read_entry(txn, id),
                None => Ok(None),
            }
        })
    }

    /// Replace the inode record at `path`.
    pub fn write_attrs(&self, path: &str, attrs: &InodeEntry) -> OpResult<()> {
        let path = PathKey::new(path)?;
        self.env.execute_write(|txn| {
            let id = self
                .path_store
                .read_entry(txn, &path)?
                .ok_or_else(|| FileOpError::NoSuchFile("path does not exist".to_string()))?;
            self.inode_store.update_entry(txn, id, attrs)
        })
    }

    /// Child names of the directory at `path`, in storage order.
    pub fn directory_listing(&self, path: &str) -> OpResult<Vec<String>> {
        let path = PathKey::new(path)?;
        self.env
            .execute_read(|txn| self.path_store.read_sub_paths(txn, &path))
    }

    pub fn create_directory_entry(&self, path: &str, mode: u32) -> OpResult<()> {
        self.create_entry_impl(path, InodeEntry::new_directory_with_mode(mode))
    }

    pub fn create_file_entry(&self, path: &str, mode: u32) -> OpResult<()> {
        self.create_entry_impl(path, InodeEntry::new_file_with_mode(mode))
    }

    /// Create a symlink at `link_path` pointing at `target`.
    pub fn create_sym_link(&self, link_path: &str, target: &str) -> OpResult<()> {
        self.create_entry_impl(link_path, InodeEntry::new_link(target))
    }

    fn create_entry_impl(&self, path: &str, new_entry: InodeEntry) -> OpResult<()> {
        let path = PathKey::new(path)?;
        self.env.execute_write(|txn| {
            let parent = path
                .parent()
                .ok_or_else(|| FileOpError::FileExists("can not create root".to_string()))?;
            let parent_id = self
                .path_store
                .read_entry(txn, &parent)?
                .ok_or_else(|| FileOpError::NoSuchDir("parent path does not exist".to_string()))?;
            let parent_entry = self
                .inode_store
                .read_entry(txn, parent_id)?
                .ok_or_else(|| {
                    FileOpError::Io("missing inode entry for parent path".to_string())
                })?;

            if !parent_entry.is_directory() {
                return Err(FileOpError::NotADirectory(
                    "parent path is not a directory".to_string(),
                ));
            }

            let new_id = self.inode_store.next_id(txn)?;
            self.path_store.create_entry(txn, &path, new_id)?;
            self.inode_store.create_entry(txn, new_id, &new_entry)?;
            self.inode_store
                .update_entry(txn, parent_id, &parent_entry.with_mtime_now())?;
            debug!(path = %path, id = %pretty_id(new_id), "created entry");
            Ok(())
        })
    }

    /// Remove the file or symlink at `path`, including its data pages.
    pub fn remove_file_entry(&self, path: &str) -> OpResult<()> {
        let path = PathKey::new(path)?;
        self.env.execute_write(|txn| {
            let node_id = self
                .path_store
                .read_entry(txn, &path)?
                .ok_or_else(|| FileOpError::NoSuchFile("file does not exist".to_string()))?;

            let parent = path
                .parent()
                .ok_or_else(|| FileOpError::FileExists("can not remove root".to_string()))?;
            let parent_id = self
                .path_store
                .read_entry(txn, &parent)?
                .ok_or_else(|| {
                    FileOpError::NoSuchDir("parent directory does not exist".to_string())
                })?;

            let entry = self
                .inode_store
                .read_entry(txn, node_id)?
                .ok_or_else(|| FileOpError::NoSuchFile("no such file".to_string()))?;

            if !entry.is_file() && !entry.is_link() {
                return Err(FileOpError::NotAFile("path is not a file".to_string()));
            }

            self.inode_store.remove_entry(txn, node_id)?;
            self.path_store.remove_entry(txn, &path)?;
            self.refresh_mtime(txn, parent_id)?;
            self.data_store.delete_entry(txn, node_id)?;
            debug!(path = %path, "removed file entry");
            Ok(())
        })
    }

    /// Remove the empty directory at `path`.
    pub fn remove_directory_entry(&self, path: &str) -> OpResult<()> {
        let path = PathKey::new(path)?;
        self.env.execute_write(|txn| {
            let parent = path
                .parent()
                .ok_or_else(|| FileOpError::FileExists("can not remove root".to_string()))?;
            let parent_id = self
                .path_store
                .read_entry(txn, &parent)?
                .ok_or_else(|| {
                    FileOpError::NoSuchDir("parent directory does not exist".to_string())
                })?;

            let node_id = self
                .path_store
                .read_entry(txn, &path)?
                .ok_or_else(|| FileOpError::NoSuchDir("directory does not exist".to_string()))?;
            let entry = self
                .inode_store
                .read_entry(txn, node_id)?
                .ok_or_else(|| FileOpError::Io("missing inode entry for path".to_string()))?;

            if !entry.is_directory() {
                return Err(FileOpError::NotADirectory(
                    "path is not a directory".to_string(),
                ));
            }

            if !self.path_store.read_sub_paths(txn, &path)?.is_empty() {
                return Err(FileOpError::DirNotEmpty("directory not empty".to_string()));
            }

            self.path_store.remove_entry(txn, &path)?;
            self.inode_store.remove_entry(txn, node_id)?;
            self.refresh_mtime(txn, parent_id)?;
            debug!(path = %path, "removed directory entry");
            Ok(())
        })
    }

    /// Random-access read from the regular file at `path`.
    pub fn read(&self, path: &str, count: u64, offset: u64) -> OpResult<Vec<u8>> {
        let path = PathKey::new(path)?;
        self.env.execute_read(|txn| {
            let node_id = self
                .path_store
                .read_entry(txn, &path)?
                .ok_or_else(|| FileOpError::NoSuchFile("file does not exist".to_string()))?;
            let entry = self
                .inode_store
                .read_entry(txn, node_id)?
                .ok_or_else(|| FileOpError::NoSuchFile("no such file".to_string()))?;
            if !entry.is_file() {
                return Err(FileOpError::NotAFile("path is not a file".to_string()));
            }
            self.data_store.read_data(txn, node_id, count, offset)
        })
    }

    /// Random-access write to the regular file at `path`.
    pub fn write_file_data(&self, path: &str, buf: &[u8], offset: u64) -> OpResult<usize> {
        let path = PathKey::new(path)?;
        self.env.execute_write(|txn| {
            let node_id = self
                .path_store
                .read_entry(txn, &path)?
                .ok_or_else(|| FileOpError::NoSuchFile("file does not exist".to_string()))?;
            let entry = self
                .inode_store
                .read_entry(txn, node_id)?
                .ok_or_else(|| FileOpError::NoSuchFile("no such file".to_string()))?;
            if !entry.is_file() {
                return Err(FileOpError::NotAFile("path is not a file".to_string()));
            }

            let bytes_written = self.data_store.write_data(txn, node_id, buf, offset)?;
            self.inode_store
                .update_entry(txn, node_id, &entry.with_mtime_now())?;
            Ok(bytes_written)
        })
    }

    /// Shrink the file at `path` to `size` bytes.
    pub fn truncate(&self, path: &str, size: u64) -> OpResult<()> {
        let path = PathKey::new(path)?;
        self.env.execute_write(|txn| {
            let node_id = self
                .path_store
                .read_entry(txn, &path)?
                .ok_or_else(|| FileOpError::NoSuchFile("file does not exist".to_string()))?;
            self.data_store.truncate(txn, node_id, size)
        })
    }

    /// Move `old_path` to `new_path`, keeping the inode id and all data.
    pub fn rename(&self, old_path: &str, new_path: &str) -> OpResult<()> {
        let old_path = PathKey::new(old_path)?;
        let new_path = PathKey::new(new_path)?;
        self.env
            .execute_write(|txn| self.path_store.rename(txn, &old_path, &new_path))
    }

    /// Target of the symlink at `path`.
    pub fn read_sym_link(&self, path: &str) -> OpResult<String> {
        let path = PathKey::new(path)?;
        self.env.execute_read(|txn| {
            let node_id = self
                .path_store
                .read_entry(txn, &path)?
                .ok_or_else(|| FileOpError::NoSuchFile("file does not exist".to_string()))?;
            let entry = self
                .inode_store
                .read_entry(txn, node_id)?
                .ok_or_else(|| FileOpError::Io("missing inode entry for path".to_string()))?;
            match entry.target_path() {
                Some(target) if entry.is_link() => Ok(target.to_string()),
                _ => Err(FileOpError::Io("not a symlink".to_string())),
            }
        })
    }

    pub fn statfs_info(&self) -> OpResult<StatfsInfo> {
        let pages_used = self
            .env
            .execute_read(|txn| self.data_store.total_pages_used(txn))?;
        Ok(StatfsInfo {
            page_size: self.data_store.page_size(),
            pages_used,
        })
    }

    pub fn total_pages_used(&self) -> OpResult<u64> {
        self.env
            .execute_read(|txn| self.data_store.total_pages_used(txn))
    }

    pub fn sizes(&self) -> OpResult<TableSizes> {
        self.env.execute_read(|txn| {
            Ok(TableSizes {
                files: self.data_store.size(txn)?,
                inodes: self.inode_store.size(txn)?,
                paths: self.path_store.size(txn)?,
            })
        })
    }

    fn refresh_mtime(
        &self,
        txn: &mut vault_store::StoreTxn<'_>,
        node_id: u64,
    ) -> OpResult<()> {
        let entry = self
            .inode_store
            .read_entry(txn, node_id)?
            .ok_or_else(|| FileOpError::Io("missing inode entry for path".to_string()))?;
        self.inode_store
            .update_entry(txn, node_id, &entry.with_mtime_now())
    }

    /// Decoded dump of every table, for the dump command.
    pub fn print_dump(&self, out: &mut dyn Write) -> OpResult<()> {
        self.env.execute_read(|txn| {
            writeln!(out, "PATH records:").map_err(io_err)?;
            for (key, value) in txn.entries(Table::Path)? {
                let parent = key_to_id(&key)?;
                let record = PathRecord::decode(&value)?;
                writeln!(
                    out,
                    " parent={} child: id={} name='{}'",
                    pretty_id(parent),
                    pretty_id(record.id()),
                    record.name()
                )
                .map_err(io_err)?;
            }

            writeln!(out, "INODE records:").map_err(io_err)?;
            for (key, value) in txn.entries(Table::Inode)? {
                let id = key_to_id(&key)?;
                let entry = InodeEntry::decode(&value)?;
                writeln!(
                    out,
                    " inode: id={} mode={:o} uid={} gid={}",
                    pretty_id(id),
                    entry.mode(),
                    entry.uid(),
                    entry.gid()
                )
                .map_err(io_err)?;
            }

            writeln!(out, "DATA pages:").map_err(io_err)?;
            for (key, value) in txn.entries(Table::Data)? {
                let data_key = DataKey::decode(&key)?;
                writeln!(
                    out,
                    " dataPage: inode={} page={} length={}",
                    pretty_id(data_key.fid),
                    data_key.page,
                    value.len()
                )
                .map_err(io_err)?;
            }

            writeln!(out, "DATA_LENGTH records:").map_err(io_err)?;
            for (key, value) in txn.entries(Table::DataLength)? {
                let id = key_to_id(&key)?;
                let bytes: [u8; 8] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| FileOpError::Io("malformed length record".to_string()))?;
                writeln!(
                    out,
                    " length: inode={} bytes={}",
                    pretty_id(id),
                    u64::from_be_bytes(bytes)
                )
                .map_err(io_err)?;
            }

            Ok(())
        })
    }

    /// Counts per physical table, for the stats command.
    pub fn table_counts(&self) -> OpResult<Vec<(String, u64)>> {
        let counts = self
            .env
            .table_counts()
            .map_err(FileOpError::from)?;
        Ok(counts
            .into_iter()
            .map(|(table, count)| (table.to_string(), count))
            .collect())
    }

    /// Reject new operations, wait for in-flight ones, release the store.
    pub fn close(self) {
        if let Ok(sizes) = self.sizes() {
            debug!(
                files = sizes.files,
                inodes = sizes.inodes,
                paths = sizes.paths,
                "closing"
            );
        }
        self.env.close();
    }
}

fn io_err(e: std::io::Error) -> FileOpError {
    FileOpError::Io(e.to_string())
}
