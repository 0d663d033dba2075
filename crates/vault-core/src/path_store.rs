//! Directory-tree table: parent inode id → child records.
//!
//! The PATH table is duplicate-keyed: listing a directory is a scan of the
//! parent id's duplicates. Full paths are never used as keys — a path
//! resolves by walking segments from the root, which keeps per-entry storage
//! independent of path depth and never exposes equal-plaintext keys to the
//! store. A bounded cache short-circuits the walk for hot paths.

use moka::sync::Cache;
use tracing::{debug, trace};
use vault_store::{StoreTxn, Table};

use crate::error::{FileOpError, OpResult};
use crate::inode::{id_to_key, pretty_id, ROOT_INODE};
use crate::path_key::PathKey;

const CACHE_MAX_ITEMS: u64 = 1000;

const RECORD_VERSION: &str = "1";
const RECORD_SEPARATOR: char = '!';

/// One child entry of a directory: `(child inode id, child name)`.
///
/// Wire format: `1!<16-hex-digits-of-id>!<name>`. Names may contain anything
/// but `/`, including further `!` characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRecord {
    id: u64,
    name: String,
}

impl PathRecord {
    pub fn new(id: u64, name: &str) -> OpResult<Self> {
        if id == 0 {
            return Err(FileOpError::Io("path record id can not be zero".to_string()));
        }
        if name.is_empty() {
            return Err(FileOpError::Io(
                "path record name must have at least one character".to_string(),
            ));
        }
        Ok(Self {
            id,
            name: name.to_string(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{RECORD_VERSION}{RECORD_SEPARATOR}{}{RECORD_SEPARATOR}{}",
            pretty_id(self.id),
            self.name
        )
        .into_bytes()
    }

    pub fn decode(raw: &[u8]) -> OpResult<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| FileOpError::Io(format!("path record is not utf-8: {e}")))?;
        let mut parts = text.splitn(3, RECORD_SEPARATOR);
        let (Some(version), Some(id_hex), Some(name)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(FileOpError::Io(
                "deserialized path record missing components".to_string(),
            ));
        };
        if version != RECORD_VERSION {
            return Err(FileOpError::Io(
                "deserialized path record version not recognized".to_string(),
            ));
        }
        let id = u64::from_str_radix(id_hex, 16)
            .map_err(|e| FileOpError::Io(format!("path record id unparseable: {e}")))?;
        Self::new(id, name)
    }
}

pub struct PathStore {
    cache: Cache<String, u64>,
}

impl PathStore {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder().max_capacity(CACHE_MAX_ITEMS).build(),
        }
    }

    fn validate_for_write(path: &PathKey) -> OpResult<()> {
        if path.is_root() {
            return Err(FileOpError::FileExists(
                "can not modify root path".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve `path` to an inode id, or `None` if any segment is missing.
    pub fn read_entry(&self, txn: &mut StoreTxn<'_>, path: &PathKey) -> OpResult<Option<u64>> {
        if let Some(cached) = self.cache.get(path.path()) {
            return Ok(Some(cached));
        }
        let resolved = self.read_entry_impl(txn, path)?;
        if let Some(id) = resolved {
            self.cache.insert(path.path().to_string(), id);
            trace!(path = %path, id = %pretty_id(id), "cached path resolution");
        }
        Ok(resolved)
    }

    fn read_entry_impl(&self, txn: &mut StoreTxn<'_>, path: &PathKey) -> OpResult<Option<u64>> {
        if path.is_root() {
            return Ok(Some(ROOT_INODE));
        }

        // first parent is always root
        let mut segment_id = ROOT_INODE;

        for segment in path.segments() {
            let records = self.read_records_for_id(txn, segment_id)?;
            match records.into_iter().find(|r| r.name() == segment) {
                Some(record) => segment_id = record.id(),
                None => return Ok(None),
            }
        }

        Ok(Some(segment_id))
    }

    /// Attach `inode_id` under the parent of `path`.
    pub fn create_entry(
        &self,
        txn: &mut StoreTxn<'_>,
        path: &PathKey,
        inode_id: u64,
    ) -> OpResult<()> {
        Self::validate_for_write(path)?;

        if self.read_entry(txn, path)?.is_some() {
            return Err(FileOpError::FileExists("path already exists".to_string()));
        }

        let parent = path.parent().ok_or_else(|| {
            FileOpError::Io("non-root path without parent".to_string())
        })?;
        let parent_id = self
            .read_entry(txn, &parent)?
            .ok_or_else(|| FileOpError::NoSuchDir("parent path does not exist".to_string()))?;

        let record = PathRecord::new(inode_id, path.suffix())?;
        txn.put_dup(
            Table::Path,
            &id_to_key(parent_id),
            inode_id.to_be_bytes(),
            &record.encode(),
        )?;
        Ok(())
    }

    pub fn size(&self, txn: &mut StoreTxn<'_>) -> OpResult<u64> {
        Ok(txn.count(Table::Path)?)
    }

    /// Detach `path` from its parent. Refuses when children exist.
    pub fn remove_entry(&self, txn: &mut StoreTxn<'_>, path: &PathKey) -> OpResult<()> {
        self.remove_entry_impl(txn, path, true)
    }

    fn remove_entry_impl(
        &self,
        txn: &mut StoreTxn<'_>,
        path: &PathKey,
        check_for_children: bool,
    ) -> OpResult<()> {
        Self::validate_for_write(path)?;

        let path_id = self
            .read_entry(txn, path)?
            .ok_or_else(|| FileOpError::NoSuchFile("path does not exist".to_string()))?;

        if check_for_children && !self.read_records_for_id(txn, path_id)?.is_empty() {
            return Err(FileOpError::DirNotEmpty("path has descendants".to_string()));
        }

        let parent = path.parent().ok_or_else(|| {
            FileOpError::Io("non-root path without parent".to_string())
        })?;
        let parent_id = self
            .read_entry(txn, &parent)?
            .ok_or_else(|| FileOpError::NoSuchDir("parent path does not exist".to_string()))?;

        let expected = PathRecord::new(path_id, path.suffix())?;
        self.cache.invalidate(path.path());

        let removed = txn.delete_dup(Table::Path, &id_to_key(parent_id), |raw| {
            PathRecord::decode(raw).map_or(false, |r| r == expected)
        })?;
        if !removed {
            return Err(FileOpError::Io(
                "error removing entry, unable to detach from parent entry".to_string(),
            ));
        }
        Ok(())
    }

    /// Child names under the directory at `path`, in storage order.
    pub fn read_sub_paths(&self, txn: &mut StoreTxn<'_>, path: &PathKey) -> OpResult<Vec<String>> {
        let node_id = self
            .read_entry(txn, path)?
            .ok_or_else(|| FileOpError::NoSuchDir("path does not exist".to_string()))?;
        Ok(self
            .read_records_for_id(txn, node_id)?
            .into_iter()
            .map(|r| r.name)
            .collect())
    }

    fn read_records_for_id(&self, txn: &mut StoreTxn<'_>, id: u64) -> OpResult<Vec<PathRecord>> {
        txn.dup_values(Table::Path, &id_to_key(id))?
            .iter()
            .map(|raw| PathRecord::decode(raw))
            .collect()
    }

    /// Move the entry at `old_path` to `new_path`, keeping its inode id.
    pub fn rename(
        &self,
        txn: &mut StoreTxn<'_>,
        old_path: &PathKey,
        new_path: &PathKey,
    ) -> OpResult<()> {
        Self::validate_for_write(old_path)?;
        Self::validate_for_write(new_path)?;

        let old_path_id = self
            .read_entry(txn, old_path)?
            .ok_or_else(|| FileOpError::NoSuchDir("oldPath does not exist".to_string()))?;

        if self.read_entry(txn, new_path)?.is_some() {
            return Err(FileOpError::FileExists("newPath already exists".to_string()));
        }

        let new_parent = new_path.parent().ok_or_else(|| {
            FileOpError::Io("non-root path without parent".to_string())
        })?;
        if self.read_entry(txn, &new_parent)?.is_none() {
            return Err(FileOpError::NoSuchDir(
                "parent of new path does not exist".to_string(),
            ));
        }

        // a rename of an entry with descendants moves a whole subtree: every
        // cached path under it may now be wrong
        let invalidates_cache = !self.read_records_for_id(txn, old_path_id)?.is_empty();

        self.remove_entry_impl(txn, old_path, false)?;
        self.create_entry(txn, new_path, old_path_id)?;

        if invalidates_cache {
            let cache_count = self.cache.entry_count();
            self.cache.invalidate_all();
            debug!(records = cache_count, "purged path resolution cache");
        }
        Ok(())
    }
}

impl Default for PathStore {
    fn default() -> Self {
        Self::new()
    }
}
