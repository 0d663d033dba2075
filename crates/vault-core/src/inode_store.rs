//! Inode table: id → record, plus id issuance and the bounded read cache.

use moka::sync::Cache;
use parking_lot::Mutex;
use tracing::{debug, trace};
use vault_store::{StoreEnv, StoreTxn, Table};

use crate::error::{FileOpError, OpResult, VaultResult};
use crate::inode::{id_to_key, pretty_id, InodeEntry, ROOT_INODE};

const CACHE_MAX_ITEMS: u64 = 1000;

const ID_COUNTER_KEY: &[u8] = b"ID_COUNTER";
const ID_MIN: u64 = 1 << 31;
const ID_MAX: u64 = (1 << 63) - 10;

pub struct InodeStore {
    cache: Cache<u64, Option<InodeEntry>>,
    // serialized id issuance; the persisted counter travels in the caller's txn
    issue_counter: Mutex<u64>,
}

impl InodeStore {
    /// Load the issuer counter and make sure the root inode exists.
    pub fn open(env: &StoreEnv) -> VaultResult<Self> {
        let seed = env.execute_read(|txn| -> Result<u64, vault_store::StoreError> {
            Ok(match txn.get(Table::InodeMeta, ID_COUNTER_KEY)? {
                Some(raw) => {
                    let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                        vault_store::StoreError::Params("malformed id counter".to_string())
                    })?;
                    u64::from_be_bytes(bytes)
                }
                None => ID_MIN,
            })
        })?;

        let store = Self {
            cache: Cache::builder().max_capacity(CACHE_MAX_ITEMS).build(),
            issue_counter: Mutex::new(seed),
        };

        if !env.is_readonly() {
            store.create_root_entry(env)?;
        }

        Ok(store)
    }

    fn create_root_entry(&self, env: &StoreEnv) -> VaultResult<()> {
        env.execute_write(|txn| -> Result<(), FileOpError> {
            let root_key = id_to_key(ROOT_INODE);
            if txn.get(Table::Inode, &root_key)?.is_none() {
                let root = InodeEntry::new_directory();
                txn.put(Table::Inode, &root_key, &root.encode()?)?;
                debug!("created root inode");
            }
            Ok(())
        })?;
        Ok(())
    }

    pub fn size(&self, txn: &mut StoreTxn<'_>) -> OpResult<u64> {
        Ok(txn.count(Table::Inode)?)
    }

    pub fn create_entry(&self, txn: &mut StoreTxn<'_>, id: u64, entry: &InodeEntry) -> OpResult<()> {
        self.update_entry(txn, id, entry)
    }

    pub fn read_entry(&self, txn: &mut StoreTxn<'_>, id: u64) -> OpResult<Option<InodeEntry>> {
        if let Some(cached) = self.cache.get(&id) {
            return Ok(cached);
        }
        let entry = match txn.get(Table::Inode, &id_to_key(id))? {
            Some(raw) => Some(InodeEntry::decode(&raw)?),
            None => None,
        };
        self.cache.insert(id, entry.clone());
        Ok(entry)
    }

    pub fn update_entry(&self, txn: &mut StoreTxn<'_>, id: u64, entry: &InodeEntry) -> OpResult<()> {
        self.cache.invalidate(&id);
        txn.put(Table::Inode, &id_to_key(id), &entry.encode()?)?;
        Ok(())
    }

    pub fn remove_entry(&self, txn: &mut StoreTxn<'_>, id: u64) -> OpResult<()> {
        if self.read_entry(txn, id)?.is_none() {
            return Err(FileOpError::NoSuchFile("inode does not exist".to_string()));
        }
        self.cache.invalidate(&id);
        txn.delete(Table::Inode, &id_to_key(id))?;
        Ok(())
    }

    pub fn has_id(&self, txn: &mut StoreTxn<'_>, id: u64) -> OpResult<bool> {
        Ok(self.read_entry(txn, id)?.is_some())
    }

    /// Allocate an unused inode id.
    ///
    /// The in-memory counter advances monotonically and wraps from
    /// `ID_MAX` back to `ID_MIN`; every candidate is probed against the inode
    /// table so freed ids can be reissued without collisions. The counter
    /// value is persisted inside the caller's transaction, so an abort leaves
    /// no trace of the allocation.
    pub fn next_id(&self, txn: &mut StoreTxn<'_>) -> OpResult<u64> {
        let mut counter = self.issue_counter.lock();
        let max_attempts = ID_MAX - ID_MIN;
        for _ in 0..max_attempts {
            let candidate = *counter;
            *counter = if candidate + 1 >= ID_MAX {
                ID_MIN
            } else {
                candidate + 1
            };
            if !self.has_id(txn, candidate)? {
                txn.put(Table::InodeMeta, ID_COUNTER_KEY, &candidate.to_be_bytes())?;
                trace!(id = %pretty_id(candidate), "issued inode id");
                return Ok(candidate);
            }
        }
        Err(FileOpError::Io(
            "unable to allocate inode id: id space exhausted".to_string(),
        ))
    }
}
