//! Transactional environment wrapper.
//!
//! [`StoreEnv`] owns the LMDB environment, the six logical tables, the record
//! cipher and the exclusive process lock. Callers never touch LMDB directly:
//! every operation runs inside a closure passed to [`StoreEnv::execute_read`]
//! or [`StoreEnv::execute_write`], which hands the closure a [`StoreTxn`].
//! All values are sealed on `put` and opened on `get`.
//!
//! The PATH table is duplicate-keyed: one parent inode id maps to many child
//! records. LMDB orders duplicates by raw value bytes, so each PATH value is
//! prefixed with the 8-byte big-endian child inode id ahead of the sealed
//! record. Ids are allocated in increasing order, which makes duplicate order
//! equal insertion order.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use fs2::FileExt;
use heed::types::Bytes;
use heed::{Database, DatabaseFlags, Env, EnvOpenOptions, RoTxn, RwTxn};
use tracing::{debug, trace, warn};

use crate::cipher::RecordCipher;
use crate::env_params::EnvParams;
use crate::params::FsParams;
use crate::{StoreError, StoreResult};

/// Exclusive lock file inside a database directory.
pub const LOCK_FILE_NAME: &str = "vaultfs.lck";

const FS_PARAMS_KEY: &[u8] = b"FS_PARAMS";

const MAP_SIZE: usize = 1 << 36; // 64 GiB of address space; LMDB grows the file lazily
const MAX_READERS: u32 = 126;

/// Sort prefix length for duplicate-keyed values.
pub const DUP_PREFIX_LEN: usize = 8;

/// The logical tables of a vaultfs database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// parent inode id → child path records (duplicate-keyed)
    Path,
    /// inode id → inode record
    Inode,
    /// id-issuer counter
    InodeMeta,
    /// (inode id, page index) → page bytes
    Data,
    /// inode id → logical file length
    DataLength,
    /// internal store parameters
    Meta,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Path,
        Table::Inode,
        Table::InodeMeta,
        Table::Data,
        Table::DataLength,
        Table::Meta,
    ];

    fn name(self) -> &'static str {
        match self {
            Table::Path => "PATH",
            Table::Inode => "INODE",
            Table::InodeMeta => "INODE_META",
            Table::Data => "DATA",
            Table::DataLength => "DATA_LENGTH",
            Table::Meta => "META",
        }
    }

    /// Associated-data tag for the record cipher.
    fn tag(self) -> u8 {
        match self {
            Table::Path => 1,
            Table::Inode => 2,
            Table::InodeMeta => 3,
            Table::Data => 4,
            Table::DataLength => 5,
            Table::Meta => 6,
        }
    }

    fn dup_sort(self) -> bool {
        matches!(self, Table::Path)
    }

    fn index(self) -> usize {
        match self {
            Table::Path => 0,
            Table::Inode => 1,
            Table::InodeMeta => 2,
            Table::Data => 3,
            Table::DataLength => 4,
            Table::Meta => 5,
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Encrypted transactional environment over one database directory.
pub struct StoreEnv {
    env: Env,
    dbs: [Database<Bytes, Bytes>; 6],
    cipher: RecordCipher,
    path: PathBuf,
    readonly: bool,
    open: AtomicBool,
    active_ops: AtomicU64,
    _lock: File,
}

impl StoreEnv {
    /// Open the environment in `dir` with an already-unwrapped DEK.
    ///
    /// Acquires the exclusive process lock; fails if another process holds it.
    pub fn open(
        dir: &Path,
        env_params: &EnvParams,
        dek: &[u8],
        readonly: bool,
    ) -> StoreResult<Self> {
        let lock = File::create(dir.join(LOCK_FILE_NAME))?;
        lock.try_lock_exclusive()
            .map_err(|e| StoreError::Locked(e.to_string()))?;

        let cipher = RecordCipher::from_id(&env_params.cipher_class, dek, env_params.iv)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE)
                .max_readers(MAX_READERS)
                .max_dbs(Table::ALL.len() as u32)
                .open(dir)?
        };

        let mut wtxn = env.write_txn()?;
        // index order must match Table::index
        let dbs = [
            open_table(&env, &mut wtxn, Table::Path)?,
            open_table(&env, &mut wtxn, Table::Inode)?,
            open_table(&env, &mut wtxn, Table::InodeMeta)?,
            open_table(&env, &mut wtxn, Table::Data)?,
            open_table(&env, &mut wtxn, Table::DataLength)?,
            open_table(&env, &mut wtxn, Table::Meta)?,
        ];
        wtxn.commit()?;

        debug!(path = %dir.display(), readonly, "opened store environment");

        Ok(Self {
            env,
            dbs,
            cipher,
            path: dir.to_path_buf(),
            readonly,
            open: AtomicBool::new(true),
            active_ops: AtomicU64::new(0),
            _lock: lock,
        })
    }

    pub fn env_path(&self) -> &Path {
        &self.path
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn db(&self, table: Table) -> &Database<Bytes, Bytes> {
        &self.dbs[table.index()]
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }

    /// Run `f` inside a read transaction.
    ///
    /// The error type is anything the caller can build from a [`StoreError`],
    /// so higher layers thread their own error taxonomy through the closure.
    pub fn execute_read<T, E>(
        &self,
        f: impl FnOnce(&mut StoreTxn<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError> + std::fmt::Display,
    {
        self.check_open().map_err(E::from)?;
        self.active_ops.fetch_add(1, Ordering::AcqRel);
        let result = (|| {
            let rtxn = self.env.read_txn().map_err(StoreError::from)?;
            let mut txn = StoreTxn {
                env: self,
                inner: TxnInner::Ro(rtxn),
            };
            f(&mut txn)
        })();
        self.active_ops.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Run `f` inside a write transaction, committing only on `Ok`.
    pub fn execute_write<T, E>(
        &self,
        f: impl FnOnce(&mut StoreTxn<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError> + std::fmt::Display,
    {
        self.check_open().map_err(E::from)?;
        if self.readonly {
            return Err(E::from(StoreError::ReadOnly));
        }
        self.active_ops.fetch_add(1, Ordering::AcqRel);
        let result = (|| {
            let wtxn = self.env.write_txn().map_err(StoreError::from)?;
            let mut txn = StoreTxn {
                env: self,
                inner: TxnInner::Rw(wtxn),
            };
            match f(&mut txn) {
                Ok(value) => {
                    match txn.inner {
                        TxnInner::Rw(wtxn) => {
                            wtxn.commit().map_err(StoreError::from)?;
                        }
                        TxnInner::Ro(_) => unreachable!("write closure holds a write txn"),
                    }
                    Ok(value)
                }
                Err(e) => {
                    trace!("aborting transaction: {e}");
                    Err(e)
                }
            }
        })();
        self.active_ops.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Read the internal parameters, if this store has been initialized.
    pub fn read_fs_params(&self) -> StoreResult<Option<FsParams>> {
        self.execute_read(|txn| {
            let Some(raw) = txn.get(Table::Meta, FS_PARAMS_KEY)? else {
                return Ok(None);
            };
            let params = serde_json::from_slice(&raw)
                .map_err(|e| StoreError::Params(format!("stored params unreadable: {e}")))?;
            Ok(Some(params))
        })
    }

    pub fn write_fs_params(&self, params: &FsParams) -> StoreResult<()> {
        let raw = serde_json::to_vec(params)
            .map_err(|e| StoreError::Params(format!("params serialize error: {e}")))?;
        self.execute_write(|txn| txn.put(Table::Meta, FS_PARAMS_KEY, &raw))
    }

    /// Record counts per table, for stats output.
    pub fn table_counts(&self) -> StoreResult<Vec<(Table, u64)>> {
        self.execute_read(|txn| {
            let mut counts = Vec::with_capacity(Table::ALL.len());
            for table in Table::ALL {
                counts.push((table, txn.count(table)?));
            }
            Ok(counts)
        })
    }

    /// Empty every table. Test and re-init tooling only.
    pub fn truncate_all_tables(&self) -> StoreResult<()> {
        self.execute_write(|txn| {
            for table in Table::ALL {
                let db = *txn.env.db(table);
                db.clear(txn.rw()?)?;
            }
            Ok(())
        })
    }

    /// Refuse new operations, wait for in-flight ones, then release the env.
    pub fn close(self) {
        self.open.store(false, Ordering::Release);
        let mut waited = 0u64;
        while self.active_ops.load(Ordering::Acquire) > 0 {
            if waited % 1000 == 0 {
                debug!(
                    active = self.active_ops.load(Ordering::Acquire),
                    "waiting for active operations before close"
                );
            }
            std::thread::sleep(Duration::from_millis(50));
            waited += 50;
            if waited > 30_000 {
                warn!("closing store with operations still active");
                break;
            }
        }
        debug!(path = %self.path.display(), "closed store environment");
    }
}

fn open_table(
    env: &Env,
    wtxn: &mut RwTxn<'_>,
    table: Table,
) -> StoreResult<Database<Bytes, Bytes>> {
    if table.dup_sort() {
        Ok(env
            .database_options()
            .types::<Bytes, Bytes>()
            .name(table.name())
            .flags(DatabaseFlags::DUP_SORT)
            .create(wtxn)?)
    } else {
        Ok(env.create_database(wtxn, Some(table.name()))?)
    }
}

enum TxnInner<'e> {
    Ro(RoTxn<'e>),
    Rw(RwTxn<'e>),
}

/// A single store transaction. Handed to closures by [`StoreEnv`]; all reads
/// and writes inside one filesystem operation go through one of these.
pub struct StoreTxn<'e> {
    env: &'e StoreEnv,
    inner: TxnInner<'e>,
}

impl<'e> StoreTxn<'e> {
    fn ro(&self) -> &RoTxn<'e> {
        match &self.inner {
            TxnInner::Ro(txn) => txn,
            TxnInner::Rw(txn) => txn,
        }
    }

    fn rw(&mut self) -> StoreResult<&mut RwTxn<'e>> {
        match &mut self.inner {
            TxnInner::Rw(txn) => Ok(txn),
            TxnInner::Ro(_) => Err(StoreError::ReadOnlyTxn),
        }
    }

    /// Fetch and open the value under `key`.
    pub fn get(&self, table: Table, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let Some(sealed) = self.env.db(table).get(self.ro(), key)? else {
            return Ok(None);
        };
        Ok(Some(self.env.cipher.open(table.tag(), sealed)?))
    }

    /// Seal and store `value` under `key`.
    pub fn put(&mut self, table: Table, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let sealed = self.env.cipher.seal(table.tag(), value)?;
        let db = *self.env.db(table);
        db.put(self.rw()?, key, &sealed)?;
        Ok(())
    }

    /// Delete the value under `key`. Returns whether anything was removed.
    pub fn delete(&mut self, table: Table, key: &[u8]) -> StoreResult<bool> {
        let db = *self.env.db(table);
        Ok(db.delete(self.rw()?, key)?)
    }

    /// Number of records in `table` (duplicates counted individually).
    pub fn count(&self, table: Table) -> StoreResult<u64> {
        Ok(self.env.db(table).len(self.ro())?)
    }

    /// Store a value under a duplicate-sorted key. `sort_prefix` determines
    /// the position among the key's duplicates and is stored in the clear
    /// ahead of the sealed record.
    pub fn put_dup(
        &mut self,
        table: Table,
        key: &[u8],
        sort_prefix: [u8; DUP_PREFIX_LEN],
        value: &[u8],
    ) -> StoreResult<()> {
        debug_assert!(table.dup_sort());
        let sealed = self.env.cipher.seal(table.tag(), value)?;
        let mut stored = Vec::with_capacity(DUP_PREFIX_LEN + sealed.len());
        stored.extend_from_slice(&sort_prefix);
        stored.extend_from_slice(&sealed);
        let db = *self.env.db(table);
        db.put(self.rw()?, key, &stored)?;
        Ok(())
    }

    /// All duplicate values under `key`, opened, in stored order.
    pub fn dup_values(&self, table: Table, key: &[u8]) -> StoreResult<Vec<Vec<u8>>> {
        debug_assert!(table.dup_sort());
        let mut values = Vec::new();
        if let Some(iter) = self.env.db(table).get_duplicates(self.ro(), key)? {
            for entry in iter {
                let (_, stored) = entry?;
                values.push(self.open_dup_value(table, stored)?);
            }
        }
        Ok(values)
    }

    /// Delete the first duplicate under `key` whose opened value satisfies
    /// `pred`. Returns whether a record was removed.
    pub fn delete_dup(
        &mut self,
        table: Table,
        key: &[u8],
        pred: impl Fn(&[u8]) -> bool,
    ) -> StoreResult<bool> {
        debug_assert!(table.dup_sort());
        let db = *self.env.db(table);

        let mut target: Option<Vec<u8>> = None;
        if let Some(iter) = db.get_duplicates(self.ro(), key)? {
            for entry in iter {
                let (_, stored) = entry?;
                if pred(&self.open_dup_value(table, stored)?) {
                    target = Some(stored.to_vec());
                    break;
                }
            }
        }

        match target {
            Some(stored) => Ok(db.delete_one_duplicate(self.rw()?, key, &stored)?),
            None => Ok(false),
        }
    }

    /// Full decoded scan of `table`, for dump tooling.
    pub fn entries(&self, table: Table) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in self.env.db(table).iter(self.ro())? {
            let (key, stored) = entry?;
            let value = if table.dup_sort() {
                self.open_dup_value(table, stored)?
            } else {
                self.env.cipher.open(table.tag(), stored)?
            };
            out.push((key.to_vec(), value));
        }
        Ok(out)
    }

    fn open_dup_value(&self, table: Table, stored: &[u8]) -> StoreResult<Vec<u8>> {
        if stored.len() < DUP_PREFIX_LEN {
            return Err(StoreError::Cipher(
                "duplicate record missing sort prefix".to_string(),
            ));
        }
        self.env.cipher.open(table.tag(), &stored[DUP_PREFIX_LEN..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_env(dir: &Path) -> StoreEnv {
        let params = EnvParams::new(
            0xdead_beef_cafe_f00d,
            crate::cipher::CIPHER_CHACHA20_POLY1305.to_string(),
            crate::auth::AUTH_ARGON2_AES_CBC.to_string(),
            "{}".to_string(),
        )
        .unwrap();
        StoreEnv::open(dir, &params, &[42u8; 32], false).unwrap()
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let env = open_env(dir.path());

        env.execute_write(|txn| txn.put(Table::Inode, b"k1", b"value-one"))
            .unwrap();

        let value = env
            .execute_read(|txn| txn.get(Table::Inode, b"k1"))
            .unwrap();
        assert_eq!(value.as_deref(), Some(&b"value-one"[..]));
    }

    #[test]
    fn values_are_sealed_on_disk() {
        let dir = TempDir::new().unwrap();
        let env = open_env(dir.path());

        env.execute_write(|txn| txn.put(Table::Inode, b"k1", b"super-secret-name"))
            .unwrap();

        // raw LMDB bytes must not contain the plaintext
        let raw = env
            .execute_read(|txn| -> StoreResult<Option<Vec<u8>>> {
                let db = env.db(Table::Inode);
                Ok(db.get(txn.ro(), b"k1".as_slice())?.map(<[u8]>::to_vec))
            })
            .unwrap()
            .unwrap();
        assert!(!raw
            .windows(b"super-secret-name".len())
            .any(|w| w == b"super-secret-name"));
    }

    #[test]
    fn failed_write_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let env = open_env(dir.path());

        let result: StoreResult<()> = env.execute_write(|txn| {
            txn.put(Table::Inode, b"k1", b"value")?;
            Err(StoreError::Params("forced abort".to_string()))
        });
        assert!(result.is_err());

        let value = env
            .execute_read(|txn| txn.get(Table::Inode, b"k1"))
            .unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn dup_values_ordered_by_prefix() {
        let dir = TempDir::new().unwrap();
        let env = open_env(dir.path());

        env.execute_write(|txn| -> StoreResult<()> {
            // inserted out of order; prefix decides stored order
            txn.put_dup(Table::Path, b"parent", 3u64.to_be_bytes(), b"third")?;
            txn.put_dup(Table::Path, b"parent", 1u64.to_be_bytes(), b"first")?;
            txn.put_dup(Table::Path, b"parent", 2u64.to_be_bytes(), b"second")?;
            Ok(())
        })
        .unwrap();

        let values = env
            .execute_read(|txn| txn.dup_values(Table::Path, b"parent"))
            .unwrap();
        assert_eq!(values, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
    }

    #[test]
    fn delete_dup_removes_matching_record() {
        let dir = TempDir::new().unwrap();
        let env = open_env(dir.path());

        env.execute_write(|txn| -> StoreResult<()> {
            txn.put_dup(Table::Path, b"parent", 1u64.to_be_bytes(), b"keep")?;
            txn.put_dup(Table::Path, b"parent", 2u64.to_be_bytes(), b"drop")?;
            Ok(())
        })
        .unwrap();

        let removed = env
            .execute_write(|txn| txn.delete_dup(Table::Path, b"parent", |v| v == b"drop"))
            .unwrap();
        assert!(removed);

        let values = env
            .execute_read(|txn| txn.dup_values(Table::Path, b"parent"))
            .unwrap();
        assert_eq!(values, vec![b"keep".to_vec()]);
    }

    #[test]
    fn readonly_env_refuses_writes() {
        let dir = TempDir::new().unwrap();
        {
            let env = open_env(dir.path());
            env.execute_write(|txn| txn.put(Table::Meta, b"k", b"v"))
                .unwrap();
            env.close();
        }

        let params = EnvParams::new(
            0xdead_beef_cafe_f00d,
            crate::cipher::CIPHER_CHACHA20_POLY1305.to_string(),
            crate::auth::AUTH_ARGON2_AES_CBC.to_string(),
            "{}".to_string(),
        )
        .unwrap();
        let env = StoreEnv::open(dir.path(), &params, &[42u8; 32], true).unwrap();
        assert!(matches!(
            env.execute_write(|txn| txn.put(Table::Meta, b"k", b"v")),
            Err(StoreError::ReadOnly)
        ));
        // reads still work
        let value = env.execute_read(|txn| txn.get(Table::Meta, b"k")).unwrap();
        assert_eq!(value.as_deref(), Some(&b"v"[..]));
    }

    #[test]
    fn second_open_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let env = open_env(dir.path());

        let params = EnvParams::new(
            0xdead_beef_cafe_f00d,
            crate::cipher::CIPHER_CHACHA20_POLY1305.to_string(),
            crate::auth::AUTH_ARGON2_AES_CBC.to_string(),
            "{}".to_string(),
        )
        .unwrap();
        let second = StoreEnv::open(dir.path(), &params, &[42u8; 32], false);
        assert!(matches!(second, Err(StoreError::Locked(_))));
        drop(env);
    }

    #[test]
    fn fs_params_roundtrip() {
        let dir = TempDir::new().unwrap();
        let env = open_env(dir.path());

        assert!(env.read_fs_params().unwrap().is_none());
        let params = FsParams::new(32768).unwrap();
        env.write_fs_params(&params).unwrap();
        assert_eq!(env.read_fs_params().unwrap(), Some(params));
    }
}
