//! Inode records and inode-id encoding.
//!
//! An inode record carries one filesystem object's type, permissions,
//! timestamps (seconds precision), owner ids and, for symlinks, the target
//! path. Records are stored as JSON with short field names so the format can
//! grow fields without a migration.

use serde::{Deserialize, Serialize};

use crate::error::{FileOpError, OpResult};

/// The reserved root inode id.
pub const ROOT_INODE: u64 = 1;

/// File-type mask bits, per the POSIX `st_mode` layout.
pub const S_IFMT: u32 = 0xF000;
pub const S_IFDIR: u32 = 0x4000;
pub const S_IFREG: u32 = 0x8000;
pub const S_IFLNK: u32 = 0xA000;

/// Inode ids are stored as fixed 8-byte big-endian keys.
pub fn id_to_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

pub fn key_to_id(key: &[u8]) -> OpResult<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| FileOpError::Io(format!("inode key has length {}", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

pub fn pretty_id(id: u64) -> String {
    format!("{id:016x}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    Dir,
    File,
    Link,
}

impl InodeType {
    fn mask(self) -> u32 {
        match self {
            InodeType::Dir => S_IFDIR,
            InodeType::File => S_IFREG,
            InodeType::Link => S_IFLNK,
        }
    }

    fn initial_mode(self) -> u32 {
        match self {
            InodeType::Dir => S_IFDIR | 0o755,
            InodeType::File => S_IFREG | 0o444,
            InodeType::Link => S_IFLNK | 0o444,
        }
    }

    fn of_mode(mode: u32) -> Option<InodeType> {
        match mode & S_IFMT {
            S_IFDIR => Some(InodeType::Dir),
            S_IFREG => Some(InodeType::File),
            S_IFLNK => Some(InodeType::Link),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeEntry {
    #[serde(rename = "m")]
    mode: u32,
    #[serde(rename = "at")]
    atime: i64,
    #[serde(rename = "ct")]
    ctime: i64,
    #[serde(rename = "bt")]
    btime: i64,
    #[serde(rename = "mt")]
    mtime: i64,
    #[serde(rename = "u")]
    uid: i32,
    #[serde(rename = "g")]
    gid: i32,
    #[serde(rename = "p", skip_serializing_if = "Option::is_none", default)]
    target_path: Option<String>,
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl InodeEntry {
    fn new(inode_type: InodeType, mode: u32) -> Self {
        let now = now_secs();
        Self {
            mode: inode_type.mask() | mode,
            atime: now,
            ctime: now,
            btime: now,
            mtime: now,
            uid: 0,
            gid: 0,
            target_path: None,
        }
    }

    pub fn new_directory() -> Self {
        Self::new(InodeType::Dir, InodeType::Dir.initial_mode())
    }

    pub fn new_directory_with_mode(mode: u32) -> Self {
        Self::new(InodeType::Dir, mode)
    }

    pub fn new_file() -> Self {
        Self::new(InodeType::File, InodeType::File.initial_mode())
    }

    pub fn new_file_with_mode(mode: u32) -> Self {
        Self::new(InodeType::File, mode)
    }

    pub fn new_link(target_path: &str) -> Self {
        let mut entry = Self::new(InodeType::Link, InodeType::Link.initial_mode());
        entry.target_path = Some(target_path.to_string());
        entry
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn atime(&self) -> i64 {
        self.atime
    }

    pub fn ctime(&self) -> i64 {
        self.ctime
    }

    pub fn btime(&self) -> i64 {
        self.btime
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn uid(&self) -> i32 {
        self.uid
    }

    pub fn gid(&self) -> i32 {
        self.gid
    }

    pub fn target_path(&self) -> Option<&str> {
        self.target_path.as_deref()
    }

    pub fn inode_type(&self) -> Option<InodeType> {
        InodeType::of_mode(self.mode)
    }

    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_link(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn with_mtime_now(&self) -> Self {
        Self {
            mtime: now_secs(),
            ..self.clone()
        }
    }

    /// Replace the mode. Fails if the new mode's type bits match no known type.
    pub fn with_mode(&self, mode: u32) -> OpResult<Self> {
        if InodeType::of_mode(mode).is_none() {
            return Err(FileOpError::Io(format!(
                "unknown file type in mode {mode:o}"
            )));
        }
        Ok(Self {
            mode,
            ..self.clone()
        })
    }

    pub fn with_uid_gid(&self, uid: i32, gid: i32) -> Self {
        Self {
            uid,
            gid,
            ..self.clone()
        }
    }

    pub fn with_atime_mtime(&self, atime: i64, mtime: i64) -> Self {
        Self {
            atime,
            mtime,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> OpResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FileOpError::Io(format!("inode encode error: {e}")))
    }

    pub fn decode(raw: &[u8]) -> OpResult<Self> {
        let entry: InodeEntry = serde_json::from_slice(raw)
            .map_err(|e| FileOpError::Io(format!("error decoding stored inode entry: {e}")))?;
        if InodeType::of_mode(entry.mode).is_none() {
            return Err(FileOpError::Io(format!(
                "stored inode entry has unknown type in mode {:o}",
                entry.mode
            )));
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_predicates() {
        assert!(InodeEntry::new_directory().is_directory());
        assert!(InodeEntry::new_file().is_file());
        assert!(InodeEntry::new_link("/t").is_link());
        assert!(!InodeEntry::new_file().is_directory());
    }

    #[test]
    fn initial_modes() {
        assert_eq!(InodeEntry::new_directory().mode(), S_IFDIR | 0o755);
        assert_eq!(InodeEntry::new_file().mode(), S_IFREG | 0o444);
        assert_eq!(InodeEntry::new_link("/t").mode(), S_IFLNK | 0o444);
    }

    #[test]
    fn mode_keeps_type_bits_when_caller_passes_permissions() {
        let entry = InodeEntry::new_file_with_mode(0o644);
        assert!(entry.is_file());
        assert_eq!(entry.mode() & 0o777, 0o644);
    }

    #[test]
    fn with_mode_rejects_unknown_type() {
        let entry = InodeEntry::new_file();
        assert!(entry.with_mode(0o1000 << 3).is_err()); // S_IFIFO-style bits
        assert!(entry.with_mode(S_IFREG | 0o600).is_ok());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let entry = InodeEntry::new_link("/somewhere/else").with_uid_gid(1000, 1000);
        let decoded = InodeEntry::decode(&entry.encode().unwrap()).unwrap();
        assert_eq!(entry, decoded);
        assert_eq!(decoded.target_path(), Some("/somewhere/else"));
    }

    #[test]
    fn short_field_names_on_the_wire() {
        let raw = InodeEntry::new_file().encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert!(json.get("m").is_some());
        assert!(json.get("mt").is_some());
        // target path omitted entirely for non-links
        assert!(json.get("p").is_none());
    }

    #[test]
    fn decode_rejects_unknown_type_mask() {
        let raw = br#"{"m":4096,"at":0,"ct":0,"bt":0,"mt":0,"u":0,"g":0}"#;
        assert!(InodeEntry::decode(raw).is_err());
    }

    #[test]
    fn id_key_roundtrip() {
        for id in [1u64, 0x8000_0000, u64::MAX - 10] {
            assert_eq!(key_to_id(&id_to_key(id)).unwrap(), id);
        }
        assert!(key_to_id(b"short").is_err());
    }
}
