//! # vault-fuse
//!
//! FUSE host binding for vaultfs.
//!
//! Dispatches kernel requests onto the [`vault_core::VaultFs`] facade. The
//! facade is path-addressed while FUSE speaks inode numbers, so this layer
//! keeps an ino → path table: store inode ids double as FUSE inos, the table
//! is seeded with `1 → /` and fed by `lookup`/`readdir`, and rename/unlink
//! evict the affected paths. No per-open state exists anywhere: `open`,
//! `release`, `opendir` and `releasedir` are success no-ops.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod imp {
    use std::collections::HashMap;
    use std::ffi::OsStr;
    use std::path::Path;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use fuser::{
        FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
        ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
    };
    use libc::{c_int, EEXIST, EINVAL, EIO, EISDIR, ENOENT, ENOTDIR, ENOTEMPTY, EROFS};
    use tracing::{debug, trace, warn};
    use vault_core::inode::S_IFMT;
    use vault_core::{FileOpError, InodeEntry, VaultFs, ROOT_INODE};

    const TTL: Duration = Duration::from_secs(1);
    const FREE_PAGES: u64 = 1_000_000_000;
    const NAME_MAX: u32 = 255;

    fn errno(e: &FileOpError) -> c_int {
        match e {
            FileOpError::NoSuchFile(_) | FileOpError::NoSuchDir(_) => ENOENT,
            FileOpError::NotADirectory(_) => ENOTDIR,
            FileOpError::NotAFile(_) => EISDIR,
            FileOpError::DirNotEmpty(_) => ENOTEMPTY,
            FileOpError::FileExists(_) => EEXIST,
            FileOpError::InvalidPath(_) | FileOpError::Io(_) => EIO,
        }
    }

    /// A live background mount. Dropping it unmounts.
    pub struct MountSession(fuser::BackgroundSession);

    impl MountSession {
        /// Unmount and wait for the session threads to finish.
        pub fn unmount(self) {
            self.0.join();
        }
    }

    pub struct VaultFuseFs {
        fs: VaultFs,
        readonly: bool,
        inode_paths: HashMap<u64, String>,
    }

    impl VaultFuseFs {
        pub fn new(fs: VaultFs, readonly: bool) -> Self {
            let mut inode_paths = HashMap::new();
            inode_paths.insert(ROOT_INODE, "/".to_string());
            Self {
                fs,
                readonly,
                inode_paths,
            }
        }

        /// Mount and block until the filesystem is unmounted.
        pub fn mount(self, mountpoint: &Path) -> anyhow::Result<()> {
            let options = self.mount_options();
            fuser::mount2(self, mountpoint, &options)?;
            Ok(())
        }

        /// Mount in a background session; dropping the session unmounts.
        pub fn spawn_mount(self, mountpoint: &Path) -> anyhow::Result<MountSession> {
            let options = self.mount_options();
            Ok(MountSession(fuser::spawn_mount2(self, mountpoint, &options)?))
        }

        fn mount_options(&self) -> Vec<MountOption> {
            let mut options = vec![MountOption::FSName("vaultfs".to_string())];
            if self.readonly {
                options.push(MountOption::RO);
            }
            options
        }

        fn path_of(&self, ino: u64) -> Option<String> {
            self.inode_paths.get(&ino).cloned()
        }

        fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
            let parent_path = self.inode_paths.get(&parent)?;
            let name = name.to_str()?;
            if parent_path == "/" {
                Some(format!("/{name}"))
            } else {
                Some(format!("{parent_path}/{name}"))
            }
        }

        fn forget_path(&mut self, path: &str) {
            let prefix = format!("{path}/");
            self.inode_paths
                .retain(|_, p| p != path && !p.starts_with(&prefix));
        }

        /// Build the reply attributes for a resolved entry.
        fn attr_for(&self, ino: u64, path: &str, entry: &InodeEntry) -> Result<FileAttr, c_int> {
            let (kind, nlink, size) = if entry.is_directory() {
                (FileType::Directory, 2, 0)
            } else if entry.is_link() {
                let len = entry.target_path().map_or(0, |t| t.len() as u64);
                (FileType::Symlink, 1, len)
            } else {
                let len = self
                    .fs
                    .file_length(path)
                    .map_err(|e| errno(&e))?
                    .unwrap_or(0);
                (FileType::RegularFile, 1, len)
            };

            let block_size = self.fs.page_size() as u64;
            Ok(FileAttr {
                ino,
                size,
                blocks: size.div_ceil(block_size),
                atime: secs_to_system_time(entry.atime()),
                mtime: secs_to_system_time(entry.mtime()),
                ctime: secs_to_system_time(entry.ctime()),
                crtime: secs_to_system_time(entry.btime()),
                kind,
                perm: (entry.mode() & 0o7777) as u16,
                nlink,
                uid: entry.uid() as u32,
                gid: entry.gid() as u32,
                rdev: 0,
                flags: 0,
                blksize: self.fs.page_size() as u32,
            })
        }

        /// Resolve a path, register its ino, and build reply attributes.
        fn lookup_attr(&mut self, path: &str) -> Result<FileAttr, c_int> {
            let id = self
                .fs
                .resolve_path(path)
                .map_err(|e| errno(&e))?
                .ok_or(ENOENT)?;
            let entry = self
                .fs
                .read_attrs(path)
                .map_err(|e| errno(&e))?
                .ok_or(ENOENT)?;
            let attr = self.attr_for(id, path, &entry)?;
            self.inode_paths.insert(id, path.to_string());
            Ok(attr)
        }

        fn write_guard(&self) -> Result<(), c_int> {
            if self.readonly {
                Err(EROFS)
            } else {
                Ok(())
            }
        }
    }

    fn secs_to_system_time(secs: i64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
    }

    fn time_or_now_to_secs(t: TimeOrNow) -> i64 {
        match t {
            TimeOrNow::SpecificTime(st) => st
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            TimeOrNow::Now => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
        }
    }

    impl Filesystem for VaultFuseFs {
        fn init(
            &mut self,
            _req: &Request,
            _config: &mut fuser::KernelConfig,
        ) -> Result<(), c_int> {
            debug!("init()");
            Ok(())
        }

        fn destroy(&mut self) {
            debug!("destroy()");
        }

        fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };
            trace!(path = %path, "lookup()");
            match self.lookup_attr(&path) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(code) => reply.error(code),
            }
        }

        fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
            let Some(path) = self.path_of(ino) else {
                reply.error(ENOENT);
                return;
            };
            match self.fs.read_attrs(&path) {
                Ok(Some(entry)) => match self.attr_for(ino, &path, &entry) {
                    Ok(attr) => reply.attr(&TTL, &attr),
                    Err(code) => reply.error(code),
                },
                Ok(None) => reply.error(ENOENT),
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn setattr(
            &mut self,
            _req: &Request,
            ino: u64,
            mode: Option<u32>,
            uid: Option<u32>,
            gid: Option<u32>,
            size: Option<u64>,
            atime: Option<TimeOrNow>,
            mtime: Option<TimeOrNow>,
            _ctime: Option<SystemTime>,
            _fh: Option<u64>,
            _crtime: Option<SystemTime>,
            _chgtime: Option<SystemTime>,
            _bkuptime: Option<SystemTime>,
            _flags: Option<u32>,
            reply: ReplyAttr,
        ) {
            if let Err(code) = self.write_guard() {
                reply.error(code);
                return;
            }
            let Some(path) = self.path_of(ino) else {
                reply.error(ENOENT);
                return;
            };

            let entry = match self.fs.read_attrs(&path) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    reply.error(ENOENT);
                    return;
                }
                Err(e) => {
                    reply.error(errno(&e));
                    return;
                }
            };

            let mut updated = entry.clone();
            if let Some(mode) = mode {
                // chmod never changes the file type bits
                let merged = (updated.mode() & S_IFMT) | (mode & !S_IFMT);
                updated = match updated.with_mode(merged) {
                    Ok(e) => e,
                    Err(e) => {
                        reply.error(errno(&e));
                        return;
                    }
                };
            }
            if uid.is_some() || gid.is_some() {
                let new_uid = uid.map_or(updated.uid(), |u| u as i32);
                let new_gid = gid.map_or(updated.gid(), |g| g as i32);
                updated = updated.with_uid_gid(new_uid, new_gid);
            }
            if atime.is_some() || mtime.is_some() {
                let new_atime = atime.map_or(updated.atime(), time_or_now_to_secs);
                let new_mtime = mtime.map_or(updated.mtime(), time_or_now_to_secs);
                updated = updated.with_atime_mtime(new_atime, new_mtime);
            }

            if updated != entry {
                if let Err(e) = self.fs.write_attrs(&path, &updated) {
                    reply.error(errno(&e));
                    return;
                }
            }

            if let Some(size) = size {
                if let Err(e) = self.fs.truncate(&path, size) {
                    reply.error(errno(&e));
                    return;
                }
            }

            match self.attr_for(ino, &path, &updated) {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(code) => reply.error(code),
            }
        }

        fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
            let Some(path) = self.path_of(ino) else {
                reply.error(ENOENT);
                return;
            };
            match self.fs.read_sym_link(&path) {
                Ok(target) => reply.data(target.as_bytes()),
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn mkdir(
            &mut self,
            _req: &Request,
            parent: u64,
            name: &OsStr,
            mode: u32,
            _umask: u32,
            reply: ReplyEntry,
        ) {
            if let Err(code) = self.write_guard() {
                reply.error(code);
                return;
            }
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };
            debug!(path = %path, mode, "mkdir()");
            if let Err(e) = self.fs.create_directory_entry(&path, mode) {
                reply.error(errno(&e));
                return;
            }
            match self.lookup_attr(&path) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(code) => reply.error(code),
            }
        }

        fn create(
            &mut self,
            _req: &Request,
            parent: u64,
            name: &OsStr,
            mode: u32,
            _umask: u32,
            _flags: i32,
            reply: ReplyCreate,
        ) {
            if let Err(code) = self.write_guard() {
                reply.error(code);
                return;
            }
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };
            debug!(path = %path, mode, "create()");
            if let Err(e) = self.fs.create_file_entry(&path, mode) {
                reply.error(errno(&e));
                return;
            }
            match self.lookup_attr(&path) {
                Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
                Err(code) => reply.error(code),
            }
        }

        fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            if let Err(code) = self.write_guard() {
                reply.error(code);
                return;
            }
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };
            debug!(path = %path, "unlink()");
            match self.fs.remove_file_entry(&path) {
                Ok(()) => {
                    self.forget_path(&path);
                    reply.ok();
                }
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            if let Err(code) = self.write_guard() {
                reply.error(code);
                return;
            }
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };
            debug!(path = %path, "rmdir()");
            match self.fs.remove_directory_entry(&path) {
                Ok(()) => {
                    self.forget_path(&path);
                    reply.ok();
                }
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn symlink(
            &mut self,
            _req: &Request,
            parent: u64,
            link_name: &OsStr,
            target: &Path,
            reply: ReplyEntry,
        ) {
            if let Err(code) = self.write_guard() {
                reply.error(code);
                return;
            }
            let Some(path) = self.child_path(parent, link_name) else {
                reply.error(ENOENT);
                return;
            };
            let Some(target) = target.to_str() else {
                reply.error(EINVAL);
                return;
            };
            debug!(path = %path, target = %target, "symlink()");
            if let Err(e) = self.fs.create_sym_link(&path, target) {
                reply.error(errno(&e));
                return;
            }
            match self.lookup_attr(&path) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(code) => reply.error(code),
            }
        }

        fn rename(
            &mut self,
            _req: &Request,
            parent: u64,
            name: &OsStr,
            newparent: u64,
            newname: &OsStr,
            _flags: u32,
            reply: ReplyEmpty,
        ) {
            if let Err(code) = self.write_guard() {
                reply.error(code);
                return;
            }
            let (Some(old_path), Some(new_path)) = (
                self.child_path(parent, name),
                self.child_path(newparent, newname),
            ) else {
                reply.error(ENOENT);
                return;
            };
            debug!(old = %old_path, new = %new_path, "rename()");
            match self.fs.rename(&old_path, &new_path) {
                Ok(()) => {
                    self.forget_path(&old_path);
                    reply.ok();
                }
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn open(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
            reply.opened(0, 0);
        }

        fn read(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            offset: i64,
            size: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            let Some(path) = self.path_of(ino) else {
                reply.error(ENOENT);
                return;
            };
            if offset < 0 {
                reply.error(EINVAL);
                return;
            }
            match self.fs.read(&path, size as u64, offset as u64) {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn write(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            offset: i64,
            data: &[u8],
            _write_flags: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyWrite,
        ) {
            if let Err(code) = self.write_guard() {
                reply.error(code);
                return;
            }
            let Some(path) = self.path_of(ino) else {
                reply.error(ENOENT);
                return;
            };
            if offset < 0 {
                reply.error(EINVAL);
                return;
            }
            match self.fs.write_file_data(&path, data, offset as u64) {
                Ok(written) => reply.written(written as u32),
                Err(e) => reply.error(errno(&e)),
            }
        }

        fn flush(
            &mut self,
            _req: &Request,
            _ino: u64,
            _fh: u64,
            _lock_owner: u64,
            reply: ReplyEmpty,
        ) {
            reply.ok();
        }

        fn release(
            &mut self,
            _req: &Request,
            _ino: u64,
            _fh: u64,
            _flags: i32,
            _lock_owner: Option<u64>,
            _flush: bool,
            reply: ReplyEmpty,
        ) {
            reply.ok();
        }

        fn opendir(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
            reply.opened(0, 0);
        }

        fn readdir(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            offset: i64,
            mut reply: ReplyDirectory,
        ) {
            let Some(path) = self.path_of(ino) else {
                reply.error(ENOENT);
                return;
            };

            let names = match self.fs.directory_listing(&path) {
                Ok(names) => names,
                Err(e) => {
                    reply.error(errno(&e));
                    return;
                }
            };

            if offset == 0 {
                if reply.add(ino, 1, FileType::Directory, ".") {
                    reply.ok();
                    return;
                }
                if reply.add(ino, 2, FileType::Directory, "..") {
                    reply.ok();
                    return;
                }
            }

            // entries after the dots carry offsets 3, 4, 5, ...
            let skip = (offset - 2).max(0) as usize;
            for (i, name) in names.iter().enumerate().skip(skip) {
                let child_path = if path == "/" {
                    format!("/{name}")
                } else {
                    format!("{path}/{name}")
                };
                let (child_ino, kind) = match self.lookup_attr(&child_path) {
                    Ok(attr) => (attr.ino, attr.kind),
                    Err(_) => {
                        warn!(path = %child_path, "unresolvable directory entry");
                        continue;
                    }
                };
                if reply.add(child_ino, (i + 3) as i64, kind, name) {
                    break;
                }
            }
            reply.ok();
        }

        fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
            reply.ok();
        }

        fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
            match self.fs.statfs_info() {
                Ok(info) => reply.statfs(
                    info.pages_used,
                    FREE_PAGES,
                    FREE_PAGES,
                    0,
                    0,
                    info.page_size as u32,
                    NAME_MAX,
                    info.page_size as u32,
                ),
                Err(e) => reply.error(errno(&e)),
            }
        }
    }
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
mod imp {
    use std::path::Path;

    use vault_core::VaultFs;

    /// Stub for non-Linux targets or builds without the fuse feature.
    pub struct VaultFuseFs;

    pub struct MountSession;

    impl MountSession {
        pub fn unmount(self) {}
    }

    impl VaultFuseFs {
        pub fn new(_fs: VaultFs, _readonly: bool) -> Self {
            Self
        }

        pub fn mount(self, _mountpoint: &Path) -> anyhow::Result<()> {
            anyhow::bail!("FUSE support is only available on Linux builds with the fuse feature")
        }

        pub fn spawn_mount(self, _mountpoint: &Path) -> anyhow::Result<MountSession> {
            anyhow::bail!("FUSE support is only available on Linux builds with the fuse feature")
        }
    }
}

pub use imp::{MountSession, VaultFuseFs};
