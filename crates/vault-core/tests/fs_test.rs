//! Scenario tests driving the full facade over a real database directory.

use rand::RngCore;
use tempfile::TempDir;
use vault_core::{FileOpError, InodeEntry, VaultFs};
use vault_store::{init_store, open_store, InitParams};

const PAGE_SIZE: i32 = 32768;

fn open_fs(dir: &std::path::Path) -> VaultFs {
    let mut params = InitParams::new("test-password".to_string());
    params.page_size = PAGE_SIZE;
    init_store(dir, &params).unwrap();
    let env = open_store(dir, "test-password", false).unwrap();
    VaultFs::open(env).unwrap()
}

fn make_data(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

#[test]
fn create_write_length() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    let data = make_data(5555);
    fs.create_file_entry("/file1", 0o644).unwrap();
    fs.write_file_data("/file1", &data, 0).unwrap();

    assert_eq!(fs.file_length("/file1").unwrap(), Some(5555));
}

#[test]
fn create_write_read() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    let data = make_data(5555);
    fs.create_file_entry("/file1", 0o644).unwrap();
    fs.write_file_data("/file1", &data, 0).unwrap();

    let read_back = fs.read("/file1", 5555, 0).unwrap();
    assert_eq!(read_back.len(), 5555);
    assert_eq!(read_back, data);
}

#[test]
fn create_write_unlink_read() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    let data = make_data(5555);
    fs.create_file_entry("/file1", 0o644).unwrap();
    fs.write_file_data("/file1", &data, 0).unwrap();
    assert_eq!(fs.read("/file1", 5555, 0).unwrap(), data);

    let pages_with_file = fs.total_pages_used().unwrap();
    assert!(pages_with_file > 0);

    fs.remove_file_entry("/file1").unwrap();

    assert!(matches!(
        fs.read("/file1", 5555, 0),
        Err(FileOpError::NoSuchFile(_))
    ));
    assert_eq!(fs.total_pages_used().unwrap(), 0);
}

#[test]
fn directory_listing_in_storage_order() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    for path in [
        "/1", "/2", "/3", "/1/a", "/1/b", "/1/c", "/1/a/aaa", "/1/a/bbb", "/1/a/ccc",
    ] {
        fs.create_directory_entry(path, 0o755).unwrap();
    }

    assert_eq!(fs.directory_listing("/").unwrap(), vec!["1", "2", "3"]);
    assert_eq!(
        fs.directory_listing("/1/a").unwrap(),
        vec!["aaa", "bbb", "ccc"]
    );
    assert_eq!(fs.directory_listing("/2").unwrap(), Vec::<String>::new());
}

#[test]
fn zero_trailing_write_then_read() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    fs.create_file_entry("/z", 0o644).unwrap();
    fs.write_file_data("/z", &[0x10, 0x10, 0x00, 0x00], 0).unwrap();

    assert_eq!(fs.file_length("/z").unwrap(), Some(4));
    assert_eq!(fs.read("/z", 4, 0).unwrap(), vec![0x10, 0x10, 0x00, 0x00]);
}

#[test]
fn hole_write_reads_back_zeros() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    let tail = make_data(64);
    fs.create_file_entry("/holey", 0o644).unwrap();
    fs.write_file_data("/holey", &tail, 100_000).unwrap();

    assert_eq!(fs.file_length("/holey").unwrap(), Some(100_064));
    let all = fs.read("/holey", 100_064, 0).unwrap();
    assert!(all[..100_000].iter().all(|&b| b == 0));
    assert_eq!(&all[100_000..], &tail[..]);
}

#[test]
fn rename_is_observably_invertible() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    let data = make_data(1000);
    fs.create_directory_entry("/d", 0o755).unwrap();
    fs.create_file_entry("/d/a", 0o644).unwrap();
    fs.write_file_data("/d/a", &data, 0).unwrap();
    let attrs_before = fs.read_attrs("/d/a").unwrap().unwrap();

    fs.rename("/d/a", "/d/b").unwrap();
    assert!(fs.read_attrs("/d/a").unwrap().is_none());
    assert_eq!(fs.read("/d/b", 1000, 0).unwrap(), data);

    fs.rename("/d/b", "/d/a").unwrap();
    assert!(fs.read_attrs("/d/b").unwrap().is_none());
    assert_eq!(fs.read_attrs("/d/a").unwrap().unwrap(), attrs_before);
    assert_eq!(fs.read("/d/a", 1000, 0).unwrap(), data);
    assert_eq!(fs.directory_listing("/d").unwrap(), vec!["a"]);
}

#[test]
fn rename_directory_with_descendants() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    fs.create_directory_entry("/top", 0o755).unwrap();
    fs.create_directory_entry("/top/mid", 0o755).unwrap();
    fs.create_file_entry("/top/mid/leaf", 0o644).unwrap();
    fs.write_file_data("/top/mid/leaf", b"payload", 0).unwrap();

    // resolve through the cache first so the purge actually matters
    assert!(fs.read_attrs("/top/mid/leaf").unwrap().is_some());

    fs.rename("/top", "/moved").unwrap();

    assert!(fs.read_attrs("/top/mid/leaf").unwrap().is_none());
    assert_eq!(fs.read("/moved/mid/leaf", 7, 0).unwrap(), b"payload");
}

#[test]
fn rename_refuses_existing_destination_and_missing_parent() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    fs.create_file_entry("/a", 0o644).unwrap();
    fs.create_file_entry("/b", 0o644).unwrap();

    assert!(matches!(
        fs.rename("/a", "/b"),
        Err(FileOpError::FileExists(_))
    ));
    assert!(matches!(
        fs.rename("/a", "/nodir/a"),
        Err(FileOpError::NoSuchDir(_))
    ));
    assert!(matches!(
        fs.rename("/missing", "/c"),
        Err(FileOpError::NoSuchDir(_))
    ));
}

#[test]
fn truncate_scenario() {
    let dir = TempDir::new().unwrap();
    let small_pages = {
        let mut params = InitParams::new("pw".to_string());
        params.page_size = 1024;
        init_store(dir.path(), &params).unwrap();
        let env = open_store(dir.path(), "pw", false).unwrap();
        VaultFs::open(env).unwrap()
    };

    let data = make_data(5000);
    small_pages.create_file_entry("/big", 0o644).unwrap();
    small_pages.write_file_data("/big", &data, 0).unwrap();
    let pages_before = small_pages.total_pages_used().unwrap();

    small_pages.truncate("/big", 1024).unwrap();

    assert_eq!(small_pages.file_length("/big").unwrap(), Some(1024));
    assert!(pages_before - small_pages.total_pages_used().unwrap() >= 4);
    assert_eq!(
        small_pages.read("/big", 1, 1023).unwrap(),
        vec![data[1023]]
    );
    assert!(small_pages.read("/big", 1, 1024).unwrap().is_empty());
}

#[test]
fn unlink_requires_file_or_link() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    fs.create_directory_entry("/d", 0o755).unwrap();
    assert!(matches!(
        fs.remove_file_entry("/d"),
        Err(FileOpError::NotAFile(_))
    ));
    assert!(matches!(
        fs.remove_file_entry("/missing"),
        Err(FileOpError::NoSuchFile(_))
    ));
}

#[test]
fn rmdir_requires_empty_directory() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    fs.create_directory_entry("/d", 0o755).unwrap();
    fs.create_file_entry("/d/child", 0o644).unwrap();

    assert!(matches!(
        fs.remove_directory_entry("/d"),
        Err(FileOpError::DirNotEmpty(_))
    ));

    fs.remove_file_entry("/d/child").unwrap();
    fs.remove_directory_entry("/d").unwrap();
    assert!(fs.read_attrs("/d").unwrap().is_none());
}

#[test]
fn rmdir_rejects_files() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    fs.create_file_entry("/f", 0o644).unwrap();
    assert!(matches!(
        fs.remove_directory_entry("/f"),
        Err(FileOpError::NotADirectory(_))
    ));
}

#[test]
fn create_on_existing_path_is_refused() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    fs.create_file_entry("/f", 0o644).unwrap();
    assert!(matches!(
        fs.create_file_entry("/f", 0o644),
        Err(FileOpError::FileExists(_))
    ));
    assert!(matches!(
        fs.create_directory_entry("/f", 0o755),
        Err(FileOpError::FileExists(_))
    ));
}

#[test]
fn create_in_missing_parent_is_refused() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    assert!(matches!(
        fs.create_file_entry("/nodir/f", 0o644),
        Err(FileOpError::NoSuchDir(_))
    ));
}

#[test]
fn create_under_file_parent_is_refused() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    fs.create_file_entry("/f", 0o644).unwrap();
    assert!(matches!(
        fs.create_file_entry("/f/child", 0o644),
        Err(FileOpError::NotADirectory(_))
    ));
}

#[test]
fn symlink_roundtrip() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    fs.create_file_entry("/real", 0o644).unwrap();
    fs.create_sym_link("/link", "/real").unwrap();

    let attrs = fs.read_attrs("/link").unwrap().unwrap();
    assert!(attrs.is_link());
    assert_eq!(fs.read_sym_link("/link").unwrap(), "/real");

    // reading through a symlink entry is the host's job; the core refuses
    assert!(matches!(
        fs.read("/link", 1, 0),
        Err(FileOpError::NotAFile(_))
    ));

    fs.remove_file_entry("/link").unwrap();
    assert!(fs.read_attrs("/link").unwrap().is_none());
    assert!(fs.read_attrs("/real").unwrap().is_some());
}

#[test]
fn write_attrs_on_missing_path_is_refused() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    let attrs = InodeEntry::new_file();
    assert!(matches!(
        fs.write_attrs("/missing", &attrs),
        Err(FileOpError::NoSuchFile(_))
    ));
}

#[test]
fn chmod_style_attr_update() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    fs.create_file_entry("/f", 0o644).unwrap();
    let attrs = fs.read_attrs("/f").unwrap().unwrap();
    let updated = attrs.with_mode(vault_core::inode::S_IFREG | 0o600).unwrap();
    fs.write_attrs("/f", &updated).unwrap();

    assert_eq!(
        fs.read_attrs("/f").unwrap().unwrap().mode() & 0o777,
        0o600
    );
}

#[test]
fn parent_mtime_refreshes_on_child_create() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    fs.create_directory_entry("/d", 0o755).unwrap();
    let before = fs.read_attrs("/d").unwrap().unwrap();
    fs.create_file_entry("/d/child", 0o644).unwrap();
    let after = fs.read_attrs("/d").unwrap().unwrap();
    assert!(after.mtime() >= before.mtime());
}

#[test]
fn statfs_reports_page_geometry() {
    let dir = TempDir::new().unwrap();
    let fs = open_fs(dir.path());

    fs.create_file_entry("/f", 0o644).unwrap();
    fs.write_file_data("/f", &make_data(PAGE_SIZE as usize + 1), 0)
        .unwrap();

    let info = fs.statfs_info().unwrap();
    assert_eq!(info.page_size, PAGE_SIZE);
    assert_eq!(info.pages_used, 2);
}

#[test]
fn contents_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let data = make_data(3000);
    {
        let fs = open_fs(dir.path());
        fs.create_directory_entry("/keep", 0o755).unwrap();
        fs.create_file_entry("/keep/f", 0o644).unwrap();
        fs.write_file_data("/keep/f", &data, 0).unwrap();
        fs.close();
    }

    let env = open_store(dir.path(), "test-password", false).unwrap();
    let fs = VaultFs::open(env).unwrap();
    assert_eq!(fs.read("/keep/f", 3000, 0).unwrap(), data);
    assert_eq!(fs.directory_listing("/keep").unwrap(), vec!["f"]);
}
