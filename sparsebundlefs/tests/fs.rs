use std::ffi::OsStr;

use fuser::FileType;
use sparsebundle::{Bundle, CacheConfig};
use sparsebundlefs::{
    mount_option, FsOptions, FsStats, MountOption, ReadMode, SparseBundleFs, IMAGE_INO, IMAGE_NAME,
    ROOT_INO,
};
use tempfile::TempDir;

fn create_fs(mode: ReadMode) -> (TempDir, SparseBundleFs) {
    let temp_dir = TempDir::new().unwrap();
    let bands = temp_dir.path().join("bands");
    std::fs::create_dir_all(&bands).unwrap();
    std::fs::write(bands.join("0"), b"hello").unwrap();
    std::fs::write(bands.join("2"), b"world!!!").unwrap();

    let bundle = Bundle::new(temp_dir.path(), 8, 30).unwrap();
    let fs = SparseBundleFs::new(
        bundle,
        FsOptions {
            mode,
            cache: CacheConfig::default(),
            threads: Some(2),
        },
    )
    .unwrap();
    (temp_dir, fs)
}

#[test]
fn root_and_image_attributes() {
    let (temp_dir, fs) = create_fs(ReadMode::Copy);
    let meta = std::fs::metadata(temp_dir.path()).unwrap();

    let root = fs.attr(ROOT_INO).unwrap();
    assert_eq!(root.kind, FileType::Directory);
    assert_eq!(root.perm, 0o755);
    assert_eq!(root.nlink, 3);

    let image = fs.attr(IMAGE_INO).unwrap();
    assert_eq!(image.kind, FileType::RegularFile);
    assert_eq!(image.perm, 0o444);
    assert_eq!(image.nlink, 1);
    assert_eq!(image.size, 30);
    assert_eq!(image.mtime, meta.modified().unwrap());

    assert!(fs.attr(3).is_none());
}

#[test]
fn lookup_only_finds_image() {
    let (_temp_dir, fs) = create_fs(ReadMode::Copy);
    assert_eq!(
        fs.lookup_child(ROOT_INO, OsStr::new(IMAGE_NAME)).unwrap().ino,
        IMAGE_INO
    );
    assert!(fs.lookup_child(ROOT_INO, OsStr::new("other.dmg")).is_none());
    assert!(fs.lookup_child(IMAGE_INO, OsStr::new(IMAGE_NAME)).is_none());
}

#[test]
fn root_lists_image() {
    let (_temp_dir, fs) = create_fs(ReadMode::Copy);
    let entries = fs.entries(ROOT_INO).unwrap();
    let names: Vec<_> = entries.iter().map(|(_, _, name)| *name).collect();
    assert_eq!(names, vec![".", "..", IMAGE_NAME]);
    assert!(fs.entries(IMAGE_INO).is_none());
}

#[test]
fn write_opens_are_refused() {
    let (_temp_dir, fs) = create_fs(ReadMode::Copy);
    assert_eq!(fs.open_image(IMAGE_INO, libc::O_WRONLY), Err(libc::EACCES));
    assert_eq!(fs.open_image(IMAGE_INO, libc::O_RDWR), Err(libc::EACCES));
    assert_eq!(fs.open_image(ROOT_INO, libc::O_RDONLY), Err(libc::ENOENT));
    assert_eq!(fs.lifecycle().references(), 0);

    assert_eq!(fs.open_image(IMAGE_INO, libc::O_RDONLY), Ok(1));
    assert_eq!(fs.open_image(IMAGE_INO, libc::O_RDONLY | libc::O_NONBLOCK), Ok(2));
}

#[test]
fn reads_agree_between_modes() {
    let (_a, copy) = create_fs(ReadMode::Copy);
    let (_b, scatter) = create_fs(ReadMode::Scatter);

    let expected = b"hello\0\0\0\0\0\0\0\0\0\0\0world!!!\0\0\0\0\0\0".to_vec();
    assert_eq!(copy.read_image(IMAGE_INO, 0, 4096).unwrap(), expected);
    assert_eq!(scatter.read_image(IMAGE_INO, 0, 4096).unwrap(), expected);

    for offset in 0..32 {
        assert_eq!(
            copy.read_image(IMAGE_INO, offset, 9).unwrap(),
            scatter.read_image(IMAGE_INO, offset, 9).unwrap()
        );
    }
}

#[test]
fn invalid_reads() {
    let (_temp_dir, fs) = create_fs(ReadMode::Scatter);
    assert_eq!(fs.read_image(IMAGE_INO, -1, 10), Err(libc::EINVAL));
    assert_eq!(fs.read_image(ROOT_INO, 0, 10), Err(libc::ENOENT));
    assert_eq!(fs.read_image(IMAGE_INO, 100, 10), Ok(Vec::new()));
}

#[test]
fn last_release_clears_scatter_cache() {
    let (_temp_dir, fs) = create_fs(ReadMode::Scatter);
    fs.open_image(IMAGE_INO, libc::O_RDONLY).unwrap();
    fs.read_image(IMAGE_INO, 0, 30).unwrap();
    assert!(!fs.lifecycle().cache().is_empty());

    fs.lifecycle().release();
    assert!(fs.lifecycle().cache().is_empty());
}

#[test]
fn mount_options() {
    assert_eq!(mount_option("ro"), None);
    assert_eq!(mount_option("rw"), None);
    assert_eq!(mount_option("allow_other"), Some(MountOption::AllowOther));
    assert_eq!(
        mount_option("fsname=disk"),
        Some(MountOption::FSName("disk".to_string()))
    );
    assert_eq!(
        mount_option("uid=501"),
        Some(MountOption::CUSTOM("uid=501".to_string()))
    );
}

#[test]
fn statfs_counts_whole_blocks() {
    let (_temp_dir, fs) = create_fs(ReadMode::Copy);
    assert_eq!(
        fs.stats(),
        FsStats {
            blocks: 1,
            files: 1,
            bsize: 512,
            namelen: 255,
        }
    );

    let temp_dir = TempDir::new().unwrap();
    for (size, blocks) in [(0, 0), (512, 1), (1025, 3)] {
        let bundle = Bundle::new(temp_dir.path(), 8, size).unwrap();
        let fs = SparseBundleFs::new(bundle, FsOptions::default()).unwrap();
        assert_eq!(fs.stats().blocks, blocks, "size {}", size);
        assert_eq!(fs.attr(IMAGE_INO).unwrap().blocks, blocks);
    }
}

#[test]
fn missing_bundle_directory_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let bundle = Bundle::new(temp_dir.path().join("gone"), 8, 8).unwrap();
    assert!(SparseBundleFs::new(bundle, FsOptions::default()).is_err());
}
