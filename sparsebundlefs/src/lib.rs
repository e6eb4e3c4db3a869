use std::ffi::OsStr;
use std::os::raw::c_int;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, Request,
};
use libc::{EACCES, EINVAL, ENOENT};

use sparsebundle::{
    Bundle, CacheConfig, CopyReader, DescriptorCache, OpenLifecycle, ReadExecutor, ScatterReader,
};

// Re-export fuser types needed by consumers (avoids version mismatches)
pub use fuser::{mount2, MountOption};

/// Name of the single file exposed at the root of the mount.
pub const IMAGE_NAME: &str = "sparsebundle.dmg";

pub const ROOT_INO: u64 = 1;
pub const IMAGE_INO: u64 = 2;

// How long the kernel may cache attributes and entries. Image contents are
// not kept across opens.
const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 512;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("Could not stat sparse bundle. Path: '{}'", .1.display())]
    StatBundle(#[source] std::io::Error, std::path::PathBuf),

    #[error("Could not start read worker pool.")]
    ThreadPool(#[source] rayon::ThreadPoolBuildError),
}

/// How reads are turned into bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadMode {
    /// Open each band per read and copy into a reply buffer.
    #[default]
    Copy,
    /// Resolve reads to cached descriptor ranges, then gather them.
    Scatter,
}

#[derive(Debug, Clone, Default)]
pub struct FsOptions {
    pub mode: ReadMode,
    pub cache: CacheConfig,
    /// Read worker threads; `None` uses rayon's default.
    pub threads: Option<usize>,
}

/// Totals reported by `statfs`. The mount is read-only, so nothing is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub files: u64,
    pub bsize: u32,
    pub namelen: u32,
}

/// Ownership and timestamps of the bundle directory, mirrored onto the
/// mount. Informational only.
#[derive(Debug, Clone, Copy)]
struct BundleStat {
    uid: u32,
    gid: u32,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    crtime: SystemTime,
}

impl BundleStat {
    fn from_metadata(meta: &std::fs::Metadata) -> BundleStat {
        let ctime = unix_time(meta.ctime(), meta.ctime_nsec());
        BundleStat {
            uid: meta.uid(),
            gid: meta.gid(),
            atime: meta.accessed().unwrap_or(ctime),
            mtime: meta.modified().unwrap_or(ctime),
            ctime,
            crtime: meta.created().unwrap_or(ctime),
        }
    }

    fn attr(&self, ino: u64, kind: FileType, size: u64, perm: u16, nlink: u32) -> FileAttr {
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(BLOCK_SIZE as u64),
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.crtime,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            flags: 0,
            blksize: BLOCK_SIZE,
        }
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs.clamp(0, 999_999_999) as u32)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(secs.unsigned_abs()))
            .unwrap_or(UNIX_EPOCH)
    }
}

/// Exposes a sparse bundle as a directory holding one read-only image file.
pub struct SparseBundleFs {
    bundle: Arc<Bundle>,
    lifecycle: OpenLifecycle,
    reader: Arc<dyn ReadExecutor>,
    pool: rayon::ThreadPool,
    stat: BundleStat,
}

impl SparseBundleFs {
    pub fn new(bundle: Bundle, options: FsOptions) -> Result<Self, FsError> {
        let meta = std::fs::metadata(bundle.path())
            .map_err(|e| FsError::StatBundle(e, bundle.path().to_path_buf()))?;
        let stat = BundleStat::from_metadata(&meta);

        let bundle = Arc::new(bundle);
        let cache = Arc::new(DescriptorCache::new(options.cache));
        let reader: Arc<dyn ReadExecutor> = match options.mode {
            ReadMode::Copy => Arc::new(CopyReader::new(Arc::clone(&bundle))),
            ReadMode::Scatter => Arc::new(ScatterReader::new(Arc::clone(&bundle), Arc::clone(&cache))),
        };

        let mut pool = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("sparsebundlefs-read-{}", i));
        if let Some(threads) = options.threads {
            pool = pool.num_threads(threads);
        }
        let pool = pool.build().map_err(FsError::ThreadPool)?;

        tracing::debug!(
            mode = ?options.mode,
            threads = pool.current_num_threads(),
            max_open_files = cache.config().max_open_files,
            "filesystem ready"
        );

        Ok(SparseBundleFs {
            bundle,
            lifecycle: OpenLifecycle::new(cache),
            reader,
            pool,
            stat,
        })
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn lifecycle(&self) -> &OpenLifecycle {
        &self.lifecycle
    }

    /// Attributes for `ino`, or `None` if it is neither the root nor the image.
    pub fn attr(&self, ino: u64) -> Option<FileAttr> {
        match ino {
            ROOT_INO => Some(self.stat.attr(ROOT_INO, FileType::Directory, 0, 0o755, 3)),
            IMAGE_INO => Some(self.stat.attr(
                IMAGE_INO,
                FileType::RegularFile,
                self.bundle.size(),
                0o444,
                1,
            )),
            _ => None,
        }
    }

    pub fn lookup_child(&self, parent: u64, name: &OsStr) -> Option<FileAttr> {
        if parent == ROOT_INO && name == IMAGE_NAME {
            self.attr(IMAGE_INO)
        } else {
            None
        }
    }

    /// Directory entries of `ino` as `(ino, kind, name)`, or `None` if it is
    /// not a directory.
    pub fn entries(&self, ino: u64) -> Option<[(u64, FileType, &'static str); 3]> {
        if ino != ROOT_INO {
            return None;
        }

        Some([
            (ROOT_INO, FileType::Directory, "."),
            (ROOT_INO, FileType::Directory, ".."),
            (IMAGE_INO, FileType::RegularFile, IMAGE_NAME),
        ])
    }

    pub fn stats(&self) -> FsStats {
        FsStats {
            blocks: self.bundle.size().div_ceil(BLOCK_SIZE as u64),
            files: 1,
            bsize: BLOCK_SIZE,
            namelen: 255,
        }
    }

    /// Registers an open of `ino`. Only read-only opens of the image succeed.
    pub fn open_image(&self, ino: u64, flags: i32) -> Result<u64, c_int> {
        if ino != IMAGE_INO {
            return Err(ENOENT);
        }

        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(EACCES);
        }

        Ok(self.lifecycle.open())
    }

    /// Reads synchronously on the calling thread.
    pub fn read_image(&self, ino: u64, offset: i64, size: u32) -> Result<Vec<u8>, c_int> {
        let offset = image_offset(ino, offset)?;
        execute(&*self.reader, offset, size)
    }
}

fn image_offset(ino: u64, offset: i64) -> Result<u64, c_int> {
    if ino != IMAGE_INO {
        return Err(ENOENT);
    }
    u64::try_from(offset).map_err(|_| EINVAL)
}

fn execute(reader: &dyn ReadExecutor, offset: u64, size: u32) -> Result<Vec<u8>, c_int> {
    reader.read(offset, size as u64).map_err(|e| {
        tracing::error!(offset, size, error = %e, "read failed");
        e.errno()
    })
}

impl Filesystem for SparseBundleFs {
    fn destroy(&mut self) {
        self.lifecycle.cache().evict_all();
        tracing::debug!(path = %self.bundle.path().display(), "unmounted");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_child(parent, name) {
            Some(attr) => reply.entry(&TTL, &attr, 0),
            None => {
                tracing::trace!(parent, ?name, "lookup: not found");
                reply.error(ENOENT);
            }
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        tracing::trace!(ino, "getattr");
        match self.attr(ino) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.entries(ino) {
            Some(v) => v,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, i as i64 + 1, *kind, name) {
                break;
            }
        }

        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.open_image(ino, flags) {
            Ok(references) => {
                tracing::debug!(
                    path = %self.bundle.path().display(),
                    references,
                    "opened image"
                );
                reply.opened(0, 0);
            }
            Err(errno) => {
                tracing::debug!(ino, flags, errno, "open refused");
                reply.error(errno);
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = match image_offset(ino, offset) {
            Ok(v) => v,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        tracing::debug!(offset, size, "asked to read");

        let reader = Arc::clone(&self.reader);
        self.pool.spawn(move || match execute(&*reader, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if ino == IMAGE_INO {
            let references = self.lifecycle.release();
            tracing::debug!(
                path = %self.bundle.path().display(),
                references,
                "closed image"
            );
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.stats();
        reply.statfs(
            stats.blocks,  // blocks: total blocks
            0,             // bfree: free blocks (read-only)
            0,             // bavail: available blocks (read-only)
            stats.files,   // files: the image
            0,             // ffree: free inodes (read-only)
            stats.bsize,   // bsize: block size
            stats.namelen, // namelen: max filename length
            stats.bsize,   // frsize: fragment size
        );
    }
}

/// Maps a `-o` option to a mount option. `ro` is always forced, so `rw` and
/// `ro` map to nothing.
pub fn mount_option(option: &str) -> Option<MountOption> {
    let option = option.trim();
    let parsed = match option {
        "" | "ro" => return None,
        "rw" => {
            tracing::warn!("ignoring `rw`, sparse bundles are always mounted read-only");
            return None;
        }
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        other => match other.split_once('=') {
            Some(("fsname", v)) => MountOption::FSName(v.to_string()),
            Some(("subtype", v)) => MountOption::Subtype(v.to_string()),
            _ => MountOption::CUSTOM(other.to_string()),
        },
    };
    Some(parsed)
}
