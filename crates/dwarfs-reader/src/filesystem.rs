//! The filesystem handle.
//!
//! [`Filesystem`] owns a mounted image and its read engine. Every accessor
//! goes through [`Shared::image`] or [`Shared::mounted`], which fail with
//! `Closed` after [`Filesystem::close`]; views keep a reference to the same
//! shared state so they fail the same way.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use dwarfs_types::{FileStat, PosixFileType, ReadlinkMode, VfsStat};
use parking_lot::RwLock;
use tracing::instrument;

use crate::engine::{BlockCache, BlockRangeFuture, Inflight, InodeReader};
use crate::error::{FsError, FsResult};
use crate::image::MountedImage;
use crate::logger::{Logger, log_debug, log_error, log_verbose};
use crate::options::FilesystemOptions;
use crate::os_access::{ImageBytes, OsAccess};
use crate::perfmon::{self, PerfTimer, PerformanceMonitor};
use crate::view::{DirEntryRef, DirectoryView, InodeRef};

/// State that exists only while the filesystem is open.
#[derive(Clone)]
pub(crate) struct Mounted {
    pub(crate) image: Arc<MountedImage>,
    pub(crate) reader: Arc<InodeReader>,
}

/// State shared between a handle and the views derived from it.
pub(crate) struct Shared {
    state: RwLock<Option<Mounted>>,
    pub(crate) inflight: Arc<Inflight>,
    pub(crate) lgr: Logger,
}

impl Shared {
    pub(crate) fn mounted(&self, op: &'static str) -> FsResult<Mounted> {
        self.state.read().clone().ok_or(FsError::closed(op))
    }

    pub(crate) fn image(&self, op: &'static str) -> FsResult<Arc<MountedImage>> {
        self.state
            .read()
            .as_ref()
            .map(|m| Arc::clone(&m.image))
            .ok_or(FsError::closed(op))
    }

    fn is_open(&self) -> bool {
        self.state.read().is_some()
    }
}

#[derive(Default)]
struct FsTimers {
    find: Option<PerfTimer>,
    getattr: Option<PerfTimer>,
    readlink: Option<PerfTimer>,
    opendir: Option<PerfTimer>,
    readdir: Option<PerfTimer>,
    statvfs: Option<PerfTimer>,
    open: Option<PerfTimer>,
}

impl FsTimers {
    fn new(perfmon: Option<&PerformanceMonitor>) -> Self {
        let Some(pm) = perfmon else {
            return Self::default();
        };
        let timer = |name| pm.timer("filesystem_v2", name);
        Self {
            find: timer("find"),
            getattr: timer("getattr"),
            readlink: timer("readlink"),
            opendir: timer("opendir"),
            readdir: timer("readdir"),
            statvfs: timer("statvfs"),
            open: timer("open"),
        }
    }
}

/// A mounted, read-only image.
///
/// Dropping the handle closes it.
pub struct Filesystem {
    shared: Arc<Shared>,
    timers: FsTimers,
    perfmon: Option<Arc<PerformanceMonitor>>,
}

impl Filesystem {
    /// Mount the image at `path` with default options.
    pub fn open(
        lgr: Logger,
        os: &dyn OsAccess,
        path: &Path,
        perfmon: Option<Arc<PerformanceMonitor>>,
    ) -> FsResult<Self> {
        Self::open_with_options(lgr, os, path, perfmon, FilesystemOptions::default())
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open_with_options(
        lgr: Logger,
        os: &dyn OsAccess,
        path: &Path,
        perfmon: Option<Arc<PerformanceMonitor>>,
        options: FilesystemOptions,
    ) -> FsResult<Self> {
        let data = os
            .load_file(path)
            .map_err(|e| FsError::io("open", path.display().to_string(), e))?;
        let fs = Self::mount(lgr, data, perfmon, &options)?;
        log_verbose!(fs.shared.lgr, "mounted {}", path.display());
        Ok(fs)
    }

    fn mount(
        lgr: Logger,
        data: ImageBytes,
        perfmon: Option<Arc<PerformanceMonitor>>,
        options: &FilesystemOptions,
    ) -> FsResult<Self> {
        let image = Arc::new(MountedImage::load(data, options, &lgr)?);
        let cache = BlockCache::new(
            image.blocks.clone(),
            image.metadata.block_size as usize,
            options.max_cached_blocks,
            perfmon.as_deref(),
        );
        let reader = InodeReader::new(
            Arc::new(cache),
            options.effective_workers(),
            perfmon.as_deref(),
        )?;
        log_debug!(
            lgr,
            "{} inodes, {} blocks, {} fetch workers",
            image.metadata.inode_count(),
            image.blocks.len(),
            options.effective_workers()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                state: RwLock::new(Some(Mounted {
                    image,
                    reader: Arc::new(reader),
                })),
                inflight: Inflight::new(),
                lgr,
            }),
            timers: FsTimers::new(perfmon.as_deref()),
            perfmon,
        })
    }

    /// Release the image and stop the read engine.
    ///
    /// Waits for outstanding reads and `readv` fetches to finish. Calling it
    /// again is a no-op.
    #[instrument(skip(self))]
    pub fn close(&self) {
        let Some(mounted) = self.shared.state.write().take() else {
            return;
        };
        self.shared.inflight.wait_idle();
        mounted.reader.shutdown();
        log_debug!(self.shared.lgr, "filesystem closed");
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Run `f` with this filesystem, then close it.
    ///
    /// An error from `f` is logged and returned unchanged.
    pub fn scoped<T, E, F>(self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Filesystem) -> Result<T, E>,
        E: fmt::Display,
    {
        let result = f(&self);
        if let Err(e) = &result {
            log_error!(self.shared.lgr, "error in filesystem scope: {e}");
        }
        self.close();
        result
    }

    pub fn logger(&self) -> &Logger {
        &self.shared.lgr
    }

    pub fn perfmon(&self) -> Option<&Arc<PerformanceMonitor>> {
        self.perfmon.as_ref()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn root(&self) -> FsResult<DirEntryRef> {
        let img = self.shared.image("root")?;
        Ok(DirEntryRef::load(&self.shared, &img, 0))
    }

    /// Resolve a `/`-separated path. `None` if it does not exist.
    ///
    /// Leading, trailing and repeated separators are ignored, so `""` and
    /// `"/"` both name the root.
    pub fn find(&self, path: &str) -> FsResult<Option<DirEntryRef>> {
        let _section = perfmon::section(&self.timers.find);
        let img = self.shared.image("find")?;
        let md = &img.metadata;

        let mut entry = 0;
        for name in path.split('/').filter(|c| !c.is_empty()) {
            let Some(dir) = md.directory(md.entry_inode(entry)) else {
                return Ok(None);
            };
            match md.find_child(dir, name) {
                Some(child) => entry = child,
                None => return Ok(None),
            }
        }
        Ok(Some(DirEntryRef::load(&self.shared, &img, entry)))
    }

    /// Like [`Filesystem::find`], but a missing path is `NotFound`.
    pub fn resolve(&self, path: &str) -> FsResult<DirEntryRef> {
        self.find(path)?
            .ok_or_else(|| FsError::not_found("resolve", path.to_string()))
    }

    /// Entries of the directory at `path`, in directory order.
    pub fn list_dir(&self, path: &str) -> FsResult<Vec<DirEntryRef>> {
        let entry = self.resolve(path)?;
        let dir = self
            .opendir(entry.inode_num())?
            .ok_or(FsError::not_a_directory("list_dir", entry.inode_num()))?;
        dir.iter().collect()
    }

    /// Look up an inode by number. `None` if out of range.
    pub fn find_inode(&self, inode: u32) -> FsResult<Option<InodeRef>> {
        let _section = perfmon::section(&self.timers.find);
        let img = self.shared.image("find")?;
        if img.check_inode("find", inode).is_err() {
            return Ok(None);
        }
        Ok(Some(InodeRef::load(&img, inode)))
    }

    /// Open a regular file for reading. The handle is the inode number.
    pub fn open_inode(&self, inode: u32) -> FsResult<u32> {
        let _section = perfmon::section(&self.timers.open);
        let img = self.shared.image("open")?;
        img.check_inode("open", inode)?;
        if img.metadata.file_type(inode) != Some(PosixFileType::Regular) {
            return Err(FsError::invalid_argument(
                "open",
                format!("inode {inode} is not a regular file"),
            ));
        }
        Ok(inode)
    }

    pub fn getattr(&self, inode: u32) -> FsResult<FileStat> {
        let _section = perfmon::section(&self.timers.getattr);
        let img = self.shared.image("getattr")?;
        img.check_inode("getattr", inode)?;

        let md = &img.metadata;
        let size = md.size(inode);
        let (atime, mtime, ctime) = md.times(inode);
        Ok(FileStat {
            dev: 0,
            ino: u64::from(inode) + img.inode_offset,
            nlink: img.nlink(inode),
            mode: md.mode(inode),
            uid: md.uid(inode),
            gid: md.gid(inode),
            rdev: md.rdev(inode),
            size,
            blksize: 512,
            blocks: size.div_ceil(512),
            atime,
            mtime,
            ctime,
        })
    }

    pub fn readlink(&self, inode: u32, mode: ReadlinkMode) -> FsResult<String> {
        let _section = perfmon::section(&self.timers.readlink);
        let img = self.shared.image("readlink")?;
        img.check_inode("readlink", inode)?;
        let target = img
            .metadata
            .symlink_target(inode)
            .ok_or(FsError::not_a_symlink("readlink", inode))?;
        Ok(match mode {
            ReadlinkMode::Raw => target.to_string(),
            ReadlinkMode::Posix => target.replace('\\', "/"),
            ReadlinkMode::Preferred => {
                if std::path::MAIN_SEPARATOR == '/' {
                    target.replace('\\', "/")
                } else {
                    target.replace('/', std::path::MAIN_SEPARATOR_STR)
                }
            }
        })
    }

    /// `None` if `inode` is not a directory.
    pub fn opendir(&self, inode: u32) -> FsResult<Option<DirectoryView>> {
        let _section = perfmon::section(&self.timers.opendir);
        let img = self.shared.image("opendir")?;
        img.check_inode("opendir", inode)?;
        Ok(DirectoryView::load(&self.shared, &img, inode))
    }

    /// Entry at `offset` of `dir`, `None` past the end.
    pub fn readdir(&self, dir: &DirectoryView, offset: usize) -> FsResult<Option<DirEntryRef>> {
        let _section = perfmon::section(&self.timers.readdir);
        dir.get(offset)
    }

    pub fn dirsize(&self, dir: &DirectoryView) -> FsResult<usize> {
        self.shared.image("dirsize")?;
        Ok(dir.size())
    }

    fn regular_file(m: &Mounted, op: &'static str, inode: u32) -> FsResult<()> {
        m.image.check_inode(op, inode)?;
        if m.image.metadata.file_type(inode) != Some(PosixFileType::Regular) {
            return Err(FsError::invalid_argument(
                op,
                format!("inode {inode} is not a regular file"),
            ));
        }
        Ok(())
    }

    /// Read up to `size` bytes at `offset`.
    ///
    /// Short at end of file; empty past it. No lock shared with other
    /// readers is held while blocks are fetched.
    pub fn read(&self, inode: u32, size: usize, offset: u64) -> FsResult<Vec<u8>> {
        let _guard = self.shared.inflight.enter();
        let m = self.shared.mounted("read")?;
        Self::regular_file(&m, "read", inode)?;
        m.reader
            .read(m.image.metadata.file_chunks(inode), size, offset)
    }

    /// Whole file contents.
    pub fn read_all(&self, inode: u32) -> FsResult<Vec<u8>> {
        self.read(inode, usize::MAX, 0)
    }

    /// Issue one fetch per block segment of the range, in range order.
    ///
    /// Futures may complete in any order; concatenating their results in
    /// returned order gives the same bytes as [`Filesystem::read`].
    pub fn readv(&self, inode: u32, size: usize, offset: u64) -> FsResult<Vec<BlockRangeFuture>> {
        let _guard = self.shared.inflight.enter();
        let m = self.shared.mounted("readv")?;
        Self::regular_file(&m, "readv", inode)?;
        Ok(m.reader.readv(
            m.image.metadata.file_chunks(inode),
            size,
            offset,
            &self.shared.inflight,
        ))
    }

    pub fn statvfs(&self) -> FsResult<VfsStat> {
        let _section = perfmon::section(&self.timers.statvfs);
        let img = self.shared.image("statvfs")?;
        let md = &img.metadata;
        Ok(VfsStat {
            bsize: u64::from(md.block_size),
            frsize: 1,
            blocks: md.total_fs_size,
            files: md.inode_count() as u64,
            namemax: 255,
            readonly: true,
        })
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filesystem")
            .field("open", &self.is_open())
            .field("logger", &self.shared.lgr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::logger::Level;
    use crate::testing::{ImageWriter, MemoryOsAccess, mount};

    /// `/a/b.txt` = "abcd", empty `/c`.
    fn abc() -> Filesystem {
        mount(
            ImageWriter::new()
                .dir("a")
                .file("a/b.txt", b"abcd")
                .dir("c")
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_example_scenario() {
        let fs = abc();
        let b = fs.find("/a/b.txt").unwrap().expect("b.txt resolves");
        assert_eq!(fs.read(b.inode_num(), 2, 1).unwrap(), b"bc");

        let c = fs.find("/c").unwrap().unwrap();
        let view = fs.opendir(c.inode_num()).unwrap().unwrap();
        assert_eq!(fs.dirsize(&view).unwrap(), 0);
        assert!(fs.readdir(&view, 0).unwrap().is_none());
    }

    #[test]
    fn test_path_calls_raise_lookup_errors() {
        let fs = abc();
        assert_eq!(fs.resolve("a/b.txt").unwrap().name(), "b.txt");

        let err = fs.resolve("a/missing").unwrap_err();
        assert!(matches!(&err, FsError::NotFound { what, .. } if what == "a/missing"));
        assert_eq!(io::Error::from(err).kind(), io::ErrorKind::NotFound);

        let names: Vec<String> = fs
            .list_dir("/")
            .unwrap()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, ["a", "c"]);
        assert!(fs.list_dir("c").unwrap().is_empty());

        let b = fs.find("a/b.txt").unwrap().unwrap();
        let err = fs.list_dir("a/b.txt").unwrap_err();
        assert!(matches!(err, FsError::NotADirectory { inode, .. } if inode == b.inode_num()));
        assert!(matches!(fs.list_dir("nope"), Err(FsError::NotFound { .. })));

        fs.close();
        assert!(fs.resolve("a").unwrap_err().is_closed());
    }

    #[test]
    fn test_find_root_aliases() {
        let fs = abc();
        let root = fs.root().unwrap();
        assert_eq!(fs.find("").unwrap().unwrap(), root);
        assert_eq!(fs.find("/").unwrap().unwrap(), root);
        assert!(root.is_root());
    }

    #[test]
    fn test_find_misses_are_none() {
        let fs = abc();
        assert!(fs.find("/nope").unwrap().is_none());
        assert!(fs.find("/a/b.txt/below").unwrap().is_none());
        assert!(fs.find("/A/b.txt").unwrap().is_none());
        assert!(fs.find_inode(999).unwrap().is_none());
    }

    #[test]
    fn test_read_edges() {
        let fs = abc();
        let b = fs.find("a/b.txt").unwrap().unwrap().inode_num();
        assert_eq!(fs.read_all(b).unwrap(), b"abcd");
        assert_eq!(fs.read(b, 100, 2).unwrap(), b"cd");
        assert!(fs.read(b, 10, 4).unwrap().is_empty());
        assert!(fs.read(b, 10, 1 << 40).unwrap().is_empty());
        assert!(matches!(
            fs.read(9999, 1, 0),
            Err(FsError::InvalidArgument { op: "read", .. })
        ));
        let a = fs.find("a").unwrap().unwrap().inode_num();
        assert!(matches!(fs.read(a, 1, 0), Err(FsError::InvalidArgument { .. })));
    }

    #[test]
    fn test_open_inode() {
        let fs = abc();
        let b = fs.find("a/b.txt").unwrap().unwrap().inode_num();
        assert_eq!(fs.open_inode(b).unwrap(), b);
        let a = fs.find("a").unwrap().unwrap().inode_num();
        assert!(matches!(fs.open_inode(a), Err(FsError::InvalidArgument { .. })));
    }

    #[test]
    fn test_opendir_on_file_is_none() {
        let fs = abc();
        let b = fs.find("a/b.txt").unwrap().unwrap().inode_num();
        assert!(fs.opendir(b).unwrap().is_none());
        assert!(fs.opendir(12345).is_err());
    }

    #[test]
    fn test_getattr() {
        let fs = mount(
            ImageWriter::new()
                .file("big", &vec![7_u8; 1000])
                .hardlink("big2", "big")
                .dir("d")
                .dir("d/e")
                .mtime(1_700_000_000)
                .build()
                .unwrap(),
        );
        let big = fs.find("big").unwrap().unwrap().inode_num();
        let st = fs.getattr(big).unwrap();
        assert!(st.is_regular_file());
        assert_eq!(st.size, 1000);
        assert_eq!(st.blksize, 512);
        assert_eq!(st.blocks, 2);
        assert_eq!(st.nlink, 2);
        assert_eq!(st.mtime, 1_700_000_000);
        assert_eq!(st.ino, u64::from(big));
        assert_eq!(st.perm_string(), "rw-r--r--");

        let d = fs.find("d").unwrap().unwrap().inode_num();
        assert_eq!(fs.getattr(d).unwrap().nlink, 3);
        let root = fs.root().unwrap().inode_num();
        // 2 + "d"
        assert_eq!(fs.getattr(root).unwrap().nlink, 3);
    }

    #[test]
    fn test_getattr_inode_offset_and_nlink_off() {
        let img = ImageWriter::new().file("f", b"x").build().unwrap();
        let os = MemoryOsAccess::new().with_file("/img.dwarfs", img);
        let opts = FilesystemOptions::default()
            .with_inode_offset(1)
            .with_enable_nlink(false);
        let fs = Filesystem::open_with_options(
            Logger::tracing(Level::Warn),
            &os,
            Path::new("/img.dwarfs"),
            None,
            opts,
        )
        .unwrap();
        let f = fs.find("f").unwrap().unwrap().inode_num();
        let st = fs.getattr(f).unwrap();
        assert_eq!(st.ino, u64::from(f) + 1);
        assert_eq!(fs.getattr(0).unwrap().nlink, 1);
    }

    #[test]
    fn test_readlink_modes() {
        let fs = mount(
            ImageWriter::new()
                .file("t", b"target")
                .symlink("win", "dir\\t")
                .symlink("nix", "dir/t")
                .build()
                .unwrap(),
        );
        let win = fs.find("win").unwrap().unwrap().inode_num();
        assert_eq!(fs.readlink(win, ReadlinkMode::Raw).unwrap(), "dir\\t");
        assert_eq!(fs.readlink(win, ReadlinkMode::Posix).unwrap(), "dir/t");
        let nix = fs.find("nix").unwrap().unwrap().inode_num();
        let preferred = fs.readlink(nix, ReadlinkMode::Preferred).unwrap();
        assert_eq!(preferred, format!("dir{}t", std::path::MAIN_SEPARATOR));

        let t = fs.find("t").unwrap().unwrap().inode_num();
        assert!(matches!(
            fs.readlink(t, ReadlinkMode::Raw),
            Err(FsError::NotASymlink { inode, .. }) if inode == t
        ));
        assert_eq!(fs.getattr(win).unwrap().size, 5);
    }

    #[test]
    fn test_statvfs() {
        let fs = abc();
        let st = fs.statvfs().unwrap();
        assert_eq!(st.bsize, u64::from(ImageWriter::DEFAULT_BLOCK_SIZE));
        assert_eq!(st.frsize, 1);
        assert_eq!(st.blocks, 4);
        assert_eq!(st.files, 4);
        assert!(st.readonly);
        assert_eq!(st.namemax, 255);
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let fs = abc();
        let b = fs.find("a/b.txt").unwrap().unwrap().inode_num();
        fs.close();
        fs.close();
        assert!(!fs.is_open());

        assert!(fs.root().unwrap_err().is_closed());
        assert!(fs.find("a").unwrap_err().is_closed());
        assert!(fs.read(b, 1, 0).unwrap_err().is_closed());
        assert!(fs.readv(b, 1, 0).unwrap_err().is_closed());
        assert!(fs.getattr(b).unwrap_err().is_closed());
        assert!(fs.statvfs().unwrap_err().is_closed());
        assert!(fs.opendir(0).unwrap_err().is_closed());
        assert!(fs.readlink(b, ReadlinkMode::Raw).unwrap_err().is_closed());
    }

    #[test]
    fn test_close_drains_readv() {
        let data: Vec<u8> = (0..=255).cycle().take(64 * 1024).collect();
        let fs = mount(
            ImageWriter::new()
                .block_size(4096)
                .file("f", &data)
                .build()
                .unwrap(),
        );
        let f = fs.find("f").unwrap().unwrap().inode_num();
        let futures = fs.readv(f, usize::MAX, 0).unwrap();
        assert_eq!(futures.len(), 16);
        fs.close();

        let mut joined = Vec::new();
        for mut fut in futures {
            joined.extend_from_slice(fut.get().unwrap().data());
        }
        assert_eq!(joined, data);
    }

    #[test]
    fn test_scoped_closes_and_returns_error() {
        let fs = abc();
        let shared = Arc::clone(fs.shared());
        let result: Result<(), FsError> =
            fs.scoped(|fs| fs.readlink(0, ReadlinkMode::Raw).map(|_| ()));
        assert!(matches!(result, Err(FsError::NotASymlink { .. })));
        assert!(!shared.is_open());

        let fs = abc();
        let n = fs.scoped(|fs| fs.statvfs().map(|s| s.files)).unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn test_drop_closes() {
        let fs = abc();
        let entry = fs.find("a").unwrap().unwrap();
        drop(fs);
        assert!(entry.parent().unwrap_err().is_closed());
    }

    #[test]
    fn test_open_missing_image() {
        let os = MemoryOsAccess::new();
        let err = Filesystem::open(
            Logger::tracing(Level::Warn),
            &os,
            Path::new("/missing"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, FsError::Io { op: "open", .. }));
    }

    #[test]
    fn test_perfmon_timers() {
        let pm = PerformanceMonitor::create(["filesystem_v2", "inode_reader_v2"]);
        let img = ImageWriter::new().file("f", b"hello").build().unwrap();
        let os = MemoryOsAccess::new().with_file("/i", img);
        let fs = Filesystem::open(
            Logger::tracing(Level::Warn),
            &os,
            Path::new("/i"),
            Some(Arc::clone(&pm)),
        )
        .unwrap();
        let f = fs.find("f").unwrap().unwrap().inode_num();
        fs.getattr(f).unwrap();
        fs.read(f, 5, 0).unwrap();

        let summary = pm.summary();
        assert!(summary.contains("[filesystem_v2.find] samples: 1"));
        assert!(summary.contains("[filesystem_v2.getattr] samples: 1"));
        assert!(summary.contains("[inode_reader_v2.read] samples: 1"));
        assert!(!summary.contains("block_cache"));
    }
}
