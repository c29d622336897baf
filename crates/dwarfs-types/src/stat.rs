//! POSIX stat types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Mask selecting the file type bits of a mode.
const S_IFMT: u32 = 0o170000;

/// File type portion of a POSIX mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PosixFileType {
    Socket,
    Symlink,
    Regular,
    Block,
    Directory,
    Character,
    Fifo,
}

impl PosixFileType {
    /// Decode the `S_IFMT` bits of `mode`. Returns `None` for unknown types.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            0o140000 => Some(Self::Socket),
            0o120000 => Some(Self::Symlink),
            0o100000 => Some(Self::Regular),
            0o060000 => Some(Self::Block),
            0o040000 => Some(Self::Directory),
            0o020000 => Some(Self::Character),
            0o010000 => Some(Self::Fifo),
            _ => None,
        }
    }

    /// The `S_IFMT` bits for this type.
    pub fn to_mode(self) -> u32 {
        match self {
            Self::Socket => 0o140000,
            Self::Symlink => 0o120000,
            Self::Regular => 0o100000,
            Self::Block => 0o060000,
            Self::Directory => 0o040000,
            Self::Character => 0o020000,
            Self::Fifo => 0o010000,
        }
    }

    /// Single character used in `ls -l` style mode strings.
    pub fn type_char(self) -> char {
        match self {
            Self::Socket => 's',
            Self::Symlink => 'l',
            Self::Regular => '-',
            Self::Block => 'b',
            Self::Directory => 'd',
            Self::Character => 'c',
            Self::Fifo => 'p',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::Symlink => "symlink",
            Self::Regular => "regular",
            Self::Block => "block",
            Self::Directory => "directory",
            Self::Character => "character",
            Self::Fifo => "fifo",
        }
    }

    /// Block and character devices.
    pub fn is_device(&self) -> bool {
        matches!(self, Self::Block | Self::Character)
    }
}

impl fmt::Display for PosixFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render the nine permission characters plus setuid/setgid/sticky.
pub fn perm_string(mode: u32) -> String {
    let bit = |mask: u32, c: char| if mode & mask != 0 { c } else { '-' };
    let special = |exec: u32, special: u32, set: char| match (mode & exec != 0, mode & special != 0) {
        (true, true) => set,
        (false, true) => set.to_ascii_uppercase(),
        (true, false) => 'x',
        (false, false) => '-',
    };

    let mut s = String::with_capacity(9);
    s.push(bit(0o400, 'r'));
    s.push(bit(0o200, 'w'));
    s.push(special(0o100, 0o4000, 's'));
    s.push(bit(0o040, 'r'));
    s.push(bit(0o020, 'w'));
    s.push(special(0o010, 0o2000, 's'));
    s.push(bit(0o004, 'r'));
    s.push(bit(0o002, 'w'));
    s.push(special(0o001, 0o1000, 't'));
    s
}

/// Render a full `ls -l` style mode string, e.g. `drwxr-xr-x`.
pub fn mode_string(mode: u32) -> String {
    let kind = PosixFileType::from_mode(mode).map_or('?', PosixFileType::type_char);
    let mut s = String::with_capacity(10);
    s.push(kind);
    s.push_str(&perm_string(mode));
    s
}

/// Per-inode attributes, mirroring `struct stat`.
///
/// All fields are public so tests and tools can build records directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    /// Type and permission bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    /// Number of 512-byte blocks.
    pub blocks: u64,
    /// Seconds since the epoch.
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileStat {
    /// Create an empty stat record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from live filesystem metadata.
    #[cfg(unix)]
    pub fn from_metadata(md: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            dev: md.dev(),
            ino: md.ino(),
            nlink: md.nlink(),
            mode: md.mode(),
            uid: md.uid(),
            gid: md.gid(),
            rdev: md.rdev(),
            size: md.size(),
            blksize: md.blksize(),
            blocks: md.blocks(),
            atime: md.atime(),
            mtime: md.mtime(),
            ctime: md.ctime(),
        }
    }

    /// `lstat` a live path.
    #[cfg(unix)]
    pub fn from_path(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        std::fs::symlink_metadata(path).map(|md| Self::from_metadata(&md))
    }

    /// File type, if the mode carries a known one.
    pub fn file_type(&self) -> Option<PosixFileType> {
        PosixFileType::from_mode(self.mode)
    }

    /// Alias of [`FileStat::file_type`].
    pub fn status(&self) -> Option<PosixFileType> {
        self.file_type()
    }

    /// Permission bits including setuid/setgid/sticky.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Replace the permission bits, keeping the type.
    pub fn set_permissions(&mut self, perm: u32) {
        self.mode = (self.mode & S_IFMT) | (perm & 0o7777);
    }

    /// Replace the type bits, keeping the permissions.
    pub fn set_file_type(&mut self, kind: PosixFileType) {
        self.mode = kind.to_mode() | self.permissions();
    }

    pub fn is_directory(&self) -> bool {
        self.file_type() == Some(PosixFileType::Directory)
    }

    pub fn is_regular_file(&self) -> bool {
        self.file_type() == Some(PosixFileType::Regular)
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == Some(PosixFileType::Symlink)
    }

    pub fn is_device(&self) -> bool {
        self.file_type().is_some_and(|t| t.is_device())
    }

    pub fn mode_string(&self) -> String {
        mode_string(self.mode)
    }

    pub fn perm_string(&self) -> String {
        perm_string(self.mode)
    }
}

impl fmt::Display for FileStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "file_stat(mode={}, size={}, atime={}, mtime={}, ctime={})",
            self.mode_string(),
            self.size,
            self.atime,
            self.mtime,
            self.ctime
        )
    }
}

/// Volume statistics, mirroring `struct statvfs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfsStat {
    /// Filesystem block size.
    pub bsize: u64,
    /// Fragment size.
    pub frsize: u64,
    /// Size of the filesystem in `frsize` units.
    pub blocks: u64,
    /// Total inodes.
    pub files: u64,
    /// Maximum file name length.
    pub namemax: u64,
    pub readonly: bool,
}

impl fmt::Display for VfsStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vfs_stat(bsize={}, frsize={}, blocks={}, files={}, namemax={}, readonly={})",
            self.bsize, self.frsize, self.blocks, self.files, self.namemax, self.readonly
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_from_mode() {
        assert_eq!(PosixFileType::from_mode(0o040755), Some(PosixFileType::Directory));
        assert_eq!(PosixFileType::from_mode(0o100644), Some(PosixFileType::Regular));
        assert_eq!(PosixFileType::from_mode(0o120777), Some(PosixFileType::Symlink));
        assert_eq!(PosixFileType::from_mode(0o020620), Some(PosixFileType::Character));
        assert_eq!(PosixFileType::from_mode(0o644), None);
        for kind in [
            PosixFileType::Socket,
            PosixFileType::Symlink,
            PosixFileType::Regular,
            PosixFileType::Block,
            PosixFileType::Directory,
            PosixFileType::Character,
            PosixFileType::Fifo,
        ] {
            assert_eq!(PosixFileType::from_mode(kind.to_mode() | 0o644), Some(kind));
        }
    }

    #[test]
    fn test_mode_strings() {
        assert_eq!(mode_string(0o040755), "drwxr-xr-x");
        assert_eq!(mode_string(0o100644), "-rw-r--r--");
        assert_eq!(mode_string(0o104755), "-rwsr-xr-x");
        assert_eq!(mode_string(0o102644), "-rw-r-Sr--");
        assert_eq!(mode_string(0o041777), "drwxrwxrwt");
        assert_eq!(perm_string(0o1000), "--------T");
    }

    #[test]
    fn test_file_stat_setters() {
        let mut st = FileStat::new();
        st.set_file_type(PosixFileType::Regular);
        st.set_permissions(0o640);
        st.size = 4;
        st.uid = 1000;

        assert!(st.is_regular_file());
        assert!(!st.is_directory());
        assert_eq!(st.permissions(), 0o640);
        assert_eq!(st.mode, 0o100640);
        assert_eq!(st.perm_string(), "rw-r-----");

        st.set_file_type(PosixFileType::Block);
        assert!(st.is_device());
        assert_eq!(st.permissions(), 0o640);
    }

    #[test]
    fn test_display() {
        let st = FileStat {
            mode: 0o100644,
            size: 10,
            mtime: 5,
            ..Default::default()
        };
        assert_eq!(
            st.to_string(),
            "file_stat(mode=-rw-r--r--, size=10, atime=0, mtime=5, ctime=0)"
        );

        let vs = VfsStat {
            bsize: 1024,
            frsize: 1,
            blocks: 10,
            files: 3,
            namemax: 255,
            readonly: true,
        };
        assert_eq!(
            vs.to_string(),
            "vfs_stat(bsize=1024, frsize=1, blocks=10, files=3, namemax=255, readonly=true)"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_from_path() {
        let st = FileStat::from_path("/").unwrap();
        assert!(st.is_directory());
    }
}
