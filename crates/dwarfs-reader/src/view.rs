//! Inode, directory entry and directory views.
//!
//! Views are cheap handles tied to the filesystem they came from. Anything
//! that needs the image again (walking to a parent, reading an entry)
//! reports `Closed` once that filesystem has been torn down.

use std::fmt;
use std::sync::Arc;

use dwarfs_types::{PosixFileType, mode_string, perm_string};

use crate::error::FsResult;
use crate::filesystem::Shared;
use crate::image::MountedImage;

/// Snapshot of the stat-relevant fields of one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeRef {
    inode: u32,
    mode: u32,
    uid: u32,
    gid: u32,
}

impl InodeRef {
    pub(crate) fn load(img: &MountedImage, inode: u32) -> Self {
        let md = &img.metadata;
        Self {
            inode,
            mode: md.mode(inode),
            uid: md.uid(inode),
            gid: md.gid(inode),
        }
    }

    pub fn inode_num(&self) -> u32 {
        self.inode
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn file_type(&self) -> Option<PosixFileType> {
        PosixFileType::from_mode(self.mode)
    }

    /// `ls -l` style, e.g. `drwxr-xr-x`.
    pub fn mode_string(&self) -> String {
        mode_string(self.mode)
    }

    /// Permission part only, e.g. `rwxr-xr-x`.
    pub fn perm_string(&self) -> String {
        perm_string(self.mode)
    }

    pub fn is_regular_file(&self) -> bool {
        self.file_type() == Some(PosixFileType::Regular)
    }

    pub fn is_directory(&self) -> bool {
        self.file_type() == Some(PosixFileType::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == Some(PosixFileType::Symlink)
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn getuid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn getgid(&self) -> u32 {
        self.gid
    }
}

impl fmt::Display for InodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inode_view(inode={})", self.inode)
    }
}

impl From<InodeRef> for u32 {
    fn from(inode: InodeRef) -> Self {
        inode.inode
    }
}

/// A named link to an inode inside its parent directory.
#[derive(Clone)]
pub struct DirEntryRef {
    shared: Arc<Shared>,
    entry: u32,
    name: String,
    inode: InodeRef,
}

impl DirEntryRef {
    pub(crate) fn load(shared: &Arc<Shared>, img: &MountedImage, entry: u32) -> Self {
        let md = &img.metadata;
        Self {
            shared: Arc::clone(shared),
            entry,
            name: md.entry_name(entry).to_string(),
            inode: InodeRef::load(img, md.entry_inode(entry)),
        }
    }

    /// Entry name; empty for the root.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inode(&self) -> InodeRef {
        self.inode
    }

    pub fn inode_num(&self) -> u32 {
        self.inode.inode
    }

    pub fn is_root(&self) -> bool {
        self.entry == 0
    }

    pub(crate) fn entry_index(&self) -> u32 {
        self.entry
    }

    /// Entry of the containing directory, `None` for the root.
    pub fn parent(&self) -> FsResult<Option<DirEntryRef>> {
        let img = self.shared.image("parent")?;
        if self.is_root() {
            return Ok(None);
        }
        let parent = img.parent_entry(self.entry);
        Ok(Some(Self::load(&self.shared, &img, parent)))
    }

    /// Path from the root using the host separator.
    pub fn path(&self) -> FsResult<String> {
        self.joined_path(std::path::MAIN_SEPARATOR_STR)
    }

    /// Path from the root using `/`, without a leading separator.
    ///
    /// The root itself is the empty string.
    pub fn unix_path(&self) -> FsResult<String> {
        self.joined_path("/")
    }

    fn joined_path(&self, sep: &str) -> FsResult<String> {
        let img = self.shared.image("path")?;
        let md = &img.metadata;
        let mut names = Vec::new();
        let mut entry = self.entry;
        while entry != 0 {
            names.push(md.entry_name(entry));
            entry = img.parent_entry(entry);
        }
        names.reverse();
        Ok(names.join(sep))
    }
}

impl PartialEq for DirEntryRef {
    fn eq(&self, other: &Self) -> bool {
        self.entry == other.entry && Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for DirEntryRef {}

impl fmt::Debug for DirEntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirEntryRef")
            .field("entry", &self.entry)
            .field("name", &self.name)
            .field("inode", &self.inode.inode)
            .finish()
    }
}

impl fmt::Display for DirEntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dir_entry_view(inode={}, name={})",
            self.inode.inode, self.name
        )
    }
}

/// The entries of one directory, in image order.
#[derive(Clone)]
pub struct DirectoryView {
    shared: Arc<Shared>,
    inode: u32,
    parent_inode: u32,
    first_entry: u32,
    size: u32,
}

impl DirectoryView {
    /// `None` if `inode` is not a directory.
    pub(crate) fn load(shared: &Arc<Shared>, img: &MountedImage, inode: u32) -> Option<Self> {
        let md = &img.metadata;
        let dir = md.directory(inode)?;
        Some(Self {
            shared: Arc::clone(shared),
            inode,
            parent_inode: md.entry_inode(dir.parent_entry),
            first_entry: dir.first_entry,
            size: dir.entry_count,
        })
    }

    pub fn inode(&self) -> u32 {
        self.inode
    }

    /// The root directory is its own parent.
    pub fn parent_inode(&self) -> u32 {
        self.parent_inode
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Entry at zero-based `offset`, `None` past the end.
    pub fn get(&self, offset: usize) -> FsResult<Option<DirEntryRef>> {
        let img = self.shared.image("readdir")?;
        if offset >= self.size() {
            return Ok(None);
        }
        let entry = self.first_entry + offset as u32;
        Ok(Some(DirEntryRef::load(&self.shared, &img, entry)))
    }

    pub fn iter(&self) -> DirIter<'_> {
        DirIter { view: self, pos: 0 }
    }
}

impl fmt::Debug for DirectoryView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryView")
            .field("inode", &self.inode)
            .field("size", &self.size)
            .finish()
    }
}

impl fmt::Display for DirectoryView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "directory_view(inode={}, size={})", self.inode, self.size)
    }
}

/// Iterator over a [`DirectoryView`]. Stops after the first error.
pub struct DirIter<'a> {
    view: &'a DirectoryView,
    pos: usize,
}

impl Iterator for DirIter<'_> {
    type Item = FsResult<DirEntryRef>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.view.size() {
            return None;
        }
        match self.view.get(self.pos) {
            Ok(Some(entry)) => {
                self.pos += 1;
                Some(Ok(entry))
            }
            Ok(None) => None,
            Err(e) => {
                self.pos = self.view.size();
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.view.size().saturating_sub(self.pos);
        (0, Some(left))
    }
}

impl<'a> IntoIterator for &'a DirectoryView {
    type Item = FsResult<DirEntryRef>;
    type IntoIter = DirIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use crate::error::FsError;
    use crate::testing::{ImageWriter, mount};

    fn sample() -> crate::Filesystem {
        mount(
            ImageWriter::new()
                .dir("foo")
                .dir("foo/1")
                .file("foo/1/2", b"two")
                .file("foo/1/fmt.sh", b"#!/bin/sh\n")
                .symlink("foo/link", "1/2")
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_inode_ref() {
        let fs = sample();
        let root = fs.root().unwrap();
        let inode = root.inode();
        assert!(inode.is_directory());
        assert_eq!(inode.mode_string(), "drwxr-xr-x");
        assert_eq!(inode.perm_string(), "rwxr-xr-x");
        assert_eq!(inode.to_string(), format!("inode_view(inode={})", inode.inode_num()));
        assert_eq!(inode.uid(), inode.getuid());

        let link = fs.find("foo/link").unwrap().unwrap();
        assert!(link.inode().is_symlink());
        assert_eq!(link.inode().mode_string(), "lrwxrwxrwx");
    }

    #[test]
    fn test_paths_and_parents() {
        let fs = sample();
        let entry = fs.find("/foo/1/fmt.sh").unwrap().unwrap();
        assert_eq!(entry.name(), "fmt.sh");
        assert_eq!(entry.unix_path().unwrap(), "foo/1/fmt.sh");
        assert!(!entry.is_root());

        let parent = entry.parent().unwrap().unwrap();
        assert_eq!(parent.unix_path().unwrap(), "foo/1");
        let grandparent = parent.parent().unwrap().unwrap();
        let root = grandparent.parent().unwrap().unwrap();
        assert!(root.is_root());
        assert_eq!(root, fs.root().unwrap());
        assert_eq!(root.unix_path().unwrap(), "");
        assert_eq!(root.parent().unwrap(), None);

        assert_eq!(
            entry.to_string(),
            format!("dir_entry_view(inode={}, name=fmt.sh)", entry.inode_num())
        );
    }

    #[test]
    fn test_directory_iteration_is_restartable() {
        let fs = sample();
        let dir = fs.find("foo/1").unwrap().unwrap();
        let view = fs.opendir(dir.inode_num()).unwrap().unwrap();
        assert_eq!(view.size(), 2);
        assert_eq!(view.parent_inode(), fs.find("foo").unwrap().unwrap().inode_num());

        let first: Vec<String> = view
            .iter()
            .map(|e| e.unwrap().unix_path().unwrap())
            .collect();
        assert_eq!(first, ["foo/1/2", "foo/1/fmt.sh"]);
        let second: Vec<String> = (&view)
            .into_iter()
            .map(|e| e.unwrap().unix_path().unwrap())
            .collect();
        assert_eq!(first, second);
        assert_eq!(
            view.to_string(),
            format!("directory_view(inode={}, size=2)", view.inode())
        );
    }

    #[test]
    fn test_views_fail_after_close() {
        let fs = sample();
        let entry = fs.find("foo/1/2").unwrap().unwrap();
        let view = fs.opendir(fs.root().unwrap().inode_num()).unwrap().unwrap();
        fs.close();

        assert!(matches!(entry.parent(), Err(FsError::Closed { .. })));
        assert!(entry.unix_path().unwrap_err().is_closed());
        let items: Vec<_> = view.iter().collect();
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap_err().is_closed());
        // Snapshot data stays readable.
        assert_eq!(entry.name(), "2");
    }
}
