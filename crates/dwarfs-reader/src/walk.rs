//! Whole-tree traversal in namespace order and in data order.

use crate::error::{FsResult, WalkError};
use crate::filesystem::Filesystem;
use crate::image::MountedImage;
use crate::view::DirEntryRef;

/// Pre-order entry indices: parents first, children in directory order.
fn namespace_order(img: &MountedImage) -> Vec<u32> {
    let md = &img.metadata;
    let mut order = Vec::with_capacity(md.dir_entries.len());
    let mut stack = vec![0_u32];
    while let Some(entry) = stack.pop() {
        order.push(entry);
        if let Some(dir) = md.directory(md.entry_inode(entry)) {
            stack.extend(dir.entries().rev());
        }
    }
    order
}

/// Entries reordered by the position of their first data chunk.
///
/// Entries without data (directories, links, empty files) come first in
/// namespace order, so directories always precede their contents.
fn data_order(img: &MountedImage) -> Vec<u32> {
    let md = &img.metadata;
    let mut order = namespace_order(img);
    order.sort_by_key(|&entry| {
        md.file_chunks(md.entry_inode(entry))
            .first()
            .map(|c| (c.block, c.offset))
    });
    order
}

impl Filesystem {
    fn walk_entries<F, E>(&self, order: Vec<u32>, mut visitor: F) -> Result<(), WalkError<E>>
    where
        F: FnMut(&DirEntryRef) -> Result<(), E>,
    {
        for entry in order {
            // Closing mid-walk stops the walk.
            let img = self.shared().image("walk")?;
            let view = DirEntryRef::load(self.shared(), &img, entry);
            visitor(&view).map_err(WalkError::VisitorAborted)?;
        }
        Ok(())
    }

    /// Visit every entry once, parents before children.
    ///
    /// A visitor error stops the walk and is returned as
    /// [`WalkError::VisitorAborted`].
    pub fn walk<F, E>(&self, visitor: F) -> Result<(), WalkError<E>>
    where
        F: FnMut(&DirEntryRef) -> Result<(), E>,
    {
        let img = self.shared().image("walk")?;
        self.walk_entries(namespace_order(&img), visitor)
    }

    /// Visit every entry once, file contents in storage order.
    pub fn walk_data_order<F, E>(&self, visitor: F) -> Result<(), WalkError<E>>
    where
        F: FnMut(&DirEntryRef) -> Result<(), E>,
    {
        let img = self.shared().image("walk_data_order")?;
        self.walk_entries(data_order(&img), visitor)
    }

    /// Every entry in the order [`Filesystem::walk`] visits them.
    pub fn entries_dfs(&self) -> FsResult<Vec<DirEntryRef>> {
        let img = self.shared().image("entries_dfs")?;
        Ok(namespace_order(&img)
            .into_iter()
            .map(|entry| DirEntryRef::load(self.shared(), &img, entry))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::convert::Infallible;
    use std::path::Path;

    use crate::error::{FsError, WalkError};
    use crate::logger::{Level, Logger};
    use crate::options::FilesystemOptions;
    use crate::testing::{ImageWriter, MemoryOsAccess, mount};

    fn tree() -> crate::Filesystem {
        mount(
            ImageWriter::new()
                .block_size(8)
                .dir("foo")
                .dir("foo/1")
                .file("foo/1/2", b"second")
                .file("foo/1/fmt.sh", b"#!/bin/sh\n")
                .file("foo/bar", b"first")
                .file("empty", b"")
                .symlink("link", "foo/bar")
                .build()
                .unwrap(),
        )
    }

    fn collect_walk(fs: &crate::Filesystem) -> Vec<String> {
        let mut paths = Vec::new();
        fs.walk(|e| {
            paths.push(e.unix_path().unwrap());
            Ok::<_, Infallible>(())
        })
        .unwrap();
        paths
    }

    #[test]
    fn test_namespace_order() {
        let fs = tree();
        assert_eq!(
            collect_walk(&fs),
            [
                "", "empty", "foo", "foo/1", "foo/1/2", "foo/1/fmt.sh", "foo/bar", "link"
            ]
        );
        let dfs: Vec<String> = fs
            .entries_dfs()
            .unwrap()
            .iter()
            .map(|e| e.unix_path().unwrap())
            .collect();
        assert_eq!(dfs, collect_walk(&fs));
    }

    #[test]
    fn test_readdir_matches_walk_children() {
        let fs = tree();
        let mut walked = Vec::new();
        fs.walk(|e| {
            walked.push(e.clone());
            Ok::<_, Infallible>(())
        })
        .unwrap();

        for dir in walked.iter().filter(|e| e.inode().is_directory()) {
            let view = fs.opendir(dir.inode_num()).unwrap().unwrap();
            let listed: Vec<String> = (0..fs.dirsize(&view).unwrap())
                .map(|i| fs.readdir(&view, i).unwrap().unwrap().unix_path().unwrap())
                .collect();
            let children: Vec<String> = walked
                .iter()
                .filter(|e| !e.is_root() && e.parent().unwrap().as_ref() == Some(dir))
                .map(|e| e.unix_path().unwrap())
                .collect();
            assert_eq!(listed, children, "children of {:?}", dir.unix_path());
            let unique: BTreeSet<_> = listed.iter().collect();
            assert_eq!(unique.len(), listed.len());
        }
    }

    #[test]
    fn test_data_order() {
        let fs = tree();
        let mut paths = Vec::new();
        fs.walk_data_order(|e| {
            paths.push(e.unix_path().unwrap());
            Ok::<_, Infallible>(())
        })
        .unwrap();

        // Same set as the namespace walk.
        let mut sorted = paths.clone();
        sorted.sort();
        let mut ns = collect_walk(&fs);
        ns.sort();
        assert_eq!(sorted, ns);

        // Data files follow their write order in the image.
        let files: Vec<&str> = paths
            .iter()
            .map(String::as_str)
            .filter(|p| ["foo/1/2", "foo/1/fmt.sh", "foo/bar"].contains(p))
            .collect();
        assert_eq!(files, ["foo/bar", "foo/1/2", "foo/1/fmt.sh"]);
        let pos = |p: &str| paths.iter().position(|x| x == p).unwrap();
        assert!(pos("foo") < pos("foo/1/2"));
        assert!(pos("foo/1") < pos("foo/1/2"));
    }

    #[test]
    fn test_visitor_error_aborts() {
        let fs = tree();
        let mut seen = 0;
        let err = fs
            .walk(|e| {
                seen += 1;
                if e.name() == "foo" {
                    Err("stop here")
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert_eq!(err.into_visitor_error(), Some("stop here"));
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_self_listing_root_fails_to_mount() {
        let image = ImageWriter::new()
            .file("a", b"x")
            .build_with(|md| {
                md.directories[0].first_entry = 0;
                md.directories[0].entry_count = 1;
            })
            .unwrap();
        for check in [true, false] {
            let os = MemoryOsAccess::new().with_file("/img", image.clone());
            let err = crate::Filesystem::open_with_options(
                Logger::tracing(Level::Warn),
                &os,
                Path::new("/img"),
                None,
                FilesystemOptions::default().with_check_consistency(check),
            )
            .unwrap_err();
            assert!(matches!(err, FsError::Corrupt { .. }), "{err}");
        }
    }

    #[test]
    fn test_walk_after_close() {
        let fs = tree();
        fs.close();
        let err = fs.walk(|_| Ok::<_, Infallible>(())).unwrap_err();
        assert!(matches!(err, WalkError::Fs(e) if e.is_closed()));
        assert!(fs.entries_dfs().unwrap_err().is_closed());
    }
}
