//! Frozen filesystem metadata.
//!
//! The METADATA_V2 section holds one postcard-encoded [`Metadata`] record.
//! Every table is indexed by plain integers: inode numbers index `inodes`,
//! an inode's `content_index` selects a row in the table matching its type,
//! and directories own contiguous runs of `dir_entries`.

use dwarfs_types::PosixFileType;
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Build-time options recorded in the image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsOptions {
    /// Only mtime is stored; atime and ctime report it.
    pub mtime_only: bool,
    /// Entries of each directory are sorted by name.
    pub dir_entries_sorted: bool,
}

impl FsOptions {
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.mtime_only {
            names.push("mtime_only");
        }
        if self.dir_entries_sorted {
            names.push("dir_entries_sorted");
        }
        names
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeData {
    pub mode_index: u32,
    pub owner_index: u32,
    pub group_index: u32,
    pub atime_offset: u64,
    pub mtime_offset: u64,
    pub ctime_offset: u64,
    pub content_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryData {
    pub first_entry: u32,
    pub entry_count: u32,
    /// This directory's own entry.
    pub self_entry: u32,
    /// Entry of the containing directory; the root points at itself.
    pub parent_entry: u32,
}

impl DirectoryData {
    pub fn entries(&self) -> std::ops::Range<u32> {
        self.first_entry..self.first_entry + self.entry_count
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryData {
    pub name_index: u32,
    pub inode_num: u32,
}

/// One contiguous piece of file content inside a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkData {
    pub block: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub block_size: u32,
    pub total_fs_size: u64,
    pub timestamp_base: u64,
    pub time_resolution_sec: u32,
    pub options: FsOptions,
    pub preferred_path_separator: char,
    pub created_by: Option<String>,
    pub create_timestamp: Option<u64>,
    pub modes: Vec<u32>,
    pub uids: Vec<u32>,
    pub gids: Vec<u32>,
    pub names: Vec<String>,
    pub inodes: Vec<InodeData>,
    pub directories: Vec<DirectoryData>,
    pub dir_entries: Vec<DirEntryData>,
    pub chunk_table: Vec<u32>,
    pub chunks: Vec<ChunkData>,
    pub symlinks: Vec<String>,
    pub devices: Vec<u64>,
}

/// Row count and encoded size of one metadata table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStat {
    pub name: &'static str,
    pub rows: usize,
    pub bytes: usize,
}

fn corrupt(detail: impl Into<String>) -> FsError {
    FsError::corrupt("mount", detail)
}

impl Metadata {
    pub fn decode(bytes: &[u8]) -> FsResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| corrupt(format!("metadata: {e}")))
    }

    pub fn encode(&self) -> FsResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| corrupt(format!("metadata: {e}")))
    }

    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    pub fn mode(&self, inode: u32) -> u32 {
        self.modes[self.inodes[inode as usize].mode_index as usize]
    }

    pub fn file_type(&self, inode: u32) -> Option<PosixFileType> {
        PosixFileType::from_mode(self.mode(inode))
    }

    pub fn uid(&self, inode: u32) -> u32 {
        self.uids[self.inodes[inode as usize].owner_index as usize]
    }

    pub fn gid(&self, inode: u32) -> u32 {
        self.gids[self.inodes[inode as usize].group_index as usize]
    }

    fn content_index(&self, inode: u32) -> usize {
        self.inodes[inode as usize].content_index as usize
    }

    pub fn root_inode(&self) -> u32 {
        self.dir_entries[0].inode_num
    }

    pub fn entry_inode(&self, entry: u32) -> u32 {
        self.dir_entries[entry as usize].inode_num
    }

    pub fn entry_name(&self, entry: u32) -> &str {
        &self.names[self.dir_entries[entry as usize].name_index as usize]
    }

    /// Directory row of `inode`, if it is a directory.
    pub fn directory(&self, inode: u32) -> Option<&DirectoryData> {
        match self.file_type(inode) {
            Some(PosixFileType::Directory) => self.directories.get(self.content_index(inode)),
            _ => None,
        }
    }

    /// Chunks of a regular file; empty for anything else.
    pub fn file_chunks(&self, inode: u32) -> &[ChunkData] {
        if self.file_type(inode) != Some(PosixFileType::Regular) {
            return &[];
        }
        let k = self.content_index(inode);
        let begin = self.chunk_table[k] as usize;
        let end = self.chunk_table[k + 1] as usize;
        &self.chunks[begin..end]
    }

    pub fn symlink_target(&self, inode: u32) -> Option<&str> {
        match self.file_type(inode) {
            Some(PosixFileType::Symlink) => {
                self.symlinks.get(self.content_index(inode)).map(String::as_str)
            }
            _ => None,
        }
    }

    pub fn rdev(&self, inode: u32) -> u64 {
        match self.file_type(inode) {
            Some(t) if t.is_device() => {
                self.devices.get(self.content_index(inode)).copied().unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Content length as reported by `getattr`.
    pub fn size(&self, inode: u32) -> u64 {
        match self.file_type(inode) {
            Some(PosixFileType::Regular) => {
                self.file_chunks(inode).iter().map(|c| u64::from(c.size)).sum()
            }
            Some(PosixFileType::Symlink) => {
                self.symlink_target(inode).map_or(0, |t| t.len() as u64)
            }
            _ => 0,
        }
    }

    fn time(&self, offset: u64) -> i64 {
        let secs = self
            .timestamp_base
            .saturating_add(offset.saturating_mul(u64::from(self.time_resolution_sec.max(1))));
        i64::try_from(secs).unwrap_or(i64::MAX)
    }

    /// `(atime, mtime, ctime)` in seconds since the epoch.
    pub fn times(&self, inode: u32) -> (i64, i64, i64) {
        let data = &self.inodes[inode as usize];
        let mtime = self.time(data.mtime_offset);
        if self.options.mtime_only {
            (mtime, mtime, mtime)
        } else {
            (self.time(data.atime_offset), mtime, self.time(data.ctime_offset))
        }
    }

    /// Find the entry named `name` among the entries of `dir`.
    pub fn find_child(&self, dir: &DirectoryData, name: &str) -> Option<u32> {
        let range = dir.entries();
        if self.options.dir_entries_sorted {
            let entries = &self.dir_entries[range.start as usize..range.end as usize];
            entries
                .binary_search_by(|e| self.names[e.name_index as usize].as_str().cmp(name))
                .ok()
                .map(|pos| range.start + pos as u32)
        } else {
            range.into_iter().find(|&e| self.entry_name(e) == name)
        }
    }

    /// Hard link count per inode.
    ///
    /// Regular files and other non-directories count the entries referring
    /// to them; directories count `2 + subdirectories`.
    pub fn link_counts(&self) -> Vec<u32> {
        let mut counts: Vec<u32> = (0..self.inodes.len() as u32)
            .map(|i| if self.directory(i).is_some() { 2 } else { 0 })
            .collect();
        for (e, entry) in self.dir_entries.iter().enumerate() {
            let inode = entry.inode_num;
            if self.directory(inode).is_none() {
                counts[inode as usize] += 1;
            } else if e != 0 {
                // The root is its own parent and adds no link to itself.
                if let Some(parent) = self.parent_of_dir(inode) {
                    counts[parent as usize] += 1;
                }
            }
        }
        counts
    }

    fn parent_of_dir(&self, inode: u32) -> Option<u32> {
        self.directory(inode).map(|d| self.entry_inode(d.parent_entry))
    }

    /// Per-table row counts and encoded sizes, in encoding order.
    pub fn table_stats(&self) -> Vec<TableStat> {
        fn stat<T: Serialize>(name: &'static str, rows: usize, value: &T) -> TableStat {
            let bytes = postcard::to_allocvec(value).map_or(0, |v| v.len());
            TableStat { name, rows, bytes }
        }
        vec![
            stat("modes", self.modes.len(), &self.modes),
            stat("uids", self.uids.len(), &self.uids),
            stat("gids", self.gids.len(), &self.gids),
            stat("names", self.names.len(), &self.names),
            stat("inodes", self.inodes.len(), &self.inodes),
            stat("directories", self.directories.len(), &self.directories),
            stat("dir_entries", self.dir_entries.len(), &self.dir_entries),
            stat("chunk_table", self.chunk_table.len(), &self.chunk_table),
            stat("chunks", self.chunks.len(), &self.chunks),
            stat("symlinks", self.symlinks.len(), &self.symlinks),
            stat("devices", self.devices.len(), &self.devices),
        ]
    }

    /// Verify every index stays in range.
    ///
    /// Accessors index tables directly, so this always runs at mount.
    pub fn validate_bounds(&self, block_count: usize) -> FsResult<()> {
        if self.dir_entries.is_empty() {
            return Err(corrupt("no root directory entry"));
        }
        for (e, entry) in self.dir_entries.iter().enumerate() {
            if entry.name_index as usize >= self.names.len() {
                return Err(corrupt(format!("dir entry {e}: name index out of range")));
            }
            if entry.inode_num as usize >= self.inodes.len() {
                return Err(corrupt(format!("dir entry {e}: inode {} out of range", entry.inode_num)));
            }
        }

        if self.chunk_table.is_empty() {
            return Err(corrupt("empty chunk table"));
        }
        if self.chunk_table.windows(2).any(|w| w[0] > w[1])
            || *self.chunk_table.last().unwrap_or(&0) as usize != self.chunks.len()
        {
            return Err(corrupt("chunk table is not a valid index into chunks"));
        }
        for (c, chunk) in self.chunks.iter().enumerate() {
            if chunk.block as usize >= block_count {
                return Err(corrupt(format!("chunk {c}: block {} out of range", chunk.block)));
            }
        }

        for (i, inode) in self.inodes.iter().enumerate() {
            let mode = self
                .modes
                .get(inode.mode_index as usize)
                .ok_or_else(|| corrupt(format!("inode {i}: mode index out of range")))?;
            if inode.owner_index as usize >= self.uids.len()
                || inode.group_index as usize >= self.gids.len()
            {
                return Err(corrupt(format!("inode {i}: owner/group index out of range")));
            }
            let Some(kind) = PosixFileType::from_mode(*mode) else {
                return Err(corrupt(format!("inode {i}: unknown file type in mode {mode:o}")));
            };
            let k = inode.content_index as usize;
            let in_range = match kind {
                PosixFileType::Directory => k < self.directories.len(),
                PosixFileType::Regular => k + 1 < self.chunk_table.len(),
                PosixFileType::Symlink => k < self.symlinks.len(),
                PosixFileType::Block | PosixFileType::Character => k < self.devices.len(),
                PosixFileType::Fifo | PosixFileType::Socket => true,
            };
            if !in_range {
                return Err(corrupt(format!("inode {i}: content index {k} out of range")));
            }
        }

        for (k, dir) in self.directories.iter().enumerate() {
            let end = dir.first_entry as usize + dir.entry_count as usize;
            if end > self.dir_entries.len()
                || dir.self_entry as usize >= self.dir_entries.len()
                || dir.parent_entry as usize >= self.dir_entries.len()
            {
                return Err(corrupt(format!("directory {k}: entry range out of bounds")));
            }
        }

        if self.file_type(self.root_inode()) != Some(PosixFileType::Directory) {
            return Err(corrupt("root entry is not a directory"));
        }
        self.check_tree_shape()
    }

    /// No directory is reachable from the root more than once.
    fn check_tree_shape(&self) -> FsResult<()> {
        let mut seen = vec![false; self.directories.len()];
        let mut stack = vec![self.root_inode()];
        while let Some(inode) = stack.pop() {
            if self.file_type(inode) != Some(PosixFileType::Directory) {
                continue;
            }
            let k = self.content_index(inode);
            if std::mem::replace(&mut seen[k], true) {
                return Err(corrupt(format!("directory {k}: reachable more than once")));
            }
            stack.extend(self.directories[k].entries().map(|e| self.entry_inode(e)));
        }
        Ok(())
    }

    /// Structural checks beyond index bounds.
    pub fn check_consistency(&self) -> FsResult<()> {
        let root = self.root_inode();
        let Some(root_dir) = self.directory(root) else {
            return Err(corrupt("root entry is not a directory"));
        };
        if root_dir.self_entry != 0 || root_dir.parent_entry != 0 {
            return Err(corrupt("root directory does not point at entry 0"));
        }

        for (k, dir) in self.directories.iter().enumerate() {
            let owner = self.entry_inode(dir.self_entry);
            if self.directory(owner) != Some(dir) {
                return Err(corrupt(format!("directory {k}: self entry points elsewhere")));
            }
            for e in dir.entries() {
                if let Some(child) = self.directory(self.entry_inode(e)) {
                    if child.self_entry != e || child.parent_entry != dir.self_entry {
                        return Err(corrupt(format!("directory {k}: entry {e} has broken links")));
                    }
                }
            }
            if self.options.dir_entries_sorted {
                let sorted = dir
                    .entries()
                    .collect::<Vec<_>>()
                    .windows(2)
                    .all(|w| self.entry_name(w[0]) < self.entry_name(w[1]));
                if !sorted {
                    return Err(corrupt(format!("directory {k}: entries not sorted")));
                }
            }
        }

        for (c, chunk) in self.chunks.iter().enumerate() {
            if u64::from(chunk.offset) + u64::from(chunk.size) > u64::from(self.block_size) {
                return Err(corrupt(format!("chunk {c}: extends past block size")));
            }
        }
        Ok(())
    }
}
