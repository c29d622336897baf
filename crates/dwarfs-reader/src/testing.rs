//! Fixture builders: an in-memory image writer and OS access.
//!
//! Compiled for unit tests and behind the `test-support` feature so
//! downstream crates can build images in their own tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{FsError, FsResult};
use crate::filesystem::Filesystem;
use crate::image::metadata::{
    ChunkData, DirEntryData, DirectoryData, FsOptions, InodeData, Metadata,
};
use crate::image::section::{self, HEADER_SIZE, MAJOR_VERSION, MINOR_VERSION};
use crate::image::{CompressionType, History, HistoryEntry, SectionHeader, SectionType};
use crate::logger::{Level, Logger};
use crate::os_access::{ImageBytes, OsAccess};

const DIR_MODE: u32 = 0o040755;
const FILE_MODE: u32 = 0o100644;
const SYMLINK_MODE: u32 = 0o120777;
const CHAR_DEVICE_MODE: u32 = 0o020644;

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
    Symlink(String),
    Hardlink(String),
    CharDevice(u64),
}

/// Inode classes in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Class {
    Dir,
    Symlink,
    File,
    Device,
}

fn normalize(path: &str) -> String {
    path.split('/').filter(|c| !c.is_empty()).collect::<Vec<_>>().join("/")
}

fn split_parent(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

/// Builds complete images in memory.
///
/// Layout: one block section per `block_size` bytes of each file (files in
/// inode order), then METADATA_V2, the optional HISTORY and a trailing
/// SECTION_INDEX. Directory entries are sorted, inodes are numbered
/// directories first (breadth-first, root is 0), then symlinks, files and
/// devices.
#[derive(Debug, Clone)]
pub struct ImageWriter {
    nodes: BTreeMap<String, Node>,
    block_size: u32,
    compression: CompressionType,
    mtime: u64,
    history: Option<History>,
    with_index: bool,
}

impl Default for ImageWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageWriter {
    pub const DEFAULT_BLOCK_SIZE: u32 = 1 << 20;

    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::new(), Node::Dir);
        Self {
            nodes,
            block_size: Self::DEFAULT_BLOCK_SIZE,
            compression: CompressionType::None,
            mtime: 0,
            history: None,
            with_index: true,
        }
    }

    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = size.max(1);
        self
    }

    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Timestamp applied to every inode.
    pub fn mtime(mut self, secs: u64) -> Self {
        self.mtime = secs;
        self
    }

    pub fn history(mut self, entries: Vec<HistoryEntry>) -> Self {
        self.history = Some(History::new(entries));
        self
    }

    /// Leave out the trailing section index.
    pub fn without_index(mut self) -> Self {
        self.with_index = false;
        self
    }

    fn add(mut self, path: &str, node: Node) -> Self {
        let path = normalize(path);
        let mut parent = split_parent(&path).0.to_string();
        while !parent.is_empty() {
            self.nodes.entry(parent.clone()).or_insert(Node::Dir);
            parent = split_parent(&parent).0.to_string();
        }
        self.nodes.insert(path, node);
        self
    }

    pub fn dir(self, path: &str) -> Self {
        self.add(path, Node::Dir)
    }

    pub fn file(self, path: &str, data: &[u8]) -> Self {
        self.add(path, Node::File(data.to_vec()))
    }

    pub fn symlink(self, path: &str, target: &str) -> Self {
        self.add(path, Node::Symlink(target.to_string()))
    }

    /// Second entry for the inode at `existing`.
    pub fn hardlink(self, path: &str, existing: &str) -> Self {
        let existing = normalize(existing);
        self.add(path, Node::Hardlink(existing))
    }

    pub fn char_device(self, path: &str, rdev: u64) -> Self {
        self.add(path, Node::CharDevice(rdev))
    }

    fn children(&self) -> HashMap<&str, Vec<&str>> {
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for path in self.nodes.keys().map(String::as_str).filter(|p| !p.is_empty()) {
            children.entry(split_parent(path).0).or_default().push(path);
        }
        for list in children.values_mut() {
            list.sort_by(|a, b| split_parent(a).1.cmp(split_parent(b).1));
        }
        children
    }

    fn metadata(&self) -> FsResult<(Metadata, Vec<Vec<u8>>)> {
        let children = self.children();

        // Entries breadth-first; each directory's children are contiguous.
        let mut entry_paths: Vec<&str> = vec![""];
        let mut directories = Vec::new();
        let mut queue = VecDeque::from([(0_u32, 0_u32)]);
        while let Some((self_entry, parent_entry)) = queue.pop_front() {
            let path = entry_paths[self_entry as usize];
            let first_entry = entry_paths.len() as u32;
            let kids = children.get(path).cloned().unwrap_or_default();
            for kid in &kids {
                let e = entry_paths.len() as u32;
                entry_paths.push(*kid);
                if matches!(self.nodes.get(*kid), Some(Node::Dir)) {
                    queue.push_back((e, self_entry));
                }
            }
            directories.push(DirectoryData {
                first_entry,
                entry_count: kids.len() as u32,
                self_entry,
                parent_entry,
            });
        }

        // Inode numbers by class, in entry order within each class.
        let mut owners: Vec<(Class, &str)> = Vec::new();
        for &path in &entry_paths {
            let class = match &self.nodes[path] {
                Node::Dir => Class::Dir,
                Node::Symlink(_) => Class::Symlink,
                Node::File(_) => Class::File,
                Node::CharDevice(_) => Class::Device,
                Node::Hardlink(_) => continue,
            };
            owners.push((class, path));
        }
        owners.sort_by_key(|(class, _)| *class);
        let inode_of: HashMap<&str, u32> = owners
            .iter()
            .enumerate()
            .map(|(i, (_, p))| (*p, i as u32))
            .collect();

        let resolve = |path: &str| -> FsResult<u32> {
            match &self.nodes[path] {
                Node::Hardlink(target) => match self.nodes.get(target) {
                    Some(Node::File(_)) => Ok(inode_of[target.as_str()]),
                    _ => Err(FsError::invalid_argument(
                        "build",
                        format!("hard link {path} needs an existing file, got {target}"),
                    )),
                },
                _ => Ok(inode_of[path]),
            }
        };

        let mut md = Metadata {
            block_size: self.block_size,
            timestamp_base: self.mtime,
            time_resolution_sec: 1,
            options: FsOptions {
                mtime_only: false,
                dir_entries_sorted: true,
            },
            preferred_path_separator: '/',
            created_by: Some(format!("dwarfs-reader {}", env!("CARGO_PKG_VERSION"))),
            create_timestamp: Some(self.mtime),
            modes: vec![DIR_MODE, SYMLINK_MODE, FILE_MODE, CHAR_DEVICE_MODE],
            uids: vec![0],
            gids: vec![0],
            chunk_table: vec![0],
            ..Default::default()
        };

        for (e, path) in entry_paths.iter().enumerate() {
            md.names.push(split_parent(path).1.to_string());
            md.dir_entries.push(DirEntryData {
                name_index: e as u32,
                inode_num: resolve(path)?,
            });
        }

        let mut blocks = Vec::new();
        let mut class_rank: HashMap<Class, u32> = HashMap::new();
        for (class, path) in &owners {
            let rank = class_rank.entry(*class).or_default();
            let content_index = *rank;
            *rank += 1;
            let mode_index = match class {
                Class::Dir => 0,
                Class::Symlink => 1,
                Class::File => 2,
                Class::Device => 3,
            };
            match &self.nodes[*path] {
                Node::Dir => {}
                Node::Symlink(target) => md.symlinks.push(target.clone()),
                Node::CharDevice(rdev) => md.devices.push(*rdev),
                Node::File(data) => {
                    for piece in data.chunks(self.block_size as usize) {
                        md.chunks.push(ChunkData {
                            block: blocks.len() as u32,
                            offset: 0,
                            size: piece.len() as u32,
                        });
                        blocks.push(piece.to_vec());
                    }
                    md.chunk_table.push(md.chunks.len() as u32);
                    md.total_fs_size += data.len() as u64;
                }
                Node::Hardlink(_) => continue,
            }
            md.inodes.push(InodeData {
                mode_index,
                content_index,
                ..Default::default()
            });
        }

        // Directory rows are already in inode order.
        md.directories = directories;
        Ok((md, blocks))
    }

    /// Encode the complete image.
    pub fn build(&self) -> FsResult<Vec<u8>> {
        self.build_with(|_| {})
    }

    /// Encode the image after `edit` has altered the generated metadata.
    ///
    /// Used to produce damaged images that the writer would never emit.
    pub fn build_with(&self, edit: impl FnOnce(&mut Metadata)) -> FsResult<Vec<u8>> {
        let (mut md, blocks) = self.metadata()?;
        edit(&mut md);

        let mut payloads: Vec<(SectionType, Vec<u8>)> = blocks
            .into_iter()
            .map(|b| (SectionType::Block, b))
            .collect();
        payloads.push((SectionType::MetadataV2, md.encode()?));
        if let Some(history) = &self.history {
            payloads.push((SectionType::History, history.encode()?));
        }

        let mut out = Vec::new();
        let mut index = Vec::new();
        for (number, (t, raw)) in payloads.into_iter().enumerate() {
            index.extend(section::index_entry(t, out.len() as u64).to_le_bytes());
            let payload = match self.compression {
                CompressionType::Zstd => zstd::encode_all(&raw[..], 3)
                    .map_err(|e| FsError::io("build", "zstd", e))?,
                _ => raw,
            };
            write_section(&mut out, number as u32, t, self.compression, &payload);
        }

        if self.with_index {
            let number = (index.len() / 8) as u32;
            index.extend(section::index_entry(SectionType::SectionIndex, out.len() as u64).to_le_bytes());
            write_section(
                &mut out,
                number,
                SectionType::SectionIndex,
                CompressionType::None,
                &index,
            );
        }
        Ok(out)
    }
}

fn write_section(
    out: &mut Vec<u8>,
    number: u32,
    section_type: SectionType,
    compression: CompressionType,
    payload: &[u8],
) {
    let mut header = SectionHeader {
        major: MAJOR_VERSION,
        minor: MINOR_VERSION,
        checksum: [0; 32],
        number,
        section_type,
        compression,
        length: payload.len() as u64,
    };
    header.checksum = header.compute_checksum(payload);
    out.reserve(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
}

/// [`OsAccess`] over files held in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryOsAccess {
    files: HashMap<PathBuf, ImageBytes>,
}

impl MemoryOsAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, data: Vec<u8>) -> Self {
        self.files.insert(path.into(), data.into());
        self
    }
}

impl OsAccess for MemoryOsAccess {
    fn load_file(&self, path: &Path) -> io::Result<ImageBytes> {
        self.files.get(path).map(Arc::clone).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{}: no such file", path.display()))
        })
    }
}

/// Open `image` with default options and a quiet logger.
///
/// Panics if the image does not mount.
pub fn mount(image: Vec<u8>) -> Filesystem {
    let os = MemoryOsAccess::new().with_file("/image.dwarfs", image);
    match Filesystem::open(
        Logger::tracing(Level::Warn),
        &os,
        Path::new("/image.dwarfs"),
        None,
    ) {
        Ok(fs) => fs,
        Err(e) => panic!("fixture image failed to mount: {e}"),
    }
}
