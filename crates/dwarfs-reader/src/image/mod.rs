//! On-image representation: sections, metadata and history.

pub mod history;
pub mod metadata;
pub mod section;

use tracing::instrument;

pub use history::{History, HistoryEntry};
pub use metadata::{ChunkData, DirEntryData, DirectoryData, FsOptions, InodeData, Metadata};
pub use section::{CompressionType, Section, SectionHeader, SectionTable, SectionType};

use crate::error::{FsError, FsResult};
use crate::logger::{Logger, log_debug, log_warn};
use crate::options::FilesystemOptions;
use crate::os_access::ImageBytes;

/// Everything decoded from an image at mount time.
#[derive(Debug)]
pub struct MountedImage {
    pub sections: SectionTable,
    pub metadata: Metadata,
    pub history: Option<History>,
    /// Block sections in block-number order.
    pub blocks: Vec<Section>,
    /// Hard link counts, when enabled.
    pub nlinks: Option<Vec<u32>>,
    /// Containing directory's entry for every dir entry.
    entry_parents: Vec<u32>,
    pub inode_offset: u64,
}

impl MountedImage {
    #[instrument(level = "debug", skip_all, fields(len = data.len()))]
    pub fn load(data: ImageBytes, options: &FilesystemOptions, lgr: &Logger) -> FsResult<Self> {
        let sections = SectionTable::locate(data, options.image_offset, lgr)?;

        let meta_section = sections
            .find(SectionType::MetadataV2)
            .ok_or_else(|| FsError::corrupt("mount", "no METADATA_V2 section"))?;
        if !meta_section.checksum_valid() {
            return Err(FsError::corrupt(
                "mount",
                format!("checksum mismatch in metadata section {}", meta_section.header.number),
            ));
        }
        let metadata = Metadata::decode(&meta_section.decompress("mount")?)?;

        let blocks: Vec<Section> = sections.of_type(SectionType::Block).cloned().collect();
        metadata.validate_bounds(blocks.len())?;
        if options.check_consistency {
            metadata.check_consistency()?;
        }

        let history = match sections.find(SectionType::History) {
            None => None,
            Some(s) => match s.decompress("mount").and_then(|raw| History::decode(&raw)) {
                Ok(h) => Some(h),
                Err(e) => {
                    log_warn!(lgr, "ignoring unreadable history: {e}");
                    None
                }
            },
        };

        let nlinks = options.enable_nlink.then(|| metadata.link_counts());

        let mut entry_parents = vec![0_u32; metadata.dir_entries.len()];
        for dir in &metadata.directories {
            for e in dir.entries() {
                entry_parents[e as usize] = dir.self_entry;
            }
        }

        log_debug!(
            lgr,
            "loaded {} sections, {} blocks, {} inodes",
            sections.sections().len(),
            blocks.len(),
            metadata.inode_count()
        );

        Ok(Self {
            sections,
            metadata,
            history,
            blocks,
            nlinks,
            entry_parents,
            inode_offset: options.inode_offset,
        })
    }

    /// `(major, minor)` format version of the first section.
    pub fn version(&self) -> (u8, u8) {
        self.sections
            .sections()
            .first()
            .map_or((section::MAJOR_VERSION, 0), |s| (s.header.major, s.header.minor))
    }

    pub fn nlink(&self, inode: u32) -> u64 {
        self.nlinks
            .as_ref()
            .map_or(1, |n| u64::from(n[inode as usize]))
    }

    /// Entry of the directory containing `entry`. The root is its own parent.
    pub fn parent_entry(&self, entry: u32) -> u32 {
        self.entry_parents[entry as usize]
    }

    /// Compressed size of the metadata section.
    pub fn metadata_size(&self) -> u64 {
        self.sections
            .find(SectionType::MetadataV2)
            .map_or(0, Section::length)
    }

    /// Reject inode numbers outside the inode table.
    pub fn check_inode(&self, op: &'static str, inode: u32) -> FsResult<()> {
        if (inode as usize) < self.metadata.inode_count() {
            Ok(())
        } else {
            Err(FsError::invalid_argument(op, format!("inode {inode} out of range")))
        }
    }
}
