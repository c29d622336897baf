//! Introspection: text dumps, structured info and metadata export.
//!
//! Everything here reads the already-decoded metadata. Block payloads are
//! only touched for `section_details` checksums and `chunk_details`, and only
//! as far as [`BlockAccessLevel`] allows. A restrictive level reduces the
//! report, it never fails the call.

use std::fmt::Write;

use dwarfs_types::{BlockAccessLevel, FsInfoFeature, FsInfoOptions, PosixFileType, mode_string};
use serde_json::{Map, Value, json};

use crate::error::{FsError, FsResult};
use crate::filesystem::Filesystem;
use crate::image::history::format_timestamp;
use crate::image::{MountedImage, Section};

const NO_BLOCK_ACCESS: &str = "block access not permitted";

/// `1 MiB`, `64 KiB`, `1.5 GiB`, `17 B`.
pub(crate) fn size_with_unit(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut unit = 0;
    let mut value = bytes as f64;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if value.fract() == 0.0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn checksum_state(section: &Section, access: BlockAccessLevel) -> &'static str {
    if !access.allows_verify() {
        "unchecked"
    } else if section.checksum_valid() {
        "valid"
    } else {
        "INVALID"
    }
}

/// Encoded byte range of every metadata table, in encoding order.
fn table_layout(img: &MountedImage) -> Vec<(&'static str, usize, usize)> {
    let mut offset = 0;
    img.metadata
        .table_stats()
        .into_iter()
        .map(|t| {
            let range = (t.name, offset, t.bytes);
            offset += t.bytes;
            range
        })
        .collect()
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// Uncompressed size of every block, or the reason it is unknown.
fn block_sizes(img: &MountedImage, access: BlockAccessLevel) -> Vec<Result<usize, String>> {
    img.blocks
        .iter()
        .map(|b| {
            if !access.allows_read() {
                return Err(NO_BLOCK_ACCESS.to_string());
            }
            if access.allows_verify() && !b.checksum_valid() {
                return Err("checksum mismatch".to_string());
            }
            b.decompress_bounded("dump", img.metadata.block_size as usize)
                .map(|d| d.len())
                .map_err(|e| e.to_string())
        })
        .collect()
}

/// `(depth, entry)` pairs in namespace order.
fn tree_entries(img: &MountedImage) -> Vec<(usize, u32)> {
    let md = &img.metadata;
    let mut out = Vec::new();
    let mut stack = vec![(0_usize, 0_u32)];
    while let Some((depth, entry)) = stack.pop() {
        out.push((depth, entry));
        if let Some(dir) = md.directory(md.entry_inode(entry)) {
            stack.extend(dir.entries().rev().map(|e| (depth + 1, e)));
        }
    }
    out
}

fn regular_files(img: &MountedImage) -> impl Iterator<Item = u32> + '_ {
    let md = &img.metadata;
    (0..md.inode_count() as u32).filter(move |&i| md.file_type(i) == Some(PosixFileType::Regular))
}

fn dump_version(out: &mut String, img: &MountedImage) {
    let (major, minor) = img.version();
    let _ = writeln!(
        out,
        "DwarFS version {major}.{minor} [{} sections]",
        img.sections.sections().len()
    );
    if let Some(by) = &img.metadata.created_by {
        let _ = writeln!(out, "created by: {by}");
    }
    if let Some(ts) = img.metadata.create_timestamp {
        let _ = writeln!(out, "created on: {}", format_timestamp(ts));
    }
}

fn dump_summary(out: &mut String, img: &MountedImage) {
    let md = &img.metadata;
    let options = md.options.names();
    let _ = writeln!(out, "block size: {}", size_with_unit(u64::from(md.block_size)));
    let _ = writeln!(out, "block count: {}", img.blocks.len());
    let _ = writeln!(out, "inode count: {}", md.inode_count());
    let _ = writeln!(out, "original filesystem size: {}", size_with_unit(md.total_fs_size));
    let _ = writeln!(
        out,
        "compressed metadata size: {}",
        size_with_unit(img.metadata_size())
    );
    let _ = writeln!(
        out,
        "options: {}",
        if options.is_empty() { "none".to_string() } else { options.join(",") }
    );
    let _ = writeln!(out, "preferred path separator: {}", md.preferred_path_separator);
}

fn dump_sections(out: &mut String, img: &MountedImage, access: BlockAccessLevel) {
    for s in img.sections.sections() {
        let _ = writeln!(
            out,
            "SECTION num={}, type={}, compression={}, length={}, {}",
            s.header.number,
            s.section_type(),
            s.compression(),
            s.length(),
            checksum_state(s, access)
        );
    }
}

fn dump_chunks(out: &mut String, img: &MountedImage, access: BlockAccessLevel) {
    let _ = writeln!(out, "blocks:");
    for (n, size) in block_sizes(img, access).into_iter().enumerate() {
        match size {
            Ok(size) => {
                let _ = writeln!(
                    out,
                    "  block {n}: {} compressed, {size} uncompressed",
                    img.blocks[n].length()
                );
            }
            Err(reason) => {
                let _ = writeln!(out, "  block {n}: {} compressed, {reason}", img.blocks[n].length());
            }
        }
    }
    let _ = writeln!(out, "files:");
    for inode in regular_files(img) {
        let chunks = img.metadata.file_chunks(inode);
        let _ = writeln!(out, "  inode {inode}: {} chunks", chunks.len());
        for c in chunks {
            let _ = writeln!(out, "    [{}, {}+{}]", c.block, c.offset, c.size);
        }
    }
}

fn dump_metadata_details(out: &mut String, img: &MountedImage) {
    let _ = writeln!(out, "metadata tables:");
    for t in img.metadata.table_stats() {
        let _ = writeln!(out, "  {}: {} rows", t.name, t.rows);
    }
}

fn dump_frozen_analysis(out: &mut String, img: &MountedImage) {
    let stats = img.metadata.table_stats();
    let total: usize = stats.iter().map(|t| t.bytes).sum();
    let _ = writeln!(out, "frozen metadata by table ({total} bytes):");
    for t in stats {
        let _ = writeln!(
            out,
            "  {:>10} {:5.1}% {}",
            t.bytes,
            percent(t.bytes, total),
            t.name
        );
    }
}

fn dump_frozen_layout(out: &mut String, img: &MountedImage) {
    let _ = writeln!(out, "frozen metadata layout:");
    for (name, offset, size) in table_layout(img) {
        let _ = writeln!(out, "  {offset:>10}..{:<10} {name}", offset + size);
    }
}

fn dump_tree(out: &mut String, img: &MountedImage) {
    let md = &img.metadata;
    for (depth, entry) in tree_entries(img) {
        let inode = md.entry_inode(entry);
        let name = if entry == 0 { "/" } else { md.entry_name(entry) };
        let _ = write!(
            out,
            "{:indent$}{} {:>10} {name}",
            "",
            mode_string(md.mode(inode)),
            md.size(inode),
            indent = depth * 2
        );
        if let Some(target) = md.symlink_target(inode) {
            let _ = write!(out, " -> {target}");
        }
        out.push('\n');
    }
}

fn version_json(img: &MountedImage) -> Value {
    let (major, minor) = img.version();
    json!({
        "major": major,
        "minor": minor,
        "sections": img.sections.sections().len(),
        "created_by": img.metadata.created_by,
        "created_on": img.metadata.create_timestamp,
    })
}

fn summary_json(img: &MountedImage) -> Value {
    let md = &img.metadata;
    json!({
        "block_size": md.block_size,
        "block_count": img.blocks.len(),
        "inode_count": md.inode_count(),
        "original_filesystem_size": md.total_fs_size,
        "compressed_metadata_size": img.metadata_size(),
        "options": md.options.names(),
        "preferred_path_separator": md.preferred_path_separator.to_string(),
    })
}

fn sections_json(img: &MountedImage, access: BlockAccessLevel) -> Value {
    img.sections
        .sections()
        .iter()
        .map(|s| {
            json!({
                "number": s.header.number,
                "type": s.section_type().to_string(),
                "compression": s.compression().to_string(),
                "offset": s.offset,
                "length": s.length(),
                "checksum": checksum_state(s, access).to_lowercase(),
            })
        })
        .collect()
}

fn chunks_json(img: &MountedImage, access: BlockAccessLevel) -> Value {
    let blocks: Vec<Value> = block_sizes(img, access)
        .into_iter()
        .enumerate()
        .map(|(n, size)| {
            let mut block = json!({
                "block": n,
                "compressed_size": img.blocks[n].length(),
            });
            match size {
                Ok(size) => block["size"] = json!(size),
                Err(reason) => block["error"] = json!(reason),
            }
            block
        })
        .collect();
    let files: Vec<Value> = regular_files(img)
        .map(|inode| {
            json!({
                "inode": inode,
                "chunks": img.metadata.file_chunks(inode),
            })
        })
        .collect();
    json!({ "blocks": blocks, "files": files })
}

fn tree_json(img: &MountedImage, entry: u32) -> Value {
    let md = &img.metadata;
    let inode = md.entry_inode(entry);
    let mut node = json!({
        "name": md.entry_name(entry),
        "inode": inode,
        "mode": mode_string(md.mode(inode)),
        "size": md.size(inode),
    });
    if let Some(dir) = md.directory(inode) {
        node["entries"] = dir.entries().map(|e| tree_json(img, e)).collect();
    }
    node
}

fn metadata_json(img: &MountedImage, op: &'static str) -> FsResult<Value> {
    serde_json::to_value(&img.metadata)
        .map_err(|e| FsError::corrupt(op, format!("metadata export: {e}")))
}

impl Filesystem {
    /// Human-readable report of the features selected in `options`.
    pub fn dump(&self, options: &FsInfoOptions) -> FsResult<String> {
        let img = self.shared().image("dump")?;
        let access = options.block_access;
        let mut out = String::new();
        for feature in options.features.iter() {
            match feature {
                FsInfoFeature::Version => dump_version(&mut out, &img),
                FsInfoFeature::History => {
                    if let Some(history) = img.history.as_ref().filter(|h| !h.is_empty()) {
                        let _ = writeln!(out, "history:");
                        out.push_str(&history.dump());
                    }
                }
                FsInfoFeature::MetadataSummary => dump_summary(&mut out, &img),
                FsInfoFeature::MetadataDetails => dump_metadata_details(&mut out, &img),
                FsInfoFeature::MetadataFullDump => {
                    let value = metadata_json(&img, "dump")?;
                    let text = serde_json::to_string_pretty(&value)
                        .map_err(|e| FsError::corrupt("dump", e.to_string()))?;
                    out.push_str(&text);
                    out.push('\n');
                }
                FsInfoFeature::FrozenAnalysis => dump_frozen_analysis(&mut out, &img),
                FsInfoFeature::FrozenLayout => dump_frozen_layout(&mut out, &img),
                FsInfoFeature::DirectoryTree => dump_tree(&mut out, &img),
                FsInfoFeature::SectionDetails => dump_sections(&mut out, &img, access),
                FsInfoFeature::ChunkDetails => dump_chunks(&mut out, &img, access),
            }
        }
        Ok(out)
    }

    /// Structured report keyed by the verbatim feature names.
    pub fn info(&self, options: &FsInfoOptions) -> FsResult<Value> {
        let img = self.shared().image("info")?;
        let access = options.block_access;
        let mut doc = Map::new();
        for feature in options.features.iter() {
            let value = match feature {
                FsInfoFeature::Version => version_json(&img),
                FsInfoFeature::History => img
                    .history
                    .as_ref()
                    .map_or_else(|| Value::Array(Vec::new()), |h| h.to_json()),
                FsInfoFeature::MetadataSummary => summary_json(&img),
                FsInfoFeature::MetadataDetails => img
                    .metadata
                    .table_stats()
                    .into_iter()
                    .map(|t| (t.name.to_string(), json!(t.rows)))
                    .collect::<Map<_, _>>()
                    .into(),
                FsInfoFeature::MetadataFullDump => metadata_json(&img, "info")?,
                FsInfoFeature::FrozenAnalysis => {
                    let stats = img.metadata.table_stats();
                    let total: usize = stats.iter().map(|t| t.bytes).sum();
                    stats
                        .iter()
                        .map(|t| {
                            json!({
                                "name": t.name,
                                "bytes": t.bytes,
                                "percent": percent(t.bytes, total),
                            })
                        })
                        .collect()
                }
                FsInfoFeature::FrozenLayout => table_layout(&img)
                    .into_iter()
                    .map(|(name, offset, size)| json!({ "name": name, "offset": offset, "size": size }))
                    .collect(),
                FsInfoFeature::DirectoryTree => tree_json(&img, 0),
                FsInfoFeature::SectionDetails => sections_json(&img, access),
                FsInfoFeature::ChunkDetails => chunks_json(&img, access),
            };
            doc.insert(feature.as_str().to_string(), value);
        }
        Ok(Value::Object(doc))
    }

    /// Per-inode detail: type, ownership, size and content placement.
    pub fn get_inode_info(&self, inode: u32) -> FsResult<Value> {
        let img = self.shared().image("get_inode_info")?;
        img.check_inode("get_inode_info", inode)?;
        let md = &img.metadata;
        let mode = md.mode(inode);
        let mut info = json!({
            "inode": inode,
            "mode": mode,
            "modestring": mode_string(mode),
            "type": md.file_type(inode).map(|t| t.as_str()),
            "uid": md.uid(inode),
            "gid": md.gid(inode),
            "size": md.size(inode),
        });
        if let Some(target) = md.symlink_target(inode) {
            info["target"] = json!(target);
        } else if let Some(dir) = md.directory(inode) {
            info["entries"] = json!(dir.entry_count);
        } else if md.file_type(inode) == Some(PosixFileType::Regular) {
            info["chunks"] = json!(md.file_chunks(inode));
        }
        Ok(info)
    }

    /// The complete decoded metadata.
    pub fn get_metadata(&self) -> FsResult<Value> {
        let img = self.shared().image("get_metadata")?;
        metadata_json(&img, "get_metadata")
    }

    /// Build history, `None` when the image carries none.
    pub fn get_history(&self) -> FsResult<Option<Value>> {
        let img = self.shared().image("get_history")?;
        Ok(img.history.as_ref().map(|h| h.to_json()))
    }
}

#[cfg(test)]
mod tests {
    use dwarfs_types::FsInfoFeatures;

    use super::*;
    use crate::image::{CompressionType, HistoryEntry};
    use crate::testing::{ImageWriter, mount};

    fn sample() -> ImageWriter {
        ImageWriter::new()
            .block_size(4)
            .dir("docs")
            .file("docs/readme", b"hello world")
            .symlink("latest", "docs/readme")
            .mtime(1_700_000_000)
    }

    fn opts(level: u32, access: BlockAccessLevel) -> FsInfoOptions {
        FsInfoOptions::for_level(level, access)
    }

    #[test]
    fn test_size_with_unit() {
        assert_eq!(size_with_unit(1 << 20), "1 MiB");
        assert_eq!(size_with_unit(4096), "4 KiB");
        assert_eq!(size_with_unit(1536), "1.5 KiB");
        assert_eq!(size_with_unit(17), "17 B");
    }

    #[test]
    fn test_dump_level1() {
        let fs = mount(ImageWriter::new().file("f", b"x").build().unwrap());
        let d = fs.dump(&opts(1, BlockAccessLevel::Unrestricted)).unwrap();
        assert!(d.starts_with("DwarFS version 2.5"), "{d}");
        assert!(d.contains("created by: dwarfs-reader"));
        assert!(d.contains("block size: 1 MiB"));
        assert!(d.contains("inode count: 2"));
        assert!(d.contains("options: dir_entries_sorted"));
        assert!(!d.contains("SECTION"));
    }

    #[test]
    fn test_dump_level3_sections() {
        let fs = mount(sample().build().unwrap());
        let d = fs.dump(&opts(3, BlockAccessLevel::Unrestricted)).unwrap();
        // 3 blocks, metadata, index
        assert!(d.contains("SECTION num=0, type=BLOCK, compression=NONE, length=4, valid"));
        assert!(d.contains("SECTION num=3, type=METADATA_V2"));
        assert!(d.contains("SECTION num=4, type=SECTION_INDEX"));
        assert!(d.contains("metadata tables:"));

        let d = fs.dump(&opts(3, BlockAccessLevel::NoAccess)).unwrap();
        assert!(d.contains("length=4, unchecked"));
    }

    #[test]
    fn test_chunk_details_respects_block_access() {
        let fs = mount(sample().compression(CompressionType::Zstd).build().unwrap());
        let features = FsInfoFeatures::from(FsInfoFeature::ChunkDetails);

        let reduced = fs
            .dump(&FsInfoOptions {
                features,
                block_access: BlockAccessLevel::NoAccess,
            })
            .unwrap();
        assert!(reduced.contains(NO_BLOCK_ACCESS));
        assert!(reduced.contains("3 chunks"));

        let full = fs
            .info(&FsInfoOptions {
                features,
                block_access: BlockAccessLevel::NoVerify,
            })
            .unwrap();
        let blocks = full["chunk_details"]["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0]["size"], 4);
        assert_eq!(blocks[2]["size"], 3);
    }

    #[test]
    fn test_info_keys_are_feature_names() {
        let fs = mount(sample().build().unwrap());
        let info = fs
            .info(&FsInfoOptions {
                features: FsInfoFeatures::all(),
                block_access: BlockAccessLevel::Unrestricted,
            })
            .unwrap();
        let keys: Vec<&str> = info.as_object().unwrap().keys().map(String::as_str).collect();
        for f in FsInfoFeatures::all().iter() {
            assert!(keys.contains(&f.as_str()), "missing {f}");
        }
        assert_eq!(info["metadata_summary"]["inode_count"], 4);
        assert_eq!(info["version"]["major"], 2);
        assert_eq!(info["directory_tree"]["entries"][0]["name"], "docs");
        assert_eq!(info["section_details"][0]["checksum"], "valid");

        let empty = fs.info(&FsInfoOptions::default()).unwrap();
        assert_eq!(empty, json!({}));
    }

    #[test]
    fn test_directory_tree_dump() {
        let fs = mount(sample().build().unwrap());
        let d = fs
            .dump(&FsInfoOptions {
                features: FsInfoFeature::DirectoryTree.into(),
                block_access: BlockAccessLevel::NoAccess,
            })
            .unwrap();
        let lines: Vec<&str> = d.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("drwxr-xr-x"));
        assert!(lines[0].ends_with(" /"));
        assert!(lines[1].starts_with("  drwxr-xr-x"));
        assert!(lines[2].starts_with("    -rw-r--r--"));
        assert!(lines[2].ends_with(" readme"));
        assert!(lines[3].ends_with("latest -> docs/readme"));
    }

    #[test]
    fn test_inode_info() {
        let fs = mount(sample().build().unwrap());
        let readme = fs.find("docs/readme").unwrap().unwrap().inode_num();
        let info = fs.get_inode_info(readme).unwrap();
        assert_eq!(info["type"], "regular");
        assert_eq!(info["modestring"], "-rw-r--r--");
        assert_eq!(info["size"], 11);
        let chunks = info["chunks"].as_array().unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2]["size"], 3);

        let link = fs.find("latest").unwrap().unwrap().inode_num();
        assert_eq!(fs.get_inode_info(link).unwrap()["target"], "docs/readme");
        let docs = fs.find("docs").unwrap().unwrap().inode_num();
        assert_eq!(fs.get_inode_info(docs).unwrap()["entries"], 1);
        assert!(matches!(
            fs.get_inode_info(77),
            Err(FsError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_metadata_export() {
        let fs = mount(sample().build().unwrap());
        let m = fs.get_metadata().unwrap();
        for key in ["chunk_table", "chunks", "dir_entries", "directories", "inodes"] {
            assert!(m.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_history() {
        let fs = mount(sample().build().unwrap());
        assert_eq!(fs.get_history().unwrap(), None);

        let fs = mount(
            sample()
                .history(vec![
                    HistoryEntry {
                        libdwarfs_version: "v0.7.0".into(),
                        system_id: "Linux".into(),
                        arguments: vec!["mkdwarfs".into(), "-i".into(), "data".into()],
                        timestamp: Some(1_700_000_000),
                    },
                    HistoryEntry {
                        libdwarfs_version: "v0.7.1".into(),
                        system_id: "Linux".into(),
                        arguments: vec!["mkdwarfs".into(), "--recompress".into()],
                        timestamp: None,
                    },
                ])
                .build()
                .unwrap(),
        );
        let h = fs.get_history().unwrap().unwrap();
        let entries = h.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].get("arguments").is_some());
        assert!(entries[0].get("timestamp").is_some());

        let d = fs.dump(&opts(1, BlockAccessLevel::NoAccess)).unwrap();
        assert!(d.contains("libdwarfs v0.7.0 on Linux"));
        assert!(d.contains("time: 2023-11-14 22:13:20"));
    }

    #[test]
    fn test_introspection_after_close() {
        let fs = mount(sample().build().unwrap());
        fs.close();
        assert!(fs.dump(&opts(1, BlockAccessLevel::NoAccess)).unwrap_err().is_closed());
        assert!(fs.info(&FsInfoOptions::default()).unwrap_err().is_closed());
        assert!(fs.get_metadata().unwrap_err().is_closed());
        assert!(fs.get_history().unwrap_err().is_closed());
        assert!(fs.get_inode_info(0).unwrap_err().is_closed());
    }
}
