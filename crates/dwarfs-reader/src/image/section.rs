//! Section headers and the section table of an image.

use std::fmt;
use std::io;

use crate::error::{FsError, FsResult};
use crate::logger::{Logger, log_debug, log_warn};
use crate::options::ImageOffset;
use crate::os_access::ImageBytes;

pub const MAGIC: &[u8; 6] = b"DWARFS";
pub const MAJOR_VERSION: u8 = 2;
pub const MINOR_VERSION: u8 = 5;
pub const HEADER_SIZE: usize = 56;

/// Header bytes covered by the checksum, together with the payload.
const CHECKSUMMED_HEADER: std::ops::Range<usize> = 40..HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionType {
    Block,
    MetadataV2,
    SectionIndex,
    History,
    Unknown(u16),
}

impl SectionType {
    pub fn from_u16(v: u16) -> Self {
        match v {
            0 => SectionType::Block,
            8 => SectionType::MetadataV2,
            9 => SectionType::SectionIndex,
            10 => SectionType::History,
            other => SectionType::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            SectionType::Block => 0,
            SectionType::MetadataV2 => 8,
            SectionType::SectionIndex => 9,
            SectionType::History => 10,
            SectionType::Unknown(v) => v,
        }
    }
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionType::Block => f.write_str("BLOCK"),
            SectionType::MetadataV2 => f.write_str("METADATA_V2"),
            SectionType::SectionIndex => f.write_str("SECTION_INDEX"),
            SectionType::History => f.write_str("HISTORY"),
            SectionType::Unknown(v) => write!(f, "unknown({v})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionType {
    None,
    Zstd,
    Unknown(u16),
}

impl CompressionType {
    pub fn from_u16(v: u16) -> Self {
        match v {
            0 => CompressionType::None,
            2 => CompressionType::Zstd,
            other => CompressionType::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            CompressionType::None => 0,
            CompressionType::Zstd => 2,
            CompressionType::Unknown(v) => v,
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionType::None => f.write_str("NONE"),
            CompressionType::Zstd => f.write_str("ZSTD"),
            CompressionType::Unknown(v) => write!(f, "unknown({v})"),
        }
    }
}

/// Decoded 56-byte section header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    pub major: u8,
    pub minor: u8,
    pub checksum: [u8; 32],
    pub number: u32,
    pub section_type: SectionType,
    pub compression: CompressionType,
    pub length: u64,
}

#[inline]
fn ensure_slice(data: &[u8], offset: usize, len: usize) -> FsResult<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| {
            FsError::corrupt(
                "mount",
                format!("truncated image: need {len} bytes at offset {offset}"),
            )
        })
}

#[inline]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> FsResult<[u8; N]> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

impl SectionHeader {
    /// Parse a header starting at `data[0]`.
    pub fn parse(data: &[u8]) -> FsResult<Self> {
        let data = ensure_slice(data, 0, HEADER_SIZE)?;
        let magic: [u8; 6] = read_fixed(data, 0)?;
        if &magic != MAGIC {
            return Err(FsError::corrupt(
                "mount",
                format!("bad section magic: {}", hex::encode(magic)),
            ));
        }
        let (major, minor) = (data[6], data[7]);
        if major != MAJOR_VERSION {
            return Err(FsError::corrupt(
                "mount",
                format!("unsupported format version {major}.{minor}"),
            ));
        }
        Ok(Self {
            major,
            minor,
            checksum: read_fixed(data, 8)?,
            number: u32::from_le_bytes(read_fixed(data, 40)?),
            section_type: SectionType::from_u16(u16::from_le_bytes(read_fixed(data, 44)?)),
            compression: CompressionType::from_u16(u16::from_le_bytes(read_fixed(data, 46)?)),
            length: u64::from_le_bytes(read_fixed(data, 48)?),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0_u8; HEADER_SIZE];
        out[0..6].copy_from_slice(MAGIC);
        out[6] = self.major;
        out[7] = self.minor;
        out[8..40].copy_from_slice(&self.checksum);
        out[40..44].copy_from_slice(&self.number.to_le_bytes());
        out[44..46].copy_from_slice(&self.section_type.to_u16().to_le_bytes());
        out[46..48].copy_from_slice(&self.compression.to_u16().to_le_bytes());
        out[48..56].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    /// Checksum over the trailing header fields and `payload`.
    pub fn compute_checksum(&self, payload: &[u8]) -> [u8; 32] {
        let encoded = self.encode();
        let mut hasher = blake3::Hasher::new();
        hasher.update(&encoded[CHECKSUMMED_HEADER]);
        hasher.update(payload);
        *hasher.finalize().as_bytes()
    }
}

/// One section located inside the image bytes.
#[derive(Debug, Clone)]
pub struct Section {
    pub header: SectionHeader,
    /// Absolute offset of the header within the image file.
    pub offset: usize,
    data: ImageBytes,
}

impl Section {
    pub fn section_type(&self) -> SectionType {
        self.header.section_type
    }

    pub fn compression(&self) -> CompressionType {
        self.header.compression
    }

    pub fn length(&self) -> u64 {
        self.header.length
    }

    pub fn payload(&self) -> &[u8] {
        let start = self.offset + HEADER_SIZE;
        // Bounds were checked when the section was located.
        &self.data[start..start + self.header.length as usize]
    }

    pub fn checksum_valid(&self) -> bool {
        self.header.compute_checksum(self.payload()) == self.header.checksum
    }

    /// Decompress a payload that may not exceed `limit` bytes.
    ///
    /// Used for BLOCK sections, whose size is bounded by the block size.
    pub fn decompress_bounded(&self, op: &'static str, limit: usize) -> FsResult<Vec<u8>> {
        let what = || format!("section {}", self.header.number);
        let data = match self.header.compression {
            CompressionType::Zstd => zstd::bulk::decompress(self.payload(), limit)
                .map_err(|e| FsError::io(op, what(), e))?,
            _ => self.decompress(op)?,
        };
        if data.len() > limit {
            return Err(FsError::io(
                op,
                what(),
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{} bytes exceed block size {limit}", data.len()),
                ),
            ));
        }
        Ok(data)
    }

    /// Decompress the payload.
    pub fn decompress(&self, op: &'static str) -> FsResult<Vec<u8>> {
        match self.header.compression {
            CompressionType::None => Ok(self.payload().to_vec()),
            CompressionType::Zstd => zstd::decode_all(self.payload())
                .map_err(|e| FsError::io(op, format!("section {}", self.header.number), e)),
            CompressionType::Unknown(v) => Err(FsError::io(
                op,
                format!("section {}", self.header.number),
                io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unknown compression type {v}"),
                ),
            )),
        }
    }
}

/// All sections of a mounted image, in file order.
#[derive(Debug)]
pub struct SectionTable {
    sections: Vec<Section>,
    image_offset: usize,
    from_index: bool,
}

impl SectionTable {
    /// Locate every section, via the trailing index when it is usable.
    pub fn locate(data: ImageBytes, offset: ImageOffset, lgr: &Logger) -> FsResult<Self> {
        let image_offset = find_image_offset(&data, offset)?;
        if image_offset > 0 {
            log_debug!(lgr, "image starts at offset {image_offset}");
        }

        let (sections, from_index) = match read_index(&data, image_offset) {
            Ok(Some(sections)) => (sections, true),
            Ok(None) => (scan_sections(&data, image_offset)?, false),
            Err(e) => {
                log_warn!(lgr, "ignoring section index: {e}");
                (scan_sections(&data, image_offset)?, false)
            }
        };
        for s in &sections {
            if let SectionType::Unknown(v) = s.section_type() {
                log_warn!(lgr, "skipping section {} of unknown type {v}", s.header.number);
            }
        }
        Ok(Self {
            sections,
            image_offset,
            from_index,
        })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn image_offset(&self) -> usize {
        self.image_offset
    }

    /// Whether sections were located through the section index.
    pub fn from_index(&self) -> bool {
        self.from_index
    }

    pub fn of_type(&self, t: SectionType) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(move |s| s.section_type() == t)
    }

    pub fn find(&self, t: SectionType) -> Option<&Section> {
        self.of_type(t).next()
    }
}

fn find_image_offset(data: &[u8], offset: ImageOffset) -> FsResult<usize> {
    match offset {
        ImageOffset::Fixed(n) => {
            let n = usize::try_from(n)
                .map_err(|_| FsError::invalid_argument("mount", format!("image offset {n}")))?;
            let rest = data.get(n..).ok_or_else(|| {
                FsError::invalid_argument("mount", format!("image offset {n} beyond end of file"))
            })?;
            SectionHeader::parse(rest)?;
            Ok(n)
        }
        ImageOffset::Auto => {
            let mut pos = 0;
            while let Some(found) = find_magic(&data[pos..]) {
                let at = pos + found;
                if let Ok(h) = SectionHeader::parse(&data[at..]) {
                    // The first section of an image is always number 0.
                    if h.number == 0 {
                        return Ok(at);
                    }
                }
                pos = at + 1;
            }
            Err(FsError::corrupt("mount", "no filesystem image found"))
        }
    }
}

fn find_magic(haystack: &[u8]) -> Option<usize> {
    haystack.windows(MAGIC.len()).position(|w| w == MAGIC)
}

/// Sequentially walk section headers from `start` to the end of the file.
fn scan_sections(data: &ImageBytes, start: usize) -> FsResult<Vec<Section>> {
    let mut sections = Vec::new();
    let mut pos = start;
    while pos < data.len() {
        let header = SectionHeader::parse(&data[pos..])?;
        let expected = sections.len() as u32;
        if header.number != expected {
            return Err(FsError::corrupt(
                "mount",
                format!("section number {} at offset {pos}, expected {expected}", header.number),
            ));
        }
        let len = usize::try_from(header.length)
            .map_err(|_| FsError::corrupt("mount", "section length overflow"))?;
        ensure_slice(data, pos + HEADER_SIZE, len)?;
        let next = pos + HEADER_SIZE + len;
        sections.push(Section {
            header,
            offset: pos,
            data: data.clone(),
        });
        pos = next;
    }
    Ok(sections)
}

const INDEX_TYPE_SHIFT: u32 = 48;
const INDEX_OFFSET_MASK: u64 = (1 << INDEX_TYPE_SHIFT) - 1;

/// Pack one section index entry.
pub fn index_entry(t: SectionType, offset: u64) -> u64 {
    (u64::from(t.to_u16()) << INDEX_TYPE_SHIFT) | (offset & INDEX_OFFSET_MASK)
}

/// Read the trailing section index.
///
/// `Ok(None)` when the image has none; `Err` when one exists but does not
/// match the headers it points at.
fn read_index(data: &ImageBytes, start: usize) -> FsResult<Option<Vec<Section>>> {
    let image = &data[start..];
    if image.len() < HEADER_SIZE + 8 {
        return Ok(None);
    }
    // The last index entry describes the index section itself.
    let last = u64::from_le_bytes(read_fixed(image, image.len() - 8)?);
    if SectionType::from_u16((last >> INDEX_TYPE_SHIFT) as u16) != SectionType::SectionIndex {
        return Ok(None);
    }
    let index_pos = (last & INDEX_OFFSET_MASK) as usize;
    let header = SectionHeader::parse(ensure_slice(image, index_pos, HEADER_SIZE)?)?;
    if header.section_type != SectionType::SectionIndex
        || index_pos
            .checked_add(HEADER_SIZE)
            .and_then(|p| p.checked_add(header.length as usize))
            != Some(image.len())
        || header.length % 8 != 0
    {
        return Err(FsError::corrupt("mount", "section index does not span the image tail"));
    }

    let entries = &image[index_pos + HEADER_SIZE..];
    let mut sections = Vec::with_capacity(entries.len() / 8);
    for (i, raw) in entries.chunks_exact(8).enumerate() {
        let mut word = [0_u8; 8];
        word.copy_from_slice(raw);
        let entry = u64::from_le_bytes(word);
        let rel = (entry & INDEX_OFFSET_MASK) as usize;
        let t = SectionType::from_u16((entry >> INDEX_TYPE_SHIFT) as u16);
        let header = SectionHeader::parse(ensure_slice(image, rel, HEADER_SIZE)?)?;
        if header.section_type != t || header.number as usize != i {
            return Err(FsError::corrupt(
                "mount",
                format!("section index entry {i} does not match header at offset {rel}"),
            ));
        }
        ensure_slice(image, rel + HEADER_SIZE, header.length as usize)?;
        sections.push(Section {
            header,
            offset: start + rel,
            data: data.clone(),
        });
    }
    Ok(Some(sections))
}
