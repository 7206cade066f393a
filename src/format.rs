//! Single-file model package format
//!
//! ## Layout
//!
//! All integers little-endian.
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 4    | magic `0x484D4F44` (`HMOD`) |
//! | 4      | 2    | version major |
//! | 6      | 2    | version minor |
//! | 8      | 4    | domain (text=1, audio=2, image=3, multimodal=4) |
//! | 12     | 4    | quantization (unknown=0, fp32=32, int8=8, int4=4) |
//! | 16     | 8    | parameter count |
//! | 24     | 4    | metadata length |
//! | 28     | 4    | capabilities bitmask |
//! | 32     | 8    | weights length |
//! | 40     | 8    | reserved |
//! | 48     | M    | metadata block |
//! | 48+M   | W    | weights section (see [`crate::model::loader`]) |
//! | 48+M+W | 4    | CRC32 of every preceding byte |
//!
//! ## Verification
//!
//! [`verify_bytes`] reports each failure independently: bad magic, major
//! version mismatch, truncation (declared lengths run past the end of the
//! file), bytes after the checksum, and checksum mismatch. Readers refuse
//! any package that fails.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{HyperionError, Result};

/// Package magic (`HMOD`)
pub const MAGIC: u32 = 0x484D_4F44;

/// Supported major version
pub const VERSION_MAJOR: u16 = 1;

/// Written minor version
pub const VERSION_MINOR: u16 = 0;

/// Size of the fixed header in bytes
pub const HEADER_SIZE: usize = 48;

/// Size of the metadata block in bytes
pub const METADATA_SIZE: usize = 64 + 64 + 128 + 3 * 4 + RESERVED_SLOTS * 4;

/// Size of the trailing checksum
pub const CHECKSUM_SIZE: usize = 4;

const RESERVED_SLOTS: usize = 10;
const NAME_LEN: usize = 64;
const AUTHOR_LEN: usize = 64;
const DESCRIPTION_LEN: usize = 128;

/// CRC32 checksum (IEEE polynomial 0xEDB88320)
pub fn crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let idx = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = TABLE[idx] ^ (crc >> 8);
    }
    !crc
}

#[inline]
fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Model domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Text models
    Text,
    /// Audio models
    Audio,
    /// Image models
    Image,
    /// Mixed-modality models
    Multimodal,
}

impl Domain {
    /// On-disk tag
    pub const fn tag(self) -> u32 {
        match self {
            Self::Text => 1,
            Self::Audio => 2,
            Self::Image => 3,
            Self::Multimodal => 4,
        }
    }

    /// Parse an on-disk tag
    ///
    /// # Errors
    ///
    /// Returns error for unknown tags.
    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            1 => Ok(Self::Text),
            2 => Ok(Self::Audio),
            3 => Ok(Self::Image),
            4 => Ok(Self::Multimodal),
            other => Err(HyperionError::FormatError {
                reason: format!("Unknown model domain tag {other}"),
            }),
        }
    }
}

/// Weight quantization declared by a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationKind {
    /// Width inferred per layer from its declared byte count
    Unknown,
    /// Unquantized 32-bit floats
    Fp32,
    /// 8-bit codes
    Int8,
    /// 4-bit codes
    Int4,
}

impl QuantizationKind {
    /// On-disk tag
    pub const fn tag(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Fp32 => 32,
            Self::Int8 => 8,
            Self::Int4 => 4,
        }
    }

    /// Parse an on-disk tag
    ///
    /// # Errors
    ///
    /// Returns error for unknown tags.
    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Self::Unknown),
            32 => Ok(Self::Fp32),
            8 => Ok(Self::Int8),
            4 => Ok(Self::Int4),
            other => Err(HyperionError::FormatError {
                reason: format!("Unknown quantization tag {other}"),
            }),
        }
    }
}

/// Capability bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities(pub u32);

impl Capabilities {
    /// Autoregressive text generation
    pub const TEXT_GENERATION: Self = Self(1 << 0);
    /// Text embeddings
    pub const TEXT_EMBEDDING: Self = Self(1 << 1);
    /// Audio input
    pub const AUDIO: Self = Self(1 << 2);
    /// Image input
    pub const VISION: Self = Self(1 << 3);
    /// Multi-step reasoning
    pub const REASONING: Self = Self(1 << 4);
    /// Can be split between local and remote execution
    pub const HYBRID_READY: Self = Self(1 << 5);

    /// True if every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two masks
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Fixed package header
#[derive(Debug, Clone, PartialEq)]
pub struct PackageHeader {
    /// Format major version
    pub version_major: u16,
    /// Format minor version
    pub version_minor: u16,
    /// Model domain
    pub domain: Domain,
    /// Weight quantization
    pub quantization: QuantizationKind,
    /// Number of model parameters
    pub parameter_count: u64,
    /// Metadata block length in bytes
    pub metadata_length: u32,
    /// Capability bitmask
    pub capabilities: Capabilities,
    /// Weights section length in bytes
    pub weights_length: u64,
}

impl PackageHeader {
    /// Header for a new package at the current format version
    ///
    /// Lengths are filled in by [`encode_package`].
    pub fn new(domain: Domain, quantization: QuantizationKind) -> Self {
        Self {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            domain,
            quantization,
            parameter_count: 0,
            metadata_length: METADATA_SIZE as u32,
            capabilities: Capabilities::default(),
            weights_length: 0,
        }
    }

    /// Serialize to the fixed header layout
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&self.version_major.to_le_bytes());
        out[6..8].copy_from_slice(&self.version_minor.to_le_bytes());
        out[8..12].copy_from_slice(&self.domain.tag().to_le_bytes());
        out[12..16].copy_from_slice(&self.quantization.tag().to_le_bytes());
        out[16..24].copy_from_slice(&self.parameter_count.to_le_bytes());
        out[24..28].copy_from_slice(&self.metadata_length.to_le_bytes());
        out[28..32].copy_from_slice(&self.capabilities.0.to_le_bytes());
        out[32..40].copy_from_slice(&self.weights_length.to_le_bytes());
        out
    }

    /// Parse header from bytes
    ///
    /// # Errors
    ///
    /// Returns error if the data is too short, the magic is wrong, or a tag
    /// is unknown. The version is not checked here.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(HyperionError::FormatError {
                reason: format!(
                    "Package header too small: {} bytes (need {})",
                    data.len(),
                    HEADER_SIZE
                ),
            });
        }
        let magic = read_u32(data, 0);
        if magic != MAGIC {
            return Err(HyperionError::FormatError {
                reason: format!("Invalid package magic: expected {MAGIC:#010x}, got {magic:#010x}"),
            });
        }

        Ok(Self {
            version_major: read_u16(data, 4),
            version_minor: read_u16(data, 6),
            domain: Domain::from_tag(read_u32(data, 8))?,
            quantization: QuantizationKind::from_tag(read_u32(data, 12))?,
            parameter_count: read_u64(data, 16),
            metadata_length: read_u32(data, 24),
            capabilities: Capabilities(read_u32(data, 28)),
            weights_length: read_u64(data, 32),
        })
    }
}

/// Descriptive metadata block
///
/// On disk the block ends in ten reserved `u32` slots. The first five are
/// read as layer count, hidden size, context size, block count and extra
/// flags, so older writers that only fill the leading slots stay readable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PackageMetadata {
    /// Model name (at most 63 bytes on disk)
    pub model_name: String,
    /// Author (at most 63 bytes on disk)
    pub author: String,
    /// Free-form description (at most 127 bytes on disk)
    pub description: String,
    /// Vocabulary size
    pub vocab_size: u32,
    /// Maximum context window
    pub context_window: u32,
    /// Embedding width
    pub embedding_size: u32,
    /// Reserved slot 0
    pub layer_count: u32,
    /// Reserved slot 1
    pub hidden_size: u32,
    /// Reserved slot 2
    pub context_size: u32,
    /// Reserved slot 3
    pub block_count: u32,
    /// Reserved slot 4
    pub extra_flags: u32,
}

fn write_fixed_str(out: &mut [u8], value: &str) {
    let max = out.len() - 1;
    let mut end = value.len().min(max);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    out[..end].copy_from_slice(&value.as_bytes()[..end]);
}

fn read_fixed_str(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

impl PackageMetadata {
    /// Serialize to the fixed metadata layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; METADATA_SIZE];
        let mut offset = 0;
        write_fixed_str(&mut out[offset..offset + NAME_LEN], &self.model_name);
        offset += NAME_LEN;
        write_fixed_str(&mut out[offset..offset + AUTHOR_LEN], &self.author);
        offset += AUTHOR_LEN;
        write_fixed_str(&mut out[offset..offset + DESCRIPTION_LEN], &self.description);
        offset += DESCRIPTION_LEN;

        let fields = [
            self.vocab_size,
            self.context_window,
            self.embedding_size,
            self.layer_count,
            self.hidden_size,
            self.context_size,
            self.block_count,
            self.extra_flags,
        ];
        for value in fields {
            out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            offset += 4;
        }
        out
    }

    /// Parse a metadata block
    ///
    /// Shorter blocks are zero-extended; bytes past the known layout are ignored.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut block = vec![0u8; METADATA_SIZE];
        let n = data.len().min(METADATA_SIZE);
        block[..n].copy_from_slice(&data[..n]);

        let ints = NAME_LEN + AUTHOR_LEN + DESCRIPTION_LEN;
        let int_at = |i: usize| read_u32(&block, ints + i * 4);
        Self {
            model_name: read_fixed_str(&block[..NAME_LEN]),
            author: read_fixed_str(&block[NAME_LEN..NAME_LEN + AUTHOR_LEN]),
            description: read_fixed_str(&block[NAME_LEN + AUTHOR_LEN..ints]),
            vocab_size: int_at(0),
            context_window: int_at(1),
            embedding_size: int_at(2),
            layer_count: int_at(3),
            hidden_size: int_at(4),
            context_size: int_at(5),
            block_count: int_at(6),
            extra_flags: int_at(7),
        }
    }
}

/// Outcome of [`verify_bytes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Verification {
    /// All checks passed
    pub success: bool,
    /// Stored CRC32 differs from the computed one
    pub checksum_mismatch: bool,
    /// Major version is not [`VERSION_MAJOR`]
    pub version_mismatch: bool,
    /// Magic is not [`MAGIC`]
    pub invalid_magic: bool,
    /// File ends before the declared sections and checksum
    pub truncated: bool,
    /// File continues past the checksum
    pub trailing_data: bool,
}

/// Check magic, version, length and checksum of an encoded package
pub fn verify_bytes(data: &[u8]) -> Verification {
    let mut result = Verification::default();

    if data.len() < HEADER_SIZE {
        result.truncated = true;
        result.invalid_magic = data.len() < 4 || read_u32(data, 0) != MAGIC;
        result.version_mismatch = data.len() < 6 || read_u16(data, 4) != VERSION_MAJOR;
        return result;
    }

    result.invalid_magic = read_u32(data, 0) != MAGIC;
    result.version_mismatch = read_u16(data, 4) != VERSION_MAJOR;

    let metadata_length = u64::from(read_u32(data, 24));
    let weights_length = read_u64(data, 32);
    let declared = (HEADER_SIZE as u64)
        .saturating_add(metadata_length)
        .saturating_add(weights_length)
        .saturating_add(CHECKSUM_SIZE as u64);

    if declared > data.len() as u64 {
        result.truncated = true;
    } else {
        result.trailing_data = declared < data.len() as u64;
        let body_end = declared as usize - CHECKSUM_SIZE;
        let stored = read_u32(data, body_end);
        result.checksum_mismatch = stored != crc32(&data[..body_end]);
    }

    result.success = !(result.invalid_magic
        || result.version_mismatch
        || result.truncated
        || result.trailing_data
        || result.checksum_mismatch);
    result
}

/// Verify a package file
///
/// # Errors
///
/// Returns error only if the file cannot be opened or mapped.
pub fn verify_package(path: impl AsRef<Path>) -> Result<Verification> {
    let data = MappedFile::open(path.as_ref())?;
    Ok(verify_bytes(data.as_slice()))
}

/// A decoded package
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    /// Header
    pub header: PackageHeader,
    /// Metadata block
    pub metadata: PackageMetadata,
    /// Raw weights section
    pub weights: Vec<u8>,
}

/// Encode a package, filling in the length fields and trailing checksum
pub fn encode_package(header: &PackageHeader, metadata: &PackageMetadata, weights: &[u8]) -> Vec<u8> {
    let meta = metadata.to_bytes();
    let header = PackageHeader {
        metadata_length: meta.len() as u32,
        weights_length: weights.len() as u64,
        ..header.clone()
    };

    let mut out = Vec::with_capacity(HEADER_SIZE + meta.len() + weights.len() + CHECKSUM_SIZE);
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&meta);
    out.extend_from_slice(weights);
    let crc = crc32(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Decode a package after full verification
///
/// # Errors
///
/// Returns error if any verification flag is raised or a header tag is unknown.
pub fn decode_package(data: &[u8]) -> Result<Package> {
    let check = verify_bytes(data);
    if !check.success {
        warn!(?check, "package verification failed");
        return Err(HyperionError::FormatError {
            reason: format!(
                "Package verification failed (invalid_magic={}, version_mismatch={}, truncated={}, trailing_data={}, checksum_mismatch={})",
                check.invalid_magic,
                check.version_mismatch,
                check.truncated,
                check.trailing_data,
                check.checksum_mismatch
            ),
        });
    }

    let header = PackageHeader::from_bytes(data)?;
    let meta_start = HEADER_SIZE;
    let meta_end = meta_start + header.metadata_length as usize;
    let weights_end = meta_end + header.weights_length as usize;

    let metadata = PackageMetadata::from_bytes(&data[meta_start..meta_end]);
    debug!(
        model = %metadata.model_name,
        weights_bytes = header.weights_length,
        "decoded package"
    );

    Ok(Package {
        header,
        metadata,
        weights: data[meta_end..weights_end].to_vec(),
    })
}

/// Write a package file
///
/// # Errors
///
/// Returns error if the file cannot be written.
pub fn write_package(
    path: impl AsRef<Path>,
    header: &PackageHeader,
    metadata: &PackageMetadata,
    weights: &[u8],
) -> Result<()> {
    let path = path.as_ref();
    let bytes = encode_package(header, metadata, weights);
    let mut file = File::create(path).map_err(|e| HyperionError::IoError {
        message: format!("Failed to create '{}': {e}", path.display()),
    })?;
    file.write_all(&bytes).map_err(|e| HyperionError::IoError {
        message: format!("Failed to write '{}': {e}", path.display()),
    })?;
    Ok(())
}

/// Read and verify a package file
///
/// # Errors
///
/// Returns error if the file cannot be read or fails verification.
pub fn read_package(path: impl AsRef<Path>) -> Result<Package> {
    let data = MappedFile::open(path.as_ref())?;
    decode_package(data.as_slice())
}

/// Read-only mapping of a package file
enum MappedFile {
    Mapped(memmap2::Mmap),
    // Empty files cannot be mapped on every platform
    Empty,
}

impl MappedFile {
    #[allow(unsafe_code)]
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| HyperionError::IoError {
            message: format!("Failed to open file '{}': {e}", path.display()),
        })?;
        let len = file
            .metadata()
            .map_err(|e| HyperionError::IoError {
                message: format!("Failed to stat file '{}': {e}", path.display()),
            })?
            .len();
        if len == 0 {
            return Ok(Self::Empty);
        }

        // SAFETY: File is opened read-only. Packages are not modified while
        // loaded, and every byte is checksummed before it is trusted.
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .map(&file)
                .map_err(|e| HyperionError::IoError {
                    message: format!("Failed to mmap file '{}': {e}", path.display()),
                })?
        };
        Ok(Self::Mapped(mmap))
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Mapped(mmap) => mmap,
            Self::Empty => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> PackageMetadata {
        PackageMetadata {
            model_name: "tiny-text".to_string(),
            author: "hyperion".to_string(),
            description: "unit test model".to_string(),
            vocab_size: 32,
            context_window: 16,
            embedding_size: 8,
            layer_count: 2,
            hidden_size: 8,
            context_size: 16,
            block_count: 0,
            extra_flags: 0,
        }
    }

    fn sample_package() -> Vec<u8> {
        let mut header = PackageHeader::new(Domain::Text, QuantizationKind::Int4);
        header.parameter_count = 64;
        header.capabilities = Capabilities::TEXT_GENERATION.with(Capabilities::HYBRID_READY);
        encode_package(&header, &sample_metadata(), &[1, 2, 3, 4, 5])
    }

    #[test]
    fn test_crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_header_round_trip() {
        let mut header = PackageHeader::new(Domain::Multimodal, QuantizationKind::Int8);
        header.parameter_count = 1 << 40;
        header.weights_length = 99;
        let parsed = PackageHeader::from_bytes(&header.to_bytes()).expect("test");
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_rejects_unknown_domain() {
        let mut bytes = PackageHeader::new(Domain::Text, QuantizationKind::Int4).to_bytes();
        bytes[8] = 9;
        assert!(PackageHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_metadata_reserved_slots_named() {
        let meta = sample_metadata();
        let bytes = meta.to_bytes();
        assert_eq!(bytes.len(), METADATA_SIZE);
        // layer_count lives in the first reserved slot
        let slot0 = 64 + 64 + 128 + 12;
        assert_eq!(read_u32(&bytes, slot0), 2);
        assert_eq!(PackageMetadata::from_bytes(&bytes), meta);
    }

    #[test]
    fn test_metadata_truncates_long_strings() {
        let meta = PackageMetadata {
            model_name: "x".repeat(100),
            ..PackageMetadata::default()
        };
        let parsed = PackageMetadata::from_bytes(&meta.to_bytes());
        assert_eq!(parsed.model_name.len(), 63);
    }

    #[test]
    fn test_verify_valid_package() {
        let check = verify_bytes(&sample_package());
        assert!(check.success);
        assert!(!check.checksum_mismatch);
    }

    #[test]
    fn test_verify_checksum_corruption() {
        let mut bytes = sample_package();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let check = verify_bytes(&bytes);
        assert!(check.checksum_mismatch);
        assert!(!check.success);
        assert!(!check.invalid_magic);
        assert!(!check.version_mismatch);
    }

    #[test]
    fn test_verify_flags_independent() {
        let mut bytes = sample_package();
        bytes[0] = 0;
        bytes[4] = 2;
        let check = verify_bytes(&bytes);
        assert!(check.invalid_magic);
        assert!(check.version_mismatch);
        assert!(check.checksum_mismatch);
        assert!(!check.truncated);
    }

    #[test]
    fn test_verify_truncated() {
        let bytes = sample_package();
        let check = verify_bytes(&bytes[..bytes.len() - 2]);
        assert!(check.truncated);
        assert!(!check.success);

        let check = verify_bytes(&bytes[..10]);
        assert!(check.truncated);
        assert!(!check.invalid_magic);
    }

    #[test]
    fn test_verify_rejects_trailing_data() {
        let mut bytes = sample_package();
        bytes.extend_from_slice(&[0xAB; 3]);
        let check = verify_bytes(&bytes);
        assert!(check.trailing_data);
        assert!(!check.checksum_mismatch);
        assert!(!check.truncated);
        assert!(!check.success);
        assert!(decode_package(&bytes).is_err());

        assert!(!verify_bytes(&sample_package()).trailing_data);
    }

    #[test]
    fn test_decode_package() {
        let package = decode_package(&sample_package()).expect("test");
        assert_eq!(package.weights, vec![1, 2, 3, 4, 5]);
        assert_eq!(package.metadata.model_name, "tiny-text");
        assert!(package
            .header
            .capabilities
            .contains(Capabilities::HYBRID_READY));
        assert!(!package.header.capabilities.contains(Capabilities::VISION));
    }

    #[test]
    fn test_decode_accepts_minor_version_change() {
        let mut header = PackageHeader::new(Domain::Text, QuantizationKind::Int4);
        header.version_minor = 7;
        let bytes = encode_package(&header, &sample_metadata(), &[0]);
        let package = decode_package(&bytes).expect("test");
        assert_eq!(package.header.version_minor, 7);
    }

    #[test]
    fn test_verify_package_file() {
        let dir = tempfile::tempdir().expect("test");
        let path = dir.path().join("tiny.hmod");
        std::fs::write(&path, sample_package()).expect("test");
        assert!(verify_package(&path).expect("test").success);
        assert_eq!(read_package(&path).expect("test").weights, vec![1, 2, 3, 4, 5]);

        let empty = dir.path().join("empty.hmod");
        std::fs::write(&empty, b"").expect("test");
        let check = verify_package(&empty).expect("test");
        assert!(check.truncated && check.invalid_magic && !check.success);
        assert!(read_package(&empty).is_err());
        assert!(verify_package(dir.path().join("missing.hmod")).is_err());
    }
}
