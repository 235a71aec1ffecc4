//! Parsing and validation of the SquashFS superblock prefix and the
//! sqdelta patch header, grounded in `read_squashfs_header` /
//! `read_sqdelta_header` of the original tool. Both are big-endian on the
//! wire; the SquashFS prefix's byte order instead follows whichever magic
//! variant matched (SquashFS superblocks may be little- or big-endian).

use tracing::{debug, instrument};

use crate::codec::Selector;
use crate::error::{FormatError, SquashmergeError};
use crate::filemap::FileMap;

pub const SQDELTA_MAGIC: u32 = 0x5371_ceb4;
const SQUASHFS_MAGIC_LE: u32 = 0x7371_7368;
const SQUASHFS_MAGIC_BE: u32 = 0x6873_7173;

/// Size in bytes of the sqdelta header as chosen for this implementation:
/// `magic, flags, compression, block_count`, each a big-endian `u32`. See
/// SPEC_FULL.md §C.4 for why this layout (rather than the legacy
/// header-derives-codec-from-superblock layout) was picked.
pub const SQDELTA_HEADER_LEN: u64 = 16;

/// Size in bytes of one on-wire `CompressedBlock` descriptor.
pub const BLOCK_DESCRIPTOR_LEN: u64 = 12;

/// The leading bytes of a SquashFS archive that this tool cares about: just
/// enough to recover the compressor id. Everything else about the SquashFS
/// layout is out of scope (spec.md §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SquashfsSuperblock {
    pub selector: Selector,
}

/// The sqdelta patch header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqdeltaHeader {
    pub compression: Selector,
    pub block_count: u32,
}

/// One compressed-block descriptor, decoded from big-endian wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedBlock {
    pub offset: u32,
    pub length: u32,
    pub uncompressed_length: u32,
}

impl CompressedBlock {
    fn decode(bytes: &[u8]) -> Self {
        Self {
            offset: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            length: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            uncompressed_length: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
        }
    }

    pub fn end(&self) -> u32 {
        self.offset + self.length
    }
}

/// Reads the 22-byte SquashFS superblock prefix at offset 0 of `source`,
/// validates the magic, extracts the compressor id in the byte order
/// implied by the matched magic, and maps it onto the tagged [`Selector`]
/// codec encoding (spec.md §4.1, final paragraph).
#[instrument(skip(source))]
pub fn read_squashfs_superblock(source: &FileMap) -> Result<SquashfsSuperblock, SquashmergeError> {
    let bytes = source.read(0, 22)?;
    let magic_le = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let magic_be = u32::from_be_bytes(bytes[0..4].try_into().unwrap());

    // compression id sits at byte offset 20, as a u16 in the same byte
    // order as the matched magic.
    let raw_compression = &bytes[20..22];
    let compression_id: u16 = if magic_le == SQUASHFS_MAGIC_LE {
        u16::from_le_bytes(raw_compression.try_into().unwrap())
    } else if magic_be == SQUASHFS_MAGIC_BE {
        u16::from_be_bytes(raw_compression.try_into().unwrap())
    } else {
        return Err(FormatError::BadSquashfsMagic.into());
    };

    debug!(compression_id, "read squashfs superblock");
    let selector = Selector::from_squashfs_compressor_id(compression_id)
        .ok_or(FormatError::UnsupportedSquashfsCompressor(compression_id))?;
    Ok(SquashfsSuperblock { selector })
}

/// Reads the sqdelta header at `offset` of `patch`, validating magic and
/// flags exactly per spec.md §4.2.
#[instrument(skip(patch))]
pub fn read_sqdelta_header(patch: &FileMap, offset: u64) -> Result<SqdeltaHeader, SquashmergeError> {
    let bytes = patch.read(offset, SQDELTA_HEADER_LEN)?;
    let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    if magic != SQDELTA_MAGIC {
        return Err(FormatError::BadSqdeltaMagic { got: magic, expected: SQDELTA_MAGIC }.into());
    }

    let flags = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
    if flags != 0 {
        return Err(FormatError::UnknownSqdeltaFlags(flags).into());
    }

    let compression = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
    let block_count = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
    let compression = Selector::parse(compression)?;

    debug!(block_count, ?compression, "read sqdelta header");
    Ok(SqdeltaHeader { compression, block_count })
}

/// Decodes `block_count` descriptors starting at `offset` of `file`.
pub fn read_block_descriptors(
    file: &FileMap,
    offset: u64,
    block_count: u32,
) -> Result<Vec<CompressedBlock>, SquashmergeError> {
    let total_len = u64::from(block_count) * BLOCK_DESCRIPTOR_LEN;
    // Let `SquashmergeError::Bounds` from a too-short file propagate as-is
    // (spec.md §7/§8 scenario 4: this is a BoundsError, not a FormatError).
    let bytes = file.read(offset, total_len)?;

    Ok((0..block_count as usize)
        .map(|i| CompressedBlock::decode(&bytes[i * 12..i * 12 + 12]))
        .collect())
}
