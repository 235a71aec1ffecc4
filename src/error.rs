//! Errors

use std::io;

use thiserror::Error;

/// Errors generated while applying a sqdelta patch to a SquashFS archive.
#[derive(Error, Debug)]
pub enum SquashmergeError {
    #[error("std io error: {0}")]
    StdIo(#[from] io::Error),

    #[error("{0}")]
    Format(#[from] FormatError),

    #[error("{0}")]
    Codec(#[from] CodecError),

    #[error("xdelta3 exited with non-success status: {0}")]
    Child(std::process::ExitStatus),

    #[error("tried to access [{offset}, {offset}+{length}) of a {file_length} byte region")]
    Bounds { offset: u64, length: u64, file_length: u64 },

    #[error("worker thread panicked")]
    WorkerPanicked,
}

/// Malformed headers, descriptors or wire data.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Incorrect magic in patch file (got {got:#010x}, expected {expected:#010x})")]
    BadSqdeltaMagic { got: u32, expected: u32 },

    #[error("Unknown flag enabled in patch file: {0:#010x}")]
    UnknownSqdeltaFlags(u32),

    #[error("Invalid magic in squashfs input")]
    BadSquashfsMagic,

    #[error("Unsupported compression method in squashfs input: compressor id {0}")]
    UnsupportedSquashfsCompressor(u16),

    #[error(
        "block descriptor {index} out of range: offset {offset} + length {length} > source length {source_length}"
    )]
    BlockOutOfRange { index: usize, offset: u32, length: u32, source_length: u64 },

    #[error("block descriptor {index} has non-increasing offset: {offset} <= previous end {prev_end}")]
    BlockNotIncreasing { index: usize, offset: u32, prev_end: u32 },

    #[error("value {0} does not fit in a u32 wire field")]
    NarrowingOverflow(u64),

    #[error("sqdelta trailer truncated: need at least {required} bytes, only {available} present")]
    TruncatedTrailer { available: u64, required: u64 },
}

/// Codec initialization or (de)compression failures.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unknown compressor id {0:#04x}")]
    UnknownCompressor(u8),

    #[error("Unsupported LZO variant {0:#04x}")]
    UnsupportedLzoVariant(u32),

    #[error("Unknown LZO flags enabled: {0:#08x}")]
    UnknownLzoFlags(u32),

    #[error("Unknown LZ4 flags enabled: {0:#08x}")]
    UnknownLz4Flags(u32),

    #[error("LZO support disabled at build time")]
    LzoDisabled,

    #[error("LZ4 support disabled at build time")]
    Lz4Disabled,

    #[error("LZO compression failed")]
    LzoCompressFailed,

    #[error("LZO optimization failed")]
    LzoOptimizeFailed,

    #[error("LZO optimization resulted in different input length (expected {expected}, got {got})")]
    LzoOptimizeLengthMismatch { expected: usize, got: usize },

    #[error("LZO decompression failed (corrupted data?)")]
    LzoDecompressFailed,

    #[error("LZ4 compression failed")]
    Lz4CompressFailed,

    #[error("LZ4 decompression failed (corrupted data?)")]
    Lz4DecompressFailed,

    #[error("block decompression resulted in different size (expected {expected}, got {got})")]
    DecompressedSizeMismatch { expected: u32, got: u32 },

    #[error("block recompression resulted in different size (expected {expected}, got {got})")]
    RecompressedSizeMismatch { expected: u32, got: usize },
}
