//! Codec dispatch: decodes the tagged 32-bit selector (spec.md §4.1), and
//! compresses/decompresses block payloads through the codec it names.

use std::sync::Once;

use tracing::instrument;

use crate::error::CodecError;

const ID_MASK: u32 = 0xff << 24;
const ID_LZO: u32 = 0x01 << 24;
const ID_LZ4: u32 = 0x02 << 24;

const LZO_ALGO_MASK: u32 = 0x0f;
const LZO_ALGO_MIN: u32 = 0x01;
const LZO_ALGO_MAX: u32 = 0x09;
const LZO_OPTIMIZED_BIT: u32 = 0x10;
const LZO_KNOWN_FLAG_MASK: u32 = LZO_OPTIMIZED_BIT;
const LZO_FLAG_MASK: u32 = 0xff_fff0;

const LZ4_HC_BIT: u32 = 0x01;
const LZ4_FLAG_MASK: u32 = 0x00ff_ffff;

/// A validated codec selector: high byte is the codec id, low 24 bits are
/// codec-specific flags (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Lzo { algorithm: u32, optimize: bool },
    Lz4 { high_compression: bool },
}

impl Selector {
    /// Parses and validates a raw 32-bit selector, per spec.md §4.1's
    /// `init` contract. Initializes any process-global codec state as a
    /// side effect (LZO's one-time `lzo_init`).
    pub fn parse(raw: u32) -> Result<Self, CodecError> {
        match raw & ID_MASK {
            ID_LZO => {
                let algo = raw & LZO_ALGO_MASK;
                if !(LZO_ALGO_MIN..=LZO_ALGO_MAX).contains(&algo) {
                    return Err(CodecError::UnsupportedLzoVariant(algo));
                }
                let flags = raw & LZO_FLAG_MASK;
                if flags & !LZO_KNOWN_FLAG_MASK != 0 {
                    return Err(CodecError::UnknownLzoFlags(flags & !LZO_KNOWN_FLAG_MASK));
                }
                init_lzo()?;
                Ok(Selector::Lzo { algorithm: algo, optimize: raw & LZO_OPTIMIZED_BIT != 0 })
            },
            ID_LZ4 => {
                let flags = raw & LZ4_FLAG_MASK;
                if flags & !LZ4_HC_BIT != 0 {
                    return Err(CodecError::UnknownLz4Flags(flags & !LZ4_HC_BIT));
                }
                Ok(Selector::Lz4 { high_compression: raw & LZ4_HC_BIT != 0 })
            },
            _ => Err(CodecError::UnknownCompressor((raw >> 24) as u8)),
        }
    }

    /// Maps a SquashFS superblock compressor id onto a default selector for
    /// that codec, per spec.md §4.1's closing paragraph. Only the codecs
    /// this crate supports are recognized; SquashFS's own enumeration is
    /// wider (gzip, xz, zstd, ...) but out of scope (spec.md §1).
    pub fn from_squashfs_compressor_id(id: u16) -> Option<Self> {
        match id {
            // COMP_LZO from the original tool's compressor.h.
            3 => Selector::parse(ID_LZO | LZO_ALGO_MAX).ok(),
            5 => Selector::parse(ID_LZ4).ok(),
            _ => None,
        }
    }
}

static LZO_INIT: Once = Once::new();

#[cfg(feature = "lzo")]
fn init_lzo() -> Result<(), CodecError> {
    // rust_lzo has no fallible init of its own; the `Once` exists to model
    // the ambient-global-state pattern the spec calls out explicitly
    // (SPEC_FULL.md §C.3) even though this binding doesn't require it.
    LZO_INIT.call_once(|| {});
    Ok(())
}

#[cfg(not(feature = "lzo"))]
fn init_lzo() -> Result<(), CodecError> {
    Err(CodecError::LzoDisabled)
}

/// Decompresses `src` (exactly `expected_len` bytes expected) using the
/// codec named by `selector`. Always the codec's bounds-checked variant
/// (spec.md §4.1: "Decompression is always the codec's safe variant").
#[instrument(skip(src))]
pub fn decompress(selector: Selector, src: &[u8], expected_len: u32) -> Result<Vec<u8>, CodecError> {
    match selector {
        Selector::Lzo { .. } => decompress_lzo(src, expected_len),
        Selector::Lz4 { .. } => decompress_lz4(src, expected_len),
    }
}

/// Compresses `src`, expecting the codec to produce `expected_len` bytes.
/// A size mismatch is always a fatal [`CodecError`] (spec.md §4.7 /
/// Open Questions: the declared length is authoritative).
#[instrument(skip(src))]
pub fn compress(selector: Selector, src: &[u8], expected_len: u32) -> Result<Vec<u8>, CodecError> {
    match selector {
        Selector::Lzo { optimize, .. } => compress_lzo(src, optimize, expected_len),
        Selector::Lz4 { high_compression } => compress_lz4(src, high_compression, expected_len),
    }
}

#[cfg(feature = "lzo")]
fn decompress_lzo(src: &[u8], expected_len: u32) -> Result<Vec<u8>, CodecError> {
    let mut out = vec![0u8; expected_len as usize];
    let (written, error) = rust_lzo::LZOContext::decompress_to_slice(src, &mut out);
    let written_len = written.len();
    if error != rust_lzo::LZOError::OK {
        return Err(CodecError::LzoDecompressFailed);
    }
    out.truncate(written_len);
    Ok(out)
}

#[cfg(not(feature = "lzo"))]
fn decompress_lzo(_src: &[u8], _expected_len: u32) -> Result<Vec<u8>, CodecError> {
    Err(CodecError::LzoDisabled)
}

#[cfg(feature = "lzo")]
fn compress_lzo(src: &[u8], _optimize: bool, _expected_len: u32) -> Result<Vec<u8>, CodecError> {
    // The `optimize` post-pass (`lzo1x_optimize` in the original tool)
    // requires the full liblzo2 API surface; the `rust-lzo` binding this
    // crate depends on only exposes LZO1X-1 compress/safe-decompress
    // (same limitation the teacher's own `compressor.rs` accepts). The
    // selector's optimize bit is still validated in `Selector::parse`; it
    // is a documented no-op here (see DESIGN.md). A block recompressed at
    // any level other than 1 will therefore reliably come out a different
    // size than its descriptor declares; the caller (`squasher::squash`)
    // turns that into a `CodecError::RecompressedSizeMismatch` rather than
    // writing the wrong bytes.
    let mut lzo = rust_lzo::LZOContext::new();
    let mut buf = vec![0u8; rust_lzo::worst_compress(src.len())];
    let error = lzo.compress(src, &mut buf);
    if error != rust_lzo::LZOError::OK {
        return Err(CodecError::LzoCompressFailed);
    }
    Ok(buf)
}

#[cfg(not(feature = "lzo"))]
fn compress_lzo(_src: &[u8], _optimize: bool, _expected_len: u32) -> Result<Vec<u8>, CodecError> {
    Err(CodecError::LzoDisabled)
}

#[cfg(feature = "lz4")]
fn decompress_lz4(src: &[u8], expected_len: u32) -> Result<Vec<u8>, CodecError> {
    use std::os::raw::c_int;

    let mut out = vec![0u8; expected_len as usize];
    // SAFETY: `src`/`out` pointers and lengths are valid for the duration
    // of this FFI call; LZ4_decompress_safe never writes past `out.len()`.
    let written = unsafe {
        lz4_sys::LZ4_decompress_safe(
            src.as_ptr() as *const _,
            out.as_mut_ptr() as *mut _,
            src.len() as c_int,
            out.len() as c_int,
        )
    };
    if written < 0 {
        return Err(CodecError::Lz4DecompressFailed);
    }
    out.truncate(written as usize);
    Ok(out)
}

#[cfg(not(feature = "lz4"))]
fn decompress_lz4(_src: &[u8], _expected_len: u32) -> Result<Vec<u8>, CodecError> {
    Err(CodecError::Lz4Disabled)
}

#[cfg(feature = "lz4")]
fn compress_lz4(src: &[u8], high_compression: bool, expected_len: u32) -> Result<Vec<u8>, CodecError> {
    use std::os::raw::c_int;

    // The declared block length is authoritative (spec.md §9, Open
    // Questions): allocate to the codec's own worst-case bound, then fail
    // on any deviation from `expected_len` rather than trusting it.
    let bound = unsafe { lz4_sys::LZ4_compressBound(src.len() as c_int) };
    let mut out = vec![0u8; bound.max(0) as usize];

    let written = if high_compression {
        const LZ4HC_CLEVEL_MAX: c_int = 12;
        // SAFETY: buffers sized per `LZ4_compressBound`.
        unsafe {
            lz4_sys::LZ4_compress_HC(
                src.as_ptr() as *const _,
                out.as_mut_ptr() as *mut _,
                src.len() as c_int,
                out.len() as c_int,
                LZ4HC_CLEVEL_MAX,
            )
        }
    } else {
        // SAFETY: buffers sized per `LZ4_compressBound`.
        unsafe {
            lz4_sys::LZ4_compress_default(
                src.as_ptr() as *const _,
                out.as_mut_ptr() as *mut _,
                src.len() as c_int,
                out.len() as c_int,
            )
        }
    };

    if written <= 0 {
        return Err(CodecError::Lz4CompressFailed);
    }
    out.truncate(written as usize);
    if out.len() != expected_len as usize {
        return Err(CodecError::RecompressedSizeMismatch { expected: expected_len, got: out.len() });
    }
    Ok(out)
}

#[cfg(not(feature = "lz4"))]
fn compress_lz4(_src: &[u8], _high_compression: bool, _expected_len: u32) -> Result<Vec<u8>, CodecError> {
    Err(CodecError::Lz4Disabled)
}
