//! Re-compresses the target file's block payloads in place, in reverse
//! order, then truncates away the trailing scratch metadata (spec.md
//! §4.7). This is the step the kept revision of the original tool
//! predates; its behavior here follows spec.md and SPEC_FULL.md §C.1
//! exactly, grounded in the same descriptor/header layout as
//! [`crate::expander`] and [`crate::header`].

use tracing::{info, instrument};

use crate::block_table::BlockTable;
use crate::codec::{self, Selector};
use crate::error::{CodecError, FormatError, SquashmergeError};
use crate::filemap::FileMap;
use crate::header::{self, BLOCK_DESCRIPTOR_LEN, SQDELTA_HEADER_LEN};
use crate::worker_pool::{self, partition_reverse};

/// Recovers the trailing `(block_table, header)` metadata the Expander
/// appended (spec.md §4.7, first paragraph) and returns the block table
/// plus the offset immediately after the decompressed-payload region —
/// `T.length - sizeof(header) - block_table_bytes`, the initial
/// `prev_offset` spec.md §4.7 describes, and the start of the trailer
/// itself.
///
/// A `target` shorter than the trailer it's declared to carry is
/// externally-influenced input (a corrupt delta payload can still make the
/// differ exit 0 with truncated output), not a programmer error, so this
/// reports `FormatError::TruncatedTrailer` instead of underflowing.
pub fn read_trailer(target: &FileMap) -> Result<(BlockTable, u64), SquashmergeError> {
    let header_offset = target.len().checked_sub(SQDELTA_HEADER_LEN).ok_or(
        FormatError::TruncatedTrailer { available: target.len(), required: SQDELTA_HEADER_LEN },
    )?;
    let header = header::read_sqdelta_header(target, header_offset)?;

    let block_table_len = u64::from(header.block_count) * BLOCK_DESCRIPTOR_LEN;
    let block_table_offset = header_offset.checked_sub(block_table_len).ok_or(
        FormatError::TruncatedTrailer { available: header_offset, required: block_table_len },
    )?;
    let blocks = header::read_block_descriptors(target, block_table_offset, header.block_count)?;

    Ok((BlockTable::new(blocks), block_table_offset))
}

/// Runs the reverse-order recompression pass and truncates `target` back
/// to a valid SquashFS archive. `compression` is the sqdelta patch's
/// codec selector (the same one the Expander decompressed with).
#[instrument(skip(target, blocks))]
pub fn squash(
    compression: Selector,
    blocks: &BlockTable,
    trailer_start: u64,
    target: &mut FileMap,
) -> Result<(), SquashmergeError> {
    info!(block_count = blocks.len(), trailer_start, "recompressing target in place");

    if blocks.is_empty() {
        worker_pool::run(|_thread_no, _num_threads| Ok(()))?;
        target.truncate(trailer_start)?;
        return Ok(());
    }

    let total_uncompressed = blocks.total_uncompressed_length();
    let uncompressed_region_start = trailer_start.checked_sub(total_uncompressed).ok_or(
        FormatError::TruncatedTrailer { available: trailer_start, required: total_uncompressed },
    )?;
    let target_map = target.raw_map_mut()?;

    worker_pool::run(move |thread_no, num_threads| {
        // `index mod num_threads` partitioning (spec.md §4.4); each
        // worker's `prev_offset` is derived straight from the block
        // table's own cumulative prefix sum, so no two workers ever need
        // to agree on anything beyond the table itself.
        for index in partition_reverse(blocks.len(), thread_no, num_threads) {
            let block = blocks.get(index);
            let prev_offset = uncompressed_region_start + blocks.cumulative_uncompressed_offset(index);

            // SAFETY: `prev_offset` at this `index` is the same value every
            // worker would compute (a deterministic prefix sum independent
            // of `thread_no`), and the `index mod num_threads` partition
            // assigns each index to exactly one worker, so this read range
            // never overlaps a concurrently-written range.
            let uncompressed = unsafe {
                target_map.slice(prev_offset as usize, block.uncompressed_length as usize)
            };
            let recompressed = codec::compress(compression, uncompressed, block.length)?;
            if recompressed.len() != block.length as usize {
                return Err(CodecError::RecompressedSizeMismatch {
                    expected: block.length,
                    got: recompressed.len(),
                }
                .into());
            }

            // SAFETY: `block.offset` slots are disjoint across blocks by
            // the BlockTable invariant (spec.md §3: non-overlapping), and
            // this index belongs only to this thread.
            let dest = unsafe {
                target_map.slice_mut(block.offset as usize, block.length as usize)
            };
            dest.copy_from_slice(&recompressed);
        }
        Ok(())
    })?;

    target.truncate(uncompressed_region_start)?;
    Ok(())
}
