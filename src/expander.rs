//! Builds the expanded scratch image (spec.md §4.5): verbatim gaps,
//! decompressed block payloads, then the patch's own block table and
//! header appended as a trailer so the post-diff target stays
//! self-describing for the [`crate::squasher`].

use tracing::{debug, info, instrument};

use crate::block_table::BlockTable;
use crate::codec;
use crate::codec::Selector;
use crate::error::{CodecError, SquashmergeError};
use crate::filemap::FileMap;
use crate::header::{BLOCK_DESCRIPTOR_LEN, SQDELTA_HEADER_LEN};
use crate::worker_pool::{self, partition_forward};

/// Computes the exact scratch image size required by [`expand`]:
/// `source.length + sizeof(header) + |block_table_bytes| + Σ unc_length_i`
/// (spec.md §4.5).
pub fn scratch_length(source_length: u64, blocks: &BlockTable) -> u64 {
    source_length
        + SQDELTA_HEADER_LEN
        + blocks.len() as u64 * BLOCK_DESCRIPTOR_LEN
        + blocks.total_uncompressed_length()
}

/// Runs the three-step Expander algorithm of spec.md §4.5 against an
/// already appropriately-sized `scratch` FileMap.
#[instrument(skip(source, patch, scratch, blocks))]
pub fn expand(
    compression: Selector,
    blocks: &BlockTable,
    source: &FileMap,
    patch_header_offset: u64,
    patch: &FileMap,
    scratch: &mut FileMap,
) -> Result<(), SquashmergeError> {
    let source_len = source.len();
    info!(block_count = blocks.len(), source_len, "expanding scratch image");

    // Step 1: copy every verbatim gap, sequentially (spec.md §5: "Expander
    // steps 1 -> 2 -> 3 are strictly sequential").
    for i in 0..blocks.len() {
        let gap = blocks.gap_before(i);
        if !gap.is_empty() {
            copy_verbatim(source, scratch, u64::from(gap.start), u64::from(gap.len()))?;
        }
    }
    let tail = blocks.tail_gap(
        u32::try_from(source_len).map_err(|_| crate::error::FormatError::NarrowingOverflow(source_len))?,
    );
    if !tail.is_empty() {
        copy_verbatim(source, scratch, u64::from(tail.start), u64::from(tail.len()))?;
    }

    // Step 2: decompress every block into the append region, in parallel.
    decompress_blocks(compression, blocks, source, scratch)?;

    // Step 3: append the patch's block table, then its header, verbatim.
    let block_table_len = blocks.len() as u64 * BLOCK_DESCRIPTOR_LEN;
    let append_start = source_len + blocks.total_uncompressed_length();
    let block_table_bytes = patch.read(patch_header_offset + SQDELTA_HEADER_LEN, block_table_len)?;
    scratch.write(append_start, block_table_bytes)?;

    let header_bytes = patch.read(patch_header_offset, SQDELTA_HEADER_LEN)?;
    scratch.write(append_start + block_table_len, header_bytes)?;

    debug!("scratch image complete");
    Ok(())
}

fn copy_verbatim(
    source: &FileMap,
    scratch: &mut FileMap,
    offset: u64,
    length: u64,
) -> Result<(), SquashmergeError> {
    let bytes = source.read(offset, length)?;
    scratch.write(offset, bytes)
}

fn decompress_blocks(
    compression: Selector,
    blocks: &BlockTable,
    source: &FileMap,
    scratch: &mut FileMap,
) -> Result<(), SquashmergeError> {
    if blocks.is_empty() {
        // spec.md §8: "block_count == 0 ... WorkerPool is still invoked and
        // must succeed with zero iterations."
        return worker_pool::run(|_thread_no, _num_threads| Ok(()));
    }

    let source_len = source.len();
    let append_base = source_len;
    let scratch_map = scratch.raw_map_mut()?;

    worker_pool::run(move |thread_no, num_threads| {
        for index in partition_forward(blocks.len(), thread_no, num_threads) {
            let block = blocks.get(index);
            let compressed = source.read(u64::from(block.offset), u64::from(block.length))?;
            let decompressed = codec::decompress(compression, compressed, block.uncompressed_length)?;
            if decompressed.len() != block.uncompressed_length as usize {
                return Err(CodecError::DecompressedSizeMismatch {
                    expected: block.uncompressed_length,
                    got: decompressed.len() as u32,
                }
                .into());
            }

            let dest_offset = append_base + blocks.cumulative_uncompressed_offset(index);
            // SAFETY: distinct `index` values in the forward partition are
            // assigned to exactly one `thread_no` each, and the cumulative
            // offsets are a deterministic prefix sum over the whole table,
            // so these byte ranges are disjoint across every thread.
            let dest = unsafe {
                scratch_map.slice_mut(dest_offset as usize, block.uncompressed_length as usize)
            };
            dest.copy_from_slice(&decompressed);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CompressedBlock;

    fn selector() -> Selector {
        crate::codec::Selector::parse(0x0100_0005).unwrap()
    }

    #[test]
    fn scratch_length_matches_formula() {
        let blocks = BlockTable::new(vec![
            CompressedBlock { offset: 0, length: 10, uncompressed_length: 100 },
            CompressedBlock { offset: 10, length: 10, uncompressed_length: 200 },
        ]);
        assert_eq!(scratch_length(20, &blocks), 20 + 16 + 2 * 12 + 300);
    }

    #[test]
    #[cfg(feature = "lzo")]
    fn expand_zero_blocks_is_a_single_verbatim_copy() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("source");
        std::fs::write(&source_path, b"hello world").unwrap();
        let source = FileMap::open_readonly(&source_path).unwrap();

        let mut patch_bytes = Vec::new();
        patch_bytes.extend_from_slice(&crate::header::SQDELTA_MAGIC.to_be_bytes());
        patch_bytes.extend_from_slice(&0u32.to_be_bytes());
        patch_bytes.extend_from_slice(&0x0100_0005u32.to_be_bytes());
        patch_bytes.extend_from_slice(&0u32.to_be_bytes());
        let patch_path = dir.path().join("patch");
        std::fs::write(&patch_path, &patch_bytes).unwrap();
        let patch = FileMap::open_readonly(&patch_path).unwrap();

        let blocks = BlockTable::new(vec![]);
        let scratch_path = dir.path().join("scratch");
        let mut scratch =
            FileMap::create_sized(&scratch_path, scratch_length(source.len(), &blocks)).unwrap();

        expand(selector(), &blocks, &source, 0, &patch, &mut scratch).unwrap();

        assert_eq!(scratch.read(0, 11).unwrap(), b"hello world");
        assert_eq!(scratch.read(11, 16).unwrap(), &patch_bytes[..]);
    }
}
