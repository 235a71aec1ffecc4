//! Orchestrates the full patch-apply pipeline (spec.md §2's data-flow
//! diagram): HeaderCodec -> BlockTable -> Expander -> Differ -> Squasher.

use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

use tempfile::Builder as TempFileBuilder;
use tracing::{info, instrument};

use crate::block_table::BlockTable;
use crate::differ;
use crate::error::SquashmergeError;
use crate::expander;
use crate::filemap::FileMap;
use crate::header::{self, BLOCK_DESCRIPTOR_LEN, SQDELTA_HEADER_LEN};
use crate::squasher;

/// Applies `patch` to `source`, writing the result to `target`. Returns
/// `Ok(())` only once `target` has reached the TRUNCATED state of the
/// Squasher's state machine (spec.md §4.7) — a fully valid, re-compressed
/// SquashFS archive.
///
/// On any failure the partial `target` file is left in place for
/// diagnostic inspection (spec.md §7): this function never deletes or
/// rewrites it itself, only ever appends/extends.
#[instrument(skip(source, patch, target))]
pub fn apply(source: &Path, patch: &Path, target: &Path) -> Result<(), SquashmergeError> {
    info!(source = %source.display(), patch = %patch.display(), target = %target.display(), "applying sqdelta patch");

    let source_map = FileMap::open_readonly(source)?;
    // Validates magic and compressor support; this implementation's chosen
    // patch-header layout (SPEC_FULL.md §C.4) carries its own `compression`
    // selector, so the superblock's codec id isn't consulted beyond this
    // precondition check.
    header::read_squashfs_superblock(&source_map)?;

    let patch_map = FileMap::open_readonly(patch)?;
    let patch_header = header::read_sqdelta_header(&patch_map, 0)?;
    let blocks = header::read_block_descriptors(&patch_map, SQDELTA_HEADER_LEN, patch_header.block_count)?;
    let blocks = BlockTable::new(blocks);
    blocks.validate(source_map.len())?;

    // CREATED: open target before entering the scratch directory, exactly
    // as the original tool does (spec.md §6).
    let target_file = FileMap::create_unmapped(target)?;

    let scratch_dir = scratch_directory();
    let scratch_path = TempFileBuilder::new()
        .prefix("tmp.")
        .rand_bytes(6)
        .tempfile_in(&scratch_dir)?
        .into_temp_path();
    let scratch_path: PathBuf = scratch_path.keep()?;

    let result =
        run_expand_and_diff(&patch_header, &blocks, &source_map, &patch_map, &scratch_path, target_file);

    // "The scratch file is unlinked after use regardless of success"
    // (spec.md §5).
    let _ = std::fs::remove_file(&scratch_path);

    let target_file = result?;

    // AFTER_DIFF -> COMPRESSED -> TRUNCATED.
    let mut target_map = FileMap::remap_readwrite(target_file)?;
    let (trailer_blocks, trailer_start) = squasher::read_trailer(&target_map)?;
    squasher::squash(patch_header.compression, &trailer_blocks, trailer_start, &mut target_map)?;
    target_map.close()?;

    info!("patch applied successfully");
    Ok(())
}

fn run_expand_and_diff(
    patch_header: &header::SqdeltaHeader,
    blocks: &BlockTable,
    source_map: &FileMap,
    patch_map: &FileMap,
    scratch_path: &Path,
    target_file: File,
) -> Result<File, SquashmergeError> {
    let scratch_len = expander::scratch_length(source_map.len(), blocks);
    let mut scratch_map = FileMap::create_sized(scratch_path, scratch_len)?;

    expander::expand(patch_header.compression, blocks, source_map, 0, patch_map, &mut scratch_map)?;
    scratch_map.close()?;

    let block_table_len = u64::from(patch_header.block_count) * BLOCK_DESCRIPTOR_LEN;
    let patch_body = differ::seek_to_patch_body(
        patch_map.fd().try_clone()?,
        SQDELTA_HEADER_LEN + block_table_len,
    )?;

    differ::apply(scratch_path, patch_body, target_file.try_clone()?)?;
    Ok(target_file)
}

/// `TMPDIR`, falling back to `/tmp` (the `P_tmpdir` fallback of spec.md §6
/// is a libc constant with no portable Rust equivalent; `/tmp` is its
/// value on every platform this tool targets).
fn scratch_directory() -> PathBuf {
    env::var_os("TMPDIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_directory_honors_tmpdir() {
        let prior = env::var_os("TMPDIR");
        env::set_var("TMPDIR", "/some/test/dir");
        assert_eq!(scratch_directory(), PathBuf::from("/some/test/dir"));
        match prior {
            Some(v) => env::set_var("TMPDIR", v),
            None => env::remove_var("TMPDIR"),
        }
    }
}
