//! End-to-end exercises of `squashmerge::apply`. Fixtures are built in
//! process rather than vendored as binary blobs (spec.md §8, "Concrete
//! scenarios").
//!
//! Tests that need the real `xdelta3` binary on `PATH` are `#[ignore]`d,
//! following the teacher's habit of gating environment-dependent tests
//! (`backhand-test`'s `__test_unsquashfs`-style feature gating) rather than
//! vendoring a second implementation of the differ.

use std::io::Write;
use std::path::Path;
use std::process::Command;

fn xdelta3_available() -> bool {
    Command::new("xdelta3").arg("-V").output().is_ok()
}

fn write_squashfs_stub(path: &Path, compressor_id: u16) {
    // Only the 22-byte prefix this tool inspects: magic (LE) + 4 unused
    // u32s + compressor id (u16, same endianness as the magic).
    let mut bytes = vec![0u8; 22];
    bytes[0..4].copy_from_slice(&0x7371_7368u32.to_le_bytes());
    bytes[20..22].copy_from_slice(&compressor_id.to_le_bytes());
    std::fs::write(path, bytes).unwrap();
}

fn append_block(patch: &mut Vec<u8>, offset: u32, length: u32, uncompressed_length: u32) {
    patch.extend_from_slice(&offset.to_be_bytes());
    patch.extend_from_slice(&length.to_be_bytes());
    patch.extend_from_slice(&uncompressed_length.to_be_bytes());
}

/// Builds a minimal, otherwise-valid sqdelta patch header + single block
/// descriptor, for tests that corrupt one field and check it's rejected.
fn build_identity_patch() -> Vec<u8> {
    let mut patch = Vec::new();
    patch.extend_from_slice(&0x5371_ceb4u32.to_be_bytes()); // magic
    patch.extend_from_slice(&0u32.to_be_bytes()); // flags
    patch.extend_from_slice(&0x0100_0005u32.to_be_bytes()); // LZO level 5
    patch.extend_from_slice(&1u32.to_be_bytes()); // block_count
    append_block(&mut patch, 0, 0, 0);
    patch
}

#[test]
#[ignore = "requires the xdelta3 binary on PATH"]
fn identity_patch_reproduces_source() {
    if !xdelta3_available() {
        eprintln!("xdelta3 not found on PATH, skipping");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("source.sqfs");

    // One LZO-compressed 64 KiB block of zeros, framed as a tiny SquashFS
    // stub (spec.md §8, scenario 1).
    let payload = vec![0u8; 64 * 1024];
    let compressed = squashmerge::codec::compress(
        squashmerge::codec::Selector::parse(0x0100_0009).unwrap(),
        &payload,
        0,
    )
    .unwrap();

    let mut source_bytes = vec![0u8; 22];
    source_bytes[0..4].copy_from_slice(&0x7371_7368u32.to_le_bytes());
    source_bytes[20..22].copy_from_slice(&3u16.to_le_bytes()); // COMP_LZO
    source_bytes.extend_from_slice(&compressed);
    std::fs::write(&source_path, &source_bytes).unwrap();

    let block_offset = 22u32;
    let block_length = compressed.len() as u32;

    let mut patch = Vec::new();
    patch.extend_from_slice(&0x5371_ceb4u32.to_be_bytes());
    patch.extend_from_slice(&0u32.to_be_bytes());
    patch.extend_from_slice(&0x0100_0009u32.to_be_bytes());
    patch.extend_from_slice(&1u32.to_be_bytes());
    append_block(&mut patch, block_offset, block_length, payload.len() as u32);

    // xdelta3 body: an empty/identity delta that, applied against the
    // scratch source, reproduces it byte for byte. We build this by
    // shelling out to `xdelta3 -e` against a scratch image we construct
    // the same way the Expander would.
    let scratch_len = source_bytes.len() as u64 + 16 + 12 + payload.len() as u64;
    let mut scratch_bytes = Vec::with_capacity(scratch_len as usize);
    scratch_bytes.extend_from_slice(&source_bytes); // gap [0, block.offset) + block bytes verbatim
    scratch_bytes.extend_from_slice(&payload); // decompressed payload
    append_block(&mut scratch_bytes, block_offset, block_length, payload.len() as u32);
    scratch_bytes.extend_from_slice(&patch[0..16]);

    let scratch_path = dir.path().join("scratch");
    std::fs::write(&scratch_path, &scratch_bytes).unwrap();

    let delta_path = dir.path().join("body.xdelta");
    let status = Command::new("xdelta3")
        .arg("-e")
        .arg("-s")
        .arg(&scratch_path)
        .arg(&scratch_path)
        .arg(&delta_path)
        .status()
        .unwrap();
    assert!(status.success());

    let mut patch_file = std::fs::File::create(dir.path().join("patch.sqdelta")).unwrap();
    patch_file.write_all(&patch).unwrap();
    patch_file.write_all(&std::fs::read(&delta_path).unwrap()).unwrap();
    drop(patch_file);

    let target_path = dir.path().join("target.sqfs");
    squashmerge::apply(&source_path, &dir.path().join("patch.sqdelta"), &target_path).unwrap();

    let result = std::fs::read(&target_path).unwrap();
    assert_eq!(result, source_bytes);
}

#[test]
fn corrupt_patch_magic_is_rejected_before_touching_target() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("source.sqfs");
    write_squashfs_stub(&source_path, 3);

    let patch_path = dir.path().join("patch.sqdelta");
    std::fs::write(&patch_path, build_identity_patch()).unwrap();
    // Corrupt the magic.
    let mut bytes = std::fs::read(&patch_path).unwrap();
    bytes[0..4].copy_from_slice(&0u32.to_be_bytes());
    std::fs::write(&patch_path, bytes).unwrap();

    let target_path = dir.path().join("target.sqfs");
    let err = squashmerge::apply(&source_path, &patch_path, &target_path).unwrap_err();
    assert!(err.to_string().contains("Incorrect magic"));
}

#[test]
fn declared_block_count_longer_than_patch_file_is_a_bounds_error() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("source.sqfs");
    write_squashfs_stub(&source_path, 3);

    let mut patch = Vec::new();
    patch.extend_from_slice(&0x5371_ceb4u32.to_be_bytes());
    patch.extend_from_slice(&0u32.to_be_bytes());
    patch.extend_from_slice(&0x0100_0005u32.to_be_bytes());
    patch.extend_from_slice(&10u32.to_be_bytes()); // block_count = 10
    append_block(&mut patch, 22, 10, 20); // only one descriptor present

    let patch_path = dir.path().join("patch.sqdelta");
    std::fs::write(&patch_path, &patch).unwrap();

    let target_path = dir.path().join("target.sqfs");
    let err = squashmerge::apply(&source_path, &patch_path, &target_path).unwrap_err();
    assert!(matches!(err, squashmerge::SquashmergeError::Bounds { .. }));
}
