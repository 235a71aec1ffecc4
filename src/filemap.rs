//! Scoped, bounds-checked memory-mapped file access.
//!
//! Mirrors the `mmap_file` helpers of the original C tool (open/create/close,
//! `mmap_read`/`mmap_write`) but replaces raw pointer arithmetic with a
//! bounds-checked slice accessor, per the Design Notes in the spec this
//! crate implements.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{Mmap, MmapMut};

use crate::error::SquashmergeError;

enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// An open file backed by a memory mapping, with a known, fixed length.
///
/// `FileMap` owns both the `File` and its mapping. Dropping it unmaps and
/// closes the file; [`FileMap::close`] does the same explicitly and flushes
/// first, matching the `mmap_close` contract of the original tool.
pub struct FileMap {
    file: File,
    mapping: Mapping,
    length: u64,
}

impl FileMap {
    /// Opens an existing file read-only and maps the whole thing.
    pub fn open_readonly(path: impl AsRef<Path>) -> Result<Self, SquashmergeError> {
        let file = File::open(path)?;
        let length = file.metadata()?.len();
        // SAFETY: the mapping is only ever used within the lifetime of this
        // `FileMap`, and the file is not concurrently truncated by us.
        let mapping = unsafe { Mmap::map(&file)? };
        Ok(Self { file, mapping: Mapping::ReadOnly(mapping), length })
    }

    /// Creates a new file truncated to exactly `length` bytes and maps it
    /// read-write. Used for the scratch image, whose final size is known
    /// up front (spec: Expander scratch sizing).
    pub fn create_sized(path: impl AsRef<Path>, length: u64) -> Result<Self, SquashmergeError> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        file.set_len(length)?;
        let mapping = if length == 0 {
            Mapping::ReadWrite(MmapMut::map_anon(0)?)
        } else {
            // SAFETY: same invariant as above; the file was just created by us.
            Mapping::ReadWrite(unsafe { MmapMut::map_mut(&file)? })
        };
        Ok(Self { file, mapping, length })
    }

    /// Opens (creating/truncating) a file for writing without mapping it yet.
    /// Mirrors `mmap_create_without_mapping`: the target file is opened
    /// before the scratch directory `chdir`/creation dance, but isn't ready
    /// to be mapped until the external differ has written its full size.
    pub fn create_unmapped(path: impl AsRef<Path>) -> Result<File, SquashmergeError> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        Ok(file)
    }

    /// Remaps an already-written file read-write, after some other process
    /// (the external differ) has filled it via its own fd. This is the
    /// "AFTER_DIFF" state transition of the Squasher state machine.
    pub fn remap_readwrite(file: File) -> Result<Self, SquashmergeError> {
        let length = file.metadata()?.len();
        let mapping = if length == 0 {
            Mapping::ReadWrite(MmapMut::map_anon(0)?)
        } else {
            // SAFETY: caller guarantees no other writer is concurrently
            // truncating this file underneath us.
            Mapping::ReadWrite(unsafe { MmapMut::map_mut(&file)? })
        };
        Ok(Self { file, mapping, length })
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn fd(&self) -> &File {
        &self.file
    }

    fn check_bounds(&self, offset: u64, length: u64) -> Result<(), SquashmergeError> {
        let end = offset.checked_add(length).ok_or(SquashmergeError::Bounds {
            offset,
            length,
            file_length: self.length,
        })?;
        if end > self.length {
            return Err(SquashmergeError::Bounds { offset, length, file_length: self.length });
        }
        Ok(())
    }

    /// Bounds-checked read of `[offset, offset+length)`.
    pub fn read(&self, offset: u64, length: u64) -> Result<&[u8], SquashmergeError> {
        self.check_bounds(offset, length)?;
        let slice: &[u8] = match &self.mapping {
            Mapping::ReadOnly(m) => m,
            Mapping::ReadWrite(m) => m,
        };
        Ok(&slice[offset as usize..(offset + length) as usize])
    }

    /// Bounds-checked mutable access to `[offset, offset+length)`. Only
    /// valid for a `FileMap` opened for writing.
    pub fn write_slice(&mut self, offset: u64, length: u64) -> Result<&mut [u8], SquashmergeError> {
        self.check_bounds(offset, length)?;
        match &mut self.mapping {
            Mapping::ReadWrite(m) => Ok(&mut m[offset as usize..(offset + length) as usize]),
            Mapping::ReadOnly(_) => {
                Err(SquashmergeError::Bounds { offset, length, file_length: self.length })
            },
        }
    }

    /// Copies `src` into `[offset, offset+src.len())`.
    pub fn write(&mut self, offset: u64, src: &[u8]) -> Result<(), SquashmergeError> {
        let dst = self.write_slice(offset, src.len() as u64)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Flushes the mapping and truncates the backing file to `new_length`.
    /// Used by the Squasher's final TRUNCATED transition.
    pub fn truncate(&mut self, new_length: u64) -> Result<(), SquashmergeError> {
        self.flush()?;
        self.file.set_len(new_length)?;
        self.length = new_length;
        Ok(())
    }

    fn flush(&self) -> Result<(), SquashmergeError> {
        if let Mapping::ReadWrite(m) = &self.mapping {
            m.flush()?;
        }
        Ok(())
    }

    /// Flushes and unmaps. Also happens implicitly on `Drop`; exposed so
    /// callers can observe and propagate flush errors explicitly, matching
    /// the scoped-acquisition discipline the spec calls for.
    pub fn close(mut self) -> Result<(), SquashmergeError> {
        self.flush()
    }
}

/// A disjoint, bounds-checked mutable window into a `FileMap`'s backing
/// mapping, handed to a single worker thread. Construction is `unsafe`
/// because the caller must guarantee non-overlap with every other live
/// view over the same `FileMap` — [`crate::worker_pool::run`]'s
/// `index mod num_threads` partitioning rule is exactly what guarantees
/// this.
pub struct RawMap {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: `RawMap` is only ever constructed over disjoint byte ranges by
// `WorkerPool`, so sending distinct `RawMap`s to distinct threads never
// aliases mutable memory.
unsafe impl Send for RawMap {}
// SAFETY: callers of `slice`/`slice_mut` uphold disjointness of the ranges
// they access concurrently (the `index mod num_threads` partition), so a
// single `RawMap` may be shared by reference across worker threads.
unsafe impl Sync for RawMap {}

impl FileMap {
    /// Returns a raw, unchecked mutable pointer+length pair over the whole
    /// mapping, for callers to slice into disjoint worker views. Not
    /// exposed outside the crate: only `worker_pool` is trusted to uphold
    /// the disjointness invariant.
    pub(crate) fn raw_map_mut(&mut self) -> Result<RawMap, SquashmergeError> {
        match &mut self.mapping {
            Mapping::ReadWrite(m) => Ok(RawMap { ptr: m.as_mut_ptr(), len: m.len() }),
            Mapping::ReadOnly(_) => {
                Err(SquashmergeError::Bounds { offset: 0, length: 0, file_length: self.length })
            },
        }
    }

}

impl RawMap {
    /// # Safety
    /// The caller must guarantee `[offset, offset+len)` is within bounds and
    /// does not overlap any other live borrow of this `RawMap`'s backing
    /// region that is being written concurrently.
    pub(crate) unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        // SAFETY: forwarded from caller.
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }

    /// # Safety
    /// See [`RawMap::slice`]; additionally the caller must guarantee no
    /// other thread reads or writes this range for the lifetime of the
    /// returned slice.
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.len);
        // SAFETY: forwarded from caller.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch");
        let mut fm = FileMap::create_sized(&path, 16).unwrap();
        fm.write(4, b"abcd").unwrap();
        assert_eq!(fm.read(4, 4).unwrap(), b"abcd");
    }

    #[test]
    fn out_of_bounds_read_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch");
        let fm = FileMap::create_sized(&path, 8).unwrap();
        assert!(fm.read(4, 8).is_err());
    }

    #[test]
    fn out_of_bounds_write_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch");
        let mut fm = FileMap::create_sized(&path, 8).unwrap();
        assert!(fm.write(4, &[0u8; 8]).is_err());
    }

    #[test]
    fn zero_length_create_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch");
        let fm = FileMap::create_sized(&path, 0).unwrap();
        assert_eq!(fm.len(), 0);
    }
}
