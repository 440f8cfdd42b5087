//! File-backed shared-memory regions.
//!
//! Every piece of cross-process state — the control fabric, the dispatch
//! table, input batch buffers, scatter mirrors, communicator scratch — is a
//! file in the run directory mapped `MAP_SHARED` into each participating
//! process. The master creates regions; workers open them by path.
//!
//! # Safety model
//!
//! Regions are written through `&self` with raw pointer copies. The protocol
//! guarantees exactly one writer per slot between two barrier crossings, and
//! the barrier generation word carries the Release/Acquire edge that makes
//! the writes visible (see [`super::ShmBarrier`]). Atomic words in a region
//! must sit at their natural alignment; the mapping itself is page-aligned.

use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64};

pub struct SharedRegion {
    map: MmapMut,
    path: PathBuf,
}

impl SharedRegion {
    /// Creates (or truncates) the backing file at `len` bytes and maps it.
    pub fn create(path: &Path, len: usize) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            map,
            path: path.to_path_buf(),
        })
    }

    /// Maps an existing region created by another process.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            map,
            path: path.to_path_buf(),
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check(&self, offset: usize, len: usize, align: usize) {
        assert!(
            offset
                .checked_add(len)
                .is_some_and(|end| end <= self.map.len()),
            "region access out of bounds: {}..{} of {}",
            offset,
            offset + len,
            self.map.len()
        );
        assert!(offset % align == 0, "misaligned region access at {offset}");
    }

    /// Atomic word at `offset` (4-aligned, in bounds).
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        self.check(offset, 4, 4);
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU32) }
    }

    /// Atomic word at `offset` (8-aligned, in bounds).
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        self.check(offset, 8, 8);
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU64) }
    }

    /// Copies `src` into the region. Single-writer-per-slot discipline.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        self.check(offset, src.len(), 1);
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.map.as_ptr().add(offset) as *mut u8,
                src.len(),
            );
        }
    }

    /// Copies region bytes into `dst`.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len(), 1);
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.map.as_ptr().add(offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
    }

    /// Borrowed view of region bytes. The caller observes the barrier
    /// protocol: no concurrent writer may own this slot while the view is
    /// read.
    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        self.check(offset, len, 1);
        unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(offset), len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn create_open_share_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.seg");
        let a = SharedRegion::create(&path, 4096).unwrap();
        let b = SharedRegion::open(&path).unwrap();

        a.write_bytes(128, &[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        b.read_bytes(128, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);

        a.atomic_u32(0).store(7, Ordering::Release);
        assert_eq!(b.atomic_u32(0).load(Ordering::Acquire), 7);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn bounds_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.seg");
        let a = SharedRegion::create(&path, 64).unwrap();
        a.bytes(60, 8);
    }
}
