//! The dispatch segment: per-call state workers read after `exec_in`.
//!
//! Created by the master at distribution time, once the registry sizes are
//! final. Holds a `{tag, len}` slot per input (which buffer generation to
//! map and how many rows are live) and an `assign_idx` row per function
//! (the current batch partition). Like every fabric value, slots are
//! written by the master before a barrier release and read by workers after
//! they cross.

use crate::sync::{SharedRegion, SyncError};
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::Ordering;

const MAGIC: u64 = 0x4c53_4450; // "LSDP"

const OFF_MAGIC: usize = 0;
const OFF_N_FUNCS: usize = 8;
const OFF_N_INPUTS: usize = 16;
const OFF_N_RANKS: usize = 24;
const HEADER: usize = 32;
const INPUT_SLOT: usize = 16;

const SCALAR: Ordering = Ordering::Relaxed;

pub(crate) struct DispatchTable {
    region: SharedRegion,
    n_funcs: usize,
    n_inputs: usize,
    n_ranks: usize,
}

impl DispatchTable {
    fn layout_len(n_funcs: usize, n_inputs: usize, n_ranks: usize) -> usize {
        HEADER + n_inputs * INPUT_SLOT + n_funcs * (n_ranks + 1) * 8
    }

    pub fn create(
        path: &Path,
        n_funcs: usize,
        n_inputs: usize,
        n_ranks: usize,
    ) -> Result<Self, SyncError> {
        let len = Self::layout_len(n_funcs, n_inputs, n_ranks).max(64);
        let region = SharedRegion::create(path, len)?;
        region.atomic_u64(OFF_N_FUNCS).store(n_funcs as u64, SCALAR);
        region
            .atomic_u64(OFF_N_INPUTS)
            .store(n_inputs as u64, SCALAR);
        region.atomic_u64(OFF_N_RANKS).store(n_ranks as u64, SCALAR);
        region.atomic_u64(OFF_MAGIC).store(MAGIC, Ordering::Release);
        Ok(Self {
            region,
            n_funcs,
            n_inputs,
            n_ranks,
        })
    }

    pub fn open(path: &Path) -> Result<Self, SyncError> {
        let region = SharedRegion::open(path)?;
        if region.len() < HEADER || region.atomic_u64(OFF_MAGIC).load(Ordering::Acquire) != MAGIC {
            return Err(SyncError::BadMagic {
                path: path.to_path_buf(),
            });
        }
        let n_funcs = region.atomic_u64(OFF_N_FUNCS).load(SCALAR) as usize;
        let n_inputs = region.atomic_u64(OFF_N_INPUTS).load(SCALAR) as usize;
        let n_ranks = region.atomic_u64(OFF_N_RANKS).load(SCALAR) as usize;
        if region.len() < Self::layout_len(n_funcs, n_inputs, n_ranks) {
            return Err(SyncError::Layout(format!(
                "dispatch segment is {} bytes, header claims {} functions / {} inputs / {} ranks",
                region.len(),
                n_funcs,
                n_inputs,
                n_ranks
            )));
        }
        Ok(Self {
            region,
            n_funcs,
            n_inputs,
            n_ranks,
        })
    }

    fn input_offset(&self, input_id: usize) -> usize {
        assert!(input_id < self.n_inputs, "input id out of range");
        HEADER + input_id * INPUT_SLOT
    }

    fn assign_offset(&self, func_id: usize, point: usize) -> usize {
        assert!(func_id < self.n_funcs, "function id out of range");
        assert!(point <= self.n_ranks);
        HEADER + self.n_inputs * INPUT_SLOT + (func_id * (self.n_ranks + 1) + point) * 8
    }

    /// Publishes which buffer generation an input lives in and its live row
    /// count for the upcoming call.
    pub fn set_input(&self, input_id: usize, tag: u64, rows: usize) {
        let off = self.input_offset(input_id);
        self.region.atomic_u64(off).store(tag, SCALAR);
        self.region.atomic_u64(off + 8).store(rows as u64, SCALAR);
    }

    /// `(tag, rows)` for an input, as published for the current call.
    pub fn input(&self, input_id: usize) -> (u64, usize) {
        let off = self.input_offset(input_id);
        (
            self.region.atomic_u64(off).load(SCALAR),
            self.region.atomic_u64(off + 8).load(SCALAR) as usize,
        )
    }

    /// Publishes a function's batch partition prefix array.
    pub fn set_assign(&self, func_id: usize, assign_idx: &[usize]) {
        assert_eq!(assign_idx.len(), self.n_ranks + 1);
        for (point, &idx) in assign_idx.iter().enumerate() {
            self.region
                .atomic_u64(self.assign_offset(func_id, point))
                .store(idx as u64, SCALAR);
        }
    }

    /// The batch-axis range `rank` owns for `func_id`.
    pub fn assign_range(&self, func_id: usize, rank: usize) -> Range<usize> {
        let start = self
            .region
            .atomic_u64(self.assign_offset(func_id, rank))
            .load(SCALAR) as usize;
        let end = self
            .region
            .atomic_u64(self.assign_offset(func_id, rank + 1))
            .load(SCALAR) as usize;
        start..end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::assign_indices;

    #[test]
    fn slots_round_trip_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.seg");
        let master = DispatchTable::create(&path, 2, 3, 4).unwrap();
        let worker = DispatchTable::open(&path).unwrap();

        master.set_input(1, 7, 101);
        assert_eq!(worker.input(1), (7, 101));

        master.set_assign(1, &assign_indices(101, 4));
        assert_eq!(worker.assign_range(1, 0), 0..26);
        assert_eq!(worker.assign_range(1, 3), 76..101);
    }

    #[test]
    fn empty_registries_still_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.seg");
        DispatchTable::create(&path, 0, 0, 2).unwrap();
        DispatchTable::open(&path).unwrap();
    }
}
