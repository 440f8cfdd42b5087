//! Shared-memory collective transport.
//!
//! All ranks rendezvous on one scratch segment: a fixed header with an
//! internal barrier, a slot-size table, and a growable data area addressed
//! by a generation tag. Every primitive runs the same four-phase protocol —
//! publish sizes, grow if needed, write payloads, read — with a barrier
//! between phases, so the barrier count per operation is identical on every
//! rank regardless of who reallocates or what it reads.
//!
//! The creating rank (the master) owns capacity growth; a grown data area
//! gets a fresh tag and every other rank remaps when it notices the tag
//! moved. Reductions accumulate the slots in rank order on every reader, so
//! all ranks produce bitwise-identical results.

use super::DeviceComm;
use crate::collective::ReduceOp;
use crate::sync::{ShmBarrier, SharedRegion, SyncError};
use crate::tensor::TensorData;
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

const OFF_BAR: usize = 0;
const OFF_DATA_TAG: usize = 8;
const OFF_DATA_CAPACITY: usize = 16;
const OFF_SLOTS: usize = 24;
const SLOT_ALIGN: usize = 64;
const DEFAULT_CAPACITY: usize = 1 << 20;

const SCALAR: Ordering = Ordering::Relaxed;

pub struct ShmemComm {
    rank: usize,
    n_ranks: usize,
    is_owner: bool,
    dir: PathBuf,
    hdr: SharedRegion,
    data: Option<(u64, SharedRegion)>,
    timeout: Option<Duration>,
}

fn hdr_len(n_ranks: usize) -> usize {
    (OFF_SLOTS + 8 * n_ranks).next_multiple_of(4096)
}

fn data_path(dir: &Path, tag: u64) -> PathBuf {
    dir.join(format!("data_{tag}.buf"))
}

impl ShmemComm {
    /// Master side: creates the rendezvous directory and scratch segments.
    /// The directory path is the join token workers receive through the
    /// setup store.
    pub fn create(
        dir: &Path,
        n_ranks: usize,
        rank: usize,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let hdr = SharedRegion::create(&dir.join("hdr.seg"), hdr_len(n_ranks))?;
        let data = SharedRegion::create(&data_path(dir, 1), DEFAULT_CAPACITY)?;
        hdr.atomic_u64(OFF_DATA_CAPACITY)
            .store(DEFAULT_CAPACITY as u64, SCALAR);
        hdr.atomic_u64(OFF_DATA_TAG).store(1, Ordering::Release);
        Ok(Self {
            rank,
            n_ranks,
            is_owner: true,
            dir: dir.to_path_buf(),
            hdr,
            data: Some((1, data)),
            timeout,
        })
    }

    /// Worker side: joins a clique the master already created.
    pub fn join(
        dir: &Path,
        n_ranks: usize,
        rank: usize,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let hdr = SharedRegion::open(&dir.join("hdr.seg"))?;
        if hdr.len() < hdr_len(n_ranks) {
            return Err(SyncError::Layout(format!(
                "comm header is {} bytes, expected {}",
                hdr.len(),
                hdr_len(n_ranks)
            ))
            .into());
        }
        Ok(Self {
            rank,
            n_ranks,
            is_owner: false,
            dir: dir.to_path_buf(),
            hdr,
            data: None,
            timeout,
        })
    }

    fn barrier(&self) -> Result<()> {
        ShmBarrier::new(
            self.hdr.atomic_u32(OFF_BAR),
            self.hdr.atomic_u32(OFF_BAR + 4),
            self.n_ranks as u32,
        )
        .wait(self.timeout)
        .map_err(Error::from)
    }

    fn slot_word(&self, rank: usize) -> &std::sync::atomic::AtomicU64 {
        self.hdr.atomic_u64(OFF_SLOTS + 8 * rank)
    }

    /// Maps the current data generation if this rank's mapping is stale.
    fn remap(&mut self) -> Result<()> {
        let tag = self.hdr.atomic_u64(OFF_DATA_TAG).load(Ordering::Acquire);
        let stale = match &self.data {
            Some((mapped, _)) => *mapped != tag,
            None => true,
        };
        if stale {
            let region = SharedRegion::open(&data_path(&self.dir, tag))?;
            self.data = Some((tag, region));
        }
        Ok(())
    }

    fn data_region(&self) -> Result<&SharedRegion> {
        match &self.data {
            Some((_, region)) => Ok(region),
            None => Err(Error::Engine("comm data area not mapped".into())),
        }
    }

    /// Four-phase slot exchange: publish sizes, grow, write, leave the
    /// payloads readable. The caller reads its slots and then must cross
    /// [`Self::barrier`] once more before returning, so no rank can start
    /// the next operation while another still reads.
    fn exchange(&mut self, payload: &[u8]) -> Result<(Vec<usize>, Vec<usize>)> {
        // Phase 1: sizes.
        self.slot_word(self.rank).store(payload.len() as u64, SCALAR);
        self.barrier()?;

        let sizes: Vec<usize> = (0..self.n_ranks)
            .map(|r| self.slot_word(r).load(SCALAR) as usize)
            .collect();
        let mut offsets = Vec::with_capacity(self.n_ranks);
        let mut total = 0usize;
        for &size in &sizes {
            offsets.push(total);
            total += size.next_multiple_of(SLOT_ALIGN);
        }

        // Phase 2: the owner grows the data area under a fresh tag.
        if self.is_owner && total > self.hdr.atomic_u64(OFF_DATA_CAPACITY).load(SCALAR) as usize {
            let tag = self.hdr.atomic_u64(OFF_DATA_TAG).load(SCALAR) + 1;
            let capacity = total.next_power_of_two().max(DEFAULT_CAPACITY);
            let region = SharedRegion::create(&data_path(&self.dir, tag), capacity)?;
            let old = data_path(&self.dir, tag - 1);
            self.hdr
                .atomic_u64(OFF_DATA_CAPACITY)
                .store(capacity as u64, SCALAR);
            self.hdr.atomic_u64(OFF_DATA_TAG).store(tag, SCALAR);
            self.data = Some((tag, region));
            // Unlinking is safe while stale mappings still exist; they are
            // dropped at the remap below.
            let _ = std::fs::remove_file(old);
        }
        self.barrier()?;

        // Phase 3: everyone maps the live generation and writes its slot.
        self.remap()?;
        if !payload.is_empty() {
            self.data_region()?.write_bytes(offsets[self.rank], payload);
        }
        self.barrier()?;

        Ok((sizes, offsets))
    }

    /// Accumulates all slots in rank order; every rank computes the same
    /// result bit for bit.
    fn combine_slots(
        &self,
        dtype: crate::tensor::Dtype,
        sizes: &[usize],
        offsets: &[usize],
        op: ReduceOp,
    ) -> Result<TensorData> {
        let region = self.data_region()?;
        let mut acc = TensorData::from_bytes(dtype, region.bytes(offsets[0], sizes[0]))?;
        for r in 1..self.n_ranks {
            let part = TensorData::from_bytes(dtype, region.bytes(offsets[r], sizes[r]))?;
            acc.combine_assign(&part, op)?;
        }
        Ok(acc)
    }
}

impl DeviceComm for ShmemComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.n_ranks
    }

    fn broadcast(&mut self, data: &mut TensorData, root: usize) -> Result<()> {
        let payload: Vec<u8> = if self.rank == root {
            data.as_bytes().to_vec()
        } else {
            Vec::new()
        };
        let (sizes, offsets) = self.exchange(&payload)?;
        if self.rank != root {
            if sizes[root] != data.nbytes() {
                return Err(Error::ShapeMismatch {
                    expected: vec![data.nbytes()],
                    got: vec![sizes[root]],
                });
            }
            let bytes = self.data_region()?.bytes(offsets[root], sizes[root]);
            data.copy_from_bytes(bytes)?;
        }
        self.barrier()
    }

    fn reduce(&mut self, data: &mut TensorData, op: ReduceOp, root: usize) -> Result<()> {
        let payload = data.as_bytes().to_vec();
        let (sizes, offsets) = self.exchange(&payload)?;
        if self.rank == root {
            *data = self.combine_slots(data.dtype(), &sizes, &offsets, op)?;
        }
        self.barrier()
    }

    fn all_reduce(&mut self, data: &mut TensorData, op: ReduceOp) -> Result<()> {
        let payload = data.as_bytes().to_vec();
        let (sizes, offsets) = self.exchange(&payload)?;
        *data = self.combine_slots(data.dtype(), &sizes, &offsets, op)?;
        self.barrier()
    }

    fn all_gather(&mut self, data: &TensorData) -> Result<Vec<TensorData>> {
        let payload = data.as_bytes().to_vec();
        let (sizes, offsets) = self.exchange(&payload)?;
        let region = self.data_region()?;
        let mut parts = Vec::with_capacity(self.n_ranks);
        for r in 0..self.n_ranks {
            parts.push(TensorData::from_bytes(
                data.dtype(),
                region.bytes(offsets[r], sizes[r]),
            )?);
        }
        self.barrier()?;
        Ok(parts)
    }
}
