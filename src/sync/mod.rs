//! The synchronization fabric shared by every process in the group.
//!
//! One 4 KiB region holds the three barriers (`distribute`, `exec_in`,
//! `exec_out`) and the control scalars the master publishes before releasing
//! `exec_in`: what kind of step comes next, which function or collective it
//! targets, and the shared-state id list for collectives. The contract is
//! single-writer-then-rendezvous: the master writes, releases a barrier, and
//! every worker reads after crossing — there are no locks because exactly
//! one logical step happens between any two crossings.
//!
//! Setup-time metadata that does not fit fixed-size scalars (collect modes,
//! reduce ops, scatter flags, the communicator join token) goes through the
//! [`SetupStore`], a JSON file written once before the `distribute` barrier
//! and read once by each worker after it.

pub mod barrier;
pub mod region;

pub use barrier::ShmBarrier;
pub use region::SharedRegion;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// A bounded barrier wait elapsed before all parties arrived.
    #[error("barrier wait timed out ({parties} parties expected)")]
    BarrierTimeout { parties: u32 },

    /// A region is smaller than its layout requires, or a published value
    /// exceeds a fixed-capacity slot array.
    #[error("fabric layout error: {0}")]
    Layout(String),

    /// The fabric segment does not carry the expected magic word.
    #[error("not a fabric segment: {path}")]
    BadMagic { path: PathBuf },

    #[error("setup store codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Execution step codes published through `exec_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecKind {
    /// Run a registered function on the owned batch slice.
    Function,
    /// Run device-communicator collectives over shared-state entries.
    DeviceCollective,
    /// Move host data through shared-memory mirrors (scatter).
    HostCollective,
}

impl ExecKind {
    fn code(self) -> u32 {
        match self {
            ExecKind::Function => 1,
            ExecKind::DeviceCollective => 2,
            ExecKind::HostCollective => 3,
        }
    }

    fn from_code(code: u32) -> Option<ExecKind> {
        match code {
            1 => Some(ExecKind::Function),
            2 => Some(ExecKind::DeviceCollective),
            3 => Some(ExecKind::HostCollective),
            _ => None,
        }
    }
}

/// Most shared-state ids one collective call can target.
pub const MAX_COLLECTIVE_TARGETS: usize = 256;

const MAGIC: u32 = 0x4c_53_46_42; // "LSFB"

const OFF_MAGIC: usize = 0;
const OFF_N_RANKS: usize = 4;
const OFF_QUIT: usize = 8;
const OFF_DISTRIBUTED: usize = 12;
const OFF_EXEC_TYPE: usize = 16;
const OFF_FUNC_ID: usize = 20;
const OFF_COMM_KIND: usize = 24;
const OFF_COMM_OP: usize = 28;
const OFF_N_SHARED: usize = 32;
const OFF_BAR_DISTRIBUTE: usize = 40;
const OFF_BAR_EXEC_IN: usize = OFF_BAR_DISTRIBUTE + barrier::BARRIER_BYTES;
const OFF_BAR_EXEC_OUT: usize = OFF_BAR_EXEC_IN + barrier::BARRIER_BYTES;
const OFF_SHARED_IDS: usize = 64;
const FABRIC_LEN: usize = 4096;

// Scalar loads/stores are Relaxed throughout: their visibility rides on the
// Release/Acquire edge of the barrier generation word.
const SCALAR: Ordering = Ordering::Relaxed;

/// Handle to the fabric region, one per process.
pub struct SyncFabric {
    region: SharedRegion,
    parties: u32,
}

impl SyncFabric {
    /// Master side: creates and initializes the segment.
    pub fn create(path: &Path, n_ranks: usize) -> Result<Self, SyncError> {
        let region = SharedRegion::create(path, FABRIC_LEN)?;
        region.atomic_u32(OFF_N_RANKS).store(n_ranks as u32, SCALAR);
        region.atomic_u32(OFF_MAGIC).store(MAGIC, Ordering::Release);
        Ok(Self {
            region,
            parties: n_ranks as u32,
        })
    }

    /// Worker side: maps the segment the master created.
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        let region = SharedRegion::open(path)?;
        if region.len() < FABRIC_LEN {
            return Err(SyncError::Layout(format!(
                "fabric segment is {} bytes, expected {FABRIC_LEN}",
                region.len()
            )));
        }
        if region.atomic_u32(OFF_MAGIC).load(Ordering::Acquire) != MAGIC {
            return Err(SyncError::BadMagic {
                path: path.to_path_buf(),
            });
        }
        let parties = region.atomic_u32(OFF_N_RANKS).load(SCALAR);
        Ok(Self { region, parties })
    }

    pub fn n_ranks(&self) -> usize {
        self.parties as usize
    }

    /// Crossed exactly once, when functions are distributed (or when a
    /// never-distributed group is being torn down).
    pub fn distribute_barrier(&self) -> ShmBarrier<'_> {
        self.barrier_at(OFF_BAR_DISTRIBUTE)
    }

    /// Crossed at the start of every function or collective step.
    pub fn exec_in(&self) -> ShmBarrier<'_> {
        self.barrier_at(OFF_BAR_EXEC_IN)
    }

    /// Crossed at the end of every function or collective step.
    pub fn exec_out(&self) -> ShmBarrier<'_> {
        self.barrier_at(OFF_BAR_EXEC_OUT)
    }

    fn barrier_at(&self, offset: usize) -> ShmBarrier<'_> {
        ShmBarrier::new(
            self.region.atomic_u32(offset),
            self.region.atomic_u32(offset + 4),
            self.parties,
        )
    }

    pub fn quit(&self) -> bool {
        self.region.atomic_u32(OFF_QUIT).load(SCALAR) != 0
    }

    pub fn set_quit(&self) {
        self.region.atomic_u32(OFF_QUIT).store(1, SCALAR);
    }

    pub fn distributed(&self) -> bool {
        self.region.atomic_u32(OFF_DISTRIBUTED).load(SCALAR) != 0
    }

    pub fn set_distributed(&self) {
        self.region.atomic_u32(OFF_DISTRIBUTED).store(1, SCALAR);
    }

    pub fn exec_kind(&self) -> Option<ExecKind> {
        ExecKind::from_code(self.region.atomic_u32(OFF_EXEC_TYPE).load(SCALAR))
    }

    pub fn set_exec_kind(&self, kind: ExecKind) {
        self.region
            .atomic_u32(OFF_EXEC_TYPE)
            .store(kind.code(), SCALAR);
    }

    pub fn func_id(&self) -> usize {
        self.region.atomic_u32(OFF_FUNC_ID).load(SCALAR) as usize
    }

    pub fn set_func_id(&self, id: usize) {
        self.region.atomic_u32(OFF_FUNC_ID).store(id as u32, SCALAR);
    }

    pub fn comm_kind(&self) -> u32 {
        self.region.atomic_u32(OFF_COMM_KIND).load(SCALAR)
    }

    pub fn set_comm_kind(&self, code: u32) {
        self.region.atomic_u32(OFF_COMM_KIND).store(code, SCALAR);
    }

    pub fn comm_op(&self) -> u32 {
        self.region.atomic_u32(OFF_COMM_OP).load(SCALAR)
    }

    pub fn set_comm_op(&self, code: u32) {
        self.region.atomic_u32(OFF_COMM_OP).store(code, SCALAR);
    }

    /// Publishes the target id list for the next collective step.
    pub fn set_shared_ids(&self, ids: &[usize]) -> Result<(), SyncError> {
        if ids.len() > MAX_COLLECTIVE_TARGETS {
            return Err(SyncError::Layout(format!(
                "{} collective targets exceed the fabric capacity of {MAX_COLLECTIVE_TARGETS}",
                ids.len()
            )));
        }
        for (slot, &id) in ids.iter().enumerate() {
            self.region
                .atomic_u32(OFF_SHARED_IDS + 4 * slot)
                .store(id as u32, SCALAR);
        }
        self.region
            .atomic_u32(OFF_N_SHARED)
            .store(ids.len() as u32, SCALAR);
        Ok(())
    }

    /// Reads the target id list published for the current collective step.
    pub fn shared_ids(&self) -> Vec<usize> {
        let n = self.region.atomic_u32(OFF_N_SHARED).load(SCALAR) as usize;
        (0..n.min(MAX_COLLECTIVE_TARGETS))
            .map(|slot| self.region.atomic_u32(OFF_SHARED_IDS + 4 * slot).load(SCALAR) as usize)
            .collect()
    }
}

/// Setup-time key/value store: serialized once by the master, read once by
/// each worker after the distribute barrier.
pub struct SetupStore {
    path: PathBuf,
}

impl SetupStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn write<T: Serialize>(&self, value: &T) -> Result<(), SyncError> {
        let file = std::fs::File::create(&self.path)?;
        serde_json::to_writer(file, value).map_err(|e| SyncError::Codec(e.to_string()))
    }

    pub fn read<T: DeserializeOwned>(&self) -> Result<T, SyncError> {
        let file = std::fs::File::open(&self.path)?;
        serde_json::from_reader(file).map_err(|e| SyncError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_round_trip_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fabric.seg");
        let master = SyncFabric::create(&path, 4).unwrap();
        let worker = SyncFabric::open(&path).unwrap();

        assert_eq!(worker.n_ranks(), 4);
        assert!(!worker.quit());
        assert!(!worker.distributed());

        master.set_exec_kind(ExecKind::DeviceCollective);
        master.set_func_id(3);
        master.set_comm_kind(2);
        master.set_comm_op(1);
        master.set_shared_ids(&[5, 9]).unwrap();
        master.set_distributed();

        assert_eq!(worker.exec_kind(), Some(ExecKind::DeviceCollective));
        assert_eq!(worker.func_id(), 3);
        assert_eq!(worker.comm_kind(), 2);
        assert_eq!(worker.comm_op(), 1);
        assert_eq!(worker.shared_ids(), vec![5, 9]);
        assert!(worker.distributed());
    }

    #[test]
    fn open_rejects_foreign_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.seg");
        SharedRegion::create(&path, FABRIC_LEN).unwrap();
        assert!(matches!(
            SyncFabric::open(&path),
            Err(SyncError::BadMagic { .. })
        ));
    }

    #[test]
    fn target_capacity_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fabric.seg");
        let fabric = SyncFabric::create(&path, 2).unwrap();
        let too_many: Vec<usize> = (0..MAX_COLLECTIVE_TARGETS + 1).collect();
        assert!(fabric.set_shared_ids(&too_many).is_err());
    }
}
