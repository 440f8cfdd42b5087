//! The device-communicator seam.
//!
//! Collectives are dispatched through [`DeviceComm`], the transport
//! abstraction the coordination core calls one primitive at a time between
//! `exec_in` and `exec_out`. Every rank must invoke the same primitive in
//! the same order — the fabric's lock-step discipline is what makes the
//! transport this simple. The in-crate implementation
//! ([`shmem::ShmemComm`]) moves bytes through a shared scratch segment; an
//! accelerator deployment would put its native collective library behind
//! the same trait.

pub mod shmem;

use crate::collective::ReduceOp;
use crate::tensor::TensorData;
use crate::Result;

pub trait DeviceComm {
    /// This process's rank in the clique.
    fn rank(&self) -> usize;

    /// Total number of ranks in the clique.
    fn world_size(&self) -> usize;

    /// Overwrites every rank's `data` with the root's.
    fn broadcast(&mut self, data: &mut TensorData, root: usize) -> Result<()>;

    /// Reduces elementwise into the root's `data`; other ranks' tensors are
    /// left untouched.
    fn reduce(&mut self, data: &mut TensorData, op: ReduceOp, root: usize) -> Result<()>;

    /// Reduces elementwise into every rank's `data`.
    fn all_reduce(&mut self, data: &mut TensorData, op: ReduceOp) -> Result<()>;

    /// Returns every rank's contribution, in rank order, on every rank.
    fn all_gather(&mut self, data: &TensorData) -> Result<Vec<TensorData>>;
}
