//! # lockstep
//!
//! Data-parallel coordination of compiled tensor functions across worker
//! processes sharing one host.
//!
//! One process is the master: it forks `n_gpu - 1` workers, registers
//! functions against an external compute engine, ships the compiled set to
//! every worker, and from then on drives the group through a barrier-paced
//! protocol — every call and every collective is one lock-step cycle in
//! which all processes participate exactly once.
//!
//! ## What lives where
//!
//! * [`Coordinator`] — the master-side context: lifecycle
//!   (fork → distribute → close), registries, the call path and the
//!   collective dispatcher.
//! * [`sync`] — the shared-memory fabric: barriers, control scalars, the
//!   setup store.
//! * Input batches travel through tagged shared-memory buffers with a
//!   reuse-over-reallocate policy, so a large batch crosses the process
//!   boundary zero times ([`Coordinator::input_slab`] makes it literally
//!   zero-copy).
//! * [`engine`] — the seam to the numerical engine ([`ComputeEngine`]),
//!   with a host reference implementation ([`HostEngine`]).
//! * [`comm`] — the seam to the collective transport ([`comm::DeviceComm`]),
//!   with a shared-memory implementation.
//!
//! ## Example
//!
//! ```no_run
//! use lockstep::{Coordinator, ForkOptions, FunctionDef, Args, HostTensor, Dtype};
//! use lockstep::engine::host::{HostEngine, HostExpr, HostProgram};
//!
//! # fn main() -> lockstep::Result<()> {
//! let mut coord = Coordinator::fork(
//!     || HostEngine::new(4),
//!     ForkOptions::default().n_gpu(4),
//! )?;
//! let x = coord.input("x", Dtype::F32)?;
//! let f = coord.function(
//!     FunctionDef::new(HostProgram::outputs(vec![HostExpr::SumRows(0)])).inputs(&[&x]),
//! )?;
//! coord.distribute()?;
//!
//! let batch = HostTensor::from_vec(vec![1.0f32; 101], &[101])?;
//! let mean_of_device_sums = coord.call(&f, Args::new().arg(&batch))?;
//! # let _ = mean_of_device_sums;
//! coord.close()?;
//! # Ok(())
//! # }
//! ```

pub mod collective;
pub mod comm;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod function;
pub mod partition;
pub mod sync;
pub mod tensor;

mod dispatch;
mod inputs;
mod paths;
mod shared;
mod worker;

pub use collective::{CollectiveKind, ReduceKind, ReduceOp};
pub use coordinator::{Coordinator, ForkOptions, FunctionDef, Targets};
pub use engine::host::HostEngine;
pub use engine::ComputeEngine;
pub use error::{Error, Result};
pub use function::{Args, CollectMode, CollectSpec, Function, FunctionState, ReduceSpec};
pub use inputs::{InputVar, SlabSlice, SlabToken};
pub use shared::SharedVar;
pub use tensor::{Dtype, Elem, HostTensor, TensorData};
