//! The worker executive.
//!
//! Forked before anything is registered, a worker knows nothing until the
//! distribute barrier opens: then it loads the module blob, reads the setup
//! store, joins the communicator clique, and enters the exec loop. Every
//! iteration mirrors one master-side step — same barriers, same collective
//! primitives in the same order — which is the whole correctness argument:
//! the group moves in lock step or not at all.
//!
//! The idle `exec_in` wait is unbounded (the master may sit between calls
//! for arbitrarily long); every other wait uses the configured timeout.

use crate::collective::{CollectiveKind, ReduceKind, SCATTER_CODE};
use crate::comm::shmem::ShmemComm;
use crate::comm::DeviceComm;
use crate::coordinator::SetupManifest;
use crate::dispatch::DispatchTable;
use crate::engine::{ComputeEngine, InputView};
use crate::function::CollectMode;
use crate::inputs::{read_header, DATA_OFFSET};
use crate::paths::RunPaths;
use crate::sync::{ExecKind, SetupStore, SharedRegion, SyncFabric};
use crate::tensor::{Dtype, HostTensor, TensorData};
use crate::{Error, Result};
use std::path::Path;
use std::time::Duration;
use tracing::error;

/// Worker entry point, called in the forked child. Never unwinds: panics
/// and errors turn into a nonzero exit code for the master's reaper.
pub(crate) fn run<E, F>(
    rank: usize,
    n_ranks: usize,
    master_rank: usize,
    run_root: &Path,
    factory: &F,
    timeout: Option<Duration>,
) -> i32
where
    E: ComputeEngine,
    F: Fn() -> E + Sync,
{
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        // The global rayon pool does not survive a fork: its threads exist
        // only in the parent. All engine execution runs inside a pool built
        // on this side of the fork.
        let pool = rayon::ThreadPoolBuilder::new()
            .build()
            .map_err(|e| Error::Engine(format!("worker thread pool: {e}")))?;
        pool.install(|| exec(rank, n_ranks, master_rank, run_root, factory, timeout))
    }));
    match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            error!(rank, %err, "worker failed");
            eprintln!("lockstep worker {rank}: {err}");
            1
        }
        Err(_) => {
            eprintln!("lockstep worker {rank}: panicked");
            2
        }
    }
}

fn exec<E, F>(
    rank: usize,
    n_ranks: usize,
    master_rank: usize,
    run_root: &Path,
    factory: &F,
    timeout: Option<Duration>,
) -> Result<()>
where
    E: ComputeEngine,
    F: Fn() -> E + Sync,
{
    let paths = RunPaths::new(run_root);
    let fabric = SyncFabric::open(&paths.fabric())?;
    let mut engine = factory();
    engine.bind_device(rank)?;

    // Park until the master distributes, or tears a failed group down.
    fabric.distribute_barrier().wait(None)?;
    if !fabric.distributed() {
        return Ok(());
    }

    let module = std::fs::read(paths.module())?;
    engine.import_module(&module)?;
    engine.set_average_factor(1.0 / n_ranks as f64)?;
    let setup: SetupManifest = SetupStore::new(paths.setup()).read()?;
    let comm = ShmemComm::join(Path::new(&setup.comm_token), n_ranks, rank, timeout)?;
    let dispatch = DispatchTable::open(&paths.dispatch())?;

    let n_inputs = setup.inputs.len();
    let n_shareds = setup.shareds.len();
    let mut executive = Executive {
        rank,
        master_rank,
        paths,
        setup,
        dispatch,
        comm,
        engine,
        buffers: (0..n_inputs).map(|_| None).collect(),
        mirrors: (0..n_shareds).map(|_| None).collect(),
    };

    loop {
        fabric.exec_in().wait(None)?;
        if fabric.quit() {
            return Ok(());
        }
        match fabric.exec_kind() {
            Some(ExecKind::Function) => executive.step_function(fabric.func_id())?,
            Some(ExecKind::DeviceCollective) => executive.step_collective(&fabric)?,
            Some(ExecKind::HostCollective) => executive.step_scatter(&fabric)?,
            None => return Err(Error::Engine("unrecognized exec type published".into())),
        }
        fabric.exec_out().wait(timeout)?;
    }
}

/// This worker's mapping of one input buffer generation.
struct WorkerBuffer {
    tag: u64,
    region: SharedRegion,
    dtype: Dtype,
    tail: Vec<usize>,
    capacity_rows: usize,
}

struct Executive<E: ComputeEngine> {
    rank: usize,
    master_rank: usize,
    paths: RunPaths,
    setup: SetupManifest,
    dispatch: DispatchTable,
    comm: ShmemComm,
    engine: E,
    buffers: Vec<Option<WorkerBuffer>>,
    mirrors: Vec<Option<SharedRegion>>,
}

impl<E: ComputeEngine> Executive<E> {
    /// Remaps any input whose buffer generation moved since the last call.
    fn refresh_buffer(&mut self, input_id: usize, tag: u64) -> Result<()> {
        let stale = match &self.buffers[input_id] {
            Some(buf) => buf.tag != tag,
            None => true,
        };
        if stale {
            let region = SharedRegion::open(&self.paths.input_buffer(input_id, tag))?;
            let header = read_header(&region)?;
            self.buffers[input_id] = Some(WorkerBuffer {
                tag,
                region,
                dtype: header.dtype,
                tail: header.dims[1..].to_vec(),
                capacity_rows: header.capacity_rows(),
            });
        }
        Ok(())
    }

    fn step_function(&mut self, func_id: usize) -> Result<()> {
        let manifest = self
            .setup
            .functions
            .get(func_id)
            .ok_or_else(|| Error::Engine(format!("unknown function id {func_id} published")))?;
        let artifact = manifest.artifact;
        let input_ids = manifest.input_ids.clone();
        let scatter = manifest.scatter.clone();
        let collect = manifest.collect.clone();
        let reduce_ops = manifest.reduce_ops.clone();
        let range = self.dispatch.assign_range(func_id, self.rank);

        for &input_id in &input_ids {
            let (tag, _) = self.dispatch.input(input_id);
            self.refresh_buffer(input_id, tag)?;
        }

        let mut views = Vec::with_capacity(input_ids.len());
        for (i, &input_id) in input_ids.iter().enumerate() {
            let (_, rows) = self.dispatch.input(input_id);
            let buf = match &self.buffers[input_id] {
                Some(buf) => buf,
                None => return Err(Error::Engine(format!("input {input_id} never mapped"))),
            };
            let (start, count) = if scatter[i] {
                (range.start, range.len())
            } else {
                (0, rows)
            };
            if start + count > buf.capacity_rows {
                return Err(Error::Engine(format!(
                    "input {input_id} publishes {} rows beyond its {}-row buffer",
                    start + count,
                    buf.capacity_rows
                )));
            }
            let row_bytes: usize = buf.tail.iter().product::<usize>() * buf.dtype.size_of();
            let mut shape = vec![count];
            shape.extend_from_slice(&buf.tail);
            views.push(InputView {
                dtype: buf.dtype,
                shape,
                bytes: buf
                    .region
                    .bytes(DATA_OFFSET + start * row_bytes, count * row_bytes),
            });
        }

        let mut results = self.engine.execute(artifact, &views)?;
        drop(views);

        // Participate in the collection step for every output; the results
        // themselves stay with the master.
        for (j, mode) in collect.iter().enumerate() {
            match mode {
                CollectMode::Reduce => {
                    let kind = reduce_ops
                        .get(j)
                        .copied()
                        .flatten()
                        .ok_or_else(|| Error::Engine("reduce output without an op".into()))?;
                    let (op, _) = kind.resolve();
                    self.comm
                        .reduce(results[j].data_mut(), op, self.master_rank)?;
                }
                CollectMode::Gather => {
                    let _ = self.comm.all_gather(results[j].data())?;
                }
                CollectMode::None => {}
            }
        }
        Ok(())
    }

    fn step_collective(&mut self, fabric: &SyncFabric) -> Result<()> {
        let code = fabric.comm_kind();
        let kind = CollectiveKind::from_code(code)
            .ok_or_else(|| Error::Engine(format!("unknown collective code {code}")))?;
        let op = ReduceKind::from_code(fabric.comm_op());
        for id in fabric.shared_ids() {
            match kind {
                CollectiveKind::Broadcast => {
                    let data = self.engine.shared_data_mut(id)?;
                    self.comm.broadcast(data, self.master_rank)?;
                }
                CollectiveKind::Reduce => {
                    let (rop, _) = op
                        .ok_or_else(|| Error::Engine("reduce collective without an op".into()))?
                        .resolve();
                    let data = self.engine.shared_data_mut(id)?;
                    self.comm.reduce(data, rop, self.master_rank)?;
                }
                CollectiveKind::AllReduce => {
                    let (rop, avg) = op
                        .ok_or_else(|| Error::Engine("reduce collective without an op".into()))?
                        .resolve();
                    {
                        let data = self.engine.shared_data_mut(id)?;
                        self.comm.all_reduce(data, rop)?;
                    }
                    if avg {
                        let averager = self.averager_for(id)?;
                        self.engine.apply_averager(averager, None)?;
                    }
                }
                CollectiveKind::AllGather => {
                    let data: &TensorData = self.engine.shared_data_mut(id)?;
                    let _ = self.comm.all_gather(data)?;
                }
            }
        }
        Ok(())
    }

    fn averager_for(&self, id: usize) -> Result<usize> {
        let meta = self
            .setup
            .shareds
            .get(id)
            .ok_or_else(|| Error::Engine(format!("unknown shared id {id} published")))?;
        if meta.averager == usize::MAX {
            return Err(Error::Engine(format!(
                "shared {id} has no averaging artifact"
            )));
        }
        Ok(meta.averager)
    }

    fn step_scatter(&mut self, fabric: &SyncFabric) -> Result<()> {
        if fabric.comm_kind() != SCATTER_CODE {
            return Err(Error::Engine(format!(
                "unknown host-collective code {}",
                fabric.comm_kind()
            )));
        }
        let id = fabric
            .shared_ids()
            .first()
            .copied()
            .ok_or_else(|| Error::Engine("scatter published no target".into()))?;
        let meta = self
            .setup
            .shareds
            .get(id)
            .ok_or_else(|| Error::Engine(format!("unknown shared id {id} published")))?;
        let nbytes: usize = meta.shape.iter().product::<usize>() * meta.dtype.size_of();

        if self.mirrors[id].is_none() {
            // The master allocated the mirror before releasing exec_in.
            self.mirrors[id] = Some(SharedRegion::open(&self.paths.mirror(id))?);
        }
        let mirror = match &self.mirrors[id] {
            Some(mirror) => mirror,
            None => return Err(Error::Engine("scatter mirror not mapped".into())),
        };
        let bytes = mirror.bytes(self.rank * nbytes, nbytes);
        let data = TensorData::from_bytes(meta.dtype, bytes)?;
        let value = HostTensor::new(data, meta.shape.clone())?;
        self.engine.load_shared(id, &value)?;
        Ok(())
    }
}
