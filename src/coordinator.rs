//! The master-side coordination engine.
//!
//! A [`Coordinator`] owns every piece of process-wide state for one group:
//! lifecycle flags, the registries, the fabric, the worker pids and the
//! communicator. It is an explicit context object — two coordinators in one
//! program are two independent groups — and it walks one state machine:
//!
//! ```text
//! fork() → Forked → distribute() → Distributed → close() → Closed
//!                        │ (never distributed)                ▲
//!                        └────────────── close() ─────────────┘
//! ```
//!
//! Registration (`shared`, `input`, `function`) happens in `Forked`; calls
//! and collectives in `Distributed`. Every validation failure is raised
//! before any barrier is released, so a rejected call never desynchronizes
//! the group.

use crate::collective::{CollectiveKind, ReduceKind, SCATTER_CODE};
use crate::comm::shmem::ShmemComm;
use crate::comm::DeviceComm;
use crate::dispatch::DispatchTable;
use crate::engine::{ComputeEngine, InputView};
use crate::function::{
    check_collect, check_inputs_scatter, order_args, ArgValue, Args, CollectMode, CollectSpec,
    Function, FunctionRecord, FunctionState, OutputSpec, ReduceSpec,
};
use crate::inputs::{InputRegistry, InputVar, SlabSlice, SlabToken};
use crate::partition::assign_indices;
use crate::paths::RunPaths;
use crate::shared::{SharedRegistry, SharedVar};
use crate::sync::{ExecKind, SetupStore, SharedRegion, SyncFabric};
use crate::tensor::{Dtype, HostTensor};
use crate::worker;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Options for [`Coordinator::fork`].
#[derive(Clone, Debug)]
pub struct ForkOptions {
    /// Device (and process) count. Omitted: probed from the engine in an
    /// isolated child process.
    pub n_gpu: Option<usize>,
    /// Which rank the master occupies.
    pub master_rank: usize,
    /// Bound on master-side barrier waits; `None` waits forever. A bounded
    /// wait that elapses means a worker died or hung — the group is not
    /// recoverable past that point.
    pub barrier_timeout: Option<Duration>,
}

impl Default for ForkOptions {
    fn default() -> Self {
        Self {
            n_gpu: None,
            master_rank: 0,
            barrier_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl ForkOptions {
    pub fn n_gpu(mut self, n: usize) -> Self {
        self.n_gpu = Some(n);
        self
    }

    pub fn master_rank(mut self, rank: usize) -> Self {
        self.master_rank = rank;
        self
    }

    pub fn barrier_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.barrier_timeout = timeout;
        self
    }
}

/// Declaration of one coordinated function.
pub struct FunctionDef<P> {
    pub(crate) program: P,
    pub(crate) name: Option<String>,
    pub(crate) inputs: Vec<InputVar>,
    pub(crate) shared: Vec<SharedVar>,
    pub(crate) collect_modes: CollectSpec,
    pub(crate) reduce_ops: ReduceSpec,
    pub(crate) broadcast_inputs: Option<Vec<InputVar>>,
    pub(crate) scatter_inputs: Option<Vec<InputVar>>,
}

impl<P> FunctionDef<P> {
    pub fn new(program: P) -> Self {
        Self {
            program,
            name: None,
            inputs: Vec::new(),
            shared: Vec::new(),
            collect_modes: CollectSpec::default(),
            reduce_ops: ReduceSpec::default(),
            broadcast_inputs: None,
            scatter_inputs: None,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn inputs(mut self, inputs: &[&InputVar]) -> Self {
        self.inputs = inputs.iter().map(|v| (*v).clone()).collect();
        self
    }

    /// Shared-state entries this function reads or writes.
    pub fn shared(mut self, shared: &[&SharedVar]) -> Self {
        self.shared = shared.iter().map(|v| (*v).clone()).collect();
        self
    }

    pub fn collect_modes(mut self, modes: CollectSpec) -> Self {
        self.collect_modes = modes;
        self
    }

    pub fn reduce_ops(mut self, ops: ReduceSpec) -> Self {
        self.reduce_ops = ops;
        self
    }

    /// Inputs replicated whole to every device (everything else scatters).
    pub fn broadcast_inputs(mut self, inputs: &[&InputVar]) -> Self {
        self.broadcast_inputs = Some(inputs.iter().map(|v| (*v).clone()).collect());
        self
    }

    /// Inputs split across devices (everything else broadcasts).
    pub fn scatter_inputs(mut self, inputs: &[&InputVar]) -> Self {
        self.scatter_inputs = Some(inputs.iter().map(|v| (*v).clone()).collect());
        self
    }
}

/// Shared-state targets for a collective: explicit functions and/or
/// variables, or (empty) every registered entry.
#[derive(Clone, Debug, Default)]
pub struct Targets {
    functions: Vec<usize>,
    ids: Vec<usize>,
    names: Vec<String>,
}

impl Targets {
    /// Every registered shared-state entry (the default).
    pub fn all() -> Self {
        Self::default()
    }

    /// The shared entries a function reads or writes.
    pub fn function(mut self, function: &Function) -> Self {
        self.functions.push(function.id);
        self
    }

    pub fn shared(mut self, var: &SharedVar) -> Self {
        self.ids.push(var.id);
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.names.push(name.to_string());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LifecycleState {
    Forked,
    Distributed,
    Closed,
}

// --- worker-facing manifests (the setup key/value store) ---

#[derive(Serialize, Deserialize)]
pub(crate) struct FunctionManifest {
    pub name: Option<String>,
    pub artifact: usize,
    pub input_ids: Vec<usize>,
    pub scatter: Vec<bool>,
    pub collect: Vec<CollectMode>,
    /// Worker-resolved: `Avg` is shipped as `Sum`; only the master applies
    /// the averaging artifact to reduced outputs.
    pub reduce_ops: Vec<Option<ReduceKind>>,
    pub shared_ids: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct InputManifest {
    pub name: String,
    pub dtype: Dtype,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct SharedManifest {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub averager: usize,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct SetupManifest {
    pub comm_token: String,
    pub functions: Vec<FunctionManifest>,
    pub inputs: Vec<InputManifest>,
    pub shareds: Vec<SharedManifest>,
}

/// The master-side coordination context.
pub struct Coordinator<E: ComputeEngine> {
    engine: E,
    state: LifecycleState,
    n_ranks: usize,
    master_rank: usize,
    timeout: Option<Duration>,
    // Keeps the run directory alive for the group's lifetime.
    _run_dir: tempfile::TempDir,
    paths: RunPaths,
    fabric: SyncFabric,
    workers: Vec<libc::pid_t>,
    inputs: InputRegistry,
    shareds: SharedRegistry,
    functions: Vec<FunctionRecord>,
    dispatch: Option<DispatchTable>,
    comm: Option<ShmemComm>,
}

impl<E: ComputeEngine> Coordinator<E> {
    /// Forks the worker group.
    ///
    /// Spawns `n_gpu - 1` worker processes, each bound to its own device
    /// and parked on the distribute barrier; the master binds
    /// `master_rank`. Workers inherit nothing registered later — they
    /// receive the compiled set at [`Coordinator::distribute`] time.
    ///
    /// `factory` builds the process-local engine; it runs once in the
    /// master and once inside each forked worker.
    pub fn fork<F>(factory: F, opts: ForkOptions) -> Result<Self>
    where
        F: Fn() -> E + Sync,
    {
        let n_ranks = match opts.n_gpu {
            Some(0) => return Err(Error::Config("cannot fork a group of zero devices".into())),
            Some(n) => n,
            None => probe_device_count(&factory)?,
        };
        if n_ranks == 1 {
            warn!("single-device group: no workers will be forked");
        }
        if opts.master_rank >= n_ranks {
            return Err(Error::Config(format!(
                "master rank {} out of range for {} devices",
                opts.master_rank, n_ranks
            )));
        }

        let run_dir = tempfile::Builder::new().prefix("lockstep-").tempdir()?;
        let paths = RunPaths::new(run_dir.path());
        let fabric = SyncFabric::create(&paths.fabric(), n_ranks)?;

        info!(n_ranks, master_rank = opts.master_rank, "forking worker group");
        let mut workers = Vec::with_capacity(n_ranks.saturating_sub(1));
        for rank in (0..n_ranks).filter(|&r| r != opts.master_rank) {
            // SAFETY: the child never returns from this arm — it runs the
            // worker executive and `_exit`s, so no destructor or unwinding
            // crosses the fork boundary.
            match unsafe { libc::fork() } {
                -1 => {
                    let err = std::io::Error::last_os_error();
                    kill_processes(&workers);
                    reap_processes(&workers);
                    return Err(err.into());
                }
                0 => {
                    let code = worker::run(
                        rank,
                        n_ranks,
                        opts.master_rank,
                        run_dir.path(),
                        &factory,
                        opts.barrier_timeout,
                    );
                    unsafe { libc::_exit(code) }
                }
                pid => workers.push(pid),
            }
        }

        let mut engine = factory();
        engine.bind_device(opts.master_rank)?;

        Ok(Self {
            engine,
            state: LifecycleState::Forked,
            n_ranks,
            master_rank: opts.master_rank,
            timeout: opts.barrier_timeout,
            _run_dir: run_dir,
            paths,
            fabric,
            workers,
            inputs: InputRegistry::default(),
            shareds: SharedRegistry::default(),
            functions: Vec::new(),
            dispatch: None,
            comm: None,
        })
    }

    pub fn world_size(&self) -> usize {
        self.n_ranks
    }

    pub fn master_rank(&self) -> usize {
        self.master_rank
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    fn require_forked(&self, what: &str) -> Result<()> {
        match self.state {
            LifecycleState::Forked => Ok(()),
            LifecycleState::Distributed => Err(Error::Lifecycle(format!(
                "cannot {what} after distribution"
            ))),
            LifecycleState::Closed => Err(Error::Lifecycle(format!("cannot {what}: group is closed"))),
        }
    }

    fn require_distributed(&self, what: &str) -> Result<()> {
        match self.state {
            LifecycleState::Distributed => Ok(()),
            LifecycleState::Forked => Err(Error::Lifecycle(format!(
                "cannot {what} before distribute()"
            ))),
            LifecycleState::Closed => Err(Error::Lifecycle(format!("cannot {what}: group is closed"))),
        }
    }

    /// Registers a shared-state entry, seeding every replica with `init` at
    /// distribution time.
    pub fn shared(&mut self, name: &str, init: HostTensor) -> Result<SharedVar> {
        self.require_forked("register shared state")?;
        let var = self
            .shareds
            .register(name, init.dtype(), init.shape().to_vec())?;
        let engine_id = self.engine.register_shared(name, init)?;
        if engine_id != var.id {
            return Err(Error::Engine(format!(
                "engine assigned shared id {engine_id}, registry expected {}",
                var.id
            )));
        }
        Ok(var)
    }

    /// Registers a named input of fixed dtype.
    pub fn input(&mut self, name: &str, dtype: Dtype) -> Result<InputVar> {
        self.require_forked("register inputs")?;
        self.inputs.register(name, dtype)
    }

    /// Compiles and registers a coordinated function. Ids are dense, in
    /// registration order.
    pub fn function(&mut self, def: FunctionDef<E::Program>) -> Result<Function> {
        self.require_forked("register functions")?;
        let scatter = check_inputs_scatter(
            &def.inputs,
            def.broadcast_inputs.as_deref(),
            def.scatter_inputs.as_deref(),
        )?;
        let mut shared_ids = Vec::new();
        for var in &def.shared {
            if !self.shareds.contains_id(var.id) {
                return Err(Error::Config(format!(
                    "shared variable {:?} is not registered with this coordinator",
                    var.name()
                )));
            }
            if !shared_ids.contains(&var.id) {
                shared_ids.push(var.id);
            }
        }
        let input_dtypes: Vec<Dtype> = def.inputs.iter().map(|v| v.dtype()).collect();
        let meta = self
            .engine
            .compile(&def.program, &input_dtypes, &shared_ids)?;
        let plan = check_collect(meta.output_dtypes.len(), &def.collect_modes, &def.reduce_ops)?;
        let mut outputs = Vec::with_capacity(plan.len());
        for (dtype, (mode, op)) in meta.output_dtypes.into_iter().zip(plan) {
            let averager = match op {
                Some(ReduceKind::Avg) => Some(self.engine.compile_value_averager(dtype)?),
                _ => None,
            };
            outputs.push(OutputSpec {
                dtype,
                mode,
                op,
                averager,
            });
        }
        let id = self.functions.len();
        self.functions.push(FunctionRecord {
            name: def.name,
            artifact: meta.artifact,
            input_ids: def.inputs.iter().map(|v| v.id()).collect(),
            input_names: def.inputs.iter().map(|v| v.name().to_string()).collect(),
            scatter,
            outputs,
            shared_ids,
            state: FunctionState::PreDistribution,
            prev_batch: None,
            my_range: 0..0,
        });
        debug!(function = id, "registered coordinated function");
        Ok(Function { id })
    }

    /// Ships the compiled set to the workers and makes every function
    /// callable. May be called at most once.
    pub fn distribute(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Forked => {}
            LifecycleState::Distributed => {
                return Err(Error::Lifecycle("distribute() may be called only once".into()))
            }
            LifecycleState::Closed => {
                return Err(Error::Lifecycle("cannot distribute: group is closed".into()))
            }
        }

        // Auxiliary averaging artifacts ride along in the same module so
        // worker-side ids line up with the master's.
        for id in 0..self.shareds.len() {
            let averager = self.engine.compile_averager(id)?;
            self.shareds.entry_mut(id).averager = Some(averager);
        }

        // The whole artifact set is serialized as one unit: that is what
        // preserves shared-state aliasing across functions on the workers.
        let module = self.engine.export_module()?;
        std::fs::write(self.paths.module(), &module)?;

        let comm = ShmemComm::create(
            &self.paths.comm_dir(),
            self.n_ranks,
            self.master_rank,
            self.timeout,
        )?;

        let manifest = SetupManifest {
            comm_token: self.paths.comm_dir().to_string_lossy().into_owned(),
            functions: self
                .functions
                .iter()
                .map(|f| FunctionManifest {
                    name: f.name.clone(),
                    artifact: f.artifact,
                    input_ids: f.input_ids.clone(),
                    scatter: f.scatter.clone(),
                    collect: f.outputs.iter().map(|o| o.mode).collect(),
                    reduce_ops: f
                        .outputs
                        .iter()
                        .map(|o| o.op.map(ReduceKind::worker_resolved))
                        .collect(),
                    shared_ids: f.shared_ids.clone(),
                })
                .collect(),
            inputs: self
                .inputs
                .names_and_dtypes()
                .into_iter()
                .map(|(name, dtype)| InputManifest { name, dtype })
                .collect(),
            shareds: (0..self.shareds.len())
                .map(|id| {
                    let entry = self.shareds.entry(id);
                    SharedManifest {
                        name: entry.name.clone(),
                        dtype: entry.dtype,
                        shape: entry.shape.clone(),
                        averager: entry.averager.unwrap_or(usize::MAX),
                    }
                })
                .collect(),
        };
        SetupStore::new(self.paths.setup()).write(&manifest)?;

        let dispatch = DispatchTable::create(
            &self.paths.dispatch(),
            self.functions.len(),
            self.inputs.len(),
            self.n_ranks,
        )?;

        self.fabric.set_distributed();
        self.fabric.distribute_barrier().wait(self.timeout)?;

        self.engine.set_average_factor(1.0 / self.n_ranks as f64)?;
        for record in &mut self.functions {
            record.state = FunctionState::Active;
        }
        self.dispatch = Some(dispatch);
        self.comm = Some(comm);
        self.state = LifecycleState::Distributed;
        info!(
            functions = self.functions.len(),
            shared = self.shareds.len(),
            "distributed compiled set to workers"
        );
        Ok(())
    }

    /// Runs a coordinated call: stages inputs, releases the group, executes
    /// the local artifact on the owned slice, and collects outputs per
    /// mode.
    pub fn call(&mut self, function: &Function, args: Args<'_>) -> Result<Vec<HostTensor>> {
        let record = self
            .functions
            .get(function.id)
            .ok_or_else(|| Error::Config(format!("unknown function id {}", function.id)))?;
        match record.state {
            FunctionState::Active => {}
            FunctionState::PreDistribution => {
                return Err(Error::Lifecycle(
                    "function is not distributed yet; call_local() runs the local artifact".into(),
                ))
            }
            FunctionState::Closed => {
                return Err(Error::Lifecycle(
                    "group is closed; call_local() runs the local artifact".into(),
                ))
            }
        }
        if args.output_subset.is_some() {
            return Err(Error::Unsupported(
                "output_subset is not supported on coordinated calls".into(),
            ));
        }
        let ordered = order_args(record, args)?;
        let artifact = record.artifact;
        let input_ids = record.input_ids.clone();
        let scatter = record.scatter.clone();
        let outputs_spec: Vec<OutputSpec> = record.outputs.clone();

        // One batch size across every scattered input.
        let mut batch: Option<usize> = None;
        for (value, &is_scatter) in ordered.iter().zip(&scatter) {
            if !is_scatter {
                continue;
            }
            let rows = value.rows();
            match batch {
                None => batch = Some(rows),
                Some(b) if b != rows => {
                    return Err(Error::Config(format!(
                        "scatter inputs of different batch sizes ({b} vs {rows})"
                    )))
                }
                Some(_) => {}
            }
        }

        let dispatch = self
            .dispatch
            .as_ref()
            .ok_or_else(|| Error::Engine("dispatch table missing after distribute".into()))?;

        // Repartition only when the batch size moved.
        let my_range = {
            let record = &mut self.functions[function.id];
            if let Some(b) = batch {
                if record.prev_batch != Some(b) {
                    let assign_idx = assign_indices(b, self.n_ranks);
                    dispatch.set_assign(function.id, &assign_idx);
                    record.my_range =
                        assign_idx[self.master_rank]..assign_idx[self.master_rank + 1];
                    record.prev_batch = Some(b);
                }
            }
            record.my_range.clone()
        };

        // Stage every input into its shared buffer.
        for (value, &input_id) in ordered.iter().zip(&input_ids) {
            match value {
                ArgValue::Data(tensor) => {
                    let tag = self.inputs.stage(&self.paths, input_id, tensor)?;
                    dispatch.set_input(input_id, tag, tensor.rows());
                }
                ArgValue::Slab(token) => {
                    if token.input_id != input_id {
                        return Err(Error::Config(
                            "slab token belongs to a different input".into(),
                        ));
                    }
                    let buf = self.inputs.buffer(input_id).ok_or_else(|| {
                        Error::Config("slab token for an input with no live buffer".into())
                    })?;
                    if buf.tag != token.tag {
                        return Err(Error::Config(
                            "stale slab token: the buffer was reallocated".into(),
                        ));
                    }
                    if token.rows > buf.capacity_rows {
                        return Err(Error::ShapeMismatch {
                            expected: vec![buf.capacity_rows],
                            got: vec![token.rows],
                        });
                    }
                    dispatch.set_input(input_id, token.tag, token.rows);
                }
            }
        }

        // Publish the step and release the group.
        self.fabric.set_exec_kind(ExecKind::Function);
        self.fabric.set_func_id(function.id);
        self.fabric.exec_in().wait(self.timeout)?;

        // Local execution on the owned slice views.
        let mut views = Vec::with_capacity(input_ids.len());
        for (i, &input_id) in input_ids.iter().enumerate() {
            let (_, rows) = dispatch.input(input_id);
            let (start, count) = if scatter[i] {
                (my_range.start, my_range.len())
            } else {
                (0, rows)
            };
            let tail = match self.inputs.buffer(input_id) {
                Some(buf) => buf.tail.clone(),
                None => return Err(Error::Engine(format!("input {input_id} has no buffer"))),
            };
            let mut shape = vec![count];
            shape.extend_from_slice(&tail);
            views.push(InputView {
                dtype: self.inputs.entry(input_id).dtype,
                shape,
                bytes: self.inputs.view_bytes(input_id, start, count)?,
            });
        }
        let results = self.engine.execute(artifact, &views)?;
        drop(views);

        // Collect per output mode.
        let master_rank = self.master_rank;
        let mut collected = Vec::with_capacity(outputs_spec.len());
        for (spec, mut result) in outputs_spec.iter().zip(results) {
            match spec.mode {
                CollectMode::Reduce => {
                    let kind = spec
                        .op
                        .ok_or_else(|| Error::Engine("reduce output without an op".into()))?;
                    let (op, avg) = kind.resolve();
                    let comm = self
                        .comm
                        .as_mut()
                        .ok_or_else(|| Error::Engine("communicator missing after distribute".into()))?;
                    comm.reduce(result.data_mut(), op, master_rank)?;
                    if avg {
                        let averager = spec
                            .averager
                            .ok_or_else(|| Error::Engine("avg output without an averager".into()))?;
                        self.engine.apply_averager(averager, Some(&mut result))?;
                    }
                    collected.push(result);
                }
                CollectMode::Gather => {
                    let comm = self
                        .comm
                        .as_mut()
                        .ok_or_else(|| Error::Engine("communicator missing after distribute".into()))?;
                    let parts = comm.all_gather(result.data())?;
                    collected.push(concat_gathered(&result, parts)?);
                }
                CollectMode::None => collected.push(result),
            }
        }

        self.fabric.exec_out().wait(self.timeout)?;
        Ok(collected)
    }

    /// Runs the local compiled artifact with no cross-device coordination.
    /// This is the only call path available before distribution and after
    /// close.
    pub fn call_local(&mut self, function: &Function, args: Args<'_>) -> Result<Vec<HostTensor>> {
        let record = self
            .functions
            .get(function.id)
            .ok_or_else(|| Error::Config(format!("unknown function id {}", function.id)))?;
        if args.output_subset.is_some() {
            return Err(Error::Unsupported(
                "output_subset is not supported on local calls".into(),
            ));
        }
        let ordered = order_args(record, args)?;
        let artifact = record.artifact;
        let mut views = Vec::with_capacity(ordered.len());
        for value in &ordered {
            match value {
                ArgValue::Data(tensor) => views.push(InputView::of(tensor)),
                ArgValue::Slab(_) => {
                    return Err(Error::Config(
                        "slab tokens require the coordinated call path".into(),
                    ))
                }
            }
        }
        self.engine.execute(artifact, &views)
    }

    /// A writable view of an input's shared buffer: fill it in place, then
    /// call with [`Args::slab`] to skip the staging copy.
    pub fn input_slab(&mut self, var: &InputVar, shape: &[usize]) -> Result<SlabSlice<'_>> {
        if self.state == LifecycleState::Closed {
            return Err(Error::Lifecycle("cannot stage inputs: group is closed".into()));
        }
        let rows = match shape.first() {
            Some(&rows) => rows,
            None => return Err(Error::Config("slab shape needs a batch axis".into())),
        };
        let tail = &shape[1..];
        self.inputs.ensure_buffer(&self.paths, var.id(), tail, rows)?;
        let dtype = self.inputs.entry(var.id()).dtype;
        let buf = self
            .inputs
            .buffer(var.id())
            .ok_or_else(|| Error::Engine("buffer missing after ensure".into()))?;
        Ok(SlabSlice {
            token: SlabToken {
                input_id: var.id(),
                tag: buf.tag,
                rows,
            },
            region: &buf.region,
            dtype,
            row_width: buf.row_width(),
        })
    }

    fn resolve_targets(&self, targets: &Targets) -> Result<Vec<usize>> {
        let mut ids: Vec<usize> =
            if targets.functions.is_empty() && targets.ids.is_empty() && targets.names.is_empty() {
                (0..self.shareds.len()).collect()
            } else {
                let mut ids = Vec::new();
                for &fid in &targets.functions {
                    let record = self
                        .functions
                        .get(fid)
                        .ok_or_else(|| Error::Config(format!("unknown function id {fid}")))?;
                    ids.extend_from_slice(&record.shared_ids);
                }
                for &id in &targets.ids {
                    if !self.shareds.contains_id(id) {
                        return Err(Error::Config(format!("unknown shared id {id}")));
                    }
                    ids.push(id);
                }
                for name in &targets.names {
                    let id = self.shareds.find(name).ok_or_else(|| {
                        Error::Config(format!("unrecognized shared variable name {name:?}"))
                    })?;
                    ids.push(id);
                }
                ids
            };
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// The shared collective template: publish, release, run the device
    /// primitive once per target, rendezvous, return per-target results.
    fn collective(
        &mut self,
        kind: CollectiveKind,
        targets: &Targets,
        op: Option<ReduceKind>,
    ) -> Result<Vec<HostTensor>> {
        self.require_distributed("run collectives")?;
        let def = kind.def();
        if def.requires_op && op.is_none() {
            return Err(Error::Config(format!("{kind:?} requires a reduce op")));
        }
        let ids = self.resolve_targets(targets)?;
        debug!(?kind, targets = ids.len(), "dispatching collective");

        self.fabric.set_exec_kind(ExecKind::DeviceCollective);
        self.fabric.set_comm_kind(def.kind.code());
        self.fabric
            .set_comm_op(op.map(ReduceKind::code).unwrap_or(0));
        self.fabric.set_shared_ids(&ids)?;
        self.fabric.exec_in().wait(self.timeout)?;

        let mut results = Vec::with_capacity(ids.len());
        for &id in &ids {
            results.push(self.master_primitive(kind, id, op)?);
        }

        self.fabric.exec_out().wait(self.timeout)?;
        Ok(results)
    }

    fn master_primitive(
        &mut self,
        kind: CollectiveKind,
        id: usize,
        op: Option<ReduceKind>,
    ) -> Result<HostTensor> {
        let master_rank = self.master_rank;
        let missing_comm = || Error::Engine("communicator missing after distribute".into());
        match kind {
            CollectiveKind::Broadcast => {
                // Split borrow: transport and engine are disjoint fields.
                let comm = self.comm.as_mut().ok_or_else(missing_comm)?;
                let data = self.engine.shared_data_mut(id)?;
                comm.broadcast(data, master_rank)?;
                self.engine.shared_value(id)
            }
            CollectiveKind::Reduce | CollectiveKind::AllReduce => {
                let (rop, avg) = op
                    .ok_or_else(|| Error::Engine("reduce collective without an op".into()))?
                    .resolve();
                {
                    let comm = self.comm.as_mut().ok_or_else(missing_comm)?;
                    let data = self.engine.shared_data_mut(id)?;
                    if kind == CollectiveKind::Reduce {
                        comm.reduce(data, rop, master_rank)?;
                    } else {
                        comm.all_reduce(data, rop)?;
                    }
                }
                if avg {
                    let averager = self.shareds.entry(id).averager.ok_or_else(|| {
                        Error::Engine(format!("shared {id} has no averaging artifact"))
                    })?;
                    self.engine.apply_averager(averager, None)?;
                }
                self.engine.shared_value(id)
            }
            CollectiveKind::AllGather => {
                let template = self.engine.shared_value(id)?;
                let comm = self.comm.as_mut().ok_or_else(missing_comm)?;
                let data = self.engine.shared_data_mut(id)?;
                let parts = comm.all_gather(data)?;
                concat_gathered(&template, parts)
            }
        }
    }

    /// Broadcasts the master's replica of each target to every device.
    pub fn broadcast(&mut self, targets: &Targets) -> Result<Vec<HostTensor>> {
        self.collective(CollectiveKind::Broadcast, targets, None)
    }

    /// Reduces each target onto the master's replica.
    pub fn reduce(&mut self, targets: &Targets, op: ReduceKind) -> Result<Vec<HostTensor>> {
        self.collective(CollectiveKind::Reduce, targets, Some(op))
    }

    /// Reduces each target onto every device's replica.
    pub fn all_reduce(&mut self, targets: &Targets, op: ReduceKind) -> Result<Vec<HostTensor>> {
        self.collective(CollectiveKind::AllReduce, targets, Some(op))
    }

    /// Gathers each target's replicas, concatenated along axis 0 in rank
    /// order. Replicas are left untouched (gather never mutates in place).
    pub fn all_gather(&mut self, targets: &Targets) -> Result<Vec<HostTensor>> {
        self.collective(CollectiveKind::AllGather, targets, None)
    }

    /// Writes one source array per device into that device's replica of
    /// `var`: the master's share lands directly on its device, every other
    /// share goes through the worker's shared-memory mirror.
    pub fn scatter(&mut self, var: &SharedVar, sources: &[HostTensor]) -> Result<()> {
        self.scatter_id(var.id, sources)
    }

    /// [`Coordinator::scatter`] addressed by shared-variable name.
    pub fn scatter_named(&mut self, name: &str, sources: &[HostTensor]) -> Result<()> {
        let id = self
            .shareds
            .find(name)
            .ok_or_else(|| Error::Config(format!("unrecognized shared variable name {name:?}")))?;
        self.scatter_id(id, sources)
    }

    fn scatter_id(&mut self, id: usize, sources: &[HostTensor]) -> Result<()> {
        self.require_distributed("scatter")?;
        if !self.shareds.contains_id(id) {
            return Err(Error::Config(format!("unknown shared id {id}")));
        }
        // Everything is validated before the fabric is touched.
        if sources.len() != self.n_ranks {
            return Err(Error::ShapeMismatch {
                expected: vec![self.n_ranks],
                got: vec![sources.len()],
            });
        }
        let (shape, dtype, nbytes) = {
            let entry = self.shareds.entry(id);
            (entry.shape.clone(), entry.dtype, entry.nbytes())
        };
        for source in sources {
            if source.dtype() != dtype {
                return Err(Error::DtypeMismatch {
                    expected: dtype,
                    got: source.dtype(),
                });
            }
            if source.shape() != shape.as_slice() {
                return Err(Error::ShapeMismatch {
                    expected: shape.clone(),
                    got: source.shape().to_vec(),
                });
            }
        }

        let mirror = self.shareds.ensure_mirror(&self.paths, id, self.n_ranks)?;
        for (rank, source) in sources.iter().enumerate() {
            if rank != self.master_rank {
                mirror.write_bytes(rank * nbytes, source.data().as_bytes());
            }
        }
        self.engine.load_shared(id, &sources[self.master_rank])?;

        self.fabric.set_exec_kind(ExecKind::HostCollective);
        self.fabric.set_comm_kind(SCATTER_CODE);
        // Only one slot is ever published: scatter is single-target by
        // construction.
        self.fabric.set_shared_ids(&[id])?;
        self.fabric.exec_in().wait(self.timeout)?;
        self.fabric.exec_out().wait(self.timeout)?;
        Ok(())
    }

    /// Host copy of a shared replica's current master-side value.
    pub fn shared_value(&self, var: &SharedVar) -> Result<HostTensor> {
        self.engine.shared_value(var.id)
    }

    /// Tears the group down. Idempotent: the second and later calls are
    /// no-ops.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Closed => Ok(()),
            LifecycleState::Forked => {
                // Distribution never completed: release the workers through
                // the distribute barrier so they observe the failure and
                // exit.
                info!("closing never-distributed group");
                let waited = self.fabric.distribute_barrier().wait(self.timeout);
                if waited.is_err() {
                    kill_processes(&self.workers);
                }
                reap_processes(&self.workers);
                self.workers.clear();
                self.state = LifecycleState::Closed;
                waited.map_err(Error::from)
            }
            LifecycleState::Distributed => {
                info!("closing worker group");
                self.fabric.set_quit();
                let waited = self.fabric.exec_in().wait(self.timeout);
                if waited.is_err() {
                    kill_processes(&self.workers);
                }
                reap_processes(&self.workers);
                self.workers.clear();
                for record in &mut self.functions {
                    record.state = FunctionState::Closed;
                }
                self.state = LifecycleState::Closed;
                waited.map_err(Error::from)
            }
        }
    }
}

impl<E: ComputeEngine> Drop for Coordinator<E> {
    fn drop(&mut self) {
        // Best-effort counterpart of a process-exit hook: a group dropped
        // without an explicit close still releases its workers.
        if self.state != LifecycleState::Closed {
            let _ = self.close();
        }
    }
}

/// Shapes gathered byte parts after the template's non-batch dims and
/// concatenates them in rank order.
fn concat_gathered(
    template: &HostTensor,
    parts: Vec<crate::tensor::TensorData>,
) -> Result<HostTensor> {
    let tail: Vec<usize> = template.shape().iter().skip(1).copied().collect();
    let width: usize = tail.iter().product();
    let mut tensors = Vec::with_capacity(parts.len());
    for part in parts {
        let rows = if width == 0 { 0 } else { part.len() / width };
        let mut shape = vec![rows];
        shape.extend_from_slice(&tail);
        tensors.push(HostTensor::new(part, shape)?);
    }
    Ok(HostTensor::concat_rows(&tensors)?)
}

/// Probes the engine's device count in a forked child, so device discovery
/// never taints the master process before its own workers fork.
fn probe_device_count<E, F>(factory: &F) -> Result<usize>
where
    E: ComputeEngine,
    F: Fn() -> E,
{
    let dir = tempfile::tempdir()?;
    let region = SharedRegion::create(&dir.path().join("probe.seg"), 8)?;
    // SAFETY: the child only writes one scalar into the shared probe region
    // and `_exit`s.
    match unsafe { libc::fork() } {
        -1 => Err(std::io::Error::last_os_error().into()),
        0 => {
            let engine = factory();
            let count = engine.device_count().unwrap_or(0);
            region.atomic_u32(0).store(count as u32, Ordering::Release);
            unsafe { libc::_exit(0) }
        }
        pid => {
            reap_processes(&[pid]);
            let count = region.atomic_u32(0).load(Ordering::Acquire) as usize;
            match count {
                0 => Err(Error::Config("no devices detected".into())),
                1 => {
                    warn!("only one device detected; running without workers");
                    Ok(1)
                }
                n => {
                    info!(devices = n, "probed device count");
                    Ok(n)
                }
            }
        }
    }
}

fn kill_processes(pids: &[libc::pid_t]) {
    for &pid in pids {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

fn reap_processes(pids: &[libc::pid_t]) {
    for &pid in pids {
        let mut status = 0;
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid && status != 0 {
            warn!(pid, status, "worker exited abnormally");
        }
    }
}
