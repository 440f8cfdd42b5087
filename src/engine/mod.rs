//! The compute-engine seam.
//!
//! The coordination core never inspects a computation: it hands the engine a
//! program to compile at registration time, ships the whole compiled set to
//! workers as one opaque blob at distribution time, and calls artifacts with
//! borrowed views into the shared input buffers. Everything numerical —
//! device binding, shared replicas, execution, averaging — sits behind
//! [`ComputeEngine`], so swapping the in-crate host engine for a real
//! accelerator backend does not touch the coordination protocol.

pub mod host;

use crate::tensor::{Dtype, HostTensor, TensorData};
use crate::Result;

/// A borrowed, typed window into a shared input buffer: the rows this
/// process owns (scattered) or the full batch (broadcast).
pub struct InputView<'a> {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub bytes: &'a [u8],
}

impl<'a> InputView<'a> {
    /// Views a caller-owned tensor directly (the uncoordinated local path).
    pub fn of(tensor: &'a HostTensor) -> Self {
        Self {
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
            bytes: tensor.data().as_bytes(),
        }
    }

    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Decodes the view into an owned tensor (copies).
    pub fn to_tensor(&self) -> Result<HostTensor> {
        let data = TensorData::from_bytes(self.dtype, self.bytes)?;
        Ok(HostTensor::new(data, self.shape.clone())?)
    }
}

/// What `compile` hands back: the artifact's dense id and the dtype of each
/// output, in output order.
pub struct CompiledMeta {
    pub artifact: usize,
    pub output_dtypes: Vec<Dtype>,
}

/// Contract between the coordination core and the numerical engine.
///
/// # Id discipline
///
/// Shared entries and artifacts get dense ids in registration/compilation
/// order, and `import_module` must rebuild both sequences under the same
/// ids. That is what preserves shared-state aliasing across functions on
/// the worker side: the whole compiled set travels as one unit, never one
/// artifact at a time.
pub trait ComputeEngine {
    /// Engine-specific program representation handed to `compile`.
    type Program;

    /// Number of devices this engine can drive on this host.
    fn device_count(&self) -> Result<usize>;

    /// Binds this process to one device. Called once per process, right
    /// after fork.
    fn bind_device(&mut self, ordinal: usize) -> Result<()>;

    /// Registers a shared-state entry with its initial value; returns its
    /// dense id.
    fn register_shared(&mut self, name: &str, init: HostTensor) -> Result<usize>;

    /// Host copy of a shared replica's current value.
    fn shared_value(&self, id: usize) -> Result<HostTensor>;

    /// Overwrites a shared replica from host data.
    fn load_shared(&mut self, id: usize, value: &HostTensor) -> Result<()>;

    /// Direct access to a shared replica's storage, for in-place
    /// collectives.
    fn shared_data_mut(&mut self, id: usize) -> Result<&mut TensorData>;

    /// Compiles a program against the declared input dtypes and shared ids;
    /// returns the artifact id and output dtypes.
    fn compile(
        &mut self,
        program: &Self::Program,
        input_dtypes: &[Dtype],
        shared_ids: &[usize],
    ) -> Result<CompiledMeta>;

    /// Compiles the artifact that scales shared replica `shared_id` by the
    /// average factor, in its own dtype.
    fn compile_averager(&mut self, shared_id: usize) -> Result<usize>;

    /// Compiles an artifact that scales a free value of `dtype` by the
    /// average factor.
    fn compile_value_averager(&mut self, dtype: Dtype) -> Result<usize>;

    /// Sets the average factor (always `1 / n_gpu`, set at distribution).
    fn set_average_factor(&mut self, factor: f64) -> Result<()>;

    /// Runs a compiled artifact on this process's input views, returning
    /// one tensor per output.
    fn execute(&mut self, artifact: usize, inputs: &[InputView<'_>]) -> Result<Vec<HostTensor>>;

    /// Applies an averaging artifact: to its bound shared replica when
    /// `value` is `None`, otherwise to the given tensor in place.
    fn apply_averager(&mut self, averager: usize, value: Option<&mut HostTensor>) -> Result<()>;

    /// Serializes every compiled artifact and shared initial value as one
    /// unit.
    fn export_module(&self) -> Result<Vec<u8>>;

    /// Rebuilds the artifact and shared sequences from an exported module.
    fn import_module(&mut self, bytes: &[u8]) -> Result<()>;
}
