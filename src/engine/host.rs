//! Host (CPU) reference engine.
//!
//! A minimal but complete [`ComputeEngine`]: programs are small batch
//! pipelines over the input views and shared replicas, executed with rayon
//! on the host. It exists for the same reason the pack's tensor library
//! ships a CPU collective backend next to its accelerator one — the whole
//! coordination stack can be exercised end to end on any machine. "Device
//! resident" here means resident in the worker process's own memory.
//!
//! The module container pairs a JSON artifact table with a safetensors
//! block holding the shared initial values, so workers reconstruct the
//! exact shared-state aliasing the master compiled against.

use super::{CompiledMeta, ComputeEngine, InputView};
use crate::tensor::{Dtype, HostTensor, TensorData};
use crate::{Error, Result};
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

/// One value in a program: evaluated per call against this process's input
/// views and shared replicas.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HostExpr {
    /// The input's rows, as delivered to this device.
    Input(usize),
    /// Sum of the input over the batch axis.
    SumRows(usize),
    /// Mean of the input over the batch axis (in the input's dtype).
    MeanRows(usize),
    /// Number of rows this device received, as a 1-element `i64` tensor.
    RowCount(usize),
    /// Current value of a shared replica.
    Shared(usize),
    /// Elementwise sum of two values of identical shape and dtype.
    Add(Box<HostExpr>, Box<HostExpr>),
    /// Value scaled by a constant, staying in its dtype.
    Scale(Box<HostExpr>, f64),
}

/// One shared-replica update, applied after the outputs are evaluated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HostUpdate {
    /// `shared += scale * sum_rows(input)`.
    AccumulateRows {
        shared: usize,
        input: usize,
        scale: f64,
    },
    /// `shared = expr`, evaluated against pre-update replica values.
    Assign { shared: usize, expr: HostExpr },
}

/// A compilable host program: output expressions plus replica updates.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HostProgram {
    pub outputs: Vec<HostExpr>,
    pub updates: Vec<HostUpdate>,
}

impl HostProgram {
    pub fn outputs(outputs: Vec<HostExpr>) -> Self {
        Self {
            outputs,
            updates: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum HostArtifact {
    Program {
        program: HostProgram,
        input_dtypes: Vec<Dtype>,
        shared_ids: Vec<usize>,
    },
    SharedAverager {
        shared: usize,
    },
    ValueAverager {
        dtype: Dtype,
    },
}

#[derive(Clone, Debug)]
struct HostShared {
    name: String,
    value: HostTensor,
}

#[derive(Serialize, Deserialize)]
struct SharedMeta {
    name: String,
    dtype: Dtype,
    shape: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct ModuleManifest {
    artifacts: Vec<HostArtifact>,
    shared: Vec<SharedMeta>,
}

pub struct HostEngine {
    devices: usize,
    device: Option<usize>,
    shared: Vec<HostShared>,
    artifacts: Vec<HostArtifact>,
    avg_factor: f64,
}

impl HostEngine {
    /// An engine pretending to drive `devices` host "devices".
    pub fn new(devices: usize) -> Self {
        Self {
            devices: devices.max(1),
            device: None,
            shared: Vec::new(),
            artifacts: Vec::new(),
            avg_factor: 1.0,
        }
    }

    /// The device this process is bound to, once `bind_device` ran.
    pub fn device(&self) -> Option<usize> {
        self.device
    }
}

impl Default for HostEngine {
    fn default() -> Self {
        let devices = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(devices)
    }
}

fn infer_dtype(
    expr: &HostExpr,
    input_dtypes: &[Dtype],
    shared: &[HostShared],
) -> Result<Dtype> {
    match expr {
        HostExpr::Input(i) | HostExpr::SumRows(i) | HostExpr::MeanRows(i) => input_dtypes
            .get(*i)
            .copied()
            .ok_or_else(|| Error::Config(format!("expression references input {i} of {}", input_dtypes.len()))),
        HostExpr::RowCount(i) => {
            if *i >= input_dtypes.len() {
                return Err(Error::Config(format!(
                    "expression references input {i} of {}",
                    input_dtypes.len()
                )));
            }
            Ok(Dtype::I64)
        }
        HostExpr::Shared(id) => shared
            .get(*id)
            .map(|s| s.value.dtype())
            .ok_or_else(|| Error::Config(format!("expression references unknown shared {id}"))),
        HostExpr::Add(a, b) => {
            let da = infer_dtype(a, input_dtypes, shared)?;
            let db = infer_dtype(b, input_dtypes, shared)?;
            if da != db {
                return Err(Error::DtypeMismatch {
                    expected: da,
                    got: db,
                });
            }
            Ok(da)
        }
        HostExpr::Scale(a, _) => infer_dtype(a, input_dtypes, shared),
    }
}

fn eval(
    expr: &HostExpr,
    inputs: &[InputView<'_>],
    shared: &[HostShared],
) -> Result<HostTensor> {
    match expr {
        HostExpr::Input(i) => view(inputs, *i)?.to_tensor(),
        HostExpr::SumRows(i) => view(inputs, *i)?.to_tensor()?.sum_rows().map_err(Into::into),
        HostExpr::MeanRows(i) => view(inputs, *i)?.to_tensor()?.mean_rows().map_err(Into::into),
        HostExpr::RowCount(i) => {
            let rows = view(inputs, *i)?.rows() as i64;
            Ok(HostTensor::from_vec(vec![rows], &[1])?)
        }
        HostExpr::Shared(id) => shared
            .get(*id)
            .map(|s| s.value.clone())
            .ok_or_else(|| Error::Engine(format!("unknown shared replica {id}"))),
        HostExpr::Add(a, b) => {
            let mut lhs = eval(a, inputs, shared)?;
            let rhs = eval(b, inputs, shared)?;
            lhs.add_assign(&rhs)?;
            Ok(lhs)
        }
        HostExpr::Scale(a, factor) => {
            let mut value = eval(a, inputs, shared)?;
            value.scale(*factor);
            Ok(value)
        }
    }
}

fn view<'a, 'b>(inputs: &'a [InputView<'b>], i: usize) -> Result<&'a InputView<'b>> {
    inputs
        .get(i)
        .ok_or_else(|| Error::Engine(format!("artifact expected input {i}, call provided {}", inputs.len())))
}

fn st_dtype(dtype: Dtype) -> safetensors::Dtype {
    match dtype {
        Dtype::F32 => safetensors::Dtype::F32,
        Dtype::F64 => safetensors::Dtype::F64,
        Dtype::I32 => safetensors::Dtype::I32,
        Dtype::I64 => safetensors::Dtype::I64,
    }
}

impl ComputeEngine for HostEngine {
    type Program = HostProgram;

    fn device_count(&self) -> Result<usize> {
        Ok(self.devices)
    }

    fn bind_device(&mut self, ordinal: usize) -> Result<()> {
        if ordinal >= self.devices {
            return Err(Error::Config(format!(
                "device ordinal {ordinal} out of range for {} devices",
                self.devices
            )));
        }
        self.device = Some(ordinal);
        Ok(())
    }

    fn register_shared(&mut self, name: &str, init: HostTensor) -> Result<usize> {
        let id = self.shared.len();
        self.shared.push(HostShared {
            name: name.to_string(),
            value: init,
        });
        Ok(id)
    }

    fn shared_value(&self, id: usize) -> Result<HostTensor> {
        self.shared
            .get(id)
            .map(|s| s.value.clone())
            .ok_or_else(|| Error::Engine(format!("unknown shared replica {id}")))
    }

    fn load_shared(&mut self, id: usize, value: &HostTensor) -> Result<()> {
        let slot = self
            .shared
            .get_mut(id)
            .ok_or_else(|| Error::Engine(format!("unknown shared replica {id}")))?;
        if value.dtype() != slot.value.dtype() {
            return Err(Error::DtypeMismatch {
                expected: slot.value.dtype(),
                got: value.dtype(),
            });
        }
        if value.shape() != slot.value.shape() {
            return Err(Error::ShapeMismatch {
                expected: slot.value.shape().to_vec(),
                got: value.shape().to_vec(),
            });
        }
        slot.value = value.clone();
        Ok(())
    }

    fn shared_data_mut(&mut self, id: usize) -> Result<&mut TensorData> {
        self.shared
            .get_mut(id)
            .map(|s| s.value.data_mut())
            .ok_or_else(|| Error::Engine(format!("unknown shared replica {id}")))
    }

    fn compile(
        &mut self,
        program: &HostProgram,
        input_dtypes: &[Dtype],
        shared_ids: &[usize],
    ) -> Result<CompiledMeta> {
        let mut output_dtypes = Vec::with_capacity(program.outputs.len());
        for expr in &program.outputs {
            output_dtypes.push(infer_dtype(expr, input_dtypes, &self.shared)?);
        }
        for update in &program.updates {
            let shared = match update {
                HostUpdate::AccumulateRows { shared, input, .. } => {
                    if *input >= input_dtypes.len() {
                        return Err(Error::Config(format!(
                            "update references input {input} of {}",
                            input_dtypes.len()
                        )));
                    }
                    *shared
                }
                HostUpdate::Assign { shared, expr } => {
                    infer_dtype(expr, input_dtypes, &self.shared)?;
                    *shared
                }
            };
            if shared >= self.shared.len() {
                return Err(Error::Config(format!("update targets unknown shared {shared}")));
            }
            if !shared_ids.contains(&shared) {
                return Err(Error::Config(format!(
                    "update targets shared {shared}, which the function does not declare"
                )));
            }
        }
        let artifact = self.artifacts.len();
        self.artifacts.push(HostArtifact::Program {
            program: program.clone(),
            input_dtypes: input_dtypes.to_vec(),
            shared_ids: shared_ids.to_vec(),
        });
        Ok(CompiledMeta {
            artifact,
            output_dtypes,
        })
    }

    fn compile_averager(&mut self, shared_id: usize) -> Result<usize> {
        if shared_id >= self.shared.len() {
            return Err(Error::Config(format!(
                "averager targets unknown shared {shared_id}"
            )));
        }
        let artifact = self.artifacts.len();
        self.artifacts
            .push(HostArtifact::SharedAverager { shared: shared_id });
        Ok(artifact)
    }

    fn compile_value_averager(&mut self, dtype: Dtype) -> Result<usize> {
        let artifact = self.artifacts.len();
        self.artifacts.push(HostArtifact::ValueAverager { dtype });
        Ok(artifact)
    }

    fn set_average_factor(&mut self, factor: f64) -> Result<()> {
        self.avg_factor = factor;
        Ok(())
    }

    fn execute(&mut self, artifact: usize, inputs: &[InputView<'_>]) -> Result<Vec<HostTensor>> {
        let spec = self
            .artifacts
            .get(artifact)
            .ok_or_else(|| Error::Engine(format!("unknown artifact {artifact}")))?;
        let program = match spec {
            HostArtifact::Program { program, .. } => program.clone(),
            _ => {
                return Err(Error::Engine(format!(
                    "artifact {artifact} is an averager, not a callable program"
                )))
            }
        };

        let mut outputs = Vec::with_capacity(program.outputs.len());
        for expr in &program.outputs {
            outputs.push(eval(expr, inputs, &self.shared)?);
        }

        // Updates see pre-update replica values: evaluate all right-hand
        // sides first, then apply.
        let mut staged: Vec<(usize, HostTensor, bool)> = Vec::with_capacity(program.updates.len());
        for update in &program.updates {
            match update {
                HostUpdate::AccumulateRows {
                    shared,
                    input,
                    scale,
                } => {
                    let mut delta = view(inputs, *input)?.to_tensor()?.sum_rows()?;
                    delta.scale(*scale);
                    staged.push((*shared, delta, true));
                }
                HostUpdate::Assign { shared, expr } => {
                    staged.push((*shared, eval(expr, inputs, &self.shared)?, false));
                }
            }
        }
        for (shared, value, accumulate) in staged {
            let slot = self
                .shared
                .get_mut(shared)
                .ok_or_else(|| Error::Engine(format!("unknown shared replica {shared}")))?;
            if accumulate {
                slot.value.add_assign(&value)?;
            } else {
                if value.dtype() != slot.value.dtype() {
                    return Err(Error::DtypeMismatch {
                        expected: slot.value.dtype(),
                        got: value.dtype(),
                    });
                }
                if value.shape() != slot.value.shape() {
                    return Err(Error::ShapeMismatch {
                        expected: slot.value.shape().to_vec(),
                        got: value.shape().to_vec(),
                    });
                }
                slot.value = value;
            }
        }
        Ok(outputs)
    }

    fn apply_averager(&mut self, averager: usize, value: Option<&mut HostTensor>) -> Result<()> {
        let factor = self.avg_factor;
        match self
            .artifacts
            .get(averager)
            .ok_or_else(|| Error::Engine(format!("unknown artifact {averager}")))?
        {
            HostArtifact::SharedAverager { shared } => {
                if value.is_some() {
                    return Err(Error::Config(
                        "shared averager does not take a free value".into(),
                    ));
                }
                let shared = *shared;
                let slot = self
                    .shared
                    .get_mut(shared)
                    .ok_or_else(|| Error::Engine(format!("unknown shared replica {shared}")))?;
                slot.value.scale(factor);
                Ok(())
            }
            HostArtifact::ValueAverager { dtype } => {
                let target = value.ok_or_else(|| {
                    Error::Config("value averager needs a value to scale".into())
                })?;
                if target.dtype() != *dtype {
                    return Err(Error::DtypeMismatch {
                        expected: *dtype,
                        got: target.dtype(),
                    });
                }
                target.scale(factor);
                Ok(())
            }
            HostArtifact::Program { .. } => Err(Error::Engine(format!(
                "artifact {averager} is a program, not an averager"
            ))),
        }
    }

    fn export_module(&self) -> Result<Vec<u8>> {
        let manifest = ModuleManifest {
            artifacts: self.artifacts.clone(),
            shared: self
                .shared
                .iter()
                .map(|s| SharedMeta {
                    name: s.name.clone(),
                    dtype: s.value.dtype(),
                    shape: s.value.shape().to_vec(),
                })
                .collect(),
        };
        let header = serde_json::to_vec(&manifest).map_err(|e| Error::Engine(e.to_string()))?;

        let mut views = Vec::with_capacity(self.shared.len());
        for s in &self.shared {
            let view = TensorView::new(
                st_dtype(s.value.dtype()),
                s.value.shape().to_vec(),
                s.value.data().as_bytes(),
            )
            .map_err(|e| Error::Engine(format!("safetensors view: {e:?}")))?;
            views.push((s.name.clone(), view));
        }
        let blob = safetensors::serialize(views, &None)
            .map_err(|e| Error::Engine(format!("safetensors serialize: {e:?}")))?;

        let mut out = Vec::with_capacity(8 + header.len() + blob.len());
        out.extend_from_slice(&(header.len() as u64).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&blob);
        Ok(out)
    }

    fn import_module(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() < 8 {
            return Err(Error::Engine("module blob truncated".into()));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[..8]);
        let header_len = u64::from_le_bytes(len_bytes) as usize;
        let header_end = 8usize
            .checked_add(header_len)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| Error::Engine("module blob truncated".into()))?;
        let manifest: ModuleManifest = serde_json::from_slice(&bytes[8..header_end])
            .map_err(|e| Error::Engine(e.to_string()))?;
        let tensors = SafeTensors::deserialize(&bytes[header_end..])
            .map_err(|e| Error::Engine(format!("safetensors deserialize: {e:?}")))?;

        let mut shared = Vec::with_capacity(manifest.shared.len());
        for meta in &manifest.shared {
            let view = tensors
                .tensor(&meta.name)
                .map_err(|e| Error::Engine(format!("shared {:?} missing from module: {e:?}", meta.name)))?;
            let data = TensorData::from_bytes(meta.dtype, view.data())?;
            shared.push(HostShared {
                name: meta.name.clone(),
                value: HostTensor::new(data, meta.shape.clone())?,
            });
        }
        self.shared = shared;
        self.artifacts = manifest.artifacts;
        Ok(())
    }
}
