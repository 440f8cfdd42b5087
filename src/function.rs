//! Function records, call arguments, and registration-time validation.
//!
//! A coordinated function's invocation behavior depends on where the group
//! is in its lifecycle. Rather than rebinding a callable, each record
//! carries an explicit state ([`FunctionState`]) and the call path
//! dispatches on it: before distribution only the local fallback runs,
//! after `close()` nothing coordinated runs at all.

use crate::collective::ReduceKind;
use crate::inputs::{InputVar, SlabToken};
use crate::tensor::{Dtype, HostTensor};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::warn;

/// How one output travels back to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectMode {
    /// In-place reduction across devices; the master holds the result.
    Reduce,
    /// All-gather; the caller receives the rank-ordered concatenation.
    Gather,
    /// The local result passes through unchanged.
    None,
}

/// Collect modes for a function's outputs: one mode for every output, or a
/// per-output list.
#[derive(Clone, Debug)]
pub enum CollectSpec {
    Uniform(CollectMode),
    PerOutput(Vec<CollectMode>),
}

impl Default for CollectSpec {
    fn default() -> Self {
        CollectSpec::Uniform(CollectMode::Reduce)
    }
}

/// Reduce operators for a function's outputs, mirroring [`CollectSpec`].
#[derive(Clone, Debug)]
pub enum ReduceSpec {
    Uniform(ReduceKind),
    PerOutput(Vec<Option<ReduceKind>>),
}

impl Default for ReduceSpec {
    fn default() -> Self {
        ReduceSpec::Uniform(ReduceKind::Avg)
    }
}

/// Validates collect modes and reduce ops against the output count.
///
/// A uniform mode or op is broadcast to every output. An op is required for
/// every `Reduce` output; an op supplied for a non-reduce output is ignored
/// with a warning rather than rejected.
pub(crate) fn check_collect(
    n_outputs: usize,
    modes: &CollectSpec,
    ops: &ReduceSpec,
) -> Result<Vec<(CollectMode, Option<ReduceKind>)>> {
    let modes: Vec<CollectMode> = match modes {
        CollectSpec::Uniform(mode) => vec![*mode; n_outputs],
        CollectSpec::PerOutput(list) => {
            if list.len() != n_outputs {
                return Err(Error::Config(format!(
                    "{} collect modes for {} outputs",
                    list.len(),
                    n_outputs
                )));
            }
            list.clone()
        }
    };
    let ops: Vec<Option<ReduceKind>> = match ops {
        ReduceSpec::Uniform(op) => modes
            .iter()
            .map(|mode| match mode {
                CollectMode::Reduce => Some(*op),
                _ => None,
            })
            .collect(),
        ReduceSpec::PerOutput(list) => {
            if list.len() != n_outputs {
                return Err(Error::Config(format!(
                    "{} reduce ops for {} outputs",
                    list.len(),
                    n_outputs
                )));
            }
            list.clone()
        }
    };
    let mut result = Vec::with_capacity(n_outputs);
    for (i, (mode, op)) in modes.into_iter().zip(ops).enumerate() {
        let op = match (mode, op) {
            (CollectMode::Reduce, Some(op)) => Some(op),
            (CollectMode::Reduce, None) => {
                return Err(Error::Config(format!(
                    "output {i} collects by reduce but has no reduce op"
                )));
            }
            (_, Some(_)) => {
                warn!(output = i, "reduce op ignored for non-reduce output");
                None
            }
            (_, None) => None,
        };
        result.push((mode, op));
    }
    Ok(result)
}

/// Resolves the scatter/broadcast specification into one flag per input.
///
/// The two lists are mutually exclusive; with neither, every input is
/// scattered. Listed inputs must be inputs of the function.
pub(crate) fn check_inputs_scatter(
    inputs: &[InputVar],
    broadcast: Option<&[InputVar]>,
    scatter: Option<&[InputVar]>,
) -> Result<Vec<bool>> {
    let member = |var: &InputVar| inputs.iter().any(|i| i.id() == var.id());
    match (broadcast, scatter) {
        (Some(_), Some(_)) => Err(Error::Config(
            "specify either broadcast_inputs or scatter_inputs, not both".into(),
        )),
        (None, None) => Ok(vec![true; inputs.len()]),
        (Some(broadcast), None) => {
            let mut flags = vec![true; inputs.len()];
            for var in broadcast {
                if !member(var) {
                    return Err(Error::Config(format!(
                        "broadcast input {:?} is not an input of this function",
                        var.name()
                    )));
                }
                for (flag, input) in flags.iter_mut().zip(inputs) {
                    if input.id() == var.id() {
                        *flag = false;
                    }
                }
            }
            Ok(flags)
        }
        (None, Some(scatter)) => {
            let mut flags = vec![false; inputs.len()];
            for var in scatter {
                if !member(var) {
                    return Err(Error::Config(format!(
                        "scatter input {:?} is not an input of this function",
                        var.name()
                    )));
                }
                for (flag, input) in flags.iter_mut().zip(inputs) {
                    if input.id() == var.id() {
                        *flag = true;
                    }
                }
            }
            Ok(flags)
        }
    }
}

/// Per-function lifecycle state, dispatched on by the call path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionState {
    /// Registered but not yet distributed: only the local fallback runs.
    PreDistribution,
    /// Distributed and callable.
    Active,
    /// The group is closed: the coordinated call path is gone for good.
    Closed,
}

/// One output's collection plan.
#[derive(Clone, Debug)]
pub(crate) struct OutputSpec {
    pub dtype: Dtype,
    pub mode: CollectMode,
    pub op: Option<ReduceKind>,
    /// Engine artifact applying the `1/n_gpu` scale, present iff `op` is
    /// `Avg`.
    pub averager: Option<usize>,
}

pub(crate) struct FunctionRecord {
    pub name: Option<String>,
    pub artifact: usize,
    pub input_ids: Vec<usize>,
    pub input_names: Vec<String>,
    pub scatter: Vec<bool>,
    pub outputs: Vec<OutputSpec>,
    pub shared_ids: Vec<usize>,
    pub state: FunctionState,
    pub prev_batch: Option<usize>,
    pub my_range: Range<usize>,
}

/// Public handle to a registered function. Ids are dense and assigned in
/// registration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub(crate) id: usize,
}

impl Function {
    pub fn id(&self) -> usize {
        self.id
    }
}

/// One call argument: a caller-owned batch to stage, or a token for rows
/// already written into the input's slab.
pub enum ArgValue<'a> {
    Data(&'a HostTensor),
    Slab(SlabToken),
}

impl ArgValue<'_> {
    pub(crate) fn rows(&self) -> usize {
        match self {
            ArgValue::Data(t) => t.rows(),
            ArgValue::Slab(token) => token.rows,
        }
    }
}

/// Call arguments: positional first, keyword by input name after.
#[derive(Default)]
pub struct Args<'a> {
    pub(crate) positional: Vec<ArgValue<'a>>,
    pub(crate) named: Vec<(String, ArgValue<'a>)>,
    pub(crate) output_subset: Option<Vec<usize>>,
}

impl<'a> Args<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, tensor: &'a HostTensor) -> Self {
        self.positional.push(ArgValue::Data(tensor));
        self
    }

    pub fn named(mut self, name: &str, tensor: &'a HostTensor) -> Self {
        self.named.push((name.to_string(), ArgValue::Data(tensor)));
        self
    }

    pub fn slab(mut self, token: SlabToken) -> Self {
        self.positional.push(ArgValue::Slab(token));
        self
    }

    pub fn named_slab(mut self, name: &str, token: SlabToken) -> Self {
        self.named.push((name.to_string(), ArgValue::Slab(token)));
        self
    }

    /// Requesting a subset of outputs is recognized but not supported; the
    /// call fails fast before any barrier is touched.
    pub fn output_subset(mut self, outputs: Vec<usize>) -> Self {
        self.output_subset = Some(outputs);
        self
    }
}

/// Orders positional and keyword arguments against the record's input
/// names. Arity must match exactly.
pub(crate) fn order_args<'a>(
    record: &FunctionRecord,
    args: Args<'a>,
) -> Result<Vec<ArgValue<'a>>> {
    let n = record.input_ids.len();
    if args.positional.len() + args.named.len() != n {
        return Err(Error::Config(format!(
            "function takes {} inputs, got {} positional + {} keyword",
            n,
            args.positional.len(),
            args.named.len()
        )));
    }
    let n_positional = args.positional.len();
    let mut slots: Vec<Option<ArgValue<'a>>> = args.positional.into_iter().map(Some).collect();
    slots.resize_with(n, || None);
    for (name, value) in args.named {
        let position = record
            .input_names
            .iter()
            .position(|candidate| *candidate == name)
            .ok_or_else(|| {
                Error::Config(format!("keyword argument {name:?} is not an input name"))
            })?;
        if position < n_positional || slots[position].is_some() {
            return Err(Error::Config(format!(
                "input {name:?} supplied more than once"
            )));
        }
        slots[position] = Some(value);
    }
    let mut ordered = Vec::with_capacity(n);
    for (i, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(value) => ordered.push(value),
            None => {
                return Err(Error::Config(format!(
                    "missing argument for input {:?}",
                    record.input_names[i]
                )));
            }
        }
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Dtype;

    fn record(names: &[&str]) -> FunctionRecord {
        FunctionRecord {
            name: None,
            artifact: 0,
            input_ids: (0..names.len()).collect(),
            input_names: names.iter().map(|s| s.to_string()).collect(),
            scatter: vec![true; names.len()],
            outputs: vec![],
            shared_ids: vec![],
            state: FunctionState::Active,
            prev_batch: None,
            my_range: 0..0,
        }
    }

    fn var(id: usize, name: &str) -> InputVar {
        InputVar {
            id,
            name: name.to_string(),
            dtype: Dtype::F32,
        }
    }

    #[test]
    fn uniform_modes_broadcast_to_outputs() {
        let plan = check_collect(
            3,
            &CollectSpec::Uniform(CollectMode::Reduce),
            &ReduceSpec::Uniform(ReduceKind::Avg),
        )
        .unwrap();
        assert_eq!(plan.len(), 3);
        assert!(plan
            .iter()
            .all(|(m, op)| *m == CollectMode::Reduce && *op == Some(ReduceKind::Avg)));
    }

    #[test]
    fn reduce_without_op_is_rejected() {
        let err = check_collect(
            1,
            &CollectSpec::Uniform(CollectMode::Reduce),
            &ReduceSpec::PerOutput(vec![None]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn op_on_gather_output_is_dropped_not_fatal() {
        let plan = check_collect(
            2,
            &CollectSpec::PerOutput(vec![CollectMode::Gather, CollectMode::Reduce]),
            &ReduceSpec::Uniform(ReduceKind::Sum),
        )
        .unwrap();
        assert_eq!(plan[0], (CollectMode::Gather, None));
        assert_eq!(plan[1], (CollectMode::Reduce, Some(ReduceKind::Sum)));

        let plan = check_collect(
            1,
            &CollectSpec::Uniform(CollectMode::None),
            &ReduceSpec::PerOutput(vec![Some(ReduceKind::Max)]),
        )
        .unwrap();
        assert_eq!(plan[0], (CollectMode::None, None));
    }

    #[test]
    fn mode_count_must_match_outputs() {
        let err = check_collect(
            2,
            &CollectSpec::PerOutput(vec![CollectMode::Reduce]),
            &ReduceSpec::Uniform(ReduceKind::Sum),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn scatter_spec_resolution() {
        let inputs = vec![var(0, "x"), var(1, "y"), var(2, "z")];
        assert_eq!(
            check_inputs_scatter(&inputs, None, None).unwrap(),
            vec![true, true, true]
        );
        assert_eq!(
            check_inputs_scatter(&inputs, Some(&[var(1, "y")]), None).unwrap(),
            vec![true, false, true]
        );
        assert_eq!(
            check_inputs_scatter(&inputs, None, Some(&[var(0, "x")])).unwrap(),
            vec![true, false, false]
        );
        assert!(check_inputs_scatter(&inputs, Some(&[var(0, "x")]), Some(&[var(1, "y")])).is_err());
        assert!(check_inputs_scatter(&inputs, Some(&[var(7, "w")]), None).is_err());
    }

    #[test]
    fn order_args_positional_and_keyword() {
        let rec = record(&["x", "y", "z"]);
        let a = HostTensor::from_vec(vec![1.0f32], &[1]).unwrap();
        let b = HostTensor::from_vec(vec![2.0f32], &[1]).unwrap();
        let c = HostTensor::from_vec(vec![3.0f32], &[1]).unwrap();
        let ordered = order_args(
            &rec,
            Args::new().arg(&a).named("z", &c).named("y", &b),
        )
        .unwrap();
        let values: Vec<f32> = ordered
            .iter()
            .map(|v| match v {
                ArgValue::Data(t) => t.as_slice::<f32>().unwrap()[0],
                ArgValue::Slab(_) => unreachable!(),
            })
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn order_args_rejects_bad_arity_and_names() {
        let rec = record(&["x", "y"]);
        let a = HostTensor::from_vec(vec![1.0f32], &[1]).unwrap();
        assert!(order_args(&rec, Args::new().arg(&a)).is_err());
        assert!(order_args(&rec, Args::new().arg(&a).named("w", &a)).is_err());
        assert!(order_args(&rec, Args::new().arg(&a).named("x", &a)).is_err());
    }
}
