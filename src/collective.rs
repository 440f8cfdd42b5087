//! Collective operation vocabulary and the dispatch table.
//!
//! The four replica collectives share one coordination template; what varies
//! per operation is the transport primitive and whether a reduce operator is
//! required. That variation lives in a table ([`CollectiveKind::def`])
//! instead of per-operation wrapper procedures.

use serde::{Deserialize, Serialize};

/// Transport-level reduce operator, after alias resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Prod,
    Max,
    Min,
}

/// User-facing reduce operator. `Avg` is an alias: it resolves to a sum
/// across replicas followed by a local scale by `1/n_gpu`, applied through a
/// precompiled averaging artifact so the result stays in the output's dtype.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceKind {
    Avg,
    Sum,
    Prod,
    Max,
    Min,
}

impl ReduceKind {
    /// Resolves to the transport operator plus whether a local post-scale is
    /// needed.
    pub fn resolve(self) -> (ReduceOp, bool) {
        match self {
            ReduceKind::Avg => (ReduceOp::Sum, true),
            ReduceKind::Sum => (ReduceOp::Sum, false),
            ReduceKind::Prod => (ReduceOp::Prod, false),
            ReduceKind::Max => (ReduceOp::Max, false),
            ReduceKind::Min => (ReduceOp::Min, false),
        }
    }

    /// Worker-side spelling: workers never apply output averaging, so they
    /// are handed `Sum` wherever the master holds `Avg`.
    pub(crate) fn worker_resolved(self) -> ReduceKind {
        match self {
            ReduceKind::Avg => ReduceKind::Sum,
            other => other,
        }
    }

    pub(crate) fn code(self) -> u32 {
        match self {
            ReduceKind::Avg => 1,
            ReduceKind::Sum => 2,
            ReduceKind::Prod => 3,
            ReduceKind::Max => 4,
            ReduceKind::Min => 5,
        }
    }

    pub(crate) fn from_code(code: u32) -> Option<ReduceKind> {
        match code {
            1 => Some(ReduceKind::Avg),
            2 => Some(ReduceKind::Sum),
            3 => Some(ReduceKind::Prod),
            4 => Some(ReduceKind::Max),
            5 => Some(ReduceKind::Min),
            _ => None,
        }
    }
}

/// The replica collectives dispatched through the device communicator.
///
/// `scatter` is not listed here: it moves host data through per-worker
/// mirrors rather than the device communicator, and is restricted to a
/// single shared-state target per call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectiveKind {
    Broadcast,
    Reduce,
    AllReduce,
    AllGather,
}

/// Table row: how one collective kind is dispatched.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CollectiveDef {
    pub kind: CollectiveKind,
    pub requires_op: bool,
}

static COLLECTIVES: [CollectiveDef; 4] = [
    CollectiveDef {
        kind: CollectiveKind::Broadcast,
        requires_op: false,
    },
    CollectiveDef {
        kind: CollectiveKind::Reduce,
        requires_op: true,
    },
    CollectiveDef {
        kind: CollectiveKind::AllReduce,
        requires_op: true,
    },
    CollectiveDef {
        kind: CollectiveKind::AllGather,
        requires_op: false,
    },
];

/// Wire code for the host-side scatter step (`comm_kind` slot).
pub(crate) const SCATTER_CODE: u32 = 5;

impl CollectiveKind {
    pub(crate) fn def(self) -> &'static CollectiveDef {
        match self {
            CollectiveKind::Broadcast => &COLLECTIVES[0],
            CollectiveKind::Reduce => &COLLECTIVES[1],
            CollectiveKind::AllReduce => &COLLECTIVES[2],
            CollectiveKind::AllGather => &COLLECTIVES[3],
        }
    }

    pub(crate) fn code(self) -> u32 {
        match self {
            CollectiveKind::Broadcast => 1,
            CollectiveKind::Reduce => 2,
            CollectiveKind::AllReduce => 3,
            CollectiveKind::AllGather => 4,
        }
    }

    pub(crate) fn from_code(code: u32) -> Option<CollectiveKind> {
        match code {
            1 => Some(CollectiveKind::Broadcast),
            2 => Some(CollectiveKind::Reduce),
            3 => Some(CollectiveKind::AllReduce),
            4 => Some(CollectiveKind::AllGather),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_resolves_to_sum_plus_scale() {
        assert_eq!(ReduceKind::Avg.resolve(), (ReduceOp::Sum, true));
        assert_eq!(ReduceKind::Max.resolve(), (ReduceOp::Max, false));
    }

    #[test]
    fn table_marks_op_requirements() {
        assert!(CollectiveKind::Reduce.def().requires_op);
        assert!(CollectiveKind::AllReduce.def().requires_op);
        assert!(!CollectiveKind::Broadcast.def().requires_op);
        assert!(!CollectiveKind::AllGather.def().requires_op);
    }

    #[test]
    fn codes_round_trip() {
        for kind in [
            CollectiveKind::Broadcast,
            CollectiveKind::Reduce,
            CollectiveKind::AllReduce,
            CollectiveKind::AllGather,
        ] {
            assert_eq!(CollectiveKind::from_code(kind.code()), Some(kind));
        }
        for op in [
            ReduceKind::Avg,
            ReduceKind::Sum,
            ReduceKind::Prod,
            ReduceKind::Max,
            ReduceKind::Min,
        ] {
            assert_eq!(ReduceKind::from_code(op.code()), Some(op));
        }
    }
}
