//! Shared-state registry.
//!
//! A shared-state entry is a mutable tensor replicated on every device and
//! kept consistent through collectives. The registry tracks coordination
//! metadata only — the replicas themselves live in each process's engine.
//! The CPU-side scatter mirror is allocated lazily: most entries are only
//! ever touched by device collectives and never need one.

use crate::paths::RunPaths;
use crate::sync::SharedRegion;
use crate::tensor::Dtype;
use crate::{Error, Result};

/// Handle to a registered shared-state entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedVar {
    pub(crate) id: usize,
    pub(crate) name: String,
}

impl SharedVar {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub(crate) struct SharedEntry {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    /// Engine artifact that scales the replica by the average factor.
    pub averager: Option<usize>,
    /// Lazily allocated scatter mirror (`n_ranks` slots of `nbytes` each).
    pub mirror: Option<SharedRegion>,
}

impl SharedEntry {
    pub fn nbytes(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.size_of()
    }
}

#[derive(Default)]
pub(crate) struct SharedRegistry {
    entries: Vec<SharedEntry>,
}

impl SharedRegistry {
    pub fn register(&mut self, name: &str, dtype: Dtype, shape: Vec<usize>) -> Result<SharedVar> {
        if self.entries.iter().any(|e| e.name == name) {
            return Err(Error::Config(format!(
                "shared variable {name:?} is already registered"
            )));
        }
        let id = self.entries.len();
        self.entries.push(SharedEntry {
            name: name.to_string(),
            dtype,
            shape,
            averager: None,
            mirror: None,
        });
        Ok(SharedVar {
            id,
            name: name.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, id: usize) -> &SharedEntry {
        &self.entries[id]
    }

    pub fn entry_mut(&mut self, id: usize) -> &mut SharedEntry {
        &mut self.entries[id]
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    pub fn contains_id(&self, id: usize) -> bool {
        id < self.entries.len()
    }

    /// Returns the scatter mirror for `id`, allocating it on first use.
    pub fn ensure_mirror(
        &mut self,
        paths: &RunPaths,
        id: usize,
        n_ranks: usize,
    ) -> Result<&SharedRegion> {
        let nbytes = self.entries[id].nbytes();
        if self.entries[id].mirror.is_none() {
            let region = SharedRegion::create(&paths.mirror(id), (n_ranks * nbytes).max(8))?;
            self.entries[id].mirror = Some(region);
        }
        match &self.entries[id].mirror {
            Some(mirror) => Ok(mirror),
            None => Err(Error::Engine("scatter mirror allocation failed".into())),
        }
    }
}
