//! Run-directory layout shared by the master and its workers.

use std::path::{Path, PathBuf};

/// Well-known file names inside one coordinator's run directory. The master
/// owns the directory (a tempdir); workers receive its path at fork time and
/// derive every segment location from it.
#[derive(Clone, Debug)]
pub(crate) struct RunPaths {
    root: PathBuf,
}

impl RunPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn fabric(&self) -> PathBuf {
        self.root.join("fabric.seg")
    }

    pub fn dispatch(&self) -> PathBuf {
        self.root.join("dispatch.seg")
    }

    pub fn setup(&self) -> PathBuf {
        self.root.join("setup.json")
    }

    /// The serialized compiled-artifact set, written once at distribution.
    pub fn module(&self) -> PathBuf {
        self.root.join("module.bin")
    }

    /// Communicator rendezvous directory (its path doubles as the join
    /// token handed to workers through the setup store).
    pub fn comm_dir(&self) -> PathBuf {
        self.root.join("comm")
    }

    /// Batch buffer for one input under one allocation tag.
    pub fn input_buffer(&self, input_id: usize, tag: u64) -> PathBuf {
        self.root.join(format!("input_{input_id}_{tag}.buf"))
    }

    /// Scatter mirror for one shared-state entry.
    pub fn mirror(&self, shared_id: usize) -> PathBuf {
        self.root.join(format!("mirror_{shared_id}.buf"))
    }
}
