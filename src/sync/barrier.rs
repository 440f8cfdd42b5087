//! Cross-process rendezvous barrier over shared memory.
//!
//! Two atomic words per barrier: an arrival counter and a generation
//! counter. The last arriver resets the counter and bumps the generation;
//! everyone else spins on the generation word. Release/Acquire ordering on
//! both words is what gives the fabric its visibility contract: anything a
//! process wrote before arriving is visible to every process that leaves.

use super::SyncError;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Bytes one barrier occupies in a region (arrived + generation).
pub const BARRIER_BYTES: usize = 8;

const PARK_INTERVAL: Duration = Duration::from_micros(50);

pub struct ShmBarrier<'a> {
    arrived: &'a AtomicU32,
    generation: &'a AtomicU32,
    parties: u32,
}

impl<'a> ShmBarrier<'a> {
    pub fn new(arrived: &'a AtomicU32, generation: &'a AtomicU32, parties: u32) -> Self {
        Self {
            arrived,
            generation,
            parties,
        }
    }

    /// Blocks until all parties have arrived.
    ///
    /// With `timeout = None` the wait is unbounded (the worker's idle wait
    /// between calls). A bounded wait that elapses returns
    /// [`SyncError::BarrierTimeout`]; the group is then desynchronized and
    /// no recovery is attempted.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), SyncError> {
        let generation = self.generation.load(Ordering::Acquire);
        let arrived = self.arrived.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived == self.parties {
            // Reset before bumping: nobody can re-arrive until the bump, and
            // waiters only touch the generation word from here on.
            self.arrived.store(0, Ordering::Release);
            self.generation.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let backoff = Backoff::new();
        while self.generation.load(Ordering::Acquire) == generation {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(SyncError::BarrierTimeout {
                        parties: self.parties,
                    });
                }
            }
            if backoff.is_completed() {
                std::thread::sleep(PARK_INTERVAL);
            } else {
                backoff.snooze();
            }
        }
        Ok(())
    }
}
