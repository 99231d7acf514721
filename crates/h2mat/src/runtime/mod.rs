//! Rank-level runtime: one driver thread plus a task pool per rank.
//!
//! [`Runtime::launch`] spawns one driver thread per rank of the topology and
//! runs the user closure on each with that rank's [`RankContext`]. The
//! closure builds its own [`TaskPool`] phases; the runtime's job is rank
//! lifecycle, panic surfacing, and the thread-local rank index used for
//! logging.

mod pool;

pub use pool::{Access, Priority, ResourceId, TaskBody, TaskPool};

use crate::comm::{Communicator, ProcessGroup};
use crate::error::{install_panic_hook, Error, WorkerPanicInfo};
use h2mat_types::Topology;
use std::cell::Cell;
use std::thread::Builder;
use tracing::debug;

thread_local! {
    // 0-based rank of the current driver thread, or 0 outside a runtime.
    static RANK: Cell<usize> = const { Cell::new(0) };
}

/// Context handed to each rank's driver closure.
pub struct RankContext {
    /// World communicator of this rank.
    pub comm: Communicator,
    /// The run topology (shared by all ranks).
    pub topology: Topology,
}

impl RankContext {
    /// Starts this rank's compute pool, sized to the topology's compute
    /// worker count (the request-servicing slice is spawned separately by
    /// the operator broker).
    pub fn start_pool(&self) -> TaskPool {
        TaskPool::start(
            &format!("h2mat-{}", self.comm.world_rank()),
            self.topology.compute_workers(),
        )
    }
}

/// Multi-rank runtime entry point.
pub struct Runtime;

impl Runtime {
    /// Returns the rank index of the current driver thread (0 outside a
    /// runtime).
    pub fn rank() -> usize {
        RANK.get()
    }

    /// Spawns one driver thread per rank and runs `f` on each. Returns the
    /// per-rank results in rank order once every rank has finished.
    ///
    /// A panicking rank driver (or a worker panic surfaced by a pool drain
    /// and re-raised by the driver) turns into [`Error::WorkerPanic`].
    pub fn launch<F, T>(topology: Topology, f: F) -> Result<Vec<T>, Error>
    where
        F: Fn(RankContext) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        install_panic_hook();
        let comms = ProcessGroup::new(topology.ranks());
        debug!(
            ranks = topology.ranks(),
            workers = topology.workers(),
            "launching runtime"
        );
        let f = std::sync::Arc::new(f);
        let drivers: Vec<_> = comms
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                let f = f.clone();
                Builder::new()
                    .name(format!("h2mat-rank-{rank}"))
                    .spawn(move || {
                        RANK.set(rank);
                        (*f)(RankContext { comm, topology })
                    })
                    .unwrap_or_else(|error| {
                        panic!("failed to spawn rank driver thread {rank}: {error}");
                    })
            })
            .collect();

        let mut results = Vec::with_capacity(topology.ranks());
        let mut panic_info = Vec::new();
        for (rank, driver) in drivers.into_iter().enumerate() {
            match driver.join() {
                Ok(value) => results.push(value),
                Err(payload) => {
                    panic_info.push((rank, WorkerPanicInfo::from_payload(payload.as_ref())));
                }
            }
        }
        if panic_info.is_empty() {
            Ok(results)
        } else {
            Err(Error::WorkerPanic { panic_info })
        }
    }
}
