//! Kernel/operator collaborators.
//!
//! The engine never forms the full matrix; it consumes the operator through
//! a narrow interface: single entries, dense sub-blocks, diagonals, a
//! redistribution hook invoked when tree partitioning moves index ownership,
//! and a background request-servicing loop that answers other ranks' block
//! requests while local computation proceeds.
//!
//! The request server runs on the reserved worker slice of each rank. Every
//! phase that can touch remote rows must run while the server is up;
//! omitting the reservation risks deadlock when every compute worker blocks
//! on a remote request no thread is left to answer (which is why fewer than
//! two workers per rank is rejected at configuration time).

use crate::comm::Communicator;
use crate::tags;
use crate::Gid;
use faer::Mat;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{Builder, JoinHandle};
use tracing::debug;

/// A set of points in `dim`-dimensional space, one contiguous slice per
/// point. Operators that know their geometry expose it for the geometric
/// distance metric.
#[derive(Clone, Debug)]
pub struct PointSet {
    dim: usize,
    coords: Vec<f64>,
}

impl PointSet {
    pub fn new(dim: usize, coords: Vec<f64>) -> Self {
        assert!(dim > 0);
        assert_eq!(coords.len() % dim, 0);
        Self { dim, coords }
    }

    pub fn len(&self) -> usize {
        self.coords.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn point(&self, i: Gid) -> &[f64] {
        &self.coords[i * self.dim..(i + 1) * self.dim]
    }

    /// Squared Euclidean distance between two points.
    pub fn dist2(&self, i: Gid, j: Gid) -> f64 {
        self.point(i)
            .iter()
            .zip(self.point(j))
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

/// The symmetric operator being compressed.
///
/// `entry` and `local_block` must be answerable from data this rank already
/// holds; `block` may additionally fetch remote rows through the
/// communicator and is the method the engine uses whenever row indices are
/// not guaranteed local.
pub trait KernelOperator: Send + Sync {
    /// Number of rows/columns.
    fn size(&self) -> usize;

    /// One entry `K(i, j)`. Row `i` must be locally answerable.
    fn entry(&self, i: Gid, j: Gid) -> f64;

    /// Dense sub-block from locally held data, row-major `rows × cols`.
    fn local_block(&self, rows: &[Gid], cols: &[Gid]) -> Vec<f64> {
        let mut out = Vec::with_capacity(rows.len() * cols.len());
        for &i in rows {
            for &j in cols {
                out.push(self.entry(i, j));
            }
        }
        out
    }

    /// Dense sub-block `K(rows, cols)`, fetching remote rows if needed.
    fn block(&self, rows: &[Gid], cols: &[Gid]) -> Mat<f64> {
        let data = self.local_block(rows, cols);
        Mat::from_fn(rows.len(), cols.len(), |i, j| data[i * cols.len() + j])
    }

    /// Diagonal entries `K(id, id)` for each id.
    fn diagonal(&self, ids: &[Gid]) -> Vec<f64> {
        ids.iter().map(|&i| self.entry(i, i)).collect()
    }

    /// Point geometry, if the operator has any.
    fn geometry(&self) -> Option<&PointSet> {
        None
    }

    /// Invoked by the tree when a pairwise exchange moves index ownership
    /// between this rank and `partner`: rows of `sent` leave this rank, rows
    /// of `received` arrive. Replicated operators ignore this.
    fn redistribute(
        &self,
        _comm: &Communicator,
        _partner: usize,
        _sent: &[Gid],
        _received: &[Gid],
    ) {
    }

    /// Records the final gid→rank ownership once tree construction is done,
    /// enabling remote block routing. Replicated operators ignore this.
    fn finalize_ownership(&self, _owner_of_gid: Arc<Vec<u32>>) {}

    /// Returns every row to its round-robin home (`gid mod P`), undoing the
    /// moves of a scratch partition so the next partition starts from the
    /// initial distribution. Replicated operators ignore this.
    fn reset_distribution(&self, _comm: &Communicator) {}
}

/// An explicitly stored symmetric matrix, replicated on every rank.
pub struct DenseKernel {
    data: Mat<f64>,
}

impl DenseKernel {
    pub fn new(data: Mat<f64>) -> Self {
        assert_eq!(data.nrows(), data.ncols());
        Self { data }
    }
}

impl KernelOperator for DenseKernel {
    fn size(&self) -> usize {
        self.data.nrows()
    }

    fn entry(&self, i: Gid, j: Gid) -> f64 {
        self.data[(i, j)]
    }
}

/// Gaussian kernel `exp(-|x_i - x_j|^2 / (2 h^2))` over a replicated point
/// set.
pub struct GaussianKernel {
    points: PointSet,
    bandwidth: f64,
}

impl GaussianKernel {
    pub fn new(points: PointSet, bandwidth: f64) -> Self {
        assert!(bandwidth > 0.0);
        Self { points, bandwidth }
    }
}

impl KernelOperator for GaussianKernel {
    fn size(&self) -> usize {
        self.points.len()
    }

    fn entry(&self, i: Gid, j: Gid) -> f64 {
        (-self.points.dist2(i, j) / (2.0 * self.bandwidth * self.bandwidth)).exp()
    }

    fn geometry(&self) -> Option<&PointSet> {
        Some(&self.points)
    }
}

/// Request protocol between ranks: a block of whole-row slices, answered by
/// the owner's server loop.
enum BlockRequest {
    Rows {
        reply_seq: u64,
        rows: Vec<Gid>,
        cols: Vec<Gid>,
    },
    Shutdown,
}

/// A symmetric operator whose rows are partitioned across ranks and follow
/// tree ownership: after every split this rank stores exactly the rows of
/// the indices it currently owns. Blocks with remote rows are assembled by
/// asking each owner's request server.
pub struct RowPartitionedKernel {
    n: usize,
    comm: Communicator,
    rows: RwLock<hashbrown::HashMap<Gid, Arc<Vec<f64>>>>,
    owner: RwLock<Option<Arc<Vec<u32>>>>,
    next_seq: AtomicU64,
}

impl RowPartitionedKernel {
    /// Builds the adapter from a generator of full rows, keeping only the
    /// rows of `owned` (this rank's initial round-robin share).
    pub fn new<F>(n: usize, owned: &[Gid], comm: Communicator, row: F) -> Self
    where
        F: Fn(Gid) -> Vec<f64>,
    {
        let mut rows = hashbrown::HashMap::new();
        for &gid in owned {
            let data = row(gid);
            assert_eq!(data.len(), n);
            rows.insert(gid, Arc::new(data));
        }
        Self {
            n,
            comm,
            rows: RwLock::new(rows),
            owner: RwLock::new(None),
            next_seq: AtomicU64::new(0),
        }
    }

    fn row(&self, gid: Gid) -> Arc<Vec<f64>> {
        self.rows
            .read()
            .unwrap()
            .get(&gid)
            .unwrap_or_else(|| panic!("row {gid} is not held by rank {}", self.comm.world_rank()))
            .clone()
    }

    fn owner_of(&self, gid: Gid) -> Option<usize> {
        self.owner
            .read()
            .unwrap()
            .as_ref()
            .map(|owner| owner[gid] as usize)
    }
}

impl KernelOperator for RowPartitionedKernel {
    fn size(&self) -> usize {
        self.n
    }

    fn entry(&self, i: Gid, j: Gid) -> f64 {
        self.row(i)[j]
    }

    fn block(&self, rows: &[Gid], cols: &[Gid]) -> Mat<f64> {
        let held = self.rows.read().unwrap();
        let mut remote: Vec<Gid> = rows
            .iter()
            .copied()
            .filter(|gid| !held.contains_key(gid))
            .collect();
        drop(held);
        remote.sort_unstable();
        remote.dedup();

        let mut fetched: hashbrown::HashMap<Gid, Vec<f64>> = hashbrown::HashMap::new();
        if !remote.is_empty() {
            // Group missing rows by owner and ask each owner's server.
            let mut by_owner: hashbrown::HashMap<usize, Vec<Gid>> = hashbrown::HashMap::new();
            for gid in remote {
                let owner = self
                    .owner_of(gid)
                    .expect("remote row requested before ownership was finalized");
                by_owner.entry(owner).or_default().push(gid);
            }
            let mut in_flight = Vec::new();
            for (owner, gids) in by_owner {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                self.comm.send_world(
                    owner,
                    tags::KERNEL_REQUEST,
                    BlockRequest::Rows {
                        reply_seq: seq,
                        rows: gids.clone(),
                        cols: cols.to_vec(),
                    },
                );
                in_flight.push((owner, seq, gids));
            }
            for (owner, seq, gids) in in_flight {
                let data: Vec<f64> = self.comm.recv_world(owner, tags::KERNEL_REPLY.seq(seq));
                for (k, gid) in gids.iter().enumerate() {
                    fetched.insert(*gid, data[k * cols.len()..(k + 1) * cols.len()].to_vec());
                }
            }
        }

        let held = self.rows.read().unwrap();
        Mat::from_fn(rows.len(), cols.len(), |i, j| {
            if let Some(row) = held.get(&rows[i]) {
                row[cols[j]]
            } else {
                fetched[&rows[i]][j]
            }
        })
    }

    fn redistribute(&self, comm: &Communicator, partner: usize, sent: &[Gid], received: &[Gid]) {
        let outgoing: Vec<(Gid, Vec<f64>)> = {
            let mut rows = self.rows.write().unwrap();
            sent.iter()
                .map(|gid| {
                    let row = rows.remove(gid).expect("redistributing a row not held");
                    (*gid, Arc::try_unwrap(row).unwrap_or_else(|arc| (*arc).clone()))
                })
                .collect()
        };
        let incoming: Vec<(Gid, Vec<f64>)> =
            comm.sendrecv(partner, tags::KERNEL_REDISTRIBUTE, outgoing);
        let mut rows = self.rows.write().unwrap();
        for (gid, row) in incoming {
            debug_assert!(received.contains(&gid));
            rows.insert(gid, Arc::new(row));
        }
    }

    fn finalize_ownership(&self, owner_of_gid: Arc<Vec<u32>>) {
        *self.owner.write().unwrap() = Some(owner_of_gid);
    }

    fn reset_distribution(&self, comm: &Communicator) {
        let ranks = comm.world_size();
        let rank = comm.world_rank();
        let mut sends: Vec<Vec<(Gid, Vec<f64>)>> = vec![Vec::new(); ranks];
        {
            let mut rows = self.rows.write().unwrap();
            let moving: Vec<Gid> = rows.keys().copied().filter(|gid| gid % ranks != rank).collect();
            for gid in moving {
                let row = rows.remove(&gid).unwrap();
                sends[gid % ranks]
                    .push((gid, Arc::try_unwrap(row).unwrap_or_else(|arc| (*arc).clone())));
            }
        }
        let received = comm.alltoallv(tags::KERNEL_RESET, sends);
        let mut rows = self.rows.write().unwrap();
        for (gid, row) in received.into_iter().flatten() {
            rows.insert(gid, Arc::new(row));
        }
        *self.owner.write().unwrap() = None;
    }
}

/// Handle of one rank's request-servicing loop.
pub struct KernelServer {
    thread: Option<JoinHandle<()>>,
    comm: Communicator,
}

impl KernelServer {
    /// Spawns the server on its own reserved thread. It answers
    /// [`BlockRequest`]s from any rank until shut down.
    pub fn spawn(operator: Arc<dyn KernelOperator>, comm: Communicator) -> Self {
        let loop_comm = comm.clone();
        let thread = Builder::new()
            .name(format!("h2mat-{}-server", comm.world_rank()))
            .spawn(move || {
                loop {
                    let (src, request) = loop_comm.recv_any::<BlockRequest>(tags::KERNEL_REQUEST);
                    match request {
                        BlockRequest::Shutdown => break,
                        BlockRequest::Rows {
                            reply_seq,
                            rows,
                            cols,
                        } => {
                            let data = operator.local_block(&rows, &cols);
                            loop_comm.send_world(src, tags::KERNEL_REPLY.seq(reply_seq), data);
                        }
                    }
                }
                debug!("request server stopped");
            })
            .expect("failed to spawn request server thread");
        Self {
            thread: Some(thread),
            comm,
        }
    }

    /// Stops the loop and joins the server thread.
    pub fn shutdown(mut self) {
        self.comm.send_world(
            self.comm.world_rank(),
            tags::KERNEL_REQUEST,
            BlockRequest::Shutdown,
        );
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{ProcessGroup, Tag};
    use std::thread;

    fn laplace_row(n: usize, i: Gid) -> Vec<f64> {
        (0..n)
            .map(|j| if i == j { 2.0 } else { -1.0 / (1.0 + (i as f64 - j as f64).abs()) })
            .collect()
    }

    #[test]
    fn dense_kernel_blocks_match_entries() {
        let n = 8;
        let data = Mat::from_fn(n, n, |i, j| laplace_row(n, i)[j]);
        let kernel = DenseKernel::new(data);
        let block = kernel.block(&[1, 3], &[0, 2, 7]);
        assert_eq!(block.nrows(), 2);
        assert_eq!(block[(0, 1)], kernel.entry(1, 2));
        assert_eq!(block[(1, 2)], kernel.entry(3, 7));
        assert_eq!(kernel.diagonal(&[0, 5]), vec![2.0, 2.0]);
    }

    #[test]
    fn row_partitioned_kernel_serves_remote_blocks() {
        let n = 16;
        let comms = ProcessGroup::new(2);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.world_rank();
                    let owned: Vec<Gid> = (0..n).filter(|gid| gid % 2 == rank).collect();
                    let kernel = Arc::new(RowPartitionedKernel::new(
                        n,
                        &owned,
                        comm.clone(),
                        |gid| laplace_row(n, gid),
                    ));
                    let owner: Vec<u32> = (0..n).map(|gid| (gid % 2) as u32).collect();
                    kernel.finalize_ownership(Arc::new(owner));
                    let server = KernelServer::spawn(kernel.clone(), comm.clone());

                    // Rows 2 and 3 live on different ranks; both blocks must
                    // come back correct regardless of who asks.
                    let block = kernel.block(&[2, 3], &[0, 5]);
                    comm.barrier(Tag::test(20));
                    server.shutdown();
                    assert_eq!(block[(0, 0)], laplace_row(n, 2)[0]);
                    assert_eq!(block[(1, 1)], laplace_row(n, 3)[5]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn redistribution_moves_rows_between_partners() {
        let n = 8;
        let comms = ProcessGroup::new(2);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.world_rank();
                    let owned: Vec<Gid> = (0..n).filter(|gid| gid % 2 == rank).collect();
                    let kernel =
                        RowPartitionedKernel::new(n, &owned, comm.clone(), |gid| laplace_row(n, gid));
                    // Rank 0 gives away its odd-indexed share of evens; rank 1
                    // mirrors. After the exchange each rank holds the rows it
                    // received.
                    let sent: Vec<Gid> = owned.iter().copied().filter(|&g| g >= 4).collect();
                    let received: Vec<Gid> = (4..n).filter(|gid| gid % 2 != rank).collect();
                    kernel.redistribute(&comm, rank ^ 1, &sent, &received);
                    for &gid in &received {
                        assert_eq!(kernel.entry(gid, 0), laplace_row(n, gid)[0]);
                    }
                    for &gid in &sent {
                        assert!(!kernel.rows.read().unwrap().contains_key(&gid));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
