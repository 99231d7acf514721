//! Message-passing substrate for a group of share-nothing ranks.
//!
//! A compression run executes on a [`ProcessGroup`] of `P` ranks. Ranks never
//! share mutable state; everything that crosses a rank boundary goes through
//! a [`Communicator`], which offers MPI-shaped point-to-point and collective
//! operations (pairwise exchange, broadcast, reductions, all-to-all, barrier)
//! plus the communicator-halving used by distributed tree construction.
//!
//! The transport is in-process: each rank owns a mailbox, and payloads move
//! as boxed values rather than serialized bytes. The protocol is still
//! strictly message-passing, so the calling code is structured exactly as it
//! would be over a wire transport.
//!
//! All operations are blocking and synchronous. A collective that never
//! completes because a peer did not participate is a deadlock to diagnose,
//! not a timeout to recover from.

mod mailbox;

pub use mailbox::Tag;

use mailbox::{Envelope, Mailbox};
use std::sync::Arc;

/// One process group: the set of mailboxes shared by all ranks of a run.
pub struct ProcessGroup;

impl ProcessGroup {
    /// Creates a group of `ranks` mailboxes and returns the world
    /// communicator of every rank.
    pub fn new(ranks: usize) -> Vec<Communicator> {
        assert!(ranks.is_power_of_two());
        let mailboxes = Arc::new((0..ranks).map(|_| Mailbox::new()).collect::<Vec<_>>());
        (0..ranks)
            .map(|rank| Communicator {
                mailboxes: mailboxes.clone(),
                world_rank: rank,
                base: 0,
                size: ranks,
            })
            .collect()
    }
}

/// A view of a contiguous half-open range of ranks cooperating on one
/// distributed tree node. The world communicator spans the whole group;
/// [`Communicator::halve`] produces the child communicator of the half this
/// rank falls into.
#[derive(Clone)]
pub struct Communicator {
    mailboxes: Arc<Vec<Mailbox>>,
    world_rank: usize,
    base: usize,
    size: usize,
}

impl Communicator {
    /// Rank of the caller within this communicator.
    pub fn rank(&self) -> usize {
        self.world_rank - self.base
    }

    /// Number of ranks in this communicator.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Rank of the caller within the whole group.
    pub fn world_rank(&self) -> usize {
        self.world_rank
    }

    /// Number of ranks in the whole group.
    pub fn world_size(&self) -> usize {
        self.mailboxes.len()
    }

    /// `true` once the halving recursion has reached a single rank.
    pub fn is_solo(&self) -> bool {
        self.size == 1
    }

    /// The half of this communicator that contains the caller. Returns the
    /// child communicator and whether the caller landed in the upper half.
    pub fn halve(&self) -> (Communicator, bool) {
        debug_assert!(self.size >= 2);
        let half = self.size / 2;
        let upper = self.rank() >= half;
        let child = Communicator {
            mailboxes: self.mailboxes.clone(),
            world_rank: self.world_rank,
            base: if upper { self.base + half } else { self.base },
            size: half,
        };
        (child, upper)
    }

    /// The partner rank for the pairwise exchange at this communicator's
    /// level: own rank with the high bit flipped.
    pub fn partner(&self) -> usize {
        self.rank() ^ (self.size / 2)
    }

    /// The single-rank communicator containing only the caller. Collectives
    /// on it degenerate to their local meaning, which is how single-process
    /// variants share code with the distributed ones.
    pub fn solo(&self) -> Communicator {
        Communicator {
            mailboxes: self.mailboxes.clone(),
            world_rank: self.world_rank,
            base: self.world_rank,
            size: 1,
        }
    }

    fn world_of(&self, rank: usize) -> usize {
        debug_assert!(rank < self.size);
        self.base + rank
    }

    /// Sends `value` to `dest` (communicator-local rank). Never blocks.
    pub fn send<T: Send + 'static>(&self, dest: usize, tag: Tag, value: T) {
        self.mailboxes[self.world_of(dest)].push(Envelope::new(self.world_rank, tag, value));
    }

    /// Receives the value sent by `src` (communicator-local rank) with `tag`,
    /// blocking until it arrives.
    pub fn recv<T: Send + 'static>(&self, src: usize, tag: Tag) -> T {
        self.mailboxes[self.world_rank].take(self.world_of(src), tag)
    }

    /// Receives a message with `tag` from any rank of the whole group.
    /// Returns the sender's world rank. Used by the request-servicing loop.
    pub fn recv_any<T: Send + 'static>(&self, tag: Tag) -> (usize, T) {
        self.mailboxes[self.world_rank].take_any(tag)
    }

    /// Sends a message to a world rank directly, bypassing this
    /// communicator's range. Used to route requests to data owners.
    pub fn send_world<T: Send + 'static>(&self, dest: usize, tag: Tag, value: T) {
        self.mailboxes[dest].push(Envelope::new(self.world_rank, tag, value));
    }

    /// Receives from a world rank directly.
    pub fn recv_world<T: Send + 'static>(&self, src: usize, tag: Tag) -> T {
        self.mailboxes[self.world_rank].take(src, tag)
    }

    /// Symmetric pairwise exchange with `partner`.
    pub fn sendrecv<T: Send + 'static>(&self, partner: usize, tag: Tag, value: T) -> T {
        self.send(partner, tag, value);
        self.recv(partner, tag)
    }

    /// Broadcast from `root`: the root passes `Some(value)`, everyone else
    /// `None`, and every rank returns the root's value.
    pub fn broadcast<T: Clone + Send + 'static>(
        &self,
        root: usize,
        tag: Tag,
        value: Option<T>,
    ) -> T {
        if self.rank() == root {
            let value = value.expect("broadcast root must supply a value");
            for rank in 0..self.size {
                if rank != root {
                    self.send(rank, tag, value.clone());
                }
            }
            value
        } else {
            self.recv(root, tag)
        }
    }

    /// Reduces every rank's value onto rank 0 with `op`. Non-roots return
    /// `None`. The reduction is applied in rank order, so non-commutative
    /// `op`s still produce the same result on every run.
    pub fn reduce<T, F>(&self, tag: Tag, value: T, op: F) -> Option<T>
    where
        T: Send + 'static,
        F: Fn(T, T) -> T,
    {
        if self.rank() == 0 {
            let mut acc = value;
            for rank in 1..self.size {
                acc = op(acc, self.recv(rank, tag));
            }
            Some(acc)
        } else {
            self.send(0, tag, value);
            None
        }
    }

    /// Reduces with `op` and broadcasts the result to every rank.
    pub fn allreduce<T, F>(&self, tag: Tag, value: T, op: F) -> T
    where
        T: Clone + Send + 'static,
        F: Fn(T, T) -> T,
    {
        let reduced = self.reduce(tag, value, op);
        self.broadcast(0, tag.next(), reduced)
    }

    /// Max-reduction keyed by `(value, rank)`: returns the global maximum and
    /// the communicator-local rank holding it, ties broken by lowest rank.
    pub fn allreduce_max_loc(&self, tag: Tag, value: f64) -> (f64, usize) {
        self.allreduce(tag, (value, self.rank()), |a, b| {
            if b.0 > a.0 || (b.0 == a.0 && b.1 < a.1) {
                b
            } else {
                a
            }
        })
    }

    /// Every rank contributes a vector; every rank receives all vectors
    /// concatenated in rank order.
    pub fn allgatherv<T: Clone + Send + 'static>(&self, tag: Tag, local: Vec<T>) -> Vec<T> {
        let parts = self.allreduce(tag, vec![local], |mut a, mut b| {
            a.append(&mut b);
            a
        });
        parts.into_iter().flatten().collect()
    }

    /// Personalized all-to-all: `sends[r]` goes to rank `r`; the result's
    /// `r`-th entry is what rank `r` sent here.
    pub fn alltoallv<T: Send + 'static>(&self, tag: Tag, mut sends: Vec<Vec<T>>) -> Vec<Vec<T>> {
        debug_assert_eq!(sends.len(), self.size);
        for (rank, payload) in sends.drain(..).enumerate().rev() {
            self.send(rank, tag, payload);
        }
        (0..self.size).map(|rank| self.recv(rank, tag)).collect()
    }

    /// Blocks until every rank of this communicator has arrived.
    pub fn barrier(&self, tag: Tag) {
        self.allreduce(tag, (), |(), ()| ());
    }
}
