//! Dependency-tracked task pool.
//!
//! Each rank runs one pool of worker threads. Phases submit one task per
//! visited tree node; every task declares read or read-write intent on the
//! node(s) it touches before it can run, and becomes runnable only once every
//! previously submitted task with a conflicting intent on the same node has
//! completed (write-after-write, write-after-read, read-after-write).
//!
//! Tasks run to completion on whichever worker dequeues them; blocking
//! communication inside a task stalls only that worker. Submission happens
//! from the rank's driver thread, so the dependency bookkeeping itself is
//! single-threaded; only the ready queue and completion counters are shared
//! with workers.

use crate::error::WorkerPanicInfo;
use crossbeam::sync::{Parker, Unparker};
use hashbrown::HashMap;
use smallvec::SmallVec;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{Builder, JoinHandle};
use tracing::debug;

/// Identifier of a schedulable resource (a tree node) within one rank.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ResourceId(pub usize);

/// Declared intent of a task toward one resource.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

/// Scheduling priority. The pool picks the highest-priority runnable task;
/// ties go to submission order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

pub type TaskBody = Box<dyn FnOnce() + Send>;

/// One task pending execution.
struct TaskState {
    body: Option<TaskBody>,
    unsatisfied: usize,
    successors: SmallVec<[usize; 4]>,
    priority: Priority,
    done: bool,
}

#[derive(Eq, PartialEq)]
struct ReadyEntry {
    priority: Priority,
    seq: usize,
    id: usize,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then earliest submission.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    tasks: Vec<TaskState>,
    outstanding: usize,
    shutdown: bool,
    panics: Vec<WorkerPanicInfo>,
    // Parked workers waiting for the ready queue to fill.
    sleepers: Vec<Unparker>,
}

impl QueueState {
    fn wake_one(&mut self) {
        if let Some(unparker) = self.sleepers.pop() {
            unparker.unpark();
        }
    }

    fn wake_all(&mut self) {
        for unparker in self.sleepers.drain(..) {
            unparker.unpark();
        }
    }
}

struct PoolShared {
    state: Mutex<QueueState>,
    idle: Condvar,
}

/// Read/write history of one resource within the current phase.
#[derive(Default)]
struct History {
    writer: Option<usize>,
    readers: Vec<usize>,
}

/// The per-rank pool. Owned by the rank's driver thread; `submit` and
/// `drain` must only be called from there.
pub struct TaskPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    histories: HashMap<ResourceId, History>,
}

impl TaskPool {
    /// Starts `workers` compute threads named after `name`.
    pub fn start(name: &str, workers: usize) -> Self {
        assert!(workers >= 1);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(QueueState {
                ready: BinaryHeap::new(),
                tasks: Vec::new(),
                outstanding: 0,
                shutdown: false,
                panics: Vec::new(),
                sleepers: Vec::new(),
            }),
            idle: Condvar::new(),
        });
        let workers = (0..workers)
            .map(|index| {
                let shared = shared.clone();
                Builder::new()
                    .name(format!("{name}-worker-{index}"))
                    .spawn(move || worker_loop(&shared))
                    .unwrap_or_else(|error| {
                        panic!("failed to spawn worker thread {index}: {error}");
                    })
            })
            .collect();
        Self {
            shared,
            workers,
            histories: HashMap::new(),
        }
    }

    /// Submits a task with its declared accesses. The task becomes runnable
    /// once every conflicting predecessor of the current phase has finished.
    pub fn submit(
        &mut self,
        accesses: &[(ResourceId, Access)],
        priority: Priority,
        body: TaskBody,
    ) {
        // Dependency analysis against the phase history. Writers serialize
        // against all earlier readers and the previous writer; readers only
        // against the previous writer.
        let mut predecessors = Vec::new();
        let mut state = self.shared.state.lock().unwrap();
        let id = state.tasks.len();
        for &(resource, access) in accesses {
            let history = self.histories.entry(resource).or_default();
            match access {
                Access::Read => {
                    if let Some(writer) = history.writer {
                        predecessors.push(writer);
                    }
                    history.readers.push(id);
                }
                Access::Write => {
                    if let Some(writer) = history.writer {
                        predecessors.push(writer);
                    }
                    predecessors.append(&mut history.readers);
                    history.writer = Some(id);
                }
            }
        }
        predecessors.sort_unstable();
        predecessors.dedup();
        predecessors.retain(|&p| p != id);

        let mut unsatisfied = 0;
        for &pred in &predecessors {
            if !state.tasks[pred].done {
                state.tasks[pred].successors.push(id);
                unsatisfied += 1;
            }
        }
        state.tasks.push(TaskState {
            body: Some(body),
            unsatisfied,
            successors: SmallVec::new(),
            priority,
            done: false,
        });
        state.outstanding += 1;
        if unsatisfied == 0 {
            state.ready.push(ReadyEntry {
                priority,
                seq: id,
                id,
            });
            state.wake_one();
        }
        drop(state);
    }

    /// Phase barrier: blocks until every submitted task has completed, then
    /// clears the recorded dependency edges so the next phase starts from a
    /// clean slate. Reports panics captured from workers during the phase.
    pub fn drain(&mut self) -> Result<(), Vec<WorkerPanicInfo>> {
        let mut state = self.shared.state.lock().unwrap();
        while state.outstanding > 0 {
            state = self.shared.idle.wait(state).unwrap();
        }
        state.tasks.clear();
        let panics = std::mem::take(&mut state.panics);
        drop(state);
        self.histories.clear();
        if panics.is_empty() {
            Ok(())
        } else {
            Err(panics)
        }
    }

    /// Number of tasks submitted and not yet completed.
    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().unwrap().outstanding
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            state.wake_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    // Workers release the CPU by parking when they have no work to do;
    // submission and task completion unpark them.
    let parker = Parker::new();
    loop {
        let (id, body) = loop {
            let mut state = shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            if let Some(entry) = state.ready.pop() {
                let body = state.tasks[entry.id]
                    .body
                    .take()
                    .expect("ready task has no body");
                break (entry.id, body);
            }
            state.sleepers.push(parker.unparker().clone());
            drop(state);
            parker.park();
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(body));

        let mut state = shared.state.lock().unwrap();
        if let Err(payload) = outcome {
            debug!("worker captured a task panic");
            state.panics.push(WorkerPanicInfo::from_payload(payload.as_ref()));
        }
        state.tasks[id].done = true;
        let successors = std::mem::take(&mut state.tasks[id].successors);
        for succ in successors {
            state.tasks[succ].unsatisfied -= 1;
            if state.tasks[succ].unsatisfied == 0 {
                let entry = ReadyEntry {
                    priority: state.tasks[succ].priority,
                    seq: succ,
                    id: succ,
                };
                state.ready.push(entry);
                state.wake_one();
            }
        }
        state.outstanding -= 1;
        if state.outstanding == 0 {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn writers_serialize_against_readers_and_writers() {
        let mut pool = TaskPool::start("test", 4);
        let node = ResourceId(0);
        let log = Arc::new(Mutex::new(Vec::new()));

        // writer, two readers, writer: the second writer must observe both
        // reads; the readers must observe the first write.
        for (label, access) in [
            ("w1", Access::Write),
            ("r1", Access::Read),
            ("r2", Access::Read),
            ("w2", Access::Write),
        ] {
            let log = log.clone();
            pool.submit(
                &[(node, access)],
                Priority::Normal,
                Box::new(move || log.lock().unwrap().push(label)),
            );
        }
        pool.drain().unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log[0], "w1");
        assert_eq!(log[3], "w2");
    }

    #[test]
    fn independent_tasks_run_concurrently() {
        let mut pool = TaskPool::start("test", 4);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let running = running.clone();
            let peak = peak.clone();
            pool.submit(
                &[(ResourceId(i), Access::Write)],
                Priority::Normal,
                Box::new(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                }),
            );
        }
        pool.drain().unwrap();
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn drain_clears_dependencies_between_phases() {
        let mut pool = TaskPool::start("test", 2);
        let node = ResourceId(7);
        pool.submit(&[(node, Access::Write)], Priority::Normal, Box::new(|| {}));
        pool.drain().unwrap();
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.histories.is_empty());
        // A task in the next phase has no predecessor from the previous one.
        pool.submit(&[(node, Access::Write)], Priority::Normal, Box::new(|| {}));
        {
            let state = pool.shared.state.lock().unwrap();
            assert_eq!(state.tasks.len(), 1);
            assert_eq!(state.tasks[0].unsatisfied, 0);
        }
        pool.drain().unwrap();
    }

    #[test]
    fn task_panic_is_reported_at_drain() {
        let mut pool = TaskPool::start("test", 2);
        pool.submit(
            &[(ResourceId(0), Access::Write)],
            Priority::Normal,
            Box::new(|| panic!("boom")),
        );
        pool.submit(&[(ResourceId(1), Access::Write)], Priority::Normal, Box::new(|| {}));
        let panics = pool.drain().unwrap_err();
        assert_eq!(panics.len(), 1);
        assert!(panics[0].message.as_deref().unwrap_or("").contains("boom"));
        // The pool stays usable for the next phase.
        pool.submit(&[(ResourceId(0), Access::Write)], Priority::Normal, Box::new(|| {}));
        pool.drain().unwrap();
    }
}
