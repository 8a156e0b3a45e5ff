//! Deferred execution for retry delays.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

type Task = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    /// Tie-breaker so equal deadlines run in submission order
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Inverted so the BinaryHeap pops the earliest deadline first
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    queue: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
}

/// One-shot deferred task executor backing message retries.
///
/// Per-engine, not process-global: dropping the engine joins the worker so
/// teardown leaves nothing behind. Pending tasks are discarded on shutdown;
/// a retry that never runs is indistinguishable from one cancelled by
/// `close`.
pub(crate) struct TaskScheduler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl TaskScheduler {
    pub(crate) fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            condvar: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("transport-scheduler".into())
            .spawn(move || run_worker(&worker_shared))
            .expect("failed to spawn the scheduler worker thread");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Runs `task` on the worker thread once `delay` has elapsed
    pub(crate) fn schedule(&self, delay: Duration, task: Task) {
        let deadline = Instant::now() + delay;
        let mut state = self.shared.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Entry {
            deadline,
            seq,
            task,
        });
        trace!(?delay, seq, "task scheduled");
        self.shared.condvar.notify_one();
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.condvar.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        match state.queue.peek().map(|entry| entry.deadline) {
            None => {
                shared.condvar.wait(&mut state);
            }
            Some(deadline) if deadline <= Instant::now() => {
                let entry = state.queue.pop().expect("peeked entry is present");
                drop(state);
                (entry.task)();
                state = shared.state.lock();
            }
            Some(deadline) => {
                let _ = shared.condvar.wait_until(&mut state, deadline);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn runs_a_scheduled_task() {
        let scheduler = TaskScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let observed = ran.clone();
        scheduler.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                observed.fetch_add(1, Ordering::SeqCst);
            }),
        );
        thread::sleep(Duration::from_millis(100));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tasks_run_in_deadline_order() {
        let scheduler = TaskScheduler::new();
        let order = Arc::new(StdMutex::new(Vec::new()));
        for (label, delay) in [("slow", 60u64), ("fast", 10), ("medium", 30)] {
            let order = order.clone();
            scheduler.schedule(
                Duration::from_millis(delay),
                Box::new(move || order.lock().unwrap().push(label)),
            );
        }
        thread::sleep(Duration::from_millis(200));
        assert_eq!(*order.lock().unwrap(), vec!["fast", "medium", "slow"]);
    }

    #[test]
    fn drop_discards_pending_tasks() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let scheduler = TaskScheduler::new();
            let observed = ran.clone();
            scheduler.schedule(
                Duration::from_secs(60),
                Box::new(move || {
                    observed.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
