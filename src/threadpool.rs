//! Named thread pools: READ (parallel scan fan-out), DROP (background
//! WAL→Page conversion and compaction), COMMON (everything else).
//!
//! Submitted tasks carry the pool kind they were built for; each worker
//! asserts it against its own pool kind before running the job, to catch a
//! task accidentally routed to the wrong pool.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Read,
    Drop,
    Common,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    kind: PoolKind,
    job: Job,
    done: Sender<()>,
}

/// A handle to a submitted task. Dropping it without calling `wait` simply
/// abandons the completion signal; the task still runs to completion.
pub struct TaskHandle {
    done: Receiver<()>,
}

impl TaskHandle {
    pub fn wait(self) {
        let _ = self.done.recv();
    }
}

struct Pool {
    kind: PoolKind,
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    fn new(kind: PoolKind, capacity: usize) -> Self {
        let (sender, receiver) = unbounded::<Task>();
        let workers = (0..capacity.max(1))
            .map(|_| {
                let receiver: Receiver<Task> = receiver.clone();
                std::thread::spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        debug_assert_eq!(task.kind, kind, "task routed to the wrong pool");
                        (task.job)();
                        let _ = task.done.send(());
                    }
                })
            })
            .collect();
        Self { kind, sender: Some(sender), workers }
    }

    fn submit(&self, job: Job) -> TaskHandle {
        let (done_tx, done_rx) = bounded(1);
        let task = Task { kind: self.kind, job, done: done_tx };
        self.sender.as_ref().expect("pool sender dropped before shutdown").send(task).ok();
        TaskHandle { done: done_rx }
    }

    fn shutdown(mut self) {
        self.sender.take();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

/// Owns the three named pools for the lifetime of an open engine.
pub struct ThreadManager {
    read: Pool,
    drop_pool: Pool,
    common: Pool,
}

impl ThreadManager {
    #[must_use]
    pub fn new(read_capacity: usize, drop_capacity: usize, common_capacity: usize) -> Self {
        Self {
            read: Pool::new(PoolKind::Read, read_capacity),
            drop_pool: Pool::new(PoolKind::Drop, drop_capacity),
            common: Pool::new(PoolKind::Common, common_capacity),
        }
    }

    pub fn submit(&self, kind: PoolKind, job: impl FnOnce() + Send + 'static) -> TaskHandle {
        match kind {
            PoolKind::Read => self.read.submit(Box::new(job)),
            PoolKind::Drop => self.drop_pool.submit(Box::new(job)),
            PoolKind::Common => self.common.submit(Box::new(job)),
        }
    }

    /// Stop accepting new work and block until every worker thread exits.
    /// Any task already in a pool's queue still runs before its worker
    /// stops; callers that need a drain barrier should `wait()` every
    /// handle before calling this.
    pub fn shutdown(self) {
        self.read.shutdown();
        self.drop_pool.shutdown();
        self.common.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn submitted_tasks_all_run() {
        let mgr = ThreadManager::new(2, 1, 1);
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let counter = counter.clone();
            handles.push(mgr.submit(PoolKind::Read, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.wait();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn distinct_pools_run_concurrently() {
        let mgr = ThreadManager::new(1, 1, 1);
        let read_done = mgr.submit(PoolKind::Read, || std::thread::sleep(std::time::Duration::from_millis(20)));
        let drop_done = mgr.submit(PoolKind::Drop, || ());
        drop_done.wait();
        read_done.wait();
    }
}
