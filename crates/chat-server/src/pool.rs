use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use chat_utils::{ThreadPriority, thread_boot};
use tracing::{debug, info};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// How a shutdown disposes of jobs still sitting in the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Run every already-queued job before any worker exits.
    Drain,
    /// Discard whatever is queued and let workers exit as soon as they
    /// observe the terminate flag.
    Discard,
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    not_empty: Condvar,
    /// Signalled whenever the queue becomes empty, so `wait_idle` can block
    /// without polling.
    drained: Condvar,
    terminate: AtomicBool,
    shutdown_mode: Mutex<Option<ShutdownMode>>,
}

/// A fixed-size pool of worker threads pulling jobs off a shared FIFO queue.
///
/// Each worker is booted through `chat_utils::thread_boot` (affinity pinning
/// plus optional realtime priority). The queue itself is a plain
/// `Mutex<VecDeque>` rather than a shared-memory ring buffer, since this pool
/// is strictly in-process and has no cross-process producers or consumers to
/// support.
pub struct WorkerPool {
    shared: Arc<Shared>,
    /// Held behind a mutex, rather than requiring `self` by value, so a
    /// pool shared via `Arc<WorkerPool>` across the dispatcher and every
    /// `TaskArgs` can still be joined from a single call site at shutdown.
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `size` worker threads, each booted via `chat_utils::thread_boot`
    /// with `prio` and, if `pin_cores` is true, pinned round-robin across
    /// available cores.
    pub fn new(size: usize, prio: ThreadPriority, pin_cores: bool) -> Self {
        assert!(size > 0, "worker pool size must be positive");
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            drained: Condvar::new(),
            terminate: AtomicBool::new(false),
            shutdown_mode: Mutex::new(None),
        });

        let available_cores = core_affinity::get_core_ids().unwrap_or_default();
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let shared = shared.clone();
            let core = if pin_cores && !available_cores.is_empty() {
                Some(available_cores[i % available_cores.len()].id)
            } else {
                None
            };
            let handle = std::thread::Builder::new()
                .name(format!("chat-worker-{i}"))
                .spawn(move || worker_loop(shared, core, prio))
                .expect("spawning a worker thread should not fail");
            workers.push(handle);
        }

        info!(size, "worker pool started");
        Self { shared, workers: Mutex::new(workers) }
    }

    /// Enqueues `job`, waking one idle worker. Accepted even while a
    /// `Discard` shutdown is underway (the job simply never runs); rejected
    /// silently is not an option here because callers (the dispatcher) must
    /// not block, so this never fails — it always succeeds at queuing.
    pub fn submit(&self, job: Job) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(job);
        self.shared.not_empty.notify_one();
    }

    /// Number of jobs still sitting in the queue (not counting ones a
    /// worker has already pulled off and is running).
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Blocks until the queue is empty. Used by tests and by a graceful
    /// shutdown that wants every already-submitted job observed before
    /// tearing down.
    pub fn wait_idle(&self) {
        let queue = self.shared.queue.lock().unwrap();
        let _unused = self
            .shared
            .drained
            .wait_while(queue, |q| !q.is_empty())
            .unwrap();
    }

    /// Begins shutdown: sets the terminate flag and, for `Discard`, clears
    /// the queue immediately so no further jobs run. Wakes every worker so
    /// they can observe the new state. Does not block; call `join` after
    /// this to wait for worker threads to exit.
    pub fn shutdown(&self, mode: ShutdownMode) {
        *self.shared.shutdown_mode.lock().unwrap() = Some(mode);
        self.shared.terminate.store(true, Ordering::Release);
        if mode == ShutdownMode::Discard {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.clear();
            self.shared.drained.notify_all();
        }
        self.shared.not_empty.notify_all();
    }

    /// Waits for every worker thread to exit. Takes the handles out under
    /// the lock so this can be called through a shared `Arc<WorkerPool>`;
    /// idempotent (a second call finds an empty handle list and returns
    /// immediately). Call after `shutdown`.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        debug!("worker pool joined");
    }
}

fn worker_loop(shared: Arc<Shared>, core: Option<usize>, prio: ThreadPriority) {
    thread_boot(core, prio);
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.pop_front() {
                    if queue.is_empty() {
                        shared.drained.notify_all();
                    }
                    break Some(job);
                }
                if shared.terminate.load(Ordering::Acquire) {
                    break None;
                }
                queue = shared.not_empty.wait(queue).unwrap();
            }
        };

        match job {
            Some(job) => job(),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn submitted_jobs_run() {
        let pool = WorkerPool::new(2, ThreadPriority::OSDefault, false);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.wait_idle();
        std::thread::sleep(Duration::from_millis(20));
        pool.shutdown(ShutdownMode::Drain);
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn discard_shutdown_drops_unqueued_work() {
        let pool = WorkerPool::new(1, ThreadPriority::OSDefault, false);
        let block = Arc::new((Mutex::new(true), Condvar::new()));
        {
            let block = block.clone();
            pool.submit(Box::new(move || {
                let (lock, cvar) = &*block;
                let mut held = lock.lock().unwrap();
                while *held {
                    held = cvar.wait(held).unwrap();
                }
            }));
        }
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown(ShutdownMode::Discard);
        {
            let (lock, cvar) = &*block;
            *lock.lock().unwrap() = false;
            cvar.notify_all();
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
