//! Bounded background computation, off both the audio and control threads.
//!
//! ```text
//!  control thread          worker pool              control thread
//!  ──────────────          ───────────              ──────────────
//!  submit(task) ──► bounded queue ──► run(ctx) ──► ResultChannel ──► poll /
//!                   (QueueFull on      │                             subscribe
//!                    overflow)         └── ctx.is_cancelled() checked
//!                                          between internal steps
//! ```
//!
//! `submit` never blocks: when the queue is at its bound the call fails fast
//! with [`EffexError::QueueFull`] instead of growing. Each task produces
//! exactly one terminal [`WorkUpdate`] — done, cancelled, or failed — and
//! workers never retry (task inputs are deterministic; a retry would
//! reproduce the failure).
//!
//! Cancellation is cooperative: a task that has not started is retired at
//! dequeue time without running; a running task keeps going until it next
//! observes [`TaskContext::is_cancelled`].

pub mod result;
pub mod walk;

pub use result::{ResultChannel, WorkUpdate};
pub use walk::RandomWalk;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EffexError, Result};

/// Identifies one submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub(crate) u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A computation submitted to the queue.
///
/// `run` executes on a worker thread. It streams partial results through
/// [`TaskContext::emit`] and should check [`TaskContext::is_cancelled`]
/// between internal steps; the terminal update is posted by the worker from
/// `run`'s outcome, never by the task itself.
pub trait WorkTask: Send + 'static {
    fn name(&self) -> &str;

    fn run(&mut self, ctx: &TaskContext) -> Result<()>;
}

/// Handed to a running task: its identity, cancellation flag, and the
/// channel its chunks flow into.
pub struct TaskContext {
    id: TaskId,
    cancelled: Arc<AtomicBool>,
    results: ResultChannel,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// `true` once `cancel` was called for this task. Checked by the task
    /// between internal steps; cancellation is never preemptive.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Stream a partial result. Chunks arrive at the control side in emit
    /// order.
    pub fn emit(&self, values: Vec<f64>) {
        self.results.push(WorkUpdate::Chunk {
            task: self.id,
            values,
        });
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkQueueConfig {
    /// Fixed worker-thread count.
    pub workers: usize,
    /// Maximum queued-but-unstarted tasks before `submit` fails fast.
    pub queue_bound: usize,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_bound: 32,
        }
    }
}

struct QueuedTask {
    id: TaskId,
    task: Box<dyn WorkTask>,
    cancelled: Arc<AtomicBool>,
}

/// Fixed pool of worker threads behind a bounded submission queue.
pub struct WorkQueue {
    // Dropped first (field order) so workers see the disconnect and exit.
    queue_tx: Option<Sender<QueuedTask>>,
    results: ResultChannel,
    flags: Arc<Mutex<HashMap<TaskId, Arc<AtomicBool>>>>,
    next_id: AtomicU64,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl WorkQueue {
    pub fn new(config: WorkQueueConfig) -> Self {
        let (queue_tx, queue_rx) = crossbeam_channel::bounded(config.queue_bound.max(1));
        let results = ResultChannel::new();
        let flags: Arc<Mutex<HashMap<TaskId, Arc<AtomicBool>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let workers = (0..config.workers.max(1))
            .map(|n| {
                let rx = queue_rx.clone();
                let results = results.clone();
                let flags = Arc::clone(&flags);
                std::thread::Builder::new()
                    .name(format!("effex-worker-{n}"))
                    .spawn(move || run_worker(rx, results, flags))
                    .expect("spawn worker thread")
            })
            .collect();

        Self {
            queue_tx: Some(queue_tx),
            results,
            flags,
            next_id: AtomicU64::new(1),
            workers,
        }
    }

    /// Enqueue `task` without blocking. Fails with
    /// [`EffexError::QueueFull`] when the queue is at its bound.
    pub fn submit(&self, task: Box<dyn WorkTask>) -> Result<TaskId> {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancelled = Arc::new(AtomicBool::new(false));
        self.flags.lock().insert(id, Arc::clone(&cancelled));

        let queued = QueuedTask {
            id,
            task,
            cancelled,
        };
        match self
            .queue_tx
            .as_ref()
            .expect("queue sender present until drop")
            .try_send(queued)
        {
            Ok(()) => {
                debug!(task = %id, "task submitted");
                Ok(id)
            }
            Err(TrySendError::Full(rejected)) => {
                self.flags.lock().remove(&rejected.id);
                Err(EffexError::QueueFull)
            }
            Err(TrySendError::Disconnected(rejected)) => {
                self.flags.lock().remove(&rejected.id);
                Err(EffexError::Task("worker pool has shut down".into()))
            }
        }
    }

    /// Best-effort cancellation: raises the task's flag and discards the
    /// task's undrained mailbox. A task that has not started is retired
    /// without running; a running task stops at its next cancellation check
    /// and its terminal update is still delivered. Never blocks the caller.
    pub fn cancel(&self, task: TaskId) {
        if let Some(flag) = self.flags.lock().get(&task) {
            flag.store(true, Ordering::SeqCst);
        }
        self.results.discard(task);
    }

    /// Pop the oldest undelivered update for `task`.
    pub fn poll(&self, task: TaskId) -> Option<WorkUpdate> {
        self.results.poll(task)
    }

    /// Attach a sink for `task`; queued updates flush into it first.
    pub fn subscribe(&self, task: TaskId) -> Receiver<WorkUpdate> {
        self.results.subscribe(task)
    }

    /// Handle usable from other threads without the queue itself.
    pub fn results(&self) -> ResultChannel {
        self.results.clone()
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.queue_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_worker(
    queue_rx: Receiver<QueuedTask>,
    results: ResultChannel,
    flags: Arc<Mutex<HashMap<TaskId, Arc<AtomicBool>>>>,
) {
    while let Ok(QueuedTask {
        id,
        mut task,
        cancelled,
    }) = queue_rx.recv()
    {
        if cancelled.load(Ordering::SeqCst) {
            // Cancelled before starting: retire without running.
            results.push(WorkUpdate::Cancelled { task: id });
            flags.lock().remove(&id);
            continue;
        }

        debug!(task = %id, name = task.name(), "task started");
        let ctx = TaskContext {
            id,
            cancelled: Arc::clone(&cancelled),
            results: results.clone(),
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| task.run(&ctx)));

        let terminal = match outcome {
            Ok(Ok(())) if ctx.is_cancelled() => WorkUpdate::Cancelled { task: id },
            Ok(Ok(())) => WorkUpdate::Done { task: id },
            Ok(Err(e)) => {
                warn!(task = %id, error = %e, "task failed");
                WorkUpdate::Failed {
                    task: id,
                    message: e.to_string(),
                }
            }
            Err(_) => {
                warn!(task = %id, "task panicked");
                WorkUpdate::Failed {
                    task: id,
                    message: "task panicked".into(),
                }
            }
        };
        results.push(terminal);
        flags.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    struct Emit {
        values: Vec<f64>,
    }

    impl WorkTask for Emit {
        fn name(&self) -> &str {
            "emit"
        }

        fn run(&mut self, ctx: &TaskContext) -> Result<()> {
            ctx.emit(self.values.clone());
            Ok(())
        }
    }

    struct Fail;

    impl WorkTask for Fail {
        fn name(&self) -> &str {
            "fail"
        }

        fn run(&mut self, _ctx: &TaskContext) -> Result<()> {
            Err(EffexError::Task("synthetic failure".into()))
        }
    }

    /// Holds until told to proceed, so tests can pin a worker.
    struct Block {
        release: Arc<AtomicBool>,
    }

    impl WorkTask for Block {
        fn name(&self) -> &str {
            "block"
        }

        fn run(&mut self, _ctx: &TaskContext) -> Result<()> {
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }
    }

    fn poll_blocking(queue: &WorkQueue, task: TaskId) -> WorkUpdate {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(update) = queue.poll(task) {
                return update;
            }
            assert!(Instant::now() < deadline, "timed out polling {task}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn polled_payload_matches_what_the_worker_produced() {
        let queue = WorkQueue::new(WorkQueueConfig::default());
        let id = queue
            .submit(Box::new(Emit {
                values: vec![1.5, -2.5, 3.0],
            }))
            .expect("submit");

        assert_eq!(
            poll_blocking(&queue, id),
            WorkUpdate::Chunk {
                task: id,
                values: vec![1.5, -2.5, 3.0]
            }
        );
        assert_eq!(poll_blocking(&queue, id), WorkUpdate::Done { task: id });
        // Exactly once: nothing remains after the terminal update.
        assert_eq!(queue.poll(id), None);
    }

    #[test]
    fn failure_arrives_as_the_terminal_update() {
        let queue = WorkQueue::new(WorkQueueConfig::default());
        let id = queue.submit(Box::new(Fail)).expect("submit");
        match poll_blocking(&queue, id) {
            WorkUpdate::Failed { task, message } => {
                assert_eq!(task, id);
                assert!(message.contains("synthetic failure"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn overflow_fails_fast_with_queue_full() {
        let queue = WorkQueue::new(WorkQueueConfig {
            workers: 1,
            queue_bound: 2,
        });

        // Pin the single worker so queued tasks stay queued.
        let release = Arc::new(AtomicBool::new(false));
        queue
            .submit(Box::new(Block {
                release: Arc::clone(&release),
            }))
            .expect("pin worker");
        std::thread::sleep(Duration::from_millis(20));

        queue
            .submit(Box::new(Emit { values: vec![] }))
            .expect("first queued");
        queue
            .submit(Box::new(Emit { values: vec![] }))
            .expect("second queued");
        assert!(matches!(
            queue.submit(Box::new(Emit { values: vec![] })),
            Err(EffexError::QueueFull)
        ));

        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn cancel_before_start_retires_without_running() {
        let queue = WorkQueue::new(WorkQueueConfig {
            workers: 1,
            queue_bound: 8,
        });
        let release = Arc::new(AtomicBool::new(false));
        queue
            .submit(Box::new(Block {
                release: Arc::clone(&release),
            }))
            .expect("pin worker");
        std::thread::sleep(Duration::from_millis(20));

        let id = queue
            .submit(Box::new(Emit {
                values: vec![42.0],
            }))
            .expect("queued");
        queue.cancel(id);
        release.store(true, Ordering::SeqCst);

        // No chunk is ever produced: the task never ran.
        assert_eq!(poll_blocking(&queue, id), WorkUpdate::Cancelled { task: id });
        assert_eq!(queue.poll(id), None);
    }

    #[test]
    fn cancel_discards_an_undrained_mailbox() {
        let queue = WorkQueue::new(WorkQueueConfig::default());
        let id = queue
            .submit(Box::new(Emit {
                values: vec![1.0, 2.0],
            }))
            .expect("submit");

        // The worker clears the flag after posting the terminal update, so
        // once it is gone the chunk and terminal both sit undrained.
        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.flags.lock().contains_key(&id) {
            assert!(Instant::now() < deadline, "task never finished");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(queue.results.pending_tasks(), 1);

        // The submitter walks away instead of draining; cancelling must not
        // leave the mailbox parked in the channel forever.
        queue.cancel(id);
        assert_eq!(queue.results.pending_tasks(), 0);
        assert_eq!(queue.poll(id), None);
    }

    #[test]
    fn subscribe_streams_chunks_then_terminal() {
        let queue = WorkQueue::new(WorkQueueConfig::default());
        let id = queue
            .submit(Box::new(Emit {
                values: vec![7.0],
            }))
            .expect("submit");
        let rx = queue.subscribe(id);

        let first = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("chunk arrives");
        assert_eq!(
            first,
            WorkUpdate::Chunk {
                task: id,
                values: vec![7.0]
            }
        );
        let second = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("terminal arrives");
        assert_eq!(second, WorkUpdate::Done { task: id });
    }
}
