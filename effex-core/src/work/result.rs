//! Result delivery for background tasks.
//!
//! Each task gets a private mailbox inside the channel. Workers push
//! [`WorkUpdate`]s in the order the task produced them; the control side
//! drains a task's mailbox either by polling or by subscribing a sink.
//! Ordering within one task is preserved end to end; ordering across tasks
//! is unspecified. Once a task's terminal update has been handed out, its
//! mailbox is removed — every task occupies the channel for a bounded time.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::TaskId;

/// One delivery from a background task.
///
/// A task may stream any number of `Chunk`s, then produces exactly one of
/// the terminal variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum WorkUpdate {
    /// A partial result, in production order.
    Chunk { task: TaskId, values: Vec<f64> },
    /// The task ran to completion.
    Done { task: TaskId },
    /// The task observed its cancellation flag and stopped early, or was
    /// cancelled before it started.
    Cancelled { task: TaskId },
    /// The task failed; never retried.
    Failed { task: TaskId, message: String },
}

impl WorkUpdate {
    pub fn task(&self) -> TaskId {
        match self {
            WorkUpdate::Chunk { task, .. }
            | WorkUpdate::Done { task }
            | WorkUpdate::Cancelled { task }
            | WorkUpdate::Failed { task, .. } => *task,
        }
    }

    /// `true` for the variants that end a task's delivery stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkUpdate::Chunk { .. })
    }
}

struct Mailbox {
    queue: VecDeque<WorkUpdate>,
    sink: Option<Sender<WorkUpdate>>,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            sink: None,
        }
    }
}

/// Cloneable handle to the per-task mailboxes.
#[derive(Clone, Default)]
pub struct ResultChannel {
    mailboxes: Arc<Mutex<HashMap<TaskId, Mailbox>>>,
}

impl ResultChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker side: append an update to its task's mailbox, or forward it
    /// straight to a subscribed sink. Terminal updates retire the mailbox.
    pub(super) fn push(&self, update: WorkUpdate) {
        let task = update.task();
        let terminal = update.is_terminal();
        let mut mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes.entry(task).or_insert_with(Mailbox::new);

        if let Some(sink) = &mailbox.sink {
            match sink.send(update) {
                Ok(()) => {
                    if terminal {
                        mailboxes.remove(&task);
                    }
                    return;
                }
                Err(err) => {
                    // Subscriber went away; fall back to the polled queue.
                    mailbox.sink = None;
                    mailbox.queue.push_back(err.0);
                }
            }
        } else {
            mailbox.queue.push_back(update);
        }
    }

    /// Pop the oldest undelivered update for `task`, if any. Delivering the
    /// terminal update removes the task from the channel.
    pub fn poll(&self, task: TaskId) -> Option<WorkUpdate> {
        let mut mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes.get_mut(&task)?;
        let update = mailbox.queue.pop_front()?;
        if update.is_terminal() && mailbox.queue.is_empty() {
            mailboxes.remove(&task);
        }
        Some(update)
    }

    /// Attach a sink for `task`. Anything already queued is flushed into the
    /// returned receiver first, so no update is lost or reordered around the
    /// subscription point.
    pub fn subscribe(&self, task: TaskId) -> Receiver<WorkUpdate> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes.entry(task).or_insert_with(Mailbox::new);

        let mut terminal_flushed = false;
        while let Some(update) = mailbox.queue.pop_front() {
            terminal_flushed = update.is_terminal();
            let _ = tx.send(update);
        }
        if terminal_flushed {
            mailboxes.remove(&task);
        } else {
            mailbox.sink = Some(tx);
        }
        rx
    }

    /// Drop everything queued for `task`. Used on cancellation: a cancelled
    /// submitter no longer wants stale chunks, and a mailbox nobody will
    /// drain must not sit in the channel forever. A live subscription stays
    /// attached (the terminal the worker still posts flows through it); an
    /// unsubscribed mailbox is removed outright and recreated only if the
    /// worker posts again.
    pub(super) fn discard(&self, task: TaskId) {
        let mut mailboxes = self.mailboxes.lock();
        if let Some(mailbox) = mailboxes.get_mut(&task) {
            if mailbox.sink.is_some() {
                mailbox.queue.clear();
            } else {
                mailboxes.remove(&task);
            }
        }
    }

    /// Number of tasks with undelivered updates or live subscriptions.
    pub fn pending_tasks(&self) -> usize {
        self.mailboxes.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> TaskId {
        TaskId(raw)
    }

    #[test]
    fn poll_preserves_per_task_order_and_retires_on_terminal() {
        let channel = ResultChannel::new();
        channel.push(WorkUpdate::Chunk {
            task: id(1),
            values: vec![1.0],
        });
        channel.push(WorkUpdate::Chunk {
            task: id(1),
            values: vec![2.0],
        });
        channel.push(WorkUpdate::Done { task: id(1) });

        assert_eq!(
            channel.poll(id(1)),
            Some(WorkUpdate::Chunk {
                task: id(1),
                values: vec![1.0]
            })
        );
        assert_eq!(
            channel.poll(id(1)),
            Some(WorkUpdate::Chunk {
                task: id(1),
                values: vec![2.0]
            })
        );
        assert_eq!(channel.poll(id(1)), Some(WorkUpdate::Done { task: id(1) }));
        assert_eq!(channel.pending_tasks(), 0);
        assert_eq!(channel.poll(id(1)), None);
    }

    #[test]
    fn subscribe_flushes_backlog_then_streams() {
        let channel = ResultChannel::new();
        channel.push(WorkUpdate::Chunk {
            task: id(7),
            values: vec![0.5],
        });

        let rx = channel.subscribe(id(7));
        assert_eq!(
            rx.try_recv().ok(),
            Some(WorkUpdate::Chunk {
                task: id(7),
                values: vec![0.5]
            })
        );

        channel.push(WorkUpdate::Done { task: id(7) });
        assert_eq!(rx.try_recv().ok(), Some(WorkUpdate::Done { task: id(7) }));
        assert_eq!(channel.pending_tasks(), 0);
    }

    #[test]
    fn dropped_subscriber_falls_back_to_polling() {
        let channel = ResultChannel::new();
        let rx = channel.subscribe(id(3));
        drop(rx);

        channel.push(WorkUpdate::Done { task: id(3) });
        assert_eq!(channel.poll(id(3)), Some(WorkUpdate::Done { task: id(3) }));
    }

    #[test]
    fn tasks_do_not_interleave_each_others_mailboxes() {
        let channel = ResultChannel::new();
        channel.push(WorkUpdate::Chunk {
            task: id(1),
            values: vec![1.0],
        });
        channel.push(WorkUpdate::Chunk {
            task: id(2),
            values: vec![2.0],
        });

        assert_eq!(
            channel.poll(id(2)),
            Some(WorkUpdate::Chunk {
                task: id(2),
                values: vec![2.0]
            })
        );
        assert_eq!(
            channel.poll(id(1)),
            Some(WorkUpdate::Chunk {
                task: id(1),
                values: vec![1.0]
            })
        );
    }

    #[test]
    fn discard_removes_an_undrained_mailbox() {
        let channel = ResultChannel::new();
        channel.push(WorkUpdate::Chunk {
            task: id(5),
            values: vec![1.0],
        });
        channel.push(WorkUpdate::Cancelled { task: id(5) });

        // Nobody drained this mailbox; discarding must not leave it behind.
        channel.discard(id(5));
        assert_eq!(channel.pending_tasks(), 0);
        assert_eq!(channel.poll(id(5)), None);

        // A terminal the worker posts afterwards still gets through, and
        // delivering it retires the task again.
        channel.push(WorkUpdate::Cancelled { task: id(5) });
        assert_eq!(
            channel.poll(id(5)),
            Some(WorkUpdate::Cancelled { task: id(5) })
        );
        assert_eq!(channel.pending_tasks(), 0);
    }

    #[test]
    fn discard_keeps_a_live_subscription_attached() {
        let channel = ResultChannel::new();
        let rx = channel.subscribe(id(4));
        channel.discard(id(4));

        channel.push(WorkUpdate::Cancelled { task: id(4) });
        assert_eq!(
            rx.try_recv().ok(),
            Some(WorkUpdate::Cancelled { task: id(4) })
        );
        assert_eq!(channel.pending_tasks(), 0);
    }

    #[test]
    fn work_update_serde_round_trips() {
        let update = WorkUpdate::Failed {
            task: id(9),
            message: "boom".into(),
        };
        let json = serde_json::to_string(&update).expect("serialize");
        assert!(json.contains("\"type\":\"failed\""));
        let back: WorkUpdate = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, update);
    }
}
