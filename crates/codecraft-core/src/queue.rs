//! Priority execution queue.
//!
//! User submissions outrank Auto ones; within a tier tasks run in submission
//! order. Many producers may enqueue concurrently; one worker consumes.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::domain::error::{CodecraftError, Result};
use crate::domain::spec::TechnicalSpec;
use crate::obs;
use crate::parser::Proposal;

/// Lower value runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    User = 0,
    Auto = 1,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::User => "user",
            Priority::Auto => "auto",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task carries: an already parsed spec, or a proposal to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum TaskPayload {
    Spec(TechnicalSpec),
    Proposal(Proposal),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueTask {
    pub proposal_id: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub payload: TaskPayload,
}

impl QueueTask {
    pub fn from_proposal(proposal: Proposal, priority: Priority) -> Result<Self> {
        Ok(Self {
            proposal_id: proposal.resolve_id()?,
            priority,
            enqueued_at: Utc::now(),
            payload: TaskPayload::Proposal(proposal),
        })
    }

    pub fn from_spec(spec: TechnicalSpec, priority: Priority) -> Self {
        Self {
            proposal_id: spec.proposal_id().to_string(),
            priority,
            enqueued_at: Utc::now(),
            payload: TaskPayload::Spec(spec),
        }
    }
}

struct Entry {
    seq: u64,
    task: QueueTask,
}

impl Entry {
    fn rank(&self) -> (Priority, u64) {
        (self.task.priority, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; the smallest rank must surface first.
        other.rank().cmp(&self.rank())
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

pub struct ExecutionQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: Option<usize>,
    user_reserved: usize,
}

impl Default for ExecutionQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl ExecutionQueue {
    pub fn unbounded() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity: None,
            user_reserved: 0,
        }
    }

    /// A queue holding at most `capacity` tasks, the last `user_reserved` of
    /// which only User submissions may take.
    pub fn bounded(capacity: usize, user_reserved: usize) -> Self {
        Self {
            capacity: Some(capacity),
            user_reserved: user_reserved.min(capacity),
            ..Self::unbounded()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add `task`; returns the queue length after insertion. A full queue
    /// rejects the task with `QueueFull` instead of dropping anything.
    pub fn enqueue(&self, task: QueueTask) -> Result<usize> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(CodecraftError::QueueClosed);
        }
        if let Some(capacity) = self.capacity {
            let limit = match task.priority {
                Priority::User => capacity,
                Priority::Auto => capacity - self.user_reserved,
            };
            if inner.heap.len() >= limit {
                return Err(CodecraftError::QueueFull {
                    priority: task.priority.to_string(),
                });
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        obs::emit_task_enqueued(&task.proposal_id, task.priority.as_str(), inner.heap.len() + 1);
        inner.heap.push(Entry { seq, task });
        let len = inner.heap.len();
        drop(inner);
        self.notify.notify_one();
        Ok(len)
    }

    /// Next task without waiting.
    pub fn try_dequeue(&self) -> Option<QueueTask> {
        self.lock().heap.pop().map(|e| e.task)
    }

    /// Wait for the next task. Returns `None` once the queue is closed and
    /// drained.
    pub async fn dequeue(&self) -> Option<QueueTask> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(entry) = inner.heap.pop() {
                    return Some(entry.task);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Remove a queued (not running) task.
    pub fn cancel(&self, proposal_id: &str) -> Option<QueueTask> {
        let mut inner = self.lock();
        let mut entries = std::mem::take(&mut inner.heap).into_vec();
        let found = entries
            .iter()
            .position(|e| e.task.proposal_id == proposal_id)
            .map(|i| entries.swap_remove(i).task);
        inner.heap = entries.into();
        found
    }

    pub fn contains(&self, proposal_id: &str) -> bool {
        self.lock()
            .heap
            .iter()
            .any(|e| e.task.proposal_id == proposal_id)
    }

    /// Stop accepting tasks; queued ones are still handed out.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
