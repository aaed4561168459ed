// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! At-least-once task bus for refbase workers.
//!
//! Three delivery labels are honored: `priority` (higher first, FIFO within a
//! priority), `delay` (seconds to defer visibility) and `renew_lock` (the
//! worker keeps renewing its message lock across a long-running task). A task
//! that exceeds the configured lock-renewal window without completing is
//! abandoned and redelivered. Every task carries a propagated trace-context
//! map so consumer spans are children of producer spans.
//!
//! Per-reference lifecycle ordering (ingest → dedup decision → projection →
//! percolation → pending-work emission) is enforced by task continuation:
//! each consumer publishes its successor task.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use refbase_error::{RepoError, RepoResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: Uuid,
    /// Task kind, dispatched on by workers (e.g. `process_import_batch`).
    pub kind: String,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Scheduling priority; higher delivers first.
    pub priority: i32,
    /// Seconds to defer first delivery.
    pub delay_seconds: u64,
    /// Whether the worker should keep renewing the message lock for the
    /// duration of the task (set for long-running imports).
    pub renew_lock: bool,
    /// Propagated trace context.
    pub trace: BTreeMap<String, String>,
}

impl Task {
    /// Create a task with default labels.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            priority: 0,
            delay_seconds: 0,
            renew_lock: false,
            trace: BTreeMap::new(),
        }
    }

    /// Set the priority label.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the delay label.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_seconds = delay.as_secs();
        self
    }

    /// Mark the task long-running: the worker renews the message lock.
    #[must_use]
    pub fn with_lock_renewal(mut self) -> Self {
        self.renew_lock = true;
        self
    }

    /// Attach trace context propagated from the producing span.
    #[must_use]
    pub fn with_trace(mut self, trace: BTreeMap<String, String>) -> Self {
        self.trace = trace;
        self
    }
}

/// A delivered task plus its lock lease.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The task.
    pub task: Task,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
    /// When the message lock lapses unless renewed.
    pub locked_until: DateTime<Utc>,
}

#[derive(Debug)]
struct QueuedEntry {
    task: Task,
    attempt: u32,
    visible_at: DateTime<Utc>,
    enqueued_at: DateTime<Utc>,
    /// Lock state while delivered: (locked_until, first_locked_at).
    lock: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// In-process at-least-once bus.
pub struct MessageBus {
    entries: Mutex<Vec<QueuedEntry>>,
    lock_duration: Duration,
    lock_renewal_window: Duration,
}

impl MessageBus {
    /// Create a bus with the given per-delivery lock duration and the window
    /// past which a still-locked task is abandoned.
    #[must_use]
    pub fn new(lock_duration: Duration, lock_renewal_window: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            lock_duration,
            lock_renewal_window,
        }
    }

    fn to_chrono(duration: Duration) -> ChronoDuration {
        ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(60))
    }

    /// Publish a task, honoring its delay label.
    pub async fn publish(&self, task: Task) {
        let now = Utc::now();
        let visible_at = now + ChronoDuration::seconds(task.delay_seconds as i64);
        debug!(
            target: "refbase.bus",
            kind = %task.kind,
            priority = task.priority,
            delay_seconds = task.delay_seconds,
            "published task"
        );
        self.entries.lock().await.push(QueuedEntry {
            task,
            attempt: 0,
            visible_at,
            enqueued_at: now,
            lock: None,
        });
    }

    /// Lease the highest-priority visible task, if any.
    pub async fn receive(&self) -> Option<Delivery> {
        self.receive_at(Utc::now()).await
    }

    /// Lease the highest-priority visible task as of `now`.
    ///
    /// Exposed for deterministic tests; production callers use
    /// [`MessageBus::receive`].
    pub async fn receive_at(&self, now: DateTime<Utc>) -> Option<Delivery> {
        let mut entries = self.entries.lock().await;
        let best = entries
            .iter_mut()
            .filter(|e| e.lock.is_none() && e.visible_at <= now)
            .max_by(|a, b| {
                a.task
                    .priority
                    .cmp(&b.task.priority)
                    .then_with(|| b.enqueued_at.cmp(&a.enqueued_at))
            })?;
        best.attempt += 1;
        let locked_until = now + Self::to_chrono(self.lock_duration);
        best.lock = Some((locked_until, now));
        Some(Delivery {
            task: best.task.clone(),
            attempt: best.attempt,
            locked_until,
        })
    }

    /// Renew the message lock for a delivered task.
    pub async fn renew(&self, task_id: Uuid) -> RepoResult<DateTime<Utc>> {
        self.renew_at(task_id, Utc::now()).await
    }

    /// Renew as of `now`. Fails with a lock-loss once the renewal window is
    /// exhausted or the task is no longer leased.
    pub async fn renew_at(&self, task_id: Uuid, now: DateTime<Utc>) -> RepoResult<DateTime<Utc>> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.task.id == task_id)
            .ok_or_else(|| RepoError::Bus {
                detail: format!("task {task_id} is not queued"),
                lock_lost: true,
            })?;
        let Some((_, first_locked_at)) = entry.lock else {
            return Err(RepoError::Bus {
                detail: format!("task {task_id} is not locked"),
                lock_lost: true,
            });
        };
        if now - first_locked_at > Self::to_chrono(self.lock_renewal_window) {
            warn!(target: "refbase.bus", task_id = %task_id, "lock renewal window exhausted, abandoning");
            entry.lock = None;
            return Err(RepoError::Bus {
                detail: format!("task {task_id} exceeded the lock renewal window"),
                lock_lost: true,
            });
        }
        let locked_until = now + Self::to_chrono(self.lock_duration);
        entry.lock = Some((locked_until, first_locked_at));
        Ok(locked_until)
    }

    /// Complete a delivered task.
    pub async fn ack(&self, task_id: Uuid) -> RepoResult<()> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.task.id != task_id);
        if entries.len() == before {
            return Err(RepoError::Bus {
                detail: format!("task {task_id} is not queued"),
                lock_lost: true,
            });
        }
        Ok(())
    }

    /// Release a delivered task without completing it: the message becomes
    /// redeliverable immediately. Used by cooperative shutdown.
    pub async fn abandon(&self, task_id: Uuid) -> RepoResult<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.task.id == task_id)
            .ok_or_else(|| RepoError::Bus {
                detail: format!("task {task_id} is not queued"),
                lock_lost: true,
            })?;
        entry.lock = None;
        Ok(())
    }

    /// Return lapsed locks to the queue. Tasks whose lock expired (and tasks
    /// past the renewal window) become redeliverable.
    pub async fn reap_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().await;
        let window = Self::to_chrono(self.lock_renewal_window);
        let mut reaped = 0;
        for entry in entries.iter_mut() {
            if let Some((locked_until, first_locked_at)) = entry.lock {
                if locked_until <= now || now - first_locked_at > window {
                    entry.lock = None;
                    reaped += 1;
                }
            }
        }
        if reaped > 0 {
            warn!(target: "refbase.bus", reaped, "returned expired locks to the queue");
        }
        reaped
    }

    /// Number of queued (including leased) tasks.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the bus holds no tasks.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
