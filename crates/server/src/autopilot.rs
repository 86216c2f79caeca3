use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use quill_protocol::ServerMessage;

use crate::registry::ConnHandle;

/// A connected autopilot worker. Carries at most one task at a time.
pub struct AutopilotInstance {
    display: String,
    conn: ConnHandle,
    task_id: Option<i64>,
}

impl AutopilotInstance {
    pub fn busy(&self) -> bool {
        self.task_id.is_some()
    }

    /// Assign a task. Rejects if the worker is already busy.
    fn set_task(&mut self, task_id: i64) -> bool {
        if self.task_id.is_some() {
            return false;
        }
        self.task_id = Some(task_id);
        true
    }

    fn clear_task(&mut self) -> Option<i64> {
        self.task_id.take()
    }
}

#[derive(Default)]
struct SchedulerInner {
    /// FIFO of task ids awaiting a free worker.
    queue: VecDeque<i64>,
    /// Connected workers keyed by token id.
    autopilots: HashMap<String, AutopilotInstance>,
}

/// FIFO job queue plus free-worker matching. The `Notify` is the condition
/// variable: every state change that could unblock the dispatcher rings it.
pub struct Scheduler {
    inner: Mutex<SchedulerInner>,
    notify: Notify,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SchedulerInner::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append to the queue unless the task is already waiting.
    /// Returns whether the task was newly queued.
    pub fn queue_task(&self, task_id: i64) -> bool {
        let queued = {
            let mut inner = self.lock();
            if inner.queue.contains(&task_id) {
                false
            } else {
                inner.queue.push_back(task_id);
                true
            }
        };
        if queued {
            tracing::info!(task_id, "Task queued");
            self.notify.notify_waiters();
        }
        queued
    }

    pub fn get_next_task(&self) -> Option<i64> {
        self.lock().queue.pop_front()
    }

    /// Whether any connected worker is free right now.
    pub fn has_free_autopilot(&self) -> bool {
        self.lock().autopilots.values().any(|a| !a.busy())
    }

    /// Block until a free worker is connected.
    pub async fn wait_for_autopilot(&self) {
        loop {
            let notified = self.notify.notified();
            if self.has_free_autopilot() {
                return;
            }
            notified.await;
        }
    }

    /// Register a worker connection and wake anything waiting on one.
    pub fn connect(&self, token_id: &str, display_name: &str, conn: ConnHandle) {
        {
            let mut inner = self.lock();
            inner.autopilots.insert(
                token_id.to_string(),
                AutopilotInstance {
                    display: display_name.to_string(),
                    conn,
                    task_id: None,
                },
            );
        }
        tracing::info!(autopilot = %display_name, "Autopilot connected");
        self.notify.notify_waiters();
    }

    /// Drop a worker. A task it was carrying goes back to the head of the
    /// queue so it is the next one dispatched.
    pub fn disconnect(&self, token_id: &str) {
        let requeued = {
            let mut inner = self.lock();
            match inner.autopilots.remove(token_id) {
                Some(mut instance) => {
                    let orphaned = instance.clear_task();
                    if let Some(task_id) = orphaned {
                        inner.queue.push_front(task_id);
                    }
                    Some((instance.display, orphaned))
                }
                None => None,
            }
        };
        if let Some((display_name, orphaned)) = requeued {
            match orphaned {
                Some(task_id) => tracing::warn!(
                    autopilot = %display_name,
                    task_id,
                    "Autopilot disconnected mid-task; task re-queued at head"
                ),
                None => tracing::info!(autopilot = %display_name, "Autopilot disconnected"),
            }
            self.notify.notify_waiters();
        }
    }

    /// Completion ack from a worker. Returns false when the ack does not
    /// match the worker's current task.
    pub fn complete(&self, token_id: &str, task_id: i64) -> bool {
        let cleared = {
            let mut inner = self.lock();
            match inner.autopilots.get_mut(token_id) {
                Some(instance) if instance.task_id == Some(task_id) => {
                    instance.clear_task();
                    Some(instance.display.clone())
                }
                _ => None,
            }
        };
        match cleared {
            Some(display_name) => {
                tracing::info!(autopilot = %display_name, task_id, "Task completed");
                self.notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Pop the queue head and assign it to a free worker, if both exist.
    fn try_dispatch(&self) -> Option<(i64, String, ConnHandle)> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        if inner.queue.is_empty() {
            return None;
        }
        let free = inner
            .autopilots
            .values_mut()
            .find(|instance| !instance.busy())?;
        let task_id = inner.queue.pop_front()?;
        free.set_task(task_id);
        Some((task_id, free.display.clone(), free.conn.clone()))
    }

    /// The dispatcher: wait for a queued task and a free worker, assign,
    /// push the task message down the worker's connection, repeat.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let notified = scheduler.notify.notified();
                if let Some((task_id, display_name, conn)) = scheduler.try_dispatch() {
                    let message = ServerMessage::Task { task_id };
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(error) => {
                            tracing::error!(task_id, "Failed to serialize task message: {error}");
                            continue;
                        }
                    };
                    if conn.send_text(text) {
                        tracing::info!(autopilot = %display_name, task_id, "Task dispatched");
                    }
                    // A dead connection is handled by its teardown calling
                    // disconnect(), which re-queues the task at the head.
                    continue;
                }
                notified.await;
            }
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
