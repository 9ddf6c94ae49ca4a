//! In-process broker queue between the API and the worker pool.
//!
//! At-least-once hand-off: tasks are acknowledged only after the supervisor
//! committed the terminal state (ack-late); anything else is redelivered,
//! bounded by the retry budget. Revocation cancels the per-task
//! `CancellationToken`, which the owning supervisor translates into the
//! process-termination protocol.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SubwardenError};

/// Payload placed on the queue by the dispatcher, per the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: String,
    pub folder: String,
    pub language: String,
    pub level: String,
}

/// A delivery: payload plus the broker-assigned task handle and the
/// delivery attempt counter (1-based).
#[derive(Debug, Clone)]
pub struct JobTask {
    pub payload: JobPayload,
    pub task_id: String,
    pub attempt: u32,
}

pub struct Broker {
    tx: mpsc::UnboundedSender<JobTask>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<JobTask>>,
    revocations: Mutex<HashMap<String, CancellationToken>>,
    max_deliveries: u32,
}

impl Broker {
    pub fn new(max_retries: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            revocations: Mutex::new(HashMap::new()),
            // First delivery plus `max_retries` redeliveries.
            max_deliveries: max_retries.saturating_add(1),
        }
    }

    /// Enqueue a job and return the broker task handle assigned to it.
    pub fn enqueue(&self, payload: JobPayload) -> Result<String> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        {
            let mut revocations = self
                .revocations
                .lock()
                .map_err(|_| SubwardenError::Broker("revocation lock poisoned".to_string()))?;
            revocations.insert(task_id.clone(), token);
        }

        let task = JobTask {
            payload,
            task_id: task_id.clone(),
            attempt: 1,
        };
        self.tx
            .send(task)
            .map_err(|_| SubwardenError::Broker("broker queue closed".to_string()))?;
        debug!("Enqueued broker task {}", task_id);
        Ok(task_id)
    }

    /// Pop the next delivery. Worker slots share this receiver (competing
    /// consumers); returns None once the queue is closed.
    pub async fn next_task(&self) -> Option<JobTask> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// The cancellation token bound to a task handle. Supervisors watch it;
    /// `revoke` fires it.
    pub fn cancellation_for(&self, task_id: &str) -> CancellationToken {
        let mut revocations = self.revocations.lock().expect("revocation lock poisoned");
        revocations
            .entry(task_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Revoke a task with terminate-signal semantics. Returns false if the
    /// handle is unknown (already acknowledged or never enqueued).
    pub fn revoke(&self, task_id: &str) -> bool {
        let revocations = self.revocations.lock().expect("revocation lock poisoned");
        match revocations.get(task_id) {
            Some(token) => {
                info!("Revoking broker task {}", task_id);
                token.cancel();
                true
            }
            None => {
                warn!("Revoke requested for unknown broker task {}", task_id);
                false
            }
        }
    }

    /// Acknowledge a delivery after the terminal commit succeeded.
    pub fn ack(&self, task_id: &str) {
        let mut revocations = self.revocations.lock().expect("revocation lock poisoned");
        revocations.remove(task_id);
        debug!("Acknowledged broker task {}", task_id);
    }

    /// Redeliver a task whose supervisor failed before committing. Returns
    /// false once the delivery budget is exhausted (the task is dropped and
    /// acknowledged so its token does not leak).
    pub fn redeliver(&self, task: JobTask) -> bool {
        if task.attempt >= self.max_deliveries {
            warn!(
                "Dropping broker task {} after {} deliveries",
                task.task_id, task.attempt
            );
            self.ack(&task.task_id);
            return false;
        }
        let task_id = task.task_id.clone();
        let redelivery = JobTask {
            attempt: task.attempt + 1,
            ..task
        };
        match self.tx.send(redelivery) {
            Ok(()) => {
                info!("Redelivering broker task {}", task_id);
                true
            }
            Err(_) => false,
        }
    }
}
