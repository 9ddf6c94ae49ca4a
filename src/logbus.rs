//! In-process log fan-out bus.
//!
//! One topic per job: a broadcast channel for the live stream plus a bounded
//! history list replayed to late subscribers. The topic names
//! `job:{id}:logs` / `job:{id}:history` are the wire contract between the
//! supervisor (single publisher) and any number of subscriber sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

use crate::database::JobStatus;
use crate::error::{Result, SubwardenError};

const LIVE_CHANNEL_CAPACITY: usize = 1024;

pub fn live_topic_name(job_id: &str) -> String {
    format!("job:{}:logs", job_id)
}

pub fn history_topic_name(job_id: &str) -> String {
    format!("job:{}:history", job_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Envelope payloads, tagged on the wire as `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum EnvelopeBody {
    Log {
        stream: LogStream,
        message: String,
    },
    Status {
        status: JobStatus,
        exit_code: Option<i64>,
        job_id: String,
    },
    System {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub body: EnvelopeBody,
    pub ts: DateTime<Utc>,
    pub seq: u64,
}

struct Topic {
    tx: broadcast::Sender<String>,
    history: Mutex<Vec<String>>,
}

impl Topic {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            tx,
            history: Mutex::new(Vec::new()),
        }
    }
}

/// Shared bus keyed by job topic. Single publisher per topic, many
/// subscribers; publishing never blocks on a slow subscriber (lagging
/// broadcast receivers drop messages, which at-most-once delivery permits).
pub struct LogBus {
    history_max_items: usize,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
}

impl LogBus {
    pub fn new(history_max_items: usize) -> Self {
        Self {
            history_max_items: history_max_items.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn topic(&self, job_id: &str) -> Arc<Topic> {
        let mut topics = self.topics.lock().expect("logbus topics lock poisoned");
        topics
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Topic::new()))
            .clone()
    }

    /// Open the publisher side of a job's topic. Kept fallible: the
    /// supervisor must survive a bus that cannot be reached and simply skip
    /// publishes.
    pub fn connect(&self, job_id: &str) -> Result<JobLogPublisher> {
        debug!("Connecting publisher to topic '{}'", live_topic_name(job_id));
        Ok(JobLogPublisher {
            job_id: job_id.to_string(),
            history_max_items: self.history_max_items,
            topic: self.topic(job_id),
            seq: AtomicU64::new(0),
        })
    }

    /// Subscribe to a job's stream. The live subscription is taken first,
    /// then the history snapshot, so nothing published after the subscribe
    /// call can be missed; duplicates across the seam are possible and
    /// deduplicated by `seq` on the client side.
    pub fn subscribe(&self, job_id: &str) -> (Vec<String>, broadcast::Receiver<String>) {
        let topic = self.topic(job_id);
        let rx = topic.tx.subscribe();
        let history = topic
            .history
            .lock()
            .expect("logbus history lock poisoned")
            .clone();
        (history, rx)
    }
}

/// Per-job publishing handle held by the supervisor. `seq` is monotonic per
/// job, starting at 0.
pub struct JobLogPublisher {
    job_id: String,
    history_max_items: usize,
    topic: Arc<Topic>,
    seq: AtomicU64,
}

impl JobLogPublisher {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    fn publish(&self, body: EnvelopeBody) -> Result<Envelope> {
        let envelope = Envelope {
            body,
            ts: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };
        let raw = serde_json::to_string(&envelope)?;

        {
            let mut history = self
                .topic
                .history
                .lock()
                .map_err(|_| SubwardenError::LogBus("history lock poisoned".to_string()))?;
            history.push(raw.clone());
            let len = history.len();
            if len > self.history_max_items {
                history.drain(..len - self.history_max_items);
            }
        }

        // No receivers is fine; history still records the envelope.
        let _ = self.topic.tx.send(raw);
        Ok(envelope)
    }

    pub fn publish_log(&self, stream: LogStream, message: &str) -> Result<Envelope> {
        self.publish(EnvelopeBody::Log {
            stream,
            message: message.to_string(),
        })
    }

    pub fn publish_status(&self, status: JobStatus, exit_code: Option<i64>) -> Result<Envelope> {
        self.publish(EnvelopeBody::Status {
            status,
            exit_code,
            job_id: self.job_id.clone(),
        })
    }

    pub fn publish_system(&self, message: &str) -> Result<Envelope> {
        self.publish(EnvelopeBody::System {
            message: message.to_string(),
            job_id: Some(self.job_id.clone()),
        })
    }

    pub fn publish_error(&self, message: &str) -> Result<Envelope> {
        self.publish(EnvelopeBody::Error {
            message: message.to_string(),
        })
    }
}
