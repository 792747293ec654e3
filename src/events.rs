//! Job event gateway.
//!
//! Dispatch workers publish [`JobEvent`]s over an mpsc channel. A pump task
//! records each event in a bounded per-job history and fans it out on a
//! broadcast channel. Subscribers get the history replayed, then live events
//! for their job.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::jobs::{Job, JobStatus};

/// Events retained per job for late subscribers.
const HISTORY_PER_JOB: usize = 200;

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Status {
        job_id: String,
        session_id: String,
        status: JobStatus,
        error: Option<String>,
    },
    Log {
        job_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Status { job_id, .. } | JobEvent::Log { job_id, .. } => job_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Status { .. } => "status",
            JobEvent::Log { .. } => "log",
        }
    }
}

/// Stream of events for one job.
pub type JobEventStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;

/// Sending half handed to dispatch workers.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<JobEvent>,
}

impl EventPublisher {
    /// Never blocks; events are dropped when the gateway is backed up.
    pub fn publish(&self, event: JobEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!("Dropping job event: {}", e);
        }
    }

    pub fn status(&self, job: &Job) {
        self.publish(JobEvent::Status {
            job_id: job.job_id.clone(),
            session_id: job.session_id.clone(),
            status: job.status,
            error: job.error.clone(),
        });
    }

    pub fn log(&self, job_id: &str, message: impl Into<String>) {
        self.publish(JobEvent::Log {
            job_id: job_id.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }
}

pub struct EventGateway {
    tx: broadcast::Sender<JobEvent>,
    history: RwLock<HashMap<String, VecDeque<JobEvent>>>,
}

impl EventGateway {
    /// Spawn the pump task and return the gateway with its publisher.
    pub fn start(queue_capacity: usize) -> (Arc<Self>, EventPublisher) {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let gateway = Arc::new(Self {
            tx,
            history: RwLock::new(HashMap::new()),
        });

        let (publisher_tx, mut rx) = mpsc::channel(queue_capacity.max(1));
        let pump = Arc::clone(&gateway);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                pump.record(event).await;
            }
            tracing::debug!("Event gateway pump stopped");
        });

        (gateway, EventPublisher { tx: publisher_tx })
    }

    async fn record(&self, event: JobEvent) {
        // Send while holding the write lock so a concurrent subscribe sees each
        // event exactly once, either replayed or live.
        let mut history = self.history.write().await;
        let buffer = history.entry(event.job_id().to_string()).or_default();
        if buffer.len() == HISTORY_PER_JOB {
            buffer.pop_front();
        }
        buffer.push_back(event.clone());
        let _ = self.tx.send(event);
    }

    pub async fn history(&self, job_id: &str) -> Vec<JobEvent> {
        self.history
            .read()
            .await
            .get(job_id)
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Replayed history followed by live events for `job_id`.
    pub async fn subscribe(&self, job_id: &str) -> JobEventStream {
        let (rx, replay) = {
            let history = self.history.read().await;
            let rx = self.tx.subscribe();
            let replay: Vec<JobEvent> = history
                .get(job_id)
                .map(|events| events.iter().cloned().collect())
                .unwrap_or_default();
            (rx, replay)
        };

        let job_id = job_id.to_string();
        let live = BroadcastStream::new(rx).filter_map(move |result| match result {
            Ok(event) if event.job_id() == job_id => Some(event),
            _ => None,
        });

        Box::pin(tokio_stream::iter(replay).chain(live))
    }

    /// Drop retained history for jobs that no longer exist.
    pub async fn forget(&self, job_ids: &[String]) {
        let mut history = self.history.write().await;
        for job_id in job_ids {
            history.remove(job_id);
        }
    }
}
