//! Per-job progress fan-out
//!
//! [`ProgressBroadcaster`] keeps an ordered set of [`ProgressSink`]s per job
//! and delivers [`JobEvent`]s to each of them. Delivery is best-effort: a
//! sink that errors or panics is logged and skipped for that event only.
//! A terminal event is delivered once and then the job's sinks are dropped,
//! so no subscriber ever sees anything after it.

use crate::job::{JobId, JobStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Event pushed to job subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Progress {
        job_id: JobId,
        current: usize,
        total: usize,
        status: JobStatus,
        message: String,
    },
    Completed {
        job_id: JobId,
        download_ref: String,
    },
    Cancelled {
        job_id: JobId,
    },
    Failed {
        job_id: JobId,
        message: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Cancelled { job_id }
            | JobEvent::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Progress { .. })
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("subscriber is closed")]
    Closed,

    #[error("subscriber buffer is full")]
    Full,

    #[error("{0}")]
    Rejected(String),
}

/// Destination for job events.
///
/// `deliver` runs on the registry's orchestrator loop and must not block.
pub trait ProgressSink: Send + Sync {
    fn deliver(&self, event: &JobEvent) -> Result<(), SinkError>;
}

impl ProgressSink for mpsc::UnboundedSender<JobEvent> {
    fn deliver(&self, event: &JobEvent) -> Result<(), SinkError> {
        self.send(event.clone()).map_err(|_| SinkError::Closed)
    }
}

impl ProgressSink for mpsc::Sender<JobEvent> {
    fn deliver(&self, event: &JobEvent) -> Result<(), SinkError> {
        self.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Closure adapter for [`ProgressSink`]
pub struct CallbackSink<F>(F);

impl<F> CallbackSink<F>
where
    F: Fn(&JobEvent) -> Result<(), SinkError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ProgressSink for CallbackSink<F>
where
    F: Fn(&JobEvent) -> Result<(), SinkError> + Send + Sync,
{
    fn deliver(&self, event: &JobEvent) -> Result<(), SinkError> {
        (self.0)(event)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct ProgressBroadcaster {
    subscribers: HashMap<JobId, Vec<(SubscriptionId, Arc<dyn ProgressSink>)>>,
    next_id: u64,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }

    pub fn subscribe(&mut self, job_id: JobId, sink: Arc<dyn ProgressSink>) -> SubscriptionId {
        let id = self.allocate_id();
        self.subscribers.entry(job_id).or_default().push((id, sink));
        id
    }

    /// Remove one sink; false if it was not registered for `job_id`
    pub fn unsubscribe(&mut self, job_id: JobId, id: SubscriptionId) -> bool {
        let Some(sinks) = self.subscribers.get_mut(&job_id) else {
            return false;
        };
        let before = sinks.len();
        sinks.retain(|(sid, _)| *sid != id);
        let removed = sinks.len() != before;
        if sinks.is_empty() {
            self.subscribers.remove(&job_id);
        }
        removed
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.subscribers.get(&job_id).map_or(0, Vec::len)
    }

    /// Deliver `event` to every sink of its job; returns successful deliveries.
    /// Terminal events also retire the job's subscriber set.
    pub fn broadcast(&mut self, event: &JobEvent) -> usize {
        let job_id = event.job_id();
        let delivered = match self.subscribers.get(&job_id) {
            Some(sinks) => sinks
                .iter()
                .filter(|(id, sink)| deliver_isolated(*id, sink.as_ref(), event))
                .count(),
            None => 0,
        };

        if event.is_terminal() {
            self.subscribers.remove(&job_id);
        }
        delivered
    }

    /// Hand a late subscriber the terminal event it missed.
    /// The sink is not registered; the returned id unsubscribes nothing.
    pub fn replay_terminal(&mut self, sink: &dyn ProgressSink, event: &JobEvent) -> SubscriptionId {
        let id = self.allocate_id();
        deliver_isolated(id, sink, event);
        id
    }
}

fn deliver_isolated(id: SubscriptionId, sink: &dyn ProgressSink, event: &JobEvent) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(event))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(
                "Dropping event for job {} on subscriber {:?}: {}",
                event.job_id(),
                id,
                e
            );
            false
        }
        Err(_) => {
            error!(
                "Subscriber {:?} panicked while handling event for job {}",
                id,
                event.job_id()
            );
            false
        }
    }
}
