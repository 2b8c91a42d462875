//! Job registry
//!
//! [`JobRegistry`] is a cheap, cloneable handle. The job table lives inside a
//! single orchestrator task and is touched by nothing else: callers, batch
//! drivers and worker progress callbacks all reach it as [`Command`]s on one
//! unbounded channel, processed strictly in arrival order.
//!
//! ```text
//! caller ──create/status/cancel/subscribe──┐
//!                                          ▼
//!                                 ┌─────────────────┐     spawn_blocking
//!                                 │  Orchestrator   │────────────────────► BatchExecutor
//!                                 │ (jobs, pending, │                        │ rayon pool
//!                                 │  broadcaster)   │◄── Progress/Finished ──┘
//!                                 └─────────────────┘
//!                                          │ JobEvent
//!                                          ▼
//!                                     subscribers
//! ```
//!
//! Cancellation is cooperative. `cancel()` flips a per-job atomic flag the
//! executor polls before each dispatch; tasks already running are never
//! interrupted, and a stuck transform holds its worker until it returns.
//! Jobs are kept in memory until the process exits.

use crate::broadcaster::{JobEvent, ProgressBroadcaster, ProgressSink, SubscriptionId};
use crate::config::EngineConfig;
use crate::error::{OrchestratorError, Result};
use crate::executor::{BatchExecutor, BatchOutcome};
use crate::job::{Job, JobId, JobSnapshot, JobStatus};
use crate::request::{self, JobOptions, TaskSpec};
use gradmap_core::Transform;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

enum Command {
    Submit(Job),
    Status {
        job_id: JobId,
        reply: oneshot::Sender<Option<JobSnapshot>>,
    },
    Cancel {
        job_id: JobId,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        job_id: JobId,
        sink: Arc<dyn ProgressSink>,
        reply: oneshot::Sender<Option<SubscriptionId>>,
    },
    Unsubscribe {
        job_id: JobId,
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    Outputs {
        job_id: JobId,
        reply: oneshot::Sender<Option<Vec<PathBuf>>>,
    },
    Progress {
        job_id: JobId,
        current: usize,
        message: String,
    },
    Finished {
        job_id: JobId,
        result: Result<BatchOutcome>,
    },
}

/// Handle to the job table; clone freely
#[derive(Clone)]
pub struct JobRegistry {
    commands: mpsc::UnboundedSender<Command>,
    config: Arc<EngineConfig>,
}

impl JobRegistry {
    /// Spawn the orchestrator on the current tokio runtime.
    ///
    /// The orchestrator stops once every handle is dropped and all running
    /// batches have reported back.
    pub fn start(config: EngineConfig, transform: Arc<dyn Transform>) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(OrchestratorError::fault)?;

        let config = Arc::new(config);
        let (commands, inbox) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator {
            jobs: HashMap::new(),
            pending: VecDeque::new(),
            active: 0,
            broadcaster: ProgressBroadcaster::new(),
            executor: Arc::new(BatchExecutor::new(transform)),
            config: Arc::clone(&config),
            commands: commands.downgrade(),
        };
        runtime.spawn(orchestrator.run(inbox));

        info!(
            "Job registry started (parallelism {}, max {} active jobs)",
            config.parallelism, config.max_active_jobs
        );
        Ok(Self { commands, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate and enqueue a job; returns before any task runs.
    ///
    /// A bad reference rejects the whole request and records nothing.
    pub fn create(&self, specs: &[TaskSpec], options: JobOptions) -> Result<JobId> {
        let prepared = request::prepare(&self.config, specs, &options)?;
        let parallelism = options.parallelism.unwrap_or(self.config.parallelism).max(1);

        let job = Job::new_queued(prepared.tasks, prepared.outputs, parallelism);
        let (job_id, total) = (job.id, job.total);

        self.commands
            .send(Command::Submit(job))
            .map_err(|_| OrchestratorError::RegistryClosed)?;

        info!("Created job {} with {} tasks", job_id, total);
        Ok(job_id)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(command(reply)).is_err() {
            warn!("Job registry is shut down");
            return None;
        }
        response.await.ok()
    }

    /// Snapshot of `job_id`, or `None` if unknown
    pub async fn status(&self, job_id: JobId) -> Option<JobSnapshot> {
        self.request(|reply| Command::Status { job_id, reply })
            .await
            .flatten()
    }

    /// Request cancellation. False for unknown, terminal, or already
    /// cancelling jobs; the terminal `cancelled` event is sent once.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        self.request(|reply| Command::Cancel { job_id, reply })
            .await
            .unwrap_or(false)
    }

    /// Register `sink` for `job_id`'s events; `None` if the job is unknown.
    ///
    /// A sink subscribing after the job ended receives its terminal event
    /// right away and is not registered.
    pub async fn subscribe(
        &self,
        job_id: JobId,
        sink: Arc<dyn ProgressSink>,
    ) -> Option<SubscriptionId> {
        self.request(|reply| Command::Subscribe {
            job_id,
            sink,
            reply,
        })
        .await
        .flatten()
    }

    pub async fn unsubscribe(&self, job_id: JobId, id: SubscriptionId) -> bool {
        self.request(|reply| Command::Unsubscribe { job_id, id, reply })
            .await
            .unwrap_or(false)
    }

    /// Expected outputs that exist on disk right now
    pub async fn outputs(&self, job_id: JobId) -> Option<Vec<PathBuf>> {
        let expected = self
            .request(|reply| Command::Outputs { job_id, reply })
            .await
            .flatten()?;

        let mut present = Vec::with_capacity(expected.len());
        for path in expected {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                present.push(path);
            }
        }
        Some(present)
    }

    /// Wait for `job_id` to reach a terminal state and return its snapshot
    pub async fn wait(&self, job_id: JobId) -> Option<JobSnapshot> {
        let (sink, mut events) = mpsc::unbounded_channel::<JobEvent>();
        self.subscribe(job_id, Arc::new(sink)).await?;

        while let Some(event) = events.recv().await {
            if event.is_terminal() {
                break;
            }
        }
        self.status(job_id).await
    }
}

struct JobEntry {
    job: Job,
    cancel: Arc<AtomicBool>,
}

/// The single owner of every [`Job`]
struct Orchestrator {
    jobs: HashMap<JobId, JobEntry>,
    pending: VecDeque<JobId>,
    active: usize,
    broadcaster: ProgressBroadcaster,
    executor: Arc<BatchExecutor>,
    config: Arc<EngineConfig>,
    /// Weak so that dropping every registry handle lets the loop end
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Orchestrator {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = inbox.recv().await {
            self.handle(command);
        }
        info!("Job orchestrator stopped ({} jobs recorded)", self.jobs.len());
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit(job) => self.on_submit(job),
            Command::Status { job_id, reply } => {
                let snapshot = self
                    .jobs
                    .get(&job_id)
                    .map(|entry| entry.job.snapshot(Some(self.config.download_ref(job_id))));
                let _ = reply.send(snapshot);
            }
            Command::Cancel { job_id, reply } => {
                let _ = reply.send(self.on_cancel(job_id));
            }
            Command::Subscribe {
                job_id,
                sink,
                reply,
            } => {
                let _ = reply.send(self.on_subscribe(job_id, sink));
            }
            Command::Unsubscribe { job_id, id, reply } => {
                let _ = reply.send(self.broadcaster.unsubscribe(job_id, id));
            }
            Command::Outputs { job_id, reply } => {
                let outputs = self.jobs.get(&job_id).map(|entry| entry.job.outputs.clone());
                let _ = reply.send(outputs);
            }
            Command::Progress {
                job_id,
                current,
                message,
            } => self.on_progress(job_id, current, &message),
            Command::Finished { job_id, result } => self.on_finished(job_id, result),
        }
    }

    fn on_submit(&mut self, job: Job) {
        let job_id = job.id;
        self.jobs.insert(
            job_id,
            JobEntry {
                job,
                cancel: Arc::new(AtomicBool::new(false)),
            },
        );
        self.pending.push_back(job_id);
        self.dispatch_pending();
    }

    fn dispatch_pending(&mut self) {
        while self.active < self.config.max_active_jobs {
            let Some(job_id) = self.pending.pop_front() else {
                break;
            };
            self.start_job(job_id);
        }
        if !self.pending.is_empty() {
            debug!("{} jobs waiting for a free slot", self.pending.len());
        }
    }

    fn start_job(&mut self, job_id: JobId) {
        let Some(commands) = self.commands.upgrade() else {
            self.fault(job_id, "job registry is shutting down");
            return;
        };
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            error!("Queued job {} missing from the job table", job_id);
            return;
        };
        if let Err(e) = entry.job.start() {
            warn!("Not starting job {}: {}", job_id, e);
            return;
        }

        let tasks = Arc::clone(&entry.job.tasks);
        let parallelism = entry.job.parallelism;
        let cancel = Arc::clone(&entry.cancel);
        let executor = Arc::clone(&self.executor);
        info!(
            "Job {} processing {} tasks with {} workers",
            job_id,
            tasks.len(),
            parallelism
        );

        self.active += 1;
        self.emit_progress(job_id, "Job started");

        tokio::spawn(async move {
            let progress = commands.clone();
            let batch = tokio::task::spawn_blocking(move || {
                executor.execute(
                    &tasks,
                    parallelism,
                    |current, _total, message| {
                        let _ = progress.send(Command::Progress {
                            job_id,
                            current,
                            message: message.to_string(),
                        });
                    },
                    || cancel.load(Ordering::Acquire),
                )
            })
            .await;

            let result = batch.unwrap_or_else(|e| {
                Err(OrchestratorError::fault(format!("batch worker terminated: {}", e)))
            });
            let _ = commands.send(Command::Finished { job_id, result });
        });
    }

    fn emit_progress(&mut self, job_id: JobId, message: &str) {
        let Some(entry) = self.jobs.get(&job_id) else {
            return;
        };
        let event = JobEvent::Progress {
            job_id,
            current: entry.job.current,
            total: entry.job.total,
            status: entry.job.status,
            message: message.to_string(),
        };
        self.broadcaster.broadcast(&event);
    }

    fn on_progress(&mut self, job_id: JobId, current: usize, message: &str) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        // Progress is frozen once cancellation is requested
        if entry.job.cancel_requested {
            debug!("Job {}: ignoring progress after cancel: {}", job_id, message);
            return;
        }
        if let Err(e) = entry.job.record_progress(current) {
            debug!("Job {}: dropping progress: {}", job_id, e);
            return;
        }
        self.emit_progress(job_id, message);
    }

    fn on_finished(&mut self, job_id: JobId, result: Result<BatchOutcome>) {
        self.active = self.active.saturating_sub(1);

        if let Some(entry) = self.jobs.get_mut(&job_id) {
            let job = &mut entry.job;
            let transition = if job.cancel_requested {
                job.cancel().map(|_| {
                    info!(
                        "Job {} cancelled after {} of {} tasks",
                        job_id, job.current, job.total
                    );
                })
            } else {
                match result {
                    Ok(outcome) => job.complete(outcome.failed).map(|status| {
                        info!(
                            "Job {} {}: {} succeeded, {} failed",
                            job_id, status, outcome.succeeded, outcome.failed
                        );
                        for message in &outcome.errors {
                            debug!("Job {}: {}", job_id, message);
                        }
                    }),
                    Err(e) => {
                        error!("Job {} faulted: {}", job_id, e);
                        job.fault(e.to_string())
                    }
                }
            };

            match transition {
                Ok(()) => self.broadcast_terminal(job_id),
                Err(e) => error!("Job {}: {}", job_id, e),
            }
        } else {
            error!("Finished job {} missing from the job table", job_id);
        }

        self.dispatch_pending();
    }

    fn on_cancel(&mut self, job_id: JobId) -> bool {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        if !entry.job.request_cancel() {
            return false;
        }
        entry.cancel.store(true, Ordering::Release);

        if entry.job.status == JobStatus::Queued {
            if let Err(e) = entry.job.cancel() {
                error!("Job {}: {}", job_id, e);
                return false;
            }
            self.pending.retain(|id| *id != job_id);
            info!("Job {} cancelled before start", job_id);
            self.broadcast_terminal(job_id);
        } else {
            info!("Job {} cancellation requested; in-flight tasks will finish", job_id);
        }
        true
    }

    fn on_subscribe(&mut self, job_id: JobId, sink: Arc<dyn ProgressSink>) -> Option<SubscriptionId> {
        let entry = self.jobs.get(&job_id)?;
        if let Some(event) = terminal_event(&self.config, &entry.job) {
            return Some(self.broadcaster.replay_terminal(sink.as_ref(), &event));
        }
        Some(self.broadcaster.subscribe(job_id, sink))
    }

    fn fault(&mut self, job_id: JobId, reason: &str) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        error!("Job {} faulted: {}", job_id, reason);
        if entry.job.fault(reason).is_ok() {
            self.broadcast_terminal(job_id);
        }
    }

    fn broadcast_terminal(&mut self, job_id: JobId) {
        let event = self
            .jobs
            .get(&job_id)
            .and_then(|entry| terminal_event(&self.config, &entry.job));
        if let Some(event) = event {
            self.broadcaster.broadcast(&event);
        }
    }
}

/// The terminal event for `job`, if it has reached a terminal state
fn terminal_event(config: &EngineConfig, job: &Job) -> Option<JobEvent> {
    let job_id = job.id;
    match job.status {
        JobStatus::Completed => Some(JobEvent::Completed {
            job_id,
            download_ref: config.download_ref(job_id),
        }),
        JobStatus::Cancelled => Some(JobEvent::Cancelled { job_id }),
        JobStatus::Failed => Some(JobEvent::Failed {
            job_id,
            message: job.failure.clone().unwrap_or_else(|| "Job failed".to_string()),
        }),
        JobStatus::Queued | JobStatus::Processing => None,
    }
}
