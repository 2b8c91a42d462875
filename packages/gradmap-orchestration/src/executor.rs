//! Batch executor
//!
//! Drains a list of [`TaskDescriptor`]s through a [`Transform`], either
//! inline (`parallelism == 1`) or over a dedicated rayon pool.
//!
//! - At most `parallelism` tasks are in flight; the next one is dispatched
//!   only after a completion, and `cancel_check` is polled before each
//!   dispatch. Once it returns true nothing new is started, in-flight tasks
//!   run to completion, and never-started tasks produce no message.
//! - `on_progress(completed, total, message)` runs on the calling thread,
//!   exactly once per started task, in completion order.
//! - A failing or panicking transform is one failed task, never a failed
//!   batch.

use crate::error::{OrchestratorError, Result};
use gradmap_core::{TaskDescriptor, Transform};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use tracing::{debug, error, info};

/// Aggregated result of one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
    /// One message per failed task
    pub errors: Vec<String>,
}

impl BatchOutcome {
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }

    fn record(&mut self, report: &TaskReport) {
        if report.succeeded {
            self.succeeded += 1;
        } else {
            self.failed += 1;
            self.errors.push(report.message.clone());
        }
    }
}

#[derive(Debug)]
struct TaskReport {
    succeeded: bool,
    message: String,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_task(transform: &dyn Transform, task: &TaskDescriptor) -> TaskReport {
    match panic::catch_unwind(AssertUnwindSafe(|| transform.apply(task))) {
        Ok(Ok(message)) => TaskReport {
            succeeded: true,
            message,
        },
        Ok(Err(e)) => TaskReport {
            succeeded: false,
            message: format!("Error processing {}: {}", task.input_name(), e),
        },
        Err(payload) => TaskReport {
            succeeded: false,
            message: format!(
                "Error processing {}: transform panicked: {}",
                task.input_name(),
                panic_message(payload.as_ref())
            ),
        },
    }
}

pub struct BatchExecutor {
    transform: Arc<dyn Transform>,
}

impl BatchExecutor {
    pub fn new(transform: Arc<dyn Transform>) -> Self {
        Self { transform }
    }

    /// Run `tasks`; blocks the calling thread until the batch is drained
    /// or cancelled and all in-flight work has returned.
    pub fn execute<P, C>(
        &self,
        tasks: &[TaskDescriptor],
        parallelism: usize,
        on_progress: P,
        cancel_check: C,
    ) -> Result<BatchOutcome>
    where
        P: FnMut(usize, usize, &str),
        C: Fn() -> bool,
    {
        if tasks.is_empty() {
            return Ok(BatchOutcome::default());
        }

        if parallelism <= 1 {
            Ok(self.execute_sequential(tasks, on_progress, cancel_check))
        } else {
            self.execute_parallel(tasks, parallelism, on_progress, cancel_check)
        }
    }

    fn execute_sequential<P, C>(
        &self,
        tasks: &[TaskDescriptor],
        mut on_progress: P,
        cancel_check: C,
    ) -> BatchOutcome
    where
        P: FnMut(usize, usize, &str),
        C: Fn() -> bool,
    {
        let total = tasks.len();
        let mut outcome = BatchOutcome::default();

        for (i, task) in tasks.iter().enumerate() {
            if cancel_check() {
                info!("Batch cancelled after {} of {} tasks", i, total);
                break;
            }

            let report = run_task(self.transform.as_ref(), task);
            outcome.record(&report);
            debug!("Task {}/{}: {}", i + 1, total, report.message);
            on_progress(i + 1, total, &report.message);
        }

        outcome
    }

    fn execute_parallel<P, C>(
        &self,
        tasks: &[TaskDescriptor],
        parallelism: usize,
        mut on_progress: P,
        cancel_check: C,
    ) -> Result<BatchOutcome>
    where
        P: FnMut(usize, usize, &str),
        C: Fn() -> bool,
    {
        let total = tasks.len();
        let workers = parallelism.min(total);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("gradmap-worker-{}", i))
            .build()
            .map_err(|e| OrchestratorError::WorkerPool(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<TaskReport>();
        let dispatch = |task: &TaskDescriptor| {
            let transform = Arc::clone(&self.transform);
            let task = task.clone();
            let tx = tx.clone();
            pool.spawn(move || {
                // Receiver outlives every dispatched task
                let _ = tx.send(run_task(transform.as_ref(), &task));
            });
        };

        let mut outcome = BatchOutcome::default();
        let mut next = 0;
        let mut in_flight = 0;
        let mut cancelled = false;

        while next < total && in_flight < workers {
            if cancel_check() {
                cancelled = true;
                break;
            }
            dispatch(&tasks[next]);
            next += 1;
            in_flight += 1;
        }

        while in_flight > 0 {
            let report = match rx.recv() {
                Ok(report) => report,
                Err(_) => {
                    error!("Worker channel closed with {} tasks in flight", in_flight);
                    break;
                }
            };
            in_flight -= 1;

            outcome.record(&report);
            let completed = outcome.processed();
            debug!("Task {}/{}: {}", completed, total, report.message);
            on_progress(completed, total, &report.message);

            if !cancelled && next < total {
                if cancel_check() {
                    cancelled = true;
                } else {
                    dispatch(&tasks[next]);
                    next += 1;
                    in_flight += 1;
                }
            }
        }

        if cancelled {
            info!(
                "Batch cancelled: {} of {} tasks started, {} abandoned",
                next,
                total,
                total - next
            );
        }

        Ok(outcome)
    }
}
