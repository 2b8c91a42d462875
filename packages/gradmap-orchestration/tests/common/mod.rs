//! Shared fixtures for registry integration tests

#![allow(dead_code)]

use gradmap_core::{TaskDescriptor, Transform, TransformError};
use gradmap_orchestration::{EngineConfig, JobEvent, JobId, JobRegistry, JobSnapshot};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Temp dir with `input/`, `gradients/` and an `output/` root
pub struct Sandbox {
    pub dir: TempDir,
    pub config: EngineConfig,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input");
        let gradients = dir.path().join("gradients");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&gradients).unwrap();

        let config = EngineConfig::default()
            .with_roots(input, gradients, dir.path().join("output"))
            .with_parallelism(2)
            .with_max_active_jobs(4);
        Self { dir, config }
    }

    /// Placeholder inputs; stub transforms never decode them
    pub fn with_inputs(self, names: &[&str]) -> Self {
        for name in names {
            std::fs::write(self.config.input_root.join(name), b"stub").unwrap();
        }
        std::fs::write(self.config.gradient_root.join("g.png"), b"stub").unwrap();
        self
    }

    pub fn start(&self, transform: Arc<dyn Transform>) -> JobRegistry {
        JobRegistry::start(self.config.clone(), transform).unwrap()
    }
}

fn write_output(task: &TaskDescriptor) -> Result<String, TransformError> {
    if task.input_name().starts_with("fail") {
        return Err(TransformError::rejected("unreadable image"));
    }
    std::fs::write(task.output(), b"mapped")?;
    Ok(format!("Created: {}", task.output_name()))
}

/// Writes a marker output; inputs named `fail*` fail
pub struct StubTransform;

impl Transform for StubTransform {
    fn apply(&self, task: &TaskDescriptor) -> Result<String, TransformError> {
        write_output(task)
    }
}

/// Counting semaphore the tests release by hand
#[derive(Default)]
pub struct Gate {
    permits: Mutex<usize>,
    released: Condvar,
    started: AtomicUsize,
}

impl Gate {
    pub fn release(&self, n: usize) {
        let mut permits = self.permits.lock().unwrap();
        *permits += n;
        self.released.notify_all();
    }

    pub fn open(&self) {
        self.release(usize::MAX / 2);
    }

    /// Tasks that have entered the transform
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn pass(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.released.wait(permits).unwrap();
        }
        *permits -= 1;
    }
}

/// Like [`StubTransform`], but every task waits for a gate permit first
pub struct GatedTransform {
    pub gate: Arc<Gate>,
}

impl GatedTransform {
    pub fn new() -> (Arc<Self>, Arc<Gate>) {
        let gate = Arc::new(Gate::default());
        (
            Arc::new(Self {
                gate: Arc::clone(&gate),
            }),
            gate,
        )
    }
}

impl Transform for GatedTransform {
    fn apply(&self, task: &TaskDescriptor) -> Result<String, TransformError> {
        self.gate.pass();
        write_output(task)
    }
}

/// Channel sink plus its receiving end
pub async fn subscribe(
    registry: &JobRegistry,
    job_id: JobId,
) -> mpsc::UnboundedReceiver<JobEvent> {
    let (tx, rx) = mpsc::unbounded_channel::<JobEvent>();
    registry
        .subscribe(job_id, Arc::new(tx))
        .await
        .expect("job should exist");
    rx
}

/// Receive until the terminal event (inclusive) or channel close
pub async fn collect_events(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    tokio::time::timeout(TIMEOUT, async {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    })
    .await
    .expect("timed out waiting for job events")
}

pub async fn wait_terminal(registry: &JobRegistry, job_id: JobId) -> JobSnapshot {
    tokio::time::timeout(TIMEOUT, registry.wait(job_id))
        .await
        .expect("timed out waiting for job")
        .expect("job should exist")
}

/// Poll status until `pred` holds
pub async fn wait_until<F>(registry: &JobRegistry, job_id: JobId, pred: F) -> JobSnapshot
where
    F: Fn(&JobSnapshot) -> bool,
{
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let snapshot = registry.status(job_id).await.expect("job should exist");
            if pred(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out polling job status")
}

/// Progress events that report a finished task
pub fn task_progress(events: &[JobEvent]) -> Vec<usize> {
    events
        .iter()
        .filter_map(|event| match event {
            JobEvent::Progress { current, .. } if *current > 0 => Some(*current),
            _ => None,
        })
        .collect()
}

pub fn exists(path: &Path) -> bool {
    path.is_file()
}
