//! Integration tests for the job registry
//!
//! Covers the job lifecycle end to end:
//! - Completion, partial failure and total failure
//! - Cancellation while queued and mid-run
//! - Admission control across jobs
//! - Subscriber fan-out, late subscribers and unsubscribe
//! - Output listing and request validation

mod common;

use common::*;
use gradmap_core::{GradientMapTransform, OutputFormat};
use gradmap_orchestration::{
    CallbackSink, JobEvent, JobId, JobOptions, JobStatus, OrchestratorError, SinkError, TaskSpec,
    ValidationError,
};
use image::{Rgb, RgbImage, Rgba, RgbaImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn specs(names: &[&str]) -> Vec<TaskSpec> {
    names.iter().map(|name| TaskSpec::new(*name, "g.png")).collect()
}

fn sequential() -> JobOptions {
    JobOptions {
        parallelism: Some(1),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_job_completes_and_reports_every_task() {
    let sandbox = Sandbox::new().with_inputs(&["a.png", "b.png", "c.png"]);
    let registry = sandbox.start(Arc::new(StubTransform));

    let job_id = registry
        .create(&specs(&["a.png", "b.png", "c.png"]), JobOptions::default())
        .unwrap();
    let mut rx = subscribe(&registry, job_id).await;
    let events = collect_events(&mut rx).await;

    assert_eq!(task_progress(&events), vec![1, 2, 3]);
    assert_eq!(
        events.last(),
        Some(&JobEvent::Completed {
            job_id,
            download_ref: format!("/api/jobs/{}/download", job_id),
        })
    );
    // Sink is dropped after the terminal event
    assert!(rx.recv().await.is_none());

    let snapshot = registry.status(job_id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!((snapshot.current, snapshot.total), (3, 3));
    assert_eq!(snapshot.error_count, 0);
    assert!(snapshot.download_available);
    assert!(snapshot.completed_at.is_some());

    let outputs = registry.outputs(job_id).await.unwrap();
    assert_eq!(outputs.len(), 3);
    assert!(outputs.iter().all(|path| exists(path)));
}

#[tokio::test]
async fn test_partial_failure_still_completes() {
    let sandbox = Sandbox::new().with_inputs(&["a.png", "fail.png", "c.png"]);
    let registry = sandbox.start(Arc::new(StubTransform));

    let job_id = registry
        .create(&specs(&["a.png", "fail.png", "c.png"]), JobOptions::default())
        .unwrap();
    let snapshot = wait_terminal(&registry, job_id).await;

    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.current, 3);
    assert_eq!(snapshot.error_count, 1);
    assert!(snapshot.download_available);
    assert_eq!(registry.outputs(job_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_all_tasks_failing_fails_the_job() {
    let sandbox = Sandbox::new().with_inputs(&["fail1.png", "fail2.png"]);
    let registry = sandbox.start(Arc::new(StubTransform));

    let job_id = registry
        .create(&specs(&["fail1.png", "fail2.png"]), JobOptions::default())
        .unwrap();
    let mut rx = subscribe(&registry, job_id).await;
    let events = collect_events(&mut rx).await;

    assert_eq!(
        events.last(),
        Some(&JobEvent::Failed {
            job_id,
            message: "All 2 tasks failed".to_string(),
        })
    );
    let snapshot = registry.status(job_id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.error_count, 2);
    assert!(!snapshot.download_available);
    assert!(snapshot.download_ref.is_none());
    assert!(registry.outputs(job_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_queued_job_never_starts() {
    let mut sandbox = Sandbox::new().with_inputs(&["a.png", "b.png", "c.png"]);
    sandbox.config = sandbox.config.with_max_active_jobs(1);
    let (transform, gate) = GatedTransform::new();
    let registry = sandbox.start(transform);

    let running = registry.create(&specs(&["a.png"]), JobOptions::default()).unwrap();
    let queued = registry
        .create(&specs(&["b.png", "c.png"]), JobOptions::default())
        .unwrap();
    assert_eq!(registry.status(queued).await.unwrap().status, JobStatus::Queued);

    let mut rx = subscribe(&registry, queued).await;
    assert!(registry.cancel(queued).await);
    assert!(!registry.cancel(queued).await);

    let events = collect_events(&mut rx).await;
    assert_eq!(events, vec![JobEvent::Cancelled { job_id: queued }]);

    let snapshot = registry.status(queued).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Cancelled);
    assert_eq!(snapshot.current, 0);
    assert!(snapshot.completed_at.is_some());

    gate.open();
    assert_eq!(wait_terminal(&registry, running).await.status, JobStatus::Completed);
    assert_eq!(gate.started(), 1);
    assert!(registry.outputs(queued).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_mid_run_stops_dispatch_and_freezes_progress() {
    let names = ["a.png", "b.png", "c.png", "d.png", "e.png"];
    let sandbox = Sandbox::new().with_inputs(&names);
    let (transform, gate) = GatedTransform::new();
    let registry = sandbox.start(transform);

    let job_id = registry.create(&specs(&names), sequential()).unwrap();
    let mut rx = subscribe(&registry, job_id).await;

    gate.release(2);
    wait_until(&registry, job_id, |s| s.current == 2).await;

    assert!(registry.cancel(job_id).await);
    assert!(!registry.cancel(job_id).await);
    gate.open();

    let events = collect_events(&mut rx).await;
    assert_eq!(events.last(), Some(&JobEvent::Cancelled { job_id }));
    assert_eq!(
        events.iter().filter(|e| e.is_terminal()).count(),
        1,
        "exactly one terminal event"
    );
    assert!(task_progress(&events).iter().all(|current| *current <= 2));
    assert!(rx.recv().await.is_none());

    let snapshot = registry.status(job_id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Cancelled);
    assert_eq!(snapshot.current, 2);
    assert!(!snapshot.download_available);

    // The task in flight at cancel time finishes; nothing after it starts
    assert!(gate.started() <= 3);
    assert!(!registry.cancel(job_id).await);
}

#[tokio::test]
async fn test_admission_limit_queues_extra_jobs() {
    let mut sandbox = Sandbox::new().with_inputs(&["a.png", "b.png"]);
    sandbox.config = sandbox.config.with_max_active_jobs(1);
    let (transform, gate) = GatedTransform::new();
    let registry = sandbox.start(transform);

    let first = registry.create(&specs(&["a.png"]), JobOptions::default()).unwrap();
    let second = registry.create(&specs(&["b.png"]), JobOptions::default()).unwrap();

    wait_until(&registry, first, |s| s.status == JobStatus::Processing).await;
    assert_eq!(registry.status(second).await.unwrap().status, JobStatus::Queued);

    gate.open();
    assert_eq!(wait_terminal(&registry, first).await.status, JobStatus::Completed);
    assert_eq!(wait_terminal(&registry, second).await.status, JobStatus::Completed);
    assert_eq!(gate.started(), 2);
}

#[tokio::test]
async fn test_queued_subscriber_sees_job_started() {
    let mut sandbox = Sandbox::new().with_inputs(&["a.png", "b.png"]);
    sandbox.config = sandbox.config.with_max_active_jobs(1);
    let (transform, gate) = GatedTransform::new();
    let registry = sandbox.start(transform);

    let _first = registry.create(&specs(&["a.png"]), JobOptions::default()).unwrap();
    let second = registry.create(&specs(&["b.png"]), JobOptions::default()).unwrap();
    let mut rx = subscribe(&registry, second).await;

    gate.open();
    let events = collect_events(&mut rx).await;
    assert_eq!(
        events.first(),
        Some(&JobEvent::Progress {
            job_id: second,
            current: 0,
            total: 1,
            status: JobStatus::Processing,
            message: "Job started".to_string(),
        })
    );
    assert!(matches!(events.last(), Some(JobEvent::Completed { .. })));
}

#[tokio::test]
async fn test_unknown_job_ids() {
    let sandbox = Sandbox::new();
    let registry = sandbox.start(Arc::new(StubTransform));
    let unknown = JobId::new();

    assert!(registry.status(unknown).await.is_none());
    assert!(!registry.cancel(unknown).await);
    assert!(registry.outputs(unknown).await.is_none());
    assert!(registry.wait(unknown).await.is_none());

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel::<JobEvent>();
    assert!(registry.subscribe(unknown, Arc::new(tx)).await.is_none());
}

#[tokio::test]
async fn test_late_subscriber_gets_terminal_event_once() {
    let sandbox = Sandbox::new().with_inputs(&["a.png"]);
    let registry = sandbox.start(Arc::new(StubTransform));

    let job_id = registry.create(&specs(&["a.png"]), JobOptions::default()).unwrap();
    wait_terminal(&registry, job_id).await;

    let mut rx = subscribe(&registry, job_id).await;
    assert!(matches!(
        rx.recv().await,
        Some(JobEvent::Completed { job_id: id, .. }) if id == job_id
    ));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_unsubscribe_drops_the_sink() {
    let sandbox = Sandbox::new().with_inputs(&["a.png"]);
    let (transform, gate) = GatedTransform::new();
    let registry = sandbox.start(transform);

    let job_id = registry.create(&specs(&["a.png"]), JobOptions::default()).unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<JobEvent>();
    let id = registry.subscribe(job_id, Arc::new(tx)).await.unwrap();

    assert!(registry.unsubscribe(job_id, id).await);
    assert!(!registry.unsubscribe(job_id, id).await);
    assert!(rx.recv().await.is_none());

    gate.open();
    assert_eq!(wait_terminal(&registry, job_id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_failing_subscriber_does_not_starve_others() {
    let sandbox = Sandbox::new().with_inputs(&["a.png", "b.png"]);
    let (transform, gate) = GatedTransform::new();
    let registry = sandbox.start(transform);

    let job_id = registry
        .create(&specs(&["a.png", "b.png"]), JobOptions::default())
        .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    registry
        .subscribe(
            job_id,
            Arc::new(CallbackSink::new(move |_: &JobEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SinkError::Rejected("connection reset".to_string()))
            })),
        )
        .await
        .unwrap();
    let mut rx = subscribe(&registry, job_id).await;

    gate.open();
    let events = collect_events(&mut rx).await;
    assert_eq!(task_progress(&events), vec![1, 2]);
    assert!(matches!(events.last(), Some(JobEvent::Completed { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), events.len());
}

#[tokio::test]
async fn test_outputs_reflect_disk() {
    let sandbox = Sandbox::new().with_inputs(&["a.png", "b.png", "c.png"]);
    let registry = sandbox.start(Arc::new(StubTransform));

    let options = JobOptions {
        prefix: Some("mapped".to_string()),
        ..Default::default()
    };
    let job_id = registry
        .create(&specs(&["a.png", "b.png", "c.png"]), options)
        .unwrap();
    wait_terminal(&registry, job_id).await;

    let outputs = registry.outputs(job_id).await.unwrap();
    assert_eq!(
        outputs[0],
        sandbox.config.output_root.join("mapped_a_g.png")
    );

    std::fs::remove_file(&outputs[1]).unwrap();
    let remaining = registry.outputs(job_id).await.unwrap();
    assert_eq!(remaining, vec![outputs[0].clone(), outputs[2].clone()]);
}

#[tokio::test]
async fn test_invalid_requests_record_no_job() {
    let sandbox = Sandbox::new().with_inputs(&["a.png"]);
    std::fs::write(sandbox.dir.path().join("secret.png"), b"x").unwrap();
    let registry = sandbox.start(Arc::new(StubTransform));

    let err = registry
        .create(&[TaskSpec::new("../secret.png", "g.png")], JobOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Validation(ValidationError::OutsideSandbox { .. })
    ));

    let err = registry
        .create(&[TaskSpec::new("a.png", "missing.png")], JobOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Validation(ValidationError::NotFound { .. })
    ));

    let err = registry.create(&[], JobOptions::default()).unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(ValidationError::EmptyJob)));

    assert!(!sandbox.config.output_root.exists());
}

#[tokio::test]
async fn test_concurrent_status_queries_see_consistent_snapshots() {
    let names = ["a.png", "b.png", "c.png", "d.png"];
    let sandbox = Sandbox::new().with_inputs(&names);
    let (transform, gate) = GatedTransform::new();
    let registry = sandbox.start(transform);
    let job_id = registry.create(&specs(&names), JobOptions::default()).unwrap();

    let pollers: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut last = 0;
                loop {
                    let snapshot = registry.status(job_id).await.unwrap();
                    assert!(snapshot.current >= last);
                    assert!(snapshot.current <= snapshot.total);
                    last = snapshot.current;
                    if snapshot.status.is_terminal() {
                        return snapshot.current;
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    gate.open();
    for poller in pollers {
        assert_eq!(poller.await.unwrap(), 4);
    }
}

#[tokio::test]
async fn test_gradient_map_end_to_end() {
    let sandbox = Sandbox::new();
    let base = RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 255]));
    base.save(sandbox.config.input_root.join("photo.png")).unwrap();
    let gradient = RgbImage::from_pixel(16, 2, Rgb([20, 120, 220]));
    gradient
        .save(sandbox.config.gradient_root.join("cool.png"))
        .unwrap();
    std::fs::write(sandbox.config.input_root.join("broken.png"), b"not an image").unwrap();

    let registry = sandbox.start(Arc::new(GradientMapTransform::new()));
    let options = JobOptions {
        output_format: OutputFormat::Webp,
        ..Default::default()
    };
    let job_id = registry
        .create(
            &[
                TaskSpec::new("photo.png", "cool.png"),
                TaskSpec::new("broken.png", "cool.png"),
            ],
            options,
        )
        .unwrap();
    let snapshot = wait_terminal(&registry, job_id).await;

    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.error_count, 1);

    let outputs = registry.outputs(job_id).await.unwrap();
    assert_eq!(outputs, vec![sandbox.config.output_root.join("photo_cool.webp")]);
    let mapped = image::open(&outputs[0]).unwrap().to_rgba8();
    assert_eq!(mapped.dimensions(), (4, 4));
    assert_eq!(*mapped.get_pixel(0, 0), Rgba([20, 120, 220, 255]));
}
