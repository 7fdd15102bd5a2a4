#![allow(clippy::disallowed_methods)]

use std::error::Error;
use std::time::{Duration, Instant};

use hotqueue::{
    HotQueue, JobContext, JobEvent, JobId, JobOptions, JobPolicy, JobState, ProcessOptions,
    QueueConfig, QueueError, SchedulerConfig,
};
use serde_json::json;

const SETTLE: Duration = Duration::from_secs(5);

fn quick_config() -> QueueConfig {
    QueueConfig::default().with_scheduler(SchedulerConfig {
        interval_ms: 50,
        fuzz_ms: 10,
        ..SchedulerConfig::default()
    })
}

async fn wait_complete(queue: &HotQueue, id: JobId) -> Result<hotqueue::JobView, Box<dyn Error>> {
    let deadline = Instant::now() + SETTLE;
    loop {
        let job = queue.get(id).await?;
        if job.complete {
            return Ok(job);
        }
        if Instant::now() >= deadline {
            return Err(format!("job {} still {}", id, job.state).into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_create_then_get() -> Result<(), Box<dyn Error>> {
    let queue = HotQueue::memory(QueueConfig::default());

    let created = queue
        .create("thumbnail", json!({"path": "a.png"}), &JobOptions::new())
        .await?;
    assert!(created.hotjob.is_none());

    let job = queue.get(created.job.id).await?;
    assert_eq!(job.name, "thumbnail");
    assert_eq!(job.data, json!({"path": "a.png"}));
    assert_eq!(job.state, JobState::New);
    assert_eq!(job.policy, JobPolicy::default());
    assert!(job.runs.is_empty());

    let delayed = queue
        .create("thumbnail", json!(null), &JobOptions::new().with_delay(30.0))
        .await?;
    assert_eq!(queue.get(delayed.job.id).await?.state, JobState::Delayed);

    let counts = queue.counts().await?;
    assert_eq!(counts[&JobState::New], 1);
    assert_eq!(counts[&JobState::Delayed], 1);
    Ok(())
}

#[tokio::test]
async fn test_get_missing_job() -> Result<(), Box<dyn Error>> {
    let queue = HotQueue::memory(QueueConfig::default());
    assert!(matches!(queue.get(JobId(42)).await, Err(QueueError::NoRecord(JobId(42)))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hotjob_resolves_on_success() -> Result<(), Box<dyn Error>> {
    let queue = HotQueue::memory(quick_config());
    queue
        .process(["resize"], ProcessOptions::default(), |ctx: JobContext| async move {
            if ctx.data()["width"].as_u64() == Some(0) {
                return Err("zero width".to_string());
            }
            Ok(())
        })
        .await?;

    let created = queue
        .create("resize", json!({"width": 64}), &JobOptions::new().with_hotjob(3_000))
        .await?;
    let hotjob = created.hotjob.ok_or("hotjob handle missing")?;
    assert_eq!(hotjob.job_id(), created.job.id);

    let finished = hotjob.wait().await?;
    assert!(finished.complete);
    assert!(finished.success);
    assert_eq!(finished.state, JobState::Success);

    queue.reset().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hotjob_rejects_with_last_error() -> Result<(), Box<dyn Error>> {
    let queue = HotQueue::memory(quick_config());
    queue
        .process(["resize"], ProcessOptions::default(), |_ctx: JobContext| async {
            Err("zero width".to_string())
        })
        .await?;

    let options = JobOptions::new().with_hotjob(3_000).without_retry();
    let created = queue.create("resize", json!({"width": 0}), &options).await?;
    let hotjob = created.hotjob.ok_or("hotjob handle missing")?;

    match hotjob.wait().await {
        Err(QueueError::JobFailed { id, message }) => {
            assert_eq!(id, created.job.id);
            assert_eq!(message, "zero width");
        }
        other => return Err(format!("unexpected hotjob result: {:?}", other).into()),
    }

    queue.reset().await?;
    Ok(())
}

#[tokio::test]
async fn test_hotjob_times_out_without_workers() -> Result<(), Box<dyn Error>> {
    let queue = HotQueue::memory(QueueConfig::default());
    let created = queue
        .create("resize", json!(null), &JobOptions::new().with_hotjob(50))
        .await?;
    let hotjob = created.hotjob.ok_or("hotjob handle missing")?;

    let result = hotjob.wait().await;
    assert!(matches!(result, Err(ref e) if e.is_timeout()), "{:?}", result);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delayed_job_is_processed_after_delay() -> Result<(), Box<dyn Error>> {
    let queue = HotQueue::memory(quick_config());
    queue
        .process(["digest"], ProcessOptions::default(), |_ctx: JobContext| async { Ok(()) })
        .await?;

    let started = Instant::now();
    let created = queue
        .create("digest", json!(null), &JobOptions::new().with_delay(1.0))
        .await?;
    assert_eq!(created.job.state, JobState::Delayed);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(queue.get(created.job.id).await?.state, JobState::Delayed);

    let job = wait_complete(&queue, created.job.id).await?;
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(job.state, JobState::Success);

    queue.reset().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_overdue_job_runs_when_processing_starts_late() -> Result<(), Box<dyn Error>> {
    let queue = HotQueue::memory(QueueConfig::default().with_scheduler(SchedulerConfig {
        interval_ms: 50,
        fuzz_ms: 10,
        look_ahead_ms: 200,
        ..SchedulerConfig::default()
    }));
    let created = queue
        .create("late", json!(null), &JobOptions::new().with_delay(0.1))
        .await?;

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(queue.get(created.job.id).await?.state, JobState::Delayed);

    queue
        .process(["late"], ProcessOptions::default(), |_ctx: JobContext| async { Ok(()) })
        .await?;
    let job = wait_complete(&queue, created.job.id).await?;
    assert_eq!(job.state, JobState::Success);

    queue.reset().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_events_follow_the_lifecycle() -> Result<(), Box<dyn Error>> {
    let queue = HotQueue::memory(quick_config());
    let mut events = queue.subscribe_events();
    queue
        .process(
            ["audit"],
            ProcessOptions::default().with_concurrent_jobs(2),
            |_ctx: JobContext| async { Ok(()) },
        )
        .await?;

    let created = queue.create("audit", json!(1), &JobOptions::new()).await?;
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + SETTLE;
    while !seen.iter().any(|e| matches!(e, JobEvent::Completed { .. })) {
        let event = tokio::time::timeout_at(deadline, events.recv()).await??;
        assert_eq!(event.job_id(), created.job.id);
        seen.push(event);
    }
    assert!(matches!(seen[0], JobEvent::Created { .. }));
    assert!(matches!(seen[1], JobEvent::Queued { .. }));

    queue.reset().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reset_disposes_everything() -> Result<(), Box<dyn Error>> {
    let queue = HotQueue::memory(quick_config());
    let pool = queue
        .process(["a", "b"], ProcessOptions::default().with_concurrent_jobs(3), |_ctx: JobContext| async {
            Ok(())
        })
        .await?;
    assert_eq!(pool.stats().await?.workers, 3);

    queue.settings().update(|c| c.purge_timeout_ms = 10);
    queue.create("a", json!(null), &JobOptions::new()).await?;

    queue.reset().await?;
    queue.reset().await?;
    assert!(pool.is_disposed());
    assert_eq!(queue.settings().current(), QueueConfig::default());
    assert!(matches!(queue.get(JobId(1)).await, Err(QueueError::NoRecord(_))));
    Ok(())
}

#[tokio::test]
async fn test_process_needs_a_name() -> Result<(), Box<dyn Error>> {
    let queue = HotQueue::memory(QueueConfig::default());
    let names: Vec<String> = Vec::new();
    let result = queue
        .process(names, ProcessOptions::default(), |_ctx: JobContext| async { Ok(()) })
        .await;
    assert!(result.is_err());
    Ok(())
}
