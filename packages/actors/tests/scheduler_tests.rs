#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::time::{Duration, Instant};

use actors::{JobContext, spawn_pool, start_scheduler};
use queue_core::{JobOptions, JobState, QueueConfig, QueueError, ScheduleSet, SchedulerConfig};
use serde_json::json;

const SETTLE: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread")]
async fn test_delayed_job_runs_after_its_delay() -> Result<(), Box<dyn Error>> {
    let jobs = common::job_store(common::fast_config());
    let scheduler = start_scheduler(jobs.clone()).await?;
    let pool = spawn_pool(
        vec!["report".into()],
        1,
        jobs.clone(),
        common::handler(|_ctx: JobContext| async { Ok(()) }),
    )
    .await?;

    let started = Instant::now();
    let created = jobs
        .create("report", json!({"month": 3}), &JobOptions::new().with_delay(0.3))
        .await?;
    assert_eq!(created.job.state, JobState::Delayed);

    let job = common::wait_for(&jobs, created.job.id, SETTLE, |job| job.complete).await?;
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(job.state, JobState::Success);
    assert_eq!(job.runs.len(), 1);
    assert_eq!(jobs.scheduled_count(ScheduleSet::Scheduled).await?, 0);

    pool.dispose().await;
    scheduler.dispose().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_activation_requeues_without_workers() -> Result<(), Box<dyn Error>> {
    let jobs = common::job_store(common::fast_config());
    let scheduler = start_scheduler(jobs.clone()).await?;

    let created = jobs
        .create("report", json!(null), &JobOptions::new().with_delay(0.1))
        .await?;
    let job = common::wait_for(&jobs, created.job.id, SETTLE, |job| job.state == JobState::Queued).await?;
    assert!(job.scheduled_for.is_none());
    assert_eq!(jobs.queue_length("report").await?, 1);

    scheduler.dispose().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cadence_change_applies_live() -> Result<(), Box<dyn Error>> {
    let config = common::fast_config().with_scheduler(SchedulerConfig {
        interval_ms: 60_000,
        fuzz_ms: 0,
        ..SchedulerConfig::default()
    });
    let jobs = common::job_store(config);
    let scheduler = start_scheduler(jobs.clone()).await?;

    // Let the first ping pass before the job exists.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let created = jobs
        .create("report", json!(null), &JobOptions::new().with_delay(0.05))
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(jobs.fetch(created.job.id).await?.state, JobState::Delayed);

    jobs.settings().update(|c| c.scheduler.interval_ms = 20);
    let job = common::wait_for(&jobs, created.job.id, SETTLE, |job| job.state == JobState::Queued).await?;
    assert_eq!(job.state, JobState::Queued);

    scheduler.dispose().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_long_overdue_job_runs_once_a_worker_registers() -> Result<(), Box<dyn Error>> {
    let jobs = common::job_store(common::fast_config().with_scheduler(SchedulerConfig {
        interval_ms: 20,
        fuzz_ms: 0,
        look_ahead_ms: 100,
        ..SchedulerConfig::default()
    }));
    let created = jobs
        .create("report", json!(null), &JobOptions::new().with_delay(0.05))
        .await?;

    // Due time is now several windows in the past.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(jobs.fetch(created.job.id).await?.state, JobState::Delayed);

    let scheduler = start_scheduler(jobs.clone()).await?;
    let pool = spawn_pool(
        vec!["report".into()],
        1,
        jobs.clone(),
        common::handler(|_ctx: JobContext| async { Ok(()) }),
    )
    .await?;

    let job = common::wait_for(&jobs, created.job.id, SETTLE, |job| job.complete).await?;
    assert_eq!(job.state, JobState::Success);
    assert_eq!(jobs.scheduled_count(ScheduleSet::Scheduled).await?, 0);

    pool.dispose().await;
    scheduler.dispose().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_finished_jobs_are_purged() -> Result<(), Box<dyn Error>> {
    let jobs = common::job_store(common::fast_config().with_purge(true, 100));
    let scheduler = start_scheduler(jobs.clone()).await?;
    let pool = spawn_pool(
        vec!["mail".into()],
        1,
        jobs.clone(),
        common::handler(|_ctx: JobContext| async { Ok(()) }),
    )
    .await?;

    let created = jobs.create("mail", json!(null), &JobOptions::new()).await?;
    let id = created.job.id;

    let deadline = Instant::now() + SETTLE;
    loop {
        match jobs.fetch(id).await {
            Err(QueueError::NoRecord(_)) => break,
            Ok(_) if Instant::now() < deadline => tokio::time::sleep(Duration::from_millis(20)).await,
            Ok(job) => return Err(format!("job still {} after purge timeout", job.state).into()),
            Err(e) => return Err(e.into()),
        }
    }
    let counts = jobs.count_by_state().await?;
    assert_eq!(counts[&JobState::Success], 0);
    assert_eq!(jobs.scheduled_count(ScheduleSet::ScheduledPurge).await?, 0);

    pool.dispose().await;
    scheduler.dispose().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_purge_disabled_keeps_records() -> Result<(), Box<dyn Error>> {
    let jobs = common::job_store(common::fast_config().with_purge(false, 50));
    let scheduler = start_scheduler(jobs.clone()).await?;
    let pool = spawn_pool(
        vec!["mail".into()],
        1,
        jobs.clone(),
        common::handler(|_ctx: JobContext| async { Ok(()) }),
    )
    .await?;

    let created = jobs.create("mail", json!(null), &JobOptions::new()).await?;
    common::wait_for(&jobs, created.job.id, SETTLE, |job| job.complete).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(jobs.fetch(created.job.id).await?.state, JobState::Success);
    assert_eq!(jobs.scheduled_count(ScheduleSet::ScheduledPurge).await?, 0);

    pool.dispose().await;
    scheduler.dispose().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dispose_returns_pending_claims() -> Result<(), Box<dyn Error>> {
    let jobs = common::job_store(QueueConfig::default().with_scheduler(SchedulerConfig {
        interval_ms: 20,
        fuzz_ms: 0,
        look_ahead_ms: 5_000,
        ..SchedulerConfig::default()
    }));
    let created = jobs
        .create("report", json!(null), &JobOptions::new().with_delay(3.0))
        .await?;
    assert_eq!(jobs.scheduled_count(ScheduleSet::Scheduled).await?, 1);

    let scheduler = start_scheduler(jobs.clone()).await?;
    let deadline = Instant::now() + SETTLE;
    while jobs.scheduled_count(ScheduleSet::Scheduled).await? != 0 {
        assert!(Instant::now() < deadline, "job was never claimed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    scheduler.dispose().await;
    scheduler.dispose().await;
    assert!(scheduler.is_disposed());
    assert!(matches!(scheduler.ping(), Err(QueueError::Disposed)));
    assert_eq!(jobs.scheduled_count(ScheduleSet::Scheduled).await?, 1);
    assert_eq!(jobs.fetch(created.job.id).await?.state, JobState::Delayed);
    Ok(())
}
