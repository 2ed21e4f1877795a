//! 调度器集成测试：单任务派发、冻结恢复、持久化巡检、启动对账与控制操作
//!
//! 全部使用暂停时间，心跳与退避在测试内确定性推进。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use quill::job::{Job, JobEventKind, JobPlan, JobStatus, QueueStatus};
use quill::llm::{GenerationCaller, Reply, RetryPolicy, ScriptedService};
use quill::pipeline::{JobPipeline, PipelineConfig};
use quill::scheduler::{
    JobOutcome, JobScheduler, RecoveryTrigger, SchedulerConfig, SchedulerEvent, SchedulerState,
};
use quill::store::{InMemoryStore, JobStore};

struct Harness {
    scheduler: JobScheduler,
    store: Arc<InMemoryStore>,
    events: broadcast::Receiver<SchedulerEvent>,
}

fn harness(service: ScriptedService, policy: RetryPolicy, config: SchedulerConfig) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let caller = Arc::new(GenerationCaller::new(Arc::new(service), policy));
    let pipeline = Arc::new(JobPipeline::new(
        caller,
        store.clone(),
        PipelineConfig::default(),
    ));
    let scheduler = JobScheduler::new(store.clone(), pipeline, config);
    let events = scheduler.subscribe();
    Harness {
        scheduler,
        store,
        events,
    }
}

/// 单次调用不会超时，冻结只能由心跳发现
fn patient_policy() -> RetryPolicy {
    RetryPolicy {
        call_timeout: Duration::from_secs(24 * 3600),
        ..Default::default()
    }
}

fn job(title: &str) -> Job {
    Job::new(
        title,
        JobPlan {
            chapter_count: 2,
            ..Default::default()
        },
    )
}

async fn next_event<F>(rx: &mut broadcast::Receiver<SchedulerEvent>, mut pred: F) -> SchedulerEvent
where
    F: FnMut(&SchedulerEvent) -> bool,
{
    loop {
        let event = rx.recv().await.expect("scheduler event stream closed");
        if pred(&event) {
            return event;
        }
    }
}

fn dispatched_id(event: &SchedulerEvent) -> Option<String> {
    match event {
        SchedulerEvent::JobDispatched { job_id, .. } => Some(job_id.clone()),
        _ => None,
    }
}

#[tokio::test(start_paused = true)]
async fn jobs_run_one_at_a_time_in_queue_order() {
    let service = ScriptedService::new().with_replies(
        "writer",
        (0..6)
            .map(|_| {
                Reply::Delayed(Duration::from_secs(20), "Draft.\n### EXIT STATE\nLater.".into())
            })
            .collect(),
    );
    let mut h = harness(service, RetryPolicy::default(), SchedulerConfig::default());
    let jobs = [job("J1"), job("J2"), job("J3")];
    for j in &jobs {
        h.scheduler.enqueue(j, 0).await.unwrap();
    }

    h.scheduler.start().await;

    let mut order = Vec::new();
    let mut finished = Vec::new();
    while finished.len() < 3 {
        let event = h.events.recv().await.unwrap();
        let processing = h.store.processing_items().await.unwrap();
        assert!(processing.len() <= 1, "more than one item processing");
        let generating = h.store.jobs_with_status(JobStatus::Generating).await.unwrap();
        assert!(generating.len() <= 1, "more than one job generating");

        match event {
            SchedulerEvent::JobDispatched { job_id, .. } => {
                // 上一个任务必须已经结束
                assert_eq!(order.len(), finished.len());
                order.push(job_id);
            }
            SchedulerEvent::JobFinished { job_id, outcome } => {
                assert_eq!(outcome, JobOutcome::Completed);
                finished.push(job_id);
            }
            _ => {}
        }
    }

    let expected: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
    assert_eq!(order, expected);
    assert_eq!(finished, expected);
    next_event(&mut h.events, |e| matches!(e, SchedulerEvent::QueueEmpty)).await;
    for item in h.scheduler.list_queue().await.unwrap() {
        assert_eq!(item.status, QueueStatus::Completed);
    }
}

#[tokio::test(start_paused = true)]
async fn frozen_job_is_demoted_and_retried_before_the_next() {
    let service = ScriptedService::new().with_replies("writer", vec![Reply::Hang]);
    let mut h = harness(service, patient_policy(), SchedulerConfig::default());
    let j1 = job("J1");
    let j2 = job("J2");
    let j1_item = h.scheduler.enqueue(&j1, 0).await.unwrap();
    h.scheduler.enqueue(&j2, 0).await.unwrap();

    h.scheduler.start().await;
    let first = next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;
    assert_eq!(dispatched_id(&first), Some(j1.id.clone()));

    let recovered =
        next_event(&mut h.events, |e| matches!(e, SchedulerEvent::Recovered { .. })).await;
    match recovered {
        SchedulerEvent::Recovered {
            job_id,
            attempt,
            trigger,
        } => {
            assert_eq!(job_id, j1.id);
            assert_eq!(attempt, 1);
            assert_eq!(trigger, RecoveryTrigger::Heartbeat);
        }
        _ => unreachable!(),
    }

    let item = h.store.get_queue_item(&j1_item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Waiting);
    assert_eq!(h.scheduler.recovery_attempts(&j1.id).await, 1);
    assert_eq!(h.store.active_job().await.unwrap(), None);
    assert!(h.store.processing_items().await.unwrap().is_empty());

    let next = next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;
    assert_eq!(dispatched_id(&next), Some(j1.id.clone()));

    let done = next_event(&mut h.events, |e| matches!(e, SchedulerEvent::JobFinished { .. })).await;
    match done {
        SchedulerEvent::JobFinished { job_id, outcome } => {
            assert_eq!(job_id, j1.id);
            assert_eq!(outcome, JobOutcome::Completed);
        }
        _ => unreachable!(),
    }
    // 完成后计数清零
    assert_eq!(h.scheduler.recovery_attempts(&j1.id).await, 0);

    let events = h.store.events(&j1.id).await.unwrap();
    assert!(events.iter().any(|e| e.kind == JobEventKind::HeartbeatRecovery));

    let after = next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;
    assert_eq!(dispatched_id(&after), Some(j2.id.clone()));
}

#[tokio::test(start_paused = true)]
async fn recovery_gives_up_after_the_configured_limit() {
    let service = ScriptedService::new().with_replies("writer", vec![Reply::Hang, Reply::Hang]);
    let config = SchedulerConfig {
        max_recovery_attempts: 1,
        ..Default::default()
    };
    let mut h = harness(service, patient_policy(), config);
    let j1 = job("J1");
    let j2 = job("J2");
    let j1_item = h.scheduler.enqueue(&j1, 0).await.unwrap();
    h.scheduler.enqueue(&j2, 0).await.unwrap();
    h.scheduler.start().await;

    let exhausted = next_event(&mut h.events, |e| {
        matches!(e, SchedulerEvent::RecoveryExhausted { .. })
    })
    .await;
    match exhausted {
        SchedulerEvent::RecoveryExhausted { job_id, attempts } => {
            assert_eq!(job_id, j1.id);
            assert_eq!(attempts, 2);
        }
        _ => unreachable!(),
    }

    let item = h.store.get_queue_item(&j1_item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Failed);
    let stored = h.store.get_job(&j1.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Error);

    let next = next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;
    assert_eq!(dispatched_id(&next), Some(j2.id.clone()));
}

#[tokio::test(start_paused = true)]
async fn sweep_recovers_jobs_with_stale_persisted_activity() {
    let h = harness(ScriptedService::new(), RetryPolicy::default(), SchedulerConfig::default());

    // 模拟上一个进程留下的 generating 任务，持久化活动时间停在 20 分钟前
    let mut stale = job("stale");
    stale.status = JobStatus::Generating;
    stale.last_activity_at = Utc::now() - chrono::Duration::minutes(20);
    h.store.save_job(&stale).await.unwrap();
    let item = h.store.enqueue(&stale.id, 0).await.unwrap();
    h.store.mark_processing(&item.id).await.unwrap();
    h.store.set_active_job(Some(&stale.id)).await.unwrap();

    let mut fresh = job("fresh");
    fresh.status = JobStatus::Generating;
    h.store.save_job(&fresh).await.unwrap();

    let recovered = h.scheduler.sweep_once().await.unwrap();
    assert_eq!(recovered, vec![stale.id.clone()]);

    let item = h.store.get_queue_item(&item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Waiting);
    assert_eq!(h.store.active_job().await.unwrap(), None);
    let stored = h.store.get_job(&stale.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Paused);
    let events = h.store.events(&stale.id).await.unwrap();
    assert!(events.iter().any(|e| e.kind == JobEventKind::SweepRecovery));
    assert_eq!(
        h.scheduler.get_state().await.unwrap().pending_retry,
        Some(stale.id.clone())
    );
}

#[tokio::test(start_paused = true)]
async fn initialize_reconciles_leftover_processing_items() {
    let mut h = harness(ScriptedService::new(), RetryPolicy::default(), SchedulerConfig::default());

    let mut done = job("done");
    done.status = JobStatus::Completed;
    h.store.save_job(&done).await.unwrap();
    let done_item = h.store.enqueue(&done.id, 0).await.unwrap();
    // 任务已完成但队列项仍为 processing：进程在收尾前退出
    h.store.mark_processing(&done_item.id).await.unwrap();

    let demoted = h.scheduler.initialize().await.unwrap();
    assert_eq!(demoted, 0);
    let item = h.store.get_queue_item(&done_item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Completed);

    let mut interrupted = job("interrupted");
    interrupted.status = JobStatus::Generating;
    h.store.save_job(&interrupted).await.unwrap();
    let item = h.store.enqueue(&interrupted.id, 0).await.unwrap();
    h.store.mark_processing(&item.id).await.unwrap();
    h.store.set_active_job(Some(&interrupted.id)).await.unwrap();

    let demoted = h.scheduler.initialize().await.unwrap();
    assert_eq!(demoted, 1);
    let waiting = h.store.get_queue_item(&item.id).await.unwrap().unwrap();
    assert_eq!(waiting.status, QueueStatus::Waiting);
    let stored = h.store.get_job(&interrupted.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Paused);
    assert_eq!(h.store.active_job().await.unwrap(), None);

    // 延迟后自动开始派发
    next_event(&mut h.events, |e| matches!(e, SchedulerEvent::Started)).await;
    let dispatched = next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;
    assert_eq!(dispatched_id(&dispatched), Some(interrupted.id.clone()));
}

#[tokio::test(start_paused = true)]
async fn stop_demotes_the_active_job() {
    let service = ScriptedService::new().with_replies("writer", vec![Reply::Hang]);
    let mut h = harness(service, patient_policy(), SchedulerConfig::default());
    let j1 = job("J1");
    let item = h.scheduler.enqueue(&j1, 0).await.unwrap();
    h.scheduler.start().await;
    next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;

    h.scheduler.stop().await;

    let snapshot = h.scheduler.get_state().await.unwrap();
    assert_eq!(snapshot.state, SchedulerState::Stopped);
    assert_eq!(snapshot.active_job, None);
    let item = h.store.get_queue_item(&item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Waiting);
    let stored = h.store.get_job(&j1.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Paused);
    assert_eq!(h.store.active_job().await.unwrap(), None);

    // 再次启动时继续同一任务
    h.scheduler.start().await;
    let again = next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;
    assert_eq!(dispatched_id(&again), Some(j1.id.clone()));
}

#[tokio::test(start_paused = true)]
async fn pause_lets_the_active_job_finish_without_dispatching() {
    let service = ScriptedService::new().with_replies(
        "writer",
        vec![Reply::Delayed(Duration::from_secs(30), "Draft.".into())],
    );
    let mut h = harness(service, RetryPolicy::default(), SchedulerConfig::default());
    let j1 = job("J1");
    let j2 = job("J2");
    h.scheduler.enqueue(&j1, 0).await.unwrap();
    let j2_item = h.scheduler.enqueue(&j2, 0).await.unwrap();
    h.scheduler.start().await;
    next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;

    h.scheduler.pause().await;
    let done = next_event(&mut h.events, |e| matches!(e, SchedulerEvent::JobFinished { .. })).await;
    assert!(matches!(
        done,
        SchedulerEvent::JobFinished {
            outcome: JobOutcome::Completed,
            ..
        }
    ));

    tokio::time::sleep(Duration::from_secs(60)).await;
    let item = h.store.get_queue_item(&j2_item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Waiting);

    h.scheduler.resume().await;
    let next = next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;
    assert_eq!(dispatched_id(&next), Some(j2.id.clone()));
}

#[tokio::test(start_paused = true)]
async fn cancel_releases_the_slot_and_moves_on() {
    let service = ScriptedService::new().with_replies("writer", vec![Reply::Hang]);
    let mut h = harness(service, patient_policy(), SchedulerConfig::default());
    let j1 = job("J1");
    let j2 = job("J2");
    let j1_item = h.scheduler.enqueue(&j1, 0).await.unwrap();
    h.scheduler.enqueue(&j2, 0).await.unwrap();
    h.scheduler.start().await;
    next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;

    h.scheduler.cancel(&j1.id).await.unwrap();

    let stored = h.store.get_job(&j1.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    let item = h.store.get_queue_item(&j1_item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Skipped);

    let next = next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;
    assert_eq!(dispatched_id(&next), Some(j2.id.clone()));
    assert!(h.scheduler.cancel("job_missing").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn skip_current_marks_skipped_and_dispatches_next() {
    let service = ScriptedService::new().with_replies("writer", vec![Reply::Hang]);
    let mut h = harness(service, patient_policy(), SchedulerConfig::default());
    let j1 = job("J1");
    let j2 = job("J2");
    let j1_item = h.scheduler.enqueue(&j1, 0).await.unwrap();
    h.scheduler.enqueue(&j2, 0).await.unwrap();
    h.scheduler.start().await;
    next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;

    let skipped = h.scheduler.skip_current().await.unwrap();
    assert_eq!(skipped, Some(j1.id.clone()));
    let item = h.store.get_queue_item(&j1_item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Skipped);

    let next = next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;
    assert_eq!(dispatched_id(&next), Some(j2.id.clone()));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_job_is_retried_after_backoff() {
    // 6 次限流耗尽调用包装器的限流预算
    let service = ScriptedService::new().with_replies("writer", vec![Reply::rate_limited(); 6]);
    let mut h = harness(service, RetryPolicy::default(), SchedulerConfig::default());
    let j1 = job("J1");
    let j2 = job("J2");
    let j1_item = h.scheduler.enqueue(&j1, 0).await.unwrap();
    h.scheduler.enqueue(&j2, 0).await.unwrap();
    h.scheduler.start().await;
    next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;

    let limited =
        next_event(&mut h.events, |e| matches!(e, SchedulerEvent::JobFinished { .. })).await;
    assert!(matches!(
        limited,
        SchedulerEvent::JobFinished {
            outcome: JobOutcome::RateLimited,
            ..
        }
    ));
    let item = h.store.get_queue_item(&j1_item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Waiting);
    let limited_at = tokio::time::Instant::now();

    let retry = next_event(&mut h.events, |e| dispatched_id(e).is_some()).await;
    assert_eq!(dispatched_id(&retry), Some(j1.id.clone()));
    assert!(limited_at.elapsed() >= Duration::from_secs(120));

    let events = h.store.events(&j1.id).await.unwrap();
    assert!(events.iter().any(|e| e.kind == JobEventKind::RateLimited));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_is_not_overwritten_by_the_stopping_run() {
    let h = harness(ScriptedService::new(), RetryPolicy::default(), SchedulerConfig::default());
    let long = Job::new(
        "long",
        JobPlan {
            chapter_count: 2000,
            ..Default::default()
        },
    );
    let item = h.scheduler.enqueue(&long, 0).await.unwrap();
    h.scheduler.start().await;

    tokio::time::sleep(Duration::from_millis(2)).await;
    h.scheduler.cancel(&long.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stored = h.store.get_job(&long.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    let item = h.store.get_queue_item(&item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Skipped);
    assert_eq!(h.store.active_job().await.unwrap(), None);
    h.scheduler.stop().await;
}
