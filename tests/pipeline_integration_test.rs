//! 流水线集成测试：分节状态机、取消、幂等恢复与用量记账

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use quill::core::GenerationErrorKind;
use quill::job::{Job, JobPlan, JobStatus, SectionKind, SectionStatus};
use quill::llm::{GenerationCaller, ProviderError, Reply, RetryPolicy, ScriptedService};
use quill::pipeline::{ChannelObserver, JobPipeline, PipelineConfig, PipelineEvent};
use quill::store::{InMemoryStore, JobStore, StoreUsageSink};

const REJECT: &str = r#"{
    "score": 4.0,
    "approved": false,
    "diagnosis": "Weak ending",
    "required_fixes": ["sharpen the last scene"],
    "preserve": ["the storm"]
}"#;

struct Harness {
    service: Arc<ScriptedService>,
    store: Arc<InMemoryStore>,
    pipeline: Arc<JobPipeline>,
}

fn harness(service: ScriptedService) -> Harness {
    let service = Arc::new(service);
    let store = Arc::new(InMemoryStore::new());
    let caller = GenerationCaller::new(service.clone(), RetryPolicy::default())
        .with_usage_sink(Arc::new(StoreUsageSink::new(store.clone())));
    let pipeline = Arc::new(JobPipeline::new(
        Arc::new(caller),
        store.clone(),
        PipelineConfig::default(),
    ));
    Harness {
        service,
        store,
        pipeline,
    }
}

fn novel(chapters: u32) -> Job {
    Job::new(
        "Saltwater",
        JobPlan {
            premise: "Two sisters inherit a failing ferry.".into(),
            include_prologue: true,
            chapter_count: chapters,
            include_epilogue: true,
            chapter_outlines: (1..=chapters).map(|n| format!("Outline {n}")).collect(),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn approved_section_runs_each_stage_once() {
    let h = harness(ScriptedService::new());
    let mut job = Job::new(
        "Short",
        JobPlan {
            chapter_count: 1,
            ..Default::default()
        },
    );

    h.pipeline
        .run_job(&mut job, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.service.calls_for("writer"), 1);
    assert_eq!(h.service.calls_for("critic"), 1);
    assert_eq!(h.service.calls_for("editor"), 1);
    assert_eq!(job.sections[0].status, SectionStatus::Completed);
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn rejected_twice_with_two_refinements_accepts_unverified() {
    let h = harness(ScriptedService::new().with_replies(
        "critic",
        vec![Reply::text(REJECT), Reply::text(REJECT), Reply::text(REJECT)],
    ));
    let mut job = Job::new(
        "Short",
        JobPlan {
            chapter_count: 1,
            ..Default::default()
        },
    );

    let summary = h
        .pipeline
        .run_job(&mut job, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.service.calls_for("writer"), 3);
    assert_eq!(h.service.calls_for("critic"), 3);
    assert_eq!(h.service.calls_for("editor"), 1);
    assert!(job.sections[0].accepted_unverified);
    assert_eq!(summary.accepted_unverified, vec![1]);
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn sections_follow_plan_order_with_sentinels() {
    let h = harness(ScriptedService::new());
    let mut job = novel(2);
    let kinds: Vec<SectionKind> = job.sections.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            SectionKind::Prologue,
            SectionKind::Chapter(1),
            SectionKind::Chapter(2),
            SectionKind::Epilogue
        ]
    );

    let (observer, mut rx) = ChannelObserver::new();
    h.pipeline.subscribe(Arc::new(observer));
    h.pipeline
        .run_job(&mut job, &CancellationToken::new())
        .await
        .unwrap();

    let mut completed = Vec::new();
    let mut job_complete = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            PipelineEvent::SectionComplete { section, .. } => completed.push(section),
            PipelineEvent::JobComplete { .. } => job_complete += 1,
            _ => {}
        }
    }
    assert_eq!(completed, vec![0, 1, 2, -1]);
    assert_eq!(job_complete, 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_section_stops_further_calls() {
    let h = harness(ScriptedService::new().with_replies(
        "writer",
        vec![Reply::Delayed(
            Duration::from_secs(10),
            "A long draft.\n### EXIT STATE\nThe ferry sinks.".into(),
        )],
    ));
    let token = CancellationToken::new();
    let mut job = novel(2);
    let job_id = job.id.clone();

    let pipeline = h.pipeline.clone();
    let run_token = token.clone();
    let handle = tokio::spawn(async move {
        let result = pipeline.run_job(&mut job, &run_token).await;
        (job, result)
    });

    tokio::time::sleep(Duration::from_secs(5)).await;
    token.cancel();
    let calls_at_cancel = h.service.total_calls();
    let (job, result) = handle.await.unwrap();

    assert_eq!(calls_at_cancel, 1);
    assert_eq!(h.service.total_calls(), calls_at_cancel);
    assert!(result.unwrap_err().is_cancelled());
    assert_ne!(job.status, JobStatus::Completed);
    assert_ne!(job.status, JobStatus::Generating);
    // 已返回的草稿被保留，下次从评审开始
    assert_eq!(job.sections[0].status, SectionStatus::Editing);

    let stored = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Paused);
}

#[tokio::test]
async fn resuming_a_finished_job_makes_no_calls() {
    let h = harness(ScriptedService::new());
    let mut job = novel(1);
    h.pipeline
        .run_job(&mut job, &CancellationToken::new())
        .await
        .unwrap();
    let calls = h.service.total_calls();

    let summary = h
        .pipeline
        .resume_job(&mut job, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.service.total_calls(), calls);
    assert_eq!(summary.sections_completed, 0);
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn resume_after_failure_skips_completed_sections() {
    // 序章与第 1 章成功，第 2 章写作阶段致命错误
    let h = harness(ScriptedService::new().with_replies(
        "writer",
        vec![
            Reply::text("Prologue text.\n### EXIT STATE\nDawn."),
            Reply::text("Chapter one.\n### EXIT STATE\nThe engine coughs."),
            Reply::Error(ProviderError::Fatal("invalid_request_error".into())),
        ],
    ));
    let mut job = novel(2);

    let err = h
        .pipeline
        .run_job(&mut job, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(GenerationErrorKind::FatalError));
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.completed_count(), 2);
    assert_eq!(job.sections[2].status, SectionStatus::Writing);

    let writes_before = h.service.calls_for("writer");
    h.pipeline
        .resume_job(&mut job, &CancellationToken::new())
        .await
        .unwrap();

    // 只重跑第 2 章与尾声
    assert_eq!(h.service.calls_for("writer"), writes_before + 2);
    assert_eq!(job.status, JobStatus::Completed);
    let last_write_prompt = h
        .service
        .call_log()
        .into_iter()
        .filter(|c| c.persona == "writer")
        .last()
        .map(|c| c.prompt)
        .unwrap();
    assert!(last_write_prompt.contains("Epilogue"));
    let resumed_write = h
        .service
        .call_log()
        .into_iter()
        .filter(|c| c.persona == "writer")
        .nth(writes_before)
        .unwrap();
    assert!(resumed_write.prompt.contains("The engine coughs."));
}

#[tokio::test]
async fn usage_is_accumulated_and_recorded_per_call() {
    let h = harness(ScriptedService::new());
    let mut job = Job::new(
        "Short",
        JobPlan {
            chapter_count: 2,
            ..Default::default()
        },
    );
    h.pipeline
        .run_job(&mut job, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(job.usage.input_tokens, 600);
    assert_eq!(job.usage.output_tokens, 1200);

    let events = h.store.usage_events(&job.id).await.unwrap();
    assert_eq!(events.len(), 6);
    let personas: Vec<&str> = events.iter().map(|e| e.persona.as_str()).collect();
    assert_eq!(&personas[..3], &["writer", "critic", "editor"]);
}

#[tokio::test(start_paused = true)]
async fn retries_surface_as_events() {
    let h = harness(ScriptedService::new().with_replies(
        "critic",
        vec![Reply::rate_limited(), Reply::transient("connection reset")],
    ));
    let (observer, mut rx) = ChannelObserver::new();
    h.pipeline.subscribe(Arc::new(observer));
    let mut job = Job::new(
        "Short",
        JobPlan {
            chapter_count: 1,
            ..Default::default()
        },
    );
    h.pipeline
        .run_job(&mut job, &CancellationToken::new())
        .await
        .unwrap();

    let mut retries = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::Retrying {
            reason, delay_secs, ..
        } = event
        {
            retries.push((reason, delay_secs));
        }
    }
    assert_eq!(
        retries,
        vec![
            ("rate_limited".to_string(), 30),
            ("transient_error".to_string(), 5)
        ]
    );
}
