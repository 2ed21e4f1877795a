//! 任务流水线：逐节驱动 写作 → 评审 →（有限次）精修 → 润色
//!
//! 每次 run_job / resume_job 从第一个未完成分节开始，顺序执行到结束；已完成分节不会重跑。
//! 阶段失败只中止当前分节，分节保持最后观察到的状态，下次恢复时从该阶段重试：
//! - writing：重新写作
//! - editing 且已有草稿：直接从评审开始
//!
//! 每次状态变化都落库并刷新活动时间（持久化心跳）；过程事件广播给所有观察者。

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::core::PipelineError;
use crate::job::{word_count, Job, JobId, JobStatus, SectionStatus, TokenUsage};
use crate::llm::{
    CallContext, GenerationCaller, GenerationRequest, GenerationResult, RetryNotice, RetryReason,
    StageConfig,
};
use crate::store::JobStore;

use super::critique::CritiqueVerdict;
use super::events::{ObserverSet, PipelineEvent, PipelineObserver, Stage};
use super::prompts::{split_exit_state, PromptBuilder, PromptTemplates, WriteContext};

/// 第一节没有上一节的结束状态时使用的连续性摘要
const OPENING_DIGEST: &str = "Nothing has happened yet; this is the opening section.";

/// 流水线配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 评审未通过时最多重写几次
    pub max_refinement_attempts: u32,
    /// 写作阶段未给出结束状态时传给下一节的摘要
    pub digest_fallback: String,
    pub write: StageConfig,
    pub critique: StageConfig,
    pub polish: StageConfig,
    pub templates: PromptTemplates,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_refinement_attempts: 2,
            digest_fallback: "The previous section has concluded; continue the story naturally."
                .to_string(),
            write: StageConfig::with_persona("writer"),
            critique: StageConfig {
                temperature: 0.2,
                max_tokens: 2048,
                ..StageConfig::with_persona("critic")
            },
            polish: StageConfig {
                temperature: 0.4,
                ..StageConfig::with_persona("editor")
            },
            templates: PromptTemplates::default(),
        }
    }
}

/// 一次运行的汇总
#[derive(Debug, Clone, Default)]
pub struct JobRunSummary {
    pub job_id: JobId,
    /// 本次运行完成的分节数
    pub sections_completed: usize,
    pub total_words: usize,
    /// 本次运行的用量
    pub usage: TokenUsage,
    /// 本次运行中精修耗尽而放行的分节序号
    pub accepted_unverified: Vec<i32>,
}

/// 任务流水线
pub struct JobPipeline {
    caller: Arc<GenerationCaller>,
    store: Arc<dyn JobStore>,
    prompts: PromptBuilder,
    config: PipelineConfig,
    observers: ObserverSet,
}

impl JobPipeline {
    pub fn new(
        caller: Arc<GenerationCaller>,
        store: Arc<dyn JobStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            caller,
            store,
            prompts: PromptBuilder::new(config.templates.clone()),
            config,
            observers: ObserverSet::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn subscribe(&self, observer: Arc<dyn PipelineObserver>) {
        self.observers.subscribe(observer);
    }

    pub fn observers(&self) -> &ObserverSet {
        &self.observers
    }

    /// 运行任务直到全部分节完成或某阶段失败
    pub async fn run_job(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
    ) -> Result<JobRunSummary, PipelineError> {
        if job.status == JobStatus::Cancelled {
            return Err(PipelineError::InvalidStatus {
                job_id: job.id.clone(),
                status: job.status,
            });
        }

        let mut summary = JobRunSummary {
            job_id: job.id.clone(),
            ..Default::default()
        };

        if job.is_finished() {
            if job.status != JobStatus::Completed {
                job.status = JobStatus::Completed;
                job.current_section = job.sections.len();
                self.persist(job).await?;
            }
            summary.total_words = job.total_words();
            return Ok(summary);
        }

        job.status = JobStatus::Generating;
        job.error = None;
        self.persist(job).await?;
        tracing::info!(
            "[{}] running \"{}\" from section {}/{}",
            job.id,
            job.title,
            job.completed_count() + 1,
            job.sections.len()
        );

        while let Some(idx) = job.first_incomplete() {
            job.current_section = idx;
            let before = job.usage;
            let outcome = self.run_section(job, idx, cancel).await;
            summary.usage.add(&usage_delta(&before, &job.usage));

            match outcome {
                Ok(()) => {
                    summary.sections_completed += 1;
                    if job.sections[idx].accepted_unverified {
                        summary.accepted_unverified.push(job.sections[idx].number());
                    }
                }
                Err(e) => return Err(self.fail(job, idx, e).await),
            }
        }

        job.status = JobStatus::Completed;
        job.current_section = job.sections.len();
        self.persist(job).await?;

        summary.total_words = job.total_words();
        self.observers.emit(PipelineEvent::JobComplete {
            job_id: job.id.clone(),
            sections: job.sections.len(),
            total_words: summary.total_words,
            usage: job.usage,
        });
        Ok(summary)
    }

    /// 从第一个未完成分节继续；与 run_job 同一路径
    pub async fn resume_job(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
    ) -> Result<JobRunSummary, PipelineError> {
        if let Some(idx) = job.first_incomplete() {
            tracing::info!(
                "[{}] resuming at section {} ({:?})",
                job.id,
                job.sections[idx].number(),
                job.sections[idx].status
            );
        }
        self.run_job(job, cancel).await
    }

    /// 显式重写某个已完成分节（完成后分节唯一的变更途径）；后续分节不受影响
    pub async fn rewrite_section(
        &self,
        job: &mut Job,
        number: i32,
        cancel: &CancellationToken,
    ) -> Result<JobRunSummary, PipelineError> {
        if matches!(job.status, JobStatus::Generating | JobStatus::Cancelled) {
            return Err(PipelineError::InvalidStatus {
                job_id: job.id.clone(),
                status: job.status,
            });
        }
        let idx = job
            .section_index(number)
            .ok_or(PipelineError::SectionNotFound(number))?;

        let previous_status = job.status;
        let before = job.usage;
        job.sections[idx].reset();
        job.status = JobStatus::Generating;
        job.error = None;
        self.persist(job).await?;
        tracing::info!("[{}] rewriting section {}", job.id, number);

        if let Err(e) = self.run_section(job, idx, cancel).await {
            return Err(self.fail(job, idx, e).await);
        }

        job.status = if job.is_finished() {
            JobStatus::Completed
        } else {
            previous_status
        };
        self.persist(job).await?;

        let section = &job.sections[idx];
        Ok(JobRunSummary {
            job_id: job.id.clone(),
            sections_completed: 1,
            total_words: job.total_words(),
            usage: usage_delta(&before, &job.usage),
            accepted_unverified: if section.accepted_unverified {
                vec![number]
            } else {
                Vec::new()
            },
        })
    }

    /// 单个分节的完整阶段序列
    async fn run_section(
        &self,
        job: &mut Job,
        idx: usize,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let digest = self.incoming_digest(job, idx);
        let section = &job.sections[idx];
        let has_draft = section.status == SectionStatus::Editing && !section.content.is_empty();

        let draft = if has_draft && section.approved {
            tracing::debug!(
                "[{}] section {} already approved, resuming at polish",
                job.id,
                section.number()
            );
            section.content.clone()
        } else {
            let mut draft = if has_draft {
                tracing::debug!(
                    "[{}] section {} has a draft, resuming at critique",
                    job.id,
                    section.number()
                );
                section.content.clone()
            } else {
                let pending = section.refinement.clone();
                self.write(job, idx, &digest, pending.as_deref(), cancel)
                    .await?
            };

            loop {
                let verdict = self.critique(job, idx, &draft, cancel).await?;
                let section = &mut job.sections[idx];
                section.score = Some(verdict.score);

                if verdict.approved {
                    if verdict.low_confidence {
                        section.accepted_unverified = true;
                    }
                    section.approved = true;
                    self.persist(job).await?;
                    break draft;
                }

                if section.refinement_attempts >= self.config.max_refinement_attempts {
                    section.accepted_unverified = true;
                    section.approved = true;
                    tracing::warn!(
                        "[{}] section {} not approved after {} refinements, accepting last draft",
                        job.id,
                        section.number(),
                        section.refinement_attempts
                    );
                    self.persist(job).await?;
                    break draft;
                }

                section.refinement_attempts += 1;
                let instructions = verdict.refinement_instructions();
                section.refinement = Some(instructions.clone());
                self.persist(job).await?;
                draft = self
                    .write(job, idx, &digest, Some(&instructions), cancel)
                    .await?;
            }
        };

        let polished = self.polish(job, idx, &draft, cancel).await?;
        let fallback = self.config.digest_fallback.clone();

        let section = &mut job.sections[idx];
        section.content = polished;
        section.word_count = word_count(&section.content);
        section.status = SectionStatus::Completed;
        section.completed_at = Some(Utc::now());
        section.digest = Some(section.exit_state.clone().unwrap_or(fallback));
        job.current_section = idx + 1;
        self.persist(job).await?;

        let section = &job.sections[idx];
        self.observers.emit(PipelineEvent::SectionComplete {
            job_id: job.id.clone(),
            section: section.number(),
            title: section.title.clone(),
            word_count: section.word_count,
            score: section.score,
            accepted_unverified: section.accepted_unverified,
        });
        Ok(())
    }

    async fn write(
        &self,
        job: &mut Job,
        idx: usize,
        digest: &str,
        refinement: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        job.sections[idx].status = SectionStatus::Writing;
        self.persist(job).await?;

        let section = &job.sections[idx];
        let prompt = self
            .prompts
            .write(job, section, &WriteContext { digest, refinement });
        let attempt = section.refinement_attempts + 1;
        let result = self
            .call(job, idx, Stage::Write, attempt, prompt, &self.config.write, cancel)
            .await?;

        let (body, exit_state) = split_exit_state(&result.content);
        let section = &mut job.sections[idx];
        section.content = body.clone();
        section.word_count = word_count(&body);
        section.exit_state = exit_state;
        section.refinement = None;
        section.status = SectionStatus::Editing;
        self.persist(job).await?;
        Ok(body)
    }

    async fn critique(
        &self,
        job: &mut Job,
        idx: usize,
        draft: &str,
        cancel: &CancellationToken,
    ) -> Result<CritiqueVerdict, PipelineError> {
        let section = &job.sections[idx];
        let prompt = self.prompts.critique(job, section, draft);
        let attempt = section.refinement_attempts + 1;
        let result = self
            .call(job, idx, Stage::Critique, attempt, prompt, &self.config.critique, cancel)
            .await?;

        let verdict = CritiqueVerdict::parse_or_fallback(&result.content);
        tracing::debug!(
            "[{}] section {} critique: score {:.1}, approved {}",
            job.id,
            job.sections[idx].number(),
            verdict.score,
            verdict.approved
        );
        Ok(verdict)
    }

    async fn polish(
        &self,
        job: &mut Job,
        idx: usize,
        draft: &str,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        let section = &job.sections[idx];
        let prompt = self.prompts.polish(job, section, draft);
        let attempt = section.refinement_attempts + 1;
        let result = self
            .call(job, idx, Stage::Polish, attempt, prompt, &self.config.polish, cancel)
            .await?;

        let (polished, _) = split_exit_state(&result.content);
        if polished.trim().is_empty() {
            tracing::warn!(
                "[{}] section {} polish returned nothing, keeping draft",
                job.id,
                job.sections[idx].number()
            );
            return Ok(draft.to_string());
        }
        Ok(polished)
    }

    /// 调用包装器；失败结果转为 PipelineError，用量累加到任务
    #[allow(clippy::too_many_arguments)]
    async fn call(
        &self,
        job: &mut Job,
        idx: usize,
        stage: Stage,
        attempt: u32,
        prompt: String,
        config: &StageConfig,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, PipelineError> {
        let number = job.sections[idx].number();
        self.observers.emit(PipelineEvent::StageStatus {
            job_id: job.id.clone(),
            section: number,
            stage,
            attempt,
        });

        let ctx = CallContext::for_job(job.id.clone(), cancel.clone())
            .with_retry_hook(self.retry_hook(job.id.clone(), number, stage));
        let request = GenerationRequest::new(prompt, config.clone());
        let result = self.caller.invoke(&request, &ctx).await;

        job.usage.add(&result.usage);

        if result.is_cancelled() {
            return Err(PipelineError::Cancelled { section: number });
        }
        if let Some(kind) = result.error {
            return Err(PipelineError::Generation {
                section: number,
                stage: stage.as_str(),
                kind,
                message: result.error_text(),
            });
        }
        Ok(result)
    }

    /// 重试通知 → Retrying 事件，并刷新持久化活动时间，避免长时间退避被误判为冻结
    fn retry_hook(&self, job_id: JobId, section: i32, stage: Stage) -> crate::llm::RetryHook {
        let observers = self.observers.clone();
        let store = self.store.clone();
        Arc::new(move |notice: &RetryNotice| {
            observers.emit(PipelineEvent::Retrying {
                job_id: job_id.clone(),
                section,
                stage,
                attempt: notice.attempt,
                reason: retry_reason_label(notice.reason).to_string(),
                delay_secs: notice.delay.as_secs(),
            });
            let store = store.clone();
            let job_id = job_id.clone();
            tokio::spawn(async move {
                if let Err(e) = store.update_heartbeat(&job_id).await {
                    tracing::warn!("[{}] failed to refresh activity during retry: {}", job_id, e);
                }
            });
        })
    }

    /// 上一个已完成分节的摘要
    fn incoming_digest(&self, job: &Job, idx: usize) -> String {
        job.sections[..idx]
            .iter()
            .rev()
            .find(|s| s.is_completed())
            .and_then(|s| s.digest.clone())
            .unwrap_or_else(|| {
                if idx == 0 {
                    OPENING_DIGEST.to_string()
                } else {
                    self.config.digest_fallback.clone()
                }
            })
    }

    async fn persist(&self, job: &mut Job) -> Result<(), PipelineError> {
        job.touch();
        self.store.save_job(job).await?;
        Ok(())
    }

    /// 记录分节失败：取消 → paused，其它 → error；分节状态保持不变
    async fn fail(&self, job: &mut Job, idx: usize, err: PipelineError) -> PipelineError {
        let number = job.sections[idx].number();
        if err.is_cancelled() {
            tracing::info!("[{}] cancelled during section {}", job.id, number);
            job.status = JobStatus::Paused;
        } else {
            tracing::error!("[{}] section {} failed: {}", job.id, number, err);
            job.status = JobStatus::Error;
            job.error = Some(err.to_string());
            self.observers.emit(PipelineEvent::Error {
                job_id: job.id.clone(),
                section: Some(number),
                message: err.to_string(),
            });
        }
        if let Err(e) = self.persist(job).await {
            tracing::error!("[{}] failed to persist failure state: {}", job.id, e);
        }
        err
    }
}

fn retry_reason_label(reason: RetryReason) -> &'static str {
    match reason {
        RetryReason::Timeout => "timeout",
        RetryReason::RateLimited => "rate_limited",
        RetryReason::Transient => "transient_error",
    }
}

fn usage_delta(before: &TokenUsage, after: &TokenUsage) -> TokenUsage {
    TokenUsage::new(
        after.input_tokens.saturating_sub(before.input_tokens),
        after.output_tokens.saturating_sub(before.output_tokens),
        after.thinking_tokens.saturating_sub(before.thinking_tokens),
    )
}
