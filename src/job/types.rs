//! 任务数据模型：Job / Section / QueueItem
//!
//! Job 是一次端到端生成任务，内含有序的 Section 列表；QueueItem 是调度器视角的包装，
//! 记录派发状态、优先级与位置。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务 ID
pub type JobId = String;

/// 队列项 ID
pub type QueueItemId = String;

/// 任务生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Generating,
    /// 可恢复：被停止、冻结降级或队列暂停
    Paused,
    Cancelled,
    Completed,
    /// 可恢复：阶段失败
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Generating => "generating",
            JobStatus::Paused => "paused",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "generating" => JobStatus::Generating,
            "paused" => JobStatus::Paused,
            "cancelled" => JobStatus::Cancelled,
            "completed" => JobStatus::Completed,
            "error" => JobStatus::Error,
            _ => JobStatus::Idle,
        }
    }
}

/// 分节状态：pending → writing → editing →（有限次回到 writing）→ completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    Pending,
    Writing,
    Editing,
    Completed,
}

/// 分节类型。序号哨兵值（0 / -1 / -2）只在 from_number / number 中解释
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum SectionKind {
    Prologue,
    Chapter(u32),
    Epilogue,
    AuthorNote,
}

impl SectionKind {
    const PROLOGUE: i32 = 0;
    const EPILOGUE: i32 = -1;
    const AUTHOR_NOTE: i32 = -2;

    /// 由持久化序号还原分节类型；未知的负数返回 None
    pub fn from_number(number: i32) -> Option<Self> {
        match number {
            Self::PROLOGUE => Some(SectionKind::Prologue),
            Self::EPILOGUE => Some(SectionKind::Epilogue),
            Self::AUTHOR_NOTE => Some(SectionKind::AuthorNote),
            n if n > 0 => Some(SectionKind::Chapter(n as u32)),
            _ => None,
        }
    }

    pub fn number(&self) -> i32 {
        match self {
            SectionKind::Prologue => Self::PROLOGUE,
            SectionKind::Chapter(n) => *n as i32,
            SectionKind::Epilogue => Self::EPILOGUE,
            SectionKind::AuthorNote => Self::AUTHOR_NOTE,
        }
    }

    /// 用于提示词与日志的名称
    pub fn label(&self) -> String {
        match self {
            SectionKind::Prologue => "Prologue".to_string(),
            SectionKind::Chapter(n) => format!("Chapter {n}"),
            SectionKind::Epilogue => "Epilogue".to_string(),
            SectionKind::AuthorNote => "Author's Note".to_string(),
        }
    }

}

/// 累计 token 用量（输入 / 输出 / 思考）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub thinking_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64, thinking_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            thinking_tokens,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.thinking_tokens += other.thinking_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.thinking_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// 单个分节
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub kind: SectionKind,
    pub title: String,
    /// 该节的计划 / 大纲，写作阶段的输入
    pub plan: String,
    pub content: String,
    pub word_count: usize,
    pub status: SectionStatus,
    /// 已执行的精修次数（持久化，便于从 editing 恢复）
    pub refinement_attempts: u32,
    /// 精修次数耗尽仍未通过评审
    pub accepted_unverified: bool,
    /// 评审已放行当前草稿（通过或耗尽），只差润色
    #[serde(default)]
    pub approved: bool,
    /// 尚未被写作阶段消费的精修意见（精修写作失败后恢复时重发）
    #[serde(default)]
    pub refinement: Option<String>,
    /// 最近一次评审得分
    pub score: Option<f32>,
    /// 写作阶段给出的「结束状态」
    pub exit_state: Option<String>,
    /// 传给下一节的连续性摘要（完成时生成）
    pub digest: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Section {
    pub fn new(kind: SectionKind, title: impl Into<String>, plan: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            plan: plan.into(),
            content: String::new(),
            word_count: 0,
            status: SectionStatus::Pending,
            refinement_attempts: 0,
            accepted_unverified: false,
            approved: false,
            refinement: None,
            score: None,
            exit_state: None,
            digest: None,
            completed_at: None,
        }
    }

    pub fn number(&self) -> i32 {
        self.kind.number()
    }

    pub fn is_completed(&self) -> bool {
        self.status == SectionStatus::Completed
    }

    /// 清空生成结果，回到 pending（显式重写时使用）
    pub fn reset(&mut self) {
        self.content.clear();
        self.word_count = 0;
        self.status = SectionStatus::Pending;
        self.refinement_attempts = 0;
        self.accepted_unverified = false;
        self.approved = false;
        self.refinement = None;
        self.score = None;
        self.exit_state = None;
        self.digest = None;
        self.completed_at = None;
    }
}

/// 提交任务时的配置：决定分节列表
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPlan {
    /// 整体设定 / 梗概，贯穿所有分节
    pub premise: String,
    pub include_prologue: bool,
    /// 正文章节数
    pub chapter_count: u32,
    pub include_epilogue: bool,
    pub include_author_note: bool,
    /// 按章节顺序的标题（缺省为 "Chapter n"）
    pub chapter_titles: Vec<String>,
    /// 按章节顺序的大纲
    pub chapter_outlines: Vec<String>,
    pub prologue_outline: Option<String>,
    pub epilogue_outline: Option<String>,
}

/// 根据计划构建有序分节列表：[序章] 1..=N [尾声] [作者的话]
pub fn build_sections(plan: &JobPlan) -> Vec<Section> {
    let mut sections = Vec::with_capacity(plan.chapter_count as usize + 3);

    if plan.include_prologue {
        sections.push(Section::new(
            SectionKind::Prologue,
            SectionKind::Prologue.label(),
            plan.prologue_outline.clone().unwrap_or_default(),
        ));
    }

    for n in 1..=plan.chapter_count {
        let idx = (n - 1) as usize;
        let kind = SectionKind::Chapter(n);
        let title = plan
            .chapter_titles
            .get(idx)
            .filter(|t| !t.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| kind.label());
        let outline = plan.chapter_outlines.get(idx).cloned().unwrap_or_default();
        sections.push(Section::new(kind, title, outline));
    }

    if plan.include_epilogue {
        sections.push(Section::new(
            SectionKind::Epilogue,
            SectionKind::Epilogue.label(),
            plan.epilogue_outline.clone().unwrap_or_default(),
        ));
    }

    if plan.include_author_note {
        sections.push(Section::new(
            SectionKind::AuthorNote,
            SectionKind::AuthorNote.label(),
            String::new(),
        ));
    }

    sections
}

/// 生成任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub title: String,
    pub plan: JobPlan,
    pub sections: Vec<Section>,
    pub status: JobStatus,
    /// 当前分节下标（指向 sections）
    pub current_section: usize,
    pub usage: TokenUsage,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 持久化的最近活动时间，供冻结巡检使用
    pub last_activity_at: DateTime<Utc>,
}

impl Job {
    pub fn new(title: impl Into<String>, plan: JobPlan) -> Self {
        let now = Utc::now();
        let sections = build_sections(&plan);
        Self {
            id: format!("job_{}", uuid::Uuid::new_v4()),
            title: title.into(),
            plan,
            sections,
            status: JobStatus::Idle,
            current_section: 0,
            usage: TokenUsage::default(),
            error: None,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
        }
    }

    /// 第一个未完成分节的下标；全部完成时返回 None
    pub fn first_incomplete(&self) -> Option<usize> {
        self.sections.iter().position(|s| !s.is_completed())
    }

    pub fn is_finished(&self) -> bool {
        self.first_incomplete().is_none()
    }

    /// 按持久化序号查找分节；非法序号返回 None
    pub fn section_index(&self, number: i32) -> Option<usize> {
        let kind = SectionKind::from_number(number)?;
        self.sections.iter().position(|s| s.kind == kind)
    }

    pub fn completed_count(&self) -> usize {
        self.sections.iter().filter(|s| s.is_completed()).count()
    }

    pub fn total_words(&self) -> usize {
        self.sections.iter().map(|s| s.word_count).sum()
    }

    /// 更新活动时间戳（单调不减）
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = now;
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }
}

/// 调度器视角的队列状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    /// 全系统同一时刻至多一个
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Waiting => "waiting",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => QueueStatus::Processing,
            "completed" => QueueStatus::Completed,
            "failed" => QueueStatus::Failed,
            "skipped" => QueueStatus::Skipped,
            _ => QueueStatus::Waiting,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Skipped
        )
    }
}

/// 队列项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub job_id: JobId,
    pub status: QueueStatus,
    /// 越大越先执行
    pub priority: i32,
    /// 入队顺序，同优先级时越小越先
    pub position: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(job_id: impl Into<JobId>, priority: i32, position: u64) -> Self {
        Self {
            id: format!("qi_{}", uuid::Uuid::new_v4()),
            job_id: job_id.into(),
            status: QueueStatus::Waiting,
            priority,
            position,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }

    /// 派发顺序：优先级降序，再按位置升序
    pub fn dispatch_order(a: &QueueItem, b: &QueueItem) -> std::cmp::Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.position.cmp(&b.position))
    }
}

/// 统计文本词数（按空白分隔）
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
