//! 提示词模板
//!
//! 提示词正文属于配置；这里只负责占位符替换。可用占位符：
//! `{job_title}` `{premise}` `{section_label}` `{section_title}` `{plan}`
//! `{digest}` `{refinement}` `{draft}`

use serde::{Deserialize, Serialize};

use crate::job::{Job, Section};

/// 写作阶段输出中「结束状态」的分隔标记
pub const EXIT_STATE_MARKER: &str = "### EXIT STATE";

/// 三个阶段的模板
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplates {
    pub write: String,
    pub critique: String,
    pub polish: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            write: "{section_label}: {section_title}\n\
                    Work: {job_title}\n\
                    Premise: {premise}\n\
                    Plan for this section:\n{plan}\n\n\
                    Where the previous section left off:\n{digest}\n\n\
                    {refinement}\n\
                    Write the full section. Finish with a line `### EXIT STATE` followed by \
                    two or three sentences describing where things stand at the end."
                .to_string(),
            critique: "Review {section_label}: {section_title}\n\
                       Plan:\n{plan}\n\nDraft:\n{draft}\n\n\
                       Reply with JSON only: {\"score\": 0-10, \"approved\": bool, \
                       \"diagnosis\": string, \"required_fixes\": [string], \"preserve\": [string]}"
                .to_string(),
            polish: "{section_label}: {section_title}\n\
                     Polish the following text for style and formatting without changing events. \
                     Return only the polished text.\n\n{draft}"
                .to_string(),
        }
    }
}

/// 写作提示词的上下文
pub struct WriteContext<'a> {
    pub digest: &'a str,
    /// 非首轮写作时的精修指令
    pub refinement: Option<&'a str>,
}

/// 模板渲染器
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    templates: PromptTemplates,
}

impl PromptBuilder {
    pub fn new(templates: PromptTemplates) -> Self {
        Self { templates }
    }

    fn fill(template: &str, job: &Job, section: &Section) -> String {
        template
            .replace("{job_title}", &job.title)
            .replace("{premise}", &job.plan.premise)
            .replace("{section_label}", &section.kind.label())
            .replace("{section_title}", &section.title)
            .replace("{plan}", &section.plan)
    }

    pub fn write(&self, job: &Job, section: &Section, ctx: &WriteContext<'_>) -> String {
        Self::fill(&self.templates.write, job, section)
            .replace("{digest}", ctx.digest)
            .replace("{refinement}", ctx.refinement.unwrap_or(""))
    }

    pub fn critique(&self, job: &Job, section: &Section, draft: &str) -> String {
        Self::fill(&self.templates.critique, job, section).replace("{draft}", draft)
    }

    pub fn polish(&self, job: &Job, section: &Section, draft: &str) -> String {
        Self::fill(&self.templates.polish, job, section).replace("{draft}", draft)
    }
}

/// 拆分写作输出为（正文，结束状态）
pub fn split_exit_state(output: &str) -> (String, Option<String>) {
    match output.split_once(EXIT_STATE_MARKER) {
        Some((body, exit)) => {
            let exit = exit.trim();
            let exit = (!exit.is_empty()).then(|| exit.to_string());
            (body.trim_end().to_string(), exit)
        }
        None => (output.trim_end().to_string(), None),
    }
}
