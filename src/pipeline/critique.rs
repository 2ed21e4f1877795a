//! 评审结论解析
//!
//! 评审角色返回一段 JSON（可能夹在说明文字或代码块中）：取第一个 `{` 到最后一个 `}` 之间的内容解析。
//! 解析失败视为 MalformedOutput：不中断分节，而是给出保守的默认结论（通过，但标记低可信）。

use serde::Deserialize;

use crate::core::GenerationErrorKind;

/// 评审结论
#[derive(Debug, Clone, PartialEq)]
pub struct CritiqueVerdict {
    pub score: f32,
    pub approved: bool,
    pub diagnosis: String,
    pub required_fixes: Vec<String>,
    /// 重写时需保留的要素
    pub preserve: Vec<String>,
    /// 来自回退默认值，而非真正的评审输出
    pub low_confidence: bool,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    score: Option<f32>,
    approved: bool,
    #[serde(default)]
    diagnosis: String,
    #[serde(default, alias = "fixes")]
    required_fixes: Vec<String>,
    #[serde(default, alias = "keep")]
    preserve: Vec<String>,
}

impl CritiqueVerdict {
    /// 解析评审输出；失败时返回 MalformedOutput 分类与原因
    pub fn parse(output: &str) -> Result<Self, (GenerationErrorKind, String)> {
        let malformed = |reason: String| (GenerationErrorKind::MalformedOutput, reason);

        let start = output
            .find('{')
            .ok_or_else(|| malformed("no JSON object in critique output".to_string()))?;
        let end = output
            .rfind('}')
            .filter(|&end| end > start)
            .ok_or_else(|| malformed("unterminated JSON object in critique output".to_string()))?;

        let raw: RawVerdict = serde_json::from_str(&output[start..=end])
            .map_err(|e| malformed(format!("invalid critique JSON: {e}")))?;

        Ok(Self {
            score: raw.score.unwrap_or(0.0),
            approved: raw.approved,
            diagnosis: raw.diagnosis.trim().to_string(),
            required_fixes: raw.required_fixes,
            preserve: raw.preserve,
            low_confidence: false,
        })
    }

    /// 无法解析时的保守结论：放行，避免任务被格式问题卡住
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            approved: true,
            diagnosis: reason.into(),
            required_fixes: Vec::new(),
            preserve: Vec::new(),
            low_confidence: true,
        }
    }

    /// 解析，失败则回退
    pub fn parse_or_fallback(output: &str) -> Self {
        match Self::parse(output) {
            Ok(verdict) => verdict,
            Err((kind, reason)) => {
                tracing::warn!("Critique output unusable ({}): {}", kind, reason);
                Self::fallback(reason)
            }
        }
    }

    /// 由结构化反馈生成下一轮写作的精修指令
    pub fn refinement_instructions(&self) -> String {
        let mut out = String::from("The previous draft was not approved.\n");
        if !self.diagnosis.is_empty() {
            out.push_str(&format!("Diagnosis: {}\n", self.diagnosis));
        }
        if !self.required_fixes.is_empty() {
            out.push_str("Required fixes:\n");
            for fix in &self.required_fixes {
                out.push_str(&format!("- {fix}\n"));
            }
        }
        if !self.preserve.is_empty() {
            out.push_str("Keep these elements intact:\n");
            for item in &self.preserve {
                out.push_str(&format!("- {item}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_wrapped_in_prose() {
        let output = "Here is my review:\n```json\n{\"score\": 6.5, \"approved\": false, \
                      \"diagnosis\": \"Pacing drags\", \"required_fixes\": [\"cut the dream\"], \
                      \"preserve\": [\"the opening line\"]}\n```";
        let verdict = CritiqueVerdict::parse(output).unwrap();
        assert!(!verdict.approved);
        assert_eq!(verdict.score, 6.5);
        assert_eq!(verdict.required_fixes, vec!["cut the dream"]);
        assert!(!verdict.low_confidence);
    }

    #[test]
    fn malformed_output_falls_back_to_low_confidence_approval() {
        let err = CritiqueVerdict::parse("looks fine to me").unwrap_err();
        assert_eq!(err.0, GenerationErrorKind::MalformedOutput);

        let verdict = CritiqueVerdict::parse_or_fallback("{ not json }");
        assert!(verdict.approved);
        assert!(verdict.low_confidence);
    }

    #[test]
    fn refinement_instructions_include_feedback() {
        let verdict = CritiqueVerdict {
            score: 4.0,
            approved: false,
            diagnosis: "Too abrupt".into(),
            required_fixes: vec!["slow the ending".into()],
            preserve: vec!["the storm".into()],
            low_confidence: false,
        };
        let text = verdict.refinement_instructions();
        assert!(text.contains("Diagnosis: Too abrupt"));
        assert!(text.contains("- slow the ending"));
        assert!(text.contains("- the storm"));
    }
}
