use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Opaque identifier of one grading request
pub type JobId = Uuid;

/// Student answers, keyed by problem id
pub type SubmissionInput = BTreeMap<String, serde_json::Value>;

/// Lower bound applied to every container memory limit (MB)
pub const MIN_MEMORY_MB: u64 = 20;

/// `hard_time` defaults to this multiple of `time` when the task leaves it unset
pub const HARD_TIME_FACTOR: u64 = 3;

/// Resource limits declared by a task.
///
/// Field names match what the container program reads from its input, so
/// they are kept short: `time` and `hard_time` are seconds, `memory` and
/// `disk` are megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// CPU-time limit
    #[serde(default = "default_time")]
    pub time: u64,
    /// Wall-clock backstop; `None` or 0 means `time * HARD_TIME_FACTOR`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_time: Option<u64>,
    #[serde(default = "default_memory")]
    pub memory: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<u64>,
}

fn default_time() -> u64 {
    30
}

fn default_memory() -> u64 {
    100
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            time: default_time(),
            hard_time: None,
            memory: default_memory(),
            disk: None,
        }
    }
}

impl Limits {
    /// Memory limit normalised into `[MIN_MEMORY_MB, ceiling_mb]`
    pub fn clamped_memory_mb(&self, ceiling_mb: u64) -> u64 {
        self.memory.clamp(MIN_MEMORY_MB, ceiling_mb.max(MIN_MEMORY_MB))
    }

    pub fn effective_hard_time(&self) -> u64 {
        match self.hard_time {
            Some(hard) if hard > 0 => hard,
            _ => self.time.max(1) * HARD_TIME_FACTOR,
        }
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time)
    }

    pub fn hard_time_limit(&self) -> Duration {
        Duration::from_secs(self.effective_hard_time())
    }
}

/// Outcome category of a grading run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Success,
    Failed,
    Error,
    Timeout,
    Overflow,
    Crash,
}

impl ResultKind {
    /// Parse a kind reported by untrusted code. Unknown values become `Error`.
    pub fn parse_lenient(value: &str) -> ResultKind {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" => ResultKind::Success,
            "failed" => ResultKind::Failed,
            "timeout" => ResultKind::Timeout,
            "overflow" => ResultKind::Overflow,
            "crash" => ResultKind::Crash,
            _ => ResultKind::Error,
        }
    }

    pub fn deserialize_lenient<'de, D>(deserializer: D) -> Result<ResultKind, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(ResultKind::parse_lenient(&raw))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Success => "success",
            ResultKind::Failed => "failed",
            ResultKind::Error => "error",
            ResultKind::Timeout => "timeout",
            ResultKind::Overflow => "overflow",
            ResultKind::Crash => "crash",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextField {
    One(String),
    Many(Vec<String>),
}

/// Accepts either a string or a list of lines for free-text fields
fn text_or_lines<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<TextField> = Option::deserialize(deserializer)?;
    Ok(value.map(|text| match text {
        TextField::One(line) => line,
        TextField::Many(lines) => lines.join("\n"),
    }))
}

/// Result of one sandbox run, as produced by the Agent (or synthesised by
/// the backend when the Agent failed to produce one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    #[serde(rename = "result", deserialize_with = "ResultKind::deserialize_lenient")]
    pub kind: ResultKind,
    #[serde(default, deserialize_with = "text_or_lines", skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub problems: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Base64-encoded archive produced by the grading program
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

impl RawResult {
    pub fn new(kind: ResultKind) -> Self {
        Self {
            kind,
            text: None,
            problems: BTreeMap::new(),
            stdout: None,
            stderr: None,
            archive: None,
        }
    }

    pub fn with_text(kind: ResultKind, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::new(kind)
        }
    }

    pub fn crash(text: impl Into<String>) -> Self {
        Self::with_text(ResultKind::Crash, text)
    }
}

/// Result of answer checking that does not need the sandbox
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocalCheck {
    pub ok: bool,
    pub needs_sandbox: bool,
    pub text: Vec<String>,
    pub problems: BTreeMap<String, String>,
}

impl LocalCheck {
    pub fn kind(&self) -> ResultKind {
        if self.ok {
            ResultKind::Success
        } else {
            ResultKind::Failed
        }
    }
}

/// Merged outcome, before it is bound to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(rename = "result")]
    pub kind: ResultKind,
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub problems: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

/// Terminal result delivered exactly once per job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub job_id: JobId,
    pub course_id: String,
    pub task_id: String,
    #[serde(flatten)]
    pub verdict: Verdict,
    pub completed_at: DateTime<Utc>,
}

impl FinalResult {
    pub fn new(job_id: JobId, course_id: &str, task_id: &str, verdict: Verdict) -> Self {
        Self {
            job_id,
            course_id: course_id.to_string(),
            task_id: task_id.to_string(),
            verdict,
            completed_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> ResultKind {
        self.verdict.kind
    }

    pub fn text(&self) -> &str {
        &self.verdict.text
    }
}
