// Task descriptors and answer checking that does not need a sandbox
use crate::types::{Limits, LocalCheck, SubmissionInput};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const TASK_FILE: &str = "task.json";
pub const DEFAULT_ENVIRONMENT: &str = "default";

/// What the grading backend needs to know about a task.
///
/// The course/task content model lives outside this crate; anything that can
/// answer these questions can be submitted.
pub trait GradingTask: Send + Sync {
    fn course_id(&self) -> &str;
    fn task_id(&self) -> &str;
    fn limits(&self) -> Limits;
    fn environment(&self) -> &str;
    fn check_answer(&self, input: &SubmissionInput) -> LocalCheck;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    #[serde(default)]
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProblemKind {
    /// Graded inside the sandbox
    Code,
    MultipleChoice {
        choices: Vec<Choice>,
        #[serde(default)]
        multiple: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    Match {
        answer: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    #[serde(flatten)]
    pub kind: ProblemKind,
}

/// Outcome of checking one problem locally
struct ProblemCheck {
    valid: bool,
    feedback: Option<String>,
    mcq_errors: usize,
}

impl Problem {
    fn check(&self, answer: Option<&serde_json::Value>) -> ProblemCheck {
        match &self.kind {
            ProblemKind::Code => ProblemCheck {
                valid: true,
                feedback: None,
                mcq_errors: 0,
            },
            ProblemKind::Match { answer: expected } => {
                let valid = answer
                    .and_then(|value| value.as_str())
                    .map(|given| given.trim() == expected.trim())
                    .unwrap_or(false);
                ProblemCheck {
                    valid,
                    feedback: (!valid).then(|| "Invalid answer".to_string()),
                    mcq_errors: 0,
                }
            }
            ProblemKind::MultipleChoice {
                choices,
                multiple,
                error_message,
            } => {
                let expected: BTreeSet<&str> = choices
                    .iter()
                    .filter(|choice| choice.valid)
                    .map(|choice| choice.id.as_str())
                    .collect();
                let given: BTreeSet<&str> = match answer {
                    Some(serde_json::Value::String(id)) => [id.as_str()].into_iter().collect(),
                    Some(serde_json::Value::Array(ids)) => {
                        ids.iter().filter_map(|id| id.as_str()).collect()
                    }
                    _ => BTreeSet::new(),
                };

                let mcq_errors = if *multiple {
                    given.symmetric_difference(&expected).count()
                } else if given.len() == 1 && given.is_subset(&expected) {
                    0
                } else {
                    1
                };

                let valid = mcq_errors == 0;
                let feedback = (!valid).then(|| {
                    error_message.clone().unwrap_or_else(|| {
                        if *multiple {
                            "Wrong answer. Make sure to select all the valid possibilities".to_string()
                        } else {
                            "Wrong answer".to_string()
                        }
                    })
                });
                ProblemCheck {
                    valid,
                    feedback,
                    mcq_errors,
                }
            }
        }
    }
}

/// A task as stored under `<tasks>/<course>/<task>/task.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    #[serde(skip)]
    pub course_id: String,
    #[serde(skip)]
    pub task_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub limits: Limits,
    /// Overrides the image's default command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub problems: Vec<Problem>,
}

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}

/// Course and task ids become path components, so they are restricted
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Directory holding the files of a task
pub fn task_directory(tasks_root: &Path, course_id: &str, task_id: &str) -> Result<PathBuf> {
    if !is_valid_id(course_id) || !is_valid_id(task_id) {
        bail!("Invalid course/task id: {}/{}", course_id, task_id);
    }
    Ok(tasks_root.join(course_id).join(task_id))
}

impl TaskDescriptor {
    pub fn load(tasks_root: &Path, course_id: &str, task_id: &str) -> Result<Self> {
        let path = task_directory(tasks_root, course_id, task_id)?.join(TASK_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut task: TaskDescriptor = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        task.course_id = course_id.to_string();
        task.task_id = task_id.to_string();
        Ok(task)
    }
}

impl GradingTask for TaskDescriptor {
    fn course_id(&self) -> &str {
        &self.course_id
    }

    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn limits(&self) -> Limits {
        self.limits
    }

    fn environment(&self) -> &str {
        &self.environment
    }

    fn check_answer(&self, input: &SubmissionInput) -> LocalCheck {
        let mut check = LocalCheck {
            ok: true,
            ..Default::default()
        };
        let mut mcq_errors = 0;

        for problem in &self.problems {
            if problem.kind == ProblemKind::Code {
                check.needs_sandbox = true;
                continue;
            }
            let result = problem.check(input.get(&problem.id));
            if !result.valid {
                check.ok = false;
            }
            if let Some(feedback) = result.feedback {
                check.problems.insert(problem.id.clone(), feedback);
            }
            mcq_errors += result.mcq_errors;
        }

        if mcq_errors != 0 {
            check.text.push(format!(
                "You have {} errors in the multiple choice questions",
                mcq_errors
            ));
        }
        check
    }
}
