/// Result Merger - Local Check + Sandbox Reconciliation
///
/// **Core Responsibility:**
/// Combine the outcome of answer checking done outside the sandbox (e.g.
/// multiple choice) with the outcome reported by the sandbox run into one
/// final verdict.
///
/// **Critical Properties:**
/// - Knows nothing about Docker, agents or queues
/// - Pure function: (local check, optional sandbox result) → verdict
/// - Sandbox failure categories (timeout, overflow, crash, error) dominate a
///   local success: a student is never marked `success` while the sandbox
///   failed
///
/// **Merge Rules:**
/// - No sandbox run: the local check, text lines joined with newlines
/// - Sandbox `success`/`failed`: `success` iff both sides succeeded; text is
///   sandbox first then local; per-problem text is unioned, colliding keys
///   keep the sandbox text followed by the local text
/// - Sandbox failure with text: local base, kind and text from the sandbox
/// - Sandbox failure without text: local base, canonical message for the kind
use crate::types::{LocalCheck, RawResult, ResultKind, Verdict};

pub const ERROR_TEXT: &str = "The grader reported an internal error";
pub const TIMEOUT_TEXT: &str = "Your code took too much time to execute";
pub const OVERFLOW_TEXT: &str = "Your code took too much memory or disk";
pub const CRASH_TEXT: &str = "An unknown internal error occurred";

/// Canonical user-facing message for a failure kind
pub fn canonical_text(kind: ResultKind) -> Option<&'static str> {
    match kind {
        ResultKind::Error => Some(ERROR_TEXT),
        ResultKind::Timeout => Some(TIMEOUT_TEXT),
        ResultKind::Overflow => Some(OVERFLOW_TEXT),
        ResultKind::Crash => Some(CRASH_TEXT),
        ResultKind::Success | ResultKind::Failed => None,
    }
}

fn local_verdict(local: &LocalCheck) -> Verdict {
    Verdict {
        kind: local.kind(),
        text: local.text.join("\n"),
        problems: local.problems.clone(),
        stdout: None,
        stderr: None,
        archive: None,
    }
}

/// Merge a local check with the (optional) sandbox result
pub fn merge(local: &LocalCheck, sandbox: Option<RawResult>) -> Verdict {
    let sandbox = match sandbox {
        Some(sandbox) => sandbox,
        None => return local_verdict(local),
    };

    match sandbox.kind {
        ResultKind::Success | ResultKind::Failed => merge_graded(local, sandbox),
        failure => {
            let mut verdict = local_verdict(local);
            verdict.kind = failure;
            verdict.text = match sandbox.text {
                Some(text) if !text.is_empty() => text,
                _ => canonical_text(failure).unwrap_or(CRASH_TEXT).to_string(),
            };
            verdict.stdout = sandbox.stdout;
            verdict.stderr = sandbox.stderr;
            verdict
        }
    }
}

fn merge_graded(local: &LocalCheck, sandbox: RawResult) -> Verdict {
    let kind = if local.ok && sandbox.kind == ResultKind::Success {
        ResultKind::Success
    } else {
        ResultKind::Failed
    };

    let local_text = local.text.join("\n");
    let text = match sandbox.text {
        Some(sandbox_text) if !local.text.is_empty() => format!("{}\n{}", sandbox_text, local_text),
        Some(sandbox_text) => sandbox_text,
        None => local_text,
    };

    let mut problems = sandbox.problems;
    for (pid, local_problem) in &local.problems {
        problems
            .entry(pid.clone())
            .and_modify(|sandbox_problem| {
                sandbox_problem.push('\n');
                sandbox_problem.push_str(local_problem);
            })
            .or_insert_with(|| local_problem.clone());
    }

    Verdict {
        kind,
        text,
        problems,
        stdout: sandbox.stdout,
        stderr: sandbox.stderr,
        archive: sandbox.archive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn local(ok: bool, text: &[&str]) -> LocalCheck {
        LocalCheck {
            ok,
            needs_sandbox: true,
            text: text.iter().map(|s| s.to_string()).collect(),
            problems: BTreeMap::new(),
        }
    }

    #[test]
    fn test_no_sandbox_returns_local() {
        let check = local(true, &["first", "second"]);
        let verdict = merge(&check, None);
        assert_eq!(verdict.kind, ResultKind::Success);
        assert_eq!(verdict.text, "first\nsecond");
        assert!(verdict.problems.is_empty());
    }

    #[test]
    fn test_both_success() {
        let verdict = merge(&local(true, &[]), Some(RawResult::new(ResultKind::Success)));
        assert_eq!(verdict.kind, ResultKind::Success);
    }

    #[test]
    fn test_local_failure_wins_over_sandbox_success() {
        let verdict = merge(&local(false, &[]), Some(RawResult::new(ResultKind::Success)));
        assert_eq!(verdict.kind, ResultKind::Failed);
    }

    #[test]
    fn test_sandbox_failure_wins_over_local_success() {
        let verdict = merge(&local(true, &[]), Some(RawResult::new(ResultKind::Failed)));
        assert_eq!(verdict.kind, ResultKind::Failed);
    }

    #[test]
    fn test_crash_without_text_uses_canonical_message() {
        let verdict = merge(&local(true, &["mcq ok"]), Some(RawResult::new(ResultKind::Crash)));
        assert_eq!(verdict.kind, ResultKind::Crash);
        assert_eq!(verdict.text, "An unknown internal error occurred");
    }

    #[test]
    fn test_canonical_messages_per_kind() {
        for (kind, text) in [
            (ResultKind::Error, ERROR_TEXT),
            (ResultKind::Timeout, TIMEOUT_TEXT),
            (ResultKind::Overflow, OVERFLOW_TEXT),
        ] {
            let verdict = merge(&local(true, &[]), Some(RawResult::new(kind)));
            assert_eq!(verdict.kind, kind);
            assert_eq!(verdict.text, text);
        }
    }

    #[test]
    fn test_failure_text_overrides_local() {
        let mut check = local(true, &["mcq ok"]);
        check.problems.insert("q1".to_string(), "correct".to_string());
        let verdict = merge(
            &check,
            Some(RawResult::with_text(ResultKind::Timeout, "Loop never ends")),
        );
        assert_eq!(verdict.kind, ResultKind::Timeout);
        assert_eq!(verdict.text, "Loop never ends");
        assert_eq!(verdict.problems.get("q1").map(String::as_str), Some("correct"));
    }

    #[test]
    fn test_text_concatenation_sandbox_first() {
        let verdict = merge(
            &local(true, &["local one", "local two"]),
            Some(RawResult::with_text(ResultKind::Success, "sandbox")),
        );
        assert_eq!(verdict.text, "sandbox\nlocal one\nlocal two");

        let verdict = merge(
            &local(true, &["local"]),
            Some(RawResult::new(ResultKind::Success)),
        );
        assert_eq!(verdict.text, "local");
    }

    #[test]
    fn test_problem_feedback_union() {
        let mut check = local(true, &[]);
        check.problems.insert("shared".to_string(), "local note".to_string());
        check.problems.insert("mcq".to_string(), "right".to_string());

        let mut sandbox = RawResult::new(ResultKind::Success);
        sandbox.problems.insert("shared".to_string(), "sandbox note".to_string());
        sandbox.problems.insert("code".to_string(), "compiled".to_string());

        let verdict = merge(&check, Some(sandbox));
        assert_eq!(verdict.problems.len(), 3);
        assert_eq!(verdict.problems["shared"], "sandbox note\nlocal note");
        assert_eq!(verdict.problems["mcq"], "right");
        assert_eq!(verdict.problems["code"], "compiled");
    }
}
