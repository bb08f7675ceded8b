//! Value-level decoding and the layer-5 heuristics.
//!
//! Decoding is tolerant about shape (string booleans, mixed-case
//! confidence) but strict about semantics: unknown enum values, negative
//! counts, and oversized strings invalidate the candidate so the next
//! waterfall layer gets its turn.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use steroids_db::models::TaskStatus;

use super::{
    CoderAction, CoderDecision, CoderMetadata, Confidence, FALLBACK_PREFIX, FollowUpTask,
    MAX_FIELD_LEN, ReviewerDecision, ReviewerMetadata, ReviewerVerdict,
};

// -----------------------------------------------------------------------
// Field readers
// -----------------------------------------------------------------------

fn read_string(v: &Value, key: &str) -> Option<String> {
    let s = v.get(key)?.as_str()?;
    if s.len() > MAX_FIELD_LEN {
        return None;
    }
    Some(s.to_string())
}

/// Bool, tolerating the string forms "true"/"false".
fn read_bool(v: &Value, key: &str) -> Option<bool> {
    match v.get(key) {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => match s.to_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Non-negative integer; a negative value poisons the candidate.
enum Count {
    Ok(u64),
    Missing,
    Invalid,
}

fn read_count(v: &Value, key: &str) -> Count {
    match v.get(key) {
        None | Some(Value::Null) => Count::Missing,
        Some(value) => match value.as_u64() {
            Some(n) => Count::Ok(n),
            None => Count::Invalid,
        },
    }
}

fn read_confidence(v: &Value) -> Option<Confidence> {
    match v.get("confidence") {
        None | Some(Value::Null) => Some(Confidence::Medium),
        Some(Value::String(s)) => match s.to_lowercase().as_str() {
            "high" => Some(Confidence::High),
            "medium" => Some(Confidence::Medium),
            "low" => Some(Confidence::Low),
            _ => None,
        },
        _ => None,
    }
}

fn read_status(v: &Value, key: &str, allowed: &[TaskStatus]) -> Result<Option<TaskStatus>, ()> {
    match v.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => match s.parse::<TaskStatus>() {
            Ok(status) if allowed.contains(&status) => Ok(Some(status)),
            _ => Err(()),
        },
        _ => Err(()),
    }
}

// -----------------------------------------------------------------------
// Coder decoding
// -----------------------------------------------------------------------

/// Decode a coder decision from a candidate string. `None` when the
/// candidate is not valid JSON or fails schema validation.
pub(super) fn decode_coder(candidate: &str) -> Option<CoderDecision> {
    let v: Value = serde_json::from_str(candidate.trim()).ok()?;
    let obj = v.as_object()?;

    let action = match obj.get("action")?.as_str()? {
        "submit" => CoderAction::Submit,
        "stage_commit_submit" => CoderAction::StageCommitSubmit,
        "retry" => CoderAction::Retry,
        "error" => CoderAction::Error,
        _ => return None,
    };

    let reasoning = read_string(&v, "reasoning")?;

    let commits = match v.get("commits") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|i| i.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()?,
        _ => return None,
    };

    let commit_message = match v.get("commit_message") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.len() <= MAX_FIELD_LEN => Some(s.clone()),
        _ => return None,
    };

    let next_status = read_status(
        &v,
        "next_status",
        &[TaskStatus::Review, TaskStatus::InProgress, TaskStatus::Failed],
    )
    .ok()?
    .unwrap_or_else(|| action.next_status());

    let metadata = v.get("metadata").cloned().unwrap_or(Value::Null);
    let files_changed = match read_count(&metadata, "files_changed") {
        Count::Ok(n) => n,
        Count::Missing => 0,
        Count::Invalid => return None,
    };

    Some(CoderDecision {
        action,
        reasoning,
        commits,
        commit_message,
        next_status,
        metadata: CoderMetadata {
            files_changed,
            confidence: read_confidence(&metadata)?,
            exit_clean: read_bool(&metadata, "exit_clean").unwrap_or(false),
            has_commits: read_bool(&metadata, "has_commits").unwrap_or(false),
        },
    })
}

// -----------------------------------------------------------------------
// Reviewer decoding
// -----------------------------------------------------------------------

pub(super) fn decode_reviewer(candidate: &str) -> Option<ReviewerDecision> {
    let v: Value = serde_json::from_str(candidate.trim()).ok()?;
    let obj = v.as_object()?;

    let decision = match obj.get("decision")?.as_str()? {
        "approve" => ReviewerVerdict::Approve,
        "reject" => ReviewerVerdict::Reject,
        "dispute" => ReviewerVerdict::Dispute,
        "skip" => ReviewerVerdict::Skip,
        "unclear" => ReviewerVerdict::Unclear,
        _ => return None,
    };

    let reasoning = read_string(&v, "reasoning")?;

    let notes = match v.get("notes") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.len() <= MAX_FIELD_LEN => Some(s.clone()),
        _ => return None,
    };

    let next_status = read_status(
        &v,
        "next_status",
        &[
            TaskStatus::Completed,
            TaskStatus::InProgress,
            TaskStatus::Disputed,
            TaskStatus::Skipped,
            TaskStatus::Review,
        ],
    )
    .ok()?
    .unwrap_or_else(|| decision.next_status());

    let follow_up_tasks = match v.get("follow_up_tasks") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let mut tasks = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    // Items arrive either as bare title strings or as
                    // {title, description} objects.
                    Value::String(title) if title.len() <= MAX_FIELD_LEN => {
                        tasks.push(FollowUpTask {
                            title: title.clone(),
                            description: None,
                        });
                    }
                    Value::Object(_) => {
                        let title = read_string(item, "title")?;
                        let description = match item.get("description") {
                            None | Some(Value::Null) => None,
                            Some(Value::String(s)) if s.len() <= MAX_FIELD_LEN => Some(s.clone()),
                            _ => return None,
                        };
                        tasks.push(FollowUpTask { title, description });
                    }
                    _ => return None,
                }
            }
            tasks
        }
        _ => return None,
    };

    let metadata = v.get("metadata").cloned().unwrap_or(Value::Null);
    let rejection_count = match read_count(&metadata, "rejection_count") {
        Count::Ok(n) => n,
        Count::Missing => 0,
        Count::Invalid => return None,
    };

    Some(ReviewerDecision {
        decision,
        reasoning,
        notes,
        next_status,
        metadata: ReviewerMetadata {
            rejection_count,
            confidence: read_confidence(&metadata)?,
            push_to_remote: read_bool(&metadata, "push_to_remote").unwrap_or(false),
            repeated_issue: read_bool(&metadata, "repeated_issue"),
        },
        follow_up_tasks,
    })
}

// -----------------------------------------------------------------------
// Layer-5 heuristics
// -----------------------------------------------------------------------

fn timeout_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)timed?[\s-]?out|timeout").unwrap())
}

fn commit_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bcommit(ted|s)?\b|\b[0-9a-f]{7,40}\b").unwrap())
}

fn completion_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(done|completed|finished|implemented|all tests pass)\b").unwrap()
    })
}

fn error_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(error|failed|failure|exception|panic)\b").unwrap())
}

/// Construct a safe coder default from keyword matches.
pub(super) fn coder_heuristic(raw: &str) -> CoderDecision {
    let (action, why) = if timeout_pattern().is_match(raw) {
        (CoderAction::Retry, "output mentions a timeout; retrying")
    } else if completion_pattern().is_match(raw) && commit_pattern().is_match(raw) {
        (
            CoderAction::Submit,
            "output suggests completed, committed work",
        )
    } else if error_pattern().is_match(raw) {
        (CoderAction::Retry, "output mentions an error; retrying")
    } else {
        (
            CoderAction::Retry,
            "could not parse orchestrator output; retrying",
        )
    };

    CoderDecision {
        action,
        reasoning: format!("{FALLBACK_PREFIX} {why}"),
        commits: Vec::new(),
        commit_message: None,
        next_status: action.next_status(),
        metadata: CoderMetadata {
            files_changed: 0,
            confidence: Confidence::Low,
            exit_clean: false,
            has_commits: action == CoderAction::Submit,
        },
    }
}

fn decision_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"DECISION:\s*(APPROVE|REJECT|DISPUTE|SKIP)").unwrap())
}

fn bare_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*(approve|reject|dispute|skip)\b").unwrap())
}

fn verdict_from_token(token: &str) -> ReviewerVerdict {
    match token.to_lowercase().as_str() {
        "approve" => ReviewerVerdict::Approve,
        "reject" => ReviewerVerdict::Reject,
        "dispute" => ReviewerVerdict::Dispute,
        _ => ReviewerVerdict::Skip,
    }
}

/// Construct a reviewer default.
///
/// Prior sessions may be replayed into the transcript, so the **last**
/// explicit `DECISION:` token wins; failing that, a bare verdict at the
/// start of the last non-empty line; failing that, `unclear`.
pub(super) fn reviewer_heuristic(raw: &str) -> ReviewerDecision {
    let (decision, why) = if let Some(caps) = decision_token().captures_iter(raw).last() {
        let token = caps.get(1).map(|m| m.as_str()).unwrap_or("SKIP");
        (
            verdict_from_token(token),
            format!("explicit DECISION token: {token}"),
        )
    } else if let Some(caps) = raw
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| bare_token().captures(line))
    {
        let token = caps.get(1).map(|m| m.as_str()).unwrap_or("skip");
        (
            verdict_from_token(token),
            format!("bare verdict token on last line: {token}"),
        )
    } else {
        (
            ReviewerVerdict::Unclear,
            "no verdict found in orchestrator output".to_string(),
        )
    };

    ReviewerDecision {
        decision,
        reasoning: format!("{FALLBACK_PREFIX} {why}"),
        notes: None,
        next_status: decision.next_status(),
        metadata: ReviewerMetadata {
            rejection_count: 0,
            confidence: Confidence::Low,
            push_to_remote: false,
            repeated_issue: None,
        },
        follow_up_tasks: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coder_heuristic_timeout_retries() {
        let d = coder_heuristic("the coder process timed out after 600s");
        assert_eq!(d.action, CoderAction::Retry);
        assert!(d.reasoning.starts_with(FALLBACK_PREFIX));
    }

    #[test]
    fn coder_heuristic_commit_and_done_submits() {
        let d = coder_heuristic("All tests pass. Committed as a1b2c3d. Done.");
        assert_eq!(d.action, CoderAction::Submit);
        assert!(d.metadata.has_commits);
    }

    #[test]
    fn coder_heuristic_default_retries() {
        let d = coder_heuristic("lorem ipsum");
        assert_eq!(d.action, CoderAction::Retry);
        assert_eq!(d.metadata.confidence, Confidence::Low);
    }

    #[test]
    fn reviewer_heuristic_bare_token_on_last_line() {
        let d = reviewer_heuristic("Summary above.\n\nreject\n");
        assert_eq!(d.decision, ReviewerVerdict::Reject);
        assert_eq!(d.next_status, TaskStatus::InProgress);
    }

    #[test]
    fn reviewer_heuristic_ignores_mid_text_verdict_words() {
        // "approve" buried mid-sentence on the last line does not count.
        let d = reviewer_heuristic("I might approve this later, still thinking");
        assert_eq!(d.decision, ReviewerVerdict::Unclear);
    }

    #[test]
    fn decode_coder_rejects_non_object() {
        assert!(decode_coder("[1, 2, 3]").is_none());
        assert!(decode_coder("\"submit\"").is_none());
    }

    #[test]
    fn decode_reviewer_follow_ups_as_strings_or_objects() {
        let raw = r#"{"decision":"approve","reasoning":"ok","metadata":{"rejection_count":0,"confidence":"high","push_to_remote":false},"follow_up_tasks":["write docs",{"title":"add bench","description":"criterion"}]}"#;
        let d = decode_reviewer(raw).unwrap();
        assert_eq!(d.follow_up_tasks.len(), 2);
        assert_eq!(d.follow_up_tasks[0].title, "write docs");
        assert_eq!(d.follow_up_tasks[1].description.as_deref(), Some("criterion"));
    }

    #[test]
    fn decode_reviewer_bad_follow_up_invalidates() {
        let raw = r#"{"decision":"approve","reasoning":"ok","metadata":{"rejection_count":0,"confidence":"high","push_to_remote":false},"follow_up_tasks":[42]}"#;
        assert!(decode_reviewer(raw).is_none());
    }
}
