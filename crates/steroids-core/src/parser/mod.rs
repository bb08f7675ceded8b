//! Orchestrator reply parser.
//!
//! Turns the orchestrator's free-form reply into a structured decision
//! through a five-layer tolerant waterfall:
//!
//! 1. parse the whole output as JSON;
//! 2. parse the first fenced `json` code block;
//! 3. parse the substring from the first `{` to the last `}`;
//! 4. re-run all three candidates through the repair normaliser;
//! 5. keyword / explicit-token heuristics.
//!
//! Layers 1-4 produce [`ParseOutcome::Structured`]; layer 5 produces
//! [`ParseOutcome::Fallback`] with `confidence = low` and a reasoning
//! prefixed `FALLBACK:` so the audit trail can tell them apart.

mod decode;
pub mod repair;

use serde::{Deserialize, Serialize};

use steroids_db::models::TaskStatus;

/// Sentinel prefix on every heuristic fallback's reasoning.
pub const FALLBACK_PREFIX: &str = "FALLBACK:";

/// Upper bound on accepted string field lengths; longer fields invalidate
/// the candidate layer.
pub(crate) const MAX_FIELD_LEN: usize = 20_000;

// -----------------------------------------------------------------------
// Decision types
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoderAction {
    Submit,
    StageCommitSubmit,
    Retry,
    Error,
}

impl CoderAction {
    /// The task status this action drives toward.
    pub fn next_status(self) -> TaskStatus {
        match self {
            Self::Submit | Self::StageCommitSubmit => TaskStatus::Review,
            Self::Retry => TaskStatus::InProgress,
            Self::Error => TaskStatus::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::StageCommitSubmit => "stage_commit_submit",
            Self::Retry => "retry",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoderMetadata {
    pub files_changed: u64,
    pub confidence: Confidence,
    pub exit_clean: bool,
    pub has_commits: bool,
}

/// Structured verdict for a coder phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoderDecision {
    pub action: CoderAction,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commits: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    pub next_status: TaskStatus,
    pub metadata: CoderMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerVerdict {
    Approve,
    Reject,
    Dispute,
    Skip,
    Unclear,
}

impl ReviewerVerdict {
    pub fn next_status(self) -> TaskStatus {
        match self {
            Self::Approve => TaskStatus::Completed,
            Self::Reject => TaskStatus::InProgress,
            Self::Dispute => TaskStatus::Disputed,
            Self::Skip => TaskStatus::Skipped,
            Self::Unclear => TaskStatus::Review,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Dispute => "dispute",
            Self::Skip => "skip",
            Self::Unclear => "unclear",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerMetadata {
    pub rejection_count: u64,
    pub confidence: Confidence,
    pub push_to_remote: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeated_issue: Option<bool>,
}

/// A follow-up task proposed by an approving reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpTask {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Structured verdict for a reviewer phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerDecision {
    pub decision: ReviewerVerdict,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub next_status: TaskStatus,
    pub metadata: ReviewerMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub follow_up_tasks: Vec<FollowUpTask>,
}

/// How a decision was obtained.
///
/// Fallbacks are a variant, not a flag: heuristic layer-5 results cannot
/// be confused with structured parses at the type level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome<T> {
    /// Decoded from structured output (layers 1-4).
    Structured(T),
    /// Constructed by the heuristic layer; confidence is always low and
    /// the reasoning starts with [`FALLBACK_PREFIX`].
    Fallback(T),
}

impl<T> ParseOutcome<T> {
    pub fn decision(&self) -> &T {
        match self {
            Self::Structured(d) | Self::Fallback(d) => d,
        }
    }

    pub fn into_decision(self) -> T {
        match self {
            Self::Structured(d) | Self::Fallback(d) => d,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

// -----------------------------------------------------------------------
// Waterfall
// -----------------------------------------------------------------------

/// Candidate substrings tried by the structured layers, in order.
fn candidates(raw: &str) -> Vec<String> {
    let mut out = vec![raw.trim().to_string()];

    // First fenced block tagged json.
    if let Some(start) = raw.find("```json") {
        let body = &raw[start + "```json".len()..];
        if let Some(end) = body.find("```") {
            out.push(body[..end].trim().to_string());
        }
    }

    // First '{' through last '}'.
    if let (Some(first), Some(last)) = (raw.find('{'), raw.rfind('}')) {
        if first < last {
            out.push(raw[first..=last].to_string());
        }
    }

    out
}

/// Parse a coder-side orchestrator reply. Total: always yields a
/// decision.
pub fn parse_coder_reply(raw: &str) -> ParseOutcome<CoderDecision> {
    let candidates = candidates(raw);

    for candidate in &candidates {
        if let Some(decision) = decode::decode_coder(candidate) {
            return ParseOutcome::Structured(decision);
        }
    }
    for candidate in &candidates {
        let repaired = repair::normalize(candidate);
        if let Some(decision) = decode::decode_coder(&repaired) {
            return ParseOutcome::Structured(decision);
        }
    }

    ParseOutcome::Fallback(decode::coder_heuristic(raw))
}

/// Parse a reviewer-side orchestrator reply. Total: always yields a
/// decision.
pub fn parse_reviewer_reply(raw: &str) -> ParseOutcome<ReviewerDecision> {
    let candidates = candidates(raw);

    for candidate in &candidates {
        if let Some(decision) = decode::decode_reviewer(candidate) {
            return ParseOutcome::Structured(decision);
        }
    }
    for candidate in &candidates {
        let repaired = repair::normalize(candidate);
        if let Some(decision) = decode::decode_reviewer(&repaired) {
            return ParseOutcome::Structured(decision);
        }
    }

    ParseOutcome::Fallback(decode::reviewer_heuristic(raw))
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const CODER_OK: &str = r#"{"action":"submit","reasoning":"ok","next_status":"review","metadata":{"files_changed":1,"confidence":"high","exit_clean":true,"has_commits":true}}"#;

    const REVIEWER_OK: &str = r#"{"decision":"approve","reasoning":"ok","notes":"lgtm","next_status":"completed","metadata":{"rejection_count":0,"confidence":"high","push_to_remote":true,"repeated_issue":false}}"#;

    #[test]
    fn layer1_whole_string() {
        let outcome = parse_coder_reply(CODER_OK);
        assert!(!outcome.is_fallback());
        let d = outcome.decision();
        assert_eq!(d.action, CoderAction::Submit);
        assert_eq!(d.next_status, TaskStatus::Review);
        assert_eq!(d.metadata.confidence, Confidence::High);
        assert!(d.metadata.exit_clean);
    }

    #[test]
    fn layer2_fenced_block() {
        let raw = format!("Here is my decision:\n```json\n{CODER_OK}\n```\nthanks");
        let outcome = parse_coder_reply(&raw);
        assert!(!outcome.is_fallback());
        assert_eq!(outcome.decision().action, CoderAction::Submit);
    }

    #[test]
    fn layer3_brace_substring() {
        let raw = format!("I decided the following {CODER_OK} -- end of reply");
        let outcome = parse_coder_reply(&raw);
        assert!(!outcome.is_fallback());
        assert_eq!(outcome.decision().action, CoderAction::Submit);
    }

    #[test]
    fn layer4_repair() {
        let raw = "```json\n{action: 'retry', reasoning: 'flaky test', next_status: 'in_progress', metadata: {files_changed: 0, confidence: 'medium', exit_clean: False, has_commits: False,},}\n```";
        let outcome = parse_coder_reply(raw);
        assert!(!outcome.is_fallback());
        let d = outcome.decision();
        assert_eq!(d.action, CoderAction::Retry);
        assert_eq!(d.metadata.confidence, Confidence::Medium);
        assert!(!d.metadata.exit_clean);
    }

    #[test]
    fn layer5_fallback_is_marked() {
        let outcome = parse_coder_reply("I could not comply.");
        assert!(outcome.is_fallback());
        let d = outcome.decision();
        assert!(d.reasoning.starts_with(FALLBACK_PREFIX));
        assert_eq!(d.metadata.confidence, Confidence::Low);
    }

    #[test]
    fn reviewer_structured() {
        let outcome = parse_reviewer_reply(REVIEWER_OK);
        assert!(!outcome.is_fallback());
        let d = outcome.decision();
        assert_eq!(d.decision, ReviewerVerdict::Approve);
        assert_eq!(d.notes.as_deref(), Some("lgtm"));
        assert_eq!(d.next_status, TaskStatus::Completed);
        assert_eq!(d.metadata.repeated_issue, Some(false));
    }

    #[test]
    fn reviewer_decision_token_fallback() {
        let raw = "The change looks good overall.\n\nDECISION: APPROVE\n";
        let outcome = parse_reviewer_reply(raw);
        assert!(outcome.is_fallback());
        assert_eq!(outcome.decision().decision, ReviewerVerdict::Approve);
    }

    #[test]
    fn reviewer_last_decision_token_wins() {
        // Replayed transcripts can contain earlier DECISION lines; the
        // last one is authoritative.
        let raw = "DECISION: REJECT\n...rework happened...\nDECISION: APPROVE\n";
        let outcome = parse_reviewer_reply(raw);
        assert_eq!(outcome.decision().decision, ReviewerVerdict::Approve);
    }

    #[test]
    fn reviewer_unclear_when_nothing_matches() {
        let outcome = parse_reviewer_reply("I have thoughts but no verdict.");
        assert!(outcome.is_fallback());
        let d = outcome.decision();
        assert_eq!(d.decision, ReviewerVerdict::Unclear);
        assert_eq!(d.next_status, TaskStatus::Review);
    }

    #[test]
    fn parser_is_identity_on_serialized_coder_decision() {
        let original = CoderDecision {
            action: CoderAction::StageCommitSubmit,
            reasoning: "implemented and verified".to_string(),
            commits: vec!["abc1234".to_string()],
            commit_message: Some("add feature".to_string()),
            next_status: TaskStatus::Review,
            metadata: CoderMetadata {
                files_changed: 3,
                confidence: Confidence::High,
                exit_clean: true,
                has_commits: true,
            },
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let outcome = parse_coder_reply(&serialized);
        assert!(!outcome.is_fallback());
        assert_eq!(outcome.into_decision(), original);
    }

    #[test]
    fn parser_is_identity_on_serialized_reviewer_decision() {
        let original = ReviewerDecision {
            decision: ReviewerVerdict::Reject,
            reasoning: "tests missing".to_string(),
            notes: Some("add coverage for the error path".to_string()),
            next_status: TaskStatus::InProgress,
            metadata: ReviewerMetadata {
                rejection_count: 2,
                confidence: Confidence::Medium,
                push_to_remote: false,
                repeated_issue: Some(true),
            },
            follow_up_tasks: vec![FollowUpTask {
                title: "document the API".to_string(),
                description: None,
            }],
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let outcome = parse_reviewer_reply(&serialized);
        assert!(!outcome.is_fallback());
        assert_eq!(outcome.into_decision(), original);
    }

    #[test]
    fn confidence_case_is_folded() {
        let raw = r#"{"action":"submit","reasoning":"ok","next_status":"review","metadata":{"files_changed":1,"confidence":"HIGH","exit_clean":true,"has_commits":true}}"#;
        let outcome = parse_coder_reply(raw);
        assert!(!outcome.is_fallback());
        assert_eq!(outcome.decision().metadata.confidence, Confidence::High);
    }

    #[test]
    fn string_booleans_are_coerced() {
        let raw = r#"{"action":"submit","reasoning":"ok","next_status":"review","metadata":{"files_changed":1,"confidence":"high","exit_clean":"true","has_commits":"false"}}"#;
        let outcome = parse_coder_reply(raw);
        assert!(!outcome.is_fallback());
        assert!(outcome.decision().metadata.exit_clean);
        assert!(!outcome.decision().metadata.has_commits);
    }

    #[test]
    fn negative_counts_invalidate_the_layer() {
        let raw = r#"{"action":"submit","reasoning":"ok","next_status":"review","metadata":{"files_changed":-2,"confidence":"high","exit_clean":true,"has_commits":true}}"#;
        // Falls all the way to heuristics.
        let outcome = parse_coder_reply(raw);
        assert!(outcome.is_fallback());
    }

    #[test]
    fn invalid_enum_falls_through() {
        let raw = r#"{"action":"explode","reasoning":"ok","next_status":"review","metadata":{"files_changed":0,"confidence":"high","exit_clean":true,"has_commits":false}}"#;
        let outcome = parse_coder_reply(raw);
        assert!(outcome.is_fallback());
    }

    #[test]
    fn oversized_reasoning_invalidates_the_layer() {
        let big = "x".repeat(MAX_FIELD_LEN + 1);
        let raw = format!(
            r#"{{"action":"submit","reasoning":"{big}","next_status":"review","metadata":{{"files_changed":0,"confidence":"high","exit_clean":true,"has_commits":false}}}}"#
        );
        let outcome = parse_coder_reply(&raw);
        assert!(outcome.is_fallback());
    }

    #[test]
    fn missing_next_status_is_derived_from_action() {
        let raw = r#"{"action":"retry","reasoning":"try again","metadata":{"files_changed":0,"confidence":"medium","exit_clean":false,"has_commits":false}}"#;
        let outcome = parse_coder_reply(raw);
        assert!(!outcome.is_fallback());
        assert_eq!(outcome.decision().next_status, TaskStatus::InProgress);
    }
}
