//! Prompt construction for the four actor roles.
//!
//! Orchestrator prompts pin the exact JSON reply shape; actor output is
//! embedded truncated so a runaway transcript cannot blow up the next
//! prompt.

use serde_json::json;

use steroids_db::models::Task;

use crate::config::RoleTarget;
use crate::git::GitState;
use crate::provider::InvocationResult;
use crate::selector::NextAction;

/// Longest actor-output excerpt embedded into an orchestrator prompt.
const MAX_EMBEDDED_OUTPUT: usize = 30_000;

fn truncated(s: &str) -> &str {
    match s.char_indices().nth(MAX_EMBEDDED_OUTPUT) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

pub(super) fn coder_prompt(task: &Task, action: NextAction, guidance: Option<&str>) -> String {
    let mut prompt = match action {
        NextAction::Start => format!(
            "You are the coder. Implement the following task in this repository.\n\n\
             Task: {}\n",
            task.title
        ),
        NextAction::Resume => format!(
            "You are the coder. Resume work on the following task; a previous \
             session may have left partial changes in the working tree.\n\n\
             Task: {}\n",
            task.title
        ),
    };

    if task.rejection_count > 0 {
        prompt.push_str(&format!(
            "\nThis task has been rejected {} time(s) in review. Address the \
             reviewer's notes before resubmitting.\n",
            task.rejection_count
        ));
    }
    if let Some(guidance) = guidance {
        prompt.push_str("\nCoordinator guidance:\n");
        prompt.push_str(guidance);
        prompt.push('\n');
    }
    prompt.push_str("\nWhen the work is complete, commit your changes and summarise what you did.\n");
    prompt
}

pub(super) fn coder_orchestrator_prompt(
    task: &Task,
    coder: &InvocationResult,
    git: &GitState,
) -> String {
    let context = json!({
        "task": { "id": task.id, "title": task.title, "rejection_count": task.rejection_count },
        "coder_output": truncated(&coder.stdout),
        "coder_stderr": truncated(&coder.stderr),
        "coder_exit_code": coder.exit_code,
        "git_state": {
            "recent_commits": git.recent_commits,
            "changed_files": git.changed_files,
            "has_uncommitted_changes": git.has_uncommitted_changes,
            "diff_summary": git.diff_summary,
        },
    });

    format!(
        "You are the orchestrator. Based on the coder's output and the git \
         state, decide what happens to this task. Reply with exactly one JSON \
         object of the shape:\n\
         {{\"action\": \"submit|stage_commit_submit|retry|error\", \
         \"reasoning\": \"...\", \"commit_message\": \"...\", \
         \"next_status\": \"review|in_progress|failed\", \
         \"metadata\": {{\"files_changed\": 0, \"confidence\": \
         \"high|medium|low\", \"exit_clean\": true, \"has_commits\": false}}}}\n\n\
         Context:\n{context}\n"
    )
}

pub(super) fn reviewer_prompt(task: &Task) -> String {
    format!(
        "You are the reviewer. Review the latest changes in this repository \
         for the task below. Judge correctness, completeness, and test \
         coverage, then end your reply with a line `DECISION: APPROVE`, \
         `DECISION: REJECT`, `DECISION: DISPUTE`, or `DECISION: SKIP`.\n\n\
         Task: {}\nPrior rejections: {}\n",
        task.title, task.rejection_count
    )
}

pub(super) fn reviewer_orchestrator_prompt(
    task: &Task,
    review: &InvocationResult,
    git: &GitState,
) -> String {
    let context = json!({
        "task": { "id": task.id, "title": task.title, "rejection_count": task.rejection_count },
        "reviewer_output": truncated(&review.stdout),
        "git_state": {
            "head_sha": git.head_sha,
            "changed_files": git.changed_files,
            "additions": git.additions,
            "deletions": git.deletions,
            "diff_summary": git.diff_summary,
        },
    });

    format!(
        "You are the orchestrator. Turn the reviewer's output into a decision. \
         Reply with exactly one JSON object of the shape:\n\
         {{\"decision\": \"approve|reject|dispute|skip|unclear\", \
         \"reasoning\": \"...\", \"notes\": \"...\", \
         \"next_status\": \"completed|in_progress|disputed|skipped|review\", \
         \"metadata\": {{\"rejection_count\": {}, \"confidence\": \
         \"high|medium|low\", \"push_to_remote\": true, \
         \"repeated_issue\": false}}, \"follow_up_tasks\": []}}\n\n\
         Context:\n{context}\n",
        task.rejection_count
    )
}

pub(super) fn multi_review_merge_prompt(
    task: &Task,
    targets: &[RoleTarget],
    results: &[InvocationResult],
    git: &GitState,
) -> String {
    let reviews: Vec<serde_json::Value> = targets
        .iter()
        .zip(results)
        .map(|(target, result)| {
            json!({
                "reviewer": format!("{}/{}", target.provider, target.model),
                "success": result.success,
                "output": truncated(&result.stdout),
            })
        })
        .collect();

    let context = json!({
        "task": { "id": task.id, "title": task.title, "rejection_count": task.rejection_count },
        "reviews": reviews,
        "git_state": { "head_sha": git.head_sha, "diff_summary": git.diff_summary },
    });

    format!(
        "You are the orchestrator consolidating several reviewers with mixed \
         opinions into one decision. Weigh each review on its merits. Reply \
         with exactly one JSON object of the reviewer-decision shape \
         (decision/reasoning/notes/next_status/metadata/follow_up_tasks).\n\n\
         Context:\n{context}\n"
    )
}

pub(super) fn coordinator_prompt(
    task: &Task,
    rejections: &[String],
    siblings: &[(String, String)],
    latest_submission: Option<&str>,
    diff_summary: &str,
    previous_guidance: Option<&str>,
) -> String {
    let context = json!({
        "task": { "id": task.id, "title": task.title, "rejection_count": task.rejection_count },
        "rejections": rejections,
        "section_tasks": siblings
            .iter()
            .map(|(title, status)| json!({ "title": title, "status": status }))
            .collect::<Vec<_>>(),
        "latest_submission": latest_submission,
        "diff_summary": diff_summary,
        "previous_guidance": previous_guidance,
    });

    format!(
        "You are the coordinator. This task keeps bouncing between coder and \
         reviewer. Diagnose why and give the coder concrete guidance to break \
         the loop. Start your reply with a single line `DECISION: <verdict>` \
         (e.g. CONTINUE, SIMPLIFY, SPLIT), then the guidance.\n\n\
         Context:\n{context}\n"
    )
}

/// Split a coordinator reply into (decision, guidance).
pub(super) fn split_coordinator_reply(raw: &str) -> (String, String) {
    let trimmed = raw.trim();
    for (i, line) in trimmed.lines().enumerate() {
        if let Some(rest) = line.trim().strip_prefix("DECISION:") {
            let guidance: String = trimmed
                .lines()
                .skip(i + 1)
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string();
            return (rest.trim().to_string(), guidance);
        }
    }
    ("CONTINUE".to_string(), trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_reply_with_decision_line() {
        let raw = "DECISION: SIMPLIFY\nDrop the caching layer and\nland the simple version first.";
        let (decision, guidance) = split_coordinator_reply(raw);
        assert_eq!(decision, "SIMPLIFY");
        assert!(guidance.starts_with("Drop the caching layer"));
    }

    #[test]
    fn split_reply_without_decision_defaults_to_continue() {
        let raw = "Just keep iterating on the error handling.";
        let (decision, guidance) = split_coordinator_reply(raw);
        assert_eq!(decision, "CONTINUE");
        assert_eq!(guidance, raw);
    }

    #[test]
    fn truncated_respects_char_boundaries() {
        let s = "é".repeat(MAX_EMBEDDED_OUTPUT + 10);
        let t = truncated(&s);
        assert!(t.chars().count() <= MAX_EMBEDDED_OUTPUT);
    }
}
