//! Phase driver: one coder phase and one reviewer phase per iteration.
//!
//! Both phases follow the same discipline: refresh the lease fences,
//! invoke the actor, classify provider failures, hand the raw output to
//! an orchestrator invocation, parse the reply, then execute the decision
//! with its audit row written atomically with the status change. Ordinary
//! actor failures never surface as errors; the only error a phase returns
//! is a lost lease. Credit exhaustion is a typed value the containing
//! loop must branch on.

mod prompts;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use steroids_db::models::{ActorType, InvocationRole, Task, TaskStatus};
use steroids_db::queries::{audit, backoffs, invocations, sections, tasks};

use crate::config::{AiSection, PhaseConfig, RoleTarget};
use crate::git::GitWorkspace;
use crate::hooks::{HookEvent, HookSink, ProjectRef};
use crate::lease::{LeaseError, TaskLease, WorkstreamLease};
use crate::logs::ActivityLog;
use crate::parser::{
    self, CoderAction, CoderDecision, Confidence, FALLBACK_PREFIX, ParseOutcome, ReviewerDecision,
    ReviewerMetadata, ReviewerVerdict,
};
use crate::provider::{FailureClass, InvocationResult, InvokeOptions, Provider, ProviderRegistry};
use crate::selector::NextAction;

/// Consecutive orchestrator parse fallbacks tolerated before escalation.
const MAX_PARSE_FALLBACKS: i64 = 3;

/// Typed credit-exhaustion value surfaced to the containing loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditExhaustion {
    pub provider: String,
    pub model: String,
    pub role: InvocationRole,
    pub message: String,
}

fn confidence_str(confidence: Confidence) -> &'static str {
    match confidence {
        Confidence::High => "high",
        Confidence::Medium => "medium",
        Confidence::Low => "low",
    }
}

/// Audit-note format shared by every orchestrator decision row.
fn decision_note(verb: &str, reasoning: &str, confidence: Confidence) -> String {
    format!("[{verb}] {reasoning} (confidence: {})", confidence_str(confidence))
}

/// Everything one phase needs, built once per runner iteration.
pub struct PhaseDriver {
    pub project: SqlitePool,
    pub global: SqlitePool,
    pub providers: Arc<ProviderRegistry>,
    pub config: PhaseConfig,
    pub ai: AiSection,
    pub runner_id: Uuid,
    pub workstream: WorkstreamLease,
    pub git: GitWorkspace,
    pub hooks: Arc<dyn HookSink>,
    pub project_ref: ProjectRef,
}

impl PhaseDriver {
    /// Refresh the workstream fence and the task lock. A failed fence
    /// aborts the phase.
    async fn refresh_fences(&self, task_id: Uuid) -> Result<(), LeaseError> {
        self.workstream.refresh(&self.global).await?;
        let lock = TaskLease {
            task_id,
            runner_id: self.runner_id,
        };
        lock.refresh(&self.project).await
    }

    fn provider_for(&self, target: &RoleTarget) -> Option<Arc<dyn Provider>> {
        self.providers.get(&target.provider)
    }

    /// Run one actor invocation end to end: record the invocation row,
    /// invoke, drain the activity stream into the invocation log, record
    /// completion. An active provider cooldown suppresses the invocation
    /// entirely.
    async fn invoke_role(
        &self,
        task: &Task,
        role: InvocationRole,
        target: &RoleTarget,
        prompt: &str,
        resume_session_id: Option<&str>,
    ) -> Result<InvocationResult> {
        if let Some(backoff) =
            backoffs::get_active(&self.global, &target.provider, Utc::now()).await?
        {
            info!(
                provider = %target.provider,
                until = %backoff.until,
                reason = %backoff.reason,
                "provider cooling down, skipping invocation"
            );
            return Ok(InvocationResult::spawn_failure(format!(
                "provider {} cooling down until {} ({})",
                target.provider, backoff.until, backoff.reason
            )));
        }

        let invocation_id = Uuid::new_v4();
        let rejection_number =
            matches!(role, InvocationRole::Coder).then_some(task.rejection_count);
        invocations::start_invocation(
            &self.project,
            invocation_id,
            task.id,
            role,
            &target.provider,
            &target.model,
            rejection_number,
            Utc::now(),
        )
        .await?;

        let result = match self.provider_for(target) {
            Some(provider) => {
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
                let mut opts = InvokeOptions::new(
                    &target.model,
                    self.git.root(),
                    Duration::from_secs(self.config.invocation_timeout_secs),
                )
                .with_activity(tx);
                opts.resume_session_id = resume_session_id;

                let result = provider.invoke(prompt, opts).await;

                // Drain buffered activity into the per-invocation log.
                match ActivityLog::create(self.git.root(), invocation_id) {
                    Ok(mut log) => {
                        while let Ok(event) = rx.try_recv() {
                            let line = serde_json::json!({
                                "at": Utc::now().to_rfc3339(),
                                "event": format!("{event:?}"),
                            });
                            if log.append(&line).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to open invocation activity log");
                    }
                }

                result
            }
            None => InvocationResult::spawn_failure(format!(
                "provider '{}' is not registered",
                target.provider
            )),
        };

        invocations::complete_invocation(
            &self.project,
            invocation_id,
            result.exit_code,
            result.duration_ms,
            result.success,
            result.timed_out,
            result.session_id.as_deref(),
            Utc::now(),
        )
        .await?;

        Ok(result)
    }

    /// Map a classified failure onto the phase outcome. Credit exhaustion
    /// short-circuits; rate limits record a provider cooldown.
    async fn handle_failure_class(
        &self,
        class: &FailureClass,
        target: &RoleTarget,
        role: InvocationRole,
    ) -> Result<Option<CreditExhaustion>> {
        match class {
            FailureClass::CreditExhaustion { message } => {
                backoffs::upsert(
                    &self.global,
                    &target.provider,
                    "credit_exhaustion",
                    Utc::now() + chrono::Duration::hours(1),
                    Utc::now(),
                )
                .await?;
                Ok(Some(CreditExhaustion {
                    provider: target.provider.clone(),
                    model: target.model.clone(),
                    role,
                    message: message.clone(),
                }))
            }
            FailureClass::RateLimit {
                message,
                retry_after_ms,
            } => {
                let cooldown = retry_after_ms
                    .map(|ms| chrono::Duration::milliseconds(ms as i64))
                    .unwrap_or_else(|| chrono::Duration::minutes(5));
                backoffs::upsert(
                    &self.global,
                    &target.provider,
                    "rate_limit",
                    Utc::now() + cooldown,
                    Utc::now(),
                )
                .await?;
                warn!(provider = %target.provider, message = %message, "rate limited, backing off");
                Ok(None)
            }
            FailureClass::AuthError { message }
            | FailureClass::ModelNotFound { message }
            | FailureClass::Other { message } => {
                warn!(provider = %target.provider, role = %role, message = %message, "actor failure");
                Ok(None)
            }
        }
    }

    /// Write an audit row that records a decision without a status
    /// change (retry, unclear, fallback annotations).
    async fn audit_in_place(&self, task: &Task, note: &str) -> Result<()> {
        audit::insert_entry(
            &self.project,
            &audit::NewAuditEntry {
                task_id: task.id,
                from_status: Some(task.status),
                to_status: task.status,
                actor: "orchestrator",
                actor_type: ActorType::Orchestrator,
                model: Some(&self.ai.orchestrator.model),
                notes: Some(note),
                commit_sha: None,
            },
            Utc::now(),
        )
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Coordinator gate
    // -------------------------------------------------------------------

    /// Whether the coordinator was already consulted at this rejection
    /// threshold (marker recorded in its audit entry).
    async fn coordinator_already_ran(&self, task: &Task) -> Result<bool> {
        let marker = format!("[rejections={}]", task.rejection_count);
        let entries = audit::latest_for_task(&self.project, task.id, 50).await?;
        Ok(entries
            .iter()
            .filter(|e| e.actor_type == ActorType::Coordinator)
            .any(|e| e.notes.as_deref().is_some_and(|n| n.contains(&marker))))
    }

    /// Consult the coordinator at configured rejection thresholds,
    /// caching its verdict on the task. Failures are non-fatal; the phase
    /// continues without guidance.
    async fn coordinator_gate(&self, task: &Task) -> Result<Option<String>> {
        let threshold_hit = self
            .config
            .coordinator_thresholds
            .contains(&(task.rejection_count.max(0) as u32));

        if !threshold_hit || self.coordinator_already_ran(task).await? {
            return Ok(task.coordinator_guidance.clone());
        }

        let target = self
            .ai
            .coordinator
            .clone()
            .unwrap_or_else(|| self.ai.orchestrator.clone());

        let rejections = audit::rejection_notes(&self.project, task.id).await?;
        let siblings = match task.section_id {
            Some(section_id) => {
                sections::section_status_projection(&self.project, section_id).await?
            }
            None => Vec::new(),
        };
        let submission = audit::latest_submission_notes(&self.project, task.id).await?;
        let diff = self.git.diff_summary().unwrap_or_default();

        let prompt = prompts::coordinator_prompt(
            task,
            &rejections,
            &siblings,
            submission.as_deref(),
            &diff,
            task.coordinator_guidance.as_deref(),
        );

        let result = self
            .invoke_role(task, InvocationRole::Coordinator, &target, &prompt, None)
            .await?;

        if !result.success {
            warn!(task_id = %task.id, "coordinator invocation failed, continuing without guidance");
            return Ok(task.coordinator_guidance.clone());
        }

        let (decision, guidance) = prompts::split_coordinator_reply(&result.stdout);
        tasks::set_coordinator_cache(&self.project, task.id, &decision, Some(&guidance), Utc::now())
            .await?;

        audit::insert_entry(
            &self.project,
            &audit::NewAuditEntry {
                task_id: task.id,
                from_status: Some(task.status),
                to_status: task.status,
                actor: "coordinator",
                actor_type: ActorType::Coordinator,
                model: Some(&target.model),
                notes: Some(&format!("[rejections={}] {decision}", task.rejection_count)),
                commit_sha: None,
            },
            Utc::now(),
        )
        .await?;

        Ok(Some(guidance))
    }

    // -------------------------------------------------------------------
    // Fallback bookkeeping
    // -------------------------------------------------------------------

    /// Consecutive trailing orchestrator audit entries carrying the
    /// FALLBACK sentinel.
    async fn consecutive_fallbacks(&self, task_id: Uuid) -> Result<i64> {
        let entries =
            audit::latest_orchestrator_entries(&self.project, task_id, MAX_PARSE_FALLBACKS).await?;
        let mut streak = 0;
        for entry in &entries {
            let is_fallback = entry
                .notes
                .as_deref()
                .is_some_and(|n| n.contains(FALLBACK_PREFIX));
            if is_fallback {
                streak += 1;
            } else {
                break;
            }
        }
        Ok(streak)
    }

    // -------------------------------------------------------------------
    // Coder phase
    // -------------------------------------------------------------------

    /// Run the coder phase for a task in `in_progress`.
    pub async fn run_coder_phase(
        &self,
        task: &Task,
        action: NextAction,
    ) -> Result<Option<CreditExhaustion>, LeaseError> {
        self.refresh_fences(task.id).await?;
        self.coder_phase_inner(task, action)
            .await
            .map_err(LeaseError::Other)
    }

    async fn coder_phase_inner(
        &self,
        task: &Task,
        action: NextAction,
    ) -> Result<Option<CreditExhaustion>> {
        // Coordinator gate before the coder runs.
        let guidance = self.coordinator_gate(task).await?;

        let coder_target = self.ai.coder.clone();
        let prompt = prompts::coder_prompt(task, action, guidance.as_deref());
        // A resumed task continues its previous provider session when one
        // was recorded.
        let resume_session = match action {
            NextAction::Resume => {
                invocations::latest_session_for_role(&self.project, task.id, InvocationRole::Coder)
                    .await?
            }
            NextAction::Start => None,
        };
        let result = self
            .invoke_role(
                task,
                InvocationRole::Coder,
                &coder_target,
                &prompt,
                resume_session.as_deref(),
            )
            .await?;

        if result.timed_out {
            info!(task_id = %task.id, "coder timed out; will resume next iteration");
            return Ok(None);
        }

        if let Some(provider) = self.provider_for(&coder_target) {
            if let Some(class) = provider.classify_result(&result) {
                if let Some(exhaustion) = self
                    .handle_failure_class(&class, &coder_target, InvocationRole::Coder)
                    .await?
                {
                    // The orchestrator is intentionally not invoked.
                    return Ok(Some(exhaustion));
                }
            }
        }
        if !result.success {
            // Transient actor failure: no status change, next iteration
            // retries.
            info!(task_id = %task.id, exit_code = ?result.exit_code, "coder failed, will retry");
            return Ok(None);
        }

        // Orchestrate: turn the coder's raw output into a decision.
        let git_state = self.git.snapshot();
        let orchestrator_prompt = prompts::coder_orchestrator_prompt(task, &result, &git_state);
        let orchestrator = self.ai.orchestrator.clone();
        let orch_result = self
            .invoke_role(task, InvocationRole::Orchestrator, &orchestrator, &orchestrator_prompt, None)
            .await?;

        let outcome = if orch_result.success {
            parser::parse_coder_reply(&orch_result.stdout)
        } else {
            // Synthesise a retry decision so parsing bookkeeping still
            // runs.
            ParseOutcome::Fallback(CoderDecision {
                action: CoderAction::Retry,
                reasoning: format!("{FALLBACK_PREFIX} Orchestrator failed"),
                commits: Vec::new(),
                commit_message: None,
                next_status: TaskStatus::InProgress,
                metadata: parser::CoderMetadata {
                    files_changed: 0,
                    confidence: Confidence::Low,
                    exit_clean: false,
                    has_commits: false,
                },
            })
        };

        let mut decision = outcome.decision().clone();
        if outcome.is_fallback() {
            let streak = self.consecutive_fallbacks(task.id).await? + 1;
            decision
                .reasoning
                .push_str(&format!(" (parse_retry {streak}/{MAX_PARSE_FALLBACKS})"));

            if streak >= MAX_PARSE_FALLBACKS {
                // Record the final fallback, then stop the retry loop.
                self.audit_in_place(
                    task,
                    &decision_note(
                        decision.action.as_str(),
                        &decision.reasoning,
                        decision.metadata.confidence,
                    ),
                )
                .await?;
                crate::state::transition_task(
                    &self.project,
                    task.id,
                    task.status,
                    TaskStatus::Failed,
                    &crate::state::TransitionMeta {
                        actor: "orchestrator",
                        actor_type: Some(ActorType::Orchestrator),
                        model: Some(&self.ai.orchestrator.model),
                        notes: Some("escalating to failed to stop retry loop"),
                        ..Default::default()
                    },
                )
                .await?;
                return Ok(None);
            }
        }

        self.execute_coder_decision(task, &decision).await?;
        Ok(None)
    }

    async fn execute_coder_decision(&self, task: &Task, decision: &CoderDecision) -> Result<()> {
        let note = decision_note(
            decision.action.as_str(),
            &decision.reasoning,
            decision.metadata.confidence,
        );

        match decision.action {
            CoderAction::Submit => {
                crate::state::transition_task(
                    &self.project,
                    task.id,
                    TaskStatus::InProgress,
                    TaskStatus::Review,
                    &crate::state::TransitionMeta {
                        actor: "orchestrator",
                        actor_type: Some(ActorType::Orchestrator),
                        model: Some(&self.ai.orchestrator.model),
                        notes: Some(&note),
                        ..Default::default()
                    },
                )
                .await?;
            }
            CoderAction::StageCommitSubmit => {
                self.refresh_fences(task.id).await.map_err(anyhow::Error::from)?;
                let message = decision.commit_message.as_deref().unwrap_or(&task.title);
                let committed = self.git.stage_all().and_then(|_| self.git.commit(message));
                match committed {
                    Ok(_) => {
                        let sha = self.git.head_sha().ok().flatten();
                        crate::state::transition_task(
                            &self.project,
                            task.id,
                            TaskStatus::InProgress,
                            TaskStatus::Review,
                            &crate::state::TransitionMeta {
                                actor: "orchestrator",
                                actor_type: Some(ActorType::Orchestrator),
                                model: Some(&self.ai.orchestrator.model),
                                notes: Some(&note),
                                commit_sha: sha.as_deref(),
                            },
                        )
                        .await?;
                    }
                    Err(e) => {
                        // Leave the task in_progress; next iteration
                        // retries.
                        warn!(task_id = %task.id, error = %e, "commit failed, will retry");
                        self.audit_in_place(task, &format!("{note} -- commit failed: {e}"))
                            .await?;
                    }
                }
            }
            CoderAction::Retry => {
                // Status stays in_progress; the decision is still audited.
                self.audit_in_place(task, &note).await?;
            }
            CoderAction::Error => {
                crate::state::transition_task(
                    &self.project,
                    task.id,
                    TaskStatus::InProgress,
                    TaskStatus::Failed,
                    &crate::state::TransitionMeta {
                        actor: "orchestrator",
                        actor_type: Some(ActorType::Orchestrator),
                        model: Some(&self.ai.orchestrator.model),
                        notes: Some(&note),
                        ..Default::default()
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Reviewer phase
    // -------------------------------------------------------------------

    /// Run the reviewer phase for a task in `review`.
    pub async fn run_reviewer_phase(
        &self,
        task: &Task,
    ) -> Result<Option<CreditExhaustion>, LeaseError> {
        self.refresh_fences(task.id).await?;
        self.reviewer_phase_inner(task).await.map_err(LeaseError::Other)
    }

    async fn reviewer_phase_inner(&self, task: &Task) -> Result<Option<CreditExhaustion>> {
        let reviewer_targets: Vec<RoleTarget> = if self.ai.reviewers.is_empty() {
            vec![self.ai.reviewer.clone()]
        } else {
            self.ai.reviewers.clone()
        };
        let multi_review = reviewer_targets.len() > 1;

        let prompt = prompts::reviewer_prompt(task);

        // Reviews run concurrently in multi-review mode; a single
        // reviewer is just the degenerate case.
        let mut results = Vec::with_capacity(reviewer_targets.len());
        {
            let futures = reviewer_targets.iter().map(|target| {
                self.invoke_role(task, InvocationRole::Reviewer, target, &prompt, None)
            });
            for result in futures::future::join_all(futures).await {
                results.push(result?);
            }
        }

        // Credit exhaustion short-circuits on the first match.
        for (target, result) in reviewer_targets.iter().zip(&results) {
            if let Some(provider) = self.provider_for(target) {
                if let Some(class) = provider.classify_result(result) {
                    if let Some(exhaustion) = self
                        .handle_failure_class(&class, target, InvocationRole::Reviewer)
                        .await?
                    {
                        return Ok(Some(exhaustion));
                    }
                }
            }
        }

        let any_failed = results.iter().any(|r| !r.success);
        if any_failed && (!multi_review || self.config.strict_multi_review) {
            info!(task_id = %task.id, "reviewer failed, retrying next iteration");
            return Ok(None);
        }

        let git_state = self.git.snapshot();

        let outcome = if multi_review {
            self.resolve_multi_review(task, &reviewer_targets, &results, &git_state)
                .await?
        } else {
            self.resolve_single_review(task, &results[0], &git_state).await?
        };

        let mut decision = outcome.decision().clone();
        if outcome.is_fallback() {
            let streak = self.consecutive_fallbacks(task.id).await? + 1;
            decision
                .reasoning
                .push_str(&format!(" (parse_retry {streak}/{MAX_PARSE_FALLBACKS})"));

            if streak >= MAX_PARSE_FALLBACKS {
                self.audit_in_place(
                    task,
                    &decision_note(
                        decision.decision.as_str(),
                        &decision.reasoning,
                        decision.metadata.confidence,
                    ),
                )
                .await?;
                crate::state::transition_task(
                    &self.project,
                    task.id,
                    TaskStatus::Review,
                    TaskStatus::Disputed,
                    &crate::state::TransitionMeta {
                        actor: "orchestrator",
                        actor_type: Some(ActorType::Orchestrator),
                        model: Some(&self.ai.orchestrator.model),
                        notes: Some("escalating to disputed to stop retry loop"),
                        ..Default::default()
                    },
                )
                .await?;
                self.hooks.emit(
                    &self.project_ref,
                    HookEvent::DisputeCreated {
                        dispute_id: Uuid::new_v4(),
                        task_id: task.id,
                        kind: "parse_escalation".to_string(),
                        status: "open".to_string(),
                    },
                );
                return Ok(None);
            }
        }

        self.execute_reviewer_decision(task, &decision, &git_state.head_sha)
            .await?;
        Ok(None)
    }

    /// Single-reviewer path: one orchestrator invocation over the
    /// reviewer's raw output.
    async fn resolve_single_review(
        &self,
        task: &Task,
        review: &InvocationResult,
        git_state: &crate::git::GitState,
    ) -> Result<ParseOutcome<ReviewerDecision>> {
        let orchestrator_prompt = prompts::reviewer_orchestrator_prompt(task, review, git_state);
        let orchestrator = self.ai.orchestrator.clone();
        let orch_result = self
            .invoke_role(task, InvocationRole::Orchestrator, &orchestrator, &orchestrator_prompt, None)
            .await?;

        Ok(if orch_result.success {
            parser::parse_reviewer_reply(&orch_result.stdout)
        } else {
            ParseOutcome::Fallback(self.unclear_decision(task, "Orchestrator failed"))
        })
    }

    fn unclear_decision(&self, task: &Task, why: &str) -> ReviewerDecision {
        ReviewerDecision {
            decision: ReviewerVerdict::Unclear,
            reasoning: format!("{FALLBACK_PREFIX} {why}"),
            notes: None,
            next_status: TaskStatus::Review,
            metadata: ReviewerMetadata {
                rejection_count: task.rejection_count.max(0) as u64,
                confidence: Confidence::Low,
                push_to_remote: false,
                repeated_issue: None,
            },
            follow_up_tasks: Vec::new(),
        }
    }

    /// Multi-reviewer path: unanimous verdicts synthesise a decision from
    /// the primary reviewer; any disagreement goes to the dedicated
    /// multi-reviewer orchestrator.
    async fn resolve_multi_review(
        &self,
        task: &Task,
        targets: &[RoleTarget],
        results: &[InvocationResult],
        git_state: &crate::git::GitState,
    ) -> Result<ParseOutcome<ReviewerDecision>> {
        let parsed: Vec<ReviewerDecision> = results
            .iter()
            .filter(|r| r.success)
            .map(|r| parser::parse_reviewer_reply(&r.stdout).into_decision())
            .collect();

        if parsed.is_empty() {
            return Ok(ParseOutcome::Fallback(
                self.unclear_decision(task, "no reviewer produced output"),
            ));
        }

        let first = parsed[0].decision;
        let unanimous = parsed.iter().all(|d| d.decision == first);

        if unanimous {
            let primary = &parsed[0];
            return Ok(ParseOutcome::Structured(ReviewerDecision {
                decision: first,
                reasoning: format!("unanimous {} from {} reviewers", first.as_str(), parsed.len()),
                notes: primary.notes.clone(),
                next_status: first.next_status(),
                metadata: ReviewerMetadata {
                    rejection_count: task.rejection_count.max(0) as u64,
                    confidence: Confidence::High,
                    push_to_remote: primary.metadata.push_to_remote,
                    repeated_issue: primary.metadata.repeated_issue,
                },
                follow_up_tasks: primary.follow_up_tasks.clone(),
            }));
        }

        // Mixed opinions need a merge.
        let merge_prompt = prompts::multi_review_merge_prompt(task, targets, results, git_state);
        let orchestrator = self.ai.orchestrator.clone();
        let orch_result = self
            .invoke_role(task, InvocationRole::Orchestrator, &orchestrator, &merge_prompt, None)
            .await?;

        Ok(if orch_result.success {
            parser::parse_reviewer_reply(&orch_result.stdout)
        } else {
            ParseOutcome::Fallback(
                self.unclear_decision(task, "multi-review merge orchestrator failed"),
            )
        })
    }

    /// Create follow-up tasks proposed by an approving reviewer, honoring
    /// the depth policy.
    async fn create_follow_ups(&self, task: &Task, decision: &ReviewerDecision) -> Result<()> {
        if decision.follow_up_tasks.is_empty() {
            return Ok(());
        }

        let depth = tasks::get_follow_up_depth(&self.project, task.id).await?;
        if depth >= self.config.follow_up_max_depth {
            info!(
                task_id = %task.id,
                depth,
                max_depth = self.config.follow_up_max_depth,
                "follow-up depth limit reached, skipping creation"
            );
            return Ok(());
        }

        let child_depth = depth + 1;
        for follow_up in &decision.follow_up_tasks {
            let created =
                crate::state::create_follow_up_task(&self.project, task, &follow_up.title).await?;
            // Depth-1 children may auto-implement; deeper ones wait for a
            // human promotion.
            if child_depth == 1 && self.config.auto_implement_depth1 {
                tasks::set_promoted(&self.project, created.id, Utc::now()).await?;
            }
            self.hooks.emit(
                &self.project_ref,
                HookEvent::TaskCreated {
                    task_id: created.id,
                    title: created.title.clone(),
                },
            );
        }
        Ok(())
    }

    async fn execute_reviewer_decision(
        &self,
        task: &Task,
        decision: &ReviewerDecision,
        head_sha: &Option<String>,
    ) -> Result<()> {
        let mut note = decision_note(
            decision.decision.as_str(),
            &decision.reasoning,
            decision.metadata.confidence,
        );
        if let Some(notes) = &decision.notes {
            note.push_str(" | ");
            note.push_str(notes);
        }

        match decision.decision {
            ReviewerVerdict::Approve => {
                // Follow-ups first so a later push failure cannot lose
                // them.
                self.create_follow_ups(task, decision).await?;

                crate::state::approve_task(
                    &self.project,
                    task.id,
                    "orchestrator",
                    Some(&note),
                    head_sha.as_deref(),
                )
                .await?;

                self.hooks.emit(
                    &self.project_ref,
                    HookEvent::TaskCompleted {
                        task_id: task.id,
                        title: task.title.clone(),
                    },
                );

                if let Some(section_id) = task.section_id {
                    if sections::section_is_complete(&self.project, section_id).await? {
                        if let Some(section) =
                            sections::get_section(&self.project, section_id).await?
                        {
                            self.hooks.emit(
                                &self.project_ref,
                                HookEvent::SectionCompleted {
                                    section_id,
                                    name: section.name,
                                },
                            );
                        }
                    }
                }

                self.refresh_fences(task.id).await.map_err(anyhow::Error::from)?;
                // Push failures are logged and non-fatal; the commit is
                // local and will be retried at the next completion.
                if let Err(e) = self.git.push(self.config.push_branch.as_deref()) {
                    warn!(task_id = %task.id, error = %e, "push failed (non-fatal)");
                }

                if tasks::count_active_tasks(&self.project).await? == 0 {
                    self.hooks.emit(&self.project_ref, HookEvent::ProjectCompleted);
                }
            }
            ReviewerVerdict::Reject => {
                crate::state::reject_task(&self.project, task.id, "orchestrator", Some(&note))
                    .await?;
            }
            ReviewerVerdict::Dispute => {
                crate::state::transition_task(
                    &self.project,
                    task.id,
                    TaskStatus::Review,
                    TaskStatus::Disputed,
                    &crate::state::TransitionMeta {
                        actor: "orchestrator",
                        actor_type: Some(ActorType::Orchestrator),
                        model: Some(&self.ai.orchestrator.model),
                        notes: Some(&note),
                        ..Default::default()
                    },
                )
                .await?;
                self.hooks.emit(
                    &self.project_ref,
                    HookEvent::DisputeCreated {
                        dispute_id: Uuid::new_v4(),
                        task_id: task.id,
                        kind: "review".to_string(),
                        status: "open".to_string(),
                    },
                );
                self.refresh_fences(task.id).await.map_err(anyhow::Error::from)?;
                if let Err(e) = self.git.push(self.config.push_branch.as_deref()) {
                    warn!(task_id = %task.id, error = %e, "push failed (non-fatal)");
                }
            }
            ReviewerVerdict::Skip => {
                crate::state::transition_task(
                    &self.project,
                    task.id,
                    TaskStatus::Review,
                    TaskStatus::Skipped,
                    &crate::state::TransitionMeta {
                        actor: "orchestrator",
                        actor_type: Some(ActorType::Orchestrator),
                        model: Some(&self.ai.orchestrator.model),
                        notes: Some(&note),
                        ..Default::default()
                    },
                )
                .await?;
            }
            ReviewerVerdict::Unclear => {
                // Status stays review; the decision is audited and the
                // loop retries.
                self.audit_in_place(task, &note).await?;
            }
        }
        Ok(())
    }
}
