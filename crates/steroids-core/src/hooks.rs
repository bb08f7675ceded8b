//! Hook event contract.
//!
//! The core emits lifecycle events; delivery (webhooks, shell commands)
//! is an external concern. Sinks must not block the caller -- emission is
//! fire-and-forget.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

/// The project an event belongs to.
#[derive(Debug, Clone)]
pub struct ProjectRef {
    pub name: String,
    pub path: String,
}

/// Events emitted by the scheduler and phase driver.
#[derive(Debug, Clone)]
pub enum HookEvent {
    TaskCreated {
        task_id: Uuid,
        title: String,
    },
    TaskCompleted {
        task_id: Uuid,
        title: String,
    },
    SectionCompleted {
        section_id: Uuid,
        name: String,
    },
    HealthChanged {
        score: i64,
        previous_score: i64,
        status: String,
    },
    HealthCritical {
        score: i64,
        previous_score: i64,
        status: String,
    },
    DisputeCreated {
        dispute_id: Uuid,
        task_id: Uuid,
        kind: String,
        status: String,
    },
    DisputeResolved {
        dispute_id: Uuid,
        task_id: Uuid,
        kind: String,
        status: String,
    },
    CreditExhausted {
        provider: String,
        model: String,
        role: String,
        message: String,
    },
    CreditResolved {
        provider: String,
        model: String,
        role: String,
        message: String,
    },
    ProjectCompleted,
}

impl HookEvent {
    /// Dotted event name as delivered to hook consumers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task.created",
            Self::TaskCompleted { .. } => "task.completed",
            Self::SectionCompleted { .. } => "section.completed",
            Self::HealthChanged { .. } => "health.changed",
            Self::HealthCritical { .. } => "health.critical",
            Self::DisputeCreated { .. } => "dispute.created",
            Self::DisputeResolved { .. } => "dispute.resolved",
            Self::CreditExhausted { .. } => "credit.exhausted",
            Self::CreditResolved { .. } => "credit.resolved",
            Self::ProjectCompleted => "project.completed",
        }
    }

    /// Build the wire payload: the common envelope plus the
    /// event-specific fields.
    pub fn payload(&self, project: &ProjectRef, timestamp: DateTime<Utc>) -> Value {
        let mut payload = json!({
            "event": self.name(),
            "timestamp": timestamp.to_rfc3339(),
            "project": { "name": project.name, "path": project.path },
        });

        let extra = match self {
            Self::TaskCreated { task_id, title } | Self::TaskCompleted { task_id, title } => {
                json!({ "task": { "id": task_id, "title": title } })
            }
            Self::SectionCompleted { section_id, name } => {
                json!({ "section": { "id": section_id, "name": name } })
            }
            Self::HealthChanged {
                score,
                previous_score,
                status,
            }
            | Self::HealthCritical {
                score,
                previous_score,
                status,
            } => {
                json!({ "health": { "score": score, "previousScore": previous_score, "status": status } })
            }
            Self::DisputeCreated {
                dispute_id,
                task_id,
                kind,
                status,
            }
            | Self::DisputeResolved {
                dispute_id,
                task_id,
                kind,
                status,
            } => {
                json!({ "dispute": { "id": dispute_id, "taskId": task_id, "type": kind, "status": status } })
            }
            Self::CreditExhausted {
                provider,
                model,
                role,
                message,
            }
            | Self::CreditResolved {
                provider,
                model,
                role,
                message,
            } => {
                json!({ "credit": { "provider": provider, "model": model, "role": role, "message": message } })
            }
            Self::ProjectCompleted => json!({}),
        };

        if let (Some(obj), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        payload
    }
}

/// Fire-and-forget event delivery seam.
pub trait HookSink: Send + Sync {
    fn emit(&self, project: &ProjectRef, event: HookEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl HookSink for NullSink {
    fn emit(&self, _project: &ProjectRef, _event: HookEvent) {}
}

/// Sink that logs the payload; the default when no transport is wired up.
#[derive(Debug, Default)]
pub struct LogSink;

impl HookSink for LogSink {
    fn emit(&self, project: &ProjectRef, event: HookEvent) {
        let payload = event.payload(project, Utc::now());
        info!(event = event.name(), payload = %payload, "hook event");
    }
}
