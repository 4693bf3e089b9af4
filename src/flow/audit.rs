// ============================================================================
// Audit logging
// ============================================================================
//
// Messages are buffered per request and only emitted when the orchestrator
// commits. A failing audit commit never blocks the transaction.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::core::{FieldValue, Result};
use crate::request::ChangeSpec;
use crate::resource::PersistentResource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

/// Audit template attached to a type, or to one field of it.
///
/// Placeholders: `{type}`, `{id}`, `{field}`, `{old}`, `{new}`, `{user}`.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDescriptor {
    pub action: AuditAction,
    pub field: Option<String>,
    pub operation_code: i32,
    pub template: String,
}

impl AuditDescriptor {
    pub fn on(action: AuditAction, operation_code: i32, template: &str) -> Self {
        Self {
            action,
            field: None,
            operation_code,
            template: template.to_string(),
        }
    }

    /// Audits updates of one field.
    pub fn on_field(field: &str, operation_code: i32, template: &str) -> Self {
        Self {
            action: AuditAction::Update,
            field: Some(field.to_string()),
            operation_code,
            template: template.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    pub request_id: Uuid,
    pub operation_code: i32,
    pub message: String,
    pub user: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LogMessage {
    pub fn new(request_id: Uuid, operation_code: i32, message: impl Into<String>) -> Self {
        Self {
            request_id,
            operation_code,
            message: message.into(),
            user: None,
            timestamp: Utc::now(),
        }
    }

    /// Renders the descriptor's template against the resource's current state.
    pub fn from_descriptor(
        request_id: Uuid,
        descriptor: &AuditDescriptor,
        resource: &PersistentResource,
        change: Option<&ChangeSpec>,
        user: Option<&str>,
    ) -> Self {
        let field = change
            .map(|c| c.field.as_str())
            .or(descriptor.field.as_deref())
            .unwrap_or("");
        let render = |value: Option<&FieldValue>| value.map(|v| v.to_string()).unwrap_or_default();

        let message = descriptor
            .template
            .replace("{type}", resource.type_name())
            .replace("{id}", &resource.display_id())
            .replace("{field}", field)
            .replace("{old}", &render(change.map(|c| &c.original)))
            .replace("{new}", &render(change.map(|c| &c.modified)))
            .replace("{user}", user.unwrap_or("anonymous"));

        Self {
            request_id,
            operation_code: descriptor.operation_code,
            message,
            user: user.map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

pub trait AuditLogger: Send + Sync {
    fn log(&self, message: LogMessage) -> Result<()>;

    /// Emits the request's buffered messages.
    fn commit(&self, request_id: Uuid) -> Result<()>;

    /// Drops the request's buffered messages.
    fn clear(&self, request_id: Uuid) -> Result<()>;
}

/// Buffers per request and emits through `tracing` on commit.
#[derive(Default)]
pub struct TracingAuditLogger {
    pending: Mutex<HashMap<Uuid, Vec<LogMessage>>>,
}

impl TracingAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, request_id: Uuid) -> Result<usize> {
        Ok(self.pending.lock()?.get(&request_id).map(Vec::len).unwrap_or(0))
    }
}

impl AuditLogger for TracingAuditLogger {
    fn log(&self, message: LogMessage) -> Result<()> {
        self.pending
            .lock()?
            .entry(message.request_id)
            .or_default()
            .push(message);
        Ok(())
    }

    fn commit(&self, request_id: Uuid) -> Result<()> {
        let messages = self.pending.lock()?.remove(&request_id).unwrap_or_default();
        for message in messages {
            info!(
                target: "modelgate::audit",
                request_id = %message.request_id,
                code = message.operation_code,
                user = message.user.as_deref().unwrap_or("anonymous"),
                timestamp = %message.timestamp,
                "{}",
                message.message
            );
        }
        Ok(())
    }

    fn clear(&self, request_id: Uuid) -> Result<()> {
        self.pending.lock()?.remove(&request_id);
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopAuditLogger;

impl AuditLogger for NoopAuditLogger {
    fn log(&self, _: LogMessage) -> Result<()> {
        Ok(())
    }

    fn commit(&self, _: Uuid) -> Result<()> {
        Ok(())
    }

    fn clear(&self, _: Uuid) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_per_request() {
        let logger = TracingAuditLogger::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        logger.log(LogMessage::new(first, 1, "created")).unwrap();
        logger.log(LogMessage::new(first, 2, "updated")).unwrap();
        logger.log(LogMessage::new(second, 1, "created")).unwrap();

        assert_eq!(logger.pending(first).unwrap(), 2);
        logger.commit(first).unwrap();
        assert_eq!(logger.pending(first).unwrap(), 0);

        logger.clear(second).unwrap();
        assert_eq!(logger.pending(second).unwrap(), 0);
    }
}
