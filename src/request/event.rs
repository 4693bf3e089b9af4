use std::fmt;

use crate::core::FieldValue;
use crate::dictionary::Operation;
use crate::resource::PersistentResource;

/// Before/after state of one field mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSpec {
    pub resource: PersistentResource,
    pub field: String,
    pub original: FieldValue,
    pub modified: FieldValue,
}

impl ChangeSpec {
    pub fn new(resource: &PersistentResource, field: &str, original: FieldValue, modified: FieldValue) -> Self {
        Self {
            resource: resource.clone(),
            field: field.to_string(),
            original,
            modified,
        }
    }
}

impl fmt::Display for ChangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {} -> {}", self.resource, self.field, self.original, self.modified)
    }
}

/// Queued lifecycle occurrence. Equality covers every component, so the
/// same transition published twice is delivered once.
#[derive(Debug, Clone, PartialEq)]
pub struct CrudEvent {
    pub operation: Operation,
    pub resource: PersistentResource,
    pub field: Option<String>,
    pub change: Option<ChangeSpec>,
}

impl CrudEvent {
    pub fn new(
        operation: Operation,
        resource: &PersistentResource,
        field: Option<&str>,
        change: Option<ChangeSpec>,
    ) -> Self {
        Self {
            operation,
            resource: resource.clone(),
            field: field.map(str::to_string),
            change,
        }
    }
}

impl fmt::Display for CrudEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{} {}.{}", self.operation, self.resource, field),
            None => write!(f, "{} {}", self.operation, self.resource),
        }
    }
}
