use std::fmt;

use crate::core::Result;
use crate::request::{ChangeSpec, RequestScope};
use crate::resource::PersistentResource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "CREATE",
            Self::Read => "READ",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        };
        write!(f, "{}", name)
    }
}

/// Phases at which queued lifecycle events are replayed, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransactionPhase {
    PreSecurity,
    PreFlush,
    PreCommit,
    PostCommit,
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PreSecurity => "PRESECURITY",
            Self::PreFlush => "PREFLUSH",
            Self::PreCommit => "PRECOMMIT",
            Self::PostCommit => "POSTCOMMIT",
        };
        write!(f, "{}", name)
    }
}

/// What a hook is bound to inside its type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookTarget {
    /// Fires once for the class-level event (create/delete/read of the resource).
    Class,
    /// Fires for changes to one field.
    Field(String),
    /// Fires for every field-level event.
    AnyField,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HookKey {
    pub operation: Operation,
    pub phase: TransactionPhase,
    pub target: HookTarget,
}

pub trait LifecycleHook: Send + Sync {
    fn execute(
        &self,
        operation: Operation,
        phase: TransactionPhase,
        resource: &PersistentResource,
        scope: &RequestScope,
        change: Option<&ChangeSpec>,
    ) -> Result<()>;
}

impl<F> LifecycleHook for F
where
    F: Fn(&PersistentResource, &RequestScope, Option<&ChangeSpec>) -> Result<()> + Send + Sync,
{
    fn execute(
        &self,
        _operation: Operation,
        _phase: TransactionPhase,
        resource: &PersistentResource,
        scope: &RequestScope,
        change: Option<&ChangeSpec>,
    ) -> Result<()> {
        self(resource, scope, change)
    }
}
