// ============================================================================
// Request scope
// ============================================================================
//
// Everything one request owns: the transaction, the principal, the permission
// executor, the identity cache, the new/dirty/deleted resource sets and the
// lifecycle event queue. Resources point back here through a Weak handle.
//
// ============================================================================

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};
use uuid::Uuid;

use super::cache::{inheritance_key, ObjectEntityCache};
use super::event::{ChangeSpec, CrudEvent};
use crate::core::{Entity, GateError, Result};
use crate::datastore::DataStoreTransaction;
use crate::dictionary::{EntityDictionary, HookTarget, Operation, TransactionPhase};
use crate::flow::audit::{AuditAction, AuditLogger, LogMessage, NoopAuditLogger};
use crate::flow::GateSettings;
use crate::resource::PersistentResource;
use crate::security::{PermissionExecutor, User};

#[derive(Default)]
struct ScopeState {
    new_resources: Vec<PersistentResource>,
    dirty_resources: Vec<PersistentResource>,
    deleted_resources: Vec<PersistentResource>,
    events: Vec<CrudEvent>,
    released: bool,
}

pub struct RequestScope {
    request_id: Uuid,
    transaction: Arc<dyn DataStoreTransaction>,
    dictionary: Arc<EntityDictionary>,
    permission_executor: PermissionExecutor,
    audit_logger: Arc<dyn AuditLogger>,
    settings: GateSettings,
    cache: ObjectEntityCache,
    read_only: bool,
    state: Mutex<ScopeState>,
    this: Weak<RequestScope>,
}

pub struct RequestScopeBuilder {
    transaction: Arc<dyn DataStoreTransaction>,
    dictionary: Arc<EntityDictionary>,
    request_id: Uuid,
    user: User,
    settings: GateSettings,
    audit_logger: Arc<dyn AuditLogger>,
    read_only: bool,
}

impl RequestScopeBuilder {
    pub fn request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn user(mut self, user: User) -> Self {
        self.user = user;
        self
    }

    pub fn settings(mut self, settings: GateSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn build(self) -> Arc<RequestScope> {
        let executor = PermissionExecutor::new(
            Arc::clone(&self.dictionary),
            self.user,
            self.settings.verbose_errors,
        );
        let cache = ObjectEntityCache::new(self.settings.entity_cache_capacity);

        Arc::new_cyclic(|this| RequestScope {
            request_id: self.request_id,
            transaction: self.transaction,
            dictionary: self.dictionary,
            permission_executor: executor,
            audit_logger: self.audit_logger,
            settings: self.settings,
            cache,
            read_only: self.read_only,
            state: Mutex::new(ScopeState::default()),
            this: this.clone(),
        })
    }
}

impl RequestScope {
    pub fn builder(
        transaction: Arc<dyn DataStoreTransaction>,
        dictionary: Arc<EntityDictionary>,
    ) -> RequestScopeBuilder {
        RequestScopeBuilder {
            transaction,
            dictionary,
            request_id: Uuid::new_v4(),
            user: User::anonymous(),
            settings: GateSettings::default(),
            audit_logger: Arc::new(NoopAuditLogger),
            read_only: false,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn transaction(&self) -> &Arc<dyn DataStoreTransaction> {
        &self.transaction
    }

    pub fn dictionary(&self) -> &Arc<EntityDictionary> {
        &self.dictionary
    }

    pub fn permission_executor(&self) -> &PermissionExecutor {
        &self.permission_executor
    }

    pub fn user(&self) -> &User {
        self.permission_executor.user()
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn weak(&self) -> Weak<RequestScope> {
        self.this.clone()
    }

    // ========================================================================
    // Resource sets
    // ========================================================================

    pub fn new_resources(&self) -> Result<Vec<PersistentResource>> {
        Ok(self.state.lock()?.new_resources.clone())
    }

    pub fn dirty_resources(&self) -> Result<Vec<PersistentResource>> {
        Ok(self.state.lock()?.dirty_resources.clone())
    }

    pub fn deleted_resources(&self) -> Result<Vec<PersistentResource>> {
        Ok(self.state.lock()?.deleted_resources.clone())
    }

    pub fn is_new(&self, resource: &PersistentResource) -> Result<bool> {
        Ok(self.state.lock()?.new_resources.contains(resource))
    }

    pub fn is_deleted(&self, resource: &PersistentResource) -> Result<bool> {
        Ok(self.state.lock()?.deleted_resources.contains(resource))
    }

    pub(crate) fn add_new(&self, resource: &PersistentResource) -> Result<()> {
        insert_ordered(&mut self.state.lock()?.new_resources, resource);
        Ok(())
    }

    pub fn mark_dirty(&self, resource: &PersistentResource) -> Result<()> {
        insert_ordered(&mut self.state.lock()?.dirty_resources, resource);
        Ok(())
    }

    pub(crate) fn mark_deleted(&self, resource: &PersistentResource) -> Result<()> {
        insert_ordered(&mut self.state.lock()?.deleted_resources, resource);
        Ok(())
    }

    /// Issues creates for new resources, then saves for the remaining dirty
    /// ones. Resources created and deleted in the same request are skipped.
    pub async fn save_or_create_objects(&self) -> Result<()> {
        let (created, saved) = {
            let mut state = self.state.lock()?;
            let ScopeState {
                new_resources,
                dirty_resources,
                deleted_resources,
                ..
            } = &mut *state;
            dirty_resources.retain(|r| !new_resources.contains(r) && !deleted_resources.contains(r));
            new_resources.retain(|r| !deleted_resources.contains(r));
            (new_resources.clone(), dirty_resources.clone())
        };

        debug!(created = created.len(), saved = saved.len(), "saving request objects");
        for resource in &created {
            self.transaction.create_object(resource.entity()).await?;
        }
        for resource in &saved {
            self.transaction.save(resource.entity()).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Identity cache
    // ========================================================================

    /// Looks the id up under the bound type, then under every subtype.
    pub fn get_object_by_id(&self, type_name: &str, id: &str) -> Result<Option<Entity>> {
        let bound = self.bound_type(type_name)?;
        if let Some(entity) = self.cache.get(&bound, id)? {
            return Ok(Some(entity));
        }
        for subtype in self.dictionary.subtypes(&bound)? {
            if let Some(entity) = self.cache.get(&inheritance_key(&subtype, &bound), id)? {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    /// Registers an entity created in this request under its client uuid.
    pub fn set_uuid_for_object(&self, type_name: &str, uuid: &str, entity: &Entity) -> Result<()> {
        let bound = self.bound_type(type_name)?;
        self.cache.put_uuid(&bound, uuid, entity)?;
        for supertype in self.dictionary.supertypes(&bound)? {
            self.cache.put_uuid(&inheritance_key(&bound, &supertype), uuid, entity)?;
        }
        Ok(())
    }

    pub fn get_uuid_for(&self, entity: &Entity) -> Result<Option<String>> {
        self.cache.get_uuid(entity)
    }

    /// Registers a loaded entity under its persistent id.
    pub(crate) fn cache_loaded(&self, type_name: &str, id: &str, entity: &Entity) -> Result<()> {
        let bound = self.bound_type(type_name)?;
        self.cache.put(&bound, id, entity)?;
        for supertype in self.dictionary.supertypes(&bound)? {
            self.cache.put(&inheritance_key(&bound, &supertype), id, entity)?;
        }
        Ok(())
    }

    fn bound_type(&self, type_name: &str) -> Result<String> {
        Ok(self
            .dictionary
            .lookup_bound_type(type_name)?
            .unwrap_or_else(|| type_name.to_string()))
    }

    // ========================================================================
    // Lifecycle events
    // ========================================================================

    /// Queues the event once. Update and delete events also run their
    /// pre-security hooks right away.
    pub fn publish_lifecycle_event(
        &self,
        resource: &PersistentResource,
        field: Option<&str>,
        operation: Operation,
        change: Option<ChangeSpec>,
    ) -> Result<()> {
        let event = CrudEvent::new(operation, resource, field, change);
        {
            let mut state = self.state.lock()?;
            if state.released {
                return Err(GateError::InternalServerError(
                    "request scope already released".into(),
                ));
            }
            if state.events.contains(&event) {
                trace!(event = %event, "duplicate lifecycle event dropped");
                return Ok(());
            }
            state.events.push(event.clone());
        }

        if matches!(operation, Operation::Update | Operation::Delete) {
            self.dispatch(&event, TransactionPhase::PreSecurity)?;
        }
        Ok(())
    }

    pub fn run_queued_pre_security_triggers(&self) -> Result<()> {
        self.replay(TransactionPhase::PreSecurity, |op| op == Operation::Create)
    }

    pub fn run_queued_pre_flush_triggers(&self) -> Result<()> {
        self.replay(TransactionPhase::PreFlush, |_| true)
    }

    pub fn run_queued_pre_commit_triggers(&self) -> Result<()> {
        self.replay(TransactionPhase::PreCommit, |_| true)
    }

    pub fn run_queued_post_commit_triggers(&self) -> Result<()> {
        self.replay(TransactionPhase::PostCommit, |_| true)
    }

    pub fn queued_events(&self) -> Result<Vec<CrudEvent>> {
        Ok(self.state.lock()?.events.clone())
    }

    /// Replays by index so that events queued by a hook are delivered in
    /// the same phase.
    fn replay(&self, phase: TransactionPhase, include: impl Fn(Operation) -> bool) -> Result<()> {
        let mut index = 0;
        loop {
            let event = match self.state.lock()?.events.get(index) {
                Some(event) => event.clone(),
                None => break,
            };
            index += 1;
            if include(event.operation) {
                self.dispatch(&event, phase)?;
            }
        }
        trace!(phase = %phase, events = index, "replayed lifecycle events");
        Ok(())
    }

    fn dispatch(&self, event: &CrudEvent, phase: TransactionPhase) -> Result<()> {
        let binding = event.resource.binding()?;
        let targets = match &event.field {
            None => vec![HookTarget::Class],
            Some(field) => vec![HookTarget::Field(field.clone()), HookTarget::AnyField],
        };
        for target in &targets {
            for hook in binding.hooks(event.operation, phase, target) {
                hook.execute(event.operation, phase, &event.resource, self, event.change.as_ref())?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Audit
    // ========================================================================

    /// Logs every audit descriptor of the resource's type matching the action.
    pub(crate) fn audit(
        &self,
        action: AuditAction,
        resource: &PersistentResource,
        change: Option<&ChangeSpec>,
    ) -> Result<()> {
        if !self.settings.audit_enabled {
            return Ok(());
        }
        let binding = resource.binding()?;
        for descriptor in &binding.audits {
            let applies = match (&descriptor.field, change) {
                (None, _) => descriptor.action == action,
                (Some(field), Some(change)) => action == AuditAction::Update && &change.field == field,
                (Some(_), None) => false,
            };
            if applies {
                self.audit_logger.log(LogMessage::from_descriptor(
                    self.request_id,
                    descriptor,
                    resource,
                    change,
                    self.user().name(),
                ))?;
            }
        }
        Ok(())
    }

    /// Drops per-request state at request end.
    pub fn release(&self) -> Result<()> {
        {
            let mut state = self.state.lock()?;
            state.new_resources.clear();
            state.dirty_resources.clear();
            state.deleted_resources.clear();
            state.events.clear();
            state.released = true;
        }
        self.cache.clear()
    }

    pub fn is_released(&self) -> Result<bool> {
        Ok(self.state.lock()?.released)
    }
}

impl std::fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScope")
            .field("request_id", &self.request_id)
            .field("read_only", &self.read_only)
            .finish()
    }
}

fn insert_ordered(set: &mut Vec<PersistentResource>, resource: &PersistentResource) {
    if !set.contains(resource) {
        set.push(resource.clone());
    }
}
