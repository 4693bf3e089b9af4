//! Entity metadata registry.
//!
//! Types are declared with an [`EntityDescriptor`] and bound into immutable
//! [`EntityBinding`]s. Bindings live in a copy-on-write map: readers clone the
//! current `Arc` and never block writers for longer than a pointer swap.

pub mod binding;
pub mod descriptor;
pub mod lifecycle;
pub mod relationship;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::debug;

pub use binding::{AttributeInfo, EntityBinding, RelationshipInfo};
pub use descriptor::{AttributeDescriptor, EntityDescriptor, IdDescriptor, IdSerde, RelationshipDescriptor};
pub use lifecycle::{HookKey, HookTarget, LifecycleHook, Operation, TransactionPhase};
pub use relationship::{Cardinality, RelationshipType};

use crate::core::{DataType, Entity, GateError, Result, Value};
use crate::security::CheckRegistry;

pub struct EntityDictionary {
    declared: RwLock<HashMap<String, Arc<EntityDescriptor>>>,
    bindings: RwLock<Arc<HashMap<String, Arc<EntityBinding>>>>,
    /// Runtime (proxy) type name -> bound type name
    aliases: RwLock<HashMap<String, String>>,
    checks: Arc<CheckRegistry>,
}

impl EntityDictionary {
    /// Dictionary resolving check names through the process-wide registry.
    pub fn new() -> Self {
        Self::with_checks(CheckRegistry::global())
    }

    pub fn with_checks(checks: Arc<CheckRegistry>) -> Self {
        Self {
            declared: RwLock::new(HashMap::new()),
            bindings: RwLock::new(Arc::new(HashMap::new())),
            aliases: RwLock::new(HashMap::new()),
            checks,
        }
    }

    pub fn checks(&self) -> &Arc<CheckRegistry> {
        &self.checks
    }

    // ========================================================================
    // Declaration and binding
    // ========================================================================

    /// Registers a descriptor without binding it. Re-declaring a known type
    /// keeps the first descriptor.
    pub fn declare(&self, descriptor: EntityDescriptor) -> Result<()> {
        let mut declared = self.declared.write()?;
        if declared.contains_key(descriptor.type_name()) {
            debug!(type_name = descriptor.type_name(), "type already declared, ignoring");
            return Ok(());
        }
        declared.insert(descriptor.type_name().to_string(), Arc::new(descriptor));
        Ok(())
    }

    pub fn bind_descriptor(&self, descriptor: EntityDescriptor) -> Result<Arc<EntityBinding>> {
        let type_name = descriptor.type_name().to_string();
        self.declare(descriptor)?;
        self.bind(&type_name)
    }

    /// Binds a declared type, its supertypes and every declared relationship
    /// target. Binding an already bound type returns the existing binding.
    pub fn bind(&self, type_name: &str) -> Result<Arc<EntityBinding>> {
        let binding = self.bind_one(type_name, &mut Vec::new())?;

        // Transitive binding of relationship targets. Undeclared targets stay
        // unbound and resolve to the empty binding on lenient lookups.
        let mut pending: Vec<String> = vec![type_name.to_string()];
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let Some(descriptor) = self.descriptor(&current)? else {
                continue;
            };
            for target in descriptor.relationship_targets() {
                if self.descriptor(target)?.is_some() {
                    self.bind_one(target, &mut Vec::new())?;
                    pending.push(target.to_string());
                }
            }
        }

        Ok(binding)
    }

    fn bind_one(&self, type_name: &str, chain: &mut Vec<String>) -> Result<Arc<EntityBinding>> {
        if let Some(existing) = self.bindings.read()?.get(type_name) {
            return Ok(Arc::clone(existing));
        }

        let descriptor = self
            .descriptor(type_name)?
            .ok_or_else(|| GateError::UnboundType(type_name.to_string()))?;

        if chain.iter().any(|t| t == type_name) {
            chain.push(type_name.to_string());
            return Err(GateError::InvalidConfiguration(format!(
                "supertype cycle: {}",
                chain.join(" -> ")
            )));
        }
        chain.push(type_name.to_string());

        let parent = match &descriptor.supertype {
            Some(supertype) => Some(self.bind_one(supertype, chain)?),
            None => None,
        };

        let built = Arc::new(EntityBinding::build(&descriptor, parent.as_deref(), &self.checks)?);

        // Copy-on-write swap. A concurrent binder may have won the race.
        let mut guard = self.bindings.write()?;
        if let Some(existing) = guard.get(type_name) {
            return Ok(Arc::clone(existing));
        }
        let mut next = (**guard).clone();
        next.insert(type_name.to_string(), Arc::clone(&built));
        *guard = Arc::new(next);

        debug!(
            type_name,
            attributes = built.attributes().len(),
            relationships = built.relationships().len(),
            hooks = built.hook_count(),
            "bound entity type"
        );
        Ok(built)
    }

    fn descriptor(&self, type_name: &str) -> Result<Option<Arc<EntityDescriptor>>> {
        Ok(self.declared.read()?.get(type_name).cloned())
    }

    fn snapshot(&self) -> Result<Arc<HashMap<String, Arc<EntityBinding>>>> {
        Ok(Arc::clone(&*self.bindings.read()?))
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Lenient lookup: unknown types yield an empty, undeclared binding.
    pub fn binding(&self, type_name: &str) -> Result<Arc<EntityBinding>> {
        match self.lookup_bound_type(type_name)? {
            Some(bound) => self.strict_binding(&bound),
            None => Ok(Arc::new(EntityBinding::empty(type_name))),
        }
    }

    pub fn strict_binding(&self, type_name: &str) -> Result<Arc<EntityBinding>> {
        if let Some(binding) = self.snapshot()?.get(type_name) {
            return Ok(Arc::clone(binding));
        }
        match self.lookup_bound_type(type_name)? {
            Some(bound) if bound != type_name => self.strict_binding(&bound),
            _ => Err(GateError::UnboundType(type_name.to_string())),
        }
    }

    pub fn is_bound(&self, type_name: &str) -> Result<bool> {
        Ok(self.snapshot()?.contains_key(type_name))
    }

    /// Marks a backend proxy type as an alias of a bound type.
    pub fn register_alias(&self, runtime_type: &str, bound_type: &str) -> Result<()> {
        if !self.is_bound(bound_type)? {
            return Err(GateError::UnboundType(bound_type.to_string()));
        }
        self.aliases
            .write()?
            .insert(runtime_type.to_string(), bound_type.to_string());
        Ok(())
    }

    /// Resolves a declared runtime type to the type it is bound under.
    /// Declared but not yet bound types are bound on demand.
    pub fn lookup_bound_type(&self, type_name: &str) -> Result<Option<String>> {
        if self.is_bound(type_name)? {
            return Ok(Some(type_name.to_string()));
        }
        if let Some(bound) = self.aliases.read()?.get(type_name) {
            return Ok(Some(bound.clone()));
        }

        let mut current = self.descriptor(type_name)?;
        let mut visited = HashSet::new();
        while let Some(descriptor) = current {
            if !visited.insert(descriptor.type_name().to_string()) {
                break;
            }
            if self.is_bound(descriptor.type_name())? {
                return Ok(Some(descriptor.type_name().to_string()));
            }
            // Lazy binding-on-demand; a misconfigured subtype falls back to
            // its nearest bindable supertype
            if let Ok(binding) = self.bind(descriptor.type_name()) {
                return Ok(Some(binding.type_name.clone()));
            }
            current = match &descriptor.supertype {
                Some(parent) => self.descriptor(parent)?,
                None => None,
            };
        }
        Ok(None)
    }

    pub fn bound_type_of(&self, entity: &Entity) -> Result<String> {
        Ok(self
            .lookup_bound_type(entity.type_name())?
            .unwrap_or_else(|| entity.type_name().to_string()))
    }

    pub fn binding_of(&self, entity: &Entity) -> Result<Arc<EntityBinding>> {
        self.binding(entity.type_name())
    }

    pub fn supertypes(&self, type_name: &str) -> Result<Vec<String>> {
        Ok(self.binding(type_name)?.supertypes.clone())
    }

    pub fn subtypes(&self, type_name: &str) -> Result<Vec<String>> {
        let snapshot = self.snapshot()?;
        let mut subtypes: Vec<String> = snapshot
            .values()
            .filter(|b| b.supertypes.iter().any(|s| s == type_name))
            .map(|b| b.type_name.clone())
            .collect();
        subtypes.sort();
        Ok(subtypes)
    }

    pub fn bound_types(&self) -> Result<Vec<String>> {
        let mut types: Vec<String> = self.snapshot()?.keys().cloned().collect();
        types.sort();
        Ok(types)
    }

    // ========================================================================
    // Field metadata
    // ========================================================================

    /// Unknown types and fields report `RelationshipType::None`.
    pub fn relationship_type(&self, type_name: &str, field: &str) -> Result<RelationshipType> {
        Ok(self.binding(type_name)?.relationship_type(field))
    }

    /// Mutation-path variant: unknown fields are an error.
    pub fn relationship_type_strict(&self, type_name: &str, field: &str) -> Result<RelationshipType> {
        let binding = self.strict_binding(type_name)?;
        match binding.relationship_type(field) {
            RelationshipType::None => Err(GateError::invalid_attribute(type_name, field)),
            relationship => Ok(relationship),
        }
    }

    pub fn relationship_target(&self, type_name: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .binding(type_name)?
            .relationship(field)
            .map(|r| r.target.clone()))
    }

    /// Peer field of a bidirectional relationship, or "" if unidirectional.
    pub fn relationship_inverse(&self, type_name: &str, field: &str) -> Result<String> {
        let binding = self.binding(type_name)?;
        let Some(info) = binding.relationship(field) else {
            return Ok(String::new());
        };
        if let Some(mapped_by) = &info.mapped_by {
            return Ok(mapped_by.clone());
        }

        let target = self.binding(&info.target)?;
        for name in target.relationships() {
            let Some(peer) = target.relationship(name) else {
                continue;
            };
            if peer.mapped_by.as_deref() == Some(field) && binding.is_a(&peer.target) {
                return Ok(name.clone());
            }
        }
        Ok(String::new())
    }

    pub fn attribute_type(&self, type_name: &str, field: &str) -> Result<Option<DataType>> {
        let binding = self.binding(type_name)?;
        if binding.id_field() == Some(field) {
            return Ok(binding.id_type().cloned());
        }
        Ok(binding.attribute(field).map(|a| a.data_type.clone()))
    }

    pub fn is_attribute(&self, type_name: &str, field: &str) -> Result<bool> {
        Ok(self.binding(type_name)?.is_attribute(field))
    }

    pub fn is_relation(&self, type_name: &str, field: &str) -> Result<bool> {
        Ok(self.binding(type_name)?.is_relationship(field))
    }

    pub fn cascades_delete(&self, type_name: &str, field: &str) -> Result<bool> {
        Ok(self
            .binding(type_name)?
            .relationship(field)
            .is_some_and(|r| r.cascade_delete))
    }

    pub fn is_id_generated(&self, type_name: &str) -> Result<bool> {
        Ok(self.binding(type_name)?.is_id_generated())
    }

    pub fn is_non_transferable(&self, type_name: &str) -> Result<bool> {
        Ok(self.binding(type_name)?.non_transferable)
    }

    pub fn hooks(
        &self,
        type_name: &str,
        operation: Operation,
        phase: TransactionPhase,
        target: &HookTarget,
    ) -> Result<Vec<Arc<dyn LifecycleHook>>> {
        Ok(self.binding(type_name)?.hooks(operation, phase, target).to_vec())
    }

    // ========================================================================
    // Identifiers
    // ========================================================================

    /// Stable string form of the entity's identifier, `None` while unset.
    pub fn get_id(&self, entity: &Entity) -> Result<Option<String>> {
        let binding = self.binding_of(entity)?;
        let Some(id_field) = binding.id_field() else {
            return Ok(None);
        };
        let value = entity.attribute(id_field)?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(match &binding.id_serde {
            Some(serde) => serde.serialize(&value),
            None => value.id_string(),
        })
    }

    /// Converts a textual id into the declared identifier type.
    pub fn coerce_id(&self, type_name: &str, id: &str) -> Result<Value> {
        let binding = self.strict_binding(type_name)?;
        if let Some(serde) = &binding.id_serde {
            return serde.deserialize(id);
        }
        match binding.id_type() {
            Some(data_type) => data_type
                .coerce(Value::Text(id.to_string()))
                .map_err(|_| GateError::invalid_id(type_name, id)),
            None => Ok(Value::Text(id.to_string())),
        }
    }

    pub fn set_id(&self, entity: &Entity, id: &str) -> Result<()> {
        let binding = self.binding_of(entity)?;
        let id_field = binding.id_field().ok_or_else(|| {
            GateError::InternalServerError(format!("{} has no identifier", entity.type_name()))
        })?;
        let value = self.coerce_id(&binding.type_name, id)?;
        entity.set_attribute(id_field, value)
    }
}

impl Default for EntityDictionary {
    fn default() -> Self {
        Self::new()
    }
}
