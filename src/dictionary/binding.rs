// ============================================================================
// Entity bindings
// ============================================================================
//
// Immutable metadata of one bound type. Built once from a descriptor and the
// already-bound supertype, then shared through Arc for the process lifetime.
//
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::descriptor::{EntityDescriptor, IdDescriptor, IdSerde};
use super::lifecycle::{HookKey, HookTarget, LifecycleHook, Operation, TransactionPhase};
use super::relationship::RelationshipType;
use crate::core::{DataType, GateError, Result};
use crate::flow::audit::AuditDescriptor;
use crate::security::{CheckRegistry, PermissionSet};

#[derive(Debug, Clone)]
pub struct AttributeInfo {
    pub data_type: DataType,
    pub computed: bool,
}

#[derive(Debug, Clone)]
pub struct RelationshipInfo {
    pub target: String,
    pub relationship_type: RelationshipType,
    pub mapped_by: Option<String>,
    pub cascade_delete: bool,
}

#[derive(Clone, Default)]
pub struct EntityBinding {
    pub type_name: String,
    /// false for the lenient empty binding handed out for unknown types
    pub declared: bool,
    /// Nearest supertype first
    pub supertypes: Vec<String>,
    pub id: Option<IdDescriptor>,
    attributes: Vec<String>,
    attribute_info: HashMap<String, AttributeInfo>,
    relationships: Vec<String>,
    relationship_info: HashMap<String, RelationshipInfo>,
    pub permissions: PermissionSet,
    hooks: HashMap<HookKey, Vec<Arc<dyn LifecycleHook>>>,
    pub non_transferable: bool,
    pub paginate: bool,
    pub audits: Vec<AuditDescriptor>,
    pub id_serde: Option<Arc<dyn IdSerde>>,
}

impl EntityBinding {
    pub(crate) fn empty(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            paginate: true,
            ..Default::default()
        }
    }

    pub(crate) fn build(
        descriptor: &EntityDescriptor,
        parent: Option<&EntityBinding>,
        checks: &CheckRegistry,
    ) -> Result<Self> {
        let type_name = descriptor.type_name.clone();

        let mut binding = match parent {
            Some(parent) => {
                let mut inherited = parent.clone();
                inherited.supertypes.insert(0, parent.type_name.clone());
                inherited.audits.clear();
                inherited
            }
            None => EntityBinding::empty(&type_name),
        };
        binding.type_name = type_name.clone();
        binding.declared = true;

        // Identifier: exactly one across the whole chain
        match descriptor.ids.as_slice() {
            [] => {}
            [id] => {
                if let Some(existing) = &binding.id {
                    return Err(GateError::DuplicateMapping(format!(
                        "{} declares identifier '{}' but inherits '{}'",
                        type_name, id.name, existing.name
                    )));
                }
                binding.id = Some(id.clone());
            }
            ids => {
                let names: Vec<&str> = ids.iter().map(|i| i.name.as_str()).collect();
                return Err(GateError::DuplicateMapping(format!(
                    "{} declares multiple identifiers: {}",
                    type_name,
                    names.join(", ")
                )));
            }
        }
        let Some(id) = binding.id.clone() else {
            return Err(GateError::InvalidConfiguration(format!(
                "{} has no identifier",
                type_name
            )));
        };

        for attribute in &descriptor.attributes {
            if !binding.attribute_info.contains_key(&attribute.name) {
                binding.attributes.push(attribute.name.clone());
            }
            binding.attribute_info.insert(
                attribute.name.clone(),
                AttributeInfo {
                    data_type: attribute.data_type.clone(),
                    computed: attribute.computed,
                },
            );
        }

        for relationship in &descriptor.relationships {
            if !binding.relationship_info.contains_key(&relationship.name) {
                binding.relationships.push(relationship.name.clone());
            }
            let relationship_type = if relationship.computed {
                RelationshipType::Computed(relationship.cardinality)
            } else {
                RelationshipType::Persisted(relationship.cardinality)
            };
            binding.relationship_info.insert(
                relationship.name.clone(),
                RelationshipInfo {
                    target: relationship.target.clone(),
                    relationship_type,
                    mapped_by: relationship.mapped_by.clone(),
                    cascade_delete: relationship.cascade_delete,
                },
            );
        }

        binding.validate_fields(&id)?;

        // Permissions: own annotations shadow inherited ones
        for (kind, annotation) in &descriptor.permissions {
            let expression = annotation.compile(checks)?;
            binding.permissions.set_class(*kind, expression);
        }
        for (field, kind, annotation) in &descriptor.field_permissions {
            if !binding.is_field(field) {
                return Err(GateError::InvalidConfiguration(format!(
                    "permission on unknown field '{}' of {}",
                    field, type_name
                )));
            }
            let expression = annotation.compile(checks)?;
            binding.permissions.set_field(field, *kind, expression);
        }

        for hook in &descriptor.hooks {
            if let HookTarget::Field(field) = &hook.target {
                if !binding.is_field(field) {
                    return Err(GateError::InvalidConfiguration(format!(
                        "lifecycle hook on unknown field '{}' of {}",
                        field, type_name
                    )));
                }
            }
            binding
                .hooks
                .entry(HookKey {
                    operation: hook.operation,
                    phase: hook.phase,
                    target: hook.target.clone(),
                })
                .or_default()
                .push(Arc::clone(&hook.hook));
        }

        binding.non_transferable = descriptor.non_transferable
            || parent.is_some_and(|p| p.non_transferable);
        binding.paginate = descriptor.paginate;
        binding.audits = descriptor.audits.clone();
        if descriptor.id_serde.is_some() {
            binding.id_serde = descriptor.id_serde.clone();
        }

        Ok(binding)
    }

    fn validate_fields(&self, id: &IdDescriptor) -> Result<()> {
        let attributes: HashSet<&str> = self.attributes.iter().map(String::as_str).collect();
        if let Some(clash) = self.relationships.iter().find(|r| attributes.contains(r.as_str())) {
            return Err(GateError::DuplicateMapping(format!(
                "'{}' in {} is both an attribute and a relationship",
                clash, self.type_name
            )));
        }
        if attributes.contains(id.name.as_str()) || self.relationship_info.contains_key(&id.name) {
            return Err(GateError::DuplicateMapping(format!(
                "identifier '{}' of {} is also declared as a field",
                id.name, self.type_name
            )));
        }
        Ok(())
    }

    pub fn id_field(&self) -> Option<&str> {
        self.id.as_ref().map(|id| id.name.as_str())
    }

    pub fn id_type(&self) -> Option<&DataType> {
        self.id.as_ref().map(|id| &id.data_type)
    }

    pub fn is_id_generated(&self) -> bool {
        self.id.as_ref().is_some_and(|id| id.generated)
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn relationships(&self) -> &[String] {
        &self.relationships
    }

    pub fn attribute(&self, field: &str) -> Option<&AttributeInfo> {
        self.attribute_info.get(field)
    }

    pub fn relationship(&self, field: &str) -> Option<&RelationshipInfo> {
        self.relationship_info.get(field)
    }

    pub fn is_attribute(&self, field: &str) -> bool {
        self.attribute_info.contains_key(field)
    }

    pub fn is_relationship(&self, field: &str) -> bool {
        self.relationship_info.contains_key(field)
    }

    pub fn is_field(&self, field: &str) -> bool {
        self.is_attribute(field) || self.is_relationship(field)
    }

    pub fn relationship_type(&self, field: &str) -> RelationshipType {
        self.relationship_info
            .get(field)
            .map(|r| r.relationship_type)
            .unwrap_or(RelationshipType::None)
    }

    pub fn hooks(
        &self,
        operation: Operation,
        phase: TransactionPhase,
        target: &HookTarget,
    ) -> &[Arc<dyn LifecycleHook>] {
        let key = HookKey {
            operation,
            phase,
            target: target.clone(),
        };
        self.hooks.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    /// Is `type_name` this type or one of its supertypes?
    pub fn is_a(&self, type_name: &str) -> bool {
        self.type_name == type_name || self.supertypes.iter().any(|s| s == type_name)
    }
}

impl std::fmt::Debug for EntityBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityBinding")
            .field("type_name", &self.type_name)
            .field("declared", &self.declared)
            .field("supertypes", &self.supertypes)
            .field("id", &self.id)
            .field("attributes", &self.attributes)
            .field("relationships", &self.relationships)
            .field("hooks", &self.hook_count())
            .finish()
    }
}
