// ============================================================================
// Entity descriptors
// ============================================================================
//
// Explicit registration DSL. A descriptor lists everything the dictionary
// needs to bind a type: identifier, attributes, relationships, permissions,
// lifecycle hooks and audit templates.
//
// ============================================================================

use std::sync::Arc;

use super::lifecycle::{HookTarget, LifecycleHook, Operation, TransactionPhase};
use super::relationship::Cardinality;
use crate::core::{DataType, Result, Value};
use crate::flow::audit::AuditDescriptor;
use crate::security::{PermissionAnnotation, PermissionKind};

/// Serialization hook for identifier values.
pub trait IdSerde: Send + Sync {
    fn serialize(&self, value: &Value) -> Option<String>;
    fn deserialize(&self, text: &str) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct IdDescriptor {
    pub name: String,
    pub data_type: DataType,
    pub generated: bool,
}

#[derive(Debug, Clone)]
pub struct AttributeDescriptor {
    pub name: String,
    pub data_type: DataType,
    pub computed: bool,
}

#[derive(Debug, Clone)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub mapped_by: Option<String>,
    pub cascade_delete: bool,
    pub computed: bool,
}

impl RelationshipDescriptor {
    pub fn new(name: &str, target: &str, cardinality: Cardinality) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            cardinality,
            mapped_by: None,
            cascade_delete: false,
            computed: false,
        }
    }

    pub fn one_to_one(name: &str, target: &str) -> Self {
        Self::new(name, target, Cardinality::OneToOne)
    }

    pub fn one_to_many(name: &str, target: &str) -> Self {
        Self::new(name, target, Cardinality::OneToMany)
    }

    pub fn many_to_one(name: &str, target: &str) -> Self {
        Self::new(name, target, Cardinality::ManyToOne)
    }

    pub fn many_to_many(name: &str, target: &str) -> Self {
        Self::new(name, target, Cardinality::ManyToMany)
    }

    /// Names the peer field that owns this association.
    pub fn mapped_by(mut self, field: &str) -> Self {
        self.mapped_by = Some(field.to_string());
        self
    }

    pub fn cascade_delete(mut self) -> Self {
        self.cascade_delete = true;
        self
    }

    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }
}

#[derive(Clone)]
pub(crate) struct HookDescriptor {
    pub operation: Operation,
    pub phase: TransactionPhase,
    pub target: HookTarget,
    pub hook: Arc<dyn LifecycleHook>,
}

#[derive(Clone)]
pub struct EntityDescriptor {
    pub(crate) type_name: String,
    pub(crate) supertype: Option<String>,
    pub(crate) ids: Vec<IdDescriptor>,
    pub(crate) attributes: Vec<AttributeDescriptor>,
    pub(crate) relationships: Vec<RelationshipDescriptor>,
    pub(crate) permissions: Vec<(PermissionKind, PermissionAnnotation)>,
    pub(crate) field_permissions: Vec<(String, PermissionKind, PermissionAnnotation)>,
    pub(crate) hooks: Vec<HookDescriptor>,
    pub(crate) audits: Vec<AuditDescriptor>,
    pub(crate) non_transferable: bool,
    pub(crate) paginate: bool,
    pub(crate) id_serde: Option<Arc<dyn IdSerde>>,
}

impl EntityDescriptor {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            supertype: None,
            ids: Vec::new(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            permissions: Vec::new(),
            field_permissions: Vec::new(),
            hooks: Vec::new(),
            audits: Vec::new(),
            non_transferable: false,
            paginate: true,
            id_serde: None,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn supertype(mut self, supertype: &str) -> Self {
        self.supertype = Some(supertype.to_string());
        self
    }

    pub fn id(mut self, name: &str, data_type: DataType) -> Self {
        self.ids.push(IdDescriptor {
            name: name.to_string(),
            data_type,
            generated: false,
        });
        self
    }

    /// Marks the most recently declared identifier as backend-generated.
    pub fn generated_id(mut self) -> Self {
        if let Some(id) = self.ids.last_mut() {
            id.generated = true;
        }
        self
    }

    pub fn attribute(mut self, name: &str, data_type: DataType) -> Self {
        self.attributes.push(AttributeDescriptor {
            name: name.to_string(),
            data_type,
            computed: false,
        });
        self
    }

    pub fn complex_attribute(self, name: &str, complex_type: &str) -> Self {
        self.attribute(name, DataType::Complex(complex_type.to_string()))
    }

    pub fn computed_attribute(mut self, name: &str, data_type: DataType) -> Self {
        self.attributes.push(AttributeDescriptor {
            name: name.to_string(),
            data_type,
            computed: true,
        });
        self
    }

    pub fn relationship(mut self, relationship: RelationshipDescriptor) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn one_to_one(self, name: &str, target: &str) -> Self {
        self.relationship(RelationshipDescriptor::one_to_one(name, target))
    }

    pub fn one_to_many(self, name: &str, target: &str) -> Self {
        self.relationship(RelationshipDescriptor::one_to_many(name, target))
    }

    pub fn many_to_one(self, name: &str, target: &str) -> Self {
        self.relationship(RelationshipDescriptor::many_to_one(name, target))
    }

    pub fn many_to_many(self, name: &str, target: &str) -> Self {
        self.relationship(RelationshipDescriptor::many_to_many(name, target))
    }

    pub fn permission(mut self, kind: PermissionKind, annotation: PermissionAnnotation) -> Self {
        self.permissions.push((kind, annotation));
        self
    }

    pub fn field_permission(
        mut self,
        field: &str,
        kind: PermissionKind,
        annotation: PermissionAnnotation,
    ) -> Self {
        self.field_permissions.push((field.to_string(), kind, annotation));
        self
    }

    pub fn hook(
        mut self,
        operation: Operation,
        phase: TransactionPhase,
        target: HookTarget,
        hook: impl LifecycleHook + 'static,
    ) -> Self {
        self.hooks.push(HookDescriptor {
            operation,
            phase,
            target,
            hook: Arc::new(hook),
        });
        self
    }

    pub fn on(self, operation: Operation, phase: TransactionPhase, hook: impl LifecycleHook + 'static) -> Self {
        self.hook(operation, phase, HookTarget::Class, hook)
    }

    pub fn on_field(
        self,
        operation: Operation,
        phase: TransactionPhase,
        field: &str,
        hook: impl LifecycleHook + 'static,
    ) -> Self {
        self.hook(operation, phase, HookTarget::Field(field.to_string()), hook)
    }

    pub fn audit(mut self, audit: AuditDescriptor) -> Self {
        self.audits.push(audit);
        self
    }

    /// Existing instances may not be attached to another resource's relationship.
    pub fn non_transferable(mut self) -> Self {
        self.non_transferable = true;
        self
    }

    pub fn paginate(mut self, allowed: bool) -> Self {
        self.paginate = allowed;
        self
    }

    pub fn id_serde(mut self, serde: impl IdSerde + 'static) -> Self {
        self.id_serde = Some(Arc::new(serde));
        self
    }

    pub(crate) fn relationship_targets(&self) -> impl Iterator<Item = &str> {
        self.relationships.iter().map(|r| r.target.as_str())
    }
}

impl std::fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("type_name", &self.type_name)
            .field("supertype", &self.supertype)
            .field("ids", &self.ids)
            .field("attributes", &self.attributes)
            .field("relationships", &self.relationships)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
