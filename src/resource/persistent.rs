// ============================================================================
// Persistent resource
// ============================================================================
//
// Wraps one entity for the duration of a request. Every read and mutation
// goes through here: permissions are checked, inverse relationships are kept
// in step, the resource is marked dirty and a lifecycle event is queued.
//
// ============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock, Weak};

use futures::StreamExt;
use tracing::{debug, trace};

use super::lineage::ResourceLineage;
use crate::core::{Entity, FieldValue, GateError, Result, Value};
use crate::datastore::FeatureSupport;
use crate::dictionary::{EntityBinding, EntityDictionary, Operation};
use crate::filter::evaluator::InMemoryFilterEvaluator;
use crate::filter::{FilterExpression, Operator, Path};
use crate::flow::audit::AuditAction;
use crate::request::{ChangeSpec, EntityProjection, RequestScope};
use crate::security::PermissionKind;

#[derive(Clone)]
pub struct PersistentResource {
    entity: Entity,
    type_name: String,
    uuid: Option<String>,
    lineage: ResourceLineage,
    dictionary: Arc<EntityDictionary>,
    scope: Weak<RequestScope>,
    hash: Arc<OnceLock<u64>>,
}

impl PersistentResource {
    pub fn new(entity: Entity, uuid: Option<String>, scope: &RequestScope) -> Result<Self> {
        let dictionary = Arc::clone(scope.dictionary());
        let type_name = dictionary.bound_type_of(&entity)?;
        Ok(Self {
            entity,
            type_name,
            uuid,
            lineage: ResourceLineage::new(),
            dictionary,
            scope: scope.weak(),
            hash: Arc::new(OnceLock::new()),
        })
    }

    pub fn with_lineage(mut self, lineage: ResourceLineage) -> Self {
        self.lineage = lineage;
        self
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Bound type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn lineage(&self) -> &ResourceLineage {
        &self.lineage
    }

    /// Persistent id, `None` until one is assigned.
    pub fn id(&self) -> Result<Option<String>> {
        self.dictionary.get_id(&self.entity)
    }

    /// Id, else uuid, else the instance id.
    pub fn display_id(&self) -> String {
        match self.id() {
            Ok(Some(id)) => id,
            _ => self
                .uuid
                .clone()
                .unwrap_or_else(|| self.entity.instance_id().to_string()),
        }
    }

    pub fn binding(&self) -> Result<Arc<EntityBinding>> {
        self.dictionary.binding(&self.type_name)
    }

    pub fn scope(&self) -> Result<Arc<RequestScope>> {
        self.scope
            .upgrade()
            .ok_or_else(|| GateError::InternalServerError("request scope is no longer alive".into()))
    }

    pub fn is_newly_created(&self) -> Result<bool> {
        self.scope()?.is_new(self)
    }

    fn child_lineage(&self, relationship: &str) -> ResourceLineage {
        self.lineage
            .extend(&self.type_name, &self.display_id(), Some(relationship))
    }

    fn wrap(&self, entity: Entity, scope: &RequestScope) -> Result<PersistentResource> {
        let uuid = scope.get_uuid_for(&entity)?;
        PersistentResource::new(entity, uuid, scope)
    }

    // ========================================================================
    // Creation and loading
    // ========================================================================

    /// Instantiates a new object of `type_name` in the request's transaction.
    /// Types without a generated id take the uuid as their id.
    pub async fn create_object(
        scope: &RequestScope,
        type_name: &str,
        parent: Option<&PersistentResource>,
        uuid: Option<&str>,
    ) -> Result<PersistentResource> {
        let dictionary = scope.dictionary();
        let binding = dictionary.strict_binding(type_name)?;
        let entity = scope.transaction().create_new_object(&binding.type_name).await?;

        let mut resource = PersistentResource::new(entity, uuid.map(str::to_string), scope)?;
        if let Some(parent) = parent {
            resource.lineage = parent.lineage.extend(&parent.type_name, &parent.display_id(), None);
        }

        if !binding.is_id_generated() {
            match uuid.filter(|u| !u.is_empty()) {
                Some(id) => dictionary.set_id(&resource.entity, id)?,
                None => {
                    return Err(GateError::BadRequest(format!(
                        "No id provided, cannot persist {}",
                        binding.type_name
                    )))
                }
            }
        }

        scope.add_new(&resource)?;
        scope
            .permission_executor()
            .check_permission(PermissionKind::Create, &resource, None)?;
        scope.audit(AuditAction::Create, &resource, None)?;
        scope.publish_lifecycle_event(&resource, None, Operation::Create, None)?;
        if let Some(uuid) = uuid {
            scope.set_uuid_for_object(&binding.type_name, uuid, &resource.entity)?;
        }

        for field in binding.relationships() {
            if binding.relationship_type(field).is_to_many() && resource.entity.get(field)?.is_none() {
                resource.entity.set(field, FieldValue::ToMany(Vec::new()))?;
            }
        }
        scope.mark_dirty(&resource)?;

        debug!(resource = %resource, "created object");
        Ok(resource)
    }

    /// Loads one object by id. The identity cache is consulted first, so two
    /// loads of the same id return the same instance.
    pub async fn load_record(
        projection: &EntityProjection,
        id: &str,
        scope: &RequestScope,
    ) -> Result<PersistentResource> {
        let dictionary = scope.dictionary();
        let binding = dictionary.strict_binding(&projection.type_name)?;
        let type_name = binding.type_name.clone();
        let executor = scope.permission_executor();
        let requested = projection.requested_fields();

        let entity = match scope.get_object_by_id(&type_name, id)? {
            Some(entity) => entity,
            None => {
                let coerced = dictionary.coerce_id(&type_name, id)?;
                let filter = FilterExpression::and_optional(
                    projection.filter.clone(),
                    executor.read_filter(&type_name, requested.as_deref())?,
                );

                let tx = scope.transaction();
                let loaded = tx
                    .load_object(projection, &coerced, filter.as_ref())
                    .await?
                    .ok_or_else(|| GateError::invalid_id(&type_name, id))?;

                if let Some(filter) = &filter {
                    if tx.supports_filtering(&type_name, filter) != FeatureSupport::Full
                        && !InMemoryFilterEvaluator::new(dictionary).matches(filter, &loaded)?
                    {
                        return Err(GateError::invalid_id(&type_name, id));
                    }
                }

                let canonical = dictionary.get_id(&loaded)?.unwrap_or_else(|| id.to_string());
                scope.cache_loaded(&type_name, &canonical, &loaded)?;
                loaded
            }
        };

        let uuid = scope.get_uuid_for(&entity)?;
        let resource = PersistentResource::new(entity, uuid, scope)?;
        if !resource.is_newly_created()? {
            executor.check_permission(PermissionKind::Read, &resource, requested.as_deref())?;
        }
        scope.publish_lifecycle_event(&resource, None, Operation::Read, None)?;
        Ok(resource)
    }

    /// Loads a collection. Filtering, sorting and pagination the transaction
    /// cannot push down are applied in memory. Unreadable elements are
    /// dropped. When `ids` is given, every id must resolve.
    pub async fn load_records(
        projection: &mut EntityProjection,
        ids: &[String],
        scope: &RequestScope,
    ) -> Result<Vec<PersistentResource>> {
        let dictionary = scope.dictionary();
        let binding = dictionary.strict_binding(&projection.type_name)?;
        let type_name = binding.type_name.clone();
        let executor = scope.permission_executor();
        let requested = projection.requested_fields();

        match executor.check_user_permission(PermissionKind::Read, &type_name, requested.as_deref()) {
            Ok(_) => {}
            Err(e) if e.is_skippable() => {
                trace!(type_name = %type_name, "collection not readable");
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                return Err(GateError::InvalidObjectIdentifier {
                    type_name,
                    ids: ids.to_vec(),
                });
            }
            Err(e) => return Err(e),
        }

        if let Some(pagination) = &projection.pagination {
            if !binding.paginate {
                return Err(GateError::BadRequest(format!(
                    "Pagination not supported for {}",
                    type_name
                )));
            }
            pagination.validate(scope.settings().max_page_size)?;
        }

        // Objects created in this request are found by uuid
        let mut entities = Vec::new();
        let mut persisted_ids = Vec::new();
        for id in ids {
            match scope.get_object_by_id(&type_name, id)? {
                Some(entity) if scope.get_uuid_for(&entity)?.as_deref() == Some(id.as_str()) => {
                    entities.push(entity)
                }
                _ => {
                    if let Ok(coerced) = dictionary.coerce_id(&type_name, id) {
                        persisted_ids.push(coerced);
                    }
                }
            }
        }

        let mut filter = projection.filter.clone();
        if !persisted_ids.is_empty() {
            if let Some(id_field) = binding.id_field() {
                filter = FilterExpression::and_optional(
                    filter,
                    Some(FilterExpression::predicate(
                        Path::field(&type_name, id_field),
                        Operator::In,
                        persisted_ids.clone(),
                    )),
                );
            }
        }
        let filter = FilterExpression::and_optional(
            filter,
            executor.read_filter(&type_name, requested.as_deref())?,
        );

        let tx = scope.transaction();
        let filter_support = filter
            .as_ref()
            .map(|f| tx.supports_filtering(&type_name, f))
            .unwrap_or(FeatureSupport::Full);
        let sort_pushed = projection
            .sorting
            .as_ref()
            .map_or(true, |s| s.is_default() || tx.supports_sorting(&type_name, s));
        let page_pushed = projection.pagination.is_some()
            && filter_support == FeatureSupport::Full
            && sort_pushed
            && tx.supports_pagination(&type_name, filter.as_ref());

        if ids.is_empty() || !persisted_ids.is_empty() {
            let mut backend_projection = projection.clone();
            backend_projection.filter = filter.clone();
            if !sort_pushed {
                backend_projection.sorting = None;
            }
            if !page_pushed {
                backend_projection.pagination = None;
            }

            let evaluator = InMemoryFilterEvaluator::new(dictionary);
            let mut stream = tx.load_objects(&backend_projection).await?;
            while let Some(next) = stream.next().await {
                let entity = next?;
                if filter_support != FeatureSupport::Full {
                    if let Some(filter) = &filter {
                        if !evaluator.matches(filter, &entity)? {
                            continue;
                        }
                    }
                }
                if !entities.contains(&entity) {
                    entities.push(entity);
                }
            }
        }

        if !sort_pushed {
            if let Some(sorting) = &projection.sorting {
                sorting.sort(&mut entities)?;
            }
        }

        let mut resources = Vec::with_capacity(entities.len());
        for entity in entities {
            let canonical = dictionary.get_id(&entity)?;
            let entity = match &canonical {
                Some(id) => match scope.get_object_by_id(&type_name, id)? {
                    Some(cached) => cached,
                    None => {
                        scope.cache_loaded(&type_name, id, &entity)?;
                        entity
                    }
                },
                None => entity,
            };
            let uuid = scope.get_uuid_for(&entity)?;
            let resource = PersistentResource::new(entity, uuid, scope)?;
            if !resource.is_newly_created()? {
                match executor.check_permission(PermissionKind::Read, &resource, requested.as_deref()) {
                    Ok(_) => {}
                    Err(e) if e.is_skippable() => {
                        trace!(resource = %resource, "dropping unreadable element");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            resources.push(resource);
        }

        if !ids.is_empty() {
            let missing = missing_ids(dictionary, &type_name, ids, &resources)?;
            if !missing.is_empty() {
                return Err(GateError::InvalidObjectIdentifier {
                    type_name,
                    ids: missing,
                });
            }
        }

        if !page_pushed {
            if let Some(pagination) = projection.pagination.as_mut() {
                if pagination.return_page_totals {
                    pagination.page_totals = Some(resources.len());
                }
                resources = pagination.apply(resources);
            }
        }
        Ok(resources)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get_attribute(&self, field: &str) -> Result<Value> {
        let binding = self.binding()?;
        if binding.id_field() == Some(field) {
            return self.entity.attribute(field);
        }
        if !binding.is_attribute(field) {
            return Err(GateError::invalid_attribute(&self.type_name, field));
        }

        let scope = self.scope()?;
        scope
            .permission_executor()
            .check_field_permission(PermissionKind::Read, self, field, None)?;
        scope.publish_lifecycle_event(self, Some(field), Operation::Read, None)?;
        scope.transaction().get_attribute(&self.entity, field)
    }

    /// Readable related resources. Elements failing read permission are
    /// dropped; a denied field is an error.
    pub async fn get_relation(&self, field: &str) -> Result<Vec<PersistentResource>> {
        let binding = self.binding()?;
        if !binding.is_relationship(field) {
            return Err(GateError::invalid_attribute(&self.type_name, field));
        }

        let scope = self.scope()?;
        let executor = scope.permission_executor();
        executor.check_field_permission(PermissionKind::Read, self, field, None)?;

        let lineage = self.child_lineage(field);
        let mut related = Vec::new();
        for entity in self.raw_relation(&scope, field).await? {
            let resource = self.wrap(entity, &scope)?.with_lineage(lineage.clone());
            if !resource.is_newly_created()? {
                match executor.check_permission(PermissionKind::Read, &resource, None) {
                    Ok(_) => {}
                    Err(e) if e.is_skippable() => continue,
                    Err(e) => return Err(e),
                }
            }
            related.push(resource);
        }

        scope.publish_lifecycle_event(self, Some(field), Operation::Read, None)?;
        Ok(related)
    }

    /// Related resources with the given ids (persistent ids or uuids).
    pub async fn get_relation_by_ids(&self, field: &str, ids: &[String]) -> Result<Vec<PersistentResource>> {
        let related = self.get_relation(field).await?;
        let target = self
            .dictionary
            .relationship_target(&self.type_name, field)?
            .unwrap_or_default();

        let missing = missing_ids(&self.dictionary, &target, ids, &related)?;
        if !missing.is_empty() {
            return Err(GateError::InvalidObjectIdentifier {
                type_name: target,
                ids: missing,
            });
        }

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut selected = Vec::new();
        for resource in related {
            let id = resource.id()?;
            let matches = id.as_deref().is_some_and(|id| wanted.contains(id))
                || resource.uuid().is_some_and(|uuid| wanted.contains(uuid))
                || coerced_match(&self.dictionary, &target, ids, id.as_deref());
            if matches {
                selected.push(resource);
            }
        }
        Ok(selected)
    }

    /// Readable attributes within the sparse fieldset.
    pub fn attributes(&self, projection: &EntityProjection) -> Result<BTreeMap<String, Value>> {
        let binding = self.binding()?;
        let scope = self.scope()?;
        let executor = scope.permission_executor();
        let tx = scope.transaction();

        let mut attributes = BTreeMap::new();
        for field in binding.attributes() {
            if !projection.includes_attribute(field) {
                continue;
            }
            match executor.check_field_permission(PermissionKind::Read, self, field, None) {
                Ok(_) => {
                    attributes.insert(field.clone(), tx.get_attribute(&self.entity, field)?);
                }
                Err(e) if e.is_skippable() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(attributes)
    }

    /// Ids (or uuids, before an id exists) of readable related resources
    /// within the sparse fieldset.
    pub async fn relationship_ids(&self, projection: &EntityProjection) -> Result<BTreeMap<String, Vec<String>>> {
        let binding = self.binding()?;
        let mut relationships = BTreeMap::new();
        for field in binding.relationships() {
            if !projection.includes_relationship(field) {
                continue;
            }
            match self.get_relation(field).await {
                Ok(related) => {
                    let ids = related.iter().map(PersistentResource::display_id).collect();
                    relationships.insert(field.clone(), ids);
                }
                Err(e) if e.is_skippable() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(relationships)
    }

    // ========================================================================
    // Attribute mutation
    // ========================================================================

    /// Returns false when the value does not change. Complex attributes are
    /// merged into a copy of the current value, which then replaces it.
    pub fn update_attribute(&self, field: &str, value: impl Into<Value>) -> Result<bool> {
        let binding = self.binding()?;
        let Some(info) = binding.attribute(field) else {
            return Err(GateError::invalid_attribute(&self.type_name, field));
        };

        let scope = self.scope()?;
        let tx = scope.transaction();
        let patch = info.data_type.coerce(value.into())?;
        let original = tx.get_attribute(&self.entity, field)?;
        let modified = if info.data_type.is_complex() && !original.is_null() && !patch.is_null() {
            original.merged_with(&patch)
        } else {
            patch
        };
        if original == modified {
            return Ok(false);
        }

        let change = ChangeSpec::new(
            self,
            field,
            FieldValue::Attribute(original),
            FieldValue::Attribute(modified.clone()),
        );
        scope
            .permission_executor()
            .check_field_permission(PermissionKind::Update, self, field, Some(&change))?;

        tx.set_attribute(&self.entity, field, modified)?;
        scope.mark_dirty(self)?;
        scope.audit(AuditAction::Update, self, Some(&change))?;
        let operation = self.field_operation()?;
        scope.publish_lifecycle_event(self, Some(field), operation, Some(change))?;
        Ok(true)
    }

    // ========================================================================
    // Relationship mutation
    // ========================================================================

    /// Replaces the visible part of a relationship. Elements the caller
    /// cannot read are left in place.
    pub async fn update_relation(&self, field: &str, requested: Vec<PersistentResource>) -> Result<bool> {
        let relationship = self.dictionary.relationship_type_strict(&self.type_name, field)?;
        if relationship.is_to_many() {
            self.update_to_many_relation(field, requested).await
        } else {
            if requested.len() > 1 {
                return Err(GateError::BadRequest(format!(
                    "{}.{} accepts a single resource",
                    self.type_name, field
                )));
            }
            self.update_to_one_relation(field, requested.into_iter().next()).await
        }
    }

    async fn update_to_many_relation(&self, field: &str, requested: Vec<PersistentResource>) -> Result<bool> {
        let mine = self.get_relation(field).await?;

        let deleted: Vec<PersistentResource> = mine.iter().filter(|m| !requested.contains(m)).cloned().collect();
        let mut added: Vec<PersistentResource> = Vec::new();
        for resource in requested {
            if !mine.contains(&resource) && !added.contains(&resource) {
                added.push(resource);
            }
        }
        if deleted.is_empty() && added.is_empty() {
            return Ok(false);
        }

        for resource in &added {
            self.check_transferable(resource)?;
        }

        let scope = self.scope()?;
        let original = self.raw_relation(&scope, field).await?;
        let mut modified: Vec<Entity> = original
            .iter()
            .filter(|e| !deleted.iter().any(|d| &d.entity == *e))
            .cloned()
            .collect();
        for resource in &added {
            if !modified.contains(&resource.entity) {
                modified.push(resource.entity.clone());
            }
        }

        self.apply_relation_change(
            &scope,
            field,
            FieldValue::ToMany(original),
            FieldValue::ToMany(modified),
            &added,
            &deleted,
        )
        .await
    }

    async fn update_to_one_relation(&self, field: &str, requested: Option<PersistentResource>) -> Result<bool> {
        let scope = self.scope()?;
        let original = self.raw_relation(&scope, field).await?.into_iter().next();
        if original.as_ref() == requested.as_ref().map(|r| &r.entity) {
            return Ok(false);
        }
        if let Some(resource) = &requested {
            self.check_transferable(resource)?;
        }

        let deleted = match original.clone() {
            Some(entity) => vec![self.wrap(entity, &scope)?],
            None => Vec::new(),
        };
        let added: Vec<PersistentResource> = requested.iter().cloned().collect();
        self.apply_relation_change(
            &scope,
            field,
            FieldValue::ToOne(original),
            FieldValue::ToOne(requested.map(|r| r.entity)),
            &added,
            &deleted,
        )
        .await
    }

    /// Removes every visible element, fixing inverses.
    pub async fn clear_relation(&self, field: &str) -> Result<bool> {
        let relationship = self.dictionary.relationship_type_strict(&self.type_name, field)?;
        if relationship.is_to_many() {
            self.update_to_many_relation(field, Vec::new()).await
        } else {
            if self.get_relation(field).await?.is_empty() {
                return Ok(false);
            }
            self.update_to_one_relation(field, None).await
        }
    }

    pub async fn add_relation(&self, field: &str, resource: &PersistentResource) -> Result<bool> {
        let relationship = self.dictionary.relationship_type_strict(&self.type_name, field)?;
        if !relationship.is_to_many() {
            return Err(GateError::InternalServerError("Relationship type mismatch".into()));
        }

        let scope = self.scope()?;
        let original = self.raw_relation(&scope, field).await?;
        if original.contains(&resource.entity) {
            return Ok(false);
        }
        self.check_transferable(resource)?;

        let mut modified = original.clone();
        modified.push(resource.entity.clone());
        self.apply_relation_change(
            &scope,
            field,
            FieldValue::ToMany(original),
            FieldValue::ToMany(modified),
            std::slice::from_ref(resource),
            &[],
        )
        .await
    }

    /// No-op when `resource` is not related.
    pub async fn remove_relation(&self, field: &str, resource: &PersistentResource) -> Result<bool> {
        let relationship = self.dictionary.relationship_type_strict(&self.type_name, field)?;
        let scope = self.scope()?;
        let original = self.raw_relation(&scope, field).await?;
        if !original.contains(&resource.entity) {
            return Ok(false);
        }

        let (original, modified) = if relationship.is_to_many() {
            let modified = original.iter().filter(|e| **e != resource.entity).cloned().collect();
            (FieldValue::ToMany(original), FieldValue::ToMany(modified))
        } else {
            (FieldValue::ToOne(Some(resource.entity.clone())), FieldValue::ToOne(None))
        };
        self.apply_relation_change(&scope, field, original, modified, &[], std::slice::from_ref(resource))
            .await
    }

    async fn apply_relation_change(
        &self,
        scope: &RequestScope,
        field: &str,
        original: FieldValue,
        modified: FieldValue,
        added: &[PersistentResource],
        deleted: &[PersistentResource],
    ) -> Result<bool> {
        let change = ChangeSpec::new(self, field, original, modified.clone());
        scope
            .permission_executor()
            .check_field_permission(PermissionKind::Update, self, field, Some(&change))?;

        let tx = scope.transaction();
        match &modified {
            FieldValue::ToOne(related) => {
                self.entity.set(field, modified.clone())?;
                tx.update_to_one_relation(&self.entity, field, related.as_ref())?;
            }
            _ => {
                self.entity.set(field, modified.clone())?;
                let added_entities: Vec<Entity> = added.iter().map(|r| r.entity.clone()).collect();
                let deleted_entities: Vec<Entity> = deleted.iter().map(|r| r.entity.clone()).collect();
                tx.update_to_many_relation(&self.entity, field, &added_entities, &deleted_entities)?;
            }
        }

        for resource in deleted {
            self.delete_inverse_relation(field, resource).await?;
        }
        for resource in added {
            self.add_inverse_relation(field, resource).await?;
        }

        scope.mark_dirty(self)?;
        scope.audit(AuditAction::Update, self, Some(&change))?;
        let operation = self.field_operation()?;
        scope.publish_lifecycle_event(self, Some(field), operation, Some(change))?;
        Ok(true)
    }

    // ========================================================================
    // Inverse maintenance
    // ========================================================================

    /// Adds this resource to the peer's side of a bidirectional relationship.
    async fn add_inverse_relation(&self, field: &str, peer: &PersistentResource) -> Result<()> {
        let inverse = self.dictionary.relationship_inverse(&self.type_name, field)?;
        if inverse.is_empty() {
            return Ok(());
        }
        let scope = self.scope()?;
        let peer_binding = peer.binding()?;
        let current = peer.raw_relation(&scope, &inverse).await?;

        let (original, modified) = if peer_binding.relationship_type(&inverse).is_to_many() {
            if current.contains(&self.entity) {
                return Ok(());
            }
            let mut modified = current.clone();
            modified.push(self.entity.clone());
            (FieldValue::ToMany(current), FieldValue::ToMany(modified))
        } else {
            self.ensure_inverse_target(&peer_binding, &inverse)?;
            let previous = current.into_iter().next();
            if previous.as_ref() == Some(&self.entity) {
                return Ok(());
            }
            // The peer's previous owner loses it
            if let Some(previous) = &previous {
                let previous = peer.wrap(previous.clone(), &scope)?;
                if !scope.is_deleted(&previous)? {
                    previous.detach(&scope, field, peer).await?;
                }
            }
            (FieldValue::ToOne(previous), FieldValue::ToOne(Some(self.entity.clone())))
        };

        peer.apply_inverse_change(&scope, &inverse, original, modified, &self.entity, true)
    }

    /// Removes this resource from the peer's side of a bidirectional
    /// relationship.
    async fn delete_inverse_relation(&self, field: &str, peer: &PersistentResource) -> Result<()> {
        let inverse = self.dictionary.relationship_inverse(&self.type_name, field)?;
        if inverse.is_empty() {
            return Ok(());
        }
        let scope = self.scope()?;
        let peer_binding = peer.binding()?;
        let current = peer.raw_relation(&scope, &inverse).await?;
        if !current.contains(&self.entity) {
            return Ok(());
        }

        let (original, modified) = if peer_binding.relationship_type(&inverse).is_to_many() {
            let modified = current.iter().filter(|e| **e != self.entity).cloned().collect();
            (FieldValue::ToMany(current), FieldValue::ToMany(modified))
        } else {
            self.ensure_inverse_target(&peer_binding, &inverse)?;
            (FieldValue::ToOne(Some(self.entity.clone())), FieldValue::ToOne(None))
        };

        peer.apply_inverse_change(&scope, &inverse, original, modified, &self.entity, false)
    }

    /// Drops `peer` from this resource's `field` without touching the peer.
    async fn detach(&self, scope: &RequestScope, field: &str, peer: &PersistentResource) -> Result<()> {
        let current = self.raw_relation(scope, field).await?;
        if !current.contains(&peer.entity) {
            return Ok(());
        }
        let (original, modified) = if self.binding()?.relationship_type(field).is_to_many() {
            let modified = current.iter().filter(|e| **e != peer.entity).cloned().collect();
            (FieldValue::ToMany(current), FieldValue::ToMany(modified))
        } else {
            (FieldValue::ToOne(Some(peer.entity.clone())), FieldValue::ToOne(None))
        };
        self.apply_inverse_change(scope, field, original, modified, &peer.entity, false)
    }

    fn apply_inverse_change(
        &self,
        scope: &RequestScope,
        field: &str,
        original: FieldValue,
        modified: FieldValue,
        other: &Entity,
        added: bool,
    ) -> Result<()> {
        let change = ChangeSpec::new(self, field, original, modified.clone());
        scope
            .permission_executor()
            .check_field_permission(PermissionKind::Update, self, field, Some(&change))?;

        let tx = scope.transaction();
        self.entity.set(field, modified.clone())?;
        match &modified {
            FieldValue::ToOne(related) => tx.update_to_one_relation(&self.entity, field, related.as_ref())?,
            _ => {
                let other = std::slice::from_ref(other);
                let (added, deleted): (&[Entity], &[Entity]) = if added { (other, &[]) } else { (&[], other) };
                tx.update_to_many_relation(&self.entity, field, added, deleted)?
            }
        }

        scope.mark_dirty(self)?;
        let operation = self.field_operation()?;
        scope.publish_lifecycle_event(self, Some(field), operation, Some(change))
    }

    fn ensure_inverse_target(&self, peer_binding: &EntityBinding, inverse: &str) -> Result<()> {
        let binding = self.binding()?;
        let target_matches = peer_binding
            .relationship(inverse)
            .is_some_and(|r| binding.is_a(&r.target));
        if !target_matches {
            return Err(GateError::InternalServerError("Relationship type mismatch".into()));
        }
        Ok(())
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Deletes the resource, detaching it from every non-cascading
    /// bidirectional peer first.
    pub async fn delete_resource(&self) -> Result<()> {
        let scope = self.scope()?;
        scope
            .permission_executor()
            .check_permission(PermissionKind::Delete, self, None)?;

        let binding = self.binding()?;
        for field in binding.relationships() {
            let Some(info) = binding.relationship(field) else {
                continue;
            };
            if info.cascade_delete || info.relationship_type.is_computed() {
                continue;
            }
            if self.dictionary.relationship_inverse(&self.type_name, field)?.is_empty() {
                continue;
            }
            for entity in self.raw_relation(&scope, field).await? {
                let peer = self.wrap(entity, &scope)?;
                if scope.is_deleted(&peer)? {
                    continue;
                }
                self.delete_inverse_relation(field, &peer).await?;
            }
        }

        scope.transaction().delete(&self.entity).await?;
        scope.audit(AuditAction::Delete, self, None)?;
        scope.publish_lifecycle_event(self, None, Operation::Delete, None)?;
        scope.mark_deleted(self)?;
        debug!(resource = %self, "deleted object");
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Unfiltered current value of a relationship.
    async fn raw_relation(&self, scope: &RequestScope, field: &str) -> Result<Vec<Entity>> {
        Ok(scope
            .transaction()
            .get_relation(&self.entity, field)
            .await?
            .map(|value| value.entities())
            .unwrap_or_default())
    }

    fn field_operation(&self) -> Result<Operation> {
        Ok(if self.is_newly_created()? {
            Operation::Create
        } else {
            Operation::Update
        })
    }

    /// Resources new in this request and types already on the lineage path
    /// may be referenced freely.
    fn check_transferable(&self, target: &PersistentResource) -> Result<()> {
        if target.is_newly_created()? || self.lineage.contains_type(&target.type_name) {
            return Ok(());
        }
        let scope = self.scope()?;
        scope
            .permission_executor()
            .check_permission(PermissionKind::NonTransferable, target, None)?;
        Ok(())
    }
}

/// Requested ids with no matching resource, by id, uuid or coerced id.
fn missing_ids(
    dictionary: &EntityDictionary,
    type_name: &str,
    ids: &[String],
    resources: &[PersistentResource],
) -> Result<Vec<String>> {
    let mut found = HashSet::new();
    for resource in resources {
        if let Some(id) = resource.id()? {
            found.insert(id);
        }
        if let Some(uuid) = resource.uuid() {
            found.insert(uuid.to_string());
        }
    }

    Ok(ids
        .iter()
        .filter(|id| {
            if found.contains(id.as_str()) {
                return false;
            }
            let canonical = dictionary
                .coerce_id(type_name, id)
                .ok()
                .and_then(|value| value.id_string());
            !canonical.is_some_and(|c| found.contains(&c))
        })
        .cloned()
        .collect())
}

fn coerced_match(dictionary: &EntityDictionary, type_name: &str, ids: &[String], id: Option<&str>) -> bool {
    let Some(id) = id else {
        return false;
    };
    ids.iter().any(|wanted| {
        dictionary
            .coerce_id(type_name, wanted)
            .ok()
            .and_then(|value| value.id_string())
            .is_some_and(|canonical| canonical == id)
    })
}

impl PartialEq for PersistentResource {
    fn eq(&self, other: &Self) -> bool {
        if self.entity == other.entity {
            return true;
        }
        if self.type_name != other.type_name {
            return false;
        }
        let mine = self.id().ok().flatten();
        let theirs = other.id().ok().flatten();
        if let (Some(a), Some(b)) = (&mine, &theirs) {
            return a == b;
        }
        match (&self.uuid, &other.uuid, &theirs) {
            (Some(a), Some(b), _) if a == b => true,
            (Some(a), _, Some(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for PersistentResource {}

impl Hash for PersistentResource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if let Some(cached) = self.hash.get() {
            return cached.hash(state);
        }
        // Only a persistent id is stable enough to cache
        if let Some(id) = self.id().ok().flatten() {
            let value = *self.hash.get_or_init(|| keyed_hash(&self.type_name, &id));
            return value.hash(state);
        }
        match &self.uuid {
            Some(uuid) => keyed_hash(&self.type_name, uuid).hash(state),
            None => self.entity.instance_id().hash(state),
        }
    }
}

fn keyed_hash(type_name: &str, key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    type_name.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}

impl fmt::Debug for PersistentResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentResource")
            .field("type", &self.type_name)
            .field("id", &self.display_id())
            .field("lineage", &self.lineage.to_string())
            .finish()
    }
}

impl fmt::Display for PersistentResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_name, self.display_id())
    }
}
