// ============================================================================
// In-memory reference backend
// ============================================================================
//
// Committed state is a table of plain records keyed by a store-assigned
// key; relationships hold keys, never live handles. Each transaction
// materializes its own entity copies at begin, so nothing a request mutates
// is visible elsewhere until commit writes the changed records back:
//
//   begin  -> copy records into fresh entities (snapshot)
//   commit -> drop deleted keys, insert staged creates, write back every
//             snapshot entity whose record differs from its original
//   close  -> discard the snapshot and staged changes
//
// Generated identifiers are assigned at flush. Filtering, sorting and
// pagination are never pushed down, so the core emulates them.
//
// ============================================================================

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::transaction::{DataStore, DataStoreTransaction, EntityStream};
use crate::core::{DataType, Entity, FieldValue, GateError, InstanceId, Result, Value};
use crate::dictionary::EntityDictionary;
use crate::filter::FilterExpression;
use crate::request::EntityProjection;

/// Committed field value. Relationships refer to record keys.
#[derive(Debug, Clone, PartialEq)]
enum StoredField {
    Attribute(Value),
    ToOne(Option<u64>),
    ToMany(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq)]
struct StoredRecord {
    type_name: String,
    bound: String,
    fields: HashMap<String, StoredField>,
}

#[derive(Default)]
struct StoreState {
    records: BTreeMap<u64, StoredRecord>,
    next_key: u64,
    sequences: HashMap<String, i64>,
}

impl StoreState {
    fn allocate_key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    /// Fresh entities for every committed record, wired to each other.
    fn materialize(&self) -> Result<Snapshot> {
        let entities: BTreeMap<u64, Entity> = self
            .records
            .iter()
            .map(|(key, record)| (*key, Entity::new(record.type_name.clone())))
            .collect();

        for (key, record) in &self.records {
            let Some(entity) = entities.get(key) else {
                continue;
            };
            for (field, stored) in &record.fields {
                let value = match stored {
                    StoredField::Attribute(v) => FieldValue::Attribute(v.clone()),
                    StoredField::ToOne(related) => {
                        FieldValue::ToOne(related.and_then(|k| entities.get(&k).cloned()))
                    }
                    // Keys of records deleted since are dropped
                    StoredField::ToMany(related) => {
                        FieldValue::ToMany(related.iter().filter_map(|k| entities.get(k).cloned()).collect())
                    }
                };
                entity.set(field, value)?;
            }
        }

        let keys = entities.iter().map(|(key, e)| (e.instance_id(), *key)).collect();
        Ok(Snapshot {
            entities,
            keys,
            originals: self.records.clone(),
        })
    }
}

/// One transaction's private copy of the committed objects.
#[derive(Default)]
struct Snapshot {
    entities: BTreeMap<u64, Entity>,
    keys: HashMap<InstanceId, u64>,
    originals: BTreeMap<u64, StoredRecord>,
}

pub struct InMemoryDataStore {
    dictionary: Arc<EntityDictionary>,
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryDataStore {
    pub fn new(dictionary: Arc<EntityDictionary>) -> Self {
        Self {
            dictionary,
            state: Arc::new(RwLock::new(StoreState::default())),
        }
    }

    /// Number of committed objects bound to `type_name`.
    pub async fn count(&self, type_name: &str) -> usize {
        self.state
            .read()
            .await
            .records
            .values()
            .filter(|r| r.bound == type_name)
            .count()
    }

    async fn transaction(&self, read_only: bool) -> Result<Arc<dyn DataStoreTransaction>> {
        let snapshot = self.state.read().await.materialize()?;
        Ok(Arc::new(InMemoryTransaction {
            dictionary: Arc::clone(&self.dictionary),
            store: Arc::clone(&self.state),
            read_only,
            snapshot: Mutex::new(snapshot),
            changes: Mutex::new(Vec::new()),
            state: Mutex::new(TransactionState::Active),
            cancelled: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn begin_transaction(&self) -> Result<Arc<dyn DataStoreTransaction>> {
        self.transaction(false).await
    }

    async fn begin_read_transaction(&self) -> Result<Arc<dyn DataStoreTransaction>> {
        self.transaction(true).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    Active,
    Committed,
    Closed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Committed => write!(f, "COMMITTED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Clone)]
enum Change {
    Create(Entity),
    Save(Entity),
    Delete(Entity),
}

pub struct InMemoryTransaction {
    dictionary: Arc<EntityDictionary>,
    store: Arc<RwLock<StoreState>>,
    read_only: bool,
    snapshot: Mutex<Snapshot>,
    changes: Mutex<Vec<Change>>,
    state: Mutex<TransactionState>,
    cancelled: AtomicBool,
}

impl InMemoryTransaction {
    fn ensure_active(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(GateError::TransactionCancelled("transaction was cancelled".into()));
        }
        let state = *self.state.lock()?;
        if state != TransactionState::Active {
            return Err(GateError::InternalServerError(format!(
                "transaction is {}",
                state
            )));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        if self.read_only {
            return Err(GateError::BadRequest("read-only transaction".into()));
        }
        Ok(())
    }

    fn stage(&self, change: Change) -> Result<()> {
        self.changes.lock()?.push(change);
        Ok(())
    }

    fn staged_creates(&self) -> Result<Vec<Entity>> {
        let mut created: Vec<Entity> = Vec::new();
        for change in self.changes.lock()?.iter() {
            if let Change::Create(e) = change {
                if !created.contains(e) {
                    created.push(e.clone());
                }
            }
        }
        Ok(created)
    }

    fn staged_deletes(&self) -> Result<Vec<Entity>> {
        Ok(self
            .changes
            .lock()?
            .iter()
            .filter_map(|c| match c {
                Change::Delete(e) => Some(e.clone()),
                _ => None,
            })
            .collect())
    }

    /// Snapshot and staged objects visible to this transaction, including
    /// subtypes of `type_name`.
    fn visible(&self, type_name: &str) -> Result<Vec<Entity>> {
        let bound = self
            .dictionary
            .lookup_bound_type(type_name)?
            .unwrap_or_else(|| type_name.to_string());
        let mut types = vec![bound.clone()];
        types.extend(self.dictionary.subtypes(&bound)?);

        let deleted = self.staged_deletes()?;
        let mut visible = Vec::new();
        let committed: Vec<Entity> = self.snapshot.lock()?.entities.values().cloned().collect();
        for entity in committed {
            if !deleted.contains(&entity) && types.contains(&self.dictionary.bound_type_of(&entity)?) {
                visible.push(entity);
            }
        }
        for created in self.staged_creates()? {
            let created_type = self.dictionary.bound_type_of(&created)?;
            if types.contains(&created_type) && !deleted.contains(&created) && !visible.contains(&created) {
                visible.push(created);
            }
        }
        Ok(visible)
    }

    fn record_of(&self, entity: &Entity, keys: &HashMap<InstanceId, u64>) -> Result<StoredRecord> {
        let key_of = |e: &Entity| keys.get(&e.instance_id()).copied();
        let mut fields = HashMap::new();
        for name in entity.field_names()? {
            let stored = match entity.get(&name)? {
                Some(FieldValue::Attribute(v)) => StoredField::Attribute(v),
                Some(FieldValue::ToOne(one)) => StoredField::ToOne(one.as_ref().and_then(key_of)),
                Some(FieldValue::ToMany(many)) => StoredField::ToMany(many.iter().filter_map(key_of).collect()),
                None => continue,
            };
            fields.insert(name, stored);
        }
        Ok(StoredRecord {
            type_name: entity.type_name().to_string(),
            bound: self.dictionary.bound_type_of(entity)?,
            fields,
        })
    }

    async fn assign_generated_ids(&self) -> Result<()> {
        for entity in self.staged_creates()? {
            let binding = self.dictionary.binding_of(&entity)?;
            if !binding.is_id_generated() || self.dictionary.get_id(&entity)?.is_some() {
                continue;
            }
            let (Some(id_field), Some(id_type)) = (binding.id_field(), binding.id_type()) else {
                continue;
            };
            let value = match id_type {
                DataType::Integer => {
                    let mut store = self.store.write().await;
                    let existing_max = store
                        .records
                        .values()
                        .filter(|r| r.bound == binding.type_name)
                        .filter_map(|r| match r.fields.get(id_field) {
                            Some(StoredField::Attribute(v)) => v.as_i64(),
                            _ => None,
                        })
                        .max()
                        .unwrap_or(0);
                    let sequence = store.sequences.entry(binding.type_name.clone()).or_insert(0);
                    *sequence = (*sequence).max(existing_max) + 1;
                    Value::Integer(*sequence)
                }
                DataType::Uuid => Value::Uuid(Uuid::new_v4()),
                _ => Value::Text(Uuid::new_v4().to_string()),
            };
            debug!(entity = %entity, id = %value, "assigned generated id");
            entity.set_attribute(id_field, value)?;
        }
        Ok(())
    }
}

#[async_trait]
impl DataStoreTransaction for InMemoryTransaction {
    async fn create_new_object(&self, type_name: &str) -> Result<Entity> {
        self.ensure_active()?;
        let entity = Entity::new(type_name);
        // Collections start empty rather than unset
        let binding = self.dictionary.binding(type_name)?;
        for field in binding.relationships() {
            if binding.relationship_type(field).is_to_many() {
                entity.set(field, FieldValue::ToMany(Vec::new()))?;
            }
        }
        Ok(entity)
    }

    async fn load_object(
        &self,
        projection: &EntityProjection,
        id: &Value,
        _filter: Option<&FilterExpression>,
    ) -> Result<Option<Entity>> {
        self.ensure_active()?;
        let Some(wanted) = id.id_string() else {
            return Ok(None);
        };
        for entity in self.visible(&projection.type_name)? {
            if self.dictionary.get_id(&entity)?.as_deref() == Some(wanted.as_str()) {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    async fn load_objects(&self, projection: &EntityProjection) -> Result<EntityStream> {
        self.ensure_active()?;
        let objects = self.visible(&projection.type_name)?;
        Ok(futures::stream::iter(objects.into_iter().map(Ok)).boxed())
    }

    async fn create_object(&self, entity: &Entity) -> Result<()> {
        self.ensure_writable()?;
        self.stage(Change::Create(entity.clone()))
    }

    async fn save(&self, entity: &Entity) -> Result<()> {
        self.ensure_writable()?;
        self.stage(Change::Save(entity.clone()))
    }

    async fn delete(&self, entity: &Entity) -> Result<()> {
        self.ensure_writable()?;
        self.stage(Change::Delete(entity.clone()))
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_active()?;
        self.assign_generated_ids().await
    }

    async fn commit(&self) -> Result<()> {
        self.ensure_active()?;
        self.assign_generated_ids().await?;

        let changes: Vec<Change> = std::mem::take(&mut *self.changes.lock()?);
        let mut store = self.store.write().await;
        if !self.read_only {
            let snapshot = self.snapshot.lock()?;
            let mut keys = snapshot.keys.clone();

            let mut removed = Vec::new();
            let mut created: Vec<Entity> = Vec::new();
            let mut saved = 0usize;
            for change in &changes {
                match change {
                    Change::Delete(entity) => {
                        if let Some(key) = keys.remove(&entity.instance_id()) {
                            removed.push(key);
                        }
                        created.retain(|e| e != entity);
                    }
                    Change::Create(entity) => {
                        if !created.contains(entity) && !keys.contains_key(&entity.instance_id()) {
                            created.push(entity.clone());
                        }
                    }
                    Change::Save(_) => saved += 1,
                }
            }

            let mut inserted = Vec::with_capacity(created.len());
            for entity in created {
                let key = store.allocate_key();
                keys.insert(entity.instance_id(), key);
                inserted.push((key, entity));
            }

            for key in &removed {
                store.records.remove(key);
            }
            for (key, entity) in &inserted {
                let record = self.record_of(entity, &keys)?;
                store.records.insert(*key, record);
            }
            let mut updated = 0usize;
            for (key, entity) in &snapshot.entities {
                if removed.contains(key) || !store.records.contains_key(key) {
                    continue;
                }
                let record = self.record_of(entity, &keys)?;
                if snapshot.originals.get(key) != Some(&record) {
                    store.records.insert(*key, record);
                    updated += 1;
                }
            }
            debug!(
                created = inserted.len(),
                updated,
                saved,
                deleted = removed.len(),
                "in-memory transaction committed"
            );
        }
        drop(store);

        *self.state.lock()? = TransactionState::Committed;
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if *state == TransactionState::Active {
            let discarded = std::mem::take(&mut *self.changes.lock()?);
            if !discarded.is_empty() {
                debug!(discarded = discarded.len(), "discarding uncommitted changes");
            }
        }
        *self.snapshot.lock()? = Snapshot::default();
        *state = TransactionState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::EntityDescriptor;
    use futures::TryStreamExt;

    fn store() -> InMemoryDataStore {
        let dictionary = Arc::new(EntityDictionary::new());
        dictionary
            .bind_descriptor(
                EntityDescriptor::new("book")
                    .id("id", DataType::Integer)
                    .generated_id()
                    .attribute("title", DataType::Text),
            )
            .unwrap();
        InMemoryDataStore::new(dictionary)
    }

    #[tokio::test]
    async fn test_commit_applies_staged_creates() {
        let store = store();
        let tx = store.begin_transaction().await.unwrap();
        let book = tx.create_new_object("book").await.unwrap();
        tx.create_object(&book).await.unwrap();

        assert_eq!(store.count("book").await, 0);
        tx.flush().await.unwrap();
        assert_eq!(book.attribute("id").unwrap(), Value::Integer(1));

        tx.commit().await.unwrap();
        assert_eq!(store.count("book").await, 1);

        let tx = store.begin_read_transaction().await.unwrap();
        let loaded = tx
            .load_object(&EntityProjection::new("book"), &Value::Integer(1), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.attribute("id").unwrap(), Value::Integer(1));
        assert_ne!(loaded, book);
    }

    async fn load_book(tx: &Arc<dyn DataStoreTransaction>) -> Entity {
        tx.load_object(&EntityProjection::new("book"), &Value::Integer(1), None)
            .await
            .unwrap()
            .unwrap()
    }

    async fn seed_book(store: &InMemoryDataStore, title: &str) {
        let tx = store.begin_transaction().await.unwrap();
        let book = tx.create_new_object("book").await.unwrap();
        book.set_attribute("title", title).unwrap();
        tx.create_object(&book).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_uncommitted_writes_stay_private() {
        let store = store();
        seed_book(&store, "original").await;

        let writer = store.begin_transaction().await.unwrap();
        let reader = store.begin_read_transaction().await.unwrap();
        load_book(&writer).await.set_attribute("title", "draft").unwrap();

        assert_eq!(
            load_book(&reader).await.attribute("title").unwrap(),
            Value::from("original")
        );
        writer.close().unwrap();

        let later = store.begin_read_transaction().await.unwrap();
        assert_eq!(
            load_book(&later).await.attribute("title").unwrap(),
            Value::from("original")
        );
    }

    #[tokio::test]
    async fn test_commit_writes_back_changed_records() {
        let store = store();
        seed_book(&store, "original").await;

        let tx = store.begin_transaction().await.unwrap();
        load_book(&tx).await.set_attribute("title", "revised").unwrap();
        tx.commit().await.unwrap();

        let tx = store.begin_read_transaction().await.unwrap();
        assert_eq!(
            load_book(&tx).await.attribute("title").unwrap(),
            Value::from("revised")
        );
        assert_eq!(store.count("book").await, 1);
    }

    #[tokio::test]
    async fn test_read_only_commit_writes_nothing() {
        let store = store();
        seed_book(&store, "original").await;

        let tx = store.begin_read_transaction().await.unwrap();
        load_book(&tx).await.set_attribute("title", "ignored").unwrap();
        tx.commit().await.unwrap();

        let tx = store.begin_read_transaction().await.unwrap();
        assert_eq!(
            load_book(&tx).await.attribute("title").unwrap(),
            Value::from("original")
        );
    }

    #[tokio::test]
    async fn test_relationships_survive_commit_and_deletes_unlink() {
        let dictionary = Arc::new(EntityDictionary::new());
        dictionary
            .bind_descriptor(
                EntityDescriptor::new("shelf")
                    .id("id", DataType::Integer)
                    .generated_id()
                    .one_to_many("books", "book"),
            )
            .unwrap();
        dictionary
            .bind_descriptor(
                EntityDescriptor::new("book")
                    .id("id", DataType::Integer)
                    .generated_id()
                    .attribute("title", DataType::Text),
            )
            .unwrap();
        let store = InMemoryDataStore::new(dictionary);

        let tx = store.begin_transaction().await.unwrap();
        let shelf = tx.create_new_object("shelf").await.unwrap();
        let first = tx.create_new_object("book").await.unwrap();
        let second = tx.create_new_object("book").await.unwrap();
        shelf
            .set("books", FieldValue::ToMany(vec![first.clone(), second.clone()]))
            .unwrap();
        for entity in [&shelf, &first, &second] {
            tx.create_object(entity).await.unwrap();
        }
        tx.commit().await.unwrap();

        let tx = store.begin_transaction().await.unwrap();
        let shelf = tx
            .load_object(&EntityProjection::new("shelf"), &Value::Integer(1), None)
            .await
            .unwrap()
            .unwrap();
        let books = shelf.to_many("books").unwrap();
        assert_eq!(books.len(), 2);
        let doomed = tx
            .load_object(&EntityProjection::new("book"), &Value::Integer(1), None)
            .await
            .unwrap()
            .unwrap();
        assert!(books.contains(&doomed));
        tx.delete(&doomed).await.unwrap();
        tx.commit().await.unwrap();

        let tx = store.begin_read_transaction().await.unwrap();
        let shelf = tx
            .load_object(&EntityProjection::new("shelf"), &Value::Integer(1), None)
            .await
            .unwrap()
            .unwrap();
        let remaining = shelf.to_many("books").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].attribute("id").unwrap(), Value::Integer(2));
        assert_eq!(store.count("book").await, 1);
    }

    #[tokio::test]
    async fn test_close_discards_uncommitted_work() {
        let store = store();
        let tx = store.begin_transaction().await.unwrap();
        let book = tx.create_new_object("book").await.unwrap();
        tx.create_object(&book).await.unwrap();
        tx.close().unwrap();

        assert_eq!(store.count("book").await, 0);
        assert!(tx.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_fails_later_operations() {
        let store = store();
        let tx = store.begin_transaction().await.unwrap();
        tx.cancel();

        let result = tx.load_objects(&EntityProjection::new("book")).await;
        assert!(matches!(result, Err(GateError::TransactionCancelled(_))));
    }

    #[tokio::test]
    async fn test_staged_objects_are_visible_to_own_transaction() {
        let store = store();
        let tx = store.begin_transaction().await.unwrap();
        let book = tx.create_new_object("book").await.unwrap();
        tx.create_object(&book).await.unwrap();

        let all: Vec<Entity> = tx
            .load_objects(&EntityProjection::new("book"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all, vec![book.clone()]);

        tx.delete(&book).await.unwrap();
        let all: Vec<Entity> = tx
            .load_objects(&EntityProjection::new("book"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let store = store();
        let tx = store.begin_read_transaction().await.unwrap();
        let book = tx.create_new_object("book").await.unwrap();
        assert!(matches!(tx.create_object(&book).await, Err(GateError::BadRequest(_))));
    }
}
