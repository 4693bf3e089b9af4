/// End-to-end request handling through the gate: commit pipeline, lifecycle
/// phases, deferred permission checks, audit and the transaction registry.
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use modelgate::dictionary::{Operation, RelationshipDescriptor, TransactionPhase};
use modelgate::flow::{AuditAction, AuditDescriptor, AuditLogger, LogMessage};
use modelgate::request::ChangeSpec;
use modelgate::security::{Check, CheckKind, CheckRegistry, PermissionAnnotation, PermissionKind};
use modelgate::{
    DataStore, DataType, Entity, EntityDescriptor, EntityDictionary, EntityProjection, FieldValue, Gate, GateError, GateSettings,
    InMemoryDataStore, PersistentResource, RequestScope, User, Value,
};
use uuid::Uuid;

type Log = Arc<Mutex<Vec<String>>>;

fn recorder(
    log: &Log,
    label: &str,
) -> impl Fn(&PersistentResource, &RequestScope, Option<&ChangeSpec>) -> modelgate::Result<()> + Send + Sync + 'static
{
    let log = Arc::clone(log);
    let label = label.to_string();
    move |_, _, _| {
        log.lock().unwrap().push(label.clone());
        Ok(())
    }
}

fn journal(log: &Log) -> Arc<EntityDictionary> {
    let dictionary = Arc::new(EntityDictionary::new());
    dictionary
        .bind_descriptor(
            EntityDescriptor::new("note")
                .id("id", DataType::Integer)
                .generated_id()
                .attribute("title", DataType::Text)
                .on(Operation::Create, TransactionPhase::PreSecurity, recorder(log, "create:pre_security"))
                .on(Operation::Create, TransactionPhase::PreFlush, recorder(log, "create:pre_flush"))
                .on(Operation::Create, TransactionPhase::PreCommit, recorder(log, "create:pre_commit"))
                .on(Operation::Create, TransactionPhase::PostCommit, recorder(log, "create:post_commit"))
                .on_field(Operation::Create, TransactionPhase::PreSecurity, "title", recorder(log, "title:pre_security"))
                .on_field(Operation::Update, TransactionPhase::PreSecurity, "title", recorder(log, "update:pre_security"))
                .on_field(Operation::Update, TransactionPhase::PostCommit, "title", recorder(log, "update:post_commit"))
                .on(Operation::Delete, TransactionPhase::PreSecurity, recorder(log, "delete:pre_security"))
                .on(Operation::Delete, TransactionPhase::PreCommit, recorder(log, "delete:pre_commit"))
                .on(Operation::Delete, TransactionPhase::PostCommit, recorder(log, "delete:post_commit")),
        )
        .unwrap();
    dictionary
}

#[tokio::test]
async fn test_lifecycle_phases_run_in_order() {
    let log: Log = Arc::default();
    let dictionary = journal(&log);
    let store = Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary)));
    let gate = Gate::new(store.clone(), dictionary);

    let response = gate
        .handle_request(false, User::anonymous(), Uuid::new_v4(), |scope| async move {
            let note = PersistentResource::create_object(&scope, "note", None, None).await?;
            note.update_attribute("title", "first")?;
            Ok::<_, GateError>(())
        })
        .await;

    assert!(response.is_success());
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "create:pre_security",
            "title:pre_security",
            "create:pre_flush",
            "create:pre_commit",
            "create:post_commit",
        ]
    );
    assert_eq!(store.count("note").await, 1);
}

#[tokio::test]
async fn test_update_pre_security_runs_immediately() {
    let log: Log = Arc::default();
    let dictionary = journal(&log);
    let gate = Gate::new(Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary))), dictionary);

    let created = gate
        .handle_request(false, User::anonymous(), Uuid::new_v4(), |scope| async move {
            let note = PersistentResource::create_object(&scope, "note", None, None).await?;
            Ok::<_, GateError>(note.entity().clone())
        })
        .await
        .result
        .unwrap();
    let id = created.attribute("id").unwrap().id_string().unwrap();
    log.lock().unwrap().clear();

    let log_in_handler = Arc::clone(&log);
    let response = gate
        .handle_request(false, User::anonymous(), Uuid::new_v4(), |scope| async move {
            let note = PersistentResource::load_record(&EntityProjection::new("note"), &id, &scope).await?;
            note.update_attribute("title", "edited")?;
            Ok::<_, GateError>(log_in_handler.lock().unwrap().clone())
        })
        .await;

    assert_eq!(response.result.unwrap(), vec!["update:pre_security"]);
    assert_eq!(*log.lock().unwrap(), vec!["update:pre_security", "update:post_commit"]);
    assert_eq!(title_of(&gate, "1").await, Value::Text("edited".into()));
}

async fn title_of(gate: &Gate, id: &str) -> Value {
    let id = id.to_string();
    gate.handle_request(true, User::anonymous(), Uuid::new_v4(), |scope| async move {
        let note = PersistentResource::load_record(&EntityProjection::new("note"), &id, &scope).await?;
        note.get_attribute("title")
    })
    .await
    .result
    .unwrap()
}

#[tokio::test]
async fn test_failed_request_leaves_committed_state_untouched() {
    let log: Log = Arc::default();
    let dictionary = journal(&log);
    let gate = Gate::new(Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary))), dictionary);

    gate.handle_request(false, User::anonymous(), Uuid::new_v4(), |scope| async move {
        let note = PersistentResource::create_object(&scope, "note", None, None).await?;
        note.update_attribute("title", "original")?;
        Ok::<_, GateError>(())
    })
    .await
    .result
    .unwrap();

    let response = gate
        .handle_request(false, User::anonymous(), Uuid::new_v4(), |scope| async move {
            let note = PersistentResource::load_record(&EntityProjection::new("note"), "1", &scope).await?;
            note.update_attribute("title", "discarded")?;
            Err::<(), _>(GateError::BadRequest("rejected after mutating".into()))
        })
        .await;
    assert_eq!(response.status, 400);

    assert_eq!(title_of(&gate, "1").await, Value::Text("original".into()));
}

#[tokio::test]
async fn test_update_then_delete_replays_in_queue_order() {
    let log: Log = Arc::default();
    let dictionary = journal(&log);
    let store = Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary)));
    let gate = Gate::new(store.clone(), dictionary);

    gate.handle_request(false, User::anonymous(), Uuid::new_v4(), |scope| async move {
        PersistentResource::create_object(&scope, "note", None, None).await?;
        Ok::<_, GateError>(())
    })
    .await
    .result
    .unwrap();
    log.lock().unwrap().clear();

    let response = gate
        .handle_request(false, User::anonymous(), Uuid::new_v4(), |scope| async move {
            let note = PersistentResource::load_record(&EntityProjection::new("note"), "1", &scope).await?;
            note.update_attribute("title", "last words")?;
            note.delete_resource().await
        })
        .await;

    assert!(response.is_success());
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "update:pre_security",
            "delete:pre_security",
            "delete:pre_commit",
            "update:post_commit",
            "delete:post_commit",
        ]
    );
    assert_eq!(store.count("note").await, 0);
}

#[tokio::test]
async fn test_created_then_deleted_is_never_persisted() {
    let log: Log = Arc::default();
    let dictionary = journal(&log);
    let store = Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary)));
    let gate = Gate::new(store.clone(), dictionary);

    let response = gate
        .handle_request(false, User::anonymous(), Uuid::new_v4(), |scope| async move {
            let note = PersistentResource::create_object(&scope, "note", None, None).await?;
            note.update_attribute("title", "ephemeral")?;
            note.delete_resource().await?;

            scope.save_or_create_objects().await?;
            Ok::<_, GateError>((scope.new_resources()?.len(), scope.dirty_resources()?.len()))
        })
        .await;

    assert_eq!(response.result.unwrap(), (0, 0));
    assert_eq!(log.lock().unwrap().first().map(String::as_str), Some("delete:pre_security"));
    assert_eq!(store.count("note").await, 0);
}

#[tokio::test]
async fn test_duplicate_events_are_delivered_once() {
    let log: Log = Arc::default();
    let dictionary = journal(&log);
    let store = Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary)));
    let gate = Gate::new(store.clone(), Arc::clone(&dictionary));

    gate.handle_request(false, User::anonymous(), Uuid::new_v4(), |scope| async move {
        let note = PersistentResource::create_object(&scope, "note", None, None).await?;
        note.update_attribute("title", "a")?;
        Ok::<_, GateError>(())
    })
    .await
    .result
    .unwrap();
    log.lock().unwrap().clear();

    let scope = RequestScope::builder(store.begin_transaction().await.unwrap(), dictionary).build();
    let note = PersistentResource::load_record(&EntityProjection::new("note"), "1", &scope)
        .await
        .unwrap();
    let change = ChangeSpec::new(
        &note,
        "title",
        FieldValue::Attribute(Value::Text("a".into())),
        FieldValue::Attribute(Value::Text("b".into())),
    );
    for _ in 0..2 {
        scope
            .publish_lifecycle_event(&note, Some("title"), Operation::Update, Some(change.clone()))
            .unwrap();
    }

    assert_eq!(*log.lock().unwrap(), vec!["update:pre_security"]);
    let updates = scope
        .queued_events()
        .unwrap()
        .into_iter()
        .filter(|e| e.operation == Operation::Update)
        .count();
    assert_eq!(updates, 1);
}

#[tokio::test]
async fn test_identity_cache_returns_the_same_object() {
    let log: Log = Arc::default();
    let dictionary = journal(&log);
    let gate = Gate::new(Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary))), dictionary);

    gate.handle_request(false, User::anonymous(), Uuid::new_v4(), |scope| async move {
        PersistentResource::create_object(&scope, "note", None, None).await?;
        Ok::<_, GateError>(())
    })
    .await
    .result
    .unwrap();

    let response = gate
        .handle_request(true, User::anonymous(), Uuid::new_v4(), |scope| async move {
            let projection = EntityProjection::new("note");
            let first = PersistentResource::load_record(&projection, "1", &scope).await?;
            let second = PersistentResource::load_record(&projection, "1", &scope).await?;
            let cached = scope.get_object_by_id("note", "1")?;
            Ok::<_, GateError>((first == second, first.entity().instance_id() == second.entity().instance_id(), cached.is_some()))
        })
        .await;

    assert_eq!(response.result.unwrap(), (true, true, true));
}

fn hash_of(resource: &PersistentResource) -> u64 {
    let mut hasher = DefaultHasher::new();
    resource.hash(&mut hasher);
    hasher.finish()
}

#[tokio::test]
async fn test_hash_follows_equality_after_id_assignment() {
    let log: Log = Arc::default();
    let dictionary = journal(&log);
    let store = InMemoryDataStore::new(Arc::clone(&dictionary));
    let scope = RequestScope::builder(store.begin_transaction().await.unwrap(), dictionary).build();

    let note = PersistentResource::create_object(&scope, "note", None, Some("u-1")).await.unwrap();
    let same_uuid = PersistentResource::new(note.entity().clone(), Some("u-1".into()), &scope).unwrap();
    assert_eq!(hash_of(&note), hash_of(&same_uuid));

    scope.save_or_create_objects().await.unwrap();
    scope.transaction().flush().await.unwrap();
    assert_eq!(note.id().unwrap(), Some("1".to_string()));

    let rewrapped = PersistentResource::new(note.entity().clone(), None, &scope).unwrap();
    assert_eq!(note, rewrapped);
    assert_eq!(hash_of(&note), hash_of(&rewrapped));
}

// ============================================================================
// Deferred permission checks
// ============================================================================

/// Passes once the resource has a title.
#[derive(Debug, Default)]
struct HasTitle;

impl Check for HasTitle {
    fn kind(&self) -> CheckKind {
        CheckKind::Commit
    }

    fn ok(&self, resource: Option<&PersistentResource>, _: &User, _: Option<&ChangeSpec>) -> bool {
        resource.is_some_and(|r| !r.entity().attribute("title").map(|v| v.is_null()).unwrap_or(true))
    }
}

fn guarded() -> Arc<EntityDictionary> {
    let checks = Arc::new(CheckRegistry::with_default_checks());
    checks.register::<HasTitle>("Has Title").unwrap();
    checks.register_role("Is Editor", "editor").unwrap();

    let dictionary = Arc::new(EntityDictionary::with_checks(checks));
    dictionary
        .bind_descriptor(
            EntityDescriptor::new("page")
                .id("id", DataType::Integer)
                .generated_id()
                .attribute("title", DataType::Text)
                .permission(PermissionKind::Create, PermissionAnnotation::expression("Is Editor AND Has Title"))
                .permission(PermissionKind::Read, PermissionAnnotation::expression("Is Editor")),
        )
        .unwrap();
    dictionary
}

#[tokio::test]
async fn test_commit_check_rejects_incomplete_object() {
    let dictionary = guarded();
    let store = Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary)));
    let gate = Gate::new(store.clone(), dictionary);
    let editor = User::named("erin").with_role("editor");

    let response = gate
        .handle_request(false, editor.clone(), Uuid::new_v4(), |scope| async move {
            PersistentResource::create_object(&scope, "page", None, None).await?;
            Ok::<_, GateError>(scope.permission_executor().pending_commit_checks()?)
        })
        .await;
    assert_eq!(response.status, 403);
    assert_eq!(store.count("page").await, 0);

    let response = gate
        .handle_request(false, editor, Uuid::new_v4(), |scope| async move {
            let page = PersistentResource::create_object(&scope, "page", None, None).await?;
            page.update_attribute("title", "Home")?;
            Ok::<_, GateError>(scope.permission_executor().pending_commit_checks()?)
        })
        .await;
    assert!(response.is_success());
    assert!(response.result.unwrap() >= 1);
    assert_eq!(store.count("page").await, 1);
}

#[tokio::test]
async fn test_user_check_fails_before_anything_is_deferred() {
    let dictionary = guarded();
    let store = Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary)));
    let gate = Gate::new(store.clone(), dictionary);

    let response = gate
        .handle_request(false, User::named("guest"), Uuid::new_v4(), |scope| async move {
            let created = PersistentResource::create_object(&scope, "page", None, None).await;
            assert_eq!(scope.permission_executor().pending_commit_checks()?, 0);
            created?;
            Ok::<_, GateError>(())
        })
        .await;

    assert_eq!(response.status, 403);
    assert_eq!(store.count("page").await, 0);
}

#[tokio::test]
async fn test_collection_read_denied_for_user_returns_nothing() {
    let dictionary = guarded();
    let gate = Gate::new(Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary))), dictionary);

    gate.handle_request(false, User::named("erin").with_role("editor"), Uuid::new_v4(), |scope| async move {
        let page = PersistentResource::create_object(&scope, "page", None, None).await?;
        page.update_attribute("title", "Home")?;
        Ok::<_, GateError>(())
    })
    .await
    .result
    .unwrap();

    let loaded = |user: User| {
        gate.handle_request(true, user, Uuid::new_v4(), |scope| async move {
            let mut projection = EntityProjection::new("page");
            let pages = PersistentResource::load_records(&mut projection, &[], &scope).await?;
            Ok::<_, GateError>(pages.len())
        })
    };
    assert_eq!(loaded(User::named("guest")).await.result.unwrap(), 0);
    assert_eq!(loaded(User::named("erin").with_role("editor")).await.result.unwrap(), 1);
}

// ============================================================================
// Registry, cancellation and audit
// ============================================================================

#[tokio::test]
async fn test_registry_is_empty_after_success_and_failure() {
    let log: Log = Arc::default();
    let dictionary = journal(&log);
    let store = Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary)));
    let gate = Gate::new(store.clone(), dictionary);
    let registry = gate.registry();

    let request_id = Uuid::new_v4();
    let response = gate
        .handle_request(false, User::anonymous(), request_id, |_| async move {
            Ok::<_, GateError>(registry.running_transactions().await)
        })
        .await;
    assert_eq!(response.result.unwrap(), vec![request_id]);
    assert!(registry.running_transactions().await.is_empty());

    let response = gate
        .handle_request(false, User::anonymous(), Uuid::new_v4(), |scope| async move {
            PersistentResource::create_object(&scope, "note", None, None).await?;
            Err::<(), _>(GateError::BadRequest("rejected by handler".into()))
        })
        .await;
    assert_eq!(response.status, 400);
    assert!(registry.running_transactions().await.is_empty());
    assert_eq!(store.count("note").await, 0);
}

#[tokio::test]
async fn test_cancel_aborts_the_running_request() {
    let log: Log = Arc::default();
    let dictionary = journal(&log);
    let store = Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary)));
    let gate = Gate::new(store.clone(), dictionary);
    assert!(!gate.cancel(Uuid::new_v4()).await);

    let request_id = Uuid::new_v4();
    let gate_ref = &gate;
    let response = gate
        .handle_request(false, User::anonymous(), request_id, |scope| async move {
            assert!(gate_ref.cancel(request_id).await);
            PersistentResource::create_object(&scope, "note", None, None).await?;
            Ok::<_, GateError>(())
        })
        .await;

    assert_eq!(response.status, 409);
    assert_eq!(store.count("note").await, 0);
    assert!(gate.registry().running_transactions().await.is_empty());
}

#[derive(Default)]
struct RecordingAuditLogger {
    pending: Mutex<Vec<LogMessage>>,
    committed: Mutex<Vec<String>>,
}

impl AuditLogger for RecordingAuditLogger {
    fn log(&self, message: LogMessage) -> modelgate::Result<()> {
        self.pending.lock()?.push(message);
        Ok(())
    }

    fn commit(&self, request_id: Uuid) -> modelgate::Result<()> {
        let mut pending = self.pending.lock()?;
        let (mine, rest): (Vec<_>, Vec<_>) = pending.drain(..).partition(|m| m.request_id == request_id);
        *pending = rest;
        self.committed.lock()?.extend(mine.into_iter().map(|m| m.message));
        Ok(())
    }

    fn clear(&self, request_id: Uuid) -> modelgate::Result<()> {
        self.pending.lock()?.retain(|m| m.request_id != request_id);
        Ok(())
    }
}

#[tokio::test]
async fn test_audit_messages_commit_with_the_request() {
    let dictionary = Arc::new(EntityDictionary::new());
    dictionary
        .bind_descriptor(
            EntityDescriptor::new("invoice")
                .id("id", DataType::Integer)
                .generated_id()
                .attribute("total", DataType::Integer)
                .audit(AuditDescriptor::on(AuditAction::Create, 1, "{type} created by {user}"))
                .audit(AuditDescriptor::on_field("total", 2, "{field}: {old} -> {new}")),
        )
        .unwrap();
    let audit = Arc::new(RecordingAuditLogger::default());
    let gate = Gate::new(Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary))), dictionary)
        .with_audit_logger(audit.clone());

    gate.handle_request(false, User::named("alice"), Uuid::new_v4(), |scope| async move {
        PersistentResource::create_object(&scope, "invoice", None, None).await?;
        Ok::<_, GateError>(())
    })
    .await
    .result
    .unwrap();

    let response = gate
        .handle_request(false, User::named("mallory"), Uuid::new_v4(), |scope| async move {
            let invoice = PersistentResource::create_object(&scope, "invoice", None, None).await?;
            invoice.update_attribute("total", 5i64)?;
            Err::<(), _>(GateError::BadRequest("abandoned".into()))
        })
        .await;
    assert!(!response.is_success());

    assert_eq!(*audit.committed.lock().unwrap(), vec!["invoice created by alice"]);
    assert!(audit.pending.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_slow_request_still_completes() {
    let log: Log = Arc::default();
    let dictionary = journal(&log);
    let gate = Gate::new(Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary))), dictionary)
        .with_settings(GateSettings::new().slow_request_threshold(Duration::ZERO));

    let response = gate
        .handle_request(true, User::anonymous(), Uuid::new_v4(), |_| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, GateError>(())
        })
        .await;
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_dropped_request_is_cleaned_up() {
    let dictionary = Arc::new(EntityDictionary::new());
    dictionary
        .bind_descriptor(
            EntityDescriptor::new("invoice")
                .id("id", DataType::Integer)
                .generated_id()
                .audit(AuditDescriptor::on(AuditAction::Create, 1, "{type} created by {user}")),
        )
        .unwrap();
    let audit = Arc::new(RecordingAuditLogger::default());
    let store = Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary)));
    let gate = Gate::new(store.clone(), dictionary).with_audit_logger(audit.clone());

    let request = gate.handle_request(false, User::named("alice"), Uuid::new_v4(), |scope| async move {
        PersistentResource::create_object(&scope, "invoice", None, None).await?;
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok::<_, GateError>(())
    });
    let outcome = tokio::time::timeout(Duration::from_millis(50), request).await;

    assert!(outcome.is_err());
    assert!(gate.registry().running_transactions().await.is_empty());
    assert!(audit.pending.lock().unwrap().is_empty());
    assert!(audit.committed.lock().unwrap().is_empty());
    assert_eq!(store.count("invoice").await, 0);
}

// ============================================================================
// Client uuids
// ============================================================================

fn family() -> Arc<EntityDictionary> {
    let dictionary = Arc::new(EntityDictionary::new());
    dictionary
        .bind_descriptor(
            EntityDescriptor::new("parent")
                .id("id", DataType::Integer)
                .generated_id()
                .attribute("name", DataType::Text)
                .one_to_one("child", "child"),
        )
        .unwrap();
    dictionary
        .bind_descriptor(
            EntityDescriptor::new("child")
                .id("id", DataType::Integer)
                .generated_id()
                .attribute("name", DataType::Text)
                .relationship(RelationshipDescriptor::one_to_one("parent", "parent").mapped_by("child")),
        )
        .unwrap();
    dictionary
}

#[tokio::test]
async fn test_objects_created_with_uuids_link_both_ways() {
    let dictionary = family();
    let store = Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary)));
    let gate = Gate::new(store.clone(), dictionary);

    let response = gate
        .handle_request(false, User::anonymous(), Uuid::new_v4(), |scope| async move {
            let parent = PersistentResource::create_object(&scope, "parent", None, Some("p-uuid")).await?;
            parent.update_attribute("name", "Pat")?;
            let child = PersistentResource::create_object(&scope, "child", Some(&parent), Some("c-uuid")).await?;
            child.update_attribute("name", "Kit")?;
            parent.update_relation("child", vec![child]).await?;

            // Lookups by uuid resolve before any id is assigned
            let mut projection = EntityProjection::new("child");
            let found = PersistentResource::load_records(&mut projection, &["c-uuid".to_string()], &scope).await?;
            let back = found[0].get_relation("parent").await?;
            Ok::<_, GateError>((found.len(), back[0].uuid().map(str::to_string), parent.id()?))
        })
        .await;
    assert_eq!(response.result.unwrap(), (1, Some("p-uuid".to_string()), None));
    assert_eq!(store.count("parent").await, 1);
    assert_eq!(store.count("child").await, 1);

    let response = gate
        .handle_request(true, User::anonymous(), Uuid::new_v4(), |scope| async move {
            let parent = PersistentResource::load_record(&EntityProjection::new("parent"), "1", &scope).await?;
            let child = parent.get_relation("child").await?;
            let back = child[0].get_relation("parent").await?;
            Ok::<_, GateError>((child[0].get_attribute("name")?, back[0].display_id()))
        })
        .await;
    assert_eq!(response.result.unwrap(), (Value::Text("Kit".into()), "1".to_string()));
}

fn zoo() -> Arc<EntityDictionary> {
    let dictionary = Arc::new(EntityDictionary::new());
    dictionary
        .bind_descriptor(
            EntityDescriptor::new("animal")
                .id("id", DataType::Text)
                .attribute("name", DataType::Text),
        )
        .unwrap();
    dictionary
        .bind_descriptor(EntityDescriptor::new("dog").supertype("animal"))
        .unwrap();
    dictionary
}

#[tokio::test]
async fn test_uuid_registered_under_subtype_resolves_through_supertype() {
    let dictionary = zoo();
    let store = InMemoryDataStore::new(Arc::clone(&dictionary));
    let scope = RequestScope::builder(store.begin_transaction().await.unwrap(), dictionary).build();

    let rex = Entity::new("dog");
    scope.set_uuid_for_object("dog", "rex-uuid", &rex).unwrap();
    assert_eq!(scope.get_object_by_id("animal", "rex-uuid").unwrap(), Some(rex.clone()));
    assert_eq!(scope.get_object_by_id("dog", "rex-uuid").unwrap(), Some(rex.clone()));
    assert_eq!(scope.get_uuid_for(&rex).unwrap(), Some("rex-uuid".to_string()));

    // Registered as a plain animal: nothing says it is a dog
    let blob = Entity::new("animal");
    scope.set_uuid_for_object("animal", "blob-uuid", &blob).unwrap();
    assert_eq!(scope.get_object_by_id("animal", "blob-uuid").unwrap(), Some(blob));
    assert_eq!(scope.get_object_by_id("dog", "blob-uuid").unwrap(), None);
}

#[tokio::test]
async fn test_loaded_subtype_is_cached_for_supertype_lookups() {
    let dictionary = zoo();
    let gate = Gate::new(Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary))), dictionary);

    gate.handle_request(false, User::anonymous(), Uuid::new_v4(), |scope| async move {
        PersistentResource::create_object(&scope, "dog", None, Some("rex")).await?;
        PersistentResource::create_object(&scope, "dog", None, Some("fido")).await?;
        Ok::<_, GateError>(())
    })
    .await
    .result
    .unwrap();

    let response = gate
        .handle_request(true, User::anonymous(), Uuid::new_v4(), |scope| async move {
            let rex = PersistentResource::load_record(&EntityProjection::new("dog"), "rex", &scope).await?;
            let as_animal = scope.get_object_by_id("animal", "rex")?;
            let reloaded = PersistentResource::load_record(&EntityProjection::new("animal"), "rex", &scope).await?;
            let subtype_hit = as_animal.as_ref() == Some(rex.entity()) && reloaded.entity() == rex.entity();

            let fido = PersistentResource::load_record(&EntityProjection::new("animal"), "fido", &scope).await?;
            let dog_miss = scope.get_object_by_id("dog", "fido")?.is_none();
            let as_dog = PersistentResource::load_record(&EntityProjection::new("dog"), "fido", &scope).await?;
            Ok::<_, GateError>((subtype_hit, dog_miss, as_dog.entity() == fido.entity(), as_dog.type_name().to_string()))
        })
        .await;

    assert_eq!(response.result.unwrap(), (true, true, true, "dog".to_string()));
}
