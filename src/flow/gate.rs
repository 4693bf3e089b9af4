// ============================================================================
// Request flow
// ============================================================================
//
// One request, one pass:
//
//   begin -> register -> scope -> handler -> tx.pre_commit
//     -> pre-security triggers -> commit checks -> save/create
//     -> pre-flush triggers -> tx.flush -> pre-commit triggers
//     -> audit commit -> tx.commit -> post-commit triggers
//
// The finally step lives in the request guard's Drop: it deregisters the
// request, clears buffered audit messages, releases the scope and closes the
// transaction on success, failure and a dropped request future alike.
//
// ============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use super::audit::{AuditLogger, TracingAuditLogger};
use super::error_mapper::{DefaultErrorMapper, ErrorMapper, ErrorResponse};
use super::query_logger::{NoopQueryLogger, QueryLogger};
use super::registry::TransactionRegistry;
use super::settings::GateSettings;
use crate::core::Result;
use crate::datastore::{DataStore, DataStoreTransaction};
use crate::dictionary::EntityDictionary;
use crate::request::RequestScope;
use crate::security::User;

/// Outcome of one request.
#[derive(Debug)]
pub struct GateResponse<T> {
    pub status: u16,
    pub result: std::result::Result<T, ErrorResponse>,
}

impl<T> GateResponse<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-request cleanup, run exactly once when the request leaves scope.
struct RequestGuard {
    request_id: Uuid,
    transaction: Arc<dyn DataStoreTransaction>,
    registry: TransactionRegistry,
    audit_logger: Arc<dyn AuditLogger>,
    scope: Option<Arc<RequestScope>>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.request_id);
        if let Err(e) = self.audit_logger.clear(self.request_id) {
            warn!(error = %e, "failed to clear audit messages");
        }
        if let Some(scope) = self.scope.take() {
            if let Err(e) = scope.permission_executor().log_check_stats() {
                warn!(error = %e, "failed to log permission statistics");
            }
            if let Err(e) = scope.release() {
                warn!(error = %e, "failed to release request scope");
            }
        }
        if let Err(e) = self.transaction.close() {
            warn!(error = %e, "failed to close transaction");
        }
    }
}

pub struct Gate {
    store: Arc<dyn DataStore>,
    dictionary: Arc<EntityDictionary>,
    settings: GateSettings,
    registry: TransactionRegistry,
    audit_logger: Arc<dyn AuditLogger>,
    query_logger: Arc<dyn QueryLogger>,
    error_mapper: Arc<dyn ErrorMapper>,
}

impl Gate {
    pub fn new(store: Arc<dyn DataStore>, dictionary: Arc<EntityDictionary>) -> Self {
        Self {
            store,
            dictionary,
            settings: GateSettings::default(),
            registry: TransactionRegistry::new(),
            audit_logger: Arc::new(TracingAuditLogger::new()),
            query_logger: Arc::new(NoopQueryLogger),
            error_mapper: Arc::new(DefaultErrorMapper),
        }
    }

    pub fn with_settings(mut self, settings: GateSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    pub fn with_query_logger(mut self, logger: Arc<dyn QueryLogger>) -> Self {
        self.query_logger = logger;
        self
    }

    pub fn with_error_mapper(mut self, mapper: Arc<dyn ErrorMapper>) -> Self {
        self.error_mapper = mapper;
        self
    }

    pub fn dictionary(&self) -> &Arc<EntityDictionary> {
        &self.dictionary
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    pub fn query_logger(&self) -> &Arc<dyn QueryLogger> {
        &self.query_logger
    }

    /// Cancels a running request's transaction. Already applied in-memory
    /// mutations are not rolled back.
    pub async fn cancel(&self, request_id: Uuid) -> bool {
        let cancelled = self.registry.cancel(request_id).await;
        if cancelled {
            self.query_logger.cancel_query(request_id);
        }
        cancelled
    }

    /// Runs `handler` inside a fresh transaction and commits on success.
    ///
    /// # Example
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use modelgate::{DataType, EntityDescriptor, EntityDictionary, Gate, GateError, InMemoryDataStore, PersistentResource, User};
    /// # tokio_test::block_on(async {
    /// let dictionary = Arc::new(EntityDictionary::new());
    /// dictionary.bind_descriptor(EntityDescriptor::new("book").id("id", DataType::Integer).generated_id())?;
    /// let gate = Gate::new(Arc::new(InMemoryDataStore::new(Arc::clone(&dictionary))), dictionary);
    ///
    /// let response = gate
    ///     .handle_request(false, User::anonymous(), uuid::Uuid::new_v4(), |scope| async move {
    ///         PersistentResource::create_object(&scope, "book", None, None).await?;
    ///         Ok::<_, GateError>(())
    ///     })
    ///     .await;
    /// assert_eq!(response.status, 200);
    /// # Ok::<(), GateError>(())
    /// # }).unwrap();
    /// ```
    pub async fn handle_request<T, F, Fut>(
        &self,
        read_only: bool,
        user: User,
        request_id: Uuid,
        handler: F,
    ) -> GateResponse<T>
    where
        F: FnOnce(Arc<RequestScope>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let span = info_span!("request", request_id = %request_id, read_only);
        self.handle_in_span(read_only, user, request_id, handler)
            .instrument(span)
            .await
    }

    async fn handle_in_span<T, F, Fut>(
        &self,
        read_only: bool,
        user: User,
        request_id: Uuid,
        handler: F,
    ) -> GateResponse<T>
    where
        F: FnOnce(Arc<RequestScope>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // Verbosity is fixed before anything runs
        let verbose = self.settings.verbose_errors;
        let started = Instant::now();

        let begin = if read_only {
            self.store.begin_read_transaction().await
        } else {
            self.store.begin_transaction().await
        };
        let transaction = match begin {
            Ok(transaction) => transaction,
            Err(e) => {
                self.clear_audit(request_id);
                return self.respond(Err(e), verbose);
            }
        };
        let mut guard = RequestGuard {
            request_id,
            transaction: Arc::clone(&transaction),
            registry: self.registry.clone(),
            audit_logger: Arc::clone(&self.audit_logger),
            scope: None,
        };

        self.registry
            .add_running_transaction(request_id, Arc::clone(&transaction))
            .await;

        let scope = RequestScope::builder(transaction, Arc::clone(&self.dictionary))
            .request_id(request_id)
            .user(user)
            .settings(self.settings.clone())
            .audit_logger(Arc::clone(&self.audit_logger))
            .read_only(read_only)
            .build();
        guard.scope = Some(Arc::clone(&scope));

        let outcome = self.run(&scope, read_only, handler).await;
        drop(scope);
        drop(guard);

        let elapsed = started.elapsed();
        if elapsed > self.settings.slow_request_threshold {
            warn!(elapsed = ?elapsed, "slow request");
        }
        self.respond(outcome, verbose)
    }

    async fn run<T, F, Fut>(&self, scope: &Arc<RequestScope>, read_only: bool, handler: F) -> Result<T>
    where
        F: FnOnce(Arc<RequestScope>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let value = handler(Arc::clone(scope)).await?;
        let transaction = scope.transaction();

        transaction.pre_commit().await?;
        scope.run_queued_pre_security_triggers()?;
        scope.permission_executor().execute_commit_checks()?;
        if !read_only {
            scope.save_or_create_objects().await?;
        }
        scope.run_queued_pre_flush_triggers()?;
        transaction.flush().await?;
        scope.run_queued_pre_commit_triggers()?;
        if let Err(e) = self.audit_logger.commit(scope.request_id()) {
            warn!(error = %e, "audit commit failed");
        }
        transaction.commit().await?;
        scope.run_queued_post_commit_triggers()?;

        debug!("request committed");
        Ok(value)
    }

    fn clear_audit(&self, request_id: Uuid) {
        if let Err(e) = self.audit_logger.clear(request_id) {
            warn!(error = %e, "failed to clear audit messages");
        }
    }

    fn respond<T>(&self, outcome: Result<T>, verbose: bool) -> GateResponse<T> {
        match outcome {
            Ok(value) => GateResponse {
                status: 200,
                result: Ok(value),
            },
            Err(e) => {
                let response = self.error_mapper.map(&e, verbose);
                GateResponse {
                    status: response.status,
                    result: Err(response),
                }
            }
        }
    }
}
