// ============================================================================
// SQL query engine
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::dialect::SqlDialect;
use super::optimizer::{AggregateBeforeJoinOptimizer, Optimizer};
use super::query::Query;
use super::result::{AggregationResult, QueryResult};
use super::table::MetaDataStore;
use super::translator::{NativeQuery, QueryTranslator};
use crate::core::{GateError, Result};
use crate::flow::{NoopQueryLogger, QueryLogger};

/// Executes native SQL. Drivers live behind this seam.
#[async_trait]
pub trait SqlRunner: Send + Sync {
    async fn run(&self, query: &NativeQuery) -> Result<QueryResult>;
}

pub struct SqlQueryEngine {
    store: Arc<MetaDataStore>,
    dialect: Arc<dyn SqlDialect>,
    runner: Arc<dyn SqlRunner>,
    optimizers: Vec<Arc<dyn Optimizer>>,
    query_logger: Arc<dyn QueryLogger>,
}

impl SqlQueryEngine {
    pub fn new(store: Arc<MetaDataStore>, dialect: Arc<dyn SqlDialect>, runner: Arc<dyn SqlRunner>) -> Self {
        Self {
            store,
            dialect,
            runner,
            optimizers: vec![Arc::new(AggregateBeforeJoinOptimizer::new())],
            query_logger: Arc::new(NoopQueryLogger),
        }
    }

    pub fn with_optimizers(mut self, optimizers: Vec<Arc<dyn Optimizer>>) -> Self {
        self.optimizers = optimizers;
        self
    }

    pub fn with_query_logger(mut self, logger: Arc<dyn QueryLogger>) -> Self {
        self.query_logger = logger;
        self
    }

    pub fn store(&self) -> &Arc<MetaDataStore> {
        &self.store
    }

    pub fn dialect(&self) -> &Arc<dyn SqlDialect> {
        &self.dialect
    }

    /// Runs every applicable optimizer in order.
    pub fn plan(&self, query: Query) -> Result<Query> {
        let mut planned = query;
        for optimizer in &self.optimizers {
            if optimizer.can_optimize(&planned, &self.store, self.dialect.as_ref())? {
                debug!(optimizer = optimizer.name(), "applying optimizer");
                planned = optimizer.optimize(planned, &self.store, self.dialect.as_ref())?;
            }
        }
        Ok(planned)
    }

    /// Planned SQL, followed by the page-totals query when one is requested.
    pub fn explain(&self, query: &Query) -> Result<Vec<NativeQuery>> {
        let planned = self.plan(query.clone())?;
        let mut queries = vec![self.translator().translate(&planned)?];
        if planned.pagination.as_ref().is_some_and(|p| p.return_page_totals) {
            queries.push(self.translator().translate_page_totals(&planned)?);
        }
        Ok(queries)
    }

    pub async fn execute(&self, request_id: Uuid, query: &Query) -> Result<AggregationResult> {
        self.query_logger.accept_query(request_id, &query.to_string());
        let started = Instant::now();

        let mut queries = self.explain(query)?.into_iter();
        let main = queries
            .next()
            .ok_or_else(|| GateError::InternalServerError("no SQL produced for query".into()))?;

        self.query_logger.process_query(request_id, &main.sql);
        let result = self.runner.run(&main).await.inspect_err(|e| {
            warn!(request_id = %request_id, error = %e, "aggregation query failed");
        })?;

        let page_totals = match queries.next() {
            Some(count) => {
                self.query_logger.process_query(request_id, &count.sql);
                let totals = self.runner.run(&count).await?;
                let total = totals.scalar()?.as_i64().ok_or_else(|| {
                    GateError::InternalServerError("page totals query returned a non-integer".into())
                })?;
                Some(usize::try_from(total).unwrap_or(0))
            }
            None => None,
        };

        self.query_logger
            .complete_query(request_id, result.row_count(), started.elapsed());
        Ok(AggregationResult { result, page_totals })
    }

    fn translator(&self) -> QueryTranslator<'_> {
        QueryTranslator::new(&self.store, self.dialect.as_ref())
    }
}
