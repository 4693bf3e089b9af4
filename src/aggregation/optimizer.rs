// ============================================================================
// Query optimizers
// ============================================================================

use tracing::debug;

use super::dialect::SqlDialect;
use super::query::{ColumnProjection, Query, Queryable};
use super::splitter::SubqueryFilterSplitter;
use super::table::{ColumnKind, MetaDataStore};
use crate::core::Result;

pub trait Optimizer: Send + Sync {
    fn name(&self) -> &str;

    fn can_optimize(&self, query: &Query, store: &MetaDataStore, dialect: &dyn SqlDialect) -> Result<bool>;

    fn optimize(&self, query: Query, store: &MetaDataStore, dialect: &dyn SqlDialect) -> Result<Query>;
}

/// Aggregates the fact table first and joins dimension tables onto the much
/// smaller aggregated result.
///
/// ```text
/// SELECT MAX(inner.INNER_AGG_highScore), inner.rating, country.iso_code
/// FROM (SELECT MAX(highScore) AS INNER_AGG_highScore, rating, country_id
///       FROM playerStats WHERE <join-free> GROUP BY rating, country_id) AS inner
/// LEFT OUTER JOIN countries ON inner.country_id = countries.id
/// WHERE <join-requiring> GROUP BY ...
/// ```
#[derive(Debug, Default)]
pub struct AggregateBeforeJoinOptimizer;

impl AggregateBeforeJoinOptimizer {
    pub fn new() -> Self {
        Self
    }
}

impl Optimizer for AggregateBeforeJoinOptimizer {
    fn name(&self) -> &str {
        "aggregate-before-join"
    }

    fn can_optimize(&self, query: &Query, store: &MetaDataStore, dialect: &dyn SqlDialect) -> Result<bool> {
        if query.is_nested() {
            return Ok(false);
        }
        for projection in query.projections() {
            if !projection.can_nest(&query.source, store, dialect)? {
                debug!(column = %projection.name, "projection cannot be nested");
                return Ok(false);
            }
        }

        let table = query.source.root_table();
        let split = SubqueryFilterSplitter::new(table, store).split(query.where_filter.as_ref())?;
        if split.outer.is_some() {
            return Ok(true);
        }
        for projection in query.projections() {
            if projection.requires_join(&query.source, store)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn optimize(&self, query: Query, store: &MetaDataStore, _dialect: &dyn SqlDialect) -> Result<Query> {
        let table = std::sync::Arc::clone(query.source.root_table());
        let split = SubqueryFilterSplitter::new(&table, store).split(query.where_filter.as_ref())?;

        let mut inner_projections: Vec<ColumnProjection> = Vec::new();
        let mut nest_all = |projections: &[ColumnProjection]| -> Result<Vec<ColumnProjection>> {
            let mut outer = Vec::with_capacity(projections.len());
            for projection in projections {
                let (o, inner) = projection.nest(&query.source, store, true)?;
                outer.push(o);
                extend_unique(&mut inner_projections, inner);
            }
            Ok(outer)
        };
        let metrics = nest_all(&query.metrics)?;
        let dimensions = nest_all(&query.dimensions)?;
        let time_dimensions = nest_all(&query.time_dimensions)?;

        // Columns of the outer WHERE have to survive the inner stage
        if let Some(outer_filter) = &split.outer {
            for predicate in outer_filter.predicates() {
                let column = ColumnProjection::of(&table, predicate.field_name())?;
                let as_dimension = ColumnProjection::new(&column.name, ColumnKind::Dimension, &column.expression);
                let (_, inner) = as_dimension.nest(&query.source, store, true)?;
                extend_unique(&mut inner_projections, inner);
            }
        }

        let mut inner = Query {
            source: Queryable::Table(table),
            metrics: Vec::new(),
            dimensions: Vec::new(),
            time_dimensions: Vec::new(),
            where_filter: split.inner,
            having_filter: None,
            sorting: None,
            pagination: None,
        };
        for projection in inner_projections {
            match projection.kind {
                ColumnKind::Metric => inner.metrics.push(projection),
                ColumnKind::Dimension => inner.dimensions.push(projection),
                ColumnKind::TimeDimension(_) => inner.time_dimensions.push(projection),
            }
        }

        debug!(optimizer = self.name(), inner = %inner, "query nested");
        Ok(Query {
            source: Queryable::Query(Box::new(inner)),
            metrics,
            dimensions,
            time_dimensions,
            where_filter: split.outer,
            having_filter: query.having_filter,
            sorting: query.sorting,
            pagination: query.pagination,
        })
    }
}

fn extend_unique(target: &mut Vec<ColumnProjection>, projections: Vec<ColumnProjection>) {
    for projection in projections {
        if !target.iter().any(|p| p.name == projection.name) {
            target.push(projection);
        }
    }
}
