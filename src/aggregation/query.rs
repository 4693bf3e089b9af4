// ============================================================================
// Analytic queries
// ============================================================================

use std::fmt;
use std::sync::Arc;

use super::dialect::SqlDialect;
use super::expression::ExpressionParser;
use super::table::{ColumnKind, MetaDataStore, SqlTable};
use crate::core::{GateError, Result};
use crate::filter::{FilterExpression, FilterExpressionVisitor, FilterPredicate, Path};
use crate::request::{Pagination, SortOrder, Sorting};

/// Prefix of inner-query aliases for re-aggregated metrics.
pub const INNER_AGG_PREFIX: &str = "INNER_AGG_";

/// Aggregates that can be computed in two stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Min,
    Max,
    Count,
}

impl Aggregate {
    fn parse(function: &str) -> Option<Self> {
        match function.trim().to_ascii_uppercase().as_str() {
            "SUM" => Some(Self::Sum),
            "MIN" => Some(Self::Min),
            "MAX" => Some(Self::Max),
            "COUNT" => Some(Self::Count),
            _ => None,
        }
    }

    /// Aggregate applied over the inner results.
    pub fn outer(self) -> Self {
        match self {
            Self::Sum | Self::Count => Self::Sum,
            Self::Min => Self::Min,
            Self::Max => Self::Max,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Count => "COUNT",
        }
    }
}

/// Splits `FN(arg)` when the whole expression is one decomposable aggregate.
pub fn decompose_aggregate(expression: &str) -> Option<(Aggregate, &str)> {
    let trimmed = expression.trim();
    let open = trimmed.find('(')?;
    let aggregate = Aggregate::parse(&trimmed[..open])?;
    if !trimmed.ends_with(')') {
        return None;
    }

    // The first '(' has to close at the very end: SUM(a) / SUM(b) is not one call
    let mut depth = 0usize;
    for (i, ch) in trimmed.char_indices().skip(open) {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 && i != trimmed.len() - 1 {
                    return None;
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return None;
    }
    let argument = &trimmed[open + 1..trimmed.len() - 1];
    // Distinct counts do not add up across inner groups
    if is_distinct(argument) {
        return None;
    }
    Some((aggregate, argument))
}

fn is_distinct(argument: &str) -> bool {
    let argument = argument.trim_start();
    argument
        .get(..8)
        .is_some_and(|head| head.eq_ignore_ascii_case("DISTINCT"))
        && argument[8..].starts_with(|c: char| c.is_whitespace() || c == '(')
}

#[derive(Debug, Clone, PartialEq)]
pub enum Queryable {
    Table(Arc<SqlTable>),
    Query(Box<Query>),
}

impl Queryable {
    /// Table whose column and join definitions resolve templates.
    pub fn root_table(&self) -> &Arc<SqlTable> {
        match self {
            Self::Table(table) => table,
            Self::Query(query) => query.source.root_table(),
        }
    }

    pub fn alias(&self) -> String {
        match self {
            Self::Table(table) => table.alias.clone(),
            Self::Query(query) => format!("{}_inner", query.source.alias()),
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, Self::Query(_))
    }
}

/// One projected column: its output alias, kind and template.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnProjection {
    pub name: String,
    pub kind: ColumnKind,
    pub expression: String,
}

impl ColumnProjection {
    pub fn new(name: &str, kind: ColumnKind, expression: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            expression: expression.to_string(),
        }
    }

    /// Projection of a declared column.
    pub fn of(table: &SqlTable, name: &str) -> Result<Self> {
        let column = table.require_column(name)?;
        Ok(Self::new(&column.name, column.kind, &column.expression))
    }

    /// Reference to an already projected column of the source.
    fn placeholder(name: &str, kind: ColumnKind) -> Self {
        Self::new(name, kind, &format!("{{{{${}}}}}", name))
    }

    pub fn requires_join(&self, source: &Queryable, store: &MetaDataStore) -> Result<bool> {
        ExpressionParser::new(store).requires_join(source.root_table(), &self.expression)
    }

    /// Whether this projection can be split into an inner and an outer stage.
    pub fn can_nest(&self, source: &Queryable, store: &MetaDataStore, dialect: &dyn SqlDialect) -> Result<bool> {
        let parser = ExpressionParser::new(store);
        let table = source.root_table();
        if !self.kind.is_metric() {
            parser.parse(table, &self.expression)?;
            return Ok(true);
        }

        // Joins inside an aggregate could belong to either stage
        if parser.requires_join(table, &self.expression)? {
            return Ok(false);
        }
        if decompose_aggregate(&self.expression).is_none() {
            return Ok(false);
        }
        let sql = parser.resolve(table, &source.alias(), &self.expression, dialect)?;
        Ok(dialect.verify_expression(&sql).is_ok())
    }

    /// Splits into the outer projection and the inner projections feeding it.
    pub fn nest(
        &self,
        source: &Queryable,
        store: &MetaDataStore,
        join_in_outer: bool,
    ) -> Result<(ColumnProjection, Vec<ColumnProjection>)> {
        if self.kind.is_metric() {
            let (aggregate, _) = decompose_aggregate(&self.expression).ok_or_else(|| {
                GateError::BadRequest(format!("metric '{}' cannot be re-aggregated", self.name))
            })?;
            let inner_name = format!("{}{}", INNER_AGG_PREFIX, self.name);
            let inner = Self::new(&inner_name, ColumnKind::Metric, &self.expression);
            let outer = Self::new(
                &self.name,
                ColumnKind::Metric,
                &format!("{}({{{{${}}}}})", aggregate.outer().keyword(), inner_name),
            );
            return Ok((outer, vec![inner]));
        }

        let parser = ExpressionParser::new(store);
        let table = source.root_table();
        if join_in_outer && parser.requires_join(table, &self.expression)? {
            let inner = parser
                .physical_columns(table, &self.expression)?
                .into_iter()
                .map(|column| Self::new(&column, ColumnKind::Dimension, &format!("{{{{${}}}}}", column)))
                .collect();
            return Ok((self.clone(), inner));
        }

        // The inner stage already applied any time grain
        Ok((Self::placeholder(&self.name, ColumnKind::Dimension), vec![self.clone()]))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub source: Queryable,
    pub metrics: Vec<ColumnProjection>,
    pub dimensions: Vec<ColumnProjection>,
    pub time_dimensions: Vec<ColumnProjection>,
    pub where_filter: Option<FilterExpression>,
    pub having_filter: Option<FilterExpression>,
    pub sorting: Option<Sorting>,
    pub pagination: Option<Pagination>,
}

impl Query {
    pub fn builder(table: Arc<SqlTable>) -> QueryBuilder {
        QueryBuilder {
            table,
            metrics: Vec::new(),
            dimensions: Vec::new(),
            filter: None,
            having: None,
            sorting: None,
            pagination: None,
        }
    }

    pub fn is_nested(&self) -> bool {
        self.source.is_query()
    }

    pub fn source_alias(&self) -> String {
        self.source.alias()
    }

    pub fn projections(&self) -> impl Iterator<Item = &ColumnProjection> {
        self.metrics
            .iter()
            .chain(self.dimensions.iter())
            .chain(self.time_dimensions.iter())
    }

    pub fn dimension_projections(&self) -> impl Iterator<Item = &ColumnProjection> {
        self.dimensions.iter().chain(self.time_dimensions.iter())
    }

    pub fn projection(&self, name: &str) -> Option<&ColumnProjection> {
        self.projections().find(|p| p.name == name)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |projections: &[ColumnProjection]| {
            projections.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")
        };
        match &self.source {
            Queryable::Table(table) => write!(f, "{}", table.name)?,
            Queryable::Query(inner) => write!(f, "({})", inner)?,
        }
        write!(
            f,
            " [metrics: {}; dimensions: {}",
            names(&self.metrics),
            names(&self.dimensions)
        )?;
        if !self.time_dimensions.is_empty() {
            write!(f, "; time: {}", names(&self.time_dimensions))?;
        }
        if let Some(filter) = &self.where_filter {
            write!(f, "; where: {}", filter)?;
        }
        if let Some(filter) = &self.having_filter {
            write!(f, "; having: {}", filter)?;
        }
        write!(f, "]")
    }
}

pub struct QueryBuilder {
    table: Arc<SqlTable>,
    metrics: Vec<String>,
    dimensions: Vec<String>,
    filter: Option<FilterExpression>,
    having: Option<FilterExpression>,
    sorting: Option<Sorting>,
    pagination: Option<Pagination>,
}

impl QueryBuilder {
    pub fn metric(mut self, name: &str) -> Self {
        self.metrics.push(name.to_string());
        self
    }

    /// Adds a dimension or time dimension, by its declared kind.
    pub fn dimension(mut self, name: &str) -> Self {
        self.dimensions.push(name.to_string());
        self
    }

    /// Filter over any columns; metric predicates move to HAVING.
    pub fn filter(mut self, filter: FilterExpression) -> Self {
        self.filter = FilterExpression::and_optional(self.filter, Some(filter));
        self
    }

    pub fn having(mut self, filter: FilterExpression) -> Self {
        self.having = FilterExpression::and_optional(self.having, Some(filter));
        self
    }

    pub fn sort(mut self, column: &str, order: SortOrder) -> Self {
        let path = Path::field(&self.table.name, column);
        self.sorting = Some(self.sorting.unwrap_or_default().by(path, order));
        self
    }

    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }

    pub fn build(self) -> Result<Query> {
        let mut query = Query {
            source: Queryable::Table(Arc::clone(&self.table)),
            metrics: Vec::new(),
            dimensions: Vec::new(),
            time_dimensions: Vec::new(),
            where_filter: None,
            having_filter: self.having,
            sorting: self.sorting,
            pagination: self.pagination,
        };

        for name in &self.metrics {
            let projection = ColumnProjection::of(&self.table, name)?;
            if !projection.kind.is_metric() {
                return Err(GateError::BadRequest(format!("'{}' is not a metric", name)));
            }
            query.metrics.push(projection);
        }
        for name in &self.dimensions {
            let projection = ColumnProjection::of(&self.table, name)?;
            match projection.kind {
                ColumnKind::Metric => {
                    return Err(GateError::BadRequest(format!("'{}' is not a dimension", name)));
                }
                ColumnKind::TimeDimension(_) => query.time_dimensions.push(projection),
                ColumnKind::Dimension => query.dimensions.push(projection),
            }
        }

        if let Some(filter) = self.filter {
            let (where_filter, having) = split_where_having(&self.table, &filter)?;
            query.where_filter = where_filter;
            query.having_filter = FilterExpression::and_optional(query.having_filter, having);
        }
        Ok(query)
    }
}

/// Splits a filter into its dimension part (WHERE) and metric part (HAVING).
/// An OR mixing both kinds cannot be split.
pub fn split_where_having(
    table: &SqlTable,
    filter: &FilterExpression,
) -> Result<(Option<FilterExpression>, Option<FilterExpression>)> {
    let mut splitter = WhereHavingSplitter { table };
    let split = filter.normalize().accept(&mut splitter)?;
    Ok((split.dimensions, split.metrics))
}

struct WhereHaving {
    dimensions: Option<FilterExpression>,
    metrics: Option<FilterExpression>,
}

struct WhereHavingSplitter<'a> {
    table: &'a SqlTable,
}

impl WhereHavingSplitter<'_> {
    fn whole(&self, expression: FilterExpression, left: &WhereHaving, right: &WhereHaving) -> Result<WhereHaving> {
        let has_dimensions = left.dimensions.is_some() || right.dimensions.is_some();
        let has_metrics = left.metrics.is_some() || right.metrics.is_some();
        match (has_dimensions, has_metrics) {
            (true, true) => Err(GateError::BadRequest(format!(
                "cannot combine metric and dimension predicates in '{}'",
                expression
            ))),
            (_, true) => Ok(WhereHaving {
                dimensions: None,
                metrics: Some(expression),
            }),
            _ => Ok(WhereHaving {
                dimensions: Some(expression),
                metrics: None,
            }),
        }
    }
}

impl FilterExpressionVisitor<Result<WhereHaving>> for WhereHavingSplitter<'_> {
    fn visit_predicate(&mut self, predicate: &FilterPredicate) -> Result<WhereHaving> {
        let column = self.table.require_column(predicate.field_name())?;
        let expression = Some(FilterExpression::Predicate(predicate.clone()));
        Ok(if column.kind.is_metric() {
            WhereHaving { dimensions: None, metrics: expression }
        } else {
            WhereHaving { dimensions: expression, metrics: None }
        })
    }

    fn visit_and(&mut self, left: &FilterExpression, right: &FilterExpression) -> Result<WhereHaving> {
        let l = left.accept(self)?;
        let r = right.accept(self)?;
        Ok(WhereHaving {
            dimensions: FilterExpression::and_optional(l.dimensions, r.dimensions),
            metrics: FilterExpression::and_optional(l.metrics, r.metrics),
        })
    }

    fn visit_or(&mut self, left: &FilterExpression, right: &FilterExpression) -> Result<WhereHaving> {
        let l = left.accept(self)?;
        let r = right.accept(self)?;
        self.whole(FilterExpression::or(left.clone(), right.clone()), &l, &r)
    }

    fn visit_not(&mut self, expression: &FilterExpression) -> Result<WhereHaving> {
        let inner = expression.accept(self)?;
        let empty = WhereHaving { dimensions: None, metrics: None };
        self.whole(FilterExpression::negate(expression.clone()), &inner, &empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::table::ColumnDefinition;
    use crate::core::Value;
    use crate::filter::Operator;

    fn table() -> Arc<SqlTable> {
        Arc::new(
            SqlTable::new("playerStats", "playerStats")
                .with_column(ColumnDefinition::metric("highScore", "MAX({{$highScore}})"))
                .with_column(ColumnDefinition::dimension("overallRating", "{{$overallRating}}")),
        )
    }

    fn predicate(field: &str, operator: Operator, value: i64) -> FilterExpression {
        FilterExpression::predicate(Path::field("playerStats", field), operator, vec![Value::Integer(value)])
    }

    #[test]
    fn test_decompose_aggregate() {
        assert_eq!(decompose_aggregate("MAX({{$a}})"), Some((Aggregate::Max, "{{$a}}")));
        assert_eq!(decompose_aggregate(" count(x) "), Some((Aggregate::Count, "x")));
        assert_eq!(decompose_aggregate("SUM(a) / SUM(b)"), None);
        assert_eq!(decompose_aggregate("AVG(a)"), None);
        assert_eq!(decompose_aggregate("SUM(COALESCE(a, 0))"), Some((Aggregate::Sum, "COALESCE(a, 0)")));
        assert_eq!(Aggregate::Count.outer(), Aggregate::Sum);
    }

    #[test]
    fn test_distinct_aggregates_do_not_decompose() {
        assert_eq!(decompose_aggregate("COUNT(DISTINCT {{$player_id}})"), None);
        assert_eq!(decompose_aggregate("count( distinct(x) )"), None);
        assert_eq!(decompose_aggregate("SUM(DISTINCT x)"), None);
        assert_eq!(
            decompose_aggregate("COUNT({{$distinctive}})"),
            Some((Aggregate::Count, "{{$distinctive}}"))
        );
    }

    #[test]
    fn test_metric_predicates_move_to_having() {
        let query = Query::builder(table())
            .metric("highScore")
            .dimension("overallRating")
            .filter(FilterExpression::and(
                predicate("overallRating", Operator::Gt, 3),
                predicate("highScore", Operator::Gt, 100),
            ))
            .build()
            .unwrap();

        assert_eq!(query.where_filter, Some(predicate("overallRating", Operator::Gt, 3)));
        assert_eq!(query.having_filter, Some(predicate("highScore", Operator::Gt, 100)));
        assert!(!query.is_nested());
    }

    #[test]
    fn test_mixed_or_is_rejected() {
        let result = Query::builder(table())
            .metric("highScore")
            .filter(FilterExpression::or(
                predicate("overallRating", Operator::Gt, 3),
                predicate("highScore", Operator::Gt, 100),
            ))
            .build();
        assert!(matches!(result, Err(GateError::BadRequest(_))));
    }

    #[test]
    fn test_metric_nesting() {
        let store = MetaDataStore::new();
        let source = Queryable::Table(table());
        let metric = ColumnProjection::of(&table(), "highScore").unwrap();

        let (outer, inner) = metric.nest(&source, &store, true).unwrap();
        assert_eq!(outer.expression, "MAX({{$INNER_AGG_highScore}})");
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].name, "INNER_AGG_highScore");
        assert_eq!(inner[0].expression, "MAX({{$highScore}})");
    }

    #[test]
    fn test_passthrough_nesting() {
        let store = MetaDataStore::new();
        let source = Queryable::Table(table());
        let dimension = ColumnProjection::of(&table(), "overallRating").unwrap();

        let (outer, inner) = dimension.nest(&source, &store, true).unwrap();
        assert_eq!(outer.expression, "{{$overallRating}}");
        assert_eq!(inner, vec![dimension]);
    }
}
