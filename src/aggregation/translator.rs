// ============================================================================
// SQL translation
// ============================================================================
//
// Clause order is fixed:
//
//   SELECT [DISTINCT] projections FROM source
//   LEFT OUTER JOIN ... WHERE ... GROUP BY ... HAVING ... ORDER BY ... LIMIT
//
// ============================================================================

use std::fmt;
use std::sync::Arc;

use super::dialect::SqlDialect;
use super::expression::{physical_source, ExpressionParser, JoinClause};
use super::query::{ColumnProjection, Query, Queryable};
use super::table::{ColumnKind, MetaDataStore, SqlTable};
use crate::core::{GateError, Result, Value};
use crate::filter::{FilterExpression, FilterPredicate, Operator};
use crate::request::SortOrder;

const PAGE_TOTALS_ALIAS: &str = "pagination_subquery";

/// Dialect SQL with its named parameters, in order of appearance.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeQuery {
    pub sql: String,
    pub parameters: Vec<(String, Value)>,
}

impl fmt::Display for NativeQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)
    }
}

#[derive(Clone, Copy)]
enum Stage {
    Where,
    Having,
}

pub struct QueryTranslator<'a> {
    store: &'a MetaDataStore,
    dialect: &'a dyn SqlDialect,
    parameters: Vec<(String, Value)>,
}

impl<'a> QueryTranslator<'a> {
    pub fn new(store: &'a MetaDataStore, dialect: &'a dyn SqlDialect) -> Self {
        Self {
            store,
            dialect,
            parameters: Vec::new(),
        }
    }

    pub fn translate(mut self, query: &Query) -> Result<NativeQuery> {
        let sql = self.render(query, true)?;
        Ok(NativeQuery {
            sql,
            parameters: self.parameters,
        })
    }

    /// Row count of the unpaginated result.
    pub fn translate_page_totals(mut self, query: &Query) -> Result<NativeQuery> {
        let sql = self.render(query, false)?;
        Ok(NativeQuery {
            sql: format!(
                "SELECT COUNT(*) FROM ({}) AS {}",
                sql,
                self.dialect.quote(PAGE_TOTALS_ALIAS)
            ),
            parameters: self.parameters,
        })
    }

    fn render(&mut self, query: &Query, paginate: bool) -> Result<String> {
        let store = self.store;
        let dialect = self.dialect;
        let parser = ExpressionParser::new(store);
        let table: Arc<SqlTable> = Arc::clone(query.source.root_table());
        let alias = query.source_alias();

        if query.projections().next().is_none() {
            return Err(GateError::BadRequest(format!(
                "query on '{}' projects no columns",
                table.name
            )));
        }

        let from = match &query.source {
            Queryable::Table(source) => format!(
                "FROM {} AS {}",
                physical_source(&source.physical, dialect),
                dialect.quote(&alias)
            ),
            Queryable::Query(inner) => {
                format!("FROM ({}) AS {}", self.render(inner, true)?, dialect.quote(&alias))
            }
        };

        let mut joins: Vec<JoinClause> = Vec::new();
        let mut columns = Vec::new();
        for projection in query.projections() {
            parser.joins(&table, &alias, &projection.expression, dialect, &mut joins)?;
            columns.push(format!(
                "{} AS {}",
                self.projection_sql(&parser, &table, &alias, projection)?,
                dialect.quote(&projection.name)
            ));
        }

        let distinct = if query.metrics.is_empty() { "DISTINCT " } else { "" };
        let mut clauses = vec![format!("SELECT {}{}", distinct, columns.join(", ")), from];

        let where_sql = match &query.where_filter {
            Some(filter) => {
                for predicate in filter.predicates() {
                    let template = where_template(&parser, query, &table, predicate.field_name())?;
                    parser.joins(&table, &alias, &template, dialect, &mut joins)?;
                }
                Some(self.filter_sql(&parser, query, &table, &alias, filter, Stage::Where)?)
            }
            None => None,
        };

        clauses.extend(joins.into_iter().map(|join| join.sql));
        if let Some(where_sql) = where_sql {
            clauses.push(format!("WHERE {}", where_sql));
        }

        if !query.metrics.is_empty() {
            let group_by = query
                .dimension_projections()
                .map(|p| self.projection_sql(&parser, &table, &alias, p))
                .collect::<Result<Vec<_>>>()?;
            if !group_by.is_empty() {
                clauses.push(format!("GROUP BY {}", group_by.join(", ")));
            }
        }

        if let Some(having) = &query.having_filter {
            let having_sql = self.filter_sql(&parser, query, &table, &alias, having, Stage::Having)?;
            clauses.push(format!("HAVING {}", having_sql));
        }

        if paginate {
            if let Some(sorting) = query.sorting.as_ref().filter(|s| !s.is_default()) {
                let mut keys = Vec::with_capacity(sorting.keys.len());
                for (path, order) in &sorting.keys {
                    let projection = query.projection(path.field_name()).ok_or_else(|| {
                        GateError::BadRequest(format!(
                            "cannot sort by '{}': column is not projected",
                            path.field_name()
                        ))
                    })?;
                    let direction = match order {
                        SortOrder::Asc => "ASC",
                        SortOrder::Desc => "DESC",
                    };
                    keys.push(format!(
                        "{} {}",
                        self.projection_sql(&parser, &table, &alias, projection)?,
                        direction
                    ));
                }
                clauses.push(format!("ORDER BY {}", keys.join(", ")));
            }
            if let Some(page) = &query.pagination {
                clauses.push(dialect.pagination(page.offset, page.limit));
            }
        }

        Ok(clauses.join(" "))
    }

    fn projection_sql(
        &self,
        parser: &ExpressionParser<'_>,
        table: &SqlTable,
        alias: &str,
        projection: &ColumnProjection,
    ) -> Result<String> {
        let sql = parser.resolve(table, alias, &projection.expression, self.dialect)?;
        Ok(match projection.kind {
            ColumnKind::TimeDimension(grain) => self.dialect.time_grain(grain, &sql),
            _ => sql,
        })
    }

    fn filter_sql(
        &mut self,
        parser: &ExpressionParser<'_>,
        query: &Query,
        table: &SqlTable,
        alias: &str,
        filter: &FilterExpression,
        stage: Stage,
    ) -> Result<String> {
        match filter {
            FilterExpression::Predicate(predicate) => {
                let column = match stage {
                    Stage::Where => {
                        let template = where_template(parser, query, table, predicate.field_name())?;
                        parser.resolve(table, alias, &template, self.dialect)?
                    }
                    Stage::Having => {
                        let metric = query
                            .metrics
                            .iter()
                            .find(|m| m.name == predicate.field_name())
                            .ok_or_else(|| {
                                GateError::BadRequest(format!(
                                    "HAVING on '{}' requires the metric to be projected",
                                    predicate.field_name()
                                ))
                            })?;
                        self.projection_sql(parser, table, alias, metric)?
                    }
                };
                self.predicate_sql(&column, predicate)
            }
            FilterExpression::And(l, r) => Ok(format!(
                "({} AND {})",
                self.filter_sql(parser, query, table, alias, l, stage)?,
                self.filter_sql(parser, query, table, alias, r, stage)?
            )),
            FilterExpression::Or(l, r) => Ok(format!(
                "({} OR {})",
                self.filter_sql(parser, query, table, alias, l, stage)?,
                self.filter_sql(parser, query, table, alias, r, stage)?
            )),
            FilterExpression::Not(e) => Ok(format!(
                "NOT ({})",
                self.filter_sql(parser, query, table, alias, e, stage)?
            )),
        }
    }

    fn predicate_sql(&mut self, column: &str, predicate: &FilterPredicate) -> Result<String> {
        let sql = match predicate.operator {
            Operator::In | Operator::NotIn if predicate.values.is_empty() => {
                let always = if predicate.operator == Operator::In { "(1 = 0)" } else { "(1 = 1)" };
                always.to_string()
            }
            Operator::In => format!("{} IN ({})", column, self.bind_all(&predicate.values)),
            Operator::NotIn => format!("{} NOT IN ({})", column, self.bind_all(&predicate.values)),
            Operator::Lt => format!("{} < {}", column, self.bind_single(predicate)?),
            Operator::Le => format!("{} <= {}", column, self.bind_single(predicate)?),
            Operator::Gt => format!("{} > {}", column, self.bind_single(predicate)?),
            Operator::Ge => format!("{} >= {}", column, self.bind_single(predicate)?),
            Operator::IsNull => format!("{} IS NULL", column),
            Operator::NotNull => format!("{} IS NOT NULL", column),
            Operator::Prefix => format!("{} LIKE CONCAT({}, '%')", column, self.bind_single(predicate)?),
            Operator::Postfix => format!("{} LIKE CONCAT('%', {})", column, self.bind_single(predicate)?),
            Operator::Infix => format!("{} LIKE CONCAT('%', {}, '%')", column, self.bind_single(predicate)?),
            Operator::PrefixCaseInsensitive => format!(
                "LOWER({}) LIKE CONCAT(LOWER({}), '%')",
                column,
                self.bind_single(predicate)?
            ),
            Operator::InfixCaseInsensitive => format!(
                "LOWER({}) LIKE CONCAT('%', LOWER({}), '%')",
                column,
                self.bind_single(predicate)?
            ),
            Operator::True => "(1 = 1)".to_string(),
            Operator::False => "(1 = 0)".to_string(),
        };
        Ok(sql)
    }

    fn bind(&mut self, value: Value) -> String {
        let name = format!("p{}", self.parameters.len());
        let placeholder = format!(":{}", name);
        self.parameters.push((name, value));
        placeholder
    }

    fn bind_all(&mut self, values: &[Value]) -> String {
        values
            .iter()
            .map(|v| self.bind(v.clone()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn bind_single(&mut self, predicate: &FilterPredicate) -> Result<String> {
        match predicate.values.as_slice() {
            [value] => Ok(self.bind(value.clone())),
            _ => Err(GateError::BadRequest(format!(
                "operator {} on '{}' takes exactly one value",
                predicate.operator.keyword(),
                predicate.field_name()
            ))),
        }
    }
}

/// Template of a WHERE column. Over a nested source, join-free columns were
/// projected by the inner query under their own name.
fn where_template(parser: &ExpressionParser<'_>, query: &Query, table: &SqlTable, field: &str) -> Result<String> {
    let column = table.require_column(field)?;
    if column.kind.is_metric() {
        return Err(GateError::BadRequest(format!(
            "metric '{}' cannot be filtered in WHERE",
            field
        )));
    }
    if query.is_nested() && !parser.requires_join(table, &column.expression)? {
        return Ok(format!("{{{{${}}}}}", field));
    }
    Ok(column.expression.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::dialect::GenericDialect;
    use crate::aggregation::table::{ColumnDefinition, TimeGrain};
    use crate::filter::Path;
    use crate::request::Pagination;

    fn store() -> MetaDataStore {
        let store = MetaDataStore::new();
        store
            .with_table(
                SqlTable::new("stats", "player_stats")
                    .with_alias("s")
                    .with_column(ColumnDefinition::metric("total", "SUM({{$score}})"))
                    .with_column(ColumnDefinition::dimension("name", "{{$player_name}}"))
                    .with_column(ColumnDefinition::time_dimension("day", TimeGrain::Day, "{{$recorded}}")),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_flat_query() {
        let store = store();
        let table = store.table("stats").unwrap();
        let query = Query::builder(table)
            .metric("total")
            .dimension("name")
            .dimension("day")
            .filter(FilterExpression::predicate(
                Path::field("stats", "name"),
                Operator::Prefix,
                vec![Value::Text("A".into())],
            ))
            .having(FilterExpression::predicate(
                Path::field("stats", "total"),
                Operator::Gt,
                vec![Value::Integer(10)],
            ))
            .sort("total", SortOrder::Desc)
            .paginate(Pagination::new(20, 10))
            .build()
            .unwrap();

        let native = QueryTranslator::new(&store, &GenericDialect).translate(&query).unwrap();
        assert_eq!(
            native.sql,
            "SELECT SUM(\"s\".\"score\") AS \"total\", \"s\".\"player_name\" AS \"name\", \
             DATE_TRUNC('day', \"s\".\"recorded\") AS \"day\" \
             FROM \"player_stats\" AS \"s\" \
             WHERE \"s\".\"player_name\" LIKE CONCAT(:p0, '%') \
             GROUP BY \"s\".\"player_name\", DATE_TRUNC('day', \"s\".\"recorded\") \
             HAVING SUM(\"s\".\"score\") > :p1 \
             ORDER BY SUM(\"s\".\"score\") DESC \
             LIMIT 10 OFFSET 20"
        );
        assert_eq!(
            native.parameters,
            vec![
                ("p0".to_string(), Value::Text("A".into())),
                ("p1".to_string(), Value::Integer(10)),
            ]
        );
    }

    #[test]
    fn test_distinct_without_metrics() {
        let store = store();
        let query = Query::builder(store.table("stats").unwrap())
            .dimension("name")
            .build()
            .unwrap();

        let native = QueryTranslator::new(&store, &GenericDialect).translate(&query).unwrap();
        assert_eq!(
            native.sql,
            "SELECT DISTINCT \"s\".\"player_name\" AS \"name\" FROM \"player_stats\" AS \"s\""
        );
    }

    #[test]
    fn test_sort_on_unprojected_column_is_rejected() {
        let store = store();
        let query = Query::builder(store.table("stats").unwrap())
            .metric("total")
            .sort("name", SortOrder::Asc)
            .build()
            .unwrap();

        let result = QueryTranslator::new(&store, &GenericDialect).translate(&query);
        assert!(matches!(result, Err(GateError::BadRequest(_))));
    }

    #[test]
    fn test_page_totals() {
        let store = store();
        let query = Query::builder(store.table("stats").unwrap())
            .metric("total")
            .paginate(Pagination::new(0, 5).with_page_totals())
            .build()
            .unwrap();

        let native = QueryTranslator::new(&store, &GenericDialect)
            .translate_page_totals(&query)
            .unwrap();
        assert_eq!(
            native.sql,
            "SELECT COUNT(*) FROM (SELECT SUM(\"s\".\"score\") AS \"total\" FROM \"player_stats\" AS \"s\") \
             AS \"pagination_subquery\""
        );
    }
}
