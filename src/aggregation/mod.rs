// ============================================================================
// Aggregation
// ============================================================================
//
// Analytic queries over SQL tables: metadata, planning and translation.
//
//   Query --plan--> [optimizers] --translate--> NativeQuery --SqlRunner--> rows
//
// ============================================================================

pub mod dialect;
pub mod engine;
pub mod expression;
pub mod optimizer;
pub mod query;
pub mod result;
pub mod splitter;
pub mod table;
pub mod translator;

pub use dialect::{GenericDialect, H2Dialect, MySqlDialect, SqlDialect};
pub use engine::{SqlQueryEngine, SqlRunner};
pub use expression::{ExpressionParser, JoinClause, Reference};
pub use optimizer::{AggregateBeforeJoinOptimizer, Optimizer};
pub use query::{split_where_having, Aggregate, ColumnProjection, Query, QueryBuilder, Queryable};
pub use result::{AggregationResult, QueryResult, Row};
pub use splitter::{SplitFilter, SubqueryFilterSplitter};
pub use table::{
    ColumnDefinition, ColumnKind, JoinDefinition, JoinKind, MetaDataStore, SqlTable, TimeGrain,
};
pub use translator::{NativeQuery, QueryTranslator};
