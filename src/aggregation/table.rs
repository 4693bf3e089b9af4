// ============================================================================
// Analytic table metadata
// ============================================================================
//
// Column and join definitions carry expression templates:
//
//   {{$col}}        physical column of the table
//   {{name}}        logical column of the same table
//   {{join.col}}    logical column of a joined table
//   {{join.$col}}   physical column of a joined table
//
// ============================================================================

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{GateError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeGrain {
    Hour,
    Day,
    Month,
    Year,
}

impl TimeGrain {
    /// strftime pattern truncating to this grain.
    pub fn strftime_pattern(self) -> &'static str {
        match self {
            Self::Hour => "%Y-%m-%d %H:00:00",
            Self::Day => "%Y-%m-%d",
            Self::Month => "%Y-%m-01",
            Self::Year => "%Y-01-01",
        }
    }

    /// java.text pattern truncating to this grain.
    pub fn java_pattern(self) -> &'static str {
        match self {
            Self::Hour => "yyyy-MM-dd HH:00:00",
            Self::Day => "yyyy-MM-dd",
            Self::Month => "yyyy-MM-01",
            Self::Year => "yyyy-01-01",
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// Truncates a timestamp to the start of its grain period.
    pub fn truncate(self, value: chrono::NaiveDateTime) -> Option<chrono::NaiveDateTime> {
        use chrono::{Datelike, NaiveDate, Timelike};

        let date = match self {
            Self::Hour | Self::Day => value.date(),
            Self::Month => NaiveDate::from_ymd_opt(value.year(), value.month(), 1)?,
            Self::Year => NaiveDate::from_ymd_opt(value.year(), 1, 1)?,
        };
        let hour = if self == Self::Hour { value.hour() } else { 0 };
        date.and_hms_opt(hour, 0, 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Dimension,
    TimeDimension(TimeGrain),
    Metric,
}

impl ColumnKind {
    pub fn is_metric(self) -> bool {
        self == Self::Metric
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub kind: ColumnKind,
    pub expression: String,
}

impl ColumnDefinition {
    pub fn dimension(name: &str, expression: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ColumnKind::Dimension,
            expression: expression.to_string(),
        }
    }

    pub fn time_dimension(name: &str, grain: TimeGrain, expression: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ColumnKind::TimeDimension(grain),
            expression: expression.to_string(),
        }
    }

    pub fn metric(name: &str, expression: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ColumnKind::Metric,
            expression: expression.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Left,
    Inner,
    Right,
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => write!(f, "LEFT"),
            Self::Inner => write!(f, "INNER"),
            Self::Right => write!(f, "RIGHT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinDefinition {
    pub name: String,
    /// Name of the joined table in the metadata store
    pub target: String,
    #[serde(default = "default_join_kind")]
    pub kind: JoinKind,
    /// ON template, resolved against the joining table
    pub on: String,
}

fn default_join_kind() -> JoinKind {
    JoinKind::Left
}

impl JoinDefinition {
    pub fn left(name: &str, target: &str, on: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            kind: JoinKind::Left,
            on: on.to_string(),
        }
    }

    pub fn with_kind(mut self, kind: JoinKind) -> Self {
        self.kind = kind;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlTable {
    pub name: String,
    /// Physical table name or a parenthesised sub-select
    pub physical: String,
    pub alias: String,
    #[serde(default)]
    columns: Vec<ColumnDefinition>,
    #[serde(default)]
    joins: Vec<JoinDefinition>,
}

impl SqlTable {
    pub fn new(name: &str, physical: &str) -> Self {
        Self {
            name: name.to_string(),
            physical: physical.to_string(),
            alias: name.to_string(),
            columns: Vec::new(),
            joins: Vec::new(),
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = alias.to_string();
        self
    }

    pub fn with_column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_join(mut self, join: JoinDefinition) -> Self {
        self.joins.push(join);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn join(&self, name: &str) -> Option<&JoinDefinition> {
        self.joins.iter().find(|j| j.name == name)
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn joins(&self) -> &[JoinDefinition] {
        &self.joins
    }

    /// Column lookup failing with InvalidAttribute.
    pub fn require_column(&self, name: &str) -> Result<&ColumnDefinition> {
        self.column(name)
            .ok_or_else(|| GateError::invalid_attribute(&self.name, name))
    }

    fn validate(&self) -> Result<()> {
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(GateError::DuplicateMapping(format!(
                    "column '{}' declared twice in table '{}'",
                    column.name, self.name
                )));
            }
        }
        for join in &self.joins {
            // Composite keys and non-left joins are not supported
            if join.kind != JoinKind::Left {
                return Err(GateError::BadRequest(format!(
                    "{} join '{}' in table '{}' is not supported, only LEFT joins are",
                    join.kind, join.name, self.name
                )));
            }
            if self.column(&join.name).is_some() {
                return Err(GateError::DuplicateMapping(format!(
                    "join '{}' shadows a column of table '{}'",
                    join.name, self.name
                )));
            }
        }
        Ok(())
    }
}

/// Copy-on-write table registry.
pub struct MetaDataStore {
    tables: RwLock<Arc<HashMap<String, Arc<SqlTable>>>>,
}

impl Default for MetaDataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaDataStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Loads a JSON array of table definitions.
    pub fn from_json(json: &str) -> Result<Self> {
        let tables: Vec<SqlTable> = serde_json::from_str(json)
            .map_err(|e| GateError::InvalidConfiguration(format!("tables: {}", e)))?;
        let store = Self::new();
        for table in tables {
            store.with_table(table)?;
        }
        Ok(store)
    }

    /// Publishes a table. Readers holding the previous snapshot keep it.
    pub fn with_table(&self, table: SqlTable) -> Result<Arc<SqlTable>> {
        table.validate()?;
        let table = Arc::new(table);

        let mut guard = self.tables.write()?;
        let mut next = HashMap::clone(&guard);
        next.insert(table.name.clone(), Arc::clone(&table));
        *guard = Arc::new(next);

        debug!(table = %table.name, columns = table.columns.len(), "table registered");
        Ok(table)
    }

    pub fn table(&self, name: &str) -> Result<Arc<SqlTable>> {
        self.tables
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| GateError::UnboundType(name.to_string()))
    }

    pub fn snapshot(&self) -> Result<Arc<HashMap<String, Arc<SqlTable>>>> {
        Ok(Arc::clone(&*self.tables.read()?))
    }
}
