// ============================================================================
// Column expression templates
// ============================================================================

use std::sync::Arc;

use super::dialect::SqlDialect;
use super::table::{MetaDataStore, SqlTable};
use crate::core::{GateError, Result};

/// Guard against self-referencing logical columns.
const MAX_REFERENCE_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    /// `{{$col}}`
    Physical { column: String },
    /// `{{name}}`, with the references of its own template
    Logical { column: String, references: Vec<Reference> },
    /// `{{join.col}}` / `{{join.$col}}`
    Join { join: String, reference: Box<Reference> },
}

impl Reference {
    pub fn requires_join(&self) -> bool {
        match self {
            Self::Physical { .. } => false,
            Self::Logical { references, .. } => references.iter().any(Reference::requires_join),
            Self::Join { .. } => true,
        }
    }

    /// Physical columns of the owning table, through logical columns but not
    /// through joins.
    fn collect_physical(&self, out: &mut Vec<String>) {
        match self {
            Self::Physical { column } => push_unique(out, column),
            Self::Logical { references, .. } => {
                for reference in references {
                    reference.collect_physical(out);
                }
            }
            Self::Join { .. } => {}
        }
    }

    /// Names of joins taken directly from the owning table.
    fn collect_joins(&self, out: &mut Vec<String>) {
        match self {
            Self::Physical { .. } => {}
            Self::Logical { references, .. } => {
                for reference in references {
                    reference.collect_joins(out);
                }
            }
            Self::Join { join, .. } => push_unique(out, join),
        }
    }
}

/// `LEFT OUTER JOIN <target> AS <alias> ON <condition>`
#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub alias: String,
    pub sql: String,
}

enum Segment<'t> {
    Text(&'t str),
    Token(&'t str),
}

fn scan(template: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            GateError::BadRequest(format!("unterminated reference in '{}'", template))
        })?;
        let token = after[..end].trim();
        if token.is_empty() {
            return Err(GateError::BadRequest(format!("empty reference in '{}'", template)));
        }
        segments.push(Segment::Token(token));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

fn push_unique(out: &mut Vec<String>, value: &str) {
    if !out.iter().any(|v| v == value) {
        out.push(value.to_string());
    }
}

/// Alias of a joined table as seen from `alias`.
pub fn join_alias(alias: &str, join: &str) -> String {
    format!("{}_{}", alias, join)
}

/// Parses and resolves templates against the tables of a metadata store.
pub struct ExpressionParser<'a> {
    store: &'a MetaDataStore,
}

impl<'a> ExpressionParser<'a> {
    pub fn new(store: &'a MetaDataStore) -> Self {
        Self { store }
    }

    pub fn parse(&self, table: &SqlTable, template: &str) -> Result<Vec<Reference>> {
        self.parse_at(table, template, 0)
    }

    fn parse_at(&self, table: &SqlTable, template: &str, depth: usize) -> Result<Vec<Reference>> {
        if depth > MAX_REFERENCE_DEPTH {
            return Err(circular(table, template));
        }
        scan(template)?
            .into_iter()
            .filter_map(|segment| match segment {
                Segment::Token(token) => Some(self.parse_token(table, token, depth)),
                Segment::Text(_) => None,
            })
            .collect()
    }

    fn parse_token(&self, table: &SqlTable, token: &str, depth: usize) -> Result<Reference> {
        if let Some(column) = token.strip_prefix('$') {
            return Ok(Reference::Physical {
                column: column.to_string(),
            });
        }
        if let Some((head, rest)) = token.split_once('.') {
            let join = table.join(head).ok_or_else(|| {
                GateError::BadRequest(format!("unknown join '{}' in table '{}'", head, table.name))
            })?;
            let target = self.store.table(&join.target)?;
            return Ok(Reference::Join {
                join: head.to_string(),
                reference: Box::new(self.parse_token(&target, rest, depth + 1)?),
            });
        }
        let column = table.require_column(token)?;
        Ok(Reference::Logical {
            column: token.to_string(),
            references: self.parse_at(table, &column.expression, depth + 1)?,
        })
    }

    pub fn requires_join(&self, table: &SqlTable, template: &str) -> Result<bool> {
        Ok(self.parse(table, template)?.iter().any(Reference::requires_join))
    }

    /// Physical columns of `table` needed to evaluate `template` once its
    /// joins are performed elsewhere: the template's own columns plus the
    /// join keys of the ON clauses.
    pub fn physical_columns(&self, table: &SqlTable, template: &str) -> Result<Vec<String>> {
        let references = self.parse(table, template)?;
        let mut columns = Vec::new();
        let mut joins = Vec::new();
        for reference in &references {
            reference.collect_physical(&mut columns);
            reference.collect_joins(&mut joins);
        }
        for name in joins {
            if let Some(join) = table.join(&name) {
                for reference in self.parse(table, &join.on)? {
                    reference.collect_physical(&mut columns);
                }
            }
        }
        Ok(columns)
    }

    /// Renders `template` as SQL with `table` visible under `alias`.
    pub fn resolve(
        &self,
        table: &SqlTable,
        alias: &str,
        template: &str,
        dialect: &dyn SqlDialect,
    ) -> Result<String> {
        self.resolve_at(table, alias, template, dialect, 0)
    }

    fn resolve_at(
        &self,
        table: &SqlTable,
        alias: &str,
        template: &str,
        dialect: &dyn SqlDialect,
        depth: usize,
    ) -> Result<String> {
        if depth > MAX_REFERENCE_DEPTH {
            return Err(circular(table, template));
        }
        let mut sql = String::with_capacity(template.len());
        for segment in scan(template)? {
            match segment {
                Segment::Text(text) => sql.push_str(text),
                Segment::Token(token) => {
                    sql.push_str(&self.resolve_token(table, alias, token, dialect, depth)?)
                }
            }
        }
        Ok(sql)
    }

    fn resolve_token(
        &self,
        table: &SqlTable,
        alias: &str,
        token: &str,
        dialect: &dyn SqlDialect,
        depth: usize,
    ) -> Result<String> {
        if let Some(column) = token.strip_prefix('$') {
            return Ok(dialect.qualify(alias, column));
        }
        if let Some((head, rest)) = token.split_once('.') {
            let join = table.join(head).ok_or_else(|| {
                GateError::BadRequest(format!("unknown join '{}' in table '{}'", head, table.name))
            })?;
            let target = self.store.table(&join.target)?;
            return self.resolve_token(&target, &join_alias(alias, head), rest, dialect, depth + 1);
        }
        let column = table.require_column(token)?;
        self.resolve_at(table, alias, &column.expression, dialect, depth + 1)
    }

    /// Join clauses needed by `template`, appended to `out` unless an
    /// identical alias is already present.
    pub fn joins(
        &self,
        table: &SqlTable,
        alias: &str,
        template: &str,
        dialect: &dyn SqlDialect,
        out: &mut Vec<JoinClause>,
    ) -> Result<()> {
        for reference in self.parse(table, template)? {
            self.collect_join_clauses(table, alias, &reference, dialect, out)?;
        }
        Ok(())
    }

    fn collect_join_clauses(
        &self,
        table: &SqlTable,
        alias: &str,
        reference: &Reference,
        dialect: &dyn SqlDialect,
        out: &mut Vec<JoinClause>,
    ) -> Result<()> {
        match reference {
            Reference::Physical { .. } => Ok(()),
            Reference::Logical { references, .. } => {
                for inner in references {
                    self.collect_join_clauses(table, alias, inner, dialect, out)?;
                }
                Ok(())
            }
            Reference::Join { join, reference } => {
                let definition = table.join(join).ok_or_else(|| {
                    GateError::BadRequest(format!("unknown join '{}' in table '{}'", join, table.name))
                })?;
                let target: Arc<SqlTable> = self.store.table(&definition.target)?;
                let joined = join_alias(alias, join);

                if !out.iter().any(|clause| clause.alias == joined) {
                    let condition = self.resolve(table, alias, &definition.on, dialect)?;
                    out.push(JoinClause {
                        sql: format!(
                            "LEFT OUTER JOIN {} AS {} ON {}",
                            physical_source(&target.physical, dialect),
                            dialect.quote(&joined),
                            condition
                        ),
                        alias: joined.clone(),
                    });
                }
                self.collect_join_clauses(&target, &joined, reference, dialect, out)
            }
        }
    }
}

/// Quotes a physical table name; sub-selects pass through.
pub fn physical_source(physical: &str, dialect: &dyn SqlDialect) -> String {
    let trimmed = physical.trim();
    if trimmed.starts_with('(') {
        return trimmed.to_string();
    }
    trimmed
        .split('.')
        .map(|part| dialect.quote(part))
        .collect::<Vec<_>>()
        .join(".")
}

fn circular(table: &SqlTable, template: &str) -> GateError {
    GateError::BadRequest(format!(
        "circular column reference in table '{}' near '{}'",
        table.name, template
    ))
}
