use std::fmt;

use crate::core::{GateError, Result, Value};

pub type Row = Vec<Value>;

/// Rows returned by a `SqlRunner`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Single value of a one-row, one-column result, e.g. a COUNT(*).
    pub fn scalar(&self) -> Result<&Value> {
        match (self.rows.as_slice(), self.columns.len()) {
            ([row], 1) if row.len() == 1 => Ok(&row[0]),
            _ => Err(GateError::InternalServerError(format!(
                "expected a scalar result, got {} row(s) of {} column(s)",
                self.rows.len(),
                self.columns.len()
            ))),
        }
    }
}

/// Aggregation output with the optional unpaginated row count.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResult {
    pub result: QueryResult,
    pub page_totals: Option<usize>,
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.columns.is_empty() {
            return writeln!(f, "Empty result set");
        }

        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.len()).collect();
        for row in &self.rows {
            for (i, value) in row.iter().enumerate().take(widths.len()) {
                widths[i] = widths[i].max(value.to_string().len());
            }
        }

        let header: Vec<String> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{:width$}", col, width = widths[i]))
            .collect();
        writeln!(f, "{}", header.join(" | "))?;

        let separator: String = widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-");
        writeln!(f, "{}", separator)?;

        for row in &self.rows {
            let cells: Vec<String> = row
                .iter()
                .enumerate()
                .take(widths.len())
                .map(|(i, value)| format!("{:width$}", value.to_string(), width = widths[i]))
                .collect();
            writeln!(f, "{}", cells.join(" | "))?;
        }

        write!(f, "\n{} row(s)", self.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar() {
        let count = QueryResult::new(vec!["count".into()], vec![vec![Value::Integer(7)]]);
        assert_eq!(count.scalar().unwrap(), &Value::Integer(7));
        assert!(QueryResult::empty().scalar().is_err());
    }

    #[test]
    fn test_render() {
        let result = QueryResult::new(
            vec!["rating".into(), "highScore".into()],
            vec![vec![Value::Text("Good".into()), Value::Integer(1234)]],
        );
        let rendered = result.to_string();
        assert!(rendered.starts_with("rating | highScore\n"));
        assert!(rendered.contains("Good   | 1234"));
        assert!(rendered.ends_with("1 row(s)"));
    }
}
