use std::fmt::Debug;

use sqlparser::dialect::{Dialect, GenericDialect as GenericParserDialect, MySqlDialect as MySqlParserDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use super::table::TimeGrain;
use crate::core::{GateError, Result};

/// Database-specific SQL rendering.
pub trait SqlDialect: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn begin_quote(&self) -> char;

    fn end_quote(&self) -> char {
        self.begin_quote()
    }

    fn quote(&self, identifier: &str) -> String {
        format!("{}{}{}", self.begin_quote(), identifier, self.end_quote())
    }

    /// `alias.column`, both quoted.
    fn qualify(&self, alias: &str, column: &str) -> String {
        format!("{}.{}", self.quote(alias), self.quote(column))
    }

    fn time_grain(&self, grain: TimeGrain, expression: &str) -> String;

    fn pagination(&self, offset: usize, limit: usize) -> String {
        format!("LIMIT {} OFFSET {}", limit, offset)
    }

    /// Parser dialect used for syntax verification.
    fn parser_dialect(&self) -> Box<dyn Dialect>;

    /// Verifies that `sql` parses as a single expression.
    fn verify_expression(&self, sql: &str) -> Result<()> {
        let dialect = self.parser_dialect();
        Parser::new(dialect.as_ref())
            .try_with_sql(sql)
            .and_then(|mut parser| {
                parser.parse_expr()?;
                parser.expect_token(&Token::EOF).map(|_| ())
            })
            .map_err(|e| GateError::BadRequest(format!("invalid {} expression '{}': {}", self.name(), sql, e)))
    }
}

/// ANSI quoting with DATE_TRUNC.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericDialect;

impl SqlDialect for GenericDialect {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn begin_quote(&self) -> char {
        '"'
    }

    fn time_grain(&self, grain: TimeGrain, expression: &str) -> String {
        format!("DATE_TRUNC('{}', {})", grain.keyword(), expression)
    }

    fn parser_dialect(&self) -> Box<dyn Dialect> {
        Box::new(GenericParserDialect {})
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct H2Dialect;

impl SqlDialect for H2Dialect {
    fn name(&self) -> &'static str {
        "h2"
    }

    fn begin_quote(&self) -> char {
        '`'
    }

    fn time_grain(&self, grain: TimeGrain, expression: &str) -> String {
        format!(
            "PARSEDATETIME(FORMATDATETIME({}, '{}'), '{}')",
            expression,
            grain.java_pattern(),
            grain.java_pattern()
        )
    }

    fn parser_dialect(&self) -> Box<dyn Dialect> {
        Box::new(GenericParserDialect {})
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn begin_quote(&self) -> char {
        '`'
    }

    fn time_grain(&self, grain: TimeGrain, expression: &str) -> String {
        format!("DATE_FORMAT({}, '{}')", expression, grain.strftime_pattern())
    }

    fn parser_dialect(&self) -> Box<dyn Dialect> {
        Box::new(MySqlParserDialect {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoting() {
        assert_eq!(GenericDialect.qualify("ps", "highScore"), "\"ps\".\"highScore\"");
        assert_eq!(MySqlDialect.qualify("ps", "highScore"), "`ps`.`highScore`");
    }

    #[test]
    fn test_time_grain() {
        assert_eq!(
            GenericDialect.time_grain(TimeGrain::Month, "\"ps\".\"recorded\""),
            "DATE_TRUNC('month', \"ps\".\"recorded\")"
        );
        assert_eq!(
            MySqlDialect.time_grain(TimeGrain::Day, "`ps`.`recorded`"),
            "DATE_FORMAT(`ps`.`recorded`, '%Y-%m-%d')"
        );
    }

    #[test]
    fn test_verify_expression() {
        assert!(MySqlDialect.verify_expression("MAX(`ps`.`highScore`)").is_ok());
        assert!(GenericDialect.verify_expression("SUM(\"ps\".\"a\") * 2").is_ok());
        assert!(GenericDialect.verify_expression("SUM(\"ps\".\"a\"").is_err());
        assert!(GenericDialect.verify_expression("SUM(\"ps\".\"a\") FROM").is_err());
    }
}
