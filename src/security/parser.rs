//! Permission expression parser.
//!
//! ```text
//! expr   := term (OR term)*
//! term   := factor (AND factor)*
//! factor := NOT factor | '(' expr ')' | check
//! check  := word+
//! ```
//!
//! Keywords are case-insensitive. A check name may span several words; they
//! are joined with single spaces before lookup.

use crate::core::{GateError, Result};

use super::check::CheckRegistry;
use super::expression::PermissionExpression;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Word(String),
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    position: usize,
}

fn tokenize(input: &str) -> Result<Vec<Spanned>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(position, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Spanned { token: Token::LParen, position });
            }
            ')' => {
                chars.next();
                tokens.push(Spanned { token: Token::RParen, position });
            }
            _ => {
                let mut word = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    _ => Token::Word(word),
                };
                tokens.push(Spanned { token, position });
            }
        }
    }
    Ok(tokens)
}

pub struct ExpressionParser<'a> {
    registry: &'a CheckRegistry,
    source: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
}

impl<'a> ExpressionParser<'a> {
    pub fn new(source: &'a str, registry: &'a CheckRegistry) -> Result<Self> {
        Ok(Self {
            registry,
            source,
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    pub fn parse(mut self) -> Result<PermissionExpression> {
        if self.tokens.is_empty() {
            return Err(GateError::InvalidPermission("empty permission expression".into()));
        }
        let expression = self.parse_or()?;
        if let Some(extra) = self.tokens.get(self.pos) {
            return Err(self.error(extra.position, "unexpected token"));
        }
        Ok(expression)
    }

    fn parse_or(&mut self) -> Result<PermissionExpression> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = PermissionExpression::or(left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<PermissionExpression> {
        let mut left = self.parse_factor()?;
        while self.eat(&Token::And) {
            let right = self.parse_factor()?;
            left = PermissionExpression::and(left, right);
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<PermissionExpression> {
        let Some(current) = self.tokens.get(self.pos).cloned() else {
            return Err(self.error(self.source.len(), "unexpected end of expression"));
        };

        match current.token {
            Token::Not => {
                self.pos += 1;
                Ok(PermissionExpression::negate(self.parse_factor()?))
            }
            Token::LParen => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    let position = self
                        .tokens
                        .get(self.pos)
                        .map(|t| t.position)
                        .unwrap_or(self.source.len());
                    return Err(self.error(position, "expected ')'"));
                }
                Ok(inner)
            }
            Token::Word(_) => {
                let mut words = Vec::new();
                while let Some(Spanned { token: Token::Word(word), .. }) = self.tokens.get(self.pos) {
                    words.push(word.clone());
                    self.pos += 1;
                }
                let name = words.join(" ");
                let check = self
                    .registry
                    .resolve(&name)
                    .map_err(|_| self.error(current.position, &format!("unknown check '{}'", name)))?;
                Ok(PermissionExpression::check(&name, check))
            }
            Token::RParen | Token::And | Token::Or => Err(self.error(current.position, "unexpected token")),
        }
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.tokens.get(self.pos).is_some_and(|t| &t.token == expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, position: usize, message: &str) -> GateError {
        GateError::InvalidPermission(format!(
            "{} at position {} in '{}'",
            message, position, self.source
        ))
    }
}

pub fn parse_expression(source: &str, registry: &CheckRegistry) -> Result<PermissionExpression> {
    ExpressionParser::new(source, registry)?.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CheckRegistry {
        let registry = CheckRegistry::with_default_checks();
        registry.register_role("is admin", "admin").unwrap();
        registry.register_role("is owner", "owner").unwrap();
        registry
    }

    #[test]
    fn test_precedence() {
        let registry = registry();
        let expression = parse_expression("is admin or is owner AND not Prefab.Role.None", &registry).unwrap();
        assert_eq!(
            expression.to_string(),
            "(is admin OR (is owner AND NOT Prefab.Role.None))"
        );
    }

    #[test]
    fn test_parentheses() {
        let registry = registry();
        let expression = parse_expression("(is admin OR is owner) AND Prefab.Role.All", &registry).unwrap();
        assert_eq!(expression.to_string(), "((is admin OR is owner) AND Prefab.Role.All)");
    }

    #[test]
    fn test_multi_word_names_collapse_whitespace() {
        let registry = registry();
        let expression = parse_expression("is    admin", &registry).unwrap();
        assert_eq!(expression.check_names(), vec!["is admin"]);
    }

    #[test]
    fn test_errors_carry_position() {
        let registry = registry();
        let err = parse_expression("is admin AND (is owner", &registry).unwrap_err();
        assert!(err.to_string().contains("expected ')'"), "{}", err);

        let err = parse_expression("is admin OR ghost check", &registry).unwrap_err();
        assert!(err.to_string().contains("position 12"), "{}", err);

        assert!(parse_expression("", &registry).is_err());
        assert!(parse_expression("AND is admin", &registry).is_err());
    }
}
