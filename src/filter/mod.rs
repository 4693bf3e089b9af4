// ============================================================================
// Filter expressions
// ============================================================================
//
// Predicate trees shared by permission-derived read filters, datastore
// loads and the aggregation planner.
//
// ============================================================================

pub mod evaluator;

use std::fmt;

use crate::core::Value;

/// One hop of a field path: the type that owns `field_name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathElement {
    pub type_name: String,
    pub field_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    pub elements: Vec<PathElement>,
}

impl Path {
    pub fn new(elements: Vec<PathElement>) -> Self {
        Self { elements }
    }

    /// Single-hop path `type.field`.
    pub fn field(type_name: &str, field_name: &str) -> Self {
        Self {
            elements: vec![PathElement {
                type_name: type_name.to_string(),
                field_name: field_name.to_string(),
            }],
        }
    }

    /// Appends a hop owned by `type_name`.
    pub fn then(mut self, type_name: &str, field_name: &str) -> Self {
        self.elements.push(PathElement {
            type_name: type_name.to_string(),
            field_name: field_name.to_string(),
        });
        self
    }

    pub fn last(&self) -> Option<&PathElement> {
        self.elements.last()
    }

    pub fn field_name(&self) -> &str {
        self.last().map(|e| e.field_name.as_str()).unwrap_or("")
    }

    pub fn root_type(&self) -> &str {
        self.elements.first().map(|e| e.type_name.as_str()).unwrap_or("")
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for element in &self.elements {
            if first {
                write!(f, "{}.{}", element.type_name, element.field_name)?;
                first = false;
            } else {
                write!(f, ".{}", element.field_name)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    In,
    NotIn,
    Lt,
    Le,
    Gt,
    Ge,
    IsNull,
    NotNull,
    Prefix,
    Postfix,
    Infix,
    PrefixCaseInsensitive,
    InfixCaseInsensitive,
    True,
    False,
}

impl Operator {
    /// Complement operator, if one exists.
    pub fn negate(self) -> Option<Operator> {
        Some(match self {
            Self::In => Self::NotIn,
            Self::NotIn => Self::In,
            Self::Lt => Self::Ge,
            Self::Ge => Self::Lt,
            Self::Gt => Self::Le,
            Self::Le => Self::Gt,
            Self::IsNull => Self::NotNull,
            Self::NotNull => Self::IsNull,
            Self::True => Self::False,
            Self::False => Self::True,
            Self::Prefix
            | Self::Postfix
            | Self::Infix
            | Self::PrefixCaseInsensitive
            | Self::InfixCaseInsensitive => return None,
        })
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Self::In => "IN",
            Self::NotIn => "NOT",
            Self::Lt => "LT",
            Self::Le => "LE",
            Self::Gt => "GT",
            Self::Ge => "GE",
            Self::IsNull => "ISNULL",
            Self::NotNull => "NOTNULL",
            Self::Prefix => "PREFIX",
            Self::Postfix => "POSTFIX",
            Self::Infix => "INFIX",
            Self::PrefixCaseInsensitive => "PREFIX_I",
            Self::InfixCaseInsensitive => "INFIX_I",
            Self::True => "TRUE",
            Self::False => "FALSE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterPredicate {
    pub path: Path,
    pub operator: Operator,
    pub values: Vec<Value>,
}

impl FilterPredicate {
    pub fn new(path: Path, operator: Operator, values: Vec<Value>) -> Self {
        Self { path, operator, values }
    }

    pub fn field_name(&self) -> &str {
        self.path.field_name()
    }

    pub fn negated(&self) -> Option<FilterPredicate> {
        self.operator.negate().map(|operator| FilterPredicate {
            path: self.path.clone(),
            operator,
            values: self.values.clone(),
        })
    }
}

impl fmt::Display for FilterPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.path, self.operator.keyword())?;
        if !self.values.is_empty() {
            write!(f, " [")?;
            for (i, value) in self.values.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", value)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpression {
    Predicate(FilterPredicate),
    And(Box<FilterExpression>, Box<FilterExpression>),
    Or(Box<FilterExpression>, Box<FilterExpression>),
    Not(Box<FilterExpression>),
}

impl FilterExpression {
    pub fn predicate(path: Path, operator: Operator, values: Vec<Value>) -> Self {
        Self::Predicate(FilterPredicate::new(path, operator, values))
    }

    pub fn and(left: FilterExpression, right: FilterExpression) -> Self {
        Self::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: FilterExpression, right: FilterExpression) -> Self {
        Self::Or(Box::new(left), Box::new(right))
    }

    pub fn negate(expression: FilterExpression) -> Self {
        Self::Not(Box::new(expression))
    }

    /// AND of two optional expressions.
    pub fn and_optional(
        left: Option<FilterExpression>,
        right: Option<FilterExpression>,
    ) -> Option<FilterExpression> {
        match (left, right) {
            (Some(l), Some(r)) => Some(Self::and(l, r)),
            (l, None) => l,
            (None, r) => r,
        }
    }

    pub fn accept<T, V: FilterExpressionVisitor<T> + ?Sized>(&self, visitor: &mut V) -> T {
        match self {
            Self::Predicate(p) => visitor.visit_predicate(p),
            Self::And(l, r) => visitor.visit_and(l, r),
            Self::Or(l, r) => visitor.visit_or(l, r),
            Self::Not(e) => visitor.visit_not(e),
        }
    }

    /// Pushes NOT down to the leaves (De Morgan). Predicates without a
    /// complement operator keep their NOT wrapper.
    pub fn normalize(&self) -> FilterExpression {
        match self {
            Self::Predicate(_) => self.clone(),
            Self::And(l, r) => Self::and(l.normalize(), r.normalize()),
            Self::Or(l, r) => Self::or(l.normalize(), r.normalize()),
            Self::Not(inner) => negate_normalized(inner),
        }
    }

    pub fn predicates(&self) -> Vec<FilterPredicate> {
        self.accept(&mut PredicateExtractor)
    }
}

fn negate_normalized(expression: &FilterExpression) -> FilterExpression {
    match expression {
        FilterExpression::Predicate(p) => match p.negated() {
            Some(negated) => FilterExpression::Predicate(negated),
            None => FilterExpression::negate(expression.clone()),
        },
        FilterExpression::And(l, r) => {
            FilterExpression::or(negate_normalized(l), negate_normalized(r))
        }
        FilterExpression::Or(l, r) => {
            FilterExpression::and(negate_normalized(l), negate_normalized(r))
        }
        FilterExpression::Not(inner) => inner.normalize(),
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Predicate(p) => write!(f, "{}", p),
            Self::And(l, r) => write!(f, "({} AND {})", l, r),
            Self::Or(l, r) => write!(f, "({} OR {})", l, r),
            Self::Not(e) => write!(f, "NOT ({})", e),
        }
    }
}

pub trait FilterExpressionVisitor<T> {
    fn visit_predicate(&mut self, predicate: &FilterPredicate) -> T;
    fn visit_and(&mut self, left: &FilterExpression, right: &FilterExpression) -> T;
    fn visit_or(&mut self, left: &FilterExpression, right: &FilterExpression) -> T;
    fn visit_not(&mut self, expression: &FilterExpression) -> T;
}

/// Collects every leaf predicate, left to right.
pub struct PredicateExtractor;

impl FilterExpressionVisitor<Vec<FilterPredicate>> for PredicateExtractor {
    fn visit_predicate(&mut self, predicate: &FilterPredicate) -> Vec<FilterPredicate> {
        vec![predicate.clone()]
    }

    fn visit_and(&mut self, left: &FilterExpression, right: &FilterExpression) -> Vec<FilterPredicate> {
        let mut all = left.accept(self);
        all.extend(right.accept(self));
        all
    }

    fn visit_or(&mut self, left: &FilterExpression, right: &FilterExpression) -> Vec<FilterPredicate> {
        self.visit_and(left, right)
    }

    fn visit_not(&mut self, expression: &FilterExpression) -> Vec<FilterPredicate> {
        expression.accept(self)
    }
}
