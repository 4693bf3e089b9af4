use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::{GateError, Result};

use super::check::CheckRegistry;
use super::expression::PermissionExpression;
use super::parser::parse_expression;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionKind {
    Read,
    Create,
    Update,
    Delete,
    NonTransferable,
}

impl PermissionKind {
    /// Failures of these kinds cannot be deferred to commit.
    pub fn is_inline_only(&self) -> bool {
        matches!(self, Self::Read | Self::Delete)
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "ReadPermission",
            Self::Create => "CreatePermission",
            Self::Update => "UpdatePermission",
            Self::Delete => "DeletePermission",
            Self::NonTransferable => "NonTransferable",
        };
        write!(f, "{}", name)
    }
}

/// Raw permission declaration. Exactly one of the three forms must be set.
#[derive(Debug, Clone, Default)]
pub struct PermissionAnnotation {
    pub expression: Option<String>,
    pub all_of: Vec<String>,
    pub any_of: Vec<String>,
}

impl PermissionAnnotation {
    pub fn expression(expression: &str) -> Self {
        Self {
            expression: Some(expression.to_string()),
            ..Default::default()
        }
    }

    pub fn all_of<S: AsRef<str>>(checks: &[S]) -> Self {
        Self {
            all_of: checks.iter().map(|c| c.as_ref().to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn any_of<S: AsRef<str>>(checks: &[S]) -> Self {
        Self {
            any_of: checks.iter().map(|c| c.as_ref().to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn compile(&self, registry: &CheckRegistry) -> Result<PermissionExpression> {
        let configured = [
            self.expression.is_some(),
            !self.all_of.is_empty(),
            !self.any_of.is_empty(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if configured != 1 {
            return Err(GateError::InvalidPermission(
                "exactly one of expression, all_of or any_of must be set".into(),
            ));
        }

        if let Some(expression) = &self.expression {
            return parse_expression(expression, registry);
        }

        let (names, conjunction) = if self.all_of.is_empty() {
            (&self.any_of, false)
        } else {
            (&self.all_of, true)
        };

        let mut compiled: Option<PermissionExpression> = None;
        for name in names {
            let leaf = PermissionExpression::check(name, registry.resolve(name)?);
            compiled = Some(match compiled {
                None => leaf,
                Some(left) if conjunction => PermissionExpression::and(left, leaf),
                Some(left) => PermissionExpression::or(left, leaf),
            });
        }
        compiled.ok_or_else(|| GateError::InvalidPermission("empty check list".into()))
    }
}

/// Compiled class-level and field-level expressions of one type.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    class: HashMap<PermissionKind, Arc<PermissionExpression>>,
    fields: HashMap<PermissionKind, HashMap<String, Arc<PermissionExpression>>>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_class(&mut self, kind: PermissionKind, expression: PermissionExpression) {
        self.class.insert(kind, Arc::new(expression));
    }

    pub fn set_field(&mut self, field: &str, kind: PermissionKind, expression: PermissionExpression) {
        self.fields
            .entry(kind)
            .or_default()
            .insert(field.to_string(), Arc::new(expression));
    }

    pub fn class_expression(&self, kind: PermissionKind) -> Option<&Arc<PermissionExpression>> {
        self.class.get(&kind)
    }

    pub fn field_expression(&self, kind: PermissionKind, field: &str) -> Option<&Arc<PermissionExpression>> {
        self.fields.get(&kind).and_then(|f| f.get(field))
    }

    /// Field expression, or the class expression when the field has none.
    pub fn effective(&self, kind: PermissionKind, field: &str) -> Option<&Arc<PermissionExpression>> {
        self.field_expression(kind, field)
            .or_else(|| self.class_expression(kind))
    }

    pub fn has_field_permissions(&self, kind: PermissionKind) -> bool {
        self.fields.get(&kind).is_some_and(|f| !f.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.class.is_empty() && self.fields.values().all(HashMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_form() {
        let registry = CheckRegistry::with_default_checks();

        let both = PermissionAnnotation {
            expression: Some("Prefab.Role.All".into()),
            any_of: vec!["Prefab.Role.None".into()],
            ..Default::default()
        };
        assert!(matches!(both.compile(&registry), Err(GateError::InvalidPermission(_))));
        assert!(PermissionAnnotation::default().compile(&registry).is_err());
    }

    #[test]
    fn test_lists_compile_in_order() {
        let registry = CheckRegistry::with_default_checks();

        let all = PermissionAnnotation::all_of(&["Prefab.Role.All", "Prefab.Role.None", "Prefab.Role.All"])
            .compile(&registry)
            .unwrap();
        assert_eq!(
            all.to_string(),
            "((Prefab.Role.All AND Prefab.Role.None) AND Prefab.Role.All)"
        );

        let any = PermissionAnnotation::any_of(&["Prefab.Role.None", "Prefab.Role.All"])
            .compile(&registry)
            .unwrap();
        assert_eq!(any.to_string(), "(Prefab.Role.None OR Prefab.Role.All)");
    }

    #[test]
    fn test_field_falls_back_to_class() {
        let registry = CheckRegistry::with_default_checks();
        let mut set = PermissionSet::new();
        set.set_class(
            PermissionKind::Read,
            PermissionAnnotation::expression("Prefab.Role.All").compile(&registry).unwrap(),
        );
        set.set_field(
            "secret",
            PermissionKind::Read,
            PermissionAnnotation::expression("Prefab.Role.None").compile(&registry).unwrap(),
        );

        assert_eq!(set.effective(PermissionKind::Read, "secret").unwrap().to_string(), "Prefab.Role.None");
        assert_eq!(set.effective(PermissionKind::Read, "title").unwrap().to_string(), "Prefab.Role.All");
        assert!(set.effective(PermissionKind::Delete, "title").is_none());
    }
}
