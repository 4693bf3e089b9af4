// ============================================================================
// Permission expressions
// ============================================================================
//
// Compiled AND/OR/NOT trees over resolved checks. Evaluation is three-valued:
// a check that cannot run in the current mode yields Deferred, and the
// executor queues the whole expression for commit.
//
// ============================================================================

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::core::{InstanceId, Result};
use crate::filter::{FilterExpression, FilterPredicate, Operator, Path};
use crate::request::ChangeSpec;
use crate::resource::PersistentResource;

use super::check::{Check, CheckKind};
use super::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionResult {
    Pass,
    Fail,
    Deferred,
}

impl ExpressionResult {
    fn from_bool(ok: bool) -> Self {
        if ok { Self::Pass } else { Self::Fail }
    }

    pub fn and(self, right: impl FnOnce() -> Result<ExpressionResult>) -> Result<ExpressionResult> {
        if self == Self::Fail {
            return Ok(Self::Fail);
        }
        Ok(match (self, right()?) {
            (_, Self::Fail) => Self::Fail,
            (Self::Pass, Self::Pass) => Self::Pass,
            _ => Self::Deferred,
        })
    }

    pub fn or(self, right: impl FnOnce() -> Result<ExpressionResult>) -> Result<ExpressionResult> {
        if self == Self::Pass {
            return Ok(Self::Pass);
        }
        Ok(match (self, right()?) {
            (_, Self::Pass) => Self::Pass,
            (Self::Fail, Self::Fail) => Self::Fail,
            _ => Self::Deferred,
        })
    }

    pub fn not(self) -> Self {
        match self {
            Self::Pass => Self::Fail,
            Self::Fail => Self::Pass,
            Self::Deferred => Self::Deferred,
        }
    }
}

impl fmt::Display for ExpressionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASSED"),
            Self::Fail => write!(f, "FAILED"),
            Self::Deferred => write!(f, "DEFERRED"),
        }
    }
}

/// Which checks may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    UserChecksOnly,
    InlineChecksOnly,
    AllChecks,
}

/// Per-request cache of check results for (check, instance) without a change.
#[derive(Default)]
pub struct CheckResultCache {
    results: Mutex<HashMap<(String, InstanceId), bool>>,
}

impl CheckResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_compute(&self, name: &str, instance: InstanceId, compute: impl FnOnce() -> bool) -> Result<bool> {
        let key = (name.to_string(), instance);
        if let Some(hit) = self.results.lock()?.get(&key) {
            return Ok(*hit);
        }
        // Computed without the lock held: checks may read the scope
        let value = compute();
        self.results.lock()?.insert(key, value);
        Ok(value)
    }

    pub fn clear(&self) -> Result<()> {
        self.results.lock()?.clear();
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.results.lock()?.len())
    }
}

pub struct EvaluationContext<'a> {
    pub resource: Option<&'a PersistentResource>,
    pub user: &'a User,
    pub change: Option<&'a ChangeSpec>,
    pub cache: Option<&'a CheckResultCache>,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(user: &'a User) -> Self {
        Self {
            resource: None,
            user,
            change: None,
            cache: None,
        }
    }

    pub fn with_resource(mut self, resource: &'a PersistentResource) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_change(mut self, change: Option<&'a ChangeSpec>) -> Self {
        self.change = change;
        self
    }

    pub fn with_cache(mut self, cache: &'a CheckResultCache) -> Self {
        self.cache = Some(cache);
        self
    }
}

#[derive(Clone)]
pub struct CheckLeaf {
    pub name: String,
    pub check: Arc<dyn Check>,
}

#[derive(Clone)]
pub enum PermissionExpression {
    Check(CheckLeaf),
    And(Box<PermissionExpression>, Box<PermissionExpression>),
    Or(Box<PermissionExpression>, Box<PermissionExpression>),
    Not(Box<PermissionExpression>),
}

impl PermissionExpression {
    pub fn check(name: &str, check: Arc<dyn Check>) -> Self {
        Self::Check(CheckLeaf {
            name: name.to_string(),
            check,
        })
    }

    pub fn and(left: PermissionExpression, right: PermissionExpression) -> Self {
        Self::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: PermissionExpression, right: PermissionExpression) -> Self {
        Self::Or(Box::new(left), Box::new(right))
    }

    pub fn negate(expression: PermissionExpression) -> Self {
        Self::Not(Box::new(expression))
    }

    pub fn evaluate(&self, ctx: &EvaluationContext<'_>, mode: EvaluationMode) -> Result<ExpressionResult> {
        match self {
            Self::Check(leaf) => evaluate_leaf(leaf, ctx, mode),
            Self::And(left, right) => left.evaluate(ctx, mode)?.and(|| right.evaluate(ctx, mode)),
            Self::Or(left, right) => left.evaluate(ctx, mode)?.or(|| right.evaluate(ctx, mode)),
            Self::Not(inner) => Ok(inner.evaluate(ctx, mode)?.not()),
        }
    }

    /// Names of all checks in the tree, left to right.
    pub fn check_names(&self) -> Vec<&str> {
        match self {
            Self::Check(leaf) => vec![leaf.name.as_str()],
            Self::And(l, r) | Self::Or(l, r) => {
                let mut names = l.check_names();
                names.extend(r.check_names());
                names
            }
            Self::Not(inner) => inner.check_names(),
        }
    }

    /// Filter equivalent of the tree. User checks collapse to TRUE/FALSE;
    /// any other leaf without a filter makes the whole tree unfilterable.
    pub fn to_filter_expression(&self, type_name: &str, user: &User) -> Option<FilterExpression> {
        match self {
            Self::Check(leaf) => {
                if leaf.check.kind() == CheckKind::User {
                    let operator = if leaf.check.ok(None, user, None) {
                        Operator::True
                    } else {
                        Operator::False
                    };
                    return Some(FilterExpression::Predicate(FilterPredicate::new(
                        Path::field(type_name, ""),
                        operator,
                        Vec::new(),
                    )));
                }
                leaf.check.filter_expression(type_name, user)
            }
            Self::And(l, r) => Some(FilterExpression::and(
                l.to_filter_expression(type_name, user)?,
                r.to_filter_expression(type_name, user)?,
            )),
            Self::Or(l, r) => Some(FilterExpression::or(
                l.to_filter_expression(type_name, user)?,
                r.to_filter_expression(type_name, user)?,
            )),
            Self::Not(inner) => Some(FilterExpression::negate(inner.to_filter_expression(type_name, user)?)),
        }
    }
}

fn evaluate_leaf(leaf: &CheckLeaf, ctx: &EvaluationContext<'_>, mode: EvaluationMode) -> Result<ExpressionResult> {
    let check = &leaf.check;
    match (check.kind(), mode) {
        (CheckKind::User, _) => Ok(ExpressionResult::from_bool(check.ok(ctx.resource, ctx.user, ctx.change))),
        (CheckKind::Operation, EvaluationMode::UserChecksOnly) => Ok(ExpressionResult::Deferred),
        (CheckKind::Commit, EvaluationMode::UserChecksOnly | EvaluationMode::InlineChecksOnly) => {
            Ok(ExpressionResult::Deferred)
        }
        (CheckKind::Operation | CheckKind::Commit, _) => {
            let Some(resource) = ctx.resource else {
                return Ok(ExpressionResult::Deferred);
            };
            let ok = match (ctx.cache, ctx.change) {
                (Some(cache), None) => cache.get_or_compute(&leaf.name, resource.entity().instance_id(), || {
                    check.ok(Some(resource), ctx.user, None)
                })?,
                _ => check.ok(Some(resource), ctx.user, ctx.change),
            };
            Ok(ExpressionResult::from_bool(ok))
        }
    }
}

impl fmt::Display for PermissionExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Check(leaf) => write!(f, "{}", leaf.name),
            Self::And(l, r) => write!(f, "({} AND {})", l, r),
            Self::Or(l, r) => write!(f, "({} OR {})", l, r),
            Self::Not(inner) => write!(f, "NOT {}", inner),
        }
    }
}

impl fmt::Debug for PermissionExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PermissionExpression({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::check::{AllowAll, DenyAll, UpdateOnCreate};

    fn all() -> PermissionExpression {
        PermissionExpression::check("Prefab.Role.All", Arc::new(AllowAll))
    }

    fn none() -> PermissionExpression {
        PermissionExpression::check("Prefab.Role.None", Arc::new(DenyAll))
    }

    fn operation() -> PermissionExpression {
        PermissionExpression::check("Prefab.Common.UpdateOnCreate", Arc::new(UpdateOnCreate))
    }

    #[test]
    fn test_three_valued_logic() {
        let user = User::anonymous();
        let ctx = EvaluationContext::new(&user);
        let mode = EvaluationMode::UserChecksOnly;

        let cases = [
            (PermissionExpression::and(all(), none()), ExpressionResult::Fail),
            (PermissionExpression::or(none(), all()), ExpressionResult::Pass),
            (PermissionExpression::and(all(), operation()), ExpressionResult::Deferred),
            (PermissionExpression::and(none(), operation()), ExpressionResult::Fail),
            (PermissionExpression::or(all(), operation()), ExpressionResult::Pass),
            (PermissionExpression::or(none(), operation()), ExpressionResult::Deferred),
            (PermissionExpression::negate(operation()), ExpressionResult::Deferred),
            (PermissionExpression::negate(none()), ExpressionResult::Pass),
        ];
        for (expression, expected) in cases {
            assert_eq!(expression.evaluate(&ctx, mode).unwrap(), expected, "{}", expression);
        }
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let user = User::anonymous();
        let ctx = EvaluationContext::new(&user);
        let expression = PermissionExpression::or(PermissionExpression::negate(all()), none());

        let first = expression.evaluate(&ctx, EvaluationMode::AllChecks).unwrap();
        let second = expression.evaluate(&ctx, EvaluationMode::AllChecks).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, ExpressionResult::Fail);
    }

    #[test]
    fn test_display() {
        let expression = PermissionExpression::or(all(), PermissionExpression::negate(none()));
        assert_eq!(expression.to_string(), "(Prefab.Role.All OR NOT Prefab.Role.None)");
        assert_eq!(expression.check_names(), vec!["Prefab.Role.All", "Prefab.Role.None"]);
    }

    #[test]
    fn test_user_checks_become_constant_filters() {
        let user = User::anonymous();
        let filter = PermissionExpression::and(all(), none())
            .to_filter_expression("book", &user)
            .unwrap();
        let operators: Vec<Operator> = filter.predicates().iter().map(|p| p.operator).collect();
        assert_eq!(operators, vec![Operator::True, Operator::False]);

        assert!(operation().to_filter_expression("book", &user).is_none());
    }
}
