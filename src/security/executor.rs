// ============================================================================
// Permission executor
// ============================================================================
//
// One executor per request. User checks run first and are cached per
// (kind, type, fields); the rest of the expression runs inline or is queued
// for commit when it cannot be decided yet.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::core::{GateError, Result};
use crate::dictionary::{EntityBinding, EntityDictionary};
use crate::filter::FilterExpression;
use crate::request::ChangeSpec;
use crate::resource::PersistentResource;

use super::expression::{
    CheckResultCache, EvaluationContext, EvaluationMode, ExpressionResult, PermissionExpression,
};
use super::{PermissionKind, User};

type UserCacheKey = (PermissionKind, String, Option<Vec<String>>);

struct QueuedCheck {
    kind: PermissionKind,
    expression: Arc<PermissionExpression>,
    resource: PersistentResource,
    change: Option<ChangeSpec>,
}

pub struct PermissionExecutor {
    dictionary: Arc<EntityDictionary>,
    user: User,
    verbose: bool,
    commit_queue: Mutex<Vec<QueuedCheck>>,
    user_check_cache: Mutex<HashMap<UserCacheKey, ExpressionResult>>,
    check_cache: CheckResultCache,
    check_stats: Mutex<HashMap<String, u64>>,
}

impl PermissionExecutor {
    pub fn new(dictionary: Arc<EntityDictionary>, user: User, verbose: bool) -> Self {
        Self {
            dictionary,
            user,
            verbose,
            commit_queue: Mutex::new(Vec::new()),
            user_check_cache: Mutex::new(HashMap::new()),
            check_cache: CheckResultCache::new(),
            check_stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Class-level check, or any-field check when `requested_fields` is given.
    pub fn check_permission(
        &self,
        kind: PermissionKind,
        resource: &PersistentResource,
        requested_fields: Option<&[String]>,
    ) -> Result<ExpressionResult> {
        let binding = resource.binding()?;

        let expression = if kind == PermissionKind::NonTransferable {
            if binding.non_transferable {
                return Err(GateError::Forbidden(format!(
                    "{} denied on {}#{}: type is not transferable",
                    kind,
                    binding.type_name,
                    resource.display_id()
                )));
            }
            binding.permissions.class_expression(kind).cloned()
        } else {
            any_field_expression(&binding, kind, requested_fields)
        };
        let Some(expression) = expression else {
            return Ok(ExpressionResult::Pass);
        };

        let newly_created = resource.is_newly_created()?;
        self.check_user_first(kind, &binding, requested_fields, &expression, Some(resource), || {
            if newly_created {
                self.user_checks_defer_inline(kind, &expression, resource, None)
            } else {
                self.execute(kind, &expression, resource, None, EvaluationMode::InlineChecksOnly)
            }
        })
    }

    /// Check on one field, with the change being applied. Update of a
    /// resource created in this request is checked as Create, and new
    /// resources defer everything but user checks to commit.
    pub fn check_field_permission(
        &self,
        kind: PermissionKind,
        resource: &PersistentResource,
        field: &str,
        change: Option<&ChangeSpec>,
    ) -> Result<ExpressionResult> {
        let newly_created = resource.is_newly_created()?;
        let kind = if kind == PermissionKind::Update && newly_created {
            PermissionKind::Create
        } else {
            kind
        };

        let binding = resource.binding()?;
        let Some(expression) = binding.permissions.effective(kind, field).cloned() else {
            return Ok(ExpressionResult::Pass);
        };

        let fields = [field.to_string()];
        self.check_user_first(kind, &binding, Some(&fields), &expression, Some(resource), || {
            if newly_created && matches!(kind, PermissionKind::Create | PermissionKind::Update) {
                self.user_checks_defer_inline(kind, &expression, resource, change)
            } else {
                self.execute(kind, &expression, resource, change, EvaluationMode::InlineChecksOnly)
            }
        })
    }

    /// Evaluates only the user checks of a type's expression.
    pub fn check_user_permission(
        &self,
        kind: PermissionKind,
        type_name: &str,
        requested_fields: Option<&[String]>,
    ) -> Result<ExpressionResult> {
        let binding = self.dictionary.binding(type_name)?;
        let Some(expression) = any_field_expression(&binding, kind, requested_fields) else {
            return Ok(ExpressionResult::Pass);
        };
        self.check_user_first(kind, &binding, requested_fields, &expression, None, || {
            Ok(ExpressionResult::Deferred)
        })
    }

    /// Filter derived from the read permission, for backend pushdown.
    pub fn read_filter(&self, type_name: &str, requested_fields: Option<&[String]>) -> Result<Option<FilterExpression>> {
        let binding = self.dictionary.binding(type_name)?;
        Ok(any_field_expression(&binding, PermissionKind::Read, requested_fields)
            .and_then(|expression| expression.to_filter_expression(&binding.type_name, &self.user)))
    }

    /// Evaluates every deferred expression with all checks enabled.
    pub fn execute_commit_checks(&self) -> Result<()> {
        let queued: Vec<QueuedCheck> = std::mem::take(&mut *self.commit_queue.lock()?);
        debug!(count = queued.len(), "executing commit checks");

        for check in &queued {
            let ctx = EvaluationContext::new(&self.user)
                .with_resource(&check.resource)
                .with_change(check.change.as_ref());
            let result = check.expression.evaluate(&ctx, EvaluationMode::AllChecks)?;
            self.record(&check.expression)?;
            if result == ExpressionResult::Fail {
                let err = denied(check.kind, &check.resource, &check.expression);
                trace!(error = %err, "commit check failed");
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn pending_commit_checks(&self) -> Result<usize> {
        Ok(self.commit_queue.lock()?.len())
    }

    pub fn log_check_stats(&self) -> Result<()> {
        let stats = self.check_stats.lock()?;
        if stats.is_empty() {
            return Ok(());
        }
        let mut sorted: Vec<(&String, &u64)> = stats.iter().collect();
        sorted.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));

        let mut report = String::from("Permission Check Statistics:\n");
        for (expression, count) in sorted {
            report.push_str(&format!("{}: {}\n", expression, count));
        }
        debug!("{}", report);
        Ok(())
    }

    pub fn check_stats(&self) -> Result<HashMap<String, u64>> {
        Ok(self.check_stats.lock()?.clone())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_user_first(
        &self,
        kind: PermissionKind,
        binding: &EntityBinding,
        fields: Option<&[String]>,
        expression: &Arc<PermissionExpression>,
        resource: Option<&PersistentResource>,
        then: impl FnOnce() -> Result<ExpressionResult>,
    ) -> Result<ExpressionResult> {
        let key: UserCacheKey = (kind, binding.type_name.clone(), fields.map(sorted));

        let cached = self.user_check_cache.lock()?.get(&key).copied();
        match cached {
            Some(ExpressionResult::Pass) => return Ok(ExpressionResult::Pass),
            Some(_) => {}
            None => {
                let mut ctx = EvaluationContext::new(&self.user);
                ctx.resource = resource;
                let result = expression.evaluate(&ctx, EvaluationMode::UserChecksOnly)?;
                self.record(expression)?;
                if result == ExpressionResult::Fail {
                    return Err(match resource {
                        Some(resource) => denied(kind, resource, expression),
                        None => GateError::Forbidden(format!(
                            "{} denied on {}: {}",
                            kind, binding.type_name, expression
                        )),
                    });
                }
                self.user_check_cache.lock()?.insert(key, result);
                if result == ExpressionResult::Pass {
                    return Ok(ExpressionResult::Pass);
                }
            }
        }
        then()
    }

    fn user_checks_defer_inline(
        &self,
        kind: PermissionKind,
        expression: &Arc<PermissionExpression>,
        resource: &PersistentResource,
        change: Option<&ChangeSpec>,
    ) -> Result<ExpressionResult> {
        let result = self.execute(kind, expression, resource, change, EvaluationMode::UserChecksOnly)?;
        if result == ExpressionResult::Deferred {
            self.enqueue(kind, expression, resource, change)?;
        }
        Ok(result)
    }

    fn execute(
        &self,
        kind: PermissionKind,
        expression: &Arc<PermissionExpression>,
        resource: &PersistentResource,
        change: Option<&ChangeSpec>,
        mode: EvaluationMode,
    ) -> Result<ExpressionResult> {
        let ctx = EvaluationContext::new(&self.user)
            .with_resource(resource)
            .with_change(change)
            .with_cache(&self.check_cache);
        let result = expression.evaluate(&ctx, mode)?;
        self.record(expression)?;

        match result {
            ExpressionResult::Pass => Ok(result),
            ExpressionResult::Fail => Err(denied(kind, resource, expression)),
            // User-only evaluation is an early exit, never a deferral
            ExpressionResult::Deferred if mode == EvaluationMode::UserChecksOnly => Ok(result),
            ExpressionResult::Deferred if kind.is_inline_only() => {
                match expression.evaluate(&ctx, EvaluationMode::AllChecks)? {
                    ExpressionResult::Fail => Err(denied(kind, resource, expression)),
                    forced => Ok(forced),
                }
            }
            ExpressionResult::Deferred => {
                self.enqueue(kind, expression, resource, change)?;
                Ok(result)
            }
        }
    }

    fn enqueue(
        &self,
        kind: PermissionKind,
        expression: &Arc<PermissionExpression>,
        resource: &PersistentResource,
        change: Option<&ChangeSpec>,
    ) -> Result<()> {
        self.commit_queue.lock()?.push(QueuedCheck {
            kind,
            expression: Arc::clone(expression),
            resource: resource.clone(),
            change: change.cloned(),
        });
        Ok(())
    }

    fn record(&self, expression: &PermissionExpression) -> Result<()> {
        *self.check_stats.lock()?.entry(expression.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

/// Class expression, or for requested fields the OR of each field's
/// effective expression. `None` means unrestricted.
fn any_field_expression(
    binding: &EntityBinding,
    kind: PermissionKind,
    fields: Option<&[String]>,
) -> Option<Arc<PermissionExpression>> {
    let class = binding.permissions.class_expression(kind).cloned();
    let fields = match fields {
        Some(fields) if !fields.is_empty() && binding.permissions.has_field_permissions(kind) => fields,
        _ => return class,
    };

    let mut combined: Option<PermissionExpression> = None;
    for field in fields {
        // An unrestricted field makes the whole OR pass
        let expression = binding.permissions.effective(kind, field)?;
        combined = Some(match combined {
            None => (**expression).clone(),
            Some(left) => PermissionExpression::or(left, (**expression).clone()),
        });
    }
    combined.map(Arc::new)
}

fn sorted(fields: &[String]) -> Vec<String> {
    let mut fields = fields.to_vec();
    fields.sort();
    fields.dedup();
    fields
}

fn denied(kind: PermissionKind, resource: &PersistentResource, expression: &PermissionExpression) -> GateError {
    GateError::Forbidden(format!(
        "{} denied on {}#{}: {}",
        kind,
        resource.type_name(),
        resource.display_id(),
        expression
    ))
}
