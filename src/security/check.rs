use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::{FieldValue, GateError, Result};
use crate::filter::FilterExpression;
use crate::request::ChangeSpec;
use crate::resource::PersistentResource;

use super::User;

/// When a check can be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    /// Depends only on the principal. Evaluated as early as possible.
    User,
    /// Needs the resource. Evaluated inline.
    Operation,
    /// Needs the final state of the request. Evaluated at commit.
    Commit,
}

/// Named predicate over (resource, user, change).
pub trait Check: Send + Sync {
    fn kind(&self) -> CheckKind;

    fn ok(&self, resource: Option<&PersistentResource>, user: &User, change: Option<&ChangeSpec>) -> bool;

    /// Filter equivalent of this check, used to push read permissions down
    /// to the backend.
    fn filter_expression(&self, _type_name: &str, _user: &User) -> Option<FilterExpression> {
        None
    }
}

// ============================================================================
// Prefab checks
// ============================================================================

#[derive(Debug, Default)]
pub struct AllowAll;

impl Check for AllowAll {
    fn kind(&self) -> CheckKind {
        CheckKind::User
    }

    fn ok(&self, _: Option<&PersistentResource>, _: &User, _: Option<&ChangeSpec>) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct DenyAll;

impl Check for DenyAll {
    fn kind(&self) -> CheckKind {
        CheckKind::User
    }

    fn ok(&self, _: Option<&PersistentResource>, _: &User, _: Option<&ChangeSpec>) -> bool {
        false
    }
}

/// Passes for resources created in the current request.
#[derive(Debug, Default)]
pub struct UpdateOnCreate;

impl Check for UpdateOnCreate {
    fn kind(&self) -> CheckKind {
        CheckKind::Operation
    }

    fn ok(&self, resource: Option<&PersistentResource>, _: &User, _: Option<&ChangeSpec>) -> bool {
        resource.is_some_and(|r| r.is_newly_created().unwrap_or(false))
    }
}

/// Passes when a collection change only adds elements.
#[derive(Debug, Default)]
pub struct AppendOnly;

impl Check for AppendOnly {
    fn kind(&self) -> CheckKind {
        CheckKind::Operation
    }

    fn ok(&self, _: Option<&PersistentResource>, _: &User, change: Option<&ChangeSpec>) -> bool {
        match change {
            Some(ChangeSpec {
                original: FieldValue::ToMany(original),
                modified: FieldValue::ToMany(modified),
                ..
            }) => original.iter().all(|e| modified.contains(e)),
            _ => false,
        }
    }
}

/// Passes when a collection change only removes elements.
#[derive(Debug, Default)]
pub struct RemoveOnly;

impl Check for RemoveOnly {
    fn kind(&self) -> CheckKind {
        CheckKind::Operation
    }

    fn ok(&self, _: Option<&PersistentResource>, _: &User, change: Option<&ChangeSpec>) -> bool {
        match change {
            Some(ChangeSpec {
                original: FieldValue::ToMany(original),
                modified: FieldValue::ToMany(modified),
                ..
            }) => modified.iter().all(|e| original.contains(e)),
            _ => false,
        }
    }
}

/// Role membership check.
#[derive(Debug)]
pub struct RoleCheck {
    role: String,
}

impl RoleCheck {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }
}

impl Check for RoleCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::User
    }

    fn ok(&self, _: Option<&PersistentResource>, user: &User, _: Option<&ChangeSpec>) -> bool {
        user.has_role(&self.role)
    }
}

// ============================================================================
// Registry
// ============================================================================

pub type CheckFactory = Arc<dyn Fn() -> Arc<dyn Check> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    type_id: String,
    factory: CheckFactory,
}

/// Реестр проверок: имя -> фабрика
pub struct CheckRegistry {
    by_name: RwLock<HashMap<String, Registration>>,
    /// Canonical Rust type name -> factory
    by_type: RwLock<HashMap<String, Registration>>,
    instances: RwLock<HashMap<String, Arc<dyn Check>>>,
}

lazy_static::lazy_static! {
    static ref GLOBAL_CHECKS: Arc<CheckRegistry> = Arc::new(CheckRegistry::with_default_checks());
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self {
            by_name: RwLock::new(HashMap::new()),
            by_type: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the prefab checks
    pub fn with_default_checks() -> Self {
        let registry = Self::new();
        let defaults: [(&str, Result<()>); 5] = [
            ("Prefab.Role.All", registry.register::<AllowAll>("Prefab.Role.All")),
            ("Prefab.Role.None", registry.register::<DenyAll>("Prefab.Role.None")),
            (
                "Prefab.Common.UpdateOnCreate",
                registry.register::<UpdateOnCreate>("Prefab.Common.UpdateOnCreate"),
            ),
            (
                "Prefab.Collections.AppendOnly",
                registry.register::<AppendOnly>("Prefab.Collections.AppendOnly"),
            ),
            (
                "Prefab.Collections.RemoveOnly",
                registry.register::<RemoveOnly>("Prefab.Collections.RemoveOnly"),
            ),
        ];
        for (name, result) in defaults {
            if let Err(e) = result {
                tracing::error!(check = name, error = %e, "failed to register prefab check");
            }
        }
        registry
    }

    /// Process-wide registry shared by dictionaries that don't bring their own.
    pub fn global() -> Arc<CheckRegistry> {
        Arc::clone(&GLOBAL_CHECKS)
    }

    /// Registers a zero-argument-constructible check under `name` and under
    /// its canonical type name.
    pub fn register<C: Check + Default + 'static>(&self, name: &str) -> Result<()> {
        let factory: CheckFactory = Arc::new(|| Arc::new(C::default()) as Arc<dyn Check>);
        self.register_factory(name, std::any::type_name::<C>(), factory)
    }

    pub fn register_role(&self, name: &str, role: &str) -> Result<()> {
        let role = role.to_string();
        let factory: CheckFactory = Arc::new(move || Arc::new(RoleCheck::new(role.clone())) as Arc<dyn Check>);
        self.register_factory(name, &format!("{}[{}]", std::any::type_name::<RoleCheck>(), name), factory)
    }

    pub fn register_factory(&self, name: &str, type_id: &str, factory: CheckFactory) -> Result<()> {
        let registration = Registration {
            type_id: type_id.to_string(),
            factory,
        };

        let mut by_name = self.by_name.write()?;
        if let Some(existing) = by_name.get(name) {
            if existing.type_id == type_id {
                return Ok(());
            }
            return Err(GateError::DuplicateMapping(format!(
                "check '{}' is already bound to {}",
                name, existing.type_id
            )));
        }
        by_name.insert(name.to_string(), registration.clone());
        self.by_type
            .write()?
            .entry(type_id.to_string())
            .or_insert(registration);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.by_name.read()?.contains_key(name) || self.by_type.read()?.contains_key(name))
    }

    /// Resolves a check by registered name, falling back to the canonical
    /// type name. Each check is instantiated once.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Check>> {
        if let Some(instance) = self.instances.read()?.get(name) {
            return Ok(Arc::clone(instance));
        }

        let registration = match self.by_name.read()?.get(name) {
            Some(r) => Some(r.clone()),
            None => self.by_type.read()?.get(name).cloned(),
        };
        let registration = registration
            .ok_or_else(|| GateError::InvalidPermission(format!("unknown check '{}'", name)))?;

        // compute-if-absent
        let mut instances = self.instances.write()?;
        let instance = instances
            .entry(name.to_string())
            .or_insert_with(|| (registration.factory)());
        Ok(Arc::clone(instance))
    }
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::with_default_checks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefab_checks_registered() {
        let registry = CheckRegistry::with_default_checks();
        assert!(registry.contains("Prefab.Role.All").unwrap());
        assert!(registry.contains("Prefab.Collections.RemoveOnly").unwrap());

        let all = registry.resolve("Prefab.Role.All").unwrap();
        assert!(all.ok(None, &User::anonymous(), None));
        assert_eq!(all.kind(), CheckKind::User);
    }

    #[test]
    fn test_resolve_by_canonical_type_name() {
        let registry = CheckRegistry::with_default_checks();
        let check = registry.resolve(std::any::type_name::<DenyAll>()).unwrap();
        assert!(!check.ok(None, &User::anonymous(), None));
    }

    #[test]
    fn test_instances_are_shared() {
        let registry = CheckRegistry::with_default_checks();
        let a = registry.resolve("Prefab.Role.None").unwrap();
        let b = registry.resolve("Prefab.Role.None").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_conflicting_registration() {
        let registry = CheckRegistry::new();
        registry.register::<AllowAll>("open").unwrap();
        registry.register::<AllowAll>("open").unwrap();
        assert!(matches!(
            registry.register::<DenyAll>("open"),
            Err(GateError::DuplicateMapping(_))
        ));
    }

    #[test]
    fn test_unknown_check() {
        let registry = CheckRegistry::new();
        assert!(matches!(
            registry.resolve("nope"),
            Err(GateError::InvalidPermission(_))
        ));
    }

    #[test]
    fn test_role_check() {
        let registry = CheckRegistry::new();
        registry.register_role("is admin", "admin").unwrap();
        let check = registry.resolve("is admin").unwrap();
        assert!(check.ok(None, &User::named("root").with_role("admin"), None));
        assert!(!check.ok(None, &User::named("guest"), None));
    }
}
