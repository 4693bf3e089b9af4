use std::collections::{BTreeMap, HashSet};

use crate::core::Value;

/// Principal of one request.
#[derive(Debug, Clone, Default)]
pub struct User {
    name: Option<String>,
    roles: HashSet<String>,
    attributes: BTreeMap<String, Value>,
}

impl User {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.is_none()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        let user = User::named("alice").with_role("admin");
        assert!(user.has_role("admin"));
        assert!(!user.has_role("guest"));
        assert!(!user.is_anonymous());
        assert!(User::anonymous().is_anonymous());
    }
}
