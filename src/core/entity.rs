// ============================================================================
// Entity handles
// ============================================================================
//
// An Entity is a shared handle to one domain-object instance. Cloning the
// handle never copies the object: every clone observes the same fields.
// Identity is instance identity (InstanceId), never field equality.
//
// ============================================================================

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::{Result, Value};

/// Global instance counter
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an entity instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl InstanceId {
    pub fn new() -> Self {
        InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj_{}", self.0)
    }
}

/// Value stored in one field of an entity
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Attribute(Value),
    ToOne(Option<Entity>),
    ToMany(Vec<Entity>),
}

impl FieldValue {
    pub fn as_attribute(&self) -> Option<&Value> {
        match self {
            Self::Attribute(v) => Some(v),
            _ => None,
        }
    }

    /// Related entities, regardless of cardinality.
    pub fn entities(&self) -> Vec<Entity> {
        match self {
            Self::Attribute(_) => Vec::new(),
            Self::ToOne(one) => one.iter().cloned().collect(),
            Self::ToMany(many) => many.clone(),
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Self::ToMany(_))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attribute(v) => write!(f, "{}", v),
            Self::ToOne(None) => write!(f, "null"),
            Self::ToOne(Some(e)) => write!(f, "{}", e),
            Self::ToMany(many) => {
                write!(f, "[")?;
                for (i, e) in many.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, "]")
            }
        }
    }
}

struct EntityInner {
    instance: InstanceId,
    type_name: String,
    fields: RwLock<HashMap<String, FieldValue>>,
}

#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl Entity {
    /// Creates an empty instance of the given runtime type.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EntityInner {
                instance: InstanceId::new(),
                type_name: type_name.into(),
                fields: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance
    }

    /// Declared runtime type. May be a subtype or a backend proxy type.
    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn get(&self, field: &str) -> Result<Option<FieldValue>> {
        Ok(self.inner.fields.read()?.get(field).cloned())
    }

    pub fn set(&self, field: &str, value: FieldValue) -> Result<()> {
        self.inner.fields.write()?.insert(field.to_string(), value);
        Ok(())
    }

    pub fn with_field(self, field: &str, value: FieldValue) -> Result<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    pub fn attribute(&self, field: &str) -> Result<Value> {
        Ok(match self.get(field)? {
            Some(FieldValue::Attribute(v)) => v,
            _ => Value::Null,
        })
    }

    pub fn set_attribute(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        self.set(field, FieldValue::Attribute(value.into()))
    }

    pub fn to_one(&self, field: &str) -> Result<Option<Entity>> {
        Ok(match self.get(field)? {
            Some(FieldValue::ToOne(one)) => one,
            _ => None,
        })
    }

    pub fn to_many(&self, field: &str) -> Result<Vec<Entity>> {
        Ok(match self.get(field)? {
            Some(FieldValue::ToMany(many)) => many,
            _ => Vec::new(),
        })
    }

    pub fn field_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.inner.fields.read()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.inner.instance == other.inner.instance
    }
}

impl Eq for Entity {}

impl std::hash::Hash for Entity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.instance.hash(state);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}#{})", self.inner.type_name, self.inner.instance.0)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.inner.type_name, self.inner.instance.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_fields() {
        let book = Entity::new("book");
        let alias = book.clone();
        book.set_attribute("title", "Dune").unwrap();

        assert_eq!(alias.attribute("title").unwrap(), Value::from("Dune"));
        assert_eq!(book, alias);
    }

    #[test]
    fn test_identity_is_per_instance() {
        let a = Entity::new("book");
        let b = Entity::new("book");
        a.set_attribute("id", 1i64).unwrap();
        b.set_attribute("id", 1i64).unwrap();

        assert_ne!(a, b);
        assert!(a.instance_id() < b.instance_id());
    }

    #[test]
    fn test_relationship_fields() {
        let author = Entity::new("author");
        let book = Entity::new("book");
        book.set("authors", FieldValue::ToMany(vec![author.clone()])).unwrap();
        author.set("featured", FieldValue::ToOne(Some(book.clone()))).unwrap();

        assert_eq!(book.to_many("authors").unwrap(), vec![author.clone()]);
        assert_eq!(author.to_one("featured").unwrap(), Some(book));
        assert!(author.to_many("missing").unwrap().is_empty());
    }
}
