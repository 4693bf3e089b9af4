use std::fmt;

/// One ancestor on the path by which a resource was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageElement {
    pub type_name: String,
    pub id: String,
    /// Relationship followed from this ancestor, if any
    pub relationship: Option<String>,
}

/// Ordered ancestors, root first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLineage {
    path: Vec<LineageElement>,
}

impl ResourceLineage {
    pub fn new() -> Self {
        Self::default()
    }

    /// This lineage followed by one more ancestor.
    pub fn extend(&self, type_name: &str, id: &str, relationship: Option<&str>) -> Self {
        let mut path = self.path.clone();
        path.push(LineageElement {
            type_name: type_name.to_string(),
            id: id.to_string(),
            relationship: relationship.map(str::to_string),
        });
        Self { path }
    }

    pub fn path(&self) -> &[LineageElement] {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    pub fn parent(&self) -> Option<&LineageElement> {
        self.path.last()
    }

    pub fn contains_type(&self, type_name: &str) -> bool {
        self.path.iter().any(|e| e.type_name == type_name)
    }
}

impl fmt::Display for ResourceLineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.path.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}#{}", element.type_name, element.id)?;
            if let Some(relationship) = &element.relationship {
                write!(f, "/{}", relationship)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_keeps_parent_untouched() {
        let root = ResourceLineage::new();
        let publisher = root.extend("publisher", "1", Some("books"));
        let book = publisher.extend("book", "7", Some("authors"));

        assert!(root.is_empty());
        assert_eq!(publisher.path().len(), 1);
        assert_eq!(book.parent().map(|e| e.type_name.as_str()), Some("book"));
        assert!(book.contains_type("publisher"));
        assert!(!book.contains_type("author"));
        assert_eq!(book.to_string(), "publisher#1/books/book#7/authors");
    }
}
