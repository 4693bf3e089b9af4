use std::cmp::Ordering;

use crate::core::{Entity, FieldValue, GateError, Result, Value};
use crate::filter::{FilterExpression, Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Ordered sort keys. Earlier keys take precedence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sorting {
    pub keys: Vec<(Path, SortOrder)>,
}

impl Sorting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by(mut self, path: Path, order: SortOrder) -> Self {
        self.keys.push((path, order));
        self
    }

    pub fn is_default(&self) -> bool {
        self.keys.is_empty()
    }

    /// Stable in-memory sort. Missing values sort last.
    pub fn sort(&self, entities: &mut Vec<Entity>) -> Result<()> {
        let mut keyed: Vec<(Vec<Value>, Entity)> = Vec::with_capacity(entities.len());
        for entity in entities.drain(..) {
            let mut values = Vec::with_capacity(self.keys.len());
            for (path, _) in &self.keys {
                values.push(resolve_sort_value(&entity, path)?);
            }
            keyed.push((values, entity));
        }

        let mut failure = None;
        keyed.sort_by(|(a, _), (b, _)| {
            for (i, (_, order)) in self.keys.iter().enumerate() {
                let ordering = match a[i].compare(&b[i]) {
                    Ok(ordering) => ordering,
                    Err(e) => {
                        failure.get_or_insert(e);
                        Ordering::Equal
                    }
                };
                let ordering = if *order == SortOrder::Desc && !a[i].is_null() && !b[i].is_null() {
                    ordering.reverse()
                } else {
                    ordering
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        if let Some(e) = failure {
            return Err(e);
        }

        entities.extend(keyed.into_iter().map(|(_, entity)| entity));
        Ok(())
    }
}

/// Sort keys may only traverse to-one relationships.
fn resolve_sort_value(entity: &Entity, path: &Path) -> Result<Value> {
    let mut current = entity.clone();
    let last = path.elements.len().saturating_sub(1);
    for (i, element) in path.elements.iter().enumerate() {
        match current.get(&element.field_name)? {
            Some(FieldValue::Attribute(value)) if i == last => return Ok(value),
            None if i == last => return Ok(Value::Null),
            Some(FieldValue::ToOne(Some(next))) if i < last => current = next,
            Some(FieldValue::ToOne(None)) | None => return Ok(Value::Null),
            _ => {
                return Err(GateError::BadRequest(format!("cannot sort by {}", path)));
            }
        }
    }
    Ok(Value::Null)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
    pub return_page_totals: bool,
    /// Filled in after the load when totals were requested
    pub page_totals: Option<usize>,
}

impl Pagination {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit,
            return_page_totals: false,
            page_totals: None,
        }
    }

    pub fn with_page_totals(mut self) -> Self {
        self.return_page_totals = true;
        self
    }

    pub fn validate(&self, max_page_size: usize) -> Result<()> {
        if self.limit == 0 {
            return Err(GateError::BadRequest("pagination limit must be positive".into()));
        }
        if self.limit > max_page_size {
            return Err(GateError::BadRequest(format!(
                "pagination limit must be less than or equal to {}",
                max_page_size
            )));
        }
        Ok(())
    }

    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().skip(self.offset).take(self.limit).collect()
    }
}

/// What a load asks for: type, sparse fields, filter, sort and page.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityProjection {
    pub type_name: String,
    /// Empty means every attribute
    pub attributes: Vec<String>,
    /// Empty means every relationship
    pub relationships: Vec<String>,
    pub filter: Option<FilterExpression>,
    pub sorting: Option<Sorting>,
    pub pagination: Option<Pagination>,
}

impl EntityProjection {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            filter: None,
            sorting: None,
            pagination: None,
        }
    }

    pub fn attributes<S: AsRef<str>>(mut self, attributes: &[S]) -> Self {
        self.attributes = attributes.iter().map(|a| a.as_ref().to_string()).collect();
        self
    }

    pub fn relationships<S: AsRef<str>>(mut self, relationships: &[S]) -> Self {
        self.relationships = relationships.iter().map(|r| r.as_ref().to_string()).collect();
        self
    }

    pub fn filter(mut self, filter: FilterExpression) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn sorting(mut self, sorting: Sorting) -> Self {
        self.sorting = Some(sorting);
        self
    }

    pub fn pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }

    /// Fields named by the sparse fieldset, `None` when unrestricted.
    pub fn requested_fields(&self) -> Option<Vec<String>> {
        if self.attributes.is_empty() && self.relationships.is_empty() {
            return None;
        }
        let mut fields = self.attributes.clone();
        fields.extend(self.relationships.iter().cloned());
        Some(fields)
    }

    pub fn includes_attribute(&self, field: &str) -> bool {
        self.attributes.is_empty() || self.attributes.iter().any(|a| a == field)
    }

    pub fn includes_relationship(&self, field: &str) -> bool {
        self.relationships.is_empty() || self.relationships.iter().any(|r| r == field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(title: &str, year: i64) -> Entity {
        let book = Entity::new("book");
        book.set_attribute("title", title).unwrap();
        book.set_attribute("year", year).unwrap();
        book
    }

    fn titles(entities: &[Entity]) -> Vec<String> {
        entities
            .iter()
            .map(|e| e.attribute("title").unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_multi_key_sort() {
        let mut books = vec![book("B", 2000), book("A", 2000), book("C", 1990)];
        Sorting::new()
            .by(Path::field("book", "year"), SortOrder::Desc)
            .by(Path::field("book", "title"), SortOrder::Asc)
            .sort(&mut books)
            .unwrap();
        assert_eq!(titles(&books), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_nulls_sort_last_in_both_directions() {
        let untitled = Entity::new("book");
        let mut books = vec![untitled.clone(), book("A", 1), book("B", 2)];
        Sorting::new()
            .by(Path::field("book", "title"), SortOrder::Desc)
            .sort(&mut books)
            .unwrap();
        assert_eq!(books.last(), Some(&untitled));
    }

    #[test]
    fn test_pagination_window_and_limits() {
        let books = vec![book("A", 1), book("B", 2), book("C", 3)];
        let page = Pagination::new(1, 1);
        assert_eq!(titles(&page.apply(books)), vec!["B"]);

        assert!(Pagination::new(0, 0).validate(100).is_err());
        assert!(Pagination::new(0, 101).validate(100).is_err());
        assert!(Pagination::new(0, 100).validate(100).is_ok());
    }

    #[test]
    fn test_sparse_fields() {
        let projection = EntityProjection::new("book").attributes(&["title"]);
        assert!(projection.includes_attribute("title"));
        assert!(!projection.includes_attribute("year"));
        assert!(projection.includes_relationship("authors"));
        assert_eq!(projection.requested_fields(), Some(vec!["title".to_string()]));
        assert_eq!(EntityProjection::new("book").requested_fields(), None);
    }
}
