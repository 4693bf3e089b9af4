use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use regex::Regex;

use super::{FilterExpression, FilterPredicate, Operator};
use crate::core::{DataType, Entity, FieldValue, GateError, Result, Value};
use crate::dictionary::EntityDictionary;

lazy_static::lazy_static! {
    static ref REGEX_LRU_CACHE: Arc<Mutex<LruCache<String, Arc<Regex>>>> =
        Arc::new(Mutex::new(LruCache::new(NonZeroUsize::new(200).unwrap_or(NonZeroUsize::MIN))));
}

fn cached_regex(pattern: &str) -> Result<Arc<Regex>> {
    let mut cache = REGEX_LRU_CACHE.lock()?;
    if let Some(regex) = cache.get(pattern) {
        return Ok(Arc::clone(regex));
    }
    let regex = Arc::new(
        Regex::new(pattern).map_err(|e| GateError::InvalidValue(format!("bad pattern: {}", e)))?,
    );
    cache.put(pattern.to_string(), Arc::clone(&regex));
    Ok(regex)
}

/// Evaluates filter expressions against live entities. Used when the
/// transaction does not push filtering down to the backend.
pub struct InMemoryFilterEvaluator<'a> {
    dictionary: &'a EntityDictionary,
}

impl<'a> InMemoryFilterEvaluator<'a> {
    pub fn new(dictionary: &'a EntityDictionary) -> Self {
        Self { dictionary }
    }

    pub fn matches(&self, expression: &FilterExpression, entity: &Entity) -> Result<bool> {
        match expression {
            FilterExpression::Predicate(p) => self.matches_predicate(p, entity),
            FilterExpression::And(l, r) => Ok(self.matches(l, entity)? && self.matches(r, entity)?),
            FilterExpression::Or(l, r) => Ok(self.matches(l, entity)? || self.matches(r, entity)?),
            FilterExpression::Not(e) => Ok(!self.matches(e, entity)?),
        }
    }

    /// A multi-hop path matches if any entity reached through it satisfies
    /// the operator.
    pub fn matches_predicate(&self, predicate: &FilterPredicate, entity: &Entity) -> Result<bool> {
        match predicate.operator {
            Operator::True => return Ok(true),
            Operator::False => return Ok(false),
            _ => {}
        }

        let values = self.resolve_path(predicate, entity)?;
        if values.is_empty() {
            return apply_operator(predicate.operator, &Value::Null, &predicate.values);
        }
        for value in &values {
            if apply_operator(predicate.operator, value, &predicate.values)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn resolve_path(&self, predicate: &FilterPredicate, entity: &Entity) -> Result<Vec<Value>> {
        let elements = &predicate.path.elements;
        let mut frontier = vec![entity.clone()];

        for (i, element) in elements.iter().enumerate() {
            let last = i + 1 == elements.len();
            let mut next = Vec::new();
            let mut leaves = Vec::new();

            for current in &frontier {
                match current.get(&element.field_name)? {
                    Some(FieldValue::Attribute(value)) if last => leaves.push(value),
                    Some(FieldValue::Attribute(_)) => {
                        return Err(GateError::BadRequest(format!(
                            "'{}' is not a relationship in {}",
                            element.field_name, predicate.path
                        )));
                    }
                    Some(relation) if last => {
                        for related in relation.entities() {
                            if let Some(id) = self.dictionary.get_id(&related)? {
                                leaves.push(Value::Text(id));
                            }
                        }
                    }
                    Some(relation) => next.extend(relation.entities()),
                    None if last => leaves.push(current.attribute(&element.field_name)?),
                    None => {}
                }
            }

            if last {
                return Ok(leaves);
            }
            frontier = next;
        }
        Ok(Vec::new())
    }
}

fn align(target: &Value, candidate: &Value) -> Value {
    let data_type = match target {
        Value::Integer(_) => DataType::Integer,
        Value::Float(_) => DataType::Float,
        Value::Text(_) => DataType::Text,
        Value::Boolean(_) => DataType::Boolean,
        Value::Uuid(_) => DataType::Uuid,
        Value::Date(_) => DataType::Date,
        _ => return candidate.clone(),
    };
    data_type.coerce(candidate.clone()).unwrap_or_else(|_| candidate.clone())
}

fn apply_operator(operator: Operator, value: &Value, operands: &[Value]) -> Result<bool> {
    let first = || {
        operands.first().ok_or_else(|| {
            GateError::BadRequest(format!("operator {} requires a value", operator.keyword()))
        })
    };

    Ok(match operator {
        Operator::True => true,
        Operator::False => false,
        Operator::IsNull => value.is_null(),
        Operator::NotNull => !value.is_null(),
        Operator::In => !value.is_null() && operands.iter().any(|o| align(value, o) == *value),
        Operator::NotIn => value.is_null() || !operands.iter().any(|o| align(value, o) == *value),
        Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => {
            if value.is_null() {
                return Ok(false);
            }
            let ordering = value.compare(&align(value, first()?))?;
            match operator {
                Operator::Lt => ordering.is_lt(),
                Operator::Le => ordering.is_le(),
                Operator::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }
        }
        Operator::Prefix | Operator::Postfix | Operator::Infix => {
            let (Some(text), Some(needle)) = (value.as_str(), first()?.as_str()) else {
                return Ok(false);
            };
            match operator {
                Operator::Prefix => text.starts_with(needle),
                Operator::Postfix => text.ends_with(needle),
                _ => text.contains(needle),
            }
        }
        Operator::PrefixCaseInsensitive | Operator::InfixCaseInsensitive => {
            let (Some(text), Some(needle)) = (value.as_str(), first()?.as_str()) else {
                return Ok(false);
            };
            let anchor = if operator == Operator::PrefixCaseInsensitive { "^" } else { "" };
            let pattern = format!("(?i){}{}", anchor, regex::escape(needle));
            cached_regex(&pattern)?.is_match(text)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::EntityDescriptor;
    use crate::filter::Path;

    fn dictionary() -> EntityDictionary {
        let dictionary = EntityDictionary::new();
        dictionary
            .bind_descriptor(
                EntityDescriptor::new("author")
                    .id("id", DataType::Integer)
                    .attribute("name", DataType::Text),
            )
            .unwrap();
        dictionary
            .bind_descriptor(
                EntityDescriptor::new("book")
                    .id("id", DataType::Integer)
                    .attribute("title", DataType::Text)
                    .attribute("year", DataType::Integer)
                    .many_to_many("authors", "author"),
            )
            .unwrap();
        dictionary
    }

    fn book(title: &str, year: i64, authors: Vec<Entity>) -> Entity {
        let book = Entity::new("book");
        book.set_attribute("title", title).unwrap();
        book.set_attribute("year", year).unwrap();
        book.set("authors", FieldValue::ToMany(authors)).unwrap();
        book
    }

    fn author(id: i64, name: &str) -> Entity {
        let author = Entity::new("author");
        author.set_attribute("id", id).unwrap();
        author.set_attribute("name", name).unwrap();
        author
    }

    #[test]
    fn test_attribute_operators() {
        let dictionary = dictionary();
        let evaluator = InMemoryFilterEvaluator::new(&dictionary);
        let dune = book("Dune", 1965, vec![]);

        let year_lt = FilterExpression::predicate(Path::field("book", "year"), Operator::Lt, vec![1970i64.into()]);
        let title_in = FilterExpression::predicate(Path::field("book", "title"), Operator::In, vec!["Emma".into()]);

        assert!(evaluator.matches(&year_lt, &dune).unwrap());
        assert!(!evaluator.matches(&title_in, &dune).unwrap());
        assert!(evaluator.matches(&FilterExpression::or(year_lt, title_in), &dune).unwrap());
    }

    #[test]
    fn test_text_value_coerced_to_attribute_type() {
        let dictionary = dictionary();
        let evaluator = InMemoryFilterEvaluator::new(&dictionary);
        let dune = book("Dune", 1965, vec![]);

        let year_in = FilterExpression::predicate(Path::field("book", "year"), Operator::In, vec!["1965".into()]);
        assert!(evaluator.matches(&year_in, &dune).unwrap());
    }

    #[test]
    fn test_case_insensitive_prefix() {
        let dictionary = dictionary();
        let evaluator = InMemoryFilterEvaluator::new(&dictionary);
        let dune = book("Dune Messiah", 1969, vec![]);

        let prefix = FilterExpression::predicate(
            Path::field("book", "title"),
            Operator::PrefixCaseInsensitive,
            vec!["dune m".into()],
        );
        let infix = FilterExpression::predicate(
            Path::field("book", "title"),
            Operator::InfixCaseInsensitive,
            vec!["MESS".into()],
        );
        assert!(evaluator.matches(&prefix, &dune).unwrap());
        assert!(evaluator.matches(&infix, &dune).unwrap());
    }

    #[test]
    fn test_relationship_path_is_existential() {
        let dictionary = dictionary();
        let evaluator = InMemoryFilterEvaluator::new(&dictionary);
        let dune = book("Dune", 1965, vec![author(1, "Herbert"), author(2, "Anderson")]);

        let by_name = FilterExpression::predicate(
            Path::field("book", "authors").then("author", "name"),
            Operator::In,
            vec!["Anderson".into()],
        );
        let by_id = FilterExpression::predicate(Path::field("book", "authors"), Operator::In, vec!["1".into()]);

        assert!(evaluator.matches(&by_name, &dune).unwrap());
        assert!(evaluator.matches(&by_id, &dune).unwrap());
    }

    #[test]
    fn test_null_semantics() {
        let dictionary = dictionary();
        let evaluator = InMemoryFilterEvaluator::new(&dictionary);
        let untitled = Entity::new("book");

        let is_null = FilterExpression::predicate(Path::field("book", "title"), Operator::IsNull, vec![]);
        let not_in = FilterExpression::predicate(Path::field("book", "title"), Operator::NotIn, vec!["x".into()]);
        let gt = FilterExpression::predicate(Path::field("book", "year"), Operator::Gt, vec![1i64.into()]);

        assert!(evaluator.matches(&is_null, &untitled).unwrap());
        assert!(evaluator.matches(&not_in, &untitled).unwrap());
        assert!(!evaluator.matches(&gt, &untitled).unwrap());
    }
}
