use super::expression::ExpressionParser;
use super::table::{MetaDataStore, SqlTable};
use crate::core::Result;
use crate::filter::{FilterExpression, FilterExpressionVisitor, FilterPredicate};

/// WHERE filter split across the stages of a nested query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitFilter {
    /// Join-free predicates, evaluated before aggregation
    pub inner: Option<FilterExpression>,
    /// Predicates that need a join, evaluated after it
    pub outer: Option<FilterExpression>,
}

/// Classifies each leaf of a WHERE filter by whether its column needs a join.
///
/// AND distributes over the stages. An OR (or a NOT that could not be pushed
/// to the leaves) touching a join-requiring predicate moves to the outer stage
/// whole, since evaluating half of it earlier changes which rows survive.
pub struct SubqueryFilterSplitter<'a> {
    table: &'a SqlTable,
    parser: ExpressionParser<'a>,
}

impl<'a> SubqueryFilterSplitter<'a> {
    pub fn new(table: &'a SqlTable, store: &'a MetaDataStore) -> Self {
        Self {
            table,
            parser: ExpressionParser::new(store),
        }
    }

    pub fn split(&mut self, filter: Option<&FilterExpression>) -> Result<SplitFilter> {
        match filter {
            Some(filter) => filter.normalize().accept(self),
            None => Ok(SplitFilter::default()),
        }
    }

    pub fn requires_join(&self, field: &str) -> Result<bool> {
        let column = self.table.require_column(field)?;
        self.parser.requires_join(self.table, &column.expression)
    }
}

impl FilterExpressionVisitor<Result<SplitFilter>> for SubqueryFilterSplitter<'_> {
    fn visit_predicate(&mut self, predicate: &FilterPredicate) -> Result<SplitFilter> {
        let expression = Some(FilterExpression::Predicate(predicate.clone()));
        Ok(if self.requires_join(predicate.field_name())? {
            SplitFilter { inner: None, outer: expression }
        } else {
            SplitFilter { inner: expression, outer: None }
        })
    }

    fn visit_and(&mut self, left: &FilterExpression, right: &FilterExpression) -> Result<SplitFilter> {
        let l = left.accept(self)?;
        let r = right.accept(self)?;
        Ok(SplitFilter {
            inner: FilterExpression::and_optional(l.inner, r.inner),
            outer: FilterExpression::and_optional(l.outer, r.outer),
        })
    }

    fn visit_or(&mut self, left: &FilterExpression, right: &FilterExpression) -> Result<SplitFilter> {
        let l = left.accept(self)?;
        let r = right.accept(self)?;
        if l.outer.is_none() && r.outer.is_none() {
            return Ok(SplitFilter {
                inner: Some(FilterExpression::or(left.clone(), right.clone())),
                outer: None,
            });
        }
        Ok(SplitFilter {
            inner: None,
            outer: Some(FilterExpression::or(left.clone(), right.clone())),
        })
    }

    fn visit_not(&mut self, expression: &FilterExpression) -> Result<SplitFilter> {
        let split = expression.accept(self)?;
        let negated = Some(FilterExpression::negate(expression.clone()));
        Ok(if split.outer.is_none() {
            SplitFilter { inner: negated, outer: None }
        } else {
            SplitFilter { inner: None, outer: negated }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::table::{ColumnDefinition, JoinDefinition};
    use crate::core::Value;
    use crate::filter::{Operator, Path};

    fn store() -> MetaDataStore {
        let store = MetaDataStore::new();
        store
            .with_table(
                SqlTable::new("country", "countries")
                    .with_column(ColumnDefinition::dimension("isoCode", "{{$iso_code}}")),
            )
            .unwrap();
        store
            .with_table(
                SqlTable::new("playerStats", "playerStats")
                    .with_column(ColumnDefinition::dimension("overallRating", "{{$overallRating}}"))
                    .with_column(ColumnDefinition::dimension("countryIsoCode", "{{country.isoCode}}"))
                    .with_join(JoinDefinition::left("country", "country", "{{$country_id}} = {{country.$id}}")),
            )
            .unwrap();
        store
    }

    fn rating() -> FilterExpression {
        FilterExpression::predicate(
            Path::field("playerStats", "overallRating"),
            Operator::In,
            vec![Value::Text("Good".into())],
        )
    }

    fn iso() -> FilterExpression {
        FilterExpression::predicate(
            Path::field("playerStats", "countryIsoCode"),
            Operator::In,
            vec![Value::Text("USA".into())],
        )
    }

    #[test]
    fn test_and_distributes() {
        let store = store();
        let table = store.table("playerStats").unwrap();
        let filter = FilterExpression::and(rating(), iso());

        let split = SubqueryFilterSplitter::new(&table, &store).split(Some(&filter)).unwrap();
        assert_eq!(split.inner, Some(rating()));
        assert_eq!(split.outer, Some(iso()));
    }

    #[test]
    fn test_or_with_join_goes_outer_whole() {
        let store = store();
        let table = store.table("playerStats").unwrap();
        let filter = FilterExpression::or(rating(), iso());

        let split = SubqueryFilterSplitter::new(&table, &store).split(Some(&filter)).unwrap();
        assert_eq!(split.inner, None);
        assert_eq!(split.outer, Some(filter));
    }

    #[test]
    fn test_not_is_normalized_first() {
        let store = store();
        let table = store.table("playerStats").unwrap();
        // NOT (rating OR iso) => NOT rating AND NOT iso
        let filter = FilterExpression::negate(FilterExpression::or(rating(), iso()));

        let split = SubqueryFilterSplitter::new(&table, &store).split(Some(&filter)).unwrap();
        assert_eq!(split.inner.unwrap().predicates()[0].operator, Operator::NotIn);
        assert_eq!(split.outer.unwrap().predicates()[0].operator, Operator::NotIn);
    }
}
