//! In-memory PostgreSQL with pgvector.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use veclens_core::{DistanceMetric, Item, Ranking};
use veclens_vector::pgvector::{
    PgHit, PgTableInfo, PgVectorTransport, SqlCondition, SqlOrdering, SqlPredicate, SqlTarget,
    SqlWhere,
};
use veclens_vector::{TransportError, TransportResult};

use super::top;

#[derive(Debug)]
struct Table {
    info: PgTableInfo,
    rows: BTreeMap<String, Item>,
}

/// Database kept in memory. Rows are ordered by id like the real `ORDER BY
/// id` reads.
#[derive(Debug, Default)]
pub struct FakePgVector {
    tables: BTreeMap<String, Table>,
}

impl FakePgVector {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&mut self, name: &str) -> TransportResult<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| TransportError::not_found(format!("table '{}'", name)))
    }
}

/// Evaluates a conjunction with SQL null and jsonb semantics: a missing key
/// reads as `NULL`, which only the negated predicates turn into true, and
/// `@>` compares numbers by value and looks into top-level arrays.
pub fn where_matches(filter: &SqlWhere, item: &Item) -> bool {
    filter.conditions.iter().all(|c| condition_matches(c, item))
}

/// `field @> value` for a scalar `value`.
fn jsonb_contains(field: &Value, value: &Value) -> bool {
    let equal = |a: &Value| match (a, value) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == value,
    };
    match field {
        Value::Array(elements) => elements.iter().any(equal),
        other => equal(other),
    }
}

fn contains(field: &Value, needle: &Value) -> bool {
    match (field, needle) {
        (Value::String(text), Value::String(needle)) => text.contains(needle.as_str()),
        (Value::String(_), _) => false,
        (Value::Array(_), needle) => jsonb_contains(field, needle),
        _ => false,
    }
}

fn condition_matches(condition: &SqlCondition, item: &Item) -> bool {
    let json = match &condition.target {
        SqlTarget::Document => item.document.clone().map(Value::String),
        SqlTarget::Metadata(key) => item.metadata.get(key).cloned(),
    };
    let is_document = condition.target == SqlTarget::Document;
    let text_in = |values: &[String]| {
        json.as_ref()
            .and_then(Value::as_str)
            .is_some_and(|t| values.iter().any(|v| v == t))
    };

    match &condition.predicate {
        SqlPredicate::TextIn(values) => is_document && text_in(values),
        SqlPredicate::TextNotIn(values) => !is_document || !text_in(values),
        SqlPredicate::TextCmp(ordering, value) => json
            .as_ref()
            .and_then(Value::as_str)
            .is_some_and(|t| holds(*ordering, t.cmp(value.as_str()))),
        SqlPredicate::NumericCmp(ordering, value) => json
            .as_ref()
            .filter(|v| v.is_number())
            .and_then(Value::as_f64)
            .and_then(|n| n.partial_cmp(value))
            .is_some_and(|o| holds(*ordering, o)),
        SqlPredicate::JsonIn(candidates) => {
            !is_document
                && json
                    .as_ref()
                    .is_some_and(|field| candidates.iter().any(|c| jsonb_contains(field, c)))
        }
        SqlPredicate::JsonNotIn(candidates) => {
            is_document
                || json
                    .as_ref()
                    .is_none_or(|field| !candidates.iter().any(|c| jsonb_contains(field, c)))
        }
        SqlPredicate::Contains(needle) => json.as_ref().is_some_and(|f| contains(f, needle)),
        SqlPredicate::NotContains(needle) => !json.as_ref().is_some_and(|f| contains(f, needle)),
    }
}

fn holds(ordering: SqlOrdering, actual: std::cmp::Ordering) -> bool {
    match ordering {
        SqlOrdering::Gt => actual.is_gt(),
        SqlOrdering::Gte => actual.is_ge(),
        SqlOrdering::Lt => actual.is_lt(),
        SqlOrdering::Lte => actual.is_le(),
    }
}

#[async_trait]
impl PgVectorTransport for FakePgVector {
    async fn ping(&mut self) -> TransportResult<()> {
        Ok(())
    }

    async fn list_tables(&mut self) -> TransportResult<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    async fn create_table(
        &mut self,
        table: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> TransportResult<()> {
        if self.tables.contains_key(table) {
            return Err(TransportError::Api {
                code: 0,
                message: format!("relation \"{}\" already exists", table),
            });
        }
        self.tables.insert(
            table.to_string(),
            Table {
                info: PgTableInfo {
                    dimension: Some(dimension),
                    metric,
                },
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn drop_table(&mut self, table: &str) -> TransportResult<()> {
        self.tables
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| TransportError::not_found(format!("table '{}'", table)))
    }

    async fn table_info(&mut self, table: &str) -> TransportResult<PgTableInfo> {
        Ok(self.table(table)?.info)
    }

    async fn upsert(&mut self, table: &str, items: Vec<Item>) -> TransportResult<()> {
        let stored = self.table(table)?;
        if let Some(expected) = stored.info.dimension {
            let wrong = items
                .iter()
                .filter_map(|item| item.embedding.as_ref())
                .find(|v| v.len() != expected);
            if let Some(vector) = wrong {
                return Err(TransportError::Api {
                    code: 0,
                    message: format!("expected {} dimensions, not {}", expected, vector.len()),
                });
            }
        }
        for item in items {
            stored.rows.insert(item.id.clone(), item);
        }
        Ok(())
    }

    async fn fetch(&mut self, table: &str, ids: &[String]) -> TransportResult<Vec<Item>> {
        let stored = self.table(table)?;
        Ok(stored
            .rows
            .values()
            .filter(|item| ids.contains(&item.id))
            .cloned()
            .collect())
    }

    async fn select(
        &mut self,
        table: &str,
        filter: Option<&SqlWhere>,
        offset: usize,
        limit: Option<usize>,
    ) -> TransportResult<Vec<Item>> {
        let stored = self.table(table)?;
        Ok(stored
            .rows
            .values()
            .filter(|item| filter.is_none_or(|f| where_matches(f, item)))
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn delete(&mut self, table: &str, ids: &[String]) -> TransportResult<()> {
        let stored = self.table(table)?;
        for id in ids {
            stored.rows.remove(id);
        }
        Ok(())
    }

    async fn delete_where(&mut self, table: &str, filter: &SqlWhere) -> TransportResult<()> {
        let stored = self.table(table)?;
        stored.rows.retain(|_, item| !where_matches(filter, item));
        Ok(())
    }

    async fn count(&mut self, table: &str) -> TransportResult<u64> {
        Ok(self.table(table)?.rows.len() as u64)
    }

    async fn nearest(
        &mut self,
        table: &str,
        vector: Vec<f32>,
        metric: DistanceMetric,
        filter: Option<&SqlWhere>,
        limit: usize,
    ) -> TransportResult<Vec<PgHit>> {
        let stored = self.table(table)?;
        let scored = stored
            .rows
            .values()
            .filter(|item| filter.is_none_or(|f| where_matches(f, item)))
            .filter_map(|item| {
                let embedding = item.embedding.as_ref()?;
                Some((item.clone(), metric.distance(&vector, embedding)))
            })
            .collect();

        Ok(top(scored, Ranking::Distance, limit)
            .into_iter()
            .map(|(item, distance)| PgHit { item, distance })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use veclens_core::{CanonicalFilter, FilterCompiler, Operator};
    use veclens_vector::pgvector::PgVectorFilterCompiler;

    use super::*;

    #[test]
    fn test_numeric_range_skips_text_values() {
        let filter = CanonicalFilter::new().with("score", Operator::Gt, 5);
        let native = PgVectorFilterCompiler.compile(&filter).unwrap().native.unwrap();

        assert!(where_matches(&native, &Item::new("a").with_field("score", 10)));
        assert!(!where_matches(&native, &Item::new("b").with_field("score", "10")));
        assert!(!where_matches(&native, &Item::new("c")));
    }

    #[test]
    fn test_equality_looks_into_lists_and_numbers() {
        let filter = CanonicalFilter::new().where_eq("tags", "x");
        let native = PgVectorFilterCompiler.compile(&filter).unwrap().native.unwrap();
        assert!(where_matches(&native, &Item::new("a").with_field("tags", json!(["x", "y"]))));
        assert!(!where_matches(&native, &Item::new("b").with_field("tags", json!(["xy"]))));

        let filter = CanonicalFilter::new().where_eq("n", 5.0);
        let native = PgVectorFilterCompiler.compile(&filter).unwrap().native.unwrap();
        assert!(where_matches(&native, &Item::new("c").with_field("n", 5)));
    }

    #[test]
    fn test_contains_on_numbers_never_matches() {
        let filter = CanonicalFilter::new().with("n", Operator::Contains, "1");
        let native = PgVectorFilterCompiler.compile(&filter).unwrap().native.unwrap();
        assert!(!where_matches(&native, &Item::new("a").with_field("n", 15)));
        assert!(where_matches(&native, &Item::new("b").with_field("n", "15")));
    }

    #[test]
    fn test_distinct_from_holds_for_missing_key() {
        let filter = CanonicalFilter::new().with("status", Operator::Ne, "active");
        let native = PgVectorFilterCompiler.compile(&filter).unwrap().native.unwrap();

        assert!(where_matches(&native, &Item::new("a")));
        assert!(!where_matches(&native, &Item::new("b").with_field("status", "active")));
    }
}
