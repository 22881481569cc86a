//! Canonical filter to SQL `WHERE` compilation.
//!
//! Clauses on `document` address the text column. Every other field is read
//! from the `metadata` JSONB column. Equality and list membership use jsonb
//! containment (`->` then `@>`), so numbers compare by value and a list-valued
//! field matches when one of its elements does. Ordering comparisons only see
//! values of the matching JSON type, guarded by `jsonb_typeof` so that other
//! values never reach a cast. Keys and values are always bound parameters.

use serde_json::Value;
use veclens_core::filter::FieldTarget;
use veclens_core::{Capabilities, Clause, Error, FilterCompiler, Operator, Result};

/// Column holding the document text.
pub const DOCUMENT_COLUMN: &str = "document";

/// Column holding the metadata object.
pub const METADATA_COLUMN: &str = "metadata";

/// A bound query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// `TEXT`.
    Text(String),
    /// `DOUBLE PRECISION`.
    Float(f64),
    /// `TEXT[]`.
    TextArray(Vec<String>),
    /// `BIGINT`.
    BigInt(i64),
    /// `JSONB`.
    Json(Value),
}

/// What a condition reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlTarget {
    /// The document text column.
    Document,
    /// A key of the metadata column.
    Metadata(String),
}

/// Ordering comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOrdering {
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
}

impl SqlOrdering {
    fn from_operator(operator: Operator) -> Option<Self> {
        match operator {
            Operator::Gt => Some(Self::Gt),
            Operator::Gte => Some(Self::Gte),
            Operator::Lt => Some(Self::Lt),
            Operator::Lte => Some(Self::Lte),
            _ => None,
        }
    }

    /// Returns the SQL operator.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// Predicate applied to a target. A missing key reads as SQL `NULL`; only
/// the negated predicates turn it into true.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlPredicate {
    /// Document only: `text = ANY($v)`.
    TextIn(Vec<String>),
    /// Document only: `NOT COALESCE(text = ANY($v), false)`.
    TextNotIn(Vec<String>),
    /// `text <op> $v`, lexicographic, only for JSON strings.
    TextCmp(SqlOrdering, String),
    /// `number <op> $v`, only for JSON numbers.
    NumericCmp(SqlOrdering, f64),
    /// Metadata only: `(metadata -> key) @> $v` for any candidate.
    JsonIn(Vec<Value>),
    /// Metadata only: no candidate is contained, true for a missing key.
    JsonNotIn(Vec<Value>),
    /// Substring of a string, or element of a list.
    Contains(Value),
    /// Negation of [`SqlPredicate::Contains`], true for a missing key.
    NotContains(Value),
}

/// One lowered clause.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlCondition {
    /// What is read.
    pub target: SqlTarget,
    /// How it is compared.
    pub predicate: SqlPredicate,
}

/// Conjunction of lowered clauses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlWhere {
    /// Conditions joined with `AND`.
    pub conditions: Vec<SqlCondition>,
}

/// Quotes an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn push(params: &mut Vec<SqlParam>, param: SqlParam) -> String {
    params.push(param);
    format!("${}", params.len())
}

impl SqlCondition {
    /// Binds the key once and returns `(json, text, typeof)` expressions.
    fn metadata_exprs(key: &str, params: &mut Vec<SqlParam>) -> (String, String, String) {
        let key = push(params, SqlParam::Text(key.to_string()));
        let column = quote_ident(METADATA_COLUMN);
        (
            format!("({column} -> {key})"),
            format!("({column} ->> {key})"),
            format!("jsonb_typeof({column} -> {key})"),
        )
    }

    fn render_contains(&self, needle: &Value, params: &mut Vec<SqlParam>) -> String {
        match &self.target {
            SqlTarget::Document => match needle {
                Value::String(needle) => format!(
                    "strpos({}, {}) > 0",
                    quote_ident(DOCUMENT_COLUMN),
                    push(params, SqlParam::Text(needle.clone()))
                ),
                _ => "false".to_string(),
            },
            SqlTarget::Metadata(key) => {
                let (json, text, kind) = Self::metadata_exprs(key, params);
                let substring = match needle {
                    Value::String(needle) => format!(
                        "strpos({}, {}) > 0",
                        text,
                        push(params, SqlParam::Text(needle.clone()))
                    ),
                    _ => "false".to_string(),
                };
                let element = push(params, SqlParam::Json(needle.clone()));
                format!(
                    "CASE {kind} WHEN 'string' THEN {substring} \
                     WHEN 'array' THEN {json} @> {element} ELSE false END"
                )
            }
        }
    }

    fn render_json_in(key: &str, candidates: &[Value], params: &mut Vec<SqlParam>) -> String {
        let (json, _, _) = Self::metadata_exprs(key, params);
        let candidates = push(params, SqlParam::Json(Value::Array(candidates.to_vec())));
        format!(
            "EXISTS (SELECT 1 FROM jsonb_array_elements({candidates}) AS candidate(value) \
             WHERE {json} @> candidate.value)"
        )
    }

    /// Renders the condition, appending its bound parameters.
    pub fn render(&self, params: &mut Vec<SqlParam>) -> String {
        let document = quote_ident(DOCUMENT_COLUMN);
        match (&self.predicate, &self.target) {
            (SqlPredicate::TextIn(values), SqlTarget::Document) => format!(
                "{} = ANY({})",
                document,
                push(params, SqlParam::TextArray(values.clone()))
            ),
            (SqlPredicate::TextNotIn(values), SqlTarget::Document) => format!(
                "NOT COALESCE({} = ANY({}), false)",
                document,
                push(params, SqlParam::TextArray(values.clone()))
            ),
            // Text membership is only lowered for the document column.
            (SqlPredicate::TextIn(_), SqlTarget::Metadata(_)) => "false".to_string(),
            (SqlPredicate::TextNotIn(_), SqlTarget::Metadata(_)) => "true".to_string(),
            (SqlPredicate::TextCmp(ordering, value), SqlTarget::Document) => format!(
                "{} {} {}",
                document,
                ordering.symbol(),
                push(params, SqlParam::Text(value.clone()))
            ),
            (SqlPredicate::TextCmp(ordering, value), SqlTarget::Metadata(key)) => {
                let (_, text, kind) = Self::metadata_exprs(key, params);
                format!(
                    "(CASE WHEN {kind} = 'string' THEN {text} END) {} {}",
                    ordering.symbol(),
                    push(params, SqlParam::Text(value.clone()))
                )
            }
            // Lowering never produces numeric predicates on the text column.
            (SqlPredicate::NumericCmp(..), SqlTarget::Document) => "false".to_string(),
            (SqlPredicate::NumericCmp(ordering, value), SqlTarget::Metadata(key)) => {
                let (_, text, kind) = Self::metadata_exprs(key, params);
                format!(
                    "(CASE WHEN {kind} = 'number' THEN {text}::double precision END) {} {}",
                    ordering.symbol(),
                    push(params, SqlParam::Float(*value))
                )
            }
            (SqlPredicate::JsonIn(candidates), SqlTarget::Metadata(key)) => {
                Self::render_json_in(key, candidates, params)
            }
            (SqlPredicate::JsonNotIn(candidates), SqlTarget::Metadata(key)) => {
                format!("NOT {}", Self::render_json_in(key, candidates, params))
            }
            // Jsonb membership is only lowered for metadata keys.
            (SqlPredicate::JsonIn(_), SqlTarget::Document) => "false".to_string(),
            (SqlPredicate::JsonNotIn(_), SqlTarget::Document) => "true".to_string(),
            (SqlPredicate::Contains(needle), _) => self.render_contains(needle, params),
            (SqlPredicate::NotContains(needle), _) => {
                format!("NOT COALESCE({}, false)", self.render_contains(needle, params))
            }
        }
    }
}

impl SqlWhere {
    /// Returns true if there is no condition.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Renders the conjunction, appending its bound parameters. An empty
    /// conjunction renders as `TRUE`.
    pub fn render(&self, params: &mut Vec<SqlParam>) -> String {
        if self.conditions.is_empty() {
            return "TRUE".to_string();
        }
        self.conditions
            .iter()
            .map(|condition| format!("({})", condition.render(params)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

/// Strings among the candidates; the document column never equals anything
/// else.
fn text_candidates(values: &[Value]) -> Vec<String> {
    values
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Compiles canonical filters into [`SqlWhere`] conjunctions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgVectorFilterCompiler;

impl FilterCompiler for PgVectorFilterCompiler {
    type Condition = SqlCondition;
    type Fragment = SqlWhere;

    fn capabilities(&self) -> Capabilities {
        Capabilities::all_server_side()
    }

    fn lower(&self, clause: &Clause) -> Result<SqlCondition> {
        let target = match clause.target() {
            FieldTarget::Document => SqlTarget::Document,
            FieldTarget::Metadata(key) => SqlTarget::Metadata(key.to_string()),
        };
        let single = std::slice::from_ref(&clause.value);

        let predicate = match (clause.operator, &target) {
            (Operator::Eq, SqlTarget::Document) => SqlPredicate::TextIn(text_candidates(single)),
            (Operator::Ne, SqlTarget::Document) => {
                SqlPredicate::TextNotIn(text_candidates(single))
            }
            (Operator::In, SqlTarget::Document) => {
                SqlPredicate::TextIn(text_candidates(clause.list()))
            }
            (Operator::NotIn, SqlTarget::Document) => {
                SqlPredicate::TextNotIn(text_candidates(clause.list()))
            }
            (Operator::Eq, SqlTarget::Metadata(_)) => SqlPredicate::JsonIn(single.to_vec()),
            (Operator::Ne, SqlTarget::Metadata(_)) => SqlPredicate::JsonNotIn(single.to_vec()),
            (Operator::In, SqlTarget::Metadata(_)) => SqlPredicate::JsonIn(clause.list().to_vec()),
            (Operator::NotIn, SqlTarget::Metadata(_)) => {
                SqlPredicate::JsonNotIn(clause.list().to_vec())
            }
            (Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte, _) => {
                let ordering = SqlOrdering::from_operator(clause.operator)
                    .ok_or_else(|| Error::unsupported_operator("not an ordering operator"))?;
                match &clause.value {
                    Value::Number(n) if target == SqlTarget::Document => {
                        return Err(Error::unsupported_operator(format!(
                            "the document column is text and cannot be compared with {}",
                            n
                        )));
                    }
                    Value::Number(n) => {
                        let n = n.as_f64().ok_or_else(|| {
                            Error::unsupported_operator(format!("{} is not a finite number", n))
                        })?;
                        SqlPredicate::NumericCmp(ordering, n)
                    }
                    Value::String(s) => SqlPredicate::TextCmp(ordering, s.clone()),
                    other => {
                        return Err(Error::unsupported_operator(format!(
                            "cannot order field '{}' by {}",
                            clause.field, other
                        )));
                    }
                }
            }
            (Operator::Contains, _) => SqlPredicate::Contains(clause.value.clone()),
            (Operator::NotContains, _) => SqlPredicate::NotContains(clause.value.clone()),
        };

        Ok(SqlCondition { target, predicate })
    }

    fn combine(&self, conditions: Vec<SqlCondition>) -> SqlWhere {
        SqlWhere { conditions }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use veclens_core::CanonicalFilter;

    use super::*;

    fn render(filter: &CanonicalFilter) -> (String, Vec<SqlParam>) {
        let compiled = PgVectorFilterCompiler.compile(filter).unwrap();
        let mut params = Vec::new();
        let sql = compiled.native.unwrap_or_default().render(&mut params);
        (sql, params)
    }

    #[test]
    fn test_status_and_score() {
        let filter = CanonicalFilter::new()
            .where_eq("status", "active")
            .with("score", Operator::Gt, 5);
        let (sql, params) = render(&filter);

        assert_eq!(
            sql,
            "(EXISTS (SELECT 1 FROM jsonb_array_elements($2) AS candidate(value) \
             WHERE (\"metadata\" -> $1) @> candidate.value)) AND \
             ((CASE WHEN jsonb_typeof(\"metadata\" -> $3) = 'number' \
             THEN (\"metadata\" ->> $3)::double precision END) > $4)"
        );
        assert_eq!(
            params,
            vec![
                SqlParam::Text("status".into()),
                SqlParam::Json(json!(["active"])),
                SqlParam::Text("score".into()),
                SqlParam::Float(5.0),
            ]
        );
    }

    #[test]
    fn test_equality_keeps_json_types() {
        let filter = CanonicalFilter::new()
            .where_eq("n", 5.0)
            .with("tags", Operator::In, json!(["x", 1]));
        let (_, params) = render(&filter);
        assert_eq!(params[1], SqlParam::Json(json!([5.0])));
        assert_eq!(params[3], SqlParam::Json(json!(["x", 1])));
    }

    #[test]
    fn test_keys_are_never_interpolated() {
        let filter = CanonicalFilter::new().where_eq("x'); DROP TABLE items; --", "v");
        let (sql, params) = render(&filter);
        assert!(!sql.contains("DROP"));
        assert_eq!(params[0], SqlParam::Text("x'); DROP TABLE items; --".into()));
    }

    #[test]
    fn test_document_clauses_use_the_column() {
        let filter = CanonicalFilter::new().with("document", Operator::Contains, "rust");
        let (sql, _) = render(&filter);
        assert_eq!(sql, "(strpos(\"document\", $1) > 0)");

        let filter = CanonicalFilter::new().where_eq("document", "hello");
        let (sql, params) = render(&filter);
        assert_eq!(sql, "(\"document\" = ANY($1))");
        assert_eq!(params[0], SqlParam::TextArray(vec!["hello".into()]));
    }

    #[test]
    fn test_negations_are_null_safe() {
        let filter = CanonicalFilter::new()
            .with("status", Operator::Ne, "active")
            .with("tag", Operator::NotContains, "a");
        let (sql, _) = render(&filter);
        assert!(sql.starts_with("(NOT EXISTS (SELECT 1"));
        assert!(sql.contains("NOT COALESCE(CASE jsonb_typeof(\"metadata\" -> $3)"));
    }

    #[test]
    fn test_string_ranges_only_see_strings() {
        let filter = CanonicalFilter::new().with("name", Operator::Gte, "m");
        let (sql, _) = render(&filter);
        assert_eq!(
            sql,
            "((CASE WHEN jsonb_typeof(\"metadata\" -> $1) = 'string' \
             THEN (\"metadata\" ->> $1) END) >= $2)"
        );
    }

    #[test]
    fn test_numeric_range_on_document_is_unsupported() {
        let filter = CanonicalFilter::new().with("document", Operator::Lt, 3);
        let err = PgVectorFilterCompiler.compile(&filter).unwrap_err();
        assert_eq!(err.kind(), veclens_core::ErrorKind::UnsupportedOperator);
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("my\"table"), "\"my\"\"table\"");
    }
}
