//! Canonical filter to Milvus boolean expression compilation.
//!
//! Every clause becomes one comparison term and terms are joined with `&&`.
//! Strings are double-quoted with escapes, lists are bracketed literals and
//! numbers are written raw. Equality and membership on dynamic fields also
//! test list elements through `json_contains` / `json_contains_any`.
//!
//! Milvus fails every term on a row without the field, negated ones
//! included, so `ne` / `not_in` stay residual. It has no substring test on
//! dynamic fields either, so `contains` / `not_contains` stay residual too.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Number, Value};
use veclens_core::filter::FieldTarget;
use veclens_core::{Capabilities, Clause, Error, FilterCompiler, Operator, Result};

/// Scalar field holding the document text.
pub const DOCUMENT_FIELD: &str = "document";

/// Vector field of collections created by the adapter.
pub const VECTOR_FIELD: &str = "embedding";

/// Primary key field of collections created by the adapter.
pub const PRIMARY_FIELD: &str = "id";

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

/// A field an expression reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MilvusField {
    /// A schema field.
    Schema(String),
    /// A key of the dynamic field.
    Dynamic(String),
}

impl MilvusField {
    /// Returns the field name.
    pub fn name(&self) -> &str {
        match self {
            Self::Schema(name) | Self::Dynamic(name) => name,
        }
    }
}

impl fmt::Display for MilvusField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schema(name) => f.write_str(name),
            Self::Dynamic(key)
                if IDENTIFIER.is_match(key)
                    && ![PRIMARY_FIELD, DOCUMENT_FIELD, VECTOR_FIELD].contains(&key.as_str()) =>
            {
                f.write_str(key)
            }
            Self::Dynamic(key) => write!(f, "$meta[{}]", quote(key)),
        }
    }
}

/// A literal operand.
#[derive(Debug, Clone, PartialEq)]
pub enum MilvusLiteral {
    /// Double-quoted string.
    String(String),
    /// Raw number.
    Number(Number),
    /// `true` / `false`.
    Bool(bool),
    /// Bracketed list.
    List(Vec<MilvusLiteral>),
}

impl MilvusLiteral {
    /// Converts a JSON value. Objects and nulls have no literal form.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Number(n) => Some(Self::Number(n.clone())),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Array(values) => values
                .iter()
                .map(Self::from_json)
                .collect::<Option<Vec<_>>>()
                .map(Self::List),
            Value::Null | Value::Object(_) => None,
        }
    }

    /// Converts back to JSON.
    pub fn to_json(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Number(n) => Value::Number(n.clone()),
            Self::Bool(b) => Value::Bool(*b),
            Self::List(values) => Value::Array(values.iter().map(Self::to_json).collect()),
        }
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

impl fmt::Display for MilvusLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(&quote(s)),
            Self::Number(n) => write!(f, "{}", n),
            Self::Bool(b) => write!(f, "{}", b),
            Self::List(values) => {
                f.write_str("[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Comparison operator of a term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MilvusOp {
    /// `==`
    Eq,
    /// `(f == v || json_contains(f, v))`, equal or a list holding `v`.
    Matches,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `in`
    In,
    /// `(f in l || json_contains_any(f, l))`, a member or a list sharing one.
    MatchesAny,
}

impl MilvusOp {
    fn from_operator(operator: Operator, field: &MilvusField) -> Option<Self> {
        let dynamic = matches!(field, MilvusField::Dynamic(_));
        match operator {
            Operator::Eq if dynamic => Some(Self::Matches),
            Operator::Eq => Some(Self::Eq),
            Operator::Gt => Some(Self::Gt),
            Operator::Gte => Some(Self::Gte),
            Operator::Lt => Some(Self::Lt),
            Operator::Lte => Some(Self::Lte),
            Operator::In if dynamic => Some(Self::MatchesAny),
            Operator::In => Some(Self::In),
            Operator::Ne | Operator::NotIn | Operator::Contains | Operator::NotContains => None,
        }
    }

    /// Returns the comparison token. The list-aware operators render the
    /// token of their plain comparison.
    pub fn token(&self) -> &'static str {
        match self {
            Self::Eq | Self::Matches => "==",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::In | Self::MatchesAny => "in",
        }
    }
}

/// One `field op literal` term.
#[derive(Debug, Clone, PartialEq)]
pub struct MilvusTerm {
    /// Left operand.
    pub field: MilvusField,
    /// Operator.
    pub op: MilvusOp,
    /// Right operand.
    pub value: MilvusLiteral,
}

impl fmt::Display for MilvusTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (field, token, value) = (&self.field, self.op.token(), &self.value);
        match self.op {
            MilvusOp::Matches => {
                write!(f, "({field} {token} {value} || json_contains({field}, {value}))")
            }
            MilvusOp::MatchesAny => {
                write!(f, "({field} {token} {value} || json_contains_any({field}, {value}))")
            }
            _ => write!(f, "{field} {token} {value}"),
        }
    }
}

/// Conjunction of terms, rendered joined with `&&`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MilvusExpr {
    /// Terms of the conjunction.
    pub terms: Vec<MilvusTerm>,
}

impl MilvusExpr {
    /// Selects rows whose primary key is one of `ids`.
    pub fn primary_in(primary_field: &str, ids: Vec<MilvusLiteral>) -> Self {
        Self {
            terms: vec![MilvusTerm {
                field: MilvusField::Schema(primary_field.to_string()),
                op: MilvusOp::In,
                value: MilvusLiteral::List(ids),
            }],
        }
    }

    /// Returns true if there is no term.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl fmt::Display for MilvusExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(" && ")?;
            }
            write!(f, "{}", term)?;
        }
        Ok(())
    }
}

/// Compiles canonical filters into [`MilvusExpr`] conjunctions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MilvusFilterCompiler;

impl FilterCompiler for MilvusFilterCompiler {
    type Condition = MilvusTerm;
    type Fragment = MilvusExpr;

    fn capabilities(&self) -> Capabilities {
        Capabilities::all_server_side()
            .with(Operator::Ne, false)
            .with(Operator::NotIn, false)
            .with_document(Operator::Ne, false)
            .with_document(Operator::NotIn, false)
            .with(Operator::Contains, false)
            .with(Operator::NotContains, false)
            .with_document(Operator::Contains, false)
            .with_document(Operator::NotContains, false)
    }

    fn lower(&self, clause: &Clause) -> Result<MilvusTerm> {
        let field = match clause.target() {
            FieldTarget::Document => MilvusField::Schema(DOCUMENT_FIELD.to_string()),
            FieldTarget::Metadata(key) => MilvusField::Dynamic(key.to_string()),
        };

        let op = MilvusOp::from_operator(clause.operator, &field).ok_or_else(|| {
            Error::unsupported_operator(format!(
                "Milvus expressions have no '{}' operator",
                clause.operator
            ))
        })?;

        let value = MilvusLiteral::from_json(&clause.value).ok_or_else(|| {
            Error::unsupported_operator(format!(
                "{} has no Milvus literal form",
                clause.value
            ))
        })?;

        Ok(MilvusTerm { field, op, value })
    }

    fn combine(&self, terms: Vec<MilvusTerm>) -> MilvusExpr {
        MilvusExpr { terms }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use veclens_core::CanonicalFilter;

    use super::*;

    fn render(filter: &CanonicalFilter) -> String {
        MilvusFilterCompiler
            .compile(filter)
            .unwrap()
            .native
            .map(|expr| expr.to_string())
            .unwrap_or_default()
    }

    #[test]
    fn test_status_and_score() {
        let filter = CanonicalFilter::new()
            .where_eq("status", "active")
            .with("score", Operator::Gt, 5);
        assert_eq!(
            render(&filter),
            r#"(status == "active" || json_contains(status, "active")) && score > 5"#
        );
    }

    #[test]
    fn test_membership_looks_into_lists() {
        let filter = CanonicalFilter::new().with("tag", Operator::In, json!(["a", "b"]));
        assert_eq!(
            render(&filter),
            r#"(tag in ["a", "b"] || json_contains_any(tag, ["a", "b"]))"#
        );
    }

    #[test]
    fn test_negations_are_residual() {
        let filter = CanonicalFilter::new()
            .with("rank", Operator::NotIn, json!([1, 2]))
            .with("flag", Operator::Ne, true)
            .with("document", Operator::Ne, "draft")
            .with("score", Operator::Lte, 3);
        let compiled = MilvusFilterCompiler.compile(&filter).unwrap();
        assert_eq!(compiled.native.unwrap().to_string(), "score <= 3");
        assert_eq!(compiled.residual.clauses().len(), 3);
    }

    #[test]
    fn test_strings_are_escaped() {
        let filter = CanonicalFilter::new().where_eq("document", r#"say "hi" \o/"#);
        assert_eq!(render(&filter), r#"document == "say \"hi\" \\o/""#);
    }

    #[test]
    fn test_awkward_keys_use_meta_access() {
        let filter = CanonicalFilter::new()
            .with("first name", Operator::Gte, "Ada")
            .with("id", Operator::Lt, 3);
        assert_eq!(
            render(&filter),
            r#"$meta["first name"] >= "Ada" && $meta["id"] < 3"#
        );
    }

    #[test]
    fn test_contains_is_residual() {
        let filter = CanonicalFilter::new()
            .with("document", Operator::Contains, "rust")
            .where_eq("document", "exact");
        let compiled = MilvusFilterCompiler.compile(&filter).unwrap();
        assert_eq!(compiled.native.unwrap().to_string(), r#"document == "exact""#);
        assert_eq!(compiled.residual.clauses().len(), 1);
    }
}
