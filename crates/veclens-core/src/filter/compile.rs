//! Push-down / residual split shared by every backend compiler.

use super::{CanonicalFilter, Clause};
use crate::capability::Capabilities;
use crate::error::Result;
use crate::model::Item;

/// Output of a filter compiler.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter<F> {
    /// Native fragment covering the pushed-down clauses, if any.
    pub native: Option<F>,
    /// Clauses the backend cannot evaluate; applied in memory by the adapter.
    pub residual: CanonicalFilter,
}

impl<F> CompiledFilter<F> {
    /// Returns true if every clause was pushed down.
    pub fn is_complete(&self) -> bool {
        self.residual.is_empty()
    }

    /// Applies the residual filter to a fetched item set.
    pub fn post_filter(&self, items: Vec<Item>) -> Vec<Item> {
        if self.residual.is_empty() {
            return items;
        }
        items
            .into_iter()
            .filter(|item| self.residual.matches(item))
            .collect()
    }
}

impl<F> Default for CompiledFilter<F> {
    fn default() -> Self {
        Self {
            native: None,
            residual: CanonicalFilter::default(),
        }
    }
}

/// Translates a [`CanonicalFilter`] into a backend-native fragment.
///
/// Implementors provide the capability table and the per-clause lowering;
/// [`FilterCompiler::compile`] routes each clause through the table so that a
/// server-side clause always lands in the native fragment and every other
/// clause lands in the residual set.
pub trait FilterCompiler {
    /// Native fragment type.
    type Fragment;
    /// Native form of a single clause.
    type Condition;

    /// Operators this backend evaluates server-side.
    fn capabilities(&self) -> Capabilities;

    /// Lowers one server-side clause.
    ///
    /// Fails with `UnsupportedOperator` when the value cannot be expressed,
    /// for example an ordering comparison on a type the backend cannot order.
    fn lower(&self, clause: &Clause) -> Result<Self::Condition>;

    /// Combines lowered clauses into one fragment.
    fn combine(&self, conditions: Vec<Self::Condition>) -> Self::Fragment;

    /// Splits a filter into native fragment and residual clauses.
    fn compile(&self, filter: &CanonicalFilter) -> Result<CompiledFilter<Self::Fragment>> {
        filter.validate()?;

        let capabilities = self.capabilities();
        let mut conditions = Vec::new();
        let mut residual = Vec::new();

        for clause in filter.clauses() {
            if capabilities.is_server_side(clause) {
                conditions.push(self.lower(clause)?);
            } else {
                residual.push(clause.clone());
            }
        }

        let native = if conditions.is_empty() {
            None
        } else {
            Some(self.combine(conditions))
        };

        Ok(CompiledFilter {
            native,
            residual: residual.into_iter().collect(),
        })
    }

    /// Compiles an optional filter; `None` compiles to an empty result.
    fn compile_opt(
        &self,
        filter: Option<&CanonicalFilter>,
    ) -> Result<CompiledFilter<Self::Fragment>> {
        match filter {
            Some(filter) => self.compile(filter),
            None => Ok(CompiledFilter::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{DOCUMENT_FIELD, Operator};

    /// Pushes down equality only, rendered as `key=value` pairs.
    struct EqOnly;

    impl FilterCompiler for EqOnly {
        type Condition = String;
        type Fragment = Vec<String>;

        fn capabilities(&self) -> Capabilities {
            Capabilities::all_residual().with(Operator::Eq, true)
        }

        fn lower(&self, clause: &Clause) -> Result<String> {
            Ok(format!("{}={}", clause.field, clause.value))
        }

        fn combine(&self, conditions: Vec<String>) -> Vec<String> {
            conditions
        }
    }

    #[test]
    fn test_split_between_native_and_residual() {
        let filter = CanonicalFilter::new()
            .where_eq("status", "active")
            .with("score", Operator::Gt, 5);
        let compiled = EqOnly.compile(&filter).unwrap();

        assert_eq!(compiled.native, Some(vec!["status=\"active\"".to_string()]));
        assert_eq!(compiled.residual.clauses().len(), 1);
        assert_eq!(compiled.residual.clauses()[0].operator, Operator::Gt);
    }

    #[test]
    fn test_document_clause_follows_document_capability() {
        let filter = CanonicalFilter::new().where_eq(DOCUMENT_FIELD, "text");
        let compiled = EqOnly.compile(&filter).unwrap();
        assert!(compiled.native.is_none());
        assert!(!compiled.is_complete());
    }

    #[test]
    fn test_invalid_clause_is_rejected() {
        let filter = CanonicalFilter::new().with("status", Operator::In, "active");
        assert!(EqOnly.compile(&filter).is_err());
    }
}
