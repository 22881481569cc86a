//! The columnar store has no predicate pushdown.
//!
//! Compilation moves every clause to the residual filter; the adapter
//! evaluates it as a boolean mask over the materialized rows.

use veclens_core::{CanonicalFilter, Capabilities, Clause, Error, FilterCompiler, Item, Result};

/// Compiler that keeps every clause residual.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnarFilterCompiler;

impl FilterCompiler for ColumnarFilterCompiler {
    type Condition = ();
    type Fragment = ();

    fn capabilities(&self) -> Capabilities {
        Capabilities::all_residual()
    }

    fn lower(&self, clause: &Clause) -> Result<()> {
        Err(Error::unsupported_operator(format!(
            "the columnar store evaluates '{}' in memory only",
            clause.operator
        )))
    }

    fn combine(&self, _conditions: Vec<()>) {}
}

/// Evaluates a filter over rows, one flag per item.
pub fn mask(filter: &CanonicalFilter, items: &[Item]) -> Vec<bool> {
    items.iter().map(|item| filter.matches(item)).collect()
}

/// Keeps the items whose mask flag is set.
pub fn apply_mask(items: Vec<Item>, mask: &[bool]) -> Vec<Item> {
    items
        .into_iter()
        .zip(mask)
        .filter_map(|(item, keep)| keep.then_some(item))
        .collect()
}
