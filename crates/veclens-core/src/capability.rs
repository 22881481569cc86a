//! Per-backend report of server-evaluable filter operators.

use serde::Serialize;
use strum::IntoEnumIterator;

use crate::filter::{Clause, Operator};

/// Server-side support of one operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OperatorCapability {
    /// The operator.
    pub operator: Operator,
    /// Display symbol.
    pub symbol: &'static str,
    /// Evaluated server-side on metadata fields.
    pub server_side: bool,
    /// Evaluated server-side on the document field.
    pub document_server_side: bool,
}

/// Fixed table of operator support for one adapter type.
///
/// Holds one entry per [`Operator`], in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Capabilities {
    entries: Vec<OperatorCapability>,
}

impl Capabilities {
    fn filled(server_side: bool) -> Self {
        let entries = Operator::iter()
            .map(|operator| OperatorCapability {
                operator,
                symbol: operator.symbol(),
                server_side,
                document_server_side: server_side,
            })
            .collect();
        Self { entries }
    }

    /// Every operator is evaluated server-side, on metadata and document.
    pub fn all_server_side() -> Self {
        Self::filled(true)
    }

    /// Nothing is evaluated server-side.
    pub fn all_residual() -> Self {
        Self::filled(false)
    }

    fn entry_mut(&mut self, operator: Operator) -> &mut OperatorCapability {
        // The table holds every operator, in enum order.
        &mut self.entries[operator as usize]
    }

    /// Sets metadata-field support of one operator.
    pub fn with(mut self, operator: Operator, server_side: bool) -> Self {
        self.entry_mut(operator).server_side = server_side;
        self
    }

    /// Sets document-field support of one operator.
    pub fn with_document(mut self, operator: Operator, server_side: bool) -> Self {
        self.entry_mut(operator).document_server_side = server_side;
        self
    }

    /// Sets document-field support of every operator.
    pub fn with_document_all(mut self, server_side: bool) -> Self {
        for entry in &mut self.entries {
            entry.document_server_side = server_side;
        }
        self
    }

    /// Returns the entry for an operator.
    pub fn get(&self, operator: Operator) -> &OperatorCapability {
        &self.entries[operator as usize]
    }

    /// Returns every entry.
    pub fn iter(&self) -> impl Iterator<Item = &OperatorCapability> {
        self.entries.iter()
    }

    /// Returns true if the backend evaluates the clause itself.
    pub fn is_server_side(&self, clause: &Clause) -> bool {
        let entry = self.get(clause.operator);
        if clause.is_document() {
            entry.document_server_side
        } else {
            entry.server_side
        }
    }

    /// Operators evaluated server-side on metadata fields.
    pub fn server_side_operators(&self) -> Vec<Operator> {
        self.entries
            .iter()
            .filter(|entry| entry.server_side)
            .map(|entry| entry.operator)
            .collect()
    }
}
