//! Closed set of canonical filter operators.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

/// Canonical filter operator.
///
/// Every backend compiler matches on this enum exhaustively, so adding a
/// variant fails to build until each compiler handles it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    AsRefStr, Display, EnumIter, EnumString, IntoStaticStr
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Operator {
    /// Equal to.
    Eq,
    /// Not equal to.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal to.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal to.
    Lte,
    /// Member of a list.
    In,
    /// Not a member of a list.
    NotIn,
    /// Contains a substring (or list element).
    Contains,
    /// Does not contain a substring (or list element).
    NotContains,
}

impl Operator {
    /// Returns the operator symbol shown in filter-building interfaces.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Contains => "contains",
            Self::NotContains => "not contains",
        }
    }

    /// Returns true for the ordering comparisons.
    pub fn is_range(&self) -> bool {
        matches!(self, Self::Gt | Self::Gte | Self::Lt | Self::Lte)
    }

    /// Returns true for the operators taking a list value.
    pub fn takes_list(&self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }

    /// Returns true for the negated operators, which match items missing the
    /// field.
    pub fn is_negated(&self) -> bool {
        matches!(self, Self::Ne | Self::NotIn | Self::NotContains)
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_operator_names_round_trip() {
        for op in Operator::iter() {
            let parsed: Operator = op.as_ref().parse().unwrap();
            assert_eq!(parsed, op);
        }
        assert_eq!(Operator::NotIn.as_ref(), "not_in");
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&Operator::NotContains).unwrap();
        assert_eq!(json, "\"not_contains\"");
    }
}
