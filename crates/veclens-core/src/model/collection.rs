//! Collection descriptors and distance metrics.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Distance metric of a collection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
    AsRefStr, Display, EnumString
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DistanceMetric {
    /// Cosine distance.
    #[default]
    Cosine,
    /// Euclidean (L2) distance.
    #[strum(to_string = "euclidean", serialize = "euclid", serialize = "l2")]
    Euclidean,
    /// Dot (inner) product.
    #[strum(to_string = "dot", serialize = "ip", serialize = "inner_product")]
    Dot,
    /// The backend did not report a metric.
    Unknown,
}

impl DistanceMetric {
    /// Parses a backend-reported metric name, mapping unrecognized names to
    /// [`DistanceMetric::Unknown`].
    pub fn parse_lossy(name: &str) -> Self {
        name.trim().parse().unwrap_or(Self::Unknown)
    }

    /// Distance between two vectors; smaller is closer.
    ///
    /// Cosine yields `1 - cos`, dot yields the negated product so that the
    /// ordering stays ascending.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine | Self::Unknown => 1.0 - cosine_similarity(a, b),
            Self::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            Self::Dot => -dot(a, b),
        }
    }

    /// Similarity between two vectors; larger is closer.
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine | Self::Unknown => cosine_similarity(a, b),
            Self::Euclidean => -self.distance(a, b),
            Self::Dot => dot(a, b),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = dot(a, a).sqrt();
    let norm_b = dot(b, b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot(a, b) / (norm_a * norm_b)
}

/// Descriptor of one collection as seen through an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    /// Collection name, unique within a connection.
    pub name: String,
    /// Vector width, if it could be resolved.
    pub vector_dimension: Option<usize>,
    /// Distance metric.
    pub distance_metric: DistanceMetric,
    /// Number of stored items.
    pub item_count: u64,
    /// Metadata keys observed on stored items.
    pub metadata_fields: BTreeSet<String>,
}

impl Collection {
    /// Creates an empty descriptor.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vector_dimension: None,
            distance_metric: DistanceMetric::Unknown,
            item_count: 0,
            metadata_fields: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend_names() {
        assert_eq!(DistanceMetric::parse_lossy("Cosine"), DistanceMetric::Cosine);
        assert_eq!(DistanceMetric::parse_lossy("L2"), DistanceMetric::Euclidean);
        assert_eq!(DistanceMetric::parse_lossy("Euclid"), DistanceMetric::Euclidean);
        assert_eq!(DistanceMetric::parse_lossy("IP"), DistanceMetric::Dot);
        assert_eq!(DistanceMetric::parse_lossy("hamming"), DistanceMetric::Unknown);
    }

    #[test]
    fn test_cosine_distance_orders_closest_first() {
        let metric = DistanceMetric::Cosine;
        let query = [1.0, 0.0];
        let same = metric.distance(&query, &[1.0, 0.0]);
        let diagonal = metric.distance(&query, &[0.5, 0.5]);
        let orthogonal = metric.distance(&query, &[0.0, 1.0]);

        assert!(same.abs() < 1e-6);
        assert!(same < diagonal && diagonal < orthogonal);
    }

    #[test]
    fn test_zero_vector_has_no_similarity() {
        let metric = DistanceMetric::Cosine;
        assert_eq!(metric.similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
