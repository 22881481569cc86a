//! Nearest-neighbor query results.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use super::{Item, Metadata};

/// How the scores of a [`QueryResult`] are to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Ranking {
    /// Smaller scores are closer.
    Distance,
    /// Larger scores are closer.
    Similarity,
}

impl Ranking {
    /// Orders two scores so that the closer one comes first.
    pub fn best_first(&self, a: f32, b: f32) -> Ordering {
        let ordering = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        match self {
            Self::Distance => ordering,
            Self::Similarity => ordering.reverse(),
        }
    }
}

/// A single scored item.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    /// The matched item.
    pub item: Item,
    /// Backend-reported score, read according to the result's [`Ranking`].
    pub score: f32,
}

impl Hit {
    /// Creates a new hit.
    pub fn new(item: Item, score: f32) -> Self {
        Self { item, score }
    }
}

/// Results of one query vector, as index-aligned parallel arrays.
///
/// The arrays are private so that they can only grow together. Hits are kept
/// best-first according to [`QueryResult::ranking`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    ranking: Ranking,
    ids: Vec<String>,
    documents: Vec<Option<String>>,
    metadatas: Vec<Metadata>,
    embeddings: Vec<Option<Vec<f32>>>,
    scores: Vec<f32>,
}

impl QueryResult {
    /// Creates an empty result.
    pub fn new(ranking: Ranking) -> Self {
        Self {
            ranking,
            ids: Vec::new(),
            documents: Vec::new(),
            metadatas: Vec::new(),
            embeddings: Vec::new(),
            scores: Vec::new(),
        }
    }

    /// Builds a result from hits in any order, sorting them best-first.
    pub fn from_hits(ranking: Ranking, mut hits: Vec<Hit>) -> Self {
        hits.sort_by(|a, b| ranking.best_first(a.score, b.score));

        let mut result = Self::new(ranking);
        for hit in hits {
            result.push_unsorted(hit);
        }
        result
    }

    fn push_unsorted(&mut self, hit: Hit) {
        let Hit { item, score } = hit;
        self.ids.push(item.id);
        self.documents.push(item.document);
        self.metadatas.push(item.metadata);
        self.embeddings.push(item.embedding);
        self.scores.push(score);
    }

    /// Returns the ranking direction of the scores.
    pub fn ranking(&self) -> Ranking {
        self.ranking
    }

    /// Returns the number of hits.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if there are no hits.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns the hit ids, best first.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Returns the hit documents.
    pub fn documents(&self) -> &[Option<String>] {
        &self.documents
    }

    /// Returns the hit metadata maps.
    pub fn metadatas(&self) -> &[Metadata] {
        &self.metadatas
    }

    /// Returns the hit embeddings.
    pub fn embeddings(&self) -> &[Option<Vec<f32>>] {
        &self.embeddings
    }

    /// Returns the scores. Read them as distances or similarities according to
    /// [`QueryResult::ranking`].
    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    /// Consumes the result and returns the hits, best first.
    pub fn into_hits(self) -> Vec<Hit> {
        let Self {
            ids,
            documents,
            metadatas,
            embeddings,
            scores,
            ..
        } = self;

        ids.into_iter()
            .zip(documents)
            .zip(metadatas)
            .zip(embeddings)
            .zip(scores)
            .map(|((((id, document), metadata), embedding), score)| Hit {
                item: Item {
                    id,
                    document,
                    metadata,
                    embedding,
                },
                score,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f32) -> Hit {
        Hit::new(Item::new(id), score)
    }

    #[test]
    fn test_distance_results_are_ascending() {
        let result = QueryResult::from_hits(
            Ranking::Distance,
            vec![hit("far", 0.9), hit("near", 0.1), hit("mid", 0.5)],
        );
        assert_eq!(result.ids(), ["near", "mid", "far"]);
        assert_eq!(result.scores(), [0.1, 0.5, 0.9]);
    }

    #[test]
    fn test_similarity_results_are_descending() {
        let result = QueryResult::from_hits(
            Ranking::Similarity,
            vec![hit("far", 0.1), hit("near", 0.9)],
        );
        assert_eq!(result.ids(), ["near", "far"]);
    }

    #[test]
    fn test_parallel_arrays_stay_aligned() {
        let item = Item::new("a")
            .with_document("text")
            .with_embedding(vec![1.0]);
        let result = QueryResult::from_hits(Ranking::Distance, vec![Hit::new(item.clone(), 0.0)]);

        assert_eq!(result.len(), 1);
        assert_eq!(result.documents().len(), result.metadatas().len());
        assert_eq!(result.embeddings().len(), result.scores().len());

        let hits = result.into_hits();
        assert_eq!(hits[0].item, item);
    }
}
