//! Small helpers shared by the adapters.

use veclens_core::page::{materialized_key, materialized_prefix};
use veclens_core::{
    CanonicalFilter, ConnectionAdapter, DistanceMetric, Error, Hit, Item, MaterializedPages, Page,
    PageRequest, QueryResult, Ranking, Result,
};

/// Default request timeout of the network configs, in seconds.
pub(crate) const fn default_timeout_secs() -> u64 {
    30
}

/// Fails with `NotConnected` before any backend call is attempted.
pub(crate) fn ensure_connected(connected: bool) -> Result<()> {
    if connected {
        Ok(())
    } else {
        Err(Error::not_connected())
    }
}

/// Cache key of a filtered listing.
pub(crate) fn listing_key(collection: &str, filter: Option<&CanonicalFilter>) -> String {
    let fingerprint = filter
        .and_then(|filter| serde_json::to_string(filter).ok())
        .unwrap_or_default();
    materialized_key(collection, &fingerprint)
}

/// Materialized listings of one adapter.
///
/// A first-page request always refetches; later pages reuse the list stored
/// under the same collection and filter.
#[derive(Debug, Default)]
pub(crate) struct Listings {
    pages: MaterializedPages<Item>,
}

impl Listings {
    /// Returns true when `request` must materialize before slicing.
    pub fn needs_fetch(&self, key: &str, request: &PageRequest) -> bool {
        request.token.is_none() || !self.pages.contains(key)
    }

    /// Stores a freshly materialized listing.
    pub fn store(&mut self, key: String, items: Vec<Item>) {
        self.pages.store(key, items);
    }

    /// Slices a stored listing.
    pub fn slice(&self, key: &str, request: &PageRequest) -> Result<Page<Item>> {
        self.pages
            .slice(key, request)?
            .ok_or_else(|| Error::invalid_input("page token refers to an expired listing"))
    }

    /// Drops the listings of one collection after a mutation.
    pub fn invalidate(&mut self, collection: &str) {
        self.pages.invalidate(&materialized_prefix(collection));
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

/// Returns the filter of a delete call, `None` when it selects by id only.
pub(crate) fn delete_filter(filter: Option<&CanonicalFilter>) -> Option<&CanonicalFilter> {
    filter.filter(|filter| !filter.is_empty())
}

/// Resolves the ids a filtered delete removes: the listed ids that match, or
/// every match when none are listed.
pub(crate) async fn filtered_ids<A>(
    adapter: &mut A,
    collection: &str,
    ids: &[String],
    filter: &CanonicalFilter,
) -> Result<Vec<String>>
where
    A: ConnectionAdapter + ?Sized,
{
    if !ids.is_empty() {
        filter.validate()?;
        let stored = adapter.get_items(collection, ids).await?;
        return Ok(stored
            .into_iter()
            .filter(|item| filter.matches(item))
            .map(|item| item.id)
            .collect());
    }

    let mut matched = Vec::new();
    let mut request = PageRequest::first(PageRequest::DEFAULT_SIZE);
    loop {
        let page = adapter
            .get_all_items(collection, request, Some(filter))
            .await?;
        matched.extend(page.items.into_iter().map(|item| item.id));
        match page.next {
            Some(token) => request = PageRequest::next(token, PageRequest::DEFAULT_SIZE),
            None => return Ok(matched),
        }
    }
}

/// Checks the arguments of a create-collection call.
pub(crate) fn check_create(dimension: usize, metric: DistanceMetric) -> Result<()> {
    if dimension == 0 {
        return Err(Error::invalid_input("vector dimension must be positive"));
    }
    if metric == DistanceMetric::Unknown {
        return Err(Error::invalid_input(
            "a collection must be created with a known distance metric",
        ));
    }
    Ok(())
}

/// Fails with `InvalidInput` on a zero neighbor count.
pub(crate) fn check_k(k: usize) -> Result<()> {
    if k == 0 {
        return Err(Error::invalid_input("k must be positive"));
    }
    Ok(())
}

/// Number of neighbors to request from the backend. With residual clauses
/// every candidate is fetched, since the backend ranks before filtering.
pub(crate) fn search_limit(residual: &CanonicalFilter, k: usize, total: u64) -> usize {
    if residual.is_empty() {
        k
    } else {
        usize::try_from(total).unwrap_or(usize::MAX).max(k)
    }
}

/// Applies residual clauses to ranked hits and keeps the best `k`.
pub(crate) fn finish_hits(
    ranking: Ranking,
    hits: Vec<Hit>,
    residual: &CanonicalFilter,
    k: usize,
) -> QueryResult {
    let mut hits: Vec<Hit> = hits
        .into_iter()
        .filter(|hit| residual.matches(&hit.item))
        .map(|mut hit| {
            hit.item.strip_reserved();
            hit
        })
        .collect();
    hits.sort_by(|a, b| ranking.best_first(a.score, b.score));
    hits.truncate(k);
    QueryResult::from_hits(ranking, hits)
}

#[cfg(test)]
mod tests {
    use veclens_core::{Operator, PageToken};

    use super::*;

    #[test]
    fn test_listing_key_depends_on_filter() {
        let a = listing_key("docs", Some(&CanonicalFilter::new().where_eq("status", "active")));
        let b = listing_key("docs", Some(&CanonicalFilter::new().where_eq("status", "paused")));
        assert_ne!(a, b);
    }

    #[test]
    fn test_expired_listing_is_rejected() {
        let listings = Listings::default();
        let request = PageRequest::next(PageToken::Offset(10), 10);
        assert!(listings.needs_fetch("docs", &request));
        assert!(listings.slice("docs", &request).is_err());
    }

    #[test]
    fn test_finish_hits_filters_then_truncates() {
        let hits = vec![
            Hit::new(Item::new("a").with_field("status", "paused"), 0.1),
            Hit::new(Item::new("b").with_field("status", "active"), 0.3),
            Hit::new(Item::new("c").with_field("status", "active"), 0.2),
        ];
        let residual = CanonicalFilter::new().with("status", Operator::Eq, "active");
        let result = finish_hits(Ranking::Distance, hits, &residual, 1);
        assert_eq!(result.ids(), ["c"]);
    }

    #[test]
    fn test_search_limit_widens_with_residual() {
        assert_eq!(search_limit(&CanonicalFilter::new(), 5, 100), 5);
        let residual = CanonicalFilter::new().where_eq("status", "active");
        assert_eq!(search_limit(&residual, 5, 100), 100);
        assert_eq!(search_limit(&residual, 5, 2), 5);
    }

    #[test]
    fn test_invalidate_drops_collection_listings() {
        let mut listings = Listings::default();
        let key = listing_key("docs", None);
        listings.store(key.clone(), vec![Item::new("a")]);

        let request = PageRequest::next(PageToken::Offset(0), 10);
        assert!(!listings.needs_fetch(&key, &request));
        listings.invalidate("docs");
        assert!(listings.needs_fetch(&key, &request));
    }
}
