//! One pagination contract over offset, cursor and materialized slicing.
//!
//! Every paged read returns a [`Page`]: the items plus the token of the next
//! page, or `None` once the collection is exhausted.
//!
//! - Offset backends: the next token is `offset + size` whenever a full page
//!   came back. A full last page is indistinguishable from a page with more
//!   data behind it, so the caller sees one trailing empty page in that case.
//! - Cursor backends: the backend's opaque cursor is passed through.
//! - Materialized: the adapter fetches the full list once and slices it; see
//!   [`MaterializedPages`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Position of a page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageToken {
    /// Number of items to skip.
    Offset(usize),
    /// Opaque backend cursor.
    Cursor(String),
}

/// Request for one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Token returned by the previous page, `None` for the first page.
    pub token: Option<PageToken>,
    /// Maximum number of items.
    pub size: usize,
}

impl PageRequest {
    /// Default page size.
    pub const DEFAULT_SIZE: usize = 100;

    /// Requests the first page.
    pub fn first(size: usize) -> Self {
        Self { token: None, size }
    }

    /// Requests the page following `token`.
    pub fn next(token: PageToken, size: usize) -> Self {
        Self {
            token: Some(token),
            size,
        }
    }

    /// Returns the offset this request starts at.
    ///
    /// Fails with `InvalidInput` when handed a cursor token.
    pub fn offset(&self) -> Result<usize> {
        match &self.token {
            None => Ok(0),
            Some(PageToken::Offset(offset)) => Ok(*offset),
            Some(PageToken::Cursor(_)) => Err(Error::invalid_input(
                "cursor token passed to an offset-paginated read",
            )),
        }
    }

    /// Returns the cursor this request continues from.
    ///
    /// Fails with `InvalidInput` when handed an offset token.
    pub fn cursor(&self) -> Result<Option<&str>> {
        match &self.token {
            None => Ok(None),
            Some(PageToken::Cursor(cursor)) => Ok(Some(cursor.as_str())),
            Some(PageToken::Offset(_)) => Err(Error::invalid_input(
                "offset token passed to a cursor-paginated read",
            )),
        }
    }

    /// Fails with `InvalidInput` on a zero page size.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::invalid_input("page size must be positive"));
        }
        Ok(())
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::first(Self::DEFAULT_SIZE)
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items of this page.
    pub items: Vec<T>,
    /// Token of the next page, `None` once exhausted.
    pub next: Option<PageToken>,
}

impl<T> Page<T> {
    /// Builds an offset page from a backend response.
    pub fn from_offset(items: Vec<T>, request: &PageRequest) -> Result<Self> {
        request.validate()?;
        let offset = request.offset()?;
        let next = (items.len() >= request.size).then(|| PageToken::Offset(offset + items.len()));
        Ok(Self { items, next })
    }

    /// Builds a cursor page from a backend response.
    pub fn from_cursor(items: Vec<T>, cursor: Option<String>) -> Self {
        Self {
            items,
            next: cursor.map(PageToken::Cursor),
        }
    }

    /// Returns true if there is no further page.
    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

/// Slices fully materialized result sets, keeping them between page calls.
///
/// Entries are keyed by an arbitrary string (collection plus filter); the
/// first page of a key always refetches, later pages reuse the cached list.
/// Mutations must call [`MaterializedPages::invalidate`].
#[derive(Debug, Clone)]
pub struct MaterializedPages<T> {
    cache: HashMap<String, Vec<T>>,
}

impl<T> Default for MaterializedPages<T> {
    fn default() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }
}

impl<T: Clone> MaterializedPages<T> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a list is cached under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Stores a freshly materialized list.
    pub fn store(&mut self, key: impl Into<String>, items: Vec<T>) {
        self.cache.insert(key.into(), items);
    }

    /// Slices the cached list. Returns `None` when nothing is cached under
    /// `key`, in which case the caller materializes and stores first.
    pub fn slice(&self, key: &str, request: &PageRequest) -> Result<Option<Page<T>>> {
        request.validate()?;
        let offset = request.offset()?;
        let Some(all) = self.cache.get(key) else {
            return Ok(None);
        };
        Ok(Some(slice(all, offset, request.size)))
    }

    /// Drops every cached list whose key starts with `prefix`.
    pub fn invalidate(&mut self, prefix: &str) {
        self.cache.retain(|key, _| !key.starts_with(prefix));
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// Slices a materialized list; the next token is `None` once the slice
/// reaches the end.
pub fn slice<T: Clone>(all: &[T], offset: usize, size: usize) -> Page<T> {
    let start = offset.min(all.len());
    let end = offset.saturating_add(size).min(all.len());
    let next = (end < all.len()).then_some(PageToken::Offset(end));
    Page {
        items: all[start..end].to_vec(),
        next,
    }
}

/// Cache key of a materialized listing. The trailing separator keeps
/// `invalidate("docs\u{1f}")` from touching `docs2`.
pub fn materialized_key(collection: &str, filter_fingerprint: &str) -> String {
    format!("{}\u{1f}{}", collection, filter_fingerprint)
}

/// Prefix matching every materialized listing of a collection.
pub fn materialized_prefix(collection: &str) -> String {
    format!("{}\u{1f}", collection)
}
