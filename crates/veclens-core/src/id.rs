//! Canonical id to backend id mapping.
//!
//! Canonical ids are opaque strings. Backends that require UUIDs get a
//! name-based v5 UUID (stable across processes); backends that require
//! integers get the trailing numeric suffix of the id, falling back to the
//! position of the item in its write batch. Whenever the backend id cannot
//! represent the canonical id, the canonical id is kept in the item metadata
//! under [`ORIGINAL_ID_KEY`].

use std::collections::HashMap;
use std::fmt;

use derive_more::From;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Item, Metadata, ORIGINAL_ID_KEY};

/// Namespace of derived UUIDs.
pub const ID_NAMESPACE: Uuid = Uuid::NAMESPACE_DNS;

/// Identifier type a backend requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdKind {
    /// Arbitrary strings.
    NativeString,
    /// UUIDs.
    Uuid,
    /// Unsigned integers.
    Integer,
}

/// A backend-typed identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, From)]
pub enum BackendId {
    /// String id.
    String(String),
    /// UUID id.
    Uuid(Uuid),
    /// Integer id.
    Integer(u64),
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Uuid(u) => write!(f, "{}", u),
            Self::Integer(n) => write!(f, "{}", n),
        }
    }
}

/// Result of mapping one item id for a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedId {
    /// The backend id.
    pub backend: BackendId,
    /// Whether the canonical id must be stored under [`ORIGINAL_ID_KEY`].
    pub keeps_original: bool,
}

impl IdKind {
    /// Maps a canonical id to a backend id.
    ///
    /// For [`IdKind::Integer`] this only succeeds when the id has a trailing
    /// numeric suffix; use [`IdKind::map_batch`] for writes so that the
    /// positional fallback applies.
    pub fn to_backend_id(self, canonical: &str) -> Result<BackendId> {
        self.map_one(canonical).map(|mapped| mapped.backend).ok_or_else(|| {
            Error::invalid_input(format!(
                "id '{}' has no numeric suffix and needs a write batch position",
                canonical
            ))
        })
    }

    /// Maps a backend id back to its canonical form, ignoring any stored
    /// original id.
    pub fn from_backend_id(self, id: &BackendId) -> String {
        id.to_string()
    }

    /// Recovers the canonical id of a read item, preferring the original id
    /// stored in its metadata. The reserved key is removed from `metadata`.
    pub fn recover(self, id: &BackendId, metadata: &mut Metadata) -> String {
        match metadata.remove(ORIGINAL_ID_KEY) {
            Some(serde_json::Value::String(original)) => original,
            _ => self.from_backend_id(id),
        }
    }

    fn map_one(self, canonical: &str) -> Option<MappedId> {
        match self {
            Self::NativeString => Some(MappedId {
                backend: BackendId::String(canonical.to_string()),
                keeps_original: false,
            }),
            Self::Uuid => Some(match Uuid::parse_str(canonical) {
                Ok(uuid) if uuid.hyphenated().to_string() == canonical => MappedId {
                    backend: BackendId::Uuid(uuid),
                    keeps_original: false,
                },
                _ => MappedId {
                    backend: BackendId::Uuid(derive_uuid(canonical)),
                    keeps_original: true,
                },
            }),
            Self::Integer => trailing_number(canonical).map(|n| MappedId {
                backend: BackendId::Integer(n),
                keeps_original: n.to_string() != canonical,
            }),
        }
    }

    /// Maps the ids of a write batch.
    ///
    /// Integer ids without a numeric suffix take their batch position. Two
    /// items mapping to the same backend id fail the whole batch with
    /// `InvalidInput` instead of silently overwriting each other.
    pub fn map_batch(self, items: &[Item]) -> Result<Vec<MappedId>> {
        let mut seen: HashMap<BackendId, &str> = HashMap::with_capacity(items.len());
        let mut mapped = Vec::with_capacity(items.len());

        for (position, item) in items.iter().enumerate() {
            let id = self.map_one(&item.id).unwrap_or(MappedId {
                backend: BackendId::Integer(position as u64),
                keeps_original: true,
            });

            if let Some(previous) = seen.insert(id.backend.clone(), &item.id) {
                return Err(Error::invalid_input(format!(
                    "ids '{}' and '{}' map to the same backend id {}",
                    previous, item.id, id.backend
                )));
            }
            mapped.push(id);
        }

        Ok(mapped)
    }
}

/// Derives the stable UUID of a canonical id.
pub fn derive_uuid(canonical: &str) -> Uuid {
    Uuid::new_v5(&ID_NAMESPACE, canonical.as_bytes())
}

fn trailing_number(canonical: &str) -> Option<u64> {
    let digits = canonical.len()
        - canonical
            .bytes()
            .rev()
            .take_while(u8::is_ascii_digit)
            .count();
    canonical[digits..].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_mapping_is_deterministic() {
        let a = IdKind::Uuid.to_backend_id("doc_1").unwrap();
        let b = IdKind::Uuid.to_backend_id("doc_1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, BackendId::Uuid(derive_uuid("doc_1")));
    }

    #[test]
    fn test_valid_uuid_passes_through() {
        let canonical = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";
        let backend = IdKind::Uuid.to_backend_id(canonical).unwrap();
        assert_eq!(IdKind::Uuid.from_backend_id(&backend), canonical);
    }

    #[test]
    fn test_integer_suffix() {
        assert_eq!(
            IdKind::Integer.to_backend_id("doc_123").unwrap(),
            BackendId::Integer(123)
        );
        assert_eq!(IdKind::Integer.to_backend_id("42").unwrap(), BackendId::Integer(42));
        assert!(IdKind::Integer.to_backend_id("abc").is_err());
    }

    #[test]
    fn test_batch_position_fallback_keeps_original() {
        let items = vec![Item::new("alpha"), Item::new("beta")];
        let mapped = IdKind::Integer.map_batch(&items).unwrap();

        assert_eq!(mapped[0].backend, BackendId::Integer(0));
        assert_eq!(mapped[1].backend, BackendId::Integer(1));
        assert!(mapped.iter().all(|m| m.keeps_original));
    }

    #[test]
    fn test_batch_collision_is_rejected() {
        let items = vec![Item::new("doc_1"), Item::new("alpha")];
        let err = IdKind::Integer.map_batch(&items).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);

        let items = vec![Item::new("a_7"), Item::new("b_7")];
        assert!(IdKind::Integer.map_batch(&items).is_err());
    }

    #[test]
    fn test_recover_prefers_stored_original() {
        let backend = IdKind::Uuid.to_backend_id("doc_1").unwrap();
        let mut metadata = Metadata::new();
        metadata.insert(ORIGINAL_ID_KEY.into(), "doc_1".into());
        metadata.insert("status".into(), "active".into());

        assert_eq!(IdKind::Uuid.recover(&backend, &mut metadata), "doc_1");
        assert!(!metadata.contains_key(ORIGINAL_ID_KEY));
        assert_eq!(metadata.len(), 1);
    }
}
