//! Canonical value types crossing the adapter boundary.

mod collection;
mod item;
mod result;

pub use collection::{Collection, DistanceMetric};
pub use item::{Item, ItemUpdate, Metadata, ORIGINAL_ID_KEY};
pub use result::{Hit, QueryResult, Ranking};
