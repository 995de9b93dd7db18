//! Durable persistence: embedded KV database, typed codec, things storage
//! with the per-thing synchronization ledger.

pub mod codec;
pub mod db;
mod things;

pub use codec::{FeatureData, SystemThingData, ThingData};
pub use db::Database;
pub use things::{ThingStorage, ThingStore};

use std::path::PathBuf;

use thiserror::Error;

/// Storage capability errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("database is closed")]
    Closed,

    #[error("not found")]
    NotFound,

    #[error("thing with ID `{id}` could not be found")]
    ThingNotFound { id: String },

    #[error("feature with ID `{feature_id}` on the thing with ID `{thing_id}` could not be found")]
    FeatureNotFound {
        thing_id: String,
        feature_id: String,
    },

    #[error("thing ID `{id}` is invalid: {reason}")]
    InvalidThingId { id: String, reason: String },

    #[error("stored record is corrupted: {reason}")]
    Corrupted { reason: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Codec(#[from] codec::CodecError),
}

impl StoreError {
    /// True for both flavors of thing lookup misses.
    pub fn is_thing_not_found(&self) -> bool {
        matches!(self, StoreError::ThingNotFound { .. })
    }

    pub fn is_feature_not_found(&self) -> bool {
        matches!(self, StoreError::FeatureNotFound { .. })
    }
}
