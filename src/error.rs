//! Crate-level convenience error.
//!
//! A thin wrapper over the canonical capability errors; protocol-level
//! failures are error envelopes, not variants here.

use thiserror::Error;

use crate::commands::CommandError;
use crate::config::ConfigError;
use crate::model::IdError;
use crate::protocol::ProtocolError;
use crate::router::PublishError;
use crate::selector::SelectorError;
use crate::store::StoreError;
use crate::sync::SyncError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Id(#[from] IdError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
