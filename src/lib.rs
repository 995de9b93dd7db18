#![forbid(unsafe_code)]

//! Edge-resident local digital twin broker core.
//!
//! Keeps a persisted, authoritative local copy of each thing and its
//! features so local applications can query and mutate twin state over the
//! Ditto-style JSON command protocol while the cloud link is down. When the
//! link comes back, the synchronizer drains locally accumulated changes
//! upstream and pulls cloud desired properties down.

pub mod commands;
pub mod config;
pub mod error;
pub mod model;
pub mod protocol;
pub mod router;
pub mod selector;
pub mod store;
pub mod sync;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::commands::{DeviceInfo, Handler};
pub use crate::model::{DefinitionId, Feature, NamespacedId, Thing};
pub use crate::protocol::{Action, Channel, Criterion, Envelope, Group, Headers, Topic};
pub use crate::router::{ConnectionListener, Disposition, Message, Publisher, Subscriber};
pub use crate::store::{SystemThingData, ThingStorage, ThingStore};
pub use crate::sync::Synchronizer;
