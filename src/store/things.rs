//! Things storage: persisted things, features and the sync ledger.
//!
//! Logical key layout inside the single bucket (`§` is the reserved
//! separator and therefore forbidden inside ids):
//!
//! ```text
//! @SYSTEM/NAME          device id this file is bound to
//! §                     set of stored thing ids
//! <thingId>             thing data (policy, definition, attributes)
//! §<thingId>            per-thing sync ledger
//! <thingId>§<featureId> one feature
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use crate::model::{DefinitionId, Feature, NamespacedId, Thing};
use crate::protocol::TOPIC_PLACEHOLDER;

use super::codec::{
    decode_feature_data, decode_id_set, decode_system_data, decode_thing_data,
    encode_feature_data, encode_id_set, encode_system_data, encode_thing_data, FeatureData,
    SystemThingData, ThingData,
};
use super::db::Database;
use super::StoreError;

const ID_SEPARATOR: &str = "§";

fn thing_key(thing_id: &str) -> Vec<u8> {
    thing_id.as_bytes().to_vec()
}

fn system_key(thing_id: &str) -> Vec<u8> {
    format!("{ID_SEPARATOR}{thing_id}").into_bytes()
}

fn feature_key(thing_id: &str, feature_id: &str) -> Vec<u8> {
    format!("{thing_id}{ID_SEPARATOR}{feature_id}").into_bytes()
}

fn features_prefix(thing_id: &str) -> Vec<u8> {
    format!("{thing_id}{ID_SEPARATOR}").into_bytes()
}

/// Abstract storage seam borrowed by the command handler and the
/// synchronizer. All writes go through this interface; each operation is
/// atomic and durable on return.
pub trait ThingStorage: Send + Sync {
    /// Device this storage is bound to.
    fn device_id(&self) -> &str;

    /// Identifiers of the currently stored things, empty if none.
    fn thing_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Persist the thing and its features, replacing any previous state.
    /// Returns the thing's unsynchronized revision after the write.
    fn add_thing(&self, thing: &Thing) -> Result<i64, StoreError>;

    /// The stored thing with its features and ledger-owned fields.
    fn thing(&self, thing_id: &str) -> Result<Thing, StoreError>;

    /// The stored thing without its features.
    fn thing_data(&self, thing_id: &str) -> Result<Thing, StoreError>;

    /// Remove the thing, all its features and its ledger.
    fn remove_thing(&self, thing_id: &str) -> Result<(), StoreError>;

    /// Persist one feature; bumps the ledger and the feature's unsync
    /// counter. Returns the new counter.
    fn add_feature(
        &self,
        thing_id: &str,
        feature_id: &str,
        feature: &Feature,
    ) -> Result<i64, StoreError>;

    /// The stored feature.
    fn feature(&self, thing_id: &str, feature_id: &str) -> Result<Feature, StoreError>;

    /// Remove the feature and mark it deleted in the ledger.
    fn remove_feature(&self, thing_id: &str, feature_id: &str) -> Result<(), StoreError>;

    /// Clear the ledger wholesale if `revision` still matches.
    fn thing_synchronized(&self, thing_id: &str, revision: i64) -> Result<bool, StoreError>;

    /// Clear one feature's sync state if `revision` still matches its
    /// unsync counter (or it was only marked deleted).
    fn feature_synchronized(
        &self,
        thing_id: &str,
        feature_id: &str,
        revision: i64,
    ) -> Result<bool, StoreError>;

    /// Snapshot of the thing's ledger.
    fn system_data(&self, thing_id: &str) -> Result<SystemThingData, StoreError>;
}

/// The persistent things storage over the embedded KV database.
pub struct ThingStore {
    device_id: String,
    db: Database,
}

impl ThingStore {
    /// Open the store at `path`, bound to `device_id`.
    ///
    /// A file bound to a different device is backed up (renamed to
    /// `<path>.<old-id>` with `:` sanitized to `_`, or `<path>.<unix-
    /// seconds>` when that rename fails) and a fresh store is opened and
    /// bound in its place.
    pub fn open(path: impl AsRef<Path>, device_id: &str) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
        }

        let db = Database::open(path)?;
        match db.name()? {
            None => db.set_name(device_id)?,
            Some(name) if name == device_id => {}
            Some(name) => {
                db.close()?;
                backup(path, &name)?;
                debug!(old_device = %name, new_device = %device_id, "things database rebound");
                return Self::open(path, device_id);
            }
        }

        Ok(Self {
            device_id: device_id.to_string(),
            db,
        })
    }

    pub fn close(&self) -> Result<(), StoreError> {
        self.db.close()
    }

    fn load_system(&self, thing_id: &str) -> Result<SystemThingData, StoreError> {
        match self.db.get(&system_key(thing_id)) {
            Ok(bytes) => Ok(decode_system_data(&bytes)?),
            Err(StoreError::NotFound) => Err(StoreError::ThingNotFound {
                id: thing_id.to_string(),
            }),
            Err(err) => Err(err),
        }
    }

    fn load_thing_data(&self, thing_id: &str) -> Result<ThingData, StoreError> {
        match self.db.get(&thing_key(thing_id)) {
            Ok(bytes) => Ok(decode_thing_data(&bytes)?),
            Err(StoreError::NotFound) => Err(StoreError::ThingNotFound {
                id: thing_id.to_string(),
            }),
            Err(err) => Err(err),
        }
    }

    fn stored_feature_ids(&self, thing_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = self.db.scan_prefix(&features_prefix(thing_id))?;
        let mut ids = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            ids.push(decode_feature_data(&value)?.id);
        }
        Ok(ids)
    }

    fn id_set(&self) -> Result<BTreeSet<String>, StoreError> {
        match self.db.get(ID_SEPARATOR.as_bytes()) {
            Ok(bytes) => Ok(decode_id_set(&bytes)?),
            Err(StoreError::NotFound) => Ok(BTreeSet::new()),
            Err(err) => Err(err),
        }
    }

    fn fill_thing(&self, data: ThingData, system: &SystemThingData) -> Result<Thing, StoreError> {
        let id = NamespacedId::parse(&data.id).map_err(|e| StoreError::Corrupted {
            reason: e.to_string(),
        })?;
        let mut thing = Thing::new().with_id(id).with_attributes(data.attributes);
        if let Some(policy_id) = data.policy_id {
            thing.policy_id =
                Some(
                    NamespacedId::parse(&policy_id).map_err(|e| StoreError::Corrupted {
                        reason: e.to_string(),
                    })?,
                );
        }
        if let Some(definition) = data.definition {
            thing.definition =
                Some(
                    DefinitionId::parse(&definition).map_err(|e| StoreError::Corrupted {
                        reason: e.to_string(),
                    })?,
                );
        }
        thing.revision = system.revision;
        thing.timestamp = system.timestamp.clone();
        Ok(thing)
    }
}

impl ThingStorage for ThingStore {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn thing_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.id_set()?.into_iter().collect())
    }

    fn add_thing(&self, thing: &Thing) -> Result<i64, StoreError> {
        let Some(id) = thing.id.as_ref() else {
            return Err(StoreError::InvalidThingId {
                id: String::new(),
                reason: "thing with provided ID is mandatory on adding thing".into(),
            });
        };
        if id.namespace() == TOPIC_PLACEHOLDER || id.name() == TOPIC_PLACEHOLDER {
            return Err(StoreError::InvalidThingId {
                id: id.to_string(),
                reason: "placeholder is not a thing ID".into(),
            });
        }
        let thing_id = id.to_string();

        let mut system = match self.load_system(&thing_id) {
            Ok(system) => system,
            Err(StoreError::ThingNotFound { .. }) => SystemThingData {
                id: thing_id.clone(),
                // Seeded so the post-write revision equals the incoming one.
                revision: thing.revision - 1,
                ..Default::default()
            },
            Err(err) => return Err(err),
        };
        bump(&mut system);

        // Every previously stored feature counts as deleted until the new
        // payload re-adds it; pending unsync counters start over.
        system.unsynchronized_features.clear();
        for feature_id in self.stored_feature_ids(&thing_id)? {
            system.deleted_features.insert(feature_id);
        }

        let data = ThingData {
            id: thing_id.clone(),
            policy_id: thing.policy_id.as_ref().map(ToString::to_string),
            definition: thing.definition.as_ref().map(ToString::to_string),
            attributes: thing.attributes.clone(),
        };

        let mut entries = Vec::new();
        if let Some(features) = &thing.features {
            for (feature_id, feature) in features {
                system.deleted_features.remove(feature_id);
                let counter = system
                    .unsynchronized_features
                    .entry(feature_id.clone())
                    .or_insert(0);
                *counter += 1;
                entries.push((
                    feature_key(&thing_id, feature_id),
                    encode_feature_data(&feature_data(&thing_id, feature_id, feature))?,
                ));
            }
        }

        entries.push((thing_key(&thing_id), encode_thing_data(&data)?));
        entries.push((system_key(&thing_id), encode_system_data(&system)?));

        let mut ids = self.id_set()?;
        ids.insert(thing_id.clone());
        entries.push((ID_SEPARATOR.as_bytes().to_vec(), encode_id_set(&ids)?));

        self.db
            .apply(&[features_prefix(&thing_id)], &[], &entries)?;
        Ok(system.revision)
    }

    fn thing(&self, thing_id: &str) -> Result<Thing, StoreError> {
        let data = self.load_thing_data(thing_id)?;
        let system = self.load_system(thing_id)?;
        let mut thing = self.fill_thing(data, &system)?;

        let rows = self.db.scan_prefix(&features_prefix(thing_id))?;
        for (_, value) in rows {
            let feature_data = decode_feature_data(&value)?;
            thing = thing.with_feature(feature_data.id.clone(), feature_from(feature_data));
        }
        Ok(thing)
    }

    fn thing_data(&self, thing_id: &str) -> Result<Thing, StoreError> {
        let data = self.load_thing_data(thing_id)?;
        let system = self.load_system(thing_id)?;
        self.fill_thing(data, &system)
    }

    fn remove_thing(&self, thing_id: &str) -> Result<(), StoreError> {
        self.load_system(thing_id)?;

        let mut ids = self.id_set()?;
        ids.remove(thing_id);

        self.db.apply(
            &[features_prefix(thing_id)],
            &[thing_key(thing_id), system_key(thing_id)],
            &[(ID_SEPARATOR.as_bytes().to_vec(), encode_id_set(&ids)?)],
        )
    }

    fn add_feature(
        &self,
        thing_id: &str,
        feature_id: &str,
        feature: &Feature,
    ) -> Result<i64, StoreError> {
        let mut system = self.load_system(thing_id)?;
        bump(&mut system);

        system.deleted_features.remove(feature_id);
        let counter = system
            .unsynchronized_features
            .entry(feature_id.to_string())
            .or_insert(0);
        *counter += 1;
        let counter = *counter;

        self.db.apply(
            &[],
            &[],
            &[
                (
                    feature_key(thing_id, feature_id),
                    encode_feature_data(&feature_data(thing_id, feature_id, feature))?,
                ),
                (system_key(thing_id), encode_system_data(&system)?),
            ],
        )?;
        Ok(counter)
    }

    fn feature(&self, thing_id: &str, feature_id: &str) -> Result<Feature, StoreError> {
        self.load_system(thing_id)?;
        match self.db.get(&feature_key(thing_id, feature_id)) {
            Ok(bytes) => Ok(feature_from(decode_feature_data(&bytes)?)),
            Err(StoreError::NotFound) => Err(StoreError::FeatureNotFound {
                thing_id: thing_id.to_string(),
                feature_id: feature_id.to_string(),
            }),
            Err(err) => Err(err),
        }
    }

    fn remove_feature(&self, thing_id: &str, feature_id: &str) -> Result<(), StoreError> {
        let mut system = self.load_system(thing_id)?;
        bump(&mut system);

        let key = feature_key(thing_id, feature_id);
        match self.db.get(&key) {
            Ok(_) => {}
            Err(StoreError::NotFound) => {
                return Err(StoreError::FeatureNotFound {
                    thing_id: thing_id.to_string(),
                    feature_id: feature_id.to_string(),
                });
            }
            Err(err) => return Err(err),
        }

        system.deleted_features.insert(feature_id.to_string());
        system.unsynchronized_features.remove(feature_id);

        self.db.apply(
            &[],
            &[key],
            &[(system_key(thing_id), encode_system_data(&system)?)],
        )
    }

    fn thing_synchronized(&self, thing_id: &str, revision: i64) -> Result<bool, StoreError> {
        let mut system = self.load_system(thing_id)?;
        if revision != system.revision {
            return Ok(false);
        }
        system.deleted_features.clear();
        system.unsynchronized_features.clear();
        self.db
            .put(&system_key(thing_id), &encode_system_data(&system)?)?;
        Ok(true)
    }

    fn feature_synchronized(
        &self,
        thing_id: &str,
        feature_id: &str,
        revision: i64,
    ) -> Result<bool, StoreError> {
        let mut system = self.load_system(thing_id)?;

        match system.unsynchronized_features.get(feature_id).copied() {
            None => {
                if !system.deleted_features.remove(feature_id) {
                    // Nothing pending for this feature.
                    return Ok(true);
                }
            }
            Some(counter) if counter != revision => {
                // A newer local change happened; keep the ledger dirty.
                return Ok(false);
            }
            Some(_) => {
                system.unsynchronized_features.remove(feature_id);
            }
        }

        self.db
            .put(&system_key(thing_id), &encode_system_data(&system)?)?;
        Ok(true)
    }

    fn system_data(&self, thing_id: &str) -> Result<SystemThingData, StoreError> {
        self.load_system(thing_id)
    }
}

fn bump(system: &mut SystemThingData) {
    system.revision += 1;
    system.timestamp = now_rfc3339();
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .expect("zero nanosecond is valid")
        .format(&Rfc3339)
        .expect("rfc3339 formatting of a utc timestamp")
}

fn feature_data(thing_id: &str, feature_id: &str, feature: &Feature) -> FeatureData {
    FeatureData {
        id: feature_id.to_string(),
        thing_id: thing_id.to_string(),
        definition: feature
            .definition
            .as_ref()
            .map(|definitions| definitions.iter().map(ToString::to_string).collect())
            .unwrap_or_default(),
        properties: feature.properties.clone(),
        desired_properties: feature.desired_properties.clone(),
    }
}

fn feature_from(data: FeatureData) -> Feature {
    let mut feature = Feature::new()
        .with_properties(data.properties)
        .with_desired_properties(data.desired_properties);
    if !data.definition.is_empty() {
        let definitions = data
            .definition
            .iter()
            .filter_map(|raw| DefinitionId::parse(raw).ok())
            .collect();
        feature = feature.with_definition(definitions);
    }
    feature
}

fn backup(path: &Path, name: &str) -> Result<(), StoreError> {
    let sanitized = name.replace(':', "_");
    let primary = path.with_file_name(format!(
        "{}.{}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        sanitized
    ));
    if fs::rename(path, &primary).is_ok() {
        return Ok(());
    }
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let fallback = path.with_file_name(format!(
        "{}.{}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        seconds
    ));
    fs::rename(path, &fallback).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}
