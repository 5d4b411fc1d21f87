//! Loading persisted entities with reset-on-malformed recovery.

use crate::{StatsError, StatsResult};
use karma_storage::PersistentStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// Semantic checks beyond what deserialization enforces.
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

/// A loaded entity and whether it had to be reset.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<T> {
    pub value: T,
    pub reset: bool,
}

/// Decode and validate a stored value.
pub fn decode_entity<T>(key: &str, value: Value) -> StatsResult<T>
where
    T: DeserializeOwned + Validate,
{
    let entity: T =
        serde_json::from_value(value).map_err(|e| StatsError::validation(key, e.to_string()))?;
    entity
        .validate()
        .map_err(|reason| StatsError::validation(key, reason))?;
    Ok(entity)
}

/// Load `key`, falling back to `default()` when absent.
///
/// A present but malformed value is replaced by the default, which is
/// persisted before returning. Store failures propagate.
pub async fn load_or_reset<T, F>(
    store: &dyn PersistentStore,
    key: &str,
    default: F,
) -> StatsResult<Loaded<T>>
where
    T: DeserializeOwned + Serialize + Validate,
    F: FnOnce() -> T,
{
    let Some(raw) = store.get(key).await? else {
        return Ok(Loaded {
            value: default(),
            reset: false,
        });
    };

    match decode_entity(key, raw) {
        Ok(value) => Ok(Loaded {
            value,
            reset: false,
        }),
        Err(err) => {
            warn!(key, error = %err, "persisted value malformed, resetting to default");
            let value = default();
            store.set(key, serde_json::to_value(&value)?).await?;
            Ok(Loaded { value, reset: true })
        }
    }
}
