//! Configuration migration
//!
//! Older documents pass through a registered chain of upgrade
//! functions keyed `v -> v+1` on the raw JSON value, before
//! deserialization, so renamed or moved fields can be rewritten
//! without keeping legacy struct definitions around.

use crate::error::{Error, Result};
use serde_json::Value;
use tracing::info;

/// Version this build reads and writes
pub const CURRENT_CONFIG_VERSION: u32 = 2;

type MigrationFn = fn(&mut Value) -> Result<()>;

/// Upgrade functions, index `v` migrating `v -> v+1`
fn registry(from: u32) -> Option<MigrationFn> {
    match from {
        0 => Some(migrate_v0_to_v1),
        1 => Some(migrate_v1_to_v2),
        _ => None,
    }
}

/// Apply every pending migration in place. Returns whether anything
/// changed.
pub fn upgrade(doc: &mut Value) -> Result<bool> {
    let mut version = doc
        .get("version")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;

    if version > CURRENT_CONFIG_VERSION {
        return Err(Error::Config(format!(
            "config version {version} is newer than supported {CURRENT_CONFIG_VERSION}"
        )));
    }

    let migrated = version < CURRENT_CONFIG_VERSION;
    while version < CURRENT_CONFIG_VERSION {
        let step = registry(version).ok_or(Error::ConfigMigration {
            from: version,
            to: version + 1,
        })?;
        info!(from = version, to = version + 1, "migrating configuration");
        step(doc)?;
        version += 1;
        doc["version"] = Value::from(version);
    }
    Ok(migrated)
}

/// v0 -> v1: sets gained an `enabled` flag; existing sets stay active
fn migrate_v0_to_v1(doc: &mut Value) -> Result<()> {
    if let Some(sets) = doc.get_mut("sets").and_then(Value::as_array_mut) {
        for set in sets {
            if set.get("enabled").is_none() {
                set["enabled"] = Value::Bool(true);
            }
        }
    }
    Ok(())
}

/// v1 -> v2: the global `seg2delay` moved into each set's TCP
/// sub-configuration as `seg2_delay_ms`
fn migrate_v1_to_v2(doc: &mut Value) -> Result<()> {
    let delay = doc
        .get("seg2delay")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if let Some(obj) = doc.as_object_mut() {
        obj.remove("seg2delay");
    }
    if delay == 0 {
        return Ok(());
    }

    if let Some(sets) = doc.get_mut("sets").and_then(Value::as_array_mut) {
        for set in sets {
            let tcp = set
                .as_object_mut()
                .ok_or_else(|| Error::Config("set is not an object".into()))?
                .entry("tcp")
                .or_insert_with(|| Value::Object(Default::default()));
            if tcp.get("seg2_delay_ms").is_none() {
                tcp["seg2_delay_ms"] = Value::from(delay);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_v0_gets_enabled_flag() {
        let mut doc = json!({
            "sets": [{"id": "main", "name": "Main"}]
        });
        assert!(upgrade(&mut doc).unwrap());
        assert_eq!(doc["version"], CURRENT_CONFIG_VERSION);
        assert_eq!(doc["sets"][0]["enabled"], true);
    }

    #[test]
    fn test_v1_moves_seg2delay() {
        let mut doc = json!({
            "version": 1,
            "seg2delay": 12,
            "sets": [{"id": "main", "enabled": true}]
        });
        assert!(upgrade(&mut doc).unwrap());
        assert!(doc.get("seg2delay").is_none());
        assert_eq!(doc["sets"][0]["tcp"]["seg2_delay_ms"], 12);
    }

    #[test]
    fn test_current_version_untouched() {
        let mut doc = json!({"version": CURRENT_CONFIG_VERSION, "sets": []});
        assert!(!upgrade(&mut doc).unwrap());
    }

    #[test]
    fn test_future_version_rejected() {
        let mut doc = json!({"version": CURRENT_CONFIG_VERSION + 1});
        assert!(upgrade(&mut doc).is_err());
    }

    #[test]
    fn test_migrated_doc_deserializes() {
        let mut doc = json!({
            "seg2delay": 5,
            "sets": [{"id": "legacy", "name": "Legacy"}]
        });
        upgrade(&mut doc).unwrap();
        let config: crate::config::Config = serde_json::from_value(doc).unwrap();
        assert!(config.sets[0].enabled);
        assert_eq!(config.sets[0].tcp.seg2_delay_ms, 5);
    }
}
