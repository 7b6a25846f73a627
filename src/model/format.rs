//! Manifest format versions and the ordered upgrade chain.

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::errors::SyncError;
use crate::utils::json::Table;

/// The manifest format this build reads and writes. Stored in the
/// `_local.version` field of committed manifests.
pub const MANIFEST_FORMAT_VERSION: u64 = 3;

/// Applies the per-version upgrades from `from` to the current format,
/// mutating the raw document table in place before typed parsing.
pub(crate) fn upgrade(table: &mut Table, from: u64) -> Result<()> {
    if from > MANIFEST_FORMAT_VERSION {
        return Err(anyhow!(SyncError::InvalidManifest {
            details: format!(
                "manifest format version {from} is newer than supported version {MANIFEST_FORMAT_VERSION}"
            ),
        }));
    }
    for version in from..MANIFEST_FORMAT_VERSION {
        match version {
            1 => upgrade_v1_to_v2(table),
            2 => upgrade_v2_to_v3(table),
            _ => {
                return Err(anyhow!(SyncError::InvalidManifest {
                    details: format!("no upgrade path from manifest format version {version}"),
                }))
            }
        }
    }
    if let Some(Value::Object(local)) = table.get_mut("_local") {
        local.insert("version".to_owned(), Value::from(MANIFEST_FORMAT_VERSION));
    }
    Ok(())
}

// Format 1 kept the client-reserved subtree under the unprefixed "local"
// key, which collided with user data.
fn upgrade_v1_to_v2(table: &mut Table) {
    if let Some(local) = table.remove("local") {
        table.insert("_local".to_owned(), local);
    }
}

// Format 2 named the component-to-asset map "storageIds".
fn upgrade_v2_to_v3(table: &mut Table) {
    if let Some(Value::Object(local)) = table.get_mut("_local") {
        if let Some(map) = local.remove("storageIds") {
            local.insert("localStorageAssetIdMap".to_owned(), map);
        }
    }
}
