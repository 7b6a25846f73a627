//! The in-memory model of a composite: manifest DOM, branch views and the
//! composite container that owns the four branch slots.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error, Result};
use serde_json::Value;

use crate::errors::SyncError;
use crate::utils::json::Table;
use crate::utils::raw::random_hex_string;

pub use crate::model::branch::{Branch, MutableBranch};
pub use crate::model::composite::Composite;
pub use crate::model::manifest::Manifest;
pub use crate::model::node::{Component, Node};

pub mod branch;
pub mod composite;
pub(crate) mod format;
pub mod manifest;
pub mod node;
pub mod path;

/// The synchronization state of a composite or component asset.
///
/// Clients may set `Unmodified`, `Modified` and `PendingDelete`;
/// `CommittedDelete` is produced by the push engine once a deletion has
/// reached the server and is removed from the DOM on accept.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum AssetState {
    Unmodified,
    #[default]
    Modified,
    PendingDelete,
    CommittedDelete,
}

impl FromStr for AssetState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unmodified" => Ok(Self::Unmodified),
            "modified" => Ok(Self::Modified),
            "pendingDelete" => Ok(Self::PendingDelete),
            "committedDelete" => Ok(Self::CommittedDelete),
            _ => Err(anyhow!(SyncError::InvalidManifest {
                details: format!("unknown asset state: '{s}'"),
            })),
        }
    }
}

impl fmt::Display for AssetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unmodified => "unmodified",
            Self::Modified => "modified",
            Self::PendingDelete => "pendingDelete",
            Self::CommittedDelete => "committedDelete",
        })
    }
}

/// Mints a GUID-shaped id for composites, nodes, components and assets.
pub(crate) fn mint_id() -> String {
    format!(
        "{}-{}-{}-{}-{}",
        random_hex_string(8),
        random_hex_string(4),
        random_hex_string(4),
        random_hex_string(4),
        random_hex_string(12)
    )
}

/// The link relation that binds an entity to its server-side resource.
pub(crate) const SELF_LINK_REL: &str = "self";

/// Whether a `_links` table carries a `self` relation.
pub(crate) fn has_self_link(links: &Table) -> bool {
    links.contains_key(SELF_LINK_REL)
}

/// The href of the `self` link, when present and well formed.
pub(crate) fn self_link_href(links: &Table) -> Option<&str> {
    match links.get(SELF_LINK_REL) {
        Some(Value::Object(link)) => link.get("href").and_then(Value::as_str),
        Some(Value::String(href)) => Some(href),
        _ => None,
    }
}
