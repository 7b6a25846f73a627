//! Node and component records of a manifest.
//!
//! Both are plain data records: known fields are typed, everything else a
//! document carried lands in the `extra` side-car table and is re-emitted
//! verbatim on serialization. Structure (which node owns which children and
//! components) lives in the manifest arenas, not on the records.

use anyhow::Result;
use serde_json::Value;

use crate::model::{has_self_link, AssetState};
use crate::utils::json::{self, Table};

/// A leaf of the manifest tree, referencing one binary asset.
#[derive(Clone, Debug, PartialEq)]
pub struct Component {
    pub id: String,
    /// Single path segment relative to the enclosing node's absolute path.
    pub path: String,
    pub name: Option<String>,
    pub relationship: Option<String>,
    /// The mime type of the component's asset.
    pub media_type: Option<String>,
    pub state: AssetState,
    pub etag: Option<String>,
    pub version: Option<String>,
    pub length: Option<u64>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub links: Table,
    pub extra: Table,
}

impl Component {
    pub fn new(id: String, path: String, name: Option<String>, media_type: Option<String>) -> Self {
        Self {
            id,
            path,
            name,
            relationship: None,
            media_type,
            state: AssetState::Modified,
            etag: None,
            version: None,
            length: None,
            width: None,
            height: None,
            links: Table::new(),
            extra: Table::new(),
        }
    }

    /// A component is bound once it carries a server-side `self` link.
    pub fn is_bound(&self) -> bool {
        has_self_link(&self.links)
    }

    /// Unknown-key access for attributes not exposed as fields.
    pub fn value_for_key(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub(crate) fn from_json(mut table: Table, path: &str) -> Result<Self> {
        let state = match json::get_opt_string(&mut table, "state", path)? {
            Some(s) => s.parse()?,
            None => AssetState::Unmodified,
        };
        Ok(Self {
            id: json::get_string(&mut table, "id", path)?,
            path: json::get_string(&mut table, "path", path)?,
            name: json::get_opt_string(&mut table, "name", path)?,
            relationship: json::get_opt_string(&mut table, "rel", path)?,
            media_type: json::get_opt_string(&mut table, "type", path)?,
            state,
            etag: json::get_opt_string(&mut table, "etag", path)?,
            version: json::get_opt_string(&mut table, "version", path)?,
            length: json::get_opt_u64(&mut table, "length", path)?,
            width: json::get_opt_u64(&mut table, "width", path)?,
            height: json::get_opt_u64(&mut table, "height", path)?,
            links: json::get_table(&mut table, "_links", path)?,
            extra: table,
        })
    }

    pub(crate) fn into_json(self) -> Table {
        let mut result = Table::new();
        result.insert("id".to_owned(), Value::String(self.id));
        result.insert("path".to_owned(), Value::String(self.path));
        if let Some(name) = self.name {
            result.insert("name".to_owned(), Value::String(name));
        }
        if let Some(rel) = self.relationship {
            result.insert("rel".to_owned(), Value::String(rel));
        }
        if let Some(media_type) = self.media_type {
            result.insert("type".to_owned(), Value::String(media_type));
        }
        result.insert("state".to_owned(), Value::String(self.state.to_string()));
        if let Some(etag) = self.etag {
            result.insert("etag".to_owned(), Value::String(etag));
        }
        if let Some(version) = self.version {
            result.insert("version".to_owned(), Value::String(version));
        }
        if let Some(length) = self.length {
            result.insert("length".to_owned(), Value::from(length));
        }
        if let Some(width) = self.width {
            result.insert("width".to_owned(), Value::from(width));
        }
        if let Some(height) = self.height {
            result.insert("height".to_owned(), Value::from(height));
        }
        if !self.links.is_empty() {
            result.insert("_links".to_owned(), Value::Object(self.links));
        }
        for (k, v) in self.extra {
            result.insert(k, v);
        }
        result
    }

    /// Strips server-side identity: links, etag and version.
    pub(crate) fn clear_binding(&mut self) {
        self.links.clear();
        self.etag = None;
        self.version = None;
    }
}

/// An interior element of the manifest tree.
///
/// The ordered child and component id lists are owned by the manifest's
/// arenas; use the manifest (or a branch view) to enumerate them.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: String,
    pub name: Option<String>,
    pub node_type: Option<String>,
    /// Single path segment, or `None` for a transparent node.
    pub path: Option<String>,
    pub extra: Table,
    pub(crate) children: Vec<String>,
    pub(crate) components: Vec<String>,
    pub(crate) is_root: bool,
}

impl Node {
    pub fn new(id: String, name: Option<String>, path: Option<String>) -> Self {
        Self {
            id,
            name,
            node_type: None,
            path,
            extra: Table::new(),
            children: Vec::new(),
            components: Vec::new(),
            is_root: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn value_for_key(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Parses the node record fields only; the caller walks `children` and
    /// `components` arrays itself to populate the arenas.
    pub(crate) fn from_json(table: &mut Table, path: &str) -> Result<Self> {
        Ok(Self {
            id: json::get_string(table, "id", path)?,
            name: json::get_opt_string(table, "name", path)?,
            node_type: json::get_opt_string(table, "type", path)?,
            path: json::get_opt_string(table, "path", path)?,
            extra: Table::new(),
            children: Vec::new(),
            components: Vec::new(),
            is_root: false,
        })
    }

    /// Serializes the node record fields only; children and components are
    /// appended by the manifest serializer.
    pub(crate) fn record_json(&self) -> Table {
        let mut result = Table::new();
        result.insert("id".to_owned(), Value::String(self.id.clone()));
        if let Some(name) = &self.name {
            result.insert("name".to_owned(), Value::String(name.clone()));
        }
        if let Some(node_type) = &self.node_type {
            result.insert("type".to_owned(), Value::String(node_type.clone()));
        }
        if let Some(path) = &self.path {
            result.insert("path".to_owned(), Value::String(path.clone()));
        }
        for (k, v) in &self.extra {
            result.insert(k.clone(), v.clone());
        }
        result
    }
}
