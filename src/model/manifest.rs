//! The manifest DOM: a tree of nodes and components with strict identity
//! and path invariants, plus the JSON codec for local and remote storage.
//!
//! Nodes and components live in per-manifest arenas keyed by id; parents
//! and absolute paths are derived indexes rebuilt after every structural
//! mutation. Every mutation validates against the invariants first and
//! leaves the DOM untouched when it fails.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::errors::SyncError;
use crate::model::format::{self, MANIFEST_FORMAT_VERSION};
use crate::model::node::{Component, Node};
use crate::model::path::{self, validate_segment};
use crate::model::{self_link_href, has_self_link, mint_id, AssetState};
use crate::utils;
use crate::utils::json::{self, Table};

/// What an absolute path resolves to.
#[derive(Clone, Debug, Eq, PartialEq)]
enum PathOwner {
    Node(String),
    Component(String),
}

/// Options for copying a node subtree in from another manifest.
#[derive(Clone, Debug, Default)]
pub struct CopyOptions {
    /// Replace the subtree that already carries the incoming node's id.
    pub replace_existing: bool,
    /// New path segment for the root of the copied subtree.
    pub new_path: Option<String>,
    /// Mint fresh node and component ids throughout the copied subtree.
    pub force_new_ids: bool,
}

/// The outcome of a cross-manifest subtree copy, listing the component
/// work it implies for storage and transfer.
#[derive(Clone, Debug, Default)]
pub struct CopyOutcome {
    pub node_id: String,
    pub added_components: Vec<Component>,
    pub removed_components: Vec<Component>,
}

#[derive(Clone, Debug)]
pub struct Manifest {
    // Top-level fields.
    composite_id: String,
    name: String,
    media_type: String,
    created: Option<String>,
    modified: Option<String>,
    state: AssetState,
    etag: Option<String>,
    links: Table,
    extra: Table,

    // The client-reserved `_local` subtree.
    save_id: Option<String>,
    composite_href: Option<String>,
    manifest_etag: Option<String>,
    collaboration: Option<Value>,
    asset_ids: HashMap<String, String>,
    local_extra: Table,

    // Arenas. The root node lives in `nodes` under `root_id`.
    nodes: HashMap<String, Node>,
    components: HashMap<String, Component>,
    root_id: String,

    // Derived indexes.
    node_parent: HashMap<String, String>,
    component_parent: HashMap<String, String>,
    paths: HashMap<String, PathOwner>,
    node_prefix: HashMap<String, String>,

    dirty: bool,
}

impl Manifest {
    /// A manifest for a new empty composite.
    pub fn new(name: &str, media_type: &str) -> Self {
        Self::with_id(name, media_type, None)
    }

    pub(crate) fn with_id(name: &str, media_type: &str, composite_id: Option<String>) -> Self {
        let composite_id = composite_id.unwrap_or_else(mint_id);
        let mut root = Node::new(composite_id.clone(), None, None);
        root.is_root = true;
        let mut nodes = HashMap::new();
        nodes.insert(composite_id.clone(), root);
        let now = now_rfc3339();
        let mut manifest = Self {
            composite_id: composite_id.clone(),
            name: name.to_owned(),
            media_type: media_type.to_owned(),
            created: Some(now.clone()),
            modified: Some(now),
            state: AssetState::Modified,
            etag: None,
            links: Table::new(),
            extra: Table::new(),
            save_id: None,
            composite_href: None,
            manifest_etag: None,
            collaboration: None,
            asset_ids: HashMap::new(),
            local_extra: Table::new(),
            nodes,
            components: HashMap::new(),
            root_id: composite_id,
            node_parent: HashMap::new(),
            component_parent: HashMap::new(),
            paths: HashMap::new(),
            node_prefix: HashMap::new(),
            dirty: true,
        };
        manifest.rebuild_indexes();
        manifest
    }

    // ------------------------------------------------------------------
    // Codec
    // ------------------------------------------------------------------

    /// Parses a manifest document. The document must carry `name` and
    /// `type`; older formats are migrated to the current one first.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(anyhow!(SyncError::MissingJsonData));
        }
        let value: Value = serde_json::from_slice(data).map_err(|e| {
            anyhow!(SyncError::InvalidManifest {
                details: format!("not valid JSON: {e}"),
            })
        })?;
        let Value::Object(mut table) = value else {
            return Err(anyhow!(SyncError::InvalidManifest {
                details: "top level is not an object".to_owned(),
            }));
        };

        // A document without a local subtree (e.g. fresh from the server)
        // is in the current format by definition.
        let stored_version = table
            .get("_local")
            .or_else(|| table.get("local"))
            .and_then(|l| l.get("version"))
            .and_then(Value::as_u64)
            .unwrap_or(MANIFEST_FORMAT_VERSION);
        format::upgrade(&mut table, stored_version)?;

        let invalid = |details: String| anyhow!(SyncError::InvalidManifest { details });

        let composite_id = json::get_opt_string(&mut table, "id", "")?.unwrap_or_else(mint_id);
        let name = json::get_opt_string(&mut table, "name", "")?
            .ok_or_else(|| invalid("missing required field 'name'".to_owned()))?;
        let media_type = json::get_opt_string(&mut table, "type", "")?
            .ok_or_else(|| invalid("missing required field 'type'".to_owned()))?;
        let created = json::get_opt_string(&mut table, "created", "")?;
        let modified = json::get_opt_string(&mut table, "modified", "")?;
        let state = match json::get_opt_string(&mut table, "state", "")? {
            Some(s) => s.parse()?,
            None => AssetState::Unmodified,
        };
        let etag = json::get_opt_string(&mut table, "etag", "")?;
        let links = json::get_table(&mut table, "_links", "")?;

        let mut local = json::get_table(&mut table, "_local", "")?;
        local.remove("version");
        let save_id = json::get_opt_string(&mut local, "saveId", "_local.")?;
        let composite_href = json::get_opt_string(&mut local, "compositeHref", "_local.")?;
        let manifest_etag = json::get_opt_string(&mut local, "manifestEtag", "_local.")?;
        let collaboration = local.remove("collaboration");
        let mut asset_ids = HashMap::new();
        for (k, v) in json::get_table(&mut local, "localStorageAssetIdMap", "_local.")? {
            let Value::String(asset_id) = v else {
                return Err(invalid(format!("asset id for component '{k}' is not a string")));
            };
            asset_ids.insert(k, asset_id);
        }

        let mut root = Node::new(composite_id.clone(), None, None);
        root.is_root = true;
        let root_id = root.id.clone();
        let mut nodes = HashMap::new();
        let mut components = HashMap::new();

        let children = json::get_array(&mut table, "children", "")?;
        let root_components = json::get_array(&mut table, "components", "")?;
        nodes.insert(root_id.clone(), root);
        parse_children(&mut nodes, &mut components, &root_id, children, "children")?;
        parse_components(
            &mut nodes,
            &mut components,
            &root_id,
            root_components,
            "components",
        )?;

        let mut manifest = Self {
            composite_id,
            name,
            media_type,
            created,
            modified,
            state,
            etag,
            links,
            extra: table,
            save_id,
            composite_href,
            manifest_etag,
            collaboration,
            asset_ids,
            local_extra: local,
            nodes,
            components,
            root_id,
            node_parent: HashMap::new(),
            component_parent: HashMap::new(),
            paths: HashMap::new(),
            node_prefix: HashMap::new(),
            dirty: false,
        };
        manifest
            .rebuild_indexes_checked()
            .map_err(|e| invalid(e.to_string()))?;
        Ok(manifest)
    }

    /// Reads and parses a committed manifest from local storage.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).with_context(|| SyncError::ManifestReadFailure {
            path: PathBuf::from(path),
        })?;
        Self::parse(&data).with_context(|| SyncError::InvalidLocalManifest {
            details: format!("in '{}'", path.display()),
        })
    }

    /// The manifest in serialized form for local storage, including the
    /// client-reserved `_local` subtree.
    pub fn local_data(&self) -> Result<Vec<u8>> {
        let table = self.to_table(true);
        Ok(serde_json::to_vec_pretty(&Value::Object(table))?)
    }

    /// The manifest in serialized form for the server, with the `_local`
    /// subtree stripped.
    pub fn remote_data(&self) -> Result<Vec<u8>> {
        let table = self.to_table(false);
        Ok(serde_json::to_vec_pretty(&Value::Object(table))?)
    }

    /// Writes the manifest to `path`, optionally regenerating its save id.
    /// On success the manifest is no longer dirty.
    pub fn write_to_file(&mut self, file_path: &Path, generate_new_save_id: bool) -> Result<()> {
        if generate_new_save_id {
            self.save_id = Some(mint_id());
        }
        let data = self.local_data()?;
        utils::write_file_atomic("manifest", file_path, &data).with_context(|| {
            SyncError::ManifestWriteFailure {
                path: PathBuf::from(file_path),
            }
        })?;
        self.dirty = false;
        Ok(())
    }

    fn to_table(&self, with_local: bool) -> Table {
        let mut result = Table::new();
        result.insert("id".to_owned(), Value::String(self.composite_id.clone()));
        result.insert("name".to_owned(), Value::String(self.name.clone()));
        result.insert("type".to_owned(), Value::String(self.media_type.clone()));
        if let Some(created) = &self.created {
            result.insert("created".to_owned(), Value::String(created.clone()));
        }
        if let Some(modified) = &self.modified {
            result.insert("modified".to_owned(), Value::String(modified.clone()));
        }
        result.insert("state".to_owned(), Value::String(self.state.to_string()));
        if let Some(etag) = &self.etag {
            result.insert("etag".to_owned(), Value::String(etag.clone()));
        }
        if !self.links.is_empty() {
            result.insert("_links".to_owned(), Value::Object(self.links.clone()));
        }

        let root = &self.nodes[&self.root_id];
        let children = self.children_json(root);
        if !children.is_empty() {
            result.insert("children".to_owned(), Value::Array(children));
        }
        let components = self.components_json(root);
        if !components.is_empty() {
            result.insert("components".to_owned(), Value::Array(components));
        }
        for (k, v) in &self.extra {
            result.insert(k.clone(), v.clone());
        }

        if with_local {
            let mut local = Table::new();
            local.insert("version".to_owned(), Value::from(MANIFEST_FORMAT_VERSION));
            if let Some(save_id) = &self.save_id {
                local.insert("saveId".to_owned(), Value::String(save_id.clone()));
            }
            if let Some(href) = &self.composite_href {
                local.insert("compositeHref".to_owned(), Value::String(href.clone()));
            }
            if let Some(manifest_etag) = &self.manifest_etag {
                local.insert("manifestEtag".to_owned(), Value::String(manifest_etag.clone()));
            }
            if let Some(collaboration) = &self.collaboration {
                local.insert("collaboration".to_owned(), collaboration.clone());
            }
            let mut map = Table::new();
            let mut ids: Vec<_> = self.asset_ids.iter().collect();
            ids.sort();
            for (component_id, asset_id) in ids {
                map.insert(component_id.clone(), Value::String(asset_id.clone()));
            }
            local.insert("localStorageAssetIdMap".to_owned(), Value::Object(map));
            for (k, v) in &self.local_extra {
                local.insert(k.clone(), v.clone());
            }
            result.insert("_local".to_owned(), Value::Object(local));
        }
        result
    }

    fn children_json(&self, node: &Node) -> Vec<Value> {
        node.children
            .iter()
            .map(|id| {
                let child = &self.nodes[id];
                let mut table = child.record_json();
                let children = self.children_json(child);
                if !children.is_empty() {
                    table.insert("children".to_owned(), Value::Array(children));
                }
                let components = self.components_json(child);
                if !components.is_empty() {
                    table.insert("components".to_owned(), Value::Array(components));
                }
                Value::Object(table)
            })
            .collect()
    }

    fn components_json(&self, node: &Node) -> Vec<Value> {
        node.components
            .iter()
            .map(|id| Value::Object(self.components[id].clone().into_json()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn composite_id(&self) -> &str {
        &self.composite_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn composite_state(&self) -> AssetState {
        self.state
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn manifest_etag(&self) -> Option<&str> {
        self.manifest_etag.as_deref()
    }

    pub fn composite_href(&self) -> Option<&str> {
        self.composite_href.as_deref()
    }

    pub fn save_id(&self) -> Option<&str> {
        self.save_id.as_deref()
    }

    pub fn created(&self) -> Option<&str> {
        self.created.as_deref()
    }

    pub fn modified(&self) -> Option<&str> {
        self.modified.as_deref()
    }

    pub fn links(&self) -> &Table {
        &self.links
    }

    /// Whether the manifest has in-memory changes that have not been
    /// committed to local storage yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the manifest is bound to a composite on the server.
    pub fn is_bound(&self) -> bool {
        self.composite_href.is_some() || has_self_link(&self.links)
    }

    pub fn root_node(&self) -> &Node {
        &self.nodes[&self.root_id]
    }

    pub fn value_for_key(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn set_value(&mut self, key: &str, value: Value) -> Result<()> {
        self.ensure_mutable()?;
        self.extra.insert(key.to_owned(), value);
        self.mark_modified();
        Ok(())
    }

    pub fn remove_value(&mut self, key: &str) -> Result<()> {
        self.ensure_mutable()?;
        self.extra.remove(key);
        self.mark_modified();
        Ok(())
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        self.ensure_mutable()?;
        self.name = name.to_owned();
        self.mark_modified();
        Ok(())
    }

    /// Marks the composite for deletion on the next push. Further DOM
    /// mutation is rejected until the deletion is pushed or reset.
    pub fn mark_composite_for_deletion(&mut self) -> Result<()> {
        self.ensure_mutable()?;
        self.state = AssetState::PendingDelete;
        self.touch();
        Ok(())
    }

    /// Sets the composite state. `CommittedDelete` is internal and cannot
    /// be set through this method.
    pub fn set_composite_state(&mut self, state: AssetState) -> Result<()> {
        if state == AssetState::CommittedDelete {
            return Err(anyhow!(SyncError::InvalidManifest {
                details: "committedDelete is not a client-settable state".to_owned(),
            }));
        }
        self.ensure_mutable()?;
        self.state = state;
        self.touch();
        Ok(())
    }

    pub(crate) fn set_composite_state_internal(&mut self, state: AssetState) {
        self.state = state;
        self.touch();
    }

    pub(crate) fn set_etag(&mut self, etag: Option<String>) {
        self.etag = etag;
        self.dirty = true;
    }

    pub(crate) fn set_manifest_etag(&mut self, etag: Option<String>) {
        self.manifest_etag = etag;
        self.dirty = true;
    }

    pub(crate) fn set_composite_href(&mut self, href: Option<String>) {
        self.composite_href = href;
        self.dirty = true;
    }

    pub(crate) fn set_links(&mut self, links: Table) {
        self.links = links;
        self.dirty = true;
    }

    // ------------------------------------------------------------------
    // Asset id map (copy-on-write storage support)
    // ------------------------------------------------------------------

    pub(crate) fn asset_id_for(&self, component_id: &str) -> Option<&str> {
        self.asset_ids.get(component_id).map(String::as_str)
    }

    pub(crate) fn set_asset_id(&mut self, component_id: &str, asset_id: String) {
        self.asset_ids.insert(component_id.to_owned(), asset_id);
        self.dirty = true;
    }

    pub(crate) fn remove_asset_id(&mut self, component_id: &str) {
        self.asset_ids.remove(component_id);
        self.dirty = true;
    }

    pub(crate) fn asset_ids(&self) -> &HashMap<String, String> {
        &self.asset_ids
    }

    // ------------------------------------------------------------------
    // Component reads
    // ------------------------------------------------------------------

    /// Looks a component up by id, regardless of its state.
    pub fn component_with_id(&self, id: &str) -> Option<&Component> {
        self.components.get(id)
    }

    pub fn component_with_absolute_path(&self, abs_path: &str) -> Option<&Component> {
        match self.paths.get(abs_path) {
            Some(PathOwner::Component(id)) => {
                self.components.get(id).filter(|c| c.state != AssetState::CommittedDelete)
            }
            _ => None,
        }
    }

    /// All components of the manifest, in no particular order. Components
    /// whose deletion has been committed on the server are not exposed.
    pub fn all_components(&self) -> impl Iterator<Item = &Component> {
        self.components
            .values()
            .filter(|c| c.state != AssetState::CommittedDelete)
    }

    /// All components regardless of state, committed deletes included.
    /// The transfer engine and the accept step need to see those.
    pub(crate) fn components_any_state(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    /// The ordered component list at the root of the manifest.
    pub fn components(&self) -> Vec<&Component> {
        self.components_of_node(&self.nodes[&self.root_id])
    }

    /// The ordered component list of the given node.
    pub fn components_of(&self, node_id: &str) -> Result<Vec<&Component>> {
        let node = self.node_or_unknown(node_id)?;
        Ok(self.components_of_node(node))
    }

    fn components_of_node(&self, node: &Node) -> Vec<&Component> {
        node.components
            .iter()
            .map(|id| &self.components[id])
            .filter(|c| c.state != AssetState::CommittedDelete)
            .collect()
    }

    /// All components descended from the given node, depth first.
    pub fn components_descended_from(&self, node_id: &str) -> Result<Vec<&Component>> {
        let node = self.node_or_unknown(node_id)?;
        let mut result = Vec::new();
        self.collect_components(node, &mut result);
        Ok(result)
    }

    fn collect_components<'a>(&'a self, node: &'a Node, into: &mut Vec<&'a Component>) {
        into.extend(self.components_of_node(node));
        for child in &node.children {
            self.collect_components(&self.nodes[child], into);
        }
    }

    pub fn find_parent_of_component(&self, component_id: &str) -> Option<&Node> {
        let parent = self.component_parent.get(component_id)?;
        self.nodes.get(parent)
    }

    pub fn absolute_path_of_component(&self, component_id: &str) -> Option<String> {
        let component = self.components.get(component_id)?;
        let parent = self.component_parent.get(component_id)?;
        Some(path::join(&self.node_prefix[parent], &component.path))
    }

    // ------------------------------------------------------------------
    // Component mutations
    // ------------------------------------------------------------------

    /// Adds a new component, to the root when `parent` is `None`.
    pub fn add_component(&mut self, component: Component, parent: Option<&str>) -> Result<()> {
        self.ensure_mutable()?;
        let parent_id = self.resolve_parent(parent)?;
        validate_segment(&component.path)?;
        if self.components.contains_key(&component.id) || self.nodes.contains_key(&component.id) {
            return Err(anyhow!(SyncError::DuplicateId(component.id)));
        }
        let abs = path::join(&self.node_prefix[&parent_id], &component.path);
        if self.paths.contains_key(&abs) {
            return Err(anyhow!(SyncError::DuplicatePath(abs)));
        }

        let id = component.id.clone();
        self.components.insert(id.clone(), component);
        self.nodes.get_mut(&parent_id).unwrap().components.push(id.clone());
        self.component_parent.insert(id.clone(), parent_id);
        self.paths.insert(abs, PathOwner::Component(id));
        self.mark_modified();
        Ok(())
    }

    /// Adds a component copied from another manifest, optionally under a
    /// new path. Same-composite copies keep the component id and reuse the
    /// source's asset mapping (copy-on-write); the asset file itself is
    /// shared until one side replaces it.
    pub fn add_component_from(
        &mut self,
        component: &Component,
        source: &Manifest,
        parent: Option<&str>,
        new_path: Option<&str>,
    ) -> Result<Component> {
        let mut copy = component.clone();
        if let Some(new_path) = new_path {
            copy.path = new_path.to_owned();
        }
        let same_composite = source.composite_id == self.composite_id;
        if !same_composite || new_path.is_some() {
            copy.id = mint_id();
        }
        let asset_id = source.asset_id_for(&component.id).map(str::to_owned);
        let id = copy.id.clone();
        self.add_component(copy, parent)?;
        if same_composite {
            if let Some(asset_id) = asset_id {
                self.asset_ids.insert(id.clone(), asset_id);
            }
        }
        Ok(self.components[&id].clone())
    }

    /// Carries a component's record and its local asset mapping over from
    /// another manifest of the same composite. This is the building block
    /// for merged branches during pull resolution: start from a clone of
    /// the pulled manifest, then adopt the locally changed components
    /// from current.
    pub fn adopt_component_from(&mut self, component_id: &str, source: &Manifest) -> Result<()> {
        let Some(component) = source.component_with_id(component_id) else {
            return Err(anyhow!(SyncError::UnknownId(component_id.to_owned())));
        };
        if self.components.contains_key(component_id) {
            self.update_component(component.clone())?;
        } else {
            self.add_component(component.clone(), None)?;
        }
        if let Some(asset_id) = source.asset_id_for(component_id) {
            self.asset_ids
                .insert(component_id.to_owned(), asset_id.to_owned());
        }
        Ok(())
    }

    /// Replaces the stored component carrying `component.id`.
    pub fn update_component(&mut self, component: Component) -> Result<()> {
        self.ensure_mutable()?;
        let id = component.id.clone();
        let Some(current) = self.components.get(&id) else {
            return Err(anyhow!(SyncError::UnknownId(id)));
        };
        if component.path != current.path {
            validate_segment(&component.path)?;
            let parent = &self.component_parent[&id];
            let abs = path::join(&self.node_prefix[parent], &component.path);
            if self.paths.contains_key(&abs) {
                return Err(anyhow!(SyncError::DuplicatePath(abs)));
            }
        }
        self.components.insert(id, component);
        self.rebuild_indexes();
        self.mark_modified();
        Ok(())
    }

    /// Moves an existing component to another node (or the root).
    pub fn move_component_to(&mut self, component_id: &str, node_id: Option<&str>) -> Result<()> {
        self.ensure_mutable()?;
        let dest = self.resolve_parent(node_id)?;
        let Some(component) = self.components.get(component_id) else {
            return Err(anyhow!(SyncError::UnknownId(component_id.to_owned())));
        };
        let from = self.component_parent[component_id].clone();
        if from == dest {
            return Ok(());
        }
        let abs = path::join(&self.node_prefix[&dest], &component.path);
        if self.paths.contains_key(&abs) {
            return Err(anyhow!(SyncError::DuplicatePath(abs)));
        }

        let source = self.nodes.get_mut(&from).unwrap();
        source.components.retain(|c| c != component_id);
        self.nodes
            .get_mut(&dest)
            .unwrap()
            .components
            .push(component_id.to_owned());
        self.rebuild_indexes();
        self.mark_modified();
        Ok(())
    }

    /// Sets a component state. `CommittedDelete` is internal and cannot be
    /// set through this method.
    pub fn set_component_state(&mut self, component_id: &str, state: AssetState) -> Result<()> {
        if state == AssetState::CommittedDelete {
            return Err(anyhow!(SyncError::InvalidManifest {
                details: "committedDelete is not a client-settable state".to_owned(),
            }));
        }
        self.ensure_mutable()?;
        self.set_component_state_internal(component_id, state)?;
        self.mark_modified();
        Ok(())
    }

    /// Replaces a stored component without the client-facing mutation
    /// guards. Used when server fields are merged into a branch whose
    /// composite state forbids ordinary mutation (e.g. a pending delete).
    /// The component's path must be unchanged.
    pub(crate) fn update_component_internal(&mut self, component: Component) -> Result<()> {
        let id = component.id.clone();
        let Some(current) = self.components.get(&id) else {
            return Err(anyhow!(SyncError::UnknownId(id)));
        };
        debug_assert_eq!(current.path, component.path);
        self.components.insert(id, component);
        self.dirty = true;
        Ok(())
    }

    pub(crate) fn set_component_state_internal(
        &mut self,
        component_id: &str,
        state: AssetState,
    ) -> Result<()> {
        let Some(component) = self.components.get_mut(component_id) else {
            return Err(anyhow!(SyncError::UnknownId(component_id.to_owned())));
        };
        component.state = state;
        self.touch();
        Ok(())
    }

    pub fn set_component_modified(&mut self, component_id: &str, modified: bool) -> Result<()> {
        let state = if modified {
            AssetState::Modified
        } else {
            AssetState::Unmodified
        };
        self.set_component_state(component_id, state)
    }

    /// Removes a component and returns it.
    pub fn remove_component(&mut self, component_id: &str) -> Result<Component> {
        self.ensure_mutable()?;
        let removed = self.remove_component_internal(component_id)?;
        self.mark_modified();
        Ok(removed)
    }

    pub(crate) fn remove_component_internal(&mut self, component_id: &str) -> Result<Component> {
        let Some(component) = self.components.remove(component_id) else {
            return Err(anyhow!(SyncError::UnknownId(component_id.to_owned())));
        };
        let parent = self.component_parent.remove(component_id).unwrap();
        self.nodes
            .get_mut(&parent)
            .unwrap()
            .components
            .retain(|c| c != component_id);
        self.asset_ids.remove(component_id);
        self.rebuild_indexes();
        self.touch();
        Ok(component)
    }

    /// Removes every component of the manifest; returns them.
    pub fn remove_all_components(&mut self) -> Result<Vec<Component>> {
        self.ensure_mutable()?;
        let ids: Vec<_> = self.components.keys().cloned().collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            removed.push(self.remove_component_internal(&id)?);
        }
        if !removed.is_empty() {
            self.mark_modified();
        }
        Ok(removed)
    }

    /// Removes the components of the root level; returns them.
    pub fn remove_all_components_from_root(&mut self) -> Result<Vec<Component>> {
        let root_id = self.root_id.clone();
        self.remove_all_components_from_child(&root_id)
    }

    /// Removes the components of the given node; returns them.
    pub fn remove_all_components_from_child(&mut self, node_id: &str) -> Result<Vec<Component>> {
        self.ensure_mutable()?;
        let node = self.node_or_unknown(node_id)?;
        let ids = node.components.clone();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            removed.push(self.remove_component_internal(&id)?);
        }
        if !removed.is_empty() {
            self.mark_modified();
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Node reads
    // ------------------------------------------------------------------

    pub fn node_with_id(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn child_with_absolute_path(&self, abs_path: &str) -> Option<&Node> {
        match self.paths.get(abs_path) {
            Some(PathOwner::Node(id)) => self.nodes.get(id),
            _ => None,
        }
    }

    /// The ordered child list at the root of the manifest.
    pub fn children(&self) -> Vec<&Node> {
        self.children_of_node(&self.nodes[&self.root_id])
    }

    pub fn children_of(&self, node_id: &str) -> Result<Vec<&Node>> {
        let node = self.node_or_unknown(node_id)?;
        Ok(self.children_of_node(node))
    }

    fn children_of_node(&self, node: &Node) -> Vec<&Node> {
        node.children.iter().map(|id| &self.nodes[id]).collect()
    }

    /// All non-root nodes of the manifest, in no particular order.
    pub fn all_children(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| !n.is_root)
    }

    /// The parent of a node, plus the node's index within it.
    pub fn find_parent_of_child(&self, node_id: &str) -> Option<(&Node, usize)> {
        let parent_id = self.node_parent.get(node_id)?;
        let parent = self.nodes.get(parent_id)?;
        let index = parent.children.iter().position(|c| c == node_id)?;
        Some((parent, index))
    }

    pub fn absolute_path_of_node(&self, node_id: &str) -> Option<String> {
        let node = self.nodes.get(node_id)?;
        let segment = node.path.as_deref()?;
        let parent = self.node_parent.get(node_id)?;
        Some(path::join(&self.node_prefix[parent], segment))
    }

    /// The depth-first position of the node within the hierarchy, or
    /// `None` if the node is not part of this manifest.
    pub fn absolute_index_of(&self, node_id: &str) -> Option<usize> {
        fn walk(manifest: &Manifest, node: &Node, target: &str, index: &mut usize) -> bool {
            for child in &node.children {
                if child == target {
                    return true;
                }
                *index += 1;
                if walk(manifest, &manifest.nodes[child], target, index) {
                    return true;
                }
            }
            false
        }
        if !self.nodes.contains_key(node_id) || node_id == self.root_id {
            return None;
        }
        let mut index = 0;
        walk(self, &self.nodes[&self.root_id], node_id, &mut index).then_some(index)
    }

    // ------------------------------------------------------------------
    // Node mutations
    // ------------------------------------------------------------------

    /// Appends a new child node, to the root when `parent` is `None`.
    pub fn add_child(&mut self, node: Node, parent: Option<&str>) -> Result<()> {
        let index = match parent {
            Some(p) => self.node_or_unknown(p)?.children.len(),
            None => self.nodes[&self.root_id].children.len(),
        };
        self.insert_child(node, parent, index)
    }

    /// Inserts a new child node at the given index.
    pub fn insert_child(&mut self, node: Node, parent: Option<&str>, index: usize) -> Result<()> {
        self.ensure_mutable()?;
        let parent_id = self.resolve_parent(parent)?;
        if self.nodes.contains_key(&node.id) || self.components.contains_key(&node.id) {
            return Err(anyhow!(SyncError::DuplicateId(node.id)));
        }
        if let Some(segment) = &node.path {
            validate_segment(segment)?;
            let abs = path::join(&self.node_prefix[&parent_id], segment);
            if self.paths.contains_key(&abs) {
                return Err(anyhow!(SyncError::DuplicatePath(abs)));
            }
        }
        if !node.children.is_empty() || !node.components.is_empty() {
            return Err(anyhow!(SyncError::InvalidManifest {
                details: "a directly inserted node cannot carry structure; use insert_child_from"
                    .to_owned(),
            }));
        }
        let index = index.min(self.nodes[&parent_id].children.len());

        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        self.nodes.get_mut(&parent_id).unwrap().children.insert(index, id);
        self.rebuild_indexes();
        self.mark_modified();
        Ok(())
    }

    /// Replaces the record fields of the stored node carrying `node.id`.
    /// Structure (children, components) is not affected.
    pub fn update_child(&mut self, node: Node) -> Result<()> {
        self.ensure_mutable()?;
        let id = node.id.clone();
        let Some(current) = self.nodes.get(&id) else {
            return Err(anyhow!(SyncError::UnknownId(id)));
        };
        if current.is_root {
            return Err(anyhow!(SyncError::InvalidManifest {
                details: "the root node cannot be updated".to_owned(),
            }));
        }
        if node.path != current.path {
            if let Some(segment) = &node.path {
                validate_segment(segment)?;
            }
            // Re-pathing moves the whole subtree; check every descendant
            // path against the rest of the manifest before applying.
            let parent = self.node_parent[&id].clone();
            let parent_prefix = self.node_prefix[&parent].clone();
            let subtree = self.subtree_ids(&id);
            let candidate = self.subtree_paths(&id, &parent_prefix, node.path.as_deref());
            for abs in candidate {
                match self.paths.get(&abs) {
                    Some(PathOwner::Node(other)) if subtree.nodes.contains(other) => {}
                    Some(PathOwner::Component(other)) if subtree.components.contains(other) => {}
                    Some(_) => return Err(anyhow!(SyncError::DuplicatePath(abs))),
                    None => {}
                }
            }
        }
        let stored = self.nodes.get_mut(&id).unwrap();
        let (children, components) = (stored.children.clone(), stored.components.clone());
        let mut node = node;
        node.children = children;
        node.components = components;
        node.is_root = false;
        *stored = node;
        self.rebuild_indexes();
        self.mark_modified();
        Ok(())
    }

    /// Moves a child node. Within the same parent this is an index
    /// reorder; across parents it is a detach-then-attach after verifying
    /// path uniqueness at the destination.
    pub fn move_child(
        &mut self,
        node_id: &str,
        new_parent: Option<&str>,
        index: usize,
    ) -> Result<()> {
        self.ensure_mutable()?;
        let dest = self.resolve_parent(new_parent)?;
        let Some(node) = self.nodes.get(node_id) else {
            return Err(anyhow!(SyncError::UnknownId(node_id.to_owned())));
        };
        if node.is_root {
            return Err(anyhow!(SyncError::InvalidManifest {
                details: "the root node cannot be moved".to_owned(),
            }));
        }
        let from = self.node_parent[node_id].clone();

        if from == dest {
            let parent = self.nodes.get_mut(&from).unwrap();
            let old = parent.children.iter().position(|c| c == node_id).unwrap();
            parent.children.remove(old);
            let index = index.min(parent.children.len());
            parent.children.insert(index, node_id.to_owned());
            self.mark_modified();
            return Ok(());
        }

        // Moving under a descendant would detach the subtree from the root.
        let mut cursor = dest.clone();
        loop {
            if cursor == *node_id {
                return Err(anyhow!(SyncError::InvalidManifest {
                    details: "cannot move a node under its own descendant".to_owned(),
                }));
            }
            match self.node_parent.get(&cursor) {
                Some(parent) => cursor = parent.clone(),
                None => break,
            }
        }

        let node = &self.nodes[node_id];
        if let Some(segment) = &node.path {
            let abs = path::join(&self.node_prefix[&dest], segment);
            match self.paths.get(&abs) {
                Some(PathOwner::Node(other)) if other == node_id => {}
                Some(_) => return Err(anyhow!(SyncError::DuplicatePath(abs))),
                None => {}
            }
        } else {
            // A transparent node exposes its descendants under the new
            // prefix; verify each one.
            let subtree = self.subtree_ids(node_id);
            let prefix = self.node_prefix[&dest].clone();
            for abs in self.subtree_paths(node_id, &prefix, None) {
                match self.paths.get(&abs) {
                    Some(PathOwner::Node(other)) if subtree.nodes.contains(other) => {}
                    Some(PathOwner::Component(other)) if subtree.components.contains(other) => {}
                    Some(_) => return Err(anyhow!(SyncError::DuplicatePath(abs))),
                    None => {}
                }
            }
        }

        self.nodes
            .get_mut(&from)
            .unwrap()
            .children
            .retain(|c| c != node_id);
        let dest_node = self.nodes.get_mut(&dest).unwrap();
        let index = index.min(dest_node.children.len());
        dest_node.children.insert(index, node_id.to_owned());
        self.rebuild_indexes();
        self.mark_modified();
        Ok(())
    }

    /// Removes a node with its whole subtree; returns the node and the
    /// components that went with it.
    pub fn remove_child(&mut self, node_id: &str) -> Result<(Node, Vec<Component>)> {
        self.ensure_mutable()?;
        let removed = self.remove_child_internal(node_id)?;
        self.mark_modified();
        Ok(removed)
    }

    fn remove_child_internal(&mut self, node_id: &str) -> Result<(Node, Vec<Component>)> {
        let Some(node) = self.nodes.get(node_id) else {
            return Err(anyhow!(SyncError::UnknownId(node_id.to_owned())));
        };
        if node.is_root {
            return Err(anyhow!(SyncError::InvalidManifest {
                details: "the root node cannot be removed".to_owned(),
            }));
        }
        let parent = self.node_parent[node_id].clone();
        self.nodes
            .get_mut(&parent)
            .unwrap()
            .children
            .retain(|c| c != node_id);

        let subtree = self.subtree_ids(node_id);
        let mut removed_components = Vec::new();
        for component_id in &subtree.components {
            if let Some(component) = self.components.remove(component_id) {
                removed_components.push(component);
            }
            self.asset_ids.remove(component_id);
        }
        let mut removed_node = None;
        for id in &subtree.nodes {
            let node = self.nodes.remove(id);
            if id == node_id {
                removed_node = node;
            }
        }
        self.rebuild_indexes();
        self.touch();
        Ok((removed_node.unwrap(), removed_components))
    }

    /// Removes all children of the root; returns the removed components.
    pub fn remove_all_children(&mut self) -> Result<Vec<Component>> {
        let root_id = self.root_id.clone();
        self.remove_all_children_from(&root_id)
    }

    /// Removes all children of the given node; returns the removed
    /// components.
    pub fn remove_all_children_from(&mut self, node_id: &str) -> Result<Vec<Component>> {
        self.ensure_mutable()?;
        let node = self.node_or_unknown(node_id)?;
        let children = node.children.clone();
        let mut removed = Vec::new();
        for child in children {
            let (_, mut components) = self.remove_child_internal(&child)?;
            removed.append(&mut components);
        }
        if !removed.is_empty() {
            self.mark_modified();
        }
        Ok(removed)
    }

    /// Copies the subtree rooted at `node_id` in `source` into this
    /// manifest. Component ids are kept for same-composite copies unless a
    /// new path or `force_new_ids` requires re-keying. The outcome lists
    /// the components this added and removed so storage and transfer work
    /// can follow.
    pub fn insert_child_from(
        &mut self,
        node_id: &str,
        source: &Manifest,
        parent: Option<&str>,
        index: usize,
        options: CopyOptions,
    ) -> Result<CopyOutcome> {
        self.ensure_mutable()?;
        let Some(source_node) = source.nodes.get(node_id) else {
            return Err(anyhow!(SyncError::UnknownId(node_id.to_owned())));
        };
        if source_node.is_root {
            return Err(anyhow!(SyncError::InvalidManifest {
                details: "cannot copy a root node between manifests".to_owned(),
            }));
        }
        if let Some(segment) = &options.new_path {
            validate_segment(segment)?;
        }

        let same_composite = source.composite_id == self.composite_id;
        let rekey = options.force_new_ids || options.new_path.is_some() || !same_composite;

        // Clone the subtree out of the source, re-keying as required.
        let mut new_nodes: Vec<Node> = Vec::new();
        let mut new_components: Vec<(Component, Option<String>)> = Vec::new();
        let copied_root_id = clone_subtree(
            source,
            source_node,
            rekey,
            &mut new_nodes,
            &mut new_components,
        );
        if let Some(segment) = &options.new_path {
            let root = new_nodes
                .iter_mut()
                .find(|n| n.id == copied_root_id)
                .unwrap();
            root.path = Some(segment.clone());
        }

        // When replacing, the displaced subtree is the one that carries
        // the incoming node's original id.
        let replaced = if options.replace_existing && self.nodes.contains_key(node_id) {
            Some(node_id.to_owned())
        } else {
            None
        };
        let (replaced_nodes, replaced_components, dest_parent, dest_index) = match &replaced {
            Some(id) => {
                let subtree = self.subtree_ids(id);
                let (parent, index) = {
                    let parent_id = self.node_parent[id].clone();
                    let index = self.nodes[&parent_id]
                        .children
                        .iter()
                        .position(|c| c == id)
                        .unwrap();
                    (parent_id, index)
                };
                (subtree.nodes, subtree.components, parent, index)
            }
            None => (
                HashSet::new(),
                HashSet::new(),
                self.resolve_parent(parent)?,
                index,
            ),
        };

        // Validate ids and paths against everything that will survive.
        for node in &new_nodes {
            let id_taken = (self.nodes.contains_key(&node.id) && !replaced_nodes.contains(&node.id))
                || (self.components.contains_key(&node.id)
                    && !replaced_components.contains(&node.id));
            if id_taken {
                return Err(anyhow!(SyncError::DuplicateId(node.id.clone())));
            }
        }
        for (component, _) in &new_components {
            let id_taken = (self.components.contains_key(&component.id)
                && !replaced_components.contains(&component.id))
                || (self.nodes.contains_key(&component.id)
                    && !replaced_nodes.contains(&component.id));
            if id_taken {
                return Err(anyhow!(SyncError::DuplicateId(component.id.clone())));
            }
        }
        {
            let prefix = &self.node_prefix[&dest_parent];
            let copied_root = new_nodes.iter().find(|n| n.id == copied_root_id).unwrap();
            let mut candidate_paths = Vec::new();
            collect_candidate_paths(
                &new_nodes,
                &new_components,
                copied_root,
                prefix,
                &mut candidate_paths,
            );
            let mut seen = HashSet::new();
            for abs in &candidate_paths {
                if !seen.insert(abs.clone()) {
                    return Err(anyhow!(SyncError::DuplicatePath(abs.clone())));
                }
                match self.paths.get(abs) {
                    Some(PathOwner::Node(other)) if replaced_nodes.contains(other) => {}
                    Some(PathOwner::Component(other)) if replaced_components.contains(other) => {}
                    Some(_) => return Err(anyhow!(SyncError::DuplicatePath(abs.clone()))),
                    None => {}
                }
            }
        }

        // Apply: drop the replaced subtree, then graft the copy.
        let mut removed_components = Vec::new();
        if let Some(id) = &replaced {
            let (_, components) = self.remove_child_internal(id)?;
            removed_components = components;
        }
        let dest_index = dest_index.min(self.nodes[&dest_parent].children.len());
        let mut added_components = Vec::new();
        for (component, source_asset_id) in new_components {
            if same_composite {
                if let Some(asset_id) = source_asset_id {
                    self.asset_ids.insert(component.id.clone(), asset_id);
                }
            }
            added_components.push(component.clone());
            self.components.insert(component.id.clone(), component);
        }
        for node in new_nodes {
            self.nodes.insert(node.id.clone(), node);
        }
        self.nodes
            .get_mut(&dest_parent)
            .unwrap()
            .children
            .insert(dest_index, copied_root_id.clone());
        self.rebuild_indexes();
        self.mark_modified();
        Ok(CopyOutcome {
            node_id: copied_root_id,
            added_components,
            removed_components,
        })
    }

    // ------------------------------------------------------------------
    // Binding and identity
    // ------------------------------------------------------------------

    /// Strips all service-related data so the composite can be pushed
    /// again to the same or a different service. Components whose deletion
    /// was already committed are dropped; everything else goes `Modified`.
    pub fn reset_binding(&mut self) {
        self.links.clear();
        self.etag = None;
        self.manifest_etag = None;
        self.composite_href = None;
        self.collaboration = None;

        let committed: Vec<_> = self
            .components
            .iter()
            .filter(|(_, c)| c.state == AssetState::CommittedDelete)
            .map(|(id, _)| id.clone())
            .collect();
        for id in committed {
            let _ = self.remove_component_internal(&id);
        }
        for component in self.components.values_mut() {
            component.clear_binding();
            component.state = AssetState::Modified;
        }
        self.state = AssetState::Modified;
        self.rebuild_indexes();
        self.touch();
    }

    /// `reset_binding` plus freshly minted composite, node and component
    /// ids throughout.
    pub fn reset_identity(&mut self) {
        self.reset_binding();

        let mut node_ids: HashMap<String, String> = HashMap::new();
        for id in self.nodes.keys() {
            node_ids.insert(id.clone(), mint_id());
        }
        let mut component_ids: HashMap<String, String> = HashMap::new();
        for id in self.components.keys() {
            component_ids.insert(id.clone(), mint_id());
        }

        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for (id, mut node) in self.nodes.drain() {
            node.id = node_ids[&id].clone();
            node.children = node.children.iter().map(|c| node_ids[c].clone()).collect();
            node.components = node
                .components
                .iter()
                .map(|c| component_ids[c].clone())
                .collect();
            nodes.insert(node.id.clone(), node);
        }
        self.nodes = nodes;

        let mut components = HashMap::with_capacity(self.components.len());
        for (id, mut component) in self.components.drain() {
            component.id = component_ids[&id].clone();
            components.insert(component.id.clone(), component);
        }
        self.components = components;

        let old_asset_ids = std::mem::take(&mut self.asset_ids);
        self.asset_ids = old_asset_ids
            .into_iter()
            .filter_map(|(component_id, asset_id)| {
                component_ids
                    .get(&component_id)
                    .map(|new_id| (new_id.clone(), asset_id))
            })
            .collect();

        self.root_id = node_ids[&self.root_id].clone();
        self.composite_id = self.root_id.clone();
        self.rebuild_indexes();
        self.touch();
    }

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------

    /// Enumerates the tree and reports invariant violations as findings
    /// instead of failing, so callers (and tests) can assert on them.
    pub fn verify_integrity(&self, branch_name: &str) -> Vec<String> {
        let mut findings = Vec::new();
        let mut seen_nodes = HashSet::new();
        let mut seen_components = HashSet::new();
        let mut seen_paths: HashMap<String, String> = HashMap::new();

        fn walk(
            manifest: &Manifest,
            branch: &str,
            node_id: &str,
            prefix: &str,
            findings: &mut Vec<String>,
            seen_nodes: &mut HashSet<String>,
            seen_components: &mut HashSet<String>,
            seen_paths: &mut HashMap<String, String>,
        ) {
            let Some(node) = manifest.nodes.get(node_id) else {
                findings.push(format!("{branch}: dangling child reference '{node_id}'"));
                return;
            };
            if !seen_nodes.insert(node_id.to_owned()) {
                findings.push(format!("{branch}: node '{node_id}' appears more than once"));
                return;
            }
            let prefix = match &node.path {
                Some(segment) => {
                    if !path::is_valid_segment(segment) {
                        findings.push(format!(
                            "{branch}: node '{node_id}' has invalid path segment '{segment}'"
                        ));
                    }
                    let abs = path::join(prefix, segment);
                    if let Some(other) = seen_paths.insert(abs.clone(), node_id.to_owned()) {
                        findings.push(format!(
                            "{branch}: absolute path '{abs}' is shared by '{other}' and '{node_id}'"
                        ));
                    }
                    abs
                }
                None => prefix.to_owned(),
            };
            for component_id in &node.components {
                let Some(component) = manifest.components.get(component_id) else {
                    findings.push(format!(
                        "{branch}: dangling component reference '{component_id}'"
                    ));
                    continue;
                };
                if !seen_components.insert(component_id.clone()) {
                    findings.push(format!(
                        "{branch}: component '{component_id}' appears more than once"
                    ));
                    continue;
                }
                if !path::is_valid_segment(&component.path) {
                    findings.push(format!(
                        "{branch}: component '{component_id}' has invalid path segment '{}'",
                        component.path
                    ));
                }
                let abs = path::join(&prefix, &component.path);
                if let Some(other) = seen_paths.insert(abs.clone(), component_id.clone()) {
                    findings.push(format!(
                        "{branch}: absolute path '{abs}' is shared by '{other}' and '{component_id}'"
                    ));
                }
                match manifest.component_parent.get(component_id) {
                    Some(parent) if parent == node_id => {}
                    _ => findings.push(format!(
                        "{branch}: component '{component_id}' has an inconsistent parent entry"
                    )),
                }
            }
            for child in &node.children {
                match manifest.node_parent.get(child) {
                    Some(parent) if parent == node_id => {}
                    _ => findings.push(format!(
                        "{branch}: node '{child}' has an inconsistent parent entry"
                    )),
                }
                walk(
                    manifest,
                    branch,
                    child,
                    &prefix,
                    findings,
                    seen_nodes,
                    seen_components,
                    seen_paths,
                );
            }
        }

        walk(
            self,
            branch_name,
            &self.root_id.clone(),
            "",
            &mut findings,
            &mut seen_nodes,
            &mut seen_components,
            &mut seen_paths,
        );

        for id in self.nodes.keys() {
            if !seen_nodes.contains(id) {
                findings.push(format!("{branch_name}: node '{id}' is unreachable from the root"));
            }
        }
        for id in self.components.keys() {
            if !seen_components.contains(id) {
                findings.push(format!(
                    "{branch_name}: component '{id}' is unreachable from the root"
                ));
            }
        }
        for component_id in self.asset_ids.keys() {
            if !self.components.contains_key(component_id) {
                findings.push(format!(
                    "{branch_name}: asset id map entry for unknown component '{component_id}'"
                ));
            }
        }
        findings
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_mutable(&self) -> Result<()> {
        match self.state {
            AssetState::PendingDelete | AssetState::CommittedDelete => {
                Err(anyhow!(SyncError::DeletedComposite))
            }
            _ => Ok(()),
        }
    }

    fn resolve_parent(&self, parent: Option<&str>) -> Result<String> {
        match parent {
            Some(id) => {
                self.node_or_unknown(id)?;
                Ok(id.to_owned())
            }
            None => Ok(self.root_id.clone()),
        }
    }

    fn node_or_unknown(&self, node_id: &str) -> Result<&Node> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| anyhow!(SyncError::UnknownId(node_id.to_owned())))
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.modified = Some(now_rfc3339());
    }

    /// Like `touch`, but also promotes an unmodified composite to
    /// `Modified`: any DOM edit makes the composite worth pushing again.
    fn mark_modified(&mut self) {
        if self.state == AssetState::Unmodified {
            self.state = AssetState::Modified;
        }
        self.touch();
    }

    /// Rebuilds parent maps, path index and per-node prefixes. Mutations
    /// validate invariants up front, so this never fails for them; parsing
    /// uses the checked variant below.
    fn rebuild_indexes(&mut self) {
        let result = self.rebuild_indexes_checked();
        debug_assert!(result.is_ok(), "index rebuild failed: {result:?}");
    }

    fn rebuild_indexes_checked(&mut self) -> Result<()> {
        self.node_parent.clear();
        self.component_parent.clear();
        self.paths.clear();
        self.node_prefix.clear();

        fn walk(
            nodes: &HashMap<String, Node>,
            components: &HashMap<String, Component>,
            node_id: &str,
            prefix: &str,
            node_parent: &mut HashMap<String, String>,
            component_parent: &mut HashMap<String, String>,
            paths: &mut HashMap<String, PathOwner>,
            node_prefix: &mut HashMap<String, String>,
        ) -> Result<()> {
            let node = nodes
                .get(node_id)
                .ok_or_else(|| anyhow!(SyncError::UnknownId(node_id.to_owned())))?;
            let prefix = match &node.path {
                Some(segment) => {
                    let abs = path::join(prefix, segment);
                    if paths
                        .insert(abs.clone(), PathOwner::Node(node_id.to_owned()))
                        .is_some()
                    {
                        return Err(anyhow!(SyncError::DuplicatePath(abs)));
                    }
                    abs
                }
                None => prefix.to_owned(),
            };
            node_prefix.insert(node_id.to_owned(), prefix.clone());
            for component_id in &node.components {
                let component = components
                    .get(component_id)
                    .ok_or_else(|| anyhow!(SyncError::UnknownId(component_id.clone())))?;
                if component_parent
                    .insert(component_id.clone(), node_id.to_owned())
                    .is_some()
                {
                    return Err(anyhow!(SyncError::DuplicateId(component_id.clone())));
                }
                let abs = path::join(&prefix, &component.path);
                if paths
                    .insert(abs.clone(), PathOwner::Component(component_id.clone()))
                    .is_some()
                {
                    return Err(anyhow!(SyncError::DuplicatePath(abs)));
                }
            }
            for child in &node.children {
                if node_parent
                    .insert(child.clone(), node_id.to_owned())
                    .is_some()
                {
                    return Err(anyhow!(SyncError::DuplicateId(child.clone())));
                }
                walk(
                    nodes,
                    components,
                    child,
                    &prefix,
                    node_parent,
                    component_parent,
                    paths,
                    node_prefix,
                )?;
            }
            Ok(())
        }

        walk(
            &self.nodes,
            &self.components,
            &self.root_id.clone(),
            "",
            &mut self.node_parent,
            &mut self.component_parent,
            &mut self.paths,
            &mut self.node_prefix,
        )
    }

    fn subtree_ids(&self, node_id: &str) -> SubtreeIds {
        let mut ids = SubtreeIds::default();
        fn walk(manifest: &Manifest, node_id: &str, ids: &mut SubtreeIds) {
            ids.nodes.insert(node_id.to_owned());
            let node = &manifest.nodes[node_id];
            for component in &node.components {
                ids.components.insert(component.clone());
            }
            for child in &node.children {
                walk(manifest, child, ids);
            }
        }
        walk(self, node_id, &mut ids);
        ids
    }

    /// Absolute paths the subtree would occupy if its root node carried
    /// `root_segment` under `prefix` (the destination parent's prefix).
    fn subtree_paths(
        &self,
        node_id: &str,
        prefix: &str,
        root_segment: Option<&str>,
    ) -> Vec<String> {
        fn walk(
            manifest: &Manifest,
            node_id: &str,
            prefix: &str,
            segment: Option<&str>,
            into: &mut Vec<String>,
        ) {
            let node = &manifest.nodes[node_id];
            let prefix = match segment {
                Some(segment) => {
                    let abs = path::join(prefix, segment);
                    into.push(abs.clone());
                    abs
                }
                None => prefix.to_owned(),
            };
            for component_id in &node.components {
                into.push(path::join(&prefix, &manifest.components[component_id].path));
            }
            for child in &node.children {
                let child_segment = manifest.nodes[child].path.clone();
                walk(manifest, child, &prefix, child_segment.as_deref(), into);
            }
        }
        let mut result = Vec::new();
        walk(self, node_id, prefix, root_segment, &mut result);
        result
    }

    /// The server href of the manifest resource, from the `self` link.
    pub fn self_href(&self) -> Option<&str> {
        self_link_href(&self.links)
    }
}

#[derive(Default)]
struct SubtreeIds {
    nodes: HashSet<String>,
    components: HashSet<String>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_children(
    nodes: &mut HashMap<String, Node>,
    components: &mut HashMap<String, Component>,
    parent_id: &str,
    children: Vec<Value>,
    path: &str,
) -> Result<()> {
    for (i, value) in children.into_iter().enumerate() {
        let item_path = format!("{path}[{i}].");
        let Value::Object(mut table) = value else {
            return Err(anyhow!(SyncError::InvalidManifest {
                details: format!("'{item_path}' is not an object"),
            }));
        };
        let mut node = Node::from_json(&mut table, &item_path)?;
        let grandchildren = json::get_array(&mut table, "children", &item_path)?;
        let node_components = json::get_array(&mut table, "components", &item_path)?;
        node.extra = table;
        let id = node.id.clone();
        if nodes.insert(id.clone(), node).is_some() {
            return Err(anyhow!(SyncError::InvalidManifest {
                details: format!("duplicate node id '{id}'"),
            }));
        }
        nodes.get_mut(parent_id).unwrap().children.push(id.clone());
        parse_children(nodes, components, &id, grandchildren, &format!("{item_path}children"))?;
        parse_components(
            nodes,
            components,
            &id,
            node_components,
            &format!("{item_path}components"),
        )?;
    }
    Ok(())
}

fn parse_components(
    nodes: &mut HashMap<String, Node>,
    components: &mut HashMap<String, Component>,
    parent_id: &str,
    items: Vec<Value>,
    path: &str,
) -> Result<()> {
    for (i, value) in items.into_iter().enumerate() {
        let item_path = format!("{path}[{i}].");
        let Value::Object(table) = value else {
            return Err(anyhow!(SyncError::InvalidManifest {
                details: format!("'{item_path}' is not an object"),
            }));
        };
        let component = Component::from_json(table, &item_path)?;
        let id = component.id.clone();
        if components.insert(id.clone(), component).is_some() {
            return Err(anyhow!(SyncError::InvalidManifest {
                details: format!("duplicate component id '{id}'"),
            }));
        }
        nodes.get_mut(parent_id).unwrap().components.push(id);
    }
    Ok(())
}

fn clone_subtree(
    source: &Manifest,
    node: &Node,
    rekey: bool,
    nodes: &mut Vec<Node>,
    components: &mut Vec<(Component, Option<String>)>,
) -> String {
    let mut copy = node.clone();
    copy.is_root = false;
    if rekey {
        copy.id = mint_id();
    }
    copy.children.clear();
    copy.components.clear();
    for component_id in &node.components {
        let mut component = source.components[component_id].clone();
        let asset_id = source.asset_id_for(component_id).map(str::to_owned);
        if rekey {
            component.id = mint_id();
        }
        copy.components.push(component.id.clone());
        components.push((component, asset_id));
    }
    let id = copy.id.clone();
    let slot = nodes.len();
    nodes.push(copy);
    for child_id in &node.children {
        let child = clone_subtree(source, &source.nodes[child_id], rekey, nodes, components);
        nodes[slot].children.push(child);
    }
    id
}

fn collect_candidate_paths(
    nodes: &[Node],
    components: &[(Component, Option<String>)],
    node: &Node,
    prefix: &str,
    into: &mut Vec<String>,
) {
    let prefix = match &node.path {
        Some(segment) => {
            let abs = path::join(prefix, segment);
            into.push(abs.clone());
            abs
        }
        None => prefix.to_owned(),
    };
    for component_id in &node.components {
        let (component, _) = components
            .iter()
            .find(|(c, _)| &c.id == component_id)
            .unwrap();
        into.push(path::join(&prefix, &component.path));
    }
    for child_id in &node.children {
        let child = nodes.iter().find(|n| &n.id == child_id).unwrap();
        collect_candidate_paths(nodes, components, child, &prefix, into);
    }
}
