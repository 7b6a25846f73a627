//! Read-only and read-write views over one branch of a composite.
//!
//! A [`Branch`] is an owned copy-on-read snapshot: readers get a consistent
//! picture that concurrent writers cannot disturb. A [`MutableBranch`]
//! holds the composite's branch lock for its lifetime, so all DOM writes on
//! a composite serialize through it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::errors::SyncError;
use crate::model::composite::BranchState;
use crate::model::manifest::{CopyOptions, CopyOutcome, Manifest};
use crate::model::node::{Component, Node};
use crate::model::{mint_id, AssetState};
use crate::storage;
use crate::utils::json::Table;

/// An immutable snapshot of one branch.
#[derive(Clone, Debug)]
pub struct Branch {
    manifest: Manifest,
    composite_path: PathBuf,
}

impl Branch {
    pub(crate) fn new(manifest: Manifest, composite_path: PathBuf) -> Self {
        Self {
            manifest,
            composite_path,
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Consumes the snapshot, returning its manifest. The starting
    /// point for building a merged branch to hand to
    /// [`crate::Composite::resolve_pull`].
    pub fn into_manifest(self) -> Manifest {
        self.manifest
    }

    pub fn name(&self) -> &str {
        self.manifest.name()
    }

    pub fn media_type(&self) -> &str {
        self.manifest.media_type()
    }

    pub fn composite_state(&self) -> AssetState {
        self.manifest.composite_state()
    }

    pub fn etag(&self) -> Option<&str> {
        self.manifest.etag()
    }

    pub fn links(&self) -> &Table {
        self.manifest.links()
    }

    pub fn root_node(&self) -> &Node {
        self.manifest.root_node()
    }

    pub fn value_for_key(&self, key: &str) -> Option<&Value> {
        self.manifest.value_for_key(key)
    }

    pub fn component_with_id(&self, id: &str) -> Option<&Component> {
        self.manifest.component_with_id(id)
    }

    pub fn component_with_absolute_path(&self, abs_path: &str) -> Option<&Component> {
        self.manifest.component_with_absolute_path(abs_path)
    }

    pub fn components_of(&self, node_id: &str) -> Result<Vec<&Component>> {
        self.manifest.components_of(node_id)
    }

    pub fn all_components(&self) -> Vec<&Component> {
        self.manifest.all_components().collect()
    }

    pub fn find_parent_of_component(&self, id: &str) -> Option<&Node> {
        self.manifest.find_parent_of_component(id)
    }

    pub fn node_with_id(&self, id: &str) -> Option<&Node> {
        self.manifest.node_with_id(id)
    }

    pub fn child_with_absolute_path(&self, abs_path: &str) -> Option<&Node> {
        self.manifest.child_with_absolute_path(abs_path)
    }

    pub fn children_of(&self, node_id: &str) -> Result<Vec<&Node>> {
        self.manifest.children_of(node_id)
    }

    /// The local file path of the component's asset, whether or not the
    /// file currently exists.
    pub fn path_of_component(&self, id: &str) -> Result<PathBuf> {
        let component = self
            .manifest
            .component_with_id(id)
            .ok_or_else(|| anyhow!(SyncError::UnknownId(id.to_owned())))?;
        storage::asset_path(&self.composite_path, &self.manifest, component)
    }

    /// componentId to asset path for the components whose asset file
    /// exists locally.
    pub fn existing_local_component_paths(&self) -> std::collections::HashMap<String, PathBuf> {
        storage::existing_local_paths(&self.composite_path, &self.manifest)
    }
}

/// A mutable view of the current branch. Holds the composite's branch
/// lock; drop it to let other writers and snapshot readers in.
pub struct MutableBranch<'a> {
    pub(crate) guard: MutexGuard<'a, BranchState>,
    pub(crate) composite_path: PathBuf,
    pub(crate) inflight: &'a Mutex<HashSet<PathBuf>>,
    pub(crate) auto_remove_unused: bool,
}

impl MutableBranch<'_> {
    pub fn manifest(&self) -> &Manifest {
        self.guard.current.as_ref().expect("current branch present")
    }

    fn manifest_mut(&mut self) -> &mut Manifest {
        self.guard.current.as_mut().expect("current branch present")
    }

    /// Runs reclamation when a dropped reference calls for it and the
    /// composite opts in. The committed manifest on disk counts as live
    /// even when the in-memory current branch has moved past it.
    fn reclaim_after_drop(&mut self) {
        if !self.auto_remove_unused {
            return;
        }
        let inflight = self.inflight.lock().unwrap().clone();
        let committed = {
            let path = storage::current_manifest_path(&self.composite_path);
            if crate::utils::is_file(&path) {
                Manifest::from_file(&path).ok()
            } else {
                None
            }
        };
        let manifests: Vec<&Manifest> = [
            self.guard.current.as_ref(),
            self.guard.pulled.as_ref(),
            self.guard.pushed.as_ref(),
            self.guard.base.as_ref(),
            committed.as_ref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        if let Err(e) = storage::remove_unused_files(&self.composite_path, &manifests, &inflight) {
            tracing::warn!("auto reclamation failed: {e:#}");
        }
    }

    // -- reads (same surface as Branch) ---------------------------------

    pub fn composite_state(&self) -> AssetState {
        self.manifest().composite_state()
    }

    pub fn component_with_id(&self, id: &str) -> Option<&Component> {
        self.manifest().component_with_id(id)
    }

    pub fn component_with_absolute_path(&self, abs_path: &str) -> Option<&Component> {
        self.manifest().component_with_absolute_path(abs_path)
    }

    pub fn all_components(&self) -> Vec<&Component> {
        self.manifest().all_components().collect()
    }

    pub fn components_of(&self, node_id: &str) -> Result<Vec<&Component>> {
        self.manifest().components_of(node_id)
    }

    pub fn node_with_id(&self, id: &str) -> Option<&Node> {
        self.manifest().node_with_id(id)
    }

    pub fn path_of_component(&self, id: &str) -> Result<PathBuf> {
        let manifest = self.manifest();
        let component = manifest
            .component_with_id(id)
            .ok_or_else(|| anyhow!(SyncError::UnknownId(id.to_owned())))?;
        storage::asset_path(&self.composite_path, manifest, component)
    }

    // -- attribute bag --------------------------------------------------

    pub fn value_for_key(&self, key: &str) -> Option<&Value> {
        self.manifest().value_for_key(key)
    }

    pub fn set_value(&mut self, key: &str, value: Value) -> Result<()> {
        self.manifest_mut().set_value(key, value)
    }

    pub fn remove_value(&mut self, key: &str) -> Result<()> {
        self.manifest_mut().remove_value(key)
    }

    // -- DOM mutations --------------------------------------------------

    /// Marks the composite for deletion on the next push.
    pub fn mark_composite_for_deletion(&mut self) -> Result<()> {
        self.manifest_mut().mark_composite_for_deletion()
    }

    pub fn set_composite_state(&mut self, state: AssetState) -> Result<()> {
        self.manifest_mut().set_composite_state(state)
    }

    pub fn add_child(&mut self, node: Node, parent: Option<&str>) -> Result<()> {
        self.manifest_mut().add_child(node, parent)
    }

    pub fn insert_child(&mut self, node: Node, parent: Option<&str>, index: usize) -> Result<()> {
        self.manifest_mut().insert_child(node, parent, index)
    }

    pub fn update_child(&mut self, node: Node) -> Result<()> {
        self.manifest_mut().update_child(node)
    }

    pub fn move_child(&mut self, node_id: &str, parent: Option<&str>, index: usize) -> Result<()> {
        self.manifest_mut().move_child(node_id, parent, index)
    }

    pub fn remove_child(&mut self, node_id: &str) -> Result<(Node, Vec<Component>)> {
        let removed = self.manifest_mut().remove_child(node_id)?;
        if !removed.1.is_empty() {
            self.reclaim_after_drop();
        }
        Ok(removed)
    }

    /// Copies a node subtree in from another branch of the same composite.
    pub fn insert_child_from(
        &mut self,
        node_id: &str,
        from: &Branch,
        parent: Option<&str>,
        index: usize,
        options: CopyOptions,
    ) -> Result<CopyOutcome> {
        let outcome =
            self.manifest_mut()
                .insert_child_from(node_id, from.manifest(), parent, index, options)?;
        if !outcome.removed_components.is_empty() {
            self.reclaim_after_drop();
        }
        Ok(outcome)
    }

    pub fn update_component(&mut self, component: Component) -> Result<()> {
        self.manifest_mut().update_component(component)
    }

    pub fn move_component_to(&mut self, component_id: &str, node_id: Option<&str>) -> Result<()> {
        self.manifest_mut().move_component_to(component_id, node_id)
    }

    pub fn set_component_modified(&mut self, component_id: &str, modified: bool) -> Result<()> {
        self.manifest_mut().set_component_modified(component_id, modified)
    }

    pub fn remove_component(&mut self, component_id: &str) -> Result<Component> {
        let removed = self.manifest_mut().remove_component(component_id)?;
        self.reclaim_after_drop();
        Ok(removed)
    }

    pub fn remove_all_components(&mut self) -> Result<Vec<Component>> {
        let removed = self.manifest_mut().remove_all_components()?;
        if !removed.is_empty() {
            self.reclaim_after_drop();
        }
        Ok(removed)
    }

    // -- storage-aware component ops ------------------------------------

    /// Adds `source_file` as a new component by copying (or moving) it
    /// into copy-on-write storage under a fresh asset id.
    #[allow(clippy::too_many_arguments)]
    pub fn add_component_from_file(
        &mut self,
        name: &str,
        component_id: Option<String>,
        media_type: &str,
        relationship: Option<&str>,
        path_segment: &str,
        parent: Option<&str>,
        source_file: &Path,
        copy: bool,
    ) -> Result<Component> {
        let mut component = Component::new(
            component_id.unwrap_or_else(mint_id),
            path_segment.to_owned(),
            Some(name.to_owned()),
            Some(media_type.to_owned()),
        );
        component.relationship = relationship.map(str::to_owned);
        component.length = Some(crate::utils::file_size(source_file)?);
        let id = component.id.clone();
        self.manifest_mut().add_component(component, parent)?;
        let composite_path = self.composite_path.clone();
        let component = self.manifest().component_with_id(&id).unwrap().clone();
        let inflight = self.inflight;
        let import = storage::import_component_file(
            &composite_path,
            self.manifest_mut(),
            &component,
            source_file,
            copy,
            inflight,
        );
        if let Err(e) = import {
            // Roll the DOM back so a failed import leaves no trace.
            let _ = self.manifest_mut().remove_component(&id);
            return Err(e);
        }
        Ok(self.manifest().component_with_id(&id).unwrap().clone())
    }

    /// Stores `source_file` as the new version of the component's asset.
    /// The component goes `Modified`; the previous asset file stays behind
    /// for readers of other branches until reclamation.
    pub fn update_component_from_file(
        &mut self,
        component_id: &str,
        source_file: &Path,
        copy: bool,
    ) -> Result<Component> {
        let composite_path = self.composite_path.clone();
        let original = self
            .manifest()
            .component_with_id(component_id)
            .ok_or_else(|| anyhow!(SyncError::UnknownId(component_id.to_owned())))?
            .clone();
        let mut component = original.clone();
        component.length = Some(crate::utils::file_size(source_file)?);
        component.state = AssetState::Modified;
        self.manifest_mut().update_component(component.clone())?;
        let inflight = self.inflight;
        let import = storage::import_component_file(
            &composite_path,
            self.manifest_mut(),
            &component,
            source_file,
            copy,
            inflight,
        );
        if let Err(e) = import {
            let _ = self.manifest_mut().update_component(original);
            return Err(e);
        }
        self.reclaim_after_drop();
        Ok(self.manifest().component_with_id(component_id).unwrap().clone())
    }

    /// Copies a component from another branch of the same composite. The
    /// asset file is shared copy-on-write; only the manifest entry and the
    /// asset id mapping are copied.
    pub fn copy_component_from(
        &mut self,
        component_id: &str,
        from: &Branch,
        parent: Option<&str>,
        new_path: Option<&str>,
    ) -> Result<Component> {
        let component = from
            .component_with_id(component_id)
            .ok_or_else(|| anyhow!(SyncError::UnknownId(component_id.to_owned())))?;
        self.manifest_mut()
            .add_component_from(component, from.manifest(), parent, new_path)
    }
}
