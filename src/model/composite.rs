//! The composite container: owns the four branch slots (current, pulled,
//! pushed, base), the copy-on-write storage under its local directory, and
//! the accept/resolve lifecycle that promotes transferred branches.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use url::Url;

use crate::errors::SyncError;
use crate::model::branch::{Branch, MutableBranch};
use crate::model::manifest::Manifest;
use crate::model::AssetState;
use crate::storage;
use crate::transfer::journal::PushJournal;
use crate::utils;

pub(crate) struct BranchState {
    pub(crate) current: Option<Manifest>,
    pub(crate) pulled: Option<Manifest>,
    pub(crate) pushed: Option<Manifest>,
    pub(crate) base: Option<Manifest>,
    pub(crate) href: Option<Url>,
    pub(crate) composite_id: String,
    pub(crate) committed_state: Option<AssetState>,
    pub(crate) committed_at: Option<DateTime<Utc>>,
}

pub struct Composite {
    path: PathBuf,
    state: Mutex<BranchState>,
    inflight_local_component_files: Mutex<HashSet<PathBuf>>,
    push_lock: tokio::sync::Mutex<()>,
    pull_lock: tokio::sync::Mutex<()>,
    auto_remove_unused_local_files: AtomicBool,
}

impl Composite {
    /// Opens a composite that already exists locally by reading and
    /// parsing its committed manifest. Pulled, pushed and base branches
    /// are attached when their files are present on disk.
    pub fn open(path: &Path) -> Result<Self> {
        let manifest_path = storage::current_manifest_path(path);
        let current = Manifest::from_file(&manifest_path)?;
        let committed_state = Some(current.composite_state());
        let href = match current.composite_href() {
            Some(href) => Some(utils::parse_url(href)?),
            None => None,
        };
        let composite_id = current.composite_id().to_owned();

        let side_branch = |file: PathBuf, name: &str| -> Option<Manifest> {
            if !utils::is_file(&file) {
                return None;
            }
            match Manifest::from_file(&file) {
                Ok(manifest) => Some(manifest),
                Err(e) => {
                    warn!("ignoring unreadable {name} manifest '{}': {e:#}", file.display());
                    None
                }
            }
        };
        let pulled = side_branch(storage::pull_manifest_path(path), "pulled");
        let pushed = side_branch(storage::push_manifest_path(path), "pushed");
        let base = side_branch(storage::base_manifest_path(path), "base");

        Ok(Self::assemble(
            path,
            BranchState {
                current: Some(current),
                pulled,
                pushed,
                base,
                href,
                composite_id,
                committed_state,
                committed_at: None,
            },
        ))
    }

    /// A composite that exists on the server but not yet locally. It has
    /// no branches until the first pull.
    pub fn from_href(href: Url, composite_id: Option<String>, path: &Path) -> Self {
        Self::assemble(
            path,
            BranchState {
                current: None,
                pulled: None,
                pushed: None,
                base: None,
                href: Some(href),
                composite_id: composite_id.unwrap_or_else(crate::model::mint_id),
                committed_state: None,
                committed_at: None,
            },
        )
    }

    /// A new empty composite. Nothing is written to local storage until
    /// `commit_changes` is called.
    pub fn new(
        name: &str,
        media_type: &str,
        path: &Path,
        composite_id: Option<String>,
        href: Option<Url>,
    ) -> Self {
        let mut current = Manifest::with_id(name, media_type, composite_id);
        if let Some(href) = &href {
            current.set_composite_href(Some(href.to_string()));
        }
        let composite_id = current.composite_id().to_owned();
        Self::assemble(
            path,
            BranchState {
                current: Some(current),
                pulled: None,
                pushed: None,
                base: None,
                href,
                composite_id,
                committed_state: None,
                committed_at: None,
            },
        )
    }

    fn assemble(path: &Path, state: BranchState) -> Self {
        Self {
            path: path.to_owned(),
            state: Mutex::new(state),
            inflight_local_component_files: Mutex::new(HashSet::new()),
            push_lock: tokio::sync::Mutex::new(()),
            pull_lock: tokio::sync::Mutex::new(()),
            auto_remove_unused_local_files: AtomicBool::new(true),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn composite_id(&self) -> String {
        self.state.lock().unwrap().composite_id.clone()
    }

    pub fn href(&self) -> Option<Url> {
        self.state.lock().unwrap().href.clone()
    }

    /// Assigns the server location. Only an unbound composite can be
    /// re-pointed; reset the binding first otherwise.
    pub fn set_href(&self, href: Url) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let bound = state.href.is_some()
            || state.current.as_ref().is_some_and(Manifest::is_bound);
        if bound {
            bail!("composite is already bound; reset its binding before assigning a new href");
        }
        state.href = Some(href);
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.href.is_some() || state.current.as_ref().is_some_and(Manifest::is_bound)
    }

    /// The composite state saved in the committed manifest, as opposed to
    /// the in-memory state of the current branch.
    pub fn committed_composite_state(&self) -> Option<AssetState> {
        self.state.lock().unwrap().committed_state
    }

    pub fn current_branch_committed_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().committed_at
    }

    /// Controls opportunistic reclamation after mutations that drop a
    /// component reference. On by default; when off the client calls
    /// `remove_unused_local_files` itself.
    pub fn set_auto_remove_unused_local_files(&self, enabled: bool) {
        self.auto_remove_unused_local_files
            .store(enabled, Ordering::Relaxed);
    }

    pub fn auto_remove_unused_local_files(&self) -> bool {
        self.auto_remove_unused_local_files.load(Ordering::Relaxed)
    }

    /// Directory for client-owned files; ignored by reclamation.
    pub fn client_data_path(&self) -> PathBuf {
        storage::client_data_dir(&self.path)
    }

    // ------------------------------------------------------------------
    // Branch access
    // ------------------------------------------------------------------

    /// A copy-on-read snapshot of the current branch.
    pub fn current(&self) -> Option<Branch> {
        let state = self.state.lock().unwrap();
        state
            .current
            .clone()
            .map(|m| Branch::new(m, self.path.clone()))
    }

    /// The mutable current branch. Holds the composite's branch lock for
    /// the lifetime of the returned view.
    pub fn current_mut(&self) -> Option<MutableBranch<'_>> {
        let guard = self.state.lock().unwrap();
        if guard.current.is_none() {
            return None;
        }
        Some(MutableBranch {
            guard,
            composite_path: self.path.clone(),
            inflight: &self.inflight_local_component_files,
            auto_remove_unused: self.auto_remove_unused_local_files(),
        })
    }

    pub fn pulled(&self) -> Option<Branch> {
        let state = self.state.lock().unwrap();
        state
            .pulled
            .clone()
            .map(|m| Branch::new(m, self.path.clone()))
    }

    pub fn pushed(&self) -> Option<Branch> {
        let state = self.state.lock().unwrap();
        state
            .pushed
            .clone()
            .map(|m| Branch::new(m, self.path.clone()))
    }

    pub fn base(&self) -> Option<Branch> {
        let state = self.state.lock().unwrap();
        state
            .base
            .clone()
            .map(|m| Branch::new(m, self.path.clone()))
    }

    // ------------------------------------------------------------------
    // Commit / accept / resolve
    // ------------------------------------------------------------------

    /// Atomically writes the current branch's manifest to the committed
    /// path, regenerating its save id.
    pub fn commit_changes(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(current) = state.current.as_mut() else {
            bail!("composite has no current branch to commit");
        };
        utils::ensure_dir_exists("composite", &self.path)?;
        current.write_to_file(&storage::current_manifest_path(&self.path), true)?;
        state.committed_state = Some(state.current.as_ref().unwrap().composite_state());
        state.committed_at = Some(Utc::now());
        Ok(())
    }

    /// Accepts the result of a successful push: merges the server fields
    /// recorded in the pushed branch into current (in memory and on
    /// disk), promotes pushed to base, and deletes the push artifacts
    /// including the journal. No-op when there is no pushed branch.
    pub fn accept_push(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        let pushed = match state.pushed.take() {
            Some(pushed) => pushed,
            None => {
                let file = storage::push_manifest_path(&self.path);
                if !utils::is_file(&file) {
                    return Ok(());
                }
                Manifest::from_file(&file)?
            }
        };

        let journal_path = storage::push_journal_path(&self.path);
        let journal = PushJournal::from_file(&journal_path)
            .context("accepting a push requires its journal")?;
        if !journal.is_complete() {
            state.pushed = Some(pushed);
            return Err(anyhow!(SyncError::IncompleteJournal));
        }

        let Some(current) = state.current.as_mut() else {
            bail!("composite has no current branch to accept a push into");
        };

        // Merge server fields; local edits made after the push started
        // stay Modified.
        current.set_etag(pushed.etag().map(str::to_owned));
        if !journal.update_manifest_with_journal_etag(current) {
            current.set_manifest_etag(pushed.manifest_etag().map(str::to_owned));
        }
        current.set_links(pushed.links().clone());
        current.set_composite_href(pushed.composite_href().map(str::to_owned));
        for component in pushed.components_any_state() {
            let Some(mut existing) = current.component_with_id(&component.id).cloned() else {
                continue;
            };
            if component.state == AssetState::CommittedDelete {
                if matches!(
                    existing.state,
                    AssetState::PendingDelete | AssetState::CommittedDelete
                ) {
                    current.remove_component_internal(&existing.id)?;
                }
                continue;
            }
            existing.etag = component.etag.clone();
            existing.version = component.version.clone();
            existing.length = component.length;
            existing.links = component.links.clone();
            let unchanged_since_push =
                current.asset_id_for(&existing.id) == pushed.asset_id_for(&component.id);
            if existing.state == AssetState::Modified && unchanged_since_push {
                existing.state = AssetState::Unmodified;
            }
            current.update_component_internal(existing)?;
        }
        if pushed.composite_state() == AssetState::CommittedDelete || journal.composite_deleted() {
            current.set_composite_state_internal(AssetState::CommittedDelete);
        } else if current.composite_state() == AssetState::Modified
            && current
                .all_components()
                .all(|c| c.state == AssetState::Unmodified)
        {
            current.set_composite_state_internal(AssetState::Unmodified);
        }

        // Commit the merged current, then promote pushed to base.
        current.write_to_file(&storage::current_manifest_path(&self.path), true)?;
        let href = current.composite_href().map(str::to_owned);
        storage::store_base_manifest(&self.path, &pushed.local_data()?)?;
        if let Some(href) = href {
            if let Ok(url) = utils::parse_url(&href) {
                state.href = Some(url);
            }
        }
        state.committed_state = Some(state.current.as_ref().unwrap().composite_state());
        state.committed_at = Some(Utc::now());
        state.base = Some(pushed);
        storage::discard_push(&self.path)?;
        info!("accepted push for composite '{}'", state.composite_id);
        Ok(())
    }

    /// Promotes a merged branch manifest to current, commits it, replaces
    /// base with the pulled snapshot and discards the pull artifacts.
    /// `merged` must share DOM lineage with either the pulled or the
    /// current branch; pass `None` to accept the pulled branch as-is.
    pub fn resolve_pull(&self, merged: Option<Manifest>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(pulled) = state.pulled.clone() else {
            return Ok(());
        };

        let mut target = match merged {
            Some(merged) => {
                let shares_lineage = merged.composite_id() == pulled.composite_id()
                    || state
                        .current
                        .as_ref()
                        .is_some_and(|c| c.composite_id() == merged.composite_id());
                if !shares_lineage {
                    return Err(anyhow!(SyncError::InvalidManifest {
                        details: "merged branch does not share lineage with pulled or current"
                            .to_owned(),
                    }));
                }
                merged
            }
            None => pulled.clone(),
        };

        utils::ensure_dir_exists("composite", &self.path)?;
        target.write_to_file(&storage::current_manifest_path(&self.path), true)?;
        storage::store_base_manifest(&self.path, &pulled.local_data()?)?;
        if let Err(e) = storage::discard_pull(&self.path) {
            warn!("could not discard pull artifacts: {e:#}");
        }

        state.committed_state = Some(target.composite_state());
        state.committed_at = Some(Utc::now());
        let composite_id = target.composite_id().to_owned();
        if let Some(href) = target.composite_href() {
            if let Ok(url) = utils::parse_url(href) {
                state.href = Some(url);
            }
        }
        state.composite_id = composite_id;
        state.current = Some(target);
        state.base = Some(pulled);
        state.pulled = None;
        info!("resolved pull for composite '{}'", state.composite_id);
        Ok(())
    }

    /// Discards the pulled branch and its on-disk artifacts. No-op when
    /// there is none.
    pub fn discard_pulled(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        storage::discard_pull(&self.path)?;
        state.pulled = None;
        Ok(())
    }

    /// Discards the pushed branch, its on-disk artifacts and the push
    /// journal. No-op when there is none.
    pub fn discard_pushed(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        storage::discard_push(&self.path)?;
        state.pushed = None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------

    /// Removes all service-related data from the current branch so the
    /// composite can be pushed again to the same or another service, and
    /// purges base, pulled and pushed artifacts plus the push journal.
    pub fn reset_binding(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(current) = state.current.as_mut() else {
            bail!("composite has no current branch to reset");
        };
        current.reset_binding();
        storage::reset_binding(&self.path)?;
        state.base = None;
        state.pulled = None;
        state.pushed = None;
        state.href = None;
        state.committed_state = None;
        Ok(())
    }

    /// `reset_binding` plus freshly minted ids for the composite and its
    /// nodes and components.
    pub fn reset_identity(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(current) = state.current.as_mut() else {
            bail!("composite has no current branch to reset");
        };
        current.reset_identity();
        let composite_id = current.composite_id().to_owned();
        storage::reset_binding(&self.path)?;
        state.base = None;
        state.pulled = None;
        state.pushed = None;
        state.href = None;
        state.committed_state = None;
        state.composite_id = composite_id;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local storage
    // ------------------------------------------------------------------

    /// Deletes the composite's directory with all of its contents.
    pub fn remove_local_storage(&self) -> Result<()> {
        if utils::is_directory(&self.path) {
            utils::remove_dir_all("composite", &self.path)?;
        }
        Ok(())
    }

    /// Deletes component files no branch references any more; returns the
    /// bytes freed. The committed manifest on disk counts as a reference
    /// even when the in-memory current branch has moved on.
    pub fn remove_unused_local_files(&self) -> Result<u64> {
        let state = self.state.lock().unwrap();
        let committed = {
            let path = storage::current_manifest_path(&self.path);
            if utils::is_file(&path) {
                Manifest::from_file(&path).ok()
            } else {
                None
            }
        };
        let manifests: Vec<&Manifest> = [
            state.current.as_ref(),
            state.pulled.as_ref(),
            state.pushed.as_ref(),
            state.base.as_ref(),
            committed.as_ref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        let inflight = self.inflight_local_component_files.lock().unwrap().clone();
        storage::remove_unused_files(&self.path, &manifests, &inflight)
    }

    /// Deletes the local asset files of the given components. Components
    /// that are `Modified` in the current branch produce a
    /// `CannotRemoveModifiedComponent` error in the returned list and are
    /// skipped; the freed byte total is always returned.
    pub fn remove_local_files_for_components(
        &self,
        component_ids: &[&str],
    ) -> (u64, Vec<anyhow::Error>) {
        let mut state = self.state.lock().unwrap();
        let BranchState { current, base, .. } = &mut *state;
        storage::remove_files_for_components(
            &self.path,
            current.as_mut(),
            base.as_ref(),
            component_ids,
        )
    }

    /// Bytes of component storage referenced by any branch. Files managed
    /// by the client under `clientdata/` are not counted.
    pub fn local_storage_bytes_consumed(&self) -> u64 {
        let state = self.state.lock().unwrap();
        let manifests: Vec<&Manifest> = [
            state.current.as_ref(),
            state.pulled.as_ref(),
            state.pushed.as_ref(),
            state.base.as_ref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        storage::bytes_consumed(&self.path, &manifests)
    }

    /// Verifies the internal consistency of every attached branch.
    pub fn verify_integrity(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut findings = Vec::new();
        for (name, manifest) in [
            ("current", state.current.as_ref()),
            ("pulled", state.pulled.as_ref()),
            ("pushed", state.pushed.as_ref()),
            ("base", state.base.as_ref()),
        ] {
            if let Some(manifest) = manifest {
                findings.extend(manifest.verify_integrity(name));
            }
        }
        findings
    }

    // ------------------------------------------------------------------
    // Engine support
    // ------------------------------------------------------------------

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BranchState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn push_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.push_lock
    }

    pub(crate) fn pull_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.pull_lock
    }

    pub(crate) fn inflight(&self) -> &Mutex<HashSet<PathBuf>> {
        &self.inflight_local_component_files
    }
}
