//! The push/pull transfer engine.
//!
//! A push is two-phase: `push_composite` uploads changed component assets
//! and the manifest into the composite's `pushed` branch without touching
//! `current`; `Composite::accept_push` promotes the result. Every
//! successful upload is durably journaled before the next one starts, so
//! a crashed or cancelled push resumes where it left off. A pull is the
//! mirror image: `pull_composite` materialises the server state into the
//! `pulled` branch (downloading only assets that are missing locally) and
//! `Composite::resolve_pull` promotes the merged result.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, info};
use url::Url;

use crate::errors::SyncError;
use crate::model::branch::Branch;
use crate::model::composite::Composite;
use crate::model::manifest::Manifest;
use crate::model::node::Component;
use crate::model::AssetState;
use crate::storage;
use crate::transfer::journal::PushJournal;
use crate::transfer::session::{
    CancelToken, CompositeDescriptor, ManifestDownload, RequestPriority, TransferSession,
};
use crate::utils;
use crate::utils::json::Table;

pub mod journal;
pub mod session;

/// The session runs at most this many requests concurrently.
const MAX_CONCURRENT_REQUESTS: usize = 5;
const DEFAULT_CONCURRENT_REQUESTS: usize = 2;

/// Per-transfer settings.
#[derive(Clone, Debug)]
pub struct TransferOptions {
    pub priority: RequestPriority,
    pub cancel: CancelToken,
    /// Concurrent component transfers; clamped to 1..=5.
    pub concurrent_requests: usize,
    /// Push only: overwrite a composite that already exists on the
    /// server. Set this after the user has confirmed overwriting when a
    /// previous push failed with `CompositeAlreadyExists`.
    pub overwrite: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            priority: RequestPriority::default(),
            cancel: CancelToken::new(),
            concurrent_requests: DEFAULT_CONCURRENT_REQUESTS,
            overwrite: false,
        }
    }
}

impl TransferOptions {
    fn limit(&self) -> usize {
        self.concurrent_requests.clamp(1, MAX_CONCURRENT_REQUESTS)
    }
}

/// Which branch of a composite an operation addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BranchSelector {
    Current,
    Pulled,
    Pushed,
    Base,
}

/// Uploads the committed state of the composite to the server, creating
/// it there if needed, and leaves the result in the `pushed` branch.
/// `current` is not modified; call [`Composite::accept_push`] once the
/// push succeeds.
///
/// The engine reads from the committed manifest, so `commit_changes` must
/// have been called for the state that is meant to be pushed. While the
/// push is running the client must not replace or delete the component
/// asset files the committed manifest references; new edits through the
/// copy-on-write storage are safe.
pub async fn push_composite<S: TransferSession>(
    composite: &Composite,
    session: &S,
    options: &TransferOptions,
) -> Result<()> {
    let _transfer = composite.push_lock().lock().await;
    let cancel = options.cancel.child();
    cancel.check()?;

    let root = composite.path().to_owned();
    let committed = Manifest::from_file(&storage::current_manifest_path(&root))?;
    if committed.composite_state() == AssetState::CommittedDelete {
        return Err(anyhow!(SyncError::DeletedComposite));
    }
    info!(
        "pushing composite '{}' ({})",
        committed.composite_id(),
        committed.composite_state()
    );

    let journal = PushJournal::load_or_new(&storage::push_journal_path(&root));
    let mut href = match composite.href() {
        Some(url) => Some(url),
        None => match committed.composite_href() {
            Some(h) => Some(utils::parse_url(h)?),
            None => None,
        },
    };
    journal.reset_if_stale(
        href.as_ref().map(Url::as_str),
        committed.manifest_etag(),
    )?;
    journal.record_current_branch_etag(committed.manifest_etag())?;
    if href.is_none() {
        // A crashed push may have created the composite already; its href
        // then only exists in the journal.
        href = match journal.composite_href() {
            Some(h) => Some(utils::parse_url(&h)?),
            None => None,
        };
    }

    let mut pushed = committed.clone();

    // Create the composite on the server when it was never pushed.
    let bound = committed.manifest_etag().is_some() || committed.is_bound();
    if !bound && !journal.composite_created() {
        cancel.check()?;
        let descriptor = CompositeDescriptor {
            composite_id: committed.composite_id(),
            name: committed.name(),
            media_type: committed.media_type(),
            href: href.as_ref(),
        };
        match session
            .create_composite(&descriptor, options.priority, &cancel)
            .await
        {
            Ok(created) => {
                journal.set_composite_href(created.href.as_str())?;
                journal.record_composite_created(created.etag.as_deref())?;
                composite.lock_state().href = Some(created.href.clone());
                href = Some(created.href);
            }
            Err(e)
                if options.overwrite
                    && matches!(
                        e.downcast_ref::<SyncError>(),
                        Some(SyncError::CompositeAlreadyExists { .. })
                    ) =>
            {
                if let Some(href) = &href {
                    journal.set_composite_href(href.as_str())?;
                }
                journal.record_composite_created(None)?;
            }
            Err(e) => return Err(e),
        }
    }
    let Some(href) = href else {
        return Err(anyhow!(SyncError::CompositeHrefUnassigned));
    };
    pushed.set_composite_href(Some(href.to_string()));

    match committed.composite_state() {
        AssetState::PendingDelete => {
            cancel.check()?;
            session
                .delete_composite(&href, committed.manifest_etag(), options.priority, &cancel)
                .await?;
            journal.record_composite_deleted()?;
            pushed.set_composite_state_internal(AssetState::CommittedDelete);
            pushed.set_etag(None);
            pushed.set_manifest_etag(None);
            pushed.set_links(Table::new());
            pushed.set_composite_href(None);
            journal.record_complete()?;
            write_pushed_manifest(&root, &mut pushed)?;
            composite.lock_state().pushed = Some(pushed);
            info!("deleted composite on server");
            return Ok(());
        }
        AssetState::Unmodified => {
            debug!("composite is unmodified, nothing to push");
            return Ok(());
        }
        _ => {}
    }

    // Decide per component what this pass does.
    let mut uploads: Vec<Component> = Vec::new();
    let mut deletes: Vec<Component> = Vec::new();
    let all: Vec<Component> = pushed.components_any_state().cloned().collect();
    for component in all {
        match component.state {
            AssetState::Unmodified if component.is_bound() => {}
            AssetState::PendingDelete => {
                // Deleted during a subsequent push; no request this pass.
                pushed.set_component_state_internal(&component.id, AssetState::CommittedDelete)?;
            }
            AssetState::CommittedDelete => deletes.push(component),
            _ => uploads.push(component),
        }
    }

    for component in deletes {
        cancel.check()?;
        session
            .delete_component(
                &href,
                &component,
                component.etag.as_deref(),
                options.priority,
                &cancel,
            )
            .await?;
        pushed.remove_component_internal(&component.id)?;
        journal.clear_component(&component.id)?;
    }

    if !uploads.is_empty() {
        let semaphore = Arc::new(Semaphore::new(options.limit()));
        let mut futures = FuturesUnordered::new();
        for component in uploads {
            let source = storage::asset_path(&root, &pushed, &component)?;
            if !utils::is_file(&source) {
                return Err(anyhow!(SyncError::ComponentReadFailure { path: source }));
            }
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let href = href.clone();
            let journal = &journal;
            let priority = options.priority;
            futures.push(async move {
                let _permit = semaphore.acquire().await.unwrap();
                cancel.check()?;
                if let Some(mut hit) = journal.uploaded_component(&component, &source)? {
                    debug!("skipping upload of '{}': already journaled", hit.id);
                    hit.state = AssetState::Unmodified;
                    return Ok::<Component, anyhow::Error>(hit);
                }
                let uploaded = session
                    .upload_component(
                        &href,
                        &component,
                        &source,
                        component.etag.as_deref(),
                        priority,
                        &cancel,
                    )
                    .await?;
                debug!("uploaded component '{}' ({} bytes)", component.id, uploaded.length);
                let mut updated = component;
                updated.etag = Some(uploaded.etag);
                updated.version = uploaded.version;
                updated.length = Some(uploaded.length);
                if !uploaded.links.is_empty() {
                    updated.links = uploaded.links;
                }
                updated.state = AssetState::Unmodified;
                journal.record_uploaded_component(&updated, &source)?;
                Ok(updated)
            });
        }
        while let Some(result) = futures.next().await {
            let updated = result?;
            pushed.update_component_internal(updated)?;
        }
    }

    // All component work done; upload the manifest guarded by the etag of
    // the revision this push started from.
    pushed.set_composite_state_internal(AssetState::Unmodified);
    cancel.check()?;
    let data = pushed.remote_data()?;
    let if_match = journal.current_branch_etag();
    let updated = session
        .update_manifest(&href, &data, if_match.as_deref(), options.priority, &cancel)
        .await?;
    pushed.set_manifest_etag(Some(updated.etag.clone()));
    pushed.set_etag(Some(updated.etag.clone()));
    journal.record_uploaded_manifest(&updated.etag)?;
    write_pushed_manifest(&root, &mut pushed)?;
    composite.lock_state().pushed = Some(pushed);
    info!("pushed composite, new manifest etag '{}'", updated.etag);
    Ok(())
}

/// A full pull: fetches the server manifest (skipping work when the
/// committed etag still matches), reuses local content where etags agree,
/// downloads the missing component assets and exposes the result as the
/// `pulled` branch. Returns `None` when the server copy is unchanged.
pub async fn pull_composite<S: TransferSession>(
    composite: &Composite,
    session: &S,
    options: &TransferOptions,
) -> Result<Option<Branch>> {
    pull(composite, session, options, true).await
}

/// Steps 1–2 of a pull only: the manifest is fetched and reconciled, but
/// no component assets are downloaded. Use [`download_components`] to
/// fetch selected assets later.
pub async fn pull_minimal_composite<S: TransferSession>(
    composite: &Composite,
    session: &S,
    options: &TransferOptions,
) -> Result<Option<Branch>> {
    pull(composite, session, options, false).await
}

async fn pull<S: TransferSession>(
    composite: &Composite,
    session: &S,
    options: &TransferOptions,
    download_assets: bool,
) -> Result<Option<Branch>> {
    let _transfer = composite.pull_lock().lock().await;
    let cancel = options.cancel.child();
    cancel.check()?;

    let root = composite.path().to_owned();
    let committed = {
        let path = storage::current_manifest_path(&root);
        if utils::is_file(&path) {
            Some(Manifest::from_file(&path)?)
        } else {
            None
        }
    };
    let href = match composite.href() {
        Some(url) => url,
        None => return Err(anyhow!(SyncError::CompositeHrefUnassigned)),
    };
    info!("pulling composite from '{href}'");

    let if_none_match = committed
        .as_ref()
        .and_then(|m| m.manifest_etag().map(str::to_owned));
    let fetched = session
        .get_manifest(&href, if_none_match.as_deref(), options.priority, &cancel)
        .await?;
    let (data, etag) = match fetched {
        ManifestDownload::NotModified => {
            debug!("server manifest unchanged");
            return Ok(None);
        }
        ManifestDownload::Fetched { data, etag } => (data, etag),
    };

    let mut pulled = Manifest::parse(&data).with_context(|| SyncError::InvalidRemoteManifest {
        details: format!("from '{href}'"),
    })?;
    pulled.set_manifest_etag(Some(etag.clone()));
    pulled.set_etag(Some(etag));
    pulled.set_composite_href(Some(href.to_string()));
    pulled.set_composite_state_internal(AssetState::Unmodified);
    let ids: Vec<String> = pulled.components_any_state().map(|c| c.id.clone()).collect();
    for id in &ids {
        pulled.set_component_state_internal(id, AssetState::Unmodified)?;
    }

    // Adopt asset mappings for content that already exists locally so it
    // is not downloaded again.
    {
        let state = composite.lock_state();
        let sources: Vec<&Manifest> = [
            state.current.as_ref(),
            state.base.as_ref(),
            state.pushed.as_ref(),
            state.pulled.as_ref(),
            committed.as_ref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        storage::update_local_storage(&mut pulled, &sources);
    }

    if download_assets {
        download_missing(&root, composite, session, &href, &mut pulled, None, options, &cancel)
            .await?;
    }

    let path = storage::pull_manifest_path(&root);
    utils::ensure_dir_exists("pull", path.parent().unwrap())?;
    pulled.write_to_file(&path, false)?;
    composite.lock_state().pulled = Some(pulled.clone());
    info!("pulled composite '{}'", pulled.composite_id());
    Ok(Some(Branch::new(pulled, root)))
}

/// Downloads component assets of the selected branch: exactly the
/// requested ids, or every component whose asset is missing locally when
/// `ids` is `None`. The branch structure is untouched; only asset files
/// and the branch's storage-id map are filled in.
pub async fn download_components<S: TransferSession>(
    composite: &Composite,
    session: &S,
    selector: BranchSelector,
    ids: Option<&[&str]>,
    options: &TransferOptions,
) -> Result<Branch> {
    let _transfer = composite.pull_lock().lock().await;
    let cancel = options.cancel.child();
    cancel.check()?;

    let root = composite.path().to_owned();
    let href = match composite.href() {
        Some(url) => url,
        None => return Err(anyhow!(SyncError::CompositeHrefUnassigned)),
    };
    let mut manifest = {
        let state = composite.lock_state();
        let slot = match selector {
            BranchSelector::Current => &state.current,
            BranchSelector::Pulled => &state.pulled,
            BranchSelector::Pushed => &state.pushed,
            BranchSelector::Base => &state.base,
        };
        slot.clone()
            .ok_or_else(|| anyhow!("composite has no {selector:?} branch"))?
    };

    let requested: Option<Vec<String>> =
        ids.map(|ids| ids.iter().map(|id| (*id).to_owned()).collect());
    download_missing(
        &root,
        composite,
        session,
        &href,
        &mut manifest,
        requested.as_deref(),
        options,
        &cancel,
    )
    .await?;

    // Persist branches that live in a file of their own; the current
    // branch stays in memory until the client commits.
    match selector {
        BranchSelector::Pulled => {
            let path = storage::pull_manifest_path(&root);
            utils::ensure_dir_exists("pull", path.parent().unwrap())?;
            manifest.write_to_file(&path, false)?;
        }
        BranchSelector::Pushed => {
            let path = storage::push_manifest_path(&root);
            utils::ensure_dir_exists("push", path.parent().unwrap())?;
            manifest.write_to_file(&path, false)?;
        }
        BranchSelector::Base => {
            storage::store_base_manifest(&root, &manifest.local_data()?)?;
        }
        BranchSelector::Current => {}
    }
    {
        let mut state = composite.lock_state();
        let slot = match selector {
            BranchSelector::Current => &mut state.current,
            BranchSelector::Pulled => &mut state.pulled,
            BranchSelector::Pushed => &mut state.pushed,
            BranchSelector::Base => &mut state.base,
        };
        *slot = Some(manifest.clone());
    }
    Ok(Branch::new(manifest, root))
}

/// Downloads the given (or all missing) components of `manifest` into
/// copy-on-write storage: each asset lands in a temp file and is
/// atomically renamed into `components/` under a fresh asset id, which is
/// then recorded in the manifest's storage map.
#[allow(clippy::too_many_arguments)]
async fn download_missing<S: TransferSession>(
    root: &Path,
    composite: &Composite,
    session: &S,
    href: &Url,
    manifest: &mut Manifest,
    ids: Option<&[String]>,
    options: &TransferOptions,
    cancel: &CancelToken,
) -> Result<()> {
    let is_missing = |manifest: &Manifest, component: &Component| match manifest
        .asset_id_for(&component.id)
    {
        None => true,
        Some(_) => !storage::asset_path(root, manifest, component)
            .map(|p| utils::is_file(&p))
            .unwrap_or(false),
    };
    let targets: Vec<Component> = match ids {
        Some(ids) => {
            let mut targets = Vec::with_capacity(ids.len());
            for id in ids {
                let component = manifest
                    .component_with_id(id)
                    .ok_or_else(|| anyhow!(SyncError::UnknownId(id.clone())))?;
                if is_missing(manifest, component) {
                    targets.push(component.clone());
                }
            }
            targets
        }
        None => manifest
            .components_any_state()
            .filter(|c| is_missing(manifest, c))
            .cloned()
            .collect(),
    };
    if targets.is_empty() {
        return Ok(());
    }
    debug!("downloading {} component asset(s)", targets.len());

    let components_dir = storage::components_dir(root);
    utils::ensure_dir_exists("components", &components_dir)?;

    // Destinations are minted up front and pinned in the inflight set so
    // a concurrent reclamation pass cannot delete a freshly renamed file
    // before its mapping is recorded.
    let work: Vec<(Component, String, PathBuf)> = targets
        .into_iter()
        .map(|component| {
            let (asset_id, path) = storage::new_asset_path(root, &component);
            (component, asset_id, path)
        })
        .collect();
    {
        let mut inflight = composite.inflight().lock().unwrap();
        for (_, _, path) in &work {
            inflight.insert(path.clone());
        }
    }

    let result = async {
        let semaphore = Arc::new(Semaphore::new(options.limit()));
        let mut futures = FuturesUnordered::new();
        for (component, asset_id, dest) in &work {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let href = href.clone();
            let priority = options.priority;
            let dir = components_dir.clone();
            futures.push(async move {
                let _permit = semaphore.acquire().await.unwrap();
                cancel.check()?;
                let tmp = tempfile::Builder::new()
                    .prefix("download")
                    .tempfile_in(&dir)
                    .with_context(|| SyncError::ComponentWriteFailure { path: dest.clone() })?;
                let length = session
                    .download_component(&href, component, tmp.path(), priority, &cancel)
                    .await?;
                tmp.persist(dest)
                    .map_err(|e| e.error)
                    .with_context(|| SyncError::ComponentWriteFailure { path: dest.clone() })?;
                debug!("downloaded component '{}' ({length} bytes)", component.id);
                Ok::<(&str, &str), anyhow::Error>((component.id.as_str(), asset_id.as_str()))
            });
        }
        while let Some(result) = futures.next().await {
            let (component_id, asset_id) = result?;
            manifest.set_asset_id(component_id, asset_id.to_owned());
        }
        Ok(())
    }
    .await;

    {
        let mut inflight = composite.inflight().lock().unwrap();
        for (_, _, path) in &work {
            inflight.remove(path);
        }
    }
    result
}

fn write_pushed_manifest(root: &Path, pushed: &mut Manifest) -> Result<()> {
    let path = storage::push_manifest_path(root);
    utils::ensure_dir_exists("push", path.parent().unwrap())?;
    pushed
        .write_to_file(&path, false)
        .with_context(|| SyncError::ManifestFinalWriteFailure { path })
}
