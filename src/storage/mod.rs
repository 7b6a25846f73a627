//! The copy-on-write local storage scheme.
//!
//! Component assets are read-only files in a flat `components/` directory,
//! named by a GUID asset id. A new version of a component gets a new asset
//! id and with it a new file name, so clients can keep editing a composite
//! while a push or pull is in flight; superseded files stay behind until
//! reclamation. The componentId-to-assetId map travels in the manifest's
//! `_local` subtree.
//!
//! Layout under the composite directory:
//!
//! ```text
//! manifest            committed current
//! manifest.base       base
//! pull/manifest       pulled
//! push/manifest       pushed
//! push/journal        push journal
//! components/<id>     flat, GUID-named, read-only asset files
//! clientdata/         opaque client-owned files, ignored here
//! ```

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use crate::errors::SyncError;
use crate::model::node::Component;
use crate::model::{mint_id, AssetState, Manifest};
use crate::utils;

pub(crate) const MANIFEST_FILE: &str = "manifest";
pub(crate) const BASE_MANIFEST_FILE: &str = "manifest.base";
pub(crate) const PULL_DIR: &str = "pull";
pub(crate) const PUSH_DIR: &str = "push";
pub(crate) const JOURNAL_FILE: &str = "journal";
pub(crate) const COMPONENTS_DIR: &str = "components";
pub(crate) const CLIENT_DATA_DIR: &str = "clientdata";

pub(crate) fn current_manifest_path(root: &Path) -> PathBuf {
    root.join(MANIFEST_FILE)
}

pub(crate) fn base_manifest_path(root: &Path) -> PathBuf {
    root.join(BASE_MANIFEST_FILE)
}

pub(crate) fn pull_manifest_path(root: &Path) -> PathBuf {
    root.join(PULL_DIR).join(MANIFEST_FILE)
}

pub(crate) fn push_manifest_path(root: &Path) -> PathBuf {
    root.join(PUSH_DIR).join(MANIFEST_FILE)
}

pub(crate) fn push_journal_path(root: &Path) -> PathBuf {
    root.join(PUSH_DIR).join(JOURNAL_FILE)
}

pub(crate) fn components_dir(root: &Path) -> PathBuf {
    root.join(COMPONENTS_DIR)
}

pub(crate) fn client_data_dir(root: &Path) -> PathBuf {
    root.join(CLIENT_DATA_DIR)
}

/// The on-disk file name of an asset: the asset id, plus the component
/// path's extension as a type hint.
fn asset_file_name(asset_id: &str, component_path: &str) -> String {
    match Path::new(component_path).extension() {
        Some(ext) => format!("{}.{}", asset_id, ext.to_string_lossy()),
        None => asset_id.to_owned(),
    }
}

/// The asset id a file name in `components/` refers to.
fn asset_id_of_file_name(name: &str) -> &str {
    match name.find('.') {
        Some(dot) => &name[..dot],
        None => name,
    }
}

/// The file path for reading the component's current asset.
pub(crate) fn asset_path(
    root: &Path,
    manifest: &Manifest,
    component: &Component,
) -> Result<PathBuf> {
    let asset_id = manifest.asset_id_for(&component.id).ok_or_else(|| {
        anyhow!(SyncError::InvalidLocalStoragePath {
            id: component.id.clone(),
        })
    })?;
    Ok(components_dir(root).join(asset_file_name(asset_id, &component.path)))
}

/// The file path for writing a new version of the component's asset. The
/// freshly minted asset id becomes current once recorded in the manifest,
/// leaving the previous file in place for concurrent readers.
pub(crate) fn new_asset_path(root: &Path, component: &Component) -> (String, PathBuf) {
    let asset_id = mint_id();
    let path = components_dir(root).join(asset_file_name(&asset_id, &component.path));
    (asset_id, path)
}

/// Copies or moves `source_file` into `components/` as the new asset of
/// `component`, updating the manifest's asset id map. The destination is
/// registered with the inflight set for the duration of the import so a
/// concurrent reclamation pass cannot race the copy, and the asset file is
/// made read-only afterwards.
pub(crate) fn import_component_file(
    root: &Path,
    manifest: &mut Manifest,
    component: &Component,
    source_file: &Path,
    copy: bool,
    inflight: &std::sync::Mutex<HashSet<PathBuf>>,
) -> Result<PathBuf> {
    if !utils::is_file(source_file) {
        return Err(anyhow!(SyncError::FileDoesNotExist {
            path: PathBuf::from(source_file),
        }));
    }
    utils::ensure_dir_exists("components", &components_dir(root))?;
    let (asset_id, dest) = new_asset_path(root, component);

    inflight.lock().unwrap().insert(dest.clone());
    let result = (|| -> Result<()> {
        if copy {
            utils::copy_file("component", source_file, &dest)?;
        } else {
            utils::rename_file("component", source_file, &dest)?;
        }
        let mut permissions = fs::metadata(&dest)
            .with_context(|| SyncError::ComponentReadFailure { path: dest.clone() })?
            .permissions();
        permissions.set_readonly(true);
        let _ = fs::set_permissions(&dest, permissions);
        Ok(())
    })()
    .with_context(|| SyncError::ComponentWriteFailure { path: dest.clone() });
    if let Err(e) = result {
        inflight.lock().unwrap().remove(&dest);
        return Err(e);
    }

    manifest.set_asset_id(&component.id, asset_id);
    inflight.lock().unwrap().remove(&dest);
    Ok(dest)
}

/// componentId to absolute asset path, for every component of the branch
/// manifest whose asset file exists locally.
pub(crate) fn existing_local_paths(root: &Path, manifest: &Manifest) -> HashMap<String, PathBuf> {
    let mut result = HashMap::new();
    for component in manifest.all_components() {
        if let Ok(path) = asset_path(root, manifest, component) {
            if utils::is_file(&path) {
                result.insert(component.id.clone(), path);
            }
        }
    }
    result
}

/// Gives a pulled manifest the asset id mappings of components whose
/// content already matches a local copy in one of the existing branches,
/// so the pull does not re-download them. A locally modified component no
/// longer stores the content its etag names, so only unmodified entries
/// count as matches.
pub(crate) fn update_local_storage(target: &mut Manifest, sources: &[&Manifest]) {
    let ids: Vec<(String, String)> = target
        .all_components()
        .filter(|c| target.asset_id_for(&c.id).is_none())
        .filter_map(|component| {
            let etag = component.etag.as_deref()?;
            sources.iter().find_map(|source| {
                let existing = source.component_with_id(&component.id)?;
                if !matches!(
                    existing.state,
                    AssetState::Unmodified | AssetState::PendingDelete
                ) || existing.etag.as_deref() != Some(etag)
                {
                    return None;
                }
                let asset_id = source.asset_id_for(&component.id)?;
                Some((component.id.clone(), asset_id.to_owned()))
            })
        })
        .collect();
    for (component_id, asset_id) in ids {
        target.set_asset_id(&component_id, asset_id);
    }
}

/// Deletes files in `components/` that no branch references any more.
/// The live set is the union of asset ids referenced by the given
/// manifests plus the inflight paths. Returns the total bytes freed.
pub(crate) fn remove_unused_files(
    root: &Path,
    manifests: &[&Manifest],
    inflight: &HashSet<PathBuf>,
) -> Result<u64> {
    let dir = components_dir(root);
    if !utils::is_directory(&dir) {
        return Ok(0);
    }
    let mut live: HashSet<&str> = HashSet::new();
    for manifest in manifests {
        live.extend(manifest.asset_ids().values().map(String::as_str));
    }

    let mut freed = 0u64;
    let entries = fs::read_dir(&dir).with_context(|| SyncError::FileReadFailure {
        path: dir.clone(),
    })?;
    for entry in entries {
        let entry = entry.with_context(|| SyncError::FileReadFailure { path: dir.clone() })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if live.contains(asset_id_of_file_name(&name)) || inflight.contains(&path) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let mut permissions = match entry.metadata() {
            Ok(m) => m.permissions(),
            Err(_) => continue,
        };
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        let _ = fs::set_permissions(&path, permissions);
        match fs::remove_file(&path) {
            Ok(()) => freed += size,
            Err(e) => warn!("could not reclaim '{}': {e}", path.display()),
        }
    }
    debug!("reclaimed {freed} bytes under '{}'", dir.display());
    Ok(freed)
}

/// Deletes the local asset files of the requested components. Components
/// that are `Modified` in the current branch are skipped with a
/// `CannotRemoveModifiedComponent` error in the returned list; the freed
/// byte total is always returned.
pub(crate) fn remove_files_for_components(
    root: &Path,
    current: Option<&mut Manifest>,
    base: Option<&Manifest>,
    component_ids: &[&str],
) -> (u64, Vec<anyhow::Error>) {
    let mut freed = 0u64;
    let mut errors = Vec::new();
    let mut current = current;
    for &id in component_ids {
        let current_component = current
            .as_deref()
            .and_then(|manifest| manifest.component_with_id(id).cloned());
        if let Some(component) = &current_component {
            if component.state == AssetState::Modified {
                errors.push(anyhow!(SyncError::CannotRemoveModifiedComponent {
                    id: id.to_owned(),
                }));
                continue;
            }
        }

        // Resolve through whichever branch still maps the component.
        let resolved = [
            current.as_deref().map(|m| &*m),
            base,
        ]
        .into_iter()
        .flatten()
        .find_map(|manifest| {
            let component = manifest.component_with_id(id)?;
            asset_path(root, manifest, component).ok()
        });
        let Some(path) = resolved else {
            continue;
        };
        if !utils::is_file(&path) {
            continue;
        }
        let size = utils::file_size(&path).unwrap_or(0);
        let mut permissions = match fs::metadata(&path) {
            Ok(m) => m.permissions(),
            Err(_) => continue,
        };
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        let _ = fs::set_permissions(&path, permissions);
        match fs::remove_file(&path) {
            Ok(()) => {
                freed += size;
                if let Some(manifest) = current.as_deref_mut() {
                    manifest.remove_asset_id(id);
                }
            }
            Err(e) => errors.push(
                anyhow::Error::new(e).context(SyncError::FileWriteFailure { path: path.clone() }),
            ),
        }
    }
    (freed, errors)
}

/// Total bytes of `components/` files referenced by the given manifests.
pub(crate) fn bytes_consumed(root: &Path, manifests: &[&Manifest]) -> u64 {
    let mut seen = HashSet::new();
    let mut total = 0u64;
    for manifest in manifests {
        for component in manifest.all_components() {
            let Ok(path) = asset_path(root, manifest, component) else {
                continue;
            };
            if seen.insert(path.clone()) {
                if let Ok(size) = utils::file_size(&path) {
                    total += size;
                }
            }
        }
    }
    total
}

/// Stores manifest bytes as the new base manifest.
pub(crate) fn store_base_manifest(root: &Path, data: &[u8]) -> Result<()> {
    let base = base_manifest_path(root);
    utils::write_file_atomic("base manifest", &base, data)
        .with_context(|| SyncError::FailedToStoreBaseManifest { path: base })
}

/// Removes the artifacts of the last pull. No-op when there are none.
pub(crate) fn discard_pull(root: &Path) -> Result<()> {
    let dir = root.join(PULL_DIR);
    if utils::is_directory(&dir) {
        utils::remove_dir_all("pull", &dir)?;
    }
    Ok(())
}

/// Removes the artifacts of the last push(es). No-op when there are none.
pub(crate) fn discard_push(root: &Path) -> Result<()> {
    let dir = root.join(PUSH_DIR);
    if utils::is_directory(&dir) {
        utils::remove_dir_all("push", &dir)?;
    }
    Ok(())
}

/// Removes base, pull and push artifacts, keeping committed manifest and
/// assets. Used when a composite's binding is reset.
pub(crate) fn reset_binding(root: &Path) -> Result<()> {
    discard_pull(root)?;
    discard_push(root)?;
    let base = base_manifest_path(root);
    if utils::is_file(&base) {
        utils::remove_file("base manifest", &base)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::model::node::Component;

    fn component(id: &str, path: &str) -> Component {
        Component::new(id.into(), path.into(), None, None)
    }

    fn manifest_with_component(id: &str, path: &str) -> Manifest {
        let mut manifest = Manifest::new("Doc", "application/x.test");
        manifest.add_component(component(id, path), None).unwrap();
        manifest
    }

    #[test]
    fn asset_paths_carry_the_component_extension() {
        let root = Path::new("/tmp/composite");
        let mut manifest = manifest_with_component("c1", "a.bin");
        manifest.set_asset_id("c1", "asset-1".into());
        let component = manifest.component_with_id("c1").unwrap();
        let path = asset_path(root, &manifest, component).unwrap();
        assert_eq!(path, root.join("components/asset-1.bin"));
        assert_eq!(asset_id_of_file_name("asset-1.bin"), "asset-1");
        assert_eq!(asset_id_of_file_name("asset-1"), "asset-1");
    }

    #[test]
    fn unmapped_component_has_invalid_storage_path() {
        let root = Path::new("/tmp/composite");
        let manifest = manifest_with_component("c1", "a.bin");
        let component = manifest.component_with_id("c1").unwrap();
        let err = asset_path(root, &manifest, component).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::InvalidLocalStoragePath { id }) if id == "c1"
        ));
    }

    #[test]
    fn import_mints_a_new_asset_per_version() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let inflight = Mutex::new(HashSet::new());
        let mut manifest = manifest_with_component("c1", "a.bin");

        let source = root.join("incoming.bin");
        std::fs::write(&source, b"one").unwrap();
        let component = manifest.component_with_id("c1").unwrap().clone();
        let first = import_component_file(root, &mut manifest, &component, &source, true, &inflight)
            .unwrap();
        let first_asset = manifest.asset_id_for("c1").unwrap().to_owned();

        std::fs::write(&source, b"two-more").unwrap();
        let second =
            import_component_file(root, &mut manifest, &component, &source, true, &inflight)
                .unwrap();
        assert_ne!(first, second);
        assert_ne!(first_asset, manifest.asset_id_for("c1").unwrap());
        // The superseded file stays behind for concurrent readers.
        assert!(first.is_file());
        assert!(inflight.lock().unwrap().is_empty());
    }

    #[test]
    fn reclamation_keeps_live_and_inflight_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let inflight = Mutex::new(HashSet::new());
        let mut manifest = manifest_with_component("c1", "a.bin");

        let source = root.join("incoming.bin");
        std::fs::write(&source, b"0123").unwrap();
        let component = manifest.component_with_id("c1").unwrap().clone();
        let mut stale = Vec::new();
        for _ in 0..3 {
            stale.push(
                import_component_file(root, &mut manifest, &component, &source, true, &inflight)
                    .unwrap(),
            );
        }
        let live = import_component_file(root, &mut manifest, &component, &source, true, &inflight)
            .unwrap();
        let pinned = components_dir(root).join("pinned-tmp");
        std::fs::write(&pinned, b"xyzzy").unwrap();
        let inflight_set: HashSet<_> = [pinned.clone()].into();

        let freed = remove_unused_files(root, &[&manifest], &inflight_set).unwrap();
        assert_eq!(freed, 12);
        for path in stale {
            assert!(!path.exists());
        }
        assert!(live.is_file());
        assert!(pinned.is_file());
    }

    #[test]
    fn targeted_removal_skips_modified_components() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let inflight = Mutex::new(HashSet::new());
        let mut manifest = manifest_with_component("c1", "a.bin");
        manifest
            .add_component(component("c2", "b.bin"), None)
            .unwrap();

        let source = root.join("incoming.bin");
        std::fs::write(&source, b"0123").unwrap();
        for id in ["c1", "c2"] {
            let c = manifest.component_with_id(id).unwrap().clone();
            import_component_file(root, &mut manifest, &c, &source, true, &inflight).unwrap();
        }
        manifest.set_component_state("c1", AssetState::Modified).unwrap();
        manifest.set_component_state("c2", AssetState::Unmodified).unwrap();

        let (freed, errors) =
            remove_files_for_components(root, Some(&mut manifest), None, &["c1", "c2"]);
        assert_eq!(freed, 4);
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0].downcast_ref::<SyncError>(),
            Some(SyncError::CannotRemoveModifiedComponent { id }) if id == "c1"
        ));
        assert!(manifest.asset_id_for("c1").is_some());
        assert!(manifest.asset_id_for("c2").is_none());
    }

    #[test]
    fn pulled_manifests_reuse_matching_local_content() {
        let mut current = manifest_with_component("c1", "a.bin");
        {
            let mut c1 = current.component_with_id("c1").unwrap().clone();
            c1.etag = Some("E1".into());
            c1.state = AssetState::Unmodified;
            current.update_component(c1).unwrap();
        }
        current.set_asset_id("c1", "asset-1".into());

        let mut pulled = Manifest::with_id(
            "Doc",
            "application/x.test",
            Some(current.composite_id().to_owned()),
        );
        let mut incoming = component("c1", "a.bin");
        incoming.etag = Some("E1".into());
        pulled.add_component(incoming, None).unwrap();
        let mut changed = component("c2", "b.bin");
        changed.etag = Some("E9".into());
        pulled.add_component(changed, None).unwrap();

        update_local_storage(&mut pulled, &[&current]);
        assert_eq!(pulled.asset_id_for("c1"), Some("asset-1"));
        assert!(pulled.asset_id_for("c2").is_none());
    }
}
