//! End-to-end push/pull scenarios against an in-memory object store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use url::Url;

use compsync::{
    classify_status, pull_composite, pull_minimal_composite, push_composite, AssetState,
    BranchSelector, CancelToken, CompositeCreated, CompositeDescriptor, ComponentUploaded,
    Composite, HttpContext, ManifestDownload, RequestIntent, RequestPriority, ResourceUpdated,
    SyncError, TransferOptions, TransferSession,
};

// ---------------------------------------------------------------------
// Mock object store
// ---------------------------------------------------------------------

#[derive(Default)]
struct ServerComposite {
    manifest: Option<(Vec<u8>, String)>,
    components: HashMap<String, (Vec<u8>, String, u64)>,
}

#[derive(Default)]
struct ServerState {
    composites: HashMap<String, ServerComposite>,
    etags: u64,
}

/// An in-memory transfer session with etag-guarded state, a call log and
/// one-shot fault injection.
struct MockSession {
    base: Url,
    state: Mutex<ServerState>,
    calls: Mutex<Vec<String>>,
    fail_once: Mutex<Option<&'static str>>,
}

impl MockSession {
    fn new() -> Self {
        Self {
            base: Url::parse("https://service.example/composites/").unwrap(),
            state: Mutex::new(ServerState::default()),
            calls: Mutex::new(Vec::new()),
            fail_once: Mutex::new(None),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn fail_next(&self, op: &'static str) {
        *self.fail_once.lock().unwrap() = Some(op);
    }

    fn take_failure(&self, op: &str, url: &Url) -> Result<()> {
        let mut fail = self.fail_once.lock().unwrap();
        if *fail == Some(op) {
            *fail = None;
            return Err(anyhow!(SyncError::NetworkFailure {
                context: HttpContext {
                    url: Some(url.clone()),
                    status: None,
                    headers: HashMap::new(),
                    body: Vec::new(),
                },
            }));
        }
        Ok(())
    }

    fn next_etag(state: &mut ServerState, prefix: &str) -> String {
        state.etags += 1;
        format!("{}{}", prefix, state.etags)
    }

    /// Simulates a concurrent writer bumping the manifest etag.
    fn bump_manifest_etag(&self, href: &Url) {
        let mut state = self.state.lock().unwrap();
        let etag = Self::next_etag(&mut state, "M-other-");
        let composite = state.composites.get_mut(href.as_str()).unwrap();
        if let Some((_, stored)) = composite.manifest.as_mut() {
            *stored = etag;
        }
    }

    fn manifest_etag(&self, href: &Url) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .composites
            .get(href.as_str())
            .and_then(|c| c.manifest.as_ref().map(|(_, etag)| etag.clone()))
    }

    fn http_error(&self, intent: RequestIntent, url: &Url, status: u16) -> anyhow::Error {
        anyhow!(classify_status(
            intent,
            HttpContext::new(url.clone(), status)
        ))
    }
}

impl TransferSession for MockSession {
    async fn create_composite(
        &self,
        descriptor: &CompositeDescriptor<'_>,
        _priority: RequestPriority,
        _cancel: &CancelToken,
    ) -> Result<CompositeCreated> {
        let href = match descriptor.href {
            Some(href) => href.clone(),
            None => self.base.join(descriptor.composite_id).unwrap(),
        };
        self.record(format!("createComposite:{href}"));
        self.take_failure("createComposite", &href)?;
        let mut state = self.state.lock().unwrap();
        state.composites.entry(href.to_string()).or_default();
        Ok(CompositeCreated { href, etag: None })
    }

    async fn delete_composite(
        &self,
        href: &Url,
        if_match: Option<&str>,
        _priority: RequestPriority,
        _cancel: &CancelToken,
    ) -> Result<()> {
        self.record(format!("deleteComposite:{href}"));
        self.take_failure("deleteComposite", href)?;
        let mut state = self.state.lock().unwrap();
        let Some(composite) = state.composites.get(href.as_str()) else {
            // 404 counts as already deleted.
            return Ok(());
        };
        if let (Some(if_match), Some((_, etag))) = (if_match, composite.manifest.as_ref()) {
            if if_match != etag {
                return Err(self.http_error(RequestIntent::Composite, href, 412));
            }
        }
        state.composites.remove(href.as_str());
        Ok(())
    }

    async fn get_manifest(
        &self,
        href: &Url,
        if_none_match: Option<&str>,
        _priority: RequestPriority,
        _cancel: &CancelToken,
    ) -> Result<ManifestDownload> {
        self.record(format!("getManifest:{href}"));
        self.take_failure("getManifest", href)?;
        let state = self.state.lock().unwrap();
        let Some(composite) = state.composites.get(href.as_str()) else {
            return Err(self.http_error(RequestIntent::Manifest, href, 404));
        };
        let Some((data, etag)) = composite.manifest.as_ref() else {
            return Err(anyhow!(SyncError::MissingManifest));
        };
        if if_none_match == Some(etag.as_str()) {
            return Ok(ManifestDownload::NotModified);
        }
        Ok(ManifestDownload::Fetched {
            data: data.clone(),
            etag: etag.clone(),
        })
    }

    async fn update_manifest(
        &self,
        href: &Url,
        data: &[u8],
        if_match: Option<&str>,
        _priority: RequestPriority,
        _cancel: &CancelToken,
    ) -> Result<ResourceUpdated> {
        self.record(format!("updateManifest:{:?}", if_match));
        self.take_failure("updateManifest", href)?;
        let mut state = self.state.lock().unwrap();
        let etag = Self::next_etag(&mut state, "M");
        let Some(composite) = state.composites.get_mut(href.as_str()) else {
            return Err(self.http_error(RequestIntent::Manifest, href, 404));
        };
        if let (Some(if_match), Some((_, stored))) = (if_match, composite.manifest.as_ref()) {
            if if_match != stored {
                return Err(self.http_error(RequestIntent::Manifest, href, 412));
            }
        }
        composite.manifest = Some((data.to_vec(), etag.clone()));
        Ok(ResourceUpdated {
            etag,
            version: None,
        })
    }

    async fn upload_component(
        &self,
        composite_href: &Url,
        component: &compsync::Component,
        source: &Path,
        if_match: Option<&str>,
        _priority: RequestPriority,
        _cancel: &CancelToken,
    ) -> Result<ComponentUploaded> {
        self.record(format!("uploadComponent:{}", component.id));
        self.take_failure("uploadComponent", composite_href)?;
        let data = std::fs::read(source)?;
        let mut state = self.state.lock().unwrap();
        let etag = Self::next_etag(&mut state, "C");
        let Some(composite) = state.composites.get_mut(composite_href.as_str()) else {
            return Err(self.http_error(RequestIntent::Composite, composite_href, 404));
        };
        let entry = composite.components.get(&component.id);
        if let (Some(if_match), Some((_, stored, _))) = (if_match, entry) {
            if if_match != stored {
                return Err(self.http_error(RequestIntent::Composite, composite_href, 412));
            }
        }
        let version = entry.map(|(_, _, v)| v + 1).unwrap_or(1);
        let length = data.len() as u64;
        composite
            .components
            .insert(component.id.clone(), (data, etag.clone(), version));

        let mut links = serde_json::Map::new();
        links.insert(
            "self".to_owned(),
            serde_json::json!({
                "href": format!("{composite_href}/components/{}", component.id)
            }),
        );
        Ok(ComponentUploaded {
            etag,
            version: Some(version.to_string()),
            length,
            links,
        })
    }

    async fn download_component(
        &self,
        composite_href: &Url,
        component: &compsync::Component,
        dest: &Path,
        _priority: RequestPriority,
        _cancel: &CancelToken,
    ) -> Result<u64> {
        self.record(format!("downloadComponent:{}", component.id));
        self.take_failure("downloadComponent", composite_href)?;
        let data = {
            let state = self.state.lock().unwrap();
            let Some(composite) = state.composites.get(composite_href.as_str()) else {
                return Err(self.http_error(RequestIntent::Composite, composite_href, 404));
            };
            match composite.components.get(&component.id) {
                Some((data, _, _)) => data.clone(),
                None => {
                    return Err(self.http_error(
                        RequestIntent::ComponentAsset {
                            id: component.id.clone(),
                        },
                        composite_href,
                        404,
                    ));
                }
            }
        };
        std::fs::write(dest, &data)?;
        Ok(data.len() as u64)
    }

    async fn delete_component(
        &self,
        composite_href: &Url,
        component: &compsync::Component,
        if_match: Option<&str>,
        _priority: RequestPriority,
        _cancel: &CancelToken,
    ) -> Result<()> {
        self.record(format!("deleteComponent:{}", component.id));
        self.take_failure("deleteComponent", composite_href)?;
        let mut state = self.state.lock().unwrap();
        let Some(composite) = state.composites.get_mut(composite_href.as_str()) else {
            return Ok(());
        };
        if let (Some(if_match), Some((_, stored, _))) =
            (if_match, composite.components.get(&component.id))
        {
            if if_match != stored {
                return Err(self.http_error(RequestIntent::Composite, composite_href, 412));
            }
        }
        composite.components.remove(&component.id);
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------

fn kind_of(err: &anyhow::Error) -> &SyncError {
    err.downcast_ref::<SyncError>().expect("a SyncError kind")
}

fn write_source(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn add_component(
    composite: &Composite,
    sources: &Path,
    id: &str,
    segment: &str,
    bytes: &[u8],
) -> compsync::Component {
    let source = write_source(sources, &format!("src-{id}"), bytes);
    composite
        .current_mut()
        .unwrap()
        .add_component_from_file(
            id,
            Some(id.to_owned()),
            "application/octet-stream",
            None,
            segment,
            None,
            &source,
            true,
        )
        .unwrap()
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[tokio::test]
async fn create_and_push_empty_composite() {
    let dir = tempfile::tempdir().unwrap();
    let session = MockSession::new();
    let composite = Composite::new("Doc", "application/x.test", dir.path(), None, None);
    composite.commit_changes().unwrap();

    push_composite(&composite, &session, &TransferOptions::default())
        .await
        .unwrap();

    assert_eq!(session.count("createComposite"), 1);
    assert_eq!(session.count("updateManifest"), 1);
    assert_eq!(session.count("uploadComponent"), 0);
    assert!(composite.href().is_some());

    let pushed = composite.pushed().expect("a pushed branch");
    composite.accept_push().unwrap();
    assert!(composite.pushed().is_none());
    let base = composite.base().expect("a base branch");
    assert_eq!(
        base.manifest().local_data().unwrap(),
        pushed.manifest().local_data().unwrap()
    );
    let current = composite.current().unwrap();
    assert_eq!(current.composite_state(), AssetState::Unmodified);
    assert_eq!(
        composite.committed_composite_state(),
        Some(AssetState::Unmodified)
    );
    // The journal is gone; accepting again is a no-op.
    composite.accept_push().unwrap();
}

#[tokio::test]
async fn add_push_edit_push_advances_etags() {
    let dir = tempfile::tempdir().unwrap();
    let sources = tempfile::tempdir().unwrap();
    let session = MockSession::new();
    let composite = Composite::new("Doc", "application/x.test", dir.path(), None, None);

    add_component(&composite, sources.path(), "c1", "a.bin", b"abcd");
    composite.commit_changes().unwrap();
    push_composite(&composite, &session, &TransferOptions::default())
        .await
        .unwrap();
    composite.accept_push().unwrap();

    let first_etag = composite
        .current()
        .unwrap()
        .manifest()
        .manifest_etag()
        .unwrap()
        .to_owned();
    let first_component_etag = composite
        .current()
        .unwrap()
        .component_with_id("c1")
        .unwrap()
        .etag
        .clone()
        .unwrap();

    // Edit c1 to 8 bytes; the component goes Modified.
    let bigger = write_source(sources.path(), "src-c1-v2", b"abcdefgh");
    composite
        .current_mut()
        .unwrap()
        .update_component_from_file("c1", &bigger, true)
        .unwrap();
    assert_eq!(
        composite
            .current()
            .unwrap()
            .component_with_id("c1")
            .unwrap()
            .state,
        AssetState::Modified
    );
    composite.commit_changes().unwrap();

    push_composite(&composite, &session, &TransferOptions::default())
        .await
        .unwrap();
    // The manifest upload was guarded by the first etag.
    assert_eq!(
        session.count(&format!("updateManifest:Some(\"{first_etag}\")")),
        1
    );
    composite.accept_push().unwrap();

    let current = composite.current().unwrap();
    let c1 = current.component_with_id("c1").unwrap();
    assert_eq!(c1.length, Some(8));
    assert_eq!(c1.state, AssetState::Unmodified);
    assert_ne!(c1.etag.as_deref().unwrap(), first_component_etag);
    assert_ne!(
        current.manifest().manifest_etag().unwrap(),
        first_etag,
        "a new manifest etag was recorded"
    );
}

#[tokio::test]
async fn conflicting_edit_fails_and_keeps_local_state() {
    let dir = tempfile::tempdir().unwrap();
    let sources = tempfile::tempdir().unwrap();
    let session = MockSession::new();
    let composite = Composite::new("Doc", "application/x.test", dir.path(), None, None);

    add_component(&composite, sources.path(), "c1", "a.bin", b"abcd");
    composite.commit_changes().unwrap();
    push_composite(&composite, &session, &TransferOptions::default())
        .await
        .unwrap();
    composite.accept_push().unwrap();

    // Another client advances the server copy.
    session.bump_manifest_etag(&composite.href().unwrap());

    let bigger = write_source(sources.path(), "src-c1-v2", b"abcdefgh");
    composite
        .current_mut()
        .unwrap()
        .update_component_from_file("c1", &bigger, true)
        .unwrap();
    composite.commit_changes().unwrap();
    let committed_before =
        std::fs::read(dir.path().join("manifest")).unwrap();

    let err = push_composite(&composite, &session, &TransferOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(kind_of(&err), SyncError::ConflictingChanges { .. }));

    // The journal survives for resumption, no pushed branch exists, and
    // the local state is untouched.
    let journal_path = dir.path().join("push/journal");
    assert!(journal_path.is_file());
    let journal: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&journal_path).unwrap()).unwrap();
    assert_eq!(journal["complete"], serde_json::json!(false));
    assert!(composite.pushed().is_none());
    assert_eq!(
        composite.current().unwrap().composite_state(),
        AssetState::Modified
    );
    assert_eq!(
        std::fs::read(dir.path().join("manifest")).unwrap(),
        committed_before
    );
}

#[tokio::test]
async fn pull_merge_resolve_combines_both_sides() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let sources = tempfile::tempdir().unwrap();
    let session = MockSession::new();

    // Client A creates the composite with c1 and pushes it.
    let a = Composite::new("Doc", "application/x.test", dir_a.path(), None, None);
    add_component(&a, sources.path(), "c1", "a.bin", b"abcd");
    a.commit_changes().unwrap();
    push_composite(&a, &session, &TransferOptions::default())
        .await
        .unwrap();
    a.accept_push().unwrap();
    let href = a.href().unwrap();

    // Client B pulls the composite and adds c2.
    let b = Composite::from_href(href.clone(), Some(a.composite_id()), dir_b.path());
    let pulled = pull_composite(&b, &session, &TransferOptions::default())
        .await
        .unwrap()
        .expect("a pulled branch");
    assert!(pulled.component_with_id("c1").is_some());
    b.resolve_pull(None).unwrap();
    add_component(&b, sources.path(), "c2", "b.bin", b"efgh");
    b.commit_changes().unwrap();
    push_composite(&b, &session, &TransferOptions::default())
        .await
        .unwrap();
    b.accept_push().unwrap();

    // Client A edits c1 locally to 12 bytes, then pulls.
    let twelve = write_source(sources.path(), "src-c1-v2", b"abcdefghijkl");
    a.current_mut()
        .unwrap()
        .update_component_from_file("c1", &twelve, true)
        .unwrap();

    let downloads_before = session.count("downloadComponent");
    let pulled = pull_composite(&a, &session, &TransferOptions::default())
        .await
        .unwrap()
        .expect("a pulled branch");
    // c1's content etag matches the local copy, so only c2 was fetched.
    assert_eq!(session.count("downloadComponent"), downloads_before + 1);
    assert_eq!(session.count("downloadComponent:c2"), 1);
    assert!(pulled.component_with_id("c2").is_some());

    // Merge: pulled state plus the local c1 edit.
    let mut merged = pulled.manifest().clone();
    merged
        .adopt_component_from("c1", a.current().unwrap().manifest())
        .unwrap();
    a.resolve_pull(Some(merged)).unwrap();

    let current = a.current().unwrap();
    let c1 = current.component_with_id("c1").unwrap();
    assert_eq!(c1.length, Some(12));
    assert_eq!(c1.state, AssetState::Modified);
    let c2 = current.component_with_id("c2").unwrap();
    assert_eq!(c2.state, AssetState::Unmodified);
    // c2's asset arrived in local storage.
    assert!(current.path_of_component("c2").unwrap().is_file());
    // Base now tracks the pulled server snapshot.
    let base = a.base().unwrap();
    assert_eq!(
        base.manifest().manifest_etag(),
        current.manifest().manifest_etag()
    );
    assert!(a.pulled().is_none());
}

#[tokio::test]
async fn duplicate_path_insert_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let sources = tempfile::tempdir().unwrap();
    let composite = Composite::new("Doc", "application/x.test", dir.path(), None, None);
    {
        let mut current = composite.current_mut().unwrap();
        current
            .add_child(compsync::Node::new("n1".into(), None, Some("node".into())), None)
            .unwrap();
    }
    add_component(&composite, sources.path(), "c1", "x", b"ab");
    composite
        .current_mut()
        .unwrap()
        .move_component_to("c1", Some("n1"))
        .unwrap();

    let source = write_source(sources.path(), "src-dup", b"cd");
    let err = composite
        .current_mut()
        .unwrap()
        .add_component_from_file(
            "dup",
            Some("c2".into()),
            "application/octet-stream",
            None,
            "x",
            Some("n1"),
            &source,
            true,
        )
        .unwrap_err();
    assert!(matches!(kind_of(&err), SyncError::DuplicatePath(p) if p == "/node/x"));
    assert!(composite
        .current()
        .unwrap()
        .component_with_id("c2")
        .is_none());
}

#[tokio::test]
async fn reclamation_keeps_only_the_latest_replacement() {
    let dir = tempfile::tempdir().unwrap();
    let sources = tempfile::tempdir().unwrap();
    let composite = Composite::new("Doc", "application/x.test", dir.path(), None, None);
    composite.set_auto_remove_unused_local_files(false);

    add_component(&composite, sources.path(), "c1", "a.bin", b"aaaa");
    for (name, bytes) in [
        ("v2", &b"bbbbbb"[..]),
        ("v3", &b"cccccccc"[..]),
        ("v4", &b"dddddddddd"[..]),
    ] {
        let source = write_source(sources.path(), name, bytes);
        composite
            .current_mut()
            .unwrap()
            .update_component_from_file("c1", &source, true)
            .unwrap();
    }
    composite.commit_changes().unwrap();

    let components_dir = dir.path().join("components");
    assert_eq!(std::fs::read_dir(&components_dir).unwrap().count(), 4);

    let freed = composite.remove_unused_local_files().unwrap();
    assert_eq!(freed, (4 + 6 + 8) as u64);
    assert_eq!(std::fs::read_dir(&components_dir).unwrap().count(), 1);
    let kept = composite
        .current()
        .unwrap()
        .path_of_component("c1")
        .unwrap();
    assert!(kept.is_file());
    assert_eq!(std::fs::metadata(&kept).unwrap().len(), 10);
}

// ---------------------------------------------------------------------
// Boundary behaviours
// ---------------------------------------------------------------------

#[tokio::test]
async fn crashed_push_resumes_from_the_journal() {
    let dir = tempfile::tempdir().unwrap();
    let sources = tempfile::tempdir().unwrap();
    let session = MockSession::new();
    let composite = Composite::new("Doc", "application/x.test", dir.path(), None, None);

    add_component(&composite, sources.path(), "c1", "a.bin", b"aaaa");
    add_component(&composite, sources.path(), "c2", "b.bin", b"bbbb");
    composite.commit_changes().unwrap();

    session.fail_next("updateManifest");
    let err = push_composite(&composite, &session, &TransferOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(kind_of(&err), SyncError::NetworkFailure { .. }));
    assert_eq!(session.count("uploadComponent"), 2);
    assert!(dir.path().join("push/journal").is_file());

    // The re-push consults the journal and uploads nothing again.
    push_composite(&composite, &session, &TransferOptions::default())
        .await
        .unwrap();
    assert_eq!(session.count("uploadComponent"), 2);
    assert_eq!(session.count("createComposite"), 1);
    composite.accept_push().unwrap();
    assert_eq!(
        composite.current().unwrap().composite_state(),
        AssetState::Unmodified
    );
}

#[tokio::test]
async fn unchanged_server_copy_pulls_as_no_change() {
    let dir = tempfile::tempdir().unwrap();
    let session = MockSession::new();
    let composite = Composite::new("Doc", "application/x.test", dir.path(), None, None);
    composite.commit_changes().unwrap();
    push_composite(&composite, &session, &TransferOptions::default())
        .await
        .unwrap();
    composite.accept_push().unwrap();

    let pulled = pull_composite(&composite, &session, &TransferOptions::default())
        .await
        .unwrap();
    assert!(pulled.is_none(), "304 means no pulled branch");
    assert!(composite.pulled().is_none());
}

#[tokio::test]
async fn minimal_pull_then_selective_download() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let sources = tempfile::tempdir().unwrap();
    let session = MockSession::new();

    let a = Composite::new("Doc", "application/x.test", dir_a.path(), None, None);
    add_component(&a, sources.path(), "c1", "a.bin", b"aaaa");
    add_component(&a, sources.path(), "c2", "b.bin", b"bbbb");
    a.commit_changes().unwrap();
    push_composite(&a, &session, &TransferOptions::default())
        .await
        .unwrap();
    a.accept_push().unwrap();

    let b = Composite::from_href(a.href().unwrap(), Some(a.composite_id()), dir_b.path());
    let pulled = pull_minimal_composite(&b, &session, &TransferOptions::default())
        .await
        .unwrap()
        .expect("a pulled branch");
    assert_eq!(session.count("downloadComponent"), 0);
    assert_eq!(pulled.all_components().len(), 2);
    // Bound on the server, but no local asset yet: a valid state.
    assert!(pulled.component_with_id("c1").unwrap().is_bound());

    let branch = compsync::download_components(
        &b,
        &session,
        BranchSelector::Pulled,
        Some(&["c1"]),
        &TransferOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(session.count("downloadComponent"), 1);
    assert!(branch.path_of_component("c1").unwrap().is_file());
    assert!(!branch
        .path_of_component("c2")
        .map(|p| p.is_file())
        .unwrap_or(false));
}

#[tokio::test]
async fn pull_of_unknown_composite_is_classified() {
    let dir = tempfile::tempdir().unwrap();
    let session = MockSession::new();
    let composite = Composite::from_href(
        Url::parse("https://service.example/composites/nope").unwrap(),
        None,
        dir.path(),
    );
    let err = pull_composite(&composite, &session, &TransferOptions::default())
        .await
        .unwrap_err();
    let kind = kind_of(&err);
    assert!(matches!(kind, SyncError::UnknownComposite { .. }));
    let context = kind.http_context().unwrap();
    assert_eq!(context.status, Some(404));
}

#[tokio::test]
async fn pending_delete_push_commits_the_delete() {
    let dir = tempfile::tempdir().unwrap();
    let sources = tempfile::tempdir().unwrap();
    let session = MockSession::new();
    let composite = Composite::new("Doc", "application/x.test", dir.path(), None, None);
    add_component(&composite, sources.path(), "c1", "a.bin", b"aaaa");
    composite.commit_changes().unwrap();
    push_composite(&composite, &session, &TransferOptions::default())
        .await
        .unwrap();
    composite.accept_push().unwrap();

    composite
        .current_mut()
        .unwrap()
        .mark_composite_for_deletion()
        .unwrap();
    composite.commit_changes().unwrap();
    push_composite(&composite, &session, &TransferOptions::default())
        .await
        .unwrap();
    assert_eq!(session.count("deleteComposite"), 1);
    composite.accept_push().unwrap();
    assert_eq!(
        composite.current().unwrap().composite_state(),
        AssetState::CommittedDelete
    );

    // A deleted composite refuses further pushes.
    let err = push_composite(&composite, &session, &TransferOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(kind_of(&err), SyncError::DeletedComposite));
}

#[tokio::test]
async fn snapshot_readers_are_isolated_from_accept() {
    let dir = tempfile::tempdir().unwrap();
    let sources = tempfile::tempdir().unwrap();
    let session = MockSession::new();
    let composite = Composite::new("Doc", "application/x.test", dir.path(), None, None);
    add_component(&composite, sources.path(), "c1", "a.bin", b"aaaa");
    composite.commit_changes().unwrap();
    push_composite(&composite, &session, &TransferOptions::default())
        .await
        .unwrap();

    let before = composite.current().unwrap();
    assert_eq!(before.composite_state(), AssetState::Modified);
    composite.accept_push().unwrap();
    // The snapshot taken before the accept still shows the old state; a
    // fresh one shows the new.
    assert_eq!(before.composite_state(), AssetState::Modified);
    assert_eq!(
        composite.current().unwrap().composite_state(),
        AssetState::Unmodified
    );
}

#[tokio::test]
async fn reopening_a_committed_composite_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let composite = Composite::new("Doc", "application/x.test", dir.path(), None, None);
    composite.commit_changes().unwrap();
    let save_id = composite
        .current()
        .unwrap()
        .manifest()
        .save_id()
        .unwrap()
        .to_owned();

    let reopened = Composite::open(dir.path()).unwrap();
    let current = reopened.current().unwrap();
    assert_eq!(current.name(), "Doc");
    assert_eq!(current.media_type(), "application/x.test");
    assert_eq!(current.manifest().save_id(), Some(save_id.as_str()));
    assert_eq!(reopened.composite_id(), composite.composite_id());
}

#[tokio::test]
async fn cancelled_push_surfaces_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let session = MockSession::new();
    let composite = Composite::new("Doc", "application/x.test", dir.path(), None, None);
    composite.commit_changes().unwrap();

    let options = TransferOptions::default();
    options.cancel.cancel();
    let err = push_composite(&composite, &session, &options)
        .await
        .unwrap_err();
    assert!(matches!(kind_of(&err), SyncError::Cancelled));
    assert_eq!(session.count("createComposite"), 0);
}
