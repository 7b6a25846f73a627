//! The transport contract the engine consumes, plus request priorities,
//! cancellation handles and HTTP status classification.
//!
//! The HTTP client itself (connection pooling, retry of transient 5xx,
//! auth token refresh, queue prioritisation) lives behind the
//! [`TransferSession`] trait. The engine only sees classified
//! [`SyncError`] kinds with the HTTP context attached.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use url::Url;

use crate::errors::{HttpContext, SyncError};
use crate::model::node::Component;
use crate::utils::json::Table;

/// Relative priority of a request within the session's queue.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub enum RequestPriority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    parent: Option<Arc<CancelState>>,
}

/// A cancellation handle. Handles form a tree: cancelling a token is
/// observed by every token derived from it via [`CancelToken::child`], so
/// cancelling a top-level transfer cascades to its outstanding requests.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that observes cancellation of `self` in addition to its
    /// own.
    pub fn child(&self) -> Self {
        Self {
            state: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                parent: Some(self.state.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        let mut state = Some(&self.state);
        while let Some(s) = state {
            if s.cancelled.load(Ordering::SeqCst) {
                return true;
            }
            state = s.parent.as_ref();
        }
        false
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(anyhow!(SyncError::Cancelled))
        } else {
            Ok(())
        }
    }
}

/// Identity of a composite to create on the server.
#[derive(Clone, Debug)]
pub struct CompositeDescriptor<'a> {
    pub composite_id: &'a str,
    pub name: &'a str,
    pub media_type: &'a str,
    /// Desired href; the server may assign one when absent. Creation is
    /// idempotent on the href.
    pub href: Option<&'a Url>,
}

#[derive(Clone, Debug)]
pub struct CompositeCreated {
    pub href: Url,
    pub etag: Option<String>,
}

/// Outcome of a conditional manifest fetch.
#[derive(Clone, Debug)]
pub enum ManifestDownload {
    /// The server copy still matches the `If-None-Match` etag (304).
    NotModified,
    Fetched { data: Vec<u8>, etag: String },
}

#[derive(Clone, Debug)]
pub struct ResourceUpdated {
    pub etag: String,
    pub version: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ComponentUploaded {
    pub etag: String,
    pub version: Option<String>,
    pub length: u64,
    /// Server-assigned links for the component (at least `self`).
    pub links: Table,
}

/// The session interface the push/pull engine drives. One implementation
/// speaks to the real object store over HTTP; tests use an in-memory one.
///
/// Implementations run up to N requests concurrently (1 ≤ N ≤ 5), observe
/// the [`CancelToken`] passed with each call, refresh auth tokens, retry
/// transient 5xx failures, and classify terminal failures into
/// [`SyncError`] kinds (see [`classify_status`]).
pub trait TransferSession: Send + Sync {
    /// Creates the composite if it does not exist yet. Idempotent on the
    /// href.
    fn create_composite(
        &self,
        descriptor: &CompositeDescriptor<'_>,
        priority: RequestPriority,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<CompositeCreated>> + Send;

    /// Deletes the composite, guarded by `If-Match` when an etag is
    /// given. A 404 counts as already-deleted success.
    fn delete_composite(
        &self,
        href: &Url,
        if_match: Option<&str>,
        priority: RequestPriority,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Fetches the composite manifest, with `If-None-Match` when an etag
    /// is given.
    fn get_manifest(
        &self,
        href: &Url,
        if_none_match: Option<&str>,
        priority: RequestPriority,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<ManifestDownload>> + Send;

    /// Uploads the manifest document, guarded by `If-Match` when an etag
    /// is given.
    fn update_manifest(
        &self,
        href: &Url,
        data: &[u8],
        if_match: Option<&str>,
        priority: RequestPriority,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<ResourceUpdated>> + Send;

    /// Uploads a component asset from a local file, guarded by `If-Match`
    /// when an etag is given.
    fn upload_component(
        &self,
        composite_href: &Url,
        component: &Component,
        source: &Path,
        if_match: Option<&str>,
        priority: RequestPriority,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<ComponentUploaded>> + Send;

    /// Downloads a component asset to a local file; returns the number of
    /// bytes written.
    fn download_component(
        &self,
        composite_href: &Url,
        component: &Component,
        dest: &Path,
        priority: RequestPriority,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Deletes a component asset, guarded by `If-Match` when an etag is
    /// given. A 404 counts as already-deleted success.
    fn delete_component(
        &self,
        composite_href: &Url,
        component: &Component,
        if_match: Option<&str>,
        priority: RequestPriority,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// What a failed request was after; 404 classification depends on it.
#[derive(Clone, Debug)]
pub enum RequestIntent {
    Manifest,
    ComponentAsset { id: String },
    Composite,
}

/// Maps a terminal HTTP status to the core error kind, attaching the
/// exchange context. Sessions call this at their boundary; retryable
/// failures should have been retried before classification.
pub fn classify_status(intent: RequestIntent, context: HttpContext) -> SyncError {
    match context.status {
        Some(400) => SyncError::BadRequest { context },
        Some(401) => SyncError::AuthenticationFailed { context },
        Some(403) => SyncError::RequestForbidden { context },
        Some(404) => match intent {
            RequestIntent::ComponentAsset { id } => {
                SyncError::MissingComponentAsset { id, context }
            }
            _ => SyncError::UnknownComposite { context },
        },
        Some(409) | Some(412) => SyncError::ConflictingChanges { context },
        Some(413) => SyncError::ExceededQuota { context },
        Some(status) if (500..600).contains(&status) => SyncError::NetworkFailure { context },
        Some(_) => SyncError::UnexpectedResponse { context },
        None => SyncError::NetworkFailure { context },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(status: u16) -> HttpContext {
        HttpContext::new(Url::parse("https://service.example/c/1").unwrap(), status)
    }

    #[test]
    fn statuses_map_to_core_kinds() {
        assert!(matches!(
            classify_status(RequestIntent::Manifest, context(401)),
            SyncError::AuthenticationFailed { .. }
        ));
        assert!(matches!(
            classify_status(RequestIntent::Manifest, context(404)),
            SyncError::UnknownComposite { .. }
        ));
        assert!(matches!(
            classify_status(
                RequestIntent::ComponentAsset { id: "c1".into() },
                context(404)
            ),
            SyncError::MissingComponentAsset { .. }
        ));
        assert!(matches!(
            classify_status(RequestIntent::Composite, context(412)),
            SyncError::ConflictingChanges { .. }
        ));
        assert!(matches!(
            classify_status(RequestIntent::Manifest, context(503)),
            SyncError::NetworkFailure { .. }
        ));
        assert!(matches!(
            classify_status(RequestIntent::Manifest, context(418)),
            SyncError::UnexpectedResponse { .. }
        ));
    }

    #[test]
    fn cancellation_cascades_to_children() {
        let root = CancelToken::new();
        let child = root.child();
        let grandchild = child.child();
        assert!(!grandchild.is_cancelled());

        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(grandchild.check().is_err());

        // A sibling tree is unaffected by a child's own cancellation.
        let a = CancelToken::new();
        let b = a.child();
        b.cancel();
        assert!(!a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
