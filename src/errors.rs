#![allow(clippy::large_enum_variant)]

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error as ThisError;
use url::Url;

/// Context captured from an HTTP exchange that failed. Attached to the
/// transport variants of [`SyncError`] so callers can log the request url,
/// status, response headers and body of the offending exchange.
#[derive(Clone, Debug, Default)]
pub struct HttpContext {
    pub url: Option<Url>,
    pub status: Option<u16>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpContext {
    pub fn new(url: Url, status: u16) -> Self {
        Self {
            url: Some(url),
            status: Some(status),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }
}

impl fmt::Display for HttpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.url, self.status) {
            (Some(url), Some(status)) => write!(f, "{status} from {url}"),
            (Some(url), None) => write!(f, "no response from {url}"),
            (None, Some(status)) => write!(f, "{status}"),
            (None, None) => write!(f, "no response"),
        }
    }
}

#[derive(ThisError, Debug)]
pub enum SyncError {
    // Validation
    #[error("invalid path segment: '{0}'")]
    InvalidPath(String),
    #[error("duplicate id: '{0}'")]
    DuplicateId(String),
    #[error("duplicate absolute path: '{0}'")]
    DuplicatePath(String),
    #[error("unknown node or component id: '{0}'")]
    UnknownId(String),
    #[error("invalid manifest: {details}")]
    InvalidManifest { details: String },
    #[error("invalid manifest in local storage: {details}")]
    InvalidLocalManifest { details: String },
    #[error("invalid manifest received from server: {details}")]
    InvalidRemoteManifest { details: String },
    #[error("empty JSON payload")]
    MissingJsonData,

    // Local storage
    #[error("could not read manifest file: '{}'", .path.display())]
    ManifestReadFailure { path: PathBuf },
    #[error("could not write manifest file: '{}'", .path.display())]
    ManifestWriteFailure { path: PathBuf },
    #[error(
        "could not write manifest file after upload: '{}'; local copy is out of sync with the server until the next pull",
        .path.display()
    )]
    ManifestFinalWriteFailure { path: PathBuf },
    #[error("could not read component asset: '{}'", .path.display())]
    ComponentReadFailure { path: PathBuf },
    #[error("could not write component asset: '{}'", .path.display())]
    ComponentWriteFailure { path: PathBuf },
    #[error("file does not exist: '{}'", .path.display())]
    FileDoesNotExist { path: PathBuf },
    #[error("could not read file: '{}'", .path.display())]
    FileReadFailure { path: PathBuf },
    #[error("could not write file: '{}'", .path.display())]
    FileWriteFailure { path: PathBuf },
    #[error("component '{id}' has an invalid local storage path")]
    InvalidLocalStoragePath { id: String },
    #[error("cannot remove local file of modified component '{id}'")]
    CannotRemoveModifiedComponent { id: String },
    #[error("could not store base manifest: '{}'", .path.display())]
    FailedToStoreBaseManifest { path: PathBuf },

    // Sync
    #[error("both the local copy and the server copy have been modified ({context})")]
    ConflictingChanges { context: HttpContext },
    #[error("a composite already exists at '{href}'")]
    CompositeAlreadyExists { href: Url },
    #[error("composite does not exist on the server ({context})")]
    UnknownComposite { context: HttpContext },
    #[error("composite has been deleted; reset its binding before pushing again")]
    DeletedComposite,
    #[error("composite has no assigned href")]
    CompositeHrefUnassigned,
    #[error("component asset '{id}' is missing on the server ({context})")]
    MissingComponentAsset { id: String, context: HttpContext },
    #[error("composite on the server has no manifest")]
    MissingManifest,

    // Journal
    #[error("push journal is not valid: {details}")]
    InvalidJournal { details: String },
    #[error("push journal is incomplete")]
    IncompleteJournal,

    // Transport
    #[error("bad request ({context})")]
    BadRequest { context: HttpContext },
    #[error("network failure ({context})")]
    NetworkFailure { context: HttpContext },
    #[error("no network connection")]
    Offline,
    #[error("operation was cancelled")]
    Cancelled,
    #[error("authentication failed ({context})")]
    AuthenticationFailed { context: HttpContext },
    #[error("request forbidden ({context})")]
    RequestForbidden { context: HttpContext },
    #[error("service is disconnected")]
    ServiceDisconnected,
    #[error("service is invalidating and no longer accepts requests")]
    ServiceInvalidating,
    #[error("unexpected response from server ({context})")]
    UnexpectedResponse { context: HttpContext },
    #[error("unsupported protocol in url '{url}'")]
    UnsupportedProtocol { url: Url },
    #[error("upload would exceed the account quota ({context})")]
    ExceededQuota { context: HttpContext },
}

impl SyncError {
    /// The HTTP context of a transport-classified error, if it carries one.
    pub fn http_context(&self) -> Option<&HttpContext> {
        use SyncError::*;
        match self {
            ConflictingChanges { context }
            | UnknownComposite { context }
            | MissingComponentAsset { context, .. }
            | BadRequest { context }
            | NetworkFailure { context }
            | AuthenticationFailed { context }
            | RequestForbidden { context }
            | UnexpectedResponse { context }
            | ExceededQuota { context } => Some(context),
            _ => None,
        }
    }
}
