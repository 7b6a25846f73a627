//! Client-side synchronization for composite documents.
//!
//! A *composite* is a structured document: a hierarchical manifest plus a
//! set of named binary component assets, stored both locally on disk and
//! remotely on an HTTP object store. This crate lets an application edit
//! a composite locally, reconcile it against the server copy, and push
//! local changes back while detecting and reporting conflicts.
//!
//! The three load-bearing pieces:
//!
//! * the manifest DOM ([`Manifest`], viewed through [`Branch`] /
//!   [`MutableBranch`]) with strict identity and path invariants across
//!   the four branches of a [`Composite`] (current, pulled, pushed,
//!   base);
//! * copy-on-write local storage: every new component version is a new
//!   GUID-named file, so edits never race an in-flight transfer, and
//!   reference counting across branches drives reclamation;
//! * the transfer engine ([`push_composite`] / [`pull_composite`]) with a
//!   persistent push journal for resumption after partial failure and
//!   etag-based optimistic concurrency against the server, behind the
//!   [`TransferSession`] transport contract.
//!
//! The HTTP client itself is out of scope: implement [`TransferSession`]
//! for your transport (auth, retry, connection pooling live there).

#![allow(clippy::result_large_err)]

pub use crate::errors::{HttpContext, SyncError};
pub use crate::model::manifest::{CopyOptions, CopyOutcome};
pub use crate::model::node::{Component, Node};
pub use crate::model::{AssetState, Branch, Composite, Manifest, MutableBranch};
pub use crate::transfer::session::{
    classify_status, CancelToken, CompositeCreated, CompositeDescriptor, ComponentUploaded,
    ManifestDownload, RequestIntent, RequestPriority, ResourceUpdated, TransferSession,
};
pub use crate::transfer::{
    download_components, pull_composite, pull_minimal_composite, push_composite, BranchSelector,
    TransferOptions,
};

pub mod errors;
pub mod model;
mod storage;
pub mod transfer;
pub mod utils;
