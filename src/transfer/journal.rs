//! The persistent push journal.
//!
//! A push records every successful component upload here, durably, before
//! the next upload starts. A crashed or cancelled push leaves the journal
//! behind; the next push consults it and skips uploads whose recorded
//! source path still matches, so only the remaining work is redone. The
//! journal is deleted when the push is accepted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::SyncError;
use crate::model::node::Component;
use crate::model::Manifest;
use crate::utils;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
struct JournalDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    composite_href: Option<String>,
    composite_created: bool,
    composite_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    composite_etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest_etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_branch_etag: Option<String>,
    complete: bool,
    components: HashMap<String, JournalEntry>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct JournalEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    source_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

#[derive(Debug)]
pub struct PushJournal {
    file_path: PathBuf,
    doc: Mutex<JournalDoc>,
}

impl PushJournal {
    /// Opens the journal at `file_path`, starting empty when the file
    /// does not exist. A corrupt journal is replaced by an empty one:
    /// losing it only costs re-uploads, never correctness.
    pub(crate) fn load_or_new(file_path: &Path) -> Self {
        let doc = if utils::is_file(file_path) {
            match std::fs::read(file_path)
                .map_err(anyhow::Error::new)
                .and_then(|data| Ok(serde_json::from_slice::<JournalDoc>(&data)?))
            {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(
                        "discarding unreadable push journal '{}': {e:#}",
                        file_path.display()
                    );
                    JournalDoc::default()
                }
            }
        } else {
            JournalDoc::default()
        };
        Self {
            file_path: file_path.to_owned(),
            doc: Mutex::new(doc),
        }
    }

    /// Reads an existing journal; fails when the file is missing or does
    /// not parse.
    pub(crate) fn from_file(file_path: &Path) -> Result<Self> {
        let data = std::fs::read(file_path).with_context(|| SyncError::FileDoesNotExist {
            path: PathBuf::from(file_path),
        })?;
        if data.is_empty() {
            return Err(anyhow!(SyncError::MissingJsonData));
        }
        let doc: JournalDoc = serde_json::from_slice(&data).map_err(|e| {
            anyhow!(SyncError::InvalidJournal {
                details: e.to_string(),
            })
        })?;
        Ok(Self {
            file_path: file_path.to_owned(),
            doc: Mutex::new(doc),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn is_complete(&self) -> bool {
        self.doc.lock().unwrap().complete
    }

    /// Whether the journal holds nothing worth keeping.
    pub fn is_empty(&self) -> bool {
        let doc = self.doc.lock().unwrap();
        !doc.composite_created
            && !doc.composite_deleted
            && !doc.complete
            && doc.manifest_etag.is_none()
            && doc.components.is_empty()
    }

    pub fn composite_created(&self) -> bool {
        self.doc.lock().unwrap().composite_created
    }

    pub fn composite_deleted(&self) -> bool {
        self.doc.lock().unwrap().composite_deleted
    }

    pub fn composite_href(&self) -> Option<String> {
        self.doc.lock().unwrap().composite_href.clone()
    }

    pub fn current_branch_etag(&self) -> Option<String> {
        self.doc.lock().unwrap().current_branch_etag.clone()
    }

    pub fn manifest_etag(&self) -> Option<String> {
        self.doc.lock().unwrap().manifest_etag.clone()
    }

    /// Drops journaled state that describes a different baseline: another
    /// composite href, or uploads recorded against a different committed
    /// manifest revision. Entries from such a journal must not be
    /// replayed.
    pub(crate) fn reset_if_stale(
        &self,
        href: Option<&str>,
        current_branch_etag: Option<&str>,
    ) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        let href_mismatch = match (&doc.composite_href, href) {
            (Some(recorded), Some(actual)) => recorded != actual,
            _ => false,
        };
        let etag_mismatch = match (&doc.current_branch_etag, current_branch_etag) {
            (Some(recorded), Some(actual)) => recorded != actual,
            (Some(_), None) => true,
            _ => false,
        };
        if href_mismatch || etag_mismatch {
            warn!(
                "discarding stale push journal '{}'",
                self.file_path.display()
            );
            *doc = JournalDoc::default();
            self.persist(&doc)?;
        }
        Ok(())
    }

    pub(crate) fn record_current_branch_etag(&self, etag: Option<&str>) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        doc.current_branch_etag = etag.map(str::to_owned);
        self.persist(&doc)
    }

    pub(crate) fn set_composite_href(&self, href: &str) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        doc.composite_href = Some(href.to_owned());
        self.persist(&doc)
    }

    pub(crate) fn record_composite_created(&self, etag: Option<&str>) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        doc.composite_created = true;
        doc.composite_etag = etag.map(str::to_owned);
        self.persist(&doc)
    }

    pub(crate) fn record_composite_deleted(&self) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        doc.composite_deleted = true;
        self.persist(&doc)
    }

    /// Records a successful component upload. Durable before returning,
    /// so a crash after this point will not repeat the upload.
    pub(crate) fn record_uploaded_component(
        &self,
        component: &Component,
        source_path: &Path,
    ) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        doc.components.insert(
            component.id.clone(),
            JournalEntry {
                etag: component.etag.clone(),
                length: component.length,
                source_path: source_path.to_string_lossy().into_owned(),
                version: component.version.clone(),
            },
        );
        self.persist(&doc)
    }

    /// Returns a copy of `component` with the journaled server fields
    /// filled in, if this component was already uploaded from the same
    /// source path. A recorded entry whose source path no longer matches
    /// is invalidated: the file was replaced since that upload.
    pub(crate) fn uploaded_component(
        &self,
        component: &Component,
        source_path: &Path,
    ) -> Result<Option<Component>> {
        let mut doc = self.doc.lock().unwrap();
        let Some(entry) = doc.components.get(&component.id) else {
            return Ok(None);
        };
        if entry.source_path != source_path.to_string_lossy() {
            doc.components.remove(&component.id);
            self.persist(&doc)?;
            return Ok(None);
        }
        let mut updated = component.clone();
        updated.etag = entry.etag.clone();
        updated.length = entry.length;
        updated.version = entry.version.clone();
        Ok(Some(updated))
    }

    /// Forgets any journaled state for the component.
    pub(crate) fn clear_component(&self, component_id: &str) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        if doc.components.remove(component_id).is_some() {
            self.persist(&doc)?;
        }
        Ok(())
    }

    /// Records the uploaded manifest etag and marks the push complete.
    pub(crate) fn record_uploaded_manifest(&self, etag: &str) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        doc.manifest_etag = Some(etag.to_owned());
        doc.complete = true;
        self.persist(&doc)
    }

    pub(crate) fn record_complete(&self) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        doc.complete = true;
        self.persist(&doc)
    }

    pub fn clear_push_completed(&self) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        doc.complete = false;
        self.persist(&doc)
    }

    /// Carries the journaled manifest etag over to `manifest`. Returns
    /// false when the journal has none.
    pub(crate) fn update_manifest_with_journal_etag(&self, manifest: &mut Manifest) -> bool {
        let doc = self.doc.lock().unwrap();
        match &doc.manifest_etag {
            Some(etag) => {
                manifest.set_manifest_etag(Some(etag.clone()));
                true
            }
            None => false,
        }
    }

    /// Deletes the journal file. Fine to call when the file is absent.
    pub(crate) fn delete_file(&self) -> Result<()> {
        if utils::is_file(&self.file_path) {
            utils::remove_file("push journal", &self.file_path)?;
        }
        Ok(())
    }

    fn persist(&self, doc: &JournalDoc) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            utils::ensure_dir_exists("push", parent)?;
        }
        let data = serde_json::to_vec_pretty(doc)?;
        utils::write_file_atomic("push journal", &self.file_path, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::node::Component;

    fn component(id: &str) -> Component {
        let mut c = Component::new(id.into(), "a.bin".into(), None, None);
        c.etag = Some("E1".into());
        c.length = Some(4);
        c.version = Some("1".into());
        c
    }

    #[test]
    fn records_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("push/journal");

        let journal = PushJournal::load_or_new(&path);
        assert!(journal.is_empty());
        journal.record_current_branch_etag(Some("CB1")).unwrap();
        journal.set_composite_href("https://service.example/c/1").unwrap();
        journal
            .record_uploaded_component(&component("c1"), Path::new("/assets/a1.bin"))
            .unwrap();

        let reloaded = PushJournal::from_file(&path).unwrap();
        assert!(!reloaded.is_empty());
        assert!(!reloaded.is_complete());
        assert_eq!(reloaded.current_branch_etag().as_deref(), Some("CB1"));
        let hit = reloaded
            .uploaded_component(&component("c1"), Path::new("/assets/a1.bin"))
            .unwrap()
            .expect("journal hit");
        assert_eq!(hit.etag.as_deref(), Some("E1"));
        assert_eq!(hit.length, Some(4));
    }

    #[test]
    fn source_path_mismatch_invalidates_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("push/journal");

        let journal = PushJournal::load_or_new(&path);
        journal
            .record_uploaded_component(&component("c1"), Path::new("/assets/a1.bin"))
            .unwrap();
        // The asset was replaced under a new path since the upload.
        let miss = journal
            .uploaded_component(&component("c1"), Path::new("/assets/a2.bin"))
            .unwrap();
        assert!(miss.is_none());
        // The invalidation is durable.
        let reloaded = PushJournal::from_file(&path).unwrap();
        let miss = reloaded
            .uploaded_component(&component("c1"), Path::new("/assets/a1.bin"))
            .unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn corrupt_journals_are_replaced_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("push/journal");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{ not json").unwrap();

        let journal = PushJournal::load_or_new(&path);
        assert!(journal.is_empty());

        let err = PushJournal::from_file(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::InvalidJournal { .. })
        ));
    }

    #[test]
    fn stale_journals_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("push/journal");

        let journal = PushJournal::load_or_new(&path);
        journal.record_current_branch_etag(Some("CB1")).unwrap();
        journal
            .record_uploaded_component(&component("c1"), Path::new("/assets/a1.bin"))
            .unwrap();

        let reloaded = PushJournal::load_or_new(&path);
        reloaded
            .reset_if_stale(None, Some("CB2"))
            .unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn completion_is_recorded_with_the_manifest_etag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("push/journal");

        let journal = PushJournal::load_or_new(&path);
        journal.record_uploaded_manifest("M2").unwrap();
        assert!(journal.is_complete());
        assert_eq!(journal.manifest_etag().as_deref(), Some("M2"));

        journal.clear_push_completed().unwrap();
        assert!(!journal.is_complete());

        journal.delete_file().unwrap();
        assert!(!path.exists());
    }
}
