//! In-memory [`DocumentStore`] with couch-style revision semantics.
//!
//! Backs unit tests across the workspace: writes conflict on stale
//! revisions, every write is logged to a changes feed, and the
//! unprocessed-jobs view is emulated over live documents.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use crate::couch::{ChangeRow, ChangesBatch, DbError, DocumentStore, RawViewResult};
use crate::document::{JobState, DOC_TYPE_JOB};

#[derive(Debug, Default)]
struct Inner {
    docs: BTreeMap<String, StoredDoc>,
    attachments: BTreeMap<(String, String), StoredAttachment>,
    designs: BTreeMap<String, Value>,
    changes_log: Vec<LoggedChange>,
    update_seq: u64,
    get_calls: u64,
}

#[derive(Debug, Clone)]
struct StoredDoc {
    rev_no: u64,
    body: Map<String, Value>,
}

#[derive(Debug, Clone)]
struct StoredAttachment {
    content_type: String,
    bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
struct LoggedChange {
    seq: u64,
    id: String,
    deleted: bool,
}

fn rev_string(rev_no: u64) -> String {
    format!("{rev_no}-mem")
}

impl Inner {
    fn log_change(&mut self, id: &str, deleted: bool) {
        self.update_seq += 1;
        self.changes_log.push(LoggedChange {
            seq: self.update_seq,
            id: id.to_string(),
            deleted,
        });
    }

    fn rendered(&self, id: &str, doc: &StoredDoc) -> Value {
        let mut body = doc.body.clone();
        body.insert("_id".to_string(), json!(id));
        body.insert("_rev".to_string(), json!(rev_string(doc.rev_no)));

        let stubs: Map<String, Value> = self
            .attachments
            .iter()
            .filter(|((doc_id, _), _)| doc_id == id)
            .map(|((_, name), attachment)| {
                (
                    name.clone(),
                    json!({
                        "content_type": attachment.content_type,
                        "length": attachment.bytes.len(),
                        "stub": true,
                    }),
                )
            })
            .collect();
        if !stubs.is_empty() {
            body.insert("_attachments".to_string(), Value::Object(stubs));
        }
        Value::Object(body)
    }
}

/// An in-memory document store for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job document in the given state; returns its revision.
    pub async fn seed_job(&self, id: &str, state: JobState) -> String {
        self.seed_doc(
            id,
            json!({"type": DOC_TYPE_JOB, "state": state.as_str()}),
        )
        .await
    }

    /// Insert an arbitrary document; returns its revision.
    pub async fn seed_doc(&self, id: &str, body: Value) -> String {
        let mut inner = self.inner.lock().await;
        let mut body = match body {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        body.remove("_id");
        body.remove("_rev");
        inner.docs.insert(id.to_string(), StoredDoc { rev_no: 1, body });
        inner.log_change(id, false);
        rev_string(1)
    }

    /// Attach bytes to a document without revision checking (test setup).
    pub async fn seed_attachment(&self, id: &str, name: &str, content_type: &str, bytes: &[u8]) {
        let mut inner = self.inner.lock().await;
        inner.attachments.insert(
            (id.to_string(), name.to_string()),
            StoredAttachment {
                content_type: content_type.to_string(),
                bytes: bytes.to_vec(),
            },
        );
        if let Some(doc) = inner.docs.get_mut(id) {
            doc.rev_no += 1;
        }
        inner.log_change(id, false);
    }

    /// Overwrite a job's state directly, modeling an external writer.
    pub async fn force_state(&self, id: &str, state: JobState) {
        let mut inner = self.inner.lock().await;
        if let Some(doc) = inner.docs.get_mut(id) {
            doc.body
                .insert("state".to_string(), json!(state.as_str()));
            doc.rev_no += 1;
        }
        inner.log_change(id, false);
    }

    /// The job state currently stored under `id`, if decodable.
    pub async fn state_of(&self, id: &str) -> Option<JobState> {
        let inner = self.inner.lock().await;
        let doc = inner.docs.get(id)?;
        serde_json::from_value(doc.body.get("state")?.clone()).ok()
    }

    /// The revision currently stored under `id`.
    pub async fn revision_of(&self, id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.docs.get(id).map(|doc| rev_string(doc.rev_no))
    }

    /// A stored document field, if present.
    pub async fn field_of(&self, id: &str, field: &str) -> Option<Value> {
        let inner = self.inner.lock().await;
        inner.docs.get(id)?.body.get(field).cloned()
    }

    /// Stored attachment bytes, if present.
    pub async fn attachment_bytes(&self, id: &str, name: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().await;
        inner
            .attachments
            .get(&(id.to_string(), name.to_string()))
            .map(|attachment| attachment.bytes.clone())
    }

    /// Number of installed design documents.
    pub async fn design_count(&self) -> usize {
        self.inner.lock().await.designs.len()
    }

    /// Number of `get_raw` calls served so far.
    pub async fn get_calls(&self) -> u64 {
        self.inner.lock().await.get_calls
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_raw(&self, id: &str) -> Result<Value, DbError> {
        let mut inner = self.inner.lock().await;
        inner.get_calls += 1;
        match inner.docs.get(id) {
            Some(doc) => Ok(inner.rendered(id, &doc.clone())),
            None => Err(DbError::NotFound(id.to_string())),
        }
    }

    async fn put_raw(&self, id: &str, body: &Value) -> Result<String, DbError> {
        let mut inner = self.inner.lock().await;
        let mut body = match body {
            Value::Object(map) => map.clone(),
            _ => return Err(DbError::UnexpectedStatus {
                status: 400,
                body: "document body must be an object".to_string(),
            }),
        };
        let supplied_rev = body
            .remove("_rev")
            .and_then(|v| v.as_str().map(str::to_string));
        body.remove("_id");
        let kept_attachments: Vec<String> = match body.remove("_attachments") {
            Some(Value::Object(stubs)) => stubs.keys().cloned().collect(),
            _ => Vec::new(),
        };

        let rev_no = match inner.docs.get(id) {
            Some(existing) => {
                if supplied_rev.as_deref() != Some(rev_string(existing.rev_no).as_str()) {
                    return Err(DbError::Conflict);
                }
                existing.rev_no + 1
            }
            None => 1,
        };

        // Like the real store: attachments not stubbed in the new
        // revision are dropped.
        inner
            .attachments
            .retain(|(doc_id, name), _| doc_id != id || kept_attachments.contains(name));

        inner.docs.insert(id.to_string(), StoredDoc { rev_no, body });
        inner.log_change(id, false);
        Ok(rev_string(rev_no))
    }

    async fn get_attachment(&self, id: &str, name: &str) -> Result<Vec<u8>, DbError> {
        let inner = self.inner.lock().await;
        inner
            .attachments
            .get(&(id.to_string(), name.to_string()))
            .map(|attachment| attachment.bytes.clone())
            .ok_or_else(|| DbError::NotFound(format!("{id}/{name}")))
    }

    async fn put_attachment(
        &self,
        id: &str,
        rev: &str,
        name: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<String, DbError> {
        let mut inner = self.inner.lock().await;
        let Some(doc) = inner.docs.get(id) else {
            return Err(DbError::NotFound(id.to_string()));
        };
        if rev != rev_string(doc.rev_no) {
            return Err(DbError::Conflict);
        }
        let rev_no = doc.rev_no + 1;
        inner.attachments.insert(
            (id.to_string(), name.to_string()),
            StoredAttachment {
                content_type: content_type.to_string(),
                bytes: body,
            },
        );
        if let Some(doc) = inner.docs.get_mut(id) {
            doc.rev_no = rev_no;
        }
        inner.log_change(id, false);
        Ok(rev_string(rev_no))
    }

    async fn query_view(&self, design: &str, view: &str) -> Result<RawViewResult, DbError> {
        let inner = self.inner.lock().await;
        if !inner.designs.contains_key(design) {
            return Err(DbError::NotFound(format!("_design/{design}/_view/{view}")));
        }
        let mut rows = Vec::new();
        for (id, doc) in &inner.docs {
            if doc.body.get("type").and_then(Value::as_str) != Some(DOC_TYPE_JOB) {
                continue;
            }
            let Some(state) = doc.body.get("state") else {
                continue;
            };
            let unprocessed = serde_json::from_value::<JobState>(state.clone())
                .map(JobState::is_unprocessed)
                .unwrap_or(false);
            if unprocessed {
                rows.push(json!({"id": id, "key": state, "value": id}));
            }
        }
        Ok(RawViewResult {
            total_rows: rows.len() as u64,
            rows,
        })
    }

    async fn put_design(&self, design: &str, body: &Value) -> Result<(), DbError> {
        let mut inner = self.inner.lock().await;
        inner.designs.insert(design.to_string(), body.clone());
        Ok(())
    }

    async fn changes(
        &self,
        since: Option<&str>,
        _timeout: Duration,
    ) -> Result<ChangesBatch, DbError> {
        let inner = self.inner.lock().await;
        let since: u64 = since.and_then(|s| s.parse().ok()).unwrap_or(0);
        let results: Vec<ChangeRow> = inner
            .changes_log
            .iter()
            .filter(|change| change.seq > since)
            .map(|change| ChangeRow {
                id: change.id.clone(),
                deleted: change.deleted,
            })
            .collect();
        let last_seq = inner.update_seq.max(since);
        Ok(ChangesBatch {
            results,
            last_seq: last_seq.to_string(),
        })
    }

    async fn last_seq(&self) -> Result<String, DbError> {
        Ok(self.inner.lock().await.update_seq.to_string())
    }
}
