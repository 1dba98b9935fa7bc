use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::couch::{DbError, DocumentStore};

/// Discriminator value marking a document as a job.
pub const DOC_TYPE_JOB: &str = "job";

/// Attachment holding the photo to be restyled.
pub const SOURCE_IMAGE_ATTACHMENT: &str = "source_image";
/// Attachment holding the style reference image.
pub const STYLE_IMAGE_ATTACHMENT: &str = "style_image";
/// Attachment holding the rendered output, present only after success.
pub const RESULT_IMAGE_ATTACHMENT: &str = "result_image";

const MAX_EDIT_RETRIES: u32 = 5;

/// Lifecycle state of a job document.
///
/// Transitions form a line with one fork at the end, plus a single
/// rescue edge `BeingProcessed -> ReadyToProcess` owned by the queue
/// supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Created but attachments are still being uploaded.
    #[serde(rename = "NOT_READY_TO_PROCESS")]
    NotReadyToProcess,
    /// Both input attachments present; waiting for a worker.
    #[serde(rename = "READY_TO_PROCESS")]
    ReadyToProcess,
    /// A worker has picked the job up.
    #[serde(rename = "BEING_PROCESSED")]
    BeingProcessed,
    /// The rendered result has been attached.
    #[serde(rename = "PROCESSING_SUCCESSFUL")]
    ProcessingSuccessful,
    /// Processing failed; `error_message` says why.
    #[serde(rename = "PROCESSING_FAILED")]
    ProcessingFailed,
}

impl JobState {
    /// The wire form of the state, as stored in the document.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::NotReadyToProcess => "NOT_READY_TO_PROCESS",
            JobState::ReadyToProcess => "READY_TO_PROCESS",
            JobState::BeingProcessed => "BEING_PROCESSED",
            JobState::ProcessingSuccessful => "PROCESSING_SUCCESSFUL",
            JobState::ProcessingFailed => "PROCESSING_FAILED",
        }
    }

    /// Whether the job has finished, one way or the other.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::ProcessingSuccessful | JobState::ProcessingFailed
        )
    }

    /// Whether the job still counts toward queue depth.
    pub fn is_unprocessed(self) -> bool {
        !self.is_terminal()
    }
}

/// Attachment metadata as the store reports it, kept untyped so
/// unknown fields round-trip through writes.
pub type Attachments = BTreeMap<String, Value>;

/// The minimal decoding used to discriminate job documents from the
/// rest of the bucket without a second fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct TypedDocument {
    /// Document id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Current revision token.
    #[serde(rename = "_rev")]
    pub revision: String,
    /// Type discriminator; empty when absent.
    #[serde(rename = "type", default)]
    pub doc_type: String,
}

impl TypedDocument {
    /// Whether the document is a job.
    pub fn is_job(&self) -> bool {
        self.doc_type == DOC_TYPE_JOB
    }
}

/// A style-transfer job document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDocument {
    /// Document id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Revision token; changes on every successful write.
    #[serde(rename = "_rev")]
    pub revision: String,
    /// Type discriminator, always [`DOC_TYPE_JOB`].
    #[serde(rename = "type")]
    pub doc_type: String,
    /// Lifecycle state.
    pub state: JobState,
    /// Attachment metadata by name.
    #[serde(
        rename = "_attachments",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub attachments: Attachments,
    /// Why processing failed; non-empty iff the state is failed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    /// Combined stdout and stderr captured from the external renderer.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub std_out_and_err: String,
    /// Owner id used to address push notifications.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
    /// Owner's device token for push notifications.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner_device_token: String,
}

impl JobDocument {
    /// Fetch and decode a job document.
    pub async fn load(db: &dyn DocumentStore, id: &str) -> Result<Self, DbError> {
        let raw = db.get_raw(id).await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Replace this copy with the store's current revision.
    pub async fn refresh_from_db(&mut self, db: &dyn DocumentStore) -> Result<(), DbError> {
        *self = Self::load(db, &self.id).await?;
        Ok(())
    }

    /// Whether the job is waiting for a worker.
    pub fn is_ready_to_process(&self) -> bool {
        self.state == JobState::ReadyToProcess
    }

    /// Whether a worker has claimed the job.
    pub fn is_being_processed(&self) -> bool {
        self.state == JobState::BeingProcessed
    }

    /// Whether an attachment with the given name is recorded.
    pub fn has_attachment(&self, name: &str) -> bool {
        self.attachments.contains_key(name)
    }

    /// Move the job to `new_state` with conflict retry.
    pub async fn update_state(
        &mut self,
        db: &dyn DocumentStore,
        new_state: JobState,
    ) -> Result<bool, DbError> {
        edit_retry(
            db,
            self,
            |doc| doc.state = new_state,
            |doc| doc.state == new_state,
        )
        .await
    }

    /// Record a failure message with conflict retry. An empty message
    /// is a no-op.
    pub async fn set_error_message(
        &mut self,
        db: &dyn DocumentStore,
        message: &str,
    ) -> Result<bool, DbError> {
        if message.is_empty() {
            return Ok(false);
        }
        edit_retry(
            db,
            self,
            |doc| doc.error_message = message.to_string(),
            |doc| doc.error_message == message,
        )
        .await
    }

    /// Record the renderer's captured output with conflict retry. Empty
    /// output is a no-op.
    pub async fn set_std_out_and_err(
        &mut self,
        db: &dyn DocumentStore,
        text: &str,
    ) -> Result<bool, DbError> {
        if text.is_empty() {
            return Ok(false);
        }
        edit_retry(
            db,
            self,
            |doc| doc.std_out_and_err = text.to_string(),
            |doc| doc.std_out_and_err == text,
        )
        .await
    }

    /// Download an attachment's bytes.
    pub async fn retrieve_attachment(
        &self,
        db: &dyn DocumentStore,
        name: &str,
    ) -> Result<Vec<u8>, DbError> {
        db.get_attachment(&self.id, name).await
    }

    /// Upload an attachment against the current revision and pick up
    /// the store's view of the document afterwards, so later writes
    /// carry the new attachment's stub.
    pub async fn add_attachment(
        &mut self,
        db: &dyn DocumentStore,
        name: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<(), DbError> {
        let rev = db
            .put_attachment(&self.id, &self.revision, name, content_type, body)
            .await?;
        self.revision = rev;
        self.refresh_from_db(db).await
    }
}

/// Optimistic read-modify-write against a job document.
///
/// Applies `mutate`, writes, and on a revision conflict refreshes the
/// document and tries again. If after a refresh `done` already holds,
/// another writer raced us to the same result and the edit reports
/// success without writing. Gives up with
/// [`DbError::ConflictExhausted`] after a bounded number of attempts.
pub async fn edit_retry<M, D>(
    db: &dyn DocumentStore,
    doc: &mut JobDocument,
    mut mutate: M,
    done: D,
) -> Result<bool, DbError>
where
    M: FnMut(&mut JobDocument),
    D: Fn(&JobDocument) -> bool,
{
    for attempt in 1..=MAX_EDIT_RETRIES {
        mutate(doc);
        let body = serde_json::to_value(&*doc)?;
        match db.put_raw(&doc.id, &body).await {
            Ok(rev) => {
                doc.revision = rev;
                return Ok(true);
            }
            Err(DbError::Conflict) => {
                doc.refresh_from_db(db).await?;
                if done(doc) {
                    return Ok(true);
                }
                tracing::debug!(id = %doc.id, attempt, "write conflict, retrying");
            }
            Err(err) => return Err(err),
        }
    }
    Err(DbError::ConflictExhausted {
        attempts: MAX_EDIT_RETRIES,
    })
}
