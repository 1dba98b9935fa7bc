#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Document-store abstraction and job model for the `restyle` worker daemon.

/// Sync Gateway document-store client and the `DocumentStore` trait.
pub mod couch;
/// Job document model, state machine, and optimistic updates.
pub mod document;
/// In-memory `DocumentStore` for tests (feature `testing`).
#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use couch::{
    ChangeRow, ChangesBatch, DbError, DocumentStore, RawViewResult, SyncGateway,
};
pub use document::{
    edit_retry, Attachments, JobDocument, JobState, TypedDocument, DOC_TYPE_JOB,
    RESULT_IMAGE_ATTACHMENT, SOURCE_IMAGE_ATTACHMENT, STYLE_IMAGE_ATTACHMENT,
};
