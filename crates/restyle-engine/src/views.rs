use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use restyle_core::{DbError, DocumentStore, JobState, RawViewResult, DOC_TYPE_JOB};

/// Name of the design document owned by this module.
pub const DESIGN_DOC_NAME: &str = "unprocessed_jobs";
/// Name of its sole view.
pub const VIEW_NAME: &str = "unprocessed_jobs";

// Immediately re-querying a freshly installed view can race the
// indexer and come back as a 500 `view_undefined`.
const VIEW_WARM_DELAY: Duration = Duration::from_secs(10);

/// One decoded row of the unprocessed-jobs view.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ViewRow {
    /// Job document id.
    pub id: String,
    /// The job's state at indexing time.
    pub key: JobState,
}

/// The unprocessed-jobs view result.
#[derive(Debug, Clone)]
pub struct UnprocessedJobs {
    /// Total number of unfinished jobs (the queue depth).
    pub total_rows: u64,
    /// Decoded rows; malformed rows are dropped.
    pub rows: Vec<ViewRow>,
}

/// Owns the unprocessed-jobs view: installs it on demand and queries it.
pub struct ViewManager {
    db: Arc<dyn DocumentStore>,
}

impl ViewManager {
    /// A manager querying through the given store.
    pub fn new(db: Arc<dyn DocumentStore>) -> Self {
        Self { db }
    }

    /// Query the view, installing it first if the store has never seen
    /// it. After an install the indexer gets a warm-up pause, then the
    /// query is retried exactly once; any other failure surfaces.
    pub async fn query_unprocessed(&self) -> Result<UnprocessedJobs, DbError> {
        let raw = match self.db.query_view(DESIGN_DOC_NAME, VIEW_NAME).await {
            Ok(raw) => raw,
            Err(DbError::NotFound(_)) => {
                tracing::info!("unprocessed-jobs view missing, installing design document");
                self.install().await?;
                tokio::time::sleep(VIEW_WARM_DELAY).await;
                self.db.query_view(DESIGN_DOC_NAME, VIEW_NAME).await?
            }
            Err(err) => return Err(err),
        };
        Ok(decode_result(raw))
    }

    /// Install (or overwrite) the design document. Idempotent.
    pub async fn install(&self) -> Result<(), DbError> {
        self.db
            .put_design(DESIGN_DOC_NAME, &design_document())
            .await
    }
}

fn design_document() -> Value {
    json!({
        "views": {
            VIEW_NAME: {
                "map": map_function(),
            }
        }
    })
}

// The map function is assembled from the same constants the Rust code
// matches on, so the two can never drift apart.
fn map_function() -> String {
    format!(
        "function (doc, meta) {{ if (doc.type != '{doc_type}') {{ return; }} \
         if (doc.state == '{s1}' || doc.state == '{s2}' || doc.state == '{s3}') \
         {{ emit(doc.state, meta.id); }}}}",
        doc_type = DOC_TYPE_JOB,
        s1 = JobState::NotReadyToProcess.as_str(),
        s2 = JobState::ReadyToProcess.as_str(),
        s3 = JobState::BeingProcessed.as_str(),
    )
}

fn decode_result(raw: RawViewResult) -> UnprocessedJobs {
    let mut rows = Vec::with_capacity(raw.rows.len());
    for value in raw.rows {
        match serde_json::from_value::<ViewRow>(value.clone()) {
            Ok(row) => rows.push(row),
            Err(err) => {
                tracing::warn!(error = %err, row = %value, "skipping malformed view row")
            }
        }
    }
    UnprocessedJobs {
        total_rows: raw.total_rows,
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use restyle_core::memory::MemoryStore;

    #[test]
    fn map_function_names_every_unprocessed_state() {
        let map = map_function();
        assert!(map.contains("'job'"));
        assert!(map.contains("NOT_READY_TO_PROCESS"));
        assert!(map.contains("READY_TO_PROCESS"));
        assert!(map.contains("BEING_PROCESSED"));
        assert!(!map.contains("PROCESSING_SUCCESSFUL"));
    }

    #[test]
    fn malformed_rows_are_dropped_not_fatal() {
        let raw = RawViewResult {
            total_rows: 3,
            rows: vec![
                json!({"id": "j1", "key": "READY_TO_PROCESS", "value": "j1"}),
                json!({"key": "BEING_PROCESSED"}),
                json!({"id": "j3", "key": "NO_SUCH_STATE"}),
            ],
        };
        let decoded = decode_result(raw);
        assert_eq!(decoded.total_rows, 3);
        assert_eq!(
            decoded.rows,
            vec![ViewRow {
                id: "j1".to_string(),
                key: JobState::ReadyToProcess,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_query_installs_the_view_and_retries_once() {
        let db = Arc::new(MemoryStore::new());
        db.seed_job("j1", JobState::ReadyToProcess).await;
        let views = ViewManager::new(db.clone());

        let result = views.query_unprocessed().await.expect("query");
        assert_eq!(result.total_rows, 1);
        assert_eq!(result.rows[0].id, "j1");
        assert_eq!(db.design_count().await, 1);

        // A second query neither reinstalls nor duplicates.
        let again = views.query_unprocessed().await.expect("query");
        assert_eq!(again.total_rows, 1);
        assert_eq!(db.design_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_store_queries_to_zero() {
        let db = Arc::new(MemoryStore::new());
        let views = ViewManager::new(db.clone());

        let result = views.query_unprocessed().await.expect("query");
        assert_eq!(result.total_rows, 0);
        assert!(result.rows.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_jobs_do_not_count_toward_queue_depth() {
        let db = Arc::new(MemoryStore::new());
        db.seed_job("j1", JobState::BeingProcessed).await;
        db.seed_job("j2", JobState::ProcessingSuccessful).await;
        db.seed_job("j3", JobState::ProcessingFailed).await;
        let views = ViewManager::new(db.clone());

        let result = views.query_unprocessed().await.expect("query");
        assert_eq!(result.total_rows, 1);
        assert_eq!(result.rows[0].key, JobState::BeingProcessed);
    }
}
