use std::sync::Arc;
use std::time::Duration;

use restyle_core::{
    ChangeRow, ChangesBatch, DbError, DocumentStore, JobDocument, TypedDocument,
};

use crate::cursor::CursorStore;
use crate::executor::{execute_style_job, ExecutorConfig};
use crate::notify::UniqushClient;

const CHANGES_POLL_TIMEOUT: Duration = Duration::from_secs(60);
const TRANSPORT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// What the follower does with the jobs it sees.
#[derive(Debug, Clone)]
pub struct FollowerConfig {
    /// Run style-transfer jobs on this host.
    pub process_jobs: bool,
    /// Send push notifications for finished jobs.
    pub send_notifications: bool,
    /// Explicit starting sequence, overriding the cursor file.
    pub since: Option<String>,
}

/// Tails the changes feed, dispatching one job at a time.
///
/// Per-job failures are recorded onto the job document and logged;
/// nothing a single document does can stop the feed.
pub struct ChangesFeedFollower {
    db: Arc<dyn DocumentStore>,
    config: FollowerConfig,
    cursor: CursorStore,
    executor: ExecutorConfig,
    notifier: Option<Arc<UniqushClient>>,
}

impl ChangesFeedFollower {
    /// Build a follower. At least one of `process_jobs` and
    /// `send_notifications` must be enabled.
    pub fn new(
        db: Arc<dyn DocumentStore>,
        config: FollowerConfig,
        cursor: CursorStore,
        executor: ExecutorConfig,
        notifier: Option<Arc<UniqushClient>>,
    ) -> anyhow::Result<Self> {
        if !config.process_jobs && !config.send_notifications {
            anyhow::bail!("at least one of process_jobs / send_notifications must be enabled");
        }
        Ok(Self {
            db,
            config,
            cursor,
            executor,
            notifier,
        })
    }

    /// Follow the feed until cancelled.
    ///
    /// Transport failures are logged and retried after a short delay;
    /// only a failure to establish the starting cursor is fatal.
    pub async fn follow(&self) -> anyhow::Result<()> {
        let mut since = self.starting_cursor().await?;
        tracing::info!(since = since.as_deref().unwrap_or("<tail>"), "following changes feed");

        loop {
            let batch = match self
                .db
                .changes(since.as_deref(), CHANGES_POLL_TIMEOUT)
                .await
            {
                Ok(batch) => batch,
                Err(DbError::Protocol(err)) => {
                    // Malformed batch: drop it and re-poll from the same
                    // cursor rather than dying on one bad payload.
                    tracing::warn!(error = %err, "discarding undecodable changes batch");
                    tokio::time::sleep(TRANSPORT_RETRY_DELAY).await;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "changes poll failed, retrying");
                    tokio::time::sleep(TRANSPORT_RETRY_DELAY).await;
                    continue;
                }
            };
            self.handle_batch(&batch, &mut since).await;
        }
    }

    /// Pick the starting cursor: explicit `since`, then the cursor
    /// file, then the store's tail (skipping history on first run).
    pub async fn starting_cursor(&self) -> anyhow::Result<Option<String>> {
        if let Some(since) = &self.config.since {
            if !since.is_empty() {
                return Ok(Some(since.clone()));
            }
        }
        if let Some(seq) = self.cursor.load().await? {
            return Ok(Some(seq));
        }
        let tail = self
            .db
            .last_seq()
            .await
            .map_err(|err| anyhow::anyhow!("reading store tail sequence: {err}"))?;
        Ok(Some(tail))
    }

    async fn handle_batch(&self, batch: &ChangesBatch, since: &mut Option<String>) {
        self.process_changes(batch).await;

        if since.as_deref() != Some(batch.last_seq.as_str()) {
            if let Err(err) = self.cursor.persist(&batch.last_seq).await {
                tracing::warn!(error = format!("{err:#}"), "failed to persist cursor");
            }
            *since = Some(batch.last_seq.clone());
        }
    }

    async fn process_changes(&self, batch: &ChangesBatch) {
        for change in &batch.results {
            if let Err(err) = self.process_change(change).await {
                tracing::error!(
                    id = %change.id,
                    error = format!("{err:#}"),
                    "error processing change"
                );
            }
        }
    }

    async fn process_change(&self, change: &ChangeRow) -> anyhow::Result<()> {
        tracing::debug!(id = %change.id, "processing change");
        if change.deleted {
            return Ok(());
        }
        // Sync-gateway bookkeeping documents are not ours.
        if change.id.starts_with("_user") {
            return Ok(());
        }

        let raw = match self.db.get_raw(&change.id).await {
            Ok(raw) => raw,
            // Deleted between the feed entry and our fetch.
            Err(DbError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let typed: TypedDocument = serde_json::from_value(raw.clone())?;
        if !typed.is_job() {
            return Ok(());
        }
        let mut job: JobDocument = serde_json::from_value(raw)?;
        let fetched = job.clone();

        if self.config.process_jobs && job.is_ready_to_process() {
            execute_style_job(self.db.as_ref(), &self.executor, &mut job).await?;
        }

        if self.config.send_notifications {
            if let Some(notifier) = &self.notifier {
                // Terminal-state filtering happens in the notifier; it
                // sees the document as fetched, so a job we just
                // finished is announced by its own feed entry.
                let notifier = notifier.clone();
                tokio::spawn(async move { notifier.notify_job_done(&fetched).await });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::DEFAULT_CURSOR_FILE;
    use crate::probe::Capabilities;
    use restyle_core::memory::MemoryStore;
    use restyle_core::{JobState, SOURCE_IMAGE_ATTACHMENT, STYLE_IMAGE_ATTACHMENT};
    use serde_json::json;
    use std::path::Path;

    fn follower(
        db: Arc<MemoryStore>,
        dir: &Path,
        since: Option<String>,
    ) -> ChangesFeedFollower {
        ChangesFeedFollower::new(
            db,
            FollowerConfig {
                process_jobs: true,
                send_notifications: false,
                since,
            },
            CursorStore::new(dir.join(DEFAULT_CURSOR_FILE)),
            ExecutorConfig {
                temp_dir: dir.to_path_buf(),
                style_dir: dir.to_path_buf(),
                caps: Capabilities::default(),
            },
            None,
        )
        .expect("follower")
    }

    #[test]
    fn refuses_to_run_with_both_stages_disabled() {
        let db = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let result = ChangesFeedFollower::new(
            db,
            FollowerConfig {
                process_jobs: false,
                send_notifications: false,
                since: None,
            },
            CursorStore::new(dir.path().join(DEFAULT_CURSOR_FILE)),
            ExecutorConfig {
                temp_dir: dir.path().to_path_buf(),
                style_dir: dir.path().to_path_buf(),
                caps: Capabilities::default(),
            },
            None,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn starting_cursor_prefers_explicit_then_file_then_tail() {
        let db = Arc::new(MemoryStore::new());
        db.seed_job("j1", JobState::ReadyToProcess).await;
        let dir = tempfile::tempdir().expect("tempdir");

        // Explicit since wins.
        let explicit = follower(db.clone(), dir.path(), Some("9".to_string()));
        assert_eq!(
            explicit.starting_cursor().await.expect("cursor"),
            Some("9".to_string())
        );

        // Then the cursor file.
        let with_file = follower(db.clone(), dir.path(), None);
        with_file.cursor.persist("4").await.expect("persist");
        assert_eq!(
            with_file.starting_cursor().await.expect("cursor"),
            Some("4".to_string())
        );

        // Then the store's tail.
        let fresh_dir = tempfile::tempdir().expect("tempdir");
        let tail = follower(db.clone(), fresh_dir.path(), None);
        assert_eq!(
            tail.starting_cursor().await.expect("cursor"),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn bookkeeping_and_deleted_changes_skip_the_fetch() {
        let db = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let follower = follower(db.clone(), dir.path(), None);

        let batch = ChangesBatch {
            results: vec![
                ChangeRow {
                    id: "_user:alice".to_string(),
                    deleted: false,
                },
                ChangeRow {
                    id: "gone".to_string(),
                    deleted: true,
                },
            ],
            last_seq: "7".to_string(),
        };
        let mut since = None;
        follower.handle_batch(&batch, &mut since).await;

        assert_eq!(db.get_calls().await, 0);
        assert_eq!(since, Some("7".to_string()));
        assert_eq!(
            follower.cursor.load().await.expect("load"),
            Some("7".to_string())
        );
    }

    #[tokio::test]
    async fn non_job_documents_are_left_alone() {
        let db = Arc::new(MemoryStore::new());
        db.seed_doc("p1", json!({"type": "profile", "name": "alice"}))
            .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let follower = follower(db.clone(), dir.path(), None);

        let batch = ChangesBatch {
            results: vec![ChangeRow {
                id: "p1".to_string(),
                deleted: false,
            }],
            last_seq: "1".to_string(),
        };
        let mut since = None;
        follower.handle_batch(&batch, &mut since).await;

        assert_eq!(db.get_calls().await, 1);
        assert_eq!(db.revision_of("p1").await, Some("1-mem".to_string()));
    }

    #[tokio::test]
    async fn ready_job_is_driven_to_a_terminal_state() {
        let db = Arc::new(MemoryStore::new());
        db.seed_job("j1", JobState::ReadyToProcess).await;
        db.seed_attachment("j1", SOURCE_IMAGE_ATTACHMENT, "image/png", b"content")
            .await;
        db.seed_attachment("j1", STYLE_IMAGE_ATTACHMENT, "image/png", b"style")
            .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let follower = follower(db.clone(), dir.path(), None);

        let batch = db
            .changes(None, Duration::from_secs(1))
            .await
            .expect("changes");
        let mut since = None;
        follower.handle_batch(&batch, &mut since).await;

        assert_eq!(
            db.state_of("j1").await,
            Some(JobState::ProcessingSuccessful)
        );
        assert_eq!(
            follower.cursor.load().await.expect("load"),
            Some(batch.last_seq.clone())
        );
    }

    #[tokio::test]
    async fn in_progress_jobs_are_not_picked_up() {
        let db = Arc::new(MemoryStore::new());
        db.seed_job("j1", JobState::BeingProcessed).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let follower = follower(db.clone(), dir.path(), None);

        let batch = ChangesBatch {
            results: vec![ChangeRow {
                id: "j1".to_string(),
                deleted: false,
            }],
            last_seq: "1".to_string(),
        };
        let mut since = None;
        follower.handle_batch(&batch, &mut since).await;

        assert_eq!(db.state_of("j1").await, Some(JobState::BeingProcessed));
    }
}
