use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use restyle_core::{DocumentStore, JobDocument, JobState};

use crate::metrics::MetricSink;
use crate::views::{UnprocessedJobs, ViewManager};

/// Name of the queue-depth metric the autoscaler alarms on.
pub const QUEUE_METRIC_NAME: &str = "NumJobsReadyOrBeingProcessed";

const TICK_PERIOD: Duration = Duration::from_secs(60);

// Long enough that a slow but healthy render is not preempted, short
// enough that a dead worker's jobs are retried the same hour.
const STUCK_JOB_DEADLINE: Duration = Duration::from_secs(60 * 60);

/// Point-in-time picture of the queue, served by the debug endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    /// Unfinished jobs counted by the view.
    pub queue_depth: u64,
    /// How many of those are currently claimed by a worker.
    pub jobs_being_processed: usize,
    /// Jobs under stuck-job observation.
    pub tracked_jobs: usize,
    /// Supervisor ticks since startup.
    pub ticks: u64,
}

struct TrackedJob {
    first_seen: Instant,
}

/// Periodic queue supervisor.
///
/// Every tick it publishes the queue depth and resets jobs that have
/// sat in `BEING_PROCESSED` past the deadline, on the assumption that
/// their worker is gone. Tick failures are logged and the loop keeps
/// going.
pub struct QueueSupervisor {
    db: Arc<dyn DocumentStore>,
    views: ViewManager,
    metrics: Arc<dyn MetricSink>,
    tracked: HashMap<String, TrackedJob>,
    snapshot_tx: watch::Sender<QueueSnapshot>,
    ticks: u64,
}

impl QueueSupervisor {
    /// Build a supervisor over the given store and metric sink.
    pub fn new(db: Arc<dyn DocumentStore>, metrics: Arc<dyn MetricSink>) -> Self {
        let (snapshot_tx, _) = watch::channel(QueueSnapshot::default());
        Self {
            views: ViewManager::new(db.clone()),
            db,
            metrics,
            tracked: HashMap::new(),
            snapshot_tx,
            ticks: 0,
        }
    }

    /// Subscribe to queue snapshots, one per tick.
    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Run ticks forever.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            if let Err(err) = self.tick().await {
                tracing::warn!(error = format!("{err:#}"), "supervisor tick failed");
            }
            tokio::time::sleep(TICK_PERIOD).await;
        }
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        self.ticks += 1;
        let unprocessed = self.views.query_unprocessed().await?;
        let queue_depth = unprocessed.total_rows;
        tracing::info!(queue_depth, "queue depth");

        if let Err(err) = self
            .metrics
            .publish(QUEUE_METRIC_NAME, queue_depth as f64)
            .await
        {
            tracing::warn!(error = format!("{err:#}"), "failed to publish queue-depth metric");
        }

        let being_processed = self.jobs_being_processed(&unprocessed).await;
        self.reconcile_tracker(&being_processed).await;

        let _ = self.snapshot_tx.send(QueueSnapshot {
            queue_depth,
            jobs_being_processed: being_processed.len(),
            tracked_jobs: self.tracked.len(),
            ticks: self.ticks,
        });
        Ok(())
    }

    /// Re-read each in-progress row; the view snapshot can lag the
    /// documents, so rows that have moved on are dropped here.
    async fn jobs_being_processed(&self, unprocessed: &UnprocessedJobs) -> Vec<JobDocument> {
        let mut jobs = Vec::new();
        for row in &unprocessed.rows {
            if row.key != JobState::BeingProcessed {
                continue;
            }
            match JobDocument::load(self.db.as_ref(), &row.id).await {
                Ok(job) if job.is_being_processed() => jobs.push(job),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(id = %row.id, error = %err, "skipping unreadable job row")
                }
            }
        }
        jobs
    }

    async fn reconcile_tracker(&mut self, being_processed: &[JobDocument]) {
        let now = Instant::now();

        // Jobs that left BEING_PROCESSED no longer need watching.
        let live: HashSet<&str> = being_processed.iter().map(|job| job.id.as_str()).collect();
        self.tracked.retain(|id, _| live.contains(id.as_str()));

        for job in being_processed {
            let first_seen = self
                .tracked
                .entry(job.id.clone())
                .or_insert(TrackedJob { first_seen: now })
                .first_seen;
            if now.duration_since(first_seen) >= STUCK_JOB_DEADLINE {
                self.rescue(job.clone()).await;
            }
        }
    }

    async fn rescue(&mut self, mut job: JobDocument) {
        tracing::warn!(
            job = %job.id,
            "job stuck in BEING_PROCESSED past deadline, resetting to READY_TO_PROCESS"
        );
        match job
            .update_state(self.db.as_ref(), JobState::ReadyToProcess)
            .await
        {
            Ok(_) => {
                self.tracked.remove(&job.id);
            }
            Err(err) => {
                tracing::warn!(job = %job.id, error = %err, "failed to reset stuck job")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RecordingSink;
    use restyle_core::memory::MemoryStore;

    fn supervisor(db: Arc<MemoryStore>, sink: Arc<RecordingSink>) -> QueueSupervisor {
        QueueSupervisor::new(db, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_store_publishes_zero_after_installing_the_view() {
        let db = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let mut sup = supervisor(db.clone(), sink.clone());

        sup.tick().await.expect("tick");

        assert_eq!(db.design_count().await, 1);
        assert_eq!(
            sink.published().await,
            vec![(QUEUE_METRIC_NAME.to_string(), 0.0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_job_is_rescued_only_after_the_deadline() {
        let db = Arc::new(MemoryStore::new());
        db.seed_job("j9", JobState::BeingProcessed).await;
        let sink = Arc::new(RecordingSink::new());
        let mut sup = supervisor(db.clone(), sink.clone());

        // First sighting starts the clock but rescues nothing.
        sup.tick().await.expect("tick");
        assert_eq!(db.state_of("j9").await, Some(JobState::BeingProcessed));
        assert_eq!(sup.tracked.len(), 1);

        // Ten minutes in: still in flight, still tracked.
        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        sup.tick().await.expect("tick");
        assert_eq!(db.state_of("j9").await, Some(JobState::BeingProcessed));

        // Past the one-hour deadline: reset and forgotten.
        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        sup.tick().await.expect("tick");
        assert_eq!(db.state_of("j9").await, Some(JobState::ReadyToProcess));
        assert_eq!(sup.tracked.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_jobs_leave_the_tracker() {
        let db = Arc::new(MemoryStore::new());
        db.seed_job("j1", JobState::BeingProcessed).await;
        let sink = Arc::new(RecordingSink::new());
        let mut sup = supervisor(db.clone(), sink.clone());

        sup.tick().await.expect("tick");
        assert_eq!(sup.tracked.len(), 1);

        db.force_state("j1", JobState::ProcessingSuccessful).await;
        sup.tick().await.expect("tick");
        assert_eq!(sup.tracked.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_depth_counts_ready_and_in_progress_jobs() {
        let db = Arc::new(MemoryStore::new());
        db.seed_job("a", JobState::ReadyToProcess).await;
        db.seed_job("b", JobState::BeingProcessed).await;
        db.seed_job("c", JobState::ProcessingSuccessful).await;
        let sink = Arc::new(RecordingSink::new());
        let mut sup = supervisor(db.clone(), sink.clone());
        let mut snapshots = sup.subscribe();

        sup.tick().await.expect("tick");

        assert_eq!(
            sink.published().await,
            vec![(QUEUE_METRIC_NAME.to_string(), 2.0)]
        );
        assert!(snapshots.has_changed().expect("snapshot"));
        let snapshot = snapshots.borrow_and_update().clone();
        assert_eq!(snapshot.queue_depth, 2);
        assert_eq!(snapshot.jobs_being_processed, 1);
        assert_eq!(snapshot.ticks, 1);
    }
}
