#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Coordination layer of the `restyle` worker: change-feed follower,
//! job executor, queue supervisor, and their supporting pieces.

/// Durable change-feed cursor file.
pub mod cursor;
/// Drives one job through the processing state machine.
pub mod executor;
/// Long-running consumer of the document store's changes feed.
pub mod follower;
/// Queue-depth metric publication.
pub mod metrics;
/// Fire-and-forget push notifications for finished jobs.
pub mod notify;
/// Host capability probes (GPU, external renderer).
pub mod probe;
/// Periodic queue supervisor: metrics plus stuck-job rescue.
pub mod supervisor;
/// The unprocessed-jobs view: installation and querying.
pub mod views;

pub use follower::{ChangesFeedFollower, FollowerConfig};
pub use supervisor::{QueueSnapshot, QueueSupervisor};
