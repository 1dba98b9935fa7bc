mod cli;
mod debug_server;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use restyle_core::SyncGateway;
use restyle_engine::cursor::CursorStore;
use restyle_engine::executor::ExecutorConfig;
use restyle_engine::follower::FollowerConfig;
use restyle_engine::metrics::CloudWatchSink;
use restyle_engine::notify::UniqushClient;
use restyle_engine::probe::Capabilities;
use restyle_engine::{ChangesFeedFollower, QueueSupervisor};

use crate::cli::{Cli, Command, FollowArgs, PublishArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::FollowSyncGw(args) => run_follower(args).await,
        Command::PublishCloudwatchMetrics(args) => run_supervisor(args).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
}

async fn run_follower(args: FollowArgs) -> anyhow::Result<()> {
    args.validate()?;

    let db = Arc::new(SyncGateway::new(args.url.clone())?);
    let caps = Capabilities::detect().await;
    tracing::info!(
        gpu = caps.gpu,
        style_binary = caps.style_binary,
        "detected host capabilities"
    );

    let notifier = match &args.uniqush_url {
        Some(url) => Some(Arc::new(UniqushClient::new(url.clone())?)),
        None => None,
    };

    let follower = ChangesFeedFollower::new(
        db,
        FollowerConfig {
            process_jobs: args.process_jobs,
            send_notifications: args.send_notifications,
            since: args.since.clone(),
        },
        CursorStore::new(&args.cursor_file),
        ExecutorConfig {
            temp_dir: args.temp_dir.clone(),
            style_dir: args.style_dir.clone(),
            caps,
        },
        notifier,
    )?;

    tokio::select! {
        res = follower.follow() => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            Ok(())
        }
    }
}

async fn run_supervisor(args: PublishArgs) -> anyhow::Result<()> {
    let db = Arc::new(SyncGateway::new(args.admin_url.clone())?);
    let metrics = Arc::new(CloudWatchSink::new(args.region.clone()).await);
    let supervisor = QueueSupervisor::new(db, metrics);
    let snapshots = supervisor.subscribe();

    let debug = tokio::spawn(debug_server::serve(args.debug_port, snapshots));

    tokio::select! {
        res = supervisor.run() => res,
        res = debug => match res {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("debug server task failed: {err}")),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            Ok(())
        }
    }
}
