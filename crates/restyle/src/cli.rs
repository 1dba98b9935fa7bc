use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use reqwest::Url;

use restyle_engine::cursor::DEFAULT_CURSOR_FILE;

#[derive(Debug, Parser)]
#[command(name = "restyle", version, about = "Style-transfer worker daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Follow the sync gateway changes feed and process jobs.
    #[command(name = "follow_sync_gw")]
    FollowSyncGw(FollowArgs),
    /// Publish queue metrics to CloudWatch and rescue stuck jobs.
    #[command(name = "publish_cloudwatch_metrics")]
    PublishCloudwatchMetrics(PublishArgs),
}

#[derive(Debug, Args)]
pub struct FollowArgs {
    /// Sync Gateway database URL (e.g. http://localhost:4984/restyle).
    #[arg(long, env = "RESTYLE_SYNC_GW_URL")]
    pub url: Url,

    /// Uniqush push gateway URL, required with --send-notifications.
    #[arg(long = "uniqush-url", env = "RESTYLE_UNIQUSH_URL")]
    pub uniqush_url: Option<Url>,

    /// Run style-transfer jobs on this host (typically a GPU box).
    #[arg(long = "process-jobs", default_value_t = false)]
    pub process_jobs: bool,

    /// Send push notifications for finished jobs.
    #[arg(long = "send-notifications", default_value_t = false)]
    pub send_notifications: bool,

    /// Change-feed sequence to start from, overriding the cursor file.
    #[arg(long)]
    pub since: Option<String>,

    /// File the last processed sequence is persisted to.
    #[arg(long = "cursor-file", default_value = DEFAULT_CURSOR_FILE)]
    pub cursor_file: PathBuf,

    /// Directory for downloaded attachments and rendered output.
    #[arg(long = "temp-dir", default_value = "/tmp")]
    pub temp_dir: PathBuf,

    /// Installation directory of the neural-style renderer.
    #[arg(long = "style-dir", env = "RESTYLE_STYLE_DIR", default_value = "/opt/neural-style")]
    pub style_dir: PathBuf,
}

impl FollowArgs {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.process_jobs && !self.send_notifications {
            anyhow::bail!(
                "refusing to start: at least one of --process-jobs / --send-notifications is required"
            );
        }
        if self.send_notifications && self.uniqush_url.is_none() {
            anyhow::bail!("--uniqush-url is required with --send-notifications");
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct PublishArgs {
    /// Sync Gateway admin URL (e.g. http://localhost:4985/restyle).
    #[arg(long = "admin_url", env = "RESTYLE_SYNC_GW_ADMIN_URL")]
    pub admin_url: Url,

    /// AWS region the queue metric is published to.
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    pub region: String,

    /// Port of the local debug endpoint.
    #[arg(long = "debug-port", default_value_t = 4980)]
    pub debug_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn follow_requires_at_least_one_stage() {
        let cli = Cli::try_parse_from([
            "restyle",
            "follow_sync_gw",
            "--url",
            "http://localhost:4984/restyle",
        ])
        .expect("parse");
        let Command::FollowSyncGw(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn follow_with_process_jobs_validates() {
        let cli = Cli::try_parse_from([
            "restyle",
            "follow_sync_gw",
            "--url",
            "http://localhost:4984/restyle",
            "--process-jobs",
            "--since",
            "7",
        ])
        .expect("parse");
        let Command::FollowSyncGw(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert!(args.validate().is_ok());
        assert!(args.process_jobs);
        assert_eq!(args.since.as_deref(), Some("7"));
        assert_eq!(args.cursor_file, PathBuf::from(DEFAULT_CURSOR_FILE));
    }

    #[test]
    fn notifications_require_a_gateway_url() {
        let cli = Cli::try_parse_from([
            "restyle",
            "follow_sync_gw",
            "--url",
            "http://localhost:4984/restyle",
            "--send-notifications",
        ])
        .expect("parse");
        let Command::FollowSyncGw(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn publish_defaults_region_and_port() {
        let cli = Cli::try_parse_from([
            "restyle",
            "publish_cloudwatch_metrics",
            "--admin_url",
            "http://localhost:4985/restyle",
        ])
        .expect("parse");
        let Command::PublishCloudwatchMetrics(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.region, "us-east-1");
        assert_eq!(args.debug_port, 4980);
    }
}
