//! Command-line interface

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use hoard_common::retry::RetryConfig;
use hoard_common::telemetry::TelemetryConfig;
use hoard_dataset::ControllerConfig;

/// hoard - cacheable Dataset operator for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "hoard-operator", version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    #[command(subcommand)]
    pub command: Option<Command>,

    /// Controller flags when no subcommand is given
    #[command(flatten)]
    pub controller: ControllerArgs,
}

impl Cli {
    /// Controller arguments, whether or not the subcommand was spelled out
    pub fn controller_args(self) -> ControllerArgs {
        match self.command {
            Some(Command::Controller(args)) => args,
            None => self.controller,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the Dataset controller (default mode)
    Controller(ControllerArgs),
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct ControllerArgs {
    /// Only watch Datasets in this namespace
    #[arg(long, env = "HOARD_WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Seconds between checks while a Dataset is loading
    #[arg(long, default_value_t = 10)]
    pub loading_requeue_secs: u64,

    /// Seconds between checks once a Dataset is ready
    #[arg(long, default_value_t = 60)]
    pub ready_requeue_secs: u64,

    /// Seconds between checks while waiting for cache release
    #[arg(long, default_value_t = 10)]
    pub teardown_requeue_secs: u64,

    /// Attempts for a status write that keeps losing races
    #[arg(long, default_value_t = 5)]
    pub status_retry_attempts: u32,

    /// OTLP gRPC endpoint for traces
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pub plain_logs: bool,
}

impl ControllerArgs {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            loading_requeue: Duration::from_secs(self.loading_requeue_secs),
            ready_requeue: Duration::from_secs(self.ready_requeue_secs),
            teardown_requeue: Duration::from_secs(self.teardown_requeue_secs),
            status_retry: RetryConfig::with_max_attempts(self.status_retry_attempts),
            watch_namespace: self.namespace.clone(),
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            otlp_endpoint: self.otlp_endpoint.clone(),
            json_logs: !self.plain_logs,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_controller_defaults() {
        let cli = Cli::try_parse_from(["hoard-operator"]).unwrap();
        assert!(!cli.crd);
        assert!(cli.command.is_none());
        let config = cli.controller_args().controller_config();
        assert_eq!(config.loading_requeue, Duration::from_secs(10));
        assert_eq!(config.ready_requeue, Duration::from_secs(60));
        assert_eq!(config.teardown_requeue, Duration::from_secs(10));
        assert_eq!(config.status_retry, RetryConfig::with_max_attempts(5));
    }

    #[test]
    fn controller_flags_map_to_config() {
        let cli = Cli::try_parse_from([
            "hoard-operator",
            "controller",
            "--namespace",
            "ml",
            "--ready-requeue-secs",
            "120",
            "--status-retry-attempts",
            "8",
            "--plain-logs",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Command::Controller(_))));
        let args = cli.controller_args();

        let config = args.controller_config();
        assert_eq!(config.watch_namespace.as_deref(), Some("ml"));
        assert_eq!(config.ready_requeue, Duration::from_secs(120));
        assert_eq!(config.loading_requeue, Duration::from_secs(10));
        assert_eq!(config.status_retry.max_attempts, 8);
        assert!(!args.telemetry_config().json_logs);
    }

    #[test]
    fn controller_flags_work_without_subcommand() {
        let cli = Cli::try_parse_from(["hoard-operator", "--teardown-requeue-secs", "3"]).unwrap();
        assert_eq!(
            cli.controller_args().controller_config().teardown_requeue,
            Duration::from_secs(3)
        );
    }

    #[test]
    fn crd_flag_parses() {
        let cli = Cli::try_parse_from(["hoard-operator", "--crd"]).unwrap();
        assert!(cli.crd);
    }

    #[test]
    fn rejects_non_numeric_intervals() {
        assert!(Cli::try_parse_from([
            "hoard-operator",
            "controller",
            "--loading-requeue-secs",
            "soon"
        ])
        .is_err());
    }
}
