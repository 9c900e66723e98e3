//! Command-line interface definitions for the `kvtestbed` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, ValueEnum};

/// Top-level CLI for the `kvtestbed` binary.
#[derive(Debug, Parser)]
#[command(
    name = "kvtestbed",
    about = "Provision a cloud test pool and run storage integration tests against it",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Provision the pool, run the selected tests, and tear down.
    #[command(
        name = "run",
        about = "Provision the pool, run the selected tests, and tear down"
    )]
    Run(RunCommand),
    /// Delete every instance the selected tests would use.
    #[command(
        name = "teardown",
        about = "Delete every instance the selected tests would use"
    )]
    Teardown(SelectionArgs),
    /// Rebuild the pool in place and wait for it to come back.
    #[command(
        name = "rebuild",
        about = "Rebuild the pool in place and wait for it to come back"
    )]
    Rebuild(SelectionArgs),
    /// Inject a network fault on a storage node.
    #[command(name = "fault", about = "Inject a network fault on a storage node")]
    Fault(FaultCommand),
}

/// Test selection shared by every pool-level subcommand.
#[derive(Debug, Args)]
pub(crate) struct SelectionArgs {
    /// Directory holding `SUITE/test_NAME.cfg` declarations.
    #[arg(long, value_name = "DIR", default_value = "tests")]
    pub(crate) tests_dir: String,
    /// Select tests carrying this tag. May be repeated.
    #[arg(long = "tag", value_name = "TAG")]
    pub(crate) tags: Vec<String>,
    /// Select a test from an inline `{"NAME": {...}}` object. May be
    /// repeated; explicit tests take precedence over tags.
    #[arg(long = "test", value_name = "JSON")]
    pub(crate) tests: Vec<String>,
    /// Playbook directory holding playbooks, inventories, and group
    /// variables.
    #[arg(long, value_name = "DIR", default_value = "ansible")]
    pub(crate) ansible_dir: String,
    /// Override the ceiling of each availability phase, in seconds.
    #[arg(long, value_name = "SECS")]
    pub(crate) wait_timeout: Option<u64>,
    /// Log at debug level unless `KVTESTBED_LOG` says otherwise.
    #[arg(long, short)]
    pub(crate) verbose: bool,
}

/// Arguments for the `kvtestbed run` subcommand.
#[derive(Debug, Args)]
pub(crate) struct RunCommand {
    /// Test selection and pool options.
    #[command(flatten)]
    pub(crate) selection: SelectionArgs,
    /// Storage repository checked out on the clients.
    #[arg(long, value_name = "DIR")]
    pub(crate) repo_dir: Option<String>,
    /// Directory of prebuilt packages installed during base setup.
    #[arg(long, value_name = "DIR")]
    pub(crate) packages_dir: Option<String>,
    /// Keep the pool after the run regardless of test preferences.
    #[arg(long)]
    pub(crate) keep_nodes: bool,
}

/// Fault applied by `kvtestbed fault`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum FaultKind {
    /// Drop inbound traffic to the storage port.
    Drop,
    /// Remove a drop rule.
    Resume,
    /// Limit bandwidth to `--rate`.
    Limit,
    /// Remove a bandwidth limit.
    Clear,
}

/// Arguments for the `kvtestbed fault` subcommand.
#[derive(Debug, Args)]
pub(crate) struct FaultCommand {
    /// Fault to apply.
    #[arg(value_enum)]
    pub(crate) action: FaultKind,
    /// Storage node as `host:port:group`.
    #[arg(value_name = "NODE")]
    pub(crate) node: String,
    /// Bandwidth rate for `limit`, such as `10mbit`.
    #[arg(long, value_name = "RATE", required_if_eq("action", "limit"))]
    pub(crate) rate: Option<String>,
    /// Interface shaped by bandwidth limits.
    #[arg(long, value_name = "IFACE")]
    pub(crate) interface: Option<String>,
    /// Log at debug level unless `KVTESTBED_LOG` says otherwise.
    #[arg(long, short)]
    pub(crate) verbose: bool,
}
