//! Binary entry point for the kvtestbed CLI.

mod cli;

use std::io::{self, Write};
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;

use kvtestbed::logging::init_logging;
use kvtestbed::{
    AnsiblePlaybookRunner, AnsibleWorkspace, AvailabilityProbe, CloudClient, CloudConfig,
    CloudError, ConfigError, DeclarationError, DeclarationSet, FaultError, FaultInjector,
    HarnessConfig, LifecycleError, LifecycleOrchestrator, Node, OrchestratorSettings, PlanError,
    ProcessCommandRunner, RunReport, RunRequest, StreamingCommandRunner, SystemNetwork,
    TestStatus,
};

use cli::{Cli, FaultCommand, FaultKind, RunCommand, SelectionArgs};

const EXIT_HARNESS_ERROR: i32 = 3;
const EXIT_NO_TESTS: i32 = 5;

type Orchestrator = LifecycleOrchestrator<
    CloudClient,
    SystemNetwork,
    AnsiblePlaybookRunner<StreamingCommandRunner>,
>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("test selection failed: {0}")]
    Selection(#[from] DeclarationError),
    #[error("no tests selected")]
    NoTests,
    #[error("cloud client error: {0}")]
    Cloud(#[from] CloudError),
    #[error("{0}")]
    Lifecycle(#[from] LifecycleError<CloudError>),
    #[error("fault injection failed: {0}")]
    Fault(#[from] FaultError),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::NoTests | Self::Lifecycle(LifecycleError::Plan(PlanError::NoTests)) => {
                EXIT_NO_TESTS
            }
            _ => EXIT_HARNESS_ERROR,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(verbose(&cli));
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

const fn verbose(cli: &Cli) -> bool {
    match cli {
        Cli::Run(command) => command.selection.verbose,
        Cli::Teardown(selection) | Cli::Rebuild(selection) => selection.verbose,
        Cli::Fault(command) => command.verbose,
    }
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_tests(command).await,
        Cli::Teardown(selection) => teardown(&selection).await,
        Cli::Rebuild(selection) => rebuild(&selection).await,
        Cli::Fault(command) => inject_fault(&command),
    }
}

async fn run_tests(command: RunCommand) -> Result<i32, CliError> {
    let tests = select_tests(&command.selection)?;
    let orchestrator = build_orchestrator(&command.selection)?;
    let report = orchestrator
        .run(RunRequest {
            tests,
            repo_dir: command.repo_dir.map(Utf8PathBuf::from),
            packages_dir: command.packages_dir.map(Utf8PathBuf::from),
            keep_nodes: command.keep_nodes,
        })
        .await?;
    write_report(io::stdout(), &report);
    Ok(report.exit_code())
}

async fn teardown(selection: &SelectionArgs) -> Result<i32, CliError> {
    let tests = select_tests(selection)?;
    let summary = build_orchestrator(selection)?.destroy(tests).await?;
    writeln!(io::stdout(), "teardown: {summary}").ok();
    for failure in &summary.failed {
        writeln!(io::stdout(), "left behind: {} ({})", failure.name, failure.message).ok();
    }
    Ok(i32::from(!summary.is_clean()))
}

async fn rebuild(selection: &SelectionArgs) -> Result<i32, CliError> {
    let tests = select_tests(selection)?;
    let endpoints = build_orchestrator(selection)?.rebuild(tests).await?;
    let mut stdout = io::stdout();
    for endpoint in endpoints {
        writeln!(stdout, "{} {} {}", endpoint.name, endpoint.host, endpoint.address).ok();
    }
    Ok(0)
}

fn inject_fault(command: &FaultCommand) -> Result<i32, CliError> {
    let node: Node = command.node.parse()?;
    let harness = HarnessConfig::load_without_cli_args()?;
    let mut injector = FaultInjector::new(ProcessCommandRunner, harness.ssh_bin, harness.ssh_user);
    if let Some(interface) = &command.interface {
        injector = injector.with_interface(interface.clone());
    }
    match command.action {
        FaultKind::Drop => injector.drop_node(&node)?,
        FaultKind::Resume => injector.resume_node(&node)?,
        FaultKind::Limit => {
            injector.limit_bandwidth(&node, command.rate.as_deref().unwrap_or_default())?;
        }
        FaultKind::Clear => injector.clear_bandwidth(&node)?,
    }
    Ok(0)
}

fn select_tests(selection: &SelectionArgs) -> Result<DeclarationSet, CliError> {
    let tests = DeclarationSet::select(
        Utf8Path::new(&selection.tests_dir),
        &selection.tags,
        &selection.tests,
    )?;
    if tests.is_empty() {
        return Err(CliError::NoTests);
    }
    Ok(tests)
}

fn build_orchestrator(selection: &SelectionArgs) -> Result<Orchestrator, CliError> {
    let mut harness = HarnessConfig::load_without_cli_args()?;
    if let Some(secs) = selection.wait_timeout {
        harness.wait_timeout_secs = secs;
    }
    harness.validate()?;
    let cloud_config = CloudConfig::load_without_cli_args()?;

    let workspace = AnsibleWorkspace::new(Utf8PathBuf::from(selection.ansible_dir.clone()));
    let settings = OrchestratorSettings::from_config(&harness, &cloud_config, workspace.clone());
    let playbooks =
        AnsiblePlaybookRunner::new(StreamingCommandRunner, harness.playbook_bin.clone(), workspace);
    let probe = AvailabilityProbe::new(SystemNetwork, harness.probe_settings());
    let cloud = CloudClient::new(cloud_config)?;
    Ok(LifecycleOrchestrator::new(cloud, probe, playbooks, settings))
}

fn write_report(mut target: impl Write, report: &RunReport) {
    for outcome in &report.outcomes {
        match &outcome.status {
            TestStatus::Passed => writeln!(target, "PASS {}", outcome.name).ok(),
            TestStatus::Failed { reason } => {
                writeln!(target, "FAIL {}: {reason}", outcome.name).ok()
            }
        };
    }
    writeln!(target, "teardown: {}", report.teardown).ok();
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvtestbed::{TeardownSummary, TestOutcome};

    #[test]
    fn empty_selection_maps_to_no_tests_status() {
        assert_eq!(CliError::NoTests.exit_code(), EXIT_NO_TESTS);
        assert_eq!(
            CliError::Lifecycle(LifecycleError::Plan(PlanError::NoTests)).exit_code(),
            EXIT_NO_TESTS
        );
        assert_eq!(
            CliError::Cloud(CloudError::MissingCredential("username")).exit_code(),
            EXIT_HARNESS_ERROR
        );
    }

    #[test]
    fn report_lists_outcomes_and_teardown() {
        let report = RunReport {
            outcomes: vec![
                TestOutcome {
                    name: String::from("basic"),
                    status: TestStatus::Passed,
                },
                TestOutcome {
                    name: String::from("quorum"),
                    status: TestStatus::Failed {
                        reason: String::from("playbook test-quorum failed (exit code: 2)"),
                    },
                },
            ],
            teardown: TeardownSummary {
                deleted: vec![String::from("kv-client")],
                ..TeardownSummary::default()
            },
        };
        let mut buf = Vec::new();
        write_report(&mut buf, &report);
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));

        assert_eq!(
            rendered,
            "PASS basic\n\
             FAIL quorum: playbook test-quorum failed (exit code: 2)\n\
             teardown: deleted 1, missing 0, failed 0\n"
        );
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::NoTests);
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));
        assert_eq!(rendered, "no tests selected\n");
    }
}
