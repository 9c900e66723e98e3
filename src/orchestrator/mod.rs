//! Drives a whole harness run.
//!
//! A run plans the topology for the selected tests, creates the instance
//! pool, waits for it to become reachable, and runs the base-setup playbook.
//! Each test then gets its own inventory and variable overrides before the
//! storage processes are started, the test playbook runs, and the storage
//! processes are stopped again. Overridden variable files are restored after
//! every test whatever its outcome. The pool is deleted at the end unless a
//! test asked to keep it.

use std::fmt::{self, Display};

use camino::{Utf8Path, Utf8PathBuf};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::backend::Backend;
use crate::config::{CloudConfig, HarnessConfig};
use crate::declarations::{DeclarationSet, TestDeclaration};
use crate::inventory::{GroupNames, InventoryDocument, InventoryLayout, NamingScheme};
use crate::planner::{FlavorTable, PlanError, ProvisionTemplate, TopologyPlan, plan};
use crate::playbook::{PlaybookError, PlaybookRunner};
use crate::probe::{AvailabilityProbe, Endpoint, NetworkProbe, ProbeError};
use crate::workspace::{AnsibleWorkspace, FileError, VarsError, VarsSnapshot, update_vars};

/// Inventory context used by the base-setup playbook.
pub const SETUP_CONTEXT: &str = "setup";

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum LifecycleError<BackendError>
where
    BackendError: std::error::Error + 'static,
{
    /// Raised when the flavor table cannot be fetched.
    #[error("failed to list flavors: {0}")]
    Flavors(#[source] BackendError),
    /// Raised when the selected tests cannot be reduced to a topology.
    #[error(transparent)]
    Plan(#[from] PlanError),
    /// Raised when an instance class cannot be created.
    #[error("failed to create {class}: {message}")]
    Provision {
        /// Base name of the class.
        class: String,
        /// Human-readable description of the failure.
        message: String,
        /// Provider-specific error.
        #[source]
        source: BackendError,
    },
    /// Raised when the pool does not become reachable.
    #[error("not all nodes available: {message}")]
    Unavailable {
        /// Human-readable description of the failure.
        message: String,
        /// Probe failure.
        #[source]
        source: ProbeError<BackendError>,
    },
    /// Raised when the base-setup phase fails.
    #[error("base setup failed: {message}")]
    Setup {
        /// Human-readable description of the failure.
        message: String,
        /// Underlying step failure.
        #[source]
        source: StepError,
    },
    /// Raised when an instance cannot be rebuilt.
    #[error("failed to rebuild {name}: {source}")]
    Rebuild {
        /// Instance name.
        name: String,
        /// Provider-specific error.
        #[source]
        source: BackendError,
    },
    /// Raised when instances due for a rebuild do not exist.
    #[error("instances not found: {}", .names.join(", "))]
    Missing {
        /// Names that could not be found.
        names: Vec<String>,
    },
}

/// Failure of a single setup or test step.
#[derive(Debug, Error)]
pub enum StepError {
    /// Playbook failure.
    #[error(transparent)]
    Playbook(#[from] PlaybookError),
    /// Variable file failure.
    #[error(transparent)]
    Vars(#[from] VarsError),
    /// Inventory file failure.
    #[error(transparent)]
    File(#[from] FileError),
}

/// Playbooks run around every test.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlaybookNames {
    /// Installs packages on the whole pool.
    pub base_setup: String,
    /// Starts the storage processes.
    pub start: String,
    /// Stops the storage processes.
    pub stop: String,
}

/// Settings of a [`LifecycleOrchestrator`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OrchestratorSettings {
    /// Playbook directory.
    pub workspace: AnsibleWorkspace,
    /// Template for every planned instance class.
    pub template: ProvisionTemplate,
    /// Setup, start, and stop playbooks.
    pub playbooks: PlaybookNames,
    /// DNS suffix of instance host names.
    pub host_domain: String,
    /// Login recorded in inventory host records.
    pub ssh_user: String,
    /// Delete preference of tests that do not state one.
    pub default_delete_nodes: bool,
}

impl OrchestratorSettings {
    /// Settings derived from loaded configuration.
    #[must_use]
    pub fn from_config(
        harness: &HarnessConfig,
        cloud: &CloudConfig,
        workspace: AnsibleWorkspace,
    ) -> Self {
        Self {
            workspace,
            template: harness.provision_template(cloud),
            playbooks: PlaybookNames {
                base_setup: harness.base_setup_playbook.clone(),
                start: harness.start_playbook.clone(),
                stop: harness.stop_playbook.clone(),
            },
            host_domain: harness.host_domain.clone(),
            ssh_user: harness.ssh_user.clone(),
            default_delete_nodes: harness.default_delete_nodes,
        }
    }
}

/// Inputs of [`LifecycleOrchestrator::run`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunRequest {
    /// Tests to run.
    pub tests: DeclarationSet,
    /// Storage repository written to the clients' variables.
    pub repo_dir: Option<Utf8PathBuf>,
    /// Prebuilt package directory written to the test group's variables.
    pub packages_dir: Option<Utf8PathBuf>,
    /// Keeps the pool regardless of test preferences.
    pub keep_nodes: bool,
}

/// Resolved state shared by every phase of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunContext {
    topology: TopologyPlan,
    naming: NamingScheme,
    tests: DeclarationSet,
}

impl RunContext {
    /// Planned topology.
    #[must_use]
    pub const fn topology(&self) -> &TopologyPlan {
        &self.topology
    }

    /// Host naming of the planned pool.
    #[must_use]
    pub const fn naming(&self) -> &NamingScheme {
        &self.naming
    }

    /// Selected tests.
    #[must_use]
    pub const fn tests(&self) -> &DeclarationSet {
        &self.tests
    }

    /// Whether the pool is deleted when the run ends.
    #[must_use]
    pub const fn delete_on_exit(&self) -> bool {
        self.topology.delete_on_exit()
    }
}

/// Result of one test.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TestStatus {
    /// Every step succeeded.
    Passed,
    /// A step failed.
    Failed {
        /// First failure observed.
        reason: String,
    },
}

/// Outcome of one test.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestOutcome {
    /// Test name.
    pub name: String,
    /// Result.
    pub status: TestStatus,
}

impl TestOutcome {
    /// Returns `true` when the test passed.
    #[must_use]
    pub const fn passed(&self) -> bool {
        matches!(self.status, TestStatus::Passed)
    }
}

/// Instance that could not be deleted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FailedDeletion {
    /// Instance name.
    pub name: String,
    /// Provider error.
    pub message: String,
}

/// Outcome of deleting the pool.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TeardownSummary {
    /// Instances deleted.
    pub deleted: Vec<String>,
    /// Instances that no longer existed.
    pub missing: Vec<String>,
    /// Instances left behind.
    pub failed: Vec<FailedDeletion>,
    /// Set when deletion was skipped because a test kept its nodes.
    pub skipped: bool,
}

impl TeardownSummary {
    /// Summary of a skipped teardown.
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Returns `true` when no instance was left behind by a failure.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn failure_note(&self) -> Option<String> {
        if self.failed.is_empty() {
            return None;
        }
        let failures: Vec<String> = self
            .failed
            .iter()
            .map(|failure| format!("{}: {}", failure.name, failure.message))
            .collect();
        Some(format!("could not delete {}", failures.join("; ")))
    }
}

impl Display for TeardownSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.skipped {
            return f.write_str("teardown skipped, instances kept");
        }
        write!(
            f,
            "deleted {}, missing {}, failed {}",
            self.deleted.len(),
            self.missing.len(),
            self.failed.len()
        )
    }
}

/// Outcome of a completed run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunReport {
    /// Per-test outcomes in execution order.
    pub outcomes: Vec<TestOutcome>,
    /// Teardown outcome.
    pub teardown: TeardownSummary,
}

impl RunReport {
    /// Returns `true` when every test passed and nothing was left behind.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(TestOutcome::passed) && self.teardown.is_clean()
    }

    /// Process exit status for the report: `0` on success, `1` otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.passed())
    }

    /// Outcomes of the tests that failed.
    pub fn failures(&self) -> impl Iterator<Item = &TestOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.passed())
    }
}

/// Runs selected tests against a freshly provisioned pool.
#[derive(Debug)]
pub struct LifecycleOrchestrator<B, N, P> {
    backend: B,
    probe: AvailabilityProbe<N>,
    playbooks: P,
    settings: OrchestratorSettings,
}

impl<B, N, P> LifecycleOrchestrator<B, N, P>
where
    B: Backend,
    N: NetworkProbe,
    P: PlaybookRunner,
{
    /// Creates a new orchestrator.
    #[must_use]
    pub const fn new(
        backend: B,
        probe: AvailabilityProbe<N>,
        playbooks: P,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            backend,
            probe,
            playbooks,
            settings,
        }
    }

    /// Settings the orchestrator was built with.
    #[must_use]
    pub const fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Plans the topology for `tests` without touching any instance.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Flavors`] when the flavor table cannot be
    /// fetched and [`LifecycleError::Plan`] when planning fails.
    pub async fn prepare(
        &self,
        tests: DeclarationSet,
        keep_nodes: bool,
    ) -> Result<RunContext, LifecycleError<B::Error>> {
        let flavors = self
            .backend
            .flavors()
            .await
            .map_err(LifecycleError::Flavors)?;
        let table = FlavorTable::from_flavors(&flavors);
        let mut topology = plan(
            &tests,
            &table,
            &self.settings.template,
            self.settings.default_delete_nodes,
        )?;
        if keep_nodes {
            topology.keep_nodes();
        }
        for class in topology.classes() {
            info!(
                role = %class.role,
                name = %class.name,
                count = class.count,
                flavor = %class.flavor_name,
                "planned instance class"
            );
        }
        let naming = topology.naming(&self.settings.host_domain, &self.settings.ssh_user);
        Ok(RunContext {
            topology,
            naming,
            tests,
        })
    }

    /// Runs every selected test and tears the pool down.
    ///
    /// Test failures are reported in the returned [`RunReport`]; they do not
    /// stop later tests from running.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when planning, provisioning, availability,
    /// or base setup fail. Failures after instances were created trigger a
    /// teardown first.
    pub async fn run(&self, request: RunRequest) -> Result<RunReport, LifecycleError<B::Error>> {
        let ctx = self.prepare(request.tests, request.keep_nodes).await?;
        self.provision(&ctx).await?;
        self.wait_available(&ctx).await?;

        if let Err(err) = self.base_setup(
            &ctx,
            request.repo_dir.as_deref(),
            request.packages_dir.as_deref(),
        ) {
            let message = self.teardown_with_note(&ctx, &err).await;
            return Err(LifecycleError::Setup {
                message,
                source: err,
            });
        }

        let outcomes = ctx
            .tests()
            .iter()
            .map(|test| self.run_test(&ctx, test))
            .collect();
        let teardown = self.teardown(&ctx).await;
        info!(%teardown, "run finished");
        Ok(RunReport { outcomes, teardown })
    }

    /// Rebuilds every planned instance in place and waits for the pool.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when planning fails, an instance cannot be
    /// rebuilt or is missing, or the pool does not become reachable.
    pub async fn rebuild(
        &self,
        tests: DeclarationSet,
    ) -> Result<Vec<Endpoint>, LifecycleError<B::Error>> {
        let ctx = self.prepare(tests, true).await?;
        let names = ctx.topology().instance_names();
        let mut missing = Vec::new();
        for name in &names {
            info!(%name, "rebuilding instance");
            let rebuilt = self
                .backend
                .rebuild(name)
                .await
                .map_err(|source| LifecycleError::Rebuild {
                    name: name.clone(),
                    source,
                })?;
            if rebuilt.is_none() {
                warn!(%name, "instance not found");
                missing.push(name.clone());
            }
        }
        if !missing.is_empty() {
            return Err(LifecycleError::Missing { names: missing });
        }
        self.probe
            .wait(&self.backend, &names)
            .await
            .map_err(|source| LifecycleError::Unavailable {
                message: source.to_string(),
                source,
            })
    }

    /// Deletes every instance planned for `tests`, ignoring delete
    /// preferences.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when planning fails.
    pub async fn destroy(
        &self,
        tests: DeclarationSet,
    ) -> Result<TeardownSummary, LifecycleError<B::Error>> {
        let ctx = self.prepare(tests, false).await?;
        let summary = self.delete_instances(&ctx.topology().instance_names()).await;
        info!(%summary, "teardown finished");
        Ok(summary)
    }

    /// Deletes the pool when the run's delete flag is set.
    pub async fn teardown(&self, ctx: &RunContext) -> TeardownSummary {
        if !ctx.delete_on_exit() {
            info!("keeping instances after the run");
            return TeardownSummary::skipped();
        }
        self.delete_instances(&ctx.topology().instance_names())
            .await
    }

    async fn delete_instances(&self, names: &[String]) -> TeardownSummary {
        let mut summary = TeardownSummary::default();
        for name in names {
            match self.backend.delete(name).await {
                Ok(true) => summary.deleted.push(name.clone()),
                Ok(false) => summary.missing.push(name.clone()),
                Err(err) => {
                    warn!(%name, error = %err, "failed to delete instance");
                    summary.failed.push(FailedDeletion {
                        name: name.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        summary
    }

    async fn provision(&self, ctx: &RunContext) -> Result<(), LifecycleError<B::Error>> {
        for class in ctx.topology().classes() {
            if class.count == 0 {
                continue;
            }
            info!(name = %class.name, count = class.count, "creating instances");
            if let Err(err) = self.backend.create(class).await {
                let message = self.teardown_with_note(ctx, &err).await;
                return Err(LifecycleError::Provision {
                    class: class.name.clone(),
                    message,
                    source: err,
                });
            }
        }
        Ok(())
    }

    async fn wait_available(&self, ctx: &RunContext) -> Result<(), LifecycleError<B::Error>> {
        let names = ctx.topology().instance_names();
        match self.probe.wait(&self.backend, &names).await {
            Ok(_) => Ok(()),
            Err(err) => {
                let message = self.teardown_with_note(ctx, &err).await;
                Err(LifecycleError::Unavailable {
                    message,
                    source: err,
                })
            }
        }
    }

    fn base_setup(
        &self,
        ctx: &RunContext,
        repo_dir: Option<&Utf8Path>,
        packages_dir: Option<&Utf8Path>,
    ) -> Result<(), StepError> {
        let workspace = &self.settings.workspace;
        let naming = ctx.naming();
        let layout = InventoryLayout {
            client_count: naming.client_pool,
            server_groups: Some(naming.server_pool)
                .filter(|count| *count > 0)
                .into_iter()
                .collect(),
        };
        let document = InventoryDocument::build(SETUP_CONTEXT, &layout, naming);
        let inventory = workspace.write_inventory(SETUP_CONTEXT, &document)?;

        if let Some(repo_dir) = repo_dir {
            update_vars(
                &workspace.group_vars_path("clients"),
                &single_var("repo_dir", repo_dir),
            )?;
        }
        if let Some(packages_dir) = packages_dir {
            update_vars(
                &workspace.group_vars_path("test"),
                &single_var("packages_dir", packages_dir),
            )?;
        }

        info!("running base setup");
        self.playbooks
            .run_playbook(&self.settings.playbooks.base_setup, &inventory)?;
        Ok(())
    }

    fn run_test(&self, ctx: &RunContext, test: &TestDeclaration) -> TestOutcome {
        info!(test = %test.name, "running test");
        let mut snapshots = Vec::new();
        let result = self
            .render_test(ctx, test, &mut snapshots)
            .and_then(|inventory| self.drive_test(test, &inventory));
        let restored = restore_all(snapshots);

        let status = match result.and(restored.map_err(StepError::from)) {
            Ok(()) => {
                info!(test = %test.name, "test passed");
                TestStatus::Passed
            }
            Err(err) => {
                error!(test = %test.name, error = %err, "test failed");
                TestStatus::Failed {
                    reason: err.to_string(),
                }
            }
        };
        TestOutcome {
            name: test.name.clone(),
            status,
        }
    }

    fn render_test(
        &self,
        ctx: &RunContext,
        test: &TestDeclaration,
        snapshots: &mut Vec<VarsSnapshot>,
    ) -> Result<Utf8PathBuf, StepError> {
        let workspace = &self.settings.workspace;
        let layout = InventoryLayout {
            client_count: test.environment.clients.count,
            server_groups: test.environment.servers.count_per_group.clone(),
        };
        let document = InventoryDocument::build(&test.name, &layout, ctx.naming());
        let inventory = workspace.write_inventory(&test.name, &document)?;

        let groups = GroupNames::for_context(&test.name);
        override_vars(
            &workspace.group_vars_path(&groups.clients),
            &test.params,
            snapshots,
        )?;
        for extra in &test.extra_vars {
            override_vars(&workspace.resolve(&extra.path), &extra.params, snapshots)?;
        }
        Ok(inventory)
    }

    fn drive_test(&self, test: &TestDeclaration, inventory: &Utf8Path) -> Result<(), StepError> {
        let playbooks = &self.settings.playbooks;
        let body = self
            .playbooks
            .run_playbook(&playbooks.start, inventory)
            .and_then(|()| self.playbooks.run_playbook(&test.playbook, inventory));
        let stopped = self.playbooks.run_playbook(&playbooks.stop, inventory);
        if let (Err(_), Err(stop)) = (&body, &stopped) {
            warn!(test = %test.name, error = %stop, "stop playbook failed after test failure");
        }
        body?;
        stopped?;
        Ok(())
    }

    async fn teardown_with_note<E: Display>(&self, ctx: &RunContext, err: &E) -> String {
        let summary = self.teardown(ctx).await;
        append_teardown_note(err.to_string(), summary.failure_note().as_deref())
    }
}

fn override_vars(
    path: &Utf8Path,
    params: &Mapping,
    snapshots: &mut Vec<VarsSnapshot>,
) -> Result<(), VarsError> {
    snapshots.push(VarsSnapshot::capture(path)?);
    update_vars(path, params)?;
    Ok(())
}

fn restore_all(snapshots: Vec<VarsSnapshot>) -> Result<(), VarsError> {
    let mut first_failure = None;
    for snapshot in snapshots.into_iter().rev() {
        let path = snapshot.path().to_path_buf();
        if let Err(err) = snapshot.restore() {
            warn!(%path, error = %err, "failed to restore variables");
            first_failure.get_or_insert(err);
        }
    }
    first_failure.map_or(Ok(()), Err)
}

fn single_var(key: &str, value: &Utf8Path) -> Mapping {
    Mapping::from_iter([(Value::from(key), Value::from(value.as_str()))])
}

fn append_teardown_note(message: String, teardown_failure: Option<&str>) -> String {
    if let Some(teardown) = teardown_failure {
        format!("{message} (teardown also failed: {teardown})")
    } else {
        message
    }
}

#[cfg(test)]
mod tests;
