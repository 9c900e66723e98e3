//! Core library for the kvtestbed integration-test harness.
//!
//! The crate provisions a pool of compute instances through an OpenStack
//! style control plane, waits for the pool to become reachable, renders
//! playbook inventories and group variables, and drives the external
//! playbook runner through base setup and one start/test/stop cycle per
//! declared test before tearing the pool down.

pub mod backend;
pub mod cloud;
pub mod command;
pub mod config;
pub mod declarations;
pub mod fault;
pub mod inventory;
pub mod logging;
pub mod orchestrator;
pub mod planner;
pub mod playbook;
pub mod probe;
pub mod test_support;
pub mod workspace;

pub use backend::{Backend, Flavor, InstanceClass, InstanceInfo, Role};
pub use cloud::{CloudClient, CloudError, InstanceLimits};
pub use command::{
    CommandError, CommandOutput, CommandRunner, ProcessCommandRunner, StreamingCommandRunner,
};
pub use config::{CloudConfig, ConfigError, HarnessConfig};
pub use declarations::{DeclarationError, DeclarationSet, TestDeclaration};
pub use fault::{FaultAction, FaultError, FaultInjector, Node};
pub use inventory::{InventoryDocument, InventoryLayout, NamingScheme};
pub use orchestrator::{
    LifecycleError, LifecycleOrchestrator, OrchestratorSettings, RunReport, RunRequest,
    TeardownSummary, TestOutcome, TestStatus,
};
pub use planner::{FlavorTable, PlanError, ProvisionTemplate, TopologyPlan};
pub use playbook::{AnsiblePlaybookRunner, PlaybookError, PlaybookRunner};
pub use probe::{
    AvailabilityProbe, Endpoint, NetworkProbe, ProbeError, ProbeSettings, SystemNetwork,
};
pub use workspace::AnsibleWorkspace;
