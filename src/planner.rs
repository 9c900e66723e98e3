//! Reduces the selected tests to one instance topology.
//!
//! Tests run one after another on a shared pool, so the pool only needs to
//! be as large as the most demanding test: the client count is the maximum
//! over tests, the server count is the maximum over tests of each test's
//! summed sub-groups. Flavors are merged by keeping the one with more RAM.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::backend::{Flavor, InstanceClass, Role};
use crate::declarations::DeclarationSet;
use crate::inventory::NamingScheme;

/// Errors raised while planning the topology.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PlanError {
    /// Raised when no test was selected.
    #[error("no tests selected")]
    NoTests,
    /// Raised when a test names a flavor the cloud does not offer.
    #[error("test '{test}' requests unknown flavor '{flavor}'")]
    UnknownFlavor {
        /// Test naming the flavor.
        test: String,
        /// Flavor name as declared.
        flavor: String,
    },
    /// Raised when hosts of a role are needed but no test names a flavor.
    #[error("{role} are required but no test declares a flavor for them")]
    MissingFlavor {
        /// Role lacking a flavor.
        role: Role,
    },
}

/// Flavor name to RAM lookup, fetched once per run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FlavorTable {
    ram: BTreeMap<String, u64>,
}

impl FlavorTable {
    /// Indexes `flavors` by name.
    #[must_use]
    pub fn from_flavors(flavors: &[Flavor]) -> Self {
        Self {
            ram: flavors
                .iter()
                .map(|flavor| (flavor.name.clone(), flavor.ram))
                .collect(),
        }
    }

    /// RAM of `flavor`; an unset flavor ranks lowest.
    #[must_use]
    pub fn ram_of(&self, flavor: Option<&str>) -> Option<u64> {
        flavor.map_or(Some(0), |name| self.ram.get(name).copied())
    }

    /// Keeps whichever of `current` and `candidate` has more RAM. Ties keep
    /// `current`.
    fn larger<'a>(
        &self,
        test: &str,
        current: Option<&'a str>,
        candidate: Option<&'a str>,
    ) -> Result<Option<&'a str>, PlanError> {
        let ram = |flavor: Option<&str>| {
            self.ram_of(flavor).ok_or_else(|| PlanError::UnknownFlavor {
                test: test.to_owned(),
                flavor: flavor.unwrap_or_default().to_owned(),
            })
        };
        if ram(candidate)? > ram(current)? {
            Ok(candidate)
        } else {
            Ok(current)
        }
    }
}

/// Per-run constants copied into every planned class.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisionTemplate {
    /// Base name of client instances.
    pub client_base_name: String,
    /// Base name of server instances.
    pub server_base_name: String,
    /// Image name.
    pub image: String,
    /// Key pair name.
    pub key_name: String,
    /// Network labels.
    pub networks: Vec<String>,
}

impl ProvisionTemplate {
    fn class(&self, role: Role, flavor: Option<&str>, count: usize) -> InstanceClass {
        let name = match role {
            Role::Client => &self.client_base_name,
            Role::Server => &self.server_base_name,
        };
        InstanceClass {
            role,
            name: name.clone(),
            image: self.image.clone(),
            flavor_name: flavor.unwrap_or_default().to_owned(),
            count,
            key_name: self.key_name.clone(),
            networks: self.networks.clone(),
        }
    }
}

/// Instance classes serving every selected test.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TopologyPlan {
    classes: Vec<InstanceClass>,
    delete_on_exit: bool,
}

impl TopologyPlan {
    /// Planned classes: clients first, then servers.
    #[must_use]
    pub fn classes(&self) -> &[InstanceClass] {
        &self.classes
    }

    /// Class serving `role`.
    #[must_use]
    pub fn class(&self, role: Role) -> Option<&InstanceClass> {
        self.classes.iter().find(|class| class.role == role)
    }

    /// Planned instance count of `role`.
    #[must_use]
    pub fn count(&self, role: Role) -> usize {
        self.class(role).map_or(0, |class| class.count)
    }

    /// Whether the pool is deleted when the run ends.
    #[must_use]
    pub const fn delete_on_exit(&self) -> bool {
        self.delete_on_exit
    }

    /// Forces the pool to be kept after the run.
    pub fn keep_nodes(&mut self) {
        self.delete_on_exit = false;
    }

    /// Names of every planned instance, clients first.
    #[must_use]
    pub fn instance_names(&self) -> Vec<String> {
        self.classes
            .iter()
            .flat_map(InstanceClass::instance_names)
            .collect()
    }

    /// Naming scheme matching the planned pools.
    #[must_use]
    pub fn naming(&self, domain: &str, ssh_user: &str) -> NamingScheme {
        let base = |role| {
            self.class(role)
                .map(|class| class.name.clone())
                .unwrap_or_default()
        };
        NamingScheme {
            client_base: base(Role::Client),
            server_base: base(Role::Server),
            client_pool: self.count(Role::Client),
            server_pool: self.count(Role::Server),
            domain: domain.to_owned(),
            ssh_user: ssh_user.to_owned(),
        }
    }
}

/// Plans the topology for `tests`.
///
/// ```
/// use kvtestbed::backend::{Flavor, Role};
/// use kvtestbed::declarations::{DeclarationSet, TestDeclaration};
/// use kvtestbed::planner::{plan, FlavorTable, ProvisionTemplate};
///
/// let test = TestDeclaration::from_json(
///     "basic",
///     r#"{"playbook": "test-basic", "test_env_cfg": {
///         "clients": {"count": 1, "flavor": "small"},
///         "servers": {"count_per_group": [2, 1], "flavor": "small"}}}"#,
/// )
/// .unwrap();
/// let tests = DeclarationSet::from_declarations([test]).unwrap();
/// let flavors = FlavorTable::from_flavors(&[Flavor {
///     id: String::from("1"),
///     name: String::from("small"),
///     ram: 2048,
/// }]);
///
/// let topology = plan(&tests, &flavors, &ProvisionTemplate::default(), true).unwrap();
/// assert_eq!(topology.count(Role::Server), 3);
/// ```
///
/// # Errors
///
/// Returns [`PlanError`] when no test is selected, a flavor is unknown, or a
/// role with hosts has no flavor.
pub fn plan(
    tests: &DeclarationSet,
    flavors: &FlavorTable,
    template: &ProvisionTemplate,
    default_delete: bool,
) -> Result<TopologyPlan, PlanError> {
    if tests.is_empty() {
        return Err(PlanError::NoTests);
    }

    let mut clients = 0;
    let mut servers = 0;
    let mut client_flavor: Option<&str> = None;
    let mut server_flavor: Option<&str> = None;
    for test in tests.iter() {
        let environment = &test.environment;
        clients = clients.max(environment.clients.count);
        servers = servers.max(environment.server_total());
        client_flavor = flavors.larger(
            &test.name,
            client_flavor,
            environment.clients.flavor.as_deref(),
        )?;
        server_flavor = flavors.larger(
            &test.name,
            server_flavor,
            environment.servers.flavor.as_deref(),
        )?;
    }

    for (role, count, flavor) in [
        (Role::Client, clients, client_flavor),
        (Role::Server, servers, server_flavor),
    ] {
        if count > 0 && flavor.is_none() {
            return Err(PlanError::MissingFlavor { role });
        }
    }

    Ok(TopologyPlan {
        classes: vec![
            template.class(Role::Client, client_flavor, clients),
            template.class(Role::Server, server_flavor, servers),
        ],
        delete_on_exit: tests.delete_on_exit(default_delete),
    })
}
