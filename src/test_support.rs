//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::backend::{AddressInfo, Backend, BackendFuture, Flavor, InstanceClass, InstanceInfo};
use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::playbook::{PlaybookError, PlaybookRunner};
use crate::probe::{NetworkProbe, ProbeFuture};
use crate::workspace::files;

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// One playbook run observed by [`ScriptedPlaybooks`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlaybookRun {
    /// Playbook name.
    pub playbook: String,
    /// Inventory passed to the runner.
    pub inventory: Utf8PathBuf,
    /// Inventory text at the time of the run.
    pub inventory_text: Option<String>,
    /// Content of every watched file at the time of the run.
    pub watched: BTreeMap<Utf8PathBuf, Option<String>>,
}

/// Playbook runner that records runs and fails chosen playbooks.
#[derive(Clone, Debug, Default)]
pub struct ScriptedPlaybooks {
    runs: Rc<RefCell<Vec<PlaybookRun>>>,
    failures: Rc<RefCell<BTreeMap<String, i32>>>,
    watched: Rc<RefCell<Vec<Utf8PathBuf>>>,
}

impl ScriptedPlaybooks {
    /// Creates a runner where every playbook succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every run of `playbook` exit with `code`.
    pub fn fail(&self, playbook: &str, code: i32) {
        self.failures.borrow_mut().insert(playbook.to_owned(), code);
    }

    /// Captures the content of `path` on every run.
    pub fn watch(&self, path: impl Into<Utf8PathBuf>) {
        self.watched.borrow_mut().push(path.into());
    }

    /// Runs observed so far.
    #[must_use]
    pub fn runs(&self) -> Vec<PlaybookRun> {
        self.runs.borrow().clone()
    }

    /// Names of the playbooks run so far, in order.
    #[must_use]
    pub fn playbooks(&self) -> Vec<String> {
        self.runs
            .borrow()
            .iter()
            .map(|run| run.playbook.clone())
            .collect()
    }
}

impl PlaybookRunner for ScriptedPlaybooks {
    fn run_playbook(&self, playbook: &str, inventory: &Utf8Path) -> Result<(), PlaybookError> {
        let watched = self
            .watched
            .borrow()
            .iter()
            .map(|path| (path.clone(), files::read_optional(path).ok().flatten()))
            .collect();
        self.runs.borrow_mut().push(PlaybookRun {
            playbook: playbook.to_owned(),
            inventory: inventory.to_path_buf(),
            inventory_text: files::read_optional(inventory).ok().flatten(),
            watched,
        });
        match self.failures.borrow().get(playbook) {
            Some(code) => Err(PlaybookError::Failed {
                playbook: playbook.to_owned(),
                code: *code,
            }),
            None => Ok(()),
        }
    }
}

/// Error returned by [`ScriptedBackend`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("scripted backend failure: {0}")]
pub struct ScriptedBackendError(pub String);

#[derive(Clone, Debug)]
struct ScriptedInstance {
    polls_before_active: usize,
    polls: usize,
    address: IpAddr,
}

#[derive(Debug, Default)]
struct BackendState {
    flavors: Vec<Flavor>,
    instances: BTreeMap<String, ScriptedInstance>,
    polls_before_active: usize,
    next_host: u8,
    created: Vec<InstanceClass>,
    deleted: Vec<String>,
    delete_attempts: Vec<String>,
    rebuilt: Vec<String>,
    lookups: BTreeMap<String, usize>,
    failing_creates: BTreeSet<String>,
    failing_deletes: BTreeSet<String>,
    failing_flavors: bool,
    failing_lookups: BTreeSet<String>,
    unaddressed: BTreeSet<String>,
}

impl BackendState {
    fn insert(&mut self, name: &str, polls_before_active: usize) -> IpAddr {
        self.next_host = self.next_host.wrapping_add(1);
        let address = IpAddr::V4(Ipv4Addr::new(10, 0, 0, self.next_host));
        self.instances.insert(
            name.to_owned(),
            ScriptedInstance {
                polls_before_active,
                polls: 0,
                address,
            },
        );
        address
    }
}

/// In-memory cloud whose instances turn `ACTIVE` after a scripted number of
/// polls.
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    state: Arc<StdMutex<BackendState>>,
}

impl ScriptedBackend {
    /// Creates a backend offering `flavors`.
    #[must_use]
    pub fn new(flavors: Vec<Flavor>) -> Self {
        let backend = Self::default();
        backend.lock().flavors = flavors;
        backend
    }

    fn lock(&self) -> StdMutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an existing instance reporting `BUILD` for its first
    /// `polls_before_active` lookups.
    pub fn add_instance(&self, name: &str, polls_before_active: usize) -> IpAddr {
        self.lock().insert(name, polls_before_active)
    }

    /// Sets how many lookups newly created instances answer with `BUILD`.
    pub fn set_polls_before_active(&self, polls: usize) {
        self.lock().polls_before_active = polls;
    }

    /// Makes creation of the class called `name` fail.
    pub fn fail_create(&self, name: &str) {
        self.lock().failing_creates.insert(name.to_owned());
    }

    /// Makes deletion of the instance called `name` fail.
    pub fn fail_delete(&self, name: &str) {
        self.lock().failing_deletes.insert(name.to_owned());
    }

    /// Makes the flavor listing fail.
    pub fn fail_flavors(&self) {
        self.lock().failing_flavors = true;
    }

    /// Makes every lookup of `name` fail.
    pub fn fail_lookup(&self, name: &str) {
        self.lock().failing_lookups.insert(name.to_owned());
    }

    /// Makes `name` report no addresses.
    pub fn withhold_address(&self, name: &str) {
        self.lock().unaddressed.insert(name.to_owned());
    }

    /// Classes passed to [`Backend::create`].
    #[must_use]
    pub fn created(&self) -> Vec<InstanceClass> {
        self.lock().created.clone()
    }

    /// Instances removed by [`Backend::delete`].
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    /// Every name passed to [`Backend::delete`].
    #[must_use]
    pub fn delete_attempts(&self) -> Vec<String> {
        self.lock().delete_attempts.clone()
    }

    /// Instances passed to [`Backend::rebuild`] that existed.
    #[must_use]
    pub fn rebuilt(&self) -> Vec<String> {
        self.lock().rebuilt.clone()
    }

    /// Number of lookups of `name` so far.
    #[must_use]
    pub fn lookups(&self, name: &str) -> usize {
        self.lock().lookups.get(name).copied().unwrap_or_default()
    }

    /// Address assigned to `name`, if it exists.
    #[must_use]
    pub fn address_of(&self, name: &str) -> Option<IpAddr> {
        self.lock()
            .instances
            .get(name)
            .map(|instance| instance.address)
    }

    /// Names of instances currently present.
    #[must_use]
    pub fn instance_names(&self) -> Vec<String> {
        self.lock().instances.keys().cloned().collect()
    }
}

fn describe(name: &str, instance: &ScriptedInstance, addressed: bool) -> InstanceInfo {
    let status = if instance.polls > instance.polls_before_active {
        "ACTIVE"
    } else {
        "BUILD"
    };
    InstanceInfo {
        id: format!("id-{name}"),
        name: name.to_owned(),
        status: status.to_owned(),
        addresses: if addressed {
            BTreeMap::from([(
                String::from("vmnet"),
                vec![AddressInfo {
                    addr: instance.address.to_string(),
                }],
            )])
        } else {
            BTreeMap::new()
        },
        image: serde_json::json!({
            "id": "image-1",
            "links": [{"href": "http://cloud.test/images/image-1"}],
        }),
    }
}

impl Backend for ScriptedBackend {
    type Error = ScriptedBackendError;

    fn flavors(&self) -> BackendFuture<'_, Vec<Flavor>, Self::Error> {
        Box::pin(async move {
            let state = self.lock();
            if state.failing_flavors {
                return Err(ScriptedBackendError(String::from("flavor listing failed")));
            }
            Ok(state.flavors.clone())
        })
    }

    fn instance_by_name<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<InstanceInfo>, Self::Error> {
        Box::pin(async move {
            let mut state = self.lock();
            *state.lookups.entry(name.to_owned()).or_default() += 1;
            if state.failing_lookups.contains(name) {
                return Err(ScriptedBackendError(format!("lookup of {name} failed")));
            }
            let addressed = !state.unaddressed.contains(name);
            Ok(state.instances.get_mut(name).map(|instance| {
                instance.polls += 1;
                describe(name, instance, addressed)
            }))
        })
    }

    fn create<'a>(
        &'a self,
        class: &'a InstanceClass,
    ) -> BackendFuture<'a, InstanceInfo, Self::Error> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.failing_creates.contains(&class.name) {
                return Err(ScriptedBackendError(format!(
                    "creation of {} failed",
                    class.name
                )));
            }
            let polls = state.polls_before_active;
            for name in class.instance_names() {
                state.insert(&name, polls);
            }
            state.created.push(class.clone());
            Ok(InstanceInfo {
                id: format!("id-{}", class.name),
                name: class.name.clone(),
                status: String::from("BUILD"),
                ..InstanceInfo::default()
            })
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BackendFuture<'a, bool, Self::Error> {
        Box::pin(async move {
            let mut state = self.lock();
            state.delete_attempts.push(name.to_owned());
            if state.failing_deletes.contains(name) {
                return Err(ScriptedBackendError(format!("deletion of {name} failed")));
            }
            if state.instances.remove(name).is_none() {
                return Ok(false);
            }
            state.deleted.push(name.to_owned());
            Ok(true)
        })
    }

    fn rebuild<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<InstanceInfo>, Self::Error> {
        Box::pin(async move {
            let mut state = self.lock();
            let polls = state.polls_before_active;
            let addressed = !state.unaddressed.contains(name);
            let Some(instance) = state.instances.get_mut(name) else {
                return Ok(None);
            };
            instance.polls = 0;
            instance.polls_before_active = polls;
            let info = describe(name, instance, addressed);
            state.rebuilt.push(name.to_owned());
            Ok(Some(info))
        })
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    closed_checks: BTreeMap<IpAddr, usize>,
    never_open: BTreeSet<IpAddr>,
    records: BTreeMap<String, IpAddr>,
    failed_lookups: BTreeMap<String, usize>,
    mirror: Option<ScriptedBackend>,
    port_checks: Vec<SocketAddr>,
    lookups: Vec<String>,
}

/// Scripted TCP and DNS checks.
///
/// Ports are open unless scripted otherwise. Host names resolve through
/// explicit records, falling back to the addresses of a mirrored
/// [`ScriptedBackend`] (looked up by the first label of the host name).
#[derive(Clone, Debug, Default)]
pub struct ScriptedNetwork {
    state: Arc<StdMutex<NetworkState>>,
}

impl ScriptedNetwork {
    /// Creates a network with open ports and no DNS records.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a network resolving names to the addresses `backend` assigns.
    #[must_use]
    pub fn mirroring(backend: &ScriptedBackend) -> Self {
        let network = Self::default();
        network.lock().mirror = Some(backend.clone());
        network
    }

    fn lock(&self) -> StdMutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves `host` to `address`.
    pub fn add_record(&self, host: &str, address: IpAddr) {
        self.lock().records.insert(host.to_owned(), address);
    }

    /// Fails the first `checks` connection attempts to `address`.
    pub fn close_for(&self, address: IpAddr, checks: usize) {
        self.lock().closed_checks.insert(address, checks);
    }

    /// Fails every connection attempt to `address`.
    pub fn close_forever(&self, address: IpAddr) {
        self.lock().never_open.insert(address);
    }

    /// Fails the first `lookups` resolutions of `host`.
    pub fn fail_lookups(&self, host: &str, lookups: usize) {
        self.lock().failed_lookups.insert(host.to_owned(), lookups);
    }

    /// Addresses probed so far.
    #[must_use]
    pub fn port_checks(&self) -> Vec<SocketAddr> {
        self.lock().port_checks.clone()
    }

    /// Host names resolved so far.
    #[must_use]
    pub fn lookups(&self) -> Vec<String> {
        self.lock().lookups.clone()
    }
}

impl NetworkProbe for ScriptedNetwork {
    fn port_open(&self, addr: SocketAddr) -> ProbeFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.lock();
            state.port_checks.push(addr);
            if state.never_open.contains(&addr.ip()) {
                return false;
            }
            match state.closed_checks.get_mut(&addr.ip()) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    false
                }
                _ => true,
            }
        })
    }

    fn resolve<'a>(&'a self, host: &'a str) -> ProbeFuture<'a, Option<IpAddr>> {
        Box::pin(async move {
            let mirror = {
                let mut state = self.lock();
                state.lookups.push(host.to_owned());
                if let Some(remaining) = state.failed_lookups.get_mut(host)
                    && *remaining > 0
                {
                    *remaining -= 1;
                    return None;
                }
                if let Some(address) = state.records.get(host) {
                    return Some(*address);
                }
                state.mirror.clone()
            };
            let name = host.split('.').next().unwrap_or(host);
            mirror.and_then(|backend| backend.address_of(name))
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Flavors used across tests: `small` (2 GiB) and `large` (8 GiB).
#[must_use]
pub fn sample_flavors() -> Vec<Flavor> {
    vec![
        Flavor {
            id: String::from("flavor-small"),
            name: String::from("small"),
            ram: 2048,
        },
        Flavor {
            id: String::from("flavor-large"),
            name: String::from("large"),
            ram: 8192,
        },
    ]
}
