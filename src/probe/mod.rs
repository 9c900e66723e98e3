//! Availability probe for freshly created instances.
//!
//! The probe drains three work queues in sequence: instances waiting to
//! report `ACTIVE`, addresses waiting to accept a TCP handshake on the
//! administrative port, and host names waiting to resolve to the address the
//! cloud reported. Each queue is popped from the back and re-filled at the
//! front when an item is not ready yet. Every phase has its own deadline.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::backend::{Backend, InstanceInfo};
use crate::inventory::qualify;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Future returned by [`NetworkProbe`] operations.
pub type ProbeFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Network checks used by the probe, abstracted so tests can script them.
pub trait NetworkProbe {
    /// Resolves to `true` when a TCP handshake with `addr` succeeds.
    fn port_open(&self, addr: SocketAddr) -> ProbeFuture<'_, bool>;

    /// Resolves `host` to an address, or `None` when resolution fails.
    fn resolve<'a>(&'a self, host: &'a str) -> ProbeFuture<'a, Option<IpAddr>>;
}

/// Network checks against the real host resolver and TCP stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemNetwork;

impl NetworkProbe for SystemNetwork {
    fn port_open(&self, addr: SocketAddr) -> ProbeFuture<'_, bool> {
        Box::pin(async move {
            matches!(
                timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
                Ok(Ok(_))
            )
        })
    }

    fn resolve<'a>(&'a self, host: &'a str) -> ProbeFuture<'a, Option<IpAddr>> {
        Box::pin(async move {
            let addresses: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
                .await
                .ok()?
                .map(|addr| addr.ip())
                .collect();
            addresses
                .iter()
                .find(|ip| ip.is_ipv4())
                .or_else(|| addresses.first())
                .copied()
        })
    }
}

/// Phase of the availability probe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Waiting for the cloud to report instances as `ACTIVE`.
    Active,
    /// Waiting for the administrative port to accept connections.
    AdminPort,
    /// Waiting for host names to resolve to the reported addresses.
    Dns,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "activation",
            Self::AdminPort => "admin port reachability",
            Self::Dns => "name resolution",
        })
    }
}

/// Errors raised by [`AvailabilityProbe::wait`].
#[derive(Debug, Error)]
pub enum ProbeError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when a phase deadline passes before its queue empties.
    #[error("timed out after {timeout:?} waiting for {phase}; pending: {}", .pending.join(", "))]
    Timeout {
        /// Phase that did not complete.
        phase: Phase,
        /// Items still queued when the deadline passed.
        pending: Vec<String>,
        /// Ceiling that elapsed.
        timeout: Duration,
    },
    /// Raised when polling the cloud fails.
    #[error("cloud error while polling instances: {0}")]
    Cloud(#[source] E),
}

/// Timing and addressing settings for the probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProbeSettings {
    /// Ceiling applied to each phase independently.
    pub phase_timeout: Duration,
    /// Pause after an item is re-queued. `None` polls back-to-back.
    pub poll_interval: Option<Duration>,
    /// Port that must accept a TCP handshake.
    pub admin_port: u16,
    /// DNS suffix appended to instance names before resolution.
    pub domain: String,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            phase_timeout: Duration::from_secs(300),
            poll_interval: Some(Duration::from_secs(1)),
            admin_port: 22,
            domain: String::new(),
        }
    }
}

/// Reachable instance confirmed by the probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    /// Instance name.
    pub name: String,
    /// Fully qualified host name.
    pub host: String,
    /// Address reported by the cloud and confirmed by DNS.
    pub address: IpAddr,
}

/// Waits for batches of instances to become reachable.
#[derive(Clone, Debug)]
pub struct AvailabilityProbe<N> {
    network: N,
    settings: ProbeSettings,
}

impl<N: NetworkProbe> AvailabilityProbe<N> {
    /// Creates a probe using `network` for reachability checks.
    #[must_use]
    pub const fn new(network: N, settings: ProbeSettings) -> Self {
        Self { network, settings }
    }

    /// Settings the probe was built with.
    #[must_use]
    pub const fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Waits until every named instance is active, reachable, and resolvable.
    ///
    /// Endpoints are returned in the order of `names`.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Timeout`] when a phase exceeds its ceiling and
    /// [`ProbeError::Cloud`] when the backend cannot be polled.
    pub async fn wait<B: Backend>(
        &self,
        backend: &B,
        names: &[String],
    ) -> Result<Vec<Endpoint>, ProbeError<B::Error>> {
        let addresses = self.wait_active(backend, names).await?;
        let endpoints: Vec<Endpoint> = names
            .iter()
            .filter_map(|name| {
                addresses.get(name).map(|address| Endpoint {
                    name: name.clone(),
                    host: qualify(name, &self.settings.domain),
                    address: *address,
                })
            })
            .collect();
        self.wait_admin_port::<B::Error>(&endpoints).await?;
        self.wait_dns::<B::Error>(&endpoints).await?;
        info!(count = endpoints.len(), "all instances available");
        Ok(endpoints)
    }

    /// Runs [`AvailabilityProbe::wait`] and reduces the outcome to a flag.
    pub async fn check_availability<B: Backend>(&self, backend: &B, names: &[String]) -> bool {
        match self.wait(backend, names).await {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "instances did not become available");
                false
            }
        }
    }

    async fn wait_active<B: Backend>(
        &self,
        backend: &B,
        names: &[String],
    ) -> Result<BTreeMap<String, IpAddr>, ProbeError<B::Error>> {
        info!(count = names.len(), "waiting for instances to become active");
        let deadline = Instant::now() + self.settings.phase_timeout;
        let mut queue: VecDeque<String> = names.iter().cloned().collect();
        let mut addresses = BTreeMap::new();

        while let Some(name) = queue.pop_back() {
            let info = backend
                .instance_by_name(&name)
                .await
                .map_err(ProbeError::Cloud)?
                .filter(InstanceInfo::is_active);
            match info.map(|info| info.first_address()) {
                Some(Some(address)) => {
                    debug!(%name, %address, "instance active");
                    addresses.insert(name, address);
                    continue;
                }
                Some(None) => warn!(%name, "instance active without an address"),
                None => {}
            }
            queue.push_front(name);
            self.pause::<_, B::Error>(Phase::Active, deadline, &queue)
                .await?;
        }
        Ok(addresses)
    }

    async fn wait_admin_port<E: std::error::Error + 'static>(
        &self,
        endpoints: &[Endpoint],
    ) -> Result<(), ProbeError<E>> {
        info!(
            port = self.settings.admin_port,
            "waiting for instances to accept connections"
        );
        let deadline = Instant::now() + self.settings.phase_timeout;
        let mut queue: VecDeque<&Endpoint> = endpoints.iter().collect();

        while let Some(endpoint) = queue.pop_back() {
            let addr = SocketAddr::new(endpoint.address, self.settings.admin_port);
            if self.network.port_open(addr).await {
                debug!(name = %endpoint.name, %addr, "admin port open");
                continue;
            }
            queue.push_front(endpoint);
            self.pause::<_, E>(Phase::AdminPort, deadline, &queue)
                .await?;
        }
        Ok(())
    }

    async fn wait_dns<E: std::error::Error + 'static>(
        &self,
        endpoints: &[Endpoint],
    ) -> Result<(), ProbeError<E>> {
        info!("waiting for host names to resolve to instance addresses");
        let deadline = Instant::now() + self.settings.phase_timeout;
        let mut queue: VecDeque<&Endpoint> = endpoints.iter().collect();

        while let Some(endpoint) = queue.pop_back() {
            let resolved = self.network.resolve(&endpoint.host).await;
            if resolved == Some(endpoint.address) {
                debug!(host = %endpoint.host, address = %endpoint.address, "name resolves");
                continue;
            }
            debug!(host = %endpoint.host, ?resolved, expected = %endpoint.address, "name mismatch");
            queue.push_front(endpoint);
            self.pause::<_, E>(Phase::Dns, deadline, &queue).await?;
        }
        Ok(())
    }

    async fn pause<T: PendingLabel, E: std::error::Error + 'static>(
        &self,
        phase: Phase,
        deadline: Instant,
        queue: &VecDeque<T>,
    ) -> Result<(), ProbeError<E>> {
        if Instant::now() > deadline {
            return Err(ProbeError::Timeout {
                phase,
                pending: queue.iter().map(PendingLabel::label).collect(),
                timeout: self.settings.phase_timeout,
            });
        }
        if let Some(interval) = self.settings.poll_interval {
            sleep(interval).await;
        } else {
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

trait PendingLabel {
    fn label(&self) -> String;
}

impl PendingLabel for String {
    fn label(&self) -> String {
        self.clone()
    }
}

impl PendingLabel for &Endpoint {
    fn label(&self) -> String {
        self.name.clone()
    }
}
