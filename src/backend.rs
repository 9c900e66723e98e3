//! Backend abstraction over the cloud control plane.
//!
//! The orchestrator and the availability probe only talk to the cloud through
//! [`Backend`], so fakes can stand in for the real compute API in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use serde::Deserialize;

/// Role an instance plays in the test environment.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Role {
    /// Hosts running the storage client and test payloads.
    Client,
    /// Hosts running the storage processes under test.
    Server,
}

impl Role {
    /// Returns the plural label used in inventories and variable files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "clients",
            Self::Server => "servers",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A homogeneous batch of instances created under one base name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceClass {
    /// Role served by every instance of the batch.
    pub role: Role,
    /// Base name; instances are named after it (see [`instance_names`]).
    pub name: String,
    /// Human readable image name, resolved to a provider id on creation.
    pub image: String,
    /// Flavor (size class) name, resolved to a provider id on creation.
    pub flavor_name: String,
    /// Number of instances to create.
    pub count: usize,
    /// SSH key pair registered with the provider. May be empty.
    pub key_name: String,
    /// Network labels the instances attach to.
    pub networks: Vec<String>,
}

impl InstanceClass {
    /// Names the provider assigns to the instances of this batch.
    #[must_use]
    pub fn instance_names(&self) -> Vec<String> {
        instance_names(&self.name, self.count)
    }
}

/// Expands a base name into the names of a batch of `count` instances.
///
/// A single instance keeps the bare base name; larger batches get a `-N`
/// suffix numbered from one.
///
/// ```
/// use kvtestbed::backend::instance_names;
///
/// assert_eq!(instance_names("node", 1), vec!["node"]);
/// assert_eq!(instance_names("node", 2), vec!["node-1", "node-2"]);
/// ```
#[must_use]
pub fn instance_names(base: &str, count: usize) -> Vec<String> {
    if count == 1 {
        return vec![base.to_owned()];
    }
    (1..=count).map(|index| format!("{base}-{index}")).collect()
}

/// Instance description as reported by the compute API.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct InstanceInfo {
    /// Provider identifier.
    pub id: String,
    /// Instance name.
    #[serde(default)]
    pub name: String,
    /// Provider status, `ACTIVE` once the instance is running.
    #[serde(default)]
    pub status: String,
    /// Addresses keyed by network label.
    #[serde(default)]
    pub addresses: BTreeMap<String, Vec<AddressInfo>>,
    /// Image reference; an object with `id` and `links` for image-backed
    /// instances.
    #[serde(default)]
    pub image: serde_json::Value,
}

impl InstanceInfo {
    /// Returns `true` when the provider reports the instance as running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == "ACTIVE"
    }

    /// First address of the first network interface, if any.
    #[must_use]
    pub fn first_address(&self) -> Option<IpAddr> {
        self.addresses
            .values()
            .next()?
            .first()?
            .addr
            .parse()
            .ok()
    }

    /// Link to the image the instance was booted from.
    #[must_use]
    pub fn image_href(&self) -> Option<&str> {
        self.image.get("links")?.get(0)?.get("href")?.as_str()
    }
}

/// One address attached to an instance network interface.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct AddressInfo {
    /// IP address in textual form.
    pub addr: String,
}

/// Compute flavor and the RAM it provides.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Flavor {
    /// Provider identifier.
    pub id: String,
    /// Flavor name used in test declarations.
    pub name: String,
    /// RAM in megabytes; used to order flavors.
    pub ram: u64,
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Operations the harness needs from a cloud provider.
pub trait Backend {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Lists the flavors offered by the provider.
    fn flavors(&self) -> BackendFuture<'_, Vec<Flavor>, Self::Error>;

    /// Looks an instance up by name, returning `None` when it does not exist.
    fn instance_by_name<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<InstanceInfo>, Self::Error>;

    /// Requests creation of every instance in `class`.
    fn create<'a>(&'a self, class: &'a InstanceClass)
    -> BackendFuture<'a, InstanceInfo, Self::Error>;

    /// Deletes the named instance. Resolves to `false` when it does not exist.
    fn delete<'a>(&'a self, name: &'a str) -> BackendFuture<'a, bool, Self::Error>;

    /// Re-provisions the named instance from its current image. Resolves to
    /// `None` when it does not exist.
    fn rebuild<'a>(&'a self, name: &'a str)
    -> BackendFuture<'a, Option<InstanceInfo>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, &[])]
    #[case(1, &["base"])]
    #[case(3, &["base-1", "base-2", "base-3"])]
    fn instance_names_follow_count(#[case] count: usize, #[case] expected: &[&str]) {
        assert_eq!(instance_names("base", count), expected);
    }

    #[test]
    fn first_address_reads_first_network() {
        let info: InstanceInfo = serde_json::from_str(
            r#"{"id":"1","status":"ACTIVE","addresses":{
                "b-net":[{"addr":"10.0.0.9"}],
                "a-net":[{"addr":"10.0.0.5"},{"addr":"10.0.0.6"}]}}"#,
        )
        .unwrap_or_else(|err| panic!("instance json: {err}"));

        assert!(info.is_active());
        assert_eq!(
            info.first_address().map(|ip| ip.to_string()).as_deref(),
            Some("10.0.0.5")
        );
    }

    #[test]
    fn image_href_reads_first_link() {
        let info: InstanceInfo = serde_json::from_str(
            r#"{"id":"1","image":{"id":"img","links":[{"href":"http://cloud/images/img"}]}}"#,
        )
        .unwrap_or_else(|err| panic!("instance json: {err}"));

        assert_eq!(info.image_href(), Some("http://cloud/images/img"));
        assert_eq!(InstanceInfo::default().image_href(), None);
    }
}
