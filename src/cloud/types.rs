//! Wire types exchanged with the identity and compute services.

use serde::{Deserialize, Serialize};

use crate::backend::{Flavor, InstanceInfo};

/// Token and tenant obtained from the identity service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Session {
    /// Token sent as `X-Auth-Token`.
    pub token_id: String,
    /// Tenant identifier embedded in compute URLs.
    pub tenant_id: String,
}

/// Image known to the compute service.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Image {
    /// Provider identifier.
    pub id: String,
    /// Human readable name.
    #[serde(default)]
    pub name: String,
}

/// Network instances may attach to.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Network {
    /// Provider identifier.
    pub id: String,
    /// Network label used in configuration.
    #[serde(default)]
    pub label: String,
}

/// Instance quota reported by the compute service.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub struct InstanceLimits {
    /// Maximum number of instances the tenant may own. Negative means
    /// unlimited.
    #[serde(default = "unlimited", rename = "maxTotalInstances")]
    pub max_total_instances: i64,
    /// Instances currently counted against the quota.
    #[serde(default, rename = "totalInstancesUsed")]
    pub total_instances_used: i64,
}

const fn unlimited() -> i64 {
    -1
}

impl Default for InstanceLimits {
    fn default() -> Self {
        Self {
            max_total_instances: unlimited(),
            total_instances_used: 0,
        }
    }
}

impl InstanceLimits {
    /// Instances that can still be created, `None` when unlimited.
    #[must_use]
    pub const fn headroom(&self) -> Option<i64> {
        if self.max_total_instances < 0 {
            None
        } else {
            Some(self.max_total_instances - self.total_instances_used)
        }
    }
}

#[derive(Serialize)]
pub(super) struct AuthRequest<'a> {
    pub auth: AuthBody<'a>,
}

#[derive(Serialize)]
pub(super) struct AuthBody<'a> {
    #[serde(rename = "tenantName")]
    pub tenant_name: &'a str,
    #[serde(rename = "passwordCredentials")]
    pub password_credentials: PasswordCredentials<'a>,
}

#[derive(Serialize)]
pub(super) struct PasswordCredentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Deserialize)]
pub(super) struct TokenEnvelope {
    pub access: Access,
}

#[derive(Deserialize)]
pub(super) struct Access {
    pub token: Token,
}

#[derive(Deserialize)]
pub(super) struct Token {
    pub id: String,
    pub tenant: Tenant,
}

#[derive(Deserialize)]
pub(super) struct Tenant {
    pub id: String,
}

#[derive(Deserialize)]
pub(super) struct ImageList {
    pub images: Vec<Image>,
}

#[derive(Deserialize)]
pub(super) struct FlavorList {
    pub flavors: Vec<Flavor>,
}

#[derive(Deserialize)]
pub(super) struct NetworkList {
    pub networks: Vec<Network>,
}

#[derive(Deserialize)]
pub(super) struct ServerList {
    pub servers: Vec<InstanceInfo>,
}

#[derive(Deserialize)]
pub(super) struct ServerEnvelope {
    pub server: InstanceInfo,
}

#[derive(Serialize)]
pub(super) struct CreateRequest<'a> {
    pub server: CreateServer<'a>,
}

#[derive(Serialize)]
pub(super) struct CreateServer<'a> {
    pub name: &'a str,
    #[serde(rename = "imageRef")]
    pub image_ref: &'a str,
    #[serde(rename = "flavorRef")]
    pub flavor_ref: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub key_name: &'a str,
    pub min_count: usize,
    pub max_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<NetworkAttachment>,
    pub user_data: String,
}

#[derive(Serialize)]
pub(super) struct NetworkAttachment {
    pub uuid: String,
}

#[derive(Serialize)]
pub(super) struct RebuildRequest<'a> {
    pub rebuild: RebuildServer<'a>,
}

#[derive(Serialize)]
pub(super) struct RebuildServer<'a> {
    pub name: &'a str,
    #[serde(rename = "imageRef")]
    pub image_ref: &'a str,
    #[serde(rename = "adminPass")]
    pub admin_pass: &'a str,
}

#[derive(Deserialize)]
pub(super) struct LimitsEnvelope {
    pub limits: Limits,
}

#[derive(Deserialize)]
pub(super) struct Limits {
    #[serde(default)]
    pub absolute: InstanceLimits,
}
