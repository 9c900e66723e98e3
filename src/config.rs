//! Configuration loading via `ortho-config`.
//!
//! Two layers are loaded: [`CloudConfig`] carries the cloud credentials and
//! endpoint (the conventional `OS_*` environment variables), while
//! [`HarnessConfig`] carries naming, playbook, and timing settings discovered
//! from `kvtestbed.toml` or `KVTESTBED_*` variables.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::planner::ProvisionTemplate;
use crate::probe::ProbeSettings;

/// Cloud control-plane settings.
///
/// Credentials are deliberately optional: their absence surfaces on the
/// first authenticated call rather than at load time.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "OS")]
pub struct CloudConfig {
    /// Login used to obtain a token.
    pub username: Option<String>,
    /// Password used to obtain a token; also the admin password on rebuild.
    pub password: Option<String>,
    /// Base URL of the control plane, for example `http://cloud.example`.
    pub url: Option<String>,
    /// Tenant (project) name sent with every request.
    pub tenant_name: Option<String>,
    /// Port of the identity service.
    #[ortho_config(default = 5000)]
    pub identity_port: u16,
    /// Port of the compute service.
    #[ortho_config(default = 8774)]
    pub compute_port: u16,
    /// Image every test instance boots from.
    #[ortho_config(default = "storage-node".to_owned())]
    pub image_name: String,
    /// Key pair injected into new instances. Empty disables injection.
    #[ortho_config(default = String::new())]
    pub key_name: String,
    /// Comma separated network labels new instances attach to.
    #[ortho_config(default = String::new())]
    pub networks: String,
    /// Per-request timeout for control-plane calls.
    #[ortho_config(default = 60)]
    pub request_timeout_secs: u64,
}

impl CloudConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kvtestbed")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Network labels parsed from [`CloudConfig::networks`].
    #[must_use]
    pub fn network_labels(&self) -> Vec<String> {
        self.networks
            .split(',')
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Timeout applied to each control-plane request.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Harness settings: naming, playbooks, and wait behaviour.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KVTESTBED",
    discovery(
        app_name = "kvtestbed",
        env_var = "KVTESTBED_CONFIG_PATH",
        config_file_name = "kvtestbed.toml",
        dotfile_name = ".kvtestbed.toml",
        project_file_name = "kvtestbed.toml"
    )
)]
pub struct HarnessConfig {
    /// Path to the playbook runner executable.
    #[ortho_config(default = "ansible-playbook".to_owned())]
    pub playbook_bin: String,
    /// Path to the `ssh` executable used for fault injection.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user written into inventory host records.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// DNS suffix appended to instance names. Empty uses bare names.
    #[ortho_config(default = String::new())]
    pub host_domain: String,
    /// Base name of client instances.
    #[ortho_config(default = "kvtestbed-client".to_owned())]
    pub client_base_name: String,
    /// Base name of server instances.
    #[ortho_config(default = "kvtestbed-server".to_owned())]
    pub server_base_name: String,
    /// Playbook installing packages on every host.
    #[ortho_config(default = "test-env-prepare".to_owned())]
    pub base_setup_playbook: String,
    /// Playbook starting the storage processes.
    #[ortho_config(default = "storage-start".to_owned())]
    pub start_playbook: String,
    /// Playbook stopping the storage processes.
    #[ortho_config(default = "storage-stop".to_owned())]
    pub stop_playbook: String,
    /// Ceiling for each availability phase, in seconds.
    #[ortho_config(default = 300)]
    pub wait_timeout_secs: u64,
    /// Delay between availability polls, in milliseconds. Zero polls
    /// back-to-back.
    #[ortho_config(default = 1000)]
    pub poll_interval_ms: u64,
    /// Administrative port probed for reachability.
    #[ortho_config(default = 22)]
    pub admin_port: u16,
    /// Delete preference assumed for tests that do not state one.
    #[ortho_config(default = true)]
    pub default_delete_nodes: bool,
}

impl HarnessConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kvtestbed")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the first empty field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, field) in [
            (&self.playbook_bin, "playbook_bin"),
            (&self.ssh_bin, "ssh_bin"),
            (&self.ssh_user, "ssh_user"),
            (&self.client_base_name, "client_base_name"),
            (&self.server_base_name, "server_base_name"),
            (&self.base_setup_playbook, "base_setup_playbook"),
            (&self.start_playbook, "start_playbook"),
            (&self.stop_playbook, "stop_playbook"),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "{field}: set KVTESTBED_{} or add {field} to kvtestbed.toml",
                    field.to_uppercase()
                )));
            }
        }
        if self.client_base_name == self.server_base_name {
            return Err(ConfigError::Invalid(String::from(
                "client_base_name and server_base_name must differ",
            )));
        }
        Ok(())
    }

    /// Ceiling for each availability phase.
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Delay between availability polls, `None` when polling back-to-back.
    #[must_use]
    pub const fn poll_interval(&self) -> Option<Duration> {
        if self.poll_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.poll_interval_ms))
        }
    }

    /// Probe settings derived from the timing and addressing fields.
    #[must_use]
    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            phase_timeout: self.wait_timeout(),
            poll_interval: self.poll_interval(),
            admin_port: self.admin_port,
            domain: self.host_domain.clone(),
        }
    }

    /// Builds the instance template shared by every planned class.
    #[must_use]
    pub fn provision_template(&self, cloud: &CloudConfig) -> ProvisionTemplate {
        ProvisionTemplate {
            client_base_name: self.client_base_name.clone(),
            server_base_name: self.server_base_name.clone(),
            image: cloud.image_name.clone(),
            key_name: cloud.key_name.clone(),
            networks: cloud.network_labels(),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates mutually inconsistent values.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
