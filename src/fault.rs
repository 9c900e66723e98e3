//! Fault injection against storage nodes over SSH.
//!
//! [`FaultInjector`] is used alongside a storage client handle by test
//! payloads: it drops and resumes a node's traffic with an `iptables` rule
//! and shapes its bandwidth with a `tc` token bucket filter.

use std::borrow::Cow;
use std::ffi::OsString;
use std::fmt;
use std::str::FromStr;

use shell_escape::unix::escape;
use thiserror::Error;
use tracing::info;

use crate::command::{CommandError, CommandRunner};

/// Network interface shaped when none is configured.
pub const DEFAULT_INTERFACE: &str = "eth0";

/// Errors raised while injecting faults.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FaultError {
    /// Raised when a node descriptor cannot be parsed.
    #[error("invalid node '{input}': {message}")]
    InvalidNode {
        /// Descriptor as given.
        input: String,
        /// Reason the descriptor was rejected.
        message: String,
    },
    /// Raised when a bandwidth rate is not a plain `tc` rate.
    #[error("invalid rate '{0}': expected a number with an optional unit such as 10mbit")]
    InvalidRate(String),
    /// Raised when `ssh` cannot be started.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when the remote command fails.
    #[error("{action} on {host} failed (exit code: {}): {stderr}", .code.map_or_else(|| String::from("none"), |code| code.to_string()))]
    Remote {
        /// Fault being applied.
        action: FaultAction,
        /// Host the command ran on.
        host: String,
        /// Exit code reported by `ssh`.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
}

/// Storage endpoint addressed by test payloads.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Node {
    /// Host name or address.
    pub host: String,
    /// Storage port.
    pub port: u16,
    /// Storage group the node serves.
    pub group: u32,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.group)
    }
}

impl FromStr for Node {
    type Err = FaultError;

    /// Parses `host:port:group`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| FaultError::InvalidNode {
            input: input.to_owned(),
            message: message.to_owned(),
        };
        let mut parts = input.rsplitn(3, ':');
        let (Some(group), Some(port), Some(host)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("expected host:port:group"));
        };
        if host.is_empty() {
            return Err(invalid("host is empty"));
        }
        Ok(Self {
            host: host.to_owned(),
            port: port.parse().map_err(|_| invalid("port is not a number"))?,
            group: group.parse().map_err(|_| invalid("group is not a number"))?,
        })
    }
}

/// Fault applied to a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultAction {
    /// Drop inbound traffic to the storage port.
    Drop,
    /// Remove a previously installed drop rule.
    Resume,
    /// Install a bandwidth limit.
    Limit,
    /// Remove a bandwidth limit.
    Clear,
}

impl fmt::Display for FaultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Drop => "drop",
            Self::Resume => "resume",
            Self::Limit => "bandwidth limit",
            Self::Clear => "bandwidth clear",
        })
    }
}

/// Applies faults to nodes by running commands over `ssh`.
#[derive(Clone, Debug)]
pub struct FaultInjector<R> {
    runner: R,
    ssh_bin: String,
    ssh_user: String,
    interface: String,
}

impl<R: CommandRunner> FaultInjector<R> {
    /// Creates an injector logging in as `ssh_user` via `ssh_bin`.
    #[must_use]
    pub fn new(runner: R, ssh_bin: impl Into<String>, ssh_user: impl Into<String>) -> Self {
        Self {
            runner,
            ssh_bin: ssh_bin.into(),
            ssh_user: ssh_user.into(),
            interface: String::from(DEFAULT_INTERFACE),
        }
    }

    /// Overrides the interface shaped by bandwidth limits.
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    /// Drops inbound TCP traffic to the node's storage port.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError`] when `ssh` or the remote command fails.
    pub fn drop_node(&self, node: &Node) -> Result<(), FaultError> {
        self.apply(node, FaultAction::Drop, &iptables_rule("--append", node.port))
    }

    /// Removes the drop rule installed by [`FaultInjector::drop_node`].
    ///
    /// # Errors
    ///
    /// Returns [`FaultError`] when `ssh` or the remote command fails.
    pub fn resume_node(&self, node: &Node) -> Result<(), FaultError> {
        self.apply(node, FaultAction::Resume, &iptables_rule("--delete", node.port))
    }

    /// Limits egress bandwidth of the node to `rate` (a `tc` rate such as
    /// `10mbit`).
    ///
    /// # Errors
    ///
    /// Returns [`FaultError::InvalidRate`] for malformed rates, or any
    /// failure from `ssh` or the remote command.
    pub fn limit_bandwidth(&self, node: &Node, rate: &str) -> Result<(), FaultError> {
        validate_rate(rate)?;
        let words = [
            "tc",
            "qdisc",
            "replace",
            "dev",
            self.interface.as_str(),
            "root",
            "tbf",
            "rate",
            rate,
            "burst",
            "32kbit",
            "latency",
            "400ms",
        ];
        self.apply(node, FaultAction::Limit, &words.map(str::to_owned))
    }

    /// Removes a bandwidth limit.
    ///
    /// # Errors
    ///
    /// Returns [`FaultError`] when `ssh` or the remote command fails.
    pub fn clear_bandwidth(&self, node: &Node) -> Result<(), FaultError> {
        let words = ["tc", "qdisc", "del", "dev", self.interface.as_str(), "root"];
        self.apply(node, FaultAction::Clear, &words.map(str::to_owned))
    }

    fn apply(&self, node: &Node, action: FaultAction, words: &[String]) -> Result<(), FaultError> {
        let remote = words
            .iter()
            .map(|word| escape(Cow::Borrowed(word.as_str())))
            .collect::<Vec<_>>()
            .join(" ");
        let target = if self.ssh_user.is_empty() {
            node.host.clone()
        } else {
            format!("{}@{}", self.ssh_user, node.host)
        };
        let args = [
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from(target),
            OsString::from(remote),
        ];
        info!(%node, %action, "injecting fault");
        let output = self.runner.run(&self.ssh_bin, &args)?;
        if output.is_success() {
            return Ok(());
        }
        Err(FaultError::Remote {
            action,
            host: node.host.clone(),
            code: output.code,
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

fn iptables_rule(operation: &str, port: u16) -> Vec<String> {
    [
        "iptables", operation, "INPUT", "--proto", "tcp", "--dport",
    ]
    .into_iter()
    .map(str::to_owned)
    .chain([port.to_string(), String::from("--jump"), String::from("DROP")])
    .collect()
}

fn validate_rate(rate: &str) -> Result<(), FaultError> {
    let unit = rate.trim_start_matches(|ch: char| ch.is_ascii_digit());
    let has_digits = unit.len() < rate.len();
    if !has_digits || !unit.chars().all(|ch| ch.is_ascii_alphabetic()) {
        return Err(FaultError::InvalidRate(rate.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::rstest;

    fn node() -> Node {
        Node {
            host: String::from("kv-server-1.lab"),
            port: 1025,
            group: 2,
        }
    }

    #[rstest]
    #[case("kv-server-1:1025:2", "kv-server-1", 1025, 2)]
    #[case("::1:1025:7", "::1", 1025, 7)]
    fn node_parses_host_port_group(
        #[case] input: &str,
        #[case] host: &str,
        #[case] port: u16,
        #[case] group: u32,
    ) {
        let parsed: Node = input.parse().unwrap_or_else(|err| panic!("parse: {err}"));
        assert_eq!(
            parsed,
            Node {
                host: host.to_owned(),
                port,
                group,
            }
        );
        assert_eq!(parsed.to_string(), input);
    }

    #[rstest]
    #[case("host:1025")]
    #[case(":1025:1")]
    #[case("host:port:1")]
    #[case("host:1025:group")]
    fn node_rejects_malformed_descriptors(#[case] input: &str) {
        assert!(matches!(
            input.parse::<Node>(),
            Err(FaultError::InvalidNode { .. })
        ));
    }

    #[test]
    fn drop_and_resume_toggle_iptables_rule() {
        let scripted = ScriptedRunner::new();
        scripted.push_success();
        scripted.push_success();
        let injector = FaultInjector::new(scripted.clone(), "ssh", "root");

        injector
            .drop_node(&node())
            .unwrap_or_else(|err| panic!("drop: {err}"));
        injector
            .resume_node(&node())
            .unwrap_or_else(|err| panic!("resume: {err}"));

        let commands: Vec<String> = scripted
            .invocations()
            .iter()
            .map(|invocation| invocation.command_string())
            .collect();
        assert_eq!(
            commands,
            vec![
                "ssh -o BatchMode=yes root@kv-server-1.lab iptables --append INPUT --proto tcp --dport 1025 --jump DROP",
                "ssh -o BatchMode=yes root@kv-server-1.lab iptables --delete INPUT --proto tcp --dport 1025 --jump DROP",
            ]
        );
    }

    #[test]
    fn bandwidth_limit_uses_token_bucket_filter() {
        let scripted = ScriptedRunner::new();
        scripted.push_success();
        scripted.push_success();
        let injector = FaultInjector::new(scripted.clone(), "ssh", "").with_interface("ens3");

        injector
            .limit_bandwidth(&node(), "10mbit")
            .unwrap_or_else(|err| panic!("limit: {err}"));
        injector
            .clear_bandwidth(&node())
            .unwrap_or_else(|err| panic!("clear: {err}"));

        let invocations = scripted.invocations();
        assert_eq!(
            invocations[0].command_string(),
            "ssh -o BatchMode=yes kv-server-1.lab tc qdisc replace dev ens3 root tbf rate 10mbit burst 32kbit latency 400ms"
        );
        assert_eq!(
            invocations[1].command_string(),
            "ssh -o BatchMode=yes kv-server-1.lab tc qdisc del dev ens3 root"
        );
    }

    #[rstest]
    #[case("")]
    #[case("fast")]
    #[case("10 mbit")]
    #[case("10mbit; reboot")]
    fn malformed_rates_never_reach_ssh(#[case] rate: &str) {
        let scripted = ScriptedRunner::new();
        let injector = FaultInjector::new(scripted.clone(), "ssh", "root");
        assert_eq!(
            injector.limit_bandwidth(&node(), rate),
            Err(FaultError::InvalidRate(rate.to_owned()))
        );
        assert!(scripted.invocations().is_empty());
    }

    #[test]
    fn remote_failure_carries_stderr() {
        let scripted = ScriptedRunner::new();
        scripted.push_output(Some(1), "", "iptables: Bad rule\n");
        let injector = FaultInjector::new(scripted, "ssh", "root");

        let err = injector
            .resume_node(&node())
            .expect_err("remote failure should surface");
        assert_eq!(
            err.to_string(),
            "resume on kv-server-1.lab failed (exit code: 1): iptables: Bad rule"
        );
    }
}
