//! Grouped host inventories for the playbook runner.
//!
//! An inventory is an INI-like document. Sections are either concrete groups
//! listing host records, or `{group}:children` sections listing child group
//! names. Each context (a test, or the setup phase) gets its own document
//! whose concrete groups carry the context name, plus stable aliases
//! (`clients`, `servers`, `test`) that point at them.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use thiserror::Error;

use crate::backend::{Role, instance_names};

const CHILDREN_SUFFIX: &str = ":children";

/// Appends `domain` to `name`; an empty domain leaves the name bare.
#[must_use]
pub fn qualify(name: &str, domain: &str) -> String {
    let domain = domain.trim().trim_start_matches('.');
    if domain.is_empty() {
        name.to_owned()
    } else {
        format!("{name}.{domain}")
    }
}

/// Maps `(role, index)` to host names and inventory records.
///
/// Names follow the provisioned pool: a pool of one instance uses the bare
/// base name, larger pools number their members from one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NamingScheme {
    /// Base name of client instances.
    pub client_base: String,
    /// Base name of server instances.
    pub server_base: String,
    /// Number of provisioned client instances.
    pub client_pool: usize,
    /// Number of provisioned server instances.
    pub server_pool: usize,
    /// DNS suffix appended to instance names.
    pub domain: String,
    /// Remote user annotated on every host record.
    pub ssh_user: String,
}

impl NamingScheme {
    /// Instance name of the `index`-th (one-based) member of `role`.
    #[must_use]
    pub fn name_for(&self, role: Role, index: usize) -> String {
        let (base, pool) = match role {
            Role::Client => (&self.client_base, self.client_pool),
            Role::Server => (&self.server_base, self.server_pool),
        };
        if pool == 1 && index == 1 {
            base.clone()
        } else {
            format!("{base}-{index}")
        }
    }

    /// Every instance name of the provisioned pools, clients first.
    #[must_use]
    pub fn pool_names(&self) -> Vec<String> {
        let mut names = instance_names(&self.client_base, self.client_pool);
        names.extend(instance_names(&self.server_base, self.server_pool));
        names
    }

    /// Inventory line for the `index`-th member of `role`.
    #[must_use]
    pub fn host_record(&self, role: Role, index: usize) -> String {
        format!(
            "{} ansible_ssh_user={}",
            qualify(&self.name_for(role, index), &self.domain),
            self.ssh_user
        )
    }
}

/// Concrete group names used by one inventory context.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupNames {
    /// Concrete client group, `clients-{ctx}`.
    pub clients: String,
    /// Parent of the server sub-groups, `servers-{ctx}`.
    pub servers: String,
    /// Union of clients and servers, `test-{ctx}`.
    pub test: String,
}

impl GroupNames {
    /// Group names for the context called `ctx`.
    #[must_use]
    pub fn for_context(ctx: &str) -> Self {
        Self {
            clients: format!("{}-{ctx}", Role::Client),
            servers: format!("{}-{ctx}", Role::Server),
            test: format!("test-{ctx}"),
        }
    }
}

/// Hosts one context needs: a client count and per-sub-group server counts.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InventoryLayout {
    /// Number of client hosts.
    pub client_count: usize,
    /// Server hosts per sub-group, in sub-group order.
    pub server_groups: Vec<usize>,
}

impl InventoryLayout {
    /// Total number of server hosts across sub-groups.
    #[must_use]
    pub fn server_count(&self) -> usize {
        self.server_groups.iter().sum()
    }
}

/// One `[name]` section of an inventory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Section {
    /// Section header without brackets.
    pub name: String,
    /// Lines of the section: host records or child group names.
    pub entries: Vec<String>,
}

impl Section {
    fn new(name: impl Into<String>, entries: Vec<String>) -> Self {
        Self {
            name: name.into(),
            entries,
        }
    }

    fn children(name: &str, entries: Vec<String>) -> Self {
        Self::new(format!("{name}{CHILDREN_SUFFIX}"), entries)
    }
}

/// Raised when inventory text cannot be parsed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InventoryError {
    /// An entry appeared before any section header.
    #[error("line {line}: entry outside of any section")]
    OrphanEntry {
        /// One-based line number.
        line: usize,
    },
    /// A header was opened but never closed, or named nothing.
    #[error("line {line}: malformed section header")]
    MalformedHeader {
        /// One-based line number.
        line: usize,
    },
}

/// Ordered set of inventory sections.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InventoryDocument {
    sections: Vec<Section>,
}

impl InventoryDocument {
    /// Builds the inventory of context `ctx`.
    ///
    /// Server names advance continuously across sub-groups, so the second
    /// sub-group starts where the first one ended.
    #[must_use]
    pub fn build(ctx: &str, layout: &InventoryLayout, naming: &NamingScheme) -> Self {
        let groups = GroupNames::for_context(ctx);
        let mut sections = Vec::with_capacity(layout.server_groups.len() + 6);

        let clients = (1..=layout.client_count)
            .map(|index| naming.host_record(Role::Client, index))
            .collect();
        sections.push(Section::new(groups.clients.clone(), clients));
        sections.push(Section::children(
            Role::Client.as_str(),
            vec![groups.clients.clone()],
        ));

        let mut next_server = 1;
        let mut sub_groups = Vec::with_capacity(layout.server_groups.len());
        for (position, count) in layout.server_groups.iter().enumerate() {
            let name = format!("{}-{}", Role::Server, position + 1);
            let hosts = (next_server..next_server + count)
                .map(|index| naming.host_record(Role::Server, index))
                .collect();
            next_server += count;
            sections.push(Section::new(name.clone(), hosts));
            sub_groups.push(name);
        }
        sections.push(Section::children(&groups.servers, sub_groups));
        sections.push(Section::children(
            Role::Server.as_str(),
            vec![groups.servers.clone()],
        ));

        sections.push(Section::children(
            &groups.test,
            vec![groups.clients, groups.servers],
        ));
        sections.push(Section::children("test", vec![groups.test]));

        Self { sections }
    }

    /// Parses inventory text. Blank lines and `#`/`;` comments are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError`] on orphan entries or broken headers.
    pub fn parse(text: &str) -> Result<Self, InventoryError> {
        let mut sections: Vec<Section> = Vec::new();
        for (offset, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .ok_or(InventoryError::MalformedHeader { line: offset + 1 })?;
                sections.push(Section::new(name, Vec::new()));
                continue;
            }
            let section = sections
                .last_mut()
                .ok_or(InventoryError::OrphanEntry { line: offset + 1 })?;
            section.entries.push(line.to_owned());
        }
        Ok(Self { sections })
    }

    /// Renders the document; rendering is deterministic.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            writeln!(out, "[{}]", section.name).ok();
            for entry in &section.entries {
                writeln!(out, "{entry}").ok();
            }
            out.push('\n');
        }
        out
    }

    /// Sections in document order.
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Entries of the section called `name`, if present.
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&[String]> {
        self.sections
            .iter()
            .find(|section| section.name == name)
            .map(|section| section.entries.as_slice())
    }

    /// Host names reachable from `group`, following `:children` sections.
    #[must_use]
    pub fn hosts_of(&self, group: &str) -> BTreeSet<String> {
        let mut hosts = BTreeSet::new();
        let mut visited = BTreeSet::new();
        self.collect_hosts(group, &mut visited, &mut hosts);
        hosts
    }

    fn collect_hosts(
        &self,
        group: &str,
        visited: &mut BTreeSet<String>,
        hosts: &mut BTreeSet<String>,
    ) {
        if !visited.insert(group.to_owned()) {
            return;
        }
        if let Some(entries) = self.section(group) {
            hosts.extend(
                entries
                    .iter()
                    .filter_map(|entry| entry.split_whitespace().next())
                    .map(str::to_owned),
            );
        }
        if let Some(children) = self.section(&format!("{group}{CHILDREN_SUFFIX}")) {
            for child in children {
                self.collect_hosts(child.trim(), visited, hosts);
            }
        }
    }
}
