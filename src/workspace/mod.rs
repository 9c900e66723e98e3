//! Layout of the playbook directory and the files the harness writes there.
//!
//! Playbooks live at `{root}/{playbook}.yml`, inventories at
//! `{root}/{context}.hosts`, and group variables at
//! `{root}/group_vars/{group}.yml`.

pub(crate) mod files;
pub mod vars;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::inventory::InventoryDocument;

pub use files::FileError;
pub use vars::{VarsError, VarsSnapshot, read_vars, update_vars, write_vars};

/// Paths inside the playbook directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnsibleWorkspace {
    root: Utf8PathBuf,
}

impl AnsibleWorkspace {
    /// Workspace rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Playbook directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Path of the playbook called `name`.
    #[must_use]
    pub fn playbook_path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(format!("{name}.yml"))
    }

    /// Path of the inventory of context `ctx`.
    #[must_use]
    pub fn inventory_path(&self, ctx: &str) -> Utf8PathBuf {
        self.root.join(format!("{ctx}.hosts"))
    }

    /// Path of the variable file of `group`.
    #[must_use]
    pub fn group_vars_path(&self, group: &str) -> Utf8PathBuf {
        self.root.join("group_vars").join(format!("{group}.yml"))
    }

    /// Resolves a path given relative to the playbook directory.
    ///
    /// Callers pass declaration paths that have already been checked to stay
    /// below the root.
    #[must_use]
    pub fn resolve(&self, relative: &Utf8Path) -> Utf8PathBuf {
        self.root.join(relative)
    }

    /// Writes the inventory of context `ctx`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`FileError`] when the file cannot be written.
    pub fn write_inventory(
        &self,
        ctx: &str,
        document: &InventoryDocument,
    ) -> Result<Utf8PathBuf, FileError> {
        let path = self.inventory_path(ctx);
        files::write(&path, &document.render())?;
        debug!(%path, "wrote inventory");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{InventoryLayout, NamingScheme};
    use tempfile::TempDir;

    #[test]
    fn paths_follow_playbook_layout() {
        let workspace = AnsibleWorkspace::new("/srv/ansible");
        assert_eq!(
            workspace.playbook_path("storage-start"),
            "/srv/ansible/storage-start.yml"
        );
        assert_eq!(workspace.inventory_path("setup"), "/srv/ansible/setup.hosts");
        assert_eq!(
            workspace.group_vars_path("clients-basic"),
            "/srv/ansible/group_vars/clients-basic.yml"
        );
        assert_eq!(
            workspace.resolve(Utf8Path::new("host_vars/a.yml")),
            "/srv/ansible/host_vars/a.yml"
        );
        assert_eq!(workspace.resolve(Utf8Path::new("/etc/x.yml")), "/etc/x.yml");
    }

    #[test]
    fn write_inventory_round_trips() {
        let temp = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-utf8 temp dir: {}", path.display()));
        let workspace = AnsibleWorkspace::new(root);
        let naming = NamingScheme {
            client_base: String::from("c"),
            server_base: String::from("s"),
            client_pool: 1,
            server_pool: 1,
            domain: String::new(),
            ssh_user: String::from("root"),
        };
        let document = InventoryDocument::build(
            "setup",
            &InventoryLayout {
                client_count: 1,
                server_groups: vec![1],
            },
            &naming,
        );

        let path = workspace
            .write_inventory("setup", &document)
            .unwrap_or_else(|err| panic!("write: {err}"));

        let text = files::read_required(&path).unwrap_or_else(|err| panic!("read: {err}"));
        assert_eq!(InventoryDocument::parse(&text), Ok(document));
    }
}
