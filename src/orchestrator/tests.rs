//! Unit tests for the lifecycle orchestrator.

use std::time::Duration;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::backend::Role;
use crate::probe::ProbeSettings;
use crate::test_support::{
    ScriptedBackend, ScriptedNetwork, ScriptedPlaybooks, sample_flavors,
};
use crate::workspace::files;

const BASIC: &str = r#"{
    "playbook": "test-basic",
    "params": {"a": 1},
    "test_env_cfg": {
        "clients": {"count": 2, "flavor": "small"},
        "servers": {"count_per_group": [3], "flavor": "small"}
    }
}"#;

const QUORUM: &str = r#"{
    "playbook": "test-quorum",
    "test_env_cfg": {
        "clients": {"count": 5, "flavor": "large"},
        "servers": {"count_per_group": [2, 2], "flavor": "large"}
    }
}"#;

const SINGLE: &str = r#"{
    "playbook": "test-single",
    "test_env_cfg": {
        "clients": {"count": 1, "flavor": "small"},
        "servers": {"count_per_group": [1], "flavor": "small"}
    }
}"#;

type TestOrchestrator = LifecycleOrchestrator<ScriptedBackend, ScriptedNetwork, ScriptedPlaybooks>;

struct Harness {
    _temp: TempDir,
    root: Utf8PathBuf,
    backend: ScriptedBackend,
    network: ScriptedNetwork,
    playbooks: ScriptedPlaybooks,
}

impl Harness {
    fn orchestrator(&self) -> TestOrchestrator {
        let probe = AvailabilityProbe::new(
            self.network.clone(),
            ProbeSettings {
                phase_timeout: Duration::from_millis(200),
                poll_interval: None,
                admin_port: 22,
                domain: String::from("lab"),
            },
        );
        LifecycleOrchestrator::new(
            self.backend.clone(),
            probe,
            self.playbooks.clone(),
            OrchestratorSettings {
                workspace: AnsibleWorkspace::new(self.root.clone()),
                template: ProvisionTemplate {
                    client_base_name: String::from("kv-client"),
                    server_base_name: String::from("kv-server"),
                    image: String::from("storage-node"),
                    key_name: String::new(),
                    networks: Vec::new(),
                },
                playbooks: PlaybookNames {
                    base_setup: String::from("test-env-prepare"),
                    start: String::from("storage-start"),
                    stop: String::from("storage-stop"),
                },
                host_domain: String::from("lab"),
                ssh_user: String::from("root"),
                default_delete_nodes: true,
            },
        )
    }

    fn path(&self, relative: &str) -> Utf8PathBuf {
        self.root.join(relative)
    }

    fn write(&self, relative: &str, contents: &str) {
        files::write(&self.path(relative), contents)
            .unwrap_or_else(|err| panic!("write {relative}: {err}"));
    }

    fn read(&self, relative: &str) -> Option<String> {
        files::read_optional(&self.path(relative))
            .unwrap_or_else(|err| panic!("read {relative}: {err}"))
    }
}

#[fixture]
fn harness() -> Harness {
    let temp = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 temp dir: {}", path.display()));
    let backend = ScriptedBackend::new(sample_flavors());
    let network = ScriptedNetwork::mirroring(&backend);
    Harness {
        _temp: temp,
        root,
        backend,
        network,
        playbooks: ScriptedPlaybooks::new(),
    }
}

fn selection(tests: &[(&str, &str)]) -> DeclarationSet {
    DeclarationSet::from_declarations(tests.iter().map(|(name, body)| {
        TestDeclaration::from_json(name, body).unwrap_or_else(|err| panic!("decode {name}: {err}"))
    }))
    .unwrap_or_else(|err| panic!("selection: {err}"))
}

fn request(tests: &[(&str, &str)]) -> RunRequest {
    RunRequest {
        tests: selection(tests),
        ..RunRequest::default()
    }
}

fn yaml(text: &str) -> Mapping {
    serde_yaml::from_str(text).unwrap_or_else(|err| panic!("yaml: {err}"))
}

#[rstest]
#[tokio::test]
async fn plan_takes_largest_requirements_across_tests(harness: Harness) {
    let ctx = harness
        .orchestrator()
        .prepare(selection(&[("basic", BASIC), ("quorum", QUORUM)]), false)
        .await
        .unwrap_or_else(|err| panic!("prepare: {err}"));

    let clients = ctx
        .topology()
        .class(Role::Client)
        .unwrap_or_else(|| panic!("client class missing"));
    assert_eq!((clients.count, clients.flavor_name.as_str()), (5, "large"));
    let servers = ctx
        .topology()
        .class(Role::Server)
        .unwrap_or_else(|| panic!("server class missing"));
    assert_eq!((servers.count, servers.flavor_name.as_str()), (4, "large"));
    assert!(ctx.delete_on_exit());
    assert!(harness.backend.created().is_empty());
}

#[rstest]
#[tokio::test]
async fn run_sets_up_once_then_brackets_each_test(harness: Harness) {
    let report = harness
        .orchestrator()
        .run(request(&[("quorum", QUORUM), ("basic", BASIC)]))
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    assert_eq!(
        harness.playbooks.playbooks(),
        vec![
            "test-env-prepare",
            "storage-start",
            "test-basic",
            "storage-stop",
            "storage-start",
            "test-quorum",
            "storage-stop",
        ]
    );
    assert!(report.passed());
    assert_eq!(report.exit_code(), 0);
    let names: Vec<&str> = report
        .outcomes
        .iter()
        .map(|outcome| outcome.name.as_str())
        .collect();
    assert_eq!(names, vec!["basic", "quorum"]);

    let created: Vec<(String, usize)> = harness
        .backend
        .created()
        .into_iter()
        .map(|class| (class.name, class.count))
        .collect();
    assert_eq!(
        created,
        vec![(String::from("kv-client"), 5), (String::from("kv-server"), 4)]
    );
    assert_eq!(report.teardown.deleted.len(), 9);
    assert!(harness.backend.instance_names().is_empty());
}

#[rstest]
#[tokio::test]
async fn each_test_gets_an_inventory_sized_to_its_own_needs(harness: Harness) {
    harness
        .orchestrator()
        .run(request(&[("quorum", QUORUM), ("basic", BASIC)]))
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    let runs = harness.playbooks.runs();
    let basic = runs
        .iter()
        .find(|run| run.playbook == "test-basic")
        .unwrap_or_else(|| panic!("test-basic did not run"));
    assert_eq!(basic.inventory, harness.path("basic.hosts"));
    let text = basic
        .inventory_text
        .as_deref()
        .unwrap_or_else(|| panic!("inventory missing"));
    let document = InventoryDocument::parse(text).unwrap_or_else(|err| panic!("parse: {err}"));
    let hosts: Vec<String> = document.hosts_of("test-basic").into_iter().collect();
    assert_eq!(
        hosts,
        vec![
            "kv-client-1.lab",
            "kv-client-2.lab",
            "kv-server-1.lab",
            "kv-server-2.lab",
            "kv-server-3.lab",
        ]
    );

    let setup = &runs[0];
    assert_eq!(setup.inventory, harness.path("setup.hosts"));
    let setup_document = InventoryDocument::parse(setup.inventory_text.as_deref().unwrap_or(""))
        .unwrap_or_else(|err| panic!("parse: {err}"));
    assert_eq!(setup_document.section("servers-1").map(<[String]>::len), Some(4));
    assert_eq!(setup_document.section("servers-2"), None);
    assert_eq!(setup_document.hosts_of("clients").len(), 5);
}

#[rstest]
#[tokio::test]
async fn failing_test_restores_variables_and_later_tests_still_run(harness: Harness) {
    let original = "---\na: 0\nb: 2\n";
    harness.write("group_vars/clients-basic.yml", original);
    let vars_path = harness.path("group_vars/clients-basic.yml");
    harness.playbooks.watch(vars_path.clone());
    harness.playbooks.fail("test-basic", 2);

    let report = harness
        .orchestrator()
        .run(request(&[("basic", BASIC), ("quorum", QUORUM)]))
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    let during = harness
        .playbooks
        .runs()
        .into_iter()
        .find(|run| run.playbook == "test-basic")
        .and_then(|run| run.watched.get(&vars_path).cloned().flatten())
        .unwrap_or_else(|| panic!("variables not captured"));
    assert_eq!(yaml(&during), yaml("a: 1\nb: 2"));
    assert_eq!(harness.read("group_vars/clients-basic.yml").as_deref(), Some(original));

    assert_eq!(
        report.outcomes[0].status,
        TestStatus::Failed {
            reason: String::from("playbook test-basic failed (exit code: 2)"),
        }
    );
    assert!(report.outcomes[1].passed());
    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        harness.playbooks.playbooks()[1..],
        [
            "storage-start",
            "test-basic",
            "storage-stop",
            "storage-start",
            "test-quorum",
            "storage-stop",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn stop_runs_even_when_start_fails(harness: Harness) {
    harness.playbooks.fail("storage-start", 1);

    let report = harness
        .orchestrator()
        .run(request(&[("single", SINGLE)]))
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    assert_eq!(
        harness.playbooks.playbooks(),
        vec!["test-env-prepare", "storage-start", "storage-stop"]
    );
    assert!(!report.outcomes[0].passed());
}

#[rstest]
#[tokio::test]
async fn extra_variable_files_are_restored_in_reverse_order(harness: Harness) {
    harness.write("group_vars/clients-layered.yml", "---\na: 0\n");
    harness.write("group_vars/servers.yml", "# tuned by hand\nwait_timeout: 1\n");
    let layered = r#"{
        "playbook": "test-layered",
        "params": {"b": 1},
        "params_list": [
            {"path": "group_vars/servers.yml", "params": {"wait_timeout": 10}},
            {"path": "group_vars/clients-layered.yml", "params": {"c": 3}},
            {"path": "host_vars/extra.yml", "params": {"x": true}}
        ],
        "test_env_cfg": {
            "clients": {"count": 1, "flavor": "small"},
            "servers": {"count_per_group": [1], "flavor": "small"}
        }
    }"#;
    let clients_path = harness.path("group_vars/clients-layered.yml");
    harness.playbooks.watch(clients_path.clone());

    let report = harness
        .orchestrator()
        .run(request(&[("layered", layered)]))
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    assert!(report.passed());
    let during = harness
        .playbooks
        .runs()
        .into_iter()
        .find(|run| run.playbook == "test-layered")
        .and_then(|run| run.watched.get(&clients_path).cloned().flatten())
        .unwrap_or_else(|| panic!("variables not captured"));
    assert_eq!(yaml(&during), yaml("a: 0\nb: 1\nc: 3"));

    assert_eq!(
        harness.read("group_vars/clients-layered.yml").as_deref(),
        Some("---\na: 0\n")
    );
    assert_eq!(
        harness.read("group_vars/servers.yml").as_deref(),
        Some("# tuned by hand\nwait_timeout: 1\n")
    );
    assert_eq!(harness.read("host_vars/extra.yml"), None);
}

#[rstest]
#[tokio::test]
async fn base_setup_writes_repository_and_package_paths(harness: Harness) {
    let base_run = RunRequest {
        repo_dir: Some(Utf8PathBuf::from("/srv/storage")),
        packages_dir: Some(Utf8PathBuf::from("/srv/packages")),
        ..request(&[("single", SINGLE)])
    };

    harness
        .orchestrator()
        .run(base_run)
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    let clients = harness
        .read("group_vars/clients.yml")
        .unwrap_or_else(|| panic!("clients vars missing"));
    assert_eq!(yaml(&clients), yaml("repo_dir: /srv/storage"));
    let test = harness
        .read("group_vars/test.yml")
        .unwrap_or_else(|| panic!("test vars missing"));
    assert_eq!(yaml(&test), yaml("packages_dir: /srv/packages"));
}

#[rstest]
#[tokio::test]
async fn any_test_keeping_nodes_skips_teardown(harness: Harness) {
    let keeper = r#"{
        "playbook": "test-keeper",
        "test_env_cfg": {
            "clients": {"count": 1, "flavor": "small"},
            "servers": {"count_per_group": [1], "flavor": "small"},
            "delete_nodes": false
        }
    }"#;

    let report = harness
        .orchestrator()
        .run(request(&[("keeper", keeper), ("single", SINGLE)]))
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    assert!(report.teardown.skipped);
    assert!(harness.backend.delete_attempts().is_empty());
    assert_eq!(
        harness.backend.instance_names(),
        vec!["kv-client", "kv-server"]
    );
}

#[rstest]
#[tokio::test]
async fn keep_nodes_request_overrides_test_preferences(harness: Harness) {
    let keep = RunRequest {
        keep_nodes: true,
        ..request(&[("single", SINGLE)])
    };

    let report = harness
        .orchestrator()
        .run(keep)
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    assert_eq!(report.teardown, TeardownSummary::skipped());
    assert!(harness.backend.delete_attempts().is_empty());
}

#[rstest]
#[tokio::test]
async fn creation_failure_tears_down_what_was_created(harness: Harness) {
    harness.backend.fail_create("kv-server");

    let err = harness
        .orchestrator()
        .run(request(&[("basic", BASIC)]))
        .await
        .expect_err("creation failure should abort");

    assert!(matches!(err, LifecycleError::Provision { ref class, .. } if class == "kv-server"));
    assert_eq!(
        err.to_string(),
        "failed to create kv-server: scripted backend failure: creation of kv-server failed"
    );
    assert_eq!(
        harness.backend.deleted(),
        vec!["kv-client-1", "kv-client-2"]
    );
    assert_eq!(harness.backend.delete_attempts().len(), 5);
    assert!(harness.playbooks.runs().is_empty());
}

#[rstest]
#[tokio::test]
async fn teardown_failures_are_noted_on_the_abort_reason(harness: Harness) {
    harness.backend.fail_create("kv-server");
    harness.backend.fail_delete("kv-client");

    let err = harness
        .orchestrator()
        .run(request(&[("single", SINGLE)]))
        .await
        .expect_err("creation failure should abort");

    assert_eq!(
        err.to_string(),
        "failed to create kv-server: scripted backend failure: creation of kv-server failed \
         (teardown also failed: could not delete kv-client: scripted backend failure: \
         deletion of kv-client failed)"
    );
}

#[rstest]
#[tokio::test]
async fn unreachable_pool_aborts_before_setup(harness: Harness) {
    harness.backend.set_polls_before_active(usize::MAX);

    let err = harness
        .orchestrator()
        .run(request(&[("single", SINGLE)]))
        .await
        .expect_err("inactive pool should abort");

    assert!(matches!(err, LifecycleError::Unavailable { .. }));
    assert!(err.to_string().starts_with("not all nodes available: timed out"));
    assert!(harness.playbooks.runs().is_empty());
    assert_eq!(harness.backend.deleted(), vec!["kv-client", "kv-server"]);
}

#[rstest]
#[tokio::test]
async fn base_setup_failure_aborts_and_tears_down(harness: Harness) {
    harness.playbooks.fail("test-env-prepare", 3);

    let err = harness
        .orchestrator()
        .run(request(&[("single", SINGLE)]))
        .await
        .expect_err("setup failure should abort");

    assert_eq!(
        err.to_string(),
        "base setup failed: playbook test-env-prepare failed (exit code: 3)"
    );
    assert_eq!(harness.playbooks.playbooks(), vec!["test-env-prepare"]);
    assert_eq!(harness.backend.deleted().len(), 2);
}

#[rstest]
#[tokio::test]
async fn planning_failures_create_nothing(harness: Harness) {
    let err = harness
        .orchestrator()
        .run(RunRequest::default())
        .await
        .expect_err("empty selection should fail");
    assert!(matches!(err, LifecycleError::Plan(PlanError::NoTests)));

    harness.backend.fail_flavors();
    let err = harness
        .orchestrator()
        .run(request(&[("single", SINGLE)]))
        .await
        .expect_err("flavor failure should abort");
    assert!(matches!(err, LifecycleError::Flavors(_)));
    assert!(harness.backend.created().is_empty());
}

#[rstest]
#[tokio::test]
async fn rebuild_reprovisions_every_planned_instance(harness: Harness) {
    for name in ["kv-client", "kv-server"] {
        harness.backend.add_instance(name, 0);
    }
    harness.backend.set_polls_before_active(1);

    let endpoints = harness
        .orchestrator()
        .rebuild(selection(&[("single", SINGLE)]))
        .await
        .unwrap_or_else(|err| panic!("rebuild: {err}"));

    assert_eq!(harness.backend.rebuilt(), vec!["kv-client", "kv-server"]);
    let hosts: Vec<&str> = endpoints
        .iter()
        .map(|endpoint| endpoint.host.as_str())
        .collect();
    assert_eq!(hosts, vec!["kv-client.lab", "kv-server.lab"]);
    assert!(harness.backend.delete_attempts().is_empty());
}

#[rstest]
#[tokio::test]
async fn rebuild_reports_missing_instances(harness: Harness) {
    harness.backend.add_instance("kv-client", 0);

    let err = harness
        .orchestrator()
        .rebuild(selection(&[("single", SINGLE)]))
        .await
        .expect_err("missing server should fail");

    assert_eq!(err.to_string(), "instances not found: kv-server");
}

#[rstest]
#[tokio::test]
async fn destroy_ignores_delete_preferences(harness: Harness) {
    let keeper = r#"{
        "playbook": "test-keeper",
        "test_env_cfg": {
            "clients": {"count": 2, "flavor": "small"},
            "delete_nodes": false
        }
    }"#;
    harness.backend.add_instance("kv-client-1", 0);

    let summary = harness
        .orchestrator()
        .destroy(selection(&[("keeper", keeper)]))
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));

    assert_eq!(summary.deleted, vec!["kv-client-1"]);
    assert_eq!(summary.missing, vec!["kv-client-2"]);
    assert!(summary.is_clean());
    assert_eq!(summary.to_string(), "deleted 1, missing 1, failed 0");
}
