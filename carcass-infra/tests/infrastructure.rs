//! Infrastructure and environment tests against the in-memory backend.

use std::sync::Arc;

use carcass_hypervisor::{BackendError, DomainState, HypervisorClient, MockBackend};
use carcass_infra::{ControlAction, Environment, InfraError, Infrastructure};

const LAB_NETWORK: &str = r#"
<network>
  <name>lab</name>
  <uuid>3e3fce45-4f53-4fa7-bb32-11f34168b82b</uuid>
  <dns>
    <host ip='10.0.10.11'><hostname>db1</hostname></host>
    <host ip='10.0.10.12'><hostname>web1</hostname></host>
  </dns>
  <ip address='10.0.10.1' netmask='255.255.255.0'/>
</network>
"#;

fn machine(name: &str, network: &str) -> String {
    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <vcpu>1</vcpu>
  <devices>
    <disk type='volume' device='disk'>
      <source pool='default' volume='{name}-root.qcow2'/>
      <backingStore type='file'>
        <source file='/var/lib/libvirt/images/debian11-base.qcow2'/>
      </backingStore>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
    </interface>
  </devices>
</domain>"#
    )
}

fn setup() -> (Arc<MockBackend>, HypervisorClient) {
    let mock = Arc::new(MockBackend::new());
    mock.add_network_xml("lab", LAB_NETWORK);
    mock.add_network_xml("default", "<network><name>default</name></network>");
    mock.add_domain_xml("db1", &machine("db1", "lab"), true);
    mock.add_domain_xml("web1", &machine("web1", "lab"), false);
    mock.add_domain_xml("elsewhere", &machine("elsewhere", "default"), true);
    let client = HypervisorClient::new(mock.clone());
    (mock, client)
}

#[tokio::test]
async fn test_lookup_collects_attached_machines() {
    let (_mock, client) = setup();

    let infra = Infrastructure::lookup(&client, "lab").await.unwrap();
    assert_eq!(infra.network.name, "lab");
    assert_eq!(infra.machine_names().collect::<Vec<_>>(), vec!["db1", "web1"]);
}

#[tokio::test]
async fn test_lookup_unknown_network() {
    let (_mock, client) = setup();

    let err = Infrastructure::lookup(&client, "nope").await.err().unwrap();
    assert!(matches!(err, InfraError::Network { .. }));
}

#[tokio::test]
async fn test_stop_all_skips_inactive() {
    let (mock, client) = setup();
    let infra = Infrastructure::lookup(&client, "lab").await.unwrap();

    let report = infra.stop_all(false).await;
    assert!(report.is_success());
    assert_eq!(report.requested(), vec!["db1"]);
    assert_eq!(mock.shutdown_requests(), vec!["db1"]);

    assert_eq!(report.outcomes[1].state, DomainState::Inactive);
    assert!(matches!(report.outcomes[1].action, ControlAction::Skipped));
}

#[tokio::test]
async fn test_forced_stop_all_reaches_every_machine() {
    let (mock, client) = setup();
    let infra = Infrastructure::lookup(&client, "lab").await.unwrap();

    let report = infra.stop_all(true).await;
    assert_eq!(report.requested(), vec!["db1", "web1"]);
    assert_eq!(mock.shutdown_requests(), vec!["db1", "web1"]);
}

#[tokio::test]
async fn test_start_all_continues_after_failure() {
    let (mock, client) = setup();
    mock.fail_start("db1", BackendError::Failed("already running".to_string()));
    let infra = Infrastructure::lookup(&client, "lab").await.unwrap();

    let report = infra.start_all().await;
    assert!(!report.is_success());
    assert_eq!(report.failures().count(), 1);
    assert_eq!(report.requested(), vec!["web1"]);
    assert_eq!(mock.start_requests(), vec!["web1"]);
}

#[tokio::test]
async fn test_status_failure_is_reported() {
    let (mock, client) = setup();
    let infra = Infrastructure::lookup(&client, "lab").await.unwrap();
    mock.fail_domain_status("db1", BackendError::Failed("rpc timeout".to_string()));

    let report = infra.stop_all(true).await;
    assert_eq!(report.outcomes[0].state, DomainState::Unknown);
    assert!(report.outcomes[0].is_failure());
    assert_eq!(mock.shutdown_requests(), vec!["web1"]);
}

#[tokio::test]
async fn test_start_despite_unreadable_status() {
    let (mock, client) = setup();
    let infra = Infrastructure::lookup(&client, "lab").await.unwrap();
    mock.fail_domain_status("db1", BackendError::Failed("rpc timeout".to_string()));

    let report = infra.start_all().await;
    assert!(report.is_success());
    assert_eq!(report.outcomes[0].state, DomainState::Unknown);
    assert_eq!(report.requested(), vec!["db1", "web1"]);
    assert_eq!(mock.start_requests(), vec!["db1", "web1"]);
}

#[tokio::test]
async fn test_single_machine_control() {
    let (mock, client) = setup();
    let infra = Infrastructure::lookup(&client, "lab").await.unwrap();

    let report = infra.start("web1").await;
    assert_eq!(report.requested(), vec!["web1"]);

    // not on this network
    let report = infra.stop("elsewhere", true).await;
    assert!(!report.is_success());
    assert!(mock.shutdown_requests().is_empty());
}

#[tokio::test]
async fn test_machine_removed_after_lookup() {
    let (mock, client) = setup();
    let infra = Infrastructure::lookup(&client, "lab").await.unwrap();
    mock.fail_domain_status("web1", BackendError::not_found(carcass_hypervisor::ResourceKind::Domain, "web1"));

    let report = infra.start_all().await;
    assert_eq!(report.requested(), vec!["db1"]);
    assert!(report.outcomes[1].is_failure());
}

#[tokio::test]
async fn test_environment_display() {
    let (_mock, client) = setup();

    let env = Environment::lookup(&client, "lab").await.unwrap();
    assert_eq!(
        env.to_string(),
        "Environment: lab\n\
         \x20 Network: lab  10.0.10.0/24\n\
         \x20 Machines:\n\
         \x20   - db1   10.0.10.11  debian11  active\n\
         \x20   - web1  10.0.10.12  debian11\n"
    );
}

#[tokio::test]
async fn test_environment_unresolved_address() {
    let (mock, client) = setup();
    mock.add_domain_xml("cache1", &machine("cache1", "lab"), false);

    let env = Environment::lookup(&client, "lab").await.unwrap();
    let rendered = env.to_string();
    assert!(rendered.contains("    - cache1  0.0.0.0  debian11\n"));
}

#[tokio::test]
async fn test_environment_names_and_control() {
    let (mock, client) = setup();

    let names = Environment::list_names(&client).await.unwrap();
    assert_eq!(names, vec!["default", "lab"]);

    let env = Environment::lookup(&client, "lab").await.unwrap();
    let report = env.start().await;
    assert!(report.is_success());
    let report = env.stop(false).await;
    assert_eq!(report.requested(), vec!["db1", "web1"]);
    assert_eq!(mock.start_requests(), vec!["db1", "web1"]);
}
