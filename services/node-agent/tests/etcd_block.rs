//! etcd provisioner scenarios against the in-memory cluster.
//!
//! Each node gets a recording host whose `restart etcd` starts the member in
//! the shared mock cluster, the way systemd would on a real machine.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use plinth_block::{Block, Context};
use plinth_etcd::{flag_value, MembershipPolicy, MockEtcdCluster};
use plinth_node::blocks::{EtcdBlock, NodeSpec};
use plinth_node::{Action, MockHost, Role};
use rstest::rstest;

const A: &str = "10.0.0.1";
const B: &str = "10.0.0.2";

fn fast_policy() -> MembershipPolicy {
    MembershipPolicy {
        peer_attempts: 2,
        peer_retry_interval: Duration::from_millis(1),
        health_streak: 3,
        probe_interval: Duration::from_millis(1),
        health_deadline: Duration::from_secs(5),
        join_interval: Duration::from_millis(5),
        join_deadline: Duration::from_secs(60),
        join_jitter: 1.0,
    }
}

/// A control plane node whose etcd restarts start its mock member.
fn etcd_node(
    dir: &std::path::Path,
    ip: &str,
    peers: &[&str],
    cluster: &Arc<MockEtcdCluster>,
) -> (NodeSpec, Arc<MockHost>) {
    let (node, host) = common::node(dir, Role::ControlPlane, ip, common::request(peers));
    let hook_cluster = cluster.clone();
    let hook_ip = ip.to_string();
    host.on_restart("etcd", move || hook_cluster.start_member(&hook_ip));
    (node, host)
}

fn etcd_block(node: NodeSpec, action: Action, cluster: &Arc<MockEtcdCluster>) -> EtcdBlock {
    EtcdBlock::new(node, action, cluster.clone(), fast_policy())
}

fn unit_text(node: &NodeSpec) -> String {
    std::fs::read_to_string(node.layout.etcd_unit()).unwrap()
}

#[tokio::test]
async fn test_genesis_bootstraps_single_member() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(MockEtcdCluster::new());
    let (node, host) = etcd_node(dir.path(), A, &[], &cluster);

    etcd_block(node.clone(), Action::Initialize, &cluster)
        .ensure(&Context::background())
        .await
        .unwrap();

    let unit = unit_text(&node);
    assert_eq!(flag_value(&unit, "--initial-cluster-state"), Some("existing"));
    assert_eq!(
        flag_value(&unit, "--initial-cluster"),
        Some("etcd-10.0.0.1.member=https://10.0.0.1:2380")
    );
    assert_eq!(
        flag_value(&unit, "--advertise-client-urls"),
        Some("https://10.0.0.1:2379")
    );
    assert_eq!(cluster.member_ips(), vec![A]);
    assert!(cluster.calls("endpoint_health") >= 6);
    assert_eq!(host.count("restart etcd"), 2);
    assert!(node.layout.etcd_home().join("cert/server.crt").exists());
}

#[tokio::test]
async fn test_simple_join_lists_both_members() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(MockEtcdCluster::new());
    cluster.start_member(A);
    let (node, _host) = etcd_node(dir.path(), B, &[A], &cluster);

    etcd_block(node.clone(), Action::Join, &cluster)
        .ensure(&Context::background())
        .await
        .unwrap();

    let unit = unit_text(&node);
    assert_eq!(flag_value(&unit, "--initial-cluster-state"), Some("existing"));
    assert_eq!(
        flag_value(&unit, "--initial-cluster"),
        Some("etcd-10.0.0.1.member=https://10.0.0.1:2380,etcd-10.0.0.2.member=https://10.0.0.2:2380")
    );
    assert_eq!(cluster.member_ips(), vec![A, B]);
    assert!(cluster.is_started(B));
    assert_eq!(cluster.calls("member_add"), 1);
    assert_eq!(cluster.calls("member_remove"), 0);
}

#[tokio::test]
async fn test_second_ensure_changes_no_membership() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(MockEtcdCluster::new());
    cluster.start_member(A);
    let (node, host) = etcd_node(dir.path(), B, &[A], &cluster);
    let block = etcd_block(node.clone(), Action::Join, &cluster);
    let ctx = Context::background();

    block.ensure(&ctx).await.unwrap();
    let first = unit_text(&node);
    block.ensure(&ctx).await.unwrap();

    assert_eq!(host.count("restart etcd"), 1);
    assert_eq!(cluster.calls("member_add"), 1);
    assert_eq!(cluster.member_ips(), vec![A, B]);
    assert_eq!(
        flag_value(&unit_text(&node), "--initial-cluster"),
        flag_value(&first, "--initial-cluster")
    );
}

#[tokio::test]
async fn test_genesis_then_join_through_the_block() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let cluster = Arc::new(MockEtcdCluster::new());
    let (node_a, _) = etcd_node(dir_a.path(), A, &[], &cluster);
    let (node_b, _) = etcd_node(dir_b.path(), B, &[A], &cluster);
    let ctx = Context::background();

    etcd_block(node_a, Action::Initialize, &cluster)
        .ensure(&ctx)
        .await
        .unwrap();
    etcd_block(node_b, Action::Join, &cluster)
        .ensure(&ctx)
        .await
        .unwrap();

    assert_eq!(cluster.member_ips(), vec![A, B]);
    assert!(cluster.is_started(A) && cluster.is_started(B));
}

#[rstest]
#[case(2)]
#[case(4)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_node_joins_converge(#[case] joiners: usize) {
    let cluster = Arc::new(MockEtcdCluster::new().with_latency(Duration::from_millis(1)));
    cluster.start_member(A);

    let mut dirs = Vec::new();
    let mut handles = Vec::new();
    for n in 0..joiners {
        let dir = tempfile::tempdir().unwrap();
        let ip = format!("10.0.1.{}", n + 1);
        let (node, _host) = etcd_node(dir.path(), &ip, &[A], &cluster);
        let block = etcd_block(node, Action::Join, &cluster);
        dirs.push(dir);
        handles.push(tokio::spawn(async move {
            block.ensure(&Context::background()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let ips = cluster.member_ips();
    let unique: HashSet<&String> = ips.iter().collect();
    assert_eq!(ips.len(), joiners + 1, "members: {:?}", ips);
    assert_eq!(unique.len(), ips.len());
    assert!(ips.iter().all(|ip| cluster.is_started(ip)));
}

#[tokio::test]
async fn test_join_without_reachable_peer_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(MockEtcdCluster::new());
    let (node, _host) = etcd_node(dir.path(), B, &[A], &cluster);
    let mut policy = fast_policy();
    policy.join_deadline = Duration::from_millis(50);

    let err = EtcdBlock::new(node, Action::Join, cluster.clone(), policy)
        .ensure(&Context::background())
        .await
        .unwrap_err();

    assert!(!err.is_config());
    assert_eq!(cluster.calls("member_add"), 0);
}
