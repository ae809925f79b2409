//! End-to-end scenarios over simulated repmgr and database servers
//!
//! - Bootstrap of a fresh cluster elects the canonical first node
//! - Failover moves the marker and the old primary rejoins as a standby
//! - Restarted standbys follow, deposed primaries rejoin, never both
//! - Rejoin exit codes decide between retrying and stopping
//! - A failed clone leaves no data directory behind
//! - Files handed to the database account carry its ownership

use pg_cluster_core::database::DatabaseControl;
use pg_cluster_core::election::NodeState;
use pg_cluster_core::error::ClusterError;
use pg_cluster_core::materialize::{Materializer, HBA_SENTINEL};
use pg_cluster_core::testing::{foreign_owner, SimRole, TestCluster, TEST_PASSWORD};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::time::Duration;

const PODS: [&str; 3] = ["pg-0", "pg-1", "pg-2"];

/// Bring up every pod of `cluster` concurrently
async fn bootstrap(cluster: &TestCluster, pods: &[&str]) -> Vec<NodeState> {
    let nodes: Vec<_> = pods.iter().map(|pod| cluster.node(pod)).collect();
    for node in &nodes {
        node.announce().await.unwrap();
    }
    futures::future::join_all(nodes.iter().map(|node| node.reconcile()))
        .await
        .into_iter()
        .map(|state| state.unwrap())
        .collect()
}

fn count(calls: &[String], name: &str) -> usize {
    calls.iter().filter(|call| call.as_str() == name).count()
}

/// repmgr role and upstream of every pod, in pod order
fn registrations(cluster: &TestCluster, pods: &[&str]) -> Vec<(Option<SimRole>, Option<String>)> {
    pods.iter()
        .map(|pod| (cluster.sim.role(pod), cluster.sim.upstream(pod)))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_fresh_cluster_elects_canonical_first_node() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = TestCluster::new(dir.path(), "pg", &PODS);

    let states = bootstrap(&cluster, &PODS).await;
    assert_eq!(states, vec![NodeState::Primary, NodeState::Standby, NodeState::Standby]);

    assert_eq!(cluster.primaries().await, vec!["pg-0".to_string()]);
    assert_eq!(cluster.role_label("pg-1").await.as_deref(), Some("standby"));
    assert_eq!(cluster.role_label("pg-2").await.as_deref(), Some("standby"));

    assert_eq!(cluster.sim.role("pg-0"), Some(SimRole::Primary));
    assert_eq!(cluster.sim.upstream("pg-1").as_deref(), Some("pg-0"));
    assert_eq!(cluster.sim.upstream("pg-2").as_deref(), Some("pg-0"));

    assert!(!cluster.data_dir("pg-0").has_standby_marker());
    assert!(cluster.data_dir("pg-1").has_standby_marker());
    assert!(cluster.data_dir("pg-2").has_standby_marker());

    // Only the primary creates the replication admin
    assert_eq!(cluster.admin.passwords(), vec![TEST_PASSWORD.to_string()]);

    let services = cluster.services.names().await;
    for name in ["pg-primary", "pg-standbys", "pg-pg-0", "pg-pg-1", "pg-pg-2"] {
        assert!(services.contains(&name.to_string()), "missing Service {}", name);
    }
}

#[tokio::test(start_paused = true)]
async fn test_non_canonical_node_waits_for_a_primary() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = TestCluster::new(dir.path(), "pg", &PODS);

    // pg-1 starts alone: no marker, and it is not the canonical first node
    let node = cluster.node("pg-1");
    node.announce().await.unwrap();
    let waited = tokio::time::timeout(Duration::from_secs(3600), node.reconcile()).await;
    assert!(waited.is_err());

    let calls = cluster.sim.calls("pg-1");
    assert_eq!(count(&calls, "create_cluster"), 0);
    assert_eq!(count(&calls, "standby_clone"), 0);
    assert!(cluster.primaries().await.is_empty());
    assert!(!cluster.data_dir("pg-1").exists());

    let states = bootstrap(&cluster, &["pg-1", "pg-0"]).await;
    assert_eq!(states, vec![NodeState::Standby, NodeState::Primary]);
    assert_eq!(cluster.primaries().await, vec!["pg-0".to_string()]);
    assert_eq!(count(&cluster.sim.calls("pg-1"), "standby_clone"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reregistration_leaves_roles_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = TestCluster::new(dir.path(), "pg", &PODS);
    bootstrap(&cluster, &PODS).await;
    let before = registrations(&cluster, &PODS);

    let primary = cluster.node("pg-0");
    let standby = cluster.node("pg-2");
    for _ in 0..2 {
        primary.replication().register_primary().await.unwrap();
        standby.replication().register_standby().await.unwrap();
    }

    assert_eq!(registrations(&cluster, &PODS), before);
    assert_eq!(cluster.primaries().await, vec!["pg-0".to_string()]);
    assert_eq!(count(&cluster.sim.calls("pg-0"), "primary_register"), 3);
    assert_eq!(count(&cluster.sim.calls("pg-2"), "standby_register"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_promotions_register_only_the_holder() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = TestCluster::new(dir.path(), "pg", &PODS);
    bootstrap(&cluster, &PODS).await;
    cluster.sim.crash("pg-0");

    let candidates = ["pg-1", "pg-2"];
    let nodes: Vec<_> = candidates.iter().map(|pod| cluster.node(pod)).collect();
    let results = futures::future::join_all(nodes.iter().map(|node| node.on_promote())).await;

    let holders = cluster.primaries().await;
    assert_eq!(holders.len(), 1, "holders {:?}", holders);
    let holder = holders[0].as_str();

    for (pod, result) in candidates.iter().zip(&results) {
        if *pod == holder {
            assert_eq!(result.as_ref().unwrap(), &NodeState::Primary);
            assert_eq!(cluster.sim.role(pod), Some(SimRole::Primary));
            assert!(!cluster.data_dir(pod).has_standby_marker());
        } else {
            assert!(
                matches!(result, Err(ClusterError::MultiplePrimaries(_))),
                "{} reported {:?}",
                pod,
                result
            );
            assert_eq!(cluster.sim.role(pod), Some(SimRole::Standby));
            assert_eq!(count(&cluster.sim.calls(pod), "standby_promote"), 0);
        }
    }

    let promoted: Vec<_> = PODS
        .iter()
        .filter(|pod| cluster.sim.is_running(pod) && cluster.sim.role(pod) == Some(SimRole::Primary))
        .map(|pod| pod.to_string())
        .collect();
    assert_eq!(promoted, holders);
}

#[tokio::test(start_paused = true)]
async fn test_account_files_are_owned_by_database_account() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = TestCluster::new(dir.path(), "pg", &["pg-0"]);
    bootstrap(&cluster, &["pg-0"]).await;

    let owner = foreign_owner();
    let config = cluster.config("pg-0");
    let owned_by = |path: &std::path::Path| {
        let meta = fs::metadata(path).unwrap();
        (meta.uid(), meta.gid())
    };

    let pgpass = config.settings.paths.pgpass_files.last().unwrap();
    assert_eq!(owned_by(pgpass), (owner.uid, owner.gid));
    for mount in &config.settings.paths.mount_dirs {
        assert_eq!(owned_by(mount), (owner.uid, owner.gid), "{}", mount.display());
    }
    let major_dir = config.env.pgdata.parent().unwrap();
    assert_eq!(owned_by(major_dir), (owner.uid, owner.gid));

    let log_dir = config.settings.paths.repmgr_log.parent().unwrap();
    assert_eq!(owned_by(log_dir).1, owner.gid);
    let mode = fs::metadata(log_dir).unwrap().mode() & 0o7777;
    assert_eq!(mode, 0o1775);
}

#[tokio::test(start_paused = true)]
async fn test_primary_choice_follows_expected_units() {
    let dir = tempfile::tempdir().unwrap();
    // pg-0 has been removed from the deployment
    let cluster = TestCluster::new(dir.path(), "pg", &["pg-1", "pg-2"]);

    let states = bootstrap(&cluster, &["pg-2", "pg-1"]).await;
    assert_eq!(states, vec![NodeState::Standby, NodeState::Primary]);
    assert_eq!(cluster.primaries().await, vec!["pg-1".to_string()]);
    assert_eq!(cluster.sim.upstream("pg-2").as_deref(), Some("pg-1"));
}

#[tokio::test(start_paused = true)]
async fn test_failover_and_deposed_primary_rejoins() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = TestCluster::new(dir.path(), "pg", &PODS);
    bootstrap(&cluster, &PODS).await;

    cluster.sim.crash("pg-0");

    // repmgrd on pg-1 promotes, repmgrd on pg-2 follows it
    let state = cluster.node("pg-1").on_promote().await.unwrap();
    assert_eq!(state, NodeState::Primary);
    assert_eq!(cluster.primaries().await, vec!["pg-1".to_string()]);
    assert_eq!(cluster.sim.role("pg-1"), Some(SimRole::Primary));
    assert!(!cluster.data_dir("pg-1").has_standby_marker());

    let state = cluster.node("pg-2").on_follow(2).await.unwrap();
    assert_eq!(state, NodeState::Standby);
    assert_eq!(cluster.sim.upstream("pg-2").as_deref(), Some("pg-1"));
    assert_eq!(cluster.role_label("pg-2").await.as_deref(), Some("standby"));

    // The old primary comes back with its data intact
    let state = cluster.node("pg-0").reconcile().await.unwrap();
    assert_eq!(state, NodeState::Standby);

    let calls = cluster.sim.calls("pg-0");
    assert_eq!(count(&calls, "ensure_consistent"), 1);
    assert_eq!(count(&calls, "node_rejoin"), 1);
    assert_eq!(count(&calls, "standby_follow"), 0);

    assert_eq!(cluster.primaries().await, vec!["pg-1".to_string()]);
    assert_eq!(cluster.role_label("pg-0").await.as_deref(), Some("standby"));
    assert_eq!(cluster.sim.upstream("pg-0").as_deref(), Some("pg-1"));
    assert!(cluster.data_dir("pg-0").has_standby_marker());
}

#[tokio::test(start_paused = true)]
async fn test_restarted_standby_follows() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = TestCluster::new(dir.path(), "pg", &PODS);
    bootstrap(&cluster, &PODS).await;

    cluster.sim.crash("pg-2");
    let state = cluster.node("pg-2").reconcile().await.unwrap();
    assert_eq!(state, NodeState::Standby);

    let calls = cluster.sim.calls("pg-2");
    assert_eq!(count(&calls, "standby_follow"), 1);
    assert_eq!(count(&calls, "node_rejoin"), 0);
    assert_eq!(count(&calls, "ensure_consistent"), 0);
    // Existing data is never re-cloned
    assert_eq!(count(&calls, "standby_clone"), 1);
    assert!(cluster.sim.is_running("pg-2"));
}

#[tokio::test(start_paused = true)]
async fn test_restarted_primary_keeps_marker_and_config_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = TestCluster::new(dir.path(), "pg", &["pg-0"]);
    bootstrap(&cluster, &["pg-0"]).await;

    let materializer = Materializer::new(&cluster.config("pg-0"));
    let override_before = fs::read_to_string(materializer.override_path()).unwrap();

    cluster.sim.crash("pg-0");
    let state = cluster.node("pg-0").reconcile().await.unwrap();
    assert_eq!(state, NodeState::Primary);
    assert_eq!(cluster.primaries().await, vec!["pg-0".to_string()]);
    assert_eq!(count(&cluster.sim.calls("pg-0"), "create_cluster"), 1);

    let hba = fs::read_to_string(materializer.hba_path()).unwrap();
    assert_eq!(hba.matches(HBA_SENTINEL).count(), 1);
    assert_eq!(
        fs::read_to_string(materializer.override_path()).unwrap(),
        override_before
    );
}

async fn rejoin_after_failover(codes: &[i32]) -> (TestCluster, tempfile::TempDir, Result<NodeState, ClusterError>) {
    let dir = tempfile::tempdir().unwrap();
    let cluster = TestCluster::new(dir.path(), "pg", &["pg-0", "pg-1"]);
    bootstrap(&cluster, &["pg-0", "pg-1"]).await;

    cluster.sim.crash("pg-0");
    cluster.node("pg-1").on_promote().await.unwrap();

    cluster.sim.script_exit("pg-0", "node_rejoin", codes);
    let result = cluster.node("pg-0").reconcile().await;
    (cluster, dir, result)
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_configuration_error_is_fatal() {
    let (cluster, _dir, result) = rejoin_after_failover(&[1]).await;
    assert!(matches!(result, Err(ClusterError::Configuration(_))));
    assert_eq!(count(&cluster.sim.calls("pg-0"), "node_rejoin"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_restart_failure_is_fatal() {
    let (cluster, _dir, result) = rejoin_after_failover(&[4]).await;
    assert!(matches!(result, Err(ClusterError::DataIntegrity(_))));
    assert_eq!(count(&cluster.sim.calls("pg-0"), "node_rejoin"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_failure_is_retried() {
    let (cluster, _dir, result) = rejoin_after_failover(&[24, 24]).await;
    assert_eq!(result.unwrap(), NodeState::Standby);

    let calls = cluster.sim.calls("pg-0");
    assert_eq!(count(&calls, "node_rejoin"), 3);
    // Each attempt starts from a consistent data directory
    assert_eq!(count(&calls, "ensure_consistent"), 3);
    let order: Vec<_> = calls
        .iter()
        .filter(|c| *c == "ensure_consistent" || *c == "node_rejoin")
        .map(String::as_str)
        .collect();
    assert_eq!(
        order,
        vec![
            "ensure_consistent",
            "node_rejoin",
            "ensure_consistent",
            "node_rejoin",
            "ensure_consistent",
            "node_rejoin"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_clone_leaves_no_data_directory() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = TestCluster::new(dir.path(), "pg", &["pg-0", "pg-1"]);
    bootstrap(&cluster, &["pg-0"]).await;

    // The primary keeps its marker but cannot serve the clone
    cluster.sim.crash("pg-0");
    let result = cluster.node("pg-1").reconcile().await;
    assert!(matches!(result, Err(ClusterError::RetryExhausted { .. })));

    let data = cluster.data_dir("pg-1");
    assert!(!data.exists());
    assert!(!data.path().exists());
    assert!(count(&cluster.sim.calls("pg-1"), "standby_clone") > 1);

    // Once the primary is back the next start clones from scratch
    cluster.sim.database("pg-0").start().await.unwrap();
    let state = cluster.node("pg-1").reconcile().await.unwrap();
    assert_eq!(state, NodeState::Standby);
    assert!(data.exists());
    assert!(data.has_standby_marker());
    assert!(!data.clone_pending_path().exists());
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_clone_is_redone() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = TestCluster::new(dir.path(), "pg", &["pg-0", "pg-1"]);
    bootstrap(&cluster, &["pg-0"]).await;

    // A partial copy from a clone that was killed midway
    let data = cluster.data_dir("pg-1");
    data.begin_clone().unwrap();
    fs::create_dir_all(data.path().join("base")).unwrap();
    assert!(!data.exists());

    let state = cluster.node("pg-1").reconcile().await.unwrap();
    assert_eq!(state, NodeState::Standby);
    assert_eq!(count(&cluster.sim.calls("pg-1"), "standby_clone"), 1);
    assert!(!data.path().join("base").exists());
    assert!(data.exists());
}
