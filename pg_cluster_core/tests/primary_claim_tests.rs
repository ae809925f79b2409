//! Tests for the primary marker under concurrent claims
//!
//! Several nodes claiming at once must leave the marker on exactly one pod,
//! and that pod must be one whose own claim reported success.

use pg_cluster_core::identity::{ExpectedNodeSet, NodeIdentity};
use pg_cluster_core::topology::{
    ClaimOutcome, LabelStore, MemoryLabelStore, MetadataPatch, Topology, EPOCH_ANNOTATION,
    ROLE_LABEL, ROLE_PRIMARY,
};
use std::path::PathBuf;
use std::sync::Arc;

const PODS: [&str; 5] = ["pg-0", "pg-1", "pg-2", "pg-3", "pg-4"];

fn topology(store: &Arc<MemoryLabelStore>, pod: &str) -> Topology {
    let node = NodeIdentity::new("pg", pod, PathBuf::from("/srv/pgdata/12/main")).unwrap();
    Topology::new(
        store.clone(),
        "pg",
        node,
        ExpectedNodeSet::parse("pg/0 pg/1 pg/2 pg/3 pg/4"),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_converge_to_one_holder() {
    for round in 0..25 {
        let store = Arc::new(MemoryLabelStore::with_app_pods("pg", &PODS));

        let handles: Vec<_> = PODS
            .iter()
            .map(|pod| {
                let node = topology(&store, pod);
                let name = pod.to_string();
                tokio::spawn(async move { (name, node.claim_primary().await.unwrap()) })
            })
            .collect();

        let mut outcomes = Vec::new();
        for handle in futures::future::join_all(handles).await {
            outcomes.push(handle.unwrap());
        }

        let holders = store.holders("pg").await;
        assert_eq!(holders.len(), 1, "round {}: holders {:?}", round, holders);

        let winner = &holders[0];
        let (_, outcome) = outcomes.iter().find(|(name, _)| name == winner).unwrap();
        assert!(
            matches!(outcome, ClaimOutcome::Held { .. }),
            "round {}: holder {} reported {:?}",
            round,
            winner,
            outcome
        );
    }
}

#[tokio::test]
async fn test_claim_outranks_stale_holders() {
    let store = Arc::new(MemoryLabelStore::with_app_pods("pg", &PODS));
    // Left over from a failover the agent never saw complete
    store
        .patch(
            "pg-3",
            MetadataPatch::new()
                .set_label(ROLE_LABEL, ROLE_PRIMARY)
                .set_annotation(EPOCH_ANNOTATION, "4"),
        )
        .await
        .unwrap();
    store
        .patch("pg-4", MetadataPatch::new().set_label(ROLE_LABEL, ROLE_PRIMARY))
        .await
        .unwrap();

    let outcome = topology(&store, "pg-1").claim_primary().await.unwrap();
    assert_eq!(outcome, ClaimOutcome::Held { epoch: 5 });
    assert_eq!(store.holders("pg").await, vec!["pg-1".to_string()]);

    let pod = store.pod("pg-1").await.unwrap();
    assert_eq!(pod.epoch(), 5);
}

#[tokio::test]
async fn test_newer_claim_clears_equal_epoch_holders() {
    let store = Arc::new(MemoryLabelStore::with_app_pods("pg", &PODS));
    // Two claims that read the same maximum epoch
    for pod in ["pg-2", "pg-4"] {
        store
            .patch(
                pod,
                MetadataPatch::new()
                    .set_label(ROLE_LABEL, ROLE_PRIMARY)
                    .set_annotation(EPOCH_ANNOTATION, "7"),
            )
            .await
            .unwrap();
    }

    // A third claim at epoch 8 wins outright
    let outcome = topology(&store, "pg-3").claim_primary().await.unwrap();
    assert_eq!(outcome, ClaimOutcome::Held { epoch: 8 });
    assert_eq!(store.holders("pg").await, vec!["pg-3".to_string()]);
}

#[tokio::test]
async fn test_claim_survives_transient_store_failures() {
    let store = Arc::new(MemoryLabelStore::with_app_pods("pg", &PODS));
    let node = topology(&store, "pg-0");

    store.fail_next(1);
    let error = node.claim_primary().await.unwrap_err();
    assert!(error.is_retryable());

    assert_eq!(
        node.claim_primary().await.unwrap(),
        ClaimOutcome::Held { epoch: 1 }
    );
}
