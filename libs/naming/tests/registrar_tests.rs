#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Registrar lifecycle against the in-process directory.

use std::sync::Arc;
use std::time::Duration;

use naming::{
    DirectoryClient, Endpoint, EndpointResolver, LeaseId, MemoryDirectory, RecoveryConfig,
    Registrar, RegistrarConfig, RegistrarError, RegistrarState,
};
use tokio::sync::watch;
use tracing_test::traced_test;

const SERVICE: &str = "app";
const ADDR: &str = "127.0.0.1:9000";
const KEY: &str = "app/127.0.0.1:9000";
const DEADLINE: Duration = Duration::from_secs(5);

fn registrar(dir: &MemoryDirectory, recovery: RecoveryConfig) -> Registrar<MemoryDirectory> {
    Registrar::new(
        Arc::new(dir.clone()),
        Endpoint::new(SERVICE, ADDR),
        RegistrarConfig::default().with_recovery(recovery),
    )
}

async fn wait_for_state(
    status: &mut watch::Receiver<RegistrarState>,
    pred: impl FnMut(&RegistrarState) -> bool,
) -> RegistrarState {
    *tokio::time::timeout(DEADLINE, status.wait_for(pred))
        .await
        .expect("registrar state did not settle in time")
        .expect("status channel closed")
}

#[tokio::test]
#[traced_test]
async fn register_publishes_key_and_renews_lease() {
    let dir = MemoryDirectory::new();
    let mut reg = registrar(&dir, RecoveryConfig::default());

    reg.register().await.unwrap();

    let lease = reg.lease_id().unwrap();
    assert_eq!(reg.state(), RegistrarState::Registered { lease });

    let kv = dir.get(KEY).unwrap();
    assert_eq!(kv.lease, Some(lease));
    let ep = Endpoint::decode_value(SERVICE, &kv.value).unwrap();
    assert_eq!(ep.address, ADDR);
    assert!(dir.is_lease_alive(lease));

    tokio::time::timeout(DEADLINE, async {
        while !logs_contain("Lease renewed") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(logs_contain("ttl=5"));
    assert!(logs_contain("Endpoint registered"));
}

#[tokio::test]
async fn lost_lease_is_replaced_under_the_same_key() {
    let dir = MemoryDirectory::new();
    let mut reg = registrar(&dir, RecoveryConfig::fast(3));
    reg.register().await.unwrap();
    let first = reg.lease_id().unwrap();
    let mut status = reg.status();

    assert!(dir.expire_lease(first));

    let state = wait_for_state(&mut status, |s| {
        matches!(s, RegistrarState::Registered { lease } if *lease != first)
    })
    .await;
    let RegistrarState::Registered { lease: second } = state else {
        unreachable!("predicate only accepts Registered");
    };

    assert_ne!(first, second);
    assert_eq!(reg.lease_id(), Some(second));
    assert_eq!(dir.get(KEY).unwrap().lease, Some(second));
    assert!(!dir.is_lease_alive(first));
    assert_eq!(dir.grant_count(), 2);
}

#[tokio::test]
async fn unregister_revokes_current_lease_and_removes_key() {
    let dir = MemoryDirectory::new();
    let mut reg = registrar(&dir, RecoveryConfig::fast(3));
    reg.register().await.unwrap();
    let first = reg.lease_id().unwrap();
    let mut status = reg.status();

    dir.expire_lease(first);
    wait_for_state(&mut status, |s| {
        matches!(s, RegistrarState::Registered { lease } if *lease != first)
    })
    .await;
    let second = reg.lease_id().unwrap();

    reg.unregister().await.unwrap();

    assert_eq!(dir.revoked(), vec![second]);
    assert!(dir.get(KEY).is_none());
    assert_eq!(dir.live_leases(), 0);
    assert_eq!(reg.state(), RegistrarState::Terminated);
    assert!(reg.lease_id().is_none());
}

#[tokio::test]
async fn unavailable_directory_fails_registration_without_side_effects() {
    let dir = MemoryDirectory::new();
    dir.set_unavailable(true);
    let mut reg = registrar(&dir, RecoveryConfig::default());

    let err = reg.register().await.unwrap_err();
    assert!(matches!(err, RegistrarError::DirectoryUnavailable(_)));
    assert_eq!(reg.state(), RegistrarState::Unregistered);
    assert_eq!(dir.grant_count(), 0);

    dir.set_unavailable(false);
    assert!(dir.get(KEY).is_none());

    // No watch loop was left behind, so a retry is a fresh registration.
    reg.register().await.unwrap();
    assert!(dir.get(KEY).is_some());
}

#[tokio::test]
async fn failed_publish_leaves_the_lease_for_unregister() {
    let dir = MemoryDirectory::new();
    dir.set_read_only(true);
    let mut reg = registrar(&dir, RecoveryConfig::default());

    let err = reg.register().await.unwrap_err();
    let RegistrarError::PublishFailed { key, lease, .. } = &err else {
        panic!("expected PublishFailed, got {err:?}");
    };
    let lease = *lease;
    assert_eq!(key, KEY);
    assert!(dir.is_lease_alive(lease));
    assert!(dir.get(KEY).is_none());

    reg.unregister().await.unwrap();
    assert_eq!(dir.revoked(), vec![lease]);
}

#[tokio::test]
async fn recovery_retries_with_backoff_until_grant_succeeds() {
    let dir = MemoryDirectory::new();
    let mut reg = registrar(&dir, RecoveryConfig::fast(5));
    reg.register().await.unwrap();
    let first = reg.lease_id().unwrap();
    let mut status = reg.status();

    dir.fail_next_grants(2);
    dir.expire_lease(first);

    let state = wait_for_state(&mut status, |s| {
        matches!(s, RegistrarState::Registered { lease } if *lease != first)
    })
    .await;
    assert!(matches!(state, RegistrarState::Registered { .. }));
    assert_eq!(dir.grant_count(), 2);
    assert!(dir.get(KEY).is_some());
}

#[tokio::test]
async fn exhausted_recovery_reports_lost_and_allows_register_again() {
    let dir = MemoryDirectory::new();
    let mut reg = registrar(&dir, RecoveryConfig::fast(3));
    reg.register().await.unwrap();
    let first = reg.lease_id().unwrap();
    let mut status = reg.status();

    dir.fail_next_grants(3);
    dir.expire_lease(first);

    wait_for_state(&mut status, |s| *s == RegistrarState::Lost).await;
    assert!(dir.get(KEY).is_none());
    assert_eq!(dir.grant_count(), 1);

    reg.register().await.unwrap();
    let again = reg.lease_id().unwrap();
    assert_ne!(again, first);
    assert_eq!(dir.get(KEY).unwrap().lease, Some(again));
}

#[tokio::test]
async fn single_shot_recovery_gives_up_after_one_attempt() {
    let dir = MemoryDirectory::new();
    let mut reg = registrar(&dir, RecoveryConfig::single_shot());
    reg.register().await.unwrap();
    let first = reg.lease_id().unwrap();
    let mut status = reg.status();

    dir.fail_next_grants(1);
    dir.expire_lease(first);

    wait_for_state(&mut status, |s| *s == RegistrarState::Lost).await;
    assert_eq!(dir.grant_count(), 1);
}

#[tokio::test]
async fn keepalive_closing_before_first_renewal_counts_against_recovery() {
    let dir = MemoryDirectory::new();
    let mut reg = registrar(&dir, RecoveryConfig::fast(3));
    reg.register().await.unwrap();
    let mut status = reg.status();

    // Grants and publishes keep working, but no stream ever renews again.
    dir.pause_renewals(true);

    wait_for_state(&mut status, |s| *s == RegistrarState::Lost).await;
    assert_eq!(dir.grant_count(), 1 + 3);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dir.grant_count(), 1 + 3);
    assert_eq!(reg.state(), RegistrarState::Lost);
}

#[tokio::test]
async fn unregister_stops_the_watch_loop_even_when_revoke_fails() {
    let dir = MemoryDirectory::new();
    let mut reg = registrar(&dir, RecoveryConfig::fast(3));
    reg.register().await.unwrap();
    let lease = reg.lease_id().unwrap();

    dir.set_failing_revokes(true);
    let err = reg.unregister().await.unwrap_err();
    assert!(matches!(err, RegistrarError::RevokeFailed { lease: l, .. } if l == lease));
    assert_eq!(reg.state(), RegistrarState::Terminated);

    // The lease survived the failed revoke. Losing it now must not trigger
    // a re-registration.
    assert!(dir.is_lease_alive(lease));
    dir.expire_lease(lease);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dir.grant_count(), 1);
    assert!(dir.get(KEY).is_none());

    // Terminal: a second call is a no-op.
    reg.unregister().await.unwrap();
}

#[tokio::test]
async fn unregister_interrupts_recovery_backoff() {
    let dir = MemoryDirectory::new();
    let slow = RecoveryConfig {
        max_attempts: 5,
        initial_backoff: Duration::from_secs(60),
        max_backoff: Duration::from_secs(60),
        multiplier: 1.0,
        jitter: false,
    };
    let mut reg = registrar(&dir, slow);
    reg.register().await.unwrap();
    let first = reg.lease_id().unwrap();
    let mut status = reg.status();

    dir.fail_next_grants(u32::MAX);
    dir.expire_lease(first);
    wait_for_state(&mut status, |s| {
        matches!(s, RegistrarState::Recovering { attempt: 1 })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(1), reg.unregister())
        .await
        .expect("unregister waited for the backoff")
        .unwrap();
    assert_eq!(reg.state(), RegistrarState::Terminated);
    assert_eq!(dir.grant_count(), 1);
}

#[tokio::test]
async fn at_most_one_key_per_endpoint_across_recoveries() {
    let dir = MemoryDirectory::new();
    let mut reg = registrar(&dir, RecoveryConfig::fast(3));
    reg.register().await.unwrap();
    let mut status = reg.status();
    let resolver = EndpointResolver::new(Arc::new(dir.clone()));

    for _ in 0..3 {
        let current = reg.lease_id().unwrap();
        dir.expire_lease(current);
        wait_for_state(&mut status, |s| {
            matches!(s, RegistrarState::Registered { lease } if *lease != current)
        })
        .await;

        let endpoints = resolver.endpoints(SERVICE).await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].address, ADDR);
        assert_eq!(dir.live_leases(), 1);
    }
}

#[tokio::test]
async fn two_instances_resolve_round_robin() {
    let dir = MemoryDirectory::new();
    let mut a = Registrar::new(
        Arc::new(dir.clone()),
        Endpoint::new(SERVICE, "127.0.0.1:9001"),
        RegistrarConfig::default(),
    );
    let mut b = Registrar::new(
        Arc::new(dir.clone()),
        Endpoint::new(SERVICE, "127.0.0.1:9002"),
        RegistrarConfig::default(),
    );
    a.register().await.unwrap();
    b.register().await.unwrap();

    let resolver = EndpointResolver::new(Arc::new(dir.clone()));
    let first = resolver.resolve(SERVICE).await.unwrap().address;
    let second = resolver.resolve(SERVICE).await.unwrap().address;
    assert_ne!(first, second);

    a.unregister().await.unwrap();
    for _ in 0..3 {
        assert_eq!(
            resolver.resolve(SERVICE).await.unwrap().address,
            "127.0.0.1:9002"
        );
    }
}

#[tokio::test]
async fn registrar_works_through_a_trait_object() {
    let dir = MemoryDirectory::new();
    let client: Arc<dyn DirectoryClient> = Arc::new(dir.clone());
    let mut reg: Registrar =
        Registrar::new(client, Endpoint::new(SERVICE, ADDR), RegistrarConfig::default());

    reg.register().await.unwrap();
    let lease: LeaseId = reg.lease_id().unwrap();
    assert_eq!(dir.get(KEY).unwrap().lease, Some(lease));
    reg.unregister().await.unwrap();
}
