// Integration tests for the permission gate: writer-set resolution
// from the Group file, the first-run barrier, and per-dial identity.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{inprocess, user, TestEnv};
use lattice::errors::ErrorKind;
use lattice::perm::{PermConfig, WritersGate};
use lattice::service::{Context, StoreServer};
use tokio::time::timeout;

const OWNER: &str = "owner@example.com";
const GROUP_FILE: &str = "owner@example.com/Group/StoreWriters";

fn fast_config() -> PermConfig {
    PermConfig {
        poll_interval: Duration::from_secs(60),
        retry_interval: Duration::from_millis(50),
    }
}

fn gate_over(env: &TestEnv) -> Arc<WritersGate> {
    WritersGate::new(
        env.ctx.clone(),
        user(OWNER),
        env.store.clone() as Arc<dyn StoreServer>,
        env.switch.clone(),
        fast_config(),
    )
}

async fn dial_as(gate: &Arc<WritersGate>, who: &str) -> Arc<dyn StoreServer> {
    gate.dialer()
        .dial(&Context::new(user(who)), &inprocess("store1"))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_no_group_file_allows_everyone() {
    let env = TestEnv::new(OWNER);
    let gate = gate_over(&env);

    gate.put(b"owner data").await.unwrap();
    let stranger = dial_as(&gate, "eve@example.com").await;
    stranger.put(b"stranger data").await.unwrap();

    gate.shutdown().await;
}

#[tokio::test]
async fn test_group_file_restricts_writers() {
    let env = TestEnv::new(OWNER);
    let gate = gate_over(&env);

    // Everyone is allowed until the Group file appears.
    let stranger = dial_as(&gate, "eve@example.com").await;
    stranger.put(b"while open").await.unwrap();

    env.write_file(GROUP_FILE, OWNER.as_bytes());
    gate.update_now().await.unwrap();

    let err = stranger.put(b"after close").await.unwrap_err();
    assert!(err.is(ErrorKind::Permission));
    assert_eq!(err.path.as_deref(), Some("eve@example.com"));

    // The owner keeps writing and deleting.
    let refdata = gate.put(b"owner still writes").await.unwrap();
    gate.delete(&refdata.reference).await.unwrap();

    gate.shutdown().await;
}

#[tokio::test]
async fn test_gets_pass_through_for_everyone() {
    let env = TestEnv::new(OWNER);
    let reference = env.store.insert(b"public read");
    env.write_file(GROUP_FILE, OWNER.as_bytes());

    let gate = gate_over(&env);
    gate.update_now().await.unwrap();

    let stranger = dial_as(&gate, "eve@example.com").await;
    let got = stranger.get(&reference).await.unwrap();
    assert_eq!(got.data.unwrap(), b"public read");

    gate.shutdown().await;
}

#[tokio::test]
async fn test_wildcard_domain_writers() {
    let env = TestEnv::new(OWNER);
    env.write_file(GROUP_FILE, b"*@corp.com");
    let gate = gate_over(&env);
    gate.update_now().await.unwrap();

    let insider = dial_as(&gate, "dev@corp.com").await;
    insider.put(b"from corp").await.unwrap();

    let outsider = dial_as(&gate, "eve@example.com").await;
    assert!(outsider
        .put(b"from outside")
        .await
        .unwrap_err()
        .is(ErrorKind::Permission));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_all_sentinel_allows_everyone() {
    let env = TestEnv::new(OWNER);
    env.write_file(GROUP_FILE, b"all");
    let gate = gate_over(&env);
    gate.update_now().await.unwrap();

    let anyone = dial_as(&gate, "rando@wherever.net").await;
    anyone.put(b"door is open").await.unwrap();

    gate.shutdown().await;
}

#[tokio::test]
async fn test_empty_group_file_allows_no_one() {
    let env = TestEnv::new(OWNER);
    env.write_file(GROUP_FILE, b"# nobody\n");
    let gate = gate_over(&env);
    gate.update_now().await.unwrap();

    let err = gate.put(b"even the owner").await.unwrap_err();
    assert!(err.is(ErrorKind::Permission));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_nested_groups_are_expanded() {
    let env = TestEnv::new(OWNER);
    env.write_file(GROUP_FILE, b"friends");
    env.write_file("owner@example.com/Group/friends", b"bob@example.com");
    let gate = gate_over(&env);
    gate.update_now().await.unwrap();

    let bob = dial_as(&gate, "bob@example.com").await;
    bob.put(b"via nested group").await.unwrap();

    let eve = dial_as(&gate, "eve@example.com").await;
    assert!(eve.put(b"nope").await.unwrap_err().is(ErrorKind::Permission));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_first_run_gate_blocks_mutations() {
    let env = TestEnv::new(OWNER);
    // The DirServer is unreachable, so the first resolution cannot
    // complete.
    env.dir.ping_ok.store(false, Ordering::SeqCst);
    let gate = gate_over(&env);

    // Mutations hang on the first-run barrier.
    assert!(timeout(Duration::from_millis(150), gate.put(b"too soon"))
        .await
        .is_err());

    // Gets pass through even before the first resolution.
    let reference = env.store.insert(b"readable");
    let got = timeout(Duration::from_secs(1), gate.get(&reference))
        .await
        .expect("get must not block on the barrier")
        .unwrap();
    assert_eq!(got.data.unwrap(), b"readable");

    // Once the DirServer heals, the updater resolves and the barrier
    // lifts.
    env.dir.ping_ok.store(true, Ordering::SeqCst);
    timeout(Duration::from_secs(5), gate.put(b"finally"))
        .await
        .expect("barrier never lifted")
        .unwrap();

    gate.shutdown().await;
}

#[tokio::test]
async fn test_update_now_picks_up_group_deletion() {
    let env = TestEnv::new(OWNER);
    env.write_file(GROUP_FILE, OWNER.as_bytes());
    let gate = gate_over(&env);
    gate.update_now().await.unwrap();

    let stranger = dial_as(&gate, "eve@example.com").await;
    assert!(stranger.put(b"denied").await.unwrap_err().is(ErrorKind::Permission));

    // Removing the Group file reopens the store to everyone.
    env.dir
        .remove_entry(&lattice::types::PathName::new(GROUP_FILE));
    gate.update_now().await.unwrap();
    stranger.put(b"allowed again").await.unwrap();

    gate.shutdown().await;
}
