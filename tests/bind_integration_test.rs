// Integration tests for the binding switch: registration, the dialed
// service pool, single-flight dials, ping revalidation, and release.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{inprocess, user, TestEnv, TestStore, TestStoreDialer};
use lattice::bind::Switch;
use lattice::errors::ErrorKind;
use lattice::service::Context;
use lattice::types::{Endpoint, Transport, UserRecord};

#[tokio::test]
async fn test_duplicate_registration_is_invalid() {
    let env = TestEnv::new("ann@example.com");
    let err = env
        .switch
        .register_store_server(Transport::InProcess, env.store_dialer.clone())
        .unwrap_err();
    assert!(err.is(ErrorKind::Invalid));
}

#[tokio::test]
async fn test_unassigned_endpoint_is_never_dialed() {
    let env = TestEnv::new("ann@example.com");
    let err = match env
        .switch
        .store_server(&env.ctx, &Endpoint::unassigned())
        .await
    {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    };
    assert!(err.is(ErrorKind::Invalid));
    assert_eq!(env.store_dialer.dial_count(), 0);
}

#[tokio::test]
async fn test_concurrent_binds_share_one_dial() {
    let env = TestEnv::new("ann@example.com");
    env.store_dialer.delay_ms.store(50, Ordering::SeqCst);

    let ep = inprocess("store1");
    let (a, b) = tokio::join!(
        env.switch.store_server(&env.ctx, &ep),
        env.switch.store_server(&env.ctx, &ep),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(env.store_dialer.dial_count(), 1);
    assert!(Arc::ptr_eq(&a, &b));
}

#[tokio::test]
async fn test_same_key_reuses_cached_service() {
    let env = TestEnv::new("ann@example.com");
    let ep = inprocess("store1");
    let a = env.switch.store_server(&env.ctx, &ep).await.unwrap();
    let b = env.switch.store_server(&env.ctx, &ep).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(env.store_dialer.dial_count(), 1);
}

#[tokio::test]
async fn test_different_users_dial_independently() {
    let env = TestEnv::new("ann@example.com");
    let ep = inprocess("store1");
    let other = Context::new(user("bob@example.com"))
        .with_key_endpoint(inprocess("key1"))
        .with_dir_endpoint(inprocess("dir1"))
        .with_store_endpoint(ep.clone());

    env.switch.store_server(&env.ctx, &ep).await.unwrap();
    env.switch.store_server(&other, &ep).await.unwrap();
    assert_eq!(env.store_dialer.dial_count(), 2);
}

#[tokio::test]
async fn test_no_cache_dials_every_time() {
    let env = TestEnv::new("ann@example.com");
    env.switch.no_cache();
    let ep = inprocess("store1");
    env.switch.store_server(&env.ctx, &ep).await.unwrap();
    env.switch.store_server(&env.ctx, &ep).await.unwrap();
    assert_eq!(env.store_dialer.dial_count(), 2);
}

#[tokio::test]
async fn test_failed_ping_fails_the_dial() {
    let env = TestEnv::new("ann@example.com");
    env.store.ping_ok.store(false, Ordering::SeqCst);
    let err = match env
        .switch
        .store_server(&env.ctx, &inprocess("store1"))
        .await
    {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    };
    assert!(err.is(ErrorKind::Io));
}

#[tokio::test]
async fn test_dead_service_is_evicted_and_redialed() {
    // Zero freshness forces a revalidating ping on every bind.
    let switch = Arc::new(Switch::with_ping_freshness(Duration::ZERO));
    let dialer = TestStoreDialer::new();
    let old = TestStore::new(inprocess("store1"));
    dialer.add(old.clone());
    switch
        .register_store_server(Transport::InProcess, dialer.clone())
        .unwrap();
    let ctx = Context::new(user("ann@example.com"));

    let first = switch.store_server(&ctx, &inprocess("store1")).await.unwrap();
    assert_eq!(dialer.dial_count(), 1);

    // The cached service dies; a fresh one appears behind the same
    // endpoint.
    old.ping_ok.store(false, Ordering::SeqCst);
    let fresh = TestStore::new(inprocess("store1"));
    dialer.replace(fresh);

    let second = switch.store_server(&ctx, &inprocess("store1")).await.unwrap();
    assert_eq!(dialer.dial_count(), 2);
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(old.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_release_removes_and_closes() {
    let env = TestEnv::new("ann@example.com");
    let ep = inprocess("store1");
    let service = env.switch.store_server(&env.ctx, &ep).await.unwrap();

    env.switch.release_store_server(&service).await.unwrap();
    assert!(env.store.closed.load(Ordering::SeqCst));

    // Releasing an unknown service reports NotExist.
    let err = env.switch.release_store_server(&service).await.unwrap_err();
    assert!(err.is(ErrorKind::NotExist));

    // The next bind dials afresh.
    env.switch.store_server(&env.ctx, &ep).await.unwrap();
    assert_eq!(env.store_dialer.dial_count(), 2);
}

#[tokio::test]
async fn test_dir_server_for_tries_endpoints_in_order() {
    let env = TestEnv::new("ann@example.com");

    // bob's record lists a dead endpoint before a live one.
    let bob = user("bob@example.com");
    env.key.add_user(UserRecord {
        name: bob.clone(),
        dirs: vec![inprocess("nowhere"), inprocess("dir1")],
        stores: vec![inprocess("store1")],
        public_key: String::new(),
    });

    let dir = env
        .switch
        .dir_server_for(&env.ctx, Some(&bob))
        .await
        .unwrap();
    assert_eq!(dir.endpoint(), inprocess("dir1"));
}

#[tokio::test]
async fn test_dir_server_for_unknown_user() {
    let env = TestEnv::new("ann@example.com");
    let err = match env
        .switch
        .dir_server_for(&env.ctx, Some(&user("ghost@example.com")))
        .await
    {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    };
    assert!(err.is(ErrorKind::NotExist));
}

#[tokio::test]
async fn test_dir_server_for_self_uses_default_endpoint() {
    let env = TestEnv::new("ann@example.com");
    let dir = env.switch.dir_server_for(&env.ctx, None).await.unwrap();
    assert_eq!(dir.endpoint(), inprocess("dir1"));
}
