//! Manager cache behavior: single-flight loads, TTL, size eviction, drain.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MockLoader;
use kronk_core::{Ctx, Error, Manager, ManagerConfig, ModelConfig, ModelResolver, Result};

fn resolver() -> Arc<dyn ModelResolver> {
    Arc::new(|model_id: &str| -> Result<ModelConfig> {
        if model_id.starts_with("test/") {
            Ok(ModelConfig {
                context_window: 4096,
                ..ModelConfig::new(model_id)
            })
        } else {
            Err(Error::NotFound(model_id.to_string()))
        }
    })
}

fn manager(cfg: ManagerConfig, loader: &MockLoader) -> Arc<Manager> {
    Manager::new(cfg, Arc::new(loader.clone()), resolver())
}

#[tokio::test]
async fn acquire_returns_cached_handle_within_ttl() {
    let loader = MockLoader::new(&["x"]);
    let mgr = manager(ManagerConfig::default(), &loader);

    let ctx = Ctx::with_timeout(Duration::from_secs(5));
    let first = mgr.acquire(&ctx, "test/chat").await.unwrap();
    let second = mgr.acquire(&ctx, "test/chat").await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(loader.load_count(), 1);
    assert_eq!(mgr.len(), 1);
}

#[tokio::test]
async fn acquire_is_case_insensitive_on_model_id() {
    let loader = MockLoader::new(&["x"]);
    let mgr = manager(ManagerConfig::default(), &loader);

    let ctx = Ctx::with_timeout(Duration::from_secs(5));
    let first = mgr.acquire(&ctx, "test/chat").await.unwrap();
    let second = mgr.acquire(&ctx, "Test/Chat").await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(loader.load_count(), 1);
}

#[tokio::test]
async fn concurrent_acquires_share_one_load() {
    let loader = MockLoader::new(&["x"]);
    let mgr = manager(ManagerConfig::default(), &loader);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let mgr = mgr.clone();
        handles.push(tokio::spawn(async move {
            let ctx = Ctx::with_timeout(Duration::from_secs(5));
            mgr.acquire(&ctx, "test/chat").await
        }));
    }

    let mut kronks = Vec::new();
    for handle in handles {
        kronks.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(loader.load_count(), 1);
    for kronk in &kronks[1..] {
        assert!(Arc::ptr_eq(&kronks[0], kronk));
    }
}

#[tokio::test]
async fn load_failure_reaches_every_waiter_then_recovers() {
    let loader = MockLoader::new(&["x"]);
    loader
        .fail_loads
        .store(1, std::sync::atomic::Ordering::SeqCst);
    let mgr = manager(ManagerConfig::default(), &loader);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let mgr = mgr.clone();
        handles.push(tokio::spawn(async move {
            let ctx = Ctx::with_timeout(Duration::from_secs(5));
            mgr.acquire(&ctx, "test/chat").await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_err());
    }
    assert_eq!(mgr.len(), 0);

    // The failure is not sticky.
    let ctx = Ctx::with_timeout(Duration::from_secs(5));
    assert!(mgr.acquire(&ctx, "test/chat").await.is_ok());
}

#[tokio::test]
async fn unknown_model_is_not_found() {
    let loader = MockLoader::new(&["x"]);
    let mgr = manager(ManagerConfig::default(), &loader);

    let ctx = Ctx::with_timeout(Duration::from_secs(5));
    let err = mgr.acquire(&ctx, "missing/model").await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
    assert!(err.to_string().contains("missing/model"));
}

#[tokio::test]
async fn ttl_expiry_reloads_the_model() {
    let loader = MockLoader::new(&["x"]);
    let cfg = ManagerConfig {
        ttl: Duration::from_millis(50),
        ..ManagerConfig::default()
    };
    let mgr = manager(cfg, &loader);

    let ctx = Ctx::with_timeout(Duration::from_secs(5));
    let first = mgr.acquire(&ctx, "test/chat").await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;

    let second = mgr.acquire(&ctx, "test/chat").await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(loader.load_count(), 2);
}

#[tokio::test]
async fn size_eviction_unloads_least_recently_used() {
    let loader = MockLoader::new(&["x"]);
    let cfg = ManagerConfig {
        max_models: 1,
        ..ManagerConfig::default()
    };
    let mgr = manager(cfg, &loader);

    let ctx = Ctx::with_timeout(Duration::from_secs(5));
    let first = mgr.acquire(&ctx, "test/one").await.unwrap();
    let _second = mgr.acquire(&ctx, "test/two").await.unwrap();

    assert_eq!(mgr.len(), 1);

    // The evicted handle is unloaded in the background.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let result = first.unload(&Ctx::with_timeout(Duration::from_secs(1))).await;
        match result {
            Err(Error::AlreadyUnloaded) => break,
            _ => {
                assert!(std::time::Instant::now() < deadline, "eviction never unloaded");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
}

#[tokio::test]
async fn shutdown_drains_and_rejects_new_acquires() {
    let loader = MockLoader::new(&["x"]);
    let mgr = manager(ManagerConfig::default(), &loader);

    let ctx = Ctx::with_timeout(Duration::from_secs(5));
    mgr.acquire(&ctx, "test/chat").await.unwrap();
    assert_eq!(mgr.len(), 1);

    mgr.shutdown(&Ctx::with_timeout(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(mgr.len(), 0);

    let err = mgr.acquire(&ctx, "test/chat").await.unwrap_err();
    assert_eq!(err.kind(), "unavailable");
}
