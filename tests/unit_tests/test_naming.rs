// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use weft::{
    error::NamingError,
    naming::{Naming, NamingConfig, memory::MemoryStore, store::CoordStore},
};

fn fresh_naming(store: &Arc<MemoryStore>) -> Arc<Naming> {
    Naming::new(store.clone(), NamingConfig::default())
}

/// Cache windows collapsed so every lookup hits the store.
fn uncached_naming(store: &Arc<MemoryStore>) -> Arc<Naming> {
    Naming::new(store.clone(), NamingConfig {
        refresh: std::time::Duration::ZERO,
        invalid: std::time::Duration::ZERO,
    })
}

#[tokio::test]
async fn register_lookup_unregister() {
    let store = MemoryStore::shared();
    let naming = uncached_naming(&store);

    let urls = vec!["tcp://10.0.0.1:8000".to_string()];
    naming
        .register("/demo/ServiceList/Foo", &urls, 1)
        .await
        .expect("register");

    let got = naming
        .get_urls_by_name("/demo/ServiceList/Foo")
        .await
        .expect("lookup");
    assert_eq!(got, urls);

    // Same instance id registering again is a conflict.
    assert_eq!(
        naming.register("/demo/ServiceList/Foo", &urls, 1).await,
        Err(NamingError::UrlAlreadyRegistered)
    );

    naming
        .unregister("/demo/ServiceList/Foo", 1)
        .await
        .expect("unregister");
    let got = naming
        .get_urls_by_name("/demo/ServiceList/Foo")
        .await
        .expect("lookup after unregister");
    assert!(got.is_empty());

    assert_eq!(
        naming.unregister("/demo/ServiceList/Foo", 1).await,
        Err(NamingError::UrlNotBound)
    );
}

#[tokio::test]
async fn lookup_unions_and_dedupes_instances() {
    let store = MemoryStore::shared();
    let naming = uncached_naming(&store);
    let name = "/demo/ServiceList/Bar";

    naming
        .register(name, &["tcp://a:1".into(), "tcp://shared:9".into()], 1)
        .await
        .expect("register 1");
    naming
        .register(name, &["tcp://b:2".into(), "tcp://shared:9".into()], 2)
        .await
        .expect("register 2");

    let mut got = naming.get_urls_by_name(name).await.expect("lookup");
    got.sort();
    assert_eq!(got, vec![
        "tcp://a:1".to_string(),
        "tcp://b:2".to_string(),
        "tcp://shared:9".to_string(),
    ]);
}

#[tokio::test]
async fn wildcard_matches_within_segments() {
    let store = MemoryStore::shared();
    let naming = uncached_naming(&store);

    naming
        .register("/g/u1/s/foo", &["tcp://x:1".into()], 1)
        .await
        .expect("register u1");
    naming
        .register("/g/u2/s/foo", &["tcp://y:1".into()], 1)
        .await
        .expect("register u2");
    naming
        .register("/g/u1/s/other", &["tcp://z:1".into()], 1)
        .await
        .expect("register other");

    let mut got = naming
        .get_urls_by_name("/g/*/s/foo")
        .await
        .expect("wildcard lookup");
    got.sort();
    assert_eq!(got, vec!["tcp://x:1".to_string(), "tcp://y:1".to_string()]);

    // A star inside a segment must not cross the slash boundary.
    let got = naming
        .get_urls_by_name("/g/u*1/s/foo")
        .await
        .expect("inner star");
    assert_eq!(got, vec!["tcp://x:1".to_string()]);

    let got = naming
        .get_urls_by_name("/g/*/s/o*r")
        .await
        .expect("suffix star");
    assert_eq!(got, vec!["tcp://z:1".to_string()]);
}

#[tokio::test]
async fn watch_fires_once_per_effective_change() {
    let store = MemoryStore::shared();
    let naming = fresh_naming(&store);
    let name = "/demo/ServiceList/Watched";

    naming
        .register(name, &["tcp://a:1".into()], 1)
        .await
        .expect("seed instance");

    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let (hits2, seen2) = (Arc::clone(&hits), Arc::clone(&seen));
    naming
        .watch_name(
            name,
            Arc::new(move |urls: &[String]| {
                hits2.fetch_add(1, Ordering::SeqCst);
                *seen2.lock().expect("lock") = urls.to_vec();
            }),
        )
        .await
        .expect("watch");

    // Two changes before the next update collapse into one callback.
    naming
        .register(name, &["tcp://b:2".into()], 2)
        .await
        .expect("add b");
    naming
        .register(name, &["tcp://c:3".into()], 3)
        .await
        .expect("add c");
    naming.update().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let snapshot = seen.lock().expect("lock").clone();
    assert_eq!(snapshot.len(), 3);

    // A quiet tick calls nobody.
    naming.update().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // The cache was refreshed before the callback, so a lookup from
    // inside (or right after) the callback sees the new set.
    let got = naming.get_urls_by_name(name).await.expect("cached lookup");
    assert_eq!(got.len(), 3);
}

#[tokio::test]
async fn session_recovery_restores_registrations_and_watches() {
    let store = MemoryStore::shared();
    let naming = fresh_naming(&store);
    let name = "/demo/ServiceList/Durable";

    naming.set_app_info("demo", "secret").await.expect("auth");
    naming
        .register(name, &["tcp://a:1".into()], 1)
        .await
        .expect("register");

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    naming
        .watch_name(name, Arc::new(move |_urls: &[String]| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .expect("watch");

    // The expiry wipes the ephemeral leaf...
    store.expire_session();
    let (children, _) = store
        .get_children(name, None)
        .await
        .expect("children after expiry");
    assert!(children.is_empty());

    // ...and the next update re-creates it and re-arms the watch.
    naming.update().await;
    let (children, _) = store
        .get_children(name, None)
        .await
        .expect("children after restore");
    assert_eq!(children, vec!["1".to_string()]);

    // The restored registration is observable through a lookup too.
    let naming2 = uncached_naming(&store);
    let got = naming2.get_urls_by_name(name).await.expect("lookup");
    assert_eq!(got, vec!["tcp://a:1".to_string()]);
}
