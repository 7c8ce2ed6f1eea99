//! Registry behaviour at domain scope: round trips, watch streams with
//! tombstones, expiration without refresh, local bypass through a manager.

use std::time::Duration;

use meshwire::chain::Ctx;
use meshwire::model::NetworkServiceEndpoint;
use meshwire::registry::RegistryQuery;
use meshwire::testing::DomainBuilder;
use tokio::sync::mpsc;

fn nse(name: &str, url: &str) -> NetworkServiceEndpoint {
    NetworkServiceEndpoint {
        name: name.into(),
        url: url.into(),
        network_service_names: vec!["vpn".into()],
        ..Default::default()
    }
}

#[tokio::test]
async fn register_find_unregister_round_trip() {
    let domain = DomainBuilder::new("domain-a").nodes(1).build();
    let registry = &domain.nse_registry;
    let ctx = Ctx::background();

    registry
        .register(&ctx, nse("nse-1", "tcp://nse-1:5003"))
        .await
        .unwrap();
    let found = registry
        .list(&ctx, NetworkServiceEndpoint::default())
        .await
        .unwrap();
    assert_eq!(found.len(), 1);

    registry
        .unregister(&ctx, nse("nse-1", "tcp://nse-1:5003"))
        .await
        .unwrap();
    let found = registry
        .list(&ctx, NetworkServiceEndpoint::default())
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn watch_streams_updates_and_tombstones() {
    let domain = DomainBuilder::new("domain-a").nodes(1).build();
    let registry = std::sync::Arc::clone(&domain.nse_registry);
    let ctx = Ctx::background();

    let (tx, mut rx) = mpsc::channel(16);
    let watch_ctx = ctx.child();
    let watch_registry = std::sync::Arc::clone(&registry);
    let watcher = tokio::spawn(async move {
        watch_registry
            .find(
                &watch_ctx,
                RegistryQuery::watched(NetworkServiceEndpoint::default()),
                &tx,
            )
            .await
    });
    tokio::task::yield_now().await;

    registry
        .register(&ctx, nse("nse-1", "tcp://nse-1:5003"))
        .await
        .unwrap();
    let event = rx.recv().await.unwrap();
    assert_eq!(event.entity.name, "nse-1");
    assert!(!event.deleted);

    registry
        .unregister(&ctx, nse("nse-1", "tcp://nse-1:5003"))
        .await
        .unwrap();
    let event = rx.recv().await.unwrap();
    assert!(event.deleted);

    // Ending the watcher's context ends the stream without error and leaves
    // no task behind.
    ctx.cancel();
    watcher.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn unrefreshed_registrations_expire() {
    let domain = DomainBuilder::new("domain-a").nodes(1).build();
    let registry = &domain.nse_registry;
    let ctx = Ctx::background();

    // Registered directly, with nobody refreshing it.
    let registered = registry
        .register(&ctx, nse("nse-1", "tcp://nse-1:5003"))
        .await
        .unwrap();
    assert!(registered.expiration_time.is_some());

    tokio::time::sleep(Duration::from_secs(90)).await;
    let found = registry
        .list(&ctx, NetworkServiceEndpoint::default())
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn manager_registration_applies_local_bypass() {
    let domain = DomainBuilder::new("domain-a").nodes(1).build();
    let manager = &domain.nodes[0].manager;
    let ctx = Ctx::background();

    manager
        .nse_registry
        .register(&ctx, nse("nse-1", "unix:///var/run/nse-1.sock"))
        .await
        .unwrap();

    // The shared domain registry sees the manager's URL…
    let shared = domain
        .nse_registry
        .list(&ctx, NetworkServiceEndpoint::default())
        .await
        .unwrap();
    assert_eq!(shared[0].url, domain.nodes[0].url);

    // …while a find through the manager itself restores the direct URL.
    let local = manager
        .nse_registry
        .list(&ctx, NetworkServiceEndpoint::default())
        .await
        .unwrap();
    assert_eq!(local[0].url, "unix:///var/run/nse-1.sock");
}
