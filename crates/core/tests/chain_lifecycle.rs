//! End-to-end request/close through a full domain: client → manager →
//! endpoint, with path bookkeeping and close idempotence.

use std::sync::Arc;

use meshwire::chain::Ctx;
use meshwire::model::{Connection, NetworkServiceRequest};
use meshwire::testing::{CountStep, DomainBuilder};

fn request_for(service: &str) -> NetworkServiceRequest {
    NetworkServiceRequest::new(Connection {
        network_service: service.into(),
        ..Default::default()
    })
}

#[tokio::test]
async fn request_builds_a_three_hop_path() {
    let domain = DomainBuilder::new("domain-a").nodes(1).build();
    domain.register_service("vpn").await.unwrap();
    let counter = CountStep::new();
    domain
        .register_endpoint(0, "nse-1", "vpn", vec![counter.clone()])
        .await
        .unwrap();

    let client = domain.client(0, "nsc-1").build();
    let ctx = Ctx::background();
    let conn = client.request(&ctx, request_for("vpn")).await.unwrap();

    let names: Vec<&str> = conn.path.segments.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["nsc-1", "nsmgr-0.domain-a", "nse-1"]);
    // The client observes the path at its own hop.
    assert_eq!(conn.path.index, 0);
    assert_eq!(conn.network_service_endpoint_name, "nse-1");
    for segment in &conn.path.segments {
        assert!(!segment.id.is_empty());
        assert!(!segment.token.is_empty());
        assert!(segment.expires.is_some());
    }
    assert_eq!(counter.requests(), 1);
}

#[tokio::test]
async fn close_is_idempotent_and_reaches_the_endpoint() {
    let domain = DomainBuilder::new("domain-a").nodes(1).build();
    domain.register_service("vpn").await.unwrap();
    let counter = CountStep::new();
    domain
        .register_endpoint(0, "nse-1", "vpn", vec![counter.clone()])
        .await
        .unwrap();

    let client = domain.client(0, "nsc-1").build();
    let ctx = Ctx::background();
    let conn = client.request(&ctx, request_for("vpn")).await.unwrap();

    client.close(&ctx, conn.clone()).await.unwrap();
    assert_eq!(counter.closes(), 1);
    assert_eq!(counter.unique_closes(), 1);

    // A second close of the same connection changes nothing.
    client.close(&ctx, conn).await.unwrap();
    assert_eq!(counter.closes(), 1);
}

#[tokio::test]
async fn refresh_keeps_the_segment_ids_stable() {
    let domain = DomainBuilder::new("domain-a").nodes(1).build();
    domain.register_service("vpn").await.unwrap();
    let counter = CountStep::new();
    domain
        .register_endpoint(0, "nse-1", "vpn", vec![counter.clone()])
        .await
        .unwrap();

    let client = domain.client(0, "nsc-1").build();
    let ctx = Ctx::background();
    let first = client.request(&ctx, request_for("vpn")).await.unwrap();
    let ids: Vec<String> = first.path.segments.iter().map(|s| s.id.clone()).collect();
    let tokens: Vec<String> = first.path.segments.iter().map(|s| s.token.clone()).collect();

    let second = client
        .request(&ctx, NetworkServiceRequest::new(first))
        .await
        .unwrap();
    let ids2: Vec<String> = second.path.segments.iter().map(|s| s.id.clone()).collect();
    let tokens2: Vec<String> = second.path.segments.iter().map(|s| s.token.clone()).collect();

    // Hop identity is stable across refreshes; tokens are minted anew.
    assert_eq!(ids, ids2);
    assert_ne!(tokens, tokens2);
    assert_eq!(counter.requests(), 2);
    assert_eq!(counter.unique_requests(), 1);
}

#[tokio::test]
async fn two_clients_round_robin_over_two_endpoints() {
    let domain = DomainBuilder::new("domain-a").nodes(1).build();
    domain.register_service("vpn").await.unwrap();
    let c1 = CountStep::new();
    let c2 = CountStep::new();
    domain
        .register_endpoint(0, "nse-1", "vpn", vec![c1.clone()])
        .await
        .unwrap();
    domain
        .register_endpoint(0, "nse-2", "vpn", vec![c2.clone()])
        .await
        .unwrap();

    for i in 0..4 {
        let client = domain.client(0, &format!("nsc-{i}")).build();
        client
            .request(&Ctx::background(), request_for("vpn"))
            .await
            .unwrap();
    }
    assert_eq!(c1.requests() + c2.requests(), 4);
    assert!(c1.requests() >= 1 && c2.requests() >= 1);
}

#[tokio::test]
async fn failed_first_request_leaves_no_state_behind() {
    use meshwire::testing::InjectErrorStep;
    use meshwire::Status;

    let domain = DomainBuilder::new("domain-a").nodes(1).build();
    domain.register_service("vpn").await.unwrap();
    let counter = CountStep::new();
    domain
        .register_endpoint(
            0,
            "nse-1",
            "vpn",
            vec![
                InjectErrorStep::times(Status::unavailable("endpoint warming up"), 1),
                counter.clone(),
            ],
        )
        .await
        .unwrap();

    let client = domain.client(0, "nsc-1").build();
    let ctx = Ctx::background();
    let err = client.request(&ctx, request_for("vpn")).await.unwrap_err();
    assert!(matches!(err, Status::Unavailable(_)));
    assert_eq!(counter.requests(), 0);

    // The same chain recovers once the endpoint answers.
    let conn = client.request(&ctx, request_for("vpn")).await.unwrap();
    assert_eq!(counter.requests(), 1);
    client.close(&ctx, conn).await.unwrap();
    assert_eq!(counter.closes(), 1);
}

#[tokio::test]
async fn concurrent_operations_on_one_id_are_serialised() {
    use async_trait::async_trait;
    use meshwire::chain::{NetworkServiceStep, Next};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Trips if two calls overlap inside the endpoint.
    #[derive(Default)]
    struct MutualExclusionProbe {
        busy: AtomicBool,
        overlaps: AtomicUsize,
    }

    #[async_trait]
    impl NetworkServiceStep for MutualExclusionProbe {
        async fn request(
            &self,
            ctx: &Ctx,
            request: NetworkServiceRequest,
            next: Next<'_>,
        ) -> meshwire::Result<Connection> {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            tokio::task::yield_now().await;
            let result = next.request(ctx, request).await;
            self.busy.store(false, Ordering::SeqCst);
            result
        }

        async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> meshwire::Result<()> {
            next.close(ctx, conn).await
        }
    }

    let domain = DomainBuilder::new("domain-a").nodes(1).build();
    domain.register_service("vpn").await.unwrap();
    let probe = Arc::new(MutualExclusionProbe::default());
    domain
        .register_endpoint(0, "nse-1", "vpn", vec![probe.clone()])
        .await
        .unwrap();

    let client = domain.client(0, "nsc-1").build();
    let ctx = Ctx::background();
    let conn = client.request(&ctx, request_for("vpn")).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = Arc::clone(&client);
        let conn = conn.clone();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            client
                .request(&ctx, NetworkServiceRequest::new(conn))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(probe.overlaps.load(Ordering::SeqCst), 0);
}
