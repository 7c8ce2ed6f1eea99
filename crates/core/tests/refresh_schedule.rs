//! Refresh scheduling under a virtual clock: with a 1h token lifetime, the
//! reissue fires no later than the half-life, exactly once per interval.

use std::time::Duration;

use meshwire::chain::Ctx;
use meshwire::model::{Connection, NetworkServiceRequest};
use meshwire::testing::{CountStep, DomainBuilder};

const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test(start_paused = true)]
async fn refresh_fires_once_per_half_life() {
    let domain = DomainBuilder::new("domain-a")
        .nodes(1)
        .token_lifetime(HOUR)
        .build();
    domain.register_service("vpn").await.unwrap();
    let counter = CountStep::new();
    domain
        .register_endpoint(0, "nse-1", "vpn", vec![counter.clone()])
        .await
        .unwrap();

    let client = domain.client(0, "nsc-1").build();
    let ctx = Ctx::background();
    client
        .request(
            &ctx,
            NetworkServiceRequest::new(Connection {
                network_service: "vpn".into(),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    assert_eq!(counter.requests(), 1);

    // Just before the half-life: nothing yet.
    tokio::time::sleep(Duration::from_secs(29 * 60)).await;
    assert_eq!(counter.requests(), 1);

    // Crossing the half-life: exactly one refresh.
    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    assert_eq!(counter.requests(), 2);

    // And exactly one more per further interval.
    tokio::time::sleep(Duration::from_secs(29 * 60)).await;
    assert_eq!(counter.requests(), 2);
    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    assert_eq!(counter.requests(), 3);
}
