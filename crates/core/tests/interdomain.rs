//! Interdomain resolution across two federated domains.

use meshwire::chain::Ctx;
use meshwire::model::NetworkServiceEndpoint;
use meshwire::testing::{federate, DomainBuilder};

#[tokio::test]
async fn find_by_domain_qualified_name_returns_the_remote_endpoint() {
    let domain_a = DomainBuilder::new("domain-a").nodes(1).build();
    let domain_b = DomainBuilder::new("domain-b").nodes(1).build();
    federate(&[&domain_a, &domain_b]);

    // nse-1 lives in domain-b.
    domain_b
        .nse_registry
        .register(
            &Ctx::background(),
            NetworkServiceEndpoint {
                name: "nse-1".into(),
                url: "tcp://nse-1.domain-b:5003".into(),
                network_service_names: vec!["vpn".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // A client in domain-a asks its local registry with the @domain suffix.
    let found = domain_a
        .nse_registry
        .list(
            &Ctx::background(),
            NetworkServiceEndpoint {
                name: "nse-1@domain-b".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "nse-1@domain-b");
    assert_eq!(found[0].url, "tcp://nse-1.domain-b:5003");
}

#[tokio::test]
async fn plain_names_never_leave_the_domain() {
    let domain_a = DomainBuilder::new("domain-a").nodes(1).build();
    let domain_b = DomainBuilder::new("domain-b").nodes(1).build();
    federate(&[&domain_a, &domain_b]);

    domain_b
        .nse_registry
        .register(
            &Ctx::background(),
            NetworkServiceEndpoint {
                name: "nse-1".into(),
                url: "tcp://nse-1.domain-b:5003".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let found = domain_a
        .nse_registry
        .list(
            &Ctx::background(),
            NetworkServiceEndpoint {
                name: "nse-1".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn interdomain_register_round_trips_through_the_remote_registry() {
    let domain_a = DomainBuilder::new("domain-a").nodes(1).build();
    let domain_b = DomainBuilder::new("domain-b").nodes(1).build();
    federate(&[&domain_a, &domain_b]);

    domain_a
        .nse_registry
        .register(
            &Ctx::background(),
            NetworkServiceEndpoint {
                name: "nse-2@domain-b".into(),
                url: "tcp://nse-2.domain-a:5003".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Plain-name find inside domain-b sees it.
    let found = domain_b
        .nse_registry
        .list(
            &Ctx::background(),
            NetworkServiceEndpoint {
                name: "nse-2".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "nse-2");
}
