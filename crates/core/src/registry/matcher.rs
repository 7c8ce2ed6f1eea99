//! Query-template matching predicates and the label selector algebra shared
//! with discovery.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::model::{NetworkService, NetworkServiceEndpoint};

/// Expands `{{ .key }}` references in a selector value against the client
/// labels. Unknown keys and malformed templates leave the value untouched.
pub fn expand(value: &str, labels: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let inner = rest[start + 2..start + end].trim();
        let key = inner.strip_prefix('.').unwrap_or(inner);
        match labels.get(key) {
            Some(v) => out.push_str(v),
            None => out.push_str(&rest[start..start + end + 2]),
        }
        rest = &rest[start + end + 2..];
    }
    out.push_str(rest);
    out
}

/// Is `selector` a subset of `labels`, with selector values expanded over
/// `client_labels` before comparison.
pub fn is_subset(
    labels: &HashMap<String, String>,
    selector: &HashMap<String, String>,
    client_labels: &HashMap<String, String>,
) -> bool {
    if labels.len() < selector.len() {
        return false;
    }
    selector.iter().all(|(k, want)| match labels.get(k) {
        Some(have) => have == want || *have == expand(want, client_labels),
        None => false,
    })
}

fn seconds(at: SystemTime) -> i64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Match an endpoint against a query template. Empty template fields match
/// everything; names and URLs match on substring; expiration compares with
/// seconds precision only.
pub fn match_endpoint(template: &NetworkServiceEndpoint, candidate: &NetworkServiceEndpoint) -> bool {
    if !template.name.is_empty() && !candidate.name.contains(&template.name) {
        return false;
    }
    if !template.url.is_empty() && !candidate.url.contains(&template.url) {
        return false;
    }
    if let Some(want) = template.expiration_time {
        match candidate.expiration_time {
            Some(have) if seconds(have) == seconds(want) => {}
            _ => return false,
        }
    }
    if !template.network_service_names.is_empty()
        && !template
            .network_service_names
            .iter()
            .all(|n| candidate.network_service_names.contains(n))
    {
        return false;
    }
    let no_expansion = HashMap::new();
    for (service, selector) in &template.network_service_labels {
        match candidate.network_service_labels.get(service) {
            Some(labels) if is_subset(labels, selector, &no_expansion) => {}
            _ => return false,
        }
    }
    true
}

/// Match a service against a query template: substring on name, equality on
/// payload, template matches must all be present on the candidate.
pub fn match_service(template: &NetworkService, candidate: &NetworkService) -> bool {
    if !template.name.is_empty() && !candidate.name.contains(&template.name) {
        return false;
    }
    if !template.payload.is_empty() && candidate.payload != template.payload {
        return false;
    }
    template
        .matches
        .iter()
        .all(|m| candidate.matches.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Destination, Match};
    use std::time::Duration;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn reference_service() -> NetworkService {
        NetworkService {
            name: "ns-1-substring-match".into(),
            payload: "IP".into(),
            matches: vec![Match {
                source_selector: labels(&[("app", "firewall")]),
                routes: vec![Destination {
                    destination_selector: labels(&[("app", "some-middle-app")]),
                }],
                fallthrough: false,
            }],
        }
    }

    #[test]
    fn service_empty_template_matches_all() {
        assert!(match_service(&NetworkService::default(), &reference_service()));
    }

    #[test]
    fn service_name_matches_on_substring() {
        let template = NetworkService {
            name: "substring-match".into(),
            ..Default::default()
        };
        assert!(match_service(&template, &reference_service()));

        let template = NetworkService {
            name: "different-name".into(),
            ..Default::default()
        };
        assert!(!match_service(&template, &reference_service()));
    }

    #[test]
    fn service_payload_and_matches_must_agree() {
        let mut template = NetworkService {
            payload: "Ethernet".into(),
            ..Default::default()
        };
        assert!(!match_service(&template, &reference_service()));

        template.payload.clear();
        template.matches = vec![Match {
            source_selector: labels(&[("app", "vpn")]),
            ..Default::default()
        }];
        assert!(!match_service(&template, &reference_service()));
    }

    fn reference_endpoint() -> NetworkServiceEndpoint {
        NetworkServiceEndpoint {
            name: "nse-1-worker".into(),
            url: "tcp://127.0.0.1:5001".into(),
            network_service_names: vec!["vpn-gateway".into()],
            network_service_labels: [(
                "vpn-gateway".to_string(),
                labels(&[("app", "firewall"), ("zone", "a")]),
            )]
            .into(),
            expiration_time: Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
        }
    }

    #[test]
    fn endpoint_name_and_url_match_on_substring() {
        let mut template = NetworkServiceEndpoint {
            name: "worker".into(),
            ..Default::default()
        };
        assert!(match_endpoint(&template, &reference_endpoint()));

        template.name.clear();
        template.url = "127.0.0.1".into();
        assert!(match_endpoint(&template, &reference_endpoint()));
    }

    #[test]
    fn endpoint_expiration_compares_seconds_only() {
        let template = NetworkServiceEndpoint {
            expiration_time: Some(
                UNIX_EPOCH + Duration::from_secs(1_700_000_000) + Duration::from_nanos(999),
            ),
            ..Default::default()
        };
        assert!(match_endpoint(&template, &reference_endpoint()));
    }

    #[test]
    fn endpoint_label_subset_per_service() {
        let template = NetworkServiceEndpoint {
            network_service_labels: [("vpn-gateway".to_string(), labels(&[("app", "firewall")]))]
                .into(),
            ..Default::default()
        };
        assert!(match_endpoint(&template, &reference_endpoint()));

        let template = NetworkServiceEndpoint {
            network_service_labels: [("vpn-gateway".to_string(), labels(&[("app", "vpn")]))].into(),
            ..Default::default()
        };
        assert!(!match_endpoint(&template, &reference_endpoint()));
    }

    #[test]
    fn expand_substitutes_client_labels() {
        let client = labels(&[("app", "firewall")]);
        assert_eq!(expand("{{ .app }}", &client), "firewall");
        assert_eq!(expand("{{ .missing }}", &client), "{{ .missing }}");
        assert_eq!(expand("plain", &client), "plain");
    }

    #[test]
    fn subset_with_template_expansion() {
        let endpoint_labels = labels(&[("app", "firewall")]);
        let selector = labels(&[("app", "{{ .app }}")]);
        let client = labels(&[("app", "firewall")]);
        assert!(is_subset(&endpoint_labels, &selector, &client));
        assert!(!is_subset(&endpoint_labels, &selector, &labels(&[("app", "vpn")])));
    }
}
