//! Registry entities: named services and the endpoints that provide them.

use std::collections::HashMap;
use std::time::SystemTime;

/// One route of a [`Match`]: endpoints whose labels satisfy
/// `destination_selector` (after template expansion over the client labels)
/// are candidates.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Destination {
    pub destination_selector: HashMap<String, String>,
}

/// Declarative selection rule: when `source_selector` is a subset of the
/// client labels, its routes pick the endpoint candidates.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Match {
    pub source_selector: HashMap<String, String>,
    pub routes: Vec<Destination>,
    /// When no route produced a candidate, continue with the next match
    /// instead of returning the empty set.
    pub fallthrough: bool,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NetworkService {
    pub name: String,
    pub payload: String,
    pub matches: Vec<Match>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NetworkServiceEndpoint {
    pub name: String,
    pub url: String,
    pub network_service_names: Vec<String>,
    /// Per-service label sets, keyed by service name.
    pub network_service_labels: HashMap<String, HashMap<String, String>>,
    pub expiration_time: Option<SystemTime>,
}

impl NetworkServiceEndpoint {
    pub fn labels_for(&self, service: &str) -> Option<&HashMap<String, String>> {
        self.network_service_labels.get(service)
    }

    pub fn expired(&self, now: SystemTime) -> bool {
        matches!(self.expiration_time, Some(t) if t <= now)
    }
}

