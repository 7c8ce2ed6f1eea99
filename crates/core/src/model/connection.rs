use std::collections::HashMap;

use super::context::ConnectionContext;
use super::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConnectionState {
    #[default]
    Up,
    Down,
    RefreshRequested,
}

/// Dataplane mechanism description. The SDK never interprets `parameters`;
/// mechanism drivers are external collaborators.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Mechanism {
    pub class: String,
    pub kind: String,
    pub parameters: HashMap<String, String>,
}

/// The in-flight object a request carries through the mesh.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Connection {
    pub id: String,
    pub network_service: String,
    pub labels: HashMap<String, String>,
    pub mechanism: Option<Mechanism>,
    pub context: ConnectionContext,
    pub path: Path,
    pub state: ConnectionState,
    /// Hint naming the endpoint this connection should (re)use. Cleared on
    /// reselect so discovery runs afresh.
    pub network_service_endpoint_name: String,
}

impl Connection {
    pub fn current_path_segment(&self) -> Option<&super::path::PathSegment> {
        self.path.current_segment()
    }

    /// Segment appended by the hop we forwarded to.
    pub fn next_path_segment(&self) -> Option<&super::path::PathSegment> {
        self.path.next_segment()
    }

    pub fn prev_path_segment(&self) -> Option<&super::path::PathSegment> {
        self.path.prev_segment()
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NetworkServiceRequest {
    pub connection: Connection,
    pub mechanism_preferences: Vec<Mechanism>,
}

impl NetworkServiceRequest {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            mechanism_preferences: Vec::new(),
        }
    }
}
