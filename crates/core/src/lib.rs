//! meshwire: per-connection chain runtime, manager/forwarder composition,
//! heal/refresh/timeout lifecycle and a service registry with expiration,
//! interpose and interdomain resolution for a network service mesh control
//! plane. Library-shaped; transports, SVID issuance, dataplane drivers and
//! DNS serving are seams the host fills in.

pub mod chain;
pub mod elements;
pub mod ipam;
pub mod manager;
pub mod model;
pub mod monitor;
pub mod registry;
mod status;
pub mod testing;
pub mod tools;
pub mod transport;

pub use status::{Result, Status};

/// Exports for building a node.
pub mod prelude {
    pub use crate::chain::{Candidates, ChainSlot, Ctx, NetworkServiceStep, Next, PeerIdentity, ServiceChain};
    pub use crate::manager::{ClientBuilder, EndpointBuilder, ForwarderBuilder, Manager, ManagerConfig};
    pub use crate::model::{Connection, NetworkService, NetworkServiceEndpoint, NetworkServiceRequest};
    pub use crate::registry::{RegistryChain, RegistryQuery, RegistryResponse};
    pub use crate::status::{Result, Status};
    pub use crate::tools::token::{ExpiringTokenGenerator, TokenGenerator};
    pub use crate::transport::{Dialer, Loopback, RemoteService, ServedNode};
}
