//! Fleet members: identity, lifecycle, load and replication.

pub mod balancer;
pub mod member;
pub mod peer;
pub mod prediction;
pub mod registry;
pub mod replication;

pub use balancer::{LoggingBalancer, PlacementBalancer};
pub use member::{ConnectionHandle, MemberKey, MemberRef};
pub use peer::{FleetPeer, PeerHandle};
pub use registry::{FleetRegistryHandle, Registered, Registration, ServerFleetRegistry};
