//! The deployment-facing half of the crate: server and topology descriptions, the
//! [`Deployment`] and [`Server`] traits the operation engine is written against, and a static
//! [`Topology`] implementation.

mod description;
mod server_selection;
mod topology;

pub use self::{
    description::{ServerDescription, ServerType, TopologyType, WireVersionRange},
    topology::{Deployment, SelectedServer, Server, Topology, TopologyServer},
};

pub(crate) use self::description::{
    MIN_CLUSTER_TIME_WIRE_VERSION,
    MIN_OP_MSG_WIRE_VERSION,
    MIN_RETRYABLE_WIRE_VERSION,
};
