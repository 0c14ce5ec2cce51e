use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{options::ServerAddress, selection_criteria::TagSet};

/// The lowest wire version that understands OP_MSG. Older servers are spoken to with OP_QUERY.
/// Servers below this version reject `writeConcern` on commands such as `drop`.
pub(crate) const MIN_COMMAND_WRITE_CONCERN_WIRE_VERSION: i32 = 5;

pub(crate) const MIN_OP_MSG_WIRE_VERSION: i32 = 6;
/// The lowest wire version that reports and accepts `$clusterTime`.
pub(crate) const MIN_CLUSTER_TIME_WIRE_VERSION: i32 = 6;
/// The lowest wire version that supports retryable reads and writes.
pub(crate) const MIN_RETRYABLE_WIRE_VERSION: i32 = 6;

/// The possible types for a server.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize, Serialize, derive_more::Display)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the
    /// replica set config.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A server that has not been described.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
        )
    }
}

/// The possible types for a topology.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize, Default, derive_more::Display,
)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server, or a direct connection to any one server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

impl TopologyType {
    pub(crate) fn is_replica_set(self) -> bool {
        matches!(
            self,
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary
        )
    }
}

/// The range of wire protocol versions a server speaks.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
pub struct WireVersionRange {
    /// The lowest supported version.
    pub min: i32,

    /// The highest supported version.
    pub max: i32,
}

impl WireVersionRange {
    /// Constructs a new range.
    pub fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    /// Whether `version` falls inside this range.
    pub fn includes(&self, version: i32) -> bool {
        self.min <= version && version <= self.max
    }
}

/// A snapshot of what is known about a single server.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
#[non_exhaustive]
pub struct ServerDescription {
    /// The address the server is reachable at.
    pub address: ServerAddress,

    /// The kind of server.
    #[builder(default)]
    pub server_type: ServerType,

    /// The wire versions the server speaks, if known.
    #[builder(default, setter(strip_option))]
    pub wire_version: Option<WireVersionRange>,

    /// The replica set tags of the server.
    #[builder(default)]
    pub tags: TagSet,

    /// The session timeout reported by the server. `None` means the server does not support
    /// sessions.
    #[builder(default, setter(strip_option))]
    pub logical_session_timeout: Option<Duration>,
}

impl ServerDescription {
    /// A description of an unknown server at `address`.
    pub fn new(address: ServerAddress) -> Self {
        Self::builder().address(address).build()
    }

    pub(crate) fn max_wire_version(&self) -> Option<i32> {
        self.wire_version.map(|range| range.max)
    }

    fn supports_wire_version(&self, minimum: i32) -> bool {
        self.max_wire_version()
            .map(|max| max >= minimum)
            .unwrap_or(false)
    }

    pub(crate) fn supports_op_msg(&self) -> bool {
        self.supports_wire_version(MIN_OP_MSG_WIRE_VERSION)
    }

    pub(crate) fn supports_command_write_concern(&self) -> bool {
        self.supports_wire_version(MIN_COMMAND_WRITE_CONCERN_WIRE_VERSION)
    }

    pub(crate) fn supports_cluster_time(&self) -> bool {
        self.supports_wire_version(MIN_CLUSTER_TIME_WIRE_VERSION)
    }

    pub(crate) fn supports_retry(&self) -> bool {
        self.supports_wire_version(MIN_RETRYABLE_WIRE_VERSION)
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        tag_set
            .iter()
            .all(|(key, val)| self.tags.get(key) == Some(val))
    }
}
