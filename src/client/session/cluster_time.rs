use std::sync::{Mutex, PoisonError};

use derive_where::derive_where;
use serde::{Deserialize, Serialize};

use crate::bson::{Document, Timestamp};

/// Struct modeling a cluster time reported by the server.
///
/// Cluster times are ordered by their timestamp alone; the signature is carried along
/// unexamined.
///
/// See [the MongoDB documentation](https://www.mongodb.com/docs/manual/core/read-isolation-consistency-recency/)
/// for more information.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[derive_where(PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    cluster_time: Timestamp,

    #[derive_where(skip)]
    signature: Document,
}

impl ClusterTime {
    /// Creates a cluster time from its timestamp and signature.
    pub fn new(cluster_time: Timestamp, signature: Document) -> Self {
        Self {
            cluster_time,
            signature,
        }
    }

    /// The logical time this cluster time represents.
    pub fn timestamp(&self) -> Timestamp {
        self.cluster_time
    }

    /// The server's signature over the timestamp.
    pub fn signature(&self) -> &Document {
        &self.signature
    }
}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The greatest cluster time seen across every operation sharing this clock.
#[derive(Debug, Default)]
pub struct ClusterClock {
    cluster_time: Mutex<Option<ClusterTime>>,
}

impl ClusterClock {
    /// Creates a clock that has not yet seen a cluster time.
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest cluster time, if any has been seen.
    pub fn get(&self) -> Option<ClusterTime> {
        self.cluster_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the stored cluster time with `to` if `to` is strictly greater. The comparison
    /// and the replacement happen atomically.
    pub fn advance(&self, to: &ClusterTime) {
        let mut current = self
            .cluster_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().map(|ct| ct < to).unwrap_or(true) {
            *current = Some(to.clone());
        }
    }
}

/// The greater of two optional cluster times.
pub(crate) fn max_cluster_time(
    lhs: Option<ClusterTime>,
    rhs: Option<ClusterTime>,
) -> Option<ClusterTime> {
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => Some(std::cmp::max(lhs, rhs)),
        (lhs, rhs) => lhs.or(rhs),
    }
}
