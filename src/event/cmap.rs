//! Contains the events and functionality for monitoring the behavior of the connection pooling of
//! a deployment.

use std::time::Duration;

use derive_more::From;
use serde::Serialize;

use crate::{error::Error, options::ServerAddress};

pub use crate::cmap::options::ConnectionPoolOptions;

/// Event emitted when a connection pool is created.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,

    /// The options used for the pool.
    pub options: Option<ConnectionPoolOptions>,
}

/// Event emitted when a connection pool becomes ready, that is when `connect` succeeds.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct PoolReadyEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection pool is drained. Connections of older generations are closed
/// the next time they are checked in or found idle.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct PoolClearedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,

    /// The generation the pool moved to.
    pub generation: u64,
}

/// Event emitted when a connection pool is disconnected.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct PoolClosedEvent {
    /// The address of the server that the pool's connections connected to.
    pub address: ServerAddress,
}

/// Event emitted when a connection is dialed.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection within its pool.
    pub connection_id: u64,
}

/// Event emitted when a connection is closed.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection within its pool.
    pub connection_id: u64,

    /// The reason that the connection was closed.
    pub reason: ConnectionClosedReason,
}

/// The reasons that a connection may be closed.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The connection belongs to an older generation of the pool.
    Stale,

    /// The idle cache was full when the connection was checked in.
    Idle,

    /// An I/O on the connection failed or was interrupted.
    Error,

    /// The pool was disconnected.
    PoolClosed,
}

impl ConnectionClosedReason {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Stale => "Connection became stale because the pool was cleared",
            Self::Idle => "Connection pool was full",
            Self::Error => "An error occurred while using the connection",
            Self::PoolClosed => "Connection pool was closed",
        }
    }
}

/// Event emitted when a thread begins checking out a connection.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCheckoutStartedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a checkout attempt fails.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCheckoutFailedEvent {
    /// The address of the server that the connection would have connected to.
    pub address: ServerAddress,

    /// The reason a connection was unable to be checked out.
    pub reason: ConnectionCheckoutFailedReason,

    /// The error that caused the failure.
    #[serde(skip)]
    pub error: Option<Error>,

    /// How long the checkout ran before failing.
    #[serde(skip)]
    pub duration: Duration,
}

/// The reasons a connection may not be able to be checked out.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ConnectionCheckoutFailedReason {
    /// The pool was not connected.
    PoolClosed,

    /// The checkout's context was cancelled or expired.
    Timeout,

    /// An error occurred while dialing the connection.
    ConnectionError,
}

impl ConnectionCheckoutFailedReason {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::PoolClosed => "Connection pool was closed",
            Self::Timeout => "Wait queue timeout elapsed without a connection becoming available",
            Self::ConnectionError => "An error occurred while trying to establish a connection",
        }
    }
}

/// Event emitted when a connection is successfully checked out.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCheckedOutEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection within its pool.
    pub connection_id: u64,

    /// How long the checkout took.
    #[serde(skip)]
    pub duration: Duration,
}

/// Event emitted when a connection is checked back into a connection pool.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCheckedInEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection within its pool.
    pub connection_id: u64,
}

/// Every event a [`ConnectionPool`](crate::ConnectionPool) can emit.
#[derive(Clone, Debug, Serialize, From)]
#[serde(untagged)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum CmapEvent {
    PoolCreated(PoolCreatedEvent),
    PoolReady(PoolReadyEvent),
    PoolCleared(PoolClearedEvent),
    PoolClosed(PoolClosedEvent),
    ConnectionCreated(ConnectionCreatedEvent),
    ConnectionClosed(ConnectionClosedEvent),
    ConnectionCheckoutStarted(ConnectionCheckoutStartedEvent),
    ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent),
    ConnectionCheckedOut(ConnectionCheckedOutEvent),
    ConnectionCheckedIn(ConnectionCheckedInEvent),
}
