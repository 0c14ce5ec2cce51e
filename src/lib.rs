//! The execution core of a MongoDB driver: a generation-aware connection pool and the
//! operation engine that selects a server, augments a command with session and consistency
//! metadata, performs the round trip and decides whether a failure is retried.
//!
//! The topology is consumed through the [`Deployment`](sdam::Deployment) trait. A static
//! [`Topology`](sdam::Topology) over a fixed set of server descriptions is provided; it performs
//! no discovery or monitoring.
#![warn(
    missing_docs,
    rustdoc::missing_crate_level_docs,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
#![allow(
    clippy::unreadable_literal,
    clippy::cognitive_complexity,
    clippy::match_like_matches_macro,
    clippy::derive_partial_eq_without_eq
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use ::bson;

pub mod options;

mod client;
mod cmap;
mod concern;
mod context;
pub mod error;
pub mod event;
mod operation;
pub(crate) mod runtime;
pub mod sdam;
mod selection_criteria;
mod serde_util;
#[cfg(test)]
mod test;
mod trace;

pub use crate::{
    client::session::{
        ClientSession,
        ClusterClock,
        ClusterTime,
        ServerSessionPool,
        SessionOptions,
        TransactionOptions,
        TransactionState,
    },
    cmap::{
        conn::{wire, Connection, PooledConnection},
        establish::{AsyncStream, Establisher, TcpEstablisher},
        ConnectionPool,
        ForeignConnection,
    },
    context::{Context, ContextError},
    operation::{
        CountDocuments,
        DatabaseSpecification,
        DropCollection,
        DropDatabase,
        DropIndexes,
        ListDatabases,
        Operation,
        RetryType,
        RunCommand,
    },
};
