use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    event::{cmap::CmapEvent, EventHandler},
    serde_util,
};

/// The default maximum number of idle connections a pool keeps.
pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 100;

/// Contains the options for creating a connection pool.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionPoolOptions {
    /// The maximum number of idle connections the pool caches. Connections checked in beyond
    /// this are closed.
    ///
    /// The default is 100.
    #[serde(serialize_with = "serde_util::serialize_u32_option_as_i32")]
    pub max_pool_size: Option<u32>,

    /// How long the pool waits for a new connection to be established. Unset or zero leaves
    /// dialing bounded only by the caller's context.
    #[serde(
        rename = "connectTimeoutMS",
        with = "serde_util::duration_option_as_millis",
        default
    )]
    pub connect_timeout: Option<Duration>,

    /// Receives every [`CmapEvent`] the pool emits.
    #[serde(skip)]
    pub event_handler: Option<EventHandler<CmapEvent>>,
}

impl ConnectionPoolOptions {
    pub(crate) fn max_pool_size(&self) -> usize {
        self.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE) as usize
    }
}
