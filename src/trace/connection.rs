use crate::{
    event::cmap::CmapEvent,
    trace::{TracingRepresentation, CONNECTION_TRACING_EVENT_TARGET},
};

/// Every pool event names the server it belongs to.
macro_rules! pool_debug {
    ($address:expr, $message:literal $(, $field:ident = $value:expr)* $(,)?) => {
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            serverHost = $address.host(),
            serverPort = $address.port(),
            $($field = $value,)*
            $message,
        )
    };
}

/// Emits `event` as a `tracing` debug event under the connection target.
pub(crate) fn trace_cmap_event(event: &CmapEvent) {
    match event {
        CmapEvent::PoolCreated(e) => {
            let options = e.options.as_ref();
            pool_debug!(
                e.address,
                "Connection pool created",
                maxPoolSize = options.and_then(|o| o.max_pool_size),
                connectTimeoutMS = options
                    .and_then(|o| o.connect_timeout)
                    .map(|timeout| timeout.as_millis()),
            );
        }
        CmapEvent::PoolReady(e) => pool_debug!(e.address, "Connection pool ready"),
        CmapEvent::PoolCleared(e) => {
            pool_debug!(e.address, "Connection pool cleared", generation = e.generation)
        }
        CmapEvent::PoolClosed(e) => pool_debug!(e.address, "Connection pool closed"),
        CmapEvent::ConnectionCreated(e) => pool_debug!(
            e.address,
            "Connection created",
            driverConnectionId = e.connection_id,
        ),
        CmapEvent::ConnectionClosed(e) => pool_debug!(
            e.address,
            "Connection closed",
            driverConnectionId = e.connection_id,
            reason = e.reason.as_str(),
        ),
        CmapEvent::ConnectionCheckoutStarted(e) => {
            pool_debug!(e.address, "Connection checkout started")
        }
        CmapEvent::ConnectionCheckoutFailed(e) => pool_debug!(
            e.address,
            "Connection checkout failed",
            reason = e.reason.as_str(),
            error = e.error.as_ref().map(|error| error.tracing_representation()),
            durationMS = e.duration.as_millis(),
        ),
        CmapEvent::ConnectionCheckedOut(e) => pool_debug!(
            e.address,
            "Connection checked out",
            driverConnectionId = e.connection_id,
            durationMS = e.duration.as_millis(),
        ),
        CmapEvent::ConnectionCheckedIn(e) => pool_debug!(
            e.address,
            "Connection checked in",
            driverConnectionId = e.connection_id,
        ),
    }
}
