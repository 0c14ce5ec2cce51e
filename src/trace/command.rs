use std::time::Instant;

use crate::{
    bson::Document,
    error::Error,
    options::ServerAddress,
    trace::{TracingRepresentation, COMMAND_TRACING_EVENT_TARGET},
};

/// Emits the started, succeeded and failed events for one command round trip.
pub(crate) struct CommandTracingEventEmitter<'a> {
    command_name: &'a str,
    connection_id: &'a str,
    address: &'a ServerAddress,
    request_id: i32,
    start_time: Instant,
}

impl<'a> CommandTracingEventEmitter<'a> {
    pub(crate) fn new(
        command_name: &'a str,
        connection_id: &'a str,
        address: &'a ServerAddress,
        request_id: i32,
    ) -> Self {
        Self {
            command_name,
            connection_id,
            address,
            request_id,
            start_time: Instant::now(),
        }
    }

    pub(crate) fn emit_started(&self, db: &str, command: &Document) {
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            command = command.tracing_representation(),
            databaseName = db,
            commandName = self.command_name,
            requestId = self.request_id,
            driverConnectionId = self.connection_id,
            serverHost = self.address.host(),
            serverPort = self.address.port(),
            "Command started"
        );
    }

    pub(crate) fn emit_succeeded(&self, reply: &Document) {
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            reply = reply.tracing_representation(),
            commandName = self.command_name,
            requestId = self.request_id,
            driverConnectionId = self.connection_id,
            serverHost = self.address.host(),
            serverPort = self.address.port(),
            durationMS = self.start_time.elapsed().as_millis(),
            "Command succeeded"
        );
    }

    pub(crate) fn emit_failed(&self, error: &Error) {
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            failure = error.tracing_representation(),
            commandName = self.command_name,
            requestId = self.request_id,
            driverConnectionId = self.connection_id,
            serverHost = self.address.host(),
            serverPort = self.address.port(),
            durationMS = self.start_time.elapsed().as_millis(),
            "Command failed"
        );
    }
}
