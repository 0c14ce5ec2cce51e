use std::time::Instant;

use crate::{
    error::Result,
    sdam::{SelectedServer, TopologyType},
    selection_criteria::SelectionCriteria,
    trace::{TracingRepresentation, SERVER_SELECTION_TRACING_EVENT_TARGET},
};

/// Traces one selection attempt: a started event on creation and an outcome event when
/// [`finish`](Self::finish) is called.
pub(crate) struct SelectionTrace<'a> {
    criteria: &'a SelectionCriteria,
    topology_type: TopologyType,
    started: Instant,
}

impl<'a> SelectionTrace<'a> {
    pub(crate) fn start(
        criteria: &'a SelectionCriteria,
        topology_type: TopologyType,
        candidates: usize,
    ) -> Self {
        tracing::debug!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            selector = criteria.tracing_representation(),
            topologyType = %topology_type,
            candidates,
            "Server selection started"
        );
        Self {
            criteria,
            topology_type,
            started: Instant::now(),
        }
    }

    pub(crate) fn finish(self, outcome: &Result<SelectedServer>) {
        let selector = self.criteria.tracing_representation();
        let duration_ms = self.started.elapsed().as_millis();
        match outcome {
            Ok(server) => {
                let address = &server.description().address;
                tracing::debug!(
                    target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                    selector,
                    topologyType = %self.topology_type,
                    serverHost = address.host(),
                    serverPort = address.port(),
                    durationMS = duration_ms,
                    "Server selection succeeded"
                );
            }
            Err(error) => tracing::debug!(
                target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                selector,
                topologyType = %self.topology_type,
                failure = error.tracing_representation(),
                durationMS = duration_ms,
                "Server selection failed"
            ),
        }
    }
}
