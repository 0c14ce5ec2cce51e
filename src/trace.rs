use bson::Bson;

use crate::selection_criteria::SelectionCriteria;

pub(crate) mod command;
pub(crate) mod connection;
pub(crate) mod server_selection;

pub(crate) const COMMAND_TRACING_EVENT_TARGET: &str = "mongodb_core::command";
pub(crate) const CONNECTION_TRACING_EVENT_TARGET: &str = "mongodb_core::connection";
pub(crate) const SERVER_SELECTION_TRACING_EVENT_TARGET: &str = "mongodb_core::server_selection";

/// Commands and replies are cut to this many bytes of extended JSON.
pub(crate) const DEFAULT_MAX_DOCUMENT_LENGTH_BYTES: usize = 1000;

pub(crate) trait TracingRepresentation {
    type Representation;

    fn tracing_representation(&self) -> Self::Representation;
}

impl TracingRepresentation for bson::Document {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        let mut ext_json = Bson::Document(self.clone())
            .into_relaxed_extjson()
            .to_string();
        truncate_on_char_boundary(&mut ext_json, DEFAULT_MAX_DOCUMENT_LENGTH_BYTES);
        ext_json
    }
}

impl TracingRepresentation for crate::error::Error {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

impl TracingRepresentation for SelectionCriteria {
    type Representation = String;

    fn tracing_representation(&self) -> Self::Representation {
        self.to_string()
    }
}

/// Truncates `s` to at most `new_length` bytes, backing off to the nearest char boundary and
/// appending "..." if anything was removed.
pub(crate) fn truncate_on_char_boundary(s: &mut String, new_length: usize) {
    if s.len() <= new_length {
        return;
    }

    let mut boundary = new_length;
    while !s.is_char_boundary(boundary) {
        boundary -= 1;
    }
    s.truncate(boundary);
    s.push_str("...");
}
