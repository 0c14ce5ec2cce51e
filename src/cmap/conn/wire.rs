//! Encoding and decoding of the wire protocol messages exchanged with a server.

mod header;
mod message;
mod query;
#[cfg(test)]
mod test;
mod util;

pub use self::{
    header::{Header, OpCode},
    message::{Message, MessageFlags},
    query::{Query, QueryFlags, Reply, ReplyFlags},
    util::next_request_id,
};
use crate::{
    bson::Document,
    error::{Error, Result},
};

/// The largest message a server will send or accept.
pub const MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

fn checked_length(length: usize) -> Result<i32> {
    i32::try_from(length)
        .ok()
        .filter(|length| *length <= MAX_MESSAGE_SIZE_BYTES)
        .ok_or_else(|| {
            Error::invalid_argument(format!(
                "message length {length} over maximum {MAX_MESSAGE_SIZE_BYTES}"
            ))
        })
}

/// Decodes a complete reply, either an OP_MSG or an OP_REPLY, into its header and command
/// reply document.
pub fn decode_reply(bytes: &[u8]) -> Result<(Header, Document)> {
    let mut reader = bytes;
    let header = Header::read_from(&mut reader)?;
    if usize::try_from(header.length).ok() != Some(bytes.len()) {
        return Err(Error::invalid_response(format!(
            "The server indicated that the reply would be {} bytes long, but it instead was {}",
            header.length,
            bytes.len(),
        )));
    }

    let document = match header.op_code {
        OpCode::Message => Message::read_body(reader, &header)?.document,
        OpCode::Reply => Reply::read_body(reader, &header)?.into_command_reply()?,
        OpCode::Query => {
            return Err(Error::invalid_response(
                "expected a reply but the server sent an OP_QUERY",
            ))
        }
    };

    Ok((header, document))
}
