use super::util::SyncLittleEndianRead;
use crate::error::{Error, Result};

/// The wire protocol op codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum OpCode {
    /// OP_REPLY, the response to an OP_QUERY.
    Reply = 1,
    /// OP_QUERY, used for commands against servers that predate OP_MSG.
    Query = 2004,
    /// OP_MSG.
    Message = 2013,
}

impl OpCode {
    /// Attempt to infer the op code based on the numeric value.
    fn from_i32(i: i32) -> Result<Self> {
        match i {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2013 => Ok(OpCode::Message),
            other => Err(Error::invalid_response(format!(
                "Invalid wire protocol opcode: {other}"
            ))),
        }
    }
}

/// The header for any wire protocol message.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Header {
    /// The total length of the message, header included.
    pub length: i32,
    /// The identifier of this message.
    pub request_id: i32,
    /// The request this message answers, or 0 for requests.
    pub response_to: i32,
    /// The kind of message that follows the header.
    pub op_code: OpCode,
}

impl Header {
    /// The encoded size of a header.
    pub const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    /// Serializes the header and appends the bytes to `buf`.
    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&(self.op_code as i32).to_le_bytes());
    }

    /// Reads a header from the front of `reader`, advancing it past the header.
    pub(crate) fn read_from(reader: &mut &[u8]) -> Result<Self> {
        let length = reader.read_i32_sync()?;
        let request_id = reader.read_i32_sync()?;
        let response_to = reader.read_i32_sync()?;
        let op_code = OpCode::from_i32(reader.read_i32_sync()?)?;
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }
}
