use bitflags::bitflags;

use super::{
    header::{Header, OpCode},
    next_request_id,
    util::{read_cstring, write_cstring, write_document, SyncLittleEndianRead},
};
use crate::{
    bson::Document,
    error::{CommandError, Error, ErrorKind, Result},
};

/// An OP_QUERY against the `$cmd` collection of a database, the command form understood by
/// servers that predate OP_MSG.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    /// The identifier of this message.
    pub request_id: i32,
    /// The flag bits.
    pub flags: QueryFlags,
    /// The `<db>.$cmd` namespace.
    pub full_collection_name: String,
    /// Documents to skip.
    pub number_to_skip: i32,
    /// Documents to return; commands use -1.
    pub number_to_return: i32,
    /// The command, possibly wrapped as `{$query: ..., $readPreference: ...}`.
    pub query: Document,
}

impl Query {
    /// Creates a command query against `db` with a fresh request ID.
    pub fn command(db: &str, query: Document, flags: QueryFlags) -> Self {
        Self {
            request_id: next_request_id(),
            flags,
            full_collection_name: format!("{db}.$cmd"),
            number_to_skip: 0,
            number_to_return: -1,
            query,
        }
    }

    /// Serializes the query, header included.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.flags.bits().to_le_bytes());
        write_cstring(&mut body, &self.full_collection_name);
        body.extend_from_slice(&self.number_to_skip.to_le_bytes());
        body.extend_from_slice(&self.number_to_return.to_le_bytes());
        write_document(&mut body, &self.query)?;

        let header = Header {
            length: super::checked_length(Header::LENGTH + body.len())?,
            request_id: self.request_id,
            response_to: 0,
            op_code: OpCode::Query,
        };

        let mut buf = Vec::with_capacity(Header::LENGTH + body.len());
        header.write_to(&mut buf);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Deserializes a complete OP_QUERY, header included.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = bytes;
        let header = Header::read_from(&mut reader)?;
        if header.op_code != OpCode::Query {
            return Err(Error::invalid_response(format!(
                "Invalid op code, expected {} and got {}",
                OpCode::Query as i32,
                header.op_code as i32
            )));
        }

        let flags = QueryFlags::from_bits_truncate(reader.read_u32_sync()?);
        let full_collection_name = read_cstring(&mut reader)?;
        let number_to_skip = reader.read_i32_sync()?;
        let number_to_return = reader.read_i32_sync()?;
        let query = Document::from_reader(&mut reader)?;

        Ok(Self {
            request_id: header.request_id,
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
        })
    }
}

bitflags! {
    /// The bitwise flags for an OP_QUERY.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QueryFlags: u32 {
        /// The cursor is not closed when the last data is retrieved.
        const TAILABLE_CURSOR   = 0b_0000_0010;
        /// The query may run on a secondary.
        const SECONDARY_OK      = 0b_0000_0100;
        /// The server does not time out idle cursors.
        const NO_CURSOR_TIMEOUT = 0b_0001_0000;
        /// Block for a while at the end of a tailable cursor.
        const AWAIT_DATA        = 0b_0010_0000;
        /// Stream all data in multiple replies.
        const EXHAUST           = 0b_0100_0000;
        /// Return partial results if some shards are down.
        const PARTIAL           = 0b_1000_0000;
    }
}

/// An OP_REPLY, the server's answer to an OP_QUERY.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    /// The identifier of this message.
    pub request_id: i32,
    /// The request this message answers.
    pub response_to: i32,
    /// The flag bits.
    pub flags: ReplyFlags,
    /// The cursor this reply is part of, 0 for commands.
    pub cursor_id: i64,
    /// Where in the cursor this reply starts.
    pub starting_from: i32,
    /// The returned documents; a command reply carries exactly one.
    pub documents: Vec<Document>,
}

impl Reply {
    /// Creates a single-document reply to the request `response_to`.
    pub fn new(response_to: i32, document: Document) -> Self {
        Self {
            request_id: next_request_id(),
            response_to,
            flags: ReplyFlags::empty(),
            cursor_id: 0,
            starting_from: 0,
            documents: vec![document],
        }
    }

    /// Serializes the reply, header included.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.flags.bits().to_le_bytes());
        body.extend_from_slice(&self.cursor_id.to_le_bytes());
        body.extend_from_slice(&self.starting_from.to_le_bytes());
        let number_returned = i32::try_from(self.documents.len())
            .map_err(|e| Error::invalid_argument(e.to_string()))?;
        body.extend_from_slice(&number_returned.to_le_bytes());
        for document in &self.documents {
            write_document(&mut body, document)?;
        }

        let header = Header {
            length: super::checked_length(Header::LENGTH + body.len())?,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: OpCode::Reply,
        };

        let mut buf = Vec::with_capacity(Header::LENGTH + body.len());
        header.write_to(&mut buf);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub(super) fn read_body(mut reader: &[u8], header: &Header) -> Result<Self> {
        let flags = ReplyFlags::from_bits_truncate(reader.read_u32_sync()?);
        let cursor_id = reader.read_i64_sync()?;
        let starting_from = reader.read_i32_sync()?;
        let number_returned = reader.read_i32_sync()?;

        let mut documents = Vec::new();
        for _ in 0..number_returned.max(0) {
            documents.push(Document::from_reader(&mut reader)?);
        }

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            cursor_id,
            starting_from,
            documents,
        })
    }

    /// The command reply carried by this message. A `QueryFailure` reply becomes a command error
    /// built from its `$err` document.
    pub(crate) fn into_command_reply(self) -> Result<Document> {
        let document = self
            .documents
            .into_iter()
            .next()
            .ok_or_else(|| Error::invalid_response("OP_REPLY contained no documents"))?;

        if self.flags.contains(ReplyFlags::QUERY_FAILURE) {
            return Err(ErrorKind::Command(CommandError {
                code: document.get_i32("code").unwrap_or(0),
                code_name: String::new(),
                message: document.get_str("$err").unwrap_or_default().to_string(),
            })
            .into());
        }

        Ok(document)
    }
}

bitflags! {
    /// The bitwise flags for an OP_REPLY.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ReplyFlags: u32 {
        /// The requested cursor does not exist.
        const CURSOR_NOT_FOUND   = 0b_0001;
        /// The query failed; the single document holds `$err`.
        const QUERY_FAILURE      = 0b_0010;
        /// The shard configuration is stale.
        const SHARD_CONFIG_STALE = 0b_0100;
        /// The server supports `AwaitData`.
        const AWAIT_CAPABLE      = 0b_1000;
    }
}
