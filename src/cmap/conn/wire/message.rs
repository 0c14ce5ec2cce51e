use bitflags::bitflags;

use super::{
    header::{Header, OpCode},
    next_request_id,
    util::{read_cstring, write_document, SyncLittleEndianRead},
    MAX_MESSAGE_SIZE_BYTES,
};
use crate::{
    bson::{Bson, Document},
    error::{Error, Result},
};

/// Represents an OP_MSG wire protocol operation carrying a single body section.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// The identifier of this message.
    pub request_id: i32,
    /// The request this message answers, or 0 for requests.
    pub response_to: i32,
    /// The flag bits.
    pub flags: MessageFlags,
    /// The kind-0 body section. Any kind-1 document sequences of a decoded reply are folded into
    /// it as arrays named by their identifier.
    pub document: Document,
}

impl Message {
    /// Creates a request with a fresh request ID.
    pub fn new(document: Document, flags: MessageFlags) -> Self {
        Self {
            request_id: next_request_id(),
            response_to: 0,
            flags,
            document,
        }
    }

    /// Serializes the message, header included.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut sections = Vec::new();

        // Payload type 0
        sections.push(0);
        write_document(&mut sections, &self.document)?;

        let total_length = Header::LENGTH + std::mem::size_of::<u32>() + sections.len();
        let header = Header {
            length: super::checked_length(total_length)?,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        let mut buf = Vec::with_capacity(total_length);
        header.write_to(&mut buf);
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        buf.extend_from_slice(&sections);

        Ok(buf)
    }

    /// Deserializes a complete OP_MSG, header included.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = bytes;
        let header = Header::read_from(&mut reader)?;
        if header.op_code != OpCode::Message {
            return Err(Error::invalid_response(format!(
                "Invalid op code, expected {} and got {}",
                OpCode::Message as i32,
                header.op_code as i32
            )));
        }
        Self::read_body(reader, &header)
    }

    pub(super) fn read_body(mut reader: &[u8], header: &Header) -> Result<Self> {
        if header.length > MAX_MESSAGE_SIZE_BYTES {
            return Err(Error::invalid_response(format!(
                "Message length {} over maximum {}",
                header.length, MAX_MESSAGE_SIZE_BYTES
            )));
        }

        let flags = MessageFlags::from_bits_truncate(reader.read_u32_sync()?);
        if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            // The trailing CRC-32C is not verified.
            let end = reader.len().checked_sub(4).ok_or_else(|| {
                Error::invalid_response("OP_MSG too short to hold its checksum")
            })?;
            reader = &reader[..end];
        }

        let mut document: Option<Document> = None;
        let mut sequences = Vec::new();
        while !reader.is_empty() {
            match reader.read_u8_sync()? {
                0 => {
                    if document.is_some() {
                        return Err(Error::invalid_response(
                            "an OP_MSG response must contain exactly one payload type 0 section",
                        ));
                    }
                    document = Some(Document::from_reader(&mut reader)?);
                }
                1 => {
                    let size = usize::try_from(reader.read_i32_sync()?)
                        .map_err(|e| Error::invalid_response(e.to_string()))?;
                    let remaining = size.checked_sub(4).ok_or_else(|| {
                        Error::invalid_response("invalid OP_MSG document sequence size")
                    })?;
                    if remaining > reader.len() {
                        return Err(Error::invalid_response(
                            "OP_MSG document sequence overruns the message",
                        ));
                    }
                    let (mut section, rest) = reader.split_at(remaining);
                    reader = rest;

                    let identifier = read_cstring(&mut section)?;
                    let mut documents = Vec::new();
                    while !section.is_empty() {
                        documents.push(Bson::Document(Document::from_reader(&mut section)?));
                    }
                    sequences.push((identifier, documents));
                }
                other => {
                    return Err(Error::invalid_response(format!(
                        "invalid OP_MSG payload type: {other}"
                    )))
                }
            }
        }

        let mut document = document.ok_or_else(|| {
            Error::invalid_response(
                "an OP_MSG response must contain exactly one payload type 0 section",
            )
        })?;
        for (identifier, documents) in sequences {
            document.insert(identifier, documents);
        }

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            document,
        })
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MessageFlags: u32 {
        /// A CRC-32C checksum follows the sections.
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        /// The sender will not wait for a reply.
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        /// The client accepts multiple replies to this request.
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}
