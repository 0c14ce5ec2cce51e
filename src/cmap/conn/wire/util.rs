use std::{
    io::Read,
    sync::atomic::{AtomicI32, Ordering},
};

use crate::error::{Error, Result};

static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// The next request id. Ids are unique within the process until the counter wraps.
pub fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Little-endian reads over a synchronous reader, used to pick apart buffered messages.
pub(super) trait SyncLittleEndianRead: Read {
    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_i32_sync(&mut self) -> Result<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    fn read_u32_sync(&mut self) -> Result<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    fn read_i64_sync(&mut self) -> Result<i64> {
        self.read_array().map(i64::from_le_bytes)
    }

    fn read_u8_sync(&mut self) -> Result<u8> {
        self.read_array().map(|[byte]| byte)
    }
}

impl<R: Read + ?Sized> SyncLittleEndianRead for R {}

/// Reads a null-terminated UTF-8 string.
pub(super) fn read_cstring<R: Read + ?Sized>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = reader.read_u8_sync()?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes).map_err(|e| Error::invalid_response(e.to_string()))
}

/// Appends `string` and its null terminator to `buf`.
pub(super) fn write_cstring(buf: &mut Vec<u8>, string: &str) {
    buf.extend_from_slice(string.as_bytes());
    buf.push(0);
}

/// Appends the encoded bytes of `document` to `buf`.
pub(super) fn write_document(buf: &mut Vec<u8>, document: &bson::Document) -> Result<()> {
    document.to_writer(buf)?;
    Ok(())
}
