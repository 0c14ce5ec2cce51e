pub mod wire;

use std::sync::{Arc, Weak};

use derive_where::derive_where;
use futures_core::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::{establish::AsyncStream, ConnectionPool, PoolInner};
use crate::{
    context::Context,
    error::{Error, ErrorKind, Result},
    event::cmap::ConnectionClosedReason,
    options::ServerAddress,
    sdam::ServerDescription,
};

/// A single-owner channel to a server that exchanges length-prefixed wire messages.
pub trait Connection: Send {
    /// Writes one complete message. Fails with the context's error if `ctx` fires first.
    fn write_message<'a>(&'a mut self, ctx: &'a Context, message: &'a [u8])
        -> BoxFuture<'a, Result<()>>;

    /// Reads one complete message, length prefix included. Fails with the context's error if
    /// `ctx` fires first.
    fn read_message<'a>(&'a mut self, ctx: &'a Context) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// The description of the server this connection is to.
    fn description(&self) -> &ServerDescription;

    /// Releases the connection. Pooled connections are returned to their pool, which closes
    /// them instead if they are unusable.
    fn close(self: Box<Self>) -> Result<()>;

    /// A human-readable identifier, unique within the process.
    fn id(&self) -> &str;

    /// The address of the server this connection is to.
    fn address(&self) -> &ServerAddress;
}

/// The byte stream shared between a connection and its pool's opened-set, so that the pool can
/// close a connection that is checked out.
pub(super) struct Transport {
    stream: tokio::sync::Mutex<Option<Box<dyn AsyncStream>>>,
    closed: CancellationToken,
}

impl Transport {
    pub(super) fn new(stream: Box<dyn AsyncStream>) -> Self {
        Self {
            stream: tokio::sync::Mutex::new(Some(stream)),
            closed: CancellationToken::new(),
        }
    }

    pub(super) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Marks the transport closed. In-flight I/O is interrupted and drops the stream on its way
    /// out; otherwise the stream is dropped here.
    pub(super) fn close(&self) {
        self.closed.cancel();
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.take();
        }
    }

    async fn write(&self, ctx: &Context, message: &[u8]) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let result = match guard.as_mut() {
            Some(stream) if !self.is_closed() => {
                tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => Err(ErrorKind::ConnectionClosed.into()),
                    result = ctx.run(async {
                        stream.write_all(message).await?;
                        stream.flush().await?;
                        Ok::<_, Error>(())
                    }) => result.and_then(|written| written),
                }
            }
            _ => Err(ErrorKind::ConnectionClosed.into()),
        };

        // A partially written message leaves the stream unusable.
        if result.is_err() {
            guard.take();
            self.closed.cancel();
        }
        result
    }

    async fn read(&self, ctx: &Context) -> Result<Vec<u8>> {
        let mut guard = self.stream.lock().await;
        let result = match guard.as_mut() {
            Some(stream) if !self.is_closed() => {
                tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => Err(ErrorKind::ConnectionClosed.into()),
                    result = ctx.run(read_framed(stream)) => result.and_then(|read| read),
                }
            }
            _ => Err(ErrorKind::ConnectionClosed.into()),
        };

        if result.is_err() {
            guard.take();
            self.closed.cancel();
        }
        result
    }
}

/// Reads one message framed by its little-endian length prefix.
async fn read_framed(stream: &mut Box<dyn AsyncStream>) -> Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;

    let length = i32::from_le_bytes(prefix);
    if length > wire::MAX_MESSAGE_SIZE_BYTES {
        return Err(Error::invalid_response(format!(
            "Message length {} over maximum {}",
            length,
            wire::MAX_MESSAGE_SIZE_BYTES
        )));
    }
    let length = usize::try_from(length)
        .ok()
        .filter(|length| *length >= wire::Header::LENGTH)
        .ok_or_else(|| Error::invalid_response(format!("invalid message length {length}")))?;

    let mut message = vec![0u8; length];
    message[..4].copy_from_slice(&prefix);
    stream.read_exact(&mut message[4..]).await?;

    Ok(message)
}

/// A connection owned by a [`ConnectionPool`].
///
/// Calling [`Connection::close`] returns it to the pool it came from. Dropping a connection
/// that is checked out closes it instead.
#[derive_where(Debug)]
pub struct PooledConnection {
    pub(super) id: u64,

    string_id: String,

    /// The pool generation the connection was created in.
    pub(super) generation: u64,

    pub(super) pool_id: u64,

    description: ServerDescription,

    #[derive_where(skip)]
    pub(super) transport: Arc<Transport>,

    /// Set while the connection is checked out.
    #[derive_where(skip)]
    pub(super) pool: Option<Weak<PoolInner>>,
}

impl PooledConnection {
    pub(super) fn new(
        id: u64,
        generation: u64,
        pool_id: u64,
        description: ServerDescription,
        transport: Arc<Transport>,
    ) -> Self {
        Self {
            id,
            string_id: format!("{}[{}]", description.address, id),
            generation,
            pool_id,
            description,
            transport,
            pool: None,
        }
    }

    /// The generation of the pool this connection was created in.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the connection has been closed, either explicitly or after an interrupted I/O.
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Helper to create a `PooledConnection` sharing this one's transport, used to check a
    /// connection back in or close it when it is dropped.
    fn take(&mut self) -> PooledConnection {
        PooledConnection {
            id: self.id,
            string_id: std::mem::take(&mut self.string_id),
            generation: self.generation,
            pool_id: self.pool_id,
            description: self.description.clone(),
            transport: self.transport.clone(),
            pool: None,
        }
    }
}

impl Connection for PooledConnection {
    fn write_message<'a>(
        &'a mut self,
        ctx: &'a Context,
        message: &'a [u8],
    ) -> BoxFuture<'a, Result<()>> {
        self.transport.write(ctx, message).boxed()
    }

    fn read_message<'a>(&'a mut self, ctx: &'a Context) -> BoxFuture<'a, Result<Vec<u8>>> {
        self.transport.read(ctx).boxed()
    }

    fn description(&self) -> &ServerDescription {
        &self.description
    }

    fn close(self: Box<Self>) -> Result<()> {
        let mut conn = *self;
        match conn.pool.take().and_then(|pool| pool.upgrade()) {
            Some(inner) => Ok(ConnectionPool::from_inner(inner).put(conn)?),
            None => {
                conn.transport.close();
                Ok(())
            }
        }
    }

    fn id(&self) -> &str {
        &self.string_id
    }

    fn address(&self) -> &ServerAddress {
        &self.description.address
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // A connection with a pool reference is being dropped while checked out. Connections
        // without one were already released through `put` or `close`.
        if let Some(pool) = self.pool.take() {
            let dropped_connection = self.take();
            match pool.upgrade() {
                Some(inner) => {
                    ConnectionPool::from_inner(inner)
                        .close_with_reason(dropped_connection, ConnectionClosedReason::Error);
                }
                None => dropped_connection.transport.close(),
            }
        }
    }
}
