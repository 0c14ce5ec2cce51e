use std::time::Duration;

use futures_core::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{error::Result, options::ServerAddress, runtime};

/// The default amount of time to wait for a TCP connection to be established.
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A bidirectional byte stream to a server.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> AsyncStream for T {}

/// Dials new byte streams for a [`ConnectionPool`](crate::ConnectionPool).
pub trait Establisher: Send + Sync {
    /// Opens a stream to `address`.
    fn establish<'a>(
        &'a self,
        address: &'a ServerAddress,
    ) -> BoxFuture<'a, Result<Box<dyn AsyncStream>>>;
}

/// Establishes plain TCP streams with `TCP_NODELAY` set.
#[derive(Clone, Debug)]
pub struct TcpEstablisher {
    connect_timeout: Duration,
}

impl TcpEstablisher {
    /// Creates an establisher that gives up on a dial after `connect_timeout`, or after 10
    /// seconds if none is given. A zero timeout waits indefinitely.
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self {
            connect_timeout: connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        }
    }
}

impl Default for TcpEstablisher {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Establisher for TcpEstablisher {
    fn establish<'a>(
        &'a self,
        address: &'a ServerAddress,
    ) -> BoxFuture<'a, Result<Box<dyn AsyncStream>>> {
        async move {
            let stream = runtime::tcp_connect(address, self.connect_timeout).await?;
            Ok(Box::new(stream) as Box<dyn AsyncStream>)
        }
        .boxed()
    }
}
