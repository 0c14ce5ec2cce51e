use std::{future::Future, time::Duration};

use tokio::{net::TcpStream, task::JoinHandle};

use crate::{
    error::Result,
    options::{ServerAddress, DEFAULT_PORT},
};

/// Runs `fut` on the current tokio runtime. Dropping the handle detaches the task.
pub(crate) fn spawn<F, O>(fut: F) -> JoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    tokio::runtime::Handle::current().spawn(fut)
}

/// Fails with an I/O `TimedOut` error when `future` has not finished within `timeout`.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| std::io::ErrorKind::TimedOut.into())
}

/// Opens a TCP connection to `address` with `TCP_NODELAY` set. A zero `connect_timeout` means
/// no timeout.
pub(crate) async fn tcp_connect(
    address: &ServerAddress,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let target = (
        address.host.as_str(),
        address.port.unwrap_or(DEFAULT_PORT),
    );

    let stream = if connect_timeout.is_zero() {
        TcpStream::connect(target).await?
    } else {
        timeout(connect_timeout, TcpStream::connect(target)).await??
    };

    stream.set_nodelay(true)?;

    Ok(stream)
}
