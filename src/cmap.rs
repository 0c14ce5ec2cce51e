pub(crate) mod conn;
pub(crate) mod establish;
pub(crate) mod options;
mod status;

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::{Duration, Instant},
};

use derive_where::derive_where;

pub use self::conn::{Connection, PooledConnection};
use self::{
    conn::Transport,
    establish::Establisher,
    options::ConnectionPoolOptions,
    status::{OpenedCountPublisher, OpenedCountSubscriber},
};
use crate::{
    context::Context,
    error::{Error, ErrorKind, Result},
    event::{
        cmap::{
            CmapEvent,
            ConnectionCheckedInEvent,
            ConnectionCheckedOutEvent,
            ConnectionCheckoutFailedEvent,
            ConnectionCheckoutFailedReason,
            ConnectionCheckoutStartedEvent,
            ConnectionClosedEvent,
            ConnectionClosedReason,
            ConnectionCreatedEvent,
            PoolClearedEvent,
            PoolClosedEvent,
            PoolCreatedEvent,
            PoolReadyEvent,
        },
        EventHandler,
    },
    options::ServerAddress,
    runtime,
    sdam::ServerDescription,
    trace::connection::trace_cmap_event,
};

const DISCONNECTED: u8 = 0;
const CONNECTED: u8 = 1;
const DISCONNECTING: u8 = 2;

/// Distinguishes pools so that a connection can only be returned to the pool that made it.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A connection handed to [`ConnectionPool::put`] or [`ConnectionPool::close`] on a pool that
/// did not create it. The connection comes back untouched and is still checked out of the pool
/// it belongs to.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
#[non_exhaustive]
pub struct ForeignConnection {
    /// A [`ErrorKind::WrongPool`] error.
    pub error: Error,

    /// The rejected connection.
    pub connection: PooledConnection,
}

impl From<ForeignConnection> for Error {
    fn from(foreign: ForeignConnection) -> Self {
        foreign.error
    }
}

/// A pool of connections to a single server.
///
/// The pool starts disconnected. [`connect`](Self::connect) makes it usable and advances its
/// generation; [`drain`](Self::drain) advances the generation so that every connection created
/// before the call is closed instead of reused. Idle connections are cached up to
/// `max_pool_size` and handed out oldest first.
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive_where(Debug)]
pub(crate) struct PoolInner {
    id: u64,

    description: ServerDescription,

    #[derive_where(skip)]
    establisher: Arc<dyn Establisher>,

    max_pool_size: usize,

    /// Bounds each dial. Zero or unset leaves dialing bounded only by the context.
    connect_timeout: Option<Duration>,

    generation: AtomicU64,

    connectivity: AtomicU8,

    next_connection_id: AtomicU64,

    idle: Mutex<VecDeque<PooledConnection>>,

    /// Every connection created and not yet closed, whether idle or checked out.
    #[derive_where(skip)]
    opened: Mutex<HashMap<u64, Arc<Transport>>>,

    opened_publisher: OpenedCountPublisher,

    opened_subscriber: OpenedCountSubscriber,

    event_handler: Option<EventHandler<CmapEvent>>,
}

/// Locks `mutex`, recovering the data if a panicking thread poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionPool {
    /// Creates a disconnected pool of connections to the server described by `description`.
    pub fn new(
        description: ServerDescription,
        establisher: Arc<dyn Establisher>,
        options: Option<ConnectionPoolOptions>,
    ) -> Self {
        let (opened_publisher, opened_subscriber) = status::channel();
        let max_pool_size = options
            .as_ref()
            .map(ConnectionPoolOptions::max_pool_size)
            .unwrap_or_else(|| ConnectionPoolOptions::default().max_pool_size());

        let inner = PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::SeqCst),
            description,
            establisher,
            max_pool_size,
            connect_timeout: options.as_ref().and_then(|o| o.connect_timeout),
            generation: AtomicU64::new(0),
            connectivity: AtomicU8::new(DISCONNECTED),
            next_connection_id: AtomicU64::new(1),
            idle: Mutex::new(VecDeque::with_capacity(max_pool_size)),
            opened: Mutex::new(HashMap::new()),
            opened_publisher,
            opened_subscriber,
            event_handler: options.as_ref().and_then(|o| o.event_handler.clone()),
        };

        let pool = Self {
            inner: Arc::new(inner),
        };
        pool.emit(PoolCreatedEvent {
            address: pool.address().clone(),
            options,
        });
        pool
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }

    /// The address of the server this pool connects to.
    pub fn address(&self) -> &ServerAddress {
        &self.inner.description.address
    }

    /// The current generation. Connections from earlier generations are stale.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Whether the pool is connected and able to hand out connections.
    pub fn is_connected(&self) -> bool {
        self.inner.connectivity.load(Ordering::SeqCst) == CONNECTED
    }

    /// The number of connections created and not yet closed.
    pub fn opened_count(&self) -> usize {
        self.inner.opened_subscriber.opened()
    }

    /// The number of connections waiting in the idle cache.
    pub fn idle_count(&self) -> usize {
        lock(&self.inner.idle).len()
    }

    /// Makes the pool usable and starts a new generation. Fails with
    /// [`ErrorKind::PoolConnected`] unless the pool is disconnected.
    pub fn connect(&self) -> Result<()> {
        self.inner
            .connectivity
            .compare_exchange(DISCONNECTED, CONNECTED, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::from(ErrorKind::PoolConnected))?;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        self.emit(PoolReadyEvent {
            address: self.address().clone(),
        });
        Ok(())
    }

    /// Shuts the pool down. Idle connections are closed immediately. When a `deadline` is given,
    /// waits until every checked-out connection has been returned or the deadline passes; any
    /// connection still open afterwards is closed underneath its holder.
    ///
    /// Fails with [`ErrorKind::PoolDisconnected`] unless the pool is connected.
    pub async fn disconnect(&self, deadline: Option<tokio::time::Instant>) -> Result<()> {
        self.inner
            .connectivity
            .compare_exchange(CONNECTED, DISCONNECTING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::from(ErrorKind::PoolDisconnected))?;

        let idle: Vec<_> = lock(&self.inner.idle).drain(..).collect();
        for conn in idle {
            self.close_with_reason(conn, ConnectionClosedReason::PoolClosed);
        }

        if let Some(deadline) = deadline {
            let mut subscriber = self.inner.opened_publisher.subscribe();
            let _ = tokio::time::timeout_at(deadline, subscriber.wait_for_empty()).await;
        }

        let remaining: Vec<_> = {
            let mut opened = lock(&self.inner.opened);
            let remaining = opened.drain().collect();
            self.inner.opened_publisher.publish(0);
            remaining
        };
        for (connection_id, transport) in remaining {
            transport.close();
            self.emit(ConnectionClosedEvent {
                address: self.address().clone(),
                connection_id,
                reason: ConnectionClosedReason::PoolClosed,
            });
        }

        self.inner
            .connectivity
            .store(DISCONNECTED, Ordering::SeqCst);
        self.emit(PoolClosedEvent {
            address: self.address().clone(),
        });
        Ok(())
    }

    /// Checks out a connection, reusing an idle one of the current generation when possible and
    /// dialing a new one otherwise. Dialing is abandoned with the context's error if `ctx` fires.
    pub async fn get(&self, ctx: &Context) -> Result<PooledConnection> {
        let start_time = Instant::now();
        self.emit(ConnectionCheckoutStartedEvent {
            address: self.address().clone(),
        });

        let result = self.check_out(ctx).await;
        match result {
            Ok(ref conn) => self.emit(ConnectionCheckedOutEvent {
                address: self.address().clone(),
                connection_id: conn.id,
                duration: start_time.elapsed(),
            }),
            Err(ref error) => {
                let reason = if error.is_context_error() {
                    ConnectionCheckoutFailedReason::Timeout
                } else if matches!(*error.kind, ErrorKind::PoolDisconnected) {
                    ConnectionCheckoutFailedReason::PoolClosed
                } else {
                    ConnectionCheckoutFailedReason::ConnectionError
                };
                self.emit(ConnectionCheckoutFailedEvent {
                    address: self.address().clone(),
                    reason,
                    error: Some(error.clone()),
                    duration: start_time.elapsed(),
                });
            }
        }
        result
    }

    async fn check_out(&self, ctx: &Context) -> Result<PooledConnection> {
        if !self.is_connected() {
            return Err(ErrorKind::PoolDisconnected.into());
        }
        if let Some(error) = ctx.err() {
            return Err(error.into());
        }

        // Each pass removes one connection from the cache, so this cannot outlast it.
        for _ in 0..=self.inner.max_pool_size {
            let Some(mut conn) = lock(&self.inner.idle).pop_front() else {
                break;
            };

            if conn.generation != self.generation() {
                self.close_with_reason(conn, ConnectionClosedReason::Stale);
                continue;
            }
            if conn.is_closed() {
                self.close_with_reason(conn, ConnectionClosedReason::Error);
                continue;
            }

            conn.pool = Some(Arc::downgrade(&self.inner));
            return Ok(conn);
        }

        let address = self.address();
        let dial = self.inner.establisher.establish(address);
        let stream = match self.inner.connect_timeout {
            Some(timeout) if !timeout.is_zero() => {
                ctx.run(runtime::timeout(timeout, dial)).await??
            }
            _ => ctx.run(dial).await?,
        }?;

        let id = self
            .inner
            .next_connection_id
            .fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(Transport::new(stream));
        let mut conn = PooledConnection::new(
            id,
            self.generation(),
            self.inner.id,
            self.inner.description.clone(),
            transport.clone(),
        );

        {
            let mut opened = lock(&self.inner.opened);
            opened.insert(id, transport);
            self.inner.opened_publisher.publish(opened.len());
        }
        self.emit(ConnectionCreatedEvent {
            address: address.clone(),
            connection_id: id,
        });

        // The pool may have started disconnecting while the dial was in flight.
        if !self.is_connected() {
            self.close_with_reason(conn, ConnectionClosedReason::PoolClosed);
            return Err(ErrorKind::PoolDisconnected.into());
        }

        conn.pool = Some(Arc::downgrade(&self.inner));
        Ok(conn)
    }

    /// Returns a connection to the pool. It is cached for reuse unless the pool is not
    /// connected, the connection is stale or closed, or the cache is full, in which case it is
    /// closed. A connection another pool created is handed back in the error.
    pub fn put(&self, conn: PooledConnection) -> std::result::Result<(), ForeignConnection> {
        let mut conn = self.check_ownership(conn)?;
        conn.pool = None;

        self.emit(ConnectionCheckedInEvent {
            address: self.address().clone(),
            connection_id: conn.id,
        });

        let close_reason = if !self.is_connected() {
            Some(ConnectionClosedReason::PoolClosed)
        } else if conn.generation != self.generation() {
            Some(ConnectionClosedReason::Stale)
        } else if conn.is_closed() {
            Some(ConnectionClosedReason::Error)
        } else {
            None
        };
        if let Some(reason) = close_reason {
            self.close_with_reason(conn, reason);
            return Ok(());
        }

        let mut idle = lock(&self.inner.idle);
        if idle.len() >= self.inner.max_pool_size {
            drop(idle);
            self.close_with_reason(conn, ConnectionClosedReason::Idle);
            return Ok(());
        }
        idle.push_back(conn);
        Ok(())
    }

    /// Starts a new generation, invalidating every existing connection without closing any.
    pub fn drain(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit(PoolClearedEvent {
            address: self.address().clone(),
            generation,
        });
    }

    /// Closes a connection and forgets it. Closing a connection twice succeeds. A connection
    /// another pool created is handed back in the error.
    pub fn close(&self, conn: PooledConnection) -> std::result::Result<(), ForeignConnection> {
        let conn = self.check_ownership(conn)?;
        self.close_with_reason(conn, ConnectionClosedReason::Error);
        Ok(())
    }

    /// Closes a connection this pool created.
    pub(crate) fn close_with_reason(
        &self,
        mut conn: PooledConnection,
        reason: ConnectionClosedReason,
    ) {
        conn.pool = None;

        let removed = {
            let mut opened = lock(&self.inner.opened);
            let removed = opened.remove(&conn.id).is_some();
            self.inner.opened_publisher.publish(opened.len());
            removed
        };
        conn.transport.close();

        if removed {
            self.emit(ConnectionClosedEvent {
                address: self.address().clone(),
                connection_id: conn.id,
                reason,
            });
        }
    }

    fn check_ownership(
        &self,
        conn: PooledConnection,
    ) -> std::result::Result<PooledConnection, ForeignConnection> {
        if conn.pool_id != self.inner.id {
            return Err(ForeignConnection {
                error: ErrorKind::WrongPool.into(),
                connection: conn,
            });
        }
        Ok(conn)
    }

    fn emit(&self, event: impl Into<CmapEvent>) {
        let event = event.into();
        trace_cmap_event(&event);
        if let Some(ref handler) = self.inner.event_handler {
            handler.handle(event);
        }
    }
}
