use std::sync::Arc;

use derive_where::derive_where;
use futures_core::future::BoxFuture;
use futures_util::{future::join_all, FutureExt};
use rand::seq::IteratorRandom;

use super::{
    description::{ServerDescription, TopologyType},
    server_selection::suitable_servers,
};
use crate::{
    cmap::{establish::Establisher, options::ConnectionPoolOptions, Connection, ConnectionPool},
    context::Context,
    error::{Error, Result},
    selection_criteria::SelectionCriteria,
    trace::server_selection::SelectionTrace,
};

/// The view of a deployment the operation engine needs: server selection plus the capabilities
/// that decide whether sessions and retries are used.
pub trait Deployment: Send + Sync {
    /// Chooses a server suitable for `criteria`. Fails with the context's error if `ctx` fires
    /// first.
    fn select_server<'a>(
        &'a self,
        ctx: &'a Context,
        criteria: &'a SelectionCriteria,
    ) -> BoxFuture<'a, Result<SelectedServer>>;

    /// Whether the deployment supports retryable reads and writes.
    fn supports_retry(&self) -> bool;

    /// Whether the deployment supports logical sessions.
    fn supports_sessions(&self) -> bool {
        false
    }

    /// The kind of deployment.
    fn kind(&self) -> TopologyType;
}

/// A server that hands out connections.
pub trait Server: Send + Sync {
    /// Acquires a connection to this server. Fails with the context's error if `ctx` fires
    /// first.
    fn connection<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Box<dyn Connection>>>;

    /// The latest description of this server.
    fn description(&self) -> ServerDescription;
}

/// The outcome of server selection: the chosen server together with the type of the topology
/// it was chosen from.
#[derive(Clone)]
#[derive_where(Debug)]
pub struct SelectedServer {
    #[derive_where(skip)]
    server: Arc<dyn Server>,

    description: ServerDescription,

    topology_type: TopologyType,
}

impl SelectedServer {
    /// Wraps `server`, snapshotting its description.
    pub fn new(server: Arc<dyn Server>, topology_type: TopologyType) -> Self {
        let description = server.description();
        Self {
            server,
            description,
            topology_type,
        }
    }

    /// The description of the server at the time it was selected.
    pub fn description(&self) -> &ServerDescription {
        &self.description
    }

    /// The type of the topology the server was selected from.
    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    /// Acquires a connection to the selected server.
    pub async fn connection(&self, ctx: &Context) -> Result<Box<dyn Connection>> {
        self.server.connection(ctx).await
    }
}

/// A server in a static [`Topology`] together with its connection pool.
#[derive(Debug)]
pub struct TopologyServer {
    description: ServerDescription,
    pool: ConnectionPool,
}

impl TopologyServer {
    /// The pool of connections to this server.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

impl Server for TopologyServer {
    fn connection<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Box<dyn Connection>>> {
        async move {
            let conn = self.pool.get(ctx).await?;
            Ok(Box::new(conn) as Box<dyn Connection>)
        }
        .boxed()
    }

    fn description(&self) -> ServerDescription {
        self.description.clone()
    }
}

/// A [`Deployment`] over a fixed set of servers. No discovery or monitoring takes place: the
/// descriptions given at construction are used for the topology's whole lifetime.
#[derive(Clone, Debug)]
pub struct Topology {
    inner: Arc<TopologyInner>,
}

#[derive(Debug)]
struct TopologyInner {
    topology_type: TopologyType,
    servers: Vec<Arc<TopologyServer>>,
}

impl Topology {
    /// Creates a topology of the given type over `servers`, with one connection pool per
    /// server. The pools start disconnected; see [`Topology::connect`].
    pub fn new(
        topology_type: TopologyType,
        servers: impl IntoIterator<Item = ServerDescription>,
        establisher: Arc<dyn Establisher>,
        pool_options: Option<ConnectionPoolOptions>,
    ) -> Self {
        let servers = servers
            .into_iter()
            .map(|description| {
                let pool = ConnectionPool::new(
                    description.clone(),
                    establisher.clone(),
                    pool_options.clone(),
                );
                Arc::new(TopologyServer { description, pool })
            })
            .collect();

        Self {
            inner: Arc::new(TopologyInner {
                topology_type,
                servers,
            }),
        }
    }

    /// The servers in this topology.
    pub fn servers(&self) -> impl Iterator<Item = &Arc<TopologyServer>> {
        self.inner.servers.iter()
    }

    /// Connects every server's pool.
    pub fn connect(&self) -> Result<()> {
        for server in &self.inner.servers {
            server.pool.connect()?;
        }
        Ok(())
    }

    /// Disconnects every server's pool concurrently, all sharing `deadline`. Returns the first
    /// failure, if any.
    pub async fn disconnect(&self, deadline: Option<tokio::time::Instant>) -> Result<()> {
        join_all(
            self.inner
                .servers
                .iter()
                .map(|server| server.pool.disconnect(deadline)),
        )
        .await
        .into_iter()
        .collect()
    }

    fn select(&self, criteria: &SelectionCriteria) -> Result<SelectedServer> {
        let topology_type = self.inner.topology_type;
        let trace = SelectionTrace::start(criteria, topology_type, self.inner.servers.len());

        let descriptions: Vec<_> = self
            .inner
            .servers
            .iter()
            .map(|server| &server.description)
            .collect();
        let chosen = suitable_servers(topology_type, &descriptions, criteria)
            .into_iter()
            .choose(&mut rand::rng())
            .and_then(|description| {
                self.inner
                    .servers
                    .iter()
                    .find(|server| server.description.address == description.address)
            });

        let outcome = match chosen {
            Some(server) => Ok(SelectedServer::new(
                server.clone() as Arc<dyn Server>,
                topology_type,
            )),
            None => Err(Error::server_selection(format!(
                "Server selection failed: no servers in the {topology_type} topology match \
                 {criteria}"
            ))),
        };
        trace.finish(&outcome);
        outcome
    }
}

impl Deployment for Topology {
    fn select_server<'a>(
        &'a self,
        ctx: &'a Context,
        criteria: &'a SelectionCriteria,
    ) -> BoxFuture<'a, Result<SelectedServer>> {
        async move {
            if let Some(error) = ctx.err() {
                return Err(error.into());
            }
            self.select(criteria)
        }
        .boxed()
    }

    /// Retries require sessions and a deployment that is more than a single server.
    fn supports_retry(&self) -> bool {
        self.inner.topology_type != TopologyType::Single && self.supports_sessions()
    }

    fn supports_sessions(&self) -> bool {
        let mut data_bearing = self
            .inner
            .servers
            .iter()
            .filter(|server| server.description.server_type.is_data_bearing())
            .peekable();

        data_bearing.peek().is_some()
            && data_bearing.all(|server| server.description.logical_session_timeout.is_some())
    }

    fn kind(&self) -> TopologyType {
        self.inner.topology_type
    }
}
