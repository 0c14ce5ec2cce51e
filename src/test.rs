//! Scripted stand-ins for the network, a server and a deployment, shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use futures_core::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::DuplexStream;

use crate::{
    bson::{doc, Document},
    cmap::{
        conn::wire::{Message, MessageFlags, OpCode, Query, Reply},
        establish::{AsyncStream, Establisher},
        Connection,
    },
    context::Context,
    error::{Error, Result},
    event::EventHandler,
    options::{SelectionCriteria, ServerAddress},
    sdam::{
        Deployment,
        SelectedServer,
        Server,
        ServerDescription,
        ServerType,
        TopologyType,
        WireVersionRange,
    },
};

/// A `tracing` event as recorded by [`TraceRecorder`], with every field rendered as a string.
#[derive(Clone, Debug)]
pub(crate) struct RecordedEvent {
    pub(crate) target: String,
    pub(crate) fields: HashMap<String, String>,
}

impl RecordedEvent {
    pub(crate) fn message(&self) -> &str {
        self.fields.get("message").map_or("", String::as_str)
    }
}

/// Records every `tracing` event emitted on the current thread while installed.
#[derive(Clone, Default)]
pub(crate) struct TraceRecorder {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl TraceRecorder {
    pub(crate) fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(self.clone())
    }

    pub(crate) fn events(&self, target: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.target == target)
            .cloned()
            .collect()
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl tracing::field::Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

impl tracing::Subscriber for TraceRecorder {
    fn enabled(&self, _: &tracing::Metadata<'_>) -> bool {
        true
    }

    fn event(&self, event: &tracing::Event<'_>) {
        let mut fields = HashMap::new();
        event.record(&mut FieldVisitor(&mut fields));
        self.events.lock().unwrap().push(RecordedEvent {
            target: event.metadata().target().to_string(),
            fields,
        });
    }

    // No spans are created.
    fn new_span(&self, _: &tracing::span::Attributes<'_>) -> tracing::span::Id {
        tracing::span::Id::from_u64(1)
    }
    fn record(&self, _: &tracing::span::Id, _: &tracing::span::Record<'_>) {}
    fn record_follows_from(&self, _: &tracing::span::Id, _: &tracing::span::Id) {}
    fn enter(&self, _: &tracing::span::Id) {}
    fn exit(&self, _: &tracing::span::Id) {}
}

/// Collects events delivered to the handler returned by [`EventBuffer::handler`].
#[derive(Clone, Debug)]
pub(crate) struct EventBuffer<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + Sync + 'static> EventBuffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn handler(&self) -> EventHandler<T> {
        let events = self.events.clone();
        EventHandler::callback(move |event| events.lock().unwrap().push(event))
    }

    pub(crate) fn all(&self) -> Vec<T> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn filter_map<R>(&self, f: impl Fn(&T) -> Option<R>) -> Vec<R> {
        self.events.lock().unwrap().iter().filter_map(f).collect()
    }
}

/// Dials in-memory duplex pipes. The server half of every pipe is kept for the test to drive.
pub(crate) struct DuplexEstablisher {
    delay: Option<Duration>,
    fail: bool,
    dialed: AtomicUsize,
    servers: Mutex<VecDeque<DuplexStream>>,
}

impl DuplexEstablisher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            delay: None,
            fail: false,
            dialed: AtomicUsize::new(0),
            servers: Mutex::new(VecDeque::new()),
        })
    }

    /// Every dial sleeps for `delay` before completing.
    pub(crate) fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            fail: false,
            dialed: AtomicUsize::new(0),
            servers: Mutex::new(VecDeque::new()),
        })
    }

    /// Every dial is refused.
    pub(crate) fn refusing() -> Arc<Self> {
        Arc::new(Self {
            delay: None,
            fail: true,
            dialed: AtomicUsize::new(0),
            servers: Mutex::new(VecDeque::new()),
        })
    }

    /// The number of streams handed out.
    pub(crate) fn dialed(&self) -> usize {
        self.dialed.load(Ordering::SeqCst)
    }

    /// The server half of the oldest pipe not yet taken.
    pub(crate) fn take_server(&self) -> Option<DuplexStream> {
        self.servers.lock().unwrap().pop_front()
    }
}

impl Establisher for DuplexEstablisher {
    fn establish<'a>(
        &'a self,
        _address: &'a ServerAddress,
    ) -> BoxFuture<'a, Result<Box<dyn AsyncStream>>> {
        async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
            }
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.servers.lock().unwrap().push_back(server);
            self.dialed.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(client) as Box<dyn AsyncStream>)
        }
        .boxed()
    }
}

/// What a [`MockConnection`] does next.
#[derive(Clone, Debug)]
pub(crate) enum MockStep {
    /// Answers the last request with this document.
    Reply(Document),
    /// Returns these bytes verbatim from the next read.
    Bytes(Vec<u8>),
    /// The next read fails with an I/O error.
    ReadError,
    /// The next write fails with an I/O error.
    WriteError,
    /// The next read never completes; only the context can end it.
    Hang,
}

#[derive(Debug, Default)]
struct MockServerState {
    steps: Mutex<VecDeque<MockStep>>,
    sent: Mutex<Vec<Vec<u8>>>,
    connection_errors: Mutex<VecDeque<Error>>,
    connections: AtomicUsize,
    closed: AtomicUsize,
}

/// A server whose connections follow a shared script.
pub(crate) struct MockServer {
    description: ServerDescription,
    state: Arc<MockServerState>,
}

impl MockServer {
    pub(crate) fn new(description: ServerDescription) -> Arc<Self> {
        Arc::new(Self {
            description,
            state: Default::default(),
        })
    }

    /// A session-capable server that speaks OP_MSG.
    pub(crate) fn modern(host: &str, server_type: ServerType) -> Arc<Self> {
        Self::new(
            ServerDescription::builder()
                .address(ServerAddress::new(host, Some(27017)))
                .server_type(server_type)
                .wire_version(WireVersionRange::new(0, 17))
                .logical_session_timeout(Duration::from_secs(30 * 60))
                .build(),
        )
    }

    /// A server that predates OP_MSG, sessions and cluster times.
    pub(crate) fn legacy(host: &str, server_type: ServerType) -> Arc<Self> {
        Self::new(
            ServerDescription::builder()
                .address(ServerAddress::new(host, Some(27017)))
                .server_type(server_type)
                .wire_version(WireVersionRange::new(0, 5))
                .build(),
        )
    }

    pub(crate) fn push(&self, step: MockStep) -> &Self {
        self.state.steps.lock().unwrap().push_back(step);
        self
    }

    /// The next connection attempt fails with `error`.
    pub(crate) fn fail_connection(&self, error: Error) -> &Self {
        self.state.connection_errors.lock().unwrap().push_back(error);
        self
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Every message written to this server's connections, in order.
    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.state.sent.lock().unwrap().clone()
    }

    /// The command documents written to this server's connections, in order.
    pub(crate) fn sent_commands(&self) -> Vec<Document> {
        self.sent()
            .iter()
            .map(|bytes| match op_code(bytes) {
                Some(OpCode::Query) => Query::from_bytes(bytes).unwrap().query,
                _ => Message::from_bytes(bytes).unwrap().document,
            })
            .collect()
    }

    /// The number of connections handed out.
    pub(crate) fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// The number of connections released.
    pub(crate) fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Waits until `count` connections have been released.
    pub(crate) async fn wait_for_closed(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.closed() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }
}

impl Server for MockServer {
    fn connection<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Box<dyn Connection>>> {
        async move {
            if let Some(error) = ctx.err() {
                return Err(error.into());
            }
            if let Some(error) = self.state.connection_errors.lock().unwrap().pop_front() {
                return Err(error);
            }
            let id = self.state.connections.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Box::new(MockConnection {
                id: format!("{}[{}]", self.description.address, id),
                description: self.description.clone(),
                state: self.state.clone(),
                last_request: None,
            }) as Box<dyn Connection>)
        }
        .boxed()
    }

    fn description(&self) -> ServerDescription {
        self.description.clone()
    }
}

fn op_code(bytes: &[u8]) -> Option<OpCode> {
    match i32::from_le_bytes(bytes.get(12..16)?.try_into().ok()?) {
        2004 => Some(OpCode::Query),
        2013 => Some(OpCode::Message),
        1 => Some(OpCode::Reply),
        _ => None,
    }
}

pub(crate) struct MockConnection {
    id: String,
    description: ServerDescription,
    state: Arc<MockServerState>,
    last_request: Option<(i32, OpCode)>,
}

impl MockConnection {
    fn reply_to_last(&self, document: Document) -> Vec<u8> {
        match self.last_request {
            Some((request_id, OpCode::Query)) => {
                Reply::new(request_id, document).to_bytes().unwrap()
            }
            last => {
                let mut message = Message::new(document, MessageFlags::empty());
                message.response_to = last.map_or(0, |(request_id, _)| request_id);
                message.to_bytes().unwrap()
            }
        }
    }
}

impl Connection for MockConnection {
    fn write_message<'a>(
        &'a mut self,
        ctx: &'a Context,
        message: &'a [u8],
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if let Some(error) = ctx.err() {
                return Err(error.into());
            }
            {
                let mut steps = self.state.steps.lock().unwrap();
                if matches!(steps.front(), Some(MockStep::WriteError)) {
                    steps.pop_front();
                    return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
                }
            }
            let request_id = i32::from_le_bytes(message[4..8].try_into().unwrap());
            self.last_request = op_code(message).map(|op_code| (request_id, op_code));
            self.state.sent.lock().unwrap().push(message.to_vec());
            Ok(())
        }
        .boxed()
    }

    fn read_message<'a>(&'a mut self, ctx: &'a Context) -> BoxFuture<'a, Result<Vec<u8>>> {
        async move {
            let step = self.state.steps.lock().unwrap().pop_front();
            match step {
                None => Ok(self.reply_to_last(doc! { "ok": 1 })),
                Some(MockStep::Reply(document)) => Ok(self.reply_to_last(document)),
                Some(MockStep::Bytes(bytes)) => Ok(bytes),
                Some(MockStep::ReadError | MockStep::WriteError) => {
                    Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset).into())
                }
                Some(MockStep::Hang) => {
                    ctx.run(std::future::pending::<()>()).await?;
                    unreachable!("a pending future never completes")
                }
            }
        }
        .boxed()
    }

    fn description(&self) -> &ServerDescription {
        &self.description
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> &ServerAddress {
        &self.description.address
    }
}

/// A deployment over [`MockServer`]s that records the criteria it is asked to select with.
/// Read preferences select the first server; predicates select the first server they accept.
pub(crate) struct MockDeployment {
    topology_type: TopologyType,
    servers: Vec<Arc<MockServer>>,
    retry: bool,
    sessions: bool,
    criteria: Mutex<Vec<SelectionCriteria>>,
}

impl MockDeployment {
    pub(crate) fn new(topology_type: TopologyType, servers: Vec<Arc<MockServer>>) -> Self {
        Self {
            topology_type,
            servers,
            retry: true,
            sessions: true,
            criteria: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn with_sessions(mut self, sessions: bool) -> Self {
        self.sessions = sessions;
        self
    }

    pub(crate) fn criteria(&self) -> Vec<SelectionCriteria> {
        self.criteria.lock().unwrap().clone()
    }

    pub(crate) fn selections(&self) -> usize {
        self.criteria.lock().unwrap().len()
    }
}

impl Deployment for MockDeployment {
    fn select_server<'a>(
        &'a self,
        ctx: &'a Context,
        criteria: &'a SelectionCriteria,
    ) -> BoxFuture<'a, Result<SelectedServer>> {
        async move {
            if let Some(error) = ctx.err() {
                return Err(error.into());
            }
            self.criteria.lock().unwrap().push(criteria.clone());

            let server = match criteria {
                SelectionCriteria::Predicate(predicate) => self
                    .servers
                    .iter()
                    .find(|server| predicate(&server.description)),
                _ => self.servers.first(),
            };
            match server {
                Some(server) => Ok(SelectedServer::new(
                    server.clone() as Arc<dyn Server>,
                    self.topology_type,
                )),
                None => Err(Error::server_selection("no suitable server")),
            }
        }
        .boxed()
    }

    fn supports_retry(&self) -> bool {
        self.retry
    }

    fn supports_sessions(&self) -> bool {
        self.sessions
    }

    fn kind(&self) -> TopologyType {
        self.topology_type
    }
}
