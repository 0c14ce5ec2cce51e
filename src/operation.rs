mod command;
mod count_documents;
mod drop_collection;
mod drop_database;
mod drop_indexes;
mod list_databases;
mod run_command;

use std::{sync::Arc, time::Duration};

use derive_where::derive_where;
use serde::de::DeserializeOwned;

pub use self::{
    count_documents::CountDocuments,
    drop_collection::DropCollection,
    drop_database::DropDatabase,
    drop_indexes::DropIndexes,
    list_databases::{DatabaseSpecification, ListDatabases},
    run_command::RunCommand,
};
use self::command::EncodedCommand;
use crate::{
    bson::{Bson, Document},
    client::session::{
        ClientSession,
        ClusterClock,
        ClusterTime,
        ServerSessionPool,
        TransactionState,
    },
    cmap::{conn::wire, Connection},
    concern::{ReadConcern, WriteConcern},
    context::Context,
    error::{
        CommandError,
        CommandErrorBody,
        Error,
        ErrorKind,
        Result,
        WriteConcernErrorBody,
        TRANSIENT_TRANSACTION_ERROR,
    },
    runtime,
    sdam::{Deployment, SelectedServer, ServerDescription, TopologyType},
    selection_criteria::{ReadPreference, SelectionCriteria},
    trace::{command::CommandTracingEventEmitter, COMMAND_TRACING_EVENT_TARGET},
};

/// Used for implicit sessions when the selected server does not report a session timeout.
const DEFAULT_LOGICAL_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Writes the body of a command into the given document. Invoked once per attempt with the
/// server the attempt was routed to.
pub type CommandFn = Arc<dyn Fn(&mut Document, &SelectedServer) -> Result<()> + Send + Sync>;

/// Whether, and how, an operation may be retried once after a failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum RetryType {
    /// The operation is never retried.
    #[default]
    None,

    /// The operation is a read and is retried on retryable read errors.
    Read,

    /// The operation is a write and is retried on retryable write errors, reusing its
    /// transaction number.
    Write,
}

impl RetryType {
    fn can_retry_error(self, error: &Error) -> bool {
        match self {
            RetryType::None => false,
            RetryType::Read => error.is_read_retryable(),
            RetryType::Write => error.is_write_retryable(),
        }
    }
}

/// A single command to run against a deployment, together with everything needed to route it
/// and to attach session and consistency metadata.
///
/// An `Operation` holds no per-execution state, so the same value can be executed any number of
/// times, concurrently. Mutable state lives in the shared session, clock and pools.
#[derive(Clone, Default)]
#[derive_where(Debug)]
#[non_exhaustive]
pub struct Operation {
    /// Writes the command body.
    #[derive_where(skip)]
    pub command: Option<CommandFn>,

    /// The deployment to run the command against.
    #[derive_where(skip)]
    pub deployment: Option<Arc<dyn Deployment>>,

    /// The database to run the command against.
    pub database: Option<String>,

    /// Overrides the criteria derived from the read preference.
    pub selector: Option<SelectionCriteria>,

    /// The read preference, sent to the server and used for selection when no selector is set.
    pub read_preference: Option<ReadPreference>,

    /// The read concern to attach.
    pub read_concern: Option<ReadConcern>,

    /// The write concern to attach. An unacknowledged write concern makes the operation fire and
    /// forget.
    pub write_concern: Option<WriteConcern>,

    /// The session to run the command in. When unset and the deployment supports sessions, an
    /// implicit session is used for the duration of the call.
    pub session: Option<Arc<ClientSession>>,

    /// The clock shared by every operation against the deployment.
    pub clock: Option<Arc<ClusterClock>>,

    /// How the operation may be retried.
    pub retry_type: RetryType,

    /// The pool implicit sessions are drawn from. No implicit session is used without one.
    pub session_pool: Option<Arc<ServerSessionPool>>,

    /// Set for administrative commands that take a write concern only from wire version 5 on.
    /// Older servers are sent the command without one.
    pub(crate) gated_write_concern: bool,
}

#[derive(Debug)]
struct ExecutionRetry {
    prior_txn_number: Option<i64>,
    first_error: Error,
}

trait RetryHelper {
    fn first_error(&mut self) -> Result<()>;
}

impl RetryHelper for Option<ExecutionRetry> {
    fn first_error(&mut self) -> Result<()> {
        match self.take() {
            Some(r) => Err(r.first_error),
            None => Ok(()),
        }
    }
}

impl Operation {
    /// Creates an operation running the command written by `command` against `database`.
    pub fn new(
        database: impl Into<String>,
        deployment: Arc<dyn Deployment>,
        command: impl Fn(&mut Document, &SelectedServer) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            command: Some(Arc::new(command)),
            deployment: Some(deployment),
            database: Some(database.into()),
            ..Default::default()
        }
    }

    /// Checks that the command function, deployment and database are all set.
    pub fn validate(&self) -> Result<()> {
        if self.command.is_none() {
            return Err(Error::missing_field("CommandFn"));
        }
        if self.deployment.is_none() {
            return Err(Error::missing_field("Deployment"));
        }
        if self.database.as_deref().map_or(true, str::is_empty) {
            return Err(Error::missing_field("Database"));
        }
        Ok(())
    }

    /// Runs the operation and returns the server's reply.
    ///
    /// Writes with an unacknowledged write concern return [`ErrorKind::UnacknowledgedWrite`]
    /// as soon as they have been handed to a background task.
    pub async fn execute(&self, ctx: &Context) -> Result<Document> {
        self.validate()?;

        let mut implicit_session = None;
        let result = self.execute_with_retry(ctx, &mut implicit_session).await;
        if let Some(session) = implicit_session {
            session.end_session().await;
        }
        result
    }

    /// Runs the operation and deserializes the server's reply into `T`.
    pub async fn execute_typed<T: DeserializeOwned>(&self, ctx: &Context) -> Result<T> {
        let reply = self.execute(ctx).await?;
        Ok(bson::from_document(reply)?)
    }

    async fn execute_with_retry(
        &self,
        ctx: &Context,
        implicit_session: &mut Option<Arc<ClientSession>>,
    ) -> Result<Document> {
        let deployment = self
            .deployment
            .as_ref()
            .ok_or_else(|| Error::missing_field("Deployment"))?;
        let mut retry: Option<ExecutionRetry> = None;

        loop {
            let mut session = self.session.clone().or_else(|| implicit_session.clone());
            let criteria = self.selection_criteria(session.as_deref())?;

            let server = match deployment.select_server(ctx, &criteria).await {
                Ok(server) => server,
                Err(err) => {
                    retry.first_error()?;
                    return Err(err);
                }
            };

            let conn = match server.connection(ctx).await {
                Ok(conn) => conn,
                Err(err) => {
                    retry.first_error()?;

                    let retry_type = self.retryable(server.description(), session.as_deref());
                    if retry_type.can_retry_error(&err) {
                        retry = Some(ExecutionRetry {
                            prior_txn_number: None,
                            first_error: err,
                        });
                        continue;
                    }
                    return Err(err);
                }
            };

            if session.is_none() && self.is_acknowledged() && deployment.supports_sessions() {
                if let Some(ref pool) = self.session_pool {
                    let timeout = server
                        .description()
                        .logical_session_timeout
                        .unwrap_or(DEFAULT_LOGICAL_SESSION_TIMEOUT);
                    let implicit = ClientSession::start_implicit(pool.clone(), timeout).await;
                    *implicit_session = Some(implicit.clone());
                    session = Some(implicit);
                }
            }

            let retry_type = self.retryable(server.description(), session.as_deref());
            if retry_type == RetryType::None {
                retry.first_error()?;
            }

            let txn_number = match retry.as_ref().and_then(|r| r.prior_txn_number) {
                Some(txn_number) => Some(txn_number),
                None => match (retry_type, session.as_deref()) {
                    (RetryType::Write, Some(session)) => Some(session.increment_txn_number()?),
                    _ => None,
                },
            };

            match self
                .execute_on_connection(ctx, &server, conn, session.as_deref(), txn_number)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    // A second failure is reported as is.
                    if retry.is_some() {
                        return Err(err);
                    }
                    if retry_type.can_retry_error(&err) {
                        retry = Some(ExecutionRetry {
                            prior_txn_number: txn_number,
                            first_error: err,
                        });
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn execute_on_connection(
        &self,
        ctx: &Context,
        server: &SelectedServer,
        mut conn: Box<dyn Connection>,
        session: Option<&ClientSession>,
        txn_number: Option<i64>,
    ) -> Result<Document> {
        if let Some(session) = session {
            // Every command of a sharded transaction goes to the mongos that started it.
            if session.transaction_state() == TransactionState::Starting
                && server.topology_type() == TopologyType::Sharded
            {
                session.pin_server(server.description().address.clone());
            }
        }

        let encoded = match self.encode(server, session, txn_number) {
            Ok(encoded) => encoded,
            Err(err) => {
                let _ = conn.close();
                return Err(err);
            }
        };

        let connection_id = conn.id().to_string();
        let address = conn.address().clone();
        let emitter = CommandTracingEventEmitter::new(
            &encoded.name,
            &connection_id,
            &address,
            encoded.request_id,
        );
        emitter.emit_started(self.database.as_deref().unwrap_or_default(), &encoded.command);

        // No reply is coming, so only the start is traced.
        if !self.is_acknowledged() {
            let ctx = ctx.clone();
            runtime::spawn(send_unacknowledged(ctx, conn, encoded));
            return Err(ErrorKind::UnacknowledgedWrite.into());
        }

        let result = match round_trip(ctx, conn.as_mut(), &encoded.bytes).await {
            Ok(reply) => self.process_response(&reply, encoded.request_id, session),
            Err(err) => Err(err),
        };
        let _ = conn.close();

        match result {
            Ok(ref reply) => emitter.emit_succeeded(reply),
            Err(ref err) => {
                emitter.emit_failed(err);
                if let Some(session) = session {
                    if err.is_network_error() {
                        session.mark_dirty();
                    }
                    if err.contains_label(TRANSIENT_TRANSACTION_ERROR) {
                        session.unpin();
                    }
                }
            }
        }
        result
    }

    /// Decodes a reply and applies its session-relevant fields. A reply with `ok: 0` or a
    /// write concern error becomes an error carrying the server's labels.
    fn process_response(
        &self,
        reply: &[u8],
        request_id: i32,
        session: Option<&ClientSession>,
    ) -> Result<Document> {
        let (header, reply) = wire::decode_reply(reply)?;
        if header.response_to != request_id {
            return Err(Error::invalid_response(format!(
                "expected a response to request {request_id} but got one to {}",
                header.response_to
            )));
        }

        self.update_operation_time(&reply, session);
        self.update_cluster_times(&reply, session);
        if let (Some(session), Ok(token)) = (session, reply.get_document("recoveryToken")) {
            session.set_recovery_token(token.clone());
        }

        if !is_ok(&reply) {
            let mut body: CommandErrorBody = bson::from_document(reply)?;
            if body.command_error.message.is_empty() {
                body.command_error.message = "command failed".to_string();
            }
            return Err(body.into());
        }

        let body: WriteConcernErrorBody = bson::from_document(reply.clone())?;
        if let Some(wc_error) = body.write_concern_error {
            let wc_error: CommandError = bson::from_document(wc_error)?;
            return Err(Error::new(ErrorKind::WriteConcern(wc_error), body.error_labels));
        }

        Ok(reply)
    }

    fn update_operation_time(&self, reply: &Document, session: Option<&ClientSession>) {
        if let (Some(session), Ok(operation_time)) = (session, reply.get_timestamp("operationTime"))
        {
            session.advance_operation_time(operation_time);
        }
    }

    fn update_cluster_times(&self, reply: &Document, session: Option<&ClientSession>) {
        let Some(cluster_time) = reply
            .get_document("$clusterTime")
            .ok()
            .and_then(|ct| bson::from_document::<ClusterTime>(ct.clone()).ok())
        else {
            return;
        };

        if let Some(ref clock) = self.clock {
            clock.advance(&cluster_time);
        }
        if let Some(session) = session {
            session.advance_cluster_time(&cluster_time);
        }
    }

    /// Decides whether the attempt routed to the server described by `description` may be
    /// retried. Recomputed on every attempt.
    pub(crate) fn retryable(
        &self,
        description: &ServerDescription,
        session: Option<&ClientSession>,
    ) -> RetryType {
        let Some(ref deployment) = self.deployment else {
            return RetryType::None;
        };
        if self.retry_type == RetryType::None
            || !deployment.supports_retry()
            || !description.supports_retry()
            || session.is_some_and(ClientSession::in_transaction)
        {
            return RetryType::None;
        }

        match self.retry_type {
            RetryType::Write if session.is_none() || !self.is_acknowledged() => RetryType::None,
            retry_type => retry_type,
        }
    }

    /// The criteria used to select a server: the session's pinned server, then the configured
    /// selector, then the read preference, defaulting to primary.
    pub(crate) fn selection_criteria(
        &self,
        session: Option<&ClientSession>,
    ) -> Result<SelectionCriteria> {
        let read_preference = self.read_preference(session)?;
        if let Some(pinned) = session.and_then(ClientSession::pinned_criteria) {
            return Ok(pinned);
        }
        if let Some(ref selector) = self.selector {
            return Ok(selector.clone());
        }
        Ok(read_preference.unwrap_or(ReadPreference::Primary).into())
    }

    /// The read preference in effect. Inside a transaction the transaction's read preference
    /// replaces the operation's, and it must be primary.
    pub(crate) fn read_preference(
        &self,
        session: Option<&ClientSession>,
    ) -> Result<Option<ReadPreference>> {
        let Some(session) = session.filter(|session| session.in_transaction()) else {
            return Ok(self.read_preference.clone());
        };

        let read_preference = session
            .transaction_options()
            .and_then(|options| options.read_preference)
            .or_else(|| self.read_preference.clone());
        match read_preference {
            Some(ref read_preference) if read_preference != &ReadPreference::Primary => {
                Err(Error::transaction(format!(
                    "read preference in a transaction must be primary, got {read_preference}"
                )))
            }
            read_preference => Ok(read_preference),
        }
    }

    fn is_acknowledged(&self) -> bool {
        self.write_concern
            .as_ref()
            .map_or(true, WriteConcern::is_acknowledged)
    }
}

/// Writes one message and reads one reply on `conn`. Failures other than the context firing are
/// labeled as transient network errors.
pub(crate) async fn round_trip(
    ctx: &Context,
    conn: &mut dyn Connection,
    message: &[u8],
) -> Result<Vec<u8>> {
    conn.write_message(ctx, message)
        .await
        .map_err(network_error)?;
    conn.read_message(ctx).await.map_err(network_error)
}

fn network_error(error: Error) -> Error {
    if error.is_context_error() {
        error
    } else {
        Error::network(error)
    }
}

/// Sends an unacknowledged write and releases the connection, whatever the outcome.
async fn send_unacknowledged(ctx: Context, mut conn: Box<dyn Connection>, encoded: EncodedCommand) {
    let result = if encoded.more_to_come {
        conn.write_message(&ctx, &encoded.bytes).await
    } else {
        round_trip(&ctx, conn.as_mut(), &encoded.bytes)
            .await
            .map(|_| ())
    };
    if let Err(error) = result {
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            commandName = encoded.name.as_str(),
            driverConnectionId = conn.id(),
            error = %error,
            "Unacknowledged write failed"
        );
    }
    let _ = conn.close();
}

fn is_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(ok)) => *ok == 1.0,
        Some(Bson::Int32(ok)) => *ok == 1,
        Some(Bson::Int64(ok)) => *ok == 1,
        Some(Bson::Boolean(ok)) => *ok,
        _ => false,
    }
}
