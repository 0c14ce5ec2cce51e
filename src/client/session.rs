mod cluster_time;
mod pool;
#[cfg(test)]
mod test;

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

pub use self::{
    cluster_time::{ClusterClock, ClusterTime},
    pool::ServerSessionPool,
};
pub(crate) use self::cluster_time::max_cluster_time;
use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp},
    concern::{ReadConcern, WriteConcern},
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// Contains the options that can be used to create a new [`ClientSession`].
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct SessionOptions {
    /// The default options to use for transactions started on this session.
    ///
    /// If these options are not specified, they will be inherited from the operation the
    /// transaction runs.
    pub default_transaction_options: Option<TransactionOptions>,

    /// If true, all read operations performed using this session will be read from the same
    /// snapshot as the operations before them, by sending `afterClusterTime`.
    ///
    /// Defaults to true.
    pub causal_consistency: Option<bool>,
}

/// Contains the options that can be used for a transaction.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The read concern to use for the transaction.
    #[builder(default)]
    pub read_concern: Option<ReadConcern>,

    /// The write concern to use when committing or aborting a transaction.
    #[builder(default)]
    pub write_concern: Option<WriteConcern>,

    /// The read preference for every operation in the transaction. Only `primary` is accepted
    /// when an operation runs.
    #[builder(default)]
    pub read_preference: Option<ReadPreference>,
}

/// The state of a session's transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransactionState {
    /// No transaction has been started.
    #[default]
    None,

    /// A transaction was started and no command has been sent in it yet.
    Starting,

    /// At least one command has been sent in the transaction.
    InProgress,

    /// The transaction was committed.
    Committed,

    /// The transaction was aborted.
    Aborted,
}

#[derive(Clone, Debug, Default)]
struct Transaction {
    state: TransactionState,
    options: Option<TransactionOptions>,
    pinned: Option<ServerAddress>,
    recovery_token: Option<Document>,
}

impl Transaction {
    fn start(&mut self, options: Option<TransactionOptions>) {
        self.state = TransactionState::Starting;
        self.options = options;
        self.pinned = None;
        self.recovery_token = None;
    }

    fn abort(&mut self) {
        self.state = TransactionState::Aborted;
        self.options = None;
        self.pinned = None;
    }
}

/// The server-side half of a session: its id and transaction counter.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    id: Document,

    /// The last time an operation was executed with this session.
    last_use: Instant,

    /// Whether a network error was encountered while using this session.
    dirty: bool,

    /// A monotonically increasing transaction number for this session.
    txn_number: i64,
}

impl ServerSession {
    /// Creates a new session, generating the id client side.
    fn new() -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// Determines if this server session is about to expire in a short amount of time (1 minute).
    fn is_about_to_expire(&self, logical_session_timeout: Duration) -> bool {
        let expiration_date = self.last_use + logical_session_timeout;
        expiration_date < Instant::now() + Duration::from_secs(60)
    }
}

#[derive(Debug)]
struct SessionState {
    /// `None` once the session has ended.
    server_session: Option<ServerSession>,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    transaction: Transaction,
}

/// A logical session: the causal-consistency and transaction state carried across the
/// operations that share it.
///
/// Sessions are shared as `Arc<ClientSession>` and synchronize internally, so every method
/// takes `&self`.
#[derive(Debug)]
pub struct ClientSession {
    id: Document,
    pool: Arc<ServerSessionPool>,
    logical_session_timeout: Duration,
    options: Option<SessionOptions>,
    is_implicit: bool,
    state: Mutex<SessionState>,
}

impl ClientSession {
    /// Starts an explicit session backed by a server session from `pool`.
    pub async fn start(
        pool: Arc<ServerSessionPool>,
        logical_session_timeout: Duration,
        options: impl Into<Option<SessionOptions>>,
    ) -> Arc<Self> {
        Arc::new(Self::new(pool, logical_session_timeout, options.into(), false).await)
    }

    /// Starts a session on behalf of a single operation.
    pub(crate) async fn start_implicit(
        pool: Arc<ServerSessionPool>,
        logical_session_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self::new(pool, logical_session_timeout, None, true).await)
    }

    async fn new(
        pool: Arc<ServerSessionPool>,
        logical_session_timeout: Duration,
        options: Option<SessionOptions>,
        is_implicit: bool,
    ) -> Self {
        let server_session = pool.check_out(logical_session_timeout).await;
        Self {
            id: server_session.id.clone(),
            pool,
            logical_session_timeout,
            options,
            is_implicit,
            state: Mutex::new(SessionState {
                server_session: Some(server_session),
                cluster_time: None,
                operation_time: None,
                transaction: Transaction::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The id of this session, as sent in `lsid`.
    pub fn id(&self) -> &Document {
        &self.id
    }

    /// The options this session was started with.
    pub fn options(&self) -> Option<&SessionOptions> {
        self.options.as_ref()
    }

    /// Whether this session was created by the engine for a single operation.
    pub fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    /// Whether [`end_session`](Self::end_session) has been called.
    pub fn is_ended(&self) -> bool {
        self.state().server_session.is_none()
    }

    pub(crate) fn is_causally_consistent(&self) -> bool {
        !self.is_implicit
            && self
                .options
                .as_ref()
                .and_then(|options| options.causal_consistency)
                .unwrap_or(true)
    }

    /// The highest cluster time this session has seen.
    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.state().cluster_time.clone()
    }

    /// Advances the cluster time for this session. Has no effect unless `to` is greater than
    /// the current cluster time.
    pub fn advance_cluster_time(&self, to: &ClusterTime) {
        let mut state = self.state();
        if state.cluster_time.as_ref().map(|ct| ct < to).unwrap_or(true) {
            state.cluster_time = Some(to.clone());
        }
    }

    /// The operation time of the latest operation run with this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.state().operation_time
    }

    /// Advances the operation time for this session. Has no effect unless `ts` is greater than
    /// the current operation time.
    pub fn advance_operation_time(&self, ts: Timestamp) {
        let mut state = self.state();
        let advance = state
            .operation_time
            .map(|current| (current.time, current.increment) < (ts.time, ts.increment))
            .unwrap_or(true);
        if advance {
            state.operation_time = Some(ts);
        }
    }

    /// The current transaction number.
    pub fn txn_number(&self) -> i64 {
        self.state()
            .server_session
            .as_ref()
            .map(|s| s.txn_number)
            .unwrap_or_default()
    }

    /// Increments the transaction number and returns the new value.
    pub fn increment_txn_number(&self) -> Result<i64> {
        let mut state = self.state();
        let server_session = state
            .server_session
            .as_mut()
            .ok_or_else(|| Error::from(ErrorKind::SessionEnded))?;
        server_session.txn_number += 1;
        Ok(server_session.txn_number)
    }

    pub(crate) fn mark_dirty(&self) {
        if let Some(server_session) = self.state().server_session.as_mut() {
            server_session.dirty = true;
        }
    }

    pub(crate) fn update_last_use(&self) {
        if let Some(server_session) = self.state().server_session.as_mut() {
            server_session.last_use = Instant::now();
        }
    }

    /// The state of the current transaction.
    pub fn transaction_state(&self) -> TransactionState {
        self.state().transaction.state
    }

    pub(crate) fn in_transaction(&self) -> bool {
        matches!(
            self.transaction_state(),
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    pub(crate) fn transaction_options(&self) -> Option<TransactionOptions> {
        self.state().transaction.options.clone()
    }

    /// Records that a command carrying this session's fields is being sent. The first command
    /// of a transaction moves it to in progress; the first command after a transaction ended
    /// clears it.
    pub(crate) fn apply_command(&self) {
        let mut state = self.state();
        match state.transaction.state {
            TransactionState::Starting => state.transaction.state = TransactionState::InProgress,
            TransactionState::Committed | TransactionState::Aborted => {
                state.transaction = Transaction::default();
            }
            TransactionState::None | TransactionState::InProgress => {}
        }
    }

    /// Starts a new transaction. Its options are merged over the session's default transaction
    /// options, and the transaction number is incremented.
    pub fn start_transaction(&self, options: impl Into<Option<TransactionOptions>>) -> Result<()> {
        if self.is_ended() {
            return Err(ErrorKind::SessionEnded.into());
        }
        if self.in_transaction() {
            return Err(Error::transaction("transaction already in progress"));
        }

        let defaults = self
            .options
            .as_ref()
            .and_then(|options| options.default_transaction_options.clone());
        let options = match (options.into(), defaults) {
            (Some(mut options), Some(defaults)) => {
                options.read_concern = options.read_concern.or(defaults.read_concern);
                options.write_concern = options.write_concern.or(defaults.write_concern);
                options.read_preference = options.read_preference.or(defaults.read_preference);
                Some(options)
            }
            (options, defaults) => options.or(defaults),
        };

        if let Some(ref options) = options {
            if !options
                .write_concern
                .as_ref()
                .map(|wc| wc.is_acknowledged())
                .unwrap_or(true)
            {
                return Err(Error::transaction(
                    "transactions do not support unacknowledged write concerns",
                ));
            }
        }

        self.increment_txn_number()?;
        self.state().transaction.start(options);
        Ok(())
    }

    /// Marks the current transaction committed. Committing again is allowed.
    pub fn commit_transaction(&self) -> Result<()> {
        let mut state = self.state();
        match state.transaction.state {
            TransactionState::None => Err(Error::transaction("no transaction started")),
            TransactionState::Aborted => Err(Error::transaction(
                "Cannot call commitTransaction after calling abortTransaction",
            )),
            TransactionState::Starting
            | TransactionState::InProgress
            | TransactionState::Committed => {
                state.transaction.state = TransactionState::Committed;
                Ok(())
            }
        }
    }

    /// Marks the current transaction aborted and releases its pinned server.
    pub fn abort_transaction(&self) -> Result<()> {
        let mut state = self.state();
        match state.transaction.state {
            TransactionState::None => Err(Error::transaction("no transaction started")),
            TransactionState::Committed => Err(Error::transaction(
                "Cannot call abortTransaction after calling commitTransaction",
            )),
            TransactionState::Aborted => {
                Err(Error::transaction("cannot call abortTransaction twice"))
            }
            TransactionState::Starting | TransactionState::InProgress => {
                state.transaction.abort();
                Ok(())
            }
        }
    }

    /// The server every command of the current transaction is routed to, if pinned.
    pub fn pinned_server(&self) -> Option<ServerAddress> {
        self.state().transaction.pinned.clone()
    }

    /// Criteria selecting only the pinned server.
    pub(crate) fn pinned_criteria(&self) -> Option<SelectionCriteria> {
        self.pinned_server().map(SelectionCriteria::from_address)
    }

    /// Routes every subsequent command of this session to `address`.
    pub fn pin_server(&self, address: ServerAddress) {
        self.state().transaction.pinned = Some(address);
    }

    /// Removes any server pin.
    pub fn unpin(&self) {
        self.state().transaction.pinned = None;
    }

    /// The recovery token a mongos returned for the current transaction.
    pub fn recovery_token(&self) -> Option<Document> {
        self.state().transaction.recovery_token.clone()
    }

    pub(crate) fn set_recovery_token(&self, token: Document) {
        self.state().transaction.recovery_token = Some(token);
    }

    /// Ends the session, returning its server session to the pool. Any later use of the
    /// session by an operation fails with [`ErrorKind::SessionEnded`]. Ending twice has no
    /// effect.
    pub async fn end_session(&self) {
        let server_session = self.state().server_session.take();
        if let Some(server_session) = server_session {
            self.pool
                .check_in(server_session, self.logical_session_timeout)
                .await;
        }
    }
}
