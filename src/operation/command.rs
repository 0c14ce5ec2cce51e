//! Turns an [`Operation`]'s command into a wire message: the command function's body plus the
//! read concern, session, write concern, cluster time and read preference metadata.

#[cfg(test)]
mod test;

use super::Operation;
use crate::{
    bson::{doc, Document},
    client::session::{max_cluster_time, ClientSession, TransactionState},
    cmap::conn::wire::{Message, MessageFlags, Query, QueryFlags},
    concern::{CommandReadConcern, ReadConcern},
    error::{Error, ErrorKind, Result},
    sdam::{SelectedServer, ServerDescription, ServerType, TopologyType},
    selection_criteria::ReadPreference,
};

/// A command ready to be written to a connection.
#[derive(Debug)]
pub(crate) struct EncodedCommand {
    /// The name of the command, taken from its first key.
    pub(crate) name: String,

    /// The document that was sent, for tracing.
    pub(crate) command: Document,

    pub(crate) request_id: i32,

    pub(crate) bytes: Vec<u8>,

    /// Set when the server will not reply.
    pub(crate) more_to_come: bool,
}

impl Operation {
    /// Builds the command for `server` and encodes it as OP_MSG, or as OP_QUERY for servers that
    /// predate OP_MSG.
    pub(crate) fn encode(
        &self,
        server: &SelectedServer,
        session: Option<&ClientSession>,
        txn_number: Option<i64>,
    ) -> Result<EncodedCommand> {
        let command_fn = self
            .command
            .as_ref()
            .ok_or_else(|| Error::missing_field("CommandFn"))?;
        let database = self
            .database
            .as_deref()
            .ok_or_else(|| Error::missing_field("Database"))?;
        let description = server.description();

        let mut command = Document::new();
        command_fn(&mut command, server)?;
        let name = command
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| Error::invalid_argument("the command function wrote an empty command"))?;

        self.add_read_concern(&mut command, description, session)?;
        self.add_session(&mut command, description, session, txn_number)?;
        self.add_write_concern(&mut command, description)?;
        self.add_cluster_time(&mut command, description, session)?;

        let read_preference = self.read_preference(session)?;

        if description.supports_op_msg() {
            command.insert("$db", database);
            let read_pref = create_read_pref(
                read_preference.as_ref(),
                description.server_type,
                server.topology_type(),
                false,
            )?;
            // Primary is the server's default.
            if let Some(read_pref) = read_pref.filter(|rp| rp != &doc! { "mode": "primary" }) {
                command.insert("$readPreference", read_pref);
            }

            let more_to_come = !self.is_acknowledged();
            let flags = if more_to_come {
                MessageFlags::MORE_TO_COME
            } else {
                MessageFlags::empty()
            };
            let message = Message::new(command, flags);
            Ok(EncodedCommand {
                name,
                request_id: message.request_id,
                bytes: message.to_bytes()?,
                command: message.document,
                more_to_come,
            })
        } else {
            let flags = secondary_ok(read_preference.as_ref(), server);
            let read_pref = create_read_pref(
                read_preference.as_ref(),
                description.server_type,
                server.topology_type(),
                true,
            )?;
            let query = match read_pref {
                Some(read_pref) => doc! { "$query": command, "$readPreference": read_pref },
                None => command,
            };

            let query = Query::command(database, query, flags);
            Ok(EncodedCommand {
                name,
                request_id: query.request_id,
                bytes: query.to_bytes()?,
                command: query.query,
                more_to_come: false,
            })
        }
    }

    /// Attaches the read concern. A starting transaction's read concern replaces the
    /// operation's, and none is sent once the transaction is in progress. Causally consistent
    /// sessions add `afterClusterTime`.
    pub(crate) fn add_read_concern(
        &self,
        command: &mut Document,
        description: &ServerDescription,
        session: Option<&ClientSession>,
    ) -> Result<()> {
        let mut read_concern = self.read_concern.clone();
        if let Some(session) = session {
            match session.transaction_state() {
                TransactionState::InProgress => return Ok(()),
                TransactionState::Starting => {
                    if let Some(rc) = session
                        .transaction_options()
                        .and_then(|options| options.read_concern)
                    {
                        read_concern = Some(rc);
                    }
                    if read_concern.is_none()
                        && session.is_causally_consistent()
                        && session.operation_time().is_some()
                    {
                        read_concern = Some(ReadConcern::default());
                    }
                }
                _ => {}
            }
        }
        let Some(read_concern) = read_concern else {
            return Ok(());
        };

        let mut internal = CommandReadConcern {
            level: read_concern.level,
            after_cluster_time: None,
        };
        if description.supports_cluster_time() {
            if let Some(session) = session.filter(|session| session.is_causally_consistent()) {
                internal.after_cluster_time = session.operation_time();
            }
        }

        if !internal.is_empty() {
            command.insert("readConcern", bson::to_document(&internal)?);
        }
        Ok(())
    }

    /// Attaches `lsid` and, for retryable writes and transactions, `txnNumber`. Transactions
    /// also get `startTransaction`, `autocommit` and the recovery token. Servers without session
    /// support get nothing.
    pub(crate) fn add_session(
        &self,
        command: &mut Document,
        description: &ServerDescription,
        session: Option<&ClientSession>,
        txn_number: Option<i64>,
    ) -> Result<()> {
        let Some(session) = session else {
            return Ok(());
        };
        if !description.supports_cluster_time() || description.logical_session_timeout.is_none()
        {
            return Ok(());
        }
        if session.is_ended() {
            return Err(ErrorKind::SessionEnded.into());
        }

        command.insert("lsid", session.id().clone());

        let in_transaction = session.in_transaction();
        if let Some(txn_number) = txn_number.or_else(|| in_transaction.then(|| session.txn_number()))
        {
            command.insert("txnNumber", txn_number);
        }
        if in_transaction {
            if session.transaction_state() == TransactionState::Starting {
                command.insert("startTransaction", true);
            }
            command.insert("autocommit", false);
            if let Some(token) = session.recovery_token() {
                command.insert("recoveryToken", token);
            }
        }

        session.update_last_use();
        session.apply_command();
        Ok(())
    }

    pub(crate) fn add_write_concern(
        &self,
        command: &mut Document,
        description: &ServerDescription,
    ) -> Result<()> {
        let Some(ref write_concern) = self.write_concern else {
            return Ok(());
        };
        write_concern.validate()?;
        if self.gated_write_concern && !description.supports_command_write_concern() {
            return Ok(());
        }
        if !write_concern.is_empty() {
            command.insert("writeConcern", bson::to_document(write_concern)?);
        }
        Ok(())
    }

    /// Attaches the greater of the clock's and the session's cluster time.
    pub(crate) fn add_cluster_time(
        &self,
        command: &mut Document,
        description: &ServerDescription,
        session: Option<&ClientSession>,
    ) -> Result<()> {
        if !description.supports_cluster_time() {
            return Ok(());
        }
        let cluster_time = max_cluster_time(
            self.clock.as_ref().and_then(|clock| clock.get()),
            session.and_then(ClientSession::cluster_time),
        );
        if let Some(cluster_time) = cluster_time {
            command.insert("$clusterTime", bson::to_document(&cluster_time)?);
        }
        Ok(())
    }
}

/// The `$readPreference` document for a command, or `None` when it should be left out.
pub(crate) fn create_read_pref(
    read_preference: Option<&ReadPreference>,
    server_type: ServerType,
    topology_type: TopologyType,
    is_op_query: bool,
) -> Result<Option<Document>> {
    let Some(read_preference) = read_preference else {
        if topology_type == TopologyType::Single && server_type != ServerType::Mongos {
            return Ok(Some(doc! { "mode": "primaryPreferred" }));
        }
        return Ok(None);
    };

    match read_preference {
        ReadPreference::Primary => {
            if server_type == ServerType::Mongos {
                return Ok(None);
            }
            if topology_type == TopologyType::Single {
                return Ok(Some(doc! { "mode": "primaryPreferred" }));
            }
        }
        ReadPreference::SecondaryPreferred { .. } => {
            let has_tags = read_preference
                .tag_sets()
                .is_some_and(|tag_sets| !tag_sets.is_empty());
            if server_type == ServerType::Mongos
                && is_op_query
                && !has_tags
                && read_preference.max_staleness().is_none()
            {
                return Ok(None);
            }
        }
        _ => {}
    }

    read_preference.to_document().map(Some)
}

/// The OP_QUERY flags for a command: `SecondaryOk` when talking directly to a non-mongos
/// server, or when the read preference allows secondaries.
pub(crate) fn secondary_ok(
    read_preference: Option<&ReadPreference>,
    server: &SelectedServer,
) -> QueryFlags {
    let direct = server.topology_type() == TopologyType::Single
        && server.description().server_type != ServerType::Mongos;
    let non_primary = read_preference.is_some_and(|rp| rp != &ReadPreference::Primary);

    if direct || non_primary {
        QueryFlags::SECONDARY_OK
    } else {
        QueryFlags::empty()
    }
}
