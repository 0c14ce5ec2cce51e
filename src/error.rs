//! Errors returned by pools and operations, with the labels servers and the engine attach.

use std::{
    collections::HashSet,
    fmt,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bson::Document;

/// Server error codes after which both reads and writes may be attempted again.
const RETRYABLE_CODES: [i32; 12] = [
    6,     // HostUnreachable
    7,     // HostNotFound
    89,    // NetworkTimeout
    91,    // ShutdownInProgress
    189,   // PrimarySteppedDown
    262,   // ExceededTimeLimit
    9001,  // SocketException
    10107, // NotWritablePrimary
    11600, // InterruptedAtShutdown
    11602, // InterruptedDueToReplStateChange
    13435, // NotPrimaryNoSecondaryOk
    13436, // NotPrimaryOrSecondary
];

/// ReadConcernMajorityNotAvailableYet, retryable for reads only.
const READ_CONCERN_MAJORITY_NOT_AVAILABLE_YET: i32 = 134;

const NAMESPACE_NOT_FOUND: i32 = 26;

/// Attached by servers to errors after which a write may be sent again.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Attached to every failed round trip; the transaction it belonged to may be retried whole.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
/// Network error label. Added alongside [`TRANSIENT_TRANSACTION_ERROR`] when a round trip fails.
pub const NETWORK_ERROR: &str = "NetworkError";

/// Shorthand for results carrying this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A failure together with its labels. An error wrapping another keeps it as its source, and
/// labels and codes are looked up along that chain.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// What went wrong.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,

    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        Self {
            kind: Box::new(kind),
            labels,
            source: None,
        }
    }

    /// Wraps a failure that occurred while writing or reading a wire message. The resulting
    /// error always carries exactly the [`TRANSIENT_TRANSACTION_ERROR`] and [`NETWORK_ERROR`]
    /// labels, and keeps `cause` as its source.
    pub(crate) fn network(cause: Error) -> Self {
        let mut error = Error::new(
            ErrorKind::Network {
                message: cause.kind.to_string(),
            },
            Some([
                TRANSIENT_TRANSACTION_ERROR.to_string(),
                NETWORK_ERROR.to_string(),
            ]),
        );
        error.source = Some(Box::new(cause));
        error
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    /// An error reported by `Operation::validate` naming the field that must be set.
    pub(crate) fn missing_field(field: &'static str) -> Error {
        ErrorKind::InvalidOperation {
            missing_field: field,
        }
        .into()
    }

    pub(crate) fn server_selection(message: impl Into<String>) -> Error {
        ErrorKind::ServerSelection {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn transaction(message: impl Into<String>) -> Error {
        ErrorKind::Transaction {
            message: message.into(),
        }
        .into()
    }

    /// Whether this error was produced by a cancelled or expired [`Context`](crate::Context).
    pub fn is_context_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Context(_))
    }

    /// Whether this error is the signal returned for an unacknowledged write.
    pub fn is_unacknowledged_write(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::UnacknowledgedWrite)
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::Network { .. } | ErrorKind::ConnectionClosed
        )
    }

    /// A command failure with code 26, NamespaceNotFound.
    pub(crate) fn is_ns_not_found(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(err) if err.code == NAMESPACE_NOT_FOUND)
    }

    pub(crate) fn is_read_retryable(&self) -> bool {
        self.is_network_error()
            || self.code().is_some_and(|code| {
                code == READ_CONCERN_MAJORITY_NOT_AVAILABLE_YET || RETRYABLE_CODES.contains(&code)
            })
    }

    pub(crate) fn is_write_retryable(&self) -> bool {
        self.is_network_error()
            || self.contains_label(RETRYABLE_WRITE_ERROR)
            || self.code().is_some_and(|code| RETRYABLE_CODES.contains(&code))
    }

    /// This error and the errors it wraps, outermost first.
    fn chain(&self) -> impl Iterator<Item = &Error> {
        std::iter::successors(Some(self), |error| error.source.as_deref())
    }

    /// The server error code of the first error in the chain that has one.
    pub fn code(&self) -> Option<i32> {
        self.chain().find_map(|error| match error.kind.as_ref() {
            ErrorKind::Command(err) | ErrorKind::WriteConcern(err) => Some(err.code),
            _ => None,
        })
    }

    /// The labels attached to this error itself, not to its sources.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error or any error it wraps carries `label`.
    pub fn contains_label(&self, label: impl AsRef<str>) -> bool {
        let label = label.as_ref();
        self.chain().any(|error| error.labels.contains(label))
    }

    pub(crate) fn add_label(&mut self, label: impl Into<String>) {
        self.labels.insert(label.into());
    }

    pub(crate) fn with_source<E: Into<Option<Error>>>(mut self, source: E) -> Self {
        self.source = source.into().map(Box::new);
        self
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

impl From<ContextError> for ErrorKind {
    fn from(err: ContextError) -> Self {
        Self::Context(err)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The kinds of failure an [`Error`] can describe.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An operation was executed without one of its required fields.
    #[error("the Operation must have a {missing_field} set before Execute can be called")]
    #[non_exhaustive]
    InvalidOperation { missing_field: &'static str },

    /// An option or argument was rejected before anything was sent.
    #[error("invalid argument: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// A reply could not be decoded.
    #[error("{0}")]
    BsonDeserialization(bson::de::Error),

    /// A command could not be encoded.
    #[error("{0}")]
    BsonSerialization(bson::ser::Error),

    /// The server answered with `ok: 0`.
    #[error("command failed: {0}")]
    Command(CommandError),

    /// The server reported that a write concern could not be satisfied.
    #[error("write concern failed: {0}")]
    WriteConcern(CommandError),

    /// The [`Context`](crate::Context) governing the call was cancelled or expired.
    #[error("{0}")]
    Context(ContextError),

    #[error("internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Dialing or socket I/O failed.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Writing or reading a wire message failed.
    #[error("{message}")]
    #[non_exhaustive]
    Network { message: String },

    /// The connection was closed, either by the pool or after an interrupted I/O.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The pool is already connected.
    #[error("pool is connected")]
    PoolConnected,

    /// The pool is disconnected or disconnecting.
    #[error("pool is disconnected or disconnecting")]
    PoolDisconnected,

    /// A connection was handed to a pool that did not create it.
    #[error("connection does not belong to this pool")]
    WrongPool,

    /// A reply was well-formed BSON but not what the operation expected.
    #[error("invalid reply: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// No server matched the selection criteria.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// An operation conflicted with the session's transaction.
    #[error("{message}")]
    #[non_exhaustive]
    Transaction { message: String },

    /// A session was used after it had been ended.
    #[error("ended session was used")]
    SessionEnded,

    /// Returned immediately by writes with an unacknowledged write concern. The write itself is
    /// still in flight.
    #[error("unacknowledged write")]
    UnacknowledgedWrite,
}

/// The cause of a [`Context`](crate::Context) firing.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum ContextError {
    /// The context was explicitly cancelled.
    #[error("context canceled")]
    Canceled,

    /// The context's deadline elapsed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// The code, code name and message of a failed command.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// The numeric code, e.g. 26.
    #[serde(default)]
    pub code: i32,

    /// The code's name, e.g. `NamespaceNotFound`.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// The server's `errmsg`.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}) {}: {}", self.code, self.code_name, self.message)
    }
}

/// The shape of a reply with `ok: 0`.
#[derive(Deserialize, Debug)]
pub(crate) struct CommandErrorBody {
    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,

    #[serde(flatten)]
    pub(crate) command_error: CommandError,
}

impl From<CommandErrorBody> for Error {
    fn from(body: CommandErrorBody) -> Error {
        Error::new(ErrorKind::Command(body.command_error), body.error_labels)
    }
}

/// The `writeConcernError` subdocument of an otherwise successful reply.
#[derive(Deserialize, Debug)]
pub(crate) struct WriteConcernErrorBody {
    #[serde(rename = "writeConcernError")]
    pub(crate) write_concern_error: Option<Document>,

    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn network_error_labels() {
        let cause: Error = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        let error = Error::network(cause);

        let mut labels: Vec<_> = error.labels().iter().cloned().collect();
        labels.sort();
        assert_eq!(labels, vec![NETWORK_ERROR, TRANSIENT_TRANSACTION_ERROR]);
        assert!(error.is_network_error());
        assert!(error.is_read_retryable());
        assert!(error.is_write_retryable());
    }

    #[test]
    fn command_error_retryability() {
        let body = CommandErrorBody {
            error_labels: None,
            command_error: CommandError {
                code: 134,
                code_name: "ReadConcernMajorityNotAvailableYet".to_string(),
                message: String::new(),
            },
        };
        let error = Error::from(body);
        assert!(error.is_read_retryable());
        assert!(!error.is_write_retryable());

        let body = CommandErrorBody {
            error_labels: Some(vec![RETRYABLE_WRITE_ERROR.to_string()]),
            command_error: CommandError {
                code: 2,
                code_name: "BadValue".to_string(),
                message: String::new(),
            },
        };
        let error = Error::from(body);
        assert!(!error.is_read_retryable());
        assert!(error.is_write_retryable());
    }

    #[test]
    fn labels_from_source() {
        let mut source = Error::internal("inner");
        source.add_label("Inner");
        let error = Error::internal("outer").with_source(source);
        assert!(error.contains_label("Inner"));
        assert!(error.labels().is_empty());
    }

    #[test]
    fn missing_field_message() {
        let error = Error::missing_field("Deployment");
        assert_eq!(
            error.kind.to_string(),
            "the Operation must have a Deployment set before Execute can be called"
        );
    }
}
