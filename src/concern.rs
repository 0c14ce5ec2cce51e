//! Read and write concerns.


use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson::Timestamp,
    error::{Error, Result},
    serde_util,
};

/// The consistency and isolation guarantees requested for reads.
///
/// A read concern without a level stands for the server's default and is never sent.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[non_exhaustive]
pub struct ReadConcern {
    /// The requested level.
    pub level: Option<ReadConcernLevel>,
}

impl ReadConcern {
    /// Level `majority`.
    pub fn majority() -> Self {
        ReadConcernLevel::Majority.into()
    }

    /// Level `local`.
    pub fn local() -> Self {
        ReadConcernLevel::Local.into()
    }

    /// Level `linearizable`.
    pub fn linearizable() -> Self {
        ReadConcernLevel::Linearizable.into()
    }

    /// Level `available`.
    pub fn available() -> Self {
        ReadConcernLevel::Available.into()
    }

    /// Level `snapshot`.
    pub fn snapshot() -> Self {
        ReadConcernLevel::Snapshot.into()
    }

    /// A level this crate has no variant for.
    pub fn custom(level: impl Into<String>) -> Self {
        ReadConcernLevel::from(level.into()).into()
    }

    /// Whether no level was requested.
    pub fn is_default(&self) -> bool {
        self.level.is_none()
    }
}

impl From<ReadConcernLevel> for ReadConcern {
    fn from(level: ReadConcernLevel) -> Self {
        Self { level: Some(level) }
    }
}

/// The `readConcern` document written into a command: the configured level plus, for causally
/// consistent sessions, the session's operation time.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CommandReadConcern {
    pub(crate) level: Option<ReadConcernLevel>,

    pub(crate) after_cluster_time: Option<Timestamp>,
}

impl CommandReadConcern {
    pub(crate) fn is_empty(&self) -> bool {
        self.level.is_none() && self.after_cluster_time.is_none()
    }
}

/// A read concern level.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
#[non_exhaustive]
pub enum ReadConcernLevel {
    /// The most recent data on the queried node.
    Local,

    /// Data acknowledged by a majority of the replica set.
    Majority,

    /// Data reflecting every majority-acknowledged write that completed before the read.
    Linearizable,

    /// Like `Local`, without shard ownership checks.
    Available,

    /// A majority-committed snapshot.
    Snapshot,

    /// Any other level, passed through as given.
    Custom(String),
}

const LEVEL_NAMES: [(ReadConcernLevel, &str); 5] = [
    (ReadConcernLevel::Local, "local"),
    (ReadConcernLevel::Majority, "majority"),
    (ReadConcernLevel::Linearizable, "linearizable"),
    (ReadConcernLevel::Available, "available"),
    (ReadConcernLevel::Snapshot, "snapshot"),
];

impl ReadConcernLevel {
    /// The name the server knows this level by.
    pub fn as_str(&self) -> &str {
        if let Self::Custom(name) = self {
            return name;
        }
        LEVEL_NAMES
            .iter()
            .find_map(|(level, name)| (level == self).then_some(*name))
            .unwrap_or_default()
    }
}

impl From<String> for ReadConcernLevel {
    fn from(name: String) -> Self {
        LEVEL_NAMES
            .iter()
            .find_map(|(level, known)| (*known == name).then(|| level.clone()))
            .unwrap_or(Self::Custom(name))
    }
}

impl From<ReadConcernLevel> for String {
    fn from(level: ReadConcernLevel) -> Self {
        match level {
            ReadConcernLevel::Custom(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

/// How many acknowledgements the server must collect before reporting a write as done.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct WriteConcern {
    /// The nodes, or kind of nodes, that must acknowledge the write.
    pub w: Option<Acknowledgment>,

    /// How long the server waits for the acknowledgements before failing the write.
    #[serde(
        rename = "wtimeout",
        alias = "wtimeoutMS",
        with = "serde_util::duration_option_as_millis",
        default
    )]
    pub w_timeout: Option<Duration>,

    /// Whether the write must reach the on-disk journal.
    #[serde(rename = "j", alias = "journal")]
    pub journal: Option<bool>,
}

impl WriteConcern {
    /// `w` set to a node count. A count of 0 makes writes unacknowledged.
    pub fn nodes(count: u32) -> Self {
        Acknowledgment::Nodes(count).into()
    }

    /// `w: "majority"`.
    pub fn majority() -> Self {
        Acknowledgment::Majority.into()
    }

    /// `w` set to a named tag set.
    pub fn custom(tag: impl Into<String>) -> Self {
        Acknowledgment::from(tag.into()).into()
    }

    /// Whether the server replies to writes made with this concern. Only `w: 0` without
    /// journaling goes unanswered.
    pub fn is_acknowledged(&self) -> bool {
        !self.is_w_zero() || self.journal == Some(true)
    }

    /// Whether nothing was set, leaving the server's default in effect.
    pub(crate) fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Rejects `w: 0` combined with `j: true`.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.is_w_zero() && self.journal == Some(true) {
            return Err(Error::invalid_argument(
                "write concern cannot have w=0 and j=true",
            ));
        }
        Ok(())
    }

    fn is_w_zero(&self) -> bool {
        self.w == Some(Acknowledgment::Nodes(0))
    }
}

impl From<Acknowledgment> for WriteConcern {
    fn from(w: Acknowledgment) -> Self {
        Self {
            w: Some(w),
            ..Default::default()
        }
    }
}

/// The `w` field of a [`WriteConcern`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "AcknowledgmentRepr", into = "AcknowledgmentRepr")]
#[non_exhaustive]
pub enum Acknowledgment {
    /// This many nodes, the primary included.
    Nodes(u32),

    /// A majority of voting nodes.
    Majority,

    /// The nodes matching a custom write concern defined on the replica set.
    Custom(String),
}

/// `w` on the wire: a 32-bit count or a name.
#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum AcknowledgmentRepr {
    Nodes(i32),
    Name(String),
}

impl TryFrom<AcknowledgmentRepr> for Acknowledgment {
    type Error = String;

    fn try_from(repr: AcknowledgmentRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            AcknowledgmentRepr::Nodes(count) => u32::try_from(count)
                .map(Self::Nodes)
                .map_err(|_| format!("w must not be negative, got {count}")),
            AcknowledgmentRepr::Name(name) => Ok(name.into()),
        }
    }
}

impl From<Acknowledgment> for AcknowledgmentRepr {
    fn from(w: Acknowledgment) -> Self {
        match w {
            Acknowledgment::Nodes(count) => {
                Self::Nodes(i32::try_from(count).unwrap_or(i32::MAX))
            }
            Acknowledgment::Majority => Self::Name("majority".to_string()),
            Acknowledgment::Custom(name) => Self::Name(name),
        }
    }
}

impl From<u32> for Acknowledgment {
    fn from(count: u32) -> Self {
        Self::Nodes(count)
    }
}

impl From<String> for Acknowledgment {
    fn from(name: String) -> Self {
        match name.as_str() {
            "majority" => Self::Majority,
            _ => Self::Custom(name),
        }
    }
}

impl From<&str> for Acknowledgment {
    fn from(name: &str) -> Self {
        name.to_string().into()
    }
}
