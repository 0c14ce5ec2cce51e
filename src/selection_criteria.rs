use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use derive_where::derive_where;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    bson::Document,
    error::{Error, Result},
    options::ServerAddress,
    sdam::ServerDescription,
    serde_util,
};

/// Decides which servers may run an operation.
#[derive(Clone, derive_more::Display)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// Servers are chosen by type and tags according to a read preference.
    #[display("read preference {_0}")]
    ReadPreference(ReadPreference),

    /// Servers for which the predicate returns true are suitable.
    #[display("predicate")]
    Predicate(#[derive_where(skip)] Predicate),
}

/// Predicates never compare equal, not even to themselves.
impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(a), Self::ReadPreference(b)) => a == b,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_preference: ReadPreference) -> Self {
        Self::ReadPreference(read_preference)
    }
}

impl SelectionCriteria {
    /// Criteria matching only the server at `address`.
    pub(crate) fn from_address(address: ServerAddress) -> Self {
        Self::Predicate(Arc::new(move |server| server.address == address))
    }
}

/// A filter over server descriptions.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerDescription) -> bool>;

/// A set of tags a server must carry, all of them, to match.
pub type TagSet = HashMap<String, String>;

/// Where reads may be routed within a replica set or sharded cluster.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "ReadPreferenceDocument", into = "ReadPreferenceDocument")]
#[non_exhaustive]
pub enum ReadPreference {
    /// The primary only.
    Primary,

    /// Secondaries only.
    Secondary {
        options: Option<ReadPreferenceOptions>,
    },

    /// The primary, or a secondary when there is no primary.
    PrimaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// A secondary, or the primary when no secondary is suitable.
    SecondaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Any data-bearing member.
    Nearest {
        options: Option<ReadPreferenceOptions>,
    },
}

/// Tags and staleness bounds for a non-primary [`ReadPreference`].
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Tried in order; the first tag set that matches any server decides the candidates.
    pub tag_sets: Option<Vec<TagSet>>,

    /// How far a secondary may lag behind the primary and still be used. Sent as whole seconds.
    pub max_staleness: Option<Duration>,
}

impl ReadPreferenceOptions {
    /// No tags beyond the match-anything `[{}]`, and no staleness bound.
    fn is_unrestricted(&self) -> bool {
        self.max_staleness.is_none()
            && self
                .tag_sets
                .as_deref()
                .map_or(true, |tag_sets| tag_sets.iter().all(TagSet::is_empty))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
enum Mode {
    Primary,
    Secondary,
    PrimaryPreferred,
    SecondaryPreferred,
    Nearest,
}

/// A read preference as the server reads it.
#[serde_with::skip_serializing_none]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ReadPreferenceDocument {
    mode: Mode,

    tags: Option<Vec<TagSet>>,

    #[serde(
        rename = "maxStalenessSeconds",
        default,
        with = "serde_util::duration_option_as_secs"
    )]
    max_staleness: Option<Duration>,
}

impl TryFrom<ReadPreferenceDocument> for ReadPreference {
    type Error = String;

    fn try_from(document: ReadPreferenceDocument) -> std::result::Result<Self, String> {
        let options = ReadPreferenceOptions {
            tag_sets: document.tags,
            max_staleness: document.max_staleness,
        };
        let restricted = !options.is_unrestricted();
        let options = (options != ReadPreferenceOptions::default()).then_some(options);

        Ok(match document.mode {
            Mode::Primary if restricted => {
                return Err(
                    "a primary read preference cannot have tags or a max staleness".to_string(),
                )
            }
            Mode::Primary => Self::Primary,
            Mode::Secondary => Self::Secondary { options },
            Mode::PrimaryPreferred => Self::PrimaryPreferred { options },
            Mode::SecondaryPreferred => Self::SecondaryPreferred { options },
            Mode::Nearest => Self::Nearest { options },
        })
    }
}

impl From<ReadPreference> for ReadPreferenceDocument {
    fn from(read_preference: ReadPreference) -> Self {
        let mode = read_preference.mode();
        let options = read_preference.options().cloned().unwrap_or_default();
        Self {
            mode,
            tags: options.tag_sets,
            max_staleness: options.max_staleness,
        }
    }
}

impl Display for ReadPreference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mode_name())?;
        if let Some(tags) = self.tag_sets() {
            write!(f, " tags={tags:?}")?;
        }
        if let Some(max_staleness) = self.max_staleness() {
            write!(f, " maxStaleness={}s", max_staleness.as_secs())?;
        }
        Ok(())
    }
}

impl ReadPreference {
    fn mode(&self) -> Mode {
        match self {
            Self::Primary => Mode::Primary,
            Self::Secondary { .. } => Mode::Secondary,
            Self::PrimaryPreferred { .. } => Mode::PrimaryPreferred,
            Self::SecondaryPreferred { .. } => Mode::SecondaryPreferred,
            Self::Nearest { .. } => Mode::Nearest,
        }
    }

    fn mode_name(&self) -> &'static str {
        match self.mode() {
            Mode::Primary => "primary",
            Mode::Secondary => "secondary",
            Mode::PrimaryPreferred => "primaryPreferred",
            Mode::SecondaryPreferred => "secondaryPreferred",
            Mode::Nearest => "nearest",
        }
    }

    fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => options.as_ref(),
        }
    }

    fn options_mut(&mut self) -> Result<&mut ReadPreferenceOptions> {
        match self {
            Self::Primary => Err(Error::invalid_argument(
                "tags and max staleness require a non-primary read preference",
            )),
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => Ok(options.get_or_insert_with(Default::default)),
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|options| options.max_staleness)
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|options| options.tag_sets.as_ref())
    }

    /// The `$readPreference` document for this read preference.
    pub(crate) fn to_document(&self) -> Result<Document> {
        Ok(bson::to_document(self)?)
    }

    /// Restricts a non-primary read preference to servers matching `tag_sets`.
    pub fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        self.options_mut()?.tag_sets = Some(tag_sets);
        Ok(self)
    }

    /// Bounds how stale a secondary chosen by a non-primary read preference may be.
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        self.options_mut()?.max_staleness = Some(max_staleness);
        Ok(self)
    }
}
