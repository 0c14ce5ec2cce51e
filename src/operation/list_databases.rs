use std::sync::Arc;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::{Operation, RetryType};
use crate::{
    bson::{doc, Document},
    context::Context,
    error::Result,
    sdam::SelectedServer,
    selection_criteria::ReadPreference,
    serde_util,
};

/// Lists the databases of a deployment. Always runs against `admin` on the primary.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ListDatabases {
    /// Restricts the databases returned.
    pub filter: Option<Document>,

    /// Returns only the database names, without sizes.
    pub name_only: Option<bool>,

    /// Lets users without the `listDatabases` privilege see the databases they can access.
    pub authorized_databases: Option<bool>,
}

/// One entry of a `listDatabases` reply.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DatabaseSpecification {
    /// The name of the database.
    pub name: String,

    /// The amount of disk space the database uses, in bytes. Zero when only names were
    /// requested.
    #[serde(default, deserialize_with = "serde_util::deserialize_u64_from_bson_number")]
    pub size_on_disk: u64,

    /// Whether the database holds no data.
    #[serde(default)]
    pub empty: bool,

    /// For sharded clusters, the size of the database on each shard.
    pub shards: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct Response {
    databases: Vec<DatabaseSpecification>,
}

impl ListDatabases {
    fn command(&self) -> Document {
        let mut body = doc! { "listDatabases": 1 };
        if let Some(ref filter) = self.filter {
            body.insert("filter", filter.clone());
        }
        if let Some(name_only) = self.name_only {
            body.insert("nameOnly", name_only);
        }
        if let Some(authorized_databases) = self.authorized_databases {
            body.insert("authorizedDatabases", authorized_databases);
        }
        body
    }

    /// Lists the databases using the deployment, session and clock configured on `target`.
    pub async fn execute(
        &self,
        ctx: &Context,
        target: &Operation,
    ) -> Result<Vec<DatabaseSpecification>> {
        let command = self.command();
        let mut op = target.clone();
        op.command = Some(Arc::new(move |dst: &mut Document, _: &SelectedServer| {
            dst.extend(command.clone());
            Ok(())
        }));
        op.database = Some("admin".to_string());
        op.read_preference = Some(ReadPreference::Primary);
        op.selector = None;
        op.retry_type = RetryType::Read;

        let response: Response = op.execute_typed(ctx).await?;
        Ok(response.databases)
    }
}
