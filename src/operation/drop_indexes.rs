use std::{sync::Arc, time::Duration};

use typed_builder::TypedBuilder;

use super::{Operation, RetryType};
use crate::{
    bson::Document,
    concern::WriteConcern,
    context::Context,
    error::{Error, Result},
    sdam::SelectedServer,
};

/// Drops one index of a collection, or all of them but `_id` when the index is `"*"`.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct DropIndexes {
    /// The database the collection is in.
    pub db: String,

    /// The name of the collection.
    pub collection: String,

    /// The index name, or `"*"`.
    pub index: String,

    /// Sent as `maxTimeMS`.
    #[builder(default)]
    pub max_time: Option<Duration>,

    /// Sent only to servers with wire version 5 or later.
    #[builder(default)]
    pub write_concern: Option<WriteConcern>,
}

impl DropIndexes {
    /// Drops the index using the deployment, session and clock configured on `target`, and
    /// returns the server's reply.
    pub async fn execute(&self, ctx: &Context, target: &Operation) -> Result<Document> {
        let max_time_ms = self
            .max_time
            .map(|max_time| {
                i64::try_from(max_time.as_millis()).map_err(|_| {
                    Error::invalid_argument(format!("max time out of range: {max_time:?}"))
                })
            })
            .transpose()?;

        let collection = self.collection.clone();
        let index = self.index.clone();
        let mut op = target.clone();
        op.command = Some(Arc::new(move |dst: &mut Document, _: &SelectedServer| {
            dst.insert("dropIndexes", collection.clone());
            dst.insert("index", index.clone());
            if let Some(max_time_ms) = max_time_ms {
                dst.insert("maxTimeMS", max_time_ms);
            }
            Ok(())
        }));
        op.database = Some(self.db.clone());
        op.retry_type = RetryType::None;
        op.gated_write_concern = true;
        if self.write_concern.is_some() {
            op.write_concern = self.write_concern.clone();
        }

        op.execute(ctx).await
    }
}
