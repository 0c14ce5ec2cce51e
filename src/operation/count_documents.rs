use std::sync::Arc;

use serde::Deserialize;
use typed_builder::TypedBuilder;

use super::{Operation, RetryType};
use crate::{
    bson::{doc, Document},
    context::Context,
    error::{Error, Result},
    sdam::SelectedServer,
    serde_util,
};

/// Counts the documents in a collection that match a filter, using an aggregation that groups
/// every matching document into a single count.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct CountDocuments {
    /// The database the collection is in.
    pub db: String,

    /// The name of the collection.
    pub collection: String,

    /// Only documents matching this filter are counted.
    #[builder(default)]
    pub filter: Document,

    /// The number of matching documents to skip before counting.
    #[builder(default)]
    pub skip: Option<u64>,

    /// The maximum number of documents to count.
    #[builder(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Response {
    cursor: CursorBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorBody {
    first_batch: Vec<Body>,
}

#[derive(Debug, Deserialize)]
struct Body {
    #[serde(deserialize_with = "serde_util::deserialize_u64_from_bson_number")]
    n: u64,
}

impl CountDocuments {
    pub(crate) fn pipeline(&self) -> Result<Vec<Document>> {
        let mut pipeline = vec![doc! { "$match": self.filter.clone() }];

        if let Some(skip) = self.skip {
            let skip = i64::try_from(skip).map_err(|_| {
                Error::invalid_argument(format!("skip exceeds range of i64: {skip}"))
            })?;
            pipeline.push(doc! { "$skip": skip });
        }

        if let Some(limit) = self.limit {
            let limit = i64::try_from(limit).map_err(|_| {
                Error::invalid_argument(format!("limit exceeds range of i64: {limit}"))
            })?;
            pipeline.push(doc! { "$limit": limit });
        }

        pipeline.push(doc! {
            "$group": {
                "_id": 1,
                "n": { "$sum": 1 },
            }
        });
        Ok(pipeline)
    }

    /// Counts the documents using the deployment, session and clock configured on `target`.
    pub async fn execute(&self, ctx: &Context, target: &Operation) -> Result<u64> {
        let pipeline = self.pipeline()?;
        let collection = self.collection.clone();
        let mut op = target.clone();
        op.command = Some(Arc::new(move |dst: &mut Document, _: &SelectedServer| {
            dst.insert("aggregate", collection.clone());
            dst.insert("pipeline", pipeline.clone());
            dst.insert("cursor", Document::new());
            Ok(())
        }));
        op.database = Some(self.db.clone());
        op.retry_type = RetryType::Read;

        let response: Response = op.execute_typed(ctx).await?;
        Ok(response
            .cursor
            .first_batch
            .first()
            .map(|body| body.n)
            .unwrap_or(0))
    }
}
