use std::sync::Arc;

use typed_builder::TypedBuilder;

use super::{Operation, RetryType};
use crate::{
    bson::Document,
    concern::WriteConcern,
    context::Context,
    error::Result,
    sdam::SelectedServer,
};

/// Drops a collection. Dropping a collection that does not exist succeeds.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct DropCollection {
    /// The database the collection is in.
    pub db: String,

    /// The name of the collection.
    pub name: String,

    /// The write concern for the drop. Falls back to the one configured on the target
    /// operation.
    #[builder(default)]
    pub write_concern: Option<WriteConcern>,
}

impl DropCollection {
    /// Drops the collection using the deployment, session and clock configured on `target`.
    pub async fn execute(&self, ctx: &Context, target: &Operation) -> Result<()> {
        let name = self.name.clone();
        let mut op = target.clone();
        op.command = Some(Arc::new(move |dst: &mut Document, _: &SelectedServer| {
            dst.insert("drop", name.clone());
            Ok(())
        }));
        op.database = Some(self.db.clone());
        op.retry_type = RetryType::None;
        op.gated_write_concern = true;
        if self.write_concern.is_some() {
            op.write_concern = self.write_concern.clone();
        }

        match op.execute(ctx).await {
            Ok(_) => Ok(()),
            Err(error) if error.is_ns_not_found() => Ok(()),
            Err(error) => Err(error),
        }
    }
}
