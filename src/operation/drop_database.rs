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

/// Drops a database and every collection in it.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct DropDatabase {
    /// The database to drop.
    pub db: String,

    /// Sent only to servers with wire version 5 or later. Falls back to the one configured on
    /// the target operation.
    #[builder(default)]
    pub write_concern: Option<WriteConcern>,
}

impl DropDatabase {
    /// Drops the database using the deployment, session and clock configured on `target`.
    pub async fn execute(&self, ctx: &Context, target: &Operation) -> Result<()> {
        let mut op = target.clone();
        op.command = Some(Arc::new(|dst: &mut Document, _: &SelectedServer| {
            dst.insert("dropDatabase", 1);
            Ok(())
        }));
        op.database = Some(self.db.clone());
        op.retry_type = RetryType::None;
        op.gated_write_concern = true;
        if self.write_concern.is_some() {
            op.write_concern = self.write_concern.clone();
        }

        op.execute(ctx).await.map(|_| ())
    }
}
