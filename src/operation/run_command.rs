use std::sync::Arc;

use typed_builder::TypedBuilder;

use super::Operation;
use crate::{
    bson::Document,
    context::Context,
    error::{Error, Result},
    sdam::SelectedServer,
    selection_criteria::ReadPreference,
};

/// Runs an arbitrary command and returns the server's reply unchanged.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct RunCommand {
    /// The database to run the command against.
    pub db: String,

    /// The command document. Its first key names the command.
    pub command: Document,

    /// The read preference for the command. Commands go to the primary when unset.
    #[builder(default)]
    pub read_preference: Option<ReadPreference>,
}

impl RunCommand {
    /// Runs the command using the deployment, session and clock configured on `target`.
    pub async fn execute(&self, ctx: &Context, target: &Operation) -> Result<Document> {
        if self.command.is_empty() {
            return Err(Error::invalid_argument(
                "an empty document cannot be passed to a run_command operation",
            ));
        }

        let command = self.command.clone();
        let mut op = target.clone();
        op.command = Some(Arc::new(move |dst: &mut Document, _: &SelectedServer| {
            dst.extend(command.clone());
            Ok(())
        }));
        op.database = Some(self.db.clone());
        if self.read_preference.is_some() {
            op.read_preference = self.read_preference.clone();
        }

        op.execute(ctx).await
    }
}
