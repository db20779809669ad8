pub mod aggregator;
pub mod errors;
pub mod models;
pub mod snapshot;

pub use aggregator::MongoUsageAggregator;
pub use errors::MongoUsageError;
pub use snapshot::{SnapshotStore, UsageSnapshot};

use mongodb::options::ClientOptions;
use mongodb::{Client, Database};

use crate::settings::MongoSettings;

/// Builds a MongoDB connection string and client from settings, honoring
/// the configured credential source the way `config`-driven settings carry
/// it through the rest of the toolkit.
pub async fn connect(settings: &MongoSettings) -> anyhow::Result<Database> {
    let credentials = if let Some(var) = &settings.credential_env_var {
        std::env::var(var).ok()
    } else {
        None
    };
    let replica_set = settings
        .replica_set
        .as_ref()
        .map(|rs| format!("&replicaSet={rs}"))
        .unwrap_or_default();
    let uri = match credentials {
        Some(creds) => format!(
            "mongodb://{creds}@{}:{}/{}?authSource=admin{replica_set}",
            settings.host, settings.port, settings.database
        ),
        None => format!(
            "mongodb://{}:{}/{}?{replica_set}",
            settings.host, settings.port, settings.database
        ),
    };
    let options = ClientOptions::parse(&uri).await?;
    let client = Client::with_options(options)?;
    Ok(client.database(&settings.database))
}
