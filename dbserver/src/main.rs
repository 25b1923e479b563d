use clap::Parser;
use dbserver::backend::{self, BackendKind, IdRange};
use dbserver::{DbConfig, DbError, DbServer};
use log::{error, info};
use shared::{Bridge, DoId, Schema};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Message director host
    #[arg(short = 'H', long, default_value = shared::DEFAULT_MD_HOST)]
    host: String,

    /// Message director port
    #[arg(short, long, default_value_t = shared::DEFAULT_MD_PORT)]
    port: u16,

    /// Path to the dclass schema
    #[arg(short, long, default_value = "dclass/toon.json")]
    dclass: PathBuf,

    /// Storage engine
    #[arg(short, long, value_enum, default_value_t = BackendKind::Table)]
    backend: BackendKind,

    /// Directory holding the stored objects
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// First object id handed out
    #[arg(long, default_value_t = shared::DB_ID_MIN)]
    min_id: DoId,

    /// End of the object id range (exclusive)
    #[arg(long, default_value_t = shared::DB_ID_MAX)]
    max_id: DoId,

    /// Requests allowed to run against the storage engine at once
    #[arg(long, default_value_t = 4)]
    pool_size: usize,

    /// Class whose objects own avatar slots
    #[arg(long, default_value = "Account")]
    account_class: String,

    /// Class created into an account's avatar slots
    #[arg(long, default_value = "DistributedToon")]
    avatar_class: String,
}

impl From<Args> for DbConfig {
    fn from(args: Args) -> Self {
        DbConfig {
            md_host: args.host,
            md_port: args.port,
            dclass_path: args.dclass,
            backend: args.backend,
            data_dir: args.data_dir,
            id_range: IdRange {
                min: args.min_id,
                max: args.max_id,
            },
            pool_size: args.pool_size,
            account_class: args.account_class,
            avatar_class: args.avatar_class,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = DbConfig::from(Args::parse());

    info!("Loading dclass schema from {}", config.dclass_path.display());
    let schema = Arc::new(Schema::load(&config.dclass_path)?);

    info!(
        "Opening {:?} store in {} for ids [{}, {})",
        config.backend,
        config.data_dir.display(),
        config.id_range.min,
        config.id_range.max
    );
    let store = backend::open(config.backend, &config.data_dir, schema.clone(), config.id_range)?;

    let bridge = Bridge::connect(&config.md_addr()).await?;
    let mut server = DbServer::new(config, schema, store, bridge.outbox());
    server.start().await?;

    match server.run(bridge).await {
        Err(DbError::Bridge(e)) => {
            error!("{}, shutting down", e);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
        Ok(()) => Ok(()),
    }
}
