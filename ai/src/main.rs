use ai::district::bootstrap;
use ai::registry::TypeRegistry;
use ai::{AiConfig, AiError, AiRepository};
use clap::Parser;
use log::{error, info};
use shared::{Bridge, ClientChannelRange, Schema};
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

    /// First channel of this node's range
    #[arg(long, default_value_t = shared::AI_CHANNEL_MIN)]
    min_channel: u64,

    /// End of this node's channel range (exclusive)
    #[arg(long, default_value_t = shared::AI_CHANNEL_MAX)]
    max_channel: u64,

    /// First client channel
    #[arg(long, default_value_t = shared::CLIENT_CHANNEL_MIN)]
    client_min_channel: u64,

    /// Last client channel
    #[arg(long, default_value_t = shared::CLIENT_CHANNEL_MAX)]
    client_max_channel: u64,

    /// District name shown to players
    #[arg(short = 'n', long, default_value = "Sillyville")]
    district_name: String,
}

impl From<Args> for AiConfig {
    fn from(args: Args) -> Self {
        AiConfig {
            md_host: args.host,
            md_port: args.port,
            dclass_path: args.dclass,
            channel_min: args.min_channel,
            channel_max: args.max_channel,
            client_range: ClientChannelRange::new(args.client_min_channel, args.client_max_channel),
            district_name: args.district_name,
            ..AiConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AiConfig::from(Args::parse());

    info!("Loading dclass schema from {}", config.dclass_path.display());
    let schema = Arc::new(Schema::load(&config.dclass_path)?);
    info!(
        "Loaded schema version {} with {} classes",
        schema.version(),
        schema.classes().len()
    );
    let registry = TypeRegistry::standard(&schema, &config.district_class, &config.avatar_class);

    let bridge = Bridge::connect(&config.md_addr()).await?;
    let mut repo = AiRepository::new(config, schema, registry, bridge.outbox())?;
    bootstrap(&mut repo)?;

    match repo.run(bridge).await {
        Err(AiError::Bridge(e)) => {
            error!("{}, shutting down", e);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
        Ok(()) => Ok(()),
    }
}
