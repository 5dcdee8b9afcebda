//! ecugwd - ECU gateway daemon
//!
//! Routes traffic between the vehicle networks, keeps the ECU registry
//! current and runs firmware update sessions.
//!
//! Usage:
//!   ecugwd [OPTIONS] [gateway.toml]
//!
//! If no config file is provided, a three-ECU demo setup on the mock
//! channel is used.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ecugw_can::{create_channel, create_key_service, provision_keys, Gateway, GatewayConfig};
use ecugw_core::{EcuId, FileStorage, Storage, TracingConsole};

const DEMO_CONFIG: &str = r#"
[[ecus]]
protocol = "can-fd"
interface = 0
secure = true

[[ecus]]
protocol = "can"
interface = 1

[[ecus]]
protocol = "can"
interface = 2
endianness = "little"

[[routes]]
index = 0
label = "vehicle_speed"
destinations = [1, 2]

[transport]
type = "mock"
"#;

#[derive(Parser, Debug)]
#[command(name = "ecugwd")]
#[command(about = "ECU gateway daemon")]
struct Args {
    /// Gateway configuration file (TOML)
    config: Option<PathBuf>,

    /// Start a firmware update for this ECU id once running
    #[arg(long, requires = "image")]
    update: Option<u8>,

    /// Firmware image name in the storage directory
    #[arg(long)]
    image: Option<String>,

    /// Use secure (encrypted) update mode
    #[arg(long)]
    secure: bool,

    /// Print the ECU registry after startup
    #[arg(long)]
    print_registry: bool,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "ecugwd=debug,ecugw_can=debug,ecugw_she=debug,ecugw_core=debug"
    } else {
        "ecugwd=info,ecugw_can=info,ecugw_she=info,ecugw_core=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ecugwd (ECU gateway daemon)");

    let config = match &args.config {
        Some(path) => {
            tracing::info!("Loading config from: {}", path.display());
            GatewayConfig::load(path)?
        }
        None => {
            tracing::info!("No config file provided, using mock demo setup");
            GatewayConfig::from_toml_str(DEMO_CONFIG)?
        }
    };

    tokio::fs::create_dir_all(&config.storage.dir)
        .await
        .with_context(|| format!("Cannot create {}", config.storage.dir.display()))?;
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(config.storage.dir.clone()));

    let channel = create_channel(&config.transport).await?;

    let keys = create_key_service(&config.she)?;
    let provisioned = provision_keys(&keys, &config.she).await?;
    if provisioned > 0 {
        tracing::info!("Provisioned {} keys", provisioned);
    }

    let gateway = Gateway::start(&config, channel, storage, Some(keys)).await?;

    if args.print_registry {
        gateway.print_registry(&TracingConsole);
    }

    if let (Some(ecu), Some(image)) = (args.update, args.image.as_deref()) {
        let handle = gateway.start_update(EcuId(ecu), image, args.secure)?;
        tracing::info!(session = %handle.session_id(), ecu, image, "Firmware update requested");
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(report) => tracing::info!(
                    ecu = %report.ecu,
                    chunks = report.chunks,
                    bytes = report.bytes,
                    padded = report.padded,
                    "Firmware update finished"
                ),
                Err(e) => tracing::error!(ecu, error = %e, "Firmware update failed"),
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    let stored = gateway.shutdown().await?;
    tracing::info!("Stored {} ECU records", stored);

    Ok(())
}
