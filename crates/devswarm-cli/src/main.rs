//! `devswarm` — spins up a configurable fleet of virtual devices and
//! drives them from an interactive text menu.

mod cloud_client;
mod config;
mod keystore;
mod menu;

use std::sync::Arc;

use clap::Parser;
use cloud_client::CloudClient;
use config::Config;
use devswarm_core::identity::ServerIdentity;
use devswarm_core::DeviceFleet;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "devswarm", about = "Virtual IoT device load-generation harness")]
struct Cli {
    /// Directory holding configs.json and the keys/ subdirectory.
    #[arg(long, default_value = "./devswarm-data")]
    data_dir: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = Config::load(&cli.data_dir)?;
    config.save(&cli.data_dir)?;

    let cloud = CloudClient::new(config.cloud_api_base.clone());
    let server_identity = resolve_server_identity(&cloud).await?;

    let mut fleet = DeviceFleet::new(server_identity, config.server_addr.clone(), config.throttle_ms);
    for _ in 0..config.device_count {
        let identity = keystore::load_or_generate_identity(&cli.data_dir, None)?;
        let pem = identity.public_key_pem()?;
        let key = fleet.spawn(identity);
        cloud.claim_device(&key, &pem).await;
    }
    info!(devices = config.device_count, addr = %config.server_addr, "fleet ready");

    let fleet = Arc::new(Mutex::new(fleet));
    menu::run(fleet).await;
    Ok(())
}

async fn resolve_server_identity(cloud: &CloudClient) -> anyhow::Result<ServerIdentity> {
    if let Some(pem) = cloud.fetch_server_public_key().await {
        return Ok(ServerIdentity::from_pem(&pem)?);
    }
    warn!("could not fetch server public key from the cloud API; generating a throwaway one for local testing");
    let key = devswarm_core::crypto::rsa_generate_1024()?;
    Ok(ServerIdentity::from_public_key(rsa::RsaPublicKey::from(&key)))
}
