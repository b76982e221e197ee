use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use voxel_commons::common::constants::WorldConstants;
use voxel_commons::config::ServerConfig;
use voxel_commons::logging;
use voxel_commons::server::WorldServer;
use voxel_commons::storage::{FileBlobStore, Storage};

/// Multiplayer voxel world server.
#[derive(Debug, Parser)]
#[command(name = "server", version)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = WorldConstants::DEFAULT_SERVER_ADDRESS)]
    bind: String,

    /// Directory holding the users/ and worlds/ stores.
    #[arg(long, default_value = WorldConstants::DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Edge length of newly created worlds.
    #[arg(long, default_value_t = WorldConstants::DEFAULT_WORLD_SIZE)]
    world_size: u32,

    #[arg(short, long)]
    verbose: bool,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            bind_addr: args.bind,
            data_dir: args.data_dir,
            world_size: args.world_size,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let config = ServerConfig::from(args);
    config.validate()?;

    let storage = Storage::<FileBlobStore>::open_dir(&config.data_dir)
        .await
        .with_context(|| format!("opening data directory {}", config.data_dir.display()))?;
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(
        bind = %config.bind_addr,
        data_dir = %config.data_dir.display(),
        world_size = config.world_size,
        "starting voxel server"
    );

    let server = WorldServer::new(storage, config.world_size);
    tokio::select! {
        () = server.run(listener) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}
