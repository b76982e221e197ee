use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use serde_json::json;

mod network;

use network::{is_world_data, ServerLink};
use voxel_commons::common::constants::WorldConstants;
use voxel_commons::common::protocol::Message;
use voxel_commons::common::water::WaterField;
use voxel_commons::common::world::World;
use voxel_commons::logging;
use voxel_commons::offline::LocalServer;
use voxel_commons::transport::Transport;

/// Command-line client for the voxel world server.
#[derive(Debug, Parser)]
#[command(name = "client", version)]
struct Args {
    /// Server address (host:port).
    #[arg(long, default_value = WorldConstants::DEFAULT_SERVER_ADDRESS, conflicts_with = "offline")]
    server: String,

    /// Play offline against the local database in this directory.
    #[arg(long)]
    offline: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a user and print its token.
    Register { username: String },
    /// List stored worlds.
    Worlds {
        #[arg(long)]
        token: String,
    },
    /// Generate a new world and print its summary.
    NewWorld {
        #[arg(long)]
        token: String,
    },
    /// Join a world and print its summary.
    Join {
        #[arg(long)]
        token: String,
        world: String,
    },
    /// Set one voxel in a world.
    SetVoxel {
        #[arg(long)]
        token: String,
        world: String,
        index: u32,
        value: u8,
    },
    /// Pour water into a world cell and report how it settles after some
    /// ticks. The world itself is not changed.
    Water {
        #[arg(long)]
        token: String,
        world: String,
        /// Flat index of the cell to pour into.
        #[arg(long)]
        at: u32,
        #[arg(long, default_value_t = 1.0)]
        amount: f32,
        #[arg(long, default_value_t = 50)]
        steps: u32,
        #[arg(long, default_value_t = 1.0)]
        gravity: f32,
    },
    /// Join a world and print what other players do until interrupted.
    Watch {
        #[arg(long)]
        token: String,
        world: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    match &args.offline {
        Some(dir) => {
            let local = LocalServer::open(dir, WorldConstants::DEFAULT_WORLD_SIZE).await?;
            run(ServerLink::new(local.connect()), args.command).await
        }
        None => run(network::connect(&args.server).await?, args.command).await,
    }
}

async fn run<T: Transport>(mut link: ServerLink<T>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Register { username } => {
            let token = link.register(&username).await?;
            print_json(json!({ "username": username, "token": token }));
        }
        Command::Worlds { token } => {
            link.login(&token).await?;
            let worlds = link.sync().await?;
            print_json(json!({ "worlds": worlds }));
        }
        Command::NewWorld { token } => {
            link.login(&token).await?;
            let world = expect_world(link.request(&Message::NewWorld, is_world_data).await?)?;
            print_json(summary(&world));
        }
        Command::Join { token, world } => {
            link.login(&token).await?;
            let world = expect_world(link.request(&Message::JoinWorld { token: world }, is_world_data).await?)?;
            print_json(summary(&world));
        }
        Command::SetVoxel { token, world, index, value } => {
            link.login(&token).await?;
            let world = expect_world(link.request(&Message::JoinWorld { token: world }, is_world_data).await?)?;
            if world.voxels.get(index as usize).is_none() {
                bail!("index {} is outside a world of {} cells", index, world.len());
            }
            link.send(&Message::UpdateVoxel { index, value }).await?;
            link.sync().await?;
            print_json(json!({ "world": world.token, "index": index, "value": value }));
        }
        Command::Water { token, world, at, amount, steps, gravity } => {
            link.login(&token).await?;
            let world = expect_world(link.request(&Message::JoinWorld { token: world }, is_world_data).await?)?;
            let mut water = WaterField::for_world(&world);
            let poured = water.pour(&world, at as usize, amount)?;
            for _ in 0..steps {
                water = water.step_world(&world, gravity)?;
            }
            link.send(&Message::LeaveWorld).await?;
            print_json(json!({
                "world": world.token,
                "poured": poured,
                "steps": steps,
                "total": water.total(),
                "wet_cells": water.wet_cells(),
            }));
        }
        Command::Watch { token, world } => {
            let username = link.login(&token).await?;
            let world = expect_world(link.request(&Message::JoinWorld { token: world }, is_world_data).await?)?;
            tracing::info!(%username, world = %world.token, "watching");
            'watch: loop {
                tokio::select! {
                    next = link.next_broadcast() => match next? {
                        Some(message) => print_json(serde_json::to_value(&message)?),
                        None => break 'watch,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        link.send(&Message::LeaveWorld).await?;
                        break 'watch;
                    }
                }
            }
        }
    }
    Ok(())
}

fn expect_world(reply: Message) -> anyhow::Result<World> {
    match reply {
        Message::WorldData { world: Some(world) } => Ok(world),
        Message::WorldData { world: None } => bail!("no such world"),
        other => bail!("unexpected reply {:?}", other.tag()),
    }
}

/// The voxel array is too large to print; report its shape instead.
fn summary(world: &World) -> serde_json::Value {
    let solid = world
        .voxels
        .iter()
        .filter(|&&v| v != WorldConstants::AIR)
        .count();
    json!({
        "token": world.token,
        "size": world.size,
        "voxels": world.voxels.len(),
        "solid": solid,
        "players": world.players.keys().collect::<Vec<_>>(),
    })
}

fn print_json(value: serde_json::Value) {
    println!("{}", value);
}
