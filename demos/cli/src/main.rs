use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use roomkit_client::{Client, ClientOptions, EnterOptions};
use roomkit_protocol::RoomId;
use roomkit_room::{AuthEndpoint, Room};
use roomkit_storage::SetValue;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "roomkit-demo", about = "Interactive session against a collaborative room")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room and drop into an interactive session.
    Join {
        room: String,
        #[arg(long, env = "ROOMKIT_PUBLIC_API_KEY")]
        public_api_key: Option<String>,
        #[arg(long)]
        auth_endpoint: Option<String>,
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        throttle_ms: Option<u64>,
    },
}

fn init_telemetry(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli.log_level);

    let local = tokio::task::LocalSet::new();
    local.run_until(run(cli)).await
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Join { room, public_api_key, auth_endpoint, server, throttle_ms } => {
            join_and_run(room, public_api_key, auth_endpoint, server, throttle_ms).await
        },
    }
}

async fn join_and_run(room: String, public_api_key: Option<String>, auth_endpoint: Option<String>, server: Option<String>, throttle_ms: Option<u64>) -> Result<()> {
    let room_id = RoomId::new(room).context("invalid room id")?;

    let mut options = ClientOptions::new();
    match (public_api_key, auth_endpoint) {
        (Some(key), None) => options.public_api_key = Some(key),
        (None, Some(url)) => options.auth_endpoint = Some(AuthEndpoint::Url(url)),
        (Some(_), Some(_)) => bail!("pass only one of --public-api-key or --auth-endpoint"),
        (None, None) => bail!("pass --public-api-key or --auth-endpoint (or set ROOMKIT_PUBLIC_API_KEY)"),
    }
    if let Some(ms) = throttle_ms {
        options.throttle_ms = ms;
    }
    if let Some(server) = server {
        options.liveblocks_server = Some(server);
    }

    let client = Client::connect(options).context("failed to build client")?;
    let room = client.enter(room_id.clone(), EnterOptions::default()).context("failed to enter room")?;

    let mut status_rx = room.subscribe_status();
    tokio::task::spawn_local({
        let room_id = room_id.clone();
        async move {
            while status_rx.changed().await.is_ok() {
                info!(room = %room_id, status = ?*status_rx.borrow(), "connection status changed");
            }
        }
    });

    room.subscribe_broadcast(|actor, event| {
        println!("broadcast from {actor}: {event}");
    });

    println!("commands: set <key> <json> | delete <key> | get | presence <key> <json> | broadcast <json> | undo | redo | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "quit" {
            break;
        }
        if let Err(err) = handle_line(&room, line) {
            eprintln!("error: {err}");
        }
    }

    client.leave(&room_id);
    Ok(())
}

fn handle_line(room: &Room, line: &str) -> Result<()> {
    let mut parts = line.splitn(3, ' ');
    match parts.next().unwrap_or("") {
        "set" => {
            let key = parts.next().context("usage: set <key> <json>")?;
            let raw = parts.next().context("usage: set <key> <json>")?;
            let value: Value = serde_json::from_str(raw).context("invalid JSON")?;
            room.object_set(room.root(), key, SetValue::Json(value))?;
        },
        "delete" => {
            let key = parts.next().context("usage: delete <key>")?;
            room.object_delete_key(room.root(), key)?;
        },
        "get" => {
            for (key, entry) in room.object_entries(room.root())? {
                println!("{key} = {entry:?}");
            }
        },
        "presence" => {
            let key = parts.next().context("usage: presence <key> <json>")?;
            let raw = parts.next().context("usage: presence <key> <json>")?;
            let value: Value = serde_json::from_str(raw).context("invalid JSON")?;
            room.update_presence(HashMap::from([(key.to_string(), Some(value))]), false);
        },
        "broadcast" => {
            let raw = parts.next().context("usage: broadcast <json>")?;
            let value: Value = serde_json::from_str(raw).context("invalid JSON")?;
            room.broadcast_event(value);
        },
        "undo" => room.undo()?,
        "redo" => room.redo()?,
        "" => {},
        other => warn!(command = other, "unknown command"),
    }
    Ok(())
}
