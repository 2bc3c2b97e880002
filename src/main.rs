//! CLI for routemesh
//!
//! Subcommands:
//! - `serve`: run a node that accepts channel connections
//! - `ping`: connect to a node and ask its ping provider for a reply (smoke test)

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use routemesh::address::Address;
use routemesh::capabilities::ProviderQos;
use routemesh::config::load_config;
use routemesh::message::{Message, MessageType};
use routemesh::node::{Node, PING_PARTICIPANT_ID, PingHandler};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "routemesh")]
enum Command {
    /// Run a node: router, dispatcher and channel server
    Serve,
    /// Send a ping request to a running node and print the reply
    Ping {
        /// Channel server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080", env = "ROUTEMESH_PING_URL")]
        url: String,
        /// Channel id this client announces
        #[arg(long, default_value = "routemesh-ping")]
        channel: String,
        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            routemesh::utils::logging::init("info");
            error!("Invalid configuration: {e}");
            return;
        }
    };
    routemesh::utils::logging::init(&settings.logging.level);

    let result = match cmd {
        Command::Serve => run_server(settings).await,
        Command::Ping {
            url,
            channel,
            timeout,
        } => run_ping(settings, &url, channel, Duration::from_secs(timeout)).await,
    };
    if let Err(e) = result {
        error!("{e}");
    }
}

async fn run_server(settings: routemesh::config::Settings) -> Result<(), Box<dyn std::error::Error>> {
    let node = Node::new(settings)?;
    node.register_provider(
        PING_PARTICIPANT_ID,
        "routemesh",
        "ping",
        Arc::new(PingHandler),
        ProviderQos::default(),
    )?;
    node.start();
    let server = node.serve().await?;
    info!("Node ready on ws://{}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    server.stop();
    node.shutdown().await;
    Ok(())
}

async fn run_ping(
    mut settings: routemesh::config::Settings,
    url: &str,
    channel: String,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    settings.server.channel_id = channel;
    settings.persistence.enabled = false;
    let consumer_id = format!("{}.consumer", settings.server.channel_id);

    let node = Node::new(settings)?;
    node.start();
    let connection = node.connect(url).await?;
    node.register_local_participant(&consumer_id);
    node.routing_table().add(
        PING_PARTICIPANT_ID,
        Address::channel(connection.peer_channel_id()),
        true,
    );

    let (request, _) = Message::builder(MessageType::Request, consumer_id, PING_PARTICIPANT_ID)
        .ttl_from_now(timeout)
        .with_request_reply_id();
    let reply = node.dispatcher().request(request.build()).await;

    connection.close();
    node.shutdown().await;

    let payload = reply?;
    println!(
        "{} replied: {}",
        connection.peer_channel_id(),
        String::from_utf8_lossy(&payload)
    );
    Ok(())
}
