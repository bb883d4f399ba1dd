//! seqrpc-cli - Command-line interface for seqrpc
//!
//! Runs one command against a server over a single connection.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use seqrpc_client::{Client, ClientConfig};
use seqrpc_protocol::{CodecType, Opt, DEFAULT_PORT};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "seqrpc-cli")]
#[command(about = "Command-line interface for seqrpc servers")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, env = "SEQRPC_SERVER", default_value_t = SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)))]
    server: SocketAddr,

    /// Codec to negotiate
    #[arg(long, env = "SEQRPC_CODEC", default_value = CodecType::BINCODE)]
    codec: String,

    /// Per-call timeout in milliseconds
    #[arg(short, long, env = "SEQRPC_CALL_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Connect timeout in seconds
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ping the server
    Ping,

    /// List the methods the server exposes
    Methods,

    /// Send text and print what comes back
    Echo {
        /// Text to send
        text: String,
    },

    /// Add two integers on the server
    Sum {
        #[arg(allow_negative_numbers = true)]
        a: i64,
        #[arg(allow_negative_numbers = true)]
        b: i64,
    },

    /// Ask the server to sleep before answering
    Sleep {
        /// Milliseconds to sleep
        ms: u64,
    },

    /// Issue many concurrent calls over one connection
    Bench {
        /// Total number of calls
        #[arg(short = 'n', long, default_value = "1000")]
        calls: usize,

        /// Calls kept in flight at once
        #[arg(short, long, default_value = "64")]
        concurrency: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut config =
        ClientConfig::new().with_connect_timeout(Duration::from_secs(cli.connect_timeout));
    if let Some(ms) = cli.timeout_ms {
        config = config.with_call_timeout(Duration::from_millis(ms));
    }

    let opt = Opt::with_codec(cli.codec.as_str());
    let client = match Client::dial(cli.server, Some(opt), config).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("{}: {}", "Connection failed".red(), e);
            std::process::exit(1);
        }
    };

    let result = commands::execute(&client, cli.command).await;
    let _ = client.close().await;

    match result {
        Ok(output) => {
            println!("{}", output);
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    Ok(())
}
