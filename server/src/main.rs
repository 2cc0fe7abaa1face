use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::{Server, ServerHandle};
use shared::DEFAULT_PORT;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Directory holding users.json and the permissions tree
    #[clap(short, long, default_value = ".")]
    data_dir: PathBuf,
    /// Seconds between keepalive pings
    #[clap(long, default_value = "15")]
    ping_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Hint: set RUST_LOG=info to see server activity");
    }
    env_logger::init();

    let args = Args::parse();
    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        data_dir: args.data_dir,
        ping_interval: Duration::from_secs(args.ping_interval_secs.max(1)),
        ..ServerConfig::default()
    };

    let server = Server::bind(config).await?;
    let handle = server.handle();

    tokio::spawn(read_console(handle.clone()));
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                handle.shutdown().await;
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    server.run().await?;
    Ok(())
}

/// Feeds lines typed on stdin to the server console until stdin closes.
async fn read_console(handle: ServerHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !handle.console(line).await {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read console input: {}", e);
                break;
            }
        }
    }
}
