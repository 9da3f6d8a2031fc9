//! socketcore - Length-Prefixed Echo Server
//!
//! This is the main entry point for the socketcore server.
//! It parses the command line, starts the connection core with an echo
//! handler, and shuts it down on Ctrl+C.

use bytes::Bytes;
use socketcore::{Echo, HandshakeConfig, HandshakePolicy, Server, ServerConfig};
use std::process;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line configuration
struct Config {
    /// Port to listen on
    port: u16,
    /// Everything handed to the connection core
    server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: socketcore::DEFAULT_PORT,
            server: ServerConfig {
                host: socketcore::DEFAULT_HOST.to_string(),
                ..ServerConfig::default()
            },
        }
    }
}

/// Returns the value following a flag, or exits.
fn value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", flag);
            process::exit(1);
        }
    }
}

/// Parses a numeric flag value, or exits.
fn number<T: std::str::FromStr>(raw: &str, flag: &str) -> T {
    raw.parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value for {}: {}", flag, raw);
        process::exit(1);
    })
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();
        let mut ignore_bad_handshake = false;

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--host" | "-h" => {
                    config.server.host = value(&args, i, flag).to_string();
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = number(value(&args, i, flag), flag);
                    i += 2;
                }
                "--buffer-size" => {
                    config.server.buffer.default_capacity = number(value(&args, i, flag), flag);
                    i += 2;
                }
                "--prefix-width" => {
                    config.server.prefix_width = number(value(&args, i, flag), flag);
                    i += 2;
                }
                "--max-message" => {
                    config.server.max_message_len = number(value(&args, i, flag), flag);
                    i += 2;
                }
                "--handshake" => {
                    let payload = Bytes::from(value(&args, i, flag).as_bytes().to_vec());
                    config.server.handshake = Some(HandshakeConfig::new(payload));
                    i += 2;
                }
                "--ignore-bad-handshake" => {
                    ignore_bad_handshake = true;
                    i += 1;
                }
                "--workers" | "-w" => {
                    config.server.worker_threads = number(value(&args, i, flag), flag);
                    i += 2;
                }
                "--help" => {
                    print_help();
                    process::exit(0);
                }
                "--version" | "-v" => {
                    println!("socketcore version {}", socketcore::VERSION);
                    process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    process::exit(1);
                }
            }
        }

        if ignore_bad_handshake {
            match config.server.handshake.as_mut() {
                Some(handshake) => handshake.on_mismatch = HandshakePolicy::Ignore,
                None => eprintln!("Warning: --ignore-bad-handshake has no effect without --handshake"),
            }
        }

        config
    }

    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.port)
    }
}

fn print_help() {
    println!(
        r#"
socketcore - Length-Prefixed TCP Echo Server

USAGE:
    socketcore [OPTIONS]

OPTIONS:
    -h, --host <HOST>              Host to bind to (default: 0.0.0.0)
    -p, --port <PORT>              Port to listen on (default: 7000)
        --buffer-size <BYTES>      Default receive buffer size (default: 8192)
        --prefix-width <BYTES>     Length prefix width: 1, 2, 4 or 8 (default: 4)
        --max-message <BYTES>      Largest accepted message body (default: 67108864)
        --handshake <TEXT>         Bytes every client must send first
        --ignore-bad-handshake     Log a wrong handshake instead of disconnecting
    -w, --workers <N>              Worker thread hint for the reactor
    -v, --version                  Print version information
        --help                     Print this help message

EXAMPLES:
    socketcore                         # Start on 0.0.0.0:7000
    socketcore --port 7001             # Start on port 7001
    socketcore --handshake HELO        # Require "HELO" before the first message

ENVIRONMENT:
    RUST_LOG                           Log filter (default: info)
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
socketcore v{} - Length-Prefixed TCP Echo Server
──────────────────────────────────────────────────────────────
Binding to {} (prefix {} bytes, buffer {} bytes)

Use Ctrl+C to shutdown gracefully.
"#,
        socketcore::VERSION,
        config.bind_address(),
        config.server.prefix_width,
        config.server.buffer.default_capacity,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    // Print the banner
    print_banner(&config);

    let handle = Server::new(config.server, Echo).start(config.port)?;
    info!(addr = %handle.local_addr(), "Ready to accept connections");

    signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping server...");

    // Joins threads, so keep it off the async workers
    tokio::task::spawn_blocking(move || handle.shutdown()).await??;

    info!("Server shutdown complete");
    Ok(())
}
