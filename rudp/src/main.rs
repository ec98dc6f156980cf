//! Entry point for `rudp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All protocol work is delegated to the library; `main.rs` owns only process
//! setup (logging, argument parsing, stdio plumbing).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use rudp::{ConnError, Connection, Listener, TimerConfig};

/// Reliable, ordered byte delivery over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    #[command(flatten)]
    timers: TimerArgs,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept connections and print whatever they send to stdout.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
    },
    /// Connect to a server and send stdin line by line; close on EOF.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        /// Local address to bind.
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
    },
}

#[derive(Args)]
struct TimerArgs {
    /// Pause between two sends, in microseconds.
    #[arg(long, global = true)]
    send_interval_us: Option<u64>,
    /// Retransmit a data segment after this many milliseconds without an ack.
    #[arg(long, global = true)]
    resend_ms: Option<u64>,
    /// Idle minutes before a heartbeat is sent.
    #[arg(long, global = true)]
    heartbeat_min: Option<u64>,
}

impl TimerArgs {
    fn to_config(&self) -> TimerConfig {
        let mut config = TimerConfig::default();
        if let Some(us) = self.send_interval_us {
            config = config.with_send_interval(Duration::from_micros(us));
        }
        if let Some(ms) = self.resend_ms {
            config = config.with_resend_threshold(Duration::from_millis(ms));
        }
        if let Some(min) = self.heartbeat_min {
            config = config.with_heartbeat_cycle(Duration::from_secs(min * 60));
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.timers.to_config();

    match cli.mode {
        Mode::Server { bind } => run_server(bind, config).await,
        Mode::Client { server, bind } => run_client(bind, server, config).await,
    }
}

async fn run_server(bind: SocketAddr, config: TimerConfig) -> anyhow::Result<()> {
    let listener = Listener::bind(bind, config)
        .await
        .with_context(|| format!("binding {bind}"))?;
    log::info!("Server listening on {}", listener.local_addr());

    loop {
        let conn = Arc::new(listener.accept().await.context("accept failed")?);
        tokio::spawn(async move {
            let peer = conn.remote_addr();
            if let Err(e) = print_stream(&conn).await {
                log::warn!("{peer}: {e}");
            }
        });
    }
}

async fn print_stream(conn: &Connection) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    loop {
        match conn.recv().await {
            Ok(chunk) => {
                stdout.write_all(&chunk).await?;
                stdout.flush().await?;
            }
            Err(ConnError::Closed) => {
                log::info!("{} closed the connection", conn.remote_addr());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn run_client(bind: SocketAddr, server: SocketAddr, config: TimerConfig) -> anyhow::Result<()> {
    let conn = Connection::dial(bind, server, config)
        .await
        .with_context(|| format!("connecting to {server}"))?;
    log::info!("Connected {} → {}", conn.local_addr(), conn.remote_addr());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        conn.write(format!("{line}\n").as_bytes())?;
    }
    conn.close().await?;
    Ok(())
}
