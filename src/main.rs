//! msgque - TCP/UDP message queue server and client

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use msgque::config::{self, Config};
use msgque::network::{EchoHandler, MessageHandler, QueueRef};
use msgque::protocol::{Message, MsgType};
use msgque::{start_connect, start_server, Context};

/// msgque - message queues over TCP and UDP
#[derive(Parser)]
#[command(name = "msgque")]
#[command(version = "0.1.0")]
#[command(about = "Run or talk to a msgque echo server", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server
    Serve {
        /// Listen address: tcp://, udp:// or all://
        #[arg(short, long, default_value = "tcp://0.0.0.0:7000")]
        listen: String,

        /// Newline-delimited messages instead of framed ones
        #[arg(long)]
        line: bool,
    },

    /// Connect to a server and send one message
    Connect {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:7000")]
        addr: String,

        /// Newline-delimited messages instead of framed ones
        #[arg(long)]
        line: bool,

        /// Text to send
        #[arg(short, long, default_value = "hello")]
        message: String,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn msg_type(line: bool) -> MsgType {
    if line {
        MsgType::Line
    } else {
        MsgType::Framed
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.general.log_level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { listen, line } => {
            run_server(config, &listen, msg_type(line)).await?;
        }
        Commands::Connect { addr, line, message } => {
            run_client(config, &addr, msg_type(line), message).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run the echo server until interrupted
async fn run_server(config: Config, listen: &str, msg_type: MsgType) -> anyhow::Result<()> {
    let stats_interval = Duration::from_secs(config.general.stats_interval_secs);
    let name = config.general.name.clone();
    let ctx = Context::new(config);

    let listeners = start_server(&ctx, listen, msg_type, Arc::new(EchoHandler::default()), None).await?;
    for listener in &listeners {
        tracing::info!(
            "{} listening on {} ({:?}, {:?})",
            name,
            listener.local_addr().unwrap_or_default(),
            listener.kind(),
            msg_type
        );
    }

    if !stats_interval.is_zero() {
        let stats_ctx = ctx.clone();
        ctx.supervisor().set_timeout(stats_interval, move || {
            let stats_ctx = stats_ctx.clone();
            async move {
                let stat = stats_ctx.stats();
                tracing::info!(
                    "tasks:{} queues:{} udp sessions:{} panics:{}",
                    stat.task_count,
                    stat.queue_count,
                    stat.udp_session_count,
                    stat.panic_count
                );
                stats_interval
            }
        });
    }

    println!("Press Ctrl+C to stop.");
    ctx.wait_for_exit(Vec::new()).await;

    println!("{}", serde_json::to_string_pretty(&ctx.stats())?);
    Ok(())
}

/// Reports connection outcomes and prints what the server sends back
struct ClientHandler {
    connected: mpsc::UnboundedSender<bool>,
}

#[async_trait]
impl MessageHandler for ClientHandler {
    async fn on_connect_complete(&self, _queue: &QueueRef, ok: bool) -> bool {
        let _ = self.connected.send(ok);
        true
    }

    async fn on_process_msg(&self, _queue: &QueueRef, msg: Message) -> bool {
        println!("{}", String::from_utf8_lossy(msg.payload()).trim_end());
        true
    }
}

/// Connect, send one message and print the reply
async fn run_client(config: Config, addr: &str, msg_type: MsgType, message: String) -> anyhow::Result<()> {
    let wait = config.tcp.connect_timeout() + Duration::from_secs(5);
    let ctx = Context::new(config);
    let (tx, mut connected) = mpsc::unbounded_channel();

    let handler = Arc::new(ClientHandler { connected: tx });
    let Some(queue) = start_connect(&ctx, addr, msg_type, handler, None, None).await else {
        anyhow::bail!("connection to {} was rejected", addr);
    };

    if connected.recv().await != Some(true) {
        ctx.stop().await;
        anyhow::bail!("could not connect to {}", addr);
    }

    match msg_type {
        MsgType::Framed => {
            let request = Message::new(1, 1, 1, 0, message.into_bytes());
            match tokio::time::timeout(wait, queue.request(request)).await {
                Ok(Some(reply)) => println!("{}", String::from_utf8_lossy(reply.payload())),
                Ok(None) => tracing::warn!("connection closed before a reply arrived"),
                Err(_) => tracing::warn!("no reply within {:?}", wait),
            }
        }
        MsgType::Line => {
            queue.send_text_ln(message).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    ctx.stop().await;
    Ok(())
}
