//! Command line front end for BLE receipt printers
//!
//! Scans for printers, sends payloads and keeps an interactive session open.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use data_encoding::HEXLOWER_PERMISSIVE;
use printlink::{BtleBluetooth, Link, LinkConfig, LogKind, LogSink, ResolvedConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "printlink")]
#[command(about = "Talk to a BLE receipt printer")]
struct Cli {
    /// Config file (default: $PRINTLINK_HOME/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for printers
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Connect, send one payload, disconnect
    Send {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
        #[command(flatten)]
        payload: Payload,
    },
    /// Print notifications from the printer until Ctrl-C
    Listen {
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Interactive session: connect, disconnect, send, state, quit
    Terminal {
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Write the default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Payload {
    /// Text to print; a line feed is appended
    #[arg(short, long)]
    text: Option<String>,
    /// Raw bytes as hex, e.g. "1b40"
    #[arg(long)]
    hex: Option<String>,
    /// Raw bytes from a file
    #[arg(short, long)]
    file: Option<PathBuf>,
}

/// Progress lines go to the terminal, failures to stderr
struct Console;

impl LogSink for Console {
    fn log(&self, kind: LogKind, message: &str) {
        match kind {
            LogKind::Info => println!("{message}"),
            LogKind::Error => eprintln!("error: {message}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter(cli.verbose))),
        )
        .with_target(false)
        .init();

    let config_path = match cli.config {
        Some(path) => Some(path),
        None => printlink::config::default_path(),
    };
    tracing::debug!(path = ?config_path, "loading config");
    let config = match &config_path {
        Some(path) => LinkConfig::load(path)?,
        None => LinkConfig::default(),
    };

    match cli.command {
        Commands::Scan { duration } => {
            let resolved = config.resolve()?;
            scan(&resolved, Duration::from_secs(duration)).await?;
        }
        Commands::Send { device, payload } => {
            let bytes = read_payload(&payload)?;
            let link = open(config, device, false).await?;
            connect(&link).await?;
            let sent = link.send(&bytes).await;
            link.disconnect().await;
            sent?;
            println!("Sent {} bytes", bytes.len());
        }
        Commands::Listen { device } => {
            listen(open(config, device, true).await?).await?;
        }
        Commands::Terminal { device } => {
            let notifications = config.notifications;
            terminal(open(config, device, notifications).await?).await?;
        }
        Commands::Init { force } => {
            let path = config_path.ok_or("no home directory, pass --config")?;
            if path.exists() && !force {
                return Err(format!("{} exists, use --force to overwrite", path.display()).into());
            }
            LinkConfig::default().save(&path)?;
            println!("Wrote {}", path.display());
        }
    }

    Ok(())
}

/// `RUST_LOG` overrides this
fn default_filter(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

/// Connect, releasing any half-open link on failure
async fn connect(link: &Link) -> Result<(), printlink::LinkError> {
    if let Err(e) = link.connect().await {
        link.disconnect().await;
        return Err(e);
    }
    Ok(())
}

async fn open(
    mut config: LinkConfig,
    device: Option<String>,
    notifications: bool,
) -> Result<Link, Box<dyn std::error::Error>> {
    if device.is_some() {
        config.name_filter = device;
    }
    config.notifications = notifications;
    let resolved = config.resolve()?;
    let bluetooth = BtleBluetooth::new(resolved.scan_duration).await?;
    Ok(Link::new(Arc::new(bluetooth), resolved, Arc::new(Console)))
}

fn read_payload(payload: &Payload) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    if let Some(text) = &payload.text {
        let mut bytes = text.clone().into_bytes();
        bytes.push(b'\n');
        return Ok(bytes);
    }
    if let Some(hex) = &payload.hex {
        return decode_hex(hex);
    }
    if let Some(file) = &payload.file {
        return Ok(std::fs::read(file)?);
    }
    Err("nothing to send".into())
}

fn decode_hex(input: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let digits: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    Ok(HEXLOWER_PERMISSIVE.decode(digits.as_bytes())?)
}

async fn scan(config: &ResolvedConfig, duration: Duration) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for printers ({} seconds)...", duration.as_secs());

    let bluetooth = BtleBluetooth::new(duration).await?;
    let candidates = bluetooth.scan(&[config.service]).await?;

    println!("\nFound {} devices:", candidates.len());
    for candidate in candidates {
        let rssi = candidate
            .rssi
            .map(|r| format!("{r} dBm"))
            .unwrap_or_else(|| "N/A".to_string());
        let marker = if candidate.advertises_service { " [PRINTER]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", candidate.name, candidate.address, rssi, marker);
    }
    Ok(())
}

async fn listen(link: Link) -> Result<(), Box<dyn std::error::Error>> {
    let mut values = link.notifications();
    connect(&link).await?;
    println!("Listening, Ctrl-C to stop");

    loop {
        tokio::select! {
            value = values.recv() => match value {
                Ok(n) => println!("< {}", HEXLOWER_PERMISSIVE.encode(&n.value)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("skipped {skipped} notifications");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    link.disconnect().await;
    Ok(())
}

async fn terminal(link: Link) -> Result<(), Box<dyn std::error::Error>> {
    let mut states = link.subscribe_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            tracing::debug!(%state, "state changed");
        }
    });

    println!("Commands: connect, disconnect, send <text>, hex <bytes>, state, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "" => {}
            // Failures are already reported through the log sink
            "connect" => {
                let _ = link.connect().await;
            }
            "disconnect" => link.disconnect().await,
            "send" => {
                let mut bytes = rest.as_bytes().to_vec();
                bytes.push(b'\n');
                let _ = link.send(&bytes).await;
            }
            "hex" => match decode_hex(rest) {
                Ok(bytes) => {
                    let _ = link.send(&bytes).await;
                }
                Err(e) => eprintln!("error: {e}"),
            },
            "state" => match link.device_name() {
                Some(name) => println!("{} ({name})", link.state()),
                None => println!("{}", link.state()),
            },
            "quit" | "exit" => break,
            other => eprintln!("unknown command: {other}"),
        }
    }

    link.disconnect().await;
    Ok(())
}
