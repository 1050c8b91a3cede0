//! RestBlock CLI - Gateway administration
//!
//! Sends one command over the gateway control socket and prints the reply.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "restblock-cli")]
#[command(about = "RestBlock gateway admin CLI")]
#[command(version)]
struct Args {
    /// Gateway control socket
    #[arg(short, long, default_value = "/run/restblock/control.sock")]
    socket: PathBuf,

    /// Print replies without formatting
    #[arg(long)]
    raw: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Attach a remote object as a block device
    Attach { object: String, device: String },
    /// Detach a block device
    Detach { device: String },
    /// Abort a device's in-flight requests
    Cancel { device: String },
    /// Server URL operations
    Urls {
        #[command(subcommand)]
        action: Option<UrlCommands>,
    },
    /// List attached devices
    Devices,
    /// Show or set a device's debug level
    Debug { device: String, level: Option<String> },
    /// Show device statistics
    Stats { device: String },
}

#[derive(Subcommand, Debug)]
enum UrlCommands {
    /// Add comma-separated server URLs
    Add { urls: String },
    /// Remove comma-separated server URLs
    Remove { urls: String },
}

impl Commands {
    /// The control protocol line for this command
    fn to_line(&self) -> String {
        match self {
            Self::Attach { object, device } => format!("attach {object} {device}"),
            Self::Detach { device } => format!("detach {device}"),
            Self::Cancel { device } => format!("cancel {device}"),
            Self::Urls { action: None } => "urls".to_string(),
            Self::Urls {
                action: Some(UrlCommands::Add { urls }),
            } => format!("add_urls {urls}"),
            Self::Urls {
                action: Some(UrlCommands::Remove { urls }),
            } => format!("remove_urls {urls}"),
            Self::Devices => "devices".to_string(),
            Self::Debug { device, level: None } => format!("debug {device}"),
            Self::Debug {
                device,
                level: Some(level),
            } => format!("debug {device} {level}"),
            Self::Stats { device } => format!("stats {device}"),
        }
    }
}

async fn send_command(socket: &Path, line: &str) -> Result<String> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connect to gateway at {}", socket.display()))?;
    let (reader, mut writer) = stream.into_split();

    debug!("-> {line}");
    writer.write_all(format!("{line}\n").as_bytes()).await?;

    let mut reply = String::new();
    BufReader::new(reader).read_line(&mut reply).await?;
    if reply.is_empty() {
        bail!("gateway closed the connection without replying");
    }
    let reply = reply.trim_end().to_string();
    debug!("<- {reply}");
    Ok(reply)
}

fn print_devices(payload: &str) -> Result<()> {
    let devices: Vec<Value> = serde_json::from_str(payload).context("parse device list")?;
    if devices.is_empty() {
        println!("No devices attached");
        return Ok(());
    }
    println!(
        "{:<12} {:<40} {:>14} {:>6} {:>8}",
        "DEVICE", "URL", "SIZE", "USERS", "WORKERS"
    );
    println!("{}", "-".repeat(84));
    for dev in devices {
        println!(
            "{:<12} {:<40} {:>14} {:>6} {:>8}",
            dev["name"].as_str().unwrap_or("-"),
            dev["url"].as_str().unwrap_or("-"),
            dev["size_bytes"].as_u64().unwrap_or_default(),
            dev["users"].as_u64().unwrap_or_default(),
            dev["workers"].as_u64().unwrap_or_default(),
        );
    }
    Ok(())
}

fn print_reply(command: &Commands, payload: &str, raw: bool) -> Result<()> {
    if raw {
        println!("{payload}");
        return Ok(());
    }
    match command {
        Commands::Devices => print_devices(payload)?,
        Commands::Stats { .. } => {
            let info: Value = serde_json::from_str(payload).context("parse device stats")?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Urls { action: None } => {
            if payload.is_empty() {
                println!("No servers configured");
            }
            for url in payload.split(',').filter(|u| !u.is_empty()) {
                println!("{url}");
            }
        }
        Commands::Attach { .. } => {
            let (device, size) = payload.split_once(' ').unwrap_or((payload, "?"));
            println!("Attached {device} ({size} bytes)");
        }
        Commands::Detach { device } => println!("Detached {device}"),
        Commands::Cancel { device } => println!("Cancelled {device}"),
        Commands::Urls { action: Some(_) } => println!("{payload} server(s) updated"),
        Commands::Debug { level: None, .. } => println!("{payload}"),
        Commands::Debug { .. } => println!("Debug level updated"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let reply = send_command(&args.socket, &args.command.to_line()).await?;

    if let Some(msg) = reply.strip_prefix("error: ") {
        eprintln!("Error: {msg}");
        return Ok(ExitCode::FAILURE);
    }
    let Some(payload) = reply.strip_prefix("ok") else {
        bail!("unexpected reply: {reply}");
    };
    print_reply(&args.command, payload.trim_start(), args.raw)?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_lines() {
        let args = Args::parse_from(["restblock-cli", "attach", "disk0", "srba"]);
        assert_eq!(args.command.to_line(), "attach disk0 srba");

        let args = Args::parse_from(["restblock-cli", "urls", "add", "http://10.0.0.1/vols"]);
        assert_eq!(args.command.to_line(), "add_urls http://10.0.0.1/vols");

        let args = Args::parse_from(["restblock-cli", "cancel", "srba"]);
        assert_eq!(args.command.to_line(), "cancel srba");

        let args = Args::parse_from(["restblock-cli", "urls"]);
        assert_eq!(args.command.to_line(), "urls");

        let args = Args::parse_from(["restblock-cli", "debug", "srba", "trace"]);
        assert_eq!(args.command.to_line(), "debug srba trace");
    }

    #[test]
    fn test_socket_option() {
        let args = Args::parse_from(["restblock-cli", "--socket", "/tmp/ctl.sock", "devices"]);
        assert_eq!(args.socket, PathBuf::from("/tmp/ctl.sock"));
        assert_eq!(args.command.to_line(), "devices");
    }

    #[test]
    fn test_print_devices_rejects_garbage() {
        assert!(print_devices("not json").is_err());
        assert!(print_devices("[]").is_ok());
    }
}
