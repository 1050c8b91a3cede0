//! Administrative control socket
//!
//! One command per line on a Unix stream socket; every command gets exactly
//! one reply line, `ok[ <payload>]` or `error: <message>`.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use restblock_block::Registry;
use restblock_common::{DebugLevel, Error};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

/// A parsed control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Attach { object: String, device: String },
    Detach { device: String },
    Cancel { device: String },
    AddUrls(String),
    RemoveUrls(String),
    Urls,
    Devices,
    Level { device: String, level: Option<DebugLevel> },
    Stats { device: String },
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or("empty command")?;
        let args: Vec<&str> = words.collect();

        let cmd = match (verb, args.as_slice()) {
            ("attach", [object, device]) => Self::Attach {
                object: (*object).to_string(),
                device: (*device).to_string(),
            },
            ("detach", [device]) => Self::Detach {
                device: (*device).to_string(),
            },
            ("cancel", [device]) => Self::Cancel {
                device: (*device).to_string(),
            },
            ("add_urls", [list]) => Self::AddUrls((*list).to_string()),
            ("remove_urls", [list]) => Self::RemoveUrls((*list).to_string()),
            ("urls", []) => Self::Urls,
            ("devices", []) => Self::Devices,
            ("debug", [device]) => Self::Level {
                device: (*device).to_string(),
                level: None,
            },
            ("debug", [device, level]) => Self::Level {
                device: (*device).to_string(),
                level: Some(level.parse()?),
            },
            ("stats", [device]) => Self::Stats {
                device: (*device).to_string(),
            },
            ("attach" | "detach" | "cancel" | "add_urls" | "remove_urls" | "urls" | "devices"
            | "debug" | "stats", _) => return Err(format!("wrong number of arguments for '{verb}'")),
            _ => return Err(format!("unknown command '{verb}'")),
        };
        Ok(cmd)
    }

    /// Run against the registry; blocks while devices connect or drain
    pub fn execute(&self, registry: &Registry) -> Result<Option<String>, Error> {
        match self {
            Self::Attach { object, device } => {
                let dev = registry.attach(object, device)?;
                Ok(Some(format!("{} {}", dev.name(), dev.size_bytes())))
            }
            Self::Detach { device } => registry.detach(device).map(|()| None),
            Self::Cancel { device } => registry.cancel(device).map(|()| None),
            Self::AddUrls(list) => registry.add_servers(list).map(|n| Some(n.to_string())),
            Self::RemoveUrls(list) => registry.remove_servers(list).map(|n| Some(n.to_string())),
            Self::Urls => Ok(Some(registry.list_servers().trim_end().to_string())),
            Self::Devices => Ok(Some(to_json(&registry.list_devices()))),
            Self::Level {
                device,
                level: Some(level),
            } => registry.set_debug_level(device, *level).map(|()| None),
            Self::Level { device, level: None } => {
                registry.debug_level(device).map(|l| Some(l.to_string()))
            }
            Self::Stats { device } => registry.device_info(device).map(|info| Some(to_json(&info))),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
}

/// Parse and run one line, producing the reply line (without newline)
pub async fn handle_line(registry: &Arc<Registry>, line: &str) -> String {
    let cmd = match Command::parse(line) {
        Ok(cmd) => cmd,
        Err(msg) => return format!("error: {msg}"),
    };
    debug!(?cmd, "Control command");

    let registry = Arc::clone(registry);
    match tokio::task::spawn_blocking(move || cmd.execute(&registry)).await {
        Ok(Ok(Some(payload))) if !payload.is_empty() => format!("ok {payload}"),
        Ok(Ok(_)) => "ok".to_string(),
        Ok(Err(e)) => format!("error: {e}"),
        Err(e) => {
            error!("Control command panicked: {e}");
            "error: internal error".to_string()
        }
    }
}

pub struct ControlServer {
    registry: Arc<Registry>,
}

impl ControlServer {
    pub const fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Bind `path`, replacing a stale socket file, and serve until dropped
    pub async fn serve(self: Arc<Self>, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create control socket dir {}", parent.display()))?;
        }
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("remove stale control socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("bind control socket {}", path.display()))?;
        info!("Control: listening on {}", path.display());
        self.serve_listener(listener).await;
        Ok(())
    }

    pub async fn serve_listener(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream).await {
                            warn!("Control: client error: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Control: accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_client(&self, stream: UnixStream) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let mut reply = handle_line(&self.registry, &line).await;
            reply.push('\n');
            writer.write_all(reply.as_bytes()).await?;
        }
        Ok(())
    }
}
