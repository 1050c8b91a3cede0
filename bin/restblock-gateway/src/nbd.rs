//! NBD (Network Block Device) fixed-newstyle server
//!
//! Every ready device of the registry is an export, selected by device name
//! during the handshake. In the data phase reads and writes become
//! [`PendingRequest`]s on the device; replies are written as the workers
//! complete them, so one session keeps the whole worker pool busy.

#![allow(clippy::cast_possible_truncation)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use bytes::BytesMut;
use restblock_block::{CompletedRequest, Device, Direction, PendingRequest, Registry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

// ── NBD protocol constants ────────────────────────────────────────────────────

const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943; // "NBDMAGIC"
const NBD_IHAVEOPT: u64 = 0x4948_4156_454f_5054; // "IHAVEOPT"
const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

// Handshake flags
const NBD_FLAG_FIXED_NEWSTYLE: u16 = 0x0001;
const NBD_FLAG_NO_ZEROES: u16 = 0x0002;

// Option IDs
const NBD_OPT_EXPORT_NAME: u32 = 1;
const NBD_OPT_ABORT: u32 = 2;
const NBD_OPT_LIST: u32 = 3;
const NBD_OPT_INFO: u32 = 6;
const NBD_OPT_GO: u32 = 7;

// Reply types
const NBD_REP_ACK: u32 = 1;
const NBD_REP_SERVER: u32 = 2;
const NBD_REP_INFO: u32 = 3;
const NBD_REP_ERR_UNSUP: u32 = 0x8000_0001;
const NBD_REP_ERR_INVALID: u32 = 0x8000_0003;
const NBD_REP_ERR_UNKNOWN: u32 = 0x8000_0006;

// Transmission flags
const NBD_FLAG_HAS_FLAGS: u16 = 0x0001;
const NBD_FLAG_SEND_FLUSH: u16 = 0x0004;

// Info types
const NBD_INFO_EXPORT: u16 = 0;

// Commands
const NBD_CMD_READ: u16 = 0;
const NBD_CMD_WRITE: u16 = 1;
const NBD_CMD_DISC: u16 = 2;
const NBD_CMD_FLUSH: u16 = 3;

const EINVAL: u32 = 22;

/// Largest read or write accepted in one command
const MAX_REQUEST_BYTES: u32 = 32 * 1024 * 1024;

/// Largest option payload accepted during negotiation
const MAX_OPTION_BYTES: u32 = 64 * 1024;

/// Reply queued for the session writer
struct Reply {
    handle: u64,
    error: u32,
    data: Option<BytesMut>,
}

pub struct NbdServer {
    registry: Arc<Registry>,
}

impl NbdServer {
    pub const fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Bind `addr` and serve clients until the task is dropped
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind NBD listener on {addr}"))?;
        info!("NBD: listening on {addr}");
        self.serve_listener(listener).await;
        Ok(())
    }

    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream, peer).await {
                            warn!("NBD: client {peer} error: {e:#}");
                        }
                    });
                }
                Err(e) => {
                    error!("NBD: accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_client(&self, mut stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        info!("NBD: client {peer} connected");
        stream.set_nodelay(true)?;

        // ── Handshake ─────────────────────────────────────────────────────────
        stream.write_u64(NBD_MAGIC).await?;
        stream.write_u64(NBD_IHAVEOPT).await?;
        stream
            .write_u16(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES)
            .await?;
        let client_flags = stream.read_u32().await?;

        // ── Option negotiation ────────────────────────────────────────────────
        let Some((name, device)) = self.negotiate_options(&mut stream, client_flags).await? else {
            info!("NBD: client {peer} aborted negotiation");
            return Ok(());
        };

        // ── Data phase ────────────────────────────────────────────────────────
        let result = data_phase(stream, &device, peer).await;
        if let Err(e) = self.registry.close(&name) {
            debug!("NBD: closing '{name}': {e}");
        }
        info!("NBD: client {peer} disconnected from '{name}'");
        result
    }

    /// Run option haggling; `None` when the client aborts.
    ///
    /// The selected export is opened in the registry.
    async fn negotiate_options(
        &self,
        stream: &mut TcpStream,
        client_flags: u32,
    ) -> anyhow::Result<Option<(String, Arc<Device>)>> {
        let no_zeroes = client_flags & u32::from(NBD_FLAG_NO_ZEROES) != 0;
        loop {
            let magic = stream.read_u64().await?;
            if magic != NBD_IHAVEOPT {
                return Err(anyhow!("bad option magic: {magic:#x}"));
            }
            let option = stream.read_u32().await?;
            let data_len = stream.read_u32().await?;
            if data_len > MAX_OPTION_BYTES {
                return Err(anyhow!("option {option} payload too large: {data_len}"));
            }

            let mut option_data = vec![0u8; data_len as usize];
            stream.read_exact(&mut option_data).await?;

            match option {
                NBD_OPT_ABORT => {
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    return Ok(None);
                }

                NBD_OPT_LIST => {
                    for device in self.registry.list_devices() {
                        let name = device.name.as_bytes();
                        let mut reply = Vec::with_capacity(4 + name.len());
                        reply.extend_from_slice(&(name.len() as u32).to_be_bytes());
                        reply.extend_from_slice(name);
                        send_option_reply(stream, option, NBD_REP_SERVER, &reply).await?;
                    }
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                }

                NBD_OPT_INFO | NBD_OPT_GO => {
                    // u32 name_len + name + u16 number of info requests
                    let Some(name) = parse_export_name(&option_data) else {
                        send_option_reply(stream, option, NBD_REP_ERR_INVALID, b"malformed option")
                            .await?;
                        continue;
                    };

                    let device = match self.registry.open(&name) {
                        Ok(device) => device,
                        Err(e) => {
                            debug!("NBD: export '{name}' unavailable: {e}");
                            send_option_reply(stream, option, NBD_REP_ERR_UNKNOWN, b"export not found")
                                .await?;
                            continue;
                        }
                    };

                    let info = export_info(&device);
                    let sent = async {
                        send_option_reply(stream, option, NBD_REP_INFO, &info).await?;
                        send_option_reply(stream, option, NBD_REP_ACK, &[]).await
                    }
                    .await;

                    if option == NBD_OPT_GO && sent.is_ok() {
                        return Ok(Some((name, device)));
                    }
                    self.registry.close(&name)?;
                    sent?;
                }

                NBD_OPT_EXPORT_NAME => {
                    // No reply on failure: the connection is simply dropped
                    let name = String::from_utf8_lossy(&option_data).to_string();
                    let device = self
                        .registry
                        .open(&name)
                        .map_err(|e| anyhow!("export '{name}': {e}"))?;

                    let mut reply = Vec::with_capacity(10 + 124);
                    reply.extend_from_slice(&device.size_bytes().to_be_bytes());
                    reply.extend_from_slice(&transmission_flags().to_be_bytes());
                    if !no_zeroes {
                        reply.extend_from_slice(&[0u8; 124]);
                    }
                    if let Err(e) = stream.write_all(&reply).await {
                        self.registry.close(&name)?;
                        return Err(e.into());
                    }
                    return Ok(Some((name, device)));
                }

                _ => {
                    send_option_reply(stream, option, NBD_REP_ERR_UNSUP, b"unsupported").await?;
                }
            }
        }
    }
}

const fn transmission_flags() -> u16 {
    NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH
}

fn parse_export_name(option_data: &[u8]) -> Option<String> {
    let len_bytes: [u8; 4] = option_data.get(..4)?.try_into().ok()?;
    let name_len = u32::from_be_bytes(len_bytes) as usize;
    let name = option_data.get(4..4 + name_len)?;
    Some(String::from_utf8_lossy(name).to_string())
}

/// `NBD_INFO_EXPORT`: u16 info type + u64 size + u16 transmission flags
fn export_info(device: &Device) -> Vec<u8> {
    let mut info = Vec::with_capacity(12);
    info.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
    info.extend_from_slice(&device.size_bytes().to_be_bytes());
    info.extend_from_slice(&transmission_flags().to_be_bytes());
    info
}

async fn send_option_reply(
    stream: &mut TcpStream,
    option: u32,
    reply_type: u32,
    data: &[u8],
) -> anyhow::Result<()> {
    stream.write_u64(NBD_OPTION_REPLY_MAGIC).await?;
    stream.write_u32(option).await?;
    stream.write_u32(reply_type).await?;
    stream.write_u32(data.len() as u32).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    Ok(())
}

async fn data_phase(stream: TcpStream, device: &Device, peer: SocketAddr) -> anyhow::Result<()> {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let replies = tokio::spawn(write_replies(writer, rx));

    let result = read_requests(reader, device, &tx, peer).await;

    // The writer ends once every in-flight completion has replied
    drop(tx);
    let written = replies.await.context("NBD reply writer panicked")?;
    result.and(written)
}

async fn read_requests(
    mut reader: OwnedReadHalf,
    device: &Device,
    tx: &mpsc::UnboundedSender<Reply>,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    loop {
        // magic(4) + flags(2) + type(2) + handle(8) + offset(8) + length(4)
        let magic = reader.read_u32().await?;
        if magic != NBD_REQUEST_MAGIC {
            return Err(anyhow!("bad request magic: {magic:#x}"));
        }
        let _flags = reader.read_u16().await?;
        let cmd = reader.read_u16().await?;
        let handle = reader.read_u64().await?;
        let offset = reader.read_u64().await?;
        let length = reader.read_u32().await?;

        match cmd {
            NBD_CMD_READ => {
                if length > MAX_REQUEST_BYTES {
                    reply_now(tx, handle, EINVAL);
                    continue;
                }
                let tx = tx.clone();
                device.submit(PendingRequest::read(offset, length as usize, move |done| {
                    send_completion(&tx, handle, done);
                }));
            }

            NBD_CMD_WRITE => {
                if length > MAX_REQUEST_BYTES {
                    return Err(anyhow!("write of {length} bytes exceeds the request limit"));
                }
                let mut data = BytesMut::zeroed(length as usize);
                reader.read_exact(&mut data).await?;
                let tx = tx.clone();
                device.submit(PendingRequest::write(offset, data, move |done| {
                    send_completion(&tx, handle, done);
                }));
            }

            NBD_CMD_FLUSH => {
                // Writes are acknowledged only once stored remotely
                reply_now(tx, handle, 0);
            }

            NBD_CMD_DISC => {
                debug!("NBD: client {peer} sent disconnect for '{}'", device.name());
                return Ok(());
            }

            _ => {
                warn!("NBD: unknown command {cmd} from {peer}");
                reply_now(tx, handle, EINVAL);
            }
        }
    }
}

fn reply_now(tx: &mpsc::UnboundedSender<Reply>, handle: u64, error: u32) {
    // The writer only goes away with the session
    let _ = tx.send(Reply {
        handle,
        error,
        data: None,
    });
}

/// Completion callback body, runs on a worker thread
fn send_completion(tx: &mpsc::UnboundedSender<Reply>, handle: u64, done: CompletedRequest) {
    let reply = match done.result {
        Ok(()) => {
            let is_read = done.direction == Direction::Read;
            Reply {
                handle,
                error: 0,
                data: is_read.then(|| done.into_data()),
            }
        }
        Err(e) => Reply {
            handle,
            error: e.errno().unsigned_abs(),
            data: None,
        },
    };
    let _ = tx.send(reply);
}

async fn write_replies(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Reply>,
) -> anyhow::Result<()> {
    while let Some(reply) = rx.recv().await {
        // Reply: magic(4) + error(4) + handle(8) [+ data]
        let mut header = [0u8; 16];
        header[..4].copy_from_slice(&NBD_REPLY_MAGIC.to_be_bytes());
        header[4..8].copy_from_slice(&reply.error.to_be_bytes());
        header[8..].copy_from_slice(&reply.handle.to_be_bytes());
        writer.write_all(&header).await?;
        if let Some(data) = reply.data {
            writer.write_all(&data).await?;
        }
    }
    writer.shutdown().await?;
    Ok(())
}
