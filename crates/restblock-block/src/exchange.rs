//! Request/response exchange over a descriptor's connection
//!
//! The request header is the content of the descriptor's transmit buffer,
//! optionally followed by payload segments. On success the full response
//! replaces the buffer's content. Any failure leaves the descriptor
//! disconnected so the next exchange starts on a fresh socket.

use restblock_common::{Error, Result};
use tracing::{debug, error, info, warn};

use crate::descriptor::{ConnectionDescriptor, REUSE_LIMIT};
use crate::http;
use crate::transport::{Xfer, connect, disconnect, sock_xmit};

/// Receive capacity when the caller does not know the response size
pub const DEFAULT_RESPONSE_CAPACITY: usize = 64 * 1024;

/// Expected response size
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseSize {
    /// The response is exactly this long; every receive fills the remainder
    Exact(usize),
    /// The response fits in this many bytes; receives return what arrived
    AtMost(usize),
}

impl ResponseSize {
    const fn capacity(self) -> usize {
        match self {
            Self::Exact(n) | Self::AtMost(n) => n,
        }
    }

    const fn strict(self) -> bool {
        matches!(self, Self::Exact(_))
    }
}

impl Default for ResponseSize {
    fn default() -> Self {
        Self::AtMost(DEFAULT_RESPONSE_CAPACITY)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
    First,
    AfterReconnect,
}

/// Send the prepared request and receive the response.
///
/// Connections are recycled after [`REUSE_LIMIT`] requests. If the peer
/// closes the connection mid-exchange the whole exchange is replayed once on
/// a new connection. Returns the response length.
pub fn send_receive(
    desc: &mut ConnectionDescriptor,
    payload: &[&[u8]],
    response: ResponseSize,
) -> Result<usize> {
    desc.stats.exchanges += 1;
    if desc.is_cancelled() {
        return Err(Error::Interrupted);
    }

    let mut rcvbuf = alloc_scratch(response.capacity())?;
    let header = std::mem::take(&mut desc.xmit);
    let result = exchange(desc, &header, payload, response.strict(), &mut rcvbuf);
    desc.xmit = header;

    match result {
        Ok(rcvd) => {
            desc.xmit.clear();
            desc.xmit.extend_from_slice(&rcvbuf[..rcvd]);
            Ok(rcvd)
        }
        Err(e) => {
            // Unread response bytes may still be in flight on this socket
            disconnect(desc);
            Err(e)
        }
    }
}

fn alloc_scratch(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|e| {
        error!(len, "Cannot allocate receive buffer");
        Error::ResourceExhausted(format!("receive buffer of {len} bytes: {e}"))
    })?;
    buf.resize(len, 0);
    Ok(buf)
}

fn exchange(
    desc: &mut ConnectionDescriptor,
    header: &[u8],
    payload: &[&[u8]],
    strict: bool,
    rcvbuf: &mut [u8],
) -> Result<usize> {
    if desc.nb_requests >= REUSE_LIMIT {
        debug!(limit = REUSE_LIMIT, "Request limit reached, recycling connection");
        disconnect(desc);
    }
    connect(desc)?;
    desc.nb_requests += 1;

    let mut attempt = Attempt::First;
    loop {
        match transfer(desc, header, payload, strict, rcvbuf) {
            Err(Error::PeerClosed) if attempt == Attempt::First => {
                warn!("Connection closed by peer, reconnecting");
                disconnect(desc);
                connect(desc)?;
                desc.nb_requests += 1;
                desc.stats.reconnects += 1;
                attempt = Attempt::AfterReconnect;
            }
            result => return result,
        }
    }
}

fn transfer(
    desc: &mut ConnectionDescriptor,
    header: &[u8],
    payload: &[&[u8]],
    strict: bool,
    rcvbuf: &mut [u8],
) -> Result<usize> {
    send_all(desc, header)?;
    for segment in payload {
        send_all(desc, segment)?;
    }

    let mut rcvd = 0;
    while !http::is_response_complete(&rcvbuf[..rcvd]) {
        if rcvd == rcvbuf.len() {
            error!(rcvd, "Response does not fit in the receive buffer");
            return Err(Error::Incomplete {
                done: rcvd,
                expected: rcvbuf.len(),
            });
        }
        if rcvd > 0 {
            debug!(rcvd, "Response not read fully in one go");
        }
        rcvd += sock_xmit(desc, Xfer::Receive(&mut rcvbuf[rcvd..]), strict)?;
    }

    Ok(rcvd)
}

fn send_all(desc: &mut ConnectionDescriptor, data: &[u8]) -> Result<()> {
    let sent = sock_xmit(desc, Xfer::Send(data), true)?;
    if sent != data.len() {
        error!(sent, expected = data.len(), "Incomplete transmission");
        return Err(Error::Incomplete {
            done: sent,
            expected: data.len(),
        });
    }
    Ok(())
}

/// Run [`send_receive`] up to `attempts` times.
///
/// The first success is returned; otherwise the error of the last attempt.
/// Cancellation is not retried.
pub fn retried_send_receive(
    desc: &mut ConnectionDescriptor,
    payload: &[&[u8]],
    response: ResponseSize,
    attempts: u32,
) -> Result<usize> {
    if attempts == 0 {
        return Err(Error::invalid_argument("at least one attempt is required"));
    }

    let mut attempt = 1;
    loop {
        match send_receive(desc, payload, response) {
            Ok(rcvd) => return Ok(rcvd),
            Err(e) if attempt < attempts && !matches!(e, Error::Interrupted) => {
                info!(attempt, attempts, error = %e, "Request failed, retrying");
                attempt += 1;
            }
            Err(e) => {
                if attempts > 1 {
                    error!(attempts, error = %e, "Request failed after all attempts");
                }
                return Err(e);
            }
        }
    }
}
