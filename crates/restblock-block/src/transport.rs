//! Socket transport: connect, disconnect and full-length transfers
//!
//! All calls block the calling worker thread. Cancellation is cooperative:
//! the descriptor's flag is polled around every socket call, and a raised
//! flag aborts the transfer with [`Error::Interrupted`]. Socket calls wake at
//! least every [`CANCEL_POLL`] so a blocked transfer sees the flag; the
//! configured timeout is enforced as idle time across those wakeups.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use restblock_common::{Error, Result};
use tracing::{debug, error, warn};

use crate::descriptor::ConnectionDescriptor;

/// Longest a socket call blocks before the cancel flag is checked again
pub const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Direction and buffer of one transfer
#[derive(Debug)]
pub enum Xfer<'a> {
    Send(&'a [u8]),
    Receive(&'a mut [u8]),
}

impl Xfer<'_> {
    #[must_use]
    pub const fn len(&self) -> usize {
        match self {
            Self::Send(buf) => buf.len(),
            Self::Receive(buf) => buf.len(),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Open the descriptor's socket. No-op when already connected.
///
/// The socket is configured with `TCP_NODELAY` and the descriptor's I/O
/// timeout. A socket that fails configuration is closed before returning.
pub fn connect(desc: &mut ConnectionDescriptor) -> Result<()> {
    if desc.is_connected() {
        return Ok(());
    }

    let addr = desc.url().socket_addr();
    let stream = match desc.connect_timeout() {
        Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
        None => TcpStream::connect(addr),
    }
    .map_err(|source| {
        error!(%addr, error = %source, "Connection failed");
        Error::ConnectFailed { addr, source }
    })?;

    configure(&stream, desc).map_err(|source| {
        error!(%addr, error = %source, "Socket configuration failed");
        Error::ConnectFailed { addr, source }
    })?;

    debug!(%addr, "Connected");
    desc.stream = Some(stream);
    desc.nb_requests = 0;
    desc.stats.connects += 1;
    Ok(())
}

fn configure(stream: &TcpStream, desc: &ConnectionDescriptor) -> std::io::Result<()> {
    let wakeup = desc.timeout().map_or(CANCEL_POLL, |t| t.min(CANCEL_POLL));
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(wakeup))?;
    stream.set_write_timeout(Some(wakeup))?;
    Ok(())
}

/// Close the descriptor's socket. Never fails; no-op when disconnected.
pub fn disconnect(desc: &mut ConnectionDescriptor) {
    if let Some(stream) = desc.stream.take() {
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            debug!(error = %e, "Socket shutdown failed");
        }
        debug!(addr = %desc.url().socket_addr(), "Disconnected");
    }
}

/// Peer-side terminations, reported as [`Error::PeerClosed`]
const fn is_peer_closed(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
    )
}

/// Transfer the whole buffer, or for a non-strict receive stop after the
/// first successful read.
///
/// Returns the number of bytes moved. A zero-byte socket call means the peer
/// closed the connection. Interrupted system calls are retried.
pub fn sock_xmit(desc: &mut ConnectionDescriptor, mut xfer: Xfer<'_>, strict: bool) -> Result<usize> {
    let ConnectionDescriptor {
        stream,
        cancel,
        timeout,
        ..
    } = desc;
    let Some(stream) = stream.as_mut() else {
        error!("Not connected");
        return Err(Error::NotConnected);
    };

    let size = xfer.len();
    let mut done = 0;
    let mut last_progress = Instant::now();
    while done < size {
        if cancel.load(Ordering::Acquire) {
            debug!(done, size, "Transfer cancelled");
            return Err(Error::Interrupted);
        }

        let result = match &mut xfer {
            Xfer::Send(buf) => stream.write(&buf[done..]),
            Xfer::Receive(buf) => stream.read(&mut buf[done..]),
        };

        match result {
            Ok(0) => {
                debug!(done, size, "Empty socket exchange, peer closed");
                return Err(Error::PeerClosed);
            }
            Ok(n) => {
                done += n;
                last_progress = Instant::now();
                if matches!(xfer, Xfer::Receive(_)) && !strict {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if timeout.is_some_and(|t| last_progress.elapsed() >= t) {
                    warn!(done, size, "Socket transfer timed out");
                    return Err(Error::Io(e));
                }
            }
            Err(e) if is_peer_closed(e.kind()) => {
                debug!(error = %e, "Peer closed the connection");
                return Err(Error::PeerClosed);
            }
            Err(e) => {
                warn!(error = %e, done, size, "Socket transfer failed");
                return Err(Error::Io(e));
            }
        }

        if cancel.load(Ordering::Acquire) {
            debug!(done, size, "Transfer cancelled");
            return Err(Error::Interrupted);
        }
    }

    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ConnState;
    use restblock_common::ObjectUrl;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn descriptor_for(listener: &TcpListener) -> ConnectionDescriptor {
        let port = listener.local_addr().unwrap().port();
        let url = ObjectUrl::parse(&format!("http://127.0.0.1:{port}/obj")).unwrap();
        ConnectionDescriptor::new(url)
            .with_timeouts(Some(Duration::from_secs(5)), Some(Duration::from_secs(5)))
    }

    #[test]
    fn test_connect_and_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut desc = descriptor_for(&listener);

        connect(&mut desc).unwrap();
        assert_eq!(desc.state(), ConnState::Connected);
        assert_eq!(desc.stats().connects, 1);

        // Connecting again keeps the same socket
        connect(&mut desc).unwrap();
        assert_eq!(desc.stats().connects, 1);

        disconnect(&mut desc);
        assert_eq!(desc.state(), ConnState::Disconnected);
        disconnect(&mut desc);
        assert_eq!(desc.state(), ConnState::Disconnected);
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut desc = descriptor_for(&listener);
        drop(listener);

        let err = connect(&mut desc).unwrap_err();
        assert!(matches!(err, Error::ConnectFailed { .. }));
        assert_eq!(desc.state(), ConnState::Disconnected);
    }

    #[test]
    fn test_xmit_not_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut desc = descriptor_for(&listener);
        let err = sock_xmit(&mut desc, Xfer::Send(b"x"), true).unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[test]
    fn test_xmit_strict_receive_collects_partial_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut desc = descriptor_for(&listener);

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            for part in [&b"hel"[..], b"lo ", b"world"] {
                sock.write_all(part).unwrap();
                sock.flush().unwrap();
                thread::sleep(Duration::from_millis(20));
            }
        });

        connect(&mut desc).unwrap();
        let mut buf = [0u8; 11];
        let n = sock_xmit(&mut desc, Xfer::Receive(&mut buf), true).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
        server.join().unwrap();
    }

    #[test]
    fn test_xmit_non_strict_receive_returns_early() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut desc = descriptor_for(&listener);

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"abc").unwrap();
            // Keep the socket open until the client is done
            let mut sink = [0u8; 1];
            let _ = sock.read(&mut sink);
        });

        connect(&mut desc).unwrap();
        let mut buf = [0u8; 64];
        let n = sock_xmit(&mut desc, Xfer::Receive(&mut buf), false).unwrap();
        assert_eq!(&buf[..n], b"abc");
        disconnect(&mut desc);
        server.join().unwrap();
    }

    #[test]
    fn test_xmit_peer_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut desc = descriptor_for(&listener);

        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            drop(sock);
        });

        connect(&mut desc).unwrap();
        server.join().unwrap();
        let mut buf = [0u8; 8];
        let err = sock_xmit(&mut desc, Xfer::Receive(&mut buf), true).unwrap_err();
        assert!(err.is_peer_closed());
    }

    #[test]
    fn test_xmit_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut desc = descriptor_for(&listener);
        connect(&mut desc).unwrap();

        desc.cancel_flag().store(true, Ordering::Release);
        let err = sock_xmit(&mut desc, Xfer::Send(b"payload"), false).unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[test]
    fn test_xmit_cancel_wakes_blocked_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut desc = descriptor_for(&listener);
        connect(&mut desc).unwrap();
        // Accepted but silent peer
        let (_peer, _) = listener.accept().unwrap();

        let cancel = desc.cancel_flag();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            cancel.store(true, Ordering::Release);
        });

        let started = Instant::now();
        let mut buf = [0u8; 8];
        let err = sock_xmit(&mut desc, Xfer::Receive(&mut buf), true).unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(4));
        canceller.join().unwrap();
    }

    #[test]
    fn test_xmit_idle_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = ObjectUrl::parse(&format!("http://127.0.0.1:{port}/obj")).unwrap();
        let mut desc = ConnectionDescriptor::new(url)
            .with_timeouts(Some(Duration::from_millis(300)), Some(Duration::from_secs(5)));
        connect(&mut desc).unwrap();
        let (_peer, _) = listener.accept().unwrap();

        let started = Instant::now();
        let mut buf = [0u8; 8];
        let err = sock_xmit(&mut desc, Xfer::Receive(&mut buf), true).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_xmit_empty_buffer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut desc = descriptor_for(&listener);
        connect(&mut desc).unwrap();
        assert_eq!(sock_xmit(&mut desc, Xfer::Send(&[]), true).unwrap(), 0);
    }
}
