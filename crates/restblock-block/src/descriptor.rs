//! Per-worker connection state
//!
//! A [`ConnectionDescriptor`] is owned by exactly one worker thread. It holds
//! the target object, the open socket (if any), the reuse counter and the
//! transmit buffer shared by request building and response delivery.

use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use restblock_common::ObjectUrl;

use crate::http::{self, Method};

/// Requests served on one socket before it is recycled
pub const REUSE_LIMIT: u32 = 100;

/// Default number of attempts per range request
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Connection state, derived from socket presence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connected,
}

/// Counters kept per descriptor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnStats {
    /// Successful connects, including reconnects
    pub connects: u64,
    /// Reconnects performed after the peer closed mid-exchange
    pub reconnects: u64,
    /// Calls to the exchange routine
    pub exchanges: u64,
}

/// Connection descriptor for one object
pub struct ConnectionDescriptor {
    url: ObjectUrl,
    host: String,
    pub(crate) stream: Option<TcpStream>,
    pub(crate) nb_requests: u32,
    pub(crate) xmit: Vec<u8>,
    pub(crate) timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    attempts: u32,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) stats: ConnStats,
}

impl ConnectionDescriptor {
    /// Create a disconnected descriptor for `url`
    #[must_use]
    pub fn new(url: ObjectUrl) -> Self {
        Self {
            host: url.host().to_string(),
            url,
            stream: None,
            nb_requests: 0,
            xmit: Vec::new(),
            timeout: None,
            connect_timeout: None,
            attempts: DEFAULT_ATTEMPTS,
            cancel: Arc::new(AtomicBool::new(false)),
            stats: ConnStats::default(),
        }
    }

    /// Socket I/O timeout and connect timeout, `None` disables either
    #[must_use]
    pub const fn with_timeouts(
        mut self,
        timeout: Option<Duration>,
        connect_timeout: Option<Duration>,
    ) -> Self {
        self.timeout = timeout;
        self.connect_timeout = connect_timeout;
        self
    }

    /// Attempts made by each range operation on this descriptor
    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Disconnected copy of a template descriptor.
    ///
    /// Target, timeouts and retry budget are copied; the copy gets its own
    /// socket slot, counters, buffer and cancellation flag.
    #[must_use]
    pub fn from_template(template: &Self) -> Self {
        Self::new(template.url.clone())
            .with_timeouts(template.timeout, template.connect_timeout)
            .with_attempts(template.attempts)
    }

    #[must_use]
    pub const fn url(&self) -> &ObjectUrl {
        &self.url
    }

    #[must_use]
    pub const fn state(&self) -> ConnState {
        if self.stream.is_some() {
            ConnState::Connected
        } else {
            ConnState::Disconnected
        }
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Requests issued on the current socket
    #[must_use]
    pub const fn nb_requests(&self) -> u32 {
        self.nb_requests
    }

    #[must_use]
    pub const fn stats(&self) -> ConnStats {
        self.stats
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Response of the last successful exchange
    #[must_use]
    pub fn response(&self) -> &[u8] {
        &self.xmit
    }

    /// Share a cancellation flag with other descriptors
    pub fn set_cancel_flag(&mut self, cancel: Arc<AtomicBool>) {
        self.cancel = cancel;
    }

    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn prepare_range_request(&mut self, method: Method, start: u64, end: u64) {
        http::write_range_request(
            &mut self.xmit,
            method,
            &self.host,
            self.url.path(),
            start,
            end,
        );
    }

    pub(crate) fn prepare_metadata_request(&mut self) {
        http::write_metadata_request(&mut self.xmit, &self.host, self.url.path());
    }
}

impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("url", &self.url)
            .field("state", &self.state())
            .field("nb_requests", &self.nb_requests)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
