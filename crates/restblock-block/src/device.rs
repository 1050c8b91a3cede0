//! Attached block device
//!
//! A [`Device`] binds one remote object to a worker pool. Requests submitted
//! to it are queued and served by the pool's threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use restblock_common::{DebugLevel, DriverConfig, Error, ObjectUrl, Result, SECTOR_SIZE};
use serde::Serialize;
use tracing::{debug, info};

use crate::descriptor::ConnectionDescriptor;
use crate::request::PendingRequest;
use crate::stats::{IoStats, IoStatsSnapshot};
use crate::transport::disconnect;
use crate::worker::{WorkerContext, WorkerPool};

/// Device names must be shorter than this
pub const DEVICE_NAME_MAX_LEN: usize = 32;

/// Block device backed by a remote object
#[derive(Debug)]
pub struct Device {
    context: Arc<WorkerContext>,
    url: ObjectUrl,
    size_bytes: u64,
    users: AtomicUsize,
    cancel: Arc<AtomicBool>,
    pool: Mutex<Option<WorkerPool>>,
}

/// Administrative view of a device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub url: String,
    pub size_bytes: u64,
    pub capacity_sectors: u64,
    pub users: usize,
    pub workers: usize,
    pub debug_level: DebugLevel,
    pub stats: IoStatsSnapshot,
}

impl Device {
    /// Start serving `url` with one worker per connected descriptor
    pub fn start(
        name: &str,
        url: ObjectUrl,
        size_bytes: u64,
        descriptors: Vec<ConnectionDescriptor>,
        config: &DriverConfig,
    ) -> Result<Self> {
        let context = Arc::new(WorkerContext::new(name, config.completion, config.log_level));
        let pool = WorkerPool::start(Arc::clone(&context), descriptors)?;
        info!(
            device = name,
            url = %url,
            size_bytes,
            workers = pool.size(),
            "Device started"
        );

        Ok(Self {
            context,
            url,
            size_bytes,
            users: AtomicUsize::new(0),
            cancel: pool.cancel_flag(),
            pool: Mutex::new(Some(pool)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.context.name()
    }

    #[must_use]
    pub const fn url(&self) -> &ObjectUrl {
        &self.url
    }

    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Capacity in 512-byte sectors
    #[must_use]
    pub const fn capacity_sectors(&self) -> u64 {
        self.size_bytes / SECTOR_SIZE
    }

    #[must_use]
    pub fn users(&self) -> usize {
        self.users.load(Ordering::Acquire)
    }

    pub(crate) fn open(&self) -> usize {
        self.users.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn close(&self) -> usize {
        let previous = self
            .users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or_default();
        previous.saturating_sub(1)
    }

    #[must_use]
    pub fn debug_level(&self) -> DebugLevel {
        self.context.debug_level()
    }

    pub fn set_debug_level(&self, level: DebugLevel) {
        self.context.set_debug_level(level);
        info!(device = self.name(), %level, "Debug level changed");
    }

    #[must_use]
    pub fn stats(&self) -> &IoStats {
        self.context.stats()
    }

    /// Queue a request for the workers.
    ///
    /// Requests past the end of the device, or submitted after shutdown,
    /// complete immediately with an error.
    pub fn submit(&self, request: PendingRequest) {
        let end = u64::try_from(request.len())
            .ok()
            .and_then(|len| request.offset().checked_add(len));
        if end.is_none_or(|end| end > self.size_bytes) {
            let msg = format!(
                "request at {} of {} bytes exceeds device size {}",
                request.offset(),
                request.len(),
                self.size_bytes
            );
            request.complete(Err(Error::InvalidArgument(msg)));
            return;
        }

        if let Err(request) = self.context.queue().push(request) {
            debug!(device = self.name(), "Request submitted to a stopped device");
            request.complete(Err(Error::NoSuchDevice(self.name().to_string())));
        }
    }

    /// Abort in-flight transfers of all workers.
    ///
    /// Also effective while [`Device::shutdown`] drains the queue: every
    /// request still queued or in flight completes with
    /// [`Error::Interrupted`].
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        info!(device = self.name(), "Device cancelled");
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Drain the queue, stop the workers and close their connections.
    ///
    /// Idempotent; returns the number of connections closed.
    pub fn shutdown(&self) -> usize {
        let Some(mut pool) = self.pool.lock().take() else {
            return 0;
        };
        let descriptors = pool.shutdown();
        let closed = descriptors.len();
        for mut desc in descriptors {
            disconnect(&mut desc);
        }
        info!(device = self.name(), connections = closed, "Device stopped");
        closed
    }

    #[must_use]
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name().to_string(),
            url: self.url.as_str().to_string(),
            size_bytes: self.size_bytes,
            capacity_sectors: self.capacity_sectors(),
            users: self.users(),
            workers: self.pool.lock().as_ref().map_or(0, WorkerPool::size),
            debug_level: self.debug_level(),
            stats: self.stats().snapshot(),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::CompletedRequest;
    use crate::transport::connect;
    use bytes::BytesMut;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// Accept one connection and answer every write with 204
    fn spawn_sink() -> (u16, thread::JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut writes = 0;
            let mut data = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                match sock.read(&mut byte) {
                    Ok(0) | Err(_) => return writes,
                    Ok(_) => data.push(byte[0]),
                }
                if data.ends_with(b"\r\n\r\n") {
                    let head = String::from_utf8(std::mem::take(&mut data)).unwrap();
                    let len: usize = head
                        .lines()
                        .find_map(|l| l.strip_prefix("Content-Length: "))
                        .unwrap()
                        .parse()
                        .unwrap();
                    let mut body = vec![0u8; len];
                    sock.read_exact(&mut body).unwrap();
                    sock.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
                    writes += 1;
                }
            }
        });
        (port, handle)
    }

    fn start_device(port: u16) -> Device {
        let url = ObjectUrl::parse(&format!("http://127.0.0.1:{port}/vol/disk")).unwrap();
        let mut desc = ConnectionDescriptor::new(url.clone())
            .with_timeouts(Some(Duration::from_secs(5)), Some(Duration::from_secs(5)));
        connect(&mut desc).unwrap();
        let config = DriverConfig {
            completion: restblock_common::CompletionPolicy::Strict,
            ..DriverConfig::default()
        };
        Device::start("srbtest", url, 1 << 20, vec![desc], &config).unwrap()
    }

    #[test]
    fn test_submit_and_shutdown() {
        let (port, server) = spawn_sink();
        let device = start_device(port);
        assert_eq!(device.capacity_sectors(), 2048);
        assert_eq!(device.info().workers, 1);

        let (tx, rx) = mpsc::channel::<CompletedRequest>();
        device.submit(PendingRequest::write(4096, BytesMut::zeroed(4096), move |done| {
            tx.send(done).unwrap();
        }));
        assert!(rx.recv().unwrap().result.is_ok());

        assert_eq!(device.shutdown(), 1);
        assert_eq!(device.shutdown(), 0);
        assert_eq!(server.join().unwrap(), 1);

        let (tx, rx) = mpsc::channel::<CompletedRequest>();
        device.submit(PendingRequest::read(0, 512, move |done| tx.send(done).unwrap()));
        assert!(matches!(rx.recv().unwrap().result, Err(Error::NoSuchDevice(_))));
    }

    #[test]
    fn test_submit_out_of_bounds() {
        let (port, server) = spawn_sink();
        let device = start_device(port);

        let (tx, rx) = mpsc::channel::<CompletedRequest>();
        device.submit(PendingRequest::read((1 << 20) - 256, 512, move |done| {
            tx.send(done).unwrap();
        }));
        assert!(matches!(rx.recv().unwrap().result, Err(Error::InvalidArgument(_))));

        drop(device);
        assert_eq!(server.join().unwrap(), 0);
    }

    #[test]
    fn test_cancel_interrupts_stalled_request() {
        // Reads the request and never answers
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            while matches!(sock.read(&mut buf), Ok(n) if n > 0) {}
        });
        let device = start_device(port);

        let (tx, rx) = mpsc::channel::<CompletedRequest>();
        device.submit(PendingRequest::read(0, 4096, move |done| tx.send(done).unwrap()));
        thread::sleep(Duration::from_millis(200));
        assert!(!device.is_cancelled());
        device.cancel();
        assert!(device.is_cancelled());

        let done = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert!(matches!(done.result, Err(Error::Interrupted)));

        // Queued after cancel: interrupted without touching the socket
        let (tx, rx) = mpsc::channel::<CompletedRequest>();
        device.submit(PendingRequest::read(0, 512, move |done| tx.send(done).unwrap()));
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(3)).unwrap().result,
            Err(Error::Interrupted)
        ));

        drop(device);
        server.join().unwrap();
    }

    #[test]
    fn test_users_and_debug_level() {
        let (port, server) = spawn_sink();
        let device = start_device(port);

        assert_eq!(device.open(), 1);
        assert_eq!(device.open(), 2);
        assert_eq!(device.close(), 1);
        assert_eq!(device.close(), 0);
        assert_eq!(device.close(), 0);

        device.set_debug_level(DebugLevel::Trace);
        assert_eq!(device.info().debug_level, DebugLevel::Trace);

        drop(device);
        server.join().unwrap();
    }
}
