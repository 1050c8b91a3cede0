//! Server list and device table
//!
//! The [`Registry`] owns every attached device and the ordered list of
//! object servers devices are attached from. Administrative operations
//! (attach, detach, server management) go through it; no lock is held while
//! talking to a server.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use restblock_common::{DebugLevel, DriverConfig, Error, ObjectUrl, Result, URL_MAX_LEN};
use tracing::{debug, error, info, warn};

use crate::descriptor::ConnectionDescriptor;
use crate::device::{DEVICE_NAME_MAX_LEN, Device, DeviceInfo};
use crate::range::get_size;
use crate::transport::connect;

/// Device table slot
#[derive(Debug)]
enum Slot {
    /// Attach in progress for this object name
    Attaching { object: String },
    Ready(Arc<Device>),
    Detaching(Arc<Device>),
}

impl Slot {
    fn object_name(&self) -> &str {
        match self {
            Self::Attaching { object } => object,
            Self::Ready(dev) | Self::Detaching(dev) => dev.url().basename(),
        }
    }
}

/// Removes a reserved device slot unless the attach commits
struct Reservation<'a> {
    devices: &'a DashMap<String, Slot>,
    name: &'a str,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, device: Arc<Device>) {
        self.devices.insert(self.name.to_string(), Slot::Ready(device));
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.devices.remove(self.name);
        }
    }
}

/// Attached devices and known servers
#[derive(Debug)]
pub struct Registry {
    config: DriverConfig,
    servers: RwLock<Vec<ObjectUrl>>,
    devices: DashMap<String, Slot>,
    /// Serializes the uniqueness checks and slot reservation of attaches
    attach_lock: Mutex<()>,
}

impl Registry {
    #[must_use]
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            servers: RwLock::new(Vec::new()),
            devices: DashMap::new(),
            attach_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    // ── Servers ──

    /// Append a server base URL. Adding a known URL is a no-op.
    pub fn add_server(&self, url: &str) -> Result<()> {
        let url = url.trim();
        let parsed = ObjectUrl::parse(url).inspect_err(|e| {
            error!(url, error = %e, "Cannot add server");
        })?;

        let mut servers = self.servers.write();
        if servers.iter().any(|s| s.as_str() == url) {
            debug!(url, "Server already known");
            return Ok(());
        }
        servers.push(parsed);
        info!(url, "Server added");
        Ok(())
    }

    /// Remove a server. The last server stays while devices are attached.
    pub fn remove_server(&self, url: &str) -> Result<()> {
        let url = url.trim();
        if url.len() >= URL_MAX_LEN {
            return Err(Error::invalid_argument(format!("url too long: {} bytes", url.len())));
        }

        let mut servers = self.servers.write();
        let pos = servers
            .iter()
            .position(|s| s.as_str() == url)
            .ok_or_else(|| {
                error!(url, "Cannot remove server: url is not part of servers");
                Error::NoSuchServer(url.to_string())
            })?;

        if servers.len() == 1 && !self.devices.is_empty() {
            error!(url, "Devices still attached, not removing the last server");
            return Err(Error::Busy(url.to_string()));
        }

        servers.remove(pos);
        info!(url, "Server removed");
        Ok(())
    }

    /// Add every URL of a comma-separated list, stopping at the first error
    pub fn add_servers(&self, list: &str) -> Result<usize> {
        split_list(list).try_fold(0, |n, url| self.add_server(url).map(|()| n + 1))
    }

    /// Remove every URL of a comma-separated list, stopping at the first error
    pub fn remove_servers(&self, list: &str) -> Result<usize> {
        split_list(list).try_fold(0, |n, url| self.remove_server(url).map(|()| n + 1))
    }

    /// Known servers, comma-separated, with a trailing newline
    #[must_use]
    pub fn list_servers(&self) -> String {
        let servers = self.servers.read();
        let mut out = servers
            .iter()
            .map(ObjectUrl::as_str)
            .collect::<Vec<_>>()
            .join(",");
        out.push('\n');
        out
    }

    /// First server able to hold `object`'s URL
    fn pick_server(&self, object: &str) -> Result<ObjectUrl> {
        let servers = self.servers.read();
        servers
            .iter()
            .find_map(|server| match server.reconstruct(object) {
                Ok(url) => Some(url),
                Err(e) => {
                    debug!(server = server.as_str(), error = %e, "Server cannot hold object url");
                    None
                }
            })
            .ok_or_else(|| {
                error!(object, "Could not match any server");
                Error::NoServerAvailable(object.to_string())
            })
    }

    // ── Devices ──

    /// Attach remote object `object` as device `device`.
    ///
    /// Connects one descriptor per worker, reads the object size and starts
    /// the worker pool. The device name is reserved for the whole operation.
    pub fn attach(&self, object: &str, device: &str) -> Result<Arc<Device>> {
        validate_names(object, device)?;
        if self.config.thread_pool_size == 0 {
            return Err(Error::invalid_argument("thread_pool_size must be at least 1"));
        }
        info!(object, device, "Attaching");

        let reservation = self.reserve(object, device)?;
        let dev = Arc::new(self.build_device(object, device)?);
        reservation.commit(Arc::clone(&dev));

        info!(device, url = %dev.url(), size_bytes = dev.size_bytes(), "Attached");
        Ok(dev)
    }

    fn reserve<'a>(&'a self, object: &str, device: &'a str) -> Result<Reservation<'a>> {
        let _guard = self.attach_lock.lock();

        if let Some(existing) = self
            .devices
            .iter()
            .find(|slot| slot.value().object_name() == object)
        {
            error!(object, device = existing.key().as_str(), "Object already attached");
            return Err(Error::AlreadyAttached(object.to_string()));
        }
        if self.devices.len() >= self.config.max_devices {
            error!(object, device, "No device slot available");
            return Err(Error::ResourceExhausted(format!(
                "all {} device slots in use",
                self.config.max_devices
            )));
        }

        match self.devices.entry(device.to_string()) {
            Entry::Occupied(_) => {
                error!(device, "Device name already in use");
                Err(Error::AlreadyAttached(device.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot::Attaching {
                    object: object.to_string(),
                });
                Ok(Reservation {
                    devices: &self.devices,
                    name: device,
                    committed: false,
                })
            }
        }
    }

    fn build_device(&self, object: &str, name: &str) -> Result<Device> {
        let url = self.pick_server(object)?;
        info!(device = name, url = %url, "Picked server");

        let template = ConnectionDescriptor::new(url.clone())
            .with_timeouts(self.config.request_timeout(), self.config.connect_timeout())
            .with_attempts(self.config.request_retries);
        let mut descriptors = Vec::with_capacity(self.config.thread_pool_size);
        for _ in 0..self.config.thread_pool_size {
            let mut desc = ConnectionDescriptor::from_template(&template);
            connect(&mut desc)?;
            descriptors.push(desc);
        }

        let size = get_size(&mut descriptors[0])?;
        Device::start(name, url, size, descriptors, &self.config)
    }

    /// Detach a device: drain its queue, stop its workers, close connections
    pub fn detach(&self, name: &str) -> Result<()> {
        info!(device = name, "Detaching");
        let dev = {
            let mut slot = self.devices.get_mut(name).ok_or_else(|| {
                error!(device = name, "No such device");
                Error::NoSuchDevice(name.to_string())
            })?;
            let dev = match &*slot {
                Slot::Ready(dev) if dev.users() > 0 => {
                    error!(device = name, users = dev.users(), "Device is in use");
                    return Err(Error::Busy(name.to_string()));
                }
                Slot::Ready(dev) => Arc::clone(dev),
                Slot::Attaching { .. } | Slot::Detaching(_) => {
                    error!(device = name, "Attach or detach in progress");
                    return Err(Error::Busy(name.to_string()));
                }
            };
            *slot = Slot::Detaching(Arc::clone(&dev));
            dev
        };

        dev.shutdown();
        self.devices.remove(name);
        info!(device = name, "Detached");
        Ok(())
    }

    /// Detach every device, returning the number of failures
    pub fn detach_all(&self) -> usize {
        let names: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        names
            .iter()
            .filter(|name| match self.detach(name) {
                Ok(()) => false,
                Err(e) => {
                    warn!(device = name.as_str(), error = %e, "Detach failed");
                    true
                }
            })
            .count()
    }

    /// Abort a device's in-flight transfers, including one being detached
    pub fn cancel(&self, name: &str) -> Result<()> {
        match self.devices.get(name).as_deref() {
            Some(Slot::Ready(dev) | Slot::Detaching(dev)) => {
                dev.cancel();
                Ok(())
            }
            _ => Err(Error::NoSuchDevice(name.to_string())),
        }
    }

    /// Cancel every attached device, returning how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let devices: Vec<Arc<Device>> = self
            .devices
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Ready(dev) | Slot::Detaching(dev) => Some(Arc::clone(dev)),
                Slot::Attaching { .. } => None,
            })
            .collect();
        for dev in &devices {
            dev.cancel();
        }
        devices.len()
    }

    /// Take a user reference on a ready device
    pub fn open(&self, name: &str) -> Result<Arc<Device>> {
        let slot = self
            .devices
            .get(name)
            .ok_or_else(|| Error::NoSuchDevice(name.to_string()))?;
        match &*slot {
            Slot::Ready(dev) => {
                let users = dev.open();
                debug!(device = name, users, "Opened");
                Ok(Arc::clone(dev))
            }
            Slot::Attaching { .. } | Slot::Detaching(_) => Err(Error::NoSuchDevice(name.to_string())),
        }
    }

    /// Drop a user reference taken by [`Registry::open`]
    pub fn close(&self, name: &str) -> Result<()> {
        let slot = self
            .devices
            .get(name)
            .ok_or_else(|| Error::NoSuchDevice(name.to_string()))?;
        match &*slot {
            Slot::Ready(dev) | Slot::Detaching(dev) => {
                let users = dev.close();
                debug!(device = name, users, "Closed");
                Ok(())
            }
            Slot::Attaching { .. } => Err(Error::NoSuchDevice(name.to_string())),
        }
    }

    fn ready(&self, name: &str) -> Result<Arc<Device>> {
        match self.devices.get(name).as_deref() {
            Some(Slot::Ready(dev)) => Ok(Arc::clone(dev)),
            _ => Err(Error::NoSuchDevice(name.to_string())),
        }
    }

    pub fn debug_level(&self, name: &str) -> Result<DebugLevel> {
        Ok(self.ready(name)?.debug_level())
    }

    pub fn set_debug_level(&self, name: &str, level: DebugLevel) -> Result<()> {
        self.ready(name)?.set_debug_level(level);
        Ok(())
    }

    pub fn device_info(&self, name: &str) -> Result<DeviceInfo> {
        Ok(self.ready(name)?.info())
    }

    /// Ready devices, sorted by name
    #[must_use]
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .devices
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Ready(dev) => Some(Arc::clone(dev)),
                _ => None,
            })
            .map(|dev| dev.info())
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn validate_names(object: &str, device: &str) -> Result<()> {
    if object.is_empty() || object.contains('/') {
        return Err(Error::invalid_argument(format!("invalid object name: {object:?}")));
    }
    if object.len() >= URL_MAX_LEN {
        return Err(Error::invalid_argument(format!(
            "object name too long: {} bytes",
            object.len()
        )));
    }
    if device.is_empty() || device.len() >= DEVICE_NAME_MAX_LEN {
        return Err(Error::invalid_argument(format!(
            "device name must be 1 to {} bytes",
            DEVICE_NAME_MAX_LEN - 1
        )));
    }
    if device.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(Error::invalid_argument(format!("invalid device name: {device:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CompletedRequest, PendingRequest};
    use bytes::BytesMut;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;

    const OBJECT_SIZE: usize = 64 * 1024;

    fn read_head(sock: &mut TcpStream) -> Option<String> {
        let mut data = Vec::new();
        let mut byte = [0u8; 1];
        while !data.ends_with(b"\r\n\r\n") {
            match sock.read(&mut byte) {
                Ok(0) | Err(_) => return None,
                Ok(_) => data.push(byte[0]),
            }
        }
        String::from_utf8(data).ok()
    }

    fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
        head.lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim())
    }

    /// Object server holding one object named `disk0`, answering every
    /// connection on its own thread until the listener is dropped
    fn spawn_object_server() -> (String, Arc<std::sync::Mutex<Vec<u8>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let object = Arc::new(std::sync::Mutex::new(vec![0u8; OBJECT_SIZE]));
        let data = Arc::clone(&object);
        thread::spawn(move || {
            for sock in listener.incoming() {
                let Ok(mut sock) = sock else { break };
                let data = Arc::clone(&data);
                thread::spawn(move || {
                    while let Some(head) = read_head(&mut sock) {
                        let line = head.lines().next().unwrap_or_default().to_string();
                        if !line.contains("/vols/disk0") {
                            let _ = sock.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
                        } else if line.contains("?metadata") {
                            let body = format!(r#"{{"metadata":{{"cdmi_size":"{OBJECT_SIZE}"}}}}"#);
                            let _ = write!(
                                sock,
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
                                body.len()
                            );
                        } else if line.starts_with("GET") {
                            let range = header(&head, "Range").unwrap();
                            let (start, end) = range["bytes=".len()..].split_once('-').unwrap();
                            let (start, end): (usize, usize) = (start.parse().unwrap(), end.parse().unwrap());
                            let body = data.lock().unwrap()[start..=end].to_vec();
                            let _ = write!(sock, "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\n\r\n", body.len());
                            let _ = sock.write_all(&body);
                        } else {
                            let range = header(&head, "Content-Range").unwrap();
                            let bounds = range["bytes ".len()..].split('/').next().unwrap();
                            let (start, end) = bounds.split_once('-').unwrap();
                            let (start, end): (usize, usize) = (start.parse().unwrap(), end.parse().unwrap());
                            let mut body = vec![0u8; end - start + 1];
                            if sock.read_exact(&mut body).is_err() {
                                return;
                            }
                            data.lock().unwrap()[start..=end].copy_from_slice(&body);
                            let _ = sock.write_all(b"HTTP/1.1 204 No Content\r\n\r\n");
                        }
                    }
                });
            }
        });
        (format!("http://127.0.0.1:{port}/vols"), object)
    }

    fn registry() -> Registry {
        Registry::new(DriverConfig {
            request_timeout_secs: 5,
            connect_timeout_secs: 5,
            thread_pool_size: 2,
            max_devices: 2,
            completion: restblock_common::CompletionPolicy::Strict,
            ..DriverConfig::default()
        })
    }

    #[test]
    fn test_server_list() {
        let registry = registry();
        assert_eq!(registry.list_servers(), "\n");

        registry.add_servers("http://10.0.0.1/a, http://10.0.0.2:81/b").unwrap();
        registry.add_server("http://10.0.0.1/a").unwrap();
        assert_eq!(registry.list_servers(), "http://10.0.0.1/a,http://10.0.0.2:81/b\n");

        assert!(matches!(registry.add_server("ftp://x/y"), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            registry.remove_server("http://10.0.0.3/c"),
            Err(Error::NoSuchServer(_))
        ));

        assert_eq!(registry.remove_servers("http://10.0.0.1/a").unwrap(), 1);
        assert_eq!(registry.list_servers(), "http://10.0.0.2:81/b\n");
    }

    #[test]
    fn test_attach_without_servers() {
        let registry = registry();
        let err = registry.attach("disk0", "srba").unwrap_err();
        assert!(matches!(err, Error::NoServerAvailable(_)));
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn test_attach_validates_names() {
        let registry = registry();
        assert!(matches!(registry.attach("", "srba"), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            registry.attach("disk0", &"x".repeat(DEVICE_NAME_MAX_LEN)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(registry.attach("a/b", "srba"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_attach_io_detach() {
        let (base, object) = spawn_object_server();
        let registry = registry();
        registry.add_server(&base).unwrap();

        let dev = registry.attach("disk0", "srba").unwrap();
        assert_eq!(dev.size_bytes(), OBJECT_SIZE as u64);
        assert_eq!(dev.url().as_str(), format!("{base}/disk0"));
        assert_eq!(registry.list_devices().len(), 1);
        assert_eq!(registry.device_info("srba").unwrap().workers, 2);

        // Write then read back through the worker pool
        let (tx, rx) = mpsc::channel::<CompletedRequest>();
        let payload = BytesMut::from(&[7u8; 1024][..]);
        let done_tx = tx.clone();
        dev.submit(PendingRequest::write(2048, payload, move |done| done_tx.send(done).unwrap()));
        assert!(rx.recv().unwrap().result.is_ok());
        assert!(object.lock().unwrap()[2048..3072].iter().all(|&b| b == 7));

        dev.submit(PendingRequest::read(2048, 1024, move |done| tx.send(done).unwrap()));
        let done = rx.recv().unwrap();
        assert!(done.result.is_ok());
        assert!(done.into_data().iter().all(|&b| b == 7));

        // Same object or same name cannot be attached twice
        assert!(matches!(registry.attach("disk0", "srbb"), Err(Error::AlreadyAttached(_))));

        // Open users block detach
        registry.open("srba").unwrap();
        assert!(matches!(registry.detach("srba"), Err(Error::Busy(_))));
        assert!(matches!(registry.remove_server(&base), Err(Error::Busy(_))));
        registry.close("srba").unwrap();

        registry.detach("srba").unwrap();
        assert_eq!(registry.device_count(), 0);
        assert!(matches!(registry.detach("srba"), Err(Error::NoSuchDevice(_))));
        registry.remove_server(&base).unwrap();
    }

    #[test]
    fn test_attach_missing_object_frees_slot() {
        let (base, _object) = spawn_object_server();
        let registry = registry();
        registry.add_server(&base).unwrap();

        let err = registry.attach("nothere", "srba").unwrap_err();
        assert!(matches!(err, Error::RemoteNotFound(_)));
        assert_eq!(registry.device_count(), 0);
        assert!(matches!(registry.open("srba"), Err(Error::NoSuchDevice(_))));
    }

    #[test]
    fn test_device_table_capacity() {
        let (base, _object) = spawn_object_server();
        let registry = Registry::new(DriverConfig {
            max_devices: 1,
            thread_pool_size: 1,
            ..registry().config().clone()
        });
        registry.add_server(&base).unwrap();

        registry.attach("disk0", "srba").unwrap();
        assert!(matches!(
            registry.attach("other", "srbb"),
            Err(Error::ResourceExhausted(_))
        ));
        assert_eq!(registry.detach_all(), 0);
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn test_cancel_devices() {
        let (base, _object) = spawn_object_server();
        let registry = registry();
        registry.add_server(&base).unwrap();
        let dev = registry.attach("disk0", "srba").unwrap();

        assert!(matches!(registry.cancel("srbz"), Err(Error::NoSuchDevice(_))));
        assert_eq!(registry.cancel_all(), 1);
        assert!(dev.is_cancelled());

        let (tx, rx) = mpsc::channel::<CompletedRequest>();
        dev.submit(PendingRequest::read(0, 512, move |done| tx.send(done).unwrap()));
        assert!(matches!(rx.recv().unwrap().result, Err(Error::Interrupted)));

        registry.cancel("srba").unwrap();
        assert_eq!(registry.detach_all(), 0);
        assert_eq!(registry.cancel_all(), 0);
    }

    #[test]
    fn test_debug_level() {
        let (base, _object) = spawn_object_server();
        let registry = registry();
        registry.add_server(&base).unwrap();
        registry.attach("disk0", "srba").unwrap();

        assert_eq!(registry.debug_level("srba").unwrap(), DebugLevel::Info);
        registry.set_debug_level("srba", DebugLevel::Debug).unwrap();
        assert_eq!(registry.debug_level("srba").unwrap(), DebugLevel::Debug);
        assert!(matches!(registry.debug_level("srbz"), Err(Error::NoSuchDevice(_))));

        assert_eq!(registry.detach_all(), 0);
    }
}
