//! RestBlock block driver core
//!
//! This crate exposes remote objects, stored on an HTTP object store, as
//! block devices. Every attached device owns a pool of worker threads; each
//! worker owns one persistent connection to the object store and turns
//! queued block requests into HTTP range requests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Block Producer │  (NBD front end, tests)
//! └────────┬────────┘
//!          │ PendingRequest
//! ┌────────▼────────┐
//! │     Device      │  RequestQueue + WorkerPool
//! └────────┬────────┘
//!          │ one ConnectionDescriptor per worker
//! ┌────────▼────────┐
//! │  Range ops      │  get_size / get_range / put_range
//! │  Retry + xchg   │  reconnect once, recycle after 100 requests
//! │  Transport      │  blocking TCP, cancellable
//! └────────┬────────┘
//!          │ HTTP/1.1
//! ┌────────▼────────┐
//! │  Object Store   │
//! └─────────────────┘
//! ```
//!
//! The [`Registry`] holds the known servers and the device table and is the
//! entry point for attach and detach.

pub mod descriptor;
pub mod device;
pub mod exchange;
pub mod http;
pub mod queue;
pub mod range;
pub mod registry;
pub mod request;
pub mod stats;
pub mod transport;
pub mod worker;

pub use descriptor::{ConnState, ConnStats, ConnectionDescriptor, REUSE_LIMIT};
pub use device::{DEVICE_NAME_MAX_LEN, Device, DeviceInfo};
pub use exchange::{ResponseSize, retried_send_receive, send_receive};
pub use range::{get_range, get_size, put_range};
pub use registry::Registry;
pub use request::{CompletedRequest, Direction, PendingRequest};
pub use stats::{IoStats, IoStatsSnapshot, LatencyHistogram};
pub use transport::{Xfer, connect, disconnect, sock_xmit};
pub use worker::{WorkerContext, WorkerPool};

pub use restblock_common::{Error, Result, SECTOR_SIZE};
