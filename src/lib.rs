//! # BACmon
//!
//! Passive monitor for BACnet/IP networks. Datagrams received on the
//! BACnet port are decoded through the protocol stack (BVLL → NPDU →
//! APDU), classified into named traffic families, and counted at second,
//! minute and hour resolution. Rate tasks run anomaly detectors over the
//! recent series and drive per-key alarm state; alarms raise alerts that
//! flow through maintenance and rate-limit gates out to notification
//! channels. A versioned REST/SSE API reads the same store.
//!
//! The monitor never transmits: it is an observer, not a BACnet device.
//!
//! # Architecture
//!
//! Two processes share a Redis-style key-value store and nothing else:
//!
//! - `bacmond` runs the monitor domain, one cooperative loop owning the UDP
//!   socket, the counters ([`count`]) and the rate tasks ([`rate`]), plus
//!   a notification worker ([`alert`]).
//! - `bacmon-api` runs the API domain, parallel request handlers ([`api`])
//!   reading counters and mutating alerts through synchronized accessors.
//!
//! Decoding lives in [`datalink`], [`network`], [`app`] and [`service`],
//! orchestrated by [`decoder`]. The store capability is defined in [`kv`].

pub mod alert;
pub mod api;
pub mod app;
pub mod config;
pub mod count;
pub mod datalink;
pub mod decoder;
pub mod detect;
pub mod encoding;
pub mod kv;
pub mod logging;
pub mod monitor;
pub mod network;
pub mod rate;
pub mod service;

pub use config::BacmonConfig;
pub use count::{Bucket, Resolution};
pub use decoder::{Category, DecodeOutcome, Decoder};
pub use kv::{KvStore, MemoryKv, RedisKv};
pub use monitor::{Monitor, MonitorContext};

/// BACnet protocol version carried by every NPDU
pub const BACNET_PROTOCOL_VERSION: u8 = 1;

/// Largest datagram the monitor will see on an Ethernet network
pub const BACNET_MAX_MPDU: usize = 1497;

/// Seconds since the Unix epoch
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
