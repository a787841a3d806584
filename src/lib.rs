//! A lightweight MQTT 3.1.1 publish/subscribe message broker.
//!
//! The broker accepts long-lived TCP connections, maintains a dynamic set of
//! named topics with subscriber sets, and fans every published message out to
//! the subscribers of the byte-exact matching topic. It is deliberately
//! ephemeral: no persistence, no retained messages, no wildcard filters, no
//! authentication. QoS 0 and QoS 1 are supported; QoS 2 is not.

use std::time::Duration;

pub mod client;
pub use client::Client;

pub mod connection;
pub use connection::Connection;

pub mod error;
pub use error::Error;

mod registry;
pub(crate) use registry::Registry;

pub mod server;

mod session;
pub(crate) use session::Session;

mod topic;
pub(crate) use topic::Topic;

/// Default port the broker listens on.
///
/// Used if no address is specified.
pub const DEFAULT_PORT: u16 = 1883;

/// Deadline for the peer's initial CONNECT packet after accept.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-packet read deadline. Expiry is treated as a keepalive violation and
/// severs the connection.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the background sweep that evicts dead subscribers and retires
/// empty topics.
pub const CLEAR_TOPIC_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of the per-connection inbound and outbound packet queues.
pub(crate) const QUEUE_CAPACITY: usize = 256;

/// Largest control packet the framing layer will accept before severing the
/// peer.
pub(crate) const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// A specialized `Result` type for broker operations.
pub type Result<T> = std::result::Result<T, Error>;
