use mqtt::packet::VariablePacketError;
use thiserror::Error;

/// Error returned by broker operations.
///
/// Every fatal kind (protocol, transport, deadline, back-pressure) ends up
/// funneled into the idempotent `Session::shutdown` path, where it is
/// recorded as the terminal cause of the connection.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The codec could not decode a control packet from the byte stream.
    #[error("codec error: {0}")]
    Codec(#[from] VariablePacketError),
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    /// The first packet on the wire was not CONNECT.
    #[error("expected CONNECT as the first packet")]
    ExpectedConnect,
    #[error("connect timed out")]
    ConnectTimeout,
    /// The per-packet read deadline expired, i.e. a keepalive violation.
    #[error("read timed out")]
    ReadTimeout,
    /// The bounded write queue was full at enqueue time. Slow consumers are
    /// severed rather than allowed to back-pressure publishers.
    #[error("write queue full")]
    WriteQueueFull,
    #[error("topic retired")]
    TopicRetired,
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// A topic name or filter failed codec validation (client side).
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    /// The peer answered a request with something other than the expected
    /// acknowledgement (client side).
    #[error("unexpected packet: {0}")]
    UnexpectedPacket(String),
}
