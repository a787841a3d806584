//! MQTT control-packet framing over a byte stream, usually a remote peer via
//! a [`TcpStream`].

use crate::{Error, Result, MAX_PACKET_SIZE};
use bytes::{Buf, BytesMut};
use mqtt::packet::VariablePacket;
use mqtt::{Decodable, Encodable};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, error};

const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

/// Send and receive control packets from a remote peer.
///
/// To read packets, the `Connection` uses an internal buffer, which is filled
/// up until there are enough bytes for a complete control packet. Once this
/// happens, the packet is decoded and returned to the caller; any surplus
/// bytes stay buffered for the next call.
///
/// When sending packets, the packet is first encoded into a scratch buffer
/// and then written to the stream in one piece.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    /// Buffer used for framing inbound packets.
    buffer: BytesMut,
    /// Reusable encode buffer for outbound packets.
    scratch: Vec<u8>,
}

/// A trait for types that can be used as a connection stream.
pub trait ConnectionStream: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types that implement `AsyncRead + AsyncWrite + Unpin + Send`.
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConnectionStream for T {}

impl<S: ConnectionStream> Connection<S> {
    /// Create a new `Connection` from a socket.
    pub fn new(socket: S) -> Self {
        Self {
            stream: socket,
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            scratch: Vec::new(),
        }
    }

    /// Read a single control packet from the connection.
    ///
    /// Waits until enough data has arrived to frame a full packet. Returns
    /// `None` if the stream is closed cleanly on a packet boundary.
    pub async fn read_packet(&mut self) -> Result<Option<VariablePacket>> {
        read_packet_from(&mut self.stream, &mut self.buffer).await
    }

    /// Write a control packet to the connection's underlying stream.
    pub async fn write_packet(&mut self, packet: &VariablePacket) -> Result<()> {
        write_packet_to(&mut self.stream, &mut self.scratch, packet).await
    }
}

impl Connection<TcpStream> {
    /// Split the connection into independently owned read and write halves
    /// so the two I/O pumps can run as separate tasks.
    ///
    /// Bytes already buffered (e.g. read together with the CONNECT packet
    /// during the handshake) are carried over into the read half.
    pub(crate) fn into_split(self) -> (PacketReader<OwnedReadHalf>, PacketWriter<OwnedWriteHalf>) {
        let (reader, writer) = self.stream.into_split();
        (
            PacketReader {
                reader,
                buffer: self.buffer,
            },
            PacketWriter {
                writer,
                scratch: self.scratch,
            },
        )
    }
}

/// The inbound half of a split [`Connection`], owned by the read pump.
#[derive(Debug)]
pub(crate) struct PacketReader<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub(crate) async fn read_packet(&mut self) -> Result<Option<VariablePacket>> {
        read_packet_from(&mut self.reader, &mut self.buffer).await
    }
}

/// The outbound half of a split [`Connection`], owned by the write pump.
#[derive(Debug)]
pub(crate) struct PacketWriter<W> {
    writer: W,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub(crate) async fn write_packet(&mut self, packet: &VariablePacket) -> Result<()> {
        write_packet_to(&mut self.writer, &mut self.scratch, packet).await
    }
}

async fn read_packet_from<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<Option<VariablePacket>> {
    loop {
        // Attempt to frame a packet from the buffered data. If enough data
        // has been buffered, the packet is returned.
        if let Some(packet) = parse_packet(buffer)? {
            debug!(?packet, "packet received");
            return Ok(Some(packet));
        }

        // Not enough buffered data for a full packet. Attempt to read more
        // from the stream; `0` indicates "end of stream".
        if 0 == reader.read_buf(buffer).await? {
            // The remote closed the connection. For this to be a clean
            // shutdown, there must be no partial packet in the read buffer.
            if buffer.is_empty() {
                return Ok(None);
            }
            error!("connection was closed mid packet");
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection was closed mid packet",
            )));
        }
    }
}

async fn write_packet_to<W: AsyncWrite + Unpin>(
    writer: &mut W,
    scratch: &mut Vec<u8>,
    packet: &VariablePacket,
) -> Result<()> {
    debug!(?packet, "writing packet");
    scratch.clear();
    packet.encode(scratch)?;
    writer.write_all(scratch).await?;
    writer.flush().await.map_err(Error::from)
}

/// Tries to decode one packet from the buffered data.
///
/// Returns `Ok(None)` while the fixed header or the packet body is still
/// incomplete. Decode failures on a complete frame are protocol-fatal.
fn parse_packet(buffer: &mut BytesMut) -> Result<Option<VariablePacket>> {
    let total = match packet_len(buffer)? {
        Some(total) => total,
        None => return Ok(None),
    };

    if total > MAX_PACKET_SIZE {
        return Err(Error::MalformedPacket("packet exceeds maximum size"));
    }
    if buffer.len() < total {
        return Ok(None);
    }

    // The frame is complete: decode exactly `total` bytes and discard them
    // from the buffer.
    let mut cursor = Cursor::new(&buffer[..total]);
    let packet = VariablePacket::decode(&mut cursor)?;
    buffer.advance(total);

    Ok(Some(packet))
}

/// Total on-wire length of the packet at the head of `buf`, if its fixed
/// header is complete: one type byte, a remaining-length varint of up to
/// four bytes, then the remaining bytes themselves.
fn packet_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut remaining = 0usize;
    for (i, &byte) in buf[1..].iter().enumerate() {
        if i == 4 {
            return Err(Error::MalformedPacket("remaining length exceeds four bytes"));
        }
        remaining |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some(1 + i + 1 + remaining));
        }
    }

    // The varint itself is still incomplete.
    Ok(None)
}
