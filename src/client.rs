//! Minimal MQTT client.
//!
//! Backed by a single `TcpStream`, [`Client`] provides just enough client
//! functionality to drive the broker: connect, subscribe, unsubscribe,
//! publish at QoS 0 or 1, ping, and receive broker-pushed publications. No
//! pooling, retrying or resubscription.

use crate::{Connection, Error, Result};
use mqtt::control::variable_header::ConnectReturnCode;
use mqtt::packet::publish::QoSWithPacketIdentifier;
use mqtt::packet::suback::SubscribeReturnCode;
use mqtt::packet::{
    ConnectPacket, DisconnectPacket, PingreqPacket, PublishPacket, SubscribePacket,
    UnsubscribePacket, VariablePacket,
};
use mqtt::{QualityOfService, TopicFilter, TopicName};
use std::collections::VecDeque;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// Established connection with a broker.
#[derive(Debug)]
pub struct Client {
    /// The TCP connection decorated with the MQTT packet encoder / decoder.
    connection: Connection<TcpStream>,
    /// Last packet identifier handed out for SUBSCRIBE/UNSUBSCRIBE/QoS 1
    /// PUBLISH requests.
    packet_id: u16,
    /// Publications that arrived interleaved while this client was waiting
    /// for an acknowledgement; handed out by `next_publish` first.
    pending: VecDeque<PublishPacket>,
}

impl Client {
    /// Establish a connection with the broker located at `addr` and perform
    /// the CONNECT handshake under the given client identifier.
    pub async fn connect(addr: impl ToSocketAddrs, client_id: &str) -> Result<Client> {
        let socket = TcpStream::connect(addr).await?;
        let mut connection = Connection::new(socket);

        let mut connect = ConnectPacket::new(client_id);
        connect.set_clean_session(true);
        connection
            .write_packet(&VariablePacket::ConnectPacket(connect))
            .await?;

        match connection.read_packet().await? {
            Some(VariablePacket::ConnackPacket(connack)) => {
                if connack.connect_return_code() != ConnectReturnCode::ConnectionAccepted {
                    return Err(Error::UnexpectedPacket(format!(
                        "connection refused: {:?}",
                        connack.connect_return_code()
                    )));
                }
            }
            other => return Err(unexpected(other)),
        }

        Ok(Client {
            connection,
            packet_id: 0,
            pending: VecDeque::new(),
        })
    }

    /// Subscribe to the given topic filters with one requested QoS.
    ///
    /// Returns the per-topic return codes granted by the broker.
    pub async fn subscribe(
        &mut self,
        topics: &[&str],
        qos: QualityOfService,
    ) -> Result<Vec<SubscribeReturnCode>> {
        let filters = topics
            .iter()
            .map(|topic| {
                TopicFilter::new(*topic)
                    .map(|filter| (filter, qos))
                    .map_err(|err| Error::InvalidTopic(err.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let packet_id = self.next_packet_id();
        self.connection
            .write_packet(&VariablePacket::SubscribePacket(SubscribePacket::new(
                packet_id, filters,
            )))
            .await?;

        loop {
            match self.connection.read_packet().await? {
                Some(VariablePacket::SubackPacket(suback))
                    if suback.packet_identifier() == packet_id =>
                {
                    return Ok(suback.subscribes().to_vec());
                }
                // Broadcast deliveries may interleave with the ack.
                Some(VariablePacket::PublishPacket(publish)) => self.pending.push_back(publish),
                other => return Err(unexpected(other)),
            }
        }
    }

    /// Unsubscribe from the given topic filters.
    pub async fn unsubscribe(&mut self, topics: &[&str]) -> Result<()> {
        let filters = topics
            .iter()
            .map(|topic| {
                TopicFilter::new(*topic).map_err(|err| Error::InvalidTopic(err.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let packet_id = self.next_packet_id();
        self.connection
            .write_packet(&VariablePacket::UnsubscribePacket(UnsubscribePacket::new(
                packet_id, filters,
            )))
            .await?;

        loop {
            match self.connection.read_packet().await? {
                Some(VariablePacket::UnsubackPacket(unsuback))
                    if unsuback.packet_identifier() == packet_id =>
                {
                    return Ok(());
                }
                Some(VariablePacket::PublishPacket(publish)) => self.pending.push_back(publish),
                other => return Err(unexpected(other)),
            }
        }
    }

    /// Publish a message at QoS 0 (fire and forget).
    pub async fn publish(&mut self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        let topic =
            TopicName::new(topic).map_err(|err| Error::InvalidTopic(err.to_string()))?;
        let publish = PublishPacket::new(topic, QoSWithPacketIdentifier::Level0, payload);
        self.connection
            .write_packet(&VariablePacket::PublishPacket(publish))
            .await
    }

    /// Publish a message at QoS 1 and wait for the broker's PUBACK.
    ///
    /// Returns the packet identifier the acknowledgement matched.
    pub async fn publish_qos1(
        &mut self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<u16> {
        let topic =
            TopicName::new(topic).map_err(|err| Error::InvalidTopic(err.to_string()))?;
        let packet_id = self.next_packet_id();
        let publish =
            PublishPacket::new(topic, QoSWithPacketIdentifier::Level1(packet_id), payload);
        self.connection
            .write_packet(&VariablePacket::PublishPacket(publish))
            .await?;

        loop {
            match self.connection.read_packet().await? {
                Some(VariablePacket::PubackPacket(puback))
                    if puback.packet_identifier() == packet_id =>
                {
                    return Ok(packet_id);
                }
                Some(VariablePacket::PublishPacket(publish)) => self.pending.push_back(publish),
                other => return Err(unexpected(other)),
            }
        }
    }

    /// Ping the broker and wait for the response.
    ///
    /// Often used to keep an otherwise idle connection inside the broker's
    /// read deadline.
    pub async fn ping(&mut self) -> Result<()> {
        self.connection
            .write_packet(&VariablePacket::PingreqPacket(PingreqPacket::new()))
            .await?;

        loop {
            match self.connection.read_packet().await? {
                Some(VariablePacket::PingrespPacket(_)) => return Ok(()),
                Some(VariablePacket::PublishPacket(publish)) => self.pending.push_back(publish),
                other => return Err(unexpected(other)),
            }
        }
    }

    /// Wait for the next broker-pushed publication.
    ///
    /// Returns `None` once the broker closes the connection. Unrelated
    /// control packets are skipped.
    pub async fn next_publish(&mut self) -> Result<Option<PublishPacket>> {
        if let Some(publish) = self.pending.pop_front() {
            return Ok(Some(publish));
        }

        loop {
            match self.connection.read_packet().await? {
                Some(VariablePacket::PublishPacket(publish)) => return Ok(Some(publish)),
                Some(other) => debug!(?other, "skipping non-publish packet"),
                None => return Ok(None),
            }
        }
    }

    /// Send DISCONNECT and give the connection up.
    pub async fn disconnect(mut self) -> Result<()> {
        self.connection
            .write_packet(&VariablePacket::DisconnectPacket(DisconnectPacket::new()))
            .await
    }

    /// Next request packet identifier; wraps, skipping the reserved 0.
    fn next_packet_id(&mut self) -> u16 {
        self.packet_id = self.packet_id.wrapping_add(1);
        if self.packet_id == 0 {
            self.packet_id = 1;
        }
        self.packet_id
    }
}

fn unexpected(packet: Option<VariablePacket>) -> Error {
    match packet {
        Some(packet) => Error::UnexpectedPacket(format!("{packet:?}")),
        None => Error::ConnectionClosed,
    }
}
