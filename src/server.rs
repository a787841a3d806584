//! Broker server implementation.
//!
//! Provides an async `run` function that listens for inbound connections,
//! spawning a task per connection. Each connection performs the MQTT
//! handshake and then splits into three cooperating tasks: a read pump, a
//! write pump and the dispatcher that runs in the handler itself.

use crate::registry::RegistryDropGuard;
use crate::{Connection, Error, Registry, Result, Session, CONNECT_TIMEOUT, QUEUE_CAPACITY};
use mqtt::control::variable_header::ConnectReturnCode;
use mqtt::packet::publish::QoSWithPacketIdentifier;
use mqtt::packet::suback::SubscribeReturnCode;
use mqtt::packet::{
    ConnackPacket, ConnectPacket, PingrespPacket, PubackPacket, SubackPacket, UnsubackPacket,
    VariablePacket,
};
use mqtt::QualityOfService;
use std::future::Future;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

/// Listener state: the bound socket plus everything each new connection's
/// handler gets wired up with.
#[derive(Debug)]
struct Listener {
    /// Owner of the shared topic registry and its reaper task. Dropping it
    /// retires whatever topics remain.
    registry_holder: RegistryDropGuard,
    /// Bound TCP listener supplied by the `run` caller.
    listener: TcpListener,
    /// Admission control: each live connection holds one semaphore permit,
    /// so accepting pauses once `MAX_CONNECTIONS` handlers are running.
    limit_connections: Arc<Semaphore>,
    /// Sender half of the shutdown broadcast; every handler subscribes to
    /// it at accept time.
    notify_shutdown: broadcast::Sender<()>,
    /// Cloned into every handler. The channel closing, once the last clone
    /// is dropped, is how `run` learns that all handlers have finished.
    shutdown_complete_tx: mpsc::Sender<()>,
}

/// Per-connection handler. Performs the CONNECT handshake, starts the I/O
/// pumps and then dispatches inbound packets against the topic registry.
#[derive(Debug)]
struct Handler {
    /// Shared topic registry handle.
    ///
    /// SUBSCRIBE and UNSUBSCRIBE mutate it; PUBLISH looks topics up in it.
    registry: Registry,
    /// The TCP connection decorated with the MQTT packet encoder / decoder.
    ///
    /// The handshake runs on the whole connection; afterwards it is split
    /// into a read half and a write half, one per pump task.
    connection: Connection<TcpStream>,
    /// Shared per-connection state: lifecycle, outbound queue, eof signal.
    session: Session,
    /// Consumer side of the session's bounded outbound queue, handed to the
    /// write pump once the handshake completes.
    write_rx: mpsc::Receiver<VariablePacket>,
    /// Receiver for the server-wide shutdown broadcast. A message, or the
    /// sender going away, is the dispatcher's cue to shut the session down
    /// cooperatively.
    shutdown: broadcast::Receiver<()>,
    /// Not used directly; notifies the receiver half once all handler clones
    /// are dropped, which lets the server finish its graceful shutdown.
    _shutdown_complete: mpsc::Sender<()>,
}

/// Maximum number of concurrent connections the broker will accept.
///
/// When this limit is reached, the server stops accepting connections until
/// an active connection terminates.
const MAX_CONNECTIONS: usize = 1024;

/// Run the broker on an already-bound listener until the `shutdown` future
/// completes.
///
/// Every accepted socket gets its own handler task. When `shutdown`
/// resolves (the binary wires process termination signals into it), the
/// accept loop stops, every in-flight handler is notified, and `run` waits
/// for them to drain before tearing the topic registry down.
pub async fn run(listener: TcpListener, shutdown: impl Future) {
    // Two channels coordinate the shutdown: the broadcast fans the signal
    // out to every handler, and the mpsc channel closing (once the last
    // handler drops its clone of the sender) marks the drain complete.
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

    let mut server = Listener {
        listener,
        registry_holder: RegistryDropGuard::new(),
        limit_connections: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        notify_shutdown,
        shutdown_complete_tx,
    };

    // The accept loop never completes on its own; this select runs until
    // the shutdown future fires and then simply stops polling the loop.
    // Sockets already accepted belong to their handler tasks, not to the
    // listener, so dropping it mid-accept severs nobody.
    tokio::select! {
        _ = server.serve() => {}
        _ = shutdown => info!("shutting down"),
    }

    let Listener {
        notify_shutdown,
        shutdown_complete_tx,
        registry_holder,
        ..
    } = server;

    // Dropping the broadcast sender is the shutdown signal itself; dropping
    // our completion sender leaves the handler clones as the only thing
    // keeping that channel open, so the recv below resolves exactly when
    // the last handler exits.
    drop(notify_shutdown);
    drop(shutdown_complete_tx);
    let _ = shutdown_complete_rx.recv().await;

    // All handlers have drained; retire whatever topics remain.
    drop(registry_holder);
}

impl Listener {
    /// Accept connections forever, one handler task per socket.
    ///
    /// Never returns; `run` stops polling it once the shutdown future
    /// fires. Accept failures (file-descriptor exhaustion, handshakes
    /// aborted by the peer) are logged and retried after a short pause
    /// rather than treated as fatal.
    async fn serve(&mut self) {
        info!("accepting inbound connections");

        loop {
            // One permit per live connection; the semaphore itself is
            // never closed.
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .expect("admission semaphore closed");

            let socket = match self.listener.accept().await {
                Ok((socket, _)) => socket,
                Err(err) => {
                    error!(cause = %err, "accept failed");
                    time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            // Wire up the per-connection state. The session handle exists
            // from the moment the socket is accepted, so the live-connection
            // gauge also counts connections still in their handshake.
            let registry = self.registry_holder.registry();
            let (write_tx, write_rx) = mpsc::channel(QUEUE_CAPACITY);
            let handler = Handler {
                session: Session::new(write_tx, registry.connection_gauge()),
                registry,
                connection: Connection::new(socket),
                write_rx,
                shutdown: self.notify_shutdown.subscribe(),
                _shutdown_complete: self.shutdown_complete_tx.clone(),
            };

            tokio::spawn(async move {
                handler.run().await;
                // Hand the admission permit back.
                drop(permit);
            });
        }
    }
}

impl Handler {
    /// Process a single connection.
    ///
    /// Drives the full lifecycle: CONNECT handshake, pump start-up, packet
    /// dispatch, and the final idempotent session shutdown. All fatal
    /// conditions collapse into `Session::shutdown`, which records the
    /// cause; there is deliberately no error to bubble to the accept loop.
    #[tracing::instrument(skip_all)]
    async fn run(self) {
        let Handler {
            registry,
            mut connection,
            session,
            write_rx,
            mut shutdown,
            _shutdown_complete,
        } = self;

        // The first packet on the wire must be CONNECT, within its deadline.
        let connect = match handshake(&mut connection).await {
            Ok(connect) => connect,
            Err(err) => {
                session.shutdown(Some(err));
                return;
            }
        };
        session.set_client_id(connect.client_identifier());
        // CleanSession is accepted but has no effect: there are no
        // persistent sessions to resume.
        debug!(
            client_id = %session.client_id(),
            clean_session = connect.clean_session(),
            "client connected"
        );

        // Subscribe every eof listener before the session handle can leak
        // into the registry, so the single shutdown signal cannot be missed
        // by a pump that has not started running yet.
        let read_eof = session.eof_listener();
        let write_eof = session.eof_listener();
        let mut eof = session.eof_listener();

        let (read_tx, mut read_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (reader, writer) = connection.into_split();
        tokio::spawn(session.clone().read_pump(reader, read_tx, read_eof));
        tokio::spawn(session.clone().write_pump(writer, write_rx, write_eof));
        session.set_alive();

        if !session.enqueue(VariablePacket::ConnackPacket(ConnackPacket::new(
            false,
            ConnectReturnCode::ConnectionAccepted,
        ))) {
            return;
        }

        // Dispatch loop: one packet at a time, until the peer goes away, the
        // session dies, or the server begins its graceful shutdown.
        loop {
            let packet = tokio::select! {
                maybe = read_rx.recv() => match maybe {
                    Some(packet) => packet,
                    None => break,
                },
                _ = eof.wait() => break,
                _ = shutdown.recv() => break,
            };

            handle_packet(&registry, &session, packet);

            if session.is_down() {
                break;
            }
        }

        // Idempotent: makes the pumps unwind whichever way the loop was
        // left.
        session.shutdown(None);
    }
}

/// Read the initial packet and require it to be CONNECT.
async fn handshake(connection: &mut Connection<TcpStream>) -> Result<ConnectPacket> {
    let packet = time::timeout(CONNECT_TIMEOUT, connection.read_packet())
        .await
        .map_err(|_| Error::ConnectTimeout)??;

    match packet {
        Some(VariablePacket::ConnectPacket(connect)) => Ok(connect),
        Some(_) => Err(Error::ExpectedConnect),
        None => Err(Error::ConnectionClosed),
    }
}

/// Apply one inbound control packet.
///
/// Locally-recoverable conditions (publish or unsubscribe against an unknown
/// topic) are logged and dropped; everything fatal has already been routed
/// through `Session::shutdown` by the time this returns.
fn handle_packet(registry: &Registry, session: &Session, packet: VariablePacket) {
    match packet {
        VariablePacket::PingreqPacket(_) => {
            session.enqueue(VariablePacket::PingrespPacket(PingrespPacket::new()));
        }
        VariablePacket::DisconnectPacket(_) => {
            session.shutdown(None);
        }
        VariablePacket::SubscribePacket(subscribe) => {
            let mut return_codes = Vec::with_capacity(subscribe.subscribes().len());
            for (filter, qos) in subscribe.subscribes() {
                let topic = registry.get_or_create(filter);
                topic.subscribe(session.clone());
                // Granted QoS is capped at 1.
                return_codes.push(match qos {
                    QualityOfService::Level0 => SubscribeReturnCode::MaximumQoSLevel0,
                    _ => SubscribeReturnCode::MaximumQoSLevel1,
                });
            }
            session.enqueue(VariablePacket::SubackPacket(SubackPacket::new(
                subscribe.packet_identifier(),
                return_codes,
            )));
        }
        VariablePacket::UnsubscribePacket(unsubscribe) => {
            for filter in unsubscribe.subscribes() {
                // Lookup only; unsubscribing never creates a topic.
                match registry.get(filter) {
                    Some(topic) => topic.unsubscribe(session),
                    None => debug!(topic = ?filter, "unsubscribe from unknown topic"),
                }
            }
            session.enqueue(VariablePacket::UnsubackPacket(UnsubackPacket::new(
                unsubscribe.packet_identifier(),
            )));
        }
        VariablePacket::PublishPacket(publish) => {
            match publish.qos() {
                QoSWithPacketIdentifier::Level0 => {}
                QoSWithPacketIdentifier::Level1(pkid) => {
                    // Acknowledge before fan-out; at-least-once is owed to
                    // the publisher regardless of whether anyone listens.
                    if !session.enqueue(VariablePacket::PubackPacket(PubackPacket::new(pkid))) {
                        return;
                    }
                }
                QoSWithPacketIdentifier::Level2(_) => {
                    debug!(
                        topic = publish.topic_name(),
                        "dropping unsupported qos 2 publish"
                    );
                    return;
                }
            }

            match registry.get(publish.topic_name()) {
                Some(topic) => topic.broadcast(registry, &publish),
                None => debug!(topic = publish.topic_name(), "publish to unknown topic"),
            }
        }
        // A second CONNECT, stray acks and everything else are ignored.
        other => debug!(?other, "ignoring packet"),
    }
}
