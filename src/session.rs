//! Per-connection session state and the two I/O pumps.
//!
//! A [`Session`] is a cheaply cloneable handle shared between the connection
//! handler, the pump tasks and every topic the client subscribes to. Topics
//! treat their clones as non-owning: a session that has gone down accepts no
//! further packets and is evicted by the registry's reaper.

use crate::connection::{PacketReader, PacketWriter};
use crate::registry::ConnectionGauge;
use crate::{Error, READ_TIMEOUT};
use mqtt::packet::VariablePacket;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, warn};

const STATE_NEW: u8 = 0;
const STATE_ALIVE: u8 = 1;
const STATE_DOWN: u8 = 2;

/// Handle to one client connection's shared state.
///
/// The state only ever moves forward: `New` → `Alive` → `Down`. The `Down`
/// transition happens exactly once, no matter how many tasks race to cause
/// it.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    /// Client identifier captured from CONNECT. Set once during the
    /// handshake, immutable thereafter.
    client_id: OnceLock<String>,
    state: AtomicU8,
    /// Producer side of the bounded outbound queue; the write pump owns the
    /// consumer side.
    write_tx: mpsc::Sender<VariablePacket>,
    /// Fired exactly once, on the effectful `shutdown` call. Every pump and
    /// the dispatcher hold a receiver subscribed before the handle is shared.
    eof: broadcast::Sender<()>,
    /// Terminal cause of the shutdown, if any.
    last_error: Mutex<Option<Error>>,
    /// Process-wide live-connection gauge; decremented exactly once.
    connections: Arc<ConnectionGauge>,
}

impl Session {
    pub(crate) fn new(
        write_tx: mpsc::Sender<VariablePacket>,
        connections: Arc<ConnectionGauge>,
    ) -> Self {
        connections.increment();
        let (eof, _) = broadcast::channel(1);
        Session {
            shared: Arc::new(Shared {
                client_id: OnceLock::new(),
                state: AtomicU8::new(STATE_NEW),
                write_tx,
                eof,
                last_error: Mutex::new(None),
                connections,
            }),
        }
    }

    /// The identifier the client presented in CONNECT, or `""` before the
    /// handshake has completed.
    pub(crate) fn client_id(&self) -> &str {
        self.shared.client_id.get().map(String::as_str).unwrap_or("")
    }

    pub(crate) fn set_client_id(&self, client_id: &str) {
        let _ = self.shared.client_id.set(client_id.to_owned());
    }

    /// Mark the handshake as complete. A session that already went down
    /// stays down.
    pub(crate) fn set_alive(&self) {
        let _ = self.shared.state.compare_exchange(
            STATE_NEW,
            STATE_ALIVE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Monotonic read of the terminal state.
    pub(crate) fn is_down(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == STATE_DOWN
    }

    /// A fresh listener on this session's end-of-life signal.
    ///
    /// Must be subscribed before the session handle is shared with anything
    /// that may call `shutdown`, or the single signal could be missed.
    pub(crate) fn eof_listener(&self) -> EofListener {
        EofListener {
            notify: self.shared.eof.subscribe(),
        }
    }

    /// Attempt a non-blocking insertion into the outbound queue.
    ///
    /// Returns `false` if the session is down. A full queue is fatal to this
    /// connection: a subscriber that cannot keep up with the broadcast rate
    /// is severed rather than allowed to back-pressure publishers.
    pub(crate) fn enqueue(&self, packet: VariablePacket) -> bool {
        if self.is_down() {
            return false;
        }
        match self.shared.write_tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.shutdown(Some(Error::WriteQueueFull));
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Transition to `Down` exactly once; subsequent calls are no-ops.
    ///
    /// Records the cause, fires the eof signal and decrements the gauge. The
    /// pumps observe the signal, exit, and drop their socket halves, which
    /// closes the socket and discards any queued writes.
    pub(crate) fn shutdown(&self, cause: Option<Error>) {
        if self.shared.state.swap(STATE_DOWN, Ordering::SeqCst) == STATE_DOWN {
            return;
        }

        match cause {
            Some(err) => {
                warn!(client_id = %self.client_id(), cause = %err, "connection shutdown");
                *self.shared.last_error.lock().unwrap() = Some(err);
            }
            None => debug!(client_id = %self.client_id(), "connection shutdown"),
        }

        let _ = self.shared.eof.send(());
        self.shared.connections.decrement();
    }

    /// The recorded shutdown cause, if the session went down with one.
    #[cfg(test)]
    pub(crate) fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap()
            .as_ref()
            .map(|err| err.to_string())
    }

    /// Pump inbound packets from the socket to the dispatcher's queue.
    ///
    /// Every iteration arms a fresh read deadline; expiry models a keepalive
    /// violation. Any error is terminal. Posting to the queue races the eof
    /// signal so a stalled dispatcher cannot pin this task.
    pub(crate) async fn read_pump(
        self,
        mut reader: PacketReader<OwnedReadHalf>,
        read_tx: mpsc::Sender<VariablePacket>,
        mut eof: EofListener,
    ) {
        while !self.is_down() {
            // Race the socket read against the eof signal so the read half
            // is released promptly when something else shuts the session
            // down; dropping it is what closes the socket.
            let read = tokio::select! {
                read = time::timeout(READ_TIMEOUT, reader.read_packet()) => read,
                _ = eof.wait() => return,
            };

            let packet = match read {
                Ok(Ok(Some(packet))) => packet,
                Ok(Ok(None)) => {
                    self.shutdown(Some(Error::ConnectionClosed));
                    return;
                }
                Ok(Err(err)) => {
                    self.shutdown(Some(err));
                    return;
                }
                Err(_) => {
                    self.shutdown(Some(Error::ReadTimeout));
                    return;
                }
            };

            tokio::select! {
                res = read_tx.send(packet) => {
                    // The dispatcher has exited; nothing left to feed.
                    if res.is_err() {
                        return;
                    }
                }
                _ = eof.wait() => return,
            }
        }
    }

    /// Pump outbound packets from the queue to the socket.
    pub(crate) async fn write_pump(
        self,
        mut writer: PacketWriter<OwnedWriteHalf>,
        mut write_rx: mpsc::Receiver<VariablePacket>,
        mut eof: EofListener,
    ) {
        while !self.is_down() {
            let packet = tokio::select! {
                maybe = write_rx.recv() => match maybe {
                    Some(packet) => packet,
                    None => return,
                },
                _ = eof.wait() => return,
            };

            // The select above may hand out a packet even though the eof
            // signal already fired; nothing must reach the wire once the
            // session is down.
            if self.is_down() {
                return;
            }

            // A peer that stopped reading can block this write until its
            // kernel buffers drain, which may be never; racing the eof
            // signal keeps a severed session from pinning the write half
            // (and with it the socket) forever.
            tokio::select! {
                result = writer.write_packet(&packet) => {
                    if let Err(err) = result {
                        self.shutdown(Some(err));
                        return;
                    }
                }
                _ = eof.wait() => return,
            }
        }
    }
}

/// Listener half of a session's end-of-life signal.
///
/// The signal fires at most once, when the effectful `shutdown` call flips
/// the session to `Down`; from then on every blocked `wait` resolves. The
/// pumps re-check `is_down` before each blocking operation, so a listener
/// whose message was consumed by an earlier race is never waited on again.
#[derive(Debug)]
pub(crate) struct EofListener {
    notify: broadcast::Receiver<()>,
}

impl EofListener {
    /// Resolve once the session has gone down.
    pub(crate) async fn wait(&mut self) {
        // A lag or a closed channel can only mean the signal fired; the
        // sender lives inside the session's shared state.
        let _ = self.notify.recv().await;
    }
}
