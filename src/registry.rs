//! Process-wide topic registry and its background reaper.
//!
//! The registry is a handle to shared state, cloned into every connection
//! handler. A background task sweeps it at a fixed cadence: topics that went
//! down are dropped from the map, live topics get their dead subscribers
//! evicted, and an emptied topic is retired. The [`RegistryDropGuard`] owns
//! orderly teardown: dropping it stops the reaper and retires every
//! remaining topic.

use crate::{Topic, CLEAR_TOPIC_INTERVAL};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, info};

/// Process-wide count of live connections.
///
/// Incremented when a session is constructed and decremented exactly once by
/// its first effectful shutdown. Sessions hold this handle directly rather
/// than the registry, so topics referencing sessions cannot form a reference
/// cycle back to the registry.
#[derive(Debug, Default)]
pub(crate) struct ConnectionGauge(AtomicUsize);

impl ConnectionGauge {
    pub(crate) fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A wrapper around a `Registry` instance.
///
/// Exists to allow orderly cleanup: when this struct is dropped, the reaper
/// task is signalled to exit and every remaining topic is retired, severing
/// its subscribers.
#[derive(Debug)]
pub(crate) struct RegistryDropGuard {
    registry: Registry,
}

impl RegistryDropGuard {
    pub(crate) fn new() -> Self {
        RegistryDropGuard {
            registry: Registry::new(),
        }
    }

    /// Get the shared registry. Internally this is an `Arc`, so a clone only
    /// increments the ref count.
    pub(crate) fn registry(&self) -> Registry {
        self.registry.clone()
    }
}

impl Drop for RegistryDropGuard {
    fn drop(&mut self) {
        self.registry.teardown();
    }
}

/// Handle to the topic registry shared across all connections.
#[derive(Debug, Clone)]
pub(crate) struct Registry {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    /// Topic map behind a `std::sync::RwLock`: critical sections are small
    /// and never await. Writers are `get_or_create` insertions and reaper
    /// removals.
    state: RwLock<State>,
    /// Broker-assigned publish ids live behind their own mutex, independent
    /// of the topic map, so stamping never contends with lookups.
    message_id: Mutex<u16>,
    connections: Arc<ConnectionGauge>,
    /// Wakes the reaper ahead of its cadence; used for teardown.
    reaper: Notify,
}

#[derive(Debug)]
struct State {
    topics: HashMap<String, Arc<Topic>>,
    /// Set on teardown; tells the reaper task to exit.
    shutdown: bool,
}

impl Registry {
    /// Create a new empty registry and spawn its background reaper.
    pub(crate) fn new() -> Self {
        let shared = Arc::new(Shared {
            state: RwLock::new(State {
                topics: HashMap::new(),
                shutdown: false,
            }),
            message_id: Mutex::new(0),
            connections: Arc::new(ConnectionGauge::default()),
            reaper: Notify::new(),
        });

        tokio::spawn(reap_stale_topics(shared.clone()));

        Self { shared }
    }

    /// Look a topic up by exact name.
    pub(crate) fn get(&self, name: &str) -> Option<Arc<Topic>> {
        self.shared.state.read().unwrap().topics.get(name).cloned()
    }

    /// Return the topic registered under `name`, creating it if necessary.
    ///
    /// Double-checked: the fast path is a shared-lock read; the slow path
    /// constructs the topic outside the lock and re-checks under the
    /// exclusive lock so concurrent callers all observe a single instance.
    /// A topic that went down but has not been swept yet is treated as
    /// absent and replaced, so a subscribe racing the reaper lands in a live
    /// topic instead of a retired shell.
    pub(crate) fn get_or_create(&self, name: &str) -> Arc<Topic> {
        if let Some(topic) = self.get(name) {
            if !topic.is_down() {
                return topic;
            }
        }

        let fresh = Arc::new(Topic::new(name));
        let mut state = self.shared.state.write().unwrap();
        match state.topics.get(name) {
            Some(existing) if !existing.is_down() => existing.clone(),
            _ => {
                state.topics.insert(name.to_owned(), fresh.clone());
                fresh
            }
        }
    }

    /// Draw the next broker-assigned message id.
    ///
    /// Globally monotonic modulo the natural 16-bit wrap; two concurrent
    /// broadcasts always receive distinct ids.
    pub(crate) fn next_message_id(&self) -> u16 {
        let mut id = self.shared.message_id.lock().unwrap();
        *id = id.wrapping_add(1);
        *id
    }

    /// Handle to the live-connection gauge, given to every new session.
    pub(crate) fn connection_gauge(&self) -> Arc<ConnectionGauge> {
        self.shared.connections.clone()
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.shared.connections.count()
    }

    /// Stop the reaper and retire every remaining topic.
    ///
    /// Called by the `RegistryDropGuard`'s `Drop` implementation; the
    /// administrative counterpart of the periodic sweep.
    fn teardown(&self) {
        let topics: Vec<Arc<Topic>> = {
            let mut state = self.shared.state.write().unwrap();
            state.shutdown = true;
            state.topics.drain().map(|(_, topic)| topic).collect()
        };
        self.shared.reaper.notify_one();

        for topic in topics {
            topic.retire();
        }
    }
}

impl Shared {
    fn is_shutdown(&self) -> bool {
        self.state.read().unwrap().shutdown
    }

    /// Drop topics that are already down and snapshot the live ones.
    ///
    /// Holding the registry-wide lock across per-topic reaping would
    /// serialize every subscribe and publish behind bookkeeping; the
    /// snapshot confines the exclusive lock to the map itself.
    fn sweep_topics(&self) -> Vec<Arc<Topic>> {
        let mut state = self.state.write().unwrap();
        let mut live = Vec::with_capacity(state.topics.len());
        state.topics.retain(|_, topic| {
            if topic.is_down() {
                false
            } else {
                live.push(topic.clone());
                true
            }
        });
        live
    }
}

/// Routine executed by the background reaper task.
///
/// Every `CLEAR_TOPIC_INTERVAL`, sweep the registry, log the liveness
/// gauges, and reap each surviving topic with the registry lock released.
async fn reap_stale_topics(shared: Arc<Shared>) {
    while !shared.is_shutdown() {
        tokio::select! {
            _ = time::sleep(CLEAR_TOPIC_INTERVAL) => {}
            _ = shared.reaper.notified() => {}
        }
        if shared.is_shutdown() {
            break;
        }

        let live = shared.sweep_topics();
        info!(
            topics = live.len(),
            connections = shared.connections.count(),
            "alive"
        );
        for topic in live {
            topic.reap();
        }
    }

    debug!("topic reaper shutdown");
}
