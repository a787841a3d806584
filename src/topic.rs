//! A named topic and its subscriber table.
//!
//! Topic names are matched byte-exactly; `+`, `#` and `$` get no special
//! treatment. A topic oscillates between `Idle` (no subscribers) and `Live`;
//! `Down` is terminal and entered when the reaper finds the topic empty or
//! an administrative sweep tears it down.

use crate::{Error, Registry, Session};
use mqtt::packet::publish::QoSWithPacketIdentifier;
use mqtt::packet::{PublishPacket, VariablePacket};
use mqtt::TopicName;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopicState {
    Idle,
    Live,
    Down,
}

#[derive(Debug)]
pub(crate) struct Topic {
    name: String,
    /// State and subscriber table share one lock. Critical sections only
    /// mutate or snapshot the map; no network work happens under the lock.
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: TopicState,
    clients: HashMap<String, Session>,
}

impl Topic {
    pub(crate) fn new(name: &str) -> Topic {
        Topic {
            name: name.to_owned(),
            inner: RwLock::new(Inner {
                state: TopicState::Idle,
                clients: HashMap::new(),
            }),
        }
    }

    pub(crate) fn is_down(&self) -> bool {
        self.inner.read().unwrap().state == TopicState::Down
    }

    /// Add a subscriber, keyed by its client identifier.
    ///
    /// A duplicate identifier overwrites the previous entry. A retiring
    /// topic refuses new subscribers; the registry hands out a fresh
    /// replacement for it instead.
    pub(crate) fn subscribe(&self, session: Session) {
        let mut inner = self.inner.write().unwrap();
        if inner.state == TopicState::Down {
            return;
        }
        let client_id = session.client_id().to_owned();
        inner.clients.insert(client_id, session);
        if inner.state == TopicState::Idle {
            inner.state = TopicState::Live;
        }
    }

    /// Remove the entry keyed by the session's client identifier.
    ///
    /// An emptied topic goes back to `Idle`; retirement is solely the
    /// reaper's responsibility.
    pub(crate) fn unsubscribe(&self, session: &Session) {
        let mut inner = self.inner.write().unwrap();
        if inner.state == TopicState::Down {
            return;
        }
        inner.clients.remove(session.client_id());
        if inner.clients.is_empty() {
            inner.state = TopicState::Idle;
        }
    }

    /// Fan a publication out to every live subscriber.
    ///
    /// The subscriber set is snapshotted under the shared lock and the lock
    /// released before enqueueing, so slow writers never serialize
    /// publishers; the snapshot tolerates concurrent (un)subscribes. One
    /// broker-assigned message id is drawn per broadcast; it reaches the
    /// wire only on QoS 1 deliveries, the only outbound publishes that carry
    /// a packet identifier.
    pub(crate) fn broadcast(&self, registry: &Registry, publish: &PublishPacket) {
        let subscribers: Vec<Session> = {
            let inner = self.inner.read().unwrap();
            if inner.state != TopicState::Live {
                return;
            }
            inner
                .clients
                .values()
                .filter(|session| !session.is_down())
                .cloned()
                .collect()
        };

        let message_id = registry.next_message_id();
        let qos = match publish.qos() {
            QoSWithPacketIdentifier::Level0 => QoSWithPacketIdentifier::Level0,
            _ => QoSWithPacketIdentifier::Level1(message_id),
        };

        let topic_name = match TopicName::new(publish.topic_name().to_owned()) {
            Ok(name) => name,
            // The inbound packet was decoded with a valid topic name.
            Err(_) => return,
        };
        let outbound = PublishPacket::new(topic_name, qos, publish.payload().to_vec());

        for session in subscribers {
            session.enqueue(VariablePacket::PublishPacket(outbound.clone()));
        }
    }

    /// Evict subscribers whose session has gone down; an emptied topic is
    /// retired.
    pub(crate) fn reap(&self) {
        let survivors = {
            let mut inner = self.inner.write().unwrap();
            if inner.state == TopicState::Down {
                return;
            }
            inner.clients.retain(|_, session| !session.is_down());
            inner.clients.len()
        };

        info!(topic = %self.name, clients = survivors, "topic swept");
        if survivors == 0 {
            self.retire();
        }
    }

    /// Terminally shut the topic down, severing any remaining subscribers.
    ///
    /// Idempotent. The client snapshot is drained while the exclusive lock
    /// is held, so a re-entrant subscriber cannot slip in between the state
    /// flip and the teardown; removal from the registry map happens on the
    /// registry side.
    pub(crate) fn retire(&self) {
        let clients: Vec<Session> = {
            let mut inner = self.inner.write().unwrap();
            if inner.state == TopicState::Down {
                return;
            }
            inner.state = TopicState::Down;
            inner.clients.drain().map(|(_, session)| session).collect()
        };

        for session in clients {
            session.shutdown(Some(Error::TopicRetired));
        }
        info!(topic = %self.name, "topic retired");
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.read().unwrap().clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionGauge;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn test_session(client_id: &str) -> (Session, mpsc::Receiver<VariablePacket>) {
        let (write_tx, write_rx) = mpsc::channel(16);
        let session = Session::new(write_tx, Arc::new(ConnectionGauge::default()));
        session.set_client_id(client_id);
        session.set_alive();
        (session, write_rx)
    }

    fn publish_qos0(topic: &str, payload: &[u8]) -> PublishPacket {
        PublishPacket::new(
            TopicName::new(topic).unwrap(),
            QoSWithPacketIdentifier::Level0,
            payload.to_vec(),
        )
    }

    #[tokio::test]
    async fn broadcast_reaches_every_live_subscriber() {
        let registry = Registry::new();
        let topic = Topic::new("t/1");

        let (alive_a, mut rx_a) = test_session("a");
        let (alive_b, mut rx_b) = test_session("b");
        let (dead, mut rx_dead) = test_session("dead");
        topic.subscribe(alive_a);
        topic.subscribe(alive_b);
        topic.subscribe(dead.clone());
        dead.shutdown(None);

        topic.broadcast(&registry, &publish_qos0("t/1", b"payload"));

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                VariablePacket::PublishPacket(publish) => {
                    assert_eq!(publish.topic_name(), "t/1");
                    assert_eq!(publish.payload(), b"payload");
                }
                other => panic!("expected a publish, got {other:?}"),
            }
        }
        // Sessions that are already down never see the broadcast.
        assert!(rx_dead.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_stamps_a_fresh_qos1_message_id() {
        let registry = Registry::new();
        let topic = Topic::new("t/1");
        let (session, mut rx) = test_session("a");
        topic.subscribe(session);

        let inbound = PublishPacket::new(
            TopicName::new("t/1").unwrap(),
            QoSWithPacketIdentifier::Level1(999),
            b"x".to_vec(),
        );
        topic.broadcast(&registry, &inbound);

        match rx.try_recv().unwrap() {
            VariablePacket::PublishPacket(publish) => {
                // The broker re-stamps the id from its own counter.
                assert_eq!(publish.qos(), QoSWithPacketIdentifier::Level1(1));
            }
            other => panic!("expected a publish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_topic_drops_broadcasts() {
        let registry = Registry::new();
        let topic = Topic::new("t/1");
        let (session, mut rx) = test_session("a");

        topic.subscribe(session.clone());
        topic.unsubscribe(&session);

        topic.broadcast(&registry, &publish_qos0("t/1", b"payload"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_client_id_overwrites() {
        let registry = Registry::new();
        let topic = Topic::new("t/1");
        let (first, mut rx_first) = test_session("same");
        let (second, mut rx_second) = test_session("same");

        topic.subscribe(first);
        topic.subscribe(second);
        assert_eq!(topic.subscriber_count(), 1);

        topic.broadcast(&registry, &publish_qos0("t/1", b"payload"));
        assert!(rx_first.try_recv().is_err());
        assert!(rx_second.try_recv().is_ok());
    }

    #[tokio::test]
    async fn reap_evicts_dead_subscribers_and_retires_empty_topics() {
        let topic = Topic::new("t/1");
        let (session, _rx) = test_session("a");
        topic.subscribe(session.clone());

        session.shutdown(None);
        topic.reap();

        assert_eq!(topic.subscriber_count(), 0);
        assert!(topic.is_down());
    }

    #[tokio::test]
    async fn retire_severs_remaining_subscribers_and_is_idempotent() {
        let topic = Topic::new("t/1");
        let (session, _rx) = test_session("a");
        topic.subscribe(session.clone());

        topic.retire();
        topic.retire();

        assert!(topic.is_down());
        assert!(session.is_down());
        assert_eq!(session.last_error(), Some("topic retired".to_string()));
    }

    #[tokio::test]
    async fn retired_topic_refuses_new_subscribers() {
        let registry = Registry::new();
        let topic = Topic::new("t/1");
        topic.retire();

        let (session, mut rx) = test_session("late");
        topic.subscribe(session.clone());
        topic.unsubscribe(&session);

        assert_eq!(topic.subscriber_count(), 0);
        topic.broadcast(&registry, &publish_qos0("t/1", b"payload"));
        assert!(rx.try_recv().is_err());
        // The late subscriber itself is untouched, only ignored.
        assert!(!session.is_down());
    }
}
