use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::backends::{handler, Backend};
use crate::command::CommandSpec;
use crate::connection::ConnectionHandle;
use crate::server::Server;
use crate::value::Value;

#[derive(Default)]
struct Topic {
    subscribers: HashSet<SocketAddr>,
}

/// Topic fan-out across connections. The topic table is a `DashMap` so each
/// topic's subscriber set is guarded by its own shard lock; publishing on
/// one topic never serializes behind subscribing on another.
///
/// Delivery is best-effort: a subscriber that is gone or failing is skipped
/// without surfacing anything to the publisher.
pub struct PubSubBackend {
    server: Weak<Server>,
    topics: DashMap<String, Topic>,
}

impl PubSubBackend {
    pub fn register(server: &Arc<Server>) -> Arc<PubSubBackend> {
        let backend = Arc::new(PubSubBackend {
            server: Arc::downgrade(server),
            topics: DashMap::new(),
        });

        server.register_command(
            CommandSpec::new(
                "PUBLISH",
                "Publishes to a specified topic given the data/arguments",
                "PUBLISH topic message",
                true,
            ),
            handler!(backend, publish),
        );
        server.register_command(
            CommandSpec::new(
                "SUBSCRIBE",
                "Subscribes to a specified topic",
                "SUBSCRIBE topic [topic ...]",
                true,
            ),
            handler!(backend, subscribe),
        );
        server.register_command(
            CommandSpec::new(
                "UNSUBSCRIBE",
                "Unsubscribes from a specified topic",
                "UNSUBSCRIBE topic [topic ...]",
                true,
            ),
            handler!(backend, unsubscribe),
        );

        // Connection exits are the source of truth for membership; publish
        // only prunes addresses that slipped through.
        let cleanup = backend.clone();
        server.on_disconnect(Arc::new(move |addr| cleanup.remove_subscriber(addr)));

        backend
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |entry| entry.subscribers.len())
    }

    async fn subscribe(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        for arg in &args {
            let Some(topic) = arg.as_str() else { continue };
            self.topics
                .entry(topic.into_owned())
                .or_default()
                .subscribers
                .insert(client.addr());
        }
        Ok(())
    }

    async fn unsubscribe(&self, args: Vec<Value>, client: ConnectionHandle) -> crate::Result<()> {
        for arg in &args {
            let Some(topic) = arg.as_str() else { continue };
            let mut emptied = false;
            if let Some(mut entry) = self.topics.get_mut(topic.as_ref()) {
                entry.subscribers.remove(&client.addr());
                emptied = entry.subscribers.is_empty();
            }
            if emptied {
                self.topics
                    .remove_if(topic.as_ref(), |_, t| t.subscribers.is_empty());
            }
        }
        Ok(())
    }

    async fn publish(&self, args: Vec<Value>, _client: ConnectionHandle) -> crate::Result<()> {
        if args.len() < 2 {
            return Ok(());
        }
        let Some(topic) = args[0].as_str() else {
            return Ok(());
        };
        let topic = topic.into_owned();
        let parts: Vec<Bytes> = args[1..].iter().filter_map(Value::as_bytes).collect();
        if parts.is_empty() {
            return Ok(());
        }

        // Snapshot the membership under the entry lock, then deliver without
        // it so slow subscriber sockets do not block topic mutation.
        let subscribers: Vec<SocketAddr> = match self.topics.get(&topic) {
            Some(entry) => entry.subscribers.iter().copied().collect(),
            None => return Ok(()),
        };

        let Some(server) = self.server.upgrade() else {
            return Ok(());
        };

        let mut stale = Vec::new();
        for addr in subscribers {
            match server.client(&addr) {
                Some(subscriber) => {
                    if subscriber.write_bulk(&parts).is_ok() {
                        let _ = subscriber.flush().await;
                    }
                }
                None => stale.push(addr),
            }
        }

        if !stale.is_empty() {
            debug!("pruning {} stale subscribers from {}", stale.len(), topic);
            if let Some(mut entry) = self.topics.get_mut(&topic) {
                for addr in &stale {
                    entry.subscribers.remove(addr);
                }
            }
            self.topics.remove_if(&topic, |_, t| t.subscribers.is_empty());
        }

        Ok(())
    }

    fn remove_subscriber(&self, addr: SocketAddr) {
        self.topics.retain(|_, topic| {
            topic.subscribers.remove(&addr);
            !topic.subscribers.is_empty()
        });
    }
}

#[async_trait]
impl Backend for PubSubBackend {
    async fn load(&self) -> crate::Result<()> {
        Ok(())
    }

    async fn unload(&self) -> crate::Result<()> {
        self.topics.clear();
        Ok(())
    }
}
