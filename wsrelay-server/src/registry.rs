//! Live-connection set and channel registry with publish/broadcast fan-out.

use crate::connection::{Connection, Outgoing};
use crate::error::ServerError;
use crate::predicate::Predicate;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;
use wsrelay_protocol::{Packet, PacketSource};

/// Accepts a single channel name or any iterable of names.
pub trait IntoChannels {
    fn into_channels(self) -> Vec<String>;
}

impl IntoChannels for &str {
    fn into_channels(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoChannels for String {
    fn into_channels(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoChannels for &String {
    fn into_channels(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl<S: Into<String>> IntoChannels for Vec<S> {
    fn into_channels(self) -> Vec<String> {
        self.into_iter().map(Into::into).collect()
    }
}

impl<S: Into<String>, const N: usize> IntoChannels for [S; N] {
    fn into_channels(self) -> Vec<String> {
        self.into_iter().map(Into::into).collect()
    }
}

impl IntoChannels for &[&str] {
    fn into_channels(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

impl<S: Into<String>> IntoChannels for std::collections::HashSet<S> {
    fn into_channels(self) -> Vec<String> {
        self.into_iter().map(Into::into).collect()
    }
}

/// Maintains both sides of the channel index: `channels[name]` holds the
/// subscriber ids, each connection mirrors its own subscription set. Every
/// operation keeps the two consistent, and empty channels are removed.
#[derive(Default)]
pub struct Registry {
    clients: DashMap<Uuid, Arc<Connection>>,
    channels: DashMap<String, HashSet<Uuid>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, conn: Arc<Connection>) {
        self.clients.insert(conn.id(), conn);
    }

    /// Removes a connection: clears every subscription, garbage-collects
    /// emptied channels and drops it from the live set.
    pub(crate) fn remove(&self, conn: &Connection) {
        for name in conn.take_channels() {
            self.remove_member(&name, conn.id());
        }
        self.clients.remove(&conn.id());
    }

    /// Subscribes a connection to one or more channels. Idempotent.
    pub fn subscribe(&self, conn: &Arc<Connection>, channels: impl IntoChannels) {
        for name in channels.into_channels() {
            self.channels
                .entry(name.clone())
                .or_default()
                .insert(conn.id());
            conn.add_channel(name);
        }
    }

    /// Unsubscribes a connection from one or more channels. Unknown
    /// channels are ignored.
    pub fn unsubscribe(&self, conn: &Arc<Connection>, channels: impl IntoChannels) {
        for name in channels.into_channels() {
            self.remove_member(&name, conn.id());
            conn.remove_channel(&name);
        }
    }

    fn remove_member(&self, name: &str, id: Uuid) {
        if let Some(mut members) = self.channels.get_mut(name) {
            members.remove(&id);
        }
        self.channels.remove_if(name, |_, members| members.is_empty());
    }

    /// Number of live connections.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Snapshot of all live connections.
    pub fn clients(&self) -> Vec<Arc<Connection>> {
        self.clients.iter().map(|c| Arc::clone(&c)).collect()
    }

    /// Looks up a connection by id.
    pub fn get(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.clients.get(&id).map(|c| Arc::clone(&c))
    }

    /// Returns whether a channel currently has subscribers.
    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Number of channels with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Snapshot of a channel's subscriber ids.
    pub fn channel_members(&self, name: &str) -> HashSet<Uuid> {
        self.channels
            .get(name)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    /// Publishes to every subscriber of the given channel(s), minus
    /// `exclude`, filtered by `predicate` when given.
    ///
    /// Each recipient gets one packet tagged with the channel it came
    /// through. Failures on individual recipients are logged and do not
    /// abort the remaining fan-out. Returns the number of deliveries.
    pub async fn publish(
        &self,
        channels: impl IntoChannels,
        data: impl Into<Outgoing>,
        exclude: &HashSet<Uuid>,
        predicate: Option<&Predicate>,
    ) -> Result<usize, ServerError> {
        let outgoing = data.into();
        if let Outgoing::Packet(packet) = &outgoing {
            if packet.source != PacketSource::Channel {
                return Err(ServerError::Packet(
                    "cannot publish a packet whose source is not CHANNEL".into(),
                ));
            }
        }

        let mut delivered = 0;
        for name in channels.into_channels() {
            let packet = match &outgoing {
                Outgoing::Packet(packet) => {
                    let mut packet = packet.clone();
                    packet.channel.get_or_insert_with(|| name.clone());
                    packet
                }
                Outgoing::Data(data) => Packet::channel(name.clone(), data.clone()),
            };

            for conn in self.resolve_members(&name) {
                if exclude.contains(&conn.id()) {
                    continue;
                }
                if let Some(predicate) = predicate {
                    if !predicate.evaluate(&conn) {
                        continue;
                    }
                }
                match conn.send_packet(packet.clone()).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        tracing::warn!("[{}] publish to {} failed: {}", name, conn.id(), e);
                    }
                }
            }
        }

        Ok(delivered)
    }

    /// Broadcasts to every live connection, minus `exclude`, filtered by
    /// `predicate` when given. Returns the number of deliveries.
    pub async fn broadcast(
        &self,
        data: impl Into<Outgoing>,
        exclude: &HashSet<Uuid>,
        predicate: Option<&Predicate>,
    ) -> Result<usize, ServerError> {
        let packet = match data.into() {
            Outgoing::Packet(packet) => {
                if packet.source != PacketSource::Broadcast {
                    return Err(ServerError::Packet(
                        "cannot broadcast a packet whose source is not BROADCAST".into(),
                    ));
                }
                packet
            }
            Outgoing::Data(data) => Packet::broadcast(data),
        };

        let mut delivered = 0;
        for conn in self.clients() {
            if exclude.contains(&conn.id()) {
                continue;
            }
            if let Some(predicate) = predicate {
                if !predicate.evaluate(&conn) {
                    continue;
                }
            }
            match conn.send_packet(packet.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!("broadcast to {} failed: {}", conn.id(), e);
                }
            }
        }

        Ok(delivered)
    }

    /// Snapshot of a channel's members as connections. Taken before any
    /// await so no map guard is held across suspension points.
    fn resolve_members(&self, name: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<Uuid> = match self.channels.get(name) {
            Some(members) => members.iter().copied().collect(),
            None => return Vec::new(),
        };
        ids.into_iter().filter_map(|id| self.get(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SendPolicy;
    use tokio_tungstenite::tungstenite::Message;
    use wsrelay_protocol::{codec, WireFormat};

    fn setup() -> (Arc<Registry>, Arc<Connection>, Arc<Connection>, Arc<Connection>) {
        let registry = Arc::new(Registry::new());
        let rpc = Arc::new(crate::rpc::RpcRegistry::new(16));
        let mut conns = (0..3).map(|i| {
            let conn = Connection::new(
                format!("127.0.0.1:{}", 5000 + i).parse().unwrap(),
                registry.clone(),
                rpc.clone(),
                WireFormat::Json,
                SendPolicy::Block,
                32,
                32,
            );
            registry.insert(conn.clone());
            conn
        });
        let (a, b, c) = (
            conns.next().unwrap(),
            conns.next().unwrap(),
            conns.next().unwrap(),
        );
        (registry, a, b, c)
    }

    async fn next_packet(conn: &Connection) -> Packet {
        loop {
            match conn.next_outbound().await.expect("queue closed") {
                Message::Text(text) => return codec::json::decode(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[test]
    fn test_subscription_mirror_invariant() {
        let (registry, a, _, _) = setup();

        a.subscribe(["room1", "room2"]);
        assert!(registry.channel_members("room1").contains(&a.id()));
        assert!(registry.channel_members("room2").contains(&a.id()));
        assert!(a.subscribed_channels().contains("room1"));
        assert!(a.subscribed_channels().contains("room2"));

        a.unsubscribe("room1");
        assert!(!registry.has_channel("room1"));
        assert!(!a.subscribed_channels().contains("room1"));
        assert!(a.subscribed_channels().contains("room2"));
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let (registry, a, _, _) = setup();
        a.subscribe("room1");
        a.subscribe("room1");
        assert_eq!(registry.channel_members("room1").len(), 1);

        // Unsubscribing an unknown channel is a no-op, not an error.
        a.unsubscribe("never-joined");
    }

    #[test]
    fn test_empty_channels_are_collected() {
        let (registry, a, b, _) = setup();
        a.subscribe("room1");
        b.subscribe("room1");
        assert_eq!(registry.channel_count(), 1);

        a.unsubscribe("room1");
        assert!(registry.has_channel("room1"));
        b.unsubscribe("room1");
        assert!(!registry.has_channel("room1"));
        assert_eq!(registry.channel_count(), 0);
    }

    #[test]
    fn test_disconnect_cleans_every_channel() {
        let (registry, a, b, _) = setup();
        a.subscribe(["r1", "r2"]);
        b.subscribe("r1");

        registry.remove(&a);
        assert!(registry.get(a.id()).is_none());
        assert!(!registry.channel_members("r1").contains(&a.id()));
        // r2 had only a, so it is gone entirely.
        assert!(!registry.has_channel("r2"));
        assert!(registry.has_channel("r1"));
    }

    #[tokio::test]
    async fn test_publish_excludes_and_tags() {
        let (registry, a, b, c) = setup();
        for conn in [&a, &b, &c] {
            conn.subscribe("room1");
        }

        let exclude = HashSet::from([a.id()]);
        let delivered = registry
            .publish("room1", "hi", &exclude, None)
            .await
            .unwrap();
        assert_eq!(delivered, 2);

        for conn in [&b, &c] {
            let packet = next_packet(conn).await;
            assert_eq!(packet.source, PacketSource::Channel);
            assert_eq!(packet.channel.as_deref(), Some("room1"));
            assert_eq!(packet.data.unwrap().as_str().unwrap(), "hi");
        }
    }

    #[tokio::test]
    async fn test_publish_respects_predicate() {
        let (registry, a, b, _) = setup();
        a.subscribe("room");
        b.subscribe("room");
        a.set("vip", true);

        let delivered = registry
            .publish("room", "exclusive", &HashSet::new(), Some(&Predicate::is("vip")))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(
            next_packet(&a).await.data.unwrap().as_str().unwrap(),
            "exclusive"
        );
    }

    #[tokio::test]
    async fn test_publish_skips_closed_recipients() {
        let (registry, a, b, _) = setup();
        a.subscribe("room");
        b.subscribe("room");
        b.close();

        let delivered = registry
            .publish("room", "still going", &HashSet::new(), None)
            .await
            .unwrap();
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn test_publish_rejects_foreign_source() {
        let (registry, _, _, _) = setup();
        let packet = Packet::broadcast("wrong");
        let result = registry.publish("room", packet, &HashSet::new(), None).await;
        assert!(matches!(result, Err(ServerError::Packet(_))));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_but_excluded() {
        let (registry, a, b, c) = setup();
        let exclude = HashSet::from([c.id()]);
        let delivered = registry
            .broadcast("all hands", &exclude, None)
            .await
            .unwrap();
        assert_eq!(delivered, 2);

        for conn in [&a, &b] {
            let packet = next_packet(conn).await;
            assert_eq!(packet.source, PacketSource::Broadcast);
            assert!(packet.channel.is_none());
        }
    }

    #[tokio::test]
    async fn test_multi_channel_publish_tags_each_channel() {
        let (registry, a, _, _) = setup();
        a.subscribe(["news", "alerts"]);

        let delivered = registry
            .publish(["news", "alerts"], "both", &HashSet::new(), None)
            .await
            .unwrap();
        assert_eq!(delivered, 2);

        let mut seen: Vec<String> = Vec::new();
        for _ in 0..2 {
            seen.push(next_packet(&a).await.channel.unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec!["alerts", "news"]);
    }
}
