//! Best-effort multicast propagation of subscription changes.
//!
//! Every local mutation is broadcast once to the configured multicast group;
//! peers apply received datagrams to their own registries. There is no relay
//! hop and no central coordinator. Malformed datagrams are logged and
//! dropped, and a node's own broadcasts are suppressed by origin node id.
//! Nodes joining late converge through their backend instead
//! ([`SubscriptionRegistry::init`]).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::core::error::{BusError, BusResult};
use crate::core::message::TopicName;
use crate::core::subscriptions::datagram::{NodeId, SubscriptionAction, SubscriptionDatagram};
use crate::core::subscriptions::{SubscriptionRegistry, SubscriptionStore};

// Largest datagram we are willing to read; topics and URIs must fit a single
// unfragmented UDP payload.
const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Multicast socket shared by the broadcaster and the receiver loop.
pub struct MulticastGossip {
    socket: Arc<UdpSocket>,
    node_id: NodeId,
    target: SocketAddr,
}

impl MulticastGossip {
    /// Binds the group port, joins the group and enables loopback so
    /// same-host peers hear each other.
    pub async fn bind(group: Ipv4Addr, port: u16, node_id: NodeId) -> BusResult<Self> {
        if !group.is_multicast() {
            return Err(BusError::Transport(format!(
                "{group} is not a multicast address"
            )));
        }
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        Ok(Self {
            socket: Arc::new(socket),
            node_id,
            target: SocketAddr::V4(SocketAddrV4::new(group, port)),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Announces one subscription mutation to the group.
    pub async fn broadcast(
        &self,
        action: SubscriptionAction,
        topic: &TopicName,
        subscriber_uri: &str,
        ttl: Duration,
    ) -> BusResult<()> {
        let datagram = SubscriptionDatagram {
            node_id: self.node_id,
            action,
            ttl_secs: ttl.as_secs().min(i32::MAX as u64) as i32,
            topic: topic.clone(),
            subscriber_uri: subscriber_uri.to_owned(),
        };
        self.socket.send_to(&datagram.encode(), self.target).await?;
        trace!(topic = %topic, ?action, "subscription datagram broadcast");
        Ok(())
    }

    fn spawn_receiver(
        &self,
        registry: Arc<SubscriptionRegistry>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let node_id = self.node_id;
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, peer)) => {
                            match SubscriptionDatagram::decode(&buf[..len]) {
                                Ok(datagram) => {
                                    if let Err(e) =
                                        apply_datagram(&registry, node_id, datagram).await
                                    {
                                        warn!(%peer, error = %e, "failed to apply subscription datagram");
                                    }
                                }
                                Err(e) => {
                                    warn!(%peer, error = %e, "dropping malformed subscription datagram");
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "gossip receive failed; retrying");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                }
            }
            debug!("gossip receiver stopped");
        })
    }
}

/// Applies a decoded datagram to the local registry, exactly as if the
/// mutation had been requested locally. Returns `false` when the datagram
/// originated from this node and was suppressed. Never re-broadcasts.
pub(crate) async fn apply_datagram(
    registry: &SubscriptionRegistry,
    local_node: NodeId,
    datagram: SubscriptionDatagram,
) -> BusResult<bool> {
    if datagram.node_id == local_node {
        trace!("suppressing own subscription datagram");
        return Ok(false);
    }
    let ttl = if datagram.ttl_secs <= 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(datagram.ttl_secs as u64)
    };
    match datagram.action {
        SubscriptionAction::Add => {
            registry
                .add_subscription(&datagram.topic, &datagram.subscriber_uri, ttl)
                .await?;
        }
        SubscriptionAction::Remove => {
            registry
                .remove_subscription(&datagram.topic, &datagram.subscriber_uri)
                .await?;
        }
    }
    Ok(true)
}

/// Subscription tracking façade: a store-backed registry, optionally kept
/// eventually consistent across nodes via multicast gossip.
pub struct SubscriptionTracker {
    registry: Arc<SubscriptionRegistry>,
    gossip: Option<MulticastGossip>,
    shutdown: broadcast::Sender<()>,
    receiver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionTracker {
    /// A standalone tracker with no gossip peering.
    pub async fn local(store: Arc<dyn SubscriptionStore>) -> BusResult<Self> {
        let registry = Arc::new(SubscriptionRegistry::new(store));
        registry.init().await?;
        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            registry,
            gossip: None,
            shutdown,
            receiver: std::sync::Mutex::new(None),
        })
    }

    /// A tracker peered over the given multicast group. Seeds from the store
    /// first, then starts the receiver loop.
    pub async fn with_gossip(
        store: Arc<dyn SubscriptionStore>,
        group: Ipv4Addr,
        port: u16,
    ) -> BusResult<Self> {
        Self::with_gossip_node(store, group, port, NodeId::generate()).await
    }

    async fn with_gossip_node(
        store: Arc<dyn SubscriptionStore>,
        group: Ipv4Addr,
        port: u16,
        node_id: NodeId,
    ) -> BusResult<Self> {
        let registry = Arc::new(SubscriptionRegistry::new(store));
        registry.init().await?;

        let gossip = MulticastGossip::bind(group, port, node_id).await?;
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let handle = gossip.spawn_receiver(Arc::clone(&registry), shutdown_rx);
        Ok(Self {
            registry,
            gossip: Some(gossip),
            shutdown,
            receiver: std::sync::Mutex::new(Some(handle)),
        })
    }

    /// Builds a tracker from the `[node]` and `[gossip]` configuration
    /// sections.
    pub async fn from_config(
        store: Arc<dyn SubscriptionStore>,
        config: &Config,
    ) -> BusResult<Self> {
        if !config.gossip.enabled {
            return Self::local(store).await;
        }
        let group: Ipv4Addr = config.gossip.group.parse().map_err(|_| {
            BusError::Transport(format!(
                "invalid multicast group '{}'",
                config.gossip.group
            ))
        })?;
        let node_id = match &config.node.id {
            Some(id) => NodeId::parse_hex(id)?,
            None => NodeId::generate(),
        };
        Self::with_gossip_node(store, group, config.gossip.port, node_id).await
    }

    /// Adds the subscription locally, then announces it to peers.
    pub async fn add_subscription(
        &self,
        topic: &TopicName,
        subscriber_uri: &str,
        ttl: Duration,
    ) -> BusResult<()> {
        self.registry
            .add_subscription(topic, subscriber_uri, ttl)
            .await?;
        if let Some(gossip) = &self.gossip {
            gossip
                .broadcast(SubscriptionAction::Add, topic, subscriber_uri, ttl)
                .await?;
        }
        Ok(())
    }

    /// Removes the subscription locally, then announces the removal.
    pub async fn remove_subscription(
        &self,
        topic: &TopicName,
        subscriber_uri: &str,
    ) -> BusResult<()> {
        self.registry.remove_subscription(topic, subscriber_uri).await?;
        if let Some(gossip) = &self.gossip {
            gossip
                .broadcast(
                    SubscriptionAction::Remove,
                    topic,
                    subscriber_uri,
                    Duration::ZERO,
                )
                .await?;
        }
        Ok(())
    }

    pub fn subscribers(&self, topic: &TopicName) -> Vec<String> {
        self.registry.subscribers(topic)
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Stops the receiver loop and disposes the registry. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let handle = self.receiver.lock().expect("receiver lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.registry.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::subscriptions::MemorySubscriptionStore;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(Arc::new(MemorySubscriptionStore::new()))
    }

    fn datagram(
        node_id: NodeId,
        action: SubscriptionAction,
        ttl_secs: i32,
    ) -> SubscriptionDatagram {
        SubscriptionDatagram {
            node_id,
            action,
            ttl_secs,
            topic: TopicName::from("orders"),
            subscriber_uri: "http://peer:8080/bus".to_string(),
        }
    }

    #[tokio::test]
    async fn foreign_add_is_applied() {
        let reg = registry();
        let local = NodeId::generate();
        let foreign = NodeId::generate();

        let applied = apply_datagram(&reg, local, datagram(foreign, SubscriptionAction::Add, 0))
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(
            reg.subscribers(&TopicName::from("orders")),
            vec!["http://peer:8080/bus".to_string()]
        );
    }

    #[tokio::test]
    async fn own_datagram_is_suppressed() {
        let reg = registry();
        let local = NodeId::generate();

        let applied = apply_datagram(&reg, local, datagram(local, SubscriptionAction::Add, 0))
            .await
            .unwrap();
        assert!(!applied);
        assert!(reg.subscribers(&TopicName::from("orders")).is_empty());
    }

    #[tokio::test]
    async fn foreign_remove_is_applied() {
        let reg = registry();
        let local = NodeId::generate();
        let foreign = NodeId::generate();

        apply_datagram(&reg, local, datagram(foreign, SubscriptionAction::Add, 0))
            .await
            .unwrap();
        apply_datagram(&reg, local, datagram(foreign, SubscriptionAction::Remove, 0))
            .await
            .unwrap();
        assert!(reg.subscribers(&TopicName::from("orders")).is_empty());
    }

    #[tokio::test]
    async fn negative_wire_ttl_means_never_expires() {
        let reg = registry();
        let local = NodeId::generate();
        let foreign = NodeId::generate();

        apply_datagram(&reg, local, datagram(foreign, SubscriptionAction::Add, -5))
            .await
            .unwrap();
        assert_eq!(reg.subscribers(&TopicName::from("orders")).len(), 1);
    }
}
