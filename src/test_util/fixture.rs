use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::sync::mpsc;

use crate::config::OverlayConfig;
use crate::ids::{NetworkId, PeerId};
use crate::overlay::star_network::StarOverlayNetwork;
use crate::pool::peer_pool::PeerPool;
use crate::test_util::memory_signaling::MemorySignaling;
use crate::test_util::memory_transport::MemoryTransport;

/// convenience for test code: a peer id based on a number, the same number generating the
///  same id and different numbers different ids
pub fn test_peer_id(number: u16) -> PeerId {
    PeerId::new(format!("peer-{}", number))
}

/// Small fragments, so that multipart envelopes are exercised with small messages, and
///  timeouts that keep failing tests short.
pub fn test_config() -> OverlayConfig {
    OverlayConfig {
        fragment_size: 64,
        max_envelope_size: 64 * 1024,
        reassembly_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        join_timeout: Duration::from_secs(2),
    }
}

/// The shared in-memory infrastructure for a number of peers
pub struct TestNetwork {
    pub config: Arc<OverlayConfig>,
    pub transport: Arc<MemoryTransport>,
    pub signaling: Arc<MemorySignaling>,
}

impl TestNetwork {
    pub fn new(config: OverlayConfig) -> TestNetwork {
        TestNetwork {
            transport: Arc::new(MemoryTransport::new(config.fragment_size)),
            config: Arc::new(config),
            signaling: MemorySignaling::new(),
        }
    }

    pub fn with_jitter(config: OverlayConfig, max_jitter: Duration) -> TestNetwork {
        TestNetwork {
            transport: Arc::new(MemoryTransport::new(config.fragment_size)),
            config: Arc::new(config),
            signaling: MemorySignaling::with_jitter(max_jitter),
        }
    }

    /// Must be called from within a tokio runtime
    pub fn build_pool(&self, peer_id: impl Into<PeerId>) -> anyhow::Result<Arc<PeerPool>> {
        let pool = PeerPool::new(peer_id.into(), self.config.clone(), self.transport.clone(), self.signaling.clone())?;
        self.signaling.register(&pool);
        Ok(pool)
    }

    /// A hub named "hub" and spokes named "s1", "s2", ..., returning once every member sees
    ///  the full membership. The hub is at index 0.
    pub async fn build_star(&self, network_id: &NetworkId, num_spokes: usize) -> anyhow::Result<Vec<Arc<StarOverlayNetwork>>> {
        let hub_id = PeerId::new("hub");
        let mut nodes = vec![StarOverlayNetwork::new(network_id.clone(), self.build_pool(hub_id.clone())?, true)];

        for n in 1..=num_spokes {
            let spoke = StarOverlayNetwork::new(network_id.clone(), self.build_pool(format!("s{}", n))?, false);
            spoke.connect_to(&hub_id).await?;
            nodes.push(spoke);
        }

        for node in &nodes {
            let converged = tokio::time::timeout(Duration::from_secs(5), async {
                while node.member_ids().await.len() != num_spokes + 1 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }).await;
            if converged.is_err() {
                bail!("{:?} did not see all members: {:?}", node.local_id(), node.member_ids().await);
            }
        }
        Ok(nodes)
    }
}

/// Waits for the next event on a subscription, failing if none arrives within a few seconds
pub async fn next_event<T>(events: &mut mpsc::UnboundedReceiver<T>) -> anyhow::Result<T> {
    match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
        Ok(Some(evt)) => Ok(evt),
        Ok(None) => bail!("event source was closed"),
        Err(_) => bail!("timeout waiting for event"),
    }
}

/// Fails if an event arrives within the given time
pub async fn assert_no_event<T: Debug>(events: &mut mpsc::UnboundedReceiver<T>, wait: Duration) -> anyhow::Result<()> {
    match tokio::time::timeout(wait, events.recv()).await {
        Ok(Some(evt)) => bail!("unexpected event {:?}", evt),
        _ => Ok(()),
    }
}

/// Collects all events that are already available without waiting
pub fn drain_events<T>(events: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut result = Vec::new();
    while let Ok(evt) = events.try_recv() {
        result.push(evt);
    }
    result
}
