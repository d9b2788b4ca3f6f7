use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::BytesMut;
use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::ids::PeerId;
use crate::pool::peer_pool::PeerPool;
use crate::signaling::signal_messages::SignalEnvelope;
use crate::signaling::SignalingChannel;

/// An in-memory signaling side channel connecting all registered pools.
///
/// Every signal is delivered by a task of its own, after an optional random delay, so
///  delivery order is not guaranteed - just like with a real signaling server. Signals go
///  through the binary codec on the way.
pub struct MemorySignaling {
    pools: RwLock<FxHashMap<PeerId, Weak<PeerPool>>>,
    max_jitter: Option<Duration>,
}

impl MemorySignaling {
    pub fn new() -> Arc<MemorySignaling> {
        Arc::new(MemorySignaling {
            pools: Default::default(),
            max_jitter: None,
        })
    }

    pub fn with_jitter(max_jitter: Duration) -> Arc<MemorySignaling> {
        Arc::new(MemorySignaling {
            pools: Default::default(),
            max_jitter: Some(max_jitter),
        })
    }

    pub fn register(&self, pool: &Arc<PeerPool>) {
        if let Ok(mut pools) = self.pools.write() {
            pools.insert(pool.peer_id().clone(), Arc::downgrade(pool));
        }
    }

    fn lookup(&self, peer_id: &PeerId) -> Option<Arc<PeerPool>> {
        self.pools.read().ok()?
            .get(peer_id)?
            .upgrade()
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn send_signal(&self, to: &PeerId, envelope: SignalEnvelope) -> anyhow::Result<()> {
        let pool = self.lookup(to)
            .ok_or_else(|| anyhow!("peer {} is not registered for signaling", to))?;

        let mut buf = BytesMut::new();
        envelope.ser(&mut buf);
        let buf = buf.freeze();

        let delay = self.max_jitter
            .map(|max| rand::thread_rng().gen_range(Duration::ZERO..=max));

        trace!("delivering signal #{} from {:?} to {:?}", envelope.sequence_number, envelope.sender_id, to);
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match SignalEnvelope::deser(&buf) {
                Ok(envelope) => pool.on_signal(envelope).await,
                Err(e) => warn!("undeserializable signal: {}", e),
            }
        });
        Ok(())
    }
}
