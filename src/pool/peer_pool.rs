use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::config::OverlayConfig;
use crate::error::{NetError, NetResult};
use crate::events::EventNotifier;
use crate::ids::PeerId;
use crate::link::peer_link::{LinkEvent, LinkState, PeerLink};
use crate::link::session::SessionFactory;
use crate::signaling::signal_messages::SignalEnvelope;
use crate::signaling::SignalingChannel;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PoolEvent {
    MessageReceived {
        sender_id: PeerId,
        message: Bytes,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
}

struct LinkEntry {
    link: Arc<PeerLink>,
    /// the epoch of the remote link instance, bound by the first signal from it
    remote_epoch: Option<u64>,
}

#[derive(Default)]
struct LinkTable {
    entries: FxHashMap<PeerId, LinkEntry>,
    /// survives the links themselves, so signals for a link that was torn down are
    ///  recognized as stale
    highest_remote_epochs: FxHashMap<PeerId, u64>,
}

pub struct PeerPool {
    peer_id: PeerId,
    config: Arc<OverlayConfig>,
    session_factory: Arc<dyn SessionFactory>,
    signaling: Arc<dyn SignalingChannel>,
    links: Mutex<LinkTable>,
    disconnected: AtomicBool,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    event_notifier: EventNotifier<PoolEvent>,
    dispatch_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for PeerPool {
    fn drop(&mut self) {
        self.abort_dispatch_task();
    }
}

impl PeerPool {
    /// Fails if the configuration is invalid, see [OverlayConfig::validate].
    pub fn new(
        peer_id: PeerId,
        config: Arc<OverlayConfig>,
        session_factory: Arc<dyn SessionFactory>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> anyhow::Result<Arc<PeerPool>> {
        config.validate()?;

        let (link_events, link_events_receiver) = mpsc::unbounded_channel();

        let pool = Arc::new(PeerPool {
            peer_id,
            config,
            session_factory,
            signaling,
            links: Default::default(),
            disconnected: AtomicBool::new(false),
            link_events,
            event_notifier: EventNotifier::new(),
            dispatch_task: Default::default(),
        });

        let dispatch_task = tokio::spawn(dispatch_loop(Arc::downgrade(&pool), link_events_receiver));
        if let Ok(mut task) = pool.dispatch_task.lock() {
            *task = Some(dispatch_task);
        }
        Ok(pool)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn config(&self) -> &Arc<OverlayConfig> {
        &self.config
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        self.event_notifier.subscribe()
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Establishes a link to a peer, or waits for the existing link to become connected.
    ///  Concurrent calls for the same peer share a single link.
    #[tracing::instrument(skip(self), fields(local = %self.peer_id))]
    pub async fn connect_to(&self, peer_id: &PeerId) -> NetResult<()> {
        if self.is_disconnected() {
            return Err(NetError::PoolDisconnected);
        }

        let link = self.get_or_create_link(peer_id).await?;

        match timeout(self.config.connect_timeout, link.connect()).await {
            Ok(result) => result,
            Err(_) => {
                // a negotiation that is stuck (e.g. both sides offering) would block every
                //  later attempt that reuses the link
                if !link.is_connected() {
                    debug!("connecting timed out in state {:?} - dropping the link", link.state());
                    link.disconnect().await;
                }
                else {
                    debug!("connecting timed out");
                }
                Err(NetError::Timeout(format!("connecting to peer {}", peer_id)))
            }
        }
    }

    async fn get_or_create_link(&self, peer_id: &PeerId) -> NetResult<Arc<PeerLink>> {
        let mut links = self.links.lock().await;

        if let Some(entry) = links.entries.get(peer_id) {
            if entry.link.state() != LinkState::Disconnected {
                return Ok(entry.link.clone());
            }
        }

        let link = Arc::new(self.new_link(peer_id, false)?);
        let replaced = links.entries.insert(peer_id.clone(), LinkEntry {
            link: link.clone(),
            remote_epoch: None,
        });
        if replaced.is_some() {
            // the replaced link is disconnected, and the pool has not processed that yet: its
            //  notification will not match the new link's epoch
            self.event_notifier.send_event(PoolEvent::PeerDisconnected { peer_id: peer_id.clone() });
        }
        Ok(link)
    }

    fn new_link(&self, peer_id: &PeerId, is_answering: bool) -> anyhow::Result<PeerLink> {
        let epoch = next_link_epoch();
        debug!("creating link {:?} -> {:?} with epoch {}", self.peer_id, peer_id, epoch);
        PeerLink::new(
            self.peer_id.clone(),
            peer_id.clone(),
            epoch,
            is_answering,
            self.config.clone(),
            self.session_factory.as_ref(),
            self.signaling.clone(),
            self.link_events.clone(),
        )
    }

    async fn get_link(&self, peer_id: &PeerId) -> Option<Arc<PeerLink>> {
        self.links.lock().await
            .entries.get(peer_id)
            .map(|e| e.link.clone())
    }

    /// Sends a message to a peer. This requires an existing link and never connects
    ///  implicitly.
    pub async fn send(&self, peer_id: &PeerId, message: &[u8]) -> NetResult<()> {
        match self.get_link(peer_id).await {
            Some(link) => link.send(message).await,
            None => Err(NetError::NoConnection(peer_id.clone())),
        }
    }

    pub async fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.get_link(peer_id).await
            .map(|link| link.is_connected())
            .unwrap_or(false)
    }

    pub async fn wait_connected(&self, peer_id: &PeerId) -> NetResult<()> {
        match self.get_link(peer_id).await {
            Some(link) => link.wait_connected().await,
            None => Err(NetError::NoConnection(peer_id.clone())),
        }
    }

    /// Resolves once the current link to a peer is disconnected, or immediately if there is
    ///  no link.
    pub async fn wait_disconnected(&self, peer_id: &PeerId) {
        if let Some(link) = self.get_link(peer_id).await {
            link.wait_disconnected().await;
        }
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let mut result = self.links.lock().await
            .entries.iter()
            .filter(|(_, e)| e.link.is_connected())
            .map(|(p, _)| p.clone())
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    /// Entry point for signals arriving through the signaling side channel
    #[tracing::instrument(skip(self, envelope), fields(local = %self.peer_id, sender = %envelope.sender_id, epoch = envelope.epoch))]
    pub async fn on_signal(&self, envelope: SignalEnvelope) {
        if self.is_disconnected() {
            debug!("pool is disconnected - dropping signal");
            return;
        }

        let link = {
            let mut links = self.links.lock().await;
            match self.link_for_signal(&mut links, &envelope).await {
                Some(link) => link,
                None => return,
            }
        };

        link.on_signal(envelope).await;
    }

    /// applies the epoch rules, creating or replacing the link if necessary
    async fn link_for_signal(&self, links: &mut LinkTable, envelope: &SignalEnvelope) -> Option<Arc<PeerLink>> {
        let sender_id = &envelope.sender_id;
        let highest = links.highest_remote_epochs.get(sender_id).copied();

        if let Some(highest) = highest {
            if envelope.epoch < highest {
                debug!("dropping stale signal, highest epoch seen is {}", highest);
                return None;
            }
        }

        let bound_epoch = links.entries.get(sender_id)
            .map(|e| e.remote_epoch);

        let replaced = match bound_epoch {
            Some(Some(remote_epoch)) if remote_epoch == envelope.epoch => {
                return links.entries.get(sender_id).map(|e| e.link.clone());
            }
            Some(Some(_)) => {
                // a newer epoch: the peer renegotiates from scratch
                info!("peer {:?} renegotiates with epoch {} - replacing link", sender_id, envelope.epoch);
                links.entries.remove(sender_id)
            }
            Some(None) | None if highest == Some(envelope.epoch) => {
                debug!("dropping signal for a link that was torn down already");
                return None;
            }
            Some(None) => {
                trace!("binding link to remote epoch");
                links.highest_remote_epochs.insert(sender_id.clone(), envelope.epoch);
                return links.entries.get_mut(sender_id)
                    .map(|entry| {
                        entry.remote_epoch = Some(envelope.epoch);
                        entry.link.clone()
                    });
            }
            None => None,
        };

        if let Some(replaced) = replaced {
            replaced.link.disconnect().await;
            self.event_notifier.send_event(PoolEvent::PeerDisconnected { peer_id: sender_id.clone() });
        }

        let link = match self.new_link(sender_id, true) {
            Ok(link) => Arc::new(link),
            Err(e) => {
                debug!("failed to create answering link: {}", e);
                return None;
            }
        };
        links.entries.insert(sender_id.clone(), LinkEntry {
            link: link.clone(),
            remote_epoch: Some(envelope.epoch),
        });
        links.highest_remote_epochs.insert(sender_id.clone(), envelope.epoch);
        Some(link)
    }

    /// Called when a link reports that it is disconnected. This is a no-op unless the link
    ///  is still the pool's current link for that peer.
    pub async fn did_disconnect(&self, peer_id: &PeerId, link_epoch: u64) {
        let removed = {
            let mut links = self.links.lock().await;
            match links.entries.get(peer_id) {
                Some(entry) if entry.link.epoch() == link_epoch => links.entries.remove(peer_id),
                _ => None,
            }
        };

        if removed.is_some() {
            debug!("removed link to {:?} (epoch {})", peer_id, link_epoch);
            self.event_notifier.send_event(PoolEvent::PeerDisconnected { peer_id: peer_id.clone() });
        }
        else {
            trace!("link to {:?} with epoch {} is not current - ignoring disconnect", peer_id, link_epoch);
        }
    }

    /// Disconnects all links and refuses new connections. Every link that is disconnected
    ///  here is reported through exactly one [PoolEvent::PeerDisconnected].
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("disconnecting peer pool of {:?}", self.peer_id);
        let entries = self.links.lock().await
            .entries.drain()
            .collect::<Vec<_>>();

        for (peer_id, entry) in entries {
            entry.link.disconnect().await;
            self.event_notifier.send_event(PoolEvent::PeerDisconnected { peer_id });
        }
    }

    /// Disconnects, stops the dispatch task and drops all subscriptions
    pub async fn dispose(&self) {
        self.disconnect().await;
        self.abort_dispatch_task();
        self.event_notifier.clear();
    }

    fn abort_dispatch_task(&self) {
        if let Ok(mut task) = self.dispatch_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn dispatch_loop(pool: Weak<PeerPool>, mut link_events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(evt) = link_events.recv().await {
        let pool = match pool.upgrade() {
            Some(pool) => pool,
            None => break,
        };

        match evt {
            LinkEvent::Message { peer_id, message } => {
                pool.event_notifier.send_event(PoolEvent::MessageReceived {
                    sender_id: peer_id,
                    message,
                });
            }
            LinkEvent::Disconnected { peer_id, link_epoch } => {
                pool.did_disconnect(&peer_id, link_epoch).await;
            }
        }
    }
}

/// Microseconds since the epoch, but strictly increasing across all calls in this process
fn next_link_epoch() -> u64 {
    static LAST_EPOCH: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now().duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);

    let previous = LAST_EPOCH.fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(now.max(last + 1)))
        .unwrap_or_else(|last| last);
    now.max(previous + 1)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::signaling::signal_messages::Signal;
    use crate::test_util::fixture::{assert_no_event, next_event, test_config, TestNetwork};

    #[tokio::test]
    async fn test_connect() {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();
        let b = network.build_pool("b").unwrap();

        a.connect_to(&PeerId::new("b")).await.unwrap();
        assert!(a.is_connected(&PeerId::new("b")).await);

        b.wait_connected(&PeerId::new("a")).await.unwrap();
        assert!(b.is_connected(&PeerId::new("a")).await);
        assert_eq!(b.connected_peers().await, vec![PeerId::new("a")]);

        // connecting again reuses the link
        a.connect_to(&PeerId::new("b")).await.unwrap();
        assert_eq!(network.transport.num_sessions(), 2);
    }

    #[tokio::test]
    async fn test_connect_with_unordered_signaling() {
        let network = TestNetwork::with_jitter(test_config(), Duration::from_millis(20));
        let pools = (0..4)
            .map(|n| network.build_pool(format!("p{}", n)).unwrap())
            .collect::<Vec<_>>();

        for i in 0..pools.len() {
            for j in i+1..pools.len() {
                pools[i].connect_to(pools[j].peer_id()).await.unwrap();
                pools[j].wait_connected(pools[i].peer_id()).await.unwrap();
            }
        }
        for pool in &pools {
            assert_eq!(pool.connected_peers().await.len(), 3);
        }
    }

    #[tokio::test]
    async fn test_concurrent_connect_shares_link() {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();
        let _b = network.build_pool("b").unwrap();

        let b_id = PeerId::new("b");
        let (r1, r2) = tokio::join!(a.connect_to(&b_id), a.connect_to(&b_id));
        r1.unwrap();
        r2.unwrap();
        assert_eq!(network.transport.num_sessions(), 2);
    }

    #[rstest]
    #[case::tiny(1)]
    #[case::below_fragment(62)]
    #[case::fills_fragment(63)]
    #[case::fragment_size(64)]
    #[case::above_fragment(65)]
    #[case::large(5000)]
    #[tokio::test]
    async fn test_send_receive(#[case] len: usize) {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();
        let b = network.build_pool("b").unwrap();
        let mut b_events = b.subscribe();

        a.connect_to(&PeerId::new("b")).await.unwrap();

        let payload = (0..len).map(|n| (n % 251) as u8).collect::<Vec<_>>();
        a.send(&PeerId::new("b"), &payload).await.unwrap();
        a.send(&PeerId::new("b"), b"second").await.unwrap();

        assert_eq!(next_event(&mut b_events).await.unwrap(), PoolEvent::MessageReceived {
            sender_id: PeerId::new("a"),
            message: Bytes::from(payload),
        });
        assert_eq!(next_event(&mut b_events).await.unwrap(), PoolEvent::MessageReceived {
            sender_id: PeerId::new("a"),
            message: Bytes::from_static(b"second"),
        });
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();
        let b = network.build_pool("b").unwrap();
        let mut b_events = b.subscribe();
        a.connect_to(&PeerId::new("b")).await.unwrap();

        let b_id = PeerId::new("b");
        let x = vec![b'x'; 1000];
        let y = vec![b'y'; 1000];
        let (rx, ry) = tokio::join!(a.send(&b_id, &x), a.send(&b_id, &y));
        rx.unwrap();
        ry.unwrap();

        for _ in 0..2 {
            match next_event(&mut b_events).await.unwrap() {
                PoolEvent::MessageReceived { message, .. } => {
                    assert!(message.as_ref() == x.as_slice() || message.as_ref() == y.as_slice());
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_send_without_link() {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();
        assert_eq!(a.send(&PeerId::new("b"), b"x").await, Err(NetError::NoConnection(PeerId::new("b"))));
        assert_eq!(a.wait_connected(&PeerId::new("b")).await, Err(NetError::NoConnection(PeerId::new("b"))));
        assert!(!a.is_connected(&PeerId::new("b")).await);

        // no link: resolves immediately
        a.wait_disconnected(&PeerId::new("b")).await;
    }

    #[tokio::test]
    async fn test_send_too_large() {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();
        let _b = network.build_pool("b").unwrap();
        a.connect_to(&PeerId::new("b")).await.unwrap();

        let result = a.send(&PeerId::new("b"), &vec![0u8; 64 * 1024]).await;
        assert_eq!(result, Err(NetError::EnvelopeTooLarge { len: 64 * 1024 + 5, max: 64 * 1024 }));
        assert!(a.is_connected(&PeerId::new("b")).await);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();
        let b = network.build_pool("b").unwrap();
        let c = network.build_pool("c").unwrap();
        a.connect_to(b.peer_id()).await.unwrap();
        a.connect_to(c.peer_id()).await.unwrap();
        b.wait_connected(a.peer_id()).await.unwrap();

        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        a.disconnect().await;

        let mut disconnected = vec![
            next_event(&mut a_events).await.unwrap(),
            next_event(&mut a_events).await.unwrap(),
        ];
        disconnected.sort_by_key(|e| format!("{:?}", e));
        assert_eq!(disconnected, vec![
            PoolEvent::PeerDisconnected { peer_id: PeerId::new("b") },
            PoolEvent::PeerDisconnected { peer_id: PeerId::new("c") },
        ]);
        assert_no_event(&mut a_events, Duration::from_millis(50)).await.unwrap();

        assert_eq!(next_event(&mut b_events).await.unwrap(), PoolEvent::PeerDisconnected { peer_id: PeerId::new("a") });
        assert!(!b.is_connected(a.peer_id()).await);

        assert_eq!(a.connect_to(b.peer_id()).await, Err(NetError::PoolDisconnected));
        assert!(a.connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_link_loss_and_reconnect() {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();
        let b = network.build_pool("b").unwrap();
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        a.connect_to(b.peer_id()).await.unwrap();
        b.wait_connected(a.peer_id()).await.unwrap();

        network.transport.sever(a.peer_id(), b.peer_id());
        a.wait_disconnected(b.peer_id()).await;
        assert_eq!(next_event(&mut a_events).await.unwrap(), PoolEvent::PeerDisconnected { peer_id: PeerId::new("b") });
        assert_eq!(next_event(&mut b_events).await.unwrap(), PoolEvent::PeerDisconnected { peer_id: PeerId::new("a") });
        assert_no_event(&mut a_events, Duration::from_millis(50)).await.unwrap();

        a.connect_to(b.peer_id()).await.unwrap();
        b.wait_connected(a.peer_id()).await.unwrap();
        a.send(b.peer_id(), b"again").await.unwrap();
        assert_eq!(next_event(&mut b_events).await.unwrap(), PoolEvent::MessageReceived {
            sender_id: PeerId::new("a"),
            message: Bytes::from_static(b"again"),
        });
    }

    #[tokio::test]
    async fn test_restarted_peer_replaces_link() {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();
        let b = network.build_pool("b").unwrap();
        a.connect_to(b.peer_id()).await.unwrap();
        b.wait_connected(a.peer_id()).await.unwrap();
        let mut b_events = b.subscribe();

        // a restarted client reuses its peer id, and b does not notice the old link is gone
        let a2 = network.build_pool("a").unwrap();
        a2.connect_to(b.peer_id()).await.unwrap();

        assert_eq!(next_event(&mut b_events).await.unwrap(), PoolEvent::PeerDisconnected { peer_id: PeerId::new("a") });
        b.wait_connected(a2.peer_id()).await.unwrap();

        a2.send(b.peer_id(), b"hello").await.unwrap();
        assert_eq!(next_event(&mut b_events).await.unwrap(), PoolEvent::MessageReceived {
            sender_id: PeerId::new("a"),
            message: Bytes::from_static(b"hello"),
        });
        drop(a);
    }

    #[tokio::test]
    async fn test_stale_signal_is_dropped() {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();
        let b = network.build_pool("b").unwrap();
        a.connect_to(b.peer_id()).await.unwrap();
        b.wait_connected(a.peer_id()).await.unwrap();
        let mut b_events = b.subscribe();

        b.on_signal(SignalEnvelope {
            sender_id: PeerId::new("a"),
            epoch: 1,
            sequence_number: 0,
            signal: Signal::Offer("offer:999".to_string()),
        }).await;

        assert_no_event(&mut b_events, Duration::from_millis(50)).await.unwrap();
        assert!(b.is_connected(a.peer_id()).await);
        assert_eq!(network.transport.num_sessions(), 2);
    }

    #[tokio::test]
    async fn test_signal_for_torn_down_link_is_dropped() {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();
        let b = network.build_pool("b").unwrap();
        a.connect_to(b.peer_id()).await.unwrap();
        b.wait_connected(a.peer_id()).await.unwrap();

        network.transport.sever(a.peer_id(), b.peer_id());
        b.wait_disconnected(a.peer_id()).await;
        a.wait_disconnected(b.peer_id()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(network.transport.num_sessions(), 0);

        let a_epoch = b.links.lock().await
            .highest_remote_epochs.get(a.peer_id()).copied()
            .unwrap();
        b.on_signal(SignalEnvelope {
            sender_id: PeerId::new("a"),
            epoch: a_epoch,
            sequence_number: 5,
            signal: Signal::Candidate("candidate:0".to_string()),
        }).await;

        assert_eq!(network.transport.num_sessions(), 0);
        assert!(b.get_link(a.peer_id()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();
        let b = network.build_pool("b").unwrap();
        b.disconnect().await;

        assert_eq!(a.connect_to(b.peer_id()).await, Err(NetError::Timeout("connecting to peer b".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_negotiation_is_dropped_after_timeout() {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();
        let b = network.build_pool("b").unwrap();

        // both sides offer at the same time, and each ignores the other's offer
        let (ra, rb) = tokio::join!(a.connect_to(b.peer_id()), b.connect_to(a.peer_id()));
        assert!(matches!(ra, Err(NetError::Timeout(_))));
        assert!(matches!(rb, Err(NetError::Timeout(_))));

        a.wait_disconnected(b.peer_id()).await;
        b.wait_disconnected(a.peer_id()).await;

        a.connect_to(b.peer_id()).await.unwrap();
        b.wait_connected(a.peer_id()).await.unwrap();
        a.send(b.peer_id(), b"finally").await.unwrap();
    }

    #[rstest]
    #[case::zero_fragment_size(OverlayConfig { fragment_size: 0, ..test_config() })]
    #[case::fragment_below_header(OverlayConfig { fragment_size: 3, ..test_config() })]
    #[case::max_below_fragment(OverlayConfig { max_envelope_size: 10, ..test_config() })]
    #[tokio::test]
    async fn test_invalid_config_is_rejected(#[case] config: OverlayConfig) {
        let network = TestNetwork::new(config);
        assert!(network.build_pool("a").is_err());
    }

    #[tokio::test]
    async fn test_connect_to_unknown_peer() {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();

        assert_eq!(a.connect_to(&PeerId::new("ghost")).await, Err(NetError::ConnectionLost(PeerId::new("ghost"))));
    }

    #[tokio::test]
    async fn test_dispose() {
        let network = TestNetwork::new(test_config());
        let a = network.build_pool("a").unwrap();
        let b = network.build_pool("b").unwrap();
        a.connect_to(b.peer_id()).await.unwrap();

        let mut events = a.subscribe();
        a.dispose().await;
        assert_eq!(a.event_notifier.num_listeners(), 0);
        assert_eq!(drain(&mut events), vec![PoolEvent::PeerDisconnected { peer_id: PeerId::new("b") }]);
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<PoolEvent>) -> Vec<PoolEvent> {
        crate::test_util::fixture::drain_events(events)
    }

    #[test]
    fn test_link_epochs_increase() {
        let mut previous = next_link_epoch();
        for _ in 0..1000 {
            let epoch = next_link_epoch();
            assert!(epoch > previous);
            previous = epoch;
        }
    }
}
