use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::{NetError, NetResult};
use crate::events::EventNotifier;
use crate::ids::{NetworkId, PeerId};
use crate::overlay::star_messages::{StarEnvelope, StarMessage};
use crate::pool::peer_pool::{PeerPool, PoolEvent};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetworkEvent {
    MemberJoined {
        peer_id: PeerId,
    },
    MemberLeft {
        peer_id: PeerId,
        /// `true` if the member's link was lost, `false` for a voluntary leave
        connection_lost: bool,
    },
    Received {
        sender_id: PeerId,
        body: Bytes,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StarPhase {
    Disconnected,
    /// sent the connection request, waiting for the hub's ack
    Connecting,
    Joined,
}

struct StarState {
    phase: StarPhase,
    members: BTreeSet<PeerId>,
    /// hub only
    spokes: BTreeSet<PeerId>,
    /// spoke only
    hub_id: Option<PeerId>,
    has_connected: bool,
    pending_ack: Option<oneshot::Sender<NetResult<()>>>,
}

impl StarState {
    /// the star collapsed or was left: a spoke can not see anybody without the hub
    fn reset(&mut self, local_id: &PeerId) {
        self.phase = StarPhase::Disconnected;
        self.members.clear();
        self.members.insert(local_id.clone());
        self.spokes.clear();
    }
}

/// A logical star-shaped network on top of a [PeerPool]: a single hub relays all traffic
///  between the spokes, and keeps everybody's view of the membership consistent.
///
/// Several networks with different ids can share a pool.
pub struct StarOverlayNetwork {
    network_id: NetworkId,
    local_id: PeerId,
    is_hub: bool,
    pool: Arc<PeerPool>,
    state: Mutex<StarState>,
    event_notifier: EventNotifier<NetworkEvent>,
    receive_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StarOverlayNetwork {
    fn drop(&mut self) {
        self.abort_receive_task();
    }
}

impl StarOverlayNetwork {
    pub fn new(network_id: NetworkId, pool: Arc<PeerPool>, is_hub: bool) -> Arc<StarOverlayNetwork> {
        let local_id = pool.peer_id().clone();
        let pool_events = pool.subscribe();

        let mut members = BTreeSet::new();
        members.insert(local_id.clone());

        let network = Arc::new(StarOverlayNetwork {
            network_id,
            local_id,
            is_hub,
            pool,
            state: Mutex::new(StarState {
                phase: if is_hub { StarPhase::Joined } else { StarPhase::Disconnected },
                members,
                spokes: BTreeSet::new(),
                hub_id: None,
                has_connected: false,
                pending_ack: None,
            }),
            event_notifier: EventNotifier::new(),
            receive_task: Default::default(),
        });

        let receive_task = tokio::spawn(receive_loop(Arc::downgrade(&network), pool_events));
        if let Ok(mut task) = network.receive_task.lock() {
            *task = Some(receive_task);
        }
        network
    }

    pub fn network_id(&self) -> &NetworkId {
        &self.network_id
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn is_hub(&self) -> bool {
        self.is_hub
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<NetworkEvent> {
        self.event_notifier.subscribe()
    }

    pub async fn phase(&self) -> StarPhase {
        self.state.lock().await.phase
    }

    pub async fn member_ids(&self) -> BTreeSet<PeerId> {
        self.state.lock().await.members.clone()
    }

    /// Joins the network through its hub. This is only possible for a spoke, and only once
    ///  per instance - successful or not.
    pub async fn connect_to(&self, hub_id: &PeerId) -> NetResult<()> {
        if self.is_hub {
            return Err(NetError::HubCannotConnect(self.network_id.clone()));
        }

        let ack = {
            let mut state = self.state.lock().await;
            if state.has_connected {
                return Err(NetError::AlreadyConnected(self.network_id.clone()));
            }
            state.has_connected = true;
            state.phase = StarPhase::Connecting;
            state.hub_id = Some(hub_id.clone());

            let (send, receive) = oneshot::channel();
            state.pending_ack = Some(send);
            receive
        };

        let mut connection_sent = false;
        let join = async {
            self.pool.connect_to(hub_id).await?;
            let connection = StarMessage::Connection { sender_id: self.local_id.clone() };
            self.send_message(hub_id, connection).await?;
            connection_sent = true;

            ack.await
                .unwrap_or_else(|_| Err(NetError::ConnectionLost(hub_id.clone())))
        };

        let result = match timeout(self.pool.config().join_timeout, join).await {
            Ok(result) => result,
            Err(_) => Err(NetError::Timeout(format!("joining network {} through hub {}", self.network_id, hub_id))),
        };

        match &result {
            Ok(()) => info!("{:?} joined network {:?} through hub {:?}", self.local_id, self.network_id, hub_id),
            Err(e) => {
                debug!("joining network {:?} failed: {}", self.network_id, e);
                let abandoned = {
                    let mut state = self.state.lock().await;
                    if state.phase != StarPhase::Joined {
                        state.pending_ack = None;
                        state.reset(&self.local_id);
                        true
                    }
                    else {
                        false
                    }
                };

                // the hub may still process the connection and announce this spoke: take it back
                if abandoned && connection_sent {
                    let raw = self.envelope(StarMessage::Disconnection {
                        sender_id: self.local_id.clone(),
                        connection_lost: false,
                    });
                    self.relay(hub_id, &raw).await;
                }
            }
        }
        result
    }

    /// Leaves the network voluntarily. Remaining members see the leave with
    ///  `connection_lost: false`.
    pub async fn disconnect(&self) {
        let (targets, members_before) = {
            let mut state = self.state.lock().await;
            if state.phase == StarPhase::Disconnected {
                return;
            }

            let targets = if self.is_hub {
                state.spokes.iter().cloned().collect::<Vec<_>>()
            }
            else {
                state.hub_id.iter().cloned().collect::<Vec<_>>()
            };
            let members_before = state.members.len();
            if let Some(pending) = state.pending_ack.take() {
                let _ = pending.send(Err(NetError::NotJoined(self.network_id.clone())));
            }
            state.reset(&self.local_id);
            (targets, members_before)
        };

        info!("{:?} leaves network {:?} ({} members)", self.local_id, self.network_id, members_before);
        let raw = self.envelope(StarMessage::Disconnection {
            sender_id: self.local_id.clone(),
            connection_lost: false,
        });
        for target in targets {
            self.relay(&target, &raw).await;
        }
    }

    pub async fn unicast(&self, recipient_id: &PeerId, body: Bytes) -> NetResult<()> {
        let hub_id = self.require_joined().await?;

        if self.is_hub {
            if recipient_id == &self.local_id {
                self.event_notifier.send_event(NetworkEvent::Received {
                    sender_id: self.local_id.clone(),
                    body,
                });
                return Ok(());
            }

            let message = StarMessage::Unicast {
                sender_id: self.local_id.clone(),
                recipient_id: recipient_id.clone(),
                body,
            };
            self.relay_to_spoke(recipient_id, &self.envelope(message)).await;
            return Ok(());
        }

        let message = StarMessage::Unicast {
            sender_id: self.local_id.clone(),
            recipient_id: recipient_id.clone(),
            body,
        };
        self.send_message(&hub_id, message).await
    }

    /// Sends to all other members. The sender never receives its own broadcast.
    pub async fn broadcast(&self, body: Bytes) -> NetResult<()> {
        let hub_id = self.require_joined().await?;

        let message = StarMessage::Broadcast {
            sender_id: self.local_id.clone(),
            body,
        };

        if self.is_hub {
            let raw = self.envelope(message);
            for spoke in self.spokes().await {
                self.relay(&spoke, &raw).await;
            }
            return Ok(());
        }

        self.send_message(&hub_id, message).await
    }

    /// Stops processing incoming messages and drops all subscriptions. This does not leave
    ///  the network, see [StarOverlayNetwork::disconnect].
    pub fn dispose(&self) {
        self.abort_receive_task();
        self.event_notifier.clear();
    }

    fn abort_receive_task(&self) {
        if let Ok(mut task) = self.receive_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }

    /// returns the hub's id - for the hub itself, that is the local id
    async fn require_joined(&self) -> NetResult<PeerId> {
        let state = self.state.lock().await;
        if state.phase != StarPhase::Joined {
            return Err(NetError::NotJoined(self.network_id.clone()));
        }
        if self.is_hub {
            return Ok(self.local_id.clone());
        }
        state.hub_id.clone()
            .ok_or_else(|| NetError::NotJoined(self.network_id.clone()))
    }

    async fn spokes(&self) -> Vec<PeerId> {
        self.state.lock().await
            .spokes.iter().cloned().collect()
    }

    fn envelope(&self, message: StarMessage) -> Bytes {
        StarEnvelope::new(self.network_id.clone(), message).to_bytes()
    }

    async fn send_message(&self, to: &PeerId, message: StarMessage) -> NetResult<()> {
        trace!("sending {:?} to {:?}", message, to);
        self.pool.send(to, &self.envelope(message)).await
    }

    /// Relays are best effort: the target may have left in the meantime
    async fn relay(&self, to: &PeerId, raw: &[u8]) {
        if let Err(e) = self.pool.send(to, raw).await {
            debug!("relaying to {:?} failed, dropping: {}", to, e);
        }
    }

    async fn relay_to_spoke(&self, spoke_id: &PeerId, raw: &[u8]) {
        let is_spoke = self.state.lock().await
            .spokes.contains(spoke_id);
        if is_spoke {
            self.relay(spoke_id, raw).await;
        }
        else {
            debug!("{:?} is not a member of network {:?} - dropping message", spoke_id, self.network_id);
        }
    }

    async fn on_message(&self, link_sender_id: PeerId, raw: Bytes) {
        let envelope = match StarEnvelope::deser(raw.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!("ignoring message from {:?} that is not a star envelope: {}", link_sender_id, e);
                return;
            }
        };
        if envelope.network_id != self.network_id {
            trace!("ignoring message for network {:?}", envelope.network_id);
            return;
        }

        if self.is_hub {
            if envelope.message.sender_id() != &link_sender_id {
                warn!("{:?} sent a message on behalf of {:?} - dropping", link_sender_id, envelope.message.sender_id());
                return;
            }
            self.on_hub_message(link_sender_id, envelope.message, raw).await;
        }
        else {
            self.on_spoke_message(link_sender_id, envelope.message).await;
        }
    }

    async fn on_hub_message(&self, sender_id: PeerId, message: StarMessage, raw: Bytes) {
        match message {
            StarMessage::Connection { .. } => {
                let (members, others, is_new) = {
                    let mut state = self.state.lock().await;
                    if state.phase != StarPhase::Joined {
                        debug!("hub of {:?} left - ignoring connection from {:?}", self.network_id, sender_id);
                        return;
                    }
                    let members = state.members.iter().cloned().collect::<Vec<_>>();
                    let is_new = state.spokes.insert(sender_id.clone());
                    let others = state.spokes.iter()
                        .filter(|s| *s != &sender_id)
                        .cloned()
                        .collect::<Vec<_>>();
                    (members, others, is_new)
                };

                let ack = StarMessage::ConnectionAck {
                    sender_id: self.local_id.clone(),
                    member_ids: members,
                };
                if let Err(e) = self.send_message(&sender_id, ack).await {
                    debug!("acknowledging connection from {:?} failed: {}", sender_id, e);
                }

                if !is_new {
                    debug!("{:?} connected to {:?} again - acknowledged without announcing", sender_id, self.network_id);
                    return;
                }

                for other in others {
                    self.relay(&other, &raw).await;
                }

                self.state.lock().await
                    .members.insert(sender_id.clone());
                info!("{:?} joined network {:?}", sender_id, self.network_id);
                self.event_notifier.send_event(NetworkEvent::MemberJoined { peer_id: sender_id });
            }
            StarMessage::Disconnection { connection_lost, .. } => {
                self.on_spoke_left(&sender_id, connection_lost, raw).await;
            }
            StarMessage::Unicast { recipient_id, body, .. } => {
                if recipient_id == self.local_id {
                    self.event_notifier.send_event(NetworkEvent::Received { sender_id, body });
                }
                else {
                    self.relay_to_spoke(&recipient_id, &raw).await;
                }
            }
            StarMessage::Broadcast { body, .. } => {
                if !self.state.lock().await.spokes.contains(&sender_id) {
                    debug!("broadcast from non-member {:?} - dropping", sender_id);
                    return;
                }

                self.event_notifier.send_event(NetworkEvent::Received { sender_id: sender_id.clone(), body });
                let others = self.spokes().await.into_iter()
                    .filter(|s| s != &sender_id);
                for other in others {
                    self.relay(&other, &raw).await;
                }
            }
            StarMessage::ConnectionAck { .. } => {
                warn!("hub of {:?} received a connection ack from {:?} - dropping", self.network_id, sender_id);
            }
        }
    }

    /// Removes a spoke, announces its departure to the remaining spokes and reports it locally
    async fn on_spoke_left(&self, spoke_id: &PeerId, connection_lost: bool, raw: Bytes) {
        let others = {
            let mut state = self.state.lock().await;
            if !state.spokes.remove(spoke_id) {
                trace!("{:?} is not a spoke of {:?}", spoke_id, self.network_id);
                return;
            }
            state.members.remove(spoke_id);
            state.spokes.iter().cloned().collect::<Vec<_>>()
        };

        for other in others {
            self.relay(&other, &raw).await;
        }

        info!("{:?} left network {:?} (connection lost: {})", spoke_id, self.network_id, connection_lost);
        self.event_notifier.send_event(NetworkEvent::MemberLeft {
            peer_id: spoke_id.clone(),
            connection_lost,
        });
    }

    async fn on_spoke_message(&self, link_sender_id: PeerId, message: StarMessage) {
        let mut state = self.state.lock().await;

        if state.hub_id.as_ref() != Some(&link_sender_id) || state.phase == StarPhase::Disconnected {
            debug!("spoke of {:?} received {:?} from {:?} which is not its hub - dropping", self.network_id, message, link_sender_id);
            return;
        }

        match message {
            StarMessage::ConnectionAck { member_ids, .. } => {
                if state.phase != StarPhase::Connecting {
                    debug!("unexpected connection ack in {:?} - dropping", self.network_id);
                    return;
                }

                let joined = member_ids.into_iter()
                    .chain(std::iter::once(link_sender_id.clone()))
                    .filter(|m| m != &self.local_id)
                    .collect::<BTreeSet<_>>();

                state.members.extend(joined.iter().cloned());
                state.phase = StarPhase::Joined;
                if let Some(pending) = state.pending_ack.take() {
                    let _ = pending.send(Ok(()));
                }
                drop(state);

                for peer_id in joined {
                    self.event_notifier.send_event(NetworkEvent::MemberJoined { peer_id });
                }
            }
            StarMessage::Connection { sender_id } => {
                if sender_id == self.local_id || !state.members.insert(sender_id.clone()) {
                    return;
                }
                drop(state);
                self.event_notifier.send_event(NetworkEvent::MemberJoined { peer_id: sender_id });
            }
            StarMessage::Disconnection { sender_id, connection_lost } => {
                if sender_id == link_sender_id {
                    // the hub left: the star collapses
                    state.reset(&self.local_id);
                    drop(state);
                    info!("hub {:?} of network {:?} left", sender_id, self.network_id);
                    self.event_notifier.send_event(NetworkEvent::MemberLeft { peer_id: sender_id, connection_lost });
                    return;
                }

                if !state.members.remove(&sender_id) {
                    return;
                }
                drop(state);
                self.event_notifier.send_event(NetworkEvent::MemberLeft { peer_id: sender_id, connection_lost });
            }
            StarMessage::Unicast { sender_id, recipient_id, body } => {
                if recipient_id != self.local_id {
                    warn!("spoke {:?} received a unicast for {:?} - dropping", self.local_id, recipient_id);
                    return;
                }
                drop(state);
                self.event_notifier.send_event(NetworkEvent::Received { sender_id, body });
            }
            StarMessage::Broadcast { sender_id, body } => {
                if sender_id == self.local_id {
                    return;
                }
                drop(state);
                self.event_notifier.send_event(NetworkEvent::Received { sender_id, body });
            }
        }
    }

    async fn on_peer_disconnected(&self, peer_id: PeerId) {
        if self.is_hub {
            let raw = self.envelope(StarMessage::Disconnection {
                sender_id: peer_id.clone(),
                connection_lost: true,
            });
            self.on_spoke_left(&peer_id, true, raw).await;
            return;
        }

        let mut state = self.state.lock().await;
        if state.hub_id.as_ref() != Some(&peer_id) {
            return;
        }

        match state.phase {
            StarPhase::Disconnected => {}
            StarPhase::Connecting => {
                if let Some(pending) = state.pending_ack.take() {
                    let _ = pending.send(Err(NetError::ConnectionLost(peer_id)));
                }
                state.reset(&self.local_id);
            }
            StarPhase::Joined => {
                state.reset(&self.local_id);
                drop(state);
                info!("lost connection to hub {:?} of network {:?}", peer_id, self.network_id);
                self.event_notifier.send_event(NetworkEvent::MemberLeft {
                    peer_id,
                    connection_lost: true,
                });
            }
        }
    }
}

async fn receive_loop(network: Weak<StarOverlayNetwork>, mut pool_events: mpsc::UnboundedReceiver<PoolEvent>) {
    while let Some(evt) = pool_events.recv().await {
        let network = match network.upgrade() {
            Some(network) => network,
            None => break,
        };

        match evt {
            PoolEvent::MessageReceived { sender_id, message } => network.on_message(sender_id, message).await,
            PoolEvent::PeerDisconnected { peer_id } => network.on_peer_disconnected(peer_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::config::OverlayConfig;
    use crate::test_util::fixture::{assert_no_event, next_event, test_config, TestNetwork};

    struct Star {
        network: TestNetwork,
        pools: Vec<Arc<PeerPool>>,
        /// the hub is at index 0
        nodes: Vec<Arc<StarOverlayNetwork>>,
    }

    impl Star {
        fn id(&self, idx: usize) -> PeerId {
            self.pools[idx].peer_id().clone()
        }
    }

    async fn star(network_id: &str, num_spokes: usize) -> Star {
        let network = TestNetwork::new(test_config());
        let mut pools = vec![network.build_pool("hub").unwrap()];
        let mut nodes = vec![StarOverlayNetwork::new(NetworkId::new(network_id), pools[0].clone(), true)];

        for n in 1..=num_spokes {
            let pool = network.build_pool(format!("s{}", n)).unwrap();
            let node = StarOverlayNetwork::new(NetworkId::new(network_id), pool.clone(), false);
            node.connect_to(&PeerId::new("hub")).await.unwrap();
            pools.push(pool);
            nodes.push(node);
        }

        let all = pools.iter().map(|p| p.peer_id().clone()).collect::<BTreeSet<_>>();
        for node in &nodes {
            await_members(node, &all).await;
        }

        Star { network, pools, nodes }
    }

    async fn await_members(node: &StarOverlayNetwork, expected: &BTreeSet<PeerId>) {
        let converged = timeout(Duration::from_secs(5), async {
            while &node.member_ids().await != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await;
        assert!(converged.is_ok(), "{:?} has members {:?}, expected {:?}", node.local_id(), node.member_ids().await, expected);
    }

    fn ids(names: &[&str]) -> BTreeSet<PeerId> {
        names.iter().map(PeerId::new).collect()
    }

    fn received(sender: &str, body: &'static [u8]) -> NetworkEvent {
        NetworkEvent::Received {
            sender_id: PeerId::new(sender),
            body: Bytes::from_static(body),
        }
    }

    #[tokio::test]
    async fn test_membership_convergence() {
        let star = star("n", 3).await;
        for node in &star.nodes {
            assert_eq!(node.member_ids().await, ids(&["hub", "s1", "s2", "s3"]));
            assert_eq!(node.phase().await, StarPhase::Joined);
        }
    }

    #[tokio::test]
    async fn test_join_events() {
        let star = star("n", 2).await;
        let mut s1_events = star.nodes[1].subscribe();
        let mut hub_events = star.nodes[0].subscribe();

        let pool = star.network.build_pool("s3").unwrap();
        let s3 = StarOverlayNetwork::new(NetworkId::new("n"), pool, false);
        let mut s3_events = s3.subscribe();
        s3.connect_to(&PeerId::new("hub")).await.unwrap();

        assert_eq!(next_event(&mut s1_events).await.unwrap(), NetworkEvent::MemberJoined { peer_id: PeerId::new("s3") });
        assert_eq!(next_event(&mut hub_events).await.unwrap(), NetworkEvent::MemberJoined { peer_id: PeerId::new("s3") });

        let mut joined = BTreeSet::new();
        for _ in 0..3 {
            match next_event(&mut s3_events).await.unwrap() {
                NetworkEvent::MemberJoined { peer_id } => { joined.insert(peer_id); }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(joined, ids(&["hub", "s1", "s2"]));
        assert_no_event(&mut s3_events, Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_voluntary_leave() {
        let star = star("n", 3).await;
        let mut remaining_events = vec![star.nodes[0].subscribe(), star.nodes[2].subscribe(), star.nodes[3].subscribe()];

        star.nodes[1].disconnect().await;

        for events in &mut remaining_events {
            assert_eq!(next_event(events).await.unwrap(), NetworkEvent::MemberLeft { peer_id: PeerId::new("s1"), connection_lost: false });
            assert_no_event(events, Duration::from_millis(50)).await.unwrap();
        }
        for idx in [0, 2, 3] {
            assert_eq!(star.nodes[idx].member_ids().await, ids(&["hub", "s2", "s3"]));
        }
        assert_eq!(star.nodes[1].member_ids().await, ids(&["s1"]));
        assert_eq!(star.nodes[1].phase().await, StarPhase::Disconnected);

        // the links stay up, they may be used by other networks
        assert!(star.pools[1].is_connected(&star.id(0)).await);
    }

    #[tokio::test]
    async fn test_link_loss() {
        let star = star("n", 3).await;
        let mut s1_events = star.nodes[1].subscribe();
        let mut remaining_events = vec![star.nodes[0].subscribe(), star.nodes[2].subscribe(), star.nodes[3].subscribe()];

        star.network.transport.sever(&star.id(0), &star.id(1));

        for events in &mut remaining_events {
            assert_eq!(next_event(events).await.unwrap(), NetworkEvent::MemberLeft { peer_id: PeerId::new("s1"), connection_lost: true });
            assert_no_event(events, Duration::from_millis(50)).await.unwrap();
        }
        assert_eq!(next_event(&mut s1_events).await.unwrap(), NetworkEvent::MemberLeft { peer_id: PeerId::new("hub"), connection_lost: true });
        assert_eq!(star.nodes[1].member_ids().await, ids(&["s1"]));
        assert_eq!(star.nodes[1].broadcast(Bytes::from_static(b"x")).await, Err(NetError::NotJoined(NetworkId::new("n"))));

        for idx in [0, 2, 3] {
            assert_eq!(star.nodes[idx].member_ids().await, ids(&["hub", "s2", "s3"]));
        }
    }

    #[tokio::test]
    async fn test_hub_leaves() {
        let star = star("n", 2).await;
        let mut spoke_events = vec![star.nodes[1].subscribe(), star.nodes[2].subscribe()];

        star.nodes[0].disconnect().await;

        for (idx, events) in spoke_events.iter_mut().enumerate() {
            assert_eq!(next_event(events).await.unwrap(), NetworkEvent::MemberLeft { peer_id: PeerId::new("hub"), connection_lost: false });
            assert_eq!(star.nodes[idx + 1].member_ids().await, BTreeSet::from([star.id(idx + 1)]));
            assert_eq!(star.nodes[idx + 1].phase().await, StarPhase::Disconnected);
        }
    }

    #[rstest]
    #[case::from_spoke(1)]
    #[case::from_hub(0)]
    #[tokio::test]
    async fn test_broadcast_exclusivity(#[case] broadcaster: usize) {
        let star = star("n", 3).await;
        let mut events = star.nodes.iter().map(|n| n.subscribe()).collect::<Vec<_>>();

        star.nodes[broadcaster].broadcast(Bytes::from_static(b"to all")).await.unwrap();

        let sender = star.id(broadcaster);
        for (idx, events) in events.iter_mut().enumerate() {
            if idx == broadcaster {
                assert_no_event(events, Duration::from_millis(50)).await.unwrap();
            }
            else {
                assert_eq!(next_event(events).await.unwrap(), NetworkEvent::Received {
                    sender_id: sender.clone(),
                    body: Bytes::from_static(b"to all"),
                });
            }
        }
    }

    #[tokio::test]
    async fn test_unicast_between_spokes() {
        let star = star("n1", 2).await;
        let mut events = star.nodes.iter().map(|n| n.subscribe()).collect::<Vec<_>>();

        star.nodes[1].unicast(&PeerId::new("s2"), Bytes::from_static(b"hi")).await.unwrap();

        assert_eq!(next_event(&mut events[2]).await.unwrap(), received("s1", b"hi"));
        for idx in 0..3 {
            assert_no_event(&mut events[idx], Duration::from_millis(50)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unicast_with_hub() {
        let star = star("n", 2).await;
        let mut hub_events = star.nodes[0].subscribe();
        let mut s2_events = star.nodes[2].subscribe();

        star.nodes[1].unicast(&PeerId::new("hub"), Bytes::from_static(b"to hub")).await.unwrap();
        assert_eq!(next_event(&mut hub_events).await.unwrap(), received("s1", b"to hub"));

        star.nodes[0].unicast(&PeerId::new("s2"), Bytes::from_static(b"from hub")).await.unwrap();
        assert_eq!(next_event(&mut s2_events).await.unwrap(), received("hub", b"from hub"));

        // relaying to a peer that is not a member is dropped silently
        star.nodes[0].unicast(&PeerId::new("departed"), Bytes::from_static(b"x")).await.unwrap();
        star.nodes[1].unicast(&PeerId::new("departed"), Bytes::from_static(b"x")).await.unwrap();
        assert_no_event(&mut hub_events, Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_networks_share_pool() {
        let star = star("n1", 1).await;
        let hub_n2 = StarOverlayNetwork::new(NetworkId::new("n2"), star.pools[0].clone(), true);
        let s1_n2 = StarOverlayNetwork::new(NetworkId::new("n2"), star.pools[1].clone(), false);
        s1_n2.connect_to(&PeerId::new("hub")).await.unwrap();

        let mut hub_n1_events = star.nodes[0].subscribe();
        let mut hub_n2_events = hub_n2.subscribe();

        s1_n2.broadcast(Bytes::from_static(b"on n2")).await.unwrap();
        assert_eq!(next_event(&mut hub_n2_events).await.unwrap(), received("s1", b"on n2"));
        assert_no_event(&mut hub_n1_events, Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_not_joined() {
        let network = TestNetwork::new(test_config());
        let spoke = StarOverlayNetwork::new(NetworkId::new("n"), network.build_pool("s").unwrap(), false);

        assert_eq!(spoke.broadcast(Bytes::new()).await, Err(NetError::NotJoined(NetworkId::new("n"))));
        assert_eq!(spoke.unicast(&PeerId::new("x"), Bytes::new()).await, Err(NetError::NotJoined(NetworkId::new("n"))));
        assert_eq!(spoke.member_ids().await, ids(&["s"]));
    }

    #[tokio::test]
    async fn test_connect_rules() {
        let star = star("n", 1).await;

        assert_eq!(star.nodes[0].connect_to(&PeerId::new("s1")).await, Err(NetError::HubCannotConnect(NetworkId::new("n"))));
        assert_eq!(star.nodes[1].connect_to(&PeerId::new("hub")).await, Err(NetError::AlreadyConnected(NetworkId::new("n"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout() {
        let network = TestNetwork::new(test_config());
        // a peer without a network instance never acknowledges
        let _not_a_hub = network.build_pool("hub").unwrap();
        let spoke = StarOverlayNetwork::new(NetworkId::new("n"), network.build_pool("s").unwrap(), false);

        match spoke.connect_to(&PeerId::new("hub")).await {
            Err(NetError::Timeout(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(spoke.phase().await, StarPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_join_timeout_after_connection_was_sent() {
        let network = TestNetwork::new(OverlayConfig {
            join_timeout: Duration::from_millis(200),
            ..test_config()
        });
        let hub = StarOverlayNetwork::new(NetworkId::new("n"), network.build_pool("hub").unwrap(), true);
        let spoke = StarOverlayNetwork::new(NetworkId::new("n"), network.build_pool("s").unwrap(), false);
        let mut hub_events = hub.subscribe();

        // a busy hub: it processes the connection only after the spoke gave up
        let busy = hub.state.lock().await;
        match spoke.connect_to(&PeerId::new("hub")).await {
            Err(NetError::Timeout(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
        drop(busy);

        assert_eq!(next_event(&mut hub_events).await.unwrap(), NetworkEvent::MemberJoined { peer_id: PeerId::new("s") });
        assert_eq!(next_event(&mut hub_events).await.unwrap(), NetworkEvent::MemberLeft { peer_id: PeerId::new("s"), connection_lost: false });

        await_members(&hub, &ids(&["hub"])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(spoke.member_ids().await, ids(&["s"]));
        assert_eq!(spoke.phase().await, StarPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_hub_lost_while_connecting() {
        let network = TestNetwork::new(test_config());
        let spoke = StarOverlayNetwork::new(NetworkId::new("n"), network.build_pool("s").unwrap(), false);

        // nobody is registered as "hub" for signaling, so the link fails right away
        assert_eq!(spoke.connect_to(&PeerId::new("hub")).await, Err(NetError::ConnectionLost(PeerId::new("hub"))));
        assert_eq!(spoke.member_ids().await, ids(&["s"]));
    }
}
