use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::ids::PeerId;
use crate::link::session::{ConnectionState, RtcSession, SessionEvent, SessionFactory};

struct SessionState {
    local_id: PeerId,
    remote_id: PeerId,
    events: mpsc::UnboundedSender<SessionEvent>,
    local_description: bool,
    /// the counterpart's session id, taken from its offer or answer
    remote_session: Option<u64>,
    candidates_received: usize,
    connected: bool,
}

#[derive(Default)]
struct Registry {
    sessions: FxHashMap<u64, SessionState>,
    next_session_id: u64,
}

impl Registry {
    fn counterpart(&self, session_id: u64) -> Option<u64> {
        let remote = self.sessions.get(&session_id)?.remote_session?;
        match self.sessions.get(&remote)?.remote_session {
            Some(back) if back == session_id => Some(remote),
            _ => None,
        }
    }

    fn is_ready(&self, session_id: u64) -> bool {
        match self.sessions.get(&session_id) {
            Some(s) => s.local_description && s.remote_session.is_some() && s.candidates_received > 0,
            None => false,
        }
    }

    /// Both sides become connected as soon as both have exchanged descriptions and at least
    ///  one candidate each.
    fn check_connected(&mut self, session_id: u64) {
        let remote = match self.counterpart(session_id) {
            Some(remote) => remote,
            None => return,
        };
        if !self.is_ready(session_id) || !self.is_ready(remote) {
            return;
        }

        for id in [session_id, remote] {
            if let Some(s) = self.sessions.get_mut(&id) {
                if !s.connected {
                    s.connected = true;
                    trace!("memory session #{} {:?} -> {:?} connected", id, s.local_id, s.remote_id);
                    let _ = s.events.send(SessionEvent::ConnectionStateChanged(ConnectionState::Connecting));
                    let _ = s.events.send(SessionEvent::ConnectionStateChanged(ConnectionState::Connected));
                    let _ = s.events.send(SessionEvent::ChannelOpen);
                }
            }
        }
    }
}

/// An in-memory [SessionFactory]. Sessions follow the usual negotiation rules: descriptions
///  must be exchanged in offer / answer order, candidates are rejected before the remote
///  description is assigned, and a pair of sessions only connects after both sides received
///  a candidate.
///
/// Sessions of all peers using the same transport instance can reach each other.
pub struct MemoryTransport {
    registry: Arc<Mutex<Registry>>,
    max_message_size: usize,
}

impl MemoryTransport {
    pub fn new(max_message_size: usize) -> MemoryTransport {
        MemoryTransport {
            registry: Default::default(),
            max_message_size,
        }
    }

    /// Simulates the loss of all connections between two peers: both sides see their
    ///  transport fail.
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        let mut registry = lock(&self.registry);
        let severed = registry.sessions.iter()
            .filter(|(_, s)| (&s.local_id == a && &s.remote_id == b) || (&s.local_id == b && &s.remote_id == a))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in severed {
            if let Some(s) = registry.sessions.remove(&id) {
                trace!("severing memory session #{} {:?} -> {:?}", id, s.local_id, s.remote_id);
                let _ = s.events.send(SessionEvent::ConnectionStateChanged(ConnectionState::Failed));
            }
        }
    }

    pub fn num_sessions(&self) -> usize {
        lock(&self.registry).sessions.len()
    }
}

impl SessionFactory for MemoryTransport {
    fn create_session(&self, local_id: &PeerId, remote_id: &PeerId) -> anyhow::Result<(Arc<dyn RtcSession>, mpsc::UnboundedReceiver<SessionEvent>)> {
        let (events, events_receiver) = mpsc::unbounded_channel();

        let mut registry = lock(&self.registry);
        let session_id = registry.next_session_id;
        registry.next_session_id += 1;
        registry.sessions.insert(session_id, SessionState {
            local_id: local_id.clone(),
            remote_id: remote_id.clone(),
            events,
            local_description: false,
            remote_session: None,
            candidates_received: 0,
            connected: false,
        });

        let session = MemorySession {
            session_id,
            registry: self.registry.clone(),
            max_message_size: self.max_message_size,
        };
        Ok((Arc::new(session), events_receiver))
    }
}

struct MemorySession {
    session_id: u64,
    registry: Arc<Mutex<Registry>>,
    max_message_size: usize,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn parse_session_ref(s: &str, prefix: &str) -> anyhow::Result<u64> {
    s.strip_prefix(prefix)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| anyhow!("malformed {}: {:?}", prefix.trim_end_matches(':'), s))
}

impl MemorySession {
    fn with_state<T>(&self, f: impl FnOnce(&mut Registry, u64) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let mut registry = lock(&self.registry);
        if !registry.sessions.contains_key(&self.session_id) {
            bail!("session #{} is closed", self.session_id);
        }
        f(&mut registry, self.session_id)
    }

    fn create_description(&self, kind: &str) -> anyhow::Result<String> {
        self.with_state(|registry, id| {
            if let Some(s) = registry.sessions.get_mut(&id) {
                s.local_description = true;
                let _ = s.events.send(SessionEvent::LocalCandidate(format!("candidate:{}", id)));
            }
            registry.check_connected(id);
            Ok(format!("{}:{}", kind, id))
        })
    }
}

#[async_trait]
impl RtcSession for MemorySession {
    async fn create_data_channel(&self) -> anyhow::Result<()> {
        self.with_state(|registry, id| {
            if let Some(s) = registry.sessions.get(&id) {
                let _ = s.events.send(SessionEvent::NegotiationNeeded);
            }
            Ok(())
        })
    }

    async fn create_offer(&self) -> anyhow::Result<String> {
        self.create_description("offer")
    }

    async fn create_answer(&self) -> anyhow::Result<String> {
        let has_remote = self.with_state(|registry, id| {
            Ok(registry.sessions.get(&id).and_then(|s| s.remote_session).is_some())
        })?;
        if !has_remote {
            bail!("cannot create an answer without a remote offer");
        }
        self.create_description("answer")
    }

    async fn set_remote_description(&self, description: &str) -> anyhow::Result<()> {
        let remote_session = if description.starts_with("offer:") {
            parse_session_ref(description, "offer:")?
        }
        else {
            parse_session_ref(description, "answer:")?
        };

        self.with_state(|registry, id| {
            if let Some(s) = registry.sessions.get_mut(&id) {
                if s.remote_session.is_some() {
                    bail!("remote description was assigned already");
                }
                s.remote_session = Some(remote_session);
            }
            registry.check_connected(id);
            Ok(())
        })
    }

    async fn add_remote_candidate(&self, candidate: &str) -> anyhow::Result<()> {
        let candidate_session = parse_session_ref(candidate, "candidate:")?;

        self.with_state(|registry, id| {
            if let Some(s) = registry.sessions.get_mut(&id) {
                match s.remote_session {
                    None => bail!("candidate before remote description"),
                    Some(remote) if remote != candidate_session => bail!("candidate {:?} does not belong to the remote session #{}", candidate, remote),
                    Some(_) => s.candidates_received += 1,
                }
            }
            registry.check_connected(id);
            Ok(())
        })
    }

    async fn send(&self, chunk: &[u8]) -> anyhow::Result<()> {
        if chunk.len() > self.max_message_size {
            bail!("message of {} bytes exceeds the maximum of {} bytes", chunk.len(), self.max_message_size);
        }

        self.with_state(|registry, id| {
            let connected = registry.sessions.get(&id)
                .map(|s| s.connected)
                .unwrap_or(false);
            if !connected {
                bail!("session #{} is not connected", id);
            }
            match registry.counterpart(id).and_then(|remote| registry.sessions.get(&remote)) {
                Some(remote) => {
                    let _ = remote.events.send(SessionEvent::ChannelMessage(Bytes::copy_from_slice(chunk)));
                    Ok(())
                }
                None => bail!("remote side of session #{} is gone", id),
            }
        })
    }

    async fn close(&self) {
        let mut registry = lock(&self.registry);
        let remote = registry.counterpart(self.session_id);
        let was_connected = registry.sessions.remove(&self.session_id)
            .map(|s| s.connected)
            .unwrap_or(false);

        if let Some(remote) = remote.and_then(|remote| registry.sessions.get(&remote)) {
            if was_connected {
                let _ = remote.events.send(SessionEvent::ChannelClosed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect_pair(transport: &MemoryTransport) -> (Arc<dyn RtcSession>, mpsc::UnboundedReceiver<SessionEvent>, Arc<dyn RtcSession>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (a, a_events) = transport.create_session(&PeerId::new("a"), &PeerId::new("b")).unwrap();
        let (b, b_events) = transport.create_session(&PeerId::new("b"), &PeerId::new("a")).unwrap();

        a.create_data_channel().await.unwrap();
        let offer = a.create_offer().await.unwrap();
        b.set_remote_description(&offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(&answer).await.unwrap();

        a.add_remote_candidate("candidate:1").await.unwrap();
        b.add_remote_candidate("candidate:0").await.unwrap();

        (a, a_events, b, b_events)
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut result = Vec::new();
        while let Ok(evt) = events.try_recv() {
            result.push(evt);
        }
        result
    }

    #[tokio::test]
    async fn test_negotiation() {
        let transport = MemoryTransport::new(100);
        let (a, mut a_events, b, mut b_events) = connect_pair(&transport).await;

        let a_evts = drain(&mut a_events);
        assert_eq!(a_evts[0], SessionEvent::NegotiationNeeded);
        assert_eq!(a_evts[1], SessionEvent::LocalCandidate("candidate:0".to_string()));
        assert!(a_evts.contains(&SessionEvent::ChannelOpen));
        assert!(drain(&mut b_events).contains(&SessionEvent::ChannelOpen));

        a.send(b"abc").await.unwrap();
        assert_eq!(drain(&mut b_events), vec![SessionEvent::ChannelMessage(Bytes::from_static(b"abc"))]);

        assert!(b.send(&[0u8; 101]).await.is_err());

        b.close().await;
        assert_eq!(drain(&mut a_events), vec![SessionEvent::ChannelClosed]);
        assert!(a.send(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description() {
        let transport = MemoryTransport::new(100);
        let (a, _a_events) = transport.create_session(&PeerId::new("a"), &PeerId::new("b")).unwrap();
        assert!(a.add_remote_candidate("candidate:1").await.is_err());
        assert!(a.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn test_sever() {
        let transport = MemoryTransport::new(100);
        let (_a, mut a_events, _b, mut b_events) = connect_pair(&transport).await;
        drain(&mut a_events);
        drain(&mut b_events);

        transport.sever(&PeerId::new("b"), &PeerId::new("a"));
        assert_eq!(drain(&mut a_events), vec![SessionEvent::ConnectionStateChanged(ConnectionState::Failed)]);
        assert_eq!(drain(&mut b_events), vec![SessionEvent::ConnectionStateChanged(ConnectionState::Failed)]);
        assert_eq!(transport.num_sessions(), 0);
    }
}
