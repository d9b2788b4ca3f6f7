use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::OverlayConfig;
use crate::error::{NetError, NetResult};
use crate::ids::PeerId;
use crate::link::envelope::{encode_envelope, Reassembler};
use crate::link::session::{ConnectionState, RtcSession, SessionEvent, SessionFactory};
use crate::signaling::sequencer::SignalSequencer;
use crate::signaling::signal_messages::{Signal, SignalEnvelope};
use crate::signaling::SignalingChannel;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkState {
    New,
    /// an offer was sent, and the link waits for the answer
    AwaitingRemoteDescription,
    Connected,
    /// terminal
    Disconnected,
}

/// Reported from a link to the pool that owns it
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Message {
        peer_id: PeerId,
        message: Bytes,
    },
    Disconnected {
        peer_id: PeerId,
        link_epoch: u64,
    },
}

struct Negotiation {
    is_initiator: bool,
    /// created in response to a remote signal: this side never sends an offer
    is_answering: bool,
    remote_description_assigned: bool,
    /// candidates that arrived before the remote description, in arrival order
    buffered_candidates: Vec<String>,
    transport_connected: bool,
    channel_open: bool,
    sequencer: SignalSequencer,
}

struct LinkShared {
    local_id: PeerId,
    remote_id: PeerId,
    epoch: u64,
    config: Arc<OverlayConfig>,
    session: Arc<dyn RtcSession>,
    negotiation: Mutex<Negotiation>,
    state: watch::Sender<LinkState>,
    /// keeps the chunks of concurrently sent envelopes from interleaving
    send_lock: Mutex<()>,
    owner: mpsc::UnboundedSender<LinkEvent>,
}

/// A negotiated connection to a single remote peer, with envelope framing on top of the
///  session's size-limited messages.
///
/// A link is a one-shot thing: once it is disconnected, it stays disconnected, and a new link
///  (with a new epoch) is needed to talk to the peer again.
pub struct PeerLink {
    shared: Arc<LinkShared>,
    event_loop: JoinHandle<()>,
}

impl Debug for PeerLink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerLink{{{:?}->{:?}@{}:{:?}}}", self.shared.local_id, self.shared.remote_id, self.shared.epoch, *self.shared.state.borrow())
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

impl PeerLink {
    pub(crate) fn new(
        local_id: PeerId,
        remote_id: PeerId,
        epoch: u64,
        is_answering: bool,
        config: Arc<OverlayConfig>,
        session_factory: &dyn SessionFactory,
        signaling: Arc<dyn SignalingChannel>,
        owner: mpsc::UnboundedSender<LinkEvent>,
    ) -> anyhow::Result<PeerLink> {
        let (session, session_events) = session_factory.create_session(&local_id, &remote_id)?;

        let sequencer = SignalSequencer::new(local_id.clone(), remote_id.clone(), epoch, signaling);
        let (state, _) = watch::channel(LinkState::New);

        let shared = Arc::new(LinkShared {
            local_id,
            remote_id,
            epoch,
            config,
            session,
            negotiation: Mutex::new(Negotiation {
                is_initiator: false,
                is_answering,
                remote_description_assigned: false,
                buffered_candidates: Vec::new(),
                transport_connected: false,
                channel_open: false,
                sequencer,
            }),
            state,
            send_lock: Mutex::new(()),
            owner,
        });

        let event_loop = tokio::spawn(event_loop(shared.clone(), session_events));

        Ok(PeerLink {
            shared,
            event_loop,
        })
    }

    pub fn remote_id(&self) -> &PeerId {
        &self.shared.remote_id
    }

    pub fn epoch(&self) -> u64 {
        self.shared.epoch
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Starts negotiation if this link is fresh and nobody else started it, and waits until
    ///  the link is connected.
    pub async fn connect(&self) -> NetResult<()> {
        let start_result = {
            let mut negotiation = self.shared.negotiation.lock().await;
            if self.state() == LinkState::New
                && !negotiation.is_initiator
                && !negotiation.is_answering
                && !negotiation.remote_description_assigned
            {
                debug!("initiating negotiation with {:?}", self.shared.remote_id);
                negotiation.is_initiator = true;
                self.shared.session.create_data_channel().await
            }
            else {
                Ok(())
            }
        };

        if let Err(e) = start_result {
            warn!("failed to create data channel to {:?}: {}", self.shared.remote_id, e);
            self.shared.disconnect().await;
            return Err(e.into());
        }

        self.wait_connected().await
    }

    pub async fn wait_connected(&self) -> NetResult<()> {
        let mut state = self.shared.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                LinkState::Connected => return Ok(()),
                LinkState::Disconnected => return Err(NetError::ConnectionLost(self.shared.remote_id.clone())),
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(NetError::ConnectionLost(self.shared.remote_id.clone()));
            }
        }
    }

    pub async fn wait_disconnected(&self) {
        let mut state = self.shared.state.subscribe();
        while *state.borrow_and_update() != LinkState::Disconnected {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Feeds a signal from the remote counterpart of this link into negotiation. Signals are
    ///  handled in sender order, each completely before the next.
    pub async fn on_signal(&self, envelope: SignalEnvelope) {
        let mut negotiation = self.shared.negotiation.lock().await;
        let signals = negotiation.sequencer.receive(envelope);
        for signal in signals {
            if let Err(e) = self.shared.handle_signal(&mut negotiation, signal).await {
                warn!("negotiation with {:?} failed: {}", self.shared.remote_id, e);
                self.shared.disconnect().await;
                return;
            }
        }
    }

    /// The epoch of the remote link instance this link negotiates with, once it is known
    pub async fn remote_epoch(&self) -> Option<u64> {
        self.shared.negotiation.lock().await
            .sequencer.remote_epoch()
    }

    pub async fn send(&self, payload: &[u8]) -> NetResult<()> {
        if !self.is_connected() {
            return Err(NetError::LinkNotConnected(self.shared.remote_id.clone()));
        }

        let chunks = encode_envelope(payload, self.shared.config.fragment_size, self.shared.config.max_envelope_size)?;

        let send_result = {
            let _guard = self.shared.send_lock.lock().await;
            let mut result = Ok(());
            for chunk in chunks {
                if let Err(e) = self.shared.session.send(&chunk).await {
                    result = Err(e);
                    break;
                }
            }
            result
        };

        if let Err(e) = send_result {
            warn!("sending to {:?} failed, disconnecting: {}", self.shared.remote_id, e);
            self.shared.disconnect().await;
            return Err(NetError::ConnectionLost(self.shared.remote_id.clone()));
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.shared.disconnect().await;
    }
}

impl LinkShared {
    async fn handle_signal(&self, negotiation: &mut Negotiation, signal: Signal) -> anyhow::Result<()> {
        match signal {
            Signal::Offer(description) => {
                if negotiation.is_initiator {
                    // simultaneous offers from both sides are not resolved
                    warn!("ignoring offer from {:?}: this side initiated the negotiation", self.remote_id);
                    return Ok(());
                }
                trace!("received offer from {:?}", self.remote_id);
                self.session.set_remote_description(&description).await?;
                negotiation.remote_description_assigned = true;
                self.flush_candidates(negotiation).await?;

                let answer = self.session.create_answer().await?;
                negotiation.sequencer.send(Signal::Answer(answer)).await?;
            }
            Signal::Answer(description) => {
                if !negotiation.is_initiator || negotiation.remote_description_assigned {
                    warn!("ignoring unexpected answer from {:?}", self.remote_id);
                    return Ok(());
                }
                trace!("received answer from {:?}", self.remote_id);
                self.session.set_remote_description(&description).await?;
                negotiation.remote_description_assigned = true;
                self.flush_candidates(negotiation).await?;
            }
            Signal::Candidate(candidate) => {
                if negotiation.remote_description_assigned {
                    self.session.add_remote_candidate(&candidate).await?;
                }
                else {
                    trace!("buffering candidate from {:?} until the remote description is assigned", self.remote_id);
                    negotiation.buffered_candidates.push(candidate);
                }
            }
        }
        Ok(())
    }

    async fn flush_candidates(&self, negotiation: &mut Negotiation) -> anyhow::Result<()> {
        for candidate in std::mem::take(&mut negotiation.buffered_candidates) {
            self.session.add_remote_candidate(&candidate).await?;
        }
        Ok(())
    }

    async fn on_negotiation_needed(&self) -> anyhow::Result<()> {
        let mut negotiation = self.negotiation.lock().await;
        let offer = self.session.create_offer().await?;
        negotiation.sequencer.send(Signal::Offer(offer)).await?;
        self.state.send_if_modified(|state| {
            if *state == LinkState::New {
                *state = LinkState::AwaitingRemoteDescription;
                true
            }
            else {
                false
            }
        });
        Ok(())
    }

    async fn on_local_candidate(&self, candidate: String) -> anyhow::Result<()> {
        self.negotiation.lock().await
            .sequencer.send(Signal::Candidate(candidate)).await
    }

    async fn on_transport_ready(&self, connected: bool, channel_open: bool) {
        let mut negotiation = self.negotiation.lock().await;
        negotiation.transport_connected |= connected;
        negotiation.channel_open |= channel_open;

        if negotiation.transport_connected && negotiation.channel_open {
            let became_connected = self.state.send_if_modified(|state| {
                match *state {
                    LinkState::Connected | LinkState::Disconnected => false,
                    _ => {
                        *state = LinkState::Connected;
                        true
                    }
                }
            });
            if became_connected {
                info!("link {:?} -> {:?} (epoch {}) connected", self.local_id, self.remote_id, self.epoch);
            }
        }
    }

    fn is_disconnected(&self) -> bool {
        *self.state.borrow() == LinkState::Disconnected
    }

    async fn disconnect(&self) {
        if self.state.send_replace(LinkState::Disconnected) == LinkState::Disconnected {
            return;
        }

        info!("link {:?} -> {:?} (epoch {}) disconnected", self.local_id, self.remote_id, self.epoch);
        self.session.close().await;
        let _ = self.owner.send(LinkEvent::Disconnected {
            peer_id: self.remote_id.clone(),
            link_epoch: self.epoch,
        });
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn event_loop(shared: Arc<LinkShared>, mut session_events: mpsc::UnboundedReceiver<SessionEvent>) {
    let mut reassembler = Reassembler::new(shared.config.max_envelope_size);

    loop {
        let deadline = reassembler.deadline(shared.config.reassembly_timeout);

        let event = select! {
            event = session_events.recv() => event,
            _ = sleep_until_deadline(deadline) => {
                warn!("incomplete multipart envelope from {:?} timed out", shared.remote_id);
                shared.disconnect().await;
                break;
            }
        };

        let event = match event {
            Some(event) => event,
            None => {
                debug!("session events for {:?} ended", shared.remote_id);
                shared.disconnect().await;
                break;
            }
        };

        if shared.is_disconnected() {
            break;
        }

        match event {
            SessionEvent::NegotiationNeeded => {
                if let Err(e) = shared.on_negotiation_needed().await {
                    warn!("failed to send offer to {:?}: {}", shared.remote_id, e);
                    shared.disconnect().await;
                    break;
                }
            }
            SessionEvent::LocalCandidate(candidate) => {
                if let Err(e) = shared.on_local_candidate(candidate).await {
                    warn!("failed to send candidate to {:?}: {}", shared.remote_id, e);
                }
            }
            SessionEvent::ConnectionStateChanged(ConnectionState::Connected) => {
                shared.on_transport_ready(true, false).await;
            }
            SessionEvent::ConnectionStateChanged(state @ (ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed)) => {
                debug!("transport to {:?} changed to {:?}", shared.remote_id, state);
                shared.disconnect().await;
                break;
            }
            SessionEvent::ConnectionStateChanged(state) => {
                trace!("transport to {:?} changed to {:?}", shared.remote_id, state);
            }
            SessionEvent::ChannelOpen => {
                shared.on_transport_ready(false, true).await;
            }
            SessionEvent::ChannelMessage(chunk) => {
                match reassembler.on_chunk(&chunk, Instant::now()) {
                    Ok(Some(message)) => {
                        trace!("received {} bytes from {:?}", message.len(), shared.remote_id);
                        let _ = shared.owner.send(LinkEvent::Message {
                            peer_id: shared.remote_id.clone(),
                            message,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("framing violation from {:?}, disconnecting: {}", shared.remote_id, e);
                        shared.disconnect().await;
                        break;
                    }
                }
            }
            SessionEvent::ChannelClosed => {
                debug!("data channel to {:?} closed", shared.remote_id);
                shared.disconnect().await;
                break;
            }
            SessionEvent::Error(e) => {
                warn!("transport error on link to {:?}: {}", shared.remote_id, e);
                shared.disconnect().await;
                break;
            }
        }
    }
}
