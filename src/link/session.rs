use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::ids::PeerId;

/// Transport level connection state as reported by a session
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    /// The session wants an offer to be created and sent to the remote peer
    NegotiationNeeded,
    LocalCandidate(String),
    ConnectionStateChanged(ConnectionState),
    ChannelOpen,
    ChannelMessage(Bytes),
    ChannelClosed,
    Error(String),
}

/// A negotiated, reliable, ordered, message-oriented channel to a single remote peer. This is
///  the seam to the actual transport (e.g. a WebRTC peer connection with a data channel).
///
/// Session descriptions and candidates are opaque strings that are shipped to the other side
///  through the signaling channel.
#[async_trait]
pub trait RtcSession: Send + Sync + 'static {
    /// Only called on the initiating side. The session responds with
    ///  [SessionEvent::NegotiationNeeded].
    async fn create_data_channel(&self) -> anyhow::Result<()>;

    async fn create_offer(&self) -> anyhow::Result<String>;
    async fn create_answer(&self) -> anyhow::Result<String>;
    async fn set_remote_description(&self, description: &str) -> anyhow::Result<()>;
    async fn add_remote_candidate(&self, candidate: &str) -> anyhow::Result<()>;

    /// Sends a single chunk, which must not exceed the transport's message size limit
    async fn send(&self, chunk: &[u8]) -> anyhow::Result<()>;

    async fn close(&self);
}

pub trait SessionFactory: Send + Sync + 'static {
    fn create_session(&self, local_id: &PeerId, remote_id: &PeerId) -> anyhow::Result<(Arc<dyn RtcSession>, mpsc::UnboundedReceiver<SessionEvent>)>;
}
