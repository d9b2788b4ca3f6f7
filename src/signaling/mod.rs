//! Out-of-band exchange of connection negotiation payloads. The side channel carrying them
//!  is an external collaborator ([SignalingChannel]) that may deliver out of order; the
//!  [sequencer::SignalSequencer] restores the sender's order.

pub mod signal_messages;
pub mod sequencer;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::ids::PeerId;
use crate::signaling::signal_messages::SignalEnvelope;

/// The outbound half of the signaling side channel. Delivery may be unordered; inbound
///  signals are fed into [crate::pool::peer_pool::PeerPool::on_signal] by whoever receives
///  them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SignalingChannel: Send + Sync + 'static {
    async fn send_signal(&self, to: &PeerId, envelope: SignalEnvelope) -> anyhow::Result<()>;
}
