use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::ids::PeerId;
use crate::signaling::signal_messages::{Signal, SignalEnvelope};
use crate::signaling::SignalingChannel;

/// Restores sender order for the signals exchanged between one local link and its remote
///  counterpart.
///
/// Outgoing signals are numbered consecutively starting at 0. Incoming signals are buffered
///  until every signal with a lower sequence number has arrived, and then returned as a run.
///  The caller is responsible for handling the returned run before feeding in the next
///  envelope - the owning link does this while holding its negotiation lock.
pub struct SignalSequencer {
    local_id: PeerId,
    remote_id: PeerId,
    local_epoch: u64,
    /// bound to the first epoch seen from the remote side
    remote_epoch: Option<u64>,
    channel: Arc<dyn SignalingChannel>,

    next_outgoing: u64,
    next_incoming: u64,
    pending: BTreeMap<u64, Signal>,
}

impl SignalSequencer {
    pub fn new(local_id: PeerId, remote_id: PeerId, local_epoch: u64, channel: Arc<dyn SignalingChannel>) -> SignalSequencer {
        SignalSequencer {
            local_id,
            remote_id,
            local_epoch,
            remote_epoch: None,
            channel,
            next_outgoing: 0,
            next_incoming: 0,
            pending: BTreeMap::default(),
        }
    }

    pub fn remote_epoch(&self) -> Option<u64> {
        self.remote_epoch
    }

    pub async fn send(&mut self, signal: Signal) -> anyhow::Result<()> {
        let envelope = SignalEnvelope {
            sender_id: self.local_id.clone(),
            epoch: self.local_epoch,
            sequence_number: self.next_outgoing,
            signal,
        };
        self.next_outgoing += 1;

        trace!("sending signal #{} to {:?}", envelope.sequence_number, self.remote_id);
        self.channel.send_signal(&self.remote_id, envelope).await
    }

    /// Returns the signals that became deliverable through this envelope, in sender order.
    ///  This is empty if the envelope fills no gap, is a duplicate, or belongs to a different
    ///  remote epoch.
    pub fn receive(&mut self, envelope: SignalEnvelope) -> Vec<Signal> {
        match self.remote_epoch {
            None => self.remote_epoch = Some(envelope.epoch),
            Some(epoch) if epoch != envelope.epoch => {
                debug!("dropping signal from {:?} for epoch {}, bound to epoch {}", envelope.sender_id, envelope.epoch, epoch);
                return Vec::new();
            }
            Some(_) => {}
        }

        if envelope.sequence_number < self.next_incoming {
            debug!("dropping duplicate signal #{} from {:?}", envelope.sequence_number, envelope.sender_id);
            return Vec::new();
        }

        match self.pending.entry(envelope.sequence_number) {
            Entry::Occupied(_) => {
                debug!("dropping duplicate signal #{} from {:?}", envelope.sequence_number, envelope.sender_id);
                return Vec::new();
            }
            Entry::Vacant(e) => {
                e.insert(envelope.signal);
            }
        }

        let mut result = Vec::new();
        while let Some(signal) = self.pending.remove(&self.next_incoming) {
            result.push(signal);
            self.next_incoming += 1;
        }
        if !self.pending.is_empty() {
            trace!("{} signals from {:?} waiting for #{}", self.pending.len(), self.remote_id, self.next_incoming);
        }
        result
    }
}
