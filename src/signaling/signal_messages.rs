use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::ids::PeerId;
use crate::util::buf::{BufExt, BufMutExt};

/// Negotiation payloads. Their content (session descriptions, candidates) is opaque here and
///  only interpreted by the [crate::link::session::RtcSession].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Signal {
    Offer(String),
    Answer(String),
    Candidate(String),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum SignalKind {
    Offer = 1,
    Answer = 2,
    Candidate = 3,
}

impl Signal {
    fn kind(&self) -> SignalKind {
        match self {
            Signal::Offer(_) => SignalKind::Offer,
            Signal::Answer(_) => SignalKind::Answer,
            Signal::Candidate(_) => SignalKind::Candidate,
        }
    }

    fn payload(&self) -> &str {
        match self {
            Signal::Offer(s) | Signal::Answer(s) | Signal::Candidate(s) => s,
        }
    }
}

/// A signal as it travels over the side channel.
///
/// The `epoch` identifies the sending link instance: every negotiation attempt uses a new,
///  larger epoch, so signals belonging to an earlier session between the same two peer ids
///  can be recognized and dropped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignalEnvelope {
    pub sender_id: PeerId,
    pub epoch: u64,
    pub sequence_number: u64,
    pub signal: Signal,
}

impl SignalEnvelope {
    pub fn ser(&self, buf: &mut BytesMut) {
        self.sender_id.ser(buf);
        buf.put_u64(self.epoch);
        buf.put_u64(self.sequence_number);
        buf.put_u8(self.signal.kind().into());
        buf.put_string(self.signal.payload());
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<SignalEnvelope> {
        let sender_id = PeerId::try_deser(&mut buf)?;
        let epoch = buf.get_u64_checked()?;
        let sequence_number = buf.get_u64_checked()?;
        let kind = buf.get_u8_checked()?;
        let kind = SignalKind::try_from(kind)
            .map_err(|_| anyhow!("invalid signal discriminator {}", kind))?;
        let payload = buf.try_get_string()?;

        if buf.has_remaining() {
            return Err(anyhow!("{} trailing bytes after signal", buf.remaining()));
        }

        let signal = match kind {
            SignalKind::Offer => Signal::Offer(payload),
            SignalKind::Answer => Signal::Answer(payload),
            SignalKind::Candidate => Signal::Candidate(payload),
        };

        Ok(SignalEnvelope {
            sender_id,
            epoch,
            sequence_number,
            signal,
        })
    }
}
