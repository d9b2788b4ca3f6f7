use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::ids::{NetworkId, PeerId};
use crate::util::buf::{BufExt, BufMutExt};

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum StarMessageKind {
    Connection = 1,
    ConnectionAck = 2,
    Disconnection = 3,
    Unicast = 4,
    Broadcast = 5,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StarMessage {
    /// a spoke joins; relayed by the hub to announce the new member
    Connection {
        sender_id: PeerId,
    },
    /// the hub's reply to a joining spoke, with the members before the join
    ConnectionAck {
        sender_id: PeerId,
        member_ids: Vec<PeerId>,
    },
    Disconnection {
        sender_id: PeerId,
        /// set by the hub when it announces a spoke whose link was lost
        connection_lost: bool,
    },
    Unicast {
        sender_id: PeerId,
        recipient_id: PeerId,
        body: Bytes,
    },
    Broadcast {
        sender_id: PeerId,
        body: Bytes,
    },
}

impl StarMessage {
    fn kind(&self) -> StarMessageKind {
        match self {
            StarMessage::Connection { .. } => StarMessageKind::Connection,
            StarMessage::ConnectionAck { .. } => StarMessageKind::ConnectionAck,
            StarMessage::Disconnection { .. } => StarMessageKind::Disconnection,
            StarMessage::Unicast { .. } => StarMessageKind::Unicast,
            StarMessage::Broadcast { .. } => StarMessageKind::Broadcast,
        }
    }

    pub fn sender_id(&self) -> &PeerId {
        match self {
            StarMessage::Connection { sender_id } => sender_id,
            StarMessage::ConnectionAck { sender_id, .. } => sender_id,
            StarMessage::Disconnection { sender_id, .. } => sender_id,
            StarMessage::Unicast { sender_id, .. } => sender_id,
            StarMessage::Broadcast { sender_id, .. } => sender_id,
        }
    }
}

/// A [StarMessage] tagged with the network it belongs to, so several overlay networks can
///  share a peer pool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StarEnvelope {
    pub network_id: NetworkId,
    pub message: StarMessage,
}

impl StarEnvelope {
    pub fn new(network_id: NetworkId, message: StarMessage) -> StarEnvelope {
        StarEnvelope {
            network_id,
            message,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.network_id.ser(buf);
        buf.put_u8(self.message.kind().into());

        match &self.message {
            StarMessage::Connection { sender_id } => {
                sender_id.ser(buf);
            }
            StarMessage::ConnectionAck { sender_id, member_ids } => {
                sender_id.ser(buf);
                buf.put_u32(member_ids.len() as u32);
                for member_id in member_ids {
                    member_id.ser(buf);
                }
            }
            StarMessage::Disconnection { sender_id, connection_lost } => {
                sender_id.ser(buf);
                buf.put_u8(if *connection_lost { 1 } else { 0 });
            }
            StarMessage::Unicast { sender_id, recipient_id, body } => {
                sender_id.ser(buf);
                recipient_id.ser(buf);
                buf.put_len_prefixed(body);
            }
            StarMessage::Broadcast { sender_id, body } => {
                sender_id.ser(buf);
                buf.put_len_prefixed(body);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Bodies are sliced out of the buffer without copying
    pub fn deser(mut buf: Bytes) -> anyhow::Result<StarEnvelope> {
        let network_id = NetworkId::try_deser(&mut buf)?;
        let kind = buf.get_u8_checked()?;
        let kind = StarMessageKind::try_from(kind)
            .map_err(|_| anyhow!("invalid star message discriminator {}", kind))?;

        let message = match kind {
            StarMessageKind::Connection => StarMessage::Connection {
                sender_id: PeerId::try_deser(&mut buf)?,
            },
            StarMessageKind::ConnectionAck => {
                let sender_id = PeerId::try_deser(&mut buf)?;
                let num_members = buf.get_u32_checked()? as usize;
                let mut member_ids = Vec::with_capacity(num_members.min(buf.remaining()));
                for _ in 0..num_members {
                    member_ids.push(PeerId::try_deser(&mut buf)?);
                }
                StarMessage::ConnectionAck { sender_id, member_ids }
            }
            StarMessageKind::Disconnection => StarMessage::Disconnection {
                sender_id: PeerId::try_deser(&mut buf)?,
                connection_lost: buf.get_u8_checked()? != 0,
            },
            StarMessageKind::Unicast => StarMessage::Unicast {
                sender_id: PeerId::try_deser(&mut buf)?,
                recipient_id: PeerId::try_deser(&mut buf)?,
                body: buf.try_get_len_prefixed()?,
            },
            StarMessageKind::Broadcast => StarMessage::Broadcast {
                sender_id: PeerId::try_deser(&mut buf)?,
                body: buf.try_get_len_prefixed()?,
            },
        };

        if buf.has_remaining() {
            return Err(anyhow!("{} trailing bytes after star message", buf.remaining()));
        }

        Ok(StarEnvelope {
            network_id,
            message,
        })
    }
}
