use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::ids::{ChannelId, RequestId};
use crate::util::buf::{BufExt, BufMutExt};

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum RouterMessageKind {
    Notification = 1,
    Request = 2,
    Response = 3,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RouterMessage {
    Notification {
        channel_id: ChannelId,
        body: Bytes,
    },
    Request {
        channel_id: ChannelId,
        request_id: RequestId,
        body: Bytes,
    },
    Response {
        request_id: RequestId,
        ok: bool,
        body: Bytes,
    },
}

impl RouterMessage {
    fn kind(&self) -> RouterMessageKind {
        match self {
            RouterMessage::Notification { .. } => RouterMessageKind::Notification,
            RouterMessage::Request { .. } => RouterMessageKind::Request,
            RouterMessage::Response { .. } => RouterMessageKind::Response,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind().into());
        match self {
            RouterMessage::Notification { channel_id, body } => {
                channel_id.ser(buf);
                buf.put_len_prefixed(body);
            }
            RouterMessage::Request { channel_id, request_id, body } => {
                channel_id.ser(buf);
                buf.put_u64(request_id.0);
                buf.put_len_prefixed(body);
            }
            RouterMessage::Response { request_id, ok, body } => {
                buf.put_u64(request_id.0);
                buf.put_u8(if *ok { 1 } else { 0 });
                buf.put_len_prefixed(body);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<RouterMessage> {
        let kind = buf.get_u8_checked()?;
        let kind = RouterMessageKind::try_from(kind)
            .map_err(|_| anyhow!("invalid router message discriminator {}", kind))?;

        let message = match kind {
            RouterMessageKind::Notification => RouterMessage::Notification {
                channel_id: ChannelId::try_deser(&mut buf)?,
                body: buf.try_get_len_prefixed()?,
            },
            RouterMessageKind::Request => RouterMessage::Request {
                channel_id: ChannelId::try_deser(&mut buf)?,
                request_id: RequestId(buf.get_u64_checked()?),
                body: buf.try_get_len_prefixed()?,
            },
            RouterMessageKind::Response => RouterMessage::Response {
                request_id: RequestId(buf.get_u64_checked()?),
                ok: buf.get_u8_checked()? != 0,
                body: buf.try_get_len_prefixed()?,
            },
        };

        if buf.has_remaining() {
            return Err(anyhow!("{} trailing bytes after router message", buf.remaining()));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::notification(RouterMessage::Notification { channel_id: ChannelId::new("c"), body: Bytes::from_static(b"xy") },
        vec![1, 0,0,0,1, b'c', 0,0,0,2, b'x', b'y'])]
    #[case::request(RouterMessage::Request { channel_id: ChannelId::new("c"), request_id: RequestId(258), body: Bytes::new() },
        vec![2, 0,0,0,1, b'c', 0,0,0,0,0,0,1,2, 0,0,0,0])]
    #[case::response_ok(RouterMessage::Response { request_id: RequestId(3), ok: true, body: Bytes::from_static(b"r") },
        vec![3, 0,0,0,0,0,0,0,3, 1, 0,0,0,1, b'r'])]
    #[case::response_failed(RouterMessage::Response { request_id: RequestId(3), ok: false, body: Bytes::new() },
        vec![3, 0,0,0,0,0,0,0,3, 0, 0,0,0,0])]
    fn test_ser(#[case] message: RouterMessage, #[case] expected: Vec<u8>) {
        let buf = message.to_bytes();
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(RouterMessage::deser(buf).unwrap(), message);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::bad_kind(vec![0])]
    #[case::truncated_id(vec![3, 0,0,0])]
    #[case::truncated_body(vec![1, 0,0,0,1, b'c', 0,0,0,5, b'x'])]
    #[case::trailing(vec![3, 0,0,0,0,0,0,0,3, 0, 0,0,0,0, 9])]
    fn test_deser_invalid(#[case] buf: Vec<u8>) {
        assert!(RouterMessage::deser(Bytes::from(buf)).is_err());
    }
}
