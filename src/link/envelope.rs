//! Framing of envelopes over a transport that limits the size of a single message.
//!
//! ```ascii
//! single part:  [0u8][payload]
//! multipart:    [1u8][total envelope length: u32 BE][payload]
//! ```
//!
//! The total length of a multipart envelope counts the header, i.e. it is `5 + payload.len()`.
//!  The serialized envelope is sliced into chunks of at most `fragment_size` bytes; only the
//!  first chunk carries the header.

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::trace;

use crate::error::{NetError, NetResult};

pub const FLAG_MULTIPART: u8 = 1;
pub const MULTIPART_HEADER_LEN: usize = 5;

pub fn encode_envelope(payload: &[u8], fragment_size: usize, max_envelope_size: usize) -> NetResult<Vec<Bytes>> {
    if fragment_size <= MULTIPART_HEADER_LEN {
        return Err(NetError::Transport(format!("fragment size {} must exceed the multipart header of {} bytes", fragment_size, MULTIPART_HEADER_LEN)));
    }

    let multipart = 1 + payload.len() > fragment_size;
    let envelope_len = if multipart {
        MULTIPART_HEADER_LEN + payload.len()
    }
    else {
        1 + payload.len()
    };

    if envelope_len > max_envelope_size {
        return Err(NetError::EnvelopeTooLarge { len: envelope_len, max: max_envelope_size });
    }

    let mut buf = BytesMut::with_capacity(envelope_len);
    if multipart {
        buf.put_u8(FLAG_MULTIPART);
        buf.put_u32(envelope_len as u32);
    }
    else {
        buf.put_u8(0);
    }
    buf.put_slice(payload);

    let buf = buf.freeze();
    let chunks = (0..envelope_len)
        .step_by(fragment_size)
        .map(|offs| buf.slice(offs..(offs + fragment_size).min(envelope_len)))
        .collect::<Vec<_>>();

    trace!("encoded {} bytes payload into {} chunk(s)", payload.len(), chunks.len());
    Ok(chunks)
}

struct Partial {
    buf: BytesMut,
    envelope_len: usize,
    started: Instant,
}

/// Receiving side of the framing: turns a stream of chunks back into payloads.
///
/// All errors are protocol violations after which the chunk stream can not be interpreted
///  any more, so the caller is expected to drop the connection.
pub struct Reassembler {
    max_envelope_size: usize,
    partial: Option<Partial>,
}

impl Reassembler {
    pub fn new(max_envelope_size: usize) -> Reassembler {
        Reassembler {
            max_envelope_size,
            partial: None,
        }
    }

    /// Returns the payload if this chunk completed an envelope.
    pub fn on_chunk(&mut self, chunk: &[u8], now: Instant) -> anyhow::Result<Option<Bytes>> {
        if let Some(partial) = &mut self.partial {
            if partial.buf.len() + chunk.len() > partial.envelope_len {
                bail!("chunk of {} bytes overflows multipart envelope ({} of {} bytes received)", chunk.len(), partial.buf.len(), partial.envelope_len);
            }
            partial.buf.put_slice(chunk);
            return Ok(self.take_if_complete());
        }

        if chunk.is_empty() {
            bail!("empty chunk");
        }

        if chunk[0] & FLAG_MULTIPART == 0 {
            return Ok(Some(Bytes::copy_from_slice(&chunk[1..])));
        }

        if chunk.len() < MULTIPART_HEADER_LEN {
            bail!("first chunk of multipart envelope is shorter than the header: {} bytes", chunk.len());
        }
        let envelope_len = u32::from_be_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]) as usize;
        if envelope_len < MULTIPART_HEADER_LEN {
            bail!("declared multipart envelope length {} is shorter than the header", envelope_len);
        }
        if envelope_len > self.max_envelope_size {
            bail!("declared multipart envelope length {} exceeds the maximum of {}", envelope_len, self.max_envelope_size);
        }
        if chunk.len() > envelope_len {
            bail!("first chunk of {} bytes exceeds declared envelope length {}", chunk.len(), envelope_len);
        }

        let mut buf = BytesMut::with_capacity(envelope_len);
        buf.put_slice(chunk);
        self.partial = Some(Partial {
            buf,
            envelope_len,
            started: now,
        });
        Ok(self.take_if_complete())
    }

    fn take_if_complete(&mut self) -> Option<Bytes> {
        match &self.partial {
            Some(p) if p.buf.len() == p.envelope_len => {}
            _ => return None,
        }

        self.partial.take()
            .map(|p| p.buf.freeze().slice(MULTIPART_HEADER_LEN..))
    }

    /// The point in time at which a partially received envelope is given up, if there is one
    pub fn deadline(&self, timeout: std::time::Duration) -> Option<Instant> {
        self.partial.as_ref()
            .map(|p| p.started + timeout)
    }

    pub fn is_idle(&self) -> bool {
        self.partial.is_none()
    }
}
