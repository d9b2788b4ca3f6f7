use std::time::Duration;

use anyhow::bail;

use crate::link::envelope::MULTIPART_HEADER_LEN;

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// The maximum size of a single chunk handed to the underlying session. Envelopes that
    ///  do not fit are split into several chunks of at most this size.
    ///
    /// This must not exceed what the underlying channel accepts in a single message - data
    ///  channels typically guarantee 16 KiB across implementations, and that is the default.
    pub fragment_size: usize,

    /// Upper bound for a (reassembled) envelope. A peer declaring a bigger multipart
    ///  envelope is considered broken or malicious, and the link to it is dropped.
    pub max_envelope_size: usize,

    /// A multipart envelope that is not complete after this time causes the link to be
    ///  disconnected: the byte stream can not be re-synchronized after a partial envelope
    pub reassembly_timeout: Duration,

    pub connect_timeout: Duration,
    pub join_timeout: Duration,
}

impl OverlayConfig {
    pub fn new() -> OverlayConfig {
        OverlayConfig {
            fragment_size: 16 * 1024,
            max_envelope_size: 16 * 1024 * 1024,
            reassembly_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fragment_size <= MULTIPART_HEADER_LEN {
            bail!("fragment size {} is too small: it must exceed the multipart header of {} bytes", self.fragment_size, MULTIPART_HEADER_LEN);
        }
        if self.max_envelope_size > u32::MAX as usize {
            bail!("maximum envelope size {} does not fit the 32 bit length field", self.max_envelope_size);
        }
        if self.max_envelope_size < self.fragment_size {
            bail!("maximum envelope size {} is smaller than the fragment size {}", self.max_envelope_size, self.fragment_size);
        }
        if self.reassembly_timeout.is_zero() {
            bail!("reassembly timeout must be positive");
        }
        Ok(())
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig::new()
    }
}
