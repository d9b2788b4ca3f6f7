use thiserror::Error;

use crate::ids::{NetworkId, PeerId, RequestId};

/// Errors surfaced to callers of the public API. Transient conditions (stale signals,
///  relays to members that just left, late completions of timed-out operations) are never
///  reported through this type - they are absorbed and logged.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum NetError {
    #[error("no connection to peer {0}")]
    NoConnection(PeerId),

    #[error("peer pool is disconnected")]
    PoolDisconnected,

    #[error("link to peer {0} is not connected")]
    LinkNotConnected(PeerId),

    #[error("connection to peer {0} was lost")]
    ConnectionLost(PeerId),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("network {0} is not joined")]
    NotJoined(NetworkId),

    #[error("network {0}: the hub does not connect to another hub")]
    HubCannotConnect(NetworkId),

    #[error("network {0} was already connected")]
    AlreadyConnected(NetworkId),

    #[error("no pending request #{request_id} from {requester_id} - was it answered already?")]
    DuplicateResponse {
        requester_id: PeerId,
        request_id: RequestId,
    },

    #[error("router was disposed")]
    RouterDisposed,

    #[error("envelope of {len} bytes exceeds the maximum of {max} bytes")]
    EnvelopeTooLarge {
        len: usize,
        max: usize,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<anyhow::Error> for NetError {
    fn from(e: anyhow::Error) -> Self {
        NetError::Transport(e.to_string())
    }
}

pub type NetResult<T> = Result<T, NetError>;
