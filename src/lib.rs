//! Networking core for real-time collaborative editing: peer links negotiated over an
//!  unordered signaling side channel, a star-shaped overlay network with consistent
//!  membership on top of them, and a channel-multiplexed notify / request router on top of
//!  that.
//!
//! Layering, leaves first:
//! * [signaling] orders negotiation messages for one peer pair
//! * [link] is a single negotiated, fragmenting, ordered byte-message channel
//! * [pool] owns all links of the local peer
//! * [overlay] is a hub-and-spoke membership / relay layer, several per pool
//! * [router] multiplexes notification and request channels over one overlay network

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod link;
pub mod overlay;
pub mod pool;
pub mod router;
pub mod signaling;
pub mod test_util;
pub mod util;
