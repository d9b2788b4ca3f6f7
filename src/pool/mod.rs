//! All peer links of the local peer, with one pool-wide stream of received messages and
//!  disconnect notifications.
//!
//! Links are tagged with an *epoch* that strictly increases per process (it is derived from
//!  the wall clock). Signals carry the sending link's epoch, which lets the receiving pool
//!  tell a renegotiation by a restarted or reconnecting peer apart from late signals that
//!  belong to a link that was torn down already.

pub mod peer_pool;
