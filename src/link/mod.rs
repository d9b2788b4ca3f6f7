pub mod envelope;
pub mod peer_link;
pub mod session;
