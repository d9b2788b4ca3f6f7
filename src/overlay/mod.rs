//! Star-shaped overlay networks: one hub per network id relays between spokes and keeps the
//!  membership consistent.

pub mod star_messages;
pub mod star_network;
