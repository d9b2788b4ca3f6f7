//! This module contains utilities that are useful for testing code based on peer pools,
//!  overlay networks and routers. They are used for testing this crate itself, but they are
//!  also exported for application testing: an application can run a complete in-memory
//!  mesh without any real transport or signaling server.
//!
//! Keeping them in the crate's regular (non-#[cfg(test)]) code is the price for making them
//!  available to other crates.

pub mod fixture;
pub mod memory_signaling;
pub mod memory_transport;
