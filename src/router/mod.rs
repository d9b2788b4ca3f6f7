//! Application-level channels on top of an overlay network: fire-and-forget notifications and
//!  request / response exchanges, each identified by a [crate::ids::ChannelId].

pub mod router;
pub mod router_messages;
