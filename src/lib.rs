//! Bridges voice calls from a federated messaging network onto a verto
//! media server: events come in from the messaging side, calls terminate on
//! the PBX side, and neither needs to know about the other's protocol.

pub mod bridge;
pub mod calls;
pub mod config;
pub mod events;
pub mod messaging;
pub mod verto;
