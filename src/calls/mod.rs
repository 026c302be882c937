//! Call sessions and the de-trickling algorithm.
//!
//! One bridged call correlates three identifier spaces: the call id the
//! messaging-network caller assigned, the call id this bridge assigned for
//! the media-server leg, and the room the call lives in.
//!
//! # Architecture
//!
//! - [`Call`] & [`CallState`]: One call session and its lifecycle
//! - [`CallStore`]: Three-key in-memory index over active calls
//! - [`sdp`]: Candidate aggregation and offer rewriting

mod call;
mod store;

pub mod sdp;

pub use call::{Call, CallState};
pub use store::{CallStore, SharedCall};
