//! The record for one bridged call session.

use crate::events::IceCandidate;
use log::debug;
use rand::Rng;
use tokio::task::JoinHandle;

const LOG: &str = "Calls/Session";

/// Where a call sits in its bridged lifecycle. Termination is absorbing and
/// is realized as removal from the store, so it has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    /// Invite or candidates seen; the offer has not gone out yet.
    #[default]
    Gathering,
    /// The de-trickled offer was sent to the media server.
    Offered,
    /// The media server's answer was relayed back to the caller.
    Active,
}

/// One bridged call, correlating the caller's call id, the bridge-assigned
/// media-server call id, and the room the call lives in.
#[derive(Debug)]
pub struct Call {
    /// Call id assigned by the messaging-network caller.
    pub local_call_id: String,
    /// Call id this bridge assigned for the media-server leg.
    pub remote_call_id: String,
    pub room_id: String,
    /// The bridge-side virtual identity representing the callee.
    pub peer_identity: String,
    /// Destination number/address, recovered from the identity localpart.
    pub target_address: String,
    /// The messaging-network user who placed the call.
    pub caller: String,
    /// The offer, progressively rewritten until it is sent.
    pub offer_sdp: String,
    /// Candidates not yet folded into the offer.
    pub pending_candidates: Vec<IceCandidate>,
    /// Answer SDP from the media server, once known.
    pub answer_sdp: Option<String>,
    /// Per-call secret; generated but not otherwise enforced yet.
    pub pin_code: String,
    pub state: CallState,
    /// Armed while the call waits on more candidates before forcing the
    /// offer out.
    pub timer: Option<JoinHandle<()>>,
}

impl Call {
    pub fn new(
        local_call_id: String,
        remote_call_id: String,
        room_id: String,
        peer_identity: String,
        target_address: String,
        caller: String,
        offer_sdp: String,
        pending_candidates: Vec<IceCandidate>,
    ) -> Self {
        Self {
            local_call_id,
            remote_call_id,
            room_id,
            peer_identity,
            target_address,
            caller,
            offer_sdp,
            pending_candidates,
            answer_sdp: None,
            pin_code: generate_pin(),
            state: CallState::default(),
            timer: None,
        }
    }

    /// Whether the offer already went out. Guards the at-most-once invite.
    pub fn invite_sent(&self) -> bool {
        matches!(self.state, CallState::Offered | CallState::Active)
    }

    pub fn mark_invite_sent(&mut self) {
        self.state = CallState::Offered;
    }

    pub fn mark_active(&mut self) {
        self.state = CallState::Active;
    }

    /// Disarms the readiness timer if one is armed. Callers hold the call
    /// lock here, which is what keeps the abort race-free: the timer task
    /// re-validates its handle slot under the same lock before acting.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            debug!(target: LOG, "Cancelled readiness timer for call {}", self.local_call_id);
            timer.abort();
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Random 4-digit pin for the media-server dialog.
fn generate_pin() -> String {
    format!("{:04}", rand::rng().random_range(0..10000))
}
