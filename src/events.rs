use serde::Deserialize;

/// One trickled ICE candidate as delivered by the calling side.
///
/// The media section it belongs to is identified either by the numeric
/// `sdpMLineIndex` or by the symbolic `sdpMid`; senders are not required to
/// provide both.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u32>,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
}

/// Room membership states the bridge reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Invite,
    Join,
    Leave,
    Ban,
}

/// A normalized event from the messaging-network side of the bridge.
///
/// The application-service transport is expected to parse its own wire
/// format into this union before handing events over; payloads missing a
/// required field are rejected at that boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// A membership change for some user in a room. Only changes targeting
    /// one of the bridge's own virtual identities are acted on.
    Membership {
        room_id: String,
        /// Localpart of the member whose membership changed.
        target: String,
        membership: Membership,
    },
    /// A new call offer from a user in a bridged room.
    CallInvite {
        room_id: String,
        /// The user placing the call.
        caller: String,
        call_id: String,
        offer_sdp: String,
    },
    /// Trickled candidates for an in-progress call.
    CallCandidates {
        room_id: String,
        call_id: String,
        candidates: Vec<IceCandidate>,
    },
    /// The calling side gave up or ended the call.
    CallHangup { room_id: String, call_id: String },
}

/// What handling one inbound event amounted to. Reported back to the
/// event feed as that request's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Joined a room on behalf of an invited bridge identity.
    Joined,
    /// A call was torn down and removed from the store.
    CallEnded,
    /// A membership change or hangup that had no active call to act on.
    NoCall,
    /// The event did not concern the bridge.
    Ignored,
    /// Not enough candidates yet; the offer was not sent.
    Waiting { timer_armed: bool },
    /// The de-trickled offer went out to the media server.
    InviteSent,
    /// The offer had already been sent; nothing was re-sent.
    AlreadySent,
    /// Candidates arrived before their call; stashed for the invite.
    Buffered,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_accepts_either_section_key() {
        let by_index: IceCandidate = serde_json::from_str(
            r#"{"candidate": "candidate:0 1 UDP 2122252543 10.0.0.1 5000 typ host", "sdpMLineIndex": 0}"#,
        )
        .unwrap();
        assert_eq!(by_index.sdp_m_line_index, Some(0));
        assert_eq!(by_index.sdp_mid, None);

        let by_mid: IceCandidate = serde_json::from_str(
            r#"{"candidate": "candidate:0 1 UDP 2122252543 10.0.0.1 5000 typ host", "sdpMid": "audio"}"#,
        )
        .unwrap();
        assert_eq!(by_mid.sdp_mid.as_deref(), Some("audio"));
    }

    #[test]
    fn test_event_with_missing_field_is_rejected() {
        let result: Result<InboundEvent, _> = serde_json::from_str(
            r#"{"type": "call_invite", "room_id": "!r:example.org", "caller": "@a:example.org"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_membership_event_parses() {
        let event: InboundEvent = serde_json::from_str(
            r#"{"type": "membership", "room_id": "!r:example.org", "target": "voip_5551234", "membership": "invite"}"#,
        )
        .unwrap();
        match event {
            InboundEvent::Membership {
                target, membership, ..
            } => {
                assert_eq!(target, "voip_5551234");
                assert_eq!(membership, Membership::Invite);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
