//! The session bridge: one state machine translating between the messaging
//! network's call events and the media server's dialect.
//!
//! Events from either side are handled in arrival order. Everything a call
//! touches is serialized through its own lock, so a readiness timer, a
//! candidate event, and a media-server notification can never interleave
//! on the same call.

use crate::calls::{Call, CallStore, SharedCall, sdp};
use crate::config::BridgeConfig;
use crate::events::{EventOutcome, IceCandidate, InboundEvent, Membership};
use crate::messaging::{MessagingApi, MessagingError, RoomDirectory};
use crate::verto::{self, IncomingRequest, TransportError, VertoTransport};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde_json::{Value, json};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

const LOG: &str = "Bridge/Events";
const MEDIA_LOG: &str = "Bridge/Media";

/// How long an offer may wait on further candidates before it is forced out.
const CANDIDATE_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Debug, Error)]
pub enum EventError {
    #[error("call event received in unknown room {0}")]
    UnknownRoom(String),
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Owns the call store and drives every call through its lifecycle. One
/// instance per process, constructed at startup and threaded through; there
/// are no ambient globals.
pub struct CallBridge {
    config: BridgeConfig,
    calls: CallStore,
    /// Candidates that arrived before their call invite, keyed by the
    /// caller's call id. Drained when the invite materializes the call.
    premature: DashMap<String, Vec<IceCandidate>>,
    verto: Arc<dyn VertoTransport>,
    messaging: Arc<dyn MessagingApi>,
    directory: Arc<dyn RoomDirectory>,
    /// Handle to ourselves for the readiness timers we spawn.
    weak_self: Weak<CallBridge>,
}

impl CallBridge {
    pub fn new(
        config: BridgeConfig,
        verto: Arc<dyn VertoTransport>,
        messaging: Arc<dyn MessagingApi>,
        directory: Arc<dyn RoomDirectory>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            calls: CallStore::new(),
            premature: DashMap::new(),
            verto,
            messaging,
            directory,
            weak_self: weak_self.clone(),
        })
    }

    /// Entry point for the messaging-network event feed. The returned value
    /// is the outcome the feed reports for this event; an error fails only
    /// this event, never the bridge.
    pub async fn handle_event(&self, event: InboundEvent) -> Result<EventOutcome, EventError> {
        match event {
            InboundEvent::Membership {
                room_id,
                target,
                membership,
            } => self.handle_membership(room_id, target, membership).await,
            InboundEvent::CallInvite {
                room_id,
                caller,
                call_id,
                offer_sdp,
            } => self.handle_invite(room_id, caller, call_id, offer_sdp).await,
            InboundEvent::CallCandidates {
                room_id,
                call_id,
                candidates,
            } => self.handle_candidates(room_id, call_id, candidates).await,
            InboundEvent::CallHangup { room_id, call_id } => {
                self.handle_hangup(room_id, call_id).await
            }
        }
    }

    /// Consumes media-server requests in arrival order until the endpoint's
    /// channel closes.
    pub async fn run(self: Arc<Self>, mut requests: mpsc::Receiver<IncomingRequest>) {
        info!(target: MEDIA_LOG, "Media-server request loop started");
        while let Some(request) = requests.recv().await {
            self.handle_verto_request(request).await;
        }
        info!(target: MEDIA_LOG, "Media-server request loop stopped");
    }

    async fn handle_membership(
        &self,
        room_id: String,
        target: String,
        membership: Membership,
    ) -> Result<EventOutcome, EventError> {
        if !self.config.is_bridge_identity(&target) {
            debug!(target: LOG, "Ignoring membership change for {target} in {room_id}");
            return Ok(EventOutcome::Ignored);
        }
        info!(target: LOG, "Member update: room={room_id} member={target} -> {membership:?}");
        match membership {
            Membership::Invite => {
                self.messaging.join_room(&target, &room_id).await?;
                self.directory.associate(&room_id, &target).await;
                Ok(EventOutcome::Joined)
            }
            Membership::Leave | Membership::Ban => match self.calls.by_room_id(&room_id).await {
                Some(shared) => {
                    let mut call = shared.lock().await;
                    self.end_call(&mut call, "room membership ended").await;
                    Ok(EventOutcome::CallEnded)
                }
                None => {
                    debug!(target: LOG, "No call to tear down in {room_id}");
                    Ok(EventOutcome::NoCall)
                }
            },
            Membership::Join => Ok(EventOutcome::Ignored),
        }
    }

    async fn handle_invite(
        &self,
        room_id: String,
        caller: String,
        call_id: String,
        offer_sdp: String,
    ) -> Result<EventOutcome, EventError> {
        info!(target: LOG, "Call invite: room={room_id} member={caller} id={call_id}");
        let identity = match self.directory.identity_for(&room_id).await {
            Some(identity) => identity,
            None => {
                error!(target: LOG, "Got call in unknown room {room_id}");
                return Err(EventError::UnknownRoom(room_id));
            }
        };
        let number = self.config.target_address(&identity).to_string();
        info!(target: LOG, "Initiating call on our end to {number}");

        // Candidate events may have raced the invite; fold anything stashed
        // under this call id into the new call.
        let buffered = self
            .premature
            .remove(&call_id)
            .map(|(_, candidates)| candidates)
            .unwrap_or_default();
        if !buffered.is_empty() {
            debug!(
                target: LOG,
                "Materializing {} buffered candidate(s) for call id={call_id}",
                buffered.len()
            );
        }

        let call = Call::new(
            call_id,
            verto::generate_token(),
            room_id,
            identity,
            number,
            caller,
            offer_sdp,
            buffered,
        );
        let shared = self.calls.insert(call).await;
        let mut call = shared.lock().await;
        self.attempt_invite(&mut call, false).await
    }

    async fn handle_candidates(
        &self,
        room_id: String,
        call_id: String,
        candidates: Vec<IceCandidate>,
    ) -> Result<EventOutcome, EventError> {
        info!(
            target: LOG,
            "Call candidates: room={room_id} id={call_id} count={}",
            candidates.len()
        );
        match self.calls.by_local_id(&call_id).await {
            None => {
                warn!(
                    target: LOG,
                    "Got candidates for unknown call id={call_id}; buffering in case the invite is behind them"
                );
                self.premature.entry(call_id).or_default().extend(candidates);
                Ok(EventOutcome::Buffered)
            }
            Some(shared) => {
                let mut call = shared.lock().await;
                call.pending_candidates.extend(candidates);
                self.attempt_invite(&mut call, false).await
            }
        }
    }

    async fn handle_hangup(
        &self,
        room_id: String,
        call_id: String,
    ) -> Result<EventOutcome, EventError> {
        info!(target: LOG, "Call hangup: room={room_id} id={call_id}");
        match self.calls.by_local_id(&call_id).await {
            None => {
                warn!(target: LOG, "Ignoring hangup for unknown call id={call_id}");
                self.premature.remove(&call_id);
                Ok(EventOutcome::NoCall)
            }
            Some(shared) => {
                let mut call = shared.lock().await;
                self.end_call(&mut call, "caller hung up").await;
                Ok(EventOutcome::CallEnded)
            }
        }
    }

    /// Sends the de-trickled offer if enough candidates have arrived (or the
    /// caller forces it), otherwise arms the readiness timer and waits.
    async fn attempt_invite(
        &self,
        call: &mut Call,
        force: bool,
    ) -> Result<EventOutcome, EventError> {
        let ready = sdp::enough_candidates(&call.offer_sdp, &call.pending_candidates);
        if ready {
            info!(target: LOG, "Gathered enough candidates for {}", call.local_call_id);
        }

        if !ready && !force {
            if call.timer.is_some() {
                return Ok(EventOutcome::Waiting { timer_armed: false });
            }
            let bridge = match self.weak_self.upgrade() {
                Some(bridge) => bridge,
                // Only possible mid-teardown; nothing left to arm for.
                None => return Ok(EventOutcome::Waiting { timer_armed: false }),
            };
            let local_call_id = call.local_call_id.clone();
            call.timer = Some(readiness_timer::spawn(bridge, local_call_id));
            info!(target: LOG, "Call {} is waiting for candidates...", call.local_call_id);
            return Ok(EventOutcome::Waiting { timer_armed: true });
        }

        call.cancel_timer();

        if call.invite_sent() {
            // e.g. the timer already forced the offer out and candidates
            // kept trickling in afterwards.
            return Ok(EventOutcome::AlreadySent);
        }

        call.offer_sdp = sdp::detrickle(&call.offer_sdp, &call.pending_candidates);
        call.mark_invite_sent();
        self.verto
            .send_request(
                "verto.invite",
                json!({
                    "sdp": call.offer_sdp,
                    "dialogParams": verto::dialog_params_for(&self.config.dialog_params, call),
                    "sessid": self.verto.session_id(),
                }),
            )
            .await?;
        Ok(EventOutcome::InviteSent)
    }

    /// Timer body: the readiness window elapsed with candidates still
    /// missing.
    async fn force_invite(&self, local_call_id: &str) {
        let Some(shared) = self.calls.by_local_id(local_call_id).await else {
            debug!(target: LOG, "Call {local_call_id} ended before its readiness timer fired");
            return;
        };
        let mut call = shared.lock().await;
        // Taking the handle slot doubles as the cancellation check, and
        // keeps attempt_invite from aborting the very task running it.
        if call.timer.take().is_none() {
            return;
        }
        info!(target: LOG, "Timed out. Forcing invite for {local_call_id}");
        if let Err(e) = self.attempt_invite(&mut call, true).await {
            error!(target: LOG, "Forced invite for {local_call_id} failed: {e}");
        }
    }

    async fn handle_verto_request(&self, request: IncomingRequest) {
        let Some(remote_call_id) = request
            .params
            .get("callID")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            error!(target: MEDIA_LOG, "Missing callID, unable to handle call event");
            return;
        };
        let Some(shared) = self.calls.by_remote_id(&remote_call_id).await else {
            error!(target: MEDIA_LOG, "No call with ID '{remote_call_id}' exists");
            return;
        };

        match request.method.as_str() {
            "verto.media" => self.handle_media(&shared, &request).await,
            "verto.answer" => self.handle_answer(&shared, &request).await,
            "verto.bye" => self.handle_remote_bye(&shared).await,
            other => warn!(target: MEDIA_LOG, "Unhandled method: {other}"),
        }
    }

    /// The answer SDP arrives here, possibly well before the answer
    /// notification proper. Data-only update.
    async fn handle_media(&self, shared: &SharedCall, request: &IncomingRequest) {
        let Some(answer_sdp) = request.params.get("sdp").and_then(Value::as_str) else {
            error!(target: MEDIA_LOG, "Unable to handle media, SDP data missing");
            let mut call = shared.lock().await;
            self.end_call(&mut call, "media without SDP").await;
            return;
        };
        shared.lock().await.answer_sdp = Some(answer_sdp.to_string());
    }

    async fn handle_answer(&self, shared: &SharedCall, request: &IncomingRequest) {
        let mut call = shared.lock().await;
        match self.directory.identity_for(&call.room_id).await {
            Some(identity) => {
                let answer_sdp = call.answer_sdp.clone().unwrap_or_default();
                match self
                    .messaging
                    .send_answer(&identity, &call.room_id, &call.local_call_id, &answer_sdp)
                    .await
                {
                    Ok(()) => {
                        call.mark_active();
                        info!(target: MEDIA_LOG, "Forwarded answer for call id={}", call.local_call_id);
                    }
                    Err(e) => error!(target: MEDIA_LOG, "Failed to relay answer: {e}"),
                }
            }
            None => error!(target: MEDIA_LOG, "Unknown room ID: {}", call.room_id),
        }
        // Acknowledge separately so the media server is not left hanging
        // when the relay fails.
        if let Some(id) = request.id.clone() {
            if let Err(e) = self
                .verto
                .send_response(json!({"method": "verto.answer"}), id)
                .await
            {
                error!(target: MEDIA_LOG, "Failed to acknowledge answer: {e}");
            }
        }
    }

    async fn handle_remote_bye(&self, shared: &SharedCall) {
        let mut call = shared.lock().await;
        if let Err(e) = self
            .messaging
            .send_hangup(&call.peer_identity, &call.room_id, &call.local_call_id)
            .await
        {
            error!(
                target: MEDIA_LOG,
                "Failed to relay hangup for call id={}: {e}", call.local_call_id
            );
        }
        self.destroy_call(&mut call).await;
    }

    /// Sends bye toward the media server and removes the call everywhere.
    /// The call is destroyed even when the bye cannot be delivered.
    async fn end_call(&self, call: &mut Call, reason: &str) {
        info!(target: LOG, "Ending call id={} ({reason})", call.local_call_id);
        if let Err(e) = self.send_bye(call).await {
            warn!(target: LOG, "Failed to send bye for call id={}: {e}", call.local_call_id);
        }
        self.destroy_call(call).await;
    }

    async fn send_bye(&self, call: &Call) -> Result<(), TransportError> {
        self.verto
            .send_request(
                "verto.bye",
                json!({
                    "dialogParams": verto::dialog_params_for(&self.config.dialog_params, call),
                    "sessid": self.verto.session_id(),
                }),
            )
            .await
            .map(|_| ())
    }

    async fn destroy_call(&self, call: &mut Call) {
        call.cancel_timer();
        self.calls.remove(call).await;
    }
}

/// Readiness-timer task, kept in its own module so the spawned future — which
/// recurses back through `force_invite`/`attempt_invite` — is registered
/// outside those methods' opaque-return defining scope. Without this, the
/// compiler cannot resolve the spawned task's `Send`-ness.
mod readiness_timer {
    use super::{CANDIDATE_TIMEOUT, CallBridge};
    use std::sync::Arc;
    use tokio::task::JoinHandle;

    pub(super) fn spawn(bridge: Arc<CallBridge>, local_call_id: String) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(CANDIDATE_TIMEOUT).await;
            bridge.force_invite(&local_call_id).await;
        })
    }
}
