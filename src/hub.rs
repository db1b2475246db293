//! The signaling hub: one persistent duplex WebSocket channel per browser,
//! routing SDP offers/answers, ICE candidates, and public keys between
//! peers in the same session, plus the host-authority control surface.
//!
//! Outbound delivery to a single channel is FIFO because it is always
//! funneled through that channel's own `mpsc` sender — a single-writer
//! queue, matching the per-connection channel pattern used across the
//! pack's websocket examples.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use sendie_core::{JoinError, Policy, RateLimiter, SessionRegistry};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

/// A single inbound wire frame: an optional invocation ID (absent means
/// fire-and-forget) plus a method name and its arguments.
#[derive(Deserialize)]
struct InboundFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(flatten)]
    method: InboundMethod,
}

#[derive(Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
enum InboundMethod {
    JoinSession { session_id: String },
    LeaveSession,
    SendOfferTo { target_handle: String, sdp: String },
    SendAnswerTo { target_handle: String, sdp: String },
    SendIceCandidateTo { target_handle: String, candidate: String, sdp_mid: Option<String>, sdp_m_line_index: Option<u32> },
    SendPublicKeyTo { target_handle: String, key_material: String },
    ReportConnectionEstablished { target_handle: String },
    ReportConnectionClosed { target_handle: String },
    LockSession,
    UnlockSession,
    KickPeer { target_handle: String },
    EnableHostOnlySending,
    DisableHostOnlySending,
}

/// The closed set of server-initiated events. Pushed without an invocation
/// ID — they are not responses to any particular call.
#[derive(Serialize, Clone)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum OutboundEvent {
    PeerJoined { handle: String },
    PeerLeft { handle: String },
    Offer { from: String, sdp: String },
    Answer { from: String, sdp: String },
    IceCandidate { from: String, candidate: String, sdp_mid: Option<String>, sdp_m_line_index: Option<u32> },
    PublicKey { from: String, key: String },
    SessionLocked,
    SessionUnlocked,
    Kicked,
    HostOnlySendingEnabled,
    HostOnlySendingDisabled,
}

fn rate_limit_message(retry_after: Option<std::time::Duration>) -> String {
    crate::metrics::Metrics::message_rate_limited();
    let secs = retry_after.unwrap_or_default().as_secs().max(1);
    format!("Rate limit exceeded, retry in {secs} seconds")
}

/// Per-connection duplex state and the session/rate-limiter handles the
/// dispatch table needs. One `Hub` is shared process-wide; per-channel
/// state lives in `connections` and in the caller's own task-local
/// `current_session` variable.
pub struct Hub {
    sessions: Arc<SessionRegistry>,
    rate_limiter: Arc<RateLimiter>,
    connections: DashMap<String, mpsc::UnboundedSender<Message>, ahash::RandomState>,
}

impl Hub {
    pub fn new(sessions: Arc<SessionRegistry>, rate_limiter: Arc<RateLimiter>) -> Arc<Self> {
        Arc::new(Self { sessions, rate_limiter, connections: DashMap::with_hasher(ahash::RandomState::new()) })
    }

    fn send_event(&self, connection_handle: &str, event: &OutboundEvent) {
        let Some(sender) = self.connections.get(connection_handle) else {
            return;
        };
        if let Ok(text) = serde_json::to_string(event) {
            let _ = sender.send(Message::Text(text.into()));
        }
    }

    /// Fans `event` out to every peer in `session_id`, skipping `exclude`
    /// (the caller) unless `exclude` is `None` — host-control toggles
    /// broadcast to the caller too, for state consistency.
    fn broadcast(&self, session_id: &str, exclude: Option<&str>, event: &OutboundEvent) {
        for peer in self.sessions.peers_in(session_id) {
            if Some(peer.connection_handle.as_str()) == exclude {
                continue;
            }
            self.send_event(&peer.connection_handle, event);
        }
    }

    /// Drives one client's duplex channel end to end: registers its
    /// outbound queue, reads frames until the socket closes, then tears
    /// down membership, the outbound queue, and any rate-limit buckets.
    pub async fn handle_connection(self: Arc<Self>, socket: WebSocket, principal: Option<String>) {
        let connection_handle = sendie_core::generate_token();
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.connections.insert(connection_handle.clone(), tx);

        let send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let mut current_session: Option<String> = None;

        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => {
                    self.dispatch(&connection_handle, principal.as_deref(), &mut current_session, &text).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        if let Some(session_id) = current_session.take() {
            self.sessions.remove_peer(&session_id, &connection_handle);
            crate::metrics::Metrics::peer_left();
            self.broadcast(&session_id, Some(&connection_handle), &OutboundEvent::PeerLeft { handle: connection_handle.clone() });
        }

        self.connections.remove(&connection_handle);
        self.rate_limiter.clear_key(&connection_handle);
        send_task.abort();
    }

    async fn dispatch(&self, connection_handle: &str, principal: Option<&str>, current_session: &mut Option<String>, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("dropping malformed hub frame from {connection_handle}: {err}");
                return;
            }
        };

        let result = self.handle_method(connection_handle, principal, current_session, frame.method).await;

        if let Some(id) = frame.id {
            self.send_event_raw(connection_handle, &json!({ "id": id, "result": result }));
        }
    }

    fn send_event_raw(&self, connection_handle: &str, payload: &serde_json::Value) {
        let Some(sender) = self.connections.get(connection_handle) else {
            return;
        };
        if let Ok(text) = serde_json::to_string(payload) {
            let _ = sender.send(Message::Text(text.into()));
        }
    }

    async fn handle_method(
        &self,
        connection_handle: &str,
        principal: Option<&str>,
        current_session: &mut Option<String>,
        method: InboundMethod,
    ) -> serde_json::Value {
        match method {
            InboundMethod::JoinSession { session_id } => self.join_session(connection_handle, principal, current_session, session_id),
            InboundMethod::LeaveSession => self.leave_session(connection_handle, current_session),
            InboundMethod::SendOfferTo { target_handle, sdp } => {
                self.route(connection_handle, current_session, &target_handle, OutboundEvent::Offer { from: connection_handle.to_string(), sdp })
            }
            InboundMethod::SendAnswerTo { target_handle, sdp } => {
                self.route(connection_handle, current_session, &target_handle, OutboundEvent::Answer { from: connection_handle.to_string(), sdp })
            }
            InboundMethod::SendIceCandidateTo { target_handle, candidate, sdp_mid, sdp_m_line_index } => self.route(
                connection_handle,
                current_session,
                &target_handle,
                OutboundEvent::IceCandidate { from: connection_handle.to_string(), candidate, sdp_mid, sdp_m_line_index },
            ),
            InboundMethod::SendPublicKeyTo { target_handle, key_material } => self.route(
                connection_handle,
                current_session,
                &target_handle,
                OutboundEvent::PublicKey { from: connection_handle.to_string(), key: key_material },
            ),
            InboundMethod::ReportConnectionEstablished { target_handle } => {
                let result = self.report_connection(connection_handle, current_session, true);
                let _ = target_handle;
                result
            }
            InboundMethod::ReportConnectionClosed { target_handle } => {
                let result = self.report_connection(connection_handle, current_session, false);
                let _ = target_handle;
                result
            }
            InboundMethod::LockSession => {
                self.host_command(connection_handle, current_session, principal, OutboundEvent::SessionLocked, |sessions, id, uid| sessions.lock(id, uid))
            }
            InboundMethod::UnlockSession => {
                self.host_command(connection_handle, current_session, principal, OutboundEvent::SessionUnlocked, |sessions, id, uid| sessions.unlock(id, uid))
            }
            InboundMethod::EnableHostOnlySending => {
                self.host_command(connection_handle, current_session, principal, OutboundEvent::HostOnlySendingEnabled, |sessions, id, uid| {
                    sessions.enable_host_only_sending(id, uid)
                })
            }
            InboundMethod::DisableHostOnlySending => {
                self.host_command(connection_handle, current_session, principal, OutboundEvent::HostOnlySendingDisabled, |sessions, id, uid| {
                    sessions.disable_host_only_sending(id, uid)
                })
            }
            InboundMethod::KickPeer { target_handle } => self.kick_peer(connection_handle, current_session, principal, &target_handle),
        }
    }

    fn join_session(
        &self,
        connection_handle: &str,
        principal: Option<&str>,
        current_session: &mut Option<String>,
        session_id: String,
    ) -> serde_json::Value {
        let check = self.rate_limiter.check(Policy::SessionJoin, connection_handle);
        if !check.allowed {
            return json!({ "success": false, "error": rate_limit_message(check.retry_after) });
        }

        // Snapshot taken before the mutation: the joiner's own list of
        // pre-existing peers must not include itself, and must be computed
        // before the fan-out below so the ack/broadcast ordering guarantee
        // from the concurrency model holds.
        let existing_peers = self.sessions.peers_in(&session_id);

        match self.sessions.add_peer(&session_id, connection_handle.to_string(), principal.map(str::to_string)) {
            Ok(peer) => {
                *current_session = Some(session_id.clone());
                crate::metrics::Metrics::peer_joined();

                for existing in &existing_peers {
                    self.send_event(&existing.connection_handle, &OutboundEvent::PeerJoined { handle: connection_handle.to_string() });
                }

                let is_host = principal.is_some_and(|uid| self.sessions.is_creator(&session_id, uid));
                let host_connection_handle = self.sessions.host_connection_handle(&session_id);
                let session = self.sessions.get(&session_id);

                json!({
                    "success": true,
                    "is_initiator_role": peer.is_initiator_role,
                    "existing_peers": existing_peers.iter().map(|p| p.connection_handle.clone()).collect::<Vec<_>>(),
                    "is_host": is_host,
                    "host_connection_handle": host_connection_handle,
                    "is_locked": session.as_ref().map(|s| s.is_locked).unwrap_or(false),
                    "is_host_only_sending": session.as_ref().map(|s| s.is_host_only_sending).unwrap_or(false),
                })
            }
            Err(JoinError::NotFound) => json!({ "success": false, "error": "Session not found" }),
            Err(JoinError::Locked) => json!({ "success": false, "error": "Session is locked" }),
            Err(JoinError::Full) => json!({ "success": false, "error": "Session is full" }),
        }
    }

    fn leave_session(&self, connection_handle: &str, current_session: &mut Option<String>) -> serde_json::Value {
        let check = self.rate_limiter.check(Policy::SignalingMessage, connection_handle);
        if !check.allowed {
            return json!({ "success": false, "error": rate_limit_message(check.retry_after) });
        }

        if let Some(session_id) = current_session.take() {
            self.sessions.remove_peer(&session_id, connection_handle);
            crate::metrics::Metrics::peer_left();
            self.broadcast(&session_id, Some(connection_handle), &OutboundEvent::PeerLeft { handle: connection_handle.to_string() });
        }

        json!({ "success": true })
    }

    /// Verifies both caller and target belong to the same session before
    /// routing `event` to the target. Mismatches are dropped with a
    /// warning, never surfaced as an error to the caller.
    fn route(&self, connection_handle: &str, current_session: &Option<String>, target_handle: &str, event: OutboundEvent) -> serde_json::Value {
        let check = match &event {
            OutboundEvent::IceCandidate { .. } => self.rate_limiter.check(Policy::IceCandidate, connection_handle),
            _ => self.rate_limiter.check(Policy::SignalingMessage, connection_handle),
        };
        if !check.allowed {
            return json!({ "success": false, "error": rate_limit_message(check.retry_after) });
        }

        let Some(session_id) = current_session else {
            log::warn!("signaling call from {connection_handle} with no active session");
            return json!({ "success": true });
        };

        let Some(target_peer) = self.sessions.peer_by_handle(target_handle) else {
            log::warn!("signaling target {target_handle} not found");
            return json!({ "success": true });
        };

        if target_peer.session_id != *session_id {
            log::warn!("signaling target {target_handle} not in caller's session");
            return json!({ "success": true });
        }

        self.send_event(target_handle, &event);
        crate::metrics::Metrics::message_routed();
        json!({ "success": true })
    }

    fn report_connection(&self, connection_handle: &str, current_session: &Option<String>, established: bool) -> serde_json::Value {
        let check = self.rate_limiter.check(Policy::SignalingMessage, connection_handle);
        if !check.allowed {
            return json!({ "success": false, "error": rate_limit_message(check.retry_after) });
        }

        if let Some(session_id) = current_session {
            if established {
                self.sessions.inc_connected_pairs(session_id);
            } else {
                self.sessions.dec_connected_pairs(session_id);
            }
        }

        json!({ "success": true })
    }

    fn host_command(
        &self,
        connection_handle: &str,
        current_session: &Option<String>,
        principal: Option<&str>,
        event: OutboundEvent,
        apply: impl FnOnce(&SessionRegistry, &str, &str) -> bool,
    ) -> serde_json::Value {
        let check = self.rate_limiter.check(Policy::SignalingMessage, connection_handle);
        if !check.allowed {
            return json!({ "success": false, "error": rate_limit_message(check.retry_after) });
        }

        let (Some(session_id), Some(user_id)) = (current_session, principal) else {
            return json!({ "success": false, "error": "Forbidden" });
        };

        if apply(&self.sessions, session_id, user_id) {
            self.broadcast(session_id, None, &event);
            json!({ "success": true })
        } else {
            json!({ "success": false, "error": "Forbidden" })
        }
    }

    fn kick_peer(&self, connection_handle: &str, current_session: &Option<String>, principal: Option<&str>, target_handle: &str) -> serde_json::Value {
        let check = self.rate_limiter.check(Policy::SignalingMessage, connection_handle);
        if !check.allowed {
            return json!({ "success": false, "error": rate_limit_message(check.retry_after) });
        }

        let (Some(session_id), Some(user_id)) = (current_session, principal) else {
            return json!({ "success": false, "error": "Forbidden" });
        };

        if !self.sessions.is_creator(session_id, user_id) {
            return json!({ "success": false, "error": "Forbidden" });
        }

        self.sessions.remove_peer(session_id, target_handle);
        crate::metrics::Metrics::peer_left();
        self.send_event(target_handle, &OutboundEvent::Kicked);
        self.broadcast(session_id, Some(target_handle), &OutboundEvent::PeerLeft { handle: target_handle.to_string() });

        json!({ "success": true })
    }
}
