//! Consultation call state machine
//!
//! [`CallManager`] owns the single call a client can have at a time and
//! drives it through
//!
//! ```text
//!     Idle ──────────────► Ringing (callee)
//!       │                     │ accept_call
//!       ▼ start_call          ▼
//!   Initiating ──answer──► Connecting ──peer connected──► InCall
//!       │                     │                             │
//!       └──────────┬──────────┴─────────────┬───────────────┘
//!                  ▼ failure / timeout      ▼ end_call / decline / missed
//!                Failed                  Ending
//!                  │                        │
//!                  └─────────► Idle ◄───────┘
//! ```
//!
//! All state lives behind one async mutex. Work that continues after an
//! await point (signal delivery, peer callbacks, timers) carries the
//! generation it was started for and is dropped once that generation is gone.

use crate::api::{ApiError, CallAction, ConsultationApi};
use crate::config::CallConfig;
use crate::context::{Ringer, Ringtone, UserSession};
use crate::media::{LocalMediaState, MediaError, MediaSessionManager, MediaStream};
use crate::peer::{
    PeerConnectionController, PeerError, PeerEvent, PeerFactory, PeerState, RemoteStream,
};
use crate::signaling::{
    IceCandidate, ReceivedSignal, SessionDescription, SignalPollHandle, SignalingClient,
    SignalingError, SignalingMessage,
};
use crate::task::ScopedTask;
use crate::types::{
    AppointmentContext, CallEvent, CallId, CallSession, CallStatus, IncomingCall,
    MediaConstraints, PresentationMode, TrackKind, UserNotice, UserRole,
};
use chrono::Utc;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex, MutexGuard};

/// Call management errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Another call is in progress
    #[error("A call is already active")]
    AlreadyActive,

    /// Operation not allowed in the current state
    #[error("Cannot {op} while call is {status:?}")]
    InvalidState {
        /// Attempted operation
        op: &'static str,
        /// Status at the time
        status: CallStatus,
    },

    /// No user signed in
    #[error("Not signed in")]
    NotAuthenticated,

    /// Signed-in user may not perform the operation
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Camera or microphone could not be opened
    #[error("Camera/microphone unavailable: {0}")]
    MediaUnavailable(String),

    /// Signaling failed after retries
    #[error("Signaling failed: {0}")]
    SignalingTransport(#[from] SignalingError),

    /// Peer connection could not be established or was lost
    #[error("Peer connection failed: {0}")]
    PeerConnectionFailure(String),

    /// Backend request failed
    #[error("Backend error: {0}")]
    Backend(#[from] ApiError),

    /// A call phase did not complete in time
    #[error("Timed out {0}")]
    Timeout(&'static str),

    /// The call ended while the operation was in progress
    #[error("Call was ended")]
    Cancelled,
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::MediaUnavailable(reason) => Self::MediaUnavailable(reason),
            MediaError::StreamError(reason) => Self::MediaUnavailable(reason),
        }
    }
}

impl From<PeerError> for CallError {
    fn from(err: PeerError) -> Self {
        Self::PeerConnectionFailure(err.to_string())
    }
}

/// Read-only view of the call for renderers
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    /// Current status
    pub status: CallStatus,
    /// Live or pending call
    pub session: Option<CallSession>,
    /// Overlay presentation
    pub presentation: PresentationMode,
    /// Camera/mic flags
    pub local_media: LocalMediaState,
    /// Local stream handle
    pub local_stream: Option<Arc<MediaStream>>,
    /// Remote stream handle
    pub remote_stream: Option<Arc<RemoteStream>>,
    /// Last failure message of this call
    pub error: Option<String>,
    /// Whether the signal poll loop runs
    pub signal_poll_active: bool,
    /// Session generation
    pub generation: u64,
}

impl CallSnapshot {
    /// Whether this client placed the call
    #[must_use]
    pub fn is_caller(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_caller)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notify {
    Nobody,
    Reject,
    End,
}

#[derive(Debug)]
enum Finish {
    Hangup,
    RemoteEnded,
    Declined,
    Missed,
    Failed { reason: String, media: bool },
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Answer,
    Connect,
    DisconnectGrace,
}

impl TimerKind {
    fn describe(self) -> &'static str {
        match self {
            Self::Answer => "waiting for the other side to answer",
            Self::Connect => "connecting media",
            Self::DisconnectGrace => "waiting for the connection to recover",
        }
    }
}

#[derive(Default)]
struct CallSlot {
    status: CallStatus,
    session: Option<CallSession>,
    generation: u64,
    presentation: PresentationMode,
    peer: Option<PeerConnectionController>,
    peer_state: Option<PeerState>,
    signal_poll: Option<SignalPollHandle>,
    dispatch: Option<ScopedTask>,
    timer: Option<ScopedTask>,
    error: Option<String>,
}

/// Resources taken out of the slot when a call ends
struct Teardown {
    generation: u64,
    from: CallStatus,
    session: Option<CallSession>,
    peer: Option<PeerConnectionController>,
    tasks: Vec<ScopedTask>,
}

struct Inner {
    config: CallConfig,
    user: Arc<dyn UserSession>,
    api: Arc<dyn ConsultationApi>,
    signaling: SignalingClient,
    media: Arc<MediaSessionManager>,
    peers: Arc<dyn PeerFactory>,
    ringer: Arc<dyn Ringer>,
    slot: Mutex<CallSlot>,
    event_sender: broadcast::Sender<CallEvent>,
    snapshot_sender: watch::Sender<CallSnapshot>,
}

/// Call manager
///
/// Cheap to clone; all clones drive the same call.
#[derive(Clone)]
pub struct CallManager {
    inner: Arc<Inner>,
}

impl CallManager {
    /// Create new call manager
    #[must_use]
    pub fn new(
        config: CallConfig,
        user: Arc<dyn UserSession>,
        api: Arc<dyn ConsultationApi>,
        media: Arc<MediaSessionManager>,
        peers: Arc<dyn PeerFactory>,
        ringer: Arc<dyn Ringer>,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        let (snapshot_sender, _) = watch::channel(CallSnapshot::default());
        let signaling = SignalingClient::new(Arc::clone(&api), config.signal_send_attempts);
        Self {
            inner: Arc::new(Inner {
                config,
                user,
                api,
                signaling,
                media,
                peers,
                ringer,
                slot: Mutex::new(CallSlot::default()),
                event_sender,
                snapshot_sender,
            }),
        }
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_sender.subscribe()
    }

    /// Watch the call snapshot
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.inner.snapshot_sender.subscribe()
    }

    /// Latest call snapshot
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.snapshot_sender.borrow().clone()
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> CallStatus {
        self.inner.snapshot_sender.borrow().status
    }

    /// Local media owner
    #[must_use]
    pub fn media(&self) -> &Arc<MediaSessionManager> {
        &self.inner.media
    }

    /// Valid status transitions
    ///
    /// - **Outgoing**: Idle → Initiating → Connecting → InCall
    /// - **Incoming**: Idle → Ringing → Connecting → InCall
    /// - **Teardown**: any active state → Ending → Idle
    /// - **Failure**: any active state → Failed → Idle
    #[must_use]
    pub fn is_valid_transition(from: CallStatus, to: CallStatus) -> bool {
        use CallStatus::{Connecting, Ending, Failed, Idle, InCall, Initiating, Ringing};
        matches!(
            (from, to),
            (Idle, Ringing)
                | (Idle, Initiating)
                | (Ringing, Connecting)
                | (Initiating, Connecting)
                | (Connecting, InCall)
                | (Ringing | Initiating | Connecting | InCall, Ending)
                | (Ringing | Initiating | Connecting | InCall | Ending, Failed)
                | (Ending | Failed, Idle)
        )
    }

    // ========================================================================
    // Slot helpers
    // ========================================================================

    fn emit(&self, event: CallEvent) {
        let _ = self.inner.event_sender.send(event);
    }

    fn notice(&self, notice: UserNotice) {
        tracing::info!(notice = %notice, "User notice");
        self.emit(CallEvent::Notice(notice));
    }

    fn transition(&self, slot: &mut CallSlot, to: CallStatus) {
        let from = slot.status;
        if from == to {
            return;
        }
        if !Self::is_valid_transition(from, to) {
            tracing::warn!(?from, ?to, "Unexpected call state transition");
        }
        slot.status = to;
        let call_id = slot.session.as_mut().map(|s| {
            s.status = to;
            s.call_id
        });
        tracing::debug!(call_id = ?call_id, old_state = ?from, new_state = ?to, "Call state transition");
        self.emit(CallEvent::StatusChanged { call_id, from, to });
    }

    fn publish(&self, slot: &CallSlot) {
        let snapshot = CallSnapshot {
            status: slot.status,
            session: slot.session.clone(),
            presentation: slot.presentation,
            local_media: self.inner.media.state(),
            local_stream: self.inner.media.local_stream(),
            remote_stream: slot.peer.as_ref().map(PeerConnectionController::remote_stream),
            error: slot.error.clone(),
            signal_poll_active: slot.signal_poll.as_ref().is_some_and(|p| p.is_active()),
            generation: slot.generation,
        };
        self.inner.snapshot_sender.send_replace(snapshot);
    }

    /// Lock the slot if `generation` is still the live call
    async fn current(&self, generation: u64) -> Result<MutexGuard<'_, CallSlot>, CallError> {
        let slot = self.inner.slot.lock().await;
        if slot.generation != generation || !slot.status.is_active() {
            tracing::trace!(generation, current = slot.generation, "Dropping stale call work");
            return Err(CallError::Cancelled);
        }
        Ok(slot)
    }

    /// Stop a stream acquired for a call that ended before it could use it
    async fn release_orphaned(&self, stream: &Arc<MediaStream>) {
        let slot = self.inner.slot.lock().await;
        let held = self.inner.media.local_stream();
        if !slot.status.is_active() && held.is_some_and(|h| Arc::ptr_eq(&h, stream)) {
            self.inner.media.release();
        }
    }

    async fn fail(&self, generation: u64, error: CallError, notify: Notify) -> CallError {
        if !matches!(error, CallError::Cancelled) {
            tracing::warn!(error = %error, "Call failed");
            let media = matches!(error, CallError::MediaUnavailable(_));
            self.finish(
                Some(generation),
                Finish::Failed {
                    reason: error.to_string(),
                    media,
                },
                notify,
            )
            .await;
        }
        error
    }

    /// Tear the call down and return to idle
    ///
    /// Returns `false` when there was nothing to end, `expected` no longer
    /// matches, or another teardown is already running.
    async fn finish(&self, expected: Option<u64>, how: Finish, notify: Notify) -> bool {
        let teardown = {
            let mut slot = self.inner.slot.lock().await;
            if matches!(
                slot.status,
                CallStatus::Idle | CallStatus::Ending | CallStatus::Failed
            ) {
                return false;
            }
            if expected.is_some_and(|g| g != slot.generation) {
                return false;
            }

            self.inner.ringer.stop();
            slot.generation += 1;
            let from = slot.status;

            match &how {
                Finish::Failed { reason, .. } => {
                    slot.error = Some(reason.clone());
                    self.transition(&mut slot, CallStatus::Failed);
                }
                _ => self.transition(&mut slot, CallStatus::Ending),
            }

            let mut tasks = Vec::new();
            if let Some(mut poll) = slot.signal_poll.take() {
                poll.cancel();
            }
            tasks.extend(slot.dispatch.take());
            tasks.extend(slot.timer.take());
            slot.peer_state = None;
            self.publish(&slot);

            Teardown {
                generation: slot.generation,
                from,
                session: slot.session.clone(),
                peer: slot.peer.take(),
                tasks,
            }
        };

        let call_id = teardown.session.as_ref().map(|s| s.call_id);
        match how {
            Finish::Failed { reason, media } => {
                self.emit(CallEvent::Failed {
                    call_id,
                    reason: reason.clone(),
                });
                self.notice(if media {
                    UserNotice::MediaDenied
                } else if teardown.from == CallStatus::Initiating {
                    UserNotice::CouldNotStart(reason)
                } else {
                    UserNotice::CouldNotConnect(reason)
                });
            }
            Finish::RemoteEnded => self.notice(UserNotice::CallEnded),
            Finish::Missed => {
                if let Some(call_id) = call_id {
                    self.emit(CallEvent::Missed { call_id });
                }
                self.notice(UserNotice::CallMissed);
            }
            Finish::Hangup | Finish::Declined => {}
        }

        if let Some(mut peer) = teardown.peer {
            peer.close().await;
        }
        self.inner.media.release();

        {
            let mut slot = self.inner.slot.lock().await;
            if slot.generation == teardown.generation {
                slot.session = None;
                slot.presentation = PresentationMode::Hidden;
                self.transition(&mut slot, CallStatus::Idle);
                self.publish(&slot);
            }
        }
        self.emit(CallEvent::Ended { call_id });
        tracing::info!(call_id = ?call_id, from = ?teardown.from, "Call finished");

        if let Some(session) = &teardown.session {
            let notify = match notify {
                Notify::End if teardown.from == CallStatus::Ringing => Notify::Reject,
                other => other,
            };
            match notify {
                Notify::Nobody => {}
                Notify::Reject => {
                    if let Err(e) = self
                        .inner
                        .api
                        .update_call_status(&session.room_id, CallAction::Reject)
                        .await
                    {
                        tracing::warn!(error = %e, room = %session.room_id, "Failed to post call rejection");
                    }
                }
                Notify::End => {
                    if let Err(e) = self
                        .inner
                        .api
                        .update_call_status(&session.room_id, CallAction::End)
                        .await
                    {
                        tracing::warn!(error = %e, room = %session.room_id, "Failed to post call end");
                    }
                    if let Some(to) = session.peer_user_id {
                        if let Err(e) = self.inner.signaling.send_end(&session.room_id, to).await {
                            tracing::warn!(error = %e, room = %session.room_id, "Failed to send end signal");
                        }
                    }
                }
            }
        }

        // May abort the task running this teardown; nothing follows
        drop(teardown.tasks);
        true
    }

    // ========================================================================
    // Background work
    // ========================================================================

    fn spawn_timer(&self, generation: u64, kind: TimerKind, after: Duration) -> ScopedTask {
        let weak = self.downgrade();
        ScopedTask::spawn("call-timer", async move {
            tokio::time::sleep(after).await;
            if let Some(manager) = Self::upgrade(&weak) {
                manager.on_timer(generation, kind).await;
            }
        })
    }

    fn spawn_dispatch(
        &self,
        generation: u64,
        mut signals: mpsc::UnboundedReceiver<ReceivedSignal>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> ScopedTask {
        let weak = self.downgrade();
        ScopedTask::spawn("call-dispatch", async move {
            loop {
                tokio::select! {
                    Some(signal) = signals.recv() => {
                        let Some(manager) = Self::upgrade(&weak) else { break };
                        manager.on_signal(generation, signal).await;
                    }
                    Some(event) = peer_events.recv() => {
                        let Some(manager) = Self::upgrade(&weak) else { break };
                        manager.on_peer_event(generation, event).await;
                    }
                    else => break,
                }
            }
        })
    }

    /// Start signal polling and event dispatch for the call in `slot`
    fn install_peer(
        &self,
        slot: &mut CallSlot,
        peer: PeerConnectionController,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let Some(room) = slot.session.as_ref().map(|s| s.room_id.clone()) else {
            return;
        };
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        slot.signal_poll = Some(self.inner.signaling.spawn_poll_loop(
            room,
            self.inner.config.signal_poll_interval,
            signal_tx,
        ));
        slot.dispatch = Some(self.spawn_dispatch(slot.generation, signal_rx, peer_events));
        slot.peer = Some(peer);
        slot.peer_state = Some(PeerState::New);
    }

    async fn open_peer(
        &self,
        stream: &MediaStream,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<PeerConnectionController, CallError> {
        let backend = self.inner.peers.create(events).await?;
        let mut peer = PeerConnectionController::new(backend);
        if let Err(e) = peer.attach_local_stream(stream).await {
            peer.close().await;
            return Err(e.into());
        }
        Ok(peer)
    }

    async fn on_timer(&self, generation: u64, kind: TimerKind) {
        let expired = {
            let Ok(slot) = self.current(generation).await else {
                return;
            };
            match kind {
                TimerKind::Answer => slot.status == CallStatus::Initiating,
                TimerKind::Connect => slot.status == CallStatus::Connecting,
                TimerKind::DisconnectGrace => {
                    slot.status == CallStatus::InCall
                        && slot.peer_state == Some(PeerState::Disconnected)
                }
            }
        };
        if expired {
            self.fail(generation, CallError::Timeout(kind.describe()), Notify::End)
                .await;
        }
    }

    async fn on_signal(&self, generation: u64, signal: ReceivedSignal) {
        match signal.message {
            SignalingMessage::Offer(offer) => self.on_remote_offer(generation, offer).await,
            SignalingMessage::Answer(answer) => self.on_remote_answer(generation, answer).await,
            SignalingMessage::Candidate(candidate) => {
                self.on_remote_candidate(generation, candidate).await;
            }
            SignalingMessage::End => {
                tracing::info!(signal_id = signal.id.0, "Other side ended the call");
                self.finish(Some(generation), Finish::RemoteEnded, Notify::Nobody)
                    .await;
            }
        }
    }

    async fn on_remote_offer(&self, generation: u64, offer: SessionDescription) {
        let outcome = {
            let Ok(mut slot) = self.current(generation).await else {
                return;
            };
            let Some(session) = slot.session.clone() else {
                return;
            };
            if session.is_caller {
                tracing::warn!(call_id = %session.call_id, "Ignoring offer received by the caller");
                return;
            }
            let Some(peer) = slot.peer.as_mut() else {
                return;
            };
            if peer.has_remote_description() {
                tracing::debug!(call_id = %session.call_id, "Ignoring repeated offer");
                return;
            }
            peer.apply_remote_offer(offer)
                .await
                .map(|answer| (session, answer))
        };

        let result = match outcome {
            Ok((session, answer)) => match session.peer_user_id {
                Some(to) => self
                    .inner
                    .signaling
                    .send_answer(&session.room_id, to, answer)
                    .await
                    .map_err(CallError::from),
                None => Err(SignalingError::MissingRecipient(session.room_id).into()),
            },
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            self.fail(generation, e, Notify::End).await;
        }
    }

    async fn on_remote_answer(&self, generation: u64, answer: SessionDescription) {
        let result = {
            let Ok(mut slot) = self.current(generation).await else {
                return;
            };
            if !slot.session.as_ref().is_some_and(|s| s.is_caller) {
                tracing::warn!("Ignoring answer received by the callee");
                return;
            }
            let Some(peer) = slot.peer.as_mut() else {
                return;
            };
            match peer.apply_remote_answer(answer).await {
                Ok(true) => {
                    self.inner.ringer.stop();
                    if slot.status == CallStatus::Initiating {
                        self.transition(&mut slot, CallStatus::Connecting);
                        slot.timer = Some(self.spawn_timer(
                            generation,
                            TimerKind::Connect,
                            self.inner.config.connect_timeout,
                        ));
                        self.publish(&slot);
                    }
                    Ok(())
                }
                Ok(false) => Ok(()),
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            self.fail(generation, e.into(), Notify::End).await;
        }
    }

    async fn on_remote_candidate(&self, generation: u64, candidate: IceCandidate) {
        let Ok(mut slot) = self.current(generation).await else {
            return;
        };
        if let Some(peer) = slot.peer.as_mut() {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "Remote ICE candidate rejected");
            }
        }
    }

    async fn on_peer_event(&self, generation: u64, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let target = {
                    let Ok(slot) = self.current(generation).await else {
                        return;
                    };
                    slot.session
                        .as_ref()
                        .and_then(|s| s.peer_user_id.map(|to| (s.room_id.clone(), to)))
                };
                let Some((room, to)) = target else {
                    return;
                };
                if let Err(e) = self
                    .inner
                    .signaling
                    .send_ice_candidate(&room, to, candidate)
                    .await
                {
                    self.fail(generation, e.into(), Notify::End).await;
                }
            }
            PeerEvent::StateChanged(state) => self.on_peer_state(generation, state).await,
            PeerEvent::RemoteTrack(track) => {
                let Ok(slot) = self.current(generation).await else {
                    return;
                };
                let added = slot
                    .peer
                    .as_ref()
                    .is_some_and(|p| p.on_remote_track(track));
                if added {
                    self.publish(&slot);
                    if let Some(call_id) = slot.session.as_ref().map(|s| s.call_id) {
                        self.emit(CallEvent::RemoteStreamReady { call_id });
                    }
                }
            }
        }
    }

    async fn on_peer_state(&self, generation: u64, state: PeerState) {
        let failure = {
            let Ok(mut slot) = self.current(generation).await else {
                return;
            };
            slot.peer_state = Some(state);
            match state {
                PeerState::Connected if slot.status == CallStatus::Connecting => {
                    self.transition(&mut slot, CallStatus::InCall);
                    if let Some(session) = slot.session.as_mut() {
                        session.connected_at = Some(Utc::now());
                    }
                    slot.timer = None;
                    self.publish(&slot);
                    tracing::info!("Call connected");
                    None
                }
                PeerState::Connected => {
                    if slot.timer.take().is_some() {
                        tracing::info!("Connection recovered");
                    }
                    None
                }
                PeerState::Disconnected if slot.status == CallStatus::InCall => {
                    tracing::warn!(
                        grace_ms = self.inner.config.disconnect_grace.as_millis(),
                        "Connection lost, waiting for recovery"
                    );
                    slot.timer = Some(self.spawn_timer(
                        generation,
                        TimerKind::DisconnectGrace,
                        self.inner.config.disconnect_grace,
                    ));
                    None
                }
                PeerState::Failed => Some(Finish::Failed {
                    reason: CallError::PeerConnectionFailure(
                        "ICE/DTLS negotiation failed".to_string(),
                    )
                    .to_string(),
                    media: false,
                }),
                PeerState::Closed if slot.status == CallStatus::InCall => {
                    Some(Finish::RemoteEnded)
                }
                _ => None,
            }
        };
        if let Some(how) = failure {
            let notify = match how {
                Finish::RemoteEnded => Notify::Nobody,
                _ => Notify::End,
            };
            self.finish(Some(generation), how, notify).await;
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Start a call for an appointment
    ///
    /// Only doctors place calls. Returns the session once the offer is sent;
    /// the call moves on to `InCall` when the callee answers and media
    /// connects.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::AlreadyActive`] if a call exists. Any later
    /// failure has already returned the manager to `Idle`.
    #[tracing::instrument(skip(self, appointment), fields(appointment_id = %appointment.appointment_id))]
    pub async fn start_call(
        &self,
        appointment: AppointmentContext,
        constraints: MediaConstraints,
    ) -> Result<CallSession, CallError> {
        let user = self
            .inner
            .user
            .current_user()
            .ok_or(CallError::NotAuthenticated)?;
        if user.role != UserRole::Doctor {
            return Err(CallError::NotPermitted(
                "only doctors can start consultation calls".to_string(),
            ));
        }

        let generation = {
            let mut slot = self.inner.slot.lock().await;
            if slot.status.is_active() {
                self.notice(UserNotice::AlreadyInCall);
                return Err(CallError::AlreadyActive);
            }
            slot.generation += 1;
            slot.error = None;
            slot.presentation = PresentationMode::Modal;
            self.transition(&mut slot, CallStatus::Initiating);
            self.inner.ringer.play(Ringtone::Outgoing);
            self.publish(&slot);
            slot.generation
        };

        let stream = match self.inner.media.acquire(constraints).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(generation, e.into(), Notify::Nobody).await),
        };
        if self.current(generation).await.is_err() {
            self.release_orphaned(&stream).await;
            return Err(CallError::Cancelled);
        }

        let started = match self.inner.api.start_call(appointment.appointment_id).await {
            Ok(started) => started,
            Err(e) => return Err(self.fail(generation, e.into(), Notify::Nobody).await),
        };
        let session = CallSession::outgoing(&started, appointment);

        {
            let Ok(mut slot) = self.current(generation).await else {
                if let Err(e) = self
                    .inner
                    .api
                    .update_call_status(&started.room_id, CallAction::End)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to cancel abandoned call");
                }
                self.release_orphaned(&stream).await;
                return Err(CallError::Cancelled);
            };
            slot.session = Some(session.clone());
            self.publish(&slot);
        }

        let Some(to) = session.peer_user_id else {
            let error = SignalingError::MissingRecipient(session.room_id.clone()).into();
            return Err(self.fail(generation, error, Notify::End).await);
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut peer = match self.open_peer(&stream, events_tx).await {
            Ok(peer) => peer,
            Err(e) => return Err(self.fail(generation, e, Notify::End).await),
        };
        let offer = match peer.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                peer.close().await;
                return Err(self.fail(generation, e.into(), Notify::End).await);
            }
        };

        {
            let Ok(mut slot) = self.current(generation).await else {
                peer.close().await;
                self.release_orphaned(&stream).await;
                return Err(CallError::Cancelled);
            };
            self.install_peer(&mut slot, peer, events_rx);
            slot.timer = Some(self.spawn_timer(
                generation,
                TimerKind::Answer,
                self.inner.config.answer_timeout,
            ));
            self.publish(&slot);
        }

        if let Err(e) = self
            .inner
            .signaling
            .send_offer(&session.room_id, to, offer)
            .await
        {
            return Err(self.fail(generation, e.into(), Notify::End).await);
        }

        tracing::info!(call_id = %session.call_id, room = %session.room_id, "Outgoing call started");
        Ok(session)
    }

    /// Register a call reported by the incoming poller
    ///
    /// Returns `false` when another call is already present.
    pub async fn handle_incoming(&self, call: IncomingCall) -> bool {
        let role = self
            .inner
            .user
            .current_user()
            .map_or(UserRole::Patient, |u| u.role);
        {
            let mut slot = self.inner.slot.lock().await;
            if slot.status.is_active() || slot.session.is_some() {
                tracing::debug!(call_id = %call.call_id, "Ignoring incoming call while another call is present");
                return false;
            }
            slot.generation += 1;
            slot.error = None;
            slot.session = Some(CallSession::incoming(&call));
            slot.presentation = PresentationMode::Modal;
            self.transition(&mut slot, CallStatus::Ringing);
            self.inner.ringer.play(Ringtone::Incoming);
            self.publish(&slot);
        }

        let from = call.appointment.other_party_name(role);
        tracing::info!(call_id = %call.call_id, room = %call.room_id, from = %from, "Incoming call");
        self.emit(CallEvent::IncomingCall { call });
        self.notice(UserNotice::IncomingCall { from });
        true
    }

    /// Answer the ringing call
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] unless ringing. Any later failure
    /// has already returned the manager to `Idle`.
    #[tracing::instrument(skip(self))]
    pub async fn accept_call(&self, constraints: MediaConstraints) -> Result<(), CallError> {
        let (generation, session) = {
            let mut slot = self.inner.slot.lock().await;
            if slot.status != CallStatus::Ringing {
                return Err(CallError::InvalidState {
                    op: "accept",
                    status: slot.status,
                });
            }
            self.inner.ringer.stop();
            let Some(session) = slot.session.clone() else {
                return Err(CallError::InvalidState {
                    op: "accept",
                    status: slot.status,
                });
            };
            self.transition(&mut slot, CallStatus::Connecting);
            slot.presentation = PresentationMode::Modal;
            self.publish(&slot);
            (slot.generation, session)
        };

        if session.peer_user_id.is_none() {
            let error = SignalingError::MissingRecipient(session.room_id.clone()).into();
            return Err(self.fail(generation, error, Notify::Reject).await);
        }

        let stream = match self.inner.media.acquire(constraints).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(generation, e.into(), Notify::Reject).await),
        };
        if self.current(generation).await.is_err() {
            self.release_orphaned(&stream).await;
            return Err(CallError::Cancelled);
        }

        if let Err(e) = self
            .inner
            .api
            .update_call_status(&session.room_id, CallAction::Accept)
            .await
        {
            return Err(self.fail(generation, e.into(), Notify::Reject).await);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = match self.open_peer(&stream, events_tx).await {
            Ok(peer) => peer,
            Err(e) => return Err(self.fail(generation, e, Notify::End).await),
        };

        {
            let Ok(mut slot) = self.current(generation).await else {
                let mut peer = peer;
                peer.close().await;
                self.release_orphaned(&stream).await;
                return Err(CallError::Cancelled);
            };
            self.install_peer(&mut slot, peer, events_rx);
            slot.timer = Some(self.spawn_timer(
                generation,
                TimerKind::Connect,
                self.inner.config.connect_timeout,
            ));
            self.publish(&slot);
        }

        tracing::info!(call_id = %session.call_id, room = %session.room_id, "Call accepted");
        Ok(())
    }

    /// Decline the ringing call
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] unless ringing
    pub async fn decline_call(&self) -> Result<(), CallError> {
        let generation = {
            let slot = self.inner.slot.lock().await;
            if slot.status != CallStatus::Ringing {
                return Err(CallError::InvalidState {
                    op: "decline",
                    status: slot.status,
                });
            }
            slot.generation
        };
        self.finish(Some(generation), Finish::Declined, Notify::Reject)
            .await;
        Ok(())
    }

    /// Hang up
    ///
    /// With `notify_peer` the backend and the other side are told the call
    /// ended. Returns `false` when there was no call; repeated calls are
    /// no-ops.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self, notify_peer: bool) -> bool {
        let notify = if notify_peer {
            Notify::End
        } else {
            Notify::Nobody
        };
        self.finish(None, Finish::Hangup, notify).await
    }

    /// Reset a ringing call the caller abandoned
    ///
    /// Only applies while ringing as callee with no signal poll running.
    pub async fn mark_missed(&self, call_id: CallId) -> bool {
        let generation = {
            let slot = self.inner.slot.lock().await;
            let ringing_here = slot.status == CallStatus::Ringing
                && slot.signal_poll.is_none()
                && slot
                    .session
                    .as_ref()
                    .is_some_and(|s| !s.is_caller && s.call_id == call_id);
            if !ringing_here {
                return false;
            }
            slot.generation
        };
        tracing::info!(call_id = %call_id, "Ringing call disappeared, marking missed");
        self.finish(Some(generation), Finish::Missed, Notify::Nobody)
            .await
    }

    /// Collapse the call modal into the floating widget
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] unless in a call
    pub async fn minimize(&self) -> Result<(), CallError> {
        let mut slot = self.inner.slot.lock().await;
        if slot.status != CallStatus::InCall {
            return Err(CallError::InvalidState {
                op: "minimize",
                status: slot.status,
            });
        }
        if slot.presentation != PresentationMode::Minimized {
            slot.presentation = PresentationMode::Minimized;
            self.publish(&slot);
        }
        Ok(())
    }

    /// Bring the call modal back
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] when there is no call
    pub async fn restore(&self) -> Result<(), CallError> {
        let mut slot = self.inner.slot.lock().await;
        if !slot.status.is_active() {
            return Err(CallError::InvalidState {
                op: "restore",
                status: slot.status,
            });
        }
        if slot.presentation != PresentationMode::Modal {
            slot.presentation = PresentationMode::Modal;
            self.publish(&slot);
        }
        Ok(())
    }

    /// Toggle the camera; returns the new state, `None` without a video track
    pub async fn toggle_camera(&self) -> Option<bool> {
        self.toggle(TrackKind::Video).await
    }

    /// Toggle the microphone; returns the new state, `None` without an audio track
    pub async fn toggle_mic(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio).await
    }

    async fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let slot = self.inner.slot.lock().await;
        let enabled = self.inner.media.toggle_track(kind)?;
        self.publish(&slot);
        Some(enabled)
    }
}
