//! In-memory collaborators for call manager tests

#![allow(dead_code)]

use async_trait::async_trait;
use rapireport_call_core::api::{InboundSignal, OutboundSignal};
use rapireport_call_core::media::{LocalTrack, MediaDevices, MediaEvent};
use rapireport_call_core::peer::{PeerBackend, PeerEvent, PeerFactory};
use rapireport_call_core::signaling::{IceCandidate, SessionDescription};
use rapireport_call_core::{
    ApiError, AppointmentContext, AppointmentId, CallAction, CallConfig, CallEvent, CallId,
    CallManager, CallStatus, ConsultationApi, CurrentUser, IncomingCall, IncomingCallPoller,
    MediaConstraints, MediaError, MediaSessionManager, MediaStream, PeerError, Ringer, Ringtone,
    RoomId, SharedUserSession, SignalId, StartedCall, UserId, UserRole,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const DOCTOR: UserId = UserId(3);
pub const PATIENT: UserId = UserId(9);

pub fn appointment() -> AppointmentContext {
    AppointmentContext {
        appointment_id: AppointmentId(123),
        doctor_user_id: Some(DOCTOR),
        patient_user_id: Some(PATIENT),
        doctor_name: Some("Sita Sharma".into()),
        patient_name: Some("Ram Thapa".into()),
        doctor_avatar: None,
        patient_avatar: None,
    }
}

pub fn incoming_call(call_id: i64, room: &str) -> IncomingCall {
    IncomingCall {
        call_id: CallId(call_id),
        room_id: RoomId::new(room),
        call_status: Some("ringing".into()),
        appointment: appointment(),
    }
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Default)]
pub struct FakeApi {
    pub incoming: Mutex<Vec<IncomingCall>>,
    pub fail_incoming: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_signal_sends: AtomicBool,
    pub statuses: Mutex<Vec<(RoomId, CallAction)>>,
    pub sent: Mutex<Vec<OutboundSignal>>,
    pub inbox: Mutex<Vec<InboundSignal>>,
    pub next_signal_id: AtomicUsize,
}

impl FakeApi {
    pub fn set_incoming(&self, calls: Vec<IncomingCall>) {
        *self.incoming.lock().unwrap() = calls;
    }

    /// Store a signal for this client
    pub fn deliver(&self, from: UserId, kind: &str, payload: Value) {
        let id = self.next_signal_id.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        self.inbox.lock().unwrap().push(InboundSignal {
            id: SignalId(id),
            from_user_id: Some(from),
            kind: kind.to_string(),
            payload,
            created_at: None,
        });
    }

    pub fn deliver_offer(&self) {
        self.deliver(DOCTOR, "offer", json!({ "type": "offer", "sdp": "remote-offer" }));
    }

    pub fn deliver_answer(&self) {
        self.deliver(PATIENT, "answer", json!({ "type": "answer", "sdp": "remote-answer" }));
    }

    pub fn deliver_candidate(&self, from: UserId, candidate: &str) {
        self.deliver(
            from,
            "candidate",
            json!({ "candidate": candidate, "sdpMid": "0", "sdpMLineIndex": 0 }),
        );
    }

    pub fn statuses(&self) -> Vec<CallAction> {
        self.statuses.lock().unwrap().iter().map(|(_, a)| *a).collect()
    }

    pub fn sent_kinds(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|s| s.kind.clone()).collect()
    }
}

#[async_trait]
impl ConsultationApi for FakeApi {
    async fn incoming_calls(&self) -> Result<Vec<IncomingCall>, ApiError> {
        if self.fail_incoming.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(self.incoming.lock().unwrap().clone())
    }

    async fn start_call(&self, _appointment_id: AppointmentId) -> Result<StartedCall, ApiError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ApiError::Rejected("Appointment not found".into()));
        }
        Ok(StartedCall {
            id: CallId(5),
            room_id: RoomId::new("room-5"),
            caller_user_id: Some(DOCTOR),
            callee_user_id: Some(PATIENT),
        })
    }

    async fn update_call_status(&self, room: &RoomId, action: CallAction) -> Result<(), ApiError> {
        self.statuses.lock().unwrap().push((room.clone(), action));
        Ok(())
    }

    async fn send_signal(&self, signal: &OutboundSignal) -> Result<Option<i64>, ApiError> {
        if self.fail_signal_sends.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 500,
                body: "boom".into(),
            });
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(signal.clone());
        Ok(Some(sent.len() as i64))
    }

    async fn poll_signals(
        &self,
        _room: &RoomId,
        since_id: i64,
    ) -> Result<Vec<InboundSignal>, ApiError> {
        Ok(self
            .inbox
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.id.0 > since_id)
            .cloned()
            .collect())
    }

    async fn doctor_appointments(&self) -> Result<Vec<AppointmentContext>, ApiError> {
        Ok(vec![appointment()])
    }
}

// ============================================================================
// Peer connections
// ============================================================================

#[derive(Default)]
pub struct FakeBackend {
    pub log: Mutex<Vec<String>>,
}

impl FakeBackend {
    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl PeerBackend for FakeBackend {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.push(format!("track:{}", track.kind()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.push("offer".into());
        Ok(SessionDescription::offer("local-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.push("answer".into());
        Ok(SessionDescription::answer("local-answer"))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.push(format!("remote:{}", desc.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.push(format!("ice:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.push("close".into());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeers {
    pub backends: Mutex<Vec<Arc<FakeBackend>>>,
    pub events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
}

impl FakePeers {
    /// Log of the most recent connection
    pub fn log(&self) -> Vec<String> {
        self.backends
            .lock()
            .unwrap()
            .last()
            .map(|b| b.log.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn created(&self) -> usize {
        self.backends.lock().unwrap().len()
    }

    /// Report a callback from the most recent connection
    pub fn emit(&self, event: PeerEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl PeerFactory for FakePeers {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerBackend>, PeerError> {
        let backend = Arc::new(FakeBackend::default());
        self.backends.lock().unwrap().push(Arc::clone(&backend));
        *self.events.lock().unwrap() = Some(events);
        Ok(backend)
    }
}

// ============================================================================
// Devices and ringtone
// ============================================================================

#[derive(Default)]
pub struct FakeDevices {
    pub deny: AtomicBool,
    pub opened: AtomicUsize,
    /// How long opening the devices takes
    pub open_delay: Mutex<Duration>,
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::MediaUnavailable("permission denied".into()));
        }
        let delay = *self.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MediaStream::from_constraints(constraints))
    }
}

#[derive(Default)]
pub struct RecordingRinger {
    pub log: Mutex<Vec<String>>,
    pub playing: Mutex<Option<Ringtone>>,
}

impl RecordingRinger {
    pub fn playing(&self) -> Option<Ringtone> {
        *self.playing.lock().unwrap()
    }

    pub fn played(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl Ringer for RecordingRinger {
    fn play(&self, tone: Ringtone) {
        self.log.lock().unwrap().push(format!("play:{tone:?}"));
        *self.playing.lock().unwrap() = Some(tone);
    }

    fn stop(&self) {
        *self.playing.lock().unwrap() = None;
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn test_config() -> CallConfig {
    CallConfig {
        base_url: "http://backend.test".into(),
        incoming_poll_interval: Duration::from_secs(3),
        signal_poll_interval: Duration::from_millis(200),
        answer_timeout: Duration::from_secs(45),
        connect_timeout: Duration::from_secs(30),
        disconnect_grace: Duration::from_secs(5),
        signal_send_attempts: 3,
        missed_call_threshold: 2,
        ..CallConfig::default()
    }
}

pub struct Harness {
    pub manager: CallManager,
    pub api: Arc<FakeApi>,
    pub peers: Arc<FakePeers>,
    pub devices: Arc<FakeDevices>,
    pub ringer: Arc<RecordingRinger>,
    pub media: Arc<MediaSessionManager>,
    pub user: Arc<SharedUserSession>,
    pub poller: IncomingCallPoller,
    pub events: broadcast::Receiver<CallEvent>,
    pub media_events: broadcast::Receiver<MediaEvent>,
}

impl Harness {
    pub fn new(role: UserRole) -> Self {
        let id = match role {
            UserRole::Doctor => DOCTOR,
            UserRole::Patient => PATIENT,
        };
        let user = Arc::new(SharedUserSession::signed_in(CurrentUser {
            id,
            role,
            display_name: "Test User".into(),
        }));
        let api = Arc::new(FakeApi::default());
        let peers = Arc::new(FakePeers::default());
        let devices = Arc::new(FakeDevices::default());
        let ringer = Arc::new(RecordingRinger::default());
        let media = Arc::new(MediaSessionManager::new(devices.clone()));
        let config = test_config();

        let manager = CallManager::new(
            config.clone(),
            user.clone(),
            api.clone(),
            media.clone(),
            peers.clone(),
            ringer.clone(),
        );
        let poller = IncomingCallPoller::new(
            api.clone(),
            user.clone(),
            manager.clone(),
            config.incoming_poll_interval,
            config.missed_call_threshold,
        );
        let events = manager.subscribe_events();
        let media_events = media.subscribe_events();

        Self {
            manager,
            api,
            peers,
            devices,
            ringer,
            media,
            user,
            poller,
            events,
            media_events,
        }
    }

    pub fn doctor() -> Self {
        Self::new(UserRole::Doctor)
    }

    pub fn patient() -> Self {
        Self::new(UserRole::Patient)
    }

    /// Wait until the manager reports `status`
    pub async fn wait_for(&self, status: CallStatus) {
        let mut rx = self.manager.watch();
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if rx.borrow_and_update().status == status {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "timed out waiting for {status:?}, status is {:?}",
                self.manager.status()
            )
        });
    }

    /// Let background polls and dispatch run
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    /// Events received so far
    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// StreamStopped events received so far
    pub fn streams_stopped(&mut self) -> usize {
        let mut stopped = 0;
        while let Ok(event) = self.media_events.try_recv() {
            if matches!(event, MediaEvent::StreamStopped { .. }) {
                stopped += 1;
            }
        }
        stopped
    }

    /// Ring an incoming call through the poller
    pub async fn ring(&self) {
        self.api.set_incoming(vec![incoming_call(1, "r1")]);
        self.poller.poll_once().await;
        assert_eq!(self.manager.status(), CallStatus::Ringing);
    }

    /// Doctor side: start a call and take it to in-call
    pub async fn connect_as_caller(&self) {
        self.manager
            .start_call(appointment(), MediaConstraints::video_call())
            .await
            .unwrap();
        self.api.deliver_answer();
        self.wait_for(CallStatus::Connecting).await;
        self.peers
            .emit(PeerEvent::StateChanged(rapireport_call_core::peer::PeerState::Connected));
        self.wait_for(CallStatus::InCall).await;
    }

    /// Patient side: ring, accept, answer the offer and connect
    pub async fn connect_as_callee(&self) {
        self.ring().await;
        self.manager
            .accept_call(MediaConstraints::video_call())
            .await
            .unwrap();
        self.api.deliver_offer();
        self.settle().await;
        self.peers
            .emit(PeerEvent::StateChanged(rapireport_call_core::peer::PeerState::Connected));
        self.wait_for(CallStatus::InCall).await;
    }
}
