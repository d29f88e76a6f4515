//! Consultation call service orchestration

use crate::api::{ApiError, ConsultationApi, HttpConsultationApi};
use crate::call::{CallError, CallManager, CallSnapshot};
use crate::config::CallConfig;
use crate::context::{NoopRinger, Ringer, SharedUserSession, UserSession};
use crate::media::{MediaDevices, MediaEvent, MediaSessionManager, RtcMediaDevices};
use crate::peer::{PeerFactory, RtcPeerFactory};
use crate::poller::{IncomingCallPoller, PollOutcome};
use crate::task::ScopedTask;
use crate::types::{
    AppointmentContext, AppointmentId, CallEvent, CallSession, CallStatus, MediaConstraints,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Call error
    #[error("Call error: {0}")]
    CallError(#[from] CallError),

    /// Backend error outside a call
    #[error("Backend error: {0}")]
    Backend(#[from] ApiError),

    /// Appointment not in the doctor's list
    #[error("Appointment {0} not found")]
    UnknownAppointment(AppointmentId),
}

/// Top-level service events
#[derive(Debug, Clone)]
pub enum ConsultationEvent {
    /// Call event
    Call(CallEvent),
    /// Local media event
    Media(MediaEvent),
}

/// Consultation call service
///
/// Wires the backend client, media, peer factory and call manager together
/// and runs the incoming call poller.
pub struct ConsultationCallService {
    config: CallConfig,
    api: Arc<dyn ConsultationApi>,
    user: Arc<dyn UserSession>,
    calls: CallManager,
    poller: Arc<IncomingCallPoller>,
    tasks: Mutex<Vec<ScopedTask>>,
    event_sender: broadcast::Sender<ConsultationEvent>,
}

impl ConsultationCallService {
    /// Create a builder
    #[must_use]
    pub fn builder(config: CallConfig) -> ConsultationCallServiceBuilder {
        ConsultationCallServiceBuilder::new(config)
    }

    /// Start polling for incoming calls
    ///
    /// Calling `start` on a running service is a no-op.
    #[tracing::instrument(skip(self))]
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tracing::info!(base_url = %self.config.base_url, "Starting consultation call service");

        tasks.push(Arc::clone(&self.poller).spawn());

        let mut call_events = self.calls.subscribe_events();
        let mut media_events = self.calls.media().subscribe_events();
        let sender = self.event_sender.clone();
        tasks.push(ScopedTask::spawn("event-forwarder", async move {
            loop {
                let event = tokio::select! {
                    event = call_events.recv() => match event {
                        Ok(event) => ConsultationEvent::Call(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Call event subscriber lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = media_events.recv() => match event {
                        Ok(event) => ConsultationEvent::Media(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Media event subscriber lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                let _ = sender.send(event);
            }
        }));
    }

    /// Stop background polling and end any call
    pub async fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if self.calls.end_call(true).await {
            tracing::info!("Ended active call on shutdown");
        }
        drop(tasks);
        tracing::info!("Consultation call service stopped");
    }

    /// Whether the background tasks are running
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// Poll for incoming calls once, outside the background loop
    pub async fn poll_incoming(&self) -> PollOutcome {
        self.poller.poll_once().await
    }

    /// Appointments of the signed-in doctor
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn appointments(&self) -> Result<Vec<AppointmentContext>, ServiceError> {
        Ok(self.api.doctor_appointments().await?)
    }

    /// Look up one of the signed-in doctor's appointments
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the appointment is not listed
    pub async fn find_appointment(
        &self,
        appointment_id: AppointmentId,
    ) -> Result<AppointmentContext, ServiceError> {
        self.appointments()
            .await?
            .into_iter()
            .find(|a| a.appointment_id == appointment_id)
            .ok_or(ServiceError::UnknownAppointment(appointment_id))
    }

    /// Start a call for one of the doctor's appointments
    ///
    /// # Errors
    ///
    /// Returns error if the appointment is unknown or the call cannot start
    #[tracing::instrument(skip(self), fields(appointment_id = %appointment_id))]
    pub async fn start_call(
        &self,
        appointment_id: AppointmentId,
        constraints: MediaConstraints,
    ) -> Result<CallSession, ServiceError> {
        let appointment = self.find_appointment(appointment_id).await?;
        Ok(self.calls.start_call(appointment, constraints).await?)
    }

    /// Accept the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be accepted
    pub async fn accept_call(&self, constraints: MediaConstraints) -> Result<(), ServiceError> {
        Ok(self.calls.accept_call(constraints).await?)
    }

    /// Decline the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing
    pub async fn decline_call(&self) -> Result<(), ServiceError> {
        Ok(self.calls.decline_call().await?)
    }

    /// Hang up, telling the other side
    pub async fn end_call(&self) -> bool {
        self.calls.end_call(true).await
    }

    /// Call manager driving the session
    #[must_use]
    pub fn calls(&self) -> &CallManager {
        &self.calls
    }

    /// Signed-in user accessor
    #[must_use]
    pub fn user(&self) -> &Arc<dyn UserSession> {
        &self.user
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> CallStatus {
        self.calls.status()
    }

    /// Latest snapshot
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.calls.snapshot()
    }

    /// Watch snapshots
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.calls.watch()
    }

    /// Subscribe to events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConsultationEvent> {
        self.event_sender.subscribe()
    }
}

/// Consultation call service builder
///
/// Defaults to the HTTP backend, `webrtc` devices and peer connections, a
/// silent ringer and a signed-out user session.
pub struct ConsultationCallServiceBuilder {
    config: CallConfig,
    api: Option<Arc<dyn ConsultationApi>>,
    user: Option<Arc<dyn UserSession>>,
    devices: Option<Arc<dyn MediaDevices>>,
    peers: Option<Arc<dyn PeerFactory>>,
    ringer: Option<Arc<dyn Ringer>>,
}

impl ConsultationCallServiceBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(config: CallConfig) -> Self {
        Self {
            config,
            api: None,
            user: None,
            devices: None,
            peers: None,
            ringer: None,
        }
    }

    /// Use a custom backend client
    #[must_use]
    pub fn with_api(mut self, api: Arc<dyn ConsultationApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Set the user session accessor
    #[must_use]
    pub fn with_user_session(mut self, user: Arc<dyn UserSession>) -> Self {
        self.user = Some(user);
        self
    }

    /// Use custom capture devices
    #[must_use]
    pub fn with_media_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Use a custom peer connection factory
    #[must_use]
    pub fn with_peer_factory(mut self, peers: Arc<dyn PeerFactory>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Set ringtone playback
    #[must_use]
    pub fn with_ringer(mut self, ringer: Arc<dyn Ringer>) -> Self {
        self.ringer = Some(ringer);
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created
    pub fn build(self) -> Result<ConsultationCallService, ServiceError> {
        let api: Arc<dyn ConsultationApi> = match self.api {
            Some(api) => api,
            None => Arc::new(
                HttpConsultationApi::new(&self.config)
                    .map_err(|e| ServiceError::InitError(e.to_string()))?,
            ),
        };
        let user = self
            .user
            .unwrap_or_else(|| Arc::new(SharedUserSession::default()));
        let devices = self
            .devices
            .unwrap_or_else(|| Arc::new(RtcMediaDevices::new()));
        let peers = self
            .peers
            .unwrap_or_else(|| Arc::new(RtcPeerFactory::new(self.config.ice_servers.clone())));
        let ringer = self.ringer.unwrap_or_else(|| Arc::new(NoopRinger));

        let media = Arc::new(MediaSessionManager::new(devices));
        let calls = CallManager::new(
            self.config.clone(),
            Arc::clone(&user),
            Arc::clone(&api),
            media,
            peers,
            ringer,
        );
        let poller = Arc::new(IncomingCallPoller::new(
            Arc::clone(&api),
            Arc::clone(&user),
            calls.clone(),
            self.config.incoming_poll_interval,
            self.config.missed_call_threshold,
        ));
        let (event_sender, _) = broadcast::channel(1000);

        Ok(ConsultationCallService {
            config: self.config,
            api,
            user,
            calls,
            poller,
            tasks: Mutex::new(Vec::new()),
            event_sender,
        })
    }
}
