//! Consultation call types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Integer ids arrive either as JSON numbers or as numeric strings, depending
/// on how the backend driver typed the column.
#[derive(Deserialize)]
#[serde(untagged)]
enum LenientId {
    Number(i64),
    Text(String),
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match LenientId::deserialize(deserializer)? {
        LenientId::Number(n) => Ok(n),
        LenientId::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid numeric id: {s:?}"))),
    }
}

/// Server-assigned identifier of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CallId(pub i64);

impl<'de> Deserialize<'de> for CallId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        lenient_i64(deserializer).map(Self)
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Portal user identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        lenient_i64(deserializer).map(Self)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned id of a stored signal, strictly increasing per room
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SignalId(pub i64);

impl<'de> Deserialize<'de> for SignalId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        lenient_i64(deserializer).map(Self)
    }
}

/// Signaling channel key shared by both participants of a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    /// Create a room id from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw room key
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of the signed-in portal user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    /// Consulting doctor, the only role allowed to start calls
    Doctor,
    /// Patient attending the consultation
    Patient,
}

/// The authenticated user the call subsystem acts for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    /// User id
    pub id: UserId,
    /// Portal role
    pub role: UserRole,
    /// Name shown in logs and the terminal harness
    pub display_name: String,
}

/// Booking context a call belongs to
///
/// Field names follow the backend's appointment and incoming-call rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentContext {
    /// Appointment id
    #[serde(alias = "id")]
    pub appointment_id: AppointmentId,
    /// Doctor's user id, absent in doctor-scoped listings
    #[serde(default)]
    pub doctor_user_id: Option<UserId>,
    /// Patient's user id
    #[serde(default)]
    pub patient_user_id: Option<UserId>,
    /// Doctor display name
    #[serde(default)]
    pub doctor_name: Option<String>,
    /// Patient display name
    #[serde(default)]
    pub patient_name: Option<String>,
    /// Doctor avatar URL
    #[serde(default, alias = "doctor_profile_pic")]
    pub doctor_avatar: Option<String>,
    /// Patient avatar URL
    #[serde(default, alias = "patient_profile_pic")]
    pub patient_avatar: Option<String>,
}

/// Appointment identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AppointmentId(pub i64);

impl<'de> Deserialize<'de> for AppointmentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        lenient_i64(deserializer).map(Self)
    }
}

impl std::fmt::Display for AppointmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AppointmentContext {
    /// Name of the other participant as seen by a user with `role`
    ///
    /// Doctor names get a "Dr." prefix unless they already carry one.
    #[must_use]
    pub fn other_party_name(&self, role: UserRole) -> String {
        match role {
            UserRole::Doctor => self
                .patient_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "Patient".to_string()),
            UserRole::Patient => {
                let name = self
                    .doctor_name
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| "Doctor".to_string());
                let lower = name.to_lowercase();
                if name == "Doctor" || lower.starts_with("dr.") || lower.starts_with("dr ") {
                    name
                } else {
                    format!("Dr. {name}")
                }
            }
        }
    }

    /// Avatar of the other participant as seen by a user with `role`
    #[must_use]
    pub fn other_party_avatar(&self, role: UserRole) -> Option<&str> {
        match role {
            UserRole::Doctor => self.patient_avatar.as_deref(),
            UserRole::Patient => self.doctor_avatar.as_deref(),
        }
    }

    /// User id that signals from a user with `role` are addressed to
    #[must_use]
    pub fn counterpart(&self, role: UserRole) -> Option<UserId> {
        match role {
            UserRole::Doctor => self.patient_user_id,
            UserRole::Patient => self.doctor_user_id,
        }
    }
}

/// A ringing call addressed to the current user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCall {
    /// Call id
    pub call_id: CallId,
    /// Signaling room
    pub room_id: RoomId,
    /// Server-side call status, `ringing` for listed calls
    #[serde(default)]
    pub call_status: Option<String>,
    /// Booking context
    #[serde(flatten)]
    pub appointment: AppointmentContext,
}

/// Call created by the start endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedCall {
    /// Call id
    #[serde(alias = "call_id")]
    pub id: CallId,
    /// Signaling room
    pub room_id: RoomId,
    /// Caller (the doctor)
    #[serde(default)]
    pub caller_user_id: Option<UserId>,
    /// Callee (the patient)
    #[serde(default)]
    pub callee_user_id: Option<UserId>,
}

/// Local media constraints for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture microphone audio
    pub audio: bool,
    /// Capture camera video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    #[must_use]
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    #[must_use]
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Track kinds requested by these constraints
    #[must_use]
    pub fn kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::new();
        if self.audio {
            kinds.push(TrackKind::Audio);
        }
        if self.video {
            kinds.push(TrackKind::Video);
        }
        kinds
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Kind of media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone / remote audio
    Audio,
    /// Camera / remote video
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Call state
///
/// ```text
///   Idle ──► Ringing (callee) ──┐
///    │                          ▼
///    └──► Initiating (caller) ► Connecting ► InCall ► Ending ► Idle
///
///   any active state ──► Failed ──► Idle
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    /// No call
    #[default]
    Idle,
    /// Incoming call waiting for the user to answer
    Ringing,
    /// Outgoing call waiting for the callee's answer
    Initiating,
    /// Offer/answer exchanged, media path being established
    Connecting,
    /// Media is flowing
    InCall,
    /// Teardown in progress
    Ending,
    /// Call failed; always followed by `Idle`
    Failed,
}

impl CallStatus {
    /// Whether a call exists in this state
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Whether the incoming-call poller should stay quiet in this state
    #[must_use]
    pub fn suppresses_incoming_poll(&self) -> bool {
        matches!(
            self,
            Self::Initiating | Self::Connecting | Self::InCall | Self::Ending
        )
    }

    /// Human readable status line
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Ringing => "Incoming call",
            Self::Initiating => "Calling...",
            Self::Connecting => "Connecting...",
            Self::InCall => "Connected",
            Self::Ending => "Ending...",
            Self::Failed => "Call failed",
        }
    }
}

/// How the call overlay is presented, independent of the call status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresentationMode {
    /// Nothing shown
    #[default]
    Hidden,
    /// Full-screen call modal
    Modal,
    /// Floating in-call widget
    Minimized,
}

/// The live or pending call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSession {
    /// Server-assigned call id
    pub call_id: CallId,
    /// Signaling room
    pub room_id: RoomId,
    /// Whether this client sends the offer
    pub is_caller: bool,
    /// Booking context
    pub appointment: AppointmentContext,
    /// User the signals are addressed to
    pub peer_user_id: Option<UserId>,
    /// Current status
    pub status: CallStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When media started flowing
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Session for a call this client initiated
    #[must_use]
    pub fn outgoing(started: &StartedCall, appointment: AppointmentContext) -> Self {
        let peer_user_id = started
            .callee_user_id
            .or_else(|| appointment.counterpart(UserRole::Doctor));
        Self {
            call_id: started.id,
            room_id: started.room_id.clone(),
            is_caller: true,
            appointment,
            peer_user_id,
            status: CallStatus::Initiating,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    /// Session for a call detected by the incoming poller
    #[must_use]
    pub fn incoming(call: &IncomingCall) -> Self {
        Self {
            call_id: call.call_id,
            room_id: call.room_id.clone(),
            is_caller: false,
            appointment: call.appointment.clone(),
            peer_user_id: call.appointment.counterpart(UserRole::Patient),
            status: CallStatus::Ringing,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    /// Time spent connected so far
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|start| Utc::now() - start)
    }
}

/// Short message for the user, the equivalent of a toast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserNotice {
    /// A new call is ringing
    IncomingCall {
        /// Caller display name
        from: String,
    },
    /// The caller hung up before the call was answered
    CallMissed,
    /// The other side ended the call
    CallEnded,
    /// A call was requested while another one is active
    AlreadyInCall,
    /// Camera or microphone could not be opened
    MediaDenied,
    /// Starting the call failed
    CouldNotStart(String),
    /// Connecting the call failed
    CouldNotConnect(String),
}

impl std::fmt::Display for UserNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncomingCall { from } => write!(f, "Incoming call from {from}"),
            Self::CallMissed => f.write_str("Call missed"),
            Self::CallEnded => f.write_str("Call ended"),
            Self::AlreadyInCall => f.write_str("Already in a call"),
            Self::MediaDenied => f.write_str("Camera/Mic permission denied"),
            Self::CouldNotStart(reason) => write!(f, "Could not start call: {reason}"),
            Self::CouldNotConnect(reason) => write!(f, "Could not connect call: {reason}"),
        }
    }
}

/// Call event for notifications
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Status transition
    StatusChanged {
        /// Call the transition belongs to, if one exists
        call_id: Option<CallId>,
        /// Previous status
        from: CallStatus,
        /// New status
        to: CallStatus,
    },
    /// Incoming call started ringing
    IncomingCall {
        /// The ringing call
        call: IncomingCall,
    },
    /// Ringing call vanished before it was answered
    Missed {
        /// Missed call
        call_id: CallId,
    },
    /// Remote media became available
    RemoteStreamReady {
        /// Call id
        call_id: CallId,
    },
    /// Call failed
    Failed {
        /// Call id, when the server had already assigned one
        call_id: Option<CallId>,
        /// Error description
        reason: String,
    },
    /// Call ended and all resources were released
    Ended {
        /// Call id
        call_id: Option<CallId>,
    },
    /// Message for the user
    Notice(UserNotice),
}
