//! Backend REST client
//!
//! Every consultation endpoint answers with a JSON envelope
//! `{"status": "success" | "error", "message": ..., ...}`; HTTP errors and
//! `"error"` envelopes both surface as [`ApiError`].

use crate::config::CallConfig;
use crate::types::{
    AppointmentContext, AppointmentId, IncomingCall, RoomId, SignalId, StartedCall, UserId,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

/// Backend API errors
#[derive(Error, Debug)]
pub enum ApiError {
    /// Network or protocol failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx HTTP status
    #[error("API error ({status}): {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Backend answered with `status: error`
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Response did not have the expected shape
    #[error("Invalid response: {0}")]
    Decode(String),

    /// Client could not be configured
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ApiError {
    /// Whether retrying the same request may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Rejected(_) | Self::Decode(_) | Self::Config(_) => false,
        }
    }
}

/// Status update posted for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallAction {
    /// Callee picked up
    Accept,
    /// Callee declined
    Reject,
    /// Either side hung up
    End,
}

/// Signal as posted to the signaling endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundSignal {
    /// Signaling room
    #[serde(rename = "roomId")]
    pub room_id: RoomId,
    /// Recipient
    #[serde(rename = "toUserId")]
    pub to_user_id: UserId,
    /// Message type (`offer`, `answer`, `candidate`, `end`)
    #[serde(rename = "type")]
    pub kind: String,
    /// Message payload, never `null`
    pub payload: Value,
}

/// Signal as returned by the signaling poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundSignal {
    /// Server-assigned, strictly increasing per room
    pub id: SignalId,
    /// Sender
    #[serde(default)]
    pub from_user_id: Option<UserId>,
    /// Message type
    #[serde(rename = "type")]
    pub kind: String,
    /// Message payload
    #[serde(default)]
    pub payload: Value,
    /// Server timestamp
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Deserialize)]
struct IncomingCallsBody {
    #[serde(default)]
    calls: Vec<IncomingCall>,
}

#[derive(Deserialize)]
struct StartCallBody {
    #[serde(default)]
    call: Option<StartedCall>,
}

#[derive(Deserialize)]
struct SignalRef {
    id: SignalId,
}

#[derive(Deserialize)]
struct SendSignalBody {
    #[serde(default)]
    signal: Option<SignalRef>,
}

#[derive(Deserialize)]
struct SignalsBody {
    #[serde(default)]
    signals: Vec<InboundSignal>,
}

#[derive(Deserialize)]
struct AppointmentsBody {
    #[serde(default)]
    appointments: Vec<AppointmentContext>,
}

/// Consultation endpoints consumed by the call subsystem
///
/// Implemented over HTTP by [`HttpConsultationApi`]; tests substitute
/// in-memory implementations.
#[async_trait]
pub trait ConsultationApi: Send + Sync {
    /// Ringing calls addressed to the current user
    async fn incoming_calls(&self) -> Result<Vec<IncomingCall>, ApiError>;

    /// Create a ringing call for an appointment (doctors only)
    async fn start_call(&self, appointment_id: AppointmentId) -> Result<StartedCall, ApiError>;

    /// Post a status change for the call in `room`
    async fn update_call_status(&self, room: &RoomId, action: CallAction) -> Result<(), ApiError>;

    /// Store a signal for the other participant, returning its id when reported
    async fn send_signal(&self, signal: &OutboundSignal) -> Result<Option<i64>, ApiError>;

    /// Signals addressed to the current user with an id above `since_id`
    async fn poll_signals(&self, room: &RoomId, since_id: i64)
        -> Result<Vec<InboundSignal>, ApiError>;

    /// Appointments of the signed-in doctor
    async fn doctor_appointments(&self) -> Result<Vec<AppointmentContext>, ApiError>;
}

/// [`ConsultationApi`] over the PHP backend
pub struct HttpConsultationApi {
    client: Client,
    config: CallConfig,
}

impl HttpConsultationApi {
    /// Build a client from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the session cookie is not a valid header value or the
    /// HTTP client cannot be built
    pub fn new(config: &CallConfig) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(cookie) = &config.session_cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| ApiError::Config(format!("invalid session cookie: {e}")))?;
            headers.insert(COOKIE, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Base URL requests are sent to
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = self.config.url(path);
        debug!("Making request to {}", url);
        let response = self.client.get(&url).query(query).send().await?;
        Self::decode(response).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.config.url(path);
        debug!("Posting to {}", url);
        let response = self.client.post(&url).json(body).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            error!("API error ({}): {}", status, text);
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let value: Value =
            serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))?;

        match value.get("status").and_then(Value::as_str) {
            Some("success") => {}
            _ => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                debug!("Backend rejected request: {}", message);
                return Err(ApiError::Rejected(message));
            }
        }

        serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ConsultationApi for HttpConsultationApi {
    async fn incoming_calls(&self) -> Result<Vec<IncomingCall>, ApiError> {
        let body: IncomingCallsBody = self.get(&self.config.endpoints.incoming_calls, &[]).await?;
        Ok(body.calls)
    }

    async fn start_call(&self, appointment_id: AppointmentId) -> Result<StartedCall, ApiError> {
        let body: StartCallBody = self
            .post(
                &self.config.endpoints.call_start,
                &serde_json::json!({ "appointment_id": appointment_id }),
            )
            .await?;
        body.call
            .ok_or_else(|| ApiError::Decode("start response has no call".to_string()))
    }

    async fn update_call_status(&self, room: &RoomId, action: CallAction) -> Result<(), ApiError> {
        let _: serde::de::IgnoredAny = self
            .post(
                &self.config.endpoints.call_status,
                &serde_json::json!({ "roomId": room, "action": action }),
            )
            .await?;
        Ok(())
    }

    async fn send_signal(&self, signal: &OutboundSignal) -> Result<Option<i64>, ApiError> {
        let body: SendSignalBody = self.post(&self.config.endpoints.call_signal, signal).await?;
        Ok(body.signal.map(|s| s.id.0))
    }

    async fn poll_signals(
        &self,
        room: &RoomId,
        since_id: i64,
    ) -> Result<Vec<InboundSignal>, ApiError> {
        let body: SignalsBody = self
            .get(
                &self.config.endpoints.call_signal,
                &[
                    ("roomId", room.as_str().to_string()),
                    ("sinceId", since_id.to_string()),
                ],
            )
            .await?;
        Ok(body.signals)
    }

    async fn doctor_appointments(&self) -> Result<Vec<AppointmentContext>, ApiError> {
        let body: AppointmentsBody = self
            .get(&self.config.endpoints.doctor_appointments, &[])
            .await?;
        Ok(body.appointments)
    }
}
