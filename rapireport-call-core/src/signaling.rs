//! Call signaling over the backend's polled signal store
//!
//! Offers, answers and ICE candidates are posted to the signaling endpoint
//! addressed to the other participant and picked up by their poll loop. Each
//! stored signal gets a strictly increasing id; the poll loop keeps the
//! highest id seen as its cursor.

use crate::api::{ApiError, ConsultationApi, InboundSignal, OutboundSignal};
use crate::task::ScopedTask;
use crate::types::{RoomId, SignalId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, MissedTickBehavior};

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Payload does not match the message type
    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload {
        /// Message type
        kind: String,
        /// Decode error
        reason: String,
    },

    /// Message type not understood by this client
    #[error("Unknown signal type: {0}")]
    UnknownType(String),

    /// Session has no user to address signals to
    #[error("No recipient for signals in room {0}")]
    MissingRecipient(RoomId),

    /// Transport error
    #[error("Transport error after {attempts} attempt(s): {source}")]
    Transport {
        /// Attempts made
        attempts: u32,
        /// Last error
        #[source]
        source: ApiError,
    },
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Provisional answer
    Pranswer,
    /// Answer
    Answer,
    /// Rollback
    Rollback,
}

/// Session description in the browser's JSON shape `{type, sdp}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// SDP media id
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate without media line information
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Signaling message exchanged through a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Caller's offer
    Offer(SessionDescription),
    /// Callee's answer
    Answer(SessionDescription),
    /// Trickled ICE candidate
    Candidate(IceCandidate),
    /// Hang-up
    End,
}

impl SignalingMessage {
    /// Wire type name
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate(_) => "candidate",
            Self::End => "end",
        }
    }

    /// Wire payload; the backend refuses `null`, so `End` carries `{}`
    #[must_use]
    pub fn payload(&self) -> Value {
        let encoded = match self {
            Self::Offer(desc) | Self::Answer(desc) => serde_json::to_value(desc),
            Self::Candidate(candidate) => serde_json::to_value(candidate),
            Self::End => Ok(Value::Object(serde_json::Map::new())),
        };
        encoded.unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
    }

    /// Decode a stored signal
    ///
    /// # Errors
    ///
    /// Returns error for unknown types or payloads that do not match the type
    pub fn from_wire(kind: &str, payload: Value) -> Result<Self, SignalingError> {
        let invalid = |e: serde_json::Error| SignalingError::InvalidPayload {
            kind: kind.to_string(),
            reason: e.to_string(),
        };
        match kind {
            "offer" => serde_json::from_value(payload).map(Self::Offer).map_err(invalid),
            "answer" => serde_json::from_value(payload).map(Self::Answer).map_err(invalid),
            "candidate" | "ice-candidate" => serde_json::from_value(payload)
                .map(Self::Candidate)
                .map_err(invalid),
            "end" => Ok(Self::End),
            other => Err(SignalingError::UnknownType(other.to_string())),
        }
    }
}

/// A decoded signal delivered by the poll loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedSignal {
    /// Server id
    pub id: SignalId,
    /// Sender
    pub from: Option<UserId>,
    /// Message
    pub message: SignalingMessage,
}

/// Result of one signal poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalBatch {
    /// Decoded signals in id order
    pub signals: Vec<ReceivedSignal>,
    /// Highest id seen, including signals that failed to decode
    pub cursor: SignalId,
}

/// Lower bound on the poll period
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Delay unit between send retries
const RETRY_BACKOFF_UNIT: Duration = Duration::from_millis(100);

/// Signaling client with bounded send retries
#[derive(Clone)]
pub struct SignalingClient {
    api: Arc<dyn ConsultationApi>,
    send_attempts: u32,
}

impl SignalingClient {
    /// Create new signaling client
    #[must_use]
    pub fn new(api: Arc<dyn ConsultationApi>, send_attempts: u32) -> Self {
        Self {
            api,
            send_attempts: send_attempts.max(1),
        }
    }

    /// Send a signaling message to a peer
    ///
    /// Transient failures are retried with a linear backoff up to the
    /// configured number of attempts.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Transport`] once attempts are exhausted or
    /// the failure is not transient
    #[tracing::instrument(skip(self, message), fields(room = %room, to = %to, message_type = message.kind()))]
    pub async fn send(
        &self,
        room: &RoomId,
        to: UserId,
        message: &SignalingMessage,
    ) -> Result<(), SignalingError> {
        let signal = OutboundSignal {
            room_id: room.clone(),
            to_user_id: to,
            kind: message.kind().to_string(),
            payload: message.payload(),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.api.send_signal(&signal).await {
                Ok(id) => {
                    tracing::debug!(signal_id = ?id, "Signal sent");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.send_attempts => {
                    let backoff = RETRY_BACKOFF_UNIT * attempt.min(10);
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis(),
                        error = %e,
                        "Signal send failed, retrying"
                    );
                    sleep(backoff).await;
                }
                Err(source) => {
                    return Err(SignalingError::Transport {
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    /// Send the caller's offer
    ///
    /// # Errors
    ///
    /// See [`SignalingClient::send`]
    pub async fn send_offer(
        &self,
        room: &RoomId,
        to: UserId,
        offer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.send(room, to, &SignalingMessage::Offer(offer)).await
    }

    /// Send the callee's answer
    ///
    /// # Errors
    ///
    /// See [`SignalingClient::send`]
    pub async fn send_answer(
        &self,
        room: &RoomId,
        to: UserId,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.send(room, to, &SignalingMessage::Answer(answer)).await
    }

    /// Send a local ICE candidate
    ///
    /// # Errors
    ///
    /// See [`SignalingClient::send`]
    pub async fn send_ice_candidate(
        &self,
        room: &RoomId,
        to: UserId,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.send(room, to, &SignalingMessage::Candidate(candidate))
            .await
    }

    /// Tell the peer the call is over
    ///
    /// # Errors
    ///
    /// See [`SignalingClient::send`]
    pub async fn send_end(&self, room: &RoomId, to: UserId) -> Result<(), SignalingError> {
        self.send(room, to, &SignalingMessage::End).await
    }

    /// Fetch signals newer than `since`
    ///
    /// Signals that fail to decode are skipped with a warning but still
    /// advance the cursor.
    ///
    /// # Errors
    ///
    /// Returns error if the poll request fails
    pub async fn poll_signals(
        &self,
        room: &RoomId,
        since: SignalId,
    ) -> Result<SignalBatch, SignalingError> {
        let mut raw: Vec<InboundSignal> = self
            .api
            .poll_signals(room, since.0)
            .await
            .map_err(|source| SignalingError::Transport {
                attempts: 1,
                source,
            })?;
        raw.sort_by_key(|s| s.id);

        let mut batch = SignalBatch {
            signals: Vec::with_capacity(raw.len()),
            cursor: since,
        };
        for signal in raw {
            if signal.id <= since {
                continue;
            }
            batch.cursor = batch.cursor.max(signal.id);
            match SignalingMessage::from_wire(&signal.kind, signal.payload) {
                Ok(message) => batch.signals.push(ReceivedSignal {
                    id: signal.id,
                    from: signal.from_user_id,
                    message,
                }),
                Err(e) => {
                    tracing::warn!(signal_id = signal.id.0, error = %e, "Skipping undecodable signal");
                }
            }
        }
        Ok(batch)
    }

    /// Start the poll loop for `room`
    ///
    /// Decoded signals are forwarded to `sink` in id order. Poll failures are
    /// logged and retried on the next tick. The loop stops when the handle is
    /// cancelled or dropped, or when `sink` is closed.
    #[must_use]
    pub fn spawn_poll_loop(
        &self,
        room: RoomId,
        interval: Duration,
        sink: mpsc::UnboundedSender<ReceivedSignal>,
    ) -> SignalPollHandle {
        let client = self.clone();
        let period = interval.max(MIN_POLL_INTERVAL);
        let loop_room = room.clone();

        let task = ScopedTask::spawn("signal-poll", async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cursor = SignalId::default();
            let mut error_count: u32 = 0;

            loop {
                tick.tick().await;
                match client.poll_signals(&loop_room, cursor).await {
                    Ok(batch) => {
                        error_count = 0;
                        cursor = batch.cursor;
                        for signal in batch.signals {
                            tracing::debug!(
                                room = %loop_room,
                                signal_id = signal.id.0,
                                message_type = signal.message.kind(),
                                "Received signaling message"
                            );
                            if sink.send(signal).is_err() {
                                tracing::debug!(room = %loop_room, "Signal sink closed, stopping poll");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        error_count += 1;
                        tracing::warn!(room = %loop_room, error_count, error = %e, "Failed to poll call signals");
                    }
                }
            }
        });

        tracing::debug!(room = %room, period_ms = period.as_millis(), "Signal poll started");
        SignalPollHandle { room, task }
    }
}

/// Running signal poll loop for one call
#[derive(Debug)]
pub struct SignalPollHandle {
    room: RoomId,
    task: ScopedTask,
}

impl SignalPollHandle {
    /// Stop polling; repeated calls are no-ops
    pub fn cancel(&mut self) -> bool {
        let cancelled = self.task.cancel();
        if cancelled {
            tracing::debug!(room = %self.room, "Signal poll stopped");
        }
        cancelled
    }

    /// Whether the loop is still running
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.is_running()
    }

    /// Room being polled
    #[must_use]
    pub fn room(&self) -> &RoomId {
        &self.room
    }
}
