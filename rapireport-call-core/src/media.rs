//! Local media management
//!
//! The [`MediaSessionManager`] owns the local camera/microphone stream for the
//! duration of a call. Other components only ever see shared read handles;
//! enabling, disabling and stopping tracks always goes through the manager.
//!
//! Device access sits behind the [`MediaDevices`] trait. The default
//! [`RtcMediaDevices`] hands out `webrtc` sample tracks (Opus audio, VP8
//! video) that a capture pipeline writes into.

use crate::types::{MediaConstraints, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Media-related errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// Camera or microphone denied or absent
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// Stream error
    #[error("Stream error: {0}")]
    StreamError(String),
}

/// Media events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaEvent {
    /// Stream started
    StreamStarted {
        /// Stream identifier
        stream_id: String,
    },
    /// Stream stopped
    StreamStopped {
        /// Stream identifier
        stream_id: String,
    },
    /// Track muted or unmuted
    TrackToggled {
        /// Track kind
        kind: TrackKind,
        /// New state
        enabled: bool,
    },
}

// ============================================================================
// Tracks and streams
// ============================================================================

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "".to_string(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "".to_string(),
            rtcp_feedback: vec![],
        },
    }
}

/// A local capture track
///
/// Muting keeps the track negotiated but drops the samples written to it.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtc_track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    /// Create an enabled track belonging to `stream_id`
    #[must_use]
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let id = format!("{kind}-{stream_id}");
        let codec = codec_for(kind);
        tracing::debug!(track_id = %id, codec = %codec.mime_type, clock_rate = codec.clock_rate, "Creating local track");
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtc_track,
        }
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Whether samples are currently forwarded
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether the track was stopped
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Underlying `webrtc` track, added to the peer connection
    #[must_use]
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc_track)
    }

    /// Forward a captured sample
    ///
    /// Returns `false` when the sample was dropped because the track is muted
    /// or stopped.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying track rejects the sample
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, MediaError> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        self.rtc_track
            .write_sample(sample)
            .await
            .map_err(|e| MediaError::StreamError(e.to_string()))?;
        Ok(true)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }
}

/// Local media stream: one track per requested kind
#[derive(Debug)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl MediaStream {
    /// Build a stream with a fresh track for each kind in `constraints`
    #[must_use]
    pub fn from_constraints(constraints: MediaConstraints) -> Self {
        let id = format!("local-{}", uuid::Uuid::new_v4());
        let tracks = constraints
            .kinds()
            .into_iter()
            .map(|kind| Arc::new(LocalTrack::new(kind, &id)))
            .collect();
        Self { id, tracks }
    }

    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    #[must_use]
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// First track of `kind`
    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Whether every track was stopped
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }

    fn stop(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// Camera and microphone state of the current call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMediaState {
    /// Video track present and enabled
    pub camera_enabled: bool,
    /// Audio track present and enabled
    pub mic_enabled: bool,
    /// A local stream is held
    pub has_stream: bool,
}

// ============================================================================
// Devices
// ============================================================================

/// Access to capture devices
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open a stream matching `constraints`
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::MediaUnavailable`] when access is denied or a
    /// requested device is missing
    async fn open(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError>;
}

/// [`MediaDevices`] backed by `webrtc` sample tracks
#[derive(Debug, Clone)]
pub struct RtcMediaDevices {
    available: Vec<TrackKind>,
}

impl RtcMediaDevices {
    /// Devices with both camera and microphone present
    #[must_use]
    pub fn new() -> Self {
        Self {
            available: vec![TrackKind::Audio, TrackKind::Video],
        }
    }

    /// Devices limited to `available` kinds
    #[must_use]
    pub fn with_available(available: Vec<TrackKind>) -> Self {
        Self { available }
    }
}

impl Default for RtcMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for RtcMediaDevices {
    async fn open(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        let requested = constraints.kinds();
        if requested.is_empty() {
            return Err(MediaError::MediaUnavailable(
                "no audio or video requested".to_string(),
            ));
        }
        if let Some(missing) = requested.iter().find(|k| !self.available.contains(k)) {
            return Err(MediaError::MediaUnavailable(format!("no {missing} device")));
        }
        Ok(MediaStream::from_constraints(constraints))
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Owner of the local media stream
pub struct MediaSessionManager {
    devices: Arc<dyn MediaDevices>,
    local: Mutex<Option<Arc<MediaStream>>>,
    event_sender: broadcast::Sender<MediaEvent>,
}

impl MediaSessionManager {
    /// Create new media session manager
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices,
            local: Mutex::new(None),
            event_sender,
        }
    }

    /// Acquire the local stream
    ///
    /// A stream that is already held is returned as is.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::MediaUnavailable`] on denial or missing devices
    #[tracing::instrument(skip(self))]
    pub async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<MediaStream>, MediaError> {
        if let Some(existing) = self.local_stream() {
            tracing::debug!(stream_id = %existing.id(), "Local stream already acquired");
            return Ok(existing);
        }

        let stream = Arc::new(self.devices.open(constraints).await.map_err(|e| {
            tracing::warn!(error = %e, "Failed to acquire local media");
            e
        })?);

        // A concurrent acquire may have won while devices were opening
        {
            let mut local = self.local.lock();
            if let Some(existing) = local.as_ref() {
                stream.stop();
                return Ok(Arc::clone(existing));
            }
            *local = Some(Arc::clone(&stream));
        }

        tracing::info!(stream_id = %stream.id(), tracks = stream.tracks().len(), "Local media acquired");
        let _ = self.event_sender.send(MediaEvent::StreamStarted {
            stream_id: stream.id().to_string(),
        });
        Ok(stream)
    }

    /// Currently held local stream
    #[must_use]
    pub fn local_stream(&self) -> Option<Arc<MediaStream>> {
        self.local.lock().clone()
    }

    /// Enable or disable the track of `kind`
    ///
    /// Returns `false` when no such track is held.
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let Some(stream) = self.local_stream() else {
            return false;
        };
        let Some(track) = stream.track(kind) else {
            return false;
        };
        if track.is_enabled() != enabled {
            track.set_enabled(enabled);
            tracing::debug!(track_id = %track.id(), enabled, "Track toggled");
            let _ = self
                .event_sender
                .send(MediaEvent::TrackToggled { kind, enabled });
        }
        true
    }

    /// Flip the track of `kind`, returning the new state
    pub fn toggle_track(&self, kind: TrackKind) -> Option<bool> {
        let enabled = self.local_stream()?.track(kind)?.is_enabled();
        self.set_track_enabled(kind, !enabled);
        Some(!enabled)
    }

    /// Camera/mic flags of the held stream
    #[must_use]
    pub fn state(&self) -> LocalMediaState {
        match self.local_stream() {
            Some(stream) => LocalMediaState {
                camera_enabled: stream
                    .track(TrackKind::Video)
                    .is_some_and(|t| t.is_enabled()),
                mic_enabled: stream
                    .track(TrackKind::Audio)
                    .is_some_and(|t| t.is_enabled()),
                has_stream: true,
            },
            None => LocalMediaState::default(),
        }
    }

    /// Stop all tracks and drop the stream
    ///
    /// Returns `true` if a stream was released; repeated calls are no-ops.
    pub fn release(&self) -> bool {
        let Some(stream) = self.local.lock().take() else {
            return false;
        };
        let stopped = stream.stop();
        tracing::info!(stream_id = %stream.id(), stopped_tracks = stopped, "Local media released");
        let _ = self.event_sender.send(MediaEvent::StreamStopped {
            stream_id: stream.id().to_string(),
        });
        true
    }

    /// Subscribe to media events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_sender.subscribe()
    }
}

impl Drop for MediaSessionManager {
    fn drop(&mut self) {
        self.release();
    }
}
