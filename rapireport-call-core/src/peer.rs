//! Peer connection control
//!
//! [`PeerConnectionController`] sits between the call state machine and a
//! [`PeerBackend`]. It wires the local stream in, accumulates the remote
//! stream, and buffers ICE candidates that arrive before the remote
//! description they depend on.
//!
//! Backend callbacks (local candidates, connection state, remote tracks) are
//! delivered as [`PeerEvent`]s over the channel handed to the
//! [`PeerFactory`].

use crate::media::{LocalTrack, MediaStream};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::types::TrackKind;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    /// Connection could not be created
    #[error("Failed to create peer connection: {0}")]
    Create(String),

    /// Offer/answer generation failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Remote description rejected
    #[error("Invalid session description: {0}")]
    Description(String),

    /// Remote candidate rejected
    #[error("Invalid ICE candidate: {0}")]
    Candidate(String),

    /// Local track could not be added
    #[error("Failed to add track: {0}")]
    Track(String),

    /// Connection already closed
    #[error("Peer connection closed")]
    Closed,
}

/// Connection state as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// Not started
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media path up
    Connected,
    /// Temporarily lost, may recover
    Disconnected,
    /// Gave up
    Failed,
    /// Closed locally or remotely
    Closed,
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

/// A track received from the other participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrackInfo {
    /// Track id
    pub id: String,
    /// Track kind
    pub kind: TrackKind,
    /// Remote stream id
    pub stream_id: String,
}

/// Callback from a peer backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Local ICE candidate to trickle to the other side
    LocalCandidate(IceCandidate),
    /// Connection state change
    StateChanged(PeerState),
    /// Remote track arrived
    RemoteTrack(RemoteTrackInfo),
}

/// The other participant's media
///
/// Filled asynchronously as tracks arrive; renderers hold shared handles.
#[derive(Debug)]
pub struct RemoteStream {
    id: String,
    tracks: RwLock<Vec<RemoteTrackInfo>>,
}

impl RemoteStream {
    fn new() -> Self {
        Self {
            id: format!("remote-{}", uuid::Uuid::new_v4()),
            tracks: RwLock::new(Vec::new()),
        }
    }

    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tracks received so far
    #[must_use]
    pub fn tracks(&self) -> Vec<RemoteTrackInfo> {
        self.tracks.read().clone()
    }

    /// Whether a track of `kind` arrived
    #[must_use]
    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.read().iter().any(|t| t.kind == kind)
    }

    /// Whether no track arrived yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }

    fn add(&self, track: RemoteTrackInfo) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        tracks.push(track);
        true
    }
}

/// Peer connection operations used by the controller
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Add a local track to be sent
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Create an offer and set it as local description
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create an answer and set it as local description
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply the other side's description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Release transport resources
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer backends for new calls
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Create a backend reporting its callbacks to `events`
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerBackend>, PeerError>;
}

// ============================================================================
// webrtc backend
// ============================================================================

/// [`PeerFactory`] building `webrtc` peer connections
#[derive(Debug, Clone)]
pub struct RtcPeerFactory {
    ice_servers: Vec<String>,
}

impl RtcPeerFactory {
    /// Factory using the given STUN/TURN URLs
    #[must_use]
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerBackend>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Create(e.to_string()))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| PeerError::Create(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(|e| {
            tracing::error!("Failed to create peer connection: {}", e);
            PeerError::Create(e.to_string())
        })?);

        RtcPeerBackend::register_handlers(&pc, events);
        tracing::debug!(ice_servers = self.ice_servers.len(), "Created peer connection");

        Ok(Arc::new(RtcPeerBackend { pc }))
    }
}

/// [`PeerBackend`] over a `webrtc` [`RTCPeerConnection`]
pub struct RtcPeerBackend {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeerBackend {
    fn register_handlers(pc: &RTCPeerConnection, events: mpsc::UnboundedSender<PeerEvent>) {
        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {}", s);
            let _ = tx.send(PeerEvent::StateChanged(s.into()));
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                tracing::info!(track_id = %track.id(), %kind, "Received remote track");
                let _ = events.send(PeerEvent::RemoteTrack(RemoteTrackInfo {
                    id: track.id(),
                    kind,
                    stream_id: track.stream_id(),
                }));
            }
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl PeerBackend for RtcPeerBackend {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let rtc_track: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
        self.pc
            .add_track(rtc_track)
            .await
            .map_err(|e| PeerError::Track(e.to_string()))?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| PeerError::Negotiation(format!("set local description: {e}")))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::Negotiation(format!("set local description: {e}")))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let rtc = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpType::Rollback => {
                return Err(PeerError::Description("rollback is not supported".into()))
            }
        }
        .map_err(|e| PeerError::Description(e.to_string()))?;

        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| PeerError::Description(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| PeerError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::Create(format!("close: {e}")))
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Offer/answer and ICE handling for one call
pub struct PeerConnectionController {
    backend: Arc<dyn PeerBackend>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    remote_stream: Arc<RemoteStream>,
    closed: bool,
}

impl PeerConnectionController {
    /// Wrap a freshly created backend
    #[must_use]
    pub fn new(backend: Arc<dyn PeerBackend>) -> Self {
        Self {
            backend,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            remote_stream: Arc::new(RemoteStream::new()),
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Add every track of the local stream
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed or a track is refused
    pub async fn attach_local_stream(&mut self, stream: &MediaStream) -> Result<(), PeerError> {
        self.ensure_open()?;
        for track in stream.tracks() {
            self.backend.add_local_track(track).await?;
        }
        tracing::debug!(stream_id = %stream.id(), tracks = stream.tracks().len(), "Local stream attached");
        Ok(())
    }

    /// Create the caller's offer
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed or negotiation fails
    pub async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        self.backend.create_offer().await
    }

    /// Apply the caller's offer and produce the answer
    ///
    /// # Errors
    ///
    /// Returns error if the offer is rejected or no answer can be created
    pub async fn apply_remote_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        self.set_remote_description(offer).await?;
        self.backend.create_answer().await
    }

    /// Apply the callee's answer
    ///
    /// Returns `false` when a remote description was already set and the
    /// answer was ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the answer is rejected
    pub async fn apply_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<bool, PeerError> {
        self.ensure_open()?;
        if self.remote_description_set {
            tracing::debug!("Ignoring duplicate answer");
            return Ok(false);
        }
        self.set_remote_description(answer).await?;
        Ok(true)
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        self.backend.set_remote_description(desc).await?;
        self.remote_description_set = true;

        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Applying buffered ICE candidates");
        }
        for candidate in pending {
            if let Err(e) = self.backend.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "Buffered ICE candidate rejected");
            }
        }
        Ok(())
    }

    /// Apply a remote candidate, buffering it until the remote description
    /// is set
    ///
    /// # Errors
    ///
    /// Returns error if the backend rejects the candidate
    pub async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.closed {
            tracing::trace!("Dropping ICE candidate for closed connection");
            return Ok(());
        }
        if !self.remote_description_set {
            tracing::trace!("Buffering ICE candidate until remote description is set");
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.backend.add_ice_candidate(candidate).await
    }

    /// Record a remote track, returning `true` if it was new
    pub fn on_remote_track(&self, track: RemoteTrackInfo) -> bool {
        self.remote_stream.add(track)
    }

    /// Shared handle to the remote stream
    #[must_use]
    pub fn remote_stream(&self) -> Arc<RemoteStream> {
        Arc::clone(&self.remote_stream)
    }

    /// Whether the remote description was applied
    #[must_use]
    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// Candidates waiting for the remote description
    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Whether `close` was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the connection; repeated calls are no-ops
    pub async fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.pending_candidates.clear();
        if let Err(e) = self.backend.close().await {
            tracing::warn!(error = %e, "Error closing peer connection");
        }
        tracing::debug!("Peer connection closed");
        true
    }
}
