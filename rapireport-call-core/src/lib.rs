//! RapiReport consultation calls
//!
//! Live audio/video consultations between a doctor and a patient over
//! WebRTC, with signaling carried by the portal's PHP backend:
//!
//! - **HTTP-polled signaling**: offer, answer, ICE candidates and hang-up
//!   are stored by the backend and polled by the other participant
//! - **Call state machine**: one call per client, driven from ringing or
//!   initiating through connecting to in-call and back to idle
//! - **Incoming call detection**: a background poller rings the callee and
//!   detects calls abandoned by the caller
//! - **Overlay projection**: the call modal and minimized widget rendered
//!   from state snapshots
//!
//! # Examples
//!
//! ```rust,no_run
//! use rapireport_call_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let user = Arc::new(SharedUserSession::signed_in(CurrentUser {
//!     id: UserId(3),
//!     role: UserRole::Doctor,
//!     display_name: "Sita Sharma".into(),
//! }));
//!
//! let service = ConsultationCallService::builder(CallConfig::from_env())
//!     .with_user_session(user)
//!     .build()?;
//! service.start();
//!
//! let session = service
//!     .start_call(AppointmentId(42), MediaConstraints::video_call())
//!     .await?;
//! println!("calling in room {}", session.room_id);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Runtime configuration
pub mod config;

/// Backend HTTP client
pub mod api;

/// Host application accessors
pub mod context;

/// Scoped background tasks
pub mod task;

/// Signaling over the backend
pub mod signaling;

/// Local media
pub mod media;

/// Peer connection handling
pub mod peer;

/// Call management and state
pub mod call;

/// Incoming call detection
pub mod poller;

/// Call overlay projection
pub mod presenter;

/// Service orchestration
pub mod service;

// Re-export main types at crate root
pub use api::{ApiError, CallAction, ConsultationApi, HttpConsultationApi};
pub use call::{CallError, CallManager, CallSnapshot};
pub use config::CallConfig;
pub use context::{NoopRinger, Ringer, Ringtone, SharedUserSession, UserSession};
pub use media::{MediaDevices, MediaError, MediaEvent, MediaSessionManager, MediaStream};
pub use peer::{PeerConnectionController, PeerError, PeerFactory, RemoteStream};
pub use poller::{IncomingCallPoller, PollOutcome};
pub use presenter::{CallOverlayPresenter, OverlayView, RenderTarget};
pub use service::{
    ConsultationCallService, ConsultationCallServiceBuilder, ConsultationEvent, ServiceError,
};
pub use signaling::{SignalingClient, SignalingError, SignalingMessage};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallManager, CallSnapshot};
    pub use crate::config::CallConfig;
    pub use crate::context::{Ringer, Ringtone, SharedUserSession, UserSession};
    pub use crate::presenter::{CallOverlayPresenter, OverlayView, RenderTarget};
    pub use crate::service::{ConsultationCallService, ConsultationEvent, ServiceError};
    pub use crate::types::{
        AppointmentId, CallEvent, CallId, CallStatus, CurrentUser, MediaConstraints, UserId,
        UserRole,
    };
}
