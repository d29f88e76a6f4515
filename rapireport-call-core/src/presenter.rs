//! Call overlay projection
//!
//! Turns a [`CallSnapshot`] into what the UI shows: the full call modal, the
//! minimized in-call widget, or nothing. Video surfaces are re-attached to
//! the render target whenever the layout, status, camera state or stream
//! identity changes, since a re-mounted surface loses its source.

use crate::call::CallSnapshot;
use crate::media::MediaStream;
use crate::peer::RemoteStream;
use crate::types::{CallStatus, PresentationMode, TrackKind, UserRole};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Controls offered by the modal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallControls {
    /// Accept button
    pub accept: bool,
    /// Decline button
    pub decline: bool,
    /// Hang-up button
    pub hang_up: bool,
    /// Camera/mic toggles
    pub toggles: bool,
    /// Minimize button
    pub minimize: bool,
}

/// Full-screen call modal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModalView {
    /// Other participant
    pub title: String,
    /// Other participant's avatar
    pub avatar: Option<String>,
    /// Status line
    pub status_line: String,
    /// Available controls
    pub controls: CallControls,
    /// Local camera on
    pub camera_enabled: bool,
    /// Local microphone on
    pub mic_enabled: bool,
    /// Remote video has arrived
    pub remote_video: bool,
    /// Failure message
    pub error: Option<String>,
}

/// Floating in-call widget
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WidgetView {
    /// Other participant
    pub title: String,
    /// Elapsed time, `mm:ss`
    pub elapsed: String,
    /// Local camera on
    pub camera_enabled: bool,
    /// Local microphone on
    pub mic_enabled: bool,
}

/// Rendered overlay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "layout", rename_all = "lowercase")]
pub enum OverlayView {
    /// Nothing shown
    Hidden,
    /// Call modal
    Modal(ModalView),
    /// In-call widget
    Minimized(WidgetView),
}

impl OverlayView {
    /// Presentation this view corresponds to
    #[must_use]
    pub fn mode(&self) -> PresentationMode {
        match self {
            Self::Hidden => PresentationMode::Hidden,
            Self::Modal(_) => PresentationMode::Modal,
            Self::Minimized(_) => PresentationMode::Minimized,
        }
    }
}

fn format_elapsed(snapshot: &CallSnapshot) -> String {
    let secs = snapshot
        .session
        .as_ref()
        .and_then(|s| s.duration())
        .map_or(0, |d| d.num_seconds().max(0));
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// Project a snapshot for a viewer with `role`
#[must_use]
pub fn project(snapshot: &CallSnapshot, role: UserRole) -> OverlayView {
    let Some(session) = snapshot.session.as_ref() else {
        return OverlayView::Hidden;
    };
    if snapshot.status == CallStatus::Idle {
        return OverlayView::Hidden;
    }

    let title = session.appointment.other_party_name(role);
    let camera_enabled = snapshot.local_media.camera_enabled;
    let mic_enabled = snapshot.local_media.mic_enabled;

    match snapshot.presentation {
        PresentationMode::Hidden => OverlayView::Hidden,
        PresentationMode::Minimized if snapshot.status == CallStatus::InCall => {
            OverlayView::Minimized(WidgetView {
                title,
                elapsed: format_elapsed(snapshot),
                camera_enabled,
                mic_enabled,
            })
        }
        PresentationMode::Modal | PresentationMode::Minimized => {
            let ringing_here = snapshot.status == CallStatus::Ringing && !session.is_caller;
            let live = matches!(
                snapshot.status,
                CallStatus::Initiating | CallStatus::Connecting | CallStatus::InCall
            );
            let status_line = if snapshot.status == CallStatus::InCall {
                format!("{} {}", snapshot.status.label(), format_elapsed(snapshot))
            } else {
                snapshot.status.label().to_string()
            };
            OverlayView::Modal(ModalView {
                title,
                avatar: session.appointment.other_party_avatar(role).map(String::from),
                status_line,
                controls: CallControls {
                    accept: ringing_here,
                    decline: ringing_here,
                    hang_up: live || (snapshot.status == CallStatus::Ringing && session.is_caller),
                    toggles: live,
                    minimize: snapshot.status == CallStatus::InCall,
                },
                camera_enabled,
                mic_enabled,
                remote_video: snapshot
                    .remote_stream
                    .as_ref()
                    .is_some_and(|r| r.has_kind(TrackKind::Video)),
                error: snapshot.error.clone(),
            })
        }
    }
}

/// Where video surfaces live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoSlot {
    /// Own camera preview
    Local,
    /// Other participant
    Remote,
}

/// Stream bound to a video surface
#[derive(Debug, Clone)]
pub enum StreamSource {
    /// Local capture
    Local(Arc<MediaStream>),
    /// Remote media
    Remote(Arc<RemoteStream>),
}

/// UI surface the presenter draws into
pub trait RenderTarget: Send {
    /// Draw the overlay
    fn render(&mut self, view: &OverlayView);

    /// Bind `source` to a video surface, `None` clears it
    fn attach(&mut self, slot: VideoSlot, source: Option<StreamSource>);
}

/// Everything that forces surfaces to be re-bound
#[derive(Debug, Clone, PartialEq, Eq)]
struct AttachKey {
    mode: PresentationMode,
    status: CallStatus,
    camera_enabled: bool,
    local: Option<(String, usize)>,
    remote: Option<(String, usize)>,
}

impl AttachKey {
    fn of(view: &OverlayView, snapshot: &CallSnapshot) -> Self {
        Self {
            mode: view.mode(),
            status: snapshot.status,
            camera_enabled: snapshot.local_media.camera_enabled,
            local: snapshot
                .local_stream
                .as_ref()
                .map(|s| (s.id().to_string(), s.tracks().len())),
            remote: snapshot
                .remote_stream
                .as_ref()
                .map(|s| (s.id().to_string(), s.tracks().len())),
        }
    }
}

/// Drives a [`RenderTarget`] from call snapshots
pub struct CallOverlayPresenter<T: RenderTarget> {
    role: UserRole,
    target: T,
    last_view: Option<OverlayView>,
    last_attach: Option<AttachKey>,
}

impl<T: RenderTarget> CallOverlayPresenter<T> {
    /// Presenter for a viewer with `role`
    pub fn new(role: UserRole, target: T) -> Self {
        Self {
            role,
            target,
            last_view: None,
            last_attach: None,
        }
    }

    /// Render target
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Mutable render target
    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// Viewer role changed, e.g. after sign-in
    pub fn set_role(&mut self, role: UserRole) {
        if self.role != role {
            self.role = role;
            self.last_view = None;
        }
    }

    /// Project `snapshot` and update the target where something changed
    ///
    /// Returns the projected view.
    pub fn present(&mut self, snapshot: &CallSnapshot) -> OverlayView {
        let view = project(snapshot, self.role);

        if self.last_view.as_ref() != Some(&view) {
            self.target.render(&view);
            self.last_view = Some(view.clone());
        }

        let key = AttachKey::of(&view, snapshot);
        if self.last_attach.as_ref() != Some(&key) {
            match &view {
                OverlayView::Hidden => {
                    self.target.attach(VideoSlot::Local, None);
                    self.target.attach(VideoSlot::Remote, None);
                }
                OverlayView::Modal(_) | OverlayView::Minimized(_) => {
                    self.target.attach(
                        VideoSlot::Local,
                        snapshot.local_stream.clone().map(StreamSource::Local),
                    );
                    self.target.attach(
                        VideoSlot::Remote,
                        snapshot.remote_stream.clone().map(StreamSource::Remote),
                    );
                }
            }
            tracing::trace!(mode = ?key.mode, status = ?key.status, "Video surfaces re-attached");
            self.last_attach = Some(key);
        }

        view
    }

    /// Present every snapshot until the manager goes away
    pub async fn run(mut self, mut snapshots: watch::Receiver<CallSnapshot>) -> T {
        loop {
            let snapshot = snapshots.borrow_and_update().clone();
            self.present(&snapshot);
            if snapshots.changed().await.is_err() {
                break;
            }
        }
        self.target
    }
}
