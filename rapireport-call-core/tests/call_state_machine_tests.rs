//! Call state machine tests
//!
//! Drives the manager through caller and callee flows against in-memory
//! backend, peer and device fakes.

mod common;

use common::{appointment, incoming_call, Harness, DOCTOR, PATIENT};
use pretty_assertions::assert_eq;
use rapireport_call_core::peer::{PeerEvent, PeerState, RemoteTrackInfo};
use rapireport_call_core::presenter::{CallOverlayPresenter, OverlayView, RenderTarget, StreamSource, VideoSlot};
use rapireport_call_core::{
    CallAction, CallError, CallEvent, CallId, CallStatus, MediaConstraints, PollOutcome,
    PresentationMode, Ringtone, TrackKind, UserNotice, UserRole,
};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn statuses_seen(events: &[CallEvent]) -> Vec<CallStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            CallEvent::StatusChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

fn notices(events: &[CallEvent]) -> Vec<UserNotice> {
    events
        .iter()
        .filter_map(|e| match e {
            CallEvent::Notice(n) => Some(n.clone()),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Caller
// ============================================================================

#[tokio::test(start_paused = true)]
async fn caller_reaches_in_call_after_answer_and_connect() {
    let mut h = Harness::doctor();

    let session = h
        .manager
        .start_call(appointment(), MediaConstraints::video_call())
        .await
        .unwrap();
    assert!(session.is_caller);
    assert_eq!(session.call_id, CallId(5));
    assert_eq!(session.peer_user_id, Some(PATIENT));
    assert_eq!(h.manager.status(), CallStatus::Initiating);
    assert_eq!(h.ringer.playing(), Some(Ringtone::Outgoing));

    let sent = h.api.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, "offer");
    assert_eq!(sent[0].to_user_id, PATIENT);
    assert_eq!(sent[0].payload["sdp"], "local-offer");

    h.api.deliver_answer();
    h.wait_for(CallStatus::Connecting).await;
    assert_eq!(h.ringer.playing(), None);

    h.peers.emit(PeerEvent::StateChanged(PeerState::Connected));
    h.wait_for(CallStatus::InCall).await;

    let snapshot = h.manager.snapshot();
    assert!(snapshot.session.unwrap().connected_at.is_some());
    assert_eq!(snapshot.presentation, PresentationMode::Modal);
    assert!(snapshot.local_media.camera_enabled);
    assert_eq!(
        h.peers.log(),
        vec!["track:audio", "track:video", "offer", "remote:remote-answer"]
    );
    assert_eq!(
        statuses_seen(&h.drain_events()),
        vec![CallStatus::Initiating, CallStatus::Connecting, CallStatus::InCall]
    );
}

#[tokio::test(start_paused = true)]
async fn patients_cannot_start_calls() {
    let h = Harness::patient();
    let err = h
        .manager
        .start_call(appointment(), MediaConstraints::video_call())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::NotPermitted(_)));
    assert_eq!(h.manager.status(), CallStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn signed_out_users_cannot_start_calls() {
    let h = Harness::doctor();
    h.user.sign_out();
    let err = h
        .manager
        .start_call(appointment(), MediaConstraints::video_call())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::NotAuthenticated));
}

#[tokio::test(start_paused = true)]
async fn second_call_is_rejected_while_active() {
    let mut h = Harness::doctor();
    h.manager
        .start_call(appointment(), MediaConstraints::video_call())
        .await
        .unwrap();

    let err = h
        .manager
        .start_call(appointment(), MediaConstraints::audio_only())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::AlreadyActive));
    assert!(notices(&h.drain_events()).contains(&UserNotice::AlreadyInCall));

    assert!(!h.manager.handle_incoming(incoming_call(8, "other")).await);
    assert_eq!(h.manager.snapshot().session.unwrap().call_id, CallId(5));
    assert_eq!(h.devices.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn backend_start_failure_returns_to_idle() {
    let mut h = Harness::doctor();
    h.api.fail_start.store(true, Ordering::SeqCst);

    let err = h
        .manager
        .start_call(appointment(), MediaConstraints::video_call())
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::Backend(_)));
    assert_eq!(h.manager.status(), CallStatus::Idle);
    assert!(h.media.local_stream().is_none());
    assert_eq!(h.streams_stopped(), 1);
    let events = h.drain_events();
    assert_eq!(
        statuses_seen(&events),
        vec![CallStatus::Initiating, CallStatus::Failed, CallStatus::Idle]
    );
    assert!(matches!(
        notices(&events).last(),
        Some(UserNotice::CouldNotStart(_))
    ));
    assert!(h.api.statuses().is_empty());
}

#[tokio::test(start_paused = true)]
async fn offer_send_failure_fails_call_after_retries() {
    let h = Harness::doctor();
    h.api.fail_signal_sends.store(true, Ordering::SeqCst);

    let err = h
        .manager
        .start_call(appointment(), MediaConstraints::video_call())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CallError::SignalingTransport(rapireport_call_core::SignalingError::Transport { attempts: 3, .. })
    ));
    assert_eq!(h.manager.status(), CallStatus::Idle);
    assert_eq!(h.peers.log().last().map(String::as_str), Some("close"));
    assert_eq!(h.api.statuses(), vec![CallAction::End]);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out() {
    let mut h = Harness::doctor();
    h.manager
        .start_call(appointment(), MediaConstraints::video_call())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(46)).await;

    assert_eq!(h.manager.status(), CallStatus::Idle);
    assert_eq!(h.ringer.playing(), None);
    assert_eq!(h.api.statuses(), vec![CallAction::End]);
    assert_eq!(h.api.sent_kinds(), vec!["offer", "end"]);
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, CallEvent::Failed { reason, .. } if reason.contains("answer"))));
}

#[tokio::test(start_paused = true)]
async fn offers_received_by_the_caller_are_ignored() {
    let h = Harness::doctor();
    h.manager
        .start_call(appointment(), MediaConstraints::video_call())
        .await
        .unwrap();

    h.api.deliver_offer();
    h.settle().await;

    assert_eq!(h.manager.status(), CallStatus::Initiating);
    assert!(!h.peers.log().iter().any(|e| e.starts_with("remote:")));
    assert_eq!(h.api.sent_kinds(), vec!["offer"]);
}

// ============================================================================
// Callee
// ============================================================================

#[tokio::test(start_paused = true)]
async fn poll_detects_incoming_call_and_rings() {
    let mut h = Harness::patient();
    h.api.set_incoming(vec![incoming_call(1, "r1")]);

    assert_eq!(h.poller.poll_once().await, PollOutcome::Ringing(CallId(1)));

    let snapshot = h.manager.snapshot();
    let session = snapshot.session.unwrap();
    assert_eq!(snapshot.status, CallStatus::Ringing);
    assert_eq!(snapshot.presentation, PresentationMode::Modal);
    assert!(!session.is_caller);
    assert_eq!(session.peer_user_id, Some(DOCTOR));
    assert_eq!(h.ringer.playing(), Some(Ringtone::Incoming));

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, CallEvent::IncomingCall { call } if call.call_id == CallId(1))));
    assert!(notices(&events).contains(&UserNotice::IncomingCall {
        from: "Dr. Sita Sharma".into()
    }));

    // Still listed: nothing changes
    assert_eq!(h.poller.poll_once().await, PollOutcome::Unchanged);
    assert_eq!(h.manager.snapshot().generation, snapshot.generation);
}

#[tokio::test(start_paused = true)]
async fn vanished_call_is_missed_after_two_polls() {
    let mut h = Harness::patient();
    h.ring().await;

    h.api.set_incoming(Vec::new());
    assert_eq!(h.poller.poll_once().await, PollOutcome::Absent(CallId(1)));
    assert_eq!(h.manager.status(), CallStatus::Ringing);

    assert_eq!(h.poller.poll_once().await, PollOutcome::Missed(CallId(1)));
    assert_eq!(h.manager.status(), CallStatus::Idle);
    assert_eq!(h.ringer.playing(), None);

    let events = h.drain_events();
    assert!(events.contains(&CallEvent::Missed { call_id: CallId(1) }));
    assert!(notices(&events).contains(&UserNotice::CallMissed));
    assert!(h.api.statuses().is_empty());
}

#[tokio::test(start_paused = true)]
async fn single_missing_poll_does_not_miss_the_call() {
    let h = Harness::patient();
    h.ring().await;

    h.api.set_incoming(Vec::new());
    assert_eq!(h.poller.poll_once().await, PollOutcome::Absent(CallId(1)));

    h.api.set_incoming(vec![incoming_call(1, "r1")]);
    assert_eq!(h.poller.poll_once().await, PollOutcome::Unchanged);

    h.api.set_incoming(Vec::new());
    assert_eq!(h.poller.poll_once().await, PollOutcome::Absent(CallId(1)));
    assert_eq!(h.manager.status(), CallStatus::Ringing);
}

#[tokio::test(start_paused = true)]
async fn poll_errors_are_swallowed() {
    let h = Harness::patient();
    h.api.fail_incoming.store(true, Ordering::SeqCst);
    assert_eq!(h.poller.poll_once().await, PollOutcome::Failed);

    h.api.fail_incoming.store(false, Ordering::SeqCst);
    h.api.set_incoming(vec![incoming_call(1, "r1")]);
    assert_eq!(h.poller.poll_once().await, PollOutcome::Ringing(CallId(1)));
}

#[tokio::test(start_paused = true)]
async fn poller_is_quiet_while_signed_out_or_in_call() {
    let h = Harness::patient();
    h.user.sign_out();
    h.api.set_incoming(vec![incoming_call(1, "r1")]);
    assert_eq!(h.poller.poll_once().await, PollOutcome::SignedOut);

    let h = Harness::patient();
    h.connect_as_callee().await;
    h.api.set_incoming(vec![incoming_call(2, "r2")]);
    assert_eq!(h.poller.poll_once().await, PollOutcome::Suppressed);
    assert_eq!(h.manager.snapshot().session.unwrap().call_id, CallId(1));
}

#[tokio::test(start_paused = true)]
async fn accepting_answers_the_callers_offer() {
    let mut h = Harness::patient();
    h.ring().await;

    h.manager
        .accept_call(MediaConstraints::video_call())
        .await
        .unwrap();
    assert_eq!(h.manager.status(), CallStatus::Connecting);
    assert_eq!(h.ringer.playing(), None);
    assert_eq!(h.api.statuses(), vec![CallAction::Accept]);
    assert!(h.manager.snapshot().signal_poll_active);

    h.api.deliver_offer();
    h.settle().await;
    assert_eq!(h.api.sent_kinds(), vec!["answer"]);
    assert_eq!(h.api.sent.lock().unwrap()[0].to_user_id, DOCTOR);

    h.peers.emit(PeerEvent::StateChanged(PeerState::Connected));
    h.wait_for(CallStatus::InCall).await;

    // Missed detection never applies once the handshake started
    h.api.set_incoming(Vec::new());
    h.poller.poll_once().await;
    h.poller.poll_once().await;
    assert_eq!(h.manager.status(), CallStatus::InCall);
    assert!(!h.drain_events().iter().any(|e| matches!(e, CallEvent::Missed { .. })));
}

#[tokio::test(start_paused = true)]
async fn repeated_offer_is_answered_once() {
    let h = Harness::patient();
    h.ring().await;
    h.manager
        .accept_call(MediaConstraints::audio_only())
        .await
        .unwrap();

    h.api.deliver_offer();
    h.api.deliver_offer();
    h.settle().await;

    assert_eq!(h.api.sent_kinds(), vec!["answer"]);
    assert_eq!(
        h.peers.log(),
        vec!["track:audio", "remote:remote-offer", "answer"]
    );
}

#[tokio::test(start_paused = true)]
async fn media_denied_on_accept_fails_without_answer() {
    let mut h = Harness::patient();
    h.ring().await;
    h.devices.deny.store(true, Ordering::SeqCst);

    let err = h
        .manager
        .accept_call(MediaConstraints::video_call())
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::MediaUnavailable(_)));
    assert_eq!(h.manager.status(), CallStatus::Idle);
    assert_eq!(h.ringer.playing(), None);
    assert!(h.api.sent_kinds().is_empty());
    assert_eq!(h.api.statuses(), vec![CallAction::Reject]);
    assert_eq!(h.peers.created(), 0);

    let events = h.drain_events();
    assert_eq!(
        statuses_seen(&events),
        vec![
            CallStatus::Ringing,
            CallStatus::Connecting,
            CallStatus::Failed,
            CallStatus::Idle
        ]
    );
    assert!(notices(&events).contains(&UserNotice::MediaDenied));
}

#[tokio::test(start_paused = true)]
async fn decline_posts_reject_and_goes_idle() {
    let mut h = Harness::patient();
    h.ring().await;

    h.manager.decline_call().await.unwrap();

    assert_eq!(h.manager.status(), CallStatus::Idle);
    assert_eq!(h.ringer.playing(), None);
    assert_eq!(h.api.statuses(), vec![CallAction::Reject]);
    assert!(h.api.sent_kinds().is_empty());
    assert_eq!(h.streams_stopped(), 0);
    assert!(h
        .drain_events()
        .contains(&CallEvent::Ended { call_id: Some(CallId(1)) }));
}

#[tokio::test(start_paused = true)]
async fn accept_and_decline_require_ringing() {
    let h = Harness::patient();
    assert!(matches!(
        h.manager.accept_call(MediaConstraints::video_call()).await,
        Err(CallError::InvalidState { status: CallStatus::Idle, .. })
    ));
    assert!(matches!(
        h.manager.decline_call().await,
        Err(CallError::InvalidState { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn missed_detection_after_decline_is_a_no_op() {
    let h = Harness::patient();
    h.ring().await;
    h.manager.decline_call().await.unwrap();

    assert!(!h.manager.mark_missed(CallId(1)).await);
    h.api.set_incoming(Vec::new());
    assert_eq!(h.poller.poll_once().await, PollOutcome::Unchanged);
    assert_eq!(h.api.statuses(), vec![CallAction::Reject]);
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test(start_paused = true)]
async fn candidates_before_offer_are_applied_after_it() {
    let h = Harness::patient();
    h.ring().await;
    h.manager
        .accept_call(MediaConstraints::audio_only())
        .await
        .unwrap();

    h.api.deliver_candidate(DOCTOR, "cand-1");
    h.settle().await;
    h.api.deliver_candidate(DOCTOR, "cand-2");
    h.api.deliver_offer();
    h.settle().await;

    assert_eq!(
        h.peers.log(),
        vec![
            "track:audio",
            "remote:remote-offer",
            "ice:cand-1",
            "ice:cand-2",
            "answer"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn local_candidates_are_trickled_to_the_peer() {
    let h = Harness::doctor();
    h.manager
        .start_call(appointment(), MediaConstraints::video_call())
        .await
        .unwrap();

    h.peers.emit(PeerEvent::LocalCandidate(
        rapireport_call_core::signaling::IceCandidate::new("candidate:local"),
    ));
    h.settle().await;

    let sent = h.api.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].kind, "candidate");
    assert_eq!(sent[1].payload["candidate"], "candidate:local");
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn end_call_is_idempotent() {
    let mut h = Harness::doctor();
    h.connect_as_caller().await;

    assert!(h.manager.end_call(true).await);
    assert_eq!(h.manager.status(), CallStatus::Idle);
    let statuses = h.api.statuses();
    let sent = h.api.sent_kinds();
    assert_eq!(statuses, vec![CallAction::End]);
    assert_eq!(sent.last().map(String::as_str), Some("end"));

    assert!(!h.manager.end_call(true).await);
    assert_eq!(h.manager.status(), CallStatus::Idle);
    assert_eq!(h.api.statuses(), statuses);
    assert_eq!(h.api.sent_kinds(), sent);
    assert_eq!(h.streams_stopped(), 1);
    assert_eq!(
        h.peers.log().iter().filter(|e| *e == "close").count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn end_signal_from_peer_ends_the_call() {
    let mut h = Harness::patient();
    h.connect_as_callee().await;

    h.api.deliver(DOCTOR, "end", serde_json::json!({}));
    h.wait_for(CallStatus::Idle).await;

    assert!(notices(&h.drain_events()).contains(&UserNotice::CallEnded));
    assert_eq!(h.api.statuses(), vec![CallAction::Accept]);
    assert_eq!(h.api.sent_kinds(), vec!["answer"]);
    assert!(!h.manager.snapshot().signal_poll_active);
    assert_eq!(h.streams_stopped(), 1);
}

#[tokio::test(start_paused = true)]
async fn media_released_once_on_every_exit_path() {
    // Hang-up
    let mut h = Harness::doctor();
    h.connect_as_caller().await;
    h.manager.end_call(true).await;
    h.manager.end_call(false).await;
    assert_eq!(h.streams_stopped(), 1);

    // Peer failure
    let mut h = Harness::doctor();
    h.connect_as_caller().await;
    h.peers.emit(PeerEvent::StateChanged(PeerState::Failed));
    h.wait_for(CallStatus::Idle).await;
    h.manager.end_call(true).await;
    assert_eq!(h.streams_stopped(), 1);

    // Remote hang-up
    let mut h = Harness::patient();
    h.connect_as_callee().await;
    h.api.deliver(DOCTOR, "end", serde_json::json!({}));
    h.wait_for(CallStatus::Idle).await;
    assert_eq!(h.streams_stopped(), 1);

    // Missed and declined calls never acquire media
    let mut h = Harness::patient();
    h.ring().await;
    h.api.set_incoming(Vec::new());
    h.poller.poll_once().await;
    h.poller.poll_once().await;
    assert_eq!(h.manager.status(), CallStatus::Idle);
    assert_eq!(h.streams_stopped(), 0);
    assert!(!h.media.release());
}

#[tokio::test(start_paused = true)]
async fn peer_closing_mid_call_ends_without_echo() {
    let mut h = Harness::doctor();
    h.connect_as_caller().await;

    h.peers.emit(PeerEvent::StateChanged(PeerState::Closed));
    h.wait_for(CallStatus::Idle).await;

    assert!(notices(&h.drain_events()).contains(&UserNotice::CallEnded));
    assert!(h.api.statuses().is_empty());
    assert_eq!(h.api.sent_kinds(), vec!["offer"]);
    assert_eq!(h.streams_stopped(), 1);
}

#[tokio::test(start_paused = true)]
async fn peer_failure_reports_could_not_connect() {
    let mut h = Harness::patient();
    h.connect_as_callee().await;

    h.peers.emit(PeerEvent::StateChanged(PeerState::Failed));
    h.wait_for(CallStatus::Idle).await;

    let events = h.drain_events();
    assert!(statuses_seen(&events).ends_with(&[CallStatus::Failed, CallStatus::Idle]));
    assert!(matches!(
        notices(&events).last(),
        Some(UserNotice::CouldNotConnect(_))
    ));
    assert_eq!(h.api.sent_kinds(), vec!["answer", "end"]);
}

#[tokio::test(start_paused = true)]
async fn brief_disconnect_recovers_within_grace() {
    let h = Harness::doctor();
    h.connect_as_caller().await;

    h.peers.emit(PeerEvent::StateChanged(PeerState::Disconnected));
    tokio::time::sleep(Duration::from_secs(2)).await;
    h.peers.emit(PeerEvent::StateChanged(PeerState::Connected));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.manager.status(), CallStatus::InCall);

    h.peers.emit(PeerEvent::StateChanged(PeerState::Disconnected));
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.manager.status(), CallStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn stale_timers_do_not_touch_the_next_call() {
    let h = Harness::doctor();
    h.manager
        .start_call(appointment(), MediaConstraints::video_call())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(40)).await;
    h.manager.end_call(false).await;

    h.manager
        .start_call(appointment(), MediaConstraints::video_call())
        .await
        .unwrap();
    // The first call's answer timer would have fired here
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.manager.status(), CallStatus::Initiating);
}

#[tokio::test(start_paused = true)]
async fn hangup_during_media_acquisition_never_creates_the_call() {
    let mut h = Harness::doctor();
    *h.devices.open_delay.lock().unwrap() = Duration::from_millis(500);

    let manager = h.manager.clone();
    let call = tokio::spawn(async move {
        manager
            .start_call(appointment(), MediaConstraints::video_call())
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.manager.end_call(true).await);

    let result = call.await.unwrap();
    assert!(matches!(result, Err(CallError::Cancelled)));
    assert_eq!(h.manager.status(), CallStatus::Idle);
    assert!(h.api.statuses().is_empty());
    assert!(h.api.sent_kinds().is_empty());
    assert_eq!(h.peers.created(), 0);
    assert!(h.media.local_stream().is_none());
    assert_eq!(h.streams_stopped(), 1);
    assert_eq!(h.ringer.playing(), None);
}

#[tokio::test(start_paused = true)]
async fn hangup_during_media_acquisition_never_accepts() {
    let h = Harness::patient();
    h.ring().await;
    *h.devices.open_delay.lock().unwrap() = Duration::from_millis(500);

    let manager = h.manager.clone();
    let accept =
        tokio::spawn(async move { manager.accept_call(MediaConstraints::video_call()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.manager.end_call(true).await);

    let result = accept.await.unwrap();
    assert!(matches!(result, Err(CallError::Cancelled)));
    assert_eq!(h.manager.status(), CallStatus::Idle);
    assert_eq!(h.api.statuses(), vec![CallAction::End]);
    assert_eq!(h.peers.created(), 0);
    assert!(h.media.local_stream().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hangup_racing_start_leaves_no_ringtone() {
    for _ in 0..100 {
        let h = Harness::doctor();
        let manager = h.manager.clone();
        let mut rx = h.manager.watch();
        let hangup = tokio::spawn(async move {
            while rx.borrow_and_update().status != CallStatus::Initiating {
                if rx.changed().await.is_err() {
                    return;
                }
            }
            manager.end_call(false).await;
        });

        let _ = h
            .manager
            .start_call(appointment(), MediaConstraints::video_call())
            .await;
        hangup.await.unwrap();

        assert_eq!(h.manager.status(), CallStatus::Idle);
        assert_eq!(h.ringer.playing(), None);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn decline_racing_ring_leaves_no_ringtone() {
    for i in 0..100 {
        let h = Harness::patient();
        let manager = h.manager.clone();
        let mut rx = h.manager.watch();
        let decline = tokio::spawn(async move {
            while rx.borrow_and_update().status != CallStatus::Ringing {
                if rx.changed().await.is_err() {
                    return Ok(());
                }
            }
            manager.decline_call().await
        });

        assert!(h.manager.handle_incoming(incoming_call(i, "race")).await);
        decline.await.unwrap().unwrap();

        assert_eq!(h.manager.status(), CallStatus::Idle);
        assert_eq!(h.ringer.playing(), None);
        assert_eq!(h.api.statuses(), vec![CallAction::Reject]);
    }
}

// ============================================================================
// Presentation
// ============================================================================

#[derive(Default)]
struct SurfaceLog {
    attached: Vec<(VideoSlot, Option<String>)>,
    last_view: Option<OverlayView>,
}

impl RenderTarget for SurfaceLog {
    fn render(&mut self, view: &OverlayView) {
        self.last_view = Some(view.clone());
    }

    fn attach(&mut self, slot: VideoSlot, source: Option<StreamSource>) {
        let id = source.map(|s| match s {
            StreamSource::Local(s) => s.id().to_string(),
            StreamSource::Remote(s) => s.id().to_string(),
        });
        self.attached.push((slot, id));
    }
}

#[tokio::test(start_paused = true)]
async fn minimize_and_restore_reattach_streams_without_renegotiation() {
    let h = Harness::patient();
    h.connect_as_callee().await;
    h.peers.emit(PeerEvent::RemoteTrack(RemoteTrackInfo {
        id: "remote-video".into(),
        kind: TrackKind::Video,
        stream_id: "doctor-stream".into(),
    }));
    h.settle().await;

    let mut presenter = CallOverlayPresenter::new(UserRole::Patient, SurfaceLog::default());
    let before = h.manager.snapshot();
    let local_id = before.local_stream.as_ref().unwrap().id().to_string();
    let remote_id = before.remote_stream.as_ref().unwrap().id().to_string();
    assert!(matches!(presenter.present(&before), OverlayView::Modal(ref m) if m.remote_video));

    h.manager.minimize().await.unwrap();
    let minimized = h.manager.snapshot();
    assert_eq!(minimized.status, CallStatus::InCall);
    assert!(matches!(presenter.present(&minimized), OverlayView::Minimized(_)));

    h.manager.restore().await.unwrap();
    let restored = h.manager.snapshot();
    assert_eq!(restored.status, CallStatus::InCall);
    assert!(matches!(presenter.present(&restored), OverlayView::Modal(_)));

    let attached = &presenter.target().attached;
    assert_eq!(attached.len(), 6);
    let expected = [
        (VideoSlot::Local, Some(local_id)),
        (VideoSlot::Remote, Some(remote_id)),
    ];
    assert_eq!(&attached[4..], &expected);

    assert_eq!(h.peers.created(), 1);
    assert_eq!(h.api.sent_kinds(), vec!["answer"]);
    assert_eq!(
        h.peers.log().iter().filter(|e| *e == "answer").count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn minimize_requires_an_active_call() {
    let h = Harness::patient();
    assert!(matches!(
        h.manager.minimize().await,
        Err(CallError::InvalidState { op: "minimize", .. })
    ));
    h.ring().await;
    assert!(h.manager.minimize().await.is_err());
    assert_eq!(h.manager.snapshot().presentation, PresentationMode::Modal);
}

#[tokio::test(start_paused = true)]
async fn track_toggles_update_the_snapshot() {
    let h = Harness::doctor();
    h.connect_as_caller().await;

    assert_eq!(h.manager.toggle_camera().await, Some(false));
    assert!(!h.manager.snapshot().local_media.camera_enabled);
    assert_eq!(h.manager.toggle_mic().await, Some(false));
    assert_eq!(h.manager.toggle_mic().await, Some(true));
    assert!(h.manager.snapshot().local_media.mic_enabled);
    assert_eq!(h.manager.status(), CallStatus::InCall);
}

// ============================================================================
// Random operation sequences
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Op {
    Start,
    Ring(i64),
    Accept,
    Decline,
    Hangup,
    Miss,
    Answer,
    Offer,
    Connected,
    PeerFailed,
    Wait,
}

fn op_strategy() -> impl proptest::strategy::Strategy<Value = Op> {
    use proptest::prelude::*;
    prop_oneof![
        Just(Op::Start),
        (1i64..4).prop_map(Op::Ring),
        Just(Op::Accept),
        Just(Op::Decline),
        Just(Op::Hangup),
        Just(Op::Miss),
        Just(Op::Answer),
        Just(Op::Offer),
        Just(Op::Connected),
        Just(Op::PeerFailed),
        Just(Op::Wait),
    ]
}

async fn apply(h: &Harness, op: Op) {
    match op {
        Op::Start => {
            let _ = h
                .manager
                .start_call(appointment(), MediaConstraints::video_call())
                .await;
        }
        Op::Ring(id) => {
            h.manager.handle_incoming(incoming_call(id, "r")).await;
        }
        Op::Accept => {
            let _ = h.manager.accept_call(MediaConstraints::audio_only()).await;
        }
        Op::Decline => {
            let _ = h.manager.decline_call().await;
        }
        Op::Hangup => {
            h.manager.end_call(true).await;
        }
        Op::Miss => {
            if let Some(session) = h.manager.snapshot().session {
                h.manager.mark_missed(session.call_id).await;
            }
        }
        Op::Answer => h.api.deliver_answer(),
        Op::Offer => h.api.deliver_offer(),
        Op::Connected => h.peers.emit(PeerEvent::StateChanged(PeerState::Connected)),
        Op::PeerFailed => h.peers.emit(PeerEvent::StateChanged(PeerState::Failed)),
        Op::Wait => tokio::time::sleep(Duration::from_millis(500)).await,
    }
}

proptest::proptest! {
    #![proptest_config(proptest::prelude::ProptestConfig::with_cases(48))]

    #[test]
    fn random_operations_keep_a_single_session(
        ops in proptest::collection::vec(op_strategy(), 1..24),
        as_doctor in proptest::bool::ANY,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        runtime.block_on(async {
            let h = if as_doctor { Harness::doctor() } else { Harness::patient() };

            for op in ops {
                apply(&h, op).await;
                let snapshot = h.manager.snapshot();
                if snapshot.status == CallStatus::Idle {
                    assert!(snapshot.session.is_none());
                    assert!(snapshot.local_stream.is_none());
                } else {
                    assert!(snapshot.session.is_some());
                }
            }

            h.manager.end_call(true).await;
            let snapshot = h.manager.snapshot();
            assert_eq!(snapshot.status, CallStatus::Idle);
            assert!(snapshot.session.is_none());
            assert!(h.media.local_stream().is_none());
            assert!(!snapshot.signal_poll_active);
        });
    }
}
