//! Incoming call detection
//!
//! Polls the backend for ringing calls addressed to the signed-in user and
//! hands new ones to the [`CallManager`]. A ringing call that disappears from
//! the list before it was accepted is reported as missed once it has been
//! absent for `missed_call_threshold` consecutive polls.

use crate::api::ConsultationApi;
use crate::call::CallManager;
use crate::context::UserSession;
use crate::task::ScopedTask;
use crate::types::{CallId, CallStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// What a single poll did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No user signed in
    SignedOut,
    /// A call is in progress
    Suppressed,
    /// Backend request failed
    Failed,
    /// Nothing changed
    Unchanged,
    /// A new call started ringing
    Ringing(CallId),
    /// The ringing call is absent but below the missed threshold
    Absent(CallId),
    /// The ringing call was declared missed
    Missed(CallId),
}

#[derive(Debug, Default)]
struct MissedTracker {
    call_id: Option<CallId>,
    absent_polls: u32,
}

/// Incoming call poller
pub struct IncomingCallPoller {
    api: Arc<dyn ConsultationApi>,
    user: Arc<dyn UserSession>,
    calls: CallManager,
    interval: Duration,
    missed_threshold: u32,
    tracker: Mutex<MissedTracker>,
}

impl IncomingCallPoller {
    /// Create new poller
    #[must_use]
    pub fn new(
        api: Arc<dyn ConsultationApi>,
        user: Arc<dyn UserSession>,
        calls: CallManager,
        interval: Duration,
        missed_threshold: u32,
    ) -> Self {
        Self {
            api,
            user,
            calls,
            interval,
            missed_threshold: missed_threshold.max(1),
            tracker: Mutex::new(MissedTracker::default()),
        }
    }

    /// Poll the backend once
    pub async fn poll_once(&self) -> PollOutcome {
        if self.user.current_user().is_none() {
            self.tracker.lock().absent_polls = 0;
            return PollOutcome::SignedOut;
        }

        let snapshot = self.calls.snapshot();
        if snapshot.status.suppresses_incoming_poll() {
            self.tracker.lock().absent_polls = 0;
            return PollOutcome::Suppressed;
        }

        let calls = match self.api.incoming_calls().await {
            Ok(calls) => calls,
            Err(e) => {
                tracing::warn!(error = %e, "Incoming call poll failed");
                return PollOutcome::Failed;
            }
        };

        // The call may have moved on while the request was in flight
        let snapshot = self.calls.snapshot();
        let ringing = snapshot
            .session
            .as_ref()
            .filter(|s| snapshot.status == CallStatus::Ringing && !s.is_caller)
            .map(|s| s.call_id);

        if let Some(call_id) = ringing {
            if calls.iter().any(|c| c.call_id == call_id) {
                self.reset_tracker(Some(call_id));
                return PollOutcome::Unchanged;
            }
            if snapshot.signal_poll_active {
                return PollOutcome::Unchanged;
            }

            let absent = {
                let mut tracker = self.tracker.lock();
                if tracker.call_id != Some(call_id) {
                    tracker.call_id = Some(call_id);
                    tracker.absent_polls = 0;
                }
                tracker.absent_polls += 1;
                tracker.absent_polls
            };
            if absent < self.missed_threshold {
                tracing::debug!(call_id = %call_id, absent, "Ringing call absent from poll");
                return PollOutcome::Absent(call_id);
            }

            self.reset_tracker(None);
            return if self.calls.mark_missed(call_id).await {
                PollOutcome::Missed(call_id)
            } else {
                PollOutcome::Unchanged
            };
        }

        self.reset_tracker(None);
        if snapshot.session.is_some() {
            return PollOutcome::Unchanged;
        }

        match calls.into_iter().next() {
            Some(call) => {
                let call_id = call.call_id;
                if self.calls.handle_incoming(call).await {
                    self.reset_tracker(Some(call_id));
                    PollOutcome::Ringing(call_id)
                } else {
                    PollOutcome::Unchanged
                }
            }
            None => PollOutcome::Unchanged,
        }
    }

    fn reset_tracker(&self, call_id: Option<CallId>) {
        let mut tracker = self.tracker.lock();
        tracker.call_id = call_id;
        tracker.absent_polls = 0;
    }

    /// Poll on the configured interval until the handle is dropped
    pub fn spawn(self: Arc<Self>) -> ScopedTask {
        tracing::info!(
            interval_ms = self.interval.as_millis(),
            "Incoming call poller started"
        );
        ScopedTask::spawn("incoming-call-poller", async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let outcome = self.poll_once().await;
                tracing::trace!(?outcome, "Incoming call poll");
            }
        })
    }
}
