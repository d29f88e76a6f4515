//! Accessors injected into the call subsystem by the host application

use crate::config::RingtoneAssets;
use crate::types::CurrentUser;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Who is signed in
pub trait UserSession: Send + Sync {
    /// Current user, `None` when not authenticated
    fn current_user(&self) -> Option<CurrentUser>;
}

/// [`UserSession`] held in memory and updated by the host on sign-in/out
#[derive(Debug, Default)]
pub struct SharedUserSession {
    user: RwLock<Option<CurrentUser>>,
}

impl SharedUserSession {
    /// Session signed in as `user`
    #[must_use]
    pub fn signed_in(user: CurrentUser) -> Self {
        Self {
            user: RwLock::new(Some(user)),
        }
    }

    /// Replace the signed-in user
    pub fn sign_in(&self, user: CurrentUser) {
        *self.user.write() = Some(user);
    }

    /// Clear the signed-in user
    pub fn sign_out(&self) {
        *self.user.write() = None;
    }
}

impl UserSession for SharedUserSession {
    fn current_user(&self) -> Option<CurrentUser> {
        self.user.read().clone()
    }
}

/// Which ringtone to loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ringtone {
    /// Callee side while ringing
    Incoming,
    /// Caller side while waiting for an answer
    Outgoing,
}

impl Ringtone {
    /// Asset path for this tone
    #[must_use]
    pub fn asset<'a>(&self, assets: &'a RingtoneAssets) -> &'a str {
        match self {
            Self::Incoming => &assets.incoming,
            Self::Outgoing => &assets.outgoing,
        }
    }
}

/// Ringtone playback
///
/// `play` loops the tone until `stop`; both must return without blocking.
pub trait Ringer: Send + Sync {
    /// Start looping `tone`, replacing any tone already playing
    fn play(&self, tone: Ringtone);

    /// Stop playback; no-op when silent
    fn stop(&self);
}

/// Silent [`Ringer`]
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRinger;

impl Ringer for NoopRinger {
    fn play(&self, tone: Ringtone) {
        tracing::trace!(?tone, "Ringtone suppressed");
    }

    fn stop(&self) {}
}
