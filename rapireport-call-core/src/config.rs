//! Call subsystem configuration

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

/// Backend endpoint paths, relative to [`CallConfig::base_url`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPaths {
    /// `GET` ringing calls addressed to the current user
    pub incoming_calls: String,
    /// `POST` create a call for an appointment
    pub call_start: String,
    /// `POST` accept / reject / end a call
    pub call_status: String,
    /// `GET` poll and `POST` send signaling messages
    pub call_signal: String,
    /// `GET` the doctor's appointments
    pub doctor_appointments: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            incoming_calls: "/api/consultants/get_incoming_consultation_call.php".to_string(),
            call_start: "/api/consultants/consultation_call_start.php".to_string(),
            call_status: "/api/consultants/consultation_call_status.php".to_string(),
            call_signal: "/api/consultants/consultation_call_signal.php".to_string(),
            doctor_appointments: "/api/consultants/get_doctor_appointments.php".to_string(),
        }
    }
}

/// Ringtone assets, looped while a call rings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingtoneAssets {
    /// Played to the callee while ringing
    pub incoming: String,
    /// Played to the caller while waiting for an answer
    pub outgoing: String,
}

impl Default for RingtoneAssets {
    fn default() -> Self {
        Self {
            incoming: "/sounds/family_incoming.mp3".to_string(),
            outgoing: "/sounds/family_outgoing.mp3".to_string(),
        }
    }
}

/// Call subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Backend base URL, e.g. `https://api.example.org/rapireport/backend`
    pub base_url: String,
    /// Endpoint paths
    pub endpoints: EndpointPaths,
    /// PHP session cookie (`PHPSESSID=...`) used to authenticate requests
    pub session_cookie: Option<String>,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
    /// Incoming call poll interval
    pub incoming_poll_interval: Duration,
    /// Signal poll interval while a call is connecting or connected
    pub signal_poll_interval: Duration,
    /// How long a caller waits for the callee's answer
    pub answer_timeout: Duration,
    /// How long the media path may take to connect once negotiation starts
    pub connect_timeout: Duration,
    /// How long a dropped connection may try to recover before the call fails
    pub disconnect_grace: Duration,
    /// Attempts per outgoing signaling message
    pub signal_send_attempts: u32,
    /// Consecutive polls a ringing call must be missing before it counts as missed
    pub missed_call_threshold: u32,
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
    /// Ringtone assets
    pub ringtones: RingtoneAssets,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost/RapiReport/backend".to_string(),
            endpoints: EndpointPaths::default(),
            session_cookie: None,
            request_timeout: Duration::from_secs(10),
            incoming_poll_interval: Duration::from_secs(3),
            signal_poll_interval: Duration::from_millis(800),
            answer_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(30),
            disconnect_grace: Duration::from_secs(5),
            signal_send_attempts: 3,
            missed_call_threshold: 2,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            ringtones: RingtoneAssets::default(),
        }
    }
}

fn duration_ms_var(name: &str, default: Duration) -> Duration {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                warn!("{} is not a number of milliseconds ({:?}), using default", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

impl CallConfig {
    /// Load configuration from `RAPIREPORT_*` environment variables
    ///
    /// Missing variables fall back to [`CallConfig::default`].
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let base_url = env::var("RAPIREPORT_API_BASE_URL").unwrap_or_else(|_| {
            warn!("RAPIREPORT_API_BASE_URL not set, using {}", defaults.base_url);
            defaults.base_url.clone()
        });

        let session_cookie = env::var("RAPIREPORT_SESSION_COOKIE").ok();
        if session_cookie.is_none() {
            warn!("RAPIREPORT_SESSION_COOKIE not set, backend requests will be unauthenticated");
        }

        let ice_servers = env::var("RAPIREPORT_ICE_SERVERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|_| defaults.ice_servers.clone());

        let config = Self {
            base_url,
            session_cookie,
            incoming_poll_interval: duration_ms_var(
                "RAPIREPORT_INCOMING_POLL_MS",
                defaults.incoming_poll_interval,
            ),
            signal_poll_interval: duration_ms_var(
                "RAPIREPORT_SIGNAL_POLL_MS",
                defaults.signal_poll_interval,
            ),
            answer_timeout: duration_ms_var("RAPIREPORT_ANSWER_TIMEOUT_MS", defaults.answer_timeout),
            ice_servers,
            ..defaults
        };

        if !config.is_configured() {
            warn!("Call subsystem not fully configured - missing environment variables");
        }

        config
    }

    /// Whether enough is set to talk to the backend
    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && self.session_cookie.is_some()
    }

    /// Absolute URL of an endpoint path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}
