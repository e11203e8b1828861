//! Session state reporting
//!
//! The engine reports its progress with state names such as `CONNECTED` or
//! `ADD_ROUTES`. They are folded into the small [`SessionState`] enum by
//! [`state_from_engine`]; [`state_label`] turns a state back into text.

use serde::Serialize;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    WaitingForReply,
    ServerReplied,
    Connected,
    Paused,
    AuthFailed,
    WaitingForUserInput,
}

/// Why the tunnel is paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PauseReason {
    NoNetwork,
    UserPause,
    ScreenOff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub state: SessionState,
    /// Engine state name, or a local name such as `USER_VPN_PAUSED`
    pub name: String,
    pub detail: String,
    pub pause_reason: Option<PauseReason>,
}

impl StateUpdate {
    pub fn from_engine(name: &str, detail: &str) -> Self {
        Self {
            state: state_from_engine(name),
            name: name.to_string(),
            detail: detail.to_string(),
            pause_reason: None,
        }
    }

    pub fn paused(reason: PauseReason) -> Self {
        let name = match reason {
            PauseReason::NoNetwork => "NONETWORK",
            PauseReason::UserPause => "USER_VPN_PAUSED",
            PauseReason::ScreenOff => "SCREENOFF",
        };
        Self {
            state: SessionState::Paused,
            name: name.to_string(),
            detail: String::new(),
            pause_reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    /// Map an engine log flag (`I`, `W`, `D`, `F`, ...) to a level
    pub fn from_flag(flag: &str) -> Self {
        match flag {
            "W" => LogLevel::Warning,
            "D" => LogLevel::Debug,
            "F" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Fold an engine state name into a session state
pub fn state_from_engine(name: &str) -> SessionState {
    match name {
        "CONNECTED" => SessionState::Connected,
        "DISCONNECTED" | "EXITING" | "NOPROCESS" => SessionState::Disconnected,
        "AUTH_FAILED" => SessionState::AuthFailed,
        "USER_VPN_PAUSED" | "NONETWORK" | "SCREENOFF" => SessionState::Paused,
        "NEED_USER_INPUT" | "USER_INPUT" => SessionState::WaitingForUserInput,
        "AUTH" | "AUTH_PENDING" | "GET_CONFIG" | "ASSIGN_IP" | "ADD_ROUTES" => {
            SessionState::ServerReplied
        }
        // CONNECTING, WAIT, RECONNECTING, RESOLVE, TCP_CONNECT, CONNECTRETRY
        // and anything newer engines invent
        _ => SessionState::WaitingForReply,
    }
}

pub fn state_label(state: SessionState) -> &'static str {
    match state {
        SessionState::Disconnected => "disconnected",
        SessionState::WaitingForReply => "connecting",
        SessionState::ServerReplied => "server replied",
        SessionState::Connected => "connected",
        SessionState::Paused => "paused",
        SessionState::AuthFailed => "authentication failed",
        SessionState::WaitingForUserInput => "waiting for user input",
    }
}

/// Receiver of everything the session reports
pub trait StatusSink: Send + Sync {
    fn state(&self, update: StateUpdate);
    /// Running totals since the engine started
    fn byte_count(&self, total_in: u64, total_out: u64);
    fn log(&self, level: LogLevel, verbosity: u8, text: &str);
    /// The engine is blocked on a credential nobody has supplied
    fn need_user_input(&self, kind: &str);
}

/// Reports through `tracing`
pub struct TracingStatus {
    max_verbosity: u8,
}

impl TracingStatus {
    pub fn new(max_verbosity: u8) -> Self {
        Self { max_verbosity }
    }
}

impl Default for TracingStatus {
    fn default() -> Self {
        Self::new(3)
    }
}

impl StatusSink for TracingStatus {
    fn state(&self, update: StateUpdate) {
        match update.pause_reason {
            Some(reason) => info!("Session {} ({:?})", state_label(update.state), reason),
            None if update.detail.is_empty() => {
                info!("Session {} [{}]", state_label(update.state), update.name)
            }
            None => info!(
                "Session {} [{}: {}]",
                state_label(update.state),
                update.name,
                update.detail
            ),
        }
    }

    fn byte_count(&self, total_in: u64, total_out: u64) {
        debug!("Traffic: {} bytes in, {} bytes out", total_in, total_out);
    }

    fn log(&self, level: LogLevel, verbosity: u8, text: &str) {
        if verbosity > self.max_verbosity {
            return;
        }
        match level {
            LogLevel::Error => error!("engine: {}", text),
            LogLevel::Warning => warn!("engine: {}", text),
            LogLevel::Info => info!("engine: {}", text),
            LogLevel::Debug => debug!("engine: {}", text),
        }
    }

    fn need_user_input(&self, kind: &str) {
        warn!("Engine needs '{}' but no credential is available", kind);
    }
}
