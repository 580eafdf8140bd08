//! Per-robot interactive command sessions.
//!
//! A session is either `Live` (a bidirectional terminal stream) or
//! `Fallback` (one request per command). Connection state follows the table
//! in [`machine`]; events for every session fan out on one broadcast channel.

pub mod machine;
mod robot;

pub use machine::{next_state, ConnectionState, SessionInput, SessionMode};
pub use robot::{CommandOutcome, RobotSession, SessionSnapshot, COMMAND_SOURCE};

use crate::backend::FleetBackend;
use crate::config::RuntimeConfig;
use crate::error::SessionError;
use crate::store::FleetStore;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How long a process should wait for session releases before exiting.
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub robot_id: String,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Output {
        data: String,
    },
    Error {
        message: String,
    },
    FallbackActivated {
        reason: String,
    },
}

pub struct SessionManager {
    store: Arc<FleetStore>,
    backend: Arc<dyn FleetBackend>,
    page_session_id: String,
    interactive: bool,
    command_timeout_sec: Option<f64>,
    sessions: Mutex<HashMap<String, Arc<RobotSession>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        store: Arc<FleetStore>,
        backend: Arc<dyn FleetBackend>,
        page_session_id: String,
        config: &RuntimeConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            backend,
            page_session_id,
            interactive: config.interactive_terminal,
            command_timeout_sec: Some(config.command_timeout_sec),
            sessions: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<RobotSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Returns the session for `robot_id`, creating it on first use. New
    /// sessions start in fallback when the host cannot drive a live terminal
    /// or no stream endpoint can be built.
    pub fn session(&self, robot_id: &str) -> Result<Arc<RobotSession>, SessionError> {
        if !self.store.contains(robot_id) {
            return Err(SessionError::UnknownRobot(robot_id.to_string()));
        }
        let mut sessions = self.sessions();
        if let Some(existing) = sessions.get(robot_id) {
            if !existing.is_disposed() {
                return Ok(Arc::clone(existing));
            }
        }

        let fallback_reason = if !self.interactive {
            Some("interactive terminal unavailable".to_string())
        } else {
            self.backend
                .stream_endpoint(robot_id, &self.page_session_id)
                .err()
                .map(|err| err.to_string())
        };
        info!(
            event = "session_created",
            robot_id,
            mode = if fallback_reason.is_some() { "fallback" } else { "live" }
        );
        let session = RobotSession::new(
            robot_id.to_string(),
            self.page_session_id.clone(),
            Arc::clone(&self.backend),
            self.events.clone(),
            self.command_timeout_sec,
            fallback_reason,
        );
        sessions.insert(robot_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, robot_id: &str) -> Option<Arc<RobotSession>> {
        self.sessions().get(robot_id).cloned()
    }

    pub fn dispose(&self, robot_id: &str) -> Option<JoinHandle<()>> {
        let session = self.sessions().remove(robot_id);
        session.and_then(|session| session.dispose())
    }

    pub fn dispose_all(&self) -> Vec<JoinHandle<()>> {
        let drained: Vec<_> = self.sessions().drain().map(|(_, session)| session).collect();
        drained
            .into_iter()
            .filter_map(|session| session.dispose())
            .collect()
    }

    /// Disposes every session and waits up to `timeout` for the backend
    /// releases. Returns false when the wait ran out.
    pub async fn release_all(&self, timeout: Duration) -> bool {
        let releases = self.dispose_all();
        if releases.is_empty() {
            return true;
        }
        let count = releases.len();
        match tokio::time::timeout(timeout, join_all(releases)).await {
            Ok(_) => true,
            Err(_) => {
                warn!(event = "session_release_timeout", sessions = count);
                false
            }
        }
    }
}
