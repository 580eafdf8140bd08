use super::machine::{next_state, ConnectionState, SessionInput, SessionMode};
use super::{SessionEvent, SessionEventKind};
use crate::backend::{FleetBackend, StreamEvent, TerminalStream};
use crate::error::SessionError;
use fleet_core::contracts::{CommandRequest, TerminalClientMsg, TerminalServerMsg};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const COMMAND_SOURCE: &str = "console";

type EstablishFuture = Shared<BoxFuture<'static, Result<(), SessionError>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Written to the live stream; output arrives as events.
    Sent,
    Completed {
        output: String,
        exit_code: Option<i64>,
    },
    /// The fallback request failed and a placeholder was rendered instead.
    Simulated { output: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub robot_id: String,
    pub mode: SessionMode,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub fallback_reason: Option<String>,
    pub stream_open: bool,
    pub establishing: bool,
}

struct PendingEstablish {
    cancel: CancellationToken,
    result: EstablishFuture,
}

struct OpenStream {
    outbound: mpsc::Sender<TerminalClientMsg>,
    closer: CancellationToken,
}

impl OpenStream {
    fn close(self) {
        self.closer.cancel();
    }
}

struct SessionInner {
    mode: SessionMode,
    fallback_reason: Option<String>,
    state: ConnectionState,
    /// Bumped whenever in-flight work is superseded; stale tasks compare it
    /// before touching state.
    epoch: u64,
    establish: Option<PendingEstablish>,
    stream: Option<OpenStream>,
    size: Option<(u16, u16)>,
    last_error: Option<String>,
    disposed: bool,
}

/// Interactive command session for one robot.
pub struct RobotSession {
    robot_id: String,
    page_session_id: String,
    backend: Arc<dyn FleetBackend>,
    events: broadcast::Sender<SessionEvent>,
    command_timeout_sec: Option<f64>,
    inner: Mutex<SessionInner>,
}

impl RobotSession {
    pub(crate) fn new(
        robot_id: String,
        page_session_id: String,
        backend: Arc<dyn FleetBackend>,
        events: broadcast::Sender<SessionEvent>,
        command_timeout_sec: Option<f64>,
        fallback_reason: Option<String>,
    ) -> Arc<Self> {
        let mode = if fallback_reason.is_some() {
            SessionMode::Fallback
        } else {
            SessionMode::Live
        };
        let session = Arc::new(Self {
            robot_id,
            page_session_id,
            backend,
            events,
            command_timeout_sec,
            inner: Mutex::new(SessionInner {
                mode,
                fallback_reason: fallback_reason.clone(),
                state: ConnectionState::Disconnected,
                epoch: 0,
                establish: None,
                stream: None,
                size: None,
                last_error: None,
                disposed: false,
            }),
        });
        if let Some(reason) = fallback_reason {
            session.emit(SessionEventKind::FallbackActivated { reason });
        }
        session
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: SessionEventKind) {
        let _ = self.events.send(SessionEvent {
            robot_id: self.robot_id.clone(),
            kind,
        });
    }

    /// Applies `input` through the transition table. `report_from` overrides
    /// the state named in the emitted event after a silent reset.
    fn apply(
        &self,
        inner: &mut SessionInner,
        input: SessionInput,
        report_from: Option<ConnectionState>,
    ) -> bool {
        let Some(next) = next_state(inner.state, input) else {
            debug!(
                event = "session_input_ignored",
                robot_id = %self.robot_id,
                state = inner.state.as_str(),
                input = ?input
            );
            return false;
        };
        let from = report_from.unwrap_or(inner.state);
        inner.state = next;
        if from != next {
            self.emit(SessionEventKind::StateChanged { from, to: next });
        }
        true
    }

    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner().state
    }

    pub fn mode(&self) -> SessionMode {
        self.inner().mode
    }

    pub fn is_disposed(&self) -> bool {
        self.inner().disposed
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner();
        SessionSnapshot {
            robot_id: self.robot_id.clone(),
            mode: inner.mode,
            state: inner.state,
            last_error: inner.last_error.clone(),
            fallback_reason: inner.fallback_reason.clone(),
            stream_open: inner.stream.is_some(),
            establishing: inner.establish.is_some(),
        }
    }

    /// Switches to request/response mode, closing any live stream.
    pub fn activate_fallback(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner();
        if inner.disposed || inner.mode == SessionMode::Fallback {
            return;
        }
        inner.epoch += 1;
        if let Some(pending) = inner.establish.take() {
            pending.cancel.cancel();
        }
        if let Some(stream) = inner.stream.take() {
            stream.close();
        }
        inner.state = ConnectionState::Disconnected;
        inner.mode = SessionMode::Fallback;
        inner.fallback_reason = Some(reason.clone());
        warn!(event = "session_fallback", robot_id = %self.robot_id, reason = %reason);
        self.emit(SessionEventKind::FallbackActivated { reason });
    }

    /// Opens the live session. Concurrent callers share one establishment.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        let pending = {
            let mut inner = self.inner();
            if inner.disposed {
                return Err(SessionError::Disposed);
            }
            if inner.mode == SessionMode::Fallback {
                return Ok(());
            }
            if let Some(pending) = &inner.establish {
                pending.result.clone()
            } else if inner.state == ConnectionState::Connected {
                return Ok(());
            } else {
                self.start_establish(&mut inner, None, None)
            }
        };
        pending.await
    }

    /// Starts a new establishment. With `after`, the new attempt only begins
    /// once the superseded one has resolved.
    fn start_establish(
        self: &Arc<Self>,
        inner: &mut SessionInner,
        report_from: Option<ConnectionState>,
        after: Option<EstablishFuture>,
    ) -> EstablishFuture {
        self.apply(inner, SessionInput::Connect, report_from);
        inner.epoch += 1;
        let epoch = inner.epoch;
        let cancel = CancellationToken::new();
        let session = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            if let Some(previous) = after {
                let _ = previous.await;
            }
            session.establish(epoch, token).await
        });
        let result: EstablishFuture = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => Err(SessionError::Establish(err.to_string())),
            }
        }
        .boxed()
        .shared();
        inner.establish = Some(PendingEstablish {
            cancel,
            result: result.clone(),
        });
        result
    }

    async fn establish(self: Arc<Self>, epoch: u64, cancel: CancellationToken) -> Result<(), SessionError> {
        let opened = AtomicBool::new(false);
        let attempt = async {
            self.backend
                .open_terminal_session(&self.robot_id, &self.page_session_id)
                .await
                .map_err(|err| SessionError::Establish(err.to_string()))?;
            opened.store(true, Ordering::SeqCst);
            let endpoint = self
                .backend
                .stream_endpoint(&self.robot_id, &self.page_session_id)
                .map_err(|err| SessionError::Establish(err.to_string()))?;
            self.backend
                .open_terminal_stream(&endpoint)
                .await
                .map_err(|err| SessionError::Establish(err.to_string()))
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Aborted),
            outcome = attempt => outcome,
        };
        if outcome.is_err() && opened.load(Ordering::SeqCst) {
            release_backend_session(
                Arc::clone(&self.backend),
                self.robot_id.clone(),
                self.page_session_id.clone(),
            )
            .await;
        }

        let mut inner = self.inner();
        if inner.epoch != epoch || inner.disposed {
            if let Ok(stream) = outcome {
                stream.closer.cancel();
            }
            return Err(SessionError::Aborted);
        }
        inner.establish = None;
        match outcome {
            Ok(TerminalStream {
                outbound,
                inbound,
                closer,
            }) => {
                if let Some((cols, rows)) = inner.size {
                    let _ = outbound.try_send(TerminalClientMsg::Resize { cols, rows });
                }
                inner.stream = Some(OpenStream { outbound, closer });
                inner.last_error = None;
                self.apply(&mut inner, SessionInput::Opened, None);
                info!(event = "session_connected", robot_id = %self.robot_id);
                tokio::spawn(Arc::clone(&self).read_stream(epoch, inbound));
                Ok(())
            }
            Err(err) => {
                let message = err.actionable();
                warn!(event = "session_establish_failed", robot_id = %self.robot_id, error = %err);
                inner.last_error = Some(message.clone());
                self.apply(&mut inner, SessionInput::EstablishFailed, None);
                self.emit(SessionEventKind::Error { message });
                Err(err)
            }
        }
    }

    async fn read_stream(self: Arc<Self>, epoch: u64, mut inbound: mpsc::Receiver<StreamEvent>) {
        while let Some(event) = inbound.recv().await {
            match event {
                StreamEvent::Message(TerminalServerMsg::Output { data }) => {
                    if self.inner().epoch != epoch {
                        return;
                    }
                    self.emit(SessionEventKind::Output { data });
                }
                StreamEvent::Message(TerminalServerMsg::Error { message }) => {
                    let message = if message.trim().is_empty() {
                        "terminal stream reported an error".to_string()
                    } else {
                        message
                    };
                    self.end_stream(epoch, SessionInput::ProtocolError, Some(message));
                    return;
                }
                StreamEvent::Message(TerminalServerMsg::Pong | TerminalServerMsg::Other) => {}
                event @ StreamEvent::Closed { .. } if event.is_graceful_close() => {
                    self.end_stream(epoch, SessionInput::GracefulClose, None);
                    return;
                }
                StreamEvent::Closed { code, reason } => {
                    let code = code.map(|code| code.to_string()).unwrap_or_else(|| "none".into());
                    let message = if reason.is_empty() {
                        format!("terminal stream closed unexpectedly (code {code})")
                    } else {
                        format!("terminal stream closed unexpectedly (code {code}): {reason}")
                    };
                    self.end_stream(epoch, SessionInput::AbnormalClose, Some(message));
                    return;
                }
                StreamEvent::Failed(reason) => {
                    self.end_stream(
                        epoch,
                        SessionInput::AbnormalClose,
                        Some(format!("terminal stream failed: {reason}")),
                    );
                    return;
                }
            }
        }
        self.end_stream(
            epoch,
            SessionInput::AbnormalClose,
            Some("terminal stream ended without a close frame".to_string()),
        );
    }

    fn end_stream(&self, epoch: u64, input: SessionInput, error: Option<String>) {
        let mut inner = self.inner();
        if inner.epoch != epoch || inner.disposed {
            return;
        }
        if let Some(stream) = inner.stream.take() {
            stream.close();
        }
        if let Some(message) = &error {
            inner.last_error = Some(SessionError::Stream(message.clone()).actionable());
        }
        self.apply(&mut inner, input, None);
        match error {
            Some(message) => {
                warn!(event = "session_stream_error", robot_id = %self.robot_id, error = %message);
                self.emit(SessionEventKind::Error { message });
            }
            None => info!(event = "session_closed", robot_id = %self.robot_id),
        }
    }

    /// Best-effort keystrokes. Returns false when no stream is open.
    pub fn send_input(&self, data: impl Into<String>) -> bool {
        let inner = self.inner();
        match &inner.stream {
            Some(stream) => stream
                .outbound
                .try_send(TerminalClientMsg::Input { data: data.into() })
                .is_ok(),
            None => false,
        }
    }

    /// Records the terminal size and forwards it when a stream is open. The
    /// latest size is replayed after every (re)connect.
    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        if cols == 0 || rows == 0 {
            return false;
        }
        let mut inner = self.inner();
        inner.size = Some((cols, rows));
        match &inner.stream {
            Some(stream) => stream
                .outbound
                .try_send(TerminalClientMsg::Resize { cols, rows })
                .is_ok(),
            None => false,
        }
    }

    /// Runs one command line. Live sessions connect on first use; fallback
    /// sessions issue a discrete request and never fail hard.
    pub async fn send_command(self: &Arc<Self>, command: &str) -> Result<CommandOutcome, SessionError> {
        let mode = {
            let inner = self.inner();
            if inner.disposed {
                return Err(SessionError::Disposed);
            }
            inner.mode
        };
        match mode {
            SessionMode::Live => {
                self.connect().await?;
                if self.send_input(format!("{command}\n")) {
                    Ok(CommandOutcome::Sent)
                } else {
                    Err(SessionError::NotConnected)
                }
            }
            SessionMode::Fallback => Ok(self.run_fallback(command).await),
        }
    }

    async fn run_fallback(&self, command: &str) -> CommandOutcome {
        let request = CommandRequest {
            command: command.to_string(),
            page_session_id: self.page_session_id.clone(),
            robot_id: self.robot_id.clone(),
            source: COMMAND_SOURCE.to_string(),
            timeout_sec: self.command_timeout_sec,
        };
        match self.backend.run_command(&self.robot_id, &request).await {
            Ok(response) => {
                self.emit(SessionEventKind::Output {
                    data: response.output.clone(),
                });
                CommandOutcome::Completed {
                    output: response.output,
                    exit_code: response.exit_code,
                }
            }
            Err(err) => {
                debug!(event = "fallback_command_failed", robot_id = %self.robot_id, error = %err);
                let output = format!("[simulated] $ {command}\n(command endpoint unavailable: {err})\n");
                self.emit(SessionEventKind::Output {
                    data: output.clone(),
                });
                CommandOutcome::Simulated { output }
            }
        }
    }

    /// Aborts any establishment, drops the current stream without reporting
    /// the intermediate close, and connects again. The new attempt waits for
    /// the aborted one to resolve.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), SessionError> {
        let pending = {
            let mut inner = self.inner();
            if inner.disposed {
                return Err(SessionError::Disposed);
            }
            if inner.mode == SessionMode::Fallback {
                return Ok(());
            }
            let from = inner.state;
            inner.epoch += 1;
            let previous = inner.establish.take().map(|pending| {
                pending.cancel.cancel();
                pending.result
            });
            if let Some(stream) = inner.stream.take() {
                stream.close();
            }
            if let Some(reset) = next_state(from, SessionInput::Dispose) {
                inner.state = reset;
            }
            info!(event = "session_reconnect", robot_id = %self.robot_id, from = from.as_str());
            self.start_establish(&mut inner, Some(from), previous)
        };
        pending.await
    }

    /// Idempotent. Releases the backend session in the background; only the
    /// first call returns the release task.
    pub fn dispose(&self) -> Option<JoinHandle<()>> {
        {
            let mut inner = self.inner();
            if inner.disposed {
                return None;
            }
            inner.epoch += 1;
            if let Some(pending) = inner.establish.take() {
                pending.cancel.cancel();
            }
            if let Some(stream) = inner.stream.take() {
                stream.close();
            }
            self.apply(&mut inner, SessionInput::Dispose, None);
            inner.disposed = true;
        }
        info!(event = "session_disposed", robot_id = %self.robot_id);

        let runtime = tokio::runtime::Handle::try_current().ok()?;
        Some(runtime.spawn(release_backend_session(
            Arc::clone(&self.backend),
            self.robot_id.clone(),
            self.page_session_id.clone(),
        )))
    }
}

/// Best-effort `DELETE` of the backend terminal session.
async fn release_backend_session(
    backend: Arc<dyn FleetBackend>,
    robot_id: String,
    page_session_id: String,
) {
    if let Err(err) = backend
        .close_terminal_session(&robot_id, &page_session_id)
        .await
    {
        debug!(event = "session_release_failed", robot_id = %robot_id, error = %err);
    }
}
