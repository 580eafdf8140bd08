use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMode {
    Live,
    Fallback,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Live => "live",
            SessionMode::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    /// First command, explicit connect, or reconnect.
    Connect,
    /// Session established and stream open.
    Opened,
    /// Establishment or stream open failed, or was aborted.
    EstablishFailed,
    GracefulClose,
    AbnormalClose,
    ProtocolError,
    Dispose,
}

/// Transition table. `None` means the input is ignored in that state.
pub fn next_state(current: ConnectionState, input: SessionInput) -> Option<ConnectionState> {
    use ConnectionState::*;
    use SessionInput::*;
    match (current, input) {
        (_, Dispose) => Some(Disconnected),
        (Disconnected | Error, Connect) => Some(Connecting),
        (Connecting, Opened) => Some(Connected),
        (Connecting, EstablishFailed) => Some(Error),
        (Connected, GracefulClose) => Some(Disconnected),
        (Connected, AbnormalClose | ProtocolError) => Some(Error),
        _ => None,
    }
}
