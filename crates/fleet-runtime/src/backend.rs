//! The request/response contract the runtime depends on.

use crate::error::BackendError;
use async_trait::async_trait;
use fleet_core::contracts::{
    CommandRequest, CommandResponse, FixJob, FixRunRequest, MonitorConfig, MonitorConfigPatch,
    OnlineCheckRequest, OnlineCheckResponse, RobotList, TerminalClientMsg, TerminalServerMsg,
    TestRunRequest, TestRunResponse,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const STREAM_CHANNEL_CAPACITY: usize = 256;

/// What the reader side of a terminal stream observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Message(TerminalServerMsg),
    Closed { code: Option<u16>, reason: String },
    Failed(String),
}

impl StreamEvent {
    /// Normal closure and going-away are the only graceful codes.
    pub fn is_graceful_close(&self) -> bool {
        matches!(self, StreamEvent::Closed { code: Some(1000 | 1001), .. })
    }
}

/// An open terminal stream. Dropping `outbound` or cancelling `closer` ends
/// the underlying connection.
#[derive(Debug)]
pub struct TerminalStream {
    pub outbound: mpsc::Sender<TerminalClientMsg>,
    pub inbound: mpsc::Receiver<StreamEvent>,
    pub closer: CancellationToken,
}

#[async_trait]
pub trait FleetBackend: Send + Sync {
    async fn fetch_robots(&self) -> Result<RobotList, BackendError>;

    async fn run_tests(
        &self,
        robot_id: &str,
        request: &TestRunRequest,
    ) -> Result<TestRunResponse, BackendError>;

    async fn online_check(
        &self,
        request: &OnlineCheckRequest,
    ) -> Result<OnlineCheckResponse, BackendError>;

    async fn start_fix(
        &self,
        robot_id: &str,
        fix_id: &str,
        request: &FixRunRequest,
    ) -> Result<FixJob, BackendError>;

    async fn fix_status(&self, robot_id: &str, run_id: &str) -> Result<FixJob, BackendError>;

    async fn open_terminal_session(
        &self,
        robot_id: &str,
        page_session_id: &str,
    ) -> Result<(), BackendError>;

    async fn close_terminal_session(
        &self,
        robot_id: &str,
        page_session_id: &str,
    ) -> Result<(), BackendError>;

    async fn open_terminal_stream(&self, endpoint: &Url) -> Result<TerminalStream, BackendError>;

    async fn run_command(
        &self,
        robot_id: &str,
        request: &CommandRequest,
    ) -> Result<CommandResponse, BackendError>;

    async fn update_monitor_config(
        &self,
        patch: &MonitorConfigPatch,
    ) -> Result<MonitorConfig, BackendError>;

    /// Address of the terminal stream for one robot and console session.
    fn stream_endpoint(&self, robot_id: &str, page_session_id: &str) -> Result<Url, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_normal_and_going_away_are_graceful() {
        let close = |code| StreamEvent::Closed {
            code,
            reason: String::new(),
        };
        assert!(close(Some(1000)).is_graceful_close());
        assert!(close(Some(1001)).is_graceful_close());
        assert!(!close(Some(1006)).is_graceful_close());
        assert!(!close(Some(1011)).is_graceful_close());
        assert!(!close(None).is_graceful_close());
        assert!(!StreamEvent::Failed("reset".into()).is_graceful_close());
    }
}
