use crate::backend::{FleetBackend, StreamEvent, TerminalStream, STREAM_CHANNEL_CAPACITY};
use crate::error::BackendError;
use async_trait::async_trait;
use fleet_core::contracts::{
    decode_frame, decode_robot_list, decode_server_message, encode_client_message, CommandRequest,
    CommandResponse, FixJob, FixRunRequest, FrameError, MonitorConfig, MonitorConfigPatch,
    OnlineCheckRequest, OnlineCheckResponse, RobotList, SessionRequest, TerminalClientMsg,
    TerminalServerMsg, TestRunRequest, TestRunResponse, DEFAULT_MAX_FRAME_BYTES,
};
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

pub const MAX_RESPONSE_BYTES: usize = 8 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DETAIL_LIMIT: usize = 240;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// HTTP + WebSocket implementation of [`FleetBackend`].
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base: Url,
    max_frame_bytes: usize,
    max_response_bytes: usize,
}

impl HttpBackend {
    pub fn new(base: Url) -> Result<Self, BackendError> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_response_bytes: MAX_RESPONSE_BYTES,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|_| BackendError::Endpoint(format!("{} cannot be a base url", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        response: Response,
    ) -> Result<T, BackendError> {
        let bytes = read_body(endpoint, response, self.max_response_bytes).await?;
        Ok(decode_frame(&bytes, self.max_response_bytes)?)
    }
}

/// Reads the body chunk by chunk and gives up as soon as it passes `limit`.
async fn read_body(
    endpoint: &str,
    mut response: Response,
    limit: usize,
) -> Result<Vec<u8>, BackendError> {
    let status = response.status();
    if let Some(declared) = response.content_length() {
        let declared = usize::try_from(declared).unwrap_or(usize::MAX);
        if declared > limit {
            return Err(FrameError::OversizedFrame {
                size: declared,
                max: limit,
            }
            .into());
        }
    }
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let size = bytes.len() + chunk.len();
        if size > limit {
            return Err(FrameError::OversizedFrame { size, max: limit }.into());
        }
        bytes.extend_from_slice(&chunk);
    }
    if !status.is_success() {
        return Err(BackendError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            detail: extract_detail(&bytes)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string()),
        });
    }
    Ok(bytes)
}

/// Error bodies carry a `detail` field. Anything else is shown as trimmed text.
pub fn extract_detail(body: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        match value.get("detail") {
            Some(Value::String(detail)) if !detail.trim().is_empty() => {
                return Some(detail.trim().to_string())
            }
            Some(Value::Null) | None => {}
            Some(other) => return Some(truncate(&other.to_string())),
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(truncate(text))
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= DETAIL_LIMIT {
        return text.to_string();
    }
    let mut out: String = text.chars().take(DETAIL_LIMIT).collect();
    out.push('…');
    out
}

/// Maps the backend base url onto the matching websocket scheme.
pub fn websocket_url(mut url: Url) -> Result<Url, BackendError> {
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(url),
        other => {
            return Err(BackendError::Endpoint(format!(
                "no websocket scheme for {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| BackendError::Endpoint(format!("cannot switch {url} to {scheme}")))?;
    Ok(url)
}

#[async_trait]
impl FleetBackend for HttpBackend {
    async fn fetch_robots(&self) -> Result<RobotList, BackendError> {
        let url = self.endpoint(&["api", "robots"])?;
        let response = self.client.get(url).send().await?;
        let bytes = read_body("GET /api/robots", response, self.max_response_bytes).await?;
        Ok(decode_robot_list(&bytes, self.max_response_bytes)?)
    }

    async fn run_tests(
        &self,
        robot_id: &str,
        request: &TestRunRequest,
    ) -> Result<TestRunResponse, BackendError> {
        let url = self.endpoint(&["api", "robots", robot_id, "tests", "run"])?;
        debug!(event = "tests_run_request", robot_id, test_ids = ?request.test_ids);
        let response = self.client.post(url).json(request).send().await?;
        self.read_json("POST /api/robots/{id}/tests/run", response).await
    }

    async fn online_check(
        &self,
        request: &OnlineCheckRequest,
    ) -> Result<OnlineCheckResponse, BackendError> {
        let url = self.endpoint(&["api", "robots", "online-check"])?;
        let response = self.client.post(url).json(request).send().await?;
        self.read_json("POST /api/robots/online-check", response).await
    }

    async fn start_fix(
        &self,
        robot_id: &str,
        fix_id: &str,
        request: &FixRunRequest,
    ) -> Result<FixJob, BackendError> {
        let url = self.endpoint(&["api", "robots", robot_id, "fixes", fix_id, "runs"])?;
        debug!(event = "fix_start_request", robot_id, fix_id);
        let response = self.client.post(url).json(request).send().await?;
        self.read_json("POST /api/robots/{id}/fixes/{fixId}/runs", response)
            .await
    }

    async fn fix_status(&self, robot_id: &str, run_id: &str) -> Result<FixJob, BackendError> {
        let url = self.endpoint(&["api", "robots", robot_id, "fixes", "runs", run_id])?;
        let response = self.client.get(url).send().await?;
        self.read_json("GET /api/robots/{id}/fixes/runs/{runId}", response)
            .await
    }

    async fn open_terminal_session(
        &self,
        robot_id: &str,
        page_session_id: &str,
    ) -> Result<(), BackendError> {
        let url = self.endpoint(&["api", "robots", robot_id, "terminal", "session"])?;
        let body = SessionRequest {
            page_session_id: page_session_id.to_string(),
        };
        let response = self.client.post(url).json(&body).send().await?;
        read_body(
            "POST /api/robots/{id}/terminal/session",
            response,
            self.max_response_bytes,
        )
        .await?;
        Ok(())
    }

    async fn close_terminal_session(
        &self,
        robot_id: &str,
        page_session_id: &str,
    ) -> Result<(), BackendError> {
        let mut url = self.endpoint(&["api", "robots", robot_id, "terminal", "session"])?;
        url.query_pairs_mut()
            .append_pair("pageSessionId", page_session_id);
        let response = self.client.delete(url).send().await?;
        read_body(
            "DELETE /api/robots/{id}/terminal/session",
            response,
            self.max_response_bytes,
        )
        .await?;
        Ok(())
    }

    async fn open_terminal_stream(&self, endpoint: &Url) -> Result<TerminalStream, BackendError> {
        let (ws, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|err| BackendError::Stream(err.to_string()))?;
        let (outbound_tx, outbound_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let closer = CancellationToken::new();
        tokio::spawn(pump_stream(
            ws,
            outbound_rx,
            inbound_tx,
            closer.clone(),
            self.max_frame_bytes,
        ));
        Ok(TerminalStream {
            outbound: outbound_tx,
            inbound: inbound_rx,
            closer,
        })
    }

    async fn run_command(
        &self,
        robot_id: &str,
        request: &CommandRequest,
    ) -> Result<CommandResponse, BackendError> {
        let url = self.endpoint(&["api", "robots", robot_id, "terminal"])?;
        let response = self.client.post(url).json(request).send().await?;
        self.read_json("POST /api/robots/{id}/terminal", response).await
    }

    async fn update_monitor_config(
        &self,
        patch: &MonitorConfigPatch,
    ) -> Result<MonitorConfig, BackendError> {
        patch.validate()?;
        let url = self.endpoint(&["api", "monitor", "config"])?;
        let response = self.client.patch(url).json(patch).send().await?;
        self.read_json("PATCH /api/monitor/config", response).await
    }

    fn stream_endpoint(&self, robot_id: &str, page_session_id: &str) -> Result<Url, BackendError> {
        let url = self.endpoint(&["api", "robots", robot_id, "terminal", "stream"])?;
        let mut url = websocket_url(url)?;
        url.query_pairs_mut()
            .append_pair("pageSessionId", page_session_id);
        Ok(url)
    }
}

async fn pump_stream(
    mut ws: WsStream,
    mut outbound: mpsc::Receiver<TerminalClientMsg>,
    inbound: mpsc::Sender<StreamEvent>,
    closer: CancellationToken,
    max_frame_bytes: usize,
) {
    let last_event = loop {
        tokio::select! {
            biased;
            _ = closer.cancelled() => {
                let _ = ws.close(None).await;
                return;
            }
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match decode_server_message(&text, max_frame_bytes) {
                        Ok(TerminalServerMsg::Pong) | Ok(TerminalServerMsg::Other) => {}
                        Ok(message) => {
                            if inbound.send(StreamEvent::Message(message)).await.is_err() {
                                break None;
                            }
                        }
                        Err(err) => warn!(event = "terminal_frame_dropped", error = %err),
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let data = String::from_utf8_lossy(&bytes).into_owned();
                    let message = TerminalServerMsg::Output { data };
                    if inbound.send(StreamEvent::Message(message)).await.is_err() {
                        break None;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    break Some(StreamEvent::Closed { code, reason });
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break Some(StreamEvent::Failed(err.to_string())),
                None => break Some(StreamEvent::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                }),
            },
            outgoing = outbound.recv() => match outgoing {
                Some(message) => match encode_client_message(&message, max_frame_bytes) {
                    Ok(text) => {
                        if let Err(err) = ws.send(Message::Text(text)).await {
                            break Some(StreamEvent::Failed(err.to_string()));
                        }
                    }
                    Err(err) => warn!(event = "terminal_send_dropped", error = %err),
                },
                None => {
                    let _ = ws.close(None).await;
                    return;
                }
            },
        }
    };
    if let Some(event) = last_event {
        debug!(event = "terminal_stream_ended", detail = ?event);
        let _ = inbound.send(event).await;
    }
}
