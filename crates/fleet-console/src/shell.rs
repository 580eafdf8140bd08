use crate::controller::Console;
use anyhow::Context;
use fleet_core::normalize::strip_ansi;
use fleet_runtime::session::{
    CommandOutcome, SessionEvent, SessionEventKind, SessionMode, RELEASE_TIMEOUT,
};
use std::io::{self, IsTerminal, Write};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const RECONNECT: &str = ":reconnect";
const QUIT: &str = ":quit";

/// Line-oriented shell on one robot until `:quit`, end of input or Ctrl-C.
pub async fn run(console: &Console, robot_id: &str, shutdown: &CancellationToken) -> anyhow::Result<()> {
    let events = console.sessions.subscribe();
    let session = console
        .sessions
        .session(robot_id)
        .with_context(|| format!("opening a session on {robot_id}"))?;
    if session.mode() == SessionMode::Live {
        match crossterm::terminal::size() {
            Ok((cols, rows)) => {
                session.resize(cols, rows);
            }
            Err(err) => session.activate_fallback(format!("terminal size unavailable: {err}")),
        }
    }
    let printer = tokio::spawn(print_events(events, robot_id.to_string()));
    debug!(
        event = "shell_started",
        robot_id,
        page_session_id = %console.page_session_id,
        mode = session.mode().as_str()
    );

    eprintln!(
        "{robot_id} ({} mode). {RECONNECT} to reconnect, {QUIT} to leave.",
        session.mode().as_str()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut outcome: anyhow::Result<()> = Ok(());
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                outcome = Err(err).context("reading stdin");
                break;
            }
        };
        match line.trim() {
            "" => continue,
            QUIT => break,
            RECONNECT => {
                if let Err(err) = session.reconnect().await {
                    eprintln!("reconnect failed: {}", err.actionable());
                }
            }
            command => match session.send_command(command).await {
                Ok(CommandOutcome::Completed {
                    exit_code: Some(code),
                    ..
                }) if code != 0 => eprintln!("[exit {code}]"),
                Ok(_) => {}
                Err(err) => eprintln!("{}", err.actionable()),
            },
        }
    }

    if let Some(release) = console.sessions.dispose(robot_id) {
        let _ = tokio::time::timeout(RELEASE_TIMEOUT, release).await;
    }
    printer.abort();
    outcome
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>, robot_id: String) {
    let raw = io::stdout().is_terminal();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(event = "session_events_lagged", missed);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if event.robot_id != robot_id {
            continue;
        }
        match event.kind {
            SessionEventKind::Output { data } => {
                let mut stdout = io::stdout();
                let written = if raw {
                    stdout.write_all(data.as_bytes())
                } else {
                    stdout.write_all(strip_ansi(&data).as_bytes())
                };
                if written.and_then(|_| stdout.flush()).is_err() {
                    break;
                }
            }
            SessionEventKind::StateChanged { from, to } => eprintln!("[{from} -> {to}]"),
            SessionEventKind::Error { message } => eprintln!("[error] {message}"),
            SessionEventKind::FallbackActivated { reason } => {
                eprintln!("[fallback] {reason}; commands run one at a time")
            }
        }
    }
}
