//! Interactive watch loop for one container
//!
//! Binds a monitoring session and drives it from the terminal: stats
//! and stream status are rendered on a fixed cadence, log lines print
//! as they arrive, and lifecycle commands are read line by line from
//! stdin. Plain text only.

use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::api::ContainerAction;
use crate::models::StatsSnapshot;
use crate::session::{ActionError, MonitorSession, SessionContext, SessionState, StreamStatus};

pub async fn run(ctx: SessionContext, container_id: String) -> Result<()> {
    println!("Watching container {container_id} - commands: restart, stop, remove, quit");
    let session = MonitorSession::bind(ctx, container_id);

    let mut view = ViewTracker::default();
    let mut render = tokio::time::interval(Duration::from_millis(500));
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = render.tick() => {
                view.render(&session.state());
            }
            line = stdin.next_line() => {
                match line? {
                    None => break,
                    Some(cmd) => match cmd.trim() {
                        "" => {}
                        "quit" | "q" | "exit" => break,
                        "restart" => dispatch(&session, ContainerAction::Restart).await,
                        "stop" => dispatch(&session, ContainerAction::Stop).await,
                        "remove" => dispatch(&session, ContainerAction::Remove).await,
                        other => {
                            println!("unknown command: {other} (restart, stop, remove, quit)");
                        }
                    },
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("Closing session...");
    session.close().await;
    Ok(())
}

async fn dispatch(session: &MonitorSession, action: ContainerAction) {
    match session.dispatch(action).await {
        Ok(()) => println!("> {action} requested for {}", session.identity()),
        Err(ActionError::Busy) => println!("> another action is still in flight"),
        Err(e) => println!("> {e}"),
    }
}

/// Tracks what has already been printed so each render pass only emits
/// changes: fresh log lines, a new snapshot, or status transitions.
#[derive(Default)]
struct ViewTracker {
    seen_lines: u64,
    last_stats: Option<StatsSnapshot>,
    last_stats_printed: bool,
    last_error: Option<String>,
    last_message: Option<String>,
    last_stream: Option<StreamStatus>,
}

impl ViewTracker {
    fn render(&mut self, state: &SessionState) {
        if state.logs.truncated() {
            let first_retained = state.logs.total_received() - state.logs.len() as u64;
            if self.seen_lines > 0 && self.seen_lines < first_retained {
                println!(
                    "-- {} log line(s) dropped from the buffer",
                    first_retained - self.seen_lines
                );
            }
        }
        let (fresh, mark) = state.logs.since(self.seen_lines);
        for line in fresh {
            println!("{line}");
        }
        self.seen_lines = mark;

        if state.stream_status != self.last_stream.clone().unwrap_or(StreamStatus::Connecting) {
            match &state.stream_status {
                StreamStatus::Connecting => {}
                StreamStatus::Streaming => println!("-- log stream connected"),
                StreamStatus::Reconnecting { attempt } => {
                    println!("-- log stream dropped, reconnecting (attempt {attempt})");
                }
                StreamStatus::Disconnected => println!("-- log stream disconnected"),
            }
        }
        self.last_stream = Some(state.stream_status.clone());

        if state.stats != self.last_stats || !self.last_stats_printed {
            let ts = Local::now().format("%H:%M:%S");
            match &state.stats {
                Some(s) => println!(
                    "[{ts}] cpu {:.2}%  ram {:.1} / {:.1} MB  net {:.1} rx / {:.1} tx KB",
                    s.cpu, s.memory_usage, s.memory_limit, s.network_rx, s.network_tx
                ),
                None if state.stats_loading => println!("[{ts}] loading stats..."),
                None => println!("[{ts}] no statistics available"),
            }
            self.last_stats = state.stats.clone();
            self.last_stats_printed = true;
        }

        if state.stats_error != self.last_error {
            if let Some(error) = &state.stats_error {
                println!("!! {error}");
            }
            self.last_error = state.stats_error.clone();
        }

        if state.action_message != self.last_message {
            if let Some(message) = &state.action_message {
                println!("** {message}");
            }
            self.last_message = state.action_message.clone();
        }
    }
}
