//! Container Monitoring Session
//!
//! One session binds a container identity and concurrently polls the
//! stats endpoint, consumes the log stream and applies operator
//! actions. `SessionState` has exactly one writer: the controller task
//! in this module. The poller, stream and action tasks only emit
//! events; readers observe state through cloned snapshots.

pub mod actions;
pub mod poller;
pub mod stream;

#[cfg(test)]
mod integration_tests;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::api::{ApiClient, ApiError, ContainerAction};
use crate::config::ConsoleConfig;
use crate::models::StatsSnapshot;
use crate::state::{new_state, Shared};

pub use actions::{ActionError, ActionOutcome};
pub use stream::RetryPolicy;

/// Ownership token for session bindings. Every event carries the
/// generation of the session that produced it; the controller rejects
/// mismatches, so a torn-down session can never mutate a successor.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Unbound,
    Starting,
    Live,
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Connecting,
    Streaming,
    Reconnecting { attempt: u32 },
    Disconnected,
}

/// Ordered, append-only log line buffer with a bounded retention cap.
/// Arrival order of retained lines is preserved exactly; when the cap
/// is reached the oldest line is dropped and the total-received counter
/// keeps truncation observable.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    cap: usize,
    total: u64,
}

impl LogBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            cap: cap.max(1),
            total: 0,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.total += 1;
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines received over the session's lifetime, including dropped ones.
    pub fn total_received(&self) -> u64 {
        self.total
    }

    pub fn truncated(&self) -> bool {
        self.total > self.lines.len() as u64
    }

    pub fn contents(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Retained lines with sequence number >= `seen`, plus the new
    /// high-water mark to pass back on the next call.
    pub fn since(&self, seen: u64) -> (Vec<String>, u64) {
        let first = self.total - self.lines.len() as u64;
        let skip = seen.saturating_sub(first) as usize;
        (self.lines.iter().skip(skip).cloned().collect(), self.total)
    }
}

/// Externally observable session state. Mutated only by the controller.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub stats_loading: bool,
    pub stats_error: Option<String>,
    pub stats: Option<StatsSnapshot>,
    pub action_in_flight: bool,
    pub action_message: Option<String>,
    pub stream_status: StreamStatus,
    pub logs: LogBuffer,
}

impl SessionState {
    fn new(log_retention: usize) -> Self {
        Self {
            phase: SessionPhase::Starting,
            stats_loading: true,
            stats_error: None,
            stats: None,
            action_in_flight: false,
            action_message: None,
            stream_status: StreamStatus::Connecting,
            logs: LogBuffer::new(log_retention),
        }
    }
}

/// Everything a session needs at construction. The credential source is
/// carried inside the [`ApiClient`] and read at request time.
#[derive(Clone)]
pub struct SessionContext {
    pub api: ApiClient,
    pub ws_base: String,
    pub node: String,
    pub poll_interval: Duration,
    pub log_retention: usize,
    pub stream_retry: RetryPolicy,
}

impl SessionContext {
    pub fn from_config(api: ApiClient, config: &ConsoleConfig) -> Self {
        Self {
            api,
            ws_base: config.server.ws_base(),
            node: config.server.node.clone(),
            poll_interval: config.session.poll_interval(),
            log_retention: config.session.log_retention,
            stream_retry: RetryPolicy {
                max_attempts: config.session.stream_retry_max,
                base_delay: config.session.stream_retry_base(),
            },
        }
    }
}

#[derive(Debug)]
pub(crate) enum SessionEvent {
    Stats {
        generation: u64,
        tick: u64,
        result: Result<StatsSnapshot, ApiError>,
    },
    Line {
        generation: u64,
        line: String,
    },
    Stream {
        generation: u64,
        status: StreamStatus,
    },
    ActionDone {
        generation: u64,
        action: ContainerAction,
        outcome: Result<ActionOutcome, ActionError>,
    },
}

impl SessionEvent {
    fn generation(&self) -> u64 {
        match self {
            SessionEvent::Stats { generation, .. }
            | SessionEvent::Line { generation, .. }
            | SessionEvent::Stream { generation, .. }
            | SessionEvent::ActionDone { generation, .. } => *generation,
        }
    }
}

enum ControlMsg {
    Dispatch {
        action: ContainerAction,
        reply: oneshot::Sender<Result<(), ActionError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a bound monitoring session. Dropping the handle tears the
/// session down; [`MonitorSession::close`] does so deterministically.
pub struct MonitorSession {
    shared: Shared<SessionState>,
    ctrl: mpsc::UnboundedSender<ControlMsg>,
    join: JoinHandle<()>,
    identity: String,
}

impl MonitorSession {
    /// Bind a container identity: opens the log stream, issues the
    /// first stats request and arms the poll timer.
    pub fn bind(ctx: SessionContext, identity: impl Into<String>) -> Self {
        let identity = identity.into();
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::SeqCst);
        info!(
            "binding monitoring session for container {} (generation {})",
            identity, generation
        );

        let shared = new_state(SessionState::new(ctx.log_retention));
        let issued = Arc::new(AtomicU64::new(0));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (nudge_tx, nudge_rx) = mpsc::unbounded_channel();

        let poller = poller::spawn(
            ctx.api.clone(),
            ctx.node.clone(),
            identity.clone(),
            generation,
            issued.clone(),
            events_tx.clone(),
            nudge_rx,
            ctx.poll_interval,
        );
        let stream = stream::spawn(
            ctx.ws_base.clone(),
            ctx.node.clone(),
            identity.clone(),
            ctx.api.token_source(),
            generation,
            events_tx.clone(),
            ctx.stream_retry.clone(),
        );

        let controller = Controller::new(
            generation,
            identity.clone(),
            ctx.node.clone(),
            ctx.api,
            shared.clone(),
            issued,
            nudge_tx,
            events_tx,
        );
        let join = tokio::spawn(run_controller(controller, events_rx, ctrl_rx, poller, stream));

        Self {
            shared,
            ctrl: ctrl_tx,
            join,
            identity,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Snapshot of the current session state.
    pub fn state(&self) -> SessionState {
        self.shared.lock().clone()
    }

    /// Dispatch a lifecycle action. Rejected with [`ActionError::Busy`]
    /// while another action is in flight.
    pub async fn dispatch(&self, action: ContainerAction) -> Result<(), ActionError> {
        let (reply, rx) = oneshot::channel();
        self.ctrl
            .send(ControlMsg::Dispatch { action, reply })
            .map_err(|_| ActionError::SessionClosed)?;
        rx.await.map_err(|_| ActionError::SessionClosed)?
    }

    /// Tear the session down: closes the stream, cancels the poll timer
    /// and waits until both tasks have confirmed termination. Returns
    /// the final state.
    pub async fn close(self) -> SessionState {
        let MonitorSession {
            shared, ctrl, join, ..
        } = self;
        let (done, rx) = oneshot::channel();
        let _ = ctrl.send(ControlMsg::Close { done });
        let _ = rx.await;
        let _ = join.await;
        let state = shared.lock().clone();
        state
    }
}

struct Controller {
    generation: u64,
    phase: SessionPhase,
    identity: String,
    node: String,
    api: ApiClient,
    shared: Shared<SessionState>,
    issued: Arc<AtomicU64>,
    nudge: mpsc::UnboundedSender<()>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    fn new(
        generation: u64,
        identity: impl Into<String>,
        node: impl Into<String>,
        api: ApiClient,
        shared: Shared<SessionState>,
        issued: Arc<AtomicU64>,
        nudge: mpsc::UnboundedSender<()>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            generation,
            phase: SessionPhase::Starting,
            identity: identity.into(),
            node: node.into(),
            api,
            shared,
            issued,
            nudge,
            events_tx,
        }
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        self.phase = phase;
        self.shared.lock().phase = phase;
    }

    fn apply(&mut self, event: SessionEvent) {
        if event.generation() != self.generation {
            trace!("discarding event from a stale session generation");
            return;
        }
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Unbound) {
            return;
        }
        match event {
            SessionEvent::Stats { tick, result, .. } => {
                if tick != self.issued.load(Ordering::SeqCst) {
                    trace!(tick, "discarding stale stats tick");
                    return;
                }
                {
                    let mut st = self.shared.lock();
                    st.stats_loading = false;
                    match result {
                        Ok(snapshot) => {
                            st.stats = Some(snapshot);
                            st.stats_error = None;
                        }
                        Err(e) => {
                            st.stats_error = Some(e.to_string());
                        }
                    }
                }
                if self.phase == SessionPhase::Starting {
                    self.set_phase(SessionPhase::Live);
                }
            }
            SessionEvent::Line { line, .. } => {
                self.shared.lock().logs.push(line);
            }
            SessionEvent::Stream { status, .. } => {
                debug!("log stream status: {:?}", status);
                self.shared.lock().stream_status = status;
            }
            SessionEvent::ActionDone {
                action, outcome, ..
            } => {
                let mut st = self.shared.lock();
                st.action_in_flight = false;
                match outcome {
                    Ok(out) => {
                        st.action_message =
                            Some(format!("Action {} completed successfully.", action));
                        if out.clear_stats {
                            // The last snapshot is stale now; consuming a
                            // tick slot invalidates any poll in flight.
                            st.stats = None;
                            self.issued.fetch_add(1, Ordering::SeqCst);
                        }
                        drop(st);
                        if out.refresh_stats {
                            let _ = self.nudge.send(());
                        }
                    }
                    Err(e) => {
                        st.stats_error = Some(e.to_string());
                    }
                }
            }
        }
    }

    fn handle_dispatch(
        &mut self,
        action: ContainerAction,
        reply: oneshot::Sender<Result<(), ActionError>>,
    ) {
        let accepted = {
            let mut st = self.shared.lock();
            if !matches!(self.phase, SessionPhase::Starting | SessionPhase::Live) {
                Err(ActionError::SessionClosed)
            } else if st.action_in_flight {
                Err(ActionError::Busy)
            } else {
                st.action_in_flight = true;
                st.action_message = None;
                st.stats_error = None;
                Ok(())
            }
        };
        if accepted.is_ok() {
            actions::spawn_dispatch(
                self.api.clone(),
                self.node.clone(),
                self.identity.clone(),
                action,
                self.generation,
                self.events_tx.clone(),
            );
            info!("dispatched {} for container {}", action, self.identity);
        }
        let _ = reply.send(accepted);
    }

    fn begin_close(&mut self) {
        if self.phase == SessionPhase::Closing {
            return;
        }
        self.set_phase(SessionPhase::Closing);
        // A result landing after teardown is discarded, not applied to
        // a dead session; the in-flight marker clears here.
        self.shared.lock().action_in_flight = false;
    }

    fn finish_close(&mut self) {
        self.set_phase(SessionPhase::Unbound);
        debug!(
            "monitoring session for container {} unbound (generation {})",
            self.identity, self.generation
        );
    }
}

async fn run_controller(
    mut controller: Controller,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut ctrl: mpsc::UnboundedReceiver<ControlMsg>,
    poller: JoinHandle<()>,
    stream: JoinHandle<()>,
) {
    let mut done: Option<oneshot::Sender<()>> = None;
    loop {
        tokio::select! {
            msg = ctrl.recv() => match msg {
                Some(ControlMsg::Dispatch { action, reply }) => {
                    controller.handle_dispatch(action, reply);
                }
                Some(ControlMsg::Close { done: d }) => {
                    done = Some(d);
                    break;
                }
                None => break,
            },
            Some(event) = events.recv() => controller.apply(event),
        }
    }

    controller.begin_close();
    poller.abort();
    stream.abort();
    let _ = poller.await;
    let _ = stream.await;
    controller.finish_close();
    if let Some(done) = done {
        let _ = done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;

    fn snapshot(cpu: f64) -> StatsSnapshot {
        StatsSnapshot {
            cpu,
            memory_usage: 100.0,
            memory_limit: 512.0,
            network_rx: 10.0,
            network_tx: 5.0,
        }
    }

    fn test_controller() -> (
        Controller,
        mpsc::UnboundedReceiver<()>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let api = ApiClient::new(
            "http://127.0.0.1:9",
            Arc::new(StaticToken("tok".to_string())),
        );
        let shared = new_state(SessionState::new(100));
        let issued = Arc::new(AtomicU64::new(0));
        let (nudge_tx, nudge_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let controller = Controller::new(
            7,
            "c1",
            "local",
            api,
            shared,
            issued,
            nudge_tx,
            events_tx,
        );
        (controller, nudge_rx, events_rx)
    }

    fn stats_event(tick: u64, result: Result<StatsSnapshot, ApiError>) -> SessionEvent {
        SessionEvent::Stats {
            generation: 7,
            tick,
            result,
        }
    }

    #[test]
    fn test_log_buffer_order_and_cap() {
        let mut logs = LogBuffer::new(3);
        for line in ["a", "b", "c"] {
            logs.push(line.to_string());
        }
        assert_eq!(logs.contents(), vec!["a", "b", "c"]);
        assert!(!logs.truncated());

        logs.push("d".to_string());
        assert_eq!(logs.contents(), vec!["b", "c", "d"]);
        assert_eq!(logs.total_received(), 4);
        assert!(logs.truncated());
    }

    #[test]
    fn test_log_buffer_since() {
        let mut logs = LogBuffer::new(3);
        for line in ["a", "b", "c", "d"] {
            logs.push(line.to_string());
        }
        let (fresh, mark) = logs.since(0);
        // "a" fell out of the retention window.
        assert_eq!(fresh, vec!["b", "c", "d"]);
        assert_eq!(mark, 4);

        logs.push("e".to_string());
        let (fresh, mark) = logs.since(mark);
        assert_eq!(fresh, vec!["e"]);
        assert_eq!(mark, 5);

        let (fresh, _) = logs.since(mark);
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn test_tick_monotonicity_out_of_order() {
        let (mut controller, _nudge, _events) = test_controller();
        // Two ticks issued; the newer completes first.
        controller.issued.store(2, Ordering::SeqCst);
        controller.apply(stats_event(2, Ok(snapshot(50.0))));
        controller.apply(stats_event(1, Ok(snapshot(10.0))));

        let state = controller.shared.lock().clone();
        assert_eq!(state.stats.unwrap().cpu, 50.0);
        assert_eq!(state.phase, SessionPhase::Live);
    }

    #[tokio::test]
    async fn test_stale_tick_after_newer_issue_is_discarded() {
        let (mut controller, _nudge, _events) = test_controller();
        controller.issued.store(1, Ordering::SeqCst);
        controller.apply(stats_event(1, Ok(snapshot(10.0))));
        // A newer tick has been issued but not completed yet.
        controller.issued.store(2, Ordering::SeqCst);
        controller.apply(stats_event(1, Ok(snapshot(99.0))));

        let state = controller.shared.lock().clone();
        assert_eq!(state.stats.unwrap().cpu, 10.0);
    }

    #[tokio::test]
    async fn test_first_failed_tick_still_goes_live() {
        let (mut controller, _nudge, _events) = test_controller();
        controller.issued.store(1, Ordering::SeqCst);
        controller.apply(stats_event(1, Err(ApiError::NotFound)));

        let state = controller.shared.lock().clone();
        assert_eq!(state.phase, SessionPhase::Live);
        assert!(!state.stats_loading);
        assert!(state.stats.is_none());
        assert!(state.stats_error.is_some());
    }

    #[tokio::test]
    async fn test_poll_recovers_after_failure() {
        let (mut controller, _nudge, _events) = test_controller();
        controller.issued.store(1, Ordering::SeqCst);
        controller.apply(stats_event(1, Err(ApiError::Server { status: 500 })));
        controller.issued.store(2, Ordering::SeqCst);
        controller.apply(stats_event(2, Ok(snapshot(33.0))));

        let state = controller.shared.lock().clone();
        assert_eq!(state.stats.unwrap().cpu, 33.0);
        assert!(state.stats_error.is_none());
    }

    #[tokio::test]
    async fn test_log_order_interleaved_with_polls() {
        let (mut controller, _nudge, _events) = test_controller();
        controller.issued.store(1, Ordering::SeqCst);
        controller.apply(SessionEvent::Line {
            generation: 7,
            line: "starting".to_string(),
        });
        controller.apply(stats_event(1, Ok(snapshot(12.5))));
        controller.apply(SessionEvent::Line {
            generation: 7,
            line: "ready".to_string(),
        });

        let state = controller.shared.lock().clone();
        assert_eq!(state.logs.contents(), vec!["starting", "ready"]);
        assert_eq!(state.stats.unwrap().cpu, 12.5);
    }

    #[tokio::test]
    async fn test_generation_mismatch_is_ignored() {
        let (mut controller, _nudge, _events) = test_controller();
        controller.issued.store(1, Ordering::SeqCst);
        controller.apply(SessionEvent::Stats {
            generation: 8,
            tick: 1,
            result: Ok(snapshot(77.0)),
        });
        controller.apply(SessionEvent::Line {
            generation: 6,
            line: "ghost".to_string(),
        });

        let state = controller.shared.lock().clone();
        assert!(state.stats.is_none());
        assert!(state.logs.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_silence() {
        let (mut controller, _nudge, _events) = test_controller();
        controller.issued.store(1, Ordering::SeqCst);
        controller.apply(stats_event(1, Ok(snapshot(10.0))));
        controller.begin_close();

        controller.apply(SessionEvent::Line {
            generation: 7,
            line: "late".to_string(),
        });
        controller.apply(stats_event(1, Ok(snapshot(99.0))));
        controller.apply(SessionEvent::ActionDone {
            generation: 7,
            action: ContainerAction::Stop,
            outcome: Ok(ActionOutcome::for_action(ContainerAction::Stop)),
        });

        let state = controller.shared.lock().clone();
        assert_eq!(state.phase, SessionPhase::Closing);
        assert!(state.logs.is_empty());
        assert_eq!(state.stats.unwrap().cpu, 10.0);
        assert!(!state.action_in_flight);
    }

    #[tokio::test]
    async fn test_stop_clears_stats_and_invalidates_inflight_tick() {
        let (mut controller, _nudge, _events) = test_controller();
        controller.issued.store(1, Ordering::SeqCst);
        controller.apply(stats_event(1, Ok(snapshot(10.0))));

        controller.apply(SessionEvent::ActionDone {
            generation: 7,
            action: ContainerAction::Stop,
            outcome: Ok(ActionOutcome::for_action(ContainerAction::Stop)),
        });
        assert!(controller.shared.lock().stats.is_none());

        // The tick that was in flight when the stop landed resolves late.
        controller.apply(stats_event(1, Ok(snapshot(10.0))));
        let state = controller.shared.lock().clone();
        assert!(state.stats.is_none());
        assert!(state.action_message.unwrap().contains("stop"));
    }

    #[tokio::test]
    async fn test_restart_nudges_refresh_without_touching_stats() {
        let (mut controller, mut nudge, _events) = test_controller();
        controller.issued.store(1, Ordering::SeqCst);
        controller.apply(stats_event(1, Ok(snapshot(10.0))));

        controller.apply(SessionEvent::ActionDone {
            generation: 7,
            action: ContainerAction::Restart,
            outcome: Ok(ActionOutcome::for_action(ContainerAction::Restart)),
        });

        assert!(nudge.try_recv().is_ok());
        let state = controller.shared.lock().clone();
        assert_eq!(state.stats.unwrap().cpu, 10.0);
        assert!(state.action_message.unwrap().contains("restart"));
        assert!(!state.action_in_flight);
    }

    #[tokio::test]
    async fn test_action_failure_leaves_stats_alone() {
        let (mut controller, _nudge, _events) = test_controller();
        controller.issued.store(1, Ordering::SeqCst);
        controller.apply(stats_event(1, Ok(snapshot(10.0))));

        controller.apply(SessionEvent::ActionDone {
            generation: 7,
            action: ContainerAction::Restart,
            outcome: Err(ActionError::Failed {
                action: ContainerAction::Restart,
                source: ApiError::Server { status: 500 },
            }),
        });

        let state = controller.shared.lock().clone();
        assert_eq!(state.stats.unwrap().cpu, 10.0);
        assert!(!state.action_in_flight);
        assert!(state.stats_error.unwrap().contains("restart"));
    }

    #[tokio::test]
    async fn test_dispatch_mutual_exclusion() {
        let (mut controller, _nudge, _events) = test_controller();

        let (reply, rx) = oneshot::channel();
        controller.handle_dispatch(ContainerAction::Restart, reply);
        assert!(rx.await.unwrap().is_ok());
        assert!(controller.shared.lock().action_in_flight);

        let (reply, rx) = oneshot::channel();
        controller.handle_dispatch(ContainerAction::Stop, reply);
        assert!(matches!(rx.await.unwrap(), Err(ActionError::Busy)));
        // The first action is still the one in flight.
        assert!(controller.shared.lock().action_in_flight);
    }

    #[tokio::test]
    async fn test_dispatch_rejected_after_close() {
        let (mut controller, _nudge, _events) = test_controller();
        controller.begin_close();

        let (reply, rx) = oneshot::channel();
        controller.handle_dispatch(ContainerAction::Restart, reply);
        assert!(matches!(rx.await.unwrap(), Err(ActionError::SessionClosed)));
    }
}
