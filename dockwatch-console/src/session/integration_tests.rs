//! End-to-end session tests against the devkit stub engine.

use std::sync::Arc;
use std::time::Duration;

use dockwatch_devkit::TestHarness;

use super::*;
use crate::auth::StaticToken;

fn context(harness: &TestHarness) -> SessionContext {
    let api = ApiClient::new(
        harness.base_url(),
        Arc::new(StaticToken(harness.token().to_string())),
    );
    SessionContext {
        api,
        ws_base: harness.ws_url(),
        node: "local".to_string(),
        // Long cadence: only the immediate first tick fires on its own
        // during a test.
        poll_interval: Duration::from_secs(60),
        log_retention: 100,
        stream_retry: RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
        },
    }
}

#[tokio::test]
async fn test_bind_first_snapshot_and_log_order() {
    let harness = TestHarness::start().await.unwrap();
    harness
        .engine()
        .set_stats("c1", TestHarness::stats_payload(12.5, 100.0, 512.0, 10.0, 5.0));
    harness.engine().push_log("starting");
    harness.engine().push_log("ready");

    let session = MonitorSession::bind(context(&harness), "c1");
    let settled = harness
        .wait_until(3000, || {
            let state = session.state();
            state.stats.is_some() && state.logs.len() == 2
        })
        .await;
    assert!(settled);

    let state = session.state();
    assert_eq!(state.phase, SessionPhase::Live);
    assert_eq!(state.stream_status, StreamStatus::Streaming);
    assert!(!state.stats_loading);
    assert_eq!(state.stats.unwrap().cpu, 12.5);
    assert_eq!(state.logs.contents(), vec!["starting", "ready"]);

    let final_state = session.close().await;
    assert_eq!(final_state.phase, SessionPhase::Unbound);
}

#[tokio::test]
async fn test_poll_failure_surfaces_and_recovers() {
    let harness = TestHarness::start().await.unwrap();
    harness
        .engine()
        .set_stats("c1", TestHarness::stats_payload(3.0, 50.0, 256.0, 1.0, 1.0));
    harness.engine().fail_next_stats(1);

    // The first tick lands on a 500; the session still goes live.
    let session = MonitorSession::bind(context(&harness), "c1");
    let failed = harness
        .wait_until(3000, || session.state().stats_error.is_some())
        .await;
    assert!(failed);
    assert_eq!(session.state().phase, SessionPhase::Live);
    assert!(session.state().stats.is_none());

    // The next tick succeeds and clears the error.
    session.dispatch(ContainerAction::Restart).await.unwrap();
    let recovered = harness
        .wait_until(3000, || {
            let state = session.state();
            state.stats.is_some() && state.stats_error.is_none()
        })
        .await;
    assert!(recovered);

    session.close().await;
}

#[tokio::test]
async fn test_poll_not_found_keeps_last_snapshot() {
    let harness = TestHarness::start().await.unwrap();
    harness
        .engine()
        .set_stats("c1", TestHarness::stats_payload(12.5, 100.0, 512.0, 10.0, 5.0));

    let session = MonitorSession::bind(context(&harness), "c1");
    assert!(
        harness
            .wait_until(3000, || session.state().stats.is_some())
            .await
    );

    // The container disappears from the engine; the forced refresh hits
    // a 404 but the last snapshot stays on screen.
    harness.engine().clear_stats("c1");
    session.dispatch(ContainerAction::Restart).await.unwrap();
    let errored = harness
        .wait_until(3000, || session.state().stats_error.is_some())
        .await;
    assert!(errored);

    let state = session.state();
    assert_eq!(state.stats.unwrap().cpu, 12.5);
    assert!(state.stats_error.unwrap().contains("not found"));

    session.close().await;
}

#[tokio::test]
async fn test_overcommitted_cpu_passes_through() {
    let harness = TestHarness::start().await.unwrap();
    // Engines may report more than 100% when a container overcommits.
    harness.engine().set_stats(
        "c1",
        serde_json::json!({
            "cpu": 250.0,
            "memory_usage": 900.0,
            "memory_limit": 512.0,
            "network_rx": 0.0,
            "network_tx": 0.0
        }),
    );

    let session = MonitorSession::bind(context(&harness), "c1");
    assert!(
        harness
            .wait_until(3000, || session.state().stats.is_some())
            .await
    );
    assert_eq!(session.state().stats.unwrap().cpu, 250.0);

    session.close().await;
}

#[tokio::test]
async fn test_stop_clears_stats_end_to_end() {
    let harness = TestHarness::start().await.unwrap();
    harness
        .engine()
        .set_stats("c1", TestHarness::stats_payload(12.5, 100.0, 512.0, 10.0, 5.0));

    let session = MonitorSession::bind(context(&harness), "c1");
    assert!(
        harness
            .wait_until(3000, || session.state().stats.is_some())
            .await
    );

    session.dispatch(ContainerAction::Stop).await.unwrap();
    let applied = harness
        .wait_until(3000, || {
            let state = session.state();
            !state.action_in_flight && state.stats.is_none()
        })
        .await;
    assert!(applied);

    let state = session.state();
    assert!(state.action_message.unwrap().contains("stop"));
    let recorded = harness.engine().recorded_actions();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].action, "stop");
    assert_eq!(recorded[0].container_id, "c1");

    session.close().await;
}

#[tokio::test]
async fn test_restart_forces_out_of_band_refresh() {
    let harness = TestHarness::start().await.unwrap();
    harness
        .engine()
        .set_stats("c1", TestHarness::stats_payload(12.5, 100.0, 512.0, 10.0, 5.0));

    let session = MonitorSession::bind(context(&harness), "c1");
    assert!(
        harness
            .wait_until(3000, || session.state().stats.is_some())
            .await
    );
    assert_eq!(harness.engine().stats_requests(), 1);

    session.dispatch(ContainerAction::Restart).await.unwrap();
    // The forced refresh bypasses the 60 s cadence.
    let refreshed = harness
        .wait_until(3000, || harness.engine().stats_requests() >= 2)
        .await;
    assert!(refreshed);

    let settled = harness
        .wait_until(3000, || !session.state().action_in_flight)
        .await;
    assert!(settled);
    let state = session.state();
    assert!(state.action_message.unwrap().contains("restart"));
    assert!(state.stats.is_some());

    session.close().await;
}

#[tokio::test]
async fn test_second_dispatch_is_busy() {
    let harness = TestHarness::start().await.unwrap();
    harness
        .engine()
        .set_action_delay(Some(Duration::from_millis(300)));

    let session = MonitorSession::bind(context(&harness), "c1");
    session.dispatch(ContainerAction::Restart).await.unwrap();
    let second = session.dispatch(ContainerAction::Stop).await;
    assert!(matches!(second, Err(ActionError::Busy)));

    let settled = harness
        .wait_until(3000, || !session.state().action_in_flight)
        .await;
    assert!(settled);
    // Only the first action reached the backend.
    let recorded = harness.engine().recorded_actions();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].action, "restart");

    session.close().await;
}

#[tokio::test]
async fn test_action_failure_keeps_stats() {
    let harness = TestHarness::start().await.unwrap();
    harness
        .engine()
        .set_stats("c1", TestHarness::stats_payload(12.5, 100.0, 512.0, 10.0, 5.0));
    harness.engine().fail_next_action(1);

    let session = MonitorSession::bind(context(&harness), "c1");
    assert!(
        harness
            .wait_until(3000, || session.state().stats.is_some())
            .await
    );

    session.dispatch(ContainerAction::Remove).await.unwrap();
    let settled = harness
        .wait_until(3000, || {
            let state = session.state();
            !state.action_in_flight && state.stats_error.is_some()
        })
        .await;
    assert!(settled);

    let state = session.state();
    assert!(state.stats.is_some());
    assert!(state.stats_error.unwrap().contains("remove"));

    session.close().await;
}

#[tokio::test]
async fn test_stream_reconnects_after_server_drop() {
    let harness = TestHarness::start().await.unwrap();
    let session = MonitorSession::bind(context(&harness), "c1");
    assert!(
        harness
            .wait_until(3000, || {
                session.state().stream_status == StreamStatus::Streaming
            })
            .await
    );

    harness.engine().close_streams();
    tokio::time::sleep(Duration::from_millis(150)).await;
    harness.engine().push_log("back online");

    let reconnected = harness
        .wait_until(3000, || {
            let state = session.state();
            state.stream_status == StreamStatus::Streaming
                && state.logs.contents().iter().any(|l| l == "back online")
        })
        .await;
    assert!(reconnected);

    session.close().await;
}

#[tokio::test]
async fn test_stream_without_retry_goes_disconnected() {
    let harness = TestHarness::start().await.unwrap();
    let mut ctx = context(&harness);
    ctx.stream_retry.max_attempts = 0;

    let session = MonitorSession::bind(ctx, "c1");
    assert!(
        harness
            .wait_until(3000, || {
                session.state().stream_status == StreamStatus::Streaming
            })
            .await
    );

    harness.engine().close_streams();
    let disconnected = harness
        .wait_until(3000, || {
            session.state().stream_status == StreamStatus::Disconnected
        })
        .await;
    assert!(disconnected);

    session.close().await;
}

#[tokio::test]
async fn test_close_discards_inflight_action_result() {
    let harness = TestHarness::start().await.unwrap();
    harness
        .engine()
        .set_action_delay(Some(Duration::from_millis(300)));

    let session = MonitorSession::bind(context(&harness), "c1");
    session.dispatch(ContainerAction::Restart).await.unwrap();

    let final_state = session.close().await;
    assert_eq!(final_state.phase, SessionPhase::Unbound);
    assert!(!final_state.action_in_flight);
    let before = harness.engine().stats_requests();

    // The action resolves after teardown; its forced refresh must not run.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(harness.engine().stats_requests(), before);
}

#[tokio::test]
async fn test_rebind_different_identity() {
    let harness = TestHarness::start().await.unwrap();
    harness
        .engine()
        .set_stats("c1", TestHarness::stats_payload(10.0, 100.0, 512.0, 1.0, 1.0));
    harness
        .engine()
        .set_stats("c2", TestHarness::stats_payload(80.0, 200.0, 1024.0, 2.0, 2.0));

    let first = MonitorSession::bind(context(&harness), "c1");
    assert!(
        harness
            .wait_until(3000, || first.state().stats.is_some())
            .await
    );
    let first_final = first.close().await;
    assert_eq!(first_final.phase, SessionPhase::Unbound);

    let second = MonitorSession::bind(context(&harness), "c2");
    assert!(
        harness
            .wait_until(3000, || second.state().stats.is_some())
            .await
    );
    assert_eq!(second.state().stats.unwrap().cpu, 80.0);

    second.close().await;
}
