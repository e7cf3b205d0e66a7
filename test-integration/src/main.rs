use anyhow::{bail, Context, Result};
use futures::StreamExt;
use log::{info, warn};
use serde::Deserialize;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

// ===== Configuration =====
// Surchargable via DOCKWATCH_BASE_URL / DOCKWATCH_USER / DOCKWATCH_PASSWORD
const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_USER: &str = "admin";
const DEFAULT_PASSWORD: &str = "admin";
const LOG_TAIL_SECONDS: u64 = 5;

// ===== Data Structures =====
// Copies locales des modèles wire, la crate est volontairement autonome

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    token_type: String,
}

#[derive(Debug, Deserialize)]
struct ContainerInfo {
    id: String,
    name: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    cpu: f64,
    memory_usage: f64,
    memory_limit: f64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("🚀 Starting dockwatch integration smoke test");

    let base_url = env_or("DOCKWATCH_BASE_URL", DEFAULT_BASE_URL);
    let username = env_or("DOCKWATCH_USER", DEFAULT_USER);
    let password = env_or("DOCKWATCH_PASSWORD", DEFAULT_PASSWORD);
    let ws_base = base_url.replacen("http", "ws", 1);

    let http = reqwest::Client::new();

    // 1. Login
    let login: LoginResponse = http
        .post(format!("{base_url}/auth/login"))
        .form(&[("username", username.as_str()), ("password", password.as_str())])
        .send()
        .await
        .context("login request failed")?
        .error_for_status()
        .context("login rejected")?
        .json()
        .await?;
    if login.token_type != "bearer" {
        bail!("unexpected token type: {}", login.token_type);
    }
    let token = login.access_token;
    info!("✅ Login OK");

    // 2. Containers
    let containers: Vec<ContainerInfo> = http
        .get(format!("{base_url}/docker/containers/local"))
        .bearer_auth(&token)
        .send()
        .await?
        .error_for_status()
        .context("container listing rejected")?
        .json()
        .await?;
    info!("✅ {} container(s) on node local", containers.len());

    let Some(target) = containers.first() else {
        warn!("🤷 No container available, skipping stats and logs checks");
        return Ok(());
    };
    info!("   target: {} ({}, {})", target.name, &target.id, target.status);

    // 3. Stats snapshot
    match http
        .get(format!("{base_url}/docker/stats/local/{}", target.id))
        .bearer_auth(&token)
        .send()
        .await?
        .error_for_status()
    {
        Ok(resp) => {
            let stats: StatsResponse = resp.json().await?;
            info!(
                "✅ Stats OK: cpu={:.2}% ram={:.1}/{:.1} MB",
                stats.cpu, stats.memory_usage, stats.memory_limit
            );
        }
        Err(e) => warn!("⚠️ Stats unavailable for {}: {}", target.id, e),
    }

    // 4. Log stream (quelques secondes de tail)
    let ws_url = format!("{ws_base}/ws/logs/local/{}?token={token}", target.id);
    let (mut socket, _) = connect_async(&ws_url)
        .await
        .context("log stream connection failed")?;
    info!("✅ Log stream connected, tailing for {LOG_TAIL_SECONDS}s...");

    let mut lines = 0u32;
    let deadline = Duration::from_secs(LOG_TAIL_SECONDS);
    let _ = timeout(deadline, async {
        while let Some(message) = socket.next().await {
            match message {
                Ok(Message::Text(line)) => {
                    lines += 1;
                    info!("   log: {}", line.as_str());
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("⚠️ log stream error: {e}");
                    break;
                }
            }
        }
    })
    .await;
    info!("✅ Received {lines} log line(s)");

    info!("🎉 Smoke test completed");
    Ok(())
}
