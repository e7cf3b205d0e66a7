/*!
Backend stub pour développement sans moteur Docker réel

Reproduit la surface HTTP + WebSocket du backend Dockwatch:
auth (login/register), listings, stats, actions lifecycle et flux de
logs. Enregistre tous les appels reçus et permet de scripter réponses,
délais et pannes depuis les tests.
*/

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Form, Json, Router};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const STUB_NODE: &str = "local";

#[derive(Debug, Clone)]
pub struct RecordedAction {
    pub action: String,
    pub node: String,
    pub container_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct PullBody {
    image: String,
}

struct StubState {
    token: String,
    users: Mutex<Vec<(String, String)>>,
    containers: Mutex<Vec<Value>>,
    images: Mutex<Vec<Value>>,
    stats: Mutex<HashMap<String, Value>>,
    stats_requests: AtomicU32,
    stats_failures: AtomicU32,
    actions: Mutex<Vec<RecordedAction>>,
    action_failures: AtomicU32,
    action_delay: Mutex<Option<Duration>>,
    pulled: Mutex<Vec<String>>,
    removed_images: Mutex<Vec<String>>,
    log_history: Mutex<Vec<String>>,
    log_tx: broadcast::Sender<(usize, String)>,
    stream_epoch: watch::Sender<u64>,
}

/// Décrémente un compteur de pannes programmées; true si une panne
/// doit être simulée pour cette requête.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct StubEngineBuilder {
    token: String,
    users: Vec<(String, String)>,
}

impl StubEngineBuilder {
    pub fn token<S: Into<String>>(mut self, token: S) -> Self {
        self.token = token.into();
        self
    }

    pub fn user<S: Into<String>>(mut self, username: S, password: S) -> Self {
        self.users.push((username.into(), password.into()));
        self
    }

    pub fn without_users(mut self) -> Self {
        self.users.clear();
        self
    }

    pub async fn spawn(self) -> Result<StubHandle> {
        let (log_tx, _) = broadcast::channel(256);
        let (stream_epoch, _) = watch::channel(0u64);
        let state = Arc::new(StubState {
            token: self.token,
            users: Mutex::new(self.users),
            containers: Mutex::new(Vec::new()),
            images: Mutex::new(Vec::new()),
            stats: Mutex::new(HashMap::new()),
            stats_requests: AtomicU32::new(0),
            stats_failures: AtomicU32::new(0),
            actions: Mutex::new(Vec::new()),
            action_failures: AtomicU32::new(0),
            action_delay: Mutex::new(None),
            pulled: Mutex::new(Vec::new()),
            removed_images: Mutex::new(Vec::new()),
            log_history: Mutex::new(Vec::new()),
            log_tx,
            stream_epoch,
        });

        let app = Router::new()
            .route("/auth/login", post(login))
            .route("/auth/register", post(register))
            .route("/docker/nodes", get(nodes))
            .route("/docker/containers/{node}", get(containers))
            .route("/docker/images/{node}", get(images))
            .route("/docker/image/pull/{node}", post(pull_image))
            .route("/docker/image/remove/{node}/{image_id}", delete(remove_image))
            .route("/docker/stats/{node}/{id}", get(stats))
            .route("/docker/container/{action}/{node}/{id}", post(container_action))
            .route("/ws/logs/{node}/{id}", get(ws_logs))
            .with_state(state.clone())
            .layer(middleware::from_fn_with_state(state.clone(), require_bearer));

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("[stub] server error: {}", e);
            }
        });

        log::info!("[stub] engine listening on {}", addr);
        Ok(StubHandle {
            addr,
            state,
            server,
        })
    }
}

/// Backend stub complet, lancé sur un port éphémère.
pub struct StubEngine;

impl StubEngine {
    pub fn builder() -> StubEngineBuilder {
        StubEngineBuilder {
            token: "stub-token".to_string(),
            users: vec![("admin".to_string(), "admin".to_string())],
        }
    }

    pub async fn spawn() -> Result<StubHandle> {
        Self::builder().spawn().await
    }
}

pub struct StubHandle {
    addr: SocketAddr,
    state: Arc<StubState>,
    server: JoinHandle<()>,
}

impl StubHandle {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn token(&self) -> &str {
        &self.state.token
    }

    pub fn set_containers(&self, containers: Vec<Value>) {
        *self.state.containers.lock().unwrap() = containers;
    }

    pub fn set_images(&self, images: Vec<Value>) {
        *self.state.images.lock().unwrap() = images;
    }

    /// Fixe la réponse stats pour un container donné.
    pub fn set_stats(&self, container_id: &str, stats: Value) {
        self.state
            .stats
            .lock()
            .unwrap()
            .insert(container_id.to_string(), stats);
    }

    /// Retire la réponse stats (le container répond alors 404).
    pub fn clear_stats(&self, container_id: &str) {
        self.state.stats.lock().unwrap().remove(container_id);
    }

    /// Les `count` prochaines requêtes stats échouent avec un 500.
    pub fn fail_next_stats(&self, count: u32) {
        self.state.stats_failures.store(count, Ordering::SeqCst);
    }

    pub fn stats_requests(&self) -> u32 {
        self.state.stats_requests.load(Ordering::SeqCst)
    }

    /// Ajoute une ligne au flux de logs (rejouée à la connexion, puis
    /// diffusée en direct aux connexions ouvertes).
    pub fn push_log<S: Into<String>>(&self, line: S) {
        let line = line.into();
        let mut history = self.state.log_history.lock().unwrap();
        let idx = history.len();
        history.push(line.clone());
        let _ = self.state.log_tx.send((idx, line));
    }

    pub fn recorded_actions(&self) -> Vec<RecordedAction> {
        self.state.actions.lock().unwrap().clone()
    }

    /// Les `count` prochaines actions échouent avec un 500.
    pub fn fail_next_action(&self, count: u32) {
        self.state.action_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_action_delay(&self, delay: Option<Duration>) {
        *self.state.action_delay.lock().unwrap() = delay;
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.state.pulled.lock().unwrap().clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state.removed_images.lock().unwrap().clone()
    }

    /// Ferme côté serveur toutes les connexions de logs ouvertes.
    pub fn close_streams(&self) {
        self.state.stream_epoch.send_modify(|epoch| *epoch += 1);
    }

    pub fn shutdown(&self) {
        self.server.abort();
    }
}

impl Drop for StubHandle {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn require_bearer(
    State(state): State<Arc<StubState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Auth et WebSocket (token en query) passent sans header
    if path.starts_with("/auth") || path.starts_with("/ws") {
        return Ok(next.run(req).await);
    }

    let expected = format!("Bearer {}", state.token);
    let ok = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

async fn login(
    State(state): State<Arc<StubState>>,
    Form(form): Form<LoginForm>,
) -> Result<Json<Value>, StatusCode> {
    let users = state.users.lock().unwrap();
    let ok = users
        .iter()
        .any(|(u, p)| *u == form.username && *p == form.password);
    if !ok {
        return Err(StatusCode::BAD_REQUEST);
    }
    log::info!("[stub] login accepted for {}", form.username);
    Ok(Json(json!({
        "access_token": state.token,
        "token_type": "bearer"
    })))
}

async fn register(
    State(state): State<Arc<StubState>>,
    Json(body): Json<RegisterBody>,
) -> Result<Json<Value>, StatusCode> {
    let mut users = state.users.lock().unwrap();
    if !users.is_empty() {
        return Err(StatusCode::FORBIDDEN);
    }
    users.push((body.username, body.password));
    Ok(Json(json!({"msg": "Admin user created"})))
}

async fn nodes() -> Json<Value> {
    Json(json!([STUB_NODE]))
}

fn validate_node(node: &str) -> Result<(), StatusCode> {
    if node == STUB_NODE {
        Ok(())
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn containers(
    State(state): State<Arc<StubState>>,
    Path(node): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    validate_node(&node)?;
    Ok(Json(Value::Array(state.containers.lock().unwrap().clone())))
}

async fn images(
    State(state): State<Arc<StubState>>,
    Path(node): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    validate_node(&node)?;
    Ok(Json(Value::Array(state.images.lock().unwrap().clone())))
}

async fn pull_image(
    State(state): State<Arc<StubState>>,
    Path(node): Path<String>,
    Json(body): Json<PullBody>,
) -> Result<Json<Value>, StatusCode> {
    validate_node(&node)?;
    state.pulled.lock().unwrap().push(body.image);
    Ok(Json(json!({"status": "ok"})))
}

async fn remove_image(
    State(state): State<Arc<StubState>>,
    Path((node, image_id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    validate_node(&node)?;
    let mut images = state.images.lock().unwrap();
    let before = images.len();
    images.retain(|img| img.get("id").and_then(Value::as_str) != Some(image_id.as_str()));
    if images.len() == before {
        return Err(StatusCode::NOT_FOUND);
    }
    state.removed_images.lock().unwrap().push(image_id);
    Ok(Json(json!({"status": "ok"})))
}

async fn stats(
    State(state): State<Arc<StubState>>,
    Path((node, id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    validate_node(&node)?;
    state.stats_requests.fetch_add(1, Ordering::SeqCst);

    if take_failure(&state.stats_failures) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    match state.stats.lock().unwrap().get(&id) {
        Some(payload) => Ok(Json(payload.clone())),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn container_action(
    State(state): State<Arc<StubState>>,
    Path((action, node, id)): Path<(String, String, String)>,
) -> Result<Json<Value>, StatusCode> {
    validate_node(&node)?;
    if !matches!(action.as_str(), "restart" | "stop" | "remove") {
        return Err(StatusCode::NOT_FOUND);
    }

    let delay = *state.action_delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if take_failure(&state.action_failures) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    log::info!("[stub] {} requested for container {}", action, id);
    state.actions.lock().unwrap().push(RecordedAction {
        action,
        node,
        container_id: id,
        at: Utc::now(),
    });
    Ok(Json(json!({"status": "ok"})))
}

async fn ws_logs(
    ws: WebSocketUpgrade,
    Path((node, id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<StubState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_log_socket(socket, node, id, params, state))
}

async fn handle_log_socket(
    mut socket: WebSocket,
    node: String,
    container_id: String,
    params: HashMap<String, String>,
    state: Arc<StubState>,
) {
    if params.get("token") != Some(&state.token) {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 4401,
                reason: "Invalid token".into(),
            })))
            .await;
        return;
    }
    if node != STUB_NODE {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 4404,
                reason: "Node not found".into(),
            })))
            .await;
        return;
    }

    log::info!("[stub] log stream opened for container {}", container_id);
    let mut live = state.log_tx.subscribe();
    let mut epoch = state.stream_epoch.subscribe();

    // Rejoue l'historique, puis bascule sur la diffusion en direct en
    // sautant les indices déjà rejoués.
    let (history, replayed) = {
        let history = state.log_history.lock().unwrap();
        (history.clone(), history.len())
    };
    let (mut sink, mut source) = socket.split();
    for line in history {
        if sink.send(Message::Text(line.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            msg = live.recv() => match msg {
                Ok((idx, line)) => {
                    if idx >= replayed && sink.send(Message::Text(line.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = epoch.changed() => {
                log::info!("[stub] force-closing log stream for container {}", container_id);
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            msg = source.next() => match msg {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Construit une entrée container au format du backend.
pub fn stub_container(id: &str, name: &str, image: &str, status: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "image": [image],
        "status": status
    })
}

/// Construit une entrée image au format du backend.
pub fn stub_image(id: &str, tag: &str, size: u64) -> Value {
    json!({
        "id": id,
        "repo_tags": [tag],
        "size": size
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_failure_counts_down() {
        let counter = AtomicU32::new(2);
        assert!(take_failure(&counter));
        assert!(take_failure(&counter));
        assert!(!take_failure(&counter));
    }

    #[tokio::test]
    async fn test_spawn_and_push_logs() {
        let handle = StubEngine::spawn().await.unwrap();
        assert!(handle.base_url().starts_with("http://127.0.0.1:"));

        handle.push_log("starting");
        handle.push_log("ready");
        assert_eq!(handle.state.log_history.lock().unwrap().len(), 2);

        handle.set_stats("c1", json!({"cpu": 1.0}));
        assert!(handle.state.stats.lock().unwrap().contains_key("c1"));
    }
}
