//! REST client for the Dockwatch backend
//!
//! Covers the auth endpoints (form login, first-admin registration) and
//! the docker endpoints (nodes, containers, images, stats, lifecycle
//! actions). Auth and not-found failures collapse to their own variants
//! so the session layer can treat them as "no snapshot available".

use std::fmt;
use std::sync::Arc;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::auth::TokenSource;
use crate::models::{
    ActionResponse, ContainerInfo, ImagePullRequest, ImageInfo, LoginResponse, RegisterRequest,
    StatsSnapshot,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("authentication rejected")]
    Auth,
    #[error("not found")]
    NotFound,
    #[error("server error (status {status})")]
    Server { status: u16 },
    #[error("no stored credential (run `dockwatch login`)")]
    MissingToken,
}

/// Container lifecycle commands accepted by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Restart,
    Stop,
    Remove,
}

impl ContainerAction {
    pub fn path_segment(&self) -> &'static str {
        match self {
            ContainerAction::Restart => "restart",
            ContainerAction::Stop => "stop",
            ContainerAction::Remove => "remove",
        }
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    pub fn token_source(&self) -> Arc<dyn TokenSource> {
        self.tokens.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(&self) -> Result<String, ApiError> {
        self.tokens.bearer_token().ok_or(ApiError::MissingToken)
    }

    /// Map a non-2xx status to the error taxonomy.
    fn check(status: StatusCode) -> Result<(), ApiError> {
        if status.is_success() {
            return Ok(());
        }
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Auth),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            other => Err(ApiError::Server {
                status: other.as_u16(),
            }),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let token = self.bearer()?;
        let resp = self
            .http
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await?;
        Self::check(resp.status())?;
        Ok(resp.json().await?)
    }

    // --- auth ---

    /// Authenticate with the form-encoded login endpoint and return the
    /// issued bearer token.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let resp = self
            .http
            .post(self.url("/auth/login"))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::BAD_REQUEST {
            return Err(ApiError::Auth);
        }
        Self::check(status)?;
        Ok(resp.json().await?)
    }

    /// Create the first admin user. The backend rejects this with 403
    /// once any user exists.
    pub async fn register(&self, username: &str, password: &str) -> Result<(), ApiError> {
        let body = RegisterRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let resp = self
            .http
            .post(self.url("/auth/register"))
            .json(&body)
            .send()
            .await?;
        Self::check(resp.status())
    }

    // --- docker ---

    pub async fn nodes(&self) -> Result<Vec<String>, ApiError> {
        self.get_json("/docker/nodes").await
    }

    pub async fn containers(&self, node: &str) -> Result<Vec<ContainerInfo>, ApiError> {
        self.get_json(&format!("/docker/containers/{}", node)).await
    }

    pub async fn images(&self, node: &str) -> Result<Vec<ImageInfo>, ApiError> {
        self.get_json(&format!("/docker/images/{}", node)).await
    }

    pub async fn pull_image(&self, node: &str, image: &str) -> Result<(), ApiError> {
        let token = self.bearer()?;
        let body = ImagePullRequest {
            image: image.to_string(),
        };
        let resp = self
            .http
            .post(self.url(&format!("/docker/image/pull/{}", node)))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        Self::check(resp.status())
    }

    pub async fn remove_image(&self, node: &str, image_id: &str) -> Result<(), ApiError> {
        let token = self.bearer()?;
        let resp = self
            .http
            .delete(self.url(&format!("/docker/image/remove/{}/{}", node, image_id)))
            .bearer_auth(token)
            .send()
            .await?;
        Self::check(resp.status())
    }

    pub async fn container_stats(
        &self,
        node: &str,
        container_id: &str,
    ) -> Result<StatsSnapshot, ApiError> {
        self.get_json(&format!("/docker/stats/{}/{}", node, container_id))
            .await
    }

    pub async fn container_action(
        &self,
        node: &str,
        container_id: &str,
        action: ContainerAction,
    ) -> Result<(), ApiError> {
        let token = self.bearer()?;
        let resp = self
            .http
            .post(self.url(&format!(
                "/docker/container/{}/{}/{}",
                action.path_segment(),
                node,
                container_id
            )))
            .bearer_auth(token)
            .send()
            .await?;
        Self::check(resp.status())?;
        let body: ActionResponse = resp.json().await?;
        debug!("action {} on {} -> {}", action, container_id, body.status);
        Ok(())
    }
}
