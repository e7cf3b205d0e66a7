use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: Option<Vec<String>>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub repo_tags: Option<Vec<String>>,
    pub size: u64,
}

/// One resource-usage snapshot for a container. Replaced wholesale on
/// each successful poll; memory values in MB, network counters in KB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub cpu: f64,
    pub memory_usage: f64,
    pub memory_limit: f64,
    pub network_rx: f64,
    pub network_tx: f64,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct ImagePullRequest {
    pub image: String,
}

#[derive(Debug, Deserialize)]
pub struct ActionResponse {
    pub status: String,
}
