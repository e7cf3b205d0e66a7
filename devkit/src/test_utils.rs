/*!
Harness de test pour le client Dockwatch

Facilite l'écriture de tests d'intégration avec:
- Démarrage automatique du backend stub sur un port éphémère
- Builders de payloads (stats, containers, images)
- Attente conditionnelle avec timeout pour les assertions asynchrones
*/

use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};

use crate::stub_engine::{StubEngine, StubEngineBuilder, StubHandle};

/// Harness de test complet: un backend stub prêt à l'emploi.
pub struct TestHarness {
    engine: StubHandle,
}

pub struct TestHarnessBuilder {
    inner: StubEngineBuilder,
}

impl TestHarnessBuilder {
    pub fn token<S: Into<String>>(mut self, token: S) -> Self {
        self.inner = self.inner.token(token);
        self
    }

    pub fn user<S: Into<String>>(mut self, username: S, password: S) -> Self {
        self.inner = self.inner.user(username, password);
        self
    }

    pub fn without_users(mut self) -> Self {
        self.inner = self.inner.without_users();
        self
    }

    pub async fn start(self) -> Result<TestHarness> {
        env_logger::try_init().ok(); // Init logging pour tests
        let engine = self.inner.spawn().await?;
        log::info!("🧪 Test harness ready on {}", engine.base_url());
        Ok(TestHarness { engine })
    }
}

impl TestHarness {
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder {
            inner: StubEngine::builder(),
        }
    }

    /// Démarre un harness avec la configuration par défaut
    /// (utilisateur admin/admin, token "stub-token").
    pub async fn start() -> Result<Self> {
        Self::builder().start().await
    }

    pub fn engine(&self) -> &StubHandle {
        &self.engine
    }

    pub fn base_url(&self) -> String {
        self.engine.base_url()
    }

    pub fn ws_url(&self) -> String {
        self.engine.ws_url()
    }

    pub fn token(&self) -> &str {
        self.engine.token()
    }

    /// Construit un payload stats au format du backend.
    pub fn stats_payload(
        cpu: f64,
        memory_usage: f64,
        memory_limit: f64,
        network_rx: f64,
        network_tx: f64,
    ) -> Value {
        json!({
            "cpu": cpu,
            "memory_usage": memory_usage,
            "memory_limit": memory_limit,
            "network_rx": network_rx,
            "network_tx": network_tx
        })
    }

    /// Attend qu'une condition devienne vraie, en réévaluant toutes les
    /// 25 ms jusqu'au timeout. Retourne le dernier résultat évalué.
    pub async fn wait_until<F>(&self, timeout_ms: u64, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        condition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_harness_startup() {
        let harness = TestHarness::start().await.unwrap();
        assert_eq!(harness.token(), "stub-token");
        assert!(harness.ws_url().starts_with("ws://"));
    }

    #[tokio::test]
    async fn test_wait_until_observes_condition() {
        let harness = TestHarness::start().await.unwrap();
        let mut calls = 0;
        let ok = harness
            .wait_until(500, || {
                calls += 1;
                calls >= 3
            })
            .await;
        assert!(ok);
    }

    #[test]
    fn test_stats_payload_shape() {
        let payload = TestHarness::stats_payload(12.5, 100.0, 512.0, 10.0, 5.0);
        assert_eq!(payload["cpu"], 12.5);
        assert_eq!(payload["memory_limit"], 512.0);
    }
}
