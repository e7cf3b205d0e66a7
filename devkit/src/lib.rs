/*!
# Dockwatch DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le développement du client Dockwatch avec:
- Backend stub (HTTP + WebSocket) sans moteur Docker réel
- Flux de logs scriptable et réponses stats contrôlables
- Harness de test avec assertions asynchrones
*/

pub mod stub_engine;
pub mod test_utils;

pub use stub_engine::{RecordedAction, StubEngine, StubHandle};
pub use test_utils::TestHarness;
