use crate::config::Settings;
use crate::facade::Orchestrator;
use crate::notify::BroadcastNotifier;
use crate::registry::Registry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<Registry>,
    pub notifier: Arc<BroadcastNotifier>,
}
