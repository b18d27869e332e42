//! Shared application state

use relay_agent::AgentTransport;
use relay_core::{RelayConfig, Result};
use relay_dispatch::{AgentRegistry, Dispatcher, HealthMonitor};
use relay_retrieval::HybridRetriever;
use std::sync::Arc;

/// Everything a request handler can reach
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub retriever: Arc<HybridRetriever>,
    pub health: Arc<HealthMonitor>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire registry, retriever and dispatcher from configuration
    pub fn from_config(config: RelayConfig, transport: Arc<dyn AgentTransport>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(AgentRegistry::from_config(&config)?);
        let retriever = Arc::new(HybridRetriever::new(&config.retrieval));
        let health = Arc::new(HealthMonitor::new(registry.clone(), transport.clone()));
        let dispatcher =
            Dispatcher::new(config, registry, transport).with_retriever(retriever.clone());

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            retriever,
            health,
        })
    }

    pub fn shared(self) -> SharedState {
        Arc::new(self)
    }
}
