//! Shared application state for the axum surface.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::core::session::{SessionRegistry, WsProviderFactory};

pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let factory = Arc::new(WsProviderFactory::new(config.clone()));
        let registry = Arc::new(SessionRegistry::new(config.session.clone(), factory));
        Arc::new(Self { config, registry })
    }
}
