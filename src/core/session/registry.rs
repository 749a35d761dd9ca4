//! Process-wide session registry.
//!
//! Maps call identifiers to live sessions with atomic create/destroy and
//! single ownership of all per-call resources. Mutations are serialized;
//! reads on other call identifiers proceed concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::config::SessionConfig;
use crate::transport::TransportSink;

use super::factory::ProviderFactory;
use super::CallSession;

/// Error types for session lifecycle operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("a session for call {0} already exists")]
    DuplicateSession(String),
    #[error("no session for call {0}")]
    NotFound(String),
    #[error("session startup failed: {0}")]
    Startup(String),
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<CallSession>>>,
    session_config: Arc<SessionConfig>,
    factory: Arc<dyn ProviderFactory>,
}

impl SessionRegistry {
    pub fn new(session_config: SessionConfig, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            session_config: Arc::new(session_config),
            factory,
        }
    }

    /// Create the session for a new call. Fails with
    /// [`SessionError::DuplicateSession`] if the call identifier is already
    /// live. No provider network I/O runs under the registry lock.
    pub async fn create(
        &self,
        call_id: &str,
        transport: Arc<dyn TransportSink>,
    ) -> Result<Arc<CallSession>, SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(call_id) {
            return Err(SessionError::DuplicateSession(call_id.to_string()));
        }

        let components = self.factory.components()?;
        let session = CallSession::start(
            call_id.to_string(),
            self.session_config.clone(),
            components,
            transport,
        );
        sessions.insert(call_id.to_string(), session.clone());
        info!(call_id, "session created");
        Ok(session)
    }

    pub async fn get(&self, call_id: &str) -> Result<Arc<CallSession>, SessionError> {
        self.sessions
            .read()
            .await
            .get(call_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(call_id.to_string()))
    }

    /// Tear down the session for a call. Idempotent: destroying an unknown
    /// call is a no-op. The entry is removed atomically; stream-manager
    /// shutdown always runs, even if providers already disconnected.
    pub async fn destroy(&self, call_id: &str) {
        let session = self.sessions.write().await.remove(call_id);
        if let Some(session) = session {
            session.shutdown().await;
            info!(call_id, "session destroyed");
        }
    }

    /// Identifiers of all live sessions.
    pub async fn call_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
