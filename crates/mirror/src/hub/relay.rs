//! Entry points the HTTP layer calls.

use std::sync::Arc;

use log::{info, warn};
use mirror_protocol::Envelope;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::HubError;
use super::listener::ListenerSubscription;
use super::registry::SessionRegistry;
use super::session::{Session, SessionId};
use super::transport::{EnvelopeSink, EnvelopeSource};

/// Channel sizing for sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Envelopes a listener channel holds before broadcast waits on it.
    pub listener_buffer: usize,
    /// Pending register/unregister messages per session.
    pub registration_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listener_buffer: 1,
            registration_buffer: 3,
        }
    }
}

/// Relay hub: owns the session registry.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct Hub {
    registry: Arc<SessionRegistry>,
    config: HubConfig,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Start a session for a newly connected host.
    ///
    /// Sends the host a `URL` envelope built by `join_url` from the new id,
    /// then spawns the registration loop (owning `sink`) and the forwarder
    /// (owning `source`).
    pub async fn create_session<K, S, F>(
        &self,
        mut sink: K,
        source: S,
        join_url: F,
    ) -> Result<SessionId, HubError>
    where
        K: EnvelopeSink + 'static,
        S: EnvelopeSource + 'static,
        F: FnOnce(&SessionId) -> String,
    {
        let (registrations_tx, registrations_rx) = mpsc::channel(self.config.registration_buffer);
        let registry = Arc::downgrade(&self.registry);
        let listener_buffer = self.config.listener_buffer;
        let session = self
            .registry
            .insert_with(|id| Session::new(id, registrations_tx, registry, listener_buffer));
        let id = session.id().clone();
        info!("[{}] Creating", id);

        let url = join_url(&id);
        if let Err(e) = sink.send_envelope(&Envelope::url(url)).await {
            warn!("[{}] Could not send join URL to host: {}", id, e);
            session.close().await;
            sink.close().await;
            return Err(e.into());
        }

        tokio::spawn(session.clone().run_registrations(registrations_rx, sink));
        tokio::spawn(session.run_forwarder(source));

        Ok(id)
    }

    /// Register a listener on a live session.
    pub async fn join_session(&self, id: &str) -> Result<ListenerSubscription, HubError> {
        let session = self
            .registry
            .get(id)
            .filter(|session| session.is_alive())
            .ok_or_else(|| HubError::SessionNotFound(id.to_string()))?;

        info!("[{}] Joining", id);
        session.subscribe().await
    }

    pub fn is_alive(&self, id: &str) -> bool {
        self.registry
            .get(id)
            .is_some_and(|session| session.is_alive())
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub async fn listener_count(&self, id: &str) -> Option<usize> {
        let session = self.registry.get(id)?;
        Some(session.listener_count().await)
    }

    /// Tear down every live session.
    pub async fn shutdown(&self) {
        let sessions = self.registry.snapshot();
        if sessions.is_empty() {
            return;
        }
        info!("Closing {} sessions", sessions.len());
        for session in sessions {
            session.close().await;
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}
