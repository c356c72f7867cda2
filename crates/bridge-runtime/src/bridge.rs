use std::sync::Arc;

use bridge_core::{BridgeError, SessionConfig, decode_payload};
use bridge_platform::DeviceIdentity;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::{
    engine::{EngineOp, SessionEngine},
    gateway, lifecycle,
    record::SessionShared,
    registry::{SessionHandle, SessionRegistry},
    session::Session,
};

/// Owns the engine and every live session created on it.
///
/// Cheap to clone; all clones share the same registry. When the last clone
/// is dropped every remaining session is destroyed.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    engine: Arc<dyn SessionEngine>,
    sessions: SessionRegistry<SessionShared>,
}

#[derive(Deserialize)]
struct NewClient {
    handle: i64,
}

impl Bridge {
    pub fn new(engine: impl SessionEngine + 'static) -> Self {
        Self::from_arc(Arc::new(engine))
    }

    pub fn from_arc(engine: Arc<dyn SessionEngine>) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                engine,
                sessions: SessionRegistry::default(),
            }),
        }
    }

    /// Create a session. Both channels start `Disconnected`.
    ///
    /// Missing credentials are rejected before the engine is contacted.
    pub async fn create(&self, config: SessionConfig) -> Result<Session, BridgeError> {
        let missing = config.credentials.missing_required();
        if !missing.is_empty() {
            return Err(BridgeError::invalid_credentials(&missing));
        }

        let identity = DeviceIdentity::resolve(
            config.e2ee_memory_only,
            config.device_data.clone(),
            config.device_path.clone(),
        )
        .map_err(|err| BridgeError::storage(err.to_string()))?;

        let response = self
            .inner
            .engine
            .call(
                EngineOp::NewClient,
                json!({
                    "cookies": config.credentials,
                    "platform": config.platform,
                    "deviceData": identity.initial_blob(),
                    "logLevel": config.log_level,
                    "e2eeMemoryOnly": config.e2ee_memory_only,
                }),
            )
            .await
            .into_result(EngineOp::NewClient)?;
        let NewClient {
            handle: engine_handle,
        } = decode_payload(EngineOp::NewClient.as_str(), response)?;

        let engine = Arc::clone(&self.inner.engine);
        let (_, shared) = self.inner.sessions.insert_with(|handle| {
            let (commands, queue) = mpsc::channel(config.command_buffer.max(1));
            let shared = Arc::new(SessionShared::new(
                handle,
                engine_handle,
                config,
                engine,
                identity,
                commands,
            ));
            gateway::spawn_worker(Arc::clone(&shared), queue);
            shared
        })?;

        tracing::info!(
            handle = %shared.handle,
            engine_handle,
            platform = ?shared.config.platform,
            device_mode = ?shared.identity.mode(),
            "session created"
        );
        Ok(Session::new(shared))
    }

    /// Look up a live session.
    pub fn session(&self, handle: SessionHandle) -> Result<Session, BridgeError> {
        self.inner.sessions.get(handle).map(Session::new)
    }

    /// Destroy a session. Destroying an unknown or already destroyed handle
    /// is a no-op.
    pub fn destroy(&self, handle: SessionHandle) -> Result<(), BridgeError> {
        match self.inner.sessions.remove(handle)? {
            Some(shared) => lifecycle::destroy(&shared),
            None => Ok(()),
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.inner.sessions.handles()
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        for shared in self.sessions.drain() {
            if let Err(err) = lifecycle::destroy(&shared) {
                tracing::warn!(handle = %shared.handle, error = %err, "failed to destroy session on shutdown");
            }
        }
    }
}
