//! Shared, cheaply-cloneable state handed to every spawned service.
//! Grounded in the teacher's `platform::context::PlatformContext`
//! (`Arc<SharedState>` plus a `CancellationToken` clone per service).

use std::sync::Arc;

use redis::aio::ConnectionManager;
use taskqueue_core::config::AppConfig;
use taskqueue_queue::QueueManager;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct PlatformContext {
    shared: Arc<SharedState>,
    shutdown: CancellationToken,
}

struct SharedState {
    config: AppConfig,
    queue: Arc<AsyncMutex<QueueManager<ConnectionManager>>>,
}

impl PlatformContext {
    pub(crate) fn new(config: AppConfig, queue: Arc<AsyncMutex<QueueManager<ConnectionManager>>>, shutdown: CancellationToken) -> Self {
        Self { shared: Arc::new(SharedState { config, queue }), shutdown }
    }

    pub fn config(&self) -> &AppConfig {
        &self.shared.config
    }

    pub fn queue(&self) -> Arc<AsyncMutex<QueueManager<ConnectionManager>>> {
        self.shared.queue.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
