use std::sync::Arc;

use common::config::Settings;
use common::connection::ConnectionManager;
use common::errors::ValidationError;
use common::models::ConnectionTarget;
use common::scheduler::Scheduler;
use common::store::KeyInspector;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<dyn Scheduler>,
    pub inspector: Arc<dyn KeyInspector>,
    pub connections: ConnectionManager,
    pub config: Arc<Settings>,
}

impl AppState {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        inspector: Arc<dyn KeyInspector>,
        connections: ConnectionManager,
        config: Settings,
    ) -> Self {
        Self {
            scheduler,
            inspector,
            connections,
            config: Arc::new(config),
        }
    }

    /// Target named by the request, or the configured default
    pub fn target(&self, requested: Option<&str>) -> Result<ConnectionTarget, ValidationError> {
        match requested {
            None | Some("") => Ok(self.config.server.default_target),
            Some(name) => name.parse(),
        }
    }
}
