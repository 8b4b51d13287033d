use std::sync::Arc;

use crate::services::session_registry::SessionRegistry;

/// Shared state of the HTTP router.
#[derive(Clone, Debug)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
}
