//! Shared Application State

use crate::config::Config;
use mari_core::gateway::LessonGateway;
use std::sync::Arc;

/// Created once at startup and shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<dyn LessonGateway>,
    pub config: Arc<Config>,
}
