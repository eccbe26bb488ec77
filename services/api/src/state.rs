//! Shared Application State
//!
//! Created once at startup and handed to every handler. The session registry
//! lives inside the manager, so tests can build an isolated state per case.

use crate::config::Config;
use std::sync::Arc;
use studio_realtime::RealtimeManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<RealtimeManager>,
    pub config: Arc<Config>,
}
