//! # Web Application State

use std::sync::Arc;

use crate::health::HealthRegistry;

/// Shared state handed to every handler
#[derive(Clone, Debug)]
pub struct AppState {
    pub health: Arc<HealthRegistry>,
}

impl AppState {
    pub fn new(health: Arc<HealthRegistry>) -> Self {
        Self { health }
    }
}
