//! Shared state for API handlers.

use crate::Orchestrator;

#[derive(Debug, Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
}

impl ApiState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}
