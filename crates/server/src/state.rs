use std::sync::Arc;

use events::MessageRelay;
use websocket::SessionGate;

#[derive(Clone, Default)]
pub struct AppState {
    pub gate: SessionGate,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay that sends through the session gate
    pub fn relay(&self) -> MessageRelay {
        MessageRelay::new(Arc::new(self.gate.clone()))
    }
}
