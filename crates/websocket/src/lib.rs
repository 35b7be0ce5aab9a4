mod gate;
mod handler;

pub use gate::{GateState, OutboundSink, SessionGate, SessionId, BUSY_REASON};
pub use handler::ws_handler;
