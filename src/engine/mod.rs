// Engine orchestration: session lifecycle, progress interpretation and event delivery.

pub mod bus;
pub mod events;
pub mod interpret;
pub mod registry;
pub mod session;
pub mod state;
