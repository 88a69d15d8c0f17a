//! GAP-level identities and the connection manager boundary

pub mod manager;
pub mod types;

pub use manager::{ConnectionManager, ConnectionObserver, ConnectionParameters, DeviceState};
pub use types::*;
