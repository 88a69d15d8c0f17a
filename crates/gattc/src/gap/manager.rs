//! Connection manager boundary
//!
//! The physical link (create/tear down, power state) belongs to the connection
//! manager. The GATT client only asks for links and observes their lifecycle.

use super::types::DeviceIdentity;
use crate::error::GattResult;

/// Physical link state of a device as known to the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Disconnected,
    Connecting,
    /// Link is up on the given connection handle
    Connected(u16),
    Disconnecting,
}

/// LE connection parameters reported on a parameter update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionParameters {
    /// Connection interval (1.25 ms units)
    pub interval: u16,
    /// Peripheral latency (connection events)
    pub latency: u16,
    /// Supervision timeout (10 ms units)
    pub timeout: u16,
}

/// Link operations the GATT client needs from the connection manager.
pub trait ConnectionManager: Send {
    /// Request a physical connection. Completion is reported through
    /// [`ConnectionObserver::on_connected`].
    fn connect(&mut self, device: &DeviceIdentity, auto_connect: bool) -> GattResult<()>;

    /// Request a physical disconnect. Completion is reported through
    /// [`ConnectionObserver::on_disconnected`].
    fn disconnect(&mut self, device: &DeviceIdentity) -> GattResult<()>;

    fn device_state(&self, device: &DeviceIdentity) -> DeviceState;
}

/// Link events delivered by the connection manager, from any thread.
pub trait ConnectionObserver: Send + Sync {
    fn on_connected(&self, device: DeviceIdentity, connection_handle: u16, result: GattResult<()>);

    fn on_disconnected(&self, device: DeviceIdentity, connection_handle: u16, reason: u8);

    fn on_connection_parameter_changed(
        &self,
        device: DeviceIdentity,
        connection_handle: u16,
        parameters: ConnectionParameters,
        result: GattResult<()>,
    );

    /// The local adapter is shutting down; every link is gone.
    fn on_shutdown(&self);
}
