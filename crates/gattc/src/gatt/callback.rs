//! Application-facing callbacks
//!
//! Applications implement only the methods they care about; every method has a
//! no-op default. All methods run on the client's dispatcher thread and must
//! not block on synchronous client calls.

use crate::error::GattResult;
use crate::gap::ConnectionParameters;
use crate::gatt::registry::ConnectionState;

pub trait GattClientCallback: Send {
    fn on_connection_state_changed(&mut self, _state: ConnectionState, _result: GattResult<()>) {}

    fn on_services_discovered(&mut self, _result: GattResult<()>) {}

    fn on_characteristic_read(&mut self, _handle: u16, _result: GattResult<Vec<u8>>) {}

    fn on_characteristic_write(&mut self, _handle: u16, _result: GattResult<()>) {}

    fn on_descriptor_read(&mut self, _handle: u16, _result: GattResult<Vec<u8>>) {}

    fn on_descriptor_write(&mut self, _handle: u16, _result: GattResult<()>) {}

    fn on_mtu_changed(&mut self, _result: GattResult<u16>) {}

    /// Notification or indication received for a cached characteristic value
    fn on_characteristic_changed(&mut self, _handle: u16, _value: &[u8]) {}

    fn on_connection_parameter_changed(
        &mut self,
        _parameters: ConnectionParameters,
        _result: GattResult<()>,
    ) {
    }
}
