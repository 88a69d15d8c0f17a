//! Request/response contract between the GATT client and the ATT bearer
//!
//! Every request carries a caller-supplied [`RequestId`] which the bearer must
//! echo unchanged in the matching callback. Several applications may have
//! requests in flight on the same connection at once; the id is the only way
//! responses are routed back to the right one.

use super::error::AttResult;
use crate::gatt::types::{Characteristic, Descriptor, IncludeService, Service};
use crate::uuid::Uuid;
use std::fmt;

/// Correlation id for one request chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// ATT operations issued by the GATT client.
///
/// All methods are fire-and-forget. Results arrive later through the
/// [`AttributeProtocolCallback`] registered with the bearer. Reads and writes are
/// single-shot: the bearer must not retry on its own.
pub trait AttributeProtocol: Send {
    /// Discover services in `start_handle..=end_handle`.
    fn discover_services(
        &mut self,
        request_id: RequestId,
        connection_handle: u16,
        start_handle: u16,
        end_handle: u16,
    );

    /// Find include declarations in `start_handle..=end_handle`.
    fn find_included_services(
        &mut self,
        request_id: RequestId,
        connection_handle: u16,
        start_handle: u16,
        end_handle: u16,
    );

    /// Discover characteristic declarations in `start_handle..=end_handle`.
    fn discover_characteristics(
        &mut self,
        request_id: RequestId,
        connection_handle: u16,
        start_handle: u16,
        end_handle: u16,
    );

    /// Discover descriptors in `start_handle..=end_handle`.
    fn discover_descriptors(
        &mut self,
        request_id: RequestId,
        connection_handle: u16,
        start_handle: u16,
        end_handle: u16,
    );

    /// Read the attribute value at `handle`.
    fn read_value(&mut self, request_id: RequestId, connection_handle: u16, handle: u16);

    /// Read the first characteristic value of type `uuid` in the given range.
    fn read_by_uuid(
        &mut self,
        request_id: RequestId,
        connection_handle: u16,
        uuid: Uuid,
        start_handle: u16,
        end_handle: u16,
    );

    /// Write request; answered through `on_write`.
    fn write_value(
        &mut self,
        request_id: RequestId,
        connection_handle: u16,
        handle: u16,
        value: Vec<u8>,
    );

    /// Write command; no response is expected.
    fn write_command(&mut self, connection_handle: u16, handle: u16, value: Vec<u8>);

    /// Exchange MTU request.
    fn exchange_mtu(&mut self, request_id: RequestId, connection_handle: u16, mtu: u16);

    /// Send a handle value confirmation for a received indication.
    fn confirm_indication(&mut self, connection_handle: u16);
}

/// Results and unsolicited events delivered by the ATT bearer.
///
/// Implementations must be callable from any thread.
pub trait AttributeProtocolCallback: Send + Sync {
    fn on_services_discovered(
        &self,
        request_id: RequestId,
        result: AttResult<Vec<Service>>,
        connection_handle: u16,
    );

    fn on_included_services_discovered(
        &self,
        request_id: RequestId,
        result: AttResult<Vec<IncludeService>>,
        connection_handle: u16,
        service_handle: u16,
    );

    fn on_characteristics_discovered(
        &self,
        request_id: RequestId,
        result: AttResult<Vec<Characteristic>>,
        connection_handle: u16,
        service_handle: u16,
    );

    fn on_descriptors_discovered(
        &self,
        request_id: RequestId,
        result: AttResult<Vec<Descriptor>>,
        connection_handle: u16,
        characteristic_handle: u16,
    );

    fn on_read(
        &self,
        request_id: RequestId,
        result: AttResult<Vec<u8>>,
        connection_handle: u16,
        handle: u16,
    );

    fn on_write(
        &self,
        request_id: RequestId,
        result: AttResult<()>,
        connection_handle: u16,
        handle: u16,
    );

    fn on_mtu_exchanged(&self, request_id: RequestId, result: AttResult<u16>, connection_handle: u16);

    /// Handle value notification or indication.
    fn on_notification(
        &self,
        connection_handle: u16,
        handle: u16,
        value: Vec<u8>,
        need_confirm: bool,
    );
}
