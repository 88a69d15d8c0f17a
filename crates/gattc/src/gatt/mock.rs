//! Test doubles for the ATT bearer, the connection manager and applications

use crate::att::{AttributeProtocol, RequestId};
use crate::error::{GattError, GattResult};
use crate::gap::{ConnectionManager, ConnectionParameters, DeviceIdentity, DeviceState};
use crate::gatt::callback::GattClientCallback;
use crate::gatt::registry::ConnectionState;
use crate::uuid::Uuid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Calls recorded by [`MockProtocol`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttCall {
    DiscoverServices(RequestId, u16, u16, u16),
    FindIncludedServices(RequestId, u16, u16, u16),
    DiscoverCharacteristics(RequestId, u16, u16, u16),
    DiscoverDescriptors(RequestId, u16, u16, u16),
    Read(RequestId, u16, u16),
    ReadByUuid(RequestId, u16, Uuid),
    Write(RequestId, u16, u16, Vec<u8>),
    WriteCommand(u16, u16, Vec<u8>),
    ExchangeMtu(RequestId, u16, u16),
    ConfirmIndication(u16),
}

#[derive(Debug, Clone, Default)]
pub struct MockProtocol {
    calls: Arc<Mutex<Vec<AttCall>>>,
}

impl MockProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the recorded calls
    pub fn take(&self) -> Vec<AttCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    fn record(&self, call: AttCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl AttributeProtocol for MockProtocol {
    fn discover_services(&mut self, req: RequestId, conn: u16, start: u16, end: u16) {
        self.record(AttCall::DiscoverServices(req, conn, start, end));
    }

    fn find_included_services(&mut self, req: RequestId, conn: u16, start: u16, end: u16) {
        self.record(AttCall::FindIncludedServices(req, conn, start, end));
    }

    fn discover_characteristics(&mut self, req: RequestId, conn: u16, start: u16, end: u16) {
        self.record(AttCall::DiscoverCharacteristics(req, conn, start, end));
    }

    fn discover_descriptors(&mut self, req: RequestId, conn: u16, start: u16, end: u16) {
        self.record(AttCall::DiscoverDescriptors(req, conn, start, end));
    }

    fn read_value(&mut self, req: RequestId, conn: u16, handle: u16) {
        self.record(AttCall::Read(req, conn, handle));
    }

    fn read_by_uuid(&mut self, req: RequestId, conn: u16, uuid: Uuid, _start: u16, _end: u16) {
        self.record(AttCall::ReadByUuid(req, conn, uuid));
    }

    fn write_value(&mut self, req: RequestId, conn: u16, handle: u16, value: Vec<u8>) {
        self.record(AttCall::Write(req, conn, handle, value));
    }

    fn write_command(&mut self, conn: u16, handle: u16, value: Vec<u8>) {
        self.record(AttCall::WriteCommand(conn, handle, value));
    }

    fn exchange_mtu(&mut self, req: RequestId, conn: u16, mtu: u16) {
        self.record(AttCall::ExchangeMtu(req, conn, mtu));
    }

    fn confirm_indication(&mut self, conn: u16) {
        self.record(AttCall::ConfirmIndication(conn));
    }
}

/// Calls recorded by [`MockLinks`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    Connect(DeviceIdentity, bool),
    Disconnect(DeviceIdentity),
}

#[derive(Debug, Clone, Default)]
pub struct MockLinks {
    calls: Arc<Mutex<Vec<LinkCall>>>,
    states: Arc<Mutex<HashMap<DeviceIdentity, DeviceState>>>,
    connect_error: Arc<Mutex<Option<GattError>>>,
}

impl MockLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<LinkCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn set_state(&self, device: DeviceIdentity, state: DeviceState) {
        self.states.lock().unwrap().insert(device, state);
    }

    pub fn fail_connect_with(&self, error: GattError) {
        *self.connect_error.lock().unwrap() = Some(error);
    }
}

impl ConnectionManager for MockLinks {
    fn connect(&mut self, device: &DeviceIdentity, auto_connect: bool) -> GattResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(LinkCall::Connect(*device, auto_connect));
        match *self.connect_error.lock().unwrap() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn disconnect(&mut self, device: &DeviceIdentity) -> GattResult<()> {
        self.calls.lock().unwrap().push(LinkCall::Disconnect(*device));
        Ok(())
    }

    fn device_state(&self, device: &DeviceIdentity) -> DeviceState {
        self.states
            .lock()
            .unwrap()
            .get(device)
            .copied()
            .unwrap_or(DeviceState::Disconnected)
    }
}

/// Application events forwarded by [`ChannelCallback`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    ConnectionState(ConnectionState, GattResult<()>),
    ServicesDiscovered(GattResult<()>),
    CharacteristicRead(u16, GattResult<Vec<u8>>),
    CharacteristicWrite(u16, GattResult<()>),
    DescriptorRead(u16, GattResult<Vec<u8>>),
    DescriptorWrite(u16, GattResult<()>),
    MtuChanged(GattResult<u16>),
    CharacteristicChanged(u16, Vec<u8>),
    ParametersChanged(ConnectionParameters, GattResult<()>),
}

pub struct ChannelCallback {
    tx: mpsc::UnboundedSender<AppEvent>,
}

pub fn channel_callback() -> (Box<ChannelCallback>, mpsc::UnboundedReceiver<AppEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Box::new(ChannelCallback { tx }), rx)
}

/// Drain every event already delivered
pub fn drain(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

impl ChannelCallback {
    fn send(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }
}

impl GattClientCallback for ChannelCallback {
    fn on_connection_state_changed(&mut self, state: ConnectionState, result: GattResult<()>) {
        self.send(AppEvent::ConnectionState(state, result));
    }

    fn on_services_discovered(&mut self, result: GattResult<()>) {
        self.send(AppEvent::ServicesDiscovered(result));
    }

    fn on_characteristic_read(&mut self, handle: u16, result: GattResult<Vec<u8>>) {
        self.send(AppEvent::CharacteristicRead(handle, result));
    }

    fn on_characteristic_write(&mut self, handle: u16, result: GattResult<()>) {
        self.send(AppEvent::CharacteristicWrite(handle, result));
    }

    fn on_descriptor_read(&mut self, handle: u16, result: GattResult<Vec<u8>>) {
        self.send(AppEvent::DescriptorRead(handle, result));
    }

    fn on_descriptor_write(&mut self, handle: u16, result: GattResult<()>) {
        self.send(AppEvent::DescriptorWrite(handle, result));
    }

    fn on_mtu_changed(&mut self, result: GattResult<u16>) {
        self.send(AppEvent::MtuChanged(result));
    }

    fn on_characteristic_changed(&mut self, handle: u16, value: &[u8]) {
        self.send(AppEvent::CharacteristicChanged(handle, value.to_vec()));
    }

    fn on_connection_parameter_changed(
        &mut self,
        parameters: ConnectionParameters,
        result: GattResult<()>,
    ) {
        self.send(AppEvent::ParametersChanged(parameters, result));
    }
}
