//! GATT client
//!
//! [`GattClient`] is the application-facing API. Every call is executed on the
//! client's dispatcher thread against [`ClientCore`], which owns the
//! per-device attribute caches, the application registry and the running
//! discoveries. Transport events enter through [`GattClient::attribute_callback`]
//! and [`GattClient::connection_observer`] and are posted to the same thread.

use crate::att::{
    AttResult, AttributeProtocol, AttributeProtocolCallback, RequestId, ATT_DEFAULT_MTU,
    ATT_HANDLE_MAX, ATT_HANDLE_MIN, ATT_MAX_MTU,
};
use crate::config::GattClientConfig;
use crate::dispatch::{DispatchHandle, Dispatcher};
use crate::error::{GattError, GattResult};
use crate::gap::{ConnectionManager, ConnectionObserver, ConnectionParameters, DeviceIdentity};
use crate::gatt::cache::AttributeCache;
use crate::gatt::callback::GattClientCallback;
use crate::gatt::discovery::{DiscoveryOrchestrator, DiscoveryStatus};
use crate::gatt::persist::CacheStore;
use crate::gatt::registry::{AppId, ApplicationRegistry, PendingRequest, Registration};
use crate::gatt::types::{Characteristic, Descriptor, IncludeService, Service};
use crate::uuid::Uuid;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// Attribute cache and link facts of one remote device
#[derive(Debug)]
struct DeviceRecord {
    cache: AttributeCache,
    mtu: u16,
}

impl DeviceRecord {
    fn new() -> Self {
        Self {
            cache: AttributeCache::new(),
            mtu: ATT_DEFAULT_MTU,
        }
    }
}

/// State owned by the dispatcher thread
pub(crate) struct ClientCore {
    config: GattClientConfig,
    att: Box<dyn AttributeProtocol>,
    links: Box<dyn ConnectionManager>,
    registry: ApplicationRegistry,
    devices: HashMap<DeviceIdentity, DeviceRecord>,
    /// live connection handle -> device
    connections: HashMap<u16, DeviceIdentity>,
    store: Option<CacheStore>,
}

/// Registration answering a response for `request_id` on `connection_handle`,
/// if it is still connected there. Anything else is a stale response.
fn routed(
    registry: &mut ApplicationRegistry,
    request_id: RequestId,
    connection_handle: u16,
) -> Option<&mut Registration> {
    let found = registry
        .get_mut(request_id.0)
        .filter(|r| r.connection_handle() == Some(connection_handle));
    if found.is_none() {
        debug!(
            "Dropping stale response for {} on {:#06x}",
            request_id, connection_handle
        );
    }
    found
}

fn cached<'a>(
    devices: &'a HashMap<DeviceIdentity, DeviceRecord>,
    device: &DeviceIdentity,
) -> GattResult<&'a AttributeCache> {
    devices
        .get(device)
        .map(|record| &record.cache)
        .ok_or(GattError::NotFound)
}

impl ClientCore {
    fn new(
        config: GattClientConfig,
        att: Box<dyn AttributeProtocol>,
        links: Box<dyn ConnectionManager>,
    ) -> Self {
        Self {
            registry: ApplicationRegistry::new(config.max_applications),
            store: config.cache_store(),
            config,
            att,
            links,
            devices: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    fn register_application(
        &mut self,
        callback: Box<dyn GattClientCallback>,
        device: DeviceIdentity,
        shared: bool,
    ) -> GattResult<AppId> {
        let app_id = self.registry.register(callback, device, shared)?;
        self.devices.entry(device).or_insert_with(DeviceRecord::new);
        Ok(app_id)
    }

    fn deregister_application(&mut self, app_id: AppId) -> GattResult<()> {
        let registration = self.registry.deregister(app_id, self.links.as_mut())?;
        let device = *registration.device();
        if !self.registry.has_device(&device) {
            debug!("No registrations left for {}, dropping its cache", device);
            self.devices.remove(&device);
            self.connections.retain(|_, d| *d != device);
        }
        Ok(())
    }

    fn connect(&mut self, app_id: AppId, auto_connect: bool) -> GattResult<()> {
        self.registry.connect(app_id, auto_connect, self.links.as_mut())?;
        // Joining a live link completes immediately.
        if let Some(registration) = self.registry.get(app_id) {
            if let Some(handle) = registration.connection_handle() {
                let device = *registration.device();
                self.connections.insert(handle, device);
                self.restore_cache(&device);
            }
        }
        Ok(())
    }

    fn disconnect(&mut self, app_id: AppId) -> GattResult<()> {
        self.registry.disconnect(app_id, self.links.as_mut())
    }

    fn discover_services(&mut self, app_id: AppId) -> GattResult<()> {
        let (registration, _) = self.registry.connected(app_id)?;
        if registration.discovery.is_some() {
            return Err(GattError::DeviceBusy);
        }
        let device = *registration.device();

        // A run shared with another application keeps what it found so far.
        let shared_run = self
            .registry
            .registrations()
            .any(|r| *r.device() == device && r.discovery.is_some());
        if !shared_run {
            if let Some(record) = self.devices.get_mut(&device) {
                record.cache.clear();
            }
        }

        let (registration, connection_handle) = self.registry.connected(app_id)?;
        let mut discovery = DiscoveryOrchestrator::new(RequestId(app_id), connection_handle);
        match discovery.start(self.att.as_mut()) {
            DiscoveryStatus::Pending => registration.discovery = Some(discovery),
            DiscoveryStatus::Complete => registration.callback().on_services_discovered(Ok(())),
            DiscoveryStatus::Failed(e) => return Err(e),
        }
        Ok(())
    }

    fn read_characteristic(&mut self, app_id: AppId, handle: u16) -> GattResult<()> {
        let (registration, connection_handle) = self.registry.connected(app_id)?;
        cached(&self.devices, registration.device())?
            .characteristic_by_value_handle(handle)
            .ok_or(GattError::NotFound)?;
        registration
            .pending
            .push_back(PendingRequest::ReadCharacteristic(handle));
        self.att
            .read_value(RequestId(app_id), connection_handle, handle);
        Ok(())
    }

    fn read_characteristic_by_uuid(&mut self, app_id: AppId, uuid: Uuid) -> GattResult<()> {
        let (registration, connection_handle) = self.registry.connected(app_id)?;
        registration.pending.push_back(PendingRequest::ReadByUuid);
        self.att.read_by_uuid(
            RequestId(app_id),
            connection_handle,
            uuid,
            ATT_HANDLE_MIN,
            ATT_HANDLE_MAX,
        );
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        app_id: AppId,
        handle: u16,
        value: Vec<u8>,
        without_response: bool,
    ) -> GattResult<()> {
        let (registration, connection_handle) = self.registry.connected(app_id)?;
        cached(&self.devices, registration.device())?
            .characteristic_by_value_handle(handle)
            .ok_or(GattError::NotFound)?;
        if without_response {
            self.att.write_command(connection_handle, handle, value);
            registration.callback().on_characteristic_write(handle, Ok(()));
        } else {
            registration
                .pending
                .push_back(PendingRequest::WriteCharacteristic(handle));
            self.att
                .write_value(RequestId(app_id), connection_handle, handle, value);
        }
        Ok(())
    }

    fn read_descriptor(&mut self, app_id: AppId, handle: u16) -> GattResult<()> {
        let (registration, connection_handle) = self.registry.connected(app_id)?;
        cached(&self.devices, registration.device())?
            .descriptor(handle)
            .ok_or(GattError::NotFound)?;
        registration
            .pending
            .push_back(PendingRequest::ReadDescriptor(handle));
        self.att
            .read_value(RequestId(app_id), connection_handle, handle);
        Ok(())
    }

    fn write_descriptor(&mut self, app_id: AppId, handle: u16, value: Vec<u8>) -> GattResult<()> {
        let (registration, connection_handle) = self.registry.connected(app_id)?;
        cached(&self.devices, registration.device())?
            .descriptor(handle)
            .ok_or(GattError::NotFound)?;
        registration
            .pending
            .push_back(PendingRequest::WriteDescriptor(handle));
        self.att
            .write_value(RequestId(app_id), connection_handle, handle, value);
        Ok(())
    }

    fn request_exchange_mtu(&mut self, app_id: AppId, mtu: u16) -> GattResult<()> {
        if !(ATT_DEFAULT_MTU..=ATT_MAX_MTU).contains(&mtu) {
            return Err(GattError::InvalidParameter);
        }
        let (registration, connection_handle) = self.registry.connected(app_id)?;
        registration.pending.push_back(PendingRequest::ExchangeMtu);
        self.att
            .exchange_mtu(RequestId(app_id), connection_handle, mtu);
        Ok(())
    }

    fn get_services(&self, app_id: AppId) -> GattResult<Vec<Service>> {
        let registration = self.registry.get(app_id).ok_or(GattError::InvalidParameter)?;
        Ok(cached(&self.devices, registration.device())?.snapshot())
    }

    fn mtu(&self, app_id: AppId) -> GattResult<u16> {
        let registration = self.registry.get(app_id).ok_or(GattError::InvalidParameter)?;
        Ok(self
            .devices
            .get(registration.device())
            .map_or(ATT_DEFAULT_MTU, |record| record.mtu))
    }

    /// Fill an empty device cache from disk. A missing or damaged file only
    /// means the application has to discover.
    fn restore_cache(&mut self, device: &DeviceIdentity) {
        if !self.config.restore_on_connect {
            return;
        }
        let (Some(store), Some(record)) = (&self.store, self.devices.get_mut(device)) else {
            return;
        };
        if !record.cache.is_empty() {
            return;
        }
        match store.load(device) {
            Ok(cache) => {
                info!("Restored {} cached services for {}", cache.len(), device);
                record.cache = cache;
            }
            Err(e) => debug!("No usable attribute cache for {}: {}", device, e),
        }
    }

    fn on_discovery_response<F>(&mut self, request_id: RequestId, connection_handle: u16, step: F)
    where
        F: FnOnce(
            &mut DiscoveryOrchestrator,
            &mut AttributeCache,
            &mut dyn AttributeProtocol,
        ) -> DiscoveryStatus,
    {
        let Some(registration) = routed(&mut self.registry, request_id, connection_handle) else {
            return;
        };
        let device = *registration.device();
        let (Some(discovery), Some(record)) =
            (registration.discovery.as_mut(), self.devices.get_mut(&device))
        else {
            debug!("{}: no discovery running", request_id);
            return;
        };

        match step(discovery, &mut record.cache, self.att.as_mut()) {
            DiscoveryStatus::Pending => {}
            DiscoveryStatus::Complete => {
                registration.discovery = None;
                info!(
                    "{}: discovered {} services on {}",
                    request_id,
                    record.cache.len(),
                    device
                );
                if self.config.persist_on_discovery {
                    if let Some(store) = &self.store {
                        if let Err(e) = store.store(&device, &record.cache) {
                            warn!("Failed to persist attribute cache for {}: {}", device, e);
                        }
                    }
                }
                registration.callback().on_services_discovered(Ok(()));
            }
            DiscoveryStatus::Failed(e) => {
                registration.discovery = None;
                warn!("{}: discovery on {} failed: {}", request_id, device, e);
                registration.callback().on_services_discovered(Err(e));
            }
        }
    }

    fn on_read(
        &mut self,
        request_id: RequestId,
        result: AttResult<Vec<u8>>,
        connection_handle: u16,
        handle: u16,
    ) {
        let Some(registration) = routed(&mut self.registry, request_id, connection_handle) else {
            return;
        };
        let result = result.map_err(GattError::from);
        match registration.pending.pop_front() {
            Some(PendingRequest::ReadCharacteristic(h)) => {
                registration.callback().on_characteristic_read(h, result)
            }
            Some(PendingRequest::ReadByUuid) => {
                registration.callback().on_characteristic_read(handle, result)
            }
            Some(PendingRequest::ReadDescriptor(h)) => {
                registration.callback().on_descriptor_read(h, result)
            }
            other => {
                warn!("{}: unexpected read response for {:#06x}", request_id, handle);
                if let Some(pending) = other {
                    registration.pending.push_front(pending);
                }
            }
        }
    }

    fn on_write(
        &mut self,
        request_id: RequestId,
        result: AttResult<()>,
        connection_handle: u16,
        handle: u16,
    ) {
        let Some(registration) = routed(&mut self.registry, request_id, connection_handle) else {
            return;
        };
        let result = result.map_err(GattError::from);
        match registration.pending.pop_front() {
            Some(PendingRequest::WriteCharacteristic(h)) => {
                registration.callback().on_characteristic_write(h, result)
            }
            Some(PendingRequest::WriteDescriptor(h)) => {
                registration.callback().on_descriptor_write(h, result)
            }
            other => {
                warn!("{}: unexpected write response for {:#06x}", request_id, handle);
                if let Some(pending) = other {
                    registration.pending.push_front(pending);
                }
            }
        }
    }

    fn on_mtu_exchanged(
        &mut self,
        request_id: RequestId,
        result: AttResult<u16>,
        connection_handle: u16,
    ) {
        let Some(registration) = routed(&mut self.registry, request_id, connection_handle) else {
            return;
        };
        match registration.pending.pop_front() {
            Some(PendingRequest::ExchangeMtu) => {}
            other => {
                warn!("{}: unexpected MTU response", request_id);
                if let Some(pending) = other {
                    registration.pending.push_front(pending);
                }
                return;
            }
        }
        if let (Ok(mtu), Some(record)) = (&result, self.devices.get_mut(registration.device())) {
            debug!("MTU for {} is now {}", registration.device(), mtu);
            record.mtu = *mtu;
        }
        registration
            .callback()
            .on_mtu_changed(result.map_err(GattError::from));
    }

    fn on_notification(
        &mut self,
        connection_handle: u16,
        handle: u16,
        value: Vec<u8>,
        need_confirm: bool,
    ) {
        self.deliver_notification(connection_handle, handle, &value);
        if need_confirm {
            self.att.confirm_indication(connection_handle);
        }
    }

    fn deliver_notification(&mut self, connection_handle: u16, handle: u16, value: &[u8]) {
        let Some(members) = self.registry.group(connection_handle) else {
            debug!("Notification on unmapped connection {:#06x}", connection_handle);
            return;
        };
        let members: Vec<AppId> = members.iter().copied().collect();
        let Some(device) = self.connections.get(&connection_handle) else {
            return;
        };
        let known = self
            .devices
            .get(device)
            .and_then(|record| record.cache.characteristic_by_value_handle(handle))
            .is_some();
        if !known {
            warn!(
                "Cache miss for notification on {:#06x} from {}",
                handle, device
            );
            return;
        }

        trace!("Notification {:#06x}: {}", handle, hex::encode(value));
        for app_id in members {
            if let Some(registration) = self.registry.get_mut(app_id) {
                registration.callback().on_characteristic_changed(handle, value);
            }
        }
    }

    fn on_connected(&mut self, device: DeviceIdentity, connection_handle: u16, result: GattResult<()>) {
        let attached = self.registry.on_connected(&device, connection_handle, result);
        if result.is_ok() && self.devices.contains_key(&device) {
            self.connections.insert(connection_handle, device);
            self.restore_cache(&device);
        }
        trace!("{} applications attached to {}", attached.len(), device);
    }

    fn on_disconnected(&mut self, device: DeviceIdentity, connection_handle: u16, reason: u8) {
        self.registry
            .on_disconnected(&device, connection_handle, reason);
        self.connections.remove(&connection_handle);
        if let Some(record) = self.devices.get_mut(&device) {
            record.mtu = ATT_DEFAULT_MTU;
        }
    }

    fn on_connection_parameter_changed(
        &mut self,
        connection_handle: u16,
        parameters: ConnectionParameters,
        result: GattResult<()>,
    ) {
        let members: Vec<AppId> = match self.registry.group(connection_handle) {
            Some(members) => members.iter().copied().collect(),
            None => return,
        };
        for app_id in members {
            if let Some(registration) = self.registry.get_mut(app_id) {
                registration
                    .callback()
                    .on_connection_parameter_changed(parameters, result);
            }
        }
    }

    fn on_shutdown(&mut self) {
        self.registry.on_shutdown();
        self.connections.clear();
        for record in self.devices.values_mut() {
            record.mtu = ATT_DEFAULT_MTU;
        }
    }
}

/// Sink for transport events; posts each one to the dispatcher.
struct ClientEvents {
    handle: DispatchHandle<ClientCore>,
}

impl ClientEvents {
    fn post<F>(&self, event: &str, task: F)
    where
        F: FnOnce(&mut ClientCore) + Send + 'static,
    {
        if self.handle.post(task).is_err() {
            trace!("Client stopped, dropping {}", event);
        }
    }
}

impl AttributeProtocolCallback for ClientEvents {
    fn on_services_discovered(
        &self,
        request_id: RequestId,
        result: AttResult<Vec<Service>>,
        connection_handle: u16,
    ) {
        self.post("services", move |core| {
            core.on_discovery_response(request_id, connection_handle, |d, cache, att| {
                d.on_services(result, cache, att)
            })
        });
    }

    fn on_included_services_discovered(
        &self,
        request_id: RequestId,
        result: AttResult<Vec<IncludeService>>,
        connection_handle: u16,
        _service_handle: u16,
    ) {
        self.post("included services", move |core| {
            core.on_discovery_response(request_id, connection_handle, |d, cache, att| {
                d.on_included_services(result, cache, att)
            })
        });
    }

    fn on_characteristics_discovered(
        &self,
        request_id: RequestId,
        result: AttResult<Vec<Characteristic>>,
        connection_handle: u16,
        _service_handle: u16,
    ) {
        self.post("characteristics", move |core| {
            core.on_discovery_response(request_id, connection_handle, |d, cache, att| {
                d.on_characteristics(result, cache, att)
            })
        });
    }

    fn on_descriptors_discovered(
        &self,
        request_id: RequestId,
        result: AttResult<Vec<Descriptor>>,
        connection_handle: u16,
        _characteristic_handle: u16,
    ) {
        self.post("descriptors", move |core| {
            core.on_discovery_response(request_id, connection_handle, |d, cache, att| {
                d.on_descriptors(result, cache, att)
            })
        });
    }

    fn on_read(
        &self,
        request_id: RequestId,
        result: AttResult<Vec<u8>>,
        connection_handle: u16,
        handle: u16,
    ) {
        self.post("read response", move |core| {
            core.on_read(request_id, result, connection_handle, handle)
        });
    }

    fn on_write(
        &self,
        request_id: RequestId,
        result: AttResult<()>,
        connection_handle: u16,
        handle: u16,
    ) {
        self.post("write response", move |core| {
            core.on_write(request_id, result, connection_handle, handle)
        });
    }

    fn on_mtu_exchanged(&self, request_id: RequestId, result: AttResult<u16>, connection_handle: u16) {
        self.post("MTU response", move |core| {
            core.on_mtu_exchanged(request_id, result, connection_handle)
        });
    }

    fn on_notification(
        &self,
        connection_handle: u16,
        handle: u16,
        value: Vec<u8>,
        need_confirm: bool,
    ) {
        self.post("notification", move |core| {
            core.on_notification(connection_handle, handle, value, need_confirm)
        });
    }
}

impl ConnectionObserver for ClientEvents {
    fn on_connected(&self, device: DeviceIdentity, connection_handle: u16, result: GattResult<()>) {
        self.post("connect event", move |core| {
            core.on_connected(device, connection_handle, result)
        });
    }

    fn on_disconnected(&self, device: DeviceIdentity, connection_handle: u16, reason: u8) {
        self.post("disconnect event", move |core| {
            core.on_disconnected(device, connection_handle, reason)
        });
    }

    fn on_connection_parameter_changed(
        &self,
        _device: DeviceIdentity,
        connection_handle: u16,
        parameters: ConnectionParameters,
        result: GattResult<()>,
    ) {
        self.post("parameter update", move |core| {
            core.on_connection_parameter_changed(connection_handle, parameters, result)
        });
    }

    fn on_shutdown(&self) {
        self.post("shutdown", |core| core.on_shutdown());
    }
}

/// GATT client shared by every application of the process
///
/// Calls block until the dispatcher thread has run them and fail with
/// [`GattError::Reentrant`] when made from inside a [`GattClientCallback`].
/// Results of remote operations arrive through the application's callback.
pub struct GattClient {
    dispatcher: Dispatcher<ClientCore>,
    events: Arc<ClientEvents>,
}

impl GattClient {
    /// Create a client over an ATT bearer and a connection manager.
    ///
    /// Wire the bearer and the connection manager to
    /// [`attribute_callback`](Self::attribute_callback) and
    /// [`connection_observer`](Self::connection_observer) afterwards.
    pub fn new(
        config: GattClientConfig,
        att: Box<dyn AttributeProtocol>,
        links: Box<dyn ConnectionManager>,
    ) -> GattResult<Self> {
        let name = config.dispatcher_name.clone();
        let dispatcher = Dispatcher::spawn(&name, ClientCore::new(config, att, links))?;
        let events = Arc::new(ClientEvents {
            handle: dispatcher.handle().clone(),
        });
        info!("GATT client started");
        Ok(Self { dispatcher, events })
    }

    /// Sink the ATT bearer reports results and notifications to
    pub fn attribute_callback(&self) -> Arc<dyn AttributeProtocolCallback> {
        self.events.clone()
    }

    /// Sink the connection manager reports link events to
    pub fn connection_observer(&self) -> Arc<dyn ConnectionObserver> {
        self.events.clone()
    }

    fn run<F, R>(&self, task: F) -> GattResult<R>
    where
        F: FnOnce(&mut ClientCore) -> GattResult<R> + Send + 'static,
        R: Send + 'static,
    {
        self.dispatcher.handle().call(task)?
    }

    pub fn register_application(
        &self,
        callback: Box<dyn GattClientCallback>,
        device: DeviceIdentity,
        shared: bool,
    ) -> GattResult<AppId> {
        self.run(move |core| core.register_application(callback, device, shared))
    }

    pub fn deregister_application(&self, app_id: AppId) -> GattResult<()> {
        self.run(move |core| core.deregister_application(app_id))
    }

    pub fn connect(&self, app_id: AppId, auto_connect: bool) -> GattResult<()> {
        self.run(move |core| core.connect(app_id, auto_connect))
    }

    pub fn disconnect(&self, app_id: AppId) -> GattResult<()> {
        self.run(move |core| core.disconnect(app_id))
    }

    /// Rediscover the device's attribute table; completion is reported through
    /// [`GattClientCallback::on_services_discovered`].
    pub fn discover_services(&self, app_id: AppId) -> GattResult<()> {
        self.run(move |core| core.discover_services(app_id))
    }

    pub fn read_characteristic(&self, app_id: AppId, handle: u16) -> GattResult<()> {
        self.run(move |core| core.read_characteristic(app_id, handle))
    }

    pub fn read_characteristic_by_uuid(&self, app_id: AppId, uuid: Uuid) -> GattResult<()> {
        self.run(move |core| core.read_characteristic_by_uuid(app_id, uuid))
    }

    pub fn write_characteristic(
        &self,
        app_id: AppId,
        handle: u16,
        value: Vec<u8>,
        without_response: bool,
    ) -> GattResult<()> {
        self.run(move |core| core.write_characteristic(app_id, handle, value, without_response))
    }

    pub fn read_descriptor(&self, app_id: AppId, handle: u16) -> GattResult<()> {
        self.run(move |core| core.read_descriptor(app_id, handle))
    }

    pub fn write_descriptor(&self, app_id: AppId, handle: u16, value: Vec<u8>) -> GattResult<()> {
        self.run(move |core| core.write_descriptor(app_id, handle, value))
    }

    pub fn request_exchange_mtu(&self, app_id: AppId, mtu: u16) -> GattResult<()> {
        self.run(move |core| core.request_exchange_mtu(app_id, mtu))
    }

    /// Snapshot of the cached services of the application's device
    pub fn get_services(&self, app_id: AppId) -> GattResult<Vec<Service>> {
        self.run(move |core| core.get_services(app_id))
    }

    /// Last negotiated MTU of the application's device
    pub fn mtu(&self, app_id: AppId) -> GattResult<u16> {
        self.run(move |core| core.mtu(app_id))
    }

    /// Wait until every event posted so far has been handled.
    #[cfg(test)]
    pub(crate) fn flush(&self) {
        let _ = self.dispatcher.handle().call(|_| ());
    }
}

impl Drop for GattClient {
    fn drop(&mut self) {
        debug!("Stopping GATT client");
    }
}
