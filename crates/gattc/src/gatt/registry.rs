//! Application registrations and connection multiplexing
//!
//! Several applications may use the same remote device. They share one
//! physical link, grouped by connection handle. The link is requested when the
//! first application connects and released when the last one leaves.

use crate::error::{GattError, GattResult};
use crate::gap::{ConnectionManager, DeviceIdentity, DeviceState};
use crate::gatt::callback::GattClientCallback;
use crate::gatt::discovery::DiscoveryOrchestrator;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

/// Process-unique application identifier
pub type AppId = u32;

/// Per-application connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Outstanding single-shot request of an application, answered in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingRequest {
    ReadCharacteristic(u16),
    ReadByUuid,
    ReadDescriptor(u16),
    WriteCharacteristic(u16),
    WriteDescriptor(u16),
    ExchangeMtu,
}

/// One application's binding to one remote device
pub struct Registration {
    app_id: AppId,
    device: DeviceIdentity,
    shared: bool,
    state: ConnectionState,
    connection_handle: Option<u16>,
    callback: Box<dyn GattClientCallback>,
    pub(crate) discovery: Option<DiscoveryOrchestrator>,
    pub(crate) pending: VecDeque<PendingRequest>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("app_id", &self.app_id)
            .field("device", &self.device)
            .field("shared", &self.shared)
            .field("state", &self.state)
            .field("connection_handle", &self.connection_handle)
            .field("discovering", &self.discovery.is_some())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Registration {
    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connection_handle(&self) -> Option<u16> {
        self.connection_handle
    }

    pub fn callback(&mut self) -> &mut dyn GattClientCallback {
        self.callback.as_mut()
    }

    /// Move to `state` and tell the application.
    fn transition(&mut self, state: ConnectionState, result: GattResult<()>) {
        debug!("App {}: {:?} -> {:?}", self.app_id, self.state, state);
        self.state = state;
        self.callback.on_connection_state_changed(state, result);
    }

    fn attach(&mut self, connection_handle: u16) {
        self.connection_handle = Some(connection_handle);
        self.transition(ConnectionState::Connected, Ok(()));
    }

    /// Drop per-connection work. Late responses for it find nothing to update.
    fn detach(&mut self) {
        self.connection_handle = None;
        self.discovery = None;
        self.pending.clear();
    }
}

/// Registry of applications and their shared connections
#[derive(Debug)]
pub struct ApplicationRegistry {
    max_applications: usize,
    next_app_id: AppId,
    apps: BTreeMap<AppId, Registration>,
    /// connection handle -> applications using it
    groups: HashMap<u16, BTreeSet<AppId>>,
    /// devices with an outstanding physical connect request
    pending_connects: HashSet<DeviceIdentity>,
}

impl ApplicationRegistry {
    pub fn new(max_applications: usize) -> Self {
        Self {
            max_applications,
            next_app_id: 1,
            apps: BTreeMap::new(),
            groups: HashMap::new(),
            pending_connects: HashSet::new(),
        }
    }

    /// Register an application for `device`.
    ///
    /// An exclusive (`shared == false`) registration fails if another exclusive
    /// registration already exists for the same device.
    pub fn register(
        &mut self,
        callback: Box<dyn GattClientCallback>,
        device: DeviceIdentity,
        shared: bool,
    ) -> GattResult<AppId> {
        if self.apps.len() >= self.max_applications {
            warn!("Registration for {} rejected: application limit reached", device);
            return Err(GattError::MaxApplications);
        }
        if !shared && self.apps.values().any(|r| r.device == device && !r.shared) {
            warn!("Registration for {} rejected: device already bound", device);
            return Err(GattError::DeviceAlreadyBind);
        }

        let app_id = self.allocate_id();
        self.apps.insert(
            app_id,
            Registration {
                app_id,
                device,
                shared,
                state: ConnectionState::Disconnected,
                connection_handle: None,
                callback,
                discovery: None,
                pending: VecDeque::new(),
            },
        );
        info!("Registered app {} for {} (shared: {})", app_id, device, shared);
        Ok(app_id)
    }

    fn allocate_id(&mut self) -> AppId {
        loop {
            let id = self.next_app_id;
            self.next_app_id = self.next_app_id.wrapping_add(1).max(1);
            if !self.apps.contains_key(&id) {
                return id;
            }
        }
    }

    /// Remove a registration. Its connection group survives until the physical
    /// link goes down; if nobody else uses the link, a disconnect is requested.
    pub fn deregister(
        &mut self,
        app_id: AppId,
        links: &mut dyn ConnectionManager,
    ) -> GattResult<Registration> {
        let registration = self.apps.remove(&app_id).ok_or(GattError::InvalidParameter)?;
        let device = registration.device;

        match (registration.state, registration.connection_handle) {
            (ConnectionState::Connected | ConnectionState::Disconnecting, Some(handle)) => {
                if let Some(group) = self.groups.get_mut(&handle) {
                    group.remove(&app_id);
                    if group.is_empty() && registration.state == ConnectionState::Connected {
                        request_disconnect(links, &device);
                    }
                }
            }
            (ConnectionState::Connecting, _) => self.cancel_connect_if_unused(&device, links),
            _ => {}
        }

        info!("Deregistered app {} ({})", app_id, device);
        Ok(registration)
    }

    /// Connect an application to its device, sharing an existing link if any.
    pub fn connect(
        &mut self,
        app_id: AppId,
        auto_connect: bool,
        links: &mut dyn ConnectionManager,
    ) -> GattResult<()> {
        let registration = self.apps.get_mut(&app_id).ok_or(GattError::InvalidParameter)?;
        match registration.state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                return Err(GattError::DeviceBusy)
            }
            ConnectionState::Disconnected => {}
        }

        let device = registration.device;
        if let DeviceState::Connected(handle) = links.device_state(&device) {
            debug!("App {} joins existing link {:#06x} to {}", app_id, handle, device);
            self.groups.entry(handle).or_default().insert(app_id);
            registration.attach(handle);
            return Ok(());
        }

        registration.state = ConnectionState::Connecting;
        if self.pending_connects.insert(device) {
            info!("Requesting link to {} (auto: {})", device, auto_connect);
            if let Err(e) = links.connect(&device, auto_connect) {
                warn!("Link request to {} failed: {}", device, e);
                self.pending_connects.remove(&device);
                registration.state = ConnectionState::Disconnected;
                return Err(e);
            }
        } else {
            debug!("App {} waits on pending link to {}", app_id, device);
        }
        Ok(())
    }

    /// Disconnect an application. The physical link is released only when no
    /// other application still uses it.
    pub fn disconnect(&mut self, app_id: AppId, links: &mut dyn ConnectionManager) -> GattResult<()> {
        let registration = self.apps.get_mut(&app_id).ok_or(GattError::InvalidParameter)?;
        let device = registration.device;

        match registration.state {
            ConnectionState::Disconnected => Ok(()),
            ConnectionState::Disconnecting => Err(GattError::DeviceBusy),
            ConnectionState::Connecting => {
                registration.transition(ConnectionState::Disconnected, Ok(()));
                self.cancel_connect_if_unused(&device, links);
                Ok(())
            }
            ConnectionState::Connected => {
                let handle = registration
                    .connection_handle
                    .ok_or(GattError::RequestNotSupported)?;
                let shared_with_others = self
                    .groups
                    .get(&handle)
                    .map_or(false, |group| group.iter().any(|id| *id != app_id));

                if shared_with_others {
                    if let Some(group) = self.groups.get_mut(&handle) {
                        group.remove(&app_id);
                    }
                    registration.detach();
                    registration.transition(ConnectionState::Disconnected, Ok(()));
                    return Ok(());
                }

                info!("Last user of link {:#06x} left, disconnecting {}", handle, device);
                links.disconnect(&device)?;
                registration.discovery = None;
                registration.pending.clear();
                registration.state = ConnectionState::Disconnecting;
                Ok(())
            }
        }
    }

    /// Physical link came up (or failed to). Returns the applications that
    /// became connected.
    pub fn on_connected(
        &mut self,
        device: &DeviceIdentity,
        connection_handle: u16,
        result: GattResult<()>,
    ) -> Vec<AppId> {
        self.pending_connects.remove(device);
        let waiting: Vec<AppId> = self
            .apps
            .values()
            .filter(|r| r.device == *device && r.state == ConnectionState::Connecting)
            .map(|r| r.app_id)
            .collect();

        match result {
            Ok(()) => {
                info!("Link {:#06x} to {} is up", connection_handle, device);
                for app_id in &waiting {
                    if let Some(registration) = self.apps.get_mut(app_id) {
                        self.groups
                            .entry(connection_handle)
                            .or_default()
                            .insert(*app_id);
                        registration.attach(connection_handle);
                    }
                }
                waiting
            }
            Err(e) => {
                warn!("Link to {} failed: {}", device, e);
                for app_id in &waiting {
                    if let Some(registration) = self.apps.get_mut(app_id) {
                        registration.transition(ConnectionState::Disconnected, Err(e));
                    }
                }
                Vec::new()
            }
        }
    }

    /// Physical link went down; every application in its group is disconnected.
    pub fn on_disconnected(
        &mut self,
        device: &DeviceIdentity,
        connection_handle: u16,
        reason: u8,
    ) -> Vec<AppId> {
        info!(
            "Link {:#06x} to {} is down (reason {:#04x})",
            connection_handle, device, reason
        );
        let members = self.groups.remove(&connection_handle).unwrap_or_default();
        for app_id in &members {
            if let Some(registration) = self.apps.get_mut(app_id) {
                registration.detach();
                registration.transition(ConnectionState::Disconnected, Ok(()));
            }
        }
        members.into_iter().collect()
    }

    /// The adapter is going away: every application is disconnected.
    pub fn on_shutdown(&mut self) {
        info!("Adapter shutdown, dropping {} links", self.groups.len());
        self.groups.clear();
        self.pending_connects.clear();
        for registration in self.apps.values_mut() {
            if registration.state != ConnectionState::Disconnected {
                registration.detach();
                registration.transition(ConnectionState::Disconnected, Ok(()));
            }
        }
    }

    pub fn get(&self, app_id: AppId) -> Option<&Registration> {
        self.apps.get(&app_id)
    }

    pub fn get_mut(&mut self, app_id: AppId) -> Option<&mut Registration> {
        self.apps.get_mut(&app_id)
    }

    /// A registration that is connected, with its connection handle.
    pub fn connected(&mut self, app_id: AppId) -> GattResult<(&mut Registration, u16)> {
        let registration = self.apps.get_mut(&app_id).ok_or(GattError::InvalidParameter)?;
        match (registration.state, registration.connection_handle) {
            (ConnectionState::Connected, Some(handle)) => Ok((registration, handle)),
            _ => Err(GattError::RequestNotSupported),
        }
    }

    pub fn registrations(&self) -> impl Iterator<Item = &Registration> {
        self.apps.values()
    }

    /// Applications multiplexed on `connection_handle`.
    pub fn group(&self, connection_handle: u16) -> Option<&BTreeSet<AppId>> {
        self.groups.get(&connection_handle)
    }

    /// Whether any registration refers to `device`.
    pub fn has_device(&self, device: &DeviceIdentity) -> bool {
        self.apps.values().any(|r| r.device == *device)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    fn cancel_connect_if_unused(
        &mut self,
        device: &DeviceIdentity,
        links: &mut dyn ConnectionManager,
    ) {
        let still_waiting = self
            .apps
            .values()
            .any(|r| r.device == *device && r.state == ConnectionState::Connecting);
        if !still_waiting && self.pending_connects.remove(device) {
            debug!("Cancelling pending link to {}", device);
            request_disconnect(links, device);
        }
    }
}

fn request_disconnect(links: &mut dyn ConnectionManager, device: &DeviceIdentity) {
    if let Err(e) = links.disconnect(device) {
        warn!("Disconnect request for {} failed: {}", device, e);
    }
}
