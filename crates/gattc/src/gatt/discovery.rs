//! Service discovery state machine
//!
//! Discovery runs as a FIFO of tagged tasks. Each task issues exactly one ATT
//! operation; the answer arrives later on the dispatcher thread and may queue
//! further tasks (services -> includes + characteristics -> descriptors, and
//! includes -> services). Service tasks whose start handle has already been
//! visited are dropped without touching the bearer, which is what terminates
//! include cycles.

use crate::att::{AttErrorCode, AttResult, AttributeProtocol, RequestId};
use crate::att::{ATT_HANDLE_MAX, ATT_HANDLE_MIN};
use crate::error::GattError;
use crate::gatt::cache::AttributeCache;
use crate::gatt::types::{Characteristic, Descriptor, IncludeService, Service};
use log::{debug, trace, warn};
use std::collections::{HashSet, VecDeque};

/// One pending discovery step over `start_handle..=end_handle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryTask {
    Service { start_handle: u16, end_handle: u16 },
    IncludeService { start_handle: u16, end_handle: u16 },
    Characteristics { start_handle: u16, end_handle: u16 },
    Descriptors { start_handle: u16, end_handle: u16 },
}

impl DiscoveryTask {
    fn range(&self) -> (u16, u16) {
        match *self {
            DiscoveryTask::Service {
                start_handle,
                end_handle,
            }
            | DiscoveryTask::IncludeService {
                start_handle,
                end_handle,
            }
            | DiscoveryTask::Characteristics {
                start_handle,
                end_handle,
            }
            | DiscoveryTask::Descriptors {
                start_handle,
                end_handle,
            } => (start_handle, end_handle),
        }
    }

    fn issue(&self, att: &mut dyn AttributeProtocol, request_id: RequestId, conn: u16) {
        let (start, end) = self.range();
        match self {
            DiscoveryTask::Service { .. } => att.discover_services(request_id, conn, start, end),
            DiscoveryTask::IncludeService { .. } => {
                att.find_included_services(request_id, conn, start, end)
            }
            DiscoveryTask::Characteristics { .. } => {
                att.discover_characteristics(request_id, conn, start, end)
            }
            DiscoveryTask::Descriptors { .. } => {
                att.discover_descriptors(request_id, conn, start, end)
            }
        }
    }
}

/// Where a discovery run stands after handling an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStatus {
    /// A request is outstanding
    Pending,
    /// The queue drained without error
    Complete,
    /// The run was aborted; the queue has been drained
    Failed(GattError),
}

/// Discovery run for one application on one connection
#[derive(Debug)]
pub struct DiscoveryOrchestrator {
    request_id: RequestId,
    connection_handle: u16,
    queue: VecDeque<DiscoveryTask>,
    /// Start handles of service ranges already visited
    discovered: HashSet<u16>,
    in_flight: Option<DiscoveryTask>,
    /// Whether the top-level service task has been answered
    seeded: bool,
}

impl DiscoveryOrchestrator {
    pub fn new(request_id: RequestId, connection_handle: u16) -> Self {
        Self {
            request_id,
            connection_handle,
            queue: VecDeque::new(),
            discovered: HashSet::new(),
            in_flight: None,
            seeded: false,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn connection_handle(&self) -> u16 {
        self.connection_handle
    }

    /// Whether a request is outstanding
    pub fn is_running(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Begin a top-level run over the whole handle range.
    pub fn start(&mut self, att: &mut dyn AttributeProtocol) -> DiscoveryStatus {
        self.queue.clear();
        self.discovered.clear();
        self.in_flight = None;
        self.seeded = false;
        self.queue.push_back(DiscoveryTask::Service {
            start_handle: ATT_HANDLE_MIN,
            end_handle: ATT_HANDLE_MAX,
        });
        debug!("{}: starting service discovery", self.request_id);
        self.advance(att)
    }

    pub fn on_services(
        &mut self,
        result: AttResult<Vec<Service>>,
        cache: &mut AttributeCache,
        att: &mut dyn AttributeProtocol,
    ) -> DiscoveryStatus {
        let Some(DiscoveryTask::Service { start_handle, .. }) = self.answer(|t| {
            matches!(t, DiscoveryTask::Service { .. })
        }) else {
            return self.ignore("services");
        };
        let top_level = !std::mem::replace(&mut self.seeded, true);

        let services = match absorb_not_found(result) {
            Ok(services) => services,
            Err(code) => return self.fail(code.into()),
        };
        if top_level && services.is_empty() {
            return self.fail(GattError::NotFound);
        }

        for service in services {
            if service.handle > service.end_handle {
                warn!(
                    "{}: ignoring service with inverted range {:#06x}..{:#06x}",
                    self.request_id, service.handle, service.end_handle
                );
                continue;
            }
            // The task's own start handle was marked when it was issued.
            let fresh = service.handle == start_handle || self.discovered.insert(service.handle);
            let (handle, end_handle) = (service.handle, service.end_handle);
            cache.add_service(service);
            if fresh {
                self.queue.push_back(DiscoveryTask::IncludeService {
                    start_handle: handle,
                    end_handle,
                });
                self.queue.push_back(DiscoveryTask::Characteristics {
                    start_handle: handle,
                    end_handle,
                });
            }
        }
        self.advance(att)
    }

    pub fn on_included_services(
        &mut self,
        result: AttResult<Vec<IncludeService>>,
        cache: &mut AttributeCache,
        att: &mut dyn AttributeProtocol,
    ) -> DiscoveryStatus {
        let Some(DiscoveryTask::IncludeService { start_handle, .. }) = self.answer(|t| {
            matches!(t, DiscoveryTask::IncludeService { .. })
        }) else {
            return self.ignore("included services");
        };

        let includes = match absorb_not_found(result) {
            Ok(includes) => includes,
            Err(code) => return self.fail(code.into()),
        };
        for include in includes {
            if let Err(e) = cache.add_include_service(start_handle, include) {
                warn!("{}: include at {:#06x}: {}", self.request_id, include.handle, e);
            }
            self.queue.push_back(DiscoveryTask::Service {
                start_handle: include.start_handle,
                end_handle: include.end_handle,
            });
        }
        self.advance(att)
    }

    pub fn on_characteristics(
        &mut self,
        result: AttResult<Vec<Characteristic>>,
        cache: &mut AttributeCache,
        att: &mut dyn AttributeProtocol,
    ) -> DiscoveryStatus {
        let Some(DiscoveryTask::Characteristics { start_handle, .. }) = self.answer(|t| {
            matches!(t, DiscoveryTask::Characteristics { .. })
        }) else {
            return self.ignore("characteristics");
        };

        let characteristics = match absorb_not_found(result) {
            Ok(characteristics) => characteristics,
            Err(code) => return self.fail(code.into()),
        };
        let mut handles = Vec::with_capacity(characteristics.len());
        for characteristic in characteristics {
            let handle = characteristic.handle;
            match cache.add_characteristic(start_handle, characteristic) {
                Ok(()) => handles.push(handle),
                Err(e) => warn!("{}: characteristic at {:#06x}: {}", self.request_id, handle, e),
            }
        }
        // End handles depend on every sibling being in the cache first.
        for handle in handles {
            let Some(end_handle) = cache.characteristic_end_handle(start_handle, handle) else {
                continue;
            };
            let value_handle = cache
                .characteristic(handle)
                .map_or(handle, |c| c.value_handle);
            if end_handle <= value_handle {
                trace!("{}: no room for descriptors of {:#06x}", self.request_id, handle);
                continue;
            }
            self.queue.push_back(DiscoveryTask::Descriptors {
                start_handle: handle,
                end_handle,
            });
        }
        self.advance(att)
    }

    pub fn on_descriptors(
        &mut self,
        result: AttResult<Vec<Descriptor>>,
        cache: &mut AttributeCache,
        att: &mut dyn AttributeProtocol,
    ) -> DiscoveryStatus {
        let Some(DiscoveryTask::Descriptors { start_handle, .. }) = self.answer(|t| {
            matches!(t, DiscoveryTask::Descriptors { .. })
        }) else {
            return self.ignore("descriptors");
        };

        let descriptors = match absorb_not_found(result) {
            Ok(descriptors) => descriptors,
            Err(code) => return self.fail(code.into()),
        };
        // The range starts at the declaration; skip it and the value attribute.
        let value_handle = cache
            .characteristic(start_handle)
            .map_or(start_handle, |c| c.value_handle);
        for descriptor in descriptors
            .into_iter()
            .filter(|d| d.handle > value_handle)
        {
            if let Err(e) = cache.add_descriptor(start_handle, descriptor) {
                warn!(
                    "{}: descriptor at {:#06x}: {}",
                    self.request_id, descriptor.handle, e
                );
            }
        }
        self.advance(att)
    }

    /// Take the in-flight task if `is_expected` accepts it.
    fn answer(&mut self, is_expected: impl Fn(&DiscoveryTask) -> bool) -> Option<DiscoveryTask> {
        match self.in_flight {
            Some(task) if is_expected(&task) => self.in_flight.take(),
            _ => None,
        }
    }

    fn ignore(&self, what: &str) -> DiscoveryStatus {
        warn!(
            "{}: unexpected {} response while waiting for {:?}",
            self.request_id, what, self.in_flight
        );
        if self.in_flight.is_some() {
            DiscoveryStatus::Pending
        } else {
            DiscoveryStatus::Complete
        }
    }

    /// Issue the next task that is not a revisit.
    fn advance(&mut self, att: &mut dyn AttributeProtocol) -> DiscoveryStatus {
        while let Some(task) = self.queue.pop_front() {
            if let DiscoveryTask::Service { start_handle, .. } = task {
                if !self.discovered.insert(start_handle) {
                    trace!(
                        "{}: service range at {:#06x} already visited",
                        self.request_id, start_handle
                    );
                    continue;
                }
            }
            trace!("{}: issuing {:?}", self.request_id, task);
            task.issue(att, self.request_id, self.connection_handle);
            self.in_flight = Some(task);
            return DiscoveryStatus::Pending;
        }
        debug!("{}: service discovery complete", self.request_id);
        DiscoveryStatus::Complete
    }

    fn fail(&mut self, error: GattError) -> DiscoveryStatus {
        debug!(
            "{}: service discovery aborted with {} queued tasks: {}",
            self.request_id,
            self.queue.len(),
            error
        );
        self.queue.clear();
        self.discovered.clear();
        self.in_flight = None;
        DiscoveryStatus::Failed(error)
    }
}

/// `AttributeNotFound` marks the end of a range: treat it as an empty answer.
fn absorb_not_found<T>(result: AttResult<Vec<T>>) -> AttResult<Vec<T>> {
    match result {
        Err(AttErrorCode::AttributeNotFound) => Ok(Vec::new()),
        other => other,
    }
}
