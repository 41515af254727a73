//! Mapping from opaque context ids to carrier writers. The submission
//! surface uses it to route a request onto the correct work queue.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, Ordering},
    thread::JoinHandle,
};

use crossbeam_channel::Sender;
use oxbus::Transport;

use crate::completion::Endpoint;

/// Opaque handle for one open device carrier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ContextId(pub u32);

pub(crate) struct CarrierHandle {
    pub sender: Sender<u16>,
    pub join: Option<JoinHandle<()>>,
    pub transport: Transport,
    pub endpoint: Endpoint,
}

#[derive(Default)]
pub(crate) struct ContextRegistry {
    map: spin::Mutex<HashMap<ContextId, CarrierHandle>>,
    next_id: AtomicU32,
}

impl ContextRegistry {
    pub fn insert(&self, handle: CarrierHandle) -> ContextId {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.map.lock().insert(id, handle);
        id
    }

    /// Routing data for a submission: the work-queue sender plus the
    /// transport and endpoint recorded on the slot.
    pub fn route(&self, id: ContextId) -> Option<(Sender<u16>, Transport, Endpoint)> {
        let map = self.map.lock();
        let handle = map.get(&id)?;
        Some((handle.sender.clone(), handle.transport, handle.endpoint))
    }

    pub fn take(&self, id: ContextId) -> Option<CarrierHandle> {
        self.map.lock().remove(&id)
    }

    pub fn drain(&self) -> Vec<CarrierHandle> {
        self.map.lock().drain().map(|(_, h)| h).collect()
    }
}
