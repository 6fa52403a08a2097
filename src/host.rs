//! Driver-host pool management
//!
//! A driver host is an isolated process hosting some subset of the device
//! tree. The pool tracks which devices are resident where; a host is torn
//! down once its resident set drains.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::ids::{DeviceId, HostId, LocalId};

/// One driver-host process slot.
pub struct DriverHost {
    id: HostId,
    name: String,
    /// Process identity of the spawned host, cached at creation.
    koid: Uuid,
    devices: Vec<DeviceId>,
    dying: bool,
    next_local_id: u64,
}

impl DriverHost {
    pub(crate) fn new(id: HostId, name: impl Into<String>, koid: Uuid) -> Self {
        Self {
            id,
            name: name.into(),
            koid,
            devices: Vec::new(),
            dying: false,
            next_local_id: 0,
        }
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn koid(&self) -> Uuid {
        self.koid
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn is_dying(&self) -> bool {
        self.dying
    }

    pub(crate) fn set_dying(&mut self) {
        self.dying = true;
    }

    pub(crate) fn add_device(&mut self, device: DeviceId) {
        self.devices.push(device);
    }

    pub(crate) fn remove_device(&mut self, device: DeviceId) {
        self.devices.retain(|&d| d != device);
    }

    pub(crate) fn allocate_local_id(&mut self) -> LocalId {
        self.next_local_id += 1;
        LocalId(self.next_local_id)
    }
}

/// The pool of live driver hosts.
#[derive(Default)]
pub(crate) struct Hosts {
    map: HashMap<HostId, DriverHost>,
    next_id: u64,
}

impl Hosts {
    pub fn allocate_id(&mut self) -> HostId {
        self.next_id += 1;
        HostId(self.next_id)
    }

    pub fn insert(&mut self, host: DriverHost) {
        self.map.insert(host.id(), host);
    }

    pub fn get(&self, id: HostId) -> Option<&DriverHost> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: HostId) -> Option<&mut DriverHost> {
        self.map.get_mut(&id)
    }

    pub fn remove(&mut self, id: HostId) -> Option<DriverHost> {
        self.map.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// Maps a (host, host-local id) pair back to the owning device.
///
/// Unlike the rest of the coordinator state this table is consulted from
/// driver-host-side reply paths running off the dispatch thread, so it
/// carries its own lock. The lock is held per operation, never across an
/// RPC.
#[derive(Clone, Default)]
pub struct LocalIdMap {
    inner: Arc<Mutex<HashMap<(HostId, LocalId), DeviceId>>>,
}

impl LocalIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: HostId, local_id: LocalId, device: DeviceId) {
        self.inner.lock().insert((host, local_id), device);
    }

    pub fn lookup(&self, host: HostId, local_id: LocalId) -> Option<DeviceId> {
        self.inner.lock().get(&(host, local_id)).copied()
    }

    pub fn remove(&self, host: HostId, local_id: LocalId) -> Option<DeviceId> {
        self.inner.lock().remove(&(host, local_id))
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
