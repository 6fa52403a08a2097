//! Individual device node management

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bind::DeviceProperty;
use crate::ids::{CompositeId, DeviceId, HostId, LocalId, TaskId};

/// Lifecycle state of a device.
///
/// The core states are strictly ordered: a device moves from `Initializing`
/// through `Active` and `Unbinding` to `Dead` and never backward. The
/// suspend/resume states are excursions within the active band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Initializing,
    Active,
    Suspending,
    Suspended,
    Resuming,
    /// Resume reply received; becomes `Active` once all children resumed.
    Resumed,
    Unbinding,
    Dead,
}

impl DeviceState {
    /// Position of the state in the forward-only core ordering.
    fn rank(self) -> u8 {
        match self {
            DeviceState::Initializing => 0,
            DeviceState::Active
            | DeviceState::Suspending
            | DeviceState::Suspended
            | DeviceState::Resuming
            | DeviceState::Resumed => 1,
            DeviceState::Unbinding => 2,
            DeviceState::Dead => 3,
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Initializing => write!(f, "Initializing"),
            DeviceState::Active => write!(f, "Active"),
            DeviceState::Suspending => write!(f, "Suspending"),
            DeviceState::Suspended => write!(f, "Suspended"),
            DeviceState::Resuming => write!(f, "Resuming"),
            DeviceState::Resumed => write!(f, "Resumed"),
            DeviceState::Unbinding => write!(f, "Unbinding"),
            DeviceState::Dead => write!(f, "Dead"),
        }
    }
}

/// What kind of node this is; drives per-kind lifecycle dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// A device published by a driver or the framework.
    Normal,
    /// The synthetic device representing an assembled composite.
    Composite,
    /// A same-process stand-in for a device living in another host.
    Proxy,
}

/// Static behavior flags set at creation time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeviceFlags {
    /// Created invisible; not published until init completes and the
    /// device is made visible.
    pub invisible: bool,
    /// An instance device; never auto-bound.
    pub instance: bool,
    /// May be matched by fragments of more than one composite.
    pub allow_multi_composite: bool,
    /// Children must be created in a separate driver host behind a proxy.
    pub must_isolate: bool,
    /// Never auto-bound on publish.
    pub skip_autobind: bool,
    /// Never removed (tree roots created by the coordinator).
    pub immortal: bool,
}

/// A typed metadata blob attached to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub type_id: u32,
    pub data: Vec<u8>,
}

impl Metadata {
    pub fn new(type_id: u32, data: Vec<u8>) -> Self {
        Self { type_id, data }
    }
}

/// Membership of a device in one fragment of a composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRef {
    pub composite: CompositeId,
    pub index: usize,
}

/// A node in the device tree.
///
/// All cross-references (parent, proxy, composite) are ids resolved through
/// the coordinator's device table; the table is the single owner.
pub struct Device {
    id: DeviceId,
    name: String,
    kind: DeviceKind,
    flags: DeviceFlags,
    props: Vec<DeviceProperty>,
    driver_url: Option<String>,

    state: DeviceState,
    visible: bool,
    bound: bool,

    parent: Option<DeviceId>,
    children: Vec<DeviceId>,
    proxy: Option<DeviceId>,

    host: Option<HostId>,
    local_id: Option<LocalId>,

    /// Set when this device is the assembled device of a composite.
    composite: Option<CompositeId>,
    /// Composite fragments this device was matched against.
    fragments: Vec<FragmentRef>,

    metadata: Vec<Metadata>,

    /// Whether the in-flight unbind should issue the unbind RPC to the
    /// driver (false for removals that skip the driver's unbind hook).
    unbind_requested: bool,

    // At most one in-flight task per kind.
    active_init: Option<TaskId>,
    active_unbind: Option<TaskId>,
    active_remove: Option<TaskId>,
    active_suspend: Option<TaskId>,
    active_resume: Option<TaskId>,

    /// Power state last reported by a resume reply.
    power_state: u32,

    // Rebind backoff for must-isolate parents whose children all died.
    pub(crate) backoff: Duration,
    pub(crate) retries: u32,
}

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        name: impl Into<String>,
        kind: DeviceKind,
        flags: DeviceFlags,
        props: Vec<DeviceProperty>,
        parent: Option<DeviceId>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            flags,
            props,
            driver_url: None,
            state: DeviceState::Active,
            visible: !flags.invisible,
            bound: false,
            parent,
            children: Vec::new(),
            proxy: None,
            host: None,
            local_id: None,
            composite: None,
            fragments: Vec::new(),
            metadata: Vec::new(),
            unbind_requested: false,
            active_init: None,
            active_unbind: None,
            active_remove: None,
            active_suspend: None,
            active_resume: None,
            power_state: 0,
            backoff: Duration::from_millis(250),
            retries: 4,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    pub fn props(&self) -> &[DeviceProperty] {
        &self.props
    }

    /// Withdraw the created-invisible request so init completion reveals
    /// the device.
    pub(crate) fn clear_invisible_flag(&mut self) {
        self.flags.invisible = false;
    }

    pub fn driver_url(&self) -> Option<&str> {
        self.driver_url.as_deref()
    }

    pub(crate) fn set_driver_url(&mut self, url: impl Into<String>) {
        self.driver_url = Some(url.into());
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Update the lifecycle state. The core ordering is forward-only.
    pub(crate) fn set_state(&mut self, state: DeviceState) {
        debug_assert!(
            state.rank() >= self.state.rank(),
            "device {} state regression {} -> {}",
            self.id,
            self.state,
            state
        );
        self.state = state;
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub(crate) fn set_visible(&mut self) {
        self.visible = true;
    }

    /// Put a freshly created device into the initializing state; it stays
    /// hidden until the init task completes.
    pub(crate) fn begin_initializing(&mut self) {
        self.state = DeviceState::Initializing;
        self.visible = false;
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub(crate) fn set_bound(&mut self, bound: bool) {
        self.bound = bound;
    }

    /// A device is bindable once it is visible, unbound and not dead.
    pub fn is_bindable(&self) -> bool {
        !self.bound && self.visible && self.state != DeviceState::Dead
    }

    /// Whether a composite fragment may match this device.
    pub fn is_composite_bindable(&self) -> bool {
        if self.state == DeviceState::Dead || !self.visible || self.flags.skip_autobind {
            return false;
        }
        if !self.fragments.is_empty() && !self.flags.allow_multi_composite {
            return false;
        }
        true
    }

    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    pub(crate) fn detach_from_parent(&mut self) {
        self.parent = None;
    }

    pub fn children(&self) -> &[DeviceId] {
        &self.children
    }

    pub(crate) fn add_child(&mut self, child: DeviceId) {
        self.children.push(child);
    }

    pub(crate) fn remove_child(&mut self, child: DeviceId) {
        self.children.retain(|&c| c != child);
    }

    pub fn proxy(&self) -> Option<DeviceId> {
        self.proxy
    }

    pub(crate) fn set_proxy(&mut self, proxy: DeviceId) {
        self.proxy = Some(proxy);
    }

    pub(crate) fn clear_proxy(&mut self) {
        self.proxy = None;
    }

    pub fn host(&self) -> Option<HostId> {
        self.host
    }

    pub(crate) fn set_host(&mut self, host: Option<HostId>) {
        self.host = host;
    }

    pub fn local_id(&self) -> Option<LocalId> {
        self.local_id
    }

    pub(crate) fn set_local_id(&mut self, local_id: Option<LocalId>) {
        self.local_id = local_id;
    }

    pub fn composite(&self) -> Option<CompositeId> {
        self.composite
    }

    pub(crate) fn set_composite(&mut self, composite: CompositeId) {
        debug_assert!(self.composite.is_none());
        self.composite = Some(composite);
    }

    pub(crate) fn disassociate_from_composite(&mut self) {
        self.composite = None;
    }

    pub fn fragments(&self) -> &[FragmentRef] {
        &self.fragments
    }

    pub(crate) fn push_fragment(&mut self, fragment: FragmentRef) {
        self.fragments.push(fragment);
    }

    pub(crate) fn remove_fragment(&mut self, fragment: FragmentRef) {
        self.fragments.retain(|&f| f != fragment);
    }

    pub fn metadata(&self) -> &[Metadata] {
        &self.metadata
    }

    pub(crate) fn add_metadata(&mut self, md: Metadata) {
        self.metadata.push(md);
    }

    pub fn power_state(&self) -> u32 {
        self.power_state
    }

    pub(crate) fn set_power_state(&mut self, state: u32) {
        self.power_state = state;
    }

    pub(crate) fn unbind_requested(&self) -> bool {
        self.unbind_requested
    }

    pub(crate) fn set_unbind_requested(&mut self, requested: bool) {
        self.unbind_requested = requested;
    }

    pub fn active_init(&self) -> Option<TaskId> {
        self.active_init
    }

    pub fn active_unbind(&self) -> Option<TaskId> {
        self.active_unbind
    }

    pub fn active_remove(&self) -> Option<TaskId> {
        self.active_remove
    }

    pub fn active_suspend(&self) -> Option<TaskId> {
        self.active_suspend
    }

    pub fn active_resume(&self) -> Option<TaskId> {
        self.active_resume
    }

    pub(crate) fn set_active_init(&mut self, task: Option<TaskId>) {
        self.active_init = task;
    }

    pub(crate) fn set_active_unbind(&mut self, task: Option<TaskId>) {
        self.active_unbind = task;
    }

    pub(crate) fn set_active_remove(&mut self, task: Option<TaskId>) {
        self.active_remove = task;
    }

    pub(crate) fn set_active_suspend(&mut self, task: Option<TaskId>) {
        self.active_suspend = task;
    }

    pub(crate) fn set_active_resume(&mut self, task: Option<TaskId>) {
        self.active_resume = task;
    }

    pub fn has_active_tasks(&self) -> bool {
        self.active_init.is_some()
            || self.active_unbind.is_some()
            || self.active_remove.is_some()
            || self.active_suspend.is_some()
            || self.active_resume.is_some()
    }
}

/// The device table: single owner of every [`Device`] in the tree.
#[derive(Default)]
pub(crate) struct Devices {
    map: std::collections::HashMap<DeviceId, Device>,
    next_id: u64,
}

impl Devices {
    pub fn allocate_id(&mut self) -> DeviceId {
        self.next_id += 1;
        DeviceId(self.next_id)
    }

    pub fn insert(&mut self, device: Device) {
        self.map.insert(device.id(), device);
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.map.get_mut(&id)
    }

    pub fn remove(&mut self, id: DeviceId) -> Option<Device> {
        self.map.remove(&id)
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.map.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Property lists of `id` and its ancestors, nearest first, for
    /// fragment match evaluation.
    pub fn ancestry(&self, id: DeviceId) -> Vec<&[DeviceProperty]> {
        let mut chain = Vec::new();
        let mut cur = Some(id);
        while let Some(dev_id) = cur {
            match self.get(dev_id) {
                Some(dev) => {
                    chain.push(dev.props());
                    cur = dev.parent();
                }
                None => break,
            }
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_state_display() {
        assert_eq!(DeviceState::Initializing.to_string(), "Initializing");
        assert_eq!(DeviceState::Dead.to_string(), "Dead");
    }

    #[test]
    fn test_state_forward_progression() {
        let mut dev = Device::new(
            DeviceId(1),
            "dev",
            DeviceKind::Normal,
            DeviceFlags::default(),
            Vec::new(),
            None,
        );
        dev.set_state(DeviceState::Unbinding);
        dev.set_state(DeviceState::Dead);
        assert_eq!(dev.state(), DeviceState::Dead);
    }

    #[test]
    #[should_panic(expected = "state regression")]
    fn test_state_regression_asserts() {
        let mut dev = Device::new(
            DeviceId(1),
            "dev",
            DeviceKind::Normal,
            DeviceFlags::default(),
            Vec::new(),
            None,
        );
        dev.set_state(DeviceState::Dead);
        dev.set_state(DeviceState::Active);
    }

    #[test]
    fn test_invisible_until_made_visible() {
        let flags = DeviceFlags {
            invisible: true,
            ..Default::default()
        };
        let mut dev = Device::new(
            DeviceId(1),
            "dev",
            DeviceKind::Normal,
            flags,
            Vec::new(),
            None,
        );
        assert!(!dev.is_visible());
        assert!(!dev.is_bindable());
        dev.set_visible();
        assert!(dev.is_bindable());
    }

    #[test]
    fn test_composite_bindable_respects_multi_composite() {
        let mut dev = Device::new(
            DeviceId(1),
            "dev",
            DeviceKind::Normal,
            DeviceFlags::default(),
            Vec::new(),
            None,
        );
        assert!(dev.is_composite_bindable());
        dev.push_fragment(FragmentRef {
            composite: CompositeId(1),
            index: 0,
        });
        assert!(!dev.is_composite_bindable());

        let mut multi = Device::new(
            DeviceId(2),
            "multi",
            DeviceKind::Normal,
            DeviceFlags {
                allow_multi_composite: true,
                ..Default::default()
            },
            Vec::new(),
            None,
        );
        multi.push_fragment(FragmentRef {
            composite: CompositeId(1),
            index: 0,
        });
        assert!(multi.is_composite_bindable());
    }

    #[test]
    fn test_ancestry_walks_to_root() {
        let mut devices = Devices::default();
        let root_id = devices.allocate_id();
        let mut root = Device::new(
            root_id,
            "root",
            DeviceKind::Normal,
            DeviceFlags::default(),
            vec![DeviceProperty::new(100, 1)],
            None,
        );
        let child_id = devices.allocate_id();
        root.add_child(child_id);
        devices.insert(root);
        devices.insert(Device::new(
            child_id,
            "child",
            DeviceKind::Normal,
            DeviceFlags::default(),
            vec![DeviceProperty::new(1, 10)],
            Some(root_id),
        ));

        let chain = devices.ancestry(child_id);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0], &[DeviceProperty::new(1, 10)]);
        assert_eq!(chain[1], &[DeviceProperty::new(100, 1)]);
    }
}
