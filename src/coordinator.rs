//! Coordinator: owner of the device tree, driver-host pool and composite
//! registry
//!
//! All tree mutation, task scheduling and completion callbacks run on one
//! dispatch thread; driver-host replies and timers land on the event queue
//! and are folded in by [`Coordinator::run_until_idle`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::bind::DeviceProperty;
use crate::composite::{CompositeDescriptor, CompositeDevice};
use crate::config::CoordinatorConfig;
use crate::device::{Device, DeviceFlags, DeviceKind, DeviceState, Devices, FragmentRef, Metadata};
use crate::error::{Error, Result, TaskError, TaskStatus};
use crate::host::{DriverHost, Hosts, LocalIdMap};
use crate::ids::{CompositeId, DeviceId, HostId, LocalId, TaskId};
use crate::power::{self, PowerCallback, ResumeContext, SuspendContext};
use crate::task::{TaskKind, TaskScheduler};
use crate::tasks;
use crate::transport::{Event, EventQueue, EventSender, FallbackAction, SystemPowerState, Transport};

/// Parameters for adding a device under a parent.
#[derive(Debug, Clone)]
pub struct AddDeviceArgs {
    pub name: String,
    pub props: Vec<DeviceProperty>,
    pub driver_url: Option<String>,
    /// The driver implements an init hook; the device stays invisible
    /// until its init task completes.
    pub wants_init: bool,
    pub invisible: bool,
    pub instance: bool,
    pub skip_autobind: bool,
    pub must_isolate: bool,
    pub allow_multi_composite: bool,
    /// Driver host the device is resident in; defaults to the parent's.
    pub host: Option<HostId>,
}

impl AddDeviceArgs {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            props: Vec::new(),
            driver_url: None,
            wants_init: false,
            invisible: false,
            instance: false,
            skip_autobind: false,
            must_isolate: false,
            allow_multi_composite: false,
            host: None,
        }
    }

    pub fn props(mut self, props: Vec<DeviceProperty>) -> Self {
        self.props = props;
        self
    }

    pub fn driver_url(mut self, url: impl Into<String>) -> Self {
        self.driver_url = Some(url.into());
        self
    }

    pub fn with_init(mut self) -> Self {
        self.wants_init = true;
        self
    }

    pub fn invisible(mut self) -> Self {
        self.invisible = true;
        self
    }

    pub fn instance(mut self) -> Self {
        self.instance = true;
        self
    }

    pub fn skip_autobind(mut self) -> Self {
        self.skip_autobind = true;
        self
    }

    pub fn must_isolate(mut self) -> Self {
        self.must_isolate = true;
        self
    }

    pub fn allow_multi_composite(mut self) -> Self {
        self.allow_multi_composite = true;
        self
    }

    pub fn in_host(mut self, host: HostId) -> Self {
        self.host = Some(host);
        self
    }
}

/// Read-only snapshot of one device, for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub state: String,
    pub host: Option<HostId>,
    pub local_id: Option<LocalId>,
    pub props: Vec<DeviceProperty>,
    pub visible: bool,
    pub bound: bool,
}

/// Read-only snapshot of one composite fragment's bind status.
#[derive(Debug, Clone, Serialize)]
pub struct FragmentInfo {
    pub index: usize,
    pub bound_device: Option<DeviceId>,
    pub fragment_device: Option<DeviceId>,
}

/// Read-only snapshot of one composite device.
#[derive(Debug, Clone, Serialize)]
pub struct CompositeInfo {
    pub id: CompositeId,
    pub name: String,
    pub assembled: Option<DeviceId>,
    pub fragments: Vec<FragmentInfo>,
}

/// Read-only snapshot of one driver host.
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub id: HostId,
    pub name: String,
    pub koid: String,
    pub devices: Vec<DeviceId>,
}

/// Full introspection snapshot of the coordinator's state.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    pub devices: Vec<DeviceInfo>,
    pub composites: Vec<CompositeInfo>,
    pub hosts: Vec<HostInfo>,
}

/// Process-wide owner of the device tree root, the driver-host pool and
/// the composite-device registry.
pub struct Coordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    pub(crate) devices: Devices,
    pub(crate) hosts: Hosts,
    pub(crate) composites: HashMap<CompositeId, CompositeDevice>,
    pub(crate) tasks: TaskScheduler,
    local_ids: LocalIdMap,
    events: EventQueue,
    root_device: DeviceId,
    suspend: Option<SuspendContext>,
    resume: Option<ResumeContext>,
    suspend_generation: u64,
    next_composite_id: u64,
}

impl Coordinator {
    /// Build a coordinator with an immortal root device.
    pub fn new(config: CoordinatorConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let mut devices = Devices::default();
        let root_id = devices.allocate_id();
        let root = Device::new(
            root_id,
            config.root_device_name.clone(),
            DeviceKind::Normal,
            DeviceFlags {
                immortal: true,
                skip_autobind: true,
                ..Default::default()
            },
            Vec::new(),
            None,
        );
        devices.insert(root);
        tracing::info!(root = %config.root_device_name, "Coordinator created");

        Ok(Self {
            config,
            transport,
            devices,
            hosts: Hosts::default(),
            composites: HashMap::new(),
            tasks: TaskScheduler::default(),
            local_ids: LocalIdMap::new(),
            events: EventQueue::new(),
            root_device: root_id,
            suspend: None,
            resume: None,
            suspend_generation: 0,
            next_composite_id: 0,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn root_device(&self) -> DeviceId {
        self.root_device
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn driver_host(&self, id: HostId) -> Option<&DriverHost> {
        self.hosts.get(id)
    }

    pub fn composite(&self, id: CompositeId) -> Option<&CompositeDevice> {
        self.composites.get(&id)
    }

    pub fn local_id_map(&self) -> &LocalIdMap {
        &self.local_ids
    }

    /// Handle for delivering RPC replies and timer fires onto the
    /// dispatch loop.
    pub fn event_sender(&self) -> EventSender {
        self.events.sender()
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    // ---- device tree mutation ------------------------------------------

    /// Add a device under `parent`; the new device is resident in the
    /// parent's driver host.
    pub fn add_device(&mut self, parent: DeviceId, args: AddDeviceArgs) -> Result<DeviceId> {
        let (parent_state, parent_host, parent_name) = {
            let parent_dev = self
                .devices
                .get(parent)
                .ok_or(Error::DeviceNotFound(parent))?;
            (
                parent_dev.state(),
                parent_dev.host(),
                parent_dev.name().to_string(),
            )
        };
        if matches!(parent_state, DeviceState::Dead | DeviceState::Unbinding) {
            return Err(Error::InvalidState {
                current: parent_state.to_string(),
                expected: "a live parent".into(),
            });
        }

        let id = self.devices.allocate_id();
        let flags = DeviceFlags {
            invisible: args.invisible,
            instance: args.instance,
            allow_multi_composite: args.allow_multi_composite,
            must_isolate: args.must_isolate,
            skip_autobind: args.skip_autobind,
            immortal: false,
        };
        let mut dev = Device::new(
            id,
            args.name.clone(),
            DeviceKind::Normal,
            flags,
            args.props,
            Some(parent),
        );
        if let Some(url) = &args.driver_url {
            dev.set_driver_url(url.clone());
        }
        if args.wants_init {
            dev.begin_initializing();
        }
        self.devices.insert(dev);
        if let Some(parent_dev) = self.devices.get_mut(parent) {
            parent_dev.add_child(id);
        }

        if let Some(host) = args.host.or(parent_host) {
            if let Err(e) = self.attach_device_to_host(id, host) {
                // No partial mutation: undo the tree insertion.
                if let Some(parent_dev) = self.devices.get_mut(parent) {
                    parent_dev.remove_child(id);
                }
                self.devices.remove(id);
                return Err(e);
            }
        }
        tracing::info!(device = %args.name, parent = %parent_name, "Device added");

        let is_fragment_driver = args
            .driver_url
            .as_deref()
            .map(|url| url == self.config.fragment_driver_url)
            .unwrap_or(false);
        if is_fragment_driver {
            self.record_fragment_device(parent, id);
        }

        if args.wants_init {
            tasks::init::create_init_task(self, id);
        } else {
            self.publish_device(id);
        }
        Ok(id)
    }

    /// Create a device record in a host: allocates the host-local id,
    /// registers it in the lookup table and tells the host about it.
    fn attach_device_to_host(&mut self, device: DeviceId, host_id: HostId) -> Result<LocalId> {
        let local_id = {
            let host = self
                .hosts
                .get_mut(host_id)
                .ok_or(Error::HostNotFound(host_id))?;
            if host.is_dying() {
                return Err(Error::HostDying(host_id));
            }
            let local_id = host.allocate_local_id();
            host.add_device(device);
            local_id
        };
        self.local_ids.insert(host_id, local_id, device);
        if let Some(dev) = self.devices.get_mut(device) {
            dev.set_host(Some(host_id));
            dev.set_local_id(Some(local_id));
        }
        if let Err(e) = self.transport.create_device(host_id, device, local_id) {
            self.detach_device_from_host(device);
            return Err(e);
        }
        Ok(local_id)
    }

    fn detach_device_from_host(&mut self, device: DeviceId) {
        let (host_id, local_id) = match self.devices.get(device) {
            Some(dev) => (dev.host(), dev.local_id()),
            None => return,
        };
        if let (Some(host_id), Some(local_id)) = (host_id, local_id) {
            self.local_ids.remove(host_id, local_id);
            if let Some(host) = self.hosts.get_mut(host_id) {
                host.remove_device(device);
            }
        }
        if let Some(dev) = self.devices.get_mut(device) {
            dev.set_host(None);
            dev.set_local_id(None);
        }
    }

    /// Spawn a new driver-host process.
    pub fn create_driver_host(&mut self, name: &str) -> Result<HostId> {
        if self.hosts.len() >= self.config.max_driver_hosts {
            return Err(Error::Config(format!(
                "Maximum driver host limit ({}) reached",
                self.config.max_driver_hosts
            )));
        }
        let handle = self.transport.create_driver_host(name)?;
        let id = self.hosts.allocate_id();
        self.hosts.insert(DriverHost::new(id, name, handle.koid));
        tracing::info!(host = %id, name = %name, "Driver host created");
        Ok(id)
    }

    /// Reveal a device. During init the request is folded into the init
    /// completion; afterward the device is published immediately.
    pub fn make_visible(&mut self, device: DeviceId) -> Result<()> {
        let dev = self
            .devices
            .get_mut(device)
            .ok_or(Error::DeviceNotFound(device))?;
        match dev.state() {
            DeviceState::Dead => Err(Error::InvalidState {
                current: "Dead".into(),
                expected: "alive".into(),
            }),
            DeviceState::Initializing => {
                dev.clear_invisible_flag();
                Ok(())
            }
            _ => {
                if !dev.is_visible() {
                    dev.clear_invisible_flag();
                    dev.set_visible();
                    self.publish_device(device);
                }
                Ok(())
            }
        }
    }

    /// Attach a typed metadata blob to a device.
    pub fn add_metadata(&mut self, device: DeviceId, type_id: u32, data: Vec<u8>) -> Result<()> {
        let dev = self
            .devices
            .get_mut(device)
            .ok_or(Error::DeviceNotFound(device))?;
        dev.add_metadata(Metadata::new(type_id, data));
        Ok(())
    }

    /// Offer a newly visible device to the composite registry.
    pub(crate) fn publish_device(&mut self, device: DeviceId) {
        let eligible = self
            .devices
            .get(device)
            .map(|dev| {
                dev.is_visible()
                    && dev.state() != DeviceState::Dead
                    && !dev.flags().skip_autobind
                    && !dev.flags().instance
            })
            .unwrap_or(false);
        if !eligible {
            return;
        }
        let mut composite_ids: Vec<_> = self.composites.keys().copied().collect();
        composite_ids.sort();
        for cid in composite_ids {
            let bindable = self
                .devices
                .get(device)
                .map(|d| d.is_composite_bindable())
                .unwrap_or(false);
            if !bindable {
                break;
            }
            if let Err(e) = self.match_composite(cid, device) {
                tracing::warn!(device = %device, error = %e, "Composite match rejected");
            }
        }
    }

    /// Probe one composite for `device` and bind the matching fragment.
    fn match_composite(&mut self, cid: CompositeId, device: DeviceId) -> Result<()> {
        let matched = {
            let ancestry = self.devices.ancestry(device);
            let composite = self
                .composites
                .get(&cid)
                .ok_or(Error::CompositeNotFound(cid))?;
            composite.try_match_fragments(device, &ancestry)?
        };
        match matched {
            Some(index) => self.bind_fragment(cid, index, device),
            None => Ok(()),
        }
    }

    /// Bind a matched fragment: auto-binds the fragment driver onto the
    /// device and moves the fragment to the bound collection.
    pub(crate) fn bind_fragment(
        &mut self,
        cid: CompositeId,
        index: usize,
        device: DeviceId,
    ) -> Result<()> {
        let (host, local_id, allow_multi, dev_name) = {
            let dev = self
                .devices
                .get(device)
                .ok_or(Error::DeviceNotFound(device))?;
            (
                dev.host(),
                dev.local_id(),
                dev.flags().allow_multi_composite,
                dev.name().to_string(),
            )
        };
        let (host, local_id) = match (host, local_id) {
            (Some(h), Some(l)) => (h, l),
            _ => {
                return Err(Error::InvalidState {
                    current: "no driver host".into(),
                    expected: "a hosted device".into(),
                })
            }
        };

        // Bind fails => the fragment stays unbound.
        let url = self.config.fragment_driver_url.clone();
        self.transport.bind_driver(host, local_id, &url)?;

        let composite_name = {
            let composite = self
                .composites
                .get_mut(&cid)
                .ok_or(Error::CompositeNotFound(cid))?;
            composite.mark_fragment_bound(index, device);
            composite.name().to_string()
        };
        if let Some(dev) = self.devices.get_mut(device) {
            dev.push_fragment(FragmentRef {
                composite: cid,
                index,
            });
            if !allow_multi {
                dev.set_bound(true);
            }
        }
        tracing::info!(composite = %composite_name, fragment = index, device = %dev_name,
            "Fragment bound");

        match self.try_assemble_composite(cid) {
            Ok(()) | Err(Error::ShouldWait(_)) => Ok(()),
            Err(e) => {
                tracing::error!(composite = %composite_name, error = %e, "Assembly failed");
                Err(e)
            }
        }
    }

    /// Record that the fragment driver bound to `parent` has published
    /// its device, then re-attempt assembly.
    fn record_fragment_device(&mut self, parent: DeviceId, device: DeviceId) {
        let refs: Vec<FragmentRef> = self
            .devices
            .get(parent)
            .map(|dev| dev.fragments().to_vec())
            .unwrap_or_default();
        for fragment_ref in refs {
            let recorded = self
                .composites
                .get_mut(&fragment_ref.composite)
                .and_then(|composite| composite.bound_fragment_mut(fragment_ref.index))
                .map(|fragment| {
                    if fragment.fragment_device().is_none() {
                        fragment.set_fragment_device(Some(device));
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if recorded {
                if let Err(e) = self.try_assemble_composite(fragment_ref.composite) {
                    if !matches!(e, Error::ShouldWait(_)) {
                        tracing::error!(composite = %fragment_ref.composite, error = %e,
                            "Assembly failed");
                    }
                }
                break;
            }
        }
    }

    /// Bind a specific driver to a device (the `BindDevice` request).
    pub fn bind_device(&mut self, device: DeviceId, driver_url: &str) -> Result<()> {
        let (bindable, bound, must_isolate, host, local_id) = {
            let dev = self
                .devices
                .get(device)
                .ok_or(Error::DeviceNotFound(device))?;
            (
                dev.is_bindable(),
                dev.is_bound(),
                dev.flags().must_isolate,
                dev.host(),
                dev.local_id(),
            )
        };
        if bound {
            return Err(Error::AlreadyBound(device));
        }
        if !bindable {
            return Err(Error::InvalidState {
                current: "not bindable".into(),
                expected: "a visible unbound device".into(),
            });
        }

        if must_isolate {
            let proxy = self.prepare_proxy(device, None)?;
            let (host, local_id) = match self.devices.get(proxy) {
                Some(p) => (p.host(), p.local_id()),
                None => (None, None),
            };
            match (host, local_id) {
                (Some(h), Some(l)) => self.transport.bind_driver(h, l, driver_url)?,
                _ => return Err(Error::Transport("proxy has no driver host".into())),
            }
        } else {
            match (host, local_id) {
                (Some(h), Some(l)) => self.transport.bind_driver(h, l, driver_url)?,
                _ => {
                    return Err(Error::InvalidState {
                        current: "no driver host".into(),
                        expected: "a hosted device".into(),
                    })
                }
            }
        }
        if let Some(dev) = self.devices.get_mut(device) {
            dev.set_bound(true);
            dev.set_driver_url(driver_url);
            tracing::info!(device = %dev.name(), driver = %driver_url, "Driver bound");
        }
        Ok(())
    }

    // ---- composite devices ---------------------------------------------

    /// Register a composite device specification and match it against
    /// every existing device (the `AddCompositeDevice` request).
    pub fn add_composite_device(
        &mut self,
        name: &str,
        descriptor: CompositeDescriptor,
    ) -> Result<CompositeId> {
        self.next_composite_id += 1;
        let cid = CompositeId(self.next_composite_id);
        let composite = CompositeDevice::create(cid, name, descriptor)?;
        tracing::info!(composite = %name, fragments = composite.fragments_count(),
            "Composite device added");
        self.composites.insert(cid, composite);

        for device in self.devices.ids() {
            let bindable = self
                .devices
                .get(device)
                .map(|d| d.is_composite_bindable() && d.is_visible())
                .unwrap_or(false);
            if !bindable {
                continue;
            }
            if let Err(e) = self.match_composite(cid, device) {
                tracing::warn!(composite = %name, device = %device, error = %e,
                    "Composite match rejected");
            }
        }
        Ok(cid)
    }

    /// Assemble the composite once every fragment is ready: pick the
    /// driver host, create proxies for out-of-host fragments, create the
    /// synthetic device and re-add the composite metadata.
    pub fn try_assemble_composite(&mut self, cid: CompositeId) -> Result<()> {
        let (name, props, coresident, metadata, count, fragments) = {
            let composite = self
                .composites
                .get(&cid)
                .ok_or(Error::CompositeNotFound(cid))?;
            if composite.device().is_some() {
                return Ok(());
            }
            if !composite.is_ready_to_assemble() {
                return Err(Error::ShouldWait(composite.name().to_string()));
            }
            let mut fragments = Vec::new();
            for fragment in composite.bound_fragments() {
                match (fragment.bound_device(), fragment.fragment_device()) {
                    (Some(bound), Some(frag_dev)) => {
                        fragments.push((fragment.index(), bound, frag_dev))
                    }
                    _ => return Err(Error::ShouldWait(composite.name().to_string())),
                }
            }
            (
                composite.name().to_string(),
                composite.props().to_vec(),
                composite.coresident_device_index(),
                composite.metadata().to_vec(),
                composite.fragments_count(),
                fragments,
            )
        };

        // The assembled device joins the process hosting the coresident
        // fragment's bound device.
        let mut chosen: Option<HostId> = None;
        for &(index, bound, _) in &fragments {
            if index == coresident {
                chosen = self.devices.get(bound).and_then(|d| d.host());
            }
        }

        let mut fragment_local_ids = vec![LocalId(0); count];
        for &(index, bound, frag_dev) in &fragments {
            // If the bound device is proxied, the proxy side is the one
            // we talk to.
            let residency = self
                .devices
                .get(bound)
                .and_then(|d| d.proxy())
                .unwrap_or(bound);
            let resident_host = self.devices.get(residency).and_then(|d| d.host());

            if chosen.is_some() && resident_host == chosen {
                // Already colocated; share the fragment device's id.
                match self.devices.get(frag_dev).and_then(|d| d.local_id()) {
                    Some(local_id) => fragment_local_ids[index] = local_id,
                    None => return Err(Error::ShouldWait(name)),
                }
                continue;
            }

            // A proxy is needed. Refuse outright if the proxies would end
            // up split across processes.
            if let Some(chosen_host) = chosen {
                let existing_proxy_host = self
                    .devices
                    .get(frag_dev)
                    .and_then(|d| d.proxy())
                    .and_then(|p| self.devices.get(p))
                    .and_then(|p| p.host());
                if let Some(proxy_host) = existing_proxy_host {
                    if proxy_host != chosen_host {
                        tracing::error!(composite = %name, fragment = index,
                            "Fragment proxies land in different driver hosts");
                        return Err(Error::CrossHostProxy(name));
                    }
                }
            }

            let proxy = self.prepare_proxy(frag_dev, chosen)?;
            let proxy_host = self.devices.get(proxy).and_then(|d| d.host());
            if chosen.is_none() {
                chosen = proxy_host;
            }
            match self.devices.get(proxy).and_then(|d| d.local_id()) {
                Some(local_id) => fragment_local_ids[index] = local_id,
                None => return Err(Error::Transport("proxy has no local id".into())),
            }
        }

        let host = match chosen {
            Some(host) => host,
            None => self.create_driver_host(&format!("driver_host:{}", name))?,
        };

        let device = self.devices.allocate_id();
        self.devices.insert(Device::new(
            device,
            name.clone(),
            DeviceKind::Composite,
            DeviceFlags::default(),
            props,
            None,
        ));
        {
            let local_id = {
                let host_entry = self.hosts.get_mut(host).ok_or(Error::HostNotFound(host))?;
                if host_entry.is_dying() {
                    return Err(Error::HostDying(host));
                }
                let local_id = host_entry.allocate_local_id();
                host_entry.add_device(device);
                local_id
            };
            self.local_ids.insert(host, local_id, device);
            if let Some(dev) = self.devices.get_mut(device) {
                dev.set_host(Some(host));
                dev.set_local_id(Some(local_id));
            }
            if let Err(e) =
                self.transport
                    .create_composite_device(host, device, local_id, &fragment_local_ids)
            {
                self.detach_device_from_host(device);
                self.devices.remove(device);
                return Err(e);
            }
        }

        if let Some(dev) = self.devices.get_mut(device) {
            dev.set_composite(cid);
        }
        if let Some(composite) = self.composites.get_mut(&cid) {
            composite.set_device(device);
        }

        // Copied, not moved: a re-assembly after disassembly adds the
        // metadata again.
        for md in metadata {
            self.add_metadata(device, md.type_id, md.data)?;
        }

        tracing::info!(composite = %name, device = %device, host = %host,
            "Composite assembled");
        self.publish_device(device);
        Ok(())
    }

    /// Forget an assembled composite's synthetic device and schedule its
    /// removal; a later `try_assemble_composite` recreates it.
    pub fn disassemble_composite(&mut self, cid: CompositeId) {
        let synthetic = self
            .composites
            .get_mut(&cid)
            .and_then(|composite| composite.take_device());
        let Some(synthetic) = synthetic else {
            return;
        };
        if let Some(dev) = self.devices.get_mut(synthetic) {
            dev.disassociate_from_composite();
        }
        let alive = self
            .devices
            .get(synthetic)
            .map(|d| d.state() != DeviceState::Dead)
            .unwrap_or(false);
        tracing::info!(composite = %cid, device = %synthetic, "Composite disassembled");
        if alive {
            self.schedule_remove(synthetic);
        }
    }

    /// Undo every fragment binding this device satisfies, disassembling
    /// assembled composites first.
    pub(crate) fn disassociate_fragments(&mut self, device: DeviceId) {
        let refs: Vec<FragmentRef> = self
            .devices
            .get(device)
            .map(|dev| dev.fragments().to_vec())
            .unwrap_or_default();
        for fragment_ref in refs {
            self.disassemble_composite(fragment_ref.composite);
            if let Some(composite) = self.composites.get_mut(&fragment_ref.composite) {
                composite.mark_fragment_unbound(fragment_ref.index);
            }
            if let Some(dev) = self.devices.get_mut(device) {
                dev.remove_fragment(fragment_ref);
                dev.set_bound(false);
            }
        }
    }

    /// If `device` is a fragment-driver instance, undo the fragment its
    /// parent satisfied.
    fn release_fragment_device_role(&mut self, device: DeviceId) {
        let parent = match self.devices.get(device) {
            Some(dev) => match (dev.driver_url(), dev.parent()) {
                (Some(url), Some(parent)) if url == self.config.fragment_driver_url => parent,
                _ => return,
            },
            None => return,
        };
        let refs: Vec<FragmentRef> = self
            .devices
            .get(parent)
            .map(|dev| dev.fragments().to_vec())
            .unwrap_or_default();
        for fragment_ref in refs {
            let is_ours = self
                .composites
                .get(&fragment_ref.composite)
                .and_then(|c| {
                    c.bound_fragments()
                        .iter()
                        .find(|f| f.index() == fragment_ref.index)
                })
                .map(|f| f.fragment_device() == Some(device))
                .unwrap_or(false);
            if !is_ours {
                continue;
            }
            self.disassemble_composite(fragment_ref.composite);
            if let Some(composite) = self.composites.get_mut(&fragment_ref.composite) {
                composite.mark_fragment_unbound(fragment_ref.index);
            }
            if let Some(parent_dev) = self.devices.get_mut(parent) {
                parent_dev.remove_fragment(fragment_ref);
                parent_dev.set_bound(false);
            }
            break;
        }
    }

    // ---- proxies --------------------------------------------------------

    /// Create (or reuse) a same-process stand-in for `device` inside
    /// `target_host`, spawning a fresh host when none is given.
    pub fn prepare_proxy(
        &mut self,
        device: DeviceId,
        target_host: Option<HostId>,
    ) -> Result<DeviceId> {
        let (kind, name, existing) = {
            let dev = self
                .devices
                .get(device)
                .ok_or(Error::DeviceNotFound(device))?;
            (dev.kind(), dev.name().to_string(), dev.proxy())
        };
        debug_assert!(kind != DeviceKind::Proxy, "cannot proxy a proxy");

        if let Some(proxy) = existing {
            let proxy_host = self.devices.get(proxy).and_then(|d| d.host());
            return match target_host {
                Some(target) if proxy_host != Some(target) => {
                    Err(Error::CrossHostProxy(name))
                }
                _ => Ok(proxy),
            };
        }

        let host = match target_host {
            Some(host) => host,
            None => self.create_driver_host(&format!("driver_host:{}", name))?,
        };

        let proxy = self.devices.allocate_id();
        self.devices.insert(Device::new(
            proxy,
            format!("{}-proxy", name),
            DeviceKind::Proxy,
            DeviceFlags {
                skip_autobind: true,
                ..Default::default()
            },
            Vec::new(),
            Some(device),
        ));
        if let Err(e) = self.attach_device_to_host(proxy, host) {
            self.devices.remove(proxy);
            return Err(e);
        }
        if let Err(e) = self.transport.connect_proxy(device, proxy) {
            self.detach_device_from_host(proxy);
            self.devices.remove(proxy);
            return Err(e);
        }
        if let Some(dev) = self.devices.get_mut(device) {
            dev.set_proxy(proxy);
        }
        tracing::info!(device = %name, proxy = %proxy, host = %host, "Proxy prepared");
        Ok(proxy)
    }

    // ---- removal --------------------------------------------------------

    /// Begin removal of a device: schedules the unbind/remove task pair
    /// without running the driver's unbind hook on the device itself
    /// (children still unbind normally).
    pub fn schedule_remove(&mut self, device: DeviceId) {
        tasks::unbind::create_unbind_remove_tasks(
            self,
            device,
            tasks::unbind::UnbindOpts {
                do_unbind: false,
                post: true,
            },
        );
    }

    /// Removal requested by the device's own driver host; `do_unbind`
    /// also runs the unbind hook of the device itself.
    pub fn schedule_host_requested_remove(&mut self, device: DeviceId, do_unbind: bool) {
        tasks::unbind::create_unbind_remove_tasks(
            self,
            device,
            tasks::unbind::UnbindOpts {
                do_unbind,
                post: true,
            },
        );
    }

    /// Unbind every child of `parent` (driver-host requested).
    pub fn schedule_unbind_children(&mut self, parent: DeviceId) {
        let children: Vec<DeviceId> = self
            .devices
            .get(parent)
            .map(|dev| dev.children().to_vec())
            .unwrap_or_default();
        for child in children {
            tasks::unbind::create_unbind_remove_tasks(
                self,
                child,
                tasks::unbind::UnbindOpts {
                    do_unbind: true,
                    post: true,
                },
            );
        }
    }

    /// Remove a device from the tree. `forced` indicates a channel close
    /// or process death: every other device sharing the driver host is
    /// removed as well and outstanding tasks complete locally.
    pub fn remove_device(&mut self, device: DeviceId, forced: bool) -> Result<()> {
        let (state, flags, name) = {
            let dev = self
                .devices
                .get(device)
                .ok_or(Error::DeviceNotFound(device))?;
            (dev.state(), dev.flags(), dev.name().to_string())
        };
        if state == DeviceState::Dead {
            return Err(Error::InvalidState {
                current: "Dead".into(),
                expected: "a live device".into(),
            });
        }
        if flags.immortal {
            return Err(Error::Immortal(device));
        }
        tracing::info!(device = %name, forced, "Removing device");

        if let Some(dev) = self.devices.get_mut(device) {
            dev.set_state(DeviceState::Dead);
        }

        // A removed device is as suspended as it will ever be.
        if let Some(task) = self.devices.get(device).and_then(|d| d.active_suspend()) {
            self.complete_task(task, Ok(()));
        }

        let host_id = self.devices.get(device).and_then(|d| d.host());
        let host_dying = host_id
            .and_then(|h| self.hosts.get(h))
            .map(|h| h.is_dying())
            .unwrap_or(false);

        if forced || host_dying {
            let (unbind, remove) = match self.devices.get(device) {
                Some(dev) => (dev.active_unbind(), dev.active_remove()),
                None => (None, None),
            };
            if let Some(task) = unbind {
                self.complete_task(task, Err(TaskError::Unavailable));
            }
            if let Some(task) = remove {
                self.complete_task(task, Err(TaskError::Unavailable));
            }
            // The proxy lives in another process; give it its own removal.
            if let Some(proxy) = self.devices.get(device).and_then(|d| d.proxy()) {
                self.schedule_remove(proxy);
            }
        }

        // Composite associations.
        if let Some(cid) = self.devices.get(device).and_then(|d| d.composite()) {
            if let Some(composite) = self.composites.get_mut(&cid) {
                if composite.device() == Some(device) {
                    composite.take_device();
                }
            }
            if let Some(dev) = self.devices.get_mut(device) {
                dev.disassociate_from_composite();
            }
        }
        self.disassociate_fragments(device);
        self.release_fragment_device_role(device);

        // Leave the driver host; a dying host takes everything resident
        // with it.
        if let Some(host_id) = host_id {
            self.detach_device_from_host(device);
            if forced {
                if let Some(host) = self.hosts.get_mut(host_id) {
                    host.set_dying();
                }
                let mut last: Option<DeviceId> = None;
                loop {
                    let next = self
                        .hosts
                        .get(host_id)
                        .and_then(|h| h.devices().first().copied());
                    let Some(other) = next else { break };
                    if last == Some(other) {
                        tracing::error!(device = %other,
                            "Failed to remove device from dying driver host");
                        break;
                    }
                    let _ = self.remove_device(other, false);
                    last = Some(other);
                }
            }
            self.release_host_if_empty(host_id);
        }

        // Detach from the parent and, for must-isolate parents that just
        // lost their last child, re-publish with backoff.
        let parent = self.devices.get(device).and_then(|d| d.parent());
        let is_proxy = self
            .devices
            .get(device)
            .map(|d| d.kind() == DeviceKind::Proxy)
            .unwrap_or(false);
        if let Some(parent_id) = parent {
            if let Some(dev) = self.devices.get_mut(device) {
                dev.detach_from_parent();
            }
            let mut rebind: Option<Duration> = None;
            if let Some(parent_dev) = self.devices.get_mut(parent_id) {
                if is_proxy {
                    if parent_dev.proxy() == Some(device) {
                        parent_dev.clear_proxy();
                    }
                } else {
                    parent_dev.remove_child(device);
                    if parent_dev.children().is_empty() {
                        parent_dev.set_bound(false);
                        if parent_dev.state() != DeviceState::Dead
                            && parent_dev.flags().must_isolate
                            && parent_dev.retries > 0
                        {
                            rebind = Some(parent_dev.backoff);
                            parent_dev.backoff *= 2;
                            parent_dev.retries -= 1;
                        }
                    }
                }
            }
            if let Some(delay) = rebind {
                tracing::info!(device = %parent_id, delay_ms = delay.as_millis() as u64,
                    "Bus device unbound, scheduling rebind");
                self.schedule_rebind(parent_id, delay);
            }
            // A dead parent may have been waiting on this child.
            let parent_dead = self
                .devices
                .get(parent_id)
                .map(|d| d.state() == DeviceState::Dead)
                .unwrap_or(false);
            if parent_dead {
                self.release_device(parent_id);
            }
        }
        self.release_device(device);
        Ok(())
    }

    /// Drop a device from the table once nothing keeps it alive: dead,
    /// fully detached, childless, unreferenced by fragments and with no
    /// task in flight.
    pub(crate) fn release_device(&mut self, device: DeviceId) {
        let releasable = self
            .devices
            .get(device)
            .map(|dev| {
                dev.state() == DeviceState::Dead
                    && dev.children().is_empty()
                    && dev.fragments().is_empty()
                    && dev.proxy().is_none()
                    && dev.host().is_none()
                    && dev.parent().is_none()
                    && !dev.has_active_tasks()
            })
            .unwrap_or(false);
        if releasable {
            self.devices.remove(device);
            tracing::debug!(device = %device, "Device released");
        }
    }

    fn release_host_if_empty(&mut self, host_id: HostId) {
        let empty = self
            .hosts
            .get(host_id)
            .map(|h| h.is_empty())
            .unwrap_or(false);
        if empty {
            if let Some(host) = self.hosts.remove(host_id) {
                tracing::info!(host = %host_id, name = %host.name(), "Releasing driver host");
                self.transport.release_driver_host(host.koid());
            }
        }
    }

    fn schedule_rebind(&mut self, device: DeviceId, delay: Duration) {
        let sender = self.events.sender();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    sender.send(Event::RetryBind { device });
                });
            }
            Err(_) => sender.send(Event::RetryBind { device }),
        }
    }

    // ---- power ----------------------------------------------------------

    /// Suspend the whole tree toward `target`. The callback fires on the
    /// dispatch thread when the suspend completes, fails or times out.
    pub fn suspend(
        &mut self,
        target: SystemPowerState,
        callback: Option<PowerCallback>,
    ) -> Result<()> {
        if self.suspend.is_some() {
            return Err(Error::AlreadyExists("system suspend".into()));
        }
        self.suspend_generation += 1;
        tracing::info!(target = %target, "System suspend requested");
        if let Some(timeout) = self.config.suspend_timeout {
            power::spawn_suspend_watchdog(self.events.sender(), timeout, self.suspend_generation);
        }
        self.suspend = Some(SuspendContext::new(
            target,
            self.suspend_generation,
            callback,
        ));
        let task = tasks::suspend::request_suspend_task(self, self.root_device);
        if let Some(ctx) = self.suspend.as_mut() {
            ctx.set_task(task);
        }
        Ok(())
    }

    /// Resume the tree toward `target` (usually fully-on), reporting the
    /// reached power state per device as replies arrive.
    pub fn resume(
        &mut self,
        target: SystemPowerState,
        callback: Option<PowerCallback>,
    ) -> Result<()> {
        if self.resume.is_some() {
            return Err(Error::AlreadyExists("system resume".into()));
        }
        let suspended = self.suspend.is_some()
            || self
                .devices
                .get(self.root_device)
                .map(|d| d.state() == DeviceState::Suspended)
                .unwrap_or(false);
        if !suspended {
            return Err(Error::InvalidState {
                current: "Running".into(),
                expected: "Suspended".into(),
            });
        }
        tracing::info!(target = %target, "System resume requested");
        self.resume = Some(ResumeContext::new(target, callback));
        let task = tasks::resume::request_resume_task(self, self.root_device);
        if let Some(ctx) = self.resume.as_mut() {
            ctx.set_task(task);
        }
        Ok(())
    }

    pub(crate) fn suspend_target(&self) -> SystemPowerState {
        self.suspend
            .as_ref()
            .map(|ctx| ctx.target())
            .unwrap_or(tasks::suspend::DEFAULT_TARGET)
    }

    pub(crate) fn resume_target(&self) -> SystemPowerState {
        self.resume
            .as_ref()
            .map(|ctx| ctx.target())
            .unwrap_or(SystemPowerState::FullyOn)
    }

    pub fn in_suspend(&self) -> bool {
        self.suspend.is_some()
    }

    fn finish_suspend(&mut self, status: TaskStatus) {
        let callback = self.suspend.as_mut().and_then(|ctx| ctx.take_callback());
        match &status {
            Ok(()) => tracing::info!("System suspend complete"),
            Err(e) => {
                tracing::error!(error = %e, "System suspend failed");
                self.suspend = None;
            }
        }
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn finish_resume(&mut self, status: TaskStatus) {
        let callback = self.resume.as_mut().and_then(|ctx| ctx.take_callback());
        match &status {
            Ok(()) => {
                tracing::info!("System resume complete");
                self.suspend = None;
            }
            Err(e) => tracing::error!(error = %e, "System resume failed"),
        }
        self.resume = None;
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn handle_suspend_timeout(&mut self, generation: u64) {
        let task = match self.suspend.as_ref() {
            Some(ctx) if ctx.generation() == generation => ctx.task(),
            _ => return,
        };
        let Some(task) = task else { return };
        if self.tasks.is_completed(task) {
            return;
        }
        tracing::error!("Device suspend timed out");
        self.dump_suspend_dependencies(task, 0);

        let fire = self
            .suspend
            .as_mut()
            .map(|ctx| ctx.claim_fallback())
            .unwrap_or(false);
        let action = self.config.suspend_fallback;
        if fire && action != FallbackAction::None {
            tracing::warn!(action = ?action, "Triggering suspend fallback power action");
            if let Err(e) = self.transport.system_powerctl(action) {
                tracing::error!(error = %e, "Fallback power action failed");
            }
        }
        self.complete_task(task, Err(TaskError::Timeout));
    }

    /// Log the dependency chain of a stuck suspend task.
    fn dump_suspend_dependencies(&self, task: TaskId, depth: usize) {
        let Some(entry) = self.tasks.get(task) else {
            return;
        };
        let device_name = self
            .devices
            .get(entry.device())
            .map(|d| d.name().to_string())
            .unwrap_or_else(|| entry.device().to_string());
        let status = match entry.status() {
            Some(Ok(())) => "ok".to_string(),
            Some(Err(e)) => e.to_string(),
            None => {
                if entry.dependencies().any(|d| !self.tasks.is_completed(d)) {
                    "<dependence>".to_string()
                } else {
                    "stuck <suspending>".to_string()
                }
            }
        };
        tracing::info!(depth, device = %device_name, status = %status, "Suspend task");
        for dep in entry.dependencies() {
            self.dump_suspend_dependencies(dep, depth + 1);
        }
    }

    // ---- dispatch -------------------------------------------------------

    /// Fold one asynchronous completion into coordinator state.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::InitDone { device, status } => {
                match self.devices.get(device).and_then(|d| d.active_init()) {
                    Some(task) => self.complete_task(task, status),
                    None => {
                        tracing::warn!(device = %device, "Init reply with no active init task")
                    }
                }
            }
            Event::UnbindDone { device, status } => {
                match self.devices.get(device).and_then(|d| d.active_unbind()) {
                    Some(task) => self.complete_task(task, status),
                    None => {
                        tracing::warn!(device = %device, "Unbind reply with no active unbind task")
                    }
                }
            }
            Event::RemoveDone { device, status } => {
                match self.devices.get(device).and_then(|d| d.active_remove()) {
                    Some(task) => self.complete_task(task, status),
                    None => {
                        tracing::warn!(device = %device, "Remove reply with no active remove task")
                    }
                }
            }
            Event::SuspendDone { device, status } => {
                tasks::suspend::handle_reply(self, device, status);
            }
            Event::ResumeDone {
                device,
                status,
                power_state,
            } => {
                tasks::resume::handle_reply(self, device, status, power_state);
            }
            Event::HostDied { host } => self.handle_host_died(host),
            Event::SuspendTimeout { generation } => self.handle_suspend_timeout(generation),
            Event::RetryBind { device } => {
                let bindable = self
                    .devices
                    .get(device)
                    .map(|d| d.is_bindable())
                    .unwrap_or(false);
                if bindable {
                    self.publish_device(device);
                }
            }
        }
    }

    fn handle_host_died(&mut self, host: HostId) {
        tracing::error!(host = %host, "Driver host died");
        if let Some(entry) = self.hosts.get_mut(host) {
            entry.set_dying();
        }
        let mut last: Option<DeviceId> = None;
        loop {
            let next = self
                .hosts
                .get(host)
                .and_then(|h| h.devices().first().copied());
            let Some(device) = next else { break };
            if last == Some(device) {
                tracing::error!(device = %device, "Failed to remove device from dead host");
                break;
            }
            let _ = self.remove_device(device, true);
            last = Some(device);
        }
        self.release_host_if_empty(host);
    }

    /// Run tasks and drain events until neither makes progress.
    pub fn run_until_idle(&mut self) {
        loop {
            let mut progressed = false;
            while let Some(event) = self.events.try_next() {
                self.handle_event(event);
                progressed = true;
            }
            while let Some(task) = self.tasks.pop_ready() {
                self.run_task(task);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    fn run_task(&mut self, task: TaskId) {
        let kind = match self.tasks.get(task) {
            Some(entry) => entry.kind(),
            None => return,
        };
        match kind {
            TaskKind::Init => tasks::init::run(self, task),
            TaskKind::Unbind => tasks::unbind::run_unbind(self, task),
            TaskKind::Remove => tasks::unbind::run_remove(self, task),
            TaskKind::Suspend => tasks::suspend::run(self, task),
            TaskKind::Resume => tasks::resume::run(self, task),
        }
    }

    /// Finalize a task: record status, release dependents, clear the
    /// device's active-task slot and run the completion callback.
    pub(crate) fn complete_task(&mut self, task: TaskId, status: TaskStatus) {
        let info = self.tasks.get(task).map(|e| (e.kind(), e.device()));
        let Some(callback) = self.tasks.complete(task, status.clone()) else {
            return;
        };
        if let Some((kind, device)) = info {
            if let Some(dev) = self.devices.get_mut(device) {
                let clear = |slot: Option<TaskId>| slot == Some(task);
                match kind {
                    TaskKind::Init if clear(dev.active_init()) => dev.set_active_init(None),
                    TaskKind::Unbind if clear(dev.active_unbind()) => dev.set_active_unbind(None),
                    TaskKind::Remove if clear(dev.active_remove()) => dev.set_active_remove(None),
                    TaskKind::Suspend if clear(dev.active_suspend()) => {
                        dev.set_active_suspend(None)
                    }
                    TaskKind::Resume if clear(dev.active_resume()) => dev.set_active_resume(None),
                    _ => {}
                }
            }
        }
        if let Some(callback) = callback {
            callback(self, status.clone());
        }
        if self.suspend.as_ref().and_then(|ctx| ctx.task()) == Some(task) {
            self.finish_suspend(status.clone());
        }
        if self.resume.as_ref().and_then(|ctx| ctx.task()) == Some(task) {
            self.finish_resume(status);
        }
        self.tasks.reap(task);
    }

    // ---- introspection --------------------------------------------------

    /// Produce a serializable snapshot of the tree, composites and hosts.
    pub fn dump_state(&self) -> CoordinatorSnapshot {
        let mut devices = Vec::new();
        for id in self.devices.ids() {
            if let Some(dev) = self.devices.get(id) {
                devices.push(DeviceInfo {
                    id,
                    name: dev.name().to_string(),
                    state: dev.state().to_string(),
                    host: dev.host(),
                    local_id: dev.local_id(),
                    props: dev.props().to_vec(),
                    visible: dev.is_visible(),
                    bound: dev.is_bound(),
                });
            }
        }

        let mut composite_ids: Vec<_> = self.composites.keys().copied().collect();
        composite_ids.sort();
        let mut composites = Vec::new();
        for cid in composite_ids {
            if let Some(composite) = self.composites.get(&cid) {
                let mut fragments: Vec<FragmentInfo> = composite
                    .bound_fragments()
                    .iter()
                    .chain(composite.unbound_fragments())
                    .map(|f| FragmentInfo {
                        index: f.index(),
                        bound_device: f.bound_device(),
                        fragment_device: f.fragment_device(),
                    })
                    .collect();
                fragments.sort_by_key(|f| f.index);
                composites.push(CompositeInfo {
                    id: cid,
                    name: composite.name().to_string(),
                    assembled: composite.device(),
                    fragments,
                });
            }
        }

        let mut hosts = Vec::new();
        let mut host_ids: Vec<HostId> = Vec::new();
        for id in self.devices.ids() {
            if let Some(host) = self.devices.get(id).and_then(|d| d.host()) {
                if !host_ids.contains(&host) {
                    host_ids.push(host);
                }
            }
        }
        host_ids.sort();
        for id in host_ids {
            if let Some(host) = self.hosts.get(id) {
                hosts.push(HostInfo {
                    id,
                    name: host.name().to_string(),
                    koid: host.koid().to_string(),
                    devices: host.devices().to_vec(),
                });
            }
        }

        CoordinatorSnapshot {
            devices,
            composites,
            hosts,
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        // Global lookup state is torn down with its owner.
        self.local_ids.clear();
    }
}
