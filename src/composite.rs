//! Composite devices and their fragments
//!
//! A composite device is assembled out of N independently-discovered
//! fragment devices. This module owns the matching bookkeeping: which
//! fragments are bound, which devices satisfied them, and whether the
//! composite is ready to assemble. Host selection and proxy creation live
//! in the coordinator, which drives the assembly.

use crate::bind::{DeviceProperty, FragmentPart};
use crate::device::Metadata;
use crate::error::{Error, Result};
use crate::ids::{CompositeId, DeviceId};

/// Descriptor for one fragment slot of a composite.
#[derive(Debug, Clone)]
pub struct FragmentDescriptor {
    pub parts: Vec<FragmentPart>,
}

/// Descriptor for a whole composite device, as received from the
/// coordination protocol.
#[derive(Debug, Clone)]
pub struct CompositeDescriptor {
    pub props: Vec<DeviceProperty>,
    pub fragments: Vec<FragmentDescriptor>,
    /// Index of the fragment whose driver host should host the assembled
    /// device.
    pub coresident_device_index: usize,
    pub metadata: Vec<Metadata>,
}

/// One named slot of a composite device specification.
#[derive(Debug)]
pub struct CompositeDeviceFragment {
    composite: CompositeId,
    index: usize,
    parts: Vec<FragmentPart>,
    bound_device: Option<DeviceId>,
    fragment_device: Option<DeviceId>,
}

impl CompositeDeviceFragment {
    fn new(composite: CompositeId, index: usize, parts: Vec<FragmentPart>) -> Self {
        Self {
            composite,
            index,
            parts,
            bound_device: None,
            fragment_device: None,
        }
    }

    pub fn composite(&self) -> CompositeId {
        self.composite
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The device matched against this fragment, if bound.
    pub fn bound_device(&self) -> Option<DeviceId> {
        self.bound_device
    }

    /// The device published by the fragment driver running on
    /// `bound_device`, once it appears.
    pub fn fragment_device(&self) -> Option<DeviceId> {
        self.fragment_device
    }

    pub(crate) fn set_fragment_device(&mut self, device: Option<DeviceId>) {
        self.fragment_device = device;
    }

    /// A fragment is ready once both device references are in place.
    pub fn is_ready(&self) -> bool {
        self.bound_device.is_some() && self.fragment_device.is_some()
    }

    /// Evaluate this fragment's match program against a candidate.
    /// Pure: probing never mutates the fragment.
    pub fn try_match(&self, ancestry: &[&[DeviceProperty]]) -> bool {
        crate::bind::match_parts(&self.parts, ancestry)
    }
}

/// An aggregate of N fragments that assembles into one synthetic device.
#[derive(Debug)]
pub struct CompositeDevice {
    id: CompositeId,
    name: String,
    props: Vec<DeviceProperty>,
    fragments_count: usize,
    coresident_device_index: usize,
    metadata: Vec<Metadata>,
    unbound: Vec<CompositeDeviceFragment>,
    bound: Vec<CompositeDeviceFragment>,
    /// The assembled device, once `TryAssemble` succeeds.
    device: Option<DeviceId>,
}

impl CompositeDevice {
    /// Parse a descriptor into a composite with every fragment unbound.
    pub fn create(
        id: CompositeId,
        name: impl Into<String>,
        descriptor: CompositeDescriptor,
    ) -> Result<Self> {
        let name = name.into();
        if descriptor.fragments.is_empty() {
            return Err(Error::InvalidDescriptor(format!(
                "composite '{}' has no fragments",
                name
            )));
        }
        for (index, fragment) in descriptor.fragments.iter().enumerate() {
            if fragment.parts.is_empty()
                || fragment.parts.iter().any(|p| p.match_program.is_empty())
            {
                return Err(Error::InvalidDescriptor(format!(
                    "composite '{}' fragment {} has an empty match program",
                    name, index
                )));
            }
        }
        if descriptor.coresident_device_index >= descriptor.fragments.len() {
            return Err(Error::InvalidDescriptor(format!(
                "composite '{}' coresident index {} out of range",
                name, descriptor.coresident_device_index
            )));
        }

        let fragments_count = descriptor.fragments.len();
        let unbound = descriptor
            .fragments
            .into_iter()
            .enumerate()
            .map(|(index, f)| CompositeDeviceFragment::new(id, index, f.parts))
            .collect();

        Ok(Self {
            id,
            name,
            props: descriptor.props,
            fragments_count,
            coresident_device_index: descriptor.coresident_device_index,
            metadata: descriptor.metadata,
            unbound,
            bound: Vec::new(),
            device: None,
        })
    }

    pub fn id(&self) -> CompositeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn props(&self) -> &[DeviceProperty] {
        &self.props
    }

    pub fn fragments_count(&self) -> usize {
        self.fragments_count
    }

    pub fn coresident_device_index(&self) -> usize {
        self.coresident_device_index
    }

    pub fn metadata(&self) -> &[Metadata] {
        &self.metadata
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    pub(crate) fn set_device(&mut self, device: DeviceId) {
        debug_assert!(self.device.is_none());
        self.device = Some(device);
    }

    pub fn bound_fragments(&self) -> &[CompositeDeviceFragment] {
        &self.bound
    }

    pub fn unbound_fragments(&self) -> &[CompositeDeviceFragment] {
        &self.unbound
    }

    pub(crate) fn bound_fragment_mut(
        &mut self,
        index: usize,
    ) -> Option<&mut CompositeDeviceFragment> {
        self.bound.iter_mut().find(|f| f.index == index)
    }

    /// Probe this composite's fragments for a match against `candidate`.
    ///
    /// The bound collection is scanned first: a hit there means one
    /// physical device satisfies two fragment roles, which is rejected as
    /// ambiguous rather than silently resolved. Otherwise the first
    /// matching unbound fragment (insertion order) wins.
    pub fn try_match_fragments(
        &self,
        candidate: DeviceId,
        ancestry: &[&[DeviceProperty]],
    ) -> Result<Option<usize>> {
        for fragment in &self.bound {
            if fragment.try_match(ancestry) {
                return Err(Error::AmbiguousMatch {
                    composite: self.name.clone(),
                    index: fragment.index,
                    bound: fragment.bound_device.unwrap_or(candidate),
                    candidate,
                });
            }
        }
        for fragment in &self.unbound {
            if fragment.try_match(ancestry) {
                tracing::debug!(composite = %self.name, fragment = fragment.index,
                    device = %candidate, "Fragment match");
                return Ok(Some(fragment.index));
            }
        }
        Ok(None)
    }

    /// Record a successful fragment bind: moves the fragment from the
    /// unbound to the bound collection.
    ///
    /// Binding an index that is not in the unbound collection is a
    /// scheduler contract violation, not a recoverable error.
    pub(crate) fn mark_fragment_bound(&mut self, index: usize, device: DeviceId) {
        let pos = self
            .unbound
            .iter()
            .position(|f| f.index == index)
            .unwrap_or_else(|| {
                panic!(
                    "composite '{}': attempted to bind fragment {} that is not unbound",
                    self.name, index
                )
            });
        let mut fragment = self.unbound.remove(pos);
        fragment.bound_device = Some(device);
        self.bound.push(fragment);
    }

    /// Move a fragment back to the unbound collection, clearing both of
    /// its device references. The caller must already have disassembled
    /// the composite. Returns the previously bound device.
    pub(crate) fn mark_fragment_unbound(&mut self, index: usize) -> Option<DeviceId> {
        debug_assert!(self.device.is_none());
        let pos = self.bound.iter().position(|f| f.index == index)?;
        let mut fragment = self.bound.remove(pos);
        let bound_device = fragment.bound_device.take();
        fragment.fragment_device = None;
        self.unbound.push(fragment);
        bound_device
    }

    /// True once every fragment is bound and every fragment driver has
    /// published its device.
    pub fn is_ready_to_assemble(&self) -> bool {
        self.unbound.is_empty() && self.bound.iter().all(|f| f.is_ready())
    }

    /// Forget the assembled device so a later assembly can re-run.
    /// Returns the device that represented the composite.
    pub(crate) fn take_device(&mut self) -> Option<DeviceId> {
        self.device.take()
    }
}
