//! Device Coordinator
//!
//! The orchestration core of a device-driver framework: a live tree of
//! device nodes, each resident in an isolated driver-host process, driven
//! through an asynchronous lifecycle (init, bind, suspend, resume, unbind,
//! remove) with strict parent/child and fragment/composite ordering. Also
//! home to the composite-device assembler, which matches fragment devices
//! against multi-part specifications and materializes the composite in a
//! chosen driver host once every fragment is ready.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use devcoord::{AddDeviceArgs, Coordinator, CoordinatorConfig};
//! use devcoord::testing::FakeTransport;
//!
//! let transport = Arc::new(FakeTransport::new());
//! let mut coordinator = Coordinator::new(CoordinatorConfig::new(), transport)?;
//!
//! let root = coordinator.root_device();
//! let bus = coordinator.add_device(root, AddDeviceArgs::new("pci"))?;
//! coordinator.run_until_idle();
//!
//! coordinator.schedule_remove(bus);
//! coordinator.run_until_idle();
//! # Ok::<(), devcoord::Error>(())
//! ```

pub mod bind;
pub mod composite;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod host;
pub mod ids;
pub mod power;
mod task;
mod tasks;
pub mod testing;
pub mod transport;

pub use bind::{DeviceProperty, FragmentPart, MatchInst};
pub use composite::{
    CompositeDescriptor, CompositeDevice, CompositeDeviceFragment, FragmentDescriptor,
};
pub use config::{CoordinatorConfig, PowerOrdering};
pub use coordinator::{
    AddDeviceArgs, CompositeInfo, Coordinator, CoordinatorSnapshot, DeviceInfo, FragmentInfo,
    HostInfo,
};
pub use device::{Device, DeviceFlags, DeviceKind, DeviceState, Metadata};
pub use error::{Error, Result, TaskError, TaskStatus};
pub use host::{DriverHost, LocalIdMap};
pub use ids::{CompositeId, DeviceId, HostId, LocalId, TaskId};
pub use power::PowerCallback;
pub use transport::{
    Event, EventQueue, EventSender, FallbackAction, HostHandle, SystemPowerState, Transport,
};
