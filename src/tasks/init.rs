//! Init task: runs the driver's init hook after the parent has finished
//! initializing

use crate::coordinator::Coordinator;
use crate::device::{DeviceKind, DeviceState};
use crate::ids::{DeviceId, TaskId};
use crate::task::TaskKind;

/// Create and post the init task for a freshly added device.
///
/// Composite and proxy devices have no init hook; asking for an init task
/// on one is a caller bug.
pub(crate) fn create_init_task(coordinator: &mut Coordinator, device: DeviceId) -> TaskId {
    if let Some(dev) = coordinator.devices.get(device) {
        debug_assert!(
            dev.kind() == DeviceKind::Normal,
            "composite and proxy devices never run init"
        );
        debug_assert!(dev.active_init().is_none());
    }

    let task = coordinator.tasks.create(
        TaskKind::Init,
        device,
        Some(Box::new(move |coordinator, status| {
            init_done(coordinator, device, status.is_ok());
        })),
    );
    if let Some(dev) = coordinator.devices.get_mut(device) {
        dev.set_active_init(Some(task));
    }
    coordinator.tasks.post(task);
    task
}

pub(crate) fn run(coordinator: &mut Coordinator, task: TaskId) {
    let device = match coordinator.tasks.get(task) {
        Some(entry) => entry.device(),
        None => return,
    };
    // The parent failed to initialize; this device cannot either.
    if let Some(failure) = coordinator.tasks.dep_failure(task) {
        coordinator.complete_task(task, Err(failure));
        return;
    }
    let (parent, host, local_id, state) = match coordinator.devices.get(device) {
        Some(dev) => (dev.parent(), dev.host(), dev.local_id(), dev.state()),
        None => {
            coordinator.complete_task(task, Ok(()));
            return;
        }
    };
    if state == DeviceState::Dead {
        coordinator.complete_task(task, Ok(()));
        return;
    }

    // A device never initializes before its parent has.
    if let Some(parent_id) = parent {
        if let Some(parent_dev) = coordinator.devices.get(parent_id) {
            if parent_dev.state() == DeviceState::Initializing {
                if let Some(parent_init) = parent_dev.active_init() {
                    coordinator.tasks.add_dependency(task, parent_init);
                    coordinator.tasks.enqueue_if_ready(task);
                    return;
                }
            }
        }
    }

    match (host, local_id) {
        (Some(host), Some(local_id)) => {
            match coordinator.transport().send_init(host, local_id) {
                Ok(()) => coordinator.tasks.mark_sent(task),
                Err(e) => {
                    let status = Err(e.into_task_error());
                    coordinator.complete_task(task, status);
                }
            }
        }
        // No driver host to run an init hook; done locally.
        _ => coordinator.complete_task(task, Ok(())),
    }
}

/// Completion: reveal the device on success, schedule removal on failure.
/// Either way dependents were already released, so sibling initialization
/// never stalls on this device.
fn init_done(coordinator: &mut Coordinator, device: DeviceId, ok: bool) {
    let Some(dev) = coordinator.devices.get_mut(device) else {
        return;
    };
    if ok {
        if dev.state() == DeviceState::Initializing {
            dev.set_state(DeviceState::Active);
        }
        tracing::info!(device = %dev.name(), "Device initialized");
        if !dev.flags().invisible {
            dev.set_visible();
            coordinator.publish_device(device);
        }
    } else {
        tracing::error!(device = %dev.name(), "Init failed, scheduling removal");
        coordinator.schedule_remove(device);
    }
}
