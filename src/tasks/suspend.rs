//! Suspend task: powers down a subtree, descendants first by default

use crate::config::PowerOrdering;
use crate::coordinator::Coordinator;
use crate::device::DeviceState;
use crate::error::TaskStatus;
use crate::ids::{DeviceId, TaskId};
use crate::task::TaskKind;
use crate::transport::SystemPowerState;

/// Return the in-flight suspend task for a device, creating one if
/// needed. Callers await the existing task rather than stacking a second.
pub(crate) fn request_suspend_task(coordinator: &mut Coordinator, device: DeviceId) -> TaskId {
    if let Some(task) = coordinator
        .devices
        .get(device)
        .and_then(|dev| dev.active_suspend())
    {
        return task;
    }
    let task = coordinator.tasks.create(
        TaskKind::Suspend,
        device,
        Some(Box::new(move |coordinator, status| {
            suspend_done(coordinator, device, status);
        })),
    );
    if let Some(dev) = coordinator.devices.get_mut(device) {
        dev.set_active_suspend(Some(task));
    }
    coordinator.tasks.post(task);
    task
}

pub(crate) fn run(coordinator: &mut Coordinator, task: TaskId) {
    let device = match coordinator.tasks.get(task) {
        Some(entry) => entry.device(),
        None => return,
    };
    // A failed descendant suspend fails the whole subtree's suspend.
    if let Some(failure) = coordinator.tasks.dep_failure(task) {
        coordinator.complete_task(task, Err(failure));
        return;
    }
    let state = match coordinator.devices.get(device) {
        Some(dev) => dev.state(),
        None => {
            coordinator.complete_task(task, Ok(()));
            return;
        }
    };
    // Dead devices and already-suspended subtrees are trivially done.
    if matches!(state, DeviceState::Dead | DeviceState::Suspended) {
        coordinator.complete_task(task, Ok(()));
        return;
    }

    // An in-flight init settles before the device suspends.
    if state == DeviceState::Initializing {
        if let Some(init) = coordinator
            .devices
            .get(device)
            .and_then(|dev| dev.active_init())
        {
            coordinator.tasks.add_dependency(task, init);
            coordinator.tasks.enqueue_if_ready(task);
            return;
        }
    }

    let ordering = coordinator.config().suspend_ordering;
    match ordering {
        PowerOrdering::ChildrenFirst => {
            if add_child_dependencies(coordinator, device, task) {
                return;
            }
            send_suspend(coordinator, device, task);
        }
        PowerOrdering::ParentFirst => {
            if state == DeviceState::Suspending {
                // Own RPC is still in flight; the reply drives progress.
                return;
            }
            send_suspend(coordinator, device, task);
        }
    }
}

/// Issue the suspend RPC, or complete locally for devices with no
/// reachable driver host (not yet initialized counts as suspended).
fn send_suspend(coordinator: &mut Coordinator, device: DeviceId, task: TaskId) {
    let target = coordinator.suspend_target();
    let (host, local_id) = match coordinator.devices.get(device) {
        Some(dev) => (dev.host(), dev.local_id()),
        None => (None, None),
    };
    match (host, local_id) {
        (Some(host), Some(local_id)) => {
            if let Some(dev) = coordinator.devices.get_mut(device) {
                dev.set_state(DeviceState::Suspending);
            }
            match coordinator.transport().send_suspend(host, local_id, target) {
                Ok(()) => coordinator.tasks.mark_sent(task),
                Err(e) => {
                    let status = Err(e.into_task_error());
                    coordinator.complete_task(task, status);
                }
            }
        }
        _ => {
            handle_reply(coordinator, device, Ok(()));
        }
    }
}

/// A suspend reply (or trivial local completion) for `device` arrived.
pub(crate) fn handle_reply(coordinator: &mut Coordinator, device: DeviceId, status: TaskStatus) {
    let Some(task) = coordinator
        .devices
        .get(device)
        .and_then(|dev| dev.active_suspend())
    else {
        tracing::warn!(device = %device, "Suspend reply with no active suspend task");
        return;
    };
    if status.is_err() {
        coordinator.complete_task(task, status);
        return;
    }
    mark_suspended(coordinator, device);
    let ordering = coordinator.config().suspend_ordering;
    match ordering {
        PowerOrdering::ChildrenFirst => {
            // Children already completed before our RPC went out.
            coordinator.complete_task(task, Ok(()));
        }
        PowerOrdering::ParentFirst => {
            // Parent is down; now take the children with it.
            if add_child_dependencies(coordinator, device, task) {
                coordinator.tasks.unmark_sent(task);
            } else {
                coordinator.complete_task(task, Ok(()));
            }
        }
    }
}

/// Wire this task to wait on a suspend task for every live child (and
/// proxy). Returns true if any dependency is outstanding.
fn add_child_dependencies(
    coordinator: &mut Coordinator,
    device: DeviceId,
    task: TaskId,
) -> bool {
    let (children, proxy) = match coordinator.devices.get(device) {
        Some(dev) => (dev.children().to_vec(), dev.proxy()),
        None => return false,
    };
    let mut pending = false;
    for child in children.into_iter().chain(proxy) {
        let child_state = match coordinator.devices.get(child) {
            Some(dev) => dev.state(),
            None => continue,
        };
        if matches!(child_state, DeviceState::Dead | DeviceState::Suspended) {
            continue;
        }
        let child_task = request_suspend_task(coordinator, child);
        if !coordinator.tasks.is_completed(child_task) {
            coordinator.tasks.add_dependency(task, child_task);
            pending = true;
        }
    }
    if pending {
        coordinator.tasks.enqueue_if_ready(task);
    }
    pending
}

fn mark_suspended(coordinator: &mut Coordinator, device: DeviceId) {
    if let Some(dev) = coordinator.devices.get_mut(device) {
        if matches!(
            dev.state(),
            DeviceState::Active
                | DeviceState::Suspending
                | DeviceState::Resuming
                | DeviceState::Resumed
                | DeviceState::Initializing
        ) {
            dev.set_state(DeviceState::Suspended);
        }
    }
}

fn suspend_done(coordinator: &mut Coordinator, device: DeviceId, status: TaskStatus) {
    match status {
        Ok(()) => mark_suspended(coordinator, device),
        Err(e) => {
            tracing::error!(device = %device, error = %e, "Suspend failed");
        }
    }
}

/// What the suspend RPC should ask for when no system suspend is active
/// (single-branch suspends).
pub(crate) const DEFAULT_TARGET: SystemPowerState = SystemPowerState::SuspendToRam;
