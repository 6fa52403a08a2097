//! Resume task: powers a subtree back up, parent before children by
//! default (the mirror of the configured suspend ordering)

use crate::config::PowerOrdering;
use crate::coordinator::Coordinator;
use crate::device::DeviceState;
use crate::error::TaskStatus;
use crate::ids::{DeviceId, TaskId};
use crate::task::TaskKind;

fn resume_ordering(coordinator: &Coordinator) -> PowerOrdering {
    match coordinator.config().suspend_ordering {
        PowerOrdering::ChildrenFirst => PowerOrdering::ParentFirst,
        PowerOrdering::ParentFirst => PowerOrdering::ChildrenFirst,
    }
}

/// Return the in-flight resume task for a device, creating one if needed.
pub(crate) fn request_resume_task(coordinator: &mut Coordinator, device: DeviceId) -> TaskId {
    if let Some(task) = coordinator
        .devices
        .get(device)
        .and_then(|dev| dev.active_resume())
    {
        return task;
    }
    let task = coordinator.tasks.create(
        TaskKind::Resume,
        device,
        Some(Box::new(move |coordinator, status| {
            resume_done(coordinator, device, status);
        })),
    );
    if let Some(dev) = coordinator.devices.get_mut(device) {
        dev.set_active_resume(Some(task));
    }
    coordinator.tasks.post(task);
    task
}

pub(crate) fn run(coordinator: &mut Coordinator, task: TaskId) {
    let device = match coordinator.tasks.get(task) {
        Some(entry) => entry.device(),
        None => return,
    };
    // A failed relative's resume fails this one as well.
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
    match state {
        DeviceState::Dead | DeviceState::Active => {
            coordinator.complete_task(task, Ok(()));
            return;
        }
        // Own resume finished; we were waiting on the children.
        DeviceState::Resumed => {
            finish_if_children_resumed(coordinator, device, task);
            return;
        }
        DeviceState::Resuming => return,
        _ => {}
    }

    match resume_ordering(coordinator) {
        PowerOrdering::ParentFirst => send_resume(coordinator, device, task),
        PowerOrdering::ChildrenFirst => {
            if add_child_dependencies(coordinator, device, task) {
                return;
            }
            send_resume(coordinator, device, task);
        }
    }
}

fn send_resume(coordinator: &mut Coordinator, device: DeviceId, task: TaskId) {
    let target = coordinator.resume_target();
    let (host, local_id) = match coordinator.devices.get(device) {
        Some(dev) => (dev.host(), dev.local_id()),
        None => (None, None),
    };
    match (host, local_id) {
        (Some(host), Some(local_id)) => {
            if let Some(dev) = coordinator.devices.get_mut(device) {
                dev.set_state(DeviceState::Resuming);
            }
            match coordinator.transport().send_resume(host, local_id, target) {
                Ok(()) => coordinator.tasks.mark_sent(task),
                Err(e) => {
                    let status = Err(e.into_task_error());
                    coordinator.complete_task(task, status);
                }
            }
        }
        // No driver host; trivially resumed.
        _ => handle_reply(coordinator, device, Ok(()), 0),
    }
}

/// A resume reply for `device` arrived, reporting the power state the
/// device actually reached.
pub(crate) fn handle_reply(
    coordinator: &mut Coordinator,
    device: DeviceId,
    status: TaskStatus,
    power_state: u32,
) {
    let Some(task) = coordinator
        .devices
        .get(device)
        .and_then(|dev| dev.active_resume())
    else {
        tracing::warn!(device = %device, "Resume reply with no active resume task");
        return;
    };
    if let Some(dev) = coordinator.devices.get_mut(device) {
        dev.set_power_state(power_state);
    }
    if status.is_err() {
        coordinator.complete_task(task, status);
        return;
    }

    match resume_ordering(coordinator) {
        PowerOrdering::ChildrenFirst => {
            // Children were resumed before our RPC went out.
            if let Some(dev) = coordinator.devices.get_mut(device) {
                if dev.state() != DeviceState::Dead {
                    dev.set_state(DeviceState::Active);
                }
            }
            coordinator.complete_task(task, Ok(()));
        }
        PowerOrdering::ParentFirst => {
            if let Some(dev) = coordinator.devices.get_mut(device) {
                if dev.state() != DeviceState::Dead {
                    dev.set_state(DeviceState::Resumed);
                }
            }
            coordinator.tasks.unmark_sent(task);
            if !add_child_dependencies(coordinator, device, task) {
                finish_if_children_resumed(coordinator, device, task);
            }
        }
    }
}

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
        if !matches!(
            child_state,
            DeviceState::Suspended | DeviceState::Suspending
        ) {
            continue;
        }
        let child_task = request_resume_task(coordinator, child);
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

/// Resume is complete for this node once every child has resumed; only
/// then is the device marked active again.
fn finish_if_children_resumed(coordinator: &mut Coordinator, device: DeviceId, task: TaskId) {
    if let Some(failure) = coordinator.tasks.dep_failure(task) {
        coordinator.complete_task(task, Err(failure));
        return;
    }
    if add_child_dependencies(coordinator, device, task) {
        return;
    }
    if let Some(dev) = coordinator.devices.get_mut(device) {
        if dev.state() != DeviceState::Dead {
            dev.set_state(DeviceState::Active);
        }
    }
    coordinator.complete_task(task, Ok(()));
}

fn resume_done(coordinator: &mut Coordinator, device: DeviceId, status: TaskStatus) {
    if let Err(e) = status {
        let name = coordinator
            .devices
            .get(device)
            .map(|d| d.name().to_string())
            .unwrap_or_else(|| device.to_string());
        tracing::error!(device = %name, error = %e, "Resume failed; device left suspended");
    }
}
