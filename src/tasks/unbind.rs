//! Unbind and remove tasks
//!
//! Removal of a device is a pair of tasks: the unbind task runs the
//! driver's unbind hook, the remove task reclaims the device afterward.
//! A device's unbind completes only after every child's unbind has
//! completed, so a whole descendant chain stops deepest-first before the
//! node itself unbinds; remove tasks are ordered the same way.

use crate::coordinator::Coordinator;
use crate::device::DeviceState;
use crate::error::TaskError;
use crate::ids::{DeviceId, TaskId};
use crate::task::TaskKind;

#[derive(Debug, Clone, Copy)]
pub(crate) struct UnbindOpts {
    /// Issue the unbind RPC to the driver. False when the driver already
    /// asked for removal and its hook must not run again.
    pub do_unbind: bool,
    /// Enter the ready queue immediately.
    pub post: bool,
}

/// Create the unbind/remove task pair for a device if not already present.
pub(crate) fn create_unbind_remove_tasks(
    coordinator: &mut Coordinator,
    device: DeviceId,
    opts: UnbindOpts,
) {
    let (state, active_unbind, active_remove) = match coordinator.devices.get(device) {
        Some(dev) => (dev.state(), dev.active_unbind(), dev.active_remove()),
        None => return,
    };
    if state == DeviceState::Dead {
        return;
    }
    // Reuse in-flight tasks; callers must not create a second pair.
    if active_remove.is_some() {
        if opts.post {
            if let Some(unbind) = active_unbind {
                coordinator.tasks.post(unbind);
            }
        }
        return;
    }

    let remove = coordinator.tasks.create(
        TaskKind::Remove,
        device,
        Some(Box::new(move |coordinator, status| {
            remove_done(coordinator, device, status);
        })),
    );
    let unbind = coordinator.tasks.create(
        TaskKind::Unbind,
        device,
        Some(Box::new(move |coordinator, status| {
            unbind_done(coordinator, device, status);
        })),
    );
    // The device is not reclaimed until its driver has unbound.
    coordinator.tasks.add_dependency(remove, unbind);

    if let Some(dev) = coordinator.devices.get_mut(device) {
        dev.set_active_unbind(Some(unbind));
        dev.set_active_remove(Some(remove));
        dev.set_unbind_requested(opts.do_unbind);
    }
    coordinator.tasks.post(remove);
    if opts.post {
        coordinator.tasks.post(unbind);
    }
}

pub(crate) fn run_unbind(coordinator: &mut Coordinator, task: TaskId) {
    let device = match coordinator.tasks.get(task) {
        Some(entry) => entry.device(),
        None => return,
    };
    let Some(dev) = coordinator.devices.get(device) else {
        coordinator.complete_task(task, Ok(()));
        return;
    };
    let state = dev.state();
    if state == DeviceState::Dead {
        coordinator.complete_task(task, Ok(()));
        return;
    }

    // An in-flight init, suspend or resume must settle before the device
    // can unbind.
    let defer_on = match state {
        DeviceState::Initializing => dev.active_init(),
        DeviceState::Suspending => dev.active_suspend(),
        DeviceState::Resuming | DeviceState::Resumed => dev.active_resume(),
        _ => None,
    };
    if let Some(blocker) = defer_on {
        coordinator.tasks.add_dependency(task, blocker);
        coordinator.tasks.enqueue_if_ready(task);
        return;
    }

    if schedule_unbind_children(coordinator, device, task) {
        // Children first; this task re-runs once their unbinds complete.
        return;
    }

    let Some(dev) = coordinator.devices.get_mut(device) else {
        coordinator.complete_task(task, Ok(()));
        return;
    };
    if dev.state() != DeviceState::Unbinding {
        dev.set_state(DeviceState::Unbinding);
    }

    // Fragment disassociation happens before the device's own unbind RPC:
    // an assembled composite this device serves reverts to not-assembled.
    coordinator.disassociate_fragments(device);

    let (host, local_id, do_unbind) = match coordinator.devices.get(device) {
        Some(dev) => (dev.host(), dev.local_id(), dev.unbind_requested()),
        None => (None, None, false),
    };
    match (host, local_id) {
        (Some(host), Some(local_id)) if do_unbind => {
            match coordinator.transport().send_unbind(host, local_id) {
                Ok(()) => coordinator.tasks.mark_sent(task),
                Err(e) => {
                    let status = Err(e.into_task_error());
                    coordinator.complete_task(task, status);
                }
            }
        }
        // Not in a host, or the driver's unbind hook is skipped.
        _ => coordinator.complete_task(task, Ok(())),
    }
}

/// Create unbind/remove pairs for every live child (and the proxy) and
/// wire the ordering: this unbind waits on each child unbind, this remove
/// waits on each child remove. Returns true if any dependency is pending.
fn schedule_unbind_children(
    coordinator: &mut Coordinator,
    device: DeviceId,
    unbind_task: TaskId,
) -> bool {
    let (children, proxy, remove_task) = match coordinator.devices.get(device) {
        Some(dev) => (
            dev.children().to_vec(),
            dev.proxy(),
            dev.active_remove(),
        ),
        None => return false,
    };

    let mut pending = false;
    for child in children.into_iter().chain(proxy) {
        let child_state = match coordinator.devices.get(child) {
            Some(dev) => dev.state(),
            None => continue,
        };
        if child_state == DeviceState::Dead {
            continue;
        }
        // The proxy has no unbind hook of its own to run.
        let do_unbind = Some(child) != proxy;
        create_unbind_remove_tasks(
            coordinator,
            child,
            UnbindOpts {
                do_unbind,
                post: true,
            },
        );

        let (child_unbind, child_remove) = match coordinator.devices.get(child) {
            Some(dev) => (dev.active_unbind(), dev.active_remove()),
            None => continue,
        };
        if let Some(child_unbind) = child_unbind {
            if !coordinator.tasks.is_completed(child_unbind) {
                coordinator.tasks.add_dependency(unbind_task, child_unbind);
                pending = true;
            }
        }
        if let (Some(remove_task), Some(child_remove)) = (remove_task, child_remove) {
            coordinator.tasks.add_dependency(remove_task, child_remove);
        }
    }
    if pending {
        coordinator.tasks.enqueue_if_ready(unbind_task);
    }
    pending
}

fn unbind_done(coordinator: &mut Coordinator, device: DeviceId, status: crate::error::TaskStatus) {
    let failed = matches!(status, Err(ref e) if *e != TaskError::Unavailable);
    if !failed {
        return;
    }
    let still_alive = coordinator
        .devices
        .get(device)
        .map(|d| d.state() != DeviceState::Dead)
        .unwrap_or(false);
    if still_alive {
        tracing::error!(device = %device, "Unbind failed, force removing device");
        let _ = coordinator.remove_device(device, true);
    }
}

pub(crate) fn run_remove(coordinator: &mut Coordinator, task: TaskId) {
    let device = match coordinator.tasks.get(task) {
        Some(entry) => entry.device(),
        None => return,
    };
    let (host, local_id, state) = match coordinator.devices.get(device) {
        Some(dev) => (dev.host(), dev.local_id(), dev.state()),
        None => {
            coordinator.complete_task(task, Ok(()));
            return;
        }
    };
    if state == DeviceState::Dead {
        coordinator.complete_task(task, Ok(()));
        return;
    }

    match (host, local_id) {
        (Some(host), Some(local_id)) => {
            match coordinator.transport().send_complete_removal(host, local_id) {
                Ok(()) => coordinator.tasks.mark_sent(task),
                Err(e) => {
                    let status = Err(e.into_task_error());
                    coordinator.complete_task(task, status);
                }
            }
        }
        _ => coordinator.complete_task(task, Ok(())),
    }
}

/// Remove completion: reclaim the device. A failure that is not plain
/// host-death forces removal of everything sharing the driver host.
fn remove_done(coordinator: &mut Coordinator, device: DeviceId, status: crate::error::TaskStatus) {
    let Some(dev) = coordinator.devices.get(device) else {
        return;
    };
    if dev.state() != DeviceState::Dead {
        let forced = matches!(status, Err(ref e) if *e != TaskError::Unavailable);
        if let Err(e) = coordinator.remove_device(device, forced) {
            tracing::error!(device = %device, error = %e, "Removal failed");
        }
    }
    coordinator.release_device(device);
}
