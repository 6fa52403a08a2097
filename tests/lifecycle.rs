//! End-to-end lifecycle tests: multi-device trees driven through init,
//! unbind/remove and suspend/resume against a recording transport.

use std::sync::Arc;

use devcoord::testing::{FakeTransport, SentRequest};
use devcoord::{
    AddDeviceArgs, Coordinator, CoordinatorConfig, DeviceId, DeviceState, Event, HostId, LocalId,
    SystemPowerState, TaskError,
};

struct Harness {
    coordinator: Coordinator,
    transport: Arc<FakeTransport>,
    host: HostId,
}

impl Harness {
    fn new() -> Self {
        let transport = Arc::new(FakeTransport::new());
        let mut coordinator = Coordinator::new(
            CoordinatorConfig::new().suspend_timeout(None),
            transport.clone(),
        )
        .unwrap();
        let host = coordinator.create_driver_host("driver_host:test").unwrap();
        Self {
            coordinator,
            transport,
            host,
        }
    }

    fn add_device(&mut self, parent: DeviceId, name: &str) -> DeviceId {
        let device = self
            .coordinator
            .add_device(parent, AddDeviceArgs::new(name).in_host(self.host))
            .unwrap();
        self.coordinator.run_until_idle();
        device
    }

    fn endpoint(&self, device: DeviceId) -> (HostId, LocalId) {
        let dev = self.coordinator.device(device).unwrap();
        (dev.host().unwrap(), dev.local_id().unwrap())
    }

    fn reply(&mut self, event: Event) {
        self.coordinator.event_sender().send(event);
        self.coordinator.run_until_idle();
    }

    fn state(&self, device: DeviceId) -> DeviceState {
        self.coordinator.device(device).unwrap().state()
    }

    /// Local ids of the unbind requests sent so far, oldest first.
    fn unbind_order(&self) -> Vec<LocalId> {
        self.transport
            .requests()
            .iter()
            .filter_map(|r| match r {
                SentRequest::Unbind { local_id, .. } => Some(*local_id),
                _ => None,
            })
            .collect()
    }

    fn suspend_order(&self) -> Vec<LocalId> {
        self.transport
            .requests()
            .iter()
            .filter_map(|r| match r {
                SentRequest::Suspend { local_id, .. } => Some(*local_id),
                _ => None,
            })
            .collect()
    }

    fn resume_order(&self) -> Vec<LocalId> {
        self.transport
            .requests()
            .iter()
            .filter_map(|r| match r {
                SentRequest::Resume { local_id, .. } => Some(*local_id),
                _ => None,
            })
            .collect()
    }
}

#[test]
fn test_unbind_chain_stops_drivers_deepest_first() {
    let mut h = Harness::new();
    let root = h.coordinator.root_device();

    // A chain of 10 bound driver instances under one node.
    let top = h.add_device(root, "top");
    let mut chain = vec![top];
    for i in 1..10 {
        let parent = *chain.last().unwrap();
        chain.push(h.add_device(parent, &format!("link-{}", i)));
    }
    let locals: Vec<LocalId> = chain.iter().map(|&d| h.endpoint(d).1).collect();

    h.coordinator.schedule_host_requested_remove(top, true);
    h.coordinator.run_until_idle();

    // Only the deepest link has been asked to unbind so far.
    assert_eq!(h.unbind_order(), vec![locals[9]]);

    // Each reply releases exactly the next link up, walking the chain
    // bottom-up until the root's own unbind goes out last.
    for depth in (1..10).rev() {
        h.reply(Event::UnbindDone {
            device: chain[depth],
            status: Ok(()),
        });
        let expected: Vec<LocalId> = locals[depth - 1..].iter().rev().copied().collect();
        assert_eq!(h.unbind_order(), expected);
    }
    h.reply(Event::UnbindDone {
        device: chain[0],
        status: Ok(()),
    });
    let expected: Vec<LocalId> = locals.iter().rev().copied().collect();
    assert_eq!(h.unbind_order(), expected);

    // Drain the remove requests bottom-up as well.
    for &device in chain.iter().rev() {
        h.reply(Event::RemoveDone {
            device,
            status: Ok(()),
        });
    }
    for &device in &chain {
        assert!(h.coordinator.device(device).is_none());
    }
}

#[test]
fn test_parent_unbind_completes_after_all_children() {
    let mut h = Harness::new();
    let root = h.coordinator.root_device();
    let parent = h.add_device(root, "parent");
    let child_a = h.add_device(parent, "child-a");
    let child_b = h.add_device(parent, "child-b");

    h.coordinator.schedule_host_requested_remove(parent, true);
    h.coordinator.run_until_idle();

    let (_, parent_local) = h.endpoint(parent);
    // Parent's unbind must not go out while a child is still unbinding.
    assert!(!h.unbind_order().contains(&parent_local));

    h.reply(Event::UnbindDone {
        device: child_a,
        status: Ok(()),
    });
    assert!(!h.unbind_order().contains(&parent_local));

    h.reply(Event::UnbindDone {
        device: child_b,
        status: Ok(()),
    });
    assert!(h.unbind_order().contains(&parent_local));
}

#[test]
fn test_unbind_waits_for_inflight_init() {
    let mut h = Harness::new();
    let root = h.coordinator.root_device();
    let device = h
        .coordinator
        .add_device(root, AddDeviceArgs::new("device").in_host(h.host).with_init())
        .unwrap();
    h.coordinator.run_until_idle();
    let (_, local) = h.endpoint(device);

    h.coordinator.schedule_host_requested_remove(device, true);
    h.coordinator.run_until_idle();
    // No unbind until the init reply lands.
    assert!(h.unbind_order().is_empty());

    h.reply(Event::InitDone {
        device,
        status: Ok(()),
    });
    assert_eq!(h.unbind_order(), vec![local]);

    h.reply(Event::UnbindDone {
        device,
        status: Ok(()),
    });
    h.reply(Event::RemoveDone {
        device,
        status: Ok(()),
    });
    assert!(h.coordinator.device(device).is_none());
}

#[test]
fn test_state_is_monotonic_through_removal() {
    let mut h = Harness::new();
    let root = h.coordinator.root_device();
    let device = h.add_device(root, "device");

    assert_eq!(h.state(device), DeviceState::Active);
    h.coordinator.schedule_host_requested_remove(device, true);
    h.coordinator.run_until_idle();
    assert_eq!(h.state(device), DeviceState::Unbinding);

    h.reply(Event::UnbindDone {
        device,
        status: Ok(()),
    });
    // Still unbinding or dead, never backward.
    assert!(matches!(
        h.state(device),
        DeviceState::Unbinding | DeviceState::Dead
    ));
    h.reply(Event::RemoveDone {
        device,
        status: Ok(()),
    });
    assert!(h.coordinator.device(device).is_none());
}

#[test]
fn test_suspend_children_complete_before_parent() {
    let mut h = Harness::new();
    let root = h.coordinator.root_device();
    let parent = h.add_device(root, "parent");
    let child = h.add_device(parent, "child");
    let grandchild = h.add_device(child, "grandchild");

    let locals: Vec<LocalId> = [parent, child, grandchild]
        .iter()
        .map(|&d| h.endpoint(d).1)
        .collect();

    h.coordinator
        .suspend(SystemPowerState::SuspendToRam, None)
        .unwrap();
    h.coordinator.run_until_idle();

    // Deepest first: only the grandchild's suspend has gone out.
    assert_eq!(h.suspend_order(), vec![locals[2]]);

    h.reply(Event::SuspendDone {
        device: grandchild,
        status: Ok(()),
    });
    assert_eq!(h.suspend_order(), vec![locals[2], locals[1]]);
    assert_eq!(h.state(grandchild), DeviceState::Suspended);

    h.reply(Event::SuspendDone {
        device: child,
        status: Ok(()),
    });
    assert_eq!(h.suspend_order(), vec![locals[2], locals[1], locals[0]]);

    h.reply(Event::SuspendDone {
        device: parent,
        status: Ok(()),
    });
    assert_eq!(h.state(parent), DeviceState::Suspended);
    assert_eq!(h.state(child), DeviceState::Suspended);
    assert!(h.coordinator.in_suspend());
}

#[test]
fn test_resume_parents_before_children_and_reports_power_state() {
    let mut h = Harness::new();
    let root = h.coordinator.root_device();
    let parent = h.add_device(root, "parent");
    let child = h.add_device(parent, "child");

    h.coordinator
        .suspend(SystemPowerState::SuspendToRam, None)
        .unwrap();
    h.coordinator.run_until_idle();
    h.reply(Event::SuspendDone {
        device: child,
        status: Ok(()),
    });
    h.reply(Event::SuspendDone {
        device: parent,
        status: Ok(()),
    });

    let done = Arc::new(parking_lot::Mutex::new(None));
    let done_clone = done.clone();
    h.coordinator
        .resume(
            SystemPowerState::FullyOn,
            Some(Box::new(move |status| {
                *done_clone.lock() = Some(status);
            })),
        )
        .unwrap();
    h.coordinator.run_until_idle();

    let (_, parent_local) = h.endpoint(parent);
    let (_, child_local) = h.endpoint(child);
    // Parent resumes first; the child's resume is not sent yet.
    assert_eq!(h.resume_order(), vec![parent_local]);

    h.reply(Event::ResumeDone {
        device: parent,
        status: Ok(()),
        power_state: 0,
    });
    assert_eq!(h.resume_order(), vec![parent_local, child_local]);

    h.reply(Event::ResumeDone {
        device: child,
        status: Ok(()),
        power_state: 3,
    });
    assert_eq!(h.state(parent), DeviceState::Active);
    assert_eq!(h.state(child), DeviceState::Active);
    assert_eq!(h.coordinator.device(child).unwrap().power_state(), 3);
    assert_eq!(*done.lock(), Some(Ok(())));
    assert!(!h.coordinator.in_suspend());
}

#[test]
fn test_suspend_failure_reported_to_caller() {
    let mut h = Harness::new();
    let root = h.coordinator.root_device();
    let device = h.add_device(root, "device");

    let done = Arc::new(parking_lot::Mutex::new(None));
    let done_clone = done.clone();
    h.coordinator
        .suspend(
            SystemPowerState::Poweroff,
            Some(Box::new(move |status| {
                *done_clone.lock() = Some(status);
            })),
        )
        .unwrap();
    h.coordinator.run_until_idle();

    h.reply(Event::SuspendDone {
        device,
        status: Err(TaskError::Failed("driver refused".into())),
    });
    assert_eq!(
        *done.lock(),
        Some(Err(TaskError::Failed("driver refused".into())))
    );
    // The failed suspend is dropped so a retry can start.
    assert!(!h.coordinator.in_suspend());
}
