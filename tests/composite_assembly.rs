//! Composite device matching, assembly, disassembly and re-assembly
//! against a recording transport.

use std::sync::Arc;

use devcoord::testing::{FakeTransport, SentRequest};
use devcoord::{
    AddDeviceArgs, CompositeDescriptor, CompositeId, Coordinator, CoordinatorConfig, DeviceId,
    DeviceProperty, Event, FragmentDescriptor, FragmentPart, HostId, MatchInst, Metadata,
};

const FRAGMENT_URL: &str = "driver://fragment";
const METADATA_TYPE: u32 = 7;

struct Harness {
    coordinator: Coordinator,
    transport: Arc<FakeTransport>,
}

impl Harness {
    fn new() -> Self {
        let transport = Arc::new(FakeTransport::new());
        let coordinator = Coordinator::new(
            CoordinatorConfig::new()
                .suspend_timeout(None)
                .fragment_driver_url(FRAGMENT_URL),
            transport.clone(),
        )
        .unwrap();
        Self {
            coordinator,
            transport,
        }
    }

    fn add_device_in_host(&mut self, name: &str, host: HostId, key: u32, value: u32) -> DeviceId {
        let root = self.coordinator.root_device();
        let device = self
            .coordinator
            .add_device(
                root,
                AddDeviceArgs::new(name)
                    .in_host(host)
                    .props(vec![DeviceProperty::new(key, value)]),
            )
            .unwrap();
        self.coordinator.run_until_idle();
        device
    }

    /// The fragment driver bound to `parent` publishes its device.
    fn publish_fragment_device(&mut self, parent: DeviceId, name: &str) -> DeviceId {
        let device = self
            .coordinator
            .add_device(parent, AddDeviceArgs::new(name).driver_url(FRAGMENT_URL))
            .unwrap();
        self.coordinator.run_until_idle();
        device
    }

    fn descriptor(coresident: usize) -> CompositeDescriptor {
        CompositeDescriptor {
            props: vec![DeviceProperty::new(50, 1)],
            fragments: vec![
                FragmentDescriptor {
                    parts: vec![FragmentPart::new(vec![MatchInst::Match { key: 1, value: 10 }])],
                },
                FragmentDescriptor {
                    parts: vec![FragmentPart::new(vec![MatchInst::Match { key: 2, value: 20 }])],
                },
            ],
            coresident_device_index: coresident,
            metadata: vec![Metadata::new(METADATA_TYPE, b"cfg".to_vec())],
        }
    }

    /// Answer every outstanding unbind/removal request until quiescent.
    fn drain_removals(&mut self) {
        loop {
            let requests = self.transport.take_requests();
            if requests.is_empty() {
                break;
            }
            for request in requests {
                let event = match request {
                    SentRequest::Unbind { host, local_id } => self
                        .coordinator
                        .local_id_map()
                        .lookup(host, local_id)
                        .map(|device| Event::UnbindDone {
                            device,
                            status: Ok(()),
                        }),
                    SentRequest::CompleteRemoval { host, local_id } => self
                        .coordinator
                        .local_id_map()
                        .lookup(host, local_id)
                        .map(|device| Event::RemoveDone {
                            device,
                            status: Ok(()),
                        }),
                    _ => None,
                };
                if let Some(event) = event {
                    self.coordinator.event_sender().send(event);
                    self.coordinator.run_until_idle();
                }
            }
        }
    }

    fn assembled_device(&self, composite: CompositeId) -> Option<DeviceId> {
        self.coordinator.composite(composite).unwrap().device()
    }
}

#[test]
fn test_two_fragment_composite_assembles_in_coresident_host() {
    let mut h = Harness::new();
    let host_a = h.coordinator.create_driver_host("driver_host:a").unwrap();
    let host_b = h.coordinator.create_driver_host("driver_host:b").unwrap();

    let dev0 = h.add_device_in_host("codec", host_a, 1, 10);
    let dev1 = h.add_device_in_host("dai", host_b, 2, 20);

    let composite = h
        .coordinator
        .add_composite_device("audio", Harness::descriptor(0))
        .unwrap();

    // Both devices matched a fragment; the fragment driver was bound onto
    // each in its own host.
    let binds: Vec<_> = h
        .transport
        .requests()
        .iter()
        .filter(|r| matches!(r, SentRequest::BindDriver { driver_url, .. } if driver_url.as_str() == FRAGMENT_URL))
        .cloned()
        .collect();
    assert_eq!(binds.len(), 2);
    assert_eq!(
        h.coordinator.device(dev0).unwrap().fragments().len(),
        1
    );
    assert!(h.assembled_device(composite).is_none());

    // Fragment drivers publish their devices; assembly happens once both
    // are in.
    let fd0 = h.publish_fragment_device(dev0, "codec-fragment");
    assert!(h.assembled_device(composite).is_none());
    let fd1 = h.publish_fragment_device(dev1, "dai-fragment");

    let synthetic = h.assembled_device(composite).expect("composite assembled");
    // An assembled composite has no unbound fragment and every bound
    // fragment carries both device references.
    let record = h.coordinator.composite(composite).unwrap();
    assert!(record.unbound_fragments().is_empty());
    assert!(record.bound_fragments().iter().all(|f| f.is_ready()));

    // coresident index 0 => the synthetic device lives in host A, with a
    // proxy standing in for fragment 1.
    assert_eq!(
        h.coordinator.device(synthetic).unwrap().host(),
        Some(host_a)
    );
    let proxy = h
        .coordinator
        .device(fd1)
        .unwrap()
        .proxy()
        .expect("fragment 1 proxied");
    assert_eq!(h.coordinator.device(proxy).unwrap().host(), Some(host_a));
    assert!(h
        .transport
        .requests()
        .contains(&SentRequest::ConnectProxy {
            device: fd1,
            proxy
        }));

    // The composite record wires fragment 0 to the fragment device's own
    // id and fragment 1 to the proxy's.
    let fd0_local = h.coordinator.device(fd0).unwrap().local_id().unwrap();
    let proxy_local = h.coordinator.device(proxy).unwrap().local_id().unwrap();
    let synthetic_local = h
        .coordinator
        .device(synthetic)
        .unwrap()
        .local_id()
        .unwrap();
    assert!(h
        .transport
        .requests()
        .contains(&SentRequest::CreateComposite {
            host: host_a,
            device: synthetic,
            local_id: synthetic_local,
            fragment_local_ids: vec![fd0_local, proxy_local],
        }));

    // Metadata propagated onto the assembled device.
    assert_eq!(
        h.coordinator.device(synthetic).unwrap().metadata(),
        &[Metadata::new(METADATA_TYPE, b"cfg".to_vec())]
    );
}

#[test]
fn test_ambiguous_match_is_rejected() {
    let mut h = Harness::new();
    let host = h.coordinator.create_driver_host("driver_host:a").unwrap();

    let dev0 = h.add_device_in_host("codec", host, 1, 10);
    let composite = h
        .coordinator
        .add_composite_device("audio", Harness::descriptor(0))
        .unwrap();
    assert_eq!(
        h.coordinator
            .composite(composite)
            .unwrap()
            .bound_fragments()
            .len(),
        1
    );

    // A second device carrying the bound fragment's property must not be
    // matched to any slot.
    let dup = h.add_device_in_host("codec-dup", host, 1, 10);
    assert!(h.coordinator.device(dup).unwrap().fragments().is_empty());
    assert_eq!(
        h.coordinator
            .composite(composite)
            .unwrap()
            .bound_fragments()
            .len(),
        1
    );
    // Only one fragment-driver bind went out, for the first device.
    let binds = h
        .transport
        .requests()
        .iter()
        .filter(|r| matches!(r, SentRequest::BindDriver { .. }))
        .count();
    assert_eq!(binds, 1);
    assert_eq!(h.coordinator.device(dev0).unwrap().fragments().len(), 1);
}

#[test]
fn test_disassembly_and_reassembly_reproduce_the_composite() {
    let mut h = Harness::new();
    let host_a = h.coordinator.create_driver_host("driver_host:a").unwrap();
    let host_b = h.coordinator.create_driver_host("driver_host:b").unwrap();

    let dev0 = h.add_device_in_host("codec", host_a, 1, 10);
    let dev1 = h.add_device_in_host("dai", host_b, 2, 20);
    let composite = h
        .coordinator
        .add_composite_device("audio", Harness::descriptor(0))
        .unwrap();
    let fd0 = h.publish_fragment_device(dev0, "codec-fragment");
    h.publish_fragment_device(dev1, "dai-fragment");

    let first = h.assembled_device(composite).expect("assembled");
    let fd0_local = h.coordinator.device(fd0).unwrap().local_id().unwrap();
    h.transport.take_requests();

    // Tearing down fragment 1's device chain disassembles the composite.
    h.coordinator.schedule_host_requested_remove(dev1, true);
    h.coordinator.run_until_idle();
    h.drain_removals();

    assert!(h.assembled_device(composite).is_none());
    assert!(h.coordinator.device(first).is_none());
    assert_eq!(
        h.coordinator
            .composite(composite)
            .unwrap()
            .unbound_fragments()
            .len(),
        1
    );

    // Host B was released with its last device; the replacement arrives
    // in a fresh host and re-binds fragment 1.
    assert!(h.coordinator.driver_host(host_b).is_none());
    let host_b2 = h.coordinator.create_driver_host("driver_host:b2").unwrap();
    let dev1b = h.add_device_in_host("dai-b", host_b2, 2, 20);
    assert_eq!(h.coordinator.device(dev1b).unwrap().fragments().len(), 1);
    h.publish_fragment_device(dev1b, "dai-b-fragment");

    let second = h.assembled_device(composite).expect("reassembled");
    assert_ne!(first, second);
    // Fragment 0 keeps its local-id mapping; metadata was added again.
    let requests = h.transport.requests();
    let create = requests
        .iter()
        .find_map(|r| match r {
            SentRequest::CreateComposite {
                device,
                fragment_local_ids,
                host,
                ..
            } if *device == second => Some((*host, fragment_local_ids.clone())),
            _ => None,
        })
        .expect("composite recreated");
    assert_eq!(create.0, host_a);
    assert_eq!(create.1[0], fd0_local);
    assert_eq!(
        h.coordinator.device(second).unwrap().metadata(),
        &[Metadata::new(METADATA_TYPE, b"cfg".to_vec())]
    );
}

#[test]
fn test_fragment_bind_failure_leaves_fragment_unbound() {
    let mut h = Harness::new();
    let host = h.coordinator.create_driver_host("driver_host:a").unwrap();

    h.transport.fail_op("bind_driver");
    let dev0 = h.add_device_in_host("codec", host, 1, 10);
    let composite = h
        .coordinator
        .add_composite_device("audio", Harness::descriptor(0))
        .unwrap();

    assert!(h
        .coordinator
        .composite(composite)
        .unwrap()
        .bound_fragments()
        .is_empty());
    assert!(h.coordinator.device(dev0).unwrap().fragments().is_empty());

    // Once the transport recovers, other fragments still bind.
    h.transport.clear_failures();
    let dai = h.add_device_in_host("dai", host, 2, 20);
    assert_eq!(h.coordinator.device(dai).unwrap().fragments().len(), 1);
}
