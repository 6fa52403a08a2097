//! Test support: a recording transport for driving the coordinator
//! without real driver-host processes
//!
//! Tests inject replies through the coordinator's event queue, mirroring
//! how a driver host would answer, and assert on the requests the
//! coordinator sent.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ids::{DeviceId, HostId, LocalId};
use crate::transport::{FallbackAction, HostHandle, SystemPowerState, Transport};

/// One request the coordinator issued to the outside world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentRequest {
    CreateHost { name: String },
    ReleaseHost { koid: Uuid },
    CreateDevice { host: HostId, device: DeviceId, local_id: LocalId },
    CreateComposite {
        host: HostId,
        device: DeviceId,
        local_id: LocalId,
        fragment_local_ids: Vec<LocalId>,
    },
    ConnectProxy { device: DeviceId, proxy: DeviceId },
    BindDriver { host: HostId, local_id: LocalId, driver_url: String },
    Init { host: HostId, local_id: LocalId },
    Unbind { host: HostId, local_id: LocalId },
    CompleteRemoval { host: HostId, local_id: LocalId },
    Suspend { host: HostId, local_id: LocalId, target: SystemPowerState },
    Resume { host: HostId, local_id: LocalId, target: SystemPowerState },
    Powerctl { action: FallbackAction },
}

#[derive(Default)]
struct Inner {
    requests: Vec<SentRequest>,
    fail_ops: HashSet<&'static str>,
}

/// Transport double that records every request and succeeds unless an
/// operation was marked to fail.
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<Mutex<Inner>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded request, oldest first.
    pub fn requests(&self) -> Vec<SentRequest> {
        self.inner.lock().requests.clone()
    }

    /// Drain the recorded requests.
    pub fn take_requests(&self) -> Vec<SentRequest> {
        std::mem::take(&mut self.inner.lock().requests)
    }

    /// Make the named operation fail with a transport error until
    /// cleared. Operation names match the `Transport` method names.
    pub fn fail_op(&self, op: &'static str) {
        self.inner.lock().fail_ops.insert(op);
    }

    pub fn clear_failures(&self) {
        self.inner.lock().fail_ops.clear();
    }

    fn record(&self, op: &'static str, request: SentRequest) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_ops.contains(op) {
            return Err(Error::Transport(format!("{} failed", op)));
        }
        inner.requests.push(request);
        Ok(())
    }
}

impl Transport for FakeTransport {
    fn create_driver_host(&self, name: &str) -> Result<HostHandle> {
        self.record(
            "create_driver_host",
            SentRequest::CreateHost {
                name: name.to_string(),
            },
        )?;
        Ok(HostHandle {
            koid: Uuid::new_v4(),
        })
    }

    fn release_driver_host(&self, koid: Uuid) {
        let _ = self.record("release_driver_host", SentRequest::ReleaseHost { koid });
    }

    fn create_device(&self, host: HostId, device: DeviceId, local_id: LocalId) -> Result<()> {
        self.record(
            "create_device",
            SentRequest::CreateDevice {
                host,
                device,
                local_id,
            },
        )
    }

    fn create_composite_device(
        &self,
        host: HostId,
        device: DeviceId,
        local_id: LocalId,
        fragment_local_ids: &[LocalId],
    ) -> Result<()> {
        self.record(
            "create_composite_device",
            SentRequest::CreateComposite {
                host,
                device,
                local_id,
                fragment_local_ids: fragment_local_ids.to_vec(),
            },
        )
    }

    fn connect_proxy(&self, device: DeviceId, proxy: DeviceId) -> Result<()> {
        self.record("connect_proxy", SentRequest::ConnectProxy { device, proxy })
    }

    fn bind_driver(&self, host: HostId, local_id: LocalId, driver_url: &str) -> Result<()> {
        self.record(
            "bind_driver",
            SentRequest::BindDriver {
                host,
                local_id,
                driver_url: driver_url.to_string(),
            },
        )
    }

    fn send_init(&self, host: HostId, local_id: LocalId) -> Result<()> {
        self.record("send_init", SentRequest::Init { host, local_id })
    }

    fn send_unbind(&self, host: HostId, local_id: LocalId) -> Result<()> {
        self.record("send_unbind", SentRequest::Unbind { host, local_id })
    }

    fn send_complete_removal(&self, host: HostId, local_id: LocalId) -> Result<()> {
        self.record(
            "send_complete_removal",
            SentRequest::CompleteRemoval { host, local_id },
        )
    }

    fn send_suspend(
        &self,
        host: HostId,
        local_id: LocalId,
        target: SystemPowerState,
    ) -> Result<()> {
        self.record(
            "send_suspend",
            SentRequest::Suspend {
                host,
                local_id,
                target,
            },
        )
    }

    fn send_resume(
        &self,
        host: HostId,
        local_id: LocalId,
        target: SystemPowerState,
    ) -> Result<()> {
        self.record(
            "send_resume",
            SentRequest::Resume {
                host,
                local_id,
                target,
            },
        )
    }

    fn system_powerctl(&self, action: FallbackAction) -> Result<()> {
        self.record("system_powerctl", SentRequest::Powerctl { action })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_transport_records() {
        let transport = FakeTransport::new();
        transport
            .send_init(HostId(1), LocalId(2))
            .unwrap();
        assert_eq!(
            transport.take_requests(),
            vec![SentRequest::Init {
                host: HostId(1),
                local_id: LocalId(2)
            }]
        );
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_fake_transport_failure_injection() {
        let transport = FakeTransport::new();
        transport.fail_op("bind_driver");
        assert!(transport
            .bind_driver(HostId(1), LocalId(1), "driver://x")
            .is_err());
        transport.clear_failures();
        assert!(transport
            .bind_driver(HostId(1), LocalId(1), "driver://x")
            .is_ok());
    }
}
