//! Driver-host RPC boundary and completion delivery
//!
//! The coordinator talks to driver-host processes through the [`Transport`]
//! trait; the wire protocol behind it is not this crate's concern. Replies
//! and other asynchronous happenings come back as [`Event`]s on a queue
//! drained by the coordinator's single dispatch loop.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Result, TaskStatus};
use crate::ids::{DeviceId, HostId, LocalId};

/// System-wide power state targeted by suspend/resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemPowerState {
    FullyOn,
    SuspendToRam,
    Poweroff,
    Reboot,
}

impl std::fmt::Display for SystemPowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemPowerState::FullyOn => write!(f, "FullyOn"),
            SystemPowerState::SuspendToRam => write!(f, "SuspendToRam"),
            SystemPowerState::Poweroff => write!(f, "Poweroff"),
            SystemPowerState::Reboot => write!(f, "Reboot"),
        }
    }
}

/// Kernel-level power operation taken when a suspend times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackAction {
    None,
    Reboot,
    Poweroff,
}

/// Process identity handed back when a driver host is spawned.
#[derive(Debug, Clone, Copy)]
pub struct HostHandle {
    pub koid: Uuid,
}

/// An asynchronous completion delivered onto the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Reply to a `send_init`.
    InitDone { device: DeviceId, status: TaskStatus },
    /// Reply to a `send_unbind`.
    UnbindDone { device: DeviceId, status: TaskStatus },
    /// Reply to a `send_complete_removal`.
    RemoveDone { device: DeviceId, status: TaskStatus },
    /// Reply to a `send_suspend`.
    SuspendDone { device: DeviceId, status: TaskStatus },
    /// Reply to a `send_resume`, reporting the power state the device
    /// actually reached.
    ResumeDone {
        device: DeviceId,
        status: TaskStatus,
        power_state: u32,
    },
    /// A driver-host process died; every resident device must be force
    /// removed.
    HostDied { host: HostId },
    /// The suspend watchdog fired. Stale generations are ignored.
    SuspendTimeout { generation: u64 },
    /// Retry publishing a device for binding (rebind backoff).
    RetryBind { device: DeviceId },
}

/// Sending half of the completion queue; cheap to clone into reply
/// handlers and timers.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    pub fn send(&self, event: Event) {
        // The receiver only drops when the coordinator is torn down;
        // completions arriving after that are meaningless.
        let _ = self.tx.send(event);
    }
}

/// The coordinator-owned completion queue.
pub struct EventQueue {
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Non-blocking drain step for the dispatch loop.
    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the coordinator asks of the outside world: spawning hosts,
/// delivering lifecycle RPCs, and the kernel power fallback.
///
/// Calls are non-blocking sends; replies arrive later as [`Event`]s. A
/// returned error means the request could not be delivered and the caller
/// must assume the remote state is unknown.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Spawn a new driver-host process and establish its RPC channel.
    fn create_driver_host(&self, name: &str) -> Result<HostHandle>;

    /// Release the coordinator's handle on a driver-host process.
    fn release_driver_host(&self, koid: Uuid);

    /// Create a device record in a driver host.
    fn create_device(&self, host: HostId, device: DeviceId, local_id: LocalId) -> Result<()>;

    /// Create the synthetic composite device in a driver host, wiring it
    /// to the fragments' host-local ids.
    fn create_composite_device(
        &self,
        host: HostId,
        device: DeviceId,
        local_id: LocalId,
        fragment_local_ids: &[LocalId],
    ) -> Result<()>;

    /// Connect a proxy stand-in to the device it shadows.
    fn connect_proxy(&self, device: DeviceId, proxy: DeviceId) -> Result<()>;

    /// Ask a host to bind a driver to a resident device.
    fn bind_driver(&self, host: HostId, local_id: LocalId, driver_url: &str) -> Result<()>;

    fn send_init(&self, host: HostId, local_id: LocalId) -> Result<()>;

    fn send_unbind(&self, host: HostId, local_id: LocalId) -> Result<()>;

    fn send_complete_removal(&self, host: HostId, local_id: LocalId) -> Result<()>;

    fn send_suspend(&self, host: HostId, local_id: LocalId, target: SystemPowerState)
        -> Result<()>;

    fn send_resume(&self, host: HostId, local_id: LocalId, target: SystemPowerState)
        -> Result<()>;

    /// Kernel-level power operation used by the suspend fallback path.
    fn system_powerctl(&self, action: FallbackAction) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_mock_transport_reports_send_errors() {
        let mut mock = MockTransport::new();
        mock.expect_send_init()
            .returning(|_, _| Err(Error::Transport("channel closed".into())));
        let err = mock.send_init(HostId(1), LocalId(1)).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_event_queue_roundtrip() {
        let mut queue = EventQueue::new();
        let sender = queue.sender();
        assert!(queue.try_next().is_none());

        sender.send(Event::HostDied { host: HostId(1) });
        assert_eq!(queue.try_next(), Some(Event::HostDied { host: HostId(1) }));
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn test_event_order_preserved() {
        let mut queue = EventQueue::new();
        let sender = queue.sender();
        sender.send(Event::SuspendTimeout { generation: 1 });
        sender.send(Event::SuspendTimeout { generation: 2 });
        assert_eq!(queue.try_next(), Some(Event::SuspendTimeout { generation: 1 }));
        assert_eq!(queue.try_next(), Some(Event::SuspendTimeout { generation: 2 }));
    }
}
