//! System suspend/resume tracking and the suspend watchdog

use std::time::Duration;

use crate::error::TaskStatus;
use crate::ids::TaskId;
use crate::transport::{Event, EventSender, SystemPowerState};

/// Callback handed to [`Coordinator::suspend`](crate::Coordinator::suspend),
/// invoked on the dispatch thread when the system suspend finishes.
pub type PowerCallback = Box<dyn FnOnce(TaskStatus)>;

/// Tracks the system suspend currently in progress.
pub(crate) struct SuspendContext {
    target: SystemPowerState,
    /// Distinguishes watchdog fires belonging to this suspend from stale
    /// ones belonging to an earlier attempt.
    generation: u64,
    fallback_fired: bool,
    task: Option<TaskId>,
    callback: Option<PowerCallback>,
}

impl SuspendContext {
    pub fn new(target: SystemPowerState, generation: u64, callback: Option<PowerCallback>) -> Self {
        Self {
            target,
            generation,
            fallback_fired: false,
            task: None,
            callback,
        }
    }

    pub fn target(&self) -> SystemPowerState {
        self.target
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    pub fn set_task(&mut self, task: TaskId) {
        self.task = Some(task);
    }

    pub fn take_callback(&mut self) -> Option<PowerCallback> {
        self.callback.take()
    }

    /// Returns true the first time only; the fallback power action must
    /// never fire twice for one suspend.
    pub fn claim_fallback(&mut self) -> bool {
        !std::mem::replace(&mut self.fallback_fired, true)
    }
}

/// Tracks the system resume currently in progress.
pub(crate) struct ResumeContext {
    target: SystemPowerState,
    task: Option<TaskId>,
    callback: Option<PowerCallback>,
}

impl ResumeContext {
    pub fn new(target: SystemPowerState, callback: Option<PowerCallback>) -> Self {
        Self {
            target,
            task: None,
            callback,
        }
    }

    pub fn target(&self) -> SystemPowerState {
        self.target
    }

    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    pub fn set_task(&mut self, task: TaskId) {
        self.task = Some(task);
    }

    pub fn take_callback(&mut self) -> Option<PowerCallback> {
        self.callback.take()
    }
}

/// Arm the suspend timeout watchdog.
///
/// Requires a running tokio runtime; without one the watchdog is skipped
/// and the suspend proceeds unguarded.
pub(crate) fn spawn_suspend_watchdog(events: EventSender, timeout: Duration, generation: u64) {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "No async runtime; suspend watchdog disabled"
            );
            return;
        }
    };
    handle.spawn(async move {
        tokio::time::sleep(timeout).await;
        events.send(Event::SuspendTimeout { generation });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EventQueue;

    #[test]
    fn test_fallback_claimed_once() {
        let mut ctx = SuspendContext::new(SystemPowerState::SuspendToRam, 1, None);
        assert!(ctx.claim_fallback());
        assert!(!ctx.claim_fallback());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_after_timeout() {
        let mut queue = EventQueue::new();
        spawn_suspend_watchdog(queue.sender(), Duration::from_secs(10), 7);
        // Let the watchdog task arm its timer before the clock moves.
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(9)).await;
        tokio::task::yield_now().await;
        assert!(queue.try_next().is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(
            queue.try_next(),
            Some(Event::SuspendTimeout { generation: 7 })
        );
    }
}
