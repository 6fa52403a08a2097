//! Coordinator configuration with builder pattern

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::FallbackAction;

/// Relative ordering of a subtree power operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerOrdering {
    /// Descendants complete the operation before their parent does.
    ChildrenFirst,
    /// The parent completes the operation before its descendants start.
    ParentFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Name of the immortal root device created at construction.
    pub root_device_name: String,
    /// Driver URL auto-bound onto devices matched by composite fragments.
    pub fragment_driver_url: String,
    /// How long a system suspend may run before the watchdog fires.
    /// `None` disables the watchdog.
    pub suspend_timeout: Option<Duration>,
    /// Kernel power operation taken when the suspend watchdog fires.
    pub suspend_fallback: FallbackAction,
    /// Ordering applied by suspend tasks; resume uses the opposite.
    pub suspend_ordering: PowerOrdering,
    /// Upper bound on live driver-host processes.
    pub max_driver_hosts: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            root_device_name: "root".into(),
            fragment_driver_url: "driver://fragment".into(),
            suspend_timeout: Some(Duration::from_secs(30)),
            suspend_fallback: FallbackAction::None,
            suspend_ordering: PowerOrdering::ChildrenFirst,
            max_driver_hosts: 64,
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_device_name(mut self, name: impl Into<String>) -> Self {
        self.root_device_name = name.into();
        self
    }

    pub fn fragment_driver_url(mut self, url: impl Into<String>) -> Self {
        self.fragment_driver_url = url.into();
        self
    }

    pub fn suspend_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.suspend_timeout = timeout;
        self
    }

    pub fn suspend_fallback(mut self, action: FallbackAction) -> Self {
        self.suspend_fallback = action;
        self
    }

    pub fn suspend_ordering(mut self, ordering: PowerOrdering) -> Self {
        self.suspend_ordering = ordering;
        self
    }

    pub fn max_driver_hosts(mut self, max: usize) -> Self {
        self.max_driver_hosts = max;
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.root_device_name.is_empty() {
            return Err(crate::Error::Config("root device name cannot be empty".into()));
        }
        if self.fragment_driver_url.is_empty() {
            return Err(crate::Error::Config(
                "fragment driver url cannot be empty".into(),
            ));
        }
        if self.max_driver_hosts == 0 {
            return Err(crate::Error::Config(
                "max_driver_hosts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
