//! Concrete lifecycle task kinds
//!
//! Each submodule implements the run logic for one task kind. A run
//! function either completes the task, registers dependencies and returns
//! (the scheduler re-runs it once they drain), or sends an RPC and waits
//! for the reply event.

pub(crate) mod init;
pub(crate) mod resume;
pub(crate) mod suspend;
pub(crate) mod unbind;
