//! uvshim - task shim for OCI containers in hypervisor-isolated utility VMs.
//!
//! A supervising container manager drives task and exec lifecycle over a
//! framed Unix-socket channel; the shim runs each exec's state machine,
//! relays stdio between the manager's endpoints and the guest process, and
//! publishes lifecycle events back to the manager.
//!
//! ## Architecture
//!
//! - **Task service**: dispatches RPCs onto the registry, maps errors to the
//!   transport's canonical codes, logs every activity.
//! - **Exec state machine**: one process inside a container, Created →
//!   Running → Exited exactly once, with observers for process and container
//!   exit.
//! - **Guest runtime**: the platform seam; a host-process implementation is
//!   included for development and tests.

pub mod diag;
pub mod error;
pub mod events;
pub mod exec;
pub mod guest;
pub mod host;
pub mod ipc;
pub mod latch;
pub mod pod;
pub mod proto;
pub mod relay;
pub mod service;
pub mod signals;
pub mod task;
pub mod watchdog;
