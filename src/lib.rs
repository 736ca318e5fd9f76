//! Driver-side debug sessions for GPU compute workloads, over the prelim
//! i915 debugger uapi.
//!
//! A [`DebugSession`] attaches to a running process through its DRM render
//! node and turns the kernel's event stream into a debugger-facing API:
//!
//! - process and module lifecycle events ([`ApiEvent`])
//! - thread interrupt and resume ([`ThreadSelector`] addressing)
//! - target memory access, routed by ISA, module image and VM bindings
//! - register access inside the SIP state save area ([`RegsetType`])
//!
//! Sessions are driven by two internal threads: a reader that drains the
//! kernel channel and a worker that folds records into session state. The
//! application only ever calls the session API and `read_event`.
//!
//! [`MockDebugFd`](fd::MockDebugFd) runs the full session logic without
//! hardware; everything below [`DebugFd`](fd::DebugFd) is replaceable.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod fd;
pub mod registry;
pub mod session;
pub mod state_save;
pub mod threads;
pub mod topology;
pub mod uapi;

pub use config::Config;
pub use connection::{canonize, decanonize};
pub use error::{DebugError, Result};
pub use events::{ApiEvent, DetachReason};
pub use registry::SessionRegistry;
pub use session::{DebugSession, MemoryKind, MemorySpace};
pub use state_save::{RegsetProperties, RegsetType};
pub use threads::{ThreadId, ThreadSelector, ALL};
pub use topology::{DeviceInfo, DeviceTopology};
