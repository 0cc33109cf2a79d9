//! Managed-thread control and syscall interception core for a discrete-event
//! network simulator: launches a guest process under ptrace, intercepts
//! every syscall, and rewrites or emulates it against simulated state while
//! preserving bit-for-bit determinism. The discrete-event scheduler,
//! network stack, and descriptor implementations are external collaborators
//! this crate only defines contracts for (see `descriptor`, `host`).
//!
//! This crate never installs a global logger; binaries/tests that embed it
//! are expected to call `env_logger::init()` (or an equivalent) themselves.

pub mod condition;
pub mod config;
pub mod control;
pub mod descriptor;
pub mod dispatch;
pub mod errno;
pub mod host;
pub mod memory;
pub mod process;
pub mod registers;
pub mod signals;
pub mod stats;
pub mod syscall;
pub mod thread;
pub mod tsc;

pub use config::SimulatorConfig;
pub use control::{make_syscall, LatencyTracker, MakeSyscallOutcome};
pub use errno::{CoreError, GuestErrno};
pub use host::{HostContext, HostId};
