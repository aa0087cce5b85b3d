//! Vocabulary shared between the launcher and the agent: the exit code
//! enumeration the injector reports through, the sidecar parameters line
//! format, the lock-monitor configuration defaults, and the display-payload
//! grammar the trace profiler writes into its send buffer.

pub mod config;
pub mod exit_code;
pub mod grammar;
pub mod sidecar;

pub use config::LockMonitorConfig;
pub use exit_code::ExitCode;
pub use sidecar::SidecarParams;
