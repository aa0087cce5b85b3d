//! Shared-object entry point for the in-process agent, injected into the
//! target by the launcher (L3). Mirrors `code_inject.cpp`'s
//! `__attribute__((constructor)) code_inject_init`: runs automatically as
//! soon as `dlopen` maps this library in, no explicit call from the
//! injected shellcode required.

mod bootstrap;
mod ext_api;
mod hook;
mod lock_monitor;
mod logging;
mod pyffi;
mod stack_dump;
mod symbol;
mod trace_profiler;

pub use lock_monitor::{LockWarningKind, OutQueueSink};
pub use trace_profiler::{NativeFrameDescriptor, ProfileEvent, TraceProfiler};

#[ctor::ctor]
fn on_load() {
    let debug = std::env::var("FLIGHT_PROFILER_DEBUG").is_ok();
    logging::init(debug);
    bootstrap::activate();
}
