//! The agent runs inside someone else's process, so it cannot assume a
//! global logger is safe to install the way a normal binary's `main` would
//! (`env_logger::init()` touches process-wide state the host may also be
//! touching). Instead we install a tiny `log::Log` implementation that does
//! nothing but format a line and write it straight to stderr through
//! `libc::write`, guarded so a second `AgentBootstrap` activation (the host
//! process dlopen-ing us twice, or a stale constructor re-running) doesn't
//! try to install twice.

use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

static INSTALLED: AtomicBool = AtomicBool::new(false);

struct StderrLogger {
    debug: bool,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if self.debug {
            metadata.level() <= Level::Debug
        } else {
            metadata.level() <= Level::Info
        }
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[flight-profiler-agent] {} {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
        // Best effort; a failed stderr write here must never panic inside
        // someone else's process.
        let bytes = line.as_bytes();
        unsafe {
            libc::write(libc::STDERR_FILENO, bytes.as_ptr() as *const c_void, bytes.len());
        }
    }

    fn flush(&self) {}
}

/// Installs the stderr logger exactly once, no matter how many times
/// `AgentBootstrap` runs.
pub fn init(debug: bool) {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    let logger = Box::new(StderrLogger { debug });
    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}
