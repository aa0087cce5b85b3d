//! A1: agent bootstrap. Runs once, from the shared object's constructor,
//! parses the sidecar parameters file the launcher wrote next to the
//! agent `.so`, and — if the host's runtime version is supported — starts
//! a background thread that executes the controller-supplied script with
//! the globals it expects.
//!
//! Grounded on `code_inject.cpp`'s `code_inject_init`/`inject_inner`/
//! `inject`/`start_thread`/`boot_entry`.

use std::path::Path;
use std::sync::Once;

use flight_profiler_common::SidecarParams;
use log::{error, info, warn};

use crate::pyffi;

/// The newest runtime minor version this bootstrap will run the injected
/// script against, matching `code_inject_init`'s `major == 3 && minor < 14`
/// guard. A4/A5/A6 are reachable independent of this gate — the controller
/// invokes them directly once the agent is loaded — only the bootstrap
/// worker thread is skipped on unsupported runtimes.
///
/// Overridable via `FLIGHT_PROFILER_MAX_RUNTIME_MINOR` rather than a
/// sidecar wire field, so the sidecar file's three-field CSV format stays
/// fixed.
const SUPPORTED_RUNTIME_MINOR_MAX: u32 = 13;

static STARTED: Once = Once::new();

fn max_supported_minor() -> u32 {
    std::env::var("FLIGHT_PROFILER_MAX_RUNTIME_MINOR")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(SUPPORTED_RUNTIME_MINOR_MAX)
}

/// Entry point called from the cdylib's constructor. Reads
/// `<agent .so directory>/sidecar.params`, and if the host interpreter's
/// version is supported, starts the bootstrap worker thread. Safe to call
/// more than once; only the first call does anything.
pub fn activate() {
    STARTED.call_once(|| {
        if let Err(e) = activate_inner() {
            error!("agent bootstrap failed: {}", e);
        }
    });
}

fn activate_inner() -> Result<(), String> {
    let so_dir = agent_so_directory()?;
    let sidecar_path = so_dir.join("sidecar.params");
    let line = std::fs::read_to_string(&sidecar_path)
        .map_err(|e| format!("could not read sidecar file {}: {}", sidecar_path.display(), e))?;
    let params = SidecarParams::parse_line(&line).map_err(|e| e.to_string())?;

    crate::symbol::set_offset(params.base_offset);

    let version = pyffi::runtime_version();

    // Registered unconditionally, ahead of the runtime-version gate below:
    // A4/A5/A6 stay reachable through it even on a runtime the bootstrap
    // worker thread itself declines to run a script against. Only attempted
    // once we know an interpreter actually exists to register it into.
    if version.is_some() {
        let _gil = pyffi::GilGuard::acquire();
        crate::ext_api::install();
    }

    match version {
        Some((major, minor)) if major == 3 && minor <= max_supported_minor() => {
            info!("flight-profiler-agent: bootstrapping against Python {}.{}", major, minor);
            start_bootstrap_thread(params)
        }
        Some((major, minor)) => {
            warn!(
                "flight-profiler-agent: runtime {}.{} is newer than the supported bootstrap gate ({}); \
                 skipping script injection, lock monitor and trace profiler remain independently reachable",
                major, minor, max_supported_minor()
            );
            Ok(())
        }
        None => Err("host process has no initialized Python interpreter".to_string()),
    }
}

fn agent_so_directory() -> Result<std::path::PathBuf, String> {
    // The original resolves its own `.so` path with `dladdr`; we do the
    // same against a function known to live in this shared object.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let addr = agent_so_directory as *const () as *mut libc::c_void;
    let rc = unsafe { libc::dladdr(addr, &mut info) };
    if rc == 0 || info.dli_fname.is_null() {
        return Err("dladdr could not locate the agent's own shared object".to_string());
    }
    let path = unsafe { std::ffi::CStr::from_ptr(info.dli_fname) }
        .to_string_lossy()
        .into_owned();
    Path::new(&path)
        .parent()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| format!("agent .so path has no parent directory: {}", path))
}

struct BootArgs {
    interp: *mut pyo3::ffi::PyInterpreterState,
    params: SidecarParams,
}

unsafe impl Send for BootArgs {}

fn start_bootstrap_thread(params: SidecarParams) -> Result<(), String> {
    let _gil = pyffi::GilGuard::acquire();
    let interp = pyffi::current_interpreter();
    let boxed = Box::new(BootArgs { interp, params });
    let raw = Box::into_raw(boxed) as *mut std::ffi::c_void;

    match pyffi::start_new_thread(boot_entry, raw) {
        Some(_ident) => Ok(()),
        None => {
            unsafe { drop(Box::from_raw(raw as *mut BootArgs)) };
            Err("PyThread_start_new_thread failed".to_string())
        }
    }
}

extern "C" fn boot_entry(raw: *mut std::ffi::c_void) {
    let boot = unsafe { Box::from_raw(raw as *mut BootArgs) };
    let mut tstate = match pyffi::OwnedThreadState::new(boot.interp) {
        Some(t) => t,
        None => {
            error!("flight-profiler-agent: not enough memory to create a thread state");
            return;
        }
    };
    tstate.acquire();

    info!("flight-profiler-agent: executing {}", boot.params.script_path.display());
    let script_path = boot.params.script_path.to_string_lossy().into_owned();
    match pyffi::run_script_file(&script_path, boot.params.port) {
        Ok(()) => {}
        Err(e) => error!("flight-profiler-agent: {}", e),
    }
    info!("flight-profiler-agent: bootstrap thread finished");

    tstate.release();
    // `OwnedThreadState::drop` re-acquires to clear and delete the thread
    // state, matching `PyThreadState_Clear` + `PyThreadState_DeleteCurrent`.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gate_matches_supported_minor() {
        std::env::remove_var("FLIGHT_PROFILER_MAX_RUNTIME_MINOR");
        assert_eq!(max_supported_minor(), SUPPORTED_RUNTIME_MINOR_MAX);
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var("FLIGHT_PROFILER_MAX_RUNTIME_MINOR", "20");
        assert_eq!(max_supported_minor(), 20);
        std::env::remove_var("FLIGHT_PROFILER_MAX_RUNTIME_MINOR");
    }
}
