use std::path::Path;

use libc::user_regs_struct;
use log::{debug, info};
use nix::unistd::Pid;

use crate::error::LauncherError;
use crate::introspect::ProcessIntrospector;
use crate::payload::ShellcodeImage;
use crate::tracer::{ContinueStep, RegistersStage, TargetTracer};
use flight_profiler_common::ExitCode;

/// Orchestrates a single remote load of `library_path` into `target_pid`:
/// attach, lay down the payload, drive it through malloc/dlopen/free, verify,
/// restore.
pub struct Injector {
    target_pid: Pid,
    library_path: String,
    debug: bool,
}

impl Injector {
    pub fn new(target_pid: Pid, library_path: impl Into<String>, debug: bool) -> Self {
        Injector {
            target_pid,
            library_path: library_path.into(),
            debug,
        }
    }

    pub fn perform_injection(&self) -> Result<(), (LauncherError, ExitCode)> {
        let mut tracer = TargetTracer::new(self.target_pid);
        tracer.attach().map_err(|e| self.tag(e))?;

        let original_regs = tracer
            .get_registers(RegistersStage::AfterAttach)
            .map_err(|e| self.tag(e))?;
        let mut working_regs = original_regs;

        let landing = ProcessIntrospector::find_executable_address(self.target_pid.as_raw())
            .map_err(|_| self.tag(LauncherError::AttachFailed(nix::Error::UnsupportedOperation)))?
            + 8;
        working_regs.rip = landing + 2;

        let (malloc_addr, dlopen_addr, free_addr) = self.resolve_remote_functions();
        if self.debug {
            debug!(
                "malloc=0x{:x} dlopen=0x{:x} free=0x{:x}",
                malloc_addr, dlopen_addr, free_addr
            );
        }

        let path_len = (self.library_path.len() + 1) as u64;
        working_regs.rdi = path_len;
        working_regs.rsi = free_addr;
        working_regs.rdx = dlopen_addr;
        working_regs.rcx = malloc_addr;

        tracer
            .set_registers(&working_regs)
            .map_err(|e| self.tag(e))?;

        self.run_sequence(&mut tracer, landing, &original_regs)
    }

    fn run_sequence(
        &self,
        tracer: &mut TargetTracer,
        landing: u64,
        original_regs: &user_regs_struct,
    ) -> Result<(), (LauncherError, ExitCode)> {
        let image = ShellcodeImage::build();

        let mut backup = vec![0u8; image.len()];
        if let Err(e) = tracer.read_memory(landing, &mut backup) {
            let _ = tracer.recover_injection(landing, &backup, original_regs);
            return Err(self.tag(e));
        }

        if let Err(e) = tracer.write_memory(landing, image.bytes()) {
            let _ = tracer.recover_injection(landing, &backup, original_regs);
            return Err(self.tag(LauncherError::WriteShellcodeToTargetMemoryFailed(e)));
        }

        // Trap 1: malloc.
        if let Err(e) = tracer.continue_and_wait_for_trap(ContinueStep::Malloc) {
            let _ = tracer.recover_injection(landing, &backup, original_regs);
            return Err(self.tag(e));
        }
        let malloc_regs = match tracer.get_registers(RegistersStage::AfterMalloc) {
            Ok(r) => r,
            Err(e) => {
                let _ = tracer.recover_injection(landing, &backup, original_regs);
                return Err(self.tag(e));
            }
        };
        let target_buffer = malloc_regs.rax;
        if target_buffer == 0 {
            let _ = tracer.recover_injection(landing, &backup, original_regs);
            return Err(self.tag(LauncherError::MallocReturnZero));
        }

        // Write the library path into the target-allocated buffer.
        let mut path_bytes = self.library_path.clone().into_bytes();
        path_bytes.push(0);
        if let Err(e) = tracer.write_memory(target_buffer, &path_bytes) {
            let _ = tracer.recover_injection(landing, &backup, original_regs);
            return Err(self.tag(LauncherError::WriteLibraryStrToTargetMemoryFailed(e)));
        }

        // Trap 2: dlopen.
        if let Err(e) = tracer.continue_and_wait_for_trap(ContinueStep::Dlopen) {
            let _ = tracer.recover_injection(landing, &backup, original_regs);
            return Err(self.tag(e));
        }
        let dlopen_regs = match tracer.get_registers(RegistersStage::AfterDlopen) {
            Ok(r) => r,
            Err(e) => {
                let _ = tracer.recover_injection(landing, &backup, original_regs);
                return Err(self.tag(e));
            }
        };
        if dlopen_regs.rax == 0 {
            let _ = tracer.recover_injection(landing, &backup, original_regs);
            return Err(self.tag(LauncherError::DlopenReturnZero));
        }

        // Trap 3: free.
        if let Err(e) = tracer.continue_and_wait_for_trap(ContinueStep::Free) {
            let _ = tracer.recover_injection(landing, &backup, original_regs);
            return Err(self.tag(e));
        }

        self.confirm_injection_success(tracer, landing, &backup, original_regs)
    }

    fn confirm_injection_success(
        &self,
        tracer: &mut TargetTracer,
        landing: u64,
        backup: &[u8],
        original_regs: &user_regs_struct,
    ) -> Result<(), (LauncherError, ExitCode)> {
        if tracer.recover_injection(landing, backup, original_regs).is_err() {
            return Err(self.tag(LauncherError::ErrorInExecuteRecoverInjection));
        }

        let basename = Path::new(&self.library_path)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.library_path);

        match ProcessIntrospector::is_library_loaded(self.target_pid.as_raw(), basename) {
            Ok(true) => {
                info!(
                    "library {} successfully loaded in process {}",
                    self.library_path, self.target_pid
                );
                Ok(())
            }
            _ => Err(self.tag(LauncherError::ErrorInVerifySoLocation)),
        }
    }

    /// Resolve malloc/dlopen/free in the launcher's own libc, then translate
    /// each to the target's address space via the libc-base offset.
    fn resolve_remote_functions(&self) -> (u64, u64, u64) {
        let own_libc_base =
            ProcessIntrospector::libc_base(std::process::id() as i32).unwrap_or(0);
        let target_libc_base =
            ProcessIntrospector::libc_base(self.target_pid.as_raw()).unwrap_or(0);

        let malloc_local = ProcessIntrospector::resolve_local("malloc");
        let mut dlopen_local = ProcessIntrospector::resolve_local("__libc_dlopen_mode");
        if dlopen_local == 0 {
            dlopen_local = ProcessIntrospector::resolve_local("dlopen");
        }
        let free_local = ProcessIntrospector::resolve_local("free");

        let translate = |local: u64| -> u64 {
            if local == 0 || own_libc_base == 0 {
                0
            } else {
                target_libc_base + (local - own_libc_base)
            }
        };

        (
            translate(malloc_local),
            translate(dlopen_local),
            translate(free_local),
        )
    }

    fn tag(&self, err: LauncherError) -> (LauncherError, ExitCode) {
        let code = ExitCode::from(&err);
        (err, code)
    }
}
