use std::mem::size_of;
use std::thread::sleep;
use std::time::Duration;

use libc::{c_void, user_regs_struct};
use log::{debug, warn};
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::error::LauncherError;

/// Which of the three injection breakpoints a `continue_and_wait_for_trap`
/// call is driving the target through, so a `PTRACE_CONT` failure maps to
/// the right `ExitCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueStep {
    Malloc,
    Dlopen,
    Free,
}

impl ContinueStep {
    fn into_error(self, e: nix::Error) -> LauncherError {
        match self {
            ContinueStep::Malloc => LauncherError::ErrorInExecuteMalloc(e),
            ContinueStep::Dlopen => LauncherError::ErrorInExecuteDlopen(e),
            ContinueStep::Free => LauncherError::ErrorInExecuteFree(e),
        }
    }
}

/// Which point in the sequence a `get_registers` call is reading at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistersStage {
    AfterAttach,
    AfterMalloc,
    AfterDlopen,
}

impl RegistersStage {
    fn into_error(self, e: nix::Error) -> LauncherError {
        match self {
            RegistersStage::AfterAttach => LauncherError::GetRegistersAfterAttachFailed(e),
            RegistersStage::AfterMalloc => LauncherError::GetMallocRegistersFailed(e),
            RegistersStage::AfterDlopen => LauncherError::GetDlopenRegistersFailed(e),
        }
    }
}

const WORD_SIZE: usize = size_of::<i64>();
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(5);
const SIGNAL_POLL_ATTEMPTS: u32 = 100;

/// Owns one ptrace session on one target. Every public method maps onto one
/// debug-channel primitive: attach, continue, wait-for-trap, get/set
/// registers, read/write memory, detach.
///
/// Not `Send` by construction (a `Pid` is only meaningful to the thread that
/// attached it) and the launcher is single-threaded throughout, so no
/// synchronisation is needed here.
pub struct TargetTracer {
    pid: Pid,
    attached: bool,
}

impl TargetTracer {
    pub fn new(pid: Pid) -> Self {
        TargetTracer {
            pid,
            attached: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// PTRACE_ATTACH, then wait for the kernel to actually report the stop.
    pub fn attach(&mut self) -> Result<(), LauncherError> {
        ptrace::attach(self.pid).map_err(LauncherError::AttachFailed)?;
        match waitpid(self.pid, None) {
            Ok(WaitStatus::Stopped(_, _)) => {
                self.attached = true;
                Ok(())
            }
            Ok(other) => {
                warn!("unexpected wait status right after attach: {:?}", other);
                self.attached = true;
                Ok(())
            }
            Err(e) => Err(LauncherError::AttachFailed(e)),
        }
    }

    /// PTRACE_DETACH. A no-op if we were never attached.
    pub fn detach(&mut self) {
        if !self.attached {
            return;
        }
        if let Err(e) = ptrace::detach(self.pid, None) {
            warn!("detach failed for pid {}: {}", self.pid, e);
        }
        self.attached = false;
    }

    /// `stage` picks which `ExitCode` a `PTRACE_GETREGS` failure maps to —
    /// the same primitive is used right after attach and right after each of
    /// the three injection traps, each with its own code.
    pub fn get_registers(&self, stage: RegistersStage) -> Result<user_regs_struct, LauncherError> {
        ptrace::getregs(self.pid).map_err(|e| stage.into_error(e))
    }

    pub fn set_registers(&self, regs: &user_regs_struct) -> Result<(), LauncherError> {
        ptrace::setregs(self.pid, *regs)
            .map_err(LauncherError::SetInjectedShellcodeRegistersFailed)
    }

    /// Word-at-a-time PTRACE_PEEKTEXT; `buf.len()` is rounded up to the next
    /// machine word internally, callers must size `buf` accordingly.
    pub fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<(), LauncherError> {
        let word_count = (buf.len() + WORD_SIZE - 1) / WORD_SIZE;
        for i in 0..word_count {
            let word_addr = addr + (i * WORD_SIZE) as u64;
            let word = ptrace::read(self.pid, word_addr as ptrace::AddressType)
                .map_err(LauncherError::ReadTargetMemoryFailed)?;
            let bytes = word.to_ne_bytes();
            let start = i * WORD_SIZE;
            let end = (start + WORD_SIZE).min(buf.len());
            buf[start..end].copy_from_slice(&bytes[..end - start]);
        }
        Ok(())
    }

    /// Word-at-a-time PTRACE_POKETEXT. If `data.len()` is not a whole number
    /// of words, the last partial word is read-modify-written so bytes past
    /// the caller's slice are preserved.
    ///
    /// Returns the raw `nix::Error` rather than a `LauncherError` because
    /// this same primitive backs writes that must surface under different
    /// exit codes depending on what's being written (the shellcode image vs.
    /// the library path string) — callers pick the right variant.
    pub fn write_memory(&self, addr: u64, data: &[u8]) -> Result<(), nix::Error> {
        let word_count = (data.len() + WORD_SIZE - 1) / WORD_SIZE;
        for i in 0..word_count {
            let word_addr = addr + (i * WORD_SIZE) as u64;
            let start = i * WORD_SIZE;
            let end = (start + WORD_SIZE).min(data.len());
            let word = if end - start == WORD_SIZE {
                i64::from_ne_bytes(data[start..end].try_into().unwrap())
            } else {
                let existing = ptrace::read(self.pid, word_addr as ptrace::AddressType)?;
                let mut bytes = existing.to_ne_bytes();
                bytes[..end - start].copy_from_slice(&data[start..end]);
                i64::from_ne_bytes(bytes)
            };
            ptrace::write(
                self.pid,
                word_addr as ptrace::AddressType,
                word as *mut c_void,
            )?;
        }
        Ok(())
    }

    /// PTRACE_CONT, then poll for the next trap. Any stop that is not
    /// `SIGTRAP` is treated as the target having diverged from what the
    /// injector assumes — we forcibly stop it and report a fatal mismatch;
    /// callers propagate this up to `main`, which exits immediately.
    /// `on_cont_err` maps a `PTRACE_CONT` failure to the specific step the
    /// caller is at (malloc, dlopen, or free; see `ContinueStep`).
    pub fn continue_and_wait_for_trap(
        &self,
        step: ContinueStep,
    ) -> Result<(), LauncherError> {
        ptrace::cont(self.pid, None).map_err(|e| step.into_error(e))?;
        let siginfo = self.poll_signal_info()?;
        self.verify_signal_status(siginfo)
    }

    fn poll_signal_info(&self) -> Result<libc::siginfo_t, LauncherError> {
        sleep(SIGNAL_POLL_INTERVAL);
        for attempt in 0..SIGNAL_POLL_ATTEMPTS {
            match ptrace::getsiginfo(self.pid) {
                Ok(info) => return Ok(info),
                Err(_) => {
                    debug!("getsiginfo attempt {} not ready yet", attempt);
                    sleep(SIGNAL_POLL_INTERVAL);
                }
            }
        }
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        info.si_signo = -1;
        Ok(info)
    }

    fn verify_signal_status(&self, info: libc::siginfo_t) -> Result<(), LauncherError> {
        if info.si_signo == Signal::SIGTRAP as i32 {
            return Ok(());
        }
        warn!(
            "target stopped with unexpected signal {} instead of SIGTRAP; forcibly stopping",
            info.si_signo
        );
        let _ = kill(self.pid, Signal::SIGSTOP);
        std::process::exit(1);
    }

    /// Best-effort restoration: write memory back, restore registers,
    /// detach. Every step is attempted even if an earlier one failed; the
    /// caller already knows injection failed and just wants the target left
    /// in as close to its original state as possible.
    pub fn recover_injection(
        &mut self,
        addr: u64,
        backup: &[u8],
        original_regs: &user_regs_struct,
    ) -> Result<(), LauncherError> {
        let mut ok = true;
        if let Err(e) = self.write_memory(addr, backup) {
            warn!("recover_injection: failed to restore memory: {}", e);
            ok = false;
        }
        if let Err(e) = self.set_registers(original_regs) {
            warn!("recover_injection: failed to restore registers: {}", e);
            ok = false;
        }
        self.detach();
        if ok {
            Ok(())
        } else {
            Err(LauncherError::ErrorInExecuteRecoverInjection)
        }
    }
}

impl Drop for TargetTracer {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Child, Command};

    fn spawn_sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("failed to spawn test fixture process")
    }

    #[test]
    fn attach_read_registers_detach_round_trips() {
        let mut child = spawn_sleeper();
        let pid = Pid::from_raw(child.id() as i32);
        let mut tracer = TargetTracer::new(pid);
        tracer.attach().expect("attach should succeed on a live child");
        let regs = tracer
            .get_registers(RegistersStage::AfterAttach)
            .expect("registers should be readable");
        assert_ne!(regs.rip, 0);
        tracer.detach();
        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn memory_write_then_read_back_round_trips() {
        let mut child = spawn_sleeper();
        let pid = Pid::from_raw(child.id() as i32);
        let mut tracer = TargetTracer::new(pid);
        tracer.attach().unwrap();
        let regs = tracer.get_registers(RegistersStage::AfterAttach).unwrap();
        let addr = regs.rip & !0xfff;
        let mut original = [0u8; 16];
        tracer.read_memory(addr, &mut original).unwrap();
        let payload = [0xAAu8; 16];
        tracer.write_memory(addr, &payload).unwrap();
        let mut readback = [0u8; 16];
        tracer.read_memory(addr, &mut readback).unwrap();
        assert_eq!(readback, payload);
        tracer.write_memory(addr, &original).unwrap();
        tracer.detach();
        let _ = child.kill();
        let _ = child.wait();
    }
}
