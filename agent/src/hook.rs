//! A minimal function-wrapping code-splicing layer: attach a pre-call and a
//! post-call callback around an arbitrary native, `void`-returning entry
//! point.
//!
//! Frida's `GumInterceptor` is a full code-relocating splicer with
//! general-purpose `onEnter`/`onLeave` wrapping; none of this workspace's
//! dependency stack ships a Rust binding for anything like it, so this
//! module hand-rolls only the one shape the lock monitor actually needs —
//! wrap one function's entry and return — the same way the injector (`L3`)
//! commits raw instruction bytes into live memory under explicit control,
//! rather than by pulling in a disassembler.
//!
//! Mechanism, per installed hook:
//! 1. Back up the first [`PATCH_LEN`] bytes at the target address.
//! 2. Allocate an executable trampoline slot with an *enter stub* and a
//!    *leave stub*. The enter stub calls [`on_enter_trampoline`], replays
//!    the stolen prologue bytes, then jumps back into the target past the
//!    patched region. The leave stub calls [`on_leave_trampoline`] and jumps
//!    to whatever real return address that call hands back.
//! 3. Overwrite the target's first [`PATCH_LEN`] bytes with an indirect
//!    jump into the enter stub.
//!
//! At call time: the caller's `call target_addr` pushes its real return
//! address and jumps into our patched prologue, landing in the enter stub
//! with that return address still on top of the stack and untouched. The
//! enter stub pops it, stashes it on a per-thread LIFO stack (so nested or
//! recursive calls unwind correctly), and pushes the leave stub's address in
//! its place before replaying the stolen bytes and returning control to the
//! target function's body. When that body eventually executes its own
//! `ret`, control lands in the leave stub instead of the real caller; the
//! leave stub fires the post-call callback, pops the stashed real address,
//! and jumps there.
//!
//! Limitations, acceptable for this crate's one use (wrapping `take_gil` and
//! `drop_gil`, both `void`): relocating the stolen prologue bytes verbatim
//! is only safe if none of them are RIP-relative, and the enter stub
//! clobbers `rax`/`rcx` (scratch) and briefly saves/restores `rdi`/`rsi`,
//! which covers the zero- or one-pointer-argument shape these targets have
//! but is not a general-purpose calling-convention-preserving splicer.

use std::collections::HashMap;
use std::sync::Mutex;

use libc::{c_void, mprotect, MAP_ANONYMOUS, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};

/// Bytes stolen from the target's prologue and replaced by an indirect
/// jump: `FF 25 00 00 00 00` (`jmp qword [rip+0]`) plus the 8-byte absolute
/// trampoline address.
pub const PATCH_LEN: usize = 14;

const PAGE_SIZE: usize = 4096;

pub type HookCallback = extern "C" fn();

struct InstalledHook {
    target_addr: usize,
    original_bytes: [u8; PATCH_LEN],
    trampoline_page: *mut u8,
}

unsafe impl Send for InstalledHook {}

struct Registry {
    hooks: HashMap<u32, InstalledHook>,
    callbacks: HashMap<u32, (HookCallback, HookCallback)>,
    next_id: u32,
}

lazy_static::lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry {
        hooks: HashMap::new(),
        callbacks: HashMap::new(),
        next_id: 0,
    });
}

thread_local! {
    /// Per-thread LIFO of real return addresses, pushed by the enter stub
    /// and popped by the leave stub; correct as long as calls into a hooked
    /// function return in the order they were entered, which is always true
    /// for a single thread.
    static RETURN_STACK: std::cell::RefCell<Vec<u64>> = std::cell::RefCell::new(Vec::new());
}

/// Atomic install/uninstall across a set of target addresses, mirroring
/// `gum_interceptor_begin_transaction`/`end_transaction` — A4 uses this to
/// patch `take_gil` and `drop_gil` together or not at all.
pub struct HookTransaction {
    installed: Vec<u32>,
    failed: bool,
}

impl HookTransaction {
    pub fn begin() -> Self {
        HookTransaction {
            installed: Vec::new(),
            failed: false,
        }
    }

    pub fn attach(
        &mut self,
        target_addr: usize,
        on_enter: HookCallback,
        on_leave: HookCallback,
    ) -> Option<u32> {
        if self.failed || target_addr == 0 {
            self.failed = true;
            return None;
        }
        match install(target_addr, on_enter, on_leave) {
            Some(id) => {
                self.installed.push(id);
                Some(id)
            }
            None => {
                self.failed = true;
                None
            }
        }
    }

    /// Commits if every `attach` call succeeded; otherwise rolls back
    /// everything installed so far and returns `false`.
    pub fn commit(self) -> bool {
        if self.failed {
            for id in &self.installed {
                uninstall(*id);
            }
            false
        } else {
            true
        }
    }
}

pub fn uninstall_all(ids: &[u32]) {
    for id in ids {
        uninstall(*id);
    }
}

fn install(target_addr: usize, on_enter: HookCallback, on_leave: HookCallback) -> Option<u32> {
    let mut original_bytes = [0u8; PATCH_LEN];
    unsafe {
        std::ptr::copy_nonoverlapping(
            target_addr as *const u8,
            original_bytes.as_mut_ptr(),
            PATCH_LEN,
        );
    }

    let trampoline_page = alloc_executable_page()?;

    let mut reg = REGISTRY.lock().unwrap();
    let id = reg.next_id;
    reg.next_id += 1;

    unsafe {
        emit_trampoline(trampoline_page, id, target_addr, &original_bytes);
    }

    if !patch_prologue(target_addr, trampoline_page as usize) {
        unsafe {
            free_executable_page(trampoline_page);
        }
        return None;
    }

    reg.hooks.insert(
        id,
        InstalledHook {
            target_addr,
            original_bytes,
            trampoline_page,
        },
    );
    reg.callbacks.insert(id, (on_enter, on_leave));
    Some(id)
}

fn uninstall(id: u32) {
    let mut reg = REGISTRY.lock().unwrap();
    if let Some(hook) = reg.hooks.remove(&id) {
        unsafe {
            restore_prologue(hook.target_addr, &hook.original_bytes);
            free_executable_page(hook.trampoline_page);
        }
    }
    reg.callbacks.remove(&id);
}

fn alloc_executable_page() -> Option<*mut u8> {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            PAGE_SIZE,
            PROT_READ | PROT_WRITE | PROT_EXEC,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        None
    } else {
        Some(addr as *mut u8)
    }
}

unsafe fn free_executable_page(page: *mut u8) {
    libc::munmap(page as *mut c_void, PAGE_SIZE);
}

/// Lays out the enter stub at offset 0 and the leave stub right after the
/// stolen bytes, all within one page.
unsafe fn emit_trampoline(
    page: *mut u8,
    hook_id: u32,
    target_addr: usize,
    original_bytes: &[u8; PATCH_LEN],
) {
    let mut cursor = page;

    // --- enter stub ---
    write_u8(&mut cursor, 0x57); // push rdi
    write_u8(&mut cursor, 0x56); // push rsi
    write_u8(&mut cursor, 0x50); // push rax

    write_u8(&mut cursor, 0xbf); // mov edi, hook_id
    write_u32(&mut cursor, hook_id);
    write_u8(&mut cursor, 0x48); // movabs rax, on_enter_trampoline
    write_u8(&mut cursor, 0xb8);
    write_u64(&mut cursor, on_enter_trampoline as usize as u64);
    write_u8(&mut cursor, 0xff); // call rax
    write_u8(&mut cursor, 0xd0);

    write_u8(&mut cursor, 0x58); // pop rax
    write_u8(&mut cursor, 0x5e); // pop rsi
    write_u8(&mut cursor, 0x5f); // pop rdi

    // The real caller's return address is still sitting untouched at
    // [rsp]: pop it into rax, stash it on this thread's return stack, then
    // push the leave stub's address in its place.
    write_u8(&mut cursor, 0x58); // pop rax  (rax = real return address)
    write_u8(&mut cursor, 0x57); // push rdi (preserve again across the stash call)
    write_u8(&mut cursor, 0x48); // mov rdi, rax
    write_u8(&mut cursor, 0x89);
    write_u8(&mut cursor, 0xc7);
    write_u8(&mut cursor, 0x48); // movabs rax, stash_return_address
    write_u8(&mut cursor, 0xb8);
    write_u64(&mut cursor, stash_return_address as usize as u64);
    write_u8(&mut cursor, 0xff); // call rax
    write_u8(&mut cursor, 0xd0);
    write_u8(&mut cursor, 0x5f); // pop rdi

    let leave_stub_placeholder_patch_site = (); // leave stub address filled in below
    let _ = leave_stub_placeholder_patch_site;

    // Stolen prologue bytes are emitted right after the enter stub; the
    // leave stub's address is computed once we know where they end, so we
    // reserve the push-leave-stub-address instruction now and patch the
    // immediate after laying out the rest.
    write_u8(&mut cursor, 0x48); // movabs rax, <leave_stub, patched below>
    write_u8(&mut cursor, 0xb8);
    let leave_stub_imm_site = cursor;
    write_u64(&mut cursor, 0); // placeholder
    write_u8(&mut cursor, 0x50); // push rax

    std::ptr::copy_nonoverlapping(original_bytes.as_ptr(), cursor, PATCH_LEN);
    cursor = cursor.add(PATCH_LEN);

    write_u8(&mut cursor, 0x48); // movabs rax, target_addr + PATCH_LEN
    write_u8(&mut cursor, 0xb8);
    write_u64(&mut cursor, (target_addr + PATCH_LEN) as u64);
    write_u8(&mut cursor, 0xff); // jmp rax
    write_u8(&mut cursor, 0xe0);

    // --- leave stub ---
    let leave_stub_addr = cursor as u64;
    std::ptr::copy_nonoverlapping(leave_stub_addr.to_ne_bytes().as_ptr(), leave_stub_imm_site, 8);

    write_u8(&mut cursor, 0xbf); // mov edi, hook_id
    write_u32(&mut cursor, hook_id);
    write_u8(&mut cursor, 0x48); // movabs rax, on_leave_trampoline
    write_u8(&mut cursor, 0xb8);
    write_u64(&mut cursor, on_leave_trampoline as usize as u64);
    write_u8(&mut cursor, 0xff); // call rax  (returns the real address in rax)
    write_u8(&mut cursor, 0xd0);
    write_u8(&mut cursor, 0xff); // jmp rax
    write_u8(&mut cursor, 0xe0);
}

unsafe fn write_u8(cursor: &mut *mut u8, byte: u8) {
    **cursor = byte;
    *cursor = cursor.add(1);
}

unsafe fn write_u32(cursor: &mut *mut u8, value: u32) {
    std::ptr::copy_nonoverlapping(value.to_ne_bytes().as_ptr(), *cursor, 4);
    *cursor = cursor.add(4);
}

unsafe fn write_u64(cursor: &mut *mut u8, value: u64) {
    std::ptr::copy_nonoverlapping(value.to_ne_bytes().as_ptr(), *cursor, 8);
    *cursor = cursor.add(8);
}

extern "C" fn on_enter_trampoline(hook_id: u32) {
    let callback = {
        let reg = REGISTRY.lock().unwrap();
        reg.callbacks.get(&hook_id).map(|(enter, _)| *enter)
    };
    if let Some(on_enter) = callback {
        on_enter();
    }
}

extern "C" fn stash_return_address(real_addr: u64) {
    RETURN_STACK.with(|stack| stack.borrow_mut().push(real_addr));
}

/// Fires the hook's `on_leave` callback, pops this thread's stashed real
/// return address, and hands it back in `rax` for the leave stub to jump
/// to. Both `take_gil` and `drop_gil` are `void`, so clobbering `rax` here
/// (the target's own return-value register) is safe.
extern "C" fn on_leave_trampoline(hook_id: u32) -> u64 {
    let callback = {
        let reg = REGISTRY.lock().unwrap();
        reg.callbacks.get(&hook_id).map(|(_, leave)| *leave)
    };
    if let Some(on_leave) = callback {
        on_leave();
    }
    RETURN_STACK.with(|stack| stack.borrow_mut().pop().unwrap_or(0))
}

fn patch_prologue(target_addr: usize, trampoline_addr: usize) -> bool {
    unsafe {
        if !mprotect_rwx(target_addr) {
            return false;
        }
        let mut cursor = target_addr as *mut u8;
        write_u8(&mut cursor, 0xff); // jmp qword [rip+0]
        write_u8(&mut cursor, 0x25);
        write_u32(&mut cursor, 0);
        write_u64(&mut cursor, trampoline_addr as u64);
    }
    true
}

unsafe fn restore_prologue(target_addr: usize, original_bytes: &[u8; PATCH_LEN]) {
    if mprotect_rwx(target_addr) {
        std::ptr::copy_nonoverlapping(original_bytes.as_ptr(), target_addr as *mut u8, PATCH_LEN);
    }
}

unsafe fn mprotect_rwx(addr: usize) -> bool {
    let page_start = addr & !(PAGE_SIZE - 1);
    mprotect(
        page_start as *mut c_void,
        PAGE_SIZE * 2,
        PROT_READ | PROT_WRITE | PROT_EXEC,
    ) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_len_fits_the_indirect_jump_encoding() {
        assert_eq!(PATCH_LEN, 14);
    }

    #[test]
    fn return_stack_is_lifo_per_thread() {
        RETURN_STACK.with(|s| s.borrow_mut().clear());
        stash_return_address(0x1000);
        stash_return_address(0x2000);
        let reg_dummy: HashMap<u32, (HookCallback, HookCallback)> = HashMap::new();
        let _ = reg_dummy;
        assert_eq!(RETURN_STACK.with(|s| s.borrow_mut().pop()), Some(0x2000));
        assert_eq!(RETURN_STACK.with(|s| s.borrow_mut().pop()), Some(0x1000));
    }
}
