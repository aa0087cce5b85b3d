//! The position-independent instruction sequence that gets copied into the
//! target process and run under ptrace control to call `malloc`, `dlopen`,
//! and `free` in turn, each separated by a trap back to the tracer.
//!
//! Register roles here are **not** the normal SysV C calling convention —
//! this code is never `call`ed, it is jumped into directly by setting the
//! target's `rip` (see `injector::Injector`), after the launcher has already
//! written the four working registers itself:
//!
//! - `rdi` = length of the library path string to `malloc`
//! - `rsi` = address of `free` in the target
//! - `rdx` = address of `dlopen` (or `__libc_dlopen_mode`) in the target
//! - `rcx` = address of `malloc` in the target
//!
//! The sequence below threads the `malloc` result through to `dlopen`'s
//! first argument, hard-codes `RTLD_LAZY` as the second, and finally frees
//! the allocated buffer, stopping at an `int3` after each call.

use std::arch::global_asm;

extern "C" {
    fn inject_shared_library();
    fn inject_shared_library_end();
}

global_asm!(
    ".global inject_shared_library",
    ".global inject_shared_library_end",
    "inject_shared_library:",
    "and $0xfffffffffffffff0, %rsp",
    "push %r9",
    "push %r8",
    "push %rsi",
    "push %rdx",
    "mov %rcx, %r8",
    "callq *%r8",
    "int $3",
    "pop %r8",
    "push %rax",
    "mov %rax, %rdi",
    "mov $0x1, %rsi",
    "callq *%r8",
    "int $3",
    "pop %rdi",
    "pop %r8",
    "xor %rsi, %rsi",
    "callq *%r8",
    "pop %r8",
    "pop %r9",
    "ret",
    "inject_shared_library_end:",
    "nop",
    options(att_syntax)
);

/// Two leading NOPs absorb the kernel rewinding `rip` by two bytes when the
/// target was stopped mid syscall; the template body follows; the last
/// byte of the body (the `ret` above) is then overwritten with `0xcc`.
pub struct ShellcodeImage {
    bytes: Vec<u8>,
    pub int3_count: usize,
}

impl ShellcodeImage {
    /// Build the payload buffer the same way `createShellcodePayload` does:
    /// two NOPs, the raw template bytes, then the template's trailing
    /// return instruction replaced by `int3`.
    pub fn build() -> Self {
        let start = inject_shared_library as usize;
        let end = inject_shared_library_end as usize;
        let template_len = end - start;

        let mut bytes = vec![0x90u8, 0x90u8];
        let template = unsafe { std::slice::from_raw_parts(start as *const u8, template_len) };
        bytes.extend_from_slice(template);

        let return_addr = crate::introspect::ProcessIntrospector::find_return_opcode(end as u64);
        let return_offset = (return_addr as usize - start) + 2;
        bytes[return_offset] = 0xcc;

        ShellcodeImage {
            bytes,
            int3_count: 3,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_starts_with_two_nops_and_ends_with_int3() {
        let image = ShellcodeImage::build();
        assert_eq!(&image.bytes()[0..2], &[0x90, 0x90]);
        assert!(image.bytes().len() > 20);
        assert!(image.bytes().contains(&0xcc));
    }
}
