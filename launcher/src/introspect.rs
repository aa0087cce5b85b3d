use std::ffi::CString;
use std::fs;
use std::io;

use libc::RTLD_LAZY;

const LIBC_NAME_PATTERNS: [&str; 3] = ["libc-", "libc.so.", "libc.musl-"];
const RETURN_OPCODE: u8 = 0xc3;

/// Pure reads of `/proc/<pid>/maps` plus local dynamic-symbol resolution.
/// Nothing here touches the target's execution state.
pub struct ProcessIntrospector;

impl ProcessIntrospector {
    /// First executable mapping's start address — the landing pad for the
    /// injection payload.
    pub fn find_executable_address(pid: i32) -> io::Result<u64> {
        for line in read_maps(pid)?.lines() {
            if let Some(entry) = MapsEntry::parse(line) {
                if entry.perms.contains('x') {
                    return Ok(entry.start);
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no executable mapping found in target",
        ))
    }

    /// Low address of the mapping backing the target's C library, matched
    /// by pathname against the known libc naming variants.
    pub fn libc_base(pid: i32) -> io::Result<u64> {
        for line in read_maps(pid)?.lines() {
            if let Some(entry) = MapsEntry::parse(line) {
                if LIBC_NAME_PATTERNS
                    .iter()
                    .any(|pat| entry.pathname.contains(pat))
                {
                    return Ok(entry.start);
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no libc mapping found in target",
        ))
    }

    /// Substring search of the target's memory map, used to confirm the
    /// agent library actually loaded.
    pub fn is_library_loaded(pid: i32, name: &str) -> io::Result<bool> {
        Ok(read_maps(pid)?.lines().any(|line| line.contains(name)))
    }

    /// Resolve `name` in the *launcher's own* libc via `dlopen`/`dlsym`,
    /// returning 0 if the symbol is absent.
    pub fn resolve_local(name: &str) -> u64 {
        unsafe {
            let libc_path = CString::new("libc.so.6").unwrap();
            let handle = libc::dlopen(libc_path.as_ptr(), RTLD_LAZY);
            if handle.is_null() {
                return 0;
            }
            let sym_name = match CString::new(name) {
                Ok(s) => s,
                Err(_) => {
                    libc::dlclose(handle);
                    return 0;
                }
            };
            let addr = libc::dlsym(handle, sym_name.as_ptr());
            libc::dlclose(handle);
            addr as u64
        }
    }

    /// Scan backward from `end_addr` for the target-ABI return opcode
    /// (`0xc3` on x86-64), locating the exact last instruction of the
    /// payload template so it can be replaced by a trap.
    pub fn find_return_opcode(end_addr: u64) -> u64 {
        let mut addr = end_addr;
        loop {
            let byte = unsafe { *(addr as *const u8) };
            if byte == RETURN_OPCODE {
                return addr;
            }
            addr -= 1;
        }
    }
}

fn read_maps(pid: i32) -> io::Result<String> {
    fs::read_to_string(format!("/proc/{}/maps", pid))
}

struct MapsEntry {
    start: u64,
    perms: String,
    pathname: String,
}

impl MapsEntry {
    fn parse(line: &str) -> Option<MapsEntry> {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?.to_string();
        let start_str = range.split('-').next()?;
        let start = u64::from_str_radix(start_str, 16).ok()?;
        let pathname = fields.nth(3).unwrap_or("").to_string();
        Some(MapsEntry {
            start,
            perms,
            pathname,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_realistic_maps_line() {
        let line = "7f1234500000-7f1234521000 r-xp 00000000 08:01 131082 /usr/lib/x86_64-linux-gnu/libc-2.31.so";
        let entry = MapsEntry::parse(line).unwrap();
        assert_eq!(entry.start, 0x7f1234500000);
        assert_eq!(entry.perms, "r-xp");
        assert!(entry.pathname.contains("libc-2.31.so"));
    }

    #[test]
    fn resolve_local_finds_malloc() {
        let addr = ProcessIntrospector::resolve_local("malloc");
        assert_ne!(addr, 0);
    }

    #[test]
    fn resolve_local_returns_zero_for_nonexistent_symbol() {
        let addr = ProcessIntrospector::resolve_local("this_symbol_does_not_exist_anywhere_xyz");
        assert_eq!(addr, 0);
    }

    #[test]
    fn libc_base_found_for_self() {
        let pid = std::process::id() as i32;
        let base = ProcessIntrospector::libc_base(pid);
        assert!(base.is_ok());
    }
}
