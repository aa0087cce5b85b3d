use std::sync::atomic::{AtomicU64, Ordering};

/// Converts an offline symbol address (the controller resolved it with `nm`
/// against the target's on-disk binary, before the process was ever
/// attached to) into a live in-process address, using the base-address
/// offset the sidecar file carried in.
///
/// One process-wide instance: `set_offset` is called exactly once by
/// `AgentBootstrap` before any `resolve` call, so a relaxed atomic is enough
/// — there is no concurrent writer to order against, only the one-time
/// publish.
static OFFSET: AtomicU64 = AtomicU64::new(0);

pub fn set_offset(offset: u64) {
    OFFSET.store(offset, Ordering::Relaxed);
}

pub fn resolve(addr: u64) -> u64 {
    OFFSET.load(Ordering::Relaxed).wrapping_add(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_adds_the_published_offset() {
        set_offset(0x1000);
        assert_eq!(resolve(0x20), 0x1020);
        set_offset(0);
    }
}
