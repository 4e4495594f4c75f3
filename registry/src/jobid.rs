//! Job id allocation.
//!
//! Job ids are sent to downstream miners as opaque hex strings in
//! `mining.notify`. They only need to be unique among jobs a miner might
//! still be working on, so a small wrapping counter is enough.

use std::sync::atomic::{AtomicU32, Ordering};

/// Generates sequential job ids, formatted as lowercase hex.
///
/// The counter wraps back to 1 once it reaches `0xFFFF`, not `0x10000` --
/// this mirrors the upstream daemon's own job counter behavior, which
/// miners and proxies in the wild have been observed to depend on, so we
/// keep the same wrap point rather than "fixing" it to a full 16-bit
/// range.
pub struct JobIdGenerator {
    counter: AtomicU32,
}

impl Default for JobIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl JobIdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(1),
        }
    }

    pub fn next(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        if id >= 0xFFFF {
            // This call itself crosses the boundary: it must hand out
            // "1", not the stale pre-increment value, so the reset and
            // the formatted result agree on what this call returned.
            self.counter.store(1, Ordering::SeqCst);
            return "1".to_string();
        }
        format!("{id:x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase_monotonically_until_wrap() {
        let gen = JobIdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        assert_ne!(a, b);
    }

    #[test]
    fn wraps_to_one_at_0xffff() {
        let gen = JobIdGenerator::new();
        gen.counter.store(0xFFFE, Ordering::SeqCst);
        let near_wrap = gen.next();
        assert_eq!(near_wrap, format!("{:x}", 0xFFFEu32));
        let wrapped = gen.next();
        assert_eq!(wrapped, "1");
    }
}
