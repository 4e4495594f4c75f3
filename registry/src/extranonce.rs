//! Extranonce1 allocation.
//!
//! Each downstream connection is handed a unique extranonce1 on
//! `mining.subscribe` so that two miners hashing the same job never search
//! the same nonce space. extranonce1 is fixed-size per instance
//! (`EXTRANONCE1_SIZE`) and is seeded with the pool's instance id in its
//! top byte so that multiple registry processes sharing a upstream daemon
//! still hand out disjoint extranonce1 ranges.

use crate::EXTRANONCE1_SIZE;
use std::sync::atomic::{AtomicU32, Ordering};

/// Hands out sequential, instance-scoped extranonce1 values.
pub struct ExtranonceCounter {
    instance_id: u8,
    next: AtomicU32,
}

impl ExtranonceCounter {
    /// `instance_id` occupies the top byte of every extranonce1 this
    /// counter produces, so operators running more than one registry
    /// process against the same coin daemon can pick disjoint ids and
    /// avoid handing out colliding extranonce1 values.
    pub fn new(instance_id: u8) -> Self {
        Self {
            instance_id,
            next: AtomicU32::new(0),
        }
    }

    /// Allocates the next extranonce1, as a fixed `EXTRANONCE1_SIZE`-byte
    /// big-endian value with `instance_id` in the top byte and a
    /// monotonically increasing counter in the remaining bytes.
    pub fn allocate(&self) -> Vec<u8> {
        let counter = self.next.fetch_add(1, Ordering::SeqCst);
        let mut bytes = vec![0u8; EXTRANONCE1_SIZE];
        bytes[0] = self.instance_id;
        let counter_bytes = counter.to_be_bytes();
        let tail = EXTRANONCE1_SIZE - 1;
        let copy_len = tail.min(counter_bytes.len());
        bytes[EXTRANONCE1_SIZE - copy_len..].copy_from_slice(&counter_bytes[counter_bytes.len() - copy_len..]);
        bytes
    }

    pub fn instance_id(&self) -> u8 {
        self.instance_id
    }
}
