//! Kernel Performance Counters
//!
//! Based on Mach4 kern/counters.h/c by CMU (1987-1991)
//!
//! Counts which paths the IPC message engine takes. The header copyin and
//! copyout routines each have a handful of fast paths; these counters show
//! how often each one fires versus falling back to the general path.

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// Mach counter type (atomically updated)
#[derive(Debug)]
pub struct MachCounter {
    value: AtomicU64,
    name: &'static str,
}

impl MachCounter {
    /// Create a new counter
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero
    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    /// Get counter name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Whether counters are enabled
pub const MACH_COUNTERS_ENABLED: bool = true;

/// Increment counter (only if counters enabled)
#[macro_export]
macro_rules! counter {
    ($counter:expr) => {
        if $crate::kern::counters::MACH_COUNTERS_ENABLED {
            $counter.inc();
        }
    };
}

// ============================================================================
// IPC Message Counters
// ============================================================================

/// Header copyin: one-way copy-send
pub static C_IPC_KMSG_COPYIN_HEADER_FAST_ASYNC: MachCounter =
    MachCounter::new("ipc_kmsg_copyin_header_fast_async");
/// Header copyin: RPC request (copy-send, make-send-once)
pub static C_IPC_KMSG_COPYIN_HEADER_FAST_REQUEST: MachCounter =
    MachCounter::new("ipc_kmsg_copyin_header_fast_request");
/// Header copyin: RPC reply (move-send-once)
pub static C_IPC_KMSG_COPYIN_HEADER_FAST_REPLY: MachCounter =
    MachCounter::new("ipc_kmsg_copyin_header_fast_reply");
/// Header copyin: general path
pub static C_IPC_KMSG_COPYIN_HEADER_SLOW: MachCounter =
    MachCounter::new("ipc_kmsg_copyin_header_slow");

/// Header copyout: one-way send
pub static C_IPC_KMSG_COPYOUT_HEADER_FAST_ASYNC: MachCounter =
    MachCounter::new("ipc_kmsg_copyout_header_fast_async");
/// Header copyout: RPC request
pub static C_IPC_KMSG_COPYOUT_HEADER_FAST_REQUEST: MachCounter =
    MachCounter::new("ipc_kmsg_copyout_header_fast_request");
/// Header copyout: RPC reply
pub static C_IPC_KMSG_COPYOUT_HEADER_FAST_REPLY: MachCounter =
    MachCounter::new("ipc_kmsg_copyout_header_fast_reply");
/// Header copyout: general path
pub static C_IPC_KMSG_COPYOUT_HEADER_SLOW: MachCounter =
    MachCounter::new("ipc_kmsg_copyout_header_slow");

/// Kmsg buffers taken from a processor cache
pub static C_IPC_KMSG_CACHE_HITS: MachCounter = MachCounter::new("ipc_kmsg_cache_hits");
/// Kmsg buffers allocated from the heap
pub static C_IPC_KMSG_CACHE_MISSES: MachCounter = MachCounter::new("ipc_kmsg_cache_misses");

/// Snapshot of the IPC counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpcCounterSnapshot {
    pub copyin_fast_async: u64,
    pub copyin_fast_request: u64,
    pub copyin_fast_reply: u64,
    pub copyin_slow: u64,
    pub copyout_fast_async: u64,
    pub copyout_fast_request: u64,
    pub copyout_fast_reply: u64,
    pub copyout_slow: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Take a snapshot of the IPC counters
pub fn ipc_counters() -> IpcCounterSnapshot {
    IpcCounterSnapshot {
        copyin_fast_async: C_IPC_KMSG_COPYIN_HEADER_FAST_ASYNC.get(),
        copyin_fast_request: C_IPC_KMSG_COPYIN_HEADER_FAST_REQUEST.get(),
        copyin_fast_reply: C_IPC_KMSG_COPYIN_HEADER_FAST_REPLY.get(),
        copyin_slow: C_IPC_KMSG_COPYIN_HEADER_SLOW.get(),
        copyout_fast_async: C_IPC_KMSG_COPYOUT_HEADER_FAST_ASYNC.get(),
        copyout_fast_request: C_IPC_KMSG_COPYOUT_HEADER_FAST_REQUEST.get(),
        copyout_fast_reply: C_IPC_KMSG_COPYOUT_HEADER_FAST_REPLY.get(),
        copyout_slow: C_IPC_KMSG_COPYOUT_HEADER_SLOW.get(),
        cache_hits: C_IPC_KMSG_CACHE_HITS.get(),
        cache_misses: C_IPC_KMSG_CACHE_MISSES.get(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_basic() {
        static C: MachCounter = MachCounter::new("test");
        assert_eq!(C.name(), "test");
        counter!(C);
        counter!(C);
        assert_eq!(C.get(), 2);
        C.reset();
        assert_eq!(C.get(), 0);
    }
}
