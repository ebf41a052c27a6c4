//! General Kernel Memory Allocator
//!
//! Based on Mach4 kern/kalloc.c by Avadis Tevanian, Jr.
//!
//! The real kalloc carves memory out of power-of-two zones. Here the
//! backing memory comes from the global allocator and `KernelHeap` only
//! does the bookkeeping: every kernel-side allocation the IPC code makes
//! (kmsg buffers, copy objects, out-of-line port arrays, map entries,
//! dead-name tables) is charged against a heap, and a heap with a limit
//! refuses charges past it. That refusal is the crate's model of
//! `KERN_RESOURCE_SHORTAGE`.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::kern::kern_return::{KernError, KernResult};

// ============================================================================
// Kernel Heap
// ============================================================================

/// Kalloc statistics
#[derive(Debug, Default)]
pub struct KallocStats {
    /// Total allocations
    pub alloc_count: AtomicU64,
    /// Total frees
    pub free_count: AtomicU64,
    /// Refused allocations
    pub failed_count: AtomicU64,
}

/// An accounting heap for kernel allocations
pub struct KernelHeap {
    /// Byte limit (None = unlimited)
    limit: Option<usize>,
    /// Bytes currently charged
    in_use: AtomicUsize,
    /// Statistics
    pub stats: KallocStats,
}

impl KernelHeap {
    /// A heap that never refuses
    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            limit: None,
            in_use: AtomicUsize::new(0),
            stats: KallocStats::default(),
        })
    }

    /// A heap that refuses charges past `bytes`
    pub fn with_limit(bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: Some(bytes),
            in_use: AtomicUsize::new(0),
            stats: KallocStats::default(),
        })
    }

    /// Bytes currently charged
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Configured limit
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Charge `size` bytes, returning a handle that releases them on drop
    pub fn kalloc(self: &Arc<Self>, size: usize) -> Option<Kalloc> {
        if !self.charge(size) {
            self.stats.failed_count.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.stats.alloc_count.fetch_add(1, Ordering::Relaxed);
        Some(Kalloc {
            heap: Arc::clone(self),
            size,
        })
    }

    /// Like `kalloc`, reporting refusal as `KERN_RESOURCE_SHORTAGE`
    pub fn try_kalloc(self: &Arc<Self>, size: usize) -> KernResult<Kalloc> {
        self.kalloc(size).ok_or(KernError::ResourceShortage)
    }

    fn charge(&self, size: usize) -> bool {
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(size) {
                Some(n) => n,
                None => return false,
            };
            if let Some(limit) = self.limit {
                if next > limit {
                    return false;
                }
            }
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn kfree(&self, size: usize) {
        self.in_use.fetch_sub(size, Ordering::AcqRel);
        self.stats.free_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for KernelHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelHeap")
            .field("limit", &self.limit)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// A live charge against a `KernelHeap`
///
/// Dropping it is `kfree`.
pub struct Kalloc {
    heap: Arc<KernelHeap>,
    size: usize,
}

impl Kalloc {
    /// Charged size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// The heap this charge belongs to
    pub fn heap(&self) -> &Arc<KernelHeap> {
        &self.heap
    }
}

impl Drop for Kalloc {
    fn drop(&mut self) {
        self.heap.kfree(self.size);
    }
}

impl fmt::Debug for Kalloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kalloc").field("size", &self.size).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kalloc_release_on_drop() {
        let heap = KernelHeap::unlimited();
        {
            let a = heap.kalloc(128).unwrap();
            let _b = heap.kalloc(64).unwrap();
            assert_eq!(a.size(), 128);
            assert_eq!(heap.in_use(), 192);
        }
        assert_eq!(heap.in_use(), 0);
    }

    #[test]
    fn test_kalloc_limit() {
        let heap = KernelHeap::with_limit(100);
        let a = heap.kalloc(60).unwrap();
        assert!(heap.kalloc(60).is_none());
        assert_eq!(heap.try_kalloc(41).unwrap_err(), KernError::ResourceShortage);
        drop(a);
        assert!(heap.kalloc(100).is_some());
        assert_eq!(heap.stats.failed_count.load(Ordering::Relaxed), 2);
    }
}
