//! Processor State
//!
//! Based on Mach4 kern/processor.h
//!
//! Only the part of the processor structure the IPC code touches is kept:
//! the per-processor kmsg cache (`ikm_cache`) and the kernel heap buffers
//! are charged to. A `Processor` is owned by one worker at a time and is
//! passed explicitly to the kmsg pool routines, so the cache needs no lock.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::ipc::kmsg::IpcKmsg;
use crate::kern::kalloc::KernelHeap;

/// Per-processor state
#[derive(Debug)]
pub struct Processor {
    /// Processor number
    id: u32,
    /// Heap kmsg buffers are charged to
    heap: Arc<KernelHeap>,
    /// Single spare kmsg of the common size
    ikm_cache: Option<Box<IpcKmsg>>,
}

impl Processor {
    /// Create a processor drawing on `heap`
    pub fn new(id: u32, heap: Arc<KernelHeap>) -> Self {
        Self {
            id,
            heap,
            ikm_cache: None,
        }
    }

    /// Processor number
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Heap kmsg buffers are charged to
    pub fn heap(&self) -> &Arc<KernelHeap> {
        &self.heap
    }

    /// Take the cached kmsg, leaving the slot empty
    pub fn ikm_cache_take(&mut self) -> Option<Box<IpcKmsg>> {
        self.ikm_cache.take()
    }

    /// Store `kmsg` in the cache slot, returning the previous occupant
    pub fn ikm_cache_replace(&mut self, kmsg: Box<IpcKmsg>) -> Option<Box<IpcKmsg>> {
        self.ikm_cache.replace(kmsg)
    }

    /// Whether the cache slot holds a kmsg
    pub fn ikm_cache_occupied(&self) -> bool {
        self.ikm_cache.is_some()
    }
}
