//! IPC Space - Per-task IPC capability namespace
//!
//! Based on Mach4 ipc/ipc_space.h
//! Every task has an IPC space containing its port capabilities.
//! The space manages a table of IpcEntry records.
//!
//! The space lock is a reader/writer lock. Lookups that only bump a port's
//! counters take it shared; anything that allocates, frees or rewrites an
//! entry takes it exclusive.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::entry::{IpcEntryTable, IE_TABLE_DEFAULT_MAX};
use super::kmsg::{ipc_kmsg_reap, IpcKmsgQueue};
use super::right::ipc_right_clean;
use crate::kern::kalloc::KernelHeap;

/// Space ID type - newtype for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SpaceId(pub u64);

/// Next space ID counter
static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

/// Lock-protected part of a space
#[derive(Debug)]
pub struct SpaceInner {
    /// Owning space
    pub id: SpaceId,
    /// Is the space alive?
    pub active: bool,
    /// Entry table
    pub table: IpcEntryTable,
}

/// IPC Space - contains all port capabilities for a task
#[derive(Debug)]
pub struct IpcSpace {
    /// Unique space identifier
    id: SpaceId,
    /// Heap the table and dead-name requests are charged to
    heap: Arc<KernelHeap>,
    /// `is_lock` and everything it protects
    inner: RwLock<SpaceInner>,
}

impl IpcSpace {
    /// Create a new IPC space
    pub fn new() -> Arc<Self> {
        Self::with_limits(KernelHeap::unlimited(), IE_TABLE_DEFAULT_MAX)
    }

    /// Create a space whose table may grow to `max_entries` slots
    pub fn with_limits(heap: Arc<KernelHeap>, max_entries: usize) -> Arc<Self> {
        let id = SpaceId(NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed));
        Arc::new(Self {
            id,
            heap: Arc::clone(&heap),
            inner: RwLock::new(SpaceInner {
                id,
                active: true,
                table: IpcEntryTable::new(heap, max_entries),
            }),
        })
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn heap(&self) -> &Arc<KernelHeap> {
        &self.heap
    }

    /// `is_read_lock`
    pub fn read(&self) -> RwLockReadGuard<'_, SpaceInner> {
        self.inner.read()
    }

    /// `is_write_lock`
    pub fn write(&self) -> RwLockWriteGuard<'_, SpaceInner> {
        self.inner.write()
    }

    pub fn is_active(&self) -> bool {
        self.read().active
    }

    /// Number of names in use
    pub fn entry_count(&self) -> usize {
        self.read().table.active_count()
    }

    /// `ipc_space_destroy`: deactivate and release every right
    pub fn destroy(&self) {
        let mut reap = IpcKmsgQueue::new();
        {
            let mut inner = self.write();
            if !inner.active {
                return;
            }
            inner.active = false;
            for name in inner.table.names() {
                ipc_right_clean(&mut inner, name, &mut reap);
                inner.table.dealloc(name);
            }
        }
        log::debug!("ipc_space_destroy: {:?}", self.id);
        ipc_kmsg_reap(&mut reap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::port_ops::{mach_port_allocate_receive, mach_port_insert_send, mach_port_lookup};

    #[test]
    fn test_space_ids_unique() {
        let a = IpcSpace::new();
        let b = IpcSpace::new();
        assert_ne!(a.id(), b.id());
        assert!(a.is_active());
    }

    #[test]
    fn test_destroy_kills_receive_rights() {
        let space = IpcSpace::new();
        let name = mach_port_allocate_receive(&space).unwrap();
        mach_port_insert_send(&space, name).unwrap();
        let port = mach_port_lookup(&space, name).unwrap();

        space.destroy();
        assert!(!space.is_active());
        assert!(!port.is_active());
        assert_eq!(space.entry_count(), 0);
    }
}
