//! IPC Entry - Port name to capability translation
//!
//! Based on Mach4 ipc/ipc_entry.h
//! Each ipc_entry records a capability (port right) in a task's IPC space.
//! Entries are stored in a table indexed by port name.
//!
//! A name is `index | generation << 24`. The generation changes every time
//! a slot is reused, so a stale name does not silently find a new right.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::port::IpcPort;
use crate::kern::kalloc::{Kalloc, KernelHeap};
use crate::kern::kern_return::{KernError, KernResult};

/// Port name type - the user-visible handle to a port capability
pub type MachPortName = u32;

/// Port index - position in the entry table
pub type MachPortIndex = u32;

/// Entry bits field type
pub type IpcEntryBits = u32;

/// Dead-name request index (0 = none)
pub type IpcPortRequestIndex = u32;

/// The null name
pub const MACH_PORT_NULL: MachPortName = 0;

/// The dead name
pub const MACH_PORT_DEAD: MachPortName = !0;

/// Whether `name` could denote an entry
#[inline]
pub const fn mach_port_valid(name: MachPortName) -> bool {
    name != MACH_PORT_NULL && name != MACH_PORT_DEAD
}

/// Table index of a name
#[inline]
pub const fn mach_port_index(name: MachPortName) -> MachPortIndex {
    name & !IE_BITS_GEN_MASK
}

/// Generation of a name, in entry-bits position
#[inline]
pub const fn mach_port_gen(name: MachPortName) -> IpcEntryBits {
    name & IE_BITS_GEN_MASK
}

/// Build a name from an index and entry-bits generation
#[inline]
pub const fn mach_port_make(index: MachPortIndex, gen: IpcEntryBits) -> MachPortName {
    index | (gen & IE_BITS_GEN_MASK)
}

// ============================================================================
// Entry Bits Constants (from Mach4 ipc_entry.h)
// ============================================================================

/// Mask for user references (16 bits)
pub const IE_BITS_UREFS_MASK: u32 = 0x0000_FFFF;

/// Mask for capability type (5 bits)
pub const IE_BITS_TYPE_MASK: u32 = 0x001F_0000;

/// Mask for all bits relevant to the right
pub const IE_BITS_RIGHT_MASK: u32 = 0x007F_FFFF;

/// Mask for generation number (8 bits)
pub const IE_BITS_GEN_MASK: u32 = 0xFF00_0000;

/// One generation increment
pub const IE_BITS_GEN_ONE: u32 = 0x0100_0000;

/// Extract user references from bits
#[inline]
pub const fn ie_bits_urefs(bits: IpcEntryBits) -> u32 {
    bits & IE_BITS_UREFS_MASK
}

/// Extract type from bits
#[inline]
pub const fn ie_bits_type(bits: IpcEntryBits) -> u32 {
    bits & IE_BITS_TYPE_MASK
}

/// Extract generation from bits
#[inline]
pub const fn ie_bits_gen(bits: IpcEntryBits) -> u32 {
    bits & IE_BITS_GEN_MASK
}

/// Largest user-reference count
pub const MACH_PORT_UREFS_MAX: u32 = 0xFFFF;

// ============================================================================
// Port Right Types (shifted into IE_BITS_TYPE position)
// ============================================================================

pub const MACH_PORT_TYPE_NONE: u32 = 0;
pub const MACH_PORT_TYPE_SEND: u32 = 0x0001_0000;
pub const MACH_PORT_TYPE_RECEIVE: u32 = 0x0002_0000;
pub const MACH_PORT_TYPE_SEND_ONCE: u32 = 0x0004_0000;
pub const MACH_PORT_TYPE_PORT_SET: u32 = 0x0008_0000;
pub const MACH_PORT_TYPE_DEAD_NAME: u32 = 0x0010_0000;

pub const MACH_PORT_TYPE_SEND_RECEIVE: u32 = MACH_PORT_TYPE_SEND | MACH_PORT_TYPE_RECEIVE;
pub const MACH_PORT_TYPE_SEND_RIGHTS: u32 = MACH_PORT_TYPE_SEND | MACH_PORT_TYPE_SEND_ONCE;
pub const MACH_PORT_TYPE_PORT_RIGHTS: u32 = MACH_PORT_TYPE_SEND_RIGHTS | MACH_PORT_TYPE_RECEIVE;

// ============================================================================
// IPC Entry - A single capability record
// ============================================================================

/// IPC Entry - records a single capability in a task's IPC space
///
/// `bits` holds type | urefs | generation. A receive right has no user
/// references of its own; the urefs of a send/receive entry count the
/// send right. However many urefs a send entry has, it accounts for one
/// send right on the port.
#[derive(Debug, Clone, Default)]
pub struct IpcEntry {
    /// Capability bits: type | urefs | generation
    pub bits: IpcEntryBits,

    /// The port this entry refers to (None for dead names and free slots)
    pub object: Option<Arc<IpcPort>>,

    /// Dead-name request index on the port
    pub request: IpcPortRequestIndex,

    /// Slot is allocated
    in_use: bool,
}

impl IpcEntry {
    /// Capability type
    #[inline]
    pub fn ie_type(&self) -> u32 {
        ie_bits_type(self.bits)
    }

    /// User reference count
    #[inline]
    pub fn urefs(&self) -> u32 {
        ie_bits_urefs(self.bits)
    }

    /// Generation bits
    #[inline]
    pub fn generation(&self) -> u32 {
        ie_bits_gen(self.bits)
    }

    /// Replace type and urefs, keeping the generation
    #[inline]
    pub fn set_right(&mut self, ty: u32, urefs: u32) {
        self.bits = self.generation() | ty | (urefs & IE_BITS_UREFS_MASK);
    }

    /// Replace urefs
    #[inline]
    pub fn set_urefs(&mut self, urefs: u32) {
        self.bits = (self.bits & !IE_BITS_UREFS_MASK) | (urefs & IE_BITS_UREFS_MASK);
    }

    /// The port, if this entry names a live-or-dying port
    pub fn port(&self) -> Option<&Arc<IpcPort>> {
        self.object.as_ref()
    }

    /// Whether this entry refers to `port`
    pub fn names_port(&self, port: &Arc<IpcPort>) -> bool {
        self.object.as_ref().is_some_and(|p| Arc::ptr_eq(p, port))
    }
}

// ============================================================================
// Entry Table - Dynamic array of entries
// ============================================================================

/// Slots in a freshly grown table
pub const IPC_ENTRY_TABLE_MIN: usize = 16;

/// Default cap on table slots
pub const IE_TABLE_DEFAULT_MAX: usize = 65536;

/// Kernel memory per table slot
pub const IE_ENTRY_SIZE: usize = 16;

/// Entry table with free list management
///
/// Slot 0 is never handed out, so no valid name has index 0.
#[derive(Debug)]
pub struct IpcEntryTable {
    /// The entries array
    entries: Vec<IpcEntry>,

    /// Free slot indices
    free: Vec<MachPortIndex>,

    /// Number of allocated entries
    active: usize,

    /// Largest number of slots the table may grow to
    max_slots: usize,

    /// Heap the table storage is charged to
    heap: Arc<KernelHeap>,

    /// Charge for the current table storage
    charge: Option<Kalloc>,
}

impl IpcEntryTable {
    /// Create an empty table that may grow to `max_slots`
    pub fn new(heap: Arc<KernelHeap>, max_slots: usize) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            active: 0,
            // Index 0xffffff with generation 0xff would spell MACH_PORT_DEAD.
            max_slots: max_slots.min(IE_BITS_GEN_ONE as usize - 1),
            heap,
            charge: None,
        }
    }

    /// Number of slots
    #[inline]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Number of allocated entries
    #[inline]
    pub fn active_count(&self) -> usize {
        self.active
    }

    fn slot(&self, name: MachPortName) -> Option<&IpcEntry> {
        let entry = self.entries.get(mach_port_index(name) as usize)?;
        (entry.in_use && entry.generation() == mach_port_gen(name)).then_some(entry)
    }

    fn slot_mut(&mut self, name: MachPortName) -> Option<&mut IpcEntry> {
        let entry = self.entries.get_mut(mach_port_index(name) as usize)?;
        (entry.in_use && entry.generation() == mach_port_gen(name)).then_some(entry)
    }

    /// Look up an entry holding a right (`ipc_entry_lookup`)
    pub fn lookup(&self, name: MachPortName) -> Option<&IpcEntry> {
        if !mach_port_valid(name) {
            return None;
        }
        self.slot(name).filter(|e| e.ie_type() != MACH_PORT_TYPE_NONE)
    }

    /// Mutable `lookup`
    pub fn lookup_mut(&mut self, name: MachPortName) -> Option<&mut IpcEntry> {
        if !mach_port_valid(name) {
            return None;
        }
        self.slot_mut(name).filter(|e| e.ie_type() != MACH_PORT_TYPE_NONE)
    }

    /// An allocated entry, including one with no right yet
    pub fn allocated_mut(&mut self, name: MachPortName) -> Option<&mut IpcEntry> {
        self.slot_mut(name)
    }

    /// Allocate an entry without growing the table (`ipc_entry_get`)
    pub fn get(&mut self) -> Option<MachPortName> {
        let index = self.free.pop()?;
        let entry = &mut self.entries[index as usize];
        entry.in_use = true;
        entry.bits = entry.generation();
        entry.object = None;
        entry.request = 0;
        self.active += 1;
        Some(mach_port_make(index, entry.generation()))
    }

    /// Allocate an entry, growing the table if needed (`ipc_entry_alloc`)
    pub fn alloc(&mut self) -> KernResult<MachPortName> {
        if let Some(name) = self.get() {
            return Ok(name);
        }
        self.grow()?;
        self.get().ok_or(KernError::NoSpace)
    }

    /// Grow the table (`ipc_entry_grow_table`)
    pub fn grow(&mut self) -> KernResult<()> {
        let old = self.entries.len();
        if old >= self.max_slots {
            return Err(KernError::NoSpace);
        }
        let new = (old * 2).max(IPC_ENTRY_TABLE_MIN).min(self.max_slots);
        let charge = self.heap.try_kalloc(new * IE_ENTRY_SIZE)?;
        self.charge = Some(charge);

        self.entries.resize_with(new, IpcEntry::default);
        let first = old.max(1);
        // Hand out low indices first.
        self.free.extend((first..new).rev().map(|i| i as MachPortIndex));
        Ok(())
    }

    /// Free an entry (`ipc_entry_dealloc`)
    pub fn dealloc(&mut self, name: MachPortName) {
        let index = mach_port_index(name);
        let entry = match self.slot_mut(name) {
            Some(entry) => entry,
            None => return,
        };
        let gen = entry.generation().wrapping_add(IE_BITS_GEN_ONE) & IE_BITS_GEN_MASK;
        *entry = IpcEntry {
            bits: gen,
            ..IpcEntry::default()
        };
        self.active -= 1;
        self.free.push(index);
    }

    /// Free `name` if its entry no longer holds a right
    pub fn dealloc_if_none(&mut self, name: MachPortName) {
        if self
            .slot(name)
            .is_some_and(|e| e.ie_type() == MACH_PORT_TYPE_NONE)
        {
            self.dealloc(name);
        }
    }

    /// Find the send entry for `port` (`ipc_hash_lookup`)
    pub fn find_send(&self, port: &Arc<IpcPort>) -> Option<MachPortName> {
        self.entries.iter().enumerate().find_map(|(index, entry)| {
            (entry.in_use && entry.ie_type() == MACH_PORT_TYPE_SEND && entry.names_port(port))
                .then(|| mach_port_make(index as MachPortIndex, entry.generation()))
        })
    }

    /// Names of all entries holding rights
    pub fn names(&self) -> Vec<MachPortName> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.in_use && e.ie_type() != MACH_PORT_TYPE_NONE)
            .map(|(index, e)| mach_port_make(index as MachPortIndex, e.generation()))
            .collect()
    }
}
