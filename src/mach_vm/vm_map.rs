//! VM Map - Address Space Management
//!
//! Based on Mach4 vm/vm_map.h/c
//!
//! A VM map is a task's address space: an ordered set of entries, each a
//! page-aligned range. Entries own their bytes directly; there is no VM
//! object or pmap layer underneath. The map also records the message ABI
//! of the task that owns it, which decides how messages read from or
//! written to this map are laid out.
//!
//! Kernel memory the map consumes (one entry structure per mapping, copy
//! objects in flight) is charged to a `KernelHeap`, so an exhausted heap
//! shows up as `KERN_RESOURCE_SHORTAGE`, while running out of addresses
//! shows up as `KERN_NO_SPACE`.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::ipc::msg_type::MsgAbi;
use crate::kern::kalloc::{Kalloc, KernelHeap};
use crate::kern::kern_return::{KernError, KernResult};

// ============================================================================
// Constants
// ============================================================================

/// Page size
pub const PAGE_SIZE: u64 = 4096;

/// Lowest address handed out (page zero stays unmapped)
pub const VM_MIN_ADDRESS: u64 = PAGE_SIZE;

/// Kernel memory charged for one map entry structure
pub const VM_MAP_ENTRY_SIZE: usize = 64;

/// Round up to a page boundary
#[inline]
pub const fn round_page(x: u64) -> u64 {
    (x + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Round down to a page boundary
#[inline]
pub const fn trunc_page(x: u64) -> u64 {
    x & !(PAGE_SIZE - 1)
}

// ============================================================================
// VM Map Entry
// ============================================================================

/// One mapped range
pub struct VmMapEntry {
    /// Start address (page aligned)
    pub start: u64,
    /// End address (page aligned, exclusive)
    pub end: u64,
    /// Contents
    data: Vec<u8>,
    /// Charge for the entry structure
    _charge: Kalloc,
}

impl VmMapEntry {
    fn new(start: u64, end: u64, charge: Kalloc) -> Self {
        Self {
            start,
            end,
            data: vec![0; (end - start) as usize],
            _charge: charge,
        }
    }

    /// Size of the entry
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Check if address is in this entry
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if range overlaps this entry
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && self.end > start
    }

    /// Split the entry at `at`, keeping `[start, at)` and returning `[at, end)`
    fn split(&mut self, at: u64, charge: Kalloc) -> VmMapEntry {
        let offset = (at - self.start) as usize;
        let tail = self.data.split_off(offset);
        let entry = VmMapEntry {
            start: at,
            end: self.end,
            data: tail,
            _charge: charge,
        };
        self.end = at;
        entry
    }
}

impl fmt::Debug for VmMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmMapEntry")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .finish()
    }
}

// ============================================================================
// VM Map Copy
// ============================================================================

/// A region of memory lifted out of an address space
///
/// This is what an out-of-line data element holds while its message sits
/// in the kernel. Dropping it is `vm_map_copy_discard`.
pub struct VmMapCopy {
    data: Vec<u8>,
    _charge: Kalloc,
}

impl VmMapCopy {
    /// Size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for VmMapCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmMapCopy").field("size", &self.data.len()).finish()
    }
}

// ============================================================================
// VM Map
// ============================================================================

/// VM Map - represents a task's address space
pub struct VmMap {
    /// Message layout used by the owning task
    abi: MsgAbi,

    /// Heap for entry structures and copy objects
    heap: Arc<KernelHeap>,

    /// Map entries (ordered by start address)
    entries: Mutex<BTreeMap<u64, VmMapEntry>>,

    /// Minimum address
    pub min_offset: u64,

    /// Maximum address
    pub max_offset: u64,

    /// Map size (sum of all entry sizes)
    size: AtomicU64,
}

impl VmMap {
    /// Create a map with the full address range of `abi`
    pub fn new(abi: MsgAbi, heap: Arc<KernelHeap>) -> Self {
        Self::with_limits(abi, heap, abi.max_user_address() - VM_MIN_ADDRESS)
    }

    /// Create a map that can hold at most `max_bytes` of mappings
    pub fn with_limits(abi: MsgAbi, heap: Arc<KernelHeap>, max_bytes: u64) -> Self {
        Self {
            abi,
            heap,
            entries: Mutex::new(BTreeMap::new()),
            min_offset: VM_MIN_ADDRESS,
            max_offset: VM_MIN_ADDRESS + trunc_page(max_bytes),
            size: AtomicU64::new(0),
        }
    }

    /// Message ABI of the owning task
    pub fn abi(&self) -> MsgAbi {
        self.abi
    }

    /// Heap this map charges
    pub fn heap(&self) -> &Arc<KernelHeap> {
        &self.heap
    }

    /// Get map size
    pub fn total_size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Get entry count
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether every byte of `[addr, addr + len)` is mapped
    pub fn is_mapped(&self, addr: u64, len: u64) -> bool {
        let entries = self.entries.lock();
        Self::covered(&entries, addr, len)
    }

    fn covered(entries: &BTreeMap<u64, VmMapEntry>, addr: u64, len: u64) -> bool {
        let end = match addr.checked_add(len) {
            Some(end) => end,
            None => return false,
        };
        let mut cursor = addr;
        while cursor < end {
            match entries.range(..=cursor).next_back() {
                Some((_, entry)) if entry.contains(cursor) => cursor = entry.end,
                _ => return false,
            }
        }
        true
    }

    /// Find free space of given size
    fn find_space(&self, entries: &BTreeMap<u64, VmMapEntry>, size: u64) -> Option<u64> {
        let mut prev_end = self.min_offset;

        for (&start, entry) in entries.iter() {
            if prev_end + size <= start {
                return Some(prev_end);
            }
            prev_end = entry.end;
        }

        if prev_end + size <= self.max_offset {
            return Some(prev_end);
        }

        None
    }

    /// Allocate `size` bytes of zero-filled memory
    pub fn allocate(&self, size: u64, anywhere: bool, addr_hint: u64) -> KernResult<u64> {
        if size == 0 {
            return Err(KernError::InvalidArgument);
        }
        let size = round_page(size);
        let mut entries = self.entries.lock();

        let addr = if anywhere {
            self.find_space(&entries, size).ok_or(KernError::NoSpace)?
        } else {
            let start = trunc_page(addr_hint);
            if start < self.min_offset || start + size > self.max_offset {
                return Err(KernError::InvalidAddress);
            }
            if entries.values().any(|e| e.overlaps(start, start + size)) {
                return Err(KernError::NoSpace);
            }
            start
        };

        let charge = self.heap.try_kalloc(VM_MAP_ENTRY_SIZE)?;
        entries.insert(addr, VmMapEntry::new(addr, addr + size, charge));
        self.size.fetch_add(size, Ordering::SeqCst);
        Ok(addr)
    }

    /// Remove every mapping in `[addr, addr + size)`, clipping partial entries
    ///
    /// Holes in the range are ignored.
    pub fn deallocate(&self, addr: u64, size: u64) -> KernResult<()> {
        if size == 0 {
            return Ok(());
        }
        let start = trunc_page(addr);
        let end = round_page(addr.checked_add(size).ok_or(KernError::InvalidAddress)?);
        let mut entries = self.entries.lock();

        let keys: Vec<u64> = entries
            .values()
            .filter(|e| e.overlaps(start, end))
            .map(|e| e.start)
            .collect();

        // Clipping needs new entry structures; get them before touching the map.
        let mut clip_start = None;
        let mut clip_end = None;
        for key in &keys {
            if let Some(entry) = entries.get(key) {
                if entry.start < start {
                    clip_start = Some(self.heap.try_kalloc(VM_MAP_ENTRY_SIZE)?);
                }
                if entry.end > end {
                    clip_end = Some(self.heap.try_kalloc(VM_MAP_ENTRY_SIZE)?);
                }
            }
        }

        for key in keys {
            let mut entry = match entries.remove(&key) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.start < start {
                if let Some(charge) = clip_start.take() {
                    let tail = entry.split(start, charge);
                    entries.insert(entry.start, entry);
                    entry = tail;
                }
            }
            if entry.end > end {
                if let Some(charge) = clip_end.take() {
                    let tail = entry.split(end, charge);
                    entries.insert(tail.start, tail);
                }
            }
            self.size.fetch_sub(entry.size(), Ordering::SeqCst);
        }
        Ok(())
    }

    /// Copy `len` bytes out of the map (copyinmap)
    pub fn read(&self, addr: u64, len: usize) -> KernResult<Vec<u8>> {
        let entries = self.entries.lock();
        if !Self::covered(&entries, addr, len as u64) {
            return Err(KernError::InvalidAddress);
        }
        let mut out = Vec::with_capacity(len);
        let mut cursor = addr;
        let end = addr + len as u64;
        while cursor < end {
            let entry = match entries.range(..=cursor).next_back() {
                Some((_, entry)) => entry,
                None => return Err(KernError::InvalidAddress),
            };
            let chunk_end = end.min(entry.end);
            let from = (cursor - entry.start) as usize;
            let to = (chunk_end - entry.start) as usize;
            out.extend_from_slice(&entry.data[from..to]);
            cursor = chunk_end;
        }
        Ok(out)
    }

    /// Copy `bytes` into the map at `addr` (copyoutmap)
    pub fn write(&self, addr: u64, bytes: &[u8]) -> KernResult<()> {
        let mut entries = self.entries.lock();
        if !Self::covered(&entries, addr, bytes.len() as u64) {
            return Err(KernError::InvalidAddress);
        }
        let mut cursor = addr;
        let mut src = bytes;
        while !src.is_empty() {
            let entry = match entries.range_mut(..=cursor).next_back() {
                Some((_, entry)) => entry,
                None => return Err(KernError::InvalidAddress),
            };
            let from = (cursor - entry.start) as usize;
            let n = src.len().min(entry.data.len() - from);
            entry.data[from..from + n].copy_from_slice(&src[..n]);
            src = &src[n..];
            cursor += n as u64;
        }
        Ok(())
    }

    /// Lift `[addr, addr + len)` out of the map into a copy object
    ///
    /// With `src_destroy` the pages covering the range are unmapped.
    pub fn copyin(&self, addr: u64, len: usize, src_destroy: bool) -> KernResult<VmMapCopy> {
        let data = self.read(addr, len)?;
        let charge = self.heap.try_kalloc(len)?;
        if src_destroy {
            self.deallocate(addr, len as u64)?;
        }
        Ok(VmMapCopy {
            data,
            _charge: charge,
        })
    }

    /// Map a copy object into the map, returning its address
    ///
    /// The copy is consumed whether or not this succeeds.
    pub fn copyout(&self, copy: VmMapCopy) -> KernResult<u64> {
        let addr = self.allocate(copy.size() as u64, true, 0)?;
        self.write(addr, &copy.data)?;
        Ok(addr)
    }
}

impl fmt::Debug for VmMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmMap")
            .field("abi", &self.abi)
            .field("size", &self.total_size())
            .field("entries", &self.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> VmMap {
        VmMap::new(MsgAbi::X86_64, KernelHeap::unlimited())
    }

    #[test]
    fn test_allocate_read_write() {
        let map = map();
        let addr = map.allocate(100, true, 0).unwrap();
        assert_eq!(addr % PAGE_SIZE, 0);
        assert_eq!(map.total_size(), PAGE_SIZE);
        map.write(addr + 10, &[1, 2, 3]).unwrap();
        assert_eq!(map.read(addr + 9, 5).unwrap(), vec![0, 1, 2, 3, 0]);
        assert_eq!(map.read(addr + PAGE_SIZE - 1, 2), Err(KernError::InvalidAddress));
    }

    #[test]
    fn test_read_across_entries() {
        let map = map();
        let a = map.allocate(PAGE_SIZE, false, 0x10000).unwrap();
        let b = map.allocate(PAGE_SIZE, false, 0x11000).unwrap();
        assert_eq!(b, a + PAGE_SIZE);
        map.write(a + PAGE_SIZE - 2, &[7, 8, 9, 10]).unwrap();
        assert_eq!(map.read(a + PAGE_SIZE - 2, 4).unwrap(), vec![7, 8, 9, 10]);
    }

    #[test]
    fn test_deallocate_clips() {
        let map = map();
        let addr = map.allocate(3 * PAGE_SIZE, true, 0).unwrap();
        map.write(addr + 2 * PAGE_SIZE, &[0xAA]).unwrap();
        map.deallocate(addr + PAGE_SIZE, PAGE_SIZE).unwrap();
        assert!(map.is_mapped(addr, PAGE_SIZE));
        assert!(!map.is_mapped(addr + PAGE_SIZE, 1));
        assert_eq!(map.read(addr + 2 * PAGE_SIZE, 1).unwrap(), vec![0xAA]);
        assert_eq!(map.entry_count(), 2);
        assert_eq!(map.total_size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_copyin_destroy_and_copyout() {
        let heap = KernelHeap::unlimited();
        let src = VmMap::new(MsgAbi::I386, heap.clone());
        let dst = VmMap::new(MsgAbi::I386, heap.clone());
        let addr = src.allocate(8, true, 0).unwrap();
        src.write(addr, b"mach ipc").unwrap();

        let copy = src.copyin(addr, 8, true).unwrap();
        assert!(!src.is_mapped(addr, 1));
        assert_eq!(copy.data(), b"mach ipc");

        let out = dst.copyout(copy).unwrap();
        assert_eq!(dst.read(out, 8).unwrap(), b"mach ipc".to_vec());
    }

    #[test]
    fn test_limits() {
        let map = VmMap::with_limits(MsgAbi::X86_64, KernelHeap::unlimited(), PAGE_SIZE);
        map.allocate(PAGE_SIZE, true, 0).unwrap();
        assert_eq!(map.allocate(1, true, 0), Err(KernError::NoSpace));

        let map = VmMap::new(MsgAbi::X86_64, KernelHeap::with_limit(VM_MAP_ENTRY_SIZE));
        map.allocate(1, true, 0).unwrap();
        assert_eq!(map.allocate(1, true, 0), Err(KernError::ResourceShortage));
    }
}
