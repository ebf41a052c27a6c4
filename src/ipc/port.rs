//! IPC Port - the fundamental IPC primitive
//!
//! Based on Mach4 ipc/ipc_port.h, ipc/ipc_port.c
//!
//! A port is a kernel-protected message queue. Tasks never touch ports
//! directly; they hold rights to them through entries in their IPC space.
//! The port itself keeps the counts of outstanding rights (`srights`,
//! `sorights`), where its receive right lives, the notification requests
//! registered against it, and the messages queued on it.
//!
//! All port state sits behind one `spin::Mutex`. Lock order is space
//! before port, destination before reply; a second port is only ever
//! locked with `try_lock` when the first is held.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use super::entry::{IpcPortRequestIndex, MachPortName, MACH_PORT_NULL};
use super::kmsg::IpcKmsgQueue;
use super::notify::{ipc_notify_dead_name, ipc_notify_no_senders, ipc_notify_send_once};
use super::space::SpaceId;
use crate::kern::kalloc::{Kalloc, KernelHeap};
use crate::kern::kern_return::{KernError, KernResult};

// ============================================================================
// Death Timestamps
// ============================================================================

/// Port death timestamp
pub type IpcPortTimestamp = u32;

static IPC_PORT_TIMESTAMP_DATA: AtomicU32 = AtomicU32::new(0);

/// Next value of the global death clock
pub fn ipc_port_timestamp() -> IpcPortTimestamp {
    IPC_PORT_TIMESTAMP_DATA.fetch_add(1, Ordering::SeqCst)
}

/// Whether timestamp `one` precedes `two`, modulo wraparound
#[inline]
pub const fn ip_timestamp_order(one: IpcPortTimestamp, two: IpcPortTimestamp) -> bool {
    (one.wrapping_sub(two) as i32) < 0
}

// ============================================================================
// Receiver
// ============================================================================

/// Where a port's receive right is
#[derive(Debug, Clone)]
pub enum PortReceiver {
    /// Held by a space under `name`
    Space { space: SpaceId, name: MachPortName },
    /// Carried in a message. `None` while the message is still being
    /// built; set to the message's destination once the right is queued.
    InTransit { destination: Option<Arc<IpcPort>> },
    /// Port is dead
    Dead,
}

// ============================================================================
// Dead-Name Requests
// ============================================================================

/// Kernel memory per dead-name request slot
pub const IPR_SIZE: usize = 16;

/// Smallest non-empty request table
pub const IPR_TABLE_MIN: usize = 4;

/// A registered dead-name request
#[derive(Debug)]
pub struct DnRequest {
    /// Name of the right in the requesting space
    pub name: MachPortName,
    /// Send-once right the notification goes to
    pub notify: Arc<IpcPort>,
}

/// Dead-name request table (`ip_dnrequests`)
///
/// Slot 0 is reserved so that request index 0 means "none".
#[derive(Debug, Default)]
pub struct DnRequestTable {
    slots: Vec<Option<DnRequest>>,
    charge: Option<Kalloc>,
}

impl DnRequestTable {
    /// Usable slots
    pub fn capacity(&self) -> usize {
        self.slots.len().saturating_sub(1)
    }

    /// Registered requests
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a request, handing `notify` back when the table is full
    pub fn insert(
        &mut self,
        name: MachPortName,
        notify: Arc<IpcPort>,
    ) -> Result<IpcPortRequestIndex, Arc<IpcPort>> {
        match self.slots.iter().skip(1).position(|s| s.is_none()) {
            Some(free) => {
                let index = free + 1;
                self.slots[index] = Some(DnRequest { name, notify });
                Ok(index as IpcPortRequestIndex)
            }
            None => Err(notify),
        }
    }

    /// Replace the send-once right of an existing request
    pub fn rename(&mut self, index: IpcPortRequestIndex, notify: Arc<IpcPort>) -> Option<Arc<IpcPort>> {
        let slot = self.slots.get_mut(index as usize)?.as_mut()?;
        Some(core::mem::replace(&mut slot.notify, notify))
    }

    /// Remove request `index`, which must belong to `name`
    pub fn cancel(&mut self, name: MachPortName, index: IpcPortRequestIndex) -> Option<Arc<IpcPort>> {
        let slot = self.slots.get_mut(index as usize)?;
        match slot {
            Some(req) if req.name == name => slot.take().map(|req| req.notify),
            _ => None,
        }
    }

    /// Grow the table, charging `heap`
    pub fn grow(&mut self, heap: &Arc<KernelHeap>) -> KernResult<()> {
        let new = (self.slots.len() * 2).max(IPR_TABLE_MIN + 1);
        let charge = heap.try_kalloc(new * IPR_SIZE)?;
        self.slots.resize_with(new, || None);
        self.charge = Some(charge);
        Ok(())
    }

    /// Remove every request
    pub fn take_all(&mut self) -> Vec<DnRequest> {
        self.charge = None;
        core::mem::take(&mut self.slots).into_iter().flatten().collect()
    }
}

// ============================================================================
// Port
// ============================================================================

/// Lock-protected port state
#[derive(Debug)]
pub struct PortState {
    /// Port is alive
    pub active: bool,
    /// Receive right location
    pub receiver: PortReceiver,
    /// Outstanding send rights
    pub srights: u32,
    /// Outstanding send-once rights
    pub sorights: u32,
    /// Make-send count
    pub mscount: u32,
    /// Death time (meaningful once inactive)
    pub timestamp: IpcPortTimestamp,
    /// No-senders notification request
    pub nsrequest: Option<Arc<IpcPort>>,
    /// Dead-name notification requests
    pub dnrequests: DnRequestTable,
    /// Payload delivered in place of the destination name
    pub protected_payload: Option<u64>,
    /// Queued messages
    pub messages: IpcKmsgQueue,
}

impl PortState {
    /// Receiver name if `space` holds the receive right
    pub fn receiver_name_in(&self, space: SpaceId) -> Option<MachPortName> {
        match self.receiver {
            PortReceiver::Space { space: s, name } if s == space => Some(name),
            _ => None,
        }
    }

    /// Name to report for the receive right as seen from `space`
    pub fn receiver_name_or_null(&self, space: SpaceId) -> MachPortName {
        self.receiver_name_in(space).unwrap_or(MACH_PORT_NULL)
    }

    /// Port is alive and its receive right sits in a queued message
    pub fn in_transit_to(&self) -> Option<&Arc<IpcPort>> {
        match &self.receiver {
            PortReceiver::InTransit { destination } if self.active => destination.as_ref(),
            _ => None,
        }
    }

    /// `ipc_port_clear_receiver`: receive right leaves its space
    pub fn clear_receiver(&mut self) {
        self.receiver = PortReceiver::InTransit { destination: None };
        self.mscount = 0;
    }

    /// Drop one send right, returning the no-senders request if it fired
    pub fn release_send_locked(&mut self) -> Option<(Arc<IpcPort>, u32)> {
        self.srights = self.srights.saturating_sub(1);
        if self.srights == 0 {
            let mscount = self.mscount;
            return self.nsrequest.take().map(|ns| (ns, mscount));
        }
        None
    }
}

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// A Mach port
pub struct IpcPort {
    id: u64,
    state: Mutex<PortState>,
}

impl IpcPort {
    /// A new active port whose receive right is named `name` in `space`
    pub fn new(space: SpaceId, name: MachPortName) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(PortState {
                active: true,
                receiver: PortReceiver::Space { space, name },
                srights: 0,
                sorights: 0,
                mscount: 0,
                timestamp: 0,
                nsrequest: None,
                dnrequests: DnRequestTable::default(),
                protected_payload: None,
                messages: IpcKmsgQueue::new(),
            }),
        })
    }

    /// Debug identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `ip_lock`
    pub fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock()
    }

    /// `ip_lock_try`
    pub fn try_lock(&self) -> Option<MutexGuard<'_, PortState>> {
        self.state.try_lock()
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Outstanding send rights
    pub fn srights(&self) -> u32 {
        self.lock().srights
    }

    /// Outstanding send-once rights
    pub fn sorights(&self) -> u32 {
        self.lock().sorights
    }

    /// Make-send count
    pub fn mscount(&self) -> u32 {
        self.lock().mscount
    }

    /// Death timestamp
    pub fn timestamp(&self) -> IpcPortTimestamp {
        self.lock().timestamp
    }

    /// Number of queued messages
    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }
}

impl fmt::Debug for IpcPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IpcPort#{}", self.id)
    }
}

// ============================================================================
// Right Counting
// ============================================================================

/// `ipc_port_copy_send`: another send right from an existing one
///
/// Returns `None` if the port is dead.
pub fn ipc_port_copy_send(port: &Arc<IpcPort>) -> Option<Arc<IpcPort>> {
    let mut st = port.lock();
    if !st.active {
        return None;
    }
    st.srights += 1;
    Some(Arc::clone(port))
}

/// `ipc_port_release_send`
pub fn ipc_port_release_send(port: &Arc<IpcPort>) {
    let fired = port.lock().release_send_locked();
    if let Some((nsrequest, mscount)) = fired {
        ipc_notify_no_senders(nsrequest, mscount);
    }
}

/// `ipc_port_release_sonce`: consume a send-once right without a notification
pub fn ipc_port_release_sonce(port: &Arc<IpcPort>) {
    let mut st = port.lock();
    st.sorights = st.sorights.saturating_sub(1);
}

// ============================================================================
// Dead-Name Requests
// ============================================================================

/// `ipc_port_dnrequest`: register `notify` for the death of `port`
///
/// The port is locked and active. Fails with `NoSpace` when the table
/// must grow first, handing the send-once right back.
pub fn ipc_port_dnrequest(
    st: &mut PortState,
    name: MachPortName,
    notify: Arc<IpcPort>,
) -> Result<IpcPortRequestIndex, (KernError, Arc<IpcPort>)> {
    st.dnrequests.insert(name, notify).map_err(|n| (KernError::NoSpace, n))
}

/// `ipc_port_dngrow`: make room for another dead-name request
///
/// A port that died meanwhile needs no room; the caller notices the
/// death when it retries.
pub fn ipc_port_dngrow(port: &Arc<IpcPort>, heap: &Arc<KernelHeap>) -> KernResult<()> {
    let mut st = port.lock();
    if !st.active {
        return Ok(());
    }
    st.dnrequests.grow(heap)
}

/// `ipc_port_dncancel`
pub fn ipc_port_dncancel(
    st: &mut PortState,
    name: MachPortName,
    index: IpcPortRequestIndex,
) -> Option<Arc<IpcPort>> {
    st.dnrequests.cancel(name, index)
}

/// `ipc_port_nsrequest`: install a no-senders request
///
/// Returns the previous request. If the port already has no senders and
/// `sync` has been reached, the notification fires at once.
pub fn ipc_port_nsrequest(
    port: &Arc<IpcPort>,
    sync: u32,
    notify: Option<Arc<IpcPort>>,
) -> Option<Arc<IpcPort>> {
    let mut st = port.lock();
    let previous = st.nsrequest.take();
    let mscount = st.mscount;
    match notify {
        Some(notify) if st.srights == 0 && sync <= mscount => {
            drop(st);
            ipc_notify_no_senders(notify, mscount);
        }
        notify => st.nsrequest = notify,
    }
    previous
}

// ============================================================================
// Destruction
// ============================================================================

/// `ipc_port_destroy`: kill a port whose receive right is being destroyed
///
/// Queued messages go to `reap`; the caller drains it. Fires the
/// no-senders request as a send-once notification and every dead-name
/// request as a dead-name notification.
pub fn ipc_port_destroy(port: &Arc<IpcPort>, reap: &mut IpcKmsgQueue) {
    let mut st = port.lock();
    if !st.active {
        return;
    }
    st.active = false;
    st.timestamp = ipc_port_timestamp();
    st.receiver = PortReceiver::Dead;

    let nsrequest = st.nsrequest.take();
    let dnrequests = st.dnrequests.take_all();
    reap.append(&mut st.messages);
    let timestamp = st.timestamp;
    drop(st);

    log::debug!("ipc_port_destroy: {:?} died at {}", port, timestamp);

    if let Some(nsrequest) = nsrequest {
        ipc_notify_send_once(nsrequest);
    }
    for req in dnrequests {
        ipc_notify_dead_name(req.notify, req.name);
    }
}

// ============================================================================
// Circularity
// ============================================================================

/// Serializes chain walks (`ipc_port_multiple_lock`)
static IPC_PORT_MULTIPLE_LOCK: Mutex<()> = Mutex::new(());

/// `ipc_port_check_circularity`
///
/// `port` is a receive right just copied in (in limbo) that is about to be
/// queued at `dest`. Returns true if `dest` is `port` or reaches it through
/// the chain of in-transit destinations; the message must then not be
/// queued. Otherwise links `port` to `dest` and returns false.
pub fn ipc_port_check_circularity(port: &Arc<IpcPort>, dest: &Arc<IpcPort>) -> bool {
    if Arc::ptr_eq(port, dest) {
        return true;
    }

    // Quick check: no circularity if dest is not in transit.
    {
        let mut st = port.lock();
        if let Some(dest_st) = dest.try_lock() {
            if dest_st.in_transit_to().is_none() {
                drop(dest_st);
                st.receiver = PortReceiver::InTransit {
                    destination: Some(Arc::clone(dest)),
                };
                return false;
            }
        }
    }

    let _multiple = IPC_PORT_MULTIPLE_LOCK.lock();

    // Follow the chain to a port that is not in transit.
    let mut base = Arc::clone(dest);
    loop {
        let next = match base.lock().in_transit_to() {
            Some(next) => Arc::clone(next),
            None => break,
        };
        base = next;
    }

    if Arc::ptr_eq(&base, port) {
        log::debug!("ipc_port_check_circularity: {:?} reaches {:?}", dest, port);
        return true;
    }

    port.lock().receiver = PortReceiver::InTransit {
        destination: Some(Arc::clone(dest)),
    };
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limbo(port: &Arc<IpcPort>) {
        port.lock().clear_receiver();
    }

    #[test]
    fn test_timestamp_order_wraps() {
        assert!(ip_timestamp_order(1, 2));
        assert!(!ip_timestamp_order(2, 1));
        assert!(!ip_timestamp_order(5, 5));
        assert!(ip_timestamp_order(u32::MAX, 0));
        assert!(!ip_timestamp_order(0, u32::MAX));
    }

    #[test]
    fn test_dnrequest_table() {
        let heap = KernelHeap::unlimited();
        let port = IpcPort::new(SpaceId(1), 0x1);
        let notify = IpcPort::new(SpaceId(1), 0x2);
        let mut table = DnRequestTable::default();

        let back = table.insert(7, Arc::clone(&notify)).unwrap_err();
        assert!(Arc::ptr_eq(&back, &notify));

        table.grow(&heap).unwrap();
        assert_eq!(table.capacity(), IPR_TABLE_MIN);
        let index = table.insert(7, Arc::clone(&notify)).unwrap();
        assert_ne!(index, 0);
        assert!(table.cancel(8, index).is_none());
        assert!(table.cancel(7, index).is_some());
        assert!(table.is_empty());
        drop(port);
    }

    #[test]
    fn test_dngrow_shortage() {
        let heap = KernelHeap::with_limit(IPR_SIZE);
        let port = IpcPort::new(SpaceId(1), 0x1);
        assert_eq!(ipc_port_dngrow(&port, &heap), Err(KernError::ResourceShortage));
    }

    #[test]
    fn test_destroy_stamps_and_fires() {
        let a = IpcPort::new(SpaceId(1), 0x1);
        let b = IpcPort::new(SpaceId(1), 0x2);
        let mut reap = IpcKmsgQueue::new();

        ipc_port_destroy(&a, &mut reap);
        ipc_port_destroy(&b, &mut reap);
        assert!(!a.is_active());
        assert!(ip_timestamp_order(a.timestamp(), b.timestamp()));

        // Second destroy is a no-op
        let stamp = a.timestamp();
        ipc_port_destroy(&a, &mut reap);
        assert_eq!(a.timestamp(), stamp);
    }

    #[test]
    fn test_circularity_chain() {
        let ports: Vec<_> = (0..4).map(|i| IpcPort::new(SpaceId(1), i + 1)).collect();
        // Build the chain p1 -> p0, p2 -> p1, p3 -> p2
        for i in 1..4 {
            limbo(&ports[i]);
            assert!(!ipc_port_check_circularity(&ports[i], &ports[i - 1]));
        }

        // p0 moving to p3 closes the loop
        limbo(&ports[0]);
        assert!(ipc_port_check_circularity(&ports[0], &ports[3]));

        // A fresh port is fine anywhere
        let q = IpcPort::new(SpaceId(1), 9);
        limbo(&q);
        assert!(!ipc_port_check_circularity(&q, &ports[3]));
        assert!(ipc_port_check_circularity(&q, &q));
    }
}
