//! Port Operations - User-callable port manipulation
//!
//! Based on Mach4 ipc/mach_port.c
//!
//! This module provides the user-level operations for port manipulation:
//! - mach_port_allocate_receive: Create a new port
//! - mach_port_insert_send: Make a send right under the receive right's name
//! - mach_port_transfer: Move or copy a right between two spaces
//! - mach_port_deallocate / mach_port_destroy / mach_port_mod_refs
//! - mach_port_get_refs / mach_port_type / mach_port_lookup
//! - mach_port_request_dead_name / mach_port_request_no_senders
//! - mach_port_set_protected_payload / mach_port_clear_protected_payload
//!
//! Every operation takes the space lock itself. Messages released by a
//! destroyed port are reaped after the lock is dropped.

use alloc::sync::Arc;

use super::entry::{
    MachPortName, MACH_PORT_DEAD, MACH_PORT_NULL, MACH_PORT_TYPE_RECEIVE, MACH_PORT_TYPE_SEND, MACH_PORT_UREFS_MAX,
};
use super::ipc_object::{ipc_object_copyin, ipc_object_copyout, ipc_object_destroy_now, IpcObject};
use super::kmsg::{ipc_kmsg_reap, IpcKmsgQueue};
use super::mach_msg::PortDisposition;
use super::notify::ipc_notify_send_once;
use super::port::{ipc_port_nsrequest, IpcPort};
use super::right::{
    ipc_right_dealloc, ipc_right_delta, ipc_right_destroy, ipc_right_dnrequest, ipc_right_refs, ipc_right_type,
    MachPortRight,
};
use super::space::{IpcSpace, SpaceInner};
use crate::kern::kern_return::{KernError, KernResult};

/// Write-lock an active space
fn active_write(space: &IpcSpace) -> KernResult<spin::RwLockWriteGuard<'_, SpaceInner>> {
    let inner = space.write();
    if !inner.active {
        return Err(KernError::InvalidTask);
    }
    Ok(inner)
}

/// The port behind the receive right `name`
fn receive_port(inner: &SpaceInner, name: MachPortName) -> KernResult<Arc<IpcPort>> {
    let entry = inner.table.lookup(name).ok_or(KernError::InvalidName)?;
    if entry.ie_type() & MACH_PORT_TYPE_RECEIVE == 0 {
        return Err(KernError::InvalidRight);
    }
    entry.port().cloned().ok_or(KernError::InvalidRight)
}

// ============================================================================
// Allocation
// ============================================================================

/// `mach_port_allocate(MACH_PORT_RIGHT_RECEIVE)`: create a port
///
/// Returns the name of the new receive right.
pub fn mach_port_allocate_receive(space: &IpcSpace) -> KernResult<MachPortName> {
    let mut inner = active_write(space)?;
    let name = inner.table.alloc()?;
    let port = IpcPort::new(space.id(), name);
    let entry = inner.table.allocated_mut(name).ok_or(KernError::Failure)?;
    entry.object = Some(port);
    entry.set_right(MACH_PORT_TYPE_RECEIVE, 0);
    log::trace!("mach_port_allocate_receive: {:#x} in {:?}", name, space.id());
    Ok(name)
}

/// `mach_port_insert_right(name, name, MACH_MSG_TYPE_MAKE_SEND)`
///
/// Adds a send right to the entry holding the receive right.
pub fn mach_port_insert_send(space: &IpcSpace, name: MachPortName) -> KernResult<()> {
    let mut inner = active_write(space)?;
    let entry = inner.table.lookup_mut(name).ok_or(KernError::InvalidName)?;
    let ty = entry.ie_type();
    if ty & MACH_PORT_TYPE_RECEIVE == 0 {
        return Err(KernError::InvalidRight);
    }
    let port = entry.port().cloned().ok_or(KernError::InvalidRight)?;
    let mut st = port.lock();

    if ty & MACH_PORT_TYPE_SEND != 0 {
        let urefs = entry.urefs();
        if urefs >= MACH_PORT_UREFS_MAX {
            return Err(KernError::UrefsOverflow);
        }
        entry.set_urefs(urefs + 1);
    } else {
        st.srights += 1;
        entry.set_right(ty | MACH_PORT_TYPE_SEND, 1);
    }
    st.mscount += 1;
    Ok(())
}

/// Move or copy the right `name` of `from` into `to`
///
/// Stands in for sending the right in a message and receiving it: the
/// right is copied in with `disposition` and copied out under a name
/// `to` chooses. A dead right comes out as `MACH_PORT_DEAD`.
pub fn mach_port_transfer(
    from: &IpcSpace,
    name: MachPortName,
    disposition: PortDisposition,
    to: &IpcSpace,
) -> KernResult<MachPortName> {
    let msgt_name = disposition.copyin_type();
    match ipc_object_copyin(from, name, disposition)? {
        IpcObject::Port(port) => ipc_object_copyout(to, port, msgt_name, true).map_err(|(kr, port)| {
            ipc_object_destroy_now(IpcObject::Port(port), msgt_name);
            kr
        }),
        IpcObject::Dead => Ok(MACH_PORT_DEAD),
        IpcObject::Null => Ok(MACH_PORT_NULL),
    }
}

// ============================================================================
// Deallocation
// ============================================================================

/// `mach_port_deallocate`: release one user reference of a send,
/// send-once or dead-name right
pub fn mach_port_deallocate(space: &IpcSpace, name: MachPortName) -> KernResult<()> {
    let mut inner = active_write(space)?;
    ipc_right_dealloc(&mut inner, name)
}

/// `mach_port_destroy`: remove every right `name` denotes
pub fn mach_port_destroy(space: &IpcSpace, name: MachPortName) -> KernResult<()> {
    let mut reap = IpcKmsgQueue::new();
    let kr = {
        let mut inner = active_write(space)?;
        ipc_right_destroy(&mut inner, name, &mut reap)
    };
    ipc_kmsg_reap(&mut reap);
    kr
}

/// `mach_port_mod_refs`: add `delta` user references of `right`
pub fn mach_port_mod_refs(space: &IpcSpace, name: MachPortName, right: MachPortRight, delta: i32) -> KernResult<()> {
    let mut reap = IpcKmsgQueue::new();
    let kr = {
        let mut inner = active_write(space)?;
        ipc_right_delta(&mut inner, name, right, delta, &mut reap)
    };
    ipc_kmsg_reap(&mut reap);
    kr
}

// ============================================================================
// Queries
// ============================================================================

/// `mach_port_get_refs`
pub fn mach_port_get_refs(space: &IpcSpace, name: MachPortName, right: MachPortRight) -> KernResult<u32> {
    let mut inner = active_write(space)?;
    ipc_right_refs(&mut inner, name, right)
}

/// `mach_port_type`: the `MACH_PORT_TYPE_*` bits of `name`
///
/// A send right to a dead port is reported (and converted) as a dead name.
pub fn mach_port_type(space: &IpcSpace, name: MachPortName) -> KernResult<u32> {
    let mut inner = active_write(space)?;
    ipc_right_type(&mut inner, name)
}

/// The port a name denotes
pub fn mach_port_lookup(space: &IpcSpace, name: MachPortName) -> KernResult<Arc<IpcPort>> {
    let inner = space.read();
    if !inner.active {
        return Err(KernError::InvalidTask);
    }
    let entry = inner.table.lookup(name).ok_or(KernError::InvalidName)?;
    entry.port().cloned().ok_or(KernError::InvalidRight)
}

// ============================================================================
// Notification Requests
// ============================================================================

/// Make a send-once right for the notify port `notify` of `space`
fn notify_right(space: &IpcSpace, notify: MachPortName) -> KernResult<Option<Arc<IpcPort>>> {
    if notify == MACH_PORT_NULL {
        return Ok(None);
    }
    match ipc_object_copyin(space, notify, PortDisposition::MakeSendOnce)? {
        IpcObject::Port(port) => Ok(Some(port)),
        _ => Err(KernError::InvalidCapability),
    }
}

/// `mach_port_request_notification(MACH_NOTIFY_DEAD_NAME)`
///
/// Registers a dead-name request for `name`, to be sent to the receive
/// right `notify`. `MACH_PORT_NULL` cancels the request. A replaced
/// request gets a send-once notification. A name that is already dead is
/// notified at once.
pub fn mach_port_request_dead_name(space: &IpcSpace, name: MachPortName, notify: MachPortName) -> KernResult<()> {
    let notify_port = notify_right(space, notify)?;
    if let Some(previous) = ipc_right_dnrequest(space, name, true, notify_port)? {
        ipc_notify_send_once(previous);
    }
    Ok(())
}

/// `mach_port_request_notification(MACH_NOTIFY_NO_SENDERS)`
///
/// The notification fires when the port has no send rights and its
/// make-send count has reached `sync`.
pub fn mach_port_request_no_senders(
    space: &IpcSpace,
    name: MachPortName,
    sync: u32,
    notify: MachPortName,
) -> KernResult<()> {
    let port = receive_port(&space.read(), name)?;
    let notify_port = notify_right(space, notify)?;
    if let Some(previous) = ipc_port_nsrequest(&port, sync, notify_port) {
        ipc_notify_send_once(previous);
    }
    Ok(())
}

// ============================================================================
// Protected Payload
// ============================================================================

/// `mach_port_set_protected_payload`
///
/// Messages received on the port then carry `payload` in place of the
/// receive right's name.
pub fn mach_port_set_protected_payload(space: &IpcSpace, name: MachPortName, payload: u64) -> KernResult<()> {
    let inner = space.read();
    if !inner.active {
        return Err(KernError::InvalidTask);
    }
    let port = receive_port(&inner, name)?;
    port.lock().protected_payload = Some(payload);
    Ok(())
}

/// `mach_port_clear_protected_payload`
pub fn mach_port_clear_protected_payload(space: &IpcSpace, name: MachPortName) -> KernResult<()> {
    let inner = space.read();
    if !inner.active {
        return Err(KernError::InvalidTask);
    }
    let port = receive_port(&inner, name)?;
    port.lock().protected_payload = None;
    Ok(())
}
