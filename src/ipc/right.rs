//! IPC Rights - Capability transfer (copyin/copyout)
//!
//! Based on Mach4 ipc/ipc_right.c
//! Manipulates the right held by a single entry: taking it out of a space
//! for a message, putting it back in on receipt, and the user-level
//! reference operations.
//!
//! Every function here runs with the space write-locked (`&mut SpaceInner`)
//! and locks at most the one port the entry names. None of them frees an
//! entry left with no right unless it says so; callers decide when.

use alloc::sync::Arc;

use spin::MutexGuard;

use super::entry::{
    IpcEntry, MachPortName, MACH_PORT_TYPE_DEAD_NAME, MACH_PORT_TYPE_NONE,
    MACH_PORT_TYPE_PORT_RIGHTS, MACH_PORT_TYPE_RECEIVE, MACH_PORT_TYPE_SEND,
    MACH_PORT_TYPE_SEND_ONCE, MACH_PORT_TYPE_SEND_RIGHTS, MACH_PORT_UREFS_MAX,
};
use super::ipc_object::IpcObject;
use super::kmsg::IpcKmsgQueue;
use super::mach_msg::{
    MachMsgTypeName, PortDisposition, MACH_MSG_TYPE_PORT_RECEIVE, MACH_MSG_TYPE_PORT_SEND,
    MACH_MSG_TYPE_PORT_SEND_ONCE,
};
use super::notify::{
    ipc_notify_dead_name, ipc_notify_no_senders, ipc_notify_port_deleted, ipc_notify_send_once,
};
use super::port::{
    ipc_port_destroy, ipc_port_dncancel, ipc_port_dngrow, ipc_port_dnrequest, IpcPort,
    PortReceiver, PortState,
};
use super::space::{IpcSpace, SpaceInner};
use crate::kern::kern_return::{KernError, KernResult};

/// Port right kinds for the reference operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MachPortRight {
    /// Send right
    Send = 0,
    /// Receive right (only one per port)
    Receive = 1,
    /// Send-once right (consumed on use)
    SendOnce = 2,
    /// Dead name (port was destroyed)
    DeadName = 4,
}

/// `MACH_PORT_UREFS_OVERFLOW`
fn urefs_overflow(urefs: u32, delta: i32) -> bool {
    delta > 0 && urefs + delta as u32 > MACH_PORT_UREFS_MAX
}

/// `MACH_PORT_UREFS_UNDERFLOW`
fn urefs_underflow(urefs: u32, delta: i32) -> bool {
    delta < 0 && delta.unsigned_abs() > urefs
}

// ============================================================================
// Entry Maintenance
// ============================================================================

/// `ipc_right_check`: turn a send or send-once entry for a dead port into
/// a dead name
///
/// `st` is the locked state of the entry's port. Returns true if the port
/// was dead. A pending dead-name request becomes one more user reference,
/// standing for the name in the notification that was (or will be) sent.
pub fn ipc_right_check(entry: &mut IpcEntry, st: &mut PortState) -> bool {
    if st.active {
        return false;
    }

    let ty = entry.ie_type();
    if ty & MACH_PORT_TYPE_SEND != 0 {
        st.srights = st.srights.saturating_sub(1);
    } else if ty & MACH_PORT_TYPE_SEND_ONCE != 0 {
        st.sorights = st.sorights.saturating_sub(1);
    }

    let mut urefs = entry.urefs();
    if entry.request != 0 {
        entry.request = 0;
        urefs += 1;
    }
    entry.set_right(MACH_PORT_TYPE_DEAD_NAME, urefs);
    entry.object = None;
    true
}

/// `ipc_right_dncancel`: cancel the entry's dead-name request
///
/// Returns the request's send-once right, owed a port-deleted notification.
pub fn ipc_right_dncancel(
    entry: &mut IpcEntry,
    name: MachPortName,
    st: &mut PortState,
) -> Option<Arc<IpcPort>> {
    if entry.request == 0 {
        return None;
    }
    let request = core::mem::take(&mut entry.request);
    ipc_port_dncancel(st, name, request)
}

/// Lock the port an entry names
///
/// The guard borrows the returned `Arc`, not the entry, so the entry stays
/// free to be rewritten while the port is locked.
fn entry_port(entry: &IpcEntry) -> KernResult<Arc<IpcPort>> {
    entry.port().cloned().ok_or(KernError::InvalidRight)
}

// ============================================================================
// Copyin
// ============================================================================

/// `ipc_right_copyin_check`: could `name` be copied in as `msgt_name`?
///
/// Only looks; a dead port passes for the send dispositions, since copyin
/// will turn it into a dead name.
pub fn ipc_right_copyin_check(entry: &IpcEntry, msgt_name: PortDisposition) -> bool {
    let ty = entry.ie_type();
    match msgt_name {
        PortDisposition::MakeSend | PortDisposition::MakeSendOnce | PortDisposition::MoveReceive => {
            ty & MACH_PORT_TYPE_RECEIVE != 0
        }
        PortDisposition::CopySend | PortDisposition::MoveSend | PortDisposition::MoveSendOnce => {
            if ty & MACH_PORT_TYPE_DEAD_NAME != 0 {
                return true;
            }
            if ty & MACH_PORT_TYPE_SEND_RIGHTS == 0 {
                return false;
            }
            let alive = entry.port().is_some_and(|port| port.is_active());
            if !alive {
                return true;
            }
            if msgt_name == PortDisposition::MoveSendOnce {
                ty & MACH_PORT_TYPE_SEND_ONCE != 0
            } else {
                ty & MACH_PORT_TYPE_SEND != 0
            }
        }
    }
}

/// `ipc_right_copyin`: take a right named `name` out of the space
///
/// Returns the object and, if a dead-name request had to be cancelled, its
/// send-once right (the caller sends it a port-deleted notification once
/// the space is unlocked). An entry left holding nothing is not freed.
///
/// With `deadok`, the send dispositions accept a dead name and yield
/// `IpcObject::Dead`; otherwise that is `InvalidRight`.
pub fn ipc_right_copyin(
    space: &mut SpaceInner,
    name: MachPortName,
    msgt_name: PortDisposition,
    deadok: bool,
) -> KernResult<(IpcObject, Option<Arc<IpcPort>>)> {
    let entry = space.table.lookup_mut(name).ok_or(KernError::InvalidName)?;
    let ty = entry.ie_type();

    match msgt_name {
        PortDisposition::MakeSend => {
            if ty & MACH_PORT_TYPE_RECEIVE == 0 {
                return Err(KernError::InvalidRight);
            }
            let port = entry_port(entry)?;
            let mut st = port.lock();
            st.mscount = st.mscount.wrapping_add(1);
            st.srights += 1;
            drop(st);
            Ok((IpcObject::Port(port), None))
        }

        PortDisposition::MakeSendOnce => {
            if ty & MACH_PORT_TYPE_RECEIVE == 0 {
                return Err(KernError::InvalidRight);
            }
            let port = entry_port(entry)?;
            port.lock().sorights += 1;
            Ok((IpcObject::Port(port), None))
        }

        PortDisposition::MoveReceive => {
            if ty & MACH_PORT_TYPE_RECEIVE == 0 {
                return Err(KernError::InvalidRight);
            }
            let port = entry_port(entry)?;
            let mut st = port.lock();
            let mut soright = None;
            if ty & MACH_PORT_TYPE_SEND != 0 {
                // The entry keeps the send right.
                entry.set_right(MACH_PORT_TYPE_SEND, entry.urefs());
            } else {
                soright = ipc_right_dncancel(entry, name, &mut st);
                entry.object = None;
                entry.set_right(MACH_PORT_TYPE_NONE, 0);
            }
            st.clear_receiver();
            drop(st);
            Ok((IpcObject::Port(port), soright))
        }

        PortDisposition::CopySend => {
            if ty & MACH_PORT_TYPE_DEAD_NAME != 0 {
                return copy_dead(deadok);
            }
            if ty & MACH_PORT_TYPE_SEND == 0 {
                return Err(KernError::InvalidRight);
            }
            let port = entry_port(entry)?;
            let mut st = port.lock();
            if ipc_right_check(entry, &mut st) {
                return copy_dead(deadok);
            }
            st.srights += 1;
            drop(st);
            Ok((IpcObject::Port(port), None))
        }

        PortDisposition::MoveSend => {
            if ty & MACH_PORT_TYPE_DEAD_NAME != 0 {
                return move_dead(entry, deadok);
            }
            if ty & MACH_PORT_TYPE_SEND == 0 {
                return Err(KernError::InvalidRight);
            }
            let port = entry_port(entry)?;
            let mut st = port.lock();
            if ipc_right_check(entry, &mut st) {
                drop(st);
                return move_dead(entry, deadok);
            }

            let mut soright = None;
            if entry.urefs() == 1 {
                if ty & MACH_PORT_TYPE_RECEIVE != 0 {
                    entry.set_right(MACH_PORT_TYPE_RECEIVE, 0);
                } else {
                    soright = ipc_right_dncancel(entry, name, &mut st);
                    entry.object = None;
                    entry.set_right(MACH_PORT_TYPE_NONE, 0);
                }
            } else {
                st.srights += 1;
                entry.set_urefs(entry.urefs() - 1);
            }
            drop(st);
            Ok((IpcObject::Port(port), soright))
        }

        PortDisposition::MoveSendOnce => {
            if ty & MACH_PORT_TYPE_DEAD_NAME != 0 {
                return move_dead(entry, deadok);
            }
            if ty & MACH_PORT_TYPE_SEND_ONCE == 0 {
                return Err(KernError::InvalidRight);
            }
            let port = entry_port(entry)?;
            let mut st = port.lock();
            if ipc_right_check(entry, &mut st) {
                drop(st);
                return move_dead(entry, deadok);
            }
            let soright = ipc_right_dncancel(entry, name, &mut st);
            entry.object = None;
            entry.set_right(MACH_PORT_TYPE_NONE, 0);
            drop(st);
            Ok((IpcObject::Port(port), soright))
        }
    }
}

fn copy_dead(deadok: bool) -> KernResult<(IpcObject, Option<Arc<IpcPort>>)> {
    if !deadok {
        return Err(KernError::InvalidRight);
    }
    Ok((IpcObject::Dead, None))
}

fn move_dead(entry: &mut IpcEntry, deadok: bool) -> KernResult<(IpcObject, Option<Arc<IpcPort>>)> {
    if !deadok {
        return Err(KernError::InvalidRight);
    }
    let urefs = entry.urefs();
    if urefs == 1 {
        entry.set_right(MACH_PORT_TYPE_NONE, 0);
    } else {
        entry.set_urefs(urefs - 1);
    }
    Ok((IpcObject::Dead, None))
}

/// `ipc_right_copyin_undo`: put back a send right whose port has since died
///
/// Only used for copy-send, move-send and move-send-once. Because the port
/// is dead, the entry comes back as a dead name rather than as the right
/// that was taken. Returns the cancelled dead-name request, if any; it is
/// owed a dead-name notification, for which the entry carries an extra
/// user reference.
pub fn ipc_right_copyin_undo(
    space: &mut SpaceInner,
    name: MachPortName,
    msgt_name: PortDisposition,
    object: IpcObject,
    soright: Option<Arc<IpcPort>>,
) -> Option<Arc<IpcPort>> {
    let copy = msgt_name == PortDisposition::CopySend;

    if let Some(entry) = space.table.allocated_mut(name) {
        let ty = entry.ie_type();
        if soright.is_some() {
            entry.set_right(MACH_PORT_TYPE_DEAD_NAME, 2);
        } else if ty == MACH_PORT_TYPE_NONE {
            entry.set_right(MACH_PORT_TYPE_DEAD_NAME, 1);
        } else if ty == MACH_PORT_TYPE_DEAD_NAME {
            if !copy {
                entry.set_urefs(entry.urefs() + 1);
            }
        } else {
            if !copy {
                entry.set_urefs(entry.urefs() + 1);
            }
            if let Some(port) = entry.port().cloned() {
                ipc_right_check(entry, &mut port.lock());
            }
        }
    }

    // The copied-in right goes away without notifications: its port is dead.
    if let IpcObject::Port(port) = object {
        let mut st = port.lock();
        if msgt_name == PortDisposition::MoveSendOnce {
            st.sorights = st.sorights.saturating_sub(1);
        } else {
            st.srights = st.srights.saturating_sub(1);
        }
    }
    soright
}

/// `ipc_right_copyin_two`: take two send rights from one entry
///
/// Used when a header names the same send right for both destination and
/// reply with move-send. The entry must hold at least two user references.
pub fn ipc_right_copyin_two(
    space: &mut SpaceInner,
    name: MachPortName,
) -> KernResult<(Arc<IpcPort>, Option<Arc<IpcPort>>)> {
    let entry = space.table.lookup_mut(name).ok_or(KernError::InvalidName)?;
    let ty = entry.ie_type();
    if ty & MACH_PORT_TYPE_SEND == 0 {
        return Err(KernError::InvalidRight);
    }
    let urefs = entry.urefs();
    if urefs < 2 {
        return Err(KernError::InvalidRight);
    }

    let port = entry_port(entry)?;
    let mut st = port.lock();
    if ipc_right_check(entry, &mut st) {
        return Err(KernError::InvalidRight);
    }

    let mut soright = None;
    if urefs > 2 {
        st.srights += 2;
        entry.set_urefs(urefs - 2);
    } else if ty & MACH_PORT_TYPE_RECEIVE != 0 {
        st.srights += 1;
        entry.set_right(MACH_PORT_TYPE_RECEIVE, 0);
    } else {
        soright = ipc_right_dncancel(entry, name, &mut st);
        st.srights += 1;
        entry.object = None;
        entry.set_right(MACH_PORT_TYPE_NONE, 0);
    }
    drop(st);
    Ok((port, soright))
}

// ============================================================================
// Copyout
// ============================================================================

/// `ipc_right_copyout`: put a right into entry `name`
///
/// `msgt_name` is the receive-side type. `st` is the port's locked, active
/// state. The entry is either fresh or the one `ipc_right_reverse` found.
/// With `overflow`, a send right that would push the user references past
/// the maximum is absorbed instead of failing with `UrefsOverflow`.
pub fn ipc_right_copyout(
    space: &mut SpaceInner,
    name: MachPortName,
    msgt_name: MachMsgTypeName,
    overflow: bool,
    port: &Arc<IpcPort>,
    st: &mut PortState,
) -> KernResult<()> {
    let space_id = space.id;
    let entry = space.table.allocated_mut(name).ok_or(KernError::InvalidName)?;
    let ty = entry.ie_type();

    match msgt_name {
        MACH_MSG_TYPE_PORT_SEND_ONCE => {
            entry.object = Some(Arc::clone(port));
            entry.set_right(MACH_PORT_TYPE_SEND_ONCE, 1);
        }

        MACH_MSG_TYPE_PORT_SEND => {
            if ty & MACH_PORT_TYPE_SEND != 0 {
                let urefs = entry.urefs();
                if urefs + 1 >= MACH_PORT_UREFS_MAX {
                    if overflow {
                        // urefs stay pegged at the maximum
                        st.srights -= 1;
                        return Ok(());
                    }
                    return Err(KernError::UrefsOverflow);
                }
                st.srights -= 1;
                entry.set_urefs(urefs + 1);
            } else if ty & MACH_PORT_TYPE_RECEIVE != 0 {
                entry.set_right(MACH_PORT_TYPE_SEND | MACH_PORT_TYPE_RECEIVE, 1);
            } else {
                entry.object = Some(Arc::clone(port));
                entry.set_right(MACH_PORT_TYPE_SEND, 1);
            }
        }

        MACH_MSG_TYPE_PORT_RECEIVE => {
            st.receiver = PortReceiver::Space {
                space: space_id,
                name,
            };
            if ty & MACH_PORT_TYPE_SEND != 0 {
                entry.set_right(MACH_PORT_TYPE_SEND | MACH_PORT_TYPE_RECEIVE, entry.urefs());
            } else {
                entry.object = Some(Arc::clone(port));
                entry.set_right(MACH_PORT_TYPE_RECEIVE, 0);
            }
        }

        _ => return Err(KernError::InvalidValue),
    }
    Ok(())
}

/// `ipc_right_reverse`: find the name `space` already uses for `port`
///
/// Only an active port has one. Returns the name together with the port's
/// lock, which the caller needs for `ipc_right_copyout`.
pub fn ipc_right_reverse<'p>(
    space: &SpaceInner,
    port: &'p Arc<IpcPort>,
) -> Option<(MachPortName, MutexGuard<'p, PortState>)> {
    let st = port.lock();
    if !st.active {
        return None;
    }
    if let Some(name) = st.receiver_name_in(space.id) {
        return Some((name, st));
    }
    let name = space.table.find_send(port)?;
    Some((name, st))
}

// ============================================================================
// Destruction
// ============================================================================

/// `ipc_right_clean`: release the right held by `name` in a dying space
///
/// Leaves the entry with no right; the caller frees it.
pub fn ipc_right_clean(space: &mut SpaceInner, name: MachPortName, reap: &mut IpcKmsgQueue) {
    let entry = match space.table.allocated_mut(name) {
        Some(entry) => entry,
        None => return,
    };
    let ty = entry.ie_type();
    let port = entry.object.take();
    let request = core::mem::take(&mut entry.request);
    entry.set_right(MACH_PORT_TYPE_NONE, 0);

    let port = match port {
        Some(port) if ty & MACH_PORT_TYPE_PORT_RIGHTS != 0 => port,
        _ => return,
    };

    let mut st = port.lock();
    if !st.active {
        if ty & MACH_PORT_TYPE_SEND != 0 {
            st.srights = st.srights.saturating_sub(1);
        } else if ty & MACH_PORT_TYPE_SEND_ONCE != 0 {
            st.sorights = st.sorights.saturating_sub(1);
        }
        return;
    }

    let dnrequest = match request {
        0 => None,
        index => ipc_port_dncancel(&mut st, name, index),
    };
    let nsrequest = if ty & MACH_PORT_TYPE_SEND != 0 {
        st.release_send_locked()
    } else {
        None
    };

    if ty & MACH_PORT_TYPE_RECEIVE != 0 {
        st.clear_receiver();
        drop(st);
        ipc_port_destroy(&port, reap);
    } else if ty & MACH_PORT_TYPE_SEND_ONCE != 0 {
        drop(st);
        ipc_notify_send_once(port);
    } else {
        drop(st);
    }

    if let Some((nsrequest, mscount)) = nsrequest {
        ipc_notify_no_senders(nsrequest, mscount);
    }
    if let Some(dnrequest) = dnrequest {
        ipc_notify_port_deleted(dnrequest, name);
    }
}

/// `ipc_right_destroy`: release whatever right `name` holds and free it
pub fn ipc_right_destroy(
    space: &mut SpaceInner,
    name: MachPortName,
    reap: &mut IpcKmsgQueue,
) -> KernResult<()> {
    if space.table.lookup(name).is_none() {
        return Err(KernError::InvalidName);
    }
    ipc_right_clean(space, name, reap);
    space.table.dealloc(name);
    Ok(())
}

/// `ipc_right_dealloc`: drop one user reference
pub fn ipc_right_dealloc(space: &mut SpaceInner, name: MachPortName) -> KernResult<()> {
    let entry = space.table.lookup_mut(name).ok_or(KernError::InvalidName)?;
    let ty = entry.ie_type();

    if ty & MACH_PORT_TYPE_SEND_RIGHTS != 0 {
        let port = entry_port(entry)?;
        let mut st = port.lock();
        if !ipc_right_check(entry, &mut st) {
            return dealloc_live(space, name, ty, &port, st);
        }
    } else if ty != MACH_PORT_TYPE_DEAD_NAME {
        return Err(KernError::InvalidRight);
    }

    // Dead name
    let entry = space.table.lookup_mut(name).ok_or(KernError::InvalidName)?;
    if entry.urefs() <= 1 {
        space.table.dealloc(name);
    } else {
        entry.set_urefs(entry.urefs() - 1);
    }
    Ok(())
}

fn dealloc_live(
    space: &mut SpaceInner,
    name: MachPortName,
    ty: u32,
    port: &Arc<IpcPort>,
    mut st: MutexGuard<'_, PortState>,
) -> KernResult<()> {
    let entry = space.table.lookup_mut(name).ok_or(KernError::InvalidName)?;
    let mut dnrequest = None;
    let mut nsrequest = None;
    let mut send_once = false;

    if ty == MACH_PORT_TYPE_SEND_ONCE {
        dnrequest = ipc_right_dncancel(entry, name, &mut st);
        space.table.dealloc(name);
        send_once = true;
    } else if entry.urefs() == 1 {
        nsrequest = st.release_send_locked();
        if ty & MACH_PORT_TYPE_RECEIVE != 0 {
            entry.set_right(MACH_PORT_TYPE_RECEIVE, 0);
        } else {
            dnrequest = ipc_right_dncancel(entry, name, &mut st);
            space.table.dealloc(name);
        }
    } else {
        entry.set_urefs(entry.urefs() - 1);
    }
    drop(st);

    if send_once {
        ipc_notify_send_once(Arc::clone(port));
    }
    if let Some((nsrequest, mscount)) = nsrequest {
        ipc_notify_no_senders(nsrequest, mscount);
    }
    if let Some(dnrequest) = dnrequest {
        ipc_notify_port_deleted(dnrequest, name);
    }
    Ok(())
}

/// `ipc_right_delta`: change the user references of one kind of right
///
/// A receive right only accepts 0 or -1; -1 destroys the port. A
/// send/receive entry then keeps its send references as a dead name.
pub fn ipc_right_delta(
    space: &mut SpaceInner,
    name: MachPortName,
    right: MachPortRight,
    delta: i32,
    reap: &mut IpcKmsgQueue,
) -> KernResult<()> {
    let entry = space.table.lookup_mut(name).ok_or(KernError::InvalidName)?;
    let ty = entry.ie_type();

    match right {
        MachPortRight::Receive => {
            if ty & MACH_PORT_TYPE_RECEIVE == 0 {
                return Err(KernError::InvalidRight);
            }
            match delta {
                0 => return Ok(()),
                -1 => {}
                _ => return Err(KernError::InvalidValue),
            }
            let port = entry_port(entry)?;
            let mut st = port.lock();
            let mut dnrequest = None;
            if ty & MACH_PORT_TYPE_SEND != 0 {
                // The port dies first; a registered request fires as a
                // dead-name notification and keeps a reference here.
                let mut urefs = entry.urefs();
                if entry.request != 0 {
                    entry.request = 0;
                    urefs += 1;
                }
                entry.set_right(MACH_PORT_TYPE_DEAD_NAME, urefs);
                entry.object = None;
                st.srights = st.srights.saturating_sub(1);
            } else {
                dnrequest = ipc_right_dncancel(entry, name, &mut st);
                space.table.dealloc(name);
            }
            st.clear_receiver();
            drop(st);
            ipc_port_destroy(&port, reap);
            if let Some(dnrequest) = dnrequest {
                ipc_notify_port_deleted(dnrequest, name);
            }
            Ok(())
        }

        MachPortRight::SendOnce => {
            if ty & MACH_PORT_TYPE_SEND_ONCE == 0 {
                return Err(KernError::InvalidRight);
            }
            let port = entry_port(entry)?;
            let mut st = port.lock();
            if ipc_right_check(entry, &mut st) {
                return Err(KernError::InvalidRight);
            }
            match delta {
                0 => return Ok(()),
                -1 => {}
                _ => return Err(KernError::InvalidValue),
            }
            let dnrequest = ipc_right_dncancel(entry, name, &mut st);
            space.table.dealloc(name);
            drop(st);
            ipc_notify_send_once(port);
            if let Some(dnrequest) = dnrequest {
                ipc_notify_port_deleted(dnrequest, name);
            }
            Ok(())
        }

        MachPortRight::DeadName => {
            if ty & MACH_PORT_TYPE_SEND_RIGHTS != 0 {
                let port = entry_port(entry)?;
                let mut st = port.lock();
                if !ipc_right_check(entry, &mut st) {
                    return Err(KernError::InvalidRight);
                }
            } else if ty & MACH_PORT_TYPE_DEAD_NAME == 0 {
                return Err(KernError::InvalidRight);
            }
            let urefs = entry.urefs();
            if urefs_underflow(urefs, delta) {
                return Err(KernError::InvalidValue);
            }
            if urefs_overflow(urefs, delta) {
                return Err(KernError::UrefsOverflow);
            }
            let urefs = (urefs as i64 + delta as i64) as u32;
            if urefs == 0 {
                space.table.dealloc(name);
            } else {
                entry.set_urefs(urefs);
            }
            Ok(())
        }

        MachPortRight::Send => {
            if ty & MACH_PORT_TYPE_SEND == 0 {
                return Err(KernError::InvalidRight);
            }
            let urefs = entry.urefs();
            if urefs_underflow(urefs, delta) {
                return Err(KernError::InvalidValue);
            }
            // A send entry tops out one below the maximum.
            if urefs_overflow(urefs + 1, delta) {
                return Err(KernError::UrefsOverflow);
            }
            let port = entry_port(entry)?;
            let mut st = port.lock();
            if ipc_right_check(entry, &mut st) {
                return Err(KernError::InvalidRight);
            }

            let urefs = (urefs as i64 + delta as i64) as u32;
            let mut nsrequest = None;
            let mut dnrequest = None;
            if urefs == 0 {
                nsrequest = st.release_send_locked();
                if ty & MACH_PORT_TYPE_RECEIVE != 0 {
                    entry.set_right(MACH_PORT_TYPE_RECEIVE, 0);
                } else {
                    dnrequest = ipc_right_dncancel(entry, name, &mut st);
                    space.table.dealloc(name);
                }
            } else {
                entry.set_urefs(urefs);
            }
            drop(st);
            if let Some((nsrequest, mscount)) = nsrequest {
                ipc_notify_no_senders(nsrequest, mscount);
            }
            if let Some(dnrequest) = dnrequest {
                ipc_notify_port_deleted(dnrequest, name);
            }
            Ok(())
        }
    }
}

/// User references `name` holds for `right`, after noticing port death
pub fn ipc_right_refs(
    space: &mut SpaceInner,
    name: MachPortName,
    right: MachPortRight,
) -> KernResult<u32> {
    let ty = ipc_right_type(space, name)?;
    let entry = space.table.lookup(name).ok_or(KernError::InvalidName)?;
    Ok(match right {
        MachPortRight::Send if ty & MACH_PORT_TYPE_SEND != 0 => entry.urefs(),
        MachPortRight::DeadName if ty & MACH_PORT_TYPE_DEAD_NAME != 0 => entry.urefs(),
        MachPortRight::Receive => u32::from(ty & MACH_PORT_TYPE_RECEIVE != 0),
        MachPortRight::SendOnce => u32::from(ty & MACH_PORT_TYPE_SEND_ONCE != 0),
        _ => 0,
    })
}

/// Type bits of `name`, after noticing port death
pub fn ipc_right_type(space: &mut SpaceInner, name: MachPortName) -> KernResult<u32> {
    let entry = space.table.lookup_mut(name).ok_or(KernError::InvalidName)?;
    if entry.ie_type() & MACH_PORT_TYPE_SEND_RIGHTS != 0 {
        let port = entry_port(entry)?;
        ipc_right_check(entry, &mut port.lock());
    }
    Ok(entry.ie_type())
}

// ============================================================================
// Dead-Name Requests
// ============================================================================

/// `ipc_right_dnrequest`: register (or with `None`, cancel) a dead-name
/// request for `name`
///
/// Returns the previously registered send-once right. If the name is
/// already dead and `immediate` is set, the notification is sent at once.
/// Grows the port's request table as needed, unlocking the space to do
/// so. On failure the `notify` right is destroyed.
pub fn ipc_right_dnrequest(
    space: &IpcSpace,
    name: MachPortName,
    immediate: bool,
    mut notify: Option<Arc<IpcPort>>,
) -> KernResult<Option<Arc<IpcPort>>> {
    let result = loop {
        let mut inner = space.write();
        if !inner.active {
            break Err(KernError::InvalidTask);
        }
        let entry = match inner.table.lookup_mut(name) {
            Some(entry) => entry,
            None => break Err(KernError::InvalidName),
        };

        if entry.ie_type() & MACH_PORT_TYPE_PORT_RIGHTS != 0 {
            let port = match entry_port(entry) {
                Ok(port) => port,
                Err(kr) => break Err(kr),
            };
            let mut st = port.lock();
            if !ipc_right_check(entry, &mut st) {
                let previous = ipc_right_dncancel(entry, name, &mut st);
                let n = match notify.take() {
                    Some(n) => n,
                    None => return Ok(previous),
                };
                match ipc_port_dnrequest(&mut st, name, n) {
                    Ok(request) => {
                        entry.request = request;
                        return Ok(previous);
                    }
                    Err((_, n)) => {
                        notify = Some(n);
                        drop(st);
                        drop(inner);
                        log::debug!("ipc_right_dnrequest: growing requests of {:?}", port);
                        if let Err(kr) = ipc_port_dngrow(&port, space.heap()) {
                            break Err(kr);
                        }
                        continue;
                    }
                }
            }
        }

        let ty = entry.ie_type();
        if ty & MACH_PORT_TYPE_DEAD_NAME != 0 && immediate {
            if let Some(n) = notify.take() {
                let urefs = entry.urefs();
                if urefs_overflow(urefs, 1) {
                    notify = Some(n);
                    break Err(KernError::UrefsOverflow);
                }
                entry.set_urefs(urefs + 1);
                drop(inner);
                ipc_notify_dead_name(n, name);
                return Ok(None);
            }
        }
        if ty & (MACH_PORT_TYPE_PORT_RIGHTS | MACH_PORT_TYPE_DEAD_NAME) != 0 {
            break Err(KernError::InvalidArgument);
        }
        break Err(KernError::InvalidRight);
    };

    if let Some(notify) = notify {
        ipc_notify_send_once(notify);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::port_ops::{
        mach_port_allocate_receive, mach_port_insert_send, mach_port_lookup, mach_port_type,
    };

    fn setup() -> (Arc<IpcSpace>, MachPortName, Arc<IpcPort>) {
        let space = IpcSpace::new();
        let name = mach_port_allocate_receive(&space).unwrap();
        let port = mach_port_lookup(&space, name).unwrap();
        (space, name, port)
    }

    #[test]
    fn test_make_send_bumps_counts() {
        let (space, name, port) = setup();
        let mut inner = space.write();
        let (object, soright) = ipc_right_copyin(&mut inner, name, PortDisposition::MakeSend, false).unwrap();
        assert!(object.is_port(&port));
        assert!(soright.is_none());
        assert_eq!(port.srights(), 1);
        assert_eq!(port.mscount(), 1);
    }

    #[test]
    fn test_copy_send_requires_send() {
        let (space, name, _port) = setup();
        let mut inner = space.write();
        let err = ipc_right_copyin(&mut inner, name, PortDisposition::CopySend, true).unwrap_err();
        assert_eq!(err, KernError::InvalidRight);
        let err = ipc_right_copyin(&mut inner, 0x0500_0007, PortDisposition::CopySend, true).unwrap_err();
        assert_eq!(err, KernError::InvalidName);
    }

    #[test]
    fn test_move_send_last_uref_keeps_receive() {
        let (space, name, port) = setup();
        mach_port_insert_send(&space, name).unwrap();
        assert_eq!(port.srights(), 1);

        let mut inner = space.write();
        let (object, _) = ipc_right_copyin(&mut inner, name, PortDisposition::MoveSend, false).unwrap();
        assert!(object.is_port(&port));
        // The send right moved into the message; the count is unchanged.
        assert_eq!(port.srights(), 1);
        let entry = inner.table.lookup(name).unwrap();
        assert_eq!(entry.ie_type(), MACH_PORT_TYPE_RECEIVE);
        assert_eq!(entry.urefs(), 0);
    }

    #[test]
    fn test_move_receive_clears_receiver() {
        let (space, name, port) = setup();
        let mut inner = space.write();
        let (object, _) = ipc_right_copyin(&mut inner, name, PortDisposition::MoveReceive, false).unwrap();
        assert!(object.is_port(&port));
        assert_eq!(inner.table.allocated_mut(name).unwrap().ie_type(), MACH_PORT_TYPE_NONE);
        assert!(port.lock().receiver_name_in(inner.id).is_none());
    }

    #[test]
    fn test_copyin_two() {
        let (space, name, port) = setup();
        mach_port_insert_send(&space, name).unwrap();
        let mut inner = space.write();
        assert_eq!(ipc_right_copyin_two(&mut inner, name).unwrap_err(), KernError::InvalidRight);

        inner.table.lookup_mut(name).unwrap().set_urefs(2);
        let (p, soright) = ipc_right_copyin_two(&mut inner, name).unwrap();
        assert!(Arc::ptr_eq(&p, &port));
        assert!(soright.is_none());
        // One right moved, one was made.
        assert_eq!(port.srights(), 2);
        assert_eq!(inner.table.lookup(name).unwrap().ie_type(), MACH_PORT_TYPE_RECEIVE);
    }

    #[test]
    fn test_check_converts_dead_port() {
        let a = IpcSpace::new();
        let b = IpcSpace::new();
        let name = mach_port_allocate_receive(&a).unwrap();
        let port = mach_port_lookup(&a, name).unwrap();
        let sname = crate::ipc::port_ops::mach_port_transfer(&a, name, PortDisposition::MakeSend, &b).unwrap();

        a.destroy();
        assert_eq!(mach_port_type(&b, sname).unwrap(), MACH_PORT_TYPE_DEAD_NAME);
        assert_eq!(port.srights(), 0);

        let mut inner = b.write();
        let err = ipc_right_copyin(&mut inner, sname, PortDisposition::CopySend, false).unwrap_err();
        assert_eq!(err, KernError::InvalidRight);
        let (object, _) = ipc_right_copyin(&mut inner, sname, PortDisposition::MoveSend, true).unwrap();
        assert!(matches!(object, IpcObject::Dead));
        assert_eq!(inner.table.allocated_mut(sname).unwrap().ie_type(), MACH_PORT_TYPE_NONE);
    }

    #[test]
    fn test_delta_send_and_dead_name() {
        let (space, name, port) = setup();
        mach_port_insert_send(&space, name).unwrap();
        let mut reap = IpcKmsgQueue::new();
        let mut inner = space.write();

        ipc_right_delta(&mut inner, name, MachPortRight::Send, 4, &mut reap).unwrap();
        assert_eq!(ipc_right_refs(&mut inner, name, MachPortRight::Send).unwrap(), 5);
        assert_eq!(
            ipc_right_delta(&mut inner, name, MachPortRight::Send, -6, &mut reap),
            Err(KernError::InvalidValue)
        );
        assert_eq!(
            ipc_right_delta(&mut inner, name, MachPortRight::Send, 0xFFFF, &mut reap),
            Err(KernError::UrefsOverflow)
        );

        // Destroying the receive right leaves the send references as a dead name.
        ipc_right_delta(&mut inner, name, MachPortRight::Receive, -1, &mut reap).unwrap();
        assert!(!port.is_active());
        assert_eq!(ipc_right_type(&mut inner, name).unwrap(), MACH_PORT_TYPE_DEAD_NAME);
        assert_eq!(ipc_right_refs(&mut inner, name, MachPortRight::DeadName).unwrap(), 5);
        ipc_right_delta(&mut inner, name, MachPortRight::DeadName, -5, &mut reap).unwrap();
        assert!(inner.table.lookup(name).is_none());
    }

    #[test]
    fn test_copyout_send_merges() {
        let (space, name, port) = setup();
        let mut inner = space.write();
        let (object, _) = ipc_right_copyin(&mut inner, name, PortDisposition::MakeSend, false).unwrap();
        let p = object.port().cloned().unwrap();

        let (found, mut st) = ipc_right_reverse(&inner, &p).unwrap();
        assert_eq!(found, name);
        ipc_right_copyout(&mut inner, found, MACH_MSG_TYPE_PORT_SEND, false, &p, &mut st).unwrap();
        drop(st);
        let entry = inner.table.lookup(name).unwrap();
        assert_eq!(entry.ie_type(), MACH_PORT_TYPE_SEND | MACH_PORT_TYPE_RECEIVE);
        assert_eq!(entry.urefs(), 1);
        assert_eq!(port.srights(), 1);
    }

    #[test]
    fn test_copyout_urefs_overflow() {
        let (space, name, port) = setup();
        mach_port_insert_send(&space, name).unwrap();
        let mut inner = space.write();
        inner.table.lookup_mut(name).unwrap().set_urefs(MACH_PORT_UREFS_MAX - 1);

        let (object, _) = ipc_right_copyin(&mut inner, name, PortDisposition::MakeSend, false).unwrap();
        let p = object.port().cloned().unwrap();
        let mut st = p.lock();
        assert_eq!(
            ipc_right_copyout(&mut inner, name, MACH_MSG_TYPE_PORT_SEND, false, &p, &mut st),
            Err(KernError::UrefsOverflow)
        );
        ipc_right_copyout(&mut inner, name, MACH_MSG_TYPE_PORT_SEND, true, &p, &mut st).unwrap();
        drop(st);
        assert_eq!(port.srights(), 1);
        assert_eq!(inner.table.lookup(name).unwrap().urefs(), MACH_PORT_UREFS_MAX - 1);
    }

    #[test]
    fn test_dnrequest_grows_and_cancels() {
        let (space, name, port) = setup();
        mach_port_insert_send(&space, name).unwrap();
        let notify_name = mach_port_allocate_receive(&space).unwrap();
        let notify = mach_port_lookup(&space, notify_name).unwrap();
        notify.lock().sorights += 1;

        let previous = ipc_right_dnrequest(&space, name, false, Some(Arc::clone(&notify))).unwrap();
        assert!(previous.is_none());
        assert_eq!(port.lock().dnrequests.len(), 1);

        let previous = ipc_right_dnrequest(&space, name, false, None).unwrap();
        assert!(previous.is_some_and(|p| Arc::ptr_eq(&p, &notify)));
        assert!(port.lock().dnrequests.is_empty());
    }
}
