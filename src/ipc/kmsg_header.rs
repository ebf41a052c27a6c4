//! Header copyin/copyout
//!
//! Based on Mach4 ipc/ipc_kmsg.c (ipc_kmsg_copyin_header,
//! ipc_kmsg_copyout_header)
//!
//! The common shapes of traffic (one-way send, RPC request, RPC reply) each
//! have a fast path that touches one entry and at most two ports. Anything
//! else, or any surprise on a fast path, falls through to the general code.
//! The general code for distinct destination and reply names compares port
//! death timestamps so that the outcome is one that could have happened if
//! the whole operation ran at a single instant.

use alloc::sync::Arc;

use super::entry::{
    mach_port_valid, MachPortName, MACH_PORT_DEAD, MACH_PORT_NULL, MACH_PORT_TYPE_RECEIVE,
    MACH_PORT_TYPE_SEND, MACH_PORT_TYPE_SEND_ONCE,
};
use super::ipc_object::{ipc_object_copyin_type, ipc_object_copyout_dest, IpcObject};
use super::kmsg::{quiet_release, KmsgHeader, PortField};
use super::mach_msg::{
    msgt_is_port_any_send, MachMsgBits, MsgError, MsgSpecialBits, PortDisposition,
    MACH_MSGH_BITS_UNUSED, MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE,
    MACH_MSG_TYPE_MOVE_SEND_ONCE,
    MACH_MSG_TYPE_PORT_SEND, MACH_MSG_TYPE_PORT_SEND_ONCE, MACH_MSG_TYPE_PROTECTED_PAYLOAD,
};
use super::notify::{ipc_notify_dead_name, ipc_notify_no_senders, ipc_notify_port_deleted, ipc_notify_send_once};
use super::port::{
    ip_timestamp_order, ipc_port_copy_send, ipc_port_dngrow, ipc_port_dnrequest,
    ipc_port_release_sonce, IpcPort,
};
use super::right::{
    ipc_right_copyin, ipc_right_copyin_check, ipc_right_copyin_two, ipc_right_copyin_undo,
    ipc_right_copyout, ipc_right_reverse,
};
use super::space::{IpcSpace, SpaceInner};
use crate::counter;
use crate::kern::counters::{
    C_IPC_KMSG_COPYIN_HEADER_FAST_ASYNC, C_IPC_KMSG_COPYIN_HEADER_FAST_REPLY,
    C_IPC_KMSG_COPYIN_HEADER_FAST_REQUEST, C_IPC_KMSG_COPYIN_HEADER_SLOW,
    C_IPC_KMSG_COPYOUT_HEADER_FAST_ASYNC, C_IPC_KMSG_COPYOUT_HEADER_FAST_REPLY,
    C_IPC_KMSG_COPYOUT_HEADER_FAST_REQUEST, C_IPC_KMSG_COPYOUT_HEADER_SLOW,
};

const BITS_ASYNC: u32 = MachMsgBits::new(MACH_MSG_TYPE_COPY_SEND, 0).0;
const BITS_REQUEST: u32 = MachMsgBits::new(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE).0;
const BITS_REPLY: u32 = MachMsgBits::new(MACH_MSG_TYPE_MOVE_SEND_ONCE, 0).0;

const BITS_OUT_ASYNC: u32 = MachMsgBits::new(MACH_MSG_TYPE_PORT_SEND, 0).0;
const BITS_OUT_REQUEST: u32 = MachMsgBits::new(MACH_MSG_TYPE_PORT_SEND, MACH_MSG_TYPE_PORT_SEND_ONCE).0;
const BITS_OUT_REPLY: u32 = MachMsgBits::new(MACH_MSG_TYPE_PORT_SEND_ONCE, 0).0;

/// Copied-in header rights
struct HeaderRights {
    dest: IpcObject,
    reply: IpcObject,
    /// Cancelled dead-name requests, owed port-deleted notifications
    dest_soright: Option<Arc<IpcPort>>,
    reply_soright: Option<Arc<IpcPort>>,
}

// ============================================================================
// Copyin
// ============================================================================

/// `ipc_kmsg_copyin_header`: turn the header's names into rights
///
/// `notify` names a receive right in `space`; a dead-name request for it
/// that the destination copyin would cancel is consumed silently instead
/// of producing a port-deleted notification. On failure neither the space
/// nor the header has changed.
pub fn ipc_kmsg_copyin_header(
    header: &mut KmsgHeader,
    space: &IpcSpace,
    notify: MachPortName,
) -> Result<(), MsgError> {
    let mbits = header.bits;
    let dest_name = header.remote.name().ok_or(MsgError::SendInvalidHeader)?;
    let reply_name = header.local.name().ok_or(MsgError::SendInvalidHeader)?;
    let dest_type = mbits.remote();
    let reply_type = mbits.local();

    let reply_ok = if reply_type == 0 {
        reply_name == MACH_PORT_NULL
    } else {
        msgt_is_port_any_send(reply_type)
    };
    if mbits.0 & MACH_MSGH_BITS_UNUSED != 0 || !msgt_is_port_any_send(dest_type) || !reply_ok {
        log::debug!("ipc_kmsg_copyin_header: bad bits {:#x}", mbits.0);
        return Err(MsgError::SendInvalidHeader);
    }

    if notify == MACH_PORT_NULL {
        let fast = match mbits.ports() {
            BITS_ASYNC => copyin_fast_async(space, dest_name),
            BITS_REQUEST if dest_name != reply_name => copyin_fast_request(space, dest_name, reply_name),
            BITS_REPLY => copyin_fast_reply(space, dest_name),
            _ => None,
        };
        if let Some((dest, reply)) = fast {
            header.remote = PortField::Object(dest);
            header.local = PortField::Object(reply);
            header.bits = mbits.with_ports(ipc_object_copyin_type(dest_type), ipc_object_copyin_type(reply_type));
            return Ok(());
        }
    }

    counter!(C_IPC_KMSG_COPYIN_HEADER_SLOW);
    let mut inner = space.write();
    if !inner.active {
        return Err(MsgError::SendInvalidDest);
    }

    let notify_port = if notify != MACH_PORT_NULL {
        match inner.table.lookup(notify) {
            Some(entry) if entry.ie_type() & MACH_PORT_TYPE_RECEIVE != 0 => entry.port().cloned(),
            _ => return Err(MsgError::SendInvalidNotify),
        }
    } else {
        None
    };

    // Checked above: both dispositions are send-side port kinds.
    let dest_disp = PortDisposition::from_raw(dest_type).ok_or(MsgError::SendInvalidHeader)?;
    let reply_disp = PortDisposition::from_raw(reply_type);

    let rights = if dest_name == reply_name {
        let reply_disp = reply_disp.ok_or(MsgError::SendInvalidDest)?;
        copyin_same_name(&mut inner, dest_name, dest_disp, reply_disp)?
    } else if !mach_port_valid(reply_name) {
        let (dest, dest_soright) = ipc_right_copyin(&mut inner, dest_name, dest_disp, false)
            .map_err(|_| MsgError::SendInvalidDest)?;
        inner.table.dealloc_if_none(dest_name);
        HeaderRights {
            dest,
            reply: IpcObject::from_name(reply_name).unwrap_or(IpcObject::Null),
            dest_soright,
            reply_soright: None,
        }
    } else {
        let reply_disp = reply_disp.ok_or(MsgError::SendInvalidReply)?;
        match copyin_distinct(&mut inner, dest_name, dest_disp, reply_name, reply_disp)? {
            Ok(rights) => rights,
            Err(dest_soright) => {
                drop(inner);
                if let Some(soright) = dest_soright {
                    ipc_notify_dead_name(soright, dest_name);
                }
                return Err(MsgError::SendInvalidDest);
            }
        }
    };

    let HeaderRights {
        dest,
        reply,
        mut dest_soright,
        reply_soright,
    } = rights;

    if let (Some(notify_port), Some(soright)) = (&notify_port, &dest_soright) {
        if Arc::ptr_eq(notify_port, soright) {
            ipc_port_release_sonce(soright);
            dest_soright = None;
        }
    }
    drop(inner);

    if let Some(soright) = dest_soright {
        ipc_notify_port_deleted(soright, dest_name);
    }
    if let Some(soright) = reply_soright {
        ipc_notify_port_deleted(soright, reply_name);
    }

    header.remote = PortField::Object(dest);
    header.local = PortField::Object(reply);
    header.bits = mbits.with_ports(ipc_object_copyin_type(dest_type), ipc_object_copyin_type(reply_type));
    Ok(())
}

/// One-way send: copy a send right under the read lock
fn copyin_fast_async(space: &IpcSpace, dest_name: MachPortName) -> Option<(IpcObject, IpcObject)> {
    let inner = space.read();
    if !inner.active {
        return None;
    }
    let entry = inner.table.lookup(dest_name)?;
    if entry.ie_type() != MACH_PORT_TYPE_SEND {
        return None;
    }
    let port = entry.port()?.clone();
    let mut st = port.lock();
    if !st.active || st.receiver_name_in(inner.id).is_some() {
        return None;
    }
    drop(inner);
    st.srights += 1;
    drop(st);

    counter!(C_IPC_KMSG_COPYIN_HEADER_FAST_ASYNC);
    log::trace!("ipc_kmsg_copyin_header: async fast path {:#x}", dest_name);
    Some((IpcObject::Port(port), IpcObject::Null))
}

/// RPC request: copy a send right and make a send-once right for the reply
fn copyin_fast_request(
    space: &IpcSpace,
    dest_name: MachPortName,
    reply_name: MachPortName,
) -> Option<(IpcObject, IpcObject)> {
    let inner = space.read();
    if !inner.active {
        return None;
    }
    let dest_entry = inner.table.lookup(dest_name)?;
    if dest_entry.ie_type() != MACH_PORT_TYPE_SEND {
        return None;
    }
    let reply_entry = inner.table.lookup(reply_name)?;
    if reply_entry.ie_type() != MACH_PORT_TYPE_RECEIVE {
        return None;
    }
    let dest = dest_entry.port()?.clone();
    let reply = reply_entry.port()?.clone();

    let mut dest_st = dest.lock();
    if !dest_st.active || dest_st.receiver_name_in(inner.id).is_some() {
        return None;
    }
    let mut reply_st = reply.try_lock()?;
    if !reply_st.active {
        return None;
    }
    drop(inner);

    dest_st.srights += 1;
    drop(dest_st);
    reply_st.sorights += 1;
    drop(reply_st);

    counter!(C_IPC_KMSG_COPYIN_HEADER_FAST_REQUEST);
    log::trace!("ipc_kmsg_copyin_header: request fast path {:#x}/{:#x}", dest_name, reply_name);
    Some((IpcObject::Port(dest), IpcObject::Port(reply)))
}

/// RPC reply: consume a send-once right and free its entry
fn copyin_fast_reply(space: &IpcSpace, dest_name: MachPortName) -> Option<(IpcObject, IpcObject)> {
    let mut inner = space.write();
    if !inner.active {
        return None;
    }
    let entry = inner.table.lookup(dest_name)?;
    if entry.ie_type() != MACH_PORT_TYPE_SEND_ONCE || entry.request != 0 {
        return None;
    }
    let port = entry.port()?.clone();
    let st = port.lock();
    if !st.active {
        return None;
    }
    inner.table.dealloc(dest_name);
    drop(inner);
    drop(st);

    counter!(C_IPC_KMSG_COPYIN_HEADER_FAST_REPLY);
    log::trace!("ipc_kmsg_copyin_header: reply fast path {:#x}", dest_name);
    Some((IpcObject::Port(port), IpcObject::Null))
}

/// Destination and reply are the same name
///
/// Only combinations that cannot observe the port dying half way are
/// accepted. A move-send-once on either side always fails: a valid
/// destination needs a live entry, and moving the send-once right
/// would leave nothing for the other side.
fn copyin_same_name(
    inner: &mut SpaceInner,
    name: MachPortName,
    dest_disp: PortDisposition,
    reply_disp: PortDisposition,
) -> Result<HeaderRights, MsgError> {
    let entry = inner.table.lookup(name).ok_or(MsgError::SendInvalidDest)?;
    if !ipc_right_copyin_check(entry, reply_disp) {
        return Err(MsgError::SendInvalidReply);
    }
    if dest_disp == PortDisposition::MoveSendOnce || reply_disp == PortDisposition::MoveSendOnce {
        return Err(MsgError::SendInvalidDest);
    }

    use PortDisposition::*;
    match (dest_disp, reply_disp) {
        (_, MakeSend | MakeSendOnce) => {
            // The entry holds the receive right, so the port cannot die and
            // the reply copyin cannot fail after the destination succeeded.
            let (dest, dest_soright) =
                ipc_right_copyin(inner, name, dest_disp, false).map_err(|_| MsgError::SendInvalidDest)?;
            let (reply, reply_soright) =
                ipc_right_copyin(inner, name, reply_disp, true).map_err(|_| MsgError::SendInvalidReply)?;
            Ok(HeaderRights {
                dest,
                reply,
                dest_soright,
                reply_soright,
            })
        }
        (MakeSend | MakeSendOnce, _) => {
            let (dest, dest_soright) =
                ipc_right_copyin(inner, name, dest_disp, false).map_err(|_| MsgError::SendInvalidDest)?;
            let reply = copy_send_object(&dest);
            Ok(HeaderRights {
                dest,
                reply,
                dest_soright,
                reply_soright: None,
            })
        }
        (MoveSend, MoveSend) => {
            let (port, dest_soright) =
                ipc_right_copyin_two(inner, name).map_err(|_| MsgError::SendInvalidDest)?;
            inner.table.dealloc_if_none(name);
            Ok(HeaderRights {
                dest: IpcObject::Port(Arc::clone(&port)),
                reply: IpcObject::Port(port),
                dest_soright,
                reply_soright: None,
            })
        }
        _ => {
            // Copy/move-send mixes take one send right and copy it. Only a
            // move consumes a user reference.
            let moved = dest_disp == MoveSend || reply_disp == MoveSend;
            let disp = if moved { MoveSend } else { CopySend };
            let (dest, soright) =
                ipc_right_copyin(inner, name, disp, false).map_err(|_| MsgError::SendInvalidDest)?;
            if moved {
                inner.table.dealloc_if_none(name);
            }
            let reply = copy_send_object(&dest);
            let (dest_soright, reply_soright) = if dest_disp == MoveSend {
                (soright, None)
            } else {
                (None, soright)
            };
            Ok(HeaderRights {
                dest,
                reply,
                dest_soright,
                reply_soright,
            })
        }
    }
}

/// A second send right for an object; a port that died meanwhile yields
/// a dead object, which is fine since the message goes nowhere
fn copy_send_object(object: &IpcObject) -> IpcObject {
    match object.port().and_then(ipc_port_copy_send) {
        Some(port) => IpcObject::Port(port),
        None => IpcObject::Dead,
    }
}

/// Destination and reply are distinct valid names
///
/// The inner `Err` means both copyins were undone because the ports died
/// in the wrong order; it carries the destination's cancelled request,
/// owed a dead-name notification.
fn copyin_distinct(
    inner: &mut SpaceInner,
    dest_name: MachPortName,
    dest_disp: PortDisposition,
    reply_name: MachPortName,
    reply_disp: PortDisposition,
) -> Result<Result<HeaderRights, Option<Arc<IpcPort>>>, MsgError> {
    inner.table.lookup(dest_name).ok_or(MsgError::SendInvalidDest)?;
    let reply_entry = inner.table.lookup(reply_name).ok_or(MsgError::SendInvalidReply)?;
    if !ipc_right_copyin_check(reply_entry, reply_disp) {
        return Err(MsgError::SendInvalidReply);
    }
    // A dead name has no port.
    let saved_reply = reply_entry.port().cloned();

    let (dest, dest_soright) =
        ipc_right_copyin(inner, dest_name, dest_disp, false).map_err(|_| MsgError::SendInvalidDest)?;
    let (reply, reply_soright) = match ipc_right_copyin(inner, reply_name, reply_disp, true) {
        Ok(result) => result,
        Err(kr) => {
            // copyin_check vouched for the reply entry
            log::warn!("ipc_kmsg_copyin_header: reply copyin failed after check: {:?}", kr);
            let soright = match dest_disp {
                PortDisposition::MakeSend | PortDisposition::MakeSendOnce => {
                    if let Some(port) = dest.port() {
                        quiet_release(port, dest_disp.copyin_type());
                    }
                    dest_soright
                }
                _ => ipc_right_copyin_undo(inner, dest_name, dest_disp, dest, dest_soright),
            };
            if let Some(soright) = soright {
                ipc_port_release_sonce(&soright);
            }
            return Err(MsgError::SendInvalidReply);
        }
    };

    if let (Some(saved), IpcObject::Dead) = (&saved_reply, &reply) {
        // The reply port died before its copyin. If the destination died
        // even earlier, the destination copyin saw a port that was
        // already dead at that point in time.
        let reply_died = saved.lock().timestamp;
        let must_undo = dest.port().is_some_and(|d| {
            let st = d.lock();
            !st.active && ip_timestamp_order(st.timestamp, reply_died)
        });

        if must_undo {
            log::debug!(
                "ipc_kmsg_copyin_header: {:#x} died before {:#x}, undoing",
                dest_name,
                reply_name
            );
            let dest_soright = ipc_right_copyin_undo(inner, dest_name, dest_disp, dest, dest_soright);
            let reply_soright = ipc_right_copyin_undo(inner, reply_name, reply_disp, reply, reply_soright);
            debug_assert!(reply_soright.is_none());
            return Ok(Err(dest_soright));
        }
    }

    inner.table.dealloc_if_none(reply_name);
    inner.table.dealloc_if_none(dest_name);
    Ok(Ok(HeaderRights {
        dest,
        reply,
        dest_soright,
        reply_soright,
    }))
}

// ============================================================================
// Copyout
// ============================================================================

/// `ipc_kmsg_copyout_header`: give the receiver names for the header rights
///
/// The fields are swapped: the receiver sees the reply right as its remote
/// port and the destination as its local port (or the destination's
/// protected payload). On failure the header is unchanged.
pub fn ipc_kmsg_copyout_header(
    header: &mut KmsgHeader,
    space: &IpcSpace,
    notify: MachPortName,
) -> Result<(), MsgError> {
    let mbits = header.bits;
    let dest = match header.remote.object().and_then(IpcObject::port) {
        Some(dest) => Arc::clone(dest),
        None => {
            // Nothing to translate; the message names no live destination.
            let dest_name = header.remote.object().and_then(IpcObject::sentinel_name).unwrap_or(MACH_PORT_NULL);
            header.bits = mbits.with_ports(mbits.local(), mbits.remote());
            header.remote = PortField::Name(MACH_PORT_NULL);
            header.local = PortField::Name(dest_name);
            return Ok(());
        }
    };
    let reply = header.local.object().and_then(IpcObject::port).cloned();

    if notify == MACH_PORT_NULL {
        let fast = match mbits.ports() {
            BITS_OUT_ASYNC => copyout_fast_async(space, &dest),
            BITS_OUT_REQUEST => reply.as_ref().and_then(|r| copyout_fast_request(space, &dest, r)),
            BITS_OUT_REPLY => copyout_fast_reply(space, &dest),
            _ => None,
        };
        if let Some((reply_name, dest_field, dest_type)) = fast {
            finish_copyout(header, mbits.local(), reply_name, dest_field, dest_type);
            return Ok(());
        }
    }

    counter!(C_IPC_KMSG_COPYOUT_HEADER_SLOW);
    let dest_type = mbits.remote();
    let reply_type = mbits.local();

    let (reply_name, reply_live, dest_st) = match &reply {
        Some(reply) => copyout_reply_slow(space, &dest, reply, reply_type, notify)?,
        None => {
            let inner = space.read();
            if !inner.active {
                return Err(MsgError::RcvHeaderError(MsgSpecialBits::IPC_SPACE));
            }
            if notify != MACH_PORT_NULL {
                // Checked even though no request will be made.
                match inner.table.lookup(notify) {
                    Some(entry) if entry.ie_type() & MACH_PORT_TYPE_RECEIVE != 0 => {}
                    _ => return Err(MsgError::RcvInvalidNotify),
                }
            }
            let reply_name = header
                .local
                .object()
                .and_then(IpcObject::sentinel_name)
                .or_else(|| header.local.name())
                .unwrap_or(MACH_PORT_NULL);
            let st = dest.lock();
            drop(inner);
            (reply_name, false, st)
        }
    };

    let payload = dest_st.protected_payload;
    let dest_name = if dest_st.active {
        ipc_object_copyout_dest(space.id(), &dest, dest_st, dest_type)
    } else {
        let died = dest_st.timestamp;
        drop(dest_st);
        quiet_release(&dest, dest_type);
        match &reply {
            Some(reply) if reply_live => {
                let st = reply.lock();
                // Reply died before the destination: pretend the destination
                // was still alive when both were copied out.
                if st.active || ip_timestamp_order(died, st.timestamp) {
                    MACH_PORT_DEAD
                } else {
                    MACH_PORT_NULL
                }
            }
            _ => MACH_PORT_DEAD,
        }
    };

    finish_copyout(header, reply_type, reply_name, dest_field(payload, dest_name), dest_type);
    Ok(())
}

/// Swap the header into its received form
fn finish_copyout(
    header: &mut KmsgHeader,
    reply_type: u32,
    reply_name: MachPortName,
    dest_field: PortField,
    dest_type: u32,
) {
    let local_type = match dest_field {
        PortField::Payload(_) => MACH_MSG_TYPE_PROTECTED_PAYLOAD,
        _ => dest_type,
    };
    header.bits = header.bits.with_ports(reply_type, local_type);
    header.remote = PortField::Name(reply_name);
    header.local = dest_field;
}

/// Destination field for a port, honoring its protected payload
fn dest_field(payload: Option<u64>, name: MachPortName) -> PortField {
    match payload {
        Some(payload) => PortField::Payload(payload),
        None => PortField::Name(name),
    }
}

/// One-way message: consume the send right on the destination
fn copyout_fast_async(space: &IpcSpace, dest: &Arc<IpcPort>) -> Option<(MachPortName, PortField, u32)> {
    let mut st = dest.lock();
    if !st.active {
        return None;
    }
    let dest_name = st.receiver_name_or_null(space.id());
    let payload = st.protected_payload;
    let fired = st.release_send_locked();
    drop(st);
    if let Some((nsrequest, mscount)) = fired {
        ipc_notify_no_senders(nsrequest, mscount);
    }

    counter!(C_IPC_KMSG_COPYOUT_HEADER_FAST_ASYNC);
    log::trace!("ipc_kmsg_copyout_header: async fast path {:?}", dest);
    Some((MACH_PORT_NULL, dest_field(payload, dest_name), MACH_MSG_TYPE_PORT_SEND))
}

/// Request: a fresh name for the reply send-once right, then the destination
fn copyout_fast_request(
    space: &IpcSpace,
    dest: &Arc<IpcPort>,
    reply: &Arc<IpcPort>,
) -> Option<(MachPortName, PortField, u32)> {
    let mut inner = space.write();
    if !inner.active {
        return None;
    }
    let reply_name = inner.table.get()?;

    let mut dest_st = dest.lock();
    let reply_st = if dest_st.active { reply.try_lock() } else { None };
    let reply_st = match reply_st {
        Some(st) if st.active => st,
        _ => {
            drop(dest_st);
            inner.table.dealloc(reply_name);
            return None;
        }
    };

    if let Some(entry) = inner.table.allocated_mut(reply_name) {
        entry.object = Some(Arc::clone(reply));
        entry.set_right(MACH_PORT_TYPE_SEND_ONCE, 1);
    }
    drop(reply_st);
    drop(inner);

    let dest_name = dest_st.receiver_name_or_null(space.id());
    let payload = dest_st.protected_payload;
    let fired = dest_st.release_send_locked();
    drop(dest_st);
    if let Some((nsrequest, mscount)) = fired {
        ipc_notify_no_senders(nsrequest, mscount);
    }

    counter!(C_IPC_KMSG_COPYOUT_HEADER_FAST_REQUEST);
    log::trace!("ipc_kmsg_copyout_header: request fast path reply {:#x}", reply_name);
    Some((reply_name, dest_field(payload, dest_name), MACH_MSG_TYPE_PORT_SEND))
}

/// Reply: consume the send-once right on the destination
fn copyout_fast_reply(space: &IpcSpace, dest: &Arc<IpcPort>) -> Option<(MachPortName, PortField, u32)> {
    let mut st = dest.lock();
    if !st.active {
        return None;
    }
    let payload = st.protected_payload;
    let dest_name = match st.receiver_name_in(space.id()) {
        Some(name) => {
            st.sorights = st.sorights.saturating_sub(1);
            drop(st);
            name
        }
        None => {
            drop(st);
            ipc_notify_send_once(Arc::clone(dest));
            MACH_PORT_NULL
        }
    };

    counter!(C_IPC_KMSG_COPYOUT_HEADER_FAST_REPLY);
    log::trace!("ipc_kmsg_copyout_header: reply fast path {:?}", dest);
    Some((MACH_PORT_NULL, dest_field(payload, dest_name), MACH_MSG_TYPE_PORT_SEND_ONCE))
}

/// `ipc_port_lookup_notify`: a send-once right for the notify receive right
fn lookup_notify(inner: &SpaceInner, notify: MachPortName) -> Option<Arc<IpcPort>> {
    let entry = inner.table.lookup(notify)?;
    if entry.ie_type() & MACH_PORT_TYPE_RECEIVE == 0 {
        return None;
    }
    let port = entry.port()?.clone();
    let mut st = port.lock();
    if !st.active {
        return None;
    }
    st.sorights += 1;
    drop(st);
    Some(port)
}

/// Copy out a valid reply right, registering a dead-name request on it
/// when `notify` is given
///
/// Returns the reply name, whether the reply was alive, and the locked
/// destination. The destination is locked while the space still is, so its
/// receive right cannot move in or out between the two copyouts.
fn copyout_reply_slow<'d>(
    space: &IpcSpace,
    dest: &'d Arc<IpcPort>,
    reply: &Arc<IpcPort>,
    reply_type: u32,
    notify: MachPortName,
) -> Result<(MachPortName, bool, spin::MutexGuard<'d, super::port::PortState>), MsgError> {
    loop {
        let mut inner = space.write();
        if !inner.active {
            return Err(MsgError::RcvHeaderError(MsgSpecialBits::IPC_SPACE));
        }

        let notify_port = if notify != MACH_PORT_NULL {
            Some(lookup_notify(&inner, notify).ok_or(MsgError::RcvInvalidNotify)?)
        } else {
            None
        };

        if reply_type != MACH_MSG_TYPE_PORT_SEND_ONCE {
            if let Some((name, mut st)) = ipc_right_reverse(&inner, reply) {
                let kr = ipc_right_copyout(&mut inner, name, reply_type, true, reply, &mut st);
                drop(st);
                if let Err(kr) = kr {
                    log::warn!("ipc_kmsg_copyout_header: reply copyout into {:#x}: {:?}", name, kr);
                }
                // The notify right was not needed.
                if let Some(notify_port) = notify_port {
                    ipc_port_release_sonce(&notify_port);
                }
                let dest_st = dest.lock();
                drop(inner);
                return Ok((name, true, dest_st));
            }
        }

        let mut st = reply.lock();
        if !st.active {
            drop(st);
            if let Some(notify_port) = notify_port {
                ipc_port_release_sonce(&notify_port);
            }
            quiet_release(reply, reply_type);
            let dest_st = dest.lock();
            drop(inner);
            return Ok((MACH_PORT_DEAD, false, dest_st));
        }

        let reply_name = match inner.table.alloc() {
            Ok(name) => name,
            Err(kr) => {
                drop(st);
                if let Some(notify_port) = notify_port {
                    ipc_port_release_sonce(&notify_port);
                }
                log::debug!("ipc_kmsg_copyout_header: no name for reply: {:?}", kr);
                return Err(MsgError::RcvHeaderError(MsgSpecialBits::for_ipc(kr)));
            }
        };

        let mut request = 0;
        if let Some(notify_port) = notify_port {
            match ipc_port_dnrequest(&mut st, reply_name, notify_port) {
                Ok(index) => request = index,
                Err((_, notify_port)) => {
                    drop(st);
                    ipc_port_release_sonce(&notify_port);
                    inner.table.dealloc(reply_name);
                    drop(inner);

                    // A port that died meanwhile needs no room; the next
                    // pass sees the death.
                    if let Err(kr) = ipc_port_dngrow(reply, space.heap()) {
                        log::debug!("ipc_kmsg_copyout_header: dngrow: {:?}", kr);
                        return Err(MsgError::RcvHeaderError(MsgSpecialBits::IPC_KERNEL));
                    }
                    continue;
                }
            }
        }

        let kr = ipc_right_copyout(&mut inner, reply_name, reply_type, true, reply, &mut st);
        drop(st);
        if let Err(kr) = kr {
            log::warn!("ipc_kmsg_copyout_header: reply copyout: {:?}", kr);
        }
        if let Some(entry) = inner.table.allocated_mut(reply_name) {
            entry.request = request;
        }
        let dest_st = dest.lock();
        drop(inner);
        return Ok((reply_name, true, dest_st));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::entry::{MACH_PORT_TYPE_DEAD_NAME, MACH_PORT_TYPE_SEND_RECEIVE};
    use crate::ipc::mach_msg::{MachMsgHeader, MACH_MSG_TYPE_MAKE_SEND, MACH_MSG_TYPE_MOVE_SEND};
    use crate::ipc::port_ops::{
        mach_port_allocate_receive, mach_port_destroy, mach_port_get_refs, mach_port_insert_send,
        mach_port_lookup, mach_port_request_dead_name, mach_port_transfer, mach_port_type,
    };
    use crate::ipc::entry::IE_TABLE_DEFAULT_MAX;
    use crate::ipc::port::IPR_TABLE_MIN;
    use crate::ipc::right::MachPortRight;
    use crate::kern::counters::ipc_counters;
    use crate::kern::kalloc::KernelHeap;

    fn header(remote: u32, local: u32, dest: MachPortName, reply: MachPortName) -> KmsgHeader {
        KmsgHeader::from_user(&MachMsgHeader::new(MachMsgBits::new(remote, local), dest, reply, 9)).unwrap()
    }

    #[test]
    fn test_invalid_bits() {
        let space = IpcSpace::new();
        let name = mach_port_allocate_receive(&space).unwrap();

        let mut h = header(MACH_MSG_TYPE_PORT_SEND_ONCE + 10, 0, name, 0);
        assert_eq!(ipc_kmsg_copyin_header(&mut h, &space, 0), Err(MsgError::SendInvalidHeader));

        let mut h = header(MACH_MSG_TYPE_MAKE_SEND, 0, name, name);
        assert_eq!(ipc_kmsg_copyin_header(&mut h, &space, 0), Err(MsgError::SendInvalidHeader));

        let mut h = header(MACH_MSG_TYPE_MAKE_SEND, 0, name, 0);
        h.bits.0 |= 0x0001_0000;
        assert_eq!(ipc_kmsg_copyin_header(&mut h, &space, 0), Err(MsgError::SendInvalidHeader));

        let mut h = header(MACH_MSG_TYPE_MAKE_SEND, 0, 0x0300_0007, 0);
        assert_eq!(ipc_kmsg_copyin_header(&mut h, &space, 0), Err(MsgError::SendInvalidDest));
        assert_eq!(h.remote.name(), Some(0x0300_0007));
    }

    #[test]
    fn test_async_round_trip() {
        let space = IpcSpace::new();
        let client = IpcSpace::new();
        let name = mach_port_allocate_receive(&space).unwrap();
        let send = mach_port_transfer(&space, name, PortDisposition::MakeSend, &client).unwrap();
        let port = mach_port_lookup(&space, name).unwrap();

        let before = ipc_counters().copyin_fast_async;
        let mut h = header(MACH_MSG_TYPE_COPY_SEND, 0, send, 0);
        ipc_kmsg_copyin_header(&mut h, &client, 0).unwrap();
        assert!(ipc_counters().copyin_fast_async > before);
        assert_eq!(port.srights(), 2);
        assert_eq!(h.bits.remote(), MACH_MSG_TYPE_PORT_SEND);

        ipc_kmsg_copyout_header(&mut h, &space, 0).unwrap();
        assert_eq!(port.srights(), 1);
        assert_eq!(h.remote.name(), Some(MACH_PORT_NULL));
        assert_eq!(h.local.name(), Some(name));
        assert_eq!(h.bits.0, MachMsgBits::new(0, MACH_MSG_TYPE_PORT_SEND).0);
        assert_eq!(h.id, 9);
    }

    #[test]
    fn test_request_reply_cycle() {
        let server = IpcSpace::new();
        let client = IpcSpace::new();
        let service = mach_port_allocate_receive(&server).unwrap();
        let send = mach_port_transfer(&server, service, PortDisposition::MakeSend, &client).unwrap();
        let reply_rcv = mach_port_allocate_receive(&client).unwrap();
        let reply_port = mach_port_lookup(&client, reply_rcv).unwrap();

        let mut h = header(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE, send, reply_rcv);
        ipc_kmsg_copyin_header(&mut h, &client, 0).unwrap();
        assert_eq!(reply_port.sorights(), 1);

        ipc_kmsg_copyout_header(&mut h, &server, 0).unwrap();
        let reply_name = h.remote.name().unwrap();
        assert_eq!(h.local.name(), Some(service));
        assert_eq!(mach_port_type(&server, reply_name).unwrap(), MACH_PORT_TYPE_SEND_ONCE);

        // The server answers on the send-once right.
        let mut r = header(MACH_MSG_TYPE_MOVE_SEND_ONCE, 0, reply_name, 0);
        ipc_kmsg_copyin_header(&mut r, &server, 0).unwrap();
        assert!(mach_port_type(&server, reply_name).is_err());

        ipc_kmsg_copyout_header(&mut r, &client, 0).unwrap();
        assert_eq!(r.local.name(), Some(reply_rcv));
        assert_eq!(reply_port.sorights(), 0);
    }

    #[test]
    fn test_same_name_make_send_pair() {
        let space = IpcSpace::new();
        let name = mach_port_allocate_receive(&space).unwrap();
        let port = mach_port_lookup(&space, name).unwrap();

        let mut h = header(MACH_MSG_TYPE_MAKE_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE, name, name);
        ipc_kmsg_copyin_header(&mut h, &space, 0).unwrap();
        assert_eq!(port.srights(), 1);
        assert_eq!(port.sorights(), 1);
        assert_eq!(h.bits.0, MachMsgBits::new(MACH_MSG_TYPE_PORT_SEND, MACH_MSG_TYPE_PORT_SEND_ONCE).0);
        assert!(h.local.object().unwrap().is_port(&port));
    }

    #[test]
    fn test_same_name_move_send_twice() {
        let space = IpcSpace::new();
        let other = IpcSpace::new();
        let name = mach_port_allocate_receive(&space).unwrap();
        let send = mach_port_transfer(&space, name, PortDisposition::MakeSend, &other).unwrap();
        mach_port_transfer(&space, name, PortDisposition::MakeSend, &other).unwrap();
        let port = mach_port_lookup(&space, name).unwrap();
        assert_eq!(mach_port_get_refs(&other, send, MachPortRight::Send).unwrap(), 2);

        let mut h = header(MACH_MSG_TYPE_MOVE_SEND, MACH_MSG_TYPE_MOVE_SEND, send, send);
        ipc_kmsg_copyin_header(&mut h, &other, 0).unwrap();
        assert!(mach_port_type(&other, send).is_err());
        assert_eq!(port.srights(), 2);
    }

    #[test]
    fn test_same_name_copy_send_twice() {
        let space = IpcSpace::new();
        let other = IpcSpace::new();
        let name = mach_port_allocate_receive(&space).unwrap();
        let send = mach_port_transfer(&space, name, PortDisposition::MakeSend, &other).unwrap();
        let port = mach_port_lookup(&space, name).unwrap();

        // The sender's only reference must survive two copies.
        let mut h = header(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_COPY_SEND, send, send);
        ipc_kmsg_copyin_header(&mut h, &other, 0).unwrap();
        assert_eq!(mach_port_get_refs(&other, send, MachPortRight::Send).unwrap(), 1);
        assert_eq!(mach_port_type(&other, send).unwrap(), MACH_PORT_TYPE_SEND);
        assert_eq!(port.srights(), 3);
        assert!(h.remote.object().unwrap().is_port(&port));
        assert!(h.local.object().unwrap().is_port(&port));
        assert_eq!(h.bits.0, MachMsgBits::new(MACH_MSG_TYPE_PORT_SEND, MACH_MSG_TYPE_PORT_SEND).0);
    }

    #[test]
    fn test_same_name_copy_and_move_send() {
        let space = IpcSpace::new();
        let other = IpcSpace::new();
        let name = mach_port_allocate_receive(&space).unwrap();
        let send = mach_port_transfer(&space, name, PortDisposition::MakeSend, &other).unwrap();
        mach_port_transfer(&space, name, PortDisposition::MakeSend, &other).unwrap();
        let port = mach_port_lookup(&space, name).unwrap();

        let mut h = header(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MOVE_SEND, send, send);
        ipc_kmsg_copyin_header(&mut h, &other, 0).unwrap();
        assert_eq!(mach_port_get_refs(&other, send, MachPortRight::Send).unwrap(), 1);
        assert_eq!(port.srights(), 3);

        // The last reference goes with a second move.
        let mut h = header(MACH_MSG_TYPE_MOVE_SEND, MACH_MSG_TYPE_COPY_SEND, send, send);
        ipc_kmsg_copyin_header(&mut h, &other, 0).unwrap();
        assert!(mach_port_type(&other, send).is_err());
    }

    #[test]
    fn test_same_name_move_send_once_rejected() {
        let space = IpcSpace::new();
        let name = mach_port_allocate_receive(&space).unwrap();
        let mut h = header(MACH_MSG_TYPE_MOVE_SEND_ONCE, MACH_MSG_TYPE_MAKE_SEND, name, name);
        assert_eq!(ipc_kmsg_copyin_header(&mut h, &space, 0), Err(MsgError::SendInvalidDest));
    }

    #[test]
    fn test_invalid_reply_leaves_dest() {
        let space = IpcSpace::new();
        let name = mach_port_allocate_receive(&space).unwrap();
        mach_port_insert_send(&space, name).unwrap();
        let port = mach_port_lookup(&space, name).unwrap();
        let srights = port.srights();

        let mut h = header(MACH_MSG_TYPE_MOVE_SEND, MACH_MSG_TYPE_MOVE_SEND_ONCE, name, 0x0400_0009);
        assert_eq!(ipc_kmsg_copyin_header(&mut h, &space, 0), Err(MsgError::SendInvalidReply));
        assert_eq!(port.srights(), srights);
        assert_eq!(mach_port_type(&space, name).unwrap(), MACH_PORT_TYPE_SEND_RECEIVE);
    }

    #[test]
    fn test_dead_reply_name_is_dead_object() {
        let space = IpcSpace::new();
        let other = IpcSpace::new();
        let dest_rcv = mach_port_allocate_receive(&space).unwrap();
        let dest = mach_port_transfer(&space, dest_rcv, PortDisposition::MakeSend, &other).unwrap();
        let reply_rcv = mach_port_allocate_receive(&space).unwrap();
        let reply = mach_port_transfer(&space, reply_rcv, PortDisposition::MakeSend, &other).unwrap();
        mach_port_destroy(&space, reply_rcv).unwrap();
        assert_eq!(mach_port_type(&other, reply).unwrap(), MACH_PORT_TYPE_DEAD_NAME);

        let mut h = header(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MOVE_SEND, dest, reply);
        ipc_kmsg_copyin_header(&mut h, &other, 0).unwrap();
        assert!(matches!(h.local.object(), Some(IpcObject::Dead)));
        assert!(mach_port_type(&other, reply).is_err());
    }

    #[test]
    fn test_dead_dest_and_reply() {
        let owner = IpcSpace::new();
        let sender = IpcSpace::new();
        let a = mach_port_allocate_receive(&owner).unwrap();
        let b = mach_port_allocate_receive(&owner).unwrap();
        let dest = mach_port_transfer(&owner, a, PortDisposition::MakeSend, &sender).unwrap();
        let reply = mach_port_transfer(&owner, b, PortDisposition::MakeSend, &sender).unwrap();
        let port_a = mach_port_lookup(&owner, a).unwrap();

        // Destination dies first, then the reply: the send must not
        // succeed with a dead reply.
        mach_port_destroy(&owner, a).unwrap();
        mach_port_destroy(&owner, b).unwrap();

        let mut h = header(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_COPY_SEND, dest, reply);
        assert_eq!(ipc_kmsg_copyin_header(&mut h, &sender, 0), Err(MsgError::SendInvalidDest));
        assert_eq!(mach_port_type(&sender, dest).unwrap(), MACH_PORT_TYPE_DEAD_NAME);
        assert_eq!(mach_port_type(&sender, reply).unwrap(), MACH_PORT_TYPE_DEAD_NAME);
        assert!(!port_a.is_active());
    }

    #[test]
    fn test_notify_cancels_port_deleted() {
        let owner = IpcSpace::new();
        let sender = IpcSpace::new();
        let rcv = mach_port_allocate_receive(&owner).unwrap();
        let dest = mach_port_transfer(&owner, rcv, PortDisposition::MakeSend, &sender).unwrap();
        let notify = mach_port_allocate_receive(&sender).unwrap();
        let notify_port = mach_port_lookup(&sender, notify).unwrap();
        mach_port_request_dead_name(&sender, dest, notify).unwrap();
        assert_eq!(notify_port.sorights(), 1);

        let mut h = header(MACH_MSG_TYPE_MOVE_SEND, 0, dest, 0);
        ipc_kmsg_copyin_header(&mut h, &sender, notify).unwrap();
        assert_eq!(notify_port.sorights(), 0);
        assert_eq!(notify_port.message_count(), 0);
    }

    #[test]
    fn test_port_deleted_without_notify() {
        let owner = IpcSpace::new();
        let sender = IpcSpace::new();
        let rcv = mach_port_allocate_receive(&owner).unwrap();
        let dest = mach_port_transfer(&owner, rcv, PortDisposition::MakeSend, &sender).unwrap();
        let notify = mach_port_allocate_receive(&sender).unwrap();
        let notify_port = mach_port_lookup(&sender, notify).unwrap();
        mach_port_request_dead_name(&sender, dest, notify).unwrap();

        let mut h = header(MACH_MSG_TYPE_MOVE_SEND, 0, dest, 0);
        ipc_kmsg_copyin_header(&mut h, &sender, 0).unwrap();
        assert_eq!(notify_port.message_count(), 1);
    }

    #[test]
    fn test_invalid_notify() {
        let space = IpcSpace::new();
        let name = mach_port_allocate_receive(&space).unwrap();
        mach_port_insert_send(&space, name).unwrap();
        let mut h = header(MACH_MSG_TYPE_COPY_SEND, 0, name, 0);
        assert_eq!(
            ipc_kmsg_copyin_header(&mut h, &space, 0x0200_0005),
            Err(MsgError::SendInvalidNotify)
        );
    }

    #[test]
    fn test_copyout_dead_dest() {
        let space = IpcSpace::new();
        let name = mach_port_allocate_receive(&space).unwrap();
        mach_port_insert_send(&space, name).unwrap();
        let mut h = header(MACH_MSG_TYPE_COPY_SEND, 0, name, 0);
        ipc_kmsg_copyin_header(&mut h, &space, 0).unwrap();
        mach_port_destroy(&space, name).unwrap();

        let receiver = IpcSpace::new();
        ipc_kmsg_copyout_header(&mut h, &receiver, 0).unwrap();
        assert_eq!(h.local.name(), Some(MACH_PORT_DEAD));
    }

    #[test]
    fn test_copyout_dead_dest_live_reply() {
        let owner = IpcSpace::new();
        let sender = IpcSpace::new();
        let a = mach_port_allocate_receive(&owner).unwrap();
        let b = mach_port_allocate_receive(&owner).unwrap();
        let dest = mach_port_transfer(&owner, a, PortDisposition::MakeSend, &sender).unwrap();
        let reply = mach_port_transfer(&owner, b, PortDisposition::MakeSend, &sender).unwrap();

        let mut h = header(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_COPY_SEND, dest, reply);
        ipc_kmsg_copyin_header(&mut h, &sender, 0).unwrap();
        mach_port_destroy(&owner, a).unwrap();

        // The reply outlives the destination, so the destination reads dead.
        ipc_kmsg_copyout_header(&mut h, &owner, 0).unwrap();
        assert_eq!(h.local.name(), Some(MACH_PORT_DEAD));
        assert_eq!(h.remote.name(), Some(b));
        assert_eq!(mach_port_get_refs(&owner, b, MachPortRight::Send).unwrap(), 1);
    }

    #[test]
    fn test_copyout_both_dead() {
        let owner = IpcSpace::new();
        let sender = IpcSpace::new();
        let a = mach_port_allocate_receive(&owner).unwrap();
        let b = mach_port_allocate_receive(&owner).unwrap();
        let dest = mach_port_transfer(&owner, a, PortDisposition::MakeSend, &sender).unwrap();
        let reply = mach_port_transfer(&owner, b, PortDisposition::MakeSend, &sender).unwrap();

        let mut h = header(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_COPY_SEND, dest, reply);
        ipc_kmsg_copyin_header(&mut h, &sender, 0).unwrap();
        mach_port_destroy(&owner, b).unwrap();
        mach_port_destroy(&owner, a).unwrap();

        ipc_kmsg_copyout_header(&mut h, &owner, 0).unwrap();
        assert_eq!(h.local.name(), Some(MACH_PORT_DEAD));
        assert_eq!(h.remote.name(), Some(MACH_PORT_DEAD));
    }

    #[test]
    fn test_copyout_protected_payload() {
        let space = IpcSpace::new();
        let name = mach_port_allocate_receive(&space).unwrap();
        mach_port_insert_send(&space, name).unwrap();
        crate::ipc::port_ops::mach_port_set_protected_payload(&space, name, 0xdead_beef_0000_0001).unwrap();

        let mut h = header(MACH_MSG_TYPE_COPY_SEND, 0, name, 0);
        ipc_kmsg_copyin_header(&mut h, &space, 0).unwrap();
        ipc_kmsg_copyout_header(&mut h, &space, 0).unwrap();
        assert_eq!(h.bits.local(), MACH_MSG_TYPE_PROTECTED_PAYLOAD);
        assert!(matches!(h.local, PortField::Payload(0xdead_beef_0000_0001)));
        assert_eq!(h.to_user().protected_payload(), Some(0xdead_beef_0000_0001));
    }

    #[test]
    fn test_copyout_space_dead() {
        let space = IpcSpace::new();
        let name = mach_port_allocate_receive(&space).unwrap();
        let reply = mach_port_allocate_receive(&space).unwrap();
        mach_port_insert_send(&space, name).unwrap();
        let mut h = header(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND, name, reply);
        ipc_kmsg_copyin_header(&mut h, &space, 0).unwrap();

        let receiver = IpcSpace::new();
        receiver.destroy();
        assert_eq!(
            ipc_kmsg_copyout_header(&mut h, &receiver, 0),
            Err(MsgError::RcvHeaderError(MsgSpecialBits::IPC_SPACE))
        );
        assert!(h.remote.object().is_some());
        assert!(h.local.object().is_some());
    }

    #[test]
    fn test_copyout_with_notify_registers_request() {
        let server = IpcSpace::new();
        let client = IpcSpace::new();
        let service = mach_port_allocate_receive(&server).unwrap();
        let send = mach_port_transfer(&server, service, PortDisposition::MakeSend, &client).unwrap();
        let reply_rcv = mach_port_allocate_receive(&client).unwrap();
        let reply_port = mach_port_lookup(&client, reply_rcv).unwrap();
        let notify = mach_port_allocate_receive(&server).unwrap();
        let notify_port = mach_port_lookup(&server, notify).unwrap();

        let mut h = header(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE, send, reply_rcv);
        ipc_kmsg_copyin_header(&mut h, &client, 0).unwrap();
        ipc_kmsg_copyout_header(&mut h, &server, notify).unwrap();
        assert_eq!(reply_port.lock().dnrequests.len(), 1);

        // The reply port dies: the server learns through its notify port.
        mach_port_destroy(&client, reply_rcv).unwrap();
        assert_eq!(notify_port.message_count(), 1);
        let reply_name = h.remote.name().unwrap();
        assert_eq!(mach_port_type(&server, reply_name).unwrap(), MACH_PORT_TYPE_DEAD_NAME);
    }

    #[test]
    fn test_copyout_notify_grows_request_table() {
        let server = IpcSpace::new();
        let client = IpcSpace::new();
        let service = mach_port_allocate_receive(&server).unwrap();
        let send = mach_port_transfer(&server, service, PortDisposition::MakeSend, &client).unwrap();
        let reply_rcv = mach_port_allocate_receive(&client).unwrap();
        let reply_port = mach_port_lookup(&client, reply_rcv).unwrap();
        let notify = mach_port_allocate_receive(&server).unwrap();
        assert_eq!(reply_port.lock().dnrequests.capacity(), 0);

        let mut h = header(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE, send, reply_rcv);
        ipc_kmsg_copyin_header(&mut h, &client, 0).unwrap();
        ipc_kmsg_copyout_header(&mut h, &server, notify).unwrap();

        let st = reply_port.lock();
        assert_eq!(st.dnrequests.capacity(), IPR_TABLE_MIN);
        assert_eq!(st.dnrequests.len(), 1);
    }

    #[test]
    fn test_copyout_notify_heap_exhausted() {
        let limit = 4096;
        let heap = KernelHeap::with_limit(limit);
        let server = IpcSpace::with_limits(Arc::clone(&heap), IE_TABLE_DEFAULT_MAX);
        let client = IpcSpace::new();
        let service = mach_port_allocate_receive(&server).unwrap();
        let send = mach_port_transfer(&server, service, PortDisposition::MakeSend, &client).unwrap();
        let reply_rcv = mach_port_allocate_receive(&client).unwrap();
        let reply_port = mach_port_lookup(&client, reply_rcv).unwrap();
        let notify = mach_port_allocate_receive(&server).unwrap();
        let notify_port = mach_port_lookup(&server, notify).unwrap();

        // The entry table has free slots left; only the request table must grow.
        let hog = heap.kalloc(limit - heap.in_use()).unwrap();

        let mut h = header(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE, send, reply_rcv);
        ipc_kmsg_copyin_header(&mut h, &client, 0).unwrap();
        let names = server.read().table.active_count();
        assert_eq!(
            ipc_kmsg_copyout_header(&mut h, &server, notify),
            Err(MsgError::RcvHeaderError(MsgSpecialBits::IPC_KERNEL))
        );
        assert_eq!(server.read().table.active_count(), names);
        assert_eq!(notify_port.sorights(), 0);
        assert_eq!(reply_port.sorights(), 1);
        assert!(reply_port.lock().dnrequests.is_empty());
        assert!(h.remote.object().is_some());
        assert!(h.local.object().is_some());

        drop(hog);
        ipc_kmsg_copyout_header(&mut h, &server, notify).unwrap();
        assert_eq!(reply_port.lock().dnrequests.len(), 1);
    }
}
