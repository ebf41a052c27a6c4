//! IPC Message Queue - Port message queue management
//!
//! Based on Mach4 ipc/ipc_mqueue.c, ipc/mach_msg.c
//!
//! Each port queues the messages sent to it until its receiver picks them
//! up. Queues are unbounded and receive never blocks: an empty queue is a
//! timed-out receive. `mach_msg_send` and `mach_msg_receive` string the
//! whole path together, from the sender's buffer to the receiver's.

use alloc::boxed::Box;

use super::entry::{MachPortName, MACH_PORT_TYPE_RECEIVE};
use super::kmsg::{
    ipc_kmsg_copyin, ipc_kmsg_copyout, ipc_kmsg_copyout_dest, ipc_kmsg_destroy, ipc_kmsg_free, ipc_kmsg_get,
    ipc_kmsg_put, quiet_release, IpcKmsg,
};
use super::kmsg_body::ipc_kmsg_transcode_body;
use super::mach_msg::MsgError;
use super::space::IpcSpace;
use crate::kern::processor::Processor;
use crate::mach_vm::vm_map::VmMap;

// ============================================================================
// Send / Receive
// ============================================================================

/// `ipc_mqueue_send`: queue a copied-in message at its destination
///
/// A message whose destination died is destroyed, its destination right
/// dropped without notification. A message that would put a receive right
/// into a loop (CIRCULAR) is destroyed as well. Neither case is an error
/// for the sender.
pub fn ipc_mqueue_send(mut kmsg: Box<IpcKmsg>) {
    let dest = match kmsg.destination() {
        Some(dest) => alloc::sync::Arc::clone(dest),
        None => {
            log::warn!("ipc_mqueue_send: message without a destination right");
            ipc_kmsg_destroy(kmsg);
            return;
        }
    };

    let mut st = dest.lock();
    if !st.active {
        drop(st);
        let dest_type = kmsg.header.bits.remote();
        drop(kmsg.header.remote.take_object());
        quiet_release(&dest, dest_type);
        log::trace!("ipc_mqueue_send: {:?} is dead", dest);
        ipc_kmsg_destroy(kmsg);
        return;
    }
    if kmsg.header.bits.is_circular() {
        drop(st);
        log::debug!("ipc_mqueue_send: circular message to {:?} destroyed", dest);
        ipc_kmsg_destroy(kmsg);
        return;
    }
    st.messages.enqueue(kmsg);
}

/// `ipc_mqueue_send_always`: send a kernel message; it cannot fail
pub fn ipc_mqueue_send_always(kmsg: Box<IpcKmsg>) {
    ipc_mqueue_send(kmsg);
}

/// `ipc_mqueue_receive`: take the next message queued on the receive
/// right `name`
pub fn ipc_mqueue_receive(space: &IpcSpace, name: MachPortName) -> Result<Box<IpcKmsg>, MsgError> {
    let inner = space.read();
    if !inner.active {
        return Err(MsgError::RcvInvalidName);
    }
    let port = match inner.table.lookup(name) {
        Some(entry) if entry.ie_type() & MACH_PORT_TYPE_RECEIVE != 0 => entry.port().cloned(),
        _ => None,
    }
    .ok_or(MsgError::RcvInvalidName)?;

    let mut st = port.lock();
    drop(inner);
    st.messages.dequeue().ok_or(MsgError::RcvTimedOut)
}

// ============================================================================
// Message Transfer
// ============================================================================

/// `mach_msg_send`: send the message of `size` bytes at `addr` in `map`
///
/// `notify` names a receive right for a dead-name request cancelled by
/// the header copyin.
pub fn mach_msg_send(
    cpu: &mut Processor,
    space: &IpcSpace,
    map: &VmMap,
    addr: u64,
    size: usize,
    notify: MachPortName,
) -> Result<(), MsgError> {
    let mut kmsg = ipc_kmsg_get(cpu, map, addr, size)?;
    if let Err(mr) = ipc_kmsg_copyin(&mut kmsg, space, map, notify) {
        log::debug!("mach_msg_send: copyin failed: {}", mr);
        ipc_kmsg_free(cpu, kmsg);
        return Err(mr);
    }
    ipc_mqueue_send(kmsg);
    Ok(())
}

/// `mach_msg_receive`: receive a message on `name` into the buffer at `addr`
///
/// A message is consumed even when its copyout fails. If the header cannot
/// be copied out, the receiver still gets the header with the destination
/// name; everything else in the message is destroyed.
pub fn mach_msg_receive(
    cpu: &mut Processor,
    space: &IpcSpace,
    map: &VmMap,
    name: MachPortName,
    addr: u64,
    notify: MachPortName,
) -> Result<(), MsgError> {
    let mut kmsg = ipc_mqueue_receive(space, name)?;

    match ipc_kmsg_copyout(&mut kmsg, space, map, notify) {
        Ok(()) => ipc_kmsg_put(cpu, map, addr, kmsg),
        Err(mr) if mr.is_delivered() => {
            ipc_kmsg_put(cpu, map, addr, kmsg)?;
            Err(mr)
        }
        Err(mr) => {
            log::debug!("mach_msg_receive: header copyout failed: {}", mr);
            ipc_kmsg_copyout_dest(&mut kmsg, space);
            ipc_kmsg_transcode_body(&mut kmsg, map.abi());
            ipc_kmsg_put(cpu, map, addr, kmsg)?;
            Err(mr)
        }
    }
}
