//! IPC Object - what a message carries in place of a port name
//!
//! Based on Mach4 ipc/ipc_object.h, ipc/ipc_object.c
//!
//! Between copyin and copyout a message holds rights, not names. An
//! `IpcObject` is one such right: a live reference to a port, or one of
//! the two sentinel values a name can stand for. Which kind of right a
//! `Port` holds (send, send-once, receive) is recorded next to it as a
//! receive-side type name; the port's right counts already include it.
//!
//! Dropping an `IpcObject` only drops the memory reference. Rights are
//! released explicitly with `ipc_object_destroy`.

use alloc::sync::Arc;

use spin::MutexGuard;

use super::entry::{MachPortName, MACH_PORT_DEAD, MACH_PORT_NULL};
use super::kmsg::{ipc_kmsg_reap, IpcKmsgQueue};
use super::mach_msg::{
    MachMsgTypeName, PortDisposition, MACH_MSG_TYPE_PORT_RECEIVE, MACH_MSG_TYPE_PORT_SEND,
    MACH_MSG_TYPE_PORT_SEND_ONCE,
};
use super::notify::{ipc_notify_no_senders, ipc_notify_port_deleted, ipc_notify_send_once};
use super::port::{ipc_port_destroy, ipc_port_release_send, IpcPort, PortState};
use super::right::{ipc_right_copyin, ipc_right_copyout, ipc_right_reverse};
use super::space::{IpcSpace, SpaceId};
use crate::kern::kern_return::{KernError, KernResult};

/// A right in transit
#[derive(Debug)]
pub enum IpcObject {
    /// `IO_NULL`: the name was `MACH_PORT_NULL`
    Null,
    /// `IO_DEAD`: the name was dead, or the port died
    Dead,
    /// A right to a port
    Port(Arc<IpcPort>),
}

impl IpcObject {
    /// The sentinel object for a name that needs no lookup
    pub fn from_name(name: MachPortName) -> Option<Self> {
        match name {
            MACH_PORT_NULL => Some(Self::Null),
            MACH_PORT_DEAD => Some(Self::Dead),
            _ => None,
        }
    }

    /// `IO_VALID`
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Port(_))
    }

    pub fn port(&self) -> Option<&Arc<IpcPort>> {
        match self {
            Self::Port(port) => Some(port),
            _ => None,
        }
    }

    /// The name a sentinel object stands for
    pub fn sentinel_name(&self) -> Option<MachPortName> {
        match self {
            Self::Null => Some(MACH_PORT_NULL),
            Self::Dead => Some(MACH_PORT_DEAD),
            Self::Port(_) => None,
        }
    }

    /// Whether this is a right to `port`
    pub fn is_port(&self, port: &Arc<IpcPort>) -> bool {
        self.port().is_some_and(|p| Arc::ptr_eq(p, port))
    }
}

/// `ipc_object_copyin_type`: receive-side name for a send-side disposition
pub fn ipc_object_copyin_type(msgt_name: MachMsgTypeName) -> MachMsgTypeName {
    PortDisposition::from_raw(msgt_name).map_or(msgt_name, PortDisposition::copyin_type)
}

/// `ipc_object_copyin`: take a right out of `space`
///
/// Dead names are accepted and yield `IpcObject::Dead`. A dead-name
/// request cancelled along the way becomes a port-deleted notification.
pub fn ipc_object_copyin(
    space: &IpcSpace,
    name: MachPortName,
    msgt_name: PortDisposition,
) -> KernResult<IpcObject> {
    let (object, soright) = {
        let mut inner = space.write();
        if !inner.active {
            return Err(KernError::InvalidTask);
        }
        let result = ipc_right_copyin(&mut inner, name, msgt_name, true)?;
        inner.table.dealloc_if_none(name);
        result
    };

    if let Some(soright) = soright {
        ipc_notify_port_deleted(soright, name);
    }
    Ok(object)
}

/// `ipc_object_copyout`: give `space` a name for a right
///
/// `msgt_name` is the receive-side type. A send right reuses the name
/// the space already has for the port. On failure the right is handed
/// back so the caller can destroy it.
pub fn ipc_object_copyout(
    space: &IpcSpace,
    port: Arc<IpcPort>,
    msgt_name: MachMsgTypeName,
    overflow: bool,
) -> Result<MachPortName, (KernError, Arc<IpcPort>)> {
    let mut inner = space.write();
    if !inner.active {
        drop(inner);
        return Err((KernError::InvalidTask, port));
    }

    if msgt_name != MACH_MSG_TYPE_PORT_SEND_ONCE {
        let reused = match ipc_right_reverse(&inner, &port) {
            Some((name, mut st)) => {
                let kr = ipc_right_copyout(&mut inner, name, msgt_name, overflow, &port, &mut st);
                drop(st);
                Some((name, kr))
            }
            None => None,
        };
        if let Some((name, kr)) = reused {
            return match kr {
                Ok(()) => Ok(name),
                Err(kr) => Err((kr, port)),
            };
        }
    }

    let name = match inner.table.alloc() {
        Ok(name) => name,
        Err(kr) => {
            drop(inner);
            return Err((kr, port));
        }
    };

    let mut st = port.lock();
    if !st.active {
        drop(st);
        inner.table.dealloc(name);
        return Err((KernError::InvalidCapability, port));
    }
    let kr = ipc_right_copyout(&mut inner, name, msgt_name, overflow, &port, &mut st);
    drop(st);
    match kr {
        Ok(()) => Ok(name),
        Err(kr) => {
            inner.table.dealloc_if_none(name);
            Err((kr, port))
        }
    }
}

/// `ipc_object_copyout_dest`: name for the destination right of a
/// received message
///
/// `st` is the destination's locked, active state. Consumes the right:
/// the name is the receiver's name if `space` holds the receive right,
/// otherwise `MACH_PORT_NULL`.
pub fn ipc_object_copyout_dest(
    space: SpaceId,
    port: &Arc<IpcPort>,
    mut st: MutexGuard<'_, PortState>,
    msgt_name: MachMsgTypeName,
) -> MachPortName {
    match msgt_name {
        MACH_MSG_TYPE_PORT_SEND => {
            let fired = st.release_send_locked();
            let name = st.receiver_name_or_null(space);
            drop(st);
            if let Some((nsrequest, mscount)) = fired {
                ipc_notify_no_senders(nsrequest, mscount);
            }
            name
        }
        MACH_MSG_TYPE_PORT_SEND_ONCE => match st.receiver_name_in(space) {
            Some(name) => {
                // quietly consume the send-once right
                st.sorights = st.sorights.saturating_sub(1);
                name
            }
            None => {
                // Receive right moved away since the message was
                // dequeued; the right cannot vanish silently.
                drop(st);
                ipc_notify_send_once(Arc::clone(port));
                MACH_PORT_NULL
            }
        },
        _ => {
            log::warn!("ipc_object_copyout_dest: bad type {}", msgt_name);
            MACH_PORT_NULL
        }
    }
}

/// `ipc_port_release_receive`: destroy a receive right held by a message
fn ipc_port_release_receive(port: &Arc<IpcPort>, reap: &mut IpcKmsgQueue) {
    port.lock().clear_receiver();
    ipc_port_destroy(port, reap);
}

/// `ipc_object_destroy`: release a right of type `msgt_name`
///
/// Messages freed as a consequence are queued on `reap`.
pub fn ipc_object_destroy(object: IpcObject, msgt_name: MachMsgTypeName, reap: &mut IpcKmsgQueue) {
    let port = match object {
        IpcObject::Port(port) => port,
        IpcObject::Null | IpcObject::Dead => return,
    };
    match msgt_name {
        MACH_MSG_TYPE_PORT_SEND => ipc_port_release_send(&port),
        MACH_MSG_TYPE_PORT_SEND_ONCE => ipc_notify_send_once(port),
        MACH_MSG_TYPE_PORT_RECEIVE => ipc_port_release_receive(&port, reap),
        _ => log::warn!("ipc_object_destroy: bad type {}", msgt_name),
    }
}

/// `ipc_object_destroy` for callers without a reaper queue
pub fn ipc_object_destroy_now(object: IpcObject, msgt_name: MachMsgTypeName) {
    let mut reap = IpcKmsgQueue::new();
    ipc_object_destroy(object, msgt_name, &mut reap);
    ipc_kmsg_reap(&mut reap);
}
