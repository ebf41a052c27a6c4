//! IPC Notifications - Port death and other notifications
//!
//! Based on Mach4 ipc/ipc_notify.c
//!
//! Every notification is a kernel-composed message sent on a send-once
//! right, which the message consumes. The rights come from requests
//! registered on ports (dead-name, no-senders) or are the leftovers of
//! destroyed send-once rights. Callers must not hold the lock of the
//! notification port.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::entry::{MachPortName, MACH_PORT_NULL};
use super::ipc_object::IpcObject;
use super::kmsg::{IpcKmsg, KmsgHeader, PortField};
use super::mach_msg::{MachMsgBits, MACH_MSG_TYPE_INTEGER_32, MACH_MSG_TYPE_PORT_NAME, MACH_MSG_TYPE_PORT_SEND_ONCE};
use super::mqueue::ipc_mqueue_send_always;
use super::msg_type::{MsgAbi, MsgBodyBuilder, MsgTypeDesc};
use super::port::IpcPort;

// ============================================================================
// Notification Types
// ============================================================================

/// Types of port notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum NotifyType {
    /// A dead-name request was cancelled because its entry went away
    PortDeleted = 0o101,
    /// A receive right was destroyed (never generated here)
    PortDestroyed = 0o105,
    /// No more send rights exist
    NoSenders = 0o106,
    /// A send-once right was destroyed unused
    SendOnce = 0o107,
    /// A watched name became dead
    DeadName = 0o110,
}

impl NotifyType {
    /// Get message ID for this notification type
    pub fn msg_id(self) -> i32 {
        self as i32
    }

    /// The notification a message ID stands for
    pub fn from_msg_id(id: i32) -> Option<Self> {
        Some(match id {
            0o101 => Self::PortDeleted,
            0o105 => Self::PortDestroyed,
            0o106 => Self::NoSenders,
            0o107 => Self::SendOnce,
            0o110 => Self::DeadName,
            _ => return None,
        })
    }
}

// ============================================================================
// Notification Messages
// ============================================================================

/// Body carrying a port name (`mach_port_deleted_notification_t`,
/// `mach_dead_name_notification_t`)
fn name_body(name: MachPortName) -> Vec<u8> {
    let abi = MsgAbi::native();
    let desc = MsgTypeDesc::inline(MACH_MSG_TYPE_PORT_NAME, abi.port_bits(), 1);
    MsgBodyBuilder::new(abi).put_type(&desc).put_port_names(&[name]).finish()
}

/// Body carrying a count (`mach_no_senders_notification_t`)
fn count_body(count: u32) -> Vec<u8> {
    MsgBodyBuilder::new(MsgAbi::native())
        .inline_data(MACH_MSG_TYPE_INTEGER_32, 32, 1, &count.to_le_bytes())
        .finish()
}

/// Build a notification on the send-once right `port`
fn ipc_notify_message(port: Arc<IpcPort>, notify_type: NotifyType, body: Vec<u8>) -> Box<IpcKmsg> {
    let header = KmsgHeader {
        bits: MachMsgBits::new(MACH_MSG_TYPE_PORT_SEND_ONCE, 0),
        size: (MsgAbi::native().header_size() + body.len()) as u32,
        remote: PortField::Object(IpcObject::Port(port)),
        local: PortField::Name(MACH_PORT_NULL),
        seqno: 0,
        id: notify_type.msg_id(),
    };
    IpcKmsg::kernel(header, body)
}

/// Send a notification message
fn send_notification(port: Arc<IpcPort>, notify_type: NotifyType, body: Vec<u8>) {
    log::trace!("ipc_notify: {:?} to {:?}", notify_type, port);
    ipc_mqueue_send_always(ipc_notify_message(port, notify_type, body));
}

/// `ipc_notify_port_deleted`: a dead-name request for `name` was cancelled
pub fn ipc_notify_port_deleted(port: Arc<IpcPort>, name: MachPortName) {
    send_notification(port, NotifyType::PortDeleted, name_body(name));
}

/// `ipc_notify_no_senders`: the last send right is gone
pub fn ipc_notify_no_senders(port: Arc<IpcPort>, mscount: u32) {
    send_notification(port, NotifyType::NoSenders, count_body(mscount));
}

/// `ipc_notify_send_once`: a send-once right was destroyed unused
pub fn ipc_notify_send_once(port: Arc<IpcPort>) {
    send_notification(port, NotifyType::SendOnce, Vec::new());
}

/// `ipc_notify_dead_name`: `name` died
pub fn ipc_notify_dead_name(port: Arc<IpcPort>, name: MachPortName) {
    send_notification(port, NotifyType::DeadName, name_body(name));
}
