//! Mach-style Inter-Process Communication
//!
//! Kernel message copyin and copyout: the translation of messages between
//! a task's port names and the kernel's port rights.
//!
//! Layout follows Mach4 ipc/:
//! - entry, space: per-task port name spaces
//! - port, right, ipc_object: ports and the capabilities naming them
//! - mach_msg, msg_type: the user message format
//! - kmsg, kmsg_header, kmsg_body: kernel messages and their translation
//! - notify, mqueue: kernel-generated notifications and message queues
//! - port_ops: user-level port manipulation
//! - kmsg_print: debug printing

pub mod entry;
pub mod ipc_object;
pub mod kmsg;
pub mod kmsg_body;
pub mod kmsg_header;
pub mod kmsg_print;
pub mod mach_msg;
pub mod mqueue;
pub mod msg_type;
pub mod notify;
pub mod port;
pub mod port_ops;
pub mod right;
pub mod space;

pub use entry::{MachPortName, MACH_PORT_DEAD, MACH_PORT_NULL};
pub use ipc_object::IpcObject;
pub use kmsg::{
    ipc_kmsg_copyin, ipc_kmsg_copyin_from_kernel, ipc_kmsg_copyout, ipc_kmsg_copyout_dest, ipc_kmsg_copyout_pseudo,
    ipc_kmsg_destroy, ipc_kmsg_free, ipc_kmsg_get, ipc_kmsg_get_from_kernel, ipc_kmsg_put, ipc_kmsg_put_to_kernel,
    IpcKmsg, IpcKmsgQueue,
};
pub use kmsg_header::{ipc_kmsg_copyin_header, ipc_kmsg_copyout_header};
pub use mach_msg::{MachMsgBits, MachMsgHeader, MachMsgReturn, MsgError, MsgHeaderFlags, MsgSpecialBits};
pub use mqueue::{ipc_mqueue_receive, ipc_mqueue_send, mach_msg_receive, mach_msg_send};
pub use msg_type::{MsgAbi, MsgBodyBuilder, MsgTypeDesc, TypeCursor};
pub use port::IpcPort;
pub use space::IpcSpace;
