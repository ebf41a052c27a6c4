//! Mach Message Definitions
//!
//! Based on Mach4 mach/message.h by CMU (1987-1991)
//!
//! The user-visible vocabulary of the message system: header bits, the
//! type names carried in the header and in body descriptors, and the
//! `mach_msg_return_t` codes handed back to the send/receive layer.
//! Callers branch on the exact return values, so they match the Mach ABI.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use thiserror::Error;

use super::entry::{MachPortName, MACH_PORT_DEAD};
use super::msg_type::{narrow_port_name, read_u32, MsgAbi};
use crate::kern::kern_return::KernError;

// ============================================================================
// Header Bits
// ============================================================================

pub const MACH_MSGH_BITS_ZERO: u32 = 0x0000_0000;
pub const MACH_MSGH_BITS_REMOTE_MASK: u32 = 0x0000_00ff;
pub const MACH_MSGH_BITS_LOCAL_MASK: u32 = 0x0000_ff00;
pub const MACH_MSGH_BITS_COMPLEX: u32 = 0x8000_0000;
pub const MACH_MSGH_BITS_CIRCULAR: u32 = 0x4000_0000;
pub const MACH_MSGH_BITS_COMPLEX_PORTS: u32 = 0x2000_0000;
pub const MACH_MSGH_BITS_COMPLEX_DATA: u32 = 0x1000_0000;
pub const MACH_MSGH_BITS_MIGRATED: u32 = 0x0800_0000;
pub const MACH_MSGH_BITS_UNUSED: u32 = 0x07ff_0000;
pub const MACH_MSGH_BITS_PORTS_MASK: u32 = MACH_MSGH_BITS_REMOTE_MASK | MACH_MSGH_BITS_LOCAL_MASK;

bitflags! {
    /// Flag bits of `msgh_bits`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MsgHeaderFlags: u32 {
        /// Body contains typed elements that need translation
        const COMPLEX = MACH_MSGH_BITS_COMPLEX;
        /// Message carries a receive right for a port on its own path
        const CIRCULAR = MACH_MSGH_BITS_CIRCULAR;
        /// Body holds port rights
        const COMPLEX_PORTS = MACH_MSGH_BITS_COMPLEX_PORTS;
        /// Body holds out-of-line memory
        const COMPLEX_DATA = MACH_MSGH_BITS_COMPLEX_DATA;
        const MIGRATED = MACH_MSGH_BITS_MIGRATED;
    }
}

impl MsgHeaderFlags {
    /// Bits only the kernel may set
    pub const INTERNAL: Self = Self::CIRCULAR
        .union(Self::COMPLEX_PORTS)
        .union(Self::COMPLEX_DATA)
        .union(Self::MIGRATED);
}

/// Message header bits: two dispositions plus flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MachMsgBits(pub u32);

impl MachMsgBits {
    /// `MACH_MSGH_BITS(remote, local)`
    pub const fn new(remote: MachMsgTypeName, local: MachMsgTypeName) -> Self {
        Self((remote & 0xff) | ((local & 0xff) << 8))
    }

    /// Destination disposition
    #[inline]
    pub const fn remote(self) -> MachMsgTypeName {
        self.0 & MACH_MSGH_BITS_REMOTE_MASK
    }

    /// Reply disposition
    #[inline]
    pub const fn local(self) -> MachMsgTypeName {
        (self.0 & MACH_MSGH_BITS_LOCAL_MASK) >> 8
    }

    /// Both disposition fields
    #[inline]
    pub const fn ports(self) -> u32 {
        self.0 & MACH_MSGH_BITS_PORTS_MASK
    }

    /// Everything but the disposition fields
    #[inline]
    pub const fn other(self) -> u32 {
        self.0 & !MACH_MSGH_BITS_PORTS_MASK
    }

    /// Known flag bits
    pub const fn flags(self) -> MsgHeaderFlags {
        MsgHeaderFlags::from_bits_truncate(self.0)
    }

    pub const fn is_complex(self) -> bool {
        self.0 & MACH_MSGH_BITS_COMPLEX != 0
    }

    pub const fn is_circular(self) -> bool {
        self.0 & MACH_MSGH_BITS_CIRCULAR != 0
    }

    /// Replace the dispositions, keeping the flags
    pub const fn with_ports(self, remote: MachMsgTypeName, local: MachMsgTypeName) -> Self {
        Self(self.other() | Self::new(remote, local).0)
    }

    pub fn insert(&mut self, flags: MsgHeaderFlags) {
        self.0 |= flags.bits();
    }

    pub fn remove(&mut self, flags: MsgHeaderFlags) {
        self.0 &= !flags.bits();
    }
}

// ============================================================================
// Type Names
// ============================================================================

/// `mach_msg_type_name_t`
pub type MachMsgTypeName = u32;

pub const MACH_MSG_TYPE_UNSTRUCTURED: MachMsgTypeName = 0;
pub const MACH_MSG_TYPE_BIT: MachMsgTypeName = 0;
pub const MACH_MSG_TYPE_BOOLEAN: MachMsgTypeName = 0;
pub const MACH_MSG_TYPE_INTEGER_16: MachMsgTypeName = 1;
pub const MACH_MSG_TYPE_INTEGER_32: MachMsgTypeName = 2;
pub const MACH_MSG_TYPE_CHAR: MachMsgTypeName = 8;
pub const MACH_MSG_TYPE_BYTE: MachMsgTypeName = 9;
pub const MACH_MSG_TYPE_INTEGER_8: MachMsgTypeName = 9;
pub const MACH_MSG_TYPE_REAL: MachMsgTypeName = 10;
pub const MACH_MSG_TYPE_INTEGER_64: MachMsgTypeName = 11;
pub const MACH_MSG_TYPE_STRING: MachMsgTypeName = 12;
pub const MACH_MSG_TYPE_STRING_C: MachMsgTypeName = 12;
pub const MACH_MSG_TYPE_PORT_NAME: MachMsgTypeName = 15;

// Send-side dispositions
pub const MACH_MSG_TYPE_MOVE_RECEIVE: MachMsgTypeName = 16;
pub const MACH_MSG_TYPE_MOVE_SEND: MachMsgTypeName = 17;
pub const MACH_MSG_TYPE_MOVE_SEND_ONCE: MachMsgTypeName = 18;
pub const MACH_MSG_TYPE_COPY_SEND: MachMsgTypeName = 19;
pub const MACH_MSG_TYPE_MAKE_SEND: MachMsgTypeName = 20;
pub const MACH_MSG_TYPE_MAKE_SEND_ONCE: MachMsgTypeName = 21;

// Receive-side dispositions
pub const MACH_MSG_TYPE_PORT_RECEIVE: MachMsgTypeName = MACH_MSG_TYPE_MOVE_RECEIVE;
pub const MACH_MSG_TYPE_PORT_SEND: MachMsgTypeName = MACH_MSG_TYPE_MOVE_SEND;
pub const MACH_MSG_TYPE_PORT_SEND_ONCE: MachMsgTypeName = MACH_MSG_TYPE_MOVE_SEND_ONCE;

pub const MACH_MSG_TYPE_PROTECTED_PAYLOAD: MachMsgTypeName = 23;

/// Placeholder for a disposition chosen at run time; never on the wire
pub const MACH_MSG_TYPE_POLYMORPHIC: MachMsgTypeName = u32::MAX;

/// `MACH_MSG_TYPE_PORT_ANY`: any of the six send-side dispositions
pub const fn msgt_is_port(name: MachMsgTypeName) -> bool {
    matches!(
        name,
        MACH_MSG_TYPE_MOVE_RECEIVE
            | MACH_MSG_TYPE_MOVE_SEND
            | MACH_MSG_TYPE_MOVE_SEND_ONCE
            | MACH_MSG_TYPE_COPY_SEND
            | MACH_MSG_TYPE_MAKE_SEND
            | MACH_MSG_TYPE_MAKE_SEND_ONCE
    )
}

/// `MACH_MSG_TYPE_PORT_ANY_SEND`: dispositions that yield a send or send-once right
pub const fn msgt_is_port_any_send(name: MachMsgTypeName) -> bool {
    matches!(
        name,
        MACH_MSG_TYPE_MOVE_SEND
            | MACH_MSG_TYPE_MOVE_SEND_ONCE
            | MACH_MSG_TYPE_COPY_SEND
            | MACH_MSG_TYPE_MAKE_SEND
            | MACH_MSG_TYPE_MAKE_SEND_ONCE
    )
}

/// `MACH_MSG_TYPE_PORT_ANY_RIGHT`: the three receive-side right kinds
pub const fn msgt_is_port_any_right(name: MachMsgTypeName) -> bool {
    matches!(
        name,
        MACH_MSG_TYPE_PORT_RECEIVE | MACH_MSG_TYPE_PORT_SEND | MACH_MSG_TYPE_PORT_SEND_ONCE
    )
}

/// A send-side disposition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PortDisposition {
    MoveReceive = MACH_MSG_TYPE_MOVE_RECEIVE,
    MoveSend = MACH_MSG_TYPE_MOVE_SEND,
    MoveSendOnce = MACH_MSG_TYPE_MOVE_SEND_ONCE,
    CopySend = MACH_MSG_TYPE_COPY_SEND,
    MakeSend = MACH_MSG_TYPE_MAKE_SEND,
    MakeSendOnce = MACH_MSG_TYPE_MAKE_SEND_ONCE,
}

impl PortDisposition {
    /// Convert from a raw type name
    pub const fn from_raw(name: MachMsgTypeName) -> Option<Self> {
        match name {
            MACH_MSG_TYPE_MOVE_RECEIVE => Some(Self::MoveReceive),
            MACH_MSG_TYPE_MOVE_SEND => Some(Self::MoveSend),
            MACH_MSG_TYPE_MOVE_SEND_ONCE => Some(Self::MoveSendOnce),
            MACH_MSG_TYPE_COPY_SEND => Some(Self::CopySend),
            MACH_MSG_TYPE_MAKE_SEND => Some(Self::MakeSend),
            MACH_MSG_TYPE_MAKE_SEND_ONCE => Some(Self::MakeSendOnce),
            _ => None,
        }
    }

    /// Raw type name
    pub const fn raw(self) -> MachMsgTypeName {
        self as MachMsgTypeName
    }

    /// The receive-side type name this disposition turns into
    pub const fn copyin_type(self) -> MachMsgTypeName {
        match self {
            Self::MoveReceive => MACH_MSG_TYPE_PORT_RECEIVE,
            Self::MoveSend | Self::CopySend | Self::MakeSend => MACH_MSG_TYPE_PORT_SEND,
            Self::MoveSendOnce | Self::MakeSendOnce => MACH_MSG_TYPE_PORT_SEND_ONCE,
        }
    }
}

// ============================================================================
// Message Return Codes
// ============================================================================

/// `mach_msg_return_t`
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MachMsgReturn(pub u32);

impl MachMsgReturn {
    pub const SUCCESS: Self = Self(MACH_MSG_SUCCESS);

    pub fn is_success(self) -> bool {
        self.0 == MACH_MSG_SUCCESS
    }

    /// Special bits folded into this code
    pub fn special_bits(self) -> MsgSpecialBits {
        MsgSpecialBits::from_bits_truncate(self.0)
    }

    /// The code with its special bits removed
    pub fn base(self) -> Self {
        Self(self.0 & !MACH_MSG_MASK)
    }
}

impl fmt::Debug for MachMsgReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachMsgReturn({:#010x})", self.0)
    }
}

impl From<Result<(), MsgError>> for MachMsgReturn {
    fn from(result: Result<(), MsgError>) -> Self {
        match result {
            Ok(()) => Self::SUCCESS,
            Err(e) => e.code(),
        }
    }
}

pub const MACH_MSG_SUCCESS: u32 = 0x0000_0000;

pub const MACH_MSG_MASK: u32 = 0x0000_3c00;
pub const MACH_MSG_IPC_SPACE: u32 = 0x0000_2000;
pub const MACH_MSG_VM_SPACE: u32 = 0x0000_1000;
pub const MACH_MSG_IPC_KERNEL: u32 = 0x0000_0800;
pub const MACH_MSG_VM_KERNEL: u32 = 0x0000_0400;

pub const MACH_SEND_IN_PROGRESS: u32 = 0x1000_0001;
pub const MACH_SEND_INVALID_DATA: u32 = 0x1000_0002;
pub const MACH_SEND_INVALID_DEST: u32 = 0x1000_0003;
pub const MACH_SEND_TIMED_OUT: u32 = 0x1000_0004;
pub const MACH_SEND_WILL_NOTIFY: u32 = 0x1000_0005;
pub const MACH_SEND_NOTIFY_IN_PROGRESS: u32 = 0x1000_0006;
pub const MACH_SEND_INTERRUPTED: u32 = 0x1000_0007;
pub const MACH_SEND_MSG_TOO_SMALL: u32 = 0x1000_0008;
pub const MACH_SEND_INVALID_REPLY: u32 = 0x1000_0009;
pub const MACH_SEND_INVALID_RIGHT: u32 = 0x1000_000a;
pub const MACH_SEND_INVALID_NOTIFY: u32 = 0x1000_000b;
pub const MACH_SEND_INVALID_MEMORY: u32 = 0x1000_000c;
pub const MACH_SEND_NO_BUFFER: u32 = 0x1000_000d;
pub const MACH_SEND_NO_NOTIFY: u32 = 0x1000_000e;
pub const MACH_SEND_INVALID_TYPE: u32 = 0x1000_000f;
pub const MACH_SEND_INVALID_HEADER: u32 = 0x1000_0010;

pub const MACH_RCV_IN_PROGRESS: u32 = 0x1000_4001;
pub const MACH_RCV_INVALID_NAME: u32 = 0x1000_4002;
pub const MACH_RCV_TIMED_OUT: u32 = 0x1000_4003;
pub const MACH_RCV_TOO_LARGE: u32 = 0x1000_4004;
pub const MACH_RCV_INTERRUPTED: u32 = 0x1000_4005;
pub const MACH_RCV_PORT_CHANGED: u32 = 0x1000_4006;
pub const MACH_RCV_INVALID_NOTIFY: u32 = 0x1000_4007;
pub const MACH_RCV_INVALID_DATA: u32 = 0x1000_4008;
pub const MACH_RCV_PORT_DIED: u32 = 0x1000_4009;
pub const MACH_RCV_IN_SET: u32 = 0x1000_400a;
pub const MACH_RCV_HEADER_ERROR: u32 = 0x1000_400b;
pub const MACH_RCV_BODY_ERROR: u32 = 0x1000_400c;

bitflags! {
    /// Resource bits composed into copyout failure codes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MsgSpecialBits: u32 {
        /// No room in the receiver's name space, or the space is dead
        const IPC_SPACE = MACH_MSG_IPC_SPACE;
        /// No room in the receiver's address space
        const VM_SPACE = MACH_MSG_VM_SPACE;
        /// Kernel memory shortage while translating a right
        const IPC_KERNEL = MACH_MSG_IPC_KERNEL;
        /// Kernel memory shortage while mapping memory
        const VM_KERNEL = MACH_MSG_VM_KERNEL;
    }
}

impl MsgSpecialBits {
    /// Bit reported when a right could not be copied out
    pub fn for_ipc(kr: KernError) -> Self {
        if kr == KernError::ResourceShortage {
            Self::IPC_KERNEL
        } else {
            Self::IPC_SPACE
        }
    }

    /// Bit reported when memory could not be copied out
    pub fn for_vm(kr: KernError) -> Self {
        if kr == KernError::ResourceShortage {
            Self::VM_KERNEL
        } else {
            Self::VM_SPACE
        }
    }
}

// ============================================================================
// Message Header
// ============================================================================

/// User message header
///
/// `local_port` is a pointer-sized slot: a port name, or the protected
/// payload when the local disposition is `MACH_MSG_TYPE_PROTECTED_PAYLOAD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MachMsgHeader {
    /// Message bits (dispositions, flags)
    pub msgh_bits: MachMsgBits,
    /// Total message size in bytes
    pub msgh_size: u32,
    /// Destination port name
    pub msgh_remote_port: MachPortName,
    /// Reply port name or protected payload
    pub msgh_local_port: u64,
    /// Sequence number
    pub msgh_seqno: u32,
    /// Message ID (application-defined)
    pub msgh_id: i32,
}

impl MachMsgHeader {
    /// Build a header addressed by names
    pub fn new(bits: MachMsgBits, remote: MachPortName, local: MachPortName, id: i32) -> Self {
        Self {
            msgh_bits: bits,
            msgh_size: 0,
            msgh_remote_port: remote,
            msgh_local_port: name_slot(local),
            msgh_seqno: 0,
            msgh_id: id,
        }
    }

    /// Reply port name, if the local slot holds one
    pub fn local_name(&self) -> Option<MachPortName> {
        narrow_port_name(self.msgh_local_port)
    }

    /// Protected payload, when the local disposition says there is one
    pub fn protected_payload(&self) -> Option<u64> {
        (self.msgh_bits.local() == MACH_MSG_TYPE_PROTECTED_PAYLOAD).then_some(self.msgh_local_port)
    }

    /// Decode a header from the start of `buf`
    pub fn decode(abi: MsgAbi, buf: &[u8]) -> Option<Self> {
        let p = abi.pointer_size();
        let bits = read_u32(buf, 0)?;
        let size = read_u32(buf, 4)?;
        let remote = abi.read_port_name(buf, 8)?;
        let local = abi.read_pointer(buf, 8 + p)?;
        let seqno = read_u32(buf, 8 + 2 * p)?;
        let id = read_u32(buf, 12 + 2 * p)?;
        Some(Self {
            msgh_bits: MachMsgBits(bits),
            msgh_size: size,
            msgh_remote_port: remote,
            msgh_local_port: local,
            msgh_seqno: seqno,
            msgh_id: id as i32,
        })
    }

    /// Append the encoded header
    pub fn encode(&self, abi: MsgAbi, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.msgh_bits.0.to_le_bytes());
        buf.extend_from_slice(&self.msgh_size.to_le_bytes());
        abi.put_port_name(buf, self.msgh_remote_port);
        abi.put_pointer(buf, self.msgh_local_port);
        buf.extend_from_slice(&self.msgh_seqno.to_le_bytes());
        buf.extend_from_slice(&self.msgh_id.to_le_bytes());
    }

    /// Encode a whole message: this header followed by `body`
    ///
    /// `msgh_size` is set to the total length.
    pub fn encode_message(&self, abi: MsgAbi, body: &[u8]) -> Vec<u8> {
        let mut header = *self;
        header.msgh_size = (abi.header_size() + body.len()) as u32;
        let mut buf = Vec::with_capacity(header.msgh_size as usize);
        header.encode(abi, &mut buf);
        buf.extend_from_slice(body);
        buf
    }
}

/// Pointer-sized slot for a port name
pub const fn name_slot(name: MachPortName) -> u64 {
    if name == MACH_PORT_DEAD {
        u64::MAX
    } else {
        name as u64
    }
}

// ============================================================================
// Message Errors
// ============================================================================

/// Failure of a message copyin, copyout or buffer operation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgError {
    #[error("message smaller than its header or declared contents")]
    SendMsgTooSmall,

    #[error("no kernel buffer for message")]
    SendNoBuffer,

    #[error("message buffer not readable")]
    SendInvalidData,

    #[error("invalid message header")]
    SendInvalidHeader,

    #[error("invalid destination port")]
    SendInvalidDest,

    #[error("invalid reply port")]
    SendInvalidReply,

    #[error("invalid notify port")]
    SendInvalidNotify,

    #[error("invalid port right in message body")]
    SendInvalidRight,

    #[error("invalid out-of-line memory in message body")]
    SendInvalidMemory,

    #[error("invalid type descriptor in message body")]
    SendInvalidType,

    #[error("receive name does not denote a receive right")]
    RcvInvalidName,

    #[error("no message queued")]
    RcvTimedOut,

    #[error("invalid notify port on receive")]
    RcvInvalidNotify,

    #[error("receive buffer not writable")]
    RcvInvalidData,

    #[error("header copyout failed ({0:?})")]
    RcvHeaderError(MsgSpecialBits),

    #[error("body copyout incomplete ({0:?})")]
    RcvBodyError(MsgSpecialBits),

    /// Partial copyout without a receive-side wrapper code
    #[error("copyout incomplete ({0:?})")]
    Degraded(MsgSpecialBits),
}

impl MsgError {
    /// The exact `mach_msg_return_t` for this failure
    pub fn code(self) -> MachMsgReturn {
        MachMsgReturn(match self {
            Self::SendMsgTooSmall => MACH_SEND_MSG_TOO_SMALL,
            Self::SendNoBuffer => MACH_SEND_NO_BUFFER,
            Self::SendInvalidData => MACH_SEND_INVALID_DATA,
            Self::SendInvalidHeader => MACH_SEND_INVALID_HEADER,
            Self::SendInvalidDest => MACH_SEND_INVALID_DEST,
            Self::SendInvalidReply => MACH_SEND_INVALID_REPLY,
            Self::SendInvalidNotify => MACH_SEND_INVALID_NOTIFY,
            Self::SendInvalidRight => MACH_SEND_INVALID_RIGHT,
            Self::SendInvalidMemory => MACH_SEND_INVALID_MEMORY,
            Self::SendInvalidType => MACH_SEND_INVALID_TYPE,
            Self::RcvInvalidName => MACH_RCV_INVALID_NAME,
            Self::RcvTimedOut => MACH_RCV_TIMED_OUT,
            Self::RcvInvalidNotify => MACH_RCV_INVALID_NOTIFY,
            Self::RcvInvalidData => MACH_RCV_INVALID_DATA,
            Self::RcvHeaderError(bits) => MACH_RCV_HEADER_ERROR | bits.bits(),
            Self::RcvBodyError(bits) => MACH_RCV_BODY_ERROR | bits.bits(),
            Self::Degraded(bits) => bits.bits(),
        })
    }

    /// Whether the message was still delivered
    pub fn is_delivered(self) -> bool {
        matches!(self, Self::RcvBodyError(_) | Self::Degraded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_fields() {
        let bits = MachMsgBits(
            MACH_MSGH_BITS_COMPLEX | MachMsgBits::new(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE).0,
        );
        assert_eq!(bits.remote(), 19);
        assert_eq!(bits.local(), 21);
        assert!(bits.is_complex());
        assert_eq!(bits.other(), MACH_MSGH_BITS_COMPLEX);

        let swapped = bits.with_ports(MACH_MSG_TYPE_PORT_SEND_ONCE, MACH_MSG_TYPE_PORT_SEND);
        assert_eq!(swapped.0, 0x8000_1112);
    }

    #[test]
    fn test_header_layouts() {
        let bits = MachMsgBits::new(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE);
        let mut header = MachMsgHeader::new(bits, 0x0100_0001, MACH_PORT_DEAD, 77);
        header.msgh_seqno = 5;

        let mut small = Vec::new();
        header.encode(MsgAbi::I386, &mut small);
        assert_eq!(small.len(), MsgAbi::I386.header_size());
        assert_eq!(&small[12..16], &[0xff; 4]);

        let mut wide = Vec::new();
        header.encode(MsgAbi::X86_64, &mut wide);
        assert_eq!(wide.len(), MsgAbi::X86_64.header_size());
        assert_eq!(&wide[16..24], &[0xff; 8]);

        for (abi, buf) in [(MsgAbi::I386, &small), (MsgAbi::X86_64, &wide)] {
            let back = MachMsgHeader::decode(abi, buf).unwrap();
            assert_eq!(back.msgh_remote_port, 0x0100_0001);
            assert_eq!(back.local_name(), Some(MACH_PORT_DEAD));
            assert_eq!(back.msgh_seqno, 5);
            assert_eq!(back.msgh_id, 77);
        }
    }

    #[test]
    fn test_port_kinds() {
        for name in 0..64 {
            assert_eq!(msgt_is_port(name), (16..=21).contains(&name));
            assert_eq!(msgt_is_port_any_send(name), (17..=21).contains(&name));
        }
        assert!(!msgt_is_port(MACH_MSG_TYPE_POLYMORPHIC));
        assert_eq!(PortDisposition::from_raw(20), Some(PortDisposition::MakeSend));
        assert_eq!(PortDisposition::CopySend.copyin_type(), MACH_MSG_TYPE_PORT_SEND);
        assert_eq!(PortDisposition::MakeSendOnce.copyin_type(), MACH_MSG_TYPE_PORT_SEND_ONCE);
    }

    #[test]
    fn test_return_codes() {
        assert_eq!(MsgError::SendInvalidHeader.code().0, 0x1000_0010);
        let err = MsgError::RcvBodyError(MsgSpecialBits::VM_SPACE | MsgSpecialBits::IPC_KERNEL);
        let code = err.code();
        assert_eq!(code.0, 0x1000_400c | 0x1000 | 0x800);
        assert_eq!(code.base().0, MACH_RCV_BODY_ERROR);
        assert!(code.special_bits().contains(MsgSpecialBits::VM_SPACE));
        assert_eq!(MachMsgReturn::from(Ok(())), MachMsgReturn::SUCCESS);
        assert_eq!(MsgSpecialBits::for_vm(KernError::NoSpace), MsgSpecialBits::VM_SPACE);
        assert_eq!(
            MsgSpecialBits::for_ipc(KernError::ResourceShortage),
            MsgSpecialBits::IPC_KERNEL
        );
    }
}
