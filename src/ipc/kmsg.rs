//! IPC Kernel Message - Internal message representation
//!
//! Based on Mach4 ipc/ipc_kmsg.h, ipc/ipc_kmsg.c
//! Kernel messages are the internal representation of Mach messages
//! as they pass through the kernel.
//!
//! A kmsg starts life as a copy of the sender's wire image (names in the
//! header, raw typed elements in the body). Copyin turns names into rights
//! and lifts out-of-line memory into copy objects; copyout does the reverse
//! for the receiver, whose layout may differ from the sender's.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use super::entry::{MachPortName, MACH_PORT_DEAD, MACH_PORT_NULL};
use super::ipc_object::{ipc_object_copyout_dest, ipc_object_destroy, IpcObject};
use super::kmsg_body::{ipc_kmsg_clean_body, ipc_kmsg_copyin_body, ipc_kmsg_copyout_body,
    ipc_kmsg_copyout_object, ipc_kmsg_prewalk_body, ipc_kmsg_scrub_body, ipc_kmsg_transcode_body};
use super::kmsg_header::{ipc_kmsg_copyin_header, ipc_kmsg_copyout_header};
use super::mach_msg::{
    MachMsgBits, MachMsgHeader, MachMsgTypeName, MsgError, MsgHeaderFlags, MsgSpecialBits,
    MACH_MSG_TYPE_PORT_SEND, MACH_MSG_TYPE_PORT_SEND_ONCE,
};
use super::msg_type::{MsgAbi, MsgTypeDesc};
use super::space::IpcSpace;
use crate::counter;
use crate::kern::counters::{C_IPC_KMSG_CACHE_HITS, C_IPC_KMSG_CACHE_MISSES};
use crate::kern::kalloc::{Kalloc, KernelHeap};
use crate::kern::processor::Processor;
use crate::mach_vm::vm_map::{VmMap, VmMapCopy};

// ============================================================================
// Buffer Sizes
// ============================================================================

/// Message size the per-processor cache holds
pub const IKM_SAVED_MSG_SIZE: usize = 224;

/// Kernel bookkeeping charged per kmsg
pub const IKM_OVERHEAD: usize = 32;

/// Room for the kernel form of a message relative to its wire size
pub const IKM_EXPAND_FACTOR: usize = 2;

/// Heap charge for a kmsg holding `size` wire bytes
pub const fn ikm_plus_overhead(size: usize) -> usize {
    size * IKM_EXPAND_FACTOR + IKM_OVERHEAD
}

// ============================================================================
// Kmsg Header
// ============================================================================

/// A header port slot: a name before copyin and after copyout, a right
/// in between
#[derive(Debug)]
pub enum PortField {
    /// User-visible name
    Name(MachPortName),
    /// Kernel right
    Object(IpcObject),
    /// Protected payload delivered in place of the destination name
    Payload(u64),
}

impl PortField {
    /// Take the right out, leaving `MACH_PORT_NULL`
    pub fn take_object(&mut self) -> IpcObject {
        match core::mem::replace(self, PortField::Name(MACH_PORT_NULL)) {
            PortField::Object(object) => object,
            other => {
                *self = other;
                IpcObject::Null
            }
        }
    }

    /// The name, if this slot holds one
    pub fn name(&self) -> Option<MachPortName> {
        match self {
            PortField::Name(name) => Some(*name),
            _ => None,
        }
    }

    /// The right, if this slot holds one
    pub fn object(&self) -> Option<&IpcObject> {
        match self {
            PortField::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Pointer-sized wire value
    fn wire_value(&self) -> u64 {
        match self {
            PortField::Name(MACH_PORT_DEAD) => u64::MAX,
            PortField::Name(name) => u64::from(*name),
            PortField::Payload(payload) => *payload,
            PortField::Object(object) => {
                log::warn!("kmsg: encoding an uncopied header right {:?}", object);
                u64::from(object.sentinel_name().unwrap_or(MACH_PORT_NULL))
            }
        }
    }
}

/// Kernel message header
#[derive(Debug)]
pub struct KmsgHeader {
    /// Dispositions and flags
    pub bits: MachMsgBits,
    /// Total size of the wire image
    pub size: u32,
    /// Destination
    pub remote: PortField,
    /// Reply
    pub local: PortField,
    /// Sequence number (passed through)
    pub seqno: u32,
    /// Message ID (passed through)
    pub id: i32,
}

impl KmsgHeader {
    /// The header of a user message, with names in both port slots
    ///
    /// A wide local slot that holds no name is `MACH_SEND_INVALID_HEADER`.
    pub fn from_user(header: &MachMsgHeader) -> Result<Self, MsgError> {
        let local = header.local_name().ok_or(MsgError::SendInvalidHeader)?;
        Ok(Self {
            bits: header.msgh_bits,
            size: header.msgh_size,
            remote: PortField::Name(header.msgh_remote_port),
            local: PortField::Name(local),
            seqno: header.msgh_seqno,
            id: header.msgh_id,
        })
    }

    /// The user header for this kmsg
    pub fn to_user(&self) -> MachMsgHeader {
        MachMsgHeader {
            msgh_bits: self.bits,
            msgh_size: self.size,
            msgh_remote_port: self.remote.wire_value() as MachPortName,
            msgh_local_port: self.local.wire_value(),
            msgh_seqno: self.seqno,
            msgh_id: self.id,
        }
    }
}

// ============================================================================
// Kmsg Body
// ============================================================================

/// What a body element holds between copyin and copyout
#[derive(Debug)]
pub enum KmsgData {
    /// Inline plain data
    Inline(Vec<u8>),
    /// Port rights, of the element's receive-side type
    Ports {
        objects: Vec<IpcObject>,
        /// Delivered out of line
        out_of_line: bool,
        /// Kernel copy of an out-of-line array
        charge: Option<Kalloc>,
    },
    /// Out-of-line data; `None` for an empty region
    Memory(Option<VmMapCopy>),
}

/// A copied-in body element
#[derive(Debug)]
pub struct KmsgElement {
    pub desc: MsgTypeDesc,
    pub data: KmsgData,
}

/// Message body
#[derive(Debug)]
pub enum KmsgBody {
    /// Raw typed elements in the kmsg's wire layout
    Wire(Vec<u8>),
    /// Translated elements
    Kernel(Vec<KmsgElement>),
}

impl KmsgBody {
    /// Wire bytes, if the body is in wire form
    pub fn wire(&self) -> Option<&[u8]> {
        match self {
            KmsgBody::Wire(bytes) => Some(bytes),
            KmsgBody::Kernel(_) => None,
        }
    }

    /// Translated elements, if the body has been copied in
    pub fn elements(&self) -> Option<&[KmsgElement]> {
        match self {
            KmsgBody::Kernel(elements) => Some(elements),
            KmsgBody::Wire(_) => None,
        }
    }
}

// ============================================================================
// Kernel Message
// ============================================================================

/// IPC Kernel Message
#[derive(Debug)]
pub struct IpcKmsg {
    /// Layout of a `Wire` body
    abi: MsgAbi,
    /// Header
    pub header: KmsgHeader,
    /// Body
    pub body: KmsgBody,
    /// Buffer capacity (`ikm_size`)
    ikm_size: usize,
    /// Heap charge; kernel-generated messages carry none
    charge: Option<Kalloc>,
}

impl IpcKmsg {
    /// An empty kmsg of capacity `size`, charged to `heap`
    fn alloc(heap: &alloc::sync::Arc<KernelHeap>, size: usize) -> Option<Box<Self>> {
        let charge = heap.kalloc(ikm_plus_overhead(size))?;
        Some(Box::new(Self {
            abi: MsgAbi::native(),
            header: KmsgHeader {
                bits: MachMsgBits::default(),
                size: 0,
                remote: PortField::Name(MACH_PORT_NULL),
                local: PortField::Name(MACH_PORT_NULL),
                seqno: 0,
                id: 0,
            },
            body: KmsgBody::Wire(Vec::new()),
            ikm_size: size,
            charge: Some(charge),
        }))
    }

    /// A kernel-generated message, uncharged
    pub fn kernel(header: KmsgHeader, body: Vec<u8>) -> Box<Self> {
        let ikm_size = MsgAbi::native().header_size() + body.len();
        Box::new(Self {
            abi: MsgAbi::native(),
            header,
            body: KmsgBody::Wire(body),
            ikm_size,
            charge: None,
        })
    }

    /// Layout of the body
    pub fn abi(&self) -> MsgAbi {
        self.abi
    }

    pub(crate) fn set_abi(&mut self, abi: MsgAbi) {
        self.abi = abi;
    }

    /// Buffer capacity
    pub fn ikm_size(&self) -> usize {
        self.ikm_size
    }

    /// Destination right, after header copyin
    pub fn destination(&self) -> Option<&alloc::sync::Arc<super::port::IpcPort>> {
        self.header.remote.object().and_then(IpcObject::port)
    }

    /// Fill from a wire image laid out for `abi`
    fn fill(&mut self, abi: MsgAbi, buf: &[u8]) -> Result<(), MsgError> {
        let header = MachMsgHeader::decode(abi, buf).ok_or(MsgError::SendMsgTooSmall)?;
        self.header = KmsgHeader::from_user(&header)?;
        self.abi = abi;
        self.header.size = buf.len() as u32;
        self.body = KmsgBody::Wire(buf[abi.header_size()..].to_vec());
        Ok(())
    }

    /// Wire image in the kmsg's layout
    ///
    /// A body that was never copied out is encoded with null names and
    /// zero addresses.
    pub fn encode(&self) -> Vec<u8> {
        let abi = self.abi;
        let body = match &self.body {
            KmsgBody::Wire(bytes) => bytes.clone(),
            KmsgBody::Kernel(elements) => ipc_kmsg_scrub_body(abi, elements),
        };
        self.header.to_user().encode_message(abi, &body)
    }
}

// ============================================================================
// Kmsg Queue
// ============================================================================

/// FIFO of kernel messages
#[derive(Debug, Default)]
pub struct IpcKmsgQueue {
    queue: VecDeque<Box<IpcKmsg>>,
}

impl IpcKmsgQueue {
    pub const fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// `ipc_kmsg_enqueue`
    pub fn enqueue(&mut self, kmsg: Box<IpcKmsg>) {
        self.queue.push_back(kmsg);
    }

    /// `ipc_kmsg_dequeue`
    pub fn dequeue(&mut self) -> Option<Box<IpcKmsg>> {
        self.queue.pop_front()
    }

    /// Move every message of `other` to the end of this queue
    pub fn append(&mut self, other: &mut IpcKmsgQueue) {
        self.queue.append(&mut other.queue);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Messages in order
    pub fn iter(&self) -> impl Iterator<Item = &IpcKmsg> {
        self.queue.iter().map(|kmsg| &**kmsg)
    }
}

// ============================================================================
// Allocation
// ============================================================================

/// Allocate a kmsg for `size` wire bytes, preferring the processor cache
fn ikm_get(cpu: &mut Processor, size: usize) -> Result<Box<IpcKmsg>, MsgError> {
    if size <= IKM_SAVED_MSG_SIZE {
        if let Some(kmsg) = cpu.ikm_cache_take() {
            counter!(C_IPC_KMSG_CACHE_HITS);
            return Ok(kmsg);
        }
    }
    counter!(C_IPC_KMSG_CACHE_MISSES);
    IpcKmsg::alloc(cpu.heap(), size.max(IKM_SAVED_MSG_SIZE)).ok_or(MsgError::SendNoBuffer)
}

/// `ipc_kmsg_free`: release a kmsg that holds no rights or memory
///
/// A charged kmsg of the common size goes back to the processor cache,
/// displacing (and freeing) any previous occupant.
pub fn ipc_kmsg_free(cpu: &mut Processor, mut kmsg: Box<IpcKmsg>) {
    if kmsg.ikm_size == IKM_SAVED_MSG_SIZE && kmsg.charge.is_some() {
        kmsg.header.bits = MachMsgBits::default();
        kmsg.header.remote = PortField::Name(MACH_PORT_NULL);
        kmsg.header.local = PortField::Name(MACH_PORT_NULL);
        kmsg.body = KmsgBody::Wire(Vec::new());
        drop(cpu.ikm_cache_replace(kmsg));
    }
}

/// `ipc_kmsg_get`: copy a message in from the sender's address space
pub fn ipc_kmsg_get(
    cpu: &mut Processor,
    map: &VmMap,
    addr: u64,
    size: usize,
) -> Result<Box<IpcKmsg>, MsgError> {
    let abi = map.abi();
    if size < abi.header_size() || !abi.is_aligned(size) {
        return Err(MsgError::SendMsgTooSmall);
    }

    let mut kmsg = ikm_get(cpu, size)?;
    let bytes = match map.read(addr, size) {
        Ok(bytes) => bytes,
        Err(kr) => {
            log::debug!("ipc_kmsg_get: cannot read {:#x}+{}: {:?}", addr, size, kr);
            ipc_kmsg_free(cpu, kmsg);
            return Err(MsgError::SendInvalidData);
        }
    };
    if let Err(mr) = kmsg.fill(abi, &bytes) {
        ipc_kmsg_free(cpu, kmsg);
        return Err(mr);
    }
    Ok(kmsg)
}

/// `ipc_kmsg_get_from_kernel`: a kmsg from a message composed by the
/// kernel in the native layout
pub fn ipc_kmsg_get_from_kernel(cpu: &mut Processor, msg: &[u8]) -> Result<Box<IpcKmsg>, MsgError> {
    let abi = MsgAbi::native();
    if msg.len() < abi.header_size() || !abi.is_aligned(msg.len()) {
        return Err(MsgError::SendMsgTooSmall);
    }
    let mut kmsg = ikm_get(cpu, msg.len())?;
    if let Err(mr) = kmsg.fill(abi, msg) {
        ipc_kmsg_free(cpu, kmsg);
        return Err(mr);
    }
    Ok(kmsg)
}

/// `ipc_kmsg_put`: write a copied-out message to the receiver's buffer
///
/// The kmsg is freed whether or not the write succeeds.
pub fn ipc_kmsg_put(
    cpu: &mut Processor,
    map: &VmMap,
    addr: u64,
    kmsg: Box<IpcKmsg>,
) -> Result<(), MsgError> {
    let bytes = kmsg.encode();
    let result = map.write(addr, &bytes).map_err(|kr| {
        log::debug!("ipc_kmsg_put: cannot write {:#x}+{}: {:?}", addr, bytes.len(), kr);
        MsgError::RcvInvalidData
    });
    ipc_kmsg_free(cpu, kmsg);
    result
}

/// `ipc_kmsg_put_to_kernel`: the wire image of a message received by
/// kernel code
pub fn ipc_kmsg_put_to_kernel(cpu: &mut Processor, kmsg: Box<IpcKmsg>) -> Vec<u8> {
    let bytes = kmsg.encode();
    ipc_kmsg_free(cpu, kmsg);
    bytes
}

// ============================================================================
// Destruction
// ============================================================================

/// `ipc_kmsg_clean`: release every right and region a kmsg holds
///
/// Messages destroyed as a consequence go to `reap`.
pub fn ipc_kmsg_clean(kmsg: &mut IpcKmsg, reap: &mut IpcKmsgQueue) {
    let bits = kmsg.header.bits;
    ipc_object_destroy(kmsg.header.remote.take_object(), bits.remote(), reap);
    ipc_object_destroy(kmsg.header.local.take_object(), bits.local(), reap);

    let body = core::mem::replace(&mut kmsg.body, KmsgBody::Wire(Vec::new()));
    if let KmsgBody::Kernel(elements) = body {
        ipc_kmsg_clean_body(elements, reap);
    }
}

/// `ipc_kmsg_clean_partial`: undo a body copyin that failed part way
///
/// Releases the header rights, the elements already translated, and the
/// first objects of the element that failed.
pub fn ipc_kmsg_clean_partial(
    kmsg: &mut IpcKmsg,
    done: Vec<KmsgElement>,
    partial: Option<(MachMsgTypeName, Vec<IpcObject>)>,
    reap: &mut IpcKmsgQueue,
) {
    let bits = kmsg.header.bits;
    ipc_object_destroy(kmsg.header.remote.take_object(), bits.remote(), reap);
    ipc_object_destroy(kmsg.header.local.take_object(), bits.local(), reap);

    ipc_kmsg_clean_body(done, reap);
    if let Some((name, objects)) = partial {
        for object in objects {
            ipc_object_destroy(object, name, reap);
        }
    }
}

/// `ipc_kmsg_reap`: destroy every queued message
///
/// Destroying one message can free others (a receive right carrying a
/// queue); they join the end of `reap` instead of being destroyed
/// recursively.
pub fn ipc_kmsg_reap(reap: &mut IpcKmsgQueue) {
    while let Some(mut kmsg) = reap.dequeue() {
        ipc_kmsg_clean(&mut kmsg, reap);
    }
}

/// `ipc_kmsg_destroy`: release everything a kmsg holds and free it
pub fn ipc_kmsg_destroy(kmsg: Box<IpcKmsg>) {
    let mut reap = IpcKmsgQueue::new();
    reap.enqueue(kmsg);
    ipc_kmsg_reap(&mut reap);
}

// ============================================================================
// Copyin / Copyout
// ============================================================================

/// `ipc_kmsg_copyin`: translate a message from the sender's space
///
/// On failure nothing of the sender's state has changed, except that a
/// bad right or region in the body also releases the header rights.
pub fn ipc_kmsg_copyin(
    kmsg: &mut IpcKmsg,
    space: &IpcSpace,
    map: &VmMap,
    notify: MachPortName,
) -> Result<(), MsgError> {
    let mut bits = kmsg.header.bits;
    bits.remove(MsgHeaderFlags::INTERNAL);
    kmsg.header.bits = bits;

    if bits.is_complex() {
        if let KmsgBody::Wire(body) = &kmsg.body {
            ipc_kmsg_prewalk_body(kmsg.abi, body)?;
        }
    }

    ipc_kmsg_copyin_header(&mut kmsg.header, space, notify)?;
    if !kmsg.header.bits.is_complex() {
        return Ok(());
    }
    ipc_kmsg_copyin_body(kmsg, space, map)
}

/// `ipc_kmsg_copyin_from_kernel`: take a kernel-composed message whose
/// header already carries rights
///
/// Only `MACH_MSG_TYPE_MAKE_*` style dispositions are rewritten to their
/// receive-side form; no space is consulted.
pub fn ipc_kmsg_copyin_from_kernel(kmsg: &mut IpcKmsg) {
    let bits = kmsg.header.bits;
    let remote = super::ipc_object::ipc_object_copyin_type(bits.remote());
    let local = super::ipc_object::ipc_object_copyin_type(bits.local());
    kmsg.header.bits = bits.with_ports(remote, local);
}

/// `ipc_kmsg_copyout`: translate a message into the receiver's space
///
/// A header failure leaves the kmsg untouched and returns
/// `RcvHeaderError`; the caller may still recover the destination name
/// with `ipc_kmsg_copyout_dest`. Body failures do not stop the copyout
/// and are reported together as `RcvBodyError`.
pub fn ipc_kmsg_copyout(
    kmsg: &mut IpcKmsg,
    space: &IpcSpace,
    map: &VmMap,
    notify: MachPortName,
) -> Result<(), MsgError> {
    ipc_kmsg_copyout_header(&mut kmsg.header, space, notify)?;

    let mut bits = MsgSpecialBits::empty();
    if kmsg.header.bits.is_complex() {
        bits = ipc_kmsg_copyout_body(kmsg, space, map);
    } else {
        ipc_kmsg_transcode_body(kmsg, map.abi());
    }
    kmsg.header.size = (map.abi().header_size() + kmsg.body.wire().map_or(0, <[u8]>::len)) as u32;

    if bits.is_empty() {
        Ok(())
    } else {
        log::warn!("ipc_kmsg_copyout: body degraded {:?}", bits);
        Err(MsgError::RcvBodyError(bits))
    }
}

/// `ipc_kmsg_copyout_pseudo`: give a message back to its sender's space
///
/// Both header rights are copied out as ordinary rights, without swapping
/// or pairing them, and the body follows.
pub fn ipc_kmsg_copyout_pseudo(
    kmsg: &mut IpcKmsg,
    space: &IpcSpace,
    map: &VmMap,
) -> Result<(), MsgError> {
    let mbits = kmsg.header.bits;
    let dest = kmsg.header.remote.take_object();
    let reply = kmsg.header.local.take_object();

    let (dest_name, mut bits) = ipc_kmsg_copyout_object(space, dest, mbits.remote());
    let (reply_name, reply_bits) = ipc_kmsg_copyout_object(space, reply, mbits.local());
    bits |= reply_bits;

    let mut mbits = mbits;
    mbits.remove(MsgHeaderFlags::CIRCULAR);
    kmsg.header.bits = mbits;
    kmsg.header.remote = PortField::Name(dest_name);
    kmsg.header.local = PortField::Name(reply_name);

    if mbits.is_complex() {
        bits |= ipc_kmsg_copyout_body(kmsg, space, map);
    } else {
        ipc_kmsg_transcode_body(kmsg, map.abi());
    }
    kmsg.header.size = (map.abi().header_size() + kmsg.body.wire().map_or(0, <[u8]>::len)) as u32;

    if bits.is_empty() {
        Ok(())
    } else {
        Err(MsgError::Degraded(bits))
    }
}

/// `ipc_kmsg_copyout_dest`: recover only the destination name
///
/// The reply right and the body are destroyed; the result reads as a
/// received message whose local port is the destination name (or
/// `MACH_PORT_DEAD`) and whose remote port is null.
pub fn ipc_kmsg_copyout_dest(kmsg: &mut IpcKmsg, space: &IpcSpace) {
    let mbits = kmsg.header.bits;
    let dest_type = mbits.remote();
    let reply_type = mbits.local();
    let mut reap = IpcKmsgQueue::new();

    let dest_name = match kmsg.header.remote.take_object() {
        IpcObject::Port(port) => {
            let st = port.lock();
            if st.active {
                ipc_object_copyout_dest(space.id(), &port, st, dest_type)
            } else {
                drop(st);
                quiet_release(&port, dest_type);
                MACH_PORT_DEAD
            }
        }
        other => other.sentinel_name().unwrap_or(MACH_PORT_NULL),
    };

    let reply_name = match kmsg.header.local.take_object() {
        IpcObject::Port(port) => {
            ipc_object_destroy(IpcObject::Port(port), reply_type, &mut reap);
            MACH_PORT_NULL
        }
        other => other.sentinel_name().unwrap_or(MACH_PORT_NULL),
    };

    kmsg.header.bits = MachMsgBits(mbits.other()).with_ports(reply_type, dest_type);
    kmsg.header.local = PortField::Name(dest_name);
    kmsg.header.remote = PortField::Name(reply_name);

    let body = core::mem::replace(&mut kmsg.body, KmsgBody::Wire(Vec::new()));
    if let KmsgBody::Kernel(elements) = body {
        kmsg.body = KmsgBody::Wire(ipc_kmsg_scrub_body(kmsg.abi, &elements));
        ipc_kmsg_clean_body(elements, &mut reap);
    } else {
        kmsg.body = body;
    }
    ipc_kmsg_reap(&mut reap);
}

/// Drop a right to a dead port without notifications
pub(crate) fn quiet_release(port: &alloc::sync::Arc<super::port::IpcPort>, msgt_name: MachMsgTypeName) {
    let mut st = port.lock();
    match msgt_name {
        MACH_MSG_TYPE_PORT_SEND => st.srights = st.srights.saturating_sub(1),
        MACH_MSG_TYPE_PORT_SEND_ONCE => st.sorights = st.sorights.saturating_sub(1),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::mach_msg::{MACH_MSG_TYPE_COPY_SEND, MACH_MSGH_BITS_CIRCULAR};
    use crate::ipc::msg_type::MsgBodyBuilder;
    use crate::mach_vm::vm_map::PAGE_SIZE;

    fn user_message(abi: MsgAbi, body: &[u8]) -> Vec<u8> {
        let header = MachMsgHeader::new(MachMsgBits::new(MACH_MSG_TYPE_COPY_SEND, 0), 0x0100_0001, 0, 42);
        header.encode_message(abi, body)
    }

    #[test]
    fn test_get_checks_size() {
        let heap = KernelHeap::unlimited();
        let mut cpu = Processor::new(0, heap.clone());
        let map = VmMap::new(MsgAbi::I386, heap);
        let addr = map.allocate(PAGE_SIZE, true, 0).unwrap();

        assert_eq!(ipc_kmsg_get(&mut cpu, &map, addr, 20).unwrap_err(), MsgError::SendMsgTooSmall);
        assert_eq!(ipc_kmsg_get(&mut cpu, &map, addr, 26).unwrap_err(), MsgError::SendMsgTooSmall);
        assert_eq!(
            ipc_kmsg_get(&mut cpu, &map, addr + PAGE_SIZE, 24).unwrap_err(),
            MsgError::SendInvalidData
        );
    }

    #[test]
    fn test_get_put_round_trip() {
        let heap = KernelHeap::unlimited();
        let mut cpu = Processor::new(0, heap.clone());
        let map = VmMap::new(MsgAbi::X86_64, heap);
        let body = MsgBodyBuilder::new(MsgAbi::X86_64)
            .inline_data(2, 32, 1, &0xCAFE_BABEu32.to_le_bytes())
            .finish();
        let msg = user_message(MsgAbi::X86_64, &body);
        let addr = map.allocate(PAGE_SIZE, true, 0).unwrap();
        map.write(addr, &msg).unwrap();

        let kmsg = ipc_kmsg_get(&mut cpu, &map, addr, msg.len()).unwrap();
        assert_eq!(kmsg.header.remote.name(), Some(0x0100_0001));
        assert_eq!(kmsg.header.id, 42);
        assert_eq!(kmsg.body.wire(), Some(&body[..]));

        let out = map.allocate(PAGE_SIZE, true, 0).unwrap();
        ipc_kmsg_put(&mut cpu, &map, out, kmsg).unwrap();
        assert_eq!(map.read(out, msg.len()).unwrap(), msg);
    }

    #[test]
    fn test_get_rejects_wide_reply_slot() {
        let heap = KernelHeap::unlimited();
        let mut cpu = Processor::new(0, heap.clone());
        let map = VmMap::new(MsgAbi::X86_64, heap);
        let mut header = MachMsgHeader::new(MachMsgBits::new(MACH_MSG_TYPE_COPY_SEND, 0), 0x0100_0001, 0, 42);
        header.msgh_local_port = 0x0000_0001_0100_0002;
        let msg = header.encode_message(MsgAbi::X86_64, &[]);
        let addr = map.allocate(PAGE_SIZE, true, 0).unwrap();
        map.write(addr, &msg).unwrap();

        assert_eq!(
            ipc_kmsg_get(&mut cpu, &map, addr, msg.len()).unwrap_err(),
            MsgError::SendInvalidHeader
        );

        header.msgh_local_port = u64::MAX;
        map.write(addr, &header.encode_message(MsgAbi::X86_64, &[])).unwrap();
        let kmsg = ipc_kmsg_get(&mut cpu, &map, addr, msg.len()).unwrap();
        assert_eq!(kmsg.header.local.name(), Some(MACH_PORT_DEAD));
        ipc_kmsg_free(&mut cpu, kmsg);
    }

    #[test]
    fn test_kernel_round_trip() {
        let heap = KernelHeap::unlimited();
        let mut cpu = Processor::new(0, heap.clone());
        let abi = MsgAbi::native();
        let body = MsgBodyBuilder::new(abi)
            .inline_data(2, 32, 2, &[1, 2, 3, 4, 5, 6, 7, 8])
            .finish();
        let msg = user_message(abi, &body);

        let kmsg = ipc_kmsg_get_from_kernel(&mut cpu, &msg).unwrap();
        assert_eq!(kmsg.header.id, 42);
        assert_eq!(ipc_kmsg_put_to_kernel(&mut cpu, kmsg), msg);
        assert!(cpu.ikm_cache_occupied());

        assert_eq!(
            ipc_kmsg_get_from_kernel(&mut cpu, &msg[..msg.len() - 1]).unwrap_err(),
            MsgError::SendMsgTooSmall
        );
    }

    #[test]
    fn test_cache_reuse() {
        let heap = KernelHeap::unlimited();
        let mut cpu = Processor::new(0, heap.clone());
        let msg = user_message(MsgAbi::native(), &[]);

        let kmsg = ipc_kmsg_get_from_kernel(&mut cpu, &msg).unwrap();
        let charged = heap.in_use();
        ipc_kmsg_free(&mut cpu, kmsg);
        assert!(cpu.ikm_cache_occupied());
        assert_eq!(heap.in_use(), charged);

        let _again = ipc_kmsg_get_from_kernel(&mut cpu, &msg).unwrap();
        assert!(!cpu.ikm_cache_occupied());
        assert_eq!(heap.in_use(), charged);
    }

    #[test]
    fn test_no_buffer() {
        let heap = KernelHeap::with_limit(64);
        let mut cpu = Processor::new(0, heap);
        let msg = user_message(MsgAbi::native(), &[]);
        assert_eq!(ipc_kmsg_get_from_kernel(&mut cpu, &msg).unwrap_err(), MsgError::SendNoBuffer);
    }

    #[test]
    fn test_large_kmsg_not_cached() {
        let heap = KernelHeap::unlimited();
        let mut cpu = Processor::new(0, heap.clone());
        let body = vec![0u8; 512];
        let msg = user_message(MsgAbi::native(), &body);
        let kmsg = ipc_kmsg_get_from_kernel(&mut cpu, &msg).unwrap();
        assert!(kmsg.ikm_size() > IKM_SAVED_MSG_SIZE);
        ipc_kmsg_free(&mut cpu, kmsg);
        assert!(!cpu.ikm_cache_occupied());
        assert_eq!(heap.in_use(), 0);
    }

    #[test]
    fn test_copyin_strips_internal_bits() {
        let heap = KernelHeap::unlimited();
        let mut cpu = Processor::new(0, heap.clone());
        let space = IpcSpace::new();
        let map = VmMap::new(MsgAbi::native(), heap);
        let name = crate::ipc::port_ops::mach_port_allocate_receive(&space).unwrap();
        crate::ipc::port_ops::mach_port_insert_send(&space, name).unwrap();

        let bits = MachMsgBits(MACH_MSGH_BITS_CIRCULAR | MachMsgBits::new(MACH_MSG_TYPE_COPY_SEND, 0).0);
        let msg = MachMsgHeader::new(bits, name, 0, 1).encode_message(MsgAbi::native(), &[]);
        let mut kmsg = ipc_kmsg_get_from_kernel(&mut cpu, &msg).unwrap();
        ipc_kmsg_copyin(&mut kmsg, &space, &map, MACH_PORT_NULL).unwrap();
        assert!(!kmsg.header.bits.is_circular());
        assert_eq!(kmsg.header.bits.remote(), MACH_MSG_TYPE_PORT_SEND);
        ipc_kmsg_destroy(kmsg);
    }

    #[test]
    fn test_queue_fifo() {
        let mut queue = IpcKmsgQueue::new();
        for id in 0..3 {
            let mut kmsg = IpcKmsg::kernel(
                KmsgHeader::from_user(&MachMsgHeader::new(MachMsgBits::default(), 0, 0, id)).unwrap(),
                Vec::new(),
            );
            kmsg.header.id = id;
            queue.enqueue(kmsg);
        }
        let ids: Vec<i32> = queue.iter().map(|k| k.header.id).collect();
        assert_eq!(ids, [0, 1, 2]);
        assert_eq!(queue.dequeue().unwrap().header.id, 0);
        assert_eq!(queue.len(), 2);
    }
}
