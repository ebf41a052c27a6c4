//! Body copyin/copyout
//!
//! Based on Mach4 ipc/ipc_kmsg.c (ipc_kmsg_copyin_body,
//! ipc_kmsg_copyout_body, ipc_kmsg_clean_body)
//!
//! Copyin turns the sender's wire body into a list of kernel elements:
//! port names become rights, out-of-line regions become copy objects.
//! Copyout lays the elements out again for the receiver, which may use a
//! different message layout than the sender.

use alloc::vec::Vec;

use super::entry::{MachPortName, MACH_PORT_DEAD, MACH_PORT_NULL};
use super::ipc_object::{ipc_object_copyin, ipc_object_copyout, ipc_object_destroy, ipc_object_destroy_now, IpcObject};
use super::kmsg::{ipc_kmsg_clean_partial, ipc_kmsg_reap, IpcKmsg, IpcKmsgQueue, KmsgBody, KmsgData, KmsgElement};
use super::mach_msg::{
    MachMsgTypeName, MsgError, MsgHeaderFlags, MsgSpecialBits, PortDisposition, MACH_MSG_TYPE_PORT_RECEIVE,
};
use super::msg_type::{MsgAbi, MsgBodyBuilder, MsgTypeDesc, TypeCursor, TypedData};
use super::port::ipc_port_check_circularity;
use super::space::IpcSpace;
use crate::kern::kern_return::KernError;
use crate::mach_vm::vm_map::VmMap;

/// `ipc_kmsg_prewalk_body`: check that the whole body is well formed
/// before anything is copied in
pub fn ipc_kmsg_prewalk_body(abi: MsgAbi, body: &[u8]) -> Result<(), MsgError> {
    for item in TypeCursor::new(abi, body) {
        item?;
    }
    Ok(())
}

// ============================================================================
// Copyin
// ============================================================================

/// Port names of a port element, inline or out of line
fn element_port_names(
    abi: MsgAbi,
    map: &VmMap,
    desc: &MsgTypeDesc,
    data: TypedData<'_>,
) -> Result<Vec<MachPortName>, MsgError> {
    let count = desc.number as usize;
    let wanted = count.saturating_mul(abi.pointer_size());
    match data {
        TypedData::Inline(bytes) if bytes.len() < wanted => Err(MsgError::SendMsgTooSmall),
        TypedData::Inline(bytes) => wide_port_names(abi, bytes, count),
        TypedData::OutOfLine(_) if count == 0 => Ok(Vec::new()),
        TypedData::OutOfLine(addr) => {
            let bytes = map.read(addr, desc.length() as usize).map_err(|kr| {
                log::debug!("ipc_kmsg_copyin_body: port array at {:#x}: {:?}", addr, kr);
                MsgError::SendInvalidMemory
            })?;
            if bytes.len() < wanted {
                return Err(MsgError::SendInvalidMemory);
            }
            wide_port_names(abi, &bytes, count)
        }
    }
}

/// Decode `count` names from a buffer known to be long enough
fn wide_port_names(abi: MsgAbi, bytes: &[u8], count: usize) -> Result<Vec<MachPortName>, MsgError> {
    abi.read_port_names(bytes, count).ok_or_else(|| {
        log::debug!("ipc_kmsg_copyin_body: port array holds a value that is not a name");
        MsgError::SendInvalidRight
    })
}

/// `ipc_kmsg_copyin_body`: translate the body of a complex message
///
/// The header must already be copied in. On failure every right and region
/// taken so far is released, together with the header rights, and the body
/// is left in wire form. Sources marked for deallocation are unmapped only
/// once the whole body has been copied in.
pub fn ipc_kmsg_copyin_body(kmsg: &mut IpcKmsg, space: &IpcSpace, map: &VmMap) -> Result<(), MsgError> {
    let abi = kmsg.abi();
    let wire = match core::mem::replace(&mut kmsg.body, KmsgBody::Wire(Vec::new())) {
        KmsgBody::Wire(wire) => wire,
        body => {
            // already in kernel form
            kmsg.body = body;
            return Ok(());
        }
    };
    let dest = kmsg.destination().cloned();

    let mut done: Vec<KmsgElement> = Vec::new();
    let mut sources: Vec<(u64, u64)> = Vec::new();
    let mut complex = false;
    let mut circular = false;

    let result = (|| -> Result<(), (MsgError, Option<(MachMsgTypeName, Vec<IpcObject>)>)> {
        for item in TypeCursor::new(abi, &wire) {
            let item = item.map_err(|e| (MsgError::from(e), None))?;
            let mut desc = item.desc;
            let length = desc.length();

            if let TypedData::OutOfLine(addr) = item.data {
                complex = true;
                if desc.deallocate && length != 0 {
                    sources.push((addr, length));
                }
            }

            if desc.is_port() {
                complex = true;
                let disposition = PortDisposition::from_raw(desc.name).ok_or((MsgError::SendInvalidType, None))?;
                let charge = match item.data {
                    TypedData::OutOfLine(_) if length != 0 => Some(
                        space
                            .heap()
                            .kalloc(length as usize)
                            .ok_or((MsgError::SendInvalidMemory, None))?,
                    ),
                    _ => None,
                };
                let names = element_port_names(abi, map, &desc, item.data).map_err(|mr| (mr, None))?;

                let msgt_name = disposition.copyin_type();
                let mut objects = Vec::with_capacity(names.len());
                for name in names {
                    let object = match IpcObject::from_name(name) {
                        Some(sentinel) => sentinel,
                        None => match ipc_object_copyin(space, name, disposition) {
                            Ok(object) => object,
                            Err(kr) => {
                                log::debug!("ipc_kmsg_copyin_body: {:#x} as {:?}: {:?}", name, disposition, kr);
                                return Err((MsgError::SendInvalidRight, Some((msgt_name, objects))));
                            }
                        },
                    };
                    if msgt_name == MACH_MSG_TYPE_PORT_RECEIVE {
                        if let (Some(port), Some(dest)) = (object.port(), &dest) {
                            if ipc_port_check_circularity(port, dest) {
                                circular = true;
                            }
                        }
                    }
                    objects.push(object);
                }

                desc.name = msgt_name;
                done.push(KmsgElement {
                    desc,
                    data: KmsgData::Ports {
                        objects,
                        out_of_line: !desc.inline,
                        charge,
                    },
                });
                continue;
            }

            let data = match item.data {
                TypedData::Inline(bytes) => KmsgData::Inline(bytes.to_vec()),
                TypedData::OutOfLine(_) if length == 0 => KmsgData::Memory(None),
                TypedData::OutOfLine(addr) => match map.copyin(addr, length as usize, false) {
                    Ok(copy) => KmsgData::Memory(Some(copy)),
                    Err(kr) => {
                        log::debug!("ipc_kmsg_copyin_body: region {:#x}+{}: {:?}", addr, length, kr);
                        return Err((MsgError::SendInvalidMemory, None));
                    }
                },
            };
            done.push(KmsgElement { desc, data });
        }
        Ok(())
    })();

    if let Err((mr, partial)) = result {
        let mut reap = IpcKmsgQueue::new();
        ipc_kmsg_clean_partial(kmsg, done, partial, &mut reap);
        ipc_kmsg_reap(&mut reap);
        kmsg.body = KmsgBody::Wire(wire);
        return Err(mr);
    }

    for (addr, length) in sources {
        if let Err(kr) = map.deallocate(addr, length) {
            log::warn!("ipc_kmsg_copyin_body: deallocate {:#x}+{}: {:?}", addr, length, kr);
        }
    }

    if circular {
        kmsg.header.bits.insert(MsgHeaderFlags::CIRCULAR);
    }
    if complex {
        kmsg.body = KmsgBody::Kernel(done);
    } else {
        kmsg.header.bits.remove(MsgHeaderFlags::COMPLEX);
        kmsg.body = KmsgBody::Wire(wire);
    }
    Ok(())
}

// ============================================================================
// Copyout
// ============================================================================

/// `ipc_kmsg_copyout_object`: name for one body right
///
/// Never fails outright: a port that died becomes `MACH_PORT_DEAD`, a right
/// the space cannot take is destroyed and becomes `MACH_PORT_NULL` with the
/// reason in the returned bits.
pub fn ipc_kmsg_copyout_object(
    space: &IpcSpace,
    object: IpcObject,
    msgt_name: MachMsgTypeName,
) -> (MachPortName, MsgSpecialBits) {
    let port = match object {
        IpcObject::Port(port) => port,
        sentinel => return (sentinel.sentinel_name().unwrap_or(MACH_PORT_NULL), MsgSpecialBits::empty()),
    };
    match ipc_object_copyout(space, port, msgt_name, true) {
        Ok(name) => (name, MsgSpecialBits::empty()),
        Err((kr, port)) => {
            ipc_object_destroy_now(IpcObject::Port(port), msgt_name);
            if kr == KernError::InvalidCapability {
                (MACH_PORT_DEAD, MsgSpecialBits::empty())
            } else {
                log::debug!("ipc_kmsg_copyout_object: {:?}", kr);
                (MACH_PORT_NULL, MsgSpecialBits::for_ipc(kr))
            }
        }
    }
}

/// Out-of-line port array image for `abi`
fn port_array(abi: MsgAbi, names: &[MachPortName]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(names.len() * abi.port_bits() as usize / 8);
    for &name in names {
        abi.put_port_name(&mut bytes, name);
    }
    bytes
}

/// Copy out one out-of-line port array
///
/// The region is allocated before any right is copied out, so a failed
/// allocation destroys the rights instead of leaving names nobody can find.
fn copyout_port_array(
    space: &IpcSpace,
    map: &VmMap,
    objects: Vec<IpcObject>,
    msgt_name: MachMsgTypeName,
) -> (u64, u32, MsgSpecialBits) {
    let abi = map.abi();
    let count = objects.len();
    if count == 0 {
        return (0, 0, MsgSpecialBits::empty());
    }
    let length = (count * abi.port_bits() as usize / 8) as u64;

    let addr = match map.allocate(length, true, 0) {
        Ok(addr) => addr,
        Err(kr) => {
            log::debug!("ipc_kmsg_copyout_body: port array of {}: {:?}", count, kr);
            let mut reap = IpcKmsgQueue::new();
            for object in objects {
                ipc_object_destroy(object, msgt_name, &mut reap);
            }
            ipc_kmsg_reap(&mut reap);
            return (0, 0, MsgSpecialBits::for_vm(kr));
        }
    };

    let mut bits = MsgSpecialBits::empty();
    let mut names = Vec::with_capacity(count);
    for object in objects {
        let (name, object_bits) = ipc_kmsg_copyout_object(space, object, msgt_name);
        bits |= object_bits;
        names.push(name);
    }
    if let Err(kr) = map.write(addr, &port_array(abi, &names)) {
        // Freshly allocated; only a concurrent deallocate gets here.
        log::warn!("ipc_kmsg_copyout_body: writing port array at {:#x}: {:?}", addr, kr);
        return (0, 0, bits | MsgSpecialBits::for_vm(kr));
    }
    (addr, count as u32, bits)
}

/// `ipc_kmsg_copyout_body`: give the receiver names and mappings for the
/// body, laid out in the receiver's format
///
/// Every element is attempted; the returned bits collect what failed.
pub fn ipc_kmsg_copyout_body(kmsg: &mut IpcKmsg, space: &IpcSpace, map: &VmMap) -> MsgSpecialBits {
    let abi = map.abi();
    let elements = match core::mem::replace(&mut kmsg.body, KmsgBody::Wire(Vec::new())) {
        KmsgBody::Kernel(elements) => elements,
        body => {
            kmsg.body = body;
            ipc_kmsg_transcode_body(kmsg, abi);
            return MsgSpecialBits::empty();
        }
    };

    let mut bits = MsgSpecialBits::empty();
    let mut out = MsgBodyBuilder::new(abi);
    for KmsgElement { desc, data } in elements {
        let mut desc = desc;
        desc.deallocate = !desc.inline;
        match data {
            KmsgData::Inline(bytes) => {
                out.put_type(&desc).put_inline(&bytes);
            }
            KmsgData::Ports {
                objects,
                out_of_line: false,
                ..
            } => {
                let mut names = Vec::with_capacity(objects.len());
                for object in objects {
                    let (name, object_bits) = ipc_kmsg_copyout_object(space, object, desc.name);
                    bits |= object_bits;
                    names.push(name);
                }
                desc.size = abi.port_bits();
                out.put_type(&desc).put_port_names(&names);
            }
            KmsgData::Ports { objects, .. } => {
                let (addr, number, element_bits) = copyout_port_array(space, map, objects, desc.name);
                bits |= element_bits;
                desc.size = abi.port_bits();
                desc.number = number;
                out.put_type(&desc).put_address(addr);
            }
            KmsgData::Memory(None) => {
                out.put_type(&desc).put_address(0);
            }
            KmsgData::Memory(Some(copy)) => {
                let size = copy.size();
                match map.copyout(copy) {
                    Ok(addr) => {
                        out.put_type(&desc).put_address(addr);
                    }
                    Err(kr) => {
                        log::debug!("ipc_kmsg_copyout_body: region of {}: {:?}", size, kr);
                        bits |= MsgSpecialBits::for_vm(kr);
                        desc.number = 0;
                        out.put_type(&desc).put_address(0);
                    }
                }
            }
        }
    }

    kmsg.body = KmsgBody::Wire(out.finish());
    kmsg.set_abi(abi);
    bits
}

// ============================================================================
// Clean / Re-encode
// ============================================================================

/// `ipc_kmsg_clean_body`: release the rights and regions of copied-in
/// elements
pub fn ipc_kmsg_clean_body(elements: Vec<KmsgElement>, reap: &mut IpcKmsgQueue) {
    for element in elements {
        if let KmsgData::Ports { objects, .. } = element.data {
            for object in objects {
                ipc_object_destroy(object, element.desc.name, reap);
            }
        }
        // Copy objects and port-array charges are released by drop.
    }
}

/// Wire image of copied-in elements without exposing kernel state
///
/// Port names read as null, out-of-line addresses as zero.
pub fn ipc_kmsg_scrub_body(abi: MsgAbi, elements: &[KmsgElement]) -> Vec<u8> {
    let mut out = MsgBodyBuilder::new(abi);
    for element in elements {
        let mut desc = element.desc;
        match &element.data {
            KmsgData::Inline(bytes) => {
                out.put_type(&desc).put_inline(bytes);
            }
            KmsgData::Ports {
                objects,
                out_of_line: false,
                ..
            } => {
                desc.size = abi.port_bits();
                out.put_type(&desc).put_port_names(&alloc::vec![MACH_PORT_NULL; objects.len()]);
            }
            KmsgData::Ports { .. } => {
                desc.size = abi.port_bits();
                out.put_type(&desc).put_address(0);
            }
            KmsgData::Memory(_) => {
                out.put_type(&desc).put_address(0);
            }
        }
    }
    out.finish()
}

/// Re-encode a wire body for another layout
///
/// Only simple bodies are re-encoded here; a body that does not walk
/// cleanly is passed through untouched.
pub fn ipc_kmsg_transcode_body(kmsg: &mut IpcKmsg, abi: MsgAbi) {
    let from = kmsg.abi();
    if from == abi {
        return;
    }
    let wire = match &kmsg.body {
        KmsgBody::Wire(wire) => wire,
        KmsgBody::Kernel(_) => return,
    };
    if wire.is_empty() {
        kmsg.set_abi(abi);
        return;
    }

    let mut out = MsgBodyBuilder::new(abi);
    for item in TypeCursor::new(from, wire) {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                log::debug!("ipc_kmsg_transcode_body: {:?} body left as is: {}", from, e);
                return;
            }
        };
        let mut desc = item.desc;
        match item.data {
            TypedData::Inline(bytes) if desc.is_port() => {
                let names = from.read_port_names(bytes, desc.number as usize).unwrap_or_default();
                desc.size = abi.port_bits();
                out.put_type(&desc).put_port_names(&names);
            }
            TypedData::Inline(bytes) => {
                out.put_type(&desc).put_inline(bytes);
            }
            TypedData::OutOfLine(addr) => {
                out.put_type(&desc).put_address(addr);
            }
        }
    }
    kmsg.body = KmsgBody::Wire(out.finish());
    kmsg.set_abi(abi);
}
