//! Message printing for kernel debugging
//!
//! Based on Mach4 ipc/ipc_print.c
//!
//! Lines are formatted into fixed-size buffers and emitted through
//! `log::debug!`. A line that does not fit is cut short.

use alloc::vec::Vec;
use core::fmt::Write;

use heapless::String;

use super::kmsg::{IpcKmsg, KmsgBody, KmsgData, KmsgElement};
use super::mach_msg::*;
use super::msg_type::{MsgAbi, MsgTypeDesc, TypeCursor, TypedData};

/// Longest printed line
pub const PRINT_LINE_MAX: usize = 128;

/// A printed line
pub type PrintLine = String<PRINT_LINE_MAX>;

/// Inline bytes shown per element
const DATA_PREVIEW: usize = 16;

fn line(args: core::fmt::Arguments<'_>) -> PrintLine {
    let mut s = PrintLine::new();
    // Overflow truncates.
    let _ = s.write_fmt(args);
    s
}

/// Name of a message type
pub fn ipc_type_name(name: MachMsgTypeName) -> &'static str {
    match name {
        MACH_MSG_TYPE_BOOLEAN => "boolean",
        MACH_MSG_TYPE_INTEGER_16 => "short",
        MACH_MSG_TYPE_INTEGER_32 => "int32",
        MACH_MSG_TYPE_INTEGER_64 => "int64",
        MACH_MSG_TYPE_CHAR => "char",
        MACH_MSG_TYPE_BYTE => "byte",
        MACH_MSG_TYPE_REAL => "real",
        MACH_MSG_TYPE_STRING => "string",
        MACH_MSG_TYPE_PORT_NAME => "port_name",
        MACH_MSG_TYPE_MOVE_RECEIVE => "move_receive",
        MACH_MSG_TYPE_MOVE_SEND => "move_send",
        MACH_MSG_TYPE_MOVE_SEND_ONCE => "move_send_once",
        MACH_MSG_TYPE_COPY_SEND => "copy_send",
        MACH_MSG_TYPE_MAKE_SEND => "make_send",
        MACH_MSG_TYPE_MAKE_SEND_ONCE => "make_send_once",
        MACH_MSG_TYPE_PROTECTED_PAYLOAD => "protected_payload",
        _ => "unknown",
    }
}

fn print_bits(bits: MachMsgBits) -> PrintLine {
    line(format_args!(
        "  bits={:#010x} remote={} local={} flags={:?}",
        bits.0,
        ipc_type_name(bits.remote()),
        ipc_type_name(bits.local()),
        bits.flags()
    ))
}

fn print_desc(desc: &MsgTypeDesc) -> PrintLine {
    line(format_args!(
        "  type {} size={} number={}{}{}{}",
        ipc_type_name(desc.name),
        desc.size,
        desc.number,
        if desc.inline { " inline" } else { " out-of-line" },
        if desc.longform { " long" } else { "" },
        if desc.deallocate { " dealloc" } else { "" }
    ))
}

fn print_inline(bytes: &[u8]) -> PrintLine {
    let mut s = line(format_args!("    data[{}]:", bytes.len()));
    for b in bytes.iter().take(DATA_PREVIEW) {
        let _ = write!(s, " {:02x}", b);
    }
    if bytes.len() > DATA_PREVIEW {
        let _ = s.push_str(" ...");
    }
    s
}

/// Lines for a body still in wire form
fn format_wire_body(abi: MsgAbi, body: &[u8], out: &mut Vec<PrintLine>) {
    for item in TypeCursor::new(abi, body) {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                out.push(line(format_args!("  malformed body: {:?}", e)));
                return;
            }
        };
        out.push(print_desc(&item.desc));
        match item.data {
            TypedData::Inline(bytes) if item.desc.is_port() || item.desc.name == MACH_MSG_TYPE_PORT_NAME => {
                let names = abi.read_port_names(bytes, item.desc.number as usize).unwrap_or_default();
                out.push(line(format_args!("    names {:x?}", names)));
            }
            TypedData::Inline(bytes) => out.push(print_inline(bytes)),
            TypedData::OutOfLine(addr) => out.push(line(format_args!("    address {:#x}", addr))),
        }
    }
}

/// Lines for a copied-in body
fn format_kernel_body(elements: &[KmsgElement], out: &mut Vec<PrintLine>) {
    for element in elements {
        out.push(print_desc(&element.desc));
        out.push(match &element.data {
            KmsgData::Inline(bytes) => print_inline(bytes),
            KmsgData::Ports { objects, .. } => line(format_args!("    rights {:?}", objects)),
            KmsgData::Memory(Some(copy)) => line(format_args!("    copy of {} bytes", copy.size())),
            KmsgData::Memory(None) => line(format_args!("    empty region")),
        });
    }
}

/// Lines describing a kmsg
pub fn ipc_kmsg_format(kmsg: &IpcKmsg) -> Vec<PrintLine> {
    let h = &kmsg.header;
    let mut out = Vec::new();
    out.push(line(format_args!(
        "kmsg size={} id={} seqno={} abi={:?}",
        h.size,
        h.id,
        h.seqno,
        kmsg.abi()
    )));
    out.push(print_bits(h.bits));
    out.push(line(format_args!("  remote={:?}", h.remote)));
    out.push(line(format_args!("  local={:?}", h.local)));
    match &kmsg.body {
        KmsgBody::Wire(body) => format_wire_body(kmsg.abi(), body, &mut out),
        KmsgBody::Kernel(elements) => format_kernel_body(elements, &mut out),
    }
    out
}

/// Lines describing a user message laid out for `abi`
pub fn ipc_msg_format(abi: MsgAbi, msg: &[u8]) -> Vec<PrintLine> {
    let mut out = Vec::new();
    let header = match MachMsgHeader::decode(abi, msg) {
        Some(header) => header,
        None => {
            out.push(line(format_args!("msg truncated ({} bytes)", msg.len())));
            return out;
        }
    };
    out.push(line(format_args!(
        "msg size={} id={} seqno={}",
        header.msgh_size, header.msgh_id, header.msgh_seqno
    )));
    out.push(print_bits(header.msgh_bits));
    out.push(line(format_args!(
        "  remote={:#x} local={:#x}",
        header.msgh_remote_port, header.msgh_local_port
    )));
    let end = (header.msgh_size as usize).clamp(abi.header_size(), msg.len());
    format_wire_body(abi, &msg[abi.header_size()..end], &mut out);
    out
}

/// `ipc_kmsg_print`
pub fn ipc_kmsg_print(kmsg: &IpcKmsg) {
    for l in ipc_kmsg_format(kmsg) {
        log::debug!("{}", l);
    }
}

/// `ipc_msg_print`
pub fn ipc_msg_print(abi: MsgAbi, msg: &[u8]) {
    for l in ipc_msg_format(abi, msg) {
        log::debug!("{}", l);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::msg_type::MsgBodyBuilder;

    #[test]
    fn test_format_user_message() {
        let abi = MsgAbi::X86_64;
        let body = MsgBodyBuilder::new(abi)
            .inline_data(MACH_MSG_TYPE_INTEGER_32, 32, 1, &0xcafe_babe_u32.to_le_bytes())
            .inline_ports(MACH_MSG_TYPE_COPY_SEND, &[0x0100_0002])
            .out_of_line(MACH_MSG_TYPE_BYTE, 8, 4096, 0x10_0000, true)
            .finish();
        let mut header = MachMsgHeader::new(MachMsgBits::new(MACH_MSG_TYPE_COPY_SEND, 0), 0x0100_0001, 0, 77);
        header.msgh_bits.insert(MsgHeaderFlags::COMPLEX);
        let msg = header.encode_message(abi, &body);

        let lines = ipc_msg_format(abi, &msg);
        assert!(lines[0].contains("id=77"));
        assert!(lines[1].contains("remote=copy_send"));
        assert!(lines.iter().any(|l| l.contains("be ba fe ca")));
        assert!(lines.iter().any(|l| l.contains("names [1000002]")));
        assert!(lines.iter().any(|l| l.contains("out-of-line") && l.contains("dealloc")));
        assert!(lines.iter().any(|l| l.contains("address 0x100000")));
    }

    #[test]
    fn test_format_truncated() {
        let lines = ipc_msg_format(MsgAbi::I386, &[0; 8]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("msg truncated"));
    }

    #[test]
    fn test_long_data_is_cut() {
        let s = print_inline(&[0xab; 100]);
        assert!(s.ends_with("..."));
        assert!(s.len() < PRINT_LINE_MAX);
    }
}
