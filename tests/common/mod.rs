//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::sync::Arc;

use mach_kmsg::ipc::msg_type::{MsgAbi, TypeCursor, TypedItem};
use mach_kmsg::ipc::{mach_msg_receive, mach_msg_send, MachMsgHeader, MachPortName, MsgError};
use mach_kmsg::ipc::IpcSpace;
use mach_kmsg::kern::{KernelHeap, Processor};
use mach_kmsg::mach_vm::{VmMap, PAGE_SIZE};

/// Receive buffer size
pub const RCV_BUFFER: u64 = 4 * PAGE_SIZE;

/// A task: a port name space, an address map and a message buffer
pub struct Task {
    pub space: Arc<IpcSpace>,
    pub map: VmMap,
    pub buf: u64,
}

impl Task {
    pub fn new(abi: MsgAbi) -> Self {
        Self::with_map(VmMap::new(abi, KernelHeap::unlimited()))
    }

    /// A task whose map can hold only its message buffer plus
    /// `spare_pages` more pages
    pub fn with_spare_pages(abi: MsgAbi, spare_pages: u64) -> Self {
        Self::with_map(VmMap::with_limits(
            abi,
            KernelHeap::unlimited(),
            RCV_BUFFER + spare_pages * PAGE_SIZE,
        ))
    }

    fn with_map(map: VmMap) -> Self {
        let buf = map.allocate(RCV_BUFFER, true, 0).expect("message buffer");
        Self {
            space: IpcSpace::new(),
            map,
            buf,
        }
    }

    pub fn abi(&self) -> MsgAbi {
        self.map.abi()
    }

    /// Send `header` and `body` from this task
    pub fn send(&self, cpu: &mut Processor, header: MachMsgHeader, body: &[u8]) -> Result<(), MsgError> {
        let size = self.stage(header, body);
        mach_msg_send(cpu, &self.space, &self.map, self.buf, size, 0)
    }

    /// Write a message into the buffer, returning its size
    pub fn stage(&self, header: MachMsgHeader, body: &[u8]) -> usize {
        let bytes = header.encode_message(self.abi(), body);
        self.map.write(self.buf, &bytes).expect("stage message");
        bytes.len()
    }

    /// Receive on `name`; the message is returned even on a body error
    pub fn receive(&self, cpu: &mut Processor, name: MachPortName) -> (Result<(), MsgError>, Received) {
        let result = mach_msg_receive(cpu, &self.space, &self.map, name, self.buf, 0);
        (result, self.received())
    }

    /// The message last written to the buffer
    pub fn received(&self) -> Received {
        let abi = self.abi();
        let head = self.map.read(self.buf, abi.header_size()).expect("read header");
        let header = MachMsgHeader::decode(abi, &head).expect("decode header");
        let bytes = self.map.read(self.buf, header.msgh_size as usize).expect("read message");
        Received {
            abi,
            header,
            body: bytes[abi.header_size()..].to_vec(),
        }
    }
}

/// A message as the receiver sees it
pub struct Received {
    pub abi: MsgAbi,
    pub header: MachMsgHeader,
    pub body: Vec<u8>,
}

impl Received {
    pub fn items(&self) -> Vec<TypedItem<'_>> {
        TypeCursor::new(self.abi, &self.body)
            .collect::<Result<Vec<_>, _>>()
            .expect("well-formed body")
    }
}

pub fn cpu() -> Processor {
    Processor::new(0, KernelHeap::unlimited())
}
