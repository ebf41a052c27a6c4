//! Kern subsystem - Core kernel primitives
//!
//! Based on Mach4 kern/ directory
//! Return codes, kernel heap accounting, per-processor state and event
//! counters used by the IPC layer.

pub mod counters;
pub mod kalloc;
pub mod kern_return;
pub mod processor;

pub use counters::{ipc_counters, IpcCounterSnapshot, MachCounter};
pub use kalloc::{Kalloc, KernelHeap};
pub use kern_return::{KernError, KernResult, KernReturn, KERN_SUCCESS};
pub use processor::Processor;
