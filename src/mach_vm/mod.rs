//! Mach Virtual Memory Subsystem
//!
//! Based on Mach4 vm/ subsystem.
//! Only the task address map is modelled: the regions a message's
//! out-of-line data is copied from and into.

pub mod vm_map;

pub use vm_map::{round_page, trunc_page, VmMap, VmMapCopy, PAGE_SIZE};
