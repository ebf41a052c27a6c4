//! Mach_R kmsg - the Mach IPC kernel message engine
//!
//! Translates messages between the port names a task uses and the port
//! rights the kernel holds while a message is in transit: header and
//! body copyin on send, copyout on receive, and the cleanup paths for
//! messages that cannot be delivered.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Large enum variants are expected for IPC message body types
#![allow(clippy::large_enum_variant)]

extern crate alloc;

pub mod kern;

pub mod ipc;

// Mach VM subsystem
pub mod mach_vm;
