//! Kernel Return Codes
//!
//! Based on Mach4 mach/kern_return.h
//!
//! The black-box services the message engine leans on (rights, objects,
//! VM maps, the kernel heap) report failure with these codes. The engine
//! folds them into the `mach_msg_return_t` vocabulary of `ipc::mach_msg`.

use thiserror::Error;

/// Raw `kern_return_t` value
pub type KernReturn = i32;

pub const KERN_SUCCESS: KernReturn = 0;
pub const KERN_INVALID_ADDRESS: KernReturn = 1;
pub const KERN_PROTECTION_FAILURE: KernReturn = 2;
pub const KERN_NO_SPACE: KernReturn = 3;
pub const KERN_INVALID_ARGUMENT: KernReturn = 4;
pub const KERN_FAILURE: KernReturn = 5;
pub const KERN_RESOURCE_SHORTAGE: KernReturn = 6;
pub const KERN_INVALID_NAME: KernReturn = 15;
pub const KERN_INVALID_TASK: KernReturn = 16;
pub const KERN_INVALID_RIGHT: KernReturn = 17;
pub const KERN_INVALID_VALUE: KernReturn = 18;
pub const KERN_UREFS_OVERFLOW: KernReturn = 19;
pub const KERN_INVALID_CAPABILITY: KernReturn = 20;
pub const KERN_NAME_EXISTS: KernReturn = 24;

/// Failure reported by a kernel service
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernError {
    #[error("invalid address")]
    InvalidAddress,

    #[error("protection failure")]
    ProtectionFailure,

    #[error("no space")]
    NoSpace,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("operation failed")]
    Failure,

    #[error("resource shortage")]
    ResourceShortage,

    #[error("invalid name")]
    InvalidName,

    #[error("invalid task")]
    InvalidTask,

    #[error("invalid right")]
    InvalidRight,

    #[error("invalid value")]
    InvalidValue,

    #[error("user reference count overflow")]
    UrefsOverflow,

    #[error("invalid capability")]
    InvalidCapability,

    #[error("name exists")]
    NameExists,
}

impl KernError {
    /// The raw `kern_return_t` for this error
    pub const fn code(self) -> KernReturn {
        match self {
            Self::InvalidAddress => KERN_INVALID_ADDRESS,
            Self::ProtectionFailure => KERN_PROTECTION_FAILURE,
            Self::NoSpace => KERN_NO_SPACE,
            Self::InvalidArgument => KERN_INVALID_ARGUMENT,
            Self::Failure => KERN_FAILURE,
            Self::ResourceShortage => KERN_RESOURCE_SHORTAGE,
            Self::InvalidName => KERN_INVALID_NAME,
            Self::InvalidTask => KERN_INVALID_TASK,
            Self::InvalidRight => KERN_INVALID_RIGHT,
            Self::InvalidValue => KERN_INVALID_VALUE,
            Self::UrefsOverflow => KERN_UREFS_OVERFLOW,
            Self::InvalidCapability => KERN_INVALID_CAPABILITY,
            Self::NameExists => KERN_NAME_EXISTS,
        }
    }
}

/// Result type for kernel services
pub type KernResult<T> = Result<T, KernError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(KernError::NoSpace.code(), 3);
        assert_eq!(KernError::ResourceShortage.code(), 6);
        assert_eq!(KernError::InvalidCapability.code(), 20);
    }
}
