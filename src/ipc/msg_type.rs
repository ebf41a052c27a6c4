//! Message Body Types and Layout
//!
//! Based on Mach4 mach/message.h (mach_msg_type_t, mach_msg_type_long_t)
//!
//! A message body is a sequence of typed elements. Each element starts with
//! a type descriptor saying what the data is (`name`), how wide one unit is
//! (`size`, in bits), how many units there are (`number`), and whether the
//! data follows inline or sits out of line behind a pointer. The narrow
//! descriptor packs all of that in one word; when a field does not fit, the
//! long form appends full-width fields after a zeroed narrow word.
//!
//! Two user layouts are supported. The 32-bit layout packs the descriptor
//! into 4 bytes and aligns everything to 4; the 64-bit layout uses a
//! second word for `number` and aligns to 8. `TypeCursor` walks either.

use alloc::vec::Vec;

use thiserror::Error;

use super::entry::{MachPortName, MACH_PORT_DEAD};
use super::mach_msg::{msgt_is_port, MachMsgTypeName, MsgError};

// ============================================================================
// Message ABI
// ============================================================================

/// User message layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgAbi {
    /// 32-bit tasks
    I386,
    /// 64-bit tasks
    X86_64,
}

impl MsgAbi {
    /// Layout matching the kernel's own pointer width
    pub const fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::X86_64
        } else {
            Self::I386
        }
    }

    /// Alignment unit of headers, descriptors and inline data
    pub const fn align(self) -> usize {
        match self {
            Self::I386 => 4,
            Self::X86_64 => 8,
        }
    }

    /// Size of `mach_msg_header_t`
    pub const fn header_size(self) -> usize {
        match self {
            Self::I386 => 24,
            Self::X86_64 => 32,
        }
    }

    /// Size of `mach_msg_type_t`
    pub const fn type_size(self) -> usize {
        match self {
            Self::I386 => 4,
            Self::X86_64 => 8,
        }
    }

    /// Size of `mach_msg_type_long_t`
    pub const fn type_long_size(self) -> usize {
        match self {
            Self::I386 => 12,
            Self::X86_64 => 16,
        }
    }

    /// Size of a pointer (out-of-line address slot, header port field)
    pub const fn pointer_size(self) -> usize {
        match self {
            Self::I386 => 4,
            Self::X86_64 => 8,
        }
    }

    /// Width of a port in a port element, in bits
    pub const fn port_bits(self) -> u32 {
        (self.pointer_size() * 8) as u32
    }

    /// Largest `size` a narrow descriptor can hold
    pub const fn max_narrow_size(self) -> u32 {
        match self {
            Self::I386 => 0xff,
            Self::X86_64 => 0xffff,
        }
    }

    /// Largest `number` a narrow descriptor can hold
    pub const fn max_narrow_number(self) -> u32 {
        match self {
            Self::I386 => 0xfff,
            Self::X86_64 => u32::MAX,
        }
    }

    /// Top of the user address range
    pub const fn max_user_address(self) -> u64 {
        match self {
            Self::I386 => 0xc000_0000,
            Self::X86_64 => 0x0000_7fff_ffff_f000,
        }
    }

    /// Round up to the alignment unit
    #[inline]
    pub const fn round(self, n: usize) -> usize {
        let a = self.align();
        (n + a - 1) & !(a - 1)
    }

    /// Whether `n` is a multiple of the alignment unit
    #[inline]
    pub const fn is_aligned(self, n: usize) -> bool {
        n & (self.align() - 1) == 0
    }

    /// Read a pointer-sized value
    pub fn read_pointer(self, buf: &[u8], off: usize) -> Option<u64> {
        match self {
            Self::I386 => read_u32(buf, off).map(u64::from),
            Self::X86_64 => read_u64(buf, off),
        }
    }

    /// Append a pointer-sized value
    pub fn put_pointer(self, buf: &mut Vec<u8>, value: u64) {
        match self {
            Self::I386 => buf.extend_from_slice(&(value as u32).to_le_bytes()),
            Self::X86_64 => buf.extend_from_slice(&value.to_le_bytes()),
        }
    }

    /// Read a port name stored in a pointer-sized slot
    ///
    /// `None` when the slot is short or holds a 64-bit value that is not a
    /// name (see `narrow_port_name`).
    pub fn read_port_name(self, buf: &[u8], off: usize) -> Option<MachPortName> {
        match self {
            Self::I386 => read_u32(buf, off),
            Self::X86_64 => read_u64(buf, off).and_then(narrow_port_name),
        }
    }

    /// Append a port name in a pointer-sized slot
    pub fn put_port_name(self, buf: &mut Vec<u8>, name: MachPortName) {
        match self {
            Self::I386 => buf.extend_from_slice(&name.to_le_bytes()),
            Self::X86_64 => {
                let wide = if name == MACH_PORT_DEAD {
                    u64::MAX
                } else {
                    u64::from(name)
                };
                buf.extend_from_slice(&wide.to_le_bytes());
            }
        }
    }

    /// Decode an array of port names
    pub fn read_port_names(self, buf: &[u8], count: usize) -> Option<Vec<MachPortName>> {
        (0..count)
            .map(|i| self.read_port_name(buf, i * self.pointer_size()))
            .collect()
    }
}

/// A port name from a 64-bit slot
///
/// All ones is `MACH_PORT_DEAD`. Any other value with high bits set is not
/// a name.
#[inline]
pub fn narrow_port_name(wide: u64) -> Option<MachPortName> {
    if wide == u64::MAX {
        Some(MACH_PORT_DEAD)
    } else {
        u32::try_from(wide).ok()
    }
}

/// Read a little-endian u32
#[inline]
pub fn read_u32(buf: &[u8], off: usize) -> Option<u32> {
    let bytes = buf.get(off..off.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a little-endian u16
#[inline]
pub fn read_u16(buf: &[u8], off: usize) -> Option<u16> {
    let bytes = buf.get(off..off.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a little-endian u64
#[inline]
pub fn read_u64(buf: &[u8], off: usize) -> Option<u64> {
    let bytes = buf.get(off..off.checked_add(8)?)?;
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    Some(u64::from_le_bytes(word))
}

// ============================================================================
// Type Descriptor
// ============================================================================

// i386 narrow word
const I386_NAME_MASK: u32 = 0x0000_00ff;
const I386_SIZE_SHIFT: u32 = 8;
const I386_SIZE_MASK: u32 = 0xff;
const I386_NUMBER_SHIFT: u32 = 16;
const I386_NUMBER_MASK: u32 = 0xfff;
const I386_INLINE: u32 = 1 << 28;
const I386_LONGFORM: u32 = 1 << 29;
const I386_DEALLOCATE: u32 = 1 << 30;
const I386_UNUSED: u32 = 1 << 31;

// x86_64 narrow word (number lives in the second word)
const X86_64_SIZE_SHIFT: u32 = 8;
const X86_64_SIZE_MASK: u32 = 0xffff;
const X86_64_UNUSED: u32 = 0x1f << 24;
const X86_64_INLINE: u32 = 1 << 29;
const X86_64_LONGFORM: u32 = 1 << 30;
const X86_64_DEALLOCATE: u32 = 1 << 31;

/// A decoded type descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgTypeDesc {
    /// What the data is
    pub name: MachMsgTypeName,
    /// Bits per unit
    pub size: u32,
    /// Unit count
    pub number: u32,
    /// Data follows the descriptor
    pub inline: bool,
    /// Descriptor uses the long form
    pub longform: bool,
    /// Out-of-line source should be deallocated
    pub deallocate: bool,
}

impl MsgTypeDesc {
    /// An inline element
    pub fn inline(name: MachMsgTypeName, size: u32, number: u32) -> Self {
        Self {
            name,
            size,
            number,
            inline: true,
            ..Self::default()
        }
    }

    /// An out-of-line element
    pub fn out_of_line(name: MachMsgTypeName, size: u32, number: u32, deallocate: bool) -> Self {
        Self {
            name,
            size,
            number,
            deallocate,
            ..Self::default()
        }
    }

    /// Force the long form
    pub fn long(mut self) -> Self {
        self.longform = true;
        self
    }

    /// Data length in bytes: `ceil(number * size / 8)`
    pub fn length(&self) -> u64 {
        (u64::from(self.number) * u64::from(self.size) + 7) >> 3
    }

    /// Whether this element carries port rights
    pub fn is_port(&self) -> bool {
        msgt_is_port(self.name)
    }

    /// Whether the narrow form of `abi` can represent this descriptor
    pub fn fits_narrow(&self, abi: MsgAbi) -> bool {
        self.name <= 0xff && self.size <= abi.max_narrow_size() && self.number <= abi.max_narrow_number()
    }

    /// Encoded size of this descriptor under `abi`
    pub fn encoded_size(&self, abi: MsgAbi) -> usize {
        if self.longform || !self.fits_narrow(abi) {
            abi.type_long_size()
        } else {
            abi.type_size()
        }
    }

    /// Decode the descriptor at `off`
    ///
    /// Returns the descriptor and its encoded size. Structural checks on
    /// the decoded fields are left to the walker.
    pub fn decode(abi: MsgAbi, buf: &[u8], off: usize) -> Result<(Self, RawTypeBits), WalkError> {
        let remaining = buf.len().saturating_sub(off);
        if remaining < abi.type_size() {
            return Err(WalkError::TooSmall);
        }
        let word = read_u32(buf, off).ok_or(WalkError::TooSmall)?;

        let (mut desc, raw) = match abi {
            MsgAbi::I386 => {
                let desc = Self {
                    name: word & I386_NAME_MASK,
                    size: (word >> I386_SIZE_SHIFT) & I386_SIZE_MASK,
                    number: (word >> I386_NUMBER_SHIFT) & I386_NUMBER_MASK,
                    inline: word & I386_INLINE != 0,
                    longform: word & I386_LONGFORM != 0,
                    deallocate: word & I386_DEALLOCATE != 0,
                };
                (desc, RawTypeBits { unused: word & I386_UNUSED != 0, header_fields: 0 })
            }
            MsgAbi::X86_64 => {
                let number = read_u32(buf, off + 4).ok_or(WalkError::TooSmall)?;
                let desc = Self {
                    name: word & 0xff,
                    size: (word >> X86_64_SIZE_SHIFT) & X86_64_SIZE_MASK,
                    number,
                    inline: word & X86_64_INLINE != 0,
                    longform: word & X86_64_LONGFORM != 0,
                    deallocate: word & X86_64_DEALLOCATE != 0,
                };
                (desc, RawTypeBits { unused: word & X86_64_UNUSED != 0, header_fields: 0 })
            }
        };

        if !desc.longform {
            return Ok((desc, raw));
        }

        if remaining < abi.type_long_size() {
            return Err(WalkError::TooSmall);
        }
        let base = off + abi.type_size();
        let header_fields = desc.name | desc.size | desc.number;
        desc.name = u32::from(read_u16(buf, base).ok_or(WalkError::TooSmall)?);
        desc.size = u32::from(read_u16(buf, base + 2).ok_or(WalkError::TooSmall)?);
        desc.number = read_u32(buf, base + 4).ok_or(WalkError::TooSmall)?;
        Ok((desc, RawTypeBits { unused: raw.unused, header_fields }))
    }

    /// Append the encoded descriptor, choosing the long form when needed
    pub fn encode(&self, abi: MsgAbi, buf: &mut Vec<u8>) {
        let longform = self.longform || !self.fits_narrow(abi);
        let (name, size, number) = if longform {
            (0, 0, 0)
        } else {
            (self.name, self.size, self.number)
        };
        match abi {
            MsgAbi::I386 => {
                let mut word = name | (size << I386_SIZE_SHIFT) | (number << I386_NUMBER_SHIFT);
                if self.inline {
                    word |= I386_INLINE;
                }
                if longform {
                    word |= I386_LONGFORM;
                }
                if self.deallocate {
                    word |= I386_DEALLOCATE;
                }
                buf.extend_from_slice(&word.to_le_bytes());
            }
            MsgAbi::X86_64 => {
                let mut word = name | (size << X86_64_SIZE_SHIFT);
                if self.inline {
                    word |= X86_64_INLINE;
                }
                if longform {
                    word |= X86_64_LONGFORM;
                }
                if self.deallocate {
                    word |= X86_64_DEALLOCATE;
                }
                buf.extend_from_slice(&word.to_le_bytes());
                buf.extend_from_slice(&number.to_le_bytes());
            }
        }
        if longform {
            buf.extend_from_slice(&(self.name as u16).to_le_bytes());
            buf.extend_from_slice(&(self.size as u16).to_le_bytes());
            buf.extend_from_slice(&self.number.to_le_bytes());
        }
    }
}

/// Descriptor bits that must be zero in a well-formed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawTypeBits {
    /// `msgt_unused` was set
    pub unused: bool,
    /// Long form: OR of the narrow word's name, size and number
    pub header_fields: u32,
}

// ============================================================================
// Walker
// ============================================================================

/// Malformed body
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkError {
    /// Descriptor or data runs past the end of the body
    #[error("body element runs past the end of the message")]
    TooSmall,

    /// Descriptor fields are inconsistent
    #[error("malformed body element descriptor")]
    InvalidType,
}

impl From<WalkError> for MsgError {
    fn from(e: WalkError) -> Self {
        match e {
            WalkError::TooSmall => MsgError::SendMsgTooSmall,
            WalkError::InvalidType => MsgError::SendInvalidType,
        }
    }
}

/// Where an element's data lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedData<'a> {
    /// Exactly `length` bytes following the descriptor
    Inline(&'a [u8]),
    /// Address of the out-of-line region
    OutOfLine(u64),
}

/// One element produced by `TypeCursor`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedItem<'a> {
    /// Offset of the descriptor in the body
    pub offset: usize,
    /// Offset just past the element (aligned)
    pub end: usize,
    /// Decoded descriptor
    pub desc: MsgTypeDesc,
    /// The data
    pub data: TypedData<'a>,
}

/// Cursor over the typed elements of a message body
///
/// Yields each element in order, stopping after the first malformed one.
#[derive(Debug, Clone)]
pub struct TypeCursor<'a> {
    abi: MsgAbi,
    buf: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> TypeCursor<'a> {
    /// Walk `body`, which begins at the first descriptor
    pub fn new(abi: MsgAbi, body: &'a [u8]) -> Self {
        Self {
            abi,
            buf: body,
            pos: 0,
            done: false,
        }
    }

    /// Current offset
    pub fn position(&self) -> usize {
        self.pos
    }

    fn step(&mut self) -> Result<TypedItem<'a>, WalkError> {
        let abi = self.abi;
        let offset = self.pos;
        let (desc, raw) = MsgTypeDesc::decode(abi, self.buf, offset)?;

        if (desc.is_port() && desc.size != abi.port_bits())
            || (desc.longform && raw.header_fields != 0)
            || raw.unused
            || (desc.deallocate && desc.inline)
        {
            return Err(WalkError::InvalidType);
        }

        let mut pos = offset
            + if desc.longform {
                abi.type_long_size()
            } else {
                abi.type_size()
            };
        let remaining = (self.buf.len() - pos) as u64;

        let data = if desc.inline {
            let length = desc.length();
            if remaining < length {
                return Err(WalkError::TooSmall);
            }
            let length = length as usize;
            let data = &self.buf[pos..pos + length];
            pos = abi.round(pos + length).min(self.buf.len());
            TypedData::Inline(data)
        } else {
            if remaining < abi.pointer_size() as u64 {
                return Err(WalkError::TooSmall);
            }
            let addr = abi.read_pointer(self.buf, pos).ok_or(WalkError::TooSmall)?;
            pos += abi.pointer_size();
            TypedData::OutOfLine(addr)
        };

        self.pos = pos;
        Ok(TypedItem {
            offset,
            end: pos,
            desc,
            data,
        })
    }
}

impl<'a> Iterator for TypeCursor<'a> {
    type Item = Result<TypedItem<'a>, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.buf.len() {
            return None;
        }
        let item = self.step();
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}

// ============================================================================
// Body Builder
// ============================================================================

/// Encoder for message bodies
///
/// Used by copyout to lay a body out for the receiver, and by anything
/// that needs to compose a user message.
#[derive(Debug, Clone)]
pub struct MsgBodyBuilder {
    abi: MsgAbi,
    buf: Vec<u8>,
}

impl MsgBodyBuilder {
    pub fn new(abi: MsgAbi) -> Self {
        Self {
            abi,
            buf: Vec::new(),
        }
    }

    pub fn abi(&self) -> MsgAbi {
        self.abi
    }

    /// Append a descriptor
    pub fn put_type(&mut self, desc: &MsgTypeDesc) -> &mut Self {
        desc.encode(self.abi, &mut self.buf);
        self
    }

    /// Append inline data, padded to the alignment unit
    pub fn put_inline(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self.pad();
        self
    }

    /// Append an out-of-line address slot
    pub fn put_address(&mut self, addr: u64) -> &mut Self {
        self.abi.put_pointer(&mut self.buf, addr);
        self
    }

    /// Append inline port names, padded
    pub fn put_port_names(&mut self, names: &[MachPortName]) -> &mut Self {
        for &name in names {
            self.abi.put_port_name(&mut self.buf, name);
        }
        self.pad();
        self
    }

    /// An inline data element
    pub fn inline_data(&mut self, name: MachMsgTypeName, size: u32, number: u32, bytes: &[u8]) -> &mut Self {
        self.put_type(&MsgTypeDesc::inline(name, size, number)).put_inline(bytes)
    }

    /// An inline port element
    pub fn inline_ports(&mut self, disposition: MachMsgTypeName, names: &[MachPortName]) -> &mut Self {
        let desc = MsgTypeDesc::inline(disposition, self.abi.port_bits(), names.len() as u32);
        self.put_type(&desc).put_port_names(names)
    }

    /// An out-of-line element
    pub fn out_of_line(
        &mut self,
        name: MachMsgTypeName,
        size: u32,
        number: u32,
        addr: u64,
        deallocate: bool,
    ) -> &mut Self {
        self.put_type(&MsgTypeDesc::out_of_line(name, size, number, deallocate))
            .put_address(addr)
    }

    /// An out-of-line port array element
    pub fn out_of_line_ports(
        &mut self,
        disposition: MachMsgTypeName,
        number: u32,
        addr: u64,
        deallocate: bool,
    ) -> &mut Self {
        let size = self.abi.port_bits();
        self.out_of_line(disposition, size, number, addr, deallocate)
    }

    fn pad(&mut self) {
        let len = self.abi.round(self.buf.len());
        self.buf.resize(len, 0);
    }

    /// Encoded length so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish, returning the body bytes
    pub fn finish(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::mach_msg::{MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_INTEGER_32, MACH_MSG_TYPE_BYTE};

    fn walk(abi: MsgAbi, body: &[u8]) -> Vec<Result<TypedItem<'_>, WalkError>> {
        TypeCursor::new(abi, body).collect()
    }

    #[test]
    fn test_i386_narrow_layout() {
        let mut b = MsgBodyBuilder::new(MsgAbi::I386);
        b.inline_data(MACH_MSG_TYPE_INTEGER_32, 32, 1, &0xCAFEBABEu32.to_le_bytes());
        let body = b.finish();
        // name=2 size=32 number=1 inline
        assert_eq!(read_u32(&body, 0), Some(2 | (32 << 8) | (1 << 16) | (1 << 28)));
        assert_eq!(body.len(), 8);

        let items = walk(MsgAbi::I386, &body);
        assert_eq!(items.len(), 1);
        let item = items[0].unwrap();
        assert_eq!(item.desc, MsgTypeDesc::inline(2, 32, 1));
        assert_eq!(item.data, TypedData::Inline(&0xCAFEBABEu32.to_le_bytes()[..]));
        assert_eq!(item.end, 8);
    }

    #[test]
    fn test_x86_64_layout_and_padding() {
        let mut b = MsgBodyBuilder::new(MsgAbi::X86_64);
        b.inline_data(MACH_MSG_TYPE_BYTE, 8, 3, b"abc")
            .out_of_line(MACH_MSG_TYPE_BYTE, 8, 4096, 0x1000, true);
        let body = b.finish();
        assert_eq!(body.len(), 8 + 8 + 8 + 8);

        let items: Vec<_> = walk(MsgAbi::X86_64, &body).into_iter().map(|i| i.unwrap()).collect();
        assert_eq!(items[0].data, TypedData::Inline(&b"abc"[..]));
        assert_eq!(items[1].offset, 16);
        assert_eq!(items[1].data, TypedData::OutOfLine(0x1000));
        assert!(items[1].desc.deallocate);
    }

    #[test]
    fn test_longform_selected_when_needed() {
        let desc = MsgTypeDesc::inline(MACH_MSG_TYPE_BYTE, 8, 5000);
        assert!(!desc.fits_narrow(MsgAbi::I386));
        assert!(desc.fits_narrow(MsgAbi::X86_64));

        let mut b = MsgBodyBuilder::new(MsgAbi::I386);
        b.put_type(&desc).put_inline(&[0u8; 5000]);
        let body = b.finish();
        assert_eq!(body.len(), 12 + 5000);
        let item = walk(MsgAbi::I386, &body)[0].unwrap();
        assert!(item.desc.longform);
        assert_eq!(item.desc.number, 5000);
    }

    #[test]
    fn test_port_size_must_match() {
        let mut b = MsgBodyBuilder::new(MsgAbi::X86_64);
        b.put_type(&MsgTypeDesc::inline(MACH_MSG_TYPE_COPY_SEND, 32, 1)).put_inline(&[0; 4]);
        let body = b.finish();
        assert_eq!(walk(MsgAbi::X86_64, &body)[0], Err(WalkError::InvalidType));
    }

    #[test]
    fn test_deallocate_inline_rejected() {
        let mut desc = MsgTypeDesc::inline(MACH_MSG_TYPE_BYTE, 8, 4);
        desc.deallocate = true;
        let mut b = MsgBodyBuilder::new(MsgAbi::I386);
        b.put_type(&desc).put_inline(&[0; 4]);
        assert_eq!(walk(MsgAbi::I386, &b.finish())[0], Err(WalkError::InvalidType));
    }

    #[test]
    fn test_unused_and_longform_header_bits() {
        let word: u32 = 9 | (8 << 8) | (4 << 16) | (1 << 28) | (1 << 31);
        let mut body = word.to_le_bytes().to_vec();
        body.extend_from_slice(&[0; 4]);
        assert_eq!(walk(MsgAbi::I386, &body)[0], Err(WalkError::InvalidType));

        // long form with a non-zero narrow name
        let word: u32 = 9 | (1 << 28) | (1 << 29);
        let mut body = word.to_le_bytes().to_vec();
        body.extend_from_slice(&9u16.to_le_bytes());
        body.extend_from_slice(&8u16.to_le_bytes());
        body.extend_from_slice(&4u32.to_le_bytes());
        body.extend_from_slice(&[0; 4]);
        assert_eq!(walk(MsgAbi::I386, &body)[0], Err(WalkError::InvalidType));
    }

    #[test]
    fn test_truncation() {
        let mut b = MsgBodyBuilder::new(MsgAbi::I386);
        b.inline_data(MACH_MSG_TYPE_BYTE, 8, 16, &[1; 16]);
        let body = b.finish();
        assert_eq!(walk(MsgAbi::I386, &body[..2])[0], Err(WalkError::TooSmall));
        assert_eq!(walk(MsgAbi::I386, &body[..12])[0], Err(WalkError::TooSmall));

        let mut b = MsgBodyBuilder::new(MsgAbi::X86_64);
        b.out_of_line(MACH_MSG_TYPE_BYTE, 8, 1, 0x2000, false);
        let body = b.finish();
        assert_eq!(walk(MsgAbi::X86_64, &body[..8])[0], Err(WalkError::TooSmall));
    }

    #[test]
    fn test_port_names_wide() {
        let mut buf = Vec::new();
        MsgAbi::X86_64.put_port_name(&mut buf, MACH_PORT_DEAD);
        MsgAbi::X86_64.put_port_name(&mut buf, 0x0100_0003);
        assert_eq!(read_u64(&buf, 0), Some(u64::MAX));
        assert_eq!(
            MsgAbi::X86_64.read_port_names(&buf, 2),
            Some(vec![MACH_PORT_DEAD, 0x0100_0003])
        );

        let mut buf = Vec::new();
        MsgAbi::X86_64.put_pointer(&mut buf, 0x0000_0001_0100_0003);
        assert_eq!(MsgAbi::X86_64.read_port_name(&buf, 0), None);
        assert_eq!(narrow_port_name(0xffff_ffff_0000_0000), None);
        assert_eq!(narrow_port_name(0xffff_ffff), Some(MACH_PORT_DEAD));
        assert_eq!(narrow_port_name(7), Some(7));
    }
}
