//! Virtual device pointers
//!
//! A [`VirtualPtr`] is not an address. It packs the owning device ordinal,
//! an allocation index into that device's table, and a byte offset into one
//! opaque 64-bit handle; the real device address behind it may not even be
//! known yet when the handle is handed out. Index 0 is reserved, so the
//! all-zero handle doubles as the null pointer.

use std::fmt;

use pulse_transport::layout;

/// Number of usable allocation indices per context (index 0 is reserved)
pub const INDEX_CAPACITY: u32 = (1 << layout::INDEX_BITS) - 1;

/// Largest representable byte offset
pub const MAX_OFFSET: u64 = layout::OFFSET_MASK;

/// Opaque handle to (a byte range within) one device allocation
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualPtr(u64);

impl VirtualPtr {
    /// The null pointer: device 0, index 0, offset 0
    pub const NULL: VirtualPtr = VirtualPtr(0);

    /// Pack a handle from its three fields
    ///
    /// Offsets wider than [`MAX_OFFSET`] are truncated to the field width,
    /// which matches what the device-side directory would see on the wire.
    #[inline]
    pub const fn encode(device: u8, index: u16, offset: u64) -> Self {
        Self(layout::pack(device, index, offset))
    }

    /// Reinterpret a raw wire value
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw wire value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Owning device ordinal
    #[inline]
    pub const fn device(self) -> u8 {
        layout::device(self.0)
    }

    /// Allocation index within the owning context's table
    #[inline]
    pub const fn index(self) -> u16 {
        layout::index(self.0)
    }

    /// Byte offset into the allocation
    #[inline]
    pub const fn offset(self) -> u64 {
        layout::offset(self.0)
    }

    /// The allocation's primary handle: same device and index, offset zero
    #[inline]
    pub const fn base(self) -> Self {
        Self(layout::base(self.0))
    }

    /// Whether this is the reserved null handle
    #[inline]
    pub const fn is_null(self) -> bool {
        self.index() == 0
    }

    /// A handle `delta` bytes further into the same allocation
    #[inline]
    pub const fn offset_by(self, delta: u64) -> Self {
        Self::encode(self.device(), self.index(), self.offset() + delta)
    }
}

impl fmt::Debug for VirtualPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VirtualPtr(dev={}, idx={}, off={:#x})",
            self.device(),
            self.index(),
            self.offset()
        )
    }
}

impl fmt::Display for VirtualPtr {
    /// Bare hex, the way pointers appear in device logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for device in [0u8, 1, 7, 255] {
            for index in [1u16, 2, 0x7fff, 0xffff] {
                for offset in [0u64, 1, 4096, MAX_OFFSET] {
                    let ptr = VirtualPtr::encode(device, index, offset);
                    assert_eq!(ptr.device(), device);
                    assert_eq!(ptr.index(), index);
                    assert_eq!(ptr.offset(), offset);
                }
            }
        }
    }

    #[test]
    fn test_base_clears_only_offset() {
        let ptr = VirtualPtr::encode(2, 40, 1234);
        let base = ptr.base();
        assert_eq!(base.device(), 2);
        assert_eq!(base.index(), 40);
        assert_eq!(base.offset(), 0);
    }

    #[test]
    fn test_null() {
        assert!(VirtualPtr::NULL.is_null());
        assert!(VirtualPtr::encode(3, 0, 16).is_null());
        assert!(!VirtualPtr::encode(0, 1, 0).is_null());
    }

    #[test]
    fn test_offset_by() {
        let ptr = VirtualPtr::encode(1, 9, 100);
        let moved = ptr.offset_by(28);
        assert_eq!(moved.index(), 9);
        assert_eq!(moved.offset(), 128);
        assert_eq!(moved.base(), ptr.base());
    }
}
