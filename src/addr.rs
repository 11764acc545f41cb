//! # Address
//!
//! Integer newtype for addresses in the current process.
//!
//! Keeping addresses out of bare `usize` prevents them from being mixed with
//! unrelated integers; converting to a raw pointer is the only escape hatch
//! and marks the spot where memory is actually touched.

use std::fmt;
use std::ops::{Add, Sub};

/// An address in the current process's address space.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

impl Address {
    /// The null address.
    pub const NULL: Address = Address(0);

    /// Wraps a raw address value.
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// Returns the raw address value.
    pub const fn get(self) -> usize {
        self.0
    }

    /// Whether this is the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Reinterprets the address as a const pointer.
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Reinterprets the address as a mutable pointer.
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Captures the address of a raw pointer.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Offsets the address by a signed byte delta, wrapping on overflow.
    pub fn offset(self, delta: isize) -> Self {
        Self(self.0.wrapping_add_signed(delta))
    }
}

impl Add<usize> for Address {
    type Output = Address;

    fn add(self, rhs: usize) -> Address {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<usize> for Address {
    type Output = Address;

    fn sub(self, rhs: usize) -> Address {
        Address(self.0.wrapping_sub(rhs))
    }
}

impl Sub<Address> for Address {
    type Output = usize;

    /// Byte distance between two addresses.
    fn sub(self, rhs: Address) -> usize {
        self.0.wrapping_sub(rhs.0)
    }
}

impl From<usize> for Address {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::Address;

    #[test]
    fn arithmetic() {
        let a = Address::new(0x1000);
        assert_eq!((a + 0x10).get(), 0x1010);
        assert_eq!((a - 0x10).get(), 0xff0);
        assert_eq!(a + 0x10 - a, 0x10);
        assert_eq!(a.offset(-0x800).get(), 0x800);
    }

    #[test]
    fn pointer_round_trip() {
        let value = 7u32;
        let a = Address::from_ptr(&value);
        assert!(!a.is_null());
        assert_eq!(a.as_ptr::<u32>(), &value as *const u32);
        assert_eq!(format!("{a}"), format!("{:#x}", &value as *const u32 as usize));
    }
}
