//! # Mem
//!
//! The raw read/write primitives everything else routes through, plus a few
//! small helpers for inspecting foreign memory.
//!
//! This is the only module that dereferences arbitrary [`Address`]es; the
//! rest of the crate goes through these functions (usually via
//! [`crate::protect::ProtectionGuard`], which also handles page permissions).

use std::ptr;

use crate::addr::Address;

/// Copies `len` bytes out of the process at `address`.
///
/// # Safety
///
/// `address` must be readable for `len` bytes. Use [`is_readable`] when the
/// address comes from untrusted input.
pub unsafe fn read_bytes(address: Address, len: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; len];
    ptr::copy_nonoverlapping(address.as_ptr::<u8>(), buffer.as_mut_ptr(), len);
    buffer
}

/// Reads a plain value at `address` without alignment requirements.
///
/// # Safety
///
/// `address` must be readable for `size_of::<T>()` bytes and the bytes there
/// must be a valid `T`.
pub unsafe fn read<T: Copy>(address: Address) -> T {
    ptr::read_unaligned(address.as_ptr::<T>())
}

/// Copies `bytes` into the process at `address`.
///
/// # Safety
///
/// `address` must be writable for `bytes.len()` bytes and must not overlap
/// memory tracked by Rust.
pub unsafe fn write_bytes(address: Address, bytes: &[u8]) {
    ptr::copy_nonoverlapping(bytes.as_ptr(), address.as_mut_ptr::<u8>(), bytes.len());
}

/// Sets `len` bytes at `address` to `value`.
///
/// # Safety
///
/// Same requirements as [`write_bytes`].
pub unsafe fn fill(address: Address, value: u8, len: usize) {
    ptr::write_bytes(address.as_mut_ptr::<u8>(), value, len);
}

/// Whether `len` bytes at `address` are committed, readable and unguarded,
/// without crossing out of the containing region.
pub fn is_readable(address: Address, len: usize) -> bool {
    match region::query(address.as_ptr::<u8>()) {
        Ok(info) => {
            info.is_committed()
                && info.is_readable()
                && !info.is_guarded()
                && address.get() + len <= info.as_range().end
        }
        Err(_) => false,
    }
}

/// Follows a pointer chain starting at `base`: every offset except the last
/// is added and dereferenced, the last is only added. Returns `None` as soon
/// as a null or unreadable pointer is encountered.
///
/// # Safety
///
/// Intermediate pointers are validated with [`is_readable`] before each
/// dereference, but the chain can still race with the owning code freeing
/// the memory between the check and the read.
pub unsafe fn read_pointer_chain(base: Address, offsets: &[usize]) -> Option<Address> {
    let mut pointer = base;
    for (i, offset) in offsets.iter().enumerate() {
        pointer = pointer + *offset;
        if i != offsets.len() - 1 {
            if !is_readable(pointer, std::mem::size_of::<usize>()) {
                return None;
            }
            pointer = Address::new(read::<usize>(pointer));
        }
        if pointer.is_null() {
            return None;
        }
    }
    Some(pointer)
}

/// Renders bytes as space-separated hex, the form used throughout the
/// crate's log output.
pub fn format_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let mut buffer = vec![0u8; 8];
        let address = Address::from_ptr(buffer.as_ptr());

        unsafe { write_bytes(address, &[1, 2, 3, 4]) };
        assert_eq!(buffer[..4], [1, 2, 3, 4]);

        unsafe { fill(address + 4, 0x90, 4) };
        assert_eq!(buffer[4..], [0x90; 4]);

        assert_eq!(unsafe { read_bytes(address, 8) }, buffer);
        assert_eq!(unsafe { read::<u32>(address) }, u32::from_le_bytes([1, 2, 3, 4]));
    }

    #[test]
    fn readable_checks() {
        let buffer = vec![0u8; 64];
        let address = Address::from_ptr(buffer.as_ptr());
        assert!(is_readable(address, buffer.len()));
        assert!(!is_readable(Address::NULL, 1));
    }

    #[test]
    fn pointer_chain() {
        let leaf = 42u64;
        let middle: *const u64 = &leaf;
        let root: *const *const u64 = &middle;

        let resolved = unsafe {
            read_pointer_chain(Address::from_ptr(root), &[0, 0])
        };
        assert_eq!(resolved, Some(Address::from_ptr(middle)));

        let null: *const u64 = std::ptr::null();
        let root: *const *const u64 = &null;
        assert_eq!(unsafe { read_pointer_chain(Address::from_ptr(root), &[0, 0]) }, None);
    }

    #[test]
    fn hex_rendering() {
        assert_eq!(format_bytes(&[0xde, 0xad, 0x01]), "DE AD 01");
        assert_eq!(format_bytes(&[]), "");
    }
}
