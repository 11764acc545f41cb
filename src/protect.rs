//! # Protect
//!
//! Toggles page permissions around reads, writes and patches, remembering
//! the permission that was in place so it can be put back.
//!
//! Every byte the crate copies into or out of foreign memory goes through a
//! [`ProtectionGuard`]; the guard is an owned value (typically held by a
//! [`crate::hook::HookEngine`]) rather than process-wide state, so isolated
//! instances can be constructed in tests.

use std::collections::HashMap;

use log::debug;
use region::Protection;
use thiserror::Error;

use crate::addr::Address;
use crate::mem;

/// Errors raised while changing page permissions.
#[derive(Debug, Error)]
pub enum ProtectError {
    /// Querying or reprotecting the containing region failed.
    #[error("memory protection change failed: {0}")]
    Region(#[from] region::Error),
}

/// Address-keyed permission history with paired unprotect/restore calls.
#[derive(Default)]
pub struct ProtectionGuard {
    /// Permission to restore per unprotected address. An entry exists only
    /// between an `unprotect` and its matching `restore`.
    history: HashMap<Address, Protection>,
}

impl ProtectionGuard {
    /// Creates a guard with an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `size` bytes at `address` readable, writable and executable,
    /// remembering the prior permission.
    ///
    /// Calling this twice for the same address without a `restore` in
    /// between is a caller error and is ignored (the first recorded
    /// permission stays authoritative).
    ///
    /// # Safety
    ///
    /// `address` must be a mapped region of at least `size` bytes. Making
    /// foreign memory writable+executable is inherently unsafe.
    pub unsafe fn unprotect(&mut self, address: Address, size: usize) -> Result<(), ProtectError> {
        if self.history.contains_key(&address) {
            return Ok(());
        }
        let previous = region::query(address.as_ptr::<u8>())?.protection();
        region::protect(address.as_ptr::<u8>(), size, Protection::READ_WRITE_EXECUTE)?;
        self.history.insert(address, previous);
        Ok(())
    }

    /// Restores the permission recorded by the matching [`unprotect`] call
    /// and forgets it. A restore without a matching unprotect is ignored.
    ///
    /// [`unprotect`]: Self::unprotect
    ///
    /// # Safety
    ///
    /// `address` and `size` must match the earlier `unprotect` call.
    pub unsafe fn restore(&mut self, address: Address, size: usize) -> Result<(), ProtectError> {
        if let Some(previous) = self.history.remove(&address) {
            region::protect(address.as_ptr::<u8>(), size, previous)?;
        }
        Ok(())
    }

    /// Copies `len` bytes out of `address`, unprotecting around the read.
    ///
    /// # Safety
    ///
    /// `address` must be a mapped region of at least `len` bytes.
    pub unsafe fn read(&mut self, address: Address, len: usize) -> Result<Vec<u8>, ProtectError> {
        self.unprotect(address, len)?;
        let bytes = mem::read_bytes(address, len);
        self.restore(address, len)?;
        Ok(bytes)
    }

    /// Copies `bytes` into `address`, unprotecting around the write.
    ///
    /// # Safety
    ///
    /// `address` must be a mapped region of at least `bytes.len()` bytes,
    /// not tracked by Rust.
    pub unsafe fn write(&mut self, address: Address, bytes: &[u8]) -> Result<(), ProtectError> {
        self.unprotect(address, bytes.len())?;
        mem::write_bytes(address, bytes);
        self.restore(address, bytes.len())?;
        debug!("wrote {} bytes at {address}", bytes.len());
        Ok(())
    }

    /// Sets `len` bytes at `address` to `value`, unprotecting around the
    /// write.
    ///
    /// # Safety
    ///
    /// Same requirements as [`write`](Self::write).
    pub unsafe fn fill(
        &mut self,
        address: Address,
        value: u8,
        len: usize,
    ) -> Result<(), ProtectError> {
        self.unprotect(address, len)?;
        mem::fill(address, value, len);
        self.restore(address, len)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Queries the protection currently covering `address`.
    fn protection_at(address: Address) -> Protection {
        region::query(address.as_ptr::<u8>()).unwrap().protection()
    }

    #[test]
    fn write_restores_permissions() {
        // Global immutables live in a read-only section; a plain write
        // would fault without the guard flipping permissions first.
        static DATA: [u8; 4] = [b'1', b'2', b'3', b'4'];
        let address = Address::from_ptr(DATA.as_ptr());

        let before = protection_at(address);
        assert!(!before.contains(Protection::WRITE));

        let mut guard = ProtectionGuard::new();
        unsafe { guard.write(address, &[4, 3, 2, 1]).unwrap() };
        assert_eq!(unsafe { mem::read_bytes(address, 4) }, [4, 3, 2, 1]);
        assert_eq!(protection_at(address), before);

        // Put the bytes back so other tests see the original value.
        unsafe { guard.write(address, b"1234").unwrap() };
        assert_eq!(unsafe { mem::read_bytes(address, 4) }, *b"1234");
    }

    #[test]
    fn unprotect_restore_round_trip() {
        static DATA: [u8; 4] = *b"abcd";
        let address = Address::from_ptr(DATA.as_ptr());
        let before = protection_at(address);

        let mut guard = ProtectionGuard::new();
        unsafe { guard.unprotect(address, 4).unwrap() };
        assert_eq!(protection_at(address), Protection::READ_WRITE_EXECUTE);
        unsafe { guard.restore(address, 4).unwrap() };
        assert_eq!(protection_at(address), before);
    }

    #[test]
    fn unpaired_calls_are_ignored() {
        static DATA: [u8; 4] = *b"wxyz";
        let address = Address::from_ptr(DATA.as_ptr());
        let before = protection_at(address);

        let mut guard = ProtectionGuard::new();
        // Restore with no history entry: nothing happens.
        unsafe { guard.restore(address, 4).unwrap() };
        assert_eq!(protection_at(address), before);

        // Double unprotect: the second call must not clobber the recorded
        // original permission with READ_WRITE_EXECUTE.
        unsafe { guard.unprotect(address, 4).unwrap() };
        unsafe { guard.unprotect(address, 4).unwrap() };
        unsafe { guard.restore(address, 4).unwrap() };
        assert_eq!(protection_at(address), before);
    }

    #[test]
    fn read_does_not_disturb_contents() {
        let buffer = vec![7u8; 32];
        let address = Address::from_ptr(buffer.as_ptr());
        let mut guard = ProtectionGuard::new();
        let bytes = unsafe { guard.read(address, 32).unwrap() };
        assert_eq!(bytes, buffer);
    }
}
