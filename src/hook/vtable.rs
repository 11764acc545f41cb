//! Hooking through interface-object vtables.
//!
//! An interface-style object stores a pointer to a table of function
//! pointers as its first machine word; calls dispatch by indexing that
//! table. Hooking such a call means reading the function pointer out of
//! the right slot and installing an ordinary trampoline hook on it — the
//! slot itself is left untouched, so every object sharing the vtable is
//! intercepted at once.

use std::mem::size_of;

use log::debug;

use super::{Detour, HookEngine, HookError, HookHandle};
use crate::addr::Address;
use crate::mem;

impl HookEngine {
    /// Hooks the function installed in slot `slot` of `object`'s vtable.
    ///
    /// The slot address is `*object + slot * 8`; the pointer stored there
    /// is read under the protection guard (vtables are frequently mapped
    /// read-only) and handed to [`install`](Self::install).
    ///
    /// # Safety
    ///
    /// `object` must point to a live object whose first word is a vtable
    /// pointer, `slot` must be a valid index into that table, and the
    /// slot's function must satisfy [`install`](Self::install)'s
    /// requirements.
    pub unsafe fn install_vtable_hook(
        &self,
        object: Address,
        slot: usize,
        detour: Detour,
    ) -> Result<HookHandle, HookError> {
        if object.is_null() {
            return Err(HookError::InvalidObject(object));
        }
        let vtable = Address::new(mem::read::<usize>(object));
        if vtable.is_null() {
            return Err(HookError::InvalidObject(object));
        }

        let slot_address = vtable + slot * size_of::<usize>();
        let target = {
            let mut state = self.inner.lock().unwrap();
            let bytes = state.guard.read(slot_address, size_of::<usize>())?;
            Address::new(usize::from_le_bytes(
                bytes.try_into().expect("pointer-sized read"),
            ))
        };
        if target.is_null() {
            return Err(HookError::InvalidObject(object));
        }
        debug!("vtable slot {slot} of {object} holds {target}");

        self.install(target, detour)
    }
}
