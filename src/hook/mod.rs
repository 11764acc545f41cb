//! # Hook
//!
//! Trampoline hooks: redirect execution at an arbitrary code address to a
//! detour while keeping the original code callable, reversibly.
//!
//! A hook rewrites the first bytes of the target site into a near jump to a
//! freshly allocated trampoline. The trampoline starts with a pad of no-ops
//! reserved for other hooking software (overlays follow our jump and patch
//! *there* instead of fighting over the site), then jumps to the detour.
//! The bytes displaced from the site are preserved verbatim inside the
//! trampoline, followed by a jump back to the remainder of the original
//! code — calling that preserved copy behaves like calling the unhooked
//! function.
//!
//! ```text
//! site:        jmp trampoline ; nop pad to clearance
//! trampoline:  nop pad (other hookers patch here)
//!              jmp detour
//!              <original bytes>      <- call-original entry
//!              jmp site+clearance
//! ```
//!
//! Displaced bytes are copied, not re-encoded: a site whose first
//! `clearance` bytes contain RIP-relative instructions will misbehave when
//! invoked through the call-original entry. Install and remove are
//! serialized per engine; removal does not synchronize with threads
//! currently executing the trampoline, which is why removed trampolines
//! are retired instead of unmapped.

pub mod vtable;

use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, info, warn};
use thiserror::Error;

use crate::addr::Address;
use crate::alloc::{self, AllocError, ExecutableMemory};
use crate::clearance::{self, MAX_LOOKAHEAD};
use crate::code::x64::{
    detect_redirect, far_jump, near_jump, redirect_target, RedirectTarget, FAR_JUMP_SIZE,
    NEAR_JUMP_SIZE, NOP,
};
use crate::mem;
use crate::protect::{ProtectError, ProtectionGuard};

/// How many pre-existing redirects are followed before hooking whatever
/// address the chain last reached.
const MAX_FOLLOW_HOPS: usize = 50;

/// Leading trampoline bytes left as no-ops for other hooking software.
const GUARD_PAD: usize = FAR_JUMP_SIZE;

/// Errors raised while installing or removing hooks.
#[derive(Debug, Error)]
pub enum HookError {
    /// The detour address was null.
    #[error("detour address is null")]
    NullDetour,
    /// A vtable hook was requested through a null object or vtable pointer.
    #[error("object at {0} has no usable vtable")]
    InvalidObject(Address),
    /// The (post-follow) site already carries one of this engine's hooks.
    #[error("a hook is already installed at {0}")]
    AlreadyInstalled(Address),
    /// No hook of this engine is installed at the address.
    #[error("no hook installed at {0}")]
    NotInstalled(Address),
    /// No trampoline memory could be found near the site.
    #[error("trampoline allocation failed: {0}")]
    Allocation(#[from] AllocError),
    /// Changing page permissions failed.
    #[error("memory protection failed: {0}")]
    Protection(#[from] ProtectError),
}

/// Calling convention a detour is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    /// `extern "C"`.
    C,
    /// `extern "system"`.
    System,
}

/// A validated detour function: a non-null code address tagged with the
/// calling convention it expects. The tag is not consumed by the engine —
/// a jump is convention-agnostic — but forces the mismatch question to be
/// answered where the detour is registered rather than where it crashes.
#[derive(Debug, Clone, Copy)]
pub struct Detour {
    /// Entry point of the detour.
    address: Address,
    /// Convention the detour is declared with.
    convention: CallConv,
}

impl Detour {
    /// Wraps a detour address, rejecting null.
    pub fn new(address: Address, convention: CallConv) -> Result<Self, HookError> {
        if address.is_null() {
            return Err(HookError::NullDetour);
        }
        Ok(Self {
            address,
            convention,
        })
    }

    /// Wraps a function pointer, rejecting null.
    pub fn from_ptr(ptr: *const (), convention: CallConv) -> Result<Self, HookError> {
        Self::new(Address::from_ptr(ptr), convention)
    }

    /// Entry point of the detour.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Convention the detour is declared with.
    pub fn convention(&self) -> CallConv {
        self.convention
    }
}

/// What `install` hands back: where the hook actually landed and how to
/// reach the original code.
#[derive(Debug, Clone, Copy)]
pub struct HookHandle {
    /// The address install was asked for.
    pub requested: Address,
    /// The address actually patched, after following pre-existing
    /// redirects. Pass this to [`HookEngine::remove`].
    pub site: Address,
    /// Entry point of the preserved original bytes inside the trampoline.
    /// Transmute to the target's signature to call the unhooked function.
    pub call_original: Address,
}

/// Everything remembered about one installed hook.
struct HookRecord {
    /// The address install was asked for, before following redirects.
    requested: Address,
    /// The bytes that were overwritten at the site.
    original_bytes: Vec<u8>,
    /// Call-through entry inside the trampoline.
    call_original: Address,
    /// The trampoline allocation; keeps the memory alive.
    trampoline: ExecutableMemory,
}

/// Mutable state shared by an engine's operations, behind one lock.
#[derive(Default)]
struct EngineState {
    /// Installed hooks, keyed by the patched (post-follow) site.
    records: HashMap<Address, HookRecord>,
    /// Permission history for every patch this engine makes.
    guard: ProtectionGuard,
    /// Trampolines of removed hooks. A thread may still be executing one,
    /// so they are never returned to the allocator while the engine lives.
    retired: Vec<ExecutableMemory>,
}

/// Installs and removes trampoline hooks.
///
/// Each engine owns its hook registry and protection history; independent
/// instances do not interfere, which keeps tests hermetic. Operations are
/// serialized by an internal lock.
#[derive(Default)]
pub struct HookEngine {
    /// Registry, guard and retirements behind one lock.
    inner: Mutex<EngineState>,
}

impl HookEngine {
    /// Creates an engine with no installed hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirects execution at `address` to `detour`.
    ///
    /// Pre-existing redirects at the address are followed (bounded) and the
    /// hook is placed at the end of the chain, so hooks from other software
    /// keep working. The returned handle carries the patched site and the
    /// call-original entry.
    ///
    /// # Safety
    ///
    /// `address` must be the entry of machine code that is position
    /// independent across its first `clearance` bytes, and no other thread
    /// may be executing those bytes during the patch. The detour must match
    /// the target's actual signature and calling convention.
    pub unsafe fn install(&self, address: Address, detour: Detour) -> Result<HookHandle, HookError> {
        let mut state = self.inner.lock().unwrap();
        let state = &mut *state;

        let site = follow_redirects(&mut state.guard, address)?;
        if state.records.contains_key(&site) {
            return Err(HookError::AlreadyInstalled(site));
        }

        let window = state.guard.read(site, MAX_LOOKAHEAD)?;
        let clearance = clearance::clearance(&window, NEAR_JUMP_SIZE);
        debug!(
            "install: site {site} (requested {address}), clearance {clearance}, bytes {}",
            mem::format_bytes(&window[..clearance])
        );

        // Pad for other hookers, jump to detour, preserved bytes, jump back.
        let size = GUARD_PAD + FAR_JUMP_SIZE + clearance + FAR_JUMP_SIZE;
        let mut trampoline = alloc::allocate_executable(site + NEAR_JUMP_SIZE, size)?;
        let reloc = GUARD_PAD + FAR_JUMP_SIZE;

        trampoline.fill(NOP);
        trampoline[GUARD_PAD..reloc].copy_from_slice(&far_jump(detour.address()));
        trampoline[reloc..reloc + clearance].copy_from_slice(&window[..clearance]);
        trampoline[reloc + clearance..].copy_from_slice(&far_jump(site + clearance));
        let call_original = trampoline.base() + reloc;

        // The site is patched last, once the trampoline is fully formed.
        let mut patch = vec![NOP; clearance];
        patch[..NEAR_JUMP_SIZE].copy_from_slice(&near_jump(site, trampoline.base()));
        state.guard.write(site, &patch)?;

        info!(
            "hooked {site} -> {}, call-original at {call_original}",
            detour.address()
        );

        state.records.insert(
            site,
            HookRecord {
                requested: address,
                original_bytes: window[..clearance].to_vec(),
                call_original,
                trampoline,
            },
        );

        Ok(HookHandle {
            requested: address,
            site,
            call_original,
        })
    }

    /// Restores the original bytes at a hooked site and forgets the hook.
    ///
    /// The trampoline is retired, not unmapped: a thread that entered it
    /// before the site was restored must still find it intact.
    ///
    /// # Safety
    ///
    /// No thread may be executing the site's first `clearance` bytes during
    /// the restore. Function pointers previously derived from
    /// `call_original` become stale.
    pub unsafe fn remove(&self, site: Address) -> Result<(), HookError> {
        let mut state = self.inner.lock().unwrap();
        let state = &mut *state;

        let Some(record) = state.records.get(&site) else {
            warn!("remove: no hook installed at {site}");
            return Err(HookError::NotInstalled(site));
        };

        let original = record.original_bytes.clone();
        state.guard.write(site, &original)?;

        let mut record = state.records.remove(&site).expect("record checked above");
        let reloc = GUARD_PAD + FAR_JUMP_SIZE;
        record.trampoline[reloc..reloc + original.len()].fill(NOP);
        state.retired.push(record.trampoline);

        info!("removed hook at {site}");
        Ok(())
    }

    /// Whether this engine currently has a hook at `site`.
    pub fn is_installed(&self, site: Address) -> bool {
        self.inner.lock().unwrap().records.contains_key(&site)
    }
}

impl Drop for HookEngine {
    fn drop(&mut self) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        // Sites of still-installed hooks keep jumping into their
        // trampolines after the engine is gone, so those allocations (and
        // retired ones, which a thread may still be inside) must outlive
        // the pool bookkeeping. Leaking them is the safe direction.
        for (site, record) in state.records.drain() {
            warn!(
                "engine dropped with live hook at {site} (requested {}); leaking trampoline",
                record.requested
            );
            std::mem::forget(record.trampoline);
        }
        for trampoline in state.retired.drain(..) {
            std::mem::forget(trampoline);
        }
    }
}

/// Follows recognized redirects from `address` to the address that should
/// actually be patched, up to [`MAX_FOLLOW_HOPS`]. On an over-long chain
/// the last address reached is used, which may be stale; logged, not fatal.
unsafe fn follow_redirects(
    guard: &mut ProtectionGuard,
    address: Address,
) -> Result<Address, HookError> {
    let mut site = address;
    for _ in 0..MAX_FOLLOW_HOPS {
        let window = guard.read(site, FAR_JUMP_SIZE)?;
        let Some(kind) = detect_redirect(&window) else {
            return Ok(site);
        };
        let destination = match redirect_target(kind, &window, site) {
            RedirectTarget::Direct(destination) => destination,
            RedirectTarget::Slot(slot) => Address::new(mem::read::<usize>(slot)),
        };
        if destination.is_null() {
            warn!("redirect at {site} leads to null, stopping there");
            return Ok(site);
        }
        debug!("following {kind:?} at {site} -> {destination}");
        site = destination;
    }
    warn!("redirect chain from {address} exceeds {MAX_FOLLOW_HOPS} hops, hooking {site}");
    Ok(site)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::allocate_executable;

    /// mov eax, 0x2a; ret
    const RETURNS_42: [u8; 6] = [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];

    /// The detour every test redirects to.
    extern "C" fn seven() -> i32 {
        7
    }

    /// Allocates an executable buffer holding `code`, NOP-padded to 64
    /// bytes so clearance windows never run off the allocation.
    fn code_buffer(code: &[u8]) -> ExecutableMemory {
        let origin = Address::new(seven as usize);
        let mut memory = allocate_executable(origin, 64).unwrap();
        memory.fill(NOP);
        memory[..code.len()].copy_from_slice(code);
        memory
    }

    /// Transmutes an address into a callable zero-argument function.
    unsafe fn as_function(address: Address) -> extern "C" fn() -> i32 {
        std::mem::transmute(address.get())
    }

    fn detour() -> Detour {
        Detour::from_ptr(seven as *const (), CallConv::C).unwrap()
    }

    #[test]
    fn install_call_original_remove_round_trip() {
        let _ = env_logger::builder().is_test(true).try_init();
        let target = code_buffer(&RETURNS_42);
        let site = target.base();
        let engine = HookEngine::new();

        let before = unsafe { mem::read_bytes(site, RETURNS_42.len()) };
        assert_eq!(unsafe { as_function(site) }(), 42);

        let handle = unsafe { engine.install(site, detour()) }.unwrap();
        assert_eq!(handle.site, site);
        assert!(engine.is_installed(site));

        // The patched site now reaches the detour...
        assert_eq!(unsafe { as_function(site) }(), 7);
        // ...while the preserved entry still behaves like the original.
        assert_eq!(unsafe { as_function(handle.call_original) }(), 42);

        unsafe { engine.remove(handle.site) }.unwrap();
        assert!(!engine.is_installed(site));
        assert_eq!(unsafe { mem::read_bytes(site, RETURNS_42.len()) }, before);
        assert_eq!(unsafe { as_function(site) }(), 42);
    }

    #[test]
    fn preexisting_jump_is_followed_not_clobbered() {
        // Site A holds only a near jump to B, 32 bytes further in; the
        // engine must hook B, exactly as it would step over an overlay's
        // redirect.
        let mut target = code_buffer(&RETURNS_42);
        let a = target.base();
        let b = a + 32;
        let real = RETURNS_42;
        target[32..32 + real.len()].copy_from_slice(&real);
        target[..NEAR_JUMP_SIZE].copy_from_slice(&near_jump(a, b));

        let engine = HookEngine::new();
        let handle = unsafe { engine.install(a, detour()) }.unwrap();

        assert_ne!(handle.site, handle.requested);
        assert_eq!(handle.site, b);
        assert!(engine.is_installed(b));
        assert!(!engine.is_installed(a));

        // Calls entering through A flow across the old jump into the hook.
        assert_eq!(unsafe { as_function(a) }(), 7);
        assert_eq!(unsafe { as_function(handle.call_original) }(), 42);

        unsafe { engine.remove(handle.site) }.unwrap();
        assert_eq!(unsafe { as_function(a) }(), 42);
    }

    #[test]
    fn remove_without_hook_fails_cleanly() {
        let engine = HookEngine::new();
        let err = unsafe { engine.remove(Address::new(0xdead_0000)) }.unwrap_err();
        assert!(matches!(err, HookError::NotInstalled(_)));
    }

    #[test]
    fn null_detour_is_rejected() {
        assert!(matches!(
            Detour::new(Address::NULL, CallConv::C),
            Err(HookError::NullDetour)
        ));
        assert!(Detour::from_ptr(seven as *const (), CallConv::System).is_ok());
    }

    #[test]
    fn long_first_instruction_is_not_split() {
        // movabs rax, imm64 (10 bytes) followed by mov eax, 0x2a; ret.
        // Clearance must cover the whole 10-byte instruction.
        let mut code = vec![0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0];
        code.extend_from_slice(&RETURNS_42);
        let target = code_buffer(&code);
        let site = target.base();

        let engine = HookEngine::new();
        let handle = unsafe { engine.install(site, detour()) }.unwrap();

        assert_eq!(unsafe { as_function(site) }(), 7);
        // The preserved copy replays the movabs, then the tail jump lands
        // on the mov/ret pair left unpatched at site+10.
        assert_eq!(unsafe { as_function(handle.call_original) }(), 42);

        unsafe { engine.remove(handle.site) }.unwrap();
        assert_eq!(unsafe { as_function(site) }(), 42);
    }

    #[test]
    fn engines_are_independent() {
        let first_target = code_buffer(&RETURNS_42);
        let second_target = code_buffer(&RETURNS_42);
        let first = HookEngine::new();
        let second = HookEngine::new();

        let handle = unsafe { first.install(first_target.base(), detour()) }.unwrap();

        // The second engine has its own registry and knows nothing about
        // the first engine's hook.
        assert!(!second.is_installed(handle.site));
        assert!(matches!(
            unsafe { second.remove(handle.site) },
            Err(HookError::NotInstalled(_))
        ));

        let other = unsafe { second.install(second_target.base(), detour()) }.unwrap();
        assert_eq!(unsafe { as_function(other.site) }(), 7);

        unsafe { first.remove(handle.site) }.unwrap();
        unsafe { second.remove(other.site) }.unwrap();
    }
}
