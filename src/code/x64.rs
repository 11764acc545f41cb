//! x86-64 jump encodings and redirect recognition.
//!
//! Three redirect shapes are understood, the ones commonly left at function
//! entries by hooking software:
//!
//! - `E9 rel32` — relative near jump, 5 bytes
//! - `48 FF 25 rel32` — indirect jump through a RIP-relative slot, 7 bytes
//! - `FF 25 00000000` + 8-byte target — absolute far jump, 14 bytes

use std::mem;

use crate::addr::Address;

/// Size of a relative near jump (`E9 rel32`).
pub const NEAR_JUMP_SIZE: usize = 5;
/// Size of an absolute far jump (`FF 25 00000000` + target).
pub const FAR_JUMP_SIZE: usize = 14;
/// Size of an indirect near jump (`48 FF 25 rel32`).
pub const INDIRECT_JUMP_SIZE: usize = 7;
/// The single-byte no-op used for padding.
pub const NOP: u8 = 0x90;

#[repr(packed)]
#[allow(dead_code)]
/// Layout helper for encoding an absolute far jump.
struct FarJump {
    /// `jmp [rip + 0]`; the target is stored inline right after.
    opcode: [u8; 6],
    /// Absolute target address.
    target: u64,
}

/// Encodes an absolute far jump to `target`. Reaches any address.
pub fn far_jump(target: Address) -> [u8; FAR_JUMP_SIZE] {
    unsafe {
        mem::transmute(FarJump {
            opcode: [0xff, 0x25, 0x00, 0x00, 0x00, 0x00],
            target: target.get() as u64,
        })
    }
}

/// Encodes a relative near jump at `from` landing on `to`. The displacement
/// wraps, so the pair must be within ±2 GiB for the jump to be meaningful.
pub fn near_jump(from: Address, to: Address) -> [u8; NEAR_JUMP_SIZE] {
    let displacement = near_jump_displacement(from, to);
    let mut bytes = [0xe9, 0, 0, 0, 0];
    bytes[1..].copy_from_slice(&displacement.to_le_bytes());
    bytes
}

/// Displacement encoded in a near jump at `from` targeting `to`.
pub fn near_jump_displacement(from: Address, to: Address) -> i32 {
    to.get()
        .wrapping_sub(from.get().wrapping_add(NEAR_JUMP_SIZE)) as i32
}

/// A redirect recognized at the start of a byte window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirect {
    /// `E9 rel32`.
    RelativeNear,
    /// `48 FF 25 rel32`, jumping through a pointer slot.
    IndirectNear,
    /// `FF 25 00000000` with the target inline.
    AbsoluteFar,
}

/// Where a recognized redirect leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectTarget {
    /// The destination address itself.
    Direct(Address),
    /// The address of a pointer slot holding the destination.
    Slot(Address),
}

/// Recognizes a redirect at the start of `window`, if one is present.
pub fn detect_redirect(window: &[u8]) -> Option<Redirect> {
    if window.len() >= NEAR_JUMP_SIZE && window[0] == 0xe9 {
        return Some(Redirect::RelativeNear);
    }
    if window.len() >= INDIRECT_JUMP_SIZE && window[..3] == [0x48, 0xff, 0x25] {
        return Some(Redirect::IndirectNear);
    }
    if window.len() >= FAR_JUMP_SIZE && window[..6] == [0xff, 0x25, 0x00, 0x00, 0x00, 0x00] {
        return Some(Redirect::AbsoluteFar);
    }
    None
}

/// Resolves where the redirect at `site` (whose leading bytes are `window`)
/// transfers control. Indirect jumps yield the slot address; the caller
/// reads the pointer stored there.
///
/// # Panics
///
/// Panics if `window` is shorter than the redirect's encoding; pass the
/// same window that [`detect_redirect`] classified.
pub fn redirect_target(kind: Redirect, window: &[u8], site: Address) -> RedirectTarget {
    match kind {
        Redirect::RelativeNear => {
            let displacement =
                i32::from_le_bytes(window[1..5].try_into().expect("rel32 window"));
            RedirectTarget::Direct((site + NEAR_JUMP_SIZE).offset(displacement as isize))
        }
        Redirect::IndirectNear => {
            let displacement =
                i32::from_le_bytes(window[3..7].try_into().expect("rel32 window"));
            RedirectTarget::Slot((site + INDIRECT_JUMP_SIZE).offset(displacement as isize))
        }
        Redirect::AbsoluteFar => {
            let target = u64::from_le_bytes(window[6..14].try_into().expect("far window"));
            RedirectTarget::Direct(Address::new(target as usize))
        }
    }
}
