//! # Clearance
//!
//! Determines how many leading bytes at a prospective hook site can be
//! overwritten without cutting an instruction in half.
//!
//! Only instruction *lengths* are needed, so the decoder is used as a
//! stepper: sizes are accumulated until the running total covers the
//! requested minimum. This is deliberately not a disassembler; operands are
//! never inspected, and RIP-relative instructions inside the window are the
//! caller's problem (see the crate-level limitations).

use iced_x86::{Decoder, DecoderOptions};
use log::warn;

use crate::code::x64::{detect_redirect, Redirect, FAR_JUMP_SIZE};

/// How far past the requested minimum the stepper will look before giving
/// up on finding an instruction boundary.
pub const MAX_LOOKAHEAD: usize = 30;

/// Returns the smallest byte count that is at least `minimum` and ends on
/// an instruction boundary of `window`.
///
/// Fast path: a window that already starts with an absolute far jump has a
/// known size and is returned without decoding.
///
/// Fallback: if the decoder hits an invalid opcode, or the window runs out
/// before `minimum` is reached, exactly `minimum` is returned. That risks
/// splitting an instruction; it is an accepted trade-off for sites the
/// decoder cannot handle, not something this function hides — a warning is
/// logged whenever the fallback fires.
pub fn clearance(window: &[u8], minimum: usize) -> usize {
    if detect_redirect(window) == Some(Redirect::AbsoluteFar) {
        return FAR_JUMP_SIZE;
    }

    let window = &window[..window.len().min(MAX_LOOKAHEAD)];
    let mut decoder = Decoder::new(64, window, DecoderOptions::NONE);
    let mut total = 0usize;

    while total < minimum {
        if !decoder.can_decode() {
            warn!(
                "no instruction boundary within {} bytes, falling back to {minimum}",
                window.len()
            );
            return minimum;
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            warn!("invalid instruction at offset {total}, falling back to {minimum}");
            return minimum;
        }
        total += instruction.len();
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Address;
    use crate::code::x64::{far_jump, NEAR_JUMP_SIZE, NOP};

    #[test]
    fn single_byte_instructions_hit_minimum_exactly() {
        let window = [NOP; MAX_LOOKAHEAD];
        assert_eq!(clearance(&window, NEAR_JUMP_SIZE), NEAR_JUMP_SIZE);
    }

    #[test]
    fn long_instruction_extends_clearance() {
        // mov rax, imm64 is 10 bytes; the minimum falls inside it, so the
        // whole instruction must be taken.
        let mut window = vec![0x48, 0xb8, 1, 2, 3, 4, 5, 6, 7, 8];
        window.extend_from_slice(&[NOP; 20]);
        assert_eq!(clearance(&window, NEAR_JUMP_SIZE), 10);
    }

    #[test]
    fn boundary_exactly_at_minimum() {
        // push rbx (1) + 4 nops: boundary lands exactly on the minimum.
        let mut window = vec![0x53];
        window.extend_from_slice(&[NOP; 29]);
        assert_eq!(clearance(&window, NEAR_JUMP_SIZE), NEAR_JUMP_SIZE);
    }

    #[test]
    fn far_jump_fast_path() {
        let mut window = far_jump(Address::new(0xdead_0000)).to_vec();
        window.extend_from_slice(&[NOP; 16]);
        assert_eq!(clearance(&window, NEAR_JUMP_SIZE), FAR_JUMP_SIZE);
    }

    #[test]
    fn invalid_opcode_falls_back_to_minimum() {
        // 0x06 (push es) does not decode in 64-bit mode.
        let window = [0x06; MAX_LOOKAHEAD];
        assert_eq!(clearance(&window, NEAR_JUMP_SIZE), NEAR_JUMP_SIZE);
    }

    #[test]
    fn short_window_falls_back_to_minimum() {
        let window = [NOP; 3];
        assert_eq!(clearance(&window, NEAR_JUMP_SIZE), NEAR_JUMP_SIZE);
    }
}
