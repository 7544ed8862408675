//! Fixed instruction layouts emitted by the patcher.
//!
//! Two site encodings and two veneer shapes cover every patch:
//!
//! ```text
//! site, 5 bytes:   E9/E8 <rel32>                  jmp/call rel32, lands on a 14-byte veneer
//! site, 6 bytes:   FF 25/15 <rel32>               jmp/call [rip+rel32], reads an 8-byte slot
//! veneer, 14:      FF 25 00 00 00 00 <addr64>     jmp [rip+0] through the trailing address
//! veneer, 8:       <addr64>                       bare address slot
//! ```

/// Size of a rel32 JMP/CALL (opcode + displacement).
pub const JMP_SIZE: usize = 5;

/// Size of an indirect `FF /4` or `FF /2` branch (opcode + ModR/M + displacement).
pub const IND_JMP_SIZE: usize = 6;

/// Absolute jump veneer: `jmp [rip+0]` followed by the 8-byte target.
pub const ABS_JMP_SIZE: usize = 14;

/// Bare 8-byte address slot targeted by the 6-byte site form.
pub const ADDR_SLOT_SIZE: usize = 8;

/// `JMP rel32` opcode.
pub const OP_JMP_REL32: u8 = 0xE9;

/// `CALL rel32` opcode.
pub const OP_CALL_REL32: u8 = 0xE8;

/// ModR/M selecting `FF /4`, `jmp [rip+disp]`.
pub const MODRM_JMP_RIP: u8 = 0x25;

/// ModR/M selecting `FF /2`, `call [rip+disp]`.
pub const MODRM_CALL_RIP: u8 = 0x15;

/// Single-byte NOP. A patch slot starting with it never held a branch.
pub const OP_NOP: u8 = 0x90;

/// Single-byte breakpoint. Fresh pool memory is filled with it so a stray
/// jump into unused veneer space traps instead of executing garbage.
pub const OP_INT3: u8 = 0xCC;

/// rel32 displacement from `next` (the address after the branch
/// instruction) to `target`, or `None` when the distance does not fit a
/// signed 32-bit field.
pub fn rel32(next: usize, target: usize) -> Option<i32> {
    let displacement = target.wrapping_sub(next) as isize;

    i32::try_from(displacement).ok()
}

/// 5-byte site body: opcode plus little-endian rel32.
pub fn encode_rel_branch(opcode: u8, displacement: i32) -> [u8; JMP_SIZE] {
    let mut bytes = [0u8; JMP_SIZE];
    bytes[0] = opcode;
    bytes[1..].copy_from_slice(&displacement.to_le_bytes());
    bytes
}

/// 6-byte site body: `FF`, ModR/M, little-endian rel32.
pub fn encode_indirect_branch(modrm: u8, displacement: i32) -> [u8; IND_JMP_SIZE] {
    let mut bytes = [0u8; IND_JMP_SIZE];
    bytes[0] = 0xFF;
    bytes[1] = modrm;
    bytes[2..].copy_from_slice(&displacement.to_le_bytes());
    bytes
}

/// 14-byte veneer body: `jmp [rip+0]` reading the address stored directly
/// behind the instruction.
pub fn encode_absolute_jump(target: usize) -> [u8; ABS_JMP_SIZE] {
    let mut bytes = [0u8; ABS_JMP_SIZE];
    bytes[..6].copy_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    bytes[6..].copy_from_slice(&(target as u64).to_le_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel32_covers_exactly_the_i32_range() {
        let next = 1usize << 40;

        assert_eq!(rel32(next, next), Some(0));
        assert_eq!(rel32(next, next + 0x10FB), Some(0x10FB));
        assert_eq!(rel32(next, next - 0xF05), Some(-0xF05));
        assert_eq!(
            rel32(next, next + i32::MAX as usize),
            Some(i32::MAX)
        );
        assert_eq!(
            rel32(next, next - (-(i32::MIN as i64)) as usize),
            Some(i32::MIN)
        );
        assert_eq!(rel32(next, next + i32::MAX as usize + 1), None);
        assert_eq!(rel32(next, next - (-(i32::MIN as i64)) as usize - 1), None);
    }

    #[test]
    fn rel_branch_layout() {
        assert_eq!(
            encode_rel_branch(OP_JMP_REL32, 0x10FB),
            [0xE9, 0xFB, 0x10, 0x00, 0x00]
        );
        assert_eq!(
            encode_rel_branch(OP_CALL_REL32, -0xF05),
            [0xE8, 0xFB, 0xF0, 0xFF, 0xFF]
        );
    }

    #[test]
    fn indirect_branch_layout() {
        assert_eq!(
            encode_indirect_branch(MODRM_JMP_RIP, 0x40),
            [0xFF, 0x25, 0x40, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            encode_indirect_branch(MODRM_CALL_RIP, -2),
            [0xFF, 0x15, 0xFE, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn absolute_jump_layout() {
        let bytes = encode_absolute_jump(0xAAAA_BBBB_CCCC_DDDD);

        assert_eq!(&bytes[..6], &[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            &bytes[6..],
            &[0xDD, 0xDD, 0xCC, 0xCC, 0xBB, 0xBB, 0xAA, 0xAA]
        );
    }
}
