//! Encoding of a failed shadow check.
//!
//! Instrumented code has two ways to hand a violation to the runtime: call
//! `__addrsan_report_error_<code>(addr)`, or execute `ud2` followed by a
//! one-byte immediate of `UD2_IMM_BASE + code` with the faulting address in
//! the accumulator. Either way the code packs the access direction and the
//! log2 of its size into four bits.

/// The immediate byte after `ud2` is `UD2_IMM_BASE + code`.
pub const UD2_IMM_BASE: u8 = 0x50;

const WRITE_BIT: u8 = 1 << 3;

/// Access sizes are 1, 2, 4, 8, or 16 bytes.
pub const MAX_LOG_SIZE: u8 = 4;

/// Size and direction of an instrumented access, as recovered from a trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessInfo {
    pub size: usize,
    pub is_write: bool,
}

impl AccessInfo {
    /// Decodes a four-bit access code: bit 3 is the write flag, bits 0..3 are
    /// the log2 of the access size. Codes 5..8 and 13..16 are unused.
    pub const fn from_code(code: u8) -> Option<AccessInfo> {
        if code >= 16 {
            return None;
        }
        let log_size = code & 7;
        if log_size > MAX_LOG_SIZE {
            return None;
        }
        Some(AccessInfo { size: 1 << log_size, is_write: code & WRITE_BIT != 0 })
    }

    pub const fn from_ud2_imm(imm: u8) -> Option<AccessInfo> {
        if imm < UD2_IMM_BASE {
            return None;
        }
        Self::from_code(imm - UD2_IMM_BASE)
    }

    pub const fn code(&self) -> u8 {
        let log_size = self.size.trailing_zeros() as u8;
        if self.is_write { WRITE_BIT | log_size } else { log_size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in [0u8, 1, 2, 3, 4, 8, 9, 10, 11, 12] {
            let info = AccessInfo::from_code(code).unwrap();
            assert_eq!(info.code(), code);
            assert_eq!(info.is_write, code >= 8);
            assert_eq!(info.size, 1 << (code & 7));
        }
    }

    #[test]
    fn invalid_codes_rejected() {
        for code in [5u8, 6, 7, 13, 14, 15, 16, 200] {
            assert_eq!(AccessInfo::from_code(code), None);
        }
    }

    #[test]
    fn ud2_immediate_round_trips() {
        let info = AccessInfo { size: 4, is_write: true };
        let imm = UD2_IMM_BASE + info.code();
        assert_eq!(AccessInfo::from_ud2_imm(imm), Some(info));
        assert_eq!(AccessInfo::from_ud2_imm(UD2_IMM_BASE - 1), None);
    }
}
