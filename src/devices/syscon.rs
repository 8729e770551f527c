//! System controller
//!
//! One write-only register. The written value selects a power action.

use crate::memory::MmioEffect;

pub const SYSCON_POWEROFF: u32 = 0x5555;
pub const SYSCON_RESTART: u32 = 0x7777;

/// Decode a store to the syscon register.
pub fn decode(value: u32) -> MmioEffect {
    match value {
        SYSCON_POWEROFF => MmioEffect::PowerOff,
        SYSCON_RESTART => MmioEffect::Restart,
        other => {
            log::trace!("syscon: ignoring {:#x}", other);
            MmioEffect::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(decode(0x5555), MmioEffect::PowerOff);
        assert_eq!(decode(0x7777), MmioEffect::Restart);
        assert_eq!(decode(0x5556), MmioEffect::None);
        assert_eq!(decode(0), MmioEffect::None);
    }
}
