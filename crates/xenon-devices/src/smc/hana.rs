//! HANA/ANA companion-chip register file.
//!
//! The AV/HDMI companion chip is reached over SMBus through the SMC. Only
//! the entries guest HALs actually probe carry meaningful power-on values;
//! everything else reads zero until written. Register `0xFE` is the chip
//! fingerprint the kernel uses to tell console generations apart.

use xenon_base::config::ConsoleRevision;

pub const HANA_REG_COUNT: usize = 256;

/// Fingerprint register index.
pub const HANA_REG_REVISION: usize = 0xFE;

pub fn baseline(revision: ConsoleRevision) -> [u32; HANA_REG_COUNT] {
    let mut regs = if revision.is_fat() {
        fat_baseline()
    } else {
        slim_baseline()
    };

    let fingerprint = match revision {
        ConsoleRevision::Xenon => Some(0x01),
        // Zephyr keeps the baseline default.
        ConsoleRevision::Zephyr => None,
        ConsoleRevision::Falcon | ConsoleRevision::Jasper => Some(0x21),
        ConsoleRevision::Trinity
        | ConsoleRevision::Corona
        | ConsoleRevision::Corona4GB
        | ConsoleRevision::Winchester => Some(0x23),
    };
    if let Some(fingerprint) = fingerprint {
        regs[HANA_REG_REVISION] = (regs[HANA_REG_REVISION] & !0xFF) | fingerprint;
    }

    regs
}

fn fat_baseline() -> [u32; HANA_REG_COUNT] {
    let mut regs = [0u32; HANA_REG_COUNT];
    regs[0x00] = 0x0000_0001;
    regs[0x10] = 0x0000_0289;
    regs[0x11] = 0x0000_0289;
    regs[0xC0] = 0x0000_3D01;
    regs[0xC4] = 0x0001_0000;
    regs[HANA_REG_REVISION] = 0x0000_0021;
    regs
}

fn slim_baseline() -> [u32; HANA_REG_COUNT] {
    let mut regs = [0u32; HANA_REG_COUNT];
    regs[0x00] = 0x0000_0001;
    regs[0x10] = 0x0000_0273;
    regs[0xC0] = 0x0000_3D00;
    regs[HANA_REG_REVISION] = 0x0000_0023;
    regs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_tracks_console_generation() {
        assert_eq!(baseline(ConsoleRevision::Xenon)[HANA_REG_REVISION] & 0xFF, 0x01);
        assert_eq!(baseline(ConsoleRevision::Falcon)[HANA_REG_REVISION] & 0xFF, 0x21);
        assert_eq!(baseline(ConsoleRevision::Jasper)[HANA_REG_REVISION] & 0xFF, 0x21);
        assert_eq!(baseline(ConsoleRevision::Trinity)[HANA_REG_REVISION] & 0xFF, 0x23);
        assert_eq!(baseline(ConsoleRevision::Corona)[HANA_REG_REVISION] & 0xFF, 0x23);
        // Zephyr keeps the fat default.
        assert_eq!(baseline(ConsoleRevision::Zephyr)[HANA_REG_REVISION] & 0xFF, 0x21);
    }

    #[test]
    fn fat_and_slim_baselines_differ() {
        assert_ne!(
            baseline(ConsoleRevision::Xenon)[0x10],
            baseline(ConsoleRevision::Corona)[0x10]
        );
    }
}
