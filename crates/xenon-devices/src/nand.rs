//! NAND gateway.
//!
//! Registers the flash image under a named MMIO range. All accesses are
//! forwarded untouched to the flash controller, which owns the image layout
//! and the erase-block semantics.

use std::sync::Arc;

use crate::device::{BusResult, DeviceInfo, SystemDevice};

/// Default guest window the boot NAND is mapped at.
pub const NAND_START: u64 = 0xC800_0000;
pub const NAND_END: u64 = 0xCC00_0000;

/// Raw access contract implemented by the flash controller (SFCX).
pub trait FlashController: Send + Sync {
    fn read_raw(&self, addr: u64, data: &mut [u8]);
    fn write_raw(&self, addr: u64, data: &[u8]);
    fn mem_set_raw(&self, addr: u64, value: u8, len: u64);
}

pub struct Nand {
    info: DeviceInfo,
    sfcx: Arc<dyn FlashController>,
}

impl Nand {
    pub fn new(sfcx: Arc<dyn FlashController>, start_addr: u64, end_addr: u64) -> Self {
        Self {
            info: DeviceInfo::new("NAND", start_addr, end_addr, true),
            sfcx,
        }
    }
}

impl SystemDevice for Nand {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read(&self, addr: u64, data: &mut [u8]) -> BusResult {
        self.sfcx.read_raw(addr, data);
        Ok(())
    }

    fn write(&self, addr: u64, data: &[u8]) -> BusResult {
        self.sfcx.write_raw(addr, data);
        Ok(())
    }

    fn fill(&self, addr: u64, value: u8, len: u64) -> BusResult {
        self.sfcx.mem_set_raw(addr, value, len);
        Ok(())
    }
}
