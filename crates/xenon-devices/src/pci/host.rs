//! Host bridge: the CPU side's entry point into the fabric.
//!
//! Every MMIO access the cores make below the RAM window lands here first
//! and takes one of three routes: the bridge's own register file (host
//! bridge regs at `0xE002_xxxx`, BIU regs at `0xE10x_xxxx`), the graphics
//! chip's BAR, or the PCI bridge. Configuration transactions are forwarded
//! to the PCI bridge unless they address the host bridge's own function
//! (bus 0, device 1).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::device::{BusResult, DeviceInfo, SystemDevice};
use crate::mmio;
use crate::pci::{PciBridge, PciConfigAddress, PciConfigSpace, PciDevice};

pub const HOST_BRIDGE_REG_BASE: u64 = 0xE002_0000;
pub const HOST_BRIDGE_REG_END: u64 = 0xE003_0000;
pub const BIU_REG_BASE: u64 = 0xE100_0000;
pub const BIU_REG_END: u64 = 0xE105_0000;

/// BIU register reporting the installed RAM size.
pub const BIU_REG_RAM_SIZE: u64 = 0xE104_0000;

const HOST_BRIDGE_REGS: [u64; 2] = [0xE002_0000, 0xE002_0004];

const BIU_REGS: [u64; 19] = [
    0xE100_3000,
    0xE100_3100,
    0xE100_3200,
    0xE100_3300,
    0xE101_0000,
    0xE101_0010,
    0xE101_0020,
    0xE101_3000,
    0xE101_3100,
    0xE101_3200,
    0xE101_3300,
    0xE101_8000,
    0xE101_8020,
    0xE102_0000,
    0xE102_0004,
    0xE102_0008,
    BIU_REG_RAM_SIZE,
    0xE104_0074,
    0xE104_0078,
];

struct HostState {
    config: PciConfigSpace,
    regs: BTreeMap<u64, u32>,
}

pub struct HostBridge {
    info: DeviceInfo,
    state: Mutex<HostState>,
    pci_bridge: Arc<PciBridge>,
    gpu: RwLock<Option<Arc<dyn PciDevice>>>,
}

impl HostBridge {
    pub fn new(ram_size: u64, pci_bridge: Arc<PciBridge>) -> Self {
        let mut regs: BTreeMap<u64, u32> = HOST_BRIDGE_REGS
            .iter()
            .chain(BIU_REGS.iter())
            .map(|&addr| (addr, 0))
            .collect();
        regs.insert(BIU_REG_RAM_SIZE, ram_size as u32);

        let mut config = PciConfigSpace::new(0x1414, 0x5801);
        config.set_class_code(0x06, 0x00, 0x00);

        Self {
            info: DeviceInfo::new("HostBridge", 0xD000_0000, 0xF000_0000, true),
            state: Mutex::new(HostState { config, regs }),
            pci_bridge,
            gpu: RwLock::new(None),
        }
    }

    /// Attaches the graphics chip; its BAR claims accesses ahead of the PCI
    /// bridge.
    pub fn register_gpu(&self, gpu: Arc<dyn PciDevice>) {
        *self.gpu.write().unwrap() = Some(gpu);
    }

    pub fn config_read(&self, addr: u64, data: &mut [u8]) -> BusResult {
        let target = PciConfigAddress::decode(addr);
        if target.bus == 0 && target.dev == 1 {
            let state = self.state.lock().unwrap();
            state.config.read_into(target.reg, data);
            return Ok(());
        }
        self.pci_bridge.config_read(addr, data)
    }

    pub fn config_write(&self, addr: u64, data: &[u8]) -> BusResult {
        let target = PciConfigAddress::decode(addr);
        if target.bus == 0 && target.dev == 1 {
            let mut state = self.state.lock().unwrap();
            state.config.write_from(target.reg, data);
            return Ok(());
        }
        self.pci_bridge.config_write(addr, data)
    }

    fn in_own_window(addr: u64) -> bool {
        (HOST_BRIDGE_REG_BASE..HOST_BRIDGE_REG_END).contains(&addr)
            || (BIU_REG_BASE..BIU_REG_END).contains(&addr)
    }

    fn read_own_reg(&self, addr: u64, data: &mut [u8]) {
        let state = self.state.lock().unwrap();
        match state.regs.get(&addr) {
            Some(&value) => mmio::load_u32(value, data),
            None => {
                tracing::error!(
                    addr = format_args!("{addr:#010x}"),
                    "read of unknown host bridge register"
                );
                data.fill(0);
            }
        }
    }

    fn write_own_reg(&self, addr: u64, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        match state.regs.get_mut(&addr) {
            Some(value) => mmio::store_u32(value, data),
            None => {
                tracing::error!(
                    addr = format_args!("{addr:#010x}"),
                    value = format_args!("{:#x}", mmio::value_u32(data)),
                    "write to unknown host bridge register"
                );
            }
        }
    }

    fn gpu_target(&self, addr: u64) -> Option<Arc<dyn PciDevice>> {
        let gpu = self.gpu.read().unwrap();
        gpu.as_ref()
            .filter(|gpu| gpu.is_address_mapped_in_bar(addr as u32))
            .cloned()
    }
}

impl SystemDevice for HostBridge {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read(&self, addr: u64, data: &mut [u8]) -> BusResult {
        if Self::in_own_window(addr) {
            self.read_own_reg(addr, data);
            return Ok(());
        }
        if let Some(gpu) = self.gpu_target(addr) {
            return gpu.read(addr, data);
        }
        self.pci_bridge.read(addr, data)
    }

    fn write(&self, addr: u64, data: &[u8]) -> BusResult {
        if Self::in_own_window(addr) {
            self.write_own_reg(addr, data);
            return Ok(());
        }
        if let Some(gpu) = self.gpu_target(addr) {
            return gpu.write(addr, data);
        }
        self.pci_bridge.write(addr, data)
    }

    fn fill(&self, addr: u64, value: u8, len: u64) -> BusResult {
        if Self::in_own_window(addr) {
            let buf = [value; 8];
            self.write_own_reg(addr, &buf[..(len as usize).min(8)]);
            return Ok(());
        }
        if let Some(gpu) = self.gpu_target(addr) {
            return gpu.fill(addr, value, len);
        }
        self.pci_bridge.fill(addr, value, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use xenon_base::config::ConsoleRevision;

    fn host() -> HostBridge {
        let bridge = Arc::new(PciBridge::new(ConsoleRevision::Corona));
        HostBridge::new(512 * 1024 * 1024, bridge)
    }

    #[test]
    fn biu_registers_round_trip() {
        let host = host();
        host.write(0xE101_0010, &0xCAFE_F00Du32.to_le_bytes()).unwrap();

        let mut out = [0u8; 4];
        host.read(0xE101_0010, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 0xCAFE_F00D);
    }

    #[test]
    fn ram_size_register_reports_configuration() {
        let host = host();
        let mut out = [0u8; 4];
        host.read(BIU_REG_RAM_SIZE, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 512 * 1024 * 1024);
    }

    #[test]
    fn unknown_register_in_own_window_reads_zero() {
        let host = host();
        let mut out = [0xFFu8; 4];
        host.read(0xE002_0100, &mut out).unwrap();
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn forwards_to_pci_bridge_outside_own_window() {
        let host = host();
        let mut out = [0u8; 4];
        host.read(0xEA00_000C, &mut out).unwrap();
        // Bus IRQL enable register reset value.
        assert_eq!(u32::from_le_bytes(out), 0x7CFF);
    }

    #[test]
    fn own_config_function_is_served_locally() {
        let host = host();
        let addr = u64::from(
            PciConfigAddress {
                bus: 0,
                dev: 1,
                func: 0,
                reg: 0x02,
            }
            .encode(),
        );
        let mut out = [0u8; 2];
        host.config_read(addr, &mut out).unwrap();
        assert_eq!(u16::from_le_bytes(out), 0x5801);
    }
}
