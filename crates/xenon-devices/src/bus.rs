//! Root address-space router.
//!
//! Dispatches guest physical reads/writes/fills to the device whose range
//! covers the address. Devices are scanned in registration order; the first
//! range hit wins. The PCI configuration window is decoded here and handed
//! to the host bridge as a configuration transaction rather than a plain
//! MMIO access.

use std::sync::{Arc, RwLock};

use crate::device::{BusError, BusResult, SystemDevice};
use crate::pci::HostBridge;

/// Guest window carrying encoded `{bus, dev, func, reg}` configuration
/// transactions.
pub const PCI_CONFIG_REGION_START: u64 = 0xD000_0000;
pub const PCI_CONFIG_REGION_END: u64 = 0xD100_0000;

#[derive(Default)]
pub struct RootBus {
    devices: RwLock<Vec<Arc<dyn SystemDevice>>>,
    host_bridge: RwLock<Option<Arc<HostBridge>>>,
}

impl RootBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device. Order matters: earlier registrations shadow later
    /// ones on overlapping ranges.
    pub fn register(&self, device: Arc<dyn SystemDevice>) {
        tracing::info!(
            name = %device.info().name,
            start = format_args!("{:#010x}", device.info().start_addr),
            end = format_args!("{:#010x}", device.info().end_addr),
            "attached device"
        );
        self.devices.write().unwrap().push(device);
    }

    /// Registers the host bridge, which additionally fields configuration
    /// transactions for the PCI config window.
    pub fn register_host_bridge(&self, bridge: Arc<HostBridge>) {
        *self.host_bridge.write().unwrap() = Some(Arc::clone(&bridge));
        self.register(bridge);
    }

    pub fn read(&self, addr: u64, data: &mut [u8]) -> BusResult {
        check_size(addr, data.len())?;

        if let Some(bridge) = self.config_target(addr) {
            return bridge.config_read(addr, data);
        }

        if let Some(device) = self.lookup(addr) {
            return device.read(addr, data);
        }

        // PCI convention: absent targets float high.
        data.fill(0xFF);
        tracing::error!(addr = format_args!("{addr:#010x}"), "read from unmapped address");
        Err(BusError::Unmapped { addr })
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> BusResult {
        check_size(addr, data.len())?;

        if let Some(bridge) = self.config_target(addr) {
            return bridge.config_write(addr, data);
        }

        if let Some(device) = self.lookup(addr) {
            return device.write(addr, data);
        }

        tracing::error!(
            addr = format_args!("{addr:#010x}"),
            value = format_args!("{:#x}", crate::mmio::value_u32(data)),
            "write to unmapped address"
        );
        Err(BusError::Unmapped { addr })
    }

    pub fn fill(&self, addr: u64, value: u8, len: u64) -> BusResult {
        check_size(addr, len as usize)?;

        if let Some(device) = self.lookup(addr) {
            return device.fill(addr, value, len);
        }

        tracing::error!(addr = format_args!("{addr:#010x}"), "fill of unmapped address");
        Err(BusError::Unmapped { addr })
    }

    fn lookup(&self, addr: u64) -> Option<Arc<dyn SystemDevice>> {
        let devices = self.devices.read().unwrap();
        devices.iter().find(|dev| dev.info().contains(addr)).cloned()
    }

    fn config_target(&self, addr: u64) -> Option<Arc<HostBridge>> {
        if !(PCI_CONFIG_REGION_START..PCI_CONFIG_REGION_END).contains(&addr) {
            return None;
        }
        self.host_bridge.read().unwrap().clone()
    }
}

fn check_size(addr: u64, size: usize) -> BusResult {
    if matches!(size, 1 | 2 | 4 | 8) {
        Ok(())
    } else {
        // Larger transfers are the caller's responsibility to split.
        tracing::error!(addr = format_args!("{addr:#010x}"), size, "unsupported access size");
        Err(BusError::UnsupportedSize { addr, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceInfo;
    use std::sync::Mutex;

    struct ScratchDevice {
        info: DeviceInfo,
        bytes: Mutex<Vec<u8>>,
    }

    impl ScratchDevice {
        fn new(name: &str, start: u64, end: u64) -> Self {
            Self {
                info: DeviceInfo::new(name, start, end, true),
                bytes: Mutex::new(vec![0; (end - start) as usize]),
            }
        }
    }

    impl SystemDevice for ScratchDevice {
        fn info(&self) -> &DeviceInfo {
            &self.info
        }

        fn read(&self, addr: u64, data: &mut [u8]) -> BusResult {
            let off = (addr - self.info.start_addr) as usize;
            let bytes = self.bytes.lock().unwrap();
            data.copy_from_slice(&bytes[off..off + data.len()]);
            Ok(())
        }

        fn write(&self, addr: u64, data: &[u8]) -> BusResult {
            let off = (addr - self.info.start_addr) as usize;
            let mut bytes = self.bytes.lock().unwrap();
            bytes[off..off + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn fill(&self, addr: u64, value: u8, len: u64) -> BusResult {
            let off = (addr - self.info.start_addr) as usize;
            let mut bytes = self.bytes.lock().unwrap();
            bytes[off..off + len as usize].fill(value);
            Ok(())
        }
    }

    #[test]
    fn routes_to_first_covering_device() {
        let bus = RootBus::new();
        bus.register(Arc::new(ScratchDevice::new("a", 0x1000, 0x2000)));
        bus.register(Arc::new(ScratchDevice::new("b", 0x1800, 0x3000)));

        // 0x1900 is covered by both; "a" registered first.
        bus.write(0x1900, &[0xAB]).unwrap();
        let mut got = [0u8; 1];
        bus.read(0x1900, &mut got).unwrap();
        assert_eq!(got, [0xAB]);

        // "b" alone covers 0x2800.
        bus.write(0x2800, &[0xCD]).unwrap();
        bus.read(0x2800, &mut got).unwrap();
        assert_eq!(got, [0xCD]);
    }

    #[test]
    fn unmapped_read_floats_high() {
        let bus = RootBus::new();
        let mut data = [0u8; 4];
        let err = bus.read(0xC000_0000, &mut data).unwrap_err();
        assert_eq!(err, BusError::Unmapped { addr: 0xC000_0000 });
        assert_eq!(data, [0xFF; 4]);
    }

    #[test]
    fn unmapped_write_has_no_side_effects() {
        let bus = RootBus::new();
        bus.register(Arc::new(ScratchDevice::new("a", 0x1000, 0x2000)));
        assert!(bus.write(0x4000, &[1, 2, 3, 4]).is_err());

        let mut got = [0u8; 4];
        bus.read(0x1000, &mut got).unwrap();
        assert_eq!(got, [0; 4]);
    }

    #[test]
    fn rejects_odd_sizes() {
        let bus = RootBus::new();
        bus.register(Arc::new(ScratchDevice::new("a", 0x1000, 0x2000)));
        let mut data = [0u8; 3];
        assert_eq!(
            bus.read(0x1000, &mut data).unwrap_err(),
            BusError::UnsupportedSize { addr: 0x1000, size: 3 }
        );
    }

    #[test]
    fn fill_reaches_device() {
        let bus = RootBus::new();
        bus.register(Arc::new(ScratchDevice::new("a", 0x1000, 0x2000)));
        bus.fill(0x1100, 0x5A, 8).unwrap();
        let mut got = [0u8; 8];
        bus.read(0x1100, &mut got).unwrap();
        assert_eq!(got, [0x5A; 8]);
    }
}
