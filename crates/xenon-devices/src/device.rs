//! Common device attributes and the uniform access contract.

use thiserror::Error;

/// Errors surfaced by MMIO dispatch.
///
/// These are reported by return value and by log, never by unwinding: a
/// missing peripheral must not abort the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    /// No device covers the target address.
    #[error("no device maps guest address {addr:#010x}")]
    Unmapped { addr: u64 },
    /// The access width is not one of the widths the fabric carries.
    #[error("unsupported access size {size} at {addr:#010x}")]
    UnsupportedSize { addr: u64, size: usize },
}

pub type BusResult = Result<(), BusError>;

/// Immutable identity and placement of a device on the fabric.
///
/// `start_addr..end_addr` is half-open. The name is unique within the
/// catalog and is the identity used for lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub start_addr: u64,
    pub end_addr: u64,
    /// Located on the SoC die rather than the PCI bus; only affects default
    /// routing.
    pub soc_device: bool,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, start_addr: u64, end_addr: u64, soc_device: bool) -> Self {
        Self {
            name: name.into(),
            start_addr,
            end_addr,
            soc_device,
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start_addr && addr < self.end_addr
    }

    pub fn size(&self) -> u64 {
        self.end_addr - self.start_addr
    }
}

/// Capability interface every device on the root bus implements.
///
/// Methods take `&self`: each device guards its own mutable state with a
/// single internal lock, acquired at entry and released before invoking any
/// collaborator that might itself take a lock. Never hold a device lock
/// while calling another device's MMIO entry point.
pub trait SystemDevice: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    fn read(&self, addr: u64, data: &mut [u8]) -> BusResult;
    fn write(&self, addr: u64, data: &[u8]) -> BusResult;
    fn fill(&self, addr: u64, value: u8, len: u64) -> BusResult;
}
