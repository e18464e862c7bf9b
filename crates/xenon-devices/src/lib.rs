//! Device models for the Xenon platform core: the root address-space router,
//! the PCI/PCIe interconnect (host bridge, PCI bridge, per-device
//! configuration space), the System Management Controller, and the NAND
//! gateway.
//!
//! Guest-visible behavior is driven entirely through MMIO: CPU cores hand
//! physical accesses to [`bus::RootBus`], which steers them to the device
//! whose range covers the address. Devices assert interrupts back through
//! [`pci::PciBridge::route_interrupt`], which consults the per-source
//! priority registers and delivers to the CPU interrupt block.

#![forbid(unsafe_code)]

pub mod bus;
pub mod device;
pub mod mmio;
pub mod nand;
pub mod pci;
pub mod smc;

pub use bus::RootBus;
pub use device::{BusError, DeviceInfo, SystemDevice};
