//! Platform assembly: wires the root bus, the host and PCI bridges, RAM,
//! and the SMC into a runnable Xenon core. CPU cores drive the result
//! through [`xenon_devices::RootBus`]; peripherals interrupt back through
//! the bridge and the caller-provided interrupt controller.

#![forbid(unsafe_code)]

mod ram;

pub use ram::Ram;

use std::sync::Arc;

use xenon_base::config::{ConsoleRevision, SmcConfig};
use xenon_base::interrupts::InterruptController;
use xenon_base::lifecycle::Lifecycle;
use xenon_devices::nand::{FlashController, Nand, NAND_END, NAND_START};
use xenon_devices::pci::{HostBridge, PciBridge, PciDevice};
use xenon_devices::smc::Smc;
use xenon_devices::RootBus;

#[derive(Debug, Clone)]
pub struct SocConfig {
    pub revision: ConsoleRevision,
    pub smc: SmcConfig,
    pub ram_size: u64,
}

impl Default for SocConfig {
    fn default() -> Self {
        Self {
            revision: ConsoleRevision::Corona,
            smc: SmcConfig::default(),
            ram_size: 512 * 1024 * 1024,
        }
    }
}

/// The assembled core. Construction order is load-bearing: bridges are
/// created before the devices that hold weak handles to them, and the whole
/// platform is built before any CPU thread starts.
pub struct XenonSoc {
    pub bus: Arc<RootBus>,
    pub ram: Arc<Ram>,
    pub host_bridge: Arc<HostBridge>,
    pub pci_bridge: Arc<PciBridge>,
    pub smc: Arc<Smc>,
    lifecycle: Arc<Lifecycle>,
}

impl XenonSoc {
    pub fn new(
        config: SocConfig,
        iic: Arc<dyn InterruptController>,
        lifecycle: Arc<Lifecycle>,
        reboot: Arc<dyn Fn(u32) + Send + Sync>,
    ) -> Self {
        tracing::info!(revision = ?config.revision, "assembling platform");

        let pci_bridge = Arc::new(PciBridge::new(config.revision));
        pci_bridge.register_iic(iic);

        let smc = Smc::new(
            &config.smc,
            config.revision,
            Arc::downgrade(&pci_bridge),
            Arc::clone(&lifecycle),
            reboot,
        );
        pci_bridge.add_device(Arc::clone(&smc) as Arc<dyn PciDevice>);

        let host_bridge = Arc::new(HostBridge::new(config.ram_size, Arc::clone(&pci_bridge)));
        let ram = Arc::new(Ram::new(config.ram_size));

        let bus = Arc::new(RootBus::new());
        bus.register(Arc::clone(&ram) as Arc<dyn xenon_devices::SystemDevice>);
        bus.register_host_bridge(Arc::clone(&host_bridge));

        Self {
            bus,
            ram,
            host_bridge,
            pci_bridge,
            smc,
            lifecycle,
        }
    }

    /// Maps the boot NAND at its usual window, backed by the given flash
    /// controller.
    pub fn attach_nand(&self, sfcx: Arc<dyn FlashController>) {
        self.bus
            .register(Arc::new(Nand::new(sfcx, NAND_START, NAND_END)));
    }

    /// Attaches the graphics chip behind the host bridge.
    pub fn attach_gpu(&self, gpu: Arc<dyn PciDevice>) {
        self.host_bridge.register_gpu(gpu);
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }
}
