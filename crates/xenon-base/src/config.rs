//! Configuration consumed at construction time. Parsing lives with the
//! launcher; these are the typed values the core receives.

use serde::Deserialize;

/// Motherboard revision. Affects the PCI bridge revision ID and the
/// HANA/ANA baseline register image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ConsoleRevision {
    Xenon,
    Zephyr,
    Falcon,
    Jasper,
    Trinity,
    Corona,
    Corona4GB,
    Winchester,
}

impl ConsoleRevision {
    /// Fat consoles and slims ship different HANA/ANA baselines.
    pub fn is_fat(self) -> bool {
        matches!(
            self,
            ConsoleRevision::Xenon
                | ConsoleRevision::Zephyr
                | ConsoleRevision::Falcon
                | ConsoleRevision::Jasper
        )
    }
}

/// Which backend carries the SMC's UART traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UartSystem {
    /// Discard everything.
    #[default]
    Null,
    /// TCP socket that also echoes transmitted bytes to stdout.
    Print,
    /// TCP socket only.
    Socket,
    /// Host serial port (Windows COM).
    Vcom,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SmcConfig {
    pub uart_system: UartSystem,
    pub socket_ip: String,
    pub socket_port: u16,
    pub com_port: String,
    /// AV-pack detection code reported to the kernel (0x1F = HDMI).
    pub av_pack_type: u8,
    /// Power-on cause reported to the kernel (0x11 = power button).
    pub power_on_reason: u8,
}

impl Default for SmcConfig {
    fn default() -> Self {
        Self {
            uart_system: UartSystem::Null,
            socket_ip: "127.0.0.1".into(),
            socket_port: 7000,
            com_port: "COM2".into(),
            av_pack_type: 0x1F,
            power_on_reason: 0x11,
        }
    }
}
