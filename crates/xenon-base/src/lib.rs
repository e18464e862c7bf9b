//! Process-wide building blocks shared by every emulated component: the
//! run/pause/shutdown flags, the OS signal handler that drives them, the
//! interrupt-controller contract, and the configuration types consumed at
//! construction time.

#![forbid(unsafe_code)]

pub mod config;
pub mod interrupts;
pub mod lifecycle;
pub mod signal;

pub use config::{ConsoleRevision, SmcConfig, UartSystem};
pub use interrupts::InterruptController;
pub use lifecycle::Lifecycle;
