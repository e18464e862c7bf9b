//! System Management Controller.
//!
//! The SMC runs its own scheduler thread and talks to guest software purely
//! through its BAR-relative register file. Three independent duties:
//!
//! - the 16-byte FIFO command protocol (guest writes a message, the SMC
//!   answers in place and optionally raises an SMI),
//! - the periodic clock interrupt while the guest keeps it armed,
//! - bridging the console UART to a pluggable host backend.
//!
//! The FIFO handshake, as real kernels drive it: poll `FIFO_IN_STATUS` for
//! `READY`, write `READY` back (resets the buffer), push four 32-bit words
//! to `FIFO_IN_DATA`, then write `BUSY` to `FIFO_IN_STATUS`. The SMC flips
//! the out status to `BUSY`, re-arms the in status, dispatches on byte 0,
//! writes its reply over the same buffer, and flips the out status to
//! `READY`; with SMI delivery enabled it also latches the pending bit and
//! routes an interrupt.

mod hana;
mod uart;

pub use hana::{baseline as hana_baseline, HANA_REG_COUNT, HANA_REG_REVISION};
pub use uart::{
    create_backend, NullUart, SocketUart, UartBackend, UART_CONFIG_115200_8N1,
    UART_STATUS_DATA_IN, UART_STATUS_EMPTY,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use xenon_base::config::{ConsoleRevision, SmcConfig};
use xenon_base::lifecycle::Lifecycle;

use crate::device::BusResult;
use crate::mmio;
use crate::pci::{prio, PciBridge, PciConfigSpace, PciDevice};

// Register offsets within BAR0.
const UART_BYTE_OUT_REG: u8 = 0x10;
const UART_BYTE_IN_REG: u8 = 0x14;
const UART_STATUS_REG: u8 = 0x18;
const UART_CONFIG_REG: u8 = 0x1C;
const SMI_INT_STATUS_REG: u8 = 0x50;
const SMI_INT_ACK_REG: u8 = 0x58;
const SMI_INT_ENABLED_REG: u8 = 0x5C;
const CLCK_INT_ENABLED_REG: u8 = 0x64;
const CLCK_INT_STATUS_REG: u8 = 0x6C;
const FIFO_IN_DATA_REG: u8 = 0x80;
const FIFO_IN_STATUS_REG: u8 = 0x84;
const FIFO_OUT_DATA_REG: u8 = 0x90;
const FIFO_OUT_STATUS_REG: u8 = 0x94;

pub const FIFO_STATUS_READY: u32 = 0x4;
pub const FIFO_STATUS_BUSY: u32 = 0x0;

pub const SMI_INT_ENABLED: u32 = 0xC;
pub const SMI_INT_NONE: u32 = 0x0;
pub const SMI_INT_PENDING: u32 = 0x1000_0000;

pub const CLOCK_INT_ENABLED: u32 = 0x1000_0000;
pub const CLOCK_INT_READY: u32 = 0x1;
pub const CLOCK_INT_TAKEN: u32 = 0x3;

/// Interval between clock interrupts while the guest keeps them armed. An
/// emulator choice, not hardware-measured.
pub const CLOCK_TICK_PERIOD: Duration = Duration::from_millis(500);

const FIFO_LEN: usize = 16;
pub const SMC_BAR_SIZE: u32 = 0x100;

/// FIFO command IDs (message byte 0). The first reply byte always echoes
/// the ID.
pub mod cmd {
    pub const QUERY_VERSION: u8 = 0x01;
    pub const QUERY_RTC: u8 = 0x04;
    pub const QUERY_TEMP_SENS: u8 = 0x07;
    pub const QUERY_TRAY_STATE: u8 = 0x0A;
    pub const QUERY_AVPACK: u8 = 0x0F;
    pub const I2C_READ_WRITE: u8 = 0x11;
    pub const PWRON_TYPE: u8 = 0x12;
    pub const FIFO_TEST: u8 = 0x13;
    pub const QUERY_IR_ADDRESS: u8 = 0x16;
    pub const QUERY_TILT_SENSOR: u8 = 0x17;
    pub const READ_82_INT: u8 = 0x1E;
    pub const READ_8E_INT: u8 = 0x20;
    pub const SET_STANDBY: u8 = 0x82;
    pub const SET_TIME: u8 = 0x85;
    pub const SET_FAN_ALGORITHM: u8 = 0x88;
    pub const SET_FAN_SPEED_CPU: u8 = 0x89;
    pub const SET_DVD_TRAY: u8 = 0x8B;
    pub const SET_POWER_LED: u8 = 0x8C;
    pub const SET_AUDIO_MUTE: u8 = 0x8D;
    pub const ARGON_RELATED: u8 = 0x90;
    pub const SET_FAN_SPEED_GPU: u8 = 0x94;
    pub const SET_IR_ADDRESS: u8 = 0x95;
    pub const SET_DVD_TRAY_SECURE: u8 = 0x97;
    pub const SET_FP_LEDS: u8 = 0x99;
    pub const SET_RTC_WAKE: u8 = 0x9A;
    pub const ANA_RELATED: u8 = 0x9B;
    pub const SET_ASYNC_OPERATION: u8 = 0x9C;
    pub const SET_82_INT: u8 = 0x9D;
    pub const SET_9F_INT: u8 = 0x9E;
}

/// Tray states reported by `QUERY_TRAY_STATE`.
pub mod tray {
    pub const OPEN: u8 = 0x60;
    pub const HALF_OPEN: u8 = 0x61;
    pub const CLOSED: u8 = 0x62;
    pub const OPENING: u8 = 0x63;
    pub const CLOSING: u8 = 0x64;
}

/// `SET_STANDBY` subtypes with known behavior.
const STANDBY_SHUTDOWN: u8 = 0x01;
const STANDBY_REBOOT: u8 = 0x04;

struct SmcState {
    uart_out: u32,
    uart_in: u32,
    uart_status: u32,
    uart_config: u32,
    smi_int_pending: u32,
    smi_int_ack: u32,
    smi_int_enabled: u32,
    clock_int_enabled: u32,
    clock_int_status: u32,
    fifo_in_status: u32,
    fifo_out_status: u32,
    fifo_buffer: [u8; FIFO_LEN],
    fifo_cursor: usize,
    uart: Box<dyn UartBackend>,
    hana: [u32; HANA_REG_COUNT],
    av_pack: u8,
    power_on_reason: u8,
    tray_state: u8,
}

struct SmcShared {
    config_space: Mutex<PciConfigSpace>,
    state: Mutex<SmcState>,
    thread_running: AtomicBool,
    lifecycle: Arc<Lifecycle>,
    bridge: Weak<PciBridge>,
    reboot: Arc<dyn Fn(u32) + Send + Sync>,
}

pub struct Smc {
    shared: Arc<SmcShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Smc {
    /// Builds the SMC and starts its scheduler thread.
    ///
    /// The bridge handle is weak: the bridge owns the device, the device
    /// only calls back for interrupt routing.
    pub fn new(
        config: &SmcConfig,
        revision: ConsoleRevision,
        bridge: Weak<PciBridge>,
        lifecycle: Arc<Lifecycle>,
        reboot: Arc<dyn Fn(u32) + Send + Sync>,
    ) -> Arc<Self> {
        tracing::info!("initializing SMC core");

        let mut config_space = PciConfigSpace::new(0x1414, 0x580D);
        config_space.set_class_code(0x08, 0x80, 0x00);
        config_space.set_bar_size(0, SMC_BAR_SIZE);
        config_space.set_interrupt(prio::SMM, 0x01);

        let state = SmcState {
            uart_out: 0,
            uart_in: 0,
            uart_status: UART_STATUS_EMPTY,
            uart_config: 0,
            smi_int_pending: SMI_INT_NONE,
            smi_int_ack: 0,
            smi_int_enabled: 0,
            clock_int_enabled: 0,
            clock_int_status: 0,
            fifo_in_status: FIFO_STATUS_READY,
            fifo_out_status: FIFO_STATUS_BUSY,
            fifo_buffer: [0; FIFO_LEN],
            fifo_cursor: 0,
            uart: create_backend(config),
            hana: hana::baseline(revision),
            av_pack: config.av_pack_type,
            power_on_reason: config.power_on_reason,
            tray_state: tray::CLOSED,
        };

        let shared = Arc::new(SmcShared {
            config_space: Mutex::new(config_space),
            state: Mutex::new(state),
            thread_running: AtomicBool::new(true),
            lifecycle,
            bridge,
            reboot,
        });

        let worker = thread::Builder::new()
            .name("smc".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || smc_main(shared)
            })
            .expect("failed to spawn SMC thread");

        Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl Drop for Smc {
    fn drop(&mut self) {
        tracing::info!("shutting SMC down");
        self.shared.thread_running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
        self.shared.state.lock().unwrap().uart.shutdown();
    }
}

impl PciDevice for Smc {
    fn name(&self) -> &str {
        "SMC"
    }

    fn read(&self, addr: u64, data: &mut [u8]) -> BusResult {
        let offset = addr as u8;
        let mut state = self.shared.state.lock().unwrap();
        match offset {
            UART_BYTE_OUT_REG => {
                if let Some(byte) = state.uart.read() {
                    state.uart_out = u32::from(byte);
                    mmio::load_u32(state.uart_out, data);
                }
            }
            UART_STATUS_REG => {
                state.uart_status = state.uart.read_status();
                if state.uart.setup_needed() {
                    // Some loaders send bytes without ever configuring the
                    // line; bring the backend up at the standard rate.
                    setup_uart(&mut state, UART_CONFIG_115200_8N1);
                }
                mmio::load_u32(state.uart_status, data);
            }
            UART_CONFIG_REG => mmio::load_u32(state.uart_config, data),
            SMI_INT_STATUS_REG => mmio::load_u32(state.smi_int_pending, data),
            SMI_INT_ACK_REG => mmio::load_u32(state.smi_int_ack, data),
            SMI_INT_ENABLED_REG => mmio::load_u32(state.smi_int_enabled, data),
            CLCK_INT_ENABLED_REG => mmio::load_u32(state.clock_int_enabled, data),
            CLCK_INT_STATUS_REG => mmio::load_u32(state.clock_int_status, data),
            FIFO_IN_STATUS_REG => mmio::load_u32(state.fifo_in_status, data),
            FIFO_OUT_STATUS_REG => mmio::load_u32(state.fifo_out_status, data),
            FIFO_OUT_DATA_REG => {
                let cursor = state.fifo_cursor;
                let n = data.len().min(FIFO_LEN.saturating_sub(cursor));
                data[..n].copy_from_slice(&state.fifo_buffer[cursor..cursor + n]);
                state.fifo_cursor = (cursor + 4).min(FIFO_LEN);
            }
            _ => {
                tracing::error!(
                    offset = format_args!("{offset:#x}"),
                    "read of unknown SMC register"
                );
                data.fill(0);
            }
        }
        Ok(())
    }

    fn write(&self, addr: u64, data: &[u8]) -> BusResult {
        let mut state = self.shared.state.lock().unwrap();
        write_reg(&mut state, addr as u8, data);
        Ok(())
    }

    fn fill(&self, addr: u64, value: u8, len: u64) -> BusResult {
        let buf = [value; 8];
        let mut state = self.shared.state.lock().unwrap();
        write_reg(&mut state, addr as u8, &buf[..(len as usize).min(8)]);
        Ok(())
    }

    fn config_read(&self, addr: u64, data: &mut [u8]) {
        self.shared
            .config_space
            .lock()
            .unwrap()
            .read_into(addr as u8, data);
    }

    fn config_write(&self, addr: u64, data: &[u8]) {
        self.shared
            .config_space
            .lock()
            .unwrap()
            .write_from(addr as u8, data);
    }

    fn is_address_mapped_in_bar(&self, addr: u32) -> bool {
        self.shared.config_space.lock().unwrap().maps_address(addr)
    }
}

fn write_reg(state: &mut SmcState, offset: u8, data: &[u8]) {
    match offset {
        UART_BYTE_IN_REG => {
            mmio::store_u32(&mut state.uart_in, data);
            state.uart.write(data[0]);
        }
        UART_CONFIG_REG => {
            mmio::store_u32(&mut state.uart_config, data);
            if state.uart.setup_needed() {
                setup_uart(state, mmio::value_u32(data));
            }
        }
        SMI_INT_STATUS_REG => mmio::store_u32(&mut state.smi_int_pending, data),
        SMI_INT_ACK_REG => mmio::store_u32(&mut state.smi_int_ack, data),
        SMI_INT_ENABLED_REG => mmio::store_u32(&mut state.smi_int_enabled, data),
        CLCK_INT_ENABLED_REG => mmio::store_u32(&mut state.clock_int_enabled, data),
        CLCK_INT_STATUS_REG => mmio::store_u32(&mut state.clock_int_status, data),
        FIFO_IN_STATUS_REG => {
            mmio::store_u32(&mut state.fifo_in_status, data);
            if state.fifo_in_status == FIFO_STATUS_READY {
                // A message is about to arrive.
                state.fifo_buffer = [0; FIFO_LEN];
                state.fifo_cursor = 0;
            }
        }
        FIFO_OUT_STATUS_REG => {
            mmio::store_u32(&mut state.fifo_out_status, data);
            if state.fifo_out_status == FIFO_STATUS_READY {
                // The reply is about to be consumed.
                state.fifo_cursor = 0;
            }
        }
        FIFO_IN_DATA_REG => {
            let cursor = state.fifo_cursor;
            let n = data.len().min(FIFO_LEN.saturating_sub(cursor));
            state.fifo_buffer[cursor..cursor + n].copy_from_slice(&data[..n]);
            state.fifo_cursor = (cursor + 4).min(FIFO_LEN);
        }
        _ => {
            tracing::error!(
                offset = format_args!("{offset:#x}"),
                value = format_args!("{:#x}", mmio::value_u32(data)),
                "write to unknown SMC register"
            );
        }
    }
}

fn setup_uart(state: &mut SmcState, config_word: u32) {
    tracing::info!(config = format_args!("{config_word:#x}"), "initializing UART");
    state.uart.init(config_word);
}

fn smc_main(shared: Arc<SmcShared>) {
    {
        // Advertise readiness for the first message.
        let mut state = shared.state.lock().unwrap();
        state.fifo_in_status = FIFO_STATUS_READY;
    }

    let mut last_tick = Instant::now();
    while shared.thread_running.load(Ordering::SeqCst) && shared.lifecycle.running() {
        thread::sleep(Duration::from_millis(1));
        service_fifo(&shared);
        service_clock(&shared, &mut last_tick);
    }
}

/// Outcome of a command dispatch that needs handling after the state lock
/// is released.
#[derive(Default)]
struct Outcome {
    suppress_reply: bool,
    reboot_reason: Option<u8>,
}

fn service_fifo(shared: &SmcShared) {
    let mut state = shared.state.lock().unwrap();
    if state.fifo_in_status != FIFO_STATUS_BUSY {
        return;
    }

    // Software polls the out status for READY; keep it busy while the reply
    // is being assembled, and re-arm the in status for the next message.
    state.fifo_out_status = FIFO_STATUS_BUSY;
    state.fifo_in_status = FIFO_STATUS_READY;

    let outcome = dispatch_command(shared, &mut state);

    state.fifo_out_status = FIFO_STATUS_READY;

    let fire_smi =
        !outcome.suppress_reply && (state.smi_int_enabled & SMI_INT_ENABLED) != 0;
    if fire_smi {
        state.smi_int_pending = SMI_INT_PENDING;
    }
    drop(state);

    // Collaborators are only invoked with the device lock released.
    if let Some(reason) = outcome.reboot_reason {
        (shared.reboot)(u32::from(reason));
    }
    if fire_smi {
        if let Some(bridge) = shared.bridge.upgrade() {
            bridge.route_interrupt(prio::SMM);
        }
    }
}

fn dispatch_command(shared: &SmcShared, state: &mut MutexGuard<'_, SmcState>) -> Outcome {
    let mut outcome = Outcome::default();
    let id = state.fifo_buffer[0];
    match id {
        cmd::PWRON_TYPE => {
            state.fifo_buffer = [0; FIFO_LEN];
            state.fifo_buffer[0] = cmd::PWRON_TYPE;
            state.fifo_buffer[1] = state.power_on_reason;
        }
        cmd::QUERY_RTC => {
            // Stub: the RTC offset is not modeled.
            state.fifo_buffer = [0; FIFO_LEN];
            state.fifo_buffer[0] = cmd::QUERY_RTC;
            state.fifo_buffer[1] = 0;
        }
        cmd::QUERY_TEMP_SENS => {
            state.fifo_buffer[0] = cmd::QUERY_TEMP_SENS;
            // Four 16-bit little-endian readings: CPU, GPU, eDRAM, chassis.
            state.fifo_buffer[1..9]
                .copy_from_slice(&[0x24, 0x1B, 0x2F, 0xA4, 0x2C, 0x24, 0x26, 0x2C]);
        }
        cmd::QUERY_TRAY_STATE => {
            state.fifo_buffer[0] = cmd::QUERY_TRAY_STATE;
            state.fifo_buffer[1] = state.tray_state;
        }
        cmd::QUERY_AVPACK => {
            state.fifo_buffer[0] = cmd::QUERY_AVPACK;
            state.fifo_buffer[1] = state.av_pack;
        }
        cmd::I2C_READ_WRITE => dispatch_i2c(state),
        cmd::QUERY_VERSION => {
            state.fifo_buffer[0] = cmd::QUERY_VERSION;
            state.fifo_buffer[1] = 0x41;
            state.fifo_buffer[2] = 0x02;
            state.fifo_buffer[3] = 0x03;
        }
        cmd::SET_STANDBY => {
            state.fifo_buffer[0] = cmd::SET_STANDBY;
            match state.fifo_buffer[1] {
                STANDBY_SHUTDOWN => {
                    tracing::info!("standby: guest requested shutdown");
                    shared.lifecycle.request_shutdown();
                }
                STANDBY_REBOOT => {
                    tracing::info!("standby: guest requested reboot");
                    outcome.reboot_reason = Some(state.fifo_buffer[2]);
                }
                subtype => {
                    // Meaning unknown; do not guess.
                    tracing::warn!(
                        subtype = format_args!("{subtype:#04x}"),
                        "unimplemented SET_STANDBY subtype"
                    );
                }
            }
        }
        cmd::SET_FP_LEDS => {
            // Handled without a reply: no SMI after this command.
            tracing::warn!("unimplemented SMC command: SET_FP_LEDS");
            outcome.suppress_reply = true;
        }
        id if unimplemented_cmd_name(id).is_some() => {
            tracing::warn!(
                cmd = unimplemented_cmd_name(id).unwrap_or("?"),
                "unimplemented SMC command"
            );
        }
        id => {
            tracing::warn!(id = format_args!("{id:#04x}"), "unknown SMC command");
        }
    }
    outcome
}

fn dispatch_i2c(state: &mut MutexGuard<'_, SmcState>) {
    let sub_op = state.fifo_buffer[1];
    state.fifo_buffer[0] = cmd::I2C_READ_WRITE;
    match sub_op {
        0x03 => {
            tracing::info!("i2c: DDC lock");
            state.fifo_buffer[1] = 0;
        }
        0x05 => {
            tracing::info!("i2c: DDC unlock");
            state.fifo_buffer[1] = 0;
        }
        // SMBus / I2C read.
        0x10 => {
            state.fifo_buffer[1] = 0;
            if state.fifo_buffer[5] == 0xF0 {
                let index = usize::from(state.fifo_buffer[6]);
                let word = state.hana[index];
                state.fifo_buffer[4..8].copy_from_slice(&word.to_le_bytes());
            } else {
                let address = i2c_address(state.fifo_buffer[3], state.fifo_buffer[6]);
                match address {
                    0x102 => {
                        state.fifo_buffer[3] = 0x53;
                        state.fifo_buffer[4] = 0x92;
                        state.fifo_buffer[5] = 0;
                        state.fifo_buffer[6] = 0;
                    }
                    _ => {
                        tracing::warn!(
                            address = format_args!("{address:#x}"),
                            "i2c: read of unimplemented address, returning 0"
                        );
                        state.fifo_buffer[3..7].fill(0);
                    }
                }
            }
        }
        // DDC read.
        0x11 => {
            tracing::warn!(
                address = format_args!("{:#x}", u16::from(state.fifo_buffer[6]) + 0x1D0),
                "i2c: DDC read stub, returning 0"
            );
            state.fifo_buffer[1] = 0;
            state.fifo_buffer[3..7].fill(0);
        }
        // I2C write.
        0x20 => {
            tracing::warn!(
                address = format_args!("{:#x}", i2c_address(state.fifo_buffer[3], state.fifo_buffer[6])),
                value = format_args!("{:#x}", state.fifo_buffer[7]),
                "i2c: write stub"
            );
            state.fifo_buffer[1] = 0;
        }
        // DDC write.
        0x21 => {
            tracing::warn!(
                address = format_args!("{:#x}", u16::from(state.fifo_buffer[6]) + 0x1D0),
                value = format_args!("{:#x}", state.fifo_buffer[7]),
                "i2c: DDC write stub"
            );
            state.fifo_buffer[1] = 0;
        }
        // SMBus write (HANA register file).
        0x60 => {
            state.fifo_buffer[1] = 0;
            let index = usize::from(state.fifo_buffer[6]);
            state.hana[index] = u32::from_le_bytes([
                state.fifo_buffer[8],
                state.fifo_buffer[9],
                state.fifo_buffer[10],
                state.fifo_buffer[11],
            ]);
        }
        other => {
            tracing::warn!(
                sub_op = format_args!("{other:#04x}"),
                "i2c: unimplemented sub-operation"
            );
            state.fifo_buffer[1] = 0x1;
        }
    }
}

/// Bus address of a non-HANA I2C read/write: the PMW and audio parts sit on
/// two pages selected by the device byte.
fn i2c_address(device: u8, register: u8) -> u16 {
    u16::from(register) + if device == 0x8D { 0x200 } else { 0x100 }
}

fn unimplemented_cmd_name(id: u8) -> Option<&'static str> {
    Some(match id {
        cmd::FIFO_TEST => "FIFO_TEST",
        cmd::QUERY_IR_ADDRESS => "QUERY_IR_ADDRESS",
        cmd::QUERY_TILT_SENSOR => "QUERY_TILT_SENSOR",
        cmd::READ_82_INT => "READ_82_INT",
        cmd::READ_8E_INT => "READ_8E_INT",
        cmd::SET_TIME => "SET_TIME",
        cmd::SET_FAN_ALGORITHM => "SET_FAN_ALGORITHM",
        cmd::SET_FAN_SPEED_CPU => "SET_FAN_SPEED_CPU",
        cmd::SET_DVD_TRAY => "SET_DVD_TRAY",
        cmd::SET_POWER_LED => "SET_POWER_LED",
        cmd::SET_AUDIO_MUTE => "SET_AUDIO_MUTE",
        cmd::ARGON_RELATED => "ARGON_RELATED",
        cmd::SET_FAN_SPEED_GPU => "SET_FAN_SPEED_GPU",
        cmd::SET_IR_ADDRESS => "SET_IR_ADDRESS",
        cmd::SET_DVD_TRAY_SECURE => "SET_DVD_TRAY_SECURE",
        cmd::SET_RTC_WAKE => "SET_RTC_WAKE",
        cmd::ANA_RELATED => "ANA_RELATED",
        cmd::SET_ASYNC_OPERATION => "SET_ASYNC_OPERATION",
        cmd::SET_82_INT => "SET_82_INT",
        cmd::SET_9F_INT => "SET_9F_INT",
        _ => return None,
    })
}

fn service_clock(shared: &SmcShared, last_tick: &mut Instant) {
    let mut state = shared.state.lock().unwrap();
    if state.clock_int_enabled != CLOCK_INT_ENABLED
        || state.clock_int_status != CLOCK_INT_READY
    {
        return;
    }
    if last_tick.elapsed() < CLOCK_TICK_PERIOD {
        return;
    }

    *last_tick = Instant::now();
    state.clock_int_status = CLOCK_INT_TAKEN;
    drop(state);

    if let Some(bridge) = shared.bridge.upgrade() {
        bridge.route_interrupt(prio::CLOCK);
    }
}
