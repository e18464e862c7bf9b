//! Shared fixtures for platform tests: an interrupt recorder and guest-eye
//! helpers that drive the fabric exactly the way firmware does (config
//! transactions through the config window, device traffic through BARs).

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use xenon_base::interrupts::InterruptController;
use xenon_base::lifecycle::Lifecycle;
use xenon_soc::{SocConfig, XenonSoc};

pub const SMC_BAR_BASE: u32 = 0xEA00_1000;

/// SMC slot on bus 0.
pub const SMC_DEV: u8 = 0xA;

#[derive(Default)]
pub struct RecordingIic {
    pub generated: Mutex<Vec<(u8, u8)>>,
    pub cancelled: Mutex<Vec<(u8, u8)>>,
}

impl InterruptController for RecordingIic {
    fn gen_interrupt(&self, prio: u8, cpu: u8) {
        self.generated.lock().unwrap().push((prio, cpu));
    }

    fn cancel_interrupt(&self, prio: u8, cpu: u8) {
        self.cancelled.lock().unwrap().push((prio, cpu));
    }
}

pub struct Fixture {
    pub soc: XenonSoc,
    pub iic: Arc<RecordingIic>,
    pub lifecycle: Arc<Lifecycle>,
    pub reboots: Arc<Mutex<Vec<u32>>>,
}

pub fn fixture() -> Fixture {
    fixture_with(SocConfig::default())
}

pub fn fixture_with(config: SocConfig) -> Fixture {
    let iic = Arc::new(RecordingIic::default());
    let lifecycle = Arc::new(Lifecycle::new());
    let reboots: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let soc = XenonSoc::new(
        config,
        iic.clone(),
        Arc::clone(&lifecycle),
        Arc::new({
            let reboots = Arc::clone(&reboots);
            move |reason| reboots.lock().unwrap().push(reason)
        }),
    );
    Fixture {
        soc,
        iic,
        lifecycle,
        reboots,
    }
}

/// Guest physical address of a configuration transaction.
pub fn cfg_addr(dev: u8, func: u8, reg: u8) -> u64 {
    0xD000_0000
        | (u64::from(dev & 0x1F) << 11)
        | (u64::from(func & 0x07) << 8)
        | u64::from(reg)
}

pub fn cfg_read_u32(soc: &XenonSoc, dev: u8, func: u8, reg: u8) -> u32 {
    let mut out = [0u8; 4];
    soc.bus.read(cfg_addr(dev, func, reg), &mut out).unwrap();
    u32::from_le_bytes(out)
}

pub fn cfg_write_u32(soc: &XenonSoc, dev: u8, func: u8, reg: u8, value: u32) {
    soc.bus
        .write(cfg_addr(dev, func, reg), &value.to_le_bytes())
        .unwrap();
}

pub fn mmio_read_u32(soc: &XenonSoc, addr: u64) -> u32 {
    let mut out = [0u8; 4];
    soc.bus.read(addr, &mut out).unwrap();
    u32::from_le_bytes(out)
}

pub fn mmio_write_u32(soc: &XenonSoc, addr: u64, value: u32) {
    soc.bus.write(addr, &value.to_le_bytes()).unwrap();
}

/// Programs the SMC's BAR0 at its usual window so MMIO tests can reach it.
pub fn map_smc(soc: &XenonSoc) {
    cfg_write_u32(soc, SMC_DEV, 0, 0x10, SMC_BAR_BASE);
}

pub fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

// SMC FIFO protocol, driven through the mapped BAR.

pub mod fifo {
    use super::*;

    pub const IN_DATA: u64 = SMC_BAR_BASE as u64 + 0x80;
    pub const IN_STATUS: u64 = SMC_BAR_BASE as u64 + 0x84;
    pub const OUT_DATA: u64 = SMC_BAR_BASE as u64 + 0x90;
    pub const OUT_STATUS: u64 = SMC_BAR_BASE as u64 + 0x94;

    pub const READY: u32 = 0x4;
    pub const BUSY: u32 = 0x0;

    pub fn message(bytes: &[u8]) -> [u8; 16] {
        let mut msg = [0u8; 16];
        msg[..bytes.len()].copy_from_slice(bytes);
        msg
    }

    pub fn send(soc: &XenonSoc, msg: [u8; 16]) {
        wait_for(|| mmio_read_u32(soc, IN_STATUS) == READY);
        mmio_write_u32(soc, IN_STATUS, READY);
        for word in msg.chunks_exact(4) {
            soc.bus.write(IN_DATA, word).unwrap();
        }
        mmio_write_u32(soc, IN_STATUS, BUSY);
    }

    pub fn receive(soc: &XenonSoc) -> [u8; 16] {
        wait_for(|| mmio_read_u32(soc, OUT_STATUS) == READY);
        mmio_write_u32(soc, OUT_STATUS, READY);
        let mut reply = [0u8; 16];
        for chunk in reply.chunks_exact_mut(4) {
            soc.bus.read(OUT_DATA, chunk).unwrap();
        }
        reply
    }

    pub fn transact(soc: &XenonSoc, msg: [u8; 16]) -> [u8; 16] {
        send(soc, msg);
        // The reply is published in the same critical section that re-arms
        // the in status; waiting on the in status avoids reading a stale
        // READY from a previous transaction.
        wait_for(|| {
            mmio_read_u32(soc, IN_STATUS) == READY && mmio_read_u32(soc, OUT_STATUS) == READY
        });
        receive(soc)
    }
}
