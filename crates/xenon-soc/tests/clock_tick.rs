//! Periodic SMC clock interrupt.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::time::Duration;
use xenon_devices::pci::prio;
use xenon_devices::smc::{CLOCK_INT_ENABLED, CLOCK_INT_READY, CLOCK_INT_TAKEN};

const CLCK_ENABLED_REG: u64 = SMC_BAR_BASE as u64 + 0x64;
const CLCK_STATUS_REG: u64 = SMC_BAR_BASE as u64 + 0x6C;

fn clock_fires(f: &Fixture) -> usize {
    f.iic
        .generated
        .lock()
        .unwrap()
        .iter()
        .filter(|(p, _)| *p == prio::CLOCK)
        .count()
}

#[test]
fn tick_fires_once_per_period_and_rearms_on_ack() {
    let f = fixture();
    map_smc(&f.soc);

    // Route the clock source to CPU thread 2, then arm the tick.
    mmio_write_u32(&f.soc, 0xEA00_0010, (1 << 23) | (2 << 8));
    mmio_write_u32(&f.soc, CLCK_ENABLED_REG, CLOCK_INT_ENABLED);
    mmio_write_u32(&f.soc, CLCK_STATUS_REG, CLOCK_INT_READY);

    // Well inside the period: nothing may fire yet.
    std::thread::sleep(Duration::from_millis(350));
    assert_eq!(clock_fires(&f), 0);

    wait_for(|| clock_fires(&f) > 0);
    assert_eq!(clock_fires(&f), 1);
    assert_eq!(
        *f.iic.generated.lock().unwrap(),
        vec![(prio::CLOCK, 2)]
    );
    assert_eq!(mmio_read_u32(&f.soc, CLCK_STATUS_REG), CLOCK_INT_TAKEN);

    // Untaken status holds further ticks off.
    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(clock_fires(&f), 1);

    // Acknowledging re-arms the tick.
    mmio_write_u32(&f.soc, CLCK_STATUS_REG, CLOCK_INT_READY);
    wait_for(|| clock_fires(&f) == 2);
}

#[test]
fn disabled_interrupt_source_never_reaches_the_iic() {
    let f = fixture();
    map_smc(&f.soc);

    // Clock armed on the SMC side, but the bridge's priority register was
    // never enabled.
    mmio_write_u32(&f.soc, CLCK_ENABLED_REG, CLOCK_INT_ENABLED);
    mmio_write_u32(&f.soc, CLCK_STATUS_REG, CLOCK_INT_READY);

    // The tick itself still happens (status flips to taken)...
    wait_for(|| mmio_read_u32(&f.soc, CLCK_STATUS_REG) == CLOCK_INT_TAKEN);
    // ...but nothing may reach the interrupt controller.
    assert_eq!(clock_fires(&f), 0);
}
