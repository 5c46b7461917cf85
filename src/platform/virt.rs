//! QEMU Virt board

use core::fmt;
use core::fmt::Write;
use core::ptr;

use spin::Mutex;
use uart_16550::MmioSerialPort;

use super::Platform;

// —————————————————————————— Platform parameters ——————————————————————————— //

const SERIAL_PORT_BASE_ADDRESS: usize = 0x10000000;
const TEST_MMIO_ADDRESS: usize = 0x100000;

/// The monitor is loaded at the base of DRAM and reserves the first 2 MiB.
const SM_BASE_ADDRESS: usize = 0x80000000;
const SM_SIZE: usize = 0x200000;

static SERIAL_PORT: Mutex<Option<MmioSerialPort>> = Mutex::new(None);

// ———————————————————————————————— Platform ———————————————————————————————— //

pub struct VirtPlatform {}

impl Platform for VirtPlatform {
    fn name() -> &'static str {
        "QEMU virt"
    }

    fn init() {
        // Serial
        let mut uart = SERIAL_PORT.lock();
        let mut mmio = unsafe { MmioSerialPort::new(SERIAL_PORT_BASE_ADDRESS) };
        mmio.init();
        *uart = Some(mmio);
    }

    fn debug_print(args: fmt::Arguments) {
        let mut serial_port = SERIAL_PORT.lock();
        if let Some(ref mut serial_port) = serial_port.as_mut() {
            serial_port
                .write_fmt(args)
                .expect("Printing to serial failed")
        };
    }

    fn exit_success() -> ! {
        exit_qemu(true)
    }

    fn exit_failure() -> ! {
        exit_qemu(false)
    }

    fn sm_memory_start_and_size() -> (usize, usize) {
        (SM_BASE_ADDRESS, SM_SIZE)
    }

    const NB_HARTS: usize = 1;
}

fn exit_qemu(success: bool) -> ! {
    let code: u32 = if success { 0x5555 } else { (1 << 16) | 0x3333 };

    unsafe {
        ptr::write_volatile(TEST_MMIO_ADDRESS as *mut u32, code);
    }

    // Loop forever if shutdown failed
    loop {
        core::hint::spin_loop();
    }
}
