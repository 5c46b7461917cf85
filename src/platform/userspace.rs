//! Userspace platform, used when running unit tests on the host architecture.

use core::fmt;

use super::Platform;

/// The monitor memory window reported in userspace.
///
/// Kept outside the emulated DRAM used by tests so that host-provided ranges only collide with it
/// when a test asks for it explicitly.
const SM_BASE_ADDRESS: usize = 0xF0000000;
const SM_SIZE: usize = 0x200000;

pub struct UserspacePlatform {}

impl Platform for UserspacePlatform {
    fn name() -> &'static str {
        "userspace"
    }

    fn init() {}

    fn debug_print(args: fmt::Arguments) {
        print!("{}", args);
    }

    fn exit_success() -> ! {
        std::process::exit(0);
    }

    fn exit_failure() -> ! {
        std::process::exit(1);
    }

    fn sm_memory_start_and_size() -> (usize, usize) {
        (SM_BASE_ADDRESS, SM_SIZE)
    }

    const NB_HARTS: usize = 1;
}
