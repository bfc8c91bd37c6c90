//! This module contains some basic functionality that libstd would normally otherwise provide.
//! Most importantly, it defines the panic handler used by `panic!`.

use core::fmt::Write;
use core::panic::PanicInfo;

use x86_64::instructions::interrupts;

use crate::debug::Debug;

#[lang = "eh_personality"]
#[no_mangle]
pub fn eh_personality() {}

/// This function is called by `panic!`. A panic anywhere in the kernel is fatal: there is no
/// unwinding, and no recovery — print the message and halt.
#[panic_handler]
pub fn rust_begin_panic(info: &PanicInfo) -> ! {
    // We should not be interrupting any more.
    interrupts::disable();

    printk!("\n========{{ PANIC }}========\n");
    if let Some(location) = info.location() {
        printk!("{}:{}:{}\n", location.file(), location.line(), location.column());
    }
    printk!("...........................\n");
    if let Some(args) = info.message() {
        let _ = Debug.write_fmt(*args);
    }
    printk!("\n===========================\n");

    loop {
        unsafe {
            asm!("hlt" :::: "volatile");
        }
    }
}
