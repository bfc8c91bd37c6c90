//! I/O devices. Currently just the keyboard; the serial console lives in `debug` since it is
//! used for logging rather than general I/O.

pub mod kbd;

pub fn init() {
    kbd::init();
}
