// src/io/serial/mod.rs
//
// Serial line plumbing shared by the UART listener and the multimeter link.

pub mod utils;

pub use utils::{find_usb_port, open_serial, Parity, SerialLineConfig};
