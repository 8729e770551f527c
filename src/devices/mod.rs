//! Devices module
//!
//! Contains UART, CLINT, syscon and the serial input FIFO

mod uart;
mod clint;
pub mod serial;
pub mod syscon;

pub use uart::{Uart, UART_SIZE};
pub use clint::{Clint, CLINT_SIZE};
pub use serial::SerialFifo;
