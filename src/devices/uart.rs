//! UART 8250 compatible device
//!
//! Only the two registers a polling console driver needs: the data register
//! and the line status register. Everything else reads as zero.

use super::serial::SerialFifo;
use crate::host::ConsoleSink;

// UART registers (offset from base)
const UART_RBR: u32 = 0; // Receive Buffer Register (read)
const UART_THR: u32 = 0; // Transmitter Holding Register (write)
const UART_LSR: u32 = 5; // Line Status Register

// Line Status Register bits
const LSR_DATA_READY: u8 = 0x01;        // Data available
const LSR_TX_EMPTY: u8 = 0x20;          // TX buffer empty
const LSR_TRANSMITTER_EMPTY: u8 = 0x40; // TX empty and line idle

/// Size of the register window
pub const UART_SIZE: u32 = 8;

pub struct Uart {
    /// Receive side, fed by the host
    rx: SerialFifo,
    /// Transmit side
    console: Box<dyn ConsoleSink>,
}

impl Uart {
    pub fn new(rx: SerialFifo, console: Box<dyn ConsoleSink>) -> Self {
        Uart { rx, console }
    }

    pub fn read8(&mut self, offset: u32) -> u8 {
        match offset {
            UART_RBR => self.rx.pop().unwrap_or(0),
            UART_LSR => {
                let ready = if self.rx.is_empty() { 0 } else { LSR_DATA_READY };
                LSR_TX_EMPTY | LSR_TRANSMITTER_EMPTY | ready
            }
            _ => 0,
        }
    }

    pub fn write8(&mut self, offset: u32, value: u8) {
        if offset == UART_THR {
            self.console.write(&[value]);
        }
    }

    /// Handle to the receive FIFO, for the producer side.
    pub fn rx(&self) -> &SerialFifo {
        &self.rx
    }

    pub fn console_mut(&mut self) -> &mut dyn ConsoleSink {
        self.console.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::BufferConsole;

    #[test]
    fn test_tx_goes_to_console() {
        let console = BufferConsole::new();
        let mut uart = Uart::new(SerialFifo::new(), Box::new(console.clone()));
        uart.write8(UART_THR, b'A');
        uart.write8(3, b'X'); // LCR write, ignored
        assert_eq!(console.take(), b"A");
    }

    #[test]
    fn test_lsr_and_rx() {
        let fifo = SerialFifo::new();
        let mut uart = Uart::new(fifo.clone(), Box::new(BufferConsole::new()));
        assert_eq!(uart.read8(UART_LSR), 0x60);
        assert_eq!(uart.read8(UART_RBR), 0);

        fifo.push(b'k');
        assert_eq!(uart.read8(UART_LSR), 0x61);
        assert_eq!(uart.read8(UART_RBR), b'k');
        assert_eq!(uart.read8(UART_LSR), 0x60);
    }
}
