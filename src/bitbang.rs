//! Bit-banged GPIO implementation of the transmitter HAL.
//!
//! Flash programmers rarely route the two ZUSI wires through a real SPI
//! peripheral; a clock output, an open-drain data line and a delay source
//! are enough. [`BitBang`] drives exactly that over `embedded-hal` traits
//! and implements [`tx::Hal`](crate::tx::Hal), so
//! [`tx::Driver`](crate::tx::Driver) runs on any two free pins.
//!
//! Bytes are shifted out LSB first, matching the bit order of the clocked
//! readback, with half-periods derived from the
//! [`Mbps`](crate::tx::Mbps) bit-cell table. The data line is released
//! (driven high, pull-up recessive) whenever the bus direction turns
//! around; the mode switches of the HAL are no-ops because the lines never
//! leave GPIO duty.

use crate::tx::{Hal, Mbps};

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

/// GPIO transmitter HAL over a clock pin, an open-drain data pin and a
/// delay source.
#[derive(Debug)]
pub struct BitBang<Clk, Dat, D> {
    clk: Clk,
    dat: Dat,
    delay: D,
}

impl<Clk, Dat, D> BitBang<Clk, Dat, D>
where
    Clk: OutputPin,
    Dat: OutputPin + InputPin,
    D: DelayNs,
{
    /// Creates a new pin-level HAL.
    ///
    /// `dat` must be configured open-drain with a pull-up; driving it high
    /// releases the line for the decoder to answer on.
    pub fn new(clk: Clk, dat: Dat, delay: D) -> Self {
        Self { clk, dat, delay }
    }

    /// Releases the pins and the delay source.
    pub fn free(self) -> (Clk, Dat, D) {
        (self.clk, self.dat, self.delay)
    }
}

impl<Clk, Dat, D> Hal for BitBang<Clk, Dat, D>
where
    Clk: OutputPin,
    Dat: OutputPin + InputPin,
    D: DelayNs,
{
    fn transmit_bytes(&mut self, bytes: &[u8], mbps: Mbps) {
        let half_cell_ns = mbps.bit_cell_ns() / 2;
        for &byte in bytes {
            for i in 0..8 {
                if byte >> i & 1 != 0 {
                    let _ = self.dat.set_high();
                } else {
                    let _ = self.dat.set_low();
                }
                let _ = self.clk.set_high();
                self.delay.delay_ns(half_cell_ns);
                let _ = self.clk.set_low();
                self.delay.delay_ns(half_cell_ns);
            }
        }
        let _ = self.dat.set_high();
    }

    fn spi_master(&mut self) {}

    fn gpio_input(&mut self) {
        let _ = self.dat.set_high();
    }

    fn gpio_output(&mut self) {}

    fn write_clock(&mut self, state: bool) {
        if state {
            let _ = self.clk.set_high();
        } else {
            let _ = self.clk.set_low();
        }
    }

    fn write_data(&mut self, state: bool) {
        if state {
            let _ = self.dat.set_high();
        } else {
            let _ = self.dat.set_low();
        }
    }

    fn read_data(&mut self) -> bool {
        self.dat.is_high().unwrap_or(false)
    }

    fn delay_us(&mut self, us: u32) {
        self.delay.delay_us(us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::delay::NoopDelay as Delay;
    use embedded_hal_mock::eh1::digital::{
        Mock as PinMock, State as PinState, Transaction as PinTransaction,
    };

    #[test]
    fn test_transmit_bytes_shifts_lsb_first() {
        let clk_expectations: Vec<_> = (0..8)
            .flat_map(|_| {
                [
                    PinTransaction::set(PinState::High),
                    PinTransaction::set(PinState::Low),
                ]
            })
            .collect();
        let clk = PinMock::new(&clk_expectations);
        // 0x80: bits 0..=6 low, bit 7 high, then the release
        let mut dat_expectations = vec![PinTransaction::set(PinState::Low); 7];
        dat_expectations.push(PinTransaction::set(PinState::High));
        dat_expectations.push(PinTransaction::set(PinState::High));
        let dat = PinMock::new(&dat_expectations);

        let mut hal = BitBang::new(clk, dat, Delay::new());
        hal.transmit_bytes(&[0x80], Mbps::_0_1);

        let (mut clk, mut dat, _) = hal.free();
        clk.done();
        dat.done();
    }

    #[test]
    fn test_gpio_input_releases_the_data_line() {
        let clk = PinMock::new(&[]);
        let dat = PinMock::new(&[PinTransaction::set(PinState::High)]);

        let mut hal = BitBang::new(clk, dat, Delay::new());
        hal.gpio_input();

        let (mut clk, mut dat, _) = hal.free();
        clk.done();
        dat.done();
    }

    #[test]
    fn test_read_data_samples_the_data_line() {
        let clk = PinMock::new(&[]);
        let dat = PinMock::new(&[
            PinTransaction::get(PinState::High),
            PinTransaction::get(PinState::Low),
        ]);

        let mut hal = BitBang::new(clk, dat, Delay::new());
        assert!(hal.read_data());
        assert!(!hal.read_data());

        let (mut clk, mut dat, _) = hal.free();
        clk.done();
        dat.done();
    }
}
