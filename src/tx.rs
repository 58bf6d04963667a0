//! Transmitter engine for the programmer side of the ZUSI bus.
//!
//! [`Driver`] encodes command frames, ships them through the [`Hal`] at the
//! currently negotiated bit rate, performs the resync and acknowledge
//! handshakes by bit-banging the clock line and reads responses back at
//! 0.1 Mbps framing. Every command runs synchronously to completion and
//! restores SPI master operation on all exit paths.
//!
//! Commands can be issued directly ([`Driver::read_cv`],
//! [`Driver::write_zpp`], …) or by handing a pre-built frame to
//! [`Driver::transmit`], which dispatches on the command byte and returns a
//! [`Feedback`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use zusi::tx;
//!
//! struct Programmer;
//!
//! impl tx::Hal for Programmer {
//!     fn transmit_bytes(&mut self, _bytes: &[u8], _mbps: tx::Mbps) {}
//!     fn spi_master(&mut self) {}
//!     fn gpio_input(&mut self) {}
//!     fn gpio_output(&mut self) {}
//!     fn write_clock(&mut self, _state: bool) {}
//!     fn write_data(&mut self, _state: bool) {}
//!     fn read_data(&mut self) -> bool {
//!         true
//!     }
//!     fn delay_us(&mut self, _us: u32) {}
//! }
//!
//! fn main() -> Result<(), zusi::Error> {
//!     let mut driver = tx::Driver::new(Programmer);
//!     driver.enter();
//!     let features = driver.features()?;
//!     let cv8 = driver.read_cv(7)?;
//!     driver.write_zpp(0, &[0u8; 256])?;
//!     driver.exit(0)?;
//!     Ok(())
//! }
//! ```

use crate::command::Command;
use crate::consts::{
    ADDR_POS, CLOCK_HIGH_US, CLOCK_LOW_US, CMD_POS, DATA_CNT_POS, DATA_POS, ENTRY_CYCLES,
    ENTRY_HALF_CYCLE_US, EXIT_FLAGS_POS, MAX_FEEDBACK_SIZE, RESYNC_BYTE, RESYNC_TIMEOUT_US,
};
use crate::crc::crc8_byte;
use crate::packet;
use crate::{Error, Features};

use core::convert::Infallible;
use core::ops::{Deref, DerefMut};

use heapless::Vec;

/// Transmission bit rates.
///
/// The resync byte always travels at 0.1 Mbps; command frames start at
/// 0.286 Mbps until a `Features` reply negotiates something faster.
#[allow(non_camel_case_types)]
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum Mbps {
    /// 10 µs bit cell, 0.1 Mbps.
    _0_1,
    /// 3.5 µs bit cell, 0.286 Mbps.
    #[default]
    _0_286,
    /// 0.733 µs bit cell, 1.364 Mbps.
    _1_364,
    /// 0.5533 µs bit cell, 1.807 Mbps.
    _1_807,
}

impl Mbps {
    /// Duration of one bit cell in nanoseconds.
    pub const fn bit_cell_ns(self) -> u32 {
        match self {
            Mbps::_0_1 => 10_000,
            Mbps::_0_286 => 3_500,
            Mbps::_1_364 => 733,
            Mbps::_1_807 => 553,
        }
    }
}

/// Capability set the transmitter engine consumes.
///
/// The SPI/GPIO pin bank is a single shared resource; the mode switches are
/// mutually exclusive and the engine guarantees SPI master operation is
/// restored when a command returns.
pub trait Hal {
    /// Ship bytes over the wire at the given bit rate.
    fn transmit_bytes(&mut self, bytes: &[u8], mbps: Mbps);

    /// Switch the pin bank to SPI master operation.
    fn spi_master(&mut self);

    /// Switch the pin bank to GPIO operation with the data line as input.
    fn gpio_input(&mut self);

    /// Switch the pin bank to GPIO operation with the data line as output.
    fn gpio_output(&mut self);

    /// Drive the clock line.
    fn write_clock(&mut self, state: bool);

    /// Drive the data line.
    fn write_data(&mut self, state: bool);

    /// Sample the data line.
    fn read_data(&mut self) -> bool;

    /// Busy-wait for `us` microseconds.
    fn delay_us(&mut self, us: u32);
}

/// Response bytes of a dispatched command: 0 to 4 bytes, never a partial
/// frame.
pub type Response = Vec<u8, MAX_FEEDBACK_SIZE>;

/// Result of [`Driver::transmit`].
pub type Feedback = Result<Response, Error>;

/// Restores SPI master operation when dropped, covering every exit path of
/// a command sequence.
struct SpiGuard<'a, H: Hal>(&'a mut H);

impl<H: Hal> Drop for SpiGuard<'_, H> {
    fn drop(&mut self) {
        self.0.spi_master();
    }
}

impl<H: Hal> Deref for SpiGuard<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        self.0
    }
}

impl<H: Hal> DerefMut for SpiGuard<'_, H> {
    fn deref_mut(&mut self) -> &mut H {
        self.0
    }
}

/// Transmitter engine.
///
/// Owns nothing but the negotiated bit rate; every command builds its frame
/// on the stack and runs to completion before returning.
#[derive(Debug)]
pub struct Driver<H: Hal> {
    /// HAL implementation supplied by the programmer.
    pub hal: H,
    mbps: Mbps,
}

impl<H: Hal> Driver<H> {
    /// Creates a new engine starting at 0.286 Mbps.
    pub fn new(hal: H) -> Self {
        Self {
            hal,
            mbps: Mbps::_0_286,
        }
    }

    /// Currently negotiated bit rate.
    pub fn mbps(&self) -> Mbps {
        self.mbps
    }

    /// Wakes the decoders with the entry preamble.
    ///
    /// Drives one second of 100 Hz clock with alternating data, then holds
    /// for one resync timeout. Call once before the first command.
    pub fn enter(&mut self) {
        let mut hal = SpiGuard(&mut self.hal);
        hal.gpio_output();
        for i in 0..ENTRY_CYCLES {
            hal.write_clock(true);
            hal.write_data(i % 2 == 1);
            hal.delay_us(ENTRY_HALF_CYCLE_US);
            hal.write_clock(false);
            hal.delay_us(ENTRY_HALF_CYCLE_US);
        }
        hal.delay_us(RESYNC_TIMEOUT_US);
    }

    /// Reads a single CV.
    pub fn read_cv(&mut self, addr: u32) -> Result<u8, Error> {
        let frame = packet::cv_read(addr);
        let mut hal = SpiGuard(&mut self.hal);
        Self::begin(&mut hal, &frame, self.mbps)?;
        Self::busy(&mut hal);
        let value = Self::receive_byte(&mut hal);
        let crc = Self::receive_byte(&mut hal);
        if crc != crc8_byte(value) {
            return Err(Error::BadMessage);
        }
        Ok(value)
    }

    /// Writes a single CV.
    pub fn write_cv(&mut self, addr: u32, value: u8) -> Result<(), Error> {
        let frame = packet::cv_write(addr, value);
        let mut hal = SpiGuard(&mut self.hal);
        Self::begin(&mut hal, &frame, self.mbps)?;
        Self::busy(&mut hal);
        Ok(())
    }

    /// Erases the entire ZPP region.
    pub fn erase_zpp(&mut self) -> Result<(), Error> {
        let frame = packet::zpp_erase();
        let mut hal = SpiGuard(&mut self.hal);
        Self::begin(&mut hal, &frame, self.mbps)?;
        Self::busy(&mut hal);
        Ok(())
    }

    /// Writes a chunk of 1..=256 bytes into the ZPP region.
    pub fn write_zpp(&mut self, addr: u32, bytes: &[u8]) -> Result<(), Error> {
        let frame = packet::zpp_write(addr, bytes);
        let mut hal = SpiGuard(&mut self.hal);
        Self::begin(&mut hal, &frame, self.mbps)?;
        Self::busy(&mut hal);
        Ok(())
    }

    /// Queries the feature vector and negotiates the bit rate from its
    /// first byte.
    ///
    /// The reply carries no CRC; it is exactly the 4 feature bytes. The new
    /// bit rate is the fastest one the decoder does not forbid and never
    /// drops below 0.286 Mbps.
    pub fn features(&mut self) -> Result<Features, Error> {
        let frame = packet::features();
        let mut hal = SpiGuard(&mut self.hal);
        Self::begin(&mut hal, &frame, self.mbps)?;
        Self::busy(&mut hal);
        let features = [
            Self::receive_byte(&mut hal),
            Self::receive_byte(&mut hal),
            Self::receive_byte(&mut hal),
            Self::receive_byte(&mut hal),
        ];
        if features[0] & 0b100 == 0 {
            self.mbps = Mbps::_1_807;
        } else if features[0] & 0b010 == 0 {
            self.mbps = Mbps::_1_364;
        } else if features[0] & 0b001 == 0 {
            self.mbps = Mbps::_0_286;
        }
        Ok(features)
    }

    /// Leaves load mode.
    pub fn exit(&mut self, flags: u8) -> Result<(), Error> {
        let frame = packet::exit(flags);
        let mut hal = SpiGuard(&mut self.hal);
        Self::begin(&mut hal, &frame, self.mbps)?;
        Self::busy(&mut hal);
        Ok(())
    }

    /// Asks the decoder whether a developer code authorises loading.
    pub fn lc_dc_query(&mut self, developer_code: u32) -> Result<bool, Error> {
        let frame = packet::lc_dc_query(developer_code);
        let mut hal = SpiGuard(&mut self.hal);
        Self::begin(&mut hal, &frame, self.mbps)?;
        Self::busy(&mut hal);
        let value = Self::receive_byte(&mut hal);
        let crc = Self::receive_byte(&mut hal);
        if crc != crc8_byte(value) {
            return Err(Error::BadMessage);
        }
        Ok(value != 0)
    }

    /// Dispatches a pre-built frame on its command byte.
    ///
    /// Success bytes are packaged as 0 to 4 feedback bytes; errors propagate
    /// verbatim. Unknown command bytes and frames too short for their
    /// command yield [`Error::InvalidArgument`].
    pub fn transmit(&mut self, frame: &[u8]) -> Feedback {
        let Some(&cmd) = frame.get(CMD_POS) else {
            return Err(Error::InvalidArgument);
        };
        #[cfg(feature = "log")]
        log::trace!("transmit command {cmd:#04x}");
        match Command::try_from(cmd) {
            Ok(Command::CvRead) if frame.len() >= ADDR_POS + 4 => self
                .read_cv(addr_field(frame))
                .map(|value| response(&[value])),
            Ok(Command::CvWrite) if frame.len() > DATA_POS => self
                .write_cv(addr_field(frame), frame[DATA_POS])
                .map(|()| Response::new()),
            Ok(Command::ZppErase) => self.erase_zpp().map(|()| Response::new()),
            Ok(Command::ZppWrite) if frame.len() > DATA_CNT_POS => {
                let count = frame[DATA_CNT_POS] as usize + 1;
                if frame.len() < DATA_POS + count {
                    return Err(Error::InvalidArgument);
                }
                self.write_zpp(addr_field(frame), &frame[DATA_POS..DATA_POS + count])
                    .map(|()| Response::new())
            }
            Ok(Command::Features) => self.features().map(|features| response(&features)),
            Ok(Command::Exit) if frame.len() > EXIT_FLAGS_POS => self
                .exit(frame[EXIT_FLAGS_POS])
                .map(|()| Response::new()),
            Ok(Command::LcDcQuery) if frame.len() >= 5 => {
                let mut code = [0u8; 4];
                code.copy_from_slice(&frame[1..5]);
                self.lc_dc_query(u32::from_be_bytes(code))
                    .map(|valid| response(&[valid as u8]))
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Common frame prologue: transmit, resync, switch the data line to
    /// input and run the acknowledge handshake.
    fn begin(hal: &mut H, frame: &[u8], mbps: Mbps) -> Result<(), Error> {
        hal.transmit_bytes(frame, mbps);
        Self::resync(hal);
        hal.gpio_input();
        // A floating line reads high on the first bit: nobody home
        if Self::read_bit(hal) {
            return Err(Error::ConnectionReset);
        }
        if !Self::read_bit(hal) {
            return Err(Error::ProtocolError);
        }
        Ok(())
    }

    fn resync(hal: &mut H) {
        hal.delay_us(10);
        hal.transmit_bytes(&[RESYNC_BYTE], Mbps::_0_1);
    }

    /// One clocked sample of the data line.
    fn read_bit(hal: &mut H) -> bool {
        hal.write_clock(true);
        hal.delay_us(CLOCK_HIGH_US);
        let state = hal.read_data();
        hal.write_clock(false);
        hal.delay_us(CLOCK_LOW_US);
        state
    }

    /// Busy phase: one clock pulse, then wait for the decoder to release
    /// the data line.
    fn busy(hal: &mut H) {
        hal.write_clock(true);
        hal.delay_us(CLOCK_HIGH_US);
        hal.write_clock(false);
        hal.delay_us(CLOCK_LOW_US);
        // TODO bound this poll via RESYNC_TIMEOUT_US once a timeout error kind exists
        let _ = nb::block!(Self::poll_busy(hal));
    }

    fn poll_busy(hal: &mut H) -> nb::Result<(), Infallible> {
        if hal.read_data() {
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    fn receive_byte(hal: &mut H) -> u8 {
        let mut byte = 0;
        for i in 0..8 {
            hal.write_clock(true);
            hal.delay_us(CLOCK_HIGH_US);
            byte |= (hal.read_data() as u8) << i;
            hal.write_clock(false);
            hal.delay_us(CLOCK_LOW_US);
        }
        byte
    }
}

fn addr_field(frame: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&frame[ADDR_POS..ADDR_POS + 4]);
    u32::from_be_bytes(bytes)
}

fn response(bytes: &[u8]) -> Response {
    let mut response = Response::new();
    let _ = response.extend_from_slice(bytes);
    response
}
