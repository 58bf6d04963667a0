//! Receiver engine for the decoder side of the ZUSI bus.
//!
//! This module provides the [`Driver`] state machine and the [`Hal`]
//! capability set it consumes. The engine ingests framed command packets
//! from an SPI-slave byte stream, validates CRC and per-command policy,
//! drives the acknowledge handshake on the bit-banged data line and clocks
//! out responses synchronised to the externally driven clock line.
//!
//! The engine is cooperative: [`Driver::tick`] performs at most one state
//! transition per call and never sleeps on its own. Blocking only happens
//! inside the HAL (`receive_byte`, `wait_clock`). Call `tick` from the main
//! loop or, with the `isr` feature, from an interrupt via
//! [`service_rx_driver!`](crate::service_rx_driver).
//!
//! ## Example
//!
//! ```rust,no_run
//! use zusi::rx;
//!
//! struct ZppLoad;
//!
//! impl rx::Hal for ZppLoad {
//!     fn receive_byte(&mut self) -> nb::Result<u8, core::convert::Infallible> {
//!         Err(nb::Error::WouldBlock)
//!     }
//!     fn read_cv(&mut self, _addr: u32) -> u8 {
//!         0
//!     }
//!     fn write_cv(&mut self, _addr: u32, _value: u8) {}
//!     fn erase_zpp(&mut self) {}
//!     fn write_zpp(&mut self, _addr: u32, _bytes: &[u8]) {}
//!     fn features(&mut self) -> zusi::Features {
//!         [0; 4]
//!     }
//!     fn exit(&mut self, _flags: u8) -> ! {
//!         loop {}
//!     }
//!     fn load_code_valid(&mut self, _developer_code: &[u8; 4]) -> bool {
//!         true
//!     }
//!     fn address_valid(&mut self, _addr: u32) -> bool {
//!         true
//!     }
//!     fn wait_clock(&mut self, _state: bool) -> bool {
//!         true
//!     }
//!     fn write_data(&mut self, _state: bool) {}
//!     fn spi_slave(&mut self) {}
//!     fn gpio_output(&mut self) {}
//! }
//!
//! fn main() -> ! {
//!     let mut driver = rx::Driver::new(ZppLoad);
//!     loop {
//!         driver.tick();
//!     }
//! }
//! ```

use crate::Features;
use crate::command::Command;
use crate::consts::{
    ADDR_POS, CMD_POS, DATA_CNT_POS, DATA_POS, EXIT_FLAGS_POS, RESYNC_BYTE, SEC_BYTE_1, SEC_BYTE_2,
    SEC_BYTES_POS,
};
use crate::crc::{crc8_byte, crc8_update};
use crate::packet::Packet;

use core::convert::Infallible;

/// Capability set the receiver engine consumes.
///
/// One implementation per decoder: the byte capture and line primitives talk
/// to the SPI/GPIO pin bank, the action callbacks talk to the CV store and
/// the flash driver. All hardware blocking (and the clock-wait timeout
/// derived from [`RESYNC_TIMEOUT_MS`](crate::consts::RESYNC_TIMEOUT_MS))
/// lives behind this trait.
pub trait Hal {
    /// Non-blocking attempt to capture one SPI byte.
    ///
    /// `WouldBlock` means no byte arrived in time and drops the current
    /// frame.
    fn receive_byte(&mut self) -> nb::Result<u8, Infallible>;

    /// Read a CV.
    fn read_cv(&mut self, addr: u32) -> u8;

    /// Write a CV.
    fn write_cv(&mut self, addr: u32, value: u8);

    /// Erase the entire ZPP region.
    fn erase_zpp(&mut self);

    /// Write a chunk of up to 256 bytes into the ZPP region.
    fn write_zpp(&mut self, addr: u32, bytes: &[u8]);

    /// Feature vector of this decoder.
    fn features(&mut self) -> Features;

    /// Leave load mode. Must not return.
    fn exit(&mut self, flags: u8) -> !;

    /// Check whether a developer code authorises loading.
    fn load_code_valid(&mut self, developer_code: &[u8; 4]) -> bool;

    /// Check whether a ZPP write address is in range.
    fn address_valid(&mut self, addr: u32) -> bool;

    /// Block until the clock line equals `state`, bounded by the resync
    /// timeout. `false` on timeout.
    fn wait_clock(&mut self, state: bool) -> bool;

    /// Drive the data line.
    fn write_data(&mut self, state: bool);

    /// Switch the pin bank to SPI slave operation.
    fn spi_slave(&mut self);

    /// Switch the pin bank to GPIO output operation.
    fn gpio_output(&mut self);

    /// Optional, blink front- and rear lights while waiting for a command.
    fn toggle_lights(&mut self) {}
}

/// Engine state, advanced one transition per [`Driver::tick`].
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum State {
    /// Waiting for the command byte of the next frame.
    #[default]
    ReceiveCommand,
    /// Receiving the command-specific remainder of the frame.
    ReceiveData,
    /// Deciding ack/nak and expecting the resync byte.
    ReceiveResync,
    /// Driving the two-bit acknowledge handshake.
    TransmitAck,
    /// Holding the data line low while the action executes.
    TransmitBusy,
    /// Clocking out the response bit by bit.
    TransmitData,
    /// Any failure; recovered by [`Driver::reset`] on the next tick.
    Error,
}

/// Receiver engine.
///
/// Owns the frame buffer, the running CRC and the ack decision for the
/// lifetime of the session; borrows all hardware access from the [`Hal`].
#[derive(Debug)]
pub struct Driver<H: Hal> {
    /// HAL implementation supplied by the decoder.
    pub hal: H,
    packet: Packet,
    crc: u8,
    state: State,
    ack: bool,
}

impl<H: Hal> Driver<H> {
    /// Creates a new engine in [`State::ReceiveCommand`].
    ///
    /// No HAL call is made here; the pin bank is expected to come up in SPI
    /// slave operation and is re-switched on every [`reset`](Self::reset).
    pub fn new(hal: H) -> Self {
        Self {
            hal,
            packet: Packet::new(),
            crc: 0,
            state: State::ReceiveCommand,
            ack: false,
        }
    }

    /// Current engine state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Advances the engine by one state transition.
    ///
    /// Blocks only where the HAL blocks. Safe to call forever; every failure
    /// funnels through [`State::Error`] and the engine resynchronises on the
    /// next frame.
    pub fn tick(&mut self) {
        let next = match self.state {
            State::ReceiveCommand => {
                self.hal.toggle_lights();
                self.receive_command()
            }
            State::ReceiveData => self.receive_data(),
            State::ReceiveResync => self.receive_resync(),
            State::TransmitAck => self.transmit_ack(),
            State::TransmitBusy => self.transmit_busy(),
            State::TransmitData => self.transmit_data(),
            State::Error => self.recover(),
        };
        if next == State::Error && self.state != State::Error {
            #[cfg(feature = "log")]
            log::debug!("frame dropped in {:?}", self.state);
        }
        self.state = next;
    }

    /// Clears buffer, CRC and ack decision, switches back to SPI slave
    /// operation and returns the engine to [`State::ReceiveCommand`].
    ///
    /// Idempotent; hosts may call this to recover the engine at any time.
    pub fn reset(&mut self) {
        self.state = self.recover();
    }

    fn recover(&mut self) -> State {
        self.hal.spi_slave();
        self.packet.clear();
        self.crc = 0;
        self.ack = false;
        State::ReceiveCommand
    }

    fn receive_command(&mut self) -> State {
        self.packet.clear();
        if !self.receive_bytes(1) {
            return State::Error;
        }
        match Command::try_from(self.packet[CMD_POS]) {
            Ok(Command::None) | Err(_) => State::Error,
            Ok(_) => State::ReceiveData,
        }
    }

    fn receive_data(&mut self) -> State {
        let success = match self.command() {
            Some(Command::CvRead) => self.receive_bytes(6),
            Some(Command::CvWrite) | Some(Command::ZppWrite) => {
                self.receive_bytes(1)
                    && self.receive_bytes(self.packet[DATA_CNT_POS] as usize + 6)
            }
            Some(Command::ZppErase) => self.receive_bytes(3),
            Some(Command::Features) => self.receive_bytes(1),
            Some(Command::Exit) => self.receive_bytes(4),
            Some(Command::LcDcQuery) => self.receive_bytes(5),
            _ => false,
        };
        if success {
            State::ReceiveResync
        } else {
            State::Error
        }
    }

    fn receive_resync(&mut self) -> State {
        self.ack = self.ack_or_nack();
        match self.hal.receive_byte() {
            Ok(RESYNC_BYTE) => {
                self.hal.gpio_output();
                State::TransmitAck
            }
            _ => State::Error,
        }
    }

    fn transmit_ack(&mut self) -> State {
        if !self.hal.wait_clock(true) {
            return State::Error;
        }
        self.hal.write_data(false);
        if !self.hal.wait_clock(false) {
            return State::Error;
        }
        if !self.hal.wait_clock(true) {
            return State::Error;
        }
        if self.ack {
            self.hal.write_data(true);
        }
        if !self.hal.wait_clock(false) {
            return State::Error;
        }
        // An acknowledged exit does not require us to carry on
        if self.ack && self.command() == Some(Command::Exit) {
            self.hal.exit(self.packet[EXIT_FLAGS_POS]);
        }
        if self.ack { State::TransmitBusy } else { State::Error }
    }

    fn transmit_busy(&mut self) -> State {
        if !self.hal.wait_clock(true) {
            return State::Error;
        }
        self.hal.write_data(false);
        let next = self.execute();
        if !self.hal.wait_clock(false) {
            return State::Error;
        }
        self.hal.write_data(true);
        if next == State::ReceiveCommand {
            self.hal.spi_slave();
        }
        next
    }

    fn transmit_data(&mut self) -> State {
        for i in 0..self.packet.len() {
            if !self.transmit_byte(self.packet[i]) {
                return State::Error;
            }
        }
        self.recover()
    }

    /// Runs the action of the received command and prepares the response.
    fn execute(&mut self) -> State {
        match self.command() {
            Some(Command::CvRead) => {
                let addr = self.addr();
                let value = self.hal.read_cv(addr);
                self.respond(&[value, crc8_byte(value)])
            }
            Some(Command::CvWrite) => {
                let addr = self.addr();
                self.hal.write_cv(addr, self.packet[DATA_POS]);
                State::ReceiveCommand
            }
            Some(Command::ZppErase) => {
                self.hal.erase_zpp();
                State::ReceiveCommand
            }
            Some(Command::ZppWrite) => {
                let addr = self.addr();
                let count = self.packet[DATA_CNT_POS] as usize + 1;
                let Self { hal, packet, .. } = self;
                hal.write_zpp(addr, &packet[DATA_POS..DATA_POS + count]);
                State::ReceiveCommand
            }
            Some(Command::Features) => {
                let features = self.hal.features();
                self.respond(&features)
            }
            Some(Command::LcDcQuery) => {
                let mut developer_code = [0u8; 4];
                developer_code.copy_from_slice(&self.packet[1..5]);
                let valid = self.hal.load_code_valid(&developer_code) as u8;
                self.respond(&[valid, crc8_byte(valid)])
            }
            _ => State::ReceiveCommand,
        }
    }

    /// Ack/nak decision, taken once per frame with the fully accumulated
    /// CRC. The accumulator is cleared unconditionally afterwards.
    fn ack_or_nack(&mut self) -> bool {
        let crc_ok = self.crc == 0;
        self.crc = 0;
        match self.command() {
            // Requires only CRC
            Some(Command::CvRead)
            | Some(Command::CvWrite)
            | Some(Command::Features)
            | Some(Command::LcDcQuery) => crc_ok,
            // Requires CRC and address validation
            Some(Command::ZppWrite) => {
                let addr = self.addr();
                crc_ok && self.hal.address_valid(addr)
            }
            // Requires CRC and security bytes
            Some(Command::ZppErase) | Some(Command::Exit) => {
                crc_ok
                    && self.packet[SEC_BYTES_POS] == SEC_BYTE_1
                    && self.packet[SEC_BYTES_POS + 1] == SEC_BYTE_2
            }
            _ => false,
        }
    }

    fn receive_bytes(&mut self, count: usize) -> bool {
        for _ in 0..count {
            match self.hal.receive_byte() {
                Ok(byte) => {
                    let _ = self.packet.push(byte);
                    self.crc = crc8_update(self.crc, byte);
                }
                Err(_) => return false,
            }
        }
        true
    }

    fn transmit_byte(&mut self, byte: u8) -> bool {
        for i in 0..8 {
            if !self.hal.wait_clock(true) {
                return false;
            }
            self.hal.write_data(byte >> i & 1 != 0);
            if !self.hal.wait_clock(false) {
                return false;
            }
        }
        true
    }

    fn respond(&mut self, bytes: &[u8]) -> State {
        self.packet.clear();
        let _ = self.packet.extend_from_slice(bytes);
        State::TransmitData
    }

    fn command(&self) -> Option<Command> {
        Command::try_from(self.packet[CMD_POS]).ok()
    }

    fn addr(&self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.packet[ADDR_POS..ADDR_POS + 4]);
        u32::from_be_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc8;
    use std::collections::VecDeque;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    #[derive(Default)]
    struct Calls {
        script: VecDeque<u8>,
        write_data: Vec<bool>,
        gpio_output: usize,
        spi_slave: usize,
        cv_reads: Vec<u32>,
        cv_writes: Vec<(u32, u8)>,
        zpp_erases: usize,
        zpp_writes: Vec<(u32, Vec<u8>)>,
        exit_flags: Vec<u8>,
        developer_codes: Vec<[u8; 4]>,
        load_code_valid: bool,
        address_valid: bool,
        features: Features,
    }

    /// Scripted HAL: replays `script` byte by byte, records every call.
    #[derive(Clone)]
    struct MockHal(Arc<Mutex<Calls>>);

    impl MockHal {
        fn new(script: &[u8]) -> Self {
            let calls = Calls {
                script: script.iter().copied().collect(),
                load_code_valid: true,
                address_valid: true,
                ..Default::default()
            };
            MockHal(Arc::new(Mutex::new(calls)))
        }

        fn calls(&self) -> std::sync::MutexGuard<'_, Calls> {
            self.0.lock().unwrap()
        }
    }

    impl Hal for MockHal {
        fn receive_byte(&mut self) -> nb::Result<u8, Infallible> {
            self.calls().script.pop_front().ok_or(nb::Error::WouldBlock)
        }
        fn read_cv(&mut self, addr: u32) -> u8 {
            self.calls().cv_reads.push(addr);
            0
        }
        fn write_cv(&mut self, addr: u32, value: u8) {
            self.calls().cv_writes.push((addr, value));
        }
        fn erase_zpp(&mut self) {
            self.calls().zpp_erases += 1;
        }
        fn write_zpp(&mut self, addr: u32, bytes: &[u8]) {
            self.calls().zpp_writes.push((addr, bytes.to_vec()));
        }
        fn features(&mut self) -> Features {
            self.calls().features
        }
        fn exit(&mut self, flags: u8) -> ! {
            self.calls().exit_flags.push(flags);
            panic!("exit");
        }
        fn load_code_valid(&mut self, developer_code: &[u8; 4]) -> bool {
            let mut calls = self.calls();
            calls.developer_codes.push(*developer_code);
            calls.load_code_valid
        }
        fn address_valid(&mut self, _addr: u32) -> bool {
            self.calls().address_valid
        }
        fn wait_clock(&mut self, _state: bool) -> bool {
            true
        }
        fn write_data(&mut self, state: bool) {
            self.calls().write_data.push(state);
        }
        fn spi_slave(&mut self) {
            self.calls().spi_slave += 1;
        }
        fn gpio_output(&mut self) {
            self.calls().gpio_output += 1;
        }
    }

    /// Frame plus CRC plus resync byte, as the SPI slave would capture it.
    fn script(frame: &[u8]) -> Vec<u8> {
        let mut bytes = frame.to_vec();
        bytes.push(crc8(frame));
        bytes.push(RESYNC_BYTE);
        bytes
    }

    fn run(driver: &mut Driver<MockHal>, ticks: usize) {
        for _ in 0..ticks {
            driver.tick();
        }
    }

    #[test]
    fn test_cv_read() {
        let hal = MockHal::new(&script(&[0x01, 0, 0, 0, 0, 0]));
        let mut driver = Driver::new(hal.clone());
        run(&mut driver, 8);

        let calls = hal.calls();
        assert_eq!(calls.cv_reads, vec![0]);
        assert_eq!(calls.gpio_output, 1);
        // ack valid, ack, 2x busy, 8 CV bits, 8 CRC bits
        assert_eq!(calls.write_data.len(), 20);
    }

    #[test]
    fn test_cv_read_response_bits() {
        let hal = MockHal::new(&script(&[0x01, 0, 0, 0, 0, 0]));
        let mut driver = Driver::new(hal.clone());
        run(&mut driver, 8);

        // readCv stubs 0x00, so the data bits are all low and the CRC bits
        // spell crc8(0x00) == 0x00
        let calls = hal.calls();
        assert!(calls.write_data[4..20].iter().all(|&bit| !bit));
    }

    #[test]
    fn test_cv_write() {
        let hal = MockHal::new(&script(&[0x02, 0, 0, 0, 0, 0xFF, 0x0F]));
        let mut driver = Driver::new(hal.clone());
        run(&mut driver, 8);

        let calls = hal.calls();
        assert_eq!(calls.cv_writes, vec![(0xFF, 0x0F)]);
        // ack valid, ack, 2x busy
        assert_eq!(calls.write_data.len(), 4);
    }

    #[test]
    fn test_zpp_erase() {
        let hal = MockHal::new(&script(&[0x04, 0x55, 0xAA]));
        let mut driver = Driver::new(hal.clone());
        run(&mut driver, 8);

        let calls = hal.calls();
        assert_eq!(calls.zpp_erases, 1);
        assert_eq!(calls.write_data.len(), 4);
    }

    #[test]
    fn test_zpp_write() {
        let data = [0xDEu8, 0xAD, 0xBE, 0xEF];
        let mut frame = vec![0x05, (data.len() - 1) as u8, 0, 0, 0x80, 0];
        frame.extend_from_slice(&data);
        let hal = MockHal::new(&script(&frame));
        let mut driver = Driver::new(hal.clone());
        run(&mut driver, 8);

        let calls = hal.calls();
        assert_eq!(calls.zpp_writes, vec![(0x8000, data.to_vec())]);
    }

    #[test]
    fn test_zpp_write_invalid_address_naks() {
        let frame = [0x05, 0, 0, 0, 0x80, 0, 0xAB];
        let hal = MockHal::new(&script(&frame));
        hal.calls().address_valid = false;
        let mut driver = Driver::new(hal.clone());
        run(&mut driver, 8);

        let calls = hal.calls();
        assert!(calls.zpp_writes.is_empty());
        // handshake ran, ack bit never driven high
        assert_eq!(calls.write_data, vec![false]);
    }

    #[test]
    fn test_features() {
        let hal = MockHal::new(&script(&[0x06]));
        hal.calls().features = [0x07, 0x00, 0x00, 0x00];
        let mut driver = Driver::new(hal.clone());
        run(&mut driver, 8);

        let calls = hal.calls();
        // ack valid, ack, 2x busy, 4 bytes of 8 bits each, no CRC
        assert_eq!(calls.write_data.len(), 4 + 32);
        // byte 0 == 0x07, LSB first
        assert_eq!(&calls.write_data[4..8], &[true, true, true, false]);
    }

    #[test]
    fn test_exit() {
        let hal = MockHal::new(&script(&[0x07, 0x55, 0xAA, 0xFF]));
        let mut driver = Driver::new(hal.clone());
        let unwound = catch_unwind(AssertUnwindSafe(|| run(&mut driver, 8)));

        assert!(unwound.is_err());
        assert_eq!(hal.calls().exit_flags, vec![0xFF]);
    }

    #[test]
    fn test_exit_ignored_security_bytes() {
        let hal = MockHal::new(&script(&[0x07, 0x01, 0x02, 0xFF]));
        let mut driver = Driver::new(hal.clone());
        run(&mut driver, 8);

        assert!(hal.calls().exit_flags.is_empty());
    }

    #[test]
    fn test_lc_dc_query() {
        let hal = MockHal::new(&script(&[0x0D, 1, 2, 3, 4]));
        let mut driver = Driver::new(hal.clone());
        run(&mut driver, 8);

        let calls = hal.calls();
        assert_eq!(calls.developer_codes, vec![[1, 2, 3, 4]]);
        assert_eq!(calls.write_data.len(), 4 + 16);
        // response byte 0x01, LSB first
        assert_eq!(
            &calls.write_data[4..12],
            &[true, false, false, false, false, false, false, false]
        );
        // followed by crc8(0x01) == 0x5E, LSB first
        assert_eq!(
            &calls.write_data[12..20],
            &[false, true, true, true, true, false, true, false]
        );
    }

    #[test]
    fn test_built_frames_are_accepted() {
        // frames from the transmitter-side builders ack and dispatch cleanly
        let frame = crate::packet::cv_write(0x8E40, 0x2A);
        let mut bytes = frame.to_vec();
        bytes.push(RESYNC_BYTE);
        let hal = MockHal::new(&bytes);
        let mut driver = Driver::new(hal.clone());
        run(&mut driver, 8);

        assert_eq!(hal.calls().cv_writes, vec![(0x8E40, 0x2A)]);
    }

    #[test]
    fn test_bad_crc_naks() {
        let mut bytes = script(&[0x01, 0, 0, 0, 0, 0]);
        let crc_pos = bytes.len() - 2;
        bytes[crc_pos] ^= 0xFF;
        let hal = MockHal::new(&bytes);
        let mut driver = Driver::new(hal.clone());
        run(&mut driver, 8);

        let calls = hal.calls();
        assert!(calls.cv_reads.is_empty());
        assert_eq!(calls.write_data, vec![false]);
    }

    #[test]
    fn test_missing_resync_byte_drops_frame() {
        let mut bytes = script(&[0x01, 0, 0, 0, 0, 0]);
        let resync_pos = bytes.len() - 1;
        bytes[resync_pos] = 0x00;
        let hal = MockHal::new(&bytes);
        let mut driver = Driver::new(hal.clone());
        run(&mut driver, 4);

        assert_eq!(hal.calls().gpio_output, 0);
        assert_eq!(driver.state(), State::ReceiveCommand);
    }

    #[test]
    fn test_invalid_opcode_errors() {
        let hal = MockHal::new(&[0x03]);
        let mut driver = Driver::new(hal.clone());
        driver.tick();
        assert_eq!(driver.state(), State::Error);
    }

    #[test]
    fn test_receive_failure_errors() {
        let hal = MockHal::new(&[0x01, 0, 0]);
        let mut driver = Driver::new(hal.clone());
        driver.tick();
        driver.tick();
        assert_eq!(driver.state(), State::Error);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let hal = MockHal::new(&[]);
        let mut driver = Driver::new(hal.clone());
        driver.tick();
        assert_eq!(driver.state(), State::Error);

        driver.reset();
        assert_eq!(driver.state(), State::ReceiveCommand);
        driver.reset();
        assert_eq!(driver.state(), State::ReceiveCommand);
        assert_eq!(hal.calls().spi_slave, 2);
    }
}
