//! # zusi
//!
//! A portable, no_std Rust driver for the ZUSI two-wire load protocol used
//! to flash sound and firmware images (ZPP) and to access configuration
//! variables (CVs) on model railway sound decoders.
//!
//! ZUSI is half-duplex and clocked: command frames travel as SPI bytes from
//! the programmer to the decoder, the acknowledge handshake and all
//! readback travel bit by bit on the shared data line, synchronised to the
//! clock line. This crate implements both ends of that dance:
//!
//! - [`rx::Driver`]: the decoder side, a cooperative state machine driven
//!   by repeated [`tick()`](rx::Driver::tick) calls
//! - [`tx::Driver`]: the programmer side, synchronous per-command methods
//!   plus a [`transmit()`](tx::Driver::transmit) frame dispatcher
//!
//! Hardware access stays behind one capability trait per side ([`rx::Hal`],
//! [`tx::Hal`]); [`bitbang::BitBang`] ships a ready-made transmitter HAL
//! over `embedded-hal` pins for programmers that drive the two wires as
//! plain GPIOs.
//!
//! ## Crate features
//! | Feature     | Description |
//! |-------------|-------------|
//! | `std`       | Disables `#![no_std]` support |
//! | `isr`       | Uses `critical_section` to share the RX engine with an ISR |
//! | `defmt-0-3` | Uses `defmt` logging |
//! | `log`       | Uses `log` logging |
//!
//! ## Wire format
//!
//! A frame is positional: command byte, optional count byte, big-endian
//! 32 bit address, payload and a trailing CRC-8 (Dallas/Maxim), terminated
//! by the `0x80` resync byte. See [`packet`] for the per-command layouts
//! and [`command::Command`] for the opcode set.
//!
//! ```rust
//! use zusi::{crc::crc8, packet};
//!
//! // every built frame folds to zero over its trailing CRC
//! let frame = packet::cv_write(0, 29);
//! assert_eq!(crc8(&frame), 0);
//! ```
//!
//! ## Integration Notes
//!
//! - The receiver performs one state transition per tick and only blocks
//!   where its HAL blocks; tick it from the main loop or from an ISR via
//!   [`service_rx_driver!`]
//! - Transmitter commands run synchronously to completion and restore SPI
//!   master operation on every exit path
//! - The bit rate starts at 0.286 Mbps and is renegotiated from the first
//!   feature byte after every [`features()`](tx::Driver::features) call
//!
//! --
//! Designed for `#![no_std]` use in resource-constrained embedded
//! environments.

#![deny(
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results
)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "isr")]
pub use critical_section;

pub use heapless;

pub mod bitbang;
pub mod command;
pub mod consts;
pub mod crc;
#[cfg(feature = "isr")]
mod isr;
pub mod packet;
pub mod rx;
pub mod tx;

/// Feature bytes returned by a `Features` query.
///
/// Byte 0 advertises the supported bit rates: bit 0 set forbids 0.286 Mbps,
/// bit 1 forbids 1.364 Mbps, bit 2 forbids 1.807 Mbps.
pub type Features = [u8; 4];

/// Transmitter-visible protocol errors.
///
/// The receiver never surfaces errors as values; its failures funnel
/// through [`rx::State::Error`] and clear on the next frame.
#[derive(PartialEq, Eq, Clone, Copy, Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum Error {
    /// The ack-valid bit read high: the data line floats, no decoder is
    /// listening on the bus.
    #[error("no decoder on the bus")]
    ConnectionReset,
    /// The decoder answered the handshake with a nak.
    #[error("decoder did not acknowledge")]
    ProtocolError,
    /// A response byte failed its CRC check.
    #[error("response failed CRC check")]
    BadMessage,
    /// Unknown command byte, or a frame too short for its command.
    #[error("invalid command")]
    InvalidArgument,
}
