//! Constants used across the ZUSI protocol implementation.
//!
//! This module defines the protocol-wide constants for frame layout,
//! handshake timing and buffer sizing shared by the receiver and the
//! transmitter.
//!
//! ## Key Concepts
//!
//! - **Frame positions**: A ZUSI frame is positional; the command byte,
//!   count byte, big-endian address and data payload always sit at fixed
//!   offsets.
//! - **Resync byte**: A fixed `0x80` token terminates every frame and moves
//!   both peers into the acknowledge handshake.
//! - **Security bytes**: Destructive commands (`ZppErase`, `Exit`) carry
//!   `0x55 0xAA` immediately after the command byte and are only
//!   acknowledged when both match.
//! - **Timing**: Handshake and readback traffic is clocked with 10 µs high
//!   and 20 µs low half-cycles; the entry preamble uses 5000 µs half-cycles.
//!
//! These values should be used wherever frame or handshake logic is
//! implemented so both halves of the engine stay bit-exact mirrors of each
//! other.

/// Position of the command byte in a frame.
pub const CMD_POS: usize = 0;

/// Position of the data count byte in a frame.
///
/// For `CvRead`/`CvWrite` the count is (N-1) CVs; for `ZppWrite` it is
/// (N-1) data bytes.
pub const DATA_CNT_POS: usize = 1;

/// Position of the first (most significant) address byte in a frame.
///
/// Addresses are 32 bit and encoded big-endian at positions 2..=5.
pub const ADDR_POS: usize = 2;

/// Position of the first payload data byte in a frame.
pub const DATA_POS: usize = 6;

/// Position of the first security byte in `ZppErase` and `Exit` frames.
pub const SEC_BYTES_POS: usize = 1;

/// Position of the flags byte in an `Exit` frame.
pub const EXIT_FLAGS_POS: usize = 3;

/// First security byte expected by `ZppErase` and `Exit`.
pub const SEC_BYTE_1: u8 = 0x55;

/// Second security byte expected by `ZppErase` and `Exit`.
pub const SEC_BYTE_2: u8 = 0xAA;

/// Resync byte terminating every frame.
///
/// Always transmitted at 0.1 Mbps, regardless of the negotiated bit rate.
pub const RESYNC_BYTE: u8 = 0x80;

/// Resync timeout in milliseconds.
///
/// The receiver derives its clock-wait bound from this value.
pub const RESYNC_TIMEOUT_MS: u32 = 10;

/// Resync timeout in microseconds.
pub const RESYNC_TIMEOUT_US: u32 = RESYNC_TIMEOUT_MS * 1000;

/// High half-cycle of the bit-banged handshake clock in microseconds.
pub const CLOCK_HIGH_US: u32 = 10;

/// Low half-cycle of the bit-banged handshake clock in microseconds.
pub const CLOCK_LOW_US: u32 = 20;

/// Half-cycle of the entry preamble clock in microseconds.
pub const ENTRY_HALF_CYCLE_US: u32 = 5000;

/// Number of clock cycles in the entry preamble.
///
/// One second of preamble at a 10 ms cycle.
pub const ENTRY_CYCLES: usize = 1_000_000 / (2 * ENTRY_HALF_CYCLE_US as usize);

/// Maximum number of data bytes in a `ZppWrite` frame.
pub const MAX_DATA_SIZE: usize = 256;

/// Maximum size (in bytes) of a complete frame.
///
/// Command, count, 4 address bytes, up to 256 data bytes, CRC and the
/// trailing resync slot.
pub const MAX_PACKET_SIZE: usize = 1 + 1 + 4 + MAX_DATA_SIZE + 1 + 1;

/// Maximum number of payload bytes a command can answer with.
///
/// `Features` replies with 4 bytes, everything else with at most 2.
pub const MAX_FEEDBACK_SIZE: usize = 4;
