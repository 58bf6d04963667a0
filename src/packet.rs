//! Frame building for the transmitter side.
//!
//! A ZUSI frame is a positional byte sequence: command byte, optional count
//! byte, big-endian address, payload and a trailing CRC-8 over everything
//! before it. The builders here produce complete frames ready for
//! [`tx::Driver::transmit`](crate::tx::Driver::transmit) or the per-command
//! methods; the receiver parses the same layout via the positions in
//! [`consts`](crate::consts).

use crate::command::Command;
use crate::consts::{MAX_DATA_SIZE, MAX_PACKET_SIZE, SEC_BYTE_1, SEC_BYTE_2};
use crate::crc::crc8;

use heapless::Vec;

/// A frame buffer.
///
/// Large enough for the biggest frame on the wire, a 256 byte `ZppWrite`
/// including CRC and the resync slot.
pub type Packet = Vec<u8, MAX_PACKET_SIZE>;

fn finish(mut packet: Packet) -> Packet {
    let crc = crc8(&packet);
    let _ = packet.push(crc);
    packet
}

/// Build a `CvRead` frame.
///
/// The count byte stays 0; a single CV is read per frame.
pub fn cv_read(addr: u32) -> Packet {
    let mut packet = Packet::new();
    let _ = packet.push(Command::CvRead as u8);
    let _ = packet.push(0);
    let _ = packet.extend_from_slice(&addr.to_be_bytes());
    finish(packet)
}

/// Build a `CvWrite` frame.
///
/// The count byte stays 0; a single CV is written per frame.
pub fn cv_write(addr: u32, value: u8) -> Packet {
    let mut packet = Packet::new();
    let _ = packet.push(Command::CvWrite as u8);
    let _ = packet.push(0);
    let _ = packet.extend_from_slice(&addr.to_be_bytes());
    let _ = packet.push(value);
    finish(packet)
}

/// Build a `ZppErase` frame.
pub fn zpp_erase() -> Packet {
    let mut packet = Packet::new();
    let _ = packet.push(Command::ZppErase as u8);
    let _ = packet.push(SEC_BYTE_1);
    let _ = packet.push(SEC_BYTE_2);
    finish(packet)
}

/// Build a `ZppWrite` frame.
///
/// `bytes` must contain 1..=256 data bytes; the count byte carries the
/// length minus one.
pub fn zpp_write(addr: u32, bytes: &[u8]) -> Packet {
    debug_assert!(!bytes.is_empty() && bytes.len() <= MAX_DATA_SIZE);
    let mut packet = Packet::new();
    let _ = packet.push(Command::ZppWrite as u8);
    let _ = packet.push((bytes.len() - 1) as u8);
    let _ = packet.extend_from_slice(&addr.to_be_bytes());
    let _ = packet.extend_from_slice(bytes);
    finish(packet)
}

/// Build a `Features` frame.
pub fn features() -> Packet {
    let mut packet = Packet::new();
    let _ = packet.push(Command::Features as u8);
    finish(packet)
}

/// Build an `Exit` frame.
pub fn exit(flags: u8) -> Packet {
    let mut packet = Packet::new();
    let _ = packet.push(Command::Exit as u8);
    let _ = packet.push(SEC_BYTE_1);
    let _ = packet.push(SEC_BYTE_2);
    let _ = packet.push(flags);
    finish(packet)
}

/// Build a `LcDcQuery` frame.
///
/// The developer code travels big-endian straight after the command byte.
pub fn lc_dc_query(developer_code: u32) -> Packet {
    let mut packet = Packet::new();
    let _ = packet.push(Command::LcDcQuery as u8);
    let _ = packet.extend_from_slice(&developer_code.to_be_bytes());
    finish(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cv_read_frame() {
        assert_eq!(
            cv_read(0xFF).as_slice(),
            &[0x01, 0x00, 0x00, 0x00, 0x00, 0xFF, 0x02]
        );
    }

    #[test]
    fn test_cv_write_frame() {
        assert_eq!(
            cv_write(0xFF, 0x0F).as_slice(),
            &[0x02, 0x00, 0x00, 0x00, 0x00, 0xFF, 0x0F, 0xBA]
        );
    }

    #[test]
    fn test_zpp_erase_frame() {
        assert_eq!(zpp_erase().as_slice(), &[0x04, 0x55, 0xAA, 0xC7]);
    }

    #[test]
    fn test_zpp_write_frame() {
        let data = [0xDE, 0xAD, 0xBE, 0xEF];
        let packet = zpp_write(0x0001_0000, &data);
        assert_eq!(&packet[..6], &[0x05, 0x03, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(&packet[6..10], &data);
        assert_eq!(packet[10], crc8(&packet[..10]));
        assert_eq!(packet.len(), 11);
    }

    #[test]
    fn test_features_frame() {
        assert_eq!(features().as_slice(), &[0x06, 0xDD]);
    }

    #[test]
    fn test_exit_frame() {
        assert_eq!(exit(0x02).as_slice(), &[0x07, 0x55, 0xAA, 0x02, 0x7D]);
    }

    #[test]
    fn test_lc_dc_query_frame() {
        let packet = lc_dc_query(0x0102_0304);
        assert_eq!(&packet[..5], &[0x0D, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(packet[5], crc8(&packet[..5]));
    }

    #[test]
    fn test_trailing_crc_folds_to_zero() {
        for packet in [
            cv_read(0x8E40),
            cv_write(0, 0xFF),
            zpp_erase(),
            features(),
            exit(0),
            lc_dc_query(0xAABB_CCDD),
        ] {
            assert_eq!(crc8(&packet), 0, "crc8(frame || crc8(frame)) must be 0");
        }
    }
}
