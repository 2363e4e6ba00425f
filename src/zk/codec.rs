//! Frame construction and parsing for the ZKTeco binary protocol.
//!
//! A frame is an 8-byte header (`command`, `checksum`, `session_id`,
//! `reply_id`, all little-endian u16) followed by the payload. Over TCP the
//! frame is preceded by an 8-byte length prefix carrying two magic words and
//! the frame length.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use super::consts::{HEADER_SIZE, MACHINE_PREPARE_DATA_1, MACHINE_PREPARE_DATA_2, TCP_TOP_SIZE};
use super::error::{Result, ZkError};

/// A parsed protocol frame.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub command: u16,
    pub session_id: u16,
    pub reply_id: u16,
    pub payload: Vec<u8>,
}

/// Calculate the ZK checksum over a frame with its checksum field zeroed.
///
/// Sums the data as little-endian u16 words (a trailing odd byte is added
/// as-is), folds carries back into 16 bits, and returns the one's
/// complement.
pub(crate) fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_le_bytes([chunk[0], chunk[1]]) as u32
        } else {
            chunk[0] as u32
        };
        sum = sum.wrapping_add(word);
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

/// Build a complete frame: header with computed checksum, then payload.
pub(crate) fn build_frame(command: u16, session_id: u16, reply_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&command.to_le_bytes());
    frame.extend_from_slice(&[0, 0]); // checksum placeholder
    frame.extend_from_slice(&session_id.to_le_bytes());
    frame.extend_from_slice(&reply_id.to_le_bytes());
    frame.extend_from_slice(payload);

    let sum = checksum(&frame);
    frame[2..4].copy_from_slice(&sum.to_le_bytes());
    frame
}

/// Parse and checksum-verify a frame (header + payload, no TCP prefix).
pub(crate) fn parse_frame(buf: &[u8]) -> Result<Frame> {
    if buf.len() < HEADER_SIZE {
        return Err(ZkError::protocol(format!("truncated frame: {} bytes", buf.len())));
    }

    let stored = u16::from_le_bytes([buf[2], buf[3]]);
    let mut zeroed = buf.to_vec();
    zeroed[2] = 0;
    zeroed[3] = 0;
    let computed = checksum(&zeroed);
    if stored != computed {
        return Err(ZkError::protocol(format!(
            "checksum mismatch: stored {stored:#06x}, computed {computed:#06x}"
        )));
    }

    Ok(Frame {
        command: u16::from_le_bytes([buf[0], buf[1]]),
        session_id: u16::from_le_bytes([buf[4], buf[5]]),
        reply_id: u16::from_le_bytes([buf[6], buf[7]]),
        payload: buf[HEADER_SIZE..].to_vec(),
    })
}

/// Prepend the TCP length prefix to a frame.
pub(crate) fn wrap_tcp(frame: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(TCP_TOP_SIZE + frame.len());
    packet.extend_from_slice(&MACHINE_PREPARE_DATA_1.to_le_bytes());
    packet.extend_from_slice(&MACHINE_PREPARE_DATA_2.to_le_bytes());
    packet.extend_from_slice(&(frame.len() as u32).to_le_bytes());
    packet.extend_from_slice(frame);
    packet
}

/// Validate a TCP length prefix and return the advertised frame length.
pub(crate) fn parse_tcp_top(top: &[u8; 8]) -> Result<usize> {
    let magic1 = u16::from_le_bytes([top[0], top[1]]);
    let magic2 = u16::from_le_bytes([top[2], top[3]]);
    if magic1 != MACHINE_PREPARE_DATA_1 || magic2 != MACHINE_PREPARE_DATA_2 {
        return Err(ZkError::protocol(format!(
            "bad TCP magic: {magic1:#06x} {magic2:#06x}"
        )));
    }
    Ok(u32::from_le_bytes([top[4], top[5], top[6], top[7]]) as usize)
}

/// Derive the 4-byte CMD_AUTH payload from the device password and the
/// session id issued by CMD_CONNECT.
///
/// Ported from the vendor SDK's MakeKey: bit-reverse the password in a
/// 32-bit word, add the session id, XOR byte-wise with "ZKSO" with the two
/// 16-bit halves swapped, then XOR with the tick counter.
pub(crate) fn make_commkey(password: u32, session_id: u16, ticks: u8) -> [u8; 4] {
    let mut k: u32 = 0;
    for i in 0..32 {
        k <<= 1;
        if password & (1 << i) != 0 {
            k |= 1;
        }
    }
    k = k.wrapping_add(session_id as u32);

    let b = k.to_le_bytes();
    let x = [b[0] ^ b'Z', b[1] ^ b'K', b[2] ^ b'S', b[3] ^ b'O'];
    // swap the 16-bit halves
    let swapped = [x[2], x[3], x[0], x[1]];
    [
        swapped[0] ^ ticks,
        swapped[1] ^ ticks,
        ticks,
        swapped[3] ^ ticks,
    ]
}

/// Encode a timestamp into the device's packed 4-byte form.
pub(crate) fn encode_time(t: &NaiveDateTime) -> u32 {
    let yy = (t.year() % 100) as u32;
    let date_part = (yy * 12 * 31) + (t.month() - 1) * 31 + t.day() - 1;
    date_part * 86400 + (t.hour() * 60 + t.minute()) * 60 + t.second()
}

/// Decode the packed 4-byte timestamp form. Reference year is 2000.
pub(crate) fn decode_time(raw: u32) -> Result<NaiveDateTime> {
    let mut t = raw;
    let second = t % 60;
    t /= 60;
    let minute = t % 60;
    t /= 60;
    let hour = t % 24;
    t /= 24;
    let day = t % 31 + 1;
    t /= 31;
    let month = t % 12 + 1;
    t /= 12;
    let year = t + 2000;

    NaiveDate::from_ymd_opt(year as i32, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .ok_or_else(|| ZkError::protocol(format!("invalid packed timestamp {raw:#010x}")))
}

/// Decode the 6-byte timestamp form used in live-capture records:
/// `{year-2000, month, day, hour, minute, second}` as unsigned bytes.
pub(crate) fn decode_timehex(raw: &[u8; 6]) -> Result<NaiveDateTime> {
    NaiveDate::from_ymd_opt(2000 + raw[0] as i32, raw[1] as u32, raw[2] as u32)
        .and_then(|d| d.and_hms_opt(raw[3] as u32, raw[4] as u32, raw[5] as u32))
        .ok_or_else(|| ZkError::protocol(format!("invalid event timestamp {raw:02x?}")))
}

/// Encode a timestamp into the 6-byte form.
#[cfg(test)]
pub(crate) fn encode_timehex(t: &NaiveDateTime) -> [u8; 6] {
    [
        (t.year() - 2000) as u8,
        t.month() as u8,
        t.day() as u8,
        t.hour() as u8,
        t.minute() as u8,
        t.second() as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zk::consts::CMD_CONNECT;

    #[test]
    fn checksum_matches_device_capture() {
        // CMD_CONNECT header with session=0, reply=0, no payload.
        let data = [0xE8, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(checksum(&data), 0xFC17);
    }

    #[test]
    fn checksum_empty() {
        assert_eq!(checksum(&[]), 0xFFFF);
    }

    #[test]
    fn checksum_odd_length_adds_trailing_byte() {
        assert_eq!(checksum(&[0x01, 0x00, 0x02]), !0x0003 & 0xFFFF);
    }

    #[test]
    fn frame_round_trip() {
        let payload = [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x42];
        let raw = build_frame(CMD_CONNECT, 0x1234, 7, &payload);
        let frame = parse_frame(&raw).unwrap();
        assert_eq!(frame.command, CMD_CONNECT);
        assert_eq!(frame.session_id, 0x1234);
        assert_eq!(frame.reply_id, 7);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn frame_bit_flip_fails_verification() {
        let raw = build_frame(CMD_CONNECT, 0x1234, 7, &[0xAA, 0xBB, 0xCC]);
        for byte in 0..raw.len() {
            for bit in 0..8 {
                let mut corrupted = raw.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    parse_frame(&corrupted).is_err(),
                    "flip of byte {byte} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn tcp_top_round_trip() {
        let frame = build_frame(CMD_CONNECT, 0, 0, &[]);
        let packet = wrap_tcp(&frame);
        assert_eq!(packet.len(), 16);
        let top: [u8; 8] = packet[..8].try_into().unwrap();
        assert_eq!(parse_tcp_top(&top).unwrap(), frame.len());
    }

    #[test]
    fn tcp_top_rejects_bad_magic() {
        let top = [0x51, 0x50, 0x27, 0x08, 0x08, 0x00, 0x00, 0x00];
        assert!(parse_tcp_top(&top).is_err());
    }

    #[test]
    fn commkey_known_vector() {
        // password 12345, session 0x1234, default ticks: derived by hand
        // from the SDK algorithm.
        assert_eq!(make_commkey(12345, 0x1234, 50), [0x6D, 0xE1, 0x32, 0x6B]);
    }

    #[test]
    fn commkey_zero_password_still_scrambles() {
        let key = make_commkey(0, 0, 50);
        assert_eq!(key[2], 50);
        assert_ne!(key, [0, 0, 50, 0]);
    }

    #[test]
    fn packed_time_round_trip() {
        for (y, mo, d, h, mi, s) in [
            (2000, 1, 1, 0, 0, 0),
            (2025, 1, 15, 9, 30, 0),
            (2037, 6, 30, 12, 59, 59),
            (2099, 12, 31, 23, 59, 59),
        ] {
            let t = NaiveDate::from_ymd_opt(y, mo, d)
                .unwrap()
                .and_hms_opt(h, mi, s)
                .unwrap();
            assert_eq!(decode_time(encode_time(&t)).unwrap(), t);
        }
    }

    #[test]
    fn timehex_round_trip() {
        let t = NaiveDate::from_ymd_opt(2025, 1, 15)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        let raw = encode_timehex(&t);
        assert_eq!(raw, [25, 1, 15, 9, 30, 0]);
        assert_eq!(decode_timehex(&raw).unwrap(), t);
    }

    #[test]
    fn decode_time_rejects_impossible_date() {
        // month field decodes to a valid range by construction, but day 31
        // of a 30-day month must fail closed.
        let t = NaiveDate::from_ymd_opt(2024, 4, 30)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let raw = encode_time(&t) + 86400; // day 31 of April
        assert!(decode_time(raw).is_err());
    }
}
