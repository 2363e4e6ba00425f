//! Record layouts for attendance logs, user lists, and live-capture events.
//!
//! Record sizes are run-time choices made by the device firmware: the
//! attendance table downloads as 8-, 16-, or 40-byte rows, users as 28- or
//! 72-byte rows, and live events arrive as 12-, 32-, 36-, or >=52-byte
//! payload slices. Each layout gets its own parser, selected by the
//! advertised size; unknown sizes fail closed.

use chrono::NaiveDateTime;
use tracing::warn;

use super::codec::{decode_time, decode_timehex};
use super::error::{Result, ZkError};

/// One punch delivered by a device, either from the historical log or from
/// the live-capture stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Attendance {
    /// User id as the device reports it; numeric or alphanumeric depending
    /// on the firmware generation.
    pub user_id: String,
    /// Device-local punch time, second precision.
    pub timestamp: NaiveDateTime,
    /// Device-defined verify mode (fingerprint, face, card, ...).
    pub status: u8,
    /// In/out/break code.
    pub punch: u8,
    /// Internal 16-bit device index, when the layout carries one.
    pub uid: u16,
}

/// A user row from the device's user table.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub uid: u16,
    pub user_id: String,
    pub name: String,
    pub privilege: u8,
    pub password: String,
    pub group_id: String,
    pub card: u32,
}

/// Decode a NUL-terminated ASCII field, dropping anything after the first
/// NUL byte.
fn decode_cstr(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

/// Parse the attendance table body at the advertised record size.
///
/// `data` is the table body with the 4-byte size prefix already stripped.
pub(crate) fn parse_attendance(data: &[u8], record_size: usize) -> Result<Vec<Attendance>> {
    match record_size {
        8 => parse_attendance_8(data),
        16 => parse_attendance_16(data),
        40 => parse_attendance_40(data),
        other => Err(ZkError::protocol(format!(
            "unsupported attendance record size {other}"
        ))),
    }
}

/// 8-byte rows: `uid:u16, status:u8, time:u32, punch:u8`.
fn parse_attendance_8(data: &[u8]) -> Result<Vec<Attendance>> {
    let mut out = Vec::with_capacity(data.len() / 8);
    for chunk in data.chunks_exact(8) {
        let uid = u16::from_le_bytes([chunk[0], chunk[1]]);
        let status = chunk[2];
        let raw_time = u32::from_le_bytes([chunk[3], chunk[4], chunk[5], chunk[6]]);
        let punch = chunk[7];
        out.push(Attendance {
            user_id: uid.to_string(),
            timestamp: decode_time(raw_time)?,
            status,
            punch,
            uid,
        });
    }
    Ok(out)
}

/// 16-byte rows: `user_id:u32, time:u32, status:u8, punch:u8, reserved:2,
/// workcode:u32`.
fn parse_attendance_16(data: &[u8]) -> Result<Vec<Attendance>> {
    let mut out = Vec::with_capacity(data.len() / 16);
    for chunk in data.chunks_exact(16) {
        let user_id = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let raw_time = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
        out.push(Attendance {
            user_id: user_id.to_string(),
            timestamp: decode_time(raw_time)?,
            status: chunk[8],
            punch: chunk[9],
            uid: 0,
        });
    }
    Ok(out)
}

/// 40-byte rows: `uid:u16, user_id:24s, status:u8, time:u32, punch:u8,
/// reserved:8`.
fn parse_attendance_40(data: &[u8]) -> Result<Vec<Attendance>> {
    let mut out = Vec::with_capacity(data.len() / 40);
    for chunk in data.chunks_exact(40) {
        let uid = u16::from_le_bytes([chunk[0], chunk[1]]);
        let user_id = decode_cstr(&chunk[2..26]);
        let status = chunk[26];
        let raw_time = u32::from_le_bytes([chunk[27], chunk[28], chunk[29], chunk[30]]);
        let punch = chunk[31];
        out.push(Attendance {
            user_id,
            timestamp: decode_time(raw_time)?,
            status,
            punch,
            uid,
        });
    }
    Ok(out)
}

/// Parse the user table body at the advertised record size (28 or 72).
pub(crate) fn parse_users(data: &[u8], record_size: usize) -> Result<Vec<User>> {
    match record_size {
        28 => Ok(parse_users_28(data)),
        72 => Ok(parse_users_72(data)),
        other => Err(ZkError::protocol(format!(
            "unsupported user record size {other}"
        ))),
    }
}

/// 28-byte rows: `uid:u16, privilege:u8, password:5s, name:8s, card:u32,
/// pad, group:u8, timezone:u16, user_id:u32`.
fn parse_users_28(data: &[u8]) -> Vec<User> {
    let mut out = Vec::with_capacity(data.len() / 28);
    for chunk in data.chunks_exact(28) {
        let uid = u16::from_le_bytes([chunk[0], chunk[1]]);
        let user_id = u32::from_le_bytes([chunk[24], chunk[25], chunk[26], chunk[27]]);
        let mut name = decode_cstr(&chunk[8..16]);
        if name.is_empty() {
            name = format!("NN-{user_id}");
        }
        out.push(User {
            uid,
            user_id: user_id.to_string(),
            name,
            privilege: chunk[2],
            password: decode_cstr(&chunk[3..8]),
            group_id: chunk[21].to_string(),
            card: u32::from_le_bytes([chunk[16], chunk[17], chunk[18], chunk[19]]),
        });
    }
    out
}

/// 72-byte rows: `uid:u16, privilege:u8, password:8s, name:24s, card:u32,
/// pad, group:7s, pad, user_id:24s`.
fn parse_users_72(data: &[u8]) -> Vec<User> {
    let mut out = Vec::with_capacity(data.len() / 72);
    for chunk in data.chunks_exact(72) {
        let uid = u16::from_le_bytes([chunk[0], chunk[1]]);
        let user_id = decode_cstr(&chunk[48..72]);
        let mut name = decode_cstr(&chunk[11..35]);
        if name.is_empty() {
            name = format!("NN-{user_id}");
        }
        out.push(User {
            uid,
            user_id,
            name,
            privilege: chunk[2],
            password: decode_cstr(&chunk[3..11]),
            group_id: decode_cstr(&chunk[40..47]),
            card: u32::from_le_bytes([chunk[35], chunk[36], chunk[37], chunk[38]]),
        });
    }
    out
}

/// Drain a REG_EVENT payload into punch records.
///
/// A single frame may carry several records back to back; the slice length
/// selects the layout. A remainder that matches no known layout is dropped
/// with a warning rather than looping forever.
pub(crate) fn parse_live_events(payload: &[u8]) -> Result<Vec<Attendance>> {
    let mut out = Vec::new();
    let mut data = payload;

    while data.len() >= 12 {
        let (record, rest): (Attendance, &[u8]) = if data.len() == 12 {
            let user_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            let timehex = [data[6], data[7], data[8], data[9], data[10], data[11]];
            (
                Attendance {
                    user_id: user_id.to_string(),
                    timestamp: decode_timehex(&timehex)?,
                    status: data[4],
                    punch: data[5],
                    uid: user_id as u16,
                },
                &data[12..],
            )
        } else if data.len() == 32 || data.len() == 36 || data.len() >= 52 {
            let consumed = match data.len() {
                32 => 32,
                36 => 36,
                _ => 52,
            };
            let user_id = decode_cstr(&data[..24]);
            let timehex = [data[26], data[27], data[28], data[29], data[30], data[31]];
            let uid = user_id.parse::<u16>().unwrap_or(0);
            (
                Attendance {
                    user_id,
                    timestamp: decode_timehex(&timehex)?,
                    status: data[24],
                    punch: data[25],
                    uid,
                },
                &data[consumed..],
            )
        } else {
            warn!("discarding {} unrecognised event bytes", data.len());
            break;
        };

        out.push(record);
        data = rest;
    }

    Ok(out)
}

/// Device storage counters from CMD_GET_FREE_SIZES (twenty i32 fields).
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceSizes {
    pub users: u32,
    pub fingers: u32,
    pub records: u32,
    pub cards: u32,
    pub fingers_cap: u32,
    pub users_cap: u32,
    pub records_cap: u32,
    pub fingers_av: u32,
    pub users_av: u32,
    pub records_av: u32,
}

impl DeviceSizes {
    /// Parse the 80-byte counter block.
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 80 {
            return Err(ZkError::protocol(format!(
                "free-sizes reply too short: {} bytes",
                data.len()
            )));
        }
        let field = |idx: usize| -> u32 {
            u32::from_le_bytes([
                data[idx * 4],
                data[idx * 4 + 1],
                data[idx * 4 + 2],
                data[idx * 4 + 3],
            ])
        };
        Ok(Self {
            users: field(4),
            fingers: field(6),
            records: field(8),
            cards: field(12),
            fingers_cap: field(14),
            users_cap: field(15),
            records_cap: field(16),
            fingers_av: field(17),
            users_av: field(18),
            records_av: field(19),
        })
    }
}
