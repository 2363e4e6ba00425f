//! ZKTeco protocol constants.

/// TCP frame magic words, little-endian on the wire.
pub const MACHINE_PREPARE_DATA_1: u16 = 0x5050;
pub const MACHINE_PREPARE_DATA_2: u16 = 0x0827;

/// Frame header: command(2) + checksum(2) + session(2) + reply(2).
pub const HEADER_SIZE: usize = 8;

/// TCP length prefix: magic1(2) + magic2(2) + length(4).
pub const TCP_TOP_SIZE: usize = 8;

/// Reply ids live in 0..USHRT_MAX and wrap modulo this value.
pub const USHRT_MAX: u16 = 65535;

/// UDP datagram size used while draining bulk data streams.
pub const UDP_DATA_RECV_SIZE: usize = 1032;

/// Chunk ceilings for the 1503/1504 buffered read path.
pub const MAX_CHUNK_TCP: u32 = 65472;
pub const MAX_CHUNK_UDP: u32 = 16384;

/// Upper bound on a single framed payload; anything larger is a corrupt
/// length prefix.
pub const MAX_FRAME_SIZE: usize = 1_000_000;

// Table read commands
pub const CMD_DB_RRQ: u16 = 7;
pub const CMD_USER_WRQ: u16 = 8;
pub const CMD_USERTEMP_RRQ: u16 = 9;
pub const CMD_OPTIONS_RRQ: u16 = 11;
pub const CMD_OPTIONS_WRQ: u16 = 12;
pub const CMD_ATTLOG_RRQ: u16 = 13;
pub const CMD_CLEAR_ATTLOG: u16 = 14;
pub const CMD_DELETE_USER: u16 = 18;

// Device control
pub const CMD_UNLOCK: u16 = 31;
pub const CMD_GET_FREE_SIZES: u16 = 50;
pub const CMD_STARTVERIFY: u16 = 60;
pub const CMD_CANCELCAPTURE: u16 = 62;
pub const CMD_GET_TIME: u16 = 201;
pub const CMD_SET_TIME: u16 = 202;
pub const CMD_REG_EVENT: u16 = 500;

// Session control
pub const CMD_CONNECT: u16 = 1000;
pub const CMD_EXIT: u16 = 1001;
pub const CMD_ENABLEDEVICE: u16 = 1002;
pub const CMD_DISABLEDEVICE: u16 = 1003;
pub const CMD_RESTART: u16 = 1004;
pub const CMD_POWEROFF: u16 = 1005;
pub const CMD_REFRESHDATA: u16 = 1013;
pub const CMD_GET_VERSION: u16 = 1100;
pub const CMD_AUTH: u16 = 1102;

// Bulk transfer
pub const CMD_PREPARE_DATA: u16 = 1500;
pub const CMD_DATA: u16 = 1501;
pub const CMD_FREE_DATA: u16 = 1502;
pub const CMD_PREPARE_BUFFER: u16 = 1503;
pub const CMD_READ_BUFFER: u16 = 1504;

// Acks
pub const CMD_ACK_OK: u16 = 2000;
pub const CMD_ACK_ERROR: u16 = 2001;
pub const CMD_ACK_UNKNOWN: u16 = 2004;
pub const CMD_ACK_UNAUTH: u16 = 2005;

/// Event flag registering attendance-log pushes.
pub const EF_ATTLOG: u32 = 1;

/// Table selector for the user table on the 1503 path.
pub const FCT_USER: i32 = 5;

/// Default device port for both transports.
pub const DEFAULT_PORT: u16 = 4370;
