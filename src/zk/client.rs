//! Stateful session client for one ZKTeco device.
//!
//! Drives the authenticated handshake, request/response exchanges, bulk
//! table downloads, and the live-capture event stream over either transport.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::codec::{self, decode_time, encode_time, make_commkey};
use super::consts::*;
use super::error::{Result, ZkError};
use super::records::{self, Attendance, DeviceSizes, User};
use super::transport::{Recv, Transport, probe_tcp};

/// Tick counter fed into the comm-key scramble.
const COMMKEY_TICKS: u8 = 50;

/// Timeout for the reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection options for one device session.
#[derive(Debug, Clone)]
pub struct ZkOptions {
    pub ip: String,
    pub port: u16,
    /// Numeric communication password; 0 when the device has none.
    pub password: u32,
    /// Hard timeout for request/response exchanges.
    pub timeout: Duration,
    pub force_udp: bool,
    /// Probe TCP reachability before connecting.
    pub precheck: bool,
}

impl Default for ZkOptions {
    fn default() -> Self {
        Self {
            ip: String::new(),
            port: DEFAULT_PORT,
            password: 0,
            timeout: Duration::from_secs(60),
            force_udp: false,
            precheck: false,
        }
    }
}

/// One pull from the live-capture stream.
#[derive(Debug)]
pub enum LiveEvent {
    /// A punch delivered by the device (already ACKed).
    Punch(Attendance),
    /// Quiet interval or ignorable traffic; serves as a cancellation
    /// checkpoint without tearing the session down.
    Tick,
}

/// Shared flag that ends a running live capture from another task.
#[derive(Debug, Clone)]
pub struct CaptureGuard(Arc<AtomicBool>);

impl CaptureGuard {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Classified reply to a single request.
struct Reply {
    code: u16,
    payload: Vec<u8>,
}

struct LiveState {
    pending: VecDeque<Attendance>,
    was_enabled: bool,
}

/// Session client for a single device.
pub struct ZkClient {
    options: ZkOptions,
    transport: Option<Transport>,
    session_id: u16,
    reply_id: u16,
    is_connected: bool,
    is_enabled: bool,
    user_packet_size: usize,
    end_live_capture: Arc<AtomicBool>,
    live: Option<LiveState>,
}

impl ZkClient {
    pub fn new(options: ZkOptions) -> Self {
        Self {
            options,
            transport: None,
            session_id: 0,
            reply_id: USHRT_MAX - 1,
            is_connected: false,
            is_enabled: true,
            user_packet_size: 28,
            end_live_capture: Arc::new(AtomicBool::new(false)),
            live: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    /// Negotiated user record size: 28 on old firmware, 72 on current.
    pub fn user_packet_size(&self) -> usize {
        self.user_packet_size
    }

    /// Handle used to end a live capture from outside the owning task.
    pub fn capture_guard(&self) -> CaptureGuard {
        CaptureGuard(Arc::clone(&self.end_live_capture))
    }

    fn device_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.options.ip.parse().map_err(|_| {
            ZkError::Network(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid device address {}", self.options.ip),
            ))
        })?;
        Ok(SocketAddr::new(ip, self.options.port))
    }

    /// Open the transport and establish an authenticated session.
    ///
    /// Sends CMD_CONNECT, captures the device-assigned session id, and runs
    /// the CMD_AUTH exchange when the device demands a password.
    pub async fn connect(&mut self) -> Result<()> {
        let addr = self.device_addr()?;
        self.end_live_capture.store(false, Ordering::SeqCst);

        if self.options.precheck {
            if !probe_tcp(addr, PROBE_TIMEOUT).await {
                return Err(ZkError::Network(std::io::Error::new(
                    std::io::ErrorKind::HostUnreachable,
                    format!("device {addr} unreachable"),
                )));
            }
            if !self.options.force_udp {
                self.user_packet_size = 72;
            }
        }

        let transport = Transport::connect(addr, self.options.force_udp, self.options.timeout).await?;
        self.transport = Some(transport);
        self.session_id = 0;
        self.reply_id = USHRT_MAX - 1;

        match self.send_command(CMD_CONNECT, &[]).await {
            Ok(_) => {}
            Err(ZkError::Unauthenticated) => {
                debug!("device demanded auth, deriving comm key");
                let key = make_commkey(self.options.password, self.session_id, COMMKEY_TICKS);
                match self.send_command(CMD_AUTH, &key).await {
                    Ok(_) => {}
                    Err(e) => {
                        self.transport = None;
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                self.transport = None;
                return Err(e);
            }
        }

        self.is_connected = true;
        self.is_enabled = true;
        info!(
            "connected to {addr} ({}), session_id={:#06x}",
            if self.options.force_udp { "udp" } else { "tcp" },
            self.session_id
        );
        Ok(())
    }

    /// Best-effort CMD_EXIT and socket teardown. Idempotent, safe after a
    /// fault.
    pub async fn disconnect(&mut self) {
        if self.is_connected && self.transport.is_some() {
            if let Err(e) = self.exchange(CMD_EXIT, &[]).await {
                debug!("exit command failed during disconnect: {e}");
            }
        }
        self.transport = None;
        self.is_connected = false;
        self.is_enabled = true;
        self.session_id = 0;
        self.reply_id = USHRT_MAX - 1;
        self.live = None;
    }

    /// Read the device clock.
    pub async fn get_time(&mut self) -> Result<chrono::NaiveDateTime> {
        let reply = self.send_command(CMD_GET_TIME, &[]).await?;
        if reply.payload.len() < 4 {
            return Err(ZkError::protocol("get-time reply too short"));
        }
        decode_time(u32::from_le_bytes([
            reply.payload[0],
            reply.payload[1],
            reply.payload[2],
            reply.payload[3],
        ]))
    }

    /// Set the device clock.
    pub async fn set_time(&mut self, t: &chrono::NaiveDateTime) -> Result<()> {
        let payload = encode_time(t).to_le_bytes();
        self.send_command(CMD_SET_TIME, &payload).await?;
        Ok(())
    }

    /// Allow user activity on the device again.
    pub async fn enable_device(&mut self) -> Result<()> {
        self.send_command(CMD_ENABLEDEVICE, &[]).await?;
        self.is_enabled = true;
        Ok(())
    }

    /// Lock the device against user activity (shown as "working..." on the
    /// terminal).
    pub async fn disable_device(&mut self) -> Result<()> {
        self.send_command(CMD_DISABLEDEVICE, &[]).await?;
        self.is_enabled = false;
        Ok(())
    }

    pub async fn restart(&mut self) -> Result<()> {
        self.send_command(CMD_RESTART, &[]).await?;
        self.is_connected = false;
        self.transport = None;
        Ok(())
    }

    pub async fn poweroff(&mut self) -> Result<()> {
        self.send_command(CMD_POWEROFF, &[]).await?;
        self.is_connected = false;
        self.transport = None;
        Ok(())
    }

    /// Commit pending data changes on the device.
    pub async fn refresh_data(&mut self) -> Result<()> {
        self.send_command(CMD_REFRESHDATA, &[]).await?;
        Ok(())
    }

    /// Release the door lock for `seconds`.
    pub async fn unlock(&mut self, seconds: u32) -> Result<()> {
        let payload = (seconds * 10).to_le_bytes();
        self.send_command(CMD_UNLOCK, &payload).await?;
        Ok(())
    }

    /// Wipe the device's attendance log.
    pub async fn clear_attendance(&mut self) -> Result<()> {
        self.send_command(CMD_CLEAR_ATTLOG, &[]).await?;
        Ok(())
    }

    /// Release the device-side transfer buffer.
    pub async fn free_data(&mut self) -> Result<()> {
        self.send_command(CMD_FREE_DATA, &[]).await?;
        Ok(())
    }

    /// Remove a user record by device index.
    pub async fn delete_user(&mut self, uid: u16) -> Result<()> {
        self.send_command(CMD_DELETE_USER, &uid.to_le_bytes()).await?;
        self.refresh_data().await
    }

    async fn reg_event(&mut self, flags: u32) -> Result<()> {
        self.send_command(CMD_REG_EVENT, &flags.to_le_bytes()).await?;
        Ok(())
    }

    async fn cancel_capture(&mut self) -> Result<()> {
        self.send_command(CMD_CANCELCAPTURE, &[]).await?;
        Ok(())
    }

    async fn start_verify(&mut self) -> Result<()> {
        self.send_command(CMD_STARTVERIFY, &[]).await?;
        Ok(())
    }

    /// Read the device's storage counters.
    pub async fn read_sizes(&mut self) -> Result<DeviceSizes> {
        let reply = self.send_command(CMD_GET_FREE_SIZES, &[]).await?;
        DeviceSizes::parse(&reply.payload)
    }

    pub async fn get_firmware_version(&mut self) -> Result<String> {
        let reply = self.send_command(CMD_GET_VERSION, &[]).await?;
        Ok(cstr(&reply.payload))
    }

    pub async fn get_serial_number(&mut self) -> Result<String> {
        self.read_option("~SerialNumber").await
    }

    pub async fn get_platform(&mut self) -> Result<String> {
        self.read_option("~Platform").await
    }

    pub async fn get_device_name(&mut self) -> Result<String> {
        self.read_option("~DeviceName").await
    }

    /// Read a named device option. Replies come back as `name=value`.
    async fn read_option(&mut self, name: &str) -> Result<String> {
        let mut payload = name.as_bytes().to_vec();
        payload.push(0);
        let reply = self.send_command(CMD_OPTIONS_RRQ, &payload).await?;
        let raw = cstr(&reply.payload);
        Ok(raw
            .split_once('=')
            .map(|(_, value)| value.to_string())
            .unwrap_or(raw))
    }

    /// Bulk-download the historical attendance log.
    ///
    /// The per-record layout is selected by the advertised record size
    /// (total bytes / record count); unknown sizes fail closed.
    pub async fn get_attendance(&mut self) -> Result<Vec<Attendance>> {
        let sizes = self.read_sizes().await?;
        if sizes.records == 0 {
            return Ok(Vec::new());
        }

        let raw = self.read_table(CMD_ATTLOG_RRQ, 0).await?;
        if raw.len() < 4 {
            return Ok(Vec::new());
        }
        let total = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        let body = &raw[4..];
        if total == 0 {
            return Ok(Vec::new());
        }
        if body.len() < total {
            return Err(ZkError::protocol(format!(
                "attendance body truncated: advertised {total}, received {}",
                body.len()
            )));
        }

        let record_size = total / sizes.records as usize;
        let records = records::parse_attendance(&body[..total], record_size)?;
        info!("downloaded {} attendance records", records.len());
        Ok(records)
    }

    /// Bulk-download the user table. Records are 28 bytes on old firmware,
    /// 72 on current.
    pub async fn get_users(&mut self) -> Result<Vec<User>> {
        let sizes = self.read_sizes().await?;
        if sizes.users == 0 {
            return Ok(Vec::new());
        }

        let raw = self.read_table(CMD_USERTEMP_RRQ, FCT_USER).await?;
        if raw.len() < 4 {
            return Ok(Vec::new());
        }
        let total = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        let body = &raw[4..];
        if total == 0 {
            return Ok(Vec::new());
        }
        if body.len() < total {
            return Err(ZkError::protocol(format!(
                "user body truncated: advertised {total}, received {}",
                body.len()
            )));
        }

        let record_size = total / sizes.users as usize;
        self.user_packet_size = record_size;
        records::parse_users(&body[..total], record_size)
    }

    /// Download a device table, preferring the chunked read-with-buffer
    /// path and falling back to the legacy direct command when the firmware
    /// rejects it.
    async fn read_table(&mut self, command: u16, fct: i32) -> Result<Vec<u8>> {
        match self.read_with_buffer(command, fct, 0).await {
            Ok(data) => Ok(data),
            Err(ZkError::Protocol(msg)) => {
                warn!("buffered read rejected ({msg}); using legacy path");
                self.read_legacy(command, &[]).await
            }
            Err(e) => Err(e),
        }
    }

    /// Chunked bulk read (commands 1503/1504).
    pub(crate) async fn read_with_buffer(&mut self, command: u16, fct: i32, ext: i32) -> Result<Vec<u8>> {
        let max_chunk = if self.is_tcp() { MAX_CHUNK_TCP } else { MAX_CHUNK_UDP } as usize;

        let mut request = Vec::with_capacity(11);
        request.push(1u8);
        request.extend_from_slice(&(command as i16).to_le_bytes());
        request.extend_from_slice(&fct.to_le_bytes());
        request.extend_from_slice(&ext.to_le_bytes());

        let reply = self.send_command(CMD_PREPARE_BUFFER, &request).await?;
        if reply.code == CMD_DATA {
            // small table: the whole body rode along on the first reply
            return Ok(reply.payload);
        }

        if reply.payload.len() < 5 {
            return Err(ZkError::protocol("prepare-buffer reply too short"));
        }
        let size = u32::from_le_bytes([
            reply.payload[1],
            reply.payload[2],
            reply.payload[3],
            reply.payload[4],
        ]) as usize;
        debug!("buffered read: {size} bytes in chunks of <= {max_chunk}");
        if size == 0 {
            self.free_data().await?;
            return Ok(Vec::new());
        }

        let mut data = Vec::with_capacity(size);
        let mut start = 0usize;
        while start < size {
            let chunk = max_chunk.min(size - start);
            let piece = self.read_chunk(start as u32, chunk as u32).await?;
            data.extend_from_slice(&piece);
            start += chunk;
        }

        self.free_data().await?;
        Ok(data)
    }

    /// Fetch one chunk of a prepared buffer, retrying malformed exchanges.
    async fn read_chunk(&mut self, start: u32, size: u32) -> Result<Vec<u8>> {
        let mut request = [0u8; 8];
        request[0..4].copy_from_slice(&(start as i32).to_le_bytes());
        request[4..8].copy_from_slice(&(size as i32).to_le_bytes());

        for attempt in 1..=3u32 {
            let outcome = match self.send_command(CMD_READ_BUFFER, &request).await {
                Ok(reply) => self.receive_bulk(reply).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(data) => return Ok(data),
                Err(e @ (ZkError::Network(_) | ZkError::Timeout | ZkError::NotConnected)) => {
                    return Err(e);
                }
                Err(e) => warn!("chunk read at {start} failed (attempt {attempt}/3): {e}"),
            }
        }
        Err(ZkError::protocol(format!(
            "chunk read at {start}:[{size}] failed after 3 attempts"
        )))
    }

    /// Legacy bulk read: issue the table command directly and drain the
    /// PREPARE_DATA / DATA* / ACK_OK stream.
    pub(crate) async fn read_legacy(&mut self, command: u16, payload: &[u8]) -> Result<Vec<u8>> {
        let reply = self.send_command(command, payload).await?;
        self.receive_bulk(reply).await
    }

    /// Resolve a bulk reply into the table body.
    ///
    /// `CMD_DATA` carries the body inline. `CMD_PREPARE_DATA` advertises
    /// the size in its first four payload bytes and is followed by DATA
    /// frames until an ACK terminates the stream.
    async fn receive_bulk(&mut self, reply: Reply) -> Result<Vec<u8>> {
        match reply.code {
            CMD_DATA => Ok(reply.payload),
            CMD_PREPARE_DATA => {
                if reply.payload.len() < 4 {
                    return Err(ZkError::protocol("prepare-data reply too short"));
                }
                let size = u32::from_le_bytes([
                    reply.payload[0],
                    reply.payload[1],
                    reply.payload[2],
                    reply.payload[3],
                ]) as usize;

                let timeout = self.options.timeout;
                let transport = self.transport.as_mut().ok_or(ZkError::NotConnected)?;
                let mut data = Vec::with_capacity(size);
                loop {
                    let frame = match transport.recv_frame(timeout).await {
                        Ok(f) => f,
                        Err(e) => {
                            self.is_connected = false;
                            return Err(e);
                        }
                    };
                    match frame.command {
                        CMD_DATA => data.extend_from_slice(&frame.payload),
                        CMD_ACK_OK => break,
                        other => debug!("ignoring frame {other} inside data stream"),
                    }
                }
                Ok(data)
            }
            other => Err(ZkError::protocol(format!(
                "unexpected bulk reply code {other}"
            ))),
        }
    }

    /// Prepare the device for live capture and register for attendance
    /// events. The previous enable state is restored by
    /// [`Self::live_capture_end`].
    pub async fn live_capture_begin(&mut self) -> Result<()> {
        if !self.is_connected {
            return Err(ZkError::NotConnected);
        }
        let was_enabled = self.is_enabled;

        if let Err(e) = self.cancel_capture().await {
            debug!("cancel-capture before live capture failed: {e}");
        }
        self.start_verify().await?;
        if !self.is_enabled {
            self.enable_device().await?;
        }
        self.reg_event(EF_ATTLOG).await?;

        self.end_live_capture.store(false, Ordering::SeqCst);
        self.live = Some(LiveState {
            pending: VecDeque::new(),
            was_enabled,
        });
        info!("live capture started");
        Ok(())
    }

    /// Pull the next live event, blocking at most `soft_timeout`.
    ///
    /// A quiet interval yields [`LiveEvent::Tick`] so the caller can observe
    /// cancellation without tearing down the session. Every received frame
    /// is ACKed before parsing; the device retransmits un-ACKed events.
    pub async fn live_capture_next(&mut self, soft_timeout: Duration) -> Result<LiveEvent> {
        match self.live.as_mut() {
            Some(live) => {
                if let Some(ev) = live.pending.pop_front() {
                    return Ok(LiveEvent::Punch(ev));
                }
            }
            None => return Err(ZkError::protocol("live capture not active")),
        }

        if self.end_live_capture.load(Ordering::SeqCst) {
            return Ok(LiveEvent::Tick);
        }

        let hard_timeout = self.options.timeout;
        let recv = {
            let transport = self.transport.as_mut().ok_or(ZkError::NotConnected)?;
            transport.recv_frame_soft(soft_timeout, hard_timeout).await
        };
        let frame = match recv {
            Ok(Recv::TimedOut) => return Ok(LiveEvent::Tick),
            Ok(Recv::Frame(frame)) => frame,
            Err(e) => {
                self.is_connected = false;
                return Err(e);
            }
        };

        if let Err(e) = self.send_event_ack().await {
            self.is_connected = false;
            return Err(e);
        }

        if frame.command != CMD_REG_EVENT {
            debug!("ignoring frame {} during live capture", frame.command);
            return Ok(LiveEvent::Tick);
        }

        let mut events = records::parse_live_events(&frame.payload)?;
        if events.is_empty() {
            return Ok(LiveEvent::Tick);
        }
        let first = events.remove(0);
        if let Some(live) = self.live.as_mut() {
            live.pending.extend(events);
        }
        Ok(LiveEvent::Punch(first))
    }

    /// Deregister events and restore the pre-capture enable state.
    pub async fn live_capture_end(&mut self) -> Result<()> {
        let Some(live) = self.live.take() else {
            return Ok(());
        };

        if self.is_connected {
            if let Err(e) = self.reg_event(0).await {
                warn!("event deregistration failed: {e}");
            }
            if !live.was_enabled {
                if let Err(e) = self.disable_device().await {
                    warn!("could not restore disabled state: {e}");
                }
            }
        }
        info!("live capture ended");
        Ok(())
    }

    fn is_tcp(&self) -> bool {
        self.transport.as_ref().map(Transport::is_tcp).unwrap_or(!self.options.force_udp)
    }

    /// Fire-and-forget ACK for a pushed event frame. Carries reply id 0.
    async fn send_event_ack(&mut self) -> Result<()> {
        let frame = codec::build_frame(CMD_ACK_OK, self.session_id, 0, &[]);
        let timeout = self.options.timeout;
        let transport = self.transport.as_mut().ok_or(ZkError::NotConnected)?;
        transport.send_frame(&frame, timeout).await
    }

    /// Issue one request and classify the reply.
    ///
    /// Only CMD_CONNECT and CMD_AUTH may run on an unestablished session.
    /// Network faults mark the session disconnected.
    async fn send_command(&mut self, command: u16, payload: &[u8]) -> Result<Reply> {
        if !matches!(command, CMD_CONNECT | CMD_AUTH) && !self.is_connected {
            return Err(ZkError::NotConnected);
        }

        let reply = match self.exchange(command, payload).await {
            Ok(reply) => reply,
            Err(e) => {
                if matches!(e, ZkError::Network(_) | ZkError::Timeout) {
                    self.is_connected = false;
                }
                return Err(e);
            }
        };

        match reply.code {
            CMD_ACK_OK | CMD_PREPARE_DATA | CMD_DATA => Ok(reply),
            CMD_ACK_UNAUTH => Err(ZkError::Unauthenticated),
            CMD_ACK_ERROR => Err(ZkError::protocol(format!(
                "command {command} failed on the device"
            ))),
            other => Err(ZkError::protocol(format!(
                "command {command} rejected with code {other}"
            ))),
        }
    }

    /// Raw request/response: bump the reply id, send, receive, and refresh
    /// session bookkeeping from the reply header.
    async fn exchange(&mut self, command: u16, payload: &[u8]) -> Result<Reply> {
        self.reply_id = next_reply_id(self.reply_id);
        let frame = codec::build_frame(command, self.session_id, self.reply_id, payload);

        let timeout = self.options.timeout;
        let transport = self.transport.as_mut().ok_or(ZkError::NotConnected)?;
        transport.send_frame(&frame, timeout).await?;
        let response = transport.recv_frame(timeout).await?;

        if command == CMD_CONNECT {
            // the device assigns the session id in its CONNECT reply
            self.session_id = response.session_id;
        }
        self.reply_id = response.reply_id;

        Ok(Reply {
            code: response.command,
            payload: response.payload,
        })
    }
}

/// Advance a reply id; ids live in `0..USHRT_MAX` and wrap.
fn next_reply_id(current: u16) -> u16 {
    if current >= USHRT_MAX - 1 { 0 } else { current + 1 }
}

/// Decode a NUL-terminated reply payload.
fn cstr(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}
