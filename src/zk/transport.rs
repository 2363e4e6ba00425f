//! Socket strategy for the two device transports.
//!
//! The codec differences between TCP and UDP are confined here: TCP frames
//! carry an 8-byte length prefix and arrive over a stream (read with exact
//! lengths), UDP frames are one datagram each.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use super::codec::{self, Frame};
use super::consts::{MAX_FRAME_SIZE, UDP_DATA_RECV_SIZE};
use super::error::{Result, ZkError};

/// Outcome of a receive attempt under a soft timeout.
pub(crate) enum Recv {
    Frame(Frame),
    /// The soft timeout elapsed without traffic; the session is fine.
    TimedOut,
}

pub(crate) enum Transport {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Transport {
    /// Open the transport toward the device.
    pub(crate) async fn connect(addr: SocketAddr, udp: bool, connect_timeout: Duration) -> Result<Self> {
        if udp {
            let bind_addr = if addr.is_ipv4() {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
            } else {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
            };
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.connect(addr).await?;
            Ok(Self::Udp(socket))
        } else {
            let stream = timeout(connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| ZkError::Timeout)??;
            Ok(Self::Tcp(stream))
        }
    }

    pub(crate) fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp(_))
    }

    /// Send one frame, wrapping it in the TCP length prefix when needed.
    pub(crate) async fn send_frame(&mut self, frame: &[u8], io_timeout: Duration) -> Result<()> {
        match self {
            Self::Tcp(stream) => {
                let packet = codec::wrap_tcp(frame);
                timeout(io_timeout, stream.write_all(&packet))
                    .await
                    .map_err(|_| ZkError::Timeout)??;
            }
            Self::Udp(socket) => {
                timeout(io_timeout, socket.send(frame))
                    .await
                    .map_err(|_| ZkError::Timeout)??;
            }
        }
        Ok(())
    }

    /// Receive one frame within `io_timeout`; the timeout is a hard error.
    pub(crate) async fn recv_frame(&mut self, io_timeout: Duration) -> Result<Frame> {
        match self.recv_frame_soft(io_timeout, io_timeout).await? {
            Recv::Frame(frame) => Ok(frame),
            Recv::TimedOut => Err(ZkError::Timeout),
        }
    }

    /// Receive one frame, treating an elapsed `soft_timeout` as a quiet
    /// interval instead of an error. Live capture polls with this.
    ///
    /// On TCP the soft timeout gates only the wait for the frame's first
    /// byte: `read_exact` is not cancellation-safe, and cancelling it
    /// between the length prefix and the body would lose the bytes already
    /// pulled off the socket and desync the stream. Once a frame has
    /// started it is completed under `frame_timeout`, where a timeout is a
    /// session-fatal error. UDP datagrams arrive whole, so the soft
    /// timeout covers the single recv.
    pub(crate) async fn recv_frame_soft(
        &mut self,
        soft_timeout: Duration,
        frame_timeout: Duration,
    ) -> Result<Recv> {
        match self {
            Self::Tcp(stream) => {
                // a 1-byte read either completes or consumes nothing, so
                // dropping it on timeout cannot lose data
                let mut first = [0u8; 1];
                match timeout(soft_timeout, stream.read_exact(&mut first)).await {
                    Ok(n) => {
                        n?;
                    }
                    Err(_) => return Ok(Recv::TimedOut),
                }

                let read_rest = async {
                    let mut top = [0u8; 8];
                    top[0] = first[0];
                    stream.read_exact(&mut top[1..]).await?;
                    let length = codec::parse_tcp_top(&top)?;
                    if length < 8 || length > MAX_FRAME_SIZE {
                        return Err(ZkError::protocol(format!("implausible frame length {length}")));
                    }
                    let mut body = vec![0u8; length];
                    stream.read_exact(&mut body).await?;
                    codec::parse_frame(&body)
                };
                match timeout(frame_timeout, read_rest).await {
                    Ok(frame) => Ok(Recv::Frame(frame?)),
                    Err(_) => Err(ZkError::Timeout),
                }
            }
            Self::Udp(socket) => {
                let mut buf = vec![0u8; UDP_DATA_RECV_SIZE];
                match timeout(soft_timeout, socket.recv(&mut buf)).await {
                    Ok(n) => {
                        let n = n?;
                        debug!("udp datagram: {n} bytes");
                        Ok(Recv::Frame(codec::parse_frame(&buf[..n])?))
                    }
                    Err(_) => Ok(Recv::TimedOut),
                }
            }
        }
    }
}

/// Probe device reachability with a plain TCP connect.
///
/// Preferred over ICMP ping: no raw-socket privileges or platform forks,
/// and it exercises the port the protocol actually uses.
pub(crate) async fn probe_tcp(addr: SocketAddr, probe_timeout: Duration) -> bool {
    matches!(timeout(probe_timeout, TcpStream::connect(addr)).await, Ok(Ok(_)))
}
