//! Raw socket I/O behind two small traits.
//!
//! `Transport` writes one SYN segment per call over a transient raw socket;
//! `FrameSource` yields raw IPv4 frames for the reply listener. Both have
//! in-memory mocks so the sender, listener and session can be exercised
//! without `CAP_NET_RAW`.

use std::any::Any;
use std::net::Ipv4Addr;

use tokio::sync::mpsc;

use super::listener::ListenError;
use super::sender::ProbeError;
use crate::Timestamp;

/// Receive buffer size for raw frames. SYN-ACK/RST replies are small.
pub const RECV_BUFFER_LEN: usize = 4096;

/// Send side: deliver one encoded TCP segment to a remote host.
pub trait Transport: Send {
    /// Open a transient raw TCP connection to `remote`, write `segment`, and
    /// close it. Returns the instant captured immediately before the write.
    ///
    /// The segment must already carry a valid checksum; the kernel builds
    /// the IPv4 header.
    fn send_segment(&mut self, remote: Ipv4Addr, segment: &[u8]) -> Result<Timestamp, ProbeError>;

    /// Return `self` as `&dyn Any` to enable safe downcasting in tests.
    fn as_any(&self) -> &dyn Any;
}

/// Receive side: a blocking source of raw IPv4 frames.
pub trait FrameSource: Send {
    /// Block until a frame arrives, copy it into `buf`, and return its length
    /// and the sender address.
    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<(usize, Ipv4Addr), ListenError>;
}

/// Fail unless the whole segment was written.
pub fn ensure_complete(written: usize, expected: usize) -> Result<(), ProbeError> {
    if written != expected {
        return Err(ProbeError::ShortWrite { written, expected });
    }
    Ok(())
}

// =============================================================================
// Mock implementations for unit testing
// =============================================================================

/// Mock transport that records every segment it is asked to send.
#[derive(Debug, Default)]
pub struct MockTransport {
    /// `(remote, segment)` pairs in the order sent.
    pub sent: Vec<(Ipv4Addr, Vec<u8>)>,
    /// Whether the next `send_segment` should fail.
    pub fail_next_send: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of segments sent so far.
    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }
}

impl Transport for MockTransport {
    fn send_segment(&mut self, remote: Ipv4Addr, segment: &[u8]) -> Result<Timestamp, ProbeError> {
        if self.fail_next_send {
            self.fail_next_send = false;
            return Err(ProbeError::Dial("mock dial failure".into()));
        }
        let stamp = Timestamp::now();
        self.sent.push((remote, segment.to_vec()));
        Ok(stamp)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Handle for pushing frames into a [`MockFrameSource`] from a test.
///
/// Dropping every injector makes the source fail its next read, which the
/// listener treats as a fatal socket error.
#[derive(Debug, Clone)]
pub struct FrameInjector {
    tx: mpsc::UnboundedSender<(Vec<u8>, Ipv4Addr)>,
}

impl FrameInjector {
    /// Deliver `frame` as if received from `from`. Returns false if the
    /// source is gone.
    pub fn inject(&self, frame: Vec<u8>, from: Ipv4Addr) -> bool {
        self.tx.send((frame, from)).is_ok()
    }
}

/// Mock frame source fed through a channel.
#[derive(Debug)]
pub struct MockFrameSource {
    rx: mpsc::UnboundedReceiver<(Vec<u8>, Ipv4Addr)>,
}

impl MockFrameSource {
    /// A source plus the injector that feeds it.
    pub fn channel() -> (FrameInjector, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FrameInjector { tx }, Self { rx })
    }

    /// A source that yields `frames` and then fails.
    pub fn from_frames(frames: Vec<(Vec<u8>, Ipv4Addr)>) -> Self {
        let (injector, source) = Self::channel();
        for (frame, from) in frames {
            injector.inject(frame, from);
        }
        source
    }
}

impl FrameSource for MockFrameSource {
    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<(usize, Ipv4Addr), ListenError> {
        match self.rx.blocking_recv() {
            Some((frame, from)) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok((n, from))
            }
            None => Err(ListenError::Read("mock frame source closed".into())),
        }
    }
}

// =============================================================================
// Raw socket implementations (Linux only)
// =============================================================================

/// Owned raw socket descriptor, closed on drop.
#[cfg(target_os = "linux")]
struct RawSocket {
    fd: i32,
}

#[cfg(target_os = "linux")]
impl RawSocket {
    /// Open `SOCK_RAW / IPPROTO_TCP`. Requires `CAP_NET_RAW`.
    fn open_tcp() -> std::io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_TCP) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { fd })
    }
}

#[cfg(target_os = "linux")]
impl Drop for RawSocket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

#[cfg(target_os = "linux")]
fn sockaddr_in(ip: Ipv4Addr) -> libc::sockaddr_in {
    // sin_addr.s_addr is stored in network byte order, i.e. the octets in
    // memory order.
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(ip.octets()),
        },
        sin_zero: [0; 8],
    }
}

/// Transport opening a fresh `SOCK_RAW / IPPROTO_TCP` socket per probe.
///
/// No state is kept between probes; a failure to open one socket only
/// affects that probe.
#[cfg(target_os = "linux")]
#[derive(Debug, Default)]
pub struct RawTransport;

#[cfg(target_os = "linux")]
impl RawTransport {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
impl Transport for RawTransport {
    fn send_segment(&mut self, remote: Ipv4Addr, segment: &[u8]) -> Result<Timestamp, ProbeError> {
        let socket = RawSocket::open_tcp().map_err(|e| {
            ProbeError::Dial(format!("SOCK_RAW/IPPROTO_TCP (requires CAP_NET_RAW): {e}"))
        })?;

        let addr = sockaddr_in(remote);
        let ret = unsafe {
            libc::connect(
                socket.fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(ProbeError::Dial(format!(
                "connect to {remote}: {}",
                std::io::Error::last_os_error()
            )));
        }

        let stamp = Timestamp::now();
        let written = unsafe {
            libc::send(
                socket.fd,
                segment.as_ptr() as *const libc::c_void,
                segment.len(),
                0,
            )
        };
        if written < 0 {
            return Err(ProbeError::Write(std::io::Error::last_os_error().to_string()));
        }
        ensure_complete(written as usize, segment.len())?;

        Ok(stamp)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Raw `IPPROTO_TCP` socket bound to the local address, used by the reply
/// listener. Frames include the IPv4 header.
#[cfg(target_os = "linux")]
pub struct RawListenSocket {
    socket: RawSocket,
}

#[cfg(target_os = "linux")]
impl RawListenSocket {
    /// Open and bind the listening socket. Requires `CAP_NET_RAW`.
    ///
    /// # Errors
    /// `ListenError::Socket` if the socket cannot be created (typically a
    /// missing capability), `ListenError::Bind` if `local` is not ours.
    pub fn bind(local: Ipv4Addr) -> Result<Self, ListenError> {
        let socket = RawSocket::open_tcp().map_err(|e| {
            ListenError::Socket(format!("SOCK_RAW/IPPROTO_TCP (requires CAP_NET_RAW): {e}"))
        })?;

        let addr = sockaddr_in(local);
        let ret = unsafe {
            libc::bind(
                socket.fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(ListenError::Bind {
                addr: local,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }

        Ok(Self { socket })
    }
}

#[cfg(target_os = "linux")]
impl FrameSource for RawListenSocket {
    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<(usize, Ipv4Addr), ListenError> {
        loop {
            let mut from: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut from_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    self.socket.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    &mut from as *mut libc::sockaddr_in as *mut libc::sockaddr,
                    &mut from_len,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ListenError::Read(err.to_string()));
            }
            let source = Ipv4Addr::from(from.sin_addr.s_addr.to_ne_bytes());
            return Ok((n as usize, source));
        }
    }
}
