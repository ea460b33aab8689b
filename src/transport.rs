//! Datagram socket abstraction.
//!
//! The [`Socket`] trait is the narrow contract the host consumes:
//! non-blocking send/receive plus a bounded wait for read-readiness.
//! [`HostSocket`] is the UDP implementation; tests substitute in-memory
//! pairs to run the full protocol without touching the network.

use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Datagram transport used by a [`Host`](crate::Host).
///
/// Implementations must never block in `send_to`/`recv_from`; `wait` is
/// the single blocking point and is bounded by its timeout.
pub trait Socket {
    /// Send one datagram to `target`. Returns bytes written.
    fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram if available; `Ok(None)` when none is queued.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Block for up to `timeout_ms` milliseconds until a datagram may be
    /// readable. Returns whether the socket looked readable.
    fn wait(&mut self, timeout_ms: u32) -> io::Result<bool>;

    /// The local address this socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// The standard UDP socket transport.
pub struct HostSocket {
    socket: UdpSocket,
}

impl HostSocket {
    /// Bind to `addr`, or to an ephemeral wildcard port when `None`.
    pub fn bind(addr: Option<SocketAddr>) -> io::Result<Self> {
        let addr = addr.unwrap_or_else(|| "0.0.0.0:0".parse().expect("wildcard addr"));
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        configure_buffer_sizes(&socket);
        Ok(Self { socket })
    }

    /// Wrap an already-configured socket. The socket must be non-blocking.
    pub fn from_socket(socket: UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

#[cfg(unix)]
fn configure_buffer_sizes(socket: &UdpSocket) {
    use std::os::unix::io::AsRawFd;

    use crate::protocol::constants::{RECEIVE_BUFFER_SIZE, SEND_BUFFER_SIZE};

    // Default kernel buffers drop bursts well below our window sizes.
    // Failure here only costs throughput, so the result is ignored.
    let fd = socket.as_raw_fd();
    for (option, size) in [
        (libc::SO_RCVBUF, RECEIVE_BUFFER_SIZE as i32),
        (libc::SO_SNDBUF, SEND_BUFFER_SIZE as i32),
    ] {
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                option,
                &size as *const i32 as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            );
        }
    }
}

#[cfg(not(unix))]
fn configure_buffer_sizes(_socket: &UdpSocket) {}

impl Socket for HostSocket {
    fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // A previous send to an unreachable port surfaces here on some
            // platforms; treat it as "nothing received" rather than fatal.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[cfg(unix)]
    fn wait(&mut self, timeout_ms: u32) -> io::Result<bool> {
        use std::os::unix::io::AsRawFd;

        let mut pollfd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms.min(i32::MAX as u32) as i32) };
        match result {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
            0 => Ok(false),
            _ => Ok(pollfd.revents & libc::POLLIN != 0),
        }
    }

    #[cfg(not(unix))]
    fn wait(&mut self, timeout_ms: u32) -> io::Result<bool> {
        // Portable fallback: poll readability at millisecond granularity.
        use std::time::{Duration, Instant};

        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut probe = [0u8; 1];
        loop {
            match self.socket.peek_from(&mut probe) {
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_and_exchange() {
        let loopback: SocketAddr = "127.0.0.1:0".parse().expect("loopback");
        let mut a = HostSocket::bind(Some(loopback)).expect("bind a");
        let mut b = HostSocket::bind(Some(loopback)).expect("bind b");
        let b_addr = b.local_addr().expect("addr b");

        assert_eq!(a.recv_from(&mut [0u8; 16]).expect("empty recv"), None);

        a.send_to(b"probe", b_addr).expect("send");
        assert!(b.wait(500).expect("wait"));

        let mut buf = [0u8; 16];
        let (len, from) = b
            .recv_from(&mut buf)
            .expect("recv")
            .expect("datagram present");
        assert_eq!(&buf[..len], b"probe");
        assert_eq!(from.port(), a.local_addr().expect("addr a").port());
    }
}
