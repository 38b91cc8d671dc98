//! TCP socket tuning and listener setup.
//!
//! compio owns the sockets; options it does not expose are set through a
//! borrowed `socket2::Socket` built from the raw descriptor and forgotten
//! afterwards so the descriptor is not closed twice.
//!
//! # Safety
//!
//! The raw descriptor borrow is the only unsafe operation here. It never
//! outlives the call and never closes the socket.

#![allow(unsafe_code)]

use crate::options::EngineOptions;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Per-socket options applied to every accepted or connected stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketTuning {
    pub nodelay: bool,
    pub keepalive: Option<Duration>,
    /// 0 keeps the OS default.
    pub sndbuf: usize,
    /// 0 keeps the OS default.
    pub rcvbuf: usize,
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self::from(&EngineOptions::default())
    }
}

impl From<&EngineOptions> for SocketTuning {
    fn from(options: &EngineOptions) -> Self {
        Self {
            nodelay: options.tcp_nodelay,
            keepalive: options.tcp_keepalive,
            sndbuf: options.sndbuf,
            rcvbuf: options.rcvbuf,
        }
    }
}

impl SocketTuning {
    fn apply(&self, sock: &Socket) -> io::Result<()> {
        if self.nodelay {
            sock.set_nodelay(true)?;
        }
        if let Some(idle) = self.keepalive {
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        if self.sndbuf > 0 {
            sock.set_send_buffer_size(self.sndbuf)?;
        }
        if self.rcvbuf > 0 {
            sock.set_recv_buffer_size(self.rcvbuf)?;
        }
        Ok(())
    }
}

/// Run `f` against a borrowed view of the stream's socket.
#[inline]
fn with_socket<R>(
    stream: &compio::net::TcpStream,
    f: impl FnOnce(&Socket) -> io::Result<R>,
) -> io::Result<R> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { Socket::from_raw_fd(fd) };
        let result = f(&sock);
        std::mem::forget(sock); // Don't close the fd
        result
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = stream.as_raw_socket();
        let sock = unsafe { Socket::from_raw_socket(raw) };
        let result = f(&sock);
        std::mem::forget(sock); // Don't close the socket
        result
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (stream, f);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "socket options unsupported on this platform",
        ))
    }
}

/// Disable Nagle's algorithm on one stream.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
#[inline]
pub fn enable_tcp_nodelay(stream: &compio::net::TcpStream) -> io::Result<()> {
    with_socket(stream, |sock| sock.set_nodelay(true))
}

/// Apply `tuning` to a freshly accepted or connected stream.
///
/// # Errors
///
/// Returns the first socket option that could not be set.
pub fn configure_stream(stream: &compio::net::TcpStream, tuning: &SocketTuning) -> io::Result<()> {
    with_socket(stream, |sock| tuning.apply(sock))
}

/// Bind a non-blocking listener.
///
/// With `reuse_port` several listeners (one per I/O thread) may bind the same
/// address and the kernel spreads accepted connections across them.
///
/// # Errors
///
/// Socket creation, option, bind or listen failures.
pub fn bind_listener(
    addr: SocketAddr,
    reuse_port: bool,
    backlog: i32,
) -> io::Result<std::net::TcpListener> {
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    if reuse_port {
        sock.set_reuse_port(true)?;
    }
    #[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
    let _ = reuse_port;
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;
    sock.listen(backlog)?;
    Ok(sock.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_follows_options() {
        let options = EngineOptions::new()
            .with_tcp_nodelay(false)
            .with_tcp_keepalive(Duration::from_secs(30));
        let tuning = SocketTuning::from(&options);
        assert!(!tuning.nodelay);
        assert_eq!(tuning.keepalive, Some(Duration::from_secs(30)));
        assert_eq!(tuning.sndbuf, 0);
    }

    #[test]
    fn reuse_port_listeners_share_an_address() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), true, 128).unwrap();
        let addr = first.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        #[cfg(target_os = "linux")]
        {
            let second = bind_listener(addr, true, 128).unwrap();
            assert_eq!(second.local_addr().unwrap(), addr);
        }
    }

    #[test]
    fn tunes_a_live_stream() {
        compio::runtime::Runtime::new().unwrap().block_on(async {
            let listener = compio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (client, accepted) = futures::join!(
                compio::net::TcpStream::connect(addr),
                listener.accept()
            );
            let client = client.unwrap();
            let (server, _) = accepted.unwrap();
            enable_tcp_nodelay(&client).unwrap();
            configure_stream(&server, &SocketTuning::default()).unwrap();
        });
    }
}
