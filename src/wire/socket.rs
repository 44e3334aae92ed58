//! Byte-transfer primitives shared by the sender and receiver endpoints.
//!
//! The [`Socket`] and [`Listener`] enums are the seam where transport
//! flavors differ; everything above them (framing, ring, negotiation) is
//! flavor-agnostic. An encrypted flavor plugs in here by adding a variant.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::Duration;

/// A connected byte stream of either transport flavor.
#[derive(Debug)]
pub(crate) enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Socket {
    /// Shut down both directions, waking any thread blocked on the socket.
    pub fn shutdown(&self) {
        let _ = match self {
            Socket::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            Socket::Unix(s) => s.shutdown(std::net::Shutdown::Both),
        };
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Socket::Tcp(s) => s.set_read_timeout(timeout),
            Socket::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    pub fn set_nodelay(&self) {
        if let Socket::Tcp(s) = self {
            let _ = s.set_nodelay(true);
        }
    }

    /// Sockets accepted from a non-blocking listener inherit the flag on
    /// some platforms; sender threads want plain blocking writes.
    pub fn set_blocking(&self) {
        let _ = match self {
            Socket::Tcp(s) => s.set_nonblocking(false),
            Socket::Unix(s) => s.set_nonblocking(false),
        };
    }

    pub fn raw_fd(&self) -> i32 {
        match self {
            Socket::Tcp(s) => s.as_raw_fd(),
            Socket::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.read(buf),
            Socket::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.write(buf),
            Socket::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Socket::Tcp(s) => s.flush(),
            Socket::Unix(s) => s.flush(),
        }
    }
}

/// Shut down a socket owned by another thread through its file descriptor.
/// This is the wakeup primitive for sender threads blocked in `send`.
pub(crate) fn shutdown_fd(fd: i32) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}

/// A listening socket of either transport flavor.
#[derive(Debug)]
pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(nonblocking),
            Listener::Unix(l) => l.set_nonblocking(nonblocking),
        }
    }

    /// Accept one connection and derive the stable client id: the remote
    /// port for TCP, the peer pid for unix sockets.
    pub fn accept(&self) -> std::io::Result<(Socket, u32)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, addr) = l.accept()?;
                Ok((Socket::Tcp(stream), addr.port() as u32))
            }
            Listener::Unix(l) => {
                let (stream, _) = l.accept()?;
                let id = peer_pid(&stream).unwrap_or(0);
                Ok((Socket::Unix(stream), id))
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Unix(..) => None,
        }
    }
}

/// Peer pid of a connected unix socket via SO_PEERCRED.
fn peer_pid(stream: &UnixStream) -> Option<u32> {
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    (rc == 0 && cred.pid > 0).then(|| cred.pid as u32)
}

#[cfg(test)]
mod tests {
    use super::{Listener, Socket};
    use std::io::{Read, Write};

    #[test]
    pub fn tcp_accept_and_id() {
        crate::tests::init();
        let listener = Listener::Tcp(std::net::TcpListener::bind("127.0.0.1:0").unwrap());
        let addr = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(addr).unwrap();
        let (mut server_side, id) = listener.accept().unwrap();
        assert_eq!(id, client.local_addr().unwrap().port() as u32);

        let mut client = Socket::Tcp(client);
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server_side.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    pub fn unix_accept_reports_own_pid() {
        crate::tests::init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let listener =
            Listener::Unix(std::os::unix::net::UnixListener::bind(&path).unwrap());

        let _client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        let (_server_side, id) = listener.accept().unwrap();
        assert_eq!(id, std::process::id());
    }
}
