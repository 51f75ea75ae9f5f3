//! Owned socket descriptors and the raw read/write helpers built on them.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};

use crate::address::Address;

/// Default accept queue depth for listeners.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Exclusive owner of one descriptor.
///
/// Exactly one `SocketHandle` exists per descriptor; the descriptor is
/// closed exactly once, when the handle drops. Beyond sockets this also
/// wraps the loop's eventfd, which only needs the read/write helpers.
#[derive(Debug)]
pub struct SocketHandle {
    fd: OwnedFd,
}

impl SocketHandle {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Create a fresh IPv4 TCP stream socket.
    pub fn new_stream() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        Ok(Self { fd: socket.into() })
    }

    fn sock(&self) -> SockRef<'_> {
        SockRef::from(&self.fd)
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        self.sock().set_nonblocking(true)
    }

    pub fn set_reuse_address(&self) -> io::Result<()> {
        self.sock().set_reuse_address(true)
    }

    /// SO_REUSEPORT via raw setsockopt; socket2 gates it behind a feature.
    pub fn set_reuse_port(&self) -> io::Result<()> {
        let optval: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &optval as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_nodelay(&self) -> io::Result<()> {
        self.sock().set_nodelay(true)
    }

    pub fn bind(&self, addr: &Address) -> io::Result<()> {
        let sa = addr.to_socket_addr()?;
        self.sock().bind(&SockAddr::from(sa))
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.sock().listen(backlog)
    }

    /// Accept one pending connection.
    ///
    /// The accepted descriptor is created nonblocking and close-on-exec;
    /// without O_NONBLOCK the read path could not treat would-block as
    /// "drained for now". Returns `WouldBlock` when the queue is empty.
    pub fn accept(&self) -> io::Result<(OwnedFd, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let fd = unsafe {
            libc::accept4(
                self.fd.as_raw_fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let accepted = unsafe { OwnedFd::from_raw_fd(fd) };

        // Storage was filled by the kernel for exactly `len` bytes.
        let peer = unsafe { SockAddr::new(storage, len) }
            .as_socket()
            .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));

        Ok((accepted, peer))
    }

    /// Fetch and clear the pending socket error (SO_ERROR).
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.sock().take_error()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let addr = self.sock().local_addr()?;
        addr.as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "non-inet local address"))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let addr = self.sock().peer_addr()?;
        addr.as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "non-inet peer address"))
    }

    /// Nonblocking read into `buf`. `Ok(0)` means the peer closed.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Nonblocking write from `buf`; may write fewer bytes than given.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl AsRawFd for SocketHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for SocketHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Create a nonblocking eventfd for loop wake-ups.
pub(crate) fn new_eventfd() -> io::Result<SocketHandle> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(SocketHandle::from_fd(unsafe { OwnedFd::from_raw_fd(fd) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_binds_and_reports_local_addr() {
        let socket = SocketHandle::new_stream().unwrap();
        socket.set_reuse_address().unwrap();
        socket.set_nonblocking().unwrap();
        socket.bind(&Address::with_port(0)).unwrap();
        socket.listen(DEFAULT_BACKLOG).unwrap();

        let local = socket.local_addr().unwrap();
        assert!(local.port() != 0);
        assert!(local.ip().is_loopback());
    }

    #[test]
    fn accept_on_empty_queue_would_block() {
        let socket = SocketHandle::new_stream().unwrap();
        socket.set_reuse_address().unwrap();
        socket.set_nonblocking().unwrap();
        socket.bind(&Address::with_port(0)).unwrap();
        socket.listen(DEFAULT_BACKLOG).unwrap();

        let err = socket.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn accepted_socket_is_nonblocking() {
        let listener = SocketHandle::new_stream().unwrap();
        listener.set_reuse_address().unwrap();
        listener.set_nonblocking().unwrap();
        listener.bind(&Address::with_port(0)).unwrap();
        listener.listen(DEFAULT_BACKLOG).unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();

        // Poll briefly; the connection may take a moment to land.
        let accepted = loop {
            match listener.accept() {
                Ok((fd, _)) => break fd,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };

        let flags = unsafe { libc::fcntl(accepted.as_raw_fd(), libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);

        // Reading from the fresh connection must report would-block, not hang.
        let handle = SocketHandle::from_fd(accepted);
        let mut buf = [0u8; 16];
        let err = handle.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn eventfd_roundtrip() {
        let efd = new_eventfd().unwrap();
        let one: u64 = 1;
        efd.write(&one.to_ne_bytes()).unwrap();
        efd.write(&one.to_ne_bytes()).unwrap();

        let mut buf = [0u8; 8];
        let n = efd.read(&mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(u64::from_ne_bytes(buf), 2);

        // Counter is drained to zero by the read.
        let err = efd.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
