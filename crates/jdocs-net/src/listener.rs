//! Listening socket setup.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

use jdocs_core::error::{Error, Result};

/// A bound, listening TCP socket on all interfaces.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    addr: SocketAddr,
}

impl Listener {
    /// Port 0 picks an ephemeral port.
    pub fn bind(port: u16, backlog: i32) -> Result<Self> {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(Error::Socket)?;
        socket.set_reuse_address(true).map_err(Error::Socket)?;
        socket.bind(&SockAddr::from(addr)).map_err(Error::Socket)?;
        socket.listen(backlog).map_err(Error::Socket)?;

        let inner: TcpListener = socket.into();
        let addr = inner.local_addr().map_err(Error::Socket)?;
        debug!(%addr, backlog, fd = inner.as_raw_fd(), "listening");
        Ok(Self { inner, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
