//! Nonblocking TCP and Unix sockets.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;

use socket2::{Domain, SockAddr, Socket, Type};

use crate::opts::Opts;

fn connect_in_progress(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Start a nonblocking connect; completion is detected with `poll_connected`.
fn start_connect(domain: Domain, addr: &SockAddr) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    match socket.connect(addr) {
        Ok(()) => Ok(socket),
        Err(err) if connect_in_progress(&err) => Ok(socket),
        Err(err) => Err(err),
    }
}

#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// Outcome of a nonblocking read.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadStatus {
    /// The socket has no more data for now
    WouldBlock,
    /// The peer closed the connection
    Eof,
}

impl Stream {
    /// Open a socket to the server described by `opts` without waiting for
    /// the connection to be established. Host names are resolved here.
    pub fn connect_start(opts: &Opts) -> io::Result<Self> {
        if let Some(path) = &opts.socket {
            let socket = start_connect(Domain::UNIX, &SockAddr::unix(path)?)?;
            return Ok(Stream::Unix(UnixStream::from(OwnedFd::from(socket))));
        }

        let addr = (opts.host.as_str(), opts.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("could not translate host name \"{}\"", opts.host),
                )
            })?;
        let socket = start_connect(Domain::for_address(addr), &addr.into())?;
        let stream: TcpStream = socket.into();
        stream.set_nodelay(true)?;
        Ok(Stream::Tcp(stream))
    }

    /// Check whether a pending connect finished. `Ok(false)` means still in progress.
    pub fn poll_connected(&self) -> io::Result<bool> {
        let (error, peer) = match self {
            Stream::Tcp(s) => (s.take_error()?, s.peer_addr().map(drop)),
            Stream::Unix(s) => (s.take_error()?, s.peer_addr().map(drop)),
        };
        if let Some(err) = error {
            return Err(err);
        }
        match peer {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    /// Append everything currently readable to `out`.
    pub fn read_available(&mut self, out: &mut Vec<u8>) -> io::Result<ReadStatus> {
        let mut chunk = [0u8; 8192];
        loop {
            match self.read(&mut chunk) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::WouldBlock);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Write as much of `buf` as the socket accepts. Returns bytes written.
    pub fn write_available(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            match self.write(&buf[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(written)
    }
}

impl AsFd for Stream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Stream::Tcp(s) => s.as_fd(),
            Stream::Unix(s) => s.as_fd(),
        }
    }
}
