//! Socket construction helpers.
//!
//! Listeners and outgoing connections are created through socket2 so the
//! backlog, address reuse and non-blocking mode can be set before the
//! descriptor is handed to the standard library types.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};

/// Creates a non-blocking listening socket.
///
/// `reuse_port` enables `SO_REUSEPORT` so that several partitions can bind
/// the same address, each with its own accept queue.
pub fn bind_listener(addr: SocketAddr, backlog: u32, reuse_port: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}

/// Starts a non-blocking connect to `addr`.
///
/// Returns the stream and whether the connect already completed. When it
/// did not, completion is signalled by writable readiness and checked with
/// [`finish_connect`].
pub fn connect_nonblocking(addr: SocketAddr, nodelay: bool) -> io::Result<(TcpStream, bool)> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if nodelay {
        socket.set_nodelay(true)?;
    }

    let connected = match socket.connect(&addr.into()) {
        Ok(()) => true,
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => false,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(e) => return Err(e),
    };

    Ok((socket.into(), connected))
}

/// Checks the outcome of a non-blocking connect after writable readiness.
pub fn finish_connect(stream: &TcpStream) -> io::Result<()> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    // A socket that is writable but not connected failed without SO_ERROR
    // (seen on some BSDs); peer_addr surfaces that as NotConnected.
    stream.peer_addr().map(|_| ())
}

/// Prepares an accepted stream for the event loop.
pub fn configure_accepted(stream: &TcpStream, nodelay: bool) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    if nodelay {
        stream.set_nodelay(true)?;
    }
    Ok(())
}
