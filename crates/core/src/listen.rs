//! The TCP listener accepting new client connections.

use crate::fdio;
use crate::object::{Object, ObjectKind};
use crate::session::ClientState;
use socket2::{Domain, SockRef, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsRawFd, OwnedFd};
use tracing::{debug, warn};

/// Listen backlog; connections beyond it retry at the TCP layer.
const LISTEN_BACKLOG: i32 = 10;

/// Binds the listening socket: loopback-only or any-address, reusable,
/// non-blocking, close-on-exec.
pub fn create_listener(port: u16, loopback_only: bool) -> io::Result<OwnedFd> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let ip = if loopback_only {
        Ipv4Addr::LOCALHOST
    } else {
        Ipv4Addr::UNSPECIFIED
    };
    let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Accepts every pending connection (until `EAGAIN`) and builds a
/// client object for each.  Peer hostnames resolve via best-effort
/// reverse DNS, truncated to the short form.
pub fn accept_clients(listener: &OwnedFd, keepalive: bool) -> Vec<Object> {
    let mut clients = Vec::new();
    loop {
        let sock = SockRef::from(listener);
        let (stream, peer) = match sock.accept() {
            Ok(pair) => pair,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.raw_os_error() == Some(libc::ECONNABORTED) => break,
            Err(err) => {
                warn!(error = %err, "accept failed");
                break;
            }
        };
        stream.set_nonblocking(true).ok();
        let _ = fdio::set_cloexec(stream.as_raw_fd());
        if keepalive {
            stream.set_keepalive(true).ok();
        }
        let (ip, port) = match peer.as_socket() {
            Some(addr) => (addr.ip().to_string(), addr.port()),
            None => (String::from("?"), 0),
        };
        let host = resolve_short_hostname(&ip);
        debug!(peer = %ip, port, "accepted client");
        let state = ClientState::accepted(host, ip.clone(), port);
        clients.push(Object::new(
            format!("{ip}:{port}"),
            Some(stream.into()),
            ObjectKind::Client(state),
        ));
    }
    clients
}

/// Reverse-resolves `ip` and keeps the short hostname; falls back to
/// the address string.  Resolution is synchronous and best-effort.
fn resolve_short_hostname(ip: &str) -> String {
    let Ok(addr) = ip.parse::<std::net::IpAddr>() else {
        return String::from(ip);
    };
    match dns_lookup::lookup_addr(&addr) {
        Ok(fqdn) => fqdn
            .split('.')
            .next()
            .map_or(fqdn.clone(), String::from),
        Err(_) => String::from(ip),
    }
}
