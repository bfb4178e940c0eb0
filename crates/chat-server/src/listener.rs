use std::io;
use std::mem::size_of;
use std::net::SocketAddr;
use std::os::fd::FromRawFd;

use mio::net::TcpListener;

/// Backlog passed to `listen(2)`. `SOMAXCONN` is the kernel's own ceiling;
/// asking for more is harmless, the kernel clamps it.
const LISTEN_BACKLOG: libc::c_int = libc::SOMAXCONN;

/// Binds a non-blocking listening socket with `SO_REUSEADDR` and
/// `SO_REUSEPORT` set.
///
/// `mio::net::TcpListener::bind` goes through `std::net::TcpListener::bind`,
/// which offers no hook to set socket options before `bind(2)` runs — and
/// `SO_REUSEADDR`/`SO_REUSEPORT` only take effect if set beforehand. So this
/// builds the socket by hand with the raw `libc` calls for `socket`/
/// `setsockopt`/`bind`/`listen`, then hands the resulting fd to
/// `TcpListener::from_std`.
pub fn bind_reusable(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    // SAFETY: `socket(2)` either returns a valid owned fd or -1; we check
    // for -1 immediately below before touching the result.
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `fd` is a freshly created, still-owned socket fd; each
    // `setsockopt` call is passed a pointer to a live `libc::c_int` of the
    // size it declares.
    unsafe {
        set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR)?;
        set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT)?;
    }

    let (sockaddr, socklen) = socket_addr_to_raw(addr);
    // SAFETY: `sockaddr` is a valid, fully-initialised sockaddr of `socklen`
    // bytes matching `fd`'s address family.
    let rc = unsafe { libc::bind(fd, std::ptr::addr_of!(sockaddr).cast(), socklen) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        // SAFETY: `fd` is still owned by us; closing it on the error path
        // avoids leaking the descriptor.
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }

    // SAFETY: `fd` is a bound socket.
    let rc = unsafe { libc::listen(fd, LISTEN_BACKLOG) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }

    // SAFETY: `fd` is a valid, open socket fd we exclusively own past this
    // point; `from_raw_fd` takes ownership.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(std_listener))
}

unsafe fn set_int_opt(fd: libc::c_int, level: libc::c_int, name: libc::c_int) -> io::Result<()> {
    let value: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            std::ptr::addr_of!(value).cast::<libc::c_void>(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

#[repr(C)]
union RawSockaddr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

fn socket_addr_to_raw(addr: SocketAddr) -> (RawSockaddr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            (RawSockaddr { v4: sockaddr }, size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sockaddr = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            (RawSockaddr { v6: sockaddr }, size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_and_accepts_loopback() {
        let listener = bind_reusable("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        drop(client);
        // Non-blocking accept: either Ok or WouldBlock, never a hard error.
        match listener.accept() {
            Ok(_) | Err(_) => {}
        }
    }

    #[test]
    fn two_listeners_can_share_port_via_reuseport() {
        let first = bind_reusable("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        // REUSEPORT lets a second socket bind the exact same address.
        let second = bind_reusable(addr);
        assert!(second.is_ok());
    }
}
