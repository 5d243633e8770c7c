//! Raw socket helpers: non-blocking mode, listener setup, outbound connect.
//!
//! Kept on `libc` directly rather than `std::net`, because the relay path
//! needs the underlying file descriptor for `splice(2)` and the listener
//! needs `SO_REUSEADDR` plus non-blocking `accept` semantics before the
//! first `epoll_wait`. Error codes are translated with
//! `io::Error::last_os_error`.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::ptr;

/// Put `fd` into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fd is a valid, open file descriptor owned by the caller.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: see above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create, bind and listen on `0.0.0.0:port`, with `SO_REUSEADDR` set before
/// bind so a restart doesn't trip `EADDRINUSE` on a socket still draining
/// `TIME_WAIT`. Returned fd is non-blocking.
pub fn bind_listener(port: u16) -> io::Result<RawFd> {
    // SAFETY: plain syscall with scalar arguments, no pointers involved.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let one: libc::c_int = 1;
    // SAFETY: `one` is a live, correctly sized c_int; fd was just created.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(Ipv4Addr::UNSPECIFIED).to_be(),
        },
        sin_zero: [0; 8],
    };

    // SAFETY: `addr` is a valid sockaddr_in with the correct length passed.
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    // SAFETY: fd is a bound stream socket.
    let rc = unsafe { libc::listen(fd, libc::SOMAXCONN) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    if let Err(err) = set_nonblocking(fd) {
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(fd)
}

/// Accept one pending connection off `listen_fd`. Returns `Ok(None)` on
/// `EAGAIN`/`EWOULDBLOCK` (edge-triggered listeners must drain fully), and
/// propagates every other error.
pub fn accept_one(listen_fd: RawFd) -> io::Result<Option<RawFd>> {
    // SAFETY: listen_fd is a valid listening socket; null addr/addrlen is
    // permitted by accept(2) when the peer address isn't needed.
    let fd = unsafe { libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut()) };
    if fd >= 0 {
        set_nonblocking(fd)?;
        return Ok(Some(fd));
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        return Ok(None);
    }
    Err(err)
}

/// Resolve `host:service` via `getaddrinfo` and establish a blocking
/// connection to the first usable result, as rule installation does this
/// once at startup and can afford to wait. The fd is switched to
/// non-blocking only after the handshake completes, so the hot path never
/// blocks on it.
pub fn connect_upstream(host: &str, service: &str) -> io::Result<RawFd> {
    let addr = resolve_first(host, service)?;

    // SAFETY: scalar args only.
    let fd = unsafe { libc::socket(addr.ss_family as libc::c_int, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: addr was filled in by getaddrinfo with a matching length.
    let rc = unsafe {
        libc::connect(
            fd,
            &addr as *const libc::sockaddr_storage as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    if let Err(err) = set_nonblocking(fd) {
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(fd)
}

fn resolve_first(host: &str, service: &str) -> io::Result<libc::sockaddr_storage> {
    let host_c = CString::new(host).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let service_c =
        CString::new(service).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;

    let mut result: *mut libc::addrinfo = ptr::null_mut();
    // SAFETY: host_c/service_c are valid NUL-terminated C strings that
    // outlive the call; `result` receives a linked list owned by the
    // resolver that we free below.
    let rc = unsafe {
        libc::getaddrinfo(
            host_c.as_ptr(),
            service_c.as_ptr(),
            &hints,
            &mut result,
        )
    };
    if rc != 0 {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("getaddrinfo({host}:{service}) failed: {rc}"),
        ));
    }

    // SAFETY: result is non-null (rc == 0) and points at a valid addrinfo.
    let first = unsafe { &*result };
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = (first.ai_addrlen as usize).min(mem::size_of::<libc::sockaddr_storage>());
    // SAFETY: both sides have at least `len` bytes; non-overlapping.
    unsafe {
        ptr::copy_nonoverlapping(
            first.ai_addr as *const u8,
            &mut storage as *mut libc::sockaddr_storage as *mut u8,
            len,
        );
        libc::freeaddrinfo(result);
    }

    Ok(storage)
}

/// Close a raw fd, ignoring the result — used on cleanup paths where the
/// fd's state is already known-dead (peer gone, slot being released).
pub fn close_quietly(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
