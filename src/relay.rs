//! The splice-based relay pump.
//!
//! Each direction of a connection gets its own pipe (see [`crate::table::Pipe`]);
//! bytes move `src -> pipe -> dst` via two `splice(2)` calls so they never
//! cross into userspace. A pump call drains until either leg reports
//! `EAGAIN`, matching the edge-triggered contract: a readiness edge only
//! fires once, so a dispatcher that stops early before `EAGAIN` would never
//! be woken again for data already sitting in the socket buffer.

use std::io;
use std::os::unix::io::RawFd;

/// Bytes moved in one `splice` burst; intentionally generous since a single
/// readiness edge may carry far more than one TCP segment's worth of data.
const SPLICE_CHUNK: usize = 1 << 20;

/// Outcome of one call to [`pump`].
#[derive(Debug, PartialEq, Eq)]
pub enum PumpOutcome {
    /// At least one byte moved; more may be pending (caller decides whether
    /// to loop again based on how much it asked for vs. got).
    Progressed { bytes: usize },
    /// Source or destination reported `EAGAIN` with nothing left to move.
    WouldBlock,
    /// Source hit EOF (client or upstream closed its write side).
    Eof,
    /// The peer reset or hung up (`EPIPE`/`ECONNRESET`/`EBADF` after close).
    /// Not fatal to the daemon — only to this one connection.
    PeerGone,
}

/// One `splice(2)` call. `more` sets `SPLICE_F_MORE`, telling the kernel more
/// data is coming right behind this chunk so it can coalesce the write
/// instead of pushing a short segment immediately — only meaningful (and
/// only passed) on the pipe-to-socket leg.
fn splice_once(src: RawFd, dst: RawFd, len: usize, more: bool) -> io::Result<isize> {
    let mut flags = libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK;
    if more {
        flags |= libc::SPLICE_F_MORE;
    }
    // SAFETY: both fds are owned by the caller and kept alive for the
    // duration of the call; null offsets mean "use the fd's current
    // position", valid for pipes and connected stream sockets alike.
    let n = unsafe {
        libc::splice(
            src,
            std::ptr::null_mut(),
            dst,
            std::ptr::null_mut(),
            len,
            flags,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n)
}

fn classify_error(err: &io::Error) -> Option<PumpOutcome> {
    if err.kind() == io::ErrorKind::WouldBlock {
        return Some(PumpOutcome::WouldBlock);
    }
    match err.raw_os_error() {
        Some(libc::EPIPE) | Some(libc::ECONNRESET) | Some(libc::EBADF) => {
            Some(PumpOutcome::PeerGone)
        }
        _ => None,
    }
}

/// Move one burst of bytes from `src` to `dst` through `pipe_read`/`pipe_write`.
///
/// First drains whatever is already staged in the pipe from a previous call
/// that couldn't fully flush it (`dst` blocked partway through), *then*
/// splices `src -> pipe_write` and drains that too. Draining first matters:
/// with no `EPOLLOUT` registered on `dst` (see the back-pressure design
/// note), the only way stale pipe contents ever get another chance to flush
/// is a later call to this function — and a fresh `src -> pipe_write` splice
/// into a pipe that's still full from last time would immediately `EAGAIN`
/// and strand those bytes without ever retrying the drain.
pub fn pump(src: RawFd, pipe_read: RawFd, pipe_write: RawFd, dst: RawFd) -> io::Result<PumpOutcome> {
    let mut total_out = 0usize;

    loop {
        match splice_once(pipe_read, dst, SPLICE_CHUNK, true) {
            Ok(0) => break,
            Ok(n) => total_out += n as usize,
            Err(err) => match classify_error(&err) {
                Some(PumpOutcome::WouldBlock) => break,
                Some(outcome) => return Ok(outcome),
                None => return Err(err),
            },
        }
    }

    let moved_in = match splice_once(src, pipe_write, SPLICE_CHUNK, false) {
        Ok(0) => {
            return Ok(if total_out > 0 {
                PumpOutcome::Progressed { bytes: total_out }
            } else {
                PumpOutcome::Eof
            })
        }
        Ok(n) => n as usize,
        Err(err) => {
            return match classify_error(&err) {
                Some(PumpOutcome::WouldBlock) if total_out > 0 => {
                    Ok(PumpOutcome::Progressed { bytes: total_out })
                }
                Some(outcome) => Ok(outcome),
                None => Err(err),
            }
        }
    };

    let mut remaining = moved_in;
    while remaining > 0 {
        match splice_once(pipe_read, dst, remaining, true) {
            Ok(0) => break,
            Ok(n) => {
                total_out += n as usize;
                remaining -= n as usize;
            }
            Err(err) => {
                return match classify_error(&err) {
                    // Data is staged in the pipe; report what we moved so
                    // far and let the next call drain the rest.
                    Some(PumpOutcome::WouldBlock) if total_out > 0 => {
                        Ok(PumpOutcome::Progressed { bytes: total_out })
                    }
                    Some(outcome) => Ok(outcome),
                    None => Err(err),
                }
            }
        }
    }

    Ok(PumpOutcome::Progressed { bytes: total_out })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        unsafe {
            libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK);
        }
        (fds[0], fds[1])
    }

    #[test]
    fn pumps_bytes_from_one_socket_to_another() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        client.write_all(b"hello relay").unwrap();
        client.flush().unwrap();
        // give the kernel a moment to deliver the bytes into server's recv buffer
        std::thread::sleep(std::time::Duration::from_millis(20));

        let dst_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let dst_addr = dst_listener.local_addr().unwrap();
        let dst_writer = TcpStream::connect(dst_addr).unwrap();
        let (mut dst_reader, _) = dst_listener.accept().unwrap();

        let (pr, pw) = pipe_pair();
        let outcome = pump(server.as_raw_fd(), pr, pw, dst_writer.as_raw_fd()).unwrap();
        match outcome {
            PumpOutcome::Progressed { bytes } => assert_eq!(bytes, b"hello relay".len()),
            other => panic!("expected Progressed, got {other:?}"),
        }

        let mut buf = [0u8; 32];
        let n = dst_reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello relay");

        unsafe {
            libc::close(pr);
            libc::close(pw);
        }
    }

    #[test]
    fn would_block_when_nothing_pending() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let dst_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let dst_addr = dst_listener.local_addr().unwrap();
        let dst_writer = TcpStream::connect(dst_addr).unwrap();
        let (_dst_reader, _) = dst_listener.accept().unwrap();

        let (pr, pw) = pipe_pair();
        let outcome = pump(server.as_raw_fd(), pr, pw, dst_writer.as_raw_fd()).unwrap();
        assert_eq!(outcome, PumpOutcome::WouldBlock);

        unsafe {
            libc::close(pr);
            libc::close(pw);
        }
    }
}
