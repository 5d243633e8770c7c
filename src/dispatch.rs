//! Event dispatcher: the per-worker loop that classifies readiness events
//! and routes them to the accept path or the relay path.
//!
//! Every worker runs the identical loop body: wait, classify what became
//! ready by its tag, dispatch to the accept path or the relay path, handle
//! errors. N native OS threads share one [`Readiness`] set.

use std::sync::Arc;

use tracing::{error, warn};

use crate::epoll::{Direction, ReadyEvent, Readiness, Tag};
use crate::lifecycle::should_run;
use crate::relay::{pump, PumpOutcome};
use crate::sock::accept_one;
use crate::table::ConnectionTable;

/// Everything one worker thread needs; cheaply cloned (all `Arc`s) so every
/// worker can run the identical loop body.
#[derive(Clone)]
pub struct Dispatcher {
    pub readiness: Arc<Readiness>,
    pub table: Arc<ConnectionTable>,
}

impl Dispatcher {
    /// Run the dispatch loop until the process-wide running flag (flipped
    /// by a signal handler, see [`crate::lifecycle`]) is observed false.
    /// Returns once the current `wait()` call unblocks after shutdown is
    /// signaled, via the self-pipe wake, not a timeout.
    pub fn run(&self) {
        let mut events = Vec::new();
        while should_run() {
            if let Err(e) = self.readiness.wait(&mut events) {
                error!(error = %e, "readiness wait failed");
                continue;
            }
            for event in &events {
                if !should_run() {
                    break;
                }
                self.dispatch_one(event);
            }
        }
    }

    fn dispatch_one(&self, event: &ReadyEvent) {
        match event.tag {
            Tag::Wake => {
                // The self-pipe becoming readable only exists to unblock
                // `wait()`; the loop's top-of-iteration check does the rest.
            }
            Tag::Listener { listen_fd, slot } => {
                if event.error_or_hangup {
                    error!(slot, "listener reported error/hangup");
                    return;
                }
                self.handle_accept(listen_fd, slot);
            }
            Tag::Connection { slot, direction } => {
                if event.error_or_hangup {
                    self.handle_socket_error(slot, direction);
                } else if event.readable {
                    self.handle_relay(slot, direction);
                }
            }
        }
    }

    /// Accept path: drain exactly one pending connection per wake —
    /// edge-triggered re-arming means a second pending connection simply
    /// refires the listener's readiness.
    fn handle_accept(&self, listen_fd: std::os::unix::io::RawFd, slot: usize) {
        let client_fd = match accept_one(listen_fd) {
            Ok(Some(fd)) => fd,
            Ok(None) => return,
            Err(e) => {
                error!(slot, error = %e, "accept failed");
                return;
            }
        };

        if !self.table.attach_client(slot, client_fd) {
            // Slot was already paired (a racing duplicate accept event);
            // attach_client has already closed client_fd for us.
            return;
        }

        if let Err(e) = self.readiness.add(
            client_fd,
            Tag::Connection {
                slot,
                direction: Direction::LocalToRemote,
            },
        ) {
            error!(slot, error = %e, "failed to register accepted client");
            self.table.detach_client(slot);
        }
    }

    /// Relay path: pump one direction until its source would block —
    /// an edge-triggered readability edge fires once, so anything left
    /// undrained after returning early would never be picked up again.
    fn handle_relay(&self, slot: usize, direction: Direction) {
        let (src, dst, pipe_read, pipe_write) = self.table.with_slot(slot, |s| {
            let client_fd = s.client_fd;
            match direction {
                Direction::LocalToRemote => (
                    client_fd,
                    Some(s.upstream_fd),
                    s.local_to_remote.read_fd,
                    s.local_to_remote.write_fd,
                ),
                Direction::RemoteToLocal => (
                    Some(s.upstream_fd),
                    client_fd,
                    s.remote_to_local.read_fd,
                    s.remote_to_local.write_fd,
                ),
            }
        });

        let (src, dst) = match (src, dst) {
            (Some(src), Some(dst)) => (src, dst),
            // No client attached yet (a stray upstream readability edge
            // before any accept) — nothing to relay to.
            _ => return,
        };

        loop {
            match pump(src, pipe_read, pipe_write, dst) {
                Ok(PumpOutcome::Progressed { .. }) => continue,
                Ok(PumpOutcome::WouldBlock) => return,
                Ok(PumpOutcome::Eof) | Ok(PumpOutcome::PeerGone) => {
                    warn!(slot, "Disconnection/error on socket {}", src);
                    self.table.detach_client(slot);
                    return;
                }
                Err(e) => {
                    error!(slot, error = %e, "relay pump failed");
                    self.table.detach_client(slot);
                    return;
                }
            }
        }
    }

    /// Error path: any `EPOLLERR`/`EPOLLHUP` on a connection leg
    /// tears the whole pairing down, regardless of which leg reported it.
    fn handle_socket_error(&self, slot: usize, direction: Direction) {
        warn!(slot, ?direction, "Disconnection/error on socket");
        self.table.detach_client(slot);
    }
}
