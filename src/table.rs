//! The connection table: one permanent slot per installed rule.
//!
//! One global table behind one allocation lock, growable rather than
//! fixed-size since the rule count isn't known until `forward.conf` is
//! parsed. A slot is created once, at rule-install time, and lives for the
//! process's lifetime: the upstream leg is connected eagerly and reused
//! across every inbound client that passes through the rule's listener, so
//! "recycling" a slot means detaching the previous client, not tearing down
//! the upstream.

use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::sock::close_quietly;

/// Lifecycle of one table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Upstream connected, no inbound client attached yet (or the previous
    /// one has disconnected and been detached).
    UpstreamReady,
    /// Both legs are live; the relay pumps run.
    Paired,
}

/// One anonymous pipe used to splice bytes through the kernel for a single
/// direction of a single connection.
pub struct Pipe {
    pub read_fd: RawFd,
    pub write_fd: RawFd,
}

/// Requested pipe buffer capacity, matching the relay pump's splice chunk
/// size — the default 64KiB pipe buffer makes it easy for a large burst to
/// fill the pipe before `dst` can drain it, which (with no `EPOLLOUT`
/// registered, see `relay::pump`) narrows the window for a burst to stall.
/// Best-effort only: `fs.pipe-max-size` may cap it lower.
const PIPE_CAPACITY: libc::c_int = 1 << 20;

impl Pipe {
    fn create() -> std::io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds is a valid 2-element array; O_NONBLOCK keeps splice
        // from blocking a worker thread when the pipe buffer fills.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: write_fd is a freshly created, valid pipe fd.
        unsafe {
            libc::fcntl(fds[1], libc::F_SETPIPE_SZ, PIPE_CAPACITY);
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        close_quietly(self.read_fd);
        close_quietly(self.write_fd);
    }
}

/// One forwarding rule's live state: the permanently connected upstream fd,
/// whichever client is currently attached (if any), and the two
/// per-direction pipes relays splice through.
pub struct ConnectionSlot {
    pub state: SlotState,
    pub client_fd: Option<RawFd>,
    pub upstream_fd: RawFd,
    /// Pipe carrying client -> upstream bytes.
    pub local_to_remote: Pipe,
    /// Pipe carrying upstream -> client bytes.
    pub remote_to_local: Pipe,
}

impl ConnectionSlot {
    fn new(upstream_fd: RawFd) -> std::io::Result<Self> {
        Ok(Self {
            state: SlotState::UpstreamReady,
            client_fd: None,
            upstream_fd,
            local_to_remote: Pipe::create()?,
            remote_to_local: Pipe::create()?,
        })
    }

    /// Detach the current client (closing its fd) and fall back to
    /// `UpstreamReady`, leaving the upstream leg untouched so the next
    /// inbound connection on this rule's listener can reuse it.
    fn detach_client(&mut self) {
        if let Some(fd) = self.client_fd.take() {
            close_quietly(fd);
        }
        self.state = SlotState::UpstreamReady;
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        if let Some(fd) = self.client_fd.take() {
            close_quietly(fd);
        }
        close_quietly(self.upstream_fd);
    }
}

/// Growable slot table behind one mutex, one slot per installed rule.
/// Indices are stable for the life of the process once handed out — the
/// table only ever grows, at rule-install time, so a readiness tag decoded
/// later always finds its slot.
pub struct ConnectionTable {
    slots: Mutex<Vec<ConnectionSlot>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Create a new permanent slot for a rule's upstream connection. Called
    /// once per rule, at install time; returns the stable index to encode
    /// into that rule's listener tag.
    pub fn allocate_for_rule(&self, upstream_fd: RawFd) -> std::io::Result<usize> {
        let slot = ConnectionSlot::new(upstream_fd)?;
        let mut slots = self.slots.lock().expect("connection table lock poisoned");
        slots.push(slot);
        Ok(slots.len() - 1)
    }

    /// Run `f` with exclusive access to slot `index`.
    pub fn with_slot<R>(&self, index: usize, f: impl FnOnce(&mut ConnectionSlot) -> R) -> R {
        let mut slots = self.slots.lock().expect("connection table lock poisoned");
        f(&mut slots[index])
    }

    /// Attach a freshly accepted client fd to `index`, transitioning it to
    /// `Paired`. Returns `false` (and closes `client_fd`) if the slot
    /// already has a client attached — a stale or duplicate accept.
    pub fn attach_client(&self, index: usize, client_fd: RawFd) -> bool {
        self.with_slot(index, |slot| {
            if slot.state == SlotState::Paired {
                close_quietly(client_fd);
                return false;
            }
            slot.client_fd = Some(client_fd);
            slot.state = SlotState::Paired;
            true
        })
    }

    /// Detach whichever client is attached to `index` (closing its fd) and
    /// return the slot to `UpstreamReady`. Idempotent: detaching an already
    /// bare slot is a no-op, which matters since both legs of a pair can
    /// independently report a hangup for the same disconnect.
    pub fn detach_client(&self, index: usize) {
        self.with_slot(index, |slot| slot.detach_client());
    }

    /// Number of rules (== permanent slots) installed.
    pub fn len(&self) -> usize {
        self.slots.lock().expect("connection table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots with a client currently attached. Used by tests
    /// asserting that churn on one rule doesn't grow the table.
    pub fn paired_count(&self) -> usize {
        self.slots
            .lock()
            .expect("connection table lock poisoned")
            .iter()
            .filter(|s| s.state == SlotState::Paired)
            .count()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
