//! Process lifecycle: signal installation, the shutdown wake-up, and the
//! thread-per-core worker pool.
//!
//! The "running" flag is a plain `Arc<AtomicBool>` flipped from an
//! async-signal-safe handler. Workers block only inside `Readiness::wait`,
//! so shutdown additionally needs a way to unblock that wait promptly — a
//! self-pipe registered under [`crate::epoll::Tag::Wake`], rather than
//! force-killing worker threads with a signal.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::info;

use crate::dispatch::Dispatcher;
use crate::epoll::{Readiness, Tag};

/// Global flag flipped by the signal handler. `static` because a signal
/// handler cannot close over anything — the handler function needs a fixed
/// address the kernel can call into directly.
static SHOULD_RUN: AtomicBool = AtomicBool::new(true);

/// Write end of the self-pipe, set once at startup so the handler can nudge
/// a blocked `epoll_wait` awake after flipping the flag.
static WAKE_WRITE_FD: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(-1);

extern "C" fn on_shutdown_signal(_signum: libc::c_int) {
    SHOULD_RUN.store(false, Ordering::Release);
    let fd = WAKE_WRITE_FD.load(Ordering::Acquire);
    if fd >= 0 {
        let byte: u8 = 0;
        // SAFETY: write(2) on a pipe fd with a one-byte stack buffer is
        // async-signal-safe; the return value is deliberately ignored
        // (nothing actionable to do with a failure from a signal handler).
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Install handlers for `SIGINT`, `SIGHUP`, `SIGQUIT`, `SIGTERM`, all of
/// which flip the running flag. Must be called after the self-pipe is
/// created so `WAKE_WRITE_FD` is valid before a signal can arrive.
fn install_signal_handlers(wake_write_fd: RawFd) {
    WAKE_WRITE_FD.store(wake_write_fd, Ordering::Release);
    for signum in [libc::SIGINT, libc::SIGHUP, libc::SIGQUIT, libc::SIGTERM] {
        // SAFETY: on_shutdown_signal is async-signal-safe and has 'static
        // linkage; sigaction with a plain handler and no special flags is
        // the standard safe-to-call-from-Rust pattern for this.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_shutdown_signal as usize;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signum, &action, std::ptr::null_mut());
        }
    }
}

/// Create a non-blocking self-pipe and register its read end in `readiness`
/// under [`Tag::Wake`].
fn create_wake_pipe(readiness: &Readiness) -> io::Result<RawFd> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds is a valid 2-element array.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);
    readiness.add(read_fd, Tag::Wake)?;
    Ok(write_fd)
}

/// Number of workers to spawn as separate threads; the dispatcher loop also
/// runs inline on the calling thread as the last worker.
fn worker_count() -> usize {
    // SAFETY: sysconf with _SC_NPROCESSORS_ONLN takes no pointers.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

/// Pin the calling thread to logical CPU `cpu`. Best-effort: a failure here
/// (e.g. a restricted cgroup) is logged, not fatal — correctness doesn't
/// depend on affinity, only cache locality does.
fn pin_to_cpu(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            tracing::warn!(cpu, "failed to pin worker thread to CPU");
        }
    }
}

/// Spawns `ncores - 1` worker threads and runs the dispatcher loop inline on
/// the calling thread as the last worker, blocking until shutdown. Installs
/// signal handlers and the wake pipe before spawning any worker.
pub fn run_workers(readiness: Arc<Readiness>, table: Arc<crate::table::ConnectionTable>) -> anyhow::Result<()> {
    // Guards against a stale `false` from a previous `run()` in the same
    // process — relevant for the integration tests, which call `relayd::run`
    // more than once per test binary.
    SHOULD_RUN.store(true, Ordering::Release);

    let wake_write_fd = create_wake_pipe(&readiness)?;
    install_signal_handlers(wake_write_fd);

    let dispatcher = Dispatcher { readiness, table };

    let spawned = worker_count().saturating_sub(1);
    let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(spawned);
    for cpu in 0..spawned {
        let worker = dispatcher.clone();
        handles.push(std::thread::spawn(move || {
            pin_to_cpu(cpu);
            worker.run();
        }));
    }

    pin_to_cpu(spawned);
    dispatcher.run();

    for handle in handles {
        let _ = handle.join();
    }

    info!("all workers exited cleanly");
    unsafe {
        libc::close(wake_write_fd);
    }
    Ok(())
}

/// Whether the global running flag (observed by the signal handler) is
/// still set. Exposed for `relayd::run` to decide whether initialization
/// failed before or after a shutdown signal raced it.
pub fn should_run() -> bool {
    SHOULD_RUN.load(Ordering::Acquire)
}

/// Programmatic equivalent of receiving one of the shutdown signals: clears
/// the running flag and nudges any worker blocked in `wait()` awake via the
/// same self-pipe the signal handler uses. Lets an embedder (or a test) stop
/// a running [`crate::run`] without sending the process a real signal.
pub fn request_shutdown() {
    on_shutdown_signal(0);
}
