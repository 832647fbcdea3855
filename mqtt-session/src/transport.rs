//! Abstract collaborators the session depends on (spec.md §6): a byte
//! transport, a monotonic clock, and a task spawner. The engine never
//! blocks inside any of these; a transport that would block returns
//! `WouldBlock` and the caller's I/O loop re-arms for readiness instead.

use std::io;
use std::time::Instant;

/// A non-blocking byte-stream transport (TCP socket, TLS session, ...).
///
/// `read`/`write` follow [`std::io::Read`]/[`std::io::Write`] conventions
/// except they must never block: a transport with nothing to read or no
/// buffer space to write returns `Err(io::ErrorKind::WouldBlock)`.
pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn is_closed(&self) -> bool;
}

/// A source of monotonic time, injectable so keep-alive/idle/throttle
/// timing can be tested deterministically instead of sleeping wall-clock
/// time (spec.md §8).
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The real clock, backed by [`std::time::Instant`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Runs a task "on the loop" (spec.md §6 task contract: "spawn a task
/// running a function on the loop").
///
/// `task` is not required to be `Send`: spec.md §5 is explicit that the
/// engine is single-threaded ("Session is neither Send nor required to
/// be"), so a task never crosses a thread boundary. The lifetime
/// parameter lets a task borrow from the caller's stack frame (the
/// receive buffer, the subscription table) instead of forcing an owned
/// `'static` copy of everything it touches; every implementation in this
/// crate runs the task to completion before `spawn` returns, so the
/// borrow is always sound.
pub trait Spawner {
    fn spawn<'a>(&self, task: Box<dyn FnOnce() + 'a>);
}

/// The default spawner for targets with no executor: runs the task
/// synchronously, in place, before `spawn` returns. This satisfies the
/// spawn contract on bare embedded targets exactly as it does on a
/// platform with a real scheduler, since the session's own loop already
/// provides the only ordering guarantee callers can observe.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineSpawner;

impl Spawner for InlineSpawner {
    fn spawn<'a>(&self, task: Box<dyn FnOnce() + 'a>) {
        task();
    }
}
