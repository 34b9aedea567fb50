//! Readiness plumbing.
//!
//! Every PCM handle exposes at most one OS-level descriptor an external
//! event loop can poll, plus the event direction to watch (writable for
//! playback, readable for capture). Software backends signal that
//! descriptor through a pipe-based [`Trigger`] pair; blocking waits inside
//! the crate itself go through the portable condvar [`Waiter`] instead.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Which readiness event an event loop should watch for a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    /// Stream becomes writable (playback).
    Out,
    /// Stream becomes readable (capture).
    In,
}

/// One pollable descriptor plus its event mask.
#[derive(Debug, Clone, Copy)]
pub struct PollDesc {
    /// Raw file descriptor number.
    pub fd: i32,
    /// Event direction to watch.
    pub events: PollEvents,
}

/// Portable blocking-wait primitive: a generation counter under a mutex
/// with a condvar. `notify` bumps the generation; `wait_until` re-checks a
/// readiness predicate on every bump.
#[derive(Debug, Default)]
pub struct Waiter {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Waiter {
    /// Wake every current waiter.
    pub fn notify(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation += 1;
        self.cond.notify_all();
    }

    /// Block until `ready` returns true or `timeout` elapses. `None` waits
    /// forever; `Some(Duration::ZERO)` just polls. Returns whether the
    /// predicate was satisfied.
    pub fn wait_until(&self, timeout: Option<Duration>, mut ready: impl FnMut() -> bool) -> bool {
        if ready() {
            return true;
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut generation = self.generation.lock().unwrap();
        loop {
            let seen = *generation;
            drop(generation);
            if ready() {
                return true;
            }
            generation = self.generation.lock().unwrap();
            if *generation != seen {
                continue;
            }
            match deadline {
                None => {
                    generation = self.cond.wait(generation).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return ready();
                    }
                    let (guard, _) = self.cond.wait_timeout(generation, deadline - now).unwrap();
                    generation = guard;
                }
            }
        }
    }
}

#[cfg(unix)]
pub use trigger::{trigger, Receiver, Sender};

#[cfg(unix)]
mod trigger {
    //! Pipe-backed wakeup pair for exposing readiness to external pollers.

    /// Create a connected trigger pair.
    pub fn trigger() -> std::io::Result<(Sender, Receiver)> {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let [read, write] = fds;
        // Neither end may block: the read side is drained speculatively,
        // and a writer must not stall on a receiver nobody polls.
        unsafe {
            libc::fcntl(read, libc::F_SETFL, libc::O_NONBLOCK);
            libc::fcntl(write, libc::F_SETFL, libc::O_NONBLOCK);
        }
        Ok((Sender(write), Receiver(read)))
    }

    /// Writing half of a trigger pair.
    #[derive(Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Sender(libc::c_int);

    unsafe impl Send for Sender {}
    unsafe impl Sync for Sender {}

    impl Drop for Sender {
        fn drop(&mut self) {
            unsafe { libc::close(self.0) };
        }
    }

    impl Sender {
        /// Mark the paired receiver ready.
        pub fn trigger(&self) -> std::io::Result<()> {
            let buf = 1u64;
            let size = size_of_val(&buf);
            let buf = std::ptr::from_ref(&buf).cast();
            let ret = unsafe { libc::write(self.0, buf, size) };
            match ret {
                8 => Ok(()),
                _ => Err(std::io::Error::last_os_error()),
            }
        }
    }

    /// Reading half of a trigger pair; this is the fd handed to pollers.
    #[derive(Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Receiver(libc::c_int);

    unsafe impl Send for Receiver {}
    unsafe impl Sync for Receiver {}

    impl Drop for Receiver {
        fn drop(&mut self) {
            unsafe { libc::close(self.0) };
        }
    }

    impl Receiver {
        /// Consume a pending trigger, reporting whether one was present.
        pub fn consume(&self) -> std::io::Result<bool> {
            let mut value = 0u64;
            let size = size_of_val(&value);
            let out = std::ptr::from_mut(&mut value).cast();
            let ret = unsafe { libc::read(self.0, out, size) };
            match ret {
                8 => Ok(true),
                _ if ret < 0 => {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::WouldBlock {
                        Ok(false)
                    } else {
                        Err(err)
                    }
                }
                _ => Ok(false),
            }
        }

        /// Raw descriptor for poll/select integration.
        pub fn as_raw_fd(&self) -> i32 {
            self.0
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn waiter_polls_without_blocking() {
        let waiter = Waiter::default();
        assert!(!waiter.wait_until(Some(Duration::ZERO), || false));
        assert!(waiter.wait_until(Some(Duration::ZERO), || true));
    }

    #[test]
    fn waiter_wakes_on_notify() {
        let waiter = Arc::new(Waiter::default());
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let handle = std::thread::spawn({
            let waiter = waiter.clone();
            let flag = flag.clone();
            move || {
                waiter.wait_until(Some(Duration::from_secs(5)), || {
                    flag.load(std::sync::atomic::Ordering::SeqCst)
                })
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        waiter.notify();
        assert!(handle.join().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn trigger_round_trip() {
        let (tx, rx) = trigger().unwrap();
        assert!(!rx.consume().unwrap());
        tx.trigger().unwrap();
        assert!(rx.consume().unwrap());
        assert!(!rx.consume().unwrap());
    }
}
