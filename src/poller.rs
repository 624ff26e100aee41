// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The readiness multiplexer shared by both proxies.
//!
//! Each poll cycle rebuilds the descriptor vector from scratch: every
//! channel contributes its live endpoints with the interest flags it
//! currently wants watched. Write interest is one-shot - it is cleared by
//! the owner as soon as it is handed to the poll set, so a writable
//! endpoint does not spin the loop.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// One poll(2) descriptor vector, rebuilt every cycle and reused across
/// cycles to avoid reallocation.
pub struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl PollSet {
    pub fn new() -> Self {
        Self { fds: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    /// Add a descriptor with the given interest; returns its slot index.
    pub fn push(&mut self, fd: RawFd, want_read: bool, want_write: bool) -> usize {
        let mut events: libc::c_short = 0;
        if want_read {
            events |= libc::POLLIN | libc::POLLPRI;
        }
        if want_write {
            events |= libc::POLLOUT;
        }
        self.fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
        self.fds.len() - 1
    }

    /// Wait up to `budget_usec` for readiness. Returns the number of ready
    /// descriptors; an error carries the raw poll(2) failure (notably
    /// `ErrorKind::Interrupted` on signal delivery).
    pub fn wait(&mut self, budget_usec: i64) -> io::Result<usize> {
        let timeout_ms = (budget_usec / 1000) as libc::c_int;
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    pub fn readable(&self, idx: usize) -> bool {
        self.fds[idx].revents & (libc::POLLIN | libc::POLLPRI) != 0
    }

    pub fn writable(&self, idx: usize) -> bool {
        self.fds[idx].revents & libc::POLLOUT != 0
    }

    pub fn errored(&self, idx: usize) -> bool {
        self.fds[idx].revents & (libc::POLLERR | libc::POLLHUP) != 0
    }
}

impl Default for PollSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive `cycle` repeatedly until one wall-clock second has elapsed,
/// handing each invocation the microseconds left in the second. The cycle
/// returns `false` to abort early (poll failure or signal).
pub fn run_for_one_second<F>(mut cycle: F)
where
    F: FnMut(i64) -> bool,
{
    let end = Instant::now() + Duration::from_secs(1);
    loop {
        let now = Instant::now();
        if now >= end {
            break;
        }
        let budget_usec = (end - now).as_micros() as i64;
        if !cycle(budget_usec) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn reports_readable_and_writable() {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(b"x").unwrap();

        let mut poll = PollSet::new();
        let rd = poll.push(b.as_raw_fd(), true, false);
        let wr = poll.push(a.as_raw_fd(), false, true);
        let n = poll.wait(10_000).unwrap();
        assert_eq!(n, 2);
        assert!(poll.readable(rd));
        assert!(!poll.writable(rd));
        assert!(poll.writable(wr));
    }

    #[test]
    fn reports_hangup_as_error() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);

        let mut poll = PollSet::new();
        let idx = poll.push(b.as_raw_fd(), true, false);
        poll.wait(10_000).unwrap();
        assert!(poll.errored(idx));
    }

    #[test]
    fn empty_set_times_out() {
        let mut poll = PollSet::new();
        let start = Instant::now();
        assert_eq!(poll.wait(20_000).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn one_second_driver_stays_within_budget() {
        let start = Instant::now();
        let mut cycles = 0;
        run_for_one_second(|budget| {
            assert!(budget > 0 && budget <= 1_000_000);
            cycles += 1;
            std::thread::sleep(Duration::from_millis(50));
            true
        });
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(cycles >= 2);
    }
}
