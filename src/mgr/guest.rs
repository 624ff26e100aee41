// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest-side manager: owns the channel registry, the endpoint directory
//! scan, and the loopback listener that guest-local clients connect to.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use crate::channel::{Channel, ConnState};
use crate::poller::{self, PollSet};

#[derive(Debug)]
pub enum Error {
    /// Could not set up the client-facing listener socket.
    Listener(io::Error),
    /// Root path missing, unreadable, or not a directory.
    RootDir(PathBuf, io::Error),
}
pub type Result<T> = std::result::Result<T, Error>;

/// Raw listener setup: `SO_REUSEADDR`, nonblocking, loopback only, and a
/// zero backlog so clients queue in the kernel no deeper than the proxy
/// can service them.
fn bind_listener(port: u16) -> io::Result<TcpListener> {
    fn close_on_err(fd: RawFd, err: io::Error) -> io::Error {
        unsafe { libc::close(fd) };
        err
    }

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            return Err(close_on_err(fd, io::Error::last_os_error()));
        }

        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(close_on_err(fd, io::Error::last_os_error()));
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_LOOPBACK.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            return Err(close_on_err(fd, io::Error::last_os_error()));
        }

        if libc::listen(fd, 0) < 0 {
            return Err(close_on_err(fd, io::Error::last_os_error()));
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

pub struct GuestManager {
    root: PathBuf,
    timeout_ticks: u32,
    listener: TcpListener,
    channels: BTreeMap<PathBuf, Channel>,
    poll: PollSet,
    // Per-channel poll slot indices, rebuilt each cycle alongside the set.
    slots: Vec<(Option<usize>, Option<usize>)>,
}

impl GuestManager {
    pub fn new(root: PathBuf, listen_port: u16, timeout_ticks: u32) -> Result<Self> {
        let listener = bind_listener(listen_port).map_err(Error::Listener)?;
        info!(
            "Listening for client connections on 127.0.0.1:{}",
            listen_port
        );
        Ok(Self {
            root,
            timeout_ticks,
            listener,
            channels: BTreeMap::new(),
            poll: PollSet::new(),
            slots: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn has_channel(&self, path: &Path) -> bool {
        self.channels.contains_key(path)
    }

    /// Scan the root directory for endpoints. Every file is one channel.
    /// With `reconnect` set, channels whose endpoint is closed retry the
    /// open; endpoints that will not open stay registered for later cycles.
    pub fn enumerate_endpoints(&mut self, reconnect: bool) -> Result<()> {
        for ch in self.channels.values_mut() {
            ch.set_probation(true);
        }

        let entries =
            fs::read_dir(&self.root).map_err(|e| Error::RootDir(self.root.clone(), e))?;
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!("Cannot stat channel endpoint entry: {}", err);
                    continue;
                }
            };
            let path = entry.path();

            // Real guests expose the endpoints as character devices or
            // symlinks to them; accept anything and let the open decide.
            if let Some(ch) = self.channels.get_mut(&path) {
                ch.set_probation(false);
                if reconnect && !ch.has_foreign() {
                    ch.reconnect();
                }
            } else {
                info!("Create channel: {}", path.display());
                let ch = Channel::new_guest(path.clone(), self.timeout_ticks);
                self.channels.insert(path, ch);
            }
        }

        self.channels.retain(|path, ch| {
            if ch.probation() {
                info!("Delete channel: {}", path.display());
                false
            } else {
                true
            }
        });
        Ok(())
    }

    /// One poll cycle: build the descriptor set, wait up to `budget_usec`,
    /// fan readiness back out, and run the engine on touched channels.
    /// Returns false when the wait was interrupted or failed.
    pub fn poll_cycle(&mut self, budget_usec: i64) -> bool {
        self.poll.clear();
        self.slots.clear();

        let listener_slot = self
            .poll
            .push(self.listener.as_raw_fd(), true, false);

        let poll = &mut self.poll;
        let slots = &mut self.slots;
        for ch in self.channels.values_mut() {
            // Channels with no session in motion stay out of the set; a new
            // client connection is what rearms them.
            if ch.conn_state() == ConnState::Closed {
                slots.push((None, None));
                continue;
            }
            let native_slot = ch.native_fd().map(|fd| {
                let want_write = ch.native_interest.want_write;
                ch.native_interest.want_write = false;
                poll.push(fd, ch.native_interest.want_read, want_write)
            });
            let foreign_slot = ch.foreign_fd().map(|fd| {
                let want_write = ch.foreign_interest.want_write;
                ch.foreign_interest.want_write = false;
                poll.push(fd, ch.foreign_interest.want_read, want_write)
            });
            slots.push((foreign_slot, native_slot));
        }

        let ready = match self.poll.wait(budget_usec) {
            Ok(n) => n,
            Err(err) => {
                if err.kind() != io::ErrorKind::Interrupted {
                    warn!("poll failed: {}", err);
                }
                return false;
            }
        };
        if ready == 0 {
            return true;
        }

        for (ch, (foreign_slot, native_slot)) in
            self.channels.values_mut().zip(self.slots.iter())
        {
            let mut run = false;
            if let Some(idx) = *foreign_slot {
                if self.poll.readable(idx) {
                    ch.foreign_interest.readable = true;
                    run = true;
                }
                if self.poll.writable(idx) {
                    ch.foreign_interest.writable = true;
                    run = true;
                }
                if self.poll.errored(idx) {
                    ch.foreign_interest.errored = true;
                    run = true;
                }
            }
            if let Some(idx) = *native_slot {
                if self.poll.readable(idx) {
                    ch.native_interest.readable = true;
                    run = true;
                }
                if self.poll.writable(idx) {
                    ch.native_interest.writable = true;
                    run = true;
                }
                if self.poll.errored(idx) {
                    ch.native_interest.errored = true;
                    run = true;
                }
            }
            if run {
                ch.run_protocol();
            }
        }

        let accept_ready = self.poll.readable(listener_slot);
        if accept_ready {
            self.accept_client();
        }
        true
    }

    /// Poll until one wall-clock second has elapsed.
    pub fn poll_one_second(&mut self) {
        poller::run_for_one_second(|budget| self.poll_cycle(budget));
    }

    /// 1 Hz notification fanned out to every channel, so sessions making no
    /// progress get a chance to time out.
    pub fn clock_tick(&mut self) {
        for ch in self.channels.values_mut() {
            ch.clock_tick();
        }
    }

    // The listening socket is readable: accept and hand the socket to the
    // first channel with no client attached.
    fn accept_client(&mut self) {
        info!("Accepting client connection");

        let (stream, addr) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(err) => {
                error!("Accept failed: {}", err);
                return;
            }
        };
        if let Err(err) = stream.set_nonblocking(true) {
            warn!("Unable to set client connection nonblocking: {}", err);
        }
        debug!("New client connection: {}", addr);

        let mut pending = stream;
        for ch in self.channels.values_mut() {
            if ch.has_native() {
                continue;
            }
            pending = match ch.start_connection(pending) {
                Ok(()) => return,
                Err(back) => back,
            };
        }

        // No channel available; drop the socket so the client sees a close.
        info!("Connection rejected - all channels busy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Read;
    use std::net::TcpStream;
    use std::time::Duration;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new(tag: &str) -> Self {
            let mut path = std::env::temp_dir();
            path.push(format!("serialtun-mgr-{}-{}", tag, std::process::id()));
            fs::create_dir_all(&path).unwrap();
            TempDir(path)
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn manager(root: &Path) -> GuestManager {
        GuestManager::new(root.to_path_buf(), 0, 2).unwrap()
    }

    #[test]
    fn probation_tracks_endpoint_lifetime() {
        let dir = TempDir::new("probation");
        let mut mgr = manager(dir.path());

        let endpoint = dir.path().join("org.test.port.0");
        File::create(&endpoint).unwrap();

        mgr.enumerate_endpoints(false).unwrap();
        assert_eq!(mgr.channel_count(), 1);
        assert!(mgr.has_channel(&endpoint));

        // Present again: entry stays.
        mgr.enumerate_endpoints(false).unwrap();
        assert_eq!(mgr.channel_count(), 1);

        // Gone from the filesystem: entry dropped.
        fs::remove_file(&endpoint).unwrap();
        mgr.enumerate_endpoints(false).unwrap();
        assert_eq!(mgr.channel_count(), 0);
    }

    #[test]
    fn endpoint_churn_leaves_no_entries_behind() {
        let dir = TempDir::new("churn");
        let mut mgr = manager(dir.path());

        for i in 0..100 {
            let endpoint = dir.path().join(format!("port.{}", i));
            File::create(&endpoint).unwrap();
            mgr.enumerate_endpoints(false).unwrap();
            assert_eq!(mgr.channel_count(), 1);
            fs::remove_file(&endpoint).unwrap();
            mgr.enumerate_endpoints(false).unwrap();
            assert_eq!(mgr.channel_count(), 0);
        }
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = TempDir::new("missing-root");
        let mut mgr = manager(&dir.path().join("no-such-dir"));
        assert!(mgr.enumerate_endpoints(false).is_err());
    }

    #[test]
    fn overloaded_accept_closes_the_client() {
        let dir = TempDir::new("overload");
        let mut mgr = manager(dir.path());
        let addr = mgr.local_addr().unwrap();

        // No channels registered, so the accepted socket must be dropped.
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        for _ in 0..10 {
            mgr.poll_cycle(10_000);
        }

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
