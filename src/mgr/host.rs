// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host-side manager: two-level discovery under the root directory. Each
//! immediate subdirectory names a guest; each Unix stream socket inside a
//! guest directory is one channel to that guest.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::channel::Channel;
use crate::poller::{self, PollSet};

// Registry entry for one guest directory.
struct GuestEntry {
    probation: bool,
}

pub struct HostManager {
    root: PathBuf,
    service_port: u16,
    guests: BTreeMap<PathBuf, GuestEntry>,
    channels: BTreeMap<PathBuf, Channel>,
    poll: PollSet,
    slots: Vec<(Option<usize>, Option<usize>)>,
}

impl HostManager {
    pub fn new(root: PathBuf, service_port: u16) -> Self {
        Self {
            root,
            service_port,
            guests: BTreeMap::new(),
            channels: BTreeMap::new(),
            poll: PollSet::new(),
            slots: Vec::new(),
        }
    }

    pub fn guest_count(&self) -> usize {
        self.guests.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn has_channel(&self, path: &Path) -> bool {
        self.channels.contains_key(path)
    }

    /// Scan the root for guest directories, then each guest directory for
    /// channel sockets. A root that is temporarily unreadable only costs
    /// this pass.
    pub fn enumerate_guest_dirs(&mut self, reconnect: bool) {
        for guest in self.guests.values_mut() {
            guest.probation = true;
        }

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    "Cannot access guest root: {}: {}",
                    self.root.display(),
                    err
                );
                return;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!("Cannot stat guest root entry: {}", err);
                    continue;
                }
            };
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(err) => {
                    warn!("Cannot stat guest root entry: {}", err);
                    continue;
                }
            };
            let path = entry.path();

            if !file_type.is_dir() {
                debug!(
                    "Guest root entry is not a guest directory: {}",
                    path.display()
                );
                continue;
            }

            if let Some(guest) = self.guests.get_mut(&path) {
                guest.probation = false;
            } else {
                info!("Create guest: {}", path.display());
                self.guests.insert(path, GuestEntry { probation: false });
            }
        }

        // Drop vanished guests along with all their channels.
        let doomed: Vec<PathBuf> = self
            .guests
            .iter()
            .filter(|(_, g)| g.probation)
            .map(|(path, _)| path.clone())
            .collect();
        for guest_dir in doomed {
            info!("Delete guest: {}", guest_dir.display());
            self.guests.remove(&guest_dir);
            self.channels.retain(|path, ch| {
                if ch.guest_dir() == Some(guest_dir.as_path()) {
                    info!("Delete channel: {}", path.display());
                    false
                } else {
                    true
                }
            });
        }

        let guest_dirs: Vec<PathBuf> = self.guests.keys().cloned().collect();
        for guest_dir in guest_dirs {
            self.enumerate_guest_channels(&guest_dir, reconnect);
        }
    }

    // Scan one guest directory for channel sockets.
    fn enumerate_guest_channels(&mut self, guest_dir: &Path, reconnect: bool) {
        for ch in self.channels.values_mut() {
            if ch.guest_dir() == Some(guest_dir) {
                ch.set_probation(true);
            }
        }

        let entries = match fs::read_dir(guest_dir) {
            Ok(entries) => entries,
            Err(err) => {
                // The guest vanished mid-scan; the next root pass collects it.
                warn!(
                    "Cannot access guest directory: {}: {}",
                    guest_dir.display(),
                    err
                );
                return;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!("Cannot stat guest endpoint entry: {}", err);
                    continue;
                }
            };
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(err) => {
                    warn!("Cannot stat guest endpoint entry: {}", err);
                    continue;
                }
            };
            let path = entry.path();

            if !file_type.is_socket() {
                debug!(
                    "Guest directory entry is not a channel socket: {}",
                    path.display()
                );
                continue;
            }

            if let Some(ch) = self.channels.get_mut(&path) {
                ch.set_probation(false);
                if reconnect && !ch.has_foreign() {
                    ch.reconnect();
                }
            } else {
                info!("Create channel: {}", path.display());
                let ch =
                    Channel::new_host(path.clone(), guest_dir.to_path_buf(), self.service_port);
                self.channels.insert(path, ch);
            }
        }

        self.channels.retain(|path, ch| {
            if ch.guest_dir() == Some(guest_dir) && ch.probation() {
                info!("Delete channel: {}", path.display());
                false
            } else {
                true
            }
        });
    }

    /// One poll cycle over every channel's endpoints. Returns false when the
    /// wait was interrupted or failed.
    pub fn poll_cycle(&mut self, budget_usec: i64) -> bool {
        self.poll.clear();
        self.slots.clear();

        let poll = &mut self.poll;
        let slots = &mut self.slots;
        for ch in self.channels.values_mut() {
            let foreign_slot = ch.foreign_fd().map(|fd| {
                let want_write = ch.foreign_interest.want_write;
                ch.foreign_interest.want_write = false;
                poll.push(fd, ch.foreign_interest.want_read, want_write)
            });
            let native_slot = ch.native_fd().map(|fd| {
                let want_write = ch.native_interest.want_write;
                ch.native_interest.want_write = false;
                poll.push(fd, ch.native_interest.want_read, want_write)
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
        true
    }

    /// Poll until one wall-clock second has elapsed.
    pub fn poll_one_second(&mut self) {
        poller::run_for_one_second(|budget| self.poll_cycle(budget));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::unix::net::UnixListener;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new(tag: &str) -> Self {
            let mut path = std::env::temp_dir();
            path.push(format!("serialtun-hmgr-{}-{}", tag, std::process::id()));
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

    #[test]
    fn two_level_discovery_and_probation() {
        let dir = TempDir::new("levels");
        let mut mgr = HostManager::new(dir.path().to_path_buf(), 0);

        let guest_dir = dir.path().join("guest1");
        fs::create_dir(&guest_dir).unwrap();
        let sock_path = guest_dir.join("chan0");
        let _listener = UnixListener::bind(&sock_path).unwrap();

        mgr.enumerate_guest_dirs(false);
        assert_eq!(mgr.guest_count(), 1);
        assert_eq!(mgr.channel_count(), 1);
        assert!(mgr.has_channel(&sock_path));

        // The socket disappears: its channel goes, the guest stays.
        fs::remove_file(&sock_path).unwrap();
        mgr.enumerate_guest_dirs(false);
        assert_eq!(mgr.guest_count(), 1);
        assert_eq!(mgr.channel_count(), 0);

        // The guest directory disappears too.
        fs::remove_dir(&guest_dir).unwrap();
        mgr.enumerate_guest_dirs(false);
        assert_eq!(mgr.guest_count(), 0);
    }

    #[test]
    fn deleting_a_guest_drops_its_channels() {
        let dir = TempDir::new("guest-drop");
        let mut mgr = HostManager::new(dir.path().to_path_buf(), 0);

        let guest_dir = dir.path().join("guest1");
        fs::create_dir(&guest_dir).unwrap();
        let _l0 = UnixListener::bind(guest_dir.join("chan0")).unwrap();
        let _l1 = UnixListener::bind(guest_dir.join("chan1")).unwrap();

        mgr.enumerate_guest_dirs(false);
        assert_eq!(mgr.channel_count(), 2);

        fs::remove_dir_all(&guest_dir).unwrap();
        mgr.enumerate_guest_dirs(false);
        assert_eq!(mgr.guest_count(), 0);
        assert_eq!(mgr.channel_count(), 0);
    }

    #[test]
    fn non_socket_entries_are_ignored() {
        let dir = TempDir::new("cruft");
        let mut mgr = HostManager::new(dir.path().to_path_buf(), 0);

        let guest_dir = dir.path().join("guest1");
        fs::create_dir(&guest_dir).unwrap();
        File::create(guest_dir.join("not-a-socket")).unwrap();
        // A regular file at root level is not a guest either.
        File::create(dir.path().join("stray")).unwrap();

        mgr.enumerate_guest_dirs(false);
        assert_eq!(mgr.guest_count(), 1);
        assert_eq!(mgr.channel_count(), 0);
    }

    #[test]
    fn unreadable_root_skips_the_pass() {
        let dir = TempDir::new("no-root");
        let mut mgr = HostManager::new(dir.path().join("gone"), 0);

        // Must not drop registered state on a transient failure.
        mgr.enumerate_guest_dirs(false);
        assert_eq!(mgr.guest_count(), 0);
    }
}
