// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host-side channel binding: connects the guest's Unix-domain socket,
//! and opens the loopback service socket when a session arrives.

use std::io::Read;
use std::net::{Ipv4Addr, TcpStream};
use std::os::unix::net::UnixStream;

use log::{info, warn};

use super::{Channel, ConnState, ForeignStream, Role};

impl Channel {
    pub(super) fn reconnect_host(&mut self) {
        let stream = UnixStream::connect(&self.path)
            .and_then(|s| s.set_nonblocking(true).map(|_| s));
        match stream {
            Ok(s) => {
                self.foreign = Some(ForeignStream::Socket(s));
                // Fresh endpoint, fresh rest state and poll interest.
                self.reset_cleanup();

                // Drain whatever a previous incarnation left in the socket.
                loop {
                    let stream = match self.foreign.as_mut() {
                        Some(s) => s,
                        None => return,
                    };
                    match stream.read(&mut self.rx_buf[..]) {
                        Ok(n) if n > 0 => continue,
                        _ => break,
                    }
                }

                info!("Open channel endpoint: {}", self.path.display());
            }
            Err(err) => {
                warn!(
                    "Failed to open channel endpoint: {}: {}",
                    self.path.display(),
                    err
                );
                self.conn_state = ConnState::Closed;
            }
        }
    }

    /// Open the per-session TCP socket to the proxied service. The connect
    /// blocks briefly; everything after it is nonblocking.
    pub(super) fn open_service_socket(&mut self) -> bool {
        let port = match self.role {
            Role::Host { service_port, .. } => service_port,
            Role::Guest { .. } => return false,
        };

        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .and_then(|s| s.set_nonblocking(true).map(|_| s));
        match stream {
            Ok(s) => {
                info!("Open service socket: {}", self.path.display());
                self.native = Some(s);
                true
            }
            Err(err) => {
                warn!(
                    "Failed to connect service socket: {}: {}",
                    self.path.display(),
                    err
                );
                false
            }
        }
    }
}
