// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest-side channel binding: opens the virtio-serial character device,
//! initiates sessions on behalf of accepted clients, and times out session
//! attempts the host never answers.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::OpenOptionsExt;

use log::{debug, error, info, warn};

use crate::frame::{self, defs as wire, FrameHeader};

use super::{Channel, ConnState, ForeignStream, IoStatus, Role};

impl Channel {
    pub(super) fn reconnect_guest(&mut self) {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path);
        match file {
            Ok(f) => {
                info!("Open channel endpoint: {}", self.path.display());
                self.foreign = Some(ForeignStream::Device(f));
            }
            Err(err) => {
                warn!(
                    "Failed to open channel endpoint: {}: {}",
                    self.path.display(),
                    err
                );
            }
        }
    }

    /// Adopt a freshly accepted client socket and start a session toward the
    /// host. On failure the socket is handed back so the caller can try
    /// another channel.
    pub fn start_connection(&mut self, client: TcpStream) -> Result<(), TcpStream> {
        if self.foreign.is_none() {
            self.reconnect();
            if self.foreign.is_none() {
                return Err(client);
            }
        }

        // Prime resynchronization: one frame's worth of sync bytes lets the
        // host receiver find a sync0 at any offset in its stream. A short
        // write here means the endpoint is wedged beyond what retrying
        // would fix.
        self.tx_buf.fill(wire::SYNC0);
        if let Some(stream) = self.foreign.as_mut() {
            if let Err(err) = stream.write(&self.tx_buf[..wire::MAX_PAYLOAD_SIZE]) {
                debug!(
                    "Resync priming write failed: {}: {}",
                    self.path.display(),
                    err
                );
            }
        }

        // Drain whatever a previous session left behind. A stale RESET frame
        // may still arrive after this; SYN_SENT handles it by token match.
        loop {
            let stream = match self.foreign.as_mut() {
                Some(s) => s,
                None => return Err(client),
            };
            match stream.read(&mut self.rx_buf[..]) {
                Ok(n) if n > 0 => continue,
                _ => break,
            }
        }

        self.reset_cleanup();

        self.guest_token = self.tokens.token();

        let syn = FrameHeader::new(wire::CTRL_SYN, self.guest_token, wire::TOKEN_PENDING, 0);
        match self.send_header_now(syn) {
            IoStatus::Closed | IoStatus::Error => {
                // The endpoint died under us; give the socket back.
                self.guest_token = wire::TOKEN_RESET;
                return Err(client);
            }
            _ => {}
        }

        self.native = Some(client);

        info!(
            "Transition to SYN_SENT: {}: {}",
            self.path.display(),
            frame::session_id(self.guest_token, wire::TOKEN_PENDING)
        );
        self.conn_state = ConnState::SynSent;

        if let Role::Guest {
            timeout_ticks,
            ref mut ticks_left,
        } = self.role
        {
            *ticks_left = timeout_ticks;
        }

        self.foreign_interest.want_read = true;
        self.foreign_interest.want_write = true;

        // Inhibit client reads: clients typically send an opening hello
        // immediately, which would flood the poller with read-ready signals
        // until the host confirms the session.
        self.native_interest.want_read = false;

        Ok(())
    }

    /// 1 Hz notification from the manager; times out sessions stuck waiting
    /// for a SYNACK.
    pub fn clock_tick(&mut self) {
        if self.conn_state != ConnState::SynSent {
            return;
        }
        let expired = match self.role {
            Role::Guest {
                ref mut ticks_left, ..
            } => {
                *ticks_left = ticks_left.saturating_sub(1);
                *ticks_left == 0
            }
            Role::Host { .. } => return,
        };
        if expired {
            // The host never answered our SYN; it is not there.
            error!(
                "Session connect timeout: {}: {}",
                self.path.display(),
                frame::session_id(self.guest_token, self.host_token)
            );
            self.close_native();
            self.reset_cleanup();
        }
    }
}
