// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-channel protocol engine.
//!
//! A channel pairs one *foreign* endpoint (the byte stream joining the two
//! proxies: a character device on the guest side, a Unix socket on the host
//! side) with at most one *native* endpoint (the TCP socket on the locally
//! reachable side: an accepted client on the guest, the loopback service on
//! the host). The engine runs on demand after the poller marks one of the
//! endpoints readable, writable or errored, and performs in order:
//! - the foreign transmit drain (finish any partially sent frame);
//! - the foreign receive machine (byte-stream resynchronization, frame
//!   assembly, dispatch);
//! - while a session is established, the native read pump that turns
//!   locally received bytes into DATA frames.
//!
//! The two proxy roles share this engine; behavior differences (rest state,
//! which side opens what, session initiation) hang off the `Role` variant.
//! Session setup and teardown specifics live in the `guest` and `host`
//! submodules.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::frame::{self, defs as wire, FrameHeader, TokenSource};

pub mod guest;
pub mod host;

pub mod defs {
    /// Cap on receive passes per engine invocation; bounds resynchronization
    /// work on a fully garbled stream to about one frame's worth of bytes.
    pub const RX_LOOP_LIMIT: usize = crate::frame::defs::MAX_PAYLOAD_SIZE;

    /// Cap on in-flight bytes consumed while a pending reset waits for the
    /// receiver to reach a frame boundary.
    pub const RESET_DRAIN_LIMIT: usize = 10_000;

    /// Default number of 1 Hz ticks a guest channel waits in SYN_SENT before
    /// abandoning the session attempt.
    pub const CONNECT_TIMEOUT_TICKS: u32 = 30;
}

/// Outcome of a single nonblocking read or write attempt. Every I/O path in
/// the engine reports one of these; nothing escapes as a raw error.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IoStatus {
    /// All requested bytes were transferred.
    Normal,
    /// Some, but not all, requested bytes were transferred.
    Incomplete,
    /// Nothing available; a read would block.
    Empty,
    /// No room; a write would block.
    Full,
    /// The peer closed the stream.
    Closed,
    /// Any other socket error; the endpoint has been torn down.
    Error,
}

/// Connection lifetime state. Guest channels never enter `Listen`; host
/// channels never enter `SynSent`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConnState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
}

impl ConnState {
    pub fn name(self) -> &'static str {
        match self {
            ConnState::Closed => "CLOSED",
            ConnState::Listen => "LISTEN",
            ConnState::SynSent => "SYN_SENT",
            ConnState::SynRcvd => "SYN_RCVD",
            ConnState::Established => "ESTABLISHED",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum RxState {
    GetSync0,
    GetSync1,
    GetHeader,
    GetData,
    MessageReady,
    MessageToPeer,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum TxState {
    SendIdle,
    SendHeader,
    SendBuffer,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ResetState {
    Idle,
    Requested,
    SendInFlight,
}

/// Which proxy this channel belongs to, plus the role-specific knobs.
#[derive(Debug)]
pub enum Role {
    Guest {
        /// SYN_SENT ticks allowed before the session attempt is abandoned.
        timeout_ticks: u32,
        /// Ticks remaining; meaningful only while in SYN_SENT.
        ticks_left: u32,
    },
    Host {
        /// Loopback TCP port of the proxied service.
        service_port: u16,
        /// Directory representing the guest that owns this channel.
        guest_dir: PathBuf,
    },
}

/// The byte-stream endpoint joining the two proxies.
pub enum ForeignStream {
    /// Guest side: a virtio-serial character device (or any file opened
    /// read/write).
    Device(File),
    /// Host side: a connected Unix domain stream socket.
    Socket(UnixStream),
}

impl AsRawFd for ForeignStream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            ForeignStream::Device(f) => f.as_raw_fd(),
            ForeignStream::Socket(s) => s.as_raw_fd(),
        }
    }
}

impl Read for ForeignStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ForeignStream::Device(f) => f.read(buf),
            ForeignStream::Socket(s) => s.read(buf),
        }
    }
}

impl Write for ForeignStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ForeignStream::Device(f) => f.write(buf),
            ForeignStream::Socket(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ForeignStream::Device(f) => f.flush(),
            ForeignStream::Socket(s) => s.flush(),
        }
    }
}

/// Poller bookkeeping for one endpoint: the interest the channel wants
/// watched next cycle, and the indications the last cycle reported.
#[derive(Clone, Copy, Debug, Default)]
pub struct Interest {
    pub want_read: bool,
    pub want_write: bool,
    pub readable: bool,
    pub writable: bool,
    pub errored: bool,
}

#[derive(Clone, Copy)]
enum RecvTarget {
    Sync0,
    Sync1,
    Header,
    Payload,
}

#[derive(Clone, Copy)]
enum SendTarget {
    Header,
    Payload,
}

enum RawIo {
    Done,
    Partial(usize),
    WouldBlock,
    Closed,
    Err(io::Error),
}

fn read_stream<R: Read>(src: &mut R, buf: &mut [u8]) -> RawIo {
    if buf.is_empty() {
        return RawIo::Done;
    }
    match src.read(buf) {
        Ok(0) => RawIo::Closed,
        Ok(n) if n == buf.len() => RawIo::Done,
        Ok(n) => RawIo::Partial(n),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => RawIo::WouldBlock,
        Err(e) => RawIo::Err(e),
    }
}

fn write_stream<W: Write>(dst: &mut W, buf: &[u8]) -> RawIo {
    if buf.is_empty() {
        return RawIo::Done;
    }
    match dst.write(buf) {
        Ok(0) => RawIo::Closed,
        Ok(n) if n == buf.len() => RawIo::Done,
        Ok(n) => RawIo::Partial(n),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => RawIo::WouldBlock,
        Err(e) => RawIo::Err(e),
    }
}

pub struct Channel {
    path: PathBuf,
    role: Role,
    probation: bool,

    foreign: Option<ForeignStream>,
    native: Option<TcpStream>,
    pub foreign_interest: Interest,
    pub native_interest: Interest,

    conn_state: ConnState,
    rx_state: RxState,
    tx_state: TxState,
    reset_state: ResetState,

    // Receive accumulators: raw header bytes, decoded header once complete,
    // and the payload buffer. `rx_count` tracks receive progress while a
    // frame is assembling, then delivery progress while its payload drains
    // to the native endpoint.
    rx_header_raw: [u8; wire::HEADER_SIZE],
    rx_header_count: usize,
    rx_header: FrameHeader,
    rx_buf: Box<[u8; wire::PAYLOAD_BUF_SIZE]>,
    rx_count: usize,

    // Transmit accumulators. The payload buffer doubles as the staging area
    // for native reads before they are framed.
    tx_header_raw: [u8; wire::HEADER_SIZE],
    tx_header_count: usize,
    tx_buf: Box<[u8; wire::PAYLOAD_BUF_SIZE]>,
    tx_count: usize,
    tx_payload_len: usize,
    tx_pending: bool,

    guest_token: u32,
    host_token: u32,

    tokens: TokenSource,
}

impl Channel {
    /// Guest-side channel over the character device at `path`. Tries to open
    /// the endpoint right away; failure leaves the channel retriable on the
    /// next reconnect cycle.
    pub fn new_guest(path: PathBuf, timeout_ticks: u32) -> Self {
        let mut ch = Self::with_role(
            path,
            Role::Guest {
                timeout_ticks,
                ticks_left: 0,
            },
        );
        ch.reconnect();
        ch
    }

    /// Host-side channel over the Unix socket at `path`, owned by the guest
    /// represented by `guest_dir`.
    pub fn new_host(path: PathBuf, guest_dir: PathBuf, service_port: u16) -> Self {
        let mut ch = Self::with_role(
            path,
            Role::Host {
                service_port,
                guest_dir,
            },
        );
        ch.reconnect();
        ch
    }

    fn with_role(path: PathBuf, role: Role) -> Self {
        Self {
            path,
            role,
            probation: false,
            foreign: None,
            native: None,
            foreign_interest: Interest::default(),
            native_interest: Interest::default(),
            conn_state: ConnState::Closed,
            rx_state: RxState::GetSync0,
            tx_state: TxState::SendIdle,
            reset_state: ResetState::Idle,
            rx_header_raw: [0; wire::HEADER_SIZE],
            rx_header_count: 0,
            rx_header: FrameHeader::default(),
            rx_buf: Box::new([0; wire::PAYLOAD_BUF_SIZE]),
            rx_count: 0,
            tx_header_raw: [0; wire::HEADER_SIZE],
            tx_header_count: 0,
            tx_buf: Box::new([0; wire::PAYLOAD_BUF_SIZE]),
            tx_count: 0,
            tx_payload_len: 0,
            tx_pending: false,
            guest_token: wire::TOKEN_UNSET,
            host_token: wire::TOKEN_UNSET,
            tokens: TokenSource::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn probation(&self) -> bool {
        self.probation
    }

    pub fn set_probation(&mut self, on: bool) {
        self.probation = on;
    }

    pub fn conn_state(&self) -> ConnState {
        self.conn_state
    }

    pub fn has_foreign(&self) -> bool {
        self.foreign.is_some()
    }

    pub fn has_native(&self) -> bool {
        self.native.is_some()
    }

    pub fn foreign_fd(&self) -> Option<RawFd> {
        self.foreign.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn native_fd(&self) -> Option<RawFd> {
        self.native.as_ref().map(|s| s.as_raw_fd())
    }

    /// Directory of the owning guest; host-side channels only.
    pub fn guest_dir(&self) -> Option<&Path> {
        match self.role {
            Role::Host { ref guest_dir, .. } => Some(guest_dir),
            Role::Guest { .. } => None,
        }
    }

    /// Tokens of the session currently negotiated on this channel.
    pub fn session_tokens(&self) -> (u32, u32) {
        (self.guest_token, self.host_token)
    }

    /// Try to (re)open the foreign endpoint.
    pub fn reconnect(&mut self) {
        match self.role {
            Role::Guest { .. } => self.reconnect_guest(),
            Role::Host { .. } => self.reconnect_host(),
        }
    }

    fn rest_state(&self) -> ConnState {
        match self.role {
            Role::Guest { .. } => ConnState::Closed,
            Role::Host { .. } => ConnState::Listen,
        }
    }

    fn resync_allowed(&self) -> bool {
        match self.role {
            Role::Guest { .. } => self.conn_state == ConnState::SynSent,
            Role::Host { .. } => self.conn_state == ConnState::Listen,
        }
    }

    fn native_peer(&self) -> &'static str {
        match self.role {
            Role::Guest { .. } => "client",
            Role::Host { .. } => "service",
        }
    }

    /// One engine pass. The poller calls this after setting fresh readiness
    /// indications on either endpoint.
    pub fn run_protocol(&mut self) {
        debug!("Run protocol: {}", self.path.display());

        if self.conn_state == ConnState::Closed {
            self.foreign_interest.want_read = false;
            self.foreign_interest.want_write = false;
            return;
        }

        if self.reset_state == ResetState::Idle {
            if self.foreign.is_some() && self.foreign_interest.writable {
                self.run_tx();
            }

            // The receive machine loops to chew through pre-session junk; the
            // cap keeps a garbage flood from starving other channels.
            let mut run_again = true;
            let mut spins = 0;
            while self.foreign.is_some()
                && self.foreign_interest.readable
                && self.reset_state == ResetState::Idle
                && run_again
                && spins < defs::RX_LOOP_LIMIT
            {
                run_again = self.run_rx();
                spins += 1;
            }

            // A payload stuck on its way to the native side retries on the
            // native writable indication even when the foreign stream is
            // quiet.
            if self.rx_state == RxState::MessageToPeer
                && self.reset_state == ResetState::Idle
                && self.native_interest.writable
            {
                self.run_rx();
            }

            if self.conn_state == ConnState::Established && self.reset_state == ResetState::Idle {
                if self.native_interest.readable {
                    self.native_interest.want_read = false;
                }
                if self.tx_state == TxState::SendIdle {
                    match self.native_recv() {
                        IoStatus::Normal => self.queue_data_frame(),
                        IoStatus::Empty => self.native_interest.want_read = true,
                        IoStatus::Closed | IoStatus::Error => {
                            let reason = format!("channel closed by {}", self.native_peer());
                            self.request_reset(&reason);
                        }
                        IoStatus::Incomplete | IoStatus::Full => {}
                    }
                }
            }
        }

        if self.reset_state == ResetState::Requested {
            // Drain any in-flight transmit before the RESET frame may go out.
            if self.tx_state != TxState::SendIdle {
                if self.foreign.is_some() && self.foreign_interest.writable {
                    self.run_tx();
                }
                if self.tx_state != TxState::SendIdle {
                    return;
                }
            }

            // Drive the receiver to a frame boundary, discarding traffic.
            if self.rx_state != RxState::GetSync0 {
                let mut spins = 0;
                while self.foreign.is_some()
                    && self.foreign_interest.readable
                    && self.rx_state != RxState::GetSync0
                    && spins < defs::RESET_DRAIN_LIMIT
                {
                    self.run_rx();
                    spins += 1;
                }
                if self.rx_state != RxState::GetSync0 {
                    return;
                }
            }

            let reset = FrameHeader::new(wire::CTRL_RESET, self.guest_token, self.host_token, 0);
            match self.send_header_now(reset) {
                IoStatus::Normal => self.reset_cleanup(),
                IoStatus::Incomplete => self.reset_state = ResetState::SendInFlight,
                // Closed/Error: the endpoint is gone; nothing left to send.
                _ => {}
            }
        }

        if self.reset_state == ResetState::SendInFlight {
            if self.tx_state != TxState::SendIdle
                && self.foreign.is_some()
                && self.foreign_interest.writable
            {
                self.run_tx();
            }
            if self.tx_state != TxState::SendIdle {
                return;
            }
            self.reset_cleanup();
        }
    }

    /// Finish partially transmitted frames toward the foreign endpoint.
    fn run_tx(&mut self) {
        if self.tx_state == TxState::SendHeader {
            match self.foreign_send(SendTarget::Header) {
                IoStatus::Normal => self.tx_state = TxState::SendBuffer,
                IoStatus::Incomplete | IoStatus::Full => {}
                IoStatus::Closed | IoStatus::Error => return,
                IoStatus::Empty => {}
            }
        }

        if self.tx_state == TxState::SendBuffer {
            if self.tx_pending {
                match self.foreign_send(SendTarget::Payload) {
                    IoStatus::Normal => {
                        self.tx_state = TxState::SendIdle;
                        self.tx_pending = false;
                    }
                    IoStatus::Incomplete | IoStatus::Full => {}
                    IoStatus::Closed | IoStatus::Error => return,
                    IoStatus::Empty => {}
                }
            } else {
                self.tx_state = TxState::SendIdle;
            }
        }

        if self.tx_state == TxState::SendIdle {
            self.foreign_interest.want_write = false;
        }
    }

    /// One pass of the receive machine. Returns true when the caller should
    /// immediately run it again (resynchronization restarted from the top).
    fn run_rx(&mut self) -> bool {
        let mut run_again = false;

        // Hunt for sync0, one byte per pass so the caller's iteration cap
        // bounds the bytes a garbled stream can cost. Outside the
        // pre-session states a stray byte means the stream is corrupt and
        // the session must reset.
        if self.foreign_interest.readable
            && self.rx_state == RxState::GetSync0
            && self.reset_state == ResetState::Idle
        {
            match self.foreign_recv(RecvTarget::Sync0) {
                IoStatus::Normal => {
                    if self.rx_header_raw[0] == wire::SYNC0 {
                        self.rx_state = RxState::GetSync1;
                    } else if self.resync_allowed() {
                        // Pre-session garbage; discard and hunt on.
                        run_again = true;
                    } else {
                        self.request_reset("channel synchronization failed");
                    }
                }
                IoStatus::Empty => {}
                _ => return false,
            }
        }

        if self.foreign_interest.readable && self.rx_state == RxState::GetSync1 {
            match self.foreign_recv(RecvTarget::Sync1) {
                IoStatus::Normal => {
                    if self.rx_header_raw[1] == wire::SYNC1 {
                        self.rx_state = RxState::GetHeader;
                        // Both sync bytes are already in the header buffer.
                        self.rx_header_count = 2;
                    } else {
                        run_again = true;
                        if self.rx_header_raw[1] == wire::SYNC0 {
                            // Another sync0 candidate; look for sync1 again.
                        } else {
                            self.rx_state = RxState::GetSync0;
                        }
                    }
                }
                IoStatus::Empty => {}
                _ => return false,
            }
        }

        if self.rx_state == RxState::GetHeader {
            if self.foreign_interest.readable {
                match self.foreign_recv(RecvTarget::Header) {
                    IoStatus::Normal => match FrameHeader::decode(&self.rx_header_raw) {
                        Ok(hdr) => {
                            self.rx_header = hdr;
                            if hdr.payload_len > 0 {
                                self.rx_count = 0;
                                self.rx_state = RxState::GetData;
                            } else {
                                self.rx_state = RxState::MessageReady;
                            }
                        }
                        Err(err) => {
                            debug!(
                                "Frame header validation failed: {}: {:?}",
                                self.path.display(),
                                err
                            );
                            self.request_reset("unsupported frame header");
                        }
                    },
                    IoStatus::Incomplete | IoStatus::Empty => {}
                    _ => return false,
                }
            } else {
                self.foreign_interest.want_read = true;
            }
        }

        if self.rx_state == RxState::GetData {
            if self.foreign_interest.readable {
                match self.foreign_recv(RecvTarget::Payload) {
                    IoStatus::Normal => self.rx_state = RxState::MessageReady,
                    IoStatus::Incomplete | IoStatus::Empty => {}
                    _ => return false,
                }
            } else {
                self.foreign_interest.want_read = true;
            }
        }

        if self.rx_state == RxState::MessageReady {
            if self.reset_state == ResetState::Idle {
                if self.process_frame() {
                    self.rx_state = RxState::GetSync0;
                    self.rx_header_count = 0;
                    self.rx_count = 0;
                    self.foreign_interest.want_read = true;
                }
            } else {
                // A reset is underway; the drain discards this frame.
                self.rx_state = RxState::GetSync0;
                self.rx_header_count = 0;
                self.rx_count = 0;
            }
        }

        if self.rx_state == RxState::MessageToPeer {
            // Receives stall here until the native side takes the payload.
            if self.reset_state != ResetState::Idle || self.native.is_none() {
                // Nobody left to deliver to; drop the stuck payload.
                self.rx_state = RxState::GetSync0;
                self.rx_header_count = 0;
                self.rx_count = 0;
            } else {
                match self.native_send() {
                    IoStatus::Normal => {
                        self.rx_state = RxState::GetSync0;
                        self.rx_header_count = 0;
                        self.rx_count = 0;
                        self.foreign_interest.want_read = true;
                    }
                    IoStatus::Incomplete | IoStatus::Full => {}
                    IoStatus::Closed | IoStatus::Error => {
                        let reason = format!("channel closed by {}", self.native_peer());
                        self.request_reset(&reason);
                    }
                    IoStatus::Empty => {}
                }
            }
        }

        run_again
    }

    /// Dispatch a completely received frame. Returns false when the frame's
    /// payload is still on its way to the native endpoint and the receiver
    /// must stall.
    fn process_frame(&mut self) -> bool {
        let hdr = self.rx_header;
        debug!(
            "Process frame: {}: ctrl={:#04x}, len={}",
            self.path.display(),
            hdr.ctrl,
            hdr.payload_len
        );

        if hdr.ctrl == wire::CTRL_RESET {
            self.handle_reset(hdr);
            return true;
        }

        match self.conn_state {
            ConnState::Listen => {
                self.listen_frame(hdr);
                true
            }
            ConnState::SynSent => {
                self.syn_sent_frame(hdr);
                true
            }
            ConnState::SynRcvd => {
                self.syn_rcvd_frame(hdr);
                true
            }
            ConnState::Established => self.established_frame(hdr),
            ConnState::Closed => true,
        }
    }

    /// A RESET frame is accepted without a reply; the stale-token cases only
    /// matter in SYN_SENT, where an old session's reset may still be in
    /// flight.
    fn handle_reset(&mut self, hdr: FrameHeader) {
        match self.conn_state {
            ConnState::Listen => {
                debug!("Ignoring RESET received in LISTEN: {}", self.path.display());
            }
            ConnState::SynSent => {
                if hdr.guest_token == self.guest_token {
                    debug!("RESET received in SYN_SENT: {}", self.path.display());
                    self.close_native();
                    self.reset_cleanup();
                } else {
                    debug!(
                        "Ignoring stale RESET in SYN_SENT: {}",
                        self.path.display()
                    );
                }
            }
            ConnState::SynRcvd | ConnState::Established => {
                debug!("RESET received: {}", self.path.display());
                if hdr.guest_token != self.guest_token {
                    debug!(
                        "RESET tokens do not match current session: {}",
                        self.path.display()
                    );
                }
                self.close_native();
                self.reset_cleanup();
            }
            ConnState::Closed => {}
        }
    }

    // Host side: a SYN opens the service socket and answers SYNACK.
    fn listen_frame(&mut self, hdr: FrameHeader) {
        if hdr.ctrl != wire::CTRL_SYN {
            // Session-less traffic in LISTEN is swallowed.
            return;
        }

        if !self.open_service_socket() {
            self.request_reset("failed to open service socket");
            return;
        }

        self.guest_token = hdr.guest_token;
        self.host_token = self.tokens.token();

        let synack = FrameHeader::new(wire::CTRL_SYNACK, self.guest_token, self.host_token, 0);
        match self.send_header_now(synack) {
            IoStatus::Closed | IoStatus::Error => return,
            _ => {}
        }

        info!(
            "Transition to SYN_RCVD: {}: {}",
            self.path.display(),
            frame::session_id(self.guest_token, self.host_token)
        );
        self.conn_state = ConnState::SynRcvd;
    }

    // Guest side: a SYNACK for our SYN completes with an ACK. Only SYNACK
    // means anything here; stray ACK or DATA frames are dropped.
    fn syn_sent_frame(&mut self, hdr: FrameHeader) {
        if hdr.ctrl != wire::CTRL_SYNACK {
            return;
        }
        if hdr.guest_token != self.guest_token {
            self.request_reset("SYN_SENT received SYNACK with bad token");
            return;
        }

        self.host_token = hdr.host_token;

        let ack = FrameHeader::new(wire::CTRL_ACK, self.guest_token, self.host_token, 0);
        match self.send_header_now(ack) {
            IoStatus::Closed | IoStatus::Error => return,
            _ => {}
        }

        info!(
            "Transition to ESTABLISHED: {}: {}",
            self.path.display(),
            frame::session_id(self.guest_token, self.host_token)
        );
        self.conn_state = ConnState::Established;
        self.foreign_interest.want_read = true;
        self.foreign_interest.want_write = true;
        // Client reads resume now that the session is confirmed.
        self.native_interest.want_read = true;
    }

    // Host side: the ACK confirms both tokens and opens the data path.
    // A SYN retransmit or a DATA frame racing ahead of the ACK is dropped.
    fn syn_rcvd_frame(&mut self, hdr: FrameHeader) {
        if hdr.ctrl != wire::CTRL_ACK {
            return;
        }
        if hdr.guest_token != self.guest_token || hdr.host_token != self.host_token {
            self.request_reset("SYN_RCVD received ACK with bad token");
            return;
        }

        info!(
            "Transition to ESTABLISHED: {}: {}",
            self.path.display(),
            frame::session_id(self.guest_token, self.host_token)
        );
        self.conn_state = ConnState::Established;
        self.native_interest.want_read = true;
        self.native_interest.want_write = true;
    }

    // Stray handshake frames lingering in the stream are dropped; only a
    // DATA frame can fault the session here.
    fn established_frame(&mut self, hdr: FrameHeader) -> bool {
        if hdr.ctrl != wire::CTRL_DATA {
            return true;
        }
        if hdr.guest_token != self.guest_token
            || hdr.host_token != self.host_token
            || hdr.payload_len == 0
        {
            self.request_reset("ESTABLISHED received DATA with bad token or empty payload");
            return true;
        }

        // Push the payload into the native socket; `rx_count` now tracks
        // delivery progress.
        self.rx_count = 0;
        match self.native_send() {
            IoStatus::Normal => true,
            IoStatus::Incomplete | IoStatus::Full => {
                self.rx_state = RxState::MessageToPeer;
                false
            }
            IoStatus::Closed | IoStatus::Error => {
                let reason = format!("channel closed by {}", self.native_peer());
                self.request_reset(&reason);
                true
            }
            IoStatus::Empty => true,
        }
    }

    /// Stage a header and attempt to push it out immediately; an incomplete
    /// write is finished by the transmit engine on later writable cycles.
    fn send_header_now(&mut self, hdr: FrameHeader) -> IoStatus {
        self.tx_header_raw = hdr.encode();
        self.tx_header_count = 0;
        self.tx_payload_len = 0;
        self.tx_pending = false;

        match self.foreign_send(SendTarget::Header) {
            IoStatus::Normal => IoStatus::Normal,
            IoStatus::Incomplete | IoStatus::Full => {
                self.tx_state = TxState::SendHeader;
                IoStatus::Incomplete
            }
            status => status,
        }
    }

    /// Frame the bytes staged in the transmit buffer as one DATA frame.
    fn queue_data_frame(&mut self) {
        let payload_len = self.tx_count;
        let hdr = FrameHeader::new(
            wire::CTRL_DATA,
            self.guest_token,
            self.host_token,
            payload_len as u16,
        );
        self.tx_header_raw = hdr.encode();
        self.tx_header_count = 0;
        self.tx_payload_len = payload_len;
        self.tx_count = 0;
        self.tx_state = TxState::SendHeader;
        self.tx_pending = true;

        // No further native reads until this payload fully drains.
        self.native_interest.want_read = false;
        self.foreign_interest.want_write = true;
    }

    /// File a reset: the native side is cut off immediately so the local
    /// application sees end-of-stream, while the foreign side coordinates
    /// the RESET frame exchange.
    pub(crate) fn request_reset(&mut self, reason: &str) {
        info!(
            "Resetting channel: {}: {}: {}",
            self.path.display(),
            frame::session_id(self.guest_token, self.host_token),
            reason
        );
        self.reset_state = ResetState::Requested;
        self.foreign_interest.want_write = true;
        self.close_native();
    }

    /// Return the channel to its rest state with all substates idled, the
    /// accumulators zeroed and the tokens set to the reset sentinel.
    pub(crate) fn reset_cleanup(&mut self) {
        debug!("Channel cleanup: {}", self.path.display());

        // Keep watching the foreign endpoint both ways: the peer's RESET
        // may still arrive, and ours may still be queued.
        self.foreign_interest = Interest {
            want_read: true,
            want_write: true,
            ..Interest::default()
        };
        self.native_interest = Interest::default();

        let rest = self.rest_state();
        if self.conn_state != rest {
            info!(
                "Transition to {}: {}: {}",
                rest.name(),
                self.path.display(),
                frame::session_id(self.guest_token, self.host_token)
            );
            self.conn_state = rest;
        }

        self.rx_state = RxState::GetSync0;
        self.tx_state = TxState::SendIdle;
        self.reset_state = ResetState::Idle;
        self.rx_header_raw = [0; wire::HEADER_SIZE];
        self.rx_header_count = 0;
        self.rx_header = FrameHeader::default();
        self.rx_count = 0;
        self.tx_header_raw = [0; wire::HEADER_SIZE];
        self.tx_header_count = 0;
        self.tx_count = 0;
        self.tx_payload_len = 0;
        self.tx_pending = false;
        self.rx_buf.fill(0);
        self.tx_buf.fill(0);
        self.guest_token = wire::TOKEN_RESET;
        self.host_token = wire::TOKEN_RESET;
    }

    fn close_native(&mut self) {
        if self.native.take().is_some() {
            debug!("Close native endpoint: {}", self.path.display());
        }
        self.native_interest = Interest::default();
    }

    /// Tear down both endpoints after the foreign stream closed or errored.
    /// A closed foreign endpoint means the channel carries no session.
    fn close_foreign(&mut self) {
        self.foreign = None;
        self.foreign_interest = Interest::default();
        self.close_native();
        if self.conn_state != ConnState::Closed {
            info!(
                "Transition to CLOSED: {}: {}",
                self.path.display(),
                frame::session_id(self.guest_token, self.host_token)
            );
            self.conn_state = ConnState::Closed;
        }
        self.guest_token = wire::TOKEN_RESET;
        self.host_token = wire::TOKEN_RESET;
    }

    fn foreign_recv(&mut self, target: RecvTarget) -> IoStatus {
        let payload_len = self.rx_header.payload_len as usize;
        let res = {
            let stream = match self.foreign.as_mut() {
                Some(s) => s,
                None => return IoStatus::Closed,
            };
            let buf: &mut [u8] = match target {
                RecvTarget::Sync0 => &mut self.rx_header_raw[0..1],
                RecvTarget::Sync1 => &mut self.rx_header_raw[1..2],
                RecvTarget::Header => &mut self.rx_header_raw[self.rx_header_count..],
                RecvTarget::Payload => &mut self.rx_buf[self.rx_count..payload_len],
            };
            read_stream(stream, buf)
        };

        match res {
            RawIo::Done => {
                match target {
                    RecvTarget::Header => self.rx_header_count = wire::HEADER_SIZE,
                    RecvTarget::Payload => self.rx_count = payload_len,
                    _ => {}
                }
                IoStatus::Normal
            }
            RawIo::Partial(n) => {
                match target {
                    RecvTarget::Header => self.rx_header_count += n,
                    RecvTarget::Payload => self.rx_count += n,
                    _ => {}
                }
                self.foreign_interest.want_read = true;
                self.foreign_interest.readable = false;
                IoStatus::Incomplete
            }
            RawIo::WouldBlock => {
                self.foreign_interest.want_read = true;
                self.foreign_interest.readable = false;
                IoStatus::Empty
            }
            RawIo::Closed => {
                info!(
                    "Channel endpoint closed during recv: {}",
                    self.path.display()
                );
                self.close_foreign();
                IoStatus::Closed
            }
            RawIo::Err(err) => {
                warn!(
                    "Channel endpoint recv error: {}: {}",
                    self.path.display(),
                    err
                );
                self.close_foreign();
                IoStatus::Error
            }
        }
    }

    fn foreign_send(&mut self, target: SendTarget) -> IoStatus {
        let res = {
            let stream = match self.foreign.as_mut() {
                Some(s) => s,
                None => return IoStatus::Closed,
            };
            let buf: &[u8] = match target {
                SendTarget::Header => &self.tx_header_raw[self.tx_header_count..],
                SendTarget::Payload => &self.tx_buf[self.tx_count..self.tx_payload_len],
            };
            write_stream(stream, buf)
        };

        match res {
            RawIo::Done => {
                match target {
                    SendTarget::Header => self.tx_header_count = wire::HEADER_SIZE,
                    SendTarget::Payload => self.tx_count = self.tx_payload_len,
                }
                IoStatus::Normal
            }
            RawIo::Partial(n) => {
                match target {
                    SendTarget::Header => self.tx_header_count += n,
                    SendTarget::Payload => self.tx_count += n,
                }
                self.foreign_interest.want_write = true;
                self.foreign_interest.writable = false;
                IoStatus::Incomplete
            }
            RawIo::WouldBlock => {
                self.foreign_interest.want_write = true;
                self.foreign_interest.writable = false;
                IoStatus::Full
            }
            RawIo::Closed => {
                info!(
                    "Channel endpoint closed during send: {}",
                    self.path.display()
                );
                self.close_foreign();
                IoStatus::Closed
            }
            RawIo::Err(err) => {
                warn!(
                    "Channel endpoint send error: {}: {}",
                    self.path.display(),
                    err
                );
                self.close_foreign();
                IoStatus::Error
            }
        }
    }

    /// Read whatever the native socket has, up to one frame's worth, into
    /// the transmit staging buffer.
    fn native_recv(&mut self) -> IoStatus {
        let res = {
            let stream = match self.native.as_mut() {
                Some(s) => s,
                None => {
                    debug!(
                        "Native recv on closed endpoint: {}",
                        self.path.display()
                    );
                    return IoStatus::Closed;
                }
            };
            match stream.read(&mut self.tx_buf[..wire::MAX_PAYLOAD_SIZE]) {
                Ok(0) => RawIo::Closed,
                Ok(n) => RawIo::Partial(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => RawIo::WouldBlock,
                Err(e) => RawIo::Err(e),
            }
        };

        match res {
            RawIo::Partial(n) => {
                self.tx_count = n;
                self.native_interest.want_read = false;
                self.native_interest.readable = false;
                self.foreign_interest.want_write = true;
                IoStatus::Normal
            }
            RawIo::WouldBlock => {
                self.native_interest.want_read = true;
                self.native_interest.readable = false;
                IoStatus::Empty
            }
            RawIo::Closed => {
                info!(
                    "Native endpoint closed during recv: {}",
                    self.path.display()
                );
                self.close_native();
                IoStatus::Closed
            }
            RawIo::Err(err) => {
                warn!(
                    "Native endpoint recv error: {}: {}",
                    self.path.display(),
                    err
                );
                self.close_native();
                IoStatus::Error
            }
            RawIo::Done => IoStatus::Normal,
        }
    }

    /// Deliver the received payload to the native socket, continuing from
    /// wherever the last partial write stopped.
    fn native_send(&mut self) -> IoStatus {
        let payload_len = self.rx_header.payload_len as usize;
        let res = {
            let stream = match self.native.as_mut() {
                Some(s) => s,
                None => {
                    debug!(
                        "Native send on closed endpoint: {}",
                        self.path.display()
                    );
                    return IoStatus::Closed;
                }
            };
            write_stream(stream, &self.rx_buf[self.rx_count..payload_len])
        };

        match res {
            RawIo::Done => {
                self.rx_count = payload_len;
                IoStatus::Normal
            }
            RawIo::Partial(n) => {
                self.rx_count += n;
                self.native_interest.want_write = true;
                self.native_interest.writable = false;
                IoStatus::Incomplete
            }
            RawIo::WouldBlock => {
                self.native_interest.want_write = true;
                self.native_interest.writable = false;
                IoStatus::Full
            }
            RawIo::Closed => {
                info!(
                    "Native endpoint closed during send: {}",
                    self.path.display()
                );
                self.close_native();
                IoStatus::Closed
            }
            RawIo::Err(err) => {
                warn!(
                    "Native endpoint send error: {}: {}",
                    self.path.display(),
                    err
                );
                self.close_native();
                IoStatus::Error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::sleep;
    use std::time::Duration;

    // The scripted peer stands in for the remote proxy on the far end of
    // the byte stream; the channel's end is nonblocking, the peer's end
    // blocks with a timeout so broken tests fail instead of hanging.
    fn stream_pair() -> (UnixStream, UnixStream) {
        let (ours, peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        (ours, peer)
    }

    fn host_channel(service_port: u16) -> (Channel, UnixStream) {
        let (ours, peer) = stream_pair();
        let mut ch = Channel::with_role(
            PathBuf::from("guest1/chan0"),
            Role::Host {
                service_port,
                guest_dir: PathBuf::from("guest1"),
            },
        );
        ch.tokens = TokenSource::with_seed(99);
        ch.foreign = Some(ForeignStream::Socket(ours));
        ch.reset_cleanup();
        assert_eq!(ch.conn_state(), ConnState::Listen);
        (ch, peer)
    }

    fn guest_channel(timeout_ticks: u32) -> (Channel, UnixStream) {
        let (ours, peer) = stream_pair();
        let mut ch = Channel::with_role(
            PathBuf::from("chan0"),
            Role::Guest {
                timeout_ticks,
                ticks_left: 0,
            },
        );
        ch.tokens = TokenSource::with_seed(7);
        ch.foreign = Some(ForeignStream::Socket(ours));
        (ch, peer)
    }

    // Client/service TCP socket pair; the far end stays with the test.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let far = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        far.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let (near, _) = listener.accept().unwrap();
        near.set_nonblocking(true).unwrap();
        (far, near)
    }

    fn drive(ch: &mut Channel) {
        ch.foreign_interest.readable = true;
        ch.foreign_interest.writable = true;
        ch.native_interest.readable = true;
        ch.native_interest.writable = true;
        ch.run_protocol();
    }

    fn write_frame(peer: &mut UnixStream, hdr: FrameHeader, payload: &[u8]) {
        assert_eq!(hdr.payload_len as usize, payload.len());
        peer.write_all(&hdr.encode()).unwrap();
        peer.write_all(payload).unwrap();
    }

    fn read_frame(peer: &mut UnixStream) -> (FrameHeader, Vec<u8>) {
        let mut raw = [0u8; wire::HEADER_SIZE];
        peer.read_exact(&mut raw).unwrap();
        let hdr = FrameHeader::decode(&raw).unwrap();
        let mut payload = vec![0u8; hdr.payload_len as usize];
        peer.read_exact(&mut payload).unwrap();
        (hdr, payload)
    }

    fn assert_no_frame(peer: &mut UnixStream) {
        peer.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        match peer.read(&mut buf) {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            other => panic!("expected silent peer, got {:?}", other),
        }
        peer.set_nonblocking(false).unwrap();
    }

    // Host side walks LISTEN -> SYN_RCVD -> ESTABLISHED; returns the
    // session tokens and the accepted service-side socket.
    fn establish_host(ch: &mut Channel, peer: &mut UnixStream, service: &TcpListener) -> (u32, u32, TcpStream) {
        let guest_token = 0x4142_4344;
        write_frame(
            peer,
            FrameHeader::new(wire::CTRL_SYN, guest_token, wire::TOKEN_PENDING, 0),
            &[],
        );
        drive(ch);

        let (synack, _) = read_frame(peer);
        assert_eq!(synack.ctrl, wire::CTRL_SYNACK);
        assert_eq!(synack.guest_token, guest_token);
        assert_eq!(ch.conn_state(), ConnState::SynRcvd);

        let (service_conn, _) = service.accept().unwrap();
        service_conn
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        write_frame(
            peer,
            FrameHeader::new(wire::CTRL_ACK, guest_token, synack.host_token, 0),
            &[],
        );
        drive(ch);
        assert_eq!(ch.conn_state(), ConnState::Established);

        (guest_token, synack.host_token, service_conn)
    }

    #[test]
    fn host_establishes_through_garbage_prefix() {
        let service = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut ch, mut peer) = host_channel(service.local_addr().unwrap().port());

        // Pre-session junk, including stray sync0 candidates, must all be
        // consumed before the real SYN.
        peer.write_all(&[0u8; 512]).unwrap();
        peer.write_all(b"xyzV").unwrap();
        let (g, h, _service_conn) = establish_host(&mut ch, &mut peer, &service);
        assert_eq!(ch.session_tokens(), (g, h));
    }

    #[test]
    fn host_relays_data_both_ways() {
        let service = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut ch, mut peer) = host_channel(service.local_addr().unwrap().port());
        let (g, h, mut service_conn) = establish_host(&mut ch, &mut peer, &service);

        // Guest -> service.
        write_frame(
            &mut peer,
            FrameHeader::new(wire::CTRL_DATA, g, h, 5),
            b"hello",
        );
        drive(&mut ch);
        let mut buf = [0u8; 5];
        service_conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // Service -> guest.
        service_conn.write_all(b"world").unwrap();
        sleep(Duration::from_millis(30));
        drive(&mut ch); // stage the payload
        drive(&mut ch); // transmit the frame
        let (hdr, payload) = read_frame(&mut peer);
        assert_eq!(hdr.ctrl, wire::CTRL_DATA);
        assert_eq!((hdr.guest_token, hdr.host_token), (g, h));
        assert_eq!(payload, b"world");
    }

    #[test]
    fn host_forwards_max_sized_payload() {
        let service = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut ch, mut peer) = host_channel(service.local_addr().unwrap().port());
        let (g, h, mut service_conn) = establish_host(&mut ch, &mut peer, &service);
        service_conn.set_nonblocking(true).unwrap();

        let payload: Vec<u8> = (0..wire::MAX_PAYLOAD_SIZE).map(|i| i as u8).collect();
        write_frame(
            &mut peer,
            FrameHeader::new(wire::CTRL_DATA, g, h, wire::MAX_PAYLOAD_SIZE as u16),
            &payload,
        );

        // The TCP socket will not take 64 KiB in one write; keep driving
        // the engine while the service side drains.
        let mut got = Vec::new();
        let mut buf = [0u8; 8192];
        for _ in 0..10_000 {
            drive(&mut ch);
            match service_conn.read(&mut buf) {
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("service read failed: {}", e),
            }
            if got.len() == payload.len() {
                break;
            }
        }
        assert_eq!(got, payload);
        assert_eq!(ch.conn_state(), ConnState::Established);
    }

    #[test]
    fn host_listen_ignores_sessionless_frames() {
        let service = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut ch, mut peer) = host_channel(service.local_addr().unwrap().port());

        write_frame(&mut peer, FrameHeader::new(wire::CTRL_ACK, 1, 2, 0), &[]);
        write_frame(&mut peer, FrameHeader::new(wire::CTRL_DATA, 1, 2, 3), b"abc");
        write_frame(&mut peer, FrameHeader::new(wire::CTRL_RESET, 1, 2, 0), &[]);
        // One frame is consumed per engine pass.
        for _ in 0..3 {
            drive(&mut ch);
        }

        assert_eq!(ch.conn_state(), ConnState::Listen);
        assert_no_frame(&mut peer);
    }

    #[test]
    fn syn_rcvd_ignores_stray_syn_and_data() {
        let service = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut ch, mut peer) = host_channel(service.local_addr().unwrap().port());

        let guest_token = 0x4142_4344;
        write_frame(
            &mut peer,
            FrameHeader::new(wire::CTRL_SYN, guest_token, wire::TOKEN_PENDING, 0),
            &[],
        );
        drive(&mut ch);
        let (synack, _) = read_frame(&mut peer);
        assert_eq!(ch.conn_state(), ConnState::SynRcvd);
        let (_service_conn, _) = service.accept().unwrap();

        // A SYN retransmit and a DATA frame racing ahead of the ACK must
        // not cost the pending session.
        write_frame(
            &mut peer,
            FrameHeader::new(wire::CTRL_SYN, guest_token, wire::TOKEN_PENDING, 0),
            &[],
        );
        write_frame(
            &mut peer,
            FrameHeader::new(wire::CTRL_DATA, guest_token, synack.host_token, 5),
            b"early",
        );
        for _ in 0..2 {
            drive(&mut ch);
        }
        assert_eq!(ch.conn_state(), ConnState::SynRcvd);
        assert_no_frame(&mut peer);

        // The real ACK still completes the handshake.
        write_frame(
            &mut peer,
            FrameHeader::new(wire::CTRL_ACK, guest_token, synack.host_token, 0),
            &[],
        );
        drive(&mut ch);
        assert_eq!(ch.conn_state(), ConnState::Established);
    }

    #[test]
    fn established_ignores_stray_handshake_frames() {
        let service = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut ch, mut peer) = host_channel(service.local_addr().unwrap().port());
        let (g, h, mut service_conn) = establish_host(&mut ch, &mut peer, &service);

        write_frame(&mut peer, FrameHeader::new(wire::CTRL_SYN, 1, 2, 0), &[]);
        write_frame(&mut peer, FrameHeader::new(wire::CTRL_SYNACK, g, h, 0), &[]);
        write_frame(&mut peer, FrameHeader::new(wire::CTRL_ACK, g, h, 0), &[]);
        for _ in 0..3 {
            drive(&mut ch);
        }
        assert_eq!(ch.conn_state(), ConnState::Established);
        assert_eq!(ch.session_tokens(), (g, h));
        assert_no_frame(&mut peer);

        // The session still carries data afterwards.
        write_frame(&mut peer, FrameHeader::new(wire::CTRL_DATA, g, h, 2), b"ok");
        drive(&mut ch);
        let mut buf = [0u8; 2];
        service_conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn host_resets_on_bad_data_tokens() {
        let service = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut ch, mut peer) = host_channel(service.local_addr().unwrap().port());
        let (g, h, mut service_conn) = establish_host(&mut ch, &mut peer, &service);

        write_frame(
            &mut peer,
            FrameHeader::new(wire::CTRL_DATA, g ^ 1, h, 4),
            b"evil",
        );
        drive(&mut ch);

        let (reset, _) = read_frame(&mut peer);
        assert_eq!(reset.ctrl, wire::CTRL_RESET);
        assert_eq!((reset.guest_token, reset.host_token), (g, h));
        assert_eq!(ch.conn_state(), ConnState::Listen);
        assert_eq!(ch.session_tokens(), (wire::TOKEN_RESET, wire::TOKEN_RESET));

        // The service side sees end-of-stream right away.
        let mut buf = [0u8; 1];
        assert_eq!(service_conn.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn host_rejects_zero_length_data() {
        let service = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut ch, mut peer) = host_channel(service.local_addr().unwrap().port());
        let (g, h, _service_conn) = establish_host(&mut ch, &mut peer, &service);

        write_frame(&mut peer, FrameHeader::new(wire::CTRL_DATA, g, h, 0), &[]);
        drive(&mut ch);

        let (reset, _) = read_frame(&mut peer);
        assert_eq!(reset.ctrl, wire::CTRL_RESET);
        assert_eq!(ch.conn_state(), ConnState::Listen);
    }

    #[test]
    fn host_resets_on_version_mismatch() {
        let service = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut ch, mut peer) = host_channel(service.local_addr().unwrap().port());
        let (_, _, _service_conn) = establish_host(&mut ch, &mut peer, &service);

        let mut raw = FrameHeader::new(wire::CTRL_DATA, 1, 2, 0).encode();
        raw[2] = b'2';
        peer.write_all(&raw).unwrap();
        drive(&mut ch);

        let (reset, _) = read_frame(&mut peer);
        assert_eq!(reset.ctrl, wire::CTRL_RESET);
        assert_eq!(ch.conn_state(), ConnState::Listen);
    }

    #[test]
    fn host_accepts_reset_without_replying() {
        let service = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut ch, mut peer) = host_channel(service.local_addr().unwrap().port());
        let (g, h, mut service_conn) = establish_host(&mut ch, &mut peer, &service);

        write_frame(&mut peer, FrameHeader::new(wire::CTRL_RESET, g, h, 0), &[]);
        drive(&mut ch);

        assert_eq!(ch.conn_state(), ConnState::Listen);
        assert_eq!(ch.session_tokens(), (wire::TOKEN_RESET, wire::TOKEN_RESET));
        assert_no_frame(&mut peer);
        let mut buf = [0u8; 1];
        assert_eq!(service_conn.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn host_resets_when_service_is_unreachable() {
        // Grab a port and close it again, so the connect must fail.
        let dead_port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let (mut ch, mut peer) = host_channel(dead_port);

        write_frame(
            &mut peer,
            FrameHeader::new(wire::CTRL_SYN, 0x5151_5151, wire::TOKEN_PENDING, 0),
            &[],
        );
        drive(&mut ch);

        let (reset, _) = read_frame(&mut peer);
        assert_eq!(reset.ctrl, wire::CTRL_RESET);
        assert_eq!(ch.conn_state(), ConnState::Listen);
    }

    // Guest side runs start_connection and reads back the priming bytes,
    // the SYN, and the session tokens.
    fn start_guest(ch: &mut Channel, peer: &mut UnixStream) -> (TcpStream, u32) {
        let (client_app, client_sock) = tcp_pair();
        assert!(ch.start_connection(client_sock).is_ok());
        assert_eq!(ch.conn_state(), ConnState::SynSent);

        let mut prime = vec![0u8; wire::MAX_PAYLOAD_SIZE];
        peer.read_exact(&mut prime).unwrap();
        assert!(prime.iter().all(|b| *b == wire::SYNC0));

        let (syn, _) = read_frame(peer);
        assert_eq!(syn.ctrl, wire::CTRL_SYN);
        assert_eq!(syn.host_token, wire::TOKEN_PENDING);

        (client_app, syn.guest_token)
    }

    fn establish_guest(ch: &mut Channel, peer: &mut UnixStream) -> (TcpStream, u32, u32) {
        let (client_app, g) = start_guest(ch, peer);
        let h = 0x4831_3233;
        write_frame(peer, FrameHeader::new(wire::CTRL_SYNACK, g, h, 0), &[]);
        drive(ch);

        let (ack, _) = read_frame(peer);
        assert_eq!(ack.ctrl, wire::CTRL_ACK);
        assert_eq!((ack.guest_token, ack.host_token), (g, h));
        assert_eq!(ch.conn_state(), ConnState::Established);

        (client_app, g, h)
    }

    #[test]
    fn guest_start_connection_primes_and_sends_syn() {
        let (mut ch, mut peer) = guest_channel(30);
        let (_client_app, _g) = start_guest(&mut ch, &mut peer);
    }

    #[test]
    fn guest_completes_handshake_and_relays_data() {
        let (mut ch, mut peer) = guest_channel(30);
        let (mut client_app, g, h) = establish_guest(&mut ch, &mut peer);

        // Client -> host.
        client_app.write_all(b"ping").unwrap();
        sleep(Duration::from_millis(30));
        drive(&mut ch); // stage
        drive(&mut ch); // transmit
        let (hdr, payload) = read_frame(&mut peer);
        assert_eq!(hdr.ctrl, wire::CTRL_DATA);
        assert_eq!((hdr.guest_token, hdr.host_token), (g, h));
        assert_eq!(payload, b"ping");

        // Host -> client.
        write_frame(&mut peer, FrameHeader::new(wire::CTRL_DATA, g, h, 4), b"pong");
        drive(&mut ch);
        let mut buf = [0u8; 4];
        client_app.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn guest_survives_stale_traffic_before_start() {
        let (mut ch, mut peer) = guest_channel(30);

        // Garbage plus a stray RESET from a dead session sit in the stream
        // before the next client shows up.
        peer.write_all(&[7u8; 1024]).unwrap();
        write_frame(
            &mut peer,
            FrameHeader::new(wire::CTRL_RESET, 0x2a2a_2a2a, 0x2b2b_2b2b, 0),
            &[],
        );

        let (_client_app, g, h) = establish_guest(&mut ch, &mut peer);
        assert_eq!(ch.session_tokens(), (g, h));
    }

    #[test]
    fn guest_ignores_stale_reset_in_syn_sent() {
        let (mut ch, mut peer) = guest_channel(30);
        let (_client_app, g) = start_guest(&mut ch, &mut peer);

        write_frame(
            &mut peer,
            FrameHeader::new(wire::CTRL_RESET, g ^ 0xff, 0x2b2b_2b2b, 0),
            &[],
        );
        drive(&mut ch);

        assert_eq!(ch.conn_state(), ConnState::SynSent);
        assert_no_frame(&mut peer);
    }

    #[test]
    fn syn_sent_ignores_stray_ack_and_data() {
        let (mut ch, mut peer) = guest_channel(30);
        let (_client_app, g) = start_guest(&mut ch, &mut peer);

        // Leftovers from an old session must not disturb the pending SYN.
        write_frame(&mut peer, FrameHeader::new(wire::CTRL_ACK, 1, 2, 0), &[]);
        write_frame(&mut peer, FrameHeader::new(wire::CTRL_DATA, 1, 2, 5), b"stale");
        for _ in 0..2 {
            drive(&mut ch);
        }
        assert_eq!(ch.conn_state(), ConnState::SynSent);
        assert_no_frame(&mut peer);

        // The SYNACK still completes the handshake.
        let h = 0x4831_3233;
        write_frame(&mut peer, FrameHeader::new(wire::CTRL_SYNACK, g, h, 0), &[]);
        drive(&mut ch);
        let (ack, _) = read_frame(&mut peer);
        assert_eq!(ack.ctrl, wire::CTRL_ACK);
        assert_eq!(ch.conn_state(), ConnState::Established);
    }

    #[test]
    fn guest_accepts_matching_reset_in_syn_sent() {
        let (mut ch, mut peer) = guest_channel(30);
        let (mut client_app, g) = start_guest(&mut ch, &mut peer);

        write_frame(
            &mut peer,
            FrameHeader::new(wire::CTRL_RESET, g, wire::TOKEN_PENDING, 0),
            &[],
        );
        drive(&mut ch);

        assert_eq!(ch.conn_state(), ConnState::Closed);
        assert_eq!(ch.session_tokens(), (wire::TOKEN_RESET, wire::TOKEN_RESET));
        assert_no_frame(&mut peer);
        let mut buf = [0u8; 1];
        assert_eq!(client_app.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn guest_resets_on_wrong_synack_token() {
        let (mut ch, mut peer) = guest_channel(30);
        let (mut client_app, g) = start_guest(&mut ch, &mut peer);

        write_frame(
            &mut peer,
            FrameHeader::new(wire::CTRL_SYNACK, g ^ 1, 0x4831_3233, 0),
            &[],
        );
        drive(&mut ch);

        let (reset, _) = read_frame(&mut peer);
        assert_eq!(reset.ctrl, wire::CTRL_RESET);
        assert_eq!(ch.conn_state(), ConnState::Closed);
        let mut buf = [0u8; 1];
        assert_eq!(client_app.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn guest_times_out_unanswered_syn() {
        let (mut ch, mut peer) = guest_channel(2);
        let (mut client_app, _g) = start_guest(&mut ch, &mut peer);

        ch.clock_tick();
        assert_eq!(ch.conn_state(), ConnState::SynSent);

        ch.clock_tick();
        assert_eq!(ch.conn_state(), ConnState::Closed);
        assert_eq!(ch.session_tokens(), (wire::TOKEN_RESET, wire::TOKEN_RESET));

        let mut buf = [0u8; 1];
        assert_eq!(client_app.read(&mut buf).unwrap(), 0);
        // The timeout quietly abandons the attempt; no RESET goes out.
        assert_no_frame(&mut peer);
    }

    #[test]
    fn guest_resets_when_client_disappears() {
        let (mut ch, mut peer) = guest_channel(30);
        let (client_app, g, h) = establish_guest(&mut ch, &mut peer);

        drop(client_app);
        sleep(Duration::from_millis(30));
        drive(&mut ch);

        let (reset, _) = read_frame(&mut peer);
        assert_eq!(reset.ctrl, wire::CTRL_RESET);
        assert_eq!((reset.guest_token, reset.host_token), (g, h));
        assert_eq!(ch.conn_state(), ConnState::Closed);
    }
}
