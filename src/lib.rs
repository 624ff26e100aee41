// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bidirectional TCP tunnel between a virtualization guest and its host,
//! multiplexed over pre-existing byte-stream channels (virtio-serial character
//! devices on the guest side, Unix domain sockets on the host side).
//!
//! Two cooperating proxies share one framed wire protocol:
//! - the *guest proxy* accepts TCP connections from guest-local clients and
//!   relays them over a serial channel to its host peer;
//! - the *host proxy* accepts framed sessions arriving on those channels and
//!   relays them to a TCP service on the host's loopback.
//!
//! The crate is layered bottom-up:
//! - `frame` - the fixed 14-byte frame header codec and session tokens;
//! - `channel` - the per-channel protocol engine (receive resynchronization,
//!   transmit drain, frame dispatch, reset coordination) plus the guest and
//!   host role bindings;
//! - `mgr` - endpoint discovery by directory enumeration and the per-role
//!   channel registries;
//! - `poller` - the single poll(2)-based readiness multiplexer and the
//!   one-second clock driver.
//!
//! Everything runs on one thread; channels cooperate through the readiness
//! loop and every data-path socket operation is nonblocking.

pub mod channel;
pub mod frame;
pub mod logger;
pub mod mgr;
pub mod poller;

pub use channel::Channel;
pub use mgr::guest::GuestManager;
pub use mgr::host::HostManager;
