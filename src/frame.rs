// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire framing: the fixed 14-byte frame header, its codec, and the
//! printable session tokens carried by every frame.
//!
//! All multi-byte fields travel in network byte order. The header is
//! prefixed by a two-byte sync pattern and a version byte so that a
//! receiver can re-align itself on a raw byte stream that may contain
//! garbage left over from an earlier session.

use byteorder::{BigEndian, ByteOrder};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod defs {
    //! Wire-level constants.

    /// First sync byte of every frame.
    pub const SYNC0: u8 = b'V';
    /// Second sync byte of every frame.
    pub const SYNC1: u8 = b'S';
    /// Protocol version byte (an ASCII one).
    pub const VERSION: u8 = b'1';

    /// Session open, guest to host.
    pub const CTRL_SYN: u8 = b'A';
    /// Final step of the session handshake, guest to host.
    pub const CTRL_ACK: u8 = b'B';
    /// Session accept, host to guest.
    pub const CTRL_SYNACK: u8 = b'C';
    /// Application payload carrier; the only frame with a payload.
    pub const CTRL_DATA: u8 = b'D';
    /// Session teardown, either direction.
    pub const CTRL_RESET: u8 = b'H';

    /// Encoded size of the frame header.
    pub const HEADER_SIZE: usize = 14;
    /// Largest payload a single DATA frame can carry.
    pub const MAX_PAYLOAD_SIZE: usize = 65_535;
    /// Size of the per-direction payload buffers.
    pub const PAYLOAD_BUF_SIZE: usize = 65_536;

    /// Token value of a channel that has never carried a session ("!!!!").
    /// Diagnostic only; never sent as a negotiated value.
    pub const TOKEN_UNSET: u32 = 0x2121_2121;
    /// Token value of a channel cleaned up after a reset ("RRRR").
    /// Diagnostic only; never sent as a negotiated value.
    pub const TOKEN_RESET: u32 = 0x5252_5252;
    /// Placeholder host token in a guest's SYN ("????"); the host's real
    /// token arrives in the SYNACK.
    pub const TOKEN_PENDING: u32 = 0x3F3F_3F3F;
}

#[derive(Debug, PartialEq)]
pub enum Error {
    /// Header did not start with the sync pattern.
    BadSync,
    /// Header carried an unsupported version byte.
    BadVersion(u8),
}
type Result<T> = std::result::Result<T, Error>;

/// Decoded frame header. The sync pattern and version byte are implied:
/// `encode` always emits them, `decode` refuses input without them.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameHeader {
    pub ctrl: u8,
    pub guest_token: u32,
    pub host_token: u32,
    pub payload_len: u16,
}

impl FrameHeader {
    pub fn new(ctrl: u8, guest_token: u32, host_token: u32, payload_len: u16) -> Self {
        Self {
            ctrl,
            guest_token,
            host_token,
            payload_len,
        }
    }

    pub fn encode(&self) -> [u8; defs::HEADER_SIZE] {
        let mut raw = [0u8; defs::HEADER_SIZE];
        raw[0] = defs::SYNC0;
        raw[1] = defs::SYNC1;
        raw[2] = defs::VERSION;
        raw[3] = self.ctrl;
        BigEndian::write_u32(&mut raw[4..8], self.guest_token);
        BigEndian::write_u32(&mut raw[8..12], self.host_token);
        BigEndian::write_u16(&mut raw[12..14], self.payload_len);
        raw
    }

    /// Decode a fully accumulated header, validating sync and version.
    pub fn decode(raw: &[u8; defs::HEADER_SIZE]) -> Result<Self> {
        if raw[0] != defs::SYNC0 || raw[1] != defs::SYNC1 {
            return Err(Error::BadSync);
        }
        if raw[2] != defs::VERSION {
            return Err(Error::BadVersion(raw[2]));
        }
        Ok(Self {
            ctrl: raw[3],
            guest_token: BigEndian::read_u32(&raw[4..8]),
            host_token: BigEndian::read_u32(&raw[8..12]),
            payload_len: BigEndian::read_u16(&raw[12..14]),
        })
    }
}

/// Source of session tokens: four independent printable bytes per token,
/// so tokens survive accidental C-string handling and read legibly in logs.
pub struct TokenSource {
    rng: SmallRng,
}

impl TokenSource {
    /// A source seeded from the wall clock.
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        Self::with_seed(seed)
    }

    /// A source with a fixed seed, for repeatable token patterns.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    // 0..93 + 33 = 33..126. That's '!' to '~'.
    fn printable_byte(&mut self) -> u8 {
        (self.rng.gen_range(0..94u32) + 33) as u8
    }

    pub fn token(&mut self) -> u32 {
        u32::from(self.printable_byte()) << 24
            | u32::from(self.printable_byte()) << 16
            | u32::from(self.printable_byte()) << 8
            | u32::from(self.printable_byte())
    }
}

impl Default for TokenSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the `[g:GGGG,h:HHHH]` session id used in log lines.
pub fn session_id(guest_token: u32, host_token: u32) -> String {
    let g = guest_token.to_be_bytes();
    let h = host_token.to_be_bytes();
    format!(
        "[g:{},h:{}]",
        String::from_utf8_lossy(&g),
        String::from_utf8_lossy(&h)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let cases = [
            FrameHeader::new(defs::CTRL_SYN, 0x6162_6364, defs::TOKEN_PENDING, 0),
            FrameHeader::new(defs::CTRL_DATA, 0x2122_2324, 0x7e7d_7c7b, 1),
            FrameHeader::new(defs::CTRL_DATA, 1, 2, defs::MAX_PAYLOAD_SIZE as u16),
            FrameHeader::new(defs::CTRL_RESET, defs::TOKEN_RESET, defs::TOKEN_RESET, 0),
        ];
        for hdr in cases.iter() {
            let raw = hdr.encode();
            assert_eq!(raw[0], defs::SYNC0);
            assert_eq!(raw[1], defs::SYNC1);
            assert_eq!(raw[2], defs::VERSION);
            assert_eq!(FrameHeader::decode(&raw).unwrap(), *hdr);
        }
    }

    #[test]
    fn decode_rejects_bad_sync() {
        let mut raw = FrameHeader::new(defs::CTRL_SYN, 0, 0, 0).encode();
        raw[1] = b'X';
        assert_eq!(FrameHeader::decode(&raw), Err(Error::BadSync));
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut raw = FrameHeader::new(defs::CTRL_SYN, 0, 0, 0).encode();
        raw[2] = b'2';
        assert_eq!(FrameHeader::decode(&raw), Err(Error::BadVersion(b'2')));
    }

    #[test]
    fn tokens_are_printable() {
        let mut src = TokenSource::with_seed(7);
        for _ in 0..1000 {
            for b in src.token().to_be_bytes().iter() {
                assert!(*b >= b'!' && *b <= b'~', "byte {} out of range", b);
            }
        }
    }

    #[test]
    fn fixed_seed_is_repeatable() {
        let mut a = TokenSource::with_seed(42);
        let mut b = TokenSource::with_seed(42);
        for _ in 0..16 {
            assert_eq!(a.token(), b.token());
        }
    }

    #[test]
    fn session_id_renders_token_bytes() {
        assert_eq!(
            session_id(defs::TOKEN_UNSET, defs::TOKEN_PENDING),
            "[g:!!!!,h:????]"
        );
        assert_eq!(
            session_id(defs::TOKEN_RESET, defs::TOKEN_RESET),
            "[g:RRRR,h:RRRR]"
        );
    }
}
