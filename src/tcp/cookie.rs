// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Implements the SYN cookie scheme which lets a listener accept connections without keeping
//! half-open state.
//!
//! The initial sequence number of a stateless `SYN-ACK` is a keyed token over the flow's
//! 4-tuple, the client's sequence number and a coarse timestamp. When the client's `ACK` comes
//! back, recomputing the token both authenticates the flow and recovers the small payload
//! (an MSS class) folded into it. Anyone who has not seen the listener's nonces has about a
//! 2^-24 chance per attempt of forging a token that validates.

use std::num::Wrapping;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::stack::EndpointId;

// The length, in bits, of the timestamp in the SYN cookie.
const TS_LEN: u32 = 8;

// A mask for timestamp values (i.e., TS_LEN bits).
const TS_MASK: u32 = (1 << TS_LEN) - 1;

// The offset, in bits, of the timestamp in the SYN cookie.
const TS_OFFSET: u32 = 24;

// The mask for hash values (i.e., TS_OFFSET bits).
const HASH_MASK: u32 = (1 << TS_OFFSET) - 1;

// The maximum allowed difference between a received cookie timestamp and the current timestamp.
// If the difference is greater than MAX_TS_DIFF, the cookie is expired.
const MAX_TS_DIFF: u32 = 2;

// Nonces are as long as one input block of the hash, so a key-recovery attempt cannot profit
// from block boundaries.
const NONCE_LEN: usize = 64;

/// The possible MSS values encoded in a SYN cookie with two bits.
pub const MSS_TABLE: [u16; 4] = [536, 1300, 1440, 1460];

/// Returns the index of the largest [`MSS_TABLE`] entry not exceeding `mss`.
///
/// The table starts at the protocol minimum, so every sane `mss` has an entry; anything below
/// falls back to index 0.
///
/// [`MSS_TABLE`]: constant.MSS_TABLE.html
pub fn encode_mss(mss: u16) -> u32 {
    for i in (1..MSS_TABLE.len()).rev() {
        if mss >= MSS_TABLE[i] {
            return i as u32;
        }
    }
    0
}

// An 8-bit timestamp with a granularity of 64 seconds.
fn time_stamp() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (secs >> 6) as u32 & TS_MASK
}

/// Creates and validates the SYN cookies of one listener.
///
/// The two nonces are drawn once at construction and never rotate; their lifetime is the
/// listener's lifetime. The hashing engine is shared by every thread working for the listener,
/// hence the mutex around it.
pub struct CookieCodec {
    nonce: [[u8; NONCE_LEN]; 2],
    hasher: Mutex<Sha1>,
}

impl CookieCodec {
    /// Creates a codec with fresh nonces from the system entropy source.
    pub fn new() -> Self {
        let mut nonce = [[0u8; NONCE_LEN]; 2];
        OsRng.fill_bytes(&mut nonce[0]);
        OsRng.fill_bytes(&mut nonce[1]);
        CookieCodec {
            nonce,
            hasher: Mutex::new(Sha1::new()),
        }
    }

    // Calculates the keyed hash for the given id, timestamp and nonce index. The hash is used
    // to create and validate cookies.
    fn cookie_hash(&self, id: &EndpointId, ts: u32, nonce_index: usize) -> u32 {
        // Fixed-size prefix: the two ports and the timestamp.
        let mut payload = [0u8; 8];
        BigEndian::write_u16(&mut payload[0..], id.local_port);
        BigEndian::write_u16(&mut payload[2..], id.remote_port);
        BigEndian::write_u32(&mut payload[4..], ts);

        let mut hasher = self.hasher.lock().expect("Poisoned lock");
        hasher.update(payload);
        hasher.update(self.nonce[nonce_index]);
        match id.local_addr {
            std::net::IpAddr::V4(a) => hasher.update(a.octets()),
            std::net::IpAddr::V6(a) => hasher.update(a.octets()),
        }
        match id.remote_addr {
            std::net::IpAddr::V4(a) => hasher.update(a.octets()),
            std::net::IpAddr::V6(a) => hasher.update(a.octets()),
        }
        let digest = hasher.finalize_reset();

        BigEndian::read_u32(&digest[..4])
    }

    /// Creates a SYN cookie for the given id and incoming sequence number, folding the two
    /// payload bits of `data` into it.
    pub fn create_cookie(&self, id: &EndpointId, seq: u32, data: u32) -> u32 {
        self.create_cookie_at(id, seq, data, time_stamp())
    }

    // All the arithmetic is 32-bit and wrapping on purpose: the top byte ends up holding the
    // timestamp plus any carry out of the low 24 bits, and validation undoes the same
    // operations in reverse, so the carry cancels out.
    fn create_cookie_at(&self, id: &EndpointId, seq: u32, data: u32, ts: u32) -> u32 {
        let mut v =
            Wrapping(self.cookie_hash(id, 0, 0)) + Wrapping(seq) + Wrapping(ts << TS_OFFSET);
        v += Wrapping((self.cookie_hash(id, ts, 1).wrapping_add(data)) & HASH_MASK);
        v.0
    }

    /// Checks if the supplied cookie is valid for the given id and sequence number. If it is,
    /// also returns the data originally encoded into the cookie.
    ///
    /// Callers still have to range-check the returned data; a forged cookie that slips through
    /// yields an essentially random value.
    pub fn validate_cookie(&self, id: &EndpointId, cookie: u32, seq: u32) -> Option<u32> {
        self.validate_cookie_at(id, cookie, seq, time_stamp())
    }

    fn validate_cookie_at(
        &self,
        id: &EndpointId,
        cookie: u32,
        seq: u32,
        ts_now: u32,
    ) -> Option<u32> {
        let v = Wrapping(cookie) - Wrapping(self.cookie_hash(id, 0, 0)) - Wrapping(seq);
        let cookie_ts = v.0 >> TS_OFFSET;
        if (ts_now.wrapping_sub(cookie_ts) & TS_MASK) > MAX_TS_DIFF {
            return None;
        }

        Some((v - Wrapping(self.cookie_hash(id, cookie_ts, 1))).0 & HASH_MASK)
    }
}

impl Default for CookieCodec {
    fn default() -> Self {
        Self::new()
    }
}
