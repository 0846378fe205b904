// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Drives the server side of the TCP three-way handshake for one endpoint.

use std::num::Wrapping;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use log::debug;

use crate::pdu::tcp::Flags;
use crate::tcp::endpoint::Endpoint;
use crate::tcp::{clamp_window, seq_at_or_after, ADVERTISED_MSS};

// How long to wait for the client's ACK before retransmitting the SYN-ACK. Doubles after
// every retransmission.
const SYNACK_RTO: Duration = Duration::from_secs(1);

// How many retransmissions to attempt before giving up on the handshake.
const MAX_SYNACK_RETRIES: u32 = 4;

/// Describes the errors which may terminate a handshake.
#[derive(Debug, PartialEq)]
pub enum Error {
    /// The handshake was not moved into the `SYN-RCVD` state before execution.
    InvalidState,
    /// The peer reset the connection.
    Reset,
    /// The endpoint's segment channel is gone.
    SegmentChannelClosed,
    /// A `SYN-ACK` could not be emitted.
    Send(crate::stack::Error),
    /// The client's `ACK` never arrived.
    Timeout,
}

/// Result type for handshake operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq)]
enum HandshakeState {
    Idle,
    SynRcvd,
    Complete,
}

// Picks the smallest shift which makes the receive window representable in the 16-bit window
// field, capped at the largest shift the option can carry.
fn find_rcv_wnd_scale(rcv_wnd: u32) -> u8 {
    let mut scale = 0u8;
    let mut wnd = rcv_wnd;
    while wnd > u32::from(u16::max_value()) && scale < 14 {
        scale += 1;
        wnd >>= 1;
    }
    scale
}

/// A single three-way handshake in progress.
pub struct Handshake<'a> {
    ep: &'a Endpoint,
    rcv_wnd: u32,
    rcv_wnd_scale: u8,
    state: HandshakeState,
    iss: u32,
    irs: u32,
    mss: u16,
    snd_wnd_scale: i8,
    rto: Duration,
    max_retries: u32,
}

impl<'a> Handshake<'a> {
    /// Creates a handshake for `ep`, advertising a receive window of `rcv_wnd`.
    pub fn new(ep: &'a Endpoint, rcv_wnd: u32) -> Self {
        Handshake {
            ep,
            rcv_wnd,
            rcv_wnd_scale: find_rcv_wnd_scale(rcv_wnd),
            state: HandshakeState::Idle,
            iss: 0,
            irs: 0,
            mss: ADVERTISED_MSS,
            snd_wnd_scale: -1,
            rto: SYNACK_RTO,
            max_retries: MAX_SYNACK_RETRIES,
        }
    }

    /// Seeds the handshake as if a `SYN` had just been received: `iss` will be our initial
    /// sequence number, `irs` is the client's, and `mss`/`snd_wnd_scale` are the values parsed
    /// from the `SYN` options. A negative `snd_wnd_scale` means the peer did not offer window
    /// scaling, and we will not advertise it either.
    pub fn reset_to_syn_rcvd(&mut self, iss: u32, irs: u32, mss: u16, snd_wnd_scale: i8) {
        self.iss = iss;
        self.irs = irs;
        self.mss = mss;
        self.snd_wnd_scale = snd_wnd_scale;
        self.state = HandshakeState::SynRcvd;
    }

    /// Returns the receive window scale to run the connection with: our own shift when the
    /// peer plays along, 0 otherwise.
    pub fn effective_rcv_wnd_scale(&self) -> u8 {
        if self.snd_wnd_scale >= 0 {
            self.rcv_wnd_scale
        } else {
            0
        }
    }

    fn send_syn_ack(&self) -> crate::stack::Result<()> {
        let wnd_scale = if self.snd_wnd_scale >= 0 {
            self.rcv_wnd_scale as i8
        } else {
            -1
        };
        self.ep.stack().send_syn_tcp(
            self.ep.route(),
            self.ep.id(),
            Flags::SYN | Flags::ACK,
            self.iss,
            self.irs.wrapping_add(1),
            clamp_window(self.rcv_wnd),
            Some(ADVERTISED_MSS),
            wnd_scale,
        )
    }

    /// Runs the handshake to completion: emits the `SYN-ACK`, then waits for the client's
    /// `ACK`, retransmitting on a doubling timeout until the retry budget runs out.
    pub fn execute(&mut self) -> Result<()> {
        if self.state != HandshakeState::SynRcvd {
            return Err(Error::InvalidState);
        }

        let rx = self.ep.segment_rx().lock().expect("Poisoned lock");
        self.send_syn_ack().map_err(Error::Send)?;

        let mut retries = 0;
        let mut timeout = self.rto;
        loop {
            match rx.recv_timeout(timeout) {
                Ok(s) => {
                    let flags = s.flags();
                    if flags.contains(Flags::RST) {
                        return Err(Error::Reset);
                    }
                    if flags.contains(Flags::SYN) {
                        // The client has not seen our SYN-ACK yet; answer its retransmitted
                        // SYN and keep waiting.
                        if s.sequence_number() == self.irs {
                            self.send_syn_ack().map_err(Error::Send)?;
                        }
                        continue;
                    }
                    if flags.contains(Flags::ACK)
                        && s.ack_number() == self.iss.wrapping_add(1)
                        && seq_at_or_after(
                            Wrapping(s.sequence_number()),
                            Wrapping(self.irs.wrapping_add(1)),
                        )
                    {
                        self.state = HandshakeState::Complete;
                        return Ok(());
                    }
                    // Anything else is noise at this point.
                    debug!("ignoring {:?} segment during handshake", flags);
                }
                Err(RecvTimeoutError::Timeout) => {
                    retries += 1;
                    if retries > self.max_retries {
                        return Err(Error::Timeout);
                    }
                    timeout *= 2;
                    self.send_syn_ack().map_err(Error::Send)?;
                }
                Err(RecvTimeoutError::Disconnected) => return Err(Error::SegmentChannelClosed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::mpsc::Receiver;
    use std::sync::Arc;

    use super::*;
    use crate::pdu::tcp::{self, TcpSegment};
    use crate::stack::{Route, Segment, Stack, TxFrame};

    const CLIENT_SEQ: u32 = 0x0100_0000;
    const SERVER_ISS: u32 = 0x0555_5555;

    fn test_route() -> Route {
        Route::new(
            1,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        )
        .unwrap()
    }

    fn wire_segment(
        flags: Flags,
        seq: u32,
        ack: u32,
        mss: Option<u16>,
        wnd_scale: Option<u8>,
    ) -> Vec<u8> {
        let mut buf = [0u8; tcp::MAX_HEADER_LEN];
        let len = tcp::write_segment(buf.as_mut(), 5555, 80, seq, ack, flags, 4096, mss, wnd_scale)
            .unwrap();
        buf[..len].to_vec()
    }

    // Returns a registered endpoint for the canonical test flow, plus the transmit queue.
    fn test_endpoint() -> (Arc<Stack>, Endpoint, Receiver<TxFrame>) {
        let (stack, tx_rx) = Stack::new();
        let route = test_route();
        let syn = Segment::parse(
            route.clone(),
            &wire_segment(Flags::SYN, CLIENT_SEQ, 0, Some(1460), Some(7)),
        )
        .unwrap();
        let ep = Endpoint::new(stack.clone(), route.net_proto(), false, &syn, 65535);
        ep.register().unwrap();
        (stack, ep, tx_rx)
    }

    fn expect_syn_ack(tx_rx: &Receiver<TxFrame>, wnd_scale: i8) {
        let frame = tx_rx.try_recv().unwrap();
        let s = TcpSegment::from_bytes(&frame.bytes).unwrap();
        assert_eq!(s.flags_after_ns(), Flags::SYN | Flags::ACK);
        assert_eq!(s.sequence_number(), SERVER_ISS);
        assert_eq!(s.ack_number(), CLIENT_SEQ.wrapping_add(1));
        let opts = s.parse_syn_options().unwrap();
        assert_eq!(opts.mss, ADVERTISED_MSS);
        assert_eq!(opts.wnd_scale, wnd_scale);
    }

    #[test]
    fn test_find_rcv_wnd_scale() {
        assert_eq!(find_rcv_wnd_scale(4096), 0);
        assert_eq!(find_rcv_wnd_scale(65535), 0);
        assert_eq!(find_rcv_wnd_scale(65536), 1);
        assert_eq!(find_rcv_wnd_scale(1 << 20), 5);
        assert_eq!(find_rcv_wnd_scale(u32::max_value()), 14);
    }

    #[test]
    fn test_execute_completes_on_ack() {
        let (stack, ep, tx_rx) = test_endpoint();

        let mut h = Handshake::new(&ep, 1 << 18);
        assert_eq!(h.execute().unwrap_err(), Error::InvalidState);

        h.reset_to_syn_rcvd(SERVER_ISS, CLIENT_SEQ, 1460, 7);

        // The client's ACK is already queued when the handshake starts looking for it.
        stack
            .receive_tcp_segment(
                test_route(),
                &wire_segment(
                    Flags::ACK,
                    CLIENT_SEQ.wrapping_add(1),
                    SERVER_ISS.wrapping_add(1),
                    None,
                    None,
                ),
            )
            .unwrap();

        h.execute().unwrap();
        // 2^18 needs a shift of 3, and the peer offered scaling.
        assert_eq!(h.effective_rcv_wnd_scale(), 3);
        expect_syn_ack(&tx_rx, 3);
    }

    #[test]
    fn test_no_wnd_scale_without_peer_support() {
        let (stack, ep, tx_rx) = test_endpoint();

        let mut h = Handshake::new(&ep, 1 << 18);
        h.reset_to_syn_rcvd(SERVER_ISS, CLIENT_SEQ, 1460, -1);
        stack
            .receive_tcp_segment(
                test_route(),
                &wire_segment(
                    Flags::ACK,
                    CLIENT_SEQ.wrapping_add(1),
                    SERVER_ISS.wrapping_add(1),
                    None,
                    None,
                ),
            )
            .unwrap();

        h.execute().unwrap();
        assert_eq!(h.effective_rcv_wnd_scale(), 0);
        expect_syn_ack(&tx_rx, -1);
    }

    #[test]
    fn test_syn_retransmit_triggers_syn_ack() {
        let (stack, ep, tx_rx) = test_endpoint();

        let mut h = Handshake::new(&ep, 4096);
        h.reset_to_syn_rcvd(SERVER_ISS, CLIENT_SEQ, 1460, 7);

        // A duplicate of the original SYN, then the ACK.
        stack
            .receive_tcp_segment(
                test_route(),
                &wire_segment(Flags::SYN, CLIENT_SEQ, 0, Some(1460), Some(7)),
            )
            .unwrap();
        stack
            .receive_tcp_segment(
                test_route(),
                &wire_segment(
                    Flags::ACK,
                    CLIENT_SEQ.wrapping_add(1),
                    SERVER_ISS.wrapping_add(1),
                    None,
                    None,
                ),
            )
            .unwrap();

        h.execute().unwrap();
        expect_syn_ack(&tx_rx, 0);
        expect_syn_ack(&tx_rx, 0);
    }

    #[test]
    fn test_reset_aborts() {
        let (stack, ep, _tx_rx) = test_endpoint();

        let mut h = Handshake::new(&ep, 4096);
        h.reset_to_syn_rcvd(SERVER_ISS, CLIENT_SEQ, 1460, -1);
        stack
            .receive_tcp_segment(
                test_route(),
                &wire_segment(Flags::RST, CLIENT_SEQ.wrapping_add(1), 0, None, None),
            )
            .unwrap();

        assert_eq!(h.execute().unwrap_err(), Error::Reset);
    }

    #[test]
    fn test_retry_budget_exhaustion() {
        let (_stack, ep, tx_rx) = test_endpoint();

        let mut h = Handshake::new(&ep, 4096);
        h.reset_to_syn_rcvd(SERVER_ISS, CLIENT_SEQ, 1460, -1);
        h.rto = Duration::from_millis(5);
        h.max_retries = 2;

        assert_eq!(h.execute().unwrap_err(), Error::Timeout);

        // The initial SYN-ACK plus one per retry.
        let mut frames = 0;
        while tx_rx.try_recv().is_ok() {
            frames += 1;
        }
        assert_eq!(frames, 3);
    }
}
