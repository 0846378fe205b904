// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The endpoint object handed to the application for every accepted connection, plus the
//! sender/receiver halves which hold the parameters negotiated during connection setup.

use std::num::Wrapping;
use std::sync::mpsc::{self, Sender as ChannelSender};
use std::sync::{Arc, Mutex};

use crate::stack::{EndpointId, NetworkProtocol, Route, Segment, SegmentSink, Stack};

/// The lifecycle states of a TCP endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Passively waiting for connection requests.
    Listen,
    /// A `SYN` was received and the handshake is in flight.
    SynRcvd,
    /// The three-way handshake completed.
    Connected,
    /// The endpoint is no longer usable.
    Closed,
}

/// The sending half of a connection.
#[derive(Debug)]
pub struct Sender {
    iss: Wrapping<u32>,
    snd_nxt: Wrapping<u32>,
    // The peer's advertised window. The window carried by a SYN is never scaled, so this is
    // stored raw and the shift is applied to later segments only.
    snd_wnd: u32,
    mss: u16,
    wnd_scale: u8,
}

impl Sender {
    /// Creates the sending half from the handshake results.
    pub fn new(iss: u32, peer_wnd: u16, mss: u16, snd_wnd_scale: i8) -> Self {
        Sender {
            iss: Wrapping(iss),
            // The ISS itself is consumed by the SYN-ACK.
            snd_nxt: Wrapping(iss) + Wrapping(1),
            snd_wnd: u32::from(peer_wnd),
            mss,
            wnd_scale: if snd_wnd_scale > 0 {
                snd_wnd_scale as u8
            } else {
                0
            },
        }
    }

    /// Returns the initial send sequence number.
    #[inline]
    pub fn iss(&self) -> u32 {
        self.iss.0
    }

    /// Returns the next sequence number to be sent.
    #[inline]
    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt.0
    }

    /// Returns the peer's advertised window.
    #[inline]
    pub fn snd_wnd(&self) -> u32 {
        self.snd_wnd
    }

    /// Returns the maximum segment size usable towards the peer.
    #[inline]
    pub fn mss(&self) -> u16 {
        self.mss
    }

    /// Returns the shift applied to the peer's window advertisements after the handshake.
    #[inline]
    pub fn wnd_scale(&self) -> u8 {
        self.wnd_scale
    }
}

/// The receiving half of a connection.
#[derive(Debug)]
pub struct Receiver {
    irs: Wrapping<u32>,
    rcv_nxt: Wrapping<u32>,
    rcv_wnd: u32,
    rcv_wnd_scale: u8,
}

impl Receiver {
    /// Creates the receiving half from the handshake results.
    pub fn new(irs: u32, rcv_wnd: u32, rcv_wnd_scale: u8) -> Self {
        Receiver {
            irs: Wrapping(irs),
            rcv_nxt: Wrapping(irs) + Wrapping(1),
            rcv_wnd,
            rcv_wnd_scale,
        }
    }

    /// Returns the initial receive sequence number.
    #[inline]
    pub fn irs(&self) -> u32 {
        self.irs.0
    }

    /// Returns the next sequence number expected from the peer.
    #[inline]
    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt.0
    }

    /// Returns the local receive window.
    #[inline]
    pub fn rcv_wnd(&self) -> u32 {
        self.rcv_wnd
    }

    /// Returns the shift applied to our window advertisements after the handshake.
    #[inline]
    pub fn rcv_wnd_scale(&self) -> u8 {
        self.rcv_wnd_scale
    }
}

struct Inner {
    state: State,
    registered: bool,
    snd: Option<Sender>,
    rcv: Option<Receiver>,
}

/// One TCP connection.
///
/// The acceptor creates these, drives them through the handshake and queues them for the
/// application; the data path which would use the sender/receiver halves afterwards lives
/// elsewhere.
pub struct Endpoint {
    stack: Arc<Stack>,
    net_proto: NetworkProtocol,
    id: EndpointId,
    route: Route,
    effective_net_protos: Vec<NetworkProtocol>,
    v6_only: bool,
    rcv_buf_size: u32,
    inner: Mutex<Inner>,
    segment_tx: ChannelSender<Arc<Segment>>,
    segment_rx: Mutex<mpsc::Receiver<Arc<Segment>>>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("id", &self.id).finish()
    }
}

struct EndpointSink(Mutex<ChannelSender<Arc<Segment>>>);

impl SegmentSink for EndpointSink {
    fn deliver(&self, s: Arc<Segment>) -> bool {
        self.0.lock().expect("Poisoned lock").send(s).is_ok()
    }
}

impl Endpoint {
    /// Creates an endpoint for the flow described by `segment`, in the `SynRcvd` state and not
    /// yet registered with the stack.
    pub fn new(
        stack: Arc<Stack>,
        net_proto: NetworkProtocol,
        v6_only: bool,
        segment: &Segment,
        rcv_buf_size: u32,
    ) -> Self {
        let (segment_tx, segment_rx) = mpsc::channel();
        Endpoint {
            stack,
            net_proto,
            id: *segment.id(),
            route: segment.route().clone(),
            effective_net_protos: vec![segment.route().net_proto()],
            v6_only,
            rcv_buf_size,
            inner: Mutex::new(Inner {
                state: State::SynRcvd,
                registered: false,
                snd: None,
                rcv: None,
            }),
            segment_tx,
            segment_rx: Mutex::new(segment_rx),
        }
    }

    /// Registers the endpoint with the stack demultiplexer, so segments of its flow are routed
    /// here instead of the listener.
    pub fn register(&self) -> crate::stack::Result<()> {
        let sink = Arc::new(EndpointSink(Mutex::new(self.segment_tx.clone())));
        self.stack.register_transport_endpoint(
            self.route.nic(),
            &self.effective_net_protos,
            &self.id,
            sink,
        )?;
        self.inner.lock().expect("Poisoned lock").registered = true;
        Ok(())
    }

    /// Closes the endpoint, removing its stack registration. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("Poisoned lock");
        if inner.registered {
            self.stack
                .deregister_transport_endpoint(&self.effective_net_protos, &self.id);
            inner.registered = false;
        }
        inner.state = State::Closed;
    }

    /// Returns the flow identifier.
    #[inline]
    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Returns the network protocol the endpoint is bound to.
    #[inline]
    pub fn net_proto(&self) -> NetworkProtocol {
        self.net_proto
    }

    /// Returns the route of the flow.
    #[inline]
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> State {
        self.inner.lock().expect("Poisoned lock").state
    }

    /// Returns whether the endpoint refuses v4 traffic on a v6 binding.
    #[inline]
    pub fn v6_only(&self) -> bool {
        self.v6_only
    }

    /// Returns the size of the receive buffer backing the advertised window.
    #[inline]
    pub fn rcv_buf_size(&self) -> u32 {
        self.rcv_buf_size
    }

    /// Marks the endpoint connected and installs the two transfer halves.
    pub fn connect(&self, snd: Sender, rcv: Receiver) {
        let mut inner = self.inner.lock().expect("Poisoned lock");
        inner.snd = Some(snd);
        inner.rcv = Some(rcv);
        inner.state = State::Connected;
    }

    /// Returns the negotiated maximum segment size, once connected.
    pub fn mss(&self) -> Option<u16> {
        self.inner
            .lock()
            .expect("Poisoned lock")
            .snd
            .as_ref()
            .map(Sender::mss)
    }

    /// Returns the receive window scale, once connected.
    pub fn rcv_wnd_scale(&self) -> Option<u8> {
        self.inner
            .lock()
            .expect("Poisoned lock")
            .rcv
            .as_ref()
            .map(Receiver::rcv_wnd_scale)
    }

    /// Overrides the receive window scale, used once the handshake has revealed whether the
    /// peer supports window scaling at all.
    pub fn set_rcv_wnd_scale(&self, scale: u8) {
        if let Some(rcv) = self.inner.lock().expect("Poisoned lock").rcv.as_mut() {
            rcv.rcv_wnd_scale = scale;
        }
    }

    // The channel end the handshake (and later the protocol loop) reads inbound segments from.
    pub(crate) fn segment_rx(&self) -> &Mutex<mpsc::Receiver<Arc<Segment>>> {
        &self.segment_rx
    }

    pub(crate) fn stack(&self) -> &Arc<Stack> {
        &self.stack
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // A dropped endpoint must not leave a dangling demux registration behind.
        self.close();
    }
}
