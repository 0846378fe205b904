// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The listening side of the TCP endpoint: accepts connections while staying resilient to SYN
//! floods.
//!
//! A bounded, process-wide budget limits how many connections may sit in the `SYN-RCVD` state
//! at once. Below the budget, every `SYN` gets a worker thread which runs a full three-way
//! handshake. Once the budget is exhausted the listener answers statelessly: the `SYN-ACK`
//! carries a [SYN cookie] as its sequence number, and the connection is only materialized if a
//! matching `ACK` ever returns. Workers hand finished connections to a bounded accept queue
//! drained by the application.
//!
//! [SYN cookie]: ../cookie/index.html

use std::net::IpAddr;
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, info, warn};
use scopeguard::defer;

use crate::pdu::tcp::Flags;
use crate::stack::{NetworkProtocol, Segment, SegmentSink, Stack};
use crate::tcp::cookie::{encode_mss, CookieCodec, MSS_TABLE};
use crate::tcp::endpoint::{Endpoint, Receiver, Sender, State};
use crate::tcp::handshake::{self, Handshake};
use crate::tcp::{clamp_window, ADVERTISED_MSS};
use crate::waiter::{EventSet, WaiterQueue};

/// The default maximum number of connections allowed in the `SYN-RCVD` state before listeners
/// switch to SYN cookies.
pub const DEFAULT_SYN_RCVD_THRESHOLD: u64 = 1000;

/// Describes the errors which may occur on the accept path.
#[derive(Debug, PartialEq)]
pub enum Error {
    /// The listener could not be bound.
    Bind(crate::stack::Error),
    /// The handshake with the peer failed.
    Handshake(handshake::Error),
    /// The listener has been closed.
    ListenerClosed,
    /// The new endpoint could not be registered with the stack.
    Register(crate::stack::Error),
}

/// Result type for accept-path operations.
pub type Result<T> = std::result::Result<T, Error>;

struct CounterInner {
    value: u64,
    threshold: u64,
}

/// The number of endpoints currently in the `SYN-RCVD` state.
///
/// The value is protected by a mutex together with its threshold, so an increment can only
/// happen when it's guaranteed not to go past the threshold, even with racing callers.
pub struct SynRcvdCounter {
    inner: Mutex<CounterInner>,
}

impl SynRcvdCounter {
    /// Creates a counter which admits at most `threshold` half-open connections.
    pub fn new(threshold: u64) -> Self {
        SynRcvdCounter {
            inner: Mutex::new(CounterInner {
                value: 0,
                threshold,
            }),
        }
    }

    /// Tries to account for one more half-open connection. Fails when the count already sits
    /// at the threshold.
    pub fn try_inc(&self) -> bool {
        let mut inner = self.inner.lock().expect("Poisoned lock");
        if inner.value >= inner.threshold {
            return false;
        }
        inner.value += 1;
        true
    }

    /// Releases one half-open slot. Must only be called after a successful [`try_inc`].
    ///
    /// [`try_inc`]: #method.try_inc
    pub fn dec(&self) {
        let mut inner = self.inner.lock().expect("Poisoned lock");
        debug_assert!(inner.value > 0);
        inner.value -= 1;
    }

    /// Returns the current count.
    pub fn value(&self) -> u64 {
        self.inner.lock().expect("Poisoned lock").value
    }

    /// Returns the current threshold.
    pub fn threshold(&self) -> u64 {
        self.inner.lock().expect("Poisoned lock").threshold
    }

    /// Changes the threshold. Intended for tests; an already exceeded budget simply drains.
    pub fn set_threshold(&self, threshold: u64) {
        self.inner.lock().expect("Poisoned lock").threshold = threshold;
    }
}

lazy_static! {
    /// The process-wide half-open counter, shared by every listener which does not bring its
    /// own. Being process-wide, it bounds the total across all listeners.
    pub static ref SYN_RCVD_COUNT: Arc<SynRcvdCounter> =
        Arc::new(SynRcvdCounter::new(DEFAULT_SYN_RCVD_THRESHOLD));
}

/// Everything a listening endpoint needs while accepting connections.
///
/// Owned by the listen loop and shared with its handshake workers, which only ever read it
/// (the cookie codec synchronizes internally).
pub struct ListenContext {
    stack: Arc<Stack>,
    rcv_wnd: u32,
    codec: CookieCodec,
    v6_only: bool,
    net_proto: Option<NetworkProtocol>,
}

impl ListenContext {
    fn new(
        stack: Arc<Stack>,
        rcv_wnd: u32,
        v6_only: bool,
        net_proto: Option<NetworkProtocol>,
    ) -> Self {
        ListenContext {
            stack,
            rcv_wnd,
            codec: CookieCodec::new(),
            v6_only,
            net_proto,
        }
    }

    /// Creates a SYN cookie for the flow, see [`CookieCodec::create_cookie`].
    ///
    /// [`CookieCodec::create_cookie`]: ../cookie/struct.CookieCodec.html#method.create_cookie
    pub fn create_cookie(&self, id: &crate::stack::EndpointId, seq: u32, data: u32) -> u32 {
        self.codec.create_cookie(id, seq, data)
    }

    /// Validates a returned SYN cookie, see [`CookieCodec::validate_cookie`].
    ///
    /// [`CookieCodec::validate_cookie`]: ../cookie/struct.CookieCodec.html#method.validate_cookie
    pub fn validate_cookie(
        &self,
        id: &crate::stack::EndpointId,
        cookie: u32,
        seq: u32,
    ) -> Option<u32> {
        self.codec.validate_cookie(id, cookie, seq)
    }

    /// Creates a new connected endpoint for the flow of `s`, with the connection parameters
    /// given by the arguments.
    pub fn create_connected_endpoint(
        &self,
        s: &Segment,
        iss: u32,
        irs: u32,
        mss: u16,
        snd_wnd_scale: i8,
    ) -> Result<Endpoint> {
        let net_proto = self.net_proto.unwrap_or_else(|| s.route().net_proto());
        let ep = Endpoint::new(self.stack.clone(), net_proto, self.v6_only, s, self.rcv_wnd);

        // Register the new endpoint so that segments of its flow are routed to it.
        if let Err(e) = ep.register() {
            ep.close();
            return Err(Error::Register(e));
        }

        // The receiver starts with a zero window scale; the caller may raise it once it has
        // learned what the peer supports.
        ep.connect(
            Sender::new(iss, s.window_size(), mss, snd_wnd_scale),
            Receiver::new(irs, self.rcv_wnd, 0),
        );

        Ok(ep)
    }

    /// Creates a new connected endpoint and then runs the TCP three-way handshake on it.
    ///
    /// The initial send sequence number is a SYN cookie, so even sub-threshold connections
    /// carry sequence numbers an off-path attacker cannot predict.
    pub fn create_endpoint_and_perform_handshake(
        &self,
        s: &Segment,
        mss: u16,
        snd_wnd_scale: i8,
    ) -> Result<Endpoint> {
        let irs = s.sequence_number();
        let cookie = self.create_cookie(s.id(), irs, encode_mss(mss));

        let ep = self.create_connected_endpoint(s, cookie, irs, mss, snd_wnd_scale)?;

        let mut h = Handshake::new(&ep, self.rcv_wnd);
        h.reset_to_syn_rcvd(cookie, irs, mss, snd_wnd_scale);
        if let Err(e) = h.execute() {
            ep.close();
            return Err(Error::Handshake(e));
        }

        // The window scaling can only be settled now: the peer might not have supported it.
        ep.set_rcv_wnd_scale(h.effective_rcv_wnd_scale());

        Ok(ep)
    }
}

/// Events delivered to the listen loop.
enum ListenEvent {
    /// An inbound segment addressed to the listener.
    Segment(Arc<Segment>),
    /// Stop listening.
    Close,
}

struct ListenerSink(Mutex<mpsc::Sender<ListenEvent>>);

impl SegmentSink for ListenerSink {
    fn deliver(&self, s: Arc<Segment>) -> bool {
        self.0
            .lock()
            .expect("Poisoned lock")
            .send(ListenEvent::Segment(s))
            .is_ok()
    }
}

// The pieces of the listener shared with handshake workers and the accept handle.
struct ListenerShared {
    state: RwLock<State>,
    accept_tx: SyncSender<Endpoint>,
    waiter: WaiterQueue,
}

impl ListenerShared {
    // Delivers a newly-accepted endpoint to the accept queue, unless the listener has left the
    // listen state in the meantime, in which case the endpoint is closed instead. Holding the
    // read lock across the enqueue is what keeps shutdown from slipping in between the check
    // and the send.
    fn deliver_accepted(&self, ep: Endpoint) {
        let state = self.state.read().expect("Poisoned lock");
        if *state == State::Listen {
            // A full queue blocks us here, which pushes back on the workers until the
            // application drains it.
            match self.accept_tx.send(ep) {
                Ok(()) => self.waiter.notify(EventSet::IN),
                Err(mpsc::SendError(ep)) => ep.close(),
            }
        } else {
            ep.close();
        }
    }
}

/// Configuration of a listening endpoint.
pub struct ListenConfig {
    /// Refuse v4 traffic even when bound on a v6 address which would accept it.
    pub v6_only: bool,
    /// Pin the listener to one network protocol; `None` accepts whatever the binding allows.
    pub net_proto: Option<NetworkProtocol>,
    /// Capacity of the accept queue.
    pub accept_backlog: usize,
    /// The half-open counter to charge; `None` uses the process-wide [`SYN_RCVD_COUNT`].
    ///
    /// [`SYN_RCVD_COUNT`]: struct.SYN_RCVD_COUNT.html
    pub counter: Option<Arc<SynRcvdCounter>>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            v6_only: false,
            net_proto: None,
            accept_backlog: 128,
            counter: None,
        }
    }
}

/// A listening TCP endpoint.
///
/// Created with [`bind`], which also yields the [`ListenerHandle`] used to accept connections
/// and to shut the listener down. [`run_listen_loop`] does the actual work and is expected to
/// get a thread of its own.
///
/// [`bind`]: #method.bind
/// [`run_listen_loop`]: #method.run_listen_loop
/// [`ListenerHandle`]: struct.ListenerHandle.html
pub struct TcpListener {
    stack: Arc<Stack>,
    local_addr: IpAddr,
    local_port: u16,
    v6_only: bool,
    net_proto: Option<NetworkProtocol>,
    counter: Arc<SynRcvdCounter>,
    shared: Arc<ListenerShared>,
    event_rx: mpsc::Receiver<ListenEvent>,
}

/// The application-facing side of a [`TcpListener`].
///
/// [`TcpListener`]: struct.TcpListener.html
pub struct ListenerHandle {
    shared: Arc<ListenerShared>,
    accept_rx: Mutex<mpsc::Receiver<Endpoint>>,
    event_tx: mpsc::Sender<ListenEvent>,
}

impl TcpListener {
    /// Binds a listener on `local_addr:local_port`.
    pub fn bind(
        stack: &Arc<Stack>,
        local_addr: IpAddr,
        local_port: u16,
        config: ListenConfig,
    ) -> Result<(TcpListener, ListenerHandle)> {
        let (event_tx, event_rx) = mpsc::channel();
        let (accept_tx, accept_rx) = mpsc::sync_channel(config.accept_backlog);

        let shared = Arc::new(ListenerShared {
            state: RwLock::new(State::Listen),
            accept_tx,
            waiter: WaiterQueue::new(),
        });

        stack
            .register_listener(
                local_addr,
                local_port,
                config.v6_only,
                config.net_proto,
                Arc::new(ListenerSink(Mutex::new(event_tx.clone()))),
            )
            .map_err(Error::Bind)?;

        let listener = TcpListener {
            stack: stack.clone(),
            local_addr,
            local_port,
            v6_only: config.v6_only,
            net_proto: config.net_proto,
            counter: config.counter.unwrap_or_else(|| SYN_RCVD_COUNT.clone()),
            shared: shared.clone(),
            event_rx,
        };
        let handle = ListenerHandle {
            shared,
            accept_rx: Mutex::new(accept_rx),
            event_tx,
        };

        Ok((listener, handle))
    }

    /// Services the listener until it is closed, advertising a receive window of `rcv_wnd` to
    /// new connections. This call blocks; run it on a dedicated thread.
    pub fn run_listen_loop(self, rcv_wnd: u32) {
        let ctx = Arc::new(ListenContext::new(
            self.stack.clone(),
            rcv_wnd,
            self.v6_only,
            self.net_proto,
        ));

        info!(
            "tcp listener on {}:{} started",
            self.local_addr, self.local_port
        );

        // Losing every event sender counts as a close notification too.
        while let Ok(event) = self.event_rx.recv() {
            match event {
                ListenEvent::Segment(s) => self.handle_listen_segment(&ctx, &s),
                ListenEvent::Close => break,
            }
        }

        // Leave the listen state first, so workers finishing after this point close their
        // endpoints instead of queueing them.
        {
            let mut state = self.shared.state.write().expect("Poisoned lock");
            *state = State::Closed;
        }

        // Unblock anyone stuck in accept or waiting to write.
        self.shared.waiter.notify(EventSet::IN | EventSet::OUT);

        self.stack.deregister_listener(self.local_addr, self.local_port);

        info!(
            "tcp listener on {}:{} shut down",
            self.local_addr, self.local_port
        );
    }

    // Dispatches one inbound segment by its TCP flags. Anything that is not exactly a SYN or
    // exactly an ACK is dropped on the floor.
    fn handle_listen_segment(&self, ctx: &Arc<ListenContext>, s: &Arc<Segment>) {
        if s.flags() == Flags::SYN {
            let opts = match s.parse_syn_options() {
                Ok(opts) => opts,
                Err(e) => {
                    debug!("dropping SYN with bad options: {:?}", e);
                    return;
                }
            };

            if self.counter.try_inc() {
                let ctx = ctx.clone();
                let s = s.clone();
                let shared = self.shared.clone();
                let counter = self.counter.clone();

                let res = thread::Builder::new()
                    .name(String::from("tcp_synrcvd"))
                    .spawn(move || {
                        // The slot gets released on every exit path, panics included.
                        defer! { counter.dec(); }

                        match ctx.create_endpoint_and_perform_handshake(
                            &s,
                            opts.mss,
                            opts.wnd_scale,
                        ) {
                            Ok(ep) => shared.deliver_accepted(ep),
                            // The client will retransmit its SYN if it still cares.
                            Err(e) => debug!(
                                "handshake with {}:{} failed: {:?}",
                                s.id().remote_addr,
                                s.id().remote_port,
                                e
                            ),
                        }
                    });
                if let Err(e) = res {
                    self.counter.dec();
                    warn!("failed to spawn handshake worker: {}", e);
                }
            } else {
                // Out of half-open budget; answer with a stateless cookie instead. Window
                // scaling cannot be encoded in the cookie, so it is not advertised.
                let cookie = ctx.create_cookie(s.id(), s.sequence_number(), encode_mss(opts.mss));
                debug!(
                    "half-open budget exhausted, sending {}:{} a SYN cookie",
                    s.id().remote_addr,
                    s.id().remote_port
                );
                if let Err(e) = ctx.stack.send_syn_tcp(
                    s.route(),
                    s.id(),
                    Flags::SYN | Flags::ACK,
                    cookie,
                    s.sequence_number().wrapping_add(1),
                    clamp_window(ctx.rcv_wnd),
                    Some(ADVERTISED_MSS),
                    -1,
                ) {
                    debug!("failed to send cookie SYN-ACK: {:?}", e);
                }
            }
        } else if s.flags() == Flags::ACK {
            // Possibly the closing ACK of a cookie handshake. The cookie we would have sent is
            // the ACKed sequence number minus one, and the client's sequence number has moved
            // one past the SYN.
            let cookie = s.ack_number().wrapping_sub(1);
            let client_seq = s.sequence_number().wrapping_sub(1);

            if let Some(data) = ctx.validate_cookie(s.id(), cookie, client_seq) {
                if (data as usize) < MSS_TABLE.len() {
                    // The cookie was the whole handshake; the connection is established the
                    // moment the endpoint exists.
                    match ctx.create_connected_endpoint(
                        s,
                        cookie,
                        client_seq,
                        MSS_TABLE[data as usize],
                        -1,
                    ) {
                        Ok(ep) => self.shared.deliver_accepted(ep),
                        Err(e) => debug!("failed to materialize cookie connection: {:?}", e),
                    }
                }
            }
        }
    }
}

impl ListenerHandle {
    /// Waits for an accepted connection. Fails once the listener is closed and the queue has
    /// been drained.
    pub fn accept(&self) -> Result<Endpoint> {
        loop {
            if let Ok(ep) = self
                .accept_rx
                .lock()
                .expect("Poisoned lock")
                .try_recv()
            {
                return Ok(ep);
            }
            if *self.shared.state.read().expect("Poisoned lock") == State::Closed {
                return Err(Error::ListenerClosed);
            }
            // Notifications are sticky, so a close racing with this wait still wakes us.
            self.shared.waiter.wait(EventSet::IN);
        }
    }

    /// Picks up an accepted connection if one is already queued.
    pub fn try_accept(&self) -> Option<Endpoint> {
        self.accept_rx
            .lock()
            .expect("Poisoned lock")
            .try_recv()
            .ok()
    }

    /// Waits up to `timeout` for any event in `mask`, consuming and returning what fired.
    pub fn wait_events(&self, mask: EventSet, timeout: Duration) -> EventSet {
        self.shared.waiter.wait_timeout(mask, timeout)
    }

    /// Asks the listen loop to shut down. Idempotent.
    pub fn close(&self) {
        let _ = self.event_tx.send(ListenEvent::Close);
    }
}
