// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Just enough of a network stack to route TCP segments between the wire and endpoints.
//!
//! The [`Stack`] keeps a transport demultiplexer: segments whose 4-tuple matches a registered
//! endpoint are delivered straight to that endpoint, everything else is offered to the listener
//! bound on the destination port. Outbound segments are serialized onto a transmit channel
//! drained by the device model which owns the actual wire.
//!
//! [`Stack`]: struct.Stack.html

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::pdu::tcp::{self, Flags, TcpSegment};

/// Describes the errors which may occur while handling stack operations.
#[derive(Debug, PartialEq)]
pub enum Error {
    /// The two halves of a route do not belong to the same address family.
    AddressFamily,
    /// Another endpoint is already registered for the 4-tuple.
    DuplicateEndpoint,
    /// Another listener is already bound on the address and port.
    DuplicateListener,
    /// The segment bytes could not be parsed.
    TcpSegment(tcp::Error),
    /// The transmit channel is gone.
    TxChannelClosed,
}

/// Result type for stack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The network protocol carrying a TCP segment.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NetworkProtocol {
    /// IPv4.
    Ipv4,
    /// IPv6.
    Ipv6,
}

impl NetworkProtocol {
    fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => NetworkProtocol::Ipv4,
            IpAddr::V6(_) => NetworkProtocol::Ipv6,
        }
    }
}

/// The path a segment travels between this host and a remote one.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    nic: u32,
    local_addr: IpAddr,
    remote_addr: IpAddr,
    net_proto: NetworkProtocol,
}

impl Route {
    /// Creates a route over `nic` between the two addresses, which must belong to the same
    /// address family.
    pub fn new(nic: u32, local_addr: IpAddr, remote_addr: IpAddr) -> Result<Self> {
        if NetworkProtocol::of(&local_addr) != NetworkProtocol::of(&remote_addr) {
            return Err(Error::AddressFamily);
        }
        Ok(Route {
            nic,
            local_addr,
            remote_addr,
            net_proto: NetworkProtocol::of(&local_addr),
        })
    }

    /// Returns the identifier of the NIC this route goes through.
    #[inline]
    pub fn nic(&self) -> u32 {
        self.nic
    }

    /// Returns the local address.
    #[inline]
    pub fn local_addr(&self) -> IpAddr {
        self.local_addr
    }

    /// Returns the remote address.
    #[inline]
    pub fn remote_addr(&self) -> IpAddr {
        self.remote_addr
    }

    /// Returns the network protocol of the route.
    #[inline]
    pub fn net_proto(&self) -> NetworkProtocol {
        self.net_proto
    }
}

/// The 4-tuple which identifies a TCP flow.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EndpointId {
    /// Local address.
    pub local_addr: IpAddr,
    /// Local port.
    pub local_port: u16,
    /// Remote address.
    pub remote_addr: IpAddr,
    /// Remote port.
    pub remote_port: u16,
}

/// A parsed inbound TCP segment, together with the flow and route it arrived on.
///
/// Shared between the demultiplexer, the listener and handshake workers as `Arc<Segment>`.
#[derive(Debug)]
pub struct Segment {
    id: EndpointId,
    route: Route,
    flags: Flags,
    sequence_number: u32,
    ack_number: u32,
    window_size: u16,
    options: Vec<u8>,
}

impl Segment {
    /// Parses `bytes` as a TCP segment which arrived over `route`.
    pub fn parse(route: Route, bytes: &[u8]) -> Result<Segment> {
        let s = TcpSegment::from_bytes(bytes).map_err(Error::TcpSegment)?;
        let id = EndpointId {
            local_addr: route.local_addr(),
            local_port: s.destination_port(),
            remote_addr: route.remote_addr(),
            remote_port: s.source_port(),
        };
        Ok(Segment {
            id,
            flags: s.flags_after_ns(),
            sequence_number: s.sequence_number(),
            ack_number: s.ack_number(),
            window_size: s.window_size(),
            options: s.options_unchecked(s.header_len()).to_vec(),
            route,
        })
    }

    /// Returns the flow identifier.
    #[inline]
    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Returns the route the segment arrived on.
    #[inline]
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Returns the TCP header flags.
    #[inline]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Returns the sequence number.
    #[inline]
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// Returns the acknowledgement number.
    #[inline]
    pub fn ack_number(&self) -> u32 {
        self.ack_number
    }

    /// Returns the advertised window size.
    #[inline]
    pub fn window_size(&self) -> u16 {
        self.window_size
    }

    /// Parses the `SYN` options carried by the segment.
    pub fn parse_syn_options(&self) -> std::result::Result<tcp::SynOptions, tcp::Error> {
        tcp::parse_syn_options(&self.options)
    }
}

/// Receives the segments the demultiplexer routes to one endpoint or listener.
pub trait SegmentSink: Send + Sync {
    /// Hands over a segment. Returns `false` when the receiving side is gone.
    fn deliver(&self, s: Arc<Segment>) -> bool;
}

/// A serialized TCP segment waiting to be put on the wire.
#[derive(Debug)]
pub struct TxFrame {
    /// The route the segment should travel.
    pub route: Route,
    /// The serialized TCP segment.
    pub bytes: Vec<u8>,
}

struct ListenerEntry {
    v6_only: bool,
    net_proto: Option<NetworkProtocol>,
    sink: Arc<dyn SegmentSink>,
}

/// Routes TCP segments between the wire, listeners and registered endpoints.
pub struct Stack {
    demux: Mutex<HashMap<(NetworkProtocol, EndpointId), Arc<dyn SegmentSink>>>,
    listeners: Mutex<HashMap<(IpAddr, u16), ListenerEntry>>,
    tx: Mutex<Sender<TxFrame>>,
}

impl Stack {
    /// Creates a stack. The returned receiver yields the frames the stack wants transmitted.
    pub fn new() -> (Arc<Stack>, Receiver<TxFrame>) {
        let (tx, rx) = mpsc::channel();
        let stack = Arc::new(Stack {
            demux: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            tx: Mutex::new(tx),
        });
        (stack, rx)
    }

    /// Registers `sink` to receive every segment matching `id` over the given protocols, so
    /// the flow no longer reaches the listener.
    pub fn register_transport_endpoint(
        &self,
        _nic: u32,
        net_protos: &[NetworkProtocol],
        id: &EndpointId,
        sink: Arc<dyn SegmentSink>,
    ) -> Result<()> {
        let mut demux = self.demux.lock().expect("Poisoned lock");
        if net_protos
            .iter()
            .any(|proto| demux.contains_key(&(*proto, *id)))
        {
            return Err(Error::DuplicateEndpoint);
        }
        for proto in net_protos {
            demux.insert((*proto, *id), sink.clone());
        }
        Ok(())
    }

    /// Removes the registration of `id` over the given protocols.
    pub fn deregister_transport_endpoint(&self, net_protos: &[NetworkProtocol], id: &EndpointId) {
        let mut demux = self.demux.lock().expect("Poisoned lock");
        for proto in net_protos {
            demux.remove(&(*proto, *id));
        }
    }

    /// Returns whether any registration exists for `id`.
    pub fn is_endpoint_registered(&self, id: &EndpointId) -> bool {
        self.demux
            .lock()
            .expect("Poisoned lock")
            .keys()
            .any(|(_, key)| key == id)
    }

    /// Binds `sink` as the listener for segments addressed to `local_addr:port` which match no
    /// registered endpoint. An unspecified `local_addr` matches any local address.
    pub fn register_listener(
        &self,
        local_addr: IpAddr,
        port: u16,
        v6_only: bool,
        net_proto: Option<NetworkProtocol>,
        sink: Arc<dyn SegmentSink>,
    ) -> Result<()> {
        let mut listeners = self.listeners.lock().expect("Poisoned lock");
        match listeners.entry((local_addr, port)) {
            Entry::Occupied(_) => Err(Error::DuplicateListener),
            Entry::Vacant(e) => {
                e.insert(ListenerEntry {
                    v6_only,
                    net_proto,
                    sink,
                });
                Ok(())
            }
        }
    }

    /// Removes the listener bound on `local_addr:port`.
    pub fn deregister_listener(&self, local_addr: IpAddr, port: u16) {
        self.listeners
            .lock()
            .expect("Poisoned lock")
            .remove(&(local_addr, port));
    }

    /// Parses an inbound TCP segment and routes it: a registered 4-tuple wins over the
    /// listener; segments matching neither are dropped.
    pub fn receive_tcp_segment(&self, route: Route, bytes: &[u8]) -> Result<()> {
        let segment = Arc::new(Segment::parse(route, bytes)?);
        let id = *segment.id();
        let net_proto = segment.route().net_proto();

        let endpoint_sink = self
            .demux
            .lock()
            .expect("Poisoned lock")
            .get(&(net_proto, id))
            .cloned();
        if let Some(sink) = endpoint_sink {
            sink.deliver(segment);
            return Ok(());
        }

        if let Some(sink) = self.lookup_listener(&id, net_proto) {
            sink.deliver(segment);
            return Ok(());
        }

        debug!(
            "dropping segment for {}:{}, no endpoint or listener",
            id.local_addr, id.local_port
        );
        Ok(())
    }

    fn lookup_listener(
        &self,
        id: &EndpointId,
        net_proto: NetworkProtocol,
    ) -> Option<Arc<dyn SegmentSink>> {
        let listeners = self.listeners.lock().expect("Poisoned lock");

        // Exact binding first, then the family's unspecified address. A listener bound on the
        // v6 unspecified address is dual-stack unless marked v6-only, so it is the last resort
        // for v4 segments too.
        let mut candidates = vec![(id.local_addr, id.local_port)];
        match id.local_addr {
            IpAddr::V4(_) => {
                candidates.push((IpAddr::V4(Ipv4Addr::UNSPECIFIED), id.local_port));
                candidates.push((IpAddr::V6(Ipv6Addr::UNSPECIFIED), id.local_port));
            }
            IpAddr::V6(_) => {
                candidates.push((IpAddr::V6(Ipv6Addr::UNSPECIFIED), id.local_port));
            }
        }

        for key in candidates {
            if let Some(entry) = listeners.get(&key) {
                if let Some(proto) = entry.net_proto {
                    if proto != net_proto {
                        continue;
                    }
                }
                if entry.v6_only && net_proto == NetworkProtocol::Ipv4 {
                    continue;
                }
                return Some(entry.sink.clone());
            }
        }
        None
    }

    /// Serializes a control segment of the connection-establishment phase and queues it for
    /// transmission. `wnd_scale` below 0 means the window scale option is not advertised.
    #[allow(clippy::too_many_arguments)]
    pub fn send_syn_tcp(
        &self,
        route: &Route,
        id: &EndpointId,
        flags: Flags,
        seq: u32,
        ack: u32,
        window: u16,
        mss: Option<u16>,
        wnd_scale: i8,
    ) -> Result<()> {
        let mut buf = [0u8; tcp::MAX_HEADER_LEN];
        let wnd_scale_option = if wnd_scale >= 0 {
            Some(wnd_scale as u8)
        } else {
            None
        };
        let len = tcp::write_segment(
            buf.as_mut(),
            id.local_port,
            id.remote_port,
            seq,
            ack,
            flags,
            window,
            mss,
            wnd_scale_option,
        )
        .map_err(Error::TcpSegment)?;

        self.tx
            .lock()
            .expect("Poisoned lock")
            .send(TxFrame {
                route: route.clone(),
                bytes: buf[..len].to_vec(),
            })
            .map_err(|_| Error::TxChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::TryRecvError;

    use super::*;

    struct ChannelSink(Mutex<Sender<Arc<Segment>>>);

    impl ChannelSink {
        fn pair() -> (Arc<ChannelSink>, Receiver<Arc<Segment>>) {
            let (tx, rx) = mpsc::channel();
            (Arc::new(ChannelSink(Mutex::new(tx))), rx)
        }
    }

    impl SegmentSink for ChannelSink {
        fn deliver(&self, s: Arc<Segment>) -> bool {
            self.0.lock().unwrap().send(s).is_ok()
        }
    }

    fn test_route() -> Route {
        Route::new(
            1,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        )
        .unwrap()
    }

    fn syn_bytes(src_port: u16, dst_port: u16, seq: u32) -> Vec<u8> {
        let mut buf = [0u8; tcp::MAX_HEADER_LEN];
        let len = tcp::write_segment(
            buf.as_mut(),
            src_port,
            dst_port,
            seq,
            0,
            Flags::SYN,
            4096,
            Some(1460),
            None,
        )
        .unwrap();
        buf[..len].to_vec()
    }

    #[test]
    fn test_route_families() {
        assert_eq!(
            Route::new(
                0,
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST)
            )
            .unwrap_err(),
            Error::AddressFamily
        );

        let route = test_route();
        assert_eq!(route.net_proto(), NetworkProtocol::Ipv4);
    }

    #[test]
    fn test_segment_parse() {
        let route = test_route();
        let bytes = syn_bytes(5555, 80, 7777);
        let s = Segment::parse(route.clone(), &bytes).unwrap();

        assert_eq!(s.id().local_port, 80);
        assert_eq!(s.id().remote_port, 5555);
        assert_eq!(s.id().local_addr, route.local_addr());
        assert_eq!(s.id().remote_addr, route.remote_addr());
        assert_eq!(s.flags(), Flags::SYN);
        assert_eq!(s.sequence_number(), 7777);
        assert_eq!(s.parse_syn_options().unwrap().mss, 1460);
    }

    #[test]
    fn test_duplicate_registrations() {
        let (stack, _tx_rx) = Stack::new();
        let (sink, _rx) = ChannelSink::pair();
        let id = EndpointId {
            local_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            local_port: 80,
            remote_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            remote_port: 5555,
        };

        stack
            .register_transport_endpoint(1, &[NetworkProtocol::Ipv4], &id, sink.clone())
            .unwrap();
        assert_eq!(
            stack
                .register_transport_endpoint(1, &[NetworkProtocol::Ipv4], &id, sink.clone())
                .unwrap_err(),
            Error::DuplicateEndpoint
        );
        assert!(stack.is_endpoint_registered(&id));

        stack.deregister_transport_endpoint(&[NetworkProtocol::Ipv4], &id);
        assert!(!stack.is_endpoint_registered(&id));

        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        stack
            .register_listener(addr, 80, false, None, sink.clone())
            .unwrap();
        assert_eq!(
            stack
                .register_listener(addr, 80, false, None, sink)
                .unwrap_err(),
            Error::DuplicateListener
        );
    }

    #[test]
    fn test_demux_bypasses_listener() {
        let (stack, _tx_rx) = Stack::new();
        let (listener_sink, listener_rx) = ChannelSink::pair();
        let (endpoint_sink, endpoint_rx) = ChannelSink::pair();

        let local_addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        stack
            .register_listener(local_addr, 80, false, None, listener_sink)
            .unwrap();

        // Nothing registered for the 4-tuple yet, so the listener sees the segment.
        stack
            .receive_tcp_segment(test_route(), &syn_bytes(5555, 80, 1))
            .unwrap();
        let s = listener_rx.try_recv().unwrap();
        assert_eq!(s.id().remote_port, 5555);

        // Once the 4-tuple is registered, the listener is bypassed.
        stack
            .register_transport_endpoint(1, &[NetworkProtocol::Ipv4], s.id(), endpoint_sink)
            .unwrap();
        stack
            .receive_tcp_segment(test_route(), &syn_bytes(5555, 80, 2))
            .unwrap();
        assert_eq!(endpoint_rx.try_recv().unwrap().sequence_number(), 2);
        assert_eq!(listener_rx.try_recv().unwrap_err(), TryRecvError::Empty);

        // A different remote port still goes to the listener.
        stack
            .receive_tcp_segment(test_route(), &syn_bytes(5556, 80, 3))
            .unwrap();
        assert_eq!(listener_rx.try_recv().unwrap().id().remote_port, 5556);

        // An unknown destination port goes nowhere.
        stack
            .receive_tcp_segment(test_route(), &syn_bytes(5555, 81, 4))
            .unwrap();
        assert_eq!(listener_rx.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(endpoint_rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn test_listener_family_filters() {
        let (stack, _tx_rx) = Stack::new();
        let (sink, rx) = ChannelSink::pair();

        // A v6-only listener bound on the unspecified address must not see v4 segments.
        stack
            .register_listener(
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                80,
                true,
                None,
                sink.clone(),
            )
            .unwrap();
        stack
            .receive_tcp_segment(test_route(), &syn_bytes(5555, 80, 1))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);

        // Without the flag the same binding is dual-stack and does see them.
        stack.deregister_listener(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 80);
        stack
            .register_listener(
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                80,
                false,
                None,
                sink.clone(),
            )
            .unwrap();
        stack
            .receive_tcp_segment(test_route(), &syn_bytes(5555, 80, 1))
            .unwrap();
        assert!(rx.try_recv().is_ok());

        // The unspecified v4 address matches any local v4 address.
        stack.deregister_listener(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 80);
        stack
            .register_listener(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 80, false, None, sink)
            .unwrap();
        stack
            .receive_tcp_segment(test_route(), &syn_bytes(5555, 80, 1))
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_send_syn_tcp() {
        let (stack, tx_rx) = Stack::new();
        let route = test_route();
        let id = EndpointId {
            local_addr: route.local_addr(),
            local_port: 80,
            remote_addr: route.remote_addr(),
            remote_port: 5555,
        };

        stack
            .send_syn_tcp(
                &route,
                &id,
                Flags::SYN | Flags::ACK,
                1000,
                2001,
                8192,
                Some(1460),
                -1,
            )
            .unwrap();

        let frame = tx_rx.try_recv().unwrap();
        assert_eq!(frame.route, route);

        let s = TcpSegment::from_bytes(&frame.bytes).unwrap();
        assert_eq!(s.source_port(), 80);
        assert_eq!(s.destination_port(), 5555);
        assert_eq!(s.sequence_number(), 1000);
        assert_eq!(s.ack_number(), 2001);
        assert_eq!(s.flags_after_ns(), Flags::SYN | Flags::ACK);
        // Window scale was not advertised.
        assert_eq!(s.parse_syn_options().unwrap().wnd_scale, -1);
    }
}
