//! IP/UDP packet translation between the virtual device and real sockets.
//!
//! Outbound: parse the raw IP packet the device intercepted, pull out the
//! UDP payload and, for DNS, the queried host. Inbound: rebuild a complete
//! IP/UDP frame around the reply with source and destination swapped and
//! every length and checksum recomputed — the system stack silently drops
//! anything less.

use crate::error::EngineError;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::serialize::binary::BinDecodable;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv6Address, Ipv6Packet, UdpPacket,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::trace;

pub const DNS_PORT: u16 = 53;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
const DNS_HEADER_LEN: usize = 12;
const HOP_LIMIT: u8 = 64;

/// Cap on cached question sections between maintenance sweeps.
const QNAME_CACHE_MAX: usize = 4096;

/// Addressing of the inbound packet that triggered a forward. An owned
/// copy survives in the forwarding table until the reply is rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

/// Maps in-tunnel resolver addresses to where the query should really go,
/// used when DNS is redirected to a forced resolver (encrypted DNS proxy).
#[derive(Debug, Clone, Default)]
pub struct DnsRedirect {
    entries: Vec<(IpAddr, SocketAddr)>,
}

impl DnsRedirect {
    pub fn new(entries: Vec<(IpAddr, SocketAddr)>) -> Self {
        Self { entries }
    }

    /// The real destination for a query addressed to `dst`. Addresses not
    /// in the table pass through unchanged.
    pub fn resolve(&self, dst: SocketAddr) -> SocketAddr {
        self.entries
            .iter()
            .find(|(mapped, _)| *mapped == dst.ip())
            .map(|(_, real)| *real)
            .unwrap_or(dst)
    }
}

/// A parsed DNS query, ready for the host filter.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub envelope: Envelope,
    /// Destination after any forced-resolver redirect.
    pub target: SocketAddr,
    pub payload: Vec<u8>,
    /// Lowercased queried host.
    pub host: String,
    /// DNS transaction id; the health monitor's sequence id.
    pub sequence: u16,
}

/// Non-DNS UDP, forwarded without filtering.
#[derive(Debug, Clone)]
pub struct PlainDatagram {
    pub envelope: Envelope,
    pub payload: Vec<u8>,
}

/// What came out of one device read.
#[derive(Debug)]
pub enum DeviceEvent {
    Dns(DnsQuery),
    Udp(PlainDatagram),
    /// Non-UDP, malformed, or empty — dropped, loop continues.
    Ignored(&'static str),
}

/// Stateless packet rewriting plus a small owned parse cache.
pub struct PacketTranslator {
    redirect: Option<DnsRedirect>,
    /// Question-section bytes → extracted host. Cleared by `maintain`.
    qname_cache: HashMap<Vec<u8>, Option<String>>,
}

impl PacketTranslator {
    pub fn new(redirect: Option<DnsRedirect>) -> Self {
        Self {
            redirect,
            qname_cache: HashMap::new(),
        }
    }

    /// Classify one raw packet read from the device.
    pub fn from_device(&mut self, frame: &[u8]) -> DeviceEvent {
        let version = match frame.first() {
            Some(byte) => byte >> 4,
            None => return DeviceEvent::Ignored("empty frame"),
        };

        let (src, dst, payload) = match version {
            4 => {
                let ip = match Ipv4Packet::new_checked(frame) {
                    Ok(ip) => ip,
                    Err(_) => return DeviceEvent::Ignored("truncated IPv4 packet"),
                };
                if ip.next_header() != IpProtocol::Udp {
                    return DeviceEvent::Ignored("not UDP");
                }
                let udp = match UdpPacket::new_checked(ip.payload()) {
                    Ok(udp) => udp,
                    Err(_) => return DeviceEvent::Ignored("truncated UDP datagram"),
                };
                let src = SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(ip.src_addr().0)),
                    udp.src_port(),
                );
                let dst = SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(ip.dst_addr().0)),
                    udp.dst_port(),
                );
                (src, dst, udp.payload().to_vec())
            }
            6 => {
                let ip = match Ipv6Packet::new_checked(frame) {
                    Ok(ip) => ip,
                    Err(_) => return DeviceEvent::Ignored("truncated IPv6 packet"),
                };
                if ip.next_header() != IpProtocol::Udp {
                    return DeviceEvent::Ignored("not UDP");
                }
                let udp = match UdpPacket::new_checked(ip.payload()) {
                    Ok(udp) => udp,
                    Err(_) => return DeviceEvent::Ignored("truncated UDP datagram"),
                };
                let src = SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(ip.src_addr().0)),
                    udp.src_port(),
                );
                let dst = SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(ip.dst_addr().0)),
                    udp.dst_port(),
                );
                (src, dst, udp.payload().to_vec())
            }
            _ => return DeviceEvent::Ignored("not IP"),
        };

        if payload.is_empty() {
            // Some apps use empty UDP datagrams for keepalive; nothing to
            // forward, nothing to answer.
            return DeviceEvent::Ignored("empty UDP payload");
        }

        let envelope = Envelope { src, dst };

        if dst.port() == DNS_PORT {
            if let Some(host) = self.question_host(&payload) {
                let sequence = u16::from_be_bytes([payload[0], payload[1]]);
                let target = match &self.redirect {
                    Some(redirect) => redirect.resolve(dst),
                    None => dst,
                };
                return DeviceEvent::Dns(DnsQuery {
                    envelope,
                    target,
                    payload,
                    host,
                    sequence,
                });
            }
            trace!("Unparseable query to port 53, forwarding as-is");
        }

        DeviceEvent::Udp(PlainDatagram { envelope, payload })
    }

    /// Synthesize the NXDOMAIN answer for a blocked query, framed and
    /// addressed back at the sender.
    pub fn blocked_response(&self, query: &DnsQuery) -> Result<Vec<u8>, EngineError> {
        let request = Message::from_bytes(&query.payload)
            .map_err(|e| EngineError::Malformed(e.to_string()))?;

        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(request.recursion_desired())
            .set_recursion_available(true)
            .set_response_code(ResponseCode::NXDomain);
        for question in request.queries() {
            response.add_query(question.clone());
        }

        let bytes = response
            .to_vec()
            .map_err(|e| EngineError::Malformed(e.to_string()))?;
        self.to_device(&bytes, &query.envelope)
    }

    /// Build the reply frame for a payload received from the real network:
    /// the origin envelope with source and destination swapped, lengths
    /// and checksums recomputed.
    pub fn to_device(&self, payload: &[u8], envelope: &Envelope) -> Result<Vec<u8>, EngineError> {
        match (envelope.src.ip(), envelope.dst.ip()) {
            (IpAddr::V4(origin_src), IpAddr::V4(origin_dst)) => Ok(build_ipv4_reply(
                origin_dst,
                envelope.dst.port(),
                origin_src,
                envelope.src.port(),
                payload,
            )),
            (IpAddr::V6(origin_src), IpAddr::V6(origin_dst)) => Ok(build_ipv6_reply(
                origin_dst,
                envelope.dst.port(),
                origin_src,
                envelope.src.port(),
                payload,
            )),
            _ => Err(EngineError::Malformed(
                "mixed address families in envelope".into(),
            )),
        }
    }

    /// Periodic housekeeping; called by the loop every fixed number of
    /// iterations.
    pub fn maintain(&mut self) {
        if !self.qname_cache.is_empty() {
            trace!("Clearing {} cached question sections", self.qname_cache.len());
            self.qname_cache.clear();
        }
    }

    fn question_host(&mut self, payload: &[u8]) -> Option<String> {
        if payload.len() < DNS_HEADER_LEN {
            return None;
        }
        let key = &payload[DNS_HEADER_LEN..];
        if let Some(cached) = self.qname_cache.get(key) {
            return cached.clone();
        }

        let host = Message::from_bytes(payload).ok().and_then(|message| {
            message.queries().first().map(|query| {
                query
                    .name()
                    .to_ascii()
                    .trim_end_matches('.')
                    .to_ascii_lowercase()
            })
        });

        if self.qname_cache.len() < QNAME_CACHE_MAX {
            self.qname_cache.insert(key.to_vec(), host.clone());
        }
        host
    }
}

fn build_ipv4_reply(
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    let mut frame = vec![0u8; total];
    let src = Ipv4Address(src_ip.octets());
    let dst = Ipv4Address(dst_ip.octets());

    {
        let mut ip = Ipv4Packet::new_unchecked(&mut frame[..]);
        ip.set_version(4);
        ip.set_header_len(IPV4_HEADER_LEN as u8);
        ip.set_total_len(total as u16);
        ip.set_ident(0);
        ip.set_dont_frag(true);
        ip.set_more_frags(false);
        ip.set_frag_offset(0);
        ip.set_hop_limit(HOP_LIMIT);
        ip.set_next_header(IpProtocol::Udp);
        ip.set_src_addr(src);
        ip.set_dst_addr(dst);

        fill_udp(
            ip.payload_mut(),
            src_port,
            dst_port,
            payload,
            &IpAddress::Ipv4(src),
            &IpAddress::Ipv4(dst),
        );

        ip.fill_checksum();
    }

    frame
}

fn build_ipv6_reply(
    src_ip: Ipv6Addr,
    src_port: u16,
    dst_ip: Ipv6Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total = IPV6_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    let mut frame = vec![0u8; total];
    let src = Ipv6Address(src_ip.octets());
    let dst = Ipv6Address(dst_ip.octets());

    {
        let mut ip = Ipv6Packet::new_unchecked(&mut frame[..]);
        ip.set_version(6);
        ip.set_traffic_class(0);
        ip.set_flow_label(0);
        ip.set_payload_len((UDP_HEADER_LEN + payload.len()) as u16);
        ip.set_next_header(IpProtocol::Udp);
        ip.set_hop_limit(HOP_LIMIT);
        ip.set_src_addr(src);
        ip.set_dst_addr(dst);

        fill_udp(
            ip.payload_mut(),
            src_port,
            dst_port,
            payload,
            &IpAddress::Ipv6(src),
            &IpAddress::Ipv6(dst),
        );
    }

    frame
}

fn fill_udp(
    buf: &mut [u8],
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
    src: &IpAddress,
    dst: &IpAddress,
) {
    let mut udp = UdpPacket::new_unchecked(buf);
    udp.set_src_port(src_port);
    udp.set_dst_port(dst_port);
    udp.set_len((UDP_HEADER_LEN + payload.len()) as u16);
    udp.payload_mut().copy_from_slice(payload);
    udp.fill_checksum(src, dst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    /// A syntactically valid DNS A query for `host` with the given id.
    fn dns_query_bytes(host: &str, id: u16) -> Vec<u8> {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        message.add_query(Query::query(
            Name::from_str(host).unwrap(),
            RecordType::A,
        ));
        message.to_vec().unwrap()
    }

    fn ipv4_udp_frame(
        src: (Ipv4Addr, u16),
        dst: (Ipv4Addr, u16),
        payload: &[u8],
    ) -> Vec<u8> {
        build_ipv4_reply(src.0, src.1, dst.0, dst.1, payload)
    }

    #[test]
    fn test_parse_ipv4_dns_query() {
        let mut translator = PacketTranslator::new(None);
        let payload = dns_query_bytes("Tracker.Example.com.", 0x1234);
        let frame = ipv4_udp_frame(
            (Ipv4Addr::new(10, 0, 0, 2), 40000),
            (Ipv4Addr::new(9, 9, 9, 9), 53),
            &payload,
        );

        match translator.from_device(&frame) {
            DeviceEvent::Dns(query) => {
                assert_eq!(query.host, "tracker.example.com");
                assert_eq!(query.sequence, 0x1234);
                assert_eq!(query.target.port(), 53);
                assert_eq!(query.envelope.src.port(), 40000);
            }
            other => panic!("expected DNS query, got {:?}", other),
        }
    }

    #[test]
    fn test_redirect_rewrites_dns_target() {
        let proxy: SocketAddr = "127.0.0.1:5353".parse().unwrap();
        let redirect = DnsRedirect::new(vec![(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), proxy)]);
        let mut translator = PacketTranslator::new(Some(redirect));

        let payload = dns_query_bytes("example.com.", 7);
        let frame = ipv4_udp_frame(
            (Ipv4Addr::new(10, 0, 0, 2), 40000),
            (Ipv4Addr::new(9, 9, 9, 9), 53),
            &payload,
        );

        match translator.from_device(&frame) {
            DeviceEvent::Dns(query) => {
                assert_eq!(query.target, proxy);
                // The envelope keeps the original addressing for the reply.
                assert_eq!(query.envelope.dst.ip(), IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)));
            }
            other => panic!("expected DNS query, got {:?}", other),
        }
    }

    #[test]
    fn test_non_udp_is_ignored() {
        let mut translator = PacketTranslator::new(None);
        let mut frame = ipv4_udp_frame(
            (Ipv4Addr::new(10, 0, 0, 2), 40000),
            (Ipv4Addr::new(1, 1, 1, 1), 53),
            b"payload",
        );
        // Flip the protocol to TCP.
        frame[9] = 6;
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut frame[..]);
            ip.fill_checksum();
        }

        assert!(matches!(
            translator.from_device(&frame),
            DeviceEvent::Ignored("not UDP")
        ));
    }

    #[test]
    fn test_empty_udp_payload_is_dropped() {
        let mut translator = PacketTranslator::new(None);
        let frame = ipv4_udp_frame(
            (Ipv4Addr::new(10, 0, 0, 2), 40000),
            (Ipv4Addr::new(1, 1, 1, 1), 443),
            &[],
        );

        assert!(matches!(
            translator.from_device(&frame),
            DeviceEvent::Ignored("empty UDP payload")
        ));
    }

    #[test]
    fn test_garbage_is_ignored() {
        let mut translator = PacketTranslator::new(None);

        assert!(matches!(
            translator.from_device(&[]),
            DeviceEvent::Ignored(_)
        ));
        assert!(matches!(
            translator.from_device(&[0x45, 0x00, 0x01]),
            DeviceEvent::Ignored(_)
        ));
        assert!(matches!(
            translator.from_device(&[0xff; 40]),
            DeviceEvent::Ignored("not IP")
        ));
    }

    #[test]
    fn test_ipv4_round_trip_swaps_addressing_and_checksums() {
        let mut translator = PacketTranslator::new(None);
        let payload = dns_query_bytes("example.com.", 99);
        let query_frame = ipv4_udp_frame(
            (Ipv4Addr::new(10, 0, 0, 2), 41000),
            (Ipv4Addr::new(1, 1, 1, 1), 53),
            &payload,
        );

        let envelope = match translator.from_device(&query_frame) {
            DeviceEvent::Dns(query) => query.envelope,
            other => panic!("expected DNS query, got {:?}", other),
        };

        let response_payload = b"response bytes";
        let reply = translator.to_device(response_payload, &envelope).unwrap();

        let ip = Ipv4Packet::new_checked(&reply[..]).unwrap();
        assert!(ip.verify_checksum());
        assert_eq!(Ipv4Addr::from(ip.src_addr().0), Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(Ipv4Addr::from(ip.dst_addr().0), Ipv4Addr::new(10, 0, 0, 2));

        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.src_port(), 53);
        assert_eq!(udp.dst_port(), 41000);
        assert_eq!(udp.payload(), response_payload);
        assert!(udp.verify_checksum(
            &IpAddress::Ipv4(ip.src_addr()),
            &IpAddress::Ipv4(ip.dst_addr())
        ));
    }

    #[test]
    fn test_ipv6_reply_addressing() {
        let translator = PacketTranslator::new(None);
        let src: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let dst: Ipv6Addr = "2620:fe::fe".parse().unwrap();
        let envelope = Envelope {
            src: SocketAddr::new(IpAddr::V6(src), 42000),
            dst: SocketAddr::new(IpAddr::V6(dst), 53),
        };

        let reply = translator.to_device(b"answer", &envelope).unwrap();

        let ip = Ipv6Packet::new_checked(&reply[..]).unwrap();
        assert_eq!(Ipv6Addr::from(ip.src_addr().0), dst);
        assert_eq!(Ipv6Addr::from(ip.dst_addr().0), src);

        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.src_port(), 53);
        assert_eq!(udp.dst_port(), 42000);
        assert!(udp.verify_checksum(
            &IpAddress::Ipv6(ip.src_addr()),
            &IpAddress::Ipv6(ip.dst_addr())
        ));
    }

    #[test]
    fn test_blocked_response_is_nxdomain_to_sender() {
        let mut translator = PacketTranslator::new(None);
        let payload = dns_query_bytes("ads.example.com.", 0xbeef);
        let frame = ipv4_udp_frame(
            (Ipv4Addr::new(10, 0, 0, 2), 43210),
            (Ipv4Addr::new(1, 1, 1, 1), 53),
            &payload,
        );

        let query = match translator.from_device(&frame) {
            DeviceEvent::Dns(query) => query,
            other => panic!("expected DNS query, got {:?}", other),
        };

        let reply = translator.blocked_response(&query).unwrap();

        let ip = Ipv4Packet::new_checked(&reply[..]).unwrap();
        assert_eq!(Ipv4Addr::from(ip.dst_addr().0), Ipv4Addr::new(10, 0, 0, 2));
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.dst_port(), 43210);

        let message = Message::from_bytes(udp.payload()).unwrap();
        assert_eq!(message.id(), 0xbeef);
        assert_eq!(message.message_type(), MessageType::Response);
        assert_eq!(message.response_code(), ResponseCode::NXDomain);
        assert_eq!(message.queries().len(), 1);
    }

    #[test]
    fn test_maintain_clears_cache() {
        let mut translator = PacketTranslator::new(None);
        let payload = dns_query_bytes("example.com.", 1);
        let frame = ipv4_udp_frame(
            (Ipv4Addr::new(10, 0, 0, 2), 40000),
            (Ipv4Addr::new(1, 1, 1, 1), 53),
            &payload,
        );

        translator.from_device(&frame);
        assert!(!translator.qname_cache.is_empty());

        translator.maintain();
        assert!(translator.qname_cache.is_empty());
    }
}
