//! DNS output driver.
//!
//! Owns the UDP socket to the upstream resolver, wraps tunnel packets in
//! queries (rotating through the configured carrier record types), and
//! unwraps answer payloads. Wire errors never propagate out of the send
//! and receive paths: a lost or malformed exchange is recovered by the
//! session engine's retransmission timer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use log::{debug, trace, warn};
use rand::Rng;
use tokio::net::UdpSocket;

use crate::carrier;
use crate::dns::{Message, Name, RecordType};
use crate::tunnel::{self, Packet};
use crate::Error;

/// Room a MSG body needs beyond its data: tunnel header plus seq/ack.
const MSG_OVERHEAD: usize = tunnel::HEADER_LEN + 4;

pub struct DnsDriver {
    socket: UdpSocket,
    domain: Name,
    record_types: Vec<RecordType>,
    next_type: usize,
    /// Query id of the outstanding exchange; replies to anything else are
    /// stale and dropped.
    outstanding: Option<u16>,
}

impl DnsDriver {
    /// Bind an ephemeral UDP socket and connect it to the resolver, so
    /// ICMP unreachables surface as `recv` errors.
    pub async fn connect(
        server: SocketAddr,
        domain: Name,
        record_types: Vec<RecordType>,
    ) -> Result<Self, Error> {
        let bind_ip: IpAddr = if server.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let bind_addr = SocketAddr::new(bind_ip, 0);
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server).await?;
        debug!("UDP socket connected to {}", server);

        Ok(DnsDriver {
            socket,
            domain,
            record_types,
            next_type: 0,
            outstanding: None,
        })
    }

    pub fn domain(&self) -> &Name {
        &self.domain
    }

    /// Largest MSG data slice whose encoded query name fits 255 bytes.
    pub fn max_data(&self) -> usize {
        carrier::max_payload(&self.domain).saturating_sub(MSG_OVERHEAD)
    }

    /// Wrap one tunnel packet in a DNS query and send it.
    ///
    /// Every call uses a fresh query id and salt label, including
    /// retransmissions of the same tunnel packet: that is what defeats
    /// resolver caching. Send failures are logged and left to the
    /// retransmission timer.
    pub async fn send_packet(&mut self, packet: &Packet) -> Result<(), Error> {
        let payload = packet.encode();
        let qtype = self.record_types[self.next_type % self.record_types.len()];
        self.next_type = self.next_type.wrapping_add(1);

        let salt = carrier::random_salt();
        let qname = carrier::encode_query_name(&payload, &self.domain, &salt)?;
        let id: u16 = rand::thread_rng().gen();
        let query = Message::query(id, qname, qtype);
        self.outstanding = Some(id);

        trace!(
            "query {:04x}: {} bytes of tunnel payload as {}",
            id,
            payload.len(),
            qtype
        );
        if let Err(e) = self.socket.send(&query.encode()).await {
            warn!("UDP send failed ({}); waiting for the retransmit timer", e);
        }
        Ok(())
    }

    /// Await one datagram and unwrap the tunnel payload from it.
    ///
    /// Returns `None` for anything that is not a well-formed answer to the
    /// outstanding query; per the error policy such traffic is dropped
    /// silently and the retransmission timer recovers.
    pub async fn recv_packet(&mut self, buf: &mut [u8]) -> Option<Vec<u8>> {
        let n = match self.socket.recv(buf).await {
            Ok(n) => n,
            Err(e) => {
                // Connected sockets surface ICMP unreachable here.
                debug!("UDP recv failed: {}", e);
                return None;
            }
        };

        let message = match Message::decode(&buf[..n]) {
            Ok(m) => m,
            Err(e) => {
                debug!("dropping undecodable response: {}", e);
                return None;
            }
        };
        if !message.is_response() || Some(message.id) != self.outstanding {
            debug!("dropping stale response {:04x}", message.id);
            return None;
        }
        if message.rcode() != 0 {
            debug!("dropping response with rcode {}", message.rcode());
            return None;
        }

        match carrier::decode_answer(&message.answers, &self.domain) {
            Ok(payload) => {
                trace!("response {:04x}: {} bytes of tunnel payload", message.id, payload.len());
                Some(payload)
            }
            Err(e) => {
                debug!("dropping response with bad carrier: {}", e);
                None
            }
        }
    }
}
