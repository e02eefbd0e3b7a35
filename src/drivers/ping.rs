//! Ping probe: a sessionless liveness check of the tunnel server.
//!
//! One PING packet goes out and is retransmitted on the usual deadline
//! until the matching echo comes back or the retry budget runs out. The
//! core drives the probe directly; there is no session and no stream.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::session::{DEFAULT_RETRY_BUDGET, DEFAULT_RTO};
use crate::tunnel::{Body, Packet};

const PING_ID_LEN: usize = 6;
const PING_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

pub struct PingProbe {
    packet: Packet,
    ping_id: String,
    deadline: Instant,
    retries: u32,
    rto: Duration,
    retry_budget: u32,
}

impl PingProbe {
    pub fn new(now: Instant) -> Self {
        let mut rng = rand::thread_rng();
        let ping_id: String = (0..PING_ID_LEN)
            .map(|_| PING_ALPHABET[rng.gen_range(0..PING_ALPHABET.len())] as char)
            .collect();
        let packet = Packet {
            packet_id: rng.gen(),
            session_id: 0,
            body: Body::Ping {
                ping_id: ping_id.clone(),
            },
        };
        PingProbe {
            packet,
            ping_id,
            deadline: now + DEFAULT_RTO,
            retries: 0,
            rto: DEFAULT_RTO,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn ping_id(&self) -> &str {
        &self.ping_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// True when `packet` is the echo of our probe.
    pub fn matches(&self, packet: &Packet) -> bool {
        packet.packet_id == self.packet.packet_id
            && matches!(&packet.body, Body::Ping { ping_id } if *ping_id == self.ping_id)
    }

    /// Retransmit decision: the packet to resend, or `None` once the
    /// budget is exhausted.
    pub fn poll_retransmit(&mut self, now: Instant) -> Option<&Packet> {
        if now < self.deadline {
            return None;
        }
        if self.retries >= self.retry_budget {
            return None;
        }
        self.retries += 1;
        self.deadline = now + self.rto;
        Some(&self.packet)
    }

    pub fn exhausted(&self) -> bool {
        self.retries >= self.retry_budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_matches() {
        let t = Instant::now();
        let probe = PingProbe::new(t);
        let echo = probe.packet().clone();
        assert!(probe.matches(&echo));

        let mut wrong_id = echo.clone();
        wrong_id.packet_id = wrong_id.packet_id.wrapping_add(1);
        assert!(!probe.matches(&wrong_id));

        let wrong_body = Packet {
            packet_id: echo.packet_id,
            session_id: 0,
            body: Body::Ping {
                ping_id: "zzzzzz".to_string(),
            },
        };
        assert!(!probe.matches(&wrong_body));
    }

    #[test]
    fn test_retransmit_budget() {
        let mut t = Instant::now();
        let mut probe = PingProbe::new(t);

        assert!(probe.poll_retransmit(t).is_none());
        for _ in 0..DEFAULT_RETRY_BUDGET {
            t += DEFAULT_RTO;
            assert!(probe.poll_retransmit(t).is_some());
        }
        t += DEFAULT_RTO;
        assert!(probe.poll_retransmit(t).is_none());
        assert!(probe.exhausted());
    }
}
