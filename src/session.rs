//! Session engine.
//!
//! One logical byte stream between this client and the tunnel server,
//! carried one packet at a time: at most one unacknowledged packet is in
//! flight, retransmitted on a 1 s deadline until the retry budget runs out.
//!
//! The engine is a plain state machine. Time comes in as [`Instant`]
//! arguments, wire traffic comes out as [`Output::Transmit`] values; the
//! reactor owns the sockets and timers. That keeps every protocol rule
//! testable without I/O.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;

use crate::tunnel::{
    Body, Packet, OPT_CHUNKED_DOWNLOAD, OPT_COMMAND, OPT_DOWNLOAD, OPT_NAME,
};

/// Retransmission timeout.
pub const DEFAULT_RTO: Duration = Duration::from_millis(1000);

/// Retransmissions allowed before the session is forcibly closed.
pub const DEFAULT_RETRY_BUDGET: u32 = 20;

/// Close reason reported when the retry budget runs out.
pub const REASON_RETRY_LIMIT: &str = "retry limit";

/// Forward half of the 16-bit sequence space. A value is "ahead" of
/// another when it is less than this far forward of it.
const SEQ_WINDOW: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Established,
    Shutdown,
    Closed,
}

/// Per-session knobs collected from the CLI before `start`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: Option<String>,
    pub download: Option<String>,
    pub chunk: Option<u32>,
    pub command: bool,
    /// Largest data slice per MSG, derived from the query-name budget.
    pub max_data: usize,
    pub rto: Duration,
    pub retry_budget: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            name: None,
            download: None,
            chunk: None,
            command: false,
            max_data: 64,
            rto: DEFAULT_RTO,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

/// What the engine wants done, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Hand this packet to the DNS driver (fresh query id and salt per send).
    Transmit(Packet),
    /// In-order stream bytes for the input driver.
    Deliver(Bytes),
    /// The SYN reply arrived.
    Established,
    /// The peer ended the stream; deliver EOF upstream.
    RemoteClosed,
    /// The session is gone; release its resources.
    Closed { reason: String },
}

#[derive(Debug)]
struct InFlight {
    packet: Packet,
    /// Stream bytes the packet carries (0 for SYN, FIN, heartbeats).
    data_len: usize,
    deadline: Instant,
    retries: u32,
}

pub struct Session {
    id: u16,
    state: State,
    my_seq: u16,
    their_seq: u16,
    outgoing: VecDeque<u8>,
    options: u16,
    name: Option<String>,
    download: Option<String>,
    next_chunk: u32,
    chunked: bool,
    max_data: usize,
    rto: Duration,
    retry_budget: u32,
    in_flight: Option<InFlight>,
    next_packet_id: u16,
    close_reason: Option<String>,
}

impl Session {
    /// Deterministic constructor; tests pick the id and initial sequence.
    pub fn new(id: u16, initial_seq: u16, config: SessionConfig) -> Self {
        let mut options = 0u16;
        if config.name.is_some() {
            options |= OPT_NAME;
        }
        if config.download.is_some() {
            options |= OPT_DOWNLOAD;
            if config.chunk.is_some() {
                options |= OPT_CHUNKED_DOWNLOAD;
            }
        }
        if config.command {
            options |= OPT_COMMAND;
        }

        Session {
            id,
            state: State::New,
            my_seq: initial_seq,
            their_seq: 0,
            outgoing: VecDeque::new(),
            options,
            name: config.name,
            download: config.download,
            next_chunk: config.chunk.unwrap_or(0),
            chunked: options & OPT_CHUNKED_DOWNLOAD != 0,
            max_data: config.max_data,
            rto: config.rto,
            retry_budget: config.retry_budget,
            in_flight: None,
            next_packet_id: 0,
            close_reason: None,
        }
    }

    /// A session with random id, initial sequence, and packet-id origin.
    pub fn open(config: SessionConfig) -> Self {
        let mut rng = rand::thread_rng();
        let mut session = Session::new(rng.gen(), rng.gen(), config);
        session.next_packet_id = rng.gen();
        session
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> u16 {
        self.options
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Deadline of the outstanding packet, for the reactor's timer.
    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|f| f.deadline)
    }

    fn take_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = id.wrapping_add(1);
        id
    }

    fn arm(&mut self, packet: Packet, data_len: usize, now: Instant) -> Packet {
        self.in_flight = Some(InFlight {
            packet: packet.clone(),
            data_len,
            deadline: now + self.rto,
            retries: 0,
        });
        packet
    }

    fn fin_packet(&mut self, reason: String) -> Packet {
        Packet {
            packet_id: self.take_packet_id(),
            session_id: self.id,
            body: Body::Fin { reason },
        }
    }

    /// Send the SYN and arm its retransmission timer.
    pub fn start(&mut self, now: Instant) -> Packet {
        let packet = Packet {
            packet_id: self.take_packet_id(),
            session_id: self.id,
            body: Body::Syn {
                seq: self.my_seq,
                options: self.options,
                name: self.name.clone(),
                download: self.download.clone(),
            },
        };
        self.arm(packet, 0, now)
    }

    /// Queue stream bytes for transmission. Dropped once closing.
    pub fn queue(&mut self, data: &[u8]) {
        if matches!(self.state, State::Shutdown | State::Closed) {
            return;
        }
        self.outgoing.extend(data);
    }

    pub fn queued(&self) -> usize {
        self.outgoing.len()
    }

    /// Begin a local close; the FIN goes out once the buffer drains.
    pub fn close(&mut self, reason: &str) {
        if matches!(self.state, State::Shutdown | State::Closed) {
            return;
        }
        self.state = State::Shutdown;
        self.close_reason = Some(reason.to_string());
    }

    /// The transmit decision point.
    ///
    /// Called on the heartbeat tick (`heartbeat = true`), when the
    /// retransmission deadline fires, and after anything that may unblock a
    /// send (new data queued, an ack processed). With a packet in flight it
    /// either waits or retransmits; otherwise it forms the next packet.
    /// The idle keepalive MSG is only emitted on the tick.
    pub fn poll_transmit(&mut self, now: Instant, heartbeat: bool) -> Vec<Output> {
        let mut out = Vec::new();
        if self.state == State::Closed {
            return out;
        }

        if let Some(flight) = &mut self.in_flight {
            if now < flight.deadline {
                return out;
            }
            if flight.retries >= self.retry_budget {
                self.state = State::Closed;
                self.in_flight = None;
                out.push(Output::Closed {
                    reason: REASON_RETRY_LIMIT.to_string(),
                });
                return out;
            }
            flight.retries += 1;
            flight.deadline = now + self.rto;
            // Identical tunnel bytes; the DNS driver supplies a fresh query
            // id and salt on every send.
            out.push(Output::Transmit(flight.packet.clone()));
            return out;
        }

        match self.state {
            State::New | State::Closed => out,
            State::Established if self.chunked => {
                let packet = Packet {
                    packet_id: self.take_packet_id(),
                    session_id: self.id,
                    body: Body::ChunkedMsg {
                        chunk: self.next_chunk,
                        data: Bytes::new(),
                    },
                };
                out.push(Output::Transmit(self.arm(packet, 0, now)));
                out
            }
            State::Established | State::Shutdown => {
                if !self.outgoing.is_empty() {
                    let n = self.max_data.min(self.outgoing.len());
                    let data: Vec<u8> = self.outgoing.iter().take(n).copied().collect();
                    let packet = Packet {
                        packet_id: self.take_packet_id(),
                        session_id: self.id,
                        body: Body::Msg {
                            seq: self.my_seq,
                            ack: self.their_seq,
                            data: Bytes::from(data),
                        },
                    };
                    out.push(Output::Transmit(self.arm(packet, n, now)));
                } else if self.state == State::Shutdown {
                    let reason = self.close_reason.clone().unwrap_or_default();
                    let packet = self.fin_packet(reason);
                    out.push(Output::Transmit(self.arm(packet, 0, now)));
                } else if heartbeat {
                    // Idle poll so the server can push queued data down.
                    let packet = Packet {
                        packet_id: self.take_packet_id(),
                        session_id: self.id,
                        body: Body::Msg {
                            seq: self.my_seq,
                            ack: self.their_seq,
                            data: Bytes::new(),
                        },
                    };
                    out.push(Output::Transmit(self.arm(packet, 0, now)));
                }
                out
            }
        }
    }

    /// The receive policy, applied to one decoded packet for this session.
    pub fn handle(&mut self, packet: Packet, _now: Instant) -> Vec<Output> {
        let mut out = Vec::new();
        if self.state == State::Closed || packet.session_id != self.id {
            return out;
        }

        match packet.body {
            Body::Syn { seq, .. } => {
                if self.state == State::New {
                    if !self.pairs_with_flight(packet.packet_id) {
                        return out;
                    }
                    self.their_seq = seq;
                    self.state = State::Established;
                    self.in_flight = None;
                    out.push(Output::Established);
                } else {
                    // A second SYN mid-session is a protocol error.
                    let fin = self.fin_packet("unexpected SYN".to_string());
                    self.state = State::Closed;
                    self.in_flight = None;
                    out.push(Output::Transmit(fin));
                    out.push(Output::Closed {
                        reason: "unexpected SYN".to_string(),
                    });
                }
                out
            }

            Body::Msg { seq, ack, data } => {
                if self.state == State::New || !self.pairs_with_flight(packet.packet_id) {
                    return out;
                }
                if !self.process_ack(ack) {
                    return out;
                }
                self.process_data(seq, data, &mut out);
                out
            }

            Body::ChunkedMsg { chunk, data } => {
                if self.state == State::New || !self.pairs_with_flight(packet.packet_id) {
                    return out;
                }
                if chunk != self.next_chunk {
                    // Stale chunk; the timer re-requests the right one.
                    return out;
                }
                self.in_flight = None;
                if data.is_empty() {
                    out.push(Output::RemoteClosed);
                    self.close("download complete");
                } else {
                    self.next_chunk += 1;
                    out.push(Output::Deliver(data));
                }
                out
            }

            Body::Fin { reason } => {
                self.in_flight = None;
                if self.state == State::Shutdown {
                    // Our FIN was answered; the shutdown is complete.
                    self.state = State::Closed;
                    let reason = self.close_reason.take().unwrap_or(reason);
                    out.push(Output::Closed { reason });
                } else {
                    // Peer-initiated close: EOF upstream, echo the FIN.
                    self.state = State::Closed;
                    out.push(Output::RemoteClosed);
                    let fin = self.fin_packet(String::new());
                    out.push(Output::Transmit(fin));
                    out.push(Output::Closed { reason });
                }
                out
            }

            // Sessions never carry pings.
            Body::Ping { .. } => out,
        }
    }

    /// A reply is only valid when it echoes the outstanding packet id.
    fn pairs_with_flight(&self, packet_id: u16) -> bool {
        match &self.in_flight {
            Some(flight) => flight.packet.packet_id == packet_id,
            None => false,
        }
    }

    /// Apply the ack field. Returns false when the ack is outside what the
    /// outstanding packet could have produced (stale or bogus reply).
    fn process_ack(&mut self, ack: u16) -> bool {
        let flight_len = match &self.in_flight {
            Some(flight) => flight.data_len,
            None => return false,
        };
        let delta = ack.wrapping_sub(self.my_seq) as usize;
        if delta > flight_len {
            return false;
        }
        if delta > 0 {
            self.outgoing.drain(..delta);
            self.my_seq = ack;
            // Fully or partially acknowledged: either way the exchange is
            // over; any remainder is still queued and goes out re-sequenced.
            self.in_flight = None;
        } else if flight_len == 0 {
            // A zero-length packet needs no ack progress to discharge.
            self.in_flight = None;
        }
        true
    }

    /// Apply the data field: deliver in-order bytes, drop duplicates, hold
    /// back nothing on gaps (the ack we send next tells the server where we
    /// are).
    fn process_data(&mut self, seq: u16, data: Bytes, out: &mut Vec<Output>) {
        let n = data.len();
        if n == 0 {
            return;
        }
        if seq == self.their_seq {
            self.their_seq = self.their_seq.wrapping_add(n as u16);
            out.push(Output::Deliver(data));
            return;
        }
        let behind = self.their_seq.wrapping_sub(seq);
        if behind < SEQ_WINDOW && n <= behind as usize {
            // Duplicate of bytes already received; acked, not re-delivered.
            return;
        }
        // Gap (or a straddling duplicate): ignore, keep our ack where it is.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    fn establish(session: &mut Session, server_seq: u16) {
        let t = now();
        let syn = session.start(t);
        let reply = Packet {
            packet_id: syn.packet_id,
            session_id: session.id(),
            body: Body::Syn {
                seq: server_seq,
                options: 0,
                name: None,
                download: None,
            },
        };
        let out = session.handle(reply, t);
        assert!(out.contains(&Output::Established));
        assert_eq!(session.state(), State::Established);
    }

    fn transmit(session: &mut Session, t: Instant) -> Packet {
        let out = session.poll_transmit(t, false);
        match out.into_iter().next() {
            Some(Output::Transmit(pkt)) => pkt,
            other => panic!("expected a transmit, got {:?}", other),
        }
    }

    fn msg_reply(to: &Packet, session_id: u16, seq: u16, ack: u16, data: &[u8]) -> Packet {
        Packet {
            packet_id: to.packet_id,
            session_id,
            body: Body::Msg {
                seq,
                ack,
                data: Bytes::copy_from_slice(data),
            },
        }
    }

    #[test]
    fn test_handshake_then_echo() {
        let mut session = Session::new(0xA1B2, 0x1000, SessionConfig::default());
        establish(&mut session, 0x7000);

        session.queue(b"hi");
        let t = now();
        let msg = transmit(&mut session, t);
        match &msg.body {
            Body::Msg { seq, ack, data } => {
                assert_eq!(*seq, 0x1000);
                assert_eq!(*ack, 0x7000);
                assert_eq!(&data[..], b"hi");
            }
            other => panic!("expected MSG, got {:?}", other),
        }

        let reply = msg_reply(&msg, 0xA1B2, 0x7000, 0x1002, b"HI");
        let out = session.handle(reply, t);
        assert_eq!(out, vec![Output::Deliver(Bytes::from_static(b"HI"))]);
        assert_eq!(session.my_seq, 0x1002);
        assert_eq!(session.their_seq, 0x7002);
        assert!(!session.in_flight());
        assert_eq!(session.queued(), 0);
    }

    #[test]
    fn test_loss_and_retransmit() {
        let mut session = Session::new(1, 0x1000, SessionConfig::default());
        establish(&mut session, 0x7000);

        session.queue(b"hi");
        let t = now();
        let first = transmit(&mut session, t);

        // Deadline not reached: stop-and-wait sends nothing.
        assert!(session.poll_transmit(t, true).is_empty());

        // Reply lost; deadline passes.
        let later = t + DEFAULT_RTO;
        let out = session.poll_transmit(later, false);
        assert_eq!(out, vec![Output::Transmit(first.clone())]);

        // The retransmission is byte-identical at the tunnel layer.
        let retrans = match &out[0] {
            Output::Transmit(p) => p,
            _ => unreachable!(),
        };
        assert_eq!(retrans.encode(), first.encode());

        // Eventual ack drains the buffer.
        let reply = msg_reply(&first, 1, 0x7000, 0x1002, b"");
        session.handle(reply, later);
        assert_eq!(session.queued(), 0);
        assert!(!session.in_flight());
    }

    #[test]
    fn test_retry_budget_exhaustion() {
        let config = SessionConfig {
            retry_budget: 3,
            ..Default::default()
        };
        let mut session = Session::new(1, 0, config);
        let mut t = now();
        session.start(t);

        for _ in 0..3 {
            t += DEFAULT_RTO;
            let out = session.poll_transmit(t, false);
            assert!(matches!(out[0], Output::Transmit(_)));
        }
        t += DEFAULT_RTO;
        let out = session.poll_transmit(t, false);
        assert_eq!(
            out,
            vec![Output::Closed {
                reason: "retry limit".to_string()
            }]
        );
        assert_eq!(session.state(), State::Closed);
    }

    fn heartbeat(session: &mut Session, t: Instant) -> Packet {
        let out = session.poll_transmit(t, true);
        match out.into_iter().next() {
            Some(Output::Transmit(pkt)) => pkt,
            other => panic!("expected a heartbeat transmit, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_order_delivery() {
        let mut session = Session::new(1, 0x1000, SessionConfig::default());
        establish(&mut session, 0x7000);
        let t = now();

        // "B" (seq 0x7002) arrives before "Aa" (seq 0x7000): a gap, so
        // nothing is delivered and our ack stays put.
        let poll = heartbeat(&mut session, t);
        let out = session.handle(msg_reply(&poll, 1, 0x7002, 0x1000, b"B"), t);
        assert!(out.is_empty());
        assert_eq!(session.their_seq, 0x7000);

        // The in-order bytes deliver.
        let poll = heartbeat(&mut session, t);
        let out = session.handle(msg_reply(&poll, 1, 0x7000, 0x1000, b"Aa"), t);
        assert_eq!(out, vec![Output::Deliver(Bytes::from_static(b"Aa"))]);
        assert_eq!(session.their_seq, 0x7002);

        // The retransmitted "B" now fits and delivers exactly once.
        let poll = heartbeat(&mut session, t);
        let out = session.handle(msg_reply(&poll, 1, 0x7002, 0x1000, b"B"), t);
        assert_eq!(out, vec![Output::Deliver(Bytes::from_static(b"B"))]);
        assert_eq!(session.their_seq, 0x7003);

        // A duplicate of already-received data is not re-delivered, but the
        // next poll still acknowledges the full stream.
        let poll = heartbeat(&mut session, t);
        let out = session.handle(msg_reply(&poll, 1, 0x7000, 0x1000, b"Aa"), t);
        assert!(out.is_empty());
        let poll = heartbeat(&mut session, t);
        match &poll.body {
            Body::Msg { ack, .. } => assert_eq!(*ack, 0x7003),
            other => panic!("expected MSG, got {:?}", other),
        }
    }

    #[test]
    fn test_graceful_close() {
        let mut session = Session::new(1, 0x1000, SessionConfig::default());
        establish(&mut session, 0x7000);
        let t = now();

        session.close("stdin closed");
        assert_eq!(session.state(), State::Shutdown);

        let fin = transmit(&mut session, t);
        match &fin.body {
            Body::Fin { reason } => assert_eq!(reason, "stdin closed"),
            other => panic!("expected FIN, got {:?}", other),
        }

        // FIN lost once: retransmitted identically.
        let later = t + DEFAULT_RTO;
        let out = session.poll_transmit(later, false);
        assert_eq!(out, vec![Output::Transmit(fin.clone())]);

        // Server answers with its own FIN.
        let reply = Packet {
            packet_id: fin.packet_id,
            session_id: 1,
            body: Body::Fin {
                reason: String::new(),
            },
        };
        let out = session.handle(reply, later);
        assert_eq!(
            out,
            vec![Output::Closed {
                reason: "stdin closed".to_string()
            }]
        );
        assert_eq!(session.state(), State::Closed);
    }

    #[test]
    fn test_remote_fin() {
        let mut session = Session::new(1, 0x1000, SessionConfig::default());
        establish(&mut session, 0x7000);
        let t = now();

        let fin = Packet {
            packet_id: 0x5555,
            session_id: 1,
            body: Body::Fin {
                reason: "server going away".to_string(),
            },
        };
        let out = session.handle(fin, t);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Output::RemoteClosed);
        assert!(matches!(out[1], Output::Transmit(ref p) if matches!(p.body, Body::Fin { .. })));
        assert_eq!(
            out[2],
            Output::Closed {
                reason: "server going away".to_string()
            }
        );
        assert_eq!(session.state(), State::Closed);
    }

    #[test]
    fn test_syn_while_established_is_protocol_error() {
        let mut session = Session::new(1, 0x1000, SessionConfig::default());
        establish(&mut session, 0x7000);

        let syn = Packet {
            packet_id: 0x9999,
            session_id: 1,
            body: Body::Syn {
                seq: 0x4444,
                options: 0,
                name: None,
                download: None,
            },
        };
        let out = session.handle(syn, now());
        assert!(matches!(out[0], Output::Transmit(ref p) if matches!(p.body, Body::Fin { .. })));
        assert_eq!(
            out[1],
            Output::Closed {
                reason: "unexpected SYN".to_string()
            }
        );
        assert_eq!(session.state(), State::Closed);
    }

    #[test]
    fn test_partial_ack_requeues_remainder() {
        let mut session = Session::new(1, 0x1000, SessionConfig::default());
        establish(&mut session, 0x7000);
        let t = now();

        session.queue(b"abcdef");
        let msg = transmit(&mut session, t);

        // Server acks only "abcd".
        let reply = msg_reply(&msg, 1, 0x7000, 0x1004, b"");
        session.handle(reply, t);
        assert_eq!(session.my_seq, 0x1004);
        assert_eq!(session.queued(), 2);
        assert!(!session.in_flight());

        // Remainder goes out re-sequenced from the new my_seq.
        let next = transmit(&mut session, t);
        match &next.body {
            Body::Msg { seq, data, .. } => {
                assert_eq!(*seq, 0x1004);
                assert_eq!(&data[..], b"ef");
            }
            other => panic!("expected MSG, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_reply_dropped() {
        let mut session = Session::new(1, 0x1000, SessionConfig::default());
        establish(&mut session, 0x7000);
        let t = now();

        session.queue(b"xy");
        let msg = transmit(&mut session, t);

        // Wrong packet id: dropped, nothing changes.
        let mut stale = msg_reply(&msg, 1, 0x7000, 0x1002, b"ZZ");
        stale.packet_id = msg.packet_id.wrapping_add(7);
        let out = session.handle(stale, t);
        assert!(out.is_empty());
        assert!(session.in_flight());
        assert_eq!(session.my_seq, 0x1000);

        // Ack for bytes we never sent: dropped.
        let bogus = msg_reply(&msg, 1, 0x7000, 0x1050, b"ZZ");
        let out = session.handle(bogus, t);
        assert!(out.is_empty());
        assert_eq!(session.my_seq, 0x1000);
    }

    #[test]
    fn test_wrong_session_id_dropped() {
        let mut session = Session::new(1, 0x1000, SessionConfig::default());
        establish(&mut session, 0x7000);
        let t = now();
        session.queue(b"xy");
        let msg = transmit(&mut session, t);

        let foreign = msg_reply(&msg, 2, 0x7000, 0x1002, b"AA");
        assert!(session.handle(foreign, t).is_empty());
        assert!(session.in_flight());
    }

    #[test]
    fn test_heartbeat_when_idle() {
        let mut session = Session::new(1, 0x1000, SessionConfig::default());
        establish(&mut session, 0x7000);
        let t = now();

        // Not a tick: no keepalive.
        assert!(session.poll_transmit(t, false).is_empty());

        // Tick: zero-length MSG.
        let out = session.poll_transmit(t, true);
        let pkt = match &out[0] {
            Output::Transmit(p) => p.clone(),
            other => panic!("expected transmit, got {:?}", other),
        };
        match &pkt.body {
            Body::Msg { seq, ack, data } => {
                assert_eq!(*seq, 0x1000);
                assert_eq!(*ack, 0x7000);
                assert!(data.is_empty());
            }
            other => panic!("expected MSG, got {:?}", other),
        }

        // Server reply with no progress discharges the heartbeat and may
        // carry fresh data.
        let reply = msg_reply(&pkt, 1, 0x7000, 0x1000, b"push");
        let out = session.handle(reply, t);
        assert_eq!(out, vec![Output::Deliver(Bytes::from_static(b"push"))]);
        assert!(!session.in_flight());
        assert_eq!(session.their_seq, 0x7004);
    }

    #[test]
    fn test_stop_and_wait_invariant() {
        let mut session = Session::new(1, 0, SessionConfig::default());
        establish(&mut session, 0);
        let t = now();

        session.queue(&[0x42; 500]);
        let first = transmit(&mut session, t);
        assert!(session.in_flight());

        // Nothing further goes out until the outstanding packet resolves,
        // no matter how often we poll.
        for _ in 0..5 {
            assert!(session.poll_transmit(t, true).is_empty());
        }

        let len = match &first.body {
            Body::Msg { data, .. } => data.len() as u16,
            _ => unreachable!(),
        };
        let reply = msg_reply(&first, 1, 0, len, b"");
        session.handle(reply, t);
        assert!(!session.in_flight());
        assert!(session.queued() > 0);

        // Now exactly one more may go out.
        let _second = transmit(&mut session, t);
        assert!(session.in_flight());
    }

    #[test]
    fn test_fragmentation_reassembly() {
        // A large write is split so no packet exceeds max_data, and the
        // concatenation of the sent slices equals the original.
        let config = SessionConfig {
            max_data: 100,
            ..Default::default()
        };
        let mut session = Session::new(1, 0, config);
        establish(&mut session, 0);
        let t = now();

        let original: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        session.queue(&original);

        let mut reassembled = Vec::new();
        let mut my_seq = 0u16;
        while session.queued() > 0 {
            let pkt = transmit(&mut session, t);
            let (seq, data) = match &pkt.body {
                Body::Msg { seq, data, .. } => (*seq, data.clone()),
                other => panic!("expected MSG, got {:?}", other),
            };
            assert_eq!(seq, my_seq);
            assert!(data.len() <= 100);
            reassembled.extend_from_slice(&data);
            my_seq = my_seq.wrapping_add(data.len() as u16);
            let reply = msg_reply(&pkt, 1, 0, my_seq, b"");
            session.handle(reply, t);
        }
        assert_eq!(reassembled, original);
    }

    #[test]
    fn test_chunked_download_flow() {
        let config = SessionConfig {
            download: Some("/etc/motd".to_string()),
            chunk: Some(2),
            ..Default::default()
        };
        let mut session = Session::new(1, 0, config);
        assert!(session.options() & OPT_DOWNLOAD != 0);
        assert!(session.options() & OPT_CHUNKED_DOWNLOAD != 0);
        establish(&mut session, 0);
        let t = now();

        // First request asks for the configured starting chunk.
        let req = transmit(&mut session, t);
        match &req.body {
            Body::ChunkedMsg { chunk, data } => {
                assert_eq!(*chunk, 2);
                assert!(data.is_empty());
            }
            other => panic!("expected chunk request, got {:?}", other),
        }

        // Chunk data is delivered and the next request advances.
        let reply = Packet {
            packet_id: req.packet_id,
            session_id: 1,
            body: Body::ChunkedMsg {
                chunk: 2,
                data: Bytes::from_static(b"chunk two"),
            },
        };
        let out = session.handle(reply, t);
        assert_eq!(out, vec![Output::Deliver(Bytes::from_static(b"chunk two"))]);

        let req = transmit(&mut session, t);
        match &req.body {
            Body::ChunkedMsg { chunk, .. } => assert_eq!(*chunk, 3),
            other => panic!("expected chunk request, got {:?}", other),
        }

        // An empty chunk ends the download and starts the shutdown.
        let reply = Packet {
            packet_id: req.packet_id,
            session_id: 1,
            body: Body::ChunkedMsg {
                chunk: 3,
                data: Bytes::new(),
            },
        };
        let out = session.handle(reply, t);
        assert_eq!(out, vec![Output::RemoteClosed]);
        assert_eq!(session.state(), State::Shutdown);
        let fin = transmit(&mut session, t);
        assert!(matches!(fin.body, Body::Fin { .. }));
    }
}
