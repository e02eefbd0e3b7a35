//! Reactor core.
//!
//! A single-threaded cooperative loop coupling the UDP socket, the timers,
//! and the message bus. Everything that mutates the session runs on this
//! one task, so no locking guards the protocol state. The loop suspends
//! only in its `select!`; handlers run to completion and never block.
//!
//! Timer branches: a 1 s heartbeat tick (also republished on the bus as
//! `Heartbeat`), and a retransmission sleep armed only while a packet is
//! in flight.

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;

use crate::bus::{Bus, Event};
use crate::config::ClientConfig;
use crate::drivers::{DnsDriver, PingProbe};
use crate::session::{Output, Session, SessionConfig, State, REASON_RETRY_LIMIT};
use crate::tunnel::{Body, Packet};
use crate::Error;

pub struct Core {
    bus: Bus,
    events: UnboundedReceiver<Event>,
    dns: DnsDriver,
    config: ClientConfig,
    ping_mode: bool,
    session: Option<Session>,
    ping: Option<PingProbe>,
    done: bool,
    failure: Option<Error>,
}

impl Core {
    /// Subscribes to the bus; construct before the first event is
    /// published so nothing is missed.
    pub fn new(bus: Bus, dns: DnsDriver, config: ClientConfig, ping_mode: bool) -> Self {
        let events = bus.subscribe();
        Core {
            bus,
            events,
            dns,
            config,
            ping_mode,
            session: None,
            ping: None,
            done: false,
            failure: None,
        }
    }

    /// Run until the session is closed, the ping resolves, or `Shutdown`
    /// is published.
    pub async fn run(&mut self) -> Result<(), Error> {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; 4096];

        while !self.done {
            let deadline = self.retransmit_deadline();
            let retransmit = async move {
                match deadline {
                    Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(Event::Shutdown) | None => break,
                        Some(event) => self.on_event(event).await?,
                    }
                }
                payload = self.dns.recv_packet(&mut buf) => {
                    if let Some(payload) = payload {
                        self.on_payload(&payload).await?;
                    }
                }
                _ = tick.tick() => {
                    self.bus.publish(Event::Heartbeat);
                    self.on_timer(true).await?;
                }
                _ = retransmit => {
                    self.on_timer(false).await?;
                }
            }
        }

        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn retransmit_deadline(&self) -> Option<Instant> {
        if let Some(probe) = &self.ping {
            return Some(probe.deadline());
        }
        self.session.as_ref().and_then(Session::deadline)
    }

    async fn on_event(&mut self, event: Event) -> Result<(), Error> {
        match event {
            Event::Start => self.on_start().await?,

            Event::DataOut { session_id, data } => {
                let outputs = match &mut self.session {
                    Some(s) if s.id() == session_id => {
                        s.queue(&data);
                        s.poll_transmit(Instant::now(), false)
                    }
                    _ => Vec::new(),
                };
                self.apply(outputs).await?;
            }

            Event::CloseSession { session_id } => {
                let outputs = match &mut self.session {
                    Some(s) if s.id() == session_id => {
                        s.close("local close");
                        s.poll_transmit(Instant::now(), false)
                    }
                    _ => Vec::new(),
                };
                self.apply(outputs).await?;
            }

            Event::ConfigString { key, value } => match key.as_str() {
                "name" => self.config.name = Some(value),
                "download" => self.config.download = Some(value),
                other => debug!("ignoring config string {}", other),
            },

            Event::ConfigInt { key, value } => match key.as_str() {
                "chunk" => self.config.chunk = Some(value),
                other => debug!("ignoring config int {}", other),
            },

            _ => {}
        }
        Ok(())
    }

    async fn on_start(&mut self) -> Result<(), Error> {
        let now = Instant::now();
        if self.ping_mode {
            let probe = PingProbe::new(now);
            info!(
                "pinging {} via {} (id {})",
                self.dns.domain(),
                self.config.server,
                probe.ping_id()
            );
            self.dns.send_packet(probe.packet()).await?;
            self.ping = Some(probe);
            return Ok(());
        }

        let session_config = SessionConfig {
            name: self.config.name.clone(),
            download: self.config.download.clone(),
            chunk: self.config.chunk,
            command: self.config.command,
            max_data: self.dns.max_data(),
            ..Default::default()
        };
        let mut session = Session::open(session_config);
        info!(
            "session {:04x} opening to {} via {}",
            session.id(),
            self.dns.domain(),
            self.config.server
        );
        self.bus.publish(Event::SessionCreated {
            session_id: session.id(),
        });
        let syn = session.start(now);
        self.session = Some(session);
        self.dns.send_packet(&syn).await?;
        Ok(())
    }

    async fn on_payload(&mut self, payload: &[u8]) -> Result<(), Error> {
        let options = self.session.as_ref().map(Session::options).unwrap_or(0);
        let packet = match Packet::decode(payload, options) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping malformed tunnel packet: {}", e);
                return Ok(());
            }
        };

        if self.ping_mode {
            if let Some(probe) = &self.ping {
                if probe.matches(&packet) {
                    info!("ping reply received: tunnel server is alive");
                    self.ping = None;
                    self.done = true;
                } else {
                    debug!("dropping packet that is not our ping echo");
                }
            }
            return Ok(());
        }

        let Some(session) = &mut self.session else {
            return Ok(());
        };

        if packet.session_id != session.id() {
            // A FIN for a session we do not know gets a FIN back;
            // everything else is dropped silently.
            if matches!(packet.body, Body::Fin { .. }) {
                let reply = Packet {
                    packet_id: packet.packet_id,
                    session_id: packet.session_id,
                    body: Body::Fin {
                        reason: "unknown session".to_string(),
                    },
                };
                self.dns.send_packet(&reply).await?;
            } else {
                debug!(
                    "dropping packet for unknown session {:04x}",
                    packet.session_id
                );
            }
            return Ok(());
        }

        let now = Instant::now();
        let mut outputs = session.handle(packet, now);
        // The exchange slot may have freed up; queued data goes out now.
        outputs.extend(session.poll_transmit(now, false));
        self.apply(outputs).await
    }

    /// Shared timer path: the heartbeat tick and the retransmission
    /// deadline both land here.
    async fn on_timer(&mut self, heartbeat: bool) -> Result<(), Error> {
        let now = Instant::now();

        if self.ping_mode {
            let resend = match &mut self.ping {
                Some(probe) => {
                    let packet = probe.poll_retransmit(now).cloned();
                    if packet.is_none() && probe.exhausted() {
                        error!("ping: no reply within the retry budget");
                        self.failure = Some(Error::PingTimeout);
                        self.done = true;
                    }
                    packet
                }
                None => None,
            };
            if let Some(packet) = resend {
                self.dns.send_packet(&packet).await?;
            }
            return Ok(());
        }

        let outputs = match &mut self.session {
            Some(s) => s.poll_transmit(now, heartbeat),
            None => Vec::new(),
        };
        self.apply(outputs).await
    }

    async fn apply(&mut self, outputs: Vec<Output>) -> Result<(), Error> {
        let session_id = self.session.as_ref().map(Session::id).unwrap_or(0);
        for output in outputs {
            match output {
                Output::Transmit(packet) => self.dns.send_packet(&packet).await?,
                Output::Deliver(data) => {
                    self.bus.publish(Event::DataIn { session_id, data });
                }
                Output::Established => info!("session {:04x} established", session_id),
                Output::RemoteClosed => debug!("server ended the stream"),
                Output::Closed { reason } => {
                    if reason == REASON_RETRY_LIMIT {
                        error!("FORCE-CLOSED session {:04x}: {}", session_id, reason);
                        self.failure = Some(Error::ForceClosed(reason.clone()));
                    } else {
                        warn!("session {:04x} closed: {}", session_id, reason);
                    }
                    self.bus.publish(Event::SessionClosed { session_id, reason });
                    self.done = true;
                }
            }
        }
        if let Some(session) = &self.session {
            if session.state() == State::Closed {
                self.done = true;
            }
        }
        Ok(())
    }
}
