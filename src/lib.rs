//! dnsmole: a DNS tunnelling client.
//!
//! Establishes a reliable bidirectional byte stream with a tunnel server
//! that is reachable only through the recursive DNS hierarchy. Stream
//! bytes ride out as hex labels in query names and come back in answer
//! rdata (TXT, CNAME, MX, NS, A, or AAAA records), carried by a small
//! stop-and-wait protocol with one packet in flight per session.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   bus    ┌────────────────┐  packets  ┌────────────┐
//! │ input driver  │◀────────▶│ session engine │◀─────────▶│ DNS driver │
//! │ console/exec/ │ data_in/ │ (stop-and-wait │  SYN/MSG/ │ + codec    │
//! │ listener/...  │ data_out │  one in flight)│  FIN/PING │  UDP/53    │
//! └───────────────┘          └────────────────┘           └────────────┘
//! ```
//!
//! Everything runs on one reactor task ([`core::Core::run`]); drivers are
//! small pump tasks that only touch the world through the [`bus::Bus`].

pub mod bus;
pub mod carrier;
pub mod config;
pub mod core;
pub mod dns;
pub mod drivers;
pub mod resolver;
pub mod session;
pub mod tunnel;

pub use bus::{Bus, Event};
pub use config::ClientConfig;
pub use self::core::Core;
pub use dns::{DnsError, Message, Name, RecordType};
pub use drivers::{DnsDriver, InputDriver};
pub use session::{Session, SessionConfig};
pub use tunnel::Packet;

/// Crate-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// DNS codec failure
    #[error("DNS codec error: {0}")]
    Dns(#[from] dns::DnsError),

    /// Tunnel packet framing failure
    #[error("tunnel framing error: {0}")]
    Frame(#[from] tunnel::FrameError),

    /// Invalid configuration, fatal at startup
    #[error("{0}")]
    Config(String),

    /// A driver could not acquire its resources
    #[error("{0}")]
    Driver(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No `--host` given and the system resolver could not be determined
    #[error("couldn't determine the system DNS server; use --host to set one")]
    NoResolver,

    /// The retry budget ran out with data unacknowledged
    #[error("session force-closed: {0}")]
    ForceClosed(String),

    /// The ping probe got no echo
    #[error("ping timed out")]
    PingTimeout,
}
