//! Driver set.
//!
//! Exactly one input driver feeds the session from the local side, and the
//! DNS output driver carries it over the wire. Input drivers talk to the
//! rest of the process only through the bus: they publish `DataOut` and
//! `CloseSession`, and consume `DataIn` plus the session lifecycle events.

pub mod command;
pub mod console;
pub mod dns;
pub mod exec;
pub mod listener;
pub mod ping;

pub use dns::DnsDriver;
pub use ping::PingProbe;

use tokio::task::JoinHandle;

use crate::bus::Bus;
use crate::Error;

/// The configured input driver, exactly one per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputDriver {
    Console,
    Command,
    Exec { program: String },
    Listener { port: u16 },
    Ping,
}

impl InputDriver {
    /// Spawn the driver's I/O pump tasks. `Ping` has none: the core sends
    /// the probe itself.
    pub async fn spawn(&self, bus: &Bus) -> Result<DriverHandle, Error> {
        match self {
            InputDriver::Console => Ok(console::spawn(bus.clone())),
            InputDriver::Command => Ok(command::spawn(bus.clone())),
            InputDriver::Exec { program } => exec::spawn(bus.clone(), program.clone()),
            InputDriver::Listener { port } => listener::spawn(bus.clone(), *port).await,
            InputDriver::Ping => Ok(DriverHandle::default()),
        }
    }

    /// Whether the session speaks the framed command sub-protocol.
    pub fn wants_command_framing(&self) -> bool {
        matches!(self, InputDriver::Command)
    }
}

impl std::fmt::Display for InputDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputDriver::Console => write!(f, "console"),
            InputDriver::Command => write!(f, "command"),
            InputDriver::Exec { program } => write!(f, "exec {}", program),
            InputDriver::Listener { port } => write!(f, "listener on port {}", port),
            InputDriver::Ping => write!(f, "ping"),
        }
    }
}

/// Handles to a driver's pump tasks; dropped tasks are aborted at teardown.
#[derive(Default)]
pub struct DriverHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl DriverHandle {
    fn from_tasks(tasks: Vec<JoinHandle<()>>) -> Self {
        DriverHandle { tasks }
    }

    /// Tear the driver down. Pump tasks also exit on their own when they
    /// see `Shutdown` or `SessionClosed`; this is the backstop.
    pub fn destroy(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}
