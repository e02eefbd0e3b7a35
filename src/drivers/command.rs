//! Command-stream driver.
//!
//! The framed command sub-protocol rides the ordinary byte stream; framing
//! and dispatch live on the far side of it. Locally this driver moves the
//! frames between stdio and the tunnel exactly like the console driver
//! does. Its protocol-visible effect is the command option bit on the SYN,
//! which the front end sets when this driver is selected.

use super::{console, DriverHandle};
use crate::bus::Bus;

pub fn spawn(bus: Bus) -> DriverHandle {
    console::spawn(bus)
}
