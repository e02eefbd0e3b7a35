//! System resolver discovery.
//!
//! When no `--host` is given, the upstream resolver comes from the
//! platform's resolver configuration.

use std::net::IpAddr;

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// The first nameserver the OS is configured with, if any.
pub fn system_resolver() -> Option<IpAddr> {
    let contents = std::fs::read_to_string(RESOLV_CONF).ok()?;
    first_nameserver(&contents)
}

fn first_nameserver(contents: &str) -> Option<IpAddr> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| line.strip_prefix("nameserver"))
        .filter_map(|rest| rest.trim().parse().ok())
        .next()
}
